use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use serde_json::Value;

use crate::error::{SessionError, SessionResult};
use crate::models::{PackageInfo, Side};

/// Items viewers can buy for a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    ShieldMove,
    ChronoChip,
    FreezeEnemyClock,
    PieceSwap,
    DoubleMove,
    PieceEmpower,
    /// Shown on the monitor, no effect on the game.
    Other(String),
}

impl ItemKind {
    pub fn from_name(name: &str) -> ItemKind {
        match name.trim().to_ascii_lowercase().as_str() {
            "shield move" => ItemKind::ShieldMove,
            "chrono chip" => ItemKind::ChronoChip,
            "freeze enemy clock" => ItemKind::FreezeEnemyClock,
            "piece swap" => ItemKind::PieceSwap,
            "double move" => ItemKind::DoubleMove,
            "piece empower" => ItemKind::PieceEmpower,
            _ => ItemKind::Other(name.to_string()),
        }
    }
}

/// A viewer-economy notification, already validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ArenaEvent {
    CountdownStarted,
    CountdownUpdate { seconds_remaining: u32 },
    ArenaBegins,
    PlayerBoost {
        booster_name: String,
        amount: u64,
        /// Seat named in the payload; the creator's seat when absent.
        beneficiary: Option<Side>,
    },
    /// `None` when no player had an eligible package.
    PackageDrop(Option<PackageInfo>),
    ItemDrop {
        item: ItemKind,
        item_name: String,
        target: Side,
        purchaser: String,
        cost: u64,
    },
    GameCompleted,
    GameStopped,
}

impl ArenaEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ArenaEvent::CountdownStarted => "countdown_started",
            ArenaEvent::CountdownUpdate { .. } => "countdown_update",
            ArenaEvent::ArenaBegins => "arena_begins",
            ArenaEvent::PlayerBoost { .. } => "player_boost_activated",
            ArenaEvent::PackageDrop(_) => "package_drop",
            ArenaEvent::ItemDrop { .. } => "immediate_item_drop",
            ArenaEvent::GameCompleted => "game_completed",
            ArenaEvent::GameStopped => "game_stopped",
        }
    }
}

/// An event plus the fingerprint used to drop redeliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaEnvelope {
    pub fingerprint: String,
    pub event: ArenaEvent,
}

fn malformed(name: &str, what: &str) -> SessionError {
    SessionError::MalformedRemotePayload(format!("{name}: {what}"))
}

fn text<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

/// Numbers arrive either as JSON numbers or numeric strings.
fn number(payload: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn move_count_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(\d+)x?\s*moves?").ok())
        .as_ref()
}

/// Pulls the "3" out of package names such as "3x moves" or "2 Moves".
pub fn parse_move_count(package_name: &str) -> u32 {
    move_count_pattern()
        .and_then(|pattern| pattern.captures(package_name))
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

fn parse_package(payload: &Value) -> Option<PackageInfo> {
    let drops = payload.get("playerPackageDrops")?.as_array()?;
    let (player, package) = drops.iter().find_map(|player| {
        let first = player.get("eligiblePackages")?.as_array()?.first()?;
        Some((player, first))
    })?;
    let package_name = text(package, &["name"]).unwrap_or("Unknown Package").to_string();
    Some(PackageInfo {
        move_count: parse_move_count(&package_name),
        package_name,
        player_name: text(player, &["playerName"]).unwrap_or("Unknown").to_string(),
        cost: number(package, &["cost"]).unwrap_or(0),
    })
}

fn item_name(payload: &Value) -> Option<&str> {
    payload
        .get("item")
        .and_then(|item| text(item, &["name"]))
        .or_else(|| payload.get("package").and_then(|package| text(package, &["name"])))
        .or_else(|| text(payload, &["itemName", "name"]))
}

/// Validates a named arena notification.
pub fn parse_event(name: &str, payload: &Value) -> SessionResult<ArenaEnvelope> {
    let event = match name {
        "countdown_started" | "arena_countdown_started" => ArenaEvent::CountdownStarted,
        "countdown_update" => {
            let seconds = number(payload, &["secondsRemaining"])
                .ok_or_else(|| malformed(name, "missing secondsRemaining"))?;
            ArenaEvent::CountdownUpdate {
                seconds_remaining: u32::try_from(seconds).unwrap_or(u32::MAX),
            }
        }
        "arena_begins" => ArenaEvent::ArenaBegins,
        "player_boost_activated" => {
            let amount = number(payload, &["boostAmount", "amount", "currentCyclePoints"])
                .ok_or_else(|| malformed(name, "missing boost amount"))?;
            let booster_name = text(payload, &["boosterUsername", "boosterName", "playerName"])
                .unwrap_or("Viewer")
                .to_string();
            let beneficiary = text(payload, &["targetPlayerName", "playerName"]).and_then(Side::parse);
            ArenaEvent::PlayerBoost {
                booster_name,
                amount,
                beneficiary,
            }
        }
        "package_drop" => ArenaEvent::PackageDrop(parse_package(payload)),
        "immediate_item_drop" => {
            let item_name = item_name(payload).ok_or_else(|| malformed(name, "missing item name"))?;
            let target_name = text(payload, &["targetPlayerName"])
                .ok_or_else(|| malformed(name, "missing targetPlayerName"))?;
            let target = Side::parse(target_name)
                .ok_or_else(|| malformed(name, &format!("unknown target {target_name}")))?;
            let cost = number(payload, &["cost"])
                .or_else(|| payload.get("package").and_then(|p| number(p, &["cost"])))
                .or_else(|| payload.get("item").and_then(|i| number(i, &["cost"])))
                .unwrap_or(0);
            ArenaEvent::ItemDrop {
                item: ItemKind::from_name(item_name),
                item_name: item_name.to_string(),
                target,
                purchaser: text(payload, &["purchaserUsername", "purchaserName"])
                    .unwrap_or("Unknown")
                    .to_string(),
                cost,
            }
        }
        "game_completed" => ArenaEvent::GameCompleted,
        "game_stopped" => ArenaEvent::GameStopped,
        other => return Err(malformed(other, "unknown event")),
    };

    let fingerprint = match text(payload, &["eventId", "id"]) {
        Some(id) => format!("{}:{}", event.kind(), id),
        None => format!("{}:{}", event.kind(), payload),
    };
    debug!("parsed arena event {}", fingerprint);
    Ok(ArenaEnvelope { fingerprint, event })
}
