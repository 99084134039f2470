use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::models::DEFAULT_TIME_LIMIT;

/// Length of the local piece-swap animation.
pub const SWAP_ANIMATION_MS: u64 = 1500;
/// Search depth asked of the evaluator when a hint is requested.
pub const HINT_DEPTH: u8 = 2;

/// Command line and environment configuration of the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "arena-relay", about = "Shared session store and change feed for arena chess")]
pub struct RelayConfig {
    /// Interface to bind
    #[arg(long, env = "ARENA_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "ARENA_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Seconds per side for games created without a limit
    #[arg(long, env = "ARENA_DEFAULT_TIME_LIMIT", default_value_t = DEFAULT_TIME_LIMIT)]
    pub default_time_limit: u32,

    /// Piece swap animation length handed to clients, in milliseconds
    #[arg(long, env = "ARENA_SWAP_ANIMATION_MS", default_value_t = SWAP_ANIMATION_MS)]
    pub swap_animation_ms: u64,
}

impl RelayConfig {
    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    /// Defaults the relay serves to clients at `GET /config`.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            swap_animation: Duration::from_millis(self.swap_animation_ms),
            ..SessionConfig::default()
        }
    }
}

/// Settings of one client-side session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub swap_animation: Duration,
    pub hint_depth: u8,
    /// Mirror snapshots here when set.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            swap_animation: Duration::from_millis(SWAP_ANIMATION_MS),
            hint_depth: HINT_DEPTH,
            snapshot_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags() {
        let config = RelayConfig::try_parse_from(["arena-relay"]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.default_time_limit, DEFAULT_TIME_LIMIT);
        assert_eq!(config.session_config().swap_animation, Duration::from_millis(1500));
    }

    #[test]
    fn flags_override_defaults() {
        let config = RelayConfig::try_parse_from([
            "arena-relay",
            "--port",
            "9000",
            "--swap-animation-ms",
            "10",
        ])
        .unwrap();
        assert_eq!(config.bind_address(), ("127.0.0.1".to_string(), 9000));
        let session = config.session_config();
        assert_eq!(session.snapshot_dir, None);
        assert_eq!(session.swap_animation, Duration::from_millis(10));
    }
}
