use crate::ntp::NTP_PORT;
use crate::predictor::SwapMode;
use crate::profile::ProfileTable;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub sync: SyncConfig,
    pub cooldown: CooldownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub servers: Vec<String>,        // tried in order, first success wins
    pub port: u16,
    pub attempts_per_server: u32,
    pub retry_delay_ms: u64,
    pub socket_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub buffer_ms: i64,              // added to every prediction, may be negative
    pub use_reduction: bool,         // drive expiry off the reduced duration
    pub profiles: ProfileTable,
    pub swap_mode: SwapMode,
    pub lap_buffer_secs: i64,        // added to the course lap time
    pub custom_lap_secs: Option<i64>, // replaces course time and buffer when set
    pub use_shortcut: bool,          // course shortcut lap time is available
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            servers: vec![
                "pool.ntp.org".to_string(),
                "time.google.com".to_string(),
                "time.cloudflare.com".to_string(),
            ],
            port: NTP_PORT,
            attempts_per_server: 3,
            retry_delay_ms: 2_000,
            socket_timeout_ms: 5_000,
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        CooldownConfig {
            buffer_ms: 0,
            use_reduction: false,
            profiles: ProfileTable::default(),
            swap_mode: SwapMode::Off,
            lap_buffer_secs: 2,
            custom_lap_secs: None,
            use_shortcut: false,
        }
    }
}

impl SyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

impl SystemConfig {
    /// Load a JSON config file. Fields left out keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}
