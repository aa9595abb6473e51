pub mod ntp;
pub mod net;
pub mod clock;
pub mod error;
pub mod traits;
pub mod sync;
pub mod status;
pub mod config;
pub mod predictor;
pub mod profile;

pub use predictor::{cooldown_timestamp, CooldownRequest};
pub use status::{SyncState, SyncStatus};
pub use sync::TimeSyncClient;
