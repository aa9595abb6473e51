use crate::error::Result;
use crate::ntp::NTP_PACKET_SIZE;
use crate::status::SyncState;

/// One request/reply exchange with a named time server.
#[cfg_attr(test, mockall::automock)]
pub trait NtpTransport {
    /// Send `request` to `server` and return the raw reply bytes.
    /// The reply may be shorter than a full packet; the caller validates it.
    fn exchange(&self, server: &str, request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>>;
}

/// Read side of a time sync client, as seen by cooldown consumers.
#[cfg_attr(test, mockall::automock)]
pub trait OffsetSource {
    fn sync_state(&self) -> SyncState;

    /// Reference minus local, in ms. 0 means "no correction".
    fn clock_offset_millis(&self) -> i64;
}
