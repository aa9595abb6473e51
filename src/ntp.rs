//! Minimal SNTP client codec and UDP transport.
//!
//! Only the parts of the RFC 4330 packet a one-shot offset query needs are
//! handled: the client header byte on the way out and the transmit
//! timestamp on the way back. Everything else in the reply is ignored.

use crate::error::{Result, SyncError};
use crate::net;
use crate::traits::NtpTransport;
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use std::io::Cursor;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

// ============================================================================
// NTP PROTOCOL CONSTANTS
// ============================================================================

/// NTP packet size (48 bytes)
pub const NTP_PACKET_SIZE: usize = 48;

/// Well-known NTP port
pub const NTP_PORT: u16 = 123;

/// Byte offset of the transmit timestamp in a server reply
pub const TRANSMIT_TIMESTAMP_OFFSET: usize = 40;

/// NTP epoch offset from Unix epoch (1900-01-01 to 1970-01-01 in seconds)
pub const NTP_EPOCH_OFFSET: i64 = 2_208_988_800;

/// LI (Leap Indicator): 0 = no warning
const LI_NO_WARNING: u8 = 0;

/// Version 3 is understood by every public pool server
const VERSION_3: u8 = 3;

/// Mode: 3 = client
const MODE_CLIENT: u8 = 3;

const MILLIS_PER_SECOND: i64 = 1_000;

/// Length of one 32-bit seconds era (2^32 s) in milliseconds
pub const CYCLE_MILLIS: i64 = (1i64 << 32) * MILLIS_PER_SECOND;

/// Largest offset magnitude that is not treated as an era rollover
pub const HALF_CYCLE_MILLIS: i64 = CYCLE_MILLIS / 2;

// ============================================================================
// CODEC
// ============================================================================

/// Build a client request: all zero except the LI/VN/Mode byte (0x1B).
pub fn build_request() -> [u8; NTP_PACKET_SIZE] {
    let mut request = [0u8; NTP_PACKET_SIZE];
    request[0] = (LI_NO_WARNING << 6) | (VERSION_3 << 3) | MODE_CLIENT;
    request
}

/// Decode the 64-bit NTP timestamp at `offset` into milliseconds since 1900.
///
/// `seconds * 1000 + (fraction * 1000) >> 32`; the fraction is truncated,
/// never rounded.
pub fn read_timestamp_millis(buf: &[u8], offset: usize) -> Result<i64> {
    let field = buf
        .get(offset..offset.saturating_add(8))
        .ok_or(SyncError::ShortReply { len: buf.len() })?;
    let mut rdr = Cursor::new(field);
    let seconds = rdr.read_u32::<BigEndian>()? as i64;
    let fraction = rdr.read_u32::<BigEndian>()? as i64;

    Ok(seconds * MILLIS_PER_SECOND + ((fraction * MILLIS_PER_SECOND) >> 32))
}

/// Parse a server reply and return its transmit time in ms since 1900.
pub fn parse_reply(buf: &[u8]) -> Result<i64> {
    if buf.len() < NTP_PACKET_SIZE {
        return Err(SyncError::ShortReply { len: buf.len() });
    }
    let server_millis = read_timestamp_millis(buf, TRANSMIT_TIMESTAMP_OFFSET)?;
    if server_millis == 0 {
        return Err(SyncError::ZeroTimestamp);
    }
    Ok(server_millis)
}

/// Fold a raw server-minus-local difference back into one 2^32 s era.
///
/// Differences within half a cycle pass through untouched. Anything larger
/// means one side sits in a different era (the 2036 rollover) and is shifted
/// by whole cycles until it lands in `(-HALF_CYCLE_MILLIS, HALF_CYCLE_MILLIS]`.
pub fn normalize_rollover(difference: i64) -> i64 {
    if difference.unsigned_abs() <= HALF_CYCLE_MILLIS as u64 {
        return difference;
    }
    let folded = difference.rem_euclid(CYCLE_MILLIS);
    if folded > HALF_CYCLE_MILLIS {
        folded - CYCLE_MILLIS
    } else {
        folded
    }
}

/// Offset of the reference clock relative to the local clock, in ms.
///
/// `server_millis` is the decoded transmit timestamp (1900 epoch),
/// `local_now_millis` the local Unix time at receipt. Half the round trip is
/// taken off as the one-way delay.
pub fn compute_offset(server_millis: i64, local_now_millis: i64, round_trip_millis: i64) -> i64 {
    let local_epoch_millis =
        local_now_millis.saturating_add(NTP_EPOCH_OFFSET * MILLIS_PER_SECOND);
    let difference = normalize_rollover(server_millis.saturating_sub(local_epoch_millis));
    let network_delay = round_trip_millis.max(0) / 2;
    difference - network_delay
}

// ============================================================================
// UDP TRANSPORT
// ============================================================================

/// Sends one request per exchange over a fresh UDP socket.
///
/// The socket is connected to the resolved server, so the kernel drops
/// datagrams from any other source and a single read timeout bounds the
/// whole exchange.
pub struct UdpTransport {
    port: u16,
    timeout: Duration,
}

impl UdpTransport {
    pub fn new(port: u16, timeout: Duration) -> Self {
        UdpTransport { port, timeout }
    }

    fn resolve(&self, server: &str) -> Result<SocketAddr> {
        let all: Vec<SocketAddr> = (server, self.port)
            .to_socket_addrs()
            .map_err(|_| SyncError::Resolve(server.to_string()))?
            .collect();
        // Prefer IPv4: plenty of home networks have broken v6 routes.
        all.iter()
            .find(|a| a.is_ipv4())
            .or_else(|| all.first())
            .copied()
            .ok_or_else(|| SyncError::Resolve(server.to_string()))
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        UdpTransport::new(NTP_PORT, Duration::from_secs(5))
    }
}

impl NtpTransport for UdpTransport {
    fn exchange(&self, server: &str, request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>> {
        let addr = self.resolve(server)?;
        let socket = net::create_client_socket(&addr, self.timeout)?;

        socket.connect(addr)?;
        socket.send(request)?;

        let mut buf = [0u8; NTP_PACKET_SIZE];
        let size = socket.recv(&mut buf)?;
        debug!("[NTP-Client] {} bytes from {} ({})", size, server, addr);
        Ok(buf[..size].to_vec())
    }
}

// ============================================================================
// TESTS
// ============================================================================
