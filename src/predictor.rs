//! Cooldown expiry prediction.
//!
//! Maps a locally observed event time to the local instant at which a
//! fixed-length, server-side cooldown runs out. The server resets cooldowns
//! on a coarse grid (a minute boundary), so the event is first moved into
//! the reference clock frame, floored to that grid, extended, then moved
//! back and corrected for one-way latency.
//!
//! Everything here is a pure function of its inputs. The caller reads the
//! current clock offset and latency sample before calling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Latency value meaning "no sample available".
pub const NO_LATENCY: i64 = -1;

/// Inputs for one prediction. All values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CooldownRequest {
    /// Local Unix ms of the triggering event; 0 = nothing tracked
    pub raw_event_millis: i64,
    pub duration_millis: i64,
    /// Server reset grid; 0 or negative disables flooring
    pub quantization_millis: i64,
    /// Reference minus local
    pub clock_offset_millis: i64,
    /// One-way estimate; negative = unknown
    pub latency_millis: i64,
    /// Extra margin, may be negative
    pub buffer_millis: i64,
    pub reduction_millis: i64,
    pub apply_reduction: bool,
}

/// Predicted local Unix ms at which the cooldown expires.
///
/// Returns 0 when `raw_event_millis` is 0. Otherwise the result is never
/// earlier than `raw_event_millis`. Arithmetic saturates, so every input
/// has a defined answer.
pub fn cooldown_timestamp(request: &CooldownRequest) -> i64 {
    let raw = request.raw_event_millis;
    if raw == 0 {
        return 0;
    }
    let offset = request.clock_offset_millis;

    let reference = raw.saturating_add(offset);
    let truncated = floor_to_grid(reference, request.quantization_millis);

    let mut expiry = truncated
        .saturating_add(request.duration_millis)
        .saturating_add(request.buffer_millis);
    if request.apply_reduction {
        expiry = expiry.saturating_sub(request.reduction_millis);
    }

    let mut local = expiry.saturating_sub(offset);
    if request.latency_millis >= 0 {
        local = local.saturating_sub(request.latency_millis);
    }

    local.max(raw)
}

/// Largest multiple of `grid` not above `millis`.
fn floor_to_grid(millis: i64, grid: i64) -> i64 {
    if grid <= 0 {
        return millis;
    }
    millis.saturating_sub(millis.rem_euclid(grid))
}

/// One-way latency from a measured round trip, or `NO_LATENCY` if there is
/// no usable sample.
pub fn one_way_latency(round_trip_millis: i64) -> i64 {
    if round_trip_millis > 0 {
        round_trip_millis / 2
    } else {
        NO_LATENCY
    }
}

/// Whole seconds until `cooldown_millis`, rounded up, never negative.
pub fn seconds_left(cooldown_millis: i64, now_millis: i64) -> i64 {
    let millis_left = cooldown_millis.saturating_sub(now_millis).max(0);
    millis_left / 1_000 + i64::from(millis_left % 1_000 != 0)
}

/// True once `now_millis` has reached a tracked cooldown.
pub fn is_expired(cooldown_millis: i64, now_millis: i64) -> bool {
    cooldown_millis != 0 && now_millis >= cooldown_millis
}

/// When the final obstacle of a lap should be pushed down the menu.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwapMode {
    /// Never
    #[default]
    Off,
    /// Only when the cooldown outlasts what is left of a lap
    NearEnd,
    /// Whenever a cooldown is active
    Always,
}

impl fmt::Display for SwapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapMode::Off => "off",
            SwapMode::NearEnd => "near_end",
            SwapMode::Always => "always",
        };
        f.write_str(name)
    }
}

impl FromStr for SwapMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "off" => Ok(SwapMode::Off),
            "near_end" => Ok(SwapMode::NearEnd),
            "always" => Ok(SwapMode::Always),
            other => Err(format!(
                "unknown swap mode '{}' (expected off, near_end or always)",
                other
            )),
        }
    }
}

/// Seconds a lap is expected to take.
///
/// A custom lap time replaces the course time outright and ignores the
/// buffer. Negative results clamp to 0.
pub fn lap_threshold_secs(
    optimal_lap_secs: i64,
    custom_lap_secs: Option<i64>,
    lap_buffer_secs: i64,
) -> i64 {
    match custom_lap_secs {
        Some(custom) => custom.max(0),
        None => optimal_lap_secs.saturating_add(lap_buffer_secs).max(0),
    }
}

/// Whether to deprioritize the last obstacle while `cooldown_millis` runs.
///
/// Never once the cooldown is over (or untracked). In `NearEnd` mode only
/// when fewer whole seconds remain than a lap takes, so the next lap would
/// finish after the cooldown.
pub fn should_deprioritize(
    cooldown_millis: i64,
    now_millis: i64,
    threshold_secs: i64,
    mode: SwapMode,
) -> bool {
    let millis_left = cooldown_millis.saturating_sub(now_millis);
    if millis_left <= 0 {
        return false;
    }
    match mode {
        SwapMode::Off => false,
        SwapMode::Always => true,
        SwapMode::NearEnd => millis_left / 1_000 < threshold_secs,
    }
}
