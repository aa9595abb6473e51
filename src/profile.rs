//! Per-kind cooldown parameters.
//!
//! Kinds (courses, abilities, ...) differ only in numbers, so they live in a
//! table keyed by a stable name instead of in branches. The caller resolves
//! the kind, then hands the predictor plain values.

use crate::predictor::{self, CooldownRequest};
use crate::traits::OffsetSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_KIND: &str = "default";

const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownProfile {
    pub duration_ms: i64,
    pub quantization_ms: i64,
    /// Taken off the duration when the caller asks for the reduced timer
    #[serde(default)]
    pub reduction_ms: i64,
    /// Optimal lap time in seconds; 0 when unknown
    #[serde(default)]
    pub lap_secs: i64,
    /// Lap time when the course shortcut is available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut_lap_secs: Option<i64>,
}

impl CooldownProfile {
    pub const fn new(duration_ms: i64, quantization_ms: i64, reduction_ms: i64) -> Self {
        CooldownProfile {
            duration_ms,
            quantization_ms,
            reduction_ms,
            lap_secs: 0,
            shortcut_lap_secs: None,
        }
    }

    pub const fn with_lap(mut self, lap_secs: i64, shortcut_lap_secs: Option<i64>) -> Self {
        self.lap_secs = lap_secs;
        self.shortcut_lap_secs = shortcut_lap_secs;
        self
    }

    pub fn optimal_lap_secs(&self, use_shortcut: bool) -> i64 {
        match self.shortcut_lap_secs {
            Some(shortcut) if use_shortcut => shortcut,
            _ => self.lap_secs,
        }
    }

    /// Seconds below which the last obstacle gets deprioritized.
    pub fn lap_threshold_secs(
        &self,
        use_shortcut: bool,
        custom_lap_secs: Option<i64>,
        lap_buffer_secs: i64,
    ) -> i64 {
        predictor::lap_threshold_secs(
            self.optimal_lap_secs(use_shortcut),
            custom_lap_secs,
            lap_buffer_secs,
        )
    }

    /// Build a prediction request for an event seen at `raw_event_millis`.
    ///
    /// `apply_reduction` is passed per call: a state transition and a purely
    /// informational display may legitimately disagree on it.
    pub fn request(
        &self,
        raw_event_millis: i64,
        clock_offset_millis: i64,
        latency_millis: i64,
        buffer_millis: i64,
        apply_reduction: bool,
    ) -> CooldownRequest {
        CooldownRequest {
            raw_event_millis,
            duration_millis: self.duration_ms,
            quantization_millis: self.quantization_ms,
            clock_offset_millis,
            latency_millis,
            buffer_millis,
            reduction_millis: self.reduction_ms,
            apply_reduction,
        }
    }

    /// Same as [`request`](Self::request), with the offset read from a live
    /// sync client. Never waits for a sync in progress.
    pub fn request_from(
        &self,
        source: &dyn OffsetSource,
        raw_event_millis: i64,
        latency_millis: i64,
        buffer_millis: i64,
        apply_reduction: bool,
    ) -> CooldownRequest {
        self.request(
            raw_event_millis,
            source.clock_offset_millis(),
            latency_millis,
            buffer_millis,
            apply_reduction,
        )
    }
}

/// Profiles keyed by kind name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileTable(BTreeMap<String, CooldownProfile>);

impl ProfileTable {
    pub fn empty() -> Self {
        ProfileTable(BTreeMap::new())
    }

    pub fn insert(&mut self, kind: impl Into<String>, profile: CooldownProfile) {
        self.0.insert(kind.into(), profile);
    }

    pub fn resolve(&self, kind: &str) -> Option<&CooldownProfile> {
        self.0.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl Default for ProfileTable {
    /// Three-minute cooldown reset on the minute grid. The `ardougne` kind
    /// can come back a minute early. Courses with a known lap time carry it.
    fn default() -> Self {
        let standard = CooldownProfile::new(3 * MINUTE_MS, MINUTE_MS, 0);
        let mut table = ProfileTable::empty();
        table.insert(DEFAULT_KIND, standard);
        table.insert(
            "ardougne",
            CooldownProfile::new(3 * MINUTE_MS, MINUTE_MS, MINUTE_MS),
        );
        table.insert("barbarian", standard.with_lap(32, None));
        table.insert("canifis", standard.with_lap(44, None));
        table.insert("seers", standard.with_lap(44, Some(38)));
        table
    }
}
