//! Error taxonomy for the SLAM back-end.
//!
//! Per-sample and per-scan errors are values that never abort the stream;
//! only configuration errors are fatal. [`WarnThrottle`] enforces the
//! one-warning-per-kind-per-second logging policy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors produced by the SLAM core.
#[derive(Debug, Clone, Error)]
pub enum SlamError {
    /// Timestamp monotonicity violated; the offending sample is dropped.
    #[error("out-of-order {what}: stamp {stamp_us} µs is not after {last_us} µs")]
    OutOfOrder {
        what: &'static str,
        stamp_us: u64,
        last_us: u64,
    },

    /// Requested integration or query before the required data has arrived.
    #[error("not ready: {context}")]
    NotReady { context: &'static str },

    /// Insufficient correspondences, views, or parallax.
    #[error("underconstrained: {context} ({have} available, {need} required)")]
    Underconstrained {
        context: &'static str,
        have: usize,
        need: usize,
    },

    /// Matcher result violates the configured outlier thresholds.
    #[error(
        "outlier match: translation residual {translation_m:.3} m, rotation residual {rotation_rad:.4} rad"
    )]
    Outlier {
        translation_m: f64,
        rotation_rad: f64,
    },

    /// Matcher reported non-convergence.
    #[error("matcher failure: {context}")]
    MatcherFailure { context: String },

    /// Missing or malformed configuration. Fatal.
    #[error("invalid configuration: {context}")]
    ConfigInvalid { context: String },

    /// Requested frame-to-frame transform unavailable.
    #[error("extrinsics missing between '{from}' and '{to}'")]
    ExtrinsicsMissing { from: String, to: String },

    /// A duplicate stamp was fed to a front-end.
    #[error("duplicate stamp {stamp_us} µs")]
    DuplicateStamp { stamp_us: u64 },
}

/// Coarse error kind, used for counters and throttled logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OutOfOrder,
    NotReady,
    Underconstrained,
    Outlier,
    MatcherFailure,
    ConfigInvalid,
    ExtrinsicsMissing,
    DuplicateStamp,
}

impl SlamError {
    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SlamError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            SlamError::NotReady { .. } => ErrorKind::NotReady,
            SlamError::Underconstrained { .. } => ErrorKind::Underconstrained,
            SlamError::Outlier { .. } => ErrorKind::Outlier,
            SlamError::MatcherFailure { .. } => ErrorKind::MatcherFailure,
            SlamError::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            SlamError::ExtrinsicsMissing { .. } => ErrorKind::ExtrinsicsMissing,
            SlamError::DuplicateStamp { .. } => ErrorKind::DuplicateStamp,
        }
    }

    /// Whether this error should abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SlamError::ConfigInvalid { .. })
    }
}

/// Rate limiter emitting at most one warning per error kind per window.
pub struct WarnThrottle {
    window: Duration,
    last_emitted: HashMap<ErrorKind, Instant>,
    /// Count of errors seen per kind, including suppressed ones.
    counts: HashMap<ErrorKind, u64>,
}

impl Default for WarnThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl WarnThrottle {
    /// Create a throttle with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    /// Record an error, logging a warning unless one of the same kind was
    /// logged within the window.
    pub fn warn(&mut self, error: &SlamError) {
        let kind = error.kind();
        *self.counts.entry(kind).or_insert(0) += 1;

        let now = Instant::now();
        let emit = match self.last_emitted.get(&kind) {
            Some(last) => now.duration_since(*last) >= self.window,
            None => true,
        };
        if emit {
            self.last_emitted.insert(kind, now);
            log::warn!("{} (total {:?}: {})", error, kind, self.counts[&kind]);
        }
    }

    /// Errors seen for a kind, including suppressed ones.
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}
