//! Generic timestamped data wrapper.

use serde::{Deserialize, Serialize};

/// Data paired with a microsecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    /// The wrapped data.
    pub data: T,
    /// Timestamp in microseconds.
    pub timestamp_us: u64,
}

impl<T> Timestamped<T> {
    /// Create a new timestamped value.
    #[inline]
    pub fn new(data: T, timestamp_us: u64) -> Self {
        Self { data, timestamp_us }
    }

    /// Timestamp in seconds.
    #[inline]
    pub fn secs(&self) -> f64 {
        self.timestamp_us as f64 * 1e-6
    }

    /// Map the wrapped data, keeping the timestamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timestamped<U> {
        Timestamped {
            data: f(self.data),
            timestamp_us: self.timestamp_us,
        }
    }
}

/// Convert a microsecond stamp to seconds.
#[inline]
pub(crate) fn us_to_secs(timestamp_us: u64) -> f64 {
    timestamp_us as f64 * 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_conversion() {
        let t = Timestamped::new((), 1_500_000);
        assert_eq!(t.secs(), 1.5);
    }
}
