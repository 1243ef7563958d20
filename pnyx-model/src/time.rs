//! Wall-clock timestamps for query deadlines.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Absolute wall-clock instant as seconds + nanoseconds since the Unix epoch.
///
/// The zero timestamp is in the distant past, so a query whose deadline was
/// never set is always expired.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default,
    serde::Serialize, serde::Deserialize,
    borsh::BorshSerialize, borsh::BorshDeserialize,
)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { seconds: 0, nanos: 0 };

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                seconds: d.as_secs() as i64,
                nanos: d.subsec_nanos() as i32,
            },
            // Pre-epoch times clamp to zero.
            Err(_) => Timestamp::ZERO,
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.seconds < 0 {
            return UNIX_EPOCH;
        }
        UNIX_EPOCH + Duration::new(self.seconds as u64, self.nanos.max(0) as u32)
    }

    /// Timestamp `d` in the future of the current time.
    pub fn after(d: Duration) -> Self {
        Self::from_system_time(SystemTime::now() + d)
    }

    /// True if this instant is at least `d` in the past.
    pub fn elapsed_since(self, d: Duration) -> bool {
        let limit = SystemTime::now() - d;
        self.to_system_time() <= limit
    }

    /// Remaining duration until this instant; `None` once reached.
    pub fn remaining(self) -> Option<Duration> {
        self.to_system_time().duration_since(SystemTime::now()).ok()
    }
}
