//! Time types used by the tracker.
//!
//! The tracker never reads a system clock. Callers pass the current time
//! into every event, which makes runs fully reproducible and lets tests
//! control the clock.

/// A point in time, in microseconds since an arbitrary epoch.
///
/// Expected to be monotonic within a run, though callers may pass a time
/// earlier than one previously supplied; the tracker tolerates this.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Hash, Default)]
pub struct LocalTime {
    micros: i64,
}

impl LocalTime {
    /// The earliest representable time.
    pub const MIN: LocalTime = LocalTime { micros: i64::MIN };
    /// The latest representable time.
    pub const MAX: LocalTime = LocalTime { micros: i64::MAX };

    /// Construct a time from microseconds since the epoch.
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Construct a time from whole seconds since the epoch.
    pub const fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    /// The number of microseconds since the epoch.
    pub const fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Elapse time.
    ///
    /// Adds the given duration to the time. The duration may be negative.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.micros = self.micros.saturating_add(duration.as_micros())
    }
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.micros)
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.micros.saturating_sub(other.micros))
    }
}

/// Substract a duration from a local time. Yields a local time.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            micros: self.micros.saturating_sub(other.0),
        }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            micros: self.micros.saturating_add(other.0),
        }
    }
}

/// A span of time, in microseconds. May be negative.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub struct LocalDuration(i64);

impl LocalDuration {
    /// Construct a new duration from microseconds.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: i64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Return the number of microseconds in this duration.
    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    /// Return the number of whole seconds in this duration.
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let magnitude = self.0.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };

        if magnitude < 1_000 {
            write!(f, "{}{} microsecond(s)", sign, magnitude)
        } else if magnitude < 1_000_000 {
            write!(f, "{}{} millisecond(s)", sign, magnitude / 1_000)
        } else if magnitude < 60_000_000 {
            write!(f, "{}{:.3} second(s)", sign, magnitude as f64 / 1_000_000.)
        } else {
            write!(f, "{}{:.2} minute(s)", sign, magnitude as f64 / 60_000_000.)
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0.saturating_add(other.0))
    }
}

impl std::ops::Neg for LocalDuration {
    type Output = LocalDuration;

    fn neg(self) -> LocalDuration {
        LocalDuration(self.0.saturating_neg())
    }
}
