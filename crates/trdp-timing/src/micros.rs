use std::{
    ops::{Add, AddAssign, Div, Mul, Sub, SubAssign},
    str::FromStr,
};

use humantime::{Duration as HumanDuration, DurationError as HumanDurationError};
use serde::{Deserializer, Serialize};

use crate::clock::global_clock;

/// Microseconds since the Unix epoch, or a microsecond span when used as a
/// difference. The protocol schedules everything in µs, so there is one
/// newtype for both.
#[derive(Copy, Clone, Debug, Default, Serialize, Hash, PartialEq)]
#[repr(C)]
pub struct Micros(pub u64);

impl Micros {
    pub const MAX: Micros = Micros(u64::MAX);
    pub const ZERO: Micros = Micros(0);

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Micros(s * 1_000_000)
    }

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Micros(ms * 1_000)
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Micros((s * 1_000_000.0).round() as u64)
    }

    #[inline]
    pub fn as_secs(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[inline]
    pub fn as_millis_u64(&self) -> u64 {
        self.0 / 1_000
    }

    /// Current wall-clock time from the process-global clock (mockable under
    /// test).
    #[inline]
    pub fn now() -> Self {
        global_clock().now()
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Micros) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn elapsed_since(&self, since: Self) -> Self {
        Micros(self.0.saturating_sub(since.0))
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Micros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self < Micros::from_millis(1) {
            write!(f, "{}µs", self.0)
        } else if *self < Micros::from_secs(1) {
            write!(f, "{}ms", self.0 as f64 / 1_000.0)
        } else {
            write!(f, "{}s", self.0 as f64 / 1_000_000.0)
        }
    }
}

impl From<u64> for Micros {
    #[inline]
    fn from(value: u64) -> Self {
        Micros(value)
    }
}

impl From<Micros> for u64 {
    #[inline]
    fn from(value: Micros) -> Self {
        value.0
    }
}

impl From<Micros> for std::time::Duration {
    #[inline]
    fn from(value: Micros) -> Self {
        std::time::Duration::from_micros(value.0)
    }
}

impl Add for Micros {
    type Output = Micros;

    #[inline]
    fn add(self, rhs: Micros) -> Micros {
        Micros(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Micros {
    #[inline]
    fn add_assign(&mut self, rhs: Micros) {
        *self = *self + rhs;
    }
}

impl Sub for Micros {
    type Output = Micros;

    #[inline]
    fn sub(self, rhs: Micros) -> Micros {
        Micros(self.0 - rhs.0)
    }
}

impl SubAssign for Micros {
    #[inline]
    fn sub_assign(&mut self, rhs: Micros) {
        *self = *self - rhs;
    }
}

impl Mul<u32> for Micros {
    type Output = Micros;

    #[inline]
    fn mul(self, rhs: u32) -> Micros {
        Micros(self.0 * rhs as u64)
    }
}

impl Div<u32> for Micros {
    type Output = Micros;

    #[inline]
    fn div(self, rhs: u32) -> Micros {
        Micros(self.0 / rhs as u64)
    }
}

impl Eq for Micros {}

impl PartialOrd for Micros {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Micros {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl FromStr for Micros {
    type Err = HumanDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration: std::time::Duration = s.trim().parse::<HumanDuration>()?.into();
        Ok(Micros(duration.as_micros() as u64))
    }
}

impl<'de> serde::Deserialize<'de> for Micros {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct MicrosVisitor;

        impl<'de> Visitor<'de> for MicrosVisitor {
            type Value = Micros;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("An integer or a string with optional suffix (s, ms, us, ...)")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Micros(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom(format!("Micros cannot be negative, got {}", value)));
                }
                Ok(Micros(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Micros::from_str(value).map_err(|e| {
                    E::custom(format!("Failed to parse time value '{}' as duration: {}", value, e))
                })
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_any(MicrosVisitor)
        } else {
            u64::deserialize(deserializer).map(Micros)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_from_string_seconds() {
        let result: Micros = serde_json::from_str(r#""10s""#).unwrap();
        assert_eq!(result, Micros::from_secs(10));
    }

    #[test]
    fn micros_from_string_milliseconds() {
        let result: Micros = serde_json::from_str(r#""100ms""#).unwrap();
        assert_eq!(result, Micros::from_millis(100));
    }

    #[test]
    fn micros_from_number() {
        let result: Micros = serde_json::from_str(r#"500"#).unwrap();
        assert_eq!(result, Micros(500));
    }

    #[test]
    fn saturating_difference() {
        assert_eq!(Micros(5).saturating_sub(Micros(10)), Micros::ZERO);
        assert_eq!(Micros(10).elapsed_since(Micros(4)), Micros(6));
    }
}
