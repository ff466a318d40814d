//! Hardware Abstraction Layer
//!
//! The procedure core only ever talks to the LED driver through the
//! [`HardwareLink`] capability trait. Concrete links:
//!
//! - [`serial::SerialLedLink`] - a serial-attached driver, commands built from
//!   configured templates
//! - [`mock::MockLedLink`] - records calls, injects failures; for tests and `--mock` runs
//!
//! This module also defines the two value types every link accepts:
//! [`Intensity`] (always within 0..=100) and [`ChannelSet`] (non-zero channel ids).

pub mod capabilities;
pub mod mock;
pub mod serial;

pub use capabilities::HardwareLink;
pub use mock::{LinkCall, LinkOp, MockLedLink};
pub use serial::SerialLedLink;

use crate::error::RequestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// LED output level in percent.
///
/// Construction clamps into `0..=100`, so a value outside the range can never
/// reach a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub struct Intensity(u8);

impl Intensity {
    /// Highest representable intensity
    pub const MAX: Intensity = Intensity(100);
    /// LEDs dark
    pub const OFF: Intensity = Intensity(0);

    /// Clamp an arbitrary integer into the valid range
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, i64::from(Self::MAX.0)) as u8)
    }

    /// Value in percent
    pub fn percent(self) -> u8 {
        self.0
    }

    /// LEDs dark at this level
    pub fn is_off(self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for Intensity {
    fn from(value: i64) -> Self {
        Self::clamped(value)
    }
}

impl From<Intensity> for u8 {
    fn from(value: Intensity) -> Self {
        value.0
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Set of driver channels, ordered by id. Channel 0 is not addressable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ChannelSet(BTreeSet<u8>);

impl ChannelSet {
    /// Build a set from channel ids, rejecting channel 0.
    pub fn new(ids: impl IntoIterator<Item = u8>) -> Result<Self, RequestError> {
        let mut set = BTreeSet::new();
        for id in ids {
            if id == 0 {
                return Err(RequestError::InvalidChannel(0, u8::MAX));
            }
            set.insert(id);
        }
        Ok(Self(set))
    }

    /// Build a set from untrusted ids, requiring each to lie in `1..=channel_count`.
    pub fn within(ids: &[i64], channel_count: u8) -> Result<Self, RequestError> {
        let mut set = BTreeSet::new();
        for &id in ids {
            if id < 1 || id > i64::from(channel_count) {
                return Err(RequestError::InvalidChannel(id, channel_count));
            }
            set.insert(id as u8);
        }
        Ok(Self(set))
    }

    /// True when no channel is selected
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of selected channels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Channel ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.0.iter().map(u8::to_string).collect();
        write!(f, "{{{}}}", ids.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_clamps_to_range() {
        assert_eq!(Intensity::clamped(150), Intensity::MAX);
        assert_eq!(Intensity::clamped(-20), Intensity::OFF);
        assert_eq!(Intensity::clamped(42).percent(), 42);
        assert_eq!(Intensity::clamped(i64::MAX).percent(), 100);
    }

    #[test]
    fn intensity_deserializes_through_clamp() {
        let value: Intensity = serde_json::from_str("250").unwrap();
        assert_eq!(value, Intensity::MAX);
        assert_eq!(serde_json::to_string(&value).unwrap(), "100");
    }

    #[test]
    fn channel_set_rejects_zero() {
        assert_eq!(
            ChannelSet::new([1, 0, 2]),
            Err(RequestError::InvalidChannel(0, u8::MAX))
        );
    }

    #[test]
    fn channel_set_within_bounds() {
        let set = ChannelSet::within(&[3, 1, 3], 4).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(set.to_string(), "{1,3}");

        assert_eq!(
            ChannelSet::within(&[5], 4),
            Err(RequestError::InvalidChannel(5, 4))
        );
        assert_eq!(
            ChannelSet::within(&[-1], 4),
            Err(RequestError::InvalidChannel(-1, 4))
        );
    }
}
