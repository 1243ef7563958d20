//! Trust levels and their saturating arithmetic.

use std::fmt;
use std::str::FromStr;

/// Trust granted to a public key, either locally or through the web of trust.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct TrustLevel(pub u8);

impl TrustLevel {
    pub const NONE: TrustLevel = TrustLevel(0x00);
    pub const LOW: TrustLevel = TrustLevel(0x01);
    pub const HIGH: TrustLevel = TrustLevel(0x03);
    pub const ULTIMATE: TrustLevel = TrustLevel(0xff);

    /// Required effective trust for a verification to succeed.
    pub const THRESHOLD: TrustLevel = TrustLevel::HIGH;

    /// Saturating addition: ULTIMATE absorbs, everything else caps at the
    /// verification threshold.
    pub fn add(self, other: TrustLevel) -> TrustLevel {
        if self == TrustLevel::ULTIMATE || other == TrustLevel::ULTIMATE {
            return TrustLevel::ULTIMATE;
        }

        if self >= TrustLevel::THRESHOLD || other >= TrustLevel::THRESHOLD {
            return TrustLevel::THRESHOLD;
        }

        TrustLevel(self.0.saturating_add(other.0))
    }

    /// Numeric minimum of two levels.
    pub fn min_with(self, other: TrustLevel) -> TrustLevel {
        if self < other {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TrustLevel::NONE => f.write_str("none"),
            TrustLevel::LOW => f.write_str("low"),
            TrustLevel::HIGH => f.write_str("high"),
            TrustLevel::ULTIMATE => f.write_str("ultimate"),
            TrustLevel(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(TrustLevel::NONE),
            "low" => Ok(TrustLevel::LOW),
            "high" => Ok(TrustLevel::HIGH),
            "ultimate" => Ok(TrustLevel::ULTIMATE),
            other => Err(format!("unrecognized trust level: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_add() {
        assert_eq!(TrustLevel::LOW.add(TrustLevel::LOW), TrustLevel(0x02));
        assert_eq!(TrustLevel::LOW.add(TrustLevel::HIGH), TrustLevel::HIGH);
        assert_eq!(TrustLevel::HIGH.add(TrustLevel::HIGH), TrustLevel::HIGH);
        assert_eq!(
            TrustLevel::NONE.add(TrustLevel::ULTIMATE),
            TrustLevel::ULTIMATE
        );
    }

    #[test]
    fn parse_round_trip() {
        for lvl in [
            TrustLevel::NONE,
            TrustLevel::LOW,
            TrustLevel::HIGH,
            TrustLevel::ULTIMATE,
        ] {
            assert_eq!(lvl.to_string().parse::<TrustLevel>(), Ok(lvl));
        }
        assert!("bogus".parse::<TrustLevel>().is_err());
    }

    #[test]
    fn min_with() {
        assert_eq!(
            TrustLevel::HIGH.min_with(TrustLevel::LOW),
            TrustLevel::LOW
        );
        assert_eq!(
            TrustLevel::ULTIMATE.min_with(TrustLevel::HIGH),
            TrustLevel::HIGH
        );
    }
}
