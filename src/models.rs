//! Domain records for the vessel store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::IngestError;

/// Maritime Mobile Service Identity (MMSI)
///
/// A unique nine-digit number identifying a vessel transponder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mmsi(u32);

impl TryFrom<u32> for Mmsi {
    type Error = IngestError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value > 999_999_999 {
            return Err(IngestError::InvalidMmsi(value.to_string()));
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Mmsi {
    type Error = IngestError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let parsed = value
            .parse::<u32>()
            .map_err(|_| IngestError::InvalidMmsi(value.to_string()))?;
        Self::try_from(parsed)
    }
}

impl Mmsi {
    /// Get the raw MMSI value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Maritime Identification Digits: the leading three digits of the MMSI.
    pub fn mid(&self) -> u32 {
        self.0 / 1_000_000
    }

    /// Flag state derived from the MID.
    ///
    /// Not transmitted in any frame; MID blocks are assigned per
    /// administration. Only MIDs seen in this deployment's coverage
    /// area are mapped, the rest report as unknown.
    pub fn flag_state(&self) -> Option<&'static str> {
        let flag = match self.mid() {
            211 => "DE",
            219 | 220 => "DK",
            226..=228 => "FR",
            230 => "FI",
            231 => "FO",
            232..=235 => "GB",
            244..=246 => "NL",
            248..=250 => "MT",
            255 => "PT",
            257..=259 => "NO",
            265 | 266 => "SE",
            271 => "TR",
            273 => "RU",
            275 => "LV",
            276 => "EE",
            277 => "LT",
            304 | 305 => "AG",
            311 => "BS",
            331 => "GL",
            355..=357 => "PA",
            538 => "MH",
            563..=566 => "SG",
            636 | 637 => "LR",
            _ => return None,
        };
        Some(flag)
    }
}

impl std::fmt::Display for Mmsi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Estimated time of arrival, as carried in identity frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub struct Eta {
    pub month: Option<u8>,
    pub day: Option<u8>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
}

impl Eta {
    /// Convert ETA from 20-bit packed format
    ///
    /// - Bits 19-16: month; 1-12; 0 = not available = default
    /// - Bits 15-11: day; 1-31; 0 = not available = default
    /// - Bits 10-6: hour; 0-23; 24 = not available = default
    /// - Bits 5-0: minute; 0-59; 60 = not available = default
    pub(crate) fn from_bits(value: u32) -> Self {
        let month = (value >> 16 & 0xF) as u8;
        let day = (value >> 11 & 0x1F) as u8;
        let hour = (value >> 6 & 0x1F) as u8;
        let minute = (value & 0x3F) as u8;

        Eta {
            month: match month {
                0 | 13..=255 => None,
                m => Some(m),
            },
            day: match day {
                0 | 32..=255 => None,
                d => Some(d),
            },
            hour: match hour {
                24..=255 => None,
                h => Some(h),
            },
            minute: match minute {
                60..=255 => None,
                m => Some(m),
            },
        }
    }

    /// Convert back to the 20-bit packed representation, for storage
    pub(crate) fn to_bits(self) -> u32 {
        let mut value: u32 = 0;

        if let Some(month) = self.month {
            value |= (month as u32) << 16;
        }
        if let Some(day) = self.day {
            value |= (day as u32) << 11;
        }
        if let Some(hour) = self.hour {
            value |= (hour as u32) << 6;
        }
        if let Some(minute) = self.minute {
            value |= minute as u32;
        }

        value
    }

    /// True if no component of the ETA was reported.
    pub fn is_empty(&self) -> bool {
        self.month.is_none() && self.day.is_none() && self.hour.is_none() && self.minute.is_none()
    }
}

// Serialize to u32 for storage
impl Serialize for Eta {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.to_bits())
    }
}

/// Static vessel attributes, keyed by MMSI.
///
/// Produced by the identity decoders; the `company` enrichment field is
/// owned by an out-of-band collaborator and is never populated here.
#[derive(Debug, Clone, PartialEq)]
pub struct VesselIdentity {
    pub mmsi: Mmsi,
    /// Vessel name, None if the frame carried an empty string
    pub name: Option<String>,
    /// Category code (ship type), None if unreported (0)
    pub vessel_type: Option<u8>,
    /// Overall length in meters, derived from reference dimensions A+B
    pub length: Option<u16>,
    /// Beam in meters, derived from reference dimensions C+D
    pub beam: Option<u16>,
    /// IMO registry number, None if unreported (0) or for compact frames
    pub imo: Option<u32>,
    pub call_sign: Option<String>,
    /// Flag state, derived from the MMSI MID at decode time
    pub flag: Option<String>,
    pub destination: Option<String>,
    pub eta: Option<Eta>,
    /// Maximum static draught in meters, None if unreported (0)
    pub draught: Option<f32>,
    pub nav_status: Option<u8>,
    /// Owning-company name, sourced by the enrichment collaborator
    pub company: Option<String>,
}

impl VesselIdentity {
    /// A record carrying nothing but the MMSI, to be filled by a decoder.
    pub fn bare(mmsi: Mmsi) -> Self {
        Self {
            mmsi,
            name: None,
            vessel_type: None,
            length: None,
            beam: None,
            imo: None,
            call_sign: None,
            flag: mmsi.flag_state().map(str::to_string),
            destination: None,
            eta: None,
            draught: None,
            nav_status: None,
            company: None,
        }
    }
}

/// A stored vessel row, as read back by collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVessel {
    pub identity: VesselIdentity,
    pub updated_at: DateTime<Utc>,
}

/// One position report, append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionObservation {
    pub mmsi: Mmsi,
    /// Observation timestamp, seconds from Unix epoch
    pub time: i64,
    pub lat: f64,
    pub lon: f64,
    /// Speed over ground in knots, None if not available (=102.3)
    pub sog: Option<f32>,
    /// Course over ground in degrees, None if not available (=360)
    pub cog: Option<f32>,
    /// Heading in degrees (0-359), None if not available (=511)
    pub heading: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmsi_bounds() {
        assert!(Mmsi::try_from(999_999_999u32).is_ok());
        assert!(Mmsi::try_from(1_000_000_000u32).is_err());
        assert!(Mmsi::try_from("235010926").is_ok());
        assert!(Mmsi::try_from("not-a-number").is_err());
    }

    #[test]
    fn flag_state_from_mid() {
        let mmsi = Mmsi::try_from(235_010_926u32).unwrap();
        assert_eq!(mmsi.mid(), 235);
        assert_eq!(mmsi.flag_state(), Some("GB"));

        let mmsi = Mmsi::try_from(230_123_456u32).unwrap();
        assert_eq!(mmsi.flag_state(), Some("FI"));

        // MID 999 is unassigned
        let mmsi = Mmsi::try_from(999_000_001u32).unwrap();
        assert_eq!(mmsi.flag_state(), None);
    }

    #[test]
    fn eta_bits_round_trip() {
        let eta = Eta::from_bits(823_872);
        assert_eq!(
            eta,
            Eta {
                month: Some(12),
                day: Some(18),
                hour: Some(9),
                minute: Some(0),
            }
        );
        assert_eq!(eta.to_bits(), 823_872);
    }

    #[test]
    fn eta_empty_when_all_defaults() {
        // month 0, day 0, hour 24, minute 60
        let eta = Eta::from_bits(24 << 6 | 60);
        assert!(eta.is_empty());
    }
}
