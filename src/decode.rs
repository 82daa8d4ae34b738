//! Frame envelope and the three pure decoders.
//!
//! Each inbound frame carries a discriminant naming one of three payload
//! layouts. Decoding is side-effect free: a frame either yields a normalized
//! record or a [`DecodeError`] naming the offending field.

use serde::Deserialize;
use thiserror::Error;

use crate::models::{Eta, Mmsi, PositionObservation, VesselIdentity};

/// Decoder failure for a single frame. Never fatal to a session.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown frame kind `{0}`")]
    UnknownKind(String),

    #[error("invalid mmsi `{0}`")]
    InvalidMmsi(String),

    #[error("malformed {kind:?} payload: {origin}")]
    MalformedPayload {
        kind: FrameKind,
        origin: serde_json::Error,
    },
}

/// Frame discriminant, carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Static identity including the IMO registry number
    IdentityFull,
    /// Abbreviated identity, never carries a registry number
    IdentityCompact,
    /// Instantaneous location and motion
    Position,
}

impl FrameKind {
    /// Parse the envelope discriminant.
    pub fn from_discriminant(s: &str) -> Result<Self, DecodeError> {
        match s {
            "metadata" => Ok(Self::IdentityFull),
            "metadata-compact" => Ok(Self::IdentityCompact),
            "location" => Ok(Self::Position),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }

    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::IdentityFull => "metadata",
            Self::IdentityCompact => "metadata-compact",
            Self::Position => "location",
        }
    }
}

/// One raw inbound frame as handed over by the transport.
#[derive(Debug, Clone)]
pub struct Frame {
    pub mmsi: Mmsi,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// A decoded frame, ready for the admission filter or the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Identity(VesselIdentity),
    Position(PositionObservation),
}

/// Decode a frame according to its envelope discriminant.
pub fn decode(frame: &Frame) -> Result<DecodedRecord, DecodeError> {
    match frame.kind {
        FrameKind::IdentityFull => decode_identity_full(frame).map(DecodedRecord::Identity),
        FrameKind::IdentityCompact => decode_identity_compact(frame).map(DecodedRecord::Identity),
        FrameKind::Position => decode_position(frame).map(DecodedRecord::Position),
    }
}

/// Full identity frame: carries the IMO registry number.
pub fn decode_identity_full(frame: &Frame) -> Result<VesselIdentity, DecodeError> {
    let wire: FullIdentityWire = parse_payload(frame)?;
    Ok(wire.into_identity(frame.mmsi))
}

/// Compact identity frame: same layout minus the registry number.
pub fn decode_identity_compact(frame: &Frame) -> Result<VesselIdentity, DecodeError> {
    let wire: CompactIdentityWire = parse_payload(frame)?;
    Ok(wire.into_identity(frame.mmsi))
}

/// Position frame.
pub fn decode_position(frame: &Frame) -> Result<PositionObservation, DecodeError> {
    let wire: PositionWire = parse_payload(frame)?;
    Ok(PositionObservation {
        mmsi: frame.mmsi,
        time: wire.time,
        lat: wire.lat,
        lon: wire.lon,
        sog: wire.sog,
        cog: wire.cog,
        heading: wire.heading,
    })
}

fn parse_payload<'a, T: Deserialize<'a>>(frame: &'a Frame) -> Result<T, DecodeError> {
    serde_json::from_slice(&frame.payload).map_err(|origin| DecodeError::MalformedPayload {
        kind: frame.kind,
        origin,
    })
}

/// Length and beam from the four reference-point offsets.
///
/// A zero sum means "unreported" in the upstream encoding, not a
/// zero-length vessel.
fn derive_dimension(fore: Option<u16>, aft: Option<u16>) -> Option<u16> {
    match fore.unwrap_or(0) as u32 + aft.unwrap_or(0) as u32 {
        0 => None,
        d => Some(d.min(u16::MAX as u32) as u16),
    }
}

use serde_helpers::*;

/// Wire layout of a full identity frame.
///
/// See: https://meri.digitraffic.fi/swagger/#/AIS%20V1/vesselMetadataByMssi
#[derive(Debug, Deserialize)]
struct FullIdentityWire {
    #[serde(default, deserialize_with = "deserialize_trimmed_string")]
    name: Option<String>,
    /// Vessel type, None if undefined (0)
    #[serde(rename = "type", default, deserialize_with = "deserialize_vessel_type")]
    vessel_type: Option<u8>,
    /// IMO registry number, None if not available (0)
    #[serde(default, deserialize_with = "deserialize_imo")]
    imo: Option<u32>,
    #[serde(rename = "callSign", default, deserialize_with = "deserialize_trimmed_string")]
    call_sign: Option<String>,
    #[serde(default, deserialize_with = "deserialize_trimmed_string")]
    destination: Option<String>,
    /// Estimated time of arrival; 20-bit packed MMDDHHMM UTC
    #[serde(default, deserialize_with = "deserialize_eta")]
    eta: Option<Eta>,
    /// Maximum static draught in decimeters on the wire, None if 0
    #[serde(default, deserialize_with = "deserialize_draught")]
    draught: Option<f32>,
    #[serde(rename = "navStat", default, deserialize_with = "deserialize_nav_stat")]
    nav_status: Option<u8>,
    /// Reference point for reported position dimension A (to bow)
    #[serde(rename = "refA", default, deserialize_with = "deserialize_ref_dim")]
    ref_a: Option<u16>,
    /// Reference point for reported position dimension B (to stern)
    #[serde(rename = "refB", default, deserialize_with = "deserialize_ref_dim")]
    ref_b: Option<u16>,
    /// Reference point for reported position dimension C (to port)
    #[serde(rename = "refC", default, deserialize_with = "deserialize_ref_dim")]
    ref_c: Option<u16>,
    /// Reference point for reported position dimension D (to starboard)
    #[serde(rename = "refD", default, deserialize_with = "deserialize_ref_dim")]
    ref_d: Option<u16>,
}

impl FullIdentityWire {
    fn into_identity(self, mmsi: Mmsi) -> VesselIdentity {
        VesselIdentity {
            length: derive_dimension(self.ref_a, self.ref_b),
            beam: derive_dimension(self.ref_c, self.ref_d),
            name: self.name,
            vessel_type: self.vessel_type,
            imo: self.imo,
            call_sign: self.call_sign,
            destination: self.destination,
            eta: self.eta,
            draught: self.draught,
            nav_status: self.nav_status,
            ..VesselIdentity::bare(mmsi)
        }
    }
}

/// Wire layout of a compact identity frame: as the full layout, but the
/// registry number is never transmitted.
#[derive(Debug, Deserialize)]
struct CompactIdentityWire {
    #[serde(default, deserialize_with = "deserialize_trimmed_string")]
    name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "deserialize_vessel_type")]
    vessel_type: Option<u8>,
    #[serde(rename = "callSign", default, deserialize_with = "deserialize_trimmed_string")]
    call_sign: Option<String>,
    #[serde(default, deserialize_with = "deserialize_trimmed_string")]
    destination: Option<String>,
    #[serde(default, deserialize_with = "deserialize_eta")]
    eta: Option<Eta>,
    #[serde(default, deserialize_with = "deserialize_draught")]
    draught: Option<f32>,
    #[serde(rename = "navStat", default, deserialize_with = "deserialize_nav_stat")]
    nav_status: Option<u8>,
    #[serde(rename = "refA", default, deserialize_with = "deserialize_ref_dim")]
    ref_a: Option<u16>,
    #[serde(rename = "refB", default, deserialize_with = "deserialize_ref_dim")]
    ref_b: Option<u16>,
    #[serde(rename = "refC", default, deserialize_with = "deserialize_ref_dim")]
    ref_c: Option<u16>,
    #[serde(rename = "refD", default, deserialize_with = "deserialize_ref_dim")]
    ref_d: Option<u16>,
}

impl CompactIdentityWire {
    fn into_identity(self, mmsi: Mmsi) -> VesselIdentity {
        VesselIdentity {
            length: derive_dimension(self.ref_a, self.ref_b),
            beam: derive_dimension(self.ref_c, self.ref_d),
            name: self.name,
            vessel_type: self.vessel_type,
            call_sign: self.call_sign,
            destination: self.destination,
            eta: self.eta,
            draught: self.draught,
            nav_status: self.nav_status,
            ..VesselIdentity::bare(mmsi)
        }
    }
}

/// Wire layout of a position frame.
///
/// See: https://meri.digitraffic.fi/swagger/#/AIS%20V1/vesselLocationsByMssiAndTimestamp
#[derive(Debug, Deserialize)]
struct PositionWire {
    /// Record timestamp in seconds from Unix epoch
    time: i64,
    lat: f64,
    lon: f64,
    /// Speed over ground in knots, None if not available (=102.3)
    #[serde(default, deserialize_with = "deserialize_sog")]
    sog: Option<f32>,
    /// Course over ground in degrees, None if not available (=360)
    #[serde(default, deserialize_with = "deserialize_cog")]
    cog: Option<f32>,
    /// Heading in degrees (0-359), None if 511 = not available
    #[serde(default, deserialize_with = "deserialize_heading")]
    heading: Option<u16>,
}

/// Custom deserializers mapping upstream "not available" sentinels to None
mod serde_helpers {
    use serde::{self, Deserialize, Deserializer};

    use crate::models::Eta;

    pub fn deserialize_sog<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f32::deserialize(deserializer)?;
        Ok(if value == 102.3 { None } else { Some(value) })
    }

    pub fn deserialize_cog<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f32::deserialize(deserializer)?;
        Ok(if value == 360.0 { None } else { Some(value) })
    }

    pub fn deserialize_nav_stat<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Ok(if value == 15 { None } else { Some(value) })
    }

    pub fn deserialize_heading<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u16::deserialize(deserializer)?;
        Ok(if value == 511 { None } else { Some(value) })
    }

    pub fn deserialize_trimmed_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        let trimmed = s.trim();
        Ok(if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        })
    }

    pub fn deserialize_vessel_type<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Ok(if value == 0 { None } else { Some(value) })
    }

    pub fn deserialize_imo<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        Ok(if value == 0 { None } else { Some(value) })
    }

    pub fn deserialize_draught<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u16::deserialize(deserializer)?;
        Ok(if value == 0 {
            None
        } else {
            Some((value as f32) / 10f32)
        })
    }

    pub fn deserialize_eta<'de, D>(deserializer: D) -> Result<Option<Eta>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        let eta = Eta::from_bits(value);
        Ok(if eta.is_empty() { None } else { Some(eta) })
    }

    pub fn deserialize_ref_dim<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u16::deserialize(deserializer)?;
        Ok(if value == 0 { None } else { Some(value) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: FrameKind, mmsi: u32, payload: &str) -> Frame {
        Frame {
            mmsi: Mmsi::try_from(mmsi).unwrap(),
            kind,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn decode_full_identity() {
        let f = frame(
            FrameKind::IdentityFull,
            235_010_926,
            r#"{
                "name" : "SUULA",
                "destination" : "ROTTERDAM",
                "draught" : 79,
                "eta" : 823872,
                "navStat" : 0,
                "refA" : 50,
                "refB" : 100,
                "refC" : 12,
                "refD" : 13,
                "callSign" : "LAUY8",
                "imo" : 9267560,
                "type" : 80
            }"#,
        );

        let identity = match decode(&f).unwrap() {
            DecodedRecord::Identity(i) => i,
            other => panic!("expected identity, got {other:?}"),
        };

        assert_eq!(identity.length, Some(150));
        assert_eq!(identity.beam, Some(25));
        assert_eq!(identity.name.as_deref(), Some("SUULA"));
        assert_eq!(identity.imo, Some(9_267_560));
        assert_eq!(identity.vessel_type, Some(80));
        assert_eq!(identity.destination.as_deref(), Some("ROTTERDAM"));
        assert_eq!(identity.draught, Some(7.9));
        assert_eq!(identity.nav_status, Some(0));
        assert_eq!(identity.flag.as_deref(), Some("GB"));
        assert_eq!(identity.company, None);
    }

    #[test]
    fn decode_full_identity_unreported_dimensions() {
        let f = frame(
            FrameKind::IdentityFull,
            230_000_001,
            r#"{"name":"X","refA":0,"refB":0,"refC":0,"refD":0,"imo":0,"type":0,"draught":0,"eta":1596}"#,
        );
        let identity = decode_identity_full(&f).unwrap();
        assert_eq!(identity.length, None);
        assert_eq!(identity.beam, None);
        assert_eq!(identity.imo, None);
        assert_eq!(identity.vessel_type, None);
        assert_eq!(identity.draught, None);
        assert_eq!(identity.eta, None);
    }

    #[test]
    fn decode_compact_identity_never_carries_registry() {
        let f = frame(
            FrameKind::IdentityCompact,
            230_111_222,
            r#"{"name":"AURA","type":70,"refA":40,"refB":20,"refC":5,"refD":5}"#,
        );
        let identity = decode_identity_compact(&f).unwrap();
        assert_eq!(identity.imo, None);
        assert_eq!(identity.length, Some(60));
        assert_eq!(identity.beam, Some(10));
        assert_eq!(identity.name.as_deref(), Some("AURA"));
    }

    #[test]
    fn decode_position_with_sentinels() {
        let f = frame(
            FrameKind::Position,
            230_123_456,
            r#"{
                "time" : 1734361116,
                "sog" : 102.3,
                "cog" : 360.0,
                "heading" : 511,
                "lon" : 28.886522,
                "lat" : 61.866617
            }"#,
        );
        let pos = decode_position(&f).unwrap();
        assert_eq!(pos.time, 1_734_361_116);
        assert_eq!(pos.sog, None);
        assert_eq!(pos.cog, None);
        assert_eq!(pos.heading, None);
        assert_eq!(pos.lat, 61.866617);
        assert_eq!(pos.lon, 28.886522);
    }

    #[test]
    fn decode_position_missing_field_fails() {
        let f = frame(FrameKind::Position, 230_123_456, r#"{"lat":61.0,"lon":28.0}"#);
        let err = decode_position(&f).unwrap_err();
        // serde names the missing field in the error
        assert!(err.to_string().contains("time"), "got: {err}");
    }

    #[test]
    fn unknown_discriminant_rejected() {
        let err = FrameKind::from_discriminant("telemetry").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(_)));
    }

    #[test]
    fn whitespace_only_strings_normalize_to_none() {
        let f = frame(
            FrameKind::IdentityFull,
            230_000_002,
            r#"{"name":"   ","destination":"","callSign":" "}"#,
        );
        let identity = decode_identity_full(&f).unwrap();
        assert_eq!(identity.name, None);
        assert_eq!(identity.destination, None);
        assert_eq!(identity.call_sign, None);
    }
}
