//! Admission filter for decoded identity records.

use tracing::debug;

use crate::config::FilterConfig;
use crate::models::VesselIdentity;

/// Decides whether an identity record is eligible for persistence.
///
/// Only a known-violating value rejects: a record with unknown length or
/// unknown category is admitted, so a vessel is not lost merely because
/// its static frame has not fully arrived yet. The filter is evaluated
/// independently on every frame.
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    min_length: u16,
    min_category: u8,
    max_category: u8,
}

impl AdmissionFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            min_length: config.min_length,
            min_category: config.min_category,
            max_category: config.max_category,
        }
    }

    /// True if the record may be persisted.
    pub fn admit(&self, identity: &VesselIdentity) -> bool {
        if let Some(length) = identity.length {
            if length < self.min_length {
                debug!(mmsi = %identity.mmsi, length, "rejected: below minimum length");
                return false;
            }
        }

        if let Some(category) = identity.vessel_type {
            if category < self.min_category || category > self.max_category {
                debug!(mmsi = %identity.mmsi, category, "rejected: category outside band");
                return false;
            }
        }

        true
    }
}
