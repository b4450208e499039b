//! Target coordinates and capture signatures.

use serde::{Deserialize, Serialize};

/// Equatorial coordinates of an observation target, J2000, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetCoordinates {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl TargetCoordinates {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }
}

/// Key identifying a unique (target, filter, frame-type) combination.
///
/// Used to count frames already stored for a job so that completed work is
/// not repeated when job progress is remembered across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureSignature {
    pub target: String,
    pub filter: String,
    pub frame_type: String,
}

impl CaptureSignature {
    pub fn new(
        target: impl Into<String>,
        filter: impl Into<String>,
        frame_type: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            filter: filter.into(),
            frame_type: frame_type.into(),
        }
    }

    /// Stable string form used as the captured-frames map key.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.target, self.filter, self.frame_type)
    }
}

impl std::fmt::Display for CaptureSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
