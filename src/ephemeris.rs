//! Ephemeris collaborator interface.
//!
//! Precise astronomical computation lives outside this crate; the scheduler
//! only consumes altitudes, Moon separation and the dawn/dusk window through
//! this trait. [`SineEphemeris`] is an analytic stand-in good enough for the
//! simulator and the test suite.

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::models::TargetCoordinates;

/// Read-only sky geometry queries.
pub trait Ephemeris: Send + Sync {
    /// Altitude of the target in degrees at `t`, and whether it is setting
    /// (altitude decreasing).
    fn find_altitude(&self, target: &TargetCoordinates, t: DateTime<Utc>) -> (f64, bool);

    /// Angular separation between the target and the Moon, degrees.
    fn moon_separation(&self, target: &TargetCoordinates, t: DateTime<Utc>) -> f64;

    /// Next astronomical dawn and dusk after `t`.
    fn dawn_dusk(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>);

    /// True between dusk and dawn: the next twilight event is a dawn.
    fn is_dark(&self, t: DateTime<Utc>) -> bool {
        let (dawn, dusk) = self.dawn_dusk(t);
        dawn < dusk
    }
}

/// Analytic ephemeris: spherical-astronomy altitude from an approximate
/// sidereal time, a fixed Moon position, and configurable twilight hours.
#[derive(Debug, Clone)]
pub struct SineEphemeris {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// UTC hour of astronomical dusk.
    pub dusk_hour: u32,
    /// UTC hour of astronomical dawn.
    pub dawn_hour: u32,
    /// Fixed Moon position used for separation queries.
    pub moon: TargetCoordinates,
}

impl Default for SineEphemeris {
    fn default() -> Self {
        Self {
            latitude_deg: 40.0,
            longitude_deg: 0.0,
            dusk_hour: 19,
            dawn_hour: 5,
            moon: TargetCoordinates::new(200.0, -10.0),
        }
    }
}

impl SineEphemeris {
    /// Approximate local sidereal time in degrees.
    fn lst_deg(&self, t: DateTime<Utc>) -> f64 {
        let days = (t.timestamp() as f64 - 946_728_000.0) / 86_400.0; // since J2000
        (280.46 + 360.985_647_366_29 * days + self.longitude_deg).rem_euclid(360.0)
    }
}

impl Ephemeris for SineEphemeris {
    fn find_altitude(&self, target: &TargetCoordinates, t: DateTime<Utc>) -> (f64, bool) {
        let lat = self.latitude_deg.to_radians();
        let dec = target.dec_deg.to_radians();
        let hour_angle = (self.lst_deg(t) - target.ra_deg).rem_euclid(360.0).to_radians();

        let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * hour_angle.cos();
        let altitude = sin_alt.asin().to_degrees();
        // Past the meridian (0 < H < 180 deg) the target is descending.
        let setting = hour_angle.sin() > 0.0;
        (altitude, setting)
    }

    fn moon_separation(&self, target: &TargetCoordinates, _t: DateTime<Utc>) -> f64 {
        let (ra1, dec1) = (target.ra_deg.to_radians(), target.dec_deg.to_radians());
        let (ra2, dec2) = (self.moon.ra_deg.to_radians(), self.moon.dec_deg.to_radians());
        let cos_sep =
            dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
        cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
    }

    fn dawn_dusk(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let day_start = t - Duration::seconds(
            (t.num_seconds_from_midnight() as i64).min(86_399),
        );
        let mut dawn = day_start + Duration::hours(self.dawn_hour as i64);
        let mut dusk = day_start + Duration::hours(self.dusk_hour as i64);
        if dawn <= t {
            dawn = dawn + Duration::days(1);
        }
        if dusk <= t {
            dusk = dusk + Duration::days(1);
        }
        (dawn, dusk)
    }
}
