//! Local tangent-plane projection around a fixed origin.
//!
//! The scale factor `cos(phi_0)` is fixed for the origin rather than computed per position, so
//! the projection is only accurate in the neighbourhood of the origin. Cartesian coordinates are
//! in meters.

use std::f64::consts::PI;

/// Mean earth radius [km].
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Origin of the SailBot app's local frame [deg].
pub const ORIGIN_LATITUDE: f64 = 48.825908;
pub const ORIGIN_LONGITUDE: f64 = 2.406433;

/// `cos(ORIGIN_LATITUDE)`, precomputed.
pub const COS_PHI_0: f64 = 0.658139837;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub earth_radius_km: f64,
    pub origin_latitude: f64,
    pub origin_longitude: f64,
    pub cos_phi_0: f64,
}

impl Default for Projection {
    fn default() -> Self {
        Projection {
            earth_radius_km: EARTH_RADIUS_KM,
            origin_latitude: ORIGIN_LATITUDE,
            origin_longitude: ORIGIN_LONGITUDE,
            cos_phi_0: COS_PHI_0,
        }
    }
}

impl Projection {
    /// Meters per radian along a meridian.
    fn radius_m(&self) -> f64 {
        self.earth_radius_km * 1.0e3
    }

    /// Geographic position [deg] to local `(x, y)` [m].
    pub fn to_cartesian(&self, latitude: f64, longitude: f64) -> (f64, f64) {
        let x = (longitude - self.origin_longitude) * self.radius_m() * self.cos_phi_0 * PI / 180.0;
        let y = (latitude - self.origin_latitude) * self.radius_m() * PI / 180.0;

        (x, y)
    }

    /// Local `(x, y)` [m] to geographic `(latitude, longitude)` [deg].
    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        let latitude = y * 180.0 / PI / self.radius_m() + self.origin_latitude;
        let longitude = x * 180.0 / PI / self.cos_phi_0 / self.radius_m() + self.origin_longitude;

        (latitude, longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn origin_maps_to_zero() {
        let p = Projection::default();
        let (x, y) = p.to_cartesian(ORIGIN_LATITUDE, ORIGIN_LONGITUDE);

        assert_eq!(x, 0.0);
        assert_eq!(y, 0.0);
    }

    #[test]
    fn round_trip_near_origin() {
        let p = Projection::default();

        for i in -100..=100 {
            for j in -100..=100 {
                let lat = ORIGIN_LATITUDE + i as f64 * 1.0e-3;
                let lon = ORIGIN_LONGITUDE + j as f64 * 1.0e-3;

                let (x, y) = p.to_cartesian(lat, lon);
                let (rlat, rlon) = p.to_geographic(x, y);

                assert_abs_diff_eq!(rlat, lat, epsilon = 1.0e-9);
                assert_abs_diff_eq!(rlon, lon, epsilon = 1.0e-9);
            }
        }
    }

    #[test]
    fn one_meter_north() {
        let p = Projection::default();
        let (lat, lon) = p.to_geographic(0.0, 1.0);

        // ~111.2 km per degree
        assert_abs_diff_eq!((lat - ORIGIN_LATITUDE) * 111_194.9, 1.0, epsilon = 1.0e-3);
        assert_eq!(lon, ORIGIN_LONGITUDE);
    }

    #[test]
    fn start_position_is_north_east_of_origin() {
        let p = Projection::default();
        let (x, y) = p.to_cartesian(48.832313, 2.412689);

        assert!(x > 450.0 && x < 470.0, "x: {}", x);
        assert!(y > 705.0 && y < 720.0, "y: {}", y);
    }
}
