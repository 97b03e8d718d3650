//! Orbital Mechanics Library
//!
//! Circular-orbit propagation and Walker Delta shell layout for the
//! three constellation tiers. Positions are Earth-centred inertial (km),
//! with time measured in seconds from the simulation epoch.

use nalgebra::{Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use thiserror::Error;

/// Equatorial Earth radius (km)
pub const EARTH_RADIUS_KM: f64 = 6378.137;

/// Earth gravitational parameter (km^3/s^2)
pub const EARTH_MU_KM3_S2: f64 = 398_600.4418;

/// Altitude of a geostationary orbit (km)
pub const GEOSTATIONARY_ALTITUDE_KM: f64 = 35_786.0;

#[derive(Error, Debug)]
pub enum OrbitalError {
    #[error("Invalid shell: {0}")]
    InvalidShell(String),
    #[error("Invalid orbital elements: {0}")]
    InvalidElements(String),
}

pub type Result<T> = std::result::Result<T, OrbitalError>;

/// Circular orbit described by altitude, inclination, RAAN and the
/// argument of latitude at epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircularOrbit {
    pub altitude_km: f64,
    pub inclination_deg: f64,
    pub raan_deg: f64,
    pub phase_deg: f64,
}

impl CircularOrbit {
    pub fn new(altitude_km: f64, inclination_deg: f64, raan_deg: f64, phase_deg: f64) -> Result<Self> {
        if !altitude_km.is_finite() || altitude_km <= 0.0 {
            return Err(OrbitalError::InvalidElements(format!(
                "altitude must be positive, got {altitude_km}"
            )));
        }
        if !(0.0..=180.0).contains(&inclination_deg) {
            return Err(OrbitalError::InvalidElements(format!(
                "inclination must be within [0, 180], got {inclination_deg}"
            )));
        }
        Ok(Self {
            altitude_km,
            inclination_deg,
            raan_deg,
            phase_deg,
        })
    }

    pub fn radius_km(&self) -> f64 {
        EARTH_RADIUS_KM + self.altitude_km
    }

    /// Mean motion (rad/s)
    pub fn mean_motion(&self) -> f64 {
        (EARTH_MU_KM3_S2 / self.radius_km().powi(3)).sqrt()
    }

    /// Orbital period (s)
    pub fn period_s(&self) -> f64 {
        TAU / self.mean_motion()
    }

    /// Orbital speed (km/s)
    pub fn speed_km_s(&self) -> f64 {
        self.mean_motion() * self.radius_km()
    }

    fn plane_rotation(&self) -> Rotation3<f64> {
        Rotation3::from_axis_angle(&Vector3::z_axis(), self.raan_deg.to_radians())
            * Rotation3::from_axis_angle(&Vector3::x_axis(), self.inclination_deg.to_radians())
    }

    fn argument_of_latitude(&self, t: f64) -> f64 {
        self.phase_deg.to_radians() + self.mean_motion() * t
    }

    /// Inertial position at `t` seconds after epoch
    pub fn position_at(&self, t: f64) -> Point3<f64> {
        let u = self.argument_of_latitude(t);
        let in_plane = Vector3::new(u.cos(), u.sin(), 0.0) * self.radius_km();
        Point3::from(self.plane_rotation() * in_plane)
    }

    /// Inertial velocity (km/s) at `t` seconds after epoch
    pub fn velocity_at(&self, t: f64) -> Vector3<f64> {
        let u = self.argument_of_latitude(t);
        let in_plane = Vector3::new(-u.sin(), u.cos(), 0.0) * self.speed_km_s();
        self.plane_rotation() * in_plane
    }
}

/// Walker Delta shell i:T/P/F
///
/// `planes` equally spaced RAANs, `per_plane` equally spaced slots in each,
/// and a relative phase offset of `phasing * 360 / T` degrees between
/// adjacent planes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalkerShell {
    pub planes: u16,
    pub per_plane: u16,
    #[serde(default)]
    pub phasing: u16,
    pub altitude_km: f64,
    pub inclination_deg: f64,
}

/// One satellite position within a shell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShellSlot {
    pub plane: u16,
    pub slot: u16,
    pub orbit: CircularOrbit,
}

impl WalkerShell {
    pub fn new(planes: u16, per_plane: u16, phasing: u16, altitude_km: f64, inclination_deg: f64) -> Self {
        Self {
            planes,
            per_plane,
            phasing,
            altitude_km,
            inclination_deg,
        }
    }

    /// Single-plane equatorial ring at geostationary altitude
    pub fn geostationary(count: u16) -> Self {
        Self::new(1, count, 0, GEOSTATIONARY_ALTITUDE_KM, 0.0)
    }

    pub fn total(&self) -> usize {
        self.planes as usize * self.per_plane as usize
    }

    pub fn plane_spacing_deg(&self) -> f64 {
        360.0 / self.planes as f64
    }

    pub fn in_plane_spacing_deg(&self) -> f64 {
        360.0 / self.per_plane as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.planes == 0 || self.per_plane == 0 {
            return Err(OrbitalError::InvalidShell(format!(
                "shell needs at least one plane and one slot, got {}x{}",
                self.planes, self.per_plane
            )));
        }
        if self.planes > 1 && self.phasing >= self.planes {
            return Err(OrbitalError::InvalidShell(format!(
                "phasing {} must be below plane count {}",
                self.phasing, self.planes
            )));
        }
        CircularOrbit::new(self.altitude_km, self.inclination_deg, 0.0, 0.0)?;
        Ok(())
    }

    /// Every slot in plane-major order
    pub fn slots(&self) -> Result<Vec<ShellSlot>> {
        self.validate()?;
        let total = self.total() as f64;
        let mut slots = Vec::with_capacity(self.total());
        for plane in 0..self.planes {
            let raan = plane as f64 * self.plane_spacing_deg();
            let offset = plane as f64 * self.phasing as f64 * 360.0 / total;
            for slot in 0..self.per_plane {
                let phase = (slot as f64 * self.in_plane_spacing_deg() + offset) % 360.0;
                let orbit = CircularOrbit::new(self.altitude_km, self.inclination_deg, raan, phase)?;
                slots.push(ShellSlot { plane, slot, orbit });
            }
        }
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_shell() -> WalkerShell {
        WalkerShell::new(4, 6, 1, 550.0, 53.0)
    }

    #[test]
    fn test_geostationary_period_is_one_sidereal_day() {
        let orbit = CircularOrbit::new(GEOSTATIONARY_ALTITUDE_KM, 0.0, 0.0, 0.0).unwrap();
        assert!((orbit.period_s() - 86_164.0).abs() < 10.0);
    }

    #[test]
    fn test_position_stays_on_sphere() {
        let orbit = CircularOrbit::new(550.0, 53.0, 40.0, 10.0).unwrap();
        for t in [0.0, 100.0, 1_000.0, 5_000.0] {
            let r = orbit.position_at(t).coords.norm();
            assert!((r - orbit.radius_km()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_velocity_is_tangential() {
        let orbit = CircularOrbit::new(1_200.0, 70.0, 120.0, 33.0).unwrap();
        let r = orbit.position_at(250.0).coords;
        let v = orbit.velocity_at(250.0);
        assert!(r.dot(&v).abs() < 1e-6);
        assert!((v.norm() - orbit.speed_km_s()).abs() < 1e-9);
    }

    #[test]
    fn test_equatorial_orbit_stays_in_plane() {
        let orbit = CircularOrbit::new(GEOSTATIONARY_ALTITUDE_KM, 0.0, 0.0, 90.0).unwrap();
        let p = orbit.position_at(3_600.0);
        assert!(p.z.abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_elements() {
        assert!(CircularOrbit::new(-5.0, 10.0, 0.0, 0.0).is_err());
        assert!(CircularOrbit::new(500.0, 200.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_walker_slots_layout() {
        let shell = create_test_shell();
        let slots = shell.slots().unwrap();
        assert_eq!(slots.len(), 24);
        assert_eq!(slots[0].orbit.raan_deg, 0.0);
        assert_eq!(slots[6].plane, 1);
        assert_eq!(slots[6].orbit.raan_deg, 90.0);
        // one phasing unit of 360/24 between adjacent planes
        assert!((slots[6].orbit.phase_deg - 15.0).abs() < 1e-9);
        assert!((slots[1].orbit.phase_deg - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_in_plane_neighbors_equidistant() {
        let slots = create_test_shell().slots().unwrap();
        let d = |a: usize, b: usize| {
            nalgebra::distance(&slots[a].orbit.position_at(0.0), &slots[b].orbit.position_at(0.0))
        };
        assert!((d(0, 1) - d(1, 2)).abs() < 1e-6);
        assert!((d(0, 1) - d(5, 0)).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_shells() {
        assert!(WalkerShell::new(0, 4, 0, 550.0, 53.0).validate().is_err());
        assert!(WalkerShell::new(3, 4, 3, 550.0, 53.0).validate().is_err());
        assert!(WalkerShell::geostationary(3).validate().is_ok());
    }
}
