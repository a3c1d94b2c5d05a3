//! A thin autonomous waypoint planner, showing how a higher-level
//! consumer composes on top of the public `Drone`/`ControlService`
//! surface. Not part of the protocol core: no service worker thread
//! of its own, just a state machine driven by the caller's update
//! loop.

use crate::control::{ControlService, FlyState};
use crate::drone::Drone;
use crate::navdata::{NAVDATA_OPT_DEMO, NAVDATA_OPT_GPS, NAVDATA_OPT_MAGNETO};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutonomyState {
    Stopped,
    Bootstrapping,
    WaitingForGps,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
}

/// Degrees of heading error below which the planner stops yawing
/// toward a waypoint. Reproduced as-is from the system this was
/// adapted from; not independently tuned.
const HEADING_TOLERANCE_DEG: f64 = 4.5;
/// Meters of distance below which the planner stops moving forward.
const DISTANCE_TOLERANCE_M: f64 = 4.5;
/// Millimeters of altitude error the planner will correct for before
/// attempting lateral movement.
const ALTITUDE_TOLERANCE_MM: i32 = 250;

struct Inner {
    state: AutonomyState,
    waypoints: Vec<Waypoint>,
    cursor: usize,
    wants_running: bool,
    cooldown_until: DateTime<Utc>,
    is_flying: bool,
    is_trimmed: bool,
    is_calibrated: bool,
    needs_calibration: bool,
}

pub struct Planner {
    drone: Arc<Drone>,
    control: Arc<ControlService>,
    inner: Mutex<Inner>,
}

impl Planner {
    pub fn new(drone: Arc<Drone>) -> Planner {
        let control = drone.add_control_service();
        drone.request_navdata_options(
            "planner",
            NAVDATA_OPT_DEMO | NAVDATA_OPT_GPS | NAVDATA_OPT_MAGNETO,
        );

        Planner {
            drone,
            control,
            inner: Mutex::new(Inner {
                state: AutonomyState::Stopped,
                waypoints: Vec::new(),
                cursor: 0,
                wants_running: false,
                cooldown_until: Utc::now(),
                is_flying: false,
                is_trimmed: false,
                is_calibrated: false,
                needs_calibration: true,
            }),
        }
    }

    pub fn add_waypoint(&self, waypoint: Waypoint) {
        self.inner.lock().unwrap().waypoints.push(waypoint);
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().wants_running = true;
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().wants_running = false;
    }

    /// Call once per host update pass after `Drone::update`. Consumes
    /// the most recently received GPS/Magneto/Demo navdata tracked by
    /// the drone coordinator's last delivered frame.
    pub fn tick(&self, latitude: f64, longitude: f64, heading_unwrapped: f64, nbsat: u32, altitude: i32) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.wants_running && inner.state != AutonomyState::Stopped {
            self.control.hover();
            inner.state = AutonomyState::Stopped;
        }

        if !inner.wants_running {
            return;
        }

        if self.control.has_emergency() {
            inner.state = AutonomyState::Stopped;
            inner.wants_running = false;
            self.control.land();
            return;
        }

        if Utc::now() <= inner.cooldown_until {
            return;
        }

        match inner.state {
            AutonomyState::Stopped => {
                let fly_state = self.control.fly_state();
                inner.is_flying = fly_state == FlyState::Flying;
                inner.is_trimmed = fly_state != FlyState::Landed;
                inner.is_calibrated = false;
                inner.needs_calibration = true;
                inner.state = AutonomyState::Bootstrapping;
            }
            AutonomyState::Bootstrapping => {
                if inner.is_flying && inner.is_calibrated && !inner.needs_calibration && inner.is_trimmed {
                    inner.cooldown_until = Utc::now() + ChronoDuration::seconds(5);
                    inner.cursor = 0;
                    inner.state = AutonomyState::WaitingForGps;
                    return;
                }

                if !inner.is_trimmed {
                    self.control.ftrim();
                    inner.is_trimmed = true;
                    inner.cooldown_until = Utc::now() + ChronoDuration::milliseconds(500);
                    return;
                }

                if !inner.is_flying {
                    self.control.take_off();
                    inner.is_flying = self.control.fly_state() == FlyState::Flying;
                    inner.cooldown_until = Utc::now() + ChronoDuration::seconds(2);
                    return;
                }

                if !inner.is_calibrated || inner.needs_calibration {
                    self.control.calibrate(0);
                    inner.needs_calibration = false;
                    inner.cooldown_until = Utc::now() + ChronoDuration::seconds(5);
                }
            }
            AutonomyState::WaitingForGps => {
                if nbsat >= 4 {
                    inner.cooldown_until = Utc::now() + ChronoDuration::seconds(2);
                    inner.state = AutonomyState::Running;
                }
            }
            AutonomyState::Running => {
                if nbsat < 4 {
                    inner.state = AutonomyState::WaitingForGps;
                    return;
                }
                if inner.cursor >= inner.waypoints.len() {
                    inner.state = AutonomyState::Finished;
                    return;
                }

                let waypoint = inner.waypoints[inner.cursor];
                let done = self.execute_move_to(&waypoint, latitude, longitude, heading_unwrapped, altitude);
                if done {
                    inner.cursor += 1;
                }
            }
            AutonomyState::Finished => {
                self.control.hover();
                inner.wants_running = false;
                inner.state = AutonomyState::Stopped;
            }
        }
    }

    fn execute_move_to(
        &self,
        waypoint: &Waypoint,
        latitude: f64,
        longitude: f64,
        heading_unwrapped: f64,
        altitude: i32,
    ) -> bool {
        let target_heading = heading_to(latitude, longitude, waypoint.latitude, waypoint.longitude);
        let distance = haversine_distance_m(latitude, longitude, waypoint.latitude, waypoint.longitude);

        if (waypoint.altitude - altitude).abs() > ALTITUDE_TOLERANCE_MM {
            let direction = if waypoint.altitude > altitude { 0.5 } else { -0.5 };
            self.control.hover();
            self.control.set_direction(0.0, direction, 0.0);
            self.control.set_angular_speed(0.0);
            return false;
        }

        let diff = (target_heading - heading_unwrapped).abs();
        let mut angular_speed = 0.0f32;
        let mut pitch = 0.0f32;

        if diff >= HEADING_TOLERANCE_DEG {
            let n = diff.clamp(40.0, 180.0);
            let angular = (n / 180.0) as f32;
            angular_speed = if target_heading > heading_unwrapped {
                angular
            } else {
                -angular
            };
        }

        if distance > DISTANCE_TOLERANCE_M {
            pitch = -0.1;
        }

        self.control.set_direction(0.0, 0.0, pitch);
        self.control.set_angular_speed(angular_speed);

        if angular_speed.abs() > 0.01 || pitch.abs() > 0.01 {
            return false;
        }

        self.control.hover();
        true
    }
}

fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

fn heading_to(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlon = lon2 - lon1;
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_to_due_east_is_ninety_degrees() {
        let heading = heading_to(0.0, 0.0, 0.0, 1.0);
        assert!((heading - 90.0).abs() < 1.0);
    }

    #[test]
    fn distance_between_identical_points_is_zero() {
        assert_eq!(haversine_distance_m(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn distance_scales_roughly_with_one_degree_of_longitude_at_equator() {
        let distance = haversine_distance_m(0.0, 0.0, 0.0, 1.0);
        // One degree of longitude at the equator is ~111km.
        assert!((distance - 111_000.0).abs() < 2_000.0);
    }
}
