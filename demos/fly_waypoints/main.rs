//! Takes off, flies a short GPS waypoint loop with the autonomous
//! planner, then lands.
//!
//! Run with `cargo run --example fly_waypoints`.

use ardrone::{Drone, DroneConfig, DroneState};
use ardrone::planner::{Planner, Waypoint};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let drone = Arc::new(Drone::connect_async(DroneConfig::new(Ipv4Addr::new(
        192, 168, 1, 1,
    ))));

    loop {
        drone.update();
        if drone.state() == DroneState::Connected {
            break;
        }
        if drone.state() == DroneState::ConnectionFailed {
            eprintln!("failed to connect to drone");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let planner = Arc::new(Planner::new(drone.clone()));
    planner.add_waypoint(Waypoint {
        latitude: 52.5200,
        longitude: 13.4050,
        altitude: 1500,
    });
    planner.start();

    let planner_for_navdata = planner.clone();
    drone.subscribe_navdata(move |navdata| {
        if let (Some(demo), Some(gps), Some(magneto)) =
            (navdata.demo(), navdata.gps(), navdata.magneto())
        {
            planner_for_navdata.tick(
                gps.latitude,
                gps.longitude,
                magneto.heading_unwrapped as f64,
                gps.nbsat,
                demo.altitude,
            );
        }
    });

    loop {
        drone.update();
        std::thread::sleep(Duration::from_millis(10));
    }
}
