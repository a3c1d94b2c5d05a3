//! Connects to a drone and prints battery/altitude/attitude from the
//! `Demo` navdata option until interrupted.
//!
//! Run with `cargo run --example telemetry_dump`.

use ardrone::{Drone, DroneConfig, DroneState};
use std::net::Ipv4Addr;
use std::time::Duration;

fn main() {
    let drone = Drone::connect_async(DroneConfig::new(Ipv4Addr::new(192, 168, 1, 1)));
    drone.subscribe_navdata(|navdata| {
        if let Some(demo) = navdata.demo() {
            println!(
                "battery={}% altitude={}mm theta={:.2} phi={:.2} psi={:.2}",
                demo.battery_percentage, demo.altitude, demo.theta, demo.phi, demo.psi
            );
        }
    });

    loop {
        drone.update();
        if drone.state() == DroneState::ConnectionFailed {
            eprintln!("failed to connect to drone");
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
