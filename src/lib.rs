//! # ardrone
//!
//! A client library for the AR.Drone 2.0 control protocol: AT command
//! serialization, navdata telemetry parsing, the config service's
//! request/response handshake, a watchdog-paced control loop, and PaVE
//! video frame extraction.
//!
//! The drone speaks four independent network services. This crate
//! runs one worker thread per service (see [`service`]) and exposes
//! them through a single coordinator, [`drone::Drone`], which the host
//! application drives with a non-blocking [`drone::Drone::update`]
//! call from its own loop.
//!
//! ### Example
//!
//! ```no_run
//! use ardrone::{Drone, DroneConfig};
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! let drone = Drone::connect_async(DroneConfig::new(Ipv4Addr::new(192, 168, 1, 1)));
//! let control = drone.add_control_service();
//!
//! loop {
//!     drone.update();
//!     if drone.state() == ardrone::DroneState::Connected {
//!         control.take_off();
//!         break;
//!     }
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! ```

pub mod at;
pub mod config;
pub mod control;
pub mod drone;
pub mod error;
pub mod navdata;
pub mod planner;
pub mod service;
pub mod socket;
pub mod video;

pub use at::{ATCommand, ATService};
pub use config::ConfigService;
pub use control::{ControlService, FlyState};
pub use drone::{Drone, DroneConfig, DroneState};
pub use error::{Error, Result};
pub use navdata::{Navdata, NavdataOption, NavdataService};
pub use planner::{Planner, Waypoint};
pub use video::{PaveHeader, VideoFrame, VideoService};
