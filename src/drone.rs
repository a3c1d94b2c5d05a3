//! The drone coordinator: owns the mandatory AT/navdata/config
//! services plus any optional ones, drives the connect/connected
//! state machine, and fans telemetry out to subscribers.

use crate::at::{ATCommand, ATService};
use crate::config::ConfigService;
use crate::control::ControlService;
use crate::navdata::{Navdata, NavdataService};
use crate::video::VideoService;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Grace period after entering `Connecting` before giving up if no
/// navdata has arrived at all.
const CONNECTION_FAILED_GRACE: Duration = Duration::from_millis(2100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroneState {
    Disconnected,
    Connecting,
    Connected,
    ConnectionFailed,
}

#[derive(Debug, Clone)]
pub struct DroneConfig {
    pub ip: Ipv4Addr,
    pub at_port: u16,
    pub navdata_port: u16,
    pub config_port: u16,
    pub video_port: u16,
}

impl Default for DroneConfig {
    fn default() -> Self {
        DroneConfig {
            ip: Ipv4Addr::new(192, 168, 1, 1),
            at_port: 5556,
            navdata_port: 5554,
            config_port: 5559,
            video_port: 5555,
        }
    }
}

impl DroneConfig {
    pub fn new(ip: Ipv4Addr) -> Self {
        DroneConfig {
            ip,
            ..Default::default()
        }
    }

    fn at_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.at_port))
    }

    fn navdata_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.navdata_port))
    }

    fn config_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.config_port))
    }

    fn video_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.video_port))
    }
}

type NavdataSubscriber = Box<dyn FnMut(&Navdata) + Send>;

pub struct Drone {
    config: DroneConfig,
    at: Arc<ATService>,
    navdata: NavdataService,
    config_service: ConfigService,
    control: Mutex<Option<Arc<ControlService>>>,
    video: Mutex<Option<VideoService>>,
    state: Mutex<DroneState>,
    connecting_since: Mutex<Instant>,
    seen_any_navdata: AtomicBool,
    subscribers: Mutex<Vec<NavdataSubscriber>>,
    navdata_option_requests: Mutex<HashMap<&'static str, u32>>,
    last_pushed_navdata_options: Mutex<u32>,
    bootstrap_demo_sent: Arc<AtomicBool>,
}

impl Drone {
    /// Creates the mandatory services, sends the undocumented
    /// bootstrap commands the drone expects before anything else, and
    /// enters `Connecting`.
    pub fn connect_async(config: DroneConfig) -> Drone {
        let at = Arc::new(ATService::connect(config.at_addr()));
        let navdata = NavdataService::connect(config.navdata_addr());
        let config_service = ConfigService::connect(at.clone(), config.config_addr());

        at.send(ATCommand::config("custom:session_id", "-1"));
        at.send(ATCommand::config_ids("-1", "-1", "-1"));
        // Undocumented bootstrap sequence the drone expects before it
        // will accept further AT commands reliably.
        at.send(at_plain("PMODE", &["2"]));
        at.send(at_plain("MISC", &["2", "20", "2000", "3000"]));

        Drone {
            config,
            at,
            navdata,
            config_service,
            control: Mutex::new(None),
            video: Mutex::new(None),
            state: Mutex::new(DroneState::Connecting),
            connecting_since: Mutex::new(Instant::now()),
            seen_any_navdata: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            navdata_option_requests: Mutex::new(HashMap::new()),
            last_pushed_navdata_options: Mutex::new(0),
            bootstrap_demo_sent: Arc::new(AtomicBool::new(false)),
        }
        .with_default_navdata_options()
    }

    fn with_default_navdata_options(self) -> Self {
        self.request_navdata_options("core", crate::navdata::NAVDATA_OPT_DEMO);
        self
    }

    pub fn state(&self) -> DroneState {
        *self.state.lock().unwrap()
    }

    pub fn at_service(&self) -> Arc<ATService> {
        self.at.clone()
    }

    pub fn add_control_service(&self) -> Arc<ControlService> {
        let mut slot = self.control.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Arc::new(ControlService::connect(self.at.clone())));
        }
        slot.as_ref().unwrap().clone()
    }

    pub fn control_service(&self) -> Option<Arc<ControlService>> {
        self.control.lock().unwrap().clone()
    }

    pub fn add_video_service(&self) {
        let mut slot = self.video.lock().unwrap();
        if slot.is_none() {
            *slot = Some(VideoService::connect(self.config.video_addr()));
        }
    }

    pub fn subscribe_navdata<F>(&self, callback: F)
    where
        F: FnMut(&Navdata) + Send + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(callback));
    }

    /// Registers (or updates) the navdata option bitmask a named
    /// consumer wants streamed. The aggregate across all consumers is
    /// pushed to the drone whenever it changes.
    pub fn request_navdata_options(&self, consumer: &'static str, mask: u32) {
        self.navdata_option_requests
            .lock()
            .unwrap()
            .insert(consumer, mask);
    }

    pub fn disconnect(&self) {
        *self.state.lock().unwrap() = DroneState::Disconnected;
    }

    /// Drains pending navdata, advances the connect/connected state
    /// machine, fans telemetry out, and pushes any navdata-option or
    /// bootstrap-demo changes. Never blocks.
    pub fn update(&self) {
        let frames = self.navdata.drain();

        for navdata in &frames {
            self.seen_any_navdata.store(true, Ordering::SeqCst);

            let mut state = self.state.lock().unwrap();
            if *state == DroneState::Connecting {
                *state = DroneState::Connected;
            }
            let connected = *state == DroneState::Connected;
            drop(state);

            if let Some(control) = self.control_service() {
                control.process_navdata(navdata);
            }
            self.config_service.process_navdata(navdata.state);

            if connected {
                let mut subscribers = self.subscribers.lock().unwrap();
                for subscriber in subscribers.iter_mut() {
                    subscriber(navdata);
                }
            }

            if navdata.is_bootstrap() && !self.bootstrap_demo_sent.swap(true, Ordering::SeqCst) {
                let sent_flag = self.bootstrap_demo_sent.clone();
                self.config_service
                    .send_config("general:navdata_demo", "TRUE", move |success| {
                        if !success {
                            // Allow the latch to retry on the next bootstrap frame.
                            sent_flag.store(false, Ordering::SeqCst);
                        }
                    });
            }
        }

        if frames.is_empty() {
            let mut state = self.state.lock().unwrap();
            if *state == DroneState::Connecting
                && !self.seen_any_navdata.load(Ordering::SeqCst)
                && self.connecting_since.lock().unwrap().elapsed() >= CONNECTION_FAILED_GRACE
            {
                *state = DroneState::ConnectionFailed;
            }
        }

        self.update_navdata_options();
        std::thread::yield_now();
    }

    fn update_navdata_options(&self) {
        let aggregate: u32 = self
            .navdata_option_requests
            .lock()
            .unwrap()
            .values()
            .fold(0u32, |acc, m| acc | m);

        let mut last = self.last_pushed_navdata_options.lock().unwrap();
        if *last != aggregate {
            self.config_service.send_config(
                "general:navdata_options",
                &aggregate.to_string(),
                |success| {
                    if !success {
                        eprintln!("ardrone: failed to push navdata options");
                    }
                },
            );
            *last = aggregate;
        }
    }
}

fn at_plain(name: &'static str, args: &[&str]) -> ATCommand {
    // PMODE/MISC are raw positional-argument commands, unlike the
    // quoted-string CONFIG/CONFIG_IDS commands.
    ATCommand::raw(name, args.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_documented_ports() {
        let config = DroneConfig::default();
        assert_eq!(config.at_port, 5556);
        assert_eq!(config.navdata_port, 5554);
        assert_eq!(config.config_port, 5559);
        assert_eq!(config.video_port, 5555);
    }
}
