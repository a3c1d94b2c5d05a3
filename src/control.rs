//! Control service: turns takeoff/land/emergency intent and a
//! continuously-updated roll/pitch/gaz/yaw setpoint into a periodic
//! `PCMD`+`REF` AT command pair, the watchdog keepalive the drone
//! expects at least every 28ms or it lands itself.

use crate::at::{ATCommand, ATService};
use crate::navdata::Navdata;
use crate::service::{ServiceLogic, State};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum interval between `PCMD`/`REF` pairs; sending any slower
/// than this trips the drone's own command watchdog and it lands.
pub const CONTROL_TICK: Duration = Duration::from_millis(28);

const REF_TAKEOFF_BIT: u32 = 1 << 9;
const REF_EMERGENCY_BIT: u32 = 1 << 8;
/// Bits the drone's firmware always expects set in `REF`, independent
/// of takeoff/emergency intent.
const REF_BASE_BITS: u32 = (1 << 18) | (1 << 20) | (1 << 22) | (1 << 24) | (1 << 28);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlyState {
    Landed,
    TakingOff,
    Flying,
    Landing,
}

impl FlyState {
    /// Derived from the `Demo` option's `ctrl_state` word (top 16
    /// bits), not from the navdata frame's own `state` word — the
    /// emergency latch lives there instead and is tracked separately.
    fn from_ctrl_state(ctrl_state: u32) -> FlyState {
        match (ctrl_state >> 16) & 0xF {
            0 | 1 | 2 => FlyState::Landed,
            6 => FlyState::TakingOff,
            3 | 4 => FlyState::Flying,
            9 => FlyState::Landing,
            _ => FlyState::Landed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Setpoint {
    roll: f32,
    pitch: f32,
    gaz: f32,
    yaw: f32,
}

struct Shared {
    setpoint: Setpoint,
    want_takeoff: bool,
    has_emergency: bool,
    fly_state: FlyState,
    pending_ftrim: bool,
    pending_calibrate: Option<u32>,
}

struct ControlServiceLogic {
    at: Arc<ATService>,
    shared: Arc<Mutex<Shared>>,
    last_send: Option<Instant>,
}

impl ControlServiceLogic {
    fn send_now(&mut self) {
        let mut shared = self.shared.lock().unwrap();

        if shared.pending_ftrim {
            self.at.send(ATCommand::ftrim());
            shared.pending_ftrim = false;
        }
        if let Some(device) = shared.pending_calibrate.take() {
            self.at.send(ATCommand::calib(device));
        }

        let mut ref_bits = REF_BASE_BITS;
        if shared.want_takeoff && !shared.has_emergency {
            ref_bits |= REF_TAKEOFF_BIT;
        }
        if shared.has_emergency {
            ref_bits |= REF_EMERGENCY_BIT;
        }

        let sp = shared.setpoint;
        let hover = sp.roll == 0.0 && sp.pitch == 0.0 && sp.gaz == 0.0 && sp.yaw == 0.0;
        let flag = if hover { 0 } else { 1 };

        self.at.send(ATCommand::pcmd(flag, sp.roll, sp.pitch, sp.gaz, sp.yaw));
        self.at.send(ATCommand::ref_cmd(ref_bits));

        self.last_send = Some(Instant::now());
    }
}

impl ServiceLogic for ControlServiceLogic {
    fn connect(&mut self) -> State {
        State::Connected
    }

    fn tick(&mut self, _wakeup_reason: u8) {
        let due = match self.last_send {
            None => true,
            Some(last) => last.elapsed() >= CONTROL_TICK,
        };
        if due {
            self.send_now();
        }
    }
}

/// Shared handle to the control service. Setpoint/intent mutators take
/// effect on the next scheduled tick, except for the emergency latch
/// which forces an immediate send.
pub struct ControlService {
    worker: crate::service::ServiceWorker,
    shared: Arc<Mutex<Shared>>,
}

impl ControlService {
    pub fn connect(at: Arc<ATService>) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            setpoint: Setpoint::default(),
            want_takeoff: false,
            has_emergency: false,
            fly_state: FlyState::Landed,
            pending_ftrim: false,
            pending_calibrate: None,
        }));
        let logic = ControlServiceLogic {
            at,
            shared: shared.clone(),
            last_send: None,
        };
        let worker = crate::service::ServiceWorker::spawn("control", logic);
        ControlService { worker, shared }
    }

    pub fn state(&self) -> State {
        self.worker.control().state()
    }

    pub fn fly_state(&self) -> FlyState {
        self.shared.lock().unwrap().fly_state
    }

    pub fn has_emergency(&self) -> bool {
        self.shared.lock().unwrap().has_emergency
    }

    pub fn take_off(&self) {
        self.shared.lock().unwrap().want_takeoff = true;
    }

    pub fn land(&self) {
        self.shared.lock().unwrap().want_takeoff = false;
    }

    pub fn hover(&self) {
        self.set_direction(0.0, 0.0, 0.0);
        self.set_angular_speed(0.0);
    }

    pub fn is_hovering(&self) -> bool {
        let sp = self.shared.lock().unwrap().setpoint;
        sp.roll == 0.0 && sp.pitch == 0.0 && sp.gaz == 0.0 && sp.yaw == 0.0
    }

    /// `roll`/`gaz`/`pitch` are clamped to `[-1.0, 1.0]` before being
    /// stored.
    pub fn set_direction(&self, roll: f32, gaz: f32, pitch: f32) {
        let mut shared = self.shared.lock().unwrap();
        shared.setpoint.roll = roll.clamp(-1.0, 1.0);
        shared.setpoint.gaz = gaz.clamp(-1.0, 1.0);
        shared.setpoint.pitch = pitch.clamp(-1.0, 1.0);
    }

    pub fn set_angular_speed(&self, yaw: f32) {
        self.shared.lock().unwrap().setpoint.yaw = yaw.clamp(-1.0, 1.0);
    }

    pub fn ftrim(&self) {
        self.shared.lock().unwrap().pending_ftrim = true;
    }

    pub fn calibrate(&self, device: u32) {
        self.shared.lock().unwrap().pending_calibrate = Some(device);
    }

    /// Manually sets or clears the emergency latch. Clearing it is the
    /// only way out of `Emergency` once the navdata state word has
    /// raised it, matching the drone's own `AT*REF` emergency-reset bit.
    pub fn set_emergency(&self, emergency: bool) {
        self.shared.lock().unwrap().has_emergency = emergency;
    }

    /// Called by the drone coordinator with every fresh navdata frame.
    /// Updates the derived fly state from the `Demo` option (if
    /// present) and, if the frame's own `state` word has just raised
    /// the emergency bit, latches it, drops any pending takeoff
    /// intent, and forces an immediate `PCMD`/`REF` send instead of
    /// waiting for the next tick.
    pub fn process_navdata(&self, navdata: &Navdata) {
        let mut shared = self.shared.lock().unwrap();

        if let Some(demo) = navdata.demo() {
            shared.fly_state = FlyState::from_ctrl_state(demo.ctrl_state);
        }

        let emergency_now = navdata.state & crate::navdata::NAVDATA_STATE_EMERGENCY_MASK != 0;
        let became_emergency = emergency_now && !shared.has_emergency;
        if became_emergency {
            shared.has_emergency = true;
            shared.want_takeoff = false;
        }
        drop(shared);

        if became_emergency {
            self.worker.control().wakeup(crate::service::WAKE_UPDATE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fly_state_maps_takeoff_transition_code() {
        assert_eq!(FlyState::from_ctrl_state(6 << 16), FlyState::TakingOff);
    }

    #[test]
    fn fly_state_maps_flying_codes() {
        assert_eq!(FlyState::from_ctrl_state(3 << 16), FlyState::Flying);
        assert_eq!(FlyState::from_ctrl_state(4 << 16), FlyState::Flying);
    }

    #[test]
    fn ref_bits_always_include_the_base_mask() {
        assert_eq!(REF_BASE_BITS & (1 << 18), 1 << 18);
        assert_eq!(REF_BASE_BITS & (1 << 28), 1 << 28);
    }

    #[test]
    fn emergency_latch_suppresses_takeoff_and_clears_intent() {
        let at = Arc::new(ATService::connect("127.0.0.1:1".parse().unwrap()));
        let control = ControlService::connect(at);
        control.take_off();

        let navdata = Navdata {
            state: crate::navdata::NAVDATA_STATE_EMERGENCY_MASK,
            sequence: 1,
            vision_flag: 0,
            options: vec![],
        };
        control.process_navdata(&navdata);

        assert!(control.has_emergency());
        {
            let shared = control.shared.lock().unwrap();
            assert!(!shared.want_takeoff);
        }

        control.set_emergency(false);
        assert!(!control.has_emergency());
    }
}
