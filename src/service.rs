//! Generic per-service worker thread.
//!
//! Every network-facing part of the drone (AT, navdata, config,
//! control, video, and any user service) runs its own OS thread built
//! on the same shell: a condvar-gated loop that wakes at least every
//! 10ms, drains an accumulated wakeup-reason bitmap, and calls into
//! the service's own [`ServiceLogic::tick`].

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WAIT_GRANULARITY: Duration = Duration::from_millis(10);

pub const WAKE_DATA_AVAILABLE: u8 = 1 << 0;
pub const WAKE_UPDATE: u8 = 1 << 1;
pub const WAKE_SHUTDOWN: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct Shared {
    state: State,
    wakeup_reason: u8,
    can_sleep: bool,
    can_tick: bool,
}

/// Shared wakeup/state bookkeeping for one service, handed to the
/// worker thread and kept by the handle the rest of the crate talks
/// to.
pub struct ServiceControl {
    shared: Mutex<Shared>,
    condvar: Condvar,
}

impl ServiceControl {
    fn new() -> Self {
        ServiceControl {
            shared: Mutex::new(Shared {
                state: State::Disconnected,
                wakeup_reason: 0,
                can_sleep: true,
                can_tick: true,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn state(&self) -> State {
        self.shared.lock().unwrap().state
    }

    fn set_state(&self, state: State) {
        self.shared.lock().unwrap().state = state;
    }

    pub fn wakeup(&self, reason: u8) {
        let mut guard = self.shared.lock().unwrap();
        guard.wakeup_reason |= reason;
        self.condvar.notify_all();
    }

    pub fn set_can_sleep(&self, value: bool) {
        let mut guard = self.shared.lock().unwrap();
        guard.can_sleep = value;
        if !value {
            self.condvar.notify_all();
        }
    }

    pub fn set_can_tick(&self, value: bool) {
        self.shared.lock().unwrap().can_tick = value;
    }

    /// Waits up to 10ms (or returns immediately if sleeping is
    /// disabled or a reason is already pending), then returns the
    /// accumulated wakeup-reason bitmap, resetting it to zero.
    fn wait_and_drain(&self) -> (u8, bool) {
        let mut guard = self.shared.lock().unwrap();
        if guard.can_sleep && guard.wakeup_reason == 0 {
            let (g, _) = self
                .condvar
                .wait_timeout(guard, WAIT_GRANULARITY)
                .unwrap();
            guard = g;
        }
        let reason = guard.wakeup_reason;
        guard.wakeup_reason = 0;
        (reason, guard.can_tick)
    }
}

/// Per-service behaviour plugged into the shared worker shell.
/// `connect`/`disconnect` run once at thread start/stop; `tick` runs
/// on every loop pass (at least once per [`WAIT_GRANULARITY`], more
/// often if woken).
pub trait ServiceLogic: Send {
    fn connect(&mut self) -> State;
    fn disconnect(&mut self) {}
    fn tick(&mut self, wakeup_reason: u8);
}

pub struct ServiceWorker {
    control: Arc<ServiceControl>,
    join: Option<JoinHandle<()>>,
}

impl ServiceWorker {
    pub fn spawn<T: ServiceLogic + 'static>(name: &str, mut logic: T) -> Self {
        let control = Arc::new(ServiceControl::new());
        let worker_control = control.clone();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                worker_control.set_state(State::Connecting);
                let state = logic.connect();
                worker_control.set_state(state);

                loop {
                    let (reason, can_tick) = worker_control.wait_and_drain();
                    if reason & WAKE_SHUTDOWN != 0 {
                        break;
                    }
                    if can_tick {
                        logic.tick(reason);
                    }
                }

                worker_control.set_state(State::Disconnecting);
                logic.disconnect();
                worker_control.set_state(State::Disconnected);
            })
            .expect("failed to spawn service thread");

        ServiceWorker {
            control,
            join: Some(join),
        }
    }

    pub fn control(&self) -> &Arc<ServiceControl> {
        &self.control
    }

    pub fn shutdown(mut self) {
        self.control.wakeup(WAKE_SHUTDOWN);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.control.wakeup(WAKE_SHUTDOWN);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLogic {
        ticks: Arc<AtomicU32>,
    }

    impl ServiceLogic for CountingLogic {
        fn connect(&mut self) -> State {
            State::Connected
        }

        fn tick(&mut self, _wakeup_reason: u8) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn worker_reaches_connected_state_and_ticks() {
        let ticks = Arc::new(AtomicU32::new(0));
        let worker = ServiceWorker::spawn(
            "test",
            CountingLogic {
                ticks: ticks.clone(),
            },
        );

        thread::sleep(Duration::from_millis(50));
        assert_eq!(worker.control().state(), State::Connected);
        assert!(ticks.load(Ordering::SeqCst) > 0);

        worker.shutdown();
    }

    #[test]
    fn wakeup_reasons_accumulate_and_are_drained_together() {
        let control = ServiceControl::new();
        control.wakeup(WAKE_DATA_AVAILABLE);
        control.wakeup(WAKE_UPDATE);

        let (reason, _) = control.wait_and_drain();
        assert_eq!(reason, WAKE_DATA_AVAILABLE | WAKE_UPDATE);

        let (reason, _) = control.wait_and_drain();
        assert_eq!(reason, 0, "reason bitmap must be cleared at top of tick");
    }
}
