//! AT command model and the AT service that serializes and batches
//! them onto the drone's command UDP port.

use crate::service::{ServiceLogic, ServiceWorker, State, WAKE_DATA_AVAILABLE};
use crate::socket::Socket;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Datagrams larger than this are never sent; the drone's AT parser
/// will not accept more per packet.
pub const MAX_DATAGRAM_BYTES: usize = 1000;

/// A single textual AT command, rendered as `AT*NAME=seq[,args...]\r`
/// once it is assigned a sequence number by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ATCommand {
    name: &'static str,
    args: Vec<String>,
}

impl ATCommand {
    fn new(name: &'static str, args: Vec<String>) -> Self {
        ATCommand { name, args }
    }

    pub fn ref_cmd(bits: u32) -> Self {
        ATCommand::new("REF", vec![bits.to_string()])
    }

    /// `roll`/`pitch`/`gaz`/`yaw` are in `[-1.0, 1.0]` and bitcast to
    /// `i32` the way the drone's firmware expects floats on the wire.
    pub fn pcmd(flag: u32, roll: f32, pitch: f32, gaz: f32, yaw: f32) -> Self {
        ATCommand::new(
            "PCMD",
            vec![
                flag.to_string(),
                encode_float(roll),
                encode_float(pitch),
                encode_float(gaz),
                encode_float(yaw),
            ],
        )
    }

    pub fn ftrim() -> Self {
        ATCommand::new("FTRIM", vec![])
    }

    pub fn calib(device: u32) -> Self {
        ATCommand::new("CALIB", vec![device.to_string()])
    }

    pub fn comwdg() -> Self {
        ATCommand::new("COMWDG", vec![])
    }

    pub fn ctrl(mode: u32, subparam: u32) -> Self {
        ATCommand::new("CTRL", vec![mode.to_string(), subparam.to_string()])
    }

    pub fn config(key: &str, value: &str) -> Self {
        ATCommand::new("CONFIG", vec![quote(key), quote(value)])
    }

    pub fn config_ids(session: &str, user: &str, application: &str) -> Self {
        ATCommand::new(
            "CONFIG_IDS",
            vec![quote(session), quote(user), quote(application)],
        )
    }

    /// Builds an arbitrary positional-argument AT command (e.g. the
    /// undocumented `PMODE`/`MISC` bootstrap commands), with no
    /// quoting applied to the arguments.
    pub fn raw(name: &'static str, args: Vec<String>) -> Self {
        ATCommand::new(name, args)
    }

    fn render(&self, seq: u32) -> String {
        if self.args.is_empty() {
            format!("AT*{}={}\r", self.name, seq)
        } else {
            format!("AT*{}={},{}\r", self.name, seq, self.args.join(","))
        }
    }
}

fn encode_float(value: f32) -> String {
    (value.to_bits() as i32).to_string()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value)
}

struct ATServiceLogic {
    addr: SocketAddr,
    socket: Option<Socket>,
    seq: u32,
    queue: Arc<Mutex<VecDeque<ATCommand>>>,
}

impl ServiceLogic for ATServiceLogic {
    fn connect(&mut self) -> State {
        match Socket::connect_udp(0, self.addr) {
            Ok(socket) => {
                self.socket = Some(socket);
                State::Connected
            }
            Err(e) => {
                eprintln!("ardrone: AT socket connect failed: {}", e);
                State::Disconnected
            }
        }
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }

    fn tick(&mut self, _wakeup_reason: u8) {
        let socket = match &mut self.socket {
            Some(socket) => socket,
            None => return,
        };

        loop {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                return;
            }

            let mut batch = String::new();
            let mut sent = 0;
            while let Some(cmd) = queue.front() {
                let rendered = cmd.render(self.seq + sent);
                if !batch.is_empty() && batch.len() + rendered.len() > MAX_DATAGRAM_BYTES {
                    break;
                }
                batch.push_str(&rendered);
                sent += 1;
                queue.pop_front();
            }
            drop(queue);

            if sent == 0 {
                // A single command exceeds the datagram limit; drop it
                // rather than spin forever.
                eprintln!("ardrone: AT command too large for a single datagram, dropping");
                self.queue.lock().unwrap().pop_front();
                continue;
            }

            self.seq += sent;
            socket.send(batch.as_bytes());
        }
    }
}

/// Owns the background thread that drains the AT command queue onto
/// the wire, batching consecutive commands into a single UDP datagram
/// whenever they fit.
pub struct ATService {
    worker: ServiceWorker,
    queue: Arc<Mutex<VecDeque<ATCommand>>>,
}

impl ATService {
    pub fn connect(addr: SocketAddr) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let logic = ATServiceLogic {
            addr,
            socket: None,
            seq: 1,
            queue: queue.clone(),
        };
        let worker = ServiceWorker::spawn("at", logic);
        ATService { worker, queue }
    }

    pub fn state(&self) -> State {
        self.worker.control().state()
    }

    pub fn send(&self, command: ATCommand) {
        self.queue.lock().unwrap().push_back(command);
        self.worker.control().wakeup(WAKE_DATA_AVAILABLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_command_renders_with_sequence_number() {
        let cmd = ATCommand::ref_cmd(290718208);
        assert_eq!(cmd.render(7), "AT*REF=7,290718208\r");
    }

    #[test]
    fn pcmd_bitcasts_floats_instead_of_formatting_them() {
        let cmd = ATCommand::pcmd(1, 0.5, 0.0, 0.0, 0.0);
        let rendered = cmd.render(1);
        // 0.5f32 bitcast to i32 is a well-known constant.
        assert_eq!(rendered, "AT*PCMD=1,1,1056964608,0,0,0\r");
    }

    #[test]
    fn no_arg_commands_omit_trailing_comma() {
        assert_eq!(ATCommand::ftrim().render(3), "AT*FTRIM=3\r");
    }

    #[test]
    fn config_quotes_key_and_value() {
        let cmd = ATCommand::config("general:navdata_demo", "TRUE");
        assert_eq!(cmd.render(2), "AT*CONFIG=2,\"general:navdata_demo\",\"TRUE\"\r");
    }

    #[test]
    fn batching_respects_the_datagram_byte_limit() {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        for _ in 0..200 {
            queue.lock().unwrap().push_back(ATCommand::ftrim());
        }

        // Simulate one batching pass without a real socket: verify the
        // rendered-length accounting never exceeds the limit for any
        // prefix of the queue.
        let mut seq = 1u32;
        let mut batch_len = 0usize;
        let mut batches = 0usize;
        let mut remaining: VecDeque<ATCommand> = queue.lock().unwrap().clone();
        while let Some(cmd) = remaining.pop_front() {
            let rendered = cmd.render(seq);
            if batch_len != 0 && batch_len + rendered.len() > MAX_DATAGRAM_BYTES {
                assert!(batch_len <= MAX_DATAGRAM_BYTES);
                batch_len = 0;
                batches += 1;
            }
            batch_len += rendered.len();
            seq += 1;
        }
        assert!(batches > 0, "200 FTRIM commands must span multiple datagrams");
    }
}
