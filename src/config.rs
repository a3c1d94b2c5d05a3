//! Config service: push new key/value settings to the drone through
//! the AT command channel, with an acknowledgement handshake carried
//! on the navdata state word, and pull the full configuration over the
//! same TCP connection the service keeps open.

use crate::at::{ATCommand, ATService};
use crate::navdata::NAVDATA_STATE_COMMAND_ACK;
use crate::service::{ServiceLogic, State, WAKE_DATA_AVAILABLE, WAKE_UPDATE};
use crate::socket::{Socket, SocketResult};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

const MAX_RETRIES: u32 = 3;

type Callback = Box<dyn FnOnce(bool) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendSubstate {
    Send,
    AwaitingAck,
    ClearingAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestSubstate {
    ClearStaleAckOrSend,
    Reading,
}

enum CommandKind {
    Send {
        key: String,
        value: String,
        substate: SendSubstate,
    },
    Request {
        substate: RequestSubstate,
    },
}

struct PendingConfigCommand {
    kind: CommandKind,
    retries: u32,
    callback: Option<Callback>,
}

enum CommandResult {
    Proceed,
    Success,
    Failed,
}

/// State the tick loop needs that also changes on every fresh navdata
/// frame; held under one lock so a frame arriving mid-tick can't tear
/// the two apart.
struct Shared {
    queue: VecDeque<PendingConfigCommand>,
    drone_state: u32,
    navdata_consumed: bool,
    config: HashMap<String, String>,
}

struct ConfigServiceLogic {
    at: Arc<ATService>,
    tcp_addr: SocketAddr,
    socket: Option<Socket>,
    shared: Arc<Mutex<Shared>>,
    config_buffer: Vec<u8>,
}

impl ConfigServiceLogic {
    fn handle_send_config(
        &mut self,
        key: &str,
        value: &str,
        substate: &mut SendSubstate,
        drone_state: u32,
    ) -> CommandResult {
        match substate {
            SendSubstate::Send => {
                self.at.send(ATCommand::config_ids("-1", "-1", "-1"));
                self.at.send(ATCommand::config(key, value));
                *substate = SendSubstate::AwaitingAck;
                CommandResult::Proceed
            }
            SendSubstate::AwaitingAck => {
                if drone_state & NAVDATA_STATE_COMMAND_ACK == 0 {
                    *substate = SendSubstate::Send;
                    return CommandResult::Failed;
                }
                self.at.send(ATCommand::ctrl(5, 0));
                *substate = SendSubstate::ClearingAck;
                CommandResult::Proceed
            }
            SendSubstate::ClearingAck => {
                if drone_state & NAVDATA_STATE_COMMAND_ACK != 0 {
                    *substate = SendSubstate::AwaitingAck;
                    return CommandResult::Failed;
                }
                CommandResult::Success
            }
        }
    }

    fn handle_request_config(
        &mut self,
        substate: &mut RequestSubstate,
        drone_state: u32,
    ) -> CommandResult {
        match substate {
            RequestSubstate::ClearStaleAckOrSend => {
                if drone_state & NAVDATA_STATE_COMMAND_ACK != 0 {
                    self.at.send(ATCommand::ctrl(5, 0));
                    return CommandResult::Proceed;
                }
                self.config_buffer.clear();
                self.at.send(ATCommand::ctrl(4, 0));
                *substate = RequestSubstate::Reading;
                CommandResult::Proceed
            }
            RequestSubstate::Reading => {
                let socket = match &mut self.socket {
                    Some(socket) => socket,
                    None => return CommandResult::Failed,
                };
                let mut buf = [0u8; 1024];
                match socket.recv(&mut buf) {
                    SocketResult::Success(n) if n > 0 => {
                        self.config_buffer.extend_from_slice(&buf[..n]);
                        if buf[n - 1] == 0 {
                            CommandResult::Success
                        } else {
                            CommandResult::Proceed
                        }
                    }
                    SocketResult::Success(_) | SocketResult::Timeout => {
                        if drone_state & NAVDATA_STATE_COMMAND_ACK == 0 {
                            *substate = RequestSubstate::ClearStaleAckOrSend;
                            CommandResult::Failed
                        } else {
                            CommandResult::Proceed
                        }
                    }
                    SocketResult::Broken => {
                        self.socket = None;
                        CommandResult::Failed
                    }
                }
            }
        }
    }
}

impl ServiceLogic for ConfigServiceLogic {
    fn connect(&mut self) -> State {
        match Socket::connect_tcp(self.tcp_addr) {
            Ok(socket) => {
                self.socket = Some(socket);
                // Clear any session config left over from a previous
                // client before pulling the current configuration.
                let mut shared = self.shared.lock().unwrap();
                shared.queue.push_back(PendingConfigCommand {
                    kind: CommandKind::Send {
                        key: "custom:session_id".to_string(),
                        value: "-all".to_string(),
                        substate: SendSubstate::Send,
                    },
                    retries: MAX_RETRIES,
                    callback: None,
                });
                shared.queue.push_back(PendingConfigCommand {
                    kind: CommandKind::Request {
                        substate: RequestSubstate::ClearStaleAckOrSend,
                    },
                    retries: MAX_RETRIES,
                    callback: None,
                });
                State::Connected
            }
            Err(e) => {
                eprintln!("ardrone: config socket connect failed: {}", e);
                State::Disconnected
            }
        }
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }

    fn tick(&mut self, _wakeup_reason: u8) {
        let shared_arc = self.shared.clone();
        let mut shared = shared_arc.lock().unwrap();
        if shared.queue.is_empty() || shared.navdata_consumed {
            return;
        }
        shared.navdata_consumed = true;
        let drone_state = shared.drone_state;

        let command = shared.queue.front_mut().unwrap();
        let result = match &mut command.kind {
            CommandKind::Send {
                key,
                value,
                substate,
            } => self.handle_send_config(key.as_str(), value.as_str(), substate, drone_state),
            CommandKind::Request { substate } => {
                self.handle_request_config(substate, drone_state)
            }
        };

        match result {
            CommandResult::Proceed => {}
            CommandResult::Failed => {
                let command = shared.queue.front_mut().unwrap();
                command.retries -= 1;
                if command.retries == 0 {
                    eprintln!("ardrone: config command exhausted retries, dropping");
                    let command = shared.queue.pop_front().unwrap();
                    drop(shared);
                    if let Some(callback) = command.callback {
                        callback(false);
                    }
                }
            }
            CommandResult::Success => {
                let command = shared.queue.pop_front().unwrap();
                if let CommandKind::Send { key, value, .. } = &command.kind {
                    shared.config.insert(key.clone(), value.clone());
                } else {
                    let parsed = parse_config(&self.config_buffer);
                    shared.config.extend(parsed);
                }
                drop(shared);
                if let Some(callback) = command.callback {
                    callback(true);
                }
            }
        }
    }
}

/// Pushes configuration key/value pairs through the AT channel (one
/// outstanding command at a time, FIFO, retried up to three times),
/// pulls the drone's full configuration dump over TCP, and keeps a
/// local map of the latest-known value for every key it has set or
/// fetched.
pub struct ConfigService {
    worker: crate::service::ServiceWorker,
    shared: Arc<Mutex<Shared>>,
}

impl ConfigService {
    pub fn connect(at: Arc<ATService>, tcp_addr: SocketAddr) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            queue: VecDeque::new(),
            drone_state: 0,
            navdata_consumed: true,
            config: HashMap::new(),
        }));
        let logic = ConfigServiceLogic {
            at,
            tcp_addr,
            socket: None,
            shared: shared.clone(),
            config_buffer: Vec::new(),
        };
        let worker = crate::service::ServiceWorker::spawn("config", logic);
        ConfigService { worker, shared }
    }

    pub fn state(&self) -> State {
        self.worker.control().state()
    }

    /// Enqueues a key/value push. `callback` is invoked with `true`
    /// once the three-phase ACK handshake completes and the value is
    /// committed to the local config map, or `false` if it is dropped
    /// after exhausting its retries.
    pub fn send_config<F>(&self, key: &str, value: &str, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.shared.lock().unwrap().queue.push_back(PendingConfigCommand {
            kind: CommandKind::Send {
                key: key.to_string(),
                value: value.to_string(),
                substate: SendSubstate::Send,
            },
            retries: MAX_RETRIES,
            callback: Some(Box::new(callback)),
        });
        self.worker.control().wakeup(WAKE_DATA_AVAILABLE);
    }

    /// Enqueues a full configuration dump fetch; `callback` is invoked
    /// with `true` once the dump has been parsed into the local config
    /// map, or `false` on exhausted retries.
    pub fn fetch_config<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.shared.lock().unwrap().queue.push_back(PendingConfigCommand {
            kind: CommandKind::Request {
                substate: RequestSubstate::ClearStaleAckOrSend,
            },
            retries: MAX_RETRIES,
            callback: Some(Box::new(callback)),
        });
        self.worker.control().wakeup(WAKE_DATA_AVAILABLE);
    }

    /// Returns the latest known value for `key`, from whatever the
    /// last successful send or fetch reported.
    pub fn get_config(&self, key: &str) -> Option<String> {
        self.shared.lock().unwrap().config.get(key).cloned()
    }

    /// Called by the drone coordinator on every fresh navdata frame so
    /// the ack handshake can progress even while no socket I/O is
    /// happening on this thread.
    pub fn process_navdata(&self, state: u32) {
        let mut shared = self.shared.lock().unwrap();
        shared.drone_state = state;
        shared.navdata_consumed = false;
        drop(shared);
        self.worker.control().wakeup(WAKE_UPDATE);
    }
}

fn parse_config(raw: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(raw);
    let mut map = HashMap::new();
    for line in text.split('\n') {
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim_matches(|c: char| c == '\0' || c.is_whitespace());
            if !key.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_trimming_whitespace() {
        let raw = b"general:num_version_config = 1\ncontrol:control_level = 0\n\0";
        let map = parse_config(raw);
        assert_eq!(
            map.get("general:num_version_config").map(String::as_str),
            Some("1")
        );
        assert_eq!(
            map.get("control:control_level").map(String::as_str),
            Some("0")
        );
    }

    #[test]
    fn ignores_lines_without_an_equals_sign() {
        let raw = b"not a config line\nkey = value\n";
        let map = parse_config(raw);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn send_substate_advances_from_send_to_awaiting_ack() {
        let at = Arc::new(ATService::connect("127.0.0.1:1".parse().unwrap()));
        let mut logic = ConfigServiceLogic {
            at,
            tcp_addr: "127.0.0.1:1".parse().unwrap(),
            socket: None,
            shared: Arc::new(Mutex::new(Shared {
                queue: VecDeque::new(),
                drone_state: 0,
                navdata_consumed: true,
                config: HashMap::new(),
            })),
            config_buffer: Vec::new(),
        };
        let mut substate = SendSubstate::Send;
        let result = logic.handle_send_config("k", "v", &mut substate, 0);
        assert!(matches!(result, CommandResult::Proceed));
        assert_eq!(substate, SendSubstate::AwaitingAck);
    }

    #[test]
    fn send_substate_commits_only_after_ack_clears() {
        let at = Arc::new(ATService::connect("127.0.0.1:1".parse().unwrap()));
        let mut logic = ConfigServiceLogic {
            at,
            tcp_addr: "127.0.0.1:1".parse().unwrap(),
            socket: None,
            shared: Arc::new(Mutex::new(Shared {
                queue: VecDeque::new(),
                drone_state: 0,
                navdata_consumed: true,
                config: HashMap::new(),
            })),
            config_buffer: Vec::new(),
        };
        let mut substate = SendSubstate::AwaitingAck;
        let result = logic.handle_send_config("k", "v", &mut substate, NAVDATA_STATE_COMMAND_ACK);
        assert!(matches!(result, CommandResult::Proceed));
        assert_eq!(substate, SendSubstate::ClearingAck);

        let result = logic.handle_send_config("k", "v", &mut substate, NAVDATA_STATE_COMMAND_ACK);
        assert!(matches!(result, CommandResult::Failed));

        let result = logic.handle_send_config("k", "v", &mut substate, 0);
        assert!(matches!(result, CommandResult::Success));
    }
}
