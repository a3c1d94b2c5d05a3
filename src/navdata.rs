//! Telemetry datagram parsing and the navdata service.
//!
//! Each UDP datagram is a fixed header followed by a run of tagged
//! options (`{tag: u16, size: u16}` + payload), terminated by a
//! `Checksum` option covering every byte that came before it.

use crate::service::{ServiceLogic, State};
use crate::socket::{Socket, SocketResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};

pub const NAVDATA_MAGIC: u32 = 0x5566_7788;

/// Bit in the navdata header's `state` word set while the drone has
/// not yet been told to start streaming full telemetry. Held high
/// until a `general:navdata_demo = TRUE` config push clears it.
pub const NAVDATA_STATE_BOOTSTRAP: u32 = 1 << 11;

/// Bit in the navdata header's `state` word that latches when the
/// drone has entered its emergency/cut-motors state (a hard bump or an
/// explicit emergency AT command).
pub const NAVDATA_STATE_EMERGENCY_MASK: u32 = 1 << 31;

/// Bit in the navdata header's `state` word the drone raises once it
/// has applied a pushed config command, cleared by `CTRL 5 0`.
pub const NAVDATA_STATE_COMMAND_ACK: u32 = 1 << 6;

/// Bit position within the `general:navdata_options` bitmask equals
/// the tag's numeric value, matching the wire protocol this was
/// distilled from.
pub const NAVDATA_TAG_DEMO: u16 = 0;
pub const NAVDATA_TAG_MAGNETO: u16 = 22;
pub const NAVDATA_TAG_GPS: u16 = 27;
pub const NAVDATA_TAG_CHECKSUM: u16 = 0xFFFF;

pub const NAVDATA_OPT_DEMO: u32 = 1 << NAVDATA_TAG_DEMO;
pub const NAVDATA_OPT_MAGNETO: u32 = 1 << NAVDATA_TAG_MAGNETO;
pub const NAVDATA_OPT_GPS: u32 = 1 << NAVDATA_TAG_GPS;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemoOption {
    pub ctrl_state: u32,
    pub battery_percentage: u32,
    pub theta: f32,
    pub phi: f32,
    pub psi: f32,
    pub altitude: i32,
    pub velocity_x: f32,
    pub velocity_y: f32,
    pub velocity_z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagnetoOption {
    pub heading_unwrapped: f32,
    pub magneto_calibration_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsOption {
    pub latitude: f64,
    pub longitude: f64,
    pub nbsat: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavdataOption {
    Demo(DemoOption),
    Magneto(MagnetoOption),
    Gps(GpsOption),
    Unknown { tag: u16, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Navdata {
    pub state: u32,
    pub sequence: u32,
    pub vision_flag: u32,
    pub options: Vec<NavdataOption>,
}

impl Navdata {
    pub fn is_bootstrap(&self) -> bool {
        self.state & NAVDATA_STATE_BOOTSTRAP != 0
    }

    pub fn demo(&self) -> Option<&DemoOption> {
        self.options.iter().find_map(|o| match o {
            NavdataOption::Demo(d) => Some(d),
            _ => None,
        })
    }

    pub fn magneto(&self) -> Option<&MagnetoOption> {
        self.options.iter().find_map(|o| match o {
            NavdataOption::Magneto(m) => Some(m),
            _ => None,
        })
    }

    pub fn gps(&self) -> Option<&GpsOption> {
        self.options.iter().find_map(|o| match o {
            NavdataOption::Gps(g) => Some(g),
            _ => None,
        })
    }
}

/// Sums every byte of `data` into a running `u32`, the checksum
/// algorithm the drone uses for its navdata checksum option.
fn checksum_of(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

#[derive(Debug)]
pub enum ParseError {
    TooShort,
    BadMagic,
    MissingChecksum,
    ChecksumMismatch,
}

/// Parses one navdata datagram, validating its trailing checksum
/// option against every preceding byte.
pub fn parse_navdata(buffer: &[u8]) -> Result<Navdata, ParseError> {
    if buffer.len() < 16 {
        return Err(ParseError::TooShort);
    }

    let mut cursor = Cursor::new(buffer);
    let magic = cursor.read_u32::<LittleEndian>().unwrap();
    if magic != NAVDATA_MAGIC {
        return Err(ParseError::BadMagic);
    }
    let state = cursor.read_u32::<LittleEndian>().unwrap();
    let sequence = cursor.read_u32::<LittleEndian>().unwrap();
    let vision_flag = cursor.read_u32::<LittleEndian>().unwrap();

    let mut options = Vec::new();
    let mut checksum_seen = false;
    let mut checksum_value = 0u32;
    let mut checksum_offset = 0usize;

    loop {
        let option_start = cursor.position() as usize;
        if option_start + 4 > buffer.len() {
            break;
        }
        let tag = cursor.read_u16::<LittleEndian>().unwrap();
        let size = cursor.read_u16::<LittleEndian>().unwrap() as usize;
        let payload_start = cursor.position() as usize;
        if size < 4 || option_start + size > buffer.len() {
            break;
        }
        let payload = &buffer[payload_start..option_start + size];

        if tag == NAVDATA_TAG_CHECKSUM {
            let mut payload_cursor = Cursor::new(payload);
            checksum_value = payload_cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| ParseError::MissingChecksum)?;
            checksum_seen = true;
            checksum_offset = option_start;
            cursor.set_position((option_start + size) as u64);
            break;
        }

        options.push(decode_option(tag, payload));
        cursor.set_position((option_start + size) as u64);
    }

    if !checksum_seen {
        return Err(ParseError::MissingChecksum);
    }

    let computed = checksum_of(&buffer[..checksum_offset]);
    if computed != checksum_value {
        return Err(ParseError::ChecksumMismatch);
    }

    Ok(Navdata {
        state,
        sequence,
        vision_flag,
        options,
    })
}

fn decode_option(tag: u16, payload: &[u8]) -> NavdataOption {
    let mut cursor = Cursor::new(payload);
    match tag {
        NAVDATA_TAG_DEMO => {
            let result = (|| -> std::io::Result<DemoOption> {
                Ok(DemoOption {
                    ctrl_state: cursor.read_u32::<LittleEndian>()?,
                    battery_percentage: cursor.read_u32::<LittleEndian>()?,
                    theta: cursor.read_f32::<LittleEndian>()?,
                    phi: cursor.read_f32::<LittleEndian>()?,
                    psi: cursor.read_f32::<LittleEndian>()?,
                    altitude: cursor.read_i32::<LittleEndian>()?,
                    velocity_x: cursor.read_f32::<LittleEndian>()?,
                    velocity_y: cursor.read_f32::<LittleEndian>()?,
                    velocity_z: cursor.read_f32::<LittleEndian>()?,
                })
            })();
            match result {
                Ok(demo) => NavdataOption::Demo(demo),
                Err(_) => NavdataOption::Unknown {
                    tag,
                    payload: payload.to_vec(),
                },
            }
        }
        NAVDATA_TAG_MAGNETO => {
            let result = (|| -> std::io::Result<MagnetoOption> {
                Ok(MagnetoOption {
                    heading_unwrapped: cursor.read_f32::<LittleEndian>()?,
                    magneto_calibration_ok: cursor.read_u8()? != 0,
                })
            })();
            match result {
                Ok(m) => NavdataOption::Magneto(m),
                Err(_) => NavdataOption::Unknown {
                    tag,
                    payload: payload.to_vec(),
                },
            }
        }
        NAVDATA_TAG_GPS => {
            let result = (|| -> std::io::Result<GpsOption> {
                Ok(GpsOption {
                    latitude: cursor.read_f64::<LittleEndian>()?,
                    longitude: cursor.read_f64::<LittleEndian>()?,
                    nbsat: cursor.read_u32::<LittleEndian>()?,
                })
            })();
            match result {
                Ok(g) => NavdataOption::Gps(g),
                Err(_) => NavdataOption::Unknown {
                    tag,
                    payload: payload.to_vec(),
                },
            }
        }
        other => NavdataOption::Unknown {
            tag: other,
            payload: payload.to_vec(),
        },
    }
}

struct NavdataServiceLogic {
    addr: SocketAddr,
    socket: Option<Socket>,
    last_sequence: u32,
    sender: Sender<Navdata>,
}

impl ServiceLogic for NavdataServiceLogic {
    fn connect(&mut self) -> State {
        match Socket::connect_udp(5554, self.addr) {
            Ok(mut socket) => {
                // 4-byte little-endian `1` is the documented handshake
                // that tells the drone to start streaming navdata here.
                socket.send(&1u32.to_le_bytes());
                self.socket = Some(socket);
                State::Connected
            }
            Err(e) => {
                eprintln!("ardrone: navdata socket connect failed: {}", e);
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

        let mut buffer = [0u8; 4096];
        loop {
            match socket.recv(&mut buffer) {
                SocketResult::Success(n) => match parse_navdata(&buffer[..n]) {
                    Ok(navdata) => {
                        if navdata.sequence <= self.last_sequence && self.last_sequence != 0 {
                            continue;
                        }
                        self.last_sequence = navdata.sequence;
                        let _ = self.sender.send(navdata);
                    }
                    Err(_) => {
                        // Malformed or checksum-mismatched frame: drop
                        // silently, matches telemetry's fire-and-forget
                        // nature.
                        continue;
                    }
                },
                SocketResult::Timeout => break,
                SocketResult::Broken => break,
            }
        }
    }
}

/// Owns the background thread reading and validating navdata
/// datagrams. Parsed frames are handed to the caller (normally the
/// drone coordinator's update loop) through an internal channel
/// rather than via direct callbacks, keeping fan-out policy with the
/// coordinator.
pub struct NavdataService {
    worker: crate::service::ServiceWorker,
    receiver: std::sync::Mutex<Receiver<Navdata>>,
}

impl NavdataService {
    pub fn connect(addr: SocketAddr) -> Self {
        let (sender, receiver) = mpsc::channel();
        let logic = NavdataServiceLogic {
            addr,
            socket: None,
            last_sequence: 0,
            sender,
        };
        let worker = crate::service::ServiceWorker::spawn("navdata", logic);
        NavdataService {
            worker,
            receiver: std::sync::Mutex::new(receiver),
        }
    }

    pub fn state(&self) -> State {
        self.worker.control().state()
    }

    /// Drains every navdata frame received since the last call.
    pub fn drain(&self) -> Vec<Navdata> {
        self.receiver.lock().unwrap().try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(state: u32, sequence: u32, options: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&NAVDATA_MAGIC.to_le_bytes());
        buf.extend_from_slice(&state.to_le_bytes());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());

        for (tag, payload) in options {
            buf.extend_from_slice(&tag.to_le_bytes());
            buf.extend_from_slice(&((4 + payload.len()) as u16).to_le_bytes());
            buf.extend_from_slice(payload);
        }

        let checksum = checksum_of(&buf);
        buf.extend_from_slice(&NAVDATA_TAG_CHECKSUM.to_le_bytes());
        buf.extend_from_slice(&8u16.to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    #[test]
    fn parses_minimal_frame_with_no_options() {
        let frame = build_frame(0, 1, &[]);
        let navdata = parse_navdata(&frame).unwrap();
        assert_eq!(navdata.sequence, 1);
        assert!(navdata.options.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = build_frame(0, 1, &[]);
        frame[0] = 0;
        assert!(matches!(parse_navdata(&frame), Err(ParseError::BadMagic)));
    }

    #[test]
    fn rejects_tampered_checksum() {
        let mut frame = build_frame(0, 1, &[]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            parse_navdata(&frame),
            Err(ParseError::ChecksumMismatch)
        ));
    }

    #[test]
    fn bootstrap_bit_is_detected() {
        let frame = build_frame(NAVDATA_STATE_BOOTSTRAP, 1, &[]);
        let navdata = parse_navdata(&frame).unwrap();
        assert!(navdata.is_bootstrap());
    }

    #[test]
    fn decodes_demo_option() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes()); // ctrl_state
        payload.extend_from_slice(&80u32.to_le_bytes()); // battery
        payload.extend_from_slice(&0.1f32.to_le_bytes());
        payload.extend_from_slice(&0.2f32.to_le_bytes());
        payload.extend_from_slice(&0.3f32.to_le_bytes());
        payload.extend_from_slice(&1500i32.to_le_bytes());
        payload.extend_from_slice(&0.0f32.to_le_bytes());
        payload.extend_from_slice(&0.0f32.to_le_bytes());
        payload.extend_from_slice(&0.0f32.to_le_bytes());

        let frame = build_frame(0, 2, &[(NAVDATA_TAG_DEMO, payload)]);
        let navdata = parse_navdata(&frame).unwrap();
        let demo = navdata.demo().unwrap();
        assert_eq!(demo.battery_percentage, 80);
        assert_eq!(demo.altitude, 1500);
    }

    #[test]
    fn unknown_tags_fall_back_to_raw_payload() {
        let frame = build_frame(0, 3, &[(999, vec![1, 2, 3, 4])]);
        let navdata = parse_navdata(&frame).unwrap();
        assert!(matches!(
            navdata.options[0],
            NavdataOption::Unknown { tag: 999, .. }
        ));
    }
}
