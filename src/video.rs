//! Video service: reads the raw H.264 byte stream over TCP, finds
//! PaVE frame headers by scanning for their ASCII signature, and
//! publishes complete frames, resyncing to the next keyframe whenever
//! one arrives so a torn GOP never reaches the caller.

use crate::service::{ServiceLogic, State};
use crate::socket::{Socket, SocketResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};

const PAVE_SIGNATURE: &[u8; 4] = b"PaVE";
const PAVE_HEADER_LEN: usize = 64;
/// Scratch buffer large enough to hold several GOPs worth of
/// 720p-ish H.264 before the reader thread falls behind.
const SCRATCH_BUFFER_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    PSlice,
    IFrame,
    IdrFrame,
    Unknown(u8),
}

impl FrameType {
    fn from_byte(b: u8) -> FrameType {
        match b {
            0 => FrameType::PSlice,
            1 => FrameType::IFrame,
            2 => FrameType::IdrFrame,
            other => FrameType::Unknown(other),
        }
    }

    fn is_keyframe(self) -> bool {
        matches!(self, FrameType::IFrame | FrameType::IdrFrame)
    }
}

/// The PaVE `control` byte: `Data` carries decodable payload, anything
/// else (advertised frame, end-of-stream marker, ...) is metadata the
/// caller never sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Data,
    NonData(u8),
}

impl ControlType {
    fn from_byte(b: u8) -> ControlType {
        match b {
            0 => ControlType::Data,
            other => ControlType::NonData(other),
        }
    }

    fn is_data(self) -> bool {
        matches!(self, ControlType::Data)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaveHeader {
    pub version: u8,
    pub video_codec: u8,
    pub header_size: u16,
    pub payload_size: u32,
    pub encoded_stream_width: u16,
    pub encoded_stream_height: u16,
    pub display_width: u16,
    pub display_height: u16,
    pub frame_number: u32,
    pub frame_type: FrameType,
    pub control: ControlType,
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub header: PaveHeader,
    pub payload: Vec<u8>,
}

fn find_signature(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(PAVE_SIGNATURE.len())
        .position(|w| w == PAVE_SIGNATURE)
}

fn parse_header(buffer: &[u8]) -> Option<PaveHeader> {
    if buffer.len() < PAVE_HEADER_LEN {
        return None;
    }
    let mut cursor = Cursor::new(buffer);
    cursor.set_position(4); // skip signature
    let version = cursor.read_u8().ok()?;
    let video_codec = cursor.read_u8().ok()?;
    let header_size = cursor.read_u16::<LittleEndian>().ok()?;
    let payload_size = cursor.read_u32::<LittleEndian>().ok()?;
    let encoded_stream_width = cursor.read_u16::<LittleEndian>().ok()?;
    let encoded_stream_height = cursor.read_u16::<LittleEndian>().ok()?;
    let display_width = cursor.read_u16::<LittleEndian>().ok()?;
    let display_height = cursor.read_u16::<LittleEndian>().ok()?;
    let frame_number = cursor.read_u32::<LittleEndian>().ok()?;
    let _timestamp = cursor.read_u32::<LittleEndian>().ok()?;
    let _total_chuncks = cursor.read_u8().ok()?;
    let _chunck_index = cursor.read_u8().ok()?;
    let frame_type = FrameType::from_byte(cursor.read_u8().ok()?);
    let control = ControlType::from_byte(cursor.read_u8().ok()?);

    Some(PaveHeader {
        version,
        video_codec,
        header_size,
        payload_size,
        encoded_stream_width,
        encoded_stream_height,
        display_width,
        display_height,
        frame_number,
        frame_type,
        control,
    })
}

/// Extracts every complete frame currently in `buffer[..len]`,
/// returning the frames found and the offset the remaining bytes
/// should be compacted to (the start of the first incomplete frame,
/// or `len` if nothing is left over).
fn extract_frames(buffer: &[u8], len: usize) -> (Vec<VideoFrame>, usize) {
    let mut frames = Vec::new();
    let mut cursor = 0usize;
    let mut frame_begin = len;
    let mut dropped_backlog = false;

    loop {
        let search_region = &buffer[cursor..len];
        let found = match find_signature(search_region) {
            Some(offset) => cursor + offset,
            None => {
                frame_begin = cursor;
                break;
            }
        };

        let header = match parse_header(&buffer[found..len]) {
            Some(h) => h,
            None => {
                frame_begin = found;
                break;
            }
        };

        let header_size = header.header_size as usize;
        let payload_size = header.payload_size as usize;
        let frame_end = found + header_size + payload_size;
        if frame_end > len {
            frame_begin = found;
            break;
        }

        if !header.control.is_data() {
            cursor = frame_end;
            frame_begin = cursor;
            continue;
        }

        if header.frame_type.is_keyframe() && !frames.is_empty() && !dropped_backlog {
            // A new keyframe arrived before we finished draining the
            // previous GOP: drop everything buffered so far and
            // resync on this frame instead of publishing a torn GOP.
            frames.clear();
            dropped_backlog = true;
        }

        frames.push(VideoFrame {
            header,
            payload: buffer[found + header_size..frame_end].to_vec(),
        });

        cursor = frame_end;
        frame_begin = cursor;
    }

    (frames, frame_begin)
}

struct VideoServiceLogic {
    addr: SocketAddr,
    socket: Option<Socket>,
    buffer: Vec<u8>,
    filled: usize,
    sender: Sender<VideoFrame>,
}

impl ServiceLogic for VideoServiceLogic {
    fn connect(&mut self) -> State {
        match Socket::connect_tcp(self.addr) {
            Ok(socket) => {
                self.socket = Some(socket);
                State::Connected
            }
            Err(e) => {
                eprintln!("ardrone: video socket connect failed: {}", e);
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

        if self.filled == self.buffer.len() {
            // Scratch buffer exhausted without a frame boundary; drop
            // everything and resync on whatever comes next.
            eprintln!("ardrone: video scratch buffer full, resetting");
            self.filled = 0;
        }

        match socket.recv(&mut self.buffer[self.filled..]) {
            SocketResult::Success(0) => {}
            SocketResult::Success(n) => {
                self.filled += n;
                let (frames, frame_begin) = extract_frames(&self.buffer, self.filled);
                for frame in frames {
                    let _ = self.sender.send(frame);
                }
                if frame_begin > 0 && frame_begin <= self.filled {
                    self.buffer.copy_within(frame_begin..self.filled, 0);
                    self.filled -= frame_begin;
                }
            }
            SocketResult::Timeout => {}
            SocketResult::Broken => {
                self.socket = None;
            }
        }
    }
}

pub struct VideoService {
    worker: crate::service::ServiceWorker,
    receiver: Receiver<VideoFrame>,
}

impl VideoService {
    pub fn connect(addr: SocketAddr) -> Self {
        let (sender, receiver) = mpsc::channel();
        let logic = VideoServiceLogic {
            addr,
            socket: None,
            buffer: vec![0u8; SCRATCH_BUFFER_SIZE],
            filled: 0,
            sender,
        };
        let worker = crate::service::ServiceWorker::spawn("video", logic);
        VideoService { worker, receiver }
    }

    pub fn state(&self) -> State {
        self.worker.control().state()
    }

    pub fn drain(&self) -> Vec<VideoFrame> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame_with_control(frame_number: u32, frame_type: u8, control: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; PAVE_HEADER_LEN];
        buf[0..4].copy_from_slice(PAVE_SIGNATURE);
        buf[4] = 1; // version
        buf[5] = 1; // codec
        buf[6..8].copy_from_slice(&(PAVE_HEADER_LEN as u16).to_le_bytes());
        buf[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[20..24].copy_from_slice(&frame_number.to_le_bytes());
        buf[30] = frame_type;
        buf[31] = control;
        buf.extend_from_slice(payload);
        buf
    }

    fn build_frame(frame_number: u32, frame_type: u8, payload: &[u8]) -> Vec<u8> {
        build_frame_with_control(frame_number, frame_type, 0, payload)
    }

    #[test]
    fn extracts_a_single_complete_frame() {
        let frame = build_frame(1, 1, b"payload-bytes");
        let (frames, frame_begin) = extract_frames(&frame, frame.len());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"payload-bytes");
        assert_eq!(frame_begin, frame.len());
    }

    #[test]
    fn leaves_incomplete_trailing_frame_for_the_next_read() {
        let mut frame = build_frame(1, 1, b"payload-bytes");
        frame.truncate(frame.len() - 3);
        let (frames, frame_begin) = extract_frames(&frame, frame.len());
        assert!(frames.is_empty());
        assert_eq!(frame_begin, 0);
    }

    #[test]
    fn keyframe_arrival_drops_prior_buffered_backlog() {
        let mut stream = build_frame(1, 0, b"p-slice-1");
        stream.extend(build_frame(2, 1, b"i-frame"));
        let (frames, _) = extract_frames(&stream, stream.len());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.frame_number, 2);
    }

    #[test]
    fn no_signature_leaves_the_whole_buffer_pending() {
        let garbage = vec![0u8; 128];
        let (frames, frame_begin) = extract_frames(&garbage, garbage.len());
        assert!(frames.is_empty());
        assert_eq!(frame_begin, 0);
    }

    #[test]
    fn non_data_frames_are_dropped() {
        let frame = build_frame_with_control(1, 1, 1, b"advertised-bytes");
        let (frames, frame_begin) = extract_frames(&frame, frame.len());
        assert!(frames.is_empty());
        assert_eq!(frame_begin, frame.len());
    }

    #[test]
    fn data_frames_following_a_dropped_frame_are_still_extracted() {
        let mut stream = build_frame_with_control(1, 1, 2, b"end-of-stream-marker");
        stream.extend(build_frame(2, 0, b"p-slice"));
        let (frames, _) = extract_frames(&stream, stream.len());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.frame_number, 2);
    }
}
