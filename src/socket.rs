//! Minimal UDP/TCP transport wrapper with a fixed 2 second send/recv
//! timeout, matching the drone's own network stack on the other end.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq, Eq)]
pub enum SocketResult {
    /// Success, with the number of bytes sent or received.
    Success(usize),
    Timeout,
    Broken,
}

enum Inner {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

pub struct Socket {
    inner: Inner,
}

impl Socket {
    pub fn connect_udp(local_port: u16, peer: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))?;
        socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        socket.set_write_timeout(Some(SOCKET_TIMEOUT))?;
        socket.connect(peer)?;
        Ok(Socket {
            inner: Inner::Udp(socket),
        })
    }

    pub fn connect_tcp(peer: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(peer)?;
        stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
        Ok(Socket {
            inner: Inner::Tcp(stream),
        })
    }

    pub fn send(&mut self, data: &[u8]) -> SocketResult {
        let result = match &mut self.inner {
            Inner::Udp(socket) => socket.send(data),
            Inner::Tcp(stream) => stream.write(data),
        };

        match result {
            Ok(n) => SocketResult::Success(n),
            Err(e) if is_timeout(&e) => SocketResult::Timeout,
            Err(_) => SocketResult::Broken,
        }
    }

    pub fn recv(&mut self, buffer: &mut [u8]) -> SocketResult {
        let result = match &mut self.inner {
            Inner::Udp(socket) => socket.recv(buffer),
            Inner::Tcp(stream) => stream.read(buffer),
        };

        match result {
            Ok(0) if matches!(self.inner, Inner::Tcp(_)) => SocketResult::Broken,
            Ok(n) => SocketResult::Success(n),
            Err(e) if is_timeout(&e) => SocketResult::Timeout,
            Err(_) => SocketResult::Broken,
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
