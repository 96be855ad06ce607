//! The two external collaborators the dispatcher is written against: a file
//! source (open-by-path returning a byte stream) and a UDP endpoint (blocking
//! send/recv with timed wait). Concrete `std`-backed implementations are
//! provided for the production binary; tests substitute in-memory fakes.

use std::fs::File;
use std::io::{self, Read};
use std::net::{SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Opens files for reading. OCTET and NETASCII both open the same way here;
/// the line-ending rewrite happens in the translator, not at open time.
pub trait FileSource {
    type File: Read;

    fn open(&self, path: &std::path::Path) -> io::Result<Self::File>;
}

/// A blocking, single-socket UDP transport with a timed receive.
pub trait UdpEndpoint {
    /// Waits up to `timeout` for a datagram. `Ok(None)` means the wait
    /// elapsed with nothing received.
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, SocketAddrV4)>>;

    fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<()>;
}

impl<T: UdpEndpoint + ?Sized> UdpEndpoint for &T {
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, SocketAddrV4)>> {
        (**self).recv_timeout(buf, timeout)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        (**self).send_to(buf, addr)
    }
}

/// [`FileSource`] backed by `std::fs`.
pub struct FsFileSource;

impl FileSource for FsFileSource {
    type File = File;

    fn open(&self, path: &std::path::Path) -> io::Result<File> {
        File::open(path)
    }
}

/// [`UdpEndpoint`] backed by a bound `std::net::UdpSocket`.
pub struct StdUdpEndpoint {
    socket: UdpSocket,
}

impl StdUdpEndpoint {
    pub fn bind(addr: std::net::SocketAddrV4) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket })
    }
}

impl UdpEndpoint for StdUdpEndpoint {
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, SocketAddrV4)>> {
        self.socket.set_read_timeout(Some(timeout))?;
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => match addr {
                std::net::SocketAddr::V4(v4) => Ok(Some((n, v4))),
                std::net::SocketAddr::V6(_) => {
                    // IPv6 peers are a non-goal; treat as "nothing usable arrived".
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<()> {
        self.socket.send_to(buf, addr)?;
        Ok(())
    }
}
