//! The single-socket event loop: one blocking timed wait, packet
//! classification, and delegation to start-transfer / continue-transfer.
//! Owns the session table exclusively; no other code touches it.
//!
//! Per the concurrency model, a send failure is fatal: every send returns
//! `io::Result<()>` and the failure propagates out of [`Dispatcher::run`],
//! matching the source server's "sendto failure aborts the process" rule.

use std::io::{self, Read};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::codec::{encode_data, encode_error, Packet};
use super::consts::{BLOCK_SIZE, CLIENT_TIMEOUT_SECS, INACTIVE_TIMER_SECS, MAX_DATA_PACKET, MAX_RESENDS, RECV_BUF_SIZE};
use super::io_traits::{FileSource, UdpEndpoint};
use super::path::resolve;
use super::session::{ClientKey, Session, SessionTable};
use super::{ErrorCode, Mode};
use crate::error::ProtocolError;

pub struct Dispatcher<E, F>
where
    E: UdpEndpoint,
    F: FileSource,
{
    endpoint: E,
    files: F,
    root: PathBuf,
    sessions: SessionTable<F::File>,
}

impl<E, F> Dispatcher<E, F>
where
    E: UdpEndpoint,
    F: FileSource,
{
    pub fn new(endpoint: E, files: F, root: impl Into<PathBuf>) -> Self {
        Self { endpoint, files, root: root.into(), sessions: SessionTable::new() }
    }

    /// Runs until `cancel` is signalled, then returns. Dropping `self`
    /// afterwards drops the session table, closing every open file.
    pub fn run(&mut self, cancel: &CancellationToken) -> io::Result<()> {
        let wait = Duration::from_secs(INACTIVE_TIMER_SECS);
        let timeout = Duration::from_secs(CLIENT_TIMEOUT_SECS);

        loop {
            if cancel.is_cancelled() {
                info!("shutdown requested, closing session table");
                return Ok(());
            }

            let mut buf = [0u8; RECV_BUF_SIZE];
            match self.endpoint.recv_timeout(&mut buf, wait)? {
                Some((n, from)) => {
                    debug!("received {n} bytes from {from}");
                    self.handle_datagram(&buf[..n], from)?;
                }
                None => self.sweep_timeouts(timeout)?,
            }
        }
    }

    fn sweep_timeouts(&mut self, timeout: Duration) -> io::Result<()> {
        let now = Instant::now();
        let mut send_err = None;
        let endpoint = &self.endpoint;

        self.sessions.sweep(now, timeout, |key| {
            if send_err.is_some() {
                return;
            }
            warn!("client {key} timed out, evicting session");
            if let Err(e) = Self::send_error_to(endpoint, *key, ErrorCode::Undefined) {
                send_err = Some(e);
            }
        });

        match send_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: ClientKey) -> io::Result<()> {
        match Packet::parse(data) {
            Packet::Read { filename, mode_text } => self.start_transfer(from, filename, mode_text),
            Packet::Ack { block } => self.continue_transfer(from, block),
            Packet::Error => {
                debug!("ERROR packet from {from}, tearing down any session");
                self.sessions.remove(&from);
                Ok(())
            }
            Packet::Unknown => {
                warn!("unrecognized packet from {from}");
                self.send_error(from, ErrorCode::AccessViolation)
            }
        }
    }

    fn start_transfer(&mut self, from: ClientKey, filename: &str, mode_text: &str) -> io::Result<()> {
        if self.sessions.contains(&from) {
            let (block_number, resends) = {
                let session = self.sessions.get(&from).unwrap();
                (session.block_number, session.resends)
            };

            if block_number != 1 {
                warn!("mid-transfer RRQ from {from}, treated as illegal re-request");
                self.send_error(from, ErrorCode::IllegalOp)?;
                self.sessions.remove(&from);
                return Ok(());
            }

            if resends >= MAX_RESENDS {
                warn!("{from} re-requested block 1 past the resend limit, evicting");
                self.send_error(from, ErrorCode::Undefined)?;
                self.sessions.remove(&from);
                return Ok(());
            }

            debug!("resending block 1 to {from} (duplicate RRQ)");
            let mut payload = [0u8; MAX_DATA_PACKET];
            let len = {
                let session = self.sessions.get(&from).unwrap();
                payload[..session.last_payload_size].copy_from_slice(session.last_payload());
                session.last_payload_size
            };
            Self::send_to(&self.endpoint, from, &payload[..len])?;
            self.sessions.get_mut(&from).unwrap().resends += 1;
            return Ok(());
        }

        let Some(path) = resolve(&self.root, filename) else {
            warn!("{from} requested a path containing '..': {filename}");
            return self.send_error(from, ErrorCode::AccessViolation);
        };

        let mode = Mode::parse(mode_text);
        if !matches!(mode, Mode::Netascii | Mode::Octet) {
            warn!("{from} requested unsupported mode '{mode_text}'");
            return self.send_error(from, ErrorCode::IllegalOp);
        }

        let file = match self.files.open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("{from} requested missing file {}: {e}", path.display());
                return self.send_error(from, ErrorCode::FileNotFound);
            }
        };

        info!("RRQ from {from}: {} mode={mode}", path.display());

        let mut session = Session::new(file, mode, Instant::now());
        let payload = read_next_chunk(&mut session, 1);
        Self::send_to(&self.endpoint, from, &payload)?;
        session.cache_payload(&payload);
        self.sessions.insert(from, session);
        Ok(())
    }

    fn continue_transfer(&mut self, from: ClientKey, acked_block: u16) -> io::Result<()> {
        if !self.sessions.contains(&from) {
            warn!("ACK from unknown client {from}");
            return self.send_error(from, ErrorCode::UnknownTid);
        }

        self.sessions.get_mut(&from).unwrap().last_action = Instant::now();

        let block_number = self.sessions.get(&from).unwrap().block_number;
        if acked_block != block_number {
            debug!("{from} ACKed stale/wrong block {acked_block}, expected {block_number}");
            let resends = self.sessions.get(&from).unwrap().resends;
            if resends >= MAX_RESENDS {
                warn!("{from} exhausted retransmissions, evicting");
                self.send_error(from, ErrorCode::Undefined)?;
                self.sessions.remove(&from);
            } else {
                let mut payload = [0u8; MAX_DATA_PACKET];
                let len = {
                    let session = self.sessions.get_mut(&from).unwrap();
                    session.resends += 1;
                    payload[..session.last_payload_size].copy_from_slice(session.last_payload());
                    session.last_payload_size
                };
                Self::send_to(&self.endpoint, from, &payload[..len])?;
            }
            return Ok(());
        }

        if self.sessions.get(&from).unwrap().is_final_payload() {
            info!("transfer to {from} complete");
            self.sessions.remove(&from);
            return Ok(());
        }

        let payload = {
            let session = self.sessions.get_mut(&from).unwrap();
            session.resends = 0;
            session.advance_block();
            read_next_chunk(session, session.block_number)
        };
        Self::send_to(&self.endpoint, from, &payload)?;
        self.sessions.get_mut(&from).unwrap().cache_payload(&payload);
        Ok(())
    }

    fn send_error(&self, to: ClientKey, code: ErrorCode) -> io::Result<()> {
        let err = ProtocolError::new(code, code.message());
        debug!("sending {to} {err}");
        Self::send_error_to(&self.endpoint, to, code)
    }

    fn send_error_to(endpoint: &E, to: ClientKey, code: ErrorCode) -> io::Result<()> {
        let mut buf = [0u8; 64];
        let packet = encode_error(&mut buf, code);
        Self::send_to(endpoint, to, packet)
    }

    fn send_to(endpoint: &E, to: ClientKey, payload: &[u8]) -> io::Result<()> {
        endpoint.send_to(payload, to)
    }
}

/// Produce the DATA payload (header + up to `BLOCK_SIZE` bytes) for the
/// given block number, reading through the translator for NETASCII.
fn read_next_chunk<R: Read>(session: &mut Session<R>, block: u16) -> [u8; MAX_DATA_PACKET] {
    let mut data = [0u8; BLOCK_SIZE];
    let n = match session.mode {
        Mode::Octet => session.file.read(&mut data).unwrap_or(0),
        Mode::Netascii => session.translator.fill_chunk(&mut session.file, &mut data).unwrap_or(0),
        Mode::Mail | Mode::Invalid => unreachable!("sessions are never created in Mail/Invalid mode"),
    };

    let mut buf = [0u8; MAX_DATA_PACKET];
    let written = encode_data(&mut buf, block, &data[..n]).len();
    debug_assert!(written <= MAX_DATA_PACKET);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::io_traits::fakes::{FakeFileSource, FakeUdpEndpoint};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn client(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    fn file_source(files: &[(&str, &[u8])]) -> FakeFileSource {
        FakeFileSource {
            files: files.iter().map(|(name, data)| (PathBuf::from(format!("/root/{name}")), data.to_vec())).collect(),
        }
    }

    fn dispatch_one(endpoint: &FakeUdpEndpoint, dispatcher: &mut Dispatcher<&FakeUdpEndpoint, FakeFileSource>) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        if let Some((n, from)) = endpoint.recv_timeout(&mut buf, Duration::ZERO).unwrap() {
            dispatcher.handle_datagram(&buf[..n], from).unwrap();
        }
    }

    #[test]
    fn small_octet_file_end_to_end() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[("hello.txt", b"Hello\n")]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(1069);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01hello.txt\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        let sent = endpoint.outbound.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b"\x00\x03\x00\x01Hello\n");
        drop(sent);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x01".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        assert!(!dispatcher.sessions.contains(&peer));
    }

    #[test]
    fn exact_multiple_of_block_size_ends_with_empty_data_packet() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[("big.bin", &vec![7u8; 1024])]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(2000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01big.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        assert_eq!(endpoint.outbound.borrow()[0].0.len(), 516);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x01".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        assert_eq!(endpoint.outbound.borrow()[1].0.len(), 516);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x02".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        let third = &endpoint.outbound.borrow()[2].0;
        assert_eq!(third.len(), 4);
        assert!(dispatcher.sessions.contains(&peer));

        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x03".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        assert!(!dispatcher.sessions.contains(&peer));
    }

    #[test]
    fn netascii_expansion_of_single_newline() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[("nl.txt", b"\n")]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(3000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01nl.txt\x00netascii\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        let sent = &endpoint.outbound.borrow()[0].0;
        assert_eq!(sent, b"\x00\x03\x00\x01\r\n");
    }

    #[test]
    fn path_traversal_is_rejected_without_creating_a_session() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(4000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01../etc/passwd\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        let sent = &endpoint.outbound.borrow()[0].0;
        assert_eq!(sent, b"\x00\x05\x00\x02Access violation\x00");
        assert!(!dispatcher.sessions.contains(&peer));
    }

    #[test]
    fn ack_from_unknown_client_yields_unknown_tid() {
        let endpoint = FakeUdpEndpoint::default();
        let mut dispatcher = Dispatcher::new(&endpoint, file_source(&[]), "/root");
        let peer = client(5000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x01".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        let sent = &endpoint.outbound.borrow()[0].0;
        assert_eq!(sent, b"\x00\x05\x00\x05Unknown transfer id\x00");
    }

    #[test]
    fn retransmit_exhaustion_then_unknown_tid() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[("f.bin", b"x")]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(6000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01f.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        endpoint.outbound.borrow_mut().clear();

        // Five mismatched ACKs (block 0) are each resent unchanged.
        for _ in 0..5 {
            endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x00".to_vec(), peer));
            dispatch_one(&endpoint, &mut dispatcher);
        }
        assert_eq!(endpoint.outbound.borrow().len(), 5);
        for sent in endpoint.outbound.borrow().iter() {
            assert_eq!(sent.0, b"\x00\x03\x00\x01x");
        }
        assert!(dispatcher.sessions.contains(&peer));
        endpoint.outbound.borrow_mut().clear();

        // The sixth mismatch exhausts the retry budget.
        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        assert_eq!(endpoint.outbound.borrow()[0].0, b"\x00\x05\x00\x00Undefined\x00");
        assert!(!dispatcher.sessions.contains(&peer));

        // A subsequent ACK from the same client is now unknown-TID.
        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x01".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        assert_eq!(endpoint.outbound.borrow()[1].0, b"\x00\x05\x00\x05Unknown transfer id\x00");
    }

    #[test]
    fn idle_session_is_evicted_on_sweep_with_undefined_error() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[("f.bin", b"x")]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(7000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01f.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        endpoint.outbound.borrow_mut().clear();

        dispatcher.sessions.get_mut(&peer).unwrap().last_action = Instant::now() - Duration::from_secs(6);
        dispatcher.sweep_timeouts(Duration::from_secs(CLIENT_TIMEOUT_SECS)).unwrap();

        assert_eq!(endpoint.outbound.borrow()[0].0, b"\x00\x05\x00\x00Undefined\x00");
        assert!(!dispatcher.sessions.contains(&peer));
    }

    #[test]
    fn unsupported_mode_is_illegal_operation() {
        let endpoint = FakeUdpEndpoint::default();
        let mut dispatcher = Dispatcher::new(&endpoint, file_source(&[("f.bin", b"x")]), "/root");
        let peer = client(8000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01f.bin\x00mail\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        assert_eq!(endpoint.outbound.borrow()[0].0, b"\x00\x05\x00\x04Illegal TFTP operation\x00");
        assert!(!dispatcher.sessions.contains(&peer));
    }

    #[test]
    fn missing_file_yields_file_not_found() {
        let endpoint = FakeUdpEndpoint::default();
        let mut dispatcher = Dispatcher::new(&endpoint, file_source(&[]), "/root");
        let peer = client(8500);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01missing.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        assert_eq!(endpoint.outbound.borrow()[0].0, b"\x00\x05\x00\x01No such file\x00");
    }

    #[test]
    fn unknown_opcode_is_access_violation_without_a_session() {
        let endpoint = FakeUdpEndpoint::default();
        let mut dispatcher = Dispatcher::new(&endpoint, file_source(&[]), "/root");
        let peer = client(9000);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x02f.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        assert_eq!(endpoint.outbound.borrow()[0].0, b"\x00\x05\x00\x02Access violation\x00");
        assert!(!dispatcher.sessions.contains(&peer));
    }

    #[test]
    fn mid_transfer_duplicate_rrq_is_illegal_operation() {
        let endpoint = FakeUdpEndpoint::default();
        let files = file_source(&[("big.bin", &vec![7u8; 1024])]);
        let mut dispatcher = Dispatcher::new(&endpoint, files, "/root");
        let peer = client(9500);

        endpoint.inbound.borrow_mut().push_back((b"\x00\x01big.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        endpoint.inbound.borrow_mut().push_back((b"\x00\x04\x00\x01".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);
        endpoint.outbound.borrow_mut().clear();

        // Block number is now 2; a fresh RRQ mid-transfer is illegal.
        endpoint.inbound.borrow_mut().push_back((b"\x00\x01big.bin\x00octet\x00".to_vec(), peer));
        dispatch_one(&endpoint, &mut dispatcher);

        assert_eq!(endpoint.outbound.borrow()[0].0, b"\x00\x05\x00\x04Illegal TFTP operation\x00");
        assert!(!dispatcher.sessions.contains(&peer));
    }
}
