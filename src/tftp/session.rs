//! Per-client session state and the table that owns all in-flight sessions.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Instant;

use super::consts::MAX_DATA_PACKET;
use super::netascii::NetasciiTranslator;
use super::Mode;

/// Endpoint identifying a client: (IPv4 address, UDP port). `SocketAddrV4`
/// already has the structural equality and `Hash` this needs.
pub type ClientKey = SocketAddrV4;

/// Per-client state for an in-flight read transfer.
pub struct Session<F> {
    pub file: F,
    pub mode: Mode,
    pub block_number: u16,
    pub last_payload: [u8; MAX_DATA_PACKET],
    pub last_payload_size: usize,
    pub resends: u8,
    pub translator: NetasciiTranslator,
    pub last_action: Instant,
}

impl<F> Session<F> {
    pub fn new(file: F, mode: Mode, now: Instant) -> Self {
        Self {
            file,
            mode,
            block_number: 1,
            last_payload: [0u8; MAX_DATA_PACKET],
            last_payload_size: 0,
            resends: 0,
            translator: NetasciiTranslator::new(),
            last_action: now,
        }
    }

    /// The last DATA sent was short (`< 516` bytes total), i.e. the final
    /// packet of the transfer.
    pub fn is_final_payload(&self) -> bool {
        self.last_payload_size < MAX_DATA_PACKET
    }

    pub fn cache_payload(&mut self, payload: &[u8]) {
        self.last_payload[..payload.len()].copy_from_slice(payload);
        self.last_payload_size = payload.len();
    }

    pub fn last_payload(&self) -> &[u8] {
        &self.last_payload[..self.last_payload_size]
    }

    /// Advance the block number, wrapping 65535 -> 1 (never 0).
    pub fn advance_block(&mut self) {
        self.block_number = if self.block_number == u16::MAX { 1 } else { self.block_number + 1 };
    }
}

/// Owns every in-flight session, keyed by client endpoint.
#[derive(Default)]
pub struct SessionTable<F> {
    sessions: HashMap<ClientKey, Session<F>>,
}

impl<F> SessionTable<F> {
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    pub fn contains(&self, key: &ClientKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &ClientKey) -> Option<&Session<F>> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &ClientKey) -> Option<&mut Session<F>> {
        self.sessions.get_mut(key)
    }

    pub fn insert(&mut self, key: ClientKey, session: Session<F>) {
        self.sessions.insert(key, session);
    }

    /// Removes the session, dropping (and so closing) its open file.
    pub fn remove(&mut self, key: &ClientKey) {
        self.sessions.remove(key);
    }

    /// Evicts every session idle for at least `timeout`, invoking
    /// `on_expire(key)` for each before it is removed.
    pub fn sweep(&mut self, now: Instant, timeout: std::time::Duration, mut on_expire: impl FnMut(&ClientKey)) {
        let expired: Vec<ClientKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_action) >= timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            on_expire(&key);
            self.sessions.remove(&key);
        }
    }
}
