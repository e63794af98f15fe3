//! UDP server side of the secure transport.
//!
//! The server never blocks: `update` drains the non-blocking socket, admits
//! clients presenting a valid connect token, refreshes activity timers and
//! times out idle clients against the logical time the caller passes in.
//! Payloads are queued per client slot until the caller pops them.

use crate::error::TransportError;
use crate::token::PrivateConnectToken;
use crate::{
    unix_timestamp, Packet, PrivateKey, Transport, MAX_CLIENTS, MAX_PAYLOAD_BYTES, NONCE_BYTES,
    VERSION_INFO,
};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

/// Payloads kept per client between two calls to `recv_payload`
const MAX_QUEUED_PAYLOADS: usize = 256;
/// Seconds between keep-alives sent to an otherwise idle client
const KEEP_ALIVE_INTERVAL: f64 = 0.1;
const RECV_BUFFER_BYTES: usize = 2048;

/// One connected client occupying a server slot
#[derive(Debug)]
struct ClientSlot {
    client_id: u64,
    addr: SocketAddr,
    timeout_seconds: i32,
    last_recv_time: f64,
    last_send_time: f64,
    send_sequence: u64,
    inbound: VecDeque<Vec<u8>>,
}

impl ClientSlot {
    fn is_timed_out(&self, time: f64) -> bool {
        self.timeout_seconds > 0 && time - self.last_recv_time > self.timeout_seconds as f64
    }
}

pub struct Server {
    addr: SocketAddr,
    key: PrivateKey,
    protocol_id: u64,
    max_clients: usize,
    socket: Option<UdpSocket>,
    clients: Vec<Option<ClientSlot>>,
    // Redeemed token nonces, kept until the token expires
    used_tokens: HashMap<[u8; NONCE_BYTES], (SocketAddr, u64)>,
    time: f64,
    initialized: bool,
}

impl Server {
    pub fn new(addr: SocketAddr, key: PrivateKey, protocol_id: u64, max_clients: usize) -> Self {
        Self {
            addr,
            key,
            protocol_id,
            max_clients,
            socket: None,
            clients: Vec::new(),
            used_tokens: HashMap::new(),
            time: 0.0,
            initialized: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_listening(&self) -> bool {
        self.socket.is_some()
    }

    pub fn connected_client_count(&self) -> usize {
        self.clients.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn client_id(&self, client_index: usize) -> Option<u64> {
        self.clients
            .get(client_index)
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.client_id)
    }

    fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        let Some(socket) = &self.socket else {
            return;
        };

        match bincode::serialize(packet) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, addr) {
                    debug!("Failed to send packet to {}: {}", addr, e);
                }
            }
            Err(e) => warn!("Failed to serialize packet for {}: {}", addr, e),
        }
    }

    fn find_client_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.clients
            .iter()
            .position(|slot| matches!(slot, Some(client) if client.addr == addr))
    }

    fn find_client_by_id(&self, client_id: u64) -> Option<usize> {
        self.clients
            .iter()
            .position(|slot| matches!(slot, Some(client) if client.client_id == client_id))
    }

    fn receive_packets(&mut self) {
        let mut buffer = [0u8; RECV_BUFFER_BYTES];

        loop {
            let received = match &self.socket {
                Some(socket) => socket.recv_from(&mut buffer),
                None => return,
            };

            match received {
                Ok((len, from)) => match bincode::deserialize::<Packet>(&buffer[..len]) {
                    Ok(packet) => self.handle_packet(packet, from),
                    Err(_) => debug!("Dropping malformed packet from {}", from),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                // ICMP port unreachable from a departed client surfaces here on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!("Error receiving on {}: {}", self.addr, e);
                    return;
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet, from: SocketAddr) {
        match packet {
            Packet::ConnectionRequest {
                version_info,
                protocol_id,
                expire_timestamp,
                nonce,
                private_data,
            } => {
                if version_info != VERSION_INFO || protocol_id != self.protocol_id {
                    debug!("Ignoring connection request with foreign protocol from {}", from);
                    return;
                }
                if expire_timestamp <= unix_timestamp() {
                    debug!("Ignoring expired connect token from {}", from);
                    return;
                }

                let private = match PrivateConnectToken::open(
                    &private_data,
                    &version_info,
                    protocol_id,
                    expire_timestamp,
                    &nonce,
                    &self.key,
                ) {
                    Ok(private) => private,
                    Err(_) => {
                        debug!("Ignoring connect token that failed to open from {}", from);
                        return;
                    }
                };

                self.handle_connection_request(private, nonce, expire_timestamp, from);
            }

            Packet::KeepAlive => {
                if let Some(index) = self.find_client_by_addr(from) {
                    self.touch(index);
                }
            }

            Packet::Payload { data, .. } => {
                if let Some(index) = self.find_client_by_addr(from) {
                    self.touch(index);
                    if let Some(client) = self.clients[index].as_mut() {
                        if client.inbound.len() < MAX_QUEUED_PAYLOADS {
                            client.inbound.push_back(data);
                        }
                    }
                }
            }

            Packet::Disconnect => {
                if let Some(index) = self.find_client_by_addr(from) {
                    self.disconnect_slot(index, false);
                }
            }

            _ => debug!("Unexpected packet type from {}", from),
        }
    }

    fn handle_connection_request(
        &mut self,
        private: PrivateConnectToken,
        nonce: [u8; NONCE_BYTES],
        expire_timestamp: u64,
        from: SocketAddr,
    ) {
        if !private.server_addresses.contains(&self.addr) {
            debug!("Connect token from {} does not name {}", from, self.addr);
            return;
        }

        // Retransmitted request from a client we already admitted
        if let Some(index) = self.find_client_by_addr(from) {
            self.send_packet(&self.accepted_packet(index), from);
            return;
        }

        if let Some((used_by, _)) = self.used_tokens.get(&nonce) {
            if *used_by != from {
                warn!("Connect token reuse attempt from {}", from);
                return;
            }
        }

        if self.find_client_by_id(private.client_id).is_some() {
            debug!("Client {} is already connected", private.client_id);
            self.send_packet(&Packet::ConnectionDenied, from);
            return;
        }

        let Some(index) = self.clients.iter().position(|slot| slot.is_none()) else {
            self.send_packet(&Packet::ConnectionDenied, from);
            return;
        };

        self.used_tokens.insert(nonce, (from, expire_timestamp));
        self.clients[index] = Some(ClientSlot {
            client_id: private.client_id,
            addr: from,
            timeout_seconds: private.timeout_seconds,
            last_recv_time: self.time,
            last_send_time: self.time,
            send_sequence: 0,
            inbound: VecDeque::new(),
        });

        info!(
            "Server {} accepted client {} in slot {} from {}",
            self.addr, private.client_id, index, from
        );
        self.send_packet(&self.accepted_packet(index), from);
    }

    fn accepted_packet(&self, index: usize) -> Packet {
        Packet::ConnectionAccepted {
            client_index: index as u32,
            max_clients: self.max_clients as u32,
        }
    }

    fn touch(&mut self, index: usize) {
        let time = self.time;
        if let Some(client) = self.clients[index].as_mut() {
            client.last_recv_time = time;
        }
    }

    fn disconnect_slot(&mut self, index: usize, notify: bool) {
        if let Some(client) = self.clients[index].take() {
            if notify {
                self.send_packet(&Packet::Disconnect, client.addr);
            }
            info!(
                "Server {} disconnected client {} from slot {}",
                self.addr, client.client_id, index
            );
        }
    }

    fn check_timeouts(&mut self) {
        let time = self.time;
        for index in 0..self.clients.len() {
            let timed_out =
                matches!(&self.clients[index], Some(client) if client.is_timed_out(time));
            if timed_out {
                debug!("Client in slot {} timed out", index);
                self.disconnect_slot(index, true);
            }
        }
    }

    fn send_keep_alives(&mut self) {
        let time = self.time;
        let due: Vec<SocketAddr> = self
            .clients
            .iter_mut()
            .flatten()
            .filter(|client| time - client.last_send_time >= KEEP_ALIVE_INTERVAL)
            .map(|client| {
                client.last_send_time = time;
                client.addr
            })
            .collect();

        for addr in due {
            self.send_packet(&Packet::KeepAlive, addr);
        }
    }

    fn prune_used_tokens(&mut self) {
        let now = unix_timestamp();
        self.used_tokens.retain(|_, (_, expires)| *expires > now);
    }
}

impl Transport for Server {
    fn init(&mut self) -> Result<(), TransportError> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(TransportError::InvalidMaxClients {
                actual: self.max_clients,
                max: MAX_CLIENTS,
            });
        }

        self.clients = (0..self.max_clients).map(|_| None).collect();
        self.initialized = true;
        Ok(())
    }

    fn listen(&mut self) -> Result<(), TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        if self.socket.is_some() {
            return Err(TransportError::AlreadyListening(self.addr));
        }

        let socket = UdpSocket::bind(self.addr).map_err(|source| TransportError::Bind {
            addr: self.addr,
            source,
        })?;
        socket.set_nonblocking(true)?;

        info!("Server listening on {}", self.addr);
        self.socket = Some(socket);
        Ok(())
    }

    fn update(&mut self, time: f64) {
        self.time = time;
        if self.socket.is_none() {
            return;
        }

        self.receive_packets();
        self.check_timeouts();
        self.send_keep_alives();
        self.prune_used_tokens();
    }

    fn max_clients(&self) -> usize {
        self.clients.len()
    }

    fn recv_payload(&mut self, client_index: usize) -> Option<Vec<u8>> {
        self.clients
            .get_mut(client_index)?
            .as_mut()?
            .inbound
            .pop_front()
    }

    fn send_payloads(&mut self, payload: &[u8]) {
        if payload.len() > MAX_PAYLOAD_BYTES {
            warn!(
                "Refusing to send {} byte payload, limit is {}",
                payload.len(),
                MAX_PAYLOAD_BYTES
            );
            return;
        }

        let time = self.time;
        let mut outgoing = Vec::new();
        for client in self.clients.iter_mut().flatten() {
            client.send_sequence += 1;
            client.last_send_time = time;
            outgoing.push((
                client.addr,
                Packet::Payload {
                    sequence: client.send_sequence,
                    data: payload.to_vec(),
                },
            ));
        }

        for (addr, packet) in outgoing {
            self.send_packet(&packet, addr);
        }
    }

    fn stop(&mut self) {
        if self.socket.is_none() {
            return;
        }

        for index in 0..self.clients.len() {
            self.disconnect_slot(index, true);
        }
        self.used_tokens.clear();
        self.socket = None;
        info!("Server {} stopped", self.addr);
    }
}
