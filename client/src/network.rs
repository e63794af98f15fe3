use crate::ClientError;
use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use shared::{unix_timestamp, ConnectToken, Packet, MAX_PACKET_BYTES};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};

/// Interval between connection request retransmits
const REQUEST_RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Counters collected while the session runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    pub payloads_received: u64,
    pub bytes_received: u64,
    pub last_sequence: u64,
}

/// A connected session with one server from the token's list.
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_index: u32,
    max_clients: u32,
    stats: SessionStats,
}

impl Client {
    /// Redeems `token` against its servers in order. Each server gets
    /// `attempt_timeout` to answer before the next one is tried.
    pub async fn connect(
        token: &ConnectToken,
        attempt_timeout: Duration,
    ) -> Result<Self, ClientError> {
        if token.is_expired(unix_timestamp()) {
            return Err(ClientError::TokenExpired);
        }

        let request = serialize(&Packet::connection_request(token))?;

        for &server_addr in &token.server_addresses {
            info!("Connecting to {}...", server_addr);
            let socket = UdpSocket::bind(unspecified_for(server_addr)).await?;

            match request_connection(&socket, server_addr, &request, attempt_timeout).await? {
                Some((client_index, max_clients)) => {
                    info!(
                        "Connected to {} as client index {} of {}",
                        server_addr, client_index, max_clients
                    );
                    return Ok(Client {
                        socket,
                        server_addr,
                        client_index,
                        max_clients,
                        stats: SessionStats::default(),
                    });
                }
                None => continue,
            }
        }

        Err(ClientError::ConnectionFailed)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn client_index(&self) -> u32 {
        self.client_index
    }

    pub fn max_clients(&self) -> u32 {
        self.max_clients
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Keeps the session alive for `ticks` ticks, counting server payloads.
    pub async fn run(
        &mut self,
        ticks: u64,
        tick_duration: Duration,
    ) -> Result<SessionStats, ClientError> {
        let keep_alive = serialize(&Packet::KeepAlive)?;
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut buffer = [0u8; MAX_PACKET_BYTES * 2];

        while self.stats.ticks < ticks {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    let (len, from) = result?;
                    if from != self.server_addr {
                        continue;
                    }
                    match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => self.handle_packet(packet)?,
                        Err(e) => debug!("Dropping malformed packet from {}: {}", from, e),
                    }
                }
                _ = tick_interval.tick() => {
                    self.socket.send_to(&keep_alive, self.server_addr).await?;
                    self.stats.ticks += 1;
                }
            }
        }

        Ok(self.stats.clone())
    }

    /// Tells the server the session is over.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let packet = serialize(&Packet::Disconnect)?;
        self.socket.send_to(&packet, self.server_addr).await?;
        info!("Disconnected from {}", self.server_addr);
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Payload { sequence, data } => {
                self.stats.payloads_received += 1;
                self.stats.bytes_received += data.len() as u64;
                self.stats.last_sequence = sequence;
            }
            Packet::KeepAlive | Packet::ConnectionAccepted { .. } => {}
            Packet::Disconnect => {
                warn!("Server {} closed the connection", self.server_addr);
                return Err(ClientError::Disconnected);
            }
            other => debug!("Ignoring unexpected packet {:?}", other),
        }
        Ok(())
    }
}

/// Sends `request` until the server accepts, denies, or `attempt_timeout`
/// runs out. Returns the assigned slot on acceptance.
async fn request_connection(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    request: &[u8],
    attempt_timeout: Duration,
) -> Result<Option<(u32, u32)>, ClientError> {
    let deadline = Instant::now() + attempt_timeout;
    let mut resend = interval(REQUEST_RESEND_INTERVAL);
    let mut buffer = [0u8; MAX_PACKET_BYTES * 2];

    loop {
        let event = timeout_at(deadline, async {
            tokio::select! {
                result = socket.recv_from(&mut buffer) => Some(result),
                _ = resend.tick() => None,
            }
        })
        .await;

        match event {
            Err(_) => {
                warn!("No answer from {} within {:?}", server_addr, attempt_timeout);
                return Ok(None);
            }
            Ok(None) => {
                socket.send_to(request, server_addr).await?;
            }
            Ok(Some(result)) => {
                let (len, from) = result?;
                if from != server_addr {
                    continue;
                }
                match deserialize::<Packet>(&buffer[..len]) {
                    Ok(Packet::ConnectionAccepted {
                        client_index,
                        max_clients,
                    }) => return Ok(Some((client_index, max_clients))),
                    Ok(Packet::ConnectionDenied) => {
                        warn!("Connection denied by {}", server_addr);
                        return Ok(None);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Dropping malformed packet from {}: {}", from, e),
                }
            }
        }
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use shared::{PrivateKey, KEY_BYTES, USER_DATA_BYTES};

    fn token_for(addrs: &[SocketAddr], expiry_seconds: u64) -> ConnectToken {
        ConnectToken::generate(
            5,
            addrs,
            0x1122334455667788,
            expiry_seconds,
            1,
            0,
            &[0; USER_DATA_BYTES],
            &PrivateKey::from_bytes([2; KEY_BYTES]),
            &mut OsRng,
        )
        .unwrap()
    }

    #[test]
    fn test_unspecified_matches_family() {
        let v4: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let v6: SocketAddr = "[::1]:40000".parse().unwrap();
        assert!(unspecified_for(v4).is_ipv4());
        assert!(unspecified_for(v6).is_ipv6());
        assert_eq!(unspecified_for(v4).port(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_locally() {
        let token = token_for(&["127.0.0.1:1".parse().unwrap()], 0);
        let result = Client::connect(&token, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ClientError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_silent_servers_fail_connection() {
        // Bound but never answering
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let token = token_for(&[silent.local_addr().unwrap()], 30);

        let result = Client::connect(&token, Duration::from_millis(150)).await;
        assert!(matches!(result, Err(ClientError::ConnectionFailed)));
    }

    #[tokio::test]
    async fn test_denied_server_falls_through_to_next() {
        let denying = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let accepting = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let token = token_for(
            &[denying.local_addr().unwrap(), accepting.local_addr().unwrap()],
            30,
        );

        let answer = |socket: UdpSocket, reply: Packet| async move {
            let mut buffer = [0u8; 2048];
            let (len, from) = socket.recv_from(&mut buffer).await.unwrap();
            let request: Packet = deserialize(&buffer[..len]).unwrap();
            assert!(matches!(request, Packet::ConnectionRequest { .. }));
            socket.send_to(&serialize(&reply).unwrap(), from).await.unwrap();
        };
        tokio::spawn(answer(denying, Packet::ConnectionDenied));
        tokio::spawn(answer(
            accepting,
            Packet::ConnectionAccepted {
                client_index: 3,
                max_clients: 8,
            },
        ));

        let client = Client::connect(&token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(client.server_addr(), token.server_addresses[1]);
        assert_eq!(client.client_index(), 3);
        assert_eq!(client.max_clients(), 8);
    }
}
