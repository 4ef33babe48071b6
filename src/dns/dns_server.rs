//! CDN Director DNS Server
//!
//! UDP and TCP listeners in front of the [`Dispatcher`]. The UDP socket is
//! also the sending side of the gossip channel, so peers see control
//! messages arrive from the DNS port.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{DnsError, Dispatcher, MAX_TCP_SIZE, MAX_UDP_SIZE};
use crate::config::DnsServerConfig;
use crate::gossip::Outgoing;

/// Receive buffer for UDP datagrams (EDNS-sized queries and gossip vectors)
const UDP_RECV_SIZE: usize = 4096;

/// TCP read timeout
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound DNS listeners
pub struct DnsServer {
    dispatcher: Arc<Dispatcher>,
    udp_socket: Arc<UdpSocket>,
    tcp_listener: TcpListener,
    /// Semaphore for limiting concurrent TCP connections
    tcp_semaphore: Arc<Semaphore>,
}

impl DnsServer {
    /// Bind UDP and TCP on the configured address and port.
    pub async fn bind(config: &DnsServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, DnsError> {
        let addr = SocketAddr::new(config.bind, config.port);

        let udp_socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::ServerError(format!("Failed to bind UDP {}: {}", addr, e)))?;
        // port 0 binds TCP on the same port as UDP
        let udp_addr = udp_socket
            .local_addr()
            .map_err(|e| DnsError::ServerError(format!("UDP local address: {}", e)))?;
        let tcp_listener = TcpListener::bind(udp_addr)
            .await
            .map_err(|e| DnsError::ServerError(format!("Failed to bind TCP {}: {}", udp_addr, e)))?;

        info!("DNS server listening on UDP and TCP {}", udp_addr);

        Ok(Self {
            dispatcher,
            udp_socket: Arc::new(udp_socket),
            tcp_listener,
            tcp_semaphore: Arc::new(Semaphore::new(config.tcp_max_connections)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DnsError> {
        self.udp_socket
            .local_addr()
            .map_err(|e| DnsError::ServerError(format!("UDP local address: {}", e)))
    }

    /// Shared UDP socket, used to send gossip
    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.udp_socket)
    }

    /// Serve until one of the listeners fails
    pub async fn run(self) -> Result<(), DnsError> {
        let Self {
            dispatcher,
            udp_socket,
            tcp_listener,
            tcp_semaphore,
        } = self;

        tokio::select! {
            result = run_udp_server(Arc::clone(&dispatcher), udp_socket) => {
                error!("UDP server stopped: {:?}", result);
                result
            }
            result = run_tcp_server(dispatcher, tcp_listener, tcp_semaphore) => {
                error!("TCP server stopped: {:?}", result);
                result
            }
        }
    }
}

async fn run_udp_server(dispatcher: Arc<Dispatcher>, socket: Arc<UdpSocket>) -> Result<(), DnsError> {
    let mut buf = vec![0u8; UDP_RECV_SIZE];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms
                debug!("UDP recv error: {}", e);
                continue;
            }
        };

        let packet = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let dispatcher = Arc::clone(&dispatcher);

        tokio::spawn(async move {
            if let Some(reply) = dispatcher.handle(&packet, addr.ip(), MAX_UDP_SIZE) {
                if let Err(e) = socket.send_to(&reply, addr).await {
                    debug!("Failed to send UDP response to {}: {}", addr, e);
                }
            }
        });
    }
}

async fn run_tcp_server(
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    semaphore: Arc<Semaphore>,
) -> Result<(), DnsError> {
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| DnsError::ServerError(format!("TCP accept error: {}", e)))?;

        let permit = match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("TCP semaphore full, rejecting connection from {}", addr);
                continue;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, addr, dispatcher).await {
                debug!("TCP connection error from {}: {}", addr, e);
            }
            drop(permit);
        });
    }
}

/// Handle a TCP connection (may include multiple queries)
async fn handle_tcp_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), DnsError> {
    loop {
        // Read 2-byte length prefix
        let mut len_buf = [0u8; 2];
        match timeout(TCP_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }

        let msg_len = u16::from_be_bytes(len_buf) as usize;
        if msg_len == 0 {
            warn!("Empty TCP message from {}", addr);
            break;
        }

        let mut msg_buf = vec![0u8; msg_len];
        match timeout(TCP_TIMEOUT, stream.read_exact(&mut msg_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }

        let Some(reply) = dispatcher.handle(&msg_buf, addr.ip(), MAX_TCP_SIZE) else {
            continue;
        };
        let Some(len_prefix) = length_prefix(&reply) else {
            warn!("TCP reply of {} bytes exceeds the frame limit for {}", reply.len(), addr);
            break;
        };
        if stream.write_all(&len_prefix).await.is_err() {
            break;
        }
        if stream.write_all(&reply).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Big-endian 2-byte TCP frame length, or None past 65535 bytes.
fn length_prefix(reply: &[u8]) -> Option<[u8; 2]> {
    u16::try_from(reply.len()).ok().map(u16::to_be_bytes)
}

/// Send gossip messages to their peers' DNS port. Peers without an IPv4
/// address are skipped. Returns the number of datagrams sent.
pub async fn send_control(socket: &UdpSocket, outgoing: &[Outgoing], port: u16) -> usize {
    let mut sent = 0;
    for message in outgoing {
        let Some(ip) = message.addr else {
            debug!(target: "gossip", peer = %message.peer, "peer has no IPv4 address, not sent");
            continue;
        };
        let id = rand::thread_rng().gen::<u16>();
        let packet = match message.message.encode(id) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(target: "gossip", peer = %message.peer, error = %e, "failed to encode control message");
                continue;
            }
        };
        let target = SocketAddr::new(IpAddr::V4(ip), port);
        match socket.send_to(&packet, target).await {
            Ok(_) => sent += 1,
            Err(e) => {
                debug!(target: "gossip", peer = %message.peer, error = %e, "control message send failed")
            }
        }
    }
    sent
}
