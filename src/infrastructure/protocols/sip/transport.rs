//! SIP transport layer - UDP towards a single registrar

use super::message::{SipError, SipMessage};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 1000;

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Receiving side of a started transport
#[derive(Debug)]
pub struct TransportChannels {
    pub inbound: mpsc::Receiver<IncomingMessage>,
    pub errors: mpsc::Receiver<SipError>,
}

/// Outbound half of the transport, as seen by the call state machine.
///
/// `send` never waits for a response; replies arrive on the inbound channel.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &SipMessage) -> Result<(), SipError>;
}

/// Local IP the OS would use to reach `remote`.
///
/// Connecting a UDP socket only selects a route, no packet is sent.
pub async fn discover_local_ip(remote: SocketAddr) -> Result<IpAddr, SipError> {
    let bind: SocketAddr = if remote.is_ipv6() {
        "[::]:0".parse()
    } else {
        "0.0.0.0:0".parse()
    }
    .map_err(|e| SipError::Internal(format!("Invalid probe address: {}", e)))?;

    let probe = UdpSocket::bind(bind)
        .await
        .map_err(|e| SipError::TransportError(format!("Failed to bind probe socket: {}", e)))?;
    probe
        .connect(remote)
        .await
        .map_err(|e| SipError::TransportError(format!("No route to {}: {}", remote, e)))?;
    let local = probe
        .local_addr()
        .map_err(|e| SipError::TransportError(format!("Failed to read local address: {}", e)))?;
    Ok(local.ip())
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    remote: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            bind_addr,
            remote,
            socket: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the socket and start delivering parsed messages.
    pub async fn start(&mut self) -> Result<TransportChannels, SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        if let Ok(local) = socket.local_addr() {
            info!("UDP transport listening on {}, registrar {}", local, self.remote);
        }

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let (tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (err_tx, errors) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            Self::receive_loop(socket, tx, err_tx).await;
        });

        Ok(TransportChannels { inbound, errors })
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        tx: mpsc::Sender<IncomingMessage>,
        errors: mpsc::Sender<SipError>,
    ) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // keep-alive CRLFs
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage { message, source };
                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                            let _ = errors.send(e).await;
                        }
                    }
                }
                Err(e) => {
                    let _ = errors
                        .send(SipError::TransportError(format!(
                            "Failed to receive UDP packet: {}",
                            e
                        )))
                        .await;
                    // ICMP unreachable surfaces here on some platforms, keep listening
                    if e.kind() != std::io::ErrorKind::ConnectionReset
                        && e.kind() != std::io::ErrorKind::ConnectionRefused
                    {
                        error!("UDP receive loop stopped: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &SipMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        let data = message.to_bytes();
        debug!("Sending {} ({} bytes) to {}", message.summary(), data.len(), self.remote);

        socket
            .send_to(&data, self.remote)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::DialogFactory;
    use crate::domain::shared::SipUri;

    #[tokio::test]
    async fn test_udp_transport_round_trip() {
        let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let registrar_addr = registrar.local_addr().unwrap();

        let mut transport = UdpTransport::new("127.0.0.1:0".parse().unwrap(), registrar_addr);
        let mut channels = transport.start().await.unwrap();
        let local = transport.local_addr().unwrap();

        let factory = DialogFactory::new("1001", SipUri::server("127.0.0.1"), local);
        let register = factory.new_register(1);
        transport.send(&register.clone().into()).await.unwrap();

        let mut buf = vec![0u8; 65535];
        let (size, from) = registrar.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, local);
        let received = SipMessage::parse(&buf[..size]).unwrap();
        assert_eq!(received.as_request().unwrap().cseq(), Some(1));

        let ok = factory.new_response(&register, 200).unwrap();
        registrar.send_to(&ok.to_bytes(), local).await.unwrap();

        let incoming = channels.inbound.recv().await.unwrap();
        assert_eq!(incoming.source, registrar_addr);
        assert_eq!(incoming.message.as_response().unwrap().status_code(), 200);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = UdpTransport::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:5060".parse().unwrap(),
        );
        let factory = DialogFactory::new(
            "1001",
            SipUri::server("127.0.0.1"),
            "127.0.0.1:5070".parse().unwrap(),
        );

        let result = transport.send(&factory.new_register(1).into()).await;
        assert!(matches!(result, Err(SipError::TransportError(_))));
    }

    #[tokio::test]
    async fn test_discover_local_ip_loopback() {
        let ip = discover_local_ip("127.0.0.1:5060".parse().unwrap()).await.unwrap();
        assert!(ip.is_loopback());
    }
}
