use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_api::{Envelope, EnvelopeCodec, NetworkBroker, Policy, RelayError, RelayFuture};

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct UdpBrokerConfig {
    /// Broadcast адрес mesh-сети (e.g., "10.0.0.255").
    pub broadcast_ip: String,
    pub broadcast_port: u16,
    /// Локальный адрес приёма датаграмм.
    pub listen_host: String,
    pub listen_port: u16,
    /// Максимальный размер принимаемой датаграммы.
    pub max_datagram: usize,
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    let target = format!("{host}:{port}");
    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| RelayError::Config(format!("cannot resolve {target}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| RelayError::Config(format!("{target} resolved to no addresses")))
}

// ═══════════════════════════════════════════════════════════════
//  UdpBroker
// ═══════════════════════════════════════════════════════════════

/// UDP вариант NetworkBroker: broadcast через одноразовый сокет,
/// приём через сокет, открытый при создании и живущий вместе с broker'ом.
pub struct UdpBroker {
    broadcast: SocketAddr,
    socket: UdpSocket,
    local: SocketAddr,
    codec: Arc<dyn EnvelopeCodec>,
    max_datagram: usize,
}

impl UdpBroker {
    pub async fn bind(config: &UdpBrokerConfig, codec: Arc<dyn EnvelopeCodec>) -> Result<Self, RelayError> {
        let broadcast = resolve(&config.broadcast_ip, config.broadcast_port).await?;
        let listen = resolve(&config.listen_host, config.listen_port).await?;

        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| RelayError::connection(listen.to_string(), e))?;
        let local = socket
            .local_addr()
            .map_err(|e| RelayError::connection(listen.to_string(), e))?;

        tracing::info!(%local, %broadcast, codec = codec.name(), "udp broker bound");
        Ok(Self {
            broadcast,
            socket,
            local,
            codec,
            max_datagram: config.max_datagram,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send_datagram(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let bytes = self.codec.encode(envelope)?;

        let unspecified = match self.broadcast.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))
            .await
            .map_err(|e| RelayError::network(self.broadcast, e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| RelayError::network(self.broadcast, e))?;

        let sent = socket
            .send_to(&bytes, self.broadcast)
            .await
            .map_err(|e| RelayError::network(self.broadcast, e))?;
        if sent != bytes.len() {
            return Err(RelayError::network(
                self.broadcast,
                format!("short write {sent}/{}", bytes.len()),
            ));
        }

        tracing::debug!(
            channel = %envelope.channel,
            timestamp = envelope.timestamp,
            bytes = sent,
            "datagram broadcast"
        );
        Ok(())
    }

    async fn receive_loop(&self, queue: mpsc::Sender<Envelope>, token: CancellationToken) -> Result<(), RelayError> {
        // +1: датаграмма больше лимита видна как n > max_datagram
        let mut buf = vec![0u8; self.max_datagram + 1];
        tracing::info!(local = %self.local, "udp listener started");

        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => res,
            };

            let (n, peer) = match received {
                Ok(v) => v,
                Err(e) => {
                    skip_or_fail(RelayError::NetworkRead(e.to_string()), None)?;
                    continue;
                }
            };

            let decoded = if n > self.max_datagram {
                Err(RelayError::decode(format!(
                    "datagram exceeds {} bytes",
                    self.max_datagram
                )))
            } else {
                self.codec.decode(&buf[..n])
            };

            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(e) => {
                    skip_or_fail(e, Some((peer, n)))?;
                    continue;
                }
            };

            tracing::debug!(
                %peer,
                channel = %envelope.channel,
                timestamp = envelope.timestamp,
                "datagram received"
            );

            tokio::select! {
                _ = token.cancelled() => break,
                res = queue.send(envelope) => {
                    if res.is_err() {
                        tracing::info!("relay queue closed");
                        break;
                    }
                }
            }
        }

        tracing::info!(local = %self.local, "udp listener stopped");
        Ok(())
    }
}

fn skip_or_fail(err: RelayError, datagram: Option<(SocketAddr, usize)>) -> Result<(), RelayError> {
    match err.policy() {
        Policy::Skip => {
            match datagram {
                Some((peer, bytes)) => tracing::warn!(%peer, bytes, kind = %err.kind(), error = %err, "discarding datagram"),
                None => tracing::warn!(kind = %err.kind(), error = %err, "udp receive failed"),
            }
            Ok(())
        }
        Policy::Fatal => Err(err),
    }
}

impl NetworkBroker for UdpBroker {
    fn name(&self) -> &str {
        "udp"
    }

    fn broadcast(&self, envelope: Envelope) -> RelayFuture<'_, ()> {
        Box::pin(async move { self.send_datagram(&envelope).await })
    }

    fn listen(&self, queue: mpsc::Sender<Envelope>, token: CancellationToken) -> RelayFuture<'_, ()> {
        Box::pin(self.receive_loop(queue, token))
    }
}
