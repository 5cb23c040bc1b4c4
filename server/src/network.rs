//! UDP host adapter between a proxy and the admission coordinator

use crate::config::PolicyConfig;
use crate::coordinator::AdmissionCoordinator;
use crate::geo::GeoLookup;
use crate::host::ProxyHost;
use crate::storage::Storage;
use async_trait::async_trait;
use bincode::{deserialize, serialize};
use dashmap::{DashMap, DashSet};
use ipnet::{IpNet, Ipv4Net};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use turnstile_shared::{DenyReason, Notice, Packet, MAX_PACKET_SIZE};
use uuid::Uuid;

/// How long a transfer may take before it counts as failed.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Packets waiting to be written to the socket
#[derive(Debug)]
pub struct OutgoingPacket {
    pub packet: Packet,
    pub addr: SocketAddr,
}

/// Networks whose peers may report player events and send admin commands.
///
/// Packets from any other peer are dropped unread. The default trusts only
/// the loopback interface.
#[derive(Debug, Clone)]
pub struct TrustedPeers {
    networks: Vec<IpNet>,
}

impl TrustedPeers {
    pub fn new(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    pub fn loopback() -> Self {
        let mut networks: Vec<IpNet> = Ipv4Net::new(Ipv4Addr::new(127, 0, 0, 0), 8)
            .map(IpNet::V4)
            .into_iter()
            .collect();
        networks.push(IpNet::from(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        Self::new(networks)
    }

    pub fn allows(&self, peer: IpAddr) -> bool {
        // peers of a dual-stack socket show up as IPv4-mapped addresses
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(peer, IpAddr::V4),
            IpAddr::V4(_) => peer,
        };
        self.networks.iter().any(|network| network.contains(&peer))
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }
}

impl Default for TrustedPeers {
    fn default() -> Self {
        Self::loopback()
    }
}

/// Parses a network in CIDR notation, or a single address.
pub fn parse_network(raw: &str) -> Result<IpNet, String> {
    raw.parse::<IpNet>()
        .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| format!("'{}' is neither an address nor a network", raw))
}

/// `ProxyHost` that talks to the proxy over the server's socket.
///
/// The proxy is whichever trusted peer last reported a player event.
pub struct UdpProxyHost {
    outgoing: mpsc::UnboundedSender<OutgoingPacket>,
    proxy: RwLock<Option<SocketAddr>>,
    online: DashSet<Uuid>,
    pending_transfers: DashMap<Uuid, oneshot::Sender<bool>>,
    transfer_timeout: Duration,
}

impl UdpProxyHost {
    pub fn new(outgoing: mpsc::UnboundedSender<OutgoingPacket>) -> Self {
        Self {
            outgoing,
            proxy: RwLock::new(None),
            online: DashSet::new(),
            pending_transfers: DashMap::new(),
            transfer_timeout: TRANSFER_TIMEOUT,
        }
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    fn set_proxy(&self, addr: SocketAddr) {
        let mut proxy = self.proxy.write();
        if *proxy != Some(addr) {
            info!("Proxy connected from {}", addr);
            *proxy = Some(addr);
        }
    }

    pub fn proxy(&self) -> Option<SocketAddr> {
        *self.proxy.read()
    }

    fn send(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outgoing.send(OutgoingPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_to_proxy(&self, packet: Packet) {
        match self.proxy() {
            Some(addr) => self.send(packet, addr),
            None => warn!("No proxy is connected, dropping {:?}", packet),
        }
    }

    fn player_joined(&self, player: Uuid) {
        self.online.insert(player);
    }

    fn player_left(&self, player: Uuid) {
        self.online.remove(&player);
        // a pending transfer can no longer succeed
        if let Some((_, waiter)) = self.pending_transfers.remove(&player) {
            let _ = waiter.send(false);
        }
    }

    fn complete_transfer(&self, player: Uuid, success: bool) {
        match self.pending_transfers.remove(&player) {
            Some((_, waiter)) => {
                let _ = waiter.send(success);
            }
            None => debug!("Transfer result for {} without a pending transfer", player),
        }
    }
}

#[async_trait]
impl ProxyHost for UdpProxyHost {
    fn is_online(&self, player: Uuid) -> bool {
        self.online.contains(&player)
    }

    async fn transfer(&self, player: Uuid, destination: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        // a replaced waiter resolves as failed
        self.pending_transfers.insert(player, tx);
        self.send_to_proxy(Packet::Transfer {
            player,
            destination: destination.to_string(),
        });

        match tokio::time::timeout(self.transfer_timeout, rx).await {
            Ok(Ok(success)) => success,
            Ok(Err(_)) => false,
            Err(_) => {
                self.pending_transfers.remove(&player);
                warn!("Transfer of {} to {} timed out", player, destination);
                false
            }
        }
    }

    fn notify(&self, player: Uuid, notice: Notice) {
        self.send_to_proxy(Packet::Notify { player, notice });
    }

    fn kick(&self, player: Uuid, reason: DenyReason, message: &str) {
        self.send_to_proxy(Packet::Kick {
            player,
            reason,
            message: message.to_string(),
        });
    }
}

/// UDP front end of the admission engine
pub struct Server {
    socket: Arc<UdpSocket>,
    coordinator: Arc<AdmissionCoordinator>,
    host: Arc<UdpProxyHost>,
    trusted: TrustedPeers,
    outgoing_rx: Option<mpsc::UnboundedReceiver<OutgoingPacket>>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        config: PolicyConfig,
        config_path: Option<PathBuf>,
        storage: Arc<dyn Storage>,
        geo: Arc<dyn GeoLookup>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let host = Arc::new(UdpProxyHost::new(outgoing_tx));
        let mut coordinator = AdmissionCoordinator::new(
            config,
            storage,
            geo,
            Arc::clone(&host) as Arc<dyn ProxyHost>,
        );
        if let Some(path) = config_path {
            coordinator = coordinator.with_config_path(path);
        }

        Ok(Server {
            socket,
            coordinator: Arc::new(coordinator),
            host,
            trusted: TrustedPeers::default(),
            outgoing_rx: Some(outgoing_rx),
        })
    }

    pub fn with_trusted_peers(mut self, trusted: TrustedPeers) -> Self {
        info!("Accepting packets from {:?}", trusted.networks());
        self.trusted = trusted;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn coordinator(&self) -> &Arc<AdmissionCoordinator> {
        &self.coordinator
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut outgoing_rx = match self.outgoing_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        tokio::spawn(async move {
            while let Some(OutgoingPacket { packet, addr }) = outgoing_rx.recv().await {
                if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Receives packets until the socket fails, handling each on its own task.
    pub async fn run(mut self) -> std::io::Result<()> {
        self.spawn_network_sender();
        self.coordinator.start();
        info!("Server started successfully");

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((_, addr)) if !self.trusted.allows(addr.ip()) => {
                    warn!("Dropping packet from untrusted peer {}", addr);
                }
                Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                    Ok(packet) => {
                        let coordinator = Arc::clone(&self.coordinator);
                        let host = Arc::clone(&self.host);
                        tokio::spawn(async move {
                            let reply = handle_packet(&coordinator, &host, packet, addr).await;
                            if let Some(reply) = reply {
                                host.send(reply, addr);
                            }
                        });
                    }
                    Err(_) => warn!("Failed to deserialize packet from {}", addr),
                },
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

async fn send_packet_impl(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Applies one inbound packet. Returns the reply for the sender, if any.
async fn handle_packet(
    coordinator: &Arc<AdmissionCoordinator>,
    host: &UdpProxyHost,
    packet: Packet,
    addr: SocketAddr,
) -> Option<Packet> {
    match packet {
        Packet::PreLogin {
            request_id,
            nickname,
            address,
        } => {
            host.set_proxy(addr);
            let verdict = coordinator.pre_login(&nickname, address).await;
            Some(Packet::LoginResult {
                request_id,
                verdict,
            })
        }

        Packet::PostLogin {
            player,
            session,
            nickname,
            address,
        } => {
            host.set_proxy(addr);
            host.player_joined(player);
            coordinator.post_login(player, session, &nickname, address);
            None
        }

        Packet::Disconnect { player, session } => {
            coordinator.disconnect(player, session);
            if !coordinator.clients().is_online(player) {
                host.player_left(player);
            }
            None
        }

        Packet::Chat { player, message } => {
            coordinator.chat(player, &message);
            None
        }

        Packet::ServerPreConnect {
            request_id,
            player,
            destination,
            exempt,
        } => {
            host.set_proxy(addr);
            let allowed = coordinator.server_pre_connect(player, &destination, exempt);
            Some(Packet::ConnectResult {
                request_id,
                allowed,
            })
        }

        Packet::TransferResult { player, success } => {
            host.complete_transfer(player, success);
            None
        }

        Packet::Admin {
            request_id,
            command,
        } => {
            info!("Admin command from {}: {:?}", addr, command);
            let outcome = coordinator.admin(command).await;
            Some(Packet::AdminResult {
                request_id,
                outcome,
            })
        }

        _ => {
            warn!("Unexpected packet type from {}", addr);
            None
        }
    }
}
