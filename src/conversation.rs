//! The conversation layer: one `DmConversation` per ECU diagnostic session,
//! one `VdConversation` per discovery endpoint. Both share the
//! lifecycle contract the [ConversationManager](crate::manager::ConversationManager)
//! drives them through; their data-carrying operations differ by design (a
//! discovery conversation has no "connect", a diagnostic conversation has no
//! broadcast request) so those stay as inherent methods rather than being
//! forced into one interface.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::codec::DOIP_PORT;
use crate::config::DmConversationConfig;
use crate::error::{ConnectResult, DiagError, DisconnectResult, DmError, VehicleInfoError};
use crate::tcp_channel::TcpChannel;
use crate::udp_channel::{DiscoverySelector, UdpChannel, VehicleInfo};

/// Lifecycle every conversation shares, regardless of what it carries.
/// Mirrors `Startup`/`Shutdown` from the interface this crate's conversation
/// layer is modeled on.
pub trait Conversation: Send + Sync {
    /// The name this conversation is registered under.
    fn name(&self) -> &str;
    /// Brings the conversation's transport up (binds/prepares sockets).
    fn startup(&self) -> Result<(), DmError>;
    /// Tears the conversation's transport down, disconnecting first if needed.
    fn shutdown(&self) -> Result<(), DmError>;
    /// Whether the conversation currently has live transport state that
    /// [ConversationManager::shutdown_all](crate::manager::ConversationManager::shutdown_all)
    /// would need to force-close.
    fn is_active(&self) -> bool;
}

/// One ECU diagnostic session: owns at most one [TcpChannel] at a time,
/// opened on [DmConversation::connect_to_diag_server] and torn down on
/// [DmConversation::disconnect_from_diag_server].
pub struct DmConversation {
    config: DmConversationConfig,
    channel: Mutex<Option<std::sync::Arc<TcpChannel>>>,
}

impl DmConversation {
    /// Builds a conversation from its configuration. No socket is opened yet.
    pub fn new(config: DmConversationConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
        }
    }

    /// Opens a TCP connection to the diagnostic server and performs routing
    /// activation against `target_address`. `ip` overrides the
    /// conversation's configured `Network.TcpIpAddress` when given, matching
    /// the `ConnectToDiagServer(target_addr, ip)` public operation.
    pub fn connect_to_diag_server(&self, target_address: u16, ip: Option<IpAddr>) -> ConnectResult {
        let mut slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            log::debug!("conversation '{}' already connected", self.config.conversation_name);
            return ConnectResult::ConnectFailed;
        }
        let ip = ip.unwrap_or(self.config.network.tcp_ip_address);
        let addr = SocketAddr::new(ip, DOIP_PORT);
        let channel = match TcpChannel::connect_plain(addr, self.config.source_address) {
            Ok(c) => c,
            Err(e) => {
                log::error!("conversation '{}' failed to connect: {}", self.config.conversation_name, e);
                return ConnectResult::ConnectFailed;
            }
        };
        let result = channel.connect(target_address);
        if result == ConnectResult::ConnectSuccess {
            *slot = Some(channel);
        }
        result
    }

    /// Tears down routing activation and closes the socket.
    pub fn disconnect_from_diag_server(&self) -> DisconnectResult {
        let mut slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(channel) => channel.disconnect(),
            None => DisconnectResult::AlreadyDisconnected,
        }
    }

    /// Sends one UDS request and blocks for the final response, using this
    /// conversation's configured P2/P2* timeouts.
    pub fn send_diagnostic_request(&self, uds_request: &[u8]) -> Result<Vec<u8>, DiagError> {
        if uds_request.is_empty() || uds_request.len() > self.config.rx_buffer_size as usize {
            return Err(DiagError::DiagInvalidParameter);
        }
        let slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        let channel = slot.as_ref().ok_or(DiagError::DiagGenericFailure)?.clone();
        drop(slot);
        channel.transmit(
            uds_request,
            self.config.p2_client_max as u64,
            self.config.p2_star_client_max as u64,
        )
    }

    /// `true` once routing activation has succeeded and no disconnect has
    /// happened since.
    pub fn is_connected(&self) -> bool {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.is_activated())
            .unwrap_or(false)
    }
}

impl Conversation for DmConversation {
    fn name(&self) -> &str {
        &self.config.conversation_name
    }

    fn startup(&self) -> Result<(), DmError> {
        // The TCP socket is opened lazily by connect_to_diag_server; nothing
        // needs to happen here beyond the conversation existing.
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DmError> {
        self.disconnect_from_diag_server();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.channel.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// The single vehicle-discovery endpoint every client owns: one per
/// [crate::config::ClientConfig], built from its top-level `UdpIpAddress`/
/// `UdpBroadcastAddress` rather than a named array entry (there is exactly
/// one UDP interface per client).
pub struct VdConversation {
    udp_ip_address: IpAddr,
    udp_broadcast_address: IpAddr,
    channel: Mutex<Option<UdpChannel>>,
    started: AtomicBool,
}

impl VdConversation {
    /// Builds a conversation from the client's UDP addresses. The socket
    /// pair is not bound until [VdConversation::startup].
    pub fn new(udp_ip_address: IpAddr, udp_broadcast_address: IpAddr) -> Self {
        Self {
            udp_ip_address,
            udp_broadcast_address,
            channel: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Broadcasts a vehicle-identification request and collects every
    /// response received within the collection window.
    pub fn send_vehicle_identification_request(
        &self,
        selector: DiscoverySelector,
    ) -> Result<Vec<VehicleInfo>, VehicleInfoError> {
        let slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        let channel = slot.as_ref().ok_or(VehicleInfoError::InvalidParameter)?;
        channel.send_vehicle_identification_request(self.udp_broadcast_address, selector)
    }

    /// Drains unsolicited `VehicleAnnouncement`s collected by the passive
    /// listener since the last call.
    pub fn poll_announcements(&self) -> Vec<VehicleInfo> {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.poll_announcements())
            .unwrap_or_default()
    }
}

impl Conversation for VdConversation {
    fn name(&self) -> &str {
        "VehicleDiscovery"
    }

    fn startup(&self) -> Result<(), DmError> {
        let mut slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        let channel = UdpChannel::bind(self.udp_ip_address)
            .map_err(|e| DmError::InitializationFailed(e.to_string()))?;
        *slot = Some(channel);
        self.started.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DmError> {
        *self.channel.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.started.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}
