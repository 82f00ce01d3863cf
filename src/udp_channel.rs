//! The UDP channel: vehicle discovery.
//!
//! Two independent pieces share a [UdpChannelSockets] pair: a passive
//! listener that republishes unsolicited `VehicleAnnouncement` datagrams to
//! anyone interested, and an active `VehicleIdentificationRequest*`
//! transaction that collects every response arriving within a fixed window,
//! since multiple ECUs/gateways on the same segment may all answer a
//! broadcast request.

use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::codec::{self, PayloadType, DOIP_PORT, PROTOCOL_VERSION_2012, UDP_CHANNEL_MAX};
use crate::error::{SocketError, VehicleInfoError};
use crate::socket::UdpChannelSockets;
use crate::timer::Executor;

/// How long a vehicle-identification request collects responses for.
pub const VEHICLE_IDENTIFICATION_COLLECTION_MS: u64 = 2000;

/// One decoded `VehicleAnnouncement` / vehicle identification response,
/// together with the address it arrived from.
#[derive(Debug, Clone)]
pub struct VehicleInfo {
    /// Raw announcement payload (VIN, logical address, EID, GID, ...).
    pub payload: Vec<u8>,
    /// Source address of the datagram.
    pub from: SocketAddr,
}

/// How a vehicle-identification request selects which ECU(s) should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySelector {
    /// No selector: every ECU on the segment answers.
    Broadcast,
    /// Select by EID.
    Eid([u8; 6]),
    /// Select by VIN.
    Vin([u8; 17]),
}

impl DiscoverySelector {
    fn payload_type(&self) -> PayloadType {
        match self {
            DiscoverySelector::Broadcast => PayloadType::VehicleIdentificationRequest,
            DiscoverySelector::Eid(_) => PayloadType::VehicleIdentificationRequestEid,
            DiscoverySelector::Vin(_) => PayloadType::VehicleIdentificationRequestVin,
        }
    }

    fn payload_bytes(&self) -> Vec<u8> {
        match self {
            DiscoverySelector::Broadcast => Vec::new(),
            DiscoverySelector::Eid(eid) => eid.to_vec(),
            DiscoverySelector::Vin(vin) => vin.to_vec(),
        }
    }
}

/// Owns the UDP socket pair for one `VdConversation` and runs the passive
/// listener thread. Active vehicle-identification transactions are performed
/// on the caller's thread via [UdpChannel::send_vehicle_identification_request],
/// using the shared [Executor] to move the outbound send off whichever
/// thread happens to call it first.
pub struct UdpChannel {
    sockets: Arc<UdpChannelSockets>,
    local_ip: IpAddr,
    executor: Arc<Executor>,
    listener_running: Arc<std::sync::atomic::AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    announcements: Mutex<mpsc::Receiver<VehicleInfo>>,
}

impl UdpChannel {
    /// Binds the broadcast/unicast socket pair on `local_ip` and starts the
    /// passive announcement listener.
    pub fn bind(local_ip: IpAddr) -> Result<Self, SocketError> {
        let sockets = Arc::new(UdpChannelSockets::bind(local_ip)?);
        let executor = Executor::new();
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let listener_sockets = sockets.clone();
        let listener_running = running.clone();
        let listener_local_ip = local_ip;
        let handle = std::thread::spawn(move || {
            listen_for_announcements(listener_sockets, listener_local_ip, listener_running, tx)
        });

        Ok(Self {
            sockets,
            local_ip,
            executor,
            listener_running: running,
            listener: Mutex::new(Some(handle)),
            announcements: Mutex::new(rx),
        })
    }

    /// Drains any `VehicleAnnouncement`s the passive listener has collected
    /// since the last call, without blocking.
    pub fn poll_announcements(&self) -> Vec<VehicleInfo> {
        let rx = self.announcements.lock().unwrap_or_else(|e| e.into_inner());
        rx.try_iter().collect()
    }

    /// Sends a vehicle-identification request to `destination` (typically the
    /// segment's broadcast address) and collects every response that arrives
    /// within [VEHICLE_IDENTIFICATION_COLLECTION_MS].
    pub fn send_vehicle_identification_request(
        &self,
        destination: IpAddr,
        selector: DiscoverySelector,
    ) -> Result<Vec<VehicleInfo>, VehicleInfoError> {
        let frame = codec::compose(PROTOCOL_VERSION_2012, selector.payload_type(), &selector.payload_bytes());
        let target = SocketAddr::new(destination, DOIP_PORT);

        let unicast = self.sockets.unicast.try_clone().map_err(SocketError::from)?;
        let (send_result_tx, send_result_rx) = mpsc::channel();
        self.executor.submit(move || {
            let result = unicast.send_to(&frame, target).map(|_| ());
            let _ = send_result_tx.send(result);
        });
        send_result_rx
            .recv()
            .map_err(|_| VehicleInfoError::SocketError(SocketError::GenericError("executor dropped".into())))?
            .map_err(SocketError::from)?;

        let local_ip = self.local_ip;
        let socket = self.sockets.unicast.try_clone().map_err(SocketError::from)?;
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .map_err(SocketError::from)?;

        let deadline = Instant::now() + Duration::from_millis(VEHICLE_IDENTIFICATION_COLLECTION_MS);
        let mut responses = Vec::new();
        let mut buf = [0u8; (UDP_CHANNEL_MAX as usize) + codec::HEADER_LEN];
        while Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if from.ip() == local_ip {
                        // Self-reception: our own request looped back.
                        continue;
                    }
                    if let Some(info) = decode_announcement(&buf[..n], from) {
                        responses.push(info);
                    }
                }
                Err(e)
                    if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => return Err(VehicleInfoError::SocketError(SocketError::from(e))),
            }
        }
        Ok(responses)
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.listener_running.store(false, std::sync::atomic::Ordering::Relaxed);
    }
}

fn decode_announcement(datagram: &[u8], from: SocketAddr) -> Option<VehicleInfo> {
    if datagram.len() < codec::HEADER_LEN {
        return None;
    }
    match codec::process_header(datagram, PayloadType::udp_accepted_set(), UDP_CHANNEL_MAX) {
        Ok(decoded) => Some(VehicleInfo {
            payload: decoded.payload,
            from,
        }),
        Err(code) => {
            log::debug!("discarding malformed UDP datagram from {}: {}", from, code);
            None
        }
    }
}

fn listen_for_announcements(
    sockets: Arc<UdpChannelSockets>,
    local_ip: IpAddr,
    running: Arc<std::sync::atomic::AtomicBool>,
    tx: mpsc::Sender<VehicleInfo>,
) {
    if sockets.broadcast.set_read_timeout(Some(Duration::from_millis(200))).is_err() {
        log::error!("failed to set read timeout on vehicle announcement listener");
        return;
    }
    let mut buf = [0u8; (UDP_CHANNEL_MAX as usize) + codec::HEADER_LEN];
    while running.load(std::sync::atomic::Ordering::Relaxed) {
        match sockets.broadcast.recv_from(&mut buf) {
            Ok((n, from)) => {
                if from.ip() == local_ip {
                    continue;
                }
                if let Some(info) = decode_announcement(&buf[..n], from) {
                    let _ = tx.send(info);
                }
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                log::error!("vehicle announcement listener error: {}", e);
                break;
            }
        }
    }
}
