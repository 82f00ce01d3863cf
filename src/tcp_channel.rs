//! The TCP channel: one connection, one routing-activation state machine and
//! one diagnostic-message state machine.
//!
//! A `TcpChannel` is read by a dedicated per-connection worker thread, which
//! polls the socket with a short read timeout so it can also observe the
//! shutdown flag, and dispatches complete frames into the state machines
//! under a mutex. Callers (`connect`/`transmit`) block on a [SyncTimer] that
//! the worker thread cancels once a matching response arrives.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::{self, FrameOutcome, PayloadType, PROTOCOL_VERSION_2012, TCP_CHANNEL_MAX};
use crate::error::{ConnectResult, DiagError, DisconnectResult, SocketError};
use crate::socket::{PlainTcpSocket, TcpSocket};
use crate::timer::{SyncTimer, WaitOutcome};

/// Routing-activation timeout (`kDoIPRoutingActivationTimeout`).
pub const ROUTING_ACTIVATION_TIMEOUT_MS: u64 = 1000;
/// How long the channel waits for a positive/negative ack after a diagnostic
/// request (`kDoIPDiagnosticAckTimeout`).
pub const DIAGNOSTIC_ACK_TIMEOUT_MS: u64 = 2000;
/// Routing activation request length, header excluded.
const ROUTING_ACTIVATION_REQUEST_LEN: usize = 7;
/// Default activation type this client requests ("default activation").
const ACTIVATION_TYPE_DEFAULT: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoutingState {
    Idle,
    WaitForResponse,
    Successful,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiagState {
    DiagIdle,
    WaitForAck,
    WaitForResponse,
    RecvdPendingRes,
    Success,
}

struct SharedState {
    routing: RoutingState,
    diag: DiagState,
    /// Populated by the worker thread once a final response (or a
    /// transport-level failure discovered mid-wait) is available.
    last_response: Option<Result<Vec<u8>, DiagError>>,
}

/// Owns one TCP connection to a single ECU and the pair of state machines
/// that govern it. A conversation owns exactly one `TcpChannel`.
pub struct TcpChannel {
    socket: Arc<Mutex<Box<dyn TcpSocket>>>,
    source_address: u16,
    target_address: Mutex<Option<u16>>,
    state: Mutex<SharedState>,
    routing_timer: SyncTimer,
    ack_timer: SyncTimer,
    p2_timer: SyncTimer,
    worker_running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpChannel {
    /// Opens a plain TCP connection to `addr` and starts the per-connection
    /// worker thread. Routing activation has not happened yet; call
    /// [TcpChannel::connect] next.
    pub fn connect_plain(addr: std::net::SocketAddr, source_address: u16) -> Result<Arc<Self>, SocketError> {
        let socket = PlainTcpSocket::connect(addr)?;
        Ok(Self::new(Box::new(socket), source_address))
    }

    /// Wraps an already-established [TcpSocket] (plain or TLS) and starts the
    /// worker thread. Exposed so the TLS variants in [crate::socket] and test
    /// harnesses can supply their own transport.
    pub fn new(socket: Box<dyn TcpSocket>, source_address: u16) -> Arc<Self> {
        // Short poll interval so the worker thread notices shutdown promptly
        // without spinning.
        let _ = socket.set_read_timeout(Some(Duration::from_millis(100)));

        let channel = Arc::new(Self {
            socket: Arc::new(Mutex::new(socket)),
            source_address,
            target_address: Mutex::new(None),
            state: Mutex::new(SharedState {
                routing: RoutingState::Idle,
                diag: DiagState::DiagIdle,
                last_response: None,
            }),
            routing_timer: SyncTimer::new(),
            ack_timer: SyncTimer::new(),
            p2_timer: SyncTimer::new(),
            worker_running: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(None),
        });

        let worker_channel = channel.clone();
        let handle = std::thread::spawn(move || worker_channel.run_worker());
        *channel.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        channel
    }

    fn run_worker(&self) {
        while self.worker_running.load(Ordering::Relaxed) {
            let frame = {
                let mut guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
                codec::read_tcp_frame(&mut **guard, PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX)
            };
            match frame {
                Ok(FrameOutcome::Message(decoded)) => self.dispatch(decoded),
                Ok(FrameOutcome::Nack { code, resynced }) => {
                    log::warn!("DoIP TCP channel NACK 0x{:02X}: {}", code.code(), code);
                    if code.requires_socket_close() || !resynced {
                        self.close_socket();
                        break;
                    }
                }
                Ok(FrameOutcome::Disconnected) => {
                    log::debug!("DoIP TCP peer disconnected");
                    break;
                }
                Err(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {
                    continue;
                }
                Err(e) => {
                    log::error!("DoIP TCP channel read error: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, decoded: codec::DecodedHeader) {
        match decoded.payload_type {
            PayloadType::RoutingActivationResponse => self.on_routing_activation_response(&decoded.payload),
            PayloadType::DiagnosticMessagePosAck => self.on_diag_ack(true),
            PayloadType::DiagnosticMessageNegAck => self.on_diag_ack(false),
            PayloadType::DiagnosticMessage => self.on_diag_message(&decoded.payload),
            PayloadType::AliveCheckRequest => self.on_alive_check_request(),
            _ => log::warn!("unexpected payload type on TCP channel: {:?}", decoded.payload_type),
        }
    }

    fn on_routing_activation_response(&self, payload: &[u8]) {
        if payload.len() < 5 {
            log::error!("malformed RoutingActivationResponse payload");
            return;
        }
        let code = payload[4];
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.routing != RoutingState::WaitForResponse {
            log::warn!("RoutingActivationResponse received outside WaitForResponse state, ignoring");
            return;
        }
        // 0x10 Successful, 0x11 ConfirmationRequired: accepted without
        // performing the confirmation handshake (open question).
        state.routing = if code == 0x10 || code == 0x11 {
            RoutingState::Successful
        } else {
            RoutingState::Failed
        };
        drop(state);
        self.routing_timer.cancel();
    }

    fn on_diag_ack(&self, positive: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.diag != DiagState::WaitForAck {
            log::warn!("diagnostic ack received outside WaitForAck state, ignoring");
            return;
        }
        if positive {
            state.diag = DiagState::WaitForResponse;
        } else {
            state.diag = DiagState::DiagIdle;
            state.last_response = Some(Err(DiagError::DiagNegAckReceived));
        }
        drop(state);
        self.ack_timer.cancel();
    }

    fn on_diag_message(&self, payload: &[u8]) {
        // payload is [SA(2), TA(2), UDS...]; the state machine only cares
        // about the UDS bytes' pending/final classification.
        if payload.len() < 5 {
            log::error!("malformed DiagnosticMessage payload");
            return;
        }
        let uds = &payload[4..];
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.diag {
            DiagState::WaitForResponse | DiagState::RecvdPendingRes => {
                if codec::is_response_pending(uds) {
                    state.diag = DiagState::RecvdPendingRes;
                    drop(state);
                    // Cancels the current P2 wait; the caller re-arms P2*.
                    self.p2_timer.cancel();
                } else {
                    state.diag = DiagState::Success;
                    state.last_response = Some(Ok(uds.to_vec()));
                    drop(state);
                    self.p2_timer.cancel();
                }
            }
            _ => {
                log::warn!("DiagnosticMessage received before ack, rejecting (out of sequence)");
            }
        }
    }

    fn on_alive_check_request(&self) {
        let payload = self.source_address.to_be_bytes().to_vec();
        let frame = codec::compose(PROTOCOL_VERSION_2012, PayloadType::AliveCheckResponse, &payload);
        if let Err(e) = self.write_frame(&frame) {
            log::error!("failed to send AliveCheckResponse: {}", e);
        }
    }

    fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        guard.write_all(frame)
    }

    fn close_socket(&self) {
        let guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        let _ = guard.shutdown();
    }

    /// Performs routing activation against `target_address`, driving the
    /// `Idle -> WaitForResponse -> {Successful|Failed}` state machine.
    /// Blocks up to [ROUTING_ACTIVATION_TIMEOUT_MS].
    pub fn connect(&self, target_address: u16) -> ConnectResult {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.routing != RoutingState::Idle {
                log::debug!("routing activation channel not free");
                return ConnectResult::ConnectFailed;
            }
            state.routing = RoutingState::WaitForResponse;
        }
        *self.target_address.lock().unwrap_or_else(|e| e.into_inner()) = Some(target_address);

        let mut payload = Vec::with_capacity(ROUTING_ACTIVATION_REQUEST_LEN);
        payload.extend_from_slice(&self.source_address.to_be_bytes());
        payload.push(ACTIVATION_TYPE_DEFAULT);
        payload.extend_from_slice(&[0, 0, 0, 0]);
        let frame = codec::compose(PROTOCOL_VERSION_2012, PayloadType::RoutingActivationRequest, &payload);

        if self.write_frame(&frame).is_err() {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).routing = RoutingState::Idle;
            log::error!("routing activation request send failed");
            return ConnectResult::ConnectFailed;
        }

        let outcome = self.routing_timer.wait_for_timeout(Duration::from_millis(ROUTING_ACTIVATION_TIMEOUT_MS));
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            WaitOutcome::TimedOut => {
                state.routing = RoutingState::Idle;
                log::error!("routing activation response timeout");
                ConnectResult::ConnectTimeout
            }
            WaitOutcome::Cancelled => {
                if state.routing == RoutingState::Successful {
                    ConnectResult::ConnectSuccess
                } else {
                    state.routing = RoutingState::Idle;
                    ConnectResult::ConnectFailed
                }
            }
        }
    }

    /// Sends a UDS request and blocks for the final response under the
    /// diagnostic-message state machine. `p2_ms` bounds the wait for the
    /// first response; once a "response pending" (`0x7F SID 0x78`) arrives
    /// the wait is re-armed for up to `p2_star_ms`, repeatedly, with no cap
    /// on the number of pending indications (correctness relies on P2*
    /// alone).
    pub fn transmit(&self, uds_request: &[u8], p2_ms: u64, p2_star_ms: u64) -> Result<Vec<u8>, DiagError> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.routing != RoutingState::Successful {
                log::error!("Routing Activation required, please connect to server first");
                return Err(DiagError::DiagGenericFailure);
            }
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.diag != DiagState::DiagIdle {
                return Err(DiagError::DiagBusyProcessing);
            }
            state.diag = DiagState::WaitForAck;
            state.last_response = None;
        }

        let target = self
            .target_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or(DiagError::DiagGenericFailure)?;

        let mut payload = Vec::with_capacity(4 + uds_request.len());
        payload.extend_from_slice(&self.source_address.to_be_bytes());
        payload.extend_from_slice(&target.to_be_bytes());
        payload.extend_from_slice(uds_request);
        let frame = codec::compose(PROTOCOL_VERSION_2012, PayloadType::DiagnosticMessage, &payload);

        if self.write_frame(&frame).is_err() {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).diag = DiagState::DiagIdle;
            return Err(DiagError::DiagRequestSendFailed);
        }

        match self.ack_timer.wait_for_timeout(Duration::from_millis(DIAGNOSTIC_ACK_TIMEOUT_MS)) {
            WaitOutcome::TimedOut => {
                self.state.lock().unwrap_or_else(|e| e.into_inner()).diag = DiagState::DiagIdle;
                return Err(DiagError::DiagAckTimeout);
            }
            WaitOutcome::Cancelled => {
                let diag = self.state.lock().unwrap_or_else(|e| e.into_inner()).diag;
                if diag == DiagState::DiagIdle {
                    // on_diag_ack already reset state on a negative ack.
                    return Err(DiagError::DiagNegAckReceived);
                }
            }
        }

        loop {
            let wait_ms = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.diag == DiagState::RecvdPendingRes {
                    p2_star_ms
                } else {
                    p2_ms
                }
            };
            match self.p2_timer.wait_for_timeout(Duration::from_millis(wait_ms)) {
                WaitOutcome::TimedOut => {
                    self.state.lock().unwrap_or_else(|e| e.into_inner()).diag = DiagState::DiagIdle;
                    return Err(DiagError::DiagResponseTimeout);
                }
                WaitOutcome::Cancelled => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    match state.diag {
                        DiagState::RecvdPendingRes => continue,
                        DiagState::Success => {
                            let result = state.last_response.take().unwrap_or(Err(DiagError::DiagGenericFailure));
                            state.diag = DiagState::DiagIdle;
                            return result;
                        }
                        _ => {
                            state.diag = DiagState::DiagIdle;
                            return Err(DiagError::DiagGenericFailure);
                        }
                    }
                }
            }
        }
    }

    /// Returns `true` if routing activation is currently `Successful`.
    pub fn is_activated(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).routing == RoutingState::Successful
    }

    /// Gracefully shuts down the socket and stops the worker thread, and
    /// resets routing activation to `Idle` .
    pub fn disconnect(&self) -> DisconnectResult {
        let was_active = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let active = state.routing != RoutingState::Idle;
            state.routing = RoutingState::Idle;
            active
        };
        if !was_active {
            return DisconnectResult::AlreadyDisconnected;
        }
        self.worker_running.store(false, Ordering::Relaxed);
        self.close_socket();
        DisconnectResult::DisconnectSuccess
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.worker_running.store(false, Ordering::Relaxed);
    }
}
