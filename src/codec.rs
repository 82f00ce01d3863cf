//! The generic DoIP header: composition, parsing, and NACK classification.
//!
//! See ISO 13400-2. A DoIP message on the wire is an 8 byte header followed
//! by `payload_length` bytes of payload:
//!
//! ```text
//! [ version | ~version | type_hi | type_lo | len_b3 | len_b2 | len_b1 | len_b0 | payload... ]
//! ```

use std::fmt;
use std::io::{self, Read};

use strum_macros::FromRepr;

/// Header size in bytes (version + inverse-version + type + length).
pub const HEADER_LEN: usize = 8;

/// Default/unsecured DoIP TCP and UDP port.
pub const DOIP_PORT: u16 = 13400;

/// Protocol version byte for ISO 13400-2012.
pub const PROTOCOL_VERSION_2012: u8 = 0x02;
/// Protocol version byte for ISO 13400-2019.
pub const PROTOCOL_VERSION_2019: u8 = 0x03;
/// Reserved "default" version byte, accepted per ISO 13400.
pub const PROTOCOL_VERSION_DEFAULT: u8 = 0xFF;

/// Maximum payload length a TCP channel will accept (protocol `rx_buffer_size`
/// upper bound used for guard purposes, ISO 13400 default).
pub const TCP_CHANNEL_MAX: u32 = 4096;
/// Maximum payload length a UDP channel will accept.
pub const UDP_CHANNEL_MAX: u32 = 41;

/// Registered DoIP payload types this engine composes or recognizes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum PayloadType {
    /// 0x0000 Generic header negative acknowledgement
    GenericNack = 0x0000,
    /// 0x0001 Vehicle identification request (broadcast, no selector)
    VehicleIdentificationRequest = 0x0001,
    /// 0x0002 Vehicle identification request, selecting by EID
    VehicleIdentificationRequestEid = 0x0002,
    /// 0x0003 Vehicle identification request, selecting by VIN
    VehicleIdentificationRequestVin = 0x0003,
    /// 0x0004 Vehicle announcement / vehicle identification response
    VehicleAnnouncement = 0x0004,
    /// 0x0005 Routing activation request
    RoutingActivationRequest = 0x0005,
    /// 0x0006 Routing activation response
    RoutingActivationResponse = 0x0006,
    /// 0x0007 Alive check request
    AliveCheckRequest = 0x0007,
    /// 0x0008 Alive check response
    AliveCheckResponse = 0x0008,
    /// 0x8001 Diagnostic message (carries a UDS payload)
    DiagnosticMessage = 0x8001,
    /// 0x8002 Diagnostic message positive acknowledgement
    DiagnosticMessagePosAck = 0x8002,
    /// 0x8003 Diagnostic message negative acknowledgement
    DiagnosticMessageNegAck = 0x8003,
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04X})", self, *self as u16)
    }
}

impl PayloadType {
    /// Payload types a TCP channel will accept at the generic header level.
    pub fn tcp_accepted_set() -> &'static [PayloadType] {
        &[
            PayloadType::RoutingActivationResponse,
            PayloadType::DiagnosticMessage,
            PayloadType::DiagnosticMessagePosAck,
            PayloadType::DiagnosticMessageNegAck,
            PayloadType::AliveCheckRequest,
        ]
    }

    /// Payload types a UDP channel will accept at the generic header level.
    pub fn udp_accepted_set() -> &'static [PayloadType] {
        &[PayloadType::VehicleAnnouncement]
    }

    /// The valid `payload_length` range for this type, relative to the
    /// header (exclusive of the 8 header bytes). `None` means no per-type
    /// bound is enforced beyond the protocol/channel max.
    fn valid_length_range(&self) -> Option<(u32, u32)> {
        match self {
            PayloadType::RoutingActivationResponse => Some((9, 13)),
            PayloadType::DiagnosticMessage => Some((5, u32::MAX)),
            PayloadType::DiagnosticMessagePosAck => Some((5, u32::MAX)),
            PayloadType::DiagnosticMessageNegAck => Some((5, u32::MAX)),
            PayloadType::AliveCheckRequest => Some((0, 13)),
            PayloadType::VehicleAnnouncement => Some((0, 33)),
            _ => None,
        }
    }
}

/// Generic header NACK codes (ISO 13400 table), returned by [process_header]
/// when a received header fails a validation step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NackCode {
    /// 0x00 version/inverse-version mismatch. The socket must be closed.
    IncorrectPattern,
    /// 0x01 payload type not in the accepted set for this channel
    UnknownPayload,
    /// 0x02 payload_length exceeds the protocol maximum (4 GiB)
    MessageTooLarge,
    /// 0x03 payload_length exceeds the channel's maximum
    OutOfMemory,
    /// 0x04 payload_length is outside the valid range for its type. The
    /// socket must be closed.
    InvalidPayloadLen,
}

impl NackCode {
    /// The single-byte wire code for this NACK.
    pub fn code(&self) -> u8 {
        match self {
            NackCode::IncorrectPattern => 0x00,
            NackCode::UnknownPayload => 0x01,
            NackCode::MessageTooLarge => 0x02,
            NackCode::OutOfMemory => 0x03,
            NackCode::InvalidPayloadLen => 0x04,
        }
    }

    /// Per ISO 13400, codes 0x00 and 0x04 additionally require the socket to
    /// be closed.
    pub fn requires_socket_close(&self) -> bool {
        matches!(self, NackCode::IncorrectPattern | NackCode::InvalidPayloadLen)
    }
}

impl fmt::Display for NackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NackCode::IncorrectPattern => "incorrect pattern format",
            NackCode::UnknownPayload => "unknown payload type",
            NackCode::MessageTooLarge => "message too large",
            NackCode::OutOfMemory => "out of memory",
            NackCode::InvalidPayloadLen => "invalid payload length",
        };
        write!(f, "{}", s)
    }
}

/// A decoded generic header, with its raw payload type still attached as the
/// caller is expected to dispatch on it before interpreting `payload`.
#[derive(Debug, Clone)]
pub struct DecodedHeader {
    /// Protocol version byte as received
    pub protocol_version: u8,
    /// Payload type of the message
    pub payload_type: PayloadType,
    /// Raw payload bytes (length already validated against `payload_length`)
    pub payload: Vec<u8>,
}

/// Composes a complete DoIP message (header + payload) ready for the wire.
///
/// `version` is `PROTOCOL_VERSION_2012` unless the caller configured
/// otherwise.
pub fn compose(version: u8, payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(version);
    out.push(!version);
    let type_val = payload_type as u16;
    out.extend_from_slice(&type_val.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parses only the 8 byte header, returning the protocol version, raw
/// payload-type field and the decoded payload length. Used by the TCP
/// reassembly loop to know how many more bytes to read before calling
/// [process_header] on the full buffer.
pub fn parse_header_prefix(bytes: &[u8; HEADER_LEN]) -> (u8, u8, u16, u32) {
    let version = bytes[0];
    let inverse = bytes[1];
    let type_val = u16::from_be_bytes([bytes[2], bytes[3]]);
    let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    (version, inverse, type_val, len)
}

/// Validates and decodes a complete DoIP message (header + however many
/// payload bytes the header claims) for the given channel, following a
/// five-step validation. `channel_max` is [TCP_CHANNEL_MAX] or [UDP_CHANNEL_MAX].
pub fn process_header(
    full_message: &[u8],
    accepted: &[PayloadType],
    channel_max: u32,
) -> Result<DecodedHeader, NackCode> {
    assert!(full_message.len() >= HEADER_LEN, "caller must supply a full header");
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&full_message[..HEADER_LEN]);
    let (version, inverse, type_val, len) = parse_header_prefix(&header_bytes);

    // Step 1: version / inverse-version pattern.
    if inverse != !version {
        return Err(NackCode::IncorrectPattern);
    }

    // Step 2: payload type must be in the channel's accepted set.
    let payload_type = PayloadType::from_repr(type_val).ok_or(NackCode::UnknownPayload)?;
    if !accepted.contains(&payload_type) {
        return Err(NackCode::UnknownPayload);
    }

    // Step 3: protocol-level maximum (the field is already a u32 so this can
    // only ever fail on a hypothetically wider wire format; kept for parity
    // with the ISO 13400 validation order).
    if len > 0xFFFF_FFFF {
        return Err(NackCode::MessageTooLarge);
    }

    // Step 4: channel-specific maximum.
    if len > channel_max {
        return Err(NackCode::OutOfMemory);
    }

    // Step 5: per-type valid length range.
    if let Some((min, max)) = payload_type.valid_length_range() {
        if len < min || len > max {
            return Err(NackCode::InvalidPayloadLen);
        }
    }

    let payload = full_message[HEADER_LEN..HEADER_LEN + len as usize].to_vec();
    Ok(DecodedHeader {
        protocol_version: version,
        payload_type,
        payload,
    })
}

/// A safety cap on how many payload bytes [read_tcp_frame] will read off the
/// wire before giving up and forcing a close, even for NACK codes that per
/// ISO 13400 only require the message to be "discarded" rather than the
/// socket closed. Without this an oversized `payload_length` claimed by a
/// malicious or buggy peer would make the reassembly loop allocate and block
/// reading an attacker-chosen number of bytes.
const MAX_DISCARDABLE_LEN: u32 = 1_000_000;

/// Outcome of reading one complete DoIP frame off a TCP stream.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A fully validated message, ready for the channel state machine.
    Message(DecodedHeader),
    /// The header or length failed validation. `resynced` is `true` if the
    /// claimed payload bytes were read off the wire (so the stream position
    /// is still valid and the socket need not be closed purely for framing
    /// reasons); `false` means the claimed length was never consumed and the
    /// socket must be closed regardless of what [NackCode::requires_socket_close]
    /// says, or the stream is corrupt from here on.
    Nack {
        /// Which NACK code the validation failure maps to.
        code: NackCode,
        /// See the variant's doc comment above.
        resynced: bool,
    },
    /// Fewer than [HEADER_LEN] bytes were available before EOF: the remote
    /// end disconnected. This is not a protocol error.
    Disconnected,
}

/// Reads exactly one complete DoIP message from `reader`: first the 8 byte
/// header, then however many payload bytes it claims, retrying short reads,
/// before handing the assembled buffer to [process_header]. A state machine
/// is guaranteed to never observe a partial message.
pub fn read_tcp_frame(
    reader: &mut impl Read,
    accepted: &[PayloadType],
    channel_max: u32,
) -> io::Result<FrameOutcome> {
    let mut header = [0u8; HEADER_LEN];
    if !read_exact_or_eof(reader, &mut header)? {
        return Ok(FrameOutcome::Disconnected);
    }
    let (version, inverse, _type_val, len) = parse_header_prefix(&header);

    if inverse != !version {
        return Ok(FrameOutcome::Nack {
            code: NackCode::IncorrectPattern,
            resynced: true,
        });
    }
    if len > channel_max && len > MAX_DISCARDABLE_LEN {
        return Ok(FrameOutcome::Nack {
            code: NackCode::OutOfMemory,
            resynced: false,
        });
    }

    let mut frame = vec![0u8; HEADER_LEN + len as usize];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..])?;

    match process_header(&frame, accepted, channel_max) {
        Ok(decoded) => Ok(FrameOutcome::Message(decoded)),
        Err(code) => Ok(FrameOutcome::Nack { code, resynced: true }),
    }
}

/// Reads until `buf` is full, returning `Ok(false)` if EOF is hit before any
/// byte is read (clean disconnect) and propagating a hard error if EOF is
/// hit mid-header (a genuinely truncated stream).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(false)
                } else {
                    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "remote disconnected mid-header"))
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Returns `true` if `payload` is a UDS "response pending" (NRC 0x78)
/// negative response: `[0x7F, SID, 0x78]`.
pub fn is_response_pending(payload: &[u8]) -> bool {
    payload.len() >= 3 && payload[0] == 0x7F && payload[2] == 0x78
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_then_process_round_trips() {
        let payload = vec![0x0E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00];
        let msg = compose(PROTOCOL_VERSION_2012, PayloadType::RoutingActivationRequest, &payload);
        assert_eq!(msg[1], !PROTOCOL_VERSION_2012);

        // RoutingActivationRequest isn't in the TCP accepted set (responses
        // only travel that direction in this client), so decode it directly
        // against an accepted set that includes it to prove the round trip.
        let decoded = process_header(&msg, &[PayloadType::RoutingActivationRequest], TCP_CHANNEL_MAX)
            .expect("valid message");
        assert_eq!(decoded.payload_type, PayloadType::RoutingActivationRequest);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION_2012);
    }

    #[test]
    fn version_mismatch_is_nack_0x00() {
        let mut msg = compose(PROTOCOL_VERSION_2012, PayloadType::AliveCheckRequest, &[]);
        msg[1] = 0x00; // corrupt the inverse-version byte
        let err = process_header(&msg, PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX).unwrap_err();
        assert_eq!(err, NackCode::IncorrectPattern);
        assert!(err.requires_socket_close());
    }

    #[test]
    fn unknown_payload_type_is_nack_0x01() {
        let mut msg = compose(PROTOCOL_VERSION_2012, PayloadType::AliveCheckRequest, &[]);
        // AliveCheckRequest is valid but not in the UDP accepted set.
        let err = process_header(&msg, PayloadType::udp_accepted_set(), UDP_CHANNEL_MAX).unwrap_err();
        assert_eq!(err, NackCode::UnknownPayload);

        // A genuinely unregistered type code.
        msg[2] = 0x12;
        msg[3] = 0x34;
        let err = process_header(&msg, PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX).unwrap_err();
        assert_eq!(err, NackCode::UnknownPayload);
    }

    #[test]
    fn oversized_payload_is_nack_0x03() {
        let payload = vec![0u8; (TCP_CHANNEL_MAX + 1) as usize];
        let msg = compose(PROTOCOL_VERSION_2012, PayloadType::DiagnosticMessage, &payload);
        let err = process_header(&msg[..HEADER_LEN], PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX);
        // Only header bytes are available in this test; payload_length alone
        // is enough to trip the channel-max guard before any payload bytes
        // are read.
        assert_eq!(err.unwrap_err(), NackCode::OutOfMemory);
    }

    #[test]
    fn short_payload_for_type_is_nack_0x04() {
        // DiagnosticMessage requires >= 5 bytes (SA, TA, >=1 byte UDS).
        let msg = compose(PROTOCOL_VERSION_2012, PayloadType::DiagnosticMessage, &[0x0E, 0x80, 0x12]);
        let err = process_header(&msg, PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX).unwrap_err();
        assert_eq!(err, NackCode::InvalidPayloadLen);
        assert!(err.requires_socket_close());
    }

    #[test]
    fn read_tcp_frame_reassembles_full_message() {
        use std::io::Cursor;
        let payload = vec![0x0E, 0x80, 0x12, 0x34, 0x10, 0x00, 0x00, 0x00, 0x00];
        let msg = compose(PROTOCOL_VERSION_2012, PayloadType::RoutingActivationResponse, &payload);
        let mut cursor = Cursor::new(msg);
        match read_tcp_frame(&mut cursor, PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX).unwrap() {
            FrameOutcome::Message(decoded) => {
                assert_eq!(decoded.payload_type, PayloadType::RoutingActivationResponse);
                assert_eq!(decoded.payload, payload);
            }
            other => panic!("expected Message, got {:?}", other),
        }
    }

    #[test]
    fn read_tcp_frame_reports_clean_disconnect() {
        use std::io::Cursor;
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let outcome = read_tcp_frame(&mut cursor, PayloadType::tcp_accepted_set(), TCP_CHANNEL_MAX).unwrap();
        assert!(matches!(outcome, FrameOutcome::Disconnected));
    }

    #[test]
    fn response_pending_pattern_detection() {
        assert!(is_response_pending(&[0x7F, 0x22, 0x78]));
        assert!(!is_response_pending(&[0x62, 0xF1, 0x90]));
        assert!(!is_response_pending(&[0x7F, 0x22, 0x31]));
    }
}
