#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A client library implementing Diagnostics-over-IP (DoIP, ISO 13400), the
//! transport that carries UDS (ISO 14229) request/response traffic between a
//! diagnostic tester and one or more ECUs over TCP/IP and UDP/IP.
//!
//! A caller composes UDS payloads, addresses a remote ECU by logical
//! address, and this crate handles the framing, timing and sequencing of
//! the underlying DoIP exchanges:
//!
//! * [codec] — the generic 8 byte DoIP header: composition, parsing and
//!   NACK classification (ISO 13400-2 table 14).
//! * [socket] — byte-level TCP (plain/TLS) and UDP (unicast/broadcast)
//!   transport.
//! * [tcp_channel] — one TCP connection's routing-activation and
//!   diagnostic-message state machines, including P2/P2* timing.
//! * [udp_channel] — vehicle announcement listening and active
//!   vehicle-identification transactions.
//! * [conversation] — per-ECU sessions ([conversation::DmConversation]) and
//!   the vehicle-discovery session ([conversation::VdConversation]) that
//!   bind a caller's requests to a channel.
//! * [manager] and [config] — builds conversations from a parsed JSON
//!   configuration and routes named lookups.
//! * [client] — the top-level facade a caller constructs.
//! * [error] — the typed error taxonomy shared by every layer.
//! * [timer] — the cancellable sync-timer and single-slot executor the
//!   channel state machines are built on.
//!
//! This crate is a DoIP *client*: it performs the server role only in its
//! own test harnesses, never as a production API, and it is opaque to UDS
//! payload content except for detecting the "response pending" pattern
//! (`0x7F SID 0x78`) needed to drive P2*.
//!
//! ```no_run
//! use doip_diagnostics::client::DoipClient;
//! use doip_diagnostics::udp_channel::DiscoverySelector;
//!
//! let client = DoipClient::from_json(r#"{
//!     "UdpIpAddress": "0.0.0.0",
//!     "UdpBroadcastAddress": "255.255.255.255",
//!     "Conversations": []
//! }"#).unwrap();
//! client.initialize().unwrap();
//! let _ = client.send_vehicle_identification_request(DiscoverySelector::Broadcast);
//! client.deinitialize().unwrap();
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod error;
pub mod manager;
pub mod socket;
pub mod tcp_channel;
pub mod timer;
pub mod udp_channel;

pub use client::DoipClient;
