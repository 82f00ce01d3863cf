//! Client configuration, loaded from JSON. Schema matches the engine's
//! configuration document field-for-field: a single UDP interface shared by
//! the (always-present) vehicle-discovery conversation, plus one diagnostic
//! conversation entry per configured ECU.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Local interface the UDP broadcast/unicast socket pair binds to.
    #[serde(rename = "UdpIpAddress")]
    pub udp_ip_address: IpAddr,
    /// Destination address `SendVehicleIdentificationRequest` sends to,
    /// typically the segment's broadcast address.
    #[serde(rename = "UdpBroadcastAddress")]
    pub udp_broadcast_address: IpAddr,
    /// One entry per diagnostic (DM) conversation to build at startup.
    #[serde(rename = "Conversations")]
    pub conversations: Vec<DmConversationConfig>,
}

/// One `Network` sub-object of a conversation entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// IP address of the diagnostic server (gateway/ECU) this conversation
    /// connects to by default.
    #[serde(rename = "TcpIpAddress")]
    pub tcp_ip_address: IpAddr,
}

/// Configuration for one `DmConversation` (diagnostic messaging over TCP).
#[derive(Debug, Clone, Deserialize)]
pub struct DmConversationConfig {
    /// Unique name this conversation is looked up by
    /// ([crate::manager::ConversationManager::get_diagnostic_conversation]).
    #[serde(rename = "ConversationName")]
    pub conversation_name: String,
    /// This tester's own DoIP source address.
    #[serde(rename = "SourceAddress")]
    pub source_address: u16,
    /// P2 client timeout in milliseconds: max wait for the first response
    /// after a request.
    #[serde(rename = "P2ClientMax")]
    pub p2_client_max: u16,
    /// P2* client timeout in milliseconds: max wait after a "response
    /// pending" indication.
    #[serde(rename = "P2StarClientMax")]
    pub p2_star_client_max: u16,
    /// Upper bound on a single inbound diagnostic message's payload size.
    #[serde(rename = "RxBufferSize")]
    pub rx_buffer_size: u32,
    /// The default TCP endpoint this conversation connects to.
    #[serde(rename = "Network")]
    pub network: NetworkConfig,
}

impl ClientConfig {
    /// Parses and validates a configuration document.
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for conversation in &self.conversations {
            let name = &conversation.conversation_name;
            if name.is_empty() {
                return Err(ConfigError::Invalid("ConversationName must not be empty".into()));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate ConversationName: {}", name)));
            }
        }
        Ok(())
    }
}
