//! Builds and owns every conversation the client was configured with: the
//! single vehicle-discovery conversation plus one diagnostic conversation
//! per configured entry, and routes named lookups for the latter.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::conversation::{Conversation, DmConversation, VdConversation};
use crate::error::DmError;

/// Owns every `DmConversation`/the one `VdConversation` built from a
/// [ClientConfig].
pub struct ConversationManager {
    diagnostic: HashMap<String, Arc<DmConversation>>,
    discovery: Arc<VdConversation>,
}

impl ConversationManager {
    /// Builds and starts up every conversation named in `config`. If any one
    /// conversation fails to start, the ones already started are shut back
    /// down before the error is returned.
    pub fn new(config: ClientConfig) -> Result<Self, DmError> {
        let discovery = Arc::new(VdConversation::new(config.udp_ip_address, config.udp_broadcast_address));
        discovery.startup()?;

        let mut manager = Self {
            diagnostic: HashMap::new(),
            discovery,
        };

        for entry in config.conversations {
            let name = entry.conversation_name.clone();
            let conversation = Arc::new(DmConversation::new(entry));
            if let Err(e) = conversation.startup() {
                manager.shutdown_all();
                return Err(e);
            }
            manager.diagnostic.insert(name, conversation);
        }

        Ok(manager)
    }

    /// Parses `json` as a [ClientConfig] and builds the manager from it.
    pub fn from_json(json: &str) -> Result<Self, DmError> {
        let config = ClientConfig::from_json(json).map_err(|e| DmError::InitializationFailed(e.to_string()))?;
        Self::new(config)
    }

    /// Looks up a diagnostic-messaging conversation by
    /// `ConversationName`. Returns `None` rather than failing: whether an
    /// unknown name is fatal is the caller's decision, not this crate's.
    pub fn get_diagnostic_conversation(&self, name: &str) -> Option<Arc<DmConversation>> {
        self.diagnostic.get(name).cloned()
    }

    /// Returns the client's single vehicle-discovery conversation.
    pub fn get_discovery_conversation(&self) -> Arc<VdConversation> {
        self.discovery.clone()
    }

    /// Shuts down every conversation that is still active, logging (rather
    /// than failing) any individual shutdown error so one stuck conversation
    /// can't block the rest from tearing down.
    pub fn shutdown_all(&self) {
        for conversation in self.diagnostic.values() {
            if conversation.is_active() {
                if let Err(e) = conversation.shutdown() {
                    log::error!("failed to shut down conversation '{}': {}", conversation.name(), e);
                }
            }
        }
        if self.discovery.is_active() {
            if let Err(e) = self.discovery.shutdown() {
                log::error!("failed to shut down conversation '{}': {}", self.discovery.name(), e);
            }
        }
    }
}

impl Drop for ConversationManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_diagnostic_conversation_name_is_none() {
        let config = ClientConfig::from_json(
            r#"{
                "UdpIpAddress": "127.0.0.1",
                "UdpBroadcastAddress": "127.0.0.255",
                "Conversations": []
            }"#,
        )
        .unwrap();
        let manager = ConversationManager::new(config).unwrap();
        assert!(manager.get_diagnostic_conversation("does-not-exist").is_none());
    }
}
