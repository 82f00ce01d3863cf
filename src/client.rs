//! The top-level client facade: parses configuration, builds the
//! conversation manager, and exposes the public `Initialize`/`DeInitialize`
//! lifecycle plus named conversation lookup.
//!
//! This is the thin object a caller constructs; everything else in the
//! crate is reached through it or through a conversation obtained from it.
//! `DoipClient` owns its [ConversationManager] directly, handed out at
//! construction time with no global or process-wide state.

use std::sync::Mutex;

use crate::config::ClientConfig;
use crate::conversation::{DmConversation, VdConversation};
use crate::error::{DoipError, VehicleInfoError};
use crate::manager::ConversationManager;
use crate::udp_channel::{DiscoverySelector, VehicleInfo};

/// Owns a [ClientConfig] and, once initialized, the [ConversationManager]
/// built from it.
pub struct DoipClient {
    config: ClientConfig,
    manager: Mutex<Option<ConversationManager>>,
}

impl DoipClient {
    /// Constructs a client from an already-parsed configuration. No sockets
    /// are opened until [DoipClient::initialize].
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            manager: Mutex::new(None),
        }
    }

    /// Parses `json` and constructs a client from it.
    pub fn from_json(json: &str) -> Result<Self, DoipError> {
        let config = ClientConfig::from_json(json).map_err(|e| DoipError::InitializationFailed(e.to_string()))?;
        Ok(Self::new(config))
    }

    /// Builds every configured conversation and starts its transport.
    /// Calling this more than once without an intervening [DoipClient::deinitialize]
    /// is a no-op that returns `Ok`.
    pub fn initialize(&self) -> Result<(), DoipError> {
        let mut slot = self.manager.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        let manager = ConversationManager::new(self.config.clone())
            .map_err(|e| DoipError::InitializationFailed(e.to_string()))?;
        *slot = Some(manager);
        Ok(())
    }

    /// Force-shuts-down any still-active conversation and drops the manager.
    /// A no-op if the client was never initialized.
    pub fn deinitialize(&self) -> Result<(), DoipError> {
        let mut slot = self.manager.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        Ok(())
    }

    /// Looks up a diagnostic-messaging conversation by
    /// `ConversationName`. Returns `None` if the client has not been
    /// initialized or no such conversation was configured; the caller is
    /// expected to treat an unknown name as fatal.
    pub fn get_conversation(&self, name: &str) -> Option<std::sync::Arc<DmConversation>> {
        let found = self
            .manager
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|m| m.get_diagnostic_conversation(name));
        if found.is_none() {
            log::error!("no conversation named '{}' is configured", name);
        }
        found
    }

    /// Returns the client's single vehicle-discovery conversation, or `None`
    /// if the client has not been initialized.
    pub fn get_discovery_conversation(&self) -> Option<std::sync::Arc<VdConversation>> {
        self.manager
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|m| m.get_discovery_conversation())
    }

    /// Convenience wrapper: broadcasts a vehicle-identification request on
    /// the client's UDP channel and collects responses.
    pub fn send_vehicle_identification_request(
        &self,
        selector: DiscoverySelector,
    ) -> Result<Vec<VehicleInfo>, VehicleInfoError> {
        let conversation = self.get_discovery_conversation().ok_or(VehicleInfoError::InvalidParameter)?;
        conversation.send_vehicle_identification_request(selector)
    }
}
