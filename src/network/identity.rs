//! Peer identity resolution

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::protocol::PeerId;

use super::error::NatError;

/// Resolves a human-facing peer name to an overlay identity
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<PeerId, NatError>;
}

/// Alias table with a UUID fallback
#[derive(Debug, Default)]
pub struct AliasResolver {
    aliases: RwLock<HashMap<String, PeerId>>,
}

impl AliasResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an alias
    pub fn insert(&self, alias: impl Into<String>, id: PeerId) -> Option<PeerId> {
        self.aliases.write().insert(alias.into(), id)
    }

    pub fn remove(&self, alias: &str) -> Option<PeerId> {
        self.aliases.write().remove(alias)
    }
}

impl IdentityResolver for AliasResolver {
    fn resolve(&self, name: &str) -> Result<PeerId, NatError> {
        if let Some(id) = self.aliases.read().get(name) {
            return Ok(*id);
        }
        Uuid::parse_str(name.trim())
            .map(PeerId)
            .map_err(|_| NatError::UnknownIdentity(name.to_string()))
    }
}
