//! Peer registry
//!
//! Static mapping of party identifier to network address, populated once at
//! startup. Removal is the only mutation after that.

use crate::{Error, PartyId, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Parse a peer specification of the form `id:host:port`
///
/// The id ends at the first `:`; everything after it is the address.
pub fn parse_peer_spec(spec: &str) -> Result<(PartyId, String)> {
    let (id, addr) = spec
        .split_once(':')
        .ok_or_else(|| Error::InvalidPeerSpec(spec.to_string()))?;

    let id = id.trim();
    let addr = addr.trim();
    if id.is_empty() || addr.is_empty() {
        return Err(Error::InvalidPeerSpec(spec.to_string()));
    }

    Ok((PartyId::new(id), addr.to_string()))
}

/// Participating parties and where to reach them
#[derive(Debug, Clone)]
pub struct PeerTable {
    /// This process's identity
    local_id: PartyId,
    /// Listen address of the local identity
    local_addr: String,
    /// Remote parties by ID
    remotes: BTreeMap<PartyId, String>,
    /// Identities whose inbound queues live in this process
    hosted: BTreeSet<PartyId>,
}

impl PeerTable {
    /// Create a table containing only the local identity
    pub fn new(local_id: PartyId, local_addr: impl Into<String>) -> Self {
        let mut hosted = BTreeSet::new();
        hosted.insert(local_id.clone());
        Self {
            local_id,
            local_addr: local_addr.into(),
            remotes: BTreeMap::new(),
            hosted,
        }
    }

    /// Build a table from the local identity and `id:host:port` specs
    pub fn from_specs<'a>(
        local_id: PartyId,
        local_addr: impl Into<String>,
        specs: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let mut table = Self::new(local_id, local_addr);
        for spec in specs {
            let (id, addr) = parse_peer_spec(spec)?;
            table.add_peer(id, addr)?;
        }
        Ok(table)
    }

    /// Register a remote party
    pub fn add_peer(&mut self, id: PartyId, addr: impl Into<String>) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidConfig("empty party ID".into()));
        }
        if id == self.local_id || self.remotes.contains_key(&id) || self.hosted.contains(&id) {
            return Err(Error::InvalidConfig(format!("duplicate party ID: {}", id)));
        }
        self.remotes.insert(id, addr.into());
        Ok(())
    }

    /// Host an additional identity in this process
    ///
    /// Hosted identities get an inbound queue but are never dialed.
    pub fn host(&mut self, id: PartyId) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidConfig("empty party ID".into()));
        }
        if self.remotes.contains_key(&id) || !self.hosted.insert(id.clone()) {
            return Err(Error::InvalidConfig(format!("duplicate party ID: {}", id)));
        }
        Ok(())
    }

    /// Local identity
    pub fn local_id(&self) -> &PartyId {
        &self.local_id
    }

    /// Listen address of the local identity
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Address of a remote party
    pub fn address(&self, id: &PartyId) -> Option<&str> {
        self.remotes.get(id).map(String::as_str)
    }

    /// Whether `id` takes part in the run
    pub fn contains(&self, id: &PartyId) -> bool {
        self.hosted.contains(id) || self.remotes.contains_key(id)
    }

    /// Whether `id` is a dialable remote party
    pub fn is_remote(&self, id: &PartyId) -> bool {
        self.remotes.contains_key(id)
    }

    /// Remote party IDs, sorted
    pub fn remote_ids(&self) -> impl Iterator<Item = &PartyId> {
        self.remotes.keys()
    }

    /// Hosted party IDs, sorted
    pub fn hosted_ids(&self) -> impl Iterator<Item = &PartyId> {
        self.hosted.iter()
    }

    /// Every participating party ID, sorted
    pub fn ids(&self) -> Vec<PartyId> {
        let mut ids: Vec<PartyId> = self
            .hosted
            .iter()
            .chain(self.remotes.keys())
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of participating parties
    pub fn len(&self) -> usize {
        self.hosted.len() + self.remotes.len()
    }

    /// True when no party takes part (never the case for a fresh table)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a party from the run; returns whether it was present
    pub fn remove(&mut self, id: &PartyId) -> bool {
        let remote = self.remotes.remove(id).is_some();
        let hosted = self.hosted.remove(id);
        remote || hosted
    }
}
