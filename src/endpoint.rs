//! Endpoint Directory (ED).
//!
//! For each peer, maintains three ordered endpoint lists (sink, source,
//! broadcast) keyed by (local PAC, remote PAC) pair, and assigns stable
//! path-like identifiers.

use std::collections::HashMap;

use crate::pac::PacHandle;
use crate::types::{Contexts, Direction, Locations};

/// Stable identifier for an Endpoint: `"<peer-path>/pac_<role><index>"`
/// Local broadcast-source endpoints have no peer and instead use the
/// adapter path as their prefix.
pub type EndpointPath = String;

/// Cached property view of an Endpoint, refreshed from the remote PAC on
/// every registration/update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointProperties {
    pub locations: Locations,
    pub supported_context: Contexts,
    pub context: Contexts,
}

/// An Endpoint: the mapping from a (local PAC, remote PAC) pair to a stable
/// identity.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: EndpointPath,
    pub peer: Option<String>,
    pub local_pac: PacHandle,
    pub remote_pac: Option<PacHandle>,
    pub direction: Direction,
    pub properties: EndpointProperties,
}

/// Notifications the Endpoint Directory emits toward the EIL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointNotification {
    Registered(EndpointPath),
    Unregistered(EndpointPath),
    PropertiesChanged(EndpointPath),
}

#[derive(Debug, Default, Clone)]
struct PeerEndpoints {
    sink: Vec<EndpointPath>,
    source: Vec<EndpointPath>,
    bcast: Vec<EndpointPath>,
}

impl PeerEndpoints {
    fn list_for(&mut self, direction: Direction) -> &mut Vec<EndpointPath> {
        match direction {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
            Direction::BroadcastSink | Direction::BroadcastSource => &mut self.bcast,
        }
    }
}

/// Tracks endpoints per peer and emits Registered/Unregistered/property
/// change notifications.
#[derive(Debug, Default)]
pub struct EndpointDirectory {
    endpoints: HashMap<EndpointPath, Endpoint>,
    by_peer: HashMap<String, PeerEndpoints>,
    pending: Vec<EndpointNotification>,
}

impl EndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_existing(
        &self,
        peer: &str,
        local_pac: PacHandle,
        remote_pac: Option<PacHandle>,
    ) -> Option<EndpointPath> {
        self.endpoints.iter().find_map(|(path, ep)| {
            if ep.peer.as_deref() == Some(peer)
                && ep.local_pac == local_pac
                && ep.remote_pac == remote_pac
            {
                Some(path.clone())
            } else {
                None
            }
        })
    }

    /// Creates or reuses the Endpoint for a (local PAC, remote PAC) pair on
    /// `peer`, emitting a `Registered` notification on first creation
    /// (idempotent registration emits no duplicate notification).
    pub fn register(
        &mut self,
        peer: &str,
        peer_path: &str,
        direction: Direction,
        local_pac: PacHandle,
        remote_pac: Option<PacHandle>,
        properties: EndpointProperties,
    ) -> EndpointPath {
        if let Some(existing) = self.find_existing(peer, local_pac, remote_pac) {
            let changed = {
                let ep = self.endpoints.get_mut(&existing).unwrap();
                let changed = ep.properties != properties;
                ep.properties = properties;
                changed
            };
            if changed {
                self.pending
                    .push(EndpointNotification::PropertiesChanged(existing.clone()));
            }
            return existing;
        }

        let peer_entry = self.by_peer.entry(peer.to_string()).or_default();
        let list = peer_entry.list_for(direction);
        let index = list.len();
        let path = format!("{}/pac_{}{}", peer_path, direction.role_name(), index);
        list.push(path.clone());

        self.endpoints.insert(
            path.clone(),
            Endpoint {
                path: path.clone(),
                peer: Some(peer.to_string()),
                local_pac,
                remote_pac,
                direction,
                properties,
            },
        );
        self.pending.push(EndpointNotification::Registered(path.clone()));
        path
    }

    /// Registers a local broadcast-source endpoint, which has no remote PAC
    /// (the remote PAC is absent only for local broadcast-source
    /// endpoints).
    pub fn register_broadcast_source(
        &mut self,
        adapter_path: &str,
        local_pac: PacHandle,
    ) -> EndpointPath {
        self.register(
            adapter_path,
            adapter_path,
            Direction::BroadcastSource,
            local_pac,
            None,
            EndpointProperties::default(),
        )
    }

    /// Unregisters the Endpoint matching `local_pac`/`remote_pac` on `peer`.
    /// Returns the freed path so the caller can cascade setup release
    /// through the SSM.
    pub fn unregister(
        &mut self,
        peer: &str,
        local_pac: PacHandle,
        remote_pac: Option<PacHandle>,
    ) -> Option<EndpointPath> {
        let path = self.find_existing(peer, local_pac, remote_pac)?;
        self.endpoints.remove(&path);
        if let Some(entry) = self.by_peer.get_mut(peer) {
            for list in [&mut entry.sink, &mut entry.source, &mut entry.bcast] {
                list.retain(|p| p != &path);
            }
        }
        self.pending
            .push(EndpointNotification::Unregistered(path.clone()));
        Some(path)
    }

    pub fn unregister_all_for_peer(&mut self, peer: &str) -> Vec<EndpointPath> {
        let mut removed = Vec::new();
        let paths: Vec<EndpointPath> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.peer.as_deref() == Some(peer))
            .map(|(path, _)| path.clone())
            .collect();
        for path in paths {
            self.endpoints.remove(&path);
            self.pending
                .push(EndpointNotification::Unregistered(path.clone()));
            removed.push(path);
        }
        self.by_peer.remove(peer);
        removed
    }

    pub fn get(&self, path: &str) -> Option<&Endpoint> {
        self.endpoints.get(path)
    }

    pub fn drain_notifications(&mut self) -> Vec<EndpointNotification> {
        core::mem::take(&mut self.pending)
    }
}
