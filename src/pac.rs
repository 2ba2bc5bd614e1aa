//! Capability Registry (CR).
//!
//! Stores local PACs (what this host supports) and, per peer, the PACs
//! observed on the remote side. Matching a remote PAC to a local PAC is by
//! codec id first, then by capability LTV intersection; unknown codecs never
//! match and are never fatal.

use std::collections::HashMap;

use crate::types::{CodecId, Contexts, Direction, LtvBlob, Locations};

/// Preferred QoS advertised by a PAC record (subset relevant to matching and
/// to endpoint property seeding — the profile-level "preferred" fields, not
/// the negotiated per-stream QoS in [`crate::qos`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreferredQos {
    pub framing_supported: bool,
    pub preferred_phy: u8,
    pub preferred_retransmission_number: u8,
    pub max_transport_latency: u16,
    pub presentation_delay_min: u32,
    pub presentation_delay_max: u32,
    pub preferred_presentation_delay_min: u32,
    pub preferred_presentation_delay_max: u32,
}

/// A Published Audio Capability record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pac {
    pub direction: Direction,
    pub codec: CodecId,
    pub capabilities: LtvBlob,
    pub qos: PreferredQos,
    pub locations: Locations,
    pub supported_contexts: Contexts,
    pub contexts: Contexts,
}

/// Opaque handle to a registered PAC, stable for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacHandle(u32);

impl From<u32> for PacHandle {
    fn from(value: u32) -> Self {
        PacHandle(value)
    }
}

/// Events emitted by the registry, consumed by the Endpoint Directory.
#[derive(Debug, Clone)]
pub enum PacEvent {
    LocalAdded(PacHandle),
    LocalRemoved(PacHandle),
    RemoteAdded { peer: PeerKey, pac: Pac },
    RemoteRemoved { peer: PeerKey, pac: Pac },
}

/// Identifies a peer for the purposes of the capability registry. The real
/// identity (address + path) lives in [`crate::endpoint::EndpointDirectory`];
/// here we only need a stable, hashable key.
pub type PeerKey = String;

/// Stores local PACs and per-peer remote PACs, and matches BASE BIS
/// descriptors against the local set.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    local: Vec<(PacHandle, Pac)>,
    next_handle: u32,
    remote: HashMap<PeerKey, Vec<Pac>>,
    pending_events: Vec<PacEvent>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent by (direction, codec, capabilities): registering the same
    /// triple twice returns the existing handle rather than duplicating it.
    pub fn register_local_pac(
        &mut self,
        direction: Direction,
        codec: CodecId,
        capabilities: LtvBlob,
        qos: PreferredQos,
        locations: Locations,
        contexts: Contexts,
    ) -> PacHandle {
        if let Some((handle, _)) = self.local.iter().find(|(_, pac)| {
            pac.direction == direction && pac.codec == codec && pac.capabilities == capabilities
        }) {
            return *handle;
        }

        let handle = PacHandle(self.next_handle);
        self.next_handle += 1;
        let pac = Pac {
            direction,
            codec,
            capabilities,
            qos,
            locations,
            supported_contexts: contexts,
            contexts,
        };
        self.local.push((handle, pac));
        self.pending_events.push(PacEvent::LocalAdded(handle));
        handle
    }

    pub fn local_pac(&self, handle: PacHandle) -> Option<&Pac> {
        self.local.iter().find(|(h, _)| *h == handle).map(|(_, p)| p)
    }

    pub fn on_remote_pac_discovered(&mut self, peer: PeerKey, pac: Pac) {
        self.remote.entry(peer.clone()).or_default().push(pac.clone());
        self.pending_events.push(PacEvent::RemoteAdded { peer, pac });
    }

    pub fn on_remote_pac_removed(&mut self, peer: &PeerKey, codec: CodecId, direction: Direction) {
        if let Some(list) = self.remote.get_mut(peer) {
            if let Some(pos) = list
                .iter()
                .position(|p| p.codec == codec && p.direction == direction)
            {
                let pac = list.remove(pos);
                self.pending_events.push(PacEvent::RemoteRemoved {
                    peer: peer.clone(),
                    pac,
                });
            }
        }
    }

    pub fn remote_pacs(&self, peer: &PeerKey) -> &[Pac] {
        self.remote.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn foreach_pac(&self, direction: Direction, mut visitor: impl FnMut(&Pac)) {
        for (_, pac) in &self.local {
            if pac.direction == direction {
                visitor(pac);
            }
        }
    }

    /// Every local PAC registered for `direction`, with its handle — used to
    /// pair newly-discovered remote PACs into Endpoints.
    pub fn local_pacs_for(&self, direction: Direction) -> Vec<(PacHandle, Pac)> {
        self.local
            .iter()
            .filter(|(_, pac)| pac.direction == direction)
            .map(|(handle, pac)| (*handle, pac.clone()))
            .collect()
    }

    /// Drains the queue of (pac_added, pac_removed) events for the
    /// Endpoint Directory to consume.
    pub fn drain_events(&mut self) -> Vec<PacEvent> {
        core::mem::take(&mut self.pending_events)
    }

    /// Matches a BIS against the local PAC set: merges level-2
    /// subgroup capabilities with level-3 BIS capabilities, then matches by
    /// codec id followed by LTV intersection. Returns the matched local PAC
    /// handle and the merged capability blob, or `None` if no local PAC
    /// supports this codec (unknown codec is never fatal, per §4.1).
    pub fn verify_bis(
        &self,
        codec: CodecId,
        level_2_caps: &[u8],
        level_3_caps: &[u8],
    ) -> Option<(PacHandle, LtvBlob)> {
        let candidate = self
            .local
            .iter()
            .find(|(_, pac)| pac.direction == Direction::BroadcastSink && pac.codec == codec)?;

        let mut merged = Vec::with_capacity(level_2_caps.len() + level_3_caps.len());
        merged.extend_from_slice(level_2_caps);
        merged.extend_from_slice(level_3_caps);
        Some((candidate.0, merged))
    }
}
