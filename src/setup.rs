//! Setup Registry (SR).
//!
//! A Setup is the per-stream-negotiation record: parent endpoint (absent for
//! broadcast-sink BISes), the paired Stream, negotiated QoS, optional
//! codec-specific capabilities/metadata, the I/O channel, and the two
//! scheduler flags (`recreate_when_idle`, `group_active`) Group Scheduler
//! reads and writes. A broadcast source's BASE blob is not cached here; it is
//! built on demand from every setup sharing a BIG (`Adapter::build_broadcast_base`).

use std::collections::HashMap;

use crate::arena::{Arena, Id};
use crate::endpoint::EndpointPath;
use crate::qos::QosConfig;
use crate::stream::StreamId;
use crate::transport::ChannelId;
use crate::types::LtvBlob;

/// Stable handle to a [`Setup`], an index into the adapter's setup arena.
pub type SetupId = Id<Setup>;

/// A peer identifier, matching [`crate::pac::PeerKey`].
pub type PeerKey = String;

/// A Setup: the per-stream negotiation state owned by the Setup Registry
/// `identifier` is the BlueZ-style path used in Endpoint/BIS
/// notifications (`"<peer-path>/pac_<role><index>"` or
/// `"<peer-path>/bis<index>"`).
#[derive(Debug, Clone)]
pub struct Setup {
    pub identifier: String,
    pub parent_endpoint: Option<EndpointPath>,
    pub stream: StreamId,
    pub qos: QosConfig,
    pub capabilities: Option<LtvBlob>,
    pub metadata: Option<LtvBlob>,
    pub channel: Option<ChannelId>,
    /// Set once this setup's ISO socket has been created and not yet
    /// closed; gates `is_cig_busy`/BIG-ordering decisions.
    pub group_active: bool,
    /// Set when a socket creation was deferred because its group was busy,
    /// or a disconnect occurred; cleared once the setup is recreated
    /// (cleared by the recreate sweep).
    pub recreate_when_idle: bool,
}

impl Setup {
    fn new(
        identifier: String,
        parent_endpoint: Option<EndpointPath>,
        stream: StreamId,
        qos: QosConfig,
    ) -> Self {
        Self {
            identifier,
            parent_endpoint,
            stream,
            qos,
            capabilities: None,
            metadata: None,
            channel: None,
            group_active: false,
            recreate_when_idle: false,
        }
    }
}

/// BIS index encoded in a broadcast-sink Setup's identifier
/// (`"<peer-path>/bis<index>"`).
pub fn bis_index_from_identifier(identifier: &str) -> Option<u8> {
    identifier.rsplit("/bis").next()?.parse().ok()
}

/// Owns Setup and Stream lifetime for one adapter. Per-endpoint setups
/// (unicast, and broadcast-source — one per BIS) are indexed by endpoint
/// path; broadcast-sink setups have no parent endpoint and live in a
/// dedicated per-peer collection instead.
#[derive(Debug, Default)]
pub struct SetupRegistry {
    setups: Arena<Setup>,
    streams: Arena<crate::stream::Stream>,
    by_endpoint: HashMap<EndpointPath, Vec<SetupId>>,
    by_peer_bcast_sink: HashMap<PeerKey, Vec<SetupId>>,
}

impl SetupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a Setup attached to `endpoint`, along with its Stream in
    /// state IDLE. Used for unicast and broadcast-source endpoints.
    pub fn create_for_endpoint(
        &mut self,
        identifier: String,
        endpoint: EndpointPath,
        direction: crate::types::Direction,
        qos_kind: crate::stream::QosKind,
        qos: QosConfig,
    ) -> (SetupId, StreamId) {
        let setup_id = self.setups.reserve();
        let stream_id = self
            .streams
            .insert(crate::stream::Stream::new(setup_id, direction, qos_kind));
        self.setups
            .fill(setup_id, Setup::new(identifier, Some(endpoint.clone()), stream_id, qos));
        self.by_endpoint.entry(endpoint).or_default().push(setup_id);
        (setup_id, stream_id)
    }

    /// Creates a broadcast-sink Setup with no parent endpoint, owned by
    /// `peer`'s dedicated collection, created while parsing a BASE, before
    /// any Endpoint exists for the individual BIS.
    pub fn create_broadcast_sink(
        &mut self,
        identifier: String,
        peer: PeerKey,
        qos: QosConfig,
    ) -> (SetupId, StreamId) {
        let setup_id = self.setups.reserve();
        let stream_id = self.streams.insert(crate::stream::Stream::new(
            setup_id,
            crate::types::Direction::BroadcastSink,
            crate::stream::QosKind::Broadcast,
        ));
        self.setups
            .fill(setup_id, Setup::new(identifier, None, stream_id, qos));
        self.by_peer_bcast_sink.entry(peer).or_default().push(setup_id);
        (setup_id, stream_id)
    }

    pub fn setup(&self, id: SetupId) -> Option<&Setup> {
        self.setups.get(id)
    }

    pub fn setup_mut(&mut self, id: SetupId) -> Option<&mut Setup> {
        self.setups.get_mut(id)
    }

    pub fn stream(&self, id: StreamId) -> Option<&crate::stream::Stream> {
        self.streams.get(id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut crate::stream::Stream> {
        self.streams.get_mut(id)
    }

    pub fn setups_for_endpoint(&self, endpoint: &str) -> &[SetupId] {
        self.by_endpoint.get(endpoint).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bcast_sink_setups_for_peer(&self, peer: &str) -> &[SetupId] {
        self.by_peer_bcast_sink
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (SetupId, &Setup)> {
        self.setups.iter()
    }

    /// Setup ownership invariant: true iff `id` is referenced by exactly the
    /// collection its parentage implies — the per-endpoint list if it has a
    /// parent, or some peer's broadcast-sink list if it doesn't.
    #[cfg(test)]
    pub fn owned_exactly_once(&self, id: SetupId) -> bool {
        let setup = match self.setups.get(id) {
            Some(s) => s,
            None => return false,
        };
        match &setup.parent_endpoint {
            Some(path) => {
                let in_endpoint = self.by_endpoint.get(path).map_or(0, |v| {
                    v.iter().filter(|&&s| s == id).count()
                });
                let in_any_bcast = self
                    .by_peer_bcast_sink
                    .values()
                    .map(|v| v.iter().filter(|&&s| s == id).count())
                    .sum::<usize>();
                in_endpoint == 1 && in_any_bcast == 0
            }
            None => {
                let in_bcast = self
                    .by_peer_bcast_sink
                    .values()
                    .map(|v| v.iter().filter(|&&s| s == id).count())
                    .sum::<usize>();
                in_bcast == 1
            }
        }
    }

    /// Tears down and frees a Setup: removes it from its owning collection
    /// and its Stream from the arena. The caller is responsible for issuing
    /// `cancel`/closing I/O through the transport *before* calling this —
    /// this method only updates bookkeeping.
    pub fn free(&mut self, id: SetupId) -> Option<Setup> {
        let setup = self.setups.remove(id)?;
        self.streams.remove(setup.stream);
        if let Some(path) = &setup.parent_endpoint {
            if let Some(list) = self.by_endpoint.get_mut(path) {
                list.retain(|&s| s != id);
            }
        } else {
            for list in self.by_peer_bcast_sink.values_mut() {
                list.retain(|&s| s != id);
            }
        }
        Some(setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::UnicastQos;
    use crate::types::Direction;

    #[test]
    fn unicast_setup_owned_by_endpoint_only() {
        let mut sr = SetupRegistry::new();
        let (id, _stream) = sr.create_for_endpoint(
            "/peer/pac_sink0".into(),
            "/peer/pac_sink0".into(),
            Direction::Sink,
            crate::stream::QosKind::Unicast,
            QosConfig::Unicast(UnicastQos::default()),
        );
        assert!(sr.owned_exactly_once(id));
        assert_eq!(sr.setups_for_endpoint("/peer/pac_sink0"), &[id]);
    }

    #[test]
    fn bcast_sink_setup_owned_by_peer_collection_only() {
        let mut sr = SetupRegistry::new();
        let (id, _stream) = sr.create_broadcast_sink(
            "/peer/bis1".into(),
            "peer".into(),
            QosConfig::Broadcast(Default::default()),
        );
        assert!(sr.owned_exactly_once(id));
        assert!(sr.setups_for_endpoint("/peer/bis1").is_empty());
        assert_eq!(sr.bcast_sink_setups_for_peer("peer"), &[id]);
    }

    #[test]
    fn free_removes_setup_and_stream() {
        let mut sr = SetupRegistry::new();
        let (id, stream_id) = sr.create_for_endpoint(
            "/peer/pac_sink0".into(),
            "/peer/pac_sink0".into(),
            Direction::Sink,
            crate::stream::QosKind::Unicast,
            QosConfig::Unicast(UnicastQos::default()),
        );
        sr.free(id);
        assert!(sr.setup(id).is_none());
        assert!(sr.stream(stream_id).is_none());
        assert!(sr.setups_for_endpoint("/peer/pac_sink0").is_empty());
    }

    #[test]
    fn bis_index_parsed_from_identifier() {
        assert_eq!(bis_index_from_identifier("/peer/bis3"), Some(3));
        assert_eq!(bis_index_from_identifier("/peer/pac_sink0"), None);
    }
}
