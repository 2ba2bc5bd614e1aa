//! Per-adapter aggregate: owned by a single engine handle passed explicitly;
//! there is no ambient state.
//!
//! An `Adapter` wires together the Capability Registry, Endpoint Directory,
//! Setup Registry, Group Scheduler, and Broadcast Pipeline for one local
//! Bluetooth controller, and is the thing [`crate::engine::Engine`] drives
//! on every external call and transport callback.

use std::collections::HashMap;

use crate::base::{self, MatchedBis};
use crate::broadcast_pipeline::{BroadcastPipeline, Dispatch, PaSyncOutcome};
use crate::config::PaPipelineConfig;
use crate::endpoint::{EndpointDirectory, EndpointNotification, EndpointProperties};
use crate::error::EngineError;
use crate::group_scheduler as gs;
use crate::observer::EngineObserver;
use crate::pac::{CapabilityRegistry, Pac, PacHandle};
use crate::qos::{Properties, QosConfig, Value};
use crate::setup::{SetupId, SetupRegistry};
use crate::stream::{Event as StreamEvent, QosKind, StreamId};
use crate::transport::{RawFd, Transport};
use crate::types::{AdapterId, Direction, PeerAddr};

/// A pending `SetConfiguration` completion: resolved once the stream reaches
/// the QOS state for unicast. Broadcast never needs this — its reply is
/// synchronous.
struct PendingCompletion {
    setup: SetupId,
    endpoint: String,
}

pub struct Adapter {
    pub id: AdapterId,
    pub path: String,
    source_addr: PeerAddr,
    capabilities: CapabilityRegistry,
    endpoints: EndpointDirectory,
    setups: SetupRegistry,
    pipeline: BroadcastPipeline,
    pending_completions: Vec<PendingCompletion>,
    /// Maps an externally-visible stream identity back to the owning Setup.
    /// Real transports key their callbacks by *stream*, not Setup — this is
    /// the lookup the engine performs on every inbound callback.
    stream_index: HashMap<StreamId, SetupId>,
    config: PaPipelineConfig,
}

impl Adapter {
    pub fn new(id: AdapterId, path: impl Into<String>, source_addr: PeerAddr) -> Self {
        Self::with_config(id, path, source_addr, PaPipelineConfig::default())
    }

    /// As [`Adapter::new`], with the pipeline tick period and sync timeouts
    /// overridden rather than defaulted. The application's own tick task
    /// reads `pipeline_config().tick_period` to decide how often to call
    /// [`Adapter::tick`]; the engine never schedules its own timer.
    pub fn with_config(
        id: AdapterId,
        path: impl Into<String>,
        source_addr: PeerAddr,
        config: PaPipelineConfig,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            source_addr,
            capabilities: CapabilityRegistry::new(),
            endpoints: EndpointDirectory::new(),
            setups: SetupRegistry::new(),
            pipeline: BroadcastPipeline::new(),
            pending_completions: Vec::new(),
            stream_index: HashMap::new(),
            config,
        }
    }

    pub fn pipeline_config(&self) -> PaPipelineConfig {
        self.config
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut CapabilityRegistry {
        &mut self.capabilities
    }

    pub fn setups(&self) -> &SetupRegistry {
        &self.setups
    }

    // ---- Capability Registry / Endpoint Directory plumbing ----

    /// Registers a local PAC.
    pub fn register_local_pac(
        &mut self,
        direction: Direction,
        codec: crate::types::CodecId,
        capabilities: crate::types::LtvBlob,
        qos: crate::pac::PreferredQos,
        locations: crate::types::Locations,
        contexts: crate::types::Contexts,
    ) -> PacHandle {
        self.capabilities
            .register_local_pac(direction, codec, capabilities, qos, locations, contexts)
    }

    /// `pac_added` transport callback for a remote PAC discovered on `peer`.
    pub fn pac_added(&mut self, peer: &str, pac: Pac) {
        self.capabilities.on_remote_pac_discovered(peer.to_string(), pac);
    }

    /// `pac_removed` transport callback: drops the remote record and
    /// unregisters every Endpoint it paired with one of our local PACs for
    /// this codec/direction, cancelling any outstanding Setup on it.
    pub fn pac_removed(
        &mut self,
        transport: &mut dyn Transport,
        peer: &str,
        codec: crate::types::CodecId,
        direction: Direction,
    ) {
        self.capabilities.on_remote_pac_removed(&peer.to_string(), codec, direction);
        let local_handles: Vec<PacHandle> = self
            .capabilities
            .local_pacs_for(direction)
            .into_iter()
            .filter(|(_, pac)| pac.codec == codec)
            .map(|(handle, _)| handle)
            .collect();
        for local in local_handles {
            if let Some(path) = self.endpoints.unregister(peer, local, None) {
                let setups: Vec<SetupId> = self.setups.setups_for_endpoint(&path).to_vec();
                for setup_id in setups {
                    self.release_setup_now(transport, setup_id);
                }
            }
        }
    }

    /// `ready(session)` transport callback: initial capability exchange with
    /// `peer` is complete, so every matching (local, remote) PAC pair is
    /// registered as an Endpoint.
    pub fn ready(&mut self, peer: &str) {
        let remotes: Vec<Pac> = self.capabilities.remote_pacs(peer).to_vec();
        for direction in [Direction::Sink, Direction::Source] {
            for (local_handle, local_pac) in self.capabilities.local_pacs_for(direction) {
                for remote in remotes.iter().filter(|r| r.direction == direction && r.codec == local_pac.codec) {
                    let properties = EndpointProperties {
                        locations: remote.locations,
                        supported_context: remote.supported_contexts,
                        context: remote.contexts,
                    };
                    self.endpoints.register(
                        peer,
                        &format!("{}/dev_{}", self.path, peer),
                        direction,
                        local_handle,
                        None,
                        properties,
                    );
                }
            }
        }
    }

    /// Registers a local broadcast-source Endpoint (no remote PAC, spec
    /// §3). Exposed so callers don't need the private [`EndpointDirectory`].
    pub fn register_broadcast_source_endpoint(&mut self, local: PacHandle) -> String {
        let path = self.path.clone();
        self.endpoints.register_broadcast_source(&path, local)
    }

    pub fn endpoint_notifications(&mut self) -> Vec<EndpointNotification> {
        self.endpoints.drain_notifications()
    }

    /// Drains the Capability Registry's pending local/remote PAC churn
    /// events, for [`crate::engine::Engine`] to forward through
    /// [`EngineObserver::pac_changed`].
    pub fn pac_events(&mut self) -> Vec<crate::pac::PacEvent> {
        self.capabilities.drain_events()
    }

    // ---- SetConfiguration ----

    pub fn set_configuration(
        &mut self,
        transport: &mut dyn Transport,
        observer: &mut dyn EngineObserver,
        endpoint_path: &str,
        properties: &Properties,
    ) -> Result<(), EngineError> {
        const KNOWN_KEYS: &[&str] = &["Capabilities", "Metadata", "QoS"];
        for key in properties.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(EngineError::InvalidArgs("unknown SetConfiguration key"));
            }
        }

        let endpoint = self
            .endpoints
            .get(endpoint_path)
            .cloned()
            .ok_or(EngineError::InvalidArgs("unknown endpoint"))?;

        let capabilities = match properties.get("Capabilities") {
            Some(Value::Bytes(b)) => Some(b.clone()),
            Some(_) => return Err(EngineError::InvalidArgs("Capabilities must be bytes")),
            None => None,
        };
        let metadata = match properties.get("Metadata") {
            Some(Value::Bytes(b)) => Some(b.clone()),
            Some(_) => return Err(EngineError::InvalidArgs("Metadata must be bytes")),
            None => None,
        };
        let qos_dict = match properties.get("QoS") {
            Some(Value::Dict(d)) => d.clone(),
            Some(_) => return Err(EngineError::InvalidArgs("QoS must be a dict")),
            None => Properties::new(),
        };

        let is_broadcast_source = endpoint.direction == Direction::BroadcastSource;
        let qos = if endpoint.direction.is_broadcast() {
            QosConfig::Broadcast(QosConfig::parse_broadcast(&qos_dict)?)
        } else {
            QosConfig::Unicast(QosConfig::parse_unicast(&qos_dict)?)
        };
        let qos_kind = if endpoint.direction.is_broadcast() {
            QosKind::Broadcast
        } else {
            QosKind::Unicast
        };

        if !is_broadcast_source {
            // Unicast single-setup replacement semantics: any existing
            // setups on this endpoint are torn down first.
            self.teardown_endpoint_setups(transport, endpoint_path);
        }

        let (setup_id, stream_id) = self.setups.create_for_endpoint(
            endpoint_path.to_string(),
            endpoint_path.to_string(),
            endpoint.direction,
            qos_kind,
            qos,
        );
        self.stream_index.insert(stream_id, setup_id);
        if let Some(setup) = self.setups.setup_mut(setup_id) {
            setup.capabilities = capabilities.clone();
            setup.metadata = metadata.clone();
        }
        if is_broadcast_source {
            self.auto_assign_broadcast_group(setup_id);
        }

        let op = transport.configure_stream(setup_id, capabilities.as_deref().unwrap_or(&[]));
        if let Some(stream) = self.setups.stream_mut(stream_id) {
            stream.pending_op = Some(op);
        }

        // Mirrors bap.c's SetConfiguration handler: push metadata
        // immediately alongside configure whenever the caller supplied any,
        // rather than waiting for a separate SetMetadata-equivalent call.
        if let Some(metadata) = metadata.as_deref().filter(|m| !m.is_empty()) {
            let _ = transport.metadata_stream(setup_id, metadata);
        }

        if is_broadcast_source {
            // Broadcast completes immediately: drive the local state
            // forward synchronously rather than waiting on a remote ack,
            // since there is no ASE peer to ack a broadcast source. The
            // resulting socket-open decision is *not* driven synchronously
            // though — a sibling BIS in the same BIG may be configured by
            // the very next call, and the batch-open ordering needs every
            // member visible before any of them opens. Park it for the
            // next tick instead, same as a deferred recreate.
            self.apply_stream_event(transport, setup_id, StreamEvent::ConfigureSuccess);
            let stream_id = self.setups.setup(setup_id).map(|s| s.stream);
            let effects = stream_id
                .and_then(|id| self.setups.stream_mut(id))
                .map(|stream| stream.apply(StreamEvent::QosSuccess))
                .unwrap_or_default();
            for effect in effects {
                match effect {
                    crate::stream::Effect::RequestIo { .. } => {
                        if let Some(setup) = self.setups.setup_mut(setup_id) {
                            setup.recreate_when_idle = true;
                        }
                    }
                    other => self.run_effect(transport, setup_id, other),
                }
            }
            observer.configuration_complete(endpoint_path, Ok(()));
        } else {
            self.pending_completions.push(PendingCompletion {
                setup: setup_id,
                endpoint: endpoint_path.to_string(),
            });
        }

        Ok(())
    }

    fn teardown_endpoint_setups(&mut self, transport: &mut dyn Transport, endpoint_path: &str) {
        let existing: Vec<SetupId> = self.setups.setups_for_endpoint(endpoint_path).to_vec();
        for setup_id in existing {
            self.release_setup_now(transport, setup_id);
        }
    }

    /// Immediately cancels any outstanding op, closes I/O, and frees a
    /// Setup — used for local replacement teardown and cancellation paths
    /// where there is no peer ack to wait for.
    fn release_setup_now(&mut self, transport: &mut dyn Transport, setup_id: SetupId) {
        if let Some(setup) = self.setups.setup(setup_id) {
            let stream_id = setup.stream;
            if let Some(stream) = self.setups.stream(stream_id) {
                if let Some(op) = stream.pending_op {
                    transport.cancel(op);
                }
            }
        }
        self.free_setup(setup_id);
    }

    fn free_setup(&mut self, setup_id: SetupId) {
        if let Some(setup) = self.setups.setup(setup_id) {
            self.stream_index.remove(&setup.stream);
        }
        self.setups.free(setup_id);
        self.pending_completions.retain(|p| p.setup != setup_id);
    }

    // ---- Stream State Machine driving ----

    pub fn state_changed(&mut self, transport: &mut dyn Transport, stream_id: StreamId, event: StreamEvent) {
        if let Some(&setup_id) = self.stream_index.get(&stream_id) {
            self.apply_stream_event(transport, setup_id, event);
        }
    }

    /// `connecting(stream, in_progress, fd)` transport callback: attaches the
    /// fd and, if the CIG/CIS was still unset, extracts real ids now — per
    /// §4.4's ENABLING row, unicast ids are only finalized at this point.
    pub fn connecting(&mut self, transport: &mut dyn Transport, stream_id: StreamId, fd: RawFd) {
        let Some(&setup_id) = self.stream_index.get(&stream_id) else {
            return;
        };
        self.apply_stream_event(transport, setup_id, StreamEvent::Connecting);
        if let Some(stream) = self.setups.stream_mut(stream_id) {
            stream.attach_fd(fd);
        }
        self.auto_assign_unicast_group(setup_id);
    }

    /// Auto-assigns CIG/CIS for a unicast setup still carrying either as
    /// "unset", drawing both from one shared, monotonically increasing
    /// counter (rather than separate per-field counters) so a setup that
    /// needs both never has them collide on the same value.
    fn auto_assign_unicast_group(&mut self, setup_id: SetupId) {
        let needs_cig = matches!(
            self.setups.setup(setup_id).map(|s| &s.qos),
            Some(QosConfig::Unicast(u)) if u.cig.is_unset()
        );
        if needs_cig {
            let next = self.next_unicast_id();
            if let Some(QosConfig::Unicast(u)) = self.setups.setup_mut(setup_id).map(|s| &mut s.qos) {
                u.cig = crate::types::GroupId(next);
            }
        }
        let needs_cis = matches!(
            self.setups.setup(setup_id).map(|s| &s.qos),
            Some(QosConfig::Unicast(u)) if u.cis.is_unset()
        );
        if needs_cis {
            let next = self.next_unicast_id();
            if let Some(QosConfig::Unicast(u)) = self.setups.setup_mut(setup_id).map(|s| &mut s.qos) {
                u.cis = crate::types::StreamTag(next);
            }
        }
    }

    /// The next id unused by any CIG or CIS on the adapter, starting at 1
    /// (0 is a legitimate id on the wire, but reserving it here keeps a
    /// freshly auto-assigned CIG/CIS visibly distinct from a zeroed QoS
    /// struct that never got configured at all).
    fn next_unicast_id(&self) -> u8 {
        let max = self
            .setups
            .iter()
            .filter_map(|(_, s)| match &s.qos {
                QosConfig::Unicast(u) => Some([(!u.cig.is_unset()).then_some(u.cig.0), (!u.cis.is_unset()).then_some(u.cis.0)]),
                QosConfig::Broadcast(_) => None,
            })
            .flatten()
            .flatten()
            .max();
        max.map(|m| m.wrapping_add(1)).unwrap_or(1)
    }

    /// Auto-assigns BIG/BIS for a broadcast-source setup still carrying
    /// either as "unset". Unlike unicast, this must happen before the
    /// setup leaves CONFIG: the group scheduler's batch-open ordering
    /// sorts by BIS index before any socket in the BIG is opened, long
    /// before a `connecting` callback could ever fire for it.
    fn auto_assign_broadcast_group(&mut self, setup_id: SetupId) {
        let next_big = self.next_free_group_id(|q| match q {
            QosConfig::Broadcast(b) => Some(b.big),
            QosConfig::Unicast(_) => None,
        });
        let next_bis = self.next_free_stream_tag(|q| match q {
            QosConfig::Broadcast(b) => Some(b.bis),
            QosConfig::Unicast(_) => None,
        });
        if let Some(setup) = self.setups.setup_mut(setup_id) {
            if let QosConfig::Broadcast(b) = &mut setup.qos {
                if b.big.is_unset() {
                    b.big = next_big;
                }
                if b.bis.is_unset() {
                    b.bis = next_bis;
                }
            }
        }
    }

    fn next_free_group_id(&self, extract: impl Fn(&QosConfig) -> Option<crate::types::GroupId>) -> crate::types::GroupId {
        let max = self
            .setups
            .iter()
            .filter_map(|(_, s)| extract(&s.qos))
            .filter(|g| !g.is_unset())
            .map(|g| g.0)
            .max();
        crate::types::GroupId(max.map(|m| m.wrapping_add(1)).unwrap_or(0))
    }

    fn next_free_stream_tag(&self, extract: impl Fn(&QosConfig) -> Option<crate::types::StreamTag>) -> crate::types::StreamTag {
        let max = self
            .setups
            .iter()
            .filter_map(|(_, s)| extract(&s.qos))
            .filter(|t| !t.is_unset())
            .map(|t| t.0)
            .max();
        crate::types::StreamTag(max.map(|m| m.wrapping_add(1)).unwrap_or(0))
    }

    fn apply_stream_event(&mut self, transport: &mut dyn Transport, setup_id: SetupId, event: StreamEvent) {
        let Some(setup) = self.setups.setup(setup_id) else { return };
        let stream_id = setup.stream;
        let Some(stream) = self.setups.stream_mut(stream_id) else { return };
        let effects = stream.apply(event);
        for effect in effects {
            self.run_effect(transport, setup_id, effect);
        }
    }

    /// Drains endpoints whose pending `SetConfiguration` just reached QOS,
    /// for the caller to notify via [`EngineObserver::configuration_complete`].
    pub fn take_completed_configurations(&mut self) -> Vec<String> {
        let mut done = Vec::new();
        self.pending_completions.retain(|p| {
            let at_qos = self
                .setups
                .setup(p.setup)
                .and_then(|s| self.setups.stream(s.stream))
                .map(|s| s.state == crate::stream::State::Qos)
                .unwrap_or(true); // setup vanished: treat as resolved (cancel path notifies separately)
            if at_qos {
                done.push(p.endpoint.clone());
                false
            } else {
                true
            }
        });
        done
    }

    fn run_effect(&mut self, transport: &mut dyn Transport, setup_id: SetupId, effect: crate::stream::Effect) {
        use crate::stream::Effect::*;
        match effect {
            IssueQos => {
                let Some(setup) = self.setups.setup(setup_id) else { return };
                let stream_id = setup.stream;
                let op = transport.qos_stream(setup_id, &setup.qos);
                if let Some(stream) = self.setups.stream_mut(stream_id) {
                    stream.pending_op = Some(op);
                }
            }
            RequestIo { defer } => self.request_io(transport, setup_id, defer),
            CloseIo => self.close_io(setup_id),
            CancelOp(op) => transport.cancel(op),
            FreeSetup => self.free_setup(setup_id),
            MarkRecreate => {
                if let Some(setup) = self.setups.setup_mut(setup_id) {
                    setup.recreate_when_idle = true;
                }
            }
        }
    }

    fn request_io(&mut self, transport: &mut dyn Transport, setup_id: SetupId, defer: bool) {
        let Some(setup) = self.setups.setup(setup_id) else { return };
        match setup.qos.clone() {
            QosConfig::Unicast(q) => {
                if gs::may_create_unicast_socket(&self.setups, q.cig) {
                    let channel = transport.iso_connect(self.source_addr, self.source_addr, &setup.qos, defer);
                    if let Some(setup) = self.setups.setup_mut(setup_id) {
                        setup.channel = Some(channel);
                        setup.group_active = !defer;
                    }
                } else if let Some(setup) = self.setups.setup_mut(setup_id) {
                    setup.recreate_when_idle = true;
                }
            }
            QosConfig::Broadcast(q) => self.drive_broadcast_group(transport, q.big),
        }
    }

    /// Broadcast-source ordering: opens every setup in `big` that the
    /// scheduler decides is ready, in the order and `defer` value it
    /// prescribes.
    fn drive_broadcast_group(&mut self, transport: &mut dyn Transport, big: crate::types::GroupId) {
        let decisions = gs::broadcast_open_decisions(&self.setups, big);
        if decisions.is_empty() {
            return;
        }
        let base = self.build_broadcast_base(big);
        for decision in decisions {
            let Some(setup) = self.setups.setup(decision.setup) else { continue };
            let channel = transport.iso_connect_broadcast(self.source_addr, &setup.qos, &base, decision.defer);
            if let Some(setup) = self.setups.setup_mut(decision.setup) {
                setup.channel = Some(channel);
                setup.group_active = !decision.defer;
            }
        }
    }

    /// Builds the BASE blob shared by every BIS socket in `big`: one
    /// subgroup covering all broadcast-source setups currently assigned to
    /// it, the codec taken from the endpoint's local PAC, and each setup's
    /// configured capabilities carried as that BIS's level-3 caps.
    fn build_broadcast_base(&self, big: crate::types::GroupId) -> crate::types::LtvBlob {
        let members: Vec<_> = self
            .setups
            .iter()
            .filter(|(_, s)| matches!(&s.qos, QosConfig::Broadcast(q) if q.big == big))
            .map(|(_, s)| s)
            .collect();
        let Some(first) = members.first() else {
            return Vec::new();
        };
        let codec = first
            .parent_endpoint
            .as_ref()
            .and_then(|path| self.endpoints.get(path))
            .and_then(|ep| self.capabilities.local_pac(ep.local_pac))
            .map(|pac| pac.codec)
            .unwrap_or_default();
        let presentation_delay = match &first.qos {
            QosConfig::Broadcast(q) => q.presentation_delay,
            QosConfig::Unicast(_) => 0,
        };
        let metadata = first.metadata.clone().unwrap_or_default();

        let mut bises: Vec<base::EncodeBis> = members
            .iter()
            .map(|s| {
                let bis_index = match &s.qos {
                    QosConfig::Broadcast(q) => q.bis.0,
                    QosConfig::Unicast(_) => 0,
                };
                base::EncodeBis {
                    bis_index,
                    level_3_caps: s.capabilities.clone().unwrap_or_default(),
                }
            })
            .collect();
        bises.sort_by_key(|b| b.bis_index);

        base::encode_base(
            presentation_delay,
            &[base::EncodeSubgroup {
                codec,
                level_2_caps: Vec::new(),
                metadata,
                bises,
            }],
        )
    }

    fn close_io(&mut self, setup_id: SetupId) {
        if let Some(setup) = self.setups.setup_mut(setup_id) {
            setup.channel = None;
            setup.group_active = false;
        }
        self.schedule_recreate_sweep(setup_id);
    }

    /// Schedules siblings marked `recreate_when_idle` for the next tick
    /// rather than re-entering synchronously: the recreate sweep is always
    /// driven from a deferred (next-tick) callback, never synchronously
    /// re-entrant.
    fn schedule_recreate_sweep(&mut self, closed: SetupId) {
        let candidates = gs::recreate_candidates(&self.setups, closed);
        if !candidates.is_empty() {
            crate::debug!("recreate sweep: {} sibling setup(s) waiting on this group", candidates.len());
        }
        // Candidates already carry `recreate_when_idle = true`; the next
        // `Adapter::tick` is the only place that clears it and retries.
    }

    // ---- Broadcast pipeline driving ----

    pub fn enqueue_short_sync(&mut self, peer: impl Into<String>) {
        let _ = self.pipeline.enqueue_short_sync(peer.into());
    }

    pub fn enqueue_big_sync(&mut self, setup: SetupId) {
        let _ = self.pipeline.enqueue_big_sync(setup);
    }

    /// Drives the PA tick and the recreate-when-idle retries, picked back up
    /// from the next idle tick.
    pub fn tick(&mut self, transport: &mut dyn Transport) {
        self.retry_recreates(transport);

        let setups = &self.setups;
        let dispatch = self.pipeline.tick(transport, self.source_addr, |kind| match kind {
            crate::broadcast_pipeline::RequestKind::ShortSync { .. } => {
                QosConfig::Broadcast(Default::default())
            }
            crate::broadcast_pipeline::RequestKind::BigSync { setup } => setups
                .setup(*setup)
                .map(|s| s.qos.clone())
                .unwrap_or(QosConfig::Broadcast(Default::default())),
        });
        let _ = dispatch;
    }

    fn retry_recreates(&mut self, transport: &mut dyn Transport) {
        let ready: Vec<SetupId> = self
            .setups
            .iter()
            .filter(|(_, s)| s.recreate_when_idle && s.channel.is_none())
            .map(|(id, _)| id)
            .collect();
        for setup_id in ready {
            let cig_clear = self
                .setups
                .setup(setup_id)
                .map(|s| match &s.qos {
                    QosConfig::Unicast(q) => gs::may_create_unicast_socket(&self.setups, q.cig),
                    QosConfig::Broadcast(_) => true,
                })
                .unwrap_or(false);
            if cig_clear {
                // A setup that never got past QOS is still speculative
                // (defer); one that reached ENABLING/STREAMING before the
                // disconnect should reconnect for real.
                let defer = self
                    .setups
                    .setup(setup_id)
                    .and_then(|s| self.setups.stream(s.stream))
                    .map(|stream| !stream.state.at_least_enabling())
                    .unwrap_or(true);
                if let Some(setup) = self.setups.setup_mut(setup_id) {
                    setup.recreate_when_idle = false;
                }
                self.request_io(transport, setup_id, defer);
            }
        }
    }

    /// Handles a PA-sync confirm on the pipeline's in-flight listener. For
    /// short-sync, parses `base_blob` and creates a broadcast-sink Setup per
    /// matched BIS. For big-sync, triggers a BIG-sync accept via the
    /// transport and awaits its confirm.
    pub fn pa_sync_confirmed(&mut self, transport: &mut dyn Transport, peer: &str, base_blob: Option<&[u8]>) {
        match self.pipeline.pa_sync_confirmed() {
            Some(PaSyncOutcome::ShortSyncComplete) => {
                if let Some(blob) = base_blob {
                    self.create_broadcast_sink_setups(peer, blob);
                }
            }
            Some(PaSyncOutcome::AwaitingBigSync { setup, channel }) => {
                let bis_index = self
                    .setups
                    .setup(setup)
                    .and_then(|s| crate::setup::bis_index_from_identifier(&s.identifier))
                    .unwrap_or(0);
                let _ = transport.iso_bcast_accept(channel, &[bis_index]);
            }
            None => {}
        }
    }

    /// BIG-sync confirm: hands the accepted fd to the Setup's stream and
    /// transitions it to STREAMING.
    pub fn big_sync_confirmed(&mut self, transport: &mut dyn Transport, fd: RawFd) {
        if let Some(setup_id) = self.pipeline.big_sync_confirmed() {
            if let Some(setup) = self.setups.setup(setup_id) {
                let stream_id = setup.stream;
                if let Some(stream) = self.setups.stream_mut(stream_id) {
                    stream.attach_fd(fd);
                }
                self.apply_stream_event(transport, setup_id, StreamEvent::TransportReady);
            }
        }
    }

    /// Creates one broadcast-sink Setup per matched BIS: no I/O is opened
    /// here, and each stream is configured/metadata-set locally (there's no
    /// remote peer ack for a sink-side BIS discovery record).
    fn create_broadcast_sink_setups(&mut self, peer: &str, base_blob: &[u8]) -> Vec<SetupId> {
        let matched: Vec<MatchedBis> = base::parse_base(base_blob, &self.capabilities);
        let mut created = Vec::new();
        for bis in matched {
            let identifier = format!("{}/bis{}", peer, bis.bis_index);
            let qos = QosConfig::Broadcast(crate::qos::BroadcastQos {
                bis: crate::types::StreamTag(bis.bis_index),
                ..Default::default()
            });
            let (setup_id, stream_id) =
                self.setups.create_broadcast_sink(identifier, peer.to_string(), qos);
            self.stream_index.insert(stream_id, setup_id);
            if let Some(setup) = self.setups.setup_mut(setup_id) {
                setup.capabilities = Some(bis.capabilities);
                setup.metadata = Some(bis.metadata);
            }
            if let Some(stream) = self.setups.stream_mut(stream_id) {
                stream.apply(StreamEvent::ConfigureSuccess);
            }
            created.push(setup_id);
        }
        created
    }

    // ---- Teardown ----

    /// Tears down every Setup belonging to `peer`, cancelling outstanding
    /// ops without waiting for an ack.
    pub fn remove_peer(&mut self, transport: &mut dyn Transport, observer: &mut dyn EngineObserver, peer: &str) -> usize {
        let endpoint_paths = self.endpoints.unregister_all_for_peer(peer);
        let mut count = 0;
        for path in &endpoint_paths {
            let ids: Vec<SetupId> = self.setups.setups_for_endpoint(path).to_vec();
            for id in ids {
                self.cancel_setup(transport, observer, id, path.clone());
                count += 1;
            }
        }
        let bcast_ids: Vec<SetupId> = self.setups.bcast_sink_setups_for_peer(peer).to_vec();
        for id in bcast_ids {
            self.cancel_setup(transport, observer, id, peer.to_string());
            count += 1;
        }
        let peer_key = peer.to_string();
        self.pipeline.cancel_matching(|kind| {
            matches!(kind, crate::broadcast_pipeline::RequestKind::ShortSync { peer } if *peer == peer_key)
        });
        count
    }

    fn cancel_setup(
        &mut self,
        transport: &mut dyn Transport,
        observer: &mut dyn EngineObserver,
        setup_id: SetupId,
        endpoint_or_peer: String,
    ) {
        self.pipeline.cancel_matching(|kind| {
            matches!(kind, crate::broadcast_pipeline::RequestKind::BigSync { setup } if *setup == setup_id)
        });
        let had_pending = self.pending_completions.iter().any(|p| p.setup == setup_id);
        self.release_setup_now(transport, setup_id);
        if had_pending {
            observer.configuration_complete(&endpoint_or_peer, Err(EngineError::Canceled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::pac::PreferredQos;
    use crate::qos::{Properties, Value};
    use crate::transport::{ChannelId, OpId};
    use crate::types::{CodecId, Contexts, Locations};
    use bt_hci::param::BdAddr;

    struct FakeTransport {
        next_op: u64,
        next_channel: u64,
        pub connects: Vec<(bool,)>,
        pub cancels: Vec<OpId>,
        pub bcast_connects: Vec<Vec<u8>>,
        pub metadata_calls: Vec<(SetupId, Vec<u8>)>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                next_op: 0,
                next_channel: 0,
                connects: Vec::new(),
                cancels: Vec::new(),
                bcast_connects: Vec::new(),
                metadata_calls: Vec::new(),
            }
        }
        fn op(&mut self) -> OpId {
            self.next_op += 1;
            OpId(self.next_op)
        }
        fn chan(&mut self) -> ChannelId {
            self.next_channel += 1;
            ChannelId(self.next_channel)
        }
    }

    impl Transport for FakeTransport {
        fn configure_stream(&mut self, _stream: SetupId, _caps: &[u8]) -> OpId {
            self.op()
        }
        fn qos_stream(&mut self, _stream: SetupId, _qos: &QosConfig) -> OpId {
            self.op()
        }
        fn enable_stream(&mut self, _stream: SetupId) -> OpId {
            self.op()
        }
        fn release_stream(&mut self, _stream: SetupId) -> OpId {
            self.op()
        }
        fn metadata_stream(&mut self, stream: SetupId, metadata: &[u8]) -> OpId {
            self.metadata_calls.push((stream, metadata.to_vec()));
            self.op()
        }
        fn cancel(&mut self, op: OpId) {
            self.cancels.push(op);
        }
        fn iso_connect(&mut self, _source: PeerAddr, _dest: PeerAddr, _qos: &QosConfig, defer: bool) -> ChannelId {
            self.connects.push((defer,));
            self.chan()
        }
        fn iso_connect_broadcast(&mut self, _source: PeerAddr, _qos: &QosConfig, base: &[u8], defer: bool) -> ChannelId {
            self.connects.push((defer,));
            self.bcast_connects.push(base.to_vec());
            self.chan()
        }
        fn iso_listen(&mut self, _source: PeerAddr, _qos: &QosConfig) -> ChannelId {
            self.chan()
        }
        fn iso_accept(&mut self, _channel: ChannelId) -> RawFd {
            7
        }
        fn iso_bcast_accept(&mut self, _channel: ChannelId, _bis_indices: &[u8]) -> RawFd {
            7
        }
    }

    fn adapter() -> Adapter {
        Adapter::new(AdapterId(0), "/org/bluez/hci0", BdAddr::default())
    }

    fn register_sink_endpoint(adapter: &mut Adapter) -> String {
        adapter.register_local_pac(
            Direction::Sink,
            CodecId::LC3,
            vec![],
            PreferredQos::default(),
            Locations::FRONT_LEFT,
            Contexts::MEDIA,
        );
        adapter.pac_added(
            "peer1",
            Pac {
                direction: Direction::Sink,
                codec: CodecId::LC3,
                capabilities: vec![],
                qos: PreferredQos::default(),
                locations: Locations::FRONT_LEFT,
                supported_contexts: Contexts::MEDIA,
                contexts: Contexts::MEDIA,
            },
        );
        adapter.ready("peer1");
        let notifications = adapter.endpoint_notifications();
        match &notifications[0] {
            EndpointNotification::Registered(path) => path.clone(),
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    #[test]
    fn unicast_configuration_reaches_qos_and_reports_completion() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();
        let endpoint = register_sink_endpoint(&mut adapter);

        let mut qos = Properties::new();
        qos.insert("Interval".into(), Value::U32(10000));
        qos.insert("SDU".into(), Value::U16(40));
        qos.insert("PHY".into(), Value::U8(2));
        qos.insert("Retransmissions".into(), Value::U8(2));
        qos.insert("Latency".into(), Value::U16(10));
        qos.insert("PresentationDelay".into(), Value::U32(40000));
        qos.insert("TargetLatency".into(), Value::U8(2));
        qos.insert("Framing".into(), Value::U8(0));

        let mut props = Properties::new();
        props.insert("Capabilities".into(), Value::Bytes(vec![1, 2, 3]));
        props.insert("QoS".into(), Value::Dict(qos));

        adapter
            .set_configuration(&mut transport, &mut observer, &endpoint, &props)
            .unwrap();

        let setup_id = adapter.setups.setups_for_endpoint(&endpoint)[0];
        let stream_id = adapter.setups.setup(setup_id).unwrap().stream;

        adapter.state_changed(&mut transport, stream_id, StreamEvent::ConfigureSuccess);
        adapter.state_changed(&mut transport, stream_id, StreamEvent::QosSuccess);

        assert_eq!(
            adapter.setups.stream(stream_id).unwrap().state,
            crate::stream::State::Qos
        );
        assert_eq!(adapter.take_completed_configurations(), vec![endpoint.clone()]);
        assert_eq!(observer.completions, vec![]); // Adapter itself doesn't own the observer wiring past set_configuration.

        // CIG/CIS were left unset in the request; the `connecting` callback
        // is where real ids get minted, and they must not collide.
        adapter.connecting(&mut transport, stream_id, 9);
        match adapter.setups.setup(setup_id).unwrap().qos {
            QosConfig::Unicast(q) => {
                assert!(!q.cig.is_unset());
                assert!(!q.cis.is_unset());
                assert_ne!(q.cig.0, 0);
                assert_ne!(q.cis.0, 0);
                assert_ne!(q.cig.0, q.cis.0);
            }
            QosConfig::Broadcast(_) => panic!("expected unicast qos"),
        }
    }

    #[test]
    fn metadata_pushed_to_transport_when_supplied() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();
        let endpoint = register_sink_endpoint(&mut adapter);

        let mut props = Properties::new();
        props.insert("Metadata".into(), Value::Bytes(vec![0x02, 0x01, 0x02]));

        adapter.set_configuration(&mut transport, &mut observer, &endpoint, &props).unwrap();

        let setup_id = adapter.setups.setups_for_endpoint(&endpoint)[0];
        assert_eq!(transport.metadata_calls.len(), 1);
        assert_eq!(transport.metadata_calls[0].0, setup_id);
        assert_eq!(transport.metadata_calls[0].1, vec![0x02, 0x01, 0x02]);
    }

    #[test]
    fn no_metadata_call_when_not_supplied() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();
        let endpoint = register_sink_endpoint(&mut adapter);

        let props = Properties::new();
        adapter.set_configuration(&mut transport, &mut observer, &endpoint, &props).unwrap();
        assert!(transport.metadata_calls.is_empty());
    }

    #[test]
    fn second_setup_on_busy_cig_defers_until_first_releases() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();

        adapter.register_local_pac(
            Direction::Sink,
            CodecId::LC3,
            vec![],
            PreferredQos::default(),
            Locations::FRONT_LEFT,
            Contexts::MEDIA,
        );
        for i in 0..2 {
            adapter.pac_added(
                &format!("peer{i}"),
                Pac {
                    direction: Direction::Sink,
                    codec: CodecId::LC3,
                    capabilities: vec![],
                    qos: PreferredQos::default(),
                    locations: Locations::FRONT_LEFT,
                    supported_contexts: Contexts::MEDIA,
                    contexts: Contexts::MEDIA,
                },
            );
            adapter.ready(&format!("peer{i}"));
        }
        let notifications = adapter.endpoint_notifications();
        let e1 = match &notifications[0] {
            EndpointNotification::Registered(p) => p.clone(),
            _ => panic!(),
        };
        let e2 = match &notifications[1] {
            EndpointNotification::Registered(p) => p.clone(),
            _ => panic!(),
        };

        let mut qos = Properties::new();
        qos.insert("CIG".into(), Value::U8(3));
        let mut props = Properties::new();
        props.insert("QoS".into(), Value::Dict(qos));

        adapter.set_configuration(&mut transport, &mut observer, &e1, &props).unwrap();
        adapter.set_configuration(&mut transport, &mut observer, &e2, &props).unwrap();

        let s1 = adapter.setups.setups_for_endpoint(&e1)[0];
        let s2 = adapter.setups.setups_for_endpoint(&e2)[0];
        let st1 = adapter.setups.setup(s1).unwrap().stream;
        let st2 = adapter.setups.setup(s2).unwrap().stream;

        adapter.state_changed(&mut transport, st1, StreamEvent::ConfigureSuccess);
        adapter.state_changed(&mut transport, st1, StreamEvent::QosSuccess);
        adapter.state_changed(&mut transport, st1, StreamEvent::Enable);
        assert!(adapter.setups.setup(s1).unwrap().group_active);

        adapter.state_changed(&mut transport, st2, StreamEvent::ConfigureSuccess);
        adapter.state_changed(&mut transport, st2, StreamEvent::QosSuccess);
        adapter.state_changed(&mut transport, st2, StreamEvent::Enable);
        assert!(!adapter.setups.setup(s2).unwrap().group_active);
        assert!(adapter.setups.setup(s2).unwrap().recreate_when_idle);

        // First setup's I/O closes -> release -> recreate sweep schedules s2.
        adapter.state_changed(&mut transport, st1, StreamEvent::Release);
        adapter.state_changed(&mut transport, st1, StreamEvent::ReleaseAck);
        adapter.tick(&mut transport);
        assert!(adapter.setups.setup(s2).unwrap().group_active);
    }

    #[test]
    fn two_bis_broadcast_source_batches_into_one_big_after_tick() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();

        adapter.register_local_pac(
            Direction::BroadcastSource,
            CodecId::LC3,
            vec![],
            PreferredQos::default(),
            Locations::empty(),
            Contexts::empty(),
        );
        let path = adapter.register_broadcast_source_endpoint(PacHandle::from(1u32));

        let mut qos = Properties::new();
        qos.insert("BIG".into(), Value::U8(5));
        let mut props = Properties::new();
        props.insert("QoS".into(), Value::Dict(qos));

        adapter.set_configuration(&mut transport, &mut observer, &path, &props).unwrap();
        adapter.set_configuration(&mut transport, &mut observer, &path, &props).unwrap();

        let setups = adapter.setups.setups_for_endpoint(&path).to_vec();
        assert_eq!(setups.len(), 2);

        // Neither BIS opens a socket until both Setups have reached CONFIG.
        for &id in &setups {
            assert!(adapter.setups.setup(id).unwrap().channel.is_none());
        }

        adapter.tick(&mut transport);

        let bis_of = |id: SetupId| match &adapter.setups.setup(id).unwrap().qos {
            QosConfig::Broadcast(b) => b.bis,
            _ => panic!("expected broadcast qos"),
        };
        assert_ne!(bis_of(setups[0]), bis_of(setups[1]));

        // Both BIS sockets open with the same encoded BASE blob, carrying
        // both BISes in one subgroup.
        assert_eq!(transport.bcast_connects.len(), 2);
        assert_eq!(transport.bcast_connects[0], transport.bcast_connects[1]);
        let mut sink_cr = crate::pac::CapabilityRegistry::new();
        sink_cr.register_local_pac(
            Direction::BroadcastSink,
            CodecId::LC3,
            vec![],
            PreferredQos::default(),
            Locations::empty(),
            Contexts::empty(),
        );
        let matched = crate::base::parse_base(&transport.bcast_connects[0], &sink_cr);
        assert_eq!(matched.len(), 2);

        for &id in &setups {
            assert!(adapter.setups.setup(id).unwrap().channel.is_some());
        }
        let (lo, hi) = if bis_of(setups[0]).0 < bis_of(setups[1]).0 {
            (setups[0], setups[1])
        } else {
            (setups[1], setups[0])
        };
        assert!(!adapter.setups.setup(lo).unwrap().group_active);
        assert!(adapter.setups.setup(hi).unwrap().group_active);

        for &id in &setups {
            let stream_id = adapter.setups.setup(id).unwrap().stream;
            adapter.state_changed(&mut transport, stream_id, StreamEvent::Enable);
            adapter.state_changed(&mut transport, stream_id, StreamEvent::TransportReady);
            assert_eq!(
                adapter.setups.stream(stream_id).unwrap().state,
                crate::stream::State::Streaming
            );
        }
    }

    #[test]
    fn invalid_broadcast_code_rejected_without_creating_setup() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();
        let endpoint = register_sink_endpoint(&mut adapter);

        let mut qos = Properties::new();
        qos.insert("BCode".into(), Value::Bytes(vec![0u8; 8]));
        let mut props = Properties::new();
        props.insert("QoS".into(), Value::Dict(qos));

        // Sink endpoints parse unicast QoS, so BCode is simply unknown there;
        // use a broadcast-source endpoint instead to exercise BCode validation
        // directly.
        adapter.register_local_pac(
            Direction::BroadcastSource,
            CodecId::LC3,
            vec![],
            PreferredQos::default(),
            Locations::empty(),
            Contexts::empty(),
        );
        let bcast_path = adapter.register_broadcast_source_endpoint(PacHandle::from(100u32));
        let result = adapter.set_configuration(&mut transport, &mut observer, &bcast_path, &props);
        assert_eq!(result, Err(EngineError::InvalidArgs("BCode must be 16 bytes")));
        assert!(adapter.setups.setups_for_endpoint(&bcast_path).is_empty());
        let _ = endpoint;
    }

    #[test]
    fn broadcast_sink_discovers_bises_from_base_after_pa_sync() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();

        adapter.register_local_pac(
            Direction::BroadcastSink,
            CodecId::LC3,
            vec![],
            PreferredQos::default(),
            Locations::empty(),
            Contexts::empty(),
        );

        adapter.enqueue_short_sync("peer9");
        adapter.tick(&mut transport);

        let mut base_blob = Vec::new();
        base_blob.extend_from_slice(&[0x40, 0x00, 0x00]); // presentation delay
        base_blob.push(1); // one subgroup
        base_blob.push(2); // two BISes in the subgroup
        base_blob.extend_from_slice(&[CodecId::LC3.id, 0x00, 0x00, 0x00, 0x00]);
        base_blob.push(2); // level-2 caps len
        base_blob.extend_from_slice(&[0xAA, 0xBB]);
        base_blob.push(1); // metadata len
        base_blob.push(0x01);
        for idx in [1u8, 2u8] {
            base_blob.push(idx);
            base_blob.push(1); // level-3 caps len
            base_blob.push(0xCC);
        }

        adapter.pa_sync_confirmed(&mut transport, "peer9", Some(&base_blob));

        let created = adapter.setups.bcast_sink_setups_for_peer("peer9").to_vec();
        assert_eq!(created.len(), 2);
        for id in created {
            let setup = adapter.setups.setup(id).unwrap();
            assert!(setup.parent_endpoint.is_none());
            let stream = adapter.setups.stream(setup.stream).unwrap();
            assert_eq!(stream.state, crate::stream::State::Config);
        }
    }

    #[test]
    fn removing_peer_during_qos_cancels_pending_configuration() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();
        let mut observer = RecordingObserver::default();
        let endpoint = register_sink_endpoint(&mut adapter);

        let props = Properties::new();
        adapter.set_configuration(&mut transport, &mut observer, &endpoint, &props).unwrap();
        let setup_id = adapter.setups.setups_for_endpoint(&endpoint)[0];
        let stream_id = adapter.setups.setup(setup_id).unwrap().stream;
        adapter.state_changed(&mut transport, stream_id, StreamEvent::ConfigureSuccess);

        let fd_count_before = transport.cancels.len();
        let cancelled = adapter.remove_peer(&mut transport, &mut observer, "peer1");
        assert_eq!(cancelled, 1);
        assert_eq!(observer.completions.len(), 1);
        assert_eq!(observer.completions[0].0, endpoint);
        assert_eq!(observer.completions[0].1, Err(EngineError::Canceled));
        assert_eq!(transport.cancels.len(), fd_count_before + 1);

        // No further callbacks should find a live setup.
        adapter.state_changed(&mut transport, stream_id, StreamEvent::QosSuccess);
        assert_eq!(observer.completions.len(), 1);
    }

    #[test]
    fn removing_peer_purges_its_queued_broadcast_request_so_the_next_peer_is_not_blocked() {
        let mut adapter = adapter();
        let mut transport = FakeTransport::new();

        adapter.enqueue_short_sync("stale_peer");
        adapter.enqueue_short_sync("other_peer");
        adapter.tick(&mut transport);
        assert_eq!(adapter.pipeline.len(), 2);
        assert!(adapter.pipeline.has_request_in_progress());

        let mut observer = RecordingObserver::default();
        adapter.remove_peer(&mut transport, &mut observer, "stale_peer");

        // The torn-down peer's in-progress head is gone; the next tick must
        // be free to dispatch "other_peer" instead of waiting behind a
        // zombie slot nobody will ever confirm.
        assert_eq!(adapter.pipeline.len(), 1);
        assert!(!adapter.pipeline.has_request_in_progress());
        let dispatch = adapter.pipeline.tick(&mut transport, adapter.source_addr, |_| {
            crate::qos::QosConfig::Broadcast(crate::qos::BroadcastQos::default())
        });
        assert!(dispatch.is_some());
    }
}
