//! External Interface Layer (EIL) entry point.
//!
//! `Engine` owns one [`Adapter`] per local Bluetooth controller and is the
//! only type an application built on this crate constructs directly. Every
//! other component (CR, ED, SR, SSM, GS, BP) is reached only through the
//! per-adapter methods here, which dispatch by [`AdapterId`] and fold the
//! adapter's pending endpoint notifications and completed configurations
//! into the caller-supplied [`EngineObserver`] before returning — an
//! `Adapter` on its own never talks to an observer except for the
//! synchronous broadcast-source reply in `set_configuration`.

use std::collections::HashMap;

use crate::adapter::Adapter;
use crate::config::PaPipelineConfig;
use crate::endpoint::EndpointNotification;
use crate::error::EngineError;
use crate::observer::EngineObserver;
use crate::pac::{Pac, PacEvent, PacHandle, PreferredQos};
use crate::qos::Properties;
use crate::setup::SetupRegistry;
use crate::stream::{Event as StreamEvent, StreamId};
use crate::transport::{RawFd, Transport};
use crate::types::{AdapterId, CodecId, Contexts, Direction, LtvBlob, Locations, PeerAddr};

/// Owns every local controller's [`Adapter`] and exposes the profile's
/// public surface.
#[derive(Default)]
pub struct Engine {
    adapters: HashMap<AdapterId, Adapter>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter for local controller `id`. Replaces any existing
    /// adapter under the same id without tearing down its setups through a
    /// transport first — callers that want a clean handover should call
    /// [`Engine::remove_adapter`] (or drive `remove_peer` for every known
    /// peer) beforehand.
    pub fn add_adapter(&mut self, id: AdapterId, path: impl Into<String>, source_addr: PeerAddr) {
        self.adapters.insert(id, Adapter::new(id, path, source_addr));
    }

    /// As [`Engine::add_adapter`], with the pipeline's tick period and sync
    /// timeouts overridden from [`PaPipelineConfig::default`].
    pub fn add_adapter_with_config(
        &mut self,
        id: AdapterId,
        path: impl Into<String>,
        source_addr: PeerAddr,
        config: PaPipelineConfig,
    ) {
        self.adapters.insert(id, Adapter::with_config(id, path, source_addr, config));
    }

    pub fn remove_adapter(&mut self, id: AdapterId) -> Option<Adapter> {
        self.adapters.remove(&id)
    }

    /// The pipeline tick period and sync timeouts in effect for `id`, for an
    /// application's own tick task to read.
    pub fn pipeline_config(&self, id: AdapterId) -> Option<PaPipelineConfig> {
        self.adapters.get(&id).map(Adapter::pipeline_config)
    }

    pub fn adapter(&self, id: AdapterId) -> Option<&Adapter> {
        self.adapters.get(&id)
    }

    pub fn adapter_mut(&mut self, id: AdapterId) -> Option<&mut Adapter> {
        self.adapters.get_mut(&id)
    }

    /// Every currently-registered adapter id, for callers driving
    /// [`Engine::tick`] across the whole fleet.
    pub fn adapter_ids(&self) -> impl Iterator<Item = AdapterId> + '_ {
        self.adapters.keys().copied()
    }

    fn dispatch_endpoint_notifications(adapter: &mut Adapter, observer: &mut dyn EngineObserver) {
        for note in adapter.endpoint_notifications() {
            match note {
                EndpointNotification::Registered(path) => observer.endpoint_registered(&path),
                EndpointNotification::Unregistered(path) => observer.endpoint_unregistered(&path),
                EndpointNotification::PropertiesChanged(path) => {
                    observer.endpoint_properties_changed(&path)
                }
            }
        }
    }

    fn dispatch_completed_configurations(adapter: &mut Adapter, observer: &mut dyn EngineObserver) {
        for path in adapter.take_completed_configurations() {
            observer.configuration_complete(&path, Ok(()));
        }
    }

    fn dispatch_pac_events(adapter: &mut Adapter, observer: &mut dyn EngineObserver) {
        for event in adapter.pac_events() {
            observer.pac_changed(&event);
        }
    }

    fn with_adapter_mut<T>(&mut self, id: AdapterId, f: impl FnOnce(&mut Adapter) -> T) -> Option<T> {
        match self.adapters.get_mut(&id) {
            Some(adapter) => Some(f(adapter)),
            None => {
                crate::warn!("no such adapter");
                None
            }
        }
    }

    // ---- Capability Registry / Endpoint Directory plumbing ----

    pub fn register_local_pac(
        &mut self,
        adapter_id: AdapterId,
        observer: &mut dyn EngineObserver,
        direction: Direction,
        codec: CodecId,
        capabilities: LtvBlob,
        qos: PreferredQos,
        locations: Locations,
        contexts: Contexts,
    ) -> Option<PacHandle> {
        self.with_adapter_mut(adapter_id, |adapter| {
            let handle = adapter.register_local_pac(direction, codec, capabilities, qos, locations, contexts);
            Self::dispatch_pac_events(adapter, observer);
            handle
        })
    }

    /// `pac_added` transport callback.
    pub fn pac_added(&mut self, adapter_id: AdapterId, observer: &mut dyn EngineObserver, peer: &str, pac: Pac) {
        self.with_adapter_mut(adapter_id, |adapter| {
            adapter.pac_added(peer, pac);
            Self::dispatch_pac_events(adapter, observer);
        });
    }

    /// `pac_removed` transport callback. Cascades to any Endpoint and Setup
    /// the removed PAC paired with, surfacing the resulting `Unregistered`
    /// notifications through `observer`.
    pub fn pac_removed(
        &mut self,
        adapter_id: AdapterId,
        transport: &mut dyn Transport,
        observer: &mut dyn EngineObserver,
        peer: &str,
        codec: CodecId,
        direction: Direction,
    ) {
        self.with_adapter_mut(adapter_id, |adapter| {
            adapter.pac_removed(transport, peer, codec, direction);
            Self::dispatch_pac_events(adapter, observer);
            Self::dispatch_endpoint_notifications(adapter, observer);
        });
    }

    /// `ready(session)` transport callback: pairs every matching
    /// local/remote PAC into an Endpoint and reports the resulting
    /// `Registered`/`PropertiesChanged` notifications.
    pub fn ready(
        &mut self,
        adapter_id: AdapterId,
        observer: &mut dyn EngineObserver,
        peer: &str,
    ) {
        self.with_adapter_mut(adapter_id, |adapter| {
            adapter.ready(peer);
            Self::dispatch_endpoint_notifications(adapter, observer);
        });
    }

    /// Registers a local broadcast-source Endpoint, reporting its
    /// `Registered` notification.
    pub fn register_broadcast_source_endpoint(
        &mut self,
        adapter_id: AdapterId,
        observer: &mut dyn EngineObserver,
        local: PacHandle,
    ) -> Option<String> {
        self.with_adapter_mut(adapter_id, |adapter| {
            let path = adapter.register_broadcast_source_endpoint(local);
            Self::dispatch_endpoint_notifications(adapter, observer);
            path
        })
    }

    // ---- SetConfiguration ----

    pub fn set_configuration(
        &mut self,
        adapter_id: AdapterId,
        transport: &mut dyn Transport,
        observer: &mut dyn EngineObserver,
        endpoint_path: &str,
        properties: &Properties,
    ) -> Result<(), EngineError> {
        self.with_adapter_mut(adapter_id, |adapter| {
            adapter.set_configuration(transport, observer, endpoint_path, properties)
        })
        .unwrap_or(Err(EngineError::InvalidArgs("unknown adapter")))
    }

    // ---- Stream State Machine driving ----

    /// Generic stream-state transport callback. Resolves any
    /// `SetConfiguration` whose stream just reached QOS.
    pub fn state_changed(
        &mut self,
        adapter_id: AdapterId,
        transport: &mut dyn Transport,
        observer: &mut dyn EngineObserver,
        stream_id: StreamId,
        event: StreamEvent,
    ) {
        self.with_adapter_mut(adapter_id, |adapter| {
            adapter.state_changed(transport, stream_id, event);
            Self::dispatch_completed_configurations(adapter, observer);
        });
    }

    /// `connecting(stream, in_progress, fd)` transport callback.
    pub fn connecting(
        &mut self,
        adapter_id: AdapterId,
        transport: &mut dyn Transport,
        stream_id: StreamId,
        fd: RawFd,
    ) {
        self.with_adapter_mut(adapter_id, |adapter| adapter.connecting(transport, stream_id, fd));
    }

    // ---- Broadcast pipeline driving ----

    pub fn enqueue_short_sync(&mut self, adapter_id: AdapterId, peer: impl Into<String>) {
        self.with_adapter_mut(adapter_id, |adapter| adapter.enqueue_short_sync(peer));
    }

    pub fn enqueue_big_sync(&mut self, adapter_id: AdapterId, setup: crate::setup::SetupId) {
        self.with_adapter_mut(adapter_id, |adapter| adapter.enqueue_big_sync(setup));
    }

    /// Drives one adapter's PA tick and recreate-when-idle retries (spec
    /// §4.5, §4.6). Callers with more than one adapter iterate
    /// [`Engine::adapter_ids`] and call this once per id, each with the
    /// transport belonging to that controller.
    pub fn tick(&mut self, adapter_id: AdapterId, transport: &mut dyn Transport) {
        self.with_adapter_mut(adapter_id, |adapter| adapter.tick(transport));
    }

    pub fn pa_sync_confirmed(
        &mut self,
        adapter_id: AdapterId,
        transport: &mut dyn Transport,
        peer: &str,
        base_blob: Option<&[u8]>,
    ) {
        self.with_adapter_mut(adapter_id, |adapter| {
            adapter.pa_sync_confirmed(transport, peer, base_blob)
        });
    }

    pub fn big_sync_confirmed(&mut self, adapter_id: AdapterId, transport: &mut dyn Transport, fd: RawFd) {
        self.with_adapter_mut(adapter_id, |adapter| adapter.big_sync_confirmed(transport, fd));
    }

    // ---- Teardown ----

    /// Tears down every Setup and Endpoint belonging to `peer` on `adapter_id`,
    /// reporting `Unregistered` notifications and canceling any pending
    /// `SetConfiguration` with [`EngineError::Canceled`].
    pub fn remove_peer(
        &mut self,
        adapter_id: AdapterId,
        transport: &mut dyn Transport,
        observer: &mut dyn EngineObserver,
        peer: &str,
    ) -> usize {
        self.with_adapter_mut(adapter_id, |adapter| {
            let count = adapter.remove_peer(transport, observer, peer);
            Self::dispatch_endpoint_notifications(adapter, observer);
            count
        })
        .unwrap_or(0)
    }

    /// Direct read access to an adapter's Setup Registry, for diagnostics
    /// and tests that need to inspect state the EIL surface doesn't expose.
    pub fn setups(&self, adapter_id: AdapterId) -> Option<&SetupRegistry> {
        self.adapters.get(&adapter_id).map(Adapter::setups)
    }
}
