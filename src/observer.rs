//! External Interface Layer (EIL) notification sink.
//!
//! An application implements [`EngineObserver`] to learn about Endpoint
//! lifecycle and property changes, and to receive the asynchronous outcome
//! of a `SetConfiguration` call, mirroring the teacher's
//! `LeAudioServerService` read/write event dispatch pattern but for the
//! control-plane surface instead of raw GATT attribute handles.

use crate::error::EngineError;
use crate::pac::PacEvent;

/// Notifications the engine delivers to the application: the Endpoint
/// surface plus the asynchronous `SetConfiguration` outcome.
pub trait EngineObserver {
    /// A local PAC was registered, or a remote PAC was discovered/removed on
    /// some peer — fired before any Endpoint pairing this may cause.
    fn pac_changed(&mut self, event: &PacEvent) {
        let _ = event;
    }

    /// A new Endpoint was registered at `path`.
    fn endpoint_registered(&mut self, path: &str) {
        let _ = path;
    }

    /// The Endpoint at `path` was unregistered.
    fn endpoint_unregistered(&mut self, path: &str) {
        let _ = path;
    }

    /// One of `path`'s cached properties (locations/supported-context/
    /// context) changed.
    fn endpoint_properties_changed(&mut self, path: &str) {
        let _ = path;
    }

    /// The asynchronous outcome of a `SetConfiguration` call against
    /// `endpoint`: success once the stream reaches QOS (unicast) or
    /// immediately (broadcast), or the error that aborted it.
    fn configuration_complete(&mut self, endpoint: &str, result: Result<(), EngineError>) {
        let _ = (endpoint, result);
    }
}

/// An [`EngineObserver`] that records every call, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub registered: Vec<String>,
    pub unregistered: Vec<String>,
    pub properties_changed: Vec<String>,
    pub completions: Vec<(String, Result<(), EngineError>)>,
    pub pac_events: Vec<PacEvent>,
}

#[cfg(test)]
impl EngineObserver for RecordingObserver {
    fn pac_changed(&mut self, event: &PacEvent) {
        self.pac_events.push(event.clone());
    }
    fn endpoint_registered(&mut self, path: &str) {
        self.registered.push(path.to_string());
    }
    fn endpoint_unregistered(&mut self, path: &str) {
        self.unregistered.push(path.to_string());
    }
    fn endpoint_properties_changed(&mut self, path: &str) {
        self.properties_changed.push(path.to_string());
    }
    fn configuration_complete(&mut self, endpoint: &str, result: Result<(), EngineError>) {
        self.completions.push((endpoint.to_string(), result));
    }
}
