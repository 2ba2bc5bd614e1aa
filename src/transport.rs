//! The transport boundary: everything the engine invokes on the
//! kernel ISO socket layer and the per-stream control-plane protocol
//! (ASCS/BASE signalling), and nothing more. A real Bluetooth daemon
//! implements this trait against `bt_hci`/a kernel ISO socket; tests
//! implement it against an in-memory fake.

use crate::qos::QosConfig;
use crate::types::PeerAddr;

/// A raw kernel ISO socket file descriptor. Ownership rules are spec'd in
/// §5: the engine owns it until the stream leaves ENABLING, then ownership
/// transfers to the transport; on any failure path the engine closes it
/// exactly once.
pub type RawFd = i32;

/// An opaque identifier for an outstanding asynchronous control operation
/// (configure/qos/enable/release/metadata). Completion arrives later via
/// [`crate::engine::Engine::state_changed`] or an equivalent callback;
/// cancellation goes through [`Transport::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

/// A listening or connecting ISO channel, carrying a watch for HUP/ERR/NVAL
/// and a confirm callback. The concrete implementation owns the
/// underlying socket; the engine only ever sees this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

/// The transport operations the engine invokes.
pub trait Transport {
    /// Issues a codec configuration request for `stream`, returning the
    /// opaque id that will later complete via a state-changed callback.
    fn configure_stream(&mut self, stream: crate::setup::SetupId, caps: &[u8]) -> OpId;

    fn qos_stream(&mut self, stream: crate::setup::SetupId, qos: &QosConfig) -> OpId;

    fn enable_stream(&mut self, stream: crate::setup::SetupId) -> OpId;

    fn release_stream(&mut self, stream: crate::setup::SetupId) -> OpId;

    fn metadata_stream(&mut self, stream: crate::setup::SetupId, metadata: &[u8]) -> OpId;

    /// Cancels a previously issued opaque operation. Must be invoked before
    /// freeing a Setup with an outstanding op.
    fn cancel(&mut self, op: OpId);

    /// Opens a unicast ISO socket toward `dest`, deferred or armed per the
    /// group scheduler's decision.
    fn iso_connect(
        &mut self,
        source: PeerAddr,
        dest: PeerAddr,
        qos: &QosConfig,
        defer: bool,
    ) -> ChannelId;

    /// Opens a broadcast-source ISO socket carrying `base` (the encoded
    /// BASE blob this source is advertising).
    fn iso_connect_broadcast(
        &mut self,
        source: PeerAddr,
        qos: &QosConfig,
        base: &[u8],
        defer: bool,
    ) -> ChannelId;

    /// Opens a PA-sync (and, for big-sync requests, BIG-sync) listener.
    fn iso_listen(&mut self, source: PeerAddr, qos: &QosConfig) -> ChannelId;

    /// Accepts a unicast connection on `channel`, yielding its fd.
    fn iso_accept(&mut self, channel: ChannelId) -> RawFd;

    /// Accepts a broadcast (BIG) connection on `channel` for the given BIS
    /// indices, yielding its fd.
    fn iso_bcast_accept(&mut self, channel: ChannelId, bis_indices: &[u8]) -> RawFd;
}
