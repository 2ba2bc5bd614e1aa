//! Stream State Machine (SSM).
//!
//! Per-stream finite state machine driven by asynchronous completion
//! callbacks. Side effects (emitting `qos`/`release` requests, I/O
//! lifecycle events) are returned as an [`Effect`] list rather than
//! performed inline, so the caller ([`crate::adapter::Adapter`]) can route
//! them through the group scheduler before touching the transport.

use crate::arena::Id;
use crate::setup::SetupId;
use crate::transport::OpId;
use crate::types::Direction;

/// Stable handle to a [`Stream`], an index into the adapter's stream arena.
pub type StreamId = Id<Stream>;

/// A Stream's state. `Disabling` is folded into `Releasing` per the
/// transition table, which never names a distinct exit from it.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Config,
    Qos,
    Enabling,
    Streaming,
    Releasing,
}

impl State {
    /// Whether this state is at or beyond CONFIG, i.e. the Stream must have
    /// a valid QoS.
    pub fn at_least_config(self) -> bool {
        !matches!(self, State::Idle)
    }

    /// Whether this state is at or beyond ENABLING, i.e. the Stream must
    /// have an open fd or be in a transient reconnect window.
    pub fn at_least_enabling(self) -> bool {
        matches!(self, State::Enabling | State::Streaming)
    }
}

/// Whether a stream belongs to a unicast (CIG/CIS) or broadcast (BIG/BIS)
/// group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosKind {
    Unicast,
    Broadcast,
}

/// Side effects produced by a state transition, to be carried out by the
/// component driving the SSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Issue a `qos` request for this setup (CONFIG -> QOS path).
    IssueQos,
    /// Ask the group scheduler to (re)open I/O for this stream, deferred
    /// or not, once group-scheduling constraints allow it.
    RequestIo { defer: bool },
    /// Close any open I/O owned by this stream.
    CloseIo,
    /// Cancel the given pending opaque operation before proceeding.
    CancelOp(OpId),
    /// Free the owning Setup; the stream has reached terminal IDLE.
    FreeSetup,
    /// Mark the owning Setup to be recreated once its group becomes idle.
    MarkRecreate,
}

/// Inbound events the SSM consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConfigureSuccess,
    ConfigureFailed,
    QosSuccess,
    QosFailed,
    /// Codec reconfiguration: a CONFIG->CONFIG same-state callback.
    Reconfigure,
    Enable,
    /// Transport reports it is connecting, carrying the accepted fd.
    Connecting,
    /// Transport confirms the stream is ready to pass data.
    TransportReady,
    Release,
    ReleaseAck,
    /// Transport I/O HUP/ERR/NVAL or sync timeout before STREAMING.
    Disconnected,
}

/// A Stream: 1:1 with a [`crate::setup::Setup`] during its lifetime.
#[derive(Debug, Clone)]
pub struct Stream {
    pub setup: SetupId,
    pub direction: Direction,
    pub qos_kind: QosKind,
    pub state: State,
    pub paired_stream: Option<SetupId>,
    pub fd: Option<crate::transport::RawFd>,
    pub pending_op: Option<OpId>,
}

impl Stream {
    pub fn new(setup: SetupId, direction: Direction, qos_kind: QosKind) -> Self {
        Self {
            setup,
            direction,
            qos_kind,
            state: State::Idle,
            paired_stream: None,
            fd: None,
            pending_op: None,
        }
    }

    /// Applies `event`, returning the effects to carry out. Transitions
    /// back to the same state are ignored except CONFIG -> CONFIG, which
    /// re-triggers QoS; once RELEASING, only ReleaseAck can move the
    /// stream, enforcing state monotonicity for terminal-bound streams.
    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        use Event::*;
        use State::*;

        if self.state == Releasing && !matches!(event, ReleaseAck | Disconnected) {
            return Vec::new();
        }

        match (self.state, event) {
            (Idle, ConfigureSuccess) => {
                self.state = Config;
                if self.qos_kind == QosKind::Unicast {
                    vec![Effect::IssueQos]
                } else {
                    Vec::new()
                }
            }
            (Idle, ConfigureFailed) => Vec::new(),

            (Config, QosSuccess) => {
                self.state = Qos;
                vec![Effect::RequestIo { defer: true }]
            }
            (Config, QosFailed) => Vec::new(),
            // Broadcast-sink streams never see QosSuccess/Enable: there is
            // no ASE peer to negotiate QoS with, and BIG-sync confirm is
            // the only completion they ever receive, straight from CONFIG.
            (Config, TransportReady) => {
                self.state = Streaming;
                Vec::new()
            }
            (Config, Reconfigure) => {
                // Cancel any outstanding qos/op-id before issuing the new
                // one, rather than trusting the source's unconditional
                // re-emit.
                let mut effects = Vec::new();
                if let Some(op) = self.pending_op.take() {
                    effects.push(Effect::CancelOp(op));
                }
                effects.push(Effect::IssueQos);
                effects
            }

            (Qos, Enable) => {
                self.state = Enabling;
                vec![Effect::RequestIo { defer: false }]
            }

            (Enabling, Connecting) => Vec::new(),
            (Enabling, TransportReady) => {
                self.state = Streaming;
                Vec::new()
            }

            (Config | Qos | Enabling | Streaming, Release) => {
                self.state = Releasing;
                let mut effects = vec![Effect::CloseIo];
                if let Some(op) = self.pending_op.take() {
                    effects.push(Effect::CancelOp(op));
                }
                effects
            }
            (Releasing, ReleaseAck) => {
                self.state = Idle;
                vec![Effect::FreeSetup]
            }

            (_, Disconnected) => {
                // The visible state never changes on its own; it only
                // tears down I/O and arms the recreate path for the group
                // scheduler.
                self.fd = None;
                vec![Effect::CloseIo, Effect::MarkRecreate]
            }

            // All other (state, event) pairs are same-state or
            // out-of-order callbacks and are ignored.
            _ => Vec::new(),
        }
    }

    pub fn attach_fd(&mut self, fd: crate::transport::RawFd) {
        self.fd = Some(fd);
    }

    pub fn is_releasing_or_idle(&self) -> bool {
        matches!(self.state, State::Releasing | State::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn setup_id() -> SetupId {
        crate::arena::Id::from_raw(0, 0)
    }

    #[test]
    fn unicast_happy_path_chains_qos_then_io() {
        let mut s = Stream::new(setup_id(), Direction::Sink, QosKind::Unicast);
        let effects = s.apply(Event::ConfigureSuccess);
        assert_eq!(s.state, State::Config);
        assert_eq!(effects, vec![Effect::IssueQos]);

        let effects = s.apply(Event::QosSuccess);
        assert_eq!(s.state, State::Qos);
        assert_eq!(effects, vec![Effect::RequestIo { defer: true }]);

        let effects = s.apply(Event::Enable);
        assert_eq!(s.state, State::Enabling);
        assert_eq!(effects, vec![Effect::RequestIo { defer: false }]);

        s.apply(Event::TransportReady);
        assert_eq!(s.state, State::Streaming);
    }

    #[test]
    fn broadcast_configure_does_not_auto_chain_qos() {
        let mut s = Stream::new(setup_id(), Direction::BroadcastSource, QosKind::Broadcast);
        let effects = s.apply(Event::ConfigureSuccess);
        assert_eq!(s.state, State::Config);
        assert!(effects.is_empty());
    }

    #[test]
    fn releasing_is_a_one_way_door() {
        let mut s = Stream::new(setup_id(), Direction::Sink, QosKind::Unicast);
        s.apply(Event::ConfigureSuccess);
        s.apply(Event::QosSuccess);
        s.apply(Event::Release);
        assert_eq!(s.state, State::Releasing);

        // Stray completions while releasing must not move the stream
        // backwards into CONFIG/QOS/ENABLING/STREAMING.
        assert!(s.apply(Event::QosSuccess).is_empty());
        assert_eq!(s.state, State::Releasing);

        let effects = s.apply(Event::ReleaseAck);
        assert_eq!(s.state, State::Idle);
        assert_eq!(effects, vec![Effect::FreeSetup]);
    }

    #[test]
    fn config_to_config_retriggers_qos_and_cancels_pending_op() {
        let mut s = Stream::new(setup_id(), Direction::Sink, QosKind::Unicast);
        s.apply(Event::ConfigureSuccess);
        s.pending_op = Some(OpId(7));
        let effects = s.apply(Event::Reconfigure);
        assert_eq!(effects, vec![Effect::CancelOp(OpId(7)), Effect::IssueQos]);
        assert!(s.pending_op.is_none());
    }

    #[test]
    fn broadcast_sink_goes_straight_from_config_to_streaming() {
        let mut s = Stream::new(setup_id(), Direction::BroadcastSink, QosKind::Broadcast);
        s.apply(Event::ConfigureSuccess);
        assert_eq!(s.state, State::Config);

        let effects = s.apply(Event::TransportReady);
        assert_eq!(s.state, State::Streaming);
        assert!(effects.is_empty());
    }

    #[test]
    fn disconnect_marks_recreate_without_changing_state() {
        let mut s = Stream::new(setup_id(), Direction::Sink, QosKind::Unicast);
        s.apply(Event::ConfigureSuccess);
        s.apply(Event::QosSuccess);
        let effects = s.apply(Event::Disconnected);
        assert_eq!(s.state, State::Qos);
        assert!(effects.contains(&Effect::MarkRecreate));
        assert!(effects.contains(&Effect::CloseIo));
    }
}
