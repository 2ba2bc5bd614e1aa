//! Broadcast PA/BIG Pipeline (BP).
//!
//! A per-adapter FIFO of broadcast requests (short-lived PA-sync for
//! discovery; PA-sync-plus-BIG-sync for reception), drained one at a time by
//! a periodic tick. Mutually exclusive with itself: short-sync may not
//! overtake big-sync and vice versa, because only the queue's head is ever
//! dispatched.

use heapless::Deque;

use crate::config::MAX_PENDING_BROADCAST_REQUESTS;
use crate::setup::SetupId;
use crate::transport::{ChannelId, RawFd, Transport};
use crate::util::{guarded, Guarded};

/// A peer/service identifier a short-sync request targets.
pub type PeerKey = String;

/// The two request kinds the pipeline serializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Open a PA-sync listener with standard parameters, read the BASE once
    /// synced, then close and free.
    ShortSync { peer: PeerKey },
    /// Open a PA-sync (then BIG-sync) listener carrying a Setup's QoS, and
    /// on confirm hand the resulting fd to that Setup's stream.
    BigSync { setup: SetupId },
}

/// A queued broadcast request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub kind: RequestKind,
    pub in_progress: bool,
}

/// What a drained tick dispatched, for the caller (normally
/// [`crate::adapter::Adapter`]) to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    ShortSyncListening { channel: ChannelId },
    BigSyncListening { setup: SetupId, channel: ChannelId },
}

/// Outcome of a PA-sync confirm's two dispatch branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaSyncOutcome {
    /// Short-sync: the request is already complete; the caller should parse
    /// the delivered BASE blob (`base::parse_base`) and create setups for
    /// each matched BIS.
    ShortSyncComplete,
    /// Big-sync: not complete yet — the caller should now call
    /// `Transport::iso_bcast_accept` for this setup's BIS index and await
    /// `big_sync_confirmed`.
    AwaitingBigSync { setup: SetupId, channel: ChannelId },
}

/// Owns the adapter's broadcast-request FIFO and the in-flight listener
/// channel for whichever request is currently dispatched. The active
/// channel is [`Guarded`]: a tick and a later confirm callback both touch
/// it, never concurrently, but from separate call frames — the same
/// invariant the single-dispatcher model is built on.
pub struct BroadcastPipeline {
    queue: Deque<BroadcastRequest, MAX_PENDING_BROADCAST_REQUESTS>,
    active_channel: Guarded<Option<ChannelId>>,
}

impl Default for BroadcastPipeline {
    fn default() -> Self {
        Self {
            queue: Deque::new(),
            active_channel: guarded(None),
        }
    }
}

impl BroadcastPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a short-sync request. Returns the request back if the queue
    /// is at capacity (spec places no hard bound, but a bounded FIFO needs
    /// an explicit backpressure signal instead of panicking).
    pub fn enqueue_short_sync(&mut self, peer: PeerKey) -> Result<(), PeerKey> {
        self.queue
            .push_back(BroadcastRequest {
                kind: RequestKind::ShortSync { peer },
                in_progress: false,
            })
            .map_err(|req| match req.kind {
                RequestKind::ShortSync { peer } => peer,
                RequestKind::BigSync { .. } => unreachable!(),
            })
    }

    pub fn enqueue_big_sync(&mut self, setup: SetupId) -> Result<(), SetupId> {
        self.queue
            .push_back(BroadcastRequest {
                kind: RequestKind::BigSync { setup },
                in_progress: false,
            })
            .map_err(|req| match req.kind {
                RequestKind::BigSync { setup } => setup,
                RequestKind::ShortSync { .. } => unreachable!(),
            })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// At most one request may be in progress at a time.
    pub fn has_request_in_progress(&self) -> bool {
        self.queue.front().map_or(false, |r| r.in_progress)
    }

    /// Drains one tick:
    /// 1. If any request is in progress, do nothing.
    /// 2. Peek the head; if none, stop.
    /// 3. Otherwise mark it in progress and dispatch by kind.
    pub fn tick(
        &mut self,
        transport: &mut dyn Transport,
        source: crate::types::PeerAddr,
        qos_for: impl FnOnce(&RequestKind) -> crate::qos::QosConfig,
    ) -> Option<Dispatch> {
        if self.has_request_in_progress() {
            return None;
        }
        let head = self.queue.front_mut()?;
        head.in_progress = true;
        let qos = qos_for(&head.kind);

        match &head.kind {
            RequestKind::ShortSync { .. } => {
                let channel = transport.iso_listen(source, &qos);
                self.active_channel.lock(|c| *c.borrow_mut() = Some(channel));
                Some(Dispatch::ShortSyncListening { channel })
            }
            RequestKind::BigSync { setup } => {
                let channel = transport.iso_listen(source, &qos);
                self.active_channel.lock(|c| *c.borrow_mut() = Some(channel));
                Some(Dispatch::BigSyncListening {
                    setup: *setup,
                    channel,
                })
            }
        }
    }

    /// Handles a PA-sync confirm on the currently in-flight listener. For a
    /// short-sync request this completes and frees it, allowing the next
    /// tick to dispatch; for a big-sync request it stays in progress,
    /// awaiting [`BroadcastPipeline::big_sync_confirmed`].
    pub fn pa_sync_confirmed(&mut self) -> Option<PaSyncOutcome> {
        let channel = self.active_channel.lock(|c| *c.borrow())?;
        let head = self.queue.front()?;
        if !head.in_progress {
            return None;
        }
        match &head.kind {
            RequestKind::ShortSync { .. } => {
                self.complete_head();
                Some(PaSyncOutcome::ShortSyncComplete)
            }
            RequestKind::BigSync { setup } => {
                Some(PaSyncOutcome::AwaitingBigSync {
                    setup: *setup,
                    channel,
                })
            }
        }
    }

    /// Handles a BIG-sync confirm, completing and freeing a big-sync
    /// request. Returns the setup whose stream should now receive `fd` and
    /// transition to STREAMING.
    pub fn big_sync_confirmed(&mut self) -> Option<SetupId> {
        let head = self.queue.front()?;
        if !head.in_progress {
            return None;
        }
        let setup = match head.kind {
            RequestKind::BigSync { setup } => setup,
            RequestKind::ShortSync { .. } => return None,
        };
        self.complete_head();
        Some(setup)
    }

    fn complete_head(&mut self) {
        self.queue.pop_front();
        self.active_channel.lock(|c| *c.borrow_mut() = None);
    }

    /// Cancels every enqueued request without firing any completion
    /// callback — adapter removal cancels every request enqueued against it
    /// and frees them without firing callbacks.
    pub fn cancel_all(&mut self) -> Vec<BroadcastRequest> {
        self.cancel_matching(|_| true)
    }

    /// Cancels every enqueued request matching `matches`, preserving the
    /// relative order of what remains, without firing any completion
    /// callback. Used to purge a torn-down peer's or setup's requests so a
    /// zombie entry for a freed id can't occupy the queue's single
    /// in-progress slot and block every other peer behind it.
    pub fn cancel_matching(&mut self, matches: impl Fn(&RequestKind) -> bool) -> Vec<BroadcastRequest> {
        let mut removed = Vec::new();
        let mut kept: Deque<BroadcastRequest, MAX_PENDING_BROADCAST_REQUESTS> = Deque::new();
        let mut head_removed = false;
        let mut is_head = true;
        while let Some(req) = self.queue.pop_front() {
            let drop_it = matches(&req.kind);
            if is_head {
                head_removed = drop_it;
                is_head = false;
            }
            if drop_it {
                removed.push(req);
            } else {
                let _ = kept.push_back(req);
            }
        }
        self.queue = kept;
        if head_removed {
            self.active_channel.lock(|c| *c.borrow_mut() = None);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::{BroadcastQos, QosConfig};
    use crate::transport::OpId;
    use bt_hci::param::BdAddr;

    struct FakeTransport {
        next_channel: u64,
    }

    impl Transport for FakeTransport {
        fn configure_stream(&mut self, _stream: crate::setup::SetupId, _caps: &[u8]) -> OpId {
            OpId(0)
        }
        fn qos_stream(&mut self, _stream: crate::setup::SetupId, _qos: &QosConfig) -> OpId {
            OpId(0)
        }
        fn enable_stream(&mut self, _stream: crate::setup::SetupId) -> OpId {
            OpId(0)
        }
        fn release_stream(&mut self, _stream: crate::setup::SetupId) -> OpId {
            OpId(0)
        }
        fn metadata_stream(&mut self, _stream: crate::setup::SetupId, _metadata: &[u8]) -> OpId {
            OpId(0)
        }
        fn cancel(&mut self, _op: OpId) {}
        fn iso_connect(
            &mut self,
            _source: crate::types::PeerAddr,
            _dest: crate::types::PeerAddr,
            _qos: &QosConfig,
            _defer: bool,
        ) -> ChannelId {
            self.next_channel += 1;
            ChannelId(self.next_channel)
        }
        fn iso_connect_broadcast(
            &mut self,
            _source: crate::types::PeerAddr,
            _qos: &QosConfig,
            _base: &[u8],
            _defer: bool,
        ) -> ChannelId {
            self.next_channel += 1;
            ChannelId(self.next_channel)
        }
        fn iso_listen(&mut self, _source: crate::types::PeerAddr, _qos: &QosConfig) -> ChannelId {
            self.next_channel += 1;
            ChannelId(self.next_channel)
        }
        fn iso_accept(&mut self, _channel: ChannelId) -> RawFd {
            42
        }
        fn iso_bcast_accept(&mut self, _channel: ChannelId, _bis_indices: &[u8]) -> RawFd {
            42
        }
    }

    fn addr() -> crate::types::PeerAddr {
        BdAddr::default()
    }

    #[test]
    fn second_request_waits_for_first_to_complete() {
        let mut bp = BroadcastPipeline::new();
        let mut transport = FakeTransport { next_channel: 0 };
        bp.enqueue_short_sync("peerA".into()).unwrap();
        bp.enqueue_short_sync("peerB".into()).unwrap();

        let dispatch = bp.tick(&mut transport, addr(), |_| {
            QosConfig::Broadcast(BroadcastQos::default())
        });
        assert!(dispatch.is_some());
        assert!(bp.has_request_in_progress());

        // Second request must not dispatch while the first is in progress.
        let none = bp.tick(&mut transport, addr(), |_| {
            QosConfig::Broadcast(BroadcastQos::default())
        });
        assert!(none.is_none());
        assert_eq!(bp.len(), 2);
    }

    #[test]
    fn short_sync_completes_on_pa_sync_confirm() {
        let mut bp = BroadcastPipeline::new();
        let mut transport = FakeTransport { next_channel: 0 };
        bp.enqueue_short_sync("peerA".into()).unwrap();
        bp.tick(&mut transport, addr(), |_| {
            QosConfig::Broadcast(BroadcastQos::default())
        });

        let outcome = bp.pa_sync_confirmed();
        assert_eq!(outcome, Some(PaSyncOutcome::ShortSyncComplete));
        assert!(bp.is_empty());
        assert!(!bp.has_request_in_progress());
    }

    #[test]
    fn big_sync_requires_both_confirms() {
        let mut bp = BroadcastPipeline::new();
        let mut transport = FakeTransport { next_channel: 0 };
        let setup = crate::arena::Id::from_raw(0, 0);
        bp.enqueue_big_sync(setup).unwrap();
        bp.tick(&mut transport, addr(), |_| {
            QosConfig::Broadcast(BroadcastQos::default())
        });

        match bp.pa_sync_confirmed() {
            Some(PaSyncOutcome::AwaitingBigSync { setup: s, .. }) => assert_eq!(s, setup),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(bp.has_request_in_progress(), "still in progress pending BIG-sync");

        let completed = bp.big_sync_confirmed();
        assert_eq!(completed, Some(setup));
        assert!(bp.is_empty());
    }

    #[test]
    fn cancel_all_drains_without_callbacks() {
        let mut bp = BroadcastPipeline::new();
        bp.enqueue_short_sync("peerA".into()).unwrap();
        bp.enqueue_short_sync("peerB".into()).unwrap();
        let drained = bp.cancel_all();
        assert_eq!(drained.len(), 2);
        assert!(bp.is_empty());
    }

    #[test]
    fn cancel_matching_purges_only_the_targeted_setup_and_keeps_order() {
        let mut bp = BroadcastPipeline::new();
        let mut transport = FakeTransport { next_channel: 0 };
        let stale = crate::arena::Id::from_raw(0, 0);
        let live = crate::arena::Id::from_raw(1, 0);
        bp.enqueue_big_sync(stale).unwrap();
        bp.enqueue_big_sync(live).unwrap();
        bp.tick(&mut transport, addr(), |_| QosConfig::Broadcast(BroadcastQos::default()));
        assert!(bp.has_request_in_progress());

        let removed = bp.cancel_matching(|kind| matches!(kind, RequestKind::BigSync { setup } if *setup == stale));
        assert_eq!(removed.len(), 1);
        assert_eq!(bp.len(), 1);
        // The removed request was the in-progress head, so the next tick
        // must be free to dispatch the surviving request rather than being
        // blocked on a slot that no longer has an owner.
        assert!(!bp.has_request_in_progress());

        let dispatch = bp.tick(&mut transport, addr(), |_| QosConfig::Broadcast(BroadcastQos::default()));
        assert!(dispatch.is_some());
        match bp.pa_sync_confirmed() {
            Some(PaSyncOutcome::AwaitingBigSync { setup, .. }) => assert_eq!(setup, live),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
