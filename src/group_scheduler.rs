//! Group Scheduler (GS).
//!
//! Stateless query/decision functions over a [`SetupRegistry`]: all state the
//! scheduler reasons about (`group_active`, `recreate_when_idle`, CIG/BIG id)
//! already lives on [`crate::setup::Setup`], so GS itself owns nothing — it
//! is a namespace for the busy test, socket-creation gate, the recreate
//! sweep, and the broadcast-source BIS-index ordering rule.

use crate::qos::QosConfig;
use crate::setup::{Setup, SetupId, SetupRegistry};
use crate::stream::Stream;
use crate::types::GroupId;

fn cig_of(setup: &Setup) -> Option<GroupId> {
    match &setup.qos {
        QosConfig::Unicast(q) => Some(q.cig),
        QosConfig::Broadcast(_) => None,
    }
}

fn big_of(setup: &Setup) -> Option<GroupId> {
    match &setup.qos {
        QosConfig::Broadcast(q) => Some(q.big),
        QosConfig::Unicast(_) => None,
    }
}

/// Busy test: a CIG is busy iff some setup on the adapter shares its
/// (non-unset) id and has `group_active = true`. Unset always compares as
/// not busy.
pub fn is_cig_busy(setups: &SetupRegistry, cig: GroupId) -> bool {
    if cig.is_unset() {
        return false;
    }
    setups
        .iter()
        .any(|(_, s)| s.group_active && cig_of(s) == Some(cig))
}

/// Whether a unicast setup may call `iso_connect` right now. If not, the
/// caller should set `recreate_when_idle = true` and wait.
pub fn may_create_unicast_socket(setups: &SetupRegistry, cig: GroupId) -> bool {
    !is_cig_busy(setups, cig)
}

/// Recreate sweep: when a setup's I/O closes, collect every sibling on the
/// adapter marked `recreate_when_idle` that shares its CIG — or, if the CIG
/// is unset, every sibling of the same endpoint. Callers schedule the
/// returned ids for the *next* tick, never synchronously.
pub fn recreate_candidates(
    setups: &SetupRegistry,
    closed: SetupId,
) -> Vec<SetupId> {
    let closed_setup = match setups.setup(closed) {
        Some(s) => s,
        None => return Vec::new(),
    };
    let cig = cig_of(closed_setup);
    let endpoint = closed_setup.parent_endpoint.clone();

    setups
        .iter()
        .filter(|&(id, s)| {
            id != closed
                && s.recreate_when_idle
                && match cig {
                    Some(c) if !c.is_unset() => cig_of(s) == Some(c),
                    _ => s.parent_endpoint == endpoint,
                }
        })
        .map(|(id, _)| id)
        .collect()
}

/// One entry of a broadcast-source open-batch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDecision {
    pub setup: SetupId,
    pub defer: bool,
}

/// Decides which broadcast-source setups in BIG `big` may open an ISO
/// socket right now, and with what `defer` value:
///
/// - `big` unset: treated as a singleton BIG, opened immediately with
///   `defer = false` (the caller should only ever pass a single setup's id
///   through this path in that case).
/// - otherwise: if any sibling in the BIG is already STREAMING, late
///   joiners open individually with `defer = false` rather than joining a
///   batch. Else, only once *every* setup in the BIG has reached at least
///   CONFIG do all of them open together, in ascending BIS index order,
///   every one deferred except the last.
pub fn broadcast_open_decisions(
    setups: &SetupRegistry,
    big: GroupId,
) -> Vec<OpenDecision> {
    let members: Vec<(SetupId, &Setup, &Stream)> = setups
        .iter()
        .filter(|(_, s)| big_of(s) == Some(big) && s.channel.is_none())
        .filter_map(|(id, s)| setups.stream(s.stream).map(|stream| (id, s, stream)))
        .collect();

    if members.is_empty() {
        return Vec::new();
    }

    if big.is_unset() {
        return members
            .into_iter()
            .map(|(id, _, _)| OpenDecision { setup: id, defer: false })
            .collect();
    }

    let any_streaming = setups.iter().any(|(_, s)| {
        big_of(s) == Some(big)
            && setups.stream(s.stream).map(|st| st.state) == Some(crate::stream::State::Streaming)
    });

    if any_streaming {
        return members
            .into_iter()
            .map(|(id, _, _)| OpenDecision { setup: id, defer: false })
            .collect();
    }

    let all_at_least_config = members
        .iter()
        .all(|(_, _, stream)| stream.state.at_least_config());
    if !all_at_least_config {
        return Vec::new();
    }

    let mut ordered = members;
    ordered.sort_by_key(|(_, s, _)| bis_index(s));
    let last = ordered.len() - 1;
    ordered
        .into_iter()
        .enumerate()
        .map(|(i, (id, _, _))| OpenDecision {
            setup: id,
            defer: i != last,
        })
        .collect()
}

fn bis_index(setup: &Setup) -> u8 {
    match &setup.qos {
        QosConfig::Broadcast(q) => q.bis.0,
        QosConfig::Unicast(_) => u8::MAX,
    }
}
