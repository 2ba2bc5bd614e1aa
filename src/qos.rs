//! QoS configuration.
//!
//! A tagged-variant type replacing the source's separate unicast/broadcast
//! "parser" function pointers: each variant owns an
//! exhaustive `parse` step that validates its own dictionary shape and
//! rejects unknown keys.

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::types::{GroupId, StreamTag};

/// A property value as delivered across the EIL boundary's "properties"
/// dictionary. Intentionally decoupled from any particular
/// IPC encoding (D-Bus, JSON, ...) — that translation is a collaborator's
/// job, not the engine's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
    Bytes(Vec<u8>),
    Dict(Properties),
}

pub type Properties = BTreeMap<String, Value>;

/// Per-direction I/O QoS shared by unicast and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoQos {
    pub interval: u32,
    pub phy: u8,
    pub sdu: u16,
    pub retransmissions: u8,
    pub latency: u16,
}

/// Unicast (CIG/CIS) QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnicastQos {
    pub cig: GroupId,
    pub cis: StreamTag,
    pub framing: u8,
    pub presentation_delay: u32,
    pub target_latency: u8,
    pub io: IoQos,
}

/// Broadcast (BIG/BIS) QoS.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BroadcastQos {
    pub big: GroupId,
    pub bis: StreamTag,
    pub sync_factor: u8,
    pub sync_timeout: u16,
    pub sync_cte_type: u8,
    pub skip: u16,
    pub mse: u8,
    pub packing: u8,
    pub framing: u8,
    pub encryption: bool,
    pub broadcast_code: Option<[u8; 16]>,
    pub options: u8,
    pub timeout: u16,
    pub presentation_delay: u32,
    pub io: IoQos,
}

/// Tagged QoS configuration, chosen by the endpoint's role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QosConfig {
    Unicast(UnicastQos),
    Broadcast(BroadcastQos),
}

impl QosConfig {
    pub fn is_unicast(&self) -> bool {
        matches!(self, QosConfig::Unicast(_))
    }
}

fn get_u8(dict: &Properties, key: &str) -> Option<u8> {
    match dict.get(key)? {
        Value::U8(v) => Some(*v),
        _ => None,
    }
}

fn get_u16(dict: &Properties, key: &str) -> Option<u16> {
    match dict.get(key)? {
        Value::U16(v) => Some(*v),
        Value::U8(v) => Some(*v as u16),
        _ => None,
    }
}

fn get_u32(dict: &Properties, key: &str) -> Option<u32> {
    match dict.get(key)? {
        Value::U32(v) => Some(*v),
        Value::U16(v) => Some(*v as u32),
        Value::U8(v) => Some(*v as u32),
        _ => None,
    }
}

fn get_bytes<'a>(dict: &'a Properties, key: &str) -> Option<&'a [u8]> {
    match dict.get(key)? {
        Value::Bytes(v) => Some(v.as_slice()),
        _ => None,
    }
}

const UNICAST_KEYS: &[&str] = &[
    "CIG",
    "CIS",
    "Framing",
    "PresentationDelay",
    "TargetLatency",
    "Interval",
    "PHY",
    "SDU",
    "Retransmissions",
    "Latency",
];

const BROADCAST_KEYS: &[&str] = &[
    "Encryption",
    "BIG",
    "Options",
    "Skip",
    "SyncTimeout",
    "SyncType",
    "SyncFactor",
    "MSE",
    "Timeout",
    "PresentationDelay",
    "BCode",
    "Interval",
    "PHY",
    "SDU",
    "Retransmissions",
    "Latency",
];

fn reject_unknown_keys(dict: &Properties, known: &[&str]) -> Result<(), EngineError> {
    for key in dict.keys() {
        if !known.contains(&key.as_str()) {
            return Err(EngineError::InvalidArgs("unknown QoS key"));
        }
    }
    Ok(())
}

impl QosConfig {
    /// Parses a unicast QoS dictionary. `CIG`/`CIS` default to "unset" when
    /// absent, matching the scheduler's auto-assignment contract.
    pub fn parse_unicast(dict: &Properties) -> Result<UnicastQos, EngineError> {
        reject_unknown_keys(dict, UNICAST_KEYS)?;
        Ok(UnicastQos {
            cig: get_u8(dict, "CIG").map(GroupId).unwrap_or(GroupId::UNSET),
            cis: get_u8(dict, "CIS").map(StreamTag).unwrap_or(StreamTag::UNSET),
            framing: get_u8(dict, "Framing").unwrap_or(0),
            presentation_delay: get_u32(dict, "PresentationDelay").unwrap_or(0),
            target_latency: get_u8(dict, "TargetLatency").unwrap_or(0),
            io: IoQos {
                interval: get_u32(dict, "Interval").unwrap_or(0),
                phy: get_u8(dict, "PHY").unwrap_or(0),
                sdu: get_u16(dict, "SDU").unwrap_or(0),
                retransmissions: get_u8(dict, "Retransmissions").unwrap_or(0),
                latency: get_u16(dict, "Latency").unwrap_or(0),
            },
        })
    }

    /// Parses a broadcast QoS dictionary. `BCode` must be exactly 16 bytes
    /// when present.
    pub fn parse_broadcast(dict: &Properties) -> Result<BroadcastQos, EngineError> {
        reject_unknown_keys(dict, BROADCAST_KEYS)?;

        let broadcast_code = match get_bytes(dict, "BCode") {
            Some(bytes) => {
                let arr: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| EngineError::InvalidArgs("BCode must be 16 bytes"))?;
                Some(arr)
            }
            None => None,
        };

        Ok(BroadcastQos {
            big: get_u8(dict, "BIG").map(GroupId).unwrap_or(GroupId::UNSET),
            bis: StreamTag::UNSET,
            sync_factor: get_u8(dict, "SyncFactor").unwrap_or(0),
            sync_timeout: get_u16(dict, "SyncTimeout").unwrap_or(0),
            sync_cte_type: get_u8(dict, "SyncType").unwrap_or(0),
            skip: get_u16(dict, "Skip").unwrap_or(0),
            mse: get_u8(dict, "MSE").unwrap_or(0),
            packing: 0,
            framing: 0,
            encryption: get_u8(dict, "Encryption").unwrap_or(0) != 0,
            broadcast_code,
            options: get_u8(dict, "Options").unwrap_or(0),
            timeout: get_u16(dict, "Timeout").unwrap_or(0),
            presentation_delay: get_u32(dict, "PresentationDelay").unwrap_or(0),
            io: IoQos {
                interval: get_u32(dict, "Interval").unwrap_or(0),
                phy: get_u8(dict, "PHY").unwrap_or(0),
                sdu: get_u16(dict, "SDU").unwrap_or(0),
                retransmissions: get_u8(dict, "Retransmissions").unwrap_or(0),
                latency: get_u16(dict, "Latency").unwrap_or(0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, Value)]) -> Properties {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn unicast_defaults_cig_cis_unset() {
        let parsed = QosConfig::parse_unicast(&Properties::new()).unwrap();
        assert!(parsed.cig.is_unset());
        assert!(parsed.cis.is_unset());
    }

    #[test]
    fn unknown_unicast_key_rejected() {
        let d = dict(&[("Bogus", Value::U8(1))]);
        assert_eq!(
            QosConfig::parse_unicast(&d),
            Err(EngineError::InvalidArgs("unknown QoS key"))
        );
    }

    #[test]
    fn bcode_must_be_16_bytes() {
        let d = dict(&[("BCode", Value::Bytes(vec![0u8; 8]))]);
        assert_eq!(
            QosConfig::parse_broadcast(&d),
            Err(EngineError::InvalidArgs("BCode must be 16 bytes"))
        );
    }

    #[test]
    fn bcode_16_bytes_accepted() {
        let d = dict(&[("BCode", Value::Bytes(vec![0u8; 16]))]);
        let parsed = QosConfig::parse_broadcast(&d).unwrap();
        assert_eq!(parsed.broadcast_code, Some([0u8; 16]));
    }
}
