//! Small shared types: directions, codec id, capability bitmasks, addresses.

use bitflags::bitflags;
use bt_hci::param::BdAddr;

/// Direction a PAC/Endpoint exposes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sink,
    Source,
    BroadcastSink,
    BroadcastSource,
}

impl Direction {
    /// Whether this direction is part of a unicast (CIG/CIS) or broadcast
    /// (BIG/BIS) session.
    pub fn is_broadcast(self) -> bool {
        matches!(self, Direction::BroadcastSink | Direction::BroadcastSource)
    }

    /// The per-peer endpoint list this direction is kept in.
    pub fn role_name(self) -> &'static str {
        match self {
            Direction::Sink => "sink",
            Direction::Source => "source",
            Direction::BroadcastSink | Direction::BroadcastSource => "bcast",
        }
    }
}

/// LE Audio codec identifier: `Codec_ID` (id, company id, vendor id) as
/// carried in a PAC record or BASE subgroup descriptor.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodecId {
    pub id: u8,
    pub company_id: u16,
    pub vendor_id: u16,
}

impl CodecId {
    /// The vendor-id `0x06` reserved for LC3, matching the constant used
    /// throughout the BlueZ BAP plugin this engine's PAC matching rule is
    /// grounded on.
    pub const LC3: CodecId = CodecId {
        id: 0x06,
        company_id: 0x0000,
        vendor_id: 0x0000,
    };
}

bitflags! {
    /// `Audio_Locations` bitfield (PACS / ASCS channel allocation).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Locations: u32 {
        const MONO = 0;
        const FRONT_LEFT = 0x0000_0001;
        const FRONT_RIGHT = 0x0000_0002;
        const FRONT_CENTER = 0x0000_0004;
        const LOW_FREQUENCY_EFFECTS_1 = 0x0000_0008;
        const BACK_LEFT = 0x0000_0010;
        const BACK_RIGHT = 0x0000_0020;
        const FRONT_LEFT_OF_CENTER = 0x0000_0040;
        const FRONT_RIGHT_OF_CENTER = 0x0000_0080;
        const BACK_CENTER = 0x0000_0100;
        const LOW_FREQUENCY_EFFECTS_2 = 0x0000_0200;
        const SIDE_LEFT = 0x0000_0400;
        const SIDE_RIGHT = 0x0000_0800;
    }
}

bitflags! {
    /// `Context_Type` bitfield (Supported/Available Audio Contexts).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Contexts: u16 {
        const UNSPECIFIED = 0x0001;
        const CONVERSATIONAL = 0x0002;
        const MEDIA = 0x0004;
        const GAME = 0x0008;
        const INSTRUCTIONAL = 0x0010;
        const VOICE_ASSISTANTS = 0x0020;
        const LIVE = 0x0040;
        const SOUND_EFFECTS = 0x0080;
        const NOTIFICATIONS = 0x0100;
        const RINGTONE = 0x0200;
        const ALERTS = 0x0400;
        const EMERGENCY_ALARM = 0x0800;
    }
}

/// An opaque Length-Type-Value capability or metadata blob, copied into the
/// owning entity so the EIL-visible buffer need not outlive the call.
pub type LtvBlob = Vec<u8>;

/// A peer (remote LE Audio device) address, as reported by the transport.
pub type PeerAddr = BdAddr;

/// Handle to a local Bluetooth controller. The engine runs one [`crate::Adapter`]
/// arena per value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterId(pub u8);

/// A group id for a CIG or BIG. `0xFF` is reserved as the "unset" sentinel
/// the scheduler auto-assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u8);

impl GroupId {
    pub const UNSET: GroupId = GroupId(0xFF);

    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::UNSET
    }
}

/// A stream id within a CIG/BIG (CIS id or BIS index). Same "unset" sentinel
/// convention as [`GroupId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTag(pub u8);

impl StreamTag {
    pub const UNSET: StreamTag = StreamTag(0xFF);

    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl Default for StreamTag {
    fn default() -> Self {
        Self::UNSET
    }
}
