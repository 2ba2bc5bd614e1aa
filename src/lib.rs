//! LE Audio Basic Audio Profile (BAP) orchestration engine.
//!
//! Sits between a local audio stack and the kernel's ISO transport. Drives
//! per-stream configuration, QoS negotiation, isochronous-group lifecycle,
//! and unicast/broadcast synchronization for LE Audio endpoints.
//!
//! The engine itself never touches a kernel socket, a GATT server, or a
//! D-Bus object path: those are reached only through the [`transport`] and
//! [`observer`] trait boundaries, so the engine can be driven by a real
//! Bluetooth daemon or by a test harness identically.

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("enable only one of the `defmt` and `log` logging backends");

mod arena;
mod util;
pub mod adapter;
pub mod base;
pub mod broadcast_pipeline;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod group_scheduler;
pub mod observer;
pub mod pac;
pub mod qos;
pub mod setup;
pub mod stream;
pub mod transport;
pub mod types;

pub use config::PaPipelineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use observer::EngineObserver;
pub use transport::Transport;
pub use types::{AdapterId, CodecId, Contexts, Direction, GroupId, Locations, StreamTag};

#[cfg(feature = "log")]
pub(crate) use log::{debug, info, warn};

#[cfg(feature = "defmt")]
pub(crate) use defmt::{debug, info, warn};

#[cfg(not(any(feature = "log", feature = "defmt")))]
mod no_log {
    macro_rules! noop {
        ($($arg:tt)*) => {};
    }
    pub(crate) use noop as debug;
    pub(crate) use noop as info;
    pub(crate) use noop as warn;
}
#[cfg(not(any(feature = "log", feature = "defmt")))]
pub(crate) use no_log::{debug, info, warn};
