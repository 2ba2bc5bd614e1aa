//! Single-dispatcher-safe interior mutability.
//!
//! The engine is single-threaded cooperative: every state transition runs on
//! one event dispatcher. A plain `RefCell` would express that, but
//! the teacher crate's convention for state shared across the async
//! boundary — a tick task and a completion callback, both driven by the
//! same executor but not by the same call stack frame — is an
//! `embassy_sync` blocking mutex guarded by `NoopRawMutex`: a lock type that
//! panics rather than blocks if ever entered reentrantly, making "this must
//! only ever be touched from the single dispatcher" a structural property
//! instead of a comment.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;

pub(crate) type Guarded<T> = Mutex<NoopRawMutex, RefCell<T>>;

pub(crate) fn guarded<T>(value: T) -> Guarded<T> {
    Mutex::new(RefCell::new(value))
}
