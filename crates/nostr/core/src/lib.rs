//! Nostr protocol primitives shared by the relay connection layer.
//!
//! This crate intentionally carries no I/O and no cryptography: the event
//! shape needed to decode relay traffic, and the canonicalization rules for
//! REQ/COUNT filters.

pub mod event;
pub mod filter;

pub use event::Event;
pub use filter::{normalize_count_filter, normalize_count_filters};
