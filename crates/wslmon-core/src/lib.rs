//! # wslmon-core
//!
//! Core library for wslmon - a two-sided host/guest observability fabric
//! that correlates lifecycle and failure signals across a Windows host and
//! a Linux guest.
//!
//! This crate provides the building blocks shared by both daemon sides and
//! the offline report tool:
//!
//! - **Event model**: [`event::EventRecord`] with a deterministic canonical
//!   serialisation used as input to chain hashing and frame MACs
//! - **Journal**: append-only, hash-chained, rotating event log with a
//!   crash-safe chain-state sidecar and an optional keyed authentication tag
//! - **IPC channel**: nonce-challenge mutual authentication and
//!   MAC-authenticated length-prefixed frames over any bidirectional byte
//!   stream
//! - **Analyser**: merges two journal streams into a time-ordered timeline
//!   and derives heuristic insights and a cross-channel health snapshot
//!
//! ## Example
//!
//! ```rust,no_run
//! use wslmon_core::event::{Category, EventRecord, Severity};
//! use wslmon_core::journal::{Journal, JournalOptions};
//!
//! # fn example() -> Result<(), wslmon_core::journal::JournalError> {
//! let journal = Journal::open(JournalOptions::new("/var/log/wsl-monitor/guest-events.log"))?;
//! let record = EventRecord::new(Category::General, Severity::Info, "daemon started");
//! let appended = journal.append(&record)?;
//! assert_eq!(appended.sequence, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod analyzer;
pub mod channel;
pub mod event;
pub mod hexstr;
pub mod journal;
pub mod ring;

pub use event::{Category, EventAttribute, EventRecord, Severity};
pub use journal::{Journal, JournalLine, JournalOptions};
pub use ring::RingBuffer;
