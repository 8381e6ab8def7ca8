//! # wslmon-daemon
//!
//! The per-side daemon of the wslmon observability fabric: a
//! [`supervisor::Supervisor`] owns one hash-chained journal, one in-memory
//! ring buffer, a set of signal [`collectors`], and the dual-role IPC
//! [`bridge::Bridge`] that forwards events to the peer side and accepts
//! the peer's events in return.
//!
//! Concurrency model: one thread per collector plus two bridge workers.
//! Every worker suspends only in timed waits on a shared [`stop::StopSignal`]
//! or in blocking I/O on its signal source, and honours shutdown within its
//! polling interval.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bridge;
pub mod collectors;
pub mod config;
pub mod stop;
pub mod supervisor;
pub mod transport;

pub use config::{DaemonConfig, Side};
pub use supervisor::Supervisor;
