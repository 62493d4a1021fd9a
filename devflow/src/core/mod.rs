//! Deterministic, pure logic shared by the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take the current time as a parameter, and return
//! deterministic outputs suitable for tests.

pub mod board;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod selector;
pub mod transitions;
pub mod types;
