//! Dependency-aware scheduler for AI-assisted delivery.
//!
//! Work items are refined into developer stories linked by a dependency DAG.
//! Stories run one per branch and worktree, driven by an AI provider, with
//! every lifecycle step recorded in an append-only execution log.
//!
//! - **[`core`]**: Pure, deterministic logic (graph, transitions, selection,
//!   scheduling policy). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (board and log storage, git,
//!   provider processes, prompts). Behind traits so tests can swap them.
//!
//! Orchestration modules ([`scheduler`], [`refine`], [`implement`],
//! [`worker`]) coordinate core logic with I/O to implement CLI commands.

pub mod app;
pub mod core;
pub mod exit_codes;
pub mod implement;
pub mod io;
pub mod listing;
pub mod logging;
pub mod refine;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
