//! Core domain for the devloop engine.
//!
//! Holds everything the per-task lifecycle needs below the agent layer:
//! - Task records, lifecycle states and the legal edge set
//! - The task store port with in-memory and SQLite adapters
//! - Atomic claiming over the store (optimistic, conditional writes)
//! - Per-task git worktrees with guaranteed cleanup
//! - Quality gates (test / lint / build, documentation output checks)
//! - Cooperative cancellation and TOML configuration

pub mod cancel;
pub mod claim;
pub mod config;
pub mod quality_gate;
pub mod sqlite_store;
pub mod store;
pub mod types;
pub mod worktree_manager;
