//! The devloop engine's control layer.
//!
//! - The development-loop controller and its loop states
//! - Versioned operation definitions with approval-gated overrides
//! - Per-cycle metrics and the JSONL journal
//! - Path health and corrective routing
//! - Cycle reports and the human touchpoint
//! - The work-source port and its file adapter

pub mod controller;
pub mod engine;
pub mod health;
pub mod metrics;
pub mod operations;
pub mod report;
pub mod work_source;
