//! # USEQ Core
//!
//! Core library for the USEQ sequencing-run lifecycle daemon. It drives every
//! completed sequencer output through conversion, transfer, cleanup and
//! archival, while a companion storage monitor guards the shared remote
//! storage budget.
//!
//! ## Overview
//!
//! - **Run model**: [`pipeline::run`] holds the run record and its forward-only
//!   status chain.
//! - **State stores**: [`pipeline::state_store`] persists records with a
//!   write-ahead discipline so a restarted daemon resumes at the last
//!   persisted status.
//! - **Scanner**: [`pipeline::scanner`] registers run directories that carry a
//!   completion marker.
//! - **Stages**: [`pipeline::stages`] implements conversion, transfer, cleanup
//!   and archive handlers.
//! - **Runtime**: [`pipeline::runtime`] runs the orchestration cycle on a
//!   bounded worker pool with per-run leases.
//! - **Storage**: [`storage`] polls remote capacity and publishes snapshots
//!   with edge-triggered alerts.
//!
//! ## Feature Flags
//!
//! - `postgres`: enables the SQLx-backed run state store.

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Error types shared across the core
pub mod error;

/// LIMS collaborator interface (read-only run metadata)
pub mod lims;

/// Notification collaborator interface
pub mod notify;

/// Run lifecycle orchestration: model, persistence, stages, runtime
pub mod pipeline;

/// Remote storage capacity monitoring
pub mod storage;

/// Common identifier types
pub mod types;

pub use error::{PipelineError, Result};
pub use types::ids::RunId;
