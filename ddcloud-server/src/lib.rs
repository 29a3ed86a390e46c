//! ddcloud-server: reconciles a cloud server toward its declared
//! configuration.
//!
//! The control plane is reached through [`clients::ComputeClient`]. The
//! [`reconciler::ServerLifecycle`] orchestrator drives create, read, update
//! and delete, persisting progress through a [`store::StateStore`] after
//! every converged step.

pub mod clients;
pub mod config;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod record;
pub mod store;

pub use config::ReconcilerConfig;
pub use error::{ReconcileError, Result};
pub use model::{Disk, OsImage, ServerObservedState, ServerSpec, Tag};
pub use reconciler::{ServerLifecycle, UpdatePlan};
pub use record::{Checkpoint, LifecyclePhase, ServerRecord};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
