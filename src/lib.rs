#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

//! Declarative deployment orchestration: describe contracts and calls as a
//! graph of futures, then deploy them in resumable, journaled batches.

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod journal;
pub mod module;
pub mod planner;
pub mod reconciler;

pub use config::Config;
pub use engine::{DeploymentReport, DeploymentStatus, Deployer, RunOutcome};
pub use error::{AnchorageError, Result};
pub use module::{Module, ModuleBuilder, build_module};
