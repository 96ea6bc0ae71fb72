// src/executor/mod.rs

//! Execution substrate interface.
//!
//! - [`client`] defines the [`ExecutorClient`] trait used by the launcher and
//!   cleaner, plus the run types it exchanges.
//! - [`local`] provides [`LocalExecutor`], which runs jobs in this process.

pub mod client;
pub mod local;

pub use client::{
    ExecutorClient, ExecutorFuture, RunFilter, RunInfo, RunStatus, deployment_name,
    launch_parameters,
};
pub use local::LocalExecutor;
