//! Core types and functionality for Shipcheck.
//!
//! This module contains the execution plumbing shared by every pipeline:
//! configuration, process execution, cancellation and provisioning.

mod cancel;
mod config;
mod executor;
mod provision;

pub use cancel::CancelToken;
pub use config::{CacheConfig, Config, GeneralConfig, WorkspaceConfig};
pub use executor::{ExecutionResult, Executor, ShellCommand};
pub use provision::{default_platform_aliases, host_os, ProvisionedEnvironment, Provisioner};
