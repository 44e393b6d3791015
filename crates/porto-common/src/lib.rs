//! # porto-common
//!
//! Shared utilities and types for the Porto container supervisor.
//!
//! This crate provides common functionality used across all Porto crates:
//! - The error taxonomy surfaced over the RPC socket
//! - Container name validation and resolution helpers
//! - A reusable integer id pool
//! - Credential (uid/gid) resolution
//! - Standard filesystem paths
//! - Size and duration value parsing

#![warn(missing_docs)]

pub mod cred;
pub mod error;
pub mod idmap;
pub mod name;
pub mod paths;
pub mod value;
pub mod varint;

pub use cred::Cred;
pub use error::{PortoError, PortoResult};
pub use idmap::IdMap;
pub use name::ContainerName;
pub use paths::PortoPaths;
