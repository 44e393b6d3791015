//! # Porto core
//!
//! Porto is a container supervisor for a single Linux host. This crate
//! holds the core subsystems the daemon is assembled from:
//!
//! - **Cgroup layer**: one object per (controller, path) with typed knob
//!   access, recursive kill and OOM event wiring
//! - **Namespace + mount layer**: capture/enter namespaces by pid and
//!   build a container's mount tree
//! - **Task spawner**: the fork pipeline that launches a container's
//!   first process with the requested isolation
//! - **Event queue + epoll loop**: the single-threaded cooperative
//!   scheduler everything runs on
//! - **Container tree**: named hierarchical entities with a strict state
//!   machine and per-node locking
//! - **Key-value store**: crash-safe snapshots of containers and volumes
//! - **Volume manager**: pluggable storage backends, layers and quotas

#![warn(missing_docs)]

pub mod cgroup;
pub mod config;
pub mod container;
pub mod engine;
pub mod epoll;
pub mod events;
pub mod exec;
pub mod kvs;
pub mod namespace;
pub mod network;
pub mod stats;
pub mod volume;

pub use config::Config;
pub use container::{Container, ContainerState, ContainerTree};
pub use engine::Engine;
pub use events::{Event, EventQueue};
pub use kvs::KvStore;
pub use volume::VolumeManager;
