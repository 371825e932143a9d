//! Armada - distributed orchestrator for game-server style workloads
//!
//! A cluster of armada nodes accepts task definitions, places and launches
//! child processes ("services") across nodes, streams their console output,
//! routes channel messages between node and service peers, and keeps a
//! replicated, eventually-consistent view of cluster state.
//!
//! # High-Level API
//!
//! Most embedders go through the [`node`] module, which wires the
//! subsystems together:
//!
//! ```ignore
//! use armada::node::Node;
//!
//! let node = Node::start(state_dir, "node-1").await?;
//! node.run_until_signal().await;
//! ```

pub mod cluster;
pub mod config;
pub mod database;
pub mod event;
pub mod logging;
pub mod messaging;
pub mod network;
pub mod node;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod template;
pub mod tick;
pub mod time;

/// Version of the armada library and CLI.
///
/// Synchronized across all workspace members via the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
