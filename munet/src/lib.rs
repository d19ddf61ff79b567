//! # munet
//!
//! Declarative virtual network topologies on a Linux host: a single config
//! file describes networks, nodes, links and per-node commands; the engine
//! realises it from kernel namespaces, veth pairs, bridges and traffic
//! control, keeps the node processes alive, and tears everything down on
//! exit.
//!
//! The crate is library-first. The standalone driver (`munet` binary) is a
//! thin wrapper over [`Topology`]:
//!
//! ```no_run
//! use munet::{Config, Topology, TopologyOptions};
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> munet::Result<()> {
//!     let config = Config::load("munet")?;
//!     let mut topology = Topology::build(config, TopologyOptions::default())?;
//!     topology.bring_up().await?;
//!     topology.run(false).await
//! }
//! ```

pub mod alloc;
pub mod command;
pub mod config;
pub mod errors;
pub mod kind;
pub mod node;
pub mod plan;
pub mod registry;
pub mod state;
pub mod topology;

pub use config::Config;
pub use errors::{Error, Result};
pub use topology::{Phase, Topology, TopologyOptions};
