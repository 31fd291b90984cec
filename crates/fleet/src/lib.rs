//! VPC node provider for CTO Platform clusters.
//!
//! This crate provisions and tracks cluster nodes on IBM Cloud VPC Gen2.
//! Node membership is derived from the global tag search service, which is
//! only eventually consistent with tag writes and with instance deletion, so
//! every answer is reconciled against the authoritative instance API and an
//! in-process node cache.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet::{ClusterConfig, NodeProvider, TagFilter, VpcNodeProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClusterConfig::load("cluster.yaml".as_ref())?;
//!     let provider = VpcNodeProvider::from_config(&config, None)?;
//!
//!     let mut filter = TagFilter::new();
//!     filter.insert("ray-node-type".into(), "worker".into());
//!     for id in provider.non_terminated_nodes(&filter).await? {
//!         println!("{id} {:?}", provider.internal_ip(&id).await?);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod node;
pub mod provider;
pub mod providers;
pub mod reconcile;
pub mod retry;
pub mod tagging;

pub use cache::{NodeCache, SharedCache};
pub use clients::{ClientFactory, SharedClients};
pub use config::{ClusterConfig, NodeTemplate, ProviderConfig, Timings};
pub use error::ProviderError;
pub use lifecycle::{CreateOutcome, Lifecycle, TerminateOutcome};
pub use node::{Node, NodeRole, NodeStatus, StatusTag, TagFilter};
pub use provider::{NodeProvider, VpcNodeProvider};
pub use reconcile::Reconciler;
pub use tagging::TagManager;
