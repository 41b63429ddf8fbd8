#![doc = include_str!("../README.md")]
//!

#![deny(rustdoc::broken_intra_doc_links)]

pub mod audit;
pub mod authz;
pub mod config;
pub mod connection;
pub mod dynamic_labels;
pub mod forward;
pub mod heartbeat;
pub mod identity;
pub mod locks;
pub mod reconciler;
pub mod report;
pub mod server;
pub mod session;
pub mod tls;
pub mod trace;

pub use config::AgentConfig;
pub use identity::{Identity, RouteToApp};
pub use server::{AppAgent, AppAgentSetup};
