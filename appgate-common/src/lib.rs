#![doc = include_str!("../README.md")]
//!

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod app;
pub mod errors;
pub mod jwt;
pub mod keepalive;
pub mod keys;
pub mod labels;
pub mod resource;
pub mod role;
pub mod semaphore;
pub mod server;
pub mod utils;
