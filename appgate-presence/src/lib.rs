#![doc = include_str!("../README.md")]
//!

#![deny(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod events;
pub mod keyspace;
pub mod list;
pub mod semaphores;
pub mod service;

pub use backend::{Backend, Item, Key, Lease};
pub use backend::memory::MemoryBackend;
pub use events::{AnyResource, ResourceEvent, ResourceHeader, ResourceWatcher, WatcherEvent};
pub use list::{ListResourcesRequest, ListResourcesResponse, MatchResourceFilter};
pub use semaphores::SemaphoreFilter;
pub use service::PresenceService;
