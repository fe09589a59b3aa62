//! Durable local storage and remote endpoint abstractions for lexisync.
//!
//! This module provides a trait-based interface for the on-device key-value
//! store (memory, local filesystem) and for the remote system of record
//! (HTTP, in-memory), plus a store registry for dynamic store resolution.
//!
//! # Design Principles
//! - Engine isolation: no store- or transport-specific logic in the sync engine
//! - Async operations: all I/O operations are async
//! - Unified error semantics: transport failures surface as `Network`/`Timeout`

pub mod http;
pub mod local;
pub mod memory;
pub mod memory_remote;
pub mod registry;
pub mod remote;
pub mod store;

pub use http::{Credentials, HttpRemote, HttpRemoteConfig, StaticCredentials};
pub use local::FileStore;
pub use memory::MemoryStore;
pub use memory_remote::MemoryRemote;
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use remote::{ChangeEnvelope, ChangeOutcome, PushRequest, RemoteEndpoint, RemoteSnapshot};
pub use store::{load_json, save_json, KeyValueStore};
