//! Resilient fileset migration between storage services.
//!
//! REMI moves a [`common::Fileset`] - a named bundle of files, directories
//! and metadata rooted at an absolute path - from one process to another,
//! re-creating the tree at a remote root and handing control to
//! user-registered callbacks on the receiver.
//!
//! The [`client`] module drives migrations: it expands the fileset, opens
//! the sources and walks the receiver through the start/transfer/end
//! sequence, either as one memory-mapped bulk push or as pipelined chunked
//! writes. The [`server`] module hosts providers: each registers migration
//! classes (before/after callbacks) and serves the four migration RPCs,
//! tracking every in-flight operation under a random 128-bit id.
//!
//! ```no_run
//! # async fn demo() -> common::Result<()> {
//! let mut fileset = common::Fileset::new("kv_store", "/var/data/shard-3")?;
//! fileset.register_directory("db")?;
//! fileset.register_metadata("generation", "42")?;
//!
//! let client = remi::Client::new();
//! let handle = client.provider_handle("10.0.0.7:8440", 1).await?;
//! handle
//!     .migrate(
//!         &fileset,
//!         "/var/data/shard-3",
//!         remi::SourceDisposition::RemoveSource,
//!         remi::TransferMode::Chunked,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
mod operation;
pub mod server;

pub use client::{Client, ProviderHandle, SourceDisposition, TransferMode};
pub use server::{MigrationCallback, MigrationClass, Provider, Service};
