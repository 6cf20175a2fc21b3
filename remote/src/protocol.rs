//! Migration protocol definitions for sender-receiver communication.
//!
//! # Protocol Overview
//!
//! A migration is coordinated over a single TCP connection. The connection
//! opens with an identity handshake, then the sender drives a strict
//! three-phase sequence of request/response exchanges:
//!
//! ```text
//! Sender                                Receiver
//!   |  ---- Hello(ident, provider) ------> |  Match provider
//!   |  <--- HelloReply(ident, known) ----- |
//!   |                                      |
//!   |  ---- Start(fileset, sizes, modes) > |  Before-callback, create files
//!   |  <--- StartReply(err, status, op) -- |
//!   |                                      |
//!   |  ~~~~ Mmap(op, total) + raw bytes ~> |  Pull into mapped segments
//!   |  <--- MmapReply(err) --------------- |
//!   |          ... or ...                  |
//!   |  ---- Write(op, idx, off, data) ---> |  ACK, then positional write
//!   |  <--- WriteReply(err) -------------- |  (repeated per chunk)
//!   |                                      |
//!   |  ---- End(op) ---------------------> |  Close files, after-callback
//!   |  <--- EndReply(err, status) -------- |
//! ```
//!
//! Per operation id, `Start` strictly happens before any `Mmap`/`Write`,
//! which strictly happen before `End`; the sender enforces this by issuing
//! requests sequentially on the connection.
//!
//! The `Mmap` request is followed by exactly `total_size` raw (unframed)
//! bytes: the sender's mapped segments concatenated in expanded-file order.
//! `Write` replies are sent before the positional write is performed, so
//! the sender can read its next chunk while the receiver writes; write
//! failures surface through the sticky error consumed by `End`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::Fileset;

/// Identity string exchanged when a provider handle is created.
pub const PROVIDER_IDENT: &str = "remi";

/// Wire-stable RPC identifiers, used for tracing and diagnostics.
pub const RPC_MIGRATE_START: &str = "remi_migrate_start";
pub const RPC_MIGRATE_MMAP: &str = "remi_migrate_mmap";
pub const RPC_MIGRATE_WRITE: &str = "remi_migrate_write";
pub const RPC_MIGRATE_END: &str = "remi_migrate_end";

/// First message on every connection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Hello {
    pub ident: String,
    pub provider_id: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HelloReply {
    pub ident: String,
    /// Whether the requested provider id is registered on the receiver.
    pub known_provider: bool,
}

/// Requests issued by the sender after the handshake.
#[derive(Debug, Deserialize, Serialize)]
pub enum Request {
    /// Opens an operation: the transfer-time fileset plus per-file sizes
    /// and permission modes, aligned with the fileset's sorted file list.
    Start {
        fileset: Fileset,
        sizes: Vec<u64>,
        modes: Vec<u32>,
    },
    /// One-shot bulk transfer; followed by exactly `total_size` raw bytes.
    Mmap { op_id: Uuid, total_size: u64 },
    /// One chunk of one file.
    Write {
        op_id: Uuid,
        file_index: u32,
        offset: u64,
        data: Vec<u8>,
    },
    /// Closes the operation and runs the after-migration callback.
    End { op_id: Uuid },
    /// Asks the whole service to shut down. No reply is sent.
    Shutdown,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct StartReply {
    pub err: i32,
    pub user_status: i32,
    pub op_id: Uuid,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MmapReply {
    pub err: i32,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct WriteReply {
    pub err: i32,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct EndReply {
    pub err: i32,
    pub user_status: i32,
}
