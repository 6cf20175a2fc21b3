//! Wire protocol and framed transport for the REMI migration tools.
//!
//! The [`protocol`] module defines the identity handshake and the
//! request/response messages of the migration protocol; the [`streams`]
//! module provides length-delimited bincode framing over TCP together with
//! raw bulk-data transfer. Both engines in the `remi` crate build on these
//! pieces: the client drives a connection sequentially, the server answers
//! one connection per in-flight migration.

pub mod protocol;
pub mod streams;

pub use streams::{Connection, RecvStream, SendStream};
