//! Shared foundation for the REMI migration tools: the error taxonomy, the
//! fileset model, the process-wide device registry, filesystem helpers and
//! the asynchronous I/O provider handle.

pub mod device;
pub mod error;
pub mod fileset;
pub mod fsutil;
pub mod io;
pub mod testutils;

pub use error::{Error, Result, SUCCESS};
pub use fileset::{DEFAULT_XFER_SIZE, Fileset, PROVIDER_ID_ANY};
pub use io::IoProvider;
