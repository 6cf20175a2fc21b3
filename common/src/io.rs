//! Positional file I/O off the blocking pool, and the optional asynchronous
//! I/O provider handle that bounds how many operations run at once.

use std::sync::Arc;

use crate::device::Device;
use crate::error::{Error, Result};

fn spawn_err(err: tokio::task::JoinError) -> Error {
    Error::Io(format!("blocking i/o task failed: {err}"))
}

/// Reads exactly `len` bytes from `file` at `offset`.
pub async fn read_at(file: &Arc<std::fs::File>, len: usize, offset: u64) -> Result<Vec<u8>> {
    let file = file.clone();
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = nix::sys::uio::pread(
                &*file,
                &mut buf[filled..],
                (offset + filled as u64) as libc::off_t,
            )
            .map_err(std::io::Error::from)?;
            if n == 0 {
                return Err(Error::Io(format!(
                    "unexpected end of file at offset {}",
                    offset + filled as u64
                )));
            }
            filled += n;
        }
        Ok(buf)
    })
    .await
    .map_err(spawn_err)?
}

/// Performs a single positional write of `data` at `offset`, serialized
/// through the device mutex when the target device requires it. Returns the
/// number of bytes the kernel accepted.
pub async fn write_at(
    file: Arc<std::fs::File>,
    data: Vec<u8>,
    offset: u64,
    device: Option<Device>,
) -> Result<usize> {
    tokio::task::spawn_blocking(move || {
        let _serial = device.as_ref().and_then(Device::lock);
        nix::sys::uio::pwrite(&*file, &data, offset as libc::off_t)
            .map_err(std::io::Error::from)
            .map_err(Error::from)
    })
    .await
    .map_err(spawn_err)?
}

/// Handle to the asynchronous I/O service. Operations run on the runtime's
/// blocking pool with at most `depth` in flight; clients use it to overlap
/// chunk reads with in-flight write RPCs, providers to overlap writes with
/// request handling.
#[derive(Clone, Debug)]
pub struct IoProvider {
    inflight: Arc<tokio::sync::Semaphore>,
}

impl IoProvider {
    pub fn new(depth: usize) -> Result<IoProvider> {
        if depth == 0 {
            return Err(Error::InvalidArg(
                "i/o provider depth must be positive".into(),
            ));
        }
        Ok(IoProvider {
            inflight: Arc::new(tokio::sync::Semaphore::new(depth)),
        })
    }

    pub async fn read_at(
        &self,
        file: &Arc<std::fs::File>,
        len: usize,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| Error::Allocation)?;
        read_at(file, len, offset).await
    }

    pub async fn write_at(
        &self,
        file: Arc<std::fs::File>,
        data: Vec<u8>,
        offset: u64,
        device: Option<Device>,
    ) -> Result<usize> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| Error::Allocation)?;
        write_at(file, data, offset, device).await
    }
}
