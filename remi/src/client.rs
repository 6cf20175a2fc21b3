//! Sender engine: clients, provider handles and the migrate call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::error::{Error, Result};
use common::{Fileset, IoProvider, PROVIDER_ID_ANY, fsutil};
use remote::Connection;
use remote::protocol::{
    EndReply, Hello, HelloReply, MmapReply, PROVIDER_IDENT, Request, StartReply, WriteReply,
};

/// What happens to the source files after a successful migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceDisposition {
    KeepSource,
    RemoveSource,
}

/// How file contents travel to the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// Map every source file and push the whole bulk in one RPC.
    Mmap,
    /// Pipeline bounded chunks through repeated write RPCs.
    Chunked,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ClientInner {
    io: Mutex<Option<IoProvider>>,
    provider_handles: AtomicU64,
}

/// Factory for provider handles, holding client-wide state such as the
/// optional asynchronous I/O provider.
#[derive(Clone, Default)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new() -> Client {
        Client::default()
    }

    /// Chunked migrations overlap their local reads with in-flight write
    /// RPCs when an I/O provider is set; without one, chunks are read and
    /// sent strictly in turn.
    pub fn set_io_provider(&self, io: Option<IoProvider>) {
        *lock(&self.inner.io) = io;
    }

    /// Number of provider handles currently alive on this client.
    pub fn provider_handle_count(&self) -> u64 {
        self.inner.provider_handles.load(Ordering::Relaxed)
    }

    /// Connects to `(addr, provider_id)` and performs the identity
    /// handshake; a peer that does not identify as a migration provider, or
    /// does not know the provider id, fails with `UnknownProvider`.
    pub async fn provider_handle(&self, addr: &str, provider_id: u16) -> Result<ProviderHandle> {
        let mut conn = Connection::connect(addr).await?;
        let reply: HelloReply = conn
            .call(&Hello {
                ident: PROVIDER_IDENT.to_string(),
                provider_id,
            })
            .await?;
        if reply.ident != PROVIDER_IDENT || !reply.known_provider {
            return Err(Error::UnknownProvider);
        }
        self.inner.provider_handles.fetch_add(1, Ordering::Relaxed);
        Ok(ProviderHandle {
            inner: Arc::new(HandleInner {
                client: self.inner.clone(),
                provider_id,
                conn: tokio::sync::Mutex::new(conn),
            }),
        })
    }

    /// Asks the remote service to shut down.
    pub async fn shutdown_service(&self, addr: &str) -> Result<()> {
        let mut conn = Connection::connect(addr).await?;
        let reply: HelloReply = conn
            .call(&Hello {
                ident: PROVIDER_IDENT.to_string(),
                provider_id: PROVIDER_ID_ANY,
            })
            .await?;
        if reply.ident != PROVIDER_IDENT {
            return Err(Error::UnknownProvider);
        }
        conn.send_message(&Request::Shutdown).await
    }
}

struct HandleInner {
    client: Arc<ClientInner>,
    provider_id: u16,
    conn: tokio::sync::Mutex<Connection>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.client.provider_handles.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Reference-counted handle to a remote provider; cloning shares the
/// underlying connection, dropping the last clone releases it.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<HandleInner>,
}

impl ProviderHandle {
    pub fn provider_id(&self) -> u16 {
        self.inner.provider_id
    }

    /// Migrates the fileset to `remote_root` on the provider this handle is
    /// connected to.
    ///
    /// The fileset is expanded (explicit files plus recursive directory
    /// scans), every source file is opened and stat'ed, and the receiver is
    /// driven through the start/transfer/end sequence. A user callback
    /// failing on the receiver surfaces as [`Error::User`] with its status,
    /// and the sources are removed only when the whole migration succeeded
    /// and `RemoveSource` was requested.
    #[tracing::instrument(level = "debug", skip(self, fileset), fields(class = %fileset.class()))]
    pub async fn migrate(
        &self,
        fileset: &Fileset,
        remote_root: &str,
        disposition: SourceDisposition,
        mode: TransferMode,
    ) -> Result<()> {
        if !remote_root.starts_with('/') {
            return Err(Error::InvalidArg(format!(
                "remote root must be absolute: {remote_root:?}"
            )));
        }
        let files: Vec<String> = fileset.walkthrough()?.into_iter().collect();
        let (handles, sizes, modes) = open_sources(fileset, &files).await?;
        let resolved = fileset.resolved(remote_root, files.iter().cloned().collect())?;
        let mut conn = self.inner.conn.lock().await;
        let start: StartReply = conn
            .call(&Request::Start {
                fileset: resolved,
                sizes: sizes.clone(),
                modes,
            })
            .await?;
        Error::check(start.err, start.user_status)?;
        let op_id = start.op_id;
        tracing::debug!(%op_id, files = files.len(), "operation started");
        let write_err = match mode {
            TransferMode::Mmap => {
                send_mapped(&mut conn, op_id, handles, &sizes).await?;
                None
            }
            TransferMode::Chunked => {
                let io = lock(&self.inner.client.io).clone();
                let result =
                    send_chunked(&mut conn, op_id, &handles, &sizes, fileset.xfer_size(), io)
                        .await?;
                drop(handles);
                result
            }
        };
        let end: EndReply = conn.call(&Request::End { op_id }).await?;
        drop(conn);
        if let Some(err) = write_err {
            return Err(err);
        }
        Error::check(end.err, end.user_status)?;
        if disposition == SourceDisposition::RemoveSource {
            remove_sources(fileset, &files).await;
        }
        Ok(())
    }
}

type OpenedSources = (Vec<Arc<std::fs::File>>, Vec<u64>, Vec<u32>);

/// Opens and stats every expanded source file. A file that cannot be opened
/// fails the migration with `UnknownFile`; a failing stat with `Io`.
async fn open_sources(fileset: &Fileset, files: &[String]) -> Result<OpenedSources> {
    use std::os::unix::fs::PermissionsExt;
    let paths: Vec<std::path::PathBuf> = files.iter().map(|f| fileset.full_path(f)).collect();
    tokio::task::spawn_blocking(move || {
        let mut handles = Vec::with_capacity(paths.len());
        let mut sizes = Vec::with_capacity(paths.len());
        let mut modes = Vec::with_capacity(paths.len());
        for path in &paths {
            let file = std::fs::File::open(path)
                .map_err(|_| Error::UnknownFile(path.display().to_string()))?;
            let metadata = file
                .metadata()
                .map_err(|err| Error::Io(format!("cannot stat {path:?}: {err}")))?;
            sizes.push(metadata.len());
            modes.push(metadata.permissions().mode());
            handles.push(Arc::new(file));
        }
        Ok((handles, sizes, modes))
    })
    .await
    .map_err(|err| Error::Io(err.to_string()))?
}

/// Maps every non-empty source read-only, closes the descriptors and pushes
/// the concatenated segments as one bulk following the mmap request.
async fn send_mapped(
    conn: &mut Connection,
    op_id: uuid::Uuid,
    handles: Vec<Arc<std::fs::File>>,
    sizes: &[u64],
) -> Result<()> {
    let sources: Vec<(Arc<std::fs::File>, u64)> = handles
        .into_iter()
        .zip(sizes)
        .filter(|(_, size)| **size > 0)
        .map(|(file, size)| (file, *size))
        .collect();
    let segments = tokio::task::spawn_blocking(move || -> Result<Vec<memmap2::Mmap>> {
        let mut segments = Vec::with_capacity(sources.len());
        for (file, size) in sources {
            let segment = unsafe {
                memmap2::MmapOptions::new()
                    .len(size as usize)
                    .map(&*file)
                    .map_err(|_| Error::Allocation)?
            };
            let _ = segment.advise(memmap2::Advice::Sequential);
            segments.push(segment);
            // descriptor closes here; the mapping stays valid on its own
        }
        Ok(segments)
    })
    .await
    .map_err(|err| Error::Io(err.to_string()))??;
    let total_size: u64 = sizes.iter().sum();
    conn.send_message(&Request::Mmap { op_id, total_size }).await?;
    let mut streamed = Ok(());
    for segment in &segments {
        streamed = conn.send_data(&segment[..]).await;
        if streamed.is_err() {
            break;
        }
    }
    // even when streaming broke, the receiver may have parked an error
    // reply for us; prefer its verdict over the raw transport failure
    let reply: Result<MmapReply> = conn.recv_reply().await;
    drop(segments);
    match (streamed, reply) {
        (_, Ok(reply)) => Error::check(reply.err, 0),
        (Err(err), Err(_)) => Err(err),
        (Ok(()), Err(err)) => Err(err),
    }
}

/// Sends one file after another in chunks of at most `xfer_size` bytes.
/// With an I/O provider the next chunk is read while the previous write RPC
/// is in flight; without one, reads and RPCs strictly alternate. The first
/// failed write reply (or local read failure) stops the transfer and is
/// reported after END has run.
async fn send_chunked(
    conn: &mut Connection,
    op_id: uuid::Uuid,
    handles: &[Arc<std::fs::File>],
    sizes: &[u64],
    xfer_size: u64,
    io: Option<IoProvider>,
) -> Result<Option<Error>> {
    for (index, (handle, &size)) in handles.iter().zip(sizes).enumerate() {
        if size == 0 {
            continue;
        }
        let file_index = index as u32;
        let outcome = match &io {
            None => send_file_serial(conn, op_id, file_index, handle, size, xfer_size).await?,
            Some(io) => {
                send_file_pipelined(conn, op_id, file_index, handle, size, xfer_size, io).await?
            }
        };
        if outcome.is_some() {
            return Ok(outcome);
        }
    }
    Ok(None)
}

async fn send_write(
    conn: &mut Connection,
    op_id: uuid::Uuid,
    file_index: u32,
    offset: u64,
    data: Vec<u8>,
) -> Result<Option<Error>> {
    let reply: WriteReply = conn
        .call(&Request::Write {
            op_id,
            file_index,
            offset,
            data,
        })
        .await?;
    Ok(Error::check(reply.err, 0).err())
}

async fn send_file_serial(
    conn: &mut Connection,
    op_id: uuid::Uuid,
    file_index: u32,
    handle: &Arc<std::fs::File>,
    size: u64,
    xfer_size: u64,
) -> Result<Option<Error>> {
    let mut offset = 0u64;
    while offset < size {
        let len = xfer_size.min(size - offset) as usize;
        let data = match common::io::read_at(handle, len, offset).await {
            Ok(data) => data,
            Err(err) => return Ok(Some(err)),
        };
        if let Some(err) = send_write(conn, op_id, file_index, offset, data).await? {
            return Ok(Some(err));
        }
        offset += len as u64;
    }
    Ok(None)
}

/// Two-buffer pipeline: while a chunk's write RPC is in flight, the next
/// chunk is read through the I/O provider.
async fn send_file_pipelined(
    conn: &mut Connection,
    op_id: uuid::Uuid,
    file_index: u32,
    handle: &Arc<std::fs::File>,
    size: u64,
    xfer_size: u64,
    io: &IoProvider,
) -> Result<Option<Error>> {
    let first_len = xfer_size.min(size) as usize;
    let mut chunk = match io.read_at(handle, first_len, 0).await {
        Ok(data) => data,
        Err(err) => return Ok(Some(err)),
    };
    let mut offset = 0u64;
    loop {
        let next_offset = offset + chunk.len() as u64;
        let request = Request::Write {
            op_id,
            file_index,
            offset,
            data: chunk,
        };
        if next_offset < size {
            let next_len = xfer_size.min(size - next_offset) as usize;
            let (reply, next) = tokio::join!(
                conn.call::<_, WriteReply>(&request),
                io.read_at(handle, next_len, next_offset)
            );
            if let Some(err) = Error::check(reply?.err, 0).err() {
                return Ok(Some(err));
            }
            chunk = match next {
                Ok(data) => data,
                Err(err) => return Ok(Some(err)),
            };
            offset = next_offset;
        } else {
            let reply: WriteReply = conn.call(&request).await?;
            return Ok(Error::check(reply.err, 0).err());
        }
    }
}

/// Best-effort removal of the migrated sources: every expanded file, then
/// every registered directory recursively.
async fn remove_sources(fileset: &Fileset, files: &[String]) {
    for file in files {
        let path = fileset.full_path(file);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            tracing::warn!(?path, %err, "failed removing migrated source file");
        }
    }
    for dir in fileset.directories() {
        let path = fileset.full_path(dir);
        if let Err(err) = fsutil::remove_rec(&path).await {
            tracing::warn!(?path, %err, "failed removing migrated source directory");
        }
    }
}
