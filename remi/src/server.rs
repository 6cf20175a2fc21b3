//! Receiver engine: the migration service, its providers and the four RPC
//! handlers.
//!
//! A [`Service`] listens on one address and hosts any number of providers,
//! each addressed by a 16-bit id carried in the connection handshake. Each
//! accepted connection serves one sender and processes its requests
//! sequentially; concurrent migrations arrive on separate connections and
//! meet only at the provider's operation table.

use std::collections::HashMap;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::device::{self, Device};
use common::error::{Error, Result, SUCCESS};
use common::{Fileset, IoProvider, PROVIDER_ID_ANY, fsutil};
use remote::Connection;
use remote::protocol::{
    EndReply, Hello, HelloReply, MmapReply, PROVIDER_IDENT, RPC_MIGRATE_END, RPC_MIGRATE_MMAP,
    RPC_MIGRATE_START, RPC_MIGRATE_WRITE, Request, StartReply, WriteReply,
};

use crate::operation::{Operation, OperationState, OperationTable};

pub type MigrationCallback = Box<dyn Fn(&Fileset) -> i32 + Send + Sync>;

/// Callbacks invoked around a migration of a given class. The closures own
/// whatever user state they capture; it is dropped when the class is
/// deregistered or the service shuts down.
#[derive(Default)]
pub struct MigrationClass {
    before: Option<MigrationCallback>,
    after: Option<MigrationCallback>,
}

impl MigrationClass {
    pub fn new() -> MigrationClass {
        MigrationClass::default()
    }

    /// Called before any destination file is created; a non-zero status
    /// aborts the migration and travels back to the sender.
    pub fn on_before(mut self, callback: impl Fn(&Fileset) -> i32 + Send + Sync + 'static) -> Self {
        self.before = Some(Box::new(callback));
        self
    }

    /// Called once all data has been written and descriptors closed; a
    /// non-zero status travels back to the sender, which then keeps its
    /// source files.
    pub fn on_after(mut self, callback: impl Fn(&Fileset) -> i32 + Send + Sync + 'static) -> Self {
        self.after = Some(Box::new(callback));
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ProviderInner {
    provider_id: u16,
    classes: Mutex<HashMap<(String, u16), Arc<MigrationClass>>>,
    operations: OperationTable,
    io: Mutex<Option<IoProvider>>,
}

impl ProviderInner {
    fn lookup_class(&self, class: &str, provider_id: u16) -> Option<Arc<MigrationClass>> {
        let classes = lock(&self.classes);
        if provider_id == PROVIDER_ID_ANY {
            return classes
                .iter()
                .find(|((name, _), _)| name == class)
                .map(|(_, klass)| klass.clone());
        }
        classes
            .get(&(class.to_string(), provider_id))
            .or_else(|| classes.get(&(class.to_string(), PROVIDER_ID_ANY)))
            .cloned()
    }
}

/// A registered migration provider.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    pub fn id(&self) -> u16 {
        self.inner.provider_id
    }

    /// Routes this provider's positional writes through an asynchronous
    /// I/O provider; `None` reverts to unthrottled blocking writes.
    pub fn set_io_provider(&self, io: Option<IoProvider>) {
        *lock(&self.inner.io) = io;
    }

    /// Registers callbacks for `(class_name, provider_id)`. Registration
    /// under [`PROVIDER_ID_ANY`] matches filesets with any provider id.
    pub fn register_migration_class(
        &self,
        class_name: &str,
        provider_id: u16,
        class: MigrationClass,
    ) -> Result<()> {
        if class_name.is_empty() {
            return Err(Error::InvalidArg("class name must not be empty".into()));
        }
        let mut classes = lock(&self.inner.classes);
        let key = (class_name.to_string(), provider_id);
        if classes.contains_key(&key) {
            return Err(Error::ClassExists);
        }
        classes.insert(key, Arc::new(class));
        Ok(())
    }

    /// Removes the class and drops its callbacks together with any user
    /// state they own.
    pub fn deregister_migration_class(&self, class_name: &str, provider_id: u16) -> Result<()> {
        let mut classes = lock(&self.inner.classes);
        if classes
            .remove(&(class_name.to_string(), provider_id))
            .is_none()
        {
            return Err(Error::UnknownClass);
        }
        Ok(())
    }
}

type ProviderMap = Arc<Mutex<HashMap<u16, Arc<ProviderInner>>>>;

/// The migration service: a listener plus its registered providers.
pub struct Service {
    providers: ProviderMap,
    local_addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Service {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(addr: &str) -> Result<Service> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| Error::Transport(format!("failed binding {addr}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| Error::Transport(err.to_string()))?;
        let providers: ProviderMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(run_service(listener, providers.clone(), shutdown.clone()));
        tracing::info!(%local_addr, "migration service listening");
        Ok(Service {
            providers,
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Registers a provider under `provider_id`; duplicate ids are
    /// rejected.
    pub fn register_provider(&self, provider_id: u16) -> Result<Provider> {
        if provider_id == PROVIDER_ID_ANY {
            return Err(Error::InvalidArg(
                "provider id is reserved as the any-provider sentinel".into(),
            ));
        }
        let mut providers = lock(&self.providers);
        if providers.contains_key(&provider_id) {
            return Err(Error::InvalidArg(format!(
                "provider {provider_id} is already registered"
            )));
        }
        let inner = Arc::new(ProviderInner {
            provider_id,
            classes: Mutex::new(HashMap::new()),
            operations: OperationTable::default(),
            io: Mutex::new(None),
        });
        providers.insert(provider_id, inner.clone());
        Ok(Provider { inner })
    }

    pub fn provider_registered(&self, provider_id: u16) -> bool {
        lock(&self.providers).contains_key(&provider_id)
    }

    /// Unregisters a provider, dropping its migration classes and the user
    /// state their callbacks own.
    pub fn destroy_provider(&self, provider_id: u16) -> Result<()> {
        if lock(&self.providers).remove(&provider_id).is_none() {
            return Err(Error::UnknownProvider);
        }
        Ok(())
    }

    /// Resolves once the service has been asked to shut down, either
    /// through [`Service::shutdown`] or a remote shutdown request.
    pub async fn wait(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stops accepting connections, aborts in-flight ones and destroys all
    /// providers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        lock(&self.providers).clear();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_service(
    listener: tokio::net::TcpListener,
    providers: ProviderMap,
    shutdown: CancellationToken,
) {
    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    let providers = providers.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(stream, providers, shutdown).await {
                            tracing::debug!(%peer, %err, "connection ended with error");
                        }
                    });
                }
                Err(err) => tracing::warn!(%err, "failed accepting connection"),
            },
        }
    }
    connections.shutdown().await;
    tracing::info!("migration service stopped");
}

fn provider_for(providers: &ProviderMap, provider_id: u16) -> Option<Arc<ProviderInner>> {
    let providers = lock(providers);
    if provider_id == PROVIDER_ID_ANY {
        return providers.values().next().cloned();
    }
    providers.get(&provider_id).cloned()
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    providers: ProviderMap,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut conn = Connection::new(stream);
    let Some(hello) = conn.recv_mut().recv_message::<Hello>().await? else {
        return Ok(());
    };
    let provider = provider_for(&providers, hello.provider_id);
    conn.send_message(&HelloReply {
        ident: PROVIDER_IDENT.to_string(),
        known_provider: provider.is_some(),
    })
    .await?;
    if hello.ident != PROVIDER_IDENT {
        tracing::warn!(ident = %hello.ident, "rejecting peer with foreign identity");
        return Ok(());
    }
    while let Some(request) = conn.recv_mut().recv_message::<Request>().await? {
        match request {
            Request::Start {
                fileset,
                sizes,
                modes,
            } => {
                let reply = match &provider {
                    Some(provider) => handle_start(provider, fileset, sizes, modes).await,
                    None => StartReply {
                        err: Error::UnknownProvider.code(),
                        user_status: 0,
                        op_id: Uuid::new_v4(),
                    },
                };
                conn.send_message(&reply).await?;
            }
            Request::Mmap { op_id, total_size } => match &provider {
                Some(provider) => handle_mmap(provider, &mut conn, op_id, total_size).await?,
                None => {
                    conn.send_message(&MmapReply {
                        err: Error::UnknownProvider.code(),
                    })
                    .await?;
                    return Err(Error::UnknownProvider);
                }
            },
            Request::Write {
                op_id,
                file_index,
                offset,
                data,
            } => match &provider {
                Some(provider) => {
                    handle_write(provider, &mut conn, op_id, file_index, offset, data).await?;
                }
                None => {
                    conn.send_message(&WriteReply {
                        err: Error::UnknownProvider.code(),
                    })
                    .await?;
                }
            },
            Request::End { op_id } => {
                let reply = match &provider {
                    Some(provider) => handle_end(provider, op_id).await,
                    None => EndReply {
                        err: Error::UnknownProvider.code(),
                        user_status: 0,
                    },
                };
                conn.send_message(&reply).await?;
            }
            Request::Shutdown => {
                tracing::info!("remote shutdown requested");
                shutdown.cancel();
                break;
            }
        }
    }
    Ok(())
}

#[tracing::instrument(name = "remi_migrate_start", level = "debug", skip_all, fields(rpc = RPC_MIGRATE_START, class = %fileset.class()))]
async fn handle_start(
    provider: &Arc<ProviderInner>,
    fileset: Fileset,
    sizes: Vec<u64>,
    modes: Vec<u32>,
) -> StartReply {
    let op_id = Uuid::new_v4();
    let fail = |err: Error| StartReply {
        err: err.code(),
        user_status: 0,
        op_id,
    };
    let files: Vec<String> = fileset.files().map(str::to_string).collect();
    if sizes.len() != files.len() || modes.len() != files.len() {
        return fail(Error::InvalidArg(
            "size and mode vectors must align with the file list".into(),
        ));
    }
    let Some(class) = provider.lookup_class(fileset.class(), fileset.provider_id()) else {
        tracing::debug!(class = %fileset.class(), "no migration class registered");
        return StartReply {
            err: Error::UnknownClass.code(),
            user_status: 1,
            op_id,
        };
    };
    let paths: Vec<std::path::PathBuf> = files.iter().map(|f| fileset.full_path(f)).collect();
    // refuse to overwrite anything that already exists at the destination
    let check_paths = paths.clone();
    let existing = tokio::task::spawn_blocking(move || {
        check_paths.iter().find(|path| path.exists()).cloned()
    })
    .await;
    match existing {
        Ok(None) => {}
        Ok(Some(path)) => {
            tracing::debug!(?path, "destination file already exists");
            return fail(Error::FileExists);
        }
        Err(err) => return fail(Error::Io(err.to_string())),
    }
    if let Some(before) = &class.before {
        let status = before(&fileset);
        if status != 0 {
            return StartReply {
                err: Error::User(status).code(),
                user_status: status,
                op_id,
            };
        }
    }
    let open_paths = paths.clone();
    let open_modes = modes.clone();
    let opened = tokio::task::spawn_blocking(move || -> Result<Vec<Arc<std::fs::File>>> {
        let mut handles = Vec::with_capacity(open_paths.len());
        for (path, mode) in open_paths.iter().zip(&open_modes) {
            if let Some(parent) = path.parent() {
                fsutil::mkdirs(parent)?;
            }
            let permissions = mode & 0o7777;
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(permissions)
                .open(path)
                .map_err(|err| Error::Io(format!("cannot create {path:?}: {err}")))?;
            // the sender-reported permission bits win over the umask
            file.set_permissions(std::fs::Permissions::from_mode(permissions))
                .map_err(|err| Error::Io(format!("cannot set mode on {path:?}: {err}")))?;
            handles.push(Arc::new(file));
        }
        Ok(handles)
    })
    .await;
    let handles = match opened {
        Ok(Ok(handles)) => handles,
        Ok(Err(err)) => return fail(err),
        Err(err) => return fail(Error::Io(err.to_string())),
    };
    let devices: Vec<Device> = paths.iter().map(|path| device::lookup(path)).collect();
    let operation = Arc::new(Operation {
        fileset,
        sizes,
        devices,
        class,
        state: tokio::sync::Mutex::new(OperationState {
            handles,
            sticky: None,
        }),
    });
    provider.operations.insert(op_id, operation);
    tracing::debug!(%op_id, files = files.len(), "operation started");
    StartReply {
        err: SUCCESS,
        user_status: 0,
        op_id,
    }
}

#[tracing::instrument(name = "remi_migrate_mmap", level = "debug", skip(provider, conn), fields(rpc = RPC_MIGRATE_MMAP))]
async fn handle_mmap(
    provider: &Arc<ProviderInner>,
    conn: &mut Connection,
    op_id: Uuid,
    total_size: u64,
) -> Result<()> {
    let Some(operation) = provider.operations.lookup(&op_id) else {
        conn.send_message(&MmapReply {
            err: Error::InvalidOpId.code(),
        })
        .await?;
        // the sender streams the bulk right after the request; dropping the
        // connection is the only way to stay in sync
        return Err(Error::InvalidOpId);
    };
    let mut state = operation.state.lock().await;
    let expected: u64 = operation.sizes.iter().sum();
    if total_size != expected {
        conn.send_message(&MmapReply {
            err: Error::Migration.code(),
        })
        .await?;
        state.handles.clear();
        drop(state);
        provider.operations.remove(&op_id);
        return Err(Error::Migration);
    }
    let targets: Vec<(Arc<std::fs::File>, u64)> = state
        .handles
        .iter()
        .zip(&operation.sizes)
        .filter(|(_, size)| **size > 0)
        .map(|(file, size)| (file.clone(), *size))
        .collect();
    let mapped = tokio::task::spawn_blocking(move || -> Result<Vec<memmap2::MmapMut>> {
        let mut segments = Vec::with_capacity(targets.len());
        for (file, size) in targets {
            file.set_len(size)
                .map_err(|err| Error::Io(format!("ftruncate failed: {err}")))?;
            let segment = unsafe {
                memmap2::MmapOptions::new()
                    .len(size as usize)
                    .map_mut(&*file)
                    .map_err(|err| Error::Io(format!("mmap failed: {err}")))?
            };
            let _ = segment.advise(memmap2::Advice::Sequential);
            segments.push(segment);
        }
        Ok(segments)
    })
    .await
    .map_err(|err| Error::Io(err.to_string()));
    let mut segments = match mapped {
        Ok(Ok(segments)) => segments,
        Ok(Err(err)) | Err(err) => {
            conn.send_message(&MmapReply { err: err.code() }).await?;
            state.handles.clear();
            drop(state);
            provider.operations.remove(&op_id);
            return Err(err);
        }
    };
    // pull the remote segments into the mapped local ones
    for segment in &mut segments {
        if let Err(err) = conn.recv_data(&mut segment[..]).await {
            state.handles.clear();
            drop(state);
            provider.operations.remove(&op_id);
            return Err(err);
        }
    }
    let synced = tokio::task::spawn_blocking(move || -> Result<()> {
        for segment in &segments {
            segment
                .flush()
                .map_err(|err| Error::Io(format!("msync failed: {err}")))?;
        }
        drop(segments);
        Ok(())
    })
    .await
    .map_err(|err| Error::Io(err.to_string()));
    if let Ok(Err(err)) | Err(err) = synced {
        conn.send_message(&MmapReply { err: err.code() }).await?;
        state.handles.clear();
        drop(state);
        provider.operations.remove(&op_id);
        return Ok(());
    }
    drop(state);
    tracing::debug!(%op_id, bytes = total_size, "bulk transfer complete");
    conn.send_message(&MmapReply { err: SUCCESS }).await
}

#[tracing::instrument(name = "remi_migrate_write", level = "trace", skip(provider, conn, data), fields(rpc = RPC_MIGRATE_WRITE, len = data.len()))]
async fn handle_write(
    provider: &Arc<ProviderInner>,
    conn: &mut Connection,
    op_id: Uuid,
    file_index: u32,
    offset: u64,
    data: Vec<u8>,
) -> Result<()> {
    let Some(operation) = provider.operations.lookup(&op_id) else {
        conn.send_message(&WriteReply {
            err: Error::InvalidOpId.code(),
        })
        .await?;
        return Ok(());
    };
    let mut state = operation.state.lock().await;
    let index = file_index as usize;
    let in_range = index < operation.sizes.len()
        && index < state.handles.len()
        && offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= operation.sizes[index]);
    if !in_range {
        conn.send_message(&WriteReply {
            err: Error::Io(String::new()).code(),
        })
        .await?;
        return Ok(());
    }
    // reply before performing the write so the sender can read its next
    // chunk; failures surface through the sticky error consumed at END
    conn.send_message(&WriteReply { err: SUCCESS }).await?;
    let file = state.handles[index].clone();
    let device = operation.devices[index].clone();
    let len = data.len();
    let io = lock(&provider.io).clone();
    let written = match io {
        Some(io) => io.write_at(file, data, offset, Some(device)).await,
        None => common::io::write_at(file, data, offset, Some(device)).await,
    };
    let failure = match written {
        Ok(n) if n == len => None,
        Ok(n) => Some(Error::Io(format!("short write: {n} of {len} bytes"))),
        Err(err) => Some(err),
    };
    if let Some(err) = failure {
        tracing::warn!(%op_id, file_index, offset, %err, "write failed");
        if state.sticky.is_none() {
            state.sticky = Some(err);
        }
    }
    Ok(())
}

#[tracing::instrument(name = "remi_migrate_end", level = "debug", skip(provider), fields(rpc = RPC_MIGRATE_END))]
async fn handle_end(provider: &Arc<ProviderInner>, op_id: Uuid) -> EndReply {
    let Some(operation) = provider.operations.lookup(&op_id) else {
        return EndReply {
            err: Error::InvalidOpId.code(),
            user_status: 0,
        };
    };
    let reply = {
        let mut state = operation.state.lock().await;
        state.handles.clear();
        match state.sticky.take() {
            Some(err) => EndReply {
                err: err.code(),
                user_status: 0,
            },
            None => match &operation.class.after {
                Some(after) => {
                    let status = after(&operation.fileset);
                    if status == 0 {
                        EndReply {
                            err: SUCCESS,
                            user_status: 0,
                        }
                    } else {
                        EndReply {
                            err: Error::User(status).code(),
                            user_status: status,
                        }
                    }
                }
                None => EndReply {
                    err: SUCCESS,
                    user_status: 0,
                },
            },
        }
    };
    provider.operations.remove(&op_id);
    tracing::debug!(%op_id, err = reply.err, "operation ended");
    reply
}
