//! OneDrive backend over the Microsoft Graph REST API.
//!
//! Repository objects live under a user-supplied prefix path on the drive.
//! Uploads always use the chunked upload-session protocol; listings paginate
//! with `@odata.nextLink` cursors and fan out across data shards; a counting
//! semaphore bounds concurrent requests.

pub mod auth;

mod client;
mod folders;
mod sem;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use ruck_types::{CancelToken, Result, RuckError};

use crate::layout::Layout;
use crate::{Backend, FileInfo, FileType, Handle, SaveStream};

use self::client::{fragment_spans, GraphClient, UPLOAD_FRAGMENT_SIZE};
use self::folders::FolderSet;
use self::sem::{Permit, Semaphore};

/// Default bound on concurrent outbound HTTP requests.
pub const DEFAULT_CONNECTIONS: usize = 5;

/// Default per-operation deadline.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Capacity of the listing output channel.
const LIST_CHANNEL_CAP: usize = 128;

#[derive(Debug, Clone)]
pub struct OneDriveConfig {
    /// Repository root path relative to the drive root.
    pub prefix: String,
    /// OAuth secrets file; resolved via `ONEDRIVE_SECRETS_FILE` or the
    /// default config-dir location when `None`.
    pub secrets_file: Option<PathBuf>,
    /// Concurrent request bound (semaphore size).
    pub connections: usize,
    /// Deadline applied to each public operation.
    pub op_timeout: Duration,
    /// Graph endpoint override, used by tests against a mock server.
    pub base_url: Option<String>,
    /// Token endpoint override, used by tests against a mock server.
    pub token_url: Option<String>,
}

impl OneDriveConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        OneDriveConfig {
            prefix: prefix.into(),
            secrets_file: None,
            connections: DEFAULT_CONNECTIONS,
            op_timeout: DEFAULT_OP_TIMEOUT,
            base_url: None,
            token_url: None,
        }
    }

    /// Parse a repository URL of the form `onedrive:PREFIX`.
    pub fn parse_url(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("onedrive:").ok_or_else(|| {
            RuckError::Config(format!(
                "invalid onedrive repository URL '{s}': expected onedrive:PREFIX"
            ))
        })?;
        let prefix = rest.trim_matches('/');
        if prefix.is_empty() {
            return Err(RuckError::Config(
                "onedrive repository URL has an empty prefix".into(),
            ));
        }
        Ok(OneDriveConfig::new(prefix))
    }
}

struct Inner {
    client: GraphClient,
    sem: Semaphore,
    folders: FolderSet,
    layout: Layout,
    connections: usize,
    op_timeout: Duration,
}

/// Backend over the OneDrive Graph API.
pub struct OneDriveBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OneDriveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneDriveBackend").finish_non_exhaustive()
    }
}

impl OneDriveBackend {
    /// Open an existing repository location.
    pub fn open(config: OneDriveConfig, cancel: &CancelToken) -> Result<Self> {
        Self::open_internal(config, cancel, false)
    }

    /// Open for initialization: fails with `ConfigExists` if the location
    /// already holds a repository config, and pre-creates the directory
    /// skeleton.
    pub fn create(config: OneDriveConfig, cancel: &CancelToken) -> Result<Self> {
        Self::open_internal(config, cancel, true)
    }

    fn open_internal(
        config: OneDriveConfig,
        cancel: &CancelToken,
        create_new: bool,
    ) -> Result<Self> {
        let secrets = auth::secrets_path(config.secrets_file.as_deref())?;
        let token_source = auth::TokenSource::from_file(&secrets, config.token_url.as_deref())?;
        let client = GraphClient::new(token_source, config.base_url.as_deref());
        let layout = Layout::new(&config.prefix);

        let op = cancel.with_timeout(config.op_timeout);
        op.check()?;

        // Probe the config object; this also validates the credentials.
        match client.item_info(&layout.filename(&Handle::config())) {
            Ok(_) if create_new => return Err(RuckError::ConfigExists),
            Ok(_) => {}
            Err(e) if e.is_not_exist() => {}
            Err(e) => return Err(e),
        }

        let inner = Arc::new(Inner {
            client,
            sem: Semaphore::new(config.connections.max(1)),
            folders: FolderSet::new(),
            layout,
            connections: config.connections.max(1),
            op_timeout: config.op_timeout,
        });

        if create_new {
            let create = |p: &str| inner.client.create_folder(p);
            inner.folders.ensure_path(inner.layout.prefix(), &create)?;
            for dir in inner.layout.paths() {
                inner.folders.ensure_path(&dir, &create)?;
            }
        }

        Ok(OneDriveBackend { inner })
    }
}

/// Reader returned by `load`: holds the connection permit until dropped.
struct PermitReader {
    rd: Box<dyn Read + Send>,
    _permit: Permit,
}

impl Read for PermitReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.rd.read(buf)
    }
}

/// Push into the listing channel without holding up forever: polls the
/// cancellation token while the channel is full. Returns `false` when the
/// producer should stop (cancelled or receiver gone).
fn send_name(tx: &Sender<String>, cancel: &CancelToken, name: String) -> bool {
    let mut pending = name;
    loop {
        match tx.send_timeout(pending, Duration::from_millis(100)) {
            Ok(()) => return true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(v)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                pending = v;
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

impl Inner {
    /// List one remote directory page by page, publishing child names.
    ///
    /// The semaphore token is held only while fetching a page, never while
    /// blocked on the output channel — a consumer that needs a token to
    /// process results would otherwise deadlock against the listers.
    fn list_dir(&self, dir: &str, tx: &Sender<String>, cancel: &CancelToken) -> Result<()> {
        let mut url = self.client.children_url(dir);
        loop {
            cancel.check()?;
            let (names, next) = {
                let _permit = self.sem.acquire();
                self.client.children_page(&url)?
            };
            for name in names {
                if !send_name(tx, cancel, name) {
                    return Ok(());
                }
            }
            match next {
                Some(n) => url = n,
                None => return Ok(()),
            }
        }
    }

    fn run_list(&self, t: FileType, tx: Sender<String>, cancel: CancelToken) {
        let (basedir, sharded) = self.layout.basedir(t);

        if !sharded {
            if let Err(e) = self.list_dir(&basedir, &tx, &cancel) {
                if !e.is_not_exist() {
                    warn!("onedrive list {basedir}: {e}");
                }
            }
            return;
        }

        // Phase 1: enumerate shard subdirectories of the type root.
        let (shard_tx, shard_rx) = crossbeam_channel::unbounded::<String>();
        {
            let mut url = self.client.children_url(&basedir);
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let page = {
                    let _permit = self.sem.acquire();
                    self.client.children_page(&url)
                };
                match page {
                    Ok((names, next)) => {
                        for name in names {
                            shard_tx.send(name).ok();
                        }
                        match next {
                            Some(n) => url = n,
                            None => break,
                        }
                    }
                    Err(e) => {
                        if !e.is_not_exist() {
                            warn!("onedrive list {basedir}: {e}");
                        }
                        return;
                    }
                }
            }
        }
        drop(shard_tx);

        // Phase 2: one listing task per shard, bounded by connections-1
        // workers so the fan-out can never exhaust the whole semaphore.
        let workers = self.connections.saturating_sub(1).max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let shard_rx = shard_rx.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let basedir = basedir.clone();
                scope.spawn(move || {
                    for shard in shard_rx.iter() {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let dir = format!("{basedir}/{shard}");
                        if let Err(e) = self.list_dir(&dir, &tx, &cancel) {
                            if !e.is_not_exist() {
                                warn!("onedrive list {dir}: {e}");
                            }
                        }
                    }
                });
            }
        });
    }
}

impl Backend for OneDriveBackend {
    fn location(&self) -> String {
        format!("onedrive:{}", self.inner.layout.prefix())
    }

    fn test(&self, h: &Handle, cancel: &CancelToken) -> Result<bool> {
        h.valid()?;
        let op = cancel.with_timeout(self.inner.op_timeout);
        let _permit = self.inner.sem.acquire();
        op.check()?;
        match self.inner.client.item_info(&self.inner.layout.filename(h)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_exist() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn save(&self, h: &Handle, body: SaveStream<'_>, cancel: &CancelToken) -> Result<()> {
        h.valid()?;
        let op = cancel.with_timeout(self.inner.op_timeout);
        let _permit = self.inner.sem.acquire();
        op.check()?;

        // Pre-create ancestors; a missing intermediate folder fails the
        // upload with 412.
        let dir = self.inner.layout.dirname(h);
        let client = &self.inner.client;
        self.inner
            .folders
            .ensure_path(&dir, &|p| client.create_folder(p))?;

        let (reader, size) = body.into_parts();
        let total = size.ok_or(RuckError::UnknownSize)?;
        if total == 0 {
            return Err(RuckError::InvalidFormat(format!(
                "refusing to upload empty object {h}"
            )));
        }

        let filename = self.inner.layout.filename(h);
        let protect = h.file_type == FileType::Config;
        let upload_url = client.create_upload_session(&filename, protect)?;

        let mut buf = vec![0u8; UPLOAD_FRAGMENT_SIZE.min(total) as usize];
        for (pos, len) in fragment_spans(total) {
            op.check()?;
            let fragment = &mut buf[..len as usize];
            reader.read_exact(fragment)?;
            client.upload_fragment(&upload_url, fragment, pos, total)?;
        }
        Ok(())
    }

    fn load(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Read + Send>> {
        h.valid()?;
        let op = cancel.with_timeout(self.inner.op_timeout);
        let permit = self.inner.sem.acquire();
        op.check()?;

        let rd = self
            .inner
            .client
            .get_content(&self.inner.layout.filename(h), length, offset)?;
        // The permit travels with the reader and is released on drop.
        Ok(Box::new(PermitReader {
            rd,
            _permit: permit,
        }))
    }

    fn stat(&self, h: &Handle, cancel: &CancelToken) -> Result<FileInfo> {
        h.valid()?;
        let op = cancel.with_timeout(self.inner.op_timeout);
        let _permit = self.inner.sem.acquire();
        op.check()?;
        let item = self.inner.client.item_info(&self.inner.layout.filename(h))?;
        Ok(FileInfo { size: item.size })
    }

    fn remove(&self, h: &Handle, cancel: &CancelToken) -> Result<()> {
        h.valid()?;
        let op = cancel.with_timeout(self.inner.op_timeout);
        let _permit = self.inner.sem.acquire();
        op.check()?;
        self.inner
            .client
            .delete_item(&self.inner.layout.filename(h))
    }

    fn list(&self, t: FileType, cancel: &CancelToken) -> Receiver<String> {
        let (tx, rx) = crossbeam_channel::bounded(LIST_CHANNEL_CAP);
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        std::thread::spawn(move || inner.run_list(t, tx, cancel));
        rx
    }

    fn delete(&self, cancel: &CancelToken) -> Result<()> {
        let op = cancel.with_timeout(self.inner.op_timeout);
        let _permit = self.inner.sem.acquire();
        op.check()?;
        match self.inner.client.delete_item(self.inner.layout.prefix()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_exist() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
