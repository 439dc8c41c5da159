use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use ruck_types::{Result, RuckError};

/// Tracks which remote folders are known to exist.
///
/// OneDrive saves fail with 412 when an intermediate folder is missing, so
/// every ancestor of a target path is ensured before upload. Invariants:
///
/// - a folder proven to exist is never re-requested;
/// - each distinct path is created at most once per process, even when many
///   threads race to the same path — the loser waits on a per-path latch;
/// - creation of *different* paths proceeds concurrently.
///
/// A failed creation removes the map entry so a later save can retry.
pub(crate) struct FolderSet {
    map: Mutex<HashMap<String, FolderState>>,
}

enum FolderState {
    Creating(Arc<Latch>),
    Exists,
}

struct Latch {
    state: Mutex<Option<std::result::Result<(), String>>>,
    done: Condvar,
}

impl Latch {
    fn new() -> Self {
        Latch {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn set(&self, result: std::result::Result<(), String>) {
        let mut state = self.state.lock().unwrap();
        *state = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> std::result::Result<(), String> {
        let mut state = self.state.lock().unwrap();
        while state.is_none() {
            state = self.done.wait(state).unwrap();
        }
        state.clone().unwrap()
    }
}

impl FolderSet {
    pub(crate) fn new() -> Self {
        FolderSet {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure every path prefix of `path` exists, creating missing levels
    /// through `create` (deepest last).
    pub(crate) fn ensure_path(
        &self,
        path: &str,
        create: &dyn Fn(&str) -> Result<()>,
    ) -> Result<()> {
        for name in path_names(path) {
            self.ensure(&name, create)?;
        }
        Ok(())
    }

    fn ensure(&self, path: &str, create: &dyn Fn(&str) -> Result<()>) -> Result<()> {
        enum Role {
            Done,
            Waiter(Arc<Latch>),
            Creator(Arc<Latch>),
        }

        let role = {
            let mut map = self.map.lock().unwrap();
            match map.get(path) {
                Some(FolderState::Exists) => Role::Done,
                Some(FolderState::Creating(latch)) => Role::Waiter(Arc::clone(latch)),
                None => {
                    let latch = Arc::new(Latch::new());
                    map.insert(path.to_string(), FolderState::Creating(Arc::clone(&latch)));
                    Role::Creator(latch)
                }
            }
        };

        match role {
            Role::Done => Ok(()),
            Role::Waiter(latch) => latch
                .wait()
                .map_err(|msg| RuckError::Other(format!("folder create failed: {msg}"))),
            Role::Creator(latch) => {
                let result = create(path);
                {
                    let mut map = self.map.lock().unwrap();
                    match &result {
                        Ok(()) => {
                            map.insert(path.to_string(), FolderState::Exists);
                        }
                        Err(_) => {
                            map.remove(path);
                        }
                    }
                }
                latch.set(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                result
            }
        }
    }
}

/// Cumulative path prefixes of `path`, shallowest first. Leading, trailing
/// and repeated separators are ignored.
///
/// `path_names("a/b/c")` is `["a", "a/b", "a/b/c"]`.
pub(crate) fn path_names(path: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if current.is_empty() {
            current.push_str(segment);
        } else {
            current.push('/');
            current.push_str(segment);
        }
        names.push(current.clone());
    }
    names
}
