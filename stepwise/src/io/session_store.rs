//! Session persistence behind a single store-wide lock.
//!
//! [`SessionStore::lock`] hands out a [`SessionTxn`]; the engine holds one for
//! each read-modify-write so transitions on the stack never interleave.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use crate::core::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session file {} is not valid: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize session '{id}': {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw storage for sessions. Callers serialize access through [`SessionStore`].
pub trait SessionBackend: Send {
    fn load_all(&self) -> Result<Vec<Session>, StoreError>;
    fn read(&self, id: &str) -> Result<Option<Session>, StoreError>;
    fn write(&mut self, session: &Session) -> Result<(), StoreError>;
    /// Returns whether a session was removed.
    fn delete(&mut self, id: &str) -> Result<bool, StoreError>;
}

/// One pretty-printed JSON file per session.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File for `id`, or `None` when the id could escape the sessions directory.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{id}.json")))
    }

    fn read_path(path: &Path) -> Result<Option<Session>, StoreError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    action: "read",
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}

impl SessionBackend for FileBackend {
    fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    action: "list",
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Io {
                    action: "list",
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match Self::read_path(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                // One unreadable file must not hide the rest of the stack.
                Err(err) => warn!(err = %err, "skipping unreadable session file"),
            }
        }
        Ok(sessions)
    }

    fn read(&self, id: &str) -> Result<Option<Session>, StoreError> {
        match self.path_for(id) {
            Some(path) => Self::read_path(&path),
            None => Ok(None),
        }
    }

    fn write(&mut self, session: &Session) -> Result<(), StoreError> {
        let path = self
            .path_for(&session.session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session.session_id.clone()))?;
        let io_err = |action, path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io {
                action,
                path,
                source,
            }
        };

        fs::create_dir_all(&self.dir).map_err(io_err("create", &self.dir))?;
        let mut buf =
            serde_json::to_string_pretty(session).map_err(|source| StoreError::Serialize {
                id: session.session_id.clone(),
                source,
            })?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf).map_err(io_err("write", &tmp_path))?;
        fs::rename(&tmp_path, &path).map_err(io_err("replace", &path))?;
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                action: "remove",
                path,
                source,
            }),
        }
    }
}

/// In-memory sessions, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    sessions: BTreeMap<String, Session>,
}

impl SessionBackend for MemoryBackend {
    fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.values().cloned().collect())
    }

    fn read(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(id).cloned())
    }

    fn write(&mut self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(id).is_some())
    }
}

pub struct SessionStore {
    backend: Mutex<Box<dyn SessionBackend>>,
}

impl SessionStore {
    pub fn new(backend: impl SessionBackend + 'static) -> Self {
        Self {
            backend: Mutex::new(Box::new(backend)),
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(FileBackend::new(dir))
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }

    /// Take the store lock. Every operation on the returned guard is atomic
    /// with respect to other holders.
    pub async fn lock(&self) -> SessionTxn<'_> {
        SessionTxn {
            backend: self.backend.lock().await,
        }
    }

    pub async fn create(&self, session: Session) -> Result<String, StoreError> {
        self.lock().await.create(session)
    }

    pub async fn get(&self, id: &str) -> Result<Session, StoreError> {
        self.lock().await.get(id)
    }

    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Session, StoreError>
    where
        F: FnOnce(&mut Session),
    {
        self.lock().await.update(id, mutate)
    }

    pub async fn remove(&self, id: &str) -> Result<Session, StoreError> {
        self.lock().await.remove(id)
    }

    pub async fn list_stack(&self) -> Result<Vec<Session>, StoreError> {
        self.lock().await.list_stack()
    }
}

/// Exclusive access to the sessions for the lifetime of the guard.
pub struct SessionTxn<'a> {
    backend: MutexGuard<'a, Box<dyn SessionBackend>>,
}

impl SessionTxn<'_> {
    /// Persist a new session on top of the stack and return its id.
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    pub fn create(&mut self, mut session: Session) -> Result<String, StoreError> {
        if self.backend.read(&session.session_id)?.is_some() {
            return Err(StoreError::AlreadyExists(session.session_id));
        }
        let top_seq = self
            .backend
            .load_all()?
            .iter()
            .map(|existing| existing.stack_seq)
            .max()
            .unwrap_or(0);
        session.stack_seq = top_seq + 1;
        self.backend.write(&session)?;
        debug!(stack_seq = session.stack_seq, "session created");
        Ok(session.session_id)
    }

    pub fn get(&self, id: &str) -> Result<Session, StoreError> {
        self.backend
            .read(id)?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Apply `mutate` and persist. The session id cannot be changed.
    pub fn update<F>(&mut self, id: &str, mutate: F) -> Result<Session, StoreError>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self.get(id)?;
        mutate(&mut session);
        session.session_id = id.to_string();
        session.touch();
        self.backend.write(&session)?;
        Ok(session)
    }

    /// Remove `id` from wherever it sits in the stack.
    #[instrument(skip_all, fields(session_id = %id))]
    pub fn remove(&mut self, id: &str) -> Result<Session, StoreError> {
        let session = self.get(id)?;
        if !self.backend.delete(id)? {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        debug!("session removed");
        Ok(session)
    }

    /// Active sessions ordered bottom to top.
    pub fn list_stack(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = self.backend.load_all()?;
        sessions.sort_by(|a, b| {
            a.stack_seq
                .cmp(&b.stack_seq)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(sessions)
    }

    pub fn top(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.list_stack()?.pop())
    }
}
