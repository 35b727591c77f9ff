//! Sessions, shared state, and the pluggable runtime services.
//!
//! A [`Session`] is the per-invocation identity plus a mutable key/value
//! [`SessionState`]. The state map is shared read/write across every agent
//! of one invocation: leaf agents are the only writers and the scheduler
//! serializes them at wave boundaries, so plain snapshot/apply semantics
//! are enough; there is no per-key locking.
//!
//! Three service families back the session lifecycle, selected per
//! workflow by [`RuntimeConfig`](crate::agentflow::workflow::RuntimeConfig):
//!
//! | selector | backing |
//! |---|---|
//! | `session_service: in_memory` | process-local map, lost on shutdown |
//! | `session_service: sqlite` | file-backed rusqlite store |
//! | `session_service: database` | SQL engine at `session_db_url` (`sqlite://` URLs) |
//!
//! Artifact and memory services follow the same pattern. Failures here are
//! [`TransportError`]s: they terminate the current run without producing
//! an event stream (the only error class that does).

use async_trait::async_trait;
use rusqlite::params;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::agentflow::workflow::{
    ArtifactServiceKind, MemoryServiceKind, RuntimeConfig, SessionServiceKind,
};

/// Session-service or artifact-store failure.
///
/// Surfaced to the caller as a run-level error; no partial run result is
/// returned when one of these occurs.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Session backend unavailable or misconfigured.
    Session(String),
    /// Artifact read/write failed.
    Artifact(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Session(msg) => write!(f, "session service error: {}", msg),
            TransportError::Artifact(msg) => write!(f, "artifact service error: {}", msg),
        }
    }
}

impl Error for TransportError {}

/// The shared, mutable key/value map of one invocation.
///
/// Cloning is cheap and shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state map from initial key/value pairs.
    pub fn with_initial(initial: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Read one key.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    /// Write one key.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    /// Apply an event's state delta.
    pub async fn apply_delta(&self, delta: &HashMap<String, Value>) {
        if delta.is_empty() {
            return;
        }
        let mut guard = self.inner.write().await;
        for (k, v) in delta {
            guard.insert(k.clone(), v.clone());
        }
    }

    /// Copy of the whole map.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.clone()
    }

    /// Copy of only the named keys (absent keys are skipped, not errors;
    /// consumers decide whether absence matters).
    pub async fn slice(&self, keys: &[String]) -> HashMap<String, Value> {
        let guard = self.inner.read().await;
        keys.iter()
            .filter_map(|k| guard.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Whether a key is present.
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.contains_key(key)
    }
}

/// A per-invocation state container with identity.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub state: SessionState,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, initial: HashMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            state: SessionState::with_initial(initial),
        }
    }
}

/// Storage abstraction for sessions.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Fetch an existing session, `None` when unknown.
    async fn get(&self, user_id: &str, session_id: &str) -> Result<Option<Session>, TransportError>;

    /// Create a session with the given initial state.
    async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        initial: HashMap<String, Value>,
    ) -> Result<Session, TransportError>;

    /// Persist the session's current state.
    async fn save(&self, session: &Session) -> Result<(), TransportError>;
}

/// Process-local session store. Sessions share live state handles, so a
/// reused session observes writes from the previous invocation.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: RwLock<HashMap<(String, String), Session>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn get(&self, user_id: &str, session_id: &str) -> Result<Option<Session>, TransportError> {
        let guard = self.sessions.read().await;
        Ok(guard
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        initial: HashMap<String, Value>,
    ) -> Result<Session, TransportError> {
        let session = Session::new(session_id, user_id, initial);
        self.sessions
            .write()
            .await
            .insert((user_id.to_string(), session_id.to_string()), session.clone());
        Ok(session)
    }

    async fn save(&self, _session: &Session) -> Result<(), TransportError> {
        // Live state handles make saving a no-op for the in-memory store.
        Ok(())
    }
}

/// File-backed session store (rusqlite). One process at a time; state is
/// stored as a JSON blob per `(user_id, session_id)`.
pub struct SqliteSessionService {
    path: PathBuf,
}

impl SqliteSessionService {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let service = Self { path: path.into() };
        let path = service.path.clone();
        // Create the schema eagerly so misconfiguration fails at build
        // time rather than mid-run.
        let conn = rusqlite::Connection::open(&path)
            .map_err(|e| TransportError::Session(format!("{}: {}", path.display(), e)))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                user_id    TEXT NOT NULL,
                session_id TEXT NOT NULL,
                state      TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, session_id)
            )",
            [],
        )
        .map_err(|e| TransportError::Session(e.to_string()))?;
        Ok(service)
    }

    fn open(&self) -> Result<rusqlite::Connection, TransportError> {
        rusqlite::Connection::open(&self.path)
            .map_err(|e| TransportError::Session(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl SessionService for SqliteSessionService {
    async fn get(&self, user_id: &str, session_id: &str) -> Result<Option<Session>, TransportError> {
        let conn = self.open()?;
        let user = user_id.to_string();
        let sid = session_id.to_string();
        let row = tokio::task::spawn_blocking(move || {
            conn.query_row(
                "SELECT state FROM sessions WHERE user_id = ?1 AND session_id = ?2",
                params![user, sid],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
        .map_err(|e| TransportError::Session(format!("join error: {}", e)))?
        .map_err(|e| TransportError::Session(e.to_string()))?;

        match row {
            None => Ok(None),
            Some(blob) => {
                let state: HashMap<String, Value> = serde_json::from_str(&blob)
                    .map_err(|e| TransportError::Session(format!("corrupt state blob: {}", e)))?;
                Ok(Some(Session::new(session_id, user_id, state)))
            }
        }
    }

    async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        initial: HashMap<String, Value>,
    ) -> Result<Session, TransportError> {
        let session = Session::new(session_id, user_id, initial);
        self.save(&session).await?;
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), TransportError> {
        let conn = self.open()?;
        let blob = serde_json::to_string(&session.state.snapshot().await)
            .map_err(|e| TransportError::Session(e.to_string()))?;
        let user = session.user_id.clone();
        let sid = session.id.clone();
        let now = chrono::Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (user_id, session_id, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user, sid, blob, now],
            )
        })
        .await
        .map_err(|e| TransportError::Session(format!("join error: {}", e)))?
        .map_err(|e| TransportError::Session(e.to_string()))?;
        Ok(())
    }
}

/// Default database file used when `session_db_path` is not configured.
const DEFAULT_SQLITE_PATH: &str = "agentflow_sessions.db";

/// Build the session service selected by the runtime configuration.
pub fn build_session_service(
    runtime: &RuntimeConfig,
) -> Result<Arc<dyn SessionService>, TransportError> {
    match runtime.session_service {
        SessionServiceKind::InMemory => Ok(Arc::new(InMemorySessionService::new())),
        SessionServiceKind::Sqlite => {
            let path = runtime
                .session_db_path
                .clone()
                .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string());
            Ok(Arc::new(SqliteSessionService::new(path)?))
        }
        SessionServiceKind::Database => {
            let url = runtime.session_db_url.as_deref().ok_or_else(|| {
                TransportError::Session(
                    "session_service 'database' requires session_db_url".to_string(),
                )
            })?;
            match url.strip_prefix("sqlite://") {
                Some(path) => Ok(Arc::new(SqliteSessionService::new(path)?)),
                None => Err(TransportError::Session(format!(
                    "unsupported session_db_url scheme in '{}' (expected sqlite://)",
                    url
                ))),
            }
        }
    }
}

/// Artifact storage abstraction.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn save(
        &self,
        session_id: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn load(&self, session_id: &str, name: &str) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Artifacts held in process memory.
#[derive(Default)]
pub struct InMemoryArtifactService {
    artifacts: RwLock<HashMap<(String, String), Vec<u8>>>,
}

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    async fn save(&self, session_id: &str, name: &str, data: &[u8]) -> Result<(), TransportError> {
        self.artifacts
            .write()
            .await
            .insert((session_id.to_string(), name.to_string()), data.to_vec());
        Ok(())
    }

    async fn load(&self, session_id: &str, name: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self
            .artifacts
            .read()
            .await
            .get(&(session_id.to_string(), name.to_string()))
            .cloned())
    }
}

/// Artifacts stored as files under `artifact_dir/<session_id>/<name>`.
pub struct FileArtifactService {
    root: PathBuf,
}

impl FileArtifactService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, session_id: &str, name: &str) -> Result<PathBuf, TransportError> {
        // Artifact names come from tools; refuse path traversal outright.
        if name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(TransportError::Artifact(format!(
                "artifact name '{}' contains path separators",
                name
            )));
        }
        Ok(self.root.join(session_id).join(name))
    }
}

#[async_trait]
impl ArtifactService for FileArtifactService {
    async fn save(&self, session_id: &str, name: &str, data: &[u8]) -> Result<(), TransportError> {
        let path = self.path_for(session_id, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::Artifact(e.to_string()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| TransportError::Artifact(format!("{}: {}", path.display(), e)))
    }

    async fn load(&self, session_id: &str, name: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let path = self.path_for(session_id, name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::Artifact(format!("{}: {}", path.display(), e))),
        }
    }
}

/// Build the artifact service, or `None` when the workflow opted out.
pub fn build_artifact_service(
    runtime: &RuntimeConfig,
    base_dir: &Path,
) -> Result<Option<Arc<dyn ArtifactService>>, TransportError> {
    match runtime.artifact_service {
        ArtifactServiceKind::None => Ok(None),
        ArtifactServiceKind::InMemory => Ok(Some(Arc::new(InMemoryArtifactService::default()))),
        ArtifactServiceKind::File => {
            let dir = runtime
                .artifact_dir
                .clone()
                .unwrap_or_else(|| "artifacts".to_string());
            Ok(Some(Arc::new(FileArtifactService::new(base_dir.join(dir)))))
        }
    }
}

/// Long-term memory abstraction (entries per user).
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn add(&self, user_id: &str, text: &str);
    async fn search(&self, user_id: &str, query: &str) -> Vec<String>;
}

/// Substring-matching in-process memory.
#[derive(Default)]
pub struct InMemoryMemoryService {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn add(&self, user_id: &str, text: &str) {
        self.entries
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert_with(Vec::new)
            .push(text.to_string());
    }

    async fn search(&self, user_id: &str, query: &str) -> Vec<String> {
        let needle = query.to_lowercase();
        self.entries
            .read()
            .await
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Build the memory service, or `None` when the workflow opted out.
pub fn build_memory_service(runtime: &RuntimeConfig) -> Option<Arc<dyn MemoryService>> {
    match runtime.memory_service {
        MemoryServiceKind::None => None,
        MemoryServiceKind::InMemory => Some(Arc::new(InMemoryMemoryService::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn state_slice_skips_absent_keys() {
        let state = SessionState::new();
        state.set("a", json!(1)).await;
        let slice = state
            .slice(&["a".to_string(), "missing".to_string()])
            .await;
        assert_eq!(slice.len(), 1);
        assert_eq!(slice["a"], json!(1));
    }

    #[tokio::test]
    async fn in_memory_sessions_share_live_state() {
        let service = InMemorySessionService::new();
        let created = service.create("u", "s", HashMap::new()).await.unwrap();
        created.state.set("k", json!("v")).await;

        let fetched = service.get("u", "s").await.unwrap().unwrap();
        assert_eq!(fetched.state.get("k").await, Some(json!("v")));
    }

    #[tokio::test]
    async fn sqlite_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.db");
        let service = SqliteSessionService::new(&path).unwrap();

        let mut initial = HashMap::new();
        initial.insert("seed".to_string(), json!(7));
        let session = service.create("u", "s1", initial).await.unwrap();
        session.state.set("extra", json!("x")).await;
        service.save(&session).await.unwrap();

        let loaded = service.get("u", "s1").await.unwrap().unwrap();
        assert_eq!(loaded.state.get("seed").await, Some(json!(7)));
        assert_eq!(loaded.state.get("extra").await, Some(json!("x")));
        assert!(service.get("u", "nope").await.unwrap().is_none());
    }

    #[test]
    fn database_url_requires_sqlite_scheme() {
        let mut runtime = RuntimeConfig::default();
        runtime.session_service = SessionServiceKind::Database;
        runtime.session_db_url = Some("postgres://db/sessions".to_string());
        assert!(build_session_service(&runtime).is_err());
    }

    #[tokio::test]
    async fn file_artifacts_reject_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let service = FileArtifactService::new(tmp.path());
        assert!(service.save("s", "../escape", b"x").await.is_err());
        service.save("s", "report.txt", b"ok").await.unwrap();
        assert_eq!(
            service.load("s", "report.txt").await.unwrap(),
            Some(b"ok".to_vec())
        );
    }
}
