use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::Level;

use tiller_observability::{emit_event, RunEvent};
use tiller_types::{Session, SessionSummary};

const DEBOUNCE: Duration = Duration::from_millis(200);

type SessionKey = (String, String);

struct StoreInner {
    base: PathBuf,
    debounce: Duration,
    // Std mutexes: staging must be synchronous so a debounced save is
    // ordered against an immediate save issued right after it. No
    // await happens while these are held.
    sessions: Mutex<HashMap<SessionKey, Session>>,
    loaded_workspaces: Mutex<HashSet<String>>,
    /// Bumped on every save for a key; a delayed debounced flush that
    /// observes a newer generation skips its write, which is how an
    /// immediate write supersedes an in-flight debounced one.
    generations: Mutex<HashMap<SessionKey, u64>>,
    /// Serializes file writes so persistence lands in issue order.
    flush_lock: AsyncMutex<()>,
}

/// Durable, per-workspace session persistence: JSON files under
/// `<base>/<workspace_id>/<session_id>.json` fronted by an in-memory
/// map. Two write paths by design: `save` debounces and coalesces the
/// high-frequency updates, `save_immediate` is awaited at risk points
/// (awaiting approval, completion, error).
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self::with_debounce(base, DEBOUNCE)
    }

    pub fn with_debounce(base: impl AsRef<Path>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                base: base.as_ref().to_path_buf(),
                debounce,
                sessions: Mutex::new(HashMap::new()),
                loaded_workspaces: Mutex::new(HashSet::new()),
                generations: Mutex::new(HashMap::new()),
                flush_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Debounced write: the snapshot is visible to readers right away,
    /// the file write lands after the debounce window unless a newer
    /// save for the same session supersedes it. Fire-and-forget;
    /// failures are logged, never surfaced to the run.
    pub fn save(&self, session: Session) {
        let key = (session.workspace_id.clone(), session.id.clone());
        let generation = self.stage(&key, session);
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(store.inner.debounce).await;
            if store.generation(&key) != generation {
                return;
            }
            if let Err(err) = store.flush(&key).await {
                warn_save_failed(&key, "debounced", &err);
            }
        });
    }

    /// Awaited write that supersedes any in-flight debounced write for
    /// the same session.
    pub async fn save_immediate(&self, session: Session) -> anyhow::Result<()> {
        let key = (session.workspace_id.clone(), session.id.clone());
        self.stage(&key, session);
        self.flush(&key).await
    }

    pub async fn load(&self, workspace_id: &str, session_id: &str) -> Option<Session> {
        self.ensure_loaded(workspace_id).await;
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .get(&key_of(workspace_id, session_id))
            .cloned()
    }

    /// Newest-first summaries for the history UI.
    pub async fn list_sessions(&self, workspace_id: &str) -> Vec<SessionSummary> {
        self.ensure_loaded(workspace_id).await;
        let mut summaries: Vec<SessionSummary> = self
            .inner
            .sessions
            .lock()
            .expect("sessions lock")
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .map(Session::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    pub async fn delete(&self, workspace_id: &str, session_id: &str) -> bool {
        self.ensure_loaded(workspace_id).await;
        let key = key_of(workspace_id, session_id);
        let removed = self
            .inner
            .sessions
            .lock()
            .expect("sessions lock")
            .remove(&key)
            .is_some();
        self.inner
            .generations
            .lock()
            .expect("generations lock")
            .remove(&key);
        let path = self.session_path(&key);
        if let Err(err) = fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn_save_failed(&key, "delete", &err.into());
            }
        }
        removed
    }

    pub async fn clear_all(&self, workspace_id: &str) {
        self.ensure_loaded(workspace_id).await;
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .retain(|(ws, _), _| ws != workspace_id);
        self.inner
            .generations
            .lock()
            .expect("generations lock")
            .retain(|(ws, _), _| ws != workspace_id);
        let dir = self.inner.base.join(workspace_id);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(workspace_id, error = %err, "failed to clear session directory");
            }
        }
    }

    /// The most recently updated non-terminal, non-dismissed session
    /// for a workspace, if any. Surfaced on workspace load so the
    /// caller can offer resume-or-discard.
    pub async fn find_restorable(&self, workspace_id: &str) -> Option<Session> {
        self.ensure_loaded(workspace_id).await;
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .values()
            .filter(|s| s.workspace_id == workspace_id && s.is_restorable())
            .max_by_key(|s| s.updated_at)
            .cloned()
    }

    /// Marks a restorable session as declined. Status is untouched;
    /// the session simply stops being offered.
    pub async fn dismiss(&self, workspace_id: &str, session_id: &str) -> anyhow::Result<()> {
        self.ensure_loaded(workspace_id).await;
        let key = key_of(workspace_id, session_id);
        let staged = {
            let mut sessions = self.inner.sessions.lock().expect("sessions lock");
            let Some(session) = sessions.get_mut(&key) else {
                return Ok(());
            };
            session.dismissed = true;
            session.clone()
        };
        self.save_immediate(staged).await
    }

    fn stage(&self, key: &SessionKey, session: Session) -> u64 {
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .insert(key.clone(), session);
        let mut generations = self.inner.generations.lock().expect("generations lock");
        let slot = generations.entry(key.clone()).or_insert(0);
        *slot += 1;
        *slot
    }

    fn generation(&self, key: &SessionKey) -> u64 {
        self.inner
            .generations
            .lock()
            .expect("generations lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    async fn flush(&self, key: &SessionKey) -> anyhow::Result<()> {
        let _guard = self.inner.flush_lock.lock().await;
        // Deleted between stage and flush: nothing to write.
        let snapshot = self
            .inner
            .sessions
            .lock()
            .expect("sessions lock")
            .get(key)
            .cloned();
        let Some(session) = snapshot else {
            return Ok(());
        };
        let path = self.session_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(&session)?;
        fs::write(&path, raw).await?;
        Ok(())
    }

    async fn ensure_loaded(&self, workspace_id: &str) {
        if self
            .inner
            .loaded_workspaces
            .lock()
            .expect("loaded lock")
            .contains(workspace_id)
        {
            return;
        }
        let dir = self.inner.base.join(workspace_id);
        let mut from_disk: Vec<Session> = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                match fs::read_to_string(&path).await {
                    Ok(raw) => match serde_json::from_str::<Session>(&raw) {
                        Ok(session) => from_disk.push(session),
                        Err(err) => {
                            tracing::warn!(path = %path.display(), error = %err, "skipping unreadable session file")
                        }
                    },
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable session file")
                    }
                }
            }
        }
        let mut sessions = self.inner.sessions.lock().expect("sessions lock");
        for session in from_disk {
            let key = (session.workspace_id.clone(), session.id.clone());
            // In-memory state is always at least as new as the file.
            sessions.entry(key).or_insert(session);
        }
        drop(sessions);
        self.inner
            .loaded_workspaces
            .lock()
            .expect("loaded lock")
            .insert(workspace_id.to_string());
    }

    fn session_path(&self, key: &SessionKey) -> PathBuf {
        self.inner.base.join(&key.0).join(format!("{}.json", key.1))
    }
}

fn key_of(workspace_id: &str, session_id: &str) -> SessionKey {
    (workspace_id.to_string(), session_id.to_string())
}

fn warn_save_failed(key: &SessionKey, path_kind: &str, err: &anyhow::Error) {
    let detail = err.to_string();
    emit_event(
        Level::WARN,
        RunEvent {
            event: "session.save.failed",
            component: "session_store",
            workspace_id: Some(&key.0),
            session_id: Some(&key.1),
            step: None,
            tool: None,
            status: Some(path_kind),
            detail: Some(&detail),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_types::{Message, MessageRole, SessionStatus};

    fn temp_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::with_debounce(dir.path(), Duration::from_millis(20));
        (dir, store)
    }

    #[tokio::test]
    async fn immediate_save_round_trips_through_load() {
        let (_dir, store) = temp_store();
        let mut session = Session::new("ws-1", "refactor the parser");
        session.current_step = 3;
        session
            .messages
            .push(Message::new(MessageRole::Assistant, "working on it"));
        store
            .save_immediate(session.clone())
            .await
            .expect("save_immediate");

        let loaded = store.load("ws-1", &session.id).await.expect("loaded");
        assert_eq!(loaded.status, session.status);
        assert_eq!(loaded.current_step, 3);
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].content, "working on it");
    }

    #[tokio::test]
    async fn debounced_saves_coalesce_to_the_last_value() {
        let (dir, store) = temp_store();
        let mut session = Session::new("ws-1", "task");
        let id = session.id.clone();
        for step in 1..=5 {
            session.current_step = step;
            store.save(session.clone());
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let fresh = SessionStore::new(dir.path());
        let loaded = fresh.load("ws-1", &id).await.expect("persisted");
        assert_eq!(loaded.current_step, 5);
    }

    #[tokio::test]
    async fn immediate_write_supersedes_inflight_debounced_write() {
        let (dir, store) = temp_store();
        let mut session = Session::new("ws-1", "task");
        let id = session.id.clone();

        session.status = SessionStatus::Running;
        store.save(session.clone());
        session.status = SessionStatus::Complete;
        store
            .save_immediate(session.clone())
            .await
            .expect("immediate");
        // Let the stale debounced flush fire; it must not overwrite.
        tokio::time::sleep(Duration::from_millis(120)).await;

        let fresh = SessionStore::new(dir.path());
        let loaded = fresh.load("ws-1", &id).await.expect("persisted");
        assert_eq!(loaded.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn find_restorable_surfaces_non_terminal_sessions_across_restart() {
        let (dir, store) = temp_store();
        let mut waiting = Session::new("ws-1", "gated task");
        waiting.status = SessionStatus::WaitingApproval;
        store
            .save_immediate(waiting.clone())
            .await
            .expect("save waiting");
        let mut done = Session::new("ws-1", "finished task");
        done.status = SessionStatus::Complete;
        store.save_immediate(done).await.expect("save done");

        // Simulated restart: a new store over the same base dir.
        let fresh = SessionStore::new(dir.path());
        let restorable = fresh.find_restorable("ws-1").await.expect("restorable");
        assert_eq!(restorable.id, waiting.id);
        assert_eq!(restorable.status, SessionStatus::WaitingApproval);
    }

    #[tokio::test]
    async fn dismissed_sessions_are_not_offered_but_keep_their_status() {
        let (dir, store) = temp_store();
        let mut session = Session::new("ws-1", "task");
        session.status = SessionStatus::WaitingApproval;
        store.save_immediate(session.clone()).await.expect("save");
        store.dismiss("ws-1", &session.id).await.expect("dismiss");

        assert!(store.find_restorable("ws-1").await.is_none());
        let fresh = SessionStore::new(dir.path());
        let loaded = fresh.load("ws-1", &session.id).await.expect("loaded");
        assert_eq!(loaded.status, SessionStatus::WaitingApproval);
        assert!(loaded.dismissed);
    }

    #[tokio::test]
    async fn diffs_persisted_without_hunks_restore_as_metadata_only() {
        let (dir, store) = temp_store();
        let mut session = Session::new("ws-1", "task");
        session.diffs.push(tiller_types::FileDiff {
            old_path: "src/lib.rs".to_string(),
            new_path: "src/lib.rs".to_string(),
            is_new: false,
            is_deleted: false,
            // Hunk content deliberately not persisted to save storage.
            hunks: Vec::new(),
        });
        store.save_immediate(session.clone()).await.expect("save");

        let fresh = SessionStore::new(dir.path());
        let loaded = fresh.load("ws-1", &session.id).await.expect("loaded");
        assert_eq!(loaded.diffs.len(), 1);
        assert!(loaded.diffs[0].is_metadata_only());
    }

    #[tokio::test]
    async fn list_sessions_is_scoped_and_newest_first() {
        let (_dir, store) = temp_store();
        let a = Session::new("ws-1", "first");
        store.save_immediate(a.clone()).await.expect("a");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = Session::new("ws-1", "second");
        store.save_immediate(b.clone()).await.expect("b");
        store
            .save_immediate(Session::new("ws-2", "elsewhere"))
            .await
            .expect("other ws");

        let summaries = store.list_sessions("ws-1").await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, b.id);
        assert_eq!(summaries[1].id, a.id);
    }

    #[tokio::test]
    async fn delete_and_clear_all_remove_sessions() {
        let (dir, store) = temp_store();
        let session = Session::new("ws-1", "task");
        store.save_immediate(session.clone()).await.expect("save");
        assert!(store.delete("ws-1", &session.id).await);
        assert!(store.load("ws-1", &session.id).await.is_none());

        store
            .save_immediate(Session::new("ws-1", "another"))
            .await
            .expect("save");
        store.clear_all("ws-1").await;
        assert!(store.list_sessions("ws-1").await.is_empty());
        assert!(!dir.path().join("ws-1").exists());
    }
}
