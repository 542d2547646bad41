use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use concierge_observability::short_hash;
use concierge_types::Session;

/// Opaque persistence boundary for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> anyhow::Result<Option<Session>>;
    async fn save(&self, session: &Session) -> anyhow::Result<()>;
    /// Returns whether a session was removed.
    async fn remove(&self, id: &str) -> anyhow::Result<bool>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }
}

/// One pretty-printed JSON file per session under `base`.
#[derive(Clone)]
pub struct FileSessionStore {
    base: PathBuf,
}

impl FileSessionStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("creating session dir {}", base.display()))?;
        Ok(Self { base })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.base.join(format!("{}.json", file_stem(id)))
    }
}

/// Filesystem-safe stem for a session id. Ids that needed rewriting get a
/// hash suffix so two different ids never share a file.
fn file_stem(id: &str) -> String {
    let safe = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(96)
        .collect::<String>();
    if safe == id && !safe.is_empty() {
        safe
    } else {
        format!("{}-{}", safe, short_hash(id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading session {}", path.display()))?;
        let session = serde_json::from_str::<Session>(&raw)
            .with_context(|| format!("parsing session {}", path.display()))?;
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        let path = self.path_for(&session.id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(session)?;
        fs::write(&tmp, payload)
            .await
            .with_context(|| format!("writing session {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing session {}", path.display()))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .await
            .with_context(|| format!("removing session {}", path.display()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_types::{ActiveTask, FieldMap, FieldValue, Preferences};

    fn sample(id: &str) -> Session {
        let mut session = Session::new(id, Preferences::default());
        let mut fields = FieldMap::new();
        fields.insert("title".to_string(), FieldValue::raw("dentist"));
        session.current = Some(ActiveTask::new("calendar_create", fields));
        session
    }

    #[tokio::test]
    async fn memory_store_round_trips_and_removes() {
        let store = InMemorySessionStore::new();
        assert!(store.load("a").await.expect("load").is_none());
        store.save(&sample("a")).await.expect("save");
        assert_eq!(store.len().await, 1);
        let loaded = store.load("a").await.expect("load").expect("session");
        assert_eq!(loaded.current.map(|t| t.tool), Some("calendar_create".to_string()));
        assert!(store.remove("a").await.expect("remove"));
        assert!(!store.remove("a").await.expect("remove"));
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = sample("kitchen-speaker");
        FileSessionStore::new(dir.path())
            .await
            .expect("store")
            .save(&session)
            .await
            .expect("save");

        let reopened = FileSessionStore::new(dir.path()).await.expect("store");
        let loaded = reopened
            .load("kitchen-speaker")
            .await
            .expect("load")
            .expect("session");
        assert_eq!(loaded, session);
        assert!(dir.path().join("kitchen-speaker.json").exists());
        assert!(reopened.remove("kitchen-speaker").await.expect("remove"));
        assert!(reopened.load("kitchen-speaker").await.expect("load").is_none());
    }

    #[test]
    fn unsafe_ids_get_distinct_stems() {
        assert_eq!(file_stem("abc_1"), "abc_1");
        let a = file_stem("../etc/passwd");
        let b = file_stem("__etc_passwd");
        assert!(!a.contains('/'));
        assert!(a.starts_with("___etc_passwd-"));
        assert_ne!(a, b);
        assert!(file_stem("").starts_with('-'));
    }

    #[test]
    fn rewritten_stems_are_pinned() {
        assert_eq!(file_stem("../etc/passwd"), "___etc_passwd-7fef78f53440346c");
        assert_eq!(file_stem("kitchen speaker"), "kitchen_speaker-01f75f09f1157757");
    }
}
