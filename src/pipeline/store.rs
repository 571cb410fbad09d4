//! In-process session storage.

use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::hub::SessionDirectory;
use crate::pipeline::session::{Session, SessionStatus, SimulationQuery};
use crate::utils::JsonMap;

/// Map of live sessions behind a single lock.
///
/// Reads clone the session out; writers swap whole sessions back in.
/// There is no persistence — state lives and dies with the process.
pub struct SessionStore {
    sessions: RwLock<FxHashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
        }
    }

    /// Create a READY session for the query.
    pub fn create(&self, query: SimulationQuery, user_id: Option<&str>) -> Session {
        let id = Uuid::new_v4().to_string();
        let run_id = format!("run_{}_{}", Utc::now().timestamp(), &id[..8]);
        let session = Session {
            id: id.clone(),
            run_id,
            created_at: Utc::now(),
            user_id: user_id.map(str::to_string),
            status: SessionStatus::Ready,
            current_stage: 0,
            query,
            stages: Vec::new(),
            state: JsonMap::new(),
            final_output: None,
            annotations: JsonMap::new(),
        };
        self.sessions.write().insert(id, session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Overwrite a stored session.
    ///
    /// Rejected once the stored copy is terminal; terminal sessions only
    /// change through [`annotate`](Self::annotate).
    pub fn update(&self, session: Session) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.id) {
            Some(existing) if existing.is_terminal() => false,
            Some(_) => {
                sessions.insert(session.id.clone(), session);
                true
            }
            None => false,
        }
    }

    /// Attach a post-hoc note; allowed at any lifecycle point.
    pub fn annotate(&self, session_id: &str, key: &str, value: Value) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.annotations.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionDirectory for SessionStore {
    fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_get_list_delete_round_trip() {
        let store = SessionStore::new();
        let a = store.create(SimulationQuery::new("first"), Some("user-1"));
        let b = store.create(SimulationQuery::new("second"), None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a.id).unwrap().query.query, "first");
        assert_eq!(store.list().len(), 2);
        assert!(store.delete(&b.id));
        assert!(store.get(&b.id).is_none());
        assert!(!store.delete(&b.id));
    }

    #[test]
    fn run_ids_embed_the_session_prefix() {
        let store = SessionStore::new();
        let session = store.create(SimulationQuery::new("q"), None);
        assert!(session.run_id.starts_with("run_"));
        assert!(session.run_id.ends_with(&session.id[..8]));
    }

    #[test]
    fn terminal_sessions_reject_updates_but_accept_annotations() {
        let store = SessionStore::new();
        let mut session = store.create(SimulationQuery::new("q"), None);
        session.status = SessionStatus::Completed;
        assert!(store.update(session.clone()));

        session.status = SessionStatus::Running;
        assert!(!store.update(session.clone()), "terminal sessions are frozen");
        assert!(store.annotate(&session.id, "reviewed_by", json!("operator")));
        let stored = store.get(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.annotations["reviewed_by"], "operator");
    }

    #[test]
    fn directory_reports_existing_sessions() {
        let store = SessionStore::new();
        let session = store.create(SimulationQuery::new("q"), None);
        assert!(store.session_exists(&session.id));
        assert!(!store.session_exists("ghost"));
    }
}
