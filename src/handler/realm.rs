//! Registry of script realms. Realms are keyed by their CDP unique id and
//! carry id links to their browsing contexts; storage stays the source of
//! truth for both directions.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::bidi::script::{RealmInfo, RealmType};
use crate::cdp::SessionId;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Realm {
    pub id: String,
    pub kind: RealmType,
    pub origin: String,
    pub execution_context_id: i64,
    pub session_id: SessionId,
    /// Browsing contexts this realm is associated with; empty for worker
    /// realms.
    pub context_ids: Vec<String>,
    pub sandbox: Option<String>,
    /// Internal realms (utility worlds and the like) never show up in
    /// listings.
    pub hidden: bool,
    /// Object handles produced by this realm, released when it goes away.
    pub handles: Vec<String>,
}

impl Realm {
    /// Whether the realm may appear in `script.getRealms` results and realm
    /// lifecycle events.
    pub fn is_exposed(&self) -> bool {
        !self.hidden && self.sandbox.as_deref() != Some("")
    }

    pub fn info(&self) -> RealmInfo {
        RealmInfo {
            realm: self.id.clone(),
            origin: self.origin.clone(),
            kind: self.kind,
            context: self.context_ids.first().cloned(),
            sandbox: self.sandbox.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RealmStorage {
    inner: Arc<Mutex<HashMap<String, Realm>>>,
}

impl RealmStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, realm: Realm) {
        self.lock().insert(realm.id.clone(), realm);
    }

    pub fn find(&self, id: &str) -> Option<Realm> {
        self.lock().get(id).cloned()
    }

    pub fn get(&self, id: &str) -> Result<Realm> {
        self.find(id)
            .ok_or_else(|| Error::NoSuchFrame(format!("no such realm: {id}")))
    }

    pub fn find_by_execution_context(
        &self,
        session_id: &SessionId,
        execution_context_id: i64,
    ) -> Option<Realm> {
        self.lock()
            .values()
            .find(|r| r.session_id == *session_id && r.execution_context_id == execution_context_id)
            .cloned()
    }

    /// The realm evaluations target for a context: the default (sandbox-less)
    /// window realm, or the named sandbox.
    pub fn find_for_context(&self, context_id: &str, sandbox: Option<&str>) -> Result<Realm> {
        self.lock()
            .values()
            .find(|r| {
                r.context_ids.iter().any(|c| c == context_id)
                    && r.sandbox.as_deref() == sandbox
                    && matches!(r.kind, RealmType::Window)
            })
            .cloned()
            .ok_or_else(|| {
                Error::NoSuchFrame(format!("no realm for context {context_id}"))
            })
    }

    pub fn remove(&self, id: &str) -> Option<Realm> {
        self.lock().remove(id)
    }

    pub fn remove_by_execution_context(
        &self,
        session_id: &SessionId,
        execution_context_id: i64,
    ) -> Option<Realm> {
        let mut inner = self.lock();
        let id = inner
            .values()
            .find(|r| r.session_id == *session_id && r.execution_context_id == execution_context_id)
            .map(|r| r.id.clone())?;
        inner.remove(&id)
    }

    /// Drop every realm living on a session; used when a target detaches or
    /// a context subtree is disposed.
    pub fn remove_by_session(&self, session_id: &SessionId) -> Vec<Realm> {
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .values()
            .filter(|r| r.session_id == *session_id)
            .map(|r| r.id.clone())
            .collect();
        ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
    }

    pub fn remove_by_context(&self, context_id: &str) -> Vec<Realm> {
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .values()
            .filter(|r| r.context_ids.iter().any(|c| c == context_id))
            .map(|r| r.id.clone())
            .collect();
        ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
    }

    pub fn add_handle(&self, realm_id: &str, handle: impl Into<String>) {
        if let Some(realm) = self.lock().get_mut(realm_id) {
            realm.handles.push(handle.into());
        }
    }

    pub fn remove_handle(&self, realm_id: &str, handle: &str) {
        if let Some(realm) = self.lock().get_mut(realm_id) {
            realm.handles.retain(|h| h != handle);
        }
    }

    /// Exposed realms matching the filter, for `script.getRealms`.
    pub fn list(&self, context_id: Option<&str>, kind: Option<RealmType>) -> Vec<RealmInfo> {
        let mut realms: Vec<RealmInfo> = self
            .lock()
            .values()
            .filter(|r| r.is_exposed())
            .filter(|r| context_id.map_or(true, |c| r.context_ids.iter().any(|rc| rc == c)))
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .map(Realm::info)
            .collect();
        realms.sort_by(|a, b| a.realm.cmp(&b.realm));
        realms
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Realm>> {
        self.inner.lock().expect("realm storage poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm(id: &str, session: &str, context: Option<&str>, sandbox: Option<&str>) -> Realm {
        Realm {
            id: id.to_string(),
            kind: RealmType::Window,
            origin: "https://example.com".to_string(),
            execution_context_id: 1,
            session_id: SessionId::new(session),
            context_ids: context.map(|c| vec![c.to_string()]).unwrap_or_default(),
            sandbox: sandbox.map(str::to_string),
            hidden: false,
            handles: Vec::new(),
        }
    }

    #[test]
    fn hidden_and_empty_sandbox_realms_stay_out_of_listings() {
        let storage = RealmStorage::new();
        storage.add(realm("visible", "s1", Some("ctx"), None));
        storage.add(realm("empty-sandbox", "s1", Some("ctx"), Some("")));
        let mut hidden = realm("hidden", "s1", Some("ctx"), None);
        hidden.hidden = true;
        storage.add(hidden);

        let listed = storage.list(Some("ctx"), None);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].realm, "visible");
    }

    #[test]
    fn context_lookup_prefers_matching_sandbox() {
        let storage = RealmStorage::new();
        storage.add(realm("default", "s1", Some("ctx"), None));
        storage.add(realm("boxed", "s1", Some("ctx"), Some("sb")));

        assert_eq!(storage.find_for_context("ctx", None).unwrap().id, "default");
        assert_eq!(
            storage.find_for_context("ctx", Some("sb")).unwrap().id,
            "boxed"
        );
        assert_eq!(
            storage.find_for_context("other", None).unwrap_err().code(),
            "no such frame"
        );
    }

    #[test]
    fn session_removal_sweeps_realms() {
        let storage = RealmStorage::new();
        storage.add(realm("a", "s1", Some("ctx"), None));
        storage.add(realm("b", "s1", None, None));
        storage.add(realm("c", "s2", None, None));

        let removed = storage.remove_by_session(&SessionId::new("s1"));
        assert_eq!(removed.len(), 2);
        assert!(storage.find("c").is_some());
        assert!(storage.find("a").is_none());
    }
}
