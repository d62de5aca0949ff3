//! Registry of browsing contexts. The tree is stored as id links, never
//! pointers: parents and children reference each other through the storage,
//! which stays the single source of truth.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::bidi::browsing_context::Info;
use crate::cdp::SessionId;
use crate::error::{Error, Result};
use crate::handler::cdp_target::CdpTarget;
use crate::handler::navigation::NavigationTracker;

/// URL reported for a context before CDP tells us anything better.
pub const ABOUT_BLANK: &str = "about:blank";

/// One frame or top-level document.
#[derive(Debug, Clone)]
pub struct BrowsingContext {
    pub id: String,
    pub parent: Option<String>,
    pub user_context: String,
    pub url: String,
    pub children: Vec<String>,
    pub cdp_target: CdpTarget,
    pub navigation: NavigationTracker,
}

impl BrowsingContext {
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowsingContextStorage {
    inner: Arc<Mutex<HashMap<String, BrowsingContext>>>,
}

impl BrowsingContextStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context and link it into its parent's child list.
    pub fn add(&self, context: BrowsingContext) {
        let mut inner = self.inner.lock().expect("context storage poisoned");
        if let Some(parent_id) = context.parent.clone() {
            if let Some(parent) = inner.get_mut(&parent_id) {
                if !parent.children.contains(&context.id) {
                    parent.children.push(context.id.clone());
                }
            }
        }
        inner.insert(context.id.clone(), context);
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("context storage poisoned")
            .contains_key(id)
    }

    pub fn find(&self, id: &str) -> Option<BrowsingContext> {
        self.inner
            .lock()
            .expect("context storage poisoned")
            .get(id)
            .cloned()
    }

    pub fn get(&self, id: &str) -> Result<BrowsingContext> {
        self.find(id)
            .ok_or_else(|| Error::NoSuchFrame(format!("no such context: {id}")))
    }

    pub fn all(&self) -> Vec<BrowsingContext> {
        self.inner
            .lock()
            .expect("context storage poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn top_level(&self) -> Vec<BrowsingContext> {
        let mut contexts: Vec<_> = self
            .inner
            .lock()
            .expect("context storage poisoned")
            .values()
            .filter(|c| c.is_top_level())
            .cloned()
            .collect();
        contexts.sort_by(|a, b| a.id.cmp(&b.id));
        contexts
    }

    /// Walk to the top-level ancestor. The walk terminates because parents
    /// were registered before their children and a context never descends
    /// from itself.
    pub fn top_level_id(&self, id: &str) -> Result<String> {
        let inner = self.inner.lock().expect("context storage poisoned");
        let mut current = inner
            .get(id)
            .ok_or_else(|| Error::NoSuchFrame(format!("no such context: {id}")))?;
        while let Some(parent_id) = &current.parent {
            match inner.get(parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(current.id.clone())
    }

    /// The context whose target owns the given CDP session, if any. A
    /// target's root frame (context id == target id) wins over nested
    /// frames sharing the session.
    pub fn find_by_session(&self, session_id: &SessionId) -> Option<BrowsingContext> {
        let inner = self.inner.lock().expect("context storage poisoned");
        let mut fallback = None;
        for context in inner.values() {
            if context.cdp_target.session_id() != session_id {
                continue;
            }
            if context.cdp_target.target_id().inner() == context.id {
                return Some(context.clone());
            }
            if fallback.is_none() {
                fallback = Some(context.clone());
            }
        }
        fallback
    }

    /// All contexts owned by the session whose parent is not itself owned
    /// by that session; the roots to dispose when the target detaches.
    pub fn session_roots(&self, session_id: &SessionId) -> Vec<String> {
        let inner = self.inner.lock().expect("context storage poisoned");
        let mut roots: Vec<String> = inner
            .values()
            .filter(|c| c.cdp_target.session_id() == session_id)
            .filter(|c| match &c.parent {
                Some(parent) => inner
                    .get(parent)
                    .map_or(true, |p| p.cdp_target.session_id() != session_id),
                None => true,
            })
            .map(|c| c.id.clone())
            .collect();
        roots.sort();
        roots
    }

    pub fn update_url(&self, id: &str, url: impl Into<String>) {
        let mut inner = self.inner.lock().expect("context storage poisoned");
        if let Some(context) = inner.get_mut(id) {
            context.url = url.into();
        }
    }

    /// Swap the owning target of a context (OOPIF re-parenting keeps the
    /// context alive while the backing target changes).
    pub fn replace_target(&self, id: &str, target: CdpTarget) {
        let mut inner = self.inner.lock().expect("context storage poisoned");
        if let Some(context) = inner.get_mut(id) {
            context.cdp_target = target;
        }
    }

    /// Drop every child of the context, depth-first, returning the removed
    /// contexts deepest-first. Used when a frame navigates cross-document
    /// and its subtree is replaced.
    pub fn clear_children(&self, id: &str) -> Vec<BrowsingContext> {
        let mut inner = self.inner.lock().expect("context storage poisoned");
        let children = match inner.get_mut(id) {
            Some(context) => std::mem::take(&mut context.children),
            None => return Vec::new(),
        };
        let mut removed = Vec::new();
        for child in children {
            remove_recursively(&mut inner, &child, &mut removed);
        }
        removed
    }

    /// Delete a context and all descendants, returning the removed contexts
    /// deepest-first (the root last) so callers can emit one
    /// `contextDestroyed` per node in that order.
    pub fn delete_subtree(&self, id: &str) -> Vec<BrowsingContext> {
        let mut inner = self.inner.lock().expect("context storage poisoned");
        let mut removed = Vec::new();
        // unlink from the parent first
        if let Some(parent_id) = inner.get(id).and_then(|c| c.parent.clone()) {
            if let Some(parent) = inner.get_mut(&parent_id) {
                parent.children.retain(|child| child != id);
            }
        }
        remove_recursively(&mut inner, id, &mut removed);
        removed
    }

    /// The serializable context tree rooted at `root` (all top-level
    /// contexts when absent), cut off below `max_depth`.
    pub fn get_tree(&self, max_depth: Option<u64>, root: Option<&str>) -> Result<Vec<Info>> {
        let inner = self.inner.lock().expect("context storage poisoned");
        let roots: Vec<&BrowsingContext> = match root {
            Some(id) => vec![inner
                .get(id)
                .ok_or_else(|| Error::NoSuchFrame(format!("no such context: {id}")))?],
            None => {
                let mut tops: Vec<_> = inner.values().filter(|c| c.is_top_level()).collect();
                tops.sort_by(|a, b| a.id.cmp(&b.id));
                tops
            }
        };
        Ok(roots
            .into_iter()
            .map(|context| build_info(&inner, context, max_depth))
            .collect())
    }
}

fn build_info(
    inner: &HashMap<String, BrowsingContext>,
    context: &BrowsingContext,
    depth: Option<u64>,
) -> Info {
    let children = match depth {
        Some(0) => None,
        _ => Some(
            context
                .children
                .iter()
                .filter_map(|id| inner.get(id))
                .map(|child| build_info(inner, child, depth.map(|d| d - 1)))
                .collect(),
        ),
    };
    Info {
        context: context.id.clone(),
        url: context.url.clone(),
        user_context: context.user_context.clone(),
        parent: context.parent.clone(),
        children,
    }
}

fn remove_recursively(
    inner: &mut HashMap<String, BrowsingContext>,
    id: &str,
    removed: &mut Vec<BrowsingContext>,
) {
    if let Some(context) = inner.remove(id) {
        for child in &context.children {
            remove_recursively(inner, child, removed);
        }
        removed.push(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::make_context;

    #[test]
    fn top_level_walk_terminates_at_root() {
        let storage = BrowsingContextStorage::new();
        storage.add(make_context("top", None));
        storage.add(make_context("child", Some("top")));
        storage.add(make_context("grandchild", Some("child")));

        assert_eq!(storage.top_level_id("grandchild").unwrap(), "top");
        assert_eq!(storage.top_level_id("top").unwrap(), "top");
        assert!(storage.find("top").unwrap().is_top_level());
        assert!(!storage.find("child").unwrap().is_top_level());
    }

    #[test]
    fn delete_subtree_removes_descendants_deepest_first() {
        let storage = BrowsingContextStorage::new();
        storage.add(make_context("top", None));
        storage.add(make_context("a", Some("top")));
        storage.add(make_context("b", Some("a")));
        storage.add(make_context("c", Some("top")));

        let removed = storage.delete_subtree("top");
        let ids: Vec<_> = removed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(removed.len(), 4);
        // every node removed exactly once, root last
        assert_eq!(*ids.last().unwrap(), "top");
        assert!(ids.iter().position(|i| *i == "b") < ids.iter().position(|i| *i == "a"));
        assert!(!storage.has("c"));
        assert!(storage.all().is_empty());
    }

    #[test]
    fn deleting_child_unlinks_parent() {
        let storage = BrowsingContextStorage::new();
        storage.add(make_context("top", None));
        storage.add(make_context("child", Some("top")));
        storage.delete_subtree("child");
        assert!(storage.find("top").unwrap().children.is_empty());
    }

    #[test]
    fn tree_depth_cutoff() {
        let storage = BrowsingContextStorage::new();
        storage.add(make_context("top", None));
        storage.add(make_context("child", Some("top")));

        let tree = storage.get_tree(Some(0), None).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_none());

        let tree = storage.get_tree(None, Some("top")).unwrap();
        let children = tree[0].children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].context, "child");
    }

    #[test]
    fn unknown_context_is_no_such_frame() {
        let storage = BrowsingContextStorage::new();
        assert_eq!(storage.get("nope").unwrap_err().code(), "no such frame");
    }
}
