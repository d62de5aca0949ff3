//! Auto-attach orchestration: routes every `Target.attachedToTarget` to the
//! right shape of bookkeeping (page context, OOPIF re-parent, worker realm,
//! tab passthrough), drives target unblocking, and owns the realm side of
//! the Runtime events.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::bidi;
use crate::bidi::browsing_context::Info;
use crate::bidi::script::RealmType;
use crate::cdp::events::{
    EventAttachedToTarget, EventDetachedFromTarget, EventExecutionContextCreated,
    EventExecutionContextDestroyed, EventFrameAttached, EventTargetInfoChanged,
};
use crate::cdp::{CdpSession, SessionId};
use crate::error::Error;
use crate::handler::cdp_target::CdpTarget;
use crate::handler::context::{BrowsingContext, BrowsingContextStorage, ABOUT_BLANK};
use crate::handler::event_manager::EventManager;
use crate::handler::input::InputStateManager;
use crate::handler::navigation::NavigationTracker;
use crate::handler::network::NetworkStorage;
use crate::handler::preload::PreloadScriptStorage;
use crate::handler::realm::{Realm, RealmStorage};
use crate::handler::MapperConfig;

#[derive(Debug, Clone)]
struct WorkerSession {
    kind: RealmType,
    owner_contexts: Vec<String>,
}

#[derive(Clone)]
pub struct TargetManager {
    root: CdpSession,
    config: Arc<MapperConfig>,
    contexts: BrowsingContextStorage,
    realms: RealmStorage,
    network: NetworkStorage,
    preload: PreloadScriptStorage,
    input: InputStateManager,
    events: EventManager,
    workers: Arc<Mutex<HashMap<SessionId, WorkerSession>>>,
    /// Latches for `browsingContext.create` callers waiting on auto-attach
    /// to surface their new target.
    pending: Arc<Mutex<HashMap<String, crate::deferred::Deferred<()>>>>,
}

impl TargetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: CdpSession,
        config: Arc<MapperConfig>,
        contexts: BrowsingContextStorage,
        realms: RealmStorage,
        network: NetworkStorage,
        preload: PreloadScriptStorage,
        input: InputStateManager,
        events: EventManager,
    ) -> Self {
        Self {
            root,
            config,
            contexts,
            realms,
            network,
            preload,
            input,
            events,
            workers: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolves once the context with the given id has been registered.
    pub fn wait_for_context(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = crate::error::Result<()>> {
        use futures::future::{self, Either};
        if self.contexts.has(id) {
            Either::Left(future::ready(Ok(())))
        } else {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            Either::Right(
                pending
                    .entry(id.to_string())
                    .or_insert_with(crate::deferred::Deferred::new)
                    .wait(),
            )
        }
    }

    fn resolve_pending(&self, id: &str) {
        if let Some(mut latch) = self
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(id)
        {
            latch.resolve(());
        }
    }

    /// Kick off browser-level auto-attach.
    pub async fn start(&self) -> crate::error::Result<()> {
        self.root
            .send(
                "Target.setDiscoverTargets",
                serde_json::json!({"discover": true}),
            )
            .await?;
        self.root
            .send(
                "Target.setAutoAttach",
                serde_json::json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": true,
                    "flatten": true,
                }),
            )
            .await?;
        Ok(())
    }

    pub fn on_attached_to_target(
        &self,
        parent_session: Option<&SessionId>,
        event: EventAttachedToTarget,
    ) {
        let info = &event.target_info;
        let session = self.root.sibling(event.session_id.clone());

        if self
            .config
            .self_target_id
            .as_ref()
            .map_or(false, |id| *id == info.target_id)
        {
            // our own machinery showing up in auto-attach: let it run and
            // step away
            self.detach_and_resume(session, event.session_id.clone());
            return;
        }

        match info.kind.as_str() {
            "tab" => {
                let waiting = event.waiting_for_debugger;
                tokio::spawn(async move {
                    let _ = session
                        .send(
                            "Target.setAutoAttach",
                            serde_json::json!({
                                "autoAttach": true,
                                "waitForDebuggerOnStart": true,
                                "flatten": true,
                            }),
                        )
                        .await;
                    if waiting {
                        let _ = session
                            .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
                            .await;
                    }
                });
            }
            "page" | "iframe" => self.attach_page_target(parent_session, event),
            "worker" | "service_worker" | "shared_worker" => {
                self.attach_worker_target(parent_session, event)
            }
            other => {
                tracing::debug!(kind = other, "detaching from unsupported target type");
                self.detach_and_resume(session, event.session_id.clone());
            }
        }
    }

    fn attach_page_target(
        &self,
        parent_session: Option<&SessionId>,
        event: EventAttachedToTarget,
    ) {
        let info = &event.target_info;
        let context_id = info.target_id.inner().to_string();
        let target = CdpTarget::new(info.target_id.clone(), event.session_id.clone(), &self.root);

        if self.contexts.has(&context_id) {
            // OOPIF re-parenting: the context survives, the backing target
            // changes
            self.contexts.replace_target(&context_id, target.clone());
        } else {
            let parent = info
                .opener_frame_id
                .clone()
                .filter(|id| self.contexts.has(id))
                .or_else(|| {
                    info.opener_id
                        .as_ref()
                        .map(|id| id.inner().to_string())
                        .filter(|id| self.contexts.has(id))
                })
                .or_else(|| {
                    if info.kind == "iframe" {
                        parent_session
                            .and_then(|sid| self.contexts.find_by_session(sid))
                            .map(|c| c.id)
                    } else {
                        None
                    }
                });
            let url = if info.url.is_empty() {
                ABOUT_BLANK.to_string()
            } else {
                info.url.clone()
            };
            let context = BrowsingContext {
                id: context_id.clone(),
                parent,
                user_context: info
                    .browser_context_id
                    .clone()
                    .unwrap_or_else(|| "default".to_string()),
                url: url.clone(),
                children: Vec::new(),
                cdp_target: target.clone(),
                navigation: NavigationTracker::new(&context_id, url, self.events.clone()),
            };
            self.emit_context_created(&context);
            self.contexts.add(context);
        }
        self.resolve_pending(&context_id);

        let this = self.clone();
        let parent = parent_session.map(|sid| self.root.sibling(sid.clone()));
        tokio::spawn(async move {
            let top_level = this
                .contexts
                .top_level_id(&context_id)
                .unwrap_or_else(|_| context_id.clone());
            let restore = {
                let this = this.clone();
                let target = target.clone();
                move |tree: serde_json::Value| this.restore_frame_tree(&target, &tree)
            };
            target
                .unblock(
                    &this.config,
                    &this.preload,
                    &this.network,
                    &top_level,
                    parent,
                    restore,
                )
                .await;
        });
    }

    fn attach_worker_target(
        &self,
        parent_session: Option<&SessionId>,
        event: EventAttachedToTarget,
    ) {
        let info = &event.target_info;
        let session = self.root.sibling(event.session_id.clone());

        // the worker belongs to whichever realm owns the parent session
        let owner = parent_session.and_then(|sid| self.contexts.find_by_session(sid));
        let Some(owner) = owner else {
            tracing::debug!(target = %info.target_id, "worker without owner realm, resuming");
            let waiting = event.waiting_for_debugger;
            tokio::spawn(async move {
                if waiting {
                    let _ = session
                        .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
                        .await;
                }
            });
            return;
        };

        let kind = match info.kind.as_str() {
            "service_worker" => RealmType::ServiceWorker,
            "shared_worker" => RealmType::SharedWorker,
            _ => RealmType::DedicatedWorker,
        };
        self.workers.lock().expect("worker map poisoned").insert(
            event.session_id.clone(),
            WorkerSession {
                kind,
                owner_contexts: vec![owner.id],
            },
        );

        tokio::spawn(async move {
            let _ = session.send("Runtime.enable", serde_json::json!({})).await;
            let _ = session
                .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
                .await;
        });
    }

    pub fn on_detached_from_target(&self, event: EventDetachedFromTarget) {
        if self
            .workers
            .lock()
            .expect("worker map poisoned")
            .remove(&event.session_id)
            .is_some()
        {
            for realm in self.realms.remove_by_session(&event.session_id) {
                self.emit_realm_destroyed(&realm);
            }
            return;
        }
        for root in self.contexts.session_roots(&event.session_id) {
            if let Some(context) = self.contexts.find(&root) {
                context
                    .cdp_target
                    .abort_unblock(Error::unknown("target detached"));
            }
            self.dispose_context_subtree(&root);
        }
        for realm in self.realms.remove_by_session(&event.session_id) {
            self.emit_realm_destroyed(&realm);
        }
    }

    pub fn on_target_info_changed(&self, event: &EventTargetInfoChanged) {
        let id = event.target_info.target_id.inner();
        if !event.target_info.url.is_empty() && self.contexts.has(id) {
            self.contexts.update_url(id, event.target_info.url.clone());
            if let Some(context) = self.contexts.find(id) {
                context.navigation.set_url(event.target_info.url.clone());
            }
        }
    }

    /// `Page.frameAttached`: a same-process child frame appears.
    pub fn on_frame_attached(&self, session_id: Option<&SessionId>, event: &EventFrameAttached) {
        if self.contexts.has(&event.frame_id) {
            return;
        }
        let Some(parent) = self.contexts.find(&event.parent_frame_id) else {
            return;
        };
        let target = session_id
            .and_then(|sid| self.contexts.find_by_session(sid))
            .map(|c| c.cdp_target)
            .unwrap_or_else(|| parent.cdp_target.clone());
        let context = BrowsingContext {
            id: event.frame_id.clone(),
            parent: Some(event.parent_frame_id.clone()),
            user_context: parent.user_context.clone(),
            url: ABOUT_BLANK.to_string(),
            children: Vec::new(),
            cdp_target: target,
            navigation: NavigationTracker::new(
                &event.frame_id,
                ABOUT_BLANK,
                self.events.clone(),
            ),
        };
        self.emit_context_created(&context);
        self.contexts.add(context);
    }

    /// Register the frames reported by `Page.getFrameTree` during unblock;
    /// contexts the mapper attached too late to see are recovered here.
    pub fn restore_frame_tree(&self, target: &CdpTarget, tree: &serde_json::Value) {
        self.restore_frame_node(target, &tree["frameTree"], None);
    }

    fn restore_frame_node(
        &self,
        target: &CdpTarget,
        node: &serde_json::Value,
        parent: Option<String>,
    ) {
        let frame = &node["frame"];
        let Some(id) = frame["id"].as_str() else {
            return;
        };
        if !self.contexts.has(id) {
            let url = frame["url"].as_str().filter(|u| !u.is_empty()).unwrap_or(ABOUT_BLANK);
            let parent = frame["parentId"]
                .as_str()
                .map(str::to_string)
                .or(parent);
            let context = BrowsingContext {
                id: id.to_string(),
                parent,
                user_context: "default".to_string(),
                url: url.to_string(),
                children: Vec::new(),
                cdp_target: target.clone(),
                navigation: NavigationTracker::new(id, url, self.events.clone()),
            };
            self.emit_context_created(&context);
            self.contexts.add(context);
            self.resolve_pending(id);
        }
        if let Some(children) = node["childFrames"].as_array() {
            for child in children {
                self.restore_frame_node(target, child, Some(id.to_string()));
            }
        }
    }

    /// Dispose a context and all descendants: latches canceled, realms
    /// swept, one `contextDestroyed` per removed node, deepest first. The
    /// routing ancestor is resolved before the tree comes apart.
    pub fn dispose_context_subtree(&self, id: &str) {
        let top_level = self
            .contexts
            .top_level_id(id)
            .unwrap_or_else(|_| id.to_string());
        for context in self.contexts.delete_subtree(id) {
            context.navigation.dispose();
            for realm in self.realms.remove_by_context(&context.id) {
                self.emit_realm_destroyed(&realm);
            }
            if context.is_top_level() {
                self.input.delete(&context.id);
            }
            self.emit_context_destroyed(&context, &top_level);
        }
    }

    /// Children replaced by a cross-document navigation of their parent.
    pub fn clear_children(&self, id: &str) {
        let top_level = self
            .contexts
            .top_level_id(id)
            .unwrap_or_else(|_| id.to_string());
        for context in self.contexts.clear_children(id) {
            context.navigation.dispose();
            for realm in self.realms.remove_by_context(&context.id) {
                self.emit_realm_destroyed(&realm);
            }
            self.emit_context_destroyed(&context, &top_level);
        }
    }

    pub fn on_execution_context_created(
        &self,
        session_id: Option<&SessionId>,
        event: &EventExecutionContextCreated,
    ) {
        let Some(session_id) = session_id else {
            return;
        };
        let description = &event.context;
        let aux = description.aux_data.clone().unwrap_or_default();
        let realm_id = if description.unique_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            description.unique_id.clone()
        };

        let worker = self
            .workers
            .lock()
            .expect("worker map poisoned")
            .get(session_id)
            .cloned();
        let realm = if let Some(worker) = worker {
            Realm {
                id: realm_id,
                kind: worker.kind,
                origin: description.origin.clone(),
                execution_context_id: description.id,
                session_id: session_id.clone(),
                context_ids: worker.owner_contexts,
                sandbox: None,
                hidden: false,
                handles: Vec::new(),
            }
        } else {
            let frame_id = aux
                .get("frameId")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| self.contexts.find_by_session(session_id).map(|c| c.id));
            let Some(frame_id) = frame_id else {
                return;
            };
            let is_default = aux
                .get("isDefault")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let sandbox = if is_default {
                None
            } else {
                Some(description.name.clone())
            };
            let hidden = !is_default && description.name.is_empty();
            Realm {
                id: realm_id,
                kind: RealmType::Window,
                origin: description.origin.clone(),
                execution_context_id: description.id,
                session_id: session_id.clone(),
                context_ids: vec![frame_id],
                sandbox,
                hidden,
                handles: Vec::new(),
            }
        };

        let exposed = realm.is_exposed();
        let info = realm.info();
        self.realms.add(realm);
        if exposed {
            let context = info.context.clone();
            self.events.emit(
                "script.realmCreated",
                context,
                serde_json::to_value(&info).unwrap_or_default(),
            );
        }
    }

    pub fn on_execution_context_destroyed(
        &self,
        session_id: Option<&SessionId>,
        event: &EventExecutionContextDestroyed,
    ) {
        let Some(session_id) = session_id else {
            return;
        };
        if let Some(realm) = self
            .realms
            .remove_by_execution_context(session_id, event.execution_context_id)
        {
            self.emit_realm_destroyed(&realm);
        }
    }

    pub fn on_execution_contexts_cleared(&self, session_id: Option<&SessionId>) {
        let Some(session_id) = session_id else {
            return;
        };
        for realm in self.realms.remove_by_session(session_id) {
            self.emit_realm_destroyed(&realm);
        }
    }

    /// Routing key for a context's lifecycle events: its top-level
    /// ancestor, resolvable even before the context itself is registered.
    fn routing_top_level(&self, context: &BrowsingContext) -> String {
        match &context.parent {
            Some(parent) => self
                .contexts
                .top_level_id(parent)
                .unwrap_or_else(|_| context.id.clone()),
            None => context.id.clone(),
        }
    }

    fn emit_context_created(&self, context: &BrowsingContext) {
        let top_level = self.routing_top_level(context);
        self.events.emit(
            "browsingContext.contextCreated",
            Some(top_level),
            serde_json::to_value(context_info(context)).unwrap_or_default(),
        );
    }

    fn emit_context_destroyed(&self, context: &BrowsingContext, top_level: &str) {
        self.events.emit(
            "browsingContext.contextDestroyed",
            Some(top_level.to_string()),
            serde_json::to_value(context_info(context)).unwrap_or_default(),
        );
    }

    fn emit_realm_destroyed(&self, realm: &Realm) {
        if realm.is_exposed() {
            self.events.emit(
                "script.realmDestroyed",
                realm.context_ids.first().cloned(),
                serde_json::json!({"realm": realm.id}),
            );
        }
    }

    fn detach_and_resume(&self, session: CdpSession, session_id: SessionId) {
        let root = self.root.clone();
        tokio::spawn(async move {
            let _ = session
                .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
                .await;
            let _ = root
                .send(
                    "Target.detachFromTarget",
                    serde_json::json!({"sessionId": session_id}),
                )
                .await;
        });
    }
}

impl std::fmt::Debug for TargetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetManager").finish()
    }
}

fn context_info(context: &BrowsingContext) -> Info {
    Info {
        context: context.id.clone(),
        url: context.url.clone(),
        user_context: context.user_context.clone(),
        parent: context.parent.clone(),
        children: None,
    }
}

/// The `goog:cdp` passthrough payload for one raw CDP event.
pub fn cdp_passthrough_params(
    method: &str,
    params: &serde_json::Value,
    session_id: Option<&SessionId>,
) -> (String, serde_json::Value) {
    (
        format!("{}.{method}", bidi::CDP_MODULE),
        serde_json::json!({
            "event": method,
            "params": params,
            "session": session_id.map(|s| s.inner().to_string()),
        }),
    )
}
