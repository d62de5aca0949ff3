//! The mapper core: maintains the world model of browser state and
//! reconciles the CDP event stream and the BiDi command stream into a
//! consistent BiDi view. Commands route to per-module processors; CDP
//! events mutate the storages and feed the event manager.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tokio::sync::mpsc;

use crate::bidi::{CommandEnvelope, OutgoingMessage};
use crate::cdp::events::{
    CdpEvent, CdpEventMessage, EventBindingCalled, EventConsoleApiCalled, EventExceptionThrown,
    EventJavascriptDialogClosed, EventJavascriptDialogOpening,
};
use crate::cdp::{CdpSession, SessionId, SharedConnection, TargetId};
use crate::error::Result;

pub mod cdp_target;
pub mod commands;
pub mod context;
pub mod event_manager;
pub mod input;
pub mod navigation;
pub mod network;
pub mod preload;
pub mod realm;
pub mod subscription;
pub mod target;

use context::BrowsingContextStorage;
use event_manager::EventManager;
use input::InputStateManager;
use network::NetworkStorage;
use preload::PreloadScriptStorage;
use realm::RealmStorage;
use subscription::SubscriptionManager;
use target::TargetManager;

/// How the session reacts to user prompts the client has not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserPromptPolicy {
    Accept,
    #[default]
    Dismiss,
    Ignore,
}

impl UserPromptPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            UserPromptPolicy::Accept => "accept",
            UserPromptPolicy::Dismiss => "dismiss",
            UserPromptPolicy::Ignore => "ignore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    Mac,
    #[default]
    Other,
}

/// How the mapper configures targets and sessions.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub user_prompt_policy: UserPromptPolicy,
    /// Whether targets allow prerendering speculation.
    pub prerendering_allowed: bool,
    /// Device metrics applied to every new target.
    pub viewport: Option<(u64, u64)>,
    pub device_pixel_ratio: Option<f64>,
    /// Geolocation override (latitude, longitude) applied to every new
    /// target.
    pub geolocation: Option<(f64, f64)>,
    /// Drives macOS editing-command key handling.
    pub platform: Platform,
    /// Target the mapper itself runs in, detached from when auto-attach
    /// surfaces it.
    pub self_target_id: Option<TargetId>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            user_prompt_policy: UserPromptPolicy::default(),
            prerendering_allowed: true,
            viewport: None,
            device_pixel_ratio: None,
            geolocation: None,
            platform: Platform::default(),
            self_target_id: None,
        }
    }
}

/// Shared handles every processor works against.
#[derive(Debug, Clone)]
pub struct MapperCtx {
    pub root: CdpSession,
    pub config: Arc<MapperConfig>,
    pub contexts: BrowsingContextStorage,
    pub realms: RealmStorage,
    pub subscriptions: SubscriptionManager,
    pub network: NetworkStorage,
    pub preload: PreloadScriptStorage,
    pub input: InputStateManager,
    pub events: EventManager,
    pub targets: TargetManager,
    /// Open user prompts per context, by prompt type.
    pub prompts: Arc<Mutex<HashMap<String, String>>>,
}

#[derive(Debug, Clone)]
pub struct Mapper {
    ctx: MapperCtx,
}

impl Mapper {
    /// Wire up the mapper against a CDP connection and an outbound message
    /// sink. `start` must be called afterwards to begin auto-attach.
    pub fn new(
        conn: SharedConnection,
        sink: mpsc::UnboundedSender<OutgoingMessage>,
        config: MapperConfig,
    ) -> Self {
        let config = Arc::new(config);
        let root = CdpSession::browser(conn);
        let subscriptions = SubscriptionManager::new();
        let contexts = BrowsingContextStorage::new();
        let events = EventManager::spawn(subscriptions.clone(), contexts.clone(), sink);
        let realms = RealmStorage::new();
        let network = NetworkStorage::new(events.clone(), contexts.clone());
        let preload = PreloadScriptStorage::new();
        let input = InputStateManager::new();
        let targets = TargetManager::new(
            root.clone(),
            config.clone(),
            contexts.clone(),
            realms.clone(),
            network.clone(),
            preload.clone(),
            input.clone(),
            events.clone(),
        );
        Self {
            ctx: MapperCtx {
                root,
                config,
                contexts,
                realms,
                subscriptions,
                network,
                preload,
                input,
                events,
                targets,
                prompts: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    /// Begin browser-level auto-attach.
    pub async fn start(&self) -> Result<()> {
        self.ctx.targets.start().await
    }

    pub fn contexts(&self) -> &BrowsingContextStorage {
        &self.ctx.contexts
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.ctx.subscriptions
    }

    /// Accept one client command. The response slot is reserved
    /// synchronously so responses leave in request order; processing runs
    /// concurrently.
    pub fn handle_command(&self, command: CommandEnvelope) {
        let slot = self.ctx.events.reserve_response();
        let this = self.clone();
        tokio::spawn(async move {
            let CommandEnvelope {
                id,
                method,
                channel,
                params,
            } = command;
            let message = match commands::process(&this.ctx, &method, &channel, params).await {
                Ok(result) => OutgoingMessage::result(id, result, channel),
                Err(err) => {
                    tracing::debug!(%method, code = err.code(), "command failed: {err}");
                    OutgoingMessage::error(Some(id), &err, channel)
                }
            };
            slot.fulfill(message);
        });
    }

    /// Accept one raw client message; malformed JSON produces an error
    /// response without an id.
    pub fn handle_command_json(&self, raw: &str) {
        match serde_json::from_str::<CommandEnvelope>(raw) {
            Ok(command) => self.handle_command(command),
            Err(err) => {
                let slot = self.ctx.events.reserve_response();
                slot.fulfill(OutgoingMessage::error(
                    None,
                    &crate::error::Error::invalid_argument(format!("malformed command: {err}")),
                    None,
                ));
            }
        }
    }

    /// Dispatch one CDP event into the world model. Events must be fed in
    /// the order the connection observed them.
    pub fn handle_cdp_event(&self, msg: CdpEventMessage) {
        let ctx = &self.ctx;

        // raw passthrough keeps its slot in the output order no matter how
        // the typed routing below fans out
        let (name, params) =
            target::cdp_passthrough_params(&msg.method, &msg.params, msg.session_id.as_ref());
        ctx.events.emit(name, None, params);

        let event = match CdpEvent::parse(&msg) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(method = %msg.method, "unparseable CDP event: {err}");
                return;
            }
        };
        let session_id = msg.session_id.as_ref();

        match event {
            CdpEvent::PageFrameAttached(ev) => ctx.targets.on_frame_attached(session_id, &ev),
            CdpEvent::PageFrameDetached(ev) => {
                // a swap means the frame moves to another target (OOPIF);
                // the context survives and re-binds on attach
                if ev.reason.as_deref() != Some("swap") {
                    ctx.targets.dispose_context_subtree(&ev.frame_id);
                }
            }
            CdpEvent::PageFrameSubtreeWillBeDetached(ev) => {
                ctx.targets.dispose_context_subtree(&ev.frame_id);
            }
            CdpEvent::PageFrameNavigated(ev) => {
                let frame = &ev.frame;
                let url = match &frame.url_fragment {
                    Some(fragment) => format!("{}{fragment}", frame.url),
                    None => frame.url.clone(),
                };
                if let Some(context) = ctx.contexts.find(&frame.id) {
                    // the previous document's children are gone; survivors
                    // re-attach
                    ctx.targets.clear_children(&frame.id);
                    ctx.contexts.update_url(&frame.id, &url);
                    context.navigation.on_frame_navigated(&url);
                }
            }
            CdpEvent::PageLifecycleEvent(ev) => {
                if let Some(context) = ctx.contexts.find(&ev.frame_id) {
                    context.navigation.on_lifecycle_event(&ev.name, &ev.loader_id);
                }
            }
            CdpEvent::PageNavigatedWithinDocument(ev) => {
                if let Some(context) = ctx.contexts.find(&ev.frame_id) {
                    ctx.contexts.update_url(&ev.frame_id, &ev.url);
                    context
                        .navigation
                        .on_navigated_within_document(&ev.url, ev.navigation_type.as_deref());
                }
            }
            CdpEvent::PageFrameRequestedNavigation(ev) => {
                if let Some(context) = ctx.contexts.find(&ev.frame_id) {
                    context.navigation.on_frame_requested_navigation(&ev.url);
                }
            }
            CdpEvent::PageJavascriptDialogOpening(ev) => {
                self.on_dialog_opening(session_id, ev);
            }
            CdpEvent::PageJavascriptDialogClosed(ev) => {
                self.on_dialog_closed(session_id, ev);
            }
            CdpEvent::PageDownloadWillBegin(ev) => {
                if let Some(context) = ctx.contexts.find(&ev.frame_id) {
                    let params = crate::bidi::browsing_context::DownloadWillBeginParams {
                        context: context.id.clone(),
                        navigation: context.navigation.current_navigation_id(),
                        timestamp: crate::bidi::timestamp(),
                        url: ev.url.clone(),
                        suggested_filename: ev.suggested_filename.clone(),
                    };
                    ctx.events.emit(
                        "browsingContext.downloadWillBegin",
                        Some(context.id),
                        serde_json::to_value(params).unwrap_or_default(),
                    );
                }
            }
            CdpEvent::PageFileChooserOpened(ev) => {
                ctx.events.emit(
                    "input.fileDialogOpened",
                    Some(ev.frame_id.clone()),
                    serde_json::json!({
                        "context": ev.frame_id,
                        "multiple": ev.mode.as_deref() == Some("selectMultiple"),
                    }),
                );
            }
            CdpEvent::NetworkRequestWillBeSent(ev) => ctx.network.on_request_will_be_sent(*ev),
            CdpEvent::NetworkRequestWillBeSentExtraInfo(ev) => {
                ctx.network.on_request_will_be_sent_extra_info(&ev);
            }
            CdpEvent::NetworkResponseReceived(ev) => ctx.network.on_response_received(*ev),
            CdpEvent::NetworkResponseReceivedExtraInfo(ev) => {
                ctx.network.on_response_extra_info(&ev);
            }
            CdpEvent::NetworkLoadingFailed(ev) => ctx.network.on_loading_failed(&ev),
            CdpEvent::NetworkLoadingFinished(ev) => ctx.network.on_loading_finished(&ev),
            CdpEvent::NetworkRequestServedFromCache(ev) => ctx.network.on_served_from_cache(&ev),
            CdpEvent::FetchRequestPaused(ev) => {
                ctx.network.on_request_paused(*ev, &self.session_handle(session_id));
            }
            CdpEvent::FetchAuthRequired(ev) => {
                ctx.network.on_auth_required(&ev, &self.session_handle(session_id));
            }
            CdpEvent::TargetAttachedToTarget(ev) => {
                ctx.targets.on_attached_to_target(session_id, *ev);
            }
            CdpEvent::TargetDetachedFromTarget(ev) => ctx.targets.on_detached_from_target(ev),
            CdpEvent::TargetInfoChanged(ev) => ctx.targets.on_target_info_changed(&ev),
            CdpEvent::RuntimeExecutionContextCreated(ev) => {
                ctx.targets.on_execution_context_created(session_id, &ev);
            }
            CdpEvent::RuntimeExecutionContextDestroyed(ev) => {
                ctx.targets.on_execution_context_destroyed(session_id, &ev);
            }
            CdpEvent::RuntimeExecutionContextsCleared => {
                ctx.targets.on_execution_contexts_cleared(session_id);
            }
            CdpEvent::RuntimeConsoleApiCalled(ev) => self.on_console_api(session_id, *ev),
            CdpEvent::RuntimeExceptionThrown(ev) => self.on_exception_thrown(session_id, *ev),
            CdpEvent::RuntimeBindingCalled(ev) => self.on_binding_called(session_id, ev),
            CdpEvent::Other => {}
        }
    }

    fn session_handle(&self, session_id: Option<&SessionId>) -> CdpSession {
        match session_id {
            Some(id) => self.ctx.root.sibling(id.clone()),
            None => self.ctx.root.clone(),
        }
    }

    fn on_dialog_opening(
        &self,
        session_id: Option<&SessionId>,
        ev: EventJavascriptDialogOpening,
    ) {
        let ctx = &self.ctx;
        let Some(context) = session_id.and_then(|sid| ctx.contexts.find_by_session(sid)) else {
            return;
        };
        ctx.prompts
            .lock()
            .expect("prompt map poisoned")
            .insert(context.id.clone(), ev.kind.clone());

        let policy = ctx.config.user_prompt_policy;
        let params = crate::bidi::browsing_context::UserPromptOpenedParams {
            context: context.id.clone(),
            kind: ev.kind.clone(),
            handler: policy.as_str().to_string(),
            message: ev.message.clone(),
            default_value: ev.default_prompt.clone(),
        };
        ctx.events.emit(
            "browsingContext.userPromptOpened",
            Some(context.id.clone()),
            serde_json::to_value(params).unwrap_or_default(),
        );

        // "dismiss and notify" semantics: a subscribed client handles the
        // prompt itself through browsingContext.handleUserPrompt
        let top_level = ctx
            .contexts
            .top_level_id(&context.id)
            .unwrap_or_else(|_| context.id.clone());
        let client_handles = ctx
            .subscriptions
            .is_subscribed_to("browsingContext.userPromptOpened", Some(&top_level));
        if policy != UserPromptPolicy::Ignore && !client_handles {
            let session = context.cdp_target.session();
            let accept = policy == UserPromptPolicy::Accept;
            tokio::spawn(async move {
                let result = session
                    .send(
                        "Page.handleJavaScriptDialog",
                        serde_json::json!({"accept": accept}),
                    )
                    .await;
                if let Err(err) = result {
                    if !err.is_session_gone() {
                        tracing::debug!("auto-handling user prompt failed: {err}");
                    }
                }
            });
        }
    }

    fn on_dialog_closed(&self, session_id: Option<&SessionId>, ev: EventJavascriptDialogClosed) {
        let ctx = &self.ctx;
        let Some(context) = session_id.and_then(|sid| ctx.contexts.find_by_session(sid)) else {
            return;
        };
        let kind = ctx
            .prompts
            .lock()
            .expect("prompt map poisoned")
            .remove(&context.id)
            .unwrap_or_else(|| "alert".to_string());
        let params = crate::bidi::browsing_context::UserPromptClosedParams {
            context: context.id.clone(),
            accepted: ev.result,
            kind,
            user_text: if ev.user_input.is_empty() {
                None
            } else {
                Some(ev.user_input.clone())
            },
        };
        ctx.events.emit(
            "browsingContext.userPromptClosed",
            Some(context.id),
            serde_json::to_value(params).unwrap_or_default(),
        );
    }

    fn on_console_api(&self, session_id: Option<&SessionId>, ev: EventConsoleApiCalled) {
        let ctx = &self.ctx;
        let realm = session_id
            .and_then(|sid| ctx.realms.find_by_execution_context(sid, ev.execution_context_id));
        let (realm_id, context) = match &realm {
            Some(realm) => (realm.id.clone(), realm.context_ids.first().cloned()),
            None => (String::new(), None),
        };

        let text = ev
            .args
            .iter()
            .map(|arg| {
                arg.get("value")
                    .map(value_preview)
                    .or_else(|| {
                        arg.get("description")
                            .and_then(|d| d.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(" ");

        let args: Vec<serde_json::Value> = ev
            .args
            .iter()
            .map(|arg| match arg.get("value") {
                Some(value) => commands::script::remote_value_from_json(value),
                None => serde_json::json!({
                    "type": arg.get("type").and_then(|t| t.as_str()).unwrap_or("object"),
                }),
            })
            .collect();

        let entry = crate::bidi::log::Entry {
            kind: "console",
            level: crate::bidi::log::Level::from_console_method(&ev.kind),
            source: crate::bidi::script::Source {
                realm: realm_id,
                context: context.clone(),
            },
            text: Some(text),
            timestamp: ev.timestamp as u64,
            method: Some(ev.kind.clone()),
            args: Some(args),
            stack_trace: ev.stack_trace.clone(),
        };
        ctx.events.emit(
            "log.entryAdded",
            context,
            serde_json::to_value(entry).unwrap_or_default(),
        );
    }

    fn on_exception_thrown(&self, session_id: Option<&SessionId>, ev: EventExceptionThrown) {
        let ctx = &self.ctx;
        let execution_context_id = ev
            .exception_details
            .get("executionContextId")
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        let realm = session_id
            .and_then(|sid| ctx.realms.find_by_execution_context(sid, execution_context_id));
        let (realm_id, context) = match &realm {
            Some(realm) => (realm.id.clone(), realm.context_ids.first().cloned()),
            None => (String::new(), None),
        };

        let text = ev
            .exception_details
            .get("exception")
            .and_then(|e| e.get("description"))
            .and_then(|d| d.as_str())
            .or_else(|| ev.exception_details.get("text").and_then(|t| t.as_str()))
            .unwrap_or_default()
            .to_string();

        let entry = crate::bidi::log::Entry {
            kind: "javascript",
            level: crate::bidi::log::Level::Error,
            source: crate::bidi::script::Source {
                realm: realm_id,
                context: context.clone(),
            },
            text: Some(text),
            timestamp: ev.timestamp as u64,
            method: None,
            args: None,
            stack_trace: ev.exception_details.get("stackTrace").cloned(),
        };
        ctx.events.emit(
            "log.entryAdded",
            context,
            serde_json::to_value(entry).unwrap_or_default(),
        );
    }

    fn on_binding_called(&self, session_id: Option<&SessionId>, ev: EventBindingCalled) {
        let ctx = &self.ctx;
        let Some(properties) = ctx.preload.channel_for_binding(&ev.name) else {
            return;
        };
        let payload: serde_json::Value = match serde_json::from_str(&ev.payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(channel = %properties.channel, "dropping malformed channel payload: {err}");
                return;
            }
        };
        let realm = session_id
            .and_then(|sid| ctx.realms.find_by_execution_context(sid, ev.execution_context_id));
        let (realm_id, context) = match &realm {
            Some(realm) => (realm.id.clone(), realm.context_ids.first().cloned()),
            None => (String::new(), None),
        };
        let params = crate::bidi::script::MessageParams {
            channel: properties.channel.clone(),
            data: commands::script::remote_value_from_json(&payload),
            source: crate::bidi::script::Source {
                realm: realm_id,
                context: context.clone(),
            },
        };
        ctx.events.emit(
            "script.message",
            context,
            serde_json::to_value(params).unwrap_or_default(),
        );
    }
}

fn value_preview(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::bidi::OutgoingMessage;
    use crate::cdp::{CdpConnection, CdpSession, SessionId, TargetId};
    use crate::error::CdpError;
    use crate::handler::cdp_target::CdpTarget;
    use crate::handler::context::{BrowsingContext, BrowsingContextStorage};
    use crate::handler::event_manager::EventManager;
    use crate::handler::navigation::NavigationTracker;
    use crate::handler::subscription::SubscriptionManager;

    /// Records every sent command; answers from a per-method script or
    /// with an empty object.
    #[derive(Default)]
    pub struct RecordingConnection {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
        responses: Mutex<hashbrown::HashMap<String, serde_json::Value>>,
    }

    impl RecordingConnection {
        pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
            self.sent.lock().expect("recording poisoned").clone()
        }

        pub fn respond_with(&self, method: &str, value: serde_json::Value) {
            self.responses
                .lock()
                .expect("recording poisoned")
                .insert(method.to_string(), value);
        }
    }

    #[async_trait]
    impl CdpConnection for RecordingConnection {
        async fn send(
            &self,
            _session_id: Option<&SessionId>,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, CdpError> {
            self.sent
                .lock()
                .expect("recording poisoned")
                .push((method.to_string(), params));
            Ok(self
                .responses
                .lock()
                .expect("recording poisoned")
                .get(method)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})))
        }
    }

    /// An event manager with a live drain task, plus its subscription map
    /// and the outbound receiver.
    pub fn test_event_manager() -> (
        EventManager,
        SubscriptionManager,
        mpsc::UnboundedReceiver<OutgoingMessage>,
    ) {
        let subscriptions = SubscriptionManager::new();
        let contexts = BrowsingContextStorage::new();
        let (sink, out) = mpsc::unbounded_channel();
        let events = EventManager::spawn(subscriptions.clone(), contexts, sink);
        (events, subscriptions, out)
    }

    /// A context record for storage-only tests; its emitter and connection
    /// go nowhere.
    pub fn make_context(id: &str, parent: Option<&str>) -> BrowsingContext {
        let conn = Arc::new(RecordingConnection::default());
        let root = CdpSession::browser(conn);
        let target = CdpTarget::new(
            TargetId::new(format!("target-{id}")),
            SessionId::new(format!("session-{id}")),
            &root,
        );
        BrowsingContext {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            user_context: "default".to_string(),
            url: super::context::ABOUT_BLANK.to_string(),
            children: Vec::new(),
            cdp_target: target,
            navigation: NavigationTracker::new(id, super::context::ABOUT_BLANK, EventManager::detached()),
        }
    }
}
