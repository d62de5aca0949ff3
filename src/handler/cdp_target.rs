//! Lifecycle wrapper around one CDP session. A freshly attached target is
//! blocked: domains get enabled and preload scripts installed before the
//! unblocked latch resolves, and navigations or evaluations against the
//! target await that latch first.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cdp::{CdpSession, SessionId, TargetId};
use crate::deferred::Deferred;
use crate::error::{CdpError, Error, Result};
use crate::handler::network::{FetchStages, NetworkStorage};
use crate::handler::preload::PreloadScriptStorage;
use crate::handler::{MapperConfig, UserPromptPolicy};

#[derive(Debug, Default)]
struct TargetState {
    fetch_stages: FetchStages,
    cache_disabled: bool,
    window_id: Option<i64>,
    previous_viewport: Option<(u64, u64)>,
}

#[derive(Debug)]
struct TargetInner {
    target_id: TargetId,
    session_id: SessionId,
    session: CdpSession,
    state: Mutex<TargetState>,
    unblocked: Mutex<Deferred<()>>,
    /// Serializes Fetch reconfiguration; concurrent callers coalesce on the
    /// recomputed stage set.
    fetch_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct CdpTarget {
    inner: Arc<TargetInner>,
}

impl CdpTarget {
    pub fn new(target_id: TargetId, session_id: SessionId, root: &CdpSession) -> Self {
        let session = root.sibling(session_id.clone());
        Self {
            inner: Arc::new(TargetInner {
                target_id,
                session_id,
                session,
                state: Mutex::new(TargetState::default()),
                unblocked: Mutex::new(Deferred::new()),
                fetch_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn target_id(&self) -> &TargetId {
        &self.inner.target_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn session(&self) -> CdpSession {
        self.inner.session.clone()
    }

    pub fn window_id(&self) -> Option<i64> {
        self.state().window_id
    }

    pub fn previous_viewport(&self) -> Option<(u64, u64)> {
        self.state().previous_viewport
    }

    pub fn set_previous_viewport(&self, viewport: Option<(u64, u64)>) {
        self.state().previous_viewport = viewport;
    }

    /// Resolved once the target is initialized, or rejected when the
    /// initialization failed for a reason other than the session going
    /// away.
    pub fn unblocked(&self) -> impl std::future::Future<Output = Result<()>> {
        self.inner
            .unblocked
            .lock()
            .expect("target latch poisoned")
            .wait()
    }

    /// Run the unblock sequence: everything scheduled in parallel, awaited
    /// together, with one shared failure mode. Session-closure errors are
    /// expected (targets go away mid-setup) and swallowed.
    pub async fn unblock(
        &self,
        config: &MapperConfig,
        preload: &PreloadScriptStorage,
        network: &NetworkStorage,
        top_level_context: &str,
        parent: Option<CdpSession>,
        restore_frame_tree: impl FnOnce(serde_json::Value) + Send,
    ) {
        if !self
            .inner
            .unblocked
            .lock()
            .expect("target latch poisoned")
            .is_pending()
        {
            return;
        }

        let session = self.session();
        let mut steps: Vec<BoxFuture<'_, std::result::Result<(), CdpError>>> = Vec::new();

        steps.push(
            send_unit(
                &session,
                "Page.enable",
                serde_json::json!({"enableFileChooserOpenedEvent": true}),
            )
            .boxed(),
        );
        if config.user_prompt_policy != UserPromptPolicy::Ignore {
            steps.push(
                send_unit(
                    &session,
                    "Page.setInterceptFileChooserDialog",
                    serde_json::json!({"enabled": true}),
                )
                .boxed(),
            );
        }
        {
            let session = session.clone();
            steps.push(
                async move {
                    let tree = session
                        .send("Page.getFrameTree", serde_json::json!({}))
                        .await?;
                    restore_frame_tree(tree);
                    Ok(())
                }
                .boxed(),
            );
        }
        steps.push(send_unit(&session, "Runtime.enable", serde_json::json!({})).boxed());
        steps.push(
            send_unit(
                &session,
                "Page.setLifecycleEventsEnabled",
                serde_json::json!({"enabled": true}),
            )
            .boxed(),
        );
        steps.push(
            send_unit(
                &session,
                "Page.setPrerenderingAllowed",
                serde_json::json!({"isAllowed": config.prerendering_allowed}),
            )
            .boxed(),
        );
        steps.push(send_unit(&session, "Network.enable", serde_json::json!({})).boxed());
        steps.push(
            async move {
                self.toggle_fetch_if_needed(network.fetch_stages(), network)
                    .await
            }
            .boxed(),
        );
        steps.push(
            send_unit(
                &session,
                "Target.setAutoAttach",
                serde_json::json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": true,
                    "flatten": true,
                }),
            )
            .boxed(),
        );
        {
            let root = session.root();
            let target_id = self.inner.target_id.clone();
            steps.push(
                async move {
                    let result = root
                        .send(
                            "Browser.getWindowForTarget",
                            serde_json::json!({"targetId": target_id}),
                        )
                        .await?;
                    self.state().window_id = result.get("windowId").and_then(|v| v.as_i64());
                    Ok(())
                }
                .boxed(),
            );
        }
        if let Some((width, height)) = config.viewport {
            steps.push(
                send_unit(
                    &session,
                    "Emulation.setDeviceMetricsOverride",
                    serde_json::json!({
                        "width": width,
                        "height": height,
                        "deviceScaleFactor": config.device_pixel_ratio.unwrap_or(0.0),
                        "mobile": false,
                    }),
                )
                .boxed(),
            );
        }
        if let Some((latitude, longitude)) = config.geolocation {
            steps.push(
                send_unit(
                    &session,
                    "Emulation.setGeolocationOverride",
                    serde_json::json!({
                        "latitude": latitude,
                        "longitude": longitude,
                        "accuracy": 1.0,
                    }),
                )
                .boxed(),
            );
        }
        {
            let session = session.clone();
            let scripts = preload.scripts_for(top_level_context);
            let preload = preload.clone();
            let target_id = self.inner.target_id.clone();
            steps.push(
                async move {
                    for script in scripts {
                        for proxy in &script.channels {
                            session
                                .send(
                                    "Runtime.addBinding",
                                    serde_json::json!({"name": proxy.binding}),
                                )
                                .await?;
                        }
                        let mut params = serde_json::json!({"source": script.source()});
                        if let Some(sandbox) = &script.sandbox {
                            params["worldName"] = serde_json::json!(sandbox);
                        }
                        let result = session
                            .send("Page.addScriptToEvaluateOnNewDocument", params)
                            .await?;
                        if let Some(cdp_id) =
                            result.get("identifier").and_then(|v| v.as_str())
                        {
                            preload.record_cdp_id(
                                &script.id,
                                target_id.clone(),
                                cdp_id.to_string(),
                            );
                        }
                    }
                    Ok(())
                }
                .boxed(),
            );
        }

        let results = futures::future::join_all(steps).await;
        let failure = results
            .into_iter()
            .filter_map(|r| r.err())
            .find(|err| !err.is_session_gone());

        // resume the target and its parent tab regardless; a blocked
        // debugger would wedge the whole page otherwise
        let _ = session
            .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
            .await;
        if let Some(parent) = parent {
            let _ = parent
                .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
                .await;
        }

        let mut latch = self.inner.unblocked.lock().expect("target latch poisoned");
        match failure {
            Some(err) => {
                tracing::warn!(target = %self.inner.target_id, "target unblock failed: {err}");
                latch.reject(Error::unknown(format!("target initialization failed: {err}")));
            }
            None => {
                latch.resolve(());
            }
        }
    }

    /// Reconfigure the Fetch domain for the desired stage set. Idempotent:
    /// matching current state is a no-op. Disabling waits for blocked
    /// requests to pass their next phase first so they are not dropped
    /// mid-flight.
    pub async fn toggle_fetch_if_needed(
        &self,
        desired: FetchStages,
        network: &NetworkStorage,
    ) -> std::result::Result<(), CdpError> {
        let _guard = self.inner.fetch_lock.lock().await;
        let current = self.state().fetch_stages;
        if desired == current {
            return Ok(());
        }

        let session = self.session();
        if desired.is_empty() {
            network.drain_blocked().await;
            swallow_gone(session.send("Fetch.disable", serde_json::json!({})).await)?;
            if self.state().cache_disabled {
                swallow_gone(
                    session
                        .send(
                            "Network.setCacheDisabled",
                            serde_json::json!({"cacheDisabled": false}),
                        )
                        .await,
                )?;
                self.state().cache_disabled = false;
            }
        } else {
            let mut patterns = Vec::new();
            if desired.request || desired.auth {
                patterns.push(serde_json::json!({"urlPattern": "*", "requestStage": "Request"}));
            }
            if desired.response {
                patterns.push(serde_json::json!({"urlPattern": "*", "requestStage": "Response"}));
            }
            swallow_gone(
                session
                    .send(
                        "Fetch.enable",
                        serde_json::json!({
                            "patterns": patterns,
                            "handleAuthRequests": desired.auth,
                        }),
                    )
                    .await,
            )?;
            if !self.state().cache_disabled {
                swallow_gone(
                    session
                        .send(
                            "Network.setCacheDisabled",
                            serde_json::json!({"cacheDisabled": true}),
                        )
                        .await,
                )?;
                self.state().cache_disabled = true;
            }
        }
        self.state().fetch_stages = desired;
        Ok(())
    }

    /// Fail the latch without running the sequence; used when the target
    /// detaches before initialization finishes.
    pub fn abort_unblock(&self, reason: Error) {
        self.inner
            .unblocked
            .lock()
            .expect("target latch poisoned")
            .reject(reason);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.inner.state.lock().expect("target state poisoned")
    }
}

async fn send_unit(
    session: &CdpSession,
    method: &str,
    params: serde_json::Value,
) -> std::result::Result<(), CdpError> {
    session.send(method, params).await.map(|_| ())
}

fn swallow_gone(
    result: std::result::Result<serde_json::Value, CdpError>,
) -> std::result::Result<(), CdpError> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.is_session_gone() => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{RecordingConnection, test_event_manager};
    use crate::handler::context::BrowsingContextStorage;

    fn target(conn: &Arc<RecordingConnection>) -> CdpTarget {
        let root = CdpSession::browser(conn.clone());
        CdpTarget::new(TargetId::new("target-1"), SessionId::new("sess-1"), &root)
    }

    #[tokio::test]
    async fn fetch_toggle_is_idempotent() {
        let conn = Arc::new(RecordingConnection::default());
        let target = target(&conn);
        let (events, _subs, _out) = test_event_manager();
        let network = NetworkStorage::new(events, BrowsingContextStorage::new());

        let stages = FetchStages {
            request: true,
            response: false,
            auth: false,
        };
        target.toggle_fetch_if_needed(stages, &network).await.unwrap();
        target.toggle_fetch_if_needed(stages, &network).await.unwrap();

        let sent = conn.sent();
        let enables: Vec<_> = sent.iter().filter(|(m, _)| m == "Fetch.enable").collect();
        assert_eq!(enables.len(), 1, "second identical toggle must be a no-op");
        let patterns = enables[0].1["patterns"].as_array().unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0]["requestStage"], "Request");
        // interception disables the cache
        assert!(sent.iter().any(|(m, p)| m == "Network.setCacheDisabled"
            && p["cacheDisabled"] == true));
    }

    #[tokio::test]
    async fn disabling_fetch_restores_cache() {
        let conn = Arc::new(RecordingConnection::default());
        let target = target(&conn);
        let (events, _subs, _out) = test_event_manager();
        let network = NetworkStorage::new(events, BrowsingContextStorage::new());

        target
            .toggle_fetch_if_needed(
                FetchStages {
                    request: false,
                    response: true,
                    auth: true,
                },
                &network,
            )
            .await
            .unwrap();
        target
            .toggle_fetch_if_needed(FetchStages::default(), &network)
            .await
            .unwrap();

        let sent = conn.sent();
        assert!(sent.iter().any(|(m, _)| m == "Fetch.disable"));
        assert!(sent.iter().any(|(m, p)| m == "Network.setCacheDisabled"
            && p["cacheDisabled"] == false));
        // auth stage implies a Request pattern plus auth handling
        let enable = sent.iter().find(|(m, _)| m == "Fetch.enable").unwrap();
        assert_eq!(enable.1["handleAuthRequests"], true);
        assert_eq!(enable.1["patterns"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unblock_runs_setup_before_latch() {
        use crate::handler::preload::{PreloadScript, PreloadScriptStorage};

        let conn = Arc::new(RecordingConnection::default());
        let target = target(&conn);
        let (events, _subs, _out) = test_event_manager();
        let network = NetworkStorage::new(events, BrowsingContextStorage::new());
        let preload = PreloadScriptStorage::new();
        preload.add(PreloadScript::new("() => {}", None, None, vec![]));
        let config = crate::handler::MapperConfig::default();

        let waiter = target.unblocked();
        target
            .unblock(&config, &preload, &network, "top", None, |_tree| {})
            .await;
        waiter.await.unwrap();

        let sent: Vec<String> = conn.sent().into_iter().map(|(m, _)| m).collect();
        for method in [
            "Page.enable",
            "Page.getFrameTree",
            "Runtime.enable",
            "Page.setLifecycleEventsEnabled",
            "Network.enable",
            "Target.setAutoAttach",
            "Page.addScriptToEvaluateOnNewDocument",
            "Runtime.runIfWaitingForDebugger",
        ] {
            assert!(sent.iter().any(|m| m == method), "{method} was not sent");
        }
        // the debugger resumes only after the setup settled
        assert_eq!(
            sent.last().map(String::as_str),
            Some("Runtime.runIfWaitingForDebugger")
        );
    }

}
