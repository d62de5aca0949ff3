//! Preload scripts and channel proxies. A preload script is installed on
//! every (matching) new document before author scripts run; its declared
//! channels are bound to CDP bindings whose `sendMessage` side surfaces as
//! `script.message` events.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use uuid::Uuid;

use crate::bidi::script::ChannelProperties;
use crate::cdp::TargetId;
use crate::error::{Error, Result};

/// One user-visible message channel. The binding name is the CDP-side
/// identity, the channel id the client-side one.
#[derive(Debug, Clone)]
pub struct ChannelProxy {
    pub binding: String,
    pub channel: ChannelProperties,
}

impl ChannelProxy {
    pub fn new(channel: ChannelProperties) -> Self {
        Self {
            binding: format!("bidi_channel_{}", Uuid::new_v4().simple()),
            channel,
        }
    }

    /// The callable handed to the user function in place of the channel
    /// declaration.
    pub fn wrapper_expression(&self) -> String {
        format!(
            "(payload) => {{ const send = globalThis['{}']; if (send) send(JSON.stringify(payload === undefined ? null : payload)); }}",
            self.binding
        )
    }
}

#[derive(Debug, Clone)]
pub struct PreloadScript {
    pub id: String,
    pub function_declaration: String,
    pub sandbox: Option<String>,
    /// Top-level context ids the script is limited to; `None` applies it
    /// everywhere.
    pub contexts: Option<Vec<String>>,
    pub channels: Vec<ChannelProxy>,
    /// Per-target CDP script identifiers, for removal.
    pub cdp_ids: Vec<(TargetId, String)>,
}

impl PreloadScript {
    pub fn new(
        function_declaration: impl Into<String>,
        sandbox: Option<String>,
        contexts: Option<Vec<String>>,
        channels: Vec<ChannelProperties>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            function_declaration: function_declaration.into(),
            sandbox,
            contexts,
            channels: channels.into_iter().map(ChannelProxy::new).collect(),
            cdp_ids: Vec::new(),
        }
    }

    /// The source installed through `Page.addScriptToEvaluateOnNewDocument`:
    /// the user function invoked with one channel wrapper per declaration.
    pub fn source(&self) -> String {
        let args: Vec<String> = self
            .channels
            .iter()
            .map(ChannelProxy::wrapper_expression)
            .collect();
        format!("({})({});", self.function_declaration, args.join(", "))
    }

    pub fn applies_to(&self, top_level: &str) -> bool {
        match &self.contexts {
            Some(contexts) => contexts.iter().any(|c| c == top_level),
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<String, PreloadScript>,
    /// binding name → channel properties, for `Runtime.bindingCalled`
    /// dispatch. Channel proxies created for `script.callFunction`
    /// arguments register here too.
    channels: HashMap<String, ChannelProperties>,
}

#[derive(Debug, Clone, Default)]
pub struct PreloadScriptStorage {
    inner: Arc<Mutex<Inner>>,
}

impl PreloadScriptStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, script: PreloadScript) -> String {
        let mut inner = self.lock();
        for proxy in &script.channels {
            inner
                .channels
                .insert(proxy.binding.clone(), proxy.channel.clone());
        }
        let id = script.id.clone();
        inner.scripts.insert(id.clone(), script);
        id
    }

    pub fn remove(&self, id: &str) -> Result<PreloadScript> {
        let mut inner = self.lock();
        let script = inner
            .scripts
            .remove(id)
            .ok_or_else(|| Error::NoSuchScript(format!("no such preload script: {id}")))?;
        for proxy in &script.channels {
            inner.channels.remove(&proxy.binding);
        }
        Ok(script)
    }

    /// The scripts a freshly attached target must install, given its
    /// top-level context.
    pub fn scripts_for(&self, top_level: &str) -> Vec<PreloadScript> {
        let mut scripts: Vec<PreloadScript> = self
            .lock()
            .scripts
            .values()
            .filter(|s| s.applies_to(top_level))
            .cloned()
            .collect();
        scripts.sort_by(|a, b| a.id.cmp(&b.id));
        scripts
    }

    pub fn record_cdp_id(&self, script_id: &str, target: TargetId, cdp_id: String) {
        if let Some(script) = self.lock().scripts.get_mut(script_id) {
            script.cdp_ids.push((target, cdp_id));
        }
    }

    /// Register a standalone channel proxy (a `script.callFunction` channel
    /// argument).
    pub fn register_channel(&self, proxy: &ChannelProxy) {
        self.lock()
            .channels
            .insert(proxy.binding.clone(), proxy.channel.clone());
    }

    pub fn channel_for_binding(&self, binding: &str) -> Option<ChannelProperties> {
        self.lock().channels.get(binding).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("preload storage poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidi::script::{ResultOwnership, SerializationOptions};

    fn channel(id: &str) -> ChannelProperties {
        ChannelProperties {
            channel: id.to_string(),
            serialization_options: SerializationOptions::default(),
            ownership: ResultOwnership::None,
        }
    }

    #[test]
    fn source_wraps_declaration_with_channel_args() {
        let script = PreloadScript::new(
            "(send) => { send('ready'); }",
            None,
            None,
            vec![channel("chan-1")],
        );
        let source = script.source();
        assert!(source.starts_with("((send) => { send('ready'); })("));
        assert!(source.contains(&script.channels[0].binding));
    }

    #[test]
    fn context_filter() {
        let storage = PreloadScriptStorage::new();
        let everywhere = PreloadScript::new("() => {}", None, None, vec![]);
        let scoped = PreloadScript::new("() => {}", None, Some(vec!["top-a".into()]), vec![]);
        let scoped_id = storage.add(scoped);
        storage.add(everywhere);

        assert_eq!(storage.scripts_for("top-a").len(), 2);
        assert_eq!(storage.scripts_for("top-b").len(), 1);

        storage.remove(&scoped_id).unwrap();
        assert_eq!(storage.scripts_for("top-a").len(), 1);
        assert_eq!(storage.remove("missing").unwrap_err().code(), "no such script");
    }

    #[test]
    fn channel_bindings_resolve_until_removed() {
        let storage = PreloadScriptStorage::new();
        let script = PreloadScript::new("(send) => {}", None, None, vec![channel("chan-1")]);
        let binding = script.channels[0].binding.clone();
        let id = storage.add(script);

        assert_eq!(
            storage.channel_for_binding(&binding).unwrap().channel,
            "chan-1"
        );
        storage.remove(&id).unwrap();
        assert!(storage.channel_for_binding(&binding).is_none());
    }
}
