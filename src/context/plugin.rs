//! The plugin seam. A plugin contributes one component to the assembled
//! prompt and may be asked to give tokens back under budget pressure.
//! Plugins never hold a reference to the manager; everything they need
//! arrives through the call.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::error::AgentError;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// A named block of prompt content. Priority is the compaction order —
/// higher goes first; 0 marks never-compactable content.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub content: String,
    pub priority: u32,
    pub compactable: bool,
    pub metadata: Option<Value>,
}

impl Component {
    pub fn new(name: impl Into<String>, content: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            priority,
            compactable: priority > 0,
            metadata: None,
        }
    }

    /// Content that must survive every compaction pass.
    pub fn pinned(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            priority: 0,
            compactable: false,
            metadata: None,
        }
    }
}

pub trait ContextPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Compaction priority of the contributed component.
    fn priority(&self) -> u32;

    fn compactable(&self) -> bool {
        true
    }

    /// The component to splice into the prompt, or `None` to sit this
    /// iteration out.
    fn component(&mut self) -> Result<Option<Component>, PluginError>;

    /// Shed tokens. Returns how many were freed.
    fn compact(&mut self, _target_tokens: u32) -> Result<u32, PluginError> {
        Ok(0)
    }

    fn state(&self) -> Option<Value> {
        None
    }

    fn restore_state(&mut self, _blob: &Value) {}

    fn destroy(&mut self) {}
}

/// Owns registered plugins, enforces name uniqueness, and shields
/// `prepare` from their failures.
#[derive(Default)]
pub struct PluginHost {
    plugins: Vec<Box<dyn ContextPlugin>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn ContextPlugin>) -> Result<(), AgentError> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(AgentError::Configuration(format!(
                "duplicate plugin name: {}",
                plugin.name()
            )));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    /// Collect components in registration order. A failing plugin is
    /// logged and skipped — prepare never aborts on plugin errors.
    pub fn components(&mut self) -> Vec<Component> {
        let mut components = Vec::new();
        for plugin in &mut self.plugins {
            match plugin.component() {
                Ok(Some(component)) => components.push(component),
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = plugin.name(), error = %e, "plugin component failed, skipping");
                }
            }
        }
        components
    }

    /// Ask one plugin to shed tokens. Failures count as zero freed.
    pub fn compact_plugin(&mut self, name: &str, target_tokens: u32) -> u32 {
        for plugin in &mut self.plugins {
            if plugin.name() == name {
                return match plugin.compact(target_tokens) {
                    Ok(freed) => freed,
                    Err(e) => {
                        warn!(plugin = name, error = %e, "plugin compact failed");
                        0
                    }
                };
            }
        }
        0
    }

    pub fn states(&self) -> BTreeMap<String, Value> {
        self.plugins
            .iter()
            .filter_map(|p| p.state().map(|s| (p.name().to_string(), s)))
            .collect()
    }

    pub fn restore_states(&mut self, states: &BTreeMap<String, Value>) {
        for plugin in &mut self.plugins {
            if let Some(blob) = states.get(plugin.name()) {
                plugin.restore_state(blob);
            }
        }
    }

    pub fn destroy_all(&mut self) {
        for plugin in &mut self.plugins {
            plugin.destroy();
        }
        self.plugins.clear();
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticPlugin {
        name: &'static str,
        fail: bool,
        compacted: u32,
    }

    impl StaticPlugin {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                fail: false,
                compacted: 0,
            }
        }
    }

    impl ContextPlugin for StaticPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> u32 {
            7
        }

        fn component(&mut self) -> Result<Option<Component>, PluginError> {
            if self.fail {
                return Err(PluginError("boom".into()));
            }
            Ok(Some(Component::new(self.name, "content", self.priority())))
        }

        fn compact(&mut self, target: u32) -> Result<u32, PluginError> {
            self.compacted += target;
            Ok(target / 2)
        }

        fn state(&self) -> Option<Value> {
            Some(json!({"compacted": self.compacted}))
        }

        fn restore_state(&mut self, blob: &Value) {
            self.compacted = blob["compacted"].as_u64().unwrap_or(0) as u32;
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut host = PluginHost::new();
        host.register(Box::new(StaticPlugin::new("alpha"))).unwrap();
        let err = host
            .register(Box::new(StaticPlugin::new("alpha")))
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[test]
    fn failing_plugin_is_skipped_not_fatal() {
        let mut host = PluginHost::new();
        host.register(Box::new(StaticPlugin::new("good"))).unwrap();
        let mut bad = StaticPlugin::new("bad");
        bad.fail = true;
        host.register(Box::new(bad)).unwrap();

        let components = host.components();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "good");
    }

    #[test]
    fn compact_routes_by_name() {
        let mut host = PluginHost::new();
        host.register(Box::new(StaticPlugin::new("alpha"))).unwrap();
        assert_eq!(host.compact_plugin("alpha", 100), 50);
        assert_eq!(host.compact_plugin("missing", 100), 0);
    }

    #[test]
    fn state_collection_roundtrip() {
        let mut host = PluginHost::new();
        host.register(Box::new(StaticPlugin::new("alpha"))).unwrap();
        host.compact_plugin("alpha", 10);

        let states = host.states();
        assert_eq!(states["alpha"]["compacted"], 10);

        let mut fresh = PluginHost::new();
        fresh.register(Box::new(StaticPlugin::new("alpha"))).unwrap();
        fresh.restore_states(&states);
        assert_eq!(fresh.states()["alpha"]["compacted"], 10);
    }

    #[test]
    fn pinned_component_is_never_compactable() {
        let c = Component::pinned("system_prompt", "you are…");
        assert_eq!(c.priority, 0);
        assert!(!c.compactable);
    }
}
