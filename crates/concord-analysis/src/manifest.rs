//! Declared effects for plugins whose source cannot be scanned.
//!
//! ```toml
//! plugin = "plugins.persona_tools"
//!
//! [[handlers.inject_style]]
//! target = "llm_request.system_prompt"
//! operation = "append"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::effect::{Confidence, Effect, EffectOperation, EffectTarget};

fn default_confidence() -> Confidence {
    Confidence::Medium
}

/// One declared effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredEffect {
    /// Target path.
    pub target: EffectTarget,
    /// Operation.
    pub operation: EffectOperation,
    /// Declared confidence, medium unless stated.
    #[serde(default = "default_confidence")]
    pub confidence: Confidence,
}

/// Effects declared by one plugin, keyed by handler name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectManifest {
    /// Module id of the plugin.
    pub plugin: String,
    /// Declared effects per short handler name.
    #[serde(default)]
    pub handlers: BTreeMap<String, Vec<DeclaredEffect>>,
}

impl EffectManifest {
    /// Creates an empty manifest for `plugin`.
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Declares an effect (builder style).
    pub fn declare(
        mut self,
        handler: impl Into<String>,
        target: EffectTarget,
        operation: EffectOperation,
    ) -> Self {
        self.handlers
            .entry(handler.into())
            .or_default()
            .push(DeclaredEffect {
                target,
                operation,
                confidence: default_confidence(),
            });
        self
    }

    /// The declared effects of `handler_name`, if the manifest covers it.
    pub fn effects_for(&self, handler_name: &str) -> Option<Vec<Effect>> {
        self.handlers.get(handler_name).map(|declared| {
            declared
                .iter()
                .map(|d| Effect::new(d.target, d.operation, d.confidence, "manifest"))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_default_confidence() {
        let manifest: EffectManifest = serde_json::from_str(
            r#"{
                "plugin": "p",
                "handlers": {
                    "inject": [{"target": "llm_request.system_prompt", "operation": "append"}]
                }
            }"#,
        )
        .unwrap();
        let effects = manifest.effects_for("inject").unwrap();
        assert_eq!(effects[0].target, EffectTarget::SystemPrompt);
        assert_eq!(effects[0].confidence, Confidence::Medium);
        assert!(manifest.effects_for("other").is_none());
    }
}
