//! Static risk scanning of handler source.
//!
//! The scanner parses the file a handler's [`SourceRef`] points at, finds the
//! handler function and walks its body for writes to the LLM request, result
//! edits, stops, sends and persona mutations. When the source cannot be
//! scanned it degrades to the plugin's [`EffectManifest`], and failing that
//! to conservative effects assumed from the event type.

mod syntax;
mod visitor;

pub(crate) use syntax::{impl_type_name, persona_assign, persona_compound, persona_method};

use syntax::find_function;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use concord_core::EventType;
use concord_framework::{HandlerDescriptor, SourceOrigin, SourceRef};

use crate::callgraph::{self, PersonaMutation};
use crate::effect::{Confidence, Effect, EffectOperation, EffectTarget, HandlerEffects, Provenance};
use crate::error::ScanError;
use crate::manifest::EffectManifest;

use self::visitor::EffectVisitor;

/// A parsed source file and the label used in locations.
#[derive(Debug)]
pub(crate) struct ParsedSource {
    pub label: String,
    pub file: syn::File,
}

/// Infers handler side effects from source, manifests or the event type.
#[derive(Debug, Default)]
pub struct RiskScanner {
    manifests: RwLock<HashMap<String, EffectManifest>>,
    parsed: Mutex<HashMap<String, Arc<ParsedSource>>>,
    reported: Mutex<HashSet<String>>,
}

impl RiskScanner {
    /// Creates a scanner without manifests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an effect manifest (builder style).
    pub fn with_manifest(self, manifest: EffectManifest) -> Self {
        self.add_manifest(manifest);
        self
    }

    /// Adds or replaces the effect manifest of `manifest.plugin`.
    pub fn add_manifest(&self, manifest: EffectManifest) {
        self.manifests
            .write()
            .insert(manifest.plugin.clone(), manifest);
    }

    /// Drops the manifest of `plugin`, returning whether one was present.
    pub fn remove_manifest(&self, plugin: &str) -> bool {
        self.manifests.write().remove(plugin).is_some()
    }

    /// Drops cached parses, e.g. after a plugin reload.
    pub fn invalidate(&self) {
        self.parsed.lock().clear();
    }

    /// Scans one handler, degrading to its manifest or the fallback policy.
    ///
    /// Never fails: scan errors are logged once per distinct cause and
    /// recorded in [`HandlerEffects::degraded`].
    pub fn scan(&self, handler: &HandlerDescriptor) -> HandlerEffects {
        let err = match self.scan_source(handler) {
            Ok(effects) => {
                debug!(
                    handler = %handler.full_name,
                    effects = effects.len(),
                    "Scanned handler source"
                );
                return HandlerEffects::new(effects, Provenance::Source, None);
            }
            Err(err) => err,
        };

        self.report_once(&err);
        let degraded = Some(err.to_string());
        let declared = self
            .manifests
            .read()
            .get(&handler.module_path)
            .and_then(|m| m.effects_for(&handler.handler_name));
        match declared {
            Some(effects) => HandlerEffects::new(effects, Provenance::Manifest, degraded),
            None => HandlerEffects::new(
                fallback_effects(handler.event_type),
                Provenance::Fallback,
                degraded,
            ),
        }
    }

    /// Scans the handler's source without degrading.
    pub fn scan_source(&self, handler: &HandlerDescriptor) -> Result<Vec<Effect>, ScanError> {
        let source = handler
            .source
            .as_ref()
            .ok_or_else(|| ScanError::SourceUnavailable {
                target: handler.full_name.clone(),
                reason: "no source reference".to_string(),
            })?;
        let parsed = self.load(&source.origin)?;
        let found = find_function(&parsed.file.items, &source.function, source.impl_type.as_deref())
            .ok_or_else(|| ScanError::FunctionNotFound {
                function: source.function.clone(),
                origin: parsed.label.clone(),
            })?;
        Ok(EffectVisitor::scan(&parsed.label, found.sig, found.block))
    }

    /// Finds persona mutations reachable from initialization entry points in
    /// the file `source` points at.
    pub fn scan_persona(
        &self,
        source: &SourceRef,
        max_depth: usize,
    ) -> Result<Vec<PersonaMutation>, ScanError> {
        let parsed = self.load(&source.origin)?;
        Ok(callgraph::persona_mutations(
            &parsed.file.items,
            &parsed.label,
            max_depth,
        ))
    }

    pub(crate) fn load(&self, origin: &SourceOrigin) -> Result<Arc<ParsedSource>, ScanError> {
        let key = cache_key(origin);
        if let Some(hit) = self.parsed.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let (label, text) = match origin {
            SourceOrigin::File(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ScanError::unreadable(path, &e))?;
                (path.display().to_string(), text)
            }
            SourceOrigin::Inline(text) => ("<inline>".to_string(), text.to_string()),
        };
        let file = syn::parse_file(&text).map_err(|e| ScanError::Parse {
            origin: label.clone(),
            message: e.to_string(),
        })?;

        let parsed = Arc::new(ParsedSource { label, file });
        self.parsed.lock().insert(key, Arc::clone(&parsed));
        Ok(parsed)
    }

    fn report_once(&self, err: &ScanError) {
        if self.reported.lock().insert(err.to_string()) {
            warn!(cause = %err, "Static scan degraded, using declared or assumed effects");
        }
    }
}

fn cache_key(origin: &SourceOrigin) -> String {
    match origin {
        SourceOrigin::File(path) => path.display().to_string(),
        SourceOrigin::Inline(text) => {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            format!("inline:{}", hex::encode(hasher.finalize()))
        }
    }
}

/// Conservative effects assumed when a handler cannot be scanned.
///
/// LLM request hooks may touch the prompt and system prompt, decorating
/// hooks may touch the result chain, and anything else is unknown. All
/// fallback effects carry low confidence and the `unknown` operation.
pub fn fallback_effects(event_type: EventType) -> Vec<Effect> {
    let evidence = format!("fallback:{event_type}");
    let targets: &[EffectTarget] = match event_type {
        EventType::OnLlmRequest => &[EffectTarget::Prompt, EffectTarget::SystemPrompt],
        EventType::OnDecoratingResult => &[EffectTarget::ResultChain],
        _ => &[EffectTarget::Unknown],
    };
    targets
        .iter()
        .map(|&target| Effect::new(target, EffectOperation::Unknown, Confidence::Low, evidence.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use concord_core::EventType;
    use concord_framework::{HandlerDescriptor, SourceRef, into_handler};

    use super::*;

    const PLUGIN_SRC: &str = r#"
use concord_framework::{HandlerCall, HandlerResult};

pub async fn inject_style(call: HandlerCall) -> HandlerResult {
    if let Some(req) = &call.request {
        req.lock().system_prompt.push_str("\nAnswer briefly.");
    }
    Ok(())
}

pub struct Guard;

impl Guard {
    pub async fn block(&self, call: HandlerCall) -> HandlerResult {
        call.ctx.stop_event();
        Ok(())
    }
}
"#;

    fn handler(name: &str, event_type: EventType) -> HandlerDescriptor {
        HandlerDescriptor::new(event_type, "plugins.style", name, into_handler(|_| async { Ok(()) }))
    }

    #[test]
    fn test_scan_inline_source() {
        let scanner = RiskScanner::new();
        let h = handler("inject_style", EventType::OnLlmRequest)
            .with_source(SourceRef::inline(PLUGIN_SRC, "inject_style"));
        let result = scanner.scan(&h);
        assert_eq!(result.provenance, Provenance::Source);
        assert!(result.degraded.is_none());
        let effect = result.on(EffectTarget::SystemPrompt).next().unwrap();
        assert_eq!(effect.operation, EffectOperation::Append);
        assert_eq!(effect.location.as_ref().unwrap().line, 6);
    }

    #[test]
    fn test_scan_method_in_impl() {
        let scanner = RiskScanner::new();
        let h = handler("block", EventType::AdapterMessage)
            .with_source(SourceRef::inline(PLUGIN_SRC, "block").in_impl("Guard"));
        let result = scanner.scan(&h);
        assert!(result.risk.may_stop);
        assert_eq!(result.confidence_of(EffectTarget::Stop), Some(Confidence::High));
    }

    #[test]
    fn test_missing_source_falls_back() {
        let scanner = RiskScanner::new();
        let result = scanner.scan(&handler("inject_style", EventType::OnLlmRequest));
        assert_eq!(result.provenance, Provenance::Fallback);
        assert!(result.degraded.is_some());
        assert!(!result.risk.may_mutate_prompt && result.risk.unknown);
        assert!(result.effects.iter().all(|e| e.confidence == Confidence::Low));

        let result = scanner.scan(&handler("x", EventType::OnDecoratingResult));
        assert_eq!(result.effects[0].target, EffectTarget::ResultChain);
    }

    #[test]
    fn test_manifest_wins_over_fallback() {
        let scanner = RiskScanner::new().with_manifest(
            EffectManifest::new("plugins.style").declare(
                "inject_style",
                EffectTarget::SystemPrompt,
                EffectOperation::Overwrite,
            ),
        );
        let h = handler("inject_style", EventType::OnLlmRequest)
            .with_source(SourceRef::file("/nonexistent/plugin.rs", "inject_style"));
        let result = scanner.scan(&h);
        assert_eq!(result.provenance, Provenance::Manifest);
        assert!(result.degraded.as_deref().unwrap().contains("/nonexistent/plugin.rs"));
    }

    #[test]
    fn test_unknown_function_and_parse_error() {
        let scanner = RiskScanner::new();
        let h = handler("missing", EventType::OnLlmRequest)
            .with_source(SourceRef::inline(PLUGIN_SRC, "missing"));
        assert!(matches!(
            scanner.scan_source(&h),
            Err(ScanError::FunctionNotFound { .. })
        ));

        let h = handler("x", EventType::OnLlmRequest)
            .with_source(SourceRef::inline(Arc::<str>::from("fn broken( {"), "x"));
        assert!(matches!(scanner.scan_source(&h), Err(ScanError::Parse { .. })));
        assert_eq!(scanner.scan(&h).provenance, Provenance::Fallback);
    }
}
