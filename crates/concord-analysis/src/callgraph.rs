//! Bounded call-graph walk for persona mutations made outside dispatch.
//!
//! A plugin that rewrites persona prompts while loading changes every later
//! LLM request without any handler showing it. The walk starts at the usual
//! initialization entry points and follows `Self::f()`, `Type::f()` and
//! `f()` calls, and method calls naming a method of the enclosing type, into
//! functions of the same file.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use syn::visit::{self, Visit};
use syn::{Block, Expr, ExprAssign, ExprBinary, ExprCall, ExprMethodCall, ImplItem, Item};

use crate::effect::{EffectOperation, SourceLocation};
use crate::scanner::{impl_type_name, persona_assign, persona_compound, persona_method};

/// Function names treated as initialization entry points.
pub const ENTRY_POINTS: &[&str] = &["new", "init", "initialize", "on_load", "setup"];

/// A persona mutation reachable from an entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaMutation {
    /// Functions from the entry point to the mutating function.
    pub call_chain: Vec<String>,
    /// How the persona prompt is touched.
    pub operation: EffectOperation,
    /// The rule that matched.
    pub evidence: String,
    /// Where the mutation happens.
    pub location: SourceLocation,
}

struct FnEntry<'a> {
    owner: Option<String>,
    block: &'a Block,
}

fn index_items<'a>(items: &'a [Item], out: &mut HashMap<String, FnEntry<'a>>) {
    for item in items {
        match item {
            Item::Fn(f) => {
                out.entry(f.sig.ident.to_string()).or_insert(FnEntry {
                    owner: None,
                    block: &f.block,
                });
            }
            Item::Impl(imp) => {
                let Some(owner) = impl_type_name(imp) else { continue };
                for member in &imp.items {
                    if let ImplItem::Fn(f) = member {
                        out.entry(format!("{owner}::{}", f.sig.ident))
                            .or_insert(FnEntry {
                                owner: Some(owner.clone()),
                                block: &f.block,
                            });
                    }
                }
            }
            Item::Mod(m) => {
                if let Some((_, inner)) = &m.content {
                    index_items(inner, out);
                }
            }
            _ => {}
        }
    }
}

/// Collects persona hits and outgoing calls of one function body.
struct BodyWalker<'o> {
    owner: Option<&'o str>,
    file: &'o str,
    callees: Vec<String>,
    hits: Vec<(EffectOperation, String, SourceLocation)>,
}

impl BodyWalker<'_> {
    fn record(&mut self, hit: Option<(EffectOperation, String, proc_macro2::Span)>) {
        if let Some((op, evidence, span)) = hit {
            self.hits
                .push((op, evidence, SourceLocation::from_span(self.file, span)));
        }
    }
}

impl<'ast> Visit<'ast> for BodyWalker<'_> {
    fn visit_expr_method_call(&mut self, node: &'ast ExprMethodCall) {
        // Resolved against the index later; unknown methods are dropped.
        if let Some(owner) = self.owner {
            self.callees.push(format!("{owner}::{}", node.method));
        }
        self.record(persona_method(node));
        visit::visit_expr_method_call(self, node);
    }

    fn visit_expr_call(&mut self, node: &'ast ExprCall) {
        if let Expr::Path(p) = &*node.func {
            let segments: Vec<String> = p.path.segments.iter().map(|s| s.ident.to_string()).collect();
            match segments.as_slice() {
                [name] => self.callees.push(name.clone()),
                [ty, name] if ty == "Self" => {
                    if let Some(owner) = self.owner {
                        self.callees.push(format!("{owner}::{name}"));
                    }
                }
                [ty, name] => self.callees.push(format!("{ty}::{name}")),
                _ => {}
            }
        }
        visit::visit_expr_call(self, node);
    }

    fn visit_expr_assign(&mut self, node: &'ast ExprAssign) {
        self.record(persona_assign(node));
        visit::visit_expr_assign(self, node);
    }

    fn visit_expr_binary(&mut self, node: &'ast ExprBinary) {
        self.record(persona_compound(node));
        visit::visit_expr_binary(self, node);
    }
}

/// Walks from every entry point in `items`, at most `max_depth` calls deep.
///
/// The walk is breadth-first from all entry points at once, so each function
/// is expanded at its shortest distance from any entry point and a mutation
/// is reported with a shortest chain.
pub(crate) fn persona_mutations(items: &[Item], file: &str, max_depth: usize) -> Vec<PersonaMutation> {
    let mut index = HashMap::new();
    index_items(items, &mut index);

    let mut roots: Vec<&String> = index
        .keys()
        .filter(|key| {
            let name = key.rsplit("::").next().unwrap_or(key.as_str());
            ENTRY_POINTS.contains(&name)
        })
        .collect();
    roots.sort();

    let mut visited: HashSet<String> = roots.iter().map(|r| (*r).clone()).collect();
    let mut queue: VecDeque<(String, Vec<String>)> = roots
        .into_iter()
        .map(|root| (root.clone(), vec![root.clone()]))
        .collect();

    let mut found = Vec::new();
    while let Some((key, chain)) = queue.pop_front() {
        let Some(entry) = index.get(&key) else { continue };
        let mut walker = BodyWalker {
            owner: entry.owner.as_deref(),
            file,
            callees: Vec::new(),
            hits: Vec::new(),
        };
        walker.visit_block(entry.block);

        for (operation, evidence, location) in walker.hits {
            found.push(PersonaMutation {
                call_chain: chain.clone(),
                operation,
                evidence,
                location,
            });
        }
        if chain.len() > max_depth {
            continue;
        }
        for callee in walker.callees {
            if index.contains_key(&callee) && visited.insert(callee.clone()) {
                let mut next = chain.clone();
                next.push(callee.clone());
                queue.push_back((callee, next));
            }
        }
    }
    found.sort_by(|a, b| a.location.cmp(&b.location));
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"
pub struct StylePlugin { personas: PersonaStore }

impl StylePlugin {
    pub fn new(personas: PersonaStore) -> Self {
        let plugin = Self { personas };
        plugin.install();
        plugin
    }

    fn install(&self) {
        Self::rewrite(&self.personas);
    }

    fn rewrite(store: &PersonaStore) {
        deep_edit(store);
    }

    fn unrelated(&self) {
        self.personas.set_persona_prompt("x", "never reached");
    }
}

fn deep_edit(store: &PersonaStore) {
    store.update_persona("default", "You are terse.");
}
"#;

    fn items() -> Vec<Item> {
        syn::parse_file(SRC).unwrap().items
    }

    #[test]
    fn test_follows_calls_from_entry_point() {
        let found = persona_mutations(&items(), "<inline>", 5);
        assert_eq!(found.len(), 1);
        let m = &found[0];
        assert_eq!(
            m.call_chain,
            vec!["StylePlugin::new", "StylePlugin::install", "StylePlugin::rewrite", "deep_edit"]
        );
        assert_eq!(m.operation, EffectOperation::Overwrite);
        assert_eq!(m.location.line, 25);
    }

    #[test]
    fn test_shortest_path_reaches_mutation() {
        let src = r#"
fn init(store: &PersonaStore) {
    prepare(store);
    helper(store);
}

fn prepare(store: &PersonaStore) {
    stage_two(store);
}

fn stage_two(store: &PersonaStore) {
    helper(store);
}

fn helper(store: &PersonaStore) {
    edit(store);
}

fn edit(store: &PersonaStore) {
    store.update_persona("default", "Be brief.");
}
"#;
        let items = syn::parse_file(src).unwrap().items;
        let found = persona_mutations(&items, "<inline>", 3);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].call_chain, vec!["init", "helper", "edit"]);
    }

    #[test]
    fn test_depth_bound() {
        assert!(persona_mutations(&items(), "<inline>", 2).is_empty());
        assert_eq!(persona_mutations(&items(), "<inline>", 3).len(), 1);
    }
}
