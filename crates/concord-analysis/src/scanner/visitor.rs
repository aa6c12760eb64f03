//! Syntax-tree walk that turns a handler body into effects.

use std::collections::HashMap;

use proc_macro2::Span;
use syn::visit::{self, Visit};
use syn::{
    Arm, BinOp, Block, Expr, ExprAssign, ExprAsync, ExprBinary, ExprClosure, ExprForLoop, ExprIf,
    ExprLet, ExprLoop, ExprMatch, ExprMethodCall, ExprWhile, FnArg, ItemFn, Local, Member,
    Signature,
};

use super::syntax::{
    PersonaHit, field_name, list_operation, member_span, pattern_idents, peel, persona_assign,
    persona_compound, persona_method, reads_field, text_operation, type_mentions,
};
use crate::effect::{Confidence, Effect, EffectOperation, EffectTarget, SourceLocation};

/// What a local binding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// The `HandlerCall` argument.
    Call,
    /// The event context.
    Event,
    /// The LLM request (shared or locked).
    Request,
    /// The result's segment list.
    ResultChain,
    /// A field of the LLM request.
    Field(EffectTarget),
}

/// Methods that return the receiver (or a guard / handle to it).
const PASSTHROUGH: &[&str] = &[
    "lock", "as_ref", "as_mut", "unwrap", "expect", "as_deref", "as_deref_mut", "borrow_mut",
    "write", "deref_mut", "get_mut",
];

/// Methods that clone a shared handle; a cloned `String` or list is a copy.
const HANDLE_CLONE: &[&str] = &["clone", "to_owned"];

fn field_role(base: Role, name: &str) -> Option<Role> {
    match (base, name) {
        (Role::Call, "ctx") => Some(Role::Event),
        (Role::Call, "request") => Some(Role::Request),
        (Role::Request, "prompt") => Some(Role::Field(EffectTarget::Prompt)),
        (Role::Request, "system_prompt") => Some(Role::Field(EffectTarget::SystemPrompt)),
        (Role::Request, "extra_user_content_parts") => {
            Some(Role::Field(EffectTarget::ExtraContentParts))
        }
        (Role::Request, "contexts") => Some(Role::Field(EffectTarget::Contexts)),
        _ => None,
    }
}

fn method_role(base: Role, method: &str) -> Option<Role> {
    if PASSTHROUGH.contains(&method) {
        return Some(base);
    }
    match base {
        Role::Call | Role::Event | Role::Request if HANDLE_CLONE.contains(&method) => Some(base),
        Role::Call if method == "event" => Some(Role::Event),
        Role::Event if method == "result_chain" => Some(Role::ResultChain),
        _ => None,
    }
}

fn name_role(name: &str) -> Option<Role> {
    match name {
        "call" => Some(Role::Call),
        "ctx" | "event" | "context" | "evt" => Some(Role::Event),
        "req" | "request" | "llm_request" => Some(Role::Request),
        _ => None,
    }
}

fn event_effect(method: &str) -> Option<(EffectTarget, EffectOperation)> {
    match method {
        "stop_event" => Some((EffectTarget::Stop, EffectOperation::Call)),
        "send" | "send_streaming" => Some((EffectTarget::Send, EffectOperation::Call)),
        "react" => Some((EffectTarget::React, EffectOperation::Call)),
        "request_llm" => Some((EffectTarget::LlmRequest, EffectOperation::Call)),
        "set_result" => Some((EffectTarget::Result, EffectOperation::Overwrite)),
        "clear_result" => Some((EffectTarget::Result, EffectOperation::Clear)),
        _ => None,
    }
}

/// Walks one function body.
pub(crate) struct EffectVisitor<'f> {
    file: &'f str,
    /// `None` marks a name rebound to something unrelated.
    aliases: HashMap<String, Option<Role>>,
    branch_depth: usize,
    deferred_depth: usize,
    effects: Vec<Effect>,
}

impl<'f> EffectVisitor<'f> {
    /// Infers the effects of the function with signature `sig` and body `block`.
    pub(crate) fn scan(file: &'f str, sig: &Signature, block: &Block) -> Vec<Effect> {
        let mut visitor = Self {
            file,
            aliases: HashMap::new(),
            branch_depth: 0,
            deferred_depth: 0,
            effects: Vec::new(),
        };
        visitor.bind_params(sig);
        visitor.visit_block(block);
        visitor.effects
    }

    fn bind_params(&mut self, sig: &Signature) {
        for input in &sig.inputs {
            let FnArg::Typed(arg) = input else { continue };
            let role = if type_mentions(&arg.ty, "HandlerCall") {
                Some(Role::Call)
            } else if type_mentions(&arg.ty, "EventContext") {
                Some(Role::Event)
            } else if type_mentions(&arg.ty, "SharedRequest")
                || type_mentions(&arg.ty, "ProviderRequest")
            {
                Some(Role::Request)
            } else {
                None
            };
            self.bind(&arg.pat, role);
        }
    }

    fn bind(&mut self, pat: &syn::Pat, role: Option<Role>) {
        let mut names = Vec::new();
        pattern_idents(pat, &mut names);
        for name in names {
            self.aliases.insert(name, role);
        }
    }

    fn lookup(&self, name: &str) -> Option<Role> {
        match self.aliases.get(name) {
            Some(role) => *role,
            None => name_role(name),
        }
    }

    fn role_of(&self, expr: &Expr) -> Option<Role> {
        match expr {
            Expr::Path(p) => p
                .path
                .get_ident()
                .and_then(|ident| self.lookup(&ident.to_string())),
            Expr::Paren(p) => self.role_of(&p.expr),
            Expr::Group(g) => self.role_of(&g.expr),
            Expr::Reference(r) => self.role_of(&r.expr),
            Expr::Unary(u) if matches!(u.op, syn::UnOp::Deref(_)) => self.role_of(&u.expr),
            Expr::Try(t) => self.role_of(&t.expr),
            Expr::Await(a) => self.role_of(&a.base),
            Expr::Field(f) => {
                let base = self.role_of(&f.base)?;
                match &f.member {
                    Member::Named(name) => field_role(base, &name.to_string()),
                    Member::Unnamed(_) => None,
                }
            }
            Expr::MethodCall(m) => {
                let base = self.role_of(&m.receiver)?;
                method_role(base, &m.method.to_string())
            }
            _ => None,
        }
    }

    fn confidence(&self) -> Confidence {
        if self.deferred_depth > 0 {
            Confidence::Low
        } else if self.branch_depth > 0 {
            Confidence::Medium
        } else {
            Confidence::High
        }
    }

    fn emit(&mut self, target: EffectTarget, operation: EffectOperation, evidence: String, span: Span) {
        let effect = Effect::new(target, operation, self.confidence(), evidence)
            .at(SourceLocation::from_span(self.file, span));
        self.effects.push(effect);
    }

    fn in_branch(&mut self, f: impl FnOnce(&mut Self)) {
        self.branch_depth += 1;
        f(self);
        self.branch_depth -= 1;
    }

    fn deferred(&mut self, f: impl FnOnce(&mut Self)) {
        self.deferred_depth += 1;
        f(self);
        self.deferred_depth -= 1;
    }

    fn record_persona(&mut self, hit: Option<PersonaHit>) {
        if let Some((operation, evidence, span)) = hit {
            self.emit(EffectTarget::PersonaPrompt, operation, evidence, span);
        }
    }
}

impl<'ast> Visit<'ast> for EffectVisitor<'_> {
    fn visit_expr_method_call(&mut self, node: &'ast ExprMethodCall) {
        let method = node.method.to_string();
        let found = match self.role_of(&node.receiver) {
            Some(Role::Event) => event_effect(&method),
            Some(Role::ResultChain) => {
                list_operation(&method).map(|op| (EffectTarget::ResultChain, op))
            }
            Some(Role::Field(target)) if target.is_prompt_text() => {
                text_operation(&method).map(|op| (target, op))
            }
            Some(Role::Field(target)) => list_operation(&method).map(|op| (target, op)),
            _ => None,
        };
        if let Some((target, operation)) = found {
            self.emit(target, operation, format!("method:{method}"), node.method.span());
        }
        self.record_persona(persona_method(node));
        visit::visit_expr_method_call(self, node);
    }

    fn visit_expr_assign(&mut self, node: &'ast ExprAssign) {
        let left = &*node.left;
        // A bare identifier on the left only rebinds a local.
        if !matches!(peel(left), Expr::Path(_)) || matches!(left, Expr::Unary(_)) {
            match self.role_of(left) {
                Some(Role::Field(target)) => {
                    let self_concat = field_name(peel(left))
                        .is_some_and(|name| reads_field(&node.right, &name));
                    let (operation, evidence) = if self_concat && target.is_prompt_text() {
                        (EffectOperation::Append, "assign:self_concat")
                    } else {
                        (EffectOperation::Overwrite, "assign")
                    };
                    self.emit(target, operation, evidence.to_string(), member_span(left));
                }
                Some(Role::ResultChain) => {
                    self.emit(
                        EffectTarget::ResultChain,
                        EffectOperation::Overwrite,
                        "assign".to_string(),
                        member_span(left),
                    );
                }
                _ => {}
            }
        }
        self.record_persona(persona_assign(node));
        visit::visit_expr_assign(self, node);
    }

    fn visit_expr_binary(&mut self, node: &'ast ExprBinary) {
        if matches!(node.op, BinOp::AddAssign(_)) {
            if let Some(Role::Field(target)) = self.role_of(&node.left) {
                self.emit(
                    target,
                    EffectOperation::Append,
                    "compound_assign".to_string(),
                    member_span(&node.left),
                );
            }
            self.record_persona(persona_compound(node));
        }
        visit::visit_expr_binary(self, node);
    }

    fn visit_local(&mut self, node: &'ast Local) {
        let mut role = None;
        if let Some(init) = &node.init {
            self.visit_expr(&init.expr);
            role = self.role_of(&init.expr);
            if let Some((_, diverge)) = &init.diverge {
                self.in_branch(|v| v.visit_expr(diverge));
            }
        }
        self.bind(&node.pat, role);
    }

    fn visit_expr_let(&mut self, node: &'ast ExprLet) {
        self.visit_expr(&node.expr);
        let role = self.role_of(&node.expr);
        self.bind(&node.pat, role);
    }

    fn visit_expr_if(&mut self, node: &'ast ExprIf) {
        self.visit_expr(&node.cond);
        self.in_branch(|v| {
            v.visit_block(&node.then_branch);
            if let Some((_, else_branch)) = &node.else_branch {
                v.visit_expr(else_branch);
            }
        });
    }

    fn visit_expr_match(&mut self, node: &'ast ExprMatch) {
        self.visit_expr(&node.expr);
        let scrutinee = self.role_of(&node.expr);
        self.in_branch(|v| {
            for arm in &node.arms {
                v.bind(&arm.pat, scrutinee);
                v.visit_arm(arm);
            }
        });
    }

    fn visit_arm(&mut self, node: &'ast Arm) {
        if let Some((_, guard)) = &node.guard {
            self.visit_expr(guard);
        }
        self.visit_expr(&node.body);
    }

    fn visit_expr_for_loop(&mut self, node: &'ast ExprForLoop) {
        self.visit_expr(&node.expr);
        self.in_branch(|v| v.visit_block(&node.body));
    }

    fn visit_expr_while(&mut self, node: &'ast ExprWhile) {
        self.visit_expr(&node.cond);
        self.in_branch(|v| v.visit_block(&node.body));
    }

    fn visit_expr_loop(&mut self, node: &'ast ExprLoop) {
        self.in_branch(|v| v.visit_block(&node.body));
    }

    fn visit_expr_closure(&mut self, node: &'ast ExprClosure) {
        self.deferred(|v| visit::visit_expr_closure(v, node));
    }

    fn visit_expr_async(&mut self, node: &'ast ExprAsync) {
        self.deferred(|v| visit::visit_expr_async(v, node));
    }

    fn visit_item_fn(&mut self, node: &'ast ItemFn) {
        let saved = std::mem::take(&mut self.aliases);
        self.deferred(|v| {
            v.bind_params(&node.sig);
            v.visit_block(&node.block);
        });
        self.aliases = saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(src: &str) -> Vec<Effect> {
        let item: ItemFn = syn::parse_str(src).unwrap();
        EffectVisitor::scan("<inline>", &item.sig, &item.block)
    }

    fn has(effects: &[Effect], target: EffectTarget, op: EffectOperation, conf: Confidence) -> bool {
        effects
            .iter()
            .any(|e| e.target == target && e.operation == op && e.confidence == conf)
    }

    #[test]
    fn test_system_prompt_append_and_overwrite() {
        let effects = scan(
            r#"async fn h(call: HandlerCall) -> HandlerResult {
                if let Some(req) = &call.request {
                    let mut req = req.lock();
                    req.system_prompt.push_str("style");
                }
                Ok(())
            }"#,
        );
        assert!(has(&effects, EffectTarget::SystemPrompt, EffectOperation::Append, Confidence::Medium));

        let effects = scan(
            r#"async fn h(call: HandlerCall) -> HandlerResult {
                let req = call.request.clone().unwrap();
                req.lock().system_prompt = String::from("x");
                Ok(())
            }"#,
        );
        assert!(has(&effects, EffectTarget::SystemPrompt, EffectOperation::Overwrite, Confidence::High));
    }

    #[test]
    fn test_self_concat_is_append() {
        let effects = scan(
            r#"fn h(req: &mut ProviderRequest) {
                req.system_prompt = format!("{}\n{}", req.system_prompt, "more");
                req.prompt += "!";
            }"#,
        );
        assert!(has(&effects, EffectTarget::SystemPrompt, EffectOperation::Append, Confidence::High));
        assert!(has(&effects, EffectTarget::Prompt, EffectOperation::Append, Confidence::High));
    }

    #[test]
    fn test_event_calls() {
        let effects = scan(
            r#"async fn h(ctx: Arc<EventContext>) -> HandlerResult {
                ctx.send(MessageChain::new().text("hi")).await?;
                ctx.stop_event();
                ctx.result_chain().clear();
                Ok(())
            }"#,
        );
        assert!(has(&effects, EffectTarget::Send, EffectOperation::Call, Confidence::High));
        assert!(has(&effects, EffectTarget::Stop, EffectOperation::Call, Confidence::High));
        assert!(has(&effects, EffectTarget::ResultChain, EffectOperation::Clear, Confidence::High));
        let loc = effects[0].location.as_ref().unwrap();
        assert_eq!(loc.line, 2);
    }

    #[test]
    fn test_closure_is_low_confidence() {
        let effects = scan(
            r#"async fn h(call: HandlerCall) -> HandlerResult {
                let ctx = call.ctx.clone();
                tokio::spawn(async move { ctx.stop_event(); });
                Ok(())
            }"#,
        );
        assert!(has(&effects, EffectTarget::Stop, EffectOperation::Call, Confidence::Low));
    }

    #[test]
    fn test_copies_are_not_request_fields() {
        let effects = scan(
            r#"fn h(req: &mut ProviderRequest) {
                let mut copy = req.system_prompt.clone();
                copy.push_str("x");
                let req = String::new();
                req.push_str("y");
            }"#,
        );
        assert!(effects.is_empty(), "{effects:?}");
    }

    #[test]
    fn test_contexts_list_ops() {
        let effects = scan(
            r#"fn h(req: &mut ProviderRequest) {
                req.contexts.retain(|c| c.role != "system");
                req.extra_user_content_parts.push(ContentPart::Text { text: "x".into() });
            }"#,
        );
        assert!(has(&effects, EffectTarget::Contexts, EffectOperation::MutateList, Confidence::High));
        assert!(has(&effects, EffectTarget::ExtraContentParts, EffectOperation::Append, Confidence::High));
    }
}
