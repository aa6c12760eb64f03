//! Small syntax-tree helpers shared by the effect visitor and the call graph.

use proc_macro2::Span;
use syn::{
    Block, Expr, ExprAssign, ExprBinary, ExprMethodCall, GenericArgument, ImplItem, Item,
    ItemImpl, Member, Pat, PathArguments, Signature, Type, UnOp,
};

use crate::effect::EffectOperation;

/// A function or method found in a file.
#[derive(Clone, Copy)]
pub(crate) struct FnRef<'a> {
    pub sig: &'a Signature,
    pub block: &'a Block,
}

/// Last path segment of an `impl` block's self type.
pub(crate) fn impl_type_name(item: &ItemImpl) -> Option<String> {
    match &*item.self_ty {
        Type::Path(tp) => tp.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}

/// Finds `function`, restricted to methods of `impl_type` when given.
///
/// Without an `impl_type`, free functions are preferred over methods.
pub(crate) fn find_function<'a>(
    items: &'a [Item],
    function: &str,
    impl_type: Option<&str>,
) -> Option<FnRef<'a>> {
    if impl_type.is_none() {
        if let Some(found) = find_free_fn(items, function) {
            return Some(found);
        }
    }
    find_method(items, function, impl_type)
}

fn find_free_fn<'a>(items: &'a [Item], function: &str) -> Option<FnRef<'a>> {
    items.iter().find_map(|item| match item {
        Item::Fn(f) if f.sig.ident == function => Some(FnRef {
            sig: &f.sig,
            block: &f.block,
        }),
        Item::Mod(m) => m
            .content
            .as_ref()
            .and_then(|(_, inner)| find_free_fn(inner, function)),
        _ => None,
    })
}

fn find_method<'a>(items: &'a [Item], function: &str, impl_type: Option<&str>) -> Option<FnRef<'a>> {
    items.iter().find_map(|item| match item {
        Item::Impl(imp) => {
            if let Some(wanted) = impl_type {
                if impl_type_name(imp).as_deref() != Some(wanted) {
                    return None;
                }
            }
            imp.items.iter().find_map(|member| match member {
                ImplItem::Fn(f) if f.sig.ident == function => Some(FnRef {
                    sig: &f.sig,
                    block: &f.block,
                }),
                _ => None,
            })
        }
        Item::Mod(m) => m
            .content
            .as_ref()
            .and_then(|(_, inner)| find_method(inner, function, impl_type)),
        _ => None,
    })
}

/// Returns `true` if a path segment of `ty` (including generic arguments) is `name`.
pub(crate) fn type_mentions(ty: &Type, name: &str) -> bool {
    match ty {
        Type::Path(tp) => tp.path.segments.iter().any(|seg| {
            seg.ident == name
                || match &seg.arguments {
                    PathArguments::AngleBracketed(args) => args.args.iter().any(|arg| match arg {
                        GenericArgument::Type(inner) => type_mentions(inner, name),
                        _ => false,
                    }),
                    _ => false,
                }
        }),
        Type::Reference(r) => type_mentions(&r.elem, name),
        Type::Paren(p) => type_mentions(&p.elem, name),
        Type::Group(g) => type_mentions(&g.elem, name),
        _ => false,
    }
}

/// Collects every identifier a pattern binds.
pub(crate) fn pattern_idents(pat: &Pat, out: &mut Vec<String>) {
    match pat {
        Pat::Ident(p) => {
            out.push(p.ident.to_string());
            if let Some((_, sub)) = &p.subpat {
                pattern_idents(sub, out);
            }
        }
        Pat::TupleStruct(p) => p.elems.iter().for_each(|e| pattern_idents(e, out)),
        Pat::Tuple(p) => p.elems.iter().for_each(|e| pattern_idents(e, out)),
        Pat::Reference(p) => pattern_idents(&p.pat, out),
        Pat::Type(p) => pattern_idents(&p.pat, out),
        Pat::Paren(p) => pattern_idents(&p.pat, out),
        Pat::Struct(p) => p.fields.iter().for_each(|f| pattern_idents(&f.pat, out)),
        _ => {}
    }
}

/// Name of a named field access.
pub(crate) fn field_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Field(f) => match &f.member {
            Member::Named(ident) => Some(ident.to_string()),
            Member::Unnamed(_) => None,
        },
        _ => None,
    }
}

/// Returns `true` if `expr` mentions an identifier, field or method
/// containing `needle` (case-insensitive).
pub(crate) fn mentions(expr: &Expr, needle: &str) -> bool {
    let hit = |s: String| s.to_ascii_lowercase().contains(needle);
    match expr {
        Expr::Path(p) => p.path.segments.iter().any(|s| hit(s.ident.to_string())),
        Expr::Field(f) => {
            let member = match &f.member {
                Member::Named(ident) => hit(ident.to_string()),
                Member::Unnamed(_) => false,
            };
            member || mentions(&f.base, needle)
        }
        Expr::MethodCall(m) => hit(m.method.to_string()) || mentions(&m.receiver, needle),
        Expr::Index(i) => mentions(&i.expr, needle),
        Expr::Paren(p) => mentions(&p.expr, needle),
        Expr::Reference(r) => mentions(&r.expr, needle),
        Expr::Unary(u) => mentions(&u.expr, needle),
        Expr::Try(t) => mentions(&t.expr, needle),
        Expr::Await(a) => mentions(&a.base, needle),
        _ => false,
    }
}

/// Returns `true` if `expr` reads the field `name` anywhere inside it.
pub(crate) fn reads_field(expr: &Expr, name: &str) -> bool {
    struct Finder<'n> {
        name: &'n str,
        found: bool,
    }
    impl<'ast> syn::visit::Visit<'ast> for Finder<'_> {
        fn visit_expr_field(&mut self, node: &'ast syn::ExprField) {
            if let Member::Named(ident) = &node.member {
                if ident == self.name {
                    self.found = true;
                }
            }
            syn::visit::visit_expr_field(self, node);
        }

        fn visit_macro(&mut self, node: &'ast syn::Macro) {
            // format!("{}{}", req.system_prompt, x) and friends.
            if let Ok(args) = node.parse_body_with(
                syn::punctuated::Punctuated::<Expr, syn::Token![,]>::parse_terminated,
            ) {
                for arg in &args {
                    syn::visit::visit_expr(self, arg);
                }
            }
        }
    }
    let mut finder = Finder { name, found: false };
    syn::visit::visit_expr(&mut finder, expr);
    finder.found
}

/// Strips parentheses and dereferences.
pub(crate) fn peel(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(p) => peel(&p.expr),
        Expr::Group(g) => peel(&g.expr),
        Expr::Unary(u) if matches!(u.op, UnOp::Deref(_)) => peel(&u.expr),
        _ => expr,
    }
}

const PERSONA_SETTERS: &[&str] = &[
    "set_persona",
    "set_persona_prompt",
    "update_persona",
    "update_persona_prompt",
    "edit_persona",
];

const TEXT_APPEND: &[&str] = &["push_str", "push", "insert_str", "insert", "extend"];

const TEXT_DESTRUCTIVE: &[&str] = &["truncate", "drain", "retain", "replace_range", "remove", "pop"];

/// Classifies a string-mutating method.
pub(crate) fn text_operation(method: &str) -> Option<EffectOperation> {
    if TEXT_APPEND.contains(&method) {
        Some(EffectOperation::Append)
    } else if method == "clear" {
        Some(EffectOperation::Clear)
    } else if TEXT_DESTRUCTIVE.contains(&method) {
        Some(EffectOperation::Overwrite)
    } else {
        None
    }
}

const LIST_APPEND: &[&str] = &["push", "extend", "append", "extend_from_slice"];

const LIST_MUTATE: &[&str] = &[
    "insert", "remove", "retain", "pop", "truncate", "drain", "sort", "sort_by", "sort_by_key",
    "dedup", "reverse", "swap", "iter_mut", "first_mut", "last_mut", "get_mut", "swap_remove",
    "splice",
];

/// Classifies a list-mutating method.
pub(crate) fn list_operation(method: &str) -> Option<EffectOperation> {
    if LIST_APPEND.contains(&method) {
        Some(EffectOperation::Append)
    } else if method == "clear" {
        Some(EffectOperation::Clear)
    } else if LIST_MUTATE.contains(&method) {
        Some(EffectOperation::MutateList)
    } else {
        None
    }
}

fn is_persona_prompt_field(expr: &Expr) -> bool {
    let expr = peel(expr);
    match (field_name(expr), expr) {
        (Some(name), Expr::Field(f)) if name == "prompt" || name == "system_prompt" => {
            mentions(&f.base, "persona")
        }
        _ => false,
    }
}

/// A persona prompt mutation: operation, evidence and position.
///
/// Detected from persona setter calls and from writes to a `prompt` or
/// `system_prompt` field reached through something named persona.
pub(crate) type PersonaHit = (EffectOperation, String, Span);

pub(crate) fn persona_method(m: &ExprMethodCall) -> Option<PersonaHit> {
    let method = m.method.to_string();
    if PERSONA_SETTERS.contains(&method.as_str()) {
        return Some((EffectOperation::Overwrite, format!("method:{method}"), m.method.span()));
    }
    if is_persona_prompt_field(&m.receiver) {
        return text_operation(&method).map(|op| (op, format!("method:{method}"), m.method.span()));
    }
    None
}

pub(crate) fn persona_assign(a: &ExprAssign) -> Option<PersonaHit> {
    is_persona_prompt_field(&a.left)
        .then(|| (EffectOperation::Overwrite, "assign".to_string(), member_span(&a.left)))
}

pub(crate) fn persona_compound(b: &ExprBinary) -> Option<PersonaHit> {
    (matches!(b.op, syn::BinOp::AddAssign(_)) && is_persona_prompt_field(&b.left))
        .then(|| (EffectOperation::Append, "compound_assign".to_string(), member_span(&b.left)))
}

#[cfg(test)]
fn persona_mutation(expr: &Expr) -> Option<PersonaHit> {
    match expr {
        Expr::MethodCall(m) => persona_method(m),
        Expr::Assign(a) => persona_assign(a),
        Expr::Binary(b) => persona_compound(b),
        _ => None,
    }
}

/// Span of the accessed member of a field expression, else the whole expression.
pub(crate) fn member_span(expr: &Expr) -> Span {
    use syn::spanned::Spanned;
    match peel(expr) {
        Expr::Field(f) => match &f.member {
            Member::Named(ident) => ident.span(),
            Member::Unnamed(index) => index.span,
        },
        other => other.span(),
    }
}
