//! Analyzer
//!
//! A tree walker with one visitor per node tag, dispatched by a dense match.
//! The analyzer resolves identifiers, infers and checks types, instantiates
//! polymorphic functions and generic types, and executes preprocessor nodes
//! in source order (their replacements are analyzed immediately after the
//! emitting site).
//!
//! Nodes that cannot resolve yet (forward references) are marked `pending`
//! and the whole pass repeats until no node is pending or a full pass makes
//! no progress; survivors are reported as `UndeclaredSymbol` or
//! `TypeCouldNotBeInferred`.
//!
//! Semantic errors are collected per statement so one bad statement does
//! not hide the rest; lexical, syntactic and preprocessor errors abort
//! immediately because the tree may be inconsistent after them.

use crate::ast::{CompVal, NodeData, NodeId, Tag};
use crate::context::Context;
use crate::errors::{CompileError, CompileResult, ErrorKind};
use crate::lexer::{NumberBase, NumberParts};
use crate::preprocessor;
use crate::scope::{ScopeId, ScopeKind, Storage, Symbol, SymbolId};
use crate::span::Span;
use crate::types::{Field, GenericInfo, PolyEval, PolyInfo, RecordInfo, TypeId, TypeKind, UnionInfo, EnumInfo};

/// Results of analysis needed by the emitter
#[derive(Debug, Default)]
pub struct Analysis {
    /// Scope owned by each block node (and the root)
    pub scopes_of: std::collections::HashMap<NodeId, ScopeId>,
}

/// Analyze a parsed compilation unit. Collected semantic errors are left in
/// `ctx.errors`; fatal errors (preprocessor, injected-parse) are returned.
pub fn analyze(ctx: &mut Context, root: NodeId) -> CompileResult<Analysis> {
    let mut analyzer = Analyzer {
        scopes_of: std::collections::HashMap::new(),
        fn_stack: Vec::new(),
        pending: Vec::new(),
        visited_blocks: std::collections::HashSet::new(),
    };
    analyzer.scopes_of.insert(root, ctx.scopes.root());

    let mut prev_pending = usize::MAX;
    loop {
        analyzer.pending.clear();
        analyzer.visited_blocks.clear();
        ctx.errors.clear();
        reset_move_states(ctx);
        analyzer.visit_block_children(ctx, root)?;
        if analyzer.pending.is_empty() {
            break;
        }
        if analyzer.pending.len() >= prev_pending {
            // no progress: report the survivors
            for &(node, span) in &analyzer.pending {
                let err = match (ctx.ast.tag(node), ctx.ast.node(node).data.as_name()) {
                    (Tag::Id | Tag::Type, Some(name)) => CompileError::undeclared(name, span),
                    (Tag::Goto, Some(label)) => CompileError::undeclared(label, span),
                    _ => CompileError::cannot_infer(span),
                };
                ctx.add_error(err);
            }
            break;
        }
        prev_pending = analyzer.pending.len();
    }

    preprocessor::run_after_analyze_hooks(ctx)?;
    Ok(Analysis { scopes_of: analyzer.scopes_of })
}

/// Every symbol is revalidated at the start of a pass; the final pass
/// leaves the true move states for the emitter.
fn reset_move_states(ctx: &mut Context) {
    for id in 0..ctx.scopes.symbol_len() {
        ctx.scopes.symbol_mut(SymbolId(id as u32)).moved = false;
    }
}

fn is_fatal(err: &CompileError) -> bool {
    matches!(
        err.kind,
        ErrorKind::Preprocess { .. } | ErrorKind::Parse { .. } | ErrorKind::Lex { .. }
    )
}

struct FnCtx {
    declared: Option<Vec<TypeId>>,
    inferred: Option<Vec<TypeId>>,
    scope: ScopeId,
}

struct Analyzer {
    scopes_of: std::collections::HashMap<NodeId, ScopeId>,
    fn_stack: Vec<FnCtx>,
    pending: Vec<(NodeId, Span)>,
    /// Blocks already visited this pass (switch cases may share one block)
    visited_blocks: std::collections::HashSet<NodeId>,
}

impl Analyzer {
    fn mark_pending(&mut self, ctx: &mut Context, node: NodeId) {
        let span = ctx.ast.node(node).span;
        ctx.ast.node_mut(node).attr.pending = true;
        self.pending.push((node, span));
    }

    fn resolve_pending(&self, ctx: &mut Context, node: NodeId) {
        ctx.ast.node_mut(node).attr.pending = false;
    }

    fn ty_of(&self, ctx: &Context, node: NodeId) -> Option<TypeId> {
        ctx.ast.node(node).attr.ty
    }

    fn val_of(&self, ctx: &Context, node: NodeId) -> Option<CompVal> {
        ctx.ast.node(node).attr.value.clone()
    }

    /// Enter the scope owned by a block node, creating it on first visit
    fn enter_block_scope(&mut self, ctx: &mut Context, block: NodeId, kind: ScopeKind) -> ScopeId {
        if let Some(&sid) = self.scopes_of.get(&block) {
            ctx.scopes.push(sid);
            sid
        } else {
            let sid = ctx.scopes.fork(kind);
            self.scopes_of.insert(block, sid);
            sid
        }
    }

    /// Run `body` inside the scope of `block`; the scope is popped on every
    /// path, including errors.
    fn scoped<F>(&mut self, ctx: &mut Context, block: NodeId, kind: ScopeKind, body: F) -> CompileResult<()>
    where
        F: FnOnce(&mut Self, &mut Context) -> CompileResult<()>,
    {
        self.enter_block_scope(ctx, block, kind);
        let result = body(self, ctx);
        ctx.scopes.pop();
        result
    }

    // ============ Blocks & statements ============

    fn visit_block_children(&mut self, ctx: &mut Context, block: NodeId) -> CompileResult<()> {
        if !self.visited_blocks.insert(block) {
            return Ok(());
        }
        let mut i = 0;
        while i < ctx.ast.node(block).children.len() {
            let child = ctx.ast.node(block).children[i];
            if ctx.ast.tag(child) == Tag::Preprocess {
                // staged evaluation: replacements are analyzed right here
                let replacement = preprocessor::run_block(ctx, child)?;
                ctx.ast.splice_block_child(block, i, replacement);
                continue;
            }
            if let Err(err) = self.visit_stmt(ctx, child) {
                if is_fatal(&err) {
                    return Err(err);
                }
                ctx.add_error(err);
            }
            i += 1;
        }
        // a terminating last statement makes the fallthrough exit dead;
        // the emitter consults this to skip the unreachable cleanup
        let terminated = ctx
            .ast
            .node(block)
            .children
            .last()
            .map_or(false, |&last| {
                matches!(
                    ctx.ast.tag(last),
                    Tag::Return | Tag::Break | Tag::Continue | Tag::Goto
                )
            });
        if terminated {
            let current = ctx.scopes.current();
            ctx.scopes.get_mut(current).alreadydestroyed = true;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let tag = ctx.ast.tag(node);
        let span = ctx.ast.node(node).span;
        match tag {
            Tag::VarDecl => self.visit_var_decl(ctx, node),
            Tag::Assign => self.visit_assign(ctx, node),
            Tag::FuncDef => self.visit_func_def(ctx, node),
            Tag::Call | Tag::CallMethod => {
                self.visit_expr(ctx, node, None)?;
                Ok(())
            }
            Tag::Return => self.visit_return(ctx, node),
            Tag::If => {
                let children = ctx.ast.children(node);
                let mut i = 0;
                while i + 1 < children.len() {
                    self.visit_expr(ctx, children[i], None)?;
                    self.scoped(ctx, children[i + 1], ScopeKind::Block, |a, ctx| {
                        a.visit_block_children(ctx, children[i + 1])
                    })?;
                    i += 2;
                }
                if i < children.len() {
                    self.scoped(ctx, children[i], ScopeKind::Block, |a, ctx| {
                        a.visit_block_children(ctx, children[i])
                    })?;
                }
                Ok(())
            }
            Tag::Do => {
                let block = ctx.ast.children(node)[0];
                self.scoped(ctx, block, ScopeKind::Block, |a, ctx| {
                    a.visit_block_children(ctx, block)
                })
            }
            Tag::Defer => {
                let block = ctx.ast.children(node)[0];
                let current = ctx.scopes.current();
                if !ctx.scopes.get(current).deferblocks.contains(&node) {
                    ctx.scopes.get_mut(current).deferblocks.push(node);
                }
                self.scoped(ctx, block, ScopeKind::Block, |a, ctx| {
                    a.visit_block_children(ctx, block)
                })
            }
            Tag::While => {
                let children = ctx.ast.children(node);
                self.visit_expr(ctx, children[0], None)?;
                self.scoped(ctx, children[1], ScopeKind::Loop, |a, ctx| {
                    a.visit_block_children(ctx, children[1])
                })
            }
            Tag::Repeat => {
                // the until-condition sees the body's scope
                let children = ctx.ast.children(node);
                self.scoped(ctx, children[0], ScopeKind::Loop, |a, ctx| {
                    a.visit_block_children(ctx, children[0])?;
                    a.visit_expr(ctx, children[1], None)?;
                    Ok(())
                })
            }
            Tag::ForNum => self.visit_for_num(ctx, node),
            Tag::ForIn => self.visit_for_in(ctx, node),
            Tag::Switch => self.visit_switch(ctx, node),
            Tag::Break | Tag::Continue => {
                if ctx.scopes.find_enclosing(ScopeKind::Loop).is_none() {
                    let what = if tag == Tag::Break { "break" } else { "continue" };
                    return Err(CompileError::parse(
                        "StatementOutsideLoop",
                        format!("`{}` outside of a loop", what),
                        span,
                    ));
                }
                Ok(())
            }
            Tag::Label => {
                let name = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
                let current = ctx.scopes.current();
                ctx.scopes.get_mut(current).labels.insert(name, node);
                Ok(())
            }
            Tag::Goto => self.visit_goto(ctx, node),
            Tag::PragmaCall => self.visit_pragma(ctx, node),
            Tag::PreprocessExpr => {
                preprocessor::eval_expr_node(ctx, node)?;
                Ok(())
            }
            Tag::Preprocess => Ok(()), // handled by visit_block_children
            other => Err(CompileError::parse(
                "UnexpectedSyntax",
                format!("{} is not a statement", other),
                span,
            )),
        }
    }

    fn visit_goto(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let name = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        let mut scope = Some(ctx.scopes.current());
        while let Some(sid) = scope {
            if ctx.scopes.get(sid).labels.contains_key(&name) {
                self.resolve_pending(ctx, node);
                return Ok(());
            }
            scope = ctx.scopes.get(sid).parent;
        }
        self.mark_pending(ctx, node);
        Ok(())
    }

    fn visit_pragma(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let name = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        let args = ctx.ast.children(node);
        let on = match args.first() {
            None => true,
            Some(&arg) => {
                self.visit_expr(ctx, arg, None)?;
                !matches!(self.val_of(ctx, arg), Some(CompVal::Bool(false)))
            }
        };
        let span = ctx.ast.node(node).span;
        match name.as_str() {
            "nogc" => ctx.pragmas.nogc = on,
            "nochecks" => ctx.pragmas.nochecks = on,
            other => {
                return Err(CompileError::invalid_annotation(other, span));
            }
        }
        Ok(())
    }

    // ============ Declarations ============

    fn visit_var_decl(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let storage = match ctx.ast.node(node).data.as_name() {
            Some("global") => Storage::Static,
            _ => Storage::Local,
        };
        let children = ctx.ast.children(node);
        let decls: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|&c| ctx.ast.tag(c) == Tag::IdDecl)
            .collect();
        let values: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|&c| ctx.ast.tag(c) != Tag::IdDecl)
            .collect();

        for (i, &decl) in decls.iter().enumerate() {
            let declared = self.id_decl_type(ctx, decl)?;
            let value = values.get(i).copied();
            let mut ty = declared;
            let mut comp_value = None;
            let mut is_type_decl = None;

            // pre-declare type symbols so a record can reference itself
            // through a pointer field
            if let Some(value) = value {
                if ctx.ast.tag(value) == Tag::TypeInstance {
                    let inner = ctx.ast.children(value)[0];
                    if matches!(
                        ctx.ast.tag(inner),
                        Tag::RecordType | Tag::UnionType | Tag::EnumType
                    ) {
                        self.predeclare_type(ctx, decl, inner)?;
                    }
                }
            }

            if let Some(value) = value {
                self.visit_expr(ctx, value, declared)?;
                self.consume_value(ctx, value)?;
                let value_ty = self.ty_of(ctx, value);
                match (declared, value_ty) {
                    (Some(want), Some(have)) => {
                        if !ctx.types.assignable(have, want, self.val_of(ctx, value).as_ref()) {
                            return Err(CompileError::not_assignable(
                                ctx.types.display(have),
                                ctx.types.display(want),
                                ctx.ast.node(value).span,
                            ));
                        }
                    }
                    (None, Some(have)) => {
                        ty = Some(have);
                    }
                    (_, None) => {
                        self.mark_pending(ctx, node);
                        continue;
                    }
                }
                if self.ty_of(ctx, value) == Some(ctx.types.prims.typetype) {
                    if let Some(CompVal::Type(t)) = self.val_of(ctx, value) {
                        is_type_decl = Some(t);
                    }
                }
                comp_value = self.val_of(ctx, value);
            } else if i >= values.len() && !values.is_empty() {
                // destructure a trailing multiple-return call
                if let Some(&last) = values.last() {
                    if let Some(extra) =
                        self.multi_ret_type(ctx, last, i - (values.len() - 1))
                    {
                        ty = declared.or(Some(extra));
                    }
                }
            }

            let ty = match ty {
                Some(t) => t,
                None => ctx.types.prims.any,
            };

            // declare (or refresh on later passes)
            let sid = match ctx.ast.node(decl).attr.symbol {
                Some(sid) => sid,
                None => {
                    let name = self.id_decl_name(ctx, decl)?;
                    let span = ctx.ast.node(decl).span;
                    let mut symbol = Symbol::new(name, storage, span);
                    symbol.node = Some(decl);
                    self.apply_annotations(ctx, decl, &mut symbol);
                    let sid = ctx.scopes.declare(symbol)?;
                    ctx.ast.node_mut(decl).attr.symbol = Some(sid);
                    sid
                }
            };

            if let Some(type_value) = is_type_decl {
                let name = ctx.scopes.symbol(sid).name.clone();
                ctx.types.adopt_nickname(type_value, &name);
                let symbol = ctx.scopes.symbol_mut(sid);
                symbol.storage = Storage::Comptime;
                symbol.ty = Some(ctx.types.prims.typetype);
                symbol.value = Some(CompVal::Type(type_value));
                symbol.nickname = Some(symbol.name.clone());
            } else {
                let symbol = ctx.scopes.symbol_mut(sid);
                symbol.ty = Some(ty);
                symbol.moved = false;
                if symbol.has_annotation("comptime") || symbol.has_annotation("const") {
                    symbol.value = comp_value.clone();
                }
                if symbol.has_annotation("comptime") {
                    symbol.storage = Storage::Comptime;
                }
            }
            let has_destroy = ctx.types.has_destroy(ty);
            let attr = &mut ctx.ast.node_mut(decl).attr;
            attr.ty = Some(ty);
            if storage == Storage::Local && has_destroy {
                attr.scopedestroy = true;
            }
        }
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    /// Mint the identity type and bind the declaring symbol before the
    /// type body is analyzed, so the body can reference the type itself.
    fn predeclare_type(&mut self, ctx: &mut Context, decl: NodeId, inner: NodeId) -> CompileResult<()> {
        let t = match ctx.ast.node(inner).attr.value.clone() {
            Some(CompVal::Type(t)) => t,
            _ => {
                let t = match ctx.ast.tag(inner) {
                    Tag::RecordType => ctx.types.declare_record(None, RecordInfo::default()),
                    Tag::UnionType => ctx.types.declare_union(None, UnionInfo::default()),
                    _ => {
                        let int64 = ctx.types.prims.int64;
                        ctx.types.declare_enum(None, EnumInfo {
                            subtype: int64,
                            fields: Vec::new(),
                            metafields: Default::default(),
                        })
                    }
                };
                ctx.ast.node_mut(inner).attr.value = Some(CompVal::Type(t));
                t
            }
        };
        if ctx.ast.node(decl).attr.symbol.is_none() {
            let name = self.id_decl_name(ctx, decl)?;
            ctx.types.adopt_nickname(t, &name);
            let span = ctx.ast.node(decl).span;
            let mut symbol = Symbol::new(&name, Storage::Comptime, span);
            symbol.node = Some(decl);
            symbol.ty = Some(ctx.types.prims.typetype);
            symbol.value = Some(CompVal::Type(t));
            symbol.nickname = Some(name);
            let sid = ctx.scopes.declare(symbol)?;
            ctx.ast.node_mut(decl).attr.symbol = Some(sid);
        }
        Ok(())
    }

    fn id_decl_name(&mut self, ctx: &mut Context, decl: NodeId) -> CompileResult<String> {
        if let Some(name) = ctx.ast.node(decl).data.as_name() {
            return Ok(name.to_string());
        }
        // `local #|name|#` splice
        let children = ctx.ast.children(decl);
        if let Some(&first) = children.first() {
            if ctx.ast.tag(first) == Tag::PreprocessName {
                return preprocessor::eval_name_node(ctx, first);
            }
            if ctx.ast.tag(first) == Tag::Id {
                if let Some(name) = ctx.ast.node(first).data.as_name() {
                    return Ok(name.to_string());
                }
            }
        }
        Err(CompileError::parse(
            "ExpectedName",
            "declaration has no name",
            ctx.ast.node(decl).span,
        ))
    }

    /// Declared type of an IdDecl, if a type expression child is present
    fn id_decl_type(&mut self, ctx: &mut Context, decl: NodeId) -> CompileResult<Option<TypeId>> {
        let children = ctx.ast.children(decl);
        for child in children {
            if ctx.ast.tag(child).is_type_expr() {
                return self.eval_type(ctx, child);
            }
        }
        Ok(None)
    }

    fn apply_annotations(&mut self, ctx: &mut Context, decl: NodeId, symbol: &mut Symbol) {
        for child in ctx.ast.children(decl) {
            if ctx.ast.tag(child) == Tag::Annotation {
                if let Some(name) = ctx.ast.node(child).data.as_name() {
                    match name {
                        "cimport" => symbol.cimport = true,
                        "nodecl" => symbol.nodecl = true,
                        other => symbol.annotations.push(other.to_string()),
                    }
                }
            }
        }
    }

    fn multi_ret_type(&self, ctx: &Context, call: NodeId, index: usize) -> Option<TypeId> {
        if !matches!(ctx.ast.tag(call), Tag::Call | Tag::CallMethod) {
            return None;
        }
        let callee = ctx.ast.children(call)[0];
        let fty = ctx.ast.node(callee).attr.ty?;
        match &ctx.types.get(fty).kind {
            TypeKind::Function(info) => info.rets.get(index).copied(),
            _ => None,
        }
    }

    fn visit_assign(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let (ntargets, _) = ctx.ast.node(node).data.arity();
        let children = ctx.ast.children(node);
        let (targets, values) = children.split_at(ntargets);

        for &target in targets {
            self.visit_expr(ctx, target, None)?;
            if !ctx.ast.node(target).attr.lvalue && self.ty_of(ctx, target).is_some() {
                return Err(CompileError::parse(
                    "NotLvalue",
                    "cannot assign to this expression",
                    ctx.ast.node(target).span,
                ));
            }
        }
        for (i, &value) in values.iter().enumerate() {
            let expected = targets.get(i).and_then(|&t| self.ty_of(ctx, t));
            self.visit_expr(ctx, value, expected)?;
            self.consume_value(ctx, value)?;
            if let (Some(want), Some(have)) = (expected, self.ty_of(ctx, value)) {
                if !ctx.types.assignable(have, want, self.val_of(ctx, value).as_ref()) {
                    return Err(CompileError::not_assignable(
                        ctx.types.display(have),
                        ctx.types.display(want),
                        ctx.ast.node(value).span,
                    ));
                }
            }
        }
        // a full reassignment revalidates a moved-out symbol
        for &target in targets {
            if let Some(sid) = ctx.ast.node(target).attr.symbol {
                if ctx.ast.tag(target) == Tag::Id {
                    ctx.scopes.symbol_mut(sid).moved = false;
                }
            }
        }
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    fn visit_return(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let exprs = ctx.ast.children(node);
        let declared = self.fn_stack.last().and_then(|f| f.declared.clone());
        let mut tys = Vec::new();
        let mut all_known = true;
        for (i, &expr) in exprs.iter().enumerate() {
            let expected = declared.as_ref().and_then(|d| d.get(i).copied());
            self.visit_expr(ctx, expr, expected)?;
            self.consume_value(ctx, expr)?;
            match self.ty_of(ctx, expr) {
                Some(have) => {
                    if let Some(want) = expected {
                        if !ctx.types.assignable(have, want, self.val_of(ctx, expr).as_ref()) {
                            return Err(CompileError::not_assignable(
                                ctx.types.display(have),
                                ctx.types.display(want),
                                ctx.ast.node(expr).span,
                            ));
                        }
                    }
                    tys.push(have);
                }
                None => all_known = false,
            }
        }
        if let Some(fnctx) = self.fn_stack.last_mut() {
            if fnctx.declared.is_none() && fnctx.inferred.is_none() && all_known {
                fnctx.inferred = Some(tys);
            }
            let scope = fnctx.scope;
            ctx.scopes.get_mut(scope).has_return = true;
        }
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    fn visit_for_num(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let children = ctx.ast.children(node);
        let decl = children[0];
        let block = *children.last().unwrap();
        let bounds = &children[1..children.len() - 1];

        let declared = self.id_decl_type(ctx, decl)?;
        for &bound in bounds {
            self.visit_expr(ctx, bound, declared)?;
        }
        let var_ty = match declared.or_else(|| self.ty_of(ctx, bounds[0])) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        self.scoped(ctx, block, ScopeKind::Loop, |a, ctx| {
            if ctx.ast.node(decl).attr.symbol.is_none() {
                let name = a.id_decl_name(ctx, decl)?;
                let span = ctx.ast.node(decl).span;
                let mut symbol = Symbol::new(name, Storage::Local, span);
                symbol.ty = Some(var_ty);
                symbol.node = Some(decl);
                let sid = ctx.scopes.declare(symbol)?;
                ctx.ast.node_mut(decl).attr.symbol = Some(sid);
            }
            ctx.ast.node_mut(decl).attr.ty = Some(var_ty);
            a.visit_block_children(ctx, block)
        })?;
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    fn visit_for_in(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let (nvars, nexprs) = ctx.ast.node(node).data.arity();
        let children = ctx.ast.children(node);
        let vars = &children[..nvars];
        let exprs = &children[nvars..nvars + nexprs];
        let block = *children.last().unwrap();

        self.visit_expr(ctx, exprs[0], None)?;
        let iter_ty = match self.ty_of(ctx, exprs[0]) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        // iteration is over arrays: index plus element variables
        let elem = match ctx.types.get(iter_ty).kind {
            TypeKind::Array { elem, .. } => elem,
            TypeKind::Pointer(Some(sub)) => match ctx.types.get(sub).kind {
                TypeKind::Array { elem, .. } => elem,
                _ => {
                    return Err(CompileError::type_mismatch(
                        "an iterable array",
                        ctx.types.display(iter_ty),
                        ctx.ast.node(exprs[0]).span,
                    ))
                }
            },
            _ => {
                return Err(CompileError::type_mismatch(
                    "an iterable array",
                    ctx.types.display(iter_ty),
                    ctx.ast.node(exprs[0]).span,
                ))
            }
        };
        let index_ty = ctx.types.prims.isize;
        let var_tys = [index_ty, elem];
        self.scoped(ctx, block, ScopeKind::Loop, |a, ctx| {
            for (i, &var) in vars.iter().enumerate() {
                if ctx.ast.node(var).attr.symbol.is_none() {
                    let name = a.id_decl_name(ctx, var)?;
                    let span = ctx.ast.node(var).span;
                    let mut symbol = Symbol::new(name, Storage::Local, span);
                    symbol.ty = var_tys.get(i).copied();
                    symbol.node = Some(var);
                    let sid = ctx.scopes.declare(symbol)?;
                    ctx.ast.node_mut(var).attr.symbol = Some(sid);
                }
                ctx.ast.node_mut(var).attr.ty = var_tys.get(i).copied();
            }
            a.visit_block_children(ctx, block)
        })?;
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    fn visit_switch(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let children = ctx.ast.children(node);
        self.visit_expr(ctx, children[0], None)?;
        let scrut_ty = self.ty_of(ctx, children[0]);
        // children: scrutinee, (case value, block) pairs, optional else
        let has_else = children.len() % 2 == 0;
        let pairs_end = if has_else { children.len() - 1 } else { children.len() };
        let mut i = 1;
        while i + 1 < pairs_end {
            let value = children[i];
            let block = children[i + 1];
            self.visit_expr(ctx, value, scrut_ty)?;
            self.scoped(ctx, block, ScopeKind::Block, |a, ctx| {
                a.visit_block_children(ctx, block)
            })?;
            i += 2;
        }
        if has_else {
            let block = *children.last().unwrap();
            self.scoped(ctx, block, ScopeKind::Block, |a, ctx| {
                a.visit_block_children(ctx, block)
            })?;
        }
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    // ============ Functions ============

    fn visit_func_def(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let (storage_name, nparams, nrets) = match &ctx.ast.node(node).data {
            NodeData::NameArity { name, a, b } => (name.clone(), *a as usize, *b as usize),
            _ => (String::new(), 0, 0),
        };
        let children = ctx.ast.children(node);
        let target = children[0];
        let params: Vec<NodeId> = children[1..1 + nparams].to_vec();
        let rets: Vec<NodeId> = children[1 + nparams..1 + nparams + nrets].to_vec();
        let block = *children.last().unwrap();

        // Parameter types; a missing or `auto` type makes the function
        // polymorphic.
        let mut arg_tys = Vec::new();
        let mut variadic = false;
        let mut poly = false;
        for &param in &params {
            if ctx.ast.tag(param) == Tag::Varargs {
                variadic = true;
                continue;
            }
            match self.id_decl_type(ctx, param)? {
                Some(t) if ctx.types.is_auto(t) => {
                    poly = true;
                    arg_tys.push(t);
                }
                Some(t) => arg_tys.push(t),
                None => {
                    poly = true;
                    arg_tys.push(ctx.types.prims.auto);
                }
            }
        }
        let mut ret_tys = Vec::new();
        let mut rets_known = true;
        for &ret in &rets {
            match self.eval_type(ctx, ret)? {
                Some(t) => ret_tys.push(t),
                None => rets_known = false,
            }
        }
        if !rets_known {
            self.mark_pending(ctx, node);
            return Ok(());
        }

        // Resolve the definition target
        match ctx.ast.tag(target) {
            Tag::Id => {
                let name = ctx.ast.node(target).data.as_name().unwrap_or_default().to_string();
                let sid = match ctx.ast.node(target).attr.symbol {
                    Some(sid) => sid,
                    None => {
                        let storage = if storage_name == "local" {
                            Storage::Local
                        } else {
                            Storage::Static
                        };
                        let span = ctx.ast.node(target).span;
                        let mut symbol = Symbol::new(&name, storage, span);
                        symbol.node = Some(node);
                        let sid = ctx.scopes.declare(symbol)?;
                        ctx.ast.node_mut(target).attr.symbol = Some(sid);
                        sid
                    }
                };
                let fty = if poly {
                    match ctx.scopes.symbol(sid).ty {
                        Some(t) if ctx.types.is_polyfunction(t) => t,
                        _ => ctx.types.declare_polyfunction(
                            Some(&name),
                            PolyInfo { args: arg_tys.clone(), rets: ret_tys.clone(), evals: Vec::new() },
                        ),
                    }
                } else {
                    ctx.types.function_of(arg_tys.clone(), ret_tys.clone(), variadic)
                };
                ctx.scopes.symbol_mut(sid).ty = Some(fty);
                ctx.ast.node_mut(target).attr.ty = Some(fty);
                ctx.ast.node_mut(node).attr.ty = Some(fty);
            }
            Tag::DotIndex | Tag::ColonIndex => {
                let is_method = ctx.ast.tag(target) == Tag::ColonIndex;
                let field = ctx.ast.node(target).data.as_name().unwrap_or_default().to_string();
                let obj = ctx.ast.children(target)[0];
                self.visit_expr(ctx, obj, None)?;
                let rec_ty = match self.val_of(ctx, obj) {
                    Some(CompVal::Type(t)) => t,
                    _ => {
                        self.mark_pending(ctx, node);
                        return Ok(());
                    }
                };
                if is_method {
                    let self_ty = ctx.types.pointer_to(rec_ty);
                    arg_tys.insert(0, self_ty);
                }
                let mangled = format!("{}_{}", ctx.types.codename(rec_ty), field);
                let sid = match ctx.ast.node(target).attr.symbol {
                    Some(sid) => sid,
                    None => {
                        let span = ctx.ast.node(target).span;
                        let mut symbol = Symbol::new(&mangled, Storage::Static, span);
                        symbol.node = Some(node);
                        let sid = ctx.scopes.declare(symbol)?;
                        ctx.ast.node_mut(target).attr.symbol = Some(sid);
                        ctx.types.set_metafield(rec_ty, &field, sid);
                        sid
                    }
                };
                let fty = if poly {
                    match ctx.scopes.symbol(sid).ty {
                        Some(t) if ctx.types.is_polyfunction(t) => t,
                        _ => ctx.types.declare_polyfunction(
                            Some(&mangled),
                            PolyInfo { args: arg_tys.clone(), rets: ret_tys.clone(), evals: Vec::new() },
                        ),
                    }
                } else {
                    ctx.types.function_of(arg_tys.clone(), ret_tys.clone(), variadic)
                };
                ctx.scopes.symbol_mut(sid).ty = Some(fty);
                ctx.ast.node_mut(node).attr.ty = Some(fty);
                if is_method && !poly {
                    // the implicit self lives at the front of the body scope
                    self.analyze_function_body(
                        ctx,
                        block,
                        &params,
                        &arg_tys[1..],
                        Some(("self", arg_tys[0])),
                        if ret_tys.is_empty() && rets.is_empty() { None } else { Some(ret_tys.clone()) },
                        node,
                        sid,
                        variadic,
                        arg_tys.clone(),
                    )?;
                    ctx.ast.node_mut(node).attr.analyzed = true;
                    return Ok(());
                }
            }
            other => {
                return Err(CompileError::parse(
                    "UnexpectedSyntax",
                    format!("cannot define a function on a {} target", other),
                    ctx.ast.node(target).span,
                ));
            }
        }

        if poly {
            // the body is analyzed per specialization, at call sites
            ctx.ast.node_mut(node).attr.analyzed = true;
            return Ok(());
        }

        let sid = ctx.ast.node(target).attr.symbol.unwrap();
        self.analyze_function_body(
            ctx,
            block,
            &params,
            &arg_tys,
            None,
            if ret_tys.is_empty() && rets.is_empty() { None } else { Some(ret_tys) },
            node,
            sid,
            variadic,
            arg_tys.clone(),
        )?;
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_function_body(
        &mut self,
        ctx: &mut Context,
        block: NodeId,
        params: &[NodeId],
        param_tys: &[TypeId],
        implicit_self: Option<(&str, TypeId)>,
        declared_rets: Option<Vec<TypeId>>,
        fdef: NodeId,
        symbol: SymbolId,
        variadic: bool,
        full_args: Vec<TypeId>,
    ) -> CompileResult<()> {
        let scope = self.enter_block_scope(ctx, block, ScopeKind::Function);
        self.fn_stack.push(FnCtx {
            declared: declared_rets.clone(),
            inferred: None,
            scope,
        });
        let result = (|| -> CompileResult<()> {
            if let Some((name, ty)) = implicit_self {
                let present = ctx
                    .scopes
                    .get(scope)
                    .symbols
                    .iter()
                    .any(|&sid| ctx.scopes.symbol(sid).name == name);
                if !present {
                    let mut symbol = Symbol::new(name, Storage::Local, Span::default());
                    symbol.ty = Some(ty);
                    let _ = ctx.scopes.declare(symbol);
                }
            }
            let mut ti = 0;
            for &param in params {
                if ctx.ast.tag(param) == Tag::Varargs {
                    continue;
                }
                let ty = param_tys.get(ti).copied();
                ti += 1;
                if ctx.ast.node(param).attr.symbol.is_none() {
                    let name = self.id_decl_name(ctx, param)?;
                    let span = ctx.ast.node(param).span;
                    let mut symbol = Symbol::new(name, Storage::Local, span);
                    symbol.ty = ty;
                    symbol.node = Some(param);
                    let sid = ctx.scopes.declare(symbol)?;
                    ctx.ast.node_mut(param).attr.symbol = Some(sid);
                }
                ctx.ast.node_mut(param).attr.ty = ty;
            }
            self.visit_block_children(ctx, block)
        })();
        let fnctx = self.fn_stack.pop().unwrap();
        ctx.scopes.pop();
        result?;

        // finalize an inferred signature
        let rets = match fnctx.declared {
            Some(rets) => rets,
            None => fnctx.inferred.unwrap_or_default(),
        };
        let fty = ctx.types.function_of(full_args, rets, variadic);
        ctx.scopes.get_mut(scope).functype = Some(fty);
        ctx.scopes.symbol_mut(symbol).ty = Some(fty);
        ctx.ast.node_mut(fdef).attr.ty = Some(fty);
        Ok(())
    }

    // ============ Expressions ============

    fn visit_expr(&mut self, ctx: &mut Context, node: NodeId, expected: Option<TypeId>) -> CompileResult<()> {
        let tag = ctx.ast.tag(node);
        match tag {
            Tag::Number => self.visit_number(ctx, node),
            Tag::String => self.visit_string(ctx, node),
            Tag::Boolean => {
                let value = matches!(ctx.ast.node(node).data, NodeData::Bool(true));
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = Some(ctx.types.prims.boolean);
                attr.value = Some(CompVal::Bool(value));
                attr.comptime = true;
                attr.analyzed = true;
                Ok(())
            }
            Tag::Nil => {
                let is_nilptr = ctx.ast.node(node).data.as_name() == Some("nilptr");
                let attr = &mut ctx.ast.node_mut(node).attr;
                if is_nilptr {
                    attr.ty = Some(ctx.types.prims.nilptr);
                    attr.value = Some(CompVal::Nilptr);
                } else {
                    attr.ty = Some(ctx.types.prims.niltype);
                    attr.value = Some(CompVal::Nil);
                }
                attr.comptime = true;
                attr.analyzed = true;
                Ok(())
            }
            Tag::Varargs => {
                ctx.ast.node_mut(node).attr.ty = Some(ctx.types.prims.any);
                Ok(())
            }
            Tag::Id => self.visit_id(ctx, node),
            Tag::Paren => {
                let inner = ctx.ast.children(node)[0];
                self.visit_expr(ctx, inner, expected)?;
                let (ty, value) = {
                    let n = ctx.ast.node(inner);
                    (n.attr.ty, n.attr.value.clone())
                };
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = ty;
                attr.value = value;
                attr.analyzed = ty.is_some();
                Ok(())
            }
            Tag::TypeInstance => {
                let inner = ctx.ast.children(node)[0];
                match self.eval_type(ctx, inner)? {
                    Some(t) => {
                        let typetype = ctx.types.prims.typetype;
                        let attr = &mut ctx.ast.node_mut(node).attr;
                        attr.ty = Some(typetype);
                        attr.value = Some(CompVal::Type(t));
                        attr.comptime = true;
                        attr.analyzed = true;
                    }
                    None => self.mark_pending(ctx, node),
                }
                Ok(())
            }
            Tag::Type
            | Tag::FuncType
            | Tag::RecordType
            | Tag::UnionType
            | Tag::EnumType
            | Tag::ArrayType
            | Tag::PointerType
            | Tag::OptionalType
            | Tag::GenericType => {
                match self.eval_type(ctx, node)? {
                    Some(t) => {
                        let typetype = ctx.types.prims.typetype;
                        let attr = &mut ctx.ast.node_mut(node).attr;
                        attr.ty = Some(typetype);
                        attr.value = Some(CompVal::Type(t));
                        attr.comptime = true;
                    }
                    None => self.mark_pending(ctx, node),
                }
                Ok(())
            }
            Tag::DotIndex => self.visit_dot_index(ctx, node),
            Tag::ArrayIndex => self.visit_array_index(ctx, node),
            Tag::Table => self.visit_table(ctx, node, expected),
            Tag::Function => self.visit_anonymous_function(ctx, node),
            Tag::Call => self.visit_call(ctx, node),
            Tag::CallMethod => self.visit_call_method(ctx, node),
            Tag::UnaryOp => self.visit_unary(ctx, node),
            Tag::BinaryOp => self.visit_binary(ctx, node),
            Tag::PreprocessExpr => {
                preprocessor::eval_expr_node(ctx, node)?;
                self.visit_expr(ctx, node, expected)
            }
            Tag::PreprocessName => {
                preprocessor::eval_name_node(ctx, node)?;
                self.visit_expr(ctx, node, expected)
            }
            other => Err(CompileError::parse(
                "UnexpectedSyntax",
                format!("{} is not an expression", other),
                ctx.ast.node(node).span,
            )),
        }
    }

    fn visit_number(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        if ctx.ast.node(node).attr.value.is_some() {
            // pre-filled by a preprocessor splice
            ctx.ast.node_mut(node).attr.analyzed = true;
            return Ok(());
        }
        let parts = match &ctx.ast.node(node).data {
            NodeData::Number(parts) => parts.clone(),
            _ => return Ok(()),
        };
        let span = ctx.ast.node(node).span;
        let (value, ty) = self.number_value(ctx, &parts, span)?;
        let attr = &mut ctx.ast.node_mut(node).attr;
        attr.value = Some(value);
        attr.ty = Some(ty);
        attr.comptime = true;
        attr.analyzed = true;
        Ok(())
    }

    fn number_value(
        &mut self,
        ctx: &mut Context,
        parts: &NumberParts,
        span: Span,
    ) -> CompileResult<(CompVal, TypeId)> {
        let radix = match parts.base {
            NumberBase::Decimal => 10,
            NumberBase::Hexadecimal => 16,
            NumberBase::Binary => 2,
        };
        let is_float = parts.frac.is_some() || (parts.exp.is_some() && parts.base == NumberBase::Decimal);
        let p = ctx.types.prims;
        let suffix_ty = match parts.suffix.as_deref() {
            None => None,
            Some(suffix) => Some(match suffix {
                "i8" => p.int8,
                "i16" => p.int16,
                "i32" => p.int32,
                "i64" | "i" => p.int64,
                "isize" => p.isize,
                "u8" => p.uint8,
                "u16" => p.uint16,
                "u32" => p.uint32,
                "u64" | "u" => p.uint64,
                "usize" => p.usize,
                "f32" => p.float32,
                "f64" | "f" => p.float64,
                other => {
                    return Err(CompileError::parse(
                        "MalformedNumber",
                        format!("unknown number suffix `{}`", other),
                        span,
                    ))
                }
            }),
        };
        if is_float || suffix_ty.map_or(false, |t| ctx.types.is_float(t)) {
            let mut text = parts.int.clone();
            if let Some(frac) = &parts.frac {
                text.push('.');
                text.push_str(frac);
            }
            if let Some(exp) = &parts.exp {
                text.push('e');
                text.push_str(exp);
            }
            let value: f64 = text.parse().map_err(|_| {
                CompileError::parse("MalformedNumber", "malformed number literal", span)
            })?;
            let ty = suffix_ty.unwrap_or(p.float64);
            return Ok((CompVal::Float(value), ty));
        }
        let mut value = i128::from_str_radix(&parts.int, radix).map_err(|_| {
            CompileError::parse("MalformedNumber", "number literal out of range", span)
        })?;
        if let Some(exp) = &parts.exp {
            // binary exponent of hexadecimal floats
            let shift: u32 = exp.parse().map_err(|_| {
                CompileError::parse("MalformedNumber", "malformed number exponent", span)
            })?;
            value <<= shift.min(64);
        }
        let ty = match suffix_ty {
            Some(t) => {
                if !ctx.types.int_fits(value, t) {
                    return Err(CompileError::parse(
                        "MalformedNumber",
                        format!("number literal does not fit `{}`", ctx.types.display(t)),
                        span,
                    ));
                }
                t
            }
            None => p.int64,
        };
        Ok((CompVal::Int(value), ty))
    }

    fn visit_string(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let (value, suffix) = match &ctx.ast.node(node).data {
            NodeData::Str { value, suffix } => (value.clone(), suffix.clone()),
            _ => return Ok(()),
        };
        let ty = match suffix.as_deref() {
            Some("cstring") => ctx.types.prims.cstring,
            _ => ctx.types.prims.string,
        };
        let attr = &mut ctx.ast.node_mut(node).attr;
        attr.ty = Some(ty);
        attr.value = Some(CompVal::Str(value));
        attr.comptime = true;
        attr.analyzed = true;
        Ok(())
    }

    fn visit_id(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let name = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        // primitive type names double as type expressions
        if let Some(t) = ctx.types.resolve_primitive(&name) {
            if ctx.scopes.resolve(&name).is_none() {
                let typetype = ctx.types.prims.typetype;
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = Some(typetype);
                attr.value = Some(CompVal::Type(t));
                attr.comptime = true;
                attr.analyzed = true;
                return Ok(());
            }
        }
        match ctx.scopes.resolve(&name) {
            Some(sid) => {
                let span = ctx.ast.node(node).span;
                let (ty, value, moved) = {
                    let symbol = ctx.scopes.symbol(sid);
                    (symbol.ty, symbol.value.clone(), symbol.moved)
                };
                if moved {
                    return Err(CompileError::use_after_move(&name, span));
                }
                ctx.scopes.symbol_mut(sid).used = true;
                match ty {
                    Some(ty) => {
                        let comptime = value.is_some();
                        let attr = &mut ctx.ast.node_mut(node).attr;
                        attr.symbol = Some(sid);
                        attr.ty = Some(ty);
                        attr.value = value;
                        attr.comptime = comptime;
                        attr.lvalue = true;
                        attr.analyzed = true;
                        self.resolve_pending(ctx, node);
                    }
                    None => self.mark_pending(ctx, node),
                }
                Ok(())
            }
            None => {
                self.mark_pending(ctx, node);
                Ok(())
            }
        }
    }

    fn visit_dot_index(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let field = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        let obj = ctx.ast.children(node)[0];
        self.visit_expr(ctx, obj, None)?;
        let obj_ty = match self.ty_of(ctx, obj) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let span = ctx.ast.node(node).span;

        // `EnumName.Field` and `RecordName.metafield` accesses
        if let Some(CompVal::Type(t)) = self.val_of(ctx, obj) {
            match &ctx.types.get(t).kind {
                TypeKind::Enum(info) => {
                    if let Some(&(_, value)) = info.fields.iter().find(|(n, _)| *n == field) {
                        let attr = &mut ctx.ast.node_mut(node).attr;
                        attr.ty = Some(t);
                        attr.value = Some(CompVal::Int(value as i128));
                        attr.comptime = true;
                        attr.analyzed = true;
                        return Ok(());
                    }
                    return Err(CompileError::undeclared(format!("{}.{}", ctx.types.display(t), field), span));
                }
                _ => {
                    if let Some(sid) = ctx.types.metafield(t, &field) {
                        let ty = ctx.scopes.symbol(sid).ty;
                        let attr = &mut ctx.ast.node_mut(node).attr;
                        attr.symbol = Some(sid);
                        attr.ty = ty;
                        attr.analyzed = ty.is_some();
                        if ty.is_none() {
                            self.mark_pending(ctx, node);
                        }
                        return Ok(());
                    }
                    self.mark_pending(ctx, node);
                    return Ok(());
                }
            }
        }

        // value field access, with pointer auto-deref
        let rec_ty = match &ctx.types.get(obj_ty).kind {
            TypeKind::Pointer(Some(sub)) => *sub,
            _ => obj_ty,
        };
        match &ctx.types.get(rec_ty).kind {
            TypeKind::Record(info) => {
                if let Some(f) = info.fields.iter().find(|f| f.name == field) {
                    let fty = f.ty;
                    let lvalue = ctx.ast.node(obj).attr.lvalue || ctx.types.is_pointer(obj_ty);
                    let attr = &mut ctx.ast.node_mut(node).attr;
                    attr.ty = Some(fty);
                    attr.lvalue = lvalue;
                    attr.analyzed = true;
                    Ok(())
                } else if let Some(sid) = ctx.types.metafield(rec_ty, &field) {
                    let ty = ctx.scopes.symbol(sid).ty;
                    let attr = &mut ctx.ast.node_mut(node).attr;
                    attr.symbol = Some(sid);
                    attr.ty = ty;
                    attr.analyzed = ty.is_some();
                    Ok(())
                } else {
                    Err(CompileError::undeclared(
                        format!("{}.{}", ctx.types.display(rec_ty), field),
                        span,
                    ))
                }
            }
            TypeKind::Union(info) => {
                if let Some(f) = info.variants.iter().find(|f| f.name == field) {
                    let fty = f.ty;
                    let lvalue = ctx.ast.node(obj).attr.lvalue;
                    let attr = &mut ctx.ast.node_mut(node).attr;
                    attr.ty = Some(fty);
                    attr.lvalue = lvalue;
                    attr.analyzed = true;
                    Ok(())
                } else {
                    Err(CompileError::undeclared(
                        format!("{}.{}", ctx.types.display(rec_ty), field),
                        span,
                    ))
                }
            }
            TypeKind::Any => {
                ctx.ast.node_mut(node).attr.ty = Some(ctx.types.prims.any);
                Ok(())
            }
            _ => Err(CompileError::type_mismatch(
                "a record or union",
                ctx.types.display(obj_ty),
                span,
            )),
        }
    }

    fn visit_array_index(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let children = ctx.ast.children(node);
        let (obj, index) = (children[0], children[1]);
        self.visit_expr(ctx, obj, None)?;
        self.visit_expr(ctx, index, None)?;
        let obj_ty = match self.ty_of(ctx, obj) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let span = ctx.ast.node(node).span;
        let base_ty = match &ctx.types.get(obj_ty).kind {
            TypeKind::Pointer(Some(sub)) => *sub,
            _ => obj_ty,
        };
        match ctx.types.get(base_ty).kind {
            TypeKind::Array { elem, len } => {
                if let Some(ity) = self.ty_of(ctx, index) {
                    if !ctx.types.is_integer(ity) {
                        return Err(CompileError::type_mismatch(
                            "an integer index",
                            ctx.types.display(ity),
                            ctx.ast.node(index).span,
                        ));
                    }
                }
                // bounds check unless provably in range or checks are off
                let in_range = matches!(
                    self.val_of(ctx, index),
                    Some(CompVal::Int(i)) if i >= 0 && (i as u64) < len
                );
                let lvalue = ctx.ast.node(obj).attr.lvalue || ctx.types.is_pointer(obj_ty);
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = Some(elem);
                attr.lvalue = lvalue;
                attr.checkcast = !in_range && !ctx.pragmas.nochecks;
                attr.analyzed = true;
                Ok(())
            }
            TypeKind::Any => {
                ctx.ast.node_mut(node).attr.ty = Some(ctx.types.prims.any);
                Ok(())
            }
            _ => {
                // `__index` metafield fallback
                if let Some(sid) = ctx.types.metafield(base_ty, "__index") {
                    let fty = ctx.scopes.symbol(sid).ty;
                    let ret = fty.and_then(|t| match &ctx.types.get(t).kind {
                        TypeKind::Function(info) => info.rets.first().copied(),
                        _ => None,
                    });
                    let attr = &mut ctx.ast.node_mut(node).attr;
                    attr.symbol = Some(sid);
                    attr.ty = ret;
                    attr.analyzed = ret.is_some();
                    return Ok(());
                }
                Err(CompileError::type_mismatch(
                    "an indexable value",
                    ctx.types.display(obj_ty),
                    span,
                ))
            }
        }
    }

    fn visit_table(&mut self, ctx: &mut Context, node: NodeId, expected: Option<TypeId>) -> CompileResult<()> {
        let span = ctx.ast.node(node).span;
        let expected = match expected {
            Some(t) => t,
            None => {
                // the table type comes from the declaration site; without
                // one there is nothing to infer from
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let items = ctx.ast.children(node);
        match ctx.types.get(expected).kind.clone() {
            TypeKind::Record(info) => {
                for (index, &item) in items.iter().enumerate() {
                    match ctx.ast.tag(item) {
                        Tag::Pair => {
                            let fname = ctx.ast.node(item).data.as_name().map(str::to_string);
                            let value = *ctx.ast.children(item).last().unwrap();
                            let field = fname
                                .as_deref()
                                .and_then(|n| info.fields.iter().find(|f| f.name == n));
                            match field {
                                Some(f) => {
                                    let fty = f.ty;
                                    self.visit_expr(ctx, value, Some(fty))?;
                                    if let Some(have) = self.ty_of(ctx, value) {
                                        if !ctx.types.assignable(have, fty, self.val_of(ctx, value).as_ref()) {
                                            return Err(CompileError::not_assignable(
                                                ctx.types.display(have),
                                                ctx.types.display(fty),
                                                ctx.ast.node(value).span,
                                            ));
                                        }
                                    }
                                    ctx.ast.node_mut(item).attr.ty = Some(fty);
                                }
                                None => {
                                    return Err(CompileError::undeclared(
                                        format!(
                                            "{}.{}",
                                            ctx.types.display(expected),
                                            fname.unwrap_or_default()
                                        ),
                                        ctx.ast.node(item).span,
                                    ))
                                }
                            }
                        }
                        _ => {
                            // positional record initializers fill fields in order
                            match info.fields.get(index) {
                                Some(f) => {
                                    let fty = f.ty;
                                    self.visit_expr(ctx, item, Some(fty))?;
                                }
                                None => {
                                    return Err(CompileError::type_mismatch(
                                        "a record field",
                                        "extra initializer",
                                        ctx.ast.node(item).span,
                                    ))
                                }
                            }
                        }
                    }
                }
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = Some(expected);
                attr.analyzed = true;
                Ok(())
            }
            TypeKind::Array { elem, len } => {
                if items.len() as u64 > len {
                    return Err(CompileError::type_mismatch(
                        format!("at most {} array items", len),
                        format!("{}", items.len()),
                        span,
                    ));
                }
                for &item in &items {
                    self.visit_expr(ctx, item, Some(elem))?;
                    if let Some(have) = self.ty_of(ctx, item) {
                        if !ctx.types.assignable(have, elem, self.val_of(ctx, item).as_ref()) {
                            return Err(CompileError::not_assignable(
                                ctx.types.display(have),
                                ctx.types.display(elem),
                                ctx.ast.node(item).span,
                            ));
                        }
                    }
                }
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = Some(expected);
                attr.analyzed = true;
                Ok(())
            }
            _ => Err(CompileError::type_mismatch(
                "a record or array target",
                ctx.types.display(expected),
                span,
            )),
        }
    }

    fn visit_anonymous_function(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let (nparams, nrets) = ctx.ast.node(node).data.arity();
        let children = ctx.ast.children(node);
        let params: Vec<NodeId> = children[..nparams].to_vec();
        let rets: Vec<NodeId> = children[nparams..nparams + nrets].to_vec();
        let block = *children.last().unwrap();

        let mut arg_tys = Vec::new();
        let mut variadic = false;
        for &param in &params {
            if ctx.ast.tag(param) == Tag::Varargs {
                variadic = true;
                continue;
            }
            match self.id_decl_type(ctx, param)? {
                Some(t) => arg_tys.push(t),
                None => arg_tys.push(ctx.types.prims.any),
            }
        }
        let mut ret_tys = Vec::new();
        for &ret in &rets {
            match self.eval_type(ctx, ret)? {
                Some(t) => ret_tys.push(t),
                None => {
                    self.mark_pending(ctx, node);
                    return Ok(());
                }
            }
        }

        let scope = self.enter_block_scope(ctx, block, ScopeKind::Function);
        self.fn_stack.push(FnCtx {
            declared: if rets.is_empty() { None } else { Some(ret_tys.clone()) },
            inferred: None,
            scope,
        });
        let result = (|| -> CompileResult<()> {
            for (i, &param) in params.iter().enumerate() {
                if ctx.ast.tag(param) == Tag::Varargs {
                    continue;
                }
                if ctx.ast.node(param).attr.symbol.is_none() {
                    let name = self.id_decl_name(ctx, param)?;
                    let span = ctx.ast.node(param).span;
                    let mut symbol = Symbol::new(name, Storage::Local, span);
                    symbol.ty = arg_tys.get(i).copied();
                    symbol.node = Some(param);
                    let sid = ctx.scopes.declare(symbol)?;
                    ctx.ast.node_mut(param).attr.symbol = Some(sid);
                }
                ctx.ast.node_mut(param).attr.ty = arg_tys.get(i).copied();
            }
            self.visit_block_children(ctx, block)
        })();
        let fnctx = self.fn_stack.pop().unwrap();
        ctx.scopes.pop();
        result?;

        let final_rets = match fnctx.declared {
            Some(rets) => rets,
            None => fnctx.inferred.unwrap_or_default(),
        };
        let fty = ctx.types.function_of(arg_tys, final_rets, variadic);
        ctx.scopes.get_mut(scope).functype = Some(fty);
        ctx.ast.node_mut(node).attr.ty = Some(fty);
        ctx.ast.node_mut(node).attr.analyzed = true;
        Ok(())
    }

    fn visit_call(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let children = ctx.ast.children(node);
        let callee = children[0];
        let args: Vec<NodeId> = children[1..].to_vec();
        self.visit_expr(ctx, callee, None)?;
        let callee_ty = match self.ty_of(ctx, callee) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let span = ctx.ast.node(node).span;

        // explicit cast: `(@T)(x)` or `integer(x)`
        if callee_ty == ctx.types.prims.typetype {
            let target = match self.val_of(ctx, callee) {
                Some(CompVal::Type(t)) => t,
                _ => {
                    self.mark_pending(ctx, node);
                    return Ok(());
                }
            };
            if args.len() != 1 {
                return Err(CompileError::type_mismatch(
                    "exactly one cast operand",
                    format!("{} argument(s)", args.len()),
                    span,
                ));
            }
            for &arg in &args {
                self.visit_expr(ctx, arg, Some(target))?;
            }
            let value = args
                .first()
                .and_then(|&a| self.cast_value(ctx, a, target));
            let comptime = value.is_some();
            let attr = &mut ctx.ast.node_mut(node).attr;
            attr.ty = Some(target);
            attr.value = value;
            attr.comptime = comptime;
            attr.analyzed = true;
            return Ok(());
        }

        match ctx.types.get(callee_ty).kind.clone() {
            TypeKind::Function(info) => {
                for (i, &arg) in args.iter().enumerate() {
                    let expected = info.args.get(i).copied();
                    self.visit_expr(ctx, arg, expected)?;
                    self.consume_value(ctx, arg)?;
                    if let (Some(want), Some(have)) = (expected, self.ty_of(ctx, arg)) {
                        if !ctx.types.assignable(have, want, self.val_of(ctx, arg).as_ref()) {
                            return Err(CompileError::not_assignable(
                                ctx.types.display(have),
                                ctx.types.display(want),
                                ctx.ast.node(arg).span,
                            ));
                        }
                    }
                }
                if args.len() < info.args.len() || (args.len() > info.args.len() && !info.variadic) {
                    return Err(CompileError::type_mismatch(
                        format!("{} argument(s)", info.args.len()),
                        format!("{}", args.len()),
                        span,
                    ));
                }
                let ret = info.rets.first().copied().unwrap_or(ctx.types.prims.void);
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.ty = Some(ret);
                attr.sideeffect = true;
                attr.analyzed = true;
                Ok(())
            }
            TypeKind::Polyfunction(_) => self.visit_poly_call(ctx, node, callee, &args, callee_ty),
            TypeKind::Any => {
                for &arg in &args {
                    self.visit_expr(ctx, arg, None)?;
                }
                ctx.ast.node_mut(node).attr.ty = Some(ctx.types.prims.any);
                Ok(())
            }
            _ => {
                // `__call` metafield
                if let Some(sid) = ctx.types.metafield(callee_ty, "__call") {
                    let fty = ctx.scopes.symbol(sid).ty;
                    for &arg in &args {
                        self.visit_expr(ctx, arg, None)?;
                    }
                    let ret = fty.and_then(|t| match &ctx.types.get(t).kind {
                        TypeKind::Function(info) => info.rets.first().copied(),
                        _ => None,
                    });
                    let attr = &mut ctx.ast.node_mut(node).attr;
                    attr.symbol = Some(sid);
                    attr.ty = ret;
                    attr.analyzed = ret.is_some();
                    return Ok(());
                }
                Err(CompileError::type_mismatch(
                    "a callable value",
                    ctx.types.display(callee_ty),
                    span,
                ))
            }
        }
    }

    /// Instantiate (or reuse) a polymorphic eval for a call site
    fn visit_poly_call(
        &mut self,
        ctx: &mut Context,
        node: NodeId,
        callee: NodeId,
        args: &[NodeId],
        poly_ty: TypeId,
    ) -> CompileResult<()> {
        let mut key = Vec::new();
        for &arg in args {
            self.visit_expr(ctx, arg, None)?;
            self.consume_value(ctx, arg)?;
            match self.ty_of(ctx, arg) {
                Some(t) => key.push(t),
                None => {
                    self.mark_pending(ctx, node);
                    return Ok(());
                }
            }
        }

        if let Some(eval) = ctx.types.find_eval(poly_ty, &key) {
            let ret = match &ctx.types.get(eval.ty).kind {
                TypeKind::Function(info) => info.rets.first().copied(),
                _ => None,
            };
            let void = ctx.types.prims.void;
            let attr = &mut ctx.ast.node_mut(node).attr;
            attr.ty = Some(ret.unwrap_or(void));
            attr.sideeffect = true;
            attr.analyzed = true;
            return Ok(());
        }

        // new specialization: clone the defining function and re-analyze
        // its body with the substituted argument types
        let poly_sym = match ctx.ast.node(callee).attr.symbol {
            Some(sid) => sid,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let fdef = match ctx.scopes.symbol(poly_sym).node {
            Some(n) => n,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let clone = ctx.ast.clone_subtree(fdef);
        let (nparams, nrets) = match &ctx.ast.node(clone).data {
            NodeData::NameArity { a, b, .. } => (*a as usize, *b as usize),
            NodeData::Arity { a, b } => (*a as usize, *b as usize),
            _ => (0, 0),
        };
        let clone_children = ctx.ast.children(clone);
        let skip = if ctx.ast.tag(clone) == Tag::FuncDef { 1 } else { 0 };
        let params: Vec<NodeId> = clone_children[skip..skip + nparams].to_vec();
        let rets: Vec<NodeId> = clone_children[skip + nparams..skip + nparams + nrets].to_vec();
        let block = *clone_children.last().unwrap();

        let mut ret_tys = Vec::new();
        for &ret in &rets {
            match self.eval_type(ctx, ret)? {
                Some(t) => ret_tys.push(t),
                None => {
                    self.mark_pending(ctx, node);
                    return Ok(());
                }
            }
        }
        let name = {
            let base = ctx.scopes.symbol(poly_sym).name.clone();
            let mut mangled = base;
            for &t in &key {
                mangled.push('_');
                mangled.push_str(ctx.types.codename(t));
            }
            mangled
        };
        // register the eval before analyzing the body so a recursive call
        // reuses the in-progress specialization
        let prelim = ctx.types.function_of(key.clone(), ret_tys.clone(), false);
        ctx.types.add_eval(poly_ty, PolyEval {
            key: key.clone(),
            node: clone,
            ty: prelim,
            name: name.clone(),
        });

        self.analyze_function_body(
            ctx,
            block,
            &params,
            &key,
            None,
            if rets.is_empty() { None } else { Some(ret_tys) },
            clone,
            poly_sym,
            false,
            key.clone(),
        )?;
        // restore the poly type on the symbol (the body analysis finalized
        // a concrete signature onto it)
        let final_ty = ctx.ast.node(clone).attr.ty.unwrap_or(prelim);
        ctx.scopes.symbol_mut(poly_sym).ty = Some(poly_ty);
        ctx.types.update_eval(poly_ty, &key, final_ty);

        let ret = match &ctx.types.get(final_ty).kind {
            TypeKind::Function(info) => info.rets.first().copied(),
            _ => None,
        };
        let void = ctx.types.prims.void;
        let attr = &mut ctx.ast.node_mut(node).attr;
        attr.ty = Some(ret.unwrap_or(void));
        attr.sideeffect = true;
        attr.analyzed = true;
        Ok(())
    }

    fn visit_call_method(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let method = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        let children = ctx.ast.children(node);
        let obj = children[0];
        let args: Vec<NodeId> = children[1..].to_vec();
        self.visit_expr(ctx, obj, None)?;
        let obj_ty = match self.ty_of(ctx, obj) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let rec_ty = match ctx.types.get(obj_ty).kind {
            TypeKind::Pointer(Some(sub)) => sub,
            _ => obj_ty,
        };
        let span = ctx.ast.node(node).span;
        let sid = match ctx.types.metafield(rec_ty, &method) {
            Some(sid) => sid,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let fty = match ctx.scopes.symbol(sid).ty {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        match ctx.types.get(fty).kind.clone() {
            TypeKind::Function(info) => {
                // implicit self occupies the first argument slot
                for (i, &arg) in args.iter().enumerate() {
                    let expected = info.args.get(i + 1).copied();
                    self.visit_expr(ctx, arg, expected)?;
                    self.consume_value(ctx, arg)?;
                    if let (Some(want), Some(have)) = (expected, self.ty_of(ctx, arg)) {
                        if !ctx.types.assignable(have, want, self.val_of(ctx, arg).as_ref()) {
                            return Err(CompileError::not_assignable(
                                ctx.types.display(have),
                                ctx.types.display(want),
                                ctx.ast.node(arg).span,
                            ));
                        }
                    }
                }
                let ret = info.rets.first().copied().unwrap_or(ctx.types.prims.void);
                let attr = &mut ctx.ast.node_mut(node).attr;
                attr.symbol = Some(sid);
                attr.ty = Some(ret);
                attr.sideeffect = true;
                attr.analyzed = true;
                Ok(())
            }
            _ => Err(CompileError::type_mismatch(
                "a method",
                ctx.types.display(fty),
                span,
            )),
        }
    }

    fn visit_unary(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let op = ctx.ast.node(node).data.as_op().unwrap_or("");
        let operand = ctx.ast.children(node)[0];
        self.visit_expr(ctx, operand, None)?;
        let ty = match self.ty_of(ctx, operand) {
            Some(t) => t,
            None => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let span = ctx.ast.node(node).span;
        let p = ctx.types.prims;
        let (result, value) = match op {
            "not" => {
                let value = self
                    .val_of(ctx, operand)
                    .map(|v| CompVal::Bool(!v.is_truthy()));
                (p.boolean, value)
            }
            "neg" => {
                if !ctx.types.is_numeric(ty) {
                    return Err(CompileError::type_mismatch("a number", ctx.types.display(ty), span));
                }
                let result = if ctx.types.is_integer(ty) && !ctx.types.is_signed(ty) {
                    ctx.types.arith_common(ty, p.int8).unwrap_or(ty)
                } else {
                    ty
                };
                let value = match self.val_of(ctx, operand) {
                    Some(CompVal::Int(i)) => Some(CompVal::Int(-i)),
                    Some(CompVal::Float(f)) => Some(CompVal::Float(-f)),
                    _ => None,
                };
                (result, value)
            }
            "len" => match ctx.types.get(ty).kind {
                TypeKind::String | TypeKind::Cstring => (p.isize, None),
                TypeKind::Array { len, .. } => (p.isize, Some(CompVal::Int(len as i128))),
                _ => {
                    if let Some(sid) = ctx.types.metafield(ty, "__len") {
                        ctx.ast.node_mut(node).attr.symbol = Some(sid);
                        (p.isize, None)
                    } else {
                        return Err(CompileError::type_mismatch(
                            "a value with a length",
                            ctx.types.display(ty),
                            span,
                        ));
                    }
                }
            },
            "bnot" => {
                if !ctx.types.is_integer(ty) {
                    return Err(CompileError::type_mismatch("an integer", ctx.types.display(ty), span));
                }
                let value = match self.val_of(ctx, operand) {
                    Some(CompVal::Int(i)) => Some(CompVal::Int(!i)),
                    _ => None,
                };
                (ty, value)
            }
            "ref" => {
                if !ctx.ast.node(operand).attr.lvalue {
                    return Err(CompileError::parse(
                        "NotLvalue",
                        "cannot take the address of this expression",
                        span,
                    ));
                }
                (ctx.types.pointer_to(ty), None)
            }
            "deref" => match ctx.types.get(ty).kind {
                TypeKind::Pointer(Some(sub)) => {
                    ctx.ast.node_mut(node).attr.lvalue = true;
                    (sub, None)
                }
                _ => {
                    return Err(CompileError::type_mismatch(
                        "a typed pointer",
                        ctx.types.display(ty),
                        span,
                    ))
                }
            },
            other => {
                return Err(CompileError::parse(
                    "UnexpectedSyntax",
                    format!("unknown unary operator `{}`", other),
                    span,
                ))
            }
        };
        let comptime = value.is_some();
        let attr = &mut ctx.ast.node_mut(node).attr;
        attr.ty = Some(result);
        attr.value = value;
        attr.comptime = attr.comptime || comptime;
        attr.analyzed = true;
        Ok(())
    }

    fn visit_binary(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        let op = ctx.ast.node(node).data.as_op().unwrap_or("");
        let children = ctx.ast.children(node);
        let (lhs, rhs) = (children[0], children[1]);
        self.visit_expr(ctx, lhs, None)?;
        self.visit_expr(ctx, rhs, None)?;
        let (lty, rty) = match (self.ty_of(ctx, lhs), self.ty_of(ctx, rhs)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                self.mark_pending(ctx, node);
                return Ok(());
            }
        };
        let span = ctx.ast.node(node).span;

        // operator metafields take precedence over the structural rules
        if let Some(meta) = crate::types::TypeRegistry::binop_metafield(op) {
            for ty in [lty, rty] {
                if let Some(sid) = ctx.types.metafield(ty, meta) {
                    let fty = ctx.scopes.symbol(sid).ty;
                    let ret = fty.and_then(|t| match &ctx.types.get(t).kind {
                        TypeKind::Function(info) => info.rets.first().copied(),
                        _ => None,
                    });
                    let attr = &mut ctx.ast.node_mut(node).attr;
                    attr.symbol = Some(sid);
                    attr.ty = ret;
                    attr.analyzed = ret.is_some();
                    if ret.is_none() {
                        self.mark_pending(ctx, node);
                    }
                    return Ok(());
                }
            }
        }

        let result = match ctx.types.binary_result(op, lty, rty) {
            Some(t) => t,
            None => {
                return Err(CompileError::type_mismatch(
                    format!("operands for `{}`", op),
                    format!("{} and {}", ctx.types.display(lty), ctx.types.display(rty)),
                    span,
                ))
            }
        };
        let value = self.fold_binary(ctx, op, lhs, rhs, result);
        let comptime = value.is_some();
        let attr = &mut ctx.ast.node_mut(node).attr;
        attr.ty = Some(result);
        attr.value = value;
        attr.comptime = comptime;
        attr.analyzed = true;
        Ok(())
    }

    /// Constant-fold a binary operation when both operands are comptime
    fn fold_binary(
        &self,
        ctx: &Context,
        op: &str,
        lhs: NodeId,
        rhs: NodeId,
        result: TypeId,
    ) -> Option<CompVal> {
        let a = self.val_of(ctx, lhs)?;
        let b = self.val_of(ctx, rhs)?;
        match (a, b) {
            (CompVal::Int(a), CompVal::Int(b)) => {
                let value = match op {
                    "add" => CompVal::Int(a.wrapping_add(b)),
                    "sub" => CompVal::Int(a.wrapping_sub(b)),
                    "mul" => CompVal::Int(a.wrapping_mul(b)),
                    "idiv" if b != 0 => CompVal::Int(a.div_euclid(b)),
                    "mod" if b != 0 => CompVal::Int(a.rem_euclid(b)),
                    "div" if b != 0 => CompVal::Float(a as f64 / b as f64),
                    "band" => CompVal::Int(a & b),
                    "bor" => CompVal::Int(a | b),
                    "bxor" => CompVal::Int(a ^ b),
                    "shl" => CompVal::Int(a << (b.clamp(0, 127) as u32)),
                    "shr" => CompVal::Int(a >> (b.clamp(0, 127) as u32)),
                    "eq" => CompVal::Bool(a == b),
                    "ne" => CompVal::Bool(a != b),
                    "lt" => CompVal::Bool(a < b),
                    "le" => CompVal::Bool(a <= b),
                    "gt" => CompVal::Bool(a > b),
                    "ge" => CompVal::Bool(a >= b),
                    "pow" => CompVal::Float((a as f64).powf(b as f64)),
                    _ => return None,
                };
                // keep folded integers inside the result type's range
                if let CompVal::Int(v) = value {
                    if ctx.types.is_integer(result) && !ctx.types.int_fits(v, result) {
                        return None;
                    }
                }
                Some(value)
            }
            (CompVal::Float(a), CompVal::Float(b)) => Some(match op {
                "add" => CompVal::Float(a + b),
                "sub" => CompVal::Float(a - b),
                "mul" => CompVal::Float(a * b),
                "div" => CompVal::Float(a / b),
                "pow" => CompVal::Float(a.powf(b)),
                "eq" => CompVal::Bool(a == b),
                "ne" => CompVal::Bool(a != b),
                "lt" => CompVal::Bool(a < b),
                "le" => CompVal::Bool(a <= b),
                "gt" => CompVal::Bool(a > b),
                "ge" => CompVal::Bool(a >= b),
                _ => return None,
            }),
            (CompVal::Bool(a), CompVal::Bool(b)) => Some(match op {
                "and" => CompVal::Bool(a && b),
                "or" => CompVal::Bool(a || b),
                "eq" => CompVal::Bool(a == b),
                "ne" => CompVal::Bool(a != b),
                _ => return None,
            }),
            _ => None,
        }
    }

    fn cast_value(&self, ctx: &Context, arg: NodeId, target: TypeId) -> Option<CompVal> {
        let value = self.val_of(ctx, arg)?;
        match (&value, &ctx.types.get(target).kind) {
            (CompVal::Int(i), TypeKind::Float(_)) => Some(CompVal::Float(*i as f64)),
            (CompVal::Float(f), TypeKind::Int(_) | TypeKind::Uint(_)) => {
                Some(CompVal::Int(*f as i128))
            }
            (CompVal::Int(_), TypeKind::Int(_) | TypeKind::Uint(_)) => Some(value),
            _ => None,
        }
    }

    // ============ Move/copy discipline ============

    /// Consuming an owned value: a direct read of a destroyable lvalue
    /// either copies (when `__copy` exists) or moves the symbol out.
    fn consume_value(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<()> {
        if ctx.ast.tag(node) != Tag::Id {
            return Ok(());
        }
        let (sid, ty) = {
            let attr = &ctx.ast.node(node).attr;
            match (attr.symbol, attr.ty) {
                (Some(s), Some(t)) => (s, t),
                _ => return Ok(()),
            }
        };
        if !ctx.types.has_destroy(ty) {
            return Ok(());
        }
        ctx.ast.node_mut(node).attr.maymove = true;
        if !ctx.types.has_copy(ty) {
            ctx.scopes.symbol_mut(sid).moved = true;
            ctx.ast.node_mut(node).attr.moved = true;
        }
        Ok(())
    }

    // ============ Type expression evaluation ============

    /// Evaluate a type expression node to the type it denotes.
    /// `None` means the node is pending on a forward reference.
    fn eval_type(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<Option<TypeId>> {
        let tag = ctx.ast.tag(node);
        let span = ctx.ast.node(node).span;
        let result = match tag {
            Tag::Type => {
                let name = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
                match ctx.scopes.resolve(&name) {
                    Some(sid) => match ctx.scopes.symbol(sid).value.clone() {
                        Some(CompVal::Type(t)) => Some(t),
                        _ => match ctx.types.resolve_primitive(&name) {
                            Some(t) => Some(t),
                            None => {
                                self.mark_pending(ctx, node);
                                None
                            }
                        },
                    },
                    None => match ctx.types.resolve_primitive(&name) {
                        Some(t) => Some(t),
                        None => {
                            self.mark_pending(ctx, node);
                            None
                        }
                    },
                }
            }
            Tag::PointerType => {
                let children = ctx.ast.children(node);
                match children.first() {
                    None => Some(ctx.types.prims.pointer),
                    Some(&sub) => match self.eval_type(ctx, sub)? {
                        Some(t) => Some(ctx.types.pointer_to(t)),
                        None => None,
                    },
                }
            }
            Tag::OptionalType => {
                let sub = ctx.ast.children(node)[0];
                match self.eval_type(ctx, sub)? {
                    Some(t) => Some(ctx.types.optional_of(t)),
                    None => None,
                }
            }
            Tag::ArrayType => {
                let children = ctx.ast.children(node);
                let elem = match self.eval_type(ctx, children[0])? {
                    Some(t) => t,
                    None => return Ok(None),
                };
                let len = match children.get(1) {
                    Some(&len_expr) => {
                        self.visit_expr(ctx, len_expr, None)?;
                        match self.val_of(ctx, len_expr) {
                            Some(CompVal::Int(n)) if n >= 0 => n as u64,
                            Some(_) => {
                                return Err(CompileError::type_mismatch(
                                    "a constant array length",
                                    "a non-integer value",
                                    span,
                                ))
                            }
                            None => {
                                self.mark_pending(ctx, node);
                                return Ok(None);
                            }
                        }
                    }
                    None => 0,
                };
                Some(ctx.types.array_of(elem, len))
            }
            Tag::FuncType => {
                let (nargs, nrets) = ctx.ast.node(node).data.arity();
                let children = ctx.ast.children(node);
                let mut args = Vec::new();
                for &child in &children[..nargs] {
                    match self.eval_type(ctx, child)? {
                        Some(t) => args.push(t),
                        None => return Ok(None),
                    }
                }
                let mut rets = Vec::new();
                for &child in &children[nargs..nargs + nrets] {
                    match self.eval_type(ctx, child)? {
                        Some(t) => rets.push(t),
                        None => return Ok(None),
                    }
                }
                Some(ctx.types.function_of(args, rets, false))
            }
            Tag::RecordType => {
                let mut fields = Vec::new();
                for child in ctx.ast.children(node) {
                    let name = ctx.ast.node(child).data.as_name().unwrap_or_default().to_string();
                    let tychild = ctx.ast.children(child)[0];
                    match self.eval_type(ctx, tychild)? {
                        Some(t) => fields.push(Field { name, ty: t }),
                        None => return Ok(None),
                    }
                }
                // one identity type per declaration site; a pre-minted
                // forward type gets its fields filled in here
                match ctx.ast.node(node).attr.value.clone() {
                    Some(CompVal::Type(t)) => {
                        ctx.types.set_record_fields(t, fields);
                        Some(t)
                    }
                    _ => {
                        let t = ctx.types.declare_record(None, RecordInfo {
                            fields,
                            ..Default::default()
                        });
                        ctx.ast.node_mut(node).attr.value = Some(CompVal::Type(t));
                        Some(t)
                    }
                }
            }
            Tag::UnionType => {
                let mut variants = Vec::new();
                for child in ctx.ast.children(node) {
                    let name = ctx.ast.node(child).data.as_name().unwrap_or_default().to_string();
                    let tychild = ctx.ast.children(child)[0];
                    match self.eval_type(ctx, tychild)? {
                        Some(t) => variants.push(Field { name, ty: t }),
                        None => return Ok(None),
                    }
                }
                match ctx.ast.node(node).attr.value.clone() {
                    Some(CompVal::Type(t)) => {
                        ctx.types.set_union_variants(t, variants);
                        Some(t)
                    }
                    _ => {
                        let t = ctx.types.declare_union(None, UnionInfo {
                            variants,
                            metafields: Default::default(),
                        });
                        ctx.ast.node_mut(node).attr.value = Some(CompVal::Type(t));
                        Some(t)
                    }
                }
            }
            Tag::EnumType => {
                let children = ctx.ast.children(node);
                let mut subtype = ctx.types.prims.int64;
                let mut fields = Vec::new();
                let mut next_value: i64 = 0;
                for child in children {
                    if ctx.ast.tag(child) == Tag::EnumFieldType {
                        let name = ctx.ast.node(child).data.as_name().unwrap_or_default().to_string();
                        let value = match ctx.ast.children(child).first() {
                            Some(&expr) => {
                                self.visit_expr(ctx, expr, Some(subtype))?;
                                match self.val_of(ctx, expr) {
                                    Some(CompVal::Int(v)) => v as i64,
                                    _ => {
                                        self.mark_pending(ctx, node);
                                        return Ok(None);
                                    }
                                }
                            }
                            None => next_value,
                        };
                        next_value = value + 1;
                        fields.push((name, value));
                    } else {
                        match self.eval_type(ctx, child)? {
                            Some(t) => subtype = t,
                            None => return Ok(None),
                        }
                    }
                }
                match ctx.ast.node(node).attr.value.clone() {
                    Some(CompVal::Type(t)) => {
                        ctx.types.set_enum_info(t, subtype, fields);
                        Some(t)
                    }
                    _ => {
                        let t = ctx.types.declare_enum(None, EnumInfo {
                            subtype,
                            fields,
                            metafields: Default::default(),
                        });
                        ctx.ast.node_mut(node).attr.value = Some(CompVal::Type(t));
                        Some(t)
                    }
                }
            }
            Tag::GenericType => {
                let name = ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
                if name == "generic" {
                    // declaration form: `@generic(T, ...) <body type>`
                    return self.eval_generic_decl(ctx, node);
                }
                self.eval_generic_instance(ctx, node, &name)?
            }
            Tag::PreprocessExpr => {
                preprocessor::eval_expr_node(ctx, node)?;
                self.visit_expr(ctx, node, None)?;
                match self.val_of(ctx, node) {
                    Some(CompVal::Type(t)) => Some(t),
                    _ => {
                        return Err(CompileError::type_mismatch(
                            "a type value",
                            "a spliced literal",
                            span,
                        ))
                    }
                }
            }
            other => {
                return Err(CompileError::parse(
                    "ExpectedType",
                    format!("{} is not a type expression", other),
                    span,
                ))
            }
        };
        Ok(result)
    }

    fn eval_generic_decl(&mut self, ctx: &mut Context, node: NodeId) -> CompileResult<Option<TypeId>> {
        if let Some(CompVal::Type(t)) = ctx.ast.node(node).attr.value.clone() {
            return Ok(Some(t));
        }
        let children = ctx.ast.children(node);
        let body = *children.last().unwrap();
        let params: Vec<String> = children[..children.len() - 1]
            .iter()
            .filter_map(|&c| ctx.ast.node(c).data.as_name().map(str::to_string))
            .collect();
        let generic_name = ctx.unique_name("generic");
        let t = ctx.types.declare_generic(GenericInfo {
            name: generic_name,
            params,
            node: body,
            cache: Vec::new(),
            expanding: false,
        });
        ctx.ast.node_mut(node).attr.value = Some(CompVal::Type(t));
        Ok(Some(t))
    }

    /// Materialize (or reuse) a concrete type from a generic invocation
    fn eval_generic_instance(
        &mut self,
        ctx: &mut Context,
        node: NodeId,
        name: &str,
    ) -> CompileResult<Option<TypeId>> {
        let span = ctx.ast.node(node).span;
        let generic_ty = match ctx.scopes.resolve(name) {
            Some(sid) => match ctx.scopes.symbol(sid).value.clone() {
                Some(CompVal::Type(t)) => t,
                _ => {
                    self.mark_pending(ctx, node);
                    return Ok(None);
                }
            },
            None => {
                self.mark_pending(ctx, node);
                return Ok(None);
            }
        };
        let (params, body, expanding) = match &ctx.types.get(generic_ty).kind {
            TypeKind::Generic(info) => (info.params.clone(), info.node, info.expanding),
            _ => {
                return Err(CompileError::type_mismatch(
                    "a generic type",
                    ctx.types.display(generic_ty),
                    span,
                ))
            }
        };
        if expanding {
            return Err(CompileError::generic_cycle(name, span));
        }

        // evaluate arguments: types or constant values
        let mut arg_tys = Vec::new();
        let mut arg_vals = Vec::new();
        for child in ctx.ast.children(node) {
            if ctx.ast.tag(child).is_type_expr() {
                match self.eval_type(ctx, child)? {
                    Some(t) => {
                        arg_tys.push(t);
                        arg_vals.push(CompVal::Type(t));
                    }
                    None => return Ok(None),
                }
            } else {
                self.visit_expr(ctx, child, None)?;
                match self.val_of(ctx, child) {
                    Some(v) => {
                        arg_tys.push(self.ty_of(ctx, child).unwrap_or(ctx.types.prims.any));
                        arg_vals.push(v);
                    }
                    None => {
                        self.mark_pending(ctx, node);
                        return Ok(None);
                    }
                }
            }
        }
        if let Some(cached) = ctx.types.find_generic_instance(generic_ty, &arg_tys) {
            return Ok(Some(cached));
        }
        if arg_vals.len() != params.len() {
            return Err(CompileError::type_mismatch(
                format!("{} generic argument(s)", params.len()),
                format!("{}", arg_vals.len()),
                span,
            ));
        }

        // bind parameters as comptime symbols and analyze a fresh copy of
        // the body type expression
        if let TypeKind::Generic(info) = &mut ctx.types.get_mut(generic_ty).kind {
            info.expanding = true;
        }
        let body_clone = ctx.ast.clone_subtree(body);
        let typetype = ctx.types.prims.typetype;
        let int64 = ctx.types.prims.int64;
        ctx.scopes.fork(ScopeKind::Block);
        for (param, value) in params.iter().zip(arg_vals.iter()) {
            let mut symbol = Symbol::new(param, Storage::Comptime, span);
            symbol.ty = Some(match value {
                CompVal::Type(_) => typetype,
                _ => int64,
            });
            symbol.value = Some(value.clone());
            let _ = ctx.scopes.declare(symbol);
        }
        let result = self.eval_type(ctx, body_clone);
        ctx.scopes.pop();
        if let TypeKind::Generic(info) = &mut ctx.types.get_mut(generic_ty).kind {
            info.expanding = false;
        }
        let instance = result?;
        if let Some(instance) = instance {
            ctx.types.cache_generic_instance(generic_ty, arg_tys, instance);
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn analyze_ok(source: &str) -> (Context, Analysis) {
        let mut ctx = Context::new("t.nelua", source);
        let root = parser::parse(&mut ctx).expect("parse failed");
        let analysis = analyze(&mut ctx, root).expect("fatal analysis error");
        assert!(
            ctx.errors.is_empty(),
            "semantic errors: {:?}",
            ctx.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>()
        );
        (ctx, analysis)
    }

    fn analyze_err(source: &str) -> Vec<CompileError> {
        let mut ctx = Context::new("t.nelua", source);
        let root = parser::parse(&mut ctx).expect("parse failed");
        let _ = analyze(&mut ctx, root).expect("fatal analysis error");
        assert!(!ctx.errors.is_empty(), "expected semantic errors");
        ctx.errors
    }

    #[test]
    fn test_scope_push_pop_balance() {
        // every push is matched by a pop on all paths
        let (ctx, _) = analyze_ok(
            "do do do local x = 1 end end end\n\
             while false do local y = 2 end\n\
             if true then local z = 3 else local w = 4 end",
        );
        assert_eq!(ctx.scopes.depth(), 0);
    }

    #[test]
    fn test_scope_count_bounded_by_nesting() {
        let (ctx, analysis) = analyze_ok("do do local x = 1 end end");
        // root + two blocks, reused across fixed-point passes
        assert_eq!(analysis.scopes_of.len(), 3);
        let _ = ctx;
    }

    #[test]
    fn test_forward_reference_needs_second_pass() {
        let (ctx, _) = analyze_ok(
            "local function a(): integer return b() end\n\
             local function b(): integer return 1 end",
        );
        assert_eq!(ctx.scopes.depth(), 0);
    }

    #[test]
    fn test_poly_function_one_eval_per_key() {
        let (ctx, _) = analyze_ok(
            "local function id(x: auto) return x end\n\
             local a = id(1)\n\
             local b = id(2)\n\
             local c = id(1.5)",
        );
        let evals: usize = ctx
            .types
            .iter()
            .filter_map(|(_, t)| match &t.kind {
                TypeKind::Polyfunction(info) => Some(info.evals.len()),
                _ => None,
            })
            .sum();
        // int64 and float64 keys, the second int64 call reuses the first
        assert_eq!(evals, 2);
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let mut ctx = Context::new("t.nelua", "break");
        let root = parser::parse(&mut ctx).expect("parse failed");
        assert!(analyze(&mut ctx, root).is_err());
    }

    #[test]
    fn test_copy_types_are_not_moved() {
        let (ctx, _) = analyze_ok(
            "local R = @record{id: integer}\n\
             function R:__destroy() end\n\
             function R:__copy(): R return $self end\n\
             local a: R = {id = 1}\n\
             local b = a\n\
             local c = a",
        );
        let _ = ctx;
    }

    #[test]
    fn test_table_without_target_cannot_infer() {
        let errs = analyze_err("local t = {1, 2}");
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, ErrorKind::TypeCouldNotBeInferred)));
    }

    #[test]
    fn test_terminated_block_marks_scope() {
        let (ctx, analysis) = analyze_ok("do return 1 end");
        let terminated = analysis
            .scopes_of
            .values()
            .any(|&sid| ctx.scopes.get(sid).alreadydestroyed);
        assert!(terminated);
    }

    #[test]
    fn test_integer_literal_narrowing() {
        // a literal that fits assigns to a narrower integer
        let (_, _) = analyze_ok("local a: int8 = 100");
        let errs = analyze_err("local a: int8 = 1000");
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, ErrorKind::NotAssignable { .. })));
    }
}
