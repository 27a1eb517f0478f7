//! C emitter
//!
//! Lowers the fully-analyzed AST to one portable C translation unit. The
//! output is two concatenated sections: declarations (types, prototypes,
//! globals, runtime helpers) and definitions (function bodies plus `main`).
//! The declaration section is an ordered list so a type can be inserted at
//! a computed position after everything it depends on; records get a
//! forward typedef first, which keeps self-referential pointer fields legal.
//!
//! Every exit path of a scope (fallthrough, `return`, `break`, `continue`,
//! `goto` leaving it) materializes destructor calls for the scope's
//! destroyable symbols in reverse declaration order, followed by its defer
//! blocks in reverse registration order; `return` walks parent scopes up to
//! the enclosing function.

use crate::analyzer::Analysis;
use crate::ast::{CompVal, NodeData, NodeId, Tag};
use crate::context::Context;
use crate::errors::{CompileError, CompileResult};
use crate::scope::{ScopeId, ScopeKind, Storage, SymbolId};
use crate::types::{TypeId, TypeKind};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

/// Emit the C translation unit for an analyzed compilation unit.
/// `cache_hash` lands in the one-line header the toolchain driver uses for
/// artifact reuse.
pub fn generate(
    ctx: &Context,
    analysis: &Analysis,
    root: NodeId,
    cache_hash: &str,
) -> CompileResult<String> {
    let mut cgen = CGen {
        ctx,
        analysis,
        includes: BTreeSet::new(),
        decls: Vec::new(),
        defs: Vec::new(),
        emitted_types: HashMap::new(),
        helpers: HashSet::new(),
        scope_stack: vec![ctx.scopes.root()],
        main_body: String::new(),
        indent: 1,
        tmp_counter: 0,
    };
    cgen.emit_unit(root)?;
    Ok(cgen.finish(cache_hash))
}

/// Emission state of a type in the declaration list
#[derive(Clone, Copy, PartialEq)]
enum TypeState {
    Forward,
    Done,
}

struct CGen<'a> {
    ctx: &'a Context,
    analysis: &'a Analysis,
    includes: BTreeSet<&'static str>,
    /// Ordered declarations; types are inserted at computed positions
    decls: Vec<String>,
    defs: Vec<String>,
    emitted_types: HashMap<TypeId, TypeState>,
    helpers: HashSet<&'static str>,
    scope_stack: Vec<ScopeId>,
    main_body: String,
    indent: usize,
    tmp_counter: u32,
}

impl<'a> CGen<'a> {
    // ============ Output assembly ============

    fn finish(mut self, cache_hash: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "/* generated by nelua {} cache:{} */", crate::VERSION, cache_hash);
        self.includes.insert("<stddef.h>");
        self.includes.insert("<stdint.h>");
        self.includes.insert("<stdbool.h>");
        for include in &self.includes {
            let _ = writeln!(out, "#include {}", include);
        }
        out.push_str(concat!(
            "#if __STDC_VERSION__ >= 201112L\n",
            "#define nelua_static_assert _Static_assert\n",
            "#else\n",
            "#define nelua_static_assert(x, y)\n",
            "#endif\n",
        ));
        out.push_str(
            "nelua_static_assert(sizeof(void*) == 8 || sizeof(void*) == 4, \
             \"unsupported pointer size\");\n",
        );
        for decl in &self.decls {
            out.push_str(decl);
            if !decl.ends_with('\n') {
                out.push('\n');
            }
        }
        for def in &self.defs {
            out.push_str(def);
            if !def.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str("int main(int argc, char** argv) {\n  (void)argc; (void)argv;\n");
        out.push_str(&self.main_body);
        out.push_str("  return 0;\n}\n");
        out
    }

    fn err(&self, message: impl Into<String>, node: NodeId) -> CompileError {
        CompileError::emit(message, self.ctx.ast.node(node).span)
    }

    fn tmp(&mut self, prefix: &str) -> String {
        self.tmp_counter += 1;
        format!("_{}{}", prefix, self.tmp_counter)
    }

    /// Append a runtime helper's prelude to the declaration list exactly once
    fn ensure_helper(&mut self, name: &'static str) {
        if !self.helpers.insert(name) {
            return;
        }
        let code = match name {
            "nelua_noinline" => "#define nelua_noinline __attribute__((noinline))",
            "nelua_noreturn" => concat!(
                "#if __STDC_VERSION__ >= 201112L\n",
                "#define nelua_noreturn _Noreturn\n",
                "#else\n",
                "#define nelua_noreturn\n",
                "#endif"
            ),
            "nelua_unlikely" => concat!(
                "#ifdef __GNUC__\n",
                "#define nelua_unlikely(x) __builtin_expect(!!(x), 0)\n",
                "#else\n",
                "#define nelua_unlikely(x) (x)\n",
                "#endif"
            ),
            "nelua_abort" => {
                self.includes.insert("<stdlib.h>");
                self.ensure_helper("nelua_noreturn");
                "static nelua_noreturn void nelua_abort(void) {\n  abort();\n}"
            }
            "nelua_assert_bounds_" => {
                self.ensure_helper("nelua_unlikely");
                self.ensure_helper("nelua_abort");
                concat!(
                    "static inline intptr_t nelua_assert_bounds_(intptr_t index, uintptr_t len) {\n",
                    "  if(nelua_unlikely((uintptr_t)index >= len)) {\n",
                    "    nelua_abort();\n",
                    "  }\n",
                    "  return index;\n",
                    "}"
                )
            }
            "nlniltype" => "typedef struct nlniltype { char unused_; } nlniltype;",
            "nlany" => concat!(
                "typedef struct nlany {\n",
                "  intptr_t type;\n",
                "  union { intptr_t i; double n; void* p; bool b; } value;\n",
                "} nlany;"
            ),
            "nlstring" => concat!(
                "typedef struct nlstring {\n",
                "  uint8_t* data;\n",
                "  intptr_t size;\n",
                "} nlstring;"
            ),
            "nelua_gc" => {
                self.includes.insert("<setjmp.h>");
                concat!(
                    "extern void nelua_gc_register_root(void* addr, size_t size);\n",
                    "extern void nelua_gc_unregister_root(void* addr);\n",
                    "extern void nelua_gc_reregister_root(void* addr, size_t size);"
                )
            }
            _ => return,
        };
        self.decls.push(code.to_string());
    }

    // ============ Types ============

    /// C name for a type, emitting its declaration on demand
    fn ctype(&mut self, ty: TypeId) -> CompileResult<String> {
        let p = self.ctx.types.prims;
        let name = match &self.ctx.types.get(ty).kind {
            TypeKind::Int(_) | TypeKind::Uint(_) if ty == p.isize => "intptr_t".to_string(),
            TypeKind::Uint(_) if ty == p.usize => "uintptr_t".to_string(),
            TypeKind::Int(k) => format!("int{}_t", k.bits()),
            TypeKind::Uint(k) => format!("uint{}_t", k.bits()),
            TypeKind::Float(f) => match f.bits() {
                32 => "float".to_string(),
                128 => "long double".to_string(),
                _ => "double".to_string(),
            },
            TypeKind::Boolean => "bool".to_string(),
            TypeKind::Character => "char".to_string(),
            TypeKind::Cstring => "char*".to_string(),
            TypeKind::String => {
                self.ensure_helper("nlstring");
                "nlstring".to_string()
            }
            TypeKind::Pointer(None) | TypeKind::Nilptr => "void*".to_string(),
            TypeKind::Niltype => {
                self.ensure_helper("nlniltype");
                "nlniltype".to_string()
            }
            TypeKind::Any => {
                self.ensure_helper("nlany");
                "nlany".to_string()
            }
            TypeKind::Void => "void".to_string(),
            TypeKind::Auto | TypeKind::TypeType | TypeKind::Comptime => {
                return Err(CompileError::emit(
                    format!("type `{}` cannot be materialized in C", self.ctx.types.display(ty)),
                    crate::span::Span::default(),
                ))
            }
            TypeKind::Pointer(Some(sub)) => {
                let sub = *sub;
                match self.ctx.types.get(sub).kind {
                    // aggregates only need their forward declaration
                    TypeKind::Record(_) | TypeKind::Union(_) => {
                        self.emit_type_forward(sub)?;
                        format!("{}*", self.type_codename(sub))
                    }
                    _ => format!("{}*", self.ctype(sub)?),
                }
            }
            TypeKind::Polyfunction(_) => "void*".to_string(),
            TypeKind::Array { .. }
            | TypeKind::Record(_)
            | TypeKind::Union(_)
            | TypeKind::Enum(_)
            | TypeKind::Function(_)
            | TypeKind::Optional(_) => {
                self.emit_type(ty)?;
                self.type_codename(ty)
            }
            TypeKind::Generic(_) => {
                return Err(CompileError::emit(
                    "a generic type escaped analysis without instantiation",
                    crate::span::Span::default(),
                ))
            }
        };
        Ok(name)
    }

    fn type_codename(&self, ty: TypeId) -> String {
        self.ctx.types.codename(ty).to_string()
    }

    /// Forward-declare an aggregate (enough for pointers to it)
    fn emit_type_forward(&mut self, ty: TypeId) -> CompileResult<()> {
        if self.emitted_types.contains_key(&ty) {
            return Ok(());
        }
        match &self.ctx.types.get(ty).kind {
            TypeKind::Record(_) | TypeKind::Union(_) => {
                let name = self.type_codename(ty);
                let kw = if matches!(self.ctx.types.get(ty).kind, TypeKind::Union(_)) {
                    "union"
                } else {
                    "struct"
                };
                self.decls.push(format!("typedef {} {} {};", kw, name, name));
                self.emitted_types.insert(ty, TypeState::Forward);
                Ok(())
            }
            _ => {
                // non-aggregates go straight to their full declaration
                let _ = self.ctype(ty)?;
                Ok(())
            }
        }
    }

    /// Fully declare a type, inserting it after its dependencies
    fn emit_type(&mut self, ty: TypeId) -> CompileResult<()> {
        if self.emitted_types.get(&ty) == Some(&TypeState::Done) {
            return Ok(());
        }
        match self.ctx.types.get(ty).kind.clone() {
            TypeKind::Array { elem, len } => {
                let elem_c = self.ctype(elem)?;
                let name = self.type_codename(ty);
                let len = len.max(1);
                self.decls.push(format!(
                    "typedef struct {} {{ {} v[{}]; }} {};",
                    name, elem_c, len, name
                ));
                self.emitted_types.insert(ty, TypeState::Done);
            }
            TypeKind::Record(info) => {
                self.emit_type_forward(ty)?;
                self.emitted_types.insert(ty, TypeState::Done);
                let mut body = String::new();
                for field in &info.fields {
                    let field_c = self.ctype(field.ty)?;
                    let _ = write!(body, "\n  {} {};", field_c, field.name);
                }
                if info.fields.is_empty() {
                    body.push_str("\n  char unused_;");
                }
                let name = self.type_codename(ty);
                let packed = if info.packed { " __attribute__((packed))" } else { "" };
                let aligned = match info.aligned {
                    Some(n) => format!(" __attribute__((aligned({})))", n),
                    None => String::new(),
                };
                self.decls.push(format!(
                    "struct{}{} {} {{{}\n}};",
                    packed, aligned, name, body
                ));
            }
            TypeKind::Union(info) => {
                self.emit_type_forward(ty)?;
                self.emitted_types.insert(ty, TypeState::Done);
                let mut body = String::new();
                for variant in &info.variants {
                    let field_c = self.ctype(variant.ty)?;
                    let _ = write!(body, "\n  {} {};", field_c, variant.name);
                }
                if info.variants.is_empty() {
                    body.push_str("\n  char unused_;");
                }
                let name = self.type_codename(ty);
                self.decls.push(format!("union {} {{{}\n}};", name, body));
            }
            TypeKind::Enum(info) => {
                let sub_c = self.ctype(info.subtype)?;
                let name = self.type_codename(ty);
                let mut decl = format!("typedef {} {};", sub_c, name);
                for (field, value) in &info.fields {
                    let _ = write!(decl, "\n#define {}_{} (({}){})", name, field, name, value);
                }
                self.decls.push(decl);
                self.emitted_types.insert(ty, TypeState::Done);
            }
            TypeKind::Function(info) => {
                let name = self.type_codename(ty);
                let ret = self.ret_ctype(&info.rets, ty)?;
                let mut args = Vec::new();
                for &arg in &info.args {
                    args.push(self.ctype(arg)?);
                }
                if args.is_empty() {
                    args.push("void".to_string());
                }
                self.decls.push(format!(
                    "typedef {} (*{})({});",
                    ret,
                    name,
                    args.join(", ")
                ));
                self.emitted_types.insert(ty, TypeState::Done);
            }
            TypeKind::Optional(sub) => {
                let sub_c = self.ctype(sub)?;
                let name = self.type_codename(ty);
                self.decls.push(format!(
                    "typedef struct {} {{ bool filled; {} value; }} {};",
                    name, sub_c, name
                ));
                self.emitted_types.insert(ty, TypeState::Done);
            }
            _ => {
                let _ = self.ctype(ty)?;
            }
        }
        Ok(())
    }

    /// C return type for a return tuple; N>1 returns materialize a
    /// generated aggregate struct
    fn ret_ctype(&mut self, rets: &[TypeId], fty: TypeId) -> CompileResult<String> {
        match rets.len() {
            0 => Ok("void".to_string()),
            1 => self.ctype(rets[0]),
            _ => {
                let name = format!("{}_ret", self.type_codename(fty));
                if !self.decls.iter().any(|d| d.contains(&format!("}} {};", name))) {
                    let mut body = String::new();
                    for (i, &ret) in rets.iter().enumerate() {
                        let c = self.ctype(ret)?;
                        let _ = write!(body, " {} r{};", c, i);
                    }
                    self.decls.push(format!("typedef struct {} {{{} }} {};", name, body, name));
                }
                Ok(name)
            }
        }
    }

    // ============ Unit emission ============

    fn emit_unit(&mut self, root: NodeId) -> CompileResult<()> {
        // static globals first, in declaration order (also the GC root
        // registration order)
        let mut body = String::new();
        self.emit_block_children(root, &mut body)?;

        // register pointer-bearing statics with the GC before user code
        if !self.ctx.pragmas.nogc {
            let mut registrations = String::new();
            for &sid in self.ctx.scopes.root_symbols() {
                let symbol = self.ctx.scopes.symbol(sid);
                if symbol.storage != Storage::Static {
                    continue;
                }
                let Some(ty) = symbol.ty else { continue };
                if self.ctx.types.has_gc_pointers(ty) {
                    self.ensure_helper("nelua_gc");
                    let _ = writeln!(
                        registrations,
                        "  nelua_gc_register_root((void*)&{}, sizeof({}));",
                        symbol.name, symbol.name
                    );
                }
            }
            self.main_body.push_str(&registrations);
        }
        self.main_body.push_str(&body);
        Ok(())
    }

    // ============ Statements ============

    fn emit_block_children(&mut self, block: NodeId, out: &mut String) -> CompileResult<()> {
        for &stmt in &self.ctx.ast.node(block).children {
            self.emit_stmt(stmt, out)?;
        }
        // fallthrough exit of the block's scope; skipped when the block
        // terminated and the exit path already ran the cleanup
        if let Some(&scope) = self.analysis.scopes_of.get(&block) {
            if !self.ctx.scopes.get(scope).alreadydestroyed {
                self.emit_scope_cleanup(scope, out)?;
            }
        }
        Ok(())
    }

    fn line(&self, out: &mut String, text: &str) {
        for _ in 0..self.indent {
            out.push_str("  ");
        }
        out.push_str(text);
        out.push('\n');
    }

    fn emit_stmt(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        match self.ctx.ast.tag(node) {
            Tag::VarDecl => self.emit_var_decl(node, out),
            Tag::Assign => self.emit_assign(node, out),
            Tag::Call | Tag::CallMethod => {
                let mut prelude = String::new();
                let expr = self.emit_expr(node, &mut prelude)?;
                out.push_str(&prelude);
                self.line(out, &format!("{};", expr));
                Ok(())
            }
            Tag::FuncDef => self.emit_func_def(node),
            Tag::Return => self.emit_return(node, out),
            Tag::If => self.emit_if(node, out),
            Tag::Do => {
                let block = self.ctx.ast.children(node)[0];
                self.emit_scoped_block(block, out)
            }
            Tag::Defer => Ok(()), // runs at scope exits
            Tag::While => self.emit_while(node, out),
            Tag::Repeat => self.emit_repeat(node, out),
            Tag::ForNum => self.emit_for_num(node, out),
            Tag::ForIn => self.emit_for_in(node, out),
            Tag::Switch => self.emit_switch(node, out),
            Tag::Break => {
                self.emit_exit_cleanup(out, true)?;
                self.line(out, "break;");
                Ok(())
            }
            Tag::Continue => {
                self.emit_exit_cleanup(out, true)?;
                self.line(out, "continue;");
                Ok(())
            }
            Tag::Label => {
                let name = self.ctx.ast.node(node).data.as_name().unwrap_or_default();
                self.line(out, &format!("{}:;", name));
                Ok(())
            }
            Tag::Goto => self.emit_goto(node, out),
            Tag::PragmaCall | Tag::Preprocess | Tag::PreprocessExpr => Ok(()),
            // a statement-position splice may have left a bare literal
            Tag::Number | Tag::Boolean | Tag::Nil | Tag::String => Ok(()),
            other => Err(self.err(format!("cannot emit {} as a statement", other), node)),
        }
    }

    fn emit_scoped_block(&mut self, block: NodeId, out: &mut String) -> CompileResult<()> {
        self.line(out, "{");
        self.indent += 1;
        if let Some(&scope) = self.analysis.scopes_of.get(&block) {
            self.scope_stack.push(scope);
        }
        let result = self.emit_block_children(block, out);
        if self.analysis.scopes_of.contains_key(&block) {
            self.scope_stack.pop();
        }
        self.indent -= 1;
        self.line(out, "}");
        result
    }

    /// Destructors (reverse declaration order) then defer blocks (reverse
    /// registration order) for one scope
    fn emit_scope_cleanup(&mut self, scope: ScopeId, out: &mut String) -> CompileResult<()> {
        let symbols: Vec<SymbolId> = self.ctx.scopes.get(scope).symbols.clone();
        for &sid in symbols.iter().rev() {
            let symbol = self.ctx.scopes.symbol(sid);
            if symbol.storage != Storage::Local || symbol.moved {
                continue;
            }
            let Some(ty) = symbol.ty else { continue };
            if !self.ctx.types.has_destroy(ty) {
                continue;
            }
            let name = symbol.name.clone();
            if let Some(dtor) = self.ctx.types.metafield(ty, "__destroy") {
                let dtor_name = self.ctx.scopes.symbol(dtor).name.clone();
                self.line(out, &format!("{}(&{});", dtor_name, name));
            }
        }
        let defers: Vec<NodeId> = self.ctx.scopes.get(scope).deferblocks.clone();
        for &defer in defers.iter().rev() {
            let block = self.ctx.ast.children(defer)[0];
            self.emit_scoped_block(block, out)?;
        }
        Ok(())
    }

    /// Cleanup for an early exit: every scope from the innermost out to
    /// (and including) the loop for `break`/`continue`, or to the function
    /// for `return`.
    fn emit_exit_cleanup(&mut self, out: &mut String, to_loop: bool) -> CompileResult<()> {
        for &scope in self.scope_stack.clone().iter().rev() {
            self.emit_scope_cleanup(scope, out)?;
            let kind = self.ctx.scopes.get(scope).kind;
            if to_loop && kind == ScopeKind::Loop {
                break;
            }
            if !to_loop && matches!(kind, ScopeKind::Function | ScopeKind::Root) {
                break;
            }
        }
        Ok(())
    }

    fn emit_goto(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let name = self.ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        // unwind scopes between here and the scope holding the label
        for &scope in self.scope_stack.clone().iter().rev() {
            if self.ctx.scopes.get(scope).labels.contains_key(&name) {
                break;
            }
            self.emit_scope_cleanup(scope, out)?;
        }
        self.line(out, &format!("goto {};", name));
        Ok(())
    }

    fn emit_var_decl(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let storage = match self.ctx.ast.node(node).data.as_name() {
            Some("global") => Storage::Static,
            _ => Storage::Local,
        };
        let children = self.ctx.ast.children(node);
        let decls: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|&c| self.ctx.ast.tag(c) == Tag::IdDecl)
            .collect();
        let values: Vec<NodeId> = children
            .iter()
            .copied()
            .filter(|&c| self.ctx.ast.tag(c) != Tag::IdDecl)
            .collect();

        // a trailing multiple-return call fans out through a temporary
        let mut multi_tmp: Option<(String, usize)> = None;
        if decls.len() > values.len() && !values.is_empty() {
            let &last = values.last().unwrap();
            if matches!(self.ctx.ast.tag(last), Tag::Call | Tag::CallMethod) {
                if let Some(fty) = self.callee_fty(last) {
                    if let TypeKind::Function(info) = &self.ctx.types.get(fty).kind {
                        if info.rets.len() > 1 {
                            let rets = info.rets.clone();
                            let ret_c = self.ret_ctype(&rets, fty)?;
                            let mut prelude = String::new();
                            let call = self.emit_expr(last, &mut prelude)?;
                            out.push_str(&prelude);
                            let tmp = self.tmp("mr");
                            self.line(out, &format!("{} {} = {};", ret_c, tmp, call));
                            multi_tmp = Some((tmp, values.len() - 1));
                        }
                    }
                }
            }
        }

        for (i, &decl) in decls.iter().enumerate() {
            let attr = &self.ctx.ast.node(decl).attr;
            let Some(sid) = attr.symbol else { continue };
            let symbol = self.ctx.scopes.symbol(sid);
            if symbol.storage == Storage::Comptime {
                continue; // types and comptime constants leave no C residue
            }
            let Some(ty) = symbol.ty else { continue };
            if ty == self.ctx.types.prims.typetype {
                continue;
            }
            let name = symbol.name.clone();
            let c_ty = self.ctype(ty)?;

            let init = if let Some((tmp, first_multi)) = &multi_tmp {
                if i >= *first_multi {
                    Some(format!("{}.r{}", tmp, i - first_multi))
                } else {
                    self.init_for(values.get(i).copied(), ty, out)?
                }
            } else {
                self.init_for(values.get(i).copied(), ty, out)?
            };

            match storage {
                Storage::Static => {
                    // statics live in the declaration section; non-constant
                    // initializers run at startup inside main
                    match init {
                        Some(init) if self.is_const_init(values.get(i).copied()) => {
                            self.decls.push(format!("static {} {} = {};", c_ty, name, init));
                        }
                        Some(init) => {
                            self.decls.push(format!("static {} {};", c_ty, name));
                            self.line(out, &format!("{} = {};", name, init));
                        }
                        None => {
                            self.decls.push(format!(
                                "static {} {} = {};",
                                c_ty,
                                name,
                                self.zero_init(ty)
                            ));
                        }
                    }
                }
                _ => {
                    let init = init.unwrap_or_else(|| self.zero_init(ty));
                    // a moved-from initializer suppresses its destructor at
                    // the origin; a copiable one goes through `__copy`
                    self.line(out, &format!("{} {} = {};", c_ty, name, init));
                }
            }
        }
        Ok(())
    }

    /// Whether an initializer lowers to a C constant expression
    fn is_const_init(&self, value: Option<NodeId>) -> bool {
        value.map_or(false, |v| self.ctx.ast.node(v).attr.value.is_some())
    }

    fn init_for(
        &mut self,
        value: Option<NodeId>,
        ty: TypeId,
        out: &mut String,
    ) -> CompileResult<Option<String>> {
        let Some(value) = value else { return Ok(None) };
        let mut prelude = String::new();
        let mut expr = self.emit_expr(value, &mut prelude)?;
        out.push_str(&prelude);
        // insert `__copy` when the source is a live (unmoved) owned value
        if self.ctx.ast.node(value).attr.maymove && !self.ctx.ast.node(value).attr.moved {
            if let Some(copy) = self.ctx.types.metafield(ty, "__copy") {
                let copy_name = self.ctx.scopes.symbol(copy).name.clone();
                expr = format!("{}(&{})", copy_name, expr);
            }
        }
        Ok(Some(expr))
    }

    fn zero_init(&self, ty: TypeId) -> String {
        match &self.ctx.types.get(ty).kind {
            TypeKind::Int(_) | TypeKind::Uint(_) => "0".to_string(),
            TypeKind::Float(_) => "0.0".to_string(),
            TypeKind::Boolean => "false".to_string(),
            TypeKind::Character => "0".to_string(),
            TypeKind::Pointer(_) | TypeKind::Nilptr | TypeKind::Cstring => "NULL".to_string(),
            _ => "{0}".to_string(),
        }
    }

    fn callee_fty(&self, call: NodeId) -> Option<TypeId> {
        match self.ctx.ast.tag(call) {
            Tag::Call => {
                let callee = self.ctx.ast.children(call)[0];
                self.ctx.ast.node(callee).attr.ty
            }
            Tag::CallMethod => {
                let sid = self.ctx.ast.node(call).attr.symbol?;
                self.ctx.scopes.symbol(sid).ty
            }
            _ => None,
        }
    }

    fn emit_assign(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let (ntargets, _) = self.ctx.ast.node(node).data.arity();
        let children = self.ctx.ast.children(node);
        let (targets, values) = children.split_at(ntargets);

        if targets.len() == 1 && values.len() == 1 {
            let mut prelude = String::new();
            let target = self.emit_expr(targets[0], &mut prelude)?;
            let value = self.emit_expr(values[0], &mut prelude)?;
            out.push_str(&prelude);
            self.line(out, &format!("{} = {};", target, value));
            return Ok(());
        }

        // multiple assignment evaluates into temporaries first, so swaps
        // behave
        let mut tmps = Vec::new();
        let mut prelude = String::new();
        for &value in values {
            let ty = self.ctx.ast.node(value).attr.ty.unwrap_or(self.ctx.types.prims.any);
            let c_ty = self.ctype(ty)?;
            let expr = self.emit_expr(value, &mut prelude)?;
            let tmp = self.tmp("as");
            out.push_str(&std::mem::take(&mut prelude));
            self.line(out, &format!("{} {} = {};", c_ty, tmp, expr));
            tmps.push(tmp);
        }
        for (i, &target) in targets.iter().enumerate() {
            if let Some(tmp) = tmps.get(i) {
                let mut prelude = String::new();
                let target = self.emit_expr(target, &mut prelude)?;
                out.push_str(&prelude);
                self.line(out, &format!("{} = {};", target, tmp));
            }
        }
        Ok(())
    }

    fn emit_return(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let exprs = self.ctx.ast.children(node);
        let at_root = !self
            .scope_stack
            .iter()
            .any(|&s| self.ctx.scopes.get(s).kind == ScopeKind::Function);

        if exprs.is_empty() {
            self.emit_exit_cleanup(out, false)?;
            self.line(out, if at_root { "return 0;" } else { "return;" });
            return Ok(());
        }

        // evaluate first, then run cleanup, then return the temporary
        let mut prelude = String::new();
        if at_root {
            let expr = self.emit_expr(exprs[0], &mut prelude)?;
            out.push_str(&prelude);
            let tmp = self.tmp("ret");
            self.line(out, &format!("int {} = (int)({});", tmp, expr));
            self.emit_exit_cleanup(out, false)?;
            self.line(out, &format!("return {};", tmp));
            return Ok(());
        }

        let fn_scope = self
            .scope_stack
            .iter()
            .rev()
            .copied()
            .find(|&s| self.ctx.scopes.get(s).kind == ScopeKind::Function)
            .unwrap();
        let fty = self.ctx.scopes.get(fn_scope).functype;
        let rets = match fty.map(|t| self.ctx.types.get(t).kind.clone()) {
            Some(TypeKind::Function(info)) => info.rets,
            _ => Vec::new(),
        };
        if rets.len() > 1 {
            let ret_c = self.ret_ctype(&rets, fty.unwrap())?;
            let mut fields = Vec::new();
            for &expr in &exprs {
                fields.push(self.emit_expr(expr, &mut prelude)?);
            }
            out.push_str(&prelude);
            let tmp = self.tmp("ret");
            self.line(
                out,
                &format!("{} {} = {{{}}};", ret_c, tmp, fields.join(", ")),
            );
            self.emit_exit_cleanup(out, false)?;
            self.line(out, &format!("return {};", tmp));
        } else {
            let c_ty = match rets.first() {
                Some(&t) => self.ctype(t)?,
                None => "void".to_string(),
            };
            let expr = self.emit_expr(exprs[0], &mut prelude)?;
            out.push_str(&prelude);
            if c_ty == "void" {
                self.emit_exit_cleanup(out, false)?;
                self.line(out, &format!("{};", expr));
                self.line(out, "return;");
            } else {
                let tmp = self.tmp("ret");
                self.line(out, &format!("{} {} = {};", c_ty, tmp, expr));
                self.emit_exit_cleanup(out, false)?;
                self.line(out, &format!("return {};", tmp));
            }
        }
        Ok(())
    }

    fn emit_if(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let children = self.ctx.ast.children(node);
        let mut i = 0;
        let mut first = true;
        while i + 1 < children.len() {
            let mut prelude = String::new();
            let cond = self.emit_truthy(children[i], &mut prelude)?;
            out.push_str(&prelude);
            let kw = if first { "if" } else { "} else if" };
            self.line(out, &format!("{} ({}) {{", kw, cond));
            self.indent += 1;
            self.emit_block_body(children[i + 1], out)?;
            self.indent -= 1;
            first = false;
            i += 2;
        }
        if i < children.len() {
            self.line(out, "} else {");
            self.indent += 1;
            self.emit_block_body(children[i], out)?;
            self.indent -= 1;
        }
        self.line(out, "}");
        Ok(())
    }

    /// Block body without the surrounding braces (the caller printed them)
    fn emit_block_body(&mut self, block: NodeId, out: &mut String) -> CompileResult<()> {
        if let Some(&scope) = self.analysis.scopes_of.get(&block) {
            self.scope_stack.push(scope);
        }
        let result = self.emit_block_children(block, out);
        if self.analysis.scopes_of.contains_key(&block) {
            self.scope_stack.pop();
        }
        result
    }

    fn emit_while(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let children = self.ctx.ast.children(node);
        let mut prelude = String::new();
        let cond = self.emit_truthy(children[0], &mut prelude)?;
        if prelude.is_empty() {
            self.line(out, &format!("while ({}) {{", cond));
        } else {
            // a condition with hoisted temporaries re-evaluates inside
            self.line(out, "while (true) {");
            self.indent += 1;
            out.push_str(&prelude);
            self.line(out, &format!("if (!({})) break;", cond));
            self.indent -= 1;
        }
        self.indent += 1;
        self.emit_block_body(children[1], out)?;
        self.indent -= 1;
        self.line(out, "}");
        Ok(())
    }

    fn emit_repeat(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let children = self.ctx.ast.children(node);
        let cond_tmp = self.tmp("until");
        self.line(out, &format!("bool {} = false;", cond_tmp));
        self.line(out, "do {");
        self.indent += 1;
        if let Some(&scope) = self.analysis.scopes_of.get(&children[0]) {
            self.scope_stack.push(scope);
        }
        for &stmt in &self.ctx.ast.node(children[0]).children {
            self.emit_stmt(stmt, out)?;
        }
        // the until-condition sees the body scope, so it is evaluated
        // before the scope's cleanup
        let mut prelude = String::new();
        let cond = self.emit_truthy(children[1], &mut prelude)?;
        out.push_str(&prelude);
        self.line(out, &format!("{} = {};", cond_tmp, cond));
        if let Some(&scope) = self.analysis.scopes_of.get(&children[0]) {
            self.emit_scope_cleanup(scope, out)?;
            self.scope_stack.pop();
        }
        self.indent -= 1;
        self.line(out, &format!("}} while (!{});", cond_tmp));
        Ok(())
    }

    fn emit_for_num(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let children = self.ctx.ast.children(node);
        let decl = children[0];
        let block = *children.last().unwrap();
        let bounds = &children[1..children.len() - 1];

        let sid = self.ctx.ast.node(decl).attr.symbol.ok_or_else(|| {
            self.err("loop variable escaped analysis", node)
        })?;
        let name = self.ctx.scopes.symbol(sid).name.clone();
        let ty = self.ctx.scopes.symbol(sid).ty.unwrap_or(self.ctx.types.prims.int64);
        let c_ty = self.ctype(ty)?;

        let mut prelude = String::new();
        let begin = self.emit_expr(bounds[0], &mut prelude)?;
        let stop = self.emit_expr(bounds[1], &mut prelude)?;
        let step = if bounds.len() > 2 {
            Some(self.emit_expr(bounds[2], &mut prelude)?)
        } else {
            None
        };
        out.push_str(&prelude);

        let stop_tmp = self.tmp("stop");
        self.line(out, &format!("{} {} = {};", c_ty, stop_tmp, stop));
        let descending = matches!(
            bounds.get(2).and_then(|&b| self.ctx.ast.node(b).attr.value.clone()),
            Some(CompVal::Int(i)) if i < 0
        );
        let cmp = if descending { ">=" } else { "<=" };
        let step = step.unwrap_or_else(|| "1".to_string());
        self.line(
            out,
            &format!(
                "for ({} {} = {}; {} {} {}; {} += {}) {{",
                c_ty, name, begin, name, cmp, stop_tmp, name, step
            ),
        );
        self.indent += 1;
        self.emit_block_body(block, out)?;
        self.indent -= 1;
        self.line(out, "}");
        Ok(())
    }

    fn emit_for_in(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let (nvars, nexprs) = self.ctx.ast.node(node).data.arity();
        let children = self.ctx.ast.children(node);
        let vars = &children[..nvars];
        let iter = children[nvars];
        let block = *children.last().unwrap();
        let _ = nexprs;

        let iter_ty = self.ctx.ast.node(iter).attr.ty.ok_or_else(|| {
            self.err("iterator expression escaped analysis", node)
        })?;
        let (len, is_ptr) = match self.ctx.types.get(iter_ty).kind {
            TypeKind::Array { len, .. } => (len, false),
            TypeKind::Pointer(Some(sub)) => match self.ctx.types.get(sub).kind {
                TypeKind::Array { len, .. } => (len, true),
                _ => return Err(self.err("cannot iterate this value", node)),
            },
            _ => return Err(self.err("cannot iterate this value", node)),
        };

        let mut prelude = String::new();
        let iter_c = self.emit_expr(iter, &mut prelude)?;
        out.push_str(&prelude);
        let arr_tmp = self.tmp("arr");
        let iter_cty = self.ctype(iter_ty)?;
        self.line(out, &format!("{} {} = {};", iter_cty, arr_tmp, iter_c));
        let access = if is_ptr { "->" } else { "." };

        let index_name = vars
            .first()
            .and_then(|&v| self.ctx.ast.node(v).attr.symbol)
            .map(|sid| self.ctx.scopes.symbol(sid).name.clone())
            .unwrap_or_else(|| self.tmp("i"));
        self.line(
            out,
            &format!(
                "for (intptr_t {} = 0; {} < {}; {}++) {{",
                index_name, index_name, len, index_name
            ),
        );
        self.indent += 1;
        if let Some(&var) = vars.get(1) {
            if let Some(sid) = self.ctx.ast.node(var).attr.symbol {
                let name = self.ctx.scopes.symbol(sid).name.clone();
                let ty = self.ctx.scopes.symbol(sid).ty.unwrap();
                let c_ty = self.ctype(ty)?;
                self.line(
                    out,
                    &format!("{} {} = {}{}v[{}];", c_ty, name, arr_tmp, access, index_name),
                );
            }
        }
        self.emit_block_body(block, out)?;
        self.indent -= 1;
        self.line(out, "}");
        Ok(())
    }

    fn emit_switch(&mut self, node: NodeId, out: &mut String) -> CompileResult<()> {
        let children = self.ctx.ast.children(node);
        let has_else = children.len() % 2 == 0;
        let pairs_end = if has_else { children.len() - 1 } else { children.len() };

        let mut prelude = String::new();
        let scrut = self.emit_expr(children[0], &mut prelude)?;
        out.push_str(&prelude);
        self.line(out, &format!("switch ({}) {{", scrut));
        self.indent += 1;

        // consecutive case values sharing one block become one case group
        let mut i = 1;
        while i + 1 < pairs_end {
            let block = children[i + 1];
            let mut labels = Vec::new();
            while i + 1 < pairs_end && children[i + 1] == block {
                let value = children[i];
                let label = match self.ctx.ast.node(value).attr.value {
                    Some(CompVal::Int(v)) => format!("{}", v),
                    _ => self.emit_expr(value, &mut String::new())?,
                };
                labels.push(format!("case {}:", label));
                i += 2;
            }
            self.line(out, &labels.join(" "));
            self.emit_scoped_block(block, out)?;
            self.line(out, "break;");
        }
        if has_else {
            self.line(out, "default:");
            let block = *children.last().unwrap();
            self.emit_scoped_block(block, out)?;
            self.line(out, "break;");
        }
        self.indent -= 1;
        self.line(out, "}");
        Ok(())
    }

    // ============ Functions ============

    fn emit_func_def(&mut self, node: NodeId) -> CompileResult<()> {
        let children = self.ctx.ast.children(node);
        let target = children[0];
        let sid = match self.ctx.ast.node(target).attr.symbol {
            Some(sid) => sid,
            None => return Ok(()),
        };
        let fty = match self.ctx.scopes.symbol(sid).ty {
            Some(t) => t,
            None => return Ok(()),
        };
        if self.ctx.types.is_polyfunction(fty) {
            // every eval of a polymorphic function is its own C function
            let evals = match &self.ctx.types.get(fty).kind {
                TypeKind::Polyfunction(info) => info.evals.clone(),
                _ => Vec::new(),
            };
            for eval in evals {
                self.emit_function_like(eval.node, &eval.name, eval.ty)?;
            }
            return Ok(());
        }
        let name = self.ctx.scopes.symbol(sid).name.clone();
        self.emit_function_like(node, &name, fty)
    }

    /// Emit one concrete function: prototype into the declarations,
    /// body into the definitions.
    fn emit_function_like(
        &mut self,
        fdef: NodeId,
        name: &str,
        fty: TypeId,
    ) -> CompileResult<()> {
        let (nparams, _) = match &self.ctx.ast.node(fdef).data {
            NodeData::NameArity { a, b, .. } => (*a as usize, *b as usize),
            NodeData::Arity { a, b } => (*a as usize, *b as usize),
            _ => (0, 0),
        };
        let skip = if self.ctx.ast.tag(fdef) == Tag::FuncDef { 1 } else { 0 };
        let children = self.ctx.ast.children(fdef);
        let params: Vec<NodeId> = children[skip..skip + nparams].to_vec();
        let block = *children.last().unwrap();

        let info = match self.ctx.types.get(fty).kind.clone() {
            TypeKind::Function(info) => info,
            _ => return Err(self.err("function symbol lost its type", fdef)),
        };
        let ret_c = self.ret_ctype(&info.rets, fty)?;

        // parameter list; an implicit self comes first when the scope
        // declared one
        let mut args = Vec::new();
        let fn_scope = self.analysis.scopes_of.get(&block).copied();
        let mut param_names: Vec<String> = Vec::new();
        if let Some(scope) = fn_scope {
            let declared = &self.ctx.scopes.get(scope).symbols;
            let explicit: HashSet<String> = params
                .iter()
                .filter_map(|&p| self.ctx.ast.node(p).attr.symbol)
                .map(|sid| self.ctx.scopes.symbol(sid).name.clone())
                .collect();
            if let Some(&first) = declared.first() {
                let symbol = self.ctx.scopes.symbol(first);
                if symbol.name == "self" && !explicit.contains("self") {
                    param_names.push("self".to_string());
                }
            }
        }
        for &param in &params {
            if self.ctx.ast.tag(param) == Tag::Varargs {
                continue;
            }
            if let Some(sid) = self.ctx.ast.node(param).attr.symbol {
                param_names.push(self.ctx.scopes.symbol(sid).name.clone());
            }
        }
        for (i, &arg_ty) in info.args.iter().enumerate() {
            let c = self.ctype(arg_ty)?;
            let pname = param_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("_a{}", i));
            args.push(format!("{} {}", c, pname));
        }
        if info.variadic {
            args.push("...".to_string());
        }
        if args.is_empty() {
            args.push("void".to_string());
        }
        let signature = format!("static {} {}({})", ret_c, name, args.join(", "));
        self.decls.push(format!("{};", signature));

        let mut body = String::new();
        let saved_indent = std::mem::replace(&mut self.indent, 1);
        let saved_stack = std::mem::take(&mut self.scope_stack);
        self.scope_stack = vec![self.ctx.scopes.root()];
        if let Some(scope) = fn_scope {
            self.scope_stack.push(scope);
        }
        let result = self.emit_block_children(block, &mut body);
        self.scope_stack = saved_stack;
        self.indent = saved_indent;
        result?;

        self.defs.push(format!("{} {{\n{}}}", signature, body));
        Ok(())
    }

    // ============ Expressions ============

    /// Truthiness of a value per the language rule: only `nil` and `false`
    /// are false.
    fn emit_truthy(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let expr = self.emit_expr(node, prelude)?;
        let ty = self.ctx.ast.node(node).attr.ty;
        Ok(self.truthy_of(ty, &expr))
    }

    fn truthy_of(&self, ty: Option<TypeId>, expr: &str) -> String {
        let Some(ty) = ty else { return expr.to_string() };
        match self.ctx.types.get(ty).kind {
            TypeKind::Boolean => expr.to_string(),
            TypeKind::Niltype => "false".to_string(),
            TypeKind::Optional(_) => format!("({}).filled", expr),
            TypeKind::Pointer(_) | TypeKind::Nilptr | TypeKind::Cstring => {
                format!("({} != NULL)", expr)
            }
            _ => "true".to_string(),
        }
    }

    fn emit_expr(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        // comptime values lower to plain literals
        if let Some(value) = self.ctx.ast.node(node).attr.value.clone() {
            if let Some(lit) = self.literal_of(&value, self.ctx.ast.node(node).attr.ty)? {
                return Ok(lit);
            }
        }
        match self.ctx.ast.tag(node) {
            Tag::Number | Tag::Boolean | Tag::Nil | Tag::String => {
                let value = self.ctx.ast.node(node).attr.value.clone().ok_or_else(|| {
                    self.err("literal escaped analysis", node)
                })?;
                self.literal_of(&value, self.ctx.ast.node(node).attr.ty)?
                    .ok_or_else(|| self.err("literal cannot be lowered", node))
            }
            Tag::Id => {
                let sid = self.ctx.ast.node(node).attr.symbol.ok_or_else(|| {
                    self.err("identifier escaped analysis", node)
                })?;
                Ok(self.ctx.scopes.symbol(sid).name.clone())
            }
            Tag::Paren => {
                let inner = self.ctx.ast.children(node)[0];
                let expr = self.emit_expr(inner, prelude)?;
                Ok(format!("({})", expr))
            }
            Tag::DotIndex => self.emit_dot_index(node, prelude),
            Tag::ArrayIndex => self.emit_array_index(node, prelude),
            Tag::Call => self.emit_call(node, prelude),
            Tag::CallMethod => self.emit_call_method(node, prelude),
            Tag::UnaryOp => self.emit_unary(node, prelude),
            Tag::BinaryOp => self.emit_binary(node, prelude),
            Tag::Table => self.emit_table(node, prelude),
            Tag::Function => {
                // an anonymous function becomes a named static; its name
                // decays to the function pointer value
                let fty = self.ctx.ast.node(node).attr.ty.ok_or_else(|| {
                    self.err("anonymous function escaped analysis", node)
                })?;
                let name = self.tmp("anonfunc");
                self.emit_function_like(node, &name, fty)?;
                Ok(name)
            }
            other => Err(self.err(format!("cannot emit {} as an expression", other), node)),
        }
    }

    fn literal_of(&mut self, value: &CompVal, ty: Option<TypeId>) -> CompileResult<Option<String>> {
        Ok(match value {
            CompVal::Int(i) => {
                let unsigned = ty.map_or(false, |t| {
                    self.ctx.types.is_integer(t) && !self.ctx.types.is_signed(t)
                });
                if unsigned {
                    Some(format!("{}u", i))
                } else if *i == i64::MIN as i128 {
                    Some(format!("({} - 1)", i + 1))
                } else {
                    Some(format!("{}", i))
                }
            }
            CompVal::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    Some(format!("{:.1}", f))
                } else {
                    Some(format!("{}", f))
                }
            }
            CompVal::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            CompVal::Nilptr => Some("NULL".to_string()),
            CompVal::Nil => {
                self.ensure_helper("nlniltype");
                Some("((nlniltype){0})".to_string())
            }
            CompVal::Str(bytes) => {
                let escaped = escape_c_string(bytes);
                match ty.map(|t| &self.ctx.types.get(t).kind) {
                    Some(TypeKind::Cstring) => Some(format!("\"{}\"", escaped)),
                    _ => {
                        self.ensure_helper("nlstring");
                        Some(format!(
                            "((nlstring){{(uint8_t*)\"{}\", {}}})",
                            escaped,
                            bytes.len()
                        ))
                    }
                }
            }
            CompVal::Type(_) => None,
        })
    }

    fn emit_dot_index(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        // metafield access resolves to the function symbol
        if let Some(sid) = self.ctx.ast.node(node).attr.symbol {
            return Ok(self.ctx.scopes.symbol(sid).name.clone());
        }
        let field = self.ctx.ast.node(node).data.as_name().unwrap_or_default().to_string();
        let obj = self.ctx.ast.children(node)[0];
        let obj_expr = self.emit_expr(obj, prelude)?;
        let obj_ty = self.ctx.ast.node(obj).attr.ty;
        let deref = matches!(
            obj_ty.map(|t| &self.ctx.types.get(t).kind),
            Some(TypeKind::Pointer(Some(_)))
        );
        Ok(format!("{}{}{}", obj_expr, if deref { "->" } else { "." }, field))
    }

    fn emit_array_index(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let children = self.ctx.ast.children(node);
        let (obj, index) = (children[0], children[1]);
        let obj_expr = self.emit_expr(obj, prelude)?;
        let index_expr = self.emit_expr(index, prelude)?;
        let obj_ty = self.ctx.ast.node(obj).attr.ty.unwrap();
        let (access, len) = match self.ctx.types.get(obj_ty).kind {
            TypeKind::Array { len, .. } => (".", len),
            TypeKind::Pointer(Some(sub)) => match self.ctx.types.get(sub).kind {
                TypeKind::Array { len, .. } => ("->", len),
                _ => return Err(self.err("cannot index this value", node)),
            },
            _ => return Err(self.err("cannot index this value", node)),
        };
        let index_expr = if self.ctx.ast.node(node).attr.checkcast {
            self.ensure_helper("nelua_assert_bounds_");
            format!("nelua_assert_bounds_({}, {})", index_expr, len)
        } else {
            index_expr
        };
        Ok(format!("{}{}v[{}]", obj_expr, access, index_expr))
    }

    fn emit_call(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let children = self.ctx.ast.children(node);
        let callee = children[0];
        let args = &children[1..];
        let callee_ty = self.ctx.ast.node(callee).attr.ty.ok_or_else(|| {
            self.err("call escaped analysis", node)
        })?;

        // explicit cast
        if callee_ty == self.ctx.types.prims.typetype {
            let target = self.ctx.ast.node(node).attr.ty.unwrap();
            let target_c = self.ctype(target)?;
            let arg = self.emit_expr(args[0], prelude)?;
            return Ok(format!("(({})({}))", target_c, arg));
        }

        let mut arg_exprs = Vec::new();
        for &arg in args {
            arg_exprs.push(self.emit_expr(arg, prelude)?);
        }

        // polymorphic calls resolve to the eval for their argument types
        if self.ctx.types.is_polyfunction(callee_ty) {
            let key: Vec<TypeId> = args
                .iter()
                .filter_map(|&a| self.ctx.ast.node(a).attr.ty)
                .collect();
            let eval = self
                .ctx
                .types
                .find_eval(callee_ty, &key)
                .ok_or_else(|| self.err("missing specialization for this call", node))?;
            return Ok(format!("{}({})", eval.name, arg_exprs.join(", ")));
        }

        let callee_expr = self.emit_expr(callee, prelude)?;
        Ok(format!("{}({})", callee_expr, arg_exprs.join(", ")))
    }

    fn emit_call_method(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let sid = self.ctx.ast.node(node).attr.symbol.ok_or_else(|| {
            self.err("method call escaped analysis", node)
        })?;
        let fname = self.ctx.scopes.symbol(sid).name.clone();
        let children = self.ctx.ast.children(node);
        let obj = children[0];
        let obj_expr = self.emit_expr(obj, prelude)?;
        let obj_ty = self.ctx.ast.node(obj).attr.ty.unwrap();
        let self_arg = if self.ctx.types.is_pointer(obj_ty) {
            obj_expr
        } else {
            format!("&{}", obj_expr)
        };
        let mut arg_exprs = vec![self_arg];
        for &arg in &children[1..] {
            arg_exprs.push(self.emit_expr(arg, prelude)?);
        }
        Ok(format!("{}({})", fname, arg_exprs.join(", ")))
    }

    fn emit_unary(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let op = self.ctx.ast.node(node).data.as_op().unwrap_or("");
        let operand = self.ctx.ast.children(node)[0];
        let expr = self.emit_expr(operand, prelude)?;
        let ty = self.ctx.ast.node(operand).attr.ty;
        Ok(match op {
            "neg" => format!("(-{})", expr),
            "not" => format!("(!{})", self.truthy_of(ty, &expr)),
            "bnot" => format!("(~{})", expr),
            "ref" => format!("(&{})", expr),
            "deref" => format!("(*{})", expr),
            "len" => match ty.map(|t| self.ctx.types.get(t).kind.clone()) {
                Some(TypeKind::String) => format!("({}).size", expr),
                Some(TypeKind::Cstring) => {
                    self.includes.insert("<string.h>");
                    format!("(intptr_t)strlen({})", expr)
                }
                Some(TypeKind::Array { len, .. }) => format!("{}", len),
                _ => return Err(self.err("cannot take the length of this value", node)),
            },
            other => return Err(self.err(format!("unknown unary operator `{}`", other), node)),
        })
    }

    fn emit_binary(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let op = self.ctx.ast.node(node).data.as_op().unwrap_or("");
        let children = self.ctx.ast.children(node);
        let (lhs, rhs) = (children[0], children[1]);

        // operator metafield dispatch
        if let Some(sid) = self.ctx.ast.node(node).attr.symbol {
            let fname = self.ctx.scopes.symbol(sid).name.clone();
            let l = self.emit_expr(lhs, prelude)?;
            let r = self.emit_expr(rhs, prelude)?;
            return Ok(format!("{}({}, {})", fname, l, r));
        }

        let lty = self.ctx.ast.node(lhs).attr.ty;
        let rty = self.ctx.ast.node(rhs).attr.ty;
        let result_ty = self.ctx.ast.node(node).attr.ty;

        if matches!(op, "and" | "or") {
            let both_bool = lty.map_or(false, |t| self.ctx.types.is_boolean(t))
                && rty.map_or(false, |t| self.ctx.types.is_boolean(t));
            let l = self.emit_expr(lhs, prelude)?;
            if both_bool {
                let r = self.emit_expr(rhs, prelude)?;
                let c_op = if op == "and" { "&&" } else { "||" };
                return Ok(format!("({} {} {})", l, c_op, r));
            }
            // non-boolean and/or: store operands in temporaries and select
            // by truthiness
            let result_ty = result_ty.ok_or_else(|| self.err("untyped and/or", node))?;
            let c_ty = self.ctype(result_ty)?;
            let l_tmp = self.tmp("lhs");
            let _ = writeln!(prelude, "  {} {} = {};", c_ty, l_tmp, l);
            let r = self.emit_expr(rhs, prelude)?;
            let r_tmp = self.tmp("rhs");
            let _ = writeln!(prelude, "  {} {} = {};", c_ty, r_tmp, r);
            let l_truthy = self.truthy_of(lty, &l_tmp);
            return Ok(if op == "and" {
                format!("({} ? {} : {})", l_truthy, r_tmp, l_tmp)
            } else {
                format!("({} ? {} : {})", l_truthy, l_tmp, r_tmp)
            });
        }

        let l = self.emit_expr(lhs, prelude)?;
        let r = self.emit_expr(rhs, prelude)?;
        Ok(match op {
            "add" => format!("({} + {})", l, r),
            "sub" => format!("({} - {})", l, r),
            "mul" => format!("({} * {})", l, r),
            "div" => {
                // `/` is float division even between integers
                let int_div = lty.map_or(false, |t| self.ctx.types.is_integer(t))
                    && rty.map_or(false, |t| self.ctx.types.is_integer(t));
                if int_div {
                    format!("((double){} / (double){})", l, r)
                } else {
                    format!("({} / {})", l, r)
                }
            }
            "idiv" => format!("({} / {})", l, r),
            "mod" => {
                let is_float = result_ty.map_or(false, |t| self.ctx.types.is_float(t));
                if is_float {
                    self.includes.insert("<math.h>");
                    format!("fmod({}, {})", l, r)
                } else {
                    format!("({} % {})", l, r)
                }
            }
            "pow" => {
                self.includes.insert("<math.h>");
                format!("pow({}, {})", l, r)
            }
            "eq" => format!("({} == {})", l, r),
            "ne" => format!("({} != {})", l, r),
            "lt" => format!("({} < {})", l, r),
            "le" => format!("({} <= {})", l, r),
            "gt" => format!("({} > {})", l, r),
            "ge" => format!("({} >= {})", l, r),
            "band" => format!("({} & {})", l, r),
            "bor" => format!("({} | {})", l, r),
            "bxor" => format!("({} ^ {})", l, r),
            "shl" => format!("({} << {})", l, r),
            "shr" => format!("({} >> {})", l, r),
            "concat" => {
                return Err(self.err(
                    "string concatenation requires the string runtime",
                    node,
                ))
            }
            other => return Err(self.err(format!("unknown operator `{}`", other), node)),
        })
    }

    fn emit_table(&mut self, node: NodeId, prelude: &mut String) -> CompileResult<String> {
        let ty = self.ctx.ast.node(node).attr.ty.ok_or_else(|| {
            self.err("untyped table constructor", node)
        })?;
        let c_ty = self.ctype(ty)?;
        let items = self.ctx.ast.children(node);
        match self.ctx.types.get(ty).kind.clone() {
            TypeKind::Record(info) => {
                let mut fields = Vec::new();
                for (index, &item) in items.iter().enumerate() {
                    if self.ctx.ast.tag(item) == Tag::Pair {
                        let fname = self
                            .ctx
                            .ast
                            .node(item)
                            .data
                            .as_name()
                            .unwrap_or_default()
                            .to_string();
                        let value = *self.ctx.ast.children(item).last().unwrap();
                        let expr = self.emit_expr(value, prelude)?;
                        fields.push(format!(".{} = {}", fname, expr));
                    } else {
                        let expr = self.emit_expr(item, prelude)?;
                        let fname = info
                            .fields
                            .get(index)
                            .map(|f| f.name.clone())
                            .unwrap_or_default();
                        fields.push(format!(".{} = {}", fname, expr));
                    }
                }
                if fields.is_empty() {
                    return Ok(format!("(({}){{0}})", c_ty));
                }
                Ok(format!("(({}){{{}}})", c_ty, fields.join(", ")))
            }
            TypeKind::Array { .. } => {
                let mut elems = Vec::new();
                for &item in &items {
                    elems.push(self.emit_expr(item, prelude)?);
                }
                if elems.is_empty() {
                    return Ok(format!("(({}){{{{0}}}})", c_ty));
                }
                Ok(format!("(({}){{{{{}}}}})", c_ty, elems.join(", ")))
            }
            _ => Err(self.err("table constructor has no concrete type", node)),
        }
    }
}

fn escape_c_string(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analyzer, parser};

    fn emit(source: &str) -> String {
        let mut ctx = Context::new("t.nelua", source);
        let root = parser::parse(&mut ctx).expect("parse failed");
        let analysis = analyzer::analyze(&mut ctx, root).expect("analysis failed");
        assert!(ctx.errors.is_empty(), "semantic errors: {:?}", ctx.errors);
        generate(&ctx, &analysis, root, "test").expect("emission failed")
    }

    #[test]
    fn test_escape_c_string() {
        assert_eq!(escape_c_string(b"plain"), "plain");
        assert_eq!(escape_c_string(b"a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(escape_c_string(b"line\nfeed\t"), "line\\nfeed\\t");
        assert_eq!(escape_c_string(&[0xff, 0x01]), "\\xff\\x01");
    }

    #[test]
    fn test_helper_emitted_once() {
        let c = emit(
            "local a: [4]integer = {1, 2, 3, 4}\n\
             local i: integer = 1\n\
             local j: integer = 2\n\
             local x = a[i]\n\
             local y = a[j]\n\
             return x + y",
        );
        let defs = c.matches("static inline intptr_t nelua_assert_bounds_").count();
        assert_eq!(defs, 1, "helper must appear exactly once:\n{}", c);
    }

    #[test]
    fn test_includes_are_standard() {
        let c = emit("return 0");
        assert!(c.contains("#include <stddef.h>"));
        assert!(c.contains("#include <stdint.h>"));
        assert!(c.contains("#include <stdbool.h>"));
    }

    #[test]
    fn test_array_becomes_value_struct() {
        let c = emit("local a: [2]integer = {1, 2}\nreturn a[0]");
        assert!(
            c.contains("typedef struct arr2_int64 { int64_t v[2]; } arr2_int64;"),
            "array wrapper missing:\n{}",
            c
        );
    }

    #[test]
    fn test_forward_typedef_precedes_struct_body() {
        let c = emit(
            "local Node = @record{next: *Node}\n\
             local n: Node = {next = nilptr}\n\
             return 0",
        );
        let fwd = c.find("typedef struct Node Node;").expect("forward typedef missing");
        let body = c.find("struct Node {").expect("struct body missing");
        assert!(fwd < body);
    }

    #[test]
    fn test_defer_runs_on_break() {
        let c = emit(
            "local function note() end\n\
             while true do\n\
               defer note() end\n\
               break\n\
             end\n\
             return 0",
        );
        // the break path materializes the defer before `break;`
        let break_pos = c.find("break;").expect("break missing");
        let defer_pos = c.find("note();").expect("defer body missing");
        assert!(defer_pos < break_pos, "defer must run before break:\n{}", c);
    }
}
