//! Scopes and symbols
//!
//! Scopes form a tree (root, block, loop, function, record) held in an
//! arena alongside the symbol arena. A symbol is unique per declaration
//! site and owned by the scope that declared it; every other reference is
//! a non-owning [`SymbolId`].
//!
//! The symbol list of a scope is *ordered*: static-root registration for
//! the garbage collector walks it in declaration order.

use crate::ast::{CompVal, NodeId};
use crate::errors::{CompileError, CompileResult};
use crate::span::Span;
use crate::types::TypeId;
use std::collections::HashMap;

/// Index into the scope arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Index into the symbol arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// Scope kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Block,
    Loop,
    Function,
    Record,
}

/// Storage class of a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Local,
    Global,
    Static,
    Comptime,
}

/// A declared symbol
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub ty: Option<TypeId>,
    pub storage: Storage,
    pub annotations: Vec<String>,
    /// The declaring node
    pub node: Option<NodeId>,
    /// Scope of origin
    pub scope: ScopeId,
    pub cimport: bool,
    /// `nodecl` annotation: declaration emits nothing and may be overridden
    pub nodecl: bool,
    /// Preferred name for type symbols when deriving codenames
    pub nickname: Option<String>,
    /// Compile-time constant value, when known
    pub value: Option<CompVal>,
    /// Move discipline state
    pub moved: bool,
    pub used: bool,
    pub span: Span,
}

impl Symbol {
    pub fn new(name: impl Into<String>, storage: Storage, span: Span) -> Self {
        Self {
            name: name.into(),
            ty: None,
            storage,
            annotations: Vec::new(),
            node: None,
            scope: ScopeId(0),
            cimport: false,
            nodecl: false,
            nickname: None,
            value: None,
            moved: false,
            used: false,
            span,
        }
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations.iter().any(|a| a == name)
    }
}

/// A lexical scope
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    /// Symbols in declaration order
    pub symbols: Vec<SymbolId>,
    /// Labels declared in this scope
    pub labels: HashMap<String, NodeId>,
    /// Defer blocks registered in this scope, in registration order
    pub deferblocks: Vec<NodeId>,
    /// The block ends in a terminating statement, so the fallthrough exit
    /// already ran its cleanup and the emitter skips it
    pub alreadydestroyed: bool,
    /// Function scopes: the function's type and whether a return was seen
    pub functype: Option<TypeId>,
    pub has_return: bool,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            symbols: Vec::new(),
            labels: HashMap::new(),
            deferblocks: Vec::new(),
            alreadydestroyed: false,
            functype: None,
            has_return: false,
        }
    }
}

/// Scope tree and symbol arena for one compilation unit
#[derive(Debug)]
pub struct Scopes {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
    current: ScopeId,
    /// Balance counter used to check the push/pop discipline
    depth: usize,
}

impl Scopes {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(ScopeKind::Root, None)],
            symbols: Vec::new(),
            current: ScopeId(0),
            depth: 0,
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn current(&self) -> ScopeId {
        self.current
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    /// Create a child of the current scope and enter it
    pub fn fork(&mut self, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(kind, Some(self.current)));
        let parent = self.current;
        self.scopes[parent.0 as usize].children.push(id);
        self.current = id;
        self.depth += 1;
        id
    }

    /// Re-enter an existing scope (polymorphic re-analysis)
    pub fn push(&mut self, id: ScopeId) {
        self.current = id;
        self.depth += 1;
    }

    /// Restore the parent scope
    pub fn pop(&mut self) {
        if let Some(parent) = self.get(self.current).parent {
            self.current = parent;
            self.depth -= 1;
        }
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn symbol_len(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// Declare a symbol in the current scope. Fails with `Redeclared` when
    /// the name exists in this same scope, unless the existing declaration
    /// is an overridable `cimport`+`nodecl` one.
    pub fn declare(&mut self, mut symbol: Symbol) -> CompileResult<SymbolId> {
        let scope = self.current;
        if let Some(&existing) = self
            .get(scope)
            .symbols
            .iter()
            .find(|&&sid| self.symbol(sid).name == symbol.name)
        {
            let prior = self.symbol(existing);
            if !(prior.cimport && prior.nodecl) {
                return Err(CompileError::redeclared(&symbol.name, symbol.span));
            }
        }
        symbol.scope = scope;
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        self.get_mut(scope).symbols.push(id);
        Ok(id)
    }

    /// Resolve a name, walking parent scopes. Later declarations shadow
    /// earlier ones within a scope.
    pub fn resolve(&self, name: &str) -> Option<SymbolId> {
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            let s = self.get(id);
            if let Some(&sid) = s
                .symbols
                .iter()
                .rev()
                .find(|&&sid| self.symbol(sid).name == name)
            {
                return Some(sid);
            }
            scope = s.parent;
        }
        None
    }

    /// Innermost enclosing scope of the given kind, starting at current
    pub fn find_enclosing(&self, kind: ScopeKind) -> Option<ScopeId> {
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            if self.get(id).kind == kind {
                return Some(id);
            }
            scope = self.get(id).parent;
        }
        None
    }

    /// Scopes from current up to and including the innermost function (or
    /// root), in exit order. Used to lower `return` cleanup.
    pub fn exit_chain_to_function(&self) -> Vec<ScopeId> {
        let mut chain = Vec::new();
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            chain.push(id);
            if matches!(self.get(id).kind, ScopeKind::Function | ScopeKind::Root) {
                break;
            }
            scope = self.get(id).parent;
        }
        chain
    }

    /// All symbols of the root scope in declaration order (GC static-root
    /// registration relies on this ordering).
    pub fn root_symbols(&self) -> &[SymbolId] {
        &self.get(self.root()).symbols
    }
}

impl Default for Scopes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol::new(name, Storage::Local, Span::default())
    }

    #[test]
    fn test_declare_and_resolve() {
        let mut scopes = Scopes::new();
        let a = scopes.declare(sym("a")).unwrap();
        scopes.fork(ScopeKind::Block);
        let b = scopes.declare(sym("b")).unwrap();
        assert_eq!(scopes.resolve("a"), Some(a));
        assert_eq!(scopes.resolve("b"), Some(b));
        scopes.pop();
        assert_eq!(scopes.resolve("b"), None);
    }

    #[test]
    fn test_redeclaration_fails() {
        let mut scopes = Scopes::new();
        scopes.declare(sym("x")).unwrap();
        assert!(scopes.declare(sym("x")).is_err());
    }

    #[test]
    fn test_nodecl_cimport_is_overridable() {
        let mut scopes = Scopes::new();
        let mut first = sym("malloc");
        first.cimport = true;
        first.nodecl = true;
        scopes.declare(first).unwrap();
        assert!(scopes.declare(sym("malloc")).is_ok());
    }

    #[test]
    fn test_shadowing_resolves_to_latest() {
        let mut scopes = Scopes::new();
        scopes.declare(sym("v")).unwrap();
        scopes.fork(ScopeKind::Block);
        let inner = scopes.declare(sym("v")).unwrap();
        assert_eq!(scopes.resolve("v"), Some(inner));
    }

    #[test]
    fn test_enclosing_scope_lookup() {
        let mut scopes = Scopes::new();
        scopes.fork(ScopeKind::Function);
        scopes.fork(ScopeKind::Loop);
        scopes.fork(ScopeKind::Block);
        assert!(scopes.find_enclosing(ScopeKind::Loop).is_some());
        assert!(scopes.find_enclosing(ScopeKind::Function).is_some());
        assert_eq!(scopes.exit_chain_to_function().len(), 3);
    }

    #[test]
    fn test_declaration_order_preserved() {
        let mut scopes = Scopes::new();
        scopes.declare(sym("g1")).unwrap();
        scopes.declare(sym("g2")).unwrap();
        scopes.declare(sym("g3")).unwrap();
        let names: Vec<_> = scopes
            .root_symbols()
            .iter()
            .map(|&sid| scopes.symbol(sid).name.clone())
            .collect();
        assert_eq!(names, vec!["g1", "g2", "g3"]);
    }
}
