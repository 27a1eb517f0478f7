//! Compilation context
//!
//! One [`Context`] owns every piece of shared state of a compilation unit:
//! the AST arena, the scope/symbol arenas, the type registry, the active
//! grammar and the preprocessor environment. Everything is threaded through
//! it explicitly; there is no global state and no locking (the compiler is
//! single-threaded by design).

use crate::ast::Ast;
use crate::errors::CompileError;
use crate::grammar::Grammar;
use crate::preprocessor::PpState;
use crate::scope::Scopes;
use crate::types::TypeRegistry;

/// Compilation pragmas togglable from the preprocessor
#[derive(Debug, Clone)]
pub struct Pragmas {
    /// Disable the garbage collector (no GC root registration is emitted)
    pub nogc: bool,
    /// Disable runtime checks (array bounds, casts)
    pub nochecks: bool,
}

impl Default for Pragmas {
    fn default() -> Self {
        Self { nogc: false, nochecks: false }
    }
}

/// All shared state of one compilation unit
pub struct Context {
    pub filename: String,
    pub source: String,
    pub ast: Ast,
    pub scopes: Scopes,
    pub types: TypeRegistry,
    pub grammar: Grammar,
    pub pragmas: Pragmas,
    pub pp: PpState,
    /// Semantic errors collected per statement boundary
    pub errors: Vec<CompileError>,
    unique_counter: u32,
}

impl Context {
    pub fn new(filename: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            source: source.into(),
            ast: Ast::new(),
            scopes: Scopes::new(),
            types: TypeRegistry::new(),
            grammar: Grammar::new(),
            pragmas: Pragmas::default(),
            pp: PpState::default(),
            errors: Vec::new(),
            unique_counter: 0,
        }
    }

    /// Mint a unique lowered name (temporaries, continue labels, ...)
    pub fn unique_name(&mut self, prefix: &str) -> String {
        self.unique_counter += 1;
        format!("{}_{}", prefix, self.unique_counter)
    }

    pub fn add_error(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    /// Render all collected errors against this unit's source
    pub fn render_errors(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.render(&self.filename, &self.source))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_are_unique() {
        let mut ctx = Context::new("t.nelua", "");
        let a = ctx.unique_name("tmp");
        let b = ctx.unique_name("tmp");
        assert_ne!(a, b);
    }
}
