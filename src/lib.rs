//! Nelua Compiler
//!
//! Compiles Nelua sources (a statically-typed language with a Lua-shaped
//! surface syntax) to portable C, which an external C toolchain then turns
//! into a binary.
//!
//! # Architecture
//!
//! ```text
//! Source Code (.nelua)
//!       │
//!       ▼
//! ┌─────────────┐
//! │Lexer/Parser │  → tagged AST (PEG-extensible grammar)
//! └─────────────┘
//!       │
//!       ▼
//! ┌─────────────┐
//! │  Analyzer   │  → typed AST + symbols  (interleaved with the
//! └─────────────┘     compile-time preprocessor)
//!       │
//!       ▼
//! ┌─────────────┐
//! │  C Emitter  │  → one C translation unit
//! └─────────────┘
//!       │
//!       ▼
//! ┌─────────────┐
//! │ C Toolchain │  → native binary
//! └─────────────┘
//! ```

pub mod analyzer;
pub mod ast;
pub mod cgen;
pub mod config;
pub mod context;
pub mod errors;
pub mod grammar;
pub mod lexer;
pub mod parser;
pub mod preprocessor;
pub mod scope;
pub mod span;
pub mod token;
pub mod toolchain;
pub mod types;

// Re-exports for convenience
pub use context::Context;
pub use errors::{CompileError, CompileResult};
pub use span::Span;

/// Compiler version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File extension for Nelua source files
pub const FILE_EXTENSION: &str = "nelua";

/// Compile one source unit down to a C translation unit. This is the single
/// error boundary: fatal errors and collected semantic errors both surface
/// here, nothing below catches.
pub fn compile_unit(
    filename: &str,
    source: &str,
    cache_hash: &str,
) -> Result<String, Vec<CompileError>> {
    let mut ctx = Context::new(filename, source);
    let root = parser::parse(&mut ctx).map_err(|e| vec![e])?;
    let analysis = analyzer::analyze(&mut ctx, root).map_err(|e| vec![e])?;
    if !ctx.errors.is_empty() {
        return Err(std::mem::take(&mut ctx.errors));
    }
    cgen::generate(&ctx, &analysis, root, cache_hash).map_err(|e| vec![e])
}

/// Convenience wrapper used by tests and tooling that never reaches the
/// external toolchain.
pub fn compile_to_c(filename: &str, source: &str) -> Result<String, Vec<CompileError>> {
    compile_unit(filename, source, "none")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c_ok(source: &str) -> String {
        compile_to_c("test.nelua", source).unwrap_or_else(|errs| {
            let rendered: Vec<String> = errs
                .iter()
                .map(|e| e.render("test.nelua", source))
                .collect();
            panic!("compilation failed:\n{}", rendered.join("\n"))
        })
    }

    fn c_err(source: &str) -> Vec<CompileError> {
        compile_to_c("test.nelua", source).expect_err("expected a compile error")
    }

    #[test]
    fn test_empty_program_returns_zero() {
        let c = c_ok("");
        assert!(c.contains("int main(int argc, char** argv)"));
        assert!(c.contains("return 0;"));
    }

    #[test]
    fn test_return_constant_folds() {
        let c = c_ok("return 1+2");
        assert!(c.contains("3"), "folded constant missing:\n{}", c);
    }

    #[test]
    fn test_hexadecimal_local() {
        let c = c_ok("local a: integer = 0x10\nreturn a");
        assert!(c.contains("int64_t a = 16;"), "decl missing:\n{}", c);
    }

    #[test]
    fn test_for_loop() {
        let c = c_ok("for i=1,10 do end\nreturn 0");
        assert!(c.contains("for (int64_t i = 1;"), "loop missing:\n{}", c);
    }

    #[test]
    fn test_poly_function_single_eval() {
        let c = c_ok("local function f(x: auto) return x+x end\nreturn f(21)");
        // one specialization for integer arguments
        assert_eq!(c.matches("static int64_t f_int64(int64_t x)").count(), 2);
        assert!(c.contains("f_int64(21)"));
    }

    #[test]
    fn test_preprocessor_computes_at_compile_time() {
        let c = c_ok("##[[local n=3]] return #[n]#*#[n]#");
        // the metalanguage leaves no residue and the product folds
        assert!(!c.contains("##"));
        assert!(!c.contains("n=3"));
        assert!(c.contains("9"), "expected folded 9:\n{}", c);
    }

    #[test]
    fn test_preprocessor_hermeticity() {
        // an after_analyze hook that does nothing leaves the output
        // byte-identical
        let plain = c_ok("local a: integer = 1\nreturn a");
        let hooked = c_ok("##[[after_analyze(function() end)]] local a: integer = 1\nreturn a");
        assert_eq!(plain, hooked);
    }

    #[test]
    fn test_record_and_field_access() {
        let c = c_ok(
            "local Point = @record{x: integer, y: integer}\n\
             local p: Point = {x = 1, y = 2}\n\
             return p.x + p.y",
        );
        assert!(c.contains("typedef struct Point Point;"));
        assert!(c.contains("struct Point {"));
        assert!(c.contains("p.x"));
    }

    #[test]
    fn test_self_referential_record() {
        let c = c_ok(
            "local Node = @record{value: integer, next: *Node}\n\
             local n: Node = {value = 1, next = nilptr}\n\
             return n.value",
        );
        assert!(c.contains("Node* next;"), "pointer field missing:\n{}", c);
    }

    #[test]
    fn test_bounds_check_emitted() {
        let c = c_ok(
            "local a: [4]integer = {1, 2, 3, 4}\n\
             local i: integer = 2\n\
             return a[i]",
        );
        assert!(c.contains("nelua_assert_bounds_"), "bounds check missing:\n{}", c);
    }

    #[test]
    fn test_comptime_index_skips_bounds_check() {
        let c = c_ok("local a: [4]integer = {1, 2, 3, 4}\nreturn a[1]");
        assert!(!c.contains("nelua_assert_bounds_"));
    }

    #[test]
    fn test_destructor_and_defer_ordering() {
        let c = c_ok(
            "local R = @record{id: integer}\n\
             function R:__destroy() end\n\
             do\n\
               local a: R = {id = 1}\n\
               local b: R = {id = 2}\n\
               defer f() end\n\
             end\n\
             local function f() end\n\
             return 0",
        );
        // reverse declaration order: b before a, destructors before defers
        let b_pos = c.find("R___destroy(&b);").expect("b destructor missing");
        let a_pos = c.find("R___destroy(&a);").expect("a destructor missing");
        let f_pos = c.rfind("f();").expect("defer body missing");
        assert!(b_pos < a_pos, "destructors out of order:\n{}", c);
        assert!(a_pos < f_pos, "defer ran before destructors:\n{}", c);
    }

    #[test]
    fn test_use_after_move_rejected() {
        let errs = c_err(
            "local R = @record{id: integer}\n\
             function R:__destroy() end\n\
             local a: R = {id = 1}\n\
             local b = a\n\
             local c = a\n\
             return 0",
        );
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, errors::ErrorKind::UseAfterMove { .. })));
    }

    #[test]
    fn test_undeclared_symbol_reported() {
        let errs = c_err("return missing_thing");
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, errors::ErrorKind::UndeclaredSymbol { .. })));
    }

    #[test]
    fn test_redeclaration_rejected() {
        let errs = c_err("local a = 1\nlocal a = 2\nreturn 0");
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, errors::ErrorKind::Redeclared { .. })));
    }

    #[test]
    fn test_not_assignable_rejected() {
        let errs = c_err("local a: integer = true\nreturn 0");
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, errors::ErrorKind::NotAssignable { .. })));
    }

    #[test]
    fn test_forward_reference_resolves() {
        let c = c_ok(
            "local function a(): integer return b() end\n\
             local function b(): integer return 7 end\n\
             return a()",
        );
        assert!(c.contains("static int64_t a(void)"));
        assert!(c.contains("static int64_t b(void)"));
    }

    #[test]
    fn test_multiple_returns_destructure() {
        let c = c_ok(
            "local function mm(): (integer, integer) return 3, 4 end\n\
             local x, y = mm()\n\
             return x + y",
        );
        assert!(c.contains("_ret"), "return struct missing:\n{}", c);
        assert!(c.contains(".r0") && c.contains(".r1"), "destructure missing:\n{}", c);
    }

    #[test]
    fn test_swap_assignment_uses_temporaries() {
        let c = c_ok("local a, b = 1, 2\na, b = b, a\nreturn a");
        // both values land in temporaries before the stores
        let first_store = c.find("a = _as").expect("temporary store missing");
        let last_load = c.rfind("= b;").unwrap_or(0);
        assert!(last_load < first_store, "swap not temporary-first:\n{}", c);
    }

    #[test]
    fn test_switch_lowering() {
        let c = c_ok(
            "local x: integer = 2\n\
             switch x do\n\
             case 1 then return 10\n\
             case 2, 3 then return 20\n\
             else return 30\n\
             end",
        );
        assert!(c.contains("switch (x) {"));
        assert!(c.contains("case 2: case 3:"), "shared case group missing:\n{}", c);
        assert!(c.contains("default:"));
    }

    #[test]
    fn test_enum_lowering() {
        let c = c_ok(
            "local Color = @enum{Red = 1, Green, Blue}\n\
             local picked: Color = Color.Green\n\
             return picked",
        );
        assert!(c.contains("typedef int64_t Color;"));
        assert!(c.contains("Color picked = 2;"), "enum value missing:\n{}", c);
    }

    #[test]
    fn test_global_gc_root_registration() {
        let c = c_ok("global g: *integer\nreturn 0");
        assert!(c.contains("nelua_gc_register_root((void*)&g, sizeof(g));"));
        assert!(c.contains("#include <setjmp.h>"));
    }

    #[test]
    fn test_nogc_pragma_skips_registration() {
        let c = c_ok("@nogc\nglobal g: *integer\nreturn 0");
        assert!(!c.contains("nelua_gc_register_root"));
    }

    #[test]
    fn test_static_assert_always_present() {
        let c = c_ok("");
        assert!(c.contains("nelua_static_assert(sizeof(void*)"));
    }

    #[test]
    fn test_grammar_extension_through_preprocessor() {
        let c = c_ok(
            "##[[add_keyword('unless') set_peg('If', \"'unless' expr 'then' block 'end'\")]]\n\
             ##[[inject_statement('unless true then return 1 end')]]\n\
             return 0",
        );
        assert!(c.contains("if ("), "extension statement missing:\n{}", c);
    }

    #[test]
    fn test_generic_type_instantiation() {
        let c = c_ok(
            "local boxed = @generic(T) record{item: T}\n\
             local b: boxed(integer) = {item = 5}\n\
             return b.item",
        );
        assert!(c.contains("item"), "generic instance missing:\n{}", c);
    }

    #[test]
    fn test_generic_cycle_detected() {
        let errs = c_err(
            "local G = @generic(T) G(T)\n\
             local x: G(integer)\n\
             return 0",
        );
        assert!(errs
            .iter()
            .any(|e| matches!(e.kind, errors::ErrorKind::GenericCycle { .. })));
    }

    #[test]
    fn test_cache_hash_lands_in_header() {
        let c = compile_unit("t.nelua", "", "deadbeef").unwrap();
        assert!(c.lines().next().unwrap().contains("cache:deadbeef"));
    }
}
