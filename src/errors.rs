//! Compiler error definitions
//!
//! Every error carries a source span and an optional chained cause.
//! Diagnostics render one per line as `<file>:<line>:<col>: <kind>: <message>`,
//! with the cause indented underneath.

use crate::span::Span;
use thiserror::Error;

/// Result type for compiler operations
pub type CompileResult<T> = Result<T, CompileError>;

/// A compiler error: kind, source span, optional chained cause
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub span: Span,
    pub cause: Option<Box<CompileError>>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, span: Span) -> Self {
        Self { kind, span, cause: None }
    }

    pub fn with_cause(mut self, cause: CompileError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    // ============ Constructors ============

    pub fn lex(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Lex { message: message.into() }, span)
    }

    pub fn parse(label: impl Into<String>, message: impl Into<String>, span: Span) -> Self {
        Self::new(
            ErrorKind::Parse { label: label.into(), message: message.into() },
            span,
        )
    }

    pub fn undeclared(name: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::UndeclaredSymbol { name: name.into() }, span)
    }

    pub fn redeclared(name: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Redeclared { name: name.into() }, span)
    }

    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>, span: Span) -> Self {
        Self::new(
            ErrorKind::TypeMismatch { expected: expected.into(), found: found.into() },
            span,
        )
    }

    pub fn not_assignable(from: impl Into<String>, to: impl Into<String>, span: Span) -> Self {
        Self::new(
            ErrorKind::NotAssignable { from: from.into(), to: to.into() },
            span,
        )
    }

    pub fn cannot_infer(span: Span) -> Self {
        Self::new(ErrorKind::TypeCouldNotBeInferred, span)
    }

    pub fn invalid_annotation(name: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::InvalidAnnotation { name: name.into() }, span)
    }

    pub fn use_after_move(name: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::UseAfterMove { name: name.into() }, span)
    }

    pub fn generic_cycle(name: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::GenericCycle { name: name.into() }, span)
    }

    pub fn preprocess(message: impl Into<String>, trace: Vec<String>, span: Span) -> Self {
        Self::new(
            ErrorKind::Preprocess { message: message.into(), trace },
            span,
        )
    }

    pub fn emit(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Emit { message: message.into() }, span)
    }

    pub fn toolchain(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Toolchain { message: message.into() }, Span::default())
    }

    /// Render the diagnostic line(s) against the originating source
    pub fn render(&self, filename: &str, source: &str) -> String {
        let pos = self.span.location(source);
        let mut out = format!(
            "{}:{}:{}: {}: {}",
            filename, pos.line, pos.column,
            self.kind.name(),
            self.kind
        );
        if let ErrorKind::Preprocess { trace, .. } = &self.kind {
            for frame in trace {
                out.push_str("\n    in ");
                out.push_str(frame);
            }
        }
        if let Some(cause) = &self.cause {
            let pos = cause.span.location(source);
            out.push_str(&format!(
                "\n    {}:{}:{}: {}: {}",
                filename, pos.line, pos.column,
                cause.kind.name(),
                cause.kind
            ));
        }
        out
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.kind)
    }
}

impl std::error::Error for CompileError {}

/// The kind of compiler error
#[derive(Error, Debug, Clone)]
pub enum ErrorKind {
    #[error("{message}")]
    Lex { message: String },

    #[error("{message}")]
    Parse { label: String, message: String },

    #[error("undeclared symbol `{name}`")]
    UndeclaredSymbol { name: String },

    #[error("symbol `{name}` was already declared in this scope")]
    Redeclared { name: String },

    #[error("expected type `{expected}`, found `{found}`")]
    TypeMismatch { expected: String, found: String },

    #[error("`{from}` is not assignable to `{to}`")]
    NotAssignable { from: String, to: String },

    #[error("type could not be inferred")]
    TypeCouldNotBeInferred,

    #[error("invalid annotation `{name}`")]
    InvalidAnnotation { name: String },

    #[error("use of moved value `{name}`")]
    UseAfterMove { name: String },

    #[error("circular definition of generic type `{name}`")]
    GenericCycle { name: String },

    #[error("{message}")]
    Preprocess { message: String, trace: Vec<String> },

    #[error("{message}")]
    Emit { message: String },

    #[error("{message}")]
    Toolchain { message: String },
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Lex { .. } => "LexError",
            ErrorKind::Parse { .. } => "ParseError",
            ErrorKind::UndeclaredSymbol { .. } => "UndeclaredSymbol",
            ErrorKind::Redeclared { .. } => "Redeclared",
            ErrorKind::TypeMismatch { .. } => "TypeMismatch",
            ErrorKind::NotAssignable { .. } => "NotAssignable",
            ErrorKind::TypeCouldNotBeInferred => "TypeCouldNotBeInferred",
            ErrorKind::InvalidAnnotation { .. } => "InvalidAnnotation",
            ErrorKind::UseAfterMove { .. } => "UseAfterMove",
            ErrorKind::GenericCycle { .. } => "GenericCycle",
            ErrorKind::Preprocess { .. } => "PreprocessError",
            ErrorKind::Emit { .. } => "EmitError",
            ErrorKind::Toolchain { .. } => "ToolchainError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_position() {
        let source = "local a\nlocal a\n";
        let err = CompileError::redeclared("a", Span::new(14, 15));
        let rendered = err.render("test.nelua", source);
        assert_eq!(
            rendered,
            "test.nelua:2:7: Redeclared: symbol `a` was already declared in this scope"
        );
    }

    #[test]
    fn test_render_with_cause() {
        let source = "local a: integer = true";
        let err = CompileError::not_assignable("boolean", "integer", Span::new(19, 23))
            .with_cause(CompileError::type_mismatch("integer", "boolean", Span::new(9, 16)));
        let rendered = err.render("t.nelua", source);
        assert!(rendered.starts_with("t.nelua:1:20: NotAssignable:"));
        assert!(rendered.contains("\n    t.nelua:1:10: TypeMismatch:"));
    }
}
