//! Token definitions
//!
//! This module defines all tokens the lexer can produce. Lexing uses the
//! `logos` crate; irregular lexemes (long strings, long comments, the
//! preprocessor markers) are handled by callbacks that scan the remainder
//! by hand.
//!
//! Keywords are intentionally NOT lexed as distinct tokens: they come out
//! as [`TokenKind::Name`] and the parser checks them against its keyword
//! set, which the preprocessor may extend or shrink mid-file.

use crate::span::Span;
use logos::{FilterResult, Logos};
use std::fmt;
use thiserror::Error;

/// Lexical errors, named so diagnostics can carry a precise failure label
#[derive(Error, Debug, Clone, PartialEq, Eq, Default)]
pub enum LexError {
    #[default]
    #[error("unexpected character")]
    UnexpectedCharacter,

    #[error("malformed hexadecimal number")]
    MalformedHexadecimalNumber,

    #[error("malformed binary number")]
    MalformedBinaryNumber,

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unclosed long string")]
    UnclosedLongString,

    #[error("unclosed long comment")]
    UnclosedLongComment,

    #[error("unclosed preprocessor expression")]
    UnclosedPreprocessExpr,

    #[error("unclosed preprocessor name")]
    UnclosedPreprocessName,
}

/// A token produced by the lexer
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Get the text of this token from source
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        self.span.text(source)
    }
}

/// All token kinds
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[logos(error = LexError)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum TokenKind {
    // ============ Literals ============

    /// Number literal; base, integral/fractional parts, exponent and
    /// suffix are split later by the lexer and kept separate in the AST
    #[regex(r"0[xX][0-9a-fA-F]*(\.[0-9a-fA-F]*)?([pP][+-]?[0-9]+)?(_[a-zA-Z][a-zA-Z0-9]*)?", validate_hex)]
    #[regex(r"0[bB][0-9]*(_[a-zA-Z][a-zA-Z0-9]*)?", validate_bin)]
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?(_[a-zA-Z][a-zA-Z0-9]*)?")]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?(_[a-zA-Z][a-zA-Z0-9]*)?")]
    Number,

    /// Short string literal with escapes, optional `_suffix`
    #[regex(r#""([^"\\\n]|\\.)*"(_[a-zA-Z][a-zA-Z0-9]*)?"#)]
    #[regex(r#"'([^'\\\n]|\\.)*'(_[a-zA-Z][a-zA-Z0-9]*)?"#)]
    #[regex(r#""([^"\\\n]|\\.)*"#, lex_unterminated_string)]
    #[regex(r#"'([^'\\\n]|\\.)*"#, lex_unterminated_string)]
    String,

    /// Long string literal: `[[ ... ]]`, `[=[ ... ]=]`, any level
    #[regex(r"\[=*\[", lex_long_string)]
    LongString,

    /// Identifier or keyword (keywords are resolved by the parser)
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Name,

    // ============ Preprocessor markers ============

    /// `##[[ ... ]]` block of metalanguage statements
    #[regex(r"##\[=*\[", lex_preprocess_block)]
    PreprocessBlock,

    /// `## ...` single metalanguage line
    #[regex(r"##([^\[\n][^\n]*)?")]
    PreprocessLine,

    /// `#[ expr ]#` metalanguage expression splice
    #[token("#[", lex_preprocess_expr)]
    PreprocessExpr,

    /// `#| expr |#` metalanguage name splice
    #[token("#|", lex_preprocess_name)]
    PreprocessName,

    // ============ Operators ============

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("#")]
    Hash,
    #[token("&")]
    Amp,
    #[token("~")]
    Tilde,
    #[token("|")]
    Pipe,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("==")]
    EqEq,
    #[token("~=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Eq,
    #[token("..")]
    Concat,
    #[token("...")]
    Ellipsis,
    #[token("$")]
    Dollar,
    #[token("@")]
    At,
    #[token("?")]
    Question,

    // ============ Delimiters & punctuation ============

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token("::")]
    DoubleColon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,

    // ============ Comments (skipped) ============

    #[regex(r"--", lex_comment)]
    Comment,

    // ============ Special ============

    /// End of file
    Eof,
}

/// Scan past `]=*]` with the given level, returning how many bytes of the
/// remainder were consumed, or `None` when the closer is missing.
fn find_long_close(remainder: &str, level: usize) -> Option<usize> {
    let closer: String = format!("]{}]", "=".repeat(level));
    remainder.find(&closer).map(|pos| pos + closer.len())
}

fn lex_unterminated_string(_lex: &mut logos::Lexer<TokenKind>) -> Result<(), LexError> {
    Err(LexError::UnterminatedString)
}

fn lex_long_string(lex: &mut logos::Lexer<TokenKind>) -> FilterResult<(), LexError> {
    let level = lex.slice().len() - 2;
    match find_long_close(lex.remainder(), level) {
        Some(consumed) => {
            lex.bump(consumed);
            FilterResult::Emit(())
        }
        None => FilterResult::Error(LexError::UnclosedLongString),
    }
}

fn lex_preprocess_block(lex: &mut logos::Lexer<TokenKind>) -> FilterResult<(), LexError> {
    let level = lex.slice().len() - 4;
    match find_long_close(lex.remainder(), level) {
        Some(consumed) => {
            lex.bump(consumed);
            FilterResult::Emit(())
        }
        None => FilterResult::Error(LexError::UnclosedLongString),
    }
}

fn lex_preprocess_expr(lex: &mut logos::Lexer<TokenKind>) -> FilterResult<(), LexError> {
    match lex.remainder().find("]#") {
        Some(pos) => {
            lex.bump(pos + 2);
            FilterResult::Emit(())
        }
        None => FilterResult::Error(LexError::UnclosedPreprocessExpr),
    }
}

fn lex_preprocess_name(lex: &mut logos::Lexer<TokenKind>) -> FilterResult<(), LexError> {
    match lex.remainder().find("|#") {
        Some(pos) => {
            lex.bump(pos + 2);
            FilterResult::Emit(())
        }
        None => FilterResult::Error(LexError::UnclosedPreprocessName),
    }
}

fn lex_comment(lex: &mut logos::Lexer<TokenKind>) -> FilterResult<(), LexError> {
    let rem = lex.remainder();
    // Long comment: `--[[ ... ]]`, `--[=[ ... ]=]`, any level
    if let Some(stripped) = rem.strip_prefix('[') {
        let level = stripped.bytes().take_while(|&b| b == b'=').count();
        if stripped.as_bytes().get(level) == Some(&b'[') {
            lex.bump(2 + level);
            return match find_long_close(lex.remainder(), level) {
                Some(consumed) => {
                    lex.bump(consumed);
                    FilterResult::Skip
                }
                None => FilterResult::Error(LexError::UnclosedLongComment),
            };
        }
    }
    // Line comment: to end of line
    match rem.find('\n') {
        Some(pos) => lex.bump(pos),
        None => lex.bump(rem.len()),
    }
    FilterResult::Skip
}

fn validate_hex(lex: &mut logos::Lexer<TokenKind>) -> Result<(), LexError> {
    let text = lex.slice();
    let digits = &text[2..];
    let digits = digits.split('_').next().unwrap_or(digits);
    if digits.is_empty() || digits == "." {
        Err(LexError::MalformedHexadecimalNumber)
    } else {
        Ok(())
    }
}

fn validate_bin(lex: &mut logos::Lexer<TokenKind>) -> Result<(), LexError> {
    let text = lex.slice();
    let digits = text[2..].split('_').next().unwrap_or("");
    if digits.is_empty() || digits.bytes().any(|b| b != b'0' && b != b'1') {
        Err(LexError::MalformedBinaryNumber)
    } else {
        Ok(())
    }
}

impl TokenKind {
    /// Check if this token can start an expression
    pub fn starts_expression(&self) -> bool {
        matches!(
            self,
            TokenKind::Number
                | TokenKind::String
                | TokenKind::LongString
                | TokenKind::Name
                | TokenKind::LParen
                | TokenKind::LBrace
                | TokenKind::Minus
                | TokenKind::Hash
                | TokenKind::Tilde
                | TokenKind::Amp
                | TokenKind::Dollar
                | TokenKind::At
                | TokenKind::Ellipsis
                | TokenKind::PreprocessExpr
                | TokenKind::PreprocessName
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Number => "number",
            TokenKind::String => "string",
            TokenKind::LongString => "long string",
            TokenKind::Name => "name",
            TokenKind::PreprocessBlock => "preprocessor block",
            TokenKind::PreprocessLine => "preprocessor line",
            TokenKind::PreprocessExpr => "preprocessor expression",
            TokenKind::PreprocessName => "preprocessor name",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::DoubleSlash => "//",
            TokenKind::Percent => "%",
            TokenKind::Caret => "^",
            TokenKind::Hash => "#",
            TokenKind::Amp => "&",
            TokenKind::Tilde => "~",
            TokenKind::Pipe => "|",
            TokenKind::Shl => "<<",
            TokenKind::Shr => ">>",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "~=",
            TokenKind::LtEq => "<=",
            TokenKind::GtEq => ">=",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::Eq => "=",
            TokenKind::Concat => "..",
            TokenKind::Ellipsis => "...",
            TokenKind::Dollar => "$",
            TokenKind::At => "@",
            TokenKind::Question => "?",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::DoubleColon => "::",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Comment => "comment",
            TokenKind::Eof => "end of file",
        };
        write!(f, "{}", s)
    }
}
