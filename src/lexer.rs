//! Lexer
//!
//! The lexer converts source code into a stream of tokens using the `logos`
//! crate, and hosts the literal decoders: escape sequences are fully decoded
//! here, and numeric literals are split into base, integral part, fractional
//! part, exponent and suffix. Deciding the resulting *type* of a literal is
//! the analyzer's job, not ours.

use crate::span::Span;
use crate::token::{LexError, Token, TokenKind};
use logos::Logos;

/// The lexer
pub struct Lexer<'src> {
    source: &'src str,
    inner: logos::Lexer<'src, TokenKind>,
    peeked: Option<Token>,
    errors: Vec<(LexError, Span)>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            inner: TokenKind::lexer(source),
            peeked: None,
            errors: Vec::new(),
        }
    }

    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Get any errors that occurred during lexing
    pub fn errors(&self) -> &[(LexError, Span)] {
        &self.errors
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.next_token();
        }
        self.peeked.as_ref()
    }

    /// Get the next token; lexical errors are recorded and skipped
    pub fn next_token(&mut self) -> Option<Token> {
        if let Some(token) = self.peeked.take() {
            return Some(token);
        }

        loop {
            match self.inner.next() {
                Some(Ok(kind)) => {
                    let span = self.inner.span();
                    return Some(Token::new(kind, Span::new(span.start, span.end)));
                }
                Some(Err(err)) => {
                    let span = self.inner.span();
                    self.errors.push((err, Span::new(span.start, span.end)));
                    continue;
                }
                None => {
                    let pos = self.source.len();
                    return Some(Token::new(TokenKind::Eof, Span::new(pos, pos)));
                }
            }
        }
    }

    /// Collect all tokens into a vector
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<(LexError, Span)>) {
        let mut tokens = Vec::new();
        loop {
            match self.next_token() {
                Some(token) if token.kind == TokenKind::Eof => {
                    tokens.push(token);
                    break;
                }
                Some(token) => tokens.push(token),
                None => break,
            }
        }
        (tokens, self.errors)
    }
}

/// Helper function to lex source code
pub fn lex(source: &str) -> (Vec<Token>, Vec<(LexError, Span)>) {
    Lexer::new(source).tokenize()
}

// ============ Literal decoding ============

/// Numeric base of a number literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberBase {
    Decimal,
    Hexadecimal,
    Binary,
}

/// A number literal split into its lexical parts
#[derive(Debug, Clone, PartialEq)]
pub struct NumberParts {
    pub base: NumberBase,
    pub int: String,
    pub frac: Option<String>,
    pub exp: Option<String>,
    pub suffix: Option<String>,
}

/// Split the raw text of a [`TokenKind::Number`] token into its parts
pub fn split_number(text: &str) -> NumberParts {
    let (body, suffix) = match text.rfind('_') {
        Some(pos) if text[pos + 1..].starts_with(|c: char| c.is_ascii_alphabetic()) => {
            (&text[..pos], Some(text[pos + 1..].to_string()))
        }
        _ => (text, None),
    };

    let (base, digits) = if body.starts_with("0x") || body.starts_with("0X") {
        (NumberBase::Hexadecimal, &body[2..])
    } else if body.starts_with("0b") || body.starts_with("0B") {
        (NumberBase::Binary, &body[2..])
    } else {
        (NumberBase::Decimal, body)
    };

    let exp_marker: &[char] = match base {
        NumberBase::Hexadecimal => &['p', 'P'],
        _ => &['e', 'E'],
    };
    let (mantissa, exp) = match digits.find(exp_marker) {
        Some(pos) => (&digits[..pos], Some(digits[pos + 1..].to_string())),
        None => (digits, None),
    };

    let (int, frac) = match mantissa.find('.') {
        Some(pos) => (
            mantissa[..pos].to_string(),
            Some(mantissa[pos + 1..].to_string()),
        ),
        None => (mantissa.to_string(), None),
    };

    NumberParts { base, int, frac, exp, suffix }
}

/// Decode a short string literal (quotes stripped, escapes resolved).
/// Returns the raw byte content and the optional literal suffix.
pub fn decode_string(text: &str) -> Result<(Vec<u8>, Option<String>), LexError> {
    let quote = text.as_bytes()[0];
    let close = text[1..]
        .rfind(quote as char)
        .map(|p| p + 1)
        .ok_or(LexError::UnterminatedString)?;
    let suffix = match text[close + 1..].strip_prefix('_') {
        Some(s) if !s.is_empty() => Some(s.to_string()),
        _ => None,
    };

    let mut bytes = Vec::with_capacity(close);
    let mut chars = text[1..close].chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let esc = chars.next().ok_or(LexError::UnterminatedString)?;
        match esc {
            'n' => bytes.push(b'\n'),
            't' => bytes.push(b'\t'),
            'r' => bytes.push(b'\r'),
            'a' => bytes.push(0x07),
            'b' => bytes.push(0x08),
            'f' => bytes.push(0x0c),
            'v' => bytes.push(0x0b),
            '\\' => bytes.push(b'\\'),
            '"' => bytes.push(b'"'),
            '\'' => bytes.push(b'\''),
            'x' => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push((hi * 16 + lo) as u8),
                    _ => return Err(LexError::UnexpectedCharacter),
                }
            }
            'z' => {
                // `\z` skips following whitespace
                let rest = chars.as_str();
                let skipped = rest.len() - rest.trim_start().len();
                for _ in 0..skipped {
                    chars.next();
                }
            }
            d if d.is_ascii_digit() => {
                // Decimal escape: up to three digits
                let mut value = d.to_digit(10).unwrap();
                for _ in 0..2 {
                    let rest = chars.as_str();
                    match rest.chars().next().and_then(|c| c.to_digit(10)) {
                        Some(dd) if value * 10 + dd <= 255 => {
                            value = value * 10 + dd;
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            _ => return Err(LexError::UnexpectedCharacter),
        }
    }
    Ok((bytes, suffix))
}

/// Extract the content of a long string token (`[[..]]` at any level).
/// A leading newline immediately after the opening bracket is skipped.
pub fn long_string_content(text: &str) -> &str {
    let level = text[1..].bytes().take_while(|&b| b == b'=').count();
    let inner = &text[level + 2..text.len() - level - 2];
    inner.strip_prefix("\r\n").or_else(|| inner.strip_prefix('\n')).unwrap_or(inner)
}

/// Extract the metalanguage source carried by a preprocessor token
pub fn preprocess_content(kind: TokenKind, text: &str) -> &str {
    match kind {
        TokenKind::PreprocessBlock => {
            // `##[=*[ ... ]=*]`
            let level = text[3..].bytes().take_while(|&b| b == b'=').count();
            &text[level + 4..text.len() - level - 2]
        }
        TokenKind::PreprocessLine => text[2..].trim_start(),
        TokenKind::PreprocessExpr => &text[2..text.len() - 2],
        TokenKind::PreprocessName => &text[2..text.len() - 2],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty(), "lex errors: {:?}", errors);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(token_kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_numbers() {
        let kinds = token_kinds("42 0x10 0b1010 3.14 1e10 0.5 2_u8");
        assert_eq!(kinds.len(), 8);
        assert!(kinds[..7].iter().all(|k| *k == TokenKind::Number));
    }

    #[test]
    fn test_malformed_hex() {
        let (_, errors) = lex("0x");
        assert_eq!(errors[0].0, LexError::MalformedHexadecimalNumber);
    }

    #[test]
    fn test_names_are_not_keywords() {
        // Keywords lex as plain names; the parser owns the keyword set
        let kinds = token_kinds("local function end foo");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        let kinds = token_kinds("+ - * / // % ^ .. == ~= <= >= << >>");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::DoubleSlash,
                TokenKind::Percent,
                TokenKind::Caret,
                TokenKind::Concat,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        let kinds = token_kinds("a -- comment\nb --[[ long\ncomment ]] c");
        assert_eq!(
            kinds,
            vec![TokenKind::Name, TokenKind::Name, TokenKind::Name, TokenKind::Eof]
        );
    }

    #[test]
    fn test_long_string() {
        let kinds = token_kinds("[[hello]] [=[world]=]");
        assert_eq!(
            kinds,
            vec![TokenKind::LongString, TokenKind::LongString, TokenKind::Eof]
        );
        assert_eq!(long_string_content("[[hello]]"), "hello");
        assert_eq!(long_string_content("[=[world]=]"), "world");
        assert_eq!(long_string_content("[[\nskip]]"), "skip");
    }

    #[test]
    fn test_preprocess_tokens() {
        let (tokens, errors) = lex("##[[local n=3]] return #[n]#*#[n]#");
        assert!(errors.is_empty());
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::PreprocessBlock,
                TokenKind::Name,
                TokenKind::PreprocessExpr,
                TokenKind::Star,
                TokenKind::PreprocessExpr,
                TokenKind::Eof
            ]
        );
        assert_eq!(
            preprocess_content(TokenKind::PreprocessBlock, "##[[local n=3]]"),
            "local n=3"
        );
        assert_eq!(preprocess_content(TokenKind::PreprocessExpr, "#[n]#"), "n");
    }

    #[test]
    fn test_preprocess_line() {
        let kinds = token_kinds("## if x then\nlocal a\n## end");
        assert_eq!(
            kinds,
            vec![
                TokenKind::PreprocessLine,
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::PreprocessLine,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_decode() {
        let (bytes, suffix) = decode_string(r#""hi\n\x41\65""#).unwrap();
        assert_eq!(bytes, b"hi\nAA");
        assert_eq!(suffix, None);

        let (bytes, suffix) = decode_string(r#""ab"_u8"#).unwrap();
        assert_eq!(bytes, b"ab");
        assert_eq!(suffix.as_deref(), Some("u8"));
    }

    #[test]
    fn test_split_number() {
        let parts = split_number("0x10");
        assert_eq!(parts.base, NumberBase::Hexadecimal);
        assert_eq!(parts.int, "10");

        let parts = split_number("3.25e2_f32");
        assert_eq!(parts.base, NumberBase::Decimal);
        assert_eq!(parts.int, "3");
        assert_eq!(parts.frac.as_deref(), Some("25"));
        assert_eq!(parts.exp.as_deref(), Some("2"));
        assert_eq!(parts.suffix.as_deref(), Some("f32"));

        let parts = split_number("0b101_u8");
        assert_eq!(parts.base, NumberBase::Binary);
        assert_eq!(parts.int, "101");
        assert_eq!(parts.suffix.as_deref(), Some("u8"));
    }

    #[test]
    fn test_span_tracking() {
        let source = "local a = 42";
        let (tokens, _) = lex(source);
        assert_eq!(tokens[0].span.text(source), "local");
        assert_eq!(tokens[1].span.text(source), "a");
        assert_eq!(tokens[2].span.text(source), "=");
        assert_eq!(tokens[3].span.text(source), "42");
    }
}
