//! Grammar state
//!
//! The parser owns a mutable [`Grammar`]: the active keyword set plus any
//! extension rules installed by the preprocessor through `set_peg`. Core
//! syntax lives in `parser.rs` as recursive descent; extension rules are
//! PEG expressions interpreted at the statement extension point, and must
//! build nodes of the existing closed tag set.
//!
//! Rule DSL accepted by [`Grammar::set_peg`]:
//!
//! ```text
//! 'word'      keyword or punctuation literal
//! %Number     token class (by token kind name)
//! expr        reference to a builtin or previously installed rule
//! a b c       sequence
//! a / b       ordered choice
//! a* a+ a?    repetition / option
//! !a &a       negative / positive lookahead (no capture)
//! ( ... )     grouping
//! ```

use crate::ast::Tag;
use crate::token::TokenKind;
use std::collections::HashSet;

/// A PEG expression over the token stream
#[derive(Debug, Clone, PartialEq)]
pub enum PegExpr {
    /// Reference to a named rule (builtin like `expr`, or installed)
    Rule(String),
    /// Match a token class
    Tok(TokenKind),
    /// Match a keyword or punctuation by its display text
    Lit(String),
    Seq(Vec<PegExpr>),
    Choice(Vec<PegExpr>),
    Star(Box<PegExpr>),
    Plus(Box<PegExpr>),
    Opt(Box<PegExpr>),
    Not(Box<PegExpr>),
    And(Box<PegExpr>),
}

/// A named extension rule building nodes of an existing tag
#[derive(Debug, Clone)]
pub struct PegRule {
    pub name: String,
    pub tag: Tag,
    pub expr: PegExpr,
}

/// The mutable grammar: keywords plus extension rules in installation order
#[derive(Debug, Clone)]
pub struct Grammar {
    keywords: HashSet<String>,
    rules: Vec<PegRule>,
}

/// The language's initial keyword set
const DEFAULT_KEYWORDS: &[&str] = &[
    "and", "break", "case", "continue", "defer", "do", "else", "elseif",
    "end", "false", "for", "function", "global", "goto", "if", "in",
    "local", "nil", "nilptr", "not", "or", "repeat", "return", "switch",
    "then", "true", "until", "while",
];

impl Grammar {
    pub fn new() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            rules: Vec::new(),
        }
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.keywords.contains(word)
    }

    pub fn add_keyword(&mut self, word: &str) {
        self.keywords.insert(word.to_string());
    }

    pub fn remove_keyword(&mut self, word: &str) {
        self.keywords.remove(word);
    }

    /// Install or replace a rule. The rule name must be a tag name from the
    /// closed set; produced nodes carry that tag.
    pub fn set_peg(&mut self, name: &str, rule_src: &str) -> Result<(), String> {
        let tag = tag_from_name(name).ok_or_else(|| format!("unknown node tag `{}`", name))?;
        let expr = parse_rule(rule_src)?;
        if let Some(existing) = self.rules.iter_mut().find(|r| r.name == name) {
            existing.expr = expr;
        } else {
            self.rules.push(PegRule { name: name.to_string(), tag, expr });
        }
        Ok(())
    }

    /// Extension rules in installation order
    pub fn rules(&self) -> &[PegRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&PegRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Self::new()
    }
}

fn tag_from_name(name: &str) -> Option<Tag> {
    const ALL: &[Tag] = &[
        Tag::Number, Tag::String, Tag::Boolean, Tag::Nil, Tag::Varargs,
        Tag::Id, Tag::IdDecl, Tag::Paren, Tag::Type, Tag::TypeInstance,
        Tag::FuncType, Tag::RecordType, Tag::RecordFieldType, Tag::UnionType,
        Tag::UnionFieldType, Tag::EnumType, Tag::EnumFieldType, Tag::ArrayType,
        Tag::PointerType, Tag::OptionalType, Tag::GenericType, Tag::DotIndex,
        Tag::ColonIndex, Tag::ArrayIndex, Tag::Table, Tag::Pair,
        Tag::Annotation, Tag::PragmaCall, Tag::Function, Tag::Call,
        Tag::CallMethod, Tag::Block, Tag::Return, Tag::If, Tag::Do,
        Tag::Defer, Tag::While, Tag::Repeat, Tag::ForNum, Tag::ForIn,
        Tag::Break, Tag::Continue, Tag::Label, Tag::Goto, Tag::VarDecl,
        Tag::Assign, Tag::FuncDef, Tag::UnaryOp, Tag::BinaryOp, Tag::Switch,
        Tag::Preprocess, Tag::PreprocessExpr, Tag::PreprocessName,
    ];
    ALL.iter().copied().find(|t| t.name() == name)
}

fn token_kind_from_name(name: &str) -> Option<TokenKind> {
    Some(match name {
        "Number" => TokenKind::Number,
        "String" => TokenKind::String,
        "LongString" => TokenKind::LongString,
        "Name" => TokenKind::Name,
        _ => return None,
    })
}

// ============ Rule DSL parser ============

struct RuleParser<'a> {
    src: &'a str,
    pos: usize,
}

/// Parse the rule DSL into a [`PegExpr`]
pub fn parse_rule(src: &str) -> Result<PegExpr, String> {
    let mut parser = RuleParser { src, pos: 0 };
    let expr = parser.parse_choice()?;
    parser.skip_ws();
    if parser.pos != src.len() {
        return Err(format!("trailing input in rule at byte {}", parser.pos));
    }
    Ok(expr)
}

impl<'a> RuleParser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn parse_choice(&mut self) -> Result<PegExpr, String> {
        let mut alts = vec![self.parse_seq()?];
        while self.eat('/') {
            alts.push(self.parse_seq()?);
        }
        Ok(if alts.len() == 1 {
            alts.pop().unwrap()
        } else {
            PegExpr::Choice(alts)
        })
    }

    fn parse_seq(&mut self) -> Result<PegExpr, String> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            let rest = self.rest();
            if rest.is_empty() || rest.starts_with('/') || rest.starts_with(')') {
                break;
            }
            items.push(self.parse_postfix()?);
        }
        if items.is_empty() {
            return Err("empty sequence in rule".to_string());
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            PegExpr::Seq(items)
        })
    }

    fn parse_postfix(&mut self) -> Result<PegExpr, String> {
        let mut expr = self.parse_atom()?;
        loop {
            self.skip_ws();
            if self.eat('*') {
                expr = PegExpr::Star(Box::new(expr));
            } else if self.eat('+') {
                expr = PegExpr::Plus(Box::new(expr));
            } else if self.eat('?') {
                expr = PegExpr::Opt(Box::new(expr));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<PegExpr, String> {
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with('!') {
            self.pos += 1;
            return Ok(PegExpr::Not(Box::new(self.parse_atom()?)));
        }
        if rest.starts_with('&') {
            self.pos += 1;
            return Ok(PegExpr::And(Box::new(self.parse_atom()?)));
        }
        if rest.starts_with('(') {
            self.pos += 1;
            let inner = self.parse_choice()?;
            if !self.eat(')') {
                return Err("missing `)` in rule".to_string());
            }
            return Ok(inner);
        }
        if rest.starts_with('\'') {
            let inner = &rest[1..];
            let close = inner.find('\'').ok_or("unterminated literal in rule")?;
            let lit = inner[..close].to_string();
            self.pos += close + 2;
            if lit.is_empty() {
                return Err("empty literal in rule".to_string());
            }
            return Ok(PegExpr::Lit(lit));
        }
        if rest.starts_with('%') {
            self.pos += 1;
            let name = self.take_name()?;
            let kind = token_kind_from_name(&name)
                .ok_or_else(|| format!("unknown token class `%{}`", name))?;
            return Ok(PegExpr::Tok(kind));
        }
        let name = self.take_name()?;
        Ok(PegExpr::Rule(name))
    }

    fn take_name(&mut self) -> Result<String, String> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if len == 0 {
            return Err(format!("expected name in rule at byte {}", self.pos));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keywords() {
        let grammar = Grammar::new();
        assert!(grammar.is_keyword("local"));
        assert!(grammar.is_keyword("end"));
        assert!(!grammar.is_keyword("unless"));
    }

    #[test]
    fn test_keyword_mutation_roundtrip() {
        let mut grammar = Grammar::new();
        grammar.add_keyword("unless");
        assert!(grammar.is_keyword("unless"));
        grammar.remove_keyword("unless");
        assert!(!grammar.is_keyword("unless"));
    }

    #[test]
    fn test_parse_rule_dsl() {
        let expr = parse_rule("'unless' expr 'then' block 'end'").unwrap();
        match expr {
            PegExpr::Seq(items) => {
                assert_eq!(items.len(), 5);
                assert_eq!(items[0], PegExpr::Lit("unless".into()));
                assert_eq!(items[1], PegExpr::Rule("expr".into()));
            }
            other => panic!("expected sequence, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rule_choice_and_postfix() {
        let expr = parse_rule("(expr ',')* / %Name?").unwrap();
        match expr {
            PegExpr::Choice(alts) => {
                assert!(matches!(alts[0], PegExpr::Star(_)));
                assert!(matches!(alts[1], PegExpr::Opt(_)));
            }
            other => panic!("expected choice, got {:?}", other),
        }
    }

    #[test]
    fn test_set_peg_requires_known_tag() {
        let mut grammar = Grammar::new();
        assert!(grammar.set_peg("While", "'until' expr block 'end'").is_ok());
        assert!(grammar.set_peg("NotATag", "expr").is_err());
        // replacement, not duplication
        assert!(grammar.set_peg("While", "'while' expr block 'end'").is_ok());
        assert_eq!(grammar.rules().len(), 1);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut grammar = Grammar::new();
        let copy = grammar.clone();
        grammar.add_keyword("unless");
        assert!(!copy.is_keyword("unless"));
    }
}
