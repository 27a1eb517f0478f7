//! Preprocessor
//!
//! A staged evaluator for the metalanguage carried by `Preprocess`,
//! `PreprocessExpr` and `PreprocessName` nodes. The analyzer executes each
//! node when traversal reaches it, in source order; statements produced via
//! `inject_statement` are parsed with the *current* grammar and spliced in
//! place of the emitting node, to be analyzed immediately after it.
//!
//! All preprocessor chunks of one compilation unit share a single
//! environment, so a `local` declared in one `##[[ ... ]]` block is visible
//! to every later `#[ ... ]#` splice in the file.
//!
//! The metalanguage is a small statement/expression language in the host
//! syntax: locals, assignment, `if`/`while`/numeric `for`, functions,
//! tables, arithmetic, comparison and concatenation. Exposed compiler API:
//!
//! | builtin                | effect                                        |
//! |------------------------|-----------------------------------------------|
//! | `inject_statement(s)`  | splice freshly parsed statements at this site |
//! | `after_analyze(f)`     | queue `f` to run after the root traversal     |
//! | `add_keyword(w)` / `remove_keyword(w)` | mutate the active keyword set |
//! | `set_peg(name, rule)`  | install/replace a grammar rule                |
//! | `set_pragma(name, v)`  | toggle compilation pragmas                    |
//! | `root_symbols()`       | names of root-scope symbols, in order         |
//! | `print`, `tostring`, `tonumber`, `error`                               |
//!
//! A metalanguage error aborts the compilation (`PreprocessError`) carrying
//! the source span of the node and the metalanguage call trace.

use crate::ast::{Attr, CompVal, Node, NodeData, NodeId, Tag};
use crate::context::Context;
use crate::errors::{CompileError, CompileResult};
use crate::lexer::{self, NumberBase, NumberParts};
use crate::parser;
use crate::span::Span;
use crate::token::{Token, TokenKind};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

const CALL_DEPTH_LIMIT: usize = 200;

// ============ Values ============

pub type EnvRc = Rc<RefCell<EnvNode>>;

/// One lexical frame of the metalanguage environment
#[derive(Debug, Default)]
pub struct EnvNode {
    vars: HashMap<String, MValue>,
    parent: Option<EnvRc>,
}

/// A metalanguage function value
#[derive(Debug)]
pub struct MFunc {
    params: Vec<String>,
    body: Rc<Vec<MStmt>>,
    env: EnvRc,
}

/// Table key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MKey {
    Int(i64),
    Str(String),
}

/// A metalanguage table
#[derive(Debug, Default)]
pub struct MTable {
    entries: HashMap<MKey, MValue>,
}

impl MTable {
    fn get(&self, key: &MKey) -> MValue {
        self.entries.get(key).cloned().unwrap_or(MValue::Nil)
    }

    fn set(&mut self, key: MKey, value: MValue) {
        if matches!(value, MValue::Nil) {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// Border of the array part: consecutive integer keys from 1
    fn len(&self) -> i64 {
        let mut n = 0;
        while self.entries.contains_key(&MKey::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

/// A metalanguage value
#[derive(Debug, Clone)]
pub enum MValue {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(Rc<String>),
    Table(Rc<RefCell<MTable>>),
    Func(Rc<MFunc>),
    /// Compiler API entry point, dispatched by name
    Builtin(&'static str),
}

impl MValue {
    fn truthy(&self) -> bool {
        !matches!(self, MValue::Nil | MValue::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            MValue::Nil => "nil",
            MValue::Bool(_) => "boolean",
            MValue::Int(_) | MValue::Num(_) => "number",
            MValue::Str(_) => "string",
            MValue::Table(_) => "table",
            MValue::Func(_) | MValue::Builtin(_) => "function",
        }
    }
}

impl fmt::Display for MValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MValue::Nil => write!(f, "nil"),
            MValue::Bool(b) => write!(f, "{}", b),
            MValue::Int(i) => write!(f, "{}", i),
            MValue::Num(n) => write!(f, "{}", n),
            MValue::Str(s) => write!(f, "{}", s),
            MValue::Table(_) => write!(f, "table"),
            MValue::Func(_) | MValue::Builtin(_) => write!(f, "function"),
        }
    }
}

fn value_eq(a: &MValue, b: &MValue) -> bool {
    match (a, b) {
        (MValue::Nil, MValue::Nil) => true,
        (MValue::Bool(a), MValue::Bool(b)) => a == b,
        (MValue::Int(a), MValue::Int(b)) => a == b,
        (MValue::Num(a), MValue::Num(b)) => a == b,
        (MValue::Int(a), MValue::Num(b)) | (MValue::Num(b), MValue::Int(a)) => *a as f64 == *b,
        (MValue::Str(a), MValue::Str(b)) => a == b,
        (MValue::Table(a), MValue::Table(b)) => Rc::ptr_eq(a, b),
        (MValue::Func(a), MValue::Func(b)) => Rc::ptr_eq(a, b),
        (MValue::Builtin(a), MValue::Builtin(b)) => a == b,
        _ => false,
    }
}

// ============ Environment ============

fn env_child(parent: &EnvRc) -> EnvRc {
    Rc::new(RefCell::new(EnvNode {
        vars: HashMap::new(),
        parent: Some(parent.clone()),
    }))
}

fn env_get(env: &EnvRc, name: &str) -> MValue {
    let node = env.borrow();
    if let Some(value) = node.vars.get(name) {
        return value.clone();
    }
    match &node.parent {
        Some(parent) => env_get(parent, name),
        None => MValue::Nil,
    }
}

fn env_define(env: &EnvRc, name: &str, value: MValue) {
    env.borrow_mut().vars.insert(name.to_string(), value);
}

/// Assign to an existing variable, or define at the root (global) frame
fn env_set(env: &EnvRc, name: &str, value: MValue) {
    {
        let mut node = env.borrow_mut();
        if node.vars.contains_key(name) {
            node.vars.insert(name.to_string(), value);
            return;
        }
    }
    let parent = env.borrow().parent.clone();
    match parent {
        Some(parent) => env_set(&parent, name, value),
        None => env_define(env, name, value),
    }
}

// ============ Preprocessor state ============

/// Preprocessor state of one compilation unit, owned by the [`Context`]
#[derive(Default)]
pub struct PpState {
    /// Shared environment of all chunks in the unit
    env: Option<EnvRc>,
    /// Hooks queued by `after_analyze`, run FIFO after the root traversal
    pub after_analyze: Vec<MValue>,
    /// Statements produced by `inject_statement`, pending a parse
    pending: Vec<String>,
    /// Active metalanguage call trace (for error reports)
    trace: Vec<String>,
}

impl PpState {
    fn unit_env(&mut self) -> EnvRc {
        if self.env.is_none() {
            let root = Rc::new(RefCell::new(EnvNode::default()));
            for name in [
                "print",
                "tostring",
                "tonumber",
                "error",
                "inject_statement",
                "after_analyze",
                "add_keyword",
                "remove_keyword",
                "set_peg",
                "set_pragma",
                "root_symbols",
            ] {
                env_define(&root, name, MValue::Builtin(name));
            }
            self.env = Some(env_child(&root));
        }
        self.env.clone().unwrap()
    }
}

impl fmt::Debug for PpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PpState")
            .field("after_analyze", &self.after_analyze.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ============ Public entry points ============

/// Execute a `Preprocess` node. Returns the freshly parsed statements that
/// replace it (possibly none).
pub fn run_block(ctx: &mut Context, node: NodeId) -> CompileResult<Vec<NodeId>> {
    let span = ctx.ast.node(node).span;
    let source = match ctx.ast.node(node).data.as_source() {
        Some(s) => s.to_string(),
        None => return Ok(Vec::new()),
    };
    let stmts = meta_parse(&source).map_err(|e| e.into_compile_error(span))?;

    let mut pp = std::mem::take(&mut ctx.pp);
    let env = pp.unit_env();
    let result = {
        let mut interp = Interp { ctx: &mut *ctx, pp: &mut pp, depth: 0 };
        interp.exec_block(&stmts, &env)
    };
    let pending = std::mem::take(&mut pp.pending);
    ctx.pp = pp;
    result.map_err(|e| e.into_compile_error(span))?;

    let mut replacement = Vec::new();
    for code in pending {
        let block = parser::parse_source(ctx, &code)
            .map_err(|e| CompileError::preprocess(
                format!("failed to parse injected statement: {}", e),
                Vec::new(),
                span,
            ))?;
        replacement.extend(ctx.ast.children(block));
    }
    Ok(replacement)
}

/// Execute a `PreprocessExpr` node and rewrite it in place as the literal
/// node of the computed value.
pub fn eval_expr_node(ctx: &mut Context, node: NodeId) -> CompileResult<()> {
    let span = ctx.ast.node(node).span;
    let value = eval_source(ctx, node, span)?;
    splice_value(ctx, node, value, span)
}

/// Execute a `PreprocessName` node; returns the spliced name and rewrites
/// the node into an identifier.
pub fn eval_name_node(ctx: &mut Context, node: NodeId) -> CompileResult<String> {
    let span = ctx.ast.node(node).span;
    let value = eval_source(ctx, node, span)?;
    match value {
        MValue::Str(name) => {
            let name = name.to_string();
            let n = ctx.ast.node_mut(node);
            n.tag = Tag::Id;
            n.data = NodeData::Name(name.clone());
            n.attr = Attr::default();
            Ok(name)
        }
        other => Err(CompileError::preprocess(
            format!("name splice expects a string, got {}", other.type_name()),
            Vec::new(),
            span,
        )),
    }
}

/// Run all queued `after_analyze` hooks, in registration order. Hooks may
/// register further hooks; those run after the already-queued ones.
pub fn run_after_analyze_hooks(ctx: &mut Context) -> CompileResult<()> {
    let mut index = 0;
    loop {
        let mut pp = std::mem::take(&mut ctx.pp);
        let hook = match pp.after_analyze.get(index) {
            Some(hook) => hook.clone(),
            None => {
                ctx.pp = pp;
                return Ok(());
            }
        };
        let result = {
            let mut interp = Interp { ctx: &mut *ctx, pp: &mut pp, depth: 0 };
            interp.call_value(&hook, Vec::new())
        };
        ctx.pp = pp;
        result.map_err(|e| e.into_compile_error(Span::default()))?;
        index += 1;
    }
}

fn eval_source(ctx: &mut Context, node: NodeId, span: Span) -> CompileResult<MValue> {
    let source = ctx
        .ast
        .node(node)
        .data
        .as_source()
        .map(str::to_string)
        .unwrap_or_default();
    let expr = meta_parse_expr(&source).map_err(|e| e.into_compile_error(span))?;
    let mut pp = std::mem::take(&mut ctx.pp);
    let env = pp.unit_env();
    let result = {
        let mut interp = Interp { ctx: &mut *ctx, pp: &mut pp, depth: 0 };
        interp.eval(&expr, &env)
    };
    ctx.pp = pp;
    result.map_err(|e| e.into_compile_error(span))
}

/// Rewrite a node in place as the literal form of a computed value. The
/// attribute bag is pre-filled so the emitted C carries no metalanguage
/// residue.
fn splice_value(ctx: &mut Context, node: NodeId, value: MValue, span: Span) -> CompileResult<()> {
    let prims = ctx.types.prims;
    let n = ctx.ast.node_mut(node);
    n.children.clear();
    n.attr = Attr::default();
    match value {
        MValue::Int(i) => {
            n.tag = Tag::Number;
            n.data = NodeData::Number(NumberParts {
                base: NumberBase::Decimal,
                int: i.unsigned_abs().to_string(),
                frac: None,
                exp: None,
                suffix: None,
            });
            n.attr.value = Some(CompVal::Int(i as i128));
            n.attr.ty = Some(prims.int64);
            n.attr.comptime = true;
        }
        MValue::Num(f) => {
            n.tag = Tag::Number;
            n.data = NodeData::Number(NumberParts {
                base: NumberBase::Decimal,
                int: format!("{}", f.abs()),
                frac: None,
                exp: None,
                suffix: None,
            });
            n.attr.value = Some(CompVal::Float(f));
            n.attr.ty = Some(prims.float64);
            n.attr.comptime = true;
        }
        MValue::Bool(b) => {
            n.tag = Tag::Boolean;
            n.data = NodeData::Bool(b);
            n.attr.value = Some(CompVal::Bool(b));
            n.attr.ty = Some(prims.boolean);
            n.attr.comptime = true;
        }
        MValue::Str(s) => {
            n.tag = Tag::String;
            n.data = NodeData::Str { value: s.as_bytes().to_vec(), suffix: None };
            n.attr.value = Some(CompVal::Str(s.as_bytes().to_vec()));
            n.attr.ty = Some(prims.string);
            n.attr.comptime = true;
        }
        MValue::Nil => {
            n.tag = Tag::Nil;
            n.data = NodeData::None;
            n.attr.value = Some(CompVal::Nil);
            n.attr.ty = Some(prims.niltype);
            n.attr.comptime = true;
        }
        other => {
            return Err(CompileError::preprocess(
                format!("cannot splice a {} value into the tree", other.type_name()),
                Vec::new(),
                span,
            ))
        }
    }
    Ok(())
}

// ============ Meta AST ============

#[derive(Debug, Clone)]
enum MExpr {
    Nil,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
    Var(String),
    Index(Box<MExpr>, Box<MExpr>),
    Call(Box<MExpr>, Vec<MExpr>),
    Func(Vec<String>, Rc<Vec<MStmt>>),
    Table(Vec<(Option<MExpr>, MExpr)>),
    Binop(&'static str, Box<MExpr>, Box<MExpr>),
    Unop(&'static str, Box<MExpr>),
}

#[derive(Debug, Clone)]
enum MStmt {
    Local(Vec<String>, Vec<MExpr>),
    Assign(Vec<MExpr>, Vec<MExpr>),
    Call(MExpr),
    If(Vec<(MExpr, Vec<MStmt>)>, Option<Vec<MStmt>>),
    While(MExpr, Vec<MStmt>),
    NumFor(String, MExpr, MExpr, Option<MExpr>, Vec<MStmt>),
    Return(Option<MExpr>),
    Break,
}

/// A metalanguage runtime error with its call trace
#[derive(Debug)]
struct MError {
    message: String,
    trace: Vec<String>,
}

impl MError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), trace: Vec::new() }
    }

    fn into_compile_error(self, span: Span) -> CompileError {
        CompileError::preprocess(self.message, self.trace, span)
    }
}

// ============ Meta parser ============

const META_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for",
    "function", "if", "in", "local", "nil", "not", "or", "return", "then",
    "true", "while",
];

struct MetaParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

fn meta_parse(source: &str) -> Result<Vec<MStmt>, MError> {
    let mut parser = MetaParser::new(source)?;
    let stmts = parser.parse_block(&[])?;
    if !parser.at_eof() {
        return Err(MError::new(format!(
            "unexpected `{}` in metalanguage chunk",
            parser.text()
        )));
    }
    Ok(stmts)
}

fn meta_parse_expr(source: &str) -> Result<MExpr, MError> {
    let mut parser = MetaParser::new(source)?;
    let expr = parser.parse_expr()?;
    if !parser.at_eof() {
        return Err(MError::new("trailing input after metalanguage expression"));
    }
    Ok(expr)
}

impl<'a> MetaParser<'a> {
    fn new(source: &'a str) -> Result<Self, MError> {
        let (tokens, errors) = lexer::lex(source);
        if let Some((err, _)) = errors.first() {
            return Err(MError::new(format!("metalanguage lex error: {}", err)));
        }
        Ok(Self { tokens, pos: 0, src: source })
    }

    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.cur().kind
    }

    fn text(&self) -> &'a str {
        self.cur().span.text(self.src)
    }

    fn at_eof(&self) -> bool {
        self.kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.cur().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn is_kw(&self, word: &str) -> bool {
        self.kind() == TokenKind::Name && self.text() == word && META_KEYWORDS.contains(&word)
    }

    fn accept_kw(&mut self, word: &str) -> bool {
        if self.is_kw(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, word: &str) -> Result<(), MError> {
        if self.accept_kw(word) {
            Ok(())
        } else {
            Err(MError::new(format!("expected `{}` in metalanguage, found `{}`", word, self.text())))
        }
    }

    fn accept(&mut self, kind: TokenKind) -> bool {
        if self.kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), MError> {
        if self.accept(kind) {
            Ok(())
        } else {
            Err(MError::new(format!("expected `{}` in metalanguage, found `{}`", kind, self.text())))
        }
    }

    fn is_name(&self) -> bool {
        self.kind() == TokenKind::Name && !META_KEYWORDS.contains(&self.text())
    }

    fn parse_name(&mut self) -> Result<String, MError> {
        if self.is_name() {
            let token = self.advance();
            Ok(token.span.text(self.src).to_string())
        } else {
            Err(MError::new(format!("expected a name in metalanguage, found `{}`", self.text())))
        }
    }

    fn at_terminator(&self, terminators: &[&str]) -> bool {
        self.at_eof() || terminators.iter().any(|t| self.is_kw(t))
    }

    fn parse_block(&mut self, terminators: &[&str]) -> Result<Vec<MStmt>, MError> {
        let mut stmts = Vec::new();
        while !self.at_terminator(terminators) {
            if self.accept(TokenKind::Semicolon) {
                continue;
            }
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<MStmt, MError> {
        if self.accept_kw("local") {
            if self.accept_kw("function") {
                let name = self.parse_name()?;
                let func = self.parse_func_tail()?;
                return Ok(MStmt::Local(vec![name], vec![func]));
            }
            let mut names = vec![self.parse_name()?];
            while self.accept(TokenKind::Comma) {
                names.push(self.parse_name()?);
            }
            let mut values = Vec::new();
            if self.accept(TokenKind::Eq) {
                values.push(self.parse_expr()?);
                while self.accept(TokenKind::Comma) {
                    values.push(self.parse_expr()?);
                }
            }
            return Ok(MStmt::Local(names, values));
        }
        if self.accept_kw("function") {
            let name = self.parse_name()?;
            let mut target = MExpr::Var(name);
            while self.accept(TokenKind::Dot) {
                let field = self.parse_name()?;
                target = MExpr::Index(Box::new(target), Box::new(MExpr::Str(field)));
            }
            let func = self.parse_func_tail()?;
            return Ok(MStmt::Assign(vec![target], vec![func]));
        }
        if self.accept_kw("if") {
            let mut arms = Vec::new();
            let cond = self.parse_expr()?;
            self.expect_kw("then")?;
            let body = self.parse_block(&["elseif", "else", "end"])?;
            arms.push((cond, body));
            let mut else_body = None;
            loop {
                if self.accept_kw("elseif") {
                    let cond = self.parse_expr()?;
                    self.expect_kw("then")?;
                    let body = self.parse_block(&["elseif", "else", "end"])?;
                    arms.push((cond, body));
                } else if self.accept_kw("else") {
                    else_body = Some(self.parse_block(&["end"])?);
                    break;
                } else {
                    break;
                }
            }
            self.expect_kw("end")?;
            return Ok(MStmt::If(arms, else_body));
        }
        if self.accept_kw("while") {
            let cond = self.parse_expr()?;
            self.expect_kw("do")?;
            let body = self.parse_block(&["end"])?;
            self.expect_kw("end")?;
            return Ok(MStmt::While(cond, body));
        }
        if self.accept_kw("for") {
            let var = self.parse_name()?;
            self.expect(TokenKind::Eq)?;
            let begin = self.parse_expr()?;
            self.expect(TokenKind::Comma)?;
            let stop = self.parse_expr()?;
            let step = if self.accept(TokenKind::Comma) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect_kw("do")?;
            let body = self.parse_block(&["end"])?;
            self.expect_kw("end")?;
            return Ok(MStmt::NumFor(var, begin, stop, step, body));
        }
        if self.accept_kw("return") {
            let value = if self.at_terminator(&["end", "else", "elseif"]) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            return Ok(MStmt::Return(value));
        }
        if self.accept_kw("break") {
            return Ok(MStmt::Break);
        }
        // call or assignment
        let first = self.parse_suffixed()?;
        if self.kind() == TokenKind::Eq || self.kind() == TokenKind::Comma {
            let mut targets = vec![first];
            while self.accept(TokenKind::Comma) {
                targets.push(self.parse_suffixed()?);
            }
            self.expect(TokenKind::Eq)?;
            let mut values = vec![self.parse_expr()?];
            while self.accept(TokenKind::Comma) {
                values.push(self.parse_expr()?);
            }
            return Ok(MStmt::Assign(targets, values));
        }
        match first {
            MExpr::Call(..) => Ok(MStmt::Call(first)),
            _ => Err(MError::new("metalanguage statement must be a call or assignment")),
        }
    }

    fn parse_func_tail(&mut self) -> Result<MExpr, MError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.accept(TokenKind::RParen) {
            loop {
                params.push(self.parse_name()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        let body = self.parse_block(&["end"])?;
        self.expect_kw("end")?;
        Ok(MExpr::Func(params, Rc::new(body)))
    }

    fn binop(&self) -> Option<(&'static str, u8, bool)> {
        Some(match self.kind() {
            TokenKind::Name if self.is_kw("or") => ("or", 1, false),
            TokenKind::Name if self.is_kw("and") => ("and", 2, false),
            TokenKind::Lt => ("lt", 3, false),
            TokenKind::Gt => ("gt", 3, false),
            TokenKind::LtEq => ("le", 3, false),
            TokenKind::GtEq => ("ge", 3, false),
            TokenKind::NotEq => ("ne", 3, false),
            TokenKind::EqEq => ("eq", 3, false),
            TokenKind::Concat => ("concat", 4, true),
            TokenKind::Plus => ("add", 5, false),
            TokenKind::Minus => ("sub", 5, false),
            TokenKind::Star => ("mul", 6, false),
            TokenKind::Slash => ("div", 6, false),
            TokenKind::DoubleSlash => ("idiv", 6, false),
            TokenKind::Percent => ("mod", 6, false),
            TokenKind::Caret => ("pow", 8, true),
            _ => return None,
        })
    }

    fn parse_expr(&mut self) -> Result<MExpr, MError> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<MExpr, MError> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec, right)) = self.binop() {
            if prec < min_prec {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(if right { prec } else { prec + 1 })?;
            lhs = MExpr::Binop(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<MExpr, MError> {
        let op = match self.kind() {
            TokenKind::Name if self.is_kw("not") => Some("not"),
            TokenKind::Minus => Some("neg"),
            TokenKind::Hash => Some("len"),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_binary(7)?;
            return Ok(MExpr::Unop(op, Box::new(operand)));
        }
        self.parse_suffixed()
    }

    fn parse_suffixed(&mut self) -> Result<MExpr, MError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.kind() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.parse_name()?;
                    expr = MExpr::Index(Box::new(expr), Box::new(MExpr::Str(field)));
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = MExpr::Index(Box::new(expr), Box::new(key));
                }
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.accept(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.accept(TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect(TokenKind::RParen)?;
                    }
                    expr = MExpr::Call(Box::new(expr), args);
                }
                TokenKind::String | TokenKind::LongString => {
                    let arg = self.parse_primary()?;
                    expr = MExpr::Call(Box::new(expr), vec![arg]);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<MExpr, MError> {
        match self.kind() {
            TokenKind::Number => {
                let token = self.advance();
                let parts = lexer::split_number(token.span.text(self.src));
                number_from_parts(&parts)
            }
            TokenKind::String => {
                let token = self.advance();
                let (bytes, _) = lexer::decode_string(token.span.text(self.src))
                    .map_err(|e| MError::new(format!("metalanguage string error: {}", e)))?;
                Ok(MExpr::Str(String::from_utf8_lossy(&bytes).into_owned()))
            }
            TokenKind::LongString => {
                let token = self.advance();
                let content = lexer::long_string_content(token.span.text(self.src));
                Ok(MExpr::Str(content.to_string()))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut items = Vec::new();
                while self.kind() != TokenKind::RBrace {
                    if self.kind() == TokenKind::LBracket {
                        self.advance();
                        let key = self.parse_expr()?;
                        self.expect(TokenKind::RBracket)?;
                        self.expect(TokenKind::Eq)?;
                        let value = self.parse_expr()?;
                        items.push((Some(key), value));
                    } else if self.is_name()
                        && self.tokens.get(self.pos + 1).map(|t| t.kind) == Some(TokenKind::Eq)
                    {
                        let name = self.parse_name()?;
                        self.advance(); // `=`
                        let value = self.parse_expr()?;
                        items.push((Some(MExpr::Str(name)), value));
                    } else {
                        items.push((None, self.parse_expr()?));
                    }
                    if !self.accept(TokenKind::Comma) && !self.accept(TokenKind::Semicolon) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(MExpr::Table(items))
            }
            TokenKind::Name => {
                if self.accept_kw("nil") {
                    Ok(MExpr::Nil)
                } else if self.accept_kw("true") {
                    Ok(MExpr::Bool(true))
                } else if self.accept_kw("false") {
                    Ok(MExpr::Bool(false))
                } else if self.accept_kw("function") {
                    self.parse_func_tail()
                } else if self.is_name() {
                    Ok(MExpr::Var(self.parse_name()?))
                } else {
                    Err(MError::new(format!("unexpected keyword `{}` in metalanguage", self.text())))
                }
            }
            other => Err(MError::new(format!("unexpected `{}` in metalanguage", other))),
        }
    }
}

fn number_from_parts(parts: &NumberParts) -> Result<MExpr, MError> {
    let radix = match parts.base {
        NumberBase::Decimal => 10,
        NumberBase::Hexadecimal => 16,
        NumberBase::Binary => 2,
    };
    if parts.frac.is_none() && parts.exp.is_none() {
        let value = i64::from_str_radix(&parts.int, radix)
            .map_err(|_| MError::new("metalanguage integer out of range"))?;
        Ok(MExpr::Int(value))
    } else {
        let mut text = parts.int.clone();
        if let Some(frac) = &parts.frac {
            text.push('.');
            text.push_str(frac);
        }
        if let Some(exp) = &parts.exp {
            text.push('e');
            text.push_str(exp);
        }
        let value: f64 = text
            .parse()
            .map_err(|_| MError::new("malformed metalanguage number"))?;
        Ok(MExpr::Num(value))
    }
}

// ============ Interpreter ============

enum Flow {
    Normal,
    Break,
    Return(MValue),
}

struct Interp<'a> {
    ctx: &'a mut Context,
    pp: &'a mut PpState,
    depth: usize,
}

impl<'a> Interp<'a> {
    fn exec_block(&mut self, stmts: &[MStmt], env: &EnvRc) -> Result<Flow, MError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &MStmt, env: &EnvRc) -> Result<Flow, MError> {
        match stmt {
            MStmt::Local(names, values) => {
                for (i, name) in names.iter().enumerate() {
                    let value = match values.get(i) {
                        Some(expr) => self.eval(expr, env)?,
                        None => MValue::Nil,
                    };
                    env_define(env, name, value);
                }
                Ok(Flow::Normal)
            }
            MStmt::Assign(targets, values) => {
                let computed: Result<Vec<_>, _> =
                    values.iter().map(|v| self.eval(v, env)).collect();
                let computed = computed?;
                for (i, target) in targets.iter().enumerate() {
                    let value = computed.get(i).cloned().unwrap_or(MValue::Nil);
                    self.assign(target, value, env)?;
                }
                Ok(Flow::Normal)
            }
            MStmt::Call(expr) => {
                self.eval(expr, env)?;
                Ok(Flow::Normal)
            }
            MStmt::If(arms, else_body) => {
                for (cond, body) in arms {
                    if self.eval(cond, env)?.truthy() {
                        let child = env_child(env);
                        return self.exec_block(body, &child);
                    }
                }
                if let Some(body) = else_body {
                    let child = env_child(env);
                    return self.exec_block(body, &child);
                }
                Ok(Flow::Normal)
            }
            MStmt::While(cond, body) => {
                while self.eval(cond, env)?.truthy() {
                    let child = env_child(env);
                    match self.exec_block(body, &child)? {
                        Flow::Break => break,
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            MStmt::NumFor(var, begin, stop, step, body) => {
                let begin = self.eval_int(begin, env)?;
                let stop = self.eval_int(stop, env)?;
                let step = match step {
                    Some(expr) => self.eval_int(expr, env)?,
                    None => 1,
                };
                if step == 0 {
                    return Err(MError::new("metalanguage `for` step is zero"));
                }
                let mut i = begin;
                while (step > 0 && i <= stop) || (step < 0 && i >= stop) {
                    let child = env_child(env);
                    env_define(&child, var, MValue::Int(i));
                    match self.exec_block(body, &child)? {
                        Flow::Break => break,
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                    i += step;
                }
                Ok(Flow::Normal)
            }
            MStmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => MValue::Nil,
                };
                Ok(Flow::Return(value))
            }
            MStmt::Break => Ok(Flow::Break),
        }
    }

    fn assign(&mut self, target: &MExpr, value: MValue, env: &EnvRc) -> Result<(), MError> {
        match target {
            MExpr::Var(name) => {
                env_set(env, name, value);
                Ok(())
            }
            MExpr::Index(table, key) => {
                let table = self.eval(table, env)?;
                let key = self.eval_key(key, env)?;
                match table {
                    MValue::Table(t) => {
                        t.borrow_mut().set(key, value);
                        Ok(())
                    }
                    other => Err(MError::new(format!(
                        "cannot index a {} value in metalanguage",
                        other.type_name()
                    ))),
                }
            }
            _ => Err(MError::new("invalid assignment target in metalanguage")),
        }
    }

    fn eval_int(&mut self, expr: &MExpr, env: &EnvRc) -> Result<i64, MError> {
        match self.eval(expr, env)? {
            MValue::Int(i) => Ok(i),
            MValue::Num(n) => Ok(n as i64),
            other => Err(MError::new(format!(
                "expected a number in metalanguage, got {}",
                other.type_name()
            ))),
        }
    }

    fn eval_key(&mut self, expr: &MExpr, env: &EnvRc) -> Result<MKey, MError> {
        match self.eval(expr, env)? {
            MValue::Int(i) => Ok(MKey::Int(i)),
            MValue::Str(s) => Ok(MKey::Str(s.to_string())),
            other => Err(MError::new(format!(
                "invalid table key of type {} in metalanguage",
                other.type_name()
            ))),
        }
    }

    fn eval(&mut self, expr: &MExpr, env: &EnvRc) -> Result<MValue, MError> {
        match expr {
            MExpr::Nil => Ok(MValue::Nil),
            MExpr::Bool(b) => Ok(MValue::Bool(*b)),
            MExpr::Int(i) => Ok(MValue::Int(*i)),
            MExpr::Num(n) => Ok(MValue::Num(*n)),
            MExpr::Str(s) => Ok(MValue::Str(Rc::new(s.clone()))),
            MExpr::Var(name) => Ok(env_get(env, name)),
            MExpr::Index(table, key) => {
                let table = self.eval(table, env)?;
                let key = self.eval_key(key, env)?;
                match table {
                    MValue::Table(t) => Ok(t.borrow().get(&key)),
                    other => Err(MError::new(format!(
                        "cannot index a {} value in metalanguage",
                        other.type_name()
                    ))),
                }
            }
            MExpr::Call(callee, args) => {
                let callee = self.eval(callee, env)?;
                let args: Result<Vec<_>, _> = args.iter().map(|a| self.eval(a, env)).collect();
                self.call_value(&callee, args?)
            }
            MExpr::Func(params, body) => Ok(MValue::Func(Rc::new(MFunc {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
            }))),
            MExpr::Table(items) => {
                let table = Rc::new(RefCell::new(MTable::default()));
                let mut array_index = 0;
                for (key, value) in items {
                    let value = self.eval(value, env)?;
                    let key = match key {
                        Some(expr) => self.eval_key(expr, env)?,
                        None => {
                            array_index += 1;
                            MKey::Int(array_index)
                        }
                    };
                    table.borrow_mut().set(key, value);
                }
                Ok(MValue::Table(table))
            }
            MExpr::Binop(op, lhs, rhs) => self.eval_binop(op, lhs, rhs, env),
            MExpr::Unop(op, operand) => {
                let value = self.eval(operand, env)?;
                match (*op, value) {
                    ("not", value) => Ok(MValue::Bool(!value.truthy())),
                    ("neg", MValue::Int(i)) => Ok(MValue::Int(-i)),
                    ("neg", MValue::Num(n)) => Ok(MValue::Num(-n)),
                    ("len", MValue::Str(s)) => Ok(MValue::Int(s.len() as i64)),
                    ("len", MValue::Table(t)) => Ok(MValue::Int(t.borrow().len())),
                    (op, value) => Err(MError::new(format!(
                        "cannot apply `{}` to a {} in metalanguage",
                        op,
                        value.type_name()
                    ))),
                }
            }
        }
    }

    fn eval_binop(
        &mut self,
        op: &'static str,
        lhs: &MExpr,
        rhs: &MExpr,
        env: &EnvRc,
    ) -> Result<MValue, MError> {
        // short-circuit forms first
        if op == "and" {
            let left = self.eval(lhs, env)?;
            return if left.truthy() { self.eval(rhs, env) } else { Ok(left) };
        }
        if op == "or" {
            let left = self.eval(lhs, env)?;
            return if left.truthy() { Ok(left) } else { self.eval(rhs, env) };
        }
        let left = self.eval(lhs, env)?;
        let right = self.eval(rhs, env)?;
        match op {
            "eq" => Ok(MValue::Bool(value_eq(&left, &right))),
            "ne" => Ok(MValue::Bool(!value_eq(&left, &right))),
            "concat" => Ok(MValue::Str(Rc::new(format!("{}{}", left, right)))),
            "lt" | "le" | "gt" | "ge" => {
                let result = match (&left, &right) {
                    (MValue::Int(a), MValue::Int(b)) => compare(op, *a as f64, *b as f64),
                    (MValue::Str(a), MValue::Str(b)) => match op {
                        "lt" => a < b,
                        "le" => a <= b,
                        "gt" => a > b,
                        _ => a >= b,
                    },
                    _ => compare(op, to_num(&left)?, to_num(&right)?),
                };
                Ok(MValue::Bool(result))
            }
            "add" | "sub" | "mul" | "idiv" | "mod" => {
                if let (MValue::Int(a), MValue::Int(b)) = (&left, &right) {
                    let (a, b) = (*a, *b);
                    let value = match op {
                        "add" => a.wrapping_add(b),
                        "sub" => a.wrapping_sub(b),
                        "mul" => a.wrapping_mul(b),
                        "idiv" => {
                            if b == 0 {
                                return Err(MError::new("integer division by zero in metalanguage"));
                            }
                            a.div_euclid(b)
                        }
                        _ => {
                            if b == 0 {
                                return Err(MError::new("integer modulo by zero in metalanguage"));
                            }
                            a.rem_euclid(b)
                        }
                    };
                    return Ok(MValue::Int(value));
                }
                let (a, b) = (to_num(&left)?, to_num(&right)?);
                let value = match op {
                    "add" => a + b,
                    "sub" => a - b,
                    "mul" => a * b,
                    "idiv" => (a / b).floor(),
                    _ => a - (a / b).floor() * b,
                };
                Ok(MValue::Num(value))
            }
            "div" => Ok(MValue::Num(to_num(&left)? / to_num(&right)?)),
            "pow" => Ok(MValue::Num(to_num(&left)?.powf(to_num(&right)?))),
            other => Err(MError::new(format!("unknown metalanguage operator `{}`", other))),
        }
    }

    fn call_value(&mut self, callee: &MValue, args: Vec<MValue>) -> Result<MValue, MError> {
        match callee {
            MValue::Builtin(name) => self.call_builtin(name, args),
            MValue::Func(func) => {
                if self.depth >= CALL_DEPTH_LIMIT {
                    return Err(MError::new(format!(
                        "metalanguage call depth limit ({}) exceeded",
                        CALL_DEPTH_LIMIT
                    )));
                }
                self.depth += 1;
                self.pp.trace.push("metalanguage function".to_string());
                let child = env_child(&func.env);
                for (i, param) in func.params.iter().enumerate() {
                    env_define(&child, param, args.get(i).cloned().unwrap_or(MValue::Nil));
                }
                let result = self.exec_block(&func.body, &child);
                self.pp.trace.pop();
                self.depth -= 1;
                match result? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(MValue::Nil),
                }
            }
            other => Err(MError::new(format!(
                "cannot call a {} value in metalanguage",
                other.type_name()
            ))),
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<MValue>) -> Result<MValue, MError> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(MValue::Nil);
        match name {
            "print" => {
                let line: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                println!("{}", line.join("\t"));
                Ok(MValue::Nil)
            }
            "tostring" => Ok(MValue::Str(Rc::new(arg(0).to_string()))),
            "tonumber" => match arg(0) {
                MValue::Int(i) => Ok(MValue::Int(i)),
                MValue::Num(n) => Ok(MValue::Num(n)),
                MValue::Str(s) => {
                    if let Ok(i) = s.parse::<i64>() {
                        Ok(MValue::Int(i))
                    } else if let Ok(n) = s.parse::<f64>() {
                        Ok(MValue::Num(n))
                    } else {
                        Ok(MValue::Nil)
                    }
                }
                _ => Ok(MValue::Nil),
            },
            "error" => Err(MError {
                message: arg(0).to_string(),
                trace: self.pp.trace.clone(),
            }),
            "inject_statement" => match arg(0) {
                MValue::Str(code) => {
                    self.pp.pending.push(code.to_string());
                    Ok(MValue::Nil)
                }
                other => Err(MError::new(format!(
                    "inject_statement expects a string, got {}",
                    other.type_name()
                ))),
            },
            "after_analyze" => match arg(0) {
                callable @ (MValue::Func(_) | MValue::Builtin(_)) => {
                    self.pp.after_analyze.push(callable);
                    Ok(MValue::Nil)
                }
                other => Err(MError::new(format!(
                    "after_analyze expects a function, got {}",
                    other.type_name()
                ))),
            },
            "add_keyword" => match arg(0) {
                MValue::Str(word) => {
                    self.ctx.grammar.add_keyword(&word);
                    Ok(MValue::Nil)
                }
                other => Err(MError::new(format!(
                    "add_keyword expects a string, got {}",
                    other.type_name()
                ))),
            },
            "remove_keyword" => match arg(0) {
                MValue::Str(word) => {
                    self.ctx.grammar.remove_keyword(&word);
                    Ok(MValue::Nil)
                }
                other => Err(MError::new(format!(
                    "remove_keyword expects a string, got {}",
                    other.type_name()
                ))),
            },
            "set_peg" => match (arg(0), arg(1)) {
                (MValue::Str(name), MValue::Str(rule)) => self
                    .ctx
                    .grammar
                    .set_peg(&name, &rule)
                    .map(|_| MValue::Nil)
                    .map_err(MError::new),
                _ => Err(MError::new("set_peg expects (name, rule) strings")),
            },
            "set_pragma" => match (arg(0), arg(1)) {
                (MValue::Str(pragma), value) => {
                    let on = value.truthy();
                    match pragma.as_str() {
                        "nogc" => self.ctx.pragmas.nogc = on,
                        "nochecks" => self.ctx.pragmas.nochecks = on,
                        other => {
                            return Err(MError::new(format!("unknown pragma `{}`", other)))
                        }
                    }
                    Ok(MValue::Nil)
                }
                _ => Err(MError::new("set_pragma expects a pragma name")),
            },
            "root_symbols" => {
                let table = Rc::new(RefCell::new(MTable::default()));
                for (i, &sid) in self.ctx.scopes.root_symbols().iter().enumerate() {
                    let name = self.ctx.scopes.symbol(sid).name.clone();
                    table
                        .borrow_mut()
                        .set(MKey::Int(i as i64 + 1), MValue::Str(Rc::new(name)));
                }
                Ok(MValue::Table(table))
            }
            other => Err(MError::new(format!("unknown builtin `{}`", other))),
        }
    }
}

fn to_num(value: &MValue) -> Result<f64, MError> {
    match value {
        MValue::Int(i) => Ok(*i as f64),
        MValue::Num(n) => Ok(*n),
        other => Err(MError::new(format!(
            "expected a number in metalanguage, got {}",
            other.type_name()
        ))),
    }
}

fn compare(op: &str, a: f64, b: f64) -> bool {
    match op {
        "lt" => a < b,
        "le" => a <= b,
        "gt" => a > b,
        _ => a >= b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunk(ctx: &mut Context, source: &str) {
        let node = ctx.ast.add(Node::with_data(
            Tag::Preprocess,
            NodeData::Source(source.to_string()),
            Span::default(),
        ));
        run_block(ctx, node).expect("preprocess chunk failed");
    }

    fn eval_in(ctx: &mut Context, source: &str) -> MValue {
        let node = ctx.ast.add(Node::with_data(
            Tag::PreprocessExpr,
            NodeData::Source(source.to_string()),
            Span::default(),
        ));
        eval_source(ctx, node, Span::default()).expect("eval failed")
    }

    #[test]
    fn test_locals_persist_across_chunks() {
        let mut ctx = Context::new("t.nelua", "");
        run_chunk(&mut ctx, "local n = 3");
        match eval_in(&mut ctx, "n * n") {
            MValue::Int(9) => {}
            other => panic!("expected 9, got {:?}", other),
        }
    }

    #[test]
    fn test_functions_and_control_flow() {
        let mut ctx = Context::new("t.nelua", "");
        run_chunk(
            &mut ctx,
            "local function fib(n) if n < 2 then return n end return fib(n-1) + fib(n-2) end",
        );
        match eval_in(&mut ctx, "fib(10)") {
            MValue::Int(55) => {}
            other => panic!("expected 55, got {:?}", other),
        }
    }

    #[test]
    fn test_tables_and_loops() {
        let mut ctx = Context::new("t.nelua", "");
        run_chunk(
            &mut ctx,
            "local t = {} for i=1,5 do t[i] = i*i end local sum = 0 \
             for i=1,#t do sum = sum + t[i] end total = sum",
        );
        match eval_in(&mut ctx, "total") {
            MValue::Int(55) => {}
            other => panic!("expected 55, got {:?}", other),
        }
    }

    #[test]
    fn test_string_ops() {
        let mut ctx = Context::new("t.nelua", "");
        match eval_in(&mut ctx, "'a' .. 1 .. 'b'") {
            MValue::Str(s) => assert_eq!(s.as_str(), "a1b"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_inject_statement_parses_with_grammar() {
        let mut ctx = Context::new("t.nelua", "");
        let node = ctx.ast.add(Node::with_data(
            Tag::Preprocess,
            NodeData::Source("inject_statement('local injected = 1')".to_string()),
            Span::default(),
        ));
        let stmts = run_block(&mut ctx, node).expect("inject failed");
        assert_eq!(stmts.len(), 1);
        assert_eq!(ctx.ast.tag(stmts[0]), Tag::VarDecl);
    }

    #[test]
    fn test_grammar_mutation_from_meta() {
        let mut ctx = Context::new("t.nelua", "");
        run_chunk(&mut ctx, "add_keyword('unless')");
        assert!(ctx.grammar.is_keyword("unless"));
        run_chunk(&mut ctx, "remove_keyword('unless')");
        assert!(!ctx.grammar.is_keyword("unless"));
    }

    #[test]
    fn test_after_analyze_queue_order() {
        let mut ctx = Context::new("t.nelua", "");
        run_chunk(
            &mut ctx,
            "order = '' after_analyze(function() order = order .. 'a' \
             after_analyze(function() order = order .. 'c' end) end) \
             after_analyze(function() order = order .. 'b' end)",
        );
        run_after_analyze_hooks(&mut ctx).expect("hooks failed");
        match eval_in(&mut ctx, "order") {
            MValue::Str(s) => assert_eq!(s.as_str(), "abc"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_error_carries_trace() {
        let mut ctx = Context::new("t.nelua", "");
        let node = ctx.ast.add(Node::with_data(
            Tag::Preprocess,
            NodeData::Source("local function f() error('boom') end f()".to_string()),
            Span::default(),
        ));
        let err = run_block(&mut ctx, node).expect_err("expected failure");
        match err.kind {
            crate::errors::ErrorKind::Preprocess { message, trace } => {
                assert_eq!(message, "boom");
                assert!(!trace.is_empty());
            }
            other => panic!("expected preprocess error, got {:?}", other),
        }
    }

    #[test]
    fn test_expr_splice_rewrites_node() {
        let mut ctx = Context::new("t.nelua", "");
        run_chunk(&mut ctx, "local n = 3");
        let node = ctx.ast.add(Node::with_data(
            Tag::PreprocessExpr,
            NodeData::Source("n * n".to_string()),
            Span::default(),
        ));
        eval_expr_node(&mut ctx, node).expect("splice failed");
        let n = ctx.ast.node(node);
        assert_eq!(n.tag, Tag::Number);
        assert_eq!(n.attr.value, Some(CompVal::Int(9)));
        assert!(n.attr.comptime);
    }

    #[test]
    fn test_call_depth_limit() {
        let mut ctx = Context::new("t.nelua", "");
        let node = ctx.ast.add(Node::with_data(
            Tag::Preprocess,
            NodeData::Source("local function loop() return loop() end loop()".to_string()),
            Span::default(),
        ));
        assert!(run_block(&mut ctx, node).is_err());
    }
}
