//! Parser
//!
//! Recursive descent over the token stream, producing arena AST nodes.
//! The parser consults the active [`Grammar`] for two things: the keyword
//! set (so `add_keyword`/`remove_keyword` take effect on the next parse)
//! and the extension rules installed through `set_peg`, which are PEG
//! expressions interpreted at the statement position and build nodes of the
//! existing tags.
//!
//! Failure labels (`UnexpectedSyntaxAtEOF`, `ExpectedEnd`, ...) are carried
//! on the `ParseError` kind and converted to source-located diagnostics.

use crate::ast::{Ast, Node, NodeData, NodeId, Tag};
use crate::context::Context;
use crate::errors::{CompileError, CompileResult};
use crate::grammar::{Grammar, PegExpr};
use crate::lexer::{self, split_number};
use crate::span::Span;
use crate::token::{Token, TokenKind};

/// Parse a full compilation unit held by the context. Returns the
/// top-level `Block` node.
pub fn parse(ctx: &mut Context) -> CompileResult<NodeId> {
    let source = std::mem::take(&mut ctx.source);
    let result = parse_source(ctx, &source);
    ctx.source = source;
    result
}

/// Parse a source snippet with the context's *current* grammar; used both
/// for the main unit and for preprocessor-produced fragments.
pub fn parse_source(ctx: &mut Context, source: &str) -> CompileResult<NodeId> {
    let (tokens, lex_errors) = lexer::lex(source);
    if let Some((err, span)) = lex_errors.first() {
        return Err(CompileError::lex(err.to_string(), *span));
    }
    let mut parser = Parser {
        ast: &mut ctx.ast,
        grammar: &ctx.grammar,
        source,
        tokens,
        pos: 0,
    };
    parser.parse_chunk()
}

struct Parser<'a> {
    ast: &'a mut Ast,
    grammar: &'a Grammar,
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    // ============ Token helpers ============

    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.cur().kind
    }

    fn span(&self) -> Span {
        self.cur().span
    }

    fn text(&self) -> &'a str {
        self.cur().span.text(self.source)
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

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn accept(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind, label: &str) -> CompileResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.err(label, format!("expected `{}`, found `{}`", kind, self.kind())))
        }
    }

    /// Whether the current token is the given keyword
    fn is_kw(&self, word: &str) -> bool {
        self.kind() == TokenKind::Name && self.grammar.is_keyword(word) && self.text() == word
    }

    fn accept_kw(&mut self, word: &str) -> bool {
        if self.is_kw(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, word: &str, label: &str) -> CompileResult<()> {
        if self.accept_kw(word) {
            Ok(())
        } else {
            Err(self.err(label, format!("expected `{}`, found `{}`", word, self.describe_cur())))
        }
    }

    /// Whether the current token is an identifier (a name that is not an
    /// active keyword)
    fn is_name(&self) -> bool {
        self.kind() == TokenKind::Name && !self.grammar.is_keyword(self.text())
    }

    fn describe_cur(&self) -> String {
        if self.kind() == TokenKind::Name {
            self.text().to_string()
        } else {
            self.kind().to_string()
        }
    }

    fn err(&self, label: &str, message: impl Into<String>) -> CompileError {
        let label = if self.at_eof() { "UnexpectedSyntaxAtEOF" } else { label };
        CompileError::parse(label, message, self.span())
    }

    fn add(&mut self, node: Node) -> NodeId {
        self.ast.add(node)
    }

    fn end_span(&self, start: Span) -> Span {
        let prev = if self.pos > 0 { self.tokens[self.pos - 1].span } else { start };
        start.merge(prev)
    }

    // ============ Chunk & blocks ============

    fn parse_chunk(&mut self) -> CompileResult<NodeId> {
        let block = self.parse_block()?;
        if !self.at_eof() {
            return Err(self.err(
                "UnexpectedSyntax",
                format!("unexpected `{}` after statement", self.describe_cur()),
            ));
        }
        Ok(block)
    }

    fn at_block_end(&self) -> bool {
        if self.at_eof() {
            return true;
        }
        if self.kind() != TokenKind::Name {
            return false;
        }
        let text = self.text();
        self.grammar.is_keyword(text)
            && matches!(text, "end" | "else" | "elseif" | "until" | "case")
    }

    fn parse_block(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        let mut stmts = Vec::new();
        while !self.at_block_end() {
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::Block, stmts, span)))
    }

    // ============ Statements ============

    fn parse_statement(&mut self) -> CompileResult<Option<NodeId>> {
        // Preprocessor-installed rules get first chance
        if let Some(node) = self.try_extension_statement() {
            return Ok(Some(node));
        }

        let start = self.span();
        match self.kind() {
            TokenKind::Semicolon => {
                self.advance();
                Ok(None)
            }
            TokenKind::DoubleColon => {
                self.advance();
                let (name, _) = self.parse_name()?;
                self.expect(TokenKind::DoubleColon, "ExpectedLabel")?;
                let span = self.end_span(start);
                Ok(Some(self.add(Node::with_data(Tag::Label, NodeData::Name(name), span))))
            }
            TokenKind::PreprocessBlock | TokenKind::PreprocessLine => {
                let token = self.advance();
                let text = token.span.text(self.source);
                let content = lexer::preprocess_content(token.kind, text).to_string();
                Ok(Some(self.add(Node::with_data(
                    Tag::Preprocess,
                    NodeData::Source(content),
                    token.span,
                ))))
            }
            TokenKind::At => self.parse_pragma().map(Some),
            TokenKind::Name if self.grammar.is_keyword(self.text()) => {
                self.parse_keyword_statement().map(Some)
            }
            _ => self.parse_expr_statement().map(Some),
        }
    }

    fn parse_keyword_statement(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        let word = self.text();
        match word {
            "local" | "global" => {
                let storage = word.to_string();
                self.advance();
                if self.is_kw("function") {
                    self.parse_func_def(start, storage)
                } else {
                    self.parse_var_decl(start, storage)
                }
            }
            "function" => self.parse_func_def(start, String::new()),
            "if" => self.parse_if(start),
            "do" => {
                self.advance();
                let block = self.parse_block()?;
                self.expect_kw("end", "ExpectedEnd")?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::Do, vec![block], span)))
            }
            "defer" => {
                self.advance();
                let block = self.parse_block()?;
                self.expect_kw("end", "ExpectedEnd")?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::Defer, vec![block], span)))
            }
            "while" => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect_kw("do", "ExpectedDo")?;
                let block = self.parse_block()?;
                self.expect_kw("end", "ExpectedEnd")?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::While, vec![cond, block], span)))
            }
            "repeat" => {
                self.advance();
                let block = self.parse_block()?;
                self.expect_kw("until", "ExpectedUntil")?;
                let cond = self.parse_expr()?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::Repeat, vec![block, cond], span)))
            }
            "for" => self.parse_for(start),
            "switch" => self.parse_switch(start),
            "return" => {
                self.advance();
                let mut exprs = Vec::new();
                if !self.at_block_end() && !self.check(TokenKind::Semicolon) {
                    exprs = self.parse_expr_list()?;
                }
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::Return, exprs, span)))
            }
            "break" => {
                self.advance();
                Ok(self.add(Node::new(Tag::Break, start)))
            }
            "continue" => {
                self.advance();
                Ok(self.add(Node::new(Tag::Continue, start)))
            }
            "goto" => {
                self.advance();
                let (name, _) = self.parse_name()?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_data(Tag::Goto, NodeData::Name(name), span)))
            }
            _ => Err(self.err(
                "UnexpectedSyntax",
                format!("unexpected keyword `{}`", word),
            )),
        }
    }

    fn parse_pragma(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        self.expect(TokenKind::At, "ExpectedPragma")?;
        let (name, _) = self.parse_name()?;
        let mut args = Vec::new();
        if self.accept(TokenKind::LParen).is_some() {
            if !self.check(TokenKind::RParen) {
                args = self.parse_expr_list()?;
            }
            self.expect(TokenKind::RParen, "ExpectedParenClose")?;
        }
        let span = self.end_span(start);
        Ok(self.add(Node {
            tag: Tag::PragmaCall,
            data: NodeData::Name(name),
            children: args,
            attr: Default::default(),
            span,
        }))
    }

    fn parse_var_decl(&mut self, start: Span, storage: String) -> CompileResult<NodeId> {
        let mut children = vec![self.parse_id_decl()?];
        while self.accept(TokenKind::Comma).is_some() {
            children.push(self.parse_id_decl()?);
        }
        if self.accept(TokenKind::Eq).is_some() {
            children.extend(self.parse_expr_list()?);
        }
        let span = self.end_span(start);
        Ok(self.add(Node {
            tag: Tag::VarDecl,
            data: NodeData::Name(storage),
            children,
            attr: Default::default(),
            span,
        }))
    }

    fn parse_id_decl(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        let (data, mut children) = if self.check(TokenKind::PreprocessName) {
            let token = self.advance();
            let text = token.span.text(self.source);
            let content = lexer::preprocess_content(token.kind, text).to_string();
            let splice = self.add(Node::with_data(
                Tag::PreprocessName,
                NodeData::Source(content),
                token.span,
            ));
            (NodeData::None, vec![splice])
        } else {
            let (name, _) = self.parse_name()?;
            (NodeData::Name(name), Vec::new())
        };
        if self.accept(TokenKind::Colon).is_some() {
            children.push(self.parse_type_expr()?);
        }
        children.extend(self.parse_annotations()?);
        let span = self.end_span(start);
        Ok(self.add(Node { tag: Tag::IdDecl, data, children, attr: Default::default(), span }))
    }

    /// `<name, name(args), ...>` after a declaration
    fn parse_annotations(&mut self) -> CompileResult<Vec<NodeId>> {
        let mut annotations = Vec::new();
        if !self.check(TokenKind::Lt) {
            return Ok(annotations);
        }
        self.advance();
        loop {
            let start = self.span();
            let (name, _) = self.parse_name()?;
            let mut args = Vec::new();
            if self.accept(TokenKind::LParen).is_some() {
                if !self.check(TokenKind::RParen) {
                    args = self.parse_expr_list()?;
                }
                self.expect(TokenKind::RParen, "ExpectedParenClose")?;
            }
            let span = self.end_span(start);
            annotations.push(self.add(Node {
                tag: Tag::Annotation,
                data: NodeData::Name(name),
                children: args,
                attr: Default::default(),
                span,
            }));
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::Gt, "ExpectedAnnotationClose")?;
        Ok(annotations)
    }

    fn parse_func_def(&mut self, start: Span, storage: String) -> CompileResult<NodeId> {
        self.expect_kw("function", "ExpectedFunction")?;

        // Name target: `f`, `a.b.c` or `a:m`
        let (name, name_span) = self.parse_name()?;
        let mut target = self.add(Node::with_data(Tag::Id, NodeData::Name(name), name_span));
        let mut is_method = false;
        loop {
            if self.accept(TokenKind::Dot).is_some() {
                let (field, fspan) = self.parse_name()?;
                target = self.add(Node {
                    tag: Tag::DotIndex,
                    data: NodeData::Name(field),
                    children: vec![target],
                    attr: Default::default(),
                    span: name_span.merge(fspan),
                });
            } else if self.accept(TokenKind::Colon).is_some() {
                let (method, mspan) = self.parse_name()?;
                target = self.add(Node {
                    tag: Tag::ColonIndex,
                    data: NodeData::Name(method),
                    children: vec![target],
                    attr: Default::default(),
                    span: name_span.merge(mspan),
                });
                is_method = true;
            } else {
                break;
            }
            if is_method {
                break;
            }
        }

        let (params, rets) = self.parse_func_signature()?;
        let annotations = self.parse_annotations()?;
        let block = self.parse_block()?;
        self.expect_kw("end", "ExpectedEnd")?;

        let mut children = vec![target];
        let nparams = params.len() as u32;
        let nrets = rets.len() as u32;
        children.extend(params);
        children.extend(rets);
        children.extend(annotations);
        children.push(block);
        let span = self.end_span(start);
        Ok(self.add(Node {
            tag: Tag::FuncDef,
            data: NodeData::NameArity { name: storage, a: nparams, b: nrets },
            children,
            attr: Default::default(),
            span,
        }))
    }

    /// `( params ) [: rettypes]`
    fn parse_func_signature(&mut self) -> CompileResult<(Vec<NodeId>, Vec<NodeId>)> {
        self.expect(TokenKind::LParen, "ExpectedParenOpen")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                if self.check(TokenKind::Ellipsis) {
                    let token = self.advance();
                    params.push(self.add(Node::new(Tag::Varargs, token.span)));
                } else {
                    params.push(self.parse_id_decl()?);
                }
                if self.accept(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "ExpectedParenClose")?;

        let mut rets = Vec::new();
        if self.accept(TokenKind::Colon).is_some() {
            if self.accept(TokenKind::LParen).is_some() {
                loop {
                    rets.push(self.parse_type_expr()?);
                    if self.accept(TokenKind::Comma).is_none() {
                        break;
                    }
                }
                self.expect(TokenKind::RParen, "ExpectedParenClose")?;
            } else {
                rets.push(self.parse_type_expr()?);
            }
        }
        Ok((params, rets))
    }

    fn parse_if(&mut self, start: Span) -> CompileResult<NodeId> {
        self.expect_kw("if", "ExpectedIf")?;
        let mut children = Vec::new();
        children.push(self.parse_expr()?);
        self.expect_kw("then", "ExpectedThen")?;
        children.push(self.parse_block()?);
        loop {
            if self.accept_kw("elseif") {
                children.push(self.parse_expr()?);
                self.expect_kw("then", "ExpectedThen")?;
                children.push(self.parse_block()?);
            } else if self.accept_kw("else") {
                children.push(self.parse_block()?);
                break;
            } else {
                break;
            }
        }
        self.expect_kw("end", "ExpectedEnd")?;
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::If, children, span)))
    }

    fn parse_switch(&mut self, start: Span) -> CompileResult<NodeId> {
        self.expect_kw("switch", "ExpectedSwitch")?;
        let mut children = vec![self.parse_expr()?];
        self.expect_kw("do", "ExpectedDo")?;
        while self.is_kw("case") {
            self.advance();
            let values = self.parse_expr_list()?;
            self.expect_kw("then", "ExpectedThen")?;
            let block = self.parse_block()?;
            // several case values can share one block
            for value in values {
                children.push(value);
                children.push(block);
            }
        }
        if self.accept_kw("else") {
            children.push(self.parse_block()?);
        }
        self.expect_kw("end", "ExpectedEnd")?;
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::Switch, children, span)))
    }

    fn parse_for(&mut self, start: Span) -> CompileResult<NodeId> {
        self.expect_kw("for", "ExpectedFor")?;
        let first = self.parse_id_decl()?;
        if self.accept(TokenKind::Eq).is_some() {
            // numeric for
            let mut children = vec![first, self.parse_expr()?];
            self.expect(TokenKind::Comma, "ExpectedComma")?;
            children.push(self.parse_expr()?);
            if self.accept(TokenKind::Comma).is_some() {
                children.push(self.parse_expr()?);
            }
            self.expect_kw("do", "ExpectedDo")?;
            children.push(self.parse_block()?);
            self.expect_kw("end", "ExpectedEnd")?;
            let span = self.end_span(start);
            return Ok(self.add(Node::with_children(Tag::ForNum, children, span)));
        }
        // for-in
        let mut vars = vec![first];
        while self.accept(TokenKind::Comma).is_some() {
            vars.push(self.parse_id_decl()?);
        }
        self.expect_kw("in", "ExpectedIn")?;
        let exprs = self.parse_expr_list()?;
        self.expect_kw("do", "ExpectedDo")?;
        let block = self.parse_block()?;
        self.expect_kw("end", "ExpectedEnd")?;
        let nvars = vars.len() as u32;
        let nexprs = exprs.len() as u32;
        let mut children = vars;
        children.extend(exprs);
        children.push(block);
        let span = self.end_span(start);
        Ok(self.add(Node {
            tag: Tag::ForIn,
            data: NodeData::Arity { a: nvars, b: nexprs },
            children,
            attr: Default::default(),
            span,
        }))
    }

    /// Expression statement: a call, or the start of a (multi-)assignment
    fn parse_expr_statement(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        let first = self.parse_suffixed_expr()?;
        if self.check(TokenKind::Comma) || self.check(TokenKind::Eq) {
            let mut targets = vec![first];
            while self.accept(TokenKind::Comma).is_some() {
                targets.push(self.parse_suffixed_expr()?);
            }
            self.expect(TokenKind::Eq, "ExpectedAssign")?;
            let values = self.parse_expr_list()?;
            let ntargets = targets.len() as u32;
            let nvalues = values.len() as u32;
            let mut children = targets;
            children.extend(values);
            let span = self.end_span(start);
            return Ok(self.add(Node {
                tag: Tag::Assign,
                data: NodeData::Arity { a: ntargets, b: nvalues },
                children,
                attr: Default::default(),
                span,
            }));
        }
        match self.ast.tag(first) {
            Tag::Call | Tag::CallMethod | Tag::PreprocessExpr => Ok(first),
            tag => Err(self.err(
                "UnexpectedSyntax",
                format!("unexpected {} expression used as a statement", tag),
            )),
        }
    }

    // ============ Expressions ============

    fn parse_expr_list(&mut self) -> CompileResult<Vec<NodeId>> {
        let mut exprs = vec![self.parse_expr()?];
        while self.accept(TokenKind::Comma).is_some() {
            exprs.push(self.parse_expr()?);
        }
        Ok(exprs)
    }

    fn parse_expr(&mut self) -> CompileResult<NodeId> {
        self.parse_binary(0)
    }

    /// Binary operator of the current token: (name, precedence, right-assoc)
    fn binary_op(&self) -> Option<(&'static str, u8, bool)> {
        Some(match self.kind() {
            TokenKind::Name if self.is_kw("or") => ("or", 1, false),
            TokenKind::Name if self.is_kw("and") => ("and", 2, false),
            TokenKind::Lt => ("lt", 3, false),
            TokenKind::Gt => ("gt", 3, false),
            TokenKind::LtEq => ("le", 3, false),
            TokenKind::GtEq => ("ge", 3, false),
            TokenKind::NotEq => ("ne", 3, false),
            TokenKind::EqEq => ("eq", 3, false),
            TokenKind::Pipe => ("bor", 4, false),
            TokenKind::Tilde => ("bxor", 5, false),
            TokenKind::Amp => ("band", 6, false),
            TokenKind::Shl => ("shl", 7, false),
            TokenKind::Shr => ("shr", 7, false),
            TokenKind::Concat => ("concat", 9, true),
            TokenKind::Plus => ("add", 10, false),
            TokenKind::Minus => ("sub", 10, false),
            TokenKind::Star => ("mul", 11, false),
            TokenKind::Slash => ("div", 11, false),
            TokenKind::DoubleSlash => ("idiv", 11, false),
            TokenKind::Percent => ("mod", 11, false),
            TokenKind::Caret => ("pow", 14, true),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> CompileResult<NodeId> {
        let start = self.span();
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec, right_assoc)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min)?;
            let span = self.end_span(start);
            lhs = self.add(Node {
                tag: Tag::BinaryOp,
                data: NodeData::Op(op),
                children: vec![lhs, rhs],
                attr: Default::default(),
                span,
            });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        let op = match self.kind() {
            TokenKind::Name if self.is_kw("not") => Some("not"),
            TokenKind::Minus => Some("neg"),
            TokenKind::Hash => Some("len"),
            TokenKind::Tilde => Some("bnot"),
            TokenKind::Amp => Some("ref"),
            TokenKind::Dollar => Some("deref"),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_binary(12)?;
            let span = self.end_span(start);
            return Ok(self.add(Node {
                tag: Tag::UnaryOp,
                data: NodeData::Op(op),
                children: vec![operand],
                attr: Default::default(),
                span,
            }));
        }
        self.parse_suffixed_expr()
    }

    fn parse_suffixed_expr(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        let mut expr = self.parse_primary_expr()?;
        loop {
            match self.kind() {
                TokenKind::Dot => {
                    self.advance();
                    let (field, _) = self.parse_name()?;
                    let span = self.end_span(start);
                    expr = self.add(Node {
                        tag: Tag::DotIndex,
                        data: NodeData::Name(field),
                        children: vec![expr],
                        attr: Default::default(),
                        span,
                    });
                }
                TokenKind::Colon => {
                    self.advance();
                    let (method, _) = self.parse_name()?;
                    let args = self.parse_call_args()?;
                    let mut children = vec![expr];
                    children.extend(args);
                    let span = self.end_span(start);
                    expr = self.add(Node {
                        tag: Tag::CallMethod,
                        data: NodeData::Name(method),
                        children,
                        attr: Default::default(),
                        span,
                    });
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "ExpectedBracketClose")?;
                    let span = self.end_span(start);
                    expr = self.add(Node {
                        tag: Tag::ArrayIndex,
                        children: vec![expr, index],
                        data: NodeData::None,
                        attr: Default::default(),
                        span,
                    });
                }
                TokenKind::LParen | TokenKind::String | TokenKind::LongString
                | TokenKind::LBrace => {
                    let args = self.parse_call_args()?;
                    let mut children = vec![expr];
                    children.extend(args);
                    let span = self.end_span(start);
                    expr = self.add(Node {
                        tag: Tag::Call,
                        data: NodeData::None,
                        children,
                        attr: Default::default(),
                        span,
                    });
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Call arguments: `( exprs )`, a single string, or a single table
    fn parse_call_args(&mut self) -> CompileResult<Vec<NodeId>> {
        match self.kind() {
            TokenKind::LParen => {
                self.advance();
                let args = if self.check(TokenKind::RParen) {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                Ok(args)
            }
            TokenKind::String | TokenKind::LongString => {
                let node = self.parse_primary_expr()?;
                Ok(vec![node])
            }
            TokenKind::LBrace => {
                let node = self.parse_table()?;
                Ok(vec![node])
            }
            _ => Err(self.err("ExpectedCallArguments", "expected call arguments")),
        }
    }

    fn parse_primary_expr(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        match self.kind() {
            TokenKind::Number => {
                let token = self.advance();
                let parts = split_number(token.span.text(self.source));
                Ok(self.add(Node::with_data(Tag::Number, NodeData::Number(parts), token.span)))
            }
            TokenKind::String => {
                let token = self.advance();
                let (value, suffix) = lexer::decode_string(token.span.text(self.source))
                    .map_err(|e| CompileError::lex(e.to_string(), token.span))?;
                Ok(self.add(Node::with_data(Tag::String, NodeData::Str { value, suffix }, token.span)))
            }
            TokenKind::LongString => {
                let token = self.advance();
                let content = lexer::long_string_content(token.span.text(self.source));
                Ok(self.add(Node::with_data(
                    Tag::String,
                    NodeData::Str { value: content.as_bytes().to_vec(), suffix: None },
                    token.span,
                )))
            }
            TokenKind::Ellipsis => {
                let token = self.advance();
                Ok(self.add(Node::new(Tag::Varargs, token.span)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::Paren, vec![inner], span)))
            }
            TokenKind::LBrace => self.parse_table(),
            TokenKind::At => {
                self.advance();
                let ty = self.parse_type_expr()?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::TypeInstance, vec![ty], span)))
            }
            TokenKind::PreprocessExpr => {
                let token = self.advance();
                let text = token.span.text(self.source);
                let content = lexer::preprocess_content(token.kind, text).to_string();
                Ok(self.add(Node::with_data(
                    Tag::PreprocessExpr,
                    NodeData::Source(content),
                    token.span,
                )))
            }
            TokenKind::PreprocessName => {
                let token = self.advance();
                let text = token.span.text(self.source);
                let content = lexer::preprocess_content(token.kind, text).to_string();
                Ok(self.add(Node::with_data(
                    Tag::PreprocessName,
                    NodeData::Source(content),
                    token.span,
                )))
            }
            TokenKind::Name => {
                let word = self.text();
                if self.grammar.is_keyword(word) {
                    match word {
                        "nil" => {
                            self.advance();
                            Ok(self.add(Node::new(Tag::Nil, start)))
                        }
                        "nilptr" => {
                            self.advance();
                            Ok(self.add(Node::with_data(
                                Tag::Nil,
                                NodeData::Name("nilptr".into()),
                                start,
                            )))
                        }
                        "true" | "false" => {
                            let value = word == "true";
                            self.advance();
                            Ok(self.add(Node::with_data(Tag::Boolean, NodeData::Bool(value), start)))
                        }
                        "function" => {
                            self.advance();
                            let (params, rets) = self.parse_func_signature()?;
                            let block = self.parse_block()?;
                            self.expect_kw("end", "ExpectedEnd")?;
                            let nparams = params.len() as u32;
                            let nrets = rets.len() as u32;
                            let mut children = params;
                            children.extend(rets);
                            children.push(block);
                            let span = self.end_span(start);
                            Ok(self.add(Node {
                                tag: Tag::Function,
                                data: NodeData::Arity { a: nparams, b: nrets },
                                children,
                                attr: Default::default(),
                                span,
                            }))
                        }
                        _ => Err(self.err(
                            "UnexpectedSyntax",
                            format!("unexpected keyword `{}` in expression", word),
                        )),
                    }
                } else {
                    let (name, span) = self.parse_name()?;
                    Ok(self.add(Node::with_data(Tag::Id, NodeData::Name(name), span)))
                }
            }
            _ => Err(self.err(
                "UnexpectedSyntax",
                format!("unexpected `{}` in expression", self.describe_cur()),
            )),
        }
    }

    fn parse_table(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        self.expect(TokenKind::LBrace, "ExpectedBraceOpen")?;
        let mut items = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let item_start = self.span();
            if self.check(TokenKind::LBracket) {
                self.advance();
                let key = self.parse_expr()?;
                self.expect(TokenKind::RBracket, "ExpectedBracketClose")?;
                self.expect(TokenKind::Eq, "ExpectedAssign")?;
                let value = self.parse_expr()?;
                let span = self.end_span(item_start);
                items.push(self.add(Node::with_children(Tag::Pair, vec![key, value], span)));
            } else if self.is_name() && self.peek_kind(1) == Some(TokenKind::Eq) {
                let (name, _) = self.parse_name()?;
                self.advance(); // `=`
                let value = self.parse_expr()?;
                let span = self.end_span(item_start);
                items.push(self.add(Node {
                    tag: Tag::Pair,
                    data: NodeData::Name(name),
                    children: vec![value],
                    attr: Default::default(),
                    span,
                }));
            } else {
                items.push(self.parse_expr()?);
            }
            if self.accept(TokenKind::Comma).is_none() && self.accept(TokenKind::Semicolon).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "ExpectedBraceClose")?;
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::Table, items, span)))
    }

    fn peek_kind(&self, n: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + n).map(|t| t.kind)
    }

    fn parse_name(&mut self) -> CompileResult<(String, Span)> {
        if self.is_name() {
            let token = self.advance();
            Ok((token.span.text(self.source).to_string(), token.span))
        } else {
            Err(self.err(
                "ExpectedName",
                format!("expected a name, found `{}`", self.describe_cur()),
            ))
        }
    }

    // ============ Type expressions ============

    fn parse_type_expr(&mut self) -> CompileResult<NodeId> {
        let start = self.span();
        match self.kind() {
            TokenKind::Star => {
                self.advance();
                let sub = self.parse_type_expr()?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::PointerType, vec![sub], span)))
            }
            TokenKind::Question => {
                self.advance();
                let sub = self.parse_type_expr()?;
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::OptionalType, vec![sub], span)))
            }
            TokenKind::LBracket => {
                self.advance();
                let len = if self.check(TokenKind::RBracket) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::RBracket, "ExpectedBracketClose")?;
                let sub = self.parse_type_expr()?;
                let mut children = vec![sub];
                children.extend(len);
                let span = self.end_span(start);
                Ok(self.add(Node::with_children(Tag::ArrayType, children, span)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_type_expr()?;
                self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                Ok(inner)
            }
            TokenKind::PreprocessExpr => self.parse_primary_expr(),
            TokenKind::Name => {
                if self.is_kw("function") {
                    self.advance();
                    self.expect(TokenKind::LParen, "ExpectedParenOpen")?;
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_type_expr()?);
                            if self.accept(TokenKind::Comma).is_none() {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                    let mut rets = Vec::new();
                    if self.accept(TokenKind::Colon).is_some() {
                        if self.accept(TokenKind::LParen).is_some() {
                            loop {
                                rets.push(self.parse_type_expr()?);
                                if self.accept(TokenKind::Comma).is_none() {
                                    break;
                                }
                            }
                            self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                        } else {
                            rets.push(self.parse_type_expr()?);
                        }
                    }
                    let nargs = args.len() as u32;
                    let nrets = rets.len() as u32;
                    let mut children = args;
                    children.extend(rets);
                    let span = self.end_span(start);
                    return Ok(self.add(Node {
                        tag: Tag::FuncType,
                        data: NodeData::Arity { a: nargs, b: nrets },
                        children,
                        attr: Default::default(),
                        span,
                    }));
                }
                let (name, name_span) = self.parse_name()?;
                match name.as_str() {
                    "generic" if self.check(TokenKind::LParen) => {
                        // declaration form: `@generic(T, N) <body type>`
                        self.advance();
                        let mut children = Vec::new();
                        if !self.check(TokenKind::RParen) {
                            loop {
                                let (pname, pspan) = self.parse_name()?;
                                children.push(self.add(Node::with_data(
                                    Tag::Id,
                                    NodeData::Name(pname),
                                    pspan,
                                )));
                                if self.accept(TokenKind::Comma).is_none() {
                                    break;
                                }
                            }
                        }
                        self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                        children.push(self.parse_type_expr()?);
                        let span = self.end_span(start);
                        Ok(self.add(Node {
                            tag: Tag::GenericType,
                            data: NodeData::Name(name),
                            children,
                            attr: Default::default(),
                            span,
                        }))
                    }
                    "record" if self.check(TokenKind::LBrace) => self.parse_record_type(start),
                    "union" if self.check(TokenKind::LBrace) => self.parse_union_type(start),
                    "enum" if self.check(TokenKind::LBrace) || self.check(TokenKind::LParen) => {
                        self.parse_enum_type(start)
                    }
                    "array" if self.check(TokenKind::LParen) => {
                        self.advance();
                        let elem = self.parse_type_expr()?;
                        self.expect(TokenKind::Comma, "ExpectedComma")?;
                        let len = self.parse_expr()?;
                        self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                        let span = self.end_span(start);
                        Ok(self.add(Node::with_children(Tag::ArrayType, vec![elem, len], span)))
                    }
                    "pointer" if self.check(TokenKind::LParen) => {
                        self.advance();
                        let sub = self.parse_type_expr()?;
                        self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                        let span = self.end_span(start);
                        Ok(self.add(Node::with_children(Tag::PointerType, vec![sub], span)))
                    }
                    _ if self.check(TokenKind::LParen) => {
                        // generic type invocation: `span(integer)`, `vec(T, 4)`
                        self.advance();
                        let mut args = Vec::new();
                        if !self.check(TokenKind::RParen) {
                            loop {
                                args.push(self.parse_generic_arg()?);
                                if self.accept(TokenKind::Comma).is_none() {
                                    break;
                                }
                            }
                        }
                        self.expect(TokenKind::RParen, "ExpectedParenClose")?;
                        let span = self.end_span(start);
                        Ok(self.add(Node {
                            tag: Tag::GenericType,
                            data: NodeData::Name(name),
                            children: args,
                            attr: Default::default(),
                            span,
                        }))
                    }
                    _ => Ok(self.add(Node::with_data(Tag::Type, NodeData::Name(name), name_span))),
                }
            }
            _ => Err(self.err(
                "ExpectedType",
                format!("expected a type expression, found `{}`", self.describe_cur()),
            )),
        }
    }

    /// Argument of a generic invocation: a type expression when it looks
    /// like one, otherwise a value expression (e.g. an array length)
    fn parse_generic_arg(&mut self) -> CompileResult<NodeId> {
        match self.kind() {
            TokenKind::Star | TokenKind::Question | TokenKind::LBracket => self.parse_type_expr(),
            TokenKind::Name if self.is_name() => {
                // Could be a type name or a constant; the analyzer decides.
                self.parse_type_expr()
            }
            _ => self.parse_expr(),
        }
    }

    fn parse_record_type(&mut self, start: Span) -> CompileResult<NodeId> {
        self.expect(TokenKind::LBrace, "ExpectedBraceOpen")?;
        let mut fields = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let field_start = self.span();
            let (name, _) = self.parse_name()?;
            self.expect(TokenKind::Colon, "ExpectedColon")?;
            let ty = self.parse_type_expr()?;
            let span = self.end_span(field_start);
            fields.push(self.add(Node {
                tag: Tag::RecordFieldType,
                data: NodeData::Name(name),
                children: vec![ty],
                attr: Default::default(),
                span,
            }));
            if self.accept(TokenKind::Comma).is_none() && self.accept(TokenKind::Semicolon).is_none()
            {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "ExpectedBraceClose")?;
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::RecordType, fields, span)))
    }

    fn parse_union_type(&mut self, start: Span) -> CompileResult<NodeId> {
        self.expect(TokenKind::LBrace, "ExpectedBraceOpen")?;
        let mut variants = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let field_start = self.span();
            let (name, _) = self.parse_name()?;
            self.expect(TokenKind::Colon, "ExpectedColon")?;
            let ty = self.parse_type_expr()?;
            let span = self.end_span(field_start);
            variants.push(self.add(Node {
                tag: Tag::UnionFieldType,
                data: NodeData::Name(name),
                children: vec![ty],
                attr: Default::default(),
                span,
            }));
            if self.accept(TokenKind::Comma).is_none() && self.accept(TokenKind::Semicolon).is_none()
            {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "ExpectedBraceClose")?;
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::UnionType, variants, span)))
    }

    fn parse_enum_type(&mut self, start: Span) -> CompileResult<NodeId> {
        let mut children = Vec::new();
        if self.accept(TokenKind::LParen).is_some() {
            children.push(self.parse_type_expr()?);
            self.expect(TokenKind::RParen, "ExpectedParenClose")?;
        }
        self.expect(TokenKind::LBrace, "ExpectedBraceOpen")?;
        while !self.check(TokenKind::RBrace) {
            let field_start = self.span();
            let (name, _) = self.parse_name()?;
            let mut field_children = Vec::new();
            if self.accept(TokenKind::Eq).is_some() {
                field_children.push(self.parse_expr()?);
            }
            let span = self.end_span(field_start);
            children.push(self.add(Node {
                tag: Tag::EnumFieldType,
                data: NodeData::Name(name),
                children: field_children,
                attr: Default::default(),
                span,
            }));
            if self.accept(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "ExpectedBraceClose")?;
        let span = self.end_span(start);
        Ok(self.add(Node::with_children(Tag::EnumType, children, span)))
    }

    // ============ PEG extension rules ============

    /// Try each preprocessor-installed rule at the statement position,
    /// in installation order, backtracking on failure.
    fn try_extension_statement(&mut self) -> Option<NodeId> {
        let grammar = self.grammar;
        for rule in grammar.rules() {
            let snapshot = self.pos;
            let mut captures = Vec::new();
            if self.eval_peg(&rule.expr, &mut captures) {
                let start = self.tokens[snapshot].span;
                let span = self.end_span(start);
                return Some(self.add(Node::with_children(rule.tag, captures, span)));
            }
            self.pos = snapshot;
        }
        None
    }

    /// Interpret a PEG expression; captured nodes are appended to `out`.
    fn eval_peg(&mut self, expr: &PegExpr, out: &mut Vec<NodeId>) -> bool {
        match expr {
            PegExpr::Lit(lit) => {
                let is_word = lit.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
                if is_word {
                    if self.kind() == TokenKind::Name && self.text() == lit {
                        self.advance();
                        return true;
                    }
                } else if self.kind() != TokenKind::Name && self.kind().to_string() == *lit {
                    self.advance();
                    return true;
                }
                false
            }
            PegExpr::Tok(kind) => {
                if self.kind() != *kind {
                    return false;
                }
                let capture = match kind {
                    TokenKind::Number => {
                        let token = self.advance();
                        let parts = split_number(token.span.text(self.source));
                        Some(self.add(Node::with_data(
                            Tag::Number,
                            NodeData::Number(parts),
                            token.span,
                        )))
                    }
                    TokenKind::String | TokenKind::LongString => {
                        self.parse_primary_expr().ok()
                    }
                    TokenKind::Name => {
                        let token = self.advance();
                        let name = token.span.text(self.source).to_string();
                        Some(self.add(Node::with_data(Tag::Id, NodeData::Name(name), token.span)))
                    }
                    _ => {
                        self.advance();
                        None
                    }
                };
                out.extend(capture);
                true
            }
            PegExpr::Rule(name) => self.eval_builtin_rule(name, out),
            PegExpr::Seq(items) => {
                let snapshot = self.pos;
                let mark = out.len();
                for item in items {
                    if !self.eval_peg(item, out) {
                        self.pos = snapshot;
                        out.truncate(mark);
                        return false;
                    }
                }
                true
            }
            PegExpr::Choice(alts) => {
                for alt in alts {
                    let snapshot = self.pos;
                    let mark = out.len();
                    if self.eval_peg(alt, out) {
                        return true;
                    }
                    self.pos = snapshot;
                    out.truncate(mark);
                }
                false
            }
            PegExpr::Star(inner) => {
                loop {
                    let snapshot = self.pos;
                    let mark = out.len();
                    if !self.eval_peg(inner, out) || self.pos == snapshot {
                        self.pos = snapshot;
                        out.truncate(mark);
                        break;
                    }
                }
                true
            }
            PegExpr::Plus(inner) => {
                if !self.eval_peg(inner, out) {
                    return false;
                }
                self.eval_peg(&PegExpr::Star(inner.clone()), out)
            }
            PegExpr::Opt(inner) => {
                let snapshot = self.pos;
                let mark = out.len();
                if !self.eval_peg(inner, out) {
                    self.pos = snapshot;
                    out.truncate(mark);
                }
                true
            }
            PegExpr::Not(inner) => {
                let snapshot = self.pos;
                let mut scratch = Vec::new();
                let matched = self.eval_peg(inner, &mut scratch);
                self.pos = snapshot;
                !matched
            }
            PegExpr::And(inner) => {
                let snapshot = self.pos;
                let mut scratch = Vec::new();
                let matched = self.eval_peg(inner, &mut scratch);
                self.pos = snapshot;
                matched
            }
        }
    }

    /// Builtin rules reachable from extension rules; unknown names fall
    /// back to other installed rules, which build their own tagged node.
    fn eval_builtin_rule(&mut self, name: &str, out: &mut Vec<NodeId>) -> bool {
        let snapshot = self.pos;
        let result = match name {
            "expr" => self.parse_expr().ok(),
            "exprlist" => match self.parse_expr_list() {
                Ok(list) => {
                    out.extend(list);
                    return true;
                }
                Err(_) => None,
            },
            "name" => self.parse_name().ok().map(|(name, span)| {
                self.add(Node::with_data(Tag::Id, NodeData::Name(name), span))
            }),
            "block" => self.parse_block().ok(),
            "stmt" => match self.parse_statement() {
                Ok(Some(node)) => Some(node),
                _ => None,
            },
            "typexpr" => self.parse_type_expr().ok(),
            _ => {
                let grammar = self.grammar;
                match grammar.rule(name) {
                    Some(rule) => {
                        let mut captures = Vec::new();
                        if self.eval_peg(&rule.expr, &mut captures) {
                            let start = self.tokens[snapshot].span;
                            let span = self.end_span(start);
                            let node =
                                self.add(Node::with_children(rule.tag, captures, span));
                            out.push(node);
                            return true;
                        }
                        None
                    }
                    None => None,
                }
            }
        };
        match result {
            Some(node) => {
                out.push(node);
                true
            }
            None => {
                self.pos = snapshot;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> (Context, NodeId) {
        let mut ctx = Context::new("test.nelua", source);
        let root = parse(&mut ctx).expect("parse failed");
        (ctx, root)
    }

    fn parse_err(source: &str) -> CompileError {
        let mut ctx = Context::new("test.nelua", source);
        parse(&mut ctx).expect_err("expected parse error")
    }

    fn shape(source: &str) -> String {
        let (ctx, root) = parse_ok(source);
        ctx.ast.canonical(root)
    }

    #[test]
    fn test_empty_chunk_is_block() {
        let (ctx, root) = parse_ok("");
        assert_eq!(ctx.ast.tag(root), Tag::Block);
        assert!(ctx.ast.children(root).is_empty());
    }

    #[test]
    fn test_return_binary_expr() {
        assert_eq!(
            shape("return 1+2"),
            "(Block (Return (BinaryOp add (Number 1) (Number 2))))"
        );
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            shape("return 1+2*3"),
            "(Block (Return (BinaryOp add (Number 1) (BinaryOp mul (Number 2) (Number 3)))))"
        );
        // concat and pow are right-associative
        assert_eq!(
            shape("return 2^3^4"),
            "(Block (Return (BinaryOp pow (Number 2) (BinaryOp pow (Number 3) (Number 4)))))"
        );
    }

    #[test]
    fn test_unary_binds_tighter_than_binary() {
        assert_eq!(
            shape("return -a + b"),
            "(Block (Return (BinaryOp add (UnaryOp neg (Id a)) (Id b))))"
        );
    }

    #[test]
    fn test_local_decl_with_type() {
        assert_eq!(
            shape("local a: integer = 0x10"),
            "(Block (VarDecl local (IdDecl a (Type integer)) (Number 10)))"
        );
    }

    #[test]
    fn test_multi_decl_and_assign() {
        assert_eq!(
            shape("local a, b = 1, 2"),
            "(Block (VarDecl local (IdDecl a) (IdDecl b) (Number 1) (Number 2)))"
        );
        assert_eq!(
            shape("a, b = b, a"),
            "(Block (Assign 2:2 (Id a) (Id b) (Id b) (Id a)))"
        );
    }

    #[test]
    fn test_if_elseif_else() {
        let s = shape("if a then elseif b then else end");
        assert_eq!(s, "(Block (If (Id a) (Block) (Id b) (Block) (Block)))");
    }

    #[test]
    fn test_for_num() {
        assert_eq!(
            shape("for i=1,10 do end"),
            "(Block (ForNum (IdDecl i) (Number 1) (Number 10) (Block)))"
        );
        assert_eq!(
            shape("for i=1,10,2 do end"),
            "(Block (ForNum (IdDecl i) (Number 1) (Number 10) (Number 2) (Block)))"
        );
    }

    #[test]
    fn test_for_in() {
        assert_eq!(
            shape("for k,v in pairs(t) do end"),
            "(Block (ForIn 2:1 (IdDecl k) (IdDecl v) (Call (Id pairs) (Id t)) (Block)))"
        );
    }

    #[test]
    fn test_function_def() {
        assert_eq!(
            shape("local function f(x: integer): integer return x end"),
            "(Block (FuncDef local 1:1 (Id f) (IdDecl x (Type integer)) (Type integer) (Block (Return (Id x)))))"
        );
    }

    #[test]
    fn test_method_def_and_calls() {
        let s = shape("function A:m() end");
        assert_eq!(s, "(Block (FuncDef  0:0 (ColonIndex m (Id A)) (Block)))");
        assert_eq!(
            shape("a:m(1)"),
            "(Block (CallMethod m (Id a) (Number 1)))"
        );
    }

    #[test]
    fn test_record_type_decl() {
        assert_eq!(
            shape("local P = @record{x: integer, y: integer}"),
            "(Block (VarDecl local (IdDecl P) (TypeInstance (RecordType \
             (RecordFieldType x (Type integer)) (RecordFieldType y (Type integer))))))"
        );
    }

    #[test]
    fn test_pointer_array_optional_types() {
        assert_eq!(
            shape("local p: *integer"),
            "(Block (VarDecl local (IdDecl p (PointerType (Type integer)))))"
        );
        assert_eq!(
            shape("local a: [4]integer"),
            "(Block (VarDecl local (IdDecl a (ArrayType (Type integer) (Number 4)))))"
        );
        assert_eq!(
            shape("local o: ?integer"),
            "(Block (VarDecl local (IdDecl o (OptionalType (Type integer)))))"
        );
    }

    #[test]
    fn test_switch() {
        let s = shape("switch x do case 1 then case 2, 3 then else end");
        // case values 2 and 3 share one block node
        assert_eq!(
            s,
            "(Block (Switch (Id x) (Number 1) (Block) (Number 2) (Block) (Number 3) (Block) (Block)))"
        );
    }

    #[test]
    fn test_defer_and_do() {
        assert_eq!(shape("defer f() end"), "(Block (Defer (Block (Call (Id f)))))");
        assert_eq!(shape("do end"), "(Block (Do (Block)))");
    }

    #[test]
    fn test_goto_label() {
        assert_eq!(
            shape("::top:: goto top"),
            "(Block (Label top) (Goto top))"
        );
    }

    #[test]
    fn test_preprocess_nodes() {
        assert_eq!(
            shape("##[[local n=3]] return #[n]#*#[n]#"),
            "(Block (Preprocess <meta>) (Return (BinaryOp mul (PreprocessExpr <meta>) (PreprocessExpr <meta>))))"
        );
    }

    #[test]
    fn test_annotations() {
        assert_eq!(
            shape("local a: integer <const>"),
            "(Block (VarDecl local (IdDecl a (Type integer) (Annotation const))))"
        );
    }

    #[test]
    fn test_table_constructor() {
        assert_eq!(
            shape("local t = {1, x = 2, [3] = 4}"),
            "(Block (VarDecl local (IdDecl t) (Table (Number 1) (Pair x (Number 2)) (Pair (Number 3) (Number 4)))))"
        );
    }

    #[test]
    fn test_call_statement_required() {
        let err = parse_err("a + b");
        assert!(matches!(err.kind, crate::errors::ErrorKind::Parse { .. }));
    }

    #[test]
    fn test_unexpected_eof_label() {
        let err = parse_err("if x then");
        match err.kind {
            crate::errors::ErrorKind::Parse { label, .. } => {
                assert_eq!(label, "UnexpectedSyntaxAtEOF");
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_extension_rule_statement() {
        let source = "unless x then f() end";
        let mut ctx = Context::new("test.nelua", source);
        ctx.grammar.add_keyword("unless");
        ctx.grammar
            .set_peg("While", "'unless' expr 'then' block 'end'")
            .unwrap();
        let root = parse(&mut ctx).expect("extension parse failed");
        assert_eq!(
            ctx.ast.canonical(root),
            "(Block (While (Id x) (Block (Call (Id f)))))"
        );
    }

    #[test]
    fn test_keyword_removal_frees_name() {
        let source = "local switch = 1";
        let mut ctx = Context::new("test.nelua", source);
        ctx.grammar.remove_keyword("switch");
        let root = parse(&mut ctx).expect("parse failed");
        assert_eq!(
            ctx.ast.canonical(root),
            "(Block (VarDecl local (IdDecl switch) (Number 1)))"
        );
    }

    #[test]
    fn test_parse_shape_roundtrip() {
        // Shape equality between a source and its reparse
        let source = "local a = 1 if a then return a end";
        let (ctx1, root1) = parse_ok(source);
        let (ctx2, root2) = parse_ok(source);
        assert_eq!(ctx1.ast.canonical(root1), ctx2.ast.canonical(root2));
        assert!(ctx1.ast.same_shape(root1, root1));
    }

    #[test]
    fn test_canonical_source_roundtrip() {
        // rendering the canonical source form and re-parsing yields an
        // equal tag shape
        let sources = [
            "return 1+2*3",
            "local a: integer = 0x10 return a",
            "local P = @record{x: integer, y: *P} local p: P = {x = 1, y = nilptr}",
            "for i=1,10,2 do if i > 5 then break end end",
            "local function f(x: auto): (integer, integer) return x, x end",
            "while x do y = y + 1 end repeat z() until done",
            "switch v do case 1 then f() case 2, 3 then g() else h() end",
            "do defer cleanup() end local t = {1, k = 2, [3] = 4} end",
            "::top:: goto top",
            "##[[local n=3]] return #[n]#*#[n]#",
            "local e = @enum(uint8){A = 1, B} local o: ?integer",
        ];
        for source in sources {
            let (ctx1, root1) = parse_ok(source);
            let rendered = ctx1.ast.to_source(root1);
            let mut ctx2 = Context::new("rendered.nelua", rendered.clone());
            let root2 = parse(&mut ctx2).unwrap_or_else(|e| {
                panic!("re-parse of `{}` failed: {:?}\nrendered: {}", source, e, rendered)
            });
            assert!(
                ctx1.ast.same_shape_as(root1, &ctx2.ast, root2),
                "shape drifted for `{}`\nrendered: {}\nfirst:  {}\nsecond: {}",
                source,
                rendered,
                ctx1.ast.canonical(root1),
                ctx2.ast.canonical(root2)
            );
        }
    }
}
