use std::sync::Arc;

use crate::{
    config::ParserOptions,
    error::{Result, ScriptError},
    eval::{self, Declaration, Every},
    guard,
    lex::{Lexer, Location, SourceFile, Token, TokenKind, unescape},
    node::Node,
    ops::{self, Fixity, OpKind, OperatorDefinition},
    scope::VarFlags,
    system::{self, Builtins},
    value::Value,
};

/// Builds the expression graph for one source file.
///
/// Operators are resolved through the operator table with Pratt binding
/// powers. A line break ends an expression unless it sits inside `(` or `[`,
/// so statements need no separator; `;` is accepted anyway.
pub struct Parser<'de> {
    source: &'de Arc<SourceFile>,
    builtins: &'de Builtins,
    pure: bool,
    tokens: Vec<Token<'de>>,
    pos: usize,
    /// Open `(` and `[` around the current position.
    nesting: usize,
}

impl<'de> Parser<'de> {
    pub fn new(source: &'de Arc<SourceFile>, builtins: &'de Builtins, options: &ParserOptions) -> Self {
        Parser {
            source,
            builtins,
            pure: options.pure,
            tokens: Vec::new(),
            pos: 0,
            nesting: 0,
        }
    }

    pub fn parse(mut self) -> Result<Arc<Node>> {
        self.tokens = Lexer::new(self.source).collect::<Result<Vec<_>>>()?;
        let statements = self.parse_statements(None, Vec::new())?;
        let whole = Location::new(self.source, 0, self.source.text().len());
        Ok(eval::script(statements, whole, self.pure))
    }

    fn peek(&self) -> Option<&Token<'de>> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token<'de>> {
        self.tokens.get(self.pos + ahead)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|token| token.kind)
    }

    fn advance(&mut self) -> Option<Token<'de>> {
        let token = self.tokens.get(self.pos).copied();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn location(&self, token: &Token<'_>) -> Location {
        let len = match token.kind {
            TokenKind::String => token.literal.len() + 2,
            _ => token.literal.len(),
        };
        Location::new(self.source, token.offset, len)
    }

    fn here(&self) -> Location {
        match self.peek() {
            Some(token) => self.location(token),
            None => Location::new(self.source, self.source.text().len(), 0),
        }
    }

    fn unexpected(&self, expected: &str) -> ScriptError {
        let found = match self.peek() {
            Some(token) => format!("`{}`", token.literal),
            None => "end of input".to_string(),
        };
        ScriptError::parse(format!("expected {expected}, found {found}"), self.here())
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token<'de>> {
        match self.peek().copied() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(token)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<Token<'de>> {
        self.expect(TokenKind::Ident, expected)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|token| token.is_keyword(keyword)) {
            self.pos += 1;
            return true;
        }
        false
    }

    /// Run `f` with line breaks ignored, as inside parentheses.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    /// Run `f` with line breaks ending statements again, as inside braces.
    fn braced<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::replace(&mut self.nesting, 0);
        let result = f(self);
        self.nesting = saved;
        result
    }

    /// Run `f` in a pure parsing context.
    fn purely<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::replace(&mut self.pure, true);
        let result = f(self);
        self.pure = saved;
        result
    }

    fn at_end(&self, end: Option<TokenKind>) -> bool {
        match (self.peek_kind(), end) {
            (None, _) => true,
            (Some(kind), Some(end)) => kind == end,
            (Some(_), None) => false,
        }
    }

    /// Statements up to `end`, or the end of input. `end` is not consumed.
    fn parse_statements(
        &mut self,
        end: Option<TokenKind>,
        mut statements: Vec<Arc<Node>>,
    ) -> Result<Vec<Arc<Node>>> {
        loop {
            if !statements.is_empty() {
                self.end_of_statement(end)?;
            }
            while self.peek_kind() == Some(TokenKind::Semicolon) {
                self.pos += 1;
            }
            if self.at_end(end) {
                break;
            }
            statements.push(self.parse_statement()?);
        }
        if let Some(end) = end
            && self.peek_kind() != Some(end)
        {
            return Err(self.unexpected("a closing bracket"));
        }
        Ok(statements)
    }

    fn end_of_statement(&self, end: Option<TokenKind>) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) if token.kind == TokenKind::Semicolon || token.newline_before => Ok(()),
            Some(token) if Some(token.kind) == end => Ok(()),
            Some(_) => Err(self
                .unexpected("a line break or `;`")
                .with_help("put each statement on its own line")),
        }
    }

    fn parse_statement(&mut self) -> Result<Arc<Node>> {
        match self.parse_declaration()? {
            Some(declaration) => Ok(declaration),
            None => self.parse_expression(0),
        }
    }

    /// An operand that may itself be a declaration, as in `if c x = 1`.
    fn parse_operand(&mut self, min_bp: u8) -> Result<Arc<Node>> {
        match self.parse_declaration()? {
            Some(declaration) => Ok(declaration),
            None => self.parse_expression(min_bp),
        }
    }

    /// `[export] [const|volatile|var] [<Type>] [(constraint)] name = expr`,
    /// the `:=` form, `def name expr` and their `pure` variants.
    ///
    /// Leaves the position untouched and yields `None` when the tokens ahead
    /// are not a declaration.
    fn parse_declaration(&mut self) -> Result<Option<Arc<Node>>> {
        let start = self.pos;
        let mut flags = VarFlags::default();
        let mut modified = false;

        if self.peek().is_some_and(|token| token.is_keyword("pure"))
            && self.peek_at(1).is_some_and(|next| {
                next.is_keyword("def")
                    || (next.kind == TokenKind::Ident
                        && self.peek_at(2).is_some_and(|op| op.is_op(":=")))
            })
        {
            self.pos += 1;
            flags.pure = true;
            modified = true;
        }

        loop {
            match self.peek() {
                Some(token) if token.is_keyword("export") => flags.exported = true,
                Some(token) if token.is_keyword("const") => flags.readonly = true,
                Some(token) if token.is_keyword("volatile") => flags.volatile = true,
                Some(token) if token.is_keyword("var") => {}
                _ => break,
            }
            self.pos += 1;
            modified = true;
        }

        let mut label = None;
        if self.peek().is_some_and(|token| token.is_op("<"))
            && let Some(name) = self.peek_at(1).filter(|t| t.kind == TokenKind::Ident)
            && self.peek_at(2).is_some_and(|token| token.is_op(">"))
        {
            label = Some(name.literal.to_string());
            self.pos += 3;
            modified = true;
        }

        let mut constraint = None;
        if self.peek_kind() == Some(TokenKind::LeftParen)
            && let Some(close) = self.matching_paren(self.pos)
            && self.tokens.get(close + 1).is_some_and(|t| t.kind == TokenKind::Ident)
            && self
                .tokens
                .get(close + 2)
                .is_some_and(|t| t.is_op("=") || t.is_op(":="))
        {
            self.pos += 1;
            let predicate = self.nested(|p| p.parse_expression(0))?;
            self.expect(TokenKind::RightParen, "`)` after the constraint")?;
            constraint = Some(predicate);
            modified = true;
        }

        if self.peek().is_some_and(|token| token.is_keyword("def")) {
            let def_token = self.tokens[self.pos];
            self.pos += 1;
            let name = self.expect_ident("a name after `def`")?;
            let location = self.location(&def_token);
            let definition = ops::definition(OpKind::Define);
            guard::operator(definition, self.pure, &location)?;
            let (_, r_bp) = definition.binding_power();
            let value = if flags.pure {
                self.purely(|p| p.parse_operand(r_bp))?
            } else {
                self.parse_operand(r_bp)?
            };
            flags.readonly = true;
            return Ok(Some(self.declaration(
                Declaration {
                    name: name.literal.to_string(),
                    value,
                    lazy: true,
                    flags,
                    constraint,
                    label,
                },
                location,
            )));
        }

        let is_binding = self.peek_kind() == Some(TokenKind::Ident)
            && self
                .peek_at(1)
                .is_some_and(|op| op.is_op("=") || op.is_op(":="));
        if !is_binding {
            if modified {
                return Err(self.unexpected("`name = value` after the declaration modifiers"));
            }
            self.pos = start;
            return Ok(None);
        }

        let name = self.expect_ident("a variable name")?;
        let op = self.tokens[self.pos];
        self.pos += 1;
        let location = self.location(&op);
        let lazy = op.is_op(":=");
        let definition = ops::definition(if lazy { OpKind::Define } else { OpKind::Assign });
        guard::operator(definition, self.pure, &location)?;
        let (_, r_bp) = definition.binding_power();
        let value = if flags.pure {
            self.purely(|p| p.parse_operand(r_bp))?
        } else {
            self.parse_operand(r_bp)?
        };
        Ok(Some(self.declaration(
            Declaration {
                name: name.literal.to_string(),
                value,
                lazy,
                flags,
                constraint,
                label,
            },
            location,
        )))
    }

    fn declaration(&self, declaration: Declaration, location: Location) -> Arc<Node> {
        let pure = self.pure || declaration.flags.pure;
        eval::declaration(declaration, location, pure)
    }

    /// Index of the `)` closing the `(` at `open`.
    fn matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, token) in self.tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn parse_expression(&mut self, min_bp: u8) -> Result<Arc<Node>> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let Some(token) = self.peek().copied() else {
                break;
            };
            let location = self.location(&token);

            match token.kind {
                TokenKind::LeftParen if !token.newline_before && is_callable(&lhs) => {
                    let (l_bp, _) = ops::definition(OpKind::Call).binding_power();
                    if l_bp < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let args = self.parse_arguments()?;
                    lhs = eval::call(lhs, args, location, self.pure);
                    continue;
                }
                TokenKind::LeftBracket if !token.newline_before => {
                    let (l_bp, _) = ops::definition(OpKind::Subscript).binding_power();
                    if l_bp < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let index = self.nested(|p| p.parse_expression(0))?;
                    self.expect(TokenKind::RightBracket, "`]` after the index")?;
                    lhs = eval::subscript(lhs, index, location, self.pure);
                    continue;
                }
                TokenKind::Op | TokenKind::Keyword => {}
                _ => break,
            }

            let Some(def) = ops::table().operator(token.literal) else {
                break;
            };
            if token.newline_before && self.nesting == 0 && def.kind != OpKind::Else {
                break;
            }
            let (l_bp, r_bp) = def.binding_power();
            if l_bp < min_bp {
                break;
            }
            self.pos += 1;
            guard::operator(def, self.pure, &location)?;

            lhs = match def.fixity {
                Fixity::Postfix => self.parse_postfix(def, lhs, location)?,
                _ if matches!(def.kind, OpKind::Assign | OpKind::Define) => {
                    self.parse_assignment(def, lhs, location)?
                }
                _ => {
                    let rhs = self.parse_operand(r_bp)?;
                    eval::infix(def, lhs, rhs, location, self.pure)?
                }
            };
        }

        Ok(lhs)
    }

    fn parse_postfix(
        &mut self,
        def: &'static OperatorDefinition,
        lhs: Arc<Node>,
        location: Location,
    ) -> Result<Arc<Node>> {
        Ok(match def.kind {
            OpKind::Cast => {
                let type_name = self.expect_ident("a type name after `as`")?;
                eval::cast(lhs, type_name.literal, location, self.pure)
            }
            OpKind::Is => {
                let type_name = self.expect_ident("a type name after `is`")?;
                eval::is(lhs, type_name.literal, location, self.pure)
            }
            OpKind::Member => match self.peek().copied() {
                Some(Token {
                    kind: TokenKind::Ident | TokenKind::Keyword,
                    literal,
                    ..
                }) => {
                    self.pos += 1;
                    eval::member(lhs, literal, location, self.pure)
                }
                Some(Token {
                    kind: TokenKind::Integer(n),
                    ..
                }) => {
                    self.pos += 1;
                    let index = eval::literal(Value::Int(n), location.clone(), self.pure);
                    eval::subscript(lhs, index, location, self.pure)
                }
                _ => return Err(self.unexpected("a member name after `.`")),
            },
            _ => eval::step(def, lhs, location, self.pure)?,
        })
    }

    /// `name = expr`, `name := expr`, `name[key] = expr` or `name.key = expr`
    /// reached inside an expression.
    fn parse_assignment(
        &mut self,
        def: &'static OperatorDefinition,
        lhs: Arc<Node>,
        location: Location,
    ) -> Result<Arc<Node>> {
        let (_, r_bp) = def.binding_power();
        let value = self.parse_operand(r_bp)?;
        let lazy = def.kind == OpKind::Define;
        let target = lhs.children().first().filter(|child| child.op() == OpKind::VarRef);

        match (lhs.op(), lhs.name(), target.and_then(|t| t.name())) {
            (OpKind::VarRef, Some(name), _) => Ok(eval::declaration(
                Declaration {
                    name: name.to_string(),
                    value,
                    lazy,
                    flags: VarFlags::default(),
                    constraint: None,
                    label: None,
                },
                location,
                self.pure,
            )),
            (OpKind::Subscript, _, Some(name)) if !lazy => {
                let key = Arc::clone(&lhs.children()[1]);
                Ok(eval::assign_element(name, key, value, location, self.pure))
            }
            (OpKind::Member, Some(key), Some(name)) if !lazy => {
                let key = eval::literal(Value::str(key), location.clone(), self.pure);
                Ok(eval::assign_element(name, key, value, location, self.pure))
            }
            _ => Err(ScriptError::parse(
                format!("cannot assign to {lhs}"),
                location,
            )),
        }
    }

    /// Call arguments after the opening `(`, through the closing `)`.
    /// `name = expr` arguments are tagged with their name.
    fn parse_arguments(&mut self) -> Result<Vec<Arc<Node>>> {
        self.nested(|p| {
            let mut args = Vec::new();
            while p.peek_kind() != Some(TokenKind::RightParen) {
                let named = p.peek_kind() == Some(TokenKind::Ident)
                    && p.peek_at(1).is_some_and(|token| token.is_op("="));
                if named {
                    let name = p.expect_ident("an argument name")?;
                    p.pos += 1;
                    let value = p.parse_expression(0)?;
                    value.tag_named_parameter(name.literal);
                    args.push(value);
                } else {
                    args.push(p.parse_expression(0)?);
                }
                if p.peek_kind() == Some(TokenKind::Comma) {
                    p.pos += 1;
                } else if p.peek_kind() != Some(TokenKind::RightParen) {
                    return Err(p.unexpected("`,` or `)` in the argument list"));
                }
            }
            p.pos += 1;
            Ok(args)
        })
    }

    fn parse_prefix(&mut self) -> Result<Arc<Node>> {
        let Some(token) = self.advance() else {
            return Err(self.unexpected("an expression"));
        };
        let location = self.location(&token);
        let pure = self.pure;

        Ok(match token {
            Token {
                kind: TokenKind::Integer(n),
                ..
            } => self.with_unit(Value::Int(n), location),
            Token {
                kind: TokenKind::Decimal(n),
                ..
            } => self.with_unit(Value::Decimal(n), location),
            Token {
                kind: TokenKind::String,
                literal,
                ..
            } => eval::literal(Value::str(unescape(literal)), location, pure),
            Token {
                kind: TokenKind::Keyword,
                literal: "true" | "yes",
                ..
            } => eval::literal(Value::Bool(true), location, pure),
            Token {
                kind: TokenKind::Keyword,
                literal: "false" | "no",
                ..
            } => eval::literal(Value::Bool(false), location, pure),
            Token {
                kind: TokenKind::Keyword,
                literal: "void" | "null",
                ..
            } => eval::literal(Value::Void, location, pure),
            Token {
                kind: TokenKind::Ident,
                literal,
                ..
            } => {
                let call = self
                    .peek()
                    .is_some_and(|next| next.kind == TokenKind::LeftParen && !next.newline_before);
                if call && let Some(builtin) = self.builtins.get(literal) {
                    guard::builtin(literal, builtin.pure, pure, &location)?;
                    self.pos += 1;
                    let args = self.parse_arguments()?;
                    eval::builtin_call(literal, args, location, pure)
                } else {
                    eval::variable(literal, location, pure)
                }
            }
            Token {
                kind: TokenKind::Dollar,
                ..
            } => self.parse_parameter(location)?,
            Token {
                kind: TokenKind::LeftParen,
                ..
            } => self.parse_paren(location)?,
            Token {
                kind: TokenKind::LeftBracket,
                ..
            } => self.parse_bracket(location)?,
            Token {
                kind: TokenKind::LeftBrace,
                ..
            } => self.parse_brace(location)?,
            Token {
                kind: TokenKind::Op | TokenKind::Keyword,
                literal,
                ..
            } => {
                let Some(def) = ops::table().prefix(literal) else {
                    self.pos -= 1;
                    return Err(self.unexpected("an expression"));
                };
                guard::operator(def, pure, &location)?;
                self.parse_construct(def, location)?
            }
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("an expression"));
            }
        })
    }

    /// A numeric literal, scaled when a unit such as `sec` follows it.
    fn with_unit(&mut self, count: Value, location: Location) -> Arc<Node> {
        let count = eval::literal(count, location.clone(), self.pure);
        match self.peek() {
            Some(next)
                if next.kind == TokenKind::Ident
                    && !next.newline_before
                    && system::unit_seconds(next.literal).is_some() =>
            {
                let name = next.literal;
                let location = location.to(&self.location(next));
                self.pos += 1;
                eval::unit(name, count, location, self.pure)
            }
            _ => count,
        }
    }

    /// `$1`, `$*`, `$name` or `$(expr)`.
    fn parse_parameter(&mut self, location: Location) -> Result<Arc<Node>> {
        let pure = self.pure;
        let Some(token) = self.peek().copied() else {
            return Err(self.unexpected("a parameter after `$`"));
        };
        self.pos += 1;
        match token {
            Token {
                kind: TokenKind::Integer(n),
                ..
            } => Ok(eval::positional(&n.to_string(), location, pure)),
            token if token.is_op("*") => Ok(eval::positional("*", location, pure)),
            Token {
                kind: TokenKind::Ident,
                literal,
                ..
            } => Ok(eval::positional(literal, location, pure)),
            Token {
                kind: TokenKind::LeftParen,
                ..
            } => {
                let name = self.nested(|p| p.parse_expression(0))?;
                self.expect(TokenKind::RightParen, "`)` after the variable name")?;
                Ok(eval::dynamic_variable(name, location, pure))
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected("a parameter after `$`"))
            }
        }
    }

    /// `( expr )` or a range starting with an open lower bound.
    fn parse_paren(&mut self, location: Location) -> Result<Arc<Node>> {
        self.nested(|p| {
            if p.peek_kind() == Some(TokenKind::RightParen) {
                p.pos += 1;
                return Ok(eval::literal(Value::Void, location, p.pure));
            }
            if p.peek_kind() == Some(TokenKind::DotDot) {
                return p.parse_range(None, false, location);
            }
            let start = p.pos;
            let inner = p.parse_statement()?;
            if p.peek_kind() == Some(TokenKind::DotDot) {
                return p.parse_range(Some((inner, start)), false, location);
            }
            p.expect(TokenKind::RightParen, "`)`")?;
            Ok(inner)
        })
    }

    /// `[a, b, c]`, or a range starting with a closed lower bound.
    fn parse_bracket(&mut self, location: Location) -> Result<Arc<Node>> {
        self.nested(|p| {
            if p.peek_kind() == Some(TokenKind::DotDot) {
                return p.parse_range(None, true, location);
            }
            let mut items = Vec::new();
            while p.peek_kind() != Some(TokenKind::RightBracket) {
                let start = p.pos;
                let item = p.parse_expression(0)?;
                if items.is_empty() && p.peek_kind() == Some(TokenKind::DotDot) {
                    return p.parse_range(Some((item, start)), true, location);
                }
                items.push(item);
                if p.peek_kind() == Some(TokenKind::Comma) {
                    p.pos += 1;
                } else if p.peek_kind() != Some(TokenKind::RightBracket) {
                    return Err(p.unexpected("`,` or `]` in the list"));
                }
            }
            p.pos += 1;
            Ok(eval::list(items, location, p.pure))
        })
    }

    /// The rest of a range after its lower bound, at the `..`. `lower`
    /// carries the token index it started at.
    fn parse_range(
        &mut self,
        lower: Option<(Arc<Node>, usize)>,
        closed_lower: bool,
        location: Location,
    ) -> Result<Arc<Node>> {
        let lower_end = self.pos;
        self.expect(TokenKind::DotDot, "`..`")?;
        let upper_start = self.pos;
        let upper = match self.peek_kind() {
            Some(TokenKind::RightParen | TokenKind::RightBracket) => None,
            _ => Some(self.parse_expression(0)?),
        };
        let upper_end = self.pos;
        let closed_upper = match self.peek_kind() {
            Some(TokenKind::RightBracket) => true,
            Some(TokenKind::RightParen) => false,
            _ => return Err(self.unexpected("`)` or `]` to close the range")),
        };
        self.pos += 1;

        if let (Some((_, lower_start)), Some(_)) = (&lower, &upper)
            && !closed_lower
            && !closed_upper
            && self.same_text(*lower_start..lower_end, upper_start..upper_end)
        {
            return Err(ScriptError::parse(
                "an open range with equal bounds is always empty",
                location,
            )
            .with_help("close one end with `[` or `]`"));
        }

        Ok(eval::range(
            lower.map(|(node, _)| node),
            upper,
            closed_lower,
            closed_upper,
            location,
            self.pure,
        ))
    }

    fn same_text(&self, a: std::ops::Range<usize>, b: std::ops::Range<usize>) -> bool {
        let literals = |range: std::ops::Range<usize>| {
            self.tokens[range]
                .iter()
                .map(|token| token.literal)
                .collect::<Vec<_>>()
        };
        literals(a) == literals(b)
    }

    /// `{}` is an empty map, `{ key: value, ... }` a map, anything else a
    /// block of statements.
    fn parse_brace(&mut self, location: Location) -> Result<Arc<Node>> {
        self.braced(|p| {
            while p.peek_kind() == Some(TokenKind::Semicolon) {
                p.pos += 1;
            }
            if p.peek_kind() == Some(TokenKind::RightBrace) {
                p.pos += 1;
                return Ok(eval::map(Vec::new(), location, p.pure));
            }
            let first = p.parse_statement()?;
            if first.op() != OpKind::Pair {
                let statements = p.parse_statements(Some(TokenKind::RightBrace), vec![first])?;
                p.pos += 1;
                return Ok(eval::block(statements, location, p.pure));
            }

            let mut entries = vec![p.map_entry(first)?];
            loop {
                while matches!(
                    p.peek_kind(),
                    Some(TokenKind::Comma | TokenKind::Semicolon)
                ) {
                    p.pos += 1;
                }
                if p.peek_kind() == Some(TokenKind::RightBrace) {
                    p.pos += 1;
                    break;
                }
                let entry = p.parse_expression(0)?;
                entries.push(p.map_entry(entry)?);
            }
            Ok(eval::map(entries, location, p.pure))
        })
    }

    /// Split a `key: value` pair; a bare name as the key is the key itself.
    fn map_entry(&self, pair: Arc<Node>) -> Result<(Arc<Node>, Arc<Node>)> {
        let (OpKind::Pair, [key, value]) = (pair.op(), pair.children()) else {
            return Err(ScriptError::parse(
                format!("expected `key: value` in a map, found {pair}"),
                pair.location().clone(),
            ));
        };
        let key = match (key.op(), key.name()) {
            (OpKind::VarRef, Some(name)) => {
                eval::literal(Value::str(name), key.location().clone(), self.pure)
            }
            _ => Arc::clone(key),
        };
        Ok((key, Arc::clone(value)))
    }

    /// Everything introduced by a prefix operator or keyword.
    fn parse_construct(
        &mut self,
        def: &'static OperatorDefinition,
        location: Location,
    ) -> Result<Arc<Node>> {
        let (_, r_bp) = def.binding_power();
        let pure = self.pure;

        Ok(match def.kind {
            OpKind::If | OpKind::While | OpKind::WhenPrefix => {
                let cond = self.parse_expression(r_bp)?;
                let body = self.parse_operand(r_bp)?;
                match def.kind {
                    OpKind::If => eval::if_then(cond, body, location, pure),
                    OpKind::While => eval::while_loop(cond, body, location, pure),
                    _ => eval::when_prefix(cond, body, location, pure),
                }
            }
            OpKind::For => {
                let name = self.expect_ident("a loop variable after `for`")?;
                if !self.eat_keyword("in") {
                    return Err(self.unexpected("`in` after the loop variable"));
                }
                let iterable = self.parse_expression(r_bp)?;
                let body = self.parse_operand(r_bp)?;
                eval::for_loop(name.literal, iterable, body, location, pure)
            }
            OpKind::Every => {
                let period = self.parse_expression(r_bp)?;
                let until = if self.eat_keyword("until") {
                    Some(self.parse_expression(r_bp)?)
                } else {
                    None
                };
                let unless = if self.eat_keyword("unless") {
                    Some(self.parse_expression(r_bp)?)
                } else {
                    None
                };
                let body = self.parse_operand(r_bp)?;
                eval::every(
                    Every {
                        period,
                        until,
                        unless,
                        body,
                    },
                    location,
                    pure,
                )
            }
            OpKind::Assert => {
                let expr = self.parse_expression(r_bp)?;
                match (expr.op(), expr.children()) {
                    (OpKind::Pair, [message, cond]) => {
                        eval::assert(Some(Arc::clone(message)), Arc::clone(cond), location, pure)
                    }
                    _ => eval::assert(None, expr, location, pure),
                }
            }
            OpKind::Pure => {
                let operand = self.purely(|p| p.parse_operand(r_bp))?;
                eval::prefix(def, operand, location, true)?
            }
            OpKind::Module => {
                let uri = self.parse_expression(r_bp)?;
                self.eat_keyword("with");
                let args = if self.peek_kind() == Some(TokenKind::LeftParen) {
                    self.pos += 1;
                    self.parse_arguments()?
                } else {
                    Vec::new()
                };
                eval::module(uri, args, location, pure)
            }
            OpKind::Class => {
                let name = self.expect_ident("a class name")?;
                self.expect(TokenKind::LeftBrace, "`{` to open the class body")?;
                let body = self.braced(|p| {
                    let body = p.parse_statements(Some(TokenKind::RightBrace), Vec::new())?;
                    p.pos += 1;
                    Ok(body)
                })?;
                eval::class(name.literal, body, location, pure)
            }
            OpKind::New => {
                let name = self.expect_ident("a class name after `new`")?;
                let args = if self.peek_kind() == Some(TokenKind::LeftParen) {
                    self.pos += 1;
                    self.parse_arguments()?
                } else {
                    Vec::new()
                };
                eval::new_instance(name.literal, args, location, pure)
            }
            _ => {
                let operand = self.parse_operand(r_bp)?;
                eval::prefix(def, operand, location, pure)?
            }
        })
    }
}

/// Nodes a following `(` applies to as a call.
fn is_callable(node: &Node) -> bool {
    matches!(
        node.op(),
        OpKind::VarRef
            | OpKind::Member
            | OpKind::Subscript
            | OpKind::Call
            | OpKind::Positional
            | OpKind::DynamicVar
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse_with(text: &str, options: &ParserOptions) -> Result<Arc<Node>> {
        let source = SourceFile::new("test", text);
        let builtins = Builtins::standard();
        Parser::new(&source, &builtins, options).parse()
    }

    fn tree(text: &str) -> String {
        parse_with(text, &ParserOptions::default())
            .unwrap()
            .to_string()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(tree("1 + 2 * 3"), "(+ 1 (* 2 3))");
        assert_eq!(tree("1 - 2 - 3"), "(- (- 1 2) 3)");
        assert_eq!(tree("-a.b"), "(- (. b a))");
    }

    #[test]
    fn else_binds_to_the_whole_if() {
        assert_eq!(tree("if a b else c"), "(else (if a b) c)");
    }

    #[test]
    fn line_breaks_end_statements() {
        let script = parse_with("a\n-1", &ParserOptions::default()).unwrap();
        assert_eq!(script.children().len(), 2);
        let script = parse_with("(a\n-1)", &ParserOptions::default()).unwrap();
        assert_eq!(script.children().len(), 1);
    }

    #[test]
    fn statements_on_one_line_need_a_separator() {
        assert!(parse_with("a = 1; b = 2", &ParserOptions::default()).is_ok());
        let err = parse_with("a = 1 b = 2", &ParserOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn open_range_with_equal_bounds_is_rejected() {
        let err = parse_with("(x..x)", &ParserOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert!(parse_with("[x..x]", &ParserOptions::default()).is_ok());
        assert!(parse_with("(x..y)", &ParserOptions::default()).is_ok());
    }

    #[test]
    fn impure_operators_fail_in_pure_mode() {
        let err = parse_with("print 1", &ParserOptions::pure()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PurityViolation);
        let err = parse_with("pure { x = input() }", &ParserOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PurityViolation);
        assert!(parse_with("pure { x = max(1, 2) }", &ParserOptions::default()).is_ok());
    }

    #[test]
    fn named_arguments_are_tagged() {
        let script = parse_with("f(1, scale = 2)", &ParserOptions::default()).unwrap();
        let call = &script.children()[0];
        assert_eq!(call.op(), OpKind::Call);
        assert_eq!(call.children()[1].named_parameter(), None);
        assert_eq!(call.children()[2].named_parameter(), Some("scale"));
    }

    #[test]
    fn braces_distinguish_maps_from_blocks() {
        let script = parse_with("{}\n{a: 1, b: 2}\n{a; b}", &ParserOptions::default()).unwrap();
        let ops: Vec<OpKind> = script.children().iter().map(|node| node.op()).collect();
        assert_eq!(ops, vec![OpKind::Map, OpKind::Map, OpKind::Block]);
    }

    #[test]
    fn declarations_carry_their_modifiers() {
        let script = parse_with(
            "export const <Integer> (it > 0) n = 5\nd := n + 1\ndef f $1 * 2",
            &ParserOptions::default(),
        )
        .unwrap();
        let ops: Vec<OpKind> = script.children().iter().map(|node| node.op()).collect();
        assert_eq!(
            ops,
            vec![OpKind::Declaration, OpKind::Define, OpKind::Define]
        );
        assert_eq!(script.children()[0].name(), Some("n"));
        assert_eq!(script.children()[2].name(), Some("f"));
    }

    #[test]
    fn units_scale_numbers() {
        assert_eq!(tree("5 minutes"), "(unit minutes 5)");
    }
}
