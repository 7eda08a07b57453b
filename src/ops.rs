use std::{collections::HashMap, fmt::Display, sync::LazyLock};

use crate::{error::Result, value::Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    // primaries, never looked up by symbol
    Script,
    Literal,
    VarRef,
    Positional,
    DynamicVar,
    Builtin,
    Unit,
    Block,
    List,
    Map,
    Range,
    Declaration,
    // infix
    Assign,
    Define,
    Causes,
    When,
    Write,
    Publish,
    Subscribe,
    Pipe,
    Else,
    Pair,
    Or,
    And,
    Each,
    Reduce,
    Equal,
    NotEqual,
    AssertEqReactive,
    AssertEqFixed,
    In,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulus,
    // prefix
    If,
    While,
    For,
    WhenPrefix,
    Every,
    Assert,
    Print,
    Err,
    Debug,
    Not,
    Negate,
    Size,
    Fix,
    Fork,
    Parallel,
    Serial,
    Error,
    Read,
    Start,
    Stop,
    Pause,
    Unpause,
    Destroy,
    State,
    Pure,
    Module,
    Class,
    New,
    // postfix
    Inc,
    Dec,
    Cast,
    Is,
    Member,
    Subscript,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixity {
    Reserved,
    Prefix,
    Infix,
    Postfix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

/// How a node built for this operator computes its value.
///
/// Plain value operators carry the function directly; everything else is a
/// construct whose evaluator is assembled by the parser.
#[derive(Clone, Copy)]
pub enum OpEval {
    Unary(fn(&Value) -> Result<Value>),
    Binary(fn(&Value, &Value) -> Result<Value>),
    Construct,
}

impl std::fmt::Debug for OpEval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpEval::Unary(_) => f.write_str("Unary"),
            OpEval::Binary(_) => f.write_str("Binary"),
            OpEval::Construct => f.write_str("Construct"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OperatorDefinition {
    pub kind: OpKind,
    pub name: &'static str,
    pub symbol: Option<&'static str>,
    pub keyword: Option<&'static str>,
    pub fixity: Fixity,
    pub precedence: u8,
    pub assoc: Assoc,
    /// Re-evaluated on every fix instead of cached after the first.
    pub reactive: bool,
    /// Allowed inside pure expressions.
    pub pure: bool,
    pub eval: OpEval,
}

impl OperatorDefinition {
    /// Pratt binding power derived from precedence and associativity.
    ///
    /// Prefix operators use the right side only, postfix the left side only.
    pub fn binding_power(&self) -> (u8, u8) {
        let p = self.precedence * 2;
        match (self.fixity, self.assoc) {
            (Fixity::Prefix, _) => (0, p + 1),
            (Fixity::Postfix, _) => (p, 0),
            (_, Assoc::Left) => (p, p + 1),
            (_, Assoc::Right) => (p + 1, p),
        }
    }

    pub fn is_construct(&self) -> bool {
        matches!(self.eval, OpEval::Construct)
    }
}

impl Display for OperatorDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.symbol, self.keyword) {
            (Some(symbol), _) => f.write_str(symbol),
            (None, Some(keyword)) => f.write_str(keyword),
            (None, None) => f.write_str(self.name),
        }
    }
}

/// Words that are reserved but are not operators.
const RESERVED_WORDS: &[&str] = &[
    "true", "false", "yes", "no", "void", "null", "export", "const", "volatile", "var", "def",
    "until", "unless", "with",
];

/// Punctuation the lexer recognizes besides operator symbols.
const PUNCTUATION: &[&str] = &["..", "(", ")", "{", "}", "[", "]", ",", ";", "$"];

pub struct OperatorTable {
    definitions: Vec<OperatorDefinition>,
    by_kind: HashMap<OpKind, usize>,
    prefix: HashMap<&'static str, usize>,
    operator: HashMap<&'static str, usize>,
    symbols: Vec<&'static str>,
}

impl OperatorTable {
    fn build(definitions: Vec<OperatorDefinition>) -> Self {
        let mut by_kind = HashMap::new();
        let mut prefix = HashMap::new();
        let mut operator = HashMap::new();
        let mut symbols: Vec<&'static str> = PUNCTUATION.to_vec();

        for (i, def) in definitions.iter().enumerate() {
            by_kind.insert(def.kind, i);
            for text in def.symbol.into_iter().chain(def.keyword) {
                match def.fixity {
                    Fixity::Prefix => {
                        prefix.insert(text, i);
                    }
                    Fixity::Infix | Fixity::Postfix => {
                        operator.insert(text, i);
                    }
                    Fixity::Reserved => {}
                }
            }
            if let Some(symbol) = def.symbol
                && !symbols.contains(&symbol)
            {
                symbols.push(symbol);
            }
        }
        // longest match first
        symbols.sort_by_key(|symbol| std::cmp::Reverse(symbol.len()));

        OperatorTable {
            definitions,
            by_kind,
            prefix,
            operator,
            symbols,
        }
    }

    pub fn get(&self, kind: OpKind) -> &OperatorDefinition {
        // every kind is registered in `build_table`
        &self.definitions[self.by_kind[&kind]]
    }

    pub fn prefix(&self, text: &str) -> Option<&OperatorDefinition> {
        self.prefix.get(text).map(|&i| &self.definitions[i])
    }

    /// Infix or postfix operator for a symbol or keyword.
    pub fn operator(&self, text: &str) -> Option<&OperatorDefinition> {
        self.operator.get(text).map(|&i| &self.definitions[i])
    }

    pub fn is_keyword(&self, text: &str) -> bool {
        RESERVED_WORDS.contains(&text)
            || self
                .definitions
                .iter()
                .any(|def| def.keyword == Some(text))
    }

    /// Every symbol the lexer should match, longest first.
    pub fn symbols(&self) -> &[&'static str] {
        &self.symbols
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperatorDefinition> {
        self.definitions.iter()
    }
}

static TABLE: LazyLock<OperatorTable> = LazyLock::new(|| OperatorTable::build(build_table()));

pub fn table() -> &'static OperatorTable {
    &TABLE
}

pub fn definition(kind: OpKind) -> &'static OperatorDefinition {
    table().get(kind)
}

struct Def(OperatorDefinition);

impl Def {
    fn new(kind: OpKind, name: &'static str, fixity: Fixity, precedence: u8) -> Self {
        Def(OperatorDefinition {
            kind,
            name,
            symbol: None,
            keyword: None,
            fixity,
            precedence,
            assoc: Assoc::Left,
            reactive: true,
            pure: true,
            eval: OpEval::Construct,
        })
    }

    fn reserved(kind: OpKind, name: &'static str) -> Self {
        Def::new(kind, name, Fixity::Reserved, 0)
    }

    fn infix(kind: OpKind, name: &'static str, precedence: u8) -> Self {
        Def::new(kind, name, Fixity::Infix, precedence)
    }

    fn prefix(kind: OpKind, name: &'static str, precedence: u8) -> Self {
        Def::new(kind, name, Fixity::Prefix, precedence)
    }

    fn postfix(kind: OpKind, name: &'static str, precedence: u8) -> Self {
        Def::new(kind, name, Fixity::Postfix, precedence)
    }

    fn symbol(mut self, symbol: &'static str) -> Self {
        self.0.symbol = Some(symbol);
        self
    }

    fn keyword(mut self, keyword: &'static str) -> Self {
        self.0.keyword = Some(keyword);
        self
    }

    fn right(mut self) -> Self {
        self.0.assoc = Assoc::Right;
        self
    }

    fn cached(mut self) -> Self {
        self.0.reactive = false;
        self
    }

    fn impure(mut self) -> Self {
        self.0.pure = false;
        self
    }

    fn unary(mut self, f: fn(&Value) -> Result<Value>) -> Self {
        self.0.eval = OpEval::Unary(f);
        self
    }

    fn binary(mut self, f: fn(&Value, &Value) -> Result<Value>) -> Self {
        self.0.eval = OpEval::Binary(f);
        self
    }
}

fn build_table() -> Vec<OperatorDefinition> {
    use OpKind::*;

    const BODY: u8 = 5;
    const UNARY: u8 = 14;

    let defs = vec![
        Def::reserved(Script, "script"),
        Def::reserved(Literal, "literal").cached(),
        Def::reserved(VarRef, "variable"),
        Def::reserved(Positional, "parameter"),
        Def::reserved(DynamicVar, "dynamic-variable"),
        Def::reserved(Builtin, "builtin"),
        Def::reserved(Unit, "unit").cached(),
        Def::reserved(Block, "block"),
        Def::reserved(List, "list"),
        Def::reserved(Map, "map"),
        Def::reserved(Range, "range"),
        Def::reserved(Declaration, "declaration"),
        // infix
        Def::infix(Assign, "assign", 1).symbol("=").right(),
        Def::infix(Define, "define", 1).symbol(":=").right(),
        Def::infix(Causes, "causes", 2).symbol("=>").impure(),
        Def::infix(When, "when", 2).symbol("?").impure(),
        Def::infix(Write, "write", 2).symbol(">>").keyword("write").impure(),
        Def::infix(Publish, "publish", 2).symbol("*>").impure(),
        Def::infix(Subscribe, "subscribe", 2).symbol("<*").impure(),
        Def::infix(Pipe, "pipe", 3).symbol("|"),
        Def::infix(Else, "else", 4).keyword("else"),
        Def::infix(Pair, "pair", 6).symbol(":").right(),
        Def::infix(Or, "or", 7).symbol("||").keyword("or"),
        Def::infix(And, "and", 8).symbol("&&").keyword("and"),
        Def::infix(Each, "each", 9).keyword("each"),
        Def::infix(Reduce, "reduce", 9).keyword("reduce"),
        Def::infix(Equal, "equal", 10).symbol("==").binary(Value::equal),
        Def::infix(NotEqual, "not-equal", 10).symbol("!=").binary(Value::not_equal),
        Def::infix(AssertEqReactive, "assert-equal", 10).symbol("<=>"),
        Def::infix(AssertEqFixed, "assert-equal-once", 10).symbol("<->").cached(),
        Def::infix(In, "in", 10).keyword("in").binary(Value::member_of),
        Def::infix(Less, "less", 11).symbol("<").binary(Value::less),
        Def::infix(Greater, "greater", 11).symbol(">").binary(Value::greater),
        Def::infix(LessEqual, "less-equal", 11).symbol("<=").binary(Value::less_equal),
        Def::infix(GreaterEqual, "greater-equal", 11)
            .symbol(">=")
            .binary(Value::greater_equal),
        Def::infix(Plus, "plus", 12).symbol("+").binary(Value::add),
        Def::infix(Minus, "minus", 12).symbol("-").binary(Value::sub),
        Def::infix(Multiply, "multiply", 13).symbol("*").binary(Value::mul),
        Def::infix(Divide, "divide", 13).symbol("/").binary(Value::div),
        Def::infix(Modulus, "modulus", 13).symbol("%").binary(Value::rem),
        // prefix constructs whose operand runs up to the next `else`, `|` or `=>`
        Def::prefix(If, "if", BODY).keyword("if"),
        Def::prefix(While, "while", BODY).keyword("while"),
        Def::prefix(For, "for", BODY).keyword("for"),
        Def::prefix(WhenPrefix, "when", BODY).keyword("when").impure(),
        Def::prefix(Every, "every", BODY).keyword("every").impure(),
        Def::prefix(Assert, "assert", BODY).keyword("assert"),
        Def::prefix(Print, "print", BODY).keyword("print").impure(),
        Def::prefix(Err, "err", BODY).keyword("err").impure(),
        Def::prefix(Debug, "debug", BODY).keyword("debug").impure(),
        // prefix unary
        Def::prefix(Not, "not", UNARY).symbol("!").keyword("not").unary(Value::not),
        Def::prefix(Negate, "negate", UNARY).symbol("-").unary(Value::negate),
        Def::prefix(Size, "size", UNARY).symbol("#").unary(Value::size_of),
        Def::prefix(Fix, "fix", UNARY).keyword("fix").cached(),
        Def::prefix(Fork, "fork", UNARY).keyword("fork").impure(),
        Def::prefix(Parallel, "parallel", UNARY).keyword("parallel"),
        Def::prefix(Serial, "serial", UNARY).keyword("serial"),
        Def::prefix(Error, "error", UNARY).keyword("error").impure(),
        Def::prefix(Read, "read", UNARY).symbol("<<").keyword("read").impure(),
        Def::prefix(Start, "start", UNARY).keyword("start").impure(),
        Def::prefix(Stop, "stop", UNARY).keyword("stop").impure(),
        Def::prefix(Pause, "pause", UNARY).keyword("pause").impure(),
        Def::prefix(Unpause, "unpause", UNARY).keyword("unpause").impure(),
        Def::prefix(Destroy, "destroy", UNARY).keyword("destroy").impure(),
        Def::prefix(State, "state", UNARY).keyword("state").impure(),
        Def::prefix(Pure, "pure", UNARY).keyword("pure"),
        Def::prefix(Module, "module", UNARY).keyword("module").impure().cached(),
        Def::prefix(Class, "class", UNARY).keyword("class").impure(),
        Def::prefix(New, "new", UNARY).keyword("new").impure(),
        // postfix
        Def::postfix(Inc, "increment", 15).symbol("++").unary(Value::increment),
        Def::postfix(Dec, "decrement", 15).symbol("--").unary(Value::decrement),
        Def::postfix(Cast, "cast", 15).keyword("as"),
        Def::postfix(Is, "is", 10).keyword("is"),
        Def::postfix(Member, "member", 16).symbol("."),
        Def::postfix(Subscript, "subscript", 16),
        Def::postfix(Call, "call", 16),
    ];
    defs.into_iter().map(|def| def.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operator_has_positive_precedence() {
        for def in table().iter().filter(|def| def.fixity != Fixity::Reserved) {
            assert!(def.precedence > 0, "{} has no precedence", def.name);
        }
    }

    #[test]
    fn symbols_are_longest_first() {
        let symbols = table().symbols();
        let position = |s: &str| symbols.iter().position(|x| *x == s).unwrap();
        assert!(position("<=>") < position("<="));
        assert!(position("<=") < position("<"));
        assert!(position(":=") < position(":"));
        assert!(position("..") < position("."));
    }

    #[test]
    fn minus_is_both_prefix_and_infix() {
        assert_eq!(table().prefix("-").unwrap().kind, OpKind::Negate);
        assert_eq!(table().operator("-").unwrap().kind, OpKind::Minus);
    }

    #[test]
    fn side_effects_are_not_pure() {
        for kind in [OpKind::Print, OpKind::Every, OpKind::Fork, OpKind::Write] {
            assert!(!definition(kind).pure);
        }
        for kind in [OpKind::Plus, OpKind::If, OpKind::Each, OpKind::Fix] {
            assert!(definition(kind).pure);
        }
    }

    #[test]
    fn binding_powers_respect_associativity() {
        let (l, r) = definition(OpKind::Plus).binding_power();
        assert!(l < r);
        let (l, r) = definition(OpKind::Pair).binding_power();
        assert!(l > r);
        let (_, body) = definition(OpKind::If).binding_power();
        let (else_l, _) = definition(OpKind::Else).binding_power();
        assert!(else_l < body);
    }

    #[test]
    fn keywords_are_reserved() {
        assert!(table().is_keyword("if"));
        assert!(table().is_keyword("const"));
        assert!(!table().is_keyword("count"));
    }
}
