use std::{fmt::Display, sync::Arc};

use miette::{Diagnostic, LabeledSpan, SourceCode};
use thiserror::Error;

use crate::lex::{Location, SourceFile};

/// Longest source trail kept on a single error.
const MAX_TRAIL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    VariableNotFound,
    PurityViolation,
    ConcurrencyViolation,
    ReadonlyViolation,
    ConstraintViolation,
    AssertionFailure,
    ExcessiveRecursion,
    ModuleResolution,
    ResourceState,
    ScopeDestroyed,
    Runtime,
}

impl ErrorKind {
    /// Name bound to `TYPE` while an error handler runs.
    pub fn type_name(self) -> &'static str {
        match self {
            ErrorKind::Parse => "ParseError",
            ErrorKind::VariableNotFound => "VariableNotFoundError",
            ErrorKind::PurityViolation => "PurityViolationError",
            ErrorKind::ConcurrencyViolation => "ConcurrencyViolationError",
            ErrorKind::ReadonlyViolation => "ReadonlyViolationError",
            ErrorKind::ConstraintViolation => "ConstraintViolationError",
            ErrorKind::AssertionFailure => "AssertionFailure",
            ErrorKind::ExcessiveRecursion => "ExcessiveRecursionError",
            ErrorKind::ModuleResolution => "ModuleResolutionError",
            ErrorKind::ResourceState => "ResourceStateError",
            ErrorKind::ScopeDestroyed => "ScopeDestroyedError",
            ErrorKind::Runtime => "RuntimeError",
        }
    }

    fn code(self) -> &'static str {
        match self {
            ErrorKind::Parse => "ripple::parse",
            ErrorKind::VariableNotFound => "ripple::variable_not_found",
            ErrorKind::PurityViolation => "ripple::purity",
            ErrorKind::ConcurrencyViolation => "ripple::concurrency",
            ErrorKind::ReadonlyViolation => "ripple::readonly",
            ErrorKind::ConstraintViolation => "ripple::constraint",
            ErrorKind::AssertionFailure => "ripple::assertion",
            ErrorKind::ExcessiveRecursion => "ripple::recursion",
            ErrorKind::ModuleResolution => "ripple::module",
            ErrorKind::ResourceState => "ripple::resource",
            ErrorKind::ScopeDestroyed => "ripple::scope_destroyed",
            ErrorKind::Runtime => "ripple::runtime",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A failure raised anywhere in the runtime.
///
/// Every error carries the trail of source locations it passed through on its
/// way out of the expression graph, innermost first. Once the scope chain has
/// been searched for handlers without success the error is marked unhandled so
/// outer node boundaries let it through untouched.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ScriptError {
    kind: ErrorKind,
    message: String,
    help: Option<String>,
    trail: Vec<Location>,
    unhandled: bool,
    fatal: bool,
}

pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ScriptError {
            kind,
            message: message.into(),
            help: None,
            trail: Vec::new(),
            unhandled: false,
            fatal: false,
        }
    }

    pub fn parse(message: impl Into<String>, location: Location) -> Self {
        ScriptError::new(ErrorKind::Parse, message).at(location)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::Runtime, message)
    }

    pub fn purity(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::PurityViolation, message)
            .with_help("pure expressions may not mutate outer state or call impure operations")
    }

    pub fn variable_not_found(key: &str, scope: &str) -> Self {
        ScriptError::new(
            ErrorKind::VariableNotFound,
            format!("variable `{key}` not found in scope {scope}"),
        )
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::AssertionFailure, message)
    }

    pub fn recursion(depth: usize) -> Self {
        ScriptError::new(
            ErrorKind::ExcessiveRecursion,
            format!("excessive recursion detected after {depth} nested evaluations"),
        )
        .with_help(
            "this is usually a lazily defined expression referring to itself; \
             use `fix` or `=` instead of `:=` to evaluate it eagerly",
        )
    }

    pub fn module(message: impl Into<String>) -> Self {
        ScriptError::new(ErrorKind::ModuleResolution, message)
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Attach a source location, skipping consecutive duplicates.
    pub fn at(mut self, location: Location) -> Self {
        if self.trail.len() < MAX_TRAIL && self.trail.last() != Some(&location) {
            self.trail.push(location);
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trail(&self) -> &[Location] {
        &self.trail
    }

    /// Line of the innermost location, if any.
    pub fn line(&self) -> Option<usize> {
        self.trail.first().map(Location::line)
    }

    pub fn is_assertion(&self) -> bool {
        self.kind == ErrorKind::AssertionFailure
    }

    pub fn is_unhandled(&self) -> bool {
        self.unhandled
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub(crate) fn into_unhandled(mut self) -> Self {
        self.unhandled = true;
        self
    }

    pub(crate) fn into_fatal(mut self) -> Self {
        self.unhandled = true;
        self.fatal = true;
        self
    }

    /// The trail rendered one location per line.
    pub fn trail_report(&self) -> String {
        self.trail
            .iter()
            .map(|location| format!("  at {location}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn primary_source(&self) -> Option<&Arc<SourceFile>> {
        self.trail.first().map(|location| &location.source)
    }
}

impl Diagnostic for ScriptError {
    fn code<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        Some(Box::new(self.kind.code()))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn Display + 'a>> {
        self.help
            .as_ref()
            .map(|help| Box::new(help) as Box<dyn Display + 'a>)
    }

    fn source_code(&self) -> Option<&dyn SourceCode> {
        self.primary_source()
            .map(|source| source.named() as &dyn SourceCode)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        let primary = self.primary_source()?;
        let labels = self
            .trail
            .iter()
            .filter(|location| Arc::ptr_eq(&location.source, primary))
            .enumerate()
            .map(|(i, location)| {
                let label = if i == 0 { "here" } else { "while evaluating" };
                LabeledSpan::new_with_span(Some(label.to_string()), location.span())
            });
        Some(Box::new(labels))
    }
}
