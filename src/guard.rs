//! Purity and thread-affinity checks.
//!
//! Purity is enforced at three points: while the parser builds operator and
//! builtin nodes, when a scope creates a child, and when a pure scope writes a
//! variable. Thread affinity is enforced on every write to an existing
//! variable.

use std::thread;

use crate::{
    error::{ErrorKind, Result, ScriptError},
    lex::Location,
    ops::OperatorDefinition,
    scope::{VarFlags, Variable},
};

pub fn operator(def: &OperatorDefinition, pure: bool, location: &Location) -> Result<()> {
    if pure && !def.pure {
        return Err(ScriptError::purity(format!(
            "`{def}` cannot be used in a pure expression"
        ))
        .at(location.clone()));
    }
    Ok(())
}

pub fn builtin(name: &str, builtin_pure: bool, pure: bool, location: &Location) -> Result<()> {
    if pure && !builtin_pure {
        return Err(ScriptError::purity(format!(
            "the impure builtin `{name}` cannot be called from a pure expression"
        ))
        .at(location.clone()));
    }
    Ok(())
}

pub fn child_scope(parent: &str, parent_pure: bool, child_pure: bool) -> Result<()> {
    if parent_pure && !child_pure {
        return Err(ScriptError::purity(format!(
            "cannot create an impure scope inside the pure scope {parent}"
        )));
    }
    Ok(())
}

/// A pure scope may only define pure, non-volatile locals.
pub fn pure_write(scope: &str, key: &str, flags: &VarFlags) -> Result<()> {
    if flags.volatile {
        return Err(ScriptError::purity(format!(
            "cannot declare volatile `{key}` in the pure scope {scope}"
        )));
    }
    if !flags.pure {
        return Err(ScriptError::purity(format!(
            "cannot assign impure `{key}` in the pure scope {scope}"
        )));
    }
    Ok(())
}

pub fn outer_write(scope: &str, key: &str) -> ScriptError {
    ScriptError::purity(format!(
        "cannot modify `{key}` from the pure scope {scope}; it is defined outside it"
    ))
}

/// Only the creating thread may mutate a non-volatile variable.
pub fn thread_affinity(key: &str, variable: &Variable) -> Result<()> {
    if variable.flags().volatile || variable.thread() == thread::current().id() {
        return Ok(());
    }
    Err(ScriptError::new(
        ErrorKind::ConcurrencyViolation,
        format!(
            "`{key}` was created on another thread and is not volatile; it cannot be changed from {:?}",
            thread::current().name().unwrap_or("an unnamed thread")
        ),
    )
    .with_help("declare the variable with `volatile` to share it between threads"))
}
