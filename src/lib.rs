//! A reactive, dynamically typed expression language.
//!
//! Source text is parsed into a lazy expression graph which is then fixed
//! (evaluated) against a tree of scopes. Variables defined with `:=` and the
//! `when`, `?` and `=>` operators keep their dependants up to date as the
//! variables they read change.
//!
//! ```no_run
//! use ripple::{Runtime, Value};
//!
//! let rt = Runtime::new()?;
//! rt.eval("a = 1; b := a + 1; a = 5")?;
//! assert_eq!(rt.eval("b")?, Value::Int(6));
//! # Ok::<(), ripple::ScriptError>(())
//! ```

pub mod config;
pub mod error;
mod eval;
pub mod exec;
pub mod guard;
pub mod learn;
pub mod lex;
pub mod module;
pub mod node;
pub mod ops;
pub mod parse;
pub mod resource;
pub mod runtime;
pub mod scope;
pub mod system;
pub mod value;

pub use config::{ErrorPolicy, ParserOptions, RuntimeConfig};
pub use error::{ErrorKind, Result, ScriptError};
pub use lex::{Lexer, SourceFile};
pub use module::{ModuleResolver, Pipeable};
pub use node::Node;
pub use parse::Parser;
pub use resource::{UriHandler, UriHandlerFactory};
pub use runtime::{Context, Runtime};
pub use scope::{Binding, Scope, VarFlags};
pub use value::Value;
