use std::{
    cell::RefCell,
    collections::HashSet,
    fmt,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::{debug, error, warn};

use crate::{
    config::ErrorPolicy,
    error::{ErrorKind, Result, ScriptError},
    exec::{read, write},
    guard,
    lex::SourceFile,
    module::Pipeable,
    node::Node,
    runtime::Context,
    value::{TYPE_NAMES, Value},
};

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (scope, key) pairs whose listeners are running on this thread.
    static NOTIFYING: RefCell<HashSet<(usize, String)>> = RefCell::new(HashSet::new());
}

pub(crate) fn is_positional(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarFlags {
    pub readonly: bool,
    pub volatile: bool,
    pub pure: bool,
    pub parameter: bool,
    pub exported: bool,
}

/// How a value is being bound by `Scope::set`.
#[derive(Clone, Default)]
pub struct Binding {
    pub flags: VarFlags,
    /// Predicate evaluated with `it` and `previous` bound on every write.
    pub constraint: Option<Value>,
    /// Declared type or free-form subtype label.
    pub label: Option<String>,
}

impl Binding {
    pub fn readonly() -> Self {
        Binding {
            flags: VarFlags {
                readonly: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn volatile() -> Self {
        Binding {
            flags: VarFlags {
                volatile: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn pure(mut self, pure: bool) -> Self {
        self.flags.pure = pure;
        self
    }

    fn redeclares(&self) -> bool {
        self.flags.readonly
            || self.flags.volatile
            || self.flags.exported
            || self.constraint.is_some()
            || self.label.is_some()
    }
}

pub struct Variable {
    value: RwLock<Value>,
    constraint: Option<Value>,
    label: Option<String>,
    flags: VarFlags,
    thread: ThreadId,
}

impl Variable {
    fn new(value: Value, binding: Binding) -> Self {
        Variable {
            value: RwLock::new(value),
            constraint: binding.constraint,
            label: binding.label,
            flags: binding.flags,
            thread: thread::current().id(),
        }
    }

    pub fn value(&self) -> Value {
        read(&self.value).clone()
    }

    pub fn flags(&self) -> VarFlags {
        self.flags
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn constraint(&self) -> Option<&Value> {
        self.constraint.as_ref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn replace(&self, value: Value) {
        *write(&self.value) = value;
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("value", &self.value())
            .field("flags", &self.flags)
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Clone)]
pub struct Listener {
    pub id: String,
    pub callback: Arc<dyn Pipeable>,
}

/// A class registered with `class Name { ... }`.
pub struct ClassDef {
    pub name: String,
    pub body: Vec<Arc<Node>>,
}

struct ScopeInner {
    id: String,
    parent: Option<Scope>,
    context: Arc<Context>,
    source: Option<Arc<SourceFile>>,
    pure: bool,
    class_scope: bool,
    /// Created per evaluation of a block, loop or call.
    transient: bool,
    variables: RwLock<IndexMap<String, Arc<Variable>>>,
    listeners: DashMap<String, Vec<Listener>>,
    handlers: RwLock<Vec<Value>>,
    classes: DashMap<String, Arc<ClassDef>>,
    destroyed: AtomicBool,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if self.context.config().debug_scope {
            debug!(scope = %self.id, "scope dropped");
        }
    }
}

/// A lexical namespace of variables, listeners and error handlers.
///
/// Scopes only point at their parent, never at their children, so a chain is
/// kept alive by whoever holds its innermost scope: the block or call being
/// evaluated, or a lazy value that captured it.
#[derive(Clone)]
pub struct Scope(Arc<ScopeInner>);

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.0.id)
            .field("pure", &self.0.pure)
            .finish()
    }
}

impl Scope {
    pub fn root(context: Arc<Context>, name: &str, source: Option<Arc<SourceFile>>) -> Scope {
        Scope::create(name, None, context, source, false, false, false)
    }

    fn create(
        name: &str,
        parent: Option<Scope>,
        context: Arc<Context>,
        source: Option<Arc<SourceFile>>,
        pure: bool,
        class_scope: bool,
        transient: bool,
    ) -> Scope {
        let id = format!("{name}:{}", NEXT_SCOPE.fetch_add(1, Ordering::Relaxed));
        if context.config().debug_scope {
            debug!(
                scope = %id,
                parent = parent.as_ref().map(|p| p.id()).unwrap_or("-"),
                pure,
                "scope created"
            );
        }
        Scope(Arc::new(ScopeInner {
            id,
            parent,
            context,
            source,
            pure,
            class_scope,
            transient,
            variables: RwLock::new(IndexMap::new()),
            listeners: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            classes: DashMap::new(),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// A nested scope, created fresh each time a block, loop or call runs.
    /// A pure scope can only have pure children.
    pub fn child(&self, name: &str, pure: bool) -> Result<Scope> {
        self.check_alive()?;
        guard::child_scope(self.id(), self.is_pure(), pure)?;
        Ok(Scope::create(
            name,
            Some(self.clone()),
            Arc::clone(&self.0.context),
            self.0.source.clone(),
            pure,
            false,
            true,
        ))
    }

    pub fn class_child(&self, name: &str) -> Result<Scope> {
        self.check_alive()?;
        Ok(Scope::create(
            name,
            Some(self.clone()),
            Arc::clone(&self.0.context),
            self.0.source.clone(),
            self.is_pure(),
            true,
            false,
        ))
    }

    /// A sibling with the same parent and independent copies of the variable,
    /// listener and handler tables.
    pub fn copy(&self) -> Result<Scope> {
        self.check_alive()?;
        let id = format!("*{}:{}", self.0.id, NEXT_SCOPE.fetch_add(1, Ordering::Relaxed));
        Ok(Scope(Arc::new(ScopeInner {
            id,
            parent: self.0.parent.clone(),
            context: Arc::clone(&self.0.context),
            source: self.0.source.clone(),
            pure: self.0.pure,
            class_scope: self.0.class_scope,
            transient: self.0.transient,
            variables: RwLock::new(read(&self.0.variables).clone()),
            listeners: self.0.listeners.clone(),
            handlers: RwLock::new(read(&self.0.handlers).clone()),
            classes: self.0.classes.clone(),
            destroyed: AtomicBool::new(false),
        })))
    }

    /// Drop every variable, listener and handler. Later use fails.
    pub fn destroy(&self) {
        if self.0.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        write(&self.0.variables).clear();
        write(&self.0.handlers).clear();
        self.0.listeners.clear();
        self.0.classes.clear();
        if self.debug_scope() {
            debug!(scope = %self.id(), "scope destroyed");
        }
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// The nearest enclosing scope that outlives a single evaluation: a root,
    /// module or class instance.
    pub fn anchor(&self) -> &Scope {
        let mut scope = self;
        while scope.0.transient {
            match &scope.0.parent {
                Some(parent) => scope = parent,
                None => break,
            }
        }
        scope
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.0.parent.as_ref()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.0.context
    }

    pub fn source(&self) -> Option<&Arc<SourceFile>> {
        self.0.source.as_ref()
    }

    pub fn is_pure(&self) -> bool {
        self.0.pure
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn is_class_scope(&self) -> bool {
        self.0.class_scope
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(ScriptError::new(
                ErrorKind::ScopeDestroyed,
                format!("scope {} has been destroyed", self.id()),
            ));
        }
        Ok(())
    }

    fn debug_scope(&self) -> bool {
        self.0.context.config().debug_scope
    }

    fn debug_events(&self) -> bool {
        self.0.context.config().debug_events
    }

    fn local(&self, key: &str) -> Option<Arc<Variable>> {
        read(&self.0.variables).get(key).cloned()
    }

    /// The nearest scope in the ancestry that defines `key`.
    pub fn scope_for_key(&self, key: &str) -> Option<Scope> {
        let mut scope = self.clone();
        loop {
            if read(&scope.0.variables).contains_key(key) {
                return Some(scope);
            }
            scope = scope.0.parent.clone()?;
        }
    }

    pub fn find(&self, key: &str) -> Result<Option<Arc<Variable>>> {
        self.check_alive()?;
        Ok(self
            .scope_for_key(key)
            .and_then(|scope| scope.local(key)))
    }

    pub fn has(&self, key: &str) -> bool {
        self.scope_for_key(key).is_some()
    }

    pub fn get(&self, key: &str, must_find: bool) -> Result<Value> {
        match self.find(key)? {
            Some(variable) => Ok(variable.value()),
            None if must_find => Err(ScriptError::variable_not_found(key, self.id())),
            None => Ok(Value::Void),
        }
    }

    /// Positional or named call parameter visible from this scope.
    pub fn parameter_value(&self, key: &str) -> Result<Value> {
        match self.find(key)? {
            Some(variable) if variable.flags().parameter => Ok(variable.value()),
            _ => Err(ScriptError::variable_not_found(
                &if is_positional(key) {
                    format!("${key}")
                } else {
                    key.to_string()
                },
                self.id(),
            )),
        }
    }

    /// Plain assignment with default flags.
    pub fn assign(&self, key: &str, value: Value) -> Result<Arc<Variable>> {
        self.set(key, value, Binding::default().pure(self.is_pure()))
    }

    /// Write `key`.
    ///
    /// If an ancestor already defines the key, that ancestor's variable is
    /// changed and no local copy is made. Otherwise the variable is created
    /// here; class scopes always define their members locally. Listeners on
    /// the key run after the value is stored.
    pub fn set(&self, key: &str, value: Value, binding: Binding) -> Result<Arc<Variable>> {
        self.check_alive()?;
        if is_positional(key) {
            return Err(ScriptError::runtime(format!(
                "positional parameter ${key} cannot be assigned"
            )));
        }
        if let Some(owner) = self.scope_for_key(key)
            && !owner.ptr_eq(self)
            && !self.is_class_scope()
        {
            if self.is_pure() {
                return Err(guard::outer_write(self.id(), key));
            }
            return owner.set(key, value, binding);
        }
        if self.is_pure() {
            guard::pure_write(self.id(), key, &binding.flags)?;
        }
        let variable = self.write_local(key, value.clone(), binding)?;
        if self.debug_scope() {
            debug!(scope = %self.id(), key, value = %value, "set");
        }
        self.notify_scope(key, &value)?;
        Ok(variable)
    }

    fn write_local(&self, key: &str, value: Value, binding: Binding) -> Result<Arc<Variable>> {
        let Some(existing) = self.local(key) else {
            self.check_constraint(
                key,
                binding.constraint.as_ref(),
                binding.label.as_deref(),
                &value,
                None,
            )?;
            let variable = Arc::new(Variable::new(value, binding));
            write(&self.0.variables).insert(key.to_string(), Arc::clone(&variable));
            return Ok(variable);
        };

        if existing.flags.readonly {
            return Err(ScriptError::new(
                ErrorKind::ReadonlyViolation,
                format!("`{key}` is readonly and cannot be changed"),
            ));
        }
        guard::thread_affinity(key, &existing)?;
        if let (Some(current), Some(proposed)) = (&existing.constraint, &binding.constraint)
            && !same_constraint(current, proposed)
        {
            return Err(ScriptError::new(
                ErrorKind::ConstraintViolation,
                format!("`{key}` already has a constraint and cannot be given another"),
            ));
        }
        self.check_constraint(
            key,
            existing.constraint(),
            existing.label(),
            &value,
            Some(existing.value()),
        )?;

        if !binding.redeclares() {
            existing.replace(value);
            return Ok(existing);
        }
        let flags = VarFlags {
            readonly: binding.flags.readonly,
            volatile: binding.flags.volatile || existing.flags.volatile,
            pure: binding.flags.pure,
            parameter: false,
            exported: binding.flags.exported || existing.flags.exported,
        };
        let variable = Arc::new(Variable::new(
            value,
            Binding {
                flags,
                constraint: binding.constraint.or_else(|| existing.constraint.clone()),
                label: binding.label.or_else(|| existing.label.clone()),
            },
        ));
        write(&self.0.variables).insert(key.to_string(), Arc::clone(&variable));
        Ok(variable)
    }

    fn check_constraint(
        &self,
        key: &str,
        constraint: Option<&Value>,
        label: Option<&str>,
        value: &Value,
        previous: Option<Value>,
    ) -> Result<()> {
        if let Some(label) = label
            && TYPE_NAMES.contains(&label)
            && !matches!(value, Value::Lazy(_) | Value::Void)
            && !value.is_type(label)?
        {
            return Err(ScriptError::new(
                ErrorKind::ConstraintViolation,
                format!(
                    "`{key}` is declared <{label}> but was given a {}",
                    value.type_name()
                ),
            ));
        }
        let Some(constraint) = constraint else {
            return Ok(());
        };
        let check = self.child("constraint", self.is_pure())?;
        check.parameter("it", value.clone())?;
        check.parameter("previous", previous.unwrap_or_default())?;
        let outcome = match constraint {
            Value::Lazy(thunk) => thunk.force_in(&check, usize::MAX, false),
            other => Ok(other.clone()),
        };
        check.destroy();
        if !outcome?.truthy() {
            return Err(ScriptError::new(
                ErrorKind::ConstraintViolation,
                format!("`{key}` cannot be set to {value}: the value violates its constraint"),
            ));
        }
        Ok(())
    }

    /// Bind a call parameter in this scope, shadowing anything outside.
    pub fn parameter(&self, key: &str, value: Value) -> Result<Arc<Variable>> {
        self.check_alive()?;
        let variable = Arc::new(Variable::new(
            value.clone(),
            Binding {
                flags: VarFlags {
                    parameter: true,
                    pure: self.is_pure(),
                    ..Default::default()
                },
                ..Default::default()
            },
        ));
        write(&self.0.variables).insert(key.to_string(), Arc::clone(&variable));
        self.notify_scope(key, &value)?;
        Ok(variable)
    }

    fn remove_local(&self, key: &str) {
        write(&self.0.variables).shift_remove(key);
    }

    /// Register `callback` for changes to `key` on the scope that defines it.
    /// Registering an id again for the same key replaces its callback in place.
    pub fn listen(&self, key: &str, id: &str, callback: Arc<dyn Pipeable>) -> Result<()> {
        self.check_alive()?;
        if is_positional(key) {
            return Ok(());
        }
        let owner = self
            .scope_for_key(key)
            .ok_or_else(|| ScriptError::variable_not_found(key, self.id()))?;
        let mut listeners = owner.0.listeners.entry(key.to_string()).or_default();
        let existing = listeners.iter().position(|listener| listener.id == id);
        match existing {
            Some(index) => listeners[index].callback = callback,
            None => listeners.push(Listener {
                id: id.to_string(),
                callback,
            }),
        }
        if self.debug_events() {
            debug!(scope = %owner.id(), key, listener = id, "listening");
        }
        Ok(())
    }

    /// Remove every listener registered under `id` here or on an ancestor,
    /// which is where `listen` puts listeners for inherited keys. Returns how
    /// many went.
    pub fn unsubscribe(&self, id: &str) -> usize {
        let mut removed = 0;
        let mut scope = Some(self);
        while let Some(current) = scope {
            for mut entry in current.0.listeners.iter_mut() {
                let before = entry.len();
                entry.retain(|listener| listener.id != id);
                removed += before - entry.len();
            }
            scope = current.parent();
        }
        removed
    }

    pub fn listener_count(&self, key: &str) -> usize {
        self.0.listeners.get(key).map_or(0, |listeners| listeners.len())
    }

    /// Re-announce the current value of `key` to its listeners.
    pub fn notify(&self, key: &str) -> Result<()> {
        let Some(owner) = self.scope_for_key(key) else {
            return Ok(());
        };
        let value = owner.get(key, true)?;
        owner.notify_scope(key, &value)
    }

    /// Run the listeners of `key` on this scope in registration order.
    ///
    /// A failing listener is routed to this scope's error handling and the
    /// remaining listeners still run; the first failure nobody handled is
    /// returned at the end. A key whose listeners are already running on this
    /// thread is skipped, which breaks notification cycles.
    pub fn notify_scope(&self, key: &str, value: &Value) -> Result<()> {
        if is_positional(key) {
            return Ok(());
        }
        let listeners = match self.0.listeners.get(key) {
            Some(listeners) => listeners.clone(),
            None => return Ok(()),
        };
        let marker = (Arc::as_ptr(&self.0) as usize, key.to_string());
        let entered = NOTIFYING.with(|active| active.borrow_mut().insert(marker.clone()));
        if !entered {
            if self.debug_events() {
                debug!(scope = %self.id(), key, "skipping re-entrant notification");
            }
            return Ok(());
        }
        let _exit = NotifyExit(marker);

        let mut failure = None;
        for listener in listeners {
            if self.debug_events() {
                debug!(scope = %self.id(), key, listener = %listener.id, "notify");
            }
            let args = [Value::from(key), value.clone()];
            let Err(err) = listener.callback.invoke(&args) else {
                continue;
            };
            if let Err(err) = self.handle_error(err) {
                warn!(scope = %self.id(), key, listener = %listener.id, "listener failed: {err}");
                failure.get_or_insert(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    pub fn add_error_handler(&self, handler: Value) -> Result<()> {
        self.check_alive()?;
        write(&self.0.handlers).push(handler);
        Ok(())
    }

    pub fn error_handler_count(&self) -> usize {
        read(&self.0.handlers).len()
    }

    /// Route a failure to the nearest scope with error handlers, then to the
    /// configured policy. Assertion failures and errors that already went
    /// through this are returned unchanged.
    pub fn handle_error(&self, err: ScriptError) -> Result<Value> {
        if err.is_assertion() || err.is_unhandled() {
            return Err(err);
        }
        let mut scope = Some(self.clone());
        while let Some(current) = scope {
            let handlers = read(&current.0.handlers).clone();
            if !handlers.is_empty() {
                return current.run_error_handlers(&err, &handlers);
            }
            scope = current.0.parent.clone();
        }
        match self.0.context.config().error_policy {
            ErrorPolicy::FailFast => {
                error!(kind = %err.kind(), "{err}\n{}", err.trail_report());
                Err(err.into_fatal())
            }
            ErrorPolicy::Propagate => Err(err.into_unhandled()),
            ErrorPolicy::ErrorValue => Ok(Value::from(err.into_unhandled())),
        }
    }

    fn run_error_handlers(&self, err: &ScriptError, handlers: &[Value]) -> Result<Value> {
        let scope = self.child("error", self.is_pure())?;
        let _clear = ClearOnExit {
            scope: &scope,
            keys: &["TYPE", "MSG"],
        };
        scope.parameter("TYPE", Value::str(err.kind().type_name()))?;
        scope.parameter("MSG", Value::str(err.message()))?;
        if self.debug_events() {
            debug!(scope = %self.id(), kind = %err.kind(), "running error handlers");
        }
        let mut result = Value::Void;
        for handler in handlers {
            result = match handler {
                Value::Lazy(thunk) => thunk.force_in(&scope, usize::MAX, false),
                Value::Function(function) => function.invoke(&[
                    Value::str(err.kind().type_name()),
                    Value::str(err.message()),
                ]),
                other => Ok(other.clone()),
            }
            .map_err(ScriptError::into_unhandled)?;
        }
        Ok(result)
    }

    pub fn register_class(&self, class: ClassDef) -> Result<()> {
        self.check_alive()?;
        self.0.classes.insert(class.name.clone(), Arc::new(class));
        Ok(())
    }

    /// A class and the scope it was registered in.
    pub fn class(&self, name: &str) -> Result<(Scope, Arc<ClassDef>)> {
        let mut scope = self.clone();
        loop {
            let found = scope
                .0
                .classes
                .get(name)
                .map(|class| Arc::clone(class.value()));
            if let Some(class) = found {
                return Ok((scope, class));
            }
            scope = match scope.0.parent.clone() {
                Some(parent) => parent,
                None => {
                    return Err(ScriptError::runtime(format!("no class named `{name}`")));
                }
            };
        }
    }

    /// Names of the variables defined directly in this scope.
    pub fn keys(&self) -> Vec<String> {
        read(&self.0.variables).keys().cloned().collect()
    }

    /// Variables defined here, as a map.
    pub fn locals(&self) -> IndexMap<String, Value> {
        read(&self.0.variables)
            .iter()
            .filter(|(_, variable)| !variable.flags.parameter)
            .map(|(key, variable)| (key.clone(), variable.value()))
            .collect()
    }

    /// Variables declared with `export` in this scope.
    pub fn exports(&self) -> IndexMap<String, Value> {
        read(&self.0.variables)
            .iter()
            .filter(|(_, variable)| variable.flags.exported)
            .map(|(key, variable)| (key.clone(), variable.value()))
            .collect()
    }
}

/// Re-running the declaration that set a constraint is not a redeclaration.
fn same_constraint(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Lazy(a), Value::Lazy(b)) => Arc::ptr_eq(a.node(), b.node()),
        _ => false,
    }
}

struct NotifyExit((usize, String));

impl Drop for NotifyExit {
    fn drop(&mut self) {
        NOTIFYING.with(|active| {
            active.borrow_mut().remove(&self.0);
        });
    }
}

struct ClearOnExit<'a> {
    scope: &'a Scope,
    keys: &'a [&'a str],
}

impl Drop for ClearOnExit<'_> {
    fn drop(&mut self) {
        for key in self.keys {
            self.scope.remove_local(key);
        }
        self.scope.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{config::RuntimeConfig, runtime::Runtime};

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig::default().with_workers(2)).unwrap()
    }

    #[test]
    fn positional_keys() {
        assert!(is_positional("1"));
        assert!(is_positional("12"));
        assert!(!is_positional("a1"));
        assert!(!is_positional(""));
    }

    #[test]
    fn child_sees_parent_variables() {
        let rt = runtime();
        let root = rt.root();
        root.assign("a", Value::Int(1)).unwrap();
        let child = root.child("block", false).unwrap();
        assert_eq!(child.get("a", true).unwrap(), Value::Int(1));
        assert!(child.get("missing", true).is_err());
        assert_eq!(child.get("missing", false).unwrap(), Value::Void);
    }

    #[test]
    fn copy_is_independent() {
        let rt = runtime();
        let scope = rt.root().child("original", false).unwrap();
        scope.assign("a", Value::Int(1)).unwrap();
        let copy = scope.copy().unwrap();
        copy.assign("b", Value::Int(2)).unwrap();
        assert!(copy.has("a"));
        assert!(!scope.has("b"));
        assert!(copy.id().starts_with('*'));
    }

    #[test]
    fn destroyed_scope_rejects_use() {
        let rt = runtime();
        let scope = rt.root().child("short", false).unwrap();
        scope.assign("a", Value::Int(1)).unwrap();
        scope.destroy();
        let err = scope.get("a", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScopeDestroyed);
    }

    #[test]
    fn duplicate_listener_ids_register_once() {
        let rt = runtime();
        let root = rt.root();
        root.assign("a", Value::Int(1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: Arc<dyn Pipeable> = Arc::new(move |_: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Void)
        });
        root.listen("a", "same", Arc::clone(&callback)).unwrap();
        root.listen("a", "same", callback).unwrap();
        root.assign("a", Value::Int(2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(root.unsubscribe("same"), 1);
        root.assign("a", Value::Int(3)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listening_to_unknown_key_fails() {
        let rt = runtime();
        let noop: Arc<dyn Pipeable> = Arc::new(|_: &[Value]| Ok(Value::Void));
        let err = rt.root().listen("ghost", "id", noop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VariableNotFound);
    }

    #[test]
    fn positional_parameters_cannot_be_assigned() {
        let rt = runtime();
        let call = rt.root().child("call", false).unwrap();
        call.parameter("1", Value::Int(5)).unwrap();
        assert_eq!(call.parameter_value("1").unwrap(), Value::Int(5));
        assert!(call.assign("1", Value::Int(6)).is_err());
    }

    #[test]
    fn constraint_checks_every_write() {
        let rt = runtime();
        let root = rt.root();
        let binding = Binding {
            constraint: Some(Value::Bool(true)),
            ..Default::default()
        };
        root.set("a", Value::Int(1), binding.clone()).unwrap();
        let err = root.set("a", Value::Int(2), binding).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[test]
    fn type_label_is_enforced() {
        let rt = runtime();
        let root = rt.root();
        let binding = Binding {
            label: Some("Integer".into()),
            ..Default::default()
        };
        root.set("n", Value::Int(1), binding).unwrap();
        let err = root.assign("n", Value::from("one")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(root.get("n", true).unwrap(), Value::Int(1));
    }

    #[test]
    fn exports_only_include_exported() {
        let rt = runtime();
        let root = rt.root();
        root.assign("hidden", Value::Int(1)).unwrap();
        let binding = Binding {
            flags: VarFlags {
                exported: true,
                ..Default::default()
            },
            ..Default::default()
        };
        root.set("shown", Value::Int(2), binding).unwrap();
        let exports = root.exports();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports.get("shown"), Some(&Value::Int(2)));
    }
}
