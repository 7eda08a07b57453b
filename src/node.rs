use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc, Condvar, Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use crate::{
    error::{ErrorKind, Result, ScriptError},
    exec::{lock, wait},
    lex::Location,
    ops::{self, OpKind},
    runtime::Context,
    scope::Scope,
    value::Value,
};

pub type Evaluator = Arc<dyn Fn(&Frame<'_>) -> Result<Value> + Send + Sync>;

static NEXT_NODE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Counts nested node evaluations on the current thread.
struct DepthGuard;

impl DepthGuard {
    fn enter(limit: usize) -> Result<Self> {
        DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > limit {
                return Err(ScriptError::recursion(limit));
            }
            depth.set(next);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Evaluation state of a cached node, tied to the scope it was computed in.
enum NodeState {
    Unevaluated,
    Evaluating { thread: ThreadId, scope: String },
    Fixed { scope: String, value: Value },
}

/// Resets a node left mid-evaluation, so waiters are not stranded if the
/// evaluator unwinds.
struct Pending<'a> {
    node: &'a Node,
    done: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.done {
            *lock(&self.node.state) = NodeState::Unevaluated;
            self.node.ready.notify_all();
        }
    }
}

/// A vertex of the lazy expression graph.
///
/// Nodes are immutable once built apart from their evaluation state: a
/// reactive node runs its evaluator on every fix, any other node runs it once
/// per scope and then keeps returning the cached value while it is fixed in
/// that same scope. Concurrent fixes in the same scope block until the first
/// one completes.
pub struct Node {
    id: u64,
    op: OpKind,
    children: Vec<Arc<Node>>,
    pure: bool,
    reactive: bool,
    evaluator: Evaluator,
    name: Option<String>,
    literal: Option<Value>,
    location: Location,
    named_parameter: OnceLock<String>,
    evaluations: AtomicU64,
    state: Mutex<NodeState>,
    ready: Condvar,
}

pub struct NodeBuilder {
    op: OpKind,
    location: Location,
    pure: bool,
    reactive: bool,
    children: Vec<Arc<Node>>,
    name: Option<String>,
    literal: Option<Value>,
}

impl NodeBuilder {
    pub fn children(mut self, children: Vec<Arc<Node>>) -> Self {
        self.children = children;
        self
    }

    pub fn child(mut self, child: Arc<Node>) -> Self {
        self.children.push(child);
        self
    }

    /// Append optional trailing operands.
    pub fn extend(mut self, children: impl IntoIterator<Item = Arc<Node>>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn literal(mut self, value: Value) -> Self {
        self.literal = Some(value);
        self
    }

    pub fn reactive(mut self, reactive: bool) -> Self {
        self.reactive = reactive;
        self
    }

    pub fn evaluator(
        self,
        evaluator: impl Fn(&Frame<'_>) -> Result<Value> + Send + Sync + 'static,
    ) -> Arc<Node> {
        Arc::new(Node {
            id: NEXT_NODE.fetch_add(1, Ordering::Relaxed),
            op: self.op,
            children: self.children,
            pure: self.pure,
            reactive: self.reactive,
            evaluator: Arc::new(evaluator),
            name: self.name,
            literal: self.literal,
            location: self.location,
            named_parameter: OnceLock::new(),
            evaluations: AtomicU64::new(0),
            state: Mutex::new(NodeState::Unevaluated),
            ready: Condvar::new(),
        })
    }
}

impl Node {
    pub fn build(op: OpKind, location: Location, pure: bool) -> NodeBuilder {
        NodeBuilder {
            op,
            location,
            pure,
            reactive: ops::definition(op).reactive,
            children: Vec::new(),
            name: None,
            literal: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    pub fn is_reactive(&self) -> bool {
        self.reactive
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Variable key, builtin name or type name, depending on the operator.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn literal(&self) -> Option<&Value> {
        self.literal.as_ref()
    }

    pub fn named_parameter(&self) -> Option<&str> {
        self.named_parameter.get().map(String::as_str)
    }

    /// Mark this node as the value of a `name = expr` call argument.
    pub fn tag_named_parameter(&self, name: impl Into<String>) {
        let _ = self.named_parameter.set(name.into());
    }

    /// How many times the evaluator body has run.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Variable keys read anywhere below this node, in first-seen order.
    pub fn dependencies(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.collect_dependencies(&mut keys);
        keys
    }

    fn collect_dependencies(&self, keys: &mut Vec<String>) {
        if self.op == OpKind::VarRef
            && let Some(name) = &self.name
            && !keys.contains(name)
        {
            keys.push(name.clone());
        }
        for child in &self.children {
            child.collect_dependencies(keys);
        }
    }

    pub fn fix(&self, scope: &Scope, depth: usize, parallel: bool) -> Result<Value> {
        self.evaluate(scope, parallel)?.fix(depth, parallel)
    }

    pub fn fix_deep(&self, scope: &Scope, parallel: bool) -> Result<Value> {
        self.fix(scope, usize::MAX, parallel)
    }

    fn evaluate(&self, scope: &Scope, parallel: bool) -> Result<Value> {
        let limit = scope.context().config().max_recursion_depth;
        let _depth = DepthGuard::enter(limit).map_err(|err| err.at(self.location.clone()))?;

        if self.reactive {
            return self.run(scope, parallel);
        }

        let current = thread::current().id();
        {
            let mut state = lock(&self.state);
            loop {
                let owner = match &*state {
                    NodeState::Fixed { scope: owner, value } if owner == scope.id() => {
                        return Ok(value.clone());
                    }
                    NodeState::Evaluating { thread, scope: owner } => {
                        Some((*thread, owner == scope.id()))
                    }
                    NodeState::Fixed { .. } | NodeState::Unevaluated => None,
                };
                match owner {
                    Some((thread, true)) if thread == current => {
                        drop(state);
                        let err = ScriptError::new(
                            ErrorKind::ExcessiveRecursion,
                            "expression depends on its own value",
                        );
                        return self.intercept(scope, Err(err));
                    }
                    Some((_, true)) => state = wait(&self.ready, state),
                    // Busy in another scope: compute this scope's value without caching it.
                    Some((_, false)) => {
                        drop(state);
                        return self.run(scope, parallel);
                    }
                    None => {
                        *state = NodeState::Evaluating {
                            thread: current,
                            scope: scope.id().to_string(),
                        };
                        break;
                    }
                }
            }
        }

        let mut pending = Pending {
            node: self,
            done: false,
        };
        let result = self.run(scope, parallel);
        *lock(&self.state) = match &result {
            Ok(value) => NodeState::Fixed {
                scope: scope.id().to_string(),
                value: value.clone(),
            },
            Err(_) => NodeState::Unevaluated,
        };
        pending.done = true;
        self.ready.notify_all();
        result
    }

    fn run(&self, scope: &Scope, parallel: bool) -> Result<Value> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            node: self,
            scope,
            parallel,
        };
        let result = (self.evaluator)(&frame);
        self.intercept(scope, result)
    }

    /// Route a failure through the scope's handlers, recording where it passed.
    fn intercept(&self, scope: &Scope, result: Result<Value>) -> Result<Value> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = err.at(self.location.clone());
                if err.is_unhandled() || err.is_assertion() {
                    return Err(err);
                }
                scope.handle_error(err)
            }
        }
    }

    fn symbol(&self) -> &str {
        let def = ops::definition(self.op);
        def.symbol.or(def.keyword).unwrap_or(def.name)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            OpKind::Literal => match &self.literal {
                Some(Value::Str(s)) => write!(f, "{s:?}"),
                Some(value) => write!(f, "{value}"),
                None => f.write_str("void"),
            },
            OpKind::VarRef | OpKind::Builtin => f.write_str(self.name.as_deref().unwrap_or("?")),
            OpKind::Positional => write!(f, "${}", self.name.as_deref().unwrap_or("?")),
            OpKind::Script => {
                for (i, child) in self.children.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{child}")?;
                }
                Ok(())
            }
            _ => {
                write!(f, "({}", self.symbol())?;
                if let Some(name) = &self.name {
                    write!(f, " {name}")?;
                }
                for child in &self.children {
                    write!(f, " {child}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("location", &self.location.to_string())
            .field("tree", &self.to_string())
            .finish()
    }
}

/// What an evaluator sees of the node being evaluated.
pub struct Frame<'a> {
    pub node: &'a Node,
    pub scope: &'a Scope,
    pub parallel: bool,
}

impl<'a> Frame<'a> {
    pub fn child(&self, index: usize) -> Result<&'a Arc<Node>> {
        self.node.children.get(index).ok_or_else(|| {
            ScriptError::runtime(format!(
                "{} is missing operand {index}",
                ops::definition(self.node.op).name
            ))
        })
    }

    pub fn fix(&self, index: usize, depth: usize) -> Result<Value> {
        self.child(index)?.fix(self.scope, depth, self.parallel)
    }

    pub fn fix_deep(&self, index: usize) -> Result<Value> {
        self.child(index)?.fix_deep(self.scope, self.parallel)
    }

    /// The operand as an unevaluated value bound to this frame's scope.
    pub fn thunk(&self, index: usize) -> Result<Value> {
        let child = self.child(index)?;
        Ok(match child.literal() {
            Some(value) if child.op == OpKind::Literal => value.clone(),
            _ => Value::Lazy(Thunk::new(Arc::clone(child), self.scope.clone())),
        })
    }

    pub fn name(&self) -> Result<&'a str> {
        self.node.name().ok_or_else(|| {
            ScriptError::runtime(format!(
                "{} node has no name",
                ops::definition(self.node.op).name
            ))
        })
    }

    pub fn context(&self) -> &'a Arc<Context> {
        self.scope.context()
    }

    /// Key under which listeners registered by this node live. Blocks, loops
    /// and calls share their enclosing root, module or instance, so running
    /// them again re-registers rather than piling up listeners.
    pub fn listener_id(&self) -> String {
        format!("{}@{}", self.node.id, self.scope.anchor().id())
    }
}

/// A node paired with the scope it must be evaluated in.
#[derive(Clone)]
pub struct Thunk {
    node: Arc<Node>,
    scope: Scope,
}

impl Thunk {
    pub fn new(node: Arc<Node>, scope: Scope) -> Self {
        Thunk { node, scope }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn force(&self, depth: usize, parallel: bool) -> Result<Value> {
        self.node.fix(&self.scope, depth, parallel)
    }

    /// Evaluate the node in another scope, typically a child of the captured
    /// one carrying call parameters.
    pub fn force_in(&self, scope: &Scope, depth: usize, parallel: bool) -> Result<Value> {
        self.node.fix(scope, depth, parallel)
    }

    pub fn same(&self, other: &Thunk) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.scope.ptr_eq(&other.scope)
    }
}
