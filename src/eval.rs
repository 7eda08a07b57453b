//! Evaluators for every kind of node.
//!
//! The parser decides the shape of the graph; the functions here build each
//! node together with the closure that computes its value. Operands are
//! forced only as far as the construct needs them.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::{
    error::{ErrorKind, Result, ScriptError},
    exec,
    lex::Location,
    module::Pipeable,
    node::{Frame, Node, Thunk},
    ops::{self, OpEval, OpKind, OperatorDefinition},
    scope::{Binding, ClassDef, Scope, VarFlags},
    system,
    value::{Range, Value},
};

/// A nested scope for a construct, pure when the construct or its
/// surroundings are.
fn nested(frame: &Frame<'_>, name: &str) -> Result<Scope> {
    frame
        .scope
        .child(name, frame.scope.is_pure() || frame.node.is_pure())
}

fn learn(frame: &Frame<'_>, operation: &str, args: &[&Value], result: &Value) {
    let context = frame.context();
    if context.config().learn_types {
        let types: Vec<&str> = args.iter().map(|value| value.type_name()).collect();
        context
            .learner()
            .learn(operation, &types, result.type_name());
    }
}

pub(crate) fn script(statements: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Script, location, pure)
        .children(statements)
        .evaluator(|frame| sequence(frame, frame.scope))
}

/// Evaluate every child in `scope`, yielding the last value.
fn sequence(frame: &Frame<'_>, scope: &Scope) -> Result<Value> {
    let mut last = Value::Void;
    for statement in frame.node.children() {
        last = statement.fix(scope, 1, frame.parallel)?;
    }
    Ok(last)
}

pub(crate) fn literal(value: Value, location: Location, pure: bool) -> Arc<Node> {
    let result = value.clone();
    Node::build(OpKind::Literal, location, pure)
        .literal(value)
        .evaluator(move |_| Ok(result.clone()))
}

pub(crate) fn variable(name: &str, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::VarRef, location, pure)
        .name(name)
        .evaluator(|frame| {
            let value = frame.scope.get(frame.name()?, true)?;
            value.fix(1, frame.parallel)
        })
}

/// `$1`, `$2`, ... and `$*`.
pub(crate) fn positional(name: &str, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Positional, location, pure)
        .name(name)
        .evaluator(|frame| {
            let value = frame.scope.parameter_value(frame.name()?)?;
            value.fix(1, frame.parallel)
        })
}

/// `$(expr)`: the variable whose name `expr` evaluates to.
pub(crate) fn dynamic_variable(name: Arc<Node>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::DynamicVar, location, pure)
        .child(name)
        .evaluator(|frame| {
            let key = frame.fix_deep(0)?.to_string();
            frame.scope.get(&key, true)?.fix(1, frame.parallel)
        })
}

pub(crate) fn builtin_call(
    name: &str,
    args: Vec<Arc<Node>>,
    location: Location,
    pure: bool,
) -> Arc<Node> {
    Node::build(OpKind::Builtin, location, pure)
        .name(name)
        .children(args)
        .evaluator(|frame| {
            let args = (0..frame.node.children().len())
                .map(|i| frame.fix_deep(i))
                .collect::<Result<Vec<_>>>()?;
            frame
                .context()
                .builtins()
                .execute(frame.name()?, frame.scope, &args)
        })
}

/// `5 minutes` and friends, measured in seconds.
pub(crate) fn unit(name: &str, count: Arc<Node>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Unit, location, pure)
        .name(name)
        .child(count)
        .evaluator(|frame| system::apply_unit(frame.name()?, &frame.fix_deep(0)?))
}

pub(crate) fn block(statements: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Block, location, pure)
        .children(statements)
        .evaluator(|frame| {
            let scope = nested(frame, "block")?;
            sequence(frame, &scope)
        })
}

pub(crate) fn list(items: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::List, location, pure)
        .children(items)
        .evaluator(|frame| {
            let items = (0..frame.node.children().len())
                .map(|i| frame.thunk(i))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::list(items))
        })
}

/// Children alternate key, value. Keys are forced, values stay lazy.
pub(crate) fn map(entries: Vec<(Arc<Node>, Arc<Node>)>, location: Location, pure: bool) -> Arc<Node> {
    let children = entries
        .into_iter()
        .flat_map(|(key, value)| [key, value])
        .collect();
    Node::build(OpKind::Map, location, pure)
        .children(children)
        .evaluator(|frame| {
            let mut entries = IndexMap::new();
            for i in (0..frame.node.children().len()).step_by(2) {
                let key = frame.fix_deep(i)?.to_string();
                entries.insert(key, frame.thunk(i + 1)?);
            }
            Ok(Value::map(entries))
        })
}

pub(crate) fn range(
    lower: Option<Arc<Node>>,
    upper: Option<Arc<Node>>,
    closed_lower: bool,
    closed_upper: bool,
    location: Location,
    pure: bool,
) -> Arc<Node> {
    let has_lower = lower.is_some();
    let has_upper = upper.is_some();
    Node::build(OpKind::Range, location, pure)
        .children(lower.into_iter().chain(upper).collect())
        .evaluator(move |frame| {
            let bound = |index: usize| -> Result<i64> {
                let value = frame.fix_deep(index)?;
                value.as_int().ok_or_else(|| {
                    ScriptError::runtime(format!("range bounds must be integers, not {value}"))
                })
            };
            let lower = has_lower.then(|| bound(0)).transpose()?;
            let upper = has_upper
                .then(|| bound(usize::from(has_lower)))
                .transpose()?;
            Ok(Value::Range(Range::new(
                lower,
                upper,
                closed_lower,
                closed_upper,
            )?))
        })
}

/// Everything a declaration statement can say about the variable it binds.
pub(crate) struct Declaration {
    pub name: String,
    pub value: Arc<Node>,
    /// Store the expression itself rather than its value.
    pub lazy: bool,
    pub flags: VarFlags,
    pub constraint: Option<Arc<Node>>,
    pub label: Option<String>,
}

/// `name = expr` fixes the value now; `name := expr` and `def` store the
/// expression and re-announce `name` whenever something it reads changes.
pub(crate) fn declaration(decl: Declaration, location: Location, pure: bool) -> Arc<Node> {
    let Declaration {
        name,
        value,
        lazy,
        flags,
        constraint,
        label,
    } = decl;
    let op = if lazy {
        OpKind::Define
    } else if flags == VarFlags::default() && constraint.is_none() && label.is_none() {
        OpKind::Assign
    } else {
        OpKind::Declaration
    };
    let has_constraint = constraint.is_some();
    Node::build(op, location, pure)
        .name(name)
        .child(value)
        .extend(constraint)
        .evaluator(move |frame| {
            let name = frame.name()?;
            let source = frame.child(0)?;
            let binding = Binding {
                flags: VarFlags {
                    pure: flags.pure || frame.node.is_pure() || frame.scope.is_pure(),
                    ..flags
                },
                constraint: if has_constraint {
                    Some(frame.thunk(1)?)
                } else {
                    None
                },
                label: label.clone(),
            };

            if lazy {
                let thunk = Value::Lazy(Thunk::new(Arc::clone(source), frame.scope.clone()));
                frame.scope.set(name, thunk, binding)?;
                track_dependencies(frame, name, source)?;
                return Ok(Value::Void);
            }

            let value = source.fix_deep(frame.scope, frame.parallel)?;
            if let Some(label) = &label {
                check_prediction(frame, name, source, label, &value);
            }
            frame.scope.set(name, value.clone(), binding)?;
            Ok(value)
        })
}

/// Re-notify listeners of `name` whenever a variable read by `source`
/// changes. Variables that do not exist yet are skipped.
fn track_dependencies(frame: &Frame<'_>, name: &str, source: &Node) -> Result<()> {
    let id = format!("{}:{name}", frame.listener_id());
    let scope = frame.scope.clone();
    let target = name.to_string();
    let callback: Arc<dyn Pipeable> = Arc::new(move |_: &[Value]| {
        scope.notify(&target)?;
        Ok(Value::Void)
    });
    for key in source.dependencies() {
        if key == name {
            continue;
        }
        listen_or_skip(frame.scope, &key, &id, Arc::clone(&callback))?;
    }
    Ok(())
}

fn listen_or_skip(scope: &Scope, key: &str, id: &str, callback: Arc<dyn Pipeable>) -> Result<()> {
    match scope.listen(key, id, callback) {
        Err(err) if err.kind() == ErrorKind::VariableNotFound => {
            debug!(key, listener = id, "not listening to an undefined variable");
            Ok(())
        }
        other => other,
    }
}

fn check_prediction(frame: &Frame<'_>, name: &str, source: &Node, label: &str, value: &Value) {
    let context = frame.context();
    if !context.config().learn_types {
        return;
    }
    let operation = ops::definition(source.op()).name;
    let prediction = context.learner().predict(operation, &[]);
    if prediction.total() > 0 && prediction.probability(label) < 0.5 {
        debug!(
            variable = name,
            declared = label,
            usually = prediction.probable_type().unwrap_or("?"),
            "declared type is unusual for this expression"
        );
    }
    context
        .learner()
        .learn(operation, &[], value.type_name());
}

/// `target[key] = value` and `target.key = value`.
pub(crate) fn assign_element(
    name: &str,
    key: Arc<Node>,
    value: Arc<Node>,
    location: Location,
    pure: bool,
) -> Arc<Node> {
    Node::build(OpKind::Assign, location, pure)
        .name(name)
        .children(vec![key, value])
        .evaluator(|frame| {
            let name = frame.name()?;
            let key = frame.fix_deep(0)?;
            let value = frame.fix_deep(1)?;
            let updated = match frame.scope.get(name, true)?.fix(1, frame.parallel)? {
                Value::Uri(resource) => return resource.set(&key, value),
                Value::Map(map) => {
                    let mut map = map.as_ref().clone();
                    map.insert(key.to_string(), value.clone());
                    Value::map(map)
                }
                Value::List(items) => {
                    let mut items = items.as_ref().clone();
                    let len = items.len() as i64;
                    let index = key
                        .as_int()
                        .map(|i| if i < 0 { len + i } else { i })
                        .and_then(|i| usize::try_from(i).ok())
                        .filter(|i| *i < items.len())
                        .ok_or_else(|| {
                            ScriptError::runtime(format!("index {key} is out of bounds"))
                        })?;
                    items[index] = value.clone();
                    Value::list(items)
                }
                other => {
                    return Err(ScriptError::runtime(format!(
                        "cannot assign into a value of type {}",
                        other.type_name()
                    )));
                }
            };
            frame.scope.assign(name, updated)?;
            Ok(value)
        })
}

/// Binary operators, short-circuiting and the reactive and resource
/// infix constructs.
pub(crate) fn infix(
    def: &'static OperatorDefinition,
    lhs: Arc<Node>,
    rhs: Arc<Node>,
    location: Location,
    pure: bool,
) -> Result<Arc<Node>> {
    let builder = Node::build(def.kind, location.clone(), pure).children(vec![lhs, rhs]);
    if let OpEval::Binary(apply) = def.eval {
        return Ok(builder.evaluator(move |frame| {
            let a = frame.fix_deep(0)?;
            let b = frame.fix_deep(1)?;
            let result = apply(&a, &b)?;
            learn(frame, def.name, &[&a, &b], &result);
            Ok(result)
        }));
    }
    Ok(match def.kind {
        OpKind::And => builder.evaluator(|frame| {
            if !frame.fix_deep(0)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(frame.fix_deep(1)?.truthy()))
        }),
        OpKind::Or => builder.evaluator(|frame| {
            if frame.fix_deep(0)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(frame.fix_deep(1)?.truthy()))
        }),
        OpKind::Else => builder.evaluator(|frame| match frame.fix(0, 1)? {
            Value::Bool(false) => frame.fix(1, 1),
            value => Ok(value),
        }),
        OpKind::Pair => builder.evaluator(|frame| {
            let key = frame.fix_deep(0)?.to_string();
            Ok(Value::map(IndexMap::from([(key, frame.thunk(1)?)])))
        }),
        OpKind::Pipe => builder.evaluator(|frame| {
            let input = frame.fix(0, 1)?;
            let target = frame.child(1)?;
            if target.op() == OpKind::VarRef
                && let Some(name) = target.name()
                && !frame.scope.has(name)
                && frame.context().builtins().exists(name)
            {
                let input = input.fix_deep(frame.parallel)?;
                return frame
                    .context()
                    .builtins()
                    .execute(name, frame.scope, &[input]);
            }
            let callee = callee(frame, 1)?;
            call_value(&callee, vec![input], Vec::new(), frame.parallel)?.fix(1, frame.parallel)
        }),
        OpKind::Each => builder.evaluator(each),
        OpKind::Reduce => builder.evaluator(reduce),
        OpKind::AssertEqReactive | OpKind::AssertEqFixed => builder.evaluator(|frame| {
            let a = frame.fix_deep(0)?;
            let b = frame.fix_deep(1)?;
            if a != b {
                return Err(ScriptError::assertion(format!(
                    "{} evaluated to {a:?} but {} evaluated to {b:?}",
                    frame.child(0)?,
                    frame.child(1)?
                )));
            }
            Ok(Value::Bool(true))
        }),
        OpKind::When => builder.evaluator(|frame| {
            let cond = Arc::clone(frame.child(0)?);
            let body = Arc::clone(frame.child(1)?);
            when(frame, cond, body)
        }),
        OpKind::Causes => builder.evaluator(causes),
        OpKind::Write => builder.evaluator(|frame| {
            let value = frame.fix_deep(0)?;
            resource(frame, 1)?.write(value, false, true)
        }),
        OpKind::Publish => builder.evaluator(|frame| {
            let value = frame.fix_deep(0)?;
            resource(frame, 1)?.publish(value)
        }),
        OpKind::Subscribe => builder.evaluator(subscribe),
        _ => {
            return Err(ScriptError::parse(
                format!("`{def}` cannot be used between two operands"),
                location,
            ));
        }
    })
}

/// `list each body`: `body` once per item with the item as `$1` and its
/// index as `$2`. Items are evaluated on the worker pool when parallel.
fn each(frame: &Frame<'_>) -> Result<Value> {
    let items: Vec<(usize, Value)> = frame
        .fix(0, 1)?
        .to_items()?
        .into_iter()
        .enumerate()
        .collect();
    let body = frame.child(1)?;
    let run = |(index, item): &(usize, Value)| -> Result<Value> {
        let scope = nested(frame, "each")?;
        scope.parameter("1", item.fix(1, frame.parallel)?)?;
        scope.parameter("2", Value::Int(*index as i64))?;
        body.fix(&scope, 1, frame.parallel)
    };
    let results = if frame.parallel {
        frame.context().pool().map_ordered(&items, run)?
    } else {
        items.iter().map(run).collect::<Result<Vec<_>>>()?
    };
    Ok(Value::list(results))
}

/// `list reduce body`: folds with the accumulator as `$1` and the next item
/// as `$2`.
fn reduce(frame: &Frame<'_>) -> Result<Value> {
    let mut items = frame.fix(0, 1)?.to_items()?.into_iter();
    let Some(first) = items.next() else {
        return Ok(Value::Void);
    };
    let body = frame.child(1)?;
    let mut acc = first.fix(1, frame.parallel)?;
    for item in items {
        let scope = nested(frame, "reduce")?;
        scope.parameter("1", acc)?;
        scope.parameter("2", item.fix(1, frame.parallel)?)?;
        acc = body.fix(&scope, 1, frame.parallel)?;
    }
    Ok(acc)
}

/// Run `body` now if `cond` holds, and again every time a variable `cond`
/// reads changes while it holds.
fn when(frame: &Frame<'_>, cond: Arc<Node>, body: Arc<Node>) -> Result<Value> {
    let scope = frame.scope.clone();
    let (check, action) = (Arc::clone(&cond), Arc::clone(&body));
    let callback: Arc<dyn Pipeable> = Arc::new(move |_: &[Value]| {
        if check.fix_deep(&scope, false)?.truthy() {
            action.fix(&scope, 1, false)?;
        }
        Ok(Value::Void)
    });
    let id = frame.listener_id();
    for key in cond.dependencies() {
        listen_or_skip(frame.scope, &key, &id, Arc::clone(&callback))?;
    }
    if cond.fix_deep(frame.scope, frame.parallel)?.truthy() {
        return body.fix(frame.scope, 1, frame.parallel);
    }
    Ok(Value::Void)
}

/// `expr => body`: run `body` whenever a variable `expr` reads changes.
fn causes(frame: &Frame<'_>) -> Result<Value> {
    let scope = frame.scope.clone();
    let body = Arc::clone(frame.child(1)?);
    let callback: Arc<dyn Pipeable> = Arc::new(move |_: &[Value]| {
        body.fix(&scope, 1, false)?;
        Ok(Value::Void)
    });
    let id = frame.listener_id();
    for key in frame.child(0)?.dependencies() {
        listen_or_skip(frame.scope, &key, &id, Arc::clone(&callback))?;
    }
    Ok(Value::Void)
}

fn resource(frame: &Frame<'_>, index: usize) -> Result<Arc<crate::resource::Resource>> {
    match frame.fix(index, 1)? {
        Value::Uri(resource) => Ok(resource),
        other => Err(ScriptError::runtime(format!(
            "expected a resource, found {}",
            other.type_name()
        ))),
    }
}

/// `uri <* body`: `body` runs with each published value as `$1`.
fn subscribe(frame: &Frame<'_>) -> Result<Value> {
    let resource = resource(frame, 0)?;
    let scope = frame.scope.clone();
    let body = Arc::clone(frame.child(1)?);
    let pure = frame.node.is_pure();
    let callback: Arc<dyn Pipeable> = Arc::new(move |values: &[Value]| {
        let delivery = scope.child("subscription", scope.is_pure() || pure)?;
        delivery.parameter("1", values.first().cloned().unwrap_or_default())?;
        body.fix(&delivery, 1, false)
    });
    resource.subscribe(&frame.listener_id(), callback)?;
    Ok(Value::Void)
}

/// Prefix operators taking a single operand.
pub(crate) fn prefix(
    def: &'static OperatorDefinition,
    operand: Arc<Node>,
    location: Location,
    pure: bool,
) -> Result<Arc<Node>> {
    let builder = Node::build(def.kind, location.clone(), pure).child(operand);
    if let OpEval::Unary(apply) = def.eval {
        return Ok(builder.evaluator(move |frame| {
            let value = frame.fix(0, 1)?;
            let result = apply(&value)?;
            learn(frame, def.name, &[&value], &result);
            Ok(result)
        }));
    }
    Ok(match def.kind {
        OpKind::Print => builder.evaluator(|frame| {
            let value = frame.fix_deep(0)?;
            println!("{value}");
            Ok(value)
        }),
        OpKind::Err => builder.evaluator(|frame| {
            let value = frame.fix_deep(0)?;
            eprintln!("{value}");
            Ok(value)
        }),
        OpKind::Debug => builder.evaluator(|frame| {
            let value = frame.fix_deep(0)?;
            debug!(target: "ripple::script", "{value}");
            Ok(value)
        }),
        OpKind::Fix | OpKind::Serial => builder.evaluator(|frame| {
            frame.child(0)?.fix_deep(frame.scope, false)
        }),
        OpKind::Parallel => builder.evaluator(|frame| frame.child(0)?.fix_deep(frame.scope, true)),
        OpKind::Pure => builder.evaluator(|frame| {
            let scope = frame.scope.child("pure", true)?;
            frame.child(0)?.fix(&scope, 1, frame.parallel)
        }),
        OpKind::Fork => builder.evaluator(|frame| {
            let node = Arc::clone(frame.child(0)?);
            let scope = frame.scope.clone();
            let handle = frame
                .context()
                .pool()
                .fork(move || node.fix_deep(&scope, false));
            Ok(Value::Fork(handle))
        }),
        OpKind::Error => builder.evaluator(|frame| {
            frame.scope.add_error_handler(frame.thunk(0)?)?;
            Ok(Value::Void)
        }),
        OpKind::Read => builder.evaluator(|frame| resource(frame, 0)?.read(false, true)),
        OpKind::Start => builder.evaluator(|frame| {
            resource(frame, 0)?.start()?;
            Ok(Value::Void)
        }),
        OpKind::Stop => builder.evaluator(|frame| {
            resource(frame, 0)?.stop()?;
            Ok(Value::Void)
        }),
        OpKind::Pause => builder.evaluator(|frame| {
            resource(frame, 0)?.pause()?;
            Ok(Value::Void)
        }),
        OpKind::Unpause => builder.evaluator(|frame| {
            resource(frame, 0)?.unpause()?;
            Ok(Value::Void)
        }),
        OpKind::Destroy => builder.evaluator(|frame| {
            resource(frame, 0)?.destroy()?;
            Ok(Value::Void)
        }),
        OpKind::State => {
            builder.evaluator(|frame| Ok(Value::str(resource(frame, 0)?.state().to_string())))
        }
        _ => {
            return Err(ScriptError::parse(
                format!("`{def}` cannot be used as a prefix operator"),
                location,
            ));
        }
    })
}

/// `x++`, `x--`. A variable operand is updated in place.
pub(crate) fn step(
    def: &'static OperatorDefinition,
    operand: Arc<Node>,
    location: Location,
    pure: bool,
) -> Result<Arc<Node>> {
    let OpEval::Unary(apply) = def.eval else {
        return Err(ScriptError::parse(
            format!("`{def}` is not a postfix operator"),
            location,
        ));
    };
    Ok(Node::build(def.kind, location, pure)
        .child(operand)
        .evaluator(move |frame| {
            let next = apply(&frame.fix(0, 1)?)?;
            let target = frame.child(0)?;
            if target.op() == OpKind::VarRef
                && let Some(name) = target.name()
            {
                frame.scope.assign(name, next.clone())?;
            }
            Ok(next)
        }))
}

/// `expr as Type`.
pub(crate) fn cast(operand: Arc<Node>, type_name: &str, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Cast, location, pure)
        .name(type_name)
        .child(operand)
        .evaluator(|frame| {
            let value = frame.fix_deep(0)?;
            match frame.name()? {
                "Uri" => match value {
                    Value::Uri(_) => Ok(value),
                    other => Ok(Value::Uri(
                        frame.context().resources().open(&other.to_string())?,
                    )),
                },
                name => value.cast(name),
            }
        })
}

/// `expr is Type`.
pub(crate) fn is(operand: Arc<Node>, type_name: &str, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Is, location, pure)
        .name(type_name)
        .child(operand)
        .evaluator(|frame| Ok(Value::Bool(frame.fix_deep(0)?.is_type(frame.name()?)?)))
}

pub(crate) fn member(target: Arc<Node>, key: &str, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Member, location, pure)
        .name(key)
        .child(target)
        .evaluator(|frame| {
            let target = frame.fix(0, 1)?;
            target
                .get(&Value::str(frame.name()?))?
                .fix(1, frame.parallel)
        })
}

pub(crate) fn subscript(target: Arc<Node>, index: Arc<Node>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Subscript, location, pure)
        .children(vec![target, index])
        .evaluator(|frame| {
            let target = frame.fix(0, 1)?;
            let index = frame.fix_deep(1)?;
            target.get(&index)?.fix(1, frame.parallel)
        })
}

/// The callable at `index` without forcing it: a variable holding an
/// expression, or a member of a map or class instance.
fn callee(frame: &Frame<'_>, index: usize) -> Result<Value> {
    let node = frame.child(index)?;
    match (node.op(), node.name()) {
        (OpKind::VarRef, Some(name)) => frame.scope.get(name, true),
        (OpKind::Member, Some(key)) => {
            let target = node.children()[0].fix(frame.scope, 1, frame.parallel)?;
            target.get(&Value::str(key))
        }
        _ => frame.fix(index, 1),
    }
}

/// Arguments at `start..`, split into positional and named ones.
fn arguments(frame: &Frame<'_>, start: usize) -> Result<(Vec<Value>, Vec<(String, Value)>)> {
    let mut positional = Vec::new();
    let mut named = Vec::new();
    for arg in &frame.node.children()[start..] {
        let value = arg.fix(frame.scope, 1, frame.parallel)?;
        match arg.named_parameter() {
            Some(name) => named.push((name.to_string(), value)),
            None => positional.push(value),
        }
    }
    Ok((positional, named))
}

/// Invoke a callable value.
///
/// A stored expression runs in a fresh child of the scope it was defined in,
/// with the arguments bound as `$1..$n`, all of them as `$*` and named
/// arguments under their names.
pub(crate) fn call_value(
    callee: &Value,
    args: Vec<Value>,
    named: Vec<(String, Value)>,
    parallel: bool,
) -> Result<Value> {
    match callee {
        Value::Lazy(thunk) => {
            let definition = thunk.scope();
            let scope = definition.child("call", definition.is_pure() || thunk.node().is_pure())?;
            for (i, arg) in args.iter().enumerate() {
                scope.parameter(&(i + 1).to_string(), arg.clone())?;
            }
            scope.parameter("*", Value::list(args))?;
            for (name, value) in named {
                scope.parameter(&name, value)?;
            }
            thunk.force_in(&scope, 1, parallel)
        }
        Value::Function(function) => {
            let mut args = args;
            if !named.is_empty() {
                args.push(Value::map(named.into_iter().collect()));
            }
            function.invoke(&args)
        }
        other => Err(ScriptError::runtime(format!(
            "a value of type {} cannot be called",
            other.type_name()
        ))),
    }
}

/// `callee(args)`; child 0 is the callee.
pub(crate) fn call(callee_node: Arc<Node>, args: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Call, location, pure)
        .child(callee_node)
        .extend(args)
        .evaluator(|frame| {
            let target = callee(frame, 0)?;
            let (args, named) = arguments(frame, 1)?;
            call_value(&target, args, named, frame.parallel)?.fix(1, frame.parallel)
        })
}

pub(crate) fn if_then(cond: Arc<Node>, body: Arc<Node>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::If, location, pure)
        .children(vec![cond, body])
        .evaluator(|frame| {
            if frame.fix_deep(0)?.truthy() {
                frame.fix(1, 1)
            } else {
                Ok(Value::Bool(false))
            }
        })
}

pub(crate) fn while_loop(cond: Arc<Node>, body: Arc<Node>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::While, location, pure)
        .children(vec![cond, body])
        .evaluator(|frame| {
            let mut last = Value::Void;
            while frame.fix_deep(0)?.truthy() {
                last = frame.fix(1, 1)?;
            }
            Ok(last)
        })
}

pub(crate) fn for_loop(
    name: &str,
    iterable: Arc<Node>,
    body: Arc<Node>,
    location: Location,
    pure: bool,
) -> Arc<Node> {
    Node::build(OpKind::For, location, pure)
        .name(name)
        .children(vec![iterable, body])
        .evaluator(|frame| {
            let name = frame.name()?;
            let body = frame.child(1)?;
            let mut last = Value::Void;
            for item in frame.fix(0, 1)?.to_items()? {
                let scope = nested(frame, "for")?;
                scope.parameter(name, item.fix(1, frame.parallel)?)?;
                last = body.fix(&scope, 1, frame.parallel)?;
            }
            Ok(last)
        })
}

/// `when cond body`, the prefix spelling of `cond ? body`.
pub(crate) fn when_prefix(cond: Arc<Node>, body: Arc<Node>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::WhenPrefix, location, pure)
        .children(vec![cond, body])
        .evaluator(|frame| {
            let cond = Arc::clone(frame.child(0)?);
            let body = Arc::clone(frame.child(1)?);
            when(frame, cond, body)
        })
}

/// `assert [message :] cond`.
pub(crate) fn assert(
    message: Option<Arc<Node>>,
    cond: Arc<Node>,
    location: Location,
    pure: bool,
) -> Arc<Node> {
    let has_message = message.is_some();
    Node::build(OpKind::Assert, location, pure)
        .children(message.into_iter().chain([cond]).collect())
        .evaluator(move |frame| {
            let cond_index = usize::from(has_message);
            if frame.fix_deep(cond_index)?.truthy() {
                return Ok(Value::Bool(true));
            }
            let message = if has_message {
                frame.fix_deep(0)?.to_string()
            } else {
                format!("assertion failed: {}", frame.child(cond_index)?)
            };
            Err(ScriptError::assertion(message))
        })
}

/// Schedule parts of `every period [until c] [unless c] body`.
pub(crate) struct Every {
    pub period: Arc<Node>,
    pub until: Option<Arc<Node>>,
    pub unless: Option<Arc<Node>>,
    pub body: Arc<Node>,
}

/// Fire `body` every `period` seconds on the scheduler, with the firing
/// count as `$1`. Yields the schedule id.
pub(crate) fn every(every: Every, location: Location, pure: bool) -> Arc<Node> {
    let Every {
        period,
        until,
        unless,
        body,
    } = every;
    Node::build(OpKind::Every, location, pure)
        .children(vec![Arc::clone(&period), Arc::clone(&body)])
        .extend(until.clone())
        .extend(unless.clone())
        .evaluator(move |frame| {
            let period = exec::seconds(&frame.fix_deep(0)?)?;
            let scope = frame.scope.clone();
            let pure = frame.node.is_pure();
            let (body, until, unless) = (Arc::clone(&body), until.clone(), unless.clone());
            let count = AtomicI64::new(0);
            let id = frame.context().scheduler().schedule(period, move |id| {
                let firing = count.fetch_add(1, Ordering::SeqCst) + 1;
                let tick = scope.child("every", scope.is_pure() || pure)?;
                tick.parameter("1", Value::Int(firing))?;
                if let Some(until) = &until
                    && until.fix_deep(&tick, false)?.truthy()
                {
                    scope.context().scheduler().cancel(id);
                    return Ok(());
                }
                if let Some(unless) = &unless
                    && unless.fix_deep(&tick, false)?.truthy()
                {
                    return Ok(());
                }
                body.fix(&tick, 1, false)?;
                Ok(())
            })?;
            Ok(Value::Int(id as i64))
        })
}

/// `module "scheme:path" [with] (name = expr, ...)`.
pub(crate) fn module(uri: Arc<Node>, args: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Module, location, pure)
        .child(uri)
        .extend(args)
        .evaluator(|frame| {
            let uri = frame.fix_deep(0)?.to_string();
            let (_, named) = arguments(frame, 1)?;
            let mut params = IndexMap::new();
            for (name, value) in named {
                params.insert(name, value.fix_deep(frame.parallel)?);
            }
            info!(module = %uri, "loading module");
            let module = frame.context().modules().resolve(&uri, frame.scope)?;
            module.invoke(&[Value::map(params)])
        })
}

/// `class Name { ... }` remembers the body for later `new Name(...)`.
pub(crate) fn class(name: &str, body: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::Class, location, pure)
        .name(name)
        .children(body)
        .evaluator(|frame| {
            frame.scope.register_class(ClassDef {
                name: frame.name()?.to_string(),
                body: frame.node.children().to_vec(),
            })?;
            Ok(Value::Void)
        })
}

/// `new Name(name = value, ...)`: the class body runs in a fresh class scope,
/// then the named arguments override its members. Yields the members.
pub(crate) fn new_instance(name: &str, args: Vec<Arc<Node>>, location: Location, pure: bool) -> Arc<Node> {
    Node::build(OpKind::New, location, pure)
        .name(name)
        .children(args)
        .evaluator(|frame| {
            let name = frame.name()?;
            let (_, named) = arguments(frame, 0)?;
            let (defined_in, class) = frame.scope.class(name)?;
            let instance = defined_in.class_child(name)?;
            for statement in &class.body {
                statement.fix(&instance, 1, frame.parallel)?;
            }
            for (key, value) in named {
                instance.assign(&key, value)?;
            }
            Ok(Value::map(instance.locals()))
        })
}
