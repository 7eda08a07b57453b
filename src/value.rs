use std::{cmp::Ordering, fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    error::{ErrorKind, Result, ScriptError},
    exec::ForkHandle,
    module::Pipeable,
    node::Thunk,
    resource::Resource,
    runtime::Context,
};

/// Every type name usable with `as` and `is`.
pub const TYPE_NAMES: &[&str] = &[
    "Any", "Void", "Boolean", "Integer", "Decimal", "String", "List", "Map", "Range", "Uri",
    "Error", "Function", "Fork",
];

/// The dynamically typed result of evaluating a node.
///
/// Collections hold their elements lazily until a deep enough `fix` forces
/// them, so a list literal built from variables keeps referring to the scope
/// it was written in.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Void,
    Bool(bool),
    Int(i64),
    Decimal(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<IndexMap<String, Value>>),
    Range(Range),
    Lazy(Thunk),
    Fork(Arc<ForkHandle>),
    Uri(Arc<Resource>),
    Function(Arc<dyn Pipeable>),
    Error(Arc<ScriptError>),
}

/// Largest range `to_list` will materialise.
pub const MAX_RANGE_ITEMS: usize = 1 << 24;

/// An integer interval with independently open or closed ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
    pub closed_lower: bool,
    pub closed_upper: bool,
}

impl Range {
    pub fn new(
        lower: Option<i64>,
        upper: Option<i64>,
        closed_lower: bool,
        closed_upper: bool,
    ) -> Result<Self> {
        if let (Some(l), Some(u)) = (lower, upper)
            && l == u
            && !closed_lower
            && !closed_upper
        {
            return Err(ScriptError::runtime(format!(
                "the open range ({l}..{u}) is empty"
            )));
        }
        Ok(Range {
            lower,
            upper,
            closed_lower,
            closed_upper,
        })
    }

    fn first(&self) -> Option<i128> {
        self.lower
            .map(|l| i128::from(l) + i128::from(!self.closed_lower))
    }

    fn last(&self) -> Option<i128> {
        self.upper
            .map(|u| i128::from(u) - i128::from(!self.closed_upper))
    }

    pub fn contains(&self, n: i64) -> bool {
        let n = i128::from(n);
        self.first().is_none_or(|first| n >= first) && self.last().is_none_or(|last| n <= last)
    }

    /// Number of integers in the range, `None` when either end is unbounded.
    fn count(&self) -> Option<i128> {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => Some((last - first + 1).max(0)),
            _ => None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        self.count().and_then(|count| usize::try_from(count).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.count() == Some(0)
    }

    pub fn size(&self) -> Result<usize> {
        let count = self
            .count()
            .ok_or_else(|| ScriptError::runtime(format!("the range {self} is unbounded")))?;
        usize::try_from(count)
            .map_err(|_| ScriptError::runtime(format!("the range {self} is too large to measure")))
    }

    pub fn to_list(&self) -> Result<Vec<Value>> {
        let (Some(first), Some(last)) = (self.first(), self.last()) else {
            return Err(ScriptError::runtime(format!(
                "cannot enumerate the unbounded range {self}"
            )));
        };
        let count = self.size()?;
        if count > MAX_RANGE_ITEMS {
            return Err(ScriptError::runtime(format!(
                "the range {self} has {count} items, more than the {MAX_RANGE_ITEMS} that can be enumerated"
            )));
        }
        // Both ends lie within i64 once the count is non-zero.
        let first = i64::try_from(first).unwrap_or(i64::MAX);
        let last = i64::try_from(last).unwrap_or(i64::MIN);
        Ok((first..=last).map(Value::Int).collect())
    }

    pub fn get(&self, index: i64) -> Result<Value> {
        let first = self
            .first()
            .ok_or_else(|| ScriptError::runtime("cannot index a range without a lower bound"))?;
        let n = i64::try_from(first + i128::from(index))
            .ok()
            .filter(|n| index >= 0 && self.contains(*n))
            .ok_or_else(|| ScriptError::runtime(format!("index {index} is outside {self}")))?;
        Ok(Value::Int(n))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.closed_lower { '[' } else { '(' };
        let close = if self.closed_upper { ']' } else { ')' };
        let bound = |b: Option<i64>| b.map(|b| b.to_string()).unwrap_or_default();
        write!(f, "{open}{}..{}{close}", bound(self.lower), bound(self.upper))
    }
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(items))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Arc::new(entries))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "Void",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Integer",
            Value::Decimal(_) => "Decimal",
            Value::Str(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Range(_) => "Range",
            Value::Lazy(_) | Value::Function(_) => "Function",
            Value::Fork(_) => "Fork",
            Value::Uri(_) => "Uri",
            Value::Error(_) => "Error",
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Void | Value::Error(_) => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Decimal(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Range(range) => !range.is_empty(),
            Value::Lazy(_) | Value::Fork(_) | Value::Uri(_) | Value::Function(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Decimal(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Decimal(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The items of anything that can be iterated over.
    pub fn to_items(&self) -> Result<Vec<Value>> {
        match self {
            Value::Void => Ok(Vec::new()),
            Value::List(items) => Ok(items.as_ref().clone()),
            Value::Range(range) => range.to_list(),
            Value::Map(map) => Ok(map
                .iter()
                .map(|(k, v)| Value::map(IndexMap::from([(k.clone(), v.clone())])))
                .collect()),
            other => Ok(vec![other.clone()]),
        }
    }

    /// Force this value to the given depth.
    ///
    /// Depth 1 forces only a lazy value itself; each further level forces one
    /// more layer of collection elements and awaits forked work.
    pub fn fix(&self, depth: usize, parallel: bool) -> Result<Value> {
        match self {
            Value::Lazy(thunk) => thunk.force(depth, parallel),
            Value::Fork(handle) if depth > 1 => handle.wait()?.fix(depth - 1, parallel),
            Value::List(items) if depth > 1 && items.iter().any(Value::needs_fix) => Ok(
                Value::list(fix_all(items, depth - 1, parallel)?),
            ),
            Value::Map(map) if depth > 1 && map.values().any(Value::needs_fix) => {
                let values: Vec<Value> = map.values().cloned().collect();
                let fixed = fix_all(&values, depth - 1, parallel)?;
                Ok(Value::map(map.keys().cloned().zip(fixed).collect()))
            }
            _ => Ok(self.clone()),
        }
    }

    pub fn fix_deep(&self, parallel: bool) -> Result<Value> {
        self.fix(usize::MAX, parallel)
    }

    fn needs_fix(&self) -> bool {
        match self {
            Value::Lazy(_) | Value::Fork(_) => true,
            Value::List(items) => items.iter().any(Value::needs_fix),
            Value::Map(map) => map.values().any(Value::needs_fix),
            _ => false,
        }
    }

    fn context(&self) -> Option<Arc<Context>> {
        match self {
            Value::Lazy(thunk) => Some(Arc::clone(thunk.scope().context())),
            _ => None,
        }
    }

    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).ok_or_else(|| {
                    ScriptError::runtime(format!("cannot compare {x} with {y}"))
                }),
                _ => Err(type_mismatch("compare", a, b)),
            },
        }
    }

    pub fn equal(&self, other: &Value) -> Result<Value> {
        Ok(Value::Bool(self == other))
    }

    pub fn not_equal(&self, other: &Value) -> Result<Value> {
        Ok(Value::Bool(self != other))
    }

    pub fn less(&self, other: &Value) -> Result<Value> {
        Ok(Value::Bool(self.compare(other)?.is_lt()))
    }

    pub fn greater(&self, other: &Value) -> Result<Value> {
        Ok(Value::Bool(self.compare(other)?.is_gt()))
    }

    pub fn less_equal(&self, other: &Value) -> Result<Value> {
        Ok(Value::Bool(self.compare(other)?.is_le()))
    }

    pub fn greater_equal(&self, other: &Value) -> Result<Value> {
        Ok(Value::Bool(self.compare(other)?.is_ge()))
    }

    pub fn add(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Str(a), b) => Ok(Value::str(format!("{a}{b}"))),
            (a, Value::Str(b)) if !matches!(a, Value::List(_)) => {
                Ok(Value::str(format!("{a}{b}")))
            }
            (Value::List(a), Value::List(b)) => {
                Ok(Value::list(a.iter().chain(b.iter()).cloned().collect()))
            }
            (Value::List(a), b) => {
                let mut items = a.as_ref().clone();
                items.push(b.clone());
                Ok(Value::list(items))
            }
            (Value::Map(a), Value::Map(b)) => {
                let mut merged = a.as_ref().clone();
                merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(Value::map(merged))
            }
            (Value::Void, b) => Ok(b.clone()),
            (a, Value::Void) => Ok(a.clone()),
            (a, b) => arithmetic("add", a, b, i64::checked_add, |x, y| x + y),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::List(a), b) => Ok(Value::list(
                a.iter().filter(|item| *item != b).cloned().collect(),
            )),
            (Value::Map(a), Value::Str(key)) => {
                let mut map = a.as_ref().clone();
                map.shift_remove(key.as_ref());
                Ok(Value::map(map))
            }
            (a, b) => arithmetic("subtract", a, b, i64::checked_sub, |x, y| x - y),
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Str(s), Value::Int(n)) if *n >= 0 => Ok(Value::str(s.repeat(*n as usize))),
            (Value::List(items), Value::Int(n)) if *n >= 0 => Ok(Value::list(
                std::iter::repeat_n(items.iter(), *n as usize)
                    .flatten()
                    .cloned()
                    .collect(),
            )),
            (a, b) => arithmetic("multiply", a, b, i64::checked_mul, |x, y| x * y),
        }
    }

    pub fn div(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (_, Value::Int(0)) => Err(ScriptError::runtime("Division by zero")),
            (Value::Int(a), Value::Int(b)) if a.checked_rem(*b) == Some(0) => a
                .checked_div(*b)
                .map(Value::Int)
                .ok_or_else(|| ScriptError::runtime("integer overflow in divide")),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Decimal(*a as f64 / *b as f64)),
            (a, b) => arithmetic("divide", a, b, |_, _| None, |x, y| x / y),
        }
    }

    pub fn rem(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (_, Value::Int(0)) => Err(ScriptError::runtime("Division by zero")),
            (a, b) => arithmetic("take the remainder of", a, b, i64::checked_rem, |x, y| x % y),
        }
    }

    pub fn negate(&self) -> Result<Value> {
        match self {
            Value::Int(n) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| ScriptError::runtime("integer overflow")),
            Value::Decimal(n) => Ok(Value::Decimal(-n)),
            Value::List(items) => Ok(Value::list(items.iter().rev().cloned().collect())),
            other => Err(ScriptError::runtime(format!(
                "cannot negate a value of type {}",
                other.type_name()
            ))),
        }
    }

    pub fn not(&self) -> Result<Value> {
        Ok(Value::Bool(!self.truthy()))
    }

    pub fn increment(&self) -> Result<Value> {
        self.add(&Value::Int(1))
    }

    pub fn decrement(&self) -> Result<Value> {
        self.sub(&Value::Int(1))
    }

    pub fn size(&self) -> Result<usize> {
        match self {
            Value::Void => Ok(0),
            Value::Str(s) => Ok(s.chars().count()),
            Value::List(items) => Ok(items.len()),
            Value::Map(map) => Ok(map.len()),
            Value::Range(range) => range.size(),
            Value::Uri(resource) => resource.size(),
            _ => Ok(1),
        }
    }

    pub fn size_of(&self) -> Result<Value> {
        let size = self.size()?;
        Ok(Value::Int(i64::try_from(size).unwrap_or(i64::MAX)))
    }

    /// `self in container`.
    pub fn member_of(&self, container: &Value) -> Result<Value> {
        Ok(Value::Bool(container.contains(self)?))
    }

    pub fn contains(&self, needle: &Value) -> Result<bool> {
        match self {
            Value::List(items) => Ok(items.contains(needle)),
            Value::Map(map) => Ok(map.contains_key(&needle.to_string())),
            Value::Str(s) => Ok(s.contains(needle.to_string().as_str())),
            Value::Range(range) => Ok(needle.as_int().is_some_and(|n| range.contains(n))),
            Value::Void => Ok(false),
            other => Err(ScriptError::runtime(format!(
                "a value of type {} cannot contain other values",
                other.type_name()
            ))),
        }
    }

    /// Subscript lookup.
    pub fn get(&self, key: &Value) -> Result<Value> {
        match self {
            Value::List(items) => {
                let index = key.as_int().ok_or_else(|| {
                    ScriptError::runtime(format!("lists are indexed by integers, not {key}"))
                })?;
                let len = items.len() as i64;
                let index = if index < 0 { len + index } else { index };
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| {
                        ScriptError::runtime(format!(
                            "index {index} is out of bounds for a list of {len}"
                        ))
                    })
            }
            Value::Map(map) => Ok(map.get(&key.to_string()).cloned().unwrap_or_default()),
            Value::Str(s) => {
                let index = key.as_int().and_then(|i| usize::try_from(i).ok());
                Ok(index
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::str(c.to_string()))
                    .unwrap_or_default())
            }
            Value::Range(range) => {
                let index = key.as_int().ok_or_else(|| {
                    ScriptError::runtime(format!("ranges are indexed by integers, not {key}"))
                })?;
                range.get(index)
            }
            Value::Uri(resource) => resource.get(key),
            other => Err(ScriptError::runtime(format!(
                "a value of type {} cannot be subscripted",
                other.type_name()
            ))),
        }
    }

    pub fn is_type(&self, name: &str) -> Result<bool> {
        if !TYPE_NAMES.contains(&name) {
            return Err(ScriptError::runtime(format!("unknown type `{name}`")));
        }
        Ok(name == "Any" || self.type_name() == name)
    }

    /// Convert to the named type. `Uri` needs a resource registry and is
    /// handled by the cast operator itself.
    pub fn cast(&self, name: &str) -> Result<Value> {
        let fail = || {
            ScriptError::new(
                ErrorKind::ConstraintViolation,
                format!("cannot convert {} `{self}` to {name}", self.type_name()),
            )
        };
        match name {
            "Any" => Ok(self.clone()),
            "Void" => Ok(Value::Void),
            "String" => Ok(Value::str(self.to_string())),
            "Boolean" => Ok(Value::Bool(self.truthy())),
            "Integer" => match self {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Decimal(n) => Ok(Value::Int(n.trunc() as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Str(s) => s.trim().parse().map(Value::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },
            "Decimal" => match self {
                Value::Int(n) => Ok(Value::Decimal(*n as f64)),
                Value::Decimal(n) => Ok(Value::Decimal(*n)),
                Value::Str(s) => s.trim().parse().map(Value::Decimal).map_err(|_| fail()),
                _ => Err(fail()),
            },
            "List" => Ok(Value::list(self.to_items()?)),
            "Map" => match self {
                Value::Map(_) => Ok(self.clone()),
                Value::Void => Ok(Value::map(IndexMap::new())),
                Value::List(items) => {
                    let mut merged = IndexMap::new();
                    for item in items.iter() {
                        let Value::Map(entry) = item else {
                            return Err(fail());
                        };
                        merged.extend(entry.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    Ok(Value::map(merged))
                }
                _ => Err(fail()),
            },
            "Range" => match self {
                Value::Range(_) => Ok(self.clone()),
                _ => Err(fail()),
            },
            _ if self.is_type(name)? => Ok(self.clone()),
            _ => Err(fail()),
        }
    }
}

fn fix_all(items: &[Value], depth: usize, parallel: bool) -> Result<Vec<Value>> {
    let context = if parallel {
        items.iter().find_map(Value::context)
    } else {
        None
    };
    match context {
        Some(context) => context
            .pool()
            .map_ordered(items, |item| item.fix(depth, parallel)),
        None => items.iter().map(|item| item.fix(depth, parallel)).collect(),
    }
}

fn type_mismatch(action: &str, a: &Value, b: &Value) -> ScriptError {
    ScriptError::runtime(format!(
        "cannot {action} {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

fn arithmetic(
    action: &str,
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    dec_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_op(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| ScriptError::runtime(format!("integer overflow in {action}"))),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Decimal(dec_op(x, y))),
            _ => Err(type_mismatch(action, a, b)),
        },
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Lazy(a), Value::Lazy(b)) => a.same(b),
            (Value::Fork(a), Value::Fork(b)) => Arc::ptr_eq(a, b),
            (Value::Uri(a), Value::Uri(b)) => a.uri() == b.uri(),
            (Value::Function(a), Value::Function(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Value::Error(a), Value::Error(b)) => {
                a.kind() == b.kind() && a.message() == b.message()
            }
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Decimal(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Value::Range(range) => write!(f, "{range}"),
            Value::Lazy(thunk) => write!(f, "<lazy {}>", thunk.node()),
            Value::Fork(handle) => write!(f, "<fork {}>", handle.id()),
            Value::Uri(resource) => f.write_str(resource.uri()),
            Value::Function(function) => f.write_str(&function.describe()),
            Value::Error(err) => write!(f, "<{}: {}>", err.kind(), err.message()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("Void"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Int(n) => f.debug_tuple("Int").field(n).finish(),
            Value::Decimal(n) => f.debug_tuple("Decimal").field(n).finish(),
            Value::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Range(range) => f.debug_tuple("Range").field(range).finish(),
            Value::Error(err) => f.debug_tuple("Error").field(err).finish(),
            other => f.debug_tuple(other.type_name()).field(&other.to_string()).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Decimal(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<ScriptError> for Value {
    fn from(err: ScriptError) -> Self {
        Value::Error(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range_enumerates_both_ends() {
        let range = Range::new(Some(1), Some(4), true, true).unwrap();
        assert_eq!(
            range.to_list().unwrap(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
    }

    #[test]
    fn open_range_with_equal_bounds_is_rejected() {
        assert!(Range::new(Some(3), Some(3), false, false).is_err());
        assert!(Range::new(Some(3), Some(3), true, false).is_ok());
    }

    #[test]
    fn half_open_ranges() {
        let range = Range::new(Some(0), Some(3), true, false).unwrap();
        assert_eq!(range.len(), Some(3));
        assert!(range.contains(0));
        assert!(!range.contains(3));
        let unbounded = Range::new(None, Some(3), true, true).unwrap();
        assert!(unbounded.contains(-100));
        assert!(unbounded.to_list().is_err());
    }

    #[test]
    fn ranges_at_the_integer_limits_do_not_overflow() {
        let above = Range::new(Some(i64::MAX), None, false, false).unwrap();
        assert!(!above.contains(5));
        assert!(!above.contains(i64::MAX));
        let below = Range::new(None, Some(i64::MIN), false, false).unwrap();
        assert!(!below.contains(i64::MIN));
        let all = Range::new(Some(i64::MIN), Some(i64::MAX), true, true).unwrap();
        assert!(all.contains(0));
        assert!(all.to_list().is_err());
        let empty = Range::new(Some(i64::MAX), Some(i64::MAX), false, true).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.to_list().unwrap(), Vec::<Value>::new());
        let top = Range::new(Some(i64::MAX - 1), Some(i64::MAX), true, true).unwrap();
        assert_eq!(top.get(1).unwrap(), Value::Int(i64::MAX));
        assert!(top.get(2).is_err());
    }

    #[test]
    fn huge_ranges_refuse_to_enumerate() {
        let range = Range::new(Some(1), Some(10_000_000_000), true, true).unwrap();
        assert_eq!(range.len(), Some(10_000_000_000));
        assert!(range.to_list().is_err());
    }

    #[test]
    fn mixed_arithmetic_promotes_to_decimal() {
        assert_eq!(Value::Int(1).add(&Value::Decimal(0.5)).unwrap(), Value::Decimal(1.5));
        assert_eq!(Value::Int(6).div(&Value::Int(3)).unwrap(), Value::Int(2));
        assert_eq!(Value::Int(7).div(&Value::Int(2)).unwrap(), Value::Decimal(3.5));
        assert!(Value::Int(1).div(&Value::Int(0)).is_err());
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(Value::from("a").add(&Value::Int(1)).unwrap(), Value::from("a1"));
        assert_eq!(Value::Int(1).add(&Value::from("a")).unwrap(), Value::from("1a"));
    }

    #[test]
    fn integers_equal_decimals_numerically() {
        assert_eq!(Value::Int(2), Value::Decimal(2.0));
        assert_ne!(Value::Int(2), Value::from("2"));
    }

    #[test]
    fn casts() {
        assert_eq!(Value::from("42").cast("Integer").unwrap(), Value::Int(42));
        assert_eq!(Value::Int(1).cast("String").unwrap(), Value::from("1"));
        assert!(Value::from("x").cast("Integer").is_err());
        assert!(Value::Int(1).is_type("Integer").unwrap());
        assert!(Value::Int(1).is_type("Nope").is_err());
    }

    #[test]
    fn negative_list_index_counts_from_end() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.get(&Value::Int(-1)).unwrap(), Value::Int(2));
        assert!(list.get(&Value::Int(5)).is_err());
    }
}
