use std::{
    collections::HashMap,
    io::{Write, stdin, stdout},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::{Result, ScriptError},
    exec,
    scope::Scope,
    value::Value,
};

pub type BuiltinFn = fn(&Scope, &[Value]) -> Result<Value>;

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub pure: bool,
    pub func: BuiltinFn,
}

/// Unit suffixes and how many seconds one of each is.
const UNITS: &[(&str, f64)] = &[
    ("ms", 0.001),
    ("millis", 0.001),
    ("sec", 1.0),
    ("secs", 1.0),
    ("second", 1.0),
    ("seconds", 1.0),
    ("minute", 60.0),
    ("minutes", 60.0),
    ("hour", 3_600.0),
    ("hours", 3_600.0),
    ("day", 86_400.0),
    ("days", 86_400.0),
];

/// Functions callable by name from scripts.
pub struct Builtins {
    functions: HashMap<&'static str, Builtin>,
}

impl Builtins {
    pub fn standard() -> Self {
        let mut builtins = Builtins {
            functions: HashMap::new(),
        };
        for (name, func) in [
            ("max", max as BuiltinFn),
            ("min", min),
            ("sum", sum),
            ("abs", abs),
            ("sqrt", sqrt),
            ("sin", sin),
            ("cos", cos),
            ("tan", tan),
            ("exp", exp),
            ("log", log),
            ("number", number),
            ("string", to_string),
            ("len", len),
            ("keys", keys),
            ("values", values),
            ("type", type_of),
        ] {
            builtins.register(Builtin {
                name,
                pure: true,
                func,
            });
        }
        for (name, func) in [
            ("input", input as BuiltinFn),
            ("now", now),
            ("sleep", sleep),
            ("cancel", cancel),
        ] {
            builtins.register(Builtin {
                name,
                pure: false,
                func,
            });
        }
        builtins
    }

    pub fn register(&mut self, builtin: Builtin) {
        self.functions.insert(builtin.name, builtin);
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.functions.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn is_pure(&self, name: &str) -> bool {
        self.get(name).is_some_and(|builtin| builtin.pure)
    }

    pub fn execute(&self, name: &str, scope: &Scope, args: &[Value]) -> Result<Value> {
        let builtin = self
            .get(name)
            .ok_or_else(|| ScriptError::runtime(format!("no builtin named `{name}`")))?;
        (builtin.func)(scope, args)
    }
}

/// Seconds in one `name`, if it is a unit suffix.
pub fn unit_seconds(name: &str) -> Option<f64> {
    UNITS
        .iter()
        .find(|(unit, _)| *unit == name)
        .map(|(_, seconds)| *seconds)
}

/// Apply a unit to a count. Whole results stay integers.
pub fn apply_unit(name: &str, count: &Value) -> Result<Value> {
    let factor = unit_seconds(name)
        .ok_or_else(|| ScriptError::runtime(format!("`{name}` is not a unit")))?;
    let n = count
        .as_f64()
        .ok_or_else(|| ScriptError::runtime(format!("{name} needs a number, got {count}")))?;
    let seconds = n * factor;
    if let Value::Int(n) = count
        && factor >= 1.0
    {
        return Ok(Value::Int(n.saturating_mul(factor as i64)));
    }
    Ok(Value::Decimal(seconds))
}

fn first<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value> {
    args.first()
        .ok_or_else(|| ScriptError::runtime(format!("{name} expects an argument")))
}

/// Arguments, or the items of a single list argument.
fn spread(args: &[Value]) -> Result<Vec<Value>> {
    match args {
        [single @ (Value::List(_) | Value::Range(_))] => single.to_items(),
        _ => Ok(args.to_vec()),
    }
}

fn extreme(name: &str, args: &[Value], keep: std::cmp::Ordering) -> Result<Value> {
    let mut best: Option<Value> = None;
    for value in spread(args)? {
        if value.as_f64().is_none() {
            return Err(ScriptError::runtime(format!(
                "{name} only accepts numbers, got {value}"
            )));
        }
        best = Some(match best {
            Some(current) if current.compare(&value)? != keep.reverse() => current,
            _ => value,
        });
    }
    best.ok_or_else(|| ScriptError::runtime(format!("{name} requires at least one argument")))
}

fn max(_: &Scope, args: &[Value]) -> Result<Value> {
    extreme("max", args, std::cmp::Ordering::Greater)
}

fn min(_: &Scope, args: &[Value]) -> Result<Value> {
    extreme("min", args, std::cmp::Ordering::Less)
}

fn sum(_: &Scope, args: &[Value]) -> Result<Value> {
    spread(args)?
        .iter()
        .try_fold(Value::Int(0), |total, value| total.add(value))
}

fn number_arg(name: &str, args: &[Value]) -> Result<f64> {
    let value = first(name, args)?;
    value
        .as_f64()
        .ok_or_else(|| ScriptError::runtime(format!("{name} expects a number, got {value}")))
}

fn abs(_: &Scope, args: &[Value]) -> Result<Value> {
    match first("abs", args)? {
        Value::Int(n) => n
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| ScriptError::runtime("integer overflow in abs")),
        _ => Ok(Value::Decimal(number_arg("abs", args)?.abs())),
    }
}

fn sqrt(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::Decimal(number_arg("sqrt", args)?.sqrt()))
}

fn sin(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::Decimal(number_arg("sin", args)?.sin()))
}

fn cos(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::Decimal(number_arg("cos", args)?.cos()))
}

fn tan(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::Decimal(number_arg("tan", args)?.tan()))
}

fn exp(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::Decimal(number_arg("exp", args)?.exp()))
}

fn log(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::Decimal(number_arg("log", args)?.log10()))
}

fn number(_: &Scope, args: &[Value]) -> Result<Value> {
    match first("number", args)? {
        Value::Str(text) => {
            let text = text.trim();
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::Int(n));
            }
            text.parse::<f64>()
                .map(Value::Decimal)
                .map_err(|e| ScriptError::runtime(format!("`{text}` is not a number: {e}")))
        }
        value @ (Value::Int(_) | Value::Decimal(_)) => Ok(value.clone()),
        value => value.cast("Integer"),
    }
}

fn to_string(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::str(first("string", args)?.to_string()))
}

fn len(_: &Scope, args: &[Value]) -> Result<Value> {
    first("len", args)?.size_of()
}

fn keys(_: &Scope, args: &[Value]) -> Result<Value> {
    match first("keys", args)? {
        Value::Map(map) => Ok(Value::list(map.keys().map(Value::str).collect())),
        value => Err(ScriptError::runtime(format!("keys expects a map, got {value}"))),
    }
}

fn values(_: &Scope, args: &[Value]) -> Result<Value> {
    match first("values", args)? {
        Value::Map(map) => Ok(Value::list(map.values().cloned().collect())),
        value => Err(ScriptError::runtime(format!(
            "values expects a map, got {value}"
        ))),
    }
}

fn type_of(_: &Scope, args: &[Value]) -> Result<Value> {
    Ok(Value::str(first("type", args)?.type_name()))
}

fn input(_: &Scope, args: &[Value]) -> Result<Value> {
    if let Some(prompt) = args.first() {
        let mut out = stdout();
        write!(out, "{prompt}").map_err(|e| ScriptError::runtime(e.to_string()))?;
        out.flush().map_err(|e| ScriptError::runtime(e.to_string()))?;
    }
    let mut line = String::new();
    stdin()
        .read_line(&mut line)
        .map_err(|e| ScriptError::runtime(e.to_string()))?;
    Ok(Value::str(line.trim()))
}

/// Seconds since the unix epoch.
fn now(_: &Scope, _: &[Value]) -> Result<Value> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ScriptError::runtime(e.to_string()))?;
    Ok(Value::Decimal(elapsed.as_secs_f64()))
}

fn sleep(_: &Scope, args: &[Value]) -> Result<Value> {
    let duration = exec::seconds(first("sleep", args)?)?;
    std::thread::sleep(duration);
    Ok(Value::Void)
}

fn cancel(scope: &Scope, args: &[Value]) -> Result<Value> {
    let id = first("cancel", args)?;
    let id = id
        .as_int()
        .and_then(|id| u64::try_from(id).ok())
        .ok_or_else(|| ScriptError::runtime(format!("`{id}` is not a schedule id")))?;
    Ok(Value::Bool(scope.context().scheduler().cancel(id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn call(name: &str, args: &[Value]) -> Result<Value> {
        let rt = Runtime::new()?;
        rt.context().builtins().execute(name, rt.root(), args)
    }

    #[test]
    fn max_and_min_accept_lists() {
        let list = Value::list(vec![Value::Int(3), Value::Decimal(7.5), Value::Int(-1)]);
        assert_eq!(call("max", &[list.clone()]).unwrap(), Value::Decimal(7.5));
        assert_eq!(call("min", &[list]).unwrap(), Value::Int(-1));
        assert!(call("max", &[]).is_err());
    }

    #[test]
    fn number_parses_strings() {
        assert_eq!(call("number", &[Value::from("42")]).unwrap(), Value::Int(42));
        assert_eq!(call("number", &[Value::from("2.5")]).unwrap(), Value::Decimal(2.5));
        assert!(call("number", &[Value::from("two")]).is_err());
    }

    #[test]
    fn sum_adds_everything() {
        assert_eq!(
            call("sum", &[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Int(6)
        );
    }

    #[test]
    fn units_are_seconds() {
        assert_eq!(apply_unit("minutes", &Value::Int(2)).unwrap(), Value::Int(120));
        assert_eq!(apply_unit("ms", &Value::Int(5)).unwrap(), Value::Decimal(0.005));
        assert!(unit_seconds("fortnight").is_none());
    }

    #[test]
    fn impure_builtins_are_marked() {
        let builtins = Builtins::standard();
        assert!(builtins.is_pure("max"));
        assert!(!builtins.is_pure("input"));
        assert!(!builtins.is_pure("cancel"));
        assert!(!builtins.exists("print"));
    }
}
