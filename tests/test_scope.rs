use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use ripple::{Binding, ErrorKind, Pipeable, Result, Runtime, RuntimeConfig, Value};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig::default().with_workers(2)).unwrap()
}

#[test]
fn blocks_write_through_to_the_defining_scope() -> Result<()> {
    let rt = runtime();
    assert_eq!(rt.eval("x = 1\n{ x = 2 }\nx")?, Value::Int(2));
    Ok(())
}

#[test]
fn block_locals_do_not_leak() -> Result<()> {
    let rt = runtime();
    rt.eval("{ y = 1 }")?;
    let err = rt.eval("y").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VariableNotFound);
    Ok(())
}

#[test]
fn readonly_variables_reject_writes() -> Result<()> {
    let rt = runtime();
    rt.eval("const k = 1")?;
    let err = rt.eval("k = 2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadonlyViolation);
    assert_eq!(rt.eval("k")?, Value::Int(1));
    Ok(())
}

#[test]
fn other_threads_cannot_write_plain_variables() -> Result<()> {
    let rt = runtime();
    let root = rt.root().clone();
    root.assign("x", Value::Int(1))?;
    root.set("shared", Value::Int(1), Binding::volatile())?;

    let (plain, volatile) = std::thread::spawn(move || {
        (
            root.assign("x", Value::Int(2)).map(|_| ()),
            root.assign("shared", Value::Int(2)).map(|_| ()),
        )
    })
    .join()
    .unwrap();

    assert_eq!(plain.unwrap_err().kind(), ErrorKind::ConcurrencyViolation);
    assert!(volatile.is_ok());
    assert_eq!(rt.root().get("x", true)?, Value::Int(1));
    assert_eq!(rt.root().get("shared", true)?, Value::Int(2));
    Ok(())
}

#[test]
fn pure_scopes_cannot_touch_outer_state() -> Result<()> {
    let rt = runtime();
    rt.eval("x = 1")?;
    let err = rt.eval("pure { x = 2 }").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PurityViolation);
    assert_eq!(rt.eval("x")?, Value::Int(1));
    assert_eq!(rt.eval("pure { y = x + 1; y * 2 }")?, Value::Int(4));
    Ok(())
}

#[test]
fn impure_builtins_are_rejected_before_anything_runs() -> Result<()> {
    let rt = runtime();
    let err = rt.eval("x = 1\npure { x = input() }").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PurityViolation);
    assert!(!rt.root().has("x"));
    Ok(())
}

#[test]
fn pure_scopes_only_nest_pure_children() {
    let rt = runtime();
    let pure = rt.root().child("pure", true).unwrap();
    assert!(pure.child("inner", true).is_ok());
    let err = pure.child("inner", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PurityViolation);
}

#[test]
fn listeners_run_in_order_even_after_a_failure() -> Result<()> {
    let rt = runtime();
    let root = rt.root();
    root.assign("x", Value::Int(0))?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let failing: Arc<dyn Pipeable> = Arc::new(move |_: &[Value]| {
        log.lock().unwrap().push("first");
        Err(ripple::ScriptError::runtime("listener broke"))
    });
    let log = Arc::clone(&seen);
    let recording: Arc<dyn Pipeable> = Arc::new(move |values: &[Value]| {
        log.lock().unwrap().push("second");
        assert_eq!(values[0], Value::from("x"));
        assert_eq!(values[1], Value::Int(7));
        Ok(Value::Void)
    });
    root.listen("x", "a", failing)?;
    root.listen("x", "b", recording)?;

    let err = root.assign("x", Value::Int(7)).unwrap_err();
    assert_eq!(err.message(), "listener broke");
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(root.get("x", true)?, Value::Int(7));
    Ok(())
}

#[test]
fn error_handlers_catch_listener_failures() -> Result<()> {
    let rt = runtime();
    rt.eval("x = 0\nfailures = 0\nerror { failures = failures + 1 }")?;
    let failing: Arc<dyn Pipeable> =
        Arc::new(|_: &[Value]| Err(ripple::ScriptError::runtime("listener broke")));
    rt.root().listen("x", "broken", failing)?;
    rt.eval("x = 1\nx = 2")?;
    assert_eq!(rt.eval("failures")?, Value::Int(2));
    Ok(())
}

#[test]
fn call_scopes_shadow_but_do_not_leak_parameters() -> Result<()> {
    let rt = runtime();
    rt.eval("factor = 3\ndef scale $1 * factor")?;
    assert_eq!(rt.eval("scale(2)")?, Value::Int(6));
    assert_eq!(rt.eval("scale(2, factor = 10)")?, Value::Int(20));
    assert_eq!(rt.eval("factor")?, Value::Int(3));
    Ok(())
}

#[test]
fn unsubscribing_from_a_child_removes_listeners_on_ancestors() -> Result<()> {
    let rt = runtime();
    let root = rt.root();
    root.assign("a", Value::Int(1))?;
    let child = root.child("block", false)?;

    let hits = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&hits);
    let callback: Arc<dyn Pipeable> = Arc::new(move |_: &[Value]| {
        *counter.lock().unwrap() += 1;
        Ok(Value::Void)
    });
    child.listen("a", "sub", callback)?;
    assert_eq!(root.listener_count("a"), 1);

    assert_eq!(child.unsubscribe("sub"), 1);
    assert_eq!(root.listener_count("a"), 0);
    root.assign("a", Value::Int(2))?;
    assert_eq!(*hits.lock().unwrap(), 0);
    Ok(())
}

#[test]
fn reactive_operators_in_repeated_bodies_register_once() -> Result<()> {
    let rt = runtime();
    rt.eval("hits = 0\nx = 0\ndef watch (x > 2 ? hits = hits + 1)")?;
    let base = rt.root().listener_count("x");
    rt.eval("watch()\nwatch()\nwatch()")?;
    assert_eq!(rt.root().listener_count("x"), base + 1);

    rt.eval("[1, 2, 3] each (x => hits = hits + 10)")?;
    assert_eq!(rt.root().listener_count("x"), base + 2);

    rt.eval("x = 5")?;
    assert_eq!(rt.eval("hits")?, Value::Int(11));
    Ok(())
}
