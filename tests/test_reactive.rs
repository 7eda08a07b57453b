use pretty_assertions::assert_eq;
use ripple::{ErrorKind, ParserOptions, Result, Runtime, Value};

#[test]
fn when_fires_each_time_its_condition_holds_after_a_change() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("count = 0\nx = 0\nwhen x > 2 count = count + 1")?;
    assert_eq!(rt.eval("count")?, Value::Int(0));
    rt.eval("x = 3\nx = 4\nx = 1")?;
    assert_eq!(rt.eval("count")?, Value::Int(2));
    Ok(())
}

#[test]
fn question_mark_is_infix_when() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("alarms = 0\ntemp = 10\ntemp > 30 ? alarms = alarms + 1")?;
    rt.eval("temp = 35")?;
    assert_eq!(rt.eval("alarms")?, Value::Int(1));
    Ok(())
}

#[test]
fn when_runs_immediately_if_already_true() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("seen = 0\nready = true\nwhen ready seen = seen + 1")?;
    assert_eq!(rt.eval("seen")?, Value::Int(1));
    Ok(())
}

#[test]
fn causes_runs_on_every_change() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("hits = 0\nx = 1\nx => hits = hits + 1")?;
    assert_eq!(rt.eval("hits")?, Value::Int(0));
    rt.eval("x = 2\nx = 3")?;
    assert_eq!(rt.eval("hits")?, Value::Int(2));
    Ok(())
}

#[test]
fn definitions_propagate_through_chains() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("base = 2\ndoubled := base * 2\nquad := doubled * 2")?;
    rt.eval("log = 0\nquad => log = quad")?;
    rt.eval("base = 5")?;
    assert_eq!(rt.eval("quad")?, Value::Int(20));
    assert_eq!(rt.eval("log")?, Value::Int(20));
    Ok(())
}

#[test]
fn definitions_track_variables_declared_later_only_when_present() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("total := price * qty")?;
    let err = rt.eval("total").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VariableNotFound);
    rt.eval("price = 3\nqty = 4")?;
    assert_eq!(rt.eval("total")?, Value::Int(12));
    Ok(())
}

#[test]
fn literals_are_cached_but_operators_are_not() -> Result<()> {
    let rt = Runtime::new()?;
    let fixed = rt.parse("snippet", "fix (1 + 2)", &ParserOptions::default())?;
    let statement = &fixed.children()[0];
    assert_eq!(statement.fix_deep(rt.root(), false)?, Value::Int(3));
    assert_eq!(statement.fix_deep(rt.root(), false)?, Value::Int(3));
    assert_eq!(statement.evaluations(), 1);

    let reactive = rt.parse("snippet", "1 + 2", &ParserOptions::default())?;
    let statement = &reactive.children()[0];
    statement.fix_deep(rt.root(), false)?;
    statement.fix_deep(rt.root(), false)?;
    assert_eq!(statement.evaluations(), 2);
    Ok(())
}

#[test]
fn reactive_assertions_compare_current_values() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("a = 1\nb := a + 1")?;
    assert_eq!(rt.eval("b <=> a + 1")?, Value::Bool(true));
    rt.eval("a = 10")?;
    assert_eq!(rt.eval("b <=> 11")?, Value::Bool(true));
    let err = rt.eval("b <=> 2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssertionFailure);
    Ok(())
}

#[test]
fn listener_cycles_terminate() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("a = 0\nb = 0\na => b = a + 1\nb => a = b + 1")?;
    rt.eval("a = 1")?;
    assert_eq!(rt.eval("b")?, Value::Int(2));
    assert_eq!(rt.eval("a")?, Value::Int(3));
    Ok(())
}
