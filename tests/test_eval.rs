use pretty_assertions::assert_eq;
use ripple::{ErrorKind, ErrorPolicy, Result, Runtime, RuntimeConfig, Value};

fn eval(text: &str) -> Result<Value> {
    Runtime::new()?.eval(text)
}

#[test]
fn arithmetic_follows_precedence() -> Result<()> {
    assert_eq!(eval("1 + 2 * 3")?, Value::Int(7));
    assert_eq!(eval("(1 + 2) * 3")?, Value::Int(9));
    assert_eq!(eval("10 - 4 - 3")?, Value::Int(3));
    assert_eq!(eval("7 / 2.0")?, Value::Decimal(3.5));
    Ok(())
}

#[test]
fn eager_assignment_keeps_the_value_it_saw() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("a = 1\nb = a + 1\na = 5")?;
    assert_eq!(rt.eval("b")?, Value::Int(2));
    Ok(())
}

#[test]
fn reactive_definition_tracks_its_inputs() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("a = 1\nb := a + 1\na = 5")?;
    assert_eq!(rt.eval("b")?, Value::Int(6));
    rt.eval("a = 10")?;
    assert_eq!(rt.eval("b")?, Value::Int(11));
    Ok(())
}

#[test]
fn else_applies_when_the_condition_fails() -> Result<()> {
    assert_eq!(eval("x = 3\nif x > 2 \"big\" else \"small\"")?, Value::from("big"));
    assert_eq!(eval("x = 1\nif x > 2 \"big\" else \"small\"")?, Value::from("small"));
    assert_eq!(eval("if false 1")?, Value::Bool(false));
    Ok(())
}

#[test]
fn loops_and_blocks() -> Result<()> {
    assert_eq!(eval("i = 0\nwhile i < 5 i++\ni")?, Value::Int(5));
    assert_eq!(eval("total = 0\nfor n in [1..4] total = total + n\ntotal")?, Value::Int(10));
    assert_eq!(eval("{ a = 2; a * 3 }")?, Value::Int(6));
    Ok(())
}

#[test]
fn each_and_reduce_bind_positional_parameters() -> Result<()> {
    assert_eq!(
        eval("[1, 2, 3] each $1 * 10")?,
        Value::list(vec![Value::Int(10), Value::Int(20), Value::Int(30)])
    );
    assert_eq!(eval("[1, 2, 3, 4] reduce $1 + $2")?, Value::Int(10));
    assert_eq!(eval("[] reduce $1 + $2")?, Value::Void);
    Ok(())
}

#[test]
fn parallel_each_keeps_declared_order() -> Result<()> {
    let expected: Vec<Value> = (1..=50).map(|n| Value::Int(n * n)).collect();
    assert_eq!(eval("parallel ([1..50] each $1 * $1)")?, Value::list(expected));
    Ok(())
}

#[test]
fn functions_receive_positional_and_named_arguments() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("def area $1 * $2\ndef scale $1 * factor")?;
    assert_eq!(rt.eval("area(3, 4)")?, Value::Int(12));
    assert_eq!(rt.eval("scale(2, factor = 5)")?, Value::Int(10));
    assert_eq!(rt.eval("[1, 2, 3] | sum")?, Value::Int(6));
    Ok(())
}

#[test]
fn recursion_works_within_the_depth_limit() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("def fact if $1 <= 1 1 else $1 * fact($1 - 1)")?;
    assert_eq!(rt.eval("fact(5)")?, Value::Int(120));
    Ok(())
}

#[test]
fn runaway_recursion_is_reported() -> Result<()> {
    let rt = Runtime::with_config(RuntimeConfig::default().with_max_recursion_depth(64))?;
    let err = rt.eval("def f f() + 1\nf()").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExcessiveRecursion);
    Ok(())
}

#[test]
fn maps_lists_and_members() -> Result<()> {
    assert_eq!(eval("m = {a: 1, b: 2}\nm.a + m[\"b\"]")?, Value::Int(3));
    assert_eq!(eval("l = [1, 2, 3]\nl[-1]")?, Value::Int(3));
    assert_eq!(eval("m = {a: 1}\nm.a = 5\nm.a")?, Value::Int(5));
    assert_eq!(eval("l = [1, 2, 3]\nl[0] = 9\nl[0]")?, Value::Int(9));
    assert_eq!(eval("#[4, 5, 6]")?, Value::Int(3));
    Ok(())
}

#[test]
fn ranges_honour_their_bounds() -> Result<()> {
    assert_eq!(eval("2 in (1..3)")?, Value::Bool(true));
    assert_eq!(eval("3 in [1..3)")?, Value::Bool(false));
    assert_eq!(eval("3 in [1..3]")?, Value::Bool(true));
    assert_eq!(eval("[1..3] | sum")?, Value::Int(6));
    assert_eq!(eval("(3..3)").unwrap_err().kind(), ErrorKind::Parse);
    Ok(())
}

#[test]
fn casts_and_type_tests() -> Result<()> {
    assert_eq!(eval("\"42\" as Integer")?, Value::Int(42));
    assert_eq!(eval("4 is Integer")?, Value::Bool(true));
    assert_eq!(eval("4 is String")?, Value::Bool(false));
    assert_eq!(eval("2 minutes")?, Value::Int(120));
    Ok(())
}

#[test]
fn typed_declarations_reject_other_types() -> Result<()> {
    let err = eval("<Integer> n = \"five\"").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(eval("<Integer> n = 5\nn")?, Value::Int(5));
    Ok(())
}

#[test]
fn constraints_guard_every_write() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("(it >= 0) level = 3")?;
    let err = rt.eval("level = -1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(rt.eval("level")?, Value::Int(3));
    Ok(())
}

#[test]
fn classes_instantiate_with_overrides() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("class Point { x = 0; y = 0; def total x + y }")?;
    rt.eval("p = new Point(x = 3, y = 4)")?;
    assert_eq!(rt.eval("p.x")?, Value::Int(3));
    assert_eq!(rt.eval("p.total")?, Value::Int(7));
    Ok(())
}

#[test]
fn assertions_bypass_error_handlers() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("error { 0 }")?;
    let err = rt.eval("assert \"math is broken\" : 1 == 2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssertionFailure);
    assert_eq!(err.message(), "math is broken");
    assert_eq!(rt.eval("1 + 1 <-> 2")?, Value::Bool(true));
    assert_eq!(rt.eval("1 <=> 2").unwrap_err().kind(), ErrorKind::AssertionFailure);
    Ok(())
}

#[test]
fn error_handlers_see_type_and_message() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("caught = \"\"\nerror { caught = TYPE + \": \" + MSG; 0 }")?;
    assert_eq!(rt.eval("y = missing\ny")?, Value::Int(0));
    let caught = rt.eval("caught")?.to_string();
    assert!(caught.starts_with("VariableNotFoundError: "), "{caught}");
    assert_eq!(rt.eval("TYPE").unwrap_err().kind(), ErrorKind::VariableNotFound);
    Ok(())
}

#[test]
fn error_policies() -> Result<()> {
    let err = eval("missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VariableNotFound);
    assert!(!err.is_fatal());

    let rt = Runtime::with_config(RuntimeConfig::default().with_error_policy(ErrorPolicy::ErrorValue))?;
    assert_eq!(rt.eval("y = missing\ny is Error")?, Value::Bool(true));

    let rt = Runtime::with_config(RuntimeConfig::default().with_error_policy(ErrorPolicy::FailFast))?;
    assert!(rt.eval("missing").unwrap_err().is_fatal());
    Ok(())
}

#[test]
fn forks_are_awaited_by_fix() -> Result<()> {
    assert_eq!(eval("f = fork (6 * 7)\nfix f")?, Value::Int(42));
    Ok(())
}

#[test]
fn modules_export_their_variables() -> Result<()> {
    let path = std::env::temp_dir().join(format!("ripple-module-{}.rp", std::process::id()));
    std::fs::write(&path, "export doubled = n * 2\nhidden = 1\n").unwrap();
    let rt = Runtime::new()?;
    let script = format!(
        "m = module \"file:{}\" with (n = 21)\nm.doubled",
        path.display()
    );
    let result = rt.eval(&script);
    std::fs::remove_file(&path).ok();
    assert_eq!(result?, Value::Int(42));
    assert_eq!(rt.eval("m.hidden")?, Value::Void);
    Ok(())
}

#[test]
fn memory_resources_queue_and_publish() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("q = \"mem:eval-queue\" as Uri")?;
    assert_eq!(rt.eval("state q")?, Value::from("INITIAL"));
    rt.eval("\"hello\" >> q")?;
    assert_eq!(rt.eval("state q")?, Value::from("RUNNING"));
    assert_eq!(rt.eval("<< q")?, Value::from("hello"));

    rt.eval("got = \"\"\nq <* got = $1\n\"flash\" *> q")?;
    assert_eq!(rt.eval("got")?, Value::from("flash"));

    rt.eval("pause q")?;
    assert_eq!(rt.eval("<< q").unwrap_err().kind(), ErrorKind::ResourceState);
    Ok(())
}

#[test]
fn cached_nodes_rerun_in_each_call_scope() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("def twice fix ($1 * 2)\ndef same $1 <-> 1")?;
    assert_eq!(rt.eval("twice(5)")?, Value::Int(10));
    assert_eq!(rt.eval("twice(6)")?, Value::Int(12));
    assert_eq!(rt.eval("same(1)")?, Value::Bool(true));
    let err = rt.eval("same(7)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssertionFailure);
    Ok(())
}

#[test]
fn fixed_assertions_check_every_iteration() -> Result<()> {
    let err = eval("[1, 2, 3] each ($1 <-> 1)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssertionFailure);
    assert_eq!(
        eval("[1, 2, 3] each fix ($1 * 10)")?,
        Value::list(vec![Value::Int(10), Value::Int(20), Value::Int(30)])
    );
    Ok(())
}

#[test]
fn ranges_at_the_integer_limits() -> Result<()> {
    assert_eq!(eval("5 in (9223372036854775807..)")?, Value::Bool(false));
    let err = eval("[1..10000000000] | sum").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    Ok(())
}
