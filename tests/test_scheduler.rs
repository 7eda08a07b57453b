use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use ripple::{Result, Runtime, RuntimeConfig, Value};

fn wait_for_schedules(rt: &Runtime, limit: Duration) {
    let deadline = Instant::now() + limit;
    while rt.context().scheduler().active() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn every_stops_once_until_holds() -> Result<()> {
    let rt = Runtime::with_config(RuntimeConfig::default().with_workers(2))?;
    rt.eval("volatile count = 0\nevery 0.001 until (count > 3) count = count + 1")?;
    wait_for_schedules(&rt, Duration::from_secs(5));
    assert_eq!(rt.context().scheduler().active(), 0);
    assert_eq!(rt.eval("count")?, Value::Int(4));
    Ok(())
}

#[test]
fn schedules_writing_plain_variables_cancel_on_the_first_failure() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("count = 0\nevery 0.001 until (count > 3) count = count + 1")?;
    wait_for_schedules(&rt, Duration::from_secs(5));
    assert_eq!(rt.context().scheduler().active(), 0);
    assert_eq!(rt.eval("count")?, Value::Int(0));
    Ok(())
}

#[test]
fn every_passes_the_firing_count() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("volatile last = 0\nevery 0.001 until ($1 > 3) last = $1")?;
    wait_for_schedules(&rt, Duration::from_secs(5));
    assert_eq!(rt.eval("last")?, Value::Int(3));
    Ok(())
}

#[test]
fn unless_skips_firings() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("volatile odd = 0\nevery 0.001 until ($1 > 6) unless ($1 % 2 == 0) odd = odd + 1")?;
    wait_for_schedules(&rt, Duration::from_secs(5));
    assert_eq!(rt.eval("odd")?, Value::Int(3));
    Ok(())
}

#[test]
fn schedules_can_be_cancelled() -> Result<()> {
    let rt = Runtime::new()?;
    let cancelled = rt.eval("volatile ticks = 0; id = every 1 sec ticks = ticks + 1; cancel(id)")?;
    assert_eq!(cancelled, Value::Bool(true));
    assert_eq!(rt.context().scheduler().active(), 0);
    assert_eq!(rt.eval("cancel(id)")?, Value::Bool(false));
    Ok(())
}

#[test]
fn dropping_the_runtime_stops_its_schedules() -> Result<()> {
    let rt = Runtime::new()?;
    rt.eval("volatile n = 0\nevery 0.01 n = n + 1")?;
    assert_eq!(rt.context().scheduler().active(), 1);
    drop(rt);
    Ok(())
}
