use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    error::{ErrorKind, Result, ScriptError},
    exec::lock,
    module::Pipeable,
    value::Value,
};

/// Behaviour behind a `scheme:path` resource.
///
/// Lifecycle hooks default to doing nothing; the data operations have to be
/// provided.
pub trait UriHandler: Send + Sync {
    fn init(&self) -> Result<()> {
        Ok(())
    }
    fn start(&self) -> Result<()> {
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        Ok(())
    }
    fn pause(&self) -> Result<()> {
        Ok(())
    }
    fn unpause(&self) -> Result<()> {
        Ok(())
    }
    fn destroy(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &Value) -> Result<Value>;
    fn set(&self, key: &Value, value: Value) -> Result<Value>;
    fn remove(&self, key: &Value) -> Result<Value>;
    fn size(&self) -> Result<usize>;

    /// Next item. `blocking` waits for one, `mutating` consumes it.
    fn read(&self, blocking: bool, mutating: bool) -> Result<Value>;
    fn write(&self, value: Value, blocking: bool, mutating: bool) -> Result<Value>;

    fn publish(&self, value: Value) -> Result<Value>;
    fn subscribe(&self, id: &str, callback: Arc<dyn Pipeable>) -> Result<()>;
    fn unsubscribe(&self, id: &str) -> Result<()>;
}

/// Creates handlers for one scheme.
pub trait UriHandlerFactory: Send + Sync {
    fn scheme(&self) -> &str;
    fn create(&self, uri: &str) -> Result<Arc<dyn UriHandler>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Initial,
    Running,
    Paused,
    /// Stopped explicitly. Only an explicit `start` leaves this state.
    Stopped,
    Destroyed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceState::Initial => "INITIAL",
            ResourceState::Running => "RUNNING",
            ResourceState::Paused => "PAUSED",
            ResourceState::Stopped => "STOPPED",
            ResourceState::Destroyed => "DESTROYED",
        })
    }
}

/// A handler plus its lifecycle state. Data access starts an initial resource
/// exactly once.
pub struct Resource {
    uri: String,
    handler: Arc<dyn UriHandler>,
    state: Mutex<ResourceState>,
}

impl Resource {
    pub fn new(uri: impl Into<String>, handler: Arc<dyn UriHandler>) -> Self {
        Resource {
            uri: uri.into(),
            handler,
            state: Mutex::new(ResourceState::Initial),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ResourceState {
        *lock(&self.state)
    }

    fn invalid(&self, action: &str, state: ResourceState) -> ScriptError {
        ScriptError::new(
            ErrorKind::ResourceState,
            format!("cannot {action} {} while it is {state}", self.uri),
        )
    }

    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            ResourceState::Running => Ok(()),
            ResourceState::Initial => {
                self.handler.init()?;
                self.handler.start()?;
                *state = ResourceState::Running;
                debug!(uri = %self.uri, "resource started");
                Ok(())
            }
            ResourceState::Stopped => {
                self.handler.start()?;
                *state = ResourceState::Running;
                debug!(uri = %self.uri, "resource restarted");
                Ok(())
            }
            other => Err(self.invalid("start", other)),
        }
    }

    pub fn stop(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            ResourceState::Running | ResourceState::Paused => {
                self.handler.stop()?;
                *state = ResourceState::Stopped;
                Ok(())
            }
            ResourceState::Initial | ResourceState::Stopped => Ok(()),
            other => Err(self.invalid("stop", other)),
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            ResourceState::Running => {
                self.handler.pause()?;
                *state = ResourceState::Paused;
                Ok(())
            }
            ResourceState::Paused => Ok(()),
            other => Err(self.invalid("pause", other)),
        }
    }

    pub fn unpause(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            ResourceState::Paused => {
                self.handler.unpause()?;
                *state = ResourceState::Running;
                Ok(())
            }
            ResourceState::Running => Ok(()),
            other => Err(self.invalid("unpause", other)),
        }
    }

    pub fn destroy(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state == ResourceState::Destroyed {
            return Ok(());
        }
        if matches!(*state, ResourceState::Running | ResourceState::Paused) {
            self.handler.stop()?;
        }
        self.handler.destroy()?;
        *state = ResourceState::Destroyed;
        debug!(uri = %self.uri, "resource destroyed");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ResourceState::Running => Ok(()),
            ResourceState::Initial => self.start(),
            other => Err(self.invalid("use", other)),
        }
    }

    pub fn get(&self, key: &Value) -> Result<Value> {
        self.ensure_running()?;
        self.handler.get(key)
    }

    pub fn set(&self, key: &Value, value: Value) -> Result<Value> {
        self.ensure_running()?;
        self.handler.set(key, value)
    }

    pub fn remove(&self, key: &Value) -> Result<Value> {
        self.ensure_running()?;
        self.handler.remove(key)
    }

    pub fn size(&self) -> Result<usize> {
        self.ensure_running()?;
        self.handler.size()
    }

    pub fn read(&self, blocking: bool, mutating: bool) -> Result<Value> {
        self.ensure_running()?;
        self.handler.read(blocking, mutating)
    }

    pub fn write(&self, value: Value, blocking: bool, mutating: bool) -> Result<Value> {
        self.ensure_running()?;
        self.handler.write(value, blocking, mutating)
    }

    pub fn publish(&self, value: Value) -> Result<Value> {
        self.ensure_running()?;
        self.handler.publish(value)
    }

    pub fn subscribe(&self, id: &str, callback: Arc<dyn Pipeable>) -> Result<()> {
        self.ensure_running()?;
        self.handler.subscribe(id, callback)
    }

    pub fn unsubscribe(&self, id: &str) -> Result<()> {
        self.handler.unsubscribe(id)
    }
}

#[derive(Default)]
pub struct UriRegistry {
    factories: DashMap<String, Arc<dyn UriHandlerFactory>>,
}

impl UriRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn UriHandlerFactory>) {
        self.factories
            .insert(factory.scheme().to_string(), factory);
    }

    pub fn open(&self, uri: &str) -> Result<Arc<Resource>> {
        let (scheme, _) = uri.split_once(':').ok_or_else(|| {
            ScriptError::runtime(format!("`{uri}` is not a uri; expected scheme:path"))
        })?;
        let factory = self
            .factories
            .get(scheme)
            .map(|factory| Arc::clone(factory.value()))
            .ok_or_else(|| ScriptError::runtime(format!("no handler for scheme `{scheme}`")))?;
        Ok(Arc::new(Resource::new(uri, factory.create(uri)?)))
    }
}

/// `mem:` resources. Every resource with the same uri shares one store.
#[derive(Default)]
pub struct MemoryHandlerFactory {
    stores: DashMap<String, Arc<MemoryHandler>>,
}

impl UriHandlerFactory for MemoryHandlerFactory {
    fn scheme(&self) -> &str {
        "mem"
    }

    fn create(&self, uri: &str) -> Result<Arc<dyn UriHandler>> {
        let store = self
            .stores
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MemoryHandler::default()))
            .clone();
        Ok(store)
    }
}

/// Queue, key/value entries and subscribers held in memory.
#[derive(Default)]
pub struct MemoryHandler {
    queue: Mutex<VecDeque<Value>>,
    available: Condvar,
    entries: Mutex<IndexMap<String, Value>>,
    subscribers: Mutex<Vec<(String, Arc<dyn Pipeable>)>>,
}

/// Longest a blocking read waits before giving up.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

impl UriHandler for MemoryHandler {
    fn get(&self, key: &Value) -> Result<Value> {
        Ok(lock(&self.entries)
            .get(&key.to_string())
            .cloned()
            .unwrap_or_default())
    }

    fn set(&self, key: &Value, value: Value) -> Result<Value> {
        lock(&self.entries).insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn remove(&self, key: &Value) -> Result<Value> {
        Ok(lock(&self.entries)
            .shift_remove(&key.to_string())
            .unwrap_or_default())
    }

    fn size(&self) -> Result<usize> {
        Ok(lock(&self.queue).len() + lock(&self.entries).len())
    }

    fn read(&self, blocking: bool, mutating: bool) -> Result<Value> {
        let mut queue = lock(&self.queue);
        if blocking {
            let (guard, timeout) = self
                .available
                .wait_timeout_while(queue, READ_TIMEOUT, |queue| queue.is_empty())
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue = guard;
            if timeout.timed_out() {
                return Err(ScriptError::runtime("timed out waiting to read"));
            }
        }
        let value = if mutating {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(value.unwrap_or_default())
    }

    fn write(&self, value: Value, _blocking: bool, _mutating: bool) -> Result<Value> {
        lock(&self.queue).push_back(value.clone());
        self.available.notify_one();
        Ok(value)
    }

    fn publish(&self, value: Value) -> Result<Value> {
        let subscribers = lock(&self.subscribers).clone();
        for (id, callback) in subscribers {
            if let Err(err) = callback.invoke(std::slice::from_ref(&value)) {
                warn!(subscriber = %id, "subscriber failed: {err}");
            }
        }
        Ok(value)
    }

    fn subscribe(&self, id: &str, callback: Arc<dyn Pipeable>) -> Result<()> {
        let mut subscribers = lock(&self.subscribers);
        let existing = subscribers.iter().position(|(subscriber, _)| subscriber == id);
        match existing {
            Some(index) => subscribers[index].1 = callback,
            None => subscribers.push((id.to_string(), callback)),
        }
        Ok(())
    }

    fn unsubscribe(&self, id: &str) -> Result<()> {
        lock(&self.subscribers).retain(|(existing, _)| existing != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn memory(uri: &str) -> Resource {
        let factory = MemoryHandlerFactory::default();
        Resource::new(uri, factory.create(uri).unwrap())
    }

    #[test]
    fn first_access_starts_the_resource() {
        let resource = memory("mem:q");
        assert_eq!(resource.state(), ResourceState::Initial);
        resource.write(Value::Int(1), false, false).unwrap();
        assert_eq!(resource.state(), ResourceState::Running);
        assert_eq!(resource.read(false, true).unwrap(), Value::Int(1));
        assert_eq!(resource.read(false, true).unwrap(), Value::Void);
    }

    #[test]
    fn paused_resource_rejects_data_access() {
        let resource = memory("mem:p");
        resource.start().unwrap();
        resource.pause().unwrap();
        let err = resource.read(false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceState);
        resource.unpause().unwrap();
        assert!(resource.read(false, false).is_ok());
    }

    /// Counts lifecycle calls around an in-memory store.
    #[derive(Default)]
    struct Counted {
        inits: AtomicUsize,
        starts: AtomicUsize,
        store: MemoryHandler,
    }

    impl UriHandler for Counted {
        fn init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn get(&self, key: &Value) -> Result<Value> {
            self.store.get(key)
        }
        fn set(&self, key: &Value, value: Value) -> Result<Value> {
            self.store.set(key, value)
        }
        fn remove(&self, key: &Value) -> Result<Value> {
            self.store.remove(key)
        }
        fn size(&self) -> Result<usize> {
            self.store.size()
        }
        fn read(&self, blocking: bool, mutating: bool) -> Result<Value> {
            self.store.read(blocking, mutating)
        }
        fn write(&self, value: Value, blocking: bool, mutating: bool) -> Result<Value> {
            self.store.write(value, blocking, mutating)
        }
        fn publish(&self, value: Value) -> Result<Value> {
            self.store.publish(value)
        }
        fn subscribe(&self, id: &str, callback: Arc<dyn Pipeable>) -> Result<()> {
            self.store.subscribe(id, callback)
        }
        fn unsubscribe(&self, id: &str) -> Result<()> {
            self.store.unsubscribe(id)
        }
    }

    #[test]
    fn stopped_resource_needs_an_explicit_start() {
        let handler = Arc::new(Counted::default());
        let resource = Resource::new("counted:x", Arc::clone(&handler) as Arc<dyn UriHandler>);
        resource.write(Value::Int(1), false, false).unwrap();
        resource.stop().unwrap();
        assert_eq!(resource.state(), ResourceState::Stopped);
        assert_eq!(resource.state().to_string(), "STOPPED");
        let err = resource.read(false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceState);
        resource.start().unwrap();
        assert_eq!(resource.read(false, true).unwrap(), Value::Int(1));
        assert_eq!(handler.inits.load(Ordering::SeqCst), 1);
        assert_eq!(handler.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn destroyed_resource_cannot_restart() {
        let resource = memory("mem:d");
        resource.start().unwrap();
        resource.destroy().unwrap();
        assert_eq!(resource.state(), ResourceState::Destroyed);
        assert!(resource.start().is_err());
    }

    #[test]
    fn same_uri_shares_a_store() {
        let factory = MemoryHandlerFactory::default();
        let a = Resource::new("mem:shared", factory.create("mem:shared").unwrap());
        let b = Resource::new("mem:shared", factory.create("mem:shared").unwrap());
        a.set(&Value::from("k"), Value::Int(3)).unwrap();
        assert_eq!(b.get(&Value::from("k")).unwrap(), Value::Int(3));
    }

    #[test]
    fn publish_reaches_subscribers() {
        let resource = memory("mem:topic");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let callback: Arc<dyn Pipeable> = Arc::new(move |values: &[Value]| {
            counter.fetch_add(values.len(), Ordering::SeqCst);
            Ok(Value::Void)
        });
        resource.subscribe("s", callback).unwrap();
        resource.publish(Value::Int(1)).unwrap();
        resource.publish(Value::Int(2)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
