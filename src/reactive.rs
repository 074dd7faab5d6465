// Canonical state storage.
//
// The container owns the state tree and makes every change observable: each
// insert/delete/update bumps a version counter and notifies deep, synchronous
// watchers with the post-change state. Getter memoization is keyed on the
// version counter, so "has anything changed" never requires dependency
// tracking. Watchers run with no internal lock held and may re-enter the
// store.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::module::StateSource;

type WatchFn = Arc<dyn Fn(&Value) + Send + Sync>;

pub struct StateContainer {
    state: RwLock<Value>,
    version: AtomicU64,
    watchers: RwLock<Vec<(Uuid, WatchFn)>>,
    retired: AtomicBool,
}

impl StateContainer {
    pub fn new(initial: Value) -> Self {
        Self {
            state: RwLock::new(initial),
            version: AtomicU64::new(0),
            watchers: RwLock::new(Vec::new()),
            retired: AtomicBool::new(false),
        }
    }

    /// Turn a declared state source into a state object. A factory is
    /// invoked here, exactly once per call site; a literal is cloned.
    pub fn materialize(source: &StateSource) -> Value {
        match source {
            StateSource::Empty => Value::Object(Map::new()),
            StateSource::Literal(value) => value.clone(),
            StateSource::Factory(factory) => factory(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Value {
        self.state.read().clone()
    }

    /// Read the value at a key path. `None` if any hop is missing.
    pub fn get_in(&self, path: &[String]) -> Option<Value> {
        let state = self.state.read();
        let mut current: &Value = &state;
        for key in path {
            current = current.get(key)?;
        }
        Some(current.clone())
    }

    /// Observable insert: set `key` inside the object at `parent`.
    pub fn set_property(&self, parent: &[String], key: &str, value: Value) {
        let changed = {
            let mut state = self.state.write();
            match value_at_mut(&mut state, parent) {
                Some(Value::Object(map)) => {
                    map.insert(key.to_string(), value);
                    true
                }
                Some(_) => {
                    tracing::error!(key = %key, "set_property target is not an object");
                    false
                }
                None => {
                    tracing::error!(key = %key, "set_property parent path is missing");
                    false
                }
            }
        };
        if changed {
            self.bump_and_notify();
        }
    }

    /// Observable delete: remove `key` from the object at `parent`.
    pub fn delete_property(&self, parent: &[String], key: &str) {
        let changed = {
            let mut state = self.state.write();
            match value_at_mut(&mut state, parent) {
                Some(Value::Object(map)) => map.remove(key).is_some(),
                _ => false,
            }
        };
        if changed {
            self.bump_and_notify();
        }
    }

    /// Run a closure against the value at `path` and write the result back.
    /// The closure executes on a detached copy so it can re-enter the
    /// container; safe under the engine's single-writer discipline.
    pub fn update_in(&self, path: &[String], apply: impl FnOnce(&mut Value)) -> bool {
        let Some(mut local) = self.get_in(path) else {
            tracing::error!(path = ?path, "update_in path is missing");
            return false;
        };
        apply(&mut local);
        {
            let mut state = self.state.write();
            match value_at_mut(&mut state, path) {
                Some(slot) => *slot = local,
                None => return false,
            }
        }
        self.bump_and_notify();
        true
    }

    /// Wholesale root replacement.
    pub fn replace(&self, new_state: Value) {
        *self.state.write() = new_state;
        self.bump_and_notify();
    }

    /// Register a deep, synchronous watcher: invoked with the post-change
    /// state on every observable change until unwatched or torn down.
    pub fn watch(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Uuid {
        let id = Uuid::new_v4();
        self.watchers.write().push((id, Arc::new(callback)));
        id
    }

    pub fn unwatch(&self, id: Uuid) {
        self.watchers.write().retain(|(watcher, _)| *watcher != id);
    }

    /// Retire this instance: drop all watchers and silence further
    /// notifications. State reads keep working for observers still holding
    /// the instance.
    pub fn teardown(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.watchers.write().clear();
    }

    fn bump_and_notify(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        if self.retired.load(Ordering::SeqCst) {
            return;
        }
        let watchers: Vec<WatchFn> = self
            .watchers
            .read()
            .iter()
            .map(|(_, watcher)| watcher.clone())
            .collect();
        if watchers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for watcher in watchers {
            watcher(&snapshot);
        }
    }
}

impl fmt::Debug for StateContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateContainer")
            .field("version", &self.version())
            .field("watchers", &self.watchers.read().len())
            .field("retired", &self.retired.load(Ordering::SeqCst))
            .finish()
    }
}

/// A version-keyed memo cell: recompute when the container version has
/// moved since the cached value, reuse otherwise.
#[derive(Default)]
pub struct Computed {
    cache: Mutex<Option<(u64, Value)>>,
}

impl Computed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, container: &StateContainer, compute: impl FnOnce() -> Value) -> Value {
        let version = container.version();
        {
            let cache = self.cache.lock();
            if let Some((cached_version, value)) = cache.as_ref() {
                if *cached_version == version {
                    return value.clone();
                }
            }
        }
        // compute runs without the cache lock so it can evaluate other
        // memoized values
        let value = compute();
        *self.cache.lock() = Some((version, value.clone()));
        value
    }

    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache.lock().as_ref().map(|(version, _)| *version);
        f.debug_struct("Computed").field("cached_at", &cached).finish()
    }
}

fn value_at_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for key in path {
        current = current.get_mut(key)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_and_delete_are_observable() {
        let container = StateContainer::new(json!({"a": {}}));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        container.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        container.set_property(&path(&["a"]), "b", json!(1));
        assert_eq!(container.get_in(&path(&["a", "b"])), Some(json!(1)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        container.delete_property(&path(&["a"]), "b");
        assert_eq!(container.get_in(&path(&["a", "b"])), None);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // deleting a missing key is not a change
        container.delete_property(&path(&["a"]), "b");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn update_in_writes_back_and_reports_missing_paths() {
        let container = StateContainer::new(json!({"counter": {"count": 1}}));
        assert!(container.update_in(&path(&["counter"]), |state| {
            state["count"] = json!(2);
        }));
        assert_eq!(container.get_in(&path(&["counter", "count"])), Some(json!(2)));

        assert!(!container.update_in(&path(&["missing"]), |_| {}));
    }

    #[test]
    fn watchers_see_post_change_state_and_unwatch_works() {
        let container = StateContainer::new(json!({"n": 0}));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = container.watch(move |state| {
            sink.lock().push(state["n"].clone());
        });

        container.update_in(&[], |state| state["n"] = json!(7));
        container.unwatch(id);
        container.update_in(&[], |state| state["n"] = json!(8));

        assert_eq!(*seen.lock(), vec![json!(7)]);
    }

    #[test]
    fn computed_reuses_until_the_version_moves() {
        let container = StateContainer::new(json!({"n": 1}));
        let computed = Computed::new();
        let runs = AtomicUsize::new(0);

        let eval = || {
            computed.get(&container, || {
                runs.fetch_add(1, Ordering::SeqCst);
                container.get_in(&path(&["n"])).unwrap_or(Value::Null)
            })
        };

        assert_eq!(eval(), json!(1));
        assert_eq!(eval(), json!(1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        container.update_in(&[], |state| state["n"] = json!(2));
        assert_eq!(eval(), json!(2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn teardown_silences_notifications() {
        let container = StateContainer::new(json!({}));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        container.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        container.teardown();
        container.set_property(&[], "x", json!(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn materialize_sources() {
        assert_eq!(StateContainer::materialize(&StateSource::Empty), json!({}));
        assert_eq!(
            StateContainer::materialize(&StateSource::Literal(json!({"a": 1}))),
            json!({"a": 1})
        );
        let from_factory =
            StateContainer::materialize(&StateSource::Factory(Arc::new(|| json!({"b": 2}))));
        assert_eq!(from_factory, json!({"b": 2}));
    }
}
