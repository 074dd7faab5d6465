// Store - the commit/dispatch routing engine.
//
// A single global registry keyed by fully-qualified namespaced type strings:
// mutations and actions map to ordered handler lists, getters to a single
// computation each. Structural changes never edit the registry in place;
// a fresh registry is built and swapped in wholesale.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::{ActionContext, GetterScope};
use crate::module::{ActionHandler, GetterFn, MutationFn, NodeId, RawModule};
use crate::reactive::{Computed, StateContainer};
use crate::tree::{join_path, ModuleError, ModuleTree};

/// Failures produced by action handlers. These propagate through the future
/// returned by `dispatch`; the store forwards them to the optional error
/// hook first and never swallows them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("Execution error: {message}")]
    ExecutionError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

impl ActionError {
    pub fn execution(message: impl Into<String>) -> Self {
        ActionError::ExecutionError {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(err: serde_json::Error) -> Self {
        ActionError::SerializationError {
            message: err.to_string(),
        }
    }
}

/// The descriptor handed to mutation subscribers, with the post-mutation
/// root state alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub mutation_type: String,
    pub payload: Option<Value>,
}

/// The descriptor handed to action subscribers before handlers run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_type: String,
    pub payload: Option<Value>,
    pub metadata: ActionMetadata,
}

/// Metadata for action tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub action_id: Uuid,
    pub dispatched_at: DateTime<Utc>,
}

impl ActionRecord {
    fn new(action_type: String, payload: Option<Value>) -> Self {
        Self {
            action_type,
            payload,
            metadata: ActionMetadata {
                action_id: Uuid::new_v4(),
                dispatched_at: Utc::now(),
            },
        }
    }
}

/// Store construction options.
#[derive(Default)]
pub struct StoreOptions {
    /// Assert that every canonical-state change happens inside a commit.
    /// A violation is a hard failure.
    pub strict: bool,
    /// Hooks invoked once with the store at construction.
    pub plugins: Vec<Box<dyn FnOnce(&Store) + Send>>,
}

impl StoreOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    pub fn plugin(mut self, plugin: impl FnOnce(&Store) + Send + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("strict", &self.strict)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// Options for dynamic module registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleOptions {
    /// Keep an existing state slot at the target path instead of splicing
    /// the module's declared state over it.
    pub preserve_state: bool,
}

/// Options for [`Store::watch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Fire the callback once immediately with the initial value.
    pub immediate: bool,
}

type SubscriberFn = Arc<dyn Fn(&MutationRecord, &Value) + Send + Sync>;
type ActionSubscriberFn = Arc<dyn Fn(&ActionRecord, &Value) + Send + Sync>;
type ActionErrorHook = Arc<dyn Fn(&ActionError) + Send + Sync>;

#[derive(Clone)]
struct MutationEntry {
    path: Vec<String>,
    handler: MutationFn,
}

#[derive(Clone)]
struct ActionEntry {
    namespace: String,
    path: Vec<String>,
    handler: Arc<dyn ActionHandler>,
}

#[derive(Clone)]
struct GetterEntry {
    namespace: String,
    path: Vec<String>,
    getter: GetterFn,
}

#[derive(Default)]
struct Registry {
    mutations: HashMap<String, Vec<MutationEntry>>,
    actions: HashMap<String, Vec<ActionEntry>>,
    getters: HashMap<String, GetterEntry>,
    namespaces: HashMap<String, NodeId>,
}

struct BoundGetter {
    namespace: String,
    path: Vec<String>,
    getter: GetterFn,
    computed: Computed,
}

struct StoreWatcher {
    getter: Box<dyn Fn(&Value) -> Value + Send + Sync>,
    callback: Box<dyn Fn(&Value, &Value) + Send + Sync>,
    last: Mutex<Value>,
}

pub(crate) struct StoreInner {
    tree: RwLock<ModuleTree>,
    registry: RwLock<Registry>,
    container: RwLock<Arc<StateContainer>>,
    bound_getters: RwLock<HashMap<String, Arc<BoundGetter>>>,
    committing: AtomicBool,
    strict: bool,
    subscribers: RwLock<Vec<(Uuid, SubscriberFn)>>,
    action_subscribers: RwLock<Vec<(Uuid, ActionSubscriberFn)>>,
    watchers: RwLock<Vec<(Uuid, Arc<StoreWatcher>)>>,
    action_error_hook: RwLock<Option<ActionErrorHook>>,
}

impl StoreInner {
    pub(crate) fn has_mutation(&self, mutation_type: &str) -> bool {
        self.registry.read().mutations.contains_key(mutation_type)
    }

    pub(crate) fn has_action(&self, action_type: &str) -> bool {
        self.registry.read().actions.contains_key(action_type)
    }

    pub(crate) fn root_state(&self) -> Value {
        self.container.read().snapshot()
    }

    pub(crate) fn local_state(&self, path: &[String]) -> Value {
        self.container
            .read()
            .get_in(path)
            .unwrap_or(Value::Null)
    }

    /// Evaluate the bound getter at `name`, recomputing only when the
    /// container version has moved.
    pub(crate) fn eval_getter(self: &Arc<Self>, name: &str) -> Option<Value> {
        let bound = self.bound_getters.read().get(name).cloned()?;
        let container = self.container.read().clone();
        let value = bound.computed.get(&container, || {
            let scope = GetterScope::new(self, &bound.namespace, &bound.path, &container);
            (bound.getter)(&scope)
        });
        Some(value)
    }

    pub(crate) fn local_getter_names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .bound_getters
            .read()
            .keys()
            .filter_map(|name| name.strip_prefix(namespace).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    fn unsubscribe(&self, kind: SubscriptionKind, id: Uuid) {
        match kind {
            SubscriptionKind::Mutation => {
                self.subscribers.write().retain(|(sub, _)| *sub != id);
            }
            SubscriptionKind::Action => {
                self.action_subscribers.write().retain(|(sub, _)| *sub != id);
            }
        }
    }

    fn unwatch(&self, id: Uuid) {
        self.watchers.write().retain(|(watcher, _)| *watcher != id);
    }

    // Re-evaluate every store-level watcher against the post-change state
    // and fire callbacks whose value moved. Runs with no lock held across
    // user code.
    fn pump_watchers(inner: &Arc<StoreInner>, state: &Value) {
        let watchers: Vec<Arc<StoreWatcher>> = inner
            .watchers
            .read()
            .iter()
            .map(|(_, watcher)| watcher.clone())
            .collect();
        for watcher in watchers {
            let next = (watcher.getter)(state);
            let previous = {
                let mut last = watcher.last.lock();
                if *last == next {
                    continue;
                }
                std::mem::replace(&mut *last, next.clone())
            };
            (watcher.callback)(&next, &previous);
        }
    }
}

/// The hierarchical, namespaced state container. Cheap to clone; clones
/// share the same engine.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Build a store from a root module declaration with default options.
    pub fn new(root: RawModule) -> Result<Self, ModuleError> {
        Self::with_options(root, StoreOptions::default())
    }

    pub fn with_options(root: RawModule, options: StoreOptions) -> Result<Self, ModuleError> {
        let StoreOptions { strict, plugins } = options;
        let tree = ModuleTree::new(root)?;
        let root_state = tree
            .node(tree.root())
            .map(|node| node.state.clone())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let inner = Arc::new(StoreInner {
            tree: RwLock::new(tree),
            registry: RwLock::new(Registry::default()),
            container: RwLock::new(Arc::new(StateContainer::new(root_state))),
            bound_getters: RwLock::new(HashMap::new()),
            committing: AtomicBool::new(false),
            strict,
            subscribers: RwLock::new(Vec::new()),
            action_subscribers: RwLock::new(Vec::new()),
            watchers: RwLock::new(Vec::new()),
            action_error_hook: RwLock::new(None),
        });
        let store = Store { inner };

        // install the whole tree, then bind getters and gates
        store.install_at(&[], false, false);
        store.reset_container(false);

        for plugin in plugins {
            plugin(&store);
        }
        Ok(store)
    }

    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    /// Snapshot of the root state. Read-only: writes to the returned value
    /// cannot reach the canonical tree.
    pub fn state(&self) -> Value {
        self.inner.root_state()
    }

    /// The live state container - the integration seam with the reactive
    /// observation layer. Swapped out by dynamic registration and hot
    /// update; do not cache across those.
    pub fn state_container(&self) -> Arc<StateContainer> {
        self.inner.container.read().clone()
    }

    /// Evaluate a getter by fully-qualified name.
    pub fn getter(&self, name: &str) -> Option<Value> {
        self.inner.eval_getter(name)
    }

    pub fn getter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.bound_getters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a module is installed at `path`.
    pub fn has_module(&self, path: &[&str]) -> bool {
        self.inner.tree.read().get(&owned_path(path)).is_some()
    }

    /// The namespace accumulated along `path`.
    pub fn module_namespace(&self, path: &[&str]) -> String {
        self.inner.tree.read().namespace_of(&owned_path(path))
    }

    /// Commit a mutation: every handler registered under the type runs
    /// synchronously, in registration order, inside the committing gate.
    /// An unknown type is reported and the call is a no-op.
    pub fn commit(&self, mutation_type: &str, payload: impl Into<Option<Value>>) {
        self.commit_inner(mutation_type.to_string(), payload.into());
    }

    /// Object-style commit: the descriptor carries its own `type` field and
    /// is itself passed as the payload.
    pub fn commit_object(&self, descriptor: Value) {
        match unify_object_style(descriptor) {
            Some((mutation_type, payload)) => self.commit_inner(mutation_type, payload),
            None => {
                tracing::error!("object-style commit requires a string 'type' field");
            }
        }
    }

    fn commit_inner(&self, mutation_type: String, payload: Option<Value>) {
        let entries: Vec<MutationEntry> = {
            let registry = self.inner.registry.read();
            match registry.mutations.get(&mutation_type) {
                Some(entries) => entries.clone(),
                None => {
                    tracing::error!(mutation_type = %mutation_type, "unknown mutation type");
                    return;
                }
            }
        };

        let container = self.inner.container.read().clone();
        self.with_commit(|| {
            for entry in &entries {
                container.update_in(&entry.path, |local| (entry.handler)(local, payload.as_ref()));
            }
        });

        let record = MutationRecord {
            mutation_type,
            payload,
        };
        let subscribers: Vec<SubscriberFn> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, sub)| sub.clone())
            .collect();
        let state = container.snapshot();
        for subscriber in subscribers {
            subscriber(&record, &state);
        }
    }

    /// Dispatch an action. Action subscribers are notified before handlers
    /// run. One handler: its result is returned directly. Several: all run,
    /// the call resolves to the array of results once every one settles and
    /// fails if any one fails. An unknown type is reported and resolves to
    /// `Null`.
    pub async fn dispatch(
        &self,
        action_type: &str,
        payload: impl Into<Option<Value>>,
    ) -> Result<Value, ActionError> {
        self.dispatch_inner(action_type.to_string(), payload.into())
            .await
    }

    /// Object-style dispatch, mirroring [`Store::commit_object`].
    pub async fn dispatch_object(&self, descriptor: Value) -> Result<Value, ActionError> {
        match unify_object_style(descriptor) {
            Some((action_type, payload)) => self.dispatch_inner(action_type, payload).await,
            None => {
                tracing::error!("object-style dispatch requires a string 'type' field");
                Ok(Value::Null)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        action_type: String,
        payload: Option<Value>,
    ) -> Result<Value, ActionError> {
        let entries: Vec<ActionEntry> = {
            let registry = self.inner.registry.read();
            match registry.actions.get(&action_type) {
                Some(entries) => entries.clone(),
                None => {
                    tracing::error!(action_type = %action_type, "unknown action type");
                    return Ok(Value::Null);
                }
            }
        };

        let record = ActionRecord::new(action_type, payload.clone());
        let subscribers: Vec<ActionSubscriberFn> = self
            .inner
            .action_subscribers
            .read()
            .iter()
            .map(|(_, sub)| sub.clone())
            .collect();
        let state = self.inner.root_state();
        for subscriber in subscribers {
            subscriber(&record, &state);
        }

        let result = if entries.len() == 1 {
            let entry = &entries[0];
            let ctx = ActionContext::new(self.clone(), entry.namespace.clone(), entry.path.clone());
            entry.handler.handle(ctx, payload).await
        } else {
            let futures: Vec<_> = entries
                .iter()
                .map(|entry| {
                    let ctx =
                        ActionContext::new(self.clone(), entry.namespace.clone(), entry.path.clone());
                    entry.handler.handle(ctx, payload.clone())
                })
                .collect();
            futures::future::try_join_all(futures)
                .await
                .map(Value::Array)
        };

        if let Err(error) = &result {
            let hook = self.inner.action_error_hook.read().clone();
            if let Some(hook) = hook {
                hook(error);
            }
        }
        result
    }

    /// Subscribe to mutations: invoked after each commit, in subscription
    /// order, with the mutation record and post-mutation state.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&MutationRecord, &Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = Uuid::new_v4();
        self.inner.subscribers.write().push((id, Arc::new(subscriber)));
        Subscription {
            id,
            kind: SubscriptionKind::Mutation,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to actions: invoked before each dispatch's handlers run.
    pub fn subscribe_action(
        &self,
        subscriber: impl Fn(&ActionRecord, &Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = Uuid::new_v4();
        self.inner
            .action_subscribers
            .write()
            .push((id, Arc::new(subscriber)));
        Subscription {
            id,
            kind: SubscriptionKind::Action,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Watch a computed value over the root state; `callback(new, old)`
    /// fires whenever the value changes. Survives the container swaps done
    /// by dynamic registration and hot update.
    pub fn watch(
        &self,
        getter: impl Fn(&Value) -> Value + Send + Sync + 'static,
        callback: impl Fn(&Value, &Value) + Send + Sync + 'static,
        options: WatchOptions,
    ) -> WatchHandle {
        let initial = getter(&self.state());
        if options.immediate {
            callback(&initial, &initial);
        }
        let watcher = Arc::new(StoreWatcher {
            getter: Box::new(getter),
            callback: Box::new(callback),
            last: Mutex::new(initial),
        });
        let id = Uuid::new_v4();
        self.inner.watchers.write().push((id, watcher));
        WatchHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Replace the root state wholesale, inside the committing gate.
    pub fn replace_state(&self, new_state: Value) {
        let container = self.inner.container.read().clone();
        self.with_commit(|| container.replace(new_state));
    }

    /// Forward failed actions to `hook` before the error propagates to the
    /// dispatcher.
    pub fn set_action_error_hook(&self, hook: impl Fn(&ActionError) + Send + Sync + 'static) {
        *self.inner.action_error_hook.write() = Some(Arc::new(hook));
    }

    /// Register a module at `path` at runtime.
    pub fn register_module(&self, path: &[&str], raw: RawModule) -> Result<(), ModuleError> {
        self.register_module_with(path, raw, ModuleOptions::default())
    }

    pub fn register_module_with(
        &self,
        path: &[&str],
        raw: RawModule,
        options: ModuleOptions,
    ) -> Result<(), ModuleError> {
        if path.is_empty() {
            return Err(ModuleError::EmptyModulePath);
        }
        let path = owned_path(path);
        self.inner.tree.write().register(&path, raw, true)?;
        self.install_at(&path, false, options.preserve_state);
        self.reset_container(false);
        Ok(())
    }

    /// Remove a runtime-registered module and its state slot. A module
    /// declared at construction is left untouched (warning only).
    pub fn unregister_module(&self, path: &[&str]) {
        let path = owned_path(path);
        let removed = self.inner.tree.write().unregister(&path);
        if !removed {
            tracing::warn!(
                path = %join_path(&path),
                "unregister declined; not a runtime module"
            );
            return;
        }
        let container = self.inner.container.read().clone();
        let (parent, key) = (&path[..path.len() - 1], &path[path.len() - 1]);
        self.with_commit(|| container.delete_property(parent, key));
        self.reset(false);
    }

    /// Swap mutation/action/getter definitions on the installed tree
    /// without discarding state. An update naming a module absent from the
    /// live tree aborts with no effect.
    pub fn hot_update(&self, new_raw_root: RawModule) -> Result<(), ModuleError> {
        self.inner.tree.write().update(new_raw_root)?;
        self.reset(true);
        Ok(())
    }

    // Set the committing flag for the duration of `run`, restoring the
    // previous value on every exit path.
    fn with_commit<R>(&self, run: impl FnOnce() -> R) -> R {
        let previous = self.inner.committing.swap(true, Ordering::SeqCst);
        let _guard = CommitGuard {
            flag: &self.inner.committing,
            previous,
        };
        run()
    }

    // Depth-first pre-order install from `anchor`: append registry entries
    // and splice module state into the parent slice. Splices are skipped on
    // hot passes and, when preserving, wherever a slot already exists.
    fn install_at(&self, anchor: &[String], hot: bool, preserve_state: bool) {
        let steps = {
            let tree = self.inner.tree.read();
            collect_steps(&tree, anchor)
        };
        {
            let mut registry = self.inner.registry.write();
            for step in &steps {
                apply_step(&mut registry, step);
            }
        }
        let container = self.inner.container.read().clone();
        for step in &steps {
            if step.path.is_empty() || hot {
                continue;
            }
            if preserve_state && container.get_in(&step.path).is_some() {
                continue;
            }
            let (parent, key) = (
                &step.path[..step.path.len() - 1],
                &step.path[step.path.len() - 1],
            );
            self.with_commit(|| container.set_property(parent, key, step.state.clone()));
        }
    }

    // Full reset: build a fresh registry from the whole tree and swap it in
    // atomically, then rebuild the container bindings.
    fn reset(&self, hot: bool) {
        let steps = {
            let tree = self.inner.tree.read();
            collect_steps(&tree, &[])
        };
        let mut fresh = Registry::default();
        for step in &steps {
            apply_step(&mut fresh, step);
        }
        *self.inner.registry.write() = fresh;
        self.reset_container(hot);
    }

    // Rebuild getter bindings against a fresh container seeded with the
    // current state, re-attach the strict gate and the watcher pump, swap,
    // and retire the superseded instance off the hot path.
    fn reset_container(&self, hot: bool) {
        let snapshot = self.inner.container.read().snapshot();
        let fresh = Arc::new(StateContainer::new(snapshot.clone()));

        let mut bound = HashMap::new();
        for (name, entry) in self.inner.registry.read().getters.iter() {
            bound.insert(
                name.clone(),
                Arc::new(BoundGetter {
                    namespace: entry.namespace.clone(),
                    path: entry.path.clone(),
                    getter: entry.getter.clone(),
                    computed: Computed::new(),
                }),
            );
        }
        *self.inner.bound_getters.write() = bound;

        if self.inner.strict {
            let weak = Arc::downgrade(&self.inner);
            fresh.watch(move |_| {
                if let Some(inner) = weak.upgrade() {
                    if !inner.committing.load(Ordering::SeqCst) {
                        panic!(
                            "illegal mutation: state changed outside of a commit; \
                             route every state transition through commit()"
                        );
                    }
                }
            });
        }

        let weak = Arc::downgrade(&self.inner);
        fresh.watch(move |state| {
            if let Some(inner) = weak.upgrade() {
                StoreInner::pump_watchers(&inner, state);
            }
        });

        let old = std::mem::replace(&mut *self.inner.container.write(), fresh);
        if hot {
            // force watcher re-evaluation against the rebuilt bindings
            StoreInner::pump_watchers(&self.inner, &snapshot);
        }
        teardown_later(old);
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.read();
        f.debug_struct("Store")
            .field("mutations", &registry.mutations.len())
            .field("actions", &registry.actions.len())
            .field("getters", &registry.getters.len())
            .field("namespaces", &registry.namespaces.len())
            .field("strict", &self.inner.strict)
            .finish()
    }
}

struct CommitGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
enum SubscriptionKind {
    Mutation,
    Action,
}

/// Handle returned by [`Store::subscribe`] / [`Store::subscribe_action`].
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    kind: SubscriptionKind,
    inner: Weak<StoreInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.kind, self.id);
        }
    }
}

/// Handle returned by [`Store::watch`].
#[derive(Debug)]
pub struct WatchHandle {
    id: Uuid,
    inner: Weak<StoreInner>,
}

impl WatchHandle {
    pub fn unwatch(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unwatch(self.id);
        }
    }
}

struct InstallStep {
    node: NodeId,
    path: Vec<String>,
    namespace: String,
    namespaced: bool,
    state: Value,
    mutations: Vec<(String, MutationFn)>,
    actions: Vec<(String, Arc<dyn ActionHandler>, bool)>,
    getters: Vec<(String, GetterFn)>,
}

fn collect_steps(tree: &ModuleTree, anchor: &[String]) -> Vec<InstallStep> {
    let Some(start) = tree.get(anchor) else {
        tracing::error!(path = %join_path(anchor), "install anchor is missing from the tree");
        return Vec::new();
    };
    let mut steps = Vec::new();
    collect_into(tree, start, anchor.to_vec(), &mut steps);
    steps
}

fn collect_into(tree: &ModuleTree, id: NodeId, path: Vec<String>, out: &mut Vec<InstallStep>) {
    let Some(node) = tree.node(id) else {
        return;
    };
    let namespace = tree.namespace_of(&path);
    out.push(InstallStep {
        node: id,
        path: path.clone(),
        namespace,
        namespaced: node.namespaced(),
        state: node.state.clone(),
        mutations: node
            .raw
            .mutations
            .iter()
            .map(|(key, handler)| (key.clone(), handler.clone()))
            .collect(),
        actions: node
            .raw
            .actions
            .iter()
            .map(|(key, decl)| (key.clone(), decl.handler(), decl.registers_at_root()))
            .collect(),
        getters: node
            .raw
            .getters
            .iter()
            .map(|(key, getter)| (key.clone(), getter.clone()))
            .collect(),
    });
    for (key, &child) in &node.children {
        let mut child_path = path.clone();
        child_path.push(key.clone());
        collect_into(tree, child, child_path, out);
    }
}

fn apply_step(registry: &mut Registry, step: &InstallStep) {
    if step.namespaced {
        // later registrations at the same namespace silently win
        registry.namespaces.insert(step.namespace.clone(), step.node);
    }
    for (key, handler) in &step.mutations {
        let full = format!("{}{}", step.namespace, key);
        registry.mutations.entry(full).or_default().push(MutationEntry {
            path: step.path.clone(),
            handler: handler.clone(),
        });
    }
    for (key, handler, root) in &step.actions {
        let full = if *root {
            key.clone()
        } else {
            format!("{}{}", step.namespace, key)
        };
        registry.actions.entry(full).or_default().push(ActionEntry {
            namespace: step.namespace.clone(),
            path: step.path.clone(),
            handler: handler.clone(),
        });
    }
    for (key, getter) in &step.getters {
        let full = format!("{}{}", step.namespace, key);
        if registry.getters.contains_key(&full) {
            tracing::error!(getter = %full, "duplicate getter key; keeping the first registration");
            continue;
        }
        registry.getters.insert(
            full,
            GetterEntry {
                namespace: step.namespace.clone(),
                path: step.path.clone(),
                getter: getter.clone(),
            },
        );
    }
}

fn unify_object_style(descriptor: Value) -> Option<(String, Option<Value>)> {
    let descriptor_type = descriptor.get("type")?.as_str()?.to_string();
    Some((descriptor_type, Some(descriptor)))
}

fn owned_path(path: &[&str]) -> Vec<String> {
    path.iter().map(|segment| segment.to_string()).collect()
}

// Retire the superseded container off the current call path when a runtime
// is available, so in-flight observers can finish first.
fn teardown_later(old: Arc<StateContainer>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                old.teardown();
            });
        }
        Err(_) => old.teardown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_module() -> RawModule {
        RawModule::new()
            .state(json!({"count": 0}))
            .mutation("increment", |state, payload| {
                let step = payload.and_then(Value::as_i64).unwrap_or(1);
                let count = state["count"].as_i64().unwrap_or(0);
                state["count"] = json!(count + step);
            })
            .getter("count", |scope| scope.state()["count"].clone())
    }

    #[test]
    fn commit_runs_handlers_and_updates_state() {
        let store = Store::new(counter_module()).unwrap();
        store.commit("increment", json!(5));
        assert_eq!(store.state()["count"], json!(5));
        assert_eq!(store.getter("count"), Some(json!(5)));
    }

    #[test]
    fn unknown_mutation_is_a_no_op() {
        let store = Store::new(counter_module()).unwrap();
        store.commit("missing", None);
        assert_eq!(store.state()["count"], json!(0));
    }

    #[test]
    fn commit_lookup_is_exact_string() {
        let root = RawModule::new()
            .module("a", counter_module().namespaced(true))
            .module("b", counter_module().namespaced(true));
        let store = Store::new(root).unwrap();

        store.commit("a/increment", None);
        assert_eq!(store.state()["a"]["count"], json!(1));
        assert_eq!(store.state()["b"]["count"], json!(0));

        // the bare type is not registered at all
        store.commit("increment", None);
        assert_eq!(store.state()["a"]["count"], json!(1));
        assert_eq!(store.state()["b"]["count"], json!(0));
    }

    #[test]
    fn same_type_handlers_run_in_registration_order() {
        // root and two plain (non-namespaced) modules all register "tag";
        // one commit must run all three, pre-order
        let order = Arc::new(Mutex::new(Vec::new()));
        let tag = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
            let order = order.clone();
            move |_: &mut Value, _: Option<&Value>| {
                order.lock().push(label);
            }
        };
        let root = RawModule::new()
            .mutation("tag", tag("root", &order))
            .module("one", RawModule::new().mutation("tag", tag("one", &order)))
            .module("two", RawModule::new().mutation("tag", tag("two", &order)));
        let store = Store::new(root).unwrap();

        store.commit("tag", None);
        assert_eq!(*order.lock(), vec!["root", "one", "two"]);
    }

    #[test]
    fn object_style_commit_merges_type_into_the_payload() {
        let root = RawModule::new()
            .state(json!({"count": 0}))
            .mutation("add", |state, payload| {
                let amount = payload
                    .and_then(|p| p.get("amount"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let count = state["count"].as_i64().unwrap_or(0);
                state["count"] = json!(count + amount);
            });
        let store = Store::new(root).unwrap();
        store.commit_object(json!({"type": "add", "amount": 2}));
        assert_eq!(store.state()["count"], json!(2));
    }

    #[test]
    fn subscribers_see_post_mutation_state_in_order() {
        let store = Store::new(counter_module()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let first = store.subscribe(move |record, state| {
            sink.lock()
                .push((record.mutation_type.clone(), state["count"].clone(), 1));
        });
        let sink = seen.clone();
        let _second = store.subscribe(move |record, state| {
            sink.lock()
                .push((record.mutation_type.clone(), state["count"].clone(), 2));
        });

        store.commit("increment", None);
        {
            let seen = seen.lock();
            assert_eq!(
                *seen,
                vec![
                    ("increment".to_string(), json!(1), 1),
                    ("increment".to_string(), json!(1), 2),
                ]
            );
        }

        first.unsubscribe();
        store.commit("increment", None);
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn dispatch_returns_the_single_handler_result() {
        let root = counter_module().action("double", |ctx, _| async move {
            let count = ctx.state()["count"].as_i64().unwrap_or(0);
            ctx.commit("increment", json!(count));
            Ok(json!(count * 2))
        });
        let store = Store::new(root).unwrap();
        store.commit("increment", json!(3));

        let result = store.dispatch("double", None).await.unwrap();
        assert_eq!(result, json!(6));
        assert_eq!(store.state()["count"], json!(6));
    }

    #[tokio::test]
    async fn unknown_action_resolves_to_null() {
        let store = Store::new(counter_module()).unwrap();
        let result = store.dispatch("missing", None).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn action_subscribers_fire_before_handlers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let trace = order.clone();
        let root = counter_module().action("mark", move |_, _| {
            let trace = trace.clone();
            async move {
                trace.lock().push("handler");
                Ok(Value::Null)
            }
        });
        let store = Store::new(root).unwrap();
        let trace = order.clone();
        store.subscribe_action(move |record, _| {
            assert_eq!(record.action_type, "mark");
            trace.lock().push("subscriber");
        });

        store.dispatch("mark", None).await.unwrap();
        assert_eq!(*order.lock(), vec!["subscriber", "handler"]);
    }

    #[tokio::test]
    async fn failed_action_reaches_the_hook_and_still_errors() {
        let root = counter_module().action("explode", |_, _| async move {
            Err(ActionError::execution("boom"))
        });
        let store = Store::new(root).unwrap();
        let hooked = Arc::new(Mutex::new(None));
        let sink = hooked.clone();
        store.set_action_error_hook(move |error| {
            *sink.lock() = Some(error.to_string());
        });

        let result = store.dispatch("explode", None).await;
        assert!(result.is_err());
        assert_eq!(
            hooked.lock().as_deref(),
            Some("Execution error: boom")
        );
    }

    #[test]
    fn replace_state_is_gated_and_observable() {
        let store = Store::with_options(counter_module(), StoreOptions::strict()).unwrap();
        store.replace_state(json!({"count": 41}));
        assert_eq!(store.state()["count"], json!(41));
        store.commit("increment", None);
        assert_eq!(store.state()["count"], json!(42));
    }

    #[test]
    #[should_panic(expected = "illegal mutation")]
    fn strict_mode_panics_on_external_writes() {
        let store = Store::with_options(counter_module(), StoreOptions::strict()).unwrap();
        let container = store.state_container();
        container.set_property(&[], "count", json!(99));
    }

    #[test]
    fn strict_mode_accepts_committed_writes() {
        let store = Store::with_options(counter_module(), StoreOptions::strict()).unwrap();
        store.commit("increment", json!(7));
        assert_eq!(store.state()["count"], json!(7));
    }

    #[test]
    fn plugins_run_once_at_construction() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = StoreOptions::default().plugin(move |store: &Store| {
            sink.lock().push(store.state()["count"].clone());
        });
        let _store = Store::with_options(counter_module(), options).unwrap();
        assert_eq!(*seen.lock(), vec![json!(0)]);
    }

    #[test]
    fn watch_fires_on_change_only() {
        let store = Store::new(counter_module()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = store.watch(
            |state| state["count"].clone(),
            move |new, old| {
                sink.lock().push((new.clone(), old.clone()));
            },
            WatchOptions::default(),
        );

        store.commit("increment", None);
        store.commit("missing", None); // no-op, no change
        assert_eq!(*seen.lock(), vec![(json!(1), json!(0))]);

        handle.unwatch();
        store.commit("increment", None);
        assert_eq!(seen.lock().len(), 1);
    }
}
