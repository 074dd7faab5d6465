// Per-module views.
//
// Registry entries store the declaring module's (namespace, path); the local
// context is derived from those at call time, so no handler closure captures
// the store.

use serde_json::Value;

use crate::reactive::StateContainer;
use crate::store::{ActionError, Store, StoreInner};

/// Options for a commit/dispatch issued from inside an action body.
/// `root: true` skips namespace prefixing and targets the global type
/// directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub root: bool,
}

/// The local view handed to action handlers: dispatch/commit scoped to the
/// declaring module's namespace, plus local and root state/getter access.
#[derive(Debug, Clone)]
pub struct ActionContext {
    store: Store,
    namespace: String,
    path: Vec<String>,
}

impl ActionContext {
    pub(crate) fn new(store: Store, namespace: String, path: Vec<String>) -> Self {
        Self {
            store,
            namespace,
            path,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Commit a mutation, auto-prefixed with the module namespace.
    pub fn commit(&self, mutation_type: &str, payload: impl Into<Option<Value>>) {
        self.commit_with(mutation_type, payload, CallOptions::default());
    }

    pub fn commit_with(
        &self,
        mutation_type: &str,
        payload: impl Into<Option<Value>>,
        options: CallOptions,
    ) {
        let Some(full_type) = self.resolve_local(mutation_type, options, LocalKind::Mutation)
        else {
            return;
        };
        self.store.commit(&full_type, payload);
    }

    /// Dispatch an action, auto-prefixed with the module namespace.
    pub async fn dispatch(
        &self,
        action_type: &str,
        payload: impl Into<Option<Value>>,
    ) -> Result<Value, ActionError> {
        self.dispatch_with(action_type, payload, CallOptions::default())
            .await
    }

    pub async fn dispatch_with(
        &self,
        action_type: &str,
        payload: impl Into<Option<Value>>,
        options: CallOptions,
    ) -> Result<Value, ActionError> {
        let Some(full_type) = self.resolve_local(action_type, options, LocalKind::Action) else {
            return Ok(Value::Null);
        };
        self.store.dispatch(&full_type, payload).await
    }

    /// Snapshot of the module-local state slice.
    pub fn state(&self) -> Value {
        self.store.inner().local_state(&self.path)
    }

    /// Snapshot of the root state.
    pub fn root_state(&self) -> Value {
        self.store.inner().root_state()
    }

    /// Evaluate a getter declared in this module's namespace.
    pub fn getter(&self, name: &str) -> Option<Value> {
        let full = format!("{}{}", self.namespace, name);
        self.store.inner().eval_getter(&full)
    }

    /// Evaluate a getter by its fully-qualified global name.
    pub fn root_getter(&self, name: &str) -> Option<Value> {
        self.store.inner().eval_getter(name)
    }

    /// Names of the getters visible under this module's namespace, with the
    /// namespace prefix stripped.
    pub fn getter_names(&self) -> Vec<String> {
        self.store.inner().local_getter_names(&self.namespace)
    }

    /// The store itself, for handlers that need the global surface.
    pub fn store(&self) -> &Store {
        &self.store
    }

    // Prefix the requested type with the module namespace unless the call
    // escapes to the root. A prefixed type with no registration is reported
    // and aborts only this call.
    fn resolve_local(&self, local_type: &str, options: CallOptions, kind: LocalKind) -> Option<String> {
        if self.namespace.is_empty() || options.root {
            return Some(local_type.to_string());
        }
        let full = format!("{}{}", self.namespace, local_type);
        let known = match kind {
            LocalKind::Mutation => self.store.inner().has_mutation(&full),
            LocalKind::Action => self.store.inner().has_action(&full),
        };
        if !known {
            tracing::error!(
                local_type = %local_type,
                global_type = %full,
                "unknown local {} type",
                kind.as_str()
            );
            return None;
        }
        Some(full)
    }
}

#[derive(Clone, Copy)]
enum LocalKind {
    Mutation,
    Action,
}

impl LocalKind {
    fn as_str(self) -> &'static str {
        match self {
            LocalKind::Mutation => "mutation",
            LocalKind::Action => "action",
        }
    }
}

/// The view handed to getter computations: local state, local getters, root
/// state, root getters.
pub struct GetterScope<'a> {
    inner: &'a std::sync::Arc<StoreInner>,
    namespace: &'a str,
    path: &'a [String],
    container: &'a StateContainer,
}

impl<'a> GetterScope<'a> {
    pub(crate) fn new(
        inner: &'a std::sync::Arc<StoreInner>,
        namespace: &'a str,
        path: &'a [String],
        container: &'a StateContainer,
    ) -> Self {
        Self {
            inner,
            namespace,
            path,
            container,
        }
    }

    /// Snapshot of the module-local state slice.
    pub fn state(&self) -> Value {
        self.container.get_in(self.path).unwrap_or(Value::Null)
    }

    /// Snapshot of the root state.
    pub fn root_state(&self) -> Value {
        self.container.snapshot()
    }

    /// Evaluate a sibling getter from the same namespace.
    pub fn local(&self, name: &str) -> Option<Value> {
        let full = format!("{}{}", self.namespace, name);
        self.inner.eval_getter(&full)
    }

    /// Evaluate a getter by its fully-qualified global name.
    pub fn root(&self, name: &str) -> Option<Value> {
        self.inner.eval_getter(name)
    }
}
