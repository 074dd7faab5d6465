// Module declarations and tree nodes.
//
// A `RawModule` is what callers hand to the store: a state source, the
// namespaced flag, handler declarations, and nested modules. A `ModuleNode`
// is the installed form living in the module tree arena.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;

use crate::context::{ActionContext, GetterScope};
use crate::reactive::StateContainer;
use crate::store::ActionError;

/// State declared by a module: a literal value, a factory invoked once at
/// registration time, or nothing (materializes to an empty object).
#[derive(Clone, Default)]
pub enum StateSource {
    #[default]
    Empty,
    Literal(Value),
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl fmt::Debug for StateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateSource::Empty => f.write_str("StateSource::Empty"),
            StateSource::Literal(v) => f.debug_tuple("StateSource::Literal").field(v).finish(),
            StateSource::Factory(_) => f.write_str("StateSource::Factory(..)"),
        }
    }
}

/// A synchronous state-transition handler. Receives the module-local state
/// slice and the commit payload.
pub type MutationFn = Arc<dyn Fn(&mut Value, Option<&Value>) + Send + Sync>;

/// A named computation over scoped state. Must be pure: it is memoized
/// against the container version.
pub type GetterFn = Arc<dyn Fn(&GetterScope<'_>) -> Value + Send + Sync>;

/// Action handler trait
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the action body. The context is scoped to the declaring
    /// module; the payload is whatever the dispatcher was handed.
    async fn handle(
        &self,
        ctx: ActionContext,
        payload: Option<Value>,
    ) -> Result<Value, ActionError>;
}

// Adapter so plain async closures register without a dedicated handler type.
struct FnActionHandler<F>(F);

#[async_trait]
impl<F> ActionHandler for FnActionHandler<F>
where
    F: Fn(ActionContext, Option<Value>) -> BoxFuture<'static, Result<Value, ActionError>>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: ActionContext,
        payload: Option<Value>,
    ) -> Result<Value, ActionError> {
        (self.0)(ctx, payload).await
    }
}

/// An action declaration: either a bare handler, or a handler carrying
/// registration options. `root: true` registers the action under its bare
/// key at the global level even inside a namespaced module.
#[derive(Clone)]
pub enum ActionDecl {
    Direct(Arc<dyn ActionHandler>),
    WithOptions {
        handler: Arc<dyn ActionHandler>,
        root: bool,
    },
}

impl ActionDecl {
    pub(crate) fn handler(&self) -> Arc<dyn ActionHandler> {
        match self {
            ActionDecl::Direct(h) => h.clone(),
            ActionDecl::WithOptions { handler, .. } => handler.clone(),
        }
    }

    pub(crate) fn registers_at_root(&self) -> bool {
        matches!(self, ActionDecl::WithOptions { root: true, .. })
    }
}

impl fmt::Debug for ActionDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionDecl::Direct(_) => f.write_str("ActionDecl::Direct(..)"),
            ActionDecl::WithOptions { root, .. } => f
                .debug_struct("ActionDecl::WithOptions")
                .field("root", root)
                .finish(),
        }
    }
}

/// A module declaration: state plus named mutations, actions, getters, and
/// nested modules. Built fluently and handed to [`crate::store::Store`].
#[derive(Default)]
pub struct RawModule {
    pub(crate) state: StateSource,
    pub(crate) namespaced: bool,
    pub(crate) mutations: IndexMap<String, MutationFn>,
    pub(crate) actions: IndexMap<String, ActionDecl>,
    pub(crate) getters: IndexMap<String, GetterFn>,
    pub(crate) modules: IndexMap<String, RawModule>,
}

impl RawModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the module state as a literal value (cloned once at
    /// registration).
    pub fn state(mut self, value: Value) -> Self {
        self.state = StateSource::Literal(value);
        self
    }

    /// Declare the module state as a factory, invoked at most once, at
    /// registration.
    pub fn state_with<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.state = StateSource::Factory(Arc::new(factory));
        self
    }

    /// Opt this module into namespacing: its key contributes a `key/`
    /// segment to every descendant's fully-qualified type names.
    pub fn namespaced(mut self, namespaced: bool) -> Self {
        self.namespaced = namespaced;
        self
    }

    pub fn mutation<F>(mut self, key: &str, handler: F) -> Self
    where
        F: Fn(&mut Value, Option<&Value>) + Send + Sync + 'static,
    {
        self.mutations.insert(key.to_string(), Arc::new(handler));
        self
    }

    /// Register an async closure as an action.
    pub fn action<F, Fut>(self, key: &str, handler: F) -> Self
    where
        F: Fn(ActionContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        self.action_decl(key, ActionDecl::Direct(box_handler(handler)))
    }

    /// Register an async closure as a root-level action: its dispatch type
    /// is the bare key even when the module is namespaced.
    pub fn root_action<F, Fut>(self, key: &str, handler: F) -> Self
    where
        F: Fn(ActionContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        self.action_decl(
            key,
            ActionDecl::WithOptions {
                handler: box_handler(handler),
                root: true,
            },
        )
    }

    /// Register an [`ActionHandler`] implementation as an action.
    pub fn action_handler<H>(self, key: &str, handler: H) -> Self
    where
        H: ActionHandler + 'static,
    {
        self.action_decl(key, ActionDecl::Direct(Arc::new(handler)))
    }

    pub fn action_decl(mut self, key: &str, decl: ActionDecl) -> Self {
        self.actions.insert(key.to_string(), decl);
        self
    }

    pub fn getter<F>(mut self, key: &str, compute: F) -> Self
    where
        F: Fn(&GetterScope<'_>) -> Value + Send + Sync + 'static,
    {
        self.getters.insert(key.to_string(), Arc::new(compute));
        self
    }

    /// Nest a child module under `key`.
    pub fn module(mut self, key: &str, module: RawModule) -> Self {
        self.modules.insert(key.to_string(), module);
        self
    }
}

impl fmt::Debug for RawModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawModule")
            .field("state", &self.state)
            .field("namespaced", &self.namespaced)
            .field("mutations", &self.mutations.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn box_handler<F, Fut>(handler: F) -> Arc<dyn ActionHandler>
where
    F: Fn(ActionContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    Arc::new(FnActionHandler(
        move |ctx: ActionContext,
              payload: Option<Value>|
              -> BoxFuture<'static, Result<Value, ActionError>> {
            Box::pin(handler(ctx, payload))
        },
    ))
}

pub(crate) type NodeId = usize;

/// One installed module in the tree arena. `runtime` marks modules added
/// after construction; only those can be unregistered.
pub(crate) struct ModuleNode {
    pub(crate) raw: RawModule,
    pub(crate) state: Value,
    pub(crate) runtime: bool,
    pub(crate) children: IndexMap<String, NodeId>,
}

impl ModuleNode {
    pub(crate) fn new(raw: RawModule, runtime: bool) -> Self {
        let state = StateContainer::materialize(&raw.state);
        Self {
            raw,
            state,
            runtime,
            children: IndexMap::new(),
        }
    }

    pub(crate) fn namespaced(&self) -> bool {
        self.raw.namespaced
    }
}

impl fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleNode")
            .field("runtime", &self.runtime)
            .field("children", &self.children)
            .finish()
    }
}
