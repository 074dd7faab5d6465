//! Trellis: a hierarchical, namespaced state container.
//!
//! State lives in one canonical tree assembled from composable modules.
//! Mutations are synchronous, named transitions committed through a single
//! gate; actions are async handlers dispatched by fully-qualified type
//! string; getters are memoized computations over scoped state. Modules can
//! be registered and unregistered at runtime, and handler definitions can be
//! hot-swapped without discarding state.
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use trellis::{RawModule, Store};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let counter = RawModule::new()
//!     .namespaced(true)
//!     .state(json!({"count": 0}))
//!     .mutation("increment", |state, _| {
//!         let count = state["count"].as_i64().unwrap_or(0);
//!         state["count"] = json!(count + 1);
//!     })
//!     .action("increment_async", |ctx, _| async move {
//!         ctx.commit("increment", None);
//!         Ok(Value::Null)
//!     })
//!     .getter("count", |scope| scope.state()["count"].clone());
//!
//! let store = Store::new(RawModule::new().module("counter", counter))?;
//! store.commit("counter/increment", None);
//! store.dispatch("counter/increment_async", None).await?;
//! assert_eq!(store.getter("counter/count"), Some(json!(2)));
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod module;
pub mod reactive;
pub mod store;
pub mod tree;

pub use context::{ActionContext, CallOptions, GetterScope};
pub use module::{ActionDecl, ActionHandler, GetterFn, MutationFn, RawModule, StateSource};
pub use reactive::{Computed, StateContainer};
pub use store::{
    ActionError, ActionMetadata, ActionRecord, ModuleOptions, MutationRecord, Store, StoreOptions,
    Subscription, WatchHandle, WatchOptions,
};
pub use tree::ModuleError;
