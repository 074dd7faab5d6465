// Module tree.
//
// An arena of nodes indexed by integer id, each holding a name -> child-id
// map, so the tree carries no reference cycles and namespaces are re-derived
// by walking a path rather than cached.

use std::collections::HashMap;

use crate::module::{ModuleNode, NodeId, RawModule};

/// Errors raised by module registration and tree maintenance.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("invalid module declaration in '{path}': '{key}' {reason}")]
    Validation {
        path: String,
        key: String,
        reason: String,
    },

    #[error("no module registered at '{path}'")]
    ModuleNotFound { path: String },

    #[error("cannot register a module at the root path")]
    EmptyModulePath,

    #[error("update names unknown module '{key}' under '{path}'; manual reload is needed")]
    UnknownModuleInUpdate { path: String, key: String },
}

pub(crate) struct ModuleTree {
    nodes: HashMap<NodeId, ModuleNode>,
    root: NodeId,
    next_id: NodeId,
}

impl ModuleTree {
    pub(crate) fn new(raw_root: RawModule) -> Result<Self, ModuleError> {
        let mut tree = Self {
            nodes: HashMap::new(),
            root: 0,
            next_id: 0,
        };
        tree.register(&[], raw_root, false)?;
        Ok(tree)
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&ModuleNode> {
        self.nodes.get(&id)
    }

    /// Walk children by key sequence from the root.
    pub(crate) fn get(&self, path: &[String]) -> Option<NodeId> {
        let mut id = self.root;
        for key in path {
            id = *self.nodes.get(&id)?.children.get(key)?;
        }
        Some(id)
    }

    /// Accumulate `key + "/"` for every namespaced node entered along the
    /// path. Non-namespaced ancestors are transparent.
    pub(crate) fn namespace_of(&self, path: &[String]) -> String {
        let mut namespace = String::new();
        let mut id = self.root;
        for key in path {
            let child = self.nodes.get(&id).and_then(|n| n.children.get(key));
            let Some(&child) = child else {
                tracing::error!(path = %join_path(path), key = %key, "namespace walk hit a missing module");
                break;
            };
            id = child;
            if self.nodes.get(&child).is_some_and(|n| n.namespaced()) {
                namespace.push_str(key);
                namespace.push('/');
            }
        }
        namespace
    }

    /// Create a node for `raw`, attach it under `path`, and recurse into its
    /// nested module declarations. Construction-time modules pass
    /// `runtime = false` and become permanent.
    pub(crate) fn register(
        &mut self,
        path: &[String],
        raw: RawModule,
        runtime: bool,
    ) -> Result<(), ModuleError> {
        #[cfg(debug_assertions)]
        assert_raw_module(path, &raw)?;

        if path.is_empty() {
            if self.nodes.contains_key(&self.root) {
                self.drop_subtree(self.root);
            }
            let id = self.insert(ModuleNode::new(raw, runtime));
            self.root = id;
            let nested = self.drain_nested(id);
            for (key, child) in nested {
                self.attach(id, key, child, runtime);
            }
            return Ok(());
        }

        let parent = self
            .get(&path[..path.len() - 1])
            .ok_or_else(|| ModuleError::ModuleNotFound {
                path: join_path(&path[..path.len() - 1]),
            })?;
        let key = path[path.len() - 1].clone();
        self.attach(parent, key, raw, runtime);
        Ok(())
    }

    /// Detach and drop the node at `path` together with all descendants.
    /// Declines (returns false) for the root and for construction-time
    /// modules: a module another part of the system was built against can
    /// never be torn down at runtime.
    pub(crate) fn unregister(&mut self, path: &[String]) -> bool {
        if path.is_empty() {
            return false;
        }
        let Some(parent) = self.get(&path[..path.len() - 1]) else {
            return false;
        };
        let key = &path[path.len() - 1];
        let Some(&child) = self.nodes.get(&parent).and_then(|n| n.children.get(key)) else {
            return false;
        };
        if !self.nodes.get(&child).is_some_and(|n| n.runtime) {
            return false;
        }
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.shift_remove(key);
        }
        self.drop_subtree(child);
        true
    }

    /// Lockstep walk of the live tree and a new configuration. Validates the
    /// whole configuration first: an unknown child anywhere aborts the
    /// update with zero effect. On the apply pass each matched node's
    /// namespaced flag is overwritten and any declared handler group is
    /// wholesale-replaced; absent groups are left untouched.
    pub(crate) fn update(&mut self, new_raw_root: RawModule) -> Result<(), ModuleError> {
        #[cfg(debug_assertions)]
        assert_raw_module(&[], &new_raw_root)?;

        self.check_update(self.root, &[], &new_raw_root)?;
        self.apply_update(self.root, new_raw_root);
        Ok(())
    }

    fn check_update(
        &self,
        id: NodeId,
        path: &[String],
        new_raw: &RawModule,
    ) -> Result<(), ModuleError> {
        for (key, child_raw) in &new_raw.modules {
            let child = self.nodes.get(&id).and_then(|n| n.children.get(key));
            let Some(&child) = child else {
                tracing::warn!(
                    path = %join_path(path),
                    key = %key,
                    "update declares a module absent from the live tree; aborting"
                );
                return Err(ModuleError::UnknownModuleInUpdate {
                    path: join_path(path),
                    key: key.clone(),
                });
            };
            let mut child_path = path.to_vec();
            child_path.push(key.clone());
            self.check_update(child, &child_path, child_raw)?;
        }
        Ok(())
    }

    fn apply_update(&mut self, id: NodeId, mut new_raw: RawModule) {
        let nested: Vec<(String, RawModule)> = new_raw.modules.drain(..).collect();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.raw.namespaced = new_raw.namespaced;
            if !new_raw.mutations.is_empty() {
                node.raw.mutations = std::mem::take(&mut new_raw.mutations);
            }
            if !new_raw.actions.is_empty() {
                node.raw.actions = std::mem::take(&mut new_raw.actions);
            }
            if !new_raw.getters.is_empty() {
                node.raw.getters = std::mem::take(&mut new_raw.getters);
            }
        }
        for (key, child_raw) in nested {
            if let Some(&child) = self.nodes.get(&id).and_then(|n| n.children.get(&key)) {
                self.apply_update(child, child_raw);
            }
        }
    }

    fn insert(&mut self, node: ModuleNode) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    fn attach(&mut self, parent: NodeId, key: String, raw: RawModule, runtime: bool) {
        let node = ModuleNode::new(raw, runtime);
        let id = self.insert(node);
        let displaced = self
            .nodes
            .get_mut(&parent)
            .and_then(|parent_node| parent_node.children.insert(key, id));
        if let Some(old) = displaced {
            self.drop_subtree(old);
        }
        let nested = self.drain_nested(id);
        for (child_key, child_raw) in nested {
            self.attach(id, child_key, child_raw, runtime);
        }
    }

    fn drain_nested(&mut self, id: NodeId) -> Vec<(String, RawModule)> {
        self.nodes
            .get_mut(&id)
            .map(|n| n.raw.modules.drain(..).collect())
            .unwrap_or_default()
    }

    fn drop_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self
            .nodes
            .get(&id)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default();
        for child in children {
            self.drop_subtree(child);
        }
        self.nodes.remove(&id);
    }
}

impl std::fmt::Debug for ModuleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleTree")
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .finish()
    }
}

pub(crate) fn join_path(path: &[String]) -> String {
    path.join(".")
}

#[cfg(debug_assertions)]
fn assert_raw_module(path: &[String], raw: &RawModule) -> Result<(), ModuleError> {
    for key in raw.mutations.keys() {
        assert_declared_key(path, "mutations", key)?;
    }
    for key in raw.actions.keys() {
        assert_declared_key(path, "actions", key)?;
    }
    for key in raw.getters.keys() {
        assert_declared_key(path, "getters", key)?;
    }
    for (key, child) in &raw.modules {
        assert_declared_key(path, "modules", key)?;
        let mut child_path = path.to_vec();
        child_path.push(key.clone());
        assert_raw_module(&child_path, child)?;
    }
    Ok(())
}

#[cfg(debug_assertions)]
fn assert_declared_key(path: &[String], group: &str, key: &str) -> Result<(), ModuleError> {
    let reason = if key.is_empty() {
        "must not be empty"
    } else if key.contains('/') {
        "must not contain '/'"
    } else {
        return Ok(());
    };
    Err(ModuleError::Validation {
        path: join_path(path),
        key: format!("{group}.{key}"),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn leaf(namespaced: bool) -> RawModule {
        RawModule::new()
            .namespaced(namespaced)
            .state(json!({"count": 0}))
    }

    #[test]
    fn namespace_accumulates_only_namespaced_ancestors() {
        let root = RawModule::new().module(
            "a",
            leaf(true).module("b", leaf(false).module("c", leaf(true))),
        );
        let tree = ModuleTree::new(root).unwrap();

        assert_eq!(tree.namespace_of(&path(&["a"])), "a/");
        assert_eq!(tree.namespace_of(&path(&["a", "b"])), "a/");
        assert_eq!(tree.namespace_of(&path(&["a", "b", "c"])), "a/c/");
    }

    #[test]
    fn get_walks_children_and_misses_cleanly() {
        let root = RawModule::new().module("a", leaf(true).module("b", leaf(false)));
        let tree = ModuleTree::new(root).unwrap();

        assert!(tree.get(&path(&["a", "b"])).is_some());
        assert!(tree.get(&path(&["a", "x"])).is_none());
        assert!(tree.get(&path(&["x"])).is_none());
    }

    #[test]
    fn state_factory_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let module = RawModule::new().state_with(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            json!({"ready": true})
        });
        let mut tree = ModuleTree::new(RawModule::new()).unwrap();
        tree.register(&path(&["lazy"]), module, true).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let id = tree.get(&path(&["lazy"])).unwrap();
        assert_eq!(tree.node(id).unwrap().state, json!({"ready": true}));
    }

    #[test]
    fn unregister_removes_only_runtime_modules() {
        let root = RawModule::new().module("fixed", leaf(true));
        let mut tree = ModuleTree::new(root).unwrap();
        tree.register(&path(&["added"]), leaf(true), true).unwrap();

        assert!(!tree.unregister(&path(&["fixed"])));
        assert!(tree.get(&path(&["fixed"])).is_some());

        assert!(tree.unregister(&path(&["added"])));
        assert!(tree.get(&path(&["added"])).is_none());

        assert!(!tree.unregister(&path(&["missing"])));
        assert!(!tree.unregister(&[]));
    }

    #[test]
    fn unregister_drops_descendants() {
        let mut tree = ModuleTree::new(RawModule::new()).unwrap();
        tree.register(&path(&["a"]), leaf(true).module("b", leaf(true)), true)
            .unwrap();
        assert!(tree.get(&path(&["a", "b"])).is_some());

        assert!(tree.unregister(&path(&["a"])));
        assert!(tree.get(&path(&["a", "b"])).is_none());
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn update_merges_declared_groups_and_keeps_the_rest() {
        let root = RawModule::new().module(
            "a",
            leaf(true)
                .mutation("bump", |_, _| {})
                .getter("kept", |_| json!(1)),
        );
        let mut tree = ModuleTree::new(root).unwrap();

        let new_root = RawModule::new().module(
            "a",
            RawModule::new()
                .namespaced(false)
                .mutation("replaced", |_, _| {}),
        );
        tree.update(new_root).unwrap();

        let id = tree.get(&path(&["a"])).unwrap();
        let node = tree.node(id).unwrap();
        assert!(!node.namespaced());
        assert!(node.raw.mutations.contains_key("replaced"));
        assert!(!node.raw.mutations.contains_key("bump"));
        // getters were absent from the new config: untouched
        assert!(node.raw.getters.contains_key("kept"));
    }

    #[test]
    fn update_with_unknown_child_aborts_without_side_effects() {
        let root = RawModule::new().module("a", leaf(true));
        let mut tree = ModuleTree::new(root).unwrap();

        let new_root = RawModule::new().module(
            "a",
            RawModule::new().namespaced(false).module("ghost", leaf(true)),
        );
        let err = tree.update(new_root).unwrap_err();
        assert!(matches!(err, ModuleError::UnknownModuleInUpdate { .. }));

        // the matched ancestor was not touched either
        let id = tree.get(&path(&["a"])).unwrap();
        assert!(tree.node(id).unwrap().namespaced());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn register_rejects_keys_that_break_namespacing() {
        let mut tree = ModuleTree::new(RawModule::new()).unwrap();
        let bad = RawModule::new().mutation("a/b", |_, _| {});
        let err = tree.register(&path(&["m"]), bad, true).unwrap_err();
        assert!(matches!(err, ModuleError::Validation { .. }));
    }
}
