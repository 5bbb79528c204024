//! Points-to graph and the shared abstract-node arena
//!
//! Abstract heap nodes are interned once in a [`NodeArena`] owned by the
//! interprocedural engine; a [`NodeId`] is an index into it. Because node
//! identity is global, per-graph sets union element-wise and graph equality
//! is plain structural comparison of the node set, root map and edge map.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::common::types::{MethodRef, TypeRef};
use crate::core::tac::Variable;

/// Pseudo-field for array elements; indices are smashed.
pub const ARRAY_FIELD: &str = "[]";
/// Pseudo-field for pointer dereference.
pub const DEREF_FIELD: &str = "*";

/// Index of an abstract node in the arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identity of an abstract heap node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKey {
    /// The null reference
    Null,
    /// Object a parameter may point to on method entry
    ParamEntry {
        method: MethodRef,
        index: u16,
        ty: TypeRef,
    },
    /// Object allocated at a bytecode offset, distinguished per frame depth
    AllocSite { offset: u32, ty: TypeRef, frame: u32 },
    /// The single node holding all static fields
    StaticArea,
}

impl NodeKey {
    /// Static type of the abstracted object, when it has one.
    pub fn node_type(&self) -> Option<&TypeRef> {
        match self {
            NodeKey::ParamEntry { ty, .. } | NodeKey::AllocSite { ty, .. } => Some(ty),
            NodeKey::Null | NodeKey::StaticArea => None,
        }
    }
}

/// Interner for abstract nodes, shared across every graph of a run.
#[derive(Debug, Clone)]
pub struct NodeArena {
    keys: IndexSet<NodeKey>,
}

impl NodeArena {
    /// The null node, present in every arena.
    pub const NULL: NodeId = NodeId(0);
    /// The static-field area node, present in every arena.
    pub const STATIC_AREA: NodeId = NodeId(1);

    pub fn new() -> Self {
        let mut keys = IndexSet::new();
        keys.insert(NodeKey::Null);
        keys.insert(NodeKey::StaticArea);
        Self { keys }
    }

    /// Intern a key, returning its stable id.
    pub fn intern(&mut self, key: NodeKey) -> NodeId {
        let (index, _) = self.keys.insert_full(key);
        NodeId(index as u32)
    }

    /// Key of an interned node.
    pub fn key(&self, id: NodeId) -> Option<&NodeKey> {
        self.keys.get_index(id.0 as usize)
    }

    /// Static type of an interned node, when it has one.
    pub fn node_type(&self, id: NodeId) -> Option<&TypeRef> {
        self.key(id).and_then(NodeKey::node_type)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot pushed by `new_frame` and restored by `restore_frame`.
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    /// Caller's variable-root map at the call site
    saved_roots: IndexMap<Variable, BTreeSet<NodeId>>,
    /// Parameter binding installed for the callee (kept for diagnostics)
    binding: Vec<(Variable, Variable)>,
}

/// May-points-to graph: variable roots plus field edges over abstract nodes,
/// with a frame stack for per-call-site variable scoping.
///
/// Empty target sets are never stored, so structural equality is
/// well-defined. Saved frames are never mutated and are excluded from
/// [`PointsToGraph::graph_equals`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointsToGraph {
    /// Nodes present in this graph
    nodes: BTreeSet<NodeId>,
    /// Variable roots in the current frame
    roots: IndexMap<Variable, BTreeSet<NodeId>>,
    /// Field points-to edges
    edges: BTreeMap<(NodeId, String), BTreeSet<NodeId>>,
    /// Saved caller frames
    frames: Vec<Frame>,
}

impl PointsToGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes present in this graph.
    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    /// Variables rooted in the current frame.
    pub fn root_variables(&self) -> impl Iterator<Item = &Variable> {
        self.roots.keys()
    }

    /// Targets of a variable in the current frame.
    pub fn targets(&self, var: &Variable) -> BTreeSet<NodeId> {
        self.roots.get(var).cloned().unwrap_or_default()
    }

    pub fn has_roots(&self, var: &Variable) -> bool {
        self.roots.contains_key(var)
    }

    /// Strong update of a variable's roots.
    pub fn assign(&mut self, var: Variable, targets: BTreeSet<NodeId>) {
        if targets.is_empty() {
            self.roots.remove(&var);
        } else {
            self.nodes.extend(targets.iter().copied());
            self.roots.insert(var, targets);
        }
    }

    /// Weak update of a variable's roots.
    pub fn merge_root(&mut self, var: Variable, targets: BTreeSet<NodeId>) {
        if targets.is_empty() {
            return;
        }
        self.nodes.extend(targets.iter().copied());
        self.roots.entry(var).or_default().extend(targets);
    }

    /// Idempotent allocation for a site within the current frame.
    pub fn allocate(&mut self, arena: &mut NodeArena, offset: u32, ty: &TypeRef) -> NodeId {
        let id = arena.intern(NodeKey::AllocSite {
            offset,
            ty: ty.clone(),
            frame: self.frames.len() as u32,
        });
        self.nodes.insert(id);
        id
    }

    /// Targets of `node.field`.
    pub fn field_targets(&self, node: NodeId, field: &str) -> BTreeSet<NodeId> {
        self.edges
            .get(&(node, field.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Union of `n.field` over every target `n` of `obj`.
    pub fn load_field(&self, obj: &Variable, field: &str) -> BTreeSet<NodeId> {
        let mut result = BTreeSet::new();
        for node in self.targets(obj) {
            result.extend(self.field_targets(node, field));
        }
        result
    }

    /// Weak update of `n.field` for every target `n` of `obj`.
    pub fn store_field(&mut self, obj: &Variable, field: &str, values: &BTreeSet<NodeId>) {
        if values.is_empty() {
            return;
        }
        self.nodes.extend(values.iter().copied());
        for node in self.targets(obj) {
            self.edges
                .entry((node, field.to_string()))
                .or_default()
                .extend(values.iter().copied());
        }
    }

    /// Weak update of a static field, hung off the static-area node.
    pub fn store_static(&mut self, ty: &TypeRef, field: &str, values: &BTreeSet<NodeId>) {
        if values.is_empty() {
            return;
        }
        self.nodes.insert(NodeArena::STATIC_AREA);
        self.nodes.extend(values.iter().copied());
        self.edges
            .entry((NodeArena::STATIC_AREA, static_field_key(ty, field)))
            .or_default()
            .extend(values.iter().copied());
    }

    /// Targets of a static field.
    pub fn load_static(&self, ty: &TypeRef, field: &str) -> BTreeSet<NodeId> {
        self.edges
            .get(&(NodeArena::STATIC_AREA, static_field_key(ty, field)))
            .cloned()
            .unwrap_or_default()
    }

    /// Per-root and per-edge set union. Frames are kept from `self`.
    pub fn union(&mut self, other: &PointsToGraph) {
        self.nodes.extend(other.nodes.iter().copied());
        for (var, targets) in &other.roots {
            self.roots
                .entry(var.clone())
                .or_default()
                .extend(targets.iter().copied());
        }
        for (key, targets) in &other.edges {
            self.edges
                .entry(key.clone())
                .or_default()
                .extend(targets.iter().copied());
        }
    }

    /// Structural equality of node set, root map and edge map.
    pub fn graph_equals(&self, other: &PointsToGraph) -> bool {
        self.nodes == other.nodes && self.roots == other.roots && self.edges == other.edges
    }

    /// Push the current root map and install a callee frame seeded by
    /// `binding` (callee parameter inherits the caller argument's roots).
    /// Returns the depth to restore to.
    pub fn new_frame(&mut self, binding: &[(Variable, Variable)]) -> usize {
        let mut callee_roots: IndexMap<Variable, BTreeSet<NodeId>> = IndexMap::new();
        for (param, arg) in binding {
            let targets = self.targets(arg);
            if !targets.is_empty() {
                callee_roots.insert(param.clone(), targets);
            }
        }
        let prev = self.frames.len();
        let saved_roots = std::mem::replace(&mut self.roots, callee_roots);
        self.frames.push(Frame {
            saved_roots,
            binding: binding.to_vec(),
        });
        prev
    }

    /// Pop back to `prev`, then propagate each callee variable's roots to
    /// its bound caller variable (the result binding).
    pub fn restore_frame(&mut self, prev: usize, result_binding: &[(Variable, Variable)]) {
        let captured: Vec<(Variable, BTreeSet<NodeId>)> = result_binding
            .iter()
            .map(|(callee_var, caller_var)| (caller_var.clone(), self.targets(callee_var)))
            .collect();

        while self.frames.len() > prev {
            if let Some(frame) = self.frames.pop() {
                self.roots = frame.saved_roots;
            }
        }

        for (caller_var, targets) in captured {
            self.assign(caller_var, targets);
        }
    }

    /// Fold a callee exit graph into this call-site graph: heap nodes and
    /// edges accumulate, while the root map is replaced by the callee's
    /// exit roots. The caller's own roots come back with `restore_frame`;
    /// keeping the caller's heap matters when a memoized exit computed from
    /// an older, smaller input is replayed here.
    pub fn adopt_results(&mut self, other: &PointsToGraph) {
        self.nodes.extend(other.nodes.iter().copied());
        self.roots = other.roots.clone();
        for (key, targets) in &other.edges {
            self.edges
                .entry(key.clone())
                .or_default()
                .extend(targets.iter().copied());
        }
    }

    /// Current frame depth.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }
}

fn static_field_key(ty: &TypeRef, field: &str) -> String {
    format!("{}::{}", ty.name, field)
}
