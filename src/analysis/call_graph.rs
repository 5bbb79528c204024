//! Reachable call graph built during interprocedural analysis
//!
//! Edges are keyed by `(caller, call-site label)` and map to the set of
//! resolved callees. The structure is insert-only, which is what makes the
//! interprocedural fixed point monotone.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::common::types::MethodRef;

/// Call graph over method references.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    /// Known methods, root first
    methods: IndexSet<MethodRef>,
    /// Call-site edges
    edges: IndexMap<(MethodRef, String), IndexSet<MethodRef>>,
    /// Analysis entry point
    root: Option<MethodRef>,
}

/// Serializable view of a call graph.
#[derive(Debug, Clone, Serialize)]
pub struct CallGraphExport {
    pub root: Option<MethodRef>,
    pub methods: Vec<MethodRef>,
    pub edges: Vec<CallEdgeExport>,
}

/// One exported call-site edge.
#[derive(Debug, Clone, Serialize)]
pub struct CallEdgeExport {
    pub caller: MethodRef,
    pub site: String,
    pub callees: Vec<MethodRef>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the analysis entry point.
    pub fn set_root(&mut self, method: MethodRef) {
        self.add_method(method.clone());
        self.root = Some(method);
    }

    pub fn root(&self) -> Option<&MethodRef> {
        self.root.as_ref()
    }

    /// Add a method node.
    pub fn add_method(&mut self, method: MethodRef) {
        self.methods.insert(method);
    }

    /// Add a call edge; both endpoints become nodes.
    pub fn add_edge(&mut self, caller: &MethodRef, site: &str, callee: &MethodRef) {
        self.methods.insert(caller.clone());
        self.methods.insert(callee.clone());
        self.edges
            .entry((caller.clone(), site.to_string()))
            .or_default()
            .insert(callee.clone());
    }

    /// Callees recorded for one call site.
    pub fn callees(&self, caller: &MethodRef, site: &str) -> Option<&IndexSet<MethodRef>> {
        self.edges.get(&(caller.clone(), site.to_string()))
    }

    pub fn contains_edge(&self, caller: &MethodRef, site: &str, callee: &MethodRef) -> bool {
        self.callees(caller, site)
            .is_some_and(|set| set.contains(callee))
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodRef> {
        self.methods.iter()
    }

    pub fn contains_method(&self, method: &MethodRef) -> bool {
        self.methods.contains(method)
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Number of `(site, callee)` pairs.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(IndexSet::len).sum()
    }

    /// Call sites with their resolved callee sets.
    pub fn sites(&self) -> impl Iterator<Item = (&MethodRef, &str, &IndexSet<MethodRef>)> {
        self.edges
            .iter()
            .map(|((caller, site), callees)| (caller, site.as_str(), callees))
    }

    /// Serializable snapshot.
    pub fn export(&self) -> CallGraphExport {
        CallGraphExport {
            root: self.root.clone(),
            methods: self.methods.iter().cloned().collect(),
            edges: self
                .edges
                .iter()
                .map(|((caller, site), callees)| CallEdgeExport {
                    caller: caller.clone(),
                    site: site.clone(),
                    callees: callees.iter().cloned().collect(),
                })
                .collect(),
        }
    }

    /// JSON report of the graph.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.export())
    }
}

impl fmt::Display for CallGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ((caller, site), callees) in &self.edges {
            write!(f, "{} [{}] ->", caller, site)?;
            for (i, callee) in callees.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, " {}", callee)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
