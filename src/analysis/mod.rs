//! Analysis passes: control flow, points-to, call graph

pub mod call_graph;
pub mod cfg;
pub mod interproc;
pub mod points_to;
pub mod ptg;

pub use call_graph::CallGraph;
pub use cfg::ControlFlowGraph;
pub use interproc::{AnalysisHost, InterproceduralAnalysis, ProgramAnalysisInfo};
pub use points_to::{CallHandler, CallSite, IdentityCallHandler, PointsToAnalysis};
pub use ptg::{NodeArena, NodeId, NodeKey, PointsToGraph};
