//! # CIL Analysis Library
//!
//! A static-analysis backend for managed stack bytecode: methods arrive as
//! decoded operation streams and come out as three-address code plus an
//! interprocedural may points-to graph and the reachable call graph.
//!
//! ## Architecture Overview
//!
//! The backend follows a pipeline architecture:
//!
//! ```text
//! Raw ops → Blocks → Lifter → TAC body → CFG → Intra PTA → Interproc engine
//!    ↓        ↓        ↓         ↓         ↓        ↓            ↓
//!  Decoder  Leaders  Symbolic  MethodBody Edges  Dataflow   Call graph +
//!  (extern)          stack                       fixpoint   points-to
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cil_analysis::{Analyzer, AnalyzerConfig};
//! # use cil_analysis::common::types::{MethodRef, TypeRef, MethodDefinition, SymbolResolver};
//! # use cil_analysis::analysis::AnalysisHost;
//! # struct Host;
//! # impl SymbolResolver for Host {
//! #     fn method_definition(&self, _m: &MethodRef) -> Option<&MethodDefinition> { None }
//! #     fn find_method_implementation(&self, _t: &TypeRef, _m: &MethodRef) -> Option<MethodRef> { None }
//! # }
//! # impl AnalysisHost for Host {}
//! # let host = Host;
//! # let root: MethodRef = todo!();
//!
//! let analyzer = Analyzer::new(AnalyzerConfig::default());
//! let output = analyzer.analyze(&host, &root)?;
//! println!("{}", output.call_graph);
//! # Ok::<(), cil_analysis::common::errors::AnalysisError>(())
//! ```

pub mod analysis;
pub mod common;
pub mod core;

// Re-export main types for convenience
pub use common::{
    config::{AnalyzerConfig, EngineConfig, LifterConfig, UnknownPolicy},
    errors::{AnalysisError, AnalysisResult, LiftError, LiftWarning, ResolveError},
    types::{MethodDefinition, MethodRef, OpKind, OpValue, RawBody, RawOp, SymbolResolver, TypeRef},
};

pub use crate::core::{
    lifter::{LiftedMethod, Lifter},
    tac::{MethodBody, TacInstr, TacOperand, Variable},
};

pub use analysis::{
    AnalysisHost, CallGraph, ControlFlowGraph, InterproceduralAnalysis, NodeArena, PointsToGraph,
    ProgramAnalysisInfo,
};

/// Final artifacts of one interprocedural run.
#[derive(Debug)]
pub struct AnalysisOutput {
    /// Reachable call graph rooted at the analyzed method
    pub call_graph: CallGraph,
    /// Per-method CFG, dataflow and memoized graphs
    pub info: ProgramAnalysisInfo,
    /// Node arena interpreting every `NodeId` in the results
    pub arena: NodeArena,
}

/// Main analysis facade providing the high-level API.
pub struct Analyzer {
    config: AnalyzerConfig,
    lifter: Lifter,
}

impl Analyzer {
    /// Create a new analyzer with configuration.
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            lifter: Lifter::new(config.lifter.clone()),
            config,
        }
    }

    /// Lift a single method to three-address code.
    pub fn lift(&self, def: &MethodDefinition) -> AnalysisResult<LiftedMethod> {
        self.lifter.lift(def)
    }

    /// Run the interprocedural analysis from `root`.
    pub fn analyze<H: AnalysisHost>(
        &self,
        host: &H,
        root: &MethodRef,
    ) -> AnalysisResult<AnalysisOutput> {
        let mut engine = InterproceduralAnalysis::new(host, self.config.clone());
        engine.analyze(root)?;
        let (call_graph, info, arena) = engine.into_results();
        Ok(AnalysisOutput {
            call_graph,
            info,
            arena,
        })
    }
}
