//! Interprocedural points-to and call-graph engine
//!
//! Drives per-method intraprocedural analyses to a global fixed point over a
//! growing call graph. Virtual callees are resolved against the receiver's
//! current points-to targets, devirtualizing on the fly; each callee is
//! re-analyzed only when its memoized input graph strictly grows, which
//! bounds the number of sweeps.

use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace, warn};

use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::call_graph::CallGraph;
use crate::analysis::points_to::{
    result_variable, CallHandler, CallSite, DataFlowResult, PointsToAnalysis,
};
use crate::analysis::ptg::{NodeArena, PointsToGraph};
use crate::common::config::AnalyzerConfig;
use crate::common::errors::{AnalysisError, LiftError, ResolveError};
use crate::common::types::{MethodDefinition, MethodRef, SymbolResolver};
use crate::core::lifter::Lifter;
use crate::core::tac::Variable;

/// Per-method analysis artifacts.
///
/// This is the typed replacement for the string-keyed info table of older
/// engines; the legacy key names survive only in [`MethodAnalysisInfo::summary`].
#[derive(Debug, Default)]
pub struct MethodAnalysisInfo {
    /// Cached control-flow graph (legacy key `CFG`)
    pub cfg: Option<Rc<ControlFlowGraph>>,
    /// Reusable intraprocedural analysis (legacy key `PTA`)
    pub points_to: Option<PointsToAnalysis>,
    /// Last completed dataflow result (legacy key `PTG`)
    pub dataflow: Option<DataFlowResult>,
    /// Memoized entry graph (legacy key `INPUT_PTG`)
    pub input_ptg: Option<PointsToGraph>,
    /// Exit graph of the last run (legacy key `OUTPUT_PTG`)
    pub output_ptg: Option<PointsToGraph>,
    /// The method's analysis is on the call stack right now
    in_progress: bool,
}

impl MethodAnalysisInfo {
    /// Debug summary naming the legacy info keys that are populated.
    pub fn summary(&self) -> String {
        let mut keys = Vec::new();
        if self.cfg.is_some() {
            keys.push("CFG");
        }
        if self.points_to.is_some() {
            keys.push("PTA");
        }
        if self.dataflow.is_some() {
            keys.push("PTG");
        }
        if self.input_ptg.is_some() {
            keys.push("INPUT_PTG");
        }
        if self.output_ptg.is_some() {
            keys.push("OUTPUT_PTG");
        }
        keys.join(" ")
    }
}

/// Analysis artifacts for every method touched by a run.
#[derive(Debug, Default)]
pub struct ProgramAnalysisInfo {
    methods: IndexMap<MethodRef, MethodAnalysisInfo>,
}

impl ProgramAnalysisInfo {
    pub fn get(&self, method: &MethodRef) -> Option<&MethodAnalysisInfo> {
        self.methods.get(method)
    }

    pub fn ensure(&mut self, method: &MethodRef) -> &mut MethodAnalysisInfo {
        self.methods.entry(method.clone()).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MethodRef, &MethodAnalysisInfo)> {
        self.methods.iter()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Capabilities the engine needs from its embedder: the symbol model plus
/// the three overridable analysis hooks.
pub trait AnalysisHost: SymbolResolver {
    /// Produce the control-flow graph for a newly reachable method.
    ///
    /// The default pipeline lifts the body and builds the graph; embedders
    /// with extra passes (web splitting, type inference) override this.
    fn on_reachable_method(
        &self,
        def: &MethodDefinition,
        config: &AnalyzerConfig,
    ) -> Result<ControlFlowGraph, AnalysisError>
    where
        Self: Sized,
    {
        let lifter = Lifter::new(config.lifter.clone());
        let lifted = lifter.lift_with_names(def, self)?;
        Ok(ControlFlowGraph::build(lifted))
    }

    /// Should an unresolved or external callee still be modeled? Returning
    /// `false` skips the callee entirely.
    fn on_unknown_method(&self, _callee: &MethodRef) -> bool {
        false
    }

    /// Effect of an unknown callee on the bound input graph. The default is
    /// the identity.
    fn process_unknown_method(
        &self,
        _callee: &MethodRef,
        _caller: &MethodRef,
        _call: &CallSite<'_>,
        _arena: &mut NodeArena,
        input: &PointsToGraph,
    ) -> PointsToGraph {
        input.clone()
    }
}

/// The interprocedural driver.
pub struct InterproceduralAnalysis<'h, H: AnalysisHost> {
    host: &'h H,
    config: AnalyzerConfig,
    arena: NodeArena,
    call_graph: CallGraph,
    info: ProgramAnalysisInfo,
}

impl<'h, H: AnalysisHost> InterproceduralAnalysis<'h, H> {
    pub fn new(host: &'h H, config: AnalyzerConfig) -> Self {
        Self {
            host,
            config,
            arena: NodeArena::new(),
            call_graph: CallGraph::new(),
            info: ProgramAnalysisInfo::default(),
        }
    }

    /// Analyze everything reachable from `root` and return the call graph.
    pub fn analyze(&mut self, root: &MethodRef) -> Result<&CallGraph, AnalysisError> {
        self.call_graph.set_root(root.clone());

        let mut arena = std::mem::take(&mut self.arena);
        let outcome = self.analyze_root(root, &mut arena);
        self.arena = arena;
        outcome?;

        Ok(&self.call_graph)
    }

    fn analyze_root(
        &mut self,
        root: &MethodRef,
        arena: &mut NodeArena,
    ) -> Result<(), AnalysisError> {
        if !self.ensure_cfg(root)? {
            return Err(ResolveError::MissingMethodBody {
                method: root.clone(),
            }
            .into());
        }
        self.info.ensure(root).input_ptg = Some(PointsToGraph::new());
        self.analyze_method(root, arena)?;
        Ok(())
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    pub fn info(&self) -> &ProgramAnalysisInfo {
        &self.info
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Tear down into the final artifacts.
    pub fn into_results(self) -> (CallGraph, ProgramAnalysisInfo, NodeArena) {
        (self.call_graph, self.info, self.arena)
    }

    /// Make sure the method's CFG and analysis are cached. Returns `false`
    /// when the method has to be treated as unknown (no definition, no
    /// body, or lifting aborted recoverably).
    fn ensure_cfg(&mut self, method: &MethodRef) -> Result<bool, AnalysisError> {
        if self
            .info
            .get(method)
            .is_some_and(|entry| entry.cfg.is_some())
        {
            return Ok(true);
        }
        let host = self.host;
        let Some(def) = host.method_definition(method) else {
            return Ok(false);
        };
        if def.body.is_none() {
            return Ok(false);
        }

        debug!(method = %method, "reachable method found");
        match host.on_reachable_method(def, &self.config) {
            Ok(cfg) => {
                let cfg = Rc::new(cfg);
                let pta = PointsToAnalysis::new(
                    cfg.clone(),
                    def,
                    self.config.engine.analyze_constructors,
                );
                let entry = self.info.ensure(method);
                entry.cfg = Some(cfg);
                entry.points_to = Some(pta);
                Ok(true)
            }
            Err(err) if err.is_recoverable() => {
                // An aborted lifting degrades the callee to unknown.
                warn!(method = %method, error = %err, "lifting aborted; treating method as unknown");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Run the method's dataflow until its memoized input stops growing.
    /// Growth can happen mid-run through recursive call cycles; each re-run
    /// requires a strictly larger input, so the loop terminates.
    fn analyze_method(
        &mut self,
        method: &MethodRef,
        arena: &mut NodeArena,
    ) -> Result<PointsToGraph, AnalysisError> {
        loop {
            let current_input = self
                .info
                .get(method)
                .and_then(|entry| entry.input_ptg.clone())
                .ok_or_else(|| AnalysisError::internal("analyze_method without an input graph"))?;

            let mut pta = {
                let entry = self.info.ensure(method);
                entry.in_progress = true;
                entry.points_to.take().ok_or_else(|| {
                    AnalysisError::internal("analyze_method without a cached analysis")
                })?
            };

            let outcome = pta.analyze(arena, current_input.clone(), self);
            let snapshot = pta.result().cloned();
            {
                let entry = self.info.ensure(method);
                entry.in_progress = false;
                entry.points_to = Some(pta);
                if let Some(result) = snapshot {
                    entry.dataflow = Some(result);
                }
            }
            let exit = outcome?;

            let entry = self.info.ensure(method);
            entry.output_ptg = Some(exit.clone());
            let grew = entry
                .input_ptg
                .as_ref()
                .is_some_and(|input| !input.graph_equals(&current_input));
            if !grew {
                return Ok(exit);
            }
            debug!(method = %method, "input graph grew during analysis; re-running");
        }
    }

    /// Resolve the callee set for a call site. The static callee is the
    /// fallback whenever a receiver target has no resolvable implementation.
    fn resolve_callees(
        &self,
        call: &CallSite<'_>,
        arena: &NodeArena,
        input: &PointsToGraph,
    ) -> IndexSet<MethodRef> {
        let mut callees = IndexSet::new();
        if call.is_virtual() && self.config.engine.devirtualize {
            if let Some(receiver) = call.receiver() {
                for node in input.targets(receiver) {
                    let Some(ty) = arena.node_type(node) else {
                        continue;
                    };
                    match self.host.find_method_implementation(ty, call.callee) {
                        Some(implementation) => {
                            trace!(receiver_type = %ty, callee = %implementation, "devirtualized");
                            callees.insert(implementation);
                        }
                        None => {
                            callees.insert(call.callee.clone());
                        }
                    }
                }
            }
        } else {
            callees.insert(call.callee.clone());
        }
        callees
    }

    /// Steps (a)-(g) of the per-callee protocol. Returns `None` when the
    /// callee was skipped, leaving no trace in the info table.
    fn process_one_callee(
        &mut self,
        caller: &MethodRef,
        call: &CallSite<'_>,
        callee: &MethodRef,
        arena: &mut NodeArena,
        input: &PointsToGraph,
    ) -> Result<Option<PointsToGraph>, AnalysisError> {
        let known = self.ensure_cfg(callee)?;

        let callee_params: Vec<Variable> = if known {
            let host = self.host;
            let def = host
                .method_definition(callee)
                .ok_or_else(|| AnalysisError::internal("known callee lost its definition"))?;
            let mut params = Vec::with_capacity(def.parameters.len() + 1);
            if !def.is_static() {
                params.push(Variable::This);
            }
            params.extend((0..def.parameters.len()).map(|i| Variable::Param(i as u16)));
            params
        } else {
            if !self.host.on_unknown_method(callee) {
                debug!(callee = %callee, "skipping unknown method");
                return Ok(None);
            }
            // Synthesized parameter list: a receiver local plus one local
            // per declared (and vararg extra) parameter.
            let declared =
                callee.parameter_types.len() + callee.extra_parameter_types.len();
            let mut params = Vec::with_capacity(declared + 1);
            if !callee.is_static {
                params.push(Variable::Local("this".to_string()));
            }
            params.extend((1..=declared).map(|i| Variable::Local(format!("p{}", i))));
            params
        };

        if callee_params.len() != call.args.len() {
            return Err(LiftError::ArgumentCountMismatch {
                method: callee.to_string(),
                expected: callee_params.len(),
                actual: call.args.len(),
            }
            .into());
        }

        // (b) clone the caller graph and enter the callee frame. `bound`
        // keeps the call site's frame stack for the restore in (g).
        let mut bound = input.clone();
        let binding: Vec<(Variable, Variable)> = callee_params
            .iter()
            .zip(call.args.iter())
            .filter_map(|(param, arg)| {
                arg.as_var().map(|var| (param.clone(), var.clone()))
            })
            .collect();
        let prev = bound.new_frame(&binding);

        // (c) compare against the memoized input; a subsumed input shrinks
        // to a no-op after the union. The merged graph keeps the frame stack
        // of the first stored input so the callee's allocation-site frame
        // keys stay stable across re-runs from deeper call sites.
        let (callee_input, changed) =
            match self.info.get(callee).and_then(|e| e.input_ptg.as_ref()) {
                None => (bound.clone(), true),
                Some(old) => {
                    if bound.graph_equals(old) {
                        (old.clone(), false)
                    } else {
                        let mut merged = old.clone();
                        merged.union(&bound);
                        let changed = !merged.graph_equals(old);
                        (merged, changed)
                    }
                }
            };

        let out_ptg = if changed {
            self.info.ensure(callee).input_ptg = Some(callee_input.clone());
            if !known {
                self.host
                    .process_unknown_method(callee, caller, call, arena, &callee_input)
            } else if self
                .info
                .get(callee)
                .is_some_and(|entry| entry.in_progress)
            {
                // Recursive cycle: the owning analyze_method loop observes
                // the grown input and re-runs once this pass completes.
                debug!(callee = %callee, "recursive callee in progress; using cached output");
                self.cached_exit(callee).unwrap_or(callee_input)
            } else {
                self.analyze_method(callee, arena)?
            }
        } else {
            self.cached_exit(callee).unwrap_or(callee_input)
        };

        // (f) publish the callee's exit graph.
        self.info.ensure(callee).output_ptg = Some(out_ptg.clone());

        // (g) back to the caller frame: the callee's exit data rides on the
        // call site's frame stack, then the result is rebound.
        let mut restored = bound;
        restored.adopt_results(&out_ptg);
        let result_binding: Vec<(Variable, Variable)> = call
            .result
            .map(|dst| vec![(result_variable(), dst.clone())])
            .unwrap_or_default();
        restored.restore_frame(prev, &result_binding);
        Ok(Some(restored))
    }

    fn cached_exit(&self, method: &MethodRef) -> Option<PointsToGraph> {
        self.info
            .get(method)
            .and_then(|entry| entry.dataflow.as_ref())
            .map(|result| result.exit.clone())
    }
}

impl<'h, H: AnalysisHost> CallHandler for InterproceduralAnalysis<'h, H> {
    fn process_method_call(
        &mut self,
        caller: &MethodRef,
        call: &CallSite<'_>,
        arena: &mut NodeArena,
        input: &PointsToGraph,
    ) -> Result<PointsToGraph, AnalysisError> {
        // (1) resolve, (2) record edges: the static callee unconditionally,
        // the devirtualized set on top.
        let callees = self.resolve_callees(call, arena, input);
        let label = call.label();
        self.call_graph.add_method(caller.clone());
        self.call_graph.add_edge(caller, &label, call.callee);
        for callee in &callees {
            self.call_graph.add_edge(caller, &label, callee);
        }
        trace!(
            caller = %caller,
            site = %label,
            resolved = callees.len(),
            "call site processed"
        );

        // (3) analyze each callee and fold the restored graphs together.
        let mut output: Option<PointsToGraph> = None;
        for callee in &callees {
            let Some(restored) = self.process_one_callee(caller, call, callee, arena, input)?
            else {
                continue;
            };
            match output {
                None => output = Some(restored),
                Some(ref mut acc) => acc.union(&restored),
            }
        }

        // (4) an empty or fully skipped callee set leaves the graph alone.
        Ok(output.unwrap_or_else(|| input.clone()))
    }
}
