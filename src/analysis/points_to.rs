//! Intraprocedural may points-to analysis
//!
//! Standard forward dataflow over one method's CFG: join is graph union,
//! transfer is per-instruction. Calls are delegated to a pluggable
//! [`CallHandler`]; the interprocedural driver installs itself there, while
//! standalone runs use [`IdentityCallHandler`].

use std::collections::BTreeSet;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::trace;

use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::ptg::{NodeArena, NodeId, NodeKey, PointsToGraph, ARRAY_FIELD, DEREF_FIELD};
use crate::common::errors::AnalysisError;
use crate::common::types::{MethodDefinition, MethodRef, TypeRef};
use crate::core::tac::{CallKind, Constant, Place, TacInstr, TacOperand, Variable};

/// Name of the synthetic local holding a method's return targets.
/// The `$` prefix keeps it disjoint from metadata local names.
pub const RESULT_LOCAL: &str = "$result";

/// The synthetic result variable.
pub fn result_variable() -> Variable {
    Variable::Local(RESULT_LOCAL.to_string())
}

/// One call site as seen by the call handler.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    /// Offset of the call instruction
    pub offset: u32,
    /// Statically named callee
    pub callee: &'a MethodRef,
    /// Dispatch flavor
    pub kind: CallKind,
    /// Arguments in source order (receiver first for instance calls)
    pub args: &'a [TacOperand],
    /// Caller variable receiving the return value
    pub result: Option<&'a Variable>,
}

impl<'a> CallSite<'a> {
    /// Textual call-site label used in the call graph.
    pub fn label(&self) -> String {
        format!("L_{:04X}", self.offset)
    }

    /// Receiver variable for instance calls.
    pub fn receiver(&self) -> Option<&Variable> {
        if self.callee.is_static {
            None
        } else {
            self.args.first().and_then(TacOperand::as_var)
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == CallKind::Virtual && !self.callee.is_static
    }
}

/// Hook invoked for every lifted call instruction.
pub trait CallHandler {
    fn process_method_call(
        &mut self,
        caller: &MethodRef,
        call: &CallSite<'_>,
        arena: &mut NodeArena,
        input: &PointsToGraph,
    ) -> Result<PointsToGraph, AnalysisError>;
}

/// Treats every call as the identity on the graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCallHandler;

impl CallHandler for IdentityCallHandler {
    fn process_method_call(
        &mut self,
        _caller: &MethodRef,
        _call: &CallSite<'_>,
        _arena: &mut NodeArena,
        input: &PointsToGraph,
    ) -> Result<PointsToGraph, AnalysisError> {
        Ok(input.clone())
    }
}

/// Dataflow state of one block.
#[derive(Debug, Clone, Default)]
pub struct BlockState {
    /// Joined state on block entry
    pub input: PointsToGraph,
    /// State after the last instruction
    pub output: PointsToGraph,
}

/// Completed dataflow of one analysis run.
#[derive(Debug, Clone, Default)]
pub struct DataFlowResult {
    /// Per-block states keyed by leader offset
    pub states: IndexMap<u32, BlockState>,
    /// Union of the outputs of all return blocks
    pub exit: PointsToGraph,
}

impl DataFlowResult {
    pub fn exit_ptg(&self) -> &PointsToGraph {
        &self.exit
    }
}

/// Points-to analysis bound to one method's CFG, re-runnable with growing
/// inputs by the interprocedural driver.
#[derive(Debug, Clone)]
pub struct PointsToAnalysis {
    cfg: Rc<ControlFlowGraph>,
    /// Parameter variables with their entry-node index and static type
    parameters: Vec<(Variable, u16, TypeRef)>,
    /// Delegate constructor bodies at allocation sites
    analyze_constructors: bool,
    result: Option<DataFlowResult>,
}

impl PointsToAnalysis {
    pub fn new(
        cfg: Rc<ControlFlowGraph>,
        def: &MethodDefinition,
        analyze_constructors: bool,
    ) -> Self {
        // Entry-node indices follow the raw argument slots: the receiver is
        // slot 0 and shifts declared parameters by one.
        let shift = u16::from(!def.is_static());
        let mut parameters = Vec::with_capacity(def.parameters.len() + 1);
        if !def.is_static() {
            parameters.push((Variable::This, 0, def.containing_type().clone()));
        }
        for (index, param) in def.parameters.iter().enumerate() {
            parameters.push((
                Variable::Param(index as u16),
                index as u16 + shift,
                param.ty.clone(),
            ));
        }
        Self {
            cfg,
            parameters,
            analyze_constructors,
            result: None,
        }
    }

    pub fn method(&self) -> &MethodRef {
        self.cfg.method()
    }

    pub fn cfg(&self) -> &Rc<ControlFlowGraph> {
        &self.cfg
    }

    /// Last completed dataflow.
    pub fn result(&self) -> Option<&DataFlowResult> {
        self.result.as_ref()
    }

    /// Run to fixpoint from `input`, returning the exit graph.
    pub fn analyze(
        &mut self,
        arena: &mut NodeArena,
        input: PointsToGraph,
        calls: &mut dyn CallHandler,
    ) -> Result<PointsToGraph, AnalysisError> {
        let mut entry_input = input;
        self.seed_parameters(arena, &mut entry_input);

        let offsets: Vec<u32> = self.cfg.block_offsets().collect();
        let mut states: IndexMap<u32, BlockState> = offsets
            .iter()
            .map(|&o| (o, BlockState::default()))
            .collect();

        let mut sweeps = 0u32;
        loop {
            let mut changed = false;
            for &offset in &offsets {
                let block_input = self.join_input(offset, &entry_input, &states);
                let output = self.transfer_block(offset, block_input.clone(), arena, calls)?;
                let state = &mut states[&offset];
                if !output.graph_equals(&state.output) {
                    changed = true;
                }
                state.input = block_input;
                state.output = output;
            }
            sweeps += 1;
            if !changed {
                break;
            }
        }
        trace!(method = %self.method(), sweeps, "points-to fixpoint reached");

        // The exit graph is the union over return blocks; a method that
        // never returns normally contributes its entry state so the caller
        // frame survives restoration.
        let mut exit: Option<PointsToGraph> = None;
        for &offset in &self.cfg.exits {
            let output = &states[&offset].output;
            match exit {
                None => exit = Some(output.clone()),
                Some(ref mut acc) => acc.union(output),
            }
        }
        let exit = exit.unwrap_or_else(|| entry_input.clone());

        self.result = Some(DataFlowResult {
            states,
            exit: exit.clone(),
        });
        Ok(exit)
    }

    /// Reference-typed parameters with no incoming roots receive a fresh
    /// parameter-entry node. For a root method that is all of them; for a
    /// callee only those the caller binding left empty.
    fn seed_parameters(&self, arena: &mut NodeArena, graph: &mut PointsToGraph) {
        for (var, index, ty) in &self.parameters {
            if !ty.is_reference() || graph.has_roots(var) {
                continue;
            }
            let id = arena.intern(NodeKey::ParamEntry {
                method: self.method().clone(),
                index: *index,
                ty: ty.clone(),
            });
            graph.merge_root(var.clone(), BTreeSet::from([id]));
        }
    }

    /// Predecessor join. Entry keeps the (seeded) input; a block with no
    /// predecessors starts from the entry state as well, which keeps the
    /// frame stack intact for handler-only paths.
    fn join_input(
        &self,
        offset: u32,
        entry_input: &PointsToGraph,
        states: &IndexMap<u32, BlockState>,
    ) -> PointsToGraph {
        let block = &self.cfg.blocks[&offset];
        if offset == self.cfg.entry {
            let mut input = entry_input.clone();
            for pred in &block.predecessors {
                input.union(&states[pred].output);
            }
            return input;
        }
        if block.predecessors.is_empty() {
            return entry_input.clone();
        }
        let mut acc: Option<PointsToGraph> = None;
        for pred in &block.predecessors {
            let output = &states[pred].output;
            match acc {
                None => acc = Some(output.clone()),
                Some(ref mut a) => a.union(output),
            }
        }
        acc.unwrap_or_default()
    }

    fn transfer_block(
        &self,
        offset: u32,
        input: PointsToGraph,
        arena: &mut NodeArena,
        calls: &mut dyn CallHandler,
    ) -> Result<PointsToGraph, AnalysisError> {
        let mut state = input;
        for instr in self.cfg.block_instrs(offset) {
            self.transfer_instr(instr, &mut state, arena, calls)?;
        }
        Ok(state)
    }

    fn transfer_instr(
        &self,
        instr: &TacInstr,
        state: &mut PointsToGraph,
        arena: &mut NodeArena,
        calls: &mut dyn CallHandler,
    ) -> Result<(), AnalysisError> {
        match instr {
            TacInstr::Load { dst, src, .. } => {
                let targets = operand_targets(state, src);
                state.assign(dst.clone(), targets);
            }
            TacInstr::Store { dst, src, .. } => {
                let values = operand_targets(state, src);
                match dst {
                    Place::Var(v) => state.assign(v.clone(), values),
                    Place::Deref(v) => state.store_field(v, DEREF_FIELD, &values),
                    Place::InstField { object, field } => state.store_field(object, field, &values),
                    Place::StaticField { ty, field } => state.store_static(ty, field, &values),
                    Place::ArrayElem { array, .. } => state.store_field(array, ARRAY_FIELD, &values),
                }
            }
            TacInstr::NewObj {
                offset,
                dst,
                ctor,
                args,
            } => {
                let node = state.allocate(arena, *offset, &ctor.containing_type);
                state.assign(dst.clone(), BTreeSet::from([node]));
                if self.analyze_constructors {
                    let call = CallSite {
                        offset: *offset,
                        callee: ctor,
                        kind: CallKind::Static,
                        args,
                        result: None,
                    };
                    *state = calls.process_method_call(self.method(), &call, arena, state)?;
                }
            }
            TacInstr::NewArray {
                offset,
                dst,
                element_type,
                ..
            } => {
                let array_type = TypeRef::array_of(element_type);
                let node = state.allocate(arena, *offset, &array_type);
                state.assign(dst.clone(), BTreeSet::from([node]));
            }
            TacInstr::Call {
                offset,
                dst,
                callee,
                kind,
                args,
            } => {
                let call = CallSite {
                    offset: *offset,
                    callee,
                    kind: *kind,
                    args,
                    result: dst.as_ref(),
                };
                *state = calls.process_method_call(self.method(), &call, arena, state)?;
            }
            TacInstr::IndirectCall { dst, .. } => {
                // Function-pointer destinations are not resolved statically.
                if let Some(dst) = dst {
                    state.assign(dst.clone(), BTreeSet::new());
                }
            }
            TacInstr::Return { value, .. } => {
                if let Some(operand) = value {
                    let targets = operand_targets(state, operand);
                    state.merge_root(result_variable(), targets);
                }
            }
            // Arithmetic, conversions, branches, switches and region markers
            // are the identity on the graph.
            _ => {}
        }
        Ok(())
    }
}

/// Targets a right-hand-side operand may point to.
fn operand_targets(state: &PointsToGraph, operand: &TacOperand) -> BTreeSet<NodeId> {
    match operand {
        TacOperand::Var(v) => state.targets(v),
        TacOperand::Const(Constant::Null) => BTreeSet::from([NodeArena::NULL]),
        TacOperand::Const(_) => BTreeSet::new(),
        TacOperand::InstField { object, field } => state.load_field(object, field),
        TacOperand::StaticField { ty, field } => state.load_static(ty, field),
        TacOperand::ArrayElem { array, .. } => state.load_field(array, ARRAY_FIELD),
        TacOperand::Deref(v) => state.load_field(v, DEREF_FIELD),
        TacOperand::Ref(place) => place_targets(state, place),
        TacOperand::MethodPtr { .. } => BTreeSet::new(),
    }
}

/// Address-of is approximated by aliasing: the pointer shares the targets
/// of the place it refers to.
fn place_targets(state: &PointsToGraph, place: &Place) -> BTreeSet<NodeId> {
    match place {
        Place::Var(v) => state.targets(v),
        Place::Deref(v) => state.load_field(v, DEREF_FIELD),
        Place::InstField { object, field } => state.load_field(object, field),
        Place::StaticField { ty, field } => state.load_static(ty, field),
        Place::ArrayElem { array, .. } => state.load_field(array, ARRAY_FIELD),
    }
}
