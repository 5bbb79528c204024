//! Common test utilities and helpers
//!
//! Shared functionality used across all test modules: raw-op builders and an
//! in-memory symbol model implementing the analysis host.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::{HashMap, HashSet};

use cil_analysis::analysis::AnalysisHost;
use cil_analysis::common::types::*;

/// In-memory symbol model for driving the engine in tests.
#[derive(Default)]
pub struct TestHost {
    methods: HashMap<MethodRef, MethodDefinition>,
    /// (receiver type name, declared method) -> implementation
    overrides: HashMap<(String, MethodRef), MethodRef>,
    /// External callees the host still wants modeled
    modeled_unknown: HashSet<MethodRef>,
    /// Source-level local names
    local_names: HashMap<String, String>,
    /// Number of times the reachable-method hook fired
    pub reachable_count: Cell<usize>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method(&mut self, def: MethodDefinition) {
        self.methods.insert(def.method.clone(), def);
    }

    pub fn add_override(
        &mut self,
        receiver: &TypeRef,
        declared: &MethodRef,
        implementation: MethodRef,
    ) {
        self.overrides
            .insert((receiver.name.clone(), declared.clone()), implementation);
    }

    /// Have `on_unknown_method` return true for this callee.
    pub fn model_unknown(&mut self, callee: MethodRef) {
        self.modeled_unknown.insert(callee);
    }

    pub fn add_local_name(&mut self, metadata_name: &str, source_name: &str) {
        self.local_names
            .insert(metadata_name.to_string(), source_name.to_string());
    }
}

impl SymbolResolver for TestHost {
    fn method_definition(&self, method: &MethodRef) -> Option<&MethodDefinition> {
        self.methods.get(method)
    }

    fn find_method_implementation(
        &self,
        receiver: &TypeRef,
        declared: &MethodRef,
    ) -> Option<MethodRef> {
        if let Some(found) = self
            .overrides
            .get(&(receiver.name.clone(), declared.clone()))
        {
            return Some(found.clone());
        }
        // A type trivially implements methods declared on itself.
        if declared.containing_type == *receiver {
            return Some(declared.clone());
        }
        None
    }

    fn local_source_name(&self, _method: &MethodRef, metadata_name: &str) -> Option<String> {
        self.local_names.get(metadata_name).cloned()
    }
}

impl AnalysisHost for TestHost {
    fn on_reachable_method(
        &self,
        def: &MethodDefinition,
        config: &cil_analysis::AnalyzerConfig,
    ) -> Result<cil_analysis::ControlFlowGraph, cil_analysis::AnalysisError> {
        self.reachable_count.set(self.reachable_count.get() + 1);
        let lifter = cil_analysis::Lifter::new(config.lifter.clone());
        let lifted = lifter.lift_with_names(def, self)?;
        Ok(cil_analysis::ControlFlowGraph::build(lifted))
    }

    fn on_unknown_method(&self, callee: &MethodRef) -> bool {
        self.modeled_unknown.contains(callee)
    }
}

pub fn obj_type(name: &str) -> TypeRef {
    TypeRef::reference(name)
}

pub fn static_method(ty: &TypeRef, name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodRef {
    MethodRef::new(ty.clone(), name, params, ret, true)
}

pub fn instance_method(ty: &TypeRef, name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodRef {
    MethodRef::new(ty.clone(), name, params, ret, false)
}

pub fn ctor_of(ty: &TypeRef) -> MethodRef {
    MethodRef::new(ty.clone(), ".ctor", vec![], TypeRef::void(), false)
}

pub fn op(offset: u32, kind: OpKind) -> RawOp {
    RawOp::new(offset, kind)
}

pub fn op_with(offset: u32, kind: OpKind, value: OpValue) -> RawOp {
    RawOp::with_operand(offset, kind, value)
}

/// Method definition with a bytecode body and object-typed locals.
pub fn define(
    method: MethodRef,
    parameters: Vec<(&str, TypeRef)>,
    locals: Vec<&str>,
    max_stack: u16,
    ops: Vec<RawOp>,
) -> MethodDefinition {
    define_with_regions(method, parameters, locals, max_stack, ops, vec![])
}

pub fn define_with_regions(
    method: MethodRef,
    parameters: Vec<(&str, TypeRef)>,
    locals: Vec<&str>,
    max_stack: u16,
    ops: Vec<RawOp>,
    exception_regions: Vec<ExceptionRegionInfo>,
) -> MethodDefinition {
    let size = ops.last().map_or(0, |op| op.offset + 1);
    MethodDefinition {
        method,
        parameters: parameters
            .into_iter()
            .map(|(name, ty)| ParameterDef {
                name: name.to_string(),
                ty,
            })
            .collect(),
        body: Some(RawBody {
            max_stack,
            operations: ops,
            locals: locals
                .into_iter()
                .map(|name| LocalDef {
                    name: name.to_string(),
                    ty: TypeRef::object(),
                })
                .collect(),
            exception_regions,
            size,
            kind: BodyKind::Bytecode,
        }),
    }
}

/// Every variable an instruction references, for closure checks.
pub fn referenced_variables(instr: &cil_analysis::TacInstr) -> Vec<cil_analysis::Variable> {
    use cil_analysis::core::tac::{Place, TacInstr, TacOperand};

    fn place_vars(place: &Place, out: &mut Vec<cil_analysis::Variable>) {
        match place {
            Place::Var(v) | Place::Deref(v) => out.push(v.clone()),
            Place::InstField { object, .. } => out.push(object.clone()),
            Place::StaticField { .. } => {}
            Place::ArrayElem { array, index } => {
                out.push(array.clone());
                out.push(index.clone());
            }
        }
    }

    fn operand_vars(operand: &TacOperand, out: &mut Vec<cil_analysis::Variable>) {
        match operand {
            TacOperand::Var(v) | TacOperand::Deref(v) => out.push(v.clone()),
            TacOperand::Const(_) => {}
            TacOperand::Ref(place) => place_vars(place, out),
            TacOperand::InstField { object, .. } => out.push(object.clone()),
            TacOperand::StaticField { .. } => {}
            TacOperand::ArrayElem { array, index } => {
                out.push(array.clone());
                out.push(index.clone());
            }
            TacOperand::MethodPtr { receiver, .. } => {
                if let Some(r) = receiver {
                    out.push(r.clone());
                }
            }
        }
    }

    let mut vars = Vec::new();
    match instr {
        TacInstr::Load { dst, src, .. } => {
            vars.push(dst.clone());
            operand_vars(src, &mut vars);
        }
        TacInstr::Store { dst, src, .. } => {
            place_vars(dst, &mut vars);
            operand_vars(src, &mut vars);
        }
        TacInstr::BinOp {
            dst, left, right, ..
        } => {
            vars.push(dst.clone());
            vars.push(left.clone());
            vars.push(right.clone());
        }
        TacInstr::UnOp { dst, src, .. } => {
            vars.push(dst.clone());
            vars.push(src.clone());
        }
        TacInstr::Convert { dst, src, .. } => {
            vars.push(dst.clone());
            vars.push(src.clone());
        }
        TacInstr::CondBranch { left, right, .. } => {
            vars.push(left.clone());
            operand_vars(right, &mut vars);
        }
        TacInstr::Switch { operand, .. } => vars.push(operand.clone()),
        TacInstr::Call { dst, args, .. } => {
            if let Some(dst) = dst {
                vars.push(dst.clone());
            }
            for arg in args {
                operand_vars(arg, &mut vars);
            }
        }
        TacInstr::IndirectCall {
            dst, pointer, args, ..
        } => {
            if let Some(dst) = dst {
                vars.push(dst.clone());
            }
            vars.push(pointer.clone());
            for arg in args {
                operand_vars(arg, &mut vars);
            }
        }
        TacInstr::NewObj { dst, args, .. } => {
            vars.push(dst.clone());
            for arg in args {
                operand_vars(arg, &mut vars);
            }
        }
        TacInstr::NewArray {
            dst,
            lower_bounds,
            sizes,
            ..
        } => {
            vars.push(dst.clone());
            vars.extend(lower_bounds.iter().cloned());
            vars.extend(sizes.iter().cloned());
        }
        TacInstr::Return { value, .. } => {
            if let Some(operand) = value {
                operand_vars(operand, &mut vars);
            }
        }
        TacInstr::Throw { exception, .. } => {
            if let Some(v) = exception {
                vars.push(v.clone());
            }
        }
        TacInstr::Catch { exception_var, .. } => vars.push(exception_var.clone()),
        TacInstr::Sizeof { dst, .. } | TacInstr::LoadToken { dst, .. } => vars.push(dst.clone()),
        TacInstr::LocalAlloc { dst, size, .. } => {
            vars.push(dst.clone());
            vars.push(size.clone());
        }
        TacInstr::CopyMem {
            dest, src, count, ..
        } => {
            vars.push(dest.clone());
            vars.push(src.clone());
            vars.push(count.clone());
        }
        TacInstr::CopyObj { dest, src, .. } => {
            vars.push(dest.clone());
            vars.push(src.clone());
        }
        TacInstr::InitMem {
            dest, value, count, ..
        } => {
            vars.push(dest.clone());
            vars.push(value.clone());
            vars.push(count.clone());
        }
        TacInstr::InitObj { dest, .. } => vars.push(dest.clone()),
        TacInstr::Branch { .. }
        | TacInstr::ExcBranch { .. }
        | TacInstr::Try { .. }
        | TacInstr::Finally { .. }
        | TacInstr::Nop { .. }
        | TacInstr::Breakpoint { .. } => {}
    }
    vars
}

/// Initialize test logging once; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
