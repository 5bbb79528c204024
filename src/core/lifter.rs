//! Bytecode lifter - converts raw stack operations to three-address code
//!
//! The driver runs a LIFO worklist over recognized basic blocks. Each block
//! is entered with the stack size recorded at its first enqueue, then every
//! operation is executed symbolically against the operand stack, emitting TAC
//! instructions. Results are order-independent because a block's entry state
//! is fixed the first time it is queued; any disagreeing edge is a fault.

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::common::config::{LifterConfig, UnknownPolicy};
use crate::common::errors::{AnalysisError, LiftError, LiftWarning, ResolveError};
use crate::common::types::*;
use crate::core::blocks::{recognize_blocks, BlockTable};
use crate::core::exceptions::{ExceptionIndex, RegionKind};
use crate::core::stack::{OperandStack, StackFault};
use crate::core::tac::*;

/// Result of lifting one method.
#[derive(Debug, Clone)]
pub struct LiftedMethod {
    /// Lifted body with the variable universe and flattened instructions
    pub body: MethodBody,
    /// Recognized blocks with per-block instructions
    pub blocks: BlockTable,
    /// Recoverable diagnostics
    pub warnings: Vec<LiftWarning>,
    /// Deepest symbolic stack observed
    pub max_stack_depth: u16,
}

/// Bytecode lifter configured once and reusable across methods.
#[derive(Debug, Clone, Default)]
pub struct Lifter {
    config: LifterConfig,
}

impl Lifter {
    /// Create a lifter with the given configuration.
    pub fn new(config: LifterConfig) -> Self {
        Self { config }
    }

    /// Lift a method using metadata local names only.
    pub fn lift(&self, def: &MethodDefinition) -> Result<LiftedMethod, AnalysisError> {
        self.lift_inner(def, None)
    }

    /// Lift a method, asking `resolver` for source-level local names.
    pub fn lift_with_names(
        &self,
        def: &MethodDefinition,
        resolver: &dyn SymbolResolver,
    ) -> Result<LiftedMethod, AnalysisError> {
        self.lift_inner(def, Some(resolver))
    }

    fn lift_inner(
        &self,
        def: &MethodDefinition,
        resolver: Option<&dyn SymbolResolver>,
    ) -> Result<LiftedMethod, AnalysisError> {
        let body = def
            .body
            .as_ref()
            .ok_or_else(|| ResolveError::MissingMethodBody {
                method: def.method.clone(),
            })?;
        MethodLifter::new(&self.config, def, body, resolver).run()
    }
}

/// Direction of control after executing one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Keep executing within the current block
    Continue,
    /// The block is done; control never reaches the next operation
    Stop,
}

/// Per-method lifting state.
struct MethodLifter<'a> {
    /// Lifter configuration
    config: &'a LifterConfig,
    /// Method being lifted
    def: &'a MethodDefinition,
    /// Decoded operations in offset order
    ops: &'a [RawOp],
    /// Offset to operation-index mapping
    op_index: HashMap<u32, usize>,
    /// Recognized blocks
    blocks: BlockTable,
    /// Exception-region index
    exceptions: ExceptionIndex,
    /// Symbolic operand stack
    stack: OperandStack,
    /// Pending block offsets (LIFO)
    worklist: Vec<u32>,
    /// Body under construction
    body: MethodBody,
    /// Metadata local name to variable mapping
    local_names: HashMap<String, Variable>,
    /// Recoverable diagnostics
    warnings: Vec<LiftWarning>,
    /// Optional source-name provider
    resolver: Option<&'a dyn SymbolResolver>,
    /// Current operation offset (error context)
    current_offset: u32,
}

impl<'a> MethodLifter<'a> {
    fn new(
        config: &'a LifterConfig,
        def: &'a MethodDefinition,
        raw: &'a RawBody,
        resolver: Option<&'a dyn SymbolResolver>,
    ) -> Self {
        let op_index = raw
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| (op.offset, i))
            .collect();
        let blocks = recognize_blocks(&raw.operations, &raw.exception_regions);
        let exceptions = ExceptionIndex::build(&raw.exception_regions);
        let stack = OperandStack::new(raw.max_stack);

        let mut body = MethodBody::new(def.method.clone());
        if !def.is_static() {
            body.add_variable(Variable::This);
        }
        for index in 0..def.parameters.len() {
            body.add_variable(Variable::Param(index as u16));
        }
        // All temporaries are part of the universe, live or not, so later
        // dataflow passes see stable identities across paths.
        for temp in stack.temps() {
            body.add_variable(temp.clone());
        }

        let mut lifter = Self {
            config,
            def,
            ops: &raw.operations,
            op_index,
            blocks,
            exceptions,
            stack,
            worklist: Vec::new(),
            body,
            local_names: HashMap::new(),
            warnings: Vec::new(),
            resolver,
            current_offset: 0,
        };
        for local in &raw.locals {
            lifter.local_variable(&local.name);
        }
        lifter
    }

    fn run(mut self) -> Result<LiftedMethod, AnalysisError> {
        if self.ops.is_empty() {
            return Ok(LiftedMethod {
                body: self.body,
                blocks: self.blocks,
                warnings: self.warnings,
                max_stack_depth: 0,
            });
        }

        let entry = self.ops[0].offset;
        self.add_pending(entry, 0)?;
        // Handlers are reachable through exceptional flow even when the
        // guarded region never leaves normally.
        for handler in self.exceptions.handler_entries() {
            self.add_pending(handler, 0)?;
        }

        while let Some(offset) = self.worklist.pop() {
            self.lift_block(offset)?;
        }

        // Flatten processed blocks in offset order.
        let mut instrs = Vec::new();
        for block in self.blocks.iter_sorted() {
            if block.status == BlockStatus::Processed {
                instrs.extend(block.instrs.iter().cloned());
            }
        }
        self.body.instrs = instrs;

        Ok(LiftedMethod {
            max_stack_depth: self.stack.max_depth_reached(),
            body: self.body,
            blocks: self.blocks,
            warnings: self.warnings,
        })
    }

    /// Enqueue a block, fixing its entry stack size on first contact.
    fn add_pending(&mut self, target: u32, size: u16) -> Result<(), LiftError> {
        let at = self.current_offset;
        let block = self
            .blocks
            .get_mut(target)
            .ok_or(LiftError::MalformedBranch { target, offset: at })?;
        match block.status {
            BlockStatus::None => {
                block.status = BlockStatus::Pending;
                block.stack_size_at_entry = size;
                self.worklist.push(target);
                trace!(offset = target, entry_stack = size, "block queued");
            }
            BlockStatus::Pending | BlockStatus::Processed => {
                if block.stack_size_at_entry != size {
                    return Err(LiftError::StackSizeMismatch {
                        offset: target,
                        expected: block.stack_size_at_entry,
                        actual: size,
                    });
                }
            }
        }
        Ok(())
    }

    fn lift_block(&mut self, offset: u32) -> Result<(), AnalysisError> {
        let entry_size = {
            let block = self
                .blocks
                .get_mut(offset)
                .ok_or_else(|| AnalysisError::internal("worklist held an unknown block"))?;
            block.status = BlockStatus::Processed;
            block.stack_size_at_entry
        };
        self.stack
            .set_size(entry_size)
            .map_err(|_| LiftError::StackOverflow { offset })?;
        trace!(offset, entry_stack = entry_size, "lifting block");

        let mut instrs = Vec::new();
        let mut index = *self
            .op_index
            .get(&offset)
            .ok_or_else(|| AnalysisError::internal("block leader without an operation"))?;

        loop {
            let Some(op) = self.ops.get(index) else {
                break;
            };
            if op.offset != offset && self.blocks.is_leader(op.offset) {
                // Fall through into the next block.
                self.current_offset = op.offset;
                let size = self.stack.size();
                self.add_pending(op.offset, size)?;
                break;
            }

            self.current_offset = op.offset;
            self.emit_region_markers(op.offset, &mut instrs)?;
            let flow = self.execute_op(op, &mut instrs)?;
            if flow == Flow::Stop {
                break;
            }
            index += 1;
        }

        if let Some(block) = self.blocks.get_mut(offset) {
            block.instrs = instrs;
        }
        Ok(())
    }

    /// Emit `Try`/`Catch`/`Finally` markers when `offset` opens a region.
    /// A catch marker also pushes the temp holding the caught exception.
    fn emit_region_markers(
        &mut self,
        offset: u32,
        instrs: &mut Vec<TacInstr>,
    ) -> Result<(), AnalysisError> {
        if self.exceptions.try_starting_at(offset).is_some() {
            instrs.push(TacInstr::Try { offset });
        }
        let caught = self
            .exceptions
            .catch_starting_at(offset)
            .map(|(_, handler)| handler.exception_type.clone());
        if let Some(exception_type) = caught {
            let exception_var = self.push()?;
            instrs.push(TacInstr::Catch {
                offset,
                exception_var,
                exception_type,
            });
        }
        if self.exceptions.finally_starting_at(offset).is_some() {
            instrs.push(TacInstr::Finally { offset });
        }
        Ok(())
    }

    fn execute_op(
        &mut self,
        op: &RawOp,
        instrs: &mut Vec<TacInstr>,
    ) -> Result<Flow, AnalysisError> {
        let offset = op.offset;
        match &op.opcode {
            OpKind::Nop => instrs.push(TacInstr::Nop { offset }),
            OpKind::Breakpoint => instrs.push(TacInstr::Breakpoint { offset }),

            OpKind::Ldc => {
                let value = self.constant_operand(op)?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Const(value),
                });
            }
            OpKind::Ldnull => {
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Const(Constant::Null),
                });
            }

            OpKind::Ldarg => {
                let var = self.arg_variable(self.expect_param(op)?);
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Var(var),
                });
            }
            OpKind::Ldarga => {
                let var = self.arg_variable(self.expect_param(op)?);
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Ref(Place::Var(var)),
                });
            }
            OpKind::Starg => {
                let src = self.pop()?;
                let dst = self.arg_variable(self.expect_param(op)?);
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Var(src),
                });
            }

            OpKind::Ldloc => {
                let name = self.expect_local(op)?;
                let var = self.local_variable(&name);
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Var(var),
                });
            }
            OpKind::Ldloca => {
                let name = self.expect_local(op)?;
                let var = self.local_variable(&name);
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Ref(Place::Var(var)),
                });
            }
            OpKind::Stloc => {
                let src = self.pop()?;
                let name = self.expect_local(op)?;
                let dst = self.local_variable(&name);
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Var(src),
                });
            }

            OpKind::Ldind => {
                let addr = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Deref(addr),
                });
            }
            OpKind::Stind => {
                let src = self.pop()?;
                let addr = self.pop()?;
                instrs.push(TacInstr::Store {
                    offset,
                    dst: Place::Deref(addr),
                    src: TacOperand::Var(src),
                });
            }

            OpKind::Ldfld => {
                let field = self.expect_field(op)?;
                let object = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::InstField {
                        object,
                        field: field.field_key(),
                    },
                });
            }
            OpKind::Ldflda => {
                let field = self.expect_field(op)?;
                let object = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Ref(Place::InstField {
                        object,
                        field: field.field_key(),
                    }),
                });
            }
            OpKind::Stfld => {
                let field = self.expect_field(op)?;
                let src = self.pop()?;
                let object = self.pop()?;
                instrs.push(TacInstr::Store {
                    offset,
                    dst: Place::InstField {
                        object,
                        field: field.field_key(),
                    },
                    src: TacOperand::Var(src),
                });
            }
            OpKind::Ldsfld => {
                let field = self.expect_field(op)?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::StaticField {
                        ty: field.containing_type.clone(),
                        field: field.field_key(),
                    },
                });
            }
            OpKind::Ldsflda => {
                let field = self.expect_field(op)?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Ref(Place::StaticField {
                        ty: field.containing_type.clone(),
                        field: field.field_key(),
                    }),
                });
            }
            OpKind::Stsfld => {
                let field = self.expect_field(op)?;
                let src = self.pop()?;
                instrs.push(TacInstr::Store {
                    offset,
                    dst: Place::StaticField {
                        ty: field.containing_type.clone(),
                        field: field.field_key(),
                    },
                    src: TacOperand::Var(src),
                });
            }

            OpKind::Newarr => {
                let element_type = self.expect_type(op)?;
                let size = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::NewArray {
                    offset,
                    dst,
                    element_type,
                    rank: 1,
                    lower_bounds: Vec::new(),
                    sizes: vec![size],
                });
            }
            OpKind::CreateArray {
                rank,
                has_lower_bounds,
            } => {
                let rank = *rank;
                let has_lower_bounds = *has_lower_bounds;
                let element_type = self.expect_type(op)?;
                let mut sizes = Vec::with_capacity(usize::from(rank));
                for _ in 0..rank {
                    sizes.push(self.pop()?);
                }
                sizes.reverse();
                let mut lower_bounds = Vec::new();
                if has_lower_bounds {
                    for _ in 0..rank {
                        lower_bounds.push(self.pop()?);
                    }
                    lower_bounds.reverse();
                }
                let dst = self.push()?;
                instrs.push(TacInstr::NewArray {
                    offset,
                    dst,
                    element_type,
                    rank,
                    lower_bounds,
                    sizes,
                });
            }
            OpKind::Ldlen => {
                let src = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::UnOp {
                    offset,
                    dst,
                    op: UnaryOp::ArrayLength,
                    src,
                });
            }
            OpKind::Ldelem => {
                let index = self.pop()?;
                let array = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::ArrayElem { array, index },
                });
            }
            OpKind::Ldelema => {
                let index = self.pop()?;
                let array = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Ref(Place::ArrayElem { array, index }),
                });
            }
            OpKind::Stelem => {
                let src = self.pop()?;
                let index = self.pop()?;
                let array = self.pop()?;
                instrs.push(TacInstr::Store {
                    offset,
                    dst: Place::ArrayElem { array, index },
                    src: TacOperand::Var(src),
                });
            }

            // Precision flags are discarded: checked and unsigned variants
            // collapse onto the abstract operator.
            OpKind::Binary { op: alu, .. } => {
                let right = self.pop()?;
                let left = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::BinOp {
                    offset,
                    dst,
                    left,
                    op: binary_op(*alu),
                    right,
                });
            }
            OpKind::Compare { cmp, .. } => {
                let right = self.pop()?;
                let left = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::BinOp {
                    offset,
                    dst,
                    left,
                    op: comparison_op(*cmp),
                    right,
                });
            }
            OpKind::Unary(alu) => {
                let src = self.pop()?;
                let dst = self.push()?;
                let op = match alu {
                    UnaryAluOp::Neg => UnaryOp::Neg,
                    UnaryAluOp::Not => UnaryOp::Not,
                };
                instrs.push(TacInstr::UnOp {
                    offset,
                    dst,
                    op,
                    src,
                });
            }

            OpKind::Conv { target, .. } => {
                let ty = TypeRef::primitive(*target);
                let src = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Convert {
                    offset,
                    dst,
                    ty,
                    src,
                });
            }
            OpKind::Box | OpKind::Unbox | OpKind::UnboxAny | OpKind::Castclass | OpKind::Isinst => {
                let ty = self.expect_type(op)?;
                let src = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Convert {
                    offset,
                    dst,
                    ty,
                    src,
                });
            }

            OpKind::Call => {
                let callee = self.expect_method(op)?;
                self.lift_call(offset, callee, CallKind::Static, instrs)?;
            }
            OpKind::Callvirt => {
                let callee = self.expect_method(op)?;
                self.lift_call(offset, callee, CallKind::Virtual, instrs)?;
            }
            OpKind::Newobj => {
                let ctor = self.expect_method(op)?;
                let mut params = Vec::with_capacity(ctor.parameter_types.len());
                for _ in 0..ctor.parameter_types.len() {
                    params.push(self.pop()?);
                }
                params.reverse();
                let dst = self.push()?;
                // The freshly created object is the implicit receiver.
                let mut args = Vec::with_capacity(params.len() + 1);
                args.push(TacOperand::Var(dst.clone()));
                args.extend(params.into_iter().map(TacOperand::Var));
                instrs.push(TacInstr::NewObj {
                    offset,
                    dst,
                    ctor,
                    args,
                });
            }
            OpKind::Calli => {
                let signature = self.expect_signature(op)?;
                let pointer = self.pop()?;
                let mut args = Vec::with_capacity(signature.argument_count());
                for _ in 0..signature.argument_count() {
                    args.push(self.pop()?);
                }
                args.reverse();
                let dst = if signature.returns_value() {
                    Some(self.push()?)
                } else {
                    None
                };
                instrs.push(TacInstr::IndirectCall {
                    offset,
                    dst,
                    pointer,
                    signature,
                    args: args.into_iter().map(TacOperand::Var).collect(),
                });
            }
            OpKind::Jmp => {
                // Tail-style transfer: the current method's parameters are
                // handed to the target unchanged.
                let callee = self.expect_method(op)?;
                let mut args = Vec::new();
                if !self.def.is_static() {
                    args.push(TacOperand::Var(Variable::This));
                }
                for index in 0..self.def.parameters.len() {
                    args.push(TacOperand::Var(Variable::Param(index as u16)));
                }
                instrs.push(TacInstr::Call {
                    offset,
                    dst: None,
                    callee,
                    kind: CallKind::Jump,
                    args,
                });
                return Ok(Flow::Stop);
            }
            OpKind::Ldftn => {
                let method = self.expect_method(op)?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::MethodPtr {
                        method,
                        receiver: None,
                    },
                });
            }
            OpKind::Ldvirtftn => {
                let method = self.expect_method(op)?;
                let receiver = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::MethodPtr {
                        method,
                        receiver: Some(receiver),
                    },
                });
            }
            OpKind::Ldtoken => {
                let OpValue::Type(token) = &op.operand else {
                    return Err(ResolveError::NullTypeToken { offset }.into());
                };
                let dst = self.push()?;
                instrs.push(TacInstr::LoadToken {
                    offset,
                    dst,
                    token: token.clone(),
                });
            }

            OpKind::Br => {
                let target = self.expect_target(op)?;
                instrs.push(TacInstr::Branch {
                    offset,
                    target: Label::new(target),
                });
                let size = self.stack.size();
                self.add_pending(target, size)?;
                return Ok(Flow::Stop);
            }
            OpKind::Brtrue | OpKind::Brfalse => {
                let target = self.expect_target(op)?;
                let truth = op.opcode == OpKind::Brtrue;
                let left = self.pop()?;
                instrs.push(TacInstr::CondBranch {
                    offset,
                    left,
                    cmp: Comparison::Eq,
                    right: TacOperand::Const(Constant::Bool(truth)),
                    target: Label::new(target),
                });
                let size = self.stack.size();
                self.add_pending(target, size)?;
            }
            OpKind::BranchCompare { cmp, .. } => {
                let target = self.expect_target(op)?;
                let right = self.pop()?;
                let left = self.pop()?;
                instrs.push(TacInstr::CondBranch {
                    offset,
                    left,
                    cmp: *cmp,
                    right: TacOperand::Var(right),
                    target: Label::new(target),
                });
                let size = self.stack.size();
                self.add_pending(target, size)?;
            }
            OpKind::Switch => {
                let targets = self.expect_targets(op)?;
                let operand = self.pop()?;
                instrs.push(TacInstr::Switch {
                    offset,
                    operand,
                    targets: targets.clone(),
                });
                let size = self.stack.size();
                for target in targets {
                    self.add_pending(target, size)?;
                }
            }
            OpKind::Leave => {
                let target = self.expect_target(op)?;
                if self.exceptions.region_kind_at(offset) == RegionKind::Try {
                    let region = self
                        .exceptions
                        .enclosing_try(offset)
                        .ok_or_else(|| AnalysisError::internal("leave inside unindexed try"))?;
                    for handler in region.handlers.values() {
                        instrs.push(TacInstr::ExcBranch {
                            offset,
                            target: Label::new(handler.begin_offset),
                            exception_type: handler.exception_type.clone(),
                        });
                    }
                    // A try guarded only by a finally routes its exit
                    // through the handler.
                    let label = match (&region.finally, region.handlers.is_empty()) {
                        (Some(fin), true) => Label::finally(fin.begin_offset),
                        _ => Label::new(target),
                    };
                    instrs.push(TacInstr::Branch {
                        offset,
                        target: label,
                    });
                } else {
                    instrs.push(TacInstr::Branch {
                        offset,
                        target: Label::new(target),
                    });
                }
                self.stack.clear();
                self.add_pending(target, 0)?;
                return Ok(Flow::Stop);
            }
            OpKind::EndFinally => {
                let fin = self
                    .exceptions
                    .finally_containing(offset)
                    .ok_or_else(|| AnalysisError::internal("endfinally outside a finally"))?;
                instrs.push(TacInstr::Branch {
                    offset,
                    target: Label::new(fin.end_offset),
                });
                self.stack.clear();
                return Ok(Flow::Stop);
            }
            OpKind::EndFilter => {
                // The filter verdict is consumed; filter bodies themselves
                // are not modeled.
                self.pop()?;
                return Ok(Flow::Stop);
            }

            OpKind::Throw => {
                let exception = self.pop()?;
                self.stack.clear();
                instrs.push(TacInstr::Throw {
                    offset,
                    exception: Some(exception),
                });
                return Ok(Flow::Stop);
            }
            OpKind::Rethrow => {
                self.stack.clear();
                instrs.push(TacInstr::Throw {
                    offset,
                    exception: None,
                });
                return Ok(Flow::Stop);
            }

            OpKind::Ret => {
                let value = if self.def.method.returns_value() {
                    Some(TacOperand::Var(self.pop()?))
                } else {
                    None
                };
                instrs.push(TacInstr::Return { offset, value });
                return Ok(Flow::Stop);
            }

            OpKind::Dup => {
                let top = self.peek()?;
                let dst = self.push()?;
                instrs.push(TacInstr::Load {
                    offset,
                    dst,
                    src: TacOperand::Var(top),
                });
            }
            OpKind::Pop => {
                self.pop()?;
            }

            OpKind::Sizeof => {
                let ty = self.expect_type(op)?;
                let dst = self.push()?;
                instrs.push(TacInstr::Sizeof { offset, dst, ty });
            }
            OpKind::Localloc => {
                let size = self.pop()?;
                let dst = self.push()?;
                instrs.push(TacInstr::LocalAlloc { offset, dst, size });
            }
            OpKind::Cpblk => {
                let count = self.pop()?;
                let src = self.pop()?;
                let dest = self.pop()?;
                instrs.push(TacInstr::CopyMem {
                    offset,
                    dest,
                    src,
                    count,
                });
            }
            OpKind::Cpobj => {
                let ty = self.expect_type(op)?;
                let src = self.pop()?;
                let dest = self.pop()?;
                instrs.push(TacInstr::CopyObj {
                    offset,
                    ty,
                    dest,
                    src,
                });
            }
            OpKind::Initblk => {
                let count = self.pop()?;
                let value = self.pop()?;
                let dest = self.pop()?;
                instrs.push(TacInstr::InitMem {
                    offset,
                    dest,
                    value,
                    count,
                });
            }
            OpKind::Initobj => {
                let ty = self.expect_type(op)?;
                let dest = self.pop()?;
                instrs.push(TacInstr::InitObj { offset, ty, dest });
            }

            OpKind::Unknown(name) => {
                if self.config.unknown_opcodes == UnknownPolicy::Error {
                    return Err(LiftError::UnknownOpcode {
                        opcode: name.clone(),
                        offset,
                    }
                    .into());
                }
                warn!(opcode = %name, offset, "skipping unknown opcode");
                self.warnings.push(LiftWarning::UnknownOpcode {
                    opcode: name.clone(),
                    offset,
                });
            }
        }
        Ok(Flow::Continue)
    }

    /// Pop call arguments and emit the call instruction.
    fn lift_call(
        &mut self,
        offset: u32,
        callee: MethodRef,
        kind: CallKind,
        instrs: &mut Vec<TacInstr>,
    ) -> Result<(), AnalysisError> {
        let mut extras = Vec::with_capacity(callee.extra_parameter_types.len());
        for _ in 0..callee.extra_parameter_types.len() {
            extras.push(self.pop()?);
        }
        extras.reverse();

        let mut params = Vec::with_capacity(callee.parameter_types.len());
        for _ in 0..callee.parameter_types.len() {
            params.push(self.pop()?);
        }
        params.reverse();

        let receiver = if callee.is_static {
            None
        } else {
            Some(self.pop()?)
        };

        let dst = if callee.returns_value() {
            Some(self.push()?)
        } else {
            None
        };

        let mut args = Vec::with_capacity(callee.argument_count());
        if let Some(receiver) = receiver {
            args.push(TacOperand::Var(receiver));
        }
        args.extend(params.into_iter().map(TacOperand::Var));
        args.extend(extras.into_iter().map(TacOperand::Var));

        instrs.push(TacInstr::Call {
            offset,
            dst,
            callee,
            kind,
            args,
        });
        Ok(())
    }

    /// Resolve a raw argument index against the receiver shift.
    fn arg_variable(&self, raw_index: u16) -> Variable {
        if self.def.is_static() {
            Variable::Param(raw_index)
        } else if raw_index == 0 {
            Variable::This
        } else {
            Variable::Param(raw_index - 1)
        }
    }

    /// Resolve a metadata local name, consulting the source-name provider
    /// once per name, and register the variable in the body universe.
    fn local_variable(&mut self, metadata_name: &str) -> Variable {
        if let Some(var) = self.local_names.get(metadata_name) {
            return var.clone();
        }
        let resolved = if self.config.use_source_local_names {
            self.resolver
                .and_then(|r| r.local_source_name(&self.def.method, metadata_name))
                .unwrap_or_else(|| metadata_name.to_string())
        } else {
            metadata_name.to_string()
        };
        let var = Variable::Local(resolved);
        self.local_names
            .insert(metadata_name.to_string(), var.clone());
        self.body.add_variable(var.clone());
        var
    }

    fn push(&mut self) -> Result<Variable, LiftError> {
        self.stack.push().map_err(|fault| self.stack_error(fault))
    }

    fn pop(&mut self) -> Result<Variable, LiftError> {
        self.stack.pop().map_err(|fault| self.stack_error(fault))
    }

    fn peek(&mut self) -> Result<Variable, LiftError> {
        self.stack.peek().map_err(|fault| self.stack_error(fault))
    }

    fn stack_error(&self, fault: StackFault) -> LiftError {
        match fault {
            StackFault::Overflow => LiftError::StackOverflow {
                offset: self.current_offset,
            },
            StackFault::Underflow => LiftError::StackUnderflow {
                offset: self.current_offset,
            },
        }
    }

    fn constant_operand(&self, op: &RawOp) -> Result<Constant, LiftError> {
        match &op.operand {
            OpValue::I32(v) => Ok(Constant::I32(*v)),
            OpValue::I64(v) => Ok(Constant::I64(*v)),
            OpValue::F32(v) => Ok(Constant::F32(*v)),
            OpValue::F64(v) => Ok(Constant::F64(*v)),
            OpValue::Str(s) => Ok(Constant::Str(s.clone())),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_type(&self, op: &RawOp) -> Result<TypeRef, LiftError> {
        match &op.operand {
            OpValue::Type(ty) => Ok(ty.clone()),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_method(&self, op: &RawOp) -> Result<MethodRef, LiftError> {
        match &op.operand {
            OpValue::Method(m) => Ok(m.clone()),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_field(&self, op: &RawOp) -> Result<FieldRef, LiftError> {
        match &op.operand {
            OpValue::Field(f) => Ok(f.clone()),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_param(&self, op: &RawOp) -> Result<u16, LiftError> {
        match &op.operand {
            OpValue::Param(i) => Ok(*i),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_local(&self, op: &RawOp) -> Result<String, LiftError> {
        match &op.operand {
            OpValue::Local(name) => Ok(name.clone()),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_target(&self, op: &RawOp) -> Result<u32, LiftError> {
        match &op.operand {
            OpValue::Target(t) => Ok(*t),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_targets(&self, op: &RawOp) -> Result<Vec<u32>, LiftError> {
        match &op.operand {
            OpValue::Targets(ts) => Ok(ts.clone()),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn expect_signature(&self, op: &RawOp) -> Result<CallSignature, LiftError> {
        match &op.operand {
            OpValue::Signature(sig) => Ok(sig.clone()),
            _ => Err(self.missing_operand(op)),
        }
    }

    fn missing_operand(&self, op: &RawOp) -> LiftError {
        LiftError::MissingOperand {
            opcode: op.opcode.clone(),
            offset: op.offset,
        }
    }
}

fn binary_op(alu: BinaryAluOp) -> BinaryOp {
    match alu {
        BinaryAluOp::Add => BinaryOp::Add,
        BinaryAluOp::Sub => BinaryOp::Sub,
        BinaryAluOp::Mul => BinaryOp::Mul,
        BinaryAluOp::Div => BinaryOp::Div,
        BinaryAluOp::Rem => BinaryOp::Rem,
        BinaryAluOp::And => BinaryOp::And,
        BinaryAluOp::Or => BinaryOp::Or,
        BinaryAluOp::Xor => BinaryOp::Xor,
        BinaryAluOp::Shl => BinaryOp::Shl,
        BinaryAluOp::Shr => BinaryOp::Shr,
    }
}

fn comparison_op(cmp: Comparison) -> BinaryOp {
    match cmp {
        Comparison::Eq => BinaryOp::Eq,
        Comparison::Ne => BinaryOp::Ne,
        Comparison::Gt => BinaryOp::Gt,
        Comparison::Ge => BinaryOp::Ge,
        Comparison::Lt => BinaryOp::Lt,
        Comparison::Le => BinaryOp::Le,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_method(name: &str, return_type: TypeRef) -> MethodRef {
        MethodRef::new(TypeRef::reference("Demo"), name, vec![], return_type, true)
    }

    fn method_def(method: MethodRef, max_stack: u16, ops: Vec<RawOp>) -> MethodDefinition {
        let size = ops.last().map_or(0, |op| op.offset + 1);
        MethodDefinition {
            method,
            parameters: vec![],
            body: Some(RawBody {
                max_stack,
                operations: ops,
                locals: vec![],
                exception_regions: vec![],
                size,
                kind: BodyKind::Bytecode,
            }),
        }
    }

    #[test]
    fn test_pure_arithmetic() {
        let def = method_def(
            static_method("add", TypeRef::int32()),
            2,
            vec![
                RawOp::with_operand(0, OpKind::Ldc, OpValue::I32(3)),
                RawOp::with_operand(1, OpKind::Ldc, OpValue::I32(4)),
                RawOp::new(
                    2,
                    OpKind::Binary {
                        op: BinaryAluOp::Add,
                        checked: false,
                        unsigned: false,
                    },
                ),
                RawOp::new(3, OpKind::Ret),
            ],
        );
        let lifted = Lifter::default().lift(&def).unwrap();
        let rendered: Vec<String> = lifted.body.instrs.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["t0 = 3", "t1 = 4", "t0 = t0 + t1", "return t0"]
        );
        for temp in [Variable::Temp(0), Variable::Temp(1)] {
            assert!(lifted.body.contains_variable(&temp));
        }
        assert_eq!(lifted.max_stack_depth, 2);
    }

    #[test]
    fn test_dup_loads_from_top() {
        let def = method_def(
            static_method("twice", TypeRef::int32()),
            2,
            vec![
                RawOp::with_operand(0, OpKind::Ldc, OpValue::I32(5)),
                RawOp::new(1, OpKind::Dup),
                RawOp::new(
                    2,
                    OpKind::Binary {
                        op: BinaryAluOp::Mul,
                        checked: false,
                        unsigned: false,
                    },
                ),
                RawOp::new(3, OpKind::Ret),
            ],
        );
        let lifted = Lifter::default().lift(&def).unwrap();
        assert_eq!(lifted.body.instrs[1].to_string(), "t1 = t0");
    }

    #[test]
    fn test_starg_is_a_load_into_the_parameter() {
        let method = MethodRef::new(
            TypeRef::reference("Demo"),
            "set",
            vec![TypeRef::int32()],
            TypeRef::void(),
            true,
        );
        let def = MethodDefinition {
            method,
            parameters: vec![ParameterDef {
                name: "value".into(),
                ty: TypeRef::int32(),
            }],
            body: Some(RawBody {
                max_stack: 1,
                operations: vec![
                    RawOp::with_operand(0, OpKind::Ldc, OpValue::I32(9)),
                    RawOp::with_operand(1, OpKind::Starg, OpValue::Param(0)),
                    RawOp::new(2, OpKind::Ret),
                ],
                locals: vec![],
                exception_regions: vec![],
                size: 3,
                kind: BodyKind::Bytecode,
            }),
        };
        let lifted = Lifter::default().lift(&def).unwrap();
        assert_eq!(lifted.body.instrs[1].to_string(), "p0 = t0");
    }

    #[test]
    fn test_stack_underflow_is_fatal() {
        let def = method_def(
            static_method("bad", TypeRef::void()),
            1,
            vec![RawOp::new(0, OpKind::Pop), RawOp::new(1, OpKind::Ret)],
        );
        let err = Lifter::default().lift(&def).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Lift(LiftError::StackUnderflow { offset: 0 })
        ));
    }

    #[test]
    fn test_unknown_opcode_warns_and_continues() {
        let def = method_def(
            static_method("odd", TypeRef::void()),
            1,
            vec![
                RawOp::new(0, OpKind::Unknown("arglist".into())),
                RawOp::new(1, OpKind::Ret),
            ],
        );
        let lifted = Lifter::default().lift(&def).unwrap();
        assert_eq!(lifted.warnings.len(), 1);
        assert_eq!(lifted.body.instrs.len(), 1);
    }

    #[test]
    fn test_unknown_opcode_policy_error() {
        let config = LifterConfig {
            unknown_opcodes: UnknownPolicy::Error,
            ..LifterConfig::default()
        };
        let def = method_def(
            static_method("odd", TypeRef::void()),
            1,
            vec![
                RawOp::new(0, OpKind::Unknown("arglist".into())),
                RawOp::new(1, OpKind::Ret),
            ],
        );
        let err = Lifter::new(config).lift(&def).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Lift(LiftError::UnknownOpcode { .. })
        ));
    }

    #[test]
    fn test_branch_blocks_and_stack_discipline() {
        // if (1 == 0) t = 2 else t = 3; return t
        let def = method_def(
            static_method("pick", TypeRef::int32()),
            2,
            vec![
                RawOp::with_operand(0, OpKind::Ldc, OpValue::I32(1)),
                RawOp::with_operand(1, OpKind::Brtrue, OpValue::Target(4)),
                RawOp::with_operand(2, OpKind::Ldc, OpValue::I32(2)),
                RawOp::with_operand(3, OpKind::Br, OpValue::Target(5)),
                RawOp::with_operand(4, OpKind::Ldc, OpValue::I32(3)),
                RawOp::new(5, OpKind::Ret),
            ],
        );
        let lifted = Lifter::default().lift(&def).unwrap();
        // Both arms enter the return block with one value on the stack.
        assert_eq!(lifted.blocks.get(5).unwrap().stack_size_at_entry, 1);
        assert!(lifted
            .body
            .instrs
            .iter()
            .any(|i| matches!(i, TacInstr::CondBranch { .. })));
    }

    #[test]
    fn test_stack_size_mismatch_detected() {
        // Fall-through path carries 1 value, branch path carries 2.
        let def = method_def(
            static_method("bad", TypeRef::int32()),
            3,
            vec![
                RawOp::with_operand(0, OpKind::Ldc, OpValue::I32(1)),
                RawOp::with_operand(1, OpKind::Ldc, OpValue::I32(1)),
                RawOp::with_operand(2, OpKind::Brtrue, OpValue::Target(5)),
                RawOp::with_operand(3, OpKind::Ldc, OpValue::I32(2)),
                RawOp::with_operand(4, OpKind::Ldc, OpValue::I32(3)),
                RawOp::new(5, OpKind::Ret),
            ],
        );
        let err = Lifter::default().lift(&def).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Lift(LiftError::StackSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_switch_enqueues_all_case_targets() {
        let def = method_def(
            static_method("dispatch", TypeRef::void()),
            1,
            vec![
                RawOp::with_operand(0, OpKind::Ldc, OpValue::I32(1)),
                RawOp::with_operand(1, OpKind::Switch, OpValue::Targets(vec![3, 4, 5])),
                RawOp::new(2, OpKind::Ret),
                RawOp::new(3, OpKind::Ret),
                RawOp::new(4, OpKind::Ret),
                RawOp::new(5, OpKind::Ret),
            ],
        );
        let lifted = Lifter::default().lift(&def).unwrap();
        for offset in [3u32, 4, 5] {
            assert_eq!(
                lifted.blocks.get(offset).unwrap().status,
                BlockStatus::Processed,
                "case target {} not lifted",
                offset
            );
        }
    }
}
