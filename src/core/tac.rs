//! Three-address code definitions produced by the lifter
//!
//! Every instruction names its operands explicitly; the operand stack of the
//! source bytecode is gone after lifting. Instructions keep the bytecode
//! offset they were lifted from so downstream analyses can report locations.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::types::{CallSignature, Comparison, MethodRef, TypeRef};

/// A named storage location in three-address code.
///
/// Temporaries are pre-created, one per operand stack slot; their identity is
/// the slot index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Variable {
    /// The implicit receiver of an instance method
    This,
    /// Declared parameter by index
    Param(u16),
    /// Named local variable
    Local(String),
    /// Stack-slot temporary
    Temp(u16),
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::This => write!(f, "this"),
            Variable::Param(i) => write!(f, "p{}", i),
            Variable::Local(name) => write!(f, "{}", name),
            Variable::Temp(i) => write!(f, "t{}", i),
        }
    }
}

/// Literal constant operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::I32(v) => write!(f, "{}", v),
            Constant::I64(v) => write!(f, "{}", v),
            Constant::F32(v) => write!(f, "{}", v),
            Constant::F64(v) => write!(f, "{}", v),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Null => write!(f, "null"),
        }
    }
}

/// An addressable location: the legal left-hand side of a store and the
/// referent of an address-of operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Place {
    /// A variable
    Var(Variable),
    /// The cell a pointer variable refers to
    Deref(Variable),
    /// Instance field, keyed by textual member signature
    InstField { object: Variable, field: String },
    /// Static field of a type
    StaticField { ty: TypeRef, field: String },
    /// Array element
    ArrayElem { array: Variable, index: Variable },
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Var(v) => write!(f, "{}", v),
            Place::Deref(v) => write!(f, "*{}", v),
            Place::InstField { object, field } => write!(f, "{}.{}", object, field),
            Place::StaticField { ty, field } => write!(f, "{}::{}", ty, field),
            Place::ArrayElem { array, index } => write!(f, "{}[{}]", array, index),
        }
    }
}

/// Right-hand-side operand of a three-address instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TacOperand {
    /// A variable
    Var(Variable),
    /// A literal constant
    Const(Constant),
    /// Address of a place
    Ref(Place),
    /// Read through a pointer variable
    Deref(Variable),
    /// Instance field read
    InstField { object: Variable, field: String },
    /// Static field read
    StaticField { ty: TypeRef, field: String },
    /// Array element read
    ArrayElem { array: Variable, index: Variable },
    /// Function pointer, with receiver for virtual-dispatch pointers
    MethodPtr {
        method: MethodRef,
        receiver: Option<Variable>,
    },
}

impl TacOperand {
    /// The variable inside, when the operand is a plain variable.
    pub fn as_var(&self) -> Option<&Variable> {
        match self {
            TacOperand::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for TacOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TacOperand::Var(v) => write!(f, "{}", v),
            TacOperand::Const(c) => write!(f, "{}", c),
            TacOperand::Ref(p) => write!(f, "&{}", p),
            TacOperand::Deref(v) => write!(f, "*{}", v),
            TacOperand::InstField { object, field } => write!(f, "{}.{}", object, field),
            TacOperand::StaticField { ty, field } => write!(f, "{}::{}", ty, field),
            TacOperand::ArrayElem { array, index } => write!(f, "{}[{}]", array, index),
            TacOperand::MethodPtr { method, receiver } => match receiver {
                Some(r) => write!(f, "&{}.{}", r, method.name),
                None => write!(f, "&{}", method),
            },
        }
    }
}

/// Binary operators in three-address code.
///
/// Checked and unsigned bytecode variants collapse onto these; comparison
/// opcodes become `Eq`/`Gt`/`Lt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators in three-address code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    /// Array length read lowered from `Ldlen`
    ArrayLength,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
            UnaryOp::ArrayLength => write!(f, "len "),
        }
    }
}

/// Branch target label.
///
/// A finally-entry label targets the first offset of a finally handler; it is
/// rendered with a trailing tick so textual output distinguishes it from a
/// plain jump to the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Target bytecode offset
    pub offset: u32,
    /// Marks entry into a finally handler
    pub finally_entry: bool,
}

impl Label {
    pub fn new(offset: u32) -> Self {
        Self {
            offset,
            finally_entry: false,
        }
    }

    pub fn finally(offset: u32) -> Self {
        Self {
            offset,
            finally_entry: true,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L_{:04X}", self.offset)?;
        if self.finally_entry {
            write!(f, "'")?;
        }
        Ok(())
    }
}

/// Dispatch flavor of a lifted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// Statically bound call
    Static,
    /// Virtually dispatched call, resolvable against receiver targets
    Virtual,
    /// Tail-style transfer that reuses the caller's parameters
    Jump,
}

/// A three-address instruction. All variants carry the source offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TacInstr {
    /// Universal move into a variable
    Load {
        offset: u32,
        dst: Variable,
        src: TacOperand,
    },
    /// Move into an addressable place
    Store {
        offset: u32,
        dst: Place,
        src: TacOperand,
    },
    BinOp {
        offset: u32,
        dst: Variable,
        left: Variable,
        op: BinaryOp,
        right: Variable,
    },
    UnOp {
        offset: u32,
        dst: Variable,
        op: UnaryOp,
        src: Variable,
    },
    Convert {
        offset: u32,
        dst: Variable,
        ty: TypeRef,
        src: Variable,
    },
    Branch {
        offset: u32,
        target: Label,
    },
    CondBranch {
        offset: u32,
        left: Variable,
        cmp: Comparison,
        right: TacOperand,
        target: Label,
    },
    /// Potential transfer into an exception handler
    ExcBranch {
        offset: u32,
        target: Label,
        exception_type: TypeRef,
    },
    Switch {
        offset: u32,
        operand: Variable,
        targets: Vec<u32>,
    },
    Call {
        offset: u32,
        dst: Option<Variable>,
        callee: MethodRef,
        kind: CallKind,
        args: Vec<TacOperand>,
    },
    IndirectCall {
        offset: u32,
        dst: Option<Variable>,
        pointer: Variable,
        signature: CallSignature,
        args: Vec<TacOperand>,
    },
    NewObj {
        offset: u32,
        dst: Variable,
        ctor: MethodRef,
        args: Vec<TacOperand>,
    },
    NewArray {
        offset: u32,
        dst: Variable,
        element_type: TypeRef,
        rank: u8,
        lower_bounds: Vec<Variable>,
        sizes: Vec<Variable>,
    },
    Return {
        offset: u32,
        value: Option<TacOperand>,
    },
    /// `exception` is absent for rethrow
    Throw {
        offset: u32,
        exception: Option<Variable>,
    },
    /// Start of a guarded region
    Try { offset: u32 },
    /// Start of a catch handler; `exception_var` holds the caught exception
    Catch {
        offset: u32,
        exception_var: Variable,
        exception_type: TypeRef,
    },
    /// Start of a finally handler
    Finally { offset: u32 },
    Sizeof {
        offset: u32,
        dst: Variable,
        ty: TypeRef,
    },
    LocalAlloc {
        offset: u32,
        dst: Variable,
        size: Variable,
    },
    CopyMem {
        offset: u32,
        dest: Variable,
        src: Variable,
        count: Variable,
    },
    CopyObj {
        offset: u32,
        ty: TypeRef,
        dest: Variable,
        src: Variable,
    },
    InitMem {
        offset: u32,
        dest: Variable,
        value: Variable,
        count: Variable,
    },
    InitObj {
        offset: u32,
        ty: TypeRef,
        dest: Variable,
    },
    LoadToken {
        offset: u32,
        dst: Variable,
        token: TypeRef,
    },
    Nop { offset: u32 },
    Breakpoint { offset: u32 },
}

impl TacInstr {
    /// Source bytecode offset the instruction was lifted from.
    pub fn offset(&self) -> u32 {
        match self {
            TacInstr::Load { offset, .. }
            | TacInstr::Store { offset, .. }
            | TacInstr::BinOp { offset, .. }
            | TacInstr::UnOp { offset, .. }
            | TacInstr::Convert { offset, .. }
            | TacInstr::Branch { offset, .. }
            | TacInstr::CondBranch { offset, .. }
            | TacInstr::ExcBranch { offset, .. }
            | TacInstr::Switch { offset, .. }
            | TacInstr::Call { offset, .. }
            | TacInstr::IndirectCall { offset, .. }
            | TacInstr::NewObj { offset, .. }
            | TacInstr::NewArray { offset, .. }
            | TacInstr::Return { offset, .. }
            | TacInstr::Throw { offset, .. }
            | TacInstr::Try { offset }
            | TacInstr::Catch { offset, .. }
            | TacInstr::Finally { offset }
            | TacInstr::Sizeof { offset, .. }
            | TacInstr::LocalAlloc { offset, .. }
            | TacInstr::CopyMem { offset, .. }
            | TacInstr::CopyObj { offset, .. }
            | TacInstr::InitMem { offset, .. }
            | TacInstr::InitObj { offset, .. }
            | TacInstr::LoadToken { offset, .. }
            | TacInstr::Nop { offset }
            | TacInstr::Breakpoint { offset } => *offset,
        }
    }

    /// Explicit control-flow targets of this instruction.
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            TacInstr::Branch { target, .. } => vec![target.offset],
            TacInstr::CondBranch { target, .. } => vec![target.offset],
            TacInstr::ExcBranch { target, .. } => vec![target.offset],
            TacInstr::Switch { targets, .. } => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Does control never reach the next instruction in sequence?
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            TacInstr::Branch { .. } | TacInstr::Return { .. } | TacInstr::Throw { .. }
        )
    }
}

impl fmt::Display for TacInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TacInstr::Load { dst, src, .. } => write!(f, "{} = {}", dst, src),
            TacInstr::Store { dst, src, .. } => write!(f, "{} = {}", dst, src),
            TacInstr::BinOp {
                dst,
                left,
                op,
                right,
                ..
            } => write!(f, "{} = {} {} {}", dst, left, op, right),
            TacInstr::UnOp { dst, op, src, .. } => write!(f, "{} = {}{}", dst, op, src),
            TacInstr::Convert { dst, ty, src, .. } => write!(f, "{} = ({}) {}", dst, ty, src),
            TacInstr::Branch { target, .. } => write!(f, "goto {}", target),
            TacInstr::CondBranch {
                left,
                cmp,
                right,
                target,
                ..
            } => write!(f, "if {} {} {} goto {}", left, cmp, right, target),
            TacInstr::ExcBranch {
                target,
                exception_type,
                ..
            } => write!(f, "on {} goto {}", exception_type, target),
            TacInstr::Switch {
                operand, targets, ..
            } => {
                write!(f, "switch {} [", operand)?;
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "L_{:04X}", t)?;
                }
                write!(f, "]")
            }
            TacInstr::Call {
                dst, callee, args, ..
            } => {
                if let Some(dst) = dst {
                    write!(f, "{} = ", dst)?;
                }
                write!(f, "call {}(", callee)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            TacInstr::IndirectCall {
                dst, pointer, args, ..
            } => {
                if let Some(dst) = dst {
                    write!(f, "{} = ", dst)?;
                }
                write!(f, "calli (*{})(", pointer)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            TacInstr::NewObj {
                dst, ctor, args, ..
            } => {
                write!(f, "{} = new {}(", dst, ctor.containing_type)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            TacInstr::NewArray {
                dst,
                element_type,
                sizes,
                ..
            } => {
                write!(f, "{} = new {}[", dst, element_type)?;
                for (i, s) in sizes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", s)?;
                }
                write!(f, "]")
            }
            TacInstr::Return { value, .. } => match value {
                Some(v) => write!(f, "return {}", v),
                None => write!(f, "return"),
            },
            TacInstr::Throw { exception, .. } => match exception {
                Some(v) => write!(f, "throw {}", v),
                None => write!(f, "rethrow"),
            },
            TacInstr::Try { offset } => write!(f, "try L_{:04X}", offset),
            TacInstr::Catch {
                offset,
                exception_var,
                exception_type,
            } => write!(
                f,
                "catch L_{:04X} ({} {})",
                offset, exception_type, exception_var
            ),
            TacInstr::Finally { offset } => write!(f, "finally L_{:04X}", offset),
            TacInstr::Sizeof { dst, ty, .. } => write!(f, "{} = sizeof {}", dst, ty),
            TacInstr::LocalAlloc { dst, size, .. } => write!(f, "{} = localloc {}", dst, size),
            TacInstr::CopyMem {
                dest, src, count, ..
            } => write!(f, "copymem {}, {}, {}", dest, src, count),
            TacInstr::CopyObj { ty, dest, src, .. } => {
                write!(f, "copyobj<{}> {}, {}", ty, dest, src)
            }
            TacInstr::InitMem {
                dest, value, count, ..
            } => write!(f, "initmem {}, {}, {}", dest, value, count),
            TacInstr::InitObj { ty, dest, .. } => write!(f, "initobj<{}> {}", ty, dest),
            TacInstr::LoadToken { dst, token, .. } => write!(f, "{} = token {}", dst, token),
            TacInstr::Nop { .. } => write!(f, "nop"),
            TacInstr::Breakpoint { .. } => write!(f, "break"),
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[TacOperand]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

/// Processing state of a basic block in the lifter worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Never queued
    None,
    /// Queued, not yet lifted
    Pending,
    /// Lifted
    Processed,
}

/// A recognized basic block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Offset of the block leader
    pub offset: u32,
    /// Whether the previous instruction falls through into this block
    pub can_fall_through: bool,
    /// Operand stack size observed on entry; fixed at first enqueue
    pub stack_size_at_entry: u16,
    /// Worklist state
    pub status: BlockStatus,
    /// Lifted instructions
    pub instrs: Vec<TacInstr>,
}

impl BasicBlock {
    /// Create an unqueued block at `offset`.
    pub fn new(offset: u32) -> Self {
        Self {
            offset,
            can_fall_through: true,
            stack_size_at_entry: 0,
            status: BlockStatus::None,
            instrs: Vec::new(),
        }
    }
}

/// Lifted method body: the variable universe plus the instruction sequence
/// in offset order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    /// Method this body belongs to
    pub method: MethodRef,
    /// Every variable any instruction may reference
    pub variables: IndexSet<Variable>,
    /// Instructions in offset order
    pub instrs: Vec<TacInstr>,
}

impl MethodBody {
    pub fn new(method: MethodRef) -> Self {
        Self {
            method,
            variables: IndexSet::new(),
            instrs: Vec::new(),
        }
    }

    /// Register a variable in the body's universe.
    pub fn add_variable(&mut self, var: Variable) {
        self.variables.insert(var);
    }

    pub fn contains_variable(&self, var: &Variable) -> bool {
        self.variables.contains(var)
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "method {}", self.method)?;
        for instr in &self.instrs {
            writeln!(f, "  {:04X}: {}", instr.offset(), instr)?;
        }
        Ok(())
    }
}
