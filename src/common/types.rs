//! Core type definitions for the bytecode analysis backend
//!
//! These types form the boundary with the metadata decoder: a decoded method
//! arrives as a [`MethodDefinition`] whose body is a sequence of [`RawOp`]s,
//! and the symbol model is reached only through the [`SymbolResolver`] trait.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single decoded bytecode operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOp {
    /// Bytecode offset
    pub offset: u32,
    /// Operation kind
    pub opcode: OpKind,
    /// Typed operand data
    pub operand: OpValue,
}

impl RawOp {
    /// Create an operation with no operand.
    pub fn new(offset: u32, opcode: OpKind) -> Self {
        Self {
            offset,
            opcode,
            operand: OpValue::None,
        }
    }

    /// Create an operation carrying an operand.
    pub fn with_operand(offset: u32, opcode: OpKind, operand: OpValue) -> Self {
        Self {
            offset,
            opcode,
            operand,
        }
    }
}

/// Abstract opcode families for stack bytecode.
///
/// Encoding-level variants (short forms, macro forms such as `Ldarg_0`) are
/// resolved by the decoder; overflow-checked and unsigned arithmetic variants
/// are kept as flags here and collapsed during lifting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Nop,
    Breakpoint,

    // Constants
    Ldc,
    Ldnull,

    // Argument and local moves
    Ldarg,
    Ldarga,
    Starg,
    Ldloc,
    Ldloca,
    Stloc,

    // Indirect moves
    Ldind,
    Stind,

    // Field access
    Ldfld,
    Ldflda,
    Stfld,
    Ldsfld,
    Ldsflda,
    Stsfld,

    // Arrays
    Newarr,
    CreateArray { rank: u8, has_lower_bounds: bool },
    Ldlen,
    Ldelem,
    Ldelema,
    Stelem,

    // Arithmetic, logic and comparison
    Binary {
        op: BinaryAluOp,
        checked: bool,
        unsigned: bool,
    },
    Unary(UnaryAluOp),
    Compare {
        cmp: Comparison,
        unsigned: bool,
    },

    // Conversions
    Conv {
        target: PrimitiveKind,
        checked: bool,
        unsigned: bool,
    },
    Box,
    Unbox,
    UnboxAny,
    Castclass,
    Isinst,

    // Calls
    Call,
    Callvirt,
    Newobj,
    Calli,
    Jmp,
    Ldftn,
    Ldvirtftn,
    Ldtoken,

    // Branches
    Br,
    Brtrue,
    Brfalse,
    BranchCompare {
        cmp: Comparison,
        unsigned: bool,
    },
    Switch,
    Leave,

    // Exception regions
    EndFinally,
    EndFilter,
    Throw,
    Rethrow,

    Ret,

    // Pure stack manipulation
    Dup,
    Pop,

    // Memory block group
    Sizeof,
    Localloc,
    Cpblk,
    Cpobj,
    Initblk,
    Initobj,

    /// Opcode outside the supported set, kept by mnemonic so diagnostics
    /// can name it
    Unknown(String),
}

impl OpKind {
    /// Does this operation end a basic block?
    pub fn ends_block(&self) -> bool {
        self.is_branch() || !self.falls_through()
    }

    /// Does control continue to the next operation after this one?
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            OpKind::Ret
                | OpKind::EndFinally
                | OpKind::EndFilter
                | OpKind::Throw
                | OpKind::Rethrow
                | OpKind::Br
                | OpKind::Leave
                | OpKind::Jmp
        )
    }

    /// Does this operation carry one or more branch targets?
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            OpKind::Br
                | OpKind::Brtrue
                | OpKind::Brfalse
                | OpKind::BranchCompare { .. }
                | OpKind::Switch
                | OpKind::Leave
        )
    }
}

/// Arithmetic, logic and shift operator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryAluOp {
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
}

/// Unary operator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryAluOp {
    Neg,
    Not,
}

/// Comparison operators used by compare and conditional-branch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// Platform primitive targets for conversion operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    IntPtr,
    Int8,
    Int16,
    Int32,
    Int64,
    UIntPtr,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

/// Typed operand payload of a [`RawOp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpValue {
    None,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Type(TypeRef),
    Method(MethodRef),
    Field(FieldRef),
    Param(u16),
    Local(String),
    Target(u32),
    Targets(Vec<u32>),
    Signature(CallSignature),
}

/// Discriminated type code of a [`TypeRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeCode {
    Void,
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    IntPtr,
    UIntPtr,
    Float32,
    Float64,
    String,
    Object,
    ValueType,
    Reference,
}

impl TypeCode {
    /// Reference types are tracked by the points-to analysis.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeCode::String | TypeCode::Object | TypeCode::Reference
        )
    }
}

/// An abstract reference to a type in the external symbol model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    /// Fully qualified type name
    pub name: String,
    /// Discriminated type code
    pub code: TypeCode,
}

impl TypeRef {
    /// Create a reference type by name.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: TypeCode::Reference,
        }
    }

    /// Create a value type by name.
    pub fn value_type(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: TypeCode::ValueType,
        }
    }

    /// One-dimensional array of `element`.
    pub fn array_of(element: &TypeRef) -> Self {
        Self {
            name: format!("{}[]", element.name),
            code: TypeCode::Reference,
        }
    }

    pub fn void() -> Self {
        Self {
            name: "System.Void".into(),
            code: TypeCode::Void,
        }
    }

    pub fn boolean() -> Self {
        Self {
            name: "System.Boolean".into(),
            code: TypeCode::Boolean,
        }
    }

    pub fn string() -> Self {
        Self {
            name: "System.String".into(),
            code: TypeCode::String,
        }
    }

    pub fn object() -> Self {
        Self {
            name: "System.Object".into(),
            code: TypeCode::Object,
        }
    }

    pub fn int32() -> Self {
        Self {
            name: "System.Int32".into(),
            code: TypeCode::Int32,
        }
    }

    pub fn int64() -> Self {
        Self {
            name: "System.Int64".into(),
            code: TypeCode::Int64,
        }
    }

    pub fn float64() -> Self {
        Self {
            name: "System.Double".into(),
            code: TypeCode::Float64,
        }
    }

    /// Platform primitive for a conversion target.
    pub fn primitive(kind: PrimitiveKind) -> Self {
        let (name, code) = match kind {
            PrimitiveKind::IntPtr => ("System.IntPtr", TypeCode::IntPtr),
            PrimitiveKind::Int8 => ("System.SByte", TypeCode::Int8),
            PrimitiveKind::Int16 => ("System.Int16", TypeCode::Int16),
            PrimitiveKind::Int32 => ("System.Int32", TypeCode::Int32),
            PrimitiveKind::Int64 => ("System.Int64", TypeCode::Int64),
            PrimitiveKind::UIntPtr => ("System.UIntPtr", TypeCode::UIntPtr),
            PrimitiveKind::UInt8 => ("System.Byte", TypeCode::UInt8),
            PrimitiveKind::UInt16 => ("System.UInt16", TypeCode::UInt16),
            PrimitiveKind::UInt32 => ("System.UInt32", TypeCode::UInt32),
            PrimitiveKind::UInt64 => ("System.UInt64", TypeCode::UInt64),
            PrimitiveKind::Float32 => ("System.Single", TypeCode::Float32),
            PrimitiveKind::Float64 => ("System.Double", TypeCode::Float64),
        };
        Self {
            name: name.into(),
            code,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.code.is_reference()
    }

    pub fn is_void(&self) -> bool {
        self.code == TypeCode::Void
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An abstract reference to a method in the external symbol model.
///
/// Carries enough signature structure for call lifting (argument counts,
/// receiver presence, return arity) without exposing decoder internals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Containing type
    pub containing_type: TypeRef,
    /// Method name
    pub name: String,
    /// Declared parameter types (excluding the receiver)
    pub parameter_types: Vec<TypeRef>,
    /// Extra call-site parameter types (vararg sentinel tail; usually empty)
    pub extra_parameter_types: Vec<TypeRef>,
    /// Return type
    pub return_type: TypeRef,
    /// Static methods take no receiver
    pub is_static: bool,
}

impl MethodRef {
    /// Shorthand constructor for a method without vararg extras.
    pub fn new(
        containing_type: TypeRef,
        name: impl Into<String>,
        parameter_types: Vec<TypeRef>,
        return_type: TypeRef,
        is_static: bool,
    ) -> Self {
        Self {
            containing_type,
            name: name.into(),
            parameter_types,
            extra_parameter_types: Vec::new(),
            return_type,
            is_static,
        }
    }

    /// Total number of values a call site pops for this method.
    pub fn argument_count(&self) -> usize {
        let receiver = usize::from(!self.is_static);
        receiver + self.parameter_types.len() + self.extra_parameter_types.len()
    }

    pub fn returns_value(&self) -> bool {
        !self.return_type.is_void()
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.containing_type, self.name)
    }
}

/// An abstract reference to a field in the external symbol model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Containing type
    pub containing_type: TypeRef,
    /// Field name
    pub name: String,
    /// Declared field type
    pub field_type: TypeRef,
}

impl FieldRef {
    /// Textual member signature with the containing type omitted.
    ///
    /// Field edges in the points-to graph are keyed by this string so that
    /// field identity is stable across assemblies that compare members
    /// without signature context.
    pub fn field_key(&self) -> String {
        format!("{}:{}", self.name, self.field_type.name)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.containing_type, self.name)
    }
}

/// Standalone call signature used by indirect calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSignature {
    /// Declared parameter types
    pub parameter_types: Vec<TypeRef>,
    /// Return type
    pub return_type: TypeRef,
    /// Whether the signature takes a receiver
    pub has_this: bool,
}

impl CallSignature {
    /// Total number of values popped at the call site, excluding the pointer.
    pub fn argument_count(&self) -> usize {
        usize::from(self.has_this) + self.parameter_types.len()
    }

    pub fn returns_value(&self) -> bool {
        !self.return_type.is_void()
    }
}

/// Declared parameter of a method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name
    pub name: String,
    /// Parameter type
    pub ty: TypeRef,
}

/// Declared local variable of a method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDef {
    /// Metadata name of the local
    pub name: String,
    /// Local type
    pub ty: TypeRef,
}

/// Body form of a decoded method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyKind {
    /// Raw stack bytecode
    Bytecode,
    /// Already lifted to three-address form
    ThreeAddress,
}

/// Handler role of an exception region entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch,
    Finally,
    Filter,
    Fault,
}

/// One entry of the raw exception-region table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRegionInfo {
    /// First offset of the guarded region
    pub try_start: u32,
    /// First offset past the guarded region
    pub try_end: u32,
    /// Handler role
    pub handler_kind: HandlerKind,
    /// First offset of the handler
    pub handler_start: u32,
    /// First offset past the handler
    pub handler_end: u32,
    /// Caught exception type (catch handlers only)
    pub exception_type: Option<TypeRef>,
}

/// Decoded method body as delivered by the metadata decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBody {
    /// Declared operand stack capacity
    pub max_stack: u16,
    /// Decoded operations in offset order
    pub operations: Vec<RawOp>,
    /// Declared local variables
    pub locals: Vec<LocalDef>,
    /// Raw exception-region table
    pub exception_regions: Vec<ExceptionRegionInfo>,
    /// Code size in bytes
    pub size: u32,
    /// Body form
    pub kind: BodyKind,
}

/// A decoded method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDefinition {
    /// Method reference (identity, signature, staticness)
    pub method: MethodRef,
    /// Declared parameters with names
    pub parameters: Vec<ParameterDef>,
    /// Body, absent for external/abstract methods
    pub body: Option<RawBody>,
}

impl MethodDefinition {
    pub fn is_static(&self) -> bool {
        self.method.is_static
    }

    pub fn containing_type(&self) -> &TypeRef {
        &self.method.containing_type
    }
}

/// Read access to the external symbol model.
///
/// The analysis never walks metadata itself; everything it needs about
/// methods, dispatch and source names comes through this trait.
pub trait SymbolResolver {
    /// Definition lookup; `None` marks the method as external.
    fn method_definition(&self, method: &MethodRef) -> Option<&MethodDefinition>;

    /// Resolve the implementation of `declared` dispatched on `receiver`.
    fn find_method_implementation(
        &self,
        receiver: &TypeRef,
        declared: &MethodRef,
    ) -> Option<MethodRef>;

    /// Source-level name for a local, when debug information is available.
    /// Falling back to the metadata name is always correct.
    fn local_source_name(&self, _method: &MethodRef, _metadata_name: &str) -> Option<String> {
        None
    }
}
