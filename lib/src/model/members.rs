use super::Type;
use crate::classfile::{FieldAccessFlags, LineNumberTable, LocalVariableTable, MethodAccessFlags};
use std::cell::RefCell;
use std::fmt;

/// Value of a `ConstantValue` attribute
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

pub struct FieldData<'g> {
    pub parent: Type<'g>,
    pub name: String,
    pub ty: Type<'g>,
    pub access_flags: FieldAccessFlags,

    /// Only ever set for static fields
    pub constant_value: Option<ConstantValue>,

    /// Position among the fields of the same kind (static or instance) of the parent
    pub slot: usize,
}

impl<'g> FieldData<'g> {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::FINAL)
    }

    pub fn is_protected(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::PROTECTED)
    }

    /// Static final field of primitive type with a constant value
    ///
    /// Reads of such fields are replaced by the constant.
    pub fn is_primitive_constant(&self) -> bool {
        self.is_static()
            && self.is_final()
            && self.ty.is_primitive()
            && matches!(
                self.constant_value,
                Some(ConstantValue::Int(_))
                    | Some(ConstantValue::Long(_))
                    | Some(ConstantValue::Float(_))
                    | Some(ConstantValue::Double(_))
            )
    }
}

impl<'g> fmt::Display for FieldData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}:{}", self.parent.name, self.name, self.ty.descriptor())
    }
}

impl<'g> fmt::Debug for FieldData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Field({})", self)
    }
}

/// Entry of a method's exception table, as found in the classfile
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,

    /// Constant pool index of the catch type (0 means any throwable)
    pub catch_type: u16,
}

/// Everything from the `Code` attribute needed to build the IR of a method
///
/// This is held onto between loading the class and translating the method, and then dropped.
#[derive(Debug, Clone)]
pub struct BytecodeHolder {
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub handlers: Vec<RawExceptionHandler>,
    pub stack_map: Option<Vec<u8>>,
    pub line_numbers: Option<LineNumberTable>,
    pub local_variables: Option<LocalVariableTable>,
    pub liveness: Option<Vec<u8>>,
}

pub struct MethodData<'g> {
    pub parent: Type<'g>,
    pub name: String,
    pub descriptor: String,
    pub access_flags: MethodAccessFlags,
    pub parameters: Vec<Type<'g>>,

    /// Constructors return the object they initialize
    pub return_type: Type<'g>,

    /// Types listed in the `Exceptions` attribute
    pub exceptions: Vec<Type<'g>>,

    /// Position in the method list of the parent
    pub slot: usize,

    pub(crate) holder: RefCell<Option<BytecodeHolder>>,
}

impl<'g> MethodData<'g> {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::FINAL)
    }

    pub fn is_private(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::PRIVATE)
    }

    pub fn is_protected(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::PROTECTED)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::NATIVE)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    pub fn is_init(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_clinit(&self) -> bool {
        self.name == "<clinit>"
    }

    pub fn has_bytecode(&self) -> bool {
        self.holder.borrow().is_some()
    }

    /// Take the bytecode out of the method (it can only be translated once)
    pub fn take_bytecode(&self) -> Option<BytecodeHolder> {
        self.holder.borrow_mut().take()
    }

    /// Number of words taken by the parameters, including the receiver
    pub fn parameter_words(&self) -> usize {
        let receiver = if self.is_static() { 0 } else { 1 };
        receiver
            + self
                .parameters
                .iter()
                .map(|p| if p.is_two_words() { 2 } else { 1 })
                .sum::<usize>()
    }
}

impl<'g> fmt::Display for MethodData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}{}", self.parent.name, self.name, self.descriptor)
    }
}

impl<'g> fmt::Debug for MethodData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Method({})", self)
    }
}
