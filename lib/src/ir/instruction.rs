use super::{HandlerId, InsnId, LocalId, TargetId};
use crate::model::{FieldData, MethodData, Type};
use bitflags::bitflags;
use std::fmt;

/// Binary operators (including the `lcmp`/`fcmp*`/`dcmp*` comparisons)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,

    /// `lcmp`
    Cmp,

    /// `fcmpl`/`dcmpl` (NaN compares as less)
    CmpL,

    /// `fcmpg`/`dcmpg` (NaN compares as greater)
    CmpG,
}

impl ArithmeticOp {
    pub fn is_shift(self) -> bool {
        matches!(self, ArithmeticOp::Shl | ArithmeticOp::Shr | ArithmeticOp::Ushr)
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, ArithmeticOp::Cmp | ArithmeticOp::CmpL | ArithmeticOp::CmpG)
    }
}

/// Condition of a conditional branch
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Primitive constant (or `null`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
}

impl Constant {
    /// Is this the value a local of the same type starts out with?
    pub fn is_default_value(&self) -> bool {
        match *self {
            Constant::Int(value) => value == 0,
            Constant::Long(value) => value == 0,
            Constant::Float(value) => value.to_bits() == 0,
            Constant::Double(value) => value.to_bits() == 0,
            Constant::Null => true,
        }
    }
}

/// Constant that lives in the constant object pool of the class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectConstant {
    String(String),

    /// Sorted match values of a lowered `lookupswitch`
    IntArray(Vec<i32>),
}

impl fmt::Display for ObjectConstant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectConstant::String(string) => write!(f, "{:?}", string),
            ObjectConstant::IntArray(values) => write!(f, "{:?}", values),
        }
    }
}

/// How a method gets invoked
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InvokeForm {
    Virtual,
    Static,
    Interface,

    /// `invokespecial` of a superclass method
    Super,

    /// `invokespecial` of a constructor
    Init,
}

bitflags! {
    pub struct InsnFlags: u8 {
        /// The value was copied by a `dup`/`swap` family instruction
        const DUPED = 0b0000_0001;

        /// The value must be stored into its temporary local after being produced
        const SPILLS = 0b0000_0010;

        /// Store that gives a local its first value
        const INITIALIZER = 0b0000_0100;

        /// Field access relative to the receiver of the method
        const RECEIVER = 0b0000_1000;
    }
}

/// What an instruction does, along with its operands
///
/// Operands are the instructions that produced the values popped off the operand stack, listed in
/// the order they were pushed.
#[derive(Debug, Clone)]
pub enum InsnKind<'g> {
    Arithmetic {
        op: ArithmeticOp,
        operand_type: Type<'g>,
        left: InsnId,
        right: InsnId,
    },
    Negate {
        value: InsnId,
    },
    Convert {
        value: InsnId,
        from: Type<'g>,
        to: Type<'g>,
    },
    LoadConstant(Constant),
    LoadConstantObject(ObjectConstant),

    /// Stack value flowing into a block that is not entered by fall through
    LoadSynthetic,

    LoadLocal {
        local: LocalId,
    },
    StoreLocal {
        local: LocalId,
        value: InsnId,
    },
    IncDecLocal {
        local: LocalId,
        increment: bool,
    },

    /// `receiver` is `None` for static fields and for receiver-relative accesses
    LoadField {
        field: &'g FieldData<'g>,
        receiver: Option<InsnId>,
    },
    StoreField {
        field: &'g FieldData<'g>,
        receiver: Option<InsnId>,
        value: InsnId,
    },

    LoadIndexed {
        array: InsnId,
        index: InsnId,
    },
    StoreIndexed {
        array: InsnId,
        index: InsnId,
        value: InsnId,
    },
    ArrayLength {
        array: InsnId,
    },
    NewArray {
        size: InsnId,
    },

    /// Allocate the next dimension of a partially allocated multi-dimensional array
    NewDimension {
        array: InsnId,
        dimension: InsnId,
    },
    NewObject,

    /// Arguments include the receiver (if any) first
    Invoke {
        method: &'g MethodData<'g>,
        form: InvokeForm,
        args: Vec<InsnId>,
    },
    CheckCast {
        value: InsnId,
    },
    InstanceOf {
        value: InsnId,
        class: Type<'g>,
    },

    /// `value` is `None` when entering the monitor of a static synchronized method's class
    MonitorEnter {
        value: Option<InsnId>,
    },
    MonitorExit {
        value: Option<InsnId>,
    },
    Throw {
        value: InsnId,
    },
    Return {
        value: Option<InsnId>,
    },
    Goto {
        target: TargetId,
    },

    /// `right` is `None` when comparing against zero (or `null`)
    If {
        condition: Condition,
        operand_type: Type<'g>,
        left: InsnId,
        right: Option<InsnId>,
        target: TargetId,
    },
    TableSwitch {
        key: InsnId,
        low: i32,
        high: i32,
        default: TargetId,
        targets: Vec<TargetId>,
    },
    LookupSwitch {
        key: InsnId,
        default: TargetId,
        cases: Vec<(i32, TargetId)>,
    },
    Pop {
        value: InsnId,
    },

    /// Index of `key` in the sorted `matches` array (or -1), only made by the bytecode producer
    Lookup {
        key: InsnId,
        matches: InsnId,
    },

    /// Start of a branch target
    Phi {
        target: TargetId,
    },

    /// Start of an exception handler, pushing the exception
    LoadException {
        target: TargetId,
    },
    HandlerEnter {
        handler: HandlerId,
    },
    HandlerExit {
        handler: HandlerId,
    },
}

impl<'g> InsnKind<'g> {
    /// Operands, in the order they were pushed
    pub fn operands(&self) -> Vec<InsnId> {
        use InsnKind::*;
        match self {
            Arithmetic { left, right, .. } => vec![*left, *right],
            Negate { value } | Convert { value, .. } | StoreLocal { value, .. } => vec![*value],
            LoadField { receiver, .. } => receiver.iter().copied().collect(),
            StoreField {
                receiver, value, ..
            } => receiver.iter().copied().chain(Some(*value)).collect(),
            LoadIndexed { array, index } => vec![*array, *index],
            StoreIndexed {
                array,
                index,
                value,
            } => vec![*array, *index, *value],
            ArrayLength { array } => vec![*array],
            NewArray { size } => vec![*size],
            NewDimension { array, dimension } => vec![*array, *dimension],
            Invoke { args, .. } => args.clone(),
            CheckCast { value } | InstanceOf { value, .. } | Throw { value } | Pop { value } => {
                vec![*value]
            }
            MonitorEnter { value } | MonitorExit { value } | Return { value } => {
                value.iter().copied().collect()
            }
            If { left, right, .. } => Some(*left).into_iter().chain(*right).collect(),
            TableSwitch { key, .. } | LookupSwitch { key, .. } => vec![*key],
            Lookup { key, matches } => vec![*key, *matches],
            LoadConstant(_)
            | LoadConstantObject(_)
            | LoadSynthetic
            | LoadLocal { .. }
            | IncDecLocal { .. }
            | NewObject
            | Goto { .. }
            | Phi { .. }
            | LoadException { .. }
            | HandlerEnter { .. }
            | HandlerExit { .. } => vec![],
        }
    }

    /// Mutable references to the operands, in the order they were pushed
    pub fn operands_mut(&mut self) -> Vec<&mut InsnId> {
        use InsnKind::*;
        match self {
            Arithmetic { left, right, .. } => vec![left, right],
            Negate { value } | Convert { value, .. } | StoreLocal { value, .. } => vec![value],
            LoadField { receiver, .. } => receiver.iter_mut().collect(),
            StoreField {
                receiver, value, ..
            } => receiver.iter_mut().chain(Some(value)).collect(),
            LoadIndexed { array, index } => vec![array, index],
            StoreIndexed {
                array,
                index,
                value,
            } => vec![array, index, value],
            ArrayLength { array } => vec![array],
            NewArray { size } => vec![size],
            NewDimension { array, dimension } => vec![array, dimension],
            Invoke { args, .. } => args.iter_mut().collect(),
            CheckCast { value } | InstanceOf { value, .. } | Throw { value } | Pop { value } => {
                vec![value]
            }
            MonitorEnter { value } | MonitorExit { value } | Return { value } => {
                value.iter_mut().collect()
            }
            If { left, right, .. } => Some(left).into_iter().chain(right.as_mut()).collect(),
            TableSwitch { key, .. } | LookupSwitch { key, .. } => vec![key],
            Lookup { key, matches } => vec![key, matches],
            LoadConstant(_)
            | LoadConstantObject(_)
            | LoadSynthetic
            | LoadLocal { .. }
            | IncDecLocal { .. }
            | NewObject
            | Goto { .. }
            | Phi { .. }
            | LoadException { .. }
            | HandlerEnter { .. }
            | HandlerExit { .. } => vec![],
        }
    }

    /// Local read or written by the instruction
    pub fn local(&self) -> Option<LocalId> {
        match self {
            InsnKind::LoadLocal { local }
            | InsnKind::StoreLocal { local, .. }
            | InsnKind::IncDecLocal { local, .. } => Some(*local),
            _ => None,
        }
    }

    pub(super) fn set_local(&mut self, new_local: LocalId) {
        match self {
            InsnKind::LoadLocal { local }
            | InsnKind::StoreLocal { local, .. }
            | InsnKind::IncDecLocal { local, .. } => *local = new_local,
            _ => (),
        }
    }

    /// Does the instruction read its local?
    pub fn is_use(&self) -> bool {
        matches!(self, InsnKind::LoadLocal { .. } | InsnKind::IncDecLocal { .. })
    }

    /// Does the instruction write its local?
    pub fn is_definition(&self) -> bool {
        matches!(self, InsnKind::StoreLocal { .. } | InsnKind::IncDecLocal { .. })
    }

    /// Markers that produce no code of their own (beyond `LoadException`'s value)
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            InsnKind::Phi { .. }
                | InsnKind::LoadException { .. }
                | InsnKind::HandlerEnter { .. }
                | InsnKind::HandlerExit { .. }
        )
    }

    /// Start of a stack map address (branch or exception target)
    pub fn entry_target(&self) -> Option<TargetId> {
        match self {
            InsnKind::Phi { target } | InsnKind::LoadException { target } => Some(*target),
            _ => None,
        }
    }

    /// Does the instruction end a basic block?
    pub fn is_block_exit(&self) -> bool {
        matches!(
            self,
            InsnKind::Goto { .. }
                | InsnKind::If { .. }
                | InsnKind::TableSwitch { .. }
                | InsnKind::LookupSwitch { .. }
                | InsnKind::Return { .. }
                | InsnKind::Throw { .. }
        )
    }

    /// Can control reach the next instruction?
    pub fn falls_through(&self) -> bool {
        match self {
            InsnKind::If { .. } => true,
            other => !other.is_block_exit(),
        }
    }

    /// Explicit branch targets (default first for switches)
    pub fn targets(&self) -> Vec<TargetId> {
        match self {
            InsnKind::Goto { target } | InsnKind::If { target, .. } => vec![*target],
            InsnKind::TableSwitch {
                default, targets, ..
            } => Some(*default).into_iter().chain(targets.iter().copied()).collect(),
            InsnKind::LookupSwitch { default, cases, .. } => Some(*default)
                .into_iter()
                .chain(cases.iter().map(|(_, target)| *target))
                .collect(),
            _ => vec![],
        }
    }

    /// Can the instruction raise an exception (other than by `athrow`)?
    pub fn can_trap(&self) -> bool {
        match self {
            InsnKind::Arithmetic {
                op, operand_type, ..
            } => {
                matches!(op, ArithmeticOp::Div | ArithmeticOp::Rem)
                    && !operand_type.is_double()
                    && operand_type.primitive() != Some(crate::model::PrimitiveType::Float)
            }
            InsnKind::LoadField { .. }
            | InsnKind::StoreField { .. }
            | InsnKind::LoadIndexed { .. }
            | InsnKind::StoreIndexed { .. }
            | InsnKind::ArrayLength { .. }
            | InsnKind::NewArray { .. }
            | InsnKind::NewDimension { .. }
            | InsnKind::NewObject
            | InsnKind::Invoke { .. }
            | InsnKind::CheckCast { .. }
            | InsnKind::InstanceOf { .. }
            | InsnKind::MonitorEnter { .. }
            | InsnKind::MonitorExit { .. } => true,
            _ => false,
        }
    }

    /// May the instruction trigger a garbage collection (so the stack must be spilled first)?
    pub fn constrains_stack(&self) -> bool {
        match self {
            InsnKind::Invoke { .. }
            | InsnKind::CheckCast { .. }
            | InsnKind::InstanceOf { .. }
            | InsnKind::NewDimension { .. } => true,
            InsnKind::LoadField { field, .. } | InsnKind::StoreField { field, .. } => {
                field.is_static()
            }
            _ => false,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        use InsnKind::*;
        match self {
            Arithmetic { .. } => "arithmetic",
            Negate { .. } => "negate",
            Convert { .. } => "convert",
            LoadConstant(_) => "const",
            LoadConstantObject(_) => "object",
            LoadSynthetic => "synthetic",
            LoadLocal { .. } => "load",
            StoreLocal { .. } => "store",
            IncDecLocal {
                increment: true, ..
            } => "inc",
            IncDecLocal { .. } => "dec",
            LoadField { .. } => "getfield",
            StoreField { .. } => "putfield",
            LoadIndexed { .. } => "aload",
            StoreIndexed { .. } => "astore",
            ArrayLength { .. } => "arraylength",
            NewArray { .. } => "newarray",
            NewDimension { .. } => "newdimension",
            NewObject => "new",
            Invoke { .. } => "invoke",
            CheckCast { .. } => "checkcast",
            InstanceOf { .. } => "instanceof",
            MonitorEnter { .. } => "monitorenter",
            MonitorExit { .. } => "monitorexit",
            Throw { .. } => "throw",
            Return { .. } => "return",
            Goto { .. } => "goto",
            If { .. } => "if",
            TableSwitch { .. } => "tableswitch",
            LookupSwitch { .. } => "lookupswitch",
            Pop { .. } => "pop",
            Lookup { .. } => "lookup",
            Phi { .. } => "phi",
            LoadException { .. } => "catch",
            HandlerEnter { .. } => "try",
            HandlerExit { .. } => "tryend",
        }
    }
}

/// One IR instruction
pub struct Instruction<'g> {
    pub kind: InsnKind<'g>,

    /// Type of the value pushed (`void` if nothing is pushed)
    pub ty: Type<'g>,

    pub flags: InsnFlags,

    /// Address of the bytecode this was decoded from
    pub original_ip: u32,

    /// Address after logical relocation (unique per instruction)
    pub reloc_ip: u32,

    /// Source line (the negated address when there is no line number table)
    pub line: i32,

    /// Opcodes of the `dup`/`swap` family applied right after this instruction
    pub dup_swaps: Vec<u8>,

    /// Local the value is materialized in when it cannot stay on the operand stack
    pub temporary: Option<LocalId>,

    /// Number of loops the instruction is nested in (starting at 1)
    pub loop_depth: u32,

    /// Producer whose value a fill instruction reloads
    pub original: Option<InsnId>,

    pub(super) prev: Option<InsnId>,
    pub(super) next: Option<InsnId>,
    pub(super) linked: bool,
}

impl<'g> Instruction<'g> {
    pub fn new(kind: InsnKind<'g>, ty: Type<'g>, original_ip: u32) -> Instruction<'g> {
        Instruction {
            kind,
            ty,
            flags: InsnFlags::empty(),
            original_ip,
            reloc_ip: 0,
            line: 0,
            dup_swaps: vec![],
            temporary: None,
            loop_depth: 1,
            original: None,
            prev: None,
            next: None,
            linked: false,
        }
    }

    pub fn pushes_value(&self) -> bool {
        !self.ty.is_void()
    }

    pub fn was_duped(&self) -> bool {
        self.flags.contains(InsnFlags::DUPED)
    }

    pub fn spills(&self) -> bool {
        self.flags.contains(InsnFlags::SPILLS)
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

impl<'g> fmt::Display for Instruction<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind.mnemonic())?;
        match &self.kind {
            InsnKind::Arithmetic { op, .. } => write!(f, " {:?}", op)?,
            InsnKind::LoadConstant(constant) => write!(f, " {:?}", constant)?,
            InsnKind::LoadConstantObject(constant) => write!(f, " {}", constant)?,
            InsnKind::LoadLocal { local }
            | InsnKind::StoreLocal { local, .. }
            | InsnKind::IncDecLocal { local, .. } => write!(f, " l{}", local.0)?,
            InsnKind::LoadField { field, .. } | InsnKind::StoreField { field, .. } => {
                write!(f, " {}", field)?
            }
            InsnKind::Invoke { method, form, .. } => write!(f, " {:?} {}", form, method)?,
            InsnKind::If { condition, .. } => write!(f, " {:?}", condition)?,
            _ => (),
        }
        for target in self.kind.targets() {
            write!(f, " ->t{}", target.0)?;
        }
        if !self.ty.is_void() {
            write!(f, " : {}", self.ty)?;
        }
        let operands = self.kind.operands();
        if !operands.is_empty() {
            f.write_str(" (")?;
            for (idx, operand) in operands.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "#{}", operand.0)?;
            }
            f.write_str(")")?;
        }
        if self.spills() {
            f.write_str(" spills")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_values() {
        assert!(Constant::Int(0).is_default_value());
        assert!(Constant::Null.is_default_value());
        assert!(Constant::Float(0.0).is_default_value());
        assert!(!Constant::Float(-0.0).is_default_value());
        assert!(!Constant::Long(1).is_default_value());
    }
}
