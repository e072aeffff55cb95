use crate::errors::Result;
use crate::ir::{ArithmeticOp, Condition, InvokeForm, ObjectConstant};
use crate::model::{MethodData, PrimitiveType, Type};

/// One way of encoding a variable size instruction (a branch or a table switch)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BranchEncoding {
    /// Signed offsets representable by the encoding
    pub offset_bits: u32,

    /// Bytes taken by the encoded instruction
    pub size: u32,

    /// Offsets are relative to the address of the instruction plus this adjustment
    pub ip_adjust: u32,
}

impl BranchEncoding {
    pub const fn new(offset_bits: u32, size: u32, ip_adjust: u32) -> BranchEncoding {
        BranchEncoding {
            offset_bits,
            size,
            ip_adjust,
        }
    }

    /// Is the offset representable with this encoding?
    pub fn fits(&self, offset: i64) -> bool {
        fits(self.offset_bits, offset)
    }
}

/// Is a value representable as a signed integer of the given number of bits?
pub fn fits(bits: u32, value: i64) -> bool {
    let lo = -(1i64 << (bits - 1));
    let hi = (1i64 << (bits - 1)) - 1;
    lo <= value && value <= hi
}

/// Where an instruction is being emitted (only meaningful during the second pass)
#[derive(Debug, Clone, Copy)]
pub struct EmitContext<'a, 'g> {
    /// Address of the instruction being emitted
    pub ip: u32,

    /// Types on the operand stack before the instruction, one per word
    pub stack: &'a [Type<'g>],
}

/// Load of a numeric constant, already narrowed to its smallest encoding
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ConstantOp {
    /// -1 to 15, encoded in the opcode
    Immediate(i8),
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
}

/// Long and floating point operations are prefixed by an escape opcode
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NumericPrefix {
    Long,
    Float,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NumericOp {
    Arithmetic(ArithmeticOp),
    Negate,

    /// Conversion to the given type
    Convert(PrimitiveType),
}

/// Arithmetic, negation or conversion
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NumericInsn {
    pub op: NumericOp,

    /// Type of the (left) operand
    pub operand: PrimitiveType,

    pub prefix: Option<NumericPrefix>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LocalOp {
    Load,
    Store,
    Increment,
    Decrement,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FieldOp {
    GetField,
    PutField,

    /// Instance field of the receiver (which is not on the stack)
    ThisGetField,
    ThisPutField,

    /// Static field of a class loaded onto the stack first
    GetStatic,
    PutStatic,

    /// Static field of the class of the current method
    ClassGetStatic,
    ClassPutStatic,
}

/// Instructions without operands
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SimpleOp {
    ArrayLoad,
    ArrayStore,
    ArrayLength,
    NewArray,
    NewDimension,

    /// Run the class initializer of the class on the stack (first half of `new`)
    New,
    CheckCast,
    InstanceOf,
    Lookup,
    MonitorEnter,
    MonitorExit,

    /// Monitor of the class of the current method
    ClassMonitorEnter,
    ClassMonitorExit,
    Pop,
    Return,
    Throw,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BranchOp {
    Goto,

    /// Conditional branch, comparing against zero (or `null`) when `with_zero` is set
    If {
        condition: Condition,
        with_zero: bool,
    },
}

/// Operands of a table switch (offsets are relative to the adjusted switch address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSwitchOperands {
    pub low: i32,
    pub high: i32,
    pub default: i32,
    pub offsets: Vec<i32>,

    /// Zero byte between the opcode and the operands, keeping the operands aligned
    pub padding: u32,
}

/// Exception handler with relocated addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedHandler<'g> {
    pub from: u32,
    pub to: u32,
    pub entry: u32,
    pub catch_type: Type<'g>,
}

/// Source line of the instructions starting at an address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub ip: u32,
    pub line: i32,
}

/// Sink for translated classes
///
/// Every method body is produced in two passes. In the first pass (`begin_method` with
/// `first_pass` set) nothing should be written: the `emit_*` methods only report the size of the
/// instruction they were asked for, and variable size instructions are sized through
/// `branch_encodings` and `table_switch_encoding`. The second pass emits the final code, with
/// every branch using the encoding chosen during relocation. The method's locals, stack size and
/// exception handlers are emitted between the two passes. An instruction the emitter cannot
/// encode is reported as an assertion failure.
pub trait SuiteEmitter<'g> {
    fn begin_class(&mut self, class: Type<'g>);

    /// Finish a class, with the pools its code refers to
    fn end_class(&mut self, class_references: &[Type<'g>], constants: &[ObjectConstant]);

    /// Drop the class begun last, along with any methods already emitted for it
    fn abort_class(&mut self);

    fn begin_method(&mut self, method: &'g MethodData<'g>, first_pass: bool);
    fn end_method(&mut self, length: u32) -> Result<()>;

    /// Branch encodings, smallest first
    fn branch_encodings(&self) -> &[BranchEncoding];

    fn table_switch_encoding(&self, targets: usize) -> BranchEncoding;

    fn emit_constant(&mut self, cx: &EmitContext<'_, 'g>, constant: ConstantOp) -> Result<u32>;

    /// Load of an entry of the class's constant object pool
    fn emit_object(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        index: u32,
        immediate: bool,
    ) -> Result<u32>;

    /// Load of an entry of the class's class reference pool
    fn emit_class(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        index: u32,
        immediate: bool,
    ) -> Result<u32>;

    fn emit_local(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        op: LocalOp,
        index: u16,
        immediate: bool,
    ) -> Result<u32>;

    fn emit_numeric(&mut self, cx: &EmitContext<'_, 'g>, insn: NumericInsn) -> Result<u32>;
    fn emit_field(&mut self, cx: &EmitContext<'_, 'g>, op: FieldOp, slot: u32) -> Result<u32>;
    fn emit_invoke(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        form: InvokeForm,
        slot: u32,
    ) -> Result<u32>;
    fn emit_simple(&mut self, cx: &EmitContext<'_, 'g>, op: SimpleOp) -> Result<u32>;

    /// Only called in the second pass
    fn emit_branch(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        op: BranchOp,
        offset: i32,
        encoding: BranchEncoding,
    ) -> Result<u32>;

    /// Only called in the second pass
    fn emit_table_switch(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        switch: &TableSwitchOperands,
    ) -> Result<u32>;

    fn emit_locals(&mut self, types: &[Type<'g>]);
    fn emit_max_stack(&mut self, max_stack: usize);
    fn emit_exception_handlers(&mut self, handlers: &[EmittedHandler<'g>]);
    fn emit_debug(&mut self, source_file: Option<&str>, lines: &[LineNumber]);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signed_ranges() {
        assert!(fits(8, 127));
        assert!(fits(8, -128));
        assert!(!fits(8, 128));
        assert!(!fits(8, -129));
        assert!(fits(12, 2047));
        assert!(!fits(12, 2048));
        assert!(BranchEncoding::new(16, 4, 4).fits(-32768));
    }
}
