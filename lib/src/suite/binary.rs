use super::binary_format::Serialize;
use super::emitter::*;
use super::opcodes;
use crate::errors::{assert_that, AssertionFailed, Result};
use crate::ir::{InvokeForm, ObjectConstant};
use crate::model::{MethodData, Type};
use byteorder::{BigEndian, WriteBytesExt};
use std::io;

const MAGIC: u32 = 0x5355_4954;
const VERSION: u16 = 1;

/// `if*`/`goto`: an 8 bit offset in the instruction, a 12 bit offset through `WIDE_n`, or a 16 bit
/// offset through `WIDE_HALF`
pub const BRANCH_ENCODINGS: [BranchEncoding; 3] = [
    BranchEncoding::new(8, 2, 2),
    BranchEncoding::new(12, 3, 3),
    BranchEncoding::new(16, 4, 4),
];

/// Opcode, 16 bit default offset, 32 bit low and high, then one 16 bit offset per target
pub(super) const TABLE_SWITCH_HEADER: u32 = 1 + 2 + 4 + 4;

/// Suite emitter producing the binary suite format
///
/// Classes are accumulated in memory and written out with `write_to`.
#[derive(Default)]
pub struct BinarySuiteEmitter {
    classes: Vec<ClassRecord>,
    first_pass: bool,
    code: Vec<u8>,
}

#[derive(Default)]
struct ClassRecord {
    name: String,
    class_references: Vec<String>,
    constants: Vec<ConstantRecord>,
    methods: Vec<MethodRecord>,
}

enum ConstantRecord {
    String(String),
    IntArray(Vec<i32>),
}

#[derive(Default)]
struct MethodRecord {
    name: String,
    descriptor: String,
    locals: Vec<String>,
    max_stack: u16,
    handlers: Vec<HandlerRecord>,
    code: Vec<u8>,
    debug: Option<DebugRecord>,
}

struct HandlerRecord {
    from: u32,
    to: u32,
    entry: u32,
    catch_type: String,
}

struct DebugRecord {
    source_file: String,
    lines: Vec<LineRecord>,
}

struct LineRecord {
    ip: u32,
    line: i32,
}

impl BinarySuiteEmitter {
    pub fn new() -> BinarySuiteEmitter {
        BinarySuiteEmitter::default()
    }

    /// Code of the last method emitted (empty before its second pass)
    pub fn last_code(&self) -> &[u8] {
        self.classes
            .last()
            .and_then(|class| class.methods.last())
            .map_or(&[][..], |method| method.code.as_slice())
    }

    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        MAGIC.serialize(writer)?;
        VERSION.serialize(writer)?;
        (self.classes.len() as u16).serialize(writer)?;
        for class in &self.classes {
            class.serialize(writer)?;
        }
        Ok(())
    }

    fn method(&mut self) -> Option<&mut MethodRecord> {
        self.classes
            .last_mut()
            .and_then(|class| class.methods.last_mut())
    }

    fn write_u8(&mut self, byte: u8) {
        if !self.first_pass {
            self.code.push(byte);
        }
    }

    fn write_i16(&mut self, value: i16) {
        if !self.first_pass {
            let _ = self.code.write_i16::<BigEndian>(value);
        }
    }

    fn write_i32(&mut self, value: i32) {
        if !self.first_pass {
            let _ = self.code.write_i32::<BigEndian>(value);
        }
    }

    fn write_i64(&mut self, value: i64) {
        if !self.first_pass {
            let _ = self.code.write_i64::<BigEndian>(value);
        }
    }

    /// Single byte instruction
    fn no_operand(&mut self, opcode: u8) -> u32 {
        self.write_u8(opcode);
        1
    }

    /// Instruction with an index or slot operand, using the smallest form that fits
    ///
    /// `immediate` is the first opcode of the run of immediate forms, when the operand is to be
    /// encoded in the opcode itself.
    fn index_operand(&mut self, opcode: u8, immediate: Option<u8>, operand: u32) -> Result<u32> {
        let value = operand as i64;
        if let Some(base) = immediate {
            assert_that(operand <= 15, "immediate operand out of range")?;
            self.write_u8(base + operand as u8);
            Ok(1)
        } else if fits(8, value) {
            self.write_u8(opcode);
            self.write_u8(operand as u8);
            Ok(2)
        } else if fits(12, value) {
            self.write_u8(opcodes::WIDE_0 + ((operand >> 8) & 0xF) as u8);
            self.write_u8(opcode);
            self.write_u8((operand & 0xFF) as u8);
            Ok(3)
        } else if fits(16, value) {
            self.write_u8(opcodes::WIDE_HALF);
            self.write_u8(opcode);
            self.write_i16(operand as i16);
            Ok(4)
        } else {
            self.write_u8(opcodes::WIDE_INT);
            self.write_u8(opcode);
            self.write_i32(operand as i32);
            Ok(6)
        }
    }
}

impl<'g> SuiteEmitter<'g> for BinarySuiteEmitter {
    fn begin_class(&mut self, class: Type<'g>) {
        self.classes.push(ClassRecord {
            name: class.name.clone(),
            ..ClassRecord::default()
        });
    }

    fn end_class(&mut self, class_references: &[Type<'g>], constants: &[ObjectConstant]) {
        if let Some(class) = self.classes.last_mut() {
            class.class_references = class_references.iter().map(|ty| ty.name.clone()).collect();
            class.constants = constants
                .iter()
                .map(|constant| match constant {
                    ObjectConstant::String(string) => ConstantRecord::String(string.clone()),
                    ObjectConstant::IntArray(values) => ConstantRecord::IntArray(values.clone()),
                })
                .collect();
        }
    }

    fn abort_class(&mut self) {
        self.classes.pop();
    }

    fn begin_method(&mut self, method: &'g MethodData<'g>, first_pass: bool) {
        self.first_pass = first_pass;
        self.code.clear();
        if first_pass {
            if let Some(class) = self.classes.last_mut() {
                class.methods.push(MethodRecord {
                    name: method.name.clone(),
                    descriptor: method.descriptor.clone(),
                    ..MethodRecord::default()
                });
            }
        }
    }

    fn end_method(&mut self, length: u32) -> Result<()> {
        if self.first_pass {
            return Ok(());
        }
        assert_that(
            self.code.len() == length as usize,
            "emitted code length differs from the relocated length",
        )?;
        let code = std::mem::take(&mut self.code);
        if let Some(method) = self.method() {
            method.code = code;
        }
        Ok(())
    }

    fn branch_encodings(&self) -> &[BranchEncoding] {
        &BRANCH_ENCODINGS
    }

    fn table_switch_encoding(&self, targets: usize) -> BranchEncoding {
        BranchEncoding::new(
            16,
            TABLE_SWITCH_HEADER + 2 * targets as u32,
            TABLE_SWITCH_HEADER,
        )
    }

    fn emit_constant(&mut self, _cx: &EmitContext<'_, 'g>, constant: ConstantOp) -> Result<u32> {
        Ok(match constant {
            ConstantOp::Immediate(-1) => self.no_operand(opcodes::CONST_M1),
            ConstantOp::Immediate(value) => {
                assert_that((0..=15).contains(&value), "immediate constant out of range")?;
                self.no_operand(opcodes::CONST_0 + value as u8)
            }
            ConstantOp::Null => self.no_operand(opcodes::CONST_NULL),
            ConstantOp::Byte(value) => {
                self.write_u8(opcodes::CONST_BYTE);
                self.write_u8(value as u8);
                2
            }
            ConstantOp::Short(value) => {
                self.write_u8(opcodes::CONST_SHORT);
                self.write_i16(value);
                3
            }
            ConstantOp::Char(value) => {
                self.write_u8(opcodes::CONST_CHAR);
                self.write_i16(value as i16);
                3
            }
            ConstantOp::Int(value) => {
                self.write_u8(opcodes::CONST_INT);
                self.write_i32(value);
                5
            }
            ConstantOp::Float(value) => {
                self.write_u8(opcodes::CONST_FLOAT);
                self.write_i32(value.to_bits() as i32);
                5
            }
            ConstantOp::Long(value) => {
                self.write_u8(opcodes::CONST_LONG);
                self.write_i64(value);
                9
            }
            ConstantOp::Double(value) => {
                self.write_u8(opcodes::CONST_DOUBLE);
                self.write_i64(value.to_bits() as i64);
                9
            }
        })
    }

    fn emit_object(
        &mut self,
        _cx: &EmitContext<'_, 'g>,
        index: u32,
        immediate: bool,
    ) -> Result<u32> {
        let base = if immediate {
            Some(opcodes::OBJECT_0)
        } else {
            None
        };
        self.index_operand(opcodes::OBJECT, base, index)
    }

    fn emit_class(
        &mut self,
        _cx: &EmitContext<'_, 'g>,
        index: u32,
        immediate: bool,
    ) -> Result<u32> {
        let base = if immediate {
            Some(opcodes::CLASS_0)
        } else {
            None
        };
        self.index_operand(opcodes::CLASS, base, index)
    }

    fn emit_local(
        &mut self,
        _cx: &EmitContext<'_, 'g>,
        op: LocalOp,
        index: u16,
        immediate: bool,
    ) -> Result<u32> {
        let (opcode, base) = match op {
            LocalOp::Load => (opcodes::LOAD, opcodes::LOAD_0),
            LocalOp::Store => (opcodes::STORE, opcodes::STORE_0),
            LocalOp::Increment => {
                assert_that(!immediate, "inc has no immediate form")?;
                (opcodes::INC, opcodes::INC)
            }
            LocalOp::Decrement => {
                assert_that(!immediate, "dec has no immediate form")?;
                (opcodes::DEC, opcodes::DEC)
            }
        };
        let base = if immediate { Some(base) } else { None };
        self.index_operand(opcode, base, index as u32)
    }

    fn emit_numeric(&mut self, _cx: &EmitContext<'_, 'g>, insn: NumericInsn) -> Result<u32> {
        let (prefix, opcode) = opcodes::numeric(insn)
            .ok_or_else(|| AssertionFailed::new(format!("no encoding for {:?}", insn)))?;
        match prefix {
            None => Ok(self.no_operand(opcode)),
            Some(prefix) => {
                self.write_u8(prefix);
                self.write_u8(opcode);
                Ok(2)
            }
        }
    }

    fn emit_field(&mut self, _cx: &EmitContext<'_, 'g>, op: FieldOp, slot: u32) -> Result<u32> {
        self.index_operand(opcodes::field(op), None, slot)
    }

    fn emit_invoke(
        &mut self,
        _cx: &EmitContext<'_, 'g>,
        form: InvokeForm,
        slot: u32,
    ) -> Result<u32> {
        self.index_operand(opcodes::invoke(form), None, slot)
    }

    fn emit_simple(&mut self, _cx: &EmitContext<'_, 'g>, op: SimpleOp) -> Result<u32> {
        Ok(self.no_operand(opcodes::simple(op)))
    }

    fn emit_branch(
        &mut self,
        _cx: &EmitContext<'_, 'g>,
        op: BranchOp,
        offset: i32,
        encoding: BranchEncoding,
    ) -> Result<u32> {
        assert_that(
            encoding.fits(offset as i64),
            "branch offset does not fit its encoding",
        )?;
        let opcode = opcodes::branch(op);
        match encoding.offset_bits {
            8 => {
                self.write_u8(opcode);
                self.write_u8(offset as u8);
            }
            12 => {
                self.write_u8(opcodes::WIDE_0 + ((offset >> 8) & 0xF) as u8);
                self.write_u8(opcode);
                self.write_u8((offset & 0xFF) as u8);
            }
            16 => {
                self.write_u8(opcodes::WIDE_HALF);
                self.write_u8(opcode);
                self.write_i16(offset as i16);
            }
            bits => {
                return Err(
                    AssertionFailed::new(format!("unknown {} bit branch encoding", bits)).into(),
                )
            }
        }
        Ok(encoding.size)
    }

    fn emit_table_switch(
        &mut self,
        _cx: &EmitContext<'_, 'g>,
        switch: &TableSwitchOperands,
    ) -> Result<u32> {
        let targets = (switch.high as i64 - switch.low as i64 + 1) as usize;
        assert_that(
            switch.offsets.len() == targets,
            "table switch offsets do not match its range",
        )?;
        self.write_u8(opcodes::TABLESWITCH);
        if switch.padding == 1 {
            self.write_u8(0);
        }
        self.write_i16(switch.default as i16);
        self.write_i32(switch.low);
        self.write_i32(switch.high);
        for &offset in &switch.offsets {
            self.write_i16(offset as i16);
        }
        Ok(TABLE_SWITCH_HEADER + 2 * targets as u32 + switch.padding)
    }

    fn emit_locals(&mut self, types: &[Type<'g>]) {
        if let Some(method) = self.method() {
            method.locals = types.iter().map(|ty| ty.descriptor()).collect();
        }
    }

    fn emit_max_stack(&mut self, max_stack: usize) {
        if let Some(method) = self.method() {
            method.max_stack = max_stack as u16;
        }
    }

    fn emit_exception_handlers(&mut self, handlers: &[EmittedHandler<'g>]) {
        if let Some(method) = self.method() {
            method.handlers = handlers
                .iter()
                .map(|handler| HandlerRecord {
                    from: handler.from,
                    to: handler.to,
                    entry: handler.entry,
                    catch_type: handler.catch_type.name.clone(),
                })
                .collect();
        }
    }

    fn emit_debug(&mut self, source_file: Option<&str>, lines: &[LineNumber]) {
        if let Some(method) = self.method() {
            method.debug = Some(DebugRecord {
                source_file: source_file.unwrap_or_default().to_owned(),
                lines: lines
                    .iter()
                    .map(|line| LineRecord {
                        ip: line.ip,
                        line: line.line,
                    })
                    .collect(),
            });
        }
    }
}

impl Serialize for ClassRecord {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.name.serialize(writer)?;
        self.class_references.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.methods.serialize(writer)
    }
}

impl Serialize for ConstantRecord {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            ConstantRecord::String(string) => {
                1u8.serialize(writer)?;
                string.serialize(writer)
            }
            ConstantRecord::IntArray(values) => {
                2u8.serialize(writer)?;
                values.serialize(writer)
            }
        }
    }
}

impl Serialize for MethodRecord {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.name.serialize(writer)?;
        self.descriptor.serialize(writer)?;
        self.locals.serialize(writer)?;
        self.max_stack.serialize(writer)?;
        self.handlers.serialize(writer)?;
        (self.code.len() as u32).serialize(writer)?;
        writer.write_all(&self.code)?;
        self.debug.serialize(writer)
    }
}

impl Serialize for HandlerRecord {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.from.serialize(writer)?;
        self.to.serialize(writer)?;
        self.entry.serialize(writer)?;
        self.catch_type.serialize(writer)
    }
}

impl Serialize for DebugRecord {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.source_file.serialize(writer)?;
        self.lines.serialize(writer)
    }
}

impl Serialize for LineRecord {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.ip.serialize(writer)?;
        self.line.serialize(writer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;
    use crate::model::{ContextArenas, TranslationContext};
    use crate::settings::Settings;

    const CX: EmitContext<'static, 'static> = EmitContext { ip: 0, stack: &[] };

    fn second_pass() -> BinarySuiteEmitter {
        BinarySuiteEmitter {
            first_pass: false,
            ..BinarySuiteEmitter::default()
        }
    }

    #[test]
    fn index_operand_forms() {
        let mut emitter = second_pass();
        let sizes: Vec<u32> = [3, 100, 1000, 30000, 70000]
            .iter()
            .map(|&slot| emitter.emit_field(&CX, FieldOp::GetField, slot).unwrap())
            .collect();
        assert_eq!(sizes, vec![2, 2, 3, 4, 6]);
        assert_eq!(&emitter.code[..2], &[opcodes::GETFIELD, 3]);
        assert_eq!(
            &emitter.code[4..7],
            &[opcodes::WIDE_0 + 3, opcodes::GETFIELD, 0xE8]
        );
        assert_eq!(emitter.code.len(), 17);
    }

    #[test]
    fn immediate_locals() {
        let mut emitter = second_pass();
        assert_eq!(emitter.emit_local(&CX, LocalOp::Load, 4, true).unwrap(), 1);
        assert_eq!(emitter.emit_local(&CX, LocalOp::Store, 20, false).unwrap(), 2);
        assert_eq!(
            emitter.code,
            vec![opcodes::LOAD_0 + 4, opcodes::STORE, 20]
        );
        assert!(emitter.emit_local(&CX, LocalOp::Load, 16, true).is_err());
    }

    #[test]
    fn constant_sizes() {
        let mut emitter = second_pass();
        let sizes: Vec<u32> = [
            ConstantOp::Immediate(-1),
            ConstantOp::Immediate(15),
            ConstantOp::Byte(-100),
            ConstantOp::Short(1000),
            ConstantOp::Char(40000),
            ConstantOp::Int(100_000),
            ConstantOp::Float(1.5),
            ConstantOp::Long(1 << 40),
            ConstantOp::Double(0.5),
            ConstantOp::Null,
        ]
        .iter()
        .map(|&constant| emitter.emit_constant(&CX, constant).unwrap())
        .collect();
        assert_eq!(sizes, vec![1, 1, 2, 3, 3, 5, 5, 9, 9, 1]);
        assert_eq!(emitter.code.len(), sizes.iter().sum::<u32>() as usize);
        assert_eq!(emitter.code[0], opcodes::CONST_M1);
        assert_eq!(emitter.code[1], opcodes::CONST_0 + 15);
    }

    #[test]
    fn first_pass_writes_nothing() {
        let mut emitter = BinarySuiteEmitter::new();
        emitter.first_pass = true;
        assert_eq!(emitter.emit_field(&CX, FieldOp::PutStatic, 5000).unwrap(), 4);
        assert!(emitter.code.is_empty());
    }

    #[test]
    fn branch_encodings() {
        let mut emitter = second_pass();
        let goto = BranchOp::Goto;
        assert_eq!(
            emitter
                .emit_branch(&CX, goto, -5, BRANCH_ENCODINGS[0])
                .unwrap(),
            2
        );
        assert_eq!(
            emitter
                .emit_branch(&CX, goto, 0x123, BRANCH_ENCODINGS[1])
                .unwrap(),
            3
        );
        assert_eq!(
            emitter
                .emit_branch(&CX, goto, 5000, BRANCH_ENCODINGS[2])
                .unwrap(),
            4
        );
        assert_eq!(
            emitter.code,
            vec![
                opcodes::GOTO,
                0xFB,
                opcodes::WIDE_0 + 1,
                opcodes::GOTO,
                0x23,
                opcodes::WIDE_HALF,
                opcodes::GOTO,
                0x13,
                0x88
            ]
        );
        assert!(emitter
            .emit_branch(&CX, goto, 200, BRANCH_ENCODINGS[0])
            .is_err());
    }

    #[test]
    fn table_switch_layout() {
        let mut emitter = second_pass();
        let encoding =
            <BinarySuiteEmitter as SuiteEmitter<'static>>::table_switch_encoding(&emitter, 2);
        assert_eq!(encoding, BranchEncoding::new(16, 15, 11));

        let switch = TableSwitchOperands {
            low: 1,
            high: 2,
            default: 20,
            offsets: vec![4, -8],
            padding: 1,
        };
        assert_eq!(emitter.emit_table_switch(&CX, &switch).unwrap(), 16);
        assert_eq!(
            emitter.code,
            vec![
                opcodes::TABLESWITCH,
                0,
                0,
                20,
                0,
                0,
                0,
                1,
                0,
                0,
                0,
                2,
                0,
                4,
                0xFF,
                0xF8
            ]
        );
    }

    #[test]
    fn suite_file_layout() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        let mut emitter = BinarySuiteEmitter::new();
        emitter.begin_class(ctx.core.string);
        emitter.end_class(
            &[ctx.core.object],
            &[ObjectConstant::IntArray(vec![1, 2])],
        );

        let mut out = vec![];
        emitter.write_to(&mut out).unwrap();
        let mut expected = vec![0x53, 0x55, 0x49, 0x54, 0, 1, 0, 1];
        expected.extend_from_slice(&[0, 16]);
        expected.extend_from_slice(b"java/lang/String");
        expected.extend_from_slice(&[0, 1, 0, 16]);
        expected.extend_from_slice(b"java/lang/Object");
        expected.extend_from_slice(&[0, 1, 2, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2]);
        expected.extend_from_slice(&[0, 0]);
        assert_eq!(out, expected);
    }
}
