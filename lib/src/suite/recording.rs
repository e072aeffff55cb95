use super::binary::{BinarySuiteEmitter, TABLE_SWITCH_HEADER};
use super::emitter::*;
use crate::errors::Result;
use crate::ir::{InvokeForm, ObjectConstant};
use crate::model::{MethodData, Type};

/// One instruction, as requested by the bytecode producer
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    Constant(ConstantOp),
    Object { index: u32, immediate: bool },
    Class { index: u32, immediate: bool },
    Local { op: LocalOp, index: u16, immediate: bool },
    Numeric(NumericInsn),
    Field { op: FieldOp, slot: u32 },
    Invoke { form: InvokeForm, slot: u32 },
    Simple(SimpleOp),
    Branch { op: BranchOp, offset: i32, encoding: BranchEncoding },
    TableSwitch(TableSwitchOperands),
}

#[derive(Debug, Clone)]
pub struct RecordedInsn<'g> {
    pub ip: u32,
    pub size: u32,
    pub emitted: Emitted,

    /// Operand stack before the instruction, one type per word
    pub stack: Vec<Type<'g>>,
}

impl<'g> RecordedInsn<'g> {
    /// Address a branch or switch offset is relative to
    pub fn offset_base(&self) -> u32 {
        match &self.emitted {
            Emitted::Branch { encoding, .. } => self.ip + encoding.ip_adjust,
            Emitted::TableSwitch(switch) => self.ip + TABLE_SWITCH_HEADER + switch.padding,
            _ => self.ip,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedMethod<'g> {
    pub method: &'g MethodData<'g>,
    pub length: u32,
    pub code: Vec<RecordedInsn<'g>>,
    pub bytes: Vec<u8>,
    pub locals: Vec<Type<'g>>,
    pub max_stack: usize,
    pub handlers: Vec<EmittedHandler<'g>>,
    pub lines: Vec<LineNumber>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordedClass<'g> {
    pub class_references: Vec<Type<'g>>,
    pub constants: Vec<ObjectConstant>,
    pub methods: Vec<RecordedMethod<'g>>,
}

/// Emitter recording what it is asked to emit (in the second pass), for inspection by tests and
/// listings
///
/// Sizes and bytes come from a `BinarySuiteEmitter` the calls are forwarded to.
#[derive(Default)]
pub struct RecordingEmitter<'g> {
    binary: BinarySuiteEmitter,
    first_pass: bool,
    pub classes: Vec<RecordedClass<'g>>,
}

impl<'g> RecordingEmitter<'g> {
    pub fn new() -> RecordingEmitter<'g> {
        RecordingEmitter::default()
    }

    /// Most recently emitted method
    pub fn last_method(&self) -> Option<&RecordedMethod<'g>> {
        self.classes.last().and_then(|class| class.methods.last())
    }

    fn method(&mut self) -> Option<&mut RecordedMethod<'g>> {
        self.classes
            .last_mut()
            .and_then(|class| class.methods.last_mut())
    }

    fn record(&mut self, cx: &EmitContext<'_, 'g>, size: u32, emitted: Emitted) -> u32 {
        if !self.first_pass {
            let insn = RecordedInsn {
                ip: cx.ip,
                size,
                emitted,
                stack: cx.stack.to_vec(),
            };
            if let Some(method) = self.method() {
                method.code.push(insn);
            }
        }
        size
    }
}

impl<'g> SuiteEmitter<'g> for RecordingEmitter<'g> {
    fn begin_class(&mut self, class: Type<'g>) {
        self.binary.begin_class(class);
        self.classes.push(RecordedClass::default());
    }

    fn end_class(&mut self, class_references: &[Type<'g>], constants: &[ObjectConstant]) {
        self.binary.end_class(class_references, constants);
        if let Some(class) = self.classes.last_mut() {
            class.class_references = class_references.to_vec();
            class.constants = constants.to_vec();
        }
    }

    fn abort_class(&mut self) {
        self.binary.abort_class();
        self.classes.pop();
    }

    fn begin_method(&mut self, method: &'g MethodData<'g>, first_pass: bool) {
        self.binary.begin_method(method, first_pass);
        self.first_pass = first_pass;
        if first_pass {
            if let Some(class) = self.classes.last_mut() {
                class.methods.push(RecordedMethod {
                    method,
                    length: 0,
                    code: vec![],
                    bytes: vec![],
                    locals: vec![],
                    max_stack: 0,
                    handlers: vec![],
                    lines: vec![],
                });
            }
        } else if let Some(recorded) = self.method() {
            recorded.code.clear();
        }
    }

    fn end_method(&mut self, length: u32) -> Result<()> {
        self.binary.end_method(length)?;
        let first_pass = self.first_pass;
        let bytes = self.binary.last_code().to_vec();
        if let Some(method) = self.method() {
            method.length = length;
            if !first_pass {
                method.bytes = bytes;
            }
        }
        Ok(())
    }

    fn branch_encodings(&self) -> &[BranchEncoding] {
        <BinarySuiteEmitter as SuiteEmitter<'g>>::branch_encodings(&self.binary)
    }

    fn table_switch_encoding(&self, targets: usize) -> BranchEncoding {
        <BinarySuiteEmitter as SuiteEmitter<'g>>::table_switch_encoding(&self.binary, targets)
    }

    fn emit_constant(&mut self, cx: &EmitContext<'_, 'g>, constant: ConstantOp) -> Result<u32> {
        let size = self.binary.emit_constant(cx, constant)?;
        Ok(self.record(cx, size, Emitted::Constant(constant)))
    }

    fn emit_object(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        index: u32,
        immediate: bool,
    ) -> Result<u32> {
        let size = self.binary.emit_object(cx, index, immediate)?;
        Ok(self.record(cx, size, Emitted::Object { index, immediate }))
    }

    fn emit_class(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        index: u32,
        immediate: bool,
    ) -> Result<u32> {
        let size = self.binary.emit_class(cx, index, immediate)?;
        Ok(self.record(cx, size, Emitted::Class { index, immediate }))
    }

    fn emit_local(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        op: LocalOp,
        index: u16,
        immediate: bool,
    ) -> Result<u32> {
        let size = self.binary.emit_local(cx, op, index, immediate)?;
        let emitted = Emitted::Local {
            op,
            index,
            immediate,
        };
        Ok(self.record(cx, size, emitted))
    }

    fn emit_numeric(&mut self, cx: &EmitContext<'_, 'g>, insn: NumericInsn) -> Result<u32> {
        let size = self.binary.emit_numeric(cx, insn)?;
        Ok(self.record(cx, size, Emitted::Numeric(insn)))
    }

    fn emit_field(&mut self, cx: &EmitContext<'_, 'g>, op: FieldOp, slot: u32) -> Result<u32> {
        let size = self.binary.emit_field(cx, op, slot)?;
        Ok(self.record(cx, size, Emitted::Field { op, slot }))
    }

    fn emit_invoke(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        form: InvokeForm,
        slot: u32,
    ) -> Result<u32> {
        let size = self.binary.emit_invoke(cx, form, slot)?;
        Ok(self.record(cx, size, Emitted::Invoke { form, slot }))
    }

    fn emit_simple(&mut self, cx: &EmitContext<'_, 'g>, op: SimpleOp) -> Result<u32> {
        let size = self.binary.emit_simple(cx, op)?;
        Ok(self.record(cx, size, Emitted::Simple(op)))
    }

    fn emit_branch(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        op: BranchOp,
        offset: i32,
        encoding: BranchEncoding,
    ) -> Result<u32> {
        let size = self.binary.emit_branch(cx, op, offset, encoding)?;
        let emitted = Emitted::Branch {
            op,
            offset,
            encoding,
        };
        Ok(self.record(cx, size, emitted))
    }

    fn emit_table_switch(
        &mut self,
        cx: &EmitContext<'_, 'g>,
        switch: &TableSwitchOperands,
    ) -> Result<u32> {
        let size = self.binary.emit_table_switch(cx, switch)?;
        Ok(self.record(cx, size, Emitted::TableSwitch(switch.clone())))
    }

    fn emit_locals(&mut self, types: &[Type<'g>]) {
        self.binary.emit_locals(types);
        if let Some(method) = self.method() {
            method.locals = types.to_vec();
        }
    }

    fn emit_max_stack(&mut self, max_stack: usize) {
        <BinarySuiteEmitter as SuiteEmitter<'g>>::emit_max_stack(&mut self.binary, max_stack);
        if let Some(method) = self.method() {
            method.max_stack = max_stack;
        }
    }

    fn emit_exception_handlers(&mut self, handlers: &[EmittedHandler<'g>]) {
        self.binary.emit_exception_handlers(handlers);
        if let Some(method) = self.method() {
            method.handlers = handlers.to_vec();
        }
    }

    fn emit_debug(&mut self, source_file: Option<&str>, lines: &[LineNumber]) {
        <BinarySuiteEmitter as SuiteEmitter<'g>>::emit_debug(&mut self.binary, source_file, lines);
        if let Some(method) = self.method() {
            method.lines = lines.to_vec();
        }
    }
}
