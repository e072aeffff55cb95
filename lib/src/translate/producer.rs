//! Final pass over a transformed method: emitting its code through a `SuiteEmitter`
//!
//! Code is laid out in blocks, each a run of fixed size instructions optionally closed by a branch
//! or a table switch whose size depends on the distance to its targets. The first pass sizes every
//! instruction with branches at their smallest encoding. Relocation then moves blocks around,
//! widening branches that no longer reach their target, until nothing changes. The second pass
//! emits the final code.
//!
//! Both passes track the types on the operand stack, checking that every instruction pops values
//! of the category it expects and that the stack is empty wherever the code must not carry values
//! across.

use super::statistics::Statistics;
use crate::errors::{
    assert_that, verify_translatable, AssertionFailed, ErrorContext, LinkageError, Result,
};
use crate::ir::{
    dispatch, Constant, InsnId, InsnKind, Instruction, InstructionVisitor, InvokeForm, LocalId,
    MethodIr, ObjectConstant, TargetId,
};
use crate::model::{MethodData, PrimitiveType, TranslationContext, Type};
use crate::suite::{
    BranchEncoding, BranchOp, ClassPools, ConstantOp, EmitContext, EmittedHandler, FieldOp,
    LineNumber, LocalOp, NumericInsn, NumericOp, NumericPrefix, SimpleOp, SuiteEmitter,
    TableSwitchOperands,
};

/// Relocation keeps going as long as some branch grows, which cannot happen more often than there
/// are branch encodings per branch. Anything beyond this means a bug.
const MAX_RELOCATION_PASSES: usize = 64;

/// Emit the code of a transformed method, returning its length in bytes
///
/// `locals` are the method's locals in slot order, as returned by the transformer.
pub fn produce<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    ir: &mut MethodIr<'g>,
    locals: &[LocalId],
    pools: &mut ClassPools<'g>,
    emitter: &mut dyn SuiteEmitter<'g>,
) -> Result<u32> {
    let branch_encodings = emitter.branch_encodings().to_vec();
    assert_that(!branch_encodings.is_empty(), "emitter has no branch encodings")?;
    let mut producer = BytecodeProducer {
        ctx,
        method,
        locals,
        pools,
        emitter,
        branch_encodings,
        first_pass: true,
        blocks: vec![],
        pending: vec![],
        current: None,
        ip: 0,
        stack: vec![],
        max_stack: 0,
        lines: vec![],
    };

    producer.emitter.begin_method(method, true);
    for id in ir.ids() {
        dispatch(&mut producer, ir, id).context(|| format!("sizing {}", ir[id]))?;
    }
    assert_that(producer.pending.is_empty(), "method does not end with a block exit")?;
    let passes = producer.relocate(ir)?;
    let length = producer.blocks.last().map_or(0, Block::next_ip);
    producer.emitter.end_method(length)?;

    let types: Vec<_> = locals.iter().map(|&local| ir[local].ty).collect();
    producer.emitter.emit_locals(&types);
    producer.emitter.emit_max_stack(producer.max_stack);
    let handlers = exception_handlers(ir)?;
    producer.emitter.emit_exception_handlers(&handlers);

    producer.first_pass = false;
    producer.stack.clear();
    producer.emitter.begin_method(method, false);
    for index in 0..producer.blocks.len() {
        producer.emit_block(ir, index)?;
    }
    assert_that(producer.ip == length, "emitted code does not match its relocated length")?;

    if ctx.settings.emit_debug_info {
        let source_file = method.parent.source_file();
        producer.emitter.emit_debug(source_file.as_deref(), &producer.lines);
    }
    producer.emitter.end_method(length)?;

    Statistics::bump(&ctx.statistics.relaxation_passes, passes);
    Statistics::bump(&ctx.statistics.bytes, length as usize);
    log::debug!(
        "{}: {} bytes, max stack {}, relocated in {} passes",
        method,
        length,
        producer.max_stack,
        passes
    );
    Ok(length)
}

fn exception_handlers<'g>(ir: &MethodIr<'g>) -> Result<Vec<EmittedHandler<'g>>> {
    let address = |insn: Option<InsnId>| {
        insn.filter(|&insn| ir[insn].is_linked())
            .map(|insn| ir[insn].reloc_ip)
            .ok_or_else(|| AssertionFailed::new("exception handler lost one of its markers"))
    };
    ir.handlers
        .iter()
        .map(|(_, handler)| {
            Ok(EmittedHandler {
                from: address(handler.start)?,
                to: address(handler.end)?,
                entry: address(handler.entry.or(ir[handler.target].insn))?,
                catch_type: handler.catch_type,
            })
        })
        .collect()
}

/// Instruction ending a block whose size depends on where its targets end up
struct Delimiter {
    insn: InsnId,
    encoding: BranchEncoding,
    kind: DelimiterKind,
}

enum DelimiterKind {
    /// Branch to the first instruction of its target
    Branch { target: InsnId },

    /// Table switch, with the zero byte keeping its operands aligned
    Switch { padding: u32 },
}

impl Delimiter {
    fn padding(&self) -> u32 {
        match self.kind {
            DelimiterKind::Switch { padding } => padding,
            DelimiterKind::Branch { .. } => 0,
        }
    }
}

struct Block {
    start: u32,

    /// Fixed size instructions, with their sizes
    insns: Vec<(InsnId, u32)>,
    fixed_size: u32,
    delimiter: Option<Delimiter>,
}

impl Block {
    fn delimiter_ip(&self) -> u32 {
        self.start + self.fixed_size
    }

    fn next_ip(&self) -> u32 {
        let end = self.delimiter_ip();
        match &self.delimiter {
            Some(delimiter) => end + delimiter.encoding.size + delimiter.padding(),
            None => end,
        }
    }

    fn place(&self, ir: &mut MethodIr) {
        let mut ip = self.start;
        for &(insn, size) in &self.insns {
            ir[insn].reloc_ip = ip;
            ip += size;
        }
        if let Some(delimiter) = &self.delimiter {
            ir[delimiter.insn].reloc_ip = ip;
        }
    }

    /// Move the block by `growth` bytes, returning the growth of the code after it
    fn relocate(
        &mut self,
        ir: &mut MethodIr,
        mut growth: i64,
        encodings: &[BranchEncoding],
    ) -> Result<i64> {
        let old_delimiter_ip = self.delimiter_ip() as i64;
        self.start = (self.start as i64 + growth) as u32;
        self.place(ir);

        let ip = self.delimiter_ip();
        let delimiter = match &mut self.delimiter {
            Some(delimiter) => delimiter,
            None => return Ok(growth),
        };
        match &mut delimiter.kind {
            DelimiterKind::Switch { padding } => {
                if (ip + delimiter.encoding.ip_adjust + *padding) % 2 != 0 {
                    if *padding == 0 {
                        *padding = 1;
                        growth += 1;
                    } else {
                        *padding = 0;
                        growth -= 1;
                    }
                }
            }
            DelimiterKind::Branch { target } => {
                let mut target_ip = ir[*target].reloc_ip as i64;
                if target_ip > old_delimiter_ip {
                    target_ip += growth;
                }
                let offset = target_ip - (ip + delimiter.encoding.ip_adjust) as i64;
                if !delimiter.encoding.fits(offset) {
                    let wider = encodings
                        .iter()
                        .copied()
                        .find(|encoding| encoding.fits(offset))
                        .ok_or_else(|| {
                            LinkageError::untranslatable(format!(
                                "branch offset {} is out of range",
                                offset
                            ))
                        })?;
                    assert_that(
                        wider.size > delimiter.encoding.size,
                        "branch encodings are not ordered by size",
                    )?;
                    growth += (wider.size - delimiter.encoding.size) as i64;
                    delimiter.encoding = wider;
                }
            }
        }
        Ok(growth)
    }
}

struct BytecodeProducer<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    method: &'g MethodData<'g>,
    locals: &'a [LocalId],
    pools: &'a mut ClassPools<'g>,
    emitter: &'a mut dyn SuiteEmitter<'g>,
    branch_encodings: Vec<BranchEncoding>,

    first_pass: bool,
    blocks: Vec<Block>,

    /// Fixed size instructions of the block being built (first pass)
    pending: Vec<(InsnId, u32)>,

    /// Encoding and padding of the delimiter being emitted (second pass)
    current: Option<(BranchEncoding, u32)>,

    /// Address of the next instruction (second pass)
    ip: u32,

    /// Types on the operand stack, one per word
    stack: Vec<Type<'g>>,
    max_stack: usize,
    lines: Vec<LineNumber>,
}

macro_rules! fields {
    ($ir:expr, $id:expr, $pattern:pat => $fields:expr) => {
        match &$ir[$id].kind {
            $pattern => $fields,
            other => {
                return Err(AssertionFailed::new(format!(
                    "unexpected {} instruction",
                    other.mnemonic()
                ))
                .into())
            }
        }
    };
}

impl<'a, 'g> BytecodeProducer<'a, 'g> {
    /// Relocate blocks until no branch grows, returning the number of passes
    fn relocate(&mut self, ir: &mut MethodIr<'g>) -> Result<usize> {
        let mut passes = 0;
        loop {
            passes += 1;
            assert_that(passes <= MAX_RELOCATION_PASSES, "relocation does not converge")?;
            let mut growth = 0;
            for block in &mut self.blocks {
                growth = block.relocate(ir, growth, &self.branch_encodings)?;
            }
            if growth == 0 {
                return Ok(passes);
            }
        }
    }

    fn emit_block(&mut self, ir: &mut MethodIr<'g>, index: usize) -> Result<()> {
        let block = &self.blocks[index];
        let insns: Vec<InsnId> = block.insns.iter().map(|&(insn, _)| insn).collect();
        let delimiter = block
            .delimiter
            .as_ref()
            .map(|delimiter| (delimiter.insn, delimiter.encoding, delimiter.padding()));

        for insn in insns.into_iter().chain(delimiter.map(|(insn, _, _)| insn)) {
            assert_that(
                ir[insn].reloc_ip == self.ip,
                "instruction emitted away from its relocated address",
            )?;
            log::trace!("{:>6}: {}", self.ip, ir[insn]);
            if let Some((delimiter, encoding, padding)) = delimiter {
                if delimiter == insn {
                    self.current = Some((encoding, padding));
                }
            }
            dispatch(self, ir, insn).context(|| format!("emitting {}", ir[insn]))?;
            self.current = None;
        }
        Ok(())
    }

    fn current_delimiter(&self) -> Result<(BranchEncoding, u32)> {
        self.current.ok_or_else(|| {
            AssertionFailed::new("variable size instruction outside a delimiter").into()
        })
    }

    /// Account for `size` bytes of code for `id`, which may take several emitted instructions
    fn append(&mut self, id: InsnId, size: u32, is_first: bool) -> Result<()> {
        if !self.first_pass {
            self.ip += size;
        } else if is_first {
            self.pending.push((id, size));
        } else {
            match self.pending.last_mut() {
                Some((last, total)) if *last == id => *total += size,
                _ => return Err(AssertionFailed::new("continuation of another instruction").into()),
            }
        }
        Ok(())
    }

    /// Close the block being built (first pass)
    fn end_block(&mut self, ir: &mut MethodIr<'g>, delimiter: Option<Delimiter>) {
        if !self.first_pass {
            return;
        }
        let insns = std::mem::take(&mut self.pending);
        let block = Block {
            start: self.blocks.last().map_or(0, Block::next_ip),
            fixed_size: insns.iter().map(|&(_, size)| size).sum(),
            insns,
            delimiter,
        };
        block.place(ir);
        self.blocks.push(block);
    }

    fn emit<F>(&mut self, ir: &MethodIr<'g>, id: InsnId, is_first: bool, emit: F) -> Result<()>
    where
        F: FnOnce(&mut (dyn SuiteEmitter<'g> + 'a), &EmitContext<'_, 'g>) -> Result<u32>,
    {
        if !self.first_pass {
            self.note_line(ir[id].line);
        }
        let cx = EmitContext {
            ip: self.ip,
            stack: &self.stack,
        };
        let size = emit(&mut *self.emitter, &cx)?;
        self.append(id, size, is_first)
    }

    fn note_line(&mut self, line: i32) {
        if !self.ctx.settings.emit_debug_info {
            return;
        }
        match self.lines.last_mut() {
            Some(last) if last.line == line => (),
            Some(last) if last.ip == self.ip => last.line = line,
            _ => self.lines.push(LineNumber { ip: self.ip, line }),
        }
    }

    fn push(&mut self, ty: Type<'g>) -> Result<()> {
        if ty.is_void() {
            return Ok(());
        }
        self.stack.push(ty);
        if let Some(second) = self.ctx.second_word_type(ty) {
            self.stack.push(second);
        }
        if self.first_pass {
            self.max_stack = self.max_stack.max(self.stack.len());
            Ok(())
        } else {
            assert_that(self.stack.len() <= self.max_stack, "operand stack exceeds its maximum")
        }
    }

    fn pop(&mut self, expected: Type<'g>) -> Result<()> {
        let words = if expected.is_two_words() { 2 } else { 1 };
        let depth = self.stack.len();
        assert_that(depth >= words, "operand stack underflow")?;
        let top = self.stack[depth - words];
        self.stack.truncate(depth - words);

        let consistent = !top.is_second_word()
            && top.is_primitive() == expected.is_primitive()
            && top.is_two_words() == expected.is_two_words()
            && (!top.is_primitive()
                || self.ctx.local_type(top).primitive()
                    == self.ctx.local_type(expected).primitive());
        if consistent {
            Ok(())
        } else {
            let message = format!("popped {} where {} was expected", top, expected);
            Err(AssertionFailed::new(message).into())
        }
    }

    fn pop_value(&mut self, ir: &MethodIr<'g>, value: InsnId) -> Result<()> {
        self.pop(ir[value].ty)
    }

    /// Code that ends or starts a basic block must find the stack empty
    fn check_boundary(&self) -> Result<()> {
        self.check_empty(self.ctx.settings.constrain_stack)
    }

    /// Instructions that may trigger a collection (or a class initializer) must find the stack
    /// empty, for those kinds the graph builder spills the stack before
    fn check_gc_point(&self, ir: &MethodIr<'g>, id: InsnId) -> Result<()> {
        let settings = &self.ctx.settings;
        let enabled = settings.constrain_stack && settings.constrain_stack_for_gc;
        self.check_empty(enabled && ir[id].kind.constrains_stack())
    }

    fn check_empty(&self, enabled: bool) -> Result<()> {
        if enabled && !self.stack.is_empty() {
            let message = format!(
                "operand stack holds {} words where it must be empty",
                self.stack.len()
            );
            return Err(AssertionFailed::new(message).into());
        }
        Ok(())
    }

    fn local_index(&self, ir: &MethodIr<'g>, local: LocalId) -> Result<(u16, bool)> {
        assert_that(self.locals.contains(&local), "local missing from the method's locals")?;
        let index = ir[local]
            .squawk_index
            .ok_or_else(|| AssertionFailed::new("local without a slot"))?;
        Ok((index, index <= 15))
    }

    fn emit_local(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        local: LocalId,
        op: LocalOp,
    ) -> Result<()> {
        let (index, immediate) = self.local_index(ir, local)?;
        let immediate = immediate && matches!(op, LocalOp::Load | LocalOp::Store);
        self.emit(ir, id, true, |emitter, cx| emitter.emit_local(cx, op, index, immediate))
    }

    /// Push a class reference, as the first half of an instruction operating on a class
    fn load_class(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        class: Type<'g>,
        is_first: bool,
    ) -> Result<()> {
        assert_that(!class.is_proxy(), "reference to an unresolved proxy type")?;
        let index = self.pools.class_index(class);
        self.emit(ir, id, is_first, |emitter, cx| emitter.emit_class(cx, index, index <= 15))?;
        self.push(self.ctx.core.class)
    }

    fn emit_simple(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        is_first: bool,
        op: SimpleOp,
    ) -> Result<()> {
        self.emit(ir, id, is_first, |emitter, cx| emitter.emit_simple(cx, op))
    }

    fn emit_numeric(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        is_first: bool,
        insn: NumericInsn,
    ) -> Result<()> {
        self.emit(ir, id, is_first, |emitter, cx| emitter.emit_numeric(cx, insn))
    }

    fn emit_constant(&mut self, ir: &MethodIr<'g>, id: InsnId, constant: ConstantOp) -> Result<()> {
        self.emit(ir, id, true, |emitter, cx| emitter.emit_constant(cx, constant))
    }

    fn emit_field(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        is_first: bool,
        op: FieldOp,
        slot: u32,
    ) -> Result<()> {
        self.emit(ir, id, is_first, |emitter, cx| emitter.emit_field(cx, op, slot))
    }

    fn emit_integer(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        value: i64,
        long: bool,
    ) -> Result<()> {
        let constant = if (-1..=15).contains(&value) {
            ConstantOp::Immediate(value as i8)
        } else if i8::try_from(value).is_ok() {
            ConstantOp::Byte(value as i8)
        } else if i16::try_from(value).is_ok() {
            ConstantOp::Short(value as i16)
        } else if u16::try_from(value).is_ok() {
            ConstantOp::Char(value as u16)
        } else if i32::try_from(value).is_ok() {
            ConstantOp::Int(value as i32)
        } else {
            ConstantOp::Long(value)
        };
        self.emit_constant(ir, id, constant)?;

        if long && !matches!(constant, ConstantOp::Long(_)) {
            let int = self.ctx.core.int;
            self.push(int)?;
            let widen = NumericInsn {
                op: NumericOp::Convert(PrimitiveType::Long),
                operand: PrimitiveType::Int,
                prefix: Some(NumericPrefix::Long),
            };
            self.emit_numeric(ir, id, false, widen)?;
            self.pop(int)?;
        }
        self.push(ir[id].ty)
    }

    /// Small floating point constants are pushed as integers and converted
    fn emit_small_real(
        &mut self,
        ir: &MethodIr<'g>,
        id: InsnId,
        value: i8,
        to: PrimitiveType,
    ) -> Result<()> {
        let int = self.ctx.core.int;
        self.emit_constant(ir, id, ConstantOp::Immediate(value))?;
        self.push(int)?;
        let convert = NumericInsn {
            op: NumericOp::Convert(to),
            operand: PrimitiveType::Int,
            prefix: Some(NumericPrefix::Float),
        };
        self.emit_numeric(ir, id, false, convert)?;
        self.pop(int)?;
        self.push(ir[id].ty)
    }

    fn primitive(&self, ty: Type<'g>) -> Result<PrimitiveType> {
        self.ctx
            .local_type(ty)
            .primitive()
            .ok_or_else(|| AssertionFailed::new(format!("{} is not a primitive type", ty)).into())
    }

    /// Branch to the start of a target, or size it during the first pass
    fn branch(
        &mut self,
        ir: &mut MethodIr<'g>,
        id: InsnId,
        op: BranchOp,
        destination: InsnId,
    ) -> Result<()> {
        if self.first_pass {
            let delimiter = Delimiter {
                insn: id,
                encoding: self.branch_encodings[0],
                kind: DelimiterKind::Branch {
                    target: destination,
                },
            };
            self.end_block(ir, Some(delimiter));
            return Ok(());
        }

        let (encoding, _) = self.current_delimiter()?;
        let offset = ir[destination].reloc_ip as i64 - (self.ip + encoding.ip_adjust) as i64;
        assert_that(encoding.fits(offset), "branch offset does not fit its encoding")?;
        self.note_line(ir[id].line);
        let cx = EmitContext {
            ip: self.ip,
            stack: &self.stack,
        };
        let size = self.emitter.emit_branch(&cx, op, offset as i32, encoding)?;
        assert_that(size == encoding.size, "branch size differs from its encoding")?;
        self.ip += size;
        Ok(())
    }

    fn destination(&self, ir: &MethodIr<'g>, target: TargetId) -> Result<InsnId> {
        ir[target]
            .insn
            .ok_or_else(|| AssertionFailed::new("branch to a target without an instruction").into())
    }

    fn switch_offset(
        &self,
        ir: &MethodIr<'g>,
        target: TargetId,
        base: u32,
        encoding: BranchEncoding,
    ) -> Result<i32> {
        let destination = self.destination(ir, target)?;
        let offset = ir[destination].reloc_ip as i64 - base as i64;
        verify_translatable(encoding.fits(offset), "table switch offset out of range")?;
        Ok(offset as i32)
    }

    /// Exit that never falls through (the stack is empty afterwards)
    fn end_with_exit(&mut self, ir: &mut MethodIr<'g>) -> Result<()> {
        self.check_boundary()?;
        self.stack.clear();
        self.end_block(ir, None);
        Ok(())
    }
}

/// Arithmetic on floats and doubles takes the floating point prefix, on longs the long prefix
fn numeric_prefix(types: &[Type]) -> Option<NumericPrefix> {
    let float = |ty: &Type| ty.is_double() || ty.primitive() == Some(PrimitiveType::Float);
    if types.iter().any(float) {
        Some(NumericPrefix::Float)
    } else if types.iter().any(|ty| ty.is_long()) {
        Some(NumericPrefix::Long)
    } else {
        None
    }
}

/// Instruction made while lowering another one
fn synthetic<'g>(
    ir: &mut MethodIr<'g>,
    lowered: InsnId,
    kind: InsnKind<'g>,
    ty: Type<'g>,
) -> InsnId {
    let mut insn = Instruction::new(kind, ty, ir[lowered].original_ip);
    insn.line = ir[lowered].line;
    ir.create(insn)
}

impl<'a, 'g> InstructionVisitor<'g> for BytecodeProducer<'a, 'g> {
    fn visit_instruction(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        Err(AssertionFailed::new(format!("cannot emit {}", ir[id])).into())
    }

    fn visit_arithmetic(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (op, operand_type, left, right) = fields!(ir, id,
            InsnKind::Arithmetic { op, operand_type, left, right }
                => (*op, *operand_type, *left, *right)
        );
        let insn = NumericInsn {
            op: NumericOp::Arithmetic(op),
            operand: self.primitive(operand_type)?,
            prefix: numeric_prefix(&[operand_type, ir[right].ty]),
        };
        self.emit_numeric(ir, id, true, insn)?;
        self.pop_value(ir, right)?;
        self.pop_value(ir, left)?;
        self.push(ir[id].ty)
    }

    fn visit_negate(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let value = fields!(ir, id, InsnKind::Negate { value } => *value);
        let ty = ir[value].ty;
        let insn = NumericInsn {
            op: NumericOp::Negate,
            operand: self.primitive(ty)?,
            prefix: numeric_prefix(&[ty]),
        };
        self.emit_numeric(ir, id, true, insn)?;
        self.pop(ty)?;
        self.push(ir[id].ty)
    }

    fn visit_convert(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (value, from, to) = fields!(ir, id,
            InsnKind::Convert { value, from, to }
                => (*value, *from, *to)
        );
        let target = to
            .primitive()
            .ok_or_else(|| AssertionFailed::new(format!("conversion to {}", to)))?;
        let insn = NumericInsn {
            op: NumericOp::Convert(target),
            operand: self.primitive(from)?,
            prefix: numeric_prefix(&[from, to]),
        };
        self.emit_numeric(ir, id, true, insn)?;
        self.pop_value(ir, value)?;
        self.push(ir[id].ty)
    }

    fn visit_load_constant(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let constant = fields!(ir, id, InsnKind::LoadConstant(constant) => *constant);
        match constant {
            Constant::Int(value) => self.emit_integer(ir, id, value as i64, false),
            Constant::Long(value) => self.emit_integer(ir, id, value, true),
            Constant::Float(value) => {
                // Compared bitwise, -0.0 has no short form
                let small = [0.0f32, 1.0, 2.0]
                    .iter()
                    .position(|small| small.to_bits() == value.to_bits());
                match small {
                    Some(small) => self.emit_small_real(ir, id, small as i8, PrimitiveType::Float),
                    None => {
                        self.emit_constant(ir, id, ConstantOp::Float(value))?;
                        self.push(ir[id].ty)
                    }
                }
            }
            Constant::Double(value) => {
                let small = [0.0f64, 1.0]
                    .iter()
                    .position(|small| small.to_bits() == value.to_bits());
                match small {
                    Some(small) => self.emit_small_real(ir, id, small as i8, PrimitiveType::Double),
                    None => {
                        self.emit_constant(ir, id, ConstantOp::Double(value))?;
                        self.push(ir[id].ty)
                    }
                }
            }
            Constant::Null => {
                let null = self.ctx.core.null_object;
                let ty = ir[id].ty;
                self.emit_constant(ir, id, ConstantOp::Null)?;
                if ty != null && ty.is_reference() {
                    // null typed as a specific class for the verifier
                    self.push(null)?;
                    self.load_class(ir, id, ty, false)?;
                    self.emit_simple(ir, id, false, SimpleOp::CheckCast)?;
                    self.pop(self.ctx.core.class)?;
                    self.pop(null)?;
                }
                self.push(ty)
            }
        }
    }

    fn visit_load_constant_object(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let constant = fields!(ir, id, InsnKind::LoadConstantObject(constant) => constant.clone());
        let index = self.pools.object_index(&constant);
        self.emit(ir, id, true, |emitter, cx| emitter.emit_object(cx, index, index <= 15))?;
        self.push(ir[id].ty)
    }

    fn visit_load_synthetic(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        self.append(id, 0, true)?;
        self.push(ir[id].ty)
    }

    fn visit_load_local(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let local = fields!(ir, id, InsnKind::LoadLocal { local } => *local);
        self.emit_local(ir, id, local, LocalOp::Load)?;
        self.push(ir[id].ty)
    }

    fn visit_store_local(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (local, value) = fields!(ir, id,
            InsnKind::StoreLocal { local, value }
                => (*local, *value)
        );
        self.emit_local(ir, id, local, LocalOp::Store)?;
        self.pop_value(ir, value)
    }

    fn visit_inc_dec_local(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (local, increment) = fields!(ir, id,
            InsnKind::IncDecLocal { local, increment }
                => (*local, *increment)
        );
        let op = if increment {
            LocalOp::Increment
        } else {
            LocalOp::Decrement
        };
        self.emit_local(ir, id, local, op)
    }

    fn visit_load_field(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (field, receiver) = fields!(ir, id,
            InsnKind::LoadField { field, receiver }
                => (*field, *receiver)
        );
        let slot = field.slot as u32;
        if field.is_static() {
            if field.parent == self.method.parent {
                self.emit_field(ir, id, true, FieldOp::ClassGetStatic, slot)?;
            } else {
                self.load_class(ir, id, field.parent, true)?;
                self.emit_field(ir, id, false, FieldOp::GetStatic, slot)?;
                self.pop(self.ctx.core.class)?;
            }
            self.check_gc_point(ir, id)?;
        } else if let Some(receiver) = receiver {
            self.emit_field(ir, id, true, FieldOp::GetField, slot)?;
            self.pop_value(ir, receiver)?;
        } else {
            self.emit_field(ir, id, true, FieldOp::ThisGetField, slot)?;
        }
        self.push(ir[id].ty)
    }

    fn visit_store_field(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (field, receiver, value) = fields!(ir, id,
            InsnKind::StoreField { field, receiver, value }
                => (*field, *receiver, *value)
        );
        let slot = field.slot as u32;
        if field.is_static() {
            if field.parent == self.method.parent {
                self.emit_field(ir, id, true, FieldOp::ClassPutStatic, slot)?;
            } else {
                self.load_class(ir, id, field.parent, true)?;
                self.emit_field(ir, id, false, FieldOp::PutStatic, slot)?;
                self.pop(self.ctx.core.class)?;
            }
            self.pop_value(ir, value)?;
            self.check_gc_point(ir, id)
        } else if let Some(receiver) = receiver {
            self.emit_field(ir, id, true, FieldOp::PutField, slot)?;
            self.pop_value(ir, value)?;
            self.pop_value(ir, receiver)
        } else {
            self.emit_field(ir, id, true, FieldOp::ThisPutField, slot)?;
            self.pop_value(ir, value)
        }
    }

    fn visit_load_indexed(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (array, index) = fields!(ir, id,
            InsnKind::LoadIndexed { array, index }
                => (*array, *index)
        );
        self.emit_simple(ir, id, true, SimpleOp::ArrayLoad)?;
        self.pop_value(ir, index)?;
        self.pop_value(ir, array)?;
        self.push(ir[id].ty)
    }

    fn visit_store_indexed(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (array, index, value) = fields!(ir, id,
            InsnKind::StoreIndexed { array, index, value }
                => (*array, *index, *value)
        );
        self.emit_simple(ir, id, true, SimpleOp::ArrayStore)?;
        self.pop_value(ir, value)?;
        self.pop_value(ir, index)?;
        self.pop_value(ir, array)
    }

    fn visit_array_length(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let array = fields!(ir, id, InsnKind::ArrayLength { array } => *array);
        self.emit_simple(ir, id, true, SimpleOp::ArrayLength)?;
        self.pop_value(ir, array)?;
        self.push(ir[id].ty)
    }

    fn visit_new_array(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let size = fields!(ir, id, InsnKind::NewArray { size } => *size);
        self.load_class(ir, id, ir[id].ty, true)?;
        self.emit_simple(ir, id, false, SimpleOp::NewArray)?;
        self.pop(self.ctx.core.class)?;
        self.pop_value(ir, size)?;
        self.check_gc_point(ir, id)?;
        self.push(ir[id].ty)
    }

    fn visit_new_dimension(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (array, dimension) = fields!(ir, id,
            InsnKind::NewDimension { array, dimension }
                => (*array, *dimension)
        );
        self.emit_simple(ir, id, true, SimpleOp::NewDimension)?;
        self.pop_value(ir, dimension)?;
        self.pop_value(ir, array)?;
        self.check_gc_point(ir, id)?;
        self.push(ir[id].ty)
    }

    fn visit_new_object(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        // Class initialization, then a null placeholder the constructor replaces
        self.load_class(ir, id, ir[id].ty, true)?;
        self.emit_simple(ir, id, false, SimpleOp::New)?;
        self.pop(self.ctx.core.class)?;
        self.emit(ir, id, false, |emitter, cx| emitter.emit_constant(cx, ConstantOp::Null))?;
        self.check_gc_point(ir, id)?;
        self.push(ir[id].ty)
    }

    fn visit_invoke(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (callee, form, args) = fields!(ir, id,
            InsnKind::Invoke { method, form, args }
                => (*method, *form, args.clone())
        );
        let slot = callee.slot as u32;
        let with_class = form != InvokeForm::Virtual;
        if with_class {
            self.load_class(ir, id, callee.parent, true)?;
        }
        self.emit(ir, id, !with_class, |emitter, cx| emitter.emit_invoke(cx, form, slot))?;
        if with_class {
            self.pop(self.ctx.core.class)?;
        }
        for &arg in args.iter().rev() {
            self.pop_value(ir, arg)?;
        }
        self.check_gc_point(ir, id)?;
        self.push(ir[id].ty)
    }

    fn visit_check_cast(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let value = fields!(ir, id, InsnKind::CheckCast { value } => *value);
        self.load_class(ir, id, ir[id].ty, true)?;
        self.emit_simple(ir, id, false, SimpleOp::CheckCast)?;
        self.pop(self.ctx.core.class)?;
        self.pop_value(ir, value)?;
        self.check_gc_point(ir, id)?;
        self.push(ir[id].ty)
    }

    fn visit_instance_of(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (value, class) = fields!(ir, id,
            InsnKind::InstanceOf { value, class }
                => (*value, *class)
        );
        self.load_class(ir, id, class, true)?;
        self.emit_simple(ir, id, false, SimpleOp::InstanceOf)?;
        self.pop(self.ctx.core.class)?;
        self.pop_value(ir, value)?;
        self.check_gc_point(ir, id)?;
        self.push(ir[id].ty)
    }

    fn visit_monitor_enter(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        match fields!(ir, id, InsnKind::MonitorEnter { value } => *value) {
            Some(value) => {
                self.emit_simple(ir, id, true, SimpleOp::MonitorEnter)?;
                self.pop_value(ir, value)
            }
            None => self.emit_simple(ir, id, true, SimpleOp::ClassMonitorEnter),
        }
    }

    fn visit_monitor_exit(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        match fields!(ir, id, InsnKind::MonitorExit { value } => *value) {
            Some(value) => {
                self.emit_simple(ir, id, true, SimpleOp::MonitorExit)?;
                self.pop_value(ir, value)
            }
            None => self.emit_simple(ir, id, true, SimpleOp::ClassMonitorExit),
        }
    }

    fn visit_throw(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let value = fields!(ir, id, InsnKind::Throw { value } => *value);
        self.emit_simple(ir, id, true, SimpleOp::Throw)?;
        self.pop_value(ir, value)?;
        self.end_with_exit(ir)
    }

    fn visit_return(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let value = fields!(ir, id, InsnKind::Return { value } => *value);
        self.emit_simple(ir, id, true, SimpleOp::Return)?;
        if let Some(value) = value {
            self.pop_value(ir, value)?;
        }
        self.end_with_exit(ir)
    }

    fn visit_goto(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let target = fields!(ir, id, InsnKind::Goto { target } => *target);
        let destination = self.destination(ir, target)?;
        if ir.next(id) == Some(destination) {
            return Ok(());
        }
        self.branch(ir, id, BranchOp::Goto, destination)?;
        self.check_boundary()?;
        self.stack.clear();
        Ok(())
    }

    fn visit_if(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (condition, left, right, target) = fields!(ir, id,
            InsnKind::If { condition, left, right, target, .. }
                => (*condition, *left, *right, *target)
        );
        let destination = self.destination(ir, target)?;
        let op = BranchOp::If {
            condition,
            with_zero: right.is_none(),
        };
        self.branch(ir, id, op, destination)?;
        if let Some(right) = right {
            self.pop_value(ir, right)?;
        }
        self.pop_value(ir, left)?;
        self.check_boundary()
    }

    fn visit_table_switch(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (key, low, high, default, targets) = fields!(ir, id,
            InsnKind::TableSwitch { key, low, high, default, targets }
                => (*key, *low, *high, *default, targets.clone())
        );
        if self.first_pass {
            let delimiter = Delimiter {
                insn: id,
                encoding: self.emitter.table_switch_encoding(targets.len()),
                kind: DelimiterKind::Switch { padding: 0 },
            };
            self.end_block(ir, Some(delimiter));
        } else {
            let (encoding, padding) = self.current_delimiter()?;
            let base = self.ip + encoding.ip_adjust + padding;
            assert_that(base % 2 == 0, "misaligned table switch")?;
            let switch = TableSwitchOperands {
                low,
                high,
                default: self.switch_offset(ir, default, base, encoding)?,
                offsets: targets
                    .iter()
                    .map(|&target| self.switch_offset(ir, target, base, encoding))
                    .collect::<Result<_>>()?,
                padding,
            };
            self.note_line(ir[id].line);
            let cx = EmitContext {
                ip: self.ip,
                stack: &self.stack,
            };
            let size = self.emitter.emit_table_switch(&cx, &switch)?;
            assert_that(
                size == encoding.size + padding,
                "table switch size differs from its encoding",
            )?;
            self.ip += size;
        }
        self.pop_value(ir, key)?;
        self.check_boundary()?;
        self.stack.clear();
        Ok(())
    }

    /// Lowered to a table switch over the index of the key among the sorted case values
    fn visit_lookup_switch(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (key, default, cases) = fields!(ir, id,
            InsnKind::LookupSwitch { key, default, cases }
                => (*key, *default, cases.clone())
        );
        assert_that(self.first_pass, "lookup switch left after lowering")?;
        assert_that(!cases.is_empty(), "lookup switch without cases")?;

        let core = &self.ctx.core;
        let keys = cases.iter().map(|&(value, _)| value).collect();
        let matches = synthetic(
            ir,
            id,
            InsnKind::LoadConstantObject(ObjectConstant::IntArray(keys)),
            self.ctx.array_of(core.int),
        );
        let lookup = synthetic(ir, id, InsnKind::Lookup { key, matches }, core.int);
        let switch = InsnKind::TableSwitch {
            key: lookup,
            low: 0,
            high: cases.len() as i32 - 1,
            default,
            targets: cases.iter().map(|&(_, target)| target).collect(),
        };
        let switch = synthetic(ir, id, switch, core.void);
        for insn in [matches, lookup, switch] {
            dispatch(self, ir, insn)?;
        }
        Ok(())
    }

    fn visit_pop(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let value = fields!(ir, id, InsnKind::Pop { value } => *value);
        self.emit_simple(ir, id, true, SimpleOp::Pop)?;
        if ir[value].ty.is_two_words() {
            self.emit_simple(ir, id, false, SimpleOp::Pop)?;
        }
        self.pop_value(ir, value)
    }

    fn visit_lookup(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (key, matches) = fields!(ir, id, InsnKind::Lookup { key, matches } => (*key, *matches));
        self.emit_simple(ir, id, true, SimpleOp::Lookup)?;
        self.pop_value(ir, matches)?;
        self.pop_value(ir, key)?;
        self.push(ir[id].ty)
    }

    fn visit_phi(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        if self.first_pass && !self.pending.is_empty() {
            self.end_block(ir, None);
        }
        self.check_boundary()?;
        self.stack.clear();
        self.append(id, 0, true)
    }

    fn visit_load_exception(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        if self.first_pass && !self.pending.is_empty() {
            self.end_block(ir, None);
        }
        self.check_boundary()?;
        self.stack.clear();
        self.append(id, 0, true)?;
        self.push(ir[id].ty)
    }

    fn visit_handler_enter(&mut self, _ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        self.append(id, 0, true)
    }

    fn visit_handler_exit(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        self.append(id, 0, true)?;
        if ir.next(id).is_none() {
            self.end_block(ir, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{opcodes, BinaryReader, ConstantPool, MemoryClassPath, MethodAccessFlags};
    use crate::errors::TranslationError;
    use crate::ir::{ArithmeticOp, Condition};
    use crate::model::{BytecodeHolder, ContextArenas};
    use crate::settings::Settings;
    use crate::suite::{Emitted, RecordedMethod, RecordingEmitter, BRANCH_ENCODINGS};
    use crate::translate::{graph_builder, liveness, reallocator, transformer};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn with_context<F: for<'g> FnOnce(&TranslationContext<'g>)>(f: F) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        let mut reader = BinaryReader::new(&[0, 1], "Object.class");
        let pool = ConstantPool::read(&ctx, &mut reader).unwrap();
        *ctx.core.object.constant_pool.borrow_mut() = Some(Rc::new(pool));
        f(&ctx)
    }

    fn static_method<'g>(ctx: &TranslationContext<'g>, descriptor: &str) -> &'g MethodData<'g> {
        let (parameters, return_type) = ctx.method_signature(descriptor).unwrap();
        ctx.add_method(MethodData {
            parent: ctx.core.object,
            name: String::from("m"),
            descriptor: String::from(descriptor),
            access_flags: MethodAccessFlags::STATIC,
            parameters,
            return_type,
            exceptions: vec![],
            slot: 0,
            holder: RefCell::new(None),
        })
    }

    fn translate<'g>(
        ctx: &TranslationContext<'g>,
        method: &'g MethodData<'g>,
        code: Vec<u8>,
        max_locals: u16,
        stack_map: Option<Vec<u8>>,
    ) -> (RecordedMethod<'g>, ClassPools<'g>) {
        let holder = BytecodeHolder {
            code,
            max_stack: 2,
            max_locals,
            handlers: vec![],
            stack_map,
            line_numbers: None,
            local_variables: None,
            liveness: None,
        };
        let max_locals = max_locals as usize;
        let mut ir = graph_builder::build(ctx, method, &holder, None).unwrap();
        let cfg = liveness::analyse(ctx, method, &mut ir, max_locals, None).unwrap();
        reallocator::reallocate(ctx, method, &mut ir, &cfg, max_locals, None).unwrap();
        let locals = transformer::transform(ctx, method, &mut ir).unwrap();

        let mut pools = ClassPools::new();
        let mut emitter = RecordingEmitter::new();
        emitter.begin_class(method.parent);
        let length = produce(ctx, method, &mut ir, &locals, &mut pools, &mut emitter).unwrap();
        let recorded = emitter.last_method().unwrap().clone();
        assert_eq!(recorded.length, length);
        assert_eq!(recorded.bytes.len(), length as usize);
        (recorded, pools)
    }

    fn emitted(method: &RecordedMethod) -> Vec<Emitted> {
        method.code.iter().map(|insn| insn.emitted.clone()).collect()
    }

    #[test]
    fn straight_line_uses_immediate_forms() {
        with_context(|ctx| {
            let method = static_method(ctx, "(II)I");
            let code = vec![opcodes::ILOAD_0, opcodes::ILOAD_1, opcodes::IADD, opcodes::IRETURN];
            let (recorded, _) = translate(ctx, method, code, 2, None);

            let load = |index| Emitted::Local {
                op: LocalOp::Load,
                index,
                immediate: true,
            };
            let add = Emitted::Numeric(NumericInsn {
                op: NumericOp::Arithmetic(ArithmeticOp::Add),
                operand: PrimitiveType::Int,
                prefix: None,
            });
            assert_eq!(
                emitted(&recorded),
                vec![load(0), load(1), add, Emitted::Simple(SimpleOp::Return)]
            );
            assert_eq!(recorded.length, 4);
            assert_eq!(recorded.max_stack, 2);
            assert_eq!(recorded.locals, vec![ctx.core.int, ctx.core.int]);
            assert_eq!(recorded.code[2].stack, vec![ctx.core.int, ctx.core.int]);
            assert!(recorded.code[3].stack.len() == 1);
        })
    }

    #[test]
    fn small_constants_are_widened() {
        with_context(|ctx| {
            let long = static_method(ctx, "()J");
            let code = vec![opcodes::LCONST_1, opcodes::LRETURN];
            let (recorded, _) = translate(ctx, long, code, 0, None);
            let to_long = NumericInsn {
                op: NumericOp::Convert(PrimitiveType::Long),
                operand: PrimitiveType::Int,
                prefix: Some(NumericPrefix::Long),
            };
            assert_eq!(
                emitted(&recorded),
                vec![
                    Emitted::Constant(ConstantOp::Immediate(1)),
                    Emitted::Numeric(to_long),
                    Emitted::Simple(SimpleOp::Return),
                ]
            );
            assert_eq!(recorded.max_stack, 2);

            let float = static_method(ctx, "()F");
            let code = vec![opcodes::FCONST_2, opcodes::FRETURN];
            let (recorded, _) = translate(ctx, float, code, 0, None);
            let to_float = NumericInsn {
                op: NumericOp::Convert(PrimitiveType::Float),
                operand: PrimitiveType::Int,
                prefix: Some(NumericPrefix::Float),
            };
            assert_eq!(emitted(&recorded)[0], Emitted::Constant(ConstantOp::Immediate(2)));
            assert_eq!(emitted(&recorded)[1], Emitted::Numeric(to_float));
        })
    }

    #[test]
    fn far_forward_branch_is_widened() {
        with_context(|ctx| {
            let method = static_method(ctx, "(I)I");
            let mut code = vec![opcodes::ILOAD_0, opcodes::IFLE, 0x01, 0x2F];
            for _ in 0..100 {
                code.extend_from_slice(&[opcodes::IINC, 0, 1]);
            }
            code.extend_from_slice(&[opcodes::ILOAD_0, opcodes::IRETURN]);
            let stack_map = vec![0, 1, 0x01, 0x30, 0, 1, 1, 0, 0];
            let (recorded, _) = translate(ctx, method, code, 1, Some(stack_map));

            let branch = &recorded.code[1];
            match branch.emitted {
                Emitted::Branch {
                    op,
                    offset,
                    encoding,
                } => {
                    assert_eq!(
                        op,
                        BranchOp::If {
                            condition: Condition::Le,
                            with_zero: true
                        }
                    );
                    assert_eq!(encoding, BRANCH_ENCODINGS[1]);
                    let destination = branch.offset_base() as i64 + offset as i64;
                    let load = &recorded.code[recorded.code.len() - 2];
                    assert_eq!(destination, load.ip as i64);
                }
                ref other => panic!("expected a branch, got {:?}", other),
            }
            assert_eq!(recorded.length, 206);
            assert!(ctx.statistics.relaxation_passes.get() >= 2);
        })
    }

    #[test]
    fn lookup_switch_is_lowered_to_a_table_switch() {
        with_context(|ctx| {
            let method = static_method(ctx, "(I)I");
            let mut code = vec![opcodes::ILOAD_0, opcodes::LOOKUPSWITCH, 0, 0];
            code.extend_from_slice(&[0, 0, 0, 31, 0, 0, 0, 2]);
            code.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 27]);
            code.extend_from_slice(&[0, 0, 0, 5, 0, 0, 0, 29]);
            code.extend_from_slice(&[
                opcodes::ICONST_1,
                opcodes::IRETURN,
                opcodes::ICONST_2,
                opcodes::IRETURN,
                opcodes::ICONST_0,
                opcodes::IRETURN,
            ]);
            let mut stack_map = vec![0, 3];
            for address in [28, 30, 32] {
                stack_map.extend_from_slice(&[0, address, 0, 1, 1, 0, 0]);
            }
            let (recorded, pools) = translate(ctx, method, code, 1, Some(stack_map));

            let code = emitted(&recorded);
            assert_eq!(
                code[1],
                Emitted::Object {
                    index: 0,
                    immediate: true
                }
            );
            assert_eq!(code[2], Emitted::Simple(SimpleOp::Lookup));
            let switch = match &code[3] {
                Emitted::TableSwitch(switch) => switch.clone(),
                other => panic!("expected a table switch, got {:?}", other),
            };
            assert_eq!((switch.low, switch.high), (0, 1));
            assert_eq!(pools.objects(), &[ObjectConstant::IntArray(vec![1, 5])]);

            let base = recorded.code[3].offset_base() as i64;
            let at = |offset: i32| {
                let ip = (base + offset as i64) as u32;
                recorded.code.iter().find(|insn| insn.ip == ip).map(|insn| insn.emitted.clone())
            };
            assert_eq!(at(switch.offsets[0]), Some(Emitted::Constant(ConstantOp::Immediate(1))));
            assert_eq!(at(switch.offsets[1]), Some(Emitted::Constant(ConstantOp::Immediate(2))));
            assert_eq!(at(switch.default), Some(Emitted::Constant(ConstantOp::Immediate(0))));
            assert_eq!(base % 2, 0);
        })
    }

    #[test]
    fn value_left_on_the_stack_at_return_is_rejected() {
        with_context(|ctx| {
            let method = static_method(ctx, "()I");
            let mut ir = MethodIr::new();
            let int = ctx.core.int;
            let constant = |value| InsnKind::LoadConstant(Constant::Int(value));
            let first = ir.create(Instruction::new(constant(1), int, 0));
            let second = ir.create(Instruction::new(constant(2), int, 1));
            let ret = ir.create(Instruction::new(
                InsnKind::Return {
                    value: Some(second),
                },
                ctx.core.void,
                2,
            ));
            for id in [first, second, ret] {
                ir.append(id);
            }

            let mut pools = ClassPools::new();
            let mut emitter = RecordingEmitter::new();
            emitter.begin_class(method.parent);
            let err = produce(ctx, method, &mut ir, &[], &mut pools, &mut emitter).unwrap_err();
            assert!(matches!(err, TranslationError::Assertion(_)));
        })
    }
}
