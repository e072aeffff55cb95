use super::bytecode_stream::{address_list, Bytecode, BytecodeStream};
use super::frame::{Frame, FrameFlags};
use super::statistics::Statistics;
use crate::classfile::{opcodes, LivenessAttribute, StackMap, StackMapEntry};
use crate::errors::{
    assert_that, verify, verify_translatable, verify_with, AssertionFailed, ErrorContext,
    LinkageError, LinkageErrorKind, Result, VerifyErrorKind,
};
use crate::ir::{
    ArithmeticOp, Condition, Constant, HandlerEntry, HandlerId, InsnFlags, InsnId, InsnKind,
    Instruction, InvokeForm, LocalSlot, MethodIr, ObjectConstant, Target, TargetId,
};
use crate::model::{
    BytecodeHolder, ConstantValue, FieldData, MethodData, ProxyTable, TranslationContext, Type,
};

/// Address of the catch-all handler wrapped around synchronized methods
///
/// It lies past any real bytecode address, so nothing in the classfile refers to it.
pub const SYNTHETIC_ADDRESS: u32 = u32::MAX;

/// Decode the bytecode of a method into IR
///
/// The bytecode is verified as it is decoded, against the types recorded in the stack map at
/// every branch target and exception handler.
pub fn build<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    holder: &BytecodeHolder,
    liveness: Option<&LivenessAttribute>,
) -> Result<MethodIr<'g>> {
    log::debug!("building IR for {}", method);
    let mut builder = GraphBuilder::new(ctx, method, holder, liveness)?;
    let result = builder.read_instructions();
    match result {
        Ok(()) => Ok(builder.ir),
        Err(err) => {
            let ip = builder.stream.last_ip();
            let line = builder.source_line(ip);
            Err(err).context(|| {
                if line > 0 {
                    format!("{} at ip {} (line {})", method, ip, line)
                } else {
                    format!("{} at ip {}", method, ip)
                }
            })
        }
    }
}

struct GraphBuilder<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    method: &'g MethodData<'g>,
    holder: &'a BytecodeHolder,
    ir: MethodIr<'g>,
    frame: Frame<'a, 'g>,
    stream: BytecodeStream<'a, 'g>,
    proxies: ProxyTable<'g>,

    /// Protected ranges entered but not yet exited, innermost last
    active_handlers: Vec<HandlerId>,

    /// Can control reach the next address from the previous instruction?
    flow: bool,
}

impl<'a, 'g> GraphBuilder<'a, 'g> {
    fn new(
        ctx: &'a TranslationContext<'g>,
        method: &'g MethodData<'g>,
        holder: &'a BytecodeHolder,
        liveness: Option<&LivenessAttribute>,
    ) -> Result<GraphBuilder<'a, 'g>> {
        let mut ir = MethodIr::new();
        let mut proxies = ProxyTable::new();
        let file_name = method.parent.source_file().unwrap_or_else(|| method.parent.name.clone());

        let stack_map = match &holder.stack_map {
            Some(bytes) => {
                let pool = method
                    .parent
                    .constant_pool()
                    .ok_or_else(|| AssertionFailed::new("stack map without a constant pool"))?;
                StackMap::read(ctx, bytes, &file_name, &pool, &mut proxies, liveness)?
            }
            None => StackMap::empty(),
        };
        for entry in stack_map.into_entries() {
            ir.add_target(Target::new(entry));
        }
        add_handlers(ctx, method, holder, &mut ir)?;

        let max_locals = holder.max_locals as usize;
        let addresses = address_list(&ir);
        let stream = BytecodeStream::new(ctx, method, &holder.code, max_locals, addresses);
        let frame = Frame::new(
            ctx,
            method,
            &mut ir,
            Some(holder.max_stack as usize),
            max_locals,
            FrameFlags::ALLOCATE_STACK | FrameFlags::REUSABLE_LOCALS,
            holder.local_variables.as_ref(),
        )?;

        Ok(GraphBuilder {
            ctx,
            method,
            holder,
            ir,
            frame,
            stream,
            proxies,
            active_handlers: vec![],
            flow: true,
        })
    }

    fn source_line(&self, ip: u32) -> i32 {
        self.holder
            .line_numbers
            .as_ref()
            .and_then(|table| table.line_for(ip as u16))
            .map_or(-(ip as i32), i32::from)
    }

    fn read_instructions(&mut self) -> Result<()> {
        self.check_final_override()?;
        let synchronized = if self.method.is_synchronized() {
            Some(self.synchronized_prologue()?)
        } else {
            None
        };

        while let Some(bytecode) = self.stream.next()? {
            self.frame.log_state(&self.ir);
            let fell_through = self.flow;
            self.flow = true;
            match bytecode {
                Bytecode::Opcode(opcode) => {
                    log::trace!("{}: {}", self.stream.last_ip(), opcodes::mnemonic(opcode));
                    verify(fell_through, VerifyErrorKind::SeqBadType)?;
                    self.verify_active_handler_maps()?;
                    self.op(opcode)?;
                }
                Bytecode::BranchTarget(target) => self.op_branch_target(target, fell_through)?,
                Bytecode::ExceptionTarget(target) => {
                    self.op_exception_target(target, fell_through)?
                }
                Bytecode::HandlerStart(handler) => self.op_handler_start(handler, fell_through),
                Bytecode::HandlerEnd(handler) => self.op_handler_end(handler, fell_through)?,
            }
        }
        verify(!self.flow, VerifyErrorKind::FallThrough)?;

        if let Some(handler) = synchronized {
            self.synchronized_epilogue(handler)?;
        }
        verify_with(
            self.active_handlers.is_empty(),
            VerifyErrorKind::BadStackMap,
            || String::from("protected range left open"),
        )?;

        self.frame.finish(&mut self.ir)?;
        let handlers: Vec<(HandlerId, TargetId)> = self
            .ir
            .handlers
            .iter()
            .map(|(id, handler)| (id, handler.target))
            .collect();
        for (id, target) in handlers {
            let entry = self.ir[target].insn;
            assert_that(entry.is_some(), "exception handler never reached")?;
            if let Some(handler) = self.ir.handlers.get_mut(id) {
                handler.entry = entry;
            }
        }
        self.ir.max_stack = self.frame.computed_max_stack();
        Ok(())
    }

    /// A method may not override a final method of a superclass
    fn check_final_override(&self) -> Result<()> {
        let method = self.method;
        if method.is_static() || method.is_init() || method.is_private() {
            return Ok(());
        }
        let superclass = match method.parent.superclass() {
            Some(superclass) => superclass,
            None => return Ok(()),
        };
        if let Some(overridden) =
            self.ctx
                .lookup_method(superclass, &method.name, &method.descriptor)?
        {
            verify_with(
                !overridden.is_final() || overridden.is_private() || overridden.is_static(),
                VerifyErrorKind::FinalMethodOverride,
                || overridden.to_string(),
            )?;
        }
        Ok(())
    }

    /// Enter the method's monitor and open a catch-all range releasing it on the way out
    fn synchronized_prologue(&mut self) -> Result<HandlerId> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let locals = if self.method.is_static() {
            vec![]
        } else {
            vec![self.method.parent]
        };
        let mut target = Target::new(StackMapEntry {
            address: u16::MAX,
            physical_locals: locals.clone(),
            locals,
            stack: vec![core.throwable],
        });
        target.address = SYNTHETIC_ADDRESS;
        target.exception_type = Some(core.throwable);
        let target = self.ir.add_target(target);

        self.method_monitor_enter()?;
        let handler = self.ir.handlers.add(HandlerEntry {
            start: None,
            end: None,
            entry: None,
            target,
            catch_type: core.throwable,
            start_pc: 0,
            end_pc: self.holder.code.len() as u32,
            handler_pc: SYNTHETIC_ADDRESS,
        });
        self.op_handler_start(handler, true);
        Ok(handler)
    }

    /// Handler that releases the monitor and rethrows
    fn synchronized_epilogue(&mut self, handler: HandlerId) -> Result<()> {
        self.op_handler_end(handler, false)?;
        let target = self
            .ir
            .handlers
            .get(handler)
            .map(|handler| handler.target)
            .ok_or_else(|| AssertionFailed::new("missing synchronized handler"))?;
        self.frame.adjust_max_stack(1);
        self.op_exception_target(target, false)?;
        self.method_monitor_exit()?;
        self.op_athrow()?;
        self.frame.adjust_max_stack(-1);
        Ok(())
    }

    fn method_monitor_enter(&mut self) -> Result<()> {
        if self.method.is_static() {
            return self.op_monitor_enter(true);
        }
        self.frame.adjust_max_stack(1);
        self.op_load(self.ctx.core.null_object, 0)?;
        self.frame.adjust_max_stack(-1);
        self.op_monitor_enter(false)
    }

    fn method_monitor_exit(&mut self) -> Result<()> {
        if self.method.is_static() {
            return self.op_monitor_exit(true);
        }
        self.frame.adjust_max_stack(1);
        self.op_load(self.ctx.core.null_object, 0)?;
        self.frame.adjust_max_stack(-1);
        self.op_monitor_exit(false)
    }

    /// Locals at every instruction of a protected range must match the handler's entry
    fn verify_active_handler_maps(&mut self) -> Result<()> {
        for handler in self.active_handlers.clone() {
            let target = match self.ir.handlers.get(handler) {
                Some(handler) => handler.target,
                None => continue,
            };
            let locals = self.ir[target].entry.physical_locals.clone();
            self.frame.match_stack_map_locals(
                &mut self.ir,
                &locals,
                false,
                VerifyErrorKind::TargetBadType,
            )?;
            self.frame.merge_with_target(&mut self.ir, target)?;
        }
        Ok(())
    }

    fn append(&mut self, kind: InsnKind<'g>, ty: Type<'g>) -> InsnId {
        let ip = self.stream.last_ip();
        let spill = kind.constrains_stack() && self.frame.stack_size() > 0;
        let local = kind.local();
        let mut insn = Instruction::new(kind, ty, ip);
        insn.line = self.source_line(ip);
        let id = self.ir.create(insn);
        if spill {
            self.frame.spill_stack(&mut self.ir, false);
        }
        self.ir.append(id);
        if let Some(local) = local {
            self.ir.set_insn_local(id, local);
        }
        Statistics::bump(&self.ctx.statistics.instructions, 1);
        id
    }

    fn append_push(&mut self, kind: InsnKind<'g>, ty: Type<'g>) -> Result<InsnId> {
        let id = self.append(kind, ty);
        self.frame.push(&mut self.ir, id, true)?;
        Ok(id)
    }

    /// Pop a value, narrowing the type of the local it was loaded from
    fn pop(&mut self, expected: Type<'g>) -> Result<InsnId> {
        self.pop_narrowing(expected, false)
    }

    fn pop_narrowing(&mut self, expected: Type<'g>, interface_narrows: bool) -> Result<InsnId> {
        let insn = self.frame.pop(&mut self.ir, expected)?;
        self.frame
            .narrow_local_type(&mut self.ir, insn, expected, interface_narrows)?;
        Ok(insn)
    }

    /// Give a `null` constant the type it is used as
    fn cast_null(&mut self, insn: InsnId, ty: Type<'g>) {
        if let InsnKind::LoadConstant(Constant::Null) = self.ir[insn].kind {
            self.ir[insn].ty = ty;
        }
    }

    /// Every value left on the stack must live in its temporary (the block ends for good)
    fn force_stack_spilling(&mut self) {
        for insn in self.frame.stack_values() {
            self.ir[insn].flags.insert(InsnFlags::SPILLS);
            if let Some(temp) = self.ir[insn].temporary {
                if let Some(temp) = self.ir[temp].temporary.as_mut() {
                    temp.merged = true;
                }
            }
        }
    }

    /// Load of the receiver of an instance method that was never merged with another value
    fn is_load_receiver(&self, insn: InsnId) -> bool {
        if self.method.is_static() || !self.ctx.settings.optimize_this_field_access {
            return false;
        }
        match self.ir[insn].kind {
            InsnKind::LoadLocal { local } => {
                self.ir[local].parameter == Some(0) && !self.ir.was_merged(insn)
            }
            _ => false,
        }
    }

    fn op(&mut self, opcode: u8) -> Result<()> {
        use opcodes::*;
        let ctx = self.ctx;
        let core = &ctx.core;
        match opcode {
            NOP => Ok(()),
            ACONST_NULL => self
                .append_push(InsnKind::LoadConstant(Constant::Null), core.null_object)
                .map(drop),
            ICONST_M1..=ICONST_5 => self.op_constant(Constant::Int(opcode as i32 - ICONST_0 as i32)),
            LCONST_0 | LCONST_1 => self.op_constant(Constant::Long((opcode - LCONST_0) as i64)),
            FCONST_0..=FCONST_2 => self.op_constant(Constant::Float((opcode - FCONST_0) as f32)),
            DCONST_0 | DCONST_1 => self.op_constant(Constant::Double((opcode - DCONST_0) as f64)),
            BIPUSH => {
                let value = self.stream.read_i1()?;
                self.op_constant(Constant::Int(value as i32))
            }
            SIPUSH => {
                let value = self.stream.read_i2()?;
                self.op_constant(Constant::Int(value as i32))
            }
            LDC => self.op_ldc(false, false),
            LDC_W => self.op_ldc(true, false),
            LDC2_W => self.op_ldc(true, true),

            ILOAD..=ALOAD => {
                let ty = self.local_kind_type(opcode - ILOAD);
                let slot = self.stream.read_slot1(width(ty))?;
                self.op_load(ty, slot)
            }
            ILOAD_0..=ALOAD_3 => {
                let ty = self.local_kind_type((opcode - ILOAD_0) / 4);
                self.op_load(ty, ((opcode - ILOAD_0) % 4) as usize)
            }
            ISTORE..=ASTORE => {
                let ty = self.local_kind_type(opcode - ISTORE);
                let slot = self.stream.read_slot1(width(ty))?;
                self.op_store(ty, slot)
            }
            ISTORE_0..=ASTORE_3 => {
                let ty = self.local_kind_type((opcode - ISTORE_0) / 4);
                self.op_store(ty, ((opcode - ISTORE_0) % 4) as usize)
            }
            IINC => {
                let slot = self.stream.read_slot1(1)?;
                let delta = self.stream.read_i1()?;
                self.op_iinc(slot, delta as i32)
            }
            WIDE => self.op_wide(),

            IALOAD => self.op_array_load(core.int),
            LALOAD => self.op_array_load(core.long),
            FALOAD => self.op_array_load(core.float),
            DALOAD => self.op_array_load(core.double),
            AALOAD => self.op_array_load(core.null_object),
            BALOAD => self.op_array_load(core.byte_or_boolean),
            CALOAD => self.op_array_load(core.char),
            SALOAD => self.op_array_load(core.short),
            IASTORE => self.op_array_store(core.int),
            LASTORE => self.op_array_store(core.long),
            FASTORE => self.op_array_store(core.float),
            DASTORE => self.op_array_store(core.double),
            AASTORE => self.op_array_store(core.null_object),
            BASTORE => self.op_array_store(core.byte_or_boolean),
            CASTORE => self.op_array_store(core.char),
            SASTORE => self.op_array_store(core.short),

            POP => {
                let value = self.pop(core.universe)?;
                verify(!self.ir[value].ty.is_two_words(), VerifyErrorKind::StackExpectCat1)?;
                self.append(InsnKind::Pop { value }, core.void);
                Ok(())
            }
            POP2 => self.op_pop2(),
            DUP..=SWAP => self.op_dup_swap(opcode),

            IADD..=DREM => {
                let op = [
                    ArithmeticOp::Add,
                    ArithmeticOp::Sub,
                    ArithmeticOp::Mul,
                    ArithmeticOp::Div,
                    ArithmeticOp::Rem,
                ][((opcode - IADD) / 4) as usize];
                let ty = self.numeric_type((opcode - IADD) % 4);
                self.op_arithmetic(op, ty)
            }
            INEG..=DNEG => {
                let ty = self.numeric_type(opcode - INEG);
                let value = self.pop(ty)?;
                self.append_push(InsnKind::Negate { value }, ty).map(drop)
            }
            ISHL..=LUSHR => {
                let op = [ArithmeticOp::Shl, ArithmeticOp::Shr, ArithmeticOp::Ushr]
                    [((opcode - ISHL) / 2) as usize];
                let ty = self.numeric_type((opcode - ISHL) % 2);
                self.op_arithmetic(op, ty)
            }
            IAND..=LXOR => {
                let op = [ArithmeticOp::And, ArithmeticOp::Or, ArithmeticOp::Xor]
                    [((opcode - IAND) / 2) as usize];
                let ty = self.numeric_type((opcode - IAND) % 2);
                self.op_arithmetic(op, ty)
            }

            I2L => self.op_convert(core.int, core.long),
            I2F => self.op_convert(core.int, core.float),
            I2D => self.op_convert(core.int, core.double),
            L2I => self.op_convert(core.long, core.int),
            L2F => self.op_convert(core.long, core.float),
            L2D => self.op_convert(core.long, core.double),
            F2I => self.op_convert(core.float, core.int),
            F2L => self.op_convert(core.float, core.long),
            F2D => self.op_convert(core.float, core.double),
            D2I => self.op_convert(core.double, core.int),
            D2L => self.op_convert(core.double, core.long),
            D2F => self.op_convert(core.double, core.float),
            I2B => self.op_convert(core.int, core.byte),
            I2C => self.op_convert(core.int, core.char),
            I2S => self.op_convert(core.int, core.short),

            LCMP => self.op_compare(ArithmeticOp::Cmp, core.long),
            FCMPL => self.op_compare(ArithmeticOp::CmpL, core.float),
            FCMPG => self.op_compare(ArithmeticOp::CmpG, core.float),
            DCMPL => self.op_compare(ArithmeticOp::CmpL, core.double),
            DCMPG => self.op_compare(ArithmeticOp::CmpG, core.double),

            IFEQ..=IFLE => self.op_if(condition(opcode - IFEQ), core.int, false),
            IF_ICMPEQ..=IF_ICMPLE => self.op_if(condition(opcode - IF_ICMPEQ), core.int, true),
            IF_ACMPEQ | IF_ACMPNE => {
                self.op_if(condition(opcode - IF_ACMPEQ), core.null_object, true)
            }
            IFNULL | IFNONNULL => self.op_if(condition(opcode - IFNULL), core.null_object, false),
            GOTO => {
                let target = self.stream.read_target2(&self.ir)?;
                self.op_goto(target)
            }
            GOTO_W => {
                let target = self.stream.read_target4(&self.ir)?;
                self.op_goto(target)
            }
            TABLESWITCH => self.op_tableswitch(),
            LOOKUPSWITCH => self.op_lookupswitch(),

            IRETURN => self.op_return(core.int),
            LRETURN => self.op_return(core.long),
            FRETURN => self.op_return(core.float),
            DRETURN => self.op_return(core.double),
            ARETURN => {
                verify(
                    self.method.return_type.is_reference(),
                    VerifyErrorKind::RetValBadType,
                )?;
                self.op_return(self.method.return_type)
            }
            RETURN => self.op_return_void(),

            GETSTATIC => self.op_getstatic(),
            PUTSTATIC => self.op_putstatic(),
            GETFIELD => self.op_getfield(),
            PUTFIELD => self.op_putfield(),
            INVOKEVIRTUAL => self.op_invoke_resolved(InvokeForm::Virtual),
            INVOKESTATIC => self.op_invoke_resolved(InvokeForm::Static),
            INVOKEINTERFACE => self.op_invoke_resolved(InvokeForm::Interface),
            INVOKESPECIAL => self.op_invokespecial(),

            NEW => self.op_new(),
            NEWARRAY => {
                let ty = self.stream.read_new_array_type()?;
                self.op_new_array(ty)
            }
            ANEWARRAY => {
                let element = self.stream.read_type()?;
                self.op_new_array(self.ctx.array_of(element))
            }
            MULTIANEWARRAY => self.op_multianewarray(),
            ARRAYLENGTH => self.op_arraylength(),
            ATHROW => self.op_athrow(),
            CHECKCAST => {
                let ty = self.stream.read_type()?;
                let value = self.pop(core.null_object)?;
                self.append_push(InsnKind::CheckCast { value }, ty).map(drop)
            }
            INSTANCEOF => {
                let class = self.stream.read_type()?;
                let value = self.pop(core.null_object)?;
                self.append_push(InsnKind::InstanceOf { value, class }, core.int)
                    .map(drop)
            }
            MONITORENTER => self.op_monitor_enter(false),
            MONITOREXIT => self.op_monitor_exit(false),

            _ => Err(LinkageError::verify(
                VerifyErrorKind::BadInstr,
                opcodes::mnemonic(opcode),
            )
            .into()),
        }
    }

    /// `int`, `long`, `float`, `double` and reference, in opcode order
    fn local_kind_type(&self, index: u8) -> Type<'g> {
        let ctx = self.ctx;
        let core = &ctx.core;
        match index {
            0 => core.int,
            1 => core.long,
            2 => core.float,
            3 => core.double,
            _ => core.null_object,
        }
    }

    fn numeric_type(&self, index: u8) -> Type<'g> {
        self.local_kind_type(index.min(3))
    }

    fn op_constant(&mut self, constant: Constant) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let ty = match constant {
            Constant::Int(_) => core.int,
            Constant::Long(_) => core.long,
            Constant::Float(_) => core.float,
            Constant::Double(_) => core.double,
            Constant::Null => core.null_object,
        };
        self.append_push(InsnKind::LoadConstant(constant), ty).map(drop)
    }

    /// Constant load, typed as `ty` when given (for inlined constant fields)
    fn op_constant_value(&mut self, value: ConstantValue, ty: Option<Type<'g>>) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let (kind, default_type) = match value {
            ConstantValue::Int(value) => (InsnKind::LoadConstant(Constant::Int(value)), core.int),
            ConstantValue::Long(value) => {
                (InsnKind::LoadConstant(Constant::Long(value)), core.long)
            }
            ConstantValue::Float(value) => {
                (InsnKind::LoadConstant(Constant::Float(value)), core.float)
            }
            ConstantValue::Double(value) => {
                (InsnKind::LoadConstant(Constant::Double(value)), core.double)
            }
            ConstantValue::String(value) => (
                InsnKind::LoadConstantObject(ObjectConstant::String(value)),
                core.string,
            ),
        };
        self.append_push(kind, ty.unwrap_or(default_type)).map(drop)
    }

    fn op_ldc(&mut self, wide: bool, two_words: bool) -> Result<()> {
        let value = self.stream.read_ldc(wide, two_words)?;
        self.op_constant_value(value, None)
    }

    fn op_load(&mut self, ty: Type<'g>, slot: usize) -> Result<()> {
        let local = self.frame.get_local(&self.ir, ty, slot)?;
        let local_type = self.ir[local].ty;
        self.append_push(InsnKind::LoadLocal { local }, local_type)
            .map(drop)
    }

    fn op_store(&mut self, ty: Type<'g>, slot: usize) -> Result<()> {
        let value = self.pop(ty)?;
        let value_type = self.ctx.local_type(self.ir[value].ty);
        if slot == 0 && !self.method.is_static() {
            verify_translatable(!self.method.is_init(), "store to slot 0 of a constructor")?;
            self.ir.receiver_overwritten = true;
        }
        let initializer = self.frame.local(slot) == LocalSlot::Empty;
        let local = self.frame.allocate_local(
            &mut self.ir,
            value_type,
            slot as u16,
            Some(self.stream.current_ip()),
            None,
        );
        self.frame.set_local(&mut self.ir, local, slot)?;
        let store = self.append(InsnKind::StoreLocal { local, value }, self.ctx.core.void);
        if initializer {
            self.ir[store].flags.insert(InsnFlags::INITIALIZER);
        }
        Ok(())
    }

    fn op_iinc(&mut self, slot: usize, delta: i32) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        if delta == 1 || delta == -1 {
            let local = self.frame.get_local(&self.ir, core.int, slot)?;
            self.append(
                InsnKind::IncDecLocal {
                    local,
                    increment: delta == 1,
                },
                core.void,
            );
            return Ok(());
        }
        self.frame.adjust_max_stack(2);
        self.op_load(core.int, slot)?;
        self.op_constant(Constant::Int(delta))?;
        self.op_arithmetic(ArithmeticOp::Add, core.int)?;
        self.op_store(core.int, slot)?;
        self.frame.adjust_max_stack(-2);
        Ok(())
    }

    fn op_wide(&mut self) -> Result<()> {
        use opcodes::*;
        let opcode = self.stream.read_u1()?;
        match opcode {
            ILOAD..=ALOAD => {
                let ty = self.local_kind_type(opcode - ILOAD);
                let slot = self.stream.read_slot2(width(ty))?;
                self.op_load(ty, slot)
            }
            ISTORE..=ASTORE => {
                let ty = self.local_kind_type(opcode - ISTORE);
                let slot = self.stream.read_slot2(width(ty))?;
                self.op_store(ty, slot)
            }
            IINC => {
                let slot = self.stream.read_slot2(1)?;
                let delta = self.stream.read_i2()?;
                self.op_iinc(slot, delta as i32)
            }
            _ => Err(LinkageError::verify(
                VerifyErrorKind::BadInstr,
                format!("wide {}", opcodes::mnemonic(opcode)),
            )
            .into()),
        }
    }

    fn op_pop2(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let first = self.pop(core.universe)?;
        self.append(InsnKind::Pop { value: first }, core.void);
        if !self.ir[first].ty.is_two_words() {
            let second = self.pop(core.universe)?;
            verify(
                !self.ir[second].ty.is_two_words(),
                VerifyErrorKind::StackExpectCat1,
            )?;
            self.append(InsnKind::Pop { value: second }, core.void);
        }
        Ok(())
    }

    /// Apply a stack shuffle, recording it on the instruction it follows
    ///
    /// The copies of a `new` are recorded on the `NewObject` itself, so it has to be that
    /// instruction.
    fn op_dup_swap(&mut self, opcode: u8) -> Result<()> {
        let duped_new = self.frame.dup_swap(&mut self.ir, opcode)?;
        let mut last = self.ir.tail();
        while let Some(insn) = last {
            match self.ir[insn].kind {
                InsnKind::HandlerEnter { .. } | InsnKind::HandlerExit { .. } => {
                    last = self.ir.prev(insn)
                }
                _ => break,
            }
        }
        match last {
            Some(insn) => {
                if duped_new {
                    verify_translatable(
                        self.frame.peek() == Some(insn),
                        "dup of a new that is not right after it",
                    )?;
                }
                self.ir[insn].dup_swaps.push(opcode);
                Ok(())
            }
            None => Err(AssertionFailed::new("stack shuffle before any instruction").into()),
        }
    }

    fn op_array_load(&mut self, element: Type<'g>) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let index = self.pop(core.int)?;
        let array = if element == core.byte_or_boolean {
            let array = self.pop(core.null_object)?;
            verify(
                self.is_byte_or_boolean_array(self.ir[array].ty),
                VerifyErrorKind::BaloadBadType,
            )?;
            self.cast_null(array, self.ctx.array_of(core.byte));
            array
        } else {
            let array_type = self.ctx.array_of(element);
            let array = self.pop(array_type)?;
            if element != core.null_object {
                self.cast_null(array, array_type);
            }
            array
        };
        let array_type = self.ir[array].ty;
        let ty = match array_type.element_type() {
            Some(ty) if ty != core.null_object => ty,
            _ if element == core.byte_or_boolean => core.byte,
            _ => element,
        };
        if element == core.null_object {
            verify(
                array_type == core.null_object || array_type.is_array(),
                VerifyErrorKind::AaloadBadType,
            )?;
        }
        self.append_push(InsnKind::LoadIndexed { array, index }, ty)
            .map(drop)
    }

    fn op_array_store(&mut self, element: Type<'g>) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let value = self.pop(element)?;
        let index = self.pop(core.int)?;
        let array = if element == core.byte_or_boolean {
            let array = self.pop(core.null_object)?;
            verify(
                self.is_byte_or_boolean_array(self.ir[array].ty),
                VerifyErrorKind::BastoreBadType,
            )?;
            self.cast_null(array, self.ctx.array_of(core.byte));
            array
        } else {
            let array_type = self.ctx.array_of(element);
            let array = self.pop(array_type)?;
            if element != core.null_object {
                self.cast_null(array, array_type);
            }
            array
        };
        if element == core.null_object {
            let array_element = self.ir[array].ty.element_type().unwrap_or(core.null_object);
            let value_type = self.ir[value].ty;
            if array_element.is_array() || value_type.is_array() {
                verify(
                    self.ir[array].ty == core.null_object
                        || self.ctx.is_assignable(value_type, array_element)?,
                    VerifyErrorKind::AastoreBadType,
                )?;
            }
        }
        self.append(InsnKind::StoreIndexed { array, index, value }, core.void);
        Ok(())
    }

    fn is_byte_or_boolean_array(&self, ty: Type<'g>) -> bool {
        let ctx = self.ctx;
        let core = &ctx.core;
        ty == core.null_object
            || matches!(ty.element_type(), Some(element) if element == core.byte
                || element == core.boolean
                || element == core.byte_or_boolean)
    }

    fn op_arithmetic(&mut self, op: ArithmeticOp, ty: Type<'g>) -> Result<()> {
        let right_type = if op.is_shift() { self.ctx.core.int } else { ty };
        let right = self.pop(right_type)?;
        let left = self.pop(ty)?;
        self.append_push(
            InsnKind::Arithmetic {
                op,
                operand_type: ty,
                left,
                right,
            },
            ty,
        )
        .map(drop)
    }

    fn op_compare(&mut self, op: ArithmeticOp, ty: Type<'g>) -> Result<()> {
        let right = self.pop(ty)?;
        let left = self.pop(ty)?;
        self.append_push(
            InsnKind::Arithmetic {
                op,
                operand_type: ty,
                left,
                right,
            },
            self.ctx.core.int,
        )
        .map(drop)
    }

    fn op_convert(&mut self, from: Type<'g>, to: Type<'g>) -> Result<()> {
        let value = self.pop(from)?;
        self.append_push(InsnKind::Convert { value, from, to }, to)
            .map(drop)
    }

    fn op_if(&mut self, condition: Condition, operand_type: Type<'g>, binary: bool) -> Result<()> {
        let target = self.stream.read_target2(&self.ir)?;
        let right = if binary {
            Some(self.pop(operand_type)?)
        } else {
            None
        };
        let left = self.pop(operand_type)?;
        let exit = self.append(
            InsnKind::If {
                condition,
                operand_type,
                left,
                right,
                target,
            },
            self.ctx.core.void,
        );
        self.end_basic_block(exit)
    }

    fn op_goto(&mut self, target: TargetId) -> Result<()> {
        let exit = self.append(InsnKind::Goto { target }, self.ctx.core.void);
        self.end_basic_block(exit)
    }

    fn op_tableswitch(&mut self) -> Result<()> {
        let key = self.pop(self.ctx.core.int)?;
        self.stream.align()?;
        let default = self.stream.read_target4(&self.ir)?;
        let low = self.stream.read_i4()?;
        let high = self.stream.read_i4()?;
        verify_with(low <= high, VerifyErrorKind::BadInstr, || {
            format!("tableswitch from {} to {}", low, high)
        })?;
        let count = high as i64 - low as i64 + 1;
        self.stream.expect_table(count, 4)?;
        let mut targets = Vec::with_capacity(count as usize);
        for _ in low..=high {
            targets.push(self.stream.read_target4(&self.ir)?);
        }
        let exit = self.append(
            InsnKind::TableSwitch {
                key,
                low,
                high,
                default,
                targets,
            },
            self.ctx.core.void,
        );
        self.end_basic_block(exit)
    }

    fn op_lookupswitch(&mut self) -> Result<()> {
        let key = self.pop(self.ctx.core.int)?;
        self.stream.align()?;
        let default = self.stream.read_target4(&self.ir)?;
        let count = self.stream.read_i4()?;
        verify(count >= 0, VerifyErrorKind::BadLookupSwitch)?;
        self.stream.expect_table(count as i64, 8)?;
        let mut cases: Vec<(i32, TargetId)> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let value = self.stream.read_i4()?;
            let target = self.stream.read_target4(&self.ir)?;
            if let Some((last, _)) = cases.last() {
                verify(value > *last, VerifyErrorKind::BadLookupSwitch)?;
            }
            cases.push((value, target));
        }
        let exit = self.append(
            InsnKind::LookupSwitch {
                key,
                default,
                cases,
            },
            self.ctx.core.void,
        );
        self.end_basic_block(exit)
    }

    fn op_return_void(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let method = self.method;
        let is_init = method.is_init();
        verify(
            method.return_type.is_void() || is_init,
            VerifyErrorKind::ExpectRetVal,
        )?;
        if is_init {
            verify(
                self.frame.local_type(&self.ir, 0) != core.init_object,
                VerifyErrorKind::ReturnUninitThis,
            )?;
        }
        if method.is_synchronized() {
            self.method_monitor_exit()?;
        }

        // Constructors hand back the object they initialized
        let value = if is_init {
            self.frame.adjust_max_stack(1);
            self.op_load(method.parent, 0)?;
            self.frame.adjust_max_stack(-1);
            Some(self.pop(method.parent)?)
        } else {
            None
        };
        self.force_stack_spilling();
        let exit = self.append(InsnKind::Return { value }, core.void);
        self.end_basic_block(exit)
    }

    fn op_return(&mut self, ty: Type<'g>) -> Result<()> {
        let method = self.method;
        verify(
            !method.return_type.is_void() && !method.is_init(),
            VerifyErrorKind::ExpectNoRetVal,
        )?;
        if method.is_synchronized() {
            self.method_monitor_exit()?;
        }
        let value = self.pop(ty)?;
        let value_type = self.ir[value].ty;
        let return_type = self.ctx.local_type(method.return_type);
        verify_with(
            self.ctx.is_assignable(value_type, return_type)?,
            VerifyErrorKind::RetValBadType,
            || format!("{} is not assignable to {}", value_type, return_type),
        )?;
        self.cast_null(value, method.return_type);
        self.force_stack_spilling();
        let exit = self.append(InsnKind::Return { value: Some(value) }, self.ctx.core.void);
        self.end_basic_block(exit)
    }

    fn op_getstatic(&mut self) -> Result<()> {
        let field = self.stream.read_field(true)?;
        if field.is_primitive_constant() {
            if let Some(value) = field.constant_value.clone() {
                return self.op_constant_value(value, Some(field.ty));
            }
        }
        self.append_push(
            InsnKind::LoadField {
                field,
                receiver: None,
            },
            field.ty,
        )
        .map(drop)
    }

    fn op_putstatic(&mut self) -> Result<()> {
        let field = self.stream.read_field(true)?;
        let value = self.pop(field.ty)?;

        // The constant is inlined at every read, so storing it is redundant
        if self.ctx.settings.remove_constant_puts
            && field.is_primitive_constant()
            && self.ir.tail() == Some(value)
            && matches!(self.ir[value].kind, InsnKind::LoadConstant(_))
        {
            log::trace!("removing store of constant {}", field);
            self.ir.remove(value);
            Statistics::bump(&self.ctx.statistics.removed, 1);
            return Ok(());
        }
        self.append(
            InsnKind::StoreField {
                field,
                receiver: None,
                value,
            },
            self.ctx.core.void,
        );
        Ok(())
    }

    /// Pop the object of a `getfield`/`putfield`
    ///
    /// Protected fields of another package may only be accessed through the current class. In a
    /// constructor, fields of its own class may be written before `this` is initialized.
    fn pop_field_receiver(&mut self, field: &'g FieldData<'g>, is_store: bool) -> Result<InsnId> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let parent = self.method.parent;
        let expected = if field.is_protected() && !parent.in_same_package(field.parent) {
            parent
        } else {
            field.parent
        };
        if is_store && self.method.is_init() && field.parent == parent {
            let receiver = self.frame.pop(&mut self.ir, core.universe)?;
            if self.ir[receiver].ty == core.init_object {
                return Ok(receiver);
            }
            self.frame.push(&mut self.ir, receiver, false)?;
        }
        let receiver = self.pop(expected)?;
        self.cast_null(receiver, field.parent);
        Ok(receiver)
    }

    fn op_getfield(&mut self) -> Result<()> {
        let field = self.stream.read_field(false)?;
        let receiver = self.pop_field_receiver(field, false)?;
        let is_receiver = self.is_load_receiver(receiver);
        let insn = self.append_push(
            InsnKind::LoadField {
                field,
                receiver: Some(receiver),
            },
            field.ty,
        )?;
        if is_receiver {
            self.ir[insn].flags.insert(InsnFlags::RECEIVER);
        }
        Ok(())
    }

    fn op_putfield(&mut self) -> Result<()> {
        let field = self.stream.read_field(false)?;
        let value = self.pop(field.ty)?;
        let receiver = self.pop_field_receiver(field, true)?;
        let is_receiver = self.is_load_receiver(receiver);
        let insn = self.append(
            InsnKind::StoreField {
                field,
                receiver: Some(receiver),
                value,
            },
            self.ctx.core.void,
        );
        if is_receiver {
            self.ir[insn].flags.insert(InsnFlags::RECEIVER);
        }
        Ok(())
    }

    fn op_invoke_resolved(&mut self, form: InvokeForm) -> Result<()> {
        let callee = self.stream.read_method(form == InvokeForm::Static)?;
        verify_with(
            !callee.name.starts_with('<'),
            VerifyErrorKind::ExpectInvokeSpecial,
            || callee.to_string(),
        )?;
        if form == InvokeForm::Interface {
            let count = self.stream.read_u1()?;
            let zero = self.stream.read_u1()?;
            verify_with(
                count as usize == callee.parameter_words(),
                VerifyErrorKind::NargsMismatch,
                || format!("{} words for {}", count, callee),
            )?;
            verify(zero == 0, VerifyErrorKind::ExpectZero)?;
        }
        self.op_invoke(callee, form)
    }

    fn op_invokespecial(&mut self) -> Result<()> {
        let callee = self.stream.read_method(false)?;
        let parent = self.method.parent;
        let form = if callee.is_init() {
            InvokeForm::Init
        } else if callee.is_private() {
            verify_with(
                callee.parent == parent,
                VerifyErrorKind::InvokeSpecial,
                || callee.to_string(),
            )?;
            InvokeForm::Virtual
        } else {
            verify_with(
                callee.parent != parent && self.ctx.is_assignable(parent, callee.parent)?,
                VerifyErrorKind::InvokeSpecial,
                || callee.to_string(),
            )?;
            InvokeForm::Super
        };
        self.op_invoke(callee, form)
    }

    fn op_invoke(&mut self, callee: &'g MethodData<'g>, form: InvokeForm) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let mut args = Vec::with_capacity(callee.parameters.len() + 1);
        for &parameter in callee.parameters.iter().rev() {
            args.push(self.pop(parameter)?);
        }

        let mut dup_count = 0;
        let mut pop_result = false;
        match form {
            InvokeForm::Static => (),
            InvokeForm::Init => {
                let receiver = self.pop_uninitialized(callee)?;
                if self.ir[receiver].was_duped() {
                    let dups = std::mem::take(&mut self.ir[receiver].dup_swaps);
                    verify_translatable(
                        dups.iter().all(|opcode| *opcode == opcodes::DUP),
                        "uninitialized object shuffled by other than dup",
                    )?;
                    for _ in 0..dups.len() {
                        let copy = self.frame.pop(&mut self.ir, core.universe)?;
                        verify_translatable(copy == receiver, "copy of new used before <init>")?;
                    }
                    dup_count = dups.len();
                    self.ir[receiver].flags.remove(InsnFlags::DUPED);
                } else {
                    pop_result = true;
                }
                args.push(receiver);
            }
            InvokeForm::Super => {
                let receiver = self.pop(self.method.parent)?;
                args.push(receiver);
            }
            InvokeForm::Virtual | InvokeForm::Interface => {
                let receiver = self.pop_narrowing(callee.parent, form == InvokeForm::Interface)?;
                self.cast_null(receiver, callee.parent);
                args.push(receiver);
            }
        }
        args.reverse();

        let ty = callee.return_type;
        let insn = self.append(
            InsnKind::Invoke {
                method: callee,
                form,
                args,
            },
            ty,
        );
        if !ty.is_void() {
            self.frame.push(&mut self.ir, insn, true)?;
        }
        if form == InvokeForm::Init {
            if pop_result {
                let value = self.frame.pop(&mut self.ir, core.universe)?;
                self.append(InsnKind::Pop { value }, core.void);
            } else {
                for _ in 1..dup_count {
                    self.op_dup_swap(opcodes::DUP)?;
                }
            }
        }
        Ok(())
    }

    /// Pop the object a constructor is called on, retyping it now that it is initialized
    fn pop_uninitialized(&mut self, callee: &'g MethodData<'g>) -> Result<InsnId> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let parent = self.method.parent;
        let receiver = self.frame.pop(&mut self.ir, core.universe)?;
        let ty = self.ir[receiver].ty;
        let initialized = if ty == core.init_object {
            verify_with(
                callee.parent == parent || Some(callee.parent) == parent.superclass(),
                VerifyErrorKind::BadInitCall,
                || callee.to_string(),
            )?;
            self.frame.rename_init_to(&mut self.ir, parent);
            parent
        } else if ty.is_proxy() {
            let class = self
                .proxies
                .resolved(ty)
                .ok_or_else(|| LinkageError::verify(VerifyErrorKind::ExpectNew, ty.to_string()))?;
            verify_with(class == callee.parent, VerifyErrorKind::BadInitCall, || {
                format!("{} on a new {}", callee, class)
            })?;
            class
        } else {
            return Err(LinkageError::verify(VerifyErrorKind::ExpectUninit, ty.to_string()).into());
        };
        self.ir[receiver].ty = initialized;
        if let Some(temp) = self.ir[receiver].temporary {
            self.ir[temp].ty = initialized;
        }
        Ok(receiver)
    }

    fn op_new(&mut self) -> Result<()> {
        let (proxy, class) = self.stream.read_new_type(&mut self.proxies)?;
        verify(class.is_class(), VerifyErrorKind::ExpectClass)?;
        self.ctx.load(class)?;
        if class.is_interface() || class.is_abstract() {
            return Err(LinkageError::new(LinkageErrorKind::InstantiationError, class.name.clone()).into());
        }
        self.append_push(InsnKind::NewObject, proxy).map(drop)
    }

    fn op_new_array(&mut self, ty: Type<'g>) -> Result<()> {
        verify_with(
            ty.dimensions() <= self.ctx.max_array_dimensions(),
            VerifyErrorKind::MultiANewArray,
            || format!("{} has too many dimensions", ty),
        )?;
        let size = self.pop(self.ctx.core.int)?;
        self.append_push(InsnKind::NewArray { size }, ty).map(drop)
    }

    /// `multianewarray` becomes the allocation of the outermost dimension followed by one
    /// `NewDimension` per further dimension
    fn op_multianewarray(&mut self) -> Result<()> {
        let ty = self.stream.read_type()?;
        let dimensions = self.stream.read_u1()? as usize;
        verify_with(
            dimensions > 0 && dimensions <= ty.dimensions(),
            VerifyErrorKind::MultiANewArray,
            || format!("{} dimensions of {}", dimensions, ty),
        )?;
        let mut sizes = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            sizes.push(self.pop(self.ctx.core.int)?);
        }
        sizes.reverse();
        if dimensions > 1 {
            for &size in &sizes {
                self.ir[size].flags.insert(InsnFlags::SPILLS);
            }
        }

        let mut array = self.append_push(InsnKind::NewArray { size: sizes[0] }, ty)?;
        for &dimension in &sizes[1..] {
            let popped = self.pop(ty)?;
            array = self.append_push(
                InsnKind::NewDimension {
                    array: popped,
                    dimension,
                },
                ty,
            )?;
        }
        log::trace!("multianewarray {} -> #{}", ty, array.0);
        Ok(())
    }

    fn op_arraylength(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let array = self.pop(core.null_object)?;
        let ty = self.ir[array].ty;
        verify_translatable(ty != core.null_object, "arraylength of null")?;
        verify(ty.is_array(), VerifyErrorKind::ExpectArray)?;
        self.append_push(InsnKind::ArrayLength { array }, core.int)
            .map(drop)
    }

    fn op_athrow(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        let value = self.pop(core.throwable)?;
        self.cast_null(value, core.throwable);
        self.force_stack_spilling();
        let exit = self.append(InsnKind::Throw { value }, core.void);
        self.end_basic_block(exit)
    }

    /// `monitorenter`; with `is_class`, the monitor of the method's class
    fn op_monitor_enter(&mut self, is_class: bool) -> Result<()> {
        let value = self.pop_monitor(is_class)?;
        self.append(InsnKind::MonitorEnter { value }, self.ctx.core.void);
        Ok(())
    }

    fn op_monitor_exit(&mut self, is_class: bool) -> Result<()> {
        let value = self.pop_monitor(is_class)?;
        self.append(InsnKind::MonitorExit { value }, self.ctx.core.void);
        Ok(())
    }

    fn pop_monitor(&mut self, is_class: bool) -> Result<Option<InsnId>> {
        if is_class {
            return Ok(None);
        }
        let ctx = self.ctx;
        let core = &ctx.core;
        let value = self.pop(core.null_object)?;
        self.cast_null(value, core.object);
        Ok(Some(value))
    }

    /// Check and merge the frame into every target of a block exit
    fn end_basic_block(&mut self, exit: InsnId) -> Result<()> {
        let mut targets = self.ir[exit].kind.targets();
        targets.sort();
        targets.dedup();
        for target in targets {
            self.branch_to(exit, target)?;
        }
        self.flow = self.ir[exit].kind.falls_through();
        self.frame.spill_stack(&mut self.ir, true);
        Ok(())
    }

    fn branch_to(&mut self, exit: InsnId, target: TargetId) -> Result<()> {
        verify_translatable(
            !self.ir[target].is_exception_target(),
            "branch to an exception handler",
        )?;
        self.frame.match_stack_map(
            &mut self.ir,
            target,
            false,
            VerifyErrorKind::TargetBadType,
        )?;
        if self.ir[target].address <= self.stream.last_ip() {
            verify(
                !self.frame.contains_uninitialized(&self.ir, false),
                VerifyErrorKind::BackBranchUninit,
            )?;
            self.backward_branch(exit, target);
        }
        self.frame.merge_with_target(&mut self.ir, target)
    }

    /// Everything from the target up to the branch is one loop deeper
    fn backward_branch(&mut self, exit: InsnId, target: TargetId) {
        self.ir[target].is_backward = true;
        let mut next = self.ir[target].insn;
        while let Some(insn) = next {
            self.ir[insn].loop_depth += 1;
            if insn == exit {
                break;
            }
            next = self.ir.next(insn);
        }
    }

    fn op_branch_target(&mut self, target: TargetId, fell_through: bool) -> Result<()> {
        if fell_through {
            self.frame.spill_stack(&mut self.ir, true);
            self.frame.match_stack_map(
                &mut self.ir,
                target,
                true,
                VerifyErrorKind::TargetBadType,
            )?;
            self.frame.merge_with_target(&mut self.ir, target)?;
        } else {
            self.frame.reinitialize(&mut self.ir, target)?;
        }
        let phi = self.append(InsnKind::Phi { target }, self.ctx.core.void);
        self.ir[target].insn = Some(phi);
        Ok(())
    }

    fn op_exception_target(&mut self, target: TargetId, fell_through: bool) -> Result<()> {
        let ctx = self.ctx;
        let core = &ctx.core;
        verify_translatable(!fell_through, "falling through into an exception handler")?;
        while self.frame.stack_size() > 0 {
            self.frame.pop(&mut self.ir, core.universe)?;
        }
        let stack = self.ir[target].entry.stack.clone();
        verify_with(stack.len() == 1, VerifyErrorKind::BadStackMap, || {
            format!("{} values on the stack at an exception handler", stack.len())
        })?;
        let ty = stack[0];
        verify_with(
            self.ctx.is_assignable(ty, core.throwable)?,
            VerifyErrorKind::BadStackMap,
            || format!("{} caught", ty),
        )?;
        self.frame.reinitialize(&mut self.ir, target)?;

        let insn = self.append(InsnKind::LoadException { target }, ty);
        self.ir[target].insn = Some(insn);
        self.frame.push(&mut self.ir, insn, true)
    }

    fn op_handler_start(&mut self, handler: HandlerId, fell_through: bool) {
        let insn = self.append(InsnKind::HandlerEnter { handler }, self.ctx.core.void);
        if let Some(entry) = self.ir.handlers.get_mut(handler) {
            entry.start = Some(insn);
        }
        self.active_handlers.push(handler);
        self.flow = fell_through;
    }

    fn op_handler_end(&mut self, handler: HandlerId, fell_through: bool) -> Result<()> {
        match self.active_handlers.pop() {
            Some(active) if active == handler => (),
            Some(_) => {
                return Err(LinkageError::verify(
                    VerifyErrorKind::BadStackMap,
                    "mismatched handler end",
                )
                .into())
            }
            None => {
                return Err(LinkageError::verify(
                    VerifyErrorKind::BadStackMap,
                    "missing handler end",
                )
                .into())
            }
        }
        let insn = self.append(InsnKind::HandlerExit { handler }, self.ctx.core.void);
        if let Some(entry) = self.ir.handlers.get_mut(handler) {
            entry.end = Some(insn);
        }
        self.flow = fell_through;
        Ok(())
    }
}

/// Check the method's exception table against its stack map and add it to the IR
fn add_handlers<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    holder: &BytecodeHolder,
    ir: &mut MethodIr<'g>,
) -> Result<()> {
    if holder.handlers.is_empty() {
        return Ok(());
    }
    verify_with(
        holder.stack_map.is_some(),
        VerifyErrorKind::TargetBadType,
        || String::from("exception handlers without a stack map"),
    )?;
    let code_length = holder.code.len() as u32;
    for raw in &holder.handlers {
        let (start_pc, end_pc, handler_pc) =
            (raw.start_pc as u32, raw.end_pc as u32, raw.handler_pc as u32);
        if start_pc >= end_pc || end_pc > code_length {
            return Err(LinkageError::class_format(format!(
                "bad protected range {}..{}",
                start_pc, end_pc
            ))
            .into());
        }
        let target = ir.target_at(handler_pc).ok_or_else(|| {
            LinkageError::verify(
                VerifyErrorKind::TargetBadType,
                format!("handler at {}", handler_pc),
            )
        })?;
        let catch_type = if raw.catch_type == 0 {
            ctx.core.throwable
        } else {
            let pool = method
                .parent
                .constant_pool()
                .ok_or_else(|| AssertionFailed::new("handler without a constant pool"))?;
            pool.resolve_type(ctx, raw.catch_type, method.parent)?
        };
        verify_with(
            ctx.is_throwable(catch_type)?,
            VerifyErrorKind::ExpectThrowable,
            || catch_type.to_string(),
        )?;
        ir[target].exception_type.get_or_insert(catch_type);
        ir.handlers.add(HandlerEntry {
            start: None,
            end: None,
            entry: None,
            target,
            catch_type,
            start_pc,
            end_pc,
            handler_pc,
        });
    }
    Ok(())
}

fn width(ty: Type) -> usize {
    if ty.is_two_words() {
        2
    } else {
        1
    }
}

/// Condition of `ifeq` and friends, by offset from the first opcode of the group
fn condition(offset: u8) -> Condition {
    match offset {
        0 => Condition::Eq,
        1 => Condition::Ne,
        2 => Condition::Lt,
        3 => Condition::Ge,
        4 => Condition::Gt,
        _ => Condition::Le,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{BinaryReader, ConstantPool, MemoryClassPath, MethodAccessFlags};
    use crate::model::ContextArenas;
    use crate::settings::Settings;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn method<'g>(
        ctx: &TranslationContext<'g>,
        access_flags: MethodAccessFlags,
        descriptor: &str,
    ) -> &'g MethodData<'g> {
        let (parameters, return_type) = ctx.method_signature(descriptor).unwrap();
        ctx.add_method(MethodData {
            parent: ctx.core.object,
            name: String::from("run"),
            descriptor: String::from(descriptor),
            access_flags,
            parameters,
            return_type,
            exceptions: vec![],
            slot: 0,
            holder: RefCell::new(None),
        })
    }

    fn holder(code: Vec<u8>, max_stack: u16, max_locals: u16) -> BytecodeHolder {
        BytecodeHolder {
            code,
            max_stack,
            max_locals,
            handlers: vec![],
            stack_map: None,
            line_numbers: None,
            local_variables: None,
            liveness: None,
        }
    }

    fn kinds(ir: &MethodIr) -> Vec<&'static str> {
        ir.ids().into_iter().map(|id| ir[id].kind.mnemonic()).collect()
    }

    fn with_context<F: for<'g> FnOnce(&TranslationContext<'g>)>(f: F) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        let pool = ConstantPool::read(&ctx, &mut BinaryReader::new(&[0, 1], "Object.class")).unwrap();
        *ctx.core.object.constant_pool.borrow_mut() = Some(Rc::new(pool));
        f(&ctx)
    }

    #[test]
    fn straight_line_code() {
        with_context(|ctx| {
            let method = method(ctx, MethodAccessFlags::STATIC, "(II)I");
            let code = vec![
                opcodes::ILOAD_0,
                opcodes::ILOAD_1,
                opcodes::IADD,
                opcodes::IRETURN,
            ];
            let ir = build(ctx, method, &holder(code, 2, 2), None).unwrap();
            assert_eq!(kinds(&ir), vec!["load", "load", "arithmetic", "return"]);
            assert_eq!(ir.max_stack, 2);
            assert_eq!(ir.parameters.len(), 2);
            assert!(ctx.statistics.instructions.get() >= 4);
        })
    }

    #[test]
    fn branch_to_stack_map_entry() {
        with_context(|ctx| {
            let method = method(ctx, MethodAccessFlags::STATIC, "(I)I");
            let code = vec![
                opcodes::ILOAD_0,
                opcodes::IFLE,
                0,
                5,
                opcodes::ILOAD_0,
                opcodes::IRETURN,
                opcodes::ILOAD_0,
                opcodes::INEG,
                opcodes::IRETURN,
            ];
            let mut holder = holder(code, 1, 1);
            // one entry at 6: locals [int], empty stack
            holder.stack_map = Some(vec![0, 1, 0, 6, 0, 1, 1, 0, 0]);
            let ir = build(ctx, method, &holder, None).unwrap();
            assert_eq!(
                kinds(&ir),
                vec!["load", "if", "load", "return", "phi", "load", "negate", "return"]
            );
            let parameter = ir.parameters[0].unwrap();
            let loads: Vec<InsnId> = ir
                .ids()
                .into_iter()
                .filter(|id| matches!(ir[*id].kind, InsnKind::LoadLocal { .. }))
                .collect();
            assert_eq!(loads.len(), 3);
            for load in loads {
                assert_eq!(ir[load].kind.local(), Some(parameter));
            }
        })
    }

    #[test]
    fn iinc_expands_unless_by_one() {
        with_context(|ctx| {
            let method = method(ctx, MethodAccessFlags::STATIC, "(I)V");
            let code = vec![
                opcodes::IINC,
                0,
                1,
                opcodes::IINC,
                0,
                5,
                opcodes::RETURN,
            ];
            let ir = build(ctx, method, &holder(code, 0, 1), None).unwrap();
            assert_eq!(
                kinds(&ir),
                vec!["inc", "load", "const", "arithmetic", "store", "return"]
            );
        })
    }

    #[test]
    fn synchronized_static_method() {
        with_context(|ctx| {
            let method = method(
                ctx,
                MethodAccessFlags::STATIC | MethodAccessFlags::SYNCHRONIZED,
                "()V",
            );
            let ir = build(ctx, method, &holder(vec![opcodes::RETURN], 0, 0), None).unwrap();
            assert_eq!(
                kinds(&ir),
                vec![
                    "monitorenter",
                    "try",
                    "monitorexit",
                    "return",
                    "tryend",
                    "catch",
                    "monitorexit",
                    "throw"
                ]
            );
            assert_eq!(ir.handlers.len(), 1);
            let (_, handler) = ir.handlers.iter().next().unwrap();
            assert_eq!(handler.handler_pc, SYNTHETIC_ADDRESS);
            assert!(handler.entry.is_some());
        })
    }

    #[test]
    fn rejects_bad_code() {
        with_context(|ctx| {
            let method = method(ctx, MethodAccessFlags::STATIC, "()V");
            let expect = |code: Vec<u8>, max_stack, kind| {
                let err = build(ctx, method, &holder(code, max_stack, 0), None).unwrap_err();
                assert_eq!(err.verify_kind(), Some(kind));
            };
            expect(
                vec![opcodes::ICONST_0, opcodes::POP],
                1,
                VerifyErrorKind::FallThrough,
            );
            expect(
                vec![opcodes::JSR, 0, 3, opcodes::RETURN],
                1,
                VerifyErrorKind::BadInstr,
            );
            expect(
                vec![opcodes::ICONST_0, opcodes::ICONST_1, opcodes::POP2, opcodes::RETURN],
                1,
                VerifyErrorKind::StackOverflow,
            );
            expect(vec![opcodes::POP, opcodes::RETURN], 1, VerifyErrorKind::StackUnderflow);
            expect(
                vec![opcodes::LCONST_0, opcodes::POP, opcodes::RETURN],
                2,
                VerifyErrorKind::StackExpectCat1,
            );
            expect(vec![opcodes::ICONST_0, opcodes::IRETURN], 1, VerifyErrorKind::ExpectNoRetVal);
        })
    }

    #[test]
    fn code_after_return_needs_a_stack_map_entry() {
        with_context(|ctx| {
            let method = method(ctx, MethodAccessFlags::STATIC, "()V");
            let code = vec![opcodes::RETURN, opcodes::RETURN];
            let err = build(ctx, method, &holder(code, 0, 0), None).unwrap_err();
            assert_eq!(err.verify_kind(), Some(VerifyErrorKind::SeqBadType));
        })
    }

    #[test]
    fn switch_tables_must_fit_in_the_code() {
        with_context(|ctx| {
            let method = method(ctx, MethodAccessFlags::STATIC, "(I)V");

            // Default goes to 16, but `low..=high` covers every int
            let code = vec![
                opcodes::ILOAD_0,
                opcodes::TABLESWITCH,
                0,
                0,
                0,
                0,
                0,
                15,
                0x80,
                0,
                0,
                0,
                0x7f,
                0xff,
                0xff,
                0xff,
                opcodes::RETURN,
            ];
            let mut table = holder(code, 1, 1);
            table.stack_map = Some(vec![0, 1, 0, 16, 0, 1, 1, 0, 0]);
            let err = build(ctx, method, &table, None).unwrap_err();
            assert_eq!(err.verify_kind(), Some(VerifyErrorKind::MiddleOfByteCode));

            let code = vec![
                opcodes::ILOAD_0,
                opcodes::LOOKUPSWITCH,
                0,
                0,
                0,
                0,
                0,
                11,
                0x7f,
                0xff,
                0xff,
                0xff,
                opcodes::RETURN,
            ];
            let mut lookup = holder(code, 1, 1);
            lookup.stack_map = Some(vec![0, 1, 0, 12, 0, 1, 1, 0, 0]);
            let err = build(ctx, method, &lookup, None).unwrap_err();
            assert_eq!(err.verify_kind(), Some(VerifyErrorKind::MiddleOfByteCode));
        })
    }
}
