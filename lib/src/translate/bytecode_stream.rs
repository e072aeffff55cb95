use crate::classfile::{opcodes, BinaryReader, ConstantPool, Tag};
use crate::errors::{
    verify, verify_with, AssertionFailed, LinkageError, Result, TranslationError, VerifyErrorKind,
};
use crate::ir::{HandlerId, MethodIr, TargetId};
use crate::model::{ConstantValue, FieldData, MethodData, ProxyTable, TranslationContext, Type};
use std::rc::Rc;

/// Unit decoded from a method's bytecode
///
/// Besides real opcodes, the stream yields pseudo opcodes for the addresses where something other
/// than an instruction starts: branch targets, exception handler entries and the boundaries of
/// protected ranges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Bytecode {
    Opcode(u8),
    BranchTarget(TargetId),
    ExceptionTarget(TargetId),
    HandlerStart(HandlerId),
    HandlerEnd(HandlerId),
}

impl Bytecode {
    pub fn is_pseudo(&self) -> bool {
        !matches!(self, Bytecode::Opcode(_))
    }
}

/// Pseudo opcodes of a method, sorted by address
///
/// At the same address, protected ranges close before others open so that they never overlap.
/// Ranges close innermost first (the latest started, then the first in the handler table) and
/// open outermost first (the latest ending, then the last in the handler table). Targets come
/// last.
pub fn address_list(ir: &MethodIr) -> Vec<(u32, Bytecode)> {
    let mut list = Vec::with_capacity(ir.handlers.len() * 2);
    for (id, handler) in ir.handlers.iter() {
        list.push((
            (handler.start_pc, 1, u32::MAX - handler.end_pc, u32::MAX - id.0),
            Bytecode::HandlerStart(id),
        ));
        list.push((
            (handler.end_pc, 0, u32::MAX - handler.start_pc, id.0),
            Bytecode::HandlerEnd(id),
        ));
    }
    for target in ir.target_ids() {
        let pseudo = if ir[target].is_exception_target() {
            Bytecode::ExceptionTarget(target)
        } else {
            Bytecode::BranchTarget(target)
        };
        list.push(((ir[target].address, 2, 0, 0), pseudo));
    }
    list.sort_by_key(|(key, _)| *key);
    list.into_iter().map(|((address, ..), pseudo)| (address, pseudo)).collect()
}

/// Reader of a method's bytecode, resolving operands as it goes
pub struct BytecodeStream<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    method: &'g MethodData<'g>,
    pool: Option<Rc<ConstantPool<'g>>>,
    reader: BinaryReader<'a>,
    addresses: Vec<(u32, Bytecode)>,
    next_address: usize,
    last_ip: u32,
    max_locals: usize,
    instruction_count: usize,
}

impl<'a, 'g> BytecodeStream<'a, 'g> {
    pub fn new(
        ctx: &'a TranslationContext<'g>,
        method: &'g MethodData<'g>,
        code: &'a [u8],
        max_locals: usize,
        addresses: Vec<(u32, Bytecode)>,
    ) -> BytecodeStream<'a, 'g> {
        BytecodeStream {
            ctx,
            method,
            pool: method.parent.constant_pool(),
            reader: BinaryReader::new(code, method.to_string()),
            addresses,
            next_address: 0,
            last_ip: 0,
            max_locals,
            instruction_count: 0,
        }
    }

    /// Address of the opcode (or pseudo opcode) last returned
    pub fn last_ip(&self) -> u32 {
        self.last_ip
    }

    /// Address of the next byte to be read
    pub fn current_ip(&self) -> u32 {
        self.reader.position() as u32
    }

    /// Number of real opcodes read so far
    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    /// Read the next opcode or pseudo opcode (`None` at the end of the code)
    pub fn next(&mut self) -> Result<Option<Bytecode>> {
        let ip = self.current_ip();
        self.last_ip = ip;

        if let Some(&(address, pseudo)) = self.addresses.get(self.next_address) {
            if address <= ip {
                verify_with(address == ip, VerifyErrorKind::BadStackMap, || {
                    format!("{} is in the middle of an instruction", address)
                })?;
                self.next_address += 1;
                return Ok(Some(pseudo));
            }
        }

        if self.reader.at_end() {
            verify_with(
                self.next_address == self.addresses.len(),
                VerifyErrorKind::BadStackMap,
                || String::from("address past the end of the code"),
            )?;
            return Ok(None);
        }
        self.instruction_count += 1;
        Ok(Some(Bytecode::Opcode(self.read_u1()?)))
    }

    fn truncated(&self, cause: TranslationError) -> TranslationError {
        LinkageError::verify(
            VerifyErrorKind::MiddleOfByteCode,
            format!("instruction at {} runs past the end of the code", self.last_ip),
        )
        .with_cause(cause)
        .into()
    }

    pub fn read_u1(&mut self) -> Result<u8> {
        self.reader.read_u1().map_err(|err| self.truncated(err))
    }

    pub fn read_u2(&mut self) -> Result<u16> {
        self.reader.read_u2().map_err(|err| self.truncated(err))
    }

    pub fn read_i1(&mut self) -> Result<i8> {
        self.reader.read_i1().map_err(|err| self.truncated(err))
    }

    pub fn read_i2(&mut self) -> Result<i16> {
        self.reader.read_i2().map_err(|err| self.truncated(err))
    }

    pub fn read_i4(&mut self) -> Result<i32> {
        self.reader.read_i4().map_err(|err| self.truncated(err))
    }

    fn target_at(&self, ir: &MethodIr<'g>, offset: i64) -> Result<TargetId> {
        let address = self.last_ip as i64 + offset;
        let target = u32::try_from(address).ok().and_then(|address| ir.target_at(address));
        match target {
            Some(target) => Ok(target),
            None => Err(LinkageError::verify(
                VerifyErrorKind::TargetBadType,
                format!("no stack map entry at {}", address),
            )
            .into()),
        }
    }

    /// Branch target from a 2 byte offset
    pub fn read_target2(&mut self, ir: &MethodIr<'g>) -> Result<TargetId> {
        let offset = self.read_i2()?;
        self.target_at(ir, offset as i64)
    }

    /// Branch target from a 4 byte offset
    pub fn read_target4(&mut self, ir: &MethodIr<'g>) -> Result<TargetId> {
        let offset = self.read_i4()?;
        self.target_at(ir, offset as i64)
    }

    /// Check that a switch table of `entries` entries of `entry_size` bytes each fits in the rest
    /// of the code
    pub fn expect_table(&self, entries: i64, entry_size: i64) -> Result<()> {
        verify_with(
            entries * entry_size <= self.reader.remaining() as i64,
            VerifyErrorKind::MiddleOfByteCode,
            || format!("switch at {} with {} entries runs past the end of the code", self.last_ip, entries),
        )
    }

    /// Skip the zero padding of a switch
    pub fn align(&mut self) -> Result<()> {
        while self.current_ip() % 4 != 0 {
            verify(self.read_u1()? == 0, VerifyErrorKind::ExpectZero)?;
        }
        Ok(())
    }

    fn pool(&self) -> Result<&ConstantPool<'g>> {
        match &self.pool {
            Some(pool) => Ok(pool),
            None => Err(AssertionFailed::new(format!("{} has no constant pool", self.method.parent)).into()),
        }
    }

    /// Constant for `ldc`/`ldc_w` (`wide`) and `ldc2_w` (`two_words`)
    pub fn read_ldc(&mut self, wide: bool, two_words: bool) -> Result<ConstantValue> {
        let index = if wide || two_words {
            self.read_u2()?
        } else {
            self.read_u1()? as u16
        };
        let value = self.pool()?.loadable(index);
        match value {
            Some(value @ ConstantValue::Long(_)) | Some(value @ ConstantValue::Double(_))
                if two_words =>
            {
                Ok(value)
            }
            Some(value @ ConstantValue::Int(_))
            | Some(value @ ConstantValue::Float(_))
            | Some(value @ ConstantValue::String(_))
                if !two_words =>
            {
                Ok(value)
            }
            _ => Err(LinkageError::verify(
                VerifyErrorKind::BadLdc,
                format!("constant pool index {}", index),
            )
            .into()),
        }
    }

    /// Array type for a `newarray` element code
    pub fn read_new_array_type(&mut self) -> Result<Type<'g>> {
        let core = &self.ctx.core;
        let code = self.read_u1()?;
        let element = match code {
            opcodes::T_BOOLEAN => core.boolean,
            opcodes::T_CHAR => core.char,
            opcodes::T_FLOAT => core.float,
            opcodes::T_DOUBLE => core.double,
            opcodes::T_BYTE => core.byte,
            opcodes::T_SHORT => core.short,
            opcodes::T_INT => core.int,
            opcodes::T_LONG => core.long,
            _ => {
                return Err(LinkageError::verify(
                    VerifyErrorKind::BadInstr,
                    format!("bad newarray type {}", code),
                )
                .into())
            }
        };
        Ok(self.ctx.array_of(element))
    }

    /// Class operand
    pub fn read_type(&mut self) -> Result<Type<'g>> {
        let index = self.read_u2()?;
        let pool = self.pool()?;
        verify(pool.tag(index) == Some(Tag::Class), VerifyErrorKind::ExpectClass)?;
        pool.resolve_type(self.ctx, index, self.method.parent)
    }

    /// Class operand of a `new`, along with the placeholder for the uninitialized object
    pub fn read_new_type(&mut self, proxies: &mut ProxyTable<'g>) -> Result<(Type<'g>, Type<'g>)> {
        let class = self.read_type()?;
        let proxy = proxies.proxy_for(self.ctx, self.last_ip as u16);
        proxies.bind(proxy, class)?;
        Ok((proxy, class))
    }

    pub fn read_field(&mut self, is_static: bool) -> Result<&'g FieldData<'g>> {
        let index = self.read_u2()?;
        let pool = self.pool()?;
        verify(pool.tag(index) == Some(Tag::FieldRef), VerifyErrorKind::ExpectFieldRef)?;
        pool.resolve_field(self.ctx, index, self.method.parent, is_static)
    }

    pub fn read_method(&mut self, is_static: bool) -> Result<&'g MethodData<'g>> {
        let index = self.read_u2()?;
        let pool = self.pool()?;
        verify(
            matches!(
                pool.tag(index),
                Some(Tag::MethodRef) | Some(Tag::InterfaceMethodRef)
            ),
            VerifyErrorKind::ExpectMethodRef,
        )?;
        pool.resolve_method(self.ctx, index, self.method.parent, is_static)
    }

    fn check_slot(&self, slot: usize, width: usize) -> Result<usize> {
        verify_with(
            slot + width <= self.max_locals,
            VerifyErrorKind::LocalsOverflow,
            || format!("{} is more than {}", slot + width, self.max_locals),
        )?;
        Ok(slot)
    }

    /// Local index from a 1 byte operand
    pub fn read_slot1(&mut self, width: usize) -> Result<usize> {
        let slot = self.read_u1()? as usize;
        self.check_slot(slot, width)
    }

    /// Local index from a 2 byte operand (after `wide`)
    pub fn read_slot2(&mut self, width: usize) -> Result<usize> {
        let slot = self.read_u2()? as usize;
        self.check_slot(slot, width)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{MemoryClassPath, MethodAccessFlags, StackMapEntry};
    use crate::ir::{HandlerEntry, Target};
    use crate::model::ContextArenas;
    use crate::settings::Settings;
    use std::cell::RefCell;

    fn method<'g>(ctx: &TranslationContext<'g>) -> &'g MethodData<'g> {
        ctx.add_method(MethodData {
            parent: ctx.core.object,
            name: String::from("run"),
            descriptor: String::from("()V"),
            access_flags: MethodAccessFlags::STATIC,
            parameters: vec![],
            return_type: ctx.core.void,
            exceptions: vec![],
            slot: 0,
            holder: RefCell::new(None),
        })
    }

    fn target<'g>(ir: &mut MethodIr<'g>, address: u16) -> TargetId {
        ir.add_target(Target::new(StackMapEntry {
            address,
            locals: vec![],
            physical_locals: vec![],
            stack: vec![],
        }))
    }

    #[test]
    fn pseudo_opcode_order() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(&arenas, Settings::default(), Box::new(MemoryClassPath::new()));
        let mut ir = MethodIr::new();
        let branch = target(&mut ir, 4);
        let handler = target(&mut ir, 8);
        ir[handler].exception_type = Some(ctx.core.throwable);
        let entry = |start_pc, end_pc| HandlerEntry {
            start: None,
            end: None,
            entry: None,
            target: handler,
            catch_type: ctx.core.throwable,
            start_pc,
            end_pc,
            handler_pc: 8,
        };
        let inner = ir.handlers.add(entry(0, 4));
        let outer = ir.handlers.add(entry(0, 4));

        let list = address_list(&ir);
        assert_eq!(
            list,
            vec![
                (0, Bytecode::HandlerStart(outer)),
                (0, Bytecode::HandlerStart(inner)),
                (4, Bytecode::HandlerEnd(inner)),
                (4, Bytecode::HandlerEnd(outer)),
                (4, Bytecode::BranchTarget(branch)),
                (8, Bytecode::ExceptionTarget(handler)),
            ]
        );
    }

    #[test]
    fn interleaves_pseudo_opcodes() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(&arenas, Settings::default(), Box::new(MemoryClassPath::new()));
        let method = method(&ctx);
        let mut ir = MethodIr::new();
        let loop_head = target(&mut ir, 1);

        // nop; goto -0 (to itself)
        let code = [opcodes::NOP, opcodes::GOTO, 0, 0];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 0, address_list(&ir));
        assert_eq!(stream.next().unwrap(), Some(Bytecode::Opcode(opcodes::NOP)));
        assert_eq!(stream.next().unwrap(), Some(Bytecode::BranchTarget(loop_head)));
        assert_eq!(stream.next().unwrap(), Some(Bytecode::Opcode(opcodes::GOTO)));
        assert_eq!(stream.last_ip(), 1);
        assert_eq!(stream.read_target2(&ir).unwrap(), loop_head);
        assert_eq!(stream.next().unwrap(), None);
        assert_eq!(stream.instruction_count(), 2);
    }

    #[test]
    fn target_in_the_middle_of_an_instruction() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(&arenas, Settings::default(), Box::new(MemoryClassPath::new()));
        let method = method(&ctx);
        let mut ir = MethodIr::new();
        target(&mut ir, 1);

        let code = [opcodes::BIPUSH, 7, opcodes::RETURN];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 0, address_list(&ir));
        stream.next().unwrap();
        stream.read_i1().unwrap();
        let err = stream.next().unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::BadStackMap));
    }

    #[test]
    fn operand_checks() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(&arenas, Settings::default(), Box::new(MemoryClassPath::new()));
        let method = method(&ctx);
        let ir = MethodIr::new();

        // goto to an address without a stack map entry
        let code = [opcodes::GOTO, 0, 3, opcodes::RETURN];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 2, vec![]);
        stream.next().unwrap();
        let err = stream.read_target2(&ir).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::TargetBadType));

        // lload 1 with two locals
        let code = [opcodes::LLOAD, 1];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 2, vec![]);
        stream.next().unwrap();
        let err = stream.read_slot1(2).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::LocalsOverflow));

        // sipush missing its second byte
        let code = [opcodes::SIPUSH, 1];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 0, vec![]);
        stream.next().unwrap();
        let err = stream.read_i2().unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::MiddleOfByteCode));

        // tableswitch with non-zero padding
        let code = [opcodes::ICONST_0, opcodes::TABLESWITCH, 0, 1];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 0, vec![]);
        stream.next().unwrap();
        stream.next().unwrap();
        let err = stream.align().unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::ExpectZero));

        let code = [opcodes::NEWARRAY, 12];
        let mut stream = BytecodeStream::new(&ctx, method, &code, 0, vec![]);
        stream.next().unwrap();
        assert!(stream.read_new_array_type().is_err());
    }
}
