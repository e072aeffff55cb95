use super::frame::{Frame, FrameFlags};
use super::liveness::ControlFlowGraph;
use crate::classfile::LocalVariableTable;
use crate::errors::{assert_that, AssertionFailed, Result};
use crate::ir::{dispatch, InsnId, InsnKind, InstructionVisitor, InvokeForm, MethodIr};
use crate::model::{MethodData, TranslationContext};

/// Re-derive the local of every load, store and increment from its javac slot
///
/// The method is emulated block by block with a frame that allocates a new local per store and
/// merges the locals meeting at each target. Since the stack maps were pruned to the live slots,
/// a slot holding unrelated values on either side of a join ends up as separate locals.
pub fn reallocate<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    ir: &mut MethodIr<'g>,
    cfg: &ControlFlowGraph,
    max_locals: usize,
    local_variables: Option<&LocalVariableTable>,
) -> Result<()> {
    for target in ir.target_ids().collect::<Vec<_>>() {
        ir[target].reset_locals();
    }
    let frame = Frame::new(
        ctx,
        method,
        ir,
        None,
        max_locals,
        FrameFlags::MERGE_LOCALS | FrameFlags::REUSABLE_LOCALS,
        local_variables,
    )?;
    let mut reallocator = Reallocator { ctx, frame };

    let mut fell_through = true;
    for idx in 0..cfg.blocks.len() {
        fell_through = reallocator.visit_block(ir, cfg, idx, fell_through)?;
    }
    reallocator.frame.finish(ir)?;
    log::trace!("re-allocated locals of {}:\n{:?}", method, ir);
    Ok(())
}

struct Reallocator<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    frame: Frame<'a, 'g>,
}

impl<'a, 'g> Reallocator<'a, 'g> {
    /// Emulate one block, returning whether control falls out of its end
    fn visit_block(
        &mut self,
        ir: &mut MethodIr<'g>,
        cfg: &ControlFlowGraph,
        idx: usize,
        fell_through: bool,
    ) -> Result<bool> {
        let block = &cfg.blocks[idx];
        if let Some(target) = block.target(ir) {
            if !fell_through {
                if ir[target].is_exception_target() {
                    while self.frame.stack_size() > 0 {
                        self.frame.pop(ir, self.ctx.core.universe)?;
                    }
                }
                self.frame.reinitialize(ir, target)?;
            }
            self.frame.merge_with_target(ir, target)?;
        }

        let mut next = Some(block.start);
        while let Some(insn) = next {
            self.frame.log_state(ir);
            log::trace!("{:>4}: {}", ir[insn].reloc_ip, ir[insn]);
            dispatch(self, ir, insn)?;
            for opcode in ir[insn].dup_swaps.clone() {
                self.frame.dup_swap(ir, opcode)?;
            }
            if insn == block.end {
                break;
            }
            next = ir.next(insn);
        }
        assert_that(next == Some(block.end), "block end not reached")?;

        let falls_through = ir[block.end].kind.falls_through();
        let fall_through_block = cfg.next_block(idx).filter(|_| falls_through);
        for &successor in &block.successors {
            if Some(successor) == fall_through_block {
                continue;
            }
            if let Some(target) = cfg.blocks[successor].target(ir) {
                self.frame.merge_with_target(ir, target)?;
            }
        }
        Ok(falls_through)
    }

    /// Pop the operands of an instruction, narrowing the locals they were loaded from
    fn pop_operands(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        for operand in ir[id].kind.operands().into_iter().rev() {
            let ty = ir[operand].ty;
            let popped = self.frame.pop(ir, ty)?;
            self.frame.narrow_local_type(ir, popped, ty, true)?;
        }
        Ok(())
    }

    fn push_result(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        if ir[id].pushes_value() {
            self.frame.push(ir, id, false)?;
        }
        Ok(())
    }

    fn javac_index(&self, ir: &MethodIr<'g>, id: InsnId) -> Result<(usize, Option<String>)> {
        let local = ir[id]
            .kind
            .local()
            .ok_or_else(|| AssertionFailed::new("local instruction without a local"))?;
        let index = ir[local]
            .javac_index
            .ok_or_else(|| AssertionFailed::new("temporary before re-allocation"))?;
        Ok((index as usize, ir[local].name.clone()))
    }
}

impl<'a, 'g> InstructionVisitor<'g> for Reallocator<'a, 'g> {
    fn visit_instruction(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        self.pop_operands(ir, id)?;
        self.push_result(ir, id)
    }

    fn visit_load_local(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (javac_index, _) = self.javac_index(ir, id)?;
        let old = ir[id].kind.local().map(|local| ir[local].ty);
        let basic_type = match old {
            Some(ty) if ty.is_primitive() => ty,
            _ => self.ctx.core.universe,
        };
        let local = self.frame.get_local(ir, basic_type, javac_index)?;
        if ir[local].ty == self.ctx.core.init_object {
            ir[id].ty = self.ctx.core.init_object;
        }
        ir.set_insn_local(id, local);
        self.frame.push(ir, id, false)
    }

    fn visit_store_local(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (javac_index, name) = self.javac_index(ir, id)?;
        let value = match ir[id].kind {
            InsnKind::StoreLocal { value, .. } => value,
            _ => return Err(AssertionFailed::new("not a store").into()),
        };
        let value_type = ir[value].ty;
        let popped = self.frame.pop(ir, value_type)?;
        self.frame.narrow_local_type(ir, popped, value_type, true)?;
        let ty = self.ctx.local_type(ir[popped].ty);
        self.frame.verify_local_index(ty, javac_index)?;
        let ip = ir[id].original_ip;
        let local = self
            .frame
            .allocate_local(ir, ty, javac_index as u16, Some(ip), name);
        self.frame.set_local(ir, local, javac_index)?;
        ir.set_insn_local(id, local);
        Ok(())
    }

    fn visit_inc_dec_local(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let (javac_index, _) = self.javac_index(ir, id)?;
        let local = self.frame.get_local(ir, self.ctx.core.int, javac_index)?;
        ir.set_insn_local(id, local);
        Ok(())
    }

    fn visit_invoke(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let init_args = match &ir[id].kind {
            InsnKind::Invoke {
                form: InvokeForm::Init,
                args,
                ..
            } => Some(args.len()),
            _ => None,
        };
        if let Some(count) = init_args {
            let receiver = self
                .frame
                .stack_size()
                .checked_sub(count)
                .and_then(|position| self.frame.peek_at(position))
                .ok_or_else(|| AssertionFailed::new("constructor call without a receiver"))?;
            if ir[receiver].ty == self.ctx.core.init_object {
                let parent = self.frame.method().parent;
                self.frame.rename_init_to(ir, parent);
            }
        }
        self.pop_operands(ir, id)?;
        self.push_result(ir, id)
    }

    fn visit_load_exception(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        self.frame.push(ir, id, false)
    }

    fn visit_phi(&mut self, _ir: &mut MethodIr<'g>, _id: InsnId) -> Result<()> {
        Ok(())
    }

    fn visit_handler_enter(&mut self, _ir: &mut MethodIr<'g>, _id: InsnId) -> Result<()> {
        Ok(())
    }

    fn visit_handler_exit(&mut self, _ir: &mut MethodIr<'g>, _id: InsnId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{
        opcodes, BinaryReader, ConstantPool, MemoryClassPath, MethodAccessFlags,
    };
    use crate::ir::LocalId;
    use crate::model::{BytecodeHolder, ContextArenas};
    use crate::settings::Settings;
    use crate::translate::{graph_builder, liveness};
    use std::cell::RefCell;
    use std::rc::Rc;

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

    fn holder(code: Vec<u8>, max_locals: u16, stack_map: Vec<u8>) -> BytecodeHolder {
        BytecodeHolder {
            code,
            max_stack: 1,
            max_locals,
            handlers: vec![],
            stack_map: Some(stack_map),
            line_numbers: None,
            local_variables: None,
            liveness: None,
        }
    }

    fn store_locals(ir: &MethodIr) -> Vec<LocalId> {
        ir.ids()
            .into_iter()
            .filter(|id| matches!(ir[*id].kind, InsnKind::StoreLocal { .. }))
            .filter_map(|id| ir[id].kind.local())
            .collect()
    }

    #[test]
    fn dead_value_at_a_join_gets_its_own_local() {
        with_context(|ctx| {
            let method = static_method(ctx, "()V");
            // x = 0; do { y = 1; } while (y == 0); with slot 0 typed at the loop header
            let code = vec![
                opcodes::ICONST_0,
                opcodes::ISTORE_0,
                opcodes::ICONST_1,
                opcodes::ISTORE_0,
                opcodes::ILOAD_0,
                opcodes::IFEQ,
                0xFF,
                0xFD,
                opcodes::RETURN,
            ];
            let holder = holder(code, 1, vec![0, 1, 0, 2, 0, 1, 1, 0, 0]);
            let mut ir = graph_builder::build(ctx, method, &holder, None).unwrap();
            let cfg = liveness::analyse(ctx, method, &mut ir, 1, None).unwrap();
            assert!(cfg.changed_stack_maps);
            reallocate(ctx, method, &mut ir, &cfg, 1, None).unwrap();

            let stores = store_locals(&ir);
            assert_eq!(stores.len(), 2);
            assert_ne!(ir.merge_root(stores[0]), ir.merge_root(stores[1]));
            let load = ir
                .ids()
                .into_iter()
                .find(|id| matches!(ir[*id].kind, InsnKind::LoadLocal { .. }))
                .unwrap();
            assert_eq!(ir[load].kind.local(), Some(stores[1]));
        })
    }

    #[test]
    fn live_value_at_a_join_is_merged() {
        with_context(|ctx| {
            let method = static_method(ctx, "()V");
            // i = 0; do { i = i + 1... } while (i != 0) written with two stores to slot 0
            let code = vec![
                opcodes::ICONST_0,
                opcodes::ISTORE_0,
                opcodes::ILOAD_0,
                opcodes::ISTORE_0,
                opcodes::ILOAD_0,
                opcodes::IFNE,
                0xFF,
                0xFD,
                opcodes::RETURN,
            ];
            let holder = holder(code, 1, vec![0, 1, 0, 2, 0, 1, 1, 0, 0]);
            let mut ir = graph_builder::build(ctx, method, &holder, None).unwrap();
            let cfg = liveness::analyse(ctx, method, &mut ir, 1, None).unwrap();
            assert!(!cfg.changed_stack_maps);
            reallocate(ctx, method, &mut ir, &cfg, 1, None).unwrap();

            let stores = store_locals(&ir);
            assert_eq!(stores.len(), 2);
            assert_eq!(ir.merge_root(stores[0]), ir.merge_root(stores[1]));
        })
    }

    #[test]
    fn parameters_are_reallocated() {
        with_context(|ctx| {
            let method = static_method(ctx, "(JI)I");
            let code = vec![opcodes::ILOAD_2, opcodes::IRETURN];
            let mut holder = holder(code, 3, vec![]);
            holder.stack_map = None;
            let mut ir = graph_builder::build(ctx, method, &holder, None).unwrap();
            let before = ir.parameters.clone();
            let cfg = liveness::analyse(ctx, method, &mut ir, 3, None).unwrap();
            reallocate(ctx, method, &mut ir, &cfg, 3, None).unwrap();

            assert_eq!(ir.parameters.len(), 3);
            assert!(ir.parameters[1].is_none());
            assert_ne!(ir.parameters[2], before[2]);
            let load = ir.head().unwrap();
            assert_eq!(ir[load].kind.local(), ir.parameters[2]);
        })
    }
}
