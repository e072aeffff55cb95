//! Rewrites the IR so that values only live on the operand stack between a producer and the
//! consumer right after it
//!
//! Anything else (duped values, values merged at join points, values that survive a basic block
//! boundary or a call) is stored into its temporary local by the producer and loaded back right
//! before the consumer. Loads of locals and constants are cheaper to repeat than to spill, so
//! those get moved down to their consumer instead.

use super::statistics::Statistics;
use crate::errors::{assert_that, AssertionFailed, Result};
use crate::ir::{
    visit_all, InsnFlags, InsnId, InsnKind, Instruction, InstructionVisitor, InvokeForm, LocalId,
    MethodIr,
};
use crate::model::{MethodData, TranslationContext, Type};
use crate::util::BitSet;
use std::collections::HashMap;

/// Transform the IR of a method, returning its locals in slot order
///
/// Only the first word of a two word local is listed; every local has its `squawk_index` set.
pub fn transform<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    ir: &mut MethodIr<'g>,
) -> Result<Vec<LocalId>> {
    let mut transformer = GraphTransformer {
        ctx,
        method,
        consumers: HashMap::new(),
    };
    visit_all(&mut transformer, ir)?;
    transformer.insert_spills(ir)?;

    ir.logically_relocate();
    let mut locals = transformer.used_locals(ir)?;
    if ctx.settings.optimize_locals {
        locals = transformer.pack_disjoint_locals(ir, locals)?;
    }
    transformer.sort_locals(ir, &mut locals);

    while transformer.peephole(ir)? {}

    let locals = transformer.assign_slots(ir, locals)?;
    log::trace!("transformed {}:\n{:?}", method, ir);
    log::debug!("{}: {} locals after transformation", method, locals.len());
    Ok(locals)
}

struct GraphTransformer<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    method: &'g MethodData<'g>,

    /// Instruction consuming each fill
    consumers: HashMap<InsnId, InsnId>,
}

impl<'a, 'g> InstructionVisitor<'g> for GraphTransformer<'a, 'g> {
    /// Make sure every operand is on top of the stack, in order, when the instruction runs
    fn visit_instruction(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
        let operands = ir[id].kind.operands();
        let mut filled = false;
        for (position, operand) in operands.into_iter().enumerate() {
            if !filled && self.connects_without_spilling(ir, operand, id) {
                continue;
            }
            // Everything pushed after a fill has to be pushed after it too
            filled = true;
            if self.hoist(ir, operand, id) {
                continue;
            }
            let fill = self.fill(ir, operand, id)?;
            if let Some(slot) = ir[id].kind.operands_mut().into_iter().nth(position) {
                *slot = fill;
            }
        }
        Ok(())
    }
}

impl<'a, 'g> GraphTransformer<'a, 'g> {
    /// Can the value stay on the stack from its producer to its consumer?
    fn connects_without_spilling(&self, ir: &mut MethodIr<'g>, from: InsnId, to: InsnId) -> bool {
        if !ir[from].is_linked() {
            return false;
        }
        let is_init = matches!(
            ir[to].kind,
            InsnKind::Invoke {
                form: InvokeForm::Init,
                ..
            }
        );
        if ir.next(from) == Some(to)
            && matches!(ir[from].kind, InsnKind::NewObject)
            && is_init
            && !ir[from].was_duped()
        {
            ir[from].flags.remove(InsnFlags::SPILLS);
            return true;
        }
        let mut cursor = Some(from);
        while let Some(insn) = cursor {
            if insn == to {
                return true;
            }
            let current = &ir[insn];
            if current.was_duped()
                || current.spills()
                || current.kind.is_block_exit()
                || ir.was_merged(insn)
            {
                return false;
            }
            cursor = ir.next(insn);
        }
        false
    }

    /// Move a load of a local or a constant down to its consumer, if that is safe
    fn hoist(&self, ir: &mut MethodIr<'g>, producer: InsnId, consumer: InsnId) -> bool {
        if !ir[producer].is_linked() || ir[producer].was_duped() || ir.was_merged(producer) {
            return false;
        }
        let movable = match ir[producer].kind {
            InsnKind::LoadLocal { local } => {
                is_straight_line(ir, producer, consumer)
                    && !is_stored_between(ir, producer, consumer, local)
            }
            InsnKind::LoadConstant(_) | InsnKind::LoadConstantObject(_) => {
                is_straight_line(ir, producer, consumer)
            }
            _ => false,
        };
        if !movable {
            return false;
        }
        ir[producer].flags.remove(InsnFlags::SPILLS);
        ir.remove(producer);
        ir.insert_before(consumer, producer);
        if let Some(local) = ir[producer].kind.local() {
            ir.set_insn_local(producer, local);
        }
        true
    }

    /// Make the producer spill its value and reload it right before the consumer
    fn fill(&mut self, ir: &mut MethodIr<'g>, producer: InsnId, consumer: InsnId) -> Result<InsnId> {
        let core = &self.ctx.core;
        let temp = ir[producer]
            .temporary
            .ok_or_else(|| AssertionFailed::new("spilled value without a temporary"))?;
        let temp_type = ir[temp].ty;
        if temp_type == core.null_object {
            ir[temp].ty = match &ir[consumer].kind {
                InsnKind::StoreLocal { local, .. } => ir[*local].ty,
                InsnKind::LoadField { field, .. } => field.parent,
                InsnKind::StoreField {
                    field, receiver, ..
                } if *receiver == Some(producer) => field.parent,
                InsnKind::StoreField { field, .. } if field.ty.is_reference() => field.ty,
                _ => core.object,
            };
        } else if temp_type == core.init_object {
            ir[temp].ty = self.method.parent;
        }

        ir[producer].flags.insert(InsnFlags::SPILLS);
        let mut insn = Instruction::new(
            InsnKind::LoadLocal { local: temp },
            ir[producer].ty,
            ir[consumer].original_ip,
        );
        insn.line = ir[consumer].line;
        insn.loop_depth = ir[consumer].loop_depth;
        insn.original = Some(producer);
        insn.temporary = Some(temp);
        let fill = ir.create(insn);
        ir.insert_before(consumer, fill);
        ir.set_insn_local(fill, temp);
        self.consumers.insert(fill, consumer);
        Ok(fill)
    }

    /// Store spilled values into their temporaries and lower empty lookup switches
    fn insert_spills(&mut self, ir: &mut MethodIr<'g>) -> Result<()> {
        let ctx = self.ctx;
        let statistics = &ctx.statistics;
        for id in ir.ids() {
            if !ir[id].is_linked() {
                continue;
            }
            if ir[id].spills() {
                let temp = ir[id]
                    .temporary
                    .ok_or_else(|| AssertionFailed::new("spilled value without a temporary"))?;

                // The only consumer reloads it straight away
                if !ir[id].was_duped() && !ir.was_merged(id) {
                    if let Some(next) = ir.next(id) {
                        if matches!(ir[next].kind, InsnKind::LoadLocal { local } if local == temp) {
                            self.unfill(ir, next, id);
                            ir[id].flags.remove(InsnFlags::SPILLS);
                            Statistics::bump(&statistics.removed, 1);
                            continue;
                        }
                    }
                }

                if ir[temp].use_defs.is_empty() {
                    let ty = self.real_temporary_type(ir[temp].ty);
                    ir[temp].ty = ty;
                }
                let mut store = Instruction::new(
                    InsnKind::StoreLocal {
                        local: temp,
                        value: id,
                    },
                    self.ctx.core.void,
                    ir[id].original_ip,
                );
                store.line = ir[id].line;
                store.loop_depth = ir[id].loop_depth;
                store.original = Some(id);
                let store = ir.create(store);
                ir.insert_after(id, store);
                ir.set_insn_local(store, temp);
                Statistics::bump(&statistics.spills, 1);
            }
            self.lower_empty_lookup_switch(ir, id);
        }
        Ok(())
    }

    /// A `lookupswitch` without cases always jumps to its default
    fn lower_empty_lookup_switch(&mut self, ir: &mut MethodIr<'g>, id: InsnId) {
        let (key, default) = match &ir[id].kind {
            InsnKind::LookupSwitch {
                key,
                default,
                cases,
            } if cases.is_empty() => (*key, *default),
            _ => return,
        };
        let core = &self.ctx.core;
        let trivial = ir[key].is_linked()
            && matches!(
                ir[key].kind,
                InsnKind::LoadLocal { .. } | InsnKind::LoadConstant(_)
            );
        if trivial {
            ir.remove(key);
            Statistics::bump(&self.ctx.statistics.removed, 1);
        } else {
            let mut pop = Instruction::new(InsnKind::Pop { value: key }, core.void, ir[id].original_ip);
            pop.line = ir[id].line;
            let pop = ir.create(pop);
            ir.insert_before(id, pop);
        }
        let mut goto = Instruction::new(
            InsnKind::Goto { target: default },
            core.void,
            ir[id].original_ip,
        );
        goto.line = ir[id].line;
        goto.loop_depth = ir[id].loop_depth;
        let goto = ir.create(goto);
        ir.insert_before(id, goto);
        ir.remove(id);
    }

    /// Drop a fill, handing its consumer the value it reloaded
    fn unfill(&mut self, ir: &mut MethodIr<'g>, fill: InsnId, value: InsnId) {
        ir.remove(fill);
        if let Some(consumer) = self.consumers.remove(&fill) {
            for operand in ir[consumer].kind.operands_mut() {
                if *operand == fill {
                    *operand = value;
                }
            }
        }
    }

    fn real_temporary_type(&self, ty: Type<'g>) -> Type<'g> {
        let core = &self.ctx.core;
        if ty == core.null_object {
            core.object
        } else if ty == core.init_object {
            self.method.parent
        } else if ty == core.byte_or_boolean {
            core.byte
        } else {
            ty
        }
    }

    /// Locals referenced by the parameters or by a linked instruction, in order of appearance
    fn used_locals(&self, ir: &mut MethodIr<'g>) -> Result<Vec<LocalId>> {
        let mut used = vec![];
        let parameters: Vec<LocalId> = ir.parameters.iter().flatten().copied().collect();
        let referenced = ir.ids().into_iter().filter_map(|id| ir[id].kind.local());
        let candidates: Vec<LocalId> = parameters.into_iter().chain(referenced).collect();
        for local in candidates {
            let local = ir.merge_root(local);
            if ir[local].used {
                continue;
            }
            let ty = self.real_temporary_type(ir[local].ty);
            assert_that(
                !ty.is_second_word() && !ty.is_bogus(),
                "local of a verifier-only type",
            )?;
            ir[local].ty = ty;
            ir[local].used = true;
            used.push(local);
        }
        Ok(used)
    }

    /// Parameters first, then the busiest locals
    fn sort_locals(&self, ir: &MethodIr<'g>, locals: &mut [LocalId]) {
        locals.sort_by(|a, b| {
            let (a_local, b_local) = (&ir[*a], &ir[*b]);
            match (a_local.parameter, b_local.parameter) {
                (Some(a_param), Some(b_param)) => a_param.cmp(&b_param),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => b_local
                    .use_defs
                    .len()
                    .cmp(&a_local.use_defs.len())
                    .then_with(|| a_local.name.cmp(&b_local.name))
                    .then_with(|| a.cmp(b)),
            }
        });
    }

    /// Share a slot between locals of the same type whose live ranges do not intersect
    fn pack_disjoint_locals(
        &self,
        ir: &mut MethodIr<'g>,
        mut locals: Vec<LocalId>,
    ) -> Result<Vec<LocalId>> {
        self.sort_locals(ir, &mut locals);
        let ranges = live_ranges(ir, &locals);
        let mut packed: Vec<(LocalId, BitSet)> = Vec::with_capacity(locals.len());
        for (local, range) in locals.into_iter().zip(ranges) {
            let slot = packed.iter().position(|(merged, merged_range)| {
                ir[*merged].ty == ir[local].ty
                    && !are_two_parameters(ir, *merged, local)
                    && !merged_range.intersects(&range)
            });
            let idx = match slot {
                Some(idx) => idx,
                None => {
                    packed.push((local, range));
                    continue;
                }
            };
            let (mut survivor, mut other) = (packed[idx].0, local);
            if ir[survivor].is_temporary() && !ir[other].is_temporary() {
                std::mem::swap(&mut survivor, &mut other);
            }
            log::trace!("packing {:?} into {:?}", ir[other], ir[survivor]);
            ir.merge_into(survivor, other, false)?;
            packed[idx].0 = survivor;
            packed[idx].1.union_with(&range);
        }
        Ok(packed.into_iter().map(|(local, _)| local).collect())
    }

    /// One round of peephole optimizations, returning whether anything changed
    fn peephole(&mut self, ir: &mut MethodIr<'g>) -> Result<bool> {
        let ctx = self.ctx;
        let statistics = &ctx.statistics;
        let mut changed = false;
        let mut seen_backward_target = false;
        for id in ir.ids() {
            if !ir[id].is_linked() {
                continue;
            }
            match ir[id].kind.clone() {
                InsnKind::Phi { target } => {
                    seen_backward_target |= ir[target].is_backward;
                }
                InsnKind::StoreLocal { local, value } => {
                    if self.remove_store(ir, id, local, value, seen_backward_target) {
                        Statistics::bump(&statistics.removed, 2);
                        changed = true;
                    }
                }
                InsnKind::Goto { target } => {
                    let after = ir.next(id).and_then(|next| ir.real(next));
                    let destination = ir[target].insn.and_then(|insn| ir.real(insn));
                    if after.is_some() && after == destination {
                        ir.remove(id);
                        Statistics::bump(&statistics.removed, 1);
                        changed = true;
                    }
                }
                InsnKind::LoadField {
                    receiver: Some(receiver),
                    ..
                }
                | InsnKind::StoreField {
                    receiver: Some(receiver),
                    ..
                } if ir[id].flags.contains(InsnFlags::RECEIVER) => {
                    if self.is_receiver_load(ir, receiver) {
                        ir.remove(receiver);
                        match &mut ir[id].kind {
                            InsnKind::LoadField { receiver, .. }
                            | InsnKind::StoreField { receiver, .. } => *receiver = None,
                            _ => (),
                        }
                        Statistics::bump(&statistics.removed, 1);
                        changed = true;
                    }
                }
                _ => (),
            }
        }
        Ok(changed)
    }

    /// Remove a store made redundant by the instruction before or after it
    fn remove_store(
        &mut self,
        ir: &mut MethodIr<'g>,
        store: InsnId,
        local: LocalId,
        value: InsnId,
        seen_backward_target: bool,
    ) -> bool {
        let prev = ir.prev(store);

        // The VM clears locals on entry
        if self.ctx.settings.optimize_initializers
            && !seen_backward_target
            && !ir[local].is_merge_parent
            && ir[store].flags.contains(InsnFlags::INITIALIZER)
            && prev == Some(value)
            && matches!(ir[value].kind, InsnKind::LoadConstant(constant) if constant.is_default_value())
        {
            ir.remove(store);
            ir.remove(value);
            ir[local].auto_initialized = true;
            return true;
        }

        if prev == Some(value)
            && matches!(ir[value].kind, InsnKind::LoadLocal { local: loaded } if loaded == local)
        {
            ir.remove(store);
            ir.remove(value);
            return true;
        }

        if let Some(next) = ir.next(store) {
            let reloads = matches!(ir[next].kind, InsnKind::LoadLocal { local: loaded } if loaded == local);
            if reloads
                && ir[local].is_temporary()
                && !ir.was_merged(value)
                && !ir[value].was_duped()
                && self.consumers.contains_key(&next)
            {
                ir.remove(store);
                self.unfill(ir, next, value);
                return true;
            }
        }
        false
    }

    /// Is the instruction a load of `this` that a field access can do without?
    fn is_receiver_load(&self, ir: &MethodIr<'g>, insn: InsnId) -> bool {
        if self.method.is_static()
            || ir.receiver_overwritten
            || !self.ctx.settings.optimize_this_field_access
            || !ir[insn].is_linked()
        {
            return false;
        }
        match ir[insn].kind {
            InsnKind::LoadLocal { local } => ir[ir.merge_root(local)].parameter == Some(0),
            _ => false,
        }
    }

    /// Drop the locals nothing refers to anymore and number the rest densely
    fn assign_slots(&self, ir: &mut MethodIr<'g>, locals: Vec<LocalId>) -> Result<Vec<LocalId>> {
        let mut kept = Vec::with_capacity(locals.len());
        let mut offset: u16 = 0;
        for local in locals {
            if !ir[local].is_parameter() && ir[local].use_defs.is_empty() {
                ir[local].used = false;
                ir[local].squawk_index = None;
                continue;
            }
            ir[local].squawk_index = Some(offset);
            offset += ir[local].words();
            kept.push(local);
        }
        for (word, parameter) in ir.parameters.iter().enumerate() {
            if let Some(parameter) = parameter {
                assert_that(
                    ir[ir.merge_root(*parameter)].squawk_index == Some(word as u16),
                    "parameter out of place",
                )?;
            }
        }
        Ok(kept)
    }
}

/// Is there no control flow into or out of the code between two instructions?
fn is_straight_line(ir: &MethodIr, from: InsnId, to: InsnId) -> bool {
    let mut cursor = Some(from);
    while let Some(insn) = cursor {
        if insn == to {
            return true;
        }
        let kind = &ir[insn].kind;
        if kind.entry_target().is_some() || kind.is_block_exit() {
            return false;
        }
        cursor = ir.next(insn);
    }
    false
}

/// Is a local written between two instructions?
fn is_stored_between(ir: &MethodIr, from: InsnId, to: InsnId, local: LocalId) -> bool {
    let mut cursor = Some(from);
    while let Some(insn) = cursor {
        if insn == to {
            return false;
        }
        let kind = &ir[insn].kind;
        if kind.is_definition() && kind.local() == Some(local) {
            return true;
        }
        cursor = ir.next(insn);
    }
    true
}

fn are_two_parameters(ir: &MethodIr, a: LocalId, b: LocalId) -> bool {
    matches!((ir[a].parameter, ir[b].parameter), (Some(a), Some(b)) if a != b)
}

/// Positions (relocated addresses) at which each local is live or written
fn live_ranges(ir: &MethodIr, locals: &[LocalId]) -> Vec<BitSet> {
    let index: HashMap<LocalId, usize> = locals
        .iter()
        .enumerate()
        .map(|(idx, local)| (*local, idx))
        .collect();
    let insns = ir.ids();
    let count = insns.len();

    let mut successors = vec![vec![]; count];
    let mut uses = vec![BitSet::new(locals.len()); count];
    let mut defs = vec![BitSet::new(locals.len()); count];
    let mut active = vec![];
    for (position, &id) in insns.iter().enumerate() {
        let kind = &ir[id].kind;
        match kind {
            InsnKind::HandlerEnter { handler } => active.push(*handler),
            InsnKind::HandlerExit { handler } => active.retain(|active| active != handler),
            _ => (),
        }
        if kind.falls_through() && position + 1 < count {
            successors[position].push(position + 1);
        }
        for target in kind.targets() {
            if let Some(insn) = ir[target].insn {
                successors[position].push(ir[insn].reloc_ip as usize);
            }
        }
        if kind.can_trap() || matches!(kind, InsnKind::Throw { .. }) {
            for handler in &active {
                let entry = ir.handlers.get(*handler).and_then(|entry| ir[entry.target].insn);
                if let Some(insn) = entry {
                    successors[position].push(ir[insn].reloc_ip as usize);
                }
            }
        }
        if let Some(local) = kind.local() {
            if let Some(&idx) = index.get(&ir.merge_root(local)) {
                if kind.is_use() {
                    uses[position].set(idx);
                }
                if kind.is_definition() {
                    defs[position].set(idx);
                }
            }
        }
    }

    let mut live_in = vec![BitSet::new(locals.len()); count];
    let mut changed = true;
    while changed {
        changed = false;
        for position in (0..count).rev() {
            let mut live = BitSet::new(locals.len());
            for &successor in &successors[position] {
                if let Some(successor_in) = live_in.get(successor) {
                    live.union_with(successor_in);
                }
            }
            live.subtract_with(&defs[position]);
            live.union_with(&uses[position]);
            if live != live_in[position] {
                live_in[position] = live;
                changed = true;
            }
        }
    }

    let mut ranges = vec![BitSet::new(count); locals.len()];
    for position in 0..count {
        for idx in live_in[position].iter().chain(defs[position].iter()) {
            ranges[idx].set(position);
        }
    }
    ranges
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{
        opcodes, BinaryReader, ConstantPool, MemoryClassPath, MethodAccessFlags,
    };
    use crate::model::{BytecodeHolder, ContextArenas};
    use crate::settings::Settings;
    use crate::translate::{graph_builder, liveness, reallocator};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn with_settings<F: for<'g> FnOnce(&TranslationContext<'g>)>(settings: Settings, f: F) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(&arenas, settings, Box::new(MemoryClassPath::new()));
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

    fn run<'g>(
        ctx: &TranslationContext<'g>,
        method: &'g MethodData<'g>,
        code: Vec<u8>,
        max_locals: u16,
        stack_map: Option<Vec<u8>>,
    ) -> (MethodIr<'g>, Vec<LocalId>) {
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
        let locals = transform(ctx, method, &mut ir).unwrap();
        (ir, locals)
    }

    fn kinds(ir: &MethodIr) -> Vec<&'static str> {
        ir.ids().into_iter().map(|id| ir[id].kind.mnemonic()).collect()
    }

    #[test]
    fn straight_line_values_stay_on_the_stack() {
        with_settings(Settings::default(), |ctx| {
            let method = static_method(ctx, "(II)I");
            let code = vec![opcodes::ILOAD_0, opcodes::ILOAD_1, opcodes::IADD, opcodes::IRETURN];
            let (ir, locals) = run(ctx, method, code, 2, None);
            assert_eq!(kinds(&ir), vec!["load", "load", "arithmetic", "return"]);
            assert_eq!(locals.len(), 2);
            assert_eq!(ctx.statistics.spills.get(), 0);
        })
    }

    #[test]
    fn duped_value_is_spilled_and_filled() {
        let settings = Settings {
            optimize_locals: false,
            ..Settings::default()
        };
        with_settings(settings, |ctx| {
            let method = static_method(ctx, "(I)I");
            let code = vec![opcodes::ILOAD_0, opcodes::DUP, opcodes::IMUL, opcodes::IRETURN];
            let (ir, locals) = run(ctx, method, code, 1, None);
            assert_eq!(
                kinds(&ir),
                vec!["load", "store", "load", "load", "arithmetic", "return"]
            );
            assert_eq!(locals.len(), 2);
            assert!(ir[locals[1]].is_temporary());
            assert_eq!(ir[locals[1]].squawk_index, Some(1));
            assert_eq!(ctx.statistics.spills.get(), 1);
        })
    }

    #[test]
    fn temporary_shares_a_dead_parameter_slot() {
        with_settings(Settings::default(), |ctx| {
            let method = static_method(ctx, "(I)I");
            let code = vec![opcodes::ILOAD_0, opcodes::DUP, opcodes::IMUL, opcodes::IRETURN];
            let (ir, locals) = run(ctx, method, code, 1, None);

            // The spill now stores the parameter back into its own slot, which goes away
            assert_eq!(kinds(&ir), vec!["load", "load", "arithmetic", "return"]);
            assert_eq!(locals.len(), 1);
            assert!(ir[locals[0]].is_merge_parent);
            let head = ir.head().unwrap();
            assert_eq!(ir[head].kind.local(), Some(locals[0]));
        })
    }

    #[test]
    fn disjoint_locals_share_a_slot() {
        with_settings(Settings::default(), |ctx| {
            let method = static_method(ctx, "(I)I");

            // a = 2; b = a * a; c = 3; return b * c + b + x
            let code = vec![
                opcodes::ICONST_2,
                opcodes::ISTORE_1,
                opcodes::ILOAD_1,
                opcodes::ILOAD_1,
                opcodes::IMUL,
                opcodes::ISTORE_2,
                opcodes::ICONST_3,
                opcodes::ISTORE_3,
                opcodes::ILOAD_2,
                opcodes::ILOAD_3,
                opcodes::IMUL,
                opcodes::ILOAD_2,
                opcodes::IADD,
                opcodes::ILOAD_0,
                opcodes::IADD,
                opcodes::IRETURN,
            ];
            let (ir, locals) = run(ctx, method, code, 4, None);
            let slots: Vec<Option<u16>> = ir
                .ids()
                .into_iter()
                .filter(|id| matches!(ir[*id].kind, InsnKind::StoreLocal { .. }))
                .filter_map(|id| ir[id].kind.local())
                .map(|local| ir[ir.merge_root(local)].squawk_index)
                .collect();
            assert_eq!(slots.len(), 3);
            let (a, b, c) = (slots[0], slots[1], slots[2]);

            // `a` is dead once `b` is written; `b` and `c` are live together, as is `x` throughout
            assert_eq!(a, b);
            assert_ne!(b, c);
            assert!(a.is_some() && c.is_some());
            assert_ne!(a, Some(0));
            assert_ne!(c, Some(0));
            assert_eq!(locals.len(), 3);
        })
    }

    #[test]
    fn empty_lookupswitch_becomes_a_jump() {
        with_settings(Settings::default(), |ctx| {
            let method = static_method(ctx, "(I)V");
            let code = vec![
                opcodes::ILOAD_0,
                opcodes::LOOKUPSWITCH,
                0,
                0,
                0,
                0,
                0,
                11,
                0,
                0,
                0,
                0,
                opcodes::RETURN,
            ];
            let stack_map = vec![0, 1, 0, 12, 0, 1, 1, 0, 0];
            let (ir, locals) = run(ctx, method, code, 1, Some(stack_map));

            // The jump lands on the next instruction, so it goes too
            assert_eq!(kinds(&ir), vec!["phi", "return"]);
            assert_eq!(locals.len(), 1);
            assert!(ir[locals[0]].is_parameter());
        })
    }

    #[test]
    fn default_initializer_is_dropped() {
        with_settings(Settings::default(), |ctx| {
            let method = static_method(ctx, "()I");
            let code = vec![opcodes::ICONST_0, opcodes::ISTORE_0, opcodes::ILOAD_0, opcodes::IRETURN];
            let (ir, locals) = run(ctx, method, code, 1, None);
            assert_eq!(kinds(&ir), vec!["load", "return"]);
            assert_eq!(locals.len(), 1);
            assert!(ir[locals[0]].auto_initialized);
        })
    }

    #[test]
    fn initializer_is_kept_when_disabled() {
        let settings = Settings {
            optimize_initializers: false,
            ..Settings::default()
        };
        with_settings(settings, |ctx| {
            let method = static_method(ctx, "()I");
            let code = vec![opcodes::ICONST_0, opcodes::ISTORE_0, opcodes::ILOAD_0, opcodes::IRETURN];
            let (ir, _) = run(ctx, method, code, 1, None);
            assert_eq!(kinds(&ir), vec!["const", "store", "load", "return"]);
        })
    }
}
