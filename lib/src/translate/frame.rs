use crate::classfile::{opcodes, LocalVariableTable};
use crate::errors::{
    assert_that, verify, verify_translatable, verify_with, AssertionFailed, LinkageError, Result,
    VerifyErrorKind,
};
use crate::ir::{
    Constant, InsnFlags, InsnId, InsnKind, Instruction, Local, LocalId, LocalSlot, MethodIr,
    TargetId,
};
use crate::model::{MethodData, TranslationContext, Type};
use crate::util::{OffsetVec, Width};
use bitflags::bitflags;

bitflags! {
    /// How a frame treats locals and stack values
    pub struct FrameFlags: u8 {
        /// A store allocates a new local (so locals may change type across stores)
        const REUSABLE_LOCALS = 0b001;

        /// Every value pushed gets a temporary local to be materialized in
        const ALLOCATE_STACK = 0b010;

        /// Locals meeting at a join point are merged into one
        const MERGE_LOCALS = 0b100;
    }
}

/// Entry of the emulated operand stack
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackSlot {
    pub insn: InsnId,
    pub two_words: bool,
}

impl Width for StackSlot {
    fn width(&self) -> usize {
        if self.two_words {
            2
        } else {
            1
        }
    }
}

/// Emulation of the operand stack and local variables of a method
///
/// The stack holds the instructions that produced each value. It is position indexed, but its
/// depth in words (which is what `max_stack` and the declared bounds use) is tracked alongside.
/// Locals are indexed by javac slot, with a two word local taking up its slot and the next.
pub struct Frame<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    method: &'g MethodData<'g>,
    flags: FrameFlags,
    local_variables: Option<&'a LocalVariableTable>,

    stack: OffsetVec<StackSlot>,

    /// Declared bound on the stack depth in words (`None` when it is being computed)
    max_stack: Option<usize>,
    computed_max_stack: usize,

    locals: Vec<LocalSlot>,

    /// Parameter locals, by javac slot
    parameters: Vec<LocalSlot>,

    /// Every (non temporary) local this frame allocated
    allocated: Vec<LocalId>,
}

impl<'a, 'g> Frame<'a, 'g> {
    /// Set up the frame on method entry, allocating the parameter locals
    pub fn new(
        ctx: &'a TranslationContext<'g>,
        method: &'g MethodData<'g>,
        ir: &mut MethodIr<'g>,
        max_stack: Option<usize>,
        max_locals: usize,
        flags: FrameFlags,
        local_variables: Option<&'a LocalVariableTable>,
    ) -> Result<Frame<'a, 'g>> {
        let mut frame = Frame {
            ctx,
            method,
            flags,
            local_variables,
            stack: OffsetVec::new(),
            max_stack,
            computed_max_stack: 0,
            locals: vec![LocalSlot::Empty; max_locals],
            parameters: vec![],
            allocated: vec![],
        };

        let mut javac_index = 0;
        let mut parameter = 0;
        if !method.is_static() {
            let mut ty = method.parent;
            if method.is_init() && method.parent != ctx.core.object && frame.is_reusing_locals() {
                ty = ctx.core.init_object;
            }
            let local = frame.allocate_local(ir, ty, 0, None, Some(String::from("this")));
            ir[local].parameter = Some(parameter);
            parameter += 1;
            javac_index = frame.set_local(ir, local, javac_index)? + 1;
        }
        for &ty in &method.parameters {
            let ty = ctx.local_type(ty);
            let local = frame.allocate_local(ir, ty, javac_index as u16, Some(0), None);
            ir[local].parameter = Some(parameter);
            parameter += 1;
            javac_index = frame.set_local(ir, local, javac_index)? + 1;
        }
        frame.parameters = frame.locals[..javac_index].to_vec();
        log::trace!(
            "frame for {}: max_stack={:?} max_locals={} flags={:?}",
            method,
            max_stack,
            max_locals,
            flags
        );
        Ok(frame)
    }

    pub fn is_reusing_locals(&self) -> bool {
        self.flags.contains(FrameFlags::REUSABLE_LOCALS)
    }

    pub fn is_allocating_stack(&self) -> bool {
        self.flags.contains(FrameFlags::ALLOCATE_STACK)
    }

    pub fn is_merging_locals(&self) -> bool {
        self.flags.contains(FrameFlags::MERGE_LOCALS)
    }

    pub fn method(&self) -> &'g MethodData<'g> {
        self.method
    }

    /// Number of values on the stack
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Depth of the stack in words
    pub fn stack_words(&self) -> usize {
        self.stack.offset_len().0
    }

    /// Deepest the stack got, in words
    pub fn computed_max_stack(&self) -> usize {
        self.computed_max_stack
    }

    pub fn max_locals(&self) -> usize {
        self.locals.len()
    }

    /// Temporarily raise (or restore) the declared stack bound for synthesized code
    pub fn adjust_max_stack(&mut self, delta: isize) {
        if let Some(max_stack) = self.max_stack.as_mut() {
            *max_stack = (*max_stack as isize + delta).max(0) as usize;
        }
    }

    pub fn push(&mut self, ir: &mut MethodIr<'g>, insn: InsnId, allocate: bool) -> Result<()> {
        let two_words = ir[insn].ty.is_two_words();
        let size = if two_words { 2 } else { 1 };
        if let Some(max_stack) = self.max_stack {
            verify_with(
                self.stack_words() + size <= max_stack,
                VerifyErrorKind::StackOverflow,
                || format!("max_stack = {}", max_stack),
            )?;
        }
        let position = self.stack.len();
        self.stack.push(StackSlot { insn, two_words });
        self.computed_max_stack = self.computed_max_stack.max(self.stack_words());

        if allocate && self.is_allocating_stack() {
            let ty = self.ctx.local_type(ir[insn].ty);
            let temp = ir.add_local(Local::temporary(ty, position, insn));
            ir[insn].temporary = Some(temp);
        }
        if let Some(temp) = ir[insn].temporary {
            if let Some(temp) = ir[temp].temporary.as_mut() {
                temp.references += 1;
            }
        }
        Ok(())
    }

    /// Pop a value, checking that it is assignable to the expected type
    ///
    /// Sub-int expected types are collapsed to `int`.
    pub fn pop(&mut self, ir: &mut MethodIr<'g>, expected: Type<'g>) -> Result<InsnId> {
        let slot = match self.stack.pop() {
            Some(slot) => slot,
            None => return Err(LinkageError::verify(VerifyErrorKind::StackUnderflow, "").into()),
        };
        let expected = self.ctx.local_type(expected);
        let actual = self.ctx.local_type(ir[slot.insn].ty);
        if !self.ctx.is_assignable(actual, expected)? {
            return Err(LinkageError::verify(
                VerifyErrorKind::StackBadType,
                format!("{} is not assignable to {}", actual, expected),
            )
            .into());
        }
        if let Some(temp) = ir[slot.insn].temporary {
            if let Some(temp) = ir[temp].temporary.as_mut() {
                temp.references = temp.references.saturating_sub(1);
            }
        }
        Ok(slot.insn)
    }

    pub fn peek(&self) -> Option<InsnId> {
        self.stack.last().map(|slot| slot.insn)
    }

    /// Value at a position (0 being the bottom of the stack)
    pub fn peek_at(&self, position: usize) -> Option<InsnId> {
        self.stack.get_index(position).map(|slot| slot.insn)
    }

    /// Values on the stack, bottom first
    pub fn stack_values(&self) -> Vec<InsnId> {
        self.stack.iter().map(|slot| slot.insn).collect()
    }

    /// Replace the value at a position (used when merging stack values at a join)
    fn replace_at(&mut self, position: usize, insn: InsnId) {
        if let Some(slot) = self.stack.get_index(position).copied() {
            self.stack.set_index(position, StackSlot { insn, ..slot });
        }
    }

    fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Allocate a new local for a javac slot
    ///
    /// When no name is given, the local variable table is consulted at `ip`.
    pub fn allocate_local(
        &mut self,
        ir: &mut MethodIr<'g>,
        ty: Type<'g>,
        javac_index: u16,
        ip: Option<u32>,
        name: Option<String>,
    ) -> LocalId {
        let name = name.or_else(|| {
            let table = self.local_variables?;
            let ip = ip?;
            table.name_at(ip as u16, javac_index).map(str::to_owned)
        });
        let local = ir.add_local(Local::new(ty, javac_index, name));
        self.allocated.push(local);
        local
    }

    pub fn verify_local_index(&self, ty: Type<'g>, javac_index: usize) -> Result<()> {
        let extra = if ty.is_two_words() { 1 } else { 0 };
        verify(
            javac_index + extra < self.locals.len(),
            VerifyErrorKind::LocalsOverflow,
        )
    }

    pub fn local(&self, javac_index: usize) -> LocalSlot {
        self.locals.get(javac_index).copied().unwrap_or(LocalSlot::Empty)
    }

    /// Type of a javac slot (`BOGUS` when it holds nothing)
    pub fn local_type(&self, ir: &MethodIr<'g>, javac_index: usize) -> Type<'g> {
        match self.local(javac_index) {
            LocalSlot::Empty => self.ctx.core.bogus,
            LocalSlot::Value(local) => ir[local].ty,
            LocalSlot::SecondWord(local) => self
                .ctx
                .second_word_type(ir[local].ty)
                .unwrap_or(self.ctx.core.bogus),
        }
    }

    /// Store a local in its javac slot, returning the last slot it occupies
    pub fn set_local(
        &mut self,
        ir: &mut MethodIr<'g>,
        local: LocalId,
        javac_index: usize,
    ) -> Result<usize> {
        assert_that(ir[local].merge_parent.is_none(), "setting a merged local")?;
        let ty = ir[local].ty;
        self.verify_local_index(ty, javac_index)?;

        if self.is_reusing_locals() {
            // Overwriting half of a two word local kills it
            if let LocalSlot::SecondWord(_) = self.locals[javac_index] {
                if javac_index > 0 {
                    self.locals[javac_index - 1] = LocalSlot::Empty;
                }
            }
            if ty.is_two_words() {
                if let LocalSlot::Value(other) = self.locals[javac_index + 1] {
                    if ir[other].ty.is_two_words() && javac_index + 2 < self.locals.len() {
                        self.locals[javac_index + 2] = LocalSlot::Empty;
                    }
                }
            } else if let LocalSlot::Value(other) = self.locals[javac_index] {
                if ir[other].ty.is_two_words() && javac_index + 1 < self.locals.len() {
                    self.locals[javac_index + 1] = LocalSlot::Empty;
                }
            }
            self.locals[javac_index] = LocalSlot::Value(local);
            if ty.is_two_words() {
                self.locals[javac_index + 1] = LocalSlot::SecondWord(local);
                return Ok(javac_index + 1);
            }
        } else {
            let current = self.local_type(ir, javac_index);
            verify_with(
                self.ctx.is_assignable(ty, current)?,
                VerifyErrorKind::LocalsBadType,
                || format!("{} is not assignable to {}", ty, current),
            )?;
            if let Some(second) = self.ctx.second_word_type(ty) {
                verify(
                    self.local_type(ir, javac_index + 1) == second,
                    VerifyErrorKind::LocalsBadType,
                )?;
                return Ok(javac_index + 1);
            }
        }
        Ok(javac_index)
    }

    /// Local in a javac slot, checking it holds a value of the given type
    pub fn get_local(
        &self,
        ir: &MethodIr<'g>,
        ty: Type<'g>,
        javac_index: usize,
    ) -> Result<LocalId> {
        self.verify_local_index(ty, javac_index)?;
        let ty = self.ctx.local_type(ty);
        let actual = self.local_type(ir, javac_index);
        verify_with(
            self.ctx.is_assignable(actual, ty)?,
            VerifyErrorKind::LocalsBadType,
            || format!("{} is not assignable to {}", actual, ty),
        )?;
        if let Some(second) = self.ctx.second_word_type(ty) {
            verify(
                self.local_type(ir, javac_index + 1) == second,
                VerifyErrorKind::LocalsBadType,
            )?;
        }
        match self.local(javac_index) {
            LocalSlot::Value(local) => {
                assert_that(ir[local].merge_parent.is_none(), "frame holds a merged local")?;
                Ok(local)
            }
            _ => Err(AssertionFailed::new("typed slot without a local").into()),
        }
    }

    /// Forget the derived state and re-seed it from a target not reached by fall through
    pub fn reinitialize(&mut self, ir: &mut MethodIr<'g>, target: TargetId) -> Result<()> {
        self.reinitialize_stack(ir, target)?;
        self.reinitialize_locals(ir, target)
    }

    fn reinitialize_stack(&mut self, ir: &mut MethodIr<'g>, target: TargetId) -> Result<()> {
        if ir[target].is_exception_target() {
            return assert_that(self.stack.is_empty(), "stack not empty at exception handler entry");
        }
        self.clear_stack();
        match ir[target].stack.clone() {
            None => {
                let address = ir[target].address;
                for ty in ir[target].entry.stack.clone() {
                    verify(
                        !ty.is_proxy() && ty != self.ctx.core.init_object,
                        VerifyErrorKind::BackBranchUninit,
                    )?;
                    let insn = ir.create(Instruction::new(InsnKind::LoadSynthetic, ty, address));
                    self.push(ir, insn, true)?;
                }
            }
            Some(stack) => {
                for insn in stack {
                    let two_words = ir[insn].ty.is_two_words();
                    self.stack.push(StackSlot { insn, two_words });
                }
                self.computed_max_stack = self.computed_max_stack.max(self.stack_words());
            }
        }
        Ok(())
    }

    fn reinitialize_locals(&mut self, ir: &mut MethodIr<'g>, target: TargetId) -> Result<()> {
        match ir[target].locals.clone() {
            None => {
                if self.is_reusing_locals() {
                    self.init_locals_from_stack_map(ir, target);
                }
            }
            Some(mut locals) => {
                for slot in locals.iter_mut() {
                    *slot = match *slot {
                        LocalSlot::Value(local) => LocalSlot::Value(ir.merge_root(local)),
                        LocalSlot::SecondWord(local) => LocalSlot::SecondWord(ir.merge_root(local)),
                        LocalSlot::Empty => LocalSlot::Empty,
                    };
                }
                self.locals[..locals.len()].copy_from_slice(&locals);
                ir[target].locals = Some(locals);
            }
        }
        Ok(())
    }

    /// Allocate a fresh local for every live slot of the target's stack map entry
    fn init_locals_from_stack_map(&mut self, ir: &mut MethodIr<'g>, target: TargetId) {
        let types = ir[target].entry.physical_locals.clone();
        let address = ir[target].address;
        let mut javac_index = 0;
        while javac_index < types.len() && javac_index < self.locals.len() {
            let ty = types[javac_index];
            if ty.is_bogus() || ty.is_second_word() {
                self.locals[javac_index] = LocalSlot::Empty;
                javac_index += 1;
                continue;
            }
            let local = self.allocate_local(ir, ty, javac_index as u16, Some(address), None);
            self.locals[javac_index] = LocalSlot::Value(local);
            javac_index += 1;
            if ty.is_two_words() && javac_index < self.locals.len() {
                self.locals[javac_index] = LocalSlot::SecondWord(local);
                javac_index += 1;
            }
        }
        for slot in &mut self.locals[javac_index..] {
            *slot = LocalSlot::Empty;
        }
    }

    /// Check the derived types against the target's recorded types
    ///
    /// With `replace`, the derived types are narrowed to the recorded ones.
    pub fn match_stack_map(
        &mut self,
        ir: &mut MethodIr<'g>,
        target: TargetId,
        replace: bool,
        kind: VerifyErrorKind,
    ) -> Result<()> {
        let locals = ir[target].entry.physical_locals.clone();
        let stack = ir[target].entry.stack.clone();
        self.match_stack_map_locals(ir, &locals, replace, kind)?;
        self.match_stack_map_stack(ir, &stack, replace, kind)
    }

    pub fn match_stack_map_locals(
        &mut self,
        ir: &mut MethodIr<'g>,
        recorded: &[Type<'g>],
        replace: bool,
        kind: VerifyErrorKind,
    ) -> Result<()> {
        verify(recorded.len() <= self.locals.len(), kind)?;
        for (javac_index, recorded) in recorded.iter().copied().enumerate() {
            let derived = self.local_type(ir, javac_index);
            verify_with(self.ctx.is_assignable(derived, recorded)?, kind, || {
                format!("local {}: {} is not assignable to {}", javac_index, derived, recorded)
            })?;
            if replace && !recorded.is_bogus() {
                if let LocalSlot::Value(local) = self.locals[javac_index] {
                    ir[local].ty = recorded;
                }
            }
        }
        Ok(())
    }

    pub fn match_stack_map_stack(
        &mut self,
        ir: &mut MethodIr<'g>,
        recorded: &[Type<'g>],
        replace: bool,
        kind: VerifyErrorKind,
    ) -> Result<()> {
        verify_with(recorded.len() == self.stack.len(), kind, || {
            format!(
                "stack depth {} does not match the recorded {}",
                self.stack.len(),
                recorded.len()
            )
        })?;
        let values = self.stack_values();
        for (position, (recorded, insn)) in recorded.iter().copied().zip(values).enumerate() {
            let derived = self.ctx.local_type(ir[insn].ty);
            verify_with(self.ctx.is_assignable(derived, recorded)?, kind, || {
                format!("stack {}: {} is not assignable to {}", position, derived, recorded)
            })?;
            if replace {
                if let Some(temp) = ir[insn].temporary {
                    ir[temp].ty = recorded;
                }
            }
        }
        Ok(())
    }

    /// Apply one of the `dup`/`swap` family of opcodes
    ///
    /// Returns whether a `dup` copied an uninitialized object created by `new`. Any other shuffle
    /// of such an object is untranslatable.
    pub fn dup_swap(&mut self, ir: &mut MethodIr<'g>, opcode: u8) -> Result<bool> {
        let universe = self.ctx.core.universe;
        let mut duped_new = false;
        let moved: Vec<InsnId>;
        let pushed: Vec<InsnId>;

        macro_rules! pop {
            () => {
                self.pop(ir, universe)?
            };
        }
        let two_words = |ir: &MethodIr<'g>, insn: InsnId| ir[insn].ty.is_two_words();

        match opcode {
            opcodes::DUP => {
                let x1 = pop!();
                duped_new = matches!(ir[x1].kind, InsnKind::NewObject);
                moved = vec![x1];
                pushed = vec![x1, x1];
            }
            opcodes::DUP2 => {
                let x1 = pop!();
                if two_words(ir, x1) {
                    moved = vec![x1];
                    pushed = vec![x1, x1];
                } else {
                    let x2 = pop!();
                    moved = vec![x1, x2];
                    pushed = vec![x2, x1, x2, x1];
                }
            }
            opcodes::DUP_X1 => {
                let x1 = pop!();
                let x2 = pop!();
                moved = vec![x1, x2];
                pushed = vec![x1, x2, x1];
            }
            opcodes::DUP_X2 => {
                let x1 = pop!();
                let x2 = pop!();
                if two_words(ir, x2) {
                    moved = vec![x1, x2];
                    pushed = vec![x1, x2, x1];
                } else {
                    let x3 = pop!();
                    moved = vec![x1, x2, x3];
                    pushed = vec![x1, x3, x2, x1];
                }
            }
            opcodes::DUP2_X1 => {
                let x1 = pop!();
                if two_words(ir, x1) {
                    let x2 = pop!();
                    moved = vec![x1, x2];
                    pushed = vec![x1, x2, x1];
                } else {
                    let x2 = pop!();
                    let x3 = pop!();
                    moved = vec![x1, x2, x3];
                    pushed = vec![x2, x1, x3, x2, x1];
                }
            }
            opcodes::DUP2_X2 => {
                let x1 = pop!();
                if two_words(ir, x1) {
                    let x2 = pop!();
                    if two_words(ir, x2) {
                        moved = vec![x1, x2];
                        pushed = vec![x1, x2, x1];
                    } else {
                        let x3 = pop!();
                        moved = vec![x1, x2, x3];
                        pushed = vec![x1, x3, x2, x1];
                    }
                } else {
                    let x2 = pop!();
                    let x3 = pop!();
                    if two_words(ir, x3) {
                        moved = vec![x1, x2, x3];
                        pushed = vec![x2, x1, x3, x2, x1];
                    } else {
                        let x4 = pop!();
                        moved = vec![x1, x2, x3, x4];
                        pushed = vec![x2, x1, x4, x3, x2, x1];
                    }
                }
            }
            opcodes::SWAP => {
                let x1 = pop!();
                let x2 = pop!();
                moved = vec![x1, x2];
                pushed = vec![x1, x2];
            }
            other => {
                return Err(AssertionFailed::new(format!(
                    "not a dup/swap opcode: {}",
                    other
                ))
                .into())
            }
        }

        if opcode != opcodes::DUP {
            let shuffles_new = moved
                .iter()
                .any(|&insn| matches!(ir[insn].kind, InsnKind::NewObject) && ir[insn].ty.is_proxy());
            verify_translatable(!shuffles_new, "uninitialized object shuffled by other than dup")?;
        }
        for insn in pushed {
            self.push(ir, insn, false)?;
        }
        for insn in moved {
            ir[insn].flags.insert(InsnFlags::DUPED);
        }
        Ok(duped_new)
    }

    /// Mark every value on the stack as needing to be materialized in its temporary
    ///
    /// `at_boundary` distinguishes block boundaries from garbage collection points, which are
    /// each gated by their own setting.
    pub fn spill_stack(&self, ir: &mut MethodIr<'g>, at_boundary: bool) {
        let enabled = if at_boundary {
            self.ctx.settings.constrain_stack
        } else {
            self.ctx.settings.constrain_stack_for_gc
        };
        if enabled {
            for insn in self.stack_values() {
                ir[insn].flags.insert(InsnFlags::SPILLS);
            }
        }
    }

    /// Merge the frame into the state recorded for a target
    pub fn merge_with_target(&mut self, ir: &mut MethodIr<'g>, target: TargetId) -> Result<()> {
        if self.is_allocating_stack() {
            self.merge_stack_with_target(ir, target)?;
        }
        if self.is_merging_locals() {
            self.merge_locals_with_target(ir, target)?;
        }
        Ok(())
    }

    fn merge_stack_with_target(&mut self, ir: &mut MethodIr<'g>, target: TargetId) -> Result<()> {
        if ir[target].is_exception_target() {
            return Ok(());
        }
        let frame_stack = self.stack_values();
        let recorded = match ir[target].stack.clone() {
            None => {
                ir[target].stack = Some(frame_stack);
                return Ok(());
            }
            Some(recorded) => recorded,
        };
        assert_that(
            recorded.len() == frame_stack.len(),
            "stack depth differs between edges into a target",
        )?;
        let types = ir[target].entry.stack.clone();
        let mut merged_stack = recorded.clone();
        for (position, (&first, &derived)) in recorded.iter().zip(&frame_stack).enumerate() {
            if first != derived {
                let ty = types.get(position).copied().unwrap_or(ir[first].ty);
                let merged = ir.merge_temporaries(first, derived, ty)?;
                merged_stack[position] = merged;
                self.replace_at(position, merged);
            }
        }
        ir[target].stack = Some(merged_stack);
        Ok(())
    }

    /// Locals live at the target (non-`BOGUS` in its stack map) are the same variable on every edge
    fn merge_locals_with_target(&mut self, ir: &mut MethodIr<'g>, target: TargetId) -> Result<()> {
        let types = ir[target].entry.physical_locals.clone();
        let recorded = match ir[target].locals.clone() {
            None => {
                let mut locals = Vec::with_capacity(self.locals.len());
                for javac_index in 0..self.locals.len() {
                    locals.push(self.stack_map_local(ir, javac_index, &types)?);
                }
                ir[target].locals = Some(locals);
                return Ok(());
            }
            Some(recorded) => recorded,
        };
        assert_that(
            recorded.len() == self.locals.len(),
            "locals count differs between edges into a target",
        )?;

        let mut merged_locals = recorded.clone();
        for javac_index in 0..recorded.len() {
            let live = self.stack_map_local(ir, javac_index, &types)?;
            assert_that(
                (recorded[javac_index] == LocalSlot::Empty) == (live == LocalSlot::Empty),
                "recorded locals disagree with the stack map",
            )?;
            if let (LocalSlot::Value(frame_local), LocalSlot::Value(local)) =
                (live, recorded[javac_index])
            {
                let local = ir.merge_root(local);
                if frame_local != local {
                    if ir[local].ty != ir[frame_local].ty {
                        ir[local].ty = ir[frame_local].ty;
                    }
                    let merged = ir.merge_locals(frame_local, local)?;
                    merged_locals[javac_index] = LocalSlot::Value(merged);
                    self.locals[javac_index] = LocalSlot::Value(merged);
                }
            }
        }

        // Second words follow their first word
        for slots in [&mut merged_locals, &mut self.locals] {
            for slot in slots.iter_mut() {
                match *slot {
                    LocalSlot::Value(local) => *slot = LocalSlot::Value(ir.merge_root(local)),
                    LocalSlot::SecondWord(local) => {
                        *slot = LocalSlot::SecondWord(ir.merge_root(local))
                    }
                    LocalSlot::Empty => (),
                }
            }
        }
        ir[target].locals = Some(merged_locals);
        Ok(())
    }

    /// Frame local for a slot that the stack map says is live, retyped to the recorded type
    fn stack_map_local(
        &mut self,
        ir: &mut MethodIr<'g>,
        javac_index: usize,
        types: &[Type<'g>],
    ) -> Result<LocalSlot> {
        let ty = match types.get(javac_index) {
            Some(ty) if !ty.is_bogus() => *ty,
            _ => return Ok(LocalSlot::Empty),
        };
        match self.locals[javac_index] {
            LocalSlot::Empty => Err(AssertionFailed::new(format!(
                "local {} is live in the stack map but undefined",
                javac_index
            ))
            .into()),
            LocalSlot::Value(local) => {
                let local = ir.merge_root(local);
                if ir[local].ty != ty && ty != self.ctx.core.null_object {
                    ir[local].ty = ty;
                }
                self.locals[javac_index] = LocalSlot::Value(local);
                Ok(LocalSlot::Value(local))
            }
            LocalSlot::SecondWord(local) => {
                let local = ir.merge_root(local);
                self.locals[javac_index] = LocalSlot::SecondWord(local);
                Ok(LocalSlot::SecondWord(local))
            }
        }
    }

    /// Does a local (or, unless ignored, a stack value) hold an uninitialized object?
    pub fn contains_uninitialized(&self, ir: &MethodIr<'g>, ignore_stack: bool) -> bool {
        let core = &self.ctx.core;
        let in_locals = (0..self.locals.len()).any(|idx| {
            let ty = self.local_type(ir, idx);
            ty == core.init_object || ty.is_proxy()
        });
        let on_stack = !ignore_stack
            && self.stack.iter().any(|slot| {
                let ty = ir[slot.insn].ty;
                ty == core.new_object || ty.is_proxy()
            });
        in_locals || on_stack
    }

    /// Retype `this` once the superclass constructor was called
    pub fn rename_init_to(&self, ir: &mut MethodIr<'g>, ty: Type<'g>) {
        let init = self.ctx.core.init_object;
        for slot in &self.locals {
            if let LocalSlot::Value(local) = slot {
                if ir[*local].ty == init {
                    ir[*local].ty = ty;
                }
            }
        }
        for insn in self.stack_values() {
            if ir[insn].ty == init {
                ir[insn].ty = ty;
            }
        }
        for local in &self.allocated {
            if ir[*local].ty == init {
                ir[*local].ty = ty;
            }
        }
    }

    /// Narrow the type of the local a value was loaded from to the type its consumer expects
    pub fn narrow_local_type(
        &self,
        ir: &mut MethodIr<'g>,
        insn: InsnId,
        inferred: Type<'g>,
        interface_narrows: bool,
    ) -> Result<()> {
        let inferred = self.ctx.local_type(inferred);
        if inferred.synthetic().is_some() {
            return Ok(());
        }
        let local = match ir[insn].kind {
            InsnKind::LoadLocal { local } => local,
            InsnKind::LoadConstant(Constant::Null) => match ir[insn].temporary {
                Some(temp) if ir[temp].ty == self.ctx.core.null_object => temp,
                _ => return Ok(()),
            },
            _ => return Ok(()),
        };
        let current = ir[local].ty;
        if self.ctx.is_narrower(inferred, current, interface_narrows)? {
            ir[local].ty = inferred;
            ir[insn].ty = inferred;
        }
        Ok(())
    }

    /// Complete the emulation
    ///
    /// Verifier-only types left in locals are replaced by real ones, and the parameters are
    /// recorded in the IR (as the merge roots of the parameter locals).
    pub fn finish(&mut self, ir: &mut MethodIr<'g>) -> Result<()> {
        for local in self.allocated.clone() {
            verify_translatable(!ir[local].ty.is_proxy(), "uninitialized object left in a local")?;
            if ir[local].merge_parent.is_none() {
                let real = self.real_type(ir, ir[local].ty, Some(local));
                ir[local].ty = real;
            }
        }
        let mut parameters = Vec::with_capacity(self.parameters.len());
        for slot in &self.parameters {
            parameters.push(match *slot {
                LocalSlot::Value(local) => Some(ir.merge_root(local)),
                _ => None,
            });
        }
        ir.parameters = parameters;
        for slot in &self.locals {
            if let LocalSlot::Value(local) = slot {
                assert_that(ir[*local].merge_parent.is_none(), "frame holds a merged local")?;
            }
        }
        Ok(())
    }

    fn real_type(&self, ir: &MethodIr<'g>, ty: Type<'g>, local: Option<LocalId>) -> Type<'g> {
        let core = &self.ctx.core;
        let mut base = ty;
        let mut depth = 0;
        while let Some(elem) = base.element_type() {
            depth += 1;
            base = elem;
        }
        let real = if base == core.null_object {
            if let Some(inferred) = local.and_then(|local| self.infer_from_last_use(ir, local)) {
                return self.real_type(ir, inferred, None);
            }
            core.object
        } else if base == core.init_object {
            self.method.parent
        } else if base == core.byte_or_boolean {
            core.byte
        } else {
            return ty;
        };
        (0..depth).fold(real, |ty, _| self.ctx.array_of(ty))
    }

    /// Type a null-typed local's last load is consumed as
    fn infer_from_last_use(&self, ir: &MethodIr<'g>, local: LocalId) -> Option<Type<'g>> {
        let load = *ir[local].use_defs.iter().rev().find(|insn| ir[**insn].kind.is_use())?;
        if !matches!(ir[load].kind, InsnKind::LoadLocal { .. }) {
            return None;
        }
        let mut next = ir.next(load);
        while let Some(insn) = next {
            match &ir[insn].kind {
                InsnKind::StoreLocal { local, value } if *value == load => {
                    return Some(ir[*local].ty);
                }
                InsnKind::LoadField { field, receiver } if *receiver == Some(load) => {
                    return Some(field.parent);
                }
                InsnKind::StoreField { receiver, value, .. }
                    if *receiver == Some(load) || *value == load =>
                {
                    return None;
                }
                _ => (),
            }
            next = ir.next(insn);
        }
        None
    }

    /// Trace the frame state
    pub fn log_state(&self, ir: &MethodIr<'g>) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let locals: Vec<String> = (0..self.locals.len())
            .map(|idx| self.local_type(ir, idx).to_string())
            .collect();
        let stack: Vec<String> = self
            .stack
            .iter()
            .map(|slot| format!("#{}:{}", slot.insn.0, ir[slot.insn].ty))
            .collect();
        log::trace!("    locals [{}] stack [{}]", locals.join(", "), stack.join(", "));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::{MemoryClassPath, MethodAccessFlags};
    use crate::classfile::StackMapEntry;
    use crate::ir::Target;
    use crate::model::ContextArenas;
    use crate::settings::Settings;
    use std::cell::RefCell;

    fn context<'g>(arenas: &'g ContextArenas<'g>) -> TranslationContext<'g> {
        TranslationContext::new(arenas, Settings::default(), Box::new(MemoryClassPath::new()))
    }

    fn static_method<'g>(ctx: &TranslationContext<'g>, parameters: Vec<Type<'g>>) -> &'g MethodData<'g> {
        ctx.add_method(MethodData {
            parent: ctx.core.object,
            name: String::from("m"),
            descriptor: String::from("()V"),
            access_flags: MethodAccessFlags::STATIC,
            parameters,
            return_type: ctx.core.void,
            exceptions: vec![],
            slot: 0,
            holder: RefCell::new(None),
        })
    }

    fn constant<'g>(ir: &mut MethodIr<'g>, ctx: &TranslationContext<'g>, constant: Constant) -> InsnId {
        let ty = match constant {
            Constant::Int(_) => ctx.core.int,
            Constant::Long(_) => ctx.core.long,
            Constant::Float(_) => ctx.core.float,
            Constant::Double(_) => ctx.core.double,
            Constant::Null => ctx.core.null_object,
        };
        let insn = ir.create(Instruction::new(InsnKind::LoadConstant(constant), ty, 0));
        ir.append(insn);
        insn
    }

    #[test]
    fn stack_words_and_bounds() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![ctx.core.long, ctx.core.int]);
        let mut ir = MethodIr::new();
        let mut frame =
            Frame::new(&ctx, method, &mut ir, Some(3), 3, FrameFlags::ALLOCATE_STACK | FrameFlags::REUSABLE_LOCALS, None).unwrap();

        assert_eq!(frame.local_type(&ir, 1), ctx.core.long2);
        assert_eq!(ir.parameters.len(), 0);

        let long = constant(&mut ir, &ctx, Constant::Long(1));
        let int = constant(&mut ir, &ctx, Constant::Int(1));
        frame.push(&mut ir, long, true).unwrap();
        frame.push(&mut ir, int, true).unwrap();
        assert_eq!(frame.stack_size(), 2);
        assert_eq!(frame.stack_words(), 3);
        assert!(ir[long].temporary.is_some());

        let overflow = constant(&mut ir, &ctx, Constant::Int(2));
        let err = frame.push(&mut ir, overflow, true).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::StackOverflow));

        let err = frame.pop(&mut ir, ctx.core.float).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::StackBadType));

        frame.finish(&mut ir).unwrap();
        assert_eq!(ir.parameters.len(), 3);
    }

    #[test]
    fn pop_collapses_sub_int_types() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![]);
        let mut ir = MethodIr::new();
        let mut frame = Frame::new(&ctx, method, &mut ir, Some(2), 0, FrameFlags::ALLOCATE_STACK, None).unwrap();
        let int = constant(&mut ir, &ctx, Constant::Int(1));
        frame.push(&mut ir, int, true).unwrap();
        assert_eq!(frame.pop(&mut ir, ctx.core.byte).unwrap(), int);
        let err = frame.pop(&mut ir, ctx.core.int).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::StackUnderflow));
    }

    #[test]
    fn dup_x1_and_swap() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![]);
        let mut ir = MethodIr::new();
        let mut frame = Frame::new(&ctx, method, &mut ir, None, 0, FrameFlags::ALLOCATE_STACK, None).unwrap();
        let a = constant(&mut ir, &ctx, Constant::Int(1));
        let b = constant(&mut ir, &ctx, Constant::Int(2));
        frame.push(&mut ir, a, true).unwrap();
        frame.push(&mut ir, b, true).unwrap();

        assert!(!frame.dup_swap(&mut ir, opcodes::DUP_X1).unwrap());
        assert_eq!(frame.stack_values(), vec![b, a, b]);
        assert!(ir[a].was_duped() && ir[b].was_duped());

        frame.dup_swap(&mut ir, opcodes::SWAP).unwrap();
        assert_eq!(frame.stack_values(), vec![b, b, a]);
        assert_eq!(frame.computed_max_stack(), 3);
    }

    #[test]
    fn dup2_of_a_long_copies_one_value() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![]);
        let mut ir = MethodIr::new();
        let mut frame = Frame::new(&ctx, method, &mut ir, Some(4), 0, FrameFlags::ALLOCATE_STACK, None).unwrap();
        let long = constant(&mut ir, &ctx, Constant::Long(7));
        frame.push(&mut ir, long, true).unwrap();
        frame.dup_swap(&mut ir, opcodes::DUP2).unwrap();
        assert_eq!(frame.stack_values(), vec![long, long]);
        assert_eq!(frame.stack_words(), 4);
    }

    #[test]
    fn stores_reuse_slots() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![]);
        let mut ir = MethodIr::new();
        let mut frame = Frame::new(&ctx, method, &mut ir, None, 3, FrameFlags::REUSABLE_LOCALS, None).unwrap();

        let long = frame.allocate_local(&mut ir, ctx.core.long, 0, None, None);
        assert_eq!(frame.set_local(&mut ir, long, 0).unwrap(), 1);
        assert_eq!(frame.get_local(&ir, ctx.core.long, 0).unwrap(), long);

        // An int stored over the second word kills the long
        let int = frame.allocate_local(&mut ir, ctx.core.int, 1, None, None);
        frame.set_local(&mut ir, int, 1).unwrap();
        assert_eq!(frame.local(0), LocalSlot::Empty);
        let err = frame.get_local(&ir, ctx.core.long, 0).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::LocalsBadType));

        let err = frame.get_local(&ir, ctx.core.long, 2).unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::LocalsOverflow));
    }

    #[test]
    fn matching_a_stack_map() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![ctx.core.string]);
        let mut ir = MethodIr::new();
        let mut frame = Frame::new(&ctx, method, &mut ir, None, 1, FrameFlags::REUSABLE_LOCALS | FrameFlags::ALLOCATE_STACK, None).unwrap();

        let target = ir.add_target(Target::new(StackMapEntry {
            address: 4,
            locals: vec![ctx.core.object],
            physical_locals: vec![ctx.core.object],
            stack: vec![],
        }));
        frame
            .match_stack_map(&mut ir, target, true, VerifyErrorKind::TargetBadType)
            .unwrap();
        let param = frame.local(0).local().unwrap();
        assert_eq!(ir[param].ty, ctx.core.object);

        let bad = ir.add_target(Target::new(StackMapEntry {
            address: 8,
            locals: vec![ctx.core.int],
            physical_locals: vec![ctx.core.int],
            stack: vec![],
        }));
        let err = frame
            .match_stack_map(&mut ir, bad, false, VerifyErrorKind::TargetBadType)
            .unwrap_err();
        assert_eq!(err.verify_kind(), Some(VerifyErrorKind::TargetBadType));
    }

    #[test]
    fn merging_stacks_at_a_target() {
        let arenas = ContextArenas::new();
        let ctx = context(&arenas);
        let method = static_method(&ctx, vec![]);
        let mut ir = MethodIr::new();
        let mut frame = Frame::new(&ctx, method, &mut ir, None, 0, FrameFlags::ALLOCATE_STACK, None).unwrap();
        let target = ir.add_target(Target::new(StackMapEntry {
            address: 9,
            locals: vec![],
            physical_locals: vec![],
            stack: vec![ctx.core.int],
        }));

        let a = constant(&mut ir, &ctx, Constant::Int(1));
        frame.push(&mut ir, a, true).unwrap();
        frame.merge_with_target(&mut ir, target).unwrap();
        frame.pop(&mut ir, ctx.core.int).unwrap();

        let b = constant(&mut ir, &ctx, Constant::Int(2));
        frame.push(&mut ir, b, true).unwrap();
        frame.merge_with_target(&mut ir, target).unwrap();
        assert_eq!(ir[a].temporary, ir[b].temporary);
        assert!(ir.was_merged(b));
        assert_eq!(ir[target].stack, Some(vec![a]));
    }
}
