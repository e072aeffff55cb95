use super::{
    ExceptionHandlerTable, InsnFlags, InsnId, InsnKind, Instruction, Local, LocalId, Target,
    TargetId,
};
use crate::errors::{assert_that, AssertionFailed, Result};
use crate::model::Type;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Index, IndexMut};

/// IR of one method: the instruction list along with its locals, targets and handlers
///
/// Instructions are never deallocated: removing an instruction unlinks it from the list, but its
/// id stays valid (so stale operand references can still be inspected).
pub struct MethodIr<'g> {
    insns: Vec<Instruction<'g>>,
    head: Option<InsnId>,
    tail: Option<InsnId>,
    len: usize,

    locals: Vec<Local<'g>>,
    targets: Vec<Target<'g>>,
    targets_by_address: HashMap<u32, TargetId>,

    pub handlers: ExceptionHandlerTable<'g>,

    /// Locals holding the parameters on entry, one per word
    pub parameters: Vec<Option<LocalId>>,

    /// Words of operand stack needed
    pub max_stack: usize,

    /// Some store writes to slot 0 of an instance method
    pub receiver_overwritten: bool,
}

impl<'g> MethodIr<'g> {
    pub fn new() -> MethodIr<'g> {
        MethodIr {
            insns: vec![],
            head: None,
            tail: None,
            len: 0,
            locals: vec![],
            targets: vec![],
            targets_by_address: HashMap::new(),
            handlers: ExceptionHandlerTable::new(),
            parameters: vec![],
            max_stack: 0,
            receiver_overwritten: false,
        }
    }

    /// Allocate an instruction without linking it into the list
    pub fn create(&mut self, insn: Instruction<'g>) -> InsnId {
        let id = InsnId(self.insns.len() as u32);
        self.insns.push(insn);
        id
    }

    pub fn append(&mut self, id: InsnId) {
        let prev = self.tail;
        self.link(id, prev, None);
    }

    pub fn insert_before(&mut self, before: InsnId, id: InsnId) {
        let prev = self.insns[before.index()].prev;
        self.link(id, prev, Some(before));
    }

    pub fn insert_after(&mut self, after: InsnId, id: InsnId) {
        let next = self.insns[after.index()].next;
        self.link(id, Some(after), next);
    }

    fn link(&mut self, id: InsnId, prev: Option<InsnId>, next: Option<InsnId>) {
        {
            let insn = &mut self.insns[id.index()];
            insn.prev = prev;
            insn.next = next;
            insn.linked = true;
        }
        match prev {
            Some(prev) => self.insns[prev.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => self.insns[next.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    /// Unlink an instruction from the list
    ///
    /// If it reads or writes a local, it is also removed from the local's use/def list.
    pub fn remove(&mut self, id: InsnId) {
        if !self.insns[id.index()].linked {
            return;
        }
        let (prev, next) = {
            let insn = &mut self.insns[id.index()];
            insn.linked = false;
            (insn.prev.take(), insn.next.take())
        };
        match prev {
            Some(prev) => self.insns[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.insns[next.index()].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;

        if let Some(local) = self.insns[id.index()].kind.local() {
            self.locals[local.index()].use_defs.retain(|use_def| *use_def != id);
        }
    }

    pub fn head(&self) -> Option<InsnId> {
        self.head
    }

    pub fn tail(&self) -> Option<InsnId> {
        self.tail
    }

    pub fn next(&self, id: InsnId) -> Option<InsnId> {
        self.insns[id.index()].next
    }

    pub fn prev(&self, id: InsnId) -> Option<InsnId> {
        self.insns[id.index()].prev
    }

    /// Number of linked instructions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of the linked instructions, in order
    ///
    /// This is a snapshot: the list can be modified while walking it.
    pub fn ids(&self) -> Vec<InsnId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut next = self.head;
        while let Some(id) = next {
            ids.push(id);
            next = self.insns[id.index()].next;
        }
        ids
    }

    /// First instruction at or after `id` that is not a pseudo instruction
    pub fn real(&self, id: InsnId) -> Option<InsnId> {
        let mut next = Some(id);
        while let Some(id) = next {
            if !self.insns[id.index()].kind.is_pseudo() {
                return Some(id);
            }
            next = self.insns[id.index()].next;
        }
        None
    }

    /// Number every linked instruction in order
    pub fn logically_relocate(&mut self) {
        let mut ip = 0;
        let mut next = self.head;
        while let Some(id) = next {
            let insn = &mut self.insns[id.index()];
            insn.reloc_ip = ip;
            ip += 1;
            next = insn.next;
        }
    }

    pub fn add_local(&mut self, local: Local<'g>) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(local);
        id
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn local_ids(&self) -> impl Iterator<Item = LocalId> {
        (0..self.locals.len() as u32).map(LocalId)
    }

    /// Follow the `merge_parent` chain to the surviving local
    pub fn merge_root(&self, mut local: LocalId) -> LocalId {
        while let Some(parent) = self.locals[local.index()].merge_parent {
            local = parent;
        }
        local
    }

    /// Point a load/store/increment instruction at a different local
    pub fn set_insn_local(&mut self, insn: InsnId, local: LocalId) {
        if let Some(old) = self.insns[insn.index()].kind.local() {
            self.locals[old.index()].use_defs.retain(|use_def| *use_def != insn);
        }
        self.insns[insn.index()].kind.set_local(local);
        let use_defs = &mut self.locals[local.index()].use_defs;
        if !use_defs.contains(&insn) {
            use_defs.push(insn);
        }
    }

    /// Merge two locals for the same javac slot that meet at a control flow join
    ///
    /// The local with more uses and definitions survives (unless one was already merged away, in
    /// which case its root survives).
    pub fn merge_locals(&mut self, local1: LocalId, local2: LocalId) -> Result<LocalId> {
        if local1 == local2 {
            return Ok(local1);
        }
        assert_that(
            self.locals[local1.index()].javac_index == self.locals[local2.index()].javac_index,
            "merging locals of different slots",
        )?;
        if self.locals[local2.index()].merge_parent.is_some() {
            let root = self.merge_root(local2);
            return if root == local1 {
                Ok(local1)
            } else {
                self.merge_into(local1, root, true)
            };
        }
        if self.locals[local1.index()].merge_parent.is_some() {
            let root = self.merge_root(local1);
            return if root == local2 {
                Ok(local2)
            } else {
                self.merge_into(local2, root, true)
            };
        }
        if self.locals[local1.index()].use_defs.len() > self.locals[local2.index()].use_defs.len()
        {
            self.merge_into(local1, local2, true)
        } else {
            self.merge_into(local2, local1, true)
        }
    }

    /// Merge `other` into `survivor`, moving all of its uses and definitions
    ///
    /// At a branch point the two locals are the same variable; otherwise they merely share a slot
    /// because their live ranges are disjoint, which makes the survivor a merge parent.
    pub fn merge_into(
        &mut self,
        survivor: LocalId,
        other: LocalId,
        at_branch_point: bool,
    ) -> Result<LocalId> {
        assert_that(survivor != other, "merging a local with itself")?;
        assert_that(
            self.locals[survivor.index()].merge_parent.is_none()
                && self.locals[other.index()].merge_parent.is_none(),
            "merging a local that was already merged",
        )?;
        assert_that(
            self.locals[survivor.index()].ty == self.locals[other.index()].ty,
            "merging locals of different types",
        )?;

        let moved = std::mem::take(&mut self.locals[other.index()].use_defs);
        for insn in &moved {
            self.insns[insn.index()].kind.set_local(survivor);
        }
        let other_parameter = self.locals[other.index()].parameter;
        let other_name = self.locals[other.index()].name.clone();
        self.locals[other.index()].merge_parent = Some(survivor);

        let local = &mut self.locals[survivor.index()];
        for insn in moved {
            if !local.use_defs.contains(&insn) {
                local.use_defs.push(insn);
            }
        }
        if at_branch_point {
            match (local.parameter, other_parameter) {
                (None, parameter) => local.parameter = parameter,
                (Some(parameter), Some(other)) => {
                    assert_that(parameter == other, "merging two different parameters")?
                }
                (Some(_), None) => (),
            }
        } else {
            local.is_merge_parent = true;
        }
        local.merge_name(other_name.as_deref());
        Ok(survivor)
    }

    /// Merge the values of two producers meeting in the same stack slot at a join point
    ///
    /// Both end up sharing `insn1`'s temporary, which is marked as merged so that every producer
    /// stores its value there.
    pub fn merge_temporaries(
        &mut self,
        insn1: InsnId,
        insn2: InsnId,
        merge_type: Type<'g>,
    ) -> Result<InsnId> {
        let (temp1, temp2) = match (
            self.insns[insn1.index()].temporary,
            self.insns[insn2.index()].temporary,
        ) {
            (Some(temp1), Some(temp2)) => (temp1, temp2),
            _ => return Err(AssertionFailed::new("merging values without temporaries").into()),
        };
        if temp1 == temp2 {
            return Ok(insn1);
        }

        if self.locals[temp1.index()].ty != merge_type {
            self.locals[temp1.index()].ty = merge_type;
            self.insns[insn1.index()].ty = merge_type;
        }

        let producers = match self.locals[temp2.index()].temporary.as_mut() {
            Some(temp) => std::mem::take(&mut temp.producers),
            None => vec![],
        };
        for producer in &producers {
            let insn = &mut self.insns[producer.index()];
            insn.temporary = Some(temp1);
            insn.flags.insert(InsnFlags::SPILLS);
        }
        self.insns[insn1.index()].flags.insert(InsnFlags::SPILLS);
        if let Some(temp) = self.locals[temp1.index()].temporary.as_mut() {
            temp.merged = true;
            temp.producers.extend(producers);
        }
        Ok(insn1)
    }

    /// Did the value of the instruction get merged with other values at a join point?
    pub fn was_merged(&self, insn: InsnId) -> bool {
        self.insns[insn.index()]
            .temporary
            .map_or(false, |temp| self.locals[temp.index()].was_merged())
    }

    pub fn add_target(&mut self, target: Target<'g>) -> TargetId {
        let id = TargetId(self.targets.len() as u32);
        self.targets_by_address.insert(target.address, id);
        self.targets.push(target);
        id
    }

    pub fn target_at(&self, address: u32) -> Option<TargetId> {
        self.targets_by_address.get(&address).copied()
    }

    pub fn target_ids(&self) -> impl Iterator<Item = TargetId> {
        (0..self.targets.len() as u32).map(TargetId)
    }

    /// Target started by a `Phi` or `LoadException`
    pub fn entry_target(&self, insn: InsnId) -> Option<TargetId> {
        self.insns[insn.index()].kind.entry_target()
    }

    /// Is the instruction a `LoadLocal` of a temporary?
    pub fn is_temporary_load(&self, insn: InsnId) -> bool {
        match self.insns[insn.index()].kind {
            InsnKind::LoadLocal { local } => self.locals[local.index()].is_temporary(),
            _ => false,
        }
    }
}

impl<'g> Default for MethodIr<'g> {
    fn default() -> Self {
        MethodIr::new()
    }
}

impl<'g> Index<InsnId> for MethodIr<'g> {
    type Output = Instruction<'g>;

    fn index(&self, id: InsnId) -> &Instruction<'g> {
        &self.insns[id.index()]
    }
}

impl<'g> IndexMut<InsnId> for MethodIr<'g> {
    fn index_mut(&mut self, id: InsnId) -> &mut Instruction<'g> {
        &mut self.insns[id.index()]
    }
}

impl<'g> Index<LocalId> for MethodIr<'g> {
    type Output = Local<'g>;

    fn index(&self, id: LocalId) -> &Local<'g> {
        &self.locals[id.index()]
    }
}

impl<'g> IndexMut<LocalId> for MethodIr<'g> {
    fn index_mut(&mut self, id: LocalId) -> &mut Local<'g> {
        &mut self.locals[id.index()]
    }
}

impl<'g> Index<TargetId> for MethodIr<'g> {
    type Output = Target<'g>;

    fn index(&self, id: TargetId) -> &Target<'g> {
        &self.targets[id.index()]
    }
}

impl<'g> IndexMut<TargetId> for MethodIr<'g> {
    fn index_mut(&mut self, id: TargetId) -> &mut Target<'g> {
        &mut self.targets[id.index()]
    }
}

/// Listing of the instructions, one per line
impl<'g> fmt::Debug for MethodIr<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for id in self.ids() {
            let insn = &self[id];
            write!(f, "#{:<4} [{:>4}] {}", id.0, insn.original_ip, insn)?;
            if let Some(local) = insn.kind.local() {
                write!(f, " {:?}", self[local])?;
            }
            if let Some(temp) = insn.temporary {
                write!(f, " temp{}", temp.0)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;
    use crate::ir::Constant;
    use crate::model::{ContextArenas, TranslationContext};
    use crate::settings::Settings;

    fn with_context<F: for<'g> FnOnce(&TranslationContext<'g>)>(f: F) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        f(&ctx)
    }

    #[test]
    fn linking() {
        with_context(|ctx| {
            let mut ir = MethodIr::new();
            let constant = |value| Instruction::new(InsnKind::LoadConstant(Constant::Int(value)), ctx.core.int, 0);
            let a = ir.create(constant(1));
            let b = ir.create(constant(2));
            let c = ir.create(constant(3));
            ir.append(a);
            ir.append(c);
            ir.insert_before(c, b);
            assert_eq!(ir.ids(), vec![a, b, c]);

            ir.remove(b);
            assert_eq!(ir.ids(), vec![a, c]);
            assert_eq!(ir.len(), 2);
            assert!(!ir[b].is_linked());

            ir.insert_after(c, b);
            assert_eq!(ir.ids(), vec![a, c, b]);
            assert_eq!(ir.tail(), Some(b));

            ir.logically_relocate();
            assert_eq!(ir[b].reloc_ip, 2);
        })
    }

    #[test]
    fn merging_locals_keeps_the_busier_one() {
        with_context(|ctx| {
            let mut ir = MethodIr::new();
            let l1 = ir.add_local(Local::new(ctx.core.int, 1, Some("i".to_owned())));
            let l2 = ir.add_local(Local::new(ctx.core.int, 1, Some("j".to_owned())));
            let load = |local| Instruction::new(InsnKind::LoadLocal { local }, ctx.core.int, 0);
            let a = ir.create(load(l1));
            let b = ir.create(load(l2));
            let c = ir.create(load(l2));
            for insn in [a, b, c] {
                ir.append(insn);
                let local = ir[insn].kind.local().unwrap();
                ir[local].use_defs.push(insn);
            }

            let survivor = ir.merge_locals(l1, l2).unwrap();
            assert_eq!(survivor, l2);
            assert_eq!(ir.merge_root(l1), l2);
            assert_eq!(ir[a].kind.local(), Some(l2));
            assert_eq!(ir[l2].use_defs.len(), 3);
            assert_eq!(ir[l2].name.as_deref(), Some("j+i"));
            assert!(!ir[l2].is_merge_parent);

            // Merging again through the merged-away local is a no-op
            assert_eq!(ir.merge_locals(l2, l1).unwrap(), l2);
        })
    }

    #[test]
    fn merging_temporaries() {
        with_context(|ctx| {
            let mut ir = MethodIr::new();
            let a = ir.create(Instruction::new(InsnKind::LoadConstant(Constant::Null), ctx.core.null_object, 0));
            let b = ir.create(Instruction::new(InsnKind::LoadConstant(Constant::Null), ctx.core.null_object, 3));
            let ta = ir.add_local(Local::temporary(ctx.core.null_object, 0, a));
            let tb = ir.add_local(Local::temporary(ctx.core.null_object, 0, b));
            ir[a].temporary = Some(ta);
            ir[b].temporary = Some(tb);

            assert_eq!(ir.merge_temporaries(a, b, ctx.core.string).unwrap(), a);
            assert_eq!(ir[b].temporary, Some(ta));
            assert!(ir[a].spills() && ir[b].spills());
            assert!(ir.was_merged(a) && ir.was_merged(b));
            assert_eq!(ir[ta].ty, ctx.core.string);
            assert_eq!(ir.merge_temporaries(b, a, ctx.core.string).unwrap(), b);
        })
    }
}
