//! Live variable analysis over the javac slots of a method
//!
//! The stack maps emitted by javac are conservative: a slot can be typed at a branch target even
//! though its value is never read again. Such slots would force unrelated variables sharing the
//! slot to be merged into one local, so every slot that is not live on entry to a target is turned
//! into `BOGUS` in the target's stack map entry before locals are re-allocated.

use super::graph_builder::SYNTHETIC_ADDRESS;
use crate::classfile::LivenessAttribute;
use crate::errors::{assert_that, AssertionFailed, LinkageError, Result, VerifyErrorKind};
use crate::ir::{InsnId, InsnKind, LocalId, MethodIr, TargetId};
use crate::model::{MethodData, TranslationContext};
use crate::util::BitSet;
use std::collections::HashMap;
use std::fmt;

/// Run of instructions entered only at its start and left only at its end
///
/// Besides the usual delimiters, a block ends at every instruction that can throw while an
/// exception handler is active, so that handlers are successors of the blocks that reach them.
pub struct BasicBlock {
    /// First instruction (a `Phi` or `LoadException` when the block starts at a target)
    pub start: InsnId,
    pub end: InsnId,

    /// Targets of the handlers protecting the trapping instruction ending the block
    pub handlers: Vec<TargetId>,

    /// Indices of the successor blocks
    pub successors: Vec<usize>,

    pub live_in: BitSet,
    pub live_out: BitSet,
    defs: BitSet,
    uses: BitSet,
}

impl BasicBlock {
    fn new(start: InsnId, max_locals: usize) -> BasicBlock {
        BasicBlock {
            start,
            end: start,
            handlers: vec![],
            successors: vec![],
            live_in: BitSet::new(max_locals),
            live_out: BitSet::new(max_locals),
            defs: BitSet::new(max_locals),
            uses: BitSet::new(max_locals),
        }
    }

    /// Target the block starts at
    pub fn target(&self, ir: &MethodIr) -> Option<TargetId> {
        ir.entry_target(self.start)
    }

    /// Recompute the live sets from the successors, returning whether they changed
    fn flow(&mut self, successor_ins: Option<BitSet>) -> bool {
        let out = successor_ins.unwrap_or_else(|| self.live_out.clone());
        let mut live_in = out.clone();
        live_in.subtract_with(&self.defs);
        live_in.union_with(&self.uses);
        let changed = live_in != self.live_in || out != self.live_out;
        self.live_in = live_in;
        self.live_out = out;
        changed
    }
}

impl fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{}..#{} succ={:?} in={:?} out={:?} def={:?} use={:?}",
            self.start.0,
            self.end.0,
            self.successors,
            self.live_in,
            self.live_out,
            self.defs,
            self.uses
        )
    }
}

/// Basic blocks of a method in instruction order
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,

    /// Reachable blocks in depth first order from the entry block
    pub order: Vec<usize>,

    /// Some stack map entry had a slot turned into `BOGUS`
    pub changed_stack_maps: bool,
}

impl ControlFlowGraph {
    /// Index of the block following a block in instruction order
    pub fn next_block(&self, idx: usize) -> Option<usize> {
        if idx + 1 < self.blocks.len() {
            Some(idx + 1)
        } else {
            None
        }
    }
}

/// Compute which javac slots are live at every block boundary and prune the stack maps
///
/// With a `Liveness` attribute (and `verify_liveness` set) the attribute is checked against the
/// analysis instead: every block starting at a stack map address must have entry and exit sets
/// in the attribute that agree with the computed ones.
pub fn analyse<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    ir: &mut MethodIr<'g>,
    max_locals: usize,
    liveness: Option<&LivenessAttribute>,
) -> Result<ControlFlowGraph> {
    ir.logically_relocate();
    let (blocks, block_at) = build_blocks(ir, max_locals)?;
    let mut cfg = ControlFlowGraph {
        blocks,
        order: vec![],
        changed_stack_maps: false,
    };
    if cfg.blocks.is_empty() {
        return Ok(cfg);
    }
    link_successors(ir, &mut cfg.blocks, &block_at)?;
    cfg.order = depth_first_order(&cfg.blocks);

    let entry = &mut cfg.blocks[0];
    for (javac_index, parameter) in ir.parameters.iter().enumerate() {
        if let Some(local) = parameter {
            entry.live_in.set(javac_index);
            if ir[*local].ty.is_two_words() {
                entry.live_in.set(javac_index + 1);
            }
        }
    }

    solve(&mut cfg);
    if log::log_enabled!(log::Level::Trace) {
        for (idx, block) in cfg.blocks.iter().enumerate() {
            log::trace!("  bb{} {:?}", idx, block);
        }
    }

    match liveness {
        Some(attribute) if ctx.settings.verify_liveness => {
            check_attribute(ir, &cfg, attribute)?;
        }
        _ => cfg.changed_stack_maps = prune_stack_maps(ctx, ir, &cfg),
    }
    log::debug!(
        "liveness of {}: {} blocks ({} reachable), stack maps {}",
        method,
        cfg.blocks.len(),
        cfg.order.len(),
        if cfg.changed_stack_maps { "pruned" } else { "unchanged" }
    );
    Ok(cfg)
}

fn build_blocks(ir: &MethodIr, max_locals: usize) -> Result<(Vec<BasicBlock>, HashMap<u32, usize>)> {
    let mut blocks = vec![];
    let mut block_at = HashMap::new();
    let mut active: Vec<TargetId> = vec![];
    let mut current: Option<BasicBlock> = None;

    for id in ir.ids() {
        match ir[id].kind {
            InsnKind::HandlerEnter { handler } => {
                if let (Some(block), Some(prev)) = (current.take(), ir.prev(id)) {
                    close_block(ir, block, prev, &active, &mut blocks, &mut block_at)?;
                }
                let target = ir
                    .handlers
                    .get(handler)
                    .map(|entry| entry.target)
                    .ok_or_else(|| AssertionFailed::new("handler enter without a handler"))?;
                active.push(target);
                continue;
            }
            InsnKind::HandlerExit { .. } => {
                active.pop();
                continue;
            }
            InsnKind::LoadException { .. } => {
                assert_that(current.is_none(), "falling through into an exception handler")?;
                current = Some(BasicBlock::new(id, max_locals));
                continue;
            }
            InsnKind::Phi { .. } => {
                if let (Some(block), Some(prev)) = (current.take(), ir.prev(id)) {
                    close_block(ir, block, prev, &active, &mut blocks, &mut block_at)?;
                }
                current = Some(BasicBlock::new(id, max_locals));
                continue;
            }
            _ => (),
        }

        let block = current.get_or_insert_with(|| BasicBlock::new(id, max_locals));
        let kind = &ir[id].kind;
        if let Some(local) = kind.local() {
            let (javac_index, two_words) = slot_of(ir, local)?;
            if kind.is_use() && !block.defs.get(javac_index) {
                block.uses.set(javac_index);
                if two_words {
                    block.uses.set(javac_index + 1);
                }
            }
            if kind.is_definition() {
                block.defs.set(javac_index);
                if two_words {
                    block.defs.set(javac_index + 1);
                }
            }
        } else if kind.is_block_exit() || (!active.is_empty() && kind.can_trap()) {
            if let Some(block) = current.take() {
                close_block(ir, block, id, &active, &mut blocks, &mut block_at)?;
            }
        }
    }
    assert_that(current.is_none(), "last block does not end with an exit")?;
    Ok((blocks, block_at))
}

fn slot_of(ir: &MethodIr, local: LocalId) -> Result<(usize, bool)> {
    match ir[local].javac_index {
        Some(index) => Ok((index as usize, ir[local].ty.is_two_words())),
        None => Err(AssertionFailed::new("temporary local before re-allocation").into()),
    }
}

fn close_block(
    ir: &MethodIr,
    mut block: BasicBlock,
    mut end: InsnId,
    active: &[TargetId],
    blocks: &mut Vec<BasicBlock>,
    block_at: &mut HashMap<u32, usize>,
) -> Result<()> {
    while let InsnKind::HandlerExit { .. } = ir[end].kind {
        end = match ir.prev(end) {
            Some(prev) => prev,
            None => return Ok(()),
        };
    }
    // A target immediately followed by another target holds no code
    if ir[end].kind.is_pseudo() && end == block.start {
        return Ok(());
    }
    assert_that(!ir[end].kind.is_pseudo(), "block ends with a pseudo instruction")?;
    block.end = end;
    let kind = &ir[end].kind;
    if !active.is_empty() && (matches!(kind, InsnKind::Throw { .. }) || kind.can_trap()) {
        block.handlers = active.to_vec();
    }
    let ip = block_ip(ir, block.start)?;
    let previous = block_at.insert(ip, blocks.len());
    assert_that(previous.is_none(), "two blocks at one address")?;
    blocks.push(block);
    Ok(())
}

/// Address identifying the block an instruction starts
///
/// Pseudo instructions are skipped, so a branch to an empty target lands on the block of the
/// target that follows it.
fn block_ip(ir: &MethodIr, insn: InsnId) -> Result<u32> {
    ir.real(insn)
        .map(|real| ir[real].reloc_ip)
        .ok_or_else(|| AssertionFailed::new("target at the end of the method").into())
}

fn link_successors(
    ir: &MethodIr,
    blocks: &mut [BasicBlock],
    block_at: &HashMap<u32, usize>,
) -> Result<()> {
    let lookup = |insn: InsnId| -> Result<usize> {
        let ip = block_ip(ir, insn)?;
        block_at
            .get(&ip)
            .copied()
            .ok_or_else(|| AssertionFailed::new(format!("no block at {}", ip)).into())
    };
    let target_insn = |target: TargetId| -> Result<InsnId> {
        ir[target]
            .insn
            .ok_or_else(|| AssertionFailed::new("target without an instruction").into())
    };
    let next_insn = |end: InsnId| -> Result<InsnId> {
        ir.next(end)
            .ok_or_else(|| AssertionFailed::new("falling off the end of the method").into())
    };

    for block in blocks.iter_mut() {
        let kind = &ir[block.end].kind;
        let mut successors = vec![];
        if kind.is_block_exit() {
            for target in kind.targets() {
                successors.push(lookup(target_insn(target)?)?);
            }
            if kind.falls_through() {
                successors.push(lookup(next_insn(block.end)?)?);
            }
        } else {
            successors.push(lookup(next_insn(block.end)?)?);
        }
        for &handler in &block.handlers {
            successors.push(lookup(target_insn(handler)?)?);
        }
        for successor in successors {
            if !block.successors.contains(&successor) {
                block.successors.push(successor);
            }
        }
    }
    Ok(())
}

fn depth_first_order(blocks: &[BasicBlock]) -> Vec<usize> {
    let mut visited = vec![false; blocks.len()];
    let mut order = Vec::with_capacity(blocks.len());
    let mut pending = vec![0];
    while let Some(idx) = pending.pop() {
        if visited[idx] {
            continue;
        }
        visited[idx] = true;
        order.push(idx);
        pending.extend(blocks[idx].successors.iter().rev().copied());
    }
    order
}

/// Iterate backwards over the depth first order until no live set changes
fn solve(cfg: &mut ControlFlowGraph) {
    loop {
        let mut changed = false;
        for &idx in cfg.order.iter().rev() {
            let successor_ins = if cfg.blocks[idx].successors.is_empty() {
                None
            } else {
                let mut out = BitSet::new(cfg.blocks[idx].live_out.capacity());
                for &successor in &cfg.blocks[idx].successors {
                    out.union_with(&cfg.blocks[successor].live_in);
                }
                Some(out)
            };
            changed |= cfg.blocks[idx].flow(successor_ins);
        }
        if !changed {
            break;
        }
    }
}

/// Turn every slot that is not live on entry to a target into `BOGUS`
fn prune_stack_maps<'g>(
    ctx: &TranslationContext<'g>,
    ir: &mut MethodIr<'g>,
    cfg: &ControlFlowGraph,
) -> bool {
    let mut changed = false;
    for block in &cfg.blocks {
        let target = match block.target(ir) {
            Some(target) if ir[target].address != SYNTHETIC_ADDRESS => target,
            _ => continue,
        };
        let entry = &mut ir[target].entry;
        for slot in 0..entry.physical_locals.len() {
            if !block.live_in.get(slot) && entry.mark_dead(ctx, slot) {
                log::trace!("slot {} is dead at {}", slot, entry.address);
                changed = true;
            }
        }
    }
    changed
}

fn check_attribute(
    ir: &MethodIr,
    cfg: &ControlFlowGraph,
    attribute: &LivenessAttribute,
) -> Result<()> {
    for block in &cfg.blocks {
        let address = match block.target(ir) {
            Some(target) if ir[target].address != SYNTHETIC_ADDRESS => ir[target].address,
            _ => continue,
        };
        let end = ir[block.end].original_ip;
        let entry = attribute.block_entry(address as u16).ok_or_else(|| {
            LinkageError::verify(
                VerifyErrorKind::BadLiveness,
                format!("missing live in for the block at {}", address),
            )
        })?;
        let exit = attribute.block_exit(end as u16).ok_or_else(|| {
            LinkageError::verify(
                VerifyErrorKind::BadLiveness,
                format!("missing live out for the block ending at {}", end),
            )
        })?;
        if *entry != block.live_in || *exit != block.live_out {
            return Err(LinkageError::verify(
                VerifyErrorKind::BadLiveness,
                format!(
                    "block {}..{}: attribute says {:?}/{:?}, derived {:?}/{:?}",
                    address, end, entry, exit, block.live_in, block.live_out
                ),
            )
            .into());
        }
    }
    Ok(())
}
