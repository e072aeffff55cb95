use super::{InsnId, LocalSlot};
use crate::classfile::StackMapEntry;
use crate::model::Type;

/// Stack map address that control can reach other than by falling through
pub struct Target<'g> {
    pub address: u32,

    /// Types recorded in the stack map (refined by the liveness analysis)
    pub entry: StackMapEntry<'g>,

    /// Set for exception handler entry points
    pub exception_type: Option<Type<'g>>,

    /// `Phi` or `LoadException` starting the target
    pub insn: Option<InsnId>,

    /// Reached from a later address (so it starts a loop)
    pub is_backward: bool,

    /// Stack values merged into the target, recorded on first merge
    pub stack: Option<Vec<InsnId>>,

    /// Locals merged into the target, recorded on first merge
    pub locals: Option<Vec<LocalSlot>>,
}

impl<'g> Target<'g> {
    pub fn new(entry: StackMapEntry<'g>) -> Target<'g> {
        Target {
            address: entry.address as u32,
            entry,
            exception_type: None,
            insn: None,
            is_backward: false,
            stack: None,
            locals: None,
        }
    }

    pub fn is_exception_target(&self) -> bool {
        self.exception_type.is_some()
    }

    /// Forget the locals a previous emulation merged into the target
    pub fn reset_locals(&mut self) {
        self.locals = None;
    }
}
