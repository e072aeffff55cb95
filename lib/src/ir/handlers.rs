use super::{HandlerId, InsnId, TargetId};
use crate::model::Type;

/// One exception handler of a method
#[derive(Debug, Clone)]
pub struct HandlerEntry<'g> {
    /// `HandlerEnter` at the start of the protected range
    pub start: Option<InsnId>,

    /// `HandlerExit` at the end of the protected range
    pub end: Option<InsnId>,

    /// `LoadException` at the start of the handler code
    pub entry: Option<InsnId>,

    pub target: TargetId,
    pub catch_type: Type<'g>,

    /// Protected range and handler address in the original bytecode
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
}

/// Exception handlers, in the order they are searched
#[derive(Debug, Clone, Default)]
pub struct ExceptionHandlerTable<'g> {
    entries: Vec<HandlerEntry<'g>>,
}

impl<'g> ExceptionHandlerTable<'g> {
    pub fn new() -> ExceptionHandlerTable<'g> {
        ExceptionHandlerTable { entries: vec![] }
    }

    pub fn add(&mut self, entry: HandlerEntry<'g>) -> HandlerId {
        let id = HandlerId(self.entries.len() as u32);
        self.entries.push(entry);
        id
    }

    pub fn get(&self, id: HandlerId) -> Option<&HandlerEntry<'g>> {
        self.entries.get(id.index())
    }

    pub fn get_mut(&mut self, id: HandlerId) -> Option<&mut HandlerEntry<'g>> {
        self.entries.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandlerId, &HandlerEntry<'g>)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (HandlerId(idx as u32), entry))
    }
}
