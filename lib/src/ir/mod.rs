//! Intermediate representation of method bodies
//!
//! The graph builder decodes a method's bytecode into a doubly linked list of instructions. The
//! list lives in a per-method arena (`MethodIr`): instructions, locals and branch targets are
//! addressed by ids, so operands are shared rather than copied and instructions can be inserted
//! or removed while other instructions keep pointing at their neighbours.

mod handlers;
mod instruction;
mod local;
mod method;
mod target;
mod visitor;

pub use handlers::*;
pub use instruction::*;
pub use local::*;
pub use method::*;
pub use target::*;
pub use visitor::*;

macro_rules! arena_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Instruction in a `MethodIr`
    InsnId
);
arena_id!(
    /// Local variable (or temporary) in a `MethodIr`
    LocalId
);
arena_id!(
    /// Branch or exception target in a `MethodIr`
    TargetId
);
arena_id!(
    /// Entry of a method's exception handler table
    HandlerId
);
