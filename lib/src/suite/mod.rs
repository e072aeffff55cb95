//! Output side of the translator
//!
//! The bytecode producer talks to a `SuiteEmitter`, describing instructions symbolically (with
//! their operands already narrowed). Turning those into bytes is the business of the emitter:
//! opcode values only exist in the binary backend.

mod binary;
mod binary_format;
mod emitter;
mod opcodes;
mod pools;
mod recording;

pub use binary::{BinarySuiteEmitter, BRANCH_ENCODINGS};
pub use emitter::*;
pub use pools::*;
pub use recording::*;
