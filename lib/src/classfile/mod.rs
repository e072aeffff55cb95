//! Reading classfiles
//!
//! This covers everything up to (but excluding) the decoding of method bodies: the constant pool,
//! class, field and method info, and the attributes the translator cares about.

mod access_flags;
mod attributes;
mod class_path;
mod constant_pool;
mod liveness;
mod loader;
pub mod names;
pub mod opcodes;
mod reader;
mod stack_map;

pub use access_flags::*;
pub use attributes::*;
pub use class_path::*;
pub use constant_pool::*;
pub use liveness::*;
pub use loader::load_class;
pub use reader::*;
pub use stack_map::*;
