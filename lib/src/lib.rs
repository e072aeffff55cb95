//! Translator from Java classfiles to the suite bytecode of a small embedded VM
//!
//! Classes are read from a `ClassPath` into a `TranslationContext`, which owns every type and
//! member for the duration of a run. Each method with code is then decoded and verified into IR,
//! re-allocated and transformed to fit the VM's restricted stack model, and finally emitted
//! through a `SuiteEmitter`.

pub mod classfile;
pub mod errors;
pub mod ir;
pub mod model;
pub mod settings;
pub mod suite;
pub mod translate;
pub mod util;
