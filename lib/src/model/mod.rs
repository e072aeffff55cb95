//! Types and members, as seen by the translator
//!
//! Everything here is owned by a `TranslationContext` and referenced with the `'g` lifetime of its
//! arenas.

mod bootstrap;
mod context;
mod members;
mod proxy;
mod types;

pub use context::*;
pub use members::*;
pub use proxy::*;
pub use types::*;
