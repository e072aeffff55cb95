//! Translation of method bodies, from classfile bytecode to suite code
//!
//! Every method goes through the same pipeline:
//!
//!   1. the graph builder decodes and verifies the bytecode into IR
//!   2. liveness analysis prunes the stack maps to the live locals
//!   3. the reallocator splits javac slots into independent locals
//!   4. the transformer makes the IR fit the restricted stack model and assigns local slots
//!   5. the producer emits the result through a `SuiteEmitter`

mod bytecode_stream;
mod frame;
pub mod graph_builder;
pub mod liveness;
pub mod producer;
pub mod reallocator;
mod statistics;
pub mod transformer;

pub use statistics::*;

use crate::classfile::LivenessAttribute;
use crate::errors::{ErrorContext, LinkageError, LinkageErrorKind, Result};
use crate::model::{BytecodeHolder, LoadingState, MethodData, TranslationContext, Type};
use crate::suite::{ClassPools, SuiteEmitter};

/// Translate every method with code in a class
///
/// The class is loaded first if needed. A class that fails is marked `Failed`, dropped from the
/// emitter and the error is returned; other classes are unaffected. Translating a `Failed` class
/// again is an error.
pub fn translate_class<'g>(
    ctx: &TranslationContext<'g>,
    class: Type<'g>,
    emitter: &mut dyn SuiteEmitter<'g>,
) -> Result<()> {
    let result = ctx
        .load(class)
        .and_then(|()| convert_class(ctx, class, emitter))
        .context(|| format!("translating {}", class));
    match result {
        Ok(()) => {
            Statistics::bump(&ctx.statistics.classes, 1);
            Ok(())
        }
        Err(err) => {
            log::warn!("{}", err);
            if class.state() == LoadingState::Converting {
                class.set_state(LoadingState::Failed);
            }
            Statistics::bump(&ctx.statistics.classes_failed, 1);
            Err(err)
        }
    }
}

fn convert_class<'g>(
    ctx: &TranslationContext<'g>,
    class: Type<'g>,
    emitter: &mut dyn SuiteEmitter<'g>,
) -> Result<()> {
    match class.state() {
        LoadingState::Converted => return Ok(()),

        // The bytecode of the methods tried before the failure is gone
        LoadingState::Failed => {
            return Err(LinkageError::new(
                LinkageErrorKind::LinkageError,
                format!("{} already failed to translate", class.name),
            )
            .into())
        }
        _ => (),
    }
    log::info!("translating {}", class);
    class.set_state(LoadingState::Converting);

    emitter.begin_class(class);
    let mut pools = ClassPools::new();
    if let Err(err) = convert_methods(ctx, class, &mut pools, emitter) {
        emitter.abort_class();
        return Err(err);
    }
    emitter.end_class(pools.classes(), pools.objects());

    class.set_state(LoadingState::Converted);
    Ok(())
}

fn convert_methods<'g>(
    ctx: &TranslationContext<'g>,
    class: Type<'g>,
    pools: &mut ClassPools<'g>,
    emitter: &mut dyn SuiteEmitter<'g>,
) -> Result<()> {
    for method in class.methods() {
        match method.take_bytecode() {
            Some(holder) => {
                translate_method(ctx, method, &holder, pools, emitter)
                    .context(|| format!("in {}", method))?;
            }
            None => log::debug!("{} has no code", method),
        }
    }
    Ok(())
}

/// Run one method through the whole pipeline, returning the length of its code
///
/// Class references and constant objects used by the code are added to `pools`.
pub fn translate_method<'g>(
    ctx: &TranslationContext<'g>,
    method: &'g MethodData<'g>,
    holder: &BytecodeHolder,
    pools: &mut ClassPools<'g>,
    emitter: &mut dyn SuiteEmitter<'g>,
) -> Result<u32> {
    let max_locals = holder.max_locals as usize;
    let attribute = match &holder.liveness {
        Some(bytes) if ctx.settings.verify_liveness => Some(LivenessAttribute::read(
            bytes,
            &method.parent.name,
            max_locals,
        )?),
        _ => None,
    };

    let mut ir = graph_builder::build(ctx, method, holder, attribute.as_ref())?;
    let cfg = liveness::analyse(ctx, method, &mut ir, max_locals, attribute.as_ref())?;
    let local_variables = holder.local_variables.as_ref();
    reallocator::reallocate(ctx, method, &mut ir, &cfg, max_locals, local_variables)?;
    let locals = transformer::transform(ctx, method, &mut ir)?;
    log::trace!("transformed {}:\n{:?}", method, ir);

    let length = producer::produce(ctx, method, &mut ir, &locals, pools, emitter)?;
    Statistics::bump(&ctx.statistics.methods, 1);
    Ok(length)
}
