use super::{InsnId, InsnKind, MethodIr};
use crate::errors::Result;

macro_rules! visit_methods {
    ($($(#[$attr:meta])* $method:ident,)*) => {
        $(
            $(#[$attr])*
            fn $method(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
                self.visit_instruction(ir, id)
            }
        )*
    };
}

/// Per-kind callbacks over the instructions of a method
///
/// Every callback defaults to `visit_instruction`, so a visitor only needs to override the kinds
/// it treats specially. Callbacks get the whole `MethodIr` so they can insert or remove
/// instructions around the one being visited.
pub trait InstructionVisitor<'g> {
    /// Fallback for every kind that is not overridden
    fn visit_instruction(&mut self, _ir: &mut MethodIr<'g>, _id: InsnId) -> Result<()> {
        Ok(())
    }

    visit_methods! {
        visit_arithmetic,
        visit_negate,
        visit_convert,
        visit_load_constant,
        visit_load_constant_object,
        visit_load_synthetic,
        visit_load_local,
        visit_store_local,
        visit_inc_dec_local,
        visit_load_field,
        visit_store_field,
        visit_load_indexed,
        visit_store_indexed,
        visit_array_length,
        visit_new_array,
        visit_new_dimension,
        visit_new_object,
        visit_invoke,
        visit_check_cast,
        visit_instance_of,
        visit_monitor_enter,
        visit_monitor_exit,
        visit_throw,
        visit_return,
        visit_goto,
        visit_if,
        visit_table_switch,
        visit_lookup_switch,
        visit_pop,
        visit_lookup,
        visit_phi,
        visit_load_exception,
        visit_handler_enter,
        visit_handler_exit,
    }
}

/// Call the callback matching the kind of the instruction
pub fn dispatch<'g, V: InstructionVisitor<'g> + ?Sized>(
    visitor: &mut V,
    ir: &mut MethodIr<'g>,
    id: InsnId,
) -> Result<()> {
    use InsnKind::*;
    match ir[id].kind {
        Arithmetic { .. } => visitor.visit_arithmetic(ir, id),
        Negate { .. } => visitor.visit_negate(ir, id),
        Convert { .. } => visitor.visit_convert(ir, id),
        LoadConstant(_) => visitor.visit_load_constant(ir, id),
        LoadConstantObject(_) => visitor.visit_load_constant_object(ir, id),
        LoadSynthetic => visitor.visit_load_synthetic(ir, id),
        LoadLocal { .. } => visitor.visit_load_local(ir, id),
        StoreLocal { .. } => visitor.visit_store_local(ir, id),
        IncDecLocal { .. } => visitor.visit_inc_dec_local(ir, id),
        LoadField { .. } => visitor.visit_load_field(ir, id),
        StoreField { .. } => visitor.visit_store_field(ir, id),
        LoadIndexed { .. } => visitor.visit_load_indexed(ir, id),
        StoreIndexed { .. } => visitor.visit_store_indexed(ir, id),
        ArrayLength { .. } => visitor.visit_array_length(ir, id),
        NewArray { .. } => visitor.visit_new_array(ir, id),
        NewDimension { .. } => visitor.visit_new_dimension(ir, id),
        NewObject => visitor.visit_new_object(ir, id),
        Invoke { .. } => visitor.visit_invoke(ir, id),
        CheckCast { .. } => visitor.visit_check_cast(ir, id),
        InstanceOf { .. } => visitor.visit_instance_of(ir, id),
        MonitorEnter { .. } => visitor.visit_monitor_enter(ir, id),
        MonitorExit { .. } => visitor.visit_monitor_exit(ir, id),
        Throw { .. } => visitor.visit_throw(ir, id),
        Return { .. } => visitor.visit_return(ir, id),
        Goto { .. } => visitor.visit_goto(ir, id),
        If { .. } => visitor.visit_if(ir, id),
        TableSwitch { .. } => visitor.visit_table_switch(ir, id),
        LookupSwitch { .. } => visitor.visit_lookup_switch(ir, id),
        Pop { .. } => visitor.visit_pop(ir, id),
        Lookup { .. } => visitor.visit_lookup(ir, id),
        Phi { .. } => visitor.visit_phi(ir, id),
        LoadException { .. } => visitor.visit_load_exception(ir, id),
        HandlerEnter { .. } => visitor.visit_handler_enter(ir, id),
        HandlerExit { .. } => visitor.visit_handler_exit(ir, id),
    }
}

/// Visit every linked instruction in order
///
/// Instructions inserted around the one being visited are not visited themselves.
pub fn visit_all<'g, V: InstructionVisitor<'g> + ?Sized>(
    visitor: &mut V,
    ir: &mut MethodIr<'g>,
) -> Result<()> {
    for id in ir.ids() {
        if ir[id].is_linked() {
            dispatch(visitor, ir, id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;
    use crate::ir::{Constant, Instruction};
    use crate::model::{ContextArenas, TranslationContext};
    use crate::settings::Settings;

    #[derive(Default)]
    struct Counter {
        constants: usize,
        others: usize,
    }

    impl<'g> InstructionVisitor<'g> for Counter {
        fn visit_instruction(&mut self, _ir: &mut MethodIr<'g>, _id: InsnId) -> Result<()> {
            self.others += 1;
            Ok(())
        }

        fn visit_load_constant(&mut self, ir: &mut MethodIr<'g>, id: InsnId) -> Result<()> {
            self.constants += 1;
            let pop = Instruction::new(InsnKind::Pop { value: id }, ir[id].ty, 0);
            let pop = ir.create(pop);
            ir.insert_after(id, pop);
            Ok(())
        }
    }

    #[test]
    fn dispatch_falls_back_to_visit_instruction() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        let mut ir = MethodIr::new();
        let constant = ir.create(Instruction::new(
            InsnKind::LoadConstant(Constant::Int(3)),
            ctx.core.int,
            0,
        ));
        let ret = ir.create(Instruction::new(
            InsnKind::Return { value: None },
            ctx.core.void,
            1,
        ));
        ir.append(constant);
        ir.append(ret);

        let mut counter = Counter::default();
        visit_all(&mut counter, &mut ir).unwrap();
        assert_eq!(counter.constants, 1);
        assert_eq!(counter.others, 1);
        assert_eq!(ir.len(), 3);
    }
}
