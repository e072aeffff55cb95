use super::InsnId;
use crate::model::Type;
use std::fmt;

/// Materialization slot of a value produced on the operand stack
#[derive(Debug, Clone)]
pub struct Temporary {
    /// Word offset of the value on the operand stack when it was produced
    pub stack_slot: usize,

    /// Number of stack entries currently referring to the value
    pub references: usize,

    /// Set once values from different producers were merged at a join point
    pub merged: bool,

    /// Instructions whose result is stored in this temporary
    pub producers: Vec<InsnId>,
}

/// Symbolic local variable
///
/// Locals start out as "one per store" (or per stack map entry) and get merged as the graph
/// builder and the variable re-allocator discover that they are the same variable. Merged locals
/// point at the surviving local through `merge_parent`.
#[derive(Clone)]
pub struct Local<'g> {
    pub ty: Type<'g>,

    /// Slot in the classfile's locals (`None` for temporaries)
    pub javac_index: Option<u16>,

    /// From the `LocalVariableTable`, `+` separated when several variables were merged
    pub name: Option<String>,

    /// Position of the parameter (the receiver is parameter 0 of instance methods)
    pub parameter: Option<u16>,

    /// Instructions reading or writing the local
    pub use_defs: Vec<InsnId>,

    pub merge_parent: Option<super::LocalId>,

    /// Other locals were merged into this one because their live ranges are disjoint
    pub is_merge_parent: bool,

    /// The initializing store of a default value was removed (the VM clears locals on entry)
    pub auto_initialized: bool,

    /// Final slot in the translated method
    pub squawk_index: Option<u16>,

    /// Referenced by at least one surviving instruction (or a parameter)
    pub used: bool,

    pub temporary: Option<Temporary>,
}

impl<'g> Local<'g> {
    pub fn new(ty: Type<'g>, javac_index: u16, name: Option<String>) -> Local<'g> {
        Local {
            ty,
            javac_index: Some(javac_index),
            name,
            parameter: None,
            use_defs: vec![],
            merge_parent: None,
            is_merge_parent: false,
            auto_initialized: false,
            squawk_index: None,
            used: false,
            temporary: None,
        }
    }

    pub fn temporary(ty: Type<'g>, stack_slot: usize, producer: InsnId) -> Local<'g> {
        Local {
            ty,
            javac_index: None,
            name: None,
            parameter: None,
            use_defs: vec![],
            merge_parent: None,
            is_merge_parent: false,
            auto_initialized: false,
            squawk_index: None,
            used: false,
            temporary: Some(Temporary {
                stack_slot,
                references: 0,
                merged: false,
                producers: vec![producer],
            }),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary.is_some()
    }

    pub fn is_parameter(&self) -> bool {
        self.parameter.is_some()
    }

    pub fn was_merged(&self) -> bool {
        self.temporary.as_ref().map_or(false, |temp| temp.merged)
    }

    /// Number of words the local occupies
    pub fn words(&self) -> u16 {
        if self.ty.is_two_words() {
            2
        } else {
            1
        }
    }

    pub(super) fn merge_name(&mut self, other: Option<&str>) {
        let other = match other {
            Some(other) => other,
            None => return,
        };
        if let Some(name) = &mut self.name {
            if !name.split('+').any(|part| part == other) {
                name.push('+');
                name.push_str(other);
            }
        } else {
            self.name = Some(other.to_owned());
        }
    }
}

impl<'g> fmt::Debug for Local<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.name, self.javac_index) {
            (Some(name), _) => write!(f, "{}", name)?,
            (None, Some(index)) => write!(f, "javac{}", index)?,
            (None, None) => f.write_str("temp")?,
        }
        write!(f, ":{}", self.ty)?;
        if let Some(index) = self.squawk_index {
            write!(f, "@{}", index)?;
        }
        Ok(())
    }
}

/// Content of one slot of an emulated locals array
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LocalSlot {
    Empty,
    Value(super::LocalId),

    /// Second word of the two word local in the previous slot
    SecondWord(super::LocalId),
}

impl LocalSlot {
    pub fn local(self) -> Option<super::LocalId> {
        match self {
            LocalSlot::Value(local) => Some(local),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;
    use crate::model::{ContextArenas, TranslationContext};
    use crate::settings::Settings;

    #[test]
    fn names_merge_without_duplicates() {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        let mut local = Local::new(ctx.core.int, 1, Some("i".to_owned()));
        local.merge_name(Some("j"));
        local.merge_name(Some("i"));
        local.merge_name(None);
        assert_eq!(local.name.as_deref(), Some("i+j"));

        let mut unnamed = Local::new(ctx.core.int, 1, None);
        unnamed.merge_name(Some("k"));
        assert_eq!(unnamed.name.as_deref(), Some("k"));
    }
}
