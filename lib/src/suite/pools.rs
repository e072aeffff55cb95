use crate::ir::ObjectConstant;
use crate::model::Type;
use std::collections::HashMap;

/// Class references and constant objects used by the code of one class
///
/// Entries are numbered in order of first use, and the same class or constant always gets the
/// same index.
#[derive(Default)]
pub struct ClassPools<'g> {
    classes: Vec<Type<'g>>,
    class_indices: HashMap<Type<'g>, u32>,
    objects: Vec<ObjectConstant>,
    object_indices: HashMap<ObjectConstant, u32>,
}

impl<'g> ClassPools<'g> {
    pub fn new() -> ClassPools<'g> {
        ClassPools::default()
    }

    pub fn class_index(&mut self, class: Type<'g>) -> u32 {
        let classes = &mut self.classes;
        *self.class_indices.entry(class).or_insert_with(|| {
            classes.push(class);
            classes.len() as u32 - 1
        })
    }

    pub fn object_index(&mut self, constant: &ObjectConstant) -> u32 {
        if let Some(&index) = self.object_indices.get(constant) {
            return index;
        }
        let index = self.objects.len() as u32;
        self.objects.push(constant.clone());
        self.object_indices.insert(constant.clone(), index);
        index
    }

    pub fn classes(&self) -> &[Type<'g>] {
        &self.classes
    }

    pub fn objects(&self) -> &[ObjectConstant] {
        &self.objects
    }
}
