use std::fmt::{Debug, Error, Formatter};
use std::slice::Iter;

/// Elements with a width in words (eg. when used in an `OffsetVec`)
pub trait Width {
    fn width(&self) -> usize;
}

/// A vector of elements of different logical "widths", where offsets into the vector are given in
/// terms of the sum of the widths of the previous elements (as opposed to the number of preceding
/// elements).
///
/// The operand stack is the main user: `len` is the logical depth (one entry per value) while
/// `offset_len` is the depth in words (longs and doubles count twice), which is what `max_stack`
/// and stack maps are expressed in.
#[derive(Clone)]
pub struct OffsetVec<T: Sized> {
    /// Entries, along with their offset
    entries: Vec<(Offset, T)>,

    /// Offset of the next element to be added
    offset_len: Offset,
}

/// Offset into an `OffsetVec`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

impl<T: Sized + Width> OffsetVec<T> {
    pub fn new() -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: Offset(0),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the widths of all entries
    pub fn offset_len(&self) -> Offset {
        self.offset_len
    }

    /// Add an entry to the back, returning its offset
    pub fn push(&mut self, slot: T) -> Offset {
        let offset = self.offset_len;
        self.offset_len.0 += slot.width();
        self.entries.push((offset, slot));
        offset
    }

    /// Remove an entry from the back
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop().map(|(off, elem)| {
            self.offset_len = off;
            elem
        })
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.last().map(|(_, elem)| elem)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset_len = Offset(0);
    }

    /// Get an entry by its position (not its offset)
    pub fn get_index(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|(_, elem)| elem)
    }

    /// Replace the entry at a position
    ///
    /// The replacement must have the same width, otherwise the offsets of the following entries
    /// would be invalidated. Returns `false` (and leaves the vector untouched) when it does not.
    pub fn set_index(&mut self, index: usize, value: T) -> bool {
        match self.entries.get_mut(index) {
            Some((_, slot)) if slot.width() == value.width() => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.entries.iter().map(|(_, elem)| elem)
    }

    /// Iterate with offsets
    pub fn iter_offsets(&self) -> Iter<'_, (Offset, T)> {
        self.entries.iter()
    }
}

impl<A: Width> Default for OffsetVec<A> {
    fn default() -> Self {
        OffsetVec::new()
    }
}

impl<T: Width> FromIterator<T> for OffsetVec<T> {
    fn from_iter<A: IntoIterator<Item = T>>(elems: A) -> Self {
        let mut offset_vec = OffsetVec::new();
        for elem in elems {
            offset_vec.push(elem);
        }
        offset_vec
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut list = f.debug_list();
        for (off, elem) in &self.entries {
            list.entry(&format_args!("#{} = {:?}", off.0, elem));
        }
        list.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    enum Value {
        Int(i32),
        Long(i64),
    }

    impl Width for Value {
        fn width(&self) -> usize {
            match self {
                Value::Int(_) => 1,
                Value::Long(_) => 2,
            }
        }
    }

    #[test]
    fn words_and_positions() {
        let mut stack: OffsetVec<Value> = vec![Value::Int(1), Value::Long(2), Value::Int(3)]
            .into_iter()
            .collect();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.offset_len(), Offset(4));
        assert_eq!(stack.pop(), Some(Value::Int(3)));
        assert_eq!(stack.offset_len(), Offset(3));
        assert_eq!(stack.pop(), Some(Value::Long(2)));
        assert_eq!(stack.offset_len(), Offset(1));
    }

    #[test]
    fn replacing_keeps_widths() {
        let mut stack: OffsetVec<Value> = vec![Value::Int(1), Value::Long(2)].into_iter().collect();
        assert!(stack.set_index(0, Value::Int(7)));
        assert!(!stack.set_index(1, Value::Int(7)));
        assert_eq!(stack.get_index(0), Some(&Value::Int(7)));
        assert_eq!(stack.get_index(1), Some(&Value::Long(2)));
        assert_eq!(stack.offset_len(), Offset(3));
    }
}
