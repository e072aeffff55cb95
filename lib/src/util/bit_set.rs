use std::fmt;

/// Fixed capacity set of small integers
///
/// Used for the liveness analysis, where the universe is the set of local variable indices of a
/// single method.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
    bits: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> BitSet {
        BitSet {
            bits: vec![0; (len + 63) / 64],
            len,
        }
    }

    /// Decode a set from bytes where bit `i` is bit `i % 8` of byte `i / 8`
    pub fn from_lsb_bytes(bytes: &[u8], len: usize) -> BitSet {
        let mut set = BitSet::new(len);
        for idx in 0..len {
            if let Some(byte) = bytes.get(idx / 8) {
                if (byte >> (idx % 8)) & 1 == 1 {
                    set.set(idx);
                }
            }
        }
        set
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.bits[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] |= 1 << (idx % 64);
        }
    }

    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] &= !(1 << (idx % 64));
        }
    }

    pub fn clear_all(&mut self) {
        for word in &mut self.bits {
            *word = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    /// Add all elements of `other`, returning whether anything was added
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            let merged = *a | *b;
            changed |= merged != *a;
            *a = merged;
        }
        changed
    }

    pub fn subtract_with(&mut self, other: &BitSet) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !*b;
        }
    }

    pub fn intersects(&self, other: &BitSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| *a & *b != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |idx| self.get(*idx))
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lsb_bytes() {
        let set = BitSet::from_lsb_bytes(&[0b0000_0101, 0b1000_0000], 16);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2, 15]);
    }

    #[test]
    fn union_reports_change() {
        let mut a = BitSet::new(70);
        let mut b = BitSet::new(70);
        b.set(65);
        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        assert!(a.get(65));
        a.subtract_with(&b);
        assert!(a.is_empty());
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut a = BitSet::new(3);
        a.set(10);
        assert!(!a.get(10));
        assert!(a.is_empty());
    }
}
