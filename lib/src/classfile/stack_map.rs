use super::{BinaryReader, ConstantPool, LivenessAttribute};
use crate::errors::{LinkageError, Result};
use crate::model::{ProxyTable, TranslationContext, Type};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

/// Stack map item tags
///
/// Note these are the tags of the CLDC `StackMap` attribute, not of `StackMapTable`.
const ITEM_BOGUS: u8 = 0;
const ITEM_INTEGER: u8 = 1;
const ITEM_FLOAT: u8 = 2;
const ITEM_DOUBLE: u8 = 3;
const ITEM_LONG: u8 = 4;
const ITEM_NULL: u8 = 5;
const ITEM_INIT_OBJECT: u8 = 6;
const ITEM_OBJECT: u8 = 7;
const ITEM_NEW_OBJECT: u8 = 8;

/// Types of the locals and stack at one address
#[derive(Clone)]
pub struct StackMapEntry<'g> {
    pub address: u16,

    /// Locals as listed in the attribute (one entry per value)
    pub locals: Vec<Type<'g>>,

    /// Locals indexed by slot (`long` and `double` followed by a second word type)
    pub physical_locals: Vec<Type<'g>>,

    pub stack: Vec<Type<'g>>,
}

impl<'g> StackMapEntry<'g> {
    /// Flip a physical local (both words, for two word types) to `BOGUS`
    ///
    /// Returns whether anything changed.
    pub fn mark_dead(&mut self, ctx: &TranslationContext<'g>, slot: usize) -> bool {
        let ty = match self.physical_locals.get(slot) {
            Some(ty) if !ty.is_bogus() && !ty.is_second_word() => *ty,
            _ => return false,
        };
        self.physical_locals[slot] = ctx.core.bogus;
        if ty.is_two_words() {
            if let Some(second) = self.physical_locals.get_mut(slot + 1) {
                *second = ctx.core.bogus;
            }
        }
        true
    }
}

impl<'g> fmt::Debug for StackMapEntry<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: stack={{", self.address)?;
        for (idx, ty) in self.stack.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ty)?;
        }
        f.write_str("} locals={")?;
        for (idx, ty) in self.physical_locals.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ty)?;
        }
        f.write_str("}")
    }
}

/// Decoded `StackMap` attribute, by address
pub struct StackMap<'g> {
    entries: BTreeMap<u16, StackMapEntry<'g>>,
}

impl<'g> StackMap<'g> {
    pub fn empty() -> StackMap<'g> {
        StackMap {
            entries: BTreeMap::new(),
        }
    }

    /// Decode the attribute body
    ///
    /// `NewObject` items are turned into the method's proxy type for the address of the `new`.
    /// When a liveness attribute is given, locals it says are dead are read as `BOGUS`.
    pub fn read(
        ctx: &TranslationContext<'g>,
        bytes: &[u8],
        file_name: &str,
        pool: &ConstantPool<'g>,
        proxies: &mut ProxyTable<'g>,
        liveness: Option<&LivenessAttribute>,
    ) -> Result<StackMap<'g>> {
        let mut reader = BinaryReader::new(bytes, file_name);
        let count = reader.read_u2()?;
        let mut entries = BTreeMap::new();
        let mut last_address: Option<u16> = None;

        for _ in 0..count {
            let address = reader.read_u2()?;
            if last_address.map_or(false, |last| address <= last) {
                return Err(LinkageError::class_format(format!(
                    "stack map addresses not in order ({} after {:?})",
                    address, last_address
                ))
                .into());
            }
            last_address = Some(address);

            let locals = read_items(ctx, &mut reader, pool, proxies)?;
            let live = liveness.and_then(|liveness| liveness.block_entry(address));
            let mut physical_locals = Vec::with_capacity(locals.len());
            for ty in &locals {
                let slot = physical_locals.len();
                let is_live = live.map_or(true, |live| live.get(slot));
                if !is_live {
                    physical_locals.push(ctx.core.bogus);
                    if ty.is_two_words() {
                        physical_locals.push(ctx.core.bogus);
                    }
                } else {
                    physical_locals.push(*ty);
                    if ty.is_long() {
                        physical_locals.push(ctx.core.long2);
                    } else if ty.is_double() {
                        physical_locals.push(ctx.core.double2);
                    }
                }
            }
            let stack = read_items(ctx, &mut reader, pool, proxies)?;

            entries.insert(
                address,
                StackMapEntry {
                    address,
                    locals,
                    physical_locals,
                    stack,
                },
            );
        }
        Ok(StackMap { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, address: u16) -> Option<&StackMapEntry<'g>> {
        self.entries.get(&address)
    }

    pub fn addresses(&self) -> std::iter::Copied<btree_map::Keys<'_, u16, StackMapEntry<'g>>> {
        self.entries.keys().copied()
    }

    /// Add an entry at an address with no entry yet (used for synthesized targets)
    pub fn insert(&mut self, entry: StackMapEntry<'g>) -> bool {
        if self.entries.contains_key(&entry.address) {
            return false;
        }
        self.entries.insert(entry.address, entry);
        true
    }

    pub fn into_entries(self) -> impl Iterator<Item = StackMapEntry<'g>> {
        self.entries.into_values()
    }
}

fn read_items<'g>(
    ctx: &TranslationContext<'g>,
    reader: &mut BinaryReader,
    pool: &ConstantPool<'g>,
    proxies: &mut ProxyTable<'g>,
) -> Result<Vec<Type<'g>>> {
    let count = reader.read_u2()?;
    let core = &ctx.core;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ty = match reader.read_u1()? {
            ITEM_BOGUS => core.bogus,
            ITEM_INTEGER => core.int,
            ITEM_FLOAT => core.float,
            ITEM_DOUBLE => core.double,
            ITEM_LONG => core.long,
            ITEM_NULL => core.null_object,
            ITEM_INIT_OBJECT => core.init_object,
            ITEM_OBJECT => pool.class_at(reader.read_u2()?)?,
            ITEM_NEW_OBJECT => proxies.proxy_for(ctx, reader.read_u2()?),
            tag => {
                return Err(
                    LinkageError::class_format(format!("bad stack map item tag {}", tag)).into(),
                )
            }
        };
        items.push(ty);
    }
    Ok(items)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;
    use crate::model::ContextArenas;
    use crate::settings::Settings;

    fn with_context<F: for<'g> FnOnce(&TranslationContext<'g>, &ConstantPool<'g>)>(f: F) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        // #1 = Utf8 "java/lang/String", #2 = Class #1
        let mut pool_bytes = vec![0, 3, 1, 0, 16];
        pool_bytes.extend_from_slice(b"java/lang/String");
        pool_bytes.extend_from_slice(&[7, 0, 1]);
        let pool = ConstantPool::read(&ctx, &mut BinaryReader::new(&pool_bytes, "A.class")).unwrap();
        f(&ctx, &pool)
    }

    #[test]
    fn expands_two_word_locals() {
        with_context(|ctx, pool| {
            // one entry at 4: locals [long, Object #2], stack [new@0]
            let bytes = [0, 1, 0, 4, 0, 2, 4, 7, 0, 2, 0, 1, 8, 0, 0];
            let mut proxies = ProxyTable::new();
            let map = StackMap::read(ctx, &bytes, "A.class", pool, &mut proxies, None).unwrap();
            let entry = map.lookup(4).unwrap();
            assert_eq!(entry.locals.len(), 2);
            assert_eq!(entry.physical_locals.len(), 3);
            assert_eq!(entry.physical_locals[1], ctx.core.long2);
            assert_eq!(entry.physical_locals[2], ctx.core.string);
            assert!(entry.stack[0].is_proxy());
            assert_eq!(proxies.get(0), Some(entry.stack[0]));
        })
    }

    #[test]
    fn addresses_must_increase() {
        with_context(|ctx, pool| {
            let bytes = [0, 2, 0, 4, 0, 0, 0, 0, 0, 4, 0, 0, 0, 0];
            let mut proxies = ProxyTable::new();
            assert!(StackMap::read(ctx, &bytes, "A.class", pool, &mut proxies, None).is_err());
        })
    }

    #[test]
    fn addresses_are_listed_in_order() {
        with_context(|ctx, pool| {
            let bytes = [0, 2, 0, 4, 0, 0, 0, 0, 0, 9, 0, 1, 1, 0, 0];
            let mut proxies = ProxyTable::new();
            let mut map = StackMap::read(ctx, &bytes, "A.class", pool, &mut proxies, None).unwrap();
            let synthesized = StackMapEntry {
                address: 6,
                ..map.lookup(4).unwrap().clone()
            };
            assert!(map.insert(synthesized));
            assert_eq!(map.addresses().collect::<Vec<_>>(), vec![4, 6, 9]);
        })
    }

    #[test]
    fn bad_item_tag() {
        with_context(|ctx, pool| {
            let bytes = [0, 1, 0, 4, 0, 1, 9, 0, 0];
            let mut proxies = ProxyTable::new();
            let err = StackMap::read(ctx, &bytes, "A.class", pool, &mut proxies, None)
                .err()
                .unwrap();
            assert!(err.to_string().contains("bad stack map item tag"));
        })
    }

    #[test]
    fn dead_locals_become_bogus() {
        with_context(|ctx, pool| {
            let bytes = [0, 1, 0, 4, 0, 2, 1, 3, 0, 0];
            // live on entry to 4: slot 0 only
            let liveness = LivenessAttribute::read(&[0, 2, 0, 4, 1, 0, 9, 1], "A.class", 3).unwrap();
            let mut proxies = ProxyTable::new();
            let map =
                StackMap::read(ctx, &bytes, "A.class", pool, &mut proxies, Some(&liveness)).unwrap();
            let entry = map.lookup(4).unwrap();
            assert_eq!(entry.physical_locals[0], ctx.core.int);
            assert!(entry.physical_locals[1].is_bogus());
            assert!(entry.physical_locals[2].is_bogus());

            let mut entry = entry.clone();
            assert!(entry.mark_dead(ctx, 0));
            assert!(!entry.mark_dead(ctx, 0));
        })
    }
}
