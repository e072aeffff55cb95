use super::BinaryReader;
use crate::errors::{LinkageError, Result};
use crate::util::BitSet;
use std::collections::HashMap;

/// Decoded `Liveness` attribute
///
/// Entries come in pairs: the live locals on entry to a basic block, then the live locals on
/// exit from it. Each set is `ceil(max_locals / 8)` bytes, least significant bit first.
#[derive(Debug, Clone)]
pub struct LivenessAttribute {
    block_entries: HashMap<u16, BitSet>,
    block_exits: HashMap<u16, BitSet>,
}

impl LivenessAttribute {
    pub fn read(bytes: &[u8], file_name: &str, max_locals: usize) -> Result<LivenessAttribute> {
        let mut reader = BinaryReader::new(bytes, file_name);
        let count = reader.read_u2()?;
        if count % 2 != 0 {
            return Err(
                LinkageError::class_format("odd number of entries in Liveness attribute").into(),
            );
        }

        let set_len = (max_locals + 7) / 8;
        let mut block_entries = HashMap::new();
        let mut block_exits = HashMap::new();
        let mut last_address = 0;
        for idx in 0..count {
            let address = reader.read_u2()?;
            if address < last_address {
                return Err(LinkageError::class_format(format!(
                    "Liveness addresses not in order ({} after {})",
                    address, last_address
                ))
                .into());
            }
            last_address = address;
            let live = BitSet::from_lsb_bytes(&reader.read_bytes(set_len)?, max_locals);
            if idx % 2 == 0 {
                block_entries.insert(address, live);
            } else {
                block_exits.insert(address, live);
            }
        }
        Ok(LivenessAttribute {
            block_entries,
            block_exits,
        })
    }

    /// Locals live on entry to the block starting at an address
    pub fn block_entry(&self, address: u16) -> Option<&BitSet> {
        self.block_entries.get(&address)
    }

    /// Locals live on exit from the block ending at an address
    pub fn block_exit(&self, address: u16) -> Option<&BitSet> {
        self.block_exits.get(&address)
    }

    pub fn len(&self) -> usize {
        self.block_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_entries.is_empty()
    }
}
