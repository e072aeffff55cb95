use super::{BinaryReader, ConstantPool};
use crate::errors::{LinkageError, Result};

/// Decoded `LineNumberTable` attribute
///
/// Entries are kept sorted by start address. Several `LineNumberTable` attributes in the same
/// `Code` attribute are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineNumberTable {
    entries: Vec<(u16, u16)>,
}

impl LineNumberTable {
    pub fn read(reader: &mut BinaryReader, code_length: usize) -> Result<LineNumberTable> {
        let mut table = LineNumberTable::default();
        table.read_more(reader, code_length)?;
        Ok(table)
    }

    pub fn read_more(&mut self, reader: &mut BinaryReader, code_length: usize) -> Result<()> {
        let count = reader.read_u2()?;
        for _ in 0..count {
            let start_pc = reader.read_u2()?;
            let line = reader.read_u2()?;
            if start_pc as usize >= code_length {
                return Err(LinkageError::class_format(format!(
                    "line number entry at {} is outside the code",
                    start_pc
                ))
                .into());
            }
            self.entries.push((start_pc, line));
        }
        self.entries.sort_unstable();
        Ok(())
    }

    /// Source line of the instruction at an address
    pub fn line_for(&self, ip: u16) -> Option<u16> {
        match self.entries.binary_search_by_key(&ip, |(start, _)| *start) {
            Ok(idx) => Some(self.entries[idx].1),
            Err(0) => None,
            Err(idx) => Some(self.entries[idx - 1].1),
        }
    }

    pub fn entries(&self) -> &[(u16, u16)] {
        &self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name: String,
    pub descriptor: String,
    pub index: u16,
}

/// Decoded `LocalVariableTable` attribute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalVariableTable {
    entries: Vec<LocalVariable>,
}

impl LocalVariableTable {
    pub fn read(
        reader: &mut BinaryReader,
        pool: &ConstantPool,
        code_length: usize,
    ) -> Result<LocalVariableTable> {
        let count = reader.read_u2()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let start_pc = reader.read_u2()?;
            let length = reader.read_u2()?;
            let name = pool.utf8(reader.read_u2()?)?.to_owned();
            let descriptor = pool.utf8(reader.read_u2()?)?.to_owned();
            let index = reader.read_u2()?;
            if start_pc as usize >= code_length || start_pc as usize + length as usize > code_length {
                return Err(LinkageError::class_format(format!(
                    "local variable {} ranges past the end of the code",
                    name
                ))
                .into());
            }
            entries.push(LocalVariable {
                start_pc,
                length,
                name,
                descriptor,
                index,
            });
        }
        Ok(LocalVariableTable { entries })
    }

    /// Name of the variable in a slot at an address
    ///
    /// The end of a scope is inclusive, so looking up the address following a store (where javac
    /// starts the scope of the variable being initialized) finds the variable.
    pub fn name_at(&self, ip: u16, index: u16) -> Option<&str> {
        self.entries
            .iter()
            .find(|var| {
                var.index == index
                    && var.start_pc <= ip
                    && ip as usize <= var.start_pc as usize + var.length as usize
            })
            .map(|var| var.name.as_str())
    }

    pub fn entries(&self) -> &[LocalVariable] {
        &self.entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lines_cover_ranges() {
        let bytes = [0, 3, 0, 10, 0, 7, 0, 0, 0, 5, 0, 4, 0, 6];
        let mut reader = BinaryReader::new(&bytes, "A.class");
        let table = LineNumberTable::read(&mut reader, 20).unwrap();
        assert_eq!(table.line_for(0), Some(5));
        assert_eq!(table.line_for(3), Some(5));
        assert_eq!(table.line_for(4), Some(6));
        assert_eq!(table.line_for(19), Some(7));
    }

    #[test]
    fn lines_outside_code_are_rejected() {
        let bytes = [0, 1, 0, 30, 0, 7];
        let mut reader = BinaryReader::new(&bytes, "A.class");
        assert!(LineNumberTable::read(&mut reader, 20).is_err());
    }
}
