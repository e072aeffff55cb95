use crate::errors::{LinkageError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Cursor, Read, Seek, SeekFrom};

/// Big-endian reader over the bytes of a classfile (or of one of its attributes)
///
/// Every read failure is turned into a `ClassFormatError` that names the file and the offset at
/// which the data ran out, keeping the underlying `io::Error` as its cause.
pub struct BinaryReader<'a> {
    cursor: Cursor<&'a [u8]>,
    file_name: String,
}

impl<'a> BinaryReader<'a> {
    pub fn new(bytes: &'a [u8], file_name: impl Into<String>) -> BinaryReader<'a> {
        BinaryReader {
            cursor: Cursor::new(bytes),
            file_name: file_name.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    fn io_error(&self, err: io::Error) -> crate::errors::TranslationError {
        LinkageError::class_format(format!(
            "truncated data in {} at offset {}",
            self.file_name,
            self.position()
        ))
        .with_cause(err)
        .into()
    }

    pub fn read_u1(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|err| self.io_error(err))
    }

    pub fn read_u2(&mut self) -> Result<u16> {
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_u4(&mut self) -> Result<u32> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_i1(&mut self) -> Result<i8> {
        self.cursor.read_i8().map_err(|err| self.io_error(err))
    }

    pub fn read_i2(&mut self) -> Result<i16> {
        self.cursor
            .read_i16::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_i4(&mut self) -> Result<i32> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_i8(&mut self) -> Result<i64> {
        self.cursor
            .read_i64::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_f4(&mut self) -> Result<f32> {
        self.cursor
            .read_f32::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_f8(&mut self) -> Result<f64> {
        self.cursor
            .read_f64::<BigEndian>()
            .map_err(|err| self.io_error(err))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0; len];
        self.cursor
            .read_exact(&mut buffer)
            .map_err(|err| self.io_error(err))?;
        Ok(buffer)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        if len > self.remaining() {
            let err = io::Error::new(io::ErrorKind::UnexpectedEof, "skip past end");
            return Err(self.io_error(err));
        }
        self.cursor
            .seek(SeekFrom::Current(len as i64))
            .map_err(|err| self.io_error(err))?;
        Ok(())
    }

    /// Read a `u2` length followed by that many bytes of modified UTF-8
    pub fn read_utf8(&mut self) -> Result<String> {
        let len = self.read_u2()? as usize;
        let bytes = self.read_bytes(len)?;
        decode_modified_utf8(&bytes).ok_or_else(|| {
            LinkageError::class_format(format!("malformed UTF-8 string in {}", self.file_name))
                .into()
        })
    }
}

/// Decode the "modified" UTF-8 used in classfiles
///
/// This differs from standard UTF-8 in that `\0` is encoded on two bytes and supplementary
/// characters are encoded as surrogate pairs (each surrogate on three bytes). Unpaired surrogates
/// are replaced with U+FFFD.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4.7
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    let continuation = |byte: Option<u8>| -> Option<u16> {
        match byte {
            Some(b) if b & 0xC0 == 0x80 => Some((b & 0x3F) as u16),
            _ => None,
        }
    };
    while let Some(first) = iter.next() {
        let unit = match first {
            0x01..=0x7F => first as u16,
            0xC0..=0xDF => {
                let second = continuation(iter.next())?;
                ((first & 0x1F) as u16) << 6 | second
            }
            0xE0..=0xEF => {
                let second = continuation(iter.next())?;
                let third = continuation(iter.next())?;
                ((first & 0x0F) as u16) << 12 | second << 6 | third
            }
            _ => return None,
        };
        units.push(unit);
    }
    Some(String::from_utf16_lossy(&units))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::LinkageErrorKind;

    #[test]
    fn big_endian_scalars() {
        let bytes = [0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x2D, 0xFF];
        let mut reader = BinaryReader::new(&bytes, "A.class");
        assert_eq!(reader.read_u4().unwrap(), 0xCAFE_BABE);
        assert_eq!(reader.read_u2().unwrap(), 45);
        assert_eq!(reader.read_i1().unwrap(), -1);
        assert!(reader.at_end());
    }

    #[test]
    fn truncation_is_a_format_error() {
        let bytes = [0x00];
        let mut reader = BinaryReader::new(&bytes, "B.class");
        let err = reader.read_u2().unwrap_err();
        let linkage = err.as_linkage().unwrap();
        assert_eq!(linkage.kind, LinkageErrorKind::ClassFormatError);
        assert!(linkage.detail.contains("B.class"));
        assert!(linkage.cause.is_some());
    }

    #[test]
    fn skipping_past_the_end_fails() {
        let bytes = [1, 2, 3];
        let mut reader = BinaryReader::new(&bytes, "C.class");
        reader.skip(2).unwrap();
        assert_eq!(reader.remaining(), 1);
        assert!(reader.skip(2).is_err());
    }

    #[test]
    fn modified_utf8() {
        assert_eq!(decode_modified_utf8(&[97, 192, 128, 97]).unwrap(), "a\x00a");
        assert_eq!(decode_modified_utf8(b"foo").unwrap(), "foo");
        // U+10000 as a surrogate pair
        assert_eq!(
            decode_modified_utf8(&[237, 160, 128, 237, 176, 128]).unwrap(),
            "\u{10000}"
        );
        assert_eq!(decode_modified_utf8(&[0]), None);
        assert_eq!(decode_modified_utf8(&[0xC3]), None);
    }
}
