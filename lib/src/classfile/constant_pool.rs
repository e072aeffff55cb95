use super::{names, BinaryReader};
use crate::errors::{ErrorContext, LinkageError, LinkageErrorKind, Result};
use crate::model::{ConstantValue, FieldData, MethodData, TranslationContext, Type};
use std::cell::Cell;
use std::fmt;

/// Constant pool tags
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4-140
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tag {
    Utf8,
    Integer,
    Float,
    Long,
    Double,
    Class,
    String,
    FieldRef,
    MethodRef,
    InterfaceMethodRef,
    NameAndType,
}

impl Tag {
    fn from_byte(tag: u8) -> Option<Tag> {
        Some(match tag {
            1 => Tag::Utf8,
            3 => Tag::Integer,
            4 => Tag::Float,
            5 => Tag::Long,
            6 => Tag::Double,
            7 => Tag::Class,
            8 => Tag::String,
            9 => Tag::FieldRef,
            10 => Tag::MethodRef,
            11 => Tag::InterfaceMethodRef,
            12 => Tag::NameAndType,
            _ => return None,
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Entry as read in the first pass, before forward references can be followed
enum RawEntry {
    Unused,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    MemberRef(Tag, u16, u16),
}

enum Entry<'g> {
    /// Index 0 and the slot after a `Long` or `Double`
    Unused,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        ty: Type<'g>,
        access_checked: Cell<bool>,
    },
    String(String),
    NameAndType {
        name: String,
        descriptor: String,
    },
    Field {
        class_index: u16,
        nat_index: u16,
        resolved: Cell<Option<&'g FieldData<'g>>>,
    },
    Method {
        interface: bool,
        class_index: u16,
        nat_index: u16,
        resolved: Cell<Option<&'g MethodData<'g>>>,
    },
}

impl<'g> Entry<'g> {
    fn tag(&self) -> Option<Tag> {
        Some(match self {
            Entry::Unused => return None,
            Entry::Utf8(_) => Tag::Utf8,
            Entry::Integer(_) => Tag::Integer,
            Entry::Float(_) => Tag::Float,
            Entry::Long(_) => Tag::Long,
            Entry::Double(_) => Tag::Double,
            Entry::Class { .. } => Tag::Class,
            Entry::String(_) => Tag::String,
            Entry::NameAndType { .. } => Tag::NameAndType,
            Entry::Field { .. } => Tag::FieldRef,
            Entry::Method {
                interface: false, ..
            } => Tag::MethodRef,
            Entry::Method {
                interface: true, ..
            } => Tag::InterfaceMethodRef,
        })
    }
}

/// Constant pool of a loaded class
///
/// Member references are resolved lazily (the first time some bytecode uses them) and the result
/// is remembered, so that later uses of the same entry do not repeat the lookup.
pub struct ConstantPool<'g> {
    entries: Vec<Entry<'g>>,
}

fn bad_index(index: u16, expected: &str) -> LinkageError {
    LinkageError::class_format(format!(
        "constant pool index {} is not a valid {} entry",
        index, expected
    ))
}

impl<'g> ConstantPool<'g> {
    /// Read the constant pool (starting at the `constant_pool_count`)
    pub fn read(ctx: &TranslationContext<'g>, reader: &mut BinaryReader) -> Result<ConstantPool<'g>> {
        let count = reader.read_u2()? as usize;
        let raw = ConstantPool::read_raw(reader, count)?;
        ConstantPool::resolve_raw(ctx, raw)
    }

    fn read_raw(reader: &mut BinaryReader, count: usize) -> Result<Vec<RawEntry>> {
        let mut raw = Vec::with_capacity(count);
        raw.push(RawEntry::Unused);
        while raw.len() < count {
            let index = raw.len();
            let tag_byte = reader.read_u1()?;
            let tag = Tag::from_byte(tag_byte).ok_or_else(|| {
                LinkageError::class_format(format!(
                    "bad constant pool tag {} at index {}",
                    tag_byte, index
                ))
            })?;
            let entry = match tag {
                Tag::Utf8 => RawEntry::Utf8(reader.read_utf8()?),
                Tag::Integer => RawEntry::Integer(reader.read_i4()?),
                Tag::Float => RawEntry::Float(reader.read_f4()?),
                Tag::Long | Tag::Double => {
                    if index + 1 >= count {
                        return Err(LinkageError::class_format(format!(
                            "{} constant in the last constant pool slot",
                            tag
                        ))
                        .into());
                    }
                    let entry = if tag == Tag::Long {
                        RawEntry::Long(reader.read_i8()?)
                    } else {
                        RawEntry::Double(reader.read_f8()?)
                    };
                    raw.push(entry);
                    raw.push(RawEntry::Unused);
                    continue;
                }
                Tag::Class => RawEntry::Class(reader.read_u2()?),
                Tag::String => RawEntry::String(reader.read_u2()?),
                Tag::NameAndType => RawEntry::NameAndType(reader.read_u2()?, reader.read_u2()?),
                Tag::FieldRef | Tag::MethodRef | Tag::InterfaceMethodRef => {
                    RawEntry::MemberRef(tag, reader.read_u2()?, reader.read_u2()?)
                }
            };
            raw.push(entry);
        }
        Ok(raw)
    }

    fn resolve_raw(ctx: &TranslationContext<'g>, raw: Vec<RawEntry>) -> Result<ConstantPool<'g>> {
        let utf8 = |index: u16| -> Result<&str> {
            match raw.get(index as usize) {
                Some(RawEntry::Utf8(string)) => Ok(string.as_str()),
                _ => Err(bad_index(index, "Utf8").into()),
            }
        };
        let max_dims = ctx.max_array_dimensions();

        let mut entries = Vec::with_capacity(raw.len());
        for (index, entry) in raw.iter().enumerate() {
            let resolved = match entry {
                RawEntry::Unused => Entry::Unused,
                RawEntry::Utf8(string) => Entry::Utf8(string.clone()),
                RawEntry::Integer(value) => Entry::Integer(*value),
                RawEntry::Float(value) => Entry::Float(*value),
                RawEntry::Long(value) => Entry::Long(*value),
                RawEntry::Double(value) => Entry::Double(*value),
                RawEntry::Class(name_index) => Entry::Class {
                    ty: ctx.type_for_class_name(utf8(*name_index)?)?,
                    access_checked: Cell::new(false),
                },
                RawEntry::String(string_index) => Entry::String(utf8(*string_index)?.to_owned()),
                RawEntry::NameAndType(name_index, descriptor_index) => {
                    let name = utf8(*name_index)?;
                    let descriptor = utf8(*descriptor_index)?;
                    let valid = if descriptor.starts_with('(') {
                        names::is_valid_method_descriptor(descriptor, max_dims)
                            && names::is_valid_method_name(name, descriptor)
                    } else {
                        names::is_valid_field_descriptor(descriptor, max_dims)
                            && names::is_valid_unqualified_name(name)
                    };
                    if !valid {
                        return Err(LinkageError::class_format(format!(
                            "bad name and type {}:{}",
                            name, descriptor
                        ))
                        .into());
                    }
                    Entry::NameAndType {
                        name: name.to_owned(),
                        descriptor: descriptor.to_owned(),
                    }
                }
                RawEntry::MemberRef(tag, class_index, nat_index) => {
                    if !matches!(raw.get(*class_index as usize), Some(RawEntry::Class(_))) {
                        return Err(bad_index(*class_index, "Class").into());
                    }
                    let descriptor = match raw.get(*nat_index as usize) {
                        Some(RawEntry::NameAndType(_, descriptor_index)) => {
                            utf8(*descriptor_index)?
                        }
                        _ => return Err(bad_index(*nat_index, "NameAndType").into()),
                    };
                    let is_method = descriptor.starts_with('(');
                    if is_method != (*tag != Tag::FieldRef) {
                        return Err(LinkageError::class_format(format!(
                            "{} at index {} has descriptor {}",
                            tag, index, descriptor
                        ))
                        .into());
                    }
                    if *tag == Tag::FieldRef {
                        Entry::Field {
                            class_index: *class_index,
                            nat_index: *nat_index,
                            resolved: Cell::new(None),
                        }
                    } else {
                        Entry::Method {
                            interface: *tag == Tag::InterfaceMethodRef,
                            class_index: *class_index,
                            nat_index: *nat_index,
                            resolved: Cell::new(None),
                        }
                    }
                }
            };
            entries.push(resolved);
        }
        Ok(ConstantPool { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Tag of the entry at an index (`None` for invalid or unused indices)
    pub fn tag(&self, index: u16) -> Option<Tag> {
        self.entries.get(index as usize).and_then(Entry::tag)
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.entries.get(index as usize) {
            Some(Entry::Utf8(string)) => Ok(string.as_str()),
            _ => Err(bad_index(index, "Utf8").into()),
        }
    }

    /// Class entry, without any access check
    pub fn class_at(&self, index: u16) -> Result<Type<'g>> {
        match self.entries.get(index as usize) {
            Some(Entry::Class { ty, .. }) => Ok(*ty),
            _ => Err(bad_index(index, "Class").into()),
        }
    }

    /// Constant suitable for `ldc`, `ldc2_w` or a `ConstantValue` attribute
    pub fn loadable(&self, index: u16) -> Option<ConstantValue> {
        match self.entries.get(index as usize)? {
            Entry::Integer(value) => Some(ConstantValue::Int(*value)),
            Entry::Float(value) => Some(ConstantValue::Float(*value)),
            Entry::Long(value) => Some(ConstantValue::Long(*value)),
            Entry::Double(value) => Some(ConstantValue::Double(*value)),
            Entry::String(value) => Some(ConstantValue::String(value.clone())),
            _ => None,
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.entries.get(index as usize) {
            Some(Entry::NameAndType { name, descriptor }) => Ok((name.as_str(), descriptor.as_str())),
            _ => Err(bad_index(index, "NameAndType").into()),
        }
    }

    /// Name and descriptor of a field or method reference, without resolving it
    pub fn member_name(&self, index: u16) -> Result<(&str, &str)> {
        match self.entries.get(index as usize) {
            Some(Entry::Field { nat_index, .. }) | Some(Entry::Method { nat_index, .. }) => {
                self.name_and_type(*nat_index)
            }
            _ => Err(bad_index(index, "member reference").into()),
        }
    }

    /// Resolve a class entry, checking that the referring class can access it
    pub fn resolve_type(
        &self,
        ctx: &TranslationContext<'g>,
        index: u16,
        from: Type<'g>,
    ) -> Result<Type<'g>> {
        let (ty, access_checked) = match self.entries.get(index as usize) {
            Some(Entry::Class { ty, access_checked }) => (*ty, access_checked),
            _ => return Err(bad_index(index, "Class").into()),
        };
        if !access_checked.get() {
            if !ctx.is_class_accessible(from, ty)? {
                return Err(LinkageError::new(
                    LinkageErrorKind::IllegalAccessError,
                    format!("{} cannot access {}", from, ty),
                )
                .into());
            }
            access_checked.set(true);
        }
        Ok(ty)
    }

    /// Resolve a field reference
    ///
    /// The static-ness of the field must agree with the instruction using it.
    pub fn resolve_field(
        &self,
        ctx: &TranslationContext<'g>,
        index: u16,
        from: Type<'g>,
        is_static: bool,
    ) -> Result<&'g FieldData<'g>> {
        let (class_index, nat_index, resolved) = match self.entries.get(index as usize) {
            Some(Entry::Field {
                class_index,
                nat_index,
                resolved,
            }) => (*class_index, *nat_index, resolved),
            _ => return Err(bad_index(index, "Fieldref").into()),
        };

        let field = match resolved.get() {
            Some(field) => field,
            None => {
                let class = self.resolve_type(ctx, class_index, from)?;
                let (name, descriptor) = self.name_and_type(nat_index)?;
                let field_type = ctx.type_for_descriptor(descriptor)?;
                let field = ctx
                    .lookup_field(class, name, field_type)
                    .context(|| format!("resolving field {}.{}", class, name))?
                    .ok_or_else(|| {
                        LinkageError::new(
                            LinkageErrorKind::NoSuchFieldError,
                            format!("{}.{}:{}", class, name, descriptor),
                        )
                    })?;
                let visibility = field.access_flags.visibility();
                if !ctx.is_member_accessible(from, field.parent, visibility)? {
                    return Err(LinkageError::new(
                        LinkageErrorKind::IllegalAccessError,
                        format!("{} cannot access {}", from, field),
                    )
                    .into());
                }
                resolved.set(Some(field));
                field
            }
        };

        if field.is_static() != is_static {
            return Err(LinkageError::new(
                LinkageErrorKind::IncompatibleClassChangeError,
                format!(
                    "{} field {} accessed as {}",
                    if field.is_static() { "static" } else { "instance" },
                    field,
                    if is_static { "static" } else { "instance" },
                ),
            )
            .into());
        }
        Ok(field)
    }

    /// Resolve a method or interface method reference
    pub fn resolve_method(
        &self,
        ctx: &TranslationContext<'g>,
        index: u16,
        from: Type<'g>,
        is_static: bool,
    ) -> Result<&'g MethodData<'g>> {
        let (interface, class_index, nat_index, resolved) = match self.entries.get(index as usize)
        {
            Some(Entry::Method {
                interface,
                class_index,
                nat_index,
                resolved,
            }) => (*interface, *class_index, *nat_index, resolved),
            _ => return Err(bad_index(index, "Methodref").into()),
        };

        let method = match resolved.get() {
            Some(method) => method,
            None => {
                let class = self.resolve_type(ctx, class_index, from)?;
                ctx.load(class)?;
                if class.is_interface() != interface {
                    return Err(LinkageError::new(
                        LinkageErrorKind::IncompatibleClassChangeError,
                        format!(
                            "{} used as {}",
                            class,
                            if interface { "an interface" } else { "a class" }
                        ),
                    )
                    .into());
                }
                let (name, descriptor) = self.name_and_type(nat_index)?;
                let method = ctx
                    .lookup_method(class, name, descriptor)
                    .context(|| format!("resolving method {}.{}", class, name))?
                    .ok_or_else(|| {
                        LinkageError::new(
                            LinkageErrorKind::NoSuchMethodError,
                            format!("{}.{}{}", class, name, descriptor),
                        )
                    })?;
                let visibility = method.access_flags.visibility();
                if !ctx.is_member_accessible(from, method.parent, visibility)? {
                    return Err(LinkageError::new(
                        LinkageErrorKind::IllegalAccessError,
                        format!("{} cannot access {}", from, method),
                    )
                    .into());
                }
                resolved.set(Some(method));
                method
            }
        };

        if method.is_static() != is_static {
            return Err(LinkageError::new(
                LinkageErrorKind::IncompatibleClassChangeError,
                format!(
                    "{} method {} invoked as {}",
                    if method.is_static() { "static" } else { "instance" },
                    method,
                    if is_static { "static" } else { "instance" },
                ),
            )
            .into());
        }
        Ok(method)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;
    use crate::model::ContextArenas;
    use crate::settings::Settings;

    fn utf8(bytes: &mut Vec<u8>, string: &str) {
        bytes.push(1);
        bytes.extend_from_slice(&(string.len() as u16).to_be_bytes());
        bytes.extend_from_slice(string.as_bytes());
    }

    fn with_pool<F: for<'g> FnOnce(&TranslationContext<'g>, Result<ConstantPool<'g>>)>(
        bytes: &[u8],
        f: F,
    ) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        let mut reader = BinaryReader::new(bytes, "Test.class");
        let pool = ConstantPool::read(&ctx, &mut reader);
        f(&ctx, pool)
    }

    #[test]
    fn two_pass_resolution() {
        let mut bytes = vec![0, 10];
        utf8(&mut bytes, "java/lang/String"); // 1
        bytes.extend_from_slice(&[7, 0, 1]); // 2: Class #1
        bytes.extend_from_slice(&[3, 0, 0, 0, 42]); // 3: Integer
        bytes.extend_from_slice(&[5, 0, 0, 0, 0, 0, 0, 0, 7]); // 4, 5: Long
        bytes.extend_from_slice(&[8, 0, 7]); // 6: String #7 (forward reference)
        utf8(&mut bytes, "hello"); // 7
        utf8(&mut bytes, "length"); // 8
        utf8(&mut bytes, "()I"); // 9

        with_pool(&bytes, |ctx, pool| {
            let pool = pool.unwrap();
            assert_eq!(pool.len(), 10);
            assert_eq!(pool.tag(2), Some(Tag::Class));
            assert_eq!(pool.tag(5), None);
            assert!(std::ptr::eq(pool.class_at(2).unwrap(), ctx.core.string));
            assert_eq!(pool.loadable(3), Some(ConstantValue::Int(42)));
            assert_eq!(pool.loadable(4), Some(ConstantValue::Long(7)));
            assert_eq!(pool.loadable(6), Some(ConstantValue::String("hello".to_owned())));
            assert!(pool.class_at(3).is_err());
        });
    }

    #[test]
    fn format_errors() {
        // Bad tag
        with_pool(&[0, 2, 2], |_, pool| assert!(pool.is_err()));

        // Long in the last slot
        with_pool(&[0, 2, 5, 0, 0, 0, 0, 0, 0, 0, 1], |_, pool| {
            assert!(pool.is_err())
        });

        // Class pointing at a non-Utf8 entry
        with_pool(&[0, 3, 7, 0, 2, 3, 0, 0, 0, 1], |_, pool| {
            assert!(pool.is_err())
        });

        // Malformed class name
        let mut bytes = vec![0, 3];
        utf8(&mut bytes, "java//lang");
        bytes.extend_from_slice(&[7, 0, 1]);
        with_pool(&bytes, |_, pool| {
            let err = pool.err().unwrap();
            assert_eq!(
                err.as_linkage().map(|e| e.kind),
                Some(LinkageErrorKind::ClassFormatError)
            );
        });
    }

    #[test]
    fn fieldref_needs_field_descriptor() {
        let mut bytes = vec![0, 7];
        utf8(&mut bytes, "a/B"); // 1
        bytes.extend_from_slice(&[7, 0, 1]); // 2
        utf8(&mut bytes, "run"); // 3
        utf8(&mut bytes, "()V"); // 4
        bytes.extend_from_slice(&[12, 0, 3, 0, 4]); // 5
        bytes.extend_from_slice(&[9, 0, 2, 0, 5]); // 6: Fieldref with a method descriptor
        with_pool(&bytes, |_, pool| assert!(pool.is_err()));
    }
}
