use super::{
    names, BinaryReader, ClassAccessFlags, ConstantPool, FieldAccessFlags, LineNumberTable,
    LocalVariableTable, MethodAccessFlags, Tag,
};
use crate::errors::{ErrorContext, LinkageError, LinkageErrorKind, Result};
use crate::model::{
    BytecodeHolder, ConstantValue, FieldData, MethodData, RawExceptionHandler, TranslationContext,
    Type,
};
use log::{debug, trace};
use std::cell::RefCell;
use std::rc::Rc;

const MAGIC: u32 = 0xCAFE_BABE;

/// Longest bytecode array accepted
const MAX_CODE_LENGTH: usize = 0x7FFF;

/// Populate a `Loading` type from the bytes of its classfile
///
/// Method bodies are not decoded here: each method with code gets a `BytecodeHolder` that the
/// graph builder consumes later.
pub fn load_class<'g>(ctx: &TranslationContext<'g>, ty: Type<'g>, bytes: &[u8]) -> Result<()> {
    let file_name = format!("{}.class", ty.name);
    let mut reader = BinaryReader::new(bytes, file_name.clone());
    ClassLoader {
        ctx,
        ty,
        file_name,
    }
    .load(&mut reader)
    .context(|| format!("loading {}", ty.name))
}

struct ClassLoader<'a, 'g> {
    ctx: &'a TranslationContext<'g>,
    ty: Type<'g>,
    file_name: String,
}

fn format_error(detail: impl Into<String>) -> crate::errors::TranslationError {
    LinkageError::class_format(detail).into()
}

impl<'a, 'g> ClassLoader<'a, 'g> {
    fn load(&self, reader: &mut BinaryReader) -> Result<()> {
        let magic = reader.read_u4()?;
        let minor = reader.read_u2()?;
        let major = reader.read_u2()?;
        if magic != MAGIC {
            return Err(format_error(format!("bad magic value {:#x}", magic)));
        }
        if !self.ctx.settings.profile.accepts_version(major, minor) {
            return Err(LinkageError::new(
                LinkageErrorKind::UnsupportedClassVersionError,
                format!("{}.{}", major, minor),
            )
            .into());
        }

        let pool = Rc::new(ConstantPool::read(self.ctx, reader)?);
        self.load_class_info(reader, &pool)?;
        self.load_interfaces(reader, &pool)?;
        self.load_fields(reader, &pool)?;
        self.load_methods(reader, &pool)?;
        self.load_class_attributes(reader, &pool)?;
        if !reader.at_end() {
            return Err(format_error("extra bytes at the end of the classfile"));
        }
        *self.ty.constant_pool.borrow_mut() = Some(pool);

        debug!(
            "loaded {} ({} fields, {} methods)",
            self.ty,
            self.ty.fields.borrow().len(),
            self.ty.methods.borrow().len()
        );
        Ok(())
    }

    fn load_class_info(&self, reader: &mut BinaryReader, pool: &ConstantPool<'g>) -> Result<()> {
        let access_flags = ClassAccessFlags::from_bits_truncate(reader.read_u2()?);
        let this_index = reader.read_u2()?;
        let super_index = reader.read_u2()?;

        if access_flags.contains(ClassAccessFlags::INTERFACE)
            && !access_flags.contains(ClassAccessFlags::ABSTRACT)
        {
            return Err(format_error("interface is not abstract"));
        }
        if access_flags.contains(ClassAccessFlags::FINAL | ClassAccessFlags::ABSTRACT) {
            return Err(format_error("class is both final and abstract"));
        }

        let this_class = pool.class_at(this_index)?;
        let renamed_class = self.ty.name == "java/lang/Class" && this_class.name == "java/lang/Klass";
        if this_class != self.ty && !renamed_class {
            return Err(LinkageError::new(
                LinkageErrorKind::NoClassDefFoundError,
                format!("{} contains {}", self.file_name, this_class),
            )
            .into());
        }
        self.ty.access_flags.set(access_flags);

        if super_index == 0 {
            if self.ty != self.ctx.core.object {
                return Err(format_error("class other than java/lang/Object has no superclass"));
            }
            return Ok(());
        }

        let superclass = pool.class_at(super_index)?;
        if superclass.is_array() {
            return Err(format_error("cannot inherit from an array class"));
        }
        self.ctx.load(superclass)?;
        if superclass.is_interface() {
            return Err(LinkageError::new(
                LinkageErrorKind::IncompatibleClassChangeError,
                format!("{} extends interface {}", self.ty, superclass),
            )
            .into());
        }
        if superclass.is_final() {
            return Err(LinkageError::new(
                LinkageErrorKind::LinkageError,
                format!("{} extends final class {}", self.ty, superclass),
            )
            .into());
        }
        if access_flags.contains(ClassAccessFlags::INTERFACE) && superclass != self.ctx.core.object
        {
            return Err(format_error("interface superclass must be java/lang/Object"));
        }
        if !self.ctx.is_class_accessible(self.ty, superclass)? {
            return Err(LinkageError::new(
                LinkageErrorKind::IllegalAccessError,
                format!("{} cannot access its superclass {}", self.ty, superclass),
            )
            .into());
        }
        self.ty.superclass.set(Some(superclass));
        Ok(())
    }

    fn load_interfaces(&self, reader: &mut BinaryReader, pool: &ConstantPool<'g>) -> Result<()> {
        let count = reader.read_u2()?;
        let mut interfaces: Vec<Type<'g>> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let interface = pool.class_at(reader.read_u2()?)?;
            self.ctx.load(interface)?;
            if !interface.is_interface() {
                return Err(LinkageError::new(
                    LinkageErrorKind::IncompatibleClassChangeError,
                    format!("{} implements non-interface {}", self.ty, interface),
                )
                .into());
            }
            if !interfaces.contains(&interface) {
                interfaces.push(interface);
            }
        }
        *self.ty.interfaces.borrow_mut() = interfaces;
        Ok(())
    }

    fn load_fields(&self, reader: &mut BinaryReader, pool: &ConstantPool<'g>) -> Result<()> {
        let count = reader.read_u2()?;
        let in_interface = self.ty.is_interface();
        let mut static_slots = 0;
        let mut instance_slots = 0;

        for _ in 0..count {
            let access_flags = FieldAccessFlags::from_bits_truncate(reader.read_u2()?);
            let name = pool.utf8(reader.read_u2()?)?.to_owned();
            let descriptor = pool.utf8(reader.read_u2()?)?;
            if !access_flags.is_well_formed(in_interface) {
                return Err(format_error(format!("bad access flags on field {}", name)));
            }
            if !names::is_valid_unqualified_name(&name) {
                return Err(format_error(format!("bad field name '{}'", name)));
            }
            let field_type = self.ctx.type_for_descriptor(descriptor)?;

            let mut constant_index = None;
            for (attribute_name, body) in read_attributes(reader, pool)? {
                if attribute_name != "ConstantValue" {
                    trace!("ignoring field attribute {}", attribute_name);
                    continue;
                }
                if body.len() != 2 {
                    return Err(format_error("ConstantValue attribute length is not 2"));
                }
                if constant_index.is_some() {
                    return Err(format_error("duplicate ConstantValue attribute"));
                }
                let index = u16::from_be_bytes([body[0], body[1]]);
                if index == 0 {
                    return Err(format_error("bad ConstantValue index"));
                }
                constant_index = Some(index);
            }

            let is_static = access_flags.contains(FieldAccessFlags::STATIC);
            let constant_value = match constant_index {
                Some(index) if is_static => Some(self.field_constant(pool, field_type, index)?),
                _ => None,
            };

            if self
                .ty
                .fields
                .borrow()
                .iter()
                .any(|f| f.name == name && f.ty == field_type)
            {
                return Err(format_error(format!("duplicate field {}", name)));
            }

            let slot = if is_static {
                static_slots += 1;
                static_slots - 1
            } else {
                instance_slots += 1;
                instance_slots - 1
            };
            self.ctx.add_field(FieldData {
                parent: self.ty,
                name,
                ty: field_type,
                access_flags,
                constant_value,
                slot,
            });
        }
        Ok(())
    }

    fn field_constant(
        &self,
        pool: &ConstantPool<'g>,
        field_type: Type<'g>,
        index: u16,
    ) -> Result<ConstantValue> {
        let core = &self.ctx.core;
        let expected = if field_type == core.long {
            Tag::Long
        } else if field_type == core.float {
            Tag::Float
        } else if field_type == core.double {
            Tag::Double
        } else if field_type == core.int || field_type.is_sub_int() {
            Tag::Integer
        } else if field_type == core.string {
            Tag::String
        } else {
            return Err(format_error(format!("ConstantValue for a field of type {}", field_type)));
        };
        match (pool.tag(index), pool.loadable(index)) {
            (Some(tag), Some(value)) if tag == expected => Ok(value),
            _ => Err(format_error(format!("ConstantValue is not a {} constant", expected))),
        }
    }

    fn load_methods(&self, reader: &mut BinaryReader, pool: &ConstantPool<'g>) -> Result<()> {
        let count = reader.read_u2()?;
        let in_interface = self.ty.is_interface();
        let mut static_slots = 0;
        let mut virtual_slots = 0;

        for _ in 0..count {
            let mut access_flags = MethodAccessFlags::from_bits_truncate(reader.read_u2()?);
            let name = pool.utf8(reader.read_u2()?)?.to_owned();
            let descriptor = pool.utf8(reader.read_u2()?)?.to_owned();

            if name == "<clinit>" {
                // Only `strictfp` is meaningful on a class initializer
                access_flags = (access_flags & MethodAccessFlags::STRICT) | MethodAccessFlags::STATIC;
            } else if !access_flags.is_well_formed(in_interface) {
                return Err(format_error(format!("bad access flags on method {}", name)));
            }
            if !names::is_valid_method_name(&name, &descriptor) {
                return Err(format_error(format!("bad method name '{}'", name)));
            }
            let (parameters, return_type) = self.ctx.method_signature(&descriptor)?;
            let is_init = name == "<init>";
            if is_init && access_flags.contains(MethodAccessFlags::STATIC) {
                return Err(format_error("static <init> method"));
            }
            let return_type = if is_init { self.ty } else { return_type };

            let mut holder = None;
            let mut exceptions = None;
            for (attribute_name, body) in read_attributes(reader, pool)? {
                match attribute_name.as_str() {
                    "Code" => {
                        if holder.is_some() {
                            return Err(format_error("duplicate Code attribute"));
                        }
                        holder = Some(self.load_code(&body, pool).context(|| {
                            format!("reading the code of {}{}", name, descriptor)
                        })?);
                    }
                    "Exceptions" => {
                        if exceptions.is_some() {
                            return Err(format_error("duplicate Exceptions attribute"));
                        }
                        let mut body = BinaryReader::new(&body, self.file_name.as_str());
                        let count = body.read_u2()?;
                        let mut types = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            types.push(pool.class_at(body.read_u2()?)?);
                        }
                        exceptions = Some(types);
                    }
                    other => trace!("ignoring method attribute {}", other),
                }
            }

            let needs_code = !access_flags
                .intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE);
            if needs_code != holder.is_some() {
                return Err(format_error(if needs_code {
                    format!("missing Code attribute in {}", name)
                } else {
                    format!("Code attribute in native or abstract method {}", name)
                }));
            }

            if self
                .ty
                .methods
                .borrow()
                .iter()
                .any(|m| m.name == name && m.descriptor == descriptor)
            {
                return Err(format_error(format!("duplicate method {}{}", name, descriptor)));
            }

            let slot = if access_flags.contains(MethodAccessFlags::STATIC) || is_init {
                static_slots += 1;
                static_slots - 1
            } else {
                virtual_slots += 1;
                virtual_slots - 1
            };
            self.ctx.add_method(MethodData {
                parent: self.ty,
                name,
                descriptor,
                access_flags,
                parameters,
                return_type,
                exceptions: exceptions.unwrap_or_default(),
                slot,
                holder: RefCell::new(holder),
            });
        }
        Ok(())
    }

    fn load_code(&self, body: &[u8], pool: &ConstantPool<'g>) -> Result<BytecodeHolder> {
        let mut reader = BinaryReader::new(body, self.file_name.as_str());
        let max_stack = reader.read_u2()?;
        let max_locals = reader.read_u2()?;
        let code_length = reader.read_u4()? as usize;
        if code_length == 0 {
            return Err(format_error("code length must be greater than 0"));
        }
        if code_length >= MAX_CODE_LENGTH {
            return Err(format_error("method code longer than 32Kb"));
        }
        let code = reader.read_bytes(code_length)?;

        let handler_count = reader.read_u2()?;
        let mut handlers = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            let handler = RawExceptionHandler {
                start_pc: reader.read_u2()?,
                end_pc: reader.read_u2()?,
                handler_pc: reader.read_u2()?,
                catch_type: reader.read_u2()?,
            };
            if handler.start_pc as usize >= code_length
                || handler.end_pc as usize > code_length
                || handler.start_pc >= handler.end_pc
                || handler.handler_pc as usize >= code_length
            {
                return Err(format_error("bad exception handler"));
            }
            if handler.catch_type != 0 && pool.tag(handler.catch_type) != Some(Tag::Class) {
                return Err(format_error("exception handler catch type is not a class"));
            }
            handlers.push(handler);
        }

        let mut stack_map = None;
        let mut line_numbers: Option<LineNumberTable> = None;
        let mut local_variables = None;
        let mut liveness = None;
        for (attribute_name, body) in read_attributes(&mut reader, pool)? {
            let file_name = self.file_name.as_str();
            match attribute_name.as_str() {
                "StackMap" => stack_map = Some(body),
                "LineNumberTable" => {
                    let mut attribute = BinaryReader::new(&body, file_name);
                    match line_numbers.as_mut() {
                        Some(table) => table.read_more(&mut attribute, code_length)?,
                        None => {
                            line_numbers = Some(LineNumberTable::read(&mut attribute, code_length)?)
                        }
                    }
                }
                "LocalVariableTable" => {
                    let mut attribute = BinaryReader::new(&body, file_name);
                    local_variables =
                        Some(LocalVariableTable::read(&mut attribute, pool, code_length)?)
                }
                "Liveness" => liveness = Some(body),
                other => debug!("ignoring code attribute {} in {}", other, self.ty),
            }
        }
        if !reader.at_end() {
            return Err(format_error("Code attribute length mismatch"));
        }

        Ok(BytecodeHolder {
            code,
            max_stack,
            max_locals,
            handlers,
            stack_map,
            line_numbers,
            local_variables,
            liveness,
        })
    }

    fn load_class_attributes(
        &self,
        reader: &mut BinaryReader,
        pool: &ConstantPool<'g>,
    ) -> Result<()> {
        for (attribute_name, body) in read_attributes(reader, pool)? {
            if attribute_name == "SourceFile" {
                if body.len() != 2 {
                    return Err(format_error("SourceFile attribute length is not 2"));
                }
                let source_file = pool.utf8(u16::from_be_bytes([body[0], body[1]]))?;
                *self.ty.source_file.borrow_mut() = Some(source_file.to_owned());
            } else {
                trace!("ignoring class attribute {}", attribute_name);
            }
        }
        Ok(())
    }
}

/// Read a `u2` counted list of attributes as `(name, body)` pairs
fn read_attributes(reader: &mut BinaryReader, pool: &ConstantPool) -> Result<Vec<(String, Vec<u8>)>> {
    let count = reader.read_u2()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = pool.utf8(reader.read_u2()?)?.to_owned();
        let length = reader.read_u4()? as usize;
        if length > reader.remaining() {
            return Err(format_error(format!("attribute {} runs past the end", name)));
        }
        attributes.push((name, reader.read_bytes(length)?));
    }
    Ok(attributes)
}
