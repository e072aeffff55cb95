use super::{
    FieldData, LoadingState, MethodData, PrimitiveType, ProxyId, SyntheticType, Type, TypeData,
    TypeKind,
};
use crate::classfile::{self, names, ClassAccessFlags, ClassPath, Visibility};
use crate::errors::{LinkageError, LinkageErrorKind, Result};
use crate::settings::Settings;
use crate::translate::Statistics;
use elsa::map::FrozenMap;
use log::debug;
use std::cell::Cell;
use std::collections::HashSet;
use typed_arena::Arena;

pub struct ContextArenas<'g> {
    type_arena: Arena<TypeData<'g>>,
    method_arena: Arena<MethodData<'g>>,
    field_arena: Arena<FieldData<'g>>,
}

impl<'g> ContextArenas<'g> {
    pub fn new() -> Self {
        ContextArenas {
            type_arena: Arena::new(),
            method_arena: Arena::new(),
            field_arena: Arena::new(),
        }
    }
}

impl<'g> Default for ContextArenas<'g> {
    fn default() -> Self {
        ContextArenas::new()
    }
}

/// Types that the translator itself needs to refer to
pub struct CoreTypes<'g> {
    pub universe: Type<'g>,
    pub bogus: Type<'g>,
    pub null_object: Type<'g>,
    pub init_object: Type<'g>,
    pub new_object: Type<'g>,
    pub byte_or_boolean: Type<'g>,
    pub long2: Type<'g>,
    pub double2: Type<'g>,

    pub void: Type<'g>,
    pub boolean: Type<'g>,
    pub byte: Type<'g>,
    pub char: Type<'g>,
    pub short: Type<'g>,
    pub int: Type<'g>,
    pub long: Type<'g>,
    pub float: Type<'g>,
    pub double: Type<'g>,

    pub object: Type<'g>,
    pub string: Type<'g>,
    pub class: Type<'g>,
    pub throwable: Type<'g>,
    pub cloneable: Type<'g>,
    pub serializable: Type<'g>,
}

/// Owns every type and member seen during a translation session
///
/// Classes are interned by name: asking for the same name twice yields the same `Type`. Classes
/// start out `Defined` and get loaded lazily (from the class path) the first time something needs
/// to know about their members or super types.
pub struct TranslationContext<'g> {
    arenas: &'g ContextArenas<'g>,

    /// Class and array types, keyed by internal name
    types: FrozenMap<String, Box<Type<'g>>>,

    next_type_id: Cell<usize>,
    class_path: Box<dyn ClassPath>,

    pub settings: Settings,
    pub statistics: Statistics,
    pub core: CoreTypes<'g>,
}

impl<'g> TranslationContext<'g> {
    pub fn new(
        arenas: &'g ContextArenas<'g>,
        settings: Settings,
        class_path: Box<dyn ClassPath>,
    ) -> TranslationContext<'g> {
        let types: FrozenMap<String, Box<Type<'g>>> = FrozenMap::new();
        let next_type_id = Cell::new(0);

        let alloc = |name: &str, kind: TypeKind<'g>| -> Type<'g> {
            let id = next_type_id.get();
            next_type_id.set(id + 1);
            let ty: Type<'g> = arenas.type_arena.alloc(TypeData::new(name.to_owned(), kind, id));
            if ty.is_class() {
                types.insert(name.to_owned(), Box::new(ty));
            } else {
                ty.set_state(LoadingState::Loaded);
            }
            ty
        };
        let prim = |name: &str, prim: PrimitiveType| alloc(name, TypeKind::Primitive(prim));
        let syn = |name: &str, syn: SyntheticType| alloc(name, TypeKind::Synthetic(syn));

        let core = CoreTypes {
            universe: syn("-U-", SyntheticType::Universe),
            bogus: syn("-BOGUS-", SyntheticType::Bogus),
            null_object: syn("-NULL-", SyntheticType::NullObject),
            init_object: syn("-INIT-", SyntheticType::InitObject),
            new_object: syn("-NEW-", SyntheticType::NewObject),
            byte_or_boolean: syn("-BYTE|BOOLEAN-", SyntheticType::ByteOrBoolean),
            long2: syn("-LONG2-", SyntheticType::Long2),
            double2: syn("-DOUBLE2-", SyntheticType::Double2),
            void: prim("void", PrimitiveType::Void),
            boolean: prim("boolean", PrimitiveType::Boolean),
            byte: prim("byte", PrimitiveType::Byte),
            char: prim("char", PrimitiveType::Char),
            short: prim("short", PrimitiveType::Short),
            int: prim("int", PrimitiveType::Int),
            long: prim("long", PrimitiveType::Long),
            float: prim("float", PrimitiveType::Float),
            double: prim("double", PrimitiveType::Double),
            object: alloc("java/lang/Object", TypeKind::Class),
            string: alloc("java/lang/String", TypeKind::Class),
            class: alloc("java/lang/Class", TypeKind::Class),
            throwable: alloc("java/lang/Throwable", TypeKind::Class),
            cloneable: alloc("java/lang/Cloneable", TypeKind::Class),
            serializable: alloc("java/io/Serializable", TypeKind::Class),
        };

        // The verifier-only object types behave like subclasses of `Object`
        for ty in [core.null_object, core.init_object, core.new_object] {
            ty.superclass.set(Some(core.object));
        }

        TranslationContext {
            arenas,
            types,
            next_type_id,
            class_path,
            settings,
            statistics: Statistics::default(),
            core,
        }
    }

    fn alloc_type(&self, name: String, kind: TypeKind<'g>) -> Type<'g> {
        let id = self.next_type_id.get();
        self.next_type_id.set(id + 1);
        self.arenas.type_arena.alloc(TypeData::new(name, kind, id))
    }

    /// Class type with the given internal name (created as `Defined` if not yet known)
    ///
    /// The name is not checked: use `type_for_class_name` for names coming from a classfile.
    pub fn class_type(&self, name: &str) -> Type<'g> {
        if let Some(ty) = self.types.get(name) {
            return *ty;
        }
        let ty = self.alloc_type(name.to_owned(), TypeKind::Class);
        self.types.insert(name.to_owned(), Box::new(ty));
        ty
    }

    /// Look up a type that has already been created
    pub fn lookup_type(&self, name: &str) -> Option<Type<'g>> {
        self.types.get(name).copied()
    }

    /// Array type with the given element type
    pub fn array_of(&self, element: Type<'g>) -> Type<'g> {
        if let Some(array) = element.array_of.get() {
            return array;
        }
        let name = format!("[{}", element.descriptor());
        let array = match self.types.get(name.as_str()) {
            Some(array) => *array,
            None => {
                let array = self.alloc_type(name.clone(), TypeKind::Array(element));
                array.superclass.set(Some(self.core.object));
                *array.interfaces.borrow_mut() = vec![self.core.cloneable, self.core.serializable];
                array.access_flags.set(
                    ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL | ClassAccessFlags::ABSTRACT,
                );
                self.types.insert(name, Box::new(array));
                array
            }
        };
        element.array_of.set(Some(array));
        array
    }

    /// Placeholder type for an object created by a `new` but not yet initialized
    pub(crate) fn new_proxy_type(&self, id: ProxyId, address: u16) -> Type<'g> {
        let proxy = self.alloc_type(format!("-NEW@{}-", address), TypeKind::Proxy(id));
        proxy.superclass.set(Some(self.core.object));
        proxy.set_state(LoadingState::Loaded);
        proxy
    }

    /// Maximum array dimensions allowed in descriptors
    pub fn max_array_dimensions(&self) -> usize {
        self.settings.profile.max_array_dimensions()
    }

    /// Resolve a verified field descriptor (eg. `I`, `[J`, `Ljava/lang/String;`)
    pub fn type_for_descriptor(&self, descriptor: &str) -> Result<Type<'g>> {
        if !names::is_valid_field_descriptor(descriptor, self.max_array_dimensions()) {
            return Err(LinkageError::class_format(format!(
                "invalid field descriptor '{}'",
                descriptor
            ))
            .into());
        }
        match self.parse_field_type(descriptor) {
            Some((ty, "")) => Ok(ty),
            _ => Err(LinkageError::class_format(format!(
                "invalid field descriptor '{}'",
                descriptor
            ))
            .into()),
        }
    }

    /// Resolve the name found in a `CONSTANT_Class` entry
    ///
    /// These are either internal class names or array descriptors.
    pub fn type_for_class_name(&self, name: &str) -> Result<Type<'g>> {
        if !names::is_valid_class_name(name, self.max_array_dimensions()) {
            return Err(
                LinkageError::class_format(format!("invalid class name '{}'", name)).into(),
            );
        }
        if name.starts_with('[') {
            self.type_for_descriptor(name)
        } else {
            Ok(self.class_type(name))
        }
    }

    /// Resolve a verified method descriptor into parameter and return types
    pub fn method_signature(&self, descriptor: &str) -> Result<(Vec<Type<'g>>, Type<'g>)> {
        let invalid = || {
            LinkageError::class_format(format!("invalid method descriptor '{}'", descriptor))
        };
        if !names::is_valid_method_descriptor(descriptor, self.max_array_dimensions()) {
            return Err(invalid().into());
        }

        let mut rest = descriptor.strip_prefix('(').ok_or_else(invalid)?;
        let mut parameters = vec![];
        while !rest.starts_with(')') {
            let (ty, remaining) = self.parse_field_type(rest).ok_or_else(invalid)?;
            parameters.push(ty);
            rest = remaining;
        }
        let ret = &rest[1..];
        let return_type = if ret == "V" {
            self.core.void
        } else {
            match self.parse_field_type(ret) {
                Some((ty, "")) => ty,
                _ => return Err(invalid().into()),
            }
        };
        Ok((parameters, return_type))
    }

    /// Parse one field type off the front of a descriptor
    fn parse_field_type<'a>(&self, descriptor: &'a str) -> Option<(Type<'g>, &'a str)> {
        let rest = descriptor.get(1..)?;
        let core = &self.core;
        let ty = match descriptor.as_bytes().first()? {
            b'Z' => core.boolean,
            b'B' => core.byte,
            b'C' => core.char,
            b'S' => core.short,
            b'I' => core.int,
            b'J' => core.long,
            b'F' => core.float,
            b'D' => core.double,
            b'L' => {
                let end = rest.find(';')?;
                return Some((self.class_type(&rest[..end]), &rest[end + 1..]));
            }
            b'[' => {
                let (element, rest) = self.parse_field_type(rest)?;
                return Some((self.array_of(element), rest));
            }
            _ => return None,
        };
        Some((ty, rest))
    }

    /// Add a field to its parent
    pub fn add_field(&self, field: FieldData<'g>) -> &'g FieldData<'g> {
        let field: &'g FieldData<'g> = self.arenas.field_arena.alloc(field);
        field.parent.fields.borrow_mut().push(field);
        field
    }

    /// Add a method to its parent
    pub fn add_method(&self, method: MethodData<'g>) -> &'g MethodData<'g> {
        let method: &'g MethodData<'g> = self.arenas.method_arena.alloc(method);
        method.parent.methods.borrow_mut().push(method);
        method
    }

    /// Ensure a type is loaded
    ///
    /// Loading failures roll the type back to `Defined` (so a later attempt can succeed, eg. once
    /// the class path is fixed) and propagate the error.
    pub fn load(&self, ty: Type<'g>) -> Result<()> {
        match ty.state() {
            LoadingState::Defined => (),
            LoadingState::Loading => {
                return Err(LinkageError::new(
                    LinkageErrorKind::ClassCircularityError,
                    ty.name.clone(),
                )
                .into())
            }
            _ => return Ok(()),
        }

        match ty.kind {
            TypeKind::Class => (),
            TypeKind::Array(element) => {
                self.load(element)?;
                ty.set_state(LoadingState::Loaded);
                return Ok(());
            }
            _ => {
                ty.set_state(LoadingState::Loaded);
                return Ok(());
            }
        }

        debug!("loading {}", ty);
        ty.set_state(LoadingState::Loading);
        let result = match self.find_class_bytes(&ty.name)? {
            Some(bytes) => classfile::load_class(self, ty, &bytes),
            None if super::bootstrap::define(self, ty) => Ok(()),
            None => Err(LinkageError::new(LinkageErrorKind::NoClassDefFoundError, ty.name.clone())
                .into()),
        };

        match result {
            Ok(()) => {
                ty.set_state(LoadingState::Loaded);
                self.statistics.classes_loaded.set(self.statistics.classes_loaded.get() + 1);
                Ok(())
            }
            Err(err) => {
                debug!("rolling back {}", ty);
                self.roll_back(ty);
                Err(err)
            }
        }
    }

    /// Locate the classfile for a class name
    ///
    /// `java/lang/Class` is looked for as `java/lang/Klass` first, since the target VM has its own
    /// implementation of that class.
    fn find_class_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if name == "java/lang/Class" {
            if let Some(bytes) = self.class_path.open("java/lang/Klass") {
                return Ok(Some(bytes?));
            }
        }
        match self.class_path.open(name) {
            Some(bytes) => Ok(Some(bytes?)),
            None => Ok(None),
        }
    }

    fn roll_back(&self, ty: Type<'g>) {
        ty.set_state(LoadingState::Defined);
        ty.access_flags.set(ClassAccessFlags::PUBLIC);
        ty.superclass.set(None);
        ty.interfaces.borrow_mut().clear();
        ty.fields.borrow_mut().clear();
        ty.methods.borrow_mut().clear();
        *ty.source_file.borrow_mut() = None;
        *ty.constant_pool.borrow_mut() = None;
    }

    /// Is the sub type a subclass of (or the same class as) the super type?
    ///
    /// Only superclass edges are followed.
    pub fn is_kind_of(&self, sub_type: Type<'g>, super_type: Type<'g>) -> Result<bool> {
        let mut next = Some(sub_type);
        while let Some(ty) = next {
            if ty == super_type {
                return Ok(true);
            }
            self.load(ty)?;
            next = ty.superclass();
        }
        Ok(false)
    }

    /// Does the type implement the interface (directly or through its super types)?
    pub fn implements(&self, ty: Type<'g>, interface: Type<'g>) -> Result<bool> {
        let mut to_visit = vec![ty];
        let mut seen = HashSet::new();
        while let Some(ty) = to_visit.pop() {
            if ty == interface {
                return Ok(true);
            }
            if !seen.insert(ty.id) {
                continue;
            }
            self.load(ty)?;
            to_visit.extend(ty.interfaces());
            to_visit.extend(ty.superclass());
        }
        Ok(false)
    }

    /// Verifier assignability
    ///
    /// Interfaces are treated as `Object`, since the verifier cannot tell statically whether a
    /// value implements an interface.
    pub fn is_assignable(&self, sub_type: Type<'g>, super_type: Type<'g>) -> Result<bool> {
        let core = &self.core;

        if sub_type.is_bogus() && !super_type.is_bogus() {
            return Ok(false);
        }
        if sub_type == super_type || super_type == core.universe || super_type == core.bogus {
            return Ok(true);
        }
        if sub_type.is_sub_int() && super_type == core.int {
            return Ok(true);
        }
        if sub_type.is_proxy() || super_type.is_proxy() {
            return Ok(false);
        }
        if sub_type == core.new_object || super_type == core.new_object {
            return Ok(false);
        }
        if !sub_type.is_reference() || !super_type.is_reference() {
            return Ok(false);
        }
        // Locals and stack slots recorded as null accept any reference
        if super_type == core.null_object {
            return Ok(true);
        }
        if sub_type == core.init_object || super_type == core.init_object {
            return Ok(false);
        }
        if sub_type == core.null_object {
            return Ok(true);
        }

        let mut super_type = super_type;
        if super_type.is_class() {
            self.load(super_type)?;
            if super_type.is_interface() {
                super_type = core.object;
            }
        }
        if self.is_kind_of(sub_type, super_type)? {
            return Ok(true);
        }

        match (sub_type.element_type(), super_type.element_type()) {
            (Some(sub_elem), Some(super_elem)) => {
                if sub_elem.is_primitive() || super_elem.is_primitive() {
                    Ok(sub_elem == super_elem)
                } else {
                    self.is_assignable(sub_elem, super_elem)
                }
            }
            _ => Ok(false),
        }
    }

    /// Type that a local (or stack slot) holding a value of this type has
    ///
    /// `boolean`, `byte`, `char` and `short` all live in `int` slots.
    pub fn local_type(&self, ty: Type<'g>) -> Type<'g> {
        if ty.is_sub_int() {
            self.core.int
        } else {
            ty
        }
    }

    /// Type of the second slot of a two word type
    pub fn second_word_type(&self, ty: Type<'g>) -> Option<Type<'g>> {
        if ty.is_long() {
            Some(self.core.long2)
        } else if ty.is_double() {
            Some(self.core.double2)
        } else {
            None
        }
    }

    /// Is `ty` a strictly more precise type than `than`?
    ///
    /// Used to narrow the type of a local from the way its value is consumed. With
    /// `interface_narrows`, an interface counts as narrower than a class that does not implement it.
    pub fn is_narrower(&self, ty: Type<'g>, than: Type<'g>, interface_narrows: bool) -> Result<bool> {
        if interface_narrows && ty.is_class() && than.is_class() {
            self.load(ty)?;
            self.load(than)?;
            if ty.is_interface() && !than.is_interface() {
                return Ok(!self.implements(than, ty)?);
            }
        }
        Ok(ty != than
            && self.is_assignable(ty, than)?
            && (than == self.core.null_object || self.is_kind_of(ty, than)?))
    }

    /// Is the type a subclass of `Throwable`?
    pub fn is_throwable(&self, ty: Type<'g>) -> Result<bool> {
        if !ty.is_class() {
            return Ok(false);
        }
        self.is_kind_of(ty, self.core.throwable)
    }

    /// Find a field by name and type, searching super types as in JVM field resolution
    pub fn lookup_field(
        &self,
        ty: Type<'g>,
        name: &str,
        field_type: Type<'g>,
    ) -> Result<Option<&'g FieldData<'g>>> {
        self.load(ty)?;
        if let Some(field) = ty
            .fields()
            .into_iter()
            .find(|f| f.name == name && f.ty == field_type)
        {
            return Ok(Some(field));
        }
        for interface in ty.interfaces() {
            if let Some(field) = self.lookup_field(interface, name, field_type)? {
                return Ok(Some(field));
            }
        }
        match ty.superclass() {
            Some(superclass) => self.lookup_field(superclass, name, field_type),
            None => Ok(None),
        }
    }

    /// Find a method by name and descriptor
    ///
    /// Superclasses are searched first, then superinterfaces (for abstract classes and interfaces
    /// that inherit abstract methods).
    pub fn lookup_method(
        &self,
        ty: Type<'g>,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<&'g MethodData<'g>>> {
        let mut next = Some(ty);
        while let Some(class) = next {
            self.load(class)?;
            if let Some(method) = class
                .methods()
                .into_iter()
                .find(|m| m.name == name && m.descriptor == descriptor)
            {
                return Ok(Some(method));
            }
            next = class.superclass();
        }

        let mut next = Some(ty);
        while let Some(class) = next {
            for interface in class.interfaces() {
                if let Some(method) = self.lookup_method(interface, name, descriptor)? {
                    return Ok(Some(method));
                }
            }
            next = class.superclass();
        }
        Ok(None)
    }

    /// Can code in `from` see the class `target`?
    pub fn is_class_accessible(&self, from: Type<'g>, target: Type<'g>) -> Result<bool> {
        if let Some(element) = target.element_type() {
            return self.is_class_accessible(from, element);
        }
        if !target.is_class() {
            return Ok(true);
        }
        self.load(target)?;
        Ok(target.is_public() || from.in_same_package(target))
    }

    /// Can code in `from` see a member of `parent` with the given visibility?
    pub fn is_member_accessible(
        &self,
        from: Type<'g>,
        parent: Type<'g>,
        visibility: Visibility,
    ) -> Result<bool> {
        Ok(match visibility {
            Visibility::Public => true,
            Visibility::Private => from == parent,
            Visibility::Package => from.in_same_package(parent),
            Visibility::Protected => {
                from.in_same_package(parent) || self.is_kind_of(from, parent)?
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classfile::MemoryClassPath;

    fn with_context<F: for<'g> FnOnce(&TranslationContext<'g>)>(f: F) {
        let arenas = ContextArenas::new();
        let ctx = TranslationContext::new(
            &arenas,
            Settings::default(),
            Box::new(MemoryClassPath::new()),
        );
        f(&ctx)
    }

    #[test]
    fn interning() {
        with_context(|ctx| {
            let a = ctx.class_type("a/B");
            assert!(std::ptr::eq(a, ctx.class_type("a/B")));
            let arr = ctx.array_of(ctx.core.int);
            assert_eq!(arr.name, "[I");
            assert!(std::ptr::eq(arr, ctx.type_for_descriptor("[I").unwrap()));
            assert!(std::ptr::eq(ctx.core.string, ctx.type_for_class_name("java/lang/String").unwrap()));
        })
    }

    #[test]
    fn method_signatures() {
        with_context(|ctx| {
            let (params, ret) = ctx.method_signature("(IJ[Ljava/lang/String;)V").unwrap();
            assert_eq!(params.len(), 3);
            assert!(params[1].is_long());
            assert_eq!(params[2].name, "[Ljava/lang/String;");
            assert!(ret.is_void());

            let (params, ret) = ctx.method_signature("()I").unwrap();
            assert!(params.is_empty());
            assert_eq!(ret, ctx.core.int);

            assert!(ctx.method_signature("(V)V").is_err());
            assert!(ctx.method_signature("(I").is_err());
        })
    }

    #[test]
    fn bootstrap_assignability() {
        with_context(|ctx| {
            let core = &ctx.core;
            assert!(ctx.is_assignable(core.string, core.object).unwrap());
            assert!(!ctx.is_assignable(core.object, core.string).unwrap());
            assert!(ctx.is_assignable(core.null_object, core.string).unwrap());
            assert!(ctx.is_assignable(core.string, core.null_object).unwrap());
            assert!(!ctx.is_assignable(core.int, core.null_object).unwrap());
            assert!(ctx.is_narrower(core.string, core.object, true).unwrap());
            assert!(ctx.is_narrower(core.string, core.null_object, true).unwrap());
            assert!(!ctx.is_narrower(core.object, core.string, true).unwrap());
            assert!(ctx.is_assignable(core.byte, core.int).unwrap());
            assert!(!ctx.is_assignable(core.int, core.byte).unwrap());
            assert!(!ctx.is_assignable(core.bogus, core.int).unwrap());
            assert!(ctx.is_assignable(core.int, core.bogus).unwrap());

            // Interfaces are treated as `Object`
            assert!(ctx.is_assignable(core.object, core.serializable).unwrap());

            let strings = ctx.array_of(core.string);
            let objects = ctx.array_of(core.object);
            assert!(ctx.is_assignable(strings, objects).unwrap());
            assert!(ctx.is_assignable(strings, core.object).unwrap());
            assert!(!ctx.is_assignable(ctx.array_of(core.byte), ctx.array_of(core.int)).unwrap());
        })
    }

    #[test]
    fn missing_classes_roll_back() {
        with_context(|ctx| {
            let missing = ctx.class_type("does/not/Exist");
            let err = ctx.load(missing).unwrap_err();
            assert_eq!(
                err.as_linkage().map(|e| e.kind),
                Some(LinkageErrorKind::NoClassDefFoundError)
            );
            assert_eq!(missing.state(), LoadingState::Defined);
        })
    }
}
