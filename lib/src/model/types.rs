use super::{FieldData, MethodData, ProxyId};
use crate::classfile::{ClassAccessFlags, ConstantPool};
use crate::util::Width;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Interned type
///
/// Types live in the arenas of a `TranslationContext` and are never moved, so two `Type`s are
/// the same type exactly when they point at the same `TypeData`.
pub type Type<'g> = &'g TypeData<'g>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
}

impl PrimitiveType {
    pub fn descriptor(self) -> char {
        match self {
            PrimitiveType::Boolean => 'Z',
            PrimitiveType::Byte => 'B',
            PrimitiveType::Char => 'C',
            PrimitiveType::Short => 'S',
            PrimitiveType::Int => 'I',
            PrimitiveType::Long => 'J',
            PrimitiveType::Float => 'F',
            PrimitiveType::Double => 'D',
            PrimitiveType::Void => 'V',
        }
    }
}

/// Types that only exist for the benefit of the verifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SyntheticType {
    /// Super type of everything
    Universe,

    /// Unusable value (eg. a dead local)
    Bogus,

    /// Result of `aconst_null`
    NullObject,

    /// `this` inside `<init>` before the super constructor is called
    InitObject,

    /// Uninitialized object of unknown provenance
    NewObject,

    /// Element type of `baload`/`bastore` arrays before we know which one it is
    ByteOrBoolean,

    /// Second word of a `long`
    Long2,

    /// Second word of a `double`
    Double2,
}

pub enum TypeKind<'g> {
    Primitive(PrimitiveType),
    Synthetic(SyntheticType),
    Class,
    Array(Type<'g>),

    /// Object created by the `new` at some address, before its constructor ran
    Proxy(ProxyId),
}

/// Class loading progress
///
/// `Loading` doubles as a reentrancy guard: asking to load a type that is already `Loading`
/// means the superclass/interface graph has a cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadingState {
    Defined,
    Loading,
    Loaded,
    Converting,
    Converted,
    Failed,
}

pub struct TypeData<'g> {
    /// Internal name (eg. `java/lang/Object`, `[I`, `I`, `-NULL-`)
    pub name: String,

    pub kind: TypeKind<'g>,

    /// Order of creation in the context
    pub id: usize,

    pub(crate) state: Cell<LoadingState>,
    pub(crate) access_flags: Cell<ClassAccessFlags>,
    pub(crate) superclass: Cell<Option<Type<'g>>>,
    pub(crate) interfaces: RefCell<Vec<Type<'g>>>,
    pub(crate) fields: RefCell<Vec<&'g FieldData<'g>>>,
    pub(crate) methods: RefCell<Vec<&'g MethodData<'g>>>,
    pub(crate) source_file: RefCell<Option<String>>,
    pub(crate) constant_pool: RefCell<Option<Rc<ConstantPool<'g>>>>,
    pub(crate) array_of: Cell<Option<Type<'g>>>,
}

impl<'g> TypeData<'g> {
    pub(crate) fn new(name: String, kind: TypeKind<'g>, id: usize) -> TypeData<'g> {
        TypeData {
            name,
            kind,
            id,
            state: Cell::new(LoadingState::Defined),
            access_flags: Cell::new(ClassAccessFlags::PUBLIC),
            superclass: Cell::new(None),
            interfaces: RefCell::new(vec![]),
            fields: RefCell::new(vec![]),
            methods: RefCell::new(vec![]),
            source_file: RefCell::new(None),
            constant_pool: RefCell::new(None),
            array_of: Cell::new(None),
        }
    }

    pub fn state(&self) -> LoadingState {
        self.state.get()
    }

    pub fn set_state(&self, state: LoadingState) {
        self.state.set(state);
    }

    pub fn is_loaded(&self) -> bool {
        self.state.get() >= LoadingState::Loaded && self.state.get() != LoadingState::Failed
    }

    pub fn access_flags(&self) -> ClassAccessFlags {
        self.access_flags.get()
    }

    pub fn superclass(&self) -> Option<Type<'g>> {
        self.superclass.get()
    }

    pub fn interfaces(&self) -> Vec<Type<'g>> {
        self.interfaces.borrow().clone()
    }

    pub fn fields(&self) -> Vec<&'g FieldData<'g>> {
        self.fields.borrow().clone()
    }

    pub fn methods(&self) -> Vec<&'g MethodData<'g>> {
        self.methods.borrow().clone()
    }

    pub fn source_file(&self) -> Option<String> {
        self.source_file.borrow().clone()
    }

    pub fn constant_pool(&self) -> Option<Rc<ConstantPool<'g>>> {
        self.constant_pool.borrow().clone()
    }

    pub fn primitive(&self) -> Option<PrimitiveType> {
        match self.kind {
            TypeKind::Primitive(prim) => Some(prim),
            _ => None,
        }
    }

    pub fn synthetic(&self) -> Option<SyntheticType> {
        match self.kind {
            TypeKind::Synthetic(syn) => Some(syn),
            _ => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        match self.kind {
            TypeKind::Primitive(_) => true,
            TypeKind::Synthetic(syn) => matches!(
                syn,
                SyntheticType::ByteOrBoolean | SyntheticType::Long2 | SyntheticType::Double2
            ),
            _ => false,
        }
    }

    /// Values of this type are object references (including `null` and uninitialized objects)
    pub fn is_reference(&self) -> bool {
        match self.kind {
            TypeKind::Class | TypeKind::Array(_) | TypeKind::Proxy(_) => true,
            TypeKind::Synthetic(syn) => matches!(
                syn,
                SyntheticType::NullObject | SyntheticType::InitObject | SyntheticType::NewObject
            ),
            TypeKind::Primitive(_) => false,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array(_))
    }

    pub fn is_class(&self) -> bool {
        matches!(self.kind, TypeKind::Class)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.kind, TypeKind::Proxy(_))
    }

    pub fn proxy_id(&self) -> Option<ProxyId> {
        match self.kind {
            TypeKind::Proxy(id) => Some(id),
            _ => None,
        }
    }

    pub fn element_type(&self) -> Option<Type<'g>> {
        match self.kind {
            TypeKind::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// Number of array dimensions (0 for non-arrays)
    pub fn dimensions(&self) -> usize {
        let mut dims = 0;
        let mut elem = self.element_type();
        while let Some(ty) = elem {
            dims += 1;
            elem = ty.element_type();
        }
        dims
    }

    pub fn is_interface(&self) -> bool {
        self.is_class() && self.access_flags().contains(ClassAccessFlags::INTERFACE)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags().contains(ClassAccessFlags::FINAL)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags().contains(ClassAccessFlags::ABSTRACT)
    }

    pub fn is_public(&self) -> bool {
        self.access_flags().contains(ClassAccessFlags::PUBLIC)
    }

    pub fn is_two_words(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Primitive(PrimitiveType::Long) | TypeKind::Primitive(PrimitiveType::Double)
        )
    }

    pub fn is_long(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(PrimitiveType::Long))
    }

    pub fn is_double(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(PrimitiveType::Double))
    }

    pub fn is_second_word(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Synthetic(SyntheticType::Long2) | TypeKind::Synthetic(SyntheticType::Double2)
        )
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(PrimitiveType::Void))
    }

    pub fn is_bogus(&self) -> bool {
        matches!(self.kind, TypeKind::Synthetic(SyntheticType::Bogus))
    }

    /// Is this the (collapsed) type of `boolean`, `byte`, `char` or `short`?
    pub fn is_sub_int(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Primitive(PrimitiveType::Boolean)
                | TypeKind::Primitive(PrimitiveType::Byte)
                | TypeKind::Primitive(PrimitiveType::Char)
                | TypeKind::Primitive(PrimitiveType::Short)
                | TypeKind::Synthetic(SyntheticType::ByteOrBoolean)
        )
    }

    /// Package part of a class name (empty for the default package)
    pub fn package(&self) -> &str {
        if let Some(elem) = self.element_type() {
            return elem.package();
        }
        match self.name.rfind('/') {
            Some(idx) => &self.name[..idx],
            None => "",
        }
    }

    pub fn in_same_package(&self, other: &TypeData<'g>) -> bool {
        self.package() == other.package()
    }

    /// Descriptor form (eg. `Ljava/lang/Object;`, `[I`, `I`)
    pub fn descriptor(&self) -> String {
        match self.kind {
            TypeKind::Primitive(prim) => prim.descriptor().to_string(),
            TypeKind::Class => format!("L{};", self.name),
            _ => self.name.clone(),
        }
    }
}

impl<'g> PartialEq for TypeData<'g> {
    fn eq(&self, other: &TypeData<'g>) -> bool {
        std::ptr::eq(self, other)
    }
}

impl<'g> Eq for TypeData<'g> {}

impl<'g> Hash for TypeData<'g> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<'g> Width for TypeData<'g> {
    fn width(&self) -> usize {
        if self.is_two_words() {
            2
        } else {
            1
        }
    }
}

impl<'g> fmt::Display for TypeData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl<'g> fmt::Debug for TypeData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Type({})", self.name)
    }
}
