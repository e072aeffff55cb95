//! Built-in definitions for the handful of classes the translator cannot do without
//!
//! These are only used when the class path has no classfile for the class, so a real runtime
//! library on the class path always takes precedence.

use super::{MethodData, TranslationContext, Type};
use crate::classfile::{ClassAccessFlags, MethodAccessFlags};
use log::debug;
use std::cell::RefCell;

struct BootstrapClass {
    name: &'static str,
    superclass: Option<&'static str>,
    interfaces: &'static [&'static str],
    access_flags: ClassAccessFlags,
    methods: &'static [(&'static str, &'static str)],
}

const PUBLIC_CLASS: ClassAccessFlags = ClassAccessFlags::from_bits_truncate(0x0021);
const FINAL_CLASS: ClassAccessFlags = ClassAccessFlags::from_bits_truncate(0x0031);
const INTERFACE: ClassAccessFlags = ClassAccessFlags::from_bits_truncate(0x0601);

const THROWABLE_METHODS: &[(&str, &str)] = &[
    ("<init>", "()V"),
    ("<init>", "(Ljava/lang/String;)V"),
    ("getMessage", "()Ljava/lang/String;"),
];

const CLASSES: &[BootstrapClass] = &[
    BootstrapClass {
        name: "java/lang/Object",
        superclass: None,
        interfaces: &[],
        access_flags: PUBLIC_CLASS,
        methods: &[
            ("<init>", "()V"),
            ("hashCode", "()I"),
            ("equals", "(Ljava/lang/Object;)Z"),
            ("toString", "()Ljava/lang/String;"),
            ("getClass", "()Ljava/lang/Class;"),
        ],
    },
    BootstrapClass {
        name: "java/lang/String",
        superclass: Some("java/lang/Object"),
        interfaces: &["java/io/Serializable"],
        access_flags: FINAL_CLASS,
        methods: &[("<init>", "()V"), ("length", "()I"), ("charAt", "(I)C")],
    },
    BootstrapClass {
        name: "java/lang/Class",
        superclass: Some("java/lang/Object"),
        interfaces: &[],
        access_flags: FINAL_CLASS,
        methods: &[("getName", "()Ljava/lang/String;")],
    },
    BootstrapClass {
        name: "java/lang/Throwable",
        superclass: Some("java/lang/Object"),
        interfaces: &["java/io/Serializable"],
        access_flags: PUBLIC_CLASS,
        methods: THROWABLE_METHODS,
    },
    BootstrapClass {
        name: "java/lang/Exception",
        superclass: Some("java/lang/Throwable"),
        interfaces: &[],
        access_flags: PUBLIC_CLASS,
        methods: THROWABLE_METHODS,
    },
    BootstrapClass {
        name: "java/lang/RuntimeException",
        superclass: Some("java/lang/Exception"),
        interfaces: &[],
        access_flags: PUBLIC_CLASS,
        methods: THROWABLE_METHODS,
    },
    BootstrapClass {
        name: "java/lang/Error",
        superclass: Some("java/lang/Throwable"),
        interfaces: &[],
        access_flags: PUBLIC_CLASS,
        methods: THROWABLE_METHODS,
    },
    BootstrapClass {
        name: "java/lang/Cloneable",
        superclass: Some("java/lang/Object"),
        interfaces: &[],
        access_flags: INTERFACE,
        methods: &[],
    },
    BootstrapClass {
        name: "java/io/Serializable",
        superclass: Some("java/lang/Object"),
        interfaces: &[],
        access_flags: INTERFACE,
        methods: &[],
    },
];

/// Fill in a built-in definition for the type, if there is one
pub(super) fn define<'g>(ctx: &TranslationContext<'g>, ty: Type<'g>) -> bool {
    let class = match CLASSES.iter().find(|class| class.name == ty.name) {
        Some(class) => class,
        None => return false,
    };
    debug!("using built-in definition of {}", ty);

    ty.access_flags.set(class.access_flags);
    ty.superclass.set(class.superclass.map(|name| ctx.class_type(name)));
    *ty.interfaces.borrow_mut() = class
        .interfaces
        .iter()
        .map(|name| ctx.class_type(name))
        .collect();

    for (slot, (name, descriptor)) in class.methods.iter().enumerate() {
        let (parameters, return_type) = match ctx.method_signature(descriptor) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        let return_type = if *name == "<init>" { ty } else { return_type };
        ctx.add_method(MethodData {
            parent: ty,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags: MethodAccessFlags::PUBLIC,
            parameters,
            return_type,
            exceptions: vec![],
            slot,
            holder: RefCell::new(None),
        });
    }
    true
}
