mod common;

use common::{stack_map, ClassFileBuilder, Code, Item, ACC_PUBLIC, ACC_STATIC};
use squawk_translator::classfile::{opcodes, MemoryClassPath};
use squawk_translator::errors::LinkageErrorKind;
use squawk_translator::ir::{Condition, InsnKind, InvokeForm};
use squawk_translator::model::{ContextArenas, LoadingState, TranslationContext};
use squawk_translator::settings::Settings;
use squawk_translator::suite::{
    BinarySuiteEmitter, BranchOp, Emitted, NumericInsn, NumericOp, RecordedMethod,
    RecordingEmitter, SimpleOp,
};
use squawk_translator::translate::{self, graph_builder};

fn with_classes<F>(classes: Vec<(&str, Vec<u8>)>, settings: Settings, f: F)
where
    F: for<'g> FnOnce(&TranslationContext<'g>),
{
    let mut class_path = MemoryClassPath::new();
    for (name, bytes) in classes {
        class_path.insert(name, bytes);
    }
    let arenas = ContextArenas::new();
    let ctx = TranslationContext::new(&arenas, settings, Box::new(class_path));
    f(&ctx)
}

fn find_method<'a, 'g>(emitter: &'a RecordingEmitter<'g>, name: &str) -> &'a RecordedMethod<'g> {
    emitter
        .classes
        .iter()
        .flat_map(|class| class.methods.iter())
        .find(|recorded| recorded.method.name == name)
        .unwrap()
}

/// `int f(int x) { if (x > 0) return x; else return -x; }`
fn absolute_value_class() -> Vec<u8> {
    let mut class = ClassFileBuilder::new("A", "java/lang/Object");
    let this = class.class("A");
    class.source_file("A.java");
    class.method(
        ACC_PUBLIC,
        "f",
        "(I)I",
        Code {
            max_stack: 1,
            max_locals: 2,
            code: vec![
                opcodes::ILOAD_1,
                opcodes::IFLE,
                0,
                5,
                opcodes::ILOAD_1,
                opcodes::IRETURN,
                opcodes::ILOAD_1,
                opcodes::INEG,
                opcodes::IRETURN,
            ],
            stack_map: Some(stack_map(&[(6, vec![Item::Object(this), Item::Int], vec![])])),
            line_numbers: vec![(0, 10), (4, 11), (6, 13)],
            ..Code::default()
        },
    );
    class.build()
}

#[test]
fn conditional_branch_round_trip() {
    with_classes(vec![("A", absolute_value_class())], Settings::default(), |ctx| {
        let class = ctx.type_for_class_name("A").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, class, &mut emitter).unwrap();
        assert_eq!(class.state(), LoadingState::Converted);

        let recorded = find_method(&emitter, "f");
        let branches: Vec<_> = recorded
            .code
            .iter()
            .filter(|insn| matches!(insn.emitted, Emitted::Branch { .. }))
            .collect();
        assert_eq!(branches.len(), 1);
        let branch = branches[0];
        let offset = match &branch.emitted {
            Emitted::Branch {
                op: BranchOp::If { condition, with_zero },
                offset,
                ..
            } => {
                assert_eq!(*condition, Condition::Le);
                assert!(*with_zero);
                *offset
            }
            other => panic!("expected a conditional branch, found {:?}", other),
        };

        let returns = recorded
            .code
            .iter()
            .filter(|insn| matches!(insn.emitted, Emitted::Simple(SimpleOp::Return)))
            .count();
        assert_eq!(returns, 2);

        // The branch lands on the load feeding the negation
        let negate = recorded
            .code
            .iter()
            .position(|insn| {
                matches!(
                    insn.emitted,
                    Emitted::Numeric(NumericInsn {
                        op: NumericOp::Negate,
                        ..
                    })
                )
            })
            .unwrap();
        let target = recorded.code[negate - 1].ip as i64;
        assert_eq!(branch.offset_base() as i64 + offset as i64, target);
        assert_eq!(recorded.length as usize, recorded.bytes.len());
    });
}

#[test]
fn line_numbers_follow_debug_setting() {
    with_classes(vec![("A", absolute_value_class())], Settings::default(), |ctx| {
        let class = ctx.type_for_class_name("A").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, class, &mut emitter).unwrap();

        let lines: Vec<i32> = find_method(&emitter, "f").lines.iter().map(|l| l.line).collect();
        assert_eq!(lines, vec![10, 11, 13]);
        let ips: Vec<u32> = find_method(&emitter, "f").lines.iter().map(|l| l.ip).collect();
        assert!(ips.windows(2).all(|pair| pair[0] < pair[1]));
    });

    let settings = Settings {
        emit_debug_info: false,
        ..Settings::default()
    };
    with_classes(vec![("A", absolute_value_class())], settings, |ctx| {
        let class = ctx.type_for_class_name("A").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, class, &mut emitter).unwrap();
        assert!(find_method(&emitter, "f").lines.is_empty());
    });
}

fn foo_class() -> Vec<u8> {
    let mut class = ClassFileBuilder::new("Foo", "java/lang/Object");
    let object_init = class.method_ref("java/lang/Object", "<init>", "()V");
    let foo_init = class.method_ref("Foo", "<init>", "()V");
    let foo = class.class("Foo");
    let [init_hi, init_lo] = object_init.to_be_bytes();
    class.method(
        ACC_PUBLIC,
        "<init>",
        "()V",
        Code {
            max_stack: 1,
            max_locals: 1,
            code: vec![
                opcodes::ALOAD_0,
                opcodes::INVOKESPECIAL,
                init_hi,
                init_lo,
                opcodes::RETURN,
            ],
            ..Code::default()
        },
    );

    let [foo_hi, foo_lo] = foo.to_be_bytes();
    let [ctor_hi, ctor_lo] = foo_init.to_be_bytes();
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        "make",
        "()V",
        Code {
            max_stack: 2,
            max_locals: 1,
            code: vec![
                opcodes::NEW,
                foo_hi,
                foo_lo,
                opcodes::DUP,
                opcodes::INVOKESPECIAL,
                ctor_hi,
                ctor_lo,
                opcodes::ASTORE_0,
                opcodes::RETURN,
            ],
            ..Code::default()
        },
    );
    class.build()
}

#[test]
fn new_dup_init_becomes_a_single_allocation() {
    with_classes(vec![("Foo", foo_class())], Settings::default(), |ctx| {
        let class = ctx.type_for_class_name("Foo").unwrap();
        ctx.load(class).unwrap();
        let method = class
            .methods()
            .into_iter()
            .find(|method| method.name == "make")
            .unwrap();
        let holder = method.take_bytecode().unwrap();
        let ir = graph_builder::build(ctx, method, &holder, None).unwrap();

        let count = |predicate: &dyn Fn(&InsnKind) -> bool| {
            ir.ids().into_iter().filter(|id| predicate(&ir[*id].kind)).count()
        };
        assert_eq!(count(&|kind| matches!(kind, InsnKind::NewObject)), 1);
        assert_eq!(
            count(&|kind| matches!(
                kind,
                InsnKind::Invoke {
                    form: InvokeForm::Init,
                    ..
                }
            )),
            1
        );
        assert_eq!(count(&|kind| matches!(kind, InsnKind::StoreLocal { .. })), 1);
        assert_eq!(count(&|kind| matches!(kind, InsnKind::Pop { .. })), 0);
    });
}

#[test]
fn allocation_translates_end_to_end() {
    with_classes(vec![("Foo", foo_class())], Settings::default(), |ctx| {
        let class = ctx.type_for_class_name("Foo").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, class, &mut emitter).unwrap();

        let make = find_method(&emitter, "make");
        let invokes: Vec<_> = make
            .code
            .iter()
            .filter_map(|insn| match insn.emitted {
                Emitted::Invoke { form, .. } => Some(form),
                _ => None,
            })
            .collect();
        assert_eq!(invokes, vec![InvokeForm::Init]);
        assert!(emitter.classes[0].class_references.contains(&class));
    });
}

/// `static void h() { try { g(); } catch (Throwable t) { } }`
fn handler_class() -> Vec<u8> {
    let mut class = ClassFileBuilder::new("H", "java/lang/Object");
    let g = class.method_ref("H", "g", "()V");
    let throwable = class.class("java/lang/Throwable");
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        "g",
        "()V",
        Code {
            max_stack: 0,
            max_locals: 0,
            code: vec![opcodes::RETURN],
            ..Code::default()
        },
    );

    let [g_hi, g_lo] = g.to_be_bytes();
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        "h",
        "()V",
        Code {
            max_stack: 1,
            max_locals: 1,
            code: vec![
                opcodes::INVOKESTATIC,
                g_hi,
                g_lo,
                opcodes::RETURN,
                opcodes::ASTORE_0,
                opcodes::RETURN,
            ],
            handlers: vec![(0, 3, 4, 0)],
            stack_map: Some(stack_map(&[(4, vec![], vec![Item::Object(throwable)])])),
            ..Code::default()
        },
    );
    class.build()
}

#[test]
fn exception_handler_covers_protected_code() {
    with_classes(vec![("H", handler_class())], Settings::default(), |ctx| {
        let class = ctx.type_for_class_name("H").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, class, &mut emitter).unwrap();

        let h = find_method(&emitter, "h");
        assert_eq!(h.handlers.len(), 1);
        let handler = &h.handlers[0];
        assert_eq!(handler.from, 0);
        assert!(handler.from < handler.to);
        assert!(handler.to <= handler.entry);
        assert!(handler.entry < h.length);
        assert!(std::ptr::eq(handler.catch_type, ctx.core.throwable));

        let invoke = h
            .code
            .iter()
            .find(|insn| matches!(insn.emitted, Emitted::Invoke { .. }))
            .unwrap();
        assert!(invoke.ip < handler.to);
    });
}

/// `static Object bad(int x) { return x; }`, which does not verify
fn bad_class() -> Vec<u8> {
    let mut class = ClassFileBuilder::new("Bad", "java/lang/Object");
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        "bad",
        "(I)Ljava/lang/Object;",
        Code {
            max_stack: 1,
            max_locals: 1,
            code: vec![opcodes::ILOAD_0, opcodes::ARETURN],
            ..Code::default()
        },
    );
    class.build()
}

#[test]
fn verify_failure_is_isolated_to_its_class() {
    let classes = vec![("Bad", bad_class()), ("A", absolute_value_class())];
    with_classes(classes, Settings::default(), |ctx| {
        let bad = ctx.type_for_class_name("Bad").unwrap();
        let mut emitter = RecordingEmitter::new();
        let err = translate::translate_class(ctx, bad, &mut emitter).unwrap_err();
        assert!(err.verify_kind().is_some(), "unexpected error: {}", err);
        assert_eq!(bad.state(), LoadingState::Failed);
        assert_eq!(ctx.statistics.classes_failed.get(), 1);

        let good = ctx.type_for_class_name("A").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, good, &mut emitter).unwrap();
        assert_eq!(good.state(), LoadingState::Converted);
        assert_eq!(ctx.statistics.classes.get(), 1);
    });
}

#[test]
fn failed_class_is_not_translated_again() {
    with_classes(vec![("Bad", bad_class())], Settings::default(), |ctx| {
        let bad = ctx.type_for_class_name("Bad").unwrap();
        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, bad, &mut emitter).unwrap_err();
        assert_eq!(bad.state(), LoadingState::Failed);

        let err = translate::translate_class(ctx, bad, &mut emitter).unwrap_err();
        assert_eq!(err.as_linkage().unwrap().kind, LinkageErrorKind::LinkageError);
        assert_eq!(bad.state(), LoadingState::Failed);
        assert!(emitter.classes.is_empty());
    });
}

/// A method that translates, followed by one that does not verify
fn half_bad_class() -> Vec<u8> {
    let mut class = ClassFileBuilder::new("HalfBad", "java/lang/Object");
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        "ok",
        "()V",
        Code {
            code: vec![opcodes::RETURN],
            ..Code::default()
        },
    );
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        "bad",
        "(I)Ljava/lang/Object;",
        Code {
            max_stack: 1,
            max_locals: 1,
            code: vec![opcodes::ILOAD_0, opcodes::ARETURN],
            ..Code::default()
        },
    );
    class.build()
}

#[test]
fn shared_emitter_drops_the_failed_class() {
    let classes = vec![("HalfBad", half_bad_class()), ("A", absolute_value_class())];
    with_classes(classes, Settings::default(), |ctx| {
        let half_bad = ctx.type_for_class_name("HalfBad").unwrap();
        let good = ctx.type_for_class_name("A").unwrap();

        let mut emitter = RecordingEmitter::new();
        translate::translate_class(ctx, half_bad, &mut emitter).unwrap_err();
        assert!(emitter.classes.is_empty());
        translate::translate_class(ctx, good, &mut emitter).unwrap();
        assert_eq!(emitter.classes.len(), 1);
        let names: Vec<&str> = emitter.classes[0]
            .methods
            .iter()
            .map(|recorded| recorded.method.name.as_str())
            .collect();
        assert_eq!(names, vec!["f"]);
    });

    let classes = vec![("HalfBad", half_bad_class()), ("A", absolute_value_class())];
    with_classes(classes, Settings::default(), |ctx| {
        let half_bad = ctx.type_for_class_name("HalfBad").unwrap();
        let good = ctx.type_for_class_name("A").unwrap();

        let mut emitter = BinarySuiteEmitter::new();
        translate::translate_class(ctx, half_bad, &mut emitter).unwrap_err();
        translate::translate_class(ctx, good, &mut emitter).unwrap();
        let mut bytes = vec![];
        emitter.write_to(&mut bytes).unwrap();
        assert_eq!(&bytes[6..8], &[0, 1]);
    });
}

/// `Foo` with a static `name` method whose code is `code`
fn foo_with(
    name: &str,
    max_stack: u16,
    max_locals: u16,
    code: impl Fn(u16, u16) -> Vec<u8>,
) -> Vec<u8> {
    let mut class = ClassFileBuilder::new("Foo", "java/lang/Object");
    let object_init = class.method_ref("java/lang/Object", "<init>", "()V");
    let foo_init = class.method_ref("Foo", "<init>", "()V");
    let foo = class.class("Foo");
    let [init_hi, init_lo] = object_init.to_be_bytes();
    class.method(
        ACC_PUBLIC,
        "<init>",
        "()V",
        Code {
            max_stack: 1,
            max_locals: 1,
            code: vec![
                opcodes::ALOAD_0,
                opcodes::INVOKESPECIAL,
                init_hi,
                init_lo,
                opcodes::RETURN,
            ],
            ..Code::default()
        },
    );
    class.method(
        ACC_PUBLIC | ACC_STATIC,
        name,
        "()V",
        Code {
            max_stack,
            max_locals,
            code: code(foo, foo_init),
            ..Code::default()
        },
    );
    class.build()
}

fn assert_untranslatable(class: Vec<u8>) {
    with_classes(vec![("Foo", class)], Settings::default(), |ctx| {
        let foo = ctx.type_for_class_name("Foo").unwrap();
        let mut emitter = RecordingEmitter::new();
        let err = translate::translate_class(ctx, foo, &mut emitter).unwrap_err();
        let linkage = err.as_linkage().unwrap_or_else(|| panic!("unexpected error: {}", err));
        assert_eq!(linkage.kind, LinkageErrorKind::UntranslatableCode);
        assert_eq!(foo.state(), LoadingState::Failed);
    });
}

#[test]
fn swapped_uninitialized_object_is_untranslatable() {
    // new Foo; iconst_0; swap; invokespecial Foo.<init>; pop; return
    assert_untranslatable(foo_with("swapped", 2, 0, |foo, init| {
        let [foo_hi, foo_lo] = foo.to_be_bytes();
        let [init_hi, init_lo] = init.to_be_bytes();
        vec![
            opcodes::NEW,
            foo_hi,
            foo_lo,
            opcodes::ICONST_0,
            opcodes::SWAP,
            opcodes::INVOKESPECIAL,
            init_hi,
            init_lo,
            opcodes::POP,
            opcodes::RETURN,
        ]
    }));
}

#[test]
fn uninitialized_object_in_a_local_is_untranslatable() {
    // new Foo; astore_0; return
    assert_untranslatable(foo_with("stashed", 1, 1, |foo, _| {
        let [foo_hi, foo_lo] = foo.to_be_bytes();
        vec![opcodes::NEW, foo_hi, foo_lo, opcodes::ASTORE_0, opcodes::RETURN]
    }));
}

#[test]
fn missing_class_is_reported_and_rolled_back() {
    with_classes(vec![], Settings::default(), |ctx| {
        let missing = ctx.type_for_class_name("does/not/Exist").unwrap();
        let mut emitter = RecordingEmitter::new();
        let err = translate::translate_class(ctx, missing, &mut emitter).unwrap_err();
        let linkage = err.as_linkage().unwrap();
        assert_eq!(linkage.kind, LinkageErrorKind::NoClassDefFoundError);
        assert_eq!(missing.state(), LoadingState::Defined);
        assert!(emitter.classes.is_empty());
    });
}

#[test]
fn binary_suite_starts_with_magic() {
    with_classes(vec![("A", absolute_value_class())], Settings::default(), |ctx| {
        let class = ctx.type_for_class_name("A").unwrap();
        let mut emitter = BinarySuiteEmitter::new();
        translate::translate_class(ctx, class, &mut emitter).unwrap();

        let mut bytes = vec![];
        emitter.write_to(&mut bytes).unwrap();
        assert_eq!(&bytes[..4], &[0x53, 0x55, 0x49, 0x54]);
        assert!(bytes.len() > 8);
    });
}
