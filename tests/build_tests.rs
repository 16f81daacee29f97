//! Building classes from scratch through the public facade.

use classfile::{
    Attribute, ClassAccessFlags, Classfile, FieldAccessFlags, MethodAccessFlags, Opcode,
    PoolEntry, PoolRead,
};

#[test]
fn empty_class_layout() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Foo", |class| {
            class.set_version(52, 0);
            Ok(())
        })
        .unwrap();

    assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 0); // minor
    assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 52); // major

    let model = classfile.parse(&bytes).unwrap();
    assert_eq!(model.this_class().unwrap(), "Foo");
    assert_eq!(model.super_class().unwrap(), Some("java/lang/Object"));
    assert_eq!(
        model.flags(),
        ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER
    );
    assert!(model.methods().is_empty());
    assert!(model.fields().is_empty());

    // The pool holds exactly two Utf8 and two Class entries
    let pool = model.pool();
    let mut class_entries = 0;
    let mut utf8_entries = 0;
    for index in 1..pool.size() {
        match pool.entry(index).unwrap() {
            PoolEntry::Class { .. } => class_entries += 1,
            PoolEntry::Utf8(_) => utf8_entries += 1,
            other => panic!("unexpected pool entry {other:?}"),
        }
    }
    assert_eq!(class_entries, 2);
    assert_eq!(utf8_entries, 2);
    assert_eq!(pool.size(), 5);
}

#[test]
fn class_with_members_parses_back() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("demo/Counter", |class| {
            class.add_interface("java/io/Serializable");
            class.with_attribute(Attribute::SourceFile("Counter.java".to_string()));
            class.with_field(FieldAccessFlags::PRIVATE, "count", "I", |_| Ok(()))?;
            class.with_method(
                MethodAccessFlags::PUBLIC,
                "increment",
                "()V",
                |method| {
                    method.with_code(|code| {
                        code.load(Opcode::ALoad, 0)?;
                        code.instruction(classfile::Instruction::Stack(Opcode::Dup))?;
                        code.field_access(Opcode::GetField, "demo/Counter", "count", "I")?;
                        code.const_int(1)?;
                        code.instruction(classfile::Instruction::Operator(Opcode::IAdd))?;
                        code.field_access(Opcode::PutField, "demo/Counter", "count", "I")?;
                        code.return_(Opcode::Return)
                    })
                },
            )
        })
        .unwrap();

    let model = classfile.parse(&bytes).unwrap();
    assert_eq!(model.interfaces().unwrap(), vec!["java/io/Serializable"]);
    assert_eq!(
        model.attributes().unwrap(),
        &[Attribute::SourceFile("Counter.java".to_string())]
    );
    let field = &model.fields()[0];
    assert_eq!(field.name().unwrap(), "count");
    assert_eq!(field.descriptor().unwrap(), "I");
    let method = &model.methods()[0];
    assert_eq!(method.name().unwrap(), "increment");
    let code = method.code().unwrap().expect("has a body");
    // aload_0 dup getfield iconst_1 iadd putfield return
    assert_eq!(code.code_bytes().len(), 11);
    assert_eq!(code.max_stack(), 3);
    assert_eq!(code.max_locals(), 1);
}

#[test]
fn singleton_attributes_follow_last_wins() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Twice", |class| {
            class.with_attribute(Attribute::SourceFile("First.java".to_string()));
            class.with_attribute(Attribute::SourceFile("Second.java".to_string()));
            Ok(())
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    assert_eq!(
        model.attributes().unwrap(),
        &[Attribute::SourceFile("Second.java".to_string())]
    );
}

#[test]
fn field_constant_value_round_trips() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Consts", |class| {
            class.with_field(
                FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
                "GREETING",
                "Ljava/lang/String;",
                |field| {
                    field.with_attribute(Attribute::ConstantValue(
                        classfile::ConstantValue::String("hello".to_string()),
                    ));
                    Ok(())
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let attributes = model.fields()[0].attributes().unwrap();
    assert_eq!(
        attributes,
        &[Attribute::ConstantValue(classfile::ConstantValue::String("hello".to_string()))]
    );
}

#[test]
fn exception_handler_round_trips() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Guarded", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "pick",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        let start = code.new_label();
                        let end = code.new_label();
                        let handler = code.new_label();
                        code.exception_catch(start, end, handler, Some("java/lang/Exception"))?;
                        code.bind(start)?;
                        code.load(Opcode::ILoad, 0)?;
                        code.return_(Opcode::IReturn)?;
                        code.bind(end)?;
                        code.bind(handler)?;
                        code.throw()
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    let table = code.exception_table();
    assert_eq!(table.len(), 1);
    assert_eq!((table[0].start_pc, table[0].end_pc, table[0].handler_pc), (0, 2, 2));
    assert_eq!(
        model.pool().class_name(table[0].catch_type).unwrap(),
        "java/lang/Exception"
    );
    // handler keeps the thrown value on the stack
    assert_eq!(code.max_stack(), 1);
}

#[test]
fn line_numbers_and_debug_tables_are_emitted() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Debuggable", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "id",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        let start = code.new_label();
                        let end = code.new_label();
                        code.bind(start)?;
                        code.line_number(42)?;
                        code.load(Opcode::ILoad, 0)?;
                        code.return_(Opcode::IReturn)?;
                        code.bind(end)?;
                        let element = classfile::CodeElement::LocalVariable {
                            start,
                            end,
                            name: "value".to_string(),
                            descriptor: "I".to_string(),
                            slot: 0,
                        };
                        code.with(&element)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    let elements = code.elements().unwrap();
    let mut saw_line = false;
    let mut saw_local = false;
    for element in elements {
        match element {
            classfile::CodeElement::LineNumber { line } => {
                assert_eq!(*line, 42);
                saw_line = true;
            }
            classfile::CodeElement::LocalVariable { name, descriptor, slot, .. } => {
                assert_eq!(name, "value");
                assert_eq!(descriptor, "I");
                assert_eq!(*slot, 0);
                saw_local = true;
            }
            _ => {}
        }
    }
    assert!(saw_line);
    assert!(saw_local);
}

#[test]
fn debug_drop_options_filter_tables() {
    let classfile = Classfile::new()
        .with_line_numbers(classfile::LineNumbersOption::Drop)
        .with_debug_elements(classfile::DebugElementsOption::Drop);
    let bytes = classfile
        .build("Stripped", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "id",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        code.line_number(7)?;
                        code.load(Opcode::ILoad, 0)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    for element in code.elements().unwrap() {
        assert!(
            !matches!(element, classfile::CodeElement::LineNumber { .. }),
            "line number survived DROP_LINE_NUMBERS"
        );
    }
}
