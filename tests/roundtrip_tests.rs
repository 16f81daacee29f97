//! Parse/transform round trips: the identity transform must preserve the
//! structure of everything it replays.

use classfile::{
    transform, Attribute, Classfile, ClassModel, MethodAccessFlags, Opcode, PoolRead,
    PoolSharingOption, UnknownAttributesOption,
};

/// `identical_code` is set when the pools are shared: operand indices then
/// survive the trip and the code arrays must match byte for byte. With a new
/// pool the indices may be renumbered, so only the shape is compared.
fn assert_structurally_equal(a: &ClassModel, b: &ClassModel, identical_code: bool) {
    assert_eq!(a.minor_version(), b.minor_version());
    assert_eq!(a.major_version(), b.major_version());
    assert_eq!(a.flags(), b.flags());
    assert_eq!(a.this_class().unwrap(), b.this_class().unwrap());
    assert_eq!(a.super_class().unwrap(), b.super_class().unwrap());
    assert_eq!(a.interfaces().unwrap(), b.interfaces().unwrap());
    assert_eq!(a.attributes().unwrap(), b.attributes().unwrap());

    assert_eq!(a.fields().len(), b.fields().len());
    for (fa, fb) in a.fields().iter().zip(b.fields()) {
        assert_eq!(fa.flags(), fb.flags());
        assert_eq!(fa.name().unwrap(), fb.name().unwrap());
        assert_eq!(fa.descriptor().unwrap(), fb.descriptor().unwrap());
        assert_eq!(fa.attributes().unwrap(), fb.attributes().unwrap());
    }

    assert_eq!(a.methods().len(), b.methods().len());
    for (ma, mb) in a.methods().iter().zip(b.methods()) {
        assert_eq!(ma.flags(), mb.flags());
        assert_eq!(ma.name().unwrap(), mb.name().unwrap());
        assert_eq!(ma.descriptor().unwrap(), mb.descriptor().unwrap());
        assert_eq!(ma.attributes().unwrap(), mb.attributes().unwrap());
        match (ma.code().unwrap(), mb.code().unwrap()) {
            (None, None) => {}
            (Some(ca), Some(cb)) => {
                if identical_code {
                    assert_eq!(ca.code_bytes(), cb.code_bytes());
                } else {
                    assert_eq!(ca.code_bytes().len(), cb.code_bytes().len());
                }
                assert_eq!(ca.max_stack(), cb.max_stack());
                assert_eq!(ca.max_locals(), cb.max_locals());
                assert_eq!(ca.exception_table().len(), cb.exception_table().len());
            }
            (a, b) => panic!("code presence differs: {} vs {}", a.is_some(), b.is_some()),
        }
    }
}

fn sample_bytes(classfile: &Classfile) -> Vec<u8> {
    classfile
        .build("sample/Widget", |class| {
            class.add_interface("java/lang/Runnable");
            class.with_attribute(Attribute::SourceFile("Widget.java".to_string()));
            class.with_attribute(Attribute::Signature("Ljava/lang/Object;".to_string()));
            class.with_field(
                classfile::FieldAccessFlags::PRIVATE | classfile::FieldAccessFlags::FINAL,
                "state",
                "J",
                |field| {
                    field.with_attribute(Attribute::ConstantValue(
                        classfile::ConstantValue::Long(-1),
                    ));
                    Ok(())
                },
            )?;
            class.with_method(MethodAccessFlags::PUBLIC, "<init>", "()V", |method| {
                method.with_code(|code| {
                    code.load(Opcode::ALoad, 0)?;
                    code.invoke(Opcode::InvokeSpecial, "java/lang/Object", "<init>", "()V")?;
                    code.return_(Opcode::Return)
                })
            })?;
            class.with_method(MethodAccessFlags::PUBLIC, "run", "()V", |method| {
                method.with_attribute(Attribute::Exceptions(vec![
                    "java/lang/IllegalStateException".to_string(),
                ]));
                method.with_code(|code| {
                    let skip = code.new_label();
                    code.load(Opcode::ALoad, 0)?;
                    code.field_access(Opcode::GetField, "sample/Widget", "state", "J")?;
                    code.const_long(0)?;
                    code.instruction(classfile::Instruction::Operator(Opcode::LCmp))?;
                    code.branch(Opcode::IfEq, skip)?;
                    code.const_string("busy")?;
                    code.instruction(classfile::Instruction::Stack(Opcode::Pop))?;
                    code.bind(skip)?;
                    code.return_(Opcode::Return)
                })
            })
        })
        .unwrap()
}

#[test]
fn identity_transform_with_shared_pool() {
    let classfile = Classfile::new();
    let original_bytes = sample_bytes(&classfile);
    let model = classfile.parse(&original_bytes).unwrap();
    let transformed = classfile.transform(&model, transform::identity_class()).unwrap();
    let reparsed = classfile.parse(&transformed).unwrap();
    assert_structurally_equal(&model, &reparsed, true);
}

#[test]
fn identity_transform_with_new_pool() {
    let shared = Classfile::new();
    let original_bytes = sample_bytes(&shared);
    let model = shared.parse(&original_bytes).unwrap();

    let renewing = Classfile::new().with_constant_pool_sharing(PoolSharingOption::New);
    let transformed = renewing.transform(&model, transform::identity_class()).unwrap();
    let reparsed = renewing.parse(&transformed).unwrap();
    assert_structurally_equal(&model, &reparsed, false);
}

#[test]
fn rename_transform_changes_only_the_name() {
    let classfile = Classfile::new();
    let original_bytes = sample_bytes(&classfile);
    let model = classfile.parse(&original_bytes).unwrap();
    let transformed = classfile
        .transform_renamed(&model, "sample/Gadget", transform::identity_class())
        .unwrap();
    let reparsed = classfile.parse(&transformed).unwrap();
    assert_eq!(reparsed.this_class().unwrap(), "sample/Gadget");
    assert_eq!(reparsed.methods().len(), model.methods().len());
}

#[test]
fn unknown_attributes_pass_or_drop() {
    let passing = Classfile::new();
    let bytes = passing
        .build("Oddball", |class| {
            class.with_attribute(Attribute::Unknown {
                name: "org.example.Marker".to_string(),
                bytes: vec![1, 2, 3],
            });
            Ok(())
        })
        .unwrap();

    let model = passing.parse(&bytes).unwrap();
    assert!(model
        .attributes()
        .unwrap()
        .iter()
        .any(|a| matches!(a, Attribute::Unknown { name, bytes } if name == "org.example.Marker" && bytes == &[1, 2, 3])));

    let dropping = Classfile::new().with_unknown_attributes(UnknownAttributesOption::Drop);
    let model = dropping.parse(&bytes).unwrap();
    assert!(model.attributes().unwrap().is_empty());
}

#[test]
fn bootstrap_methods_translate_across_pools() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Indy", |class| {
            let pool = class.constant_pool();
            let handle_member = pool
                .method_ref(
                    "java/lang/invoke/LambdaMetafactory",
                    "metafactory",
                    "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;",
                )
                .unwrap();
            let handle = pool
                .method_handle(classfile::HandleKind::InvokeStatic, handle_member)
                .unwrap();
            let method = pool.index_of(handle);
            class.with_attribute(Attribute::BootstrapMethods(vec![
                classfile::BootstrapMethod { method, arguments: vec![] },
            ]));
            Ok(())
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();

    // Re-interning through a fresh pool keeps the handle resolvable
    let renewing = Classfile::new().with_constant_pool_sharing(PoolSharingOption::New);
    let transformed = renewing.transform(&model, transform::identity_class()).unwrap();
    let reparsed = renewing.parse(&transformed).unwrap();
    let attributes = reparsed.attributes().unwrap();
    let Some(Attribute::BootstrapMethods(methods)) = attributes
        .iter()
        .find(|a| matches!(a, Attribute::BootstrapMethods(_)))
    else {
        panic!("BootstrapMethods lost in transform");
    };
    assert_eq!(methods.len(), 1);
}
