//! Branch sizing, dead-code patching, and stack map generation, observed
//! through the public facade.

use classfile::{
    Classfile, CodeElement, DeadCodeOption, Instruction, MethodAccessFlags, Opcode, PoolRead,
    ShortJumpsOption, StackMapsOption,
};

fn build_forward_jump(classfile: &Classfile, nops: usize) -> classfile::Result<Vec<u8>> {
    classfile.build("Jumpy", |class| {
        class.with_method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "far",
            "()V",
            |method| {
                method.with_code(|code| {
                    let target = code.new_label();
                    code.goto(target)?;
                    for _ in 0..nops {
                        code.nop()?;
                    }
                    code.bind(target)?;
                    code.return_(Opcode::Return)
                })
            },
        )
    })
}

#[test]
fn forward_branch_widens_to_goto_w() {
    // Keep the filler reachable-agnostic: dead-code patching replaces the
    // nops' last byte with athrow but does not change sizes
    let classfile = Classfile::new();
    let bytes = build_forward_jump(&classfile, 40_000).unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    let code_bytes = code.code_bytes();

    // goto_w (5 bytes) + 40000 filler + return: widening grew the code by 2
    assert_eq!(code_bytes.len(), 40_006);
    assert_eq!(code_bytes[0], 0xC8);
    let operand =
        i32::from_be_bytes([code_bytes[1], code_bytes[2], code_bytes[3], code_bytes[4]]);
    assert_eq!(operand, 40_005);

    // Decoded, the branch resolves to the bound label's bci
    for element in code.elements().unwrap() {
        if let CodeElement::Instruction(Instruction::Branch { op, target }) = element {
            assert_eq!(*op, Opcode::GotoW);
            assert_eq!(code.label_bci(*target).unwrap(), 40_005);
        }
    }
}

#[test]
fn short_branch_stays_short() {
    let classfile = Classfile::new();
    let bytes = build_forward_jump(&classfile, 3).unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    assert_eq!(code.code_bytes()[0], 0xA7);
    assert_eq!(code.code_bytes().len(), 7);
}

#[test]
fn fail_on_short_jumps_reports() {
    let classfile = Classfile::new().with_short_jumps(ShortJumpsOption::Fail);
    let result = build_forward_jump(&classfile, 40_000);
    assert!(matches!(result, Err(classfile::Error::InvalidCode(_))));
}

#[test]
fn oversized_conditional_inverts_over_goto_w() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Condy", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "far",
                "(I)V",
                |method| {
                    method.with_code(|code| {
                        let target = code.new_label();
                        code.load(Opcode::ILoad, 0)?;
                        code.branch(Opcode::IfEq, target)?;
                        for _ in 0..40_000 {
                            code.nop()?;
                        }
                        code.bind(target)?;
                        code.return_(Opcode::Return)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    let code_bytes = code.code_bytes();
    // iload_0, then ifne +8 skipping a goto_w to the far target
    assert_eq!(code_bytes[0], 0x1A);
    assert_eq!(code_bytes[1], 0x9A); // ifne, the inverted condition
    assert_eq!(i16::from_be_bytes([code_bytes[2], code_bytes[3]]), 8);
    assert_eq!(code_bytes[4], 0xC8);
    let operand =
        i32::from_be_bytes([code_bytes[5], code_bytes[6], code_bytes[7], code_bytes[8]]);
    // goto_w sits at bci 4; the target is one past the 40000-byte filler
    assert_eq!(operand as u32 + 4, 40_009);
}

#[test]
fn dead_code_is_patched_to_nop_athrow() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Deadly", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "dead",
                "()V",
                |method| {
                    method.with_code(|code| {
                        let orphan = code.new_label();
                        code.return_(Opcode::Return)?;
                        code.bind(orphan)?;
                        code.const_int(0)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    // return; then the dead iconst_0/ireturn range becomes nop athrow
    assert_eq!(code.code_bytes(), &[0xB1, 0x00, 0xBF]);

    // The frame at the dead label shows Throwable on the stack
    let frames = code.stack_map_table_bytes().unwrap().expect("frames present");
    assert_eq!(u16::from_be_bytes([frames[0], frames[1]]), 1);
    assert_eq!(frames[2], 64 + 1); // SAME_LOCALS_1_STACK_ITEM at bci 1
    assert_eq!(frames[3], 7); // ITEM_Object
    let class_index = u16::from_be_bytes([frames[4], frames[5]]);
    assert_eq!(model.pool().class_name(class_index).unwrap(), "java/lang/Throwable");
}

#[test]
fn keep_dead_code_emits_as_is() {
    let classfile = Classfile::new().with_dead_code(DeadCodeOption::Keep);
    let bytes = classfile
        .build("Kept", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "dead",
                "()V",
                |method| {
                    method.with_code(|code| {
                        code.return_(Opcode::Return)?;
                        code.const_int(0)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    assert_eq!(code.code_bytes(), &[0xB1, 0x03, 0xAC]);
}

#[test]
fn fail_on_dead_code_reports() {
    let classfile = Classfile::new().with_dead_code(DeadCodeOption::Fail);
    let result = classfile.build("Fatal", |class| {
        class.with_method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "dead",
            "()V",
            |method| {
                method.with_code(|code| {
                    code.return_(Opcode::Return)?;
                    code.nop()?;
                    code.return_(Opcode::Return)
                })
            },
        )
    });
    assert!(matches!(result, Err(classfile::Error::InvalidCode(_))));
}

#[test]
fn branch_merge_emits_two_frames() {
    // iload_0; ifeq L; iconst_1; goto E; L: iconst_0; E: ireturn
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Branchy", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "choose",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        let l = code.new_label();
                        let e = code.new_label();
                        code.load(Opcode::ILoad, 0)?;
                        code.branch(Opcode::IfEq, l)?;
                        code.const_int(1)?;
                        code.goto(e)?;
                        code.bind(l)?;
                        code.const_int(0)?;
                        code.bind(e)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    let frames = code.stack_map_table_bytes().unwrap().expect("two frames");
    assert_eq!(u16::from_be_bytes([frames[0], frames[1]]), 2);
    // L at bci 8: SAME; E at bci 9: SAME_LOCALS_1_STACK_ITEM with Integer
    assert_eq!(frames[2], 8);
    assert_eq!(frames[3], 64);
    assert_eq!(frames[4], 1);
}

#[test]
fn drop_stack_maps_suppresses_the_attribute() {
    let classfile = Classfile::new().with_stack_maps(StackMapsOption::Drop);
    let bytes = classfile
        .build("NoMaps", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "choose",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        let l = code.new_label();
                        code.load(Opcode::ILoad, 0)?;
                        code.branch(Opcode::IfEq, l)?;
                        code.const_int(1)?;
                        code.return_(Opcode::IReturn)?;
                        code.bind(l)?;
                        code.const_int(0)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    assert_eq!(code.stack_map_table_bytes().unwrap(), None);
    // the depth-only counter still produced sound maxes
    assert_eq!(code.max_stack(), 1);
    assert_eq!(code.max_locals(), 1);
}

#[test]
fn pre_frame_versions_use_the_counter() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Legacy", |class| {
            class.set_version(49, 0);
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "choose",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        let l = code.new_label();
                        code.load(Opcode::ILoad, 0)?;
                        code.branch(Opcode::IfEq, l)?;
                        code.const_int(1)?;
                        code.return_(Opcode::IReturn)?;
                        code.bind(l)?;
                        code.const_int(0)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    assert_eq!(code.stack_map_table_bytes().unwrap(), None);
}

#[test]
fn wide_locals_and_increment_forms() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Widey", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "spread",
                "()V",
                |method| {
                    method.with_code(|code| {
                        code.const_int(0)?;
                        code.store(Opcode::IStore, 300)?;
                        code.instruction(Instruction::Increment { slot: 300, delta: 1000 })?;
                        code.return_(Opcode::Return)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    // iconst_0; wide istore 300; wide iinc 300 by 1000; return
    assert_eq!(
        code.code_bytes(),
        &[0x03, 0xC4, 0x36, 0x01, 0x2C, 0xC4, 0x84, 0x01, 0x2C, 0x03, 0xE8, 0xB1]
    );
    assert_eq!(code.max_locals(), 301);
}

#[test]
fn tableswitch_round_trips_through_padding() {
    let classfile = Classfile::new();
    let bytes = classfile
        .build("Switchy", |class| {
            class.with_method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "pick",
                "(I)I",
                |method| {
                    method.with_code(|code| {
                        let case0 = code.new_label();
                        let default = code.new_label();
                        code.load(Opcode::ILoad, 0)?;
                        code.instruction(Instruction::TableSwitch {
                            low: 0,
                            high: 0,
                            default,
                            targets: vec![case0],
                        })?;
                        code.bind(case0)?;
                        code.const_int(7)?;
                        code.return_(Opcode::IReturn)?;
                        code.bind(default)?;
                        code.const_int(-1)?;
                        code.return_(Opcode::IReturn)
                    })
                },
            )
        })
        .unwrap();
    let model = classfile.parse(&bytes).unwrap();
    let code = model.methods()[0].code().unwrap().unwrap();
    let mut switches = 0;
    for element in code.elements().unwrap() {
        if let CodeElement::Instruction(Instruction::TableSwitch {
            low, high, default, targets,
        }) = element
        {
            switches += 1;
            assert_eq!((*low, *high), (0, 0));
            // tableswitch at bci 1: 2 pad bytes, 12 header bytes, 1 offset,
            // so the next instruction starts at bci 20
            assert_eq!(code.label_bci(targets[0]).unwrap(), 20);
            assert_eq!(code.label_bci(*default).unwrap(), 23);
        }
    }
    assert_eq!(switches, 1);
}
