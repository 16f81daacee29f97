//! The JVM opcode table.
//!
//! One variant per opcode byte, [JVMS §6.5][0]. The `wide` prefix (0xC4) is
//! listed here because it appears in code arrays, but the instruction model
//! folds it into the load/store/iinc/ret instructions it modifies.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-6.html

macro_rules! opcodes {
    ($(($value:literal, $name:ident, $mnemonic:literal),)*) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $($value => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    (0x00, Nop, "nop"),
    (0x01, AConstNull, "aconst_null"),
    (0x02, IConstM1, "iconst_m1"),
    (0x03, IConst0, "iconst_0"),
    (0x04, IConst1, "iconst_1"),
    (0x05, IConst2, "iconst_2"),
    (0x06, IConst3, "iconst_3"),
    (0x07, IConst4, "iconst_4"),
    (0x08, IConst5, "iconst_5"),
    (0x09, LConst0, "lconst_0"),
    (0x0A, LConst1, "lconst_1"),
    (0x0B, FConst0, "fconst_0"),
    (0x0C, FConst1, "fconst_1"),
    (0x0D, FConst2, "fconst_2"),
    (0x0E, DConst0, "dconst_0"),
    (0x0F, DConst1, "dconst_1"),
    (0x10, Bipush, "bipush"),
    (0x11, Sipush, "sipush"),
    (0x12, Ldc, "ldc"),
    (0x13, LdcW, "ldc_w"),
    (0x14, Ldc2W, "ldc2_w"),
    (0x15, ILoad, "iload"),
    (0x16, LLoad, "lload"),
    (0x17, FLoad, "fload"),
    (0x18, DLoad, "dload"),
    (0x19, ALoad, "aload"),
    (0x1A, ILoad0, "iload_0"),
    (0x1B, ILoad1, "iload_1"),
    (0x1C, ILoad2, "iload_2"),
    (0x1D, ILoad3, "iload_3"),
    (0x1E, LLoad0, "lload_0"),
    (0x1F, LLoad1, "lload_1"),
    (0x20, LLoad2, "lload_2"),
    (0x21, LLoad3, "lload_3"),
    (0x22, FLoad0, "fload_0"),
    (0x23, FLoad1, "fload_1"),
    (0x24, FLoad2, "fload_2"),
    (0x25, FLoad3, "fload_3"),
    (0x26, DLoad0, "dload_0"),
    (0x27, DLoad1, "dload_1"),
    (0x28, DLoad2, "dload_2"),
    (0x29, DLoad3, "dload_3"),
    (0x2A, ALoad0, "aload_0"),
    (0x2B, ALoad1, "aload_1"),
    (0x2C, ALoad2, "aload_2"),
    (0x2D, ALoad3, "aload_3"),
    (0x2E, IALoad, "iaload"),
    (0x2F, LALoad, "laload"),
    (0x30, FALoad, "faload"),
    (0x31, DALoad, "daload"),
    (0x32, AALoad, "aaload"),
    (0x33, BALoad, "baload"),
    (0x34, CALoad, "caload"),
    (0x35, SALoad, "saload"),
    (0x36, IStore, "istore"),
    (0x37, LStore, "lstore"),
    (0x38, FStore, "fstore"),
    (0x39, DStore, "dstore"),
    (0x3A, AStore, "astore"),
    (0x3B, IStore0, "istore_0"),
    (0x3C, IStore1, "istore_1"),
    (0x3D, IStore2, "istore_2"),
    (0x3E, IStore3, "istore_3"),
    (0x3F, LStore0, "lstore_0"),
    (0x40, LStore1, "lstore_1"),
    (0x41, LStore2, "lstore_2"),
    (0x42, LStore3, "lstore_3"),
    (0x43, FStore0, "fstore_0"),
    (0x44, FStore1, "fstore_1"),
    (0x45, FStore2, "fstore_2"),
    (0x46, FStore3, "fstore_3"),
    (0x47, DStore0, "dstore_0"),
    (0x48, DStore1, "dstore_1"),
    (0x49, DStore2, "dstore_2"),
    (0x4A, DStore3, "dstore_3"),
    (0x4B, AStore0, "astore_0"),
    (0x4C, AStore1, "astore_1"),
    (0x4D, AStore2, "astore_2"),
    (0x4E, AStore3, "astore_3"),
    (0x4F, IAStore, "iastore"),
    (0x50, LAStore, "lastore"),
    (0x51, FAStore, "fastore"),
    (0x52, DAStore, "dastore"),
    (0x53, AAStore, "aastore"),
    (0x54, BAStore, "bastore"),
    (0x55, CAStore, "castore"),
    (0x56, SAStore, "sastore"),
    (0x57, Pop, "pop"),
    (0x58, Pop2, "pop2"),
    (0x59, Dup, "dup"),
    (0x5A, DupX1, "dup_x1"),
    (0x5B, DupX2, "dup_x2"),
    (0x5C, Dup2, "dup2"),
    (0x5D, Dup2X1, "dup2_x1"),
    (0x5E, Dup2X2, "dup2_x2"),
    (0x5F, Swap, "swap"),
    (0x60, IAdd, "iadd"),
    (0x61, LAdd, "ladd"),
    (0x62, FAdd, "fadd"),
    (0x63, DAdd, "dadd"),
    (0x64, ISub, "isub"),
    (0x65, LSub, "lsub"),
    (0x66, FSub, "fsub"),
    (0x67, DSub, "dsub"),
    (0x68, IMul, "imul"),
    (0x69, LMul, "lmul"),
    (0x6A, FMul, "fmul"),
    (0x6B, DMul, "dmul"),
    (0x6C, IDiv, "idiv"),
    (0x6D, LDiv, "ldiv"),
    (0x6E, FDiv, "fdiv"),
    (0x6F, DDiv, "ddiv"),
    (0x70, IRem, "irem"),
    (0x71, LRem, "lrem"),
    (0x72, FRem, "frem"),
    (0x73, DRem, "drem"),
    (0x74, INeg, "ineg"),
    (0x75, LNeg, "lneg"),
    (0x76, FNeg, "fneg"),
    (0x77, DNeg, "dneg"),
    (0x78, IShl, "ishl"),
    (0x79, LShl, "lshl"),
    (0x7A, IShr, "ishr"),
    (0x7B, LShr, "lshr"),
    (0x7C, IUShr, "iushr"),
    (0x7D, LUShr, "lushr"),
    (0x7E, IAnd, "iand"),
    (0x7F, LAnd, "land"),
    (0x80, IOr, "ior"),
    (0x81, LOr, "lor"),
    (0x82, IXor, "ixor"),
    (0x83, LXor, "lxor"),
    (0x84, IInc, "iinc"),
    (0x85, I2L, "i2l"),
    (0x86, I2F, "i2f"),
    (0x87, I2D, "i2d"),
    (0x88, L2I, "l2i"),
    (0x89, L2F, "l2f"),
    (0x8A, L2D, "l2d"),
    (0x8B, F2I, "f2i"),
    (0x8C, F2L, "f2l"),
    (0x8D, F2D, "f2d"),
    (0x8E, D2I, "d2i"),
    (0x8F, D2L, "d2l"),
    (0x90, D2F, "d2f"),
    (0x91, I2B, "i2b"),
    (0x92, I2C, "i2c"),
    (0x93, I2S, "i2s"),
    (0x94, LCmp, "lcmp"),
    (0x95, FCmpL, "fcmpl"),
    (0x96, FCmpG, "fcmpg"),
    (0x97, DCmpL, "dcmpl"),
    (0x98, DCmpG, "dcmpg"),
    (0x99, IfEq, "ifeq"),
    (0x9A, IfNe, "ifne"),
    (0x9B, IfLt, "iflt"),
    (0x9C, IfGe, "ifge"),
    (0x9D, IfGt, "ifgt"),
    (0x9E, IfLe, "ifle"),
    (0x9F, IfICmpEq, "if_icmpeq"),
    (0xA0, IfICmpNe, "if_icmpne"),
    (0xA1, IfICmpLt, "if_icmplt"),
    (0xA2, IfICmpGe, "if_icmpge"),
    (0xA3, IfICmpGt, "if_icmpgt"),
    (0xA4, IfICmpLe, "if_icmple"),
    (0xA5, IfACmpEq, "if_acmpeq"),
    (0xA6, IfACmpNe, "if_acmpne"),
    (0xA7, Goto, "goto"),
    (0xA8, Jsr, "jsr"),
    (0xA9, Ret, "ret"),
    (0xAA, TableSwitch, "tableswitch"),
    (0xAB, LookupSwitch, "lookupswitch"),
    (0xAC, IReturn, "ireturn"),
    (0xAD, LReturn, "lreturn"),
    (0xAE, FReturn, "freturn"),
    (0xAF, DReturn, "dreturn"),
    (0xB0, AReturn, "areturn"),
    (0xB1, Return, "return"),
    (0xB2, GetStatic, "getstatic"),
    (0xB3, PutStatic, "putstatic"),
    (0xB4, GetField, "getfield"),
    (0xB5, PutField, "putfield"),
    (0xB6, InvokeVirtual, "invokevirtual"),
    (0xB7, InvokeSpecial, "invokespecial"),
    (0xB8, InvokeStatic, "invokestatic"),
    (0xB9, InvokeInterface, "invokeinterface"),
    (0xBA, InvokeDynamic, "invokedynamic"),
    (0xBB, New, "new"),
    (0xBC, NewArray, "newarray"),
    (0xBD, ANewArray, "anewarray"),
    (0xBE, ArrayLength, "arraylength"),
    (0xBF, AThrow, "athrow"),
    (0xC0, CheckCast, "checkcast"),
    (0xC1, InstanceOf, "instanceof"),
    (0xC2, MonitorEnter, "monitorenter"),
    (0xC3, MonitorExit, "monitorexit"),
    (0xC4, Wide, "wide"),
    (0xC5, MultiANewArray, "multianewarray"),
    (0xC6, IfNull, "ifnull"),
    (0xC7, IfNonNull, "ifnonnull"),
    (0xC8, GotoW, "goto_w"),
    (0xC9, JsrW, "jsr_w"),
}

impl Opcode {
    /// Conditional branches: the `if*` family with a 16-bit offset.
    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Opcode::IfEq
                | Opcode::IfNe
                | Opcode::IfLt
                | Opcode::IfGe
                | Opcode::IfGt
                | Opcode::IfLe
                | Opcode::IfICmpEq
                | Opcode::IfICmpNe
                | Opcode::IfICmpLt
                | Opcode::IfICmpGe
                | Opcode::IfICmpGt
                | Opcode::IfICmpLe
                | Opcode::IfACmpEq
                | Opcode::IfACmpNe
                | Opcode::IfNull
                | Opcode::IfNonNull
        )
    }

    /// The branch with the opposite condition, used when an oversized
    /// conditional is rewritten to skip over a `goto_w`.
    pub fn inverted_condition(self) -> Option<Opcode> {
        Some(match self {
            Opcode::IfEq => Opcode::IfNe,
            Opcode::IfNe => Opcode::IfEq,
            Opcode::IfLt => Opcode::IfGe,
            Opcode::IfGe => Opcode::IfLt,
            Opcode::IfGt => Opcode::IfLe,
            Opcode::IfLe => Opcode::IfGt,
            Opcode::IfICmpEq => Opcode::IfICmpNe,
            Opcode::IfICmpNe => Opcode::IfICmpEq,
            Opcode::IfICmpLt => Opcode::IfICmpGe,
            Opcode::IfICmpGe => Opcode::IfICmpLt,
            Opcode::IfICmpGt => Opcode::IfICmpLe,
            Opcode::IfICmpLe => Opcode::IfICmpGt,
            Opcode::IfACmpEq => Opcode::IfACmpNe,
            Opcode::IfACmpNe => Opcode::IfACmpEq,
            Opcode::IfNull => Opcode::IfNonNull,
            Opcode::IfNonNull => Opcode::IfNull,
            _ => return None,
        })
    }

    /// Opcodes after which control never falls through: returns, `athrow`,
    /// `goto`/`goto_w`, `ret`, and both switches.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::IReturn
                | Opcode::LReturn
                | Opcode::FReturn
                | Opcode::DReturn
                | Opcode::AReturn
                | Opcode::Return
                | Opcode::AThrow
                | Opcode::Goto
                | Opcode::GotoW
                | Opcode::Ret
                | Opcode::TableSwitch
                | Opcode::LookupSwitch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_byte_values() {
        assert_eq!(Opcode::from_u8(0x00), Some(Opcode::Nop));
        assert_eq!(Opcode::from_u8(0xA7), Some(Opcode::Goto));
        assert_eq!(Opcode::from_u8(0xC9), Some(Opcode::JsrW));
        assert_eq!(Opcode::from_u8(0xCA), None);
        assert_eq!(Opcode::Goto as u8, 0xA7);
    }

    #[test]
    fn inversion_is_an_involution() {
        for byte in 0x99..=0xA6u8 {
            let op = Opcode::from_u8(byte).unwrap();
            let inverted = op.inverted_condition().unwrap();
            assert_eq!(inverted.inverted_condition(), Some(op));
        }
        assert_eq!(Opcode::Goto.inverted_condition(), None);
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::InvokeDynamic.mnemonic(), "invokedynamic");
        assert_eq!(Opcode::IfICmpLe.mnemonic(), "if_icmple");
    }
}
