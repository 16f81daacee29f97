//! The bytecode instruction model.
//!
//! One variant per opcode *family* rather than per opcode: all the loads are
//! one variant carrying the canonical opcode and a slot, so `iload_2`,
//! `iload 2` and `wide iload 2` are the same instruction and the assembler is
//! free to pick the shortest encoding when writing. Branch targets are
//! [`Label`]s, never raw bcis, so the same instruction value works both for
//! decoded code and for code under construction.

use crate::code::label::{Label, LabelContext};
use crate::code::opcode::Opcode;
use crate::bytes::ByteView;
use crate::error::{Error, Result};
use crate::pool::PoolIndex;

/// Element type operand of `newarray`, [JVMS Table 6.5.newarray-A][0].
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-6.html#jvms-6.5.newarray
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArrayType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl ArrayType {
    pub fn as_u8(self) -> u8 {
        match self {
            ArrayType::Boolean => 4,
            ArrayType::Char => 5,
            ArrayType::Float => 6,
            ArrayType::Double => 7,
            ArrayType::Byte => 8,
            ArrayType::Short => 9,
            ArrayType::Int => 10,
            ArrayType::Long => 11,
        }
    }

    pub fn from_u8(code: u8) -> Result<ArrayType> {
        Ok(match code {
            4 => ArrayType::Boolean,
            5 => ArrayType::Char,
            6 => ArrayType::Float,
            7 => ArrayType::Double,
            8 => ArrayType::Byte,
            9 => ArrayType::Short,
            10 => ArrayType::Int,
            11 => ArrayType::Long,
            other => return Err(Error::Malformed(format!("invalid newarray type {other}"))),
        })
    }
}

/// A single bytecode instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// `iaload` .. `saload`
    ArrayLoad(Opcode),
    /// `iastore` .. `sastore`
    ArrayStore(Opcode),
    /// `if*`, `goto`, `goto_w`. The opcode records what was decoded or
    /// requested; the assembler widens or narrows as the final offset needs.
    Branch { op: Opcode, target: Label },
    /// `aconst_null`, `iconst_*`, `lconst_*`, `fconst_*`, `dconst_*`
    ConstantPush(Opcode),
    /// `bipush`/`sipush` with the sign-extended immediate
    Push { op: Opcode, value: i32 },
    /// `ldc`, `ldc_w`, `ldc2_w`; the index must be loadable
    LoadConstant { op: Opcode, index: PoolIndex },
    /// `i2l` .. `i2s`
    Convert(Opcode),
    /// `getstatic`/`putstatic`/`getfield`/`putfield`
    Field { op: Opcode, field: PoolIndex },
    /// `invokevirtual`/`invokespecial`/`invokestatic`/`invokeinterface`
    Invoke { op: Opcode, method: PoolIndex },
    /// `invokedynamic`
    InvokeDynamic { indy: PoolIndex },
    /// All load forms, canonicalized: `op` is `iload`/`lload`/`fload`/
    /// `dload`/`aload` and the encoding (`_n`, short, `wide`) is chosen when
    /// writing.
    Load { op: Opcode, slot: u16 },
    /// All store forms, same canonicalization as `Load`
    Store { op: Opcode, slot: u16 },
    /// `iinc` and `wide iinc`
    Increment { slot: u16, delta: i16 },
    LookupSwitch { default: Label, pairs: Vec<(i32, Label)> },
    TableSwitch { low: i32, high: i32, default: Label, targets: Vec<Label> },
    /// `monitorenter`/`monitorexit`
    Monitor(Opcode),
    /// `new`
    NewObject { class: PoolIndex },
    /// `newarray`
    NewPrimitiveArray(ArrayType),
    /// `anewarray`
    NewReferenceArray { component: PoolIndex },
    /// `multianewarray`
    NewMultiArray { class: PoolIndex, dimensions: u8 },
    Nop,
    /// Arithmetic, shifts, logic, comparisons, `arraylength`
    Operator(Opcode),
    /// `ireturn` .. `return`
    Return(Opcode),
    /// `pop`, `pop2`, `dup*`, `swap`
    Stack(Opcode),
    /// `athrow`
    Throw,
    /// `checkcast`/`instanceof`
    TypeCheck { op: Opcode, class: PoolIndex },
    /// `jsr`/`jsr_w`; discontinued, only valid below major version 51
    Jsr { op: Opcode, target: Label },
    /// `ret` and `wide ret`; discontinued alongside `jsr`
    Ret { slot: u16 },
}

impl Instruction {
    /// Whether control continues to the following instruction.
    pub fn falls_through(&self) -> bool {
        match self {
            Instruction::Branch { op, .. } => !matches!(op, Opcode::Goto | Opcode::GotoW),
            Instruction::Return(_)
            | Instruction::Throw
            | Instruction::LookupSwitch { .. }
            | Instruction::TableSwitch { .. }
            | Instruction::Ret { .. } => false,
            _ => true,
        }
    }

    /// Branch targets, if any, in encoding order (default target first for
    /// the switches).
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Instruction::Branch { target, .. } | Instruction::Jsr { target, .. } => vec![*target],
            Instruction::LookupSwitch { default, pairs } => {
                let mut targets = vec![*default];
                targets.extend(pairs.iter().map(|(_, label)| *label));
                targets
            }
            Instruction::TableSwitch { default, targets: table, .. } => {
                let mut targets = vec![*default];
                targets.extend_from_slice(table);
                targets
            }
            _ => vec![],
        }
    }
}

fn load_opcode_for(base: Opcode) -> Opcode {
    // Map any `*load_n` to its canonical form; base forms map to themselves
    let byte = base as u8;
    match byte {
        0x15..=0x19 => base,
        0x1A..=0x2D => Opcode::from_u8(0x15 + (byte - 0x1A) / 4).unwrap(),
        _ => unreachable!("not a load opcode"),
    }
}

fn store_opcode_for(base: Opcode) -> Opcode {
    let byte = base as u8;
    match byte {
        0x36..=0x3A => base,
        0x3B..=0x4E => Opcode::from_u8(0x36 + (byte - 0x3B) / 4).unwrap(),
        _ => unreachable!("not a store opcode"),
    }
}

/// Decode the instruction starting at `bci` within `code` (a view over the
/// code array only, so offsets and bcis coincide). Returns the instruction
/// and its encoded size in bytes. Branch targets become labels in `labels`,
/// shared across all references to the same target bci.
pub fn decode(
    code: &ByteView<'_>,
    bci: usize,
    pool_owner: u32,
    labels: &mut LabelContext,
) -> Result<(Instruction, usize)> {
    let byte = code.u1(bci)?;
    let op = Opcode::from_u8(byte)
        .ok_or_else(|| Error::Malformed(format!("unknown opcode 0x{byte:02X} at bci {bci}")))?;

    let branch_target = |labels: &mut LabelContext, delta: i64| -> Result<Label> {
        let target = bci as i64 + delta;
        if target < 0 || target as usize >= code.len() {
            return Err(Error::Malformed(format!(
                "branch at bci {bci} targets out-of-range bci {target}"
            )));
        }
        Ok(labels.label_at_bci(target as u32))
    };
    let pool_index = |index: u16| PoolIndex { owner: pool_owner, index };

    let decoded = match op {
        Opcode::Nop => (Instruction::Nop, 1),
        Opcode::AConstNull
        | Opcode::IConstM1
        | Opcode::IConst0
        | Opcode::IConst1
        | Opcode::IConst2
        | Opcode::IConst3
        | Opcode::IConst4
        | Opcode::IConst5
        | Opcode::LConst0
        | Opcode::LConst1
        | Opcode::FConst0
        | Opcode::FConst1
        | Opcode::FConst2
        | Opcode::DConst0
        | Opcode::DConst1 => (Instruction::ConstantPush(op), 1),
        Opcode::Bipush => (Instruction::Push { op, value: code.s1(bci + 1)? as i32 }, 2),
        Opcode::Sipush => (Instruction::Push { op, value: code.s2(bci + 1)? as i32 }, 3),
        Opcode::Ldc => (
            Instruction::LoadConstant { op, index: pool_index(code.u1(bci + 1)? as u16) },
            2,
        ),
        Opcode::LdcW | Opcode::Ldc2W => (
            Instruction::LoadConstant { op, index: pool_index(code.u2(bci + 1)?) },
            3,
        ),
        Opcode::ILoad | Opcode::LLoad | Opcode::FLoad | Opcode::DLoad | Opcode::ALoad => {
            (Instruction::Load { op, slot: code.u1(bci + 1)? as u16 }, 2)
        }
        op if (0x1A..=0x2D).contains(&(op as u8)) => {
            let slot = ((op as u8) - 0x1A) % 4;
            (Instruction::Load { op: load_opcode_for(op), slot: slot as u16 }, 1)
        }
        op if (0x2E..=0x35).contains(&(op as u8)) => (Instruction::ArrayLoad(op), 1),
        Opcode::IStore | Opcode::LStore | Opcode::FStore | Opcode::DStore | Opcode::AStore => {
            (Instruction::Store { op, slot: code.u1(bci + 1)? as u16 }, 2)
        }
        op if (0x3B..=0x4E).contains(&(op as u8)) => {
            let slot = ((op as u8) - 0x3B) % 4;
            (Instruction::Store { op: store_opcode_for(op), slot: slot as u16 }, 1)
        }
        op if (0x4F..=0x56).contains(&(op as u8)) => (Instruction::ArrayStore(op), 1),
        op if (0x57..=0x5F).contains(&(op as u8)) => (Instruction::Stack(op), 1),
        op if (0x60..=0x83).contains(&(op as u8)) => (Instruction::Operator(op), 1),
        Opcode::IInc => (
            Instruction::Increment {
                slot: code.u1(bci + 1)? as u16,
                delta: code.s1(bci + 2)? as i16,
            },
            3,
        ),
        op if (0x85..=0x93).contains(&(op as u8)) => (Instruction::Convert(op), 1),
        op if (0x94..=0x98).contains(&(op as u8)) => (Instruction::Operator(op), 1),
        op if op.is_conditional_branch() => {
            let target = branch_target(labels, code.s2(bci + 1)? as i64)?;
            (Instruction::Branch { op, target }, 3)
        }
        Opcode::Goto => {
            let target = branch_target(labels, code.s2(bci + 1)? as i64)?;
            (Instruction::Branch { op, target }, 3)
        }
        Opcode::GotoW => {
            let target = branch_target(labels, code.s4(bci + 1)? as i64)?;
            (Instruction::Branch { op, target }, 5)
        }
        Opcode::Jsr => {
            let target = branch_target(labels, code.s2(bci + 1)? as i64)?;
            (Instruction::Jsr { op, target }, 3)
        }
        Opcode::JsrW => {
            let target = branch_target(labels, code.s4(bci + 1)? as i64)?;
            (Instruction::Jsr { op, target }, 5)
        }
        Opcode::Ret => (Instruction::Ret { slot: code.u1(bci + 1)? as u16 }, 2),
        Opcode::TableSwitch => {
            let pad = (4 - (bci + 1) % 4) % 4;
            let mut at = bci + 1 + pad;
            let default = branch_target(labels, code.s4(at)? as i64)?;
            let low = code.s4(at + 4)?;
            let high = code.s4(at + 8)?;
            if high < low {
                return Err(Error::Malformed(format!(
                    "tableswitch at bci {bci} has high {high} < low {low}"
                )));
            }
            at += 12;
            let count = (high as i64 - low as i64 + 1) as usize;
            if count > (code.len() - at.min(code.len())) / 4 {
                return Err(Error::Malformed(format!(
                    "tableswitch at bci {bci} declares more targets than the code array holds"
                )));
            }
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(branch_target(labels, code.s4(at)? as i64)?);
                at += 4;
            }
            (Instruction::TableSwitch { low, high, default, targets }, at - bci)
        }
        Opcode::LookupSwitch => {
            let pad = (4 - (bci + 1) % 4) % 4;
            let mut at = bci + 1 + pad;
            let default = branch_target(labels, code.s4(at)? as i64)?;
            let count = code.s4(at + 4)?;
            if count < 0 {
                return Err(Error::Malformed(format!(
                    "lookupswitch at bci {bci} has negative pair count"
                )));
            }
            at += 8;
            if count as usize > (code.len() - at.min(code.len())) / 8 {
                return Err(Error::Malformed(format!(
                    "lookupswitch at bci {bci} declares more pairs than the code array holds"
                )));
            }
            let mut pairs = Vec::with_capacity(count as usize);
            let mut previous_key: Option<i32> = None;
            for _ in 0..count {
                let key = code.s4(at)?;
                if previous_key.is_some_and(|p| p >= key) {
                    return Err(Error::Malformed(format!(
                        "lookupswitch at bci {bci} has unsorted match keys"
                    )));
                }
                previous_key = Some(key);
                pairs.push((key, branch_target(labels, code.s4(at + 4)? as i64)?));
                at += 8;
            }
            (Instruction::LookupSwitch { default, pairs }, at - bci)
        }
        op if (0xAC..=0xB1).contains(&(op as u8)) => (Instruction::Return(op), 1),
        Opcode::GetStatic | Opcode::PutStatic | Opcode::GetField | Opcode::PutField => {
            (Instruction::Field { op, field: pool_index(code.u2(bci + 1)?) }, 3)
        }
        Opcode::InvokeVirtual | Opcode::InvokeSpecial | Opcode::InvokeStatic => {
            (Instruction::Invoke { op, method: pool_index(code.u2(bci + 1)?) }, 3)
        }
        Opcode::InvokeInterface => {
            // count and zero operands are recomputed on write
            (Instruction::Invoke { op, method: pool_index(code.u2(bci + 1)?) }, 5)
        }
        Opcode::InvokeDynamic => {
            (Instruction::InvokeDynamic { indy: pool_index(code.u2(bci + 1)?) }, 5)
        }
        Opcode::New => (Instruction::NewObject { class: pool_index(code.u2(bci + 1)?) }, 3),
        Opcode::NewArray => {
            (Instruction::NewPrimitiveArray(ArrayType::from_u8(code.u1(bci + 1)?)?), 2)
        }
        Opcode::ANewArray => {
            (Instruction::NewReferenceArray { component: pool_index(code.u2(bci + 1)?) }, 3)
        }
        Opcode::ArrayLength => (Instruction::Operator(op), 1),
        Opcode::AThrow => (Instruction::Throw, 1),
        Opcode::CheckCast | Opcode::InstanceOf => {
            (Instruction::TypeCheck { op, class: pool_index(code.u2(bci + 1)?) }, 3)
        }
        Opcode::MonitorEnter | Opcode::MonitorExit => (Instruction::Monitor(op), 1),
        Opcode::Wide => {
            let modified = code.u1(bci + 1)?;
            let wide_op = Opcode::from_u8(modified).ok_or_else(|| {
                Error::Malformed(format!("unknown wide opcode 0x{modified:02X} at bci {bci}"))
            })?;
            match wide_op {
                Opcode::ILoad
                | Opcode::LLoad
                | Opcode::FLoad
                | Opcode::DLoad
                | Opcode::ALoad => {
                    (Instruction::Load { op: wide_op, slot: code.u2(bci + 2)? }, 4)
                }
                Opcode::IStore
                | Opcode::LStore
                | Opcode::FStore
                | Opcode::DStore
                | Opcode::AStore => {
                    (Instruction::Store { op: wide_op, slot: code.u2(bci + 2)? }, 4)
                }
                Opcode::Ret => (Instruction::Ret { slot: code.u2(bci + 2)? }, 4),
                Opcode::IInc => (
                    Instruction::Increment { slot: code.u2(bci + 2)?, delta: code.s2(bci + 4)? },
                    6,
                ),
                other => {
                    return Err(Error::Malformed(format!(
                        "wide prefix does not apply to {}",
                        other.mnemonic()
                    )))
                }
            }
        }
        Opcode::MultiANewArray => (
            Instruction::NewMultiArray {
                class: pool_index(code.u2(bci + 1)?),
                dimensions: code.u1(bci + 3)?,
            },
            4,
        ),
        other => {
            return Err(Error::Malformed(format!(
                "unexpected opcode {} at bci {bci}",
                other.mnemonic()
            )))
        }
    };
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> (Instruction, usize) {
        let view = ByteView::new(bytes);
        let mut labels = LabelContext::new();
        decode(&view, 0, 1, &mut labels).unwrap()
    }

    #[test]
    fn short_form_loads_canonicalize() {
        let (insn, size) = decode_one(&[0x1C]); // iload_2
        assert_eq!(insn, Instruction::Load { op: Opcode::ILoad, slot: 2 });
        assert_eq!(size, 1);
        let (insn, size) = decode_one(&[0x19, 0x10]); // aload 16
        assert_eq!(insn, Instruction::Load { op: Opcode::ALoad, slot: 16 });
        assert_eq!(size, 2);
    }

    #[test]
    fn wide_prefix_folds_into_the_instruction() {
        let (insn, size) = decode_one(&[0xC4, 0x15, 0x01, 0x00]); // wide iload 256
        assert_eq!(insn, Instruction::Load { op: Opcode::ILoad, slot: 256 });
        assert_eq!(size, 4);
        let (insn, size) = decode_one(&[0xC4, 0x84, 0x01, 0x00, 0x7F, 0xFF]);
        assert_eq!(insn, Instruction::Increment { slot: 256, delta: 0x7FFF });
        assert_eq!(size, 6);
    }

    #[test]
    fn branches_share_labels_per_target() {
        // two gotos to the same bci 6, then nops
        let bytes = [0xA7, 0x00, 0x06, 0xA7, 0x00, 0x03, 0x00];
        let view = ByteView::new(&bytes);
        let mut labels = LabelContext::new();
        let (first, size) = decode(&view, 0, 1, &mut labels).unwrap();
        assert_eq!(size, 3);
        let (second, _) = decode(&view, 3, 1, &mut labels).unwrap();
        let (Instruction::Branch { target: a, .. }, Instruction::Branch { target: b, .. }) =
            (first, second)
        else {
            panic!("expected branches");
        };
        assert_eq!(a, b);
        assert_eq!(labels.bci(a).unwrap(), 6);
    }

    #[test]
    fn tableswitch_padding_depends_on_bci() {
        // nop; tableswitch at bci 1 => padding 2, default +16, low 0, high 0,
        // one offset
        let mut bytes = vec![0x00, 0xAA, 0x00, 0x00];
        bytes.extend_from_slice(&16i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&16i32.to_be_bytes());
        bytes.push(0x00);
        let view = ByteView::new(&bytes);
        let mut labels = LabelContext::new();
        let (insn, size) = decode(&view, 1, 1, &mut labels).unwrap();
        assert_eq!(size, 19);
        let Instruction::TableSwitch { low: 0, high: 0, default, targets } = insn else {
            panic!("expected tableswitch, got {insn:?}");
        };
        assert_eq!(labels.bci(default).unwrap(), 17);
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let view = ByteView::new(&[0xCB]);
        let mut labels = LabelContext::new();
        assert!(matches!(decode(&view, 0, 1, &mut labels), Err(Error::Malformed(_))));
    }
}
