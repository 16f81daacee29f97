//! Depth-only analysis for `max_stack`/`max_locals` when no stack map table
//! is being generated (pre-50 class files, `DROP_STACK_MAPS`, or code kept
//! with `jsr`/`ret`).
//!
//! A forward worklist walk over the assembled bytes tracking only the
//! operand-stack depth in slots and the highest local slot touched. Each bci
//! is visited once with the first depth that reaches it; that is enough for a
//! sound maximum because depths at a join can only disagree in code the
//! verifier would reject anyway.

use crate::code::instruction::{self, Instruction};
use crate::code::label::LabelContext;
use crate::code::opcode::Opcode;
use crate::code::MethodContext;
use crate::bytes::ByteView;
use crate::descriptor::MethodDescriptor;
use crate::error::{Error, Result};
use crate::pool::PoolRead;
use rustc_hash::FxHashMap;

/// Stack slots pushed minus popped, and the highest local slot touched (plus
/// one), for one instruction.
fn effect(insn: &Instruction, pool: &dyn PoolRead) -> Result<(i32, u32)> {
    let member_slots = |index: crate::pool::PoolIndex| -> Result<(i32, i32)> {
        let (_, _, descriptor) = pool.member_ref(index.index())?;
        let descriptor = MethodDescriptor::parse(descriptor)?;
        let returned = match &descriptor.return_type {
            None => 0,
            Some(t) => t.slot_width() as i32,
        };
        Ok((descriptor.parameter_slots() as i32, returned))
    };
    let field_width = |index: crate::pool::PoolIndex| -> Result<i32> {
        let (_, _, descriptor) = pool.member_ref(index.index())?;
        Ok(crate::descriptor::FieldType::parse(descriptor)?.slot_width() as i32)
    };

    Ok(match insn {
        Instruction::Nop => (0, 0),
        Instruction::ConstantPush(op) => match op {
            Opcode::LConst0 | Opcode::LConst1 | Opcode::DConst0 | Opcode::DConst1 => (2, 0),
            _ => (1, 0),
        },
        Instruction::Push { .. } => (1, 0),
        Instruction::LoadConstant { index, .. } => {
            (pool.entry(index.index())?.width() as i32, 0)
        }
        Instruction::Load { op, slot } => {
            let width = match op {
                Opcode::LLoad | Opcode::DLoad => 2,
                _ => 1,
            };
            (width, *slot as u32 + width as u32)
        }
        Instruction::Store { op, slot } => {
            let width = match op {
                Opcode::LStore | Opcode::DStore => 2,
                _ => 1,
            };
            (-width, *slot as u32 + width as u32)
        }
        Instruction::ArrayLoad(op) => match op {
            Opcode::LALoad | Opcode::DALoad => (0, 0), // pops 2, pushes 2
            _ => (-1, 0),
        },
        Instruction::ArrayStore(op) => match op {
            Opcode::LAStore | Opcode::DAStore => (-4, 0),
            _ => (-3, 0),
        },
        Instruction::Stack(op) => match op {
            Opcode::Pop => (-1, 0),
            Opcode::Pop2 => (-2, 0),
            Opcode::Dup | Opcode::DupX1 | Opcode::DupX2 => (1, 0),
            Opcode::Dup2 | Opcode::Dup2X1 | Opcode::Dup2X2 => (2, 0),
            Opcode::Swap => (0, 0),
            other => {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a stack instruction",
                    other.mnemonic()
                )))
            }
        },
        Instruction::Operator(op) => match op {
            // binary int/float: pop 2 push 1
            Opcode::IAdd | Opcode::ISub | Opcode::IMul | Opcode::IDiv | Opcode::IRem
            | Opcode::IAnd | Opcode::IOr | Opcode::IXor | Opcode::IShl | Opcode::IShr
            | Opcode::IUShr | Opcode::FAdd | Opcode::FSub | Opcode::FMul | Opcode::FDiv
            | Opcode::FRem => (-1, 0),
            // binary long/double: pop 4 push 2
            Opcode::LAdd | Opcode::LSub | Opcode::LMul | Opcode::LDiv | Opcode::LRem
            | Opcode::LAnd | Opcode::LOr | Opcode::LXor => (-2, 0),
            Opcode::DAdd | Opcode::DSub | Opcode::DMul | Opcode::DDiv | Opcode::DRem => (-2, 0),
            // long shifts pop long + int
            Opcode::LShl | Opcode::LShr | Opcode::LUShr => (-1, 0),
            Opcode::INeg | Opcode::FNeg | Opcode::LNeg | Opcode::DNeg => (0, 0),
            Opcode::LCmp | Opcode::DCmpL | Opcode::DCmpG => (-3, 0),
            Opcode::FCmpL | Opcode::FCmpG => (-1, 0),
            Opcode::ArrayLength => (0, 0),
            other => {
                return Err(Error::IllegalArgument(format!(
                    "{} is not an operator instruction",
                    other.mnemonic()
                )))
            }
        },
        Instruction::Convert(op) => match op {
            Opcode::I2L | Opcode::I2D | Opcode::F2L | Opcode::F2D => (1, 0),
            Opcode::L2I | Opcode::L2F | Opcode::D2I | Opcode::D2F => (-1, 0),
            _ => (0, 0),
        },
        Instruction::Increment { slot, .. } => (0, *slot as u32 + 1),
        Instruction::Branch { op, .. } => match op {
            Opcode::Goto | Opcode::GotoW => (0, 0),
            Opcode::IfICmpEq | Opcode::IfICmpNe | Opcode::IfICmpLt | Opcode::IfICmpGe
            | Opcode::IfICmpGt | Opcode::IfICmpLe | Opcode::IfACmpEq | Opcode::IfACmpNe => {
                (-2, 0)
            }
            _ => (-1, 0),
        },
        Instruction::LookupSwitch { .. } | Instruction::TableSwitch { .. } => (-1, 0),
        Instruction::Return(op) => match op {
            Opcode::Return => (0, 0),
            Opcode::LReturn | Opcode::DReturn => (-2, 0),
            _ => (-1, 0),
        },
        Instruction::Field { op, field } => {
            let width = field_width(*field)?;
            match op {
                Opcode::GetStatic => (width, 0),
                Opcode::PutStatic => (-width, 0),
                Opcode::GetField => (width - 1, 0),
                Opcode::PutField => (-width - 1, 0),
                other => {
                    return Err(Error::IllegalArgument(format!(
                        "{} is not a field instruction",
                        other.mnemonic()
                    )))
                }
            }
        }
        Instruction::Invoke { op, method } => {
            let (argument_slots, returned) = member_slots(*method)?;
            let receiver = if *op == Opcode::InvokeStatic { 0 } else { 1 };
            (returned - argument_slots - receiver, 0)
        }
        Instruction::InvokeDynamic { indy } => {
            let (_, _, descriptor) = pool.dynamic_ref(indy.index())?;
            let descriptor = MethodDescriptor::parse(descriptor)?;
            let pushed = match &descriptor.return_type {
                None => 0,
                Some(t) => t.slot_width() as i32,
            };
            (pushed - descriptor.parameter_slots() as i32, 0)
        }
        Instruction::NewObject { .. } => (1, 0),
        Instruction::NewPrimitiveArray(_) | Instruction::NewReferenceArray { .. } => (0, 0),
        Instruction::NewMultiArray { dimensions, .. } => (1 - *dimensions as i32, 0),
        Instruction::Monitor(_) => (-1, 0),
        Instruction::Throw => (-1, 0),
        Instruction::TypeCheck { .. } => (0, 0),
        Instruction::Jsr { .. } => (1, 0),
        Instruction::Ret { slot } => (0, *slot as u32 + 1),
    })
}

/// Compute `(max_stack, max_locals)` for an assembled code array.
pub fn compute(
    code: &[u8],
    handler_pcs: &[u16],
    pool: &dyn PoolRead,
    ctx: &MethodContext,
) -> Result<(u16, u16)> {
    let descriptor = MethodDescriptor::parse(&ctx.descriptor)?;
    let receiver = if ctx.is_static { 0 } else { 1 };
    let initial_locals = descriptor.parameter_slots() as u32 + receiver;

    let view = ByteView::new(code);
    let mut labels = LabelContext::new();
    let mut max_stack: i32 = 0;
    let mut max_locals: u32 = initial_locals;
    let mut seen: FxHashMap<u32, i32> = FxHashMap::default();
    let mut worklist: Vec<(u32, i32)> = vec![(0, 0)];
    // The thrown exception is the only thing on the stack at a handler
    for &pc in handler_pcs {
        worklist.push((pc as u32, 1));
    }

    while let Some((bci, depth)) = worklist.pop() {
        if seen.contains_key(&bci) {
            continue;
        }
        seen.insert(bci, depth);
        let mut bci = bci as usize;
        let mut depth = depth;
        loop {
            if bci >= code.len() {
                return Err(Error::InvalidCode(format!(
                    "control flow runs off the end of the code array at bci {bci}"
                )));
            }
            let (insn, size) = instruction::decode(&view, bci, pool.pool_id(), &mut labels)?;
            max_stack = max_stack.max(depth);
            let (delta, locals_touched) = effect(&insn, pool)?;
            depth += delta;
            if depth < 0 {
                return Err(Error::InvalidCode(format!("operand stack underflow at bci {bci}")));
            }
            max_stack = max_stack.max(depth);
            max_locals = max_locals.max(locals_touched);
            for target in insn.targets() {
                let target_bci = labels.bci(target)?;
                if !seen.contains_key(&target_bci) {
                    worklist.push((target_bci, depth));
                }
            }
            if !insn.falls_through() {
                break;
            }
            bci += size;
            if seen.contains_key(&(bci as u32)) {
                break;
            }
            seen.insert(bci as u32, depth);
        }
    }

    if max_stack > u16::MAX as i32 || max_locals > u16::MAX as u32 {
        return Err(Error::InvalidCode("max_stack or max_locals exceeds 65535".to_string()));
    }
    Ok((max_stack as u16, max_locals as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(descriptor: &str, is_static: bool) -> MethodContext {
        MethodContext {
            class_name: "Test".to_string(),
            method_name: "m".to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            major_version: 52,
        }
    }

    #[test]
    fn straight_line_depth() {
        let pool = crate::pool::PoolBuilder::new();
        // iconst_1; iconst_2; iadd; ireturn
        let code = [0x04, 0x05, 0x60, 0xAC];
        let (max_stack, max_locals) = compute(&code, &[], &pool, &ctx("()I", true)).unwrap();
        assert_eq!(max_stack, 2);
        assert_eq!(max_locals, 0);
    }

    #[test]
    fn locals_cover_parameters_and_stores() {
        let pool = crate::pool::PoolBuilder::new();
        // lconst_0; lstore 4; return   (wide long store at slot 4 touches 4+2)
        let code = [0x09, 0x37, 0x04, 0xB1];
        let (max_stack, max_locals) = compute(&code, &[], &pool, &ctx("(I)V", false)).unwrap();
        assert_eq!(max_stack, 2);
        assert_eq!(max_locals, 6);
    }

    #[test]
    fn handler_starts_with_depth_one() {
        let pool = crate::pool::PoolBuilder::new();
        // return | athrow (handler at bci 1)
        let code = [0xB1, 0xBF];
        let (max_stack, _) = compute(&code, &[1], &pool, &ctx("()V", true)).unwrap();
        assert_eq!(max_stack, 1);
    }

    #[test]
    fn underflow_is_invalid() {
        let pool = crate::pool::PoolBuilder::new();
        let code = [0x57, 0xB1]; // pop with empty stack
        assert!(matches!(
            compute(&code, &[], &pool, &ctx("()V", true)),
            Err(Error::InvalidCode(_))
        ));
    }
}
