//! The assembler: element stream to Code-attribute bytes.
//!
//! Two logical passes over one buffered instruction list, never re-walking
//! the source elements:
//!
//!   1. **emit** — every branch is reserved in its short form (16-bit offset,
//!      1-byte `ldc` index, un-`wide` loads); labels bind to the bci where
//!      the emission cursor sat; branch operands are written as marked holes.
//!   2. **resolve & fix up** — offsets are computed from the final label
//!      bcis and patched back through the marks.
//!
//! Between the two sits the sizing loop: a branch whose offset cannot fit in
//! 16 bits is switched to its wide form (`goto` to `goto_w`; a conditional to
//! the inverted condition skipping over a `goto_w`, the same rewrite shapes
//! the classfile ecosystem has always used). Widening moves every later bci,
//! which can push other branches out of range, so the loop runs to a fixed
//! point. It terminates because a branch that went wide never goes back, and
//! a method body is capped at 65535 bytes; a round cap catches bugs.
//!
//! Dead code (unreachable between a terminator and the next used label) is
//! invalid for stack-map purposes, so under the default policy each dead
//! range is overwritten with `nop ... nop athrow` and every label inside it
//! gets a frame with `Throwable` on the stack.

use crate::bytes::{ByteBuf, Mark};
use crate::code::instruction::Instruction;
use crate::code::label::{Label, LabelContext};
use crate::code::opcode::Opcode;
use crate::code::stackmap::{self, HandlerInfo};
use crate::code::{stack_counter, CodeElement, MethodContext};
use crate::attribute::Attribute;
use crate::error::{Error, Result};
use crate::model::STACK_MAPS_REQUIRED_MAJOR;
use crate::options::{
    DeadCodeOption, DeadLabelsOption, DebugElementsOption, LineNumbersOption, Options,
    ShortJumpsOption, StackMapsOption,
};
use crate::pool::{PoolBuilder, PoolIndex, PoolRead};
use rustc_hash::{FxHashMap, FxHashSet};

const MAX_CODE_LENGTH: u32 = 65535;
const MAX_WIDEN_ROUNDS: u32 = 32;

/// A `LocalVariableTable`/`LocalVariableTypeTable` row with resolved pcs.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVariableInfo {
    pub start_pc: u16,
    pub length: u16,
    pub name: String,
    /// Descriptor, or generic signature for the type table.
    pub type_string: String,
    pub slot: u16,
}

/// Everything needed to serialize one Code attribute.
pub struct AssembledCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub handlers: Vec<HandlerInfo>,
    pub stack_map_payload: Option<Vec<u8>>,
    pub line_numbers: Vec<(u16, u16)>,
    pub local_variables: Vec<LocalVariableInfo>,
    pub local_variable_types: Vec<LocalVariableInfo>,
    pub raw_attributes: Vec<Attribute>,
}

struct Catch {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: Option<String>,
}

struct LocalVar {
    start: Label,
    end: Label,
    name: String,
    type_string: String,
    slot: u16,
    generic: bool,
}

/// Assemble a buffered element stream.
///
/// `labels` is the context the elements' labels belong to; label bcis are
/// bound into it as a side effect. `source` is the pool of the model the
/// elements were read from, consulted when instruction operands carry
/// foreign indices.
pub fn assemble(
    elements: &[CodeElement],
    labels: &mut LabelContext,
    pool: &mut PoolBuilder,
    source: Option<&dyn PoolRead>,
    options: &Options,
    ctx: &MethodContext,
) -> Result<AssembledCode> {
    // ---- collect -----------------------------------------------------
    let mut insns: Vec<Instruction> = vec![];
    let mut binds: Vec<(usize, Label)> = vec![];
    let mut catches: Vec<Catch> = vec![];
    let mut lines: Vec<(usize, u16)> = vec![];
    let mut local_vars: Vec<LocalVar> = vec![];
    let mut raw_attributes: Vec<Attribute> = vec![];

    for element in elements {
        match element {
            CodeElement::Label(label) => {
                if !labels.owns(*label) {
                    return Err(Error::IllegalArgument(
                        "label from a foreign context reached the assembler".to_string(),
                    ));
                }
                binds.push((insns.len(), *label));
            }
            CodeElement::Instruction(insn) => {
                insns.push(translate_instruction(insn, pool, source)?);
            }
            CodeElement::ExceptionCatch { start, end, handler, catch_type } => {
                catches.push(Catch {
                    start: *start,
                    end: *end,
                    handler: *handler,
                    catch_type: catch_type.clone(),
                });
            }
            CodeElement::LineNumber { line } => {
                if options.line_numbers == LineNumbersOption::Pass {
                    lines.push((insns.len(), *line));
                }
            }
            CodeElement::LocalVariable { start, end, name, descriptor, slot } => {
                if options.debug_elements == DebugElementsOption::Pass {
                    local_vars.push(LocalVar {
                        start: *start,
                        end: *end,
                        name: name.clone(),
                        type_string: descriptor.clone(),
                        slot: *slot,
                        generic: false,
                    });
                }
            }
            CodeElement::LocalVariableType { start, end, name, signature, slot } => {
                if options.debug_elements == DebugElementsOption::Pass {
                    local_vars.push(LocalVar {
                        start: *start,
                        end: *end,
                        name: name.clone(),
                        type_string: signature.clone(),
                        slot: *slot,
                        generic: true,
                    });
                }
            }
            CodeElement::CodeAttribute(attribute) => raw_attributes.push(attribute.clone()),
        }
    }

    if insns.is_empty() {
        return Err(Error::InvalidCode("a method body must contain at least one instruction".to_string()));
    }

    // ---- dead labels -------------------------------------------------
    let bound: FxHashSet<Label> = binds.iter().map(|(_, label)| *label).collect();
    let fail_dead = options.dead_labels == DeadLabelsOption::Fail;
    let check_dead = |used: &[Label]| -> Result<bool> {
        for label in used {
            if !bound.contains(label) {
                if fail_dead {
                    return Err(Error::InvalidCode(
                        "a branch or table references a label that is never bound".to_string(),
                    ));
                }
                return Ok(true);
            }
        }
        Ok(false)
    };
    let mut kept: Vec<Instruction> = Vec::with_capacity(insns.len());
    let mut dropped_before: Vec<usize> = vec![];
    for (index, insn) in insns.into_iter().enumerate() {
        if check_dead(&insn.targets())? {
            dropped_before.push(index);
        } else {
            kept.push(insn);
        }
    }
    if !dropped_before.is_empty() {
        // Shift bind/line positions left past the dropped instructions
        let shift = |position: usize| -> usize {
            position - dropped_before.iter().take_while(|&&d| d < position).count()
        };
        for (position, _) in binds.iter_mut() {
            *position = shift(*position);
        }
        for (position, _) in lines.iter_mut() {
            *position = shift(*position);
        }
    }
    let insns = kept;
    if insns.is_empty() {
        return Err(Error::InvalidCode(
            "dropping dead-label references left the method body empty".to_string(),
        ));
    }
    catches.retain(|c| !matches!(check_dead(&[c.start, c.end, c.handler]), Ok(true)));
    for catch in &catches {
        check_dead(&[catch.start, catch.end, catch.handler])?;
    }
    local_vars.retain(|v| !matches!(check_dead(&[v.start, v.end]), Ok(true)));
    for var in &local_vars {
        check_dead(&[var.start, var.end])?;
    }

    // ---- sizing to a fixed point ------------------------------------
    let n = insns.len();
    let mut wide = vec![false; n];
    for (i, insn) in insns.iter().enumerate() {
        // A wide branch read from a classfile stays wide
        if let Instruction::Branch { op: Opcode::GotoW, .. }
        | Instruction::Jsr { op: Opcode::JsrW, .. } = insn
        {
            wide[i] = true;
        }
    }
    let mut bcis = vec![0u32; n + 1];
    let mut label_bcis: FxHashMap<Label, u32> = FxHashMap::default();
    let mut rounds = 0;
    loop {
        rounds += 1;
        if rounds > MAX_WIDEN_ROUNDS {
            return Err(Error::InvalidCode(
                "short-jump widening failed to reach a fixed point".to_string(),
            ));
        }
        let mut bci = 0u32;
        for i in 0..n {
            bcis[i] = bci;
            bci += encoded_size(&insns[i], bci, wide[i], pool)?;
        }
        bcis[n] = bci;
        if bci > MAX_CODE_LENGTH {
            return Err(Error::InvalidCode(format!(
                "method body of {bci} bytes exceeds the 65535-byte limit"
            )));
        }
        label_bcis.clear();
        for (position, label) in &binds {
            let at = bcis[*position];
            if let Some(previous) = label_bcis.insert(*label, at) {
                if previous != at {
                    return Err(Error::IllegalState(format!(
                        "label bound at bci {previous} and again at bci {at}"
                    )));
                }
            }
        }

        let mut widened = false;
        for i in 0..n {
            if wide[i] {
                continue;
            }
            let target = match &insns[i] {
                Instruction::Branch { target, .. } | Instruction::Jsr { target, .. } => *target,
                _ => continue,
            };
            let delta = label_bcis[&target] as i64 - bcis[i] as i64;
            if i16::try_from(delta).is_err() {
                if options.short_jumps == ShortJumpsOption::Fail {
                    return Err(Error::InvalidCode(format!(
                        "branch offset {delta} does not fit in 16 bits"
                    )));
                }
                wide[i] = true;
                widened = true;
            }
        }
        if !widened {
            break;
        }
    }
    let code_len = bcis[n];
    for (label, bci) in &label_bcis {
        labels.bind(*label, *bci)?;
    }

    // ---- reachability ------------------------------------------------
    let position_of: FxHashMap<Label, usize> = {
        let mut map = FxHashMap::default();
        for (position, label) in &binds {
            map.insert(*label, *position);
        }
        map
    };
    let target_position = |label: Label| -> Result<usize> {
        let position = position_of[&label];
        if position >= n {
            return Err(Error::InvalidCode(
                "branch or handler targets the end of the code array".to_string(),
            ));
        }
        Ok(position)
    };
    let mut reachable = vec![false; n];
    let mut stack: Vec<usize> = vec![0];
    for catch in &catches {
        stack.push(target_position(catch.handler)?);
    }
    while let Some(i) = stack.pop() {
        if reachable[i] {
            continue;
        }
        reachable[i] = true;
        let insn = &insns[i];
        for target in insn.targets() {
            stack.push(target_position(target)?);
        }
        if insn.falls_through() {
            if i + 1 >= n {
                return Err(Error::InvalidCode(
                    "control flow falls off the end of the code array".to_string(),
                ));
            }
            stack.push(i + 1);
        }
    }
    let any_dead = reachable.iter().any(|r| !r);
    let patch_dead = match (any_dead, options.dead_code) {
        (false, _) => false,
        (true, DeadCodeOption::Fail) => {
            return Err(Error::InvalidCode("unreachable instructions present".to_string()))
        }
        (true, DeadCodeOption::Keep) => false,
        (true, DeadCodeOption::Patch) => true,
    };
    let mut dead_label_bcis: Vec<u32> = vec![];
    if patch_dead {
        let mut seen: FxHashSet<u32> = FxHashSet::default();
        for (position, _) in &binds {
            if *position < n && !reachable[*position] && seen.insert(bcis[*position]) {
                dead_label_bcis.push(bcis[*position]);
            }
        }
        dead_label_bcis.sort_unstable();
    }

    // ---- pass 1: emit ------------------------------------------------
    let mut buf = ByteBuf::with_capacity(code_len as usize);
    let mut fixes: Vec<BranchFix> = vec![];
    for i in 0..n {
        let at = bcis[i];
        let size = bcis[i + 1] - at;
        if patch_dead && !reachable[i] {
            let range_ends = i + 1 == n || reachable[i + 1];
            let nops = if range_ends { size - 1 } else { size };
            for _ in 0..nops {
                buf.write_u1(Opcode::Nop as u8);
            }
            if range_ends {
                buf.write_u1(Opcode::AThrow as u8);
            }
            continue;
        }
        emit_instruction(
            &insns[i],
            at,
            wide[i],
            pool,
            &label_bcis,
            &mut buf,
            &mut fixes,
        )?;
        debug_assert_eq!(buf.len() as u32, bcis[i + 1], "size mismatch at bci {at}");
    }

    // ---- pass 2: resolve & patch ------------------------------------
    for fix in fixes {
        let delta = label_bcis[&fix.target] as i64 - fix.base as i64;
        if fix.four_bytes {
            buf.patch_u4(fix.mark, delta as i32 as u32);
        } else {
            buf.patch_u2(fix.mark, delta as i16 as u16);
        }
    }
    let code = buf.into_vec();

    // ---- exception table, debug tables ------------------------------
    let mut handlers: Vec<HandlerInfo> = Vec::with_capacity(catches.len());
    for catch in &catches {
        let start_pc = label_bcis[&catch.start] as u16;
        let end_pc = label_bcis[&catch.end] as u16;
        if start_pc > end_pc {
            return Err(Error::IllegalArgument(format!(
                "exception handler range {start_pc}..{end_pc} is inverted"
            )));
        }
        handlers.push(HandlerInfo {
            start_pc,
            end_pc,
            handler_pc: label_bcis[&catch.handler] as u16,
            catch_type: catch.catch_type.clone(),
        });
    }
    let line_numbers: Vec<(u16, u16)> =
        lines.iter().map(|(position, line)| (bcis[*position] as u16, *line)).collect();
    let mut local_variables = vec![];
    let mut local_variable_types = vec![];
    for var in &local_vars {
        let start_pc = label_bcis[&var.start] as u16;
        let info = LocalVariableInfo {
            start_pc,
            length: (label_bcis[&var.end] as u16).saturating_sub(start_pc),
            name: var.name.clone(),
            type_string: var.type_string.clone(),
            slot: var.slot,
        };
        if var.generic {
            local_variable_types.push(info);
        } else {
            local_variables.push(info);
        }
    }

    // ---- stack maps / maxes -----------------------------------------
    let need_frames = match options.stack_maps {
        StackMapsOption::Generate => true,
        StackMapsOption::Drop => false,
        StackMapsOption::WhenRequired => ctx.major_version >= STACK_MAPS_REQUIRED_MAJOR,
    };
    let has_discontinued = insns
        .iter()
        .any(|insn| matches!(insn, Instruction::Jsr { .. } | Instruction::Ret { .. }));
    let keeps_dead = any_dead && !patch_dead;
    let (max_stack, max_locals, stack_map_payload) = if need_frames && !has_discontinued && !keeps_dead
    {
        let generated = stackmap::generate(
            &code,
            &handlers,
            pool,
            ctx,
            options.class_hierarchy_resolver.clone(),
            &dead_label_bcis,
        )?;
        (generated.max_stack, generated.max_locals, generated.frames_payload)
    } else {
        if need_frames && has_discontinued {
            return Err(Error::InvalidCode(
                "jsr/ret cannot appear in code that needs stack map frames".to_string(),
            ));
        }
        let handler_pcs: Vec<u16> = handlers.iter().map(|h| h.handler_pc).collect();
        let (max_stack, max_locals) = stack_counter::compute(&code, &handler_pcs, &*pool, ctx)?;
        (max_stack, max_locals, None)
    };

    Ok(AssembledCode {
        max_stack,
        max_locals,
        code,
        handlers,
        stack_map_payload,
        line_numbers,
        local_variables,
        local_variable_types,
        raw_attributes,
    })
}

/// Re-home a pool reference against the output pool.
fn rehome(
    pool: &mut PoolBuilder,
    source: Option<&dyn PoolRead>,
    index: PoolIndex,
) -> Result<PoolIndex> {
    let translated = pool.translate(index, source)?;
    Ok(pool.index_of(translated))
}

/// Re-home every pool reference an instruction carries, and validate the
/// opcode/kind pairings a user could get wrong.
fn translate_instruction(
    insn: &Instruction,
    pool: &mut PoolBuilder,
    source: Option<&dyn PoolRead>,
) -> Result<Instruction> {
    Ok(match insn {
        Instruction::LoadConstant { op, index } => {
            let index = rehome(pool, source, *index)?;
            let entry = pool.entry(index.index())?;
            if !entry.loadable() {
                return Err(Error::IllegalArgument(format!(
                    "ldc of a non-loadable tag-{} entry",
                    entry.tag()
                )));
            }
            let wide_entry = entry.width() == 2;
            match (op, wide_entry) {
                (Opcode::Ldc2W, true) | (Opcode::Ldc, false) | (Opcode::LdcW, false) => {}
                (Opcode::Ldc2W, false) => {
                    return Err(Error::IllegalArgument(
                        "ldc2_w of a single-slot constant".to_string(),
                    ))
                }
                (Opcode::Ldc, true) | (Opcode::LdcW, true) => {
                    return Err(Error::IllegalArgument(
                        "ldc of a two-slot constant; use ldc2_w".to_string(),
                    ))
                }
                (other, _) => {
                    return Err(Error::IllegalArgument(format!(
                        "{} is not an ldc-family opcode",
                        other.mnemonic()
                    )))
                }
            }
            Instruction::LoadConstant { op: *op, index }
        }
        Instruction::Field { op, field } => {
            if !matches!(
                op,
                Opcode::GetStatic | Opcode::PutStatic | Opcode::GetField | Opcode::PutField
            ) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a field opcode",
                    op.mnemonic()
                )));
            }
            Instruction::Field { op: *op, field: rehome(pool, source, *field)? }
        }
        Instruction::Invoke { op, method } => {
            if !matches!(
                op,
                Opcode::InvokeVirtual
                    | Opcode::InvokeSpecial
                    | Opcode::InvokeStatic
                    | Opcode::InvokeInterface
            ) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not an invoke opcode",
                    op.mnemonic()
                )));
            }
            Instruction::Invoke { op: *op, method: rehome(pool, source, *method)? }
        }
        Instruction::InvokeDynamic { indy } => {
            Instruction::InvokeDynamic { indy: rehome(pool, source, *indy)? }
        }
        Instruction::NewObject { class } => {
            Instruction::NewObject { class: rehome(pool, source, *class)? }
        }
        Instruction::NewReferenceArray { component } => {
            Instruction::NewReferenceArray { component: rehome(pool, source, *component)? }
        }
        Instruction::NewMultiArray { class, dimensions } => {
            if *dimensions == 0 {
                return Err(Error::IllegalArgument(
                    "multianewarray needs at least one dimension".to_string(),
                ));
            }
            Instruction::NewMultiArray { class: rehome(pool, source, *class)?, dimensions: *dimensions }
        }
        Instruction::TypeCheck { op, class } => {
            if !matches!(op, Opcode::CheckCast | Opcode::InstanceOf) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a type check opcode",
                    op.mnemonic()
                )));
            }
            Instruction::TypeCheck { op: *op, class: rehome(pool, source, *class)? }
        }
        Instruction::Branch { op, target } => {
            if !op.is_conditional_branch() && !matches!(op, Opcode::Goto | Opcode::GotoW) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a branch opcode",
                    op.mnemonic()
                )));
            }
            Instruction::Branch { op: *op, target: *target }
        }
        Instruction::Push { op, value } => {
            match op {
                Opcode::Bipush if i8::try_from(*value).is_ok() => {}
                Opcode::Sipush if i16::try_from(*value).is_ok() => {}
                Opcode::Bipush | Opcode::Sipush => {
                    return Err(Error::IllegalArgument(format!(
                        "{} immediate {value} out of range",
                        op.mnemonic()
                    )))
                }
                other => {
                    return Err(Error::IllegalArgument(format!(
                        "{} is not a push opcode",
                        other.mnemonic()
                    )))
                }
            }
            insn.clone()
        }
        other => other.clone(),
    })
}

/// Size of one instruction laid out at `at`, given its widening state.
fn encoded_size(
    insn: &Instruction,
    at: u32,
    wide: bool,
    pool: &PoolBuilder,
) -> Result<u32> {
    Ok(match insn {
        Instruction::Nop
        | Instruction::ConstantPush(_)
        | Instruction::ArrayLoad(_)
        | Instruction::ArrayStore(_)
        | Instruction::Stack(_)
        | Instruction::Operator(_)
        | Instruction::Convert(_)
        | Instruction::Return(_)
        | Instruction::Throw
        | Instruction::Monitor(_) => 1,
        Instruction::Push { op: Opcode::Bipush, .. } => 2,
        Instruction::Push { .. } => 3,
        Instruction::LoadConstant { op, index } => {
            if *op == Opcode::Ldc2W || pool.entry(index.index())?.width() == 2 {
                3
            } else if index.index() <= u8::MAX as u16 {
                2
            } else {
                3
            }
        }
        Instruction::Load { slot, .. } | Instruction::Store { slot, .. } => {
            if *slot <= 3 {
                1
            } else if *slot <= u8::MAX as u16 {
                2
            } else {
                4
            }
        }
        Instruction::Increment { slot, delta } => {
            if *slot <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Instruction::Branch { op, .. } => {
            if !wide {
                3
            } else if matches!(op, Opcode::Goto | Opcode::GotoW) {
                5
            } else {
                8 // inverted condition (3) + goto_w (5)
            }
        }
        Instruction::Jsr { .. } => {
            if wide {
                5
            } else {
                3
            }
        }
        Instruction::Ret { slot } => {
            if *slot <= u8::MAX as u16 {
                2
            } else {
                4
            }
        }
        Instruction::TableSwitch { low, high, .. } => {
            let pad = (4 - (at + 1) % 4) % 4;
            let count = (*high as i64 - *low as i64 + 1) as u32;
            1 + pad + 12 + 4 * count
        }
        Instruction::LookupSwitch { pairs, .. } => {
            let pad = (4 - (at + 1) % 4) % 4;
            1 + pad + 8 + 8 * pairs.len() as u32
        }
        Instruction::Field { .. } | Instruction::Invoke { op: Opcode::InvokeVirtual, .. }
        | Instruction::Invoke { op: Opcode::InvokeSpecial, .. }
        | Instruction::Invoke { op: Opcode::InvokeStatic, .. } => 3,
        Instruction::Invoke { .. } | Instruction::InvokeDynamic { .. } => 5,
        Instruction::NewObject { .. }
        | Instruction::NewReferenceArray { .. }
        | Instruction::TypeCheck { .. } => 3,
        Instruction::NewPrimitiveArray(_) => 2,
        Instruction::NewMultiArray { .. } => 4,
    })
}

struct BranchFix {
    mark: Mark,
    /// The bci the offset is relative to.
    base: u32,
    target: Label,
    four_bytes: bool,
}

#[allow(clippy::too_many_arguments)]
fn emit_instruction(
    insn: &Instruction,
    at: u32,
    wide: bool,
    pool: &mut PoolBuilder,
    label_bcis: &FxHashMap<Label, u32>,
    buf: &mut ByteBuf,
    fixes: &mut Vec<BranchFix>,
) -> Result<()> {
    let mut reserve_offset = |buf: &mut ByteBuf, base: u32, target: Label, four_bytes: bool| {
        let mark = buf.mark();
        if four_bytes {
            buf.write_u4(0);
        } else {
            buf.write_u2(0);
        }
        fixes.push(BranchFix { mark, base, target, four_bytes });
    };
    match insn {
        Instruction::Nop => buf.write_u1(Opcode::Nop as u8),
        Instruction::ConstantPush(op) => {
            if !(0x01..=0x0F).contains(&(*op as u8)) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a constant push opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::Push { op, value } => {
            buf.write_u1(*op as u8);
            if *op == Opcode::Bipush {
                buf.write_u1(*value as i8 as u8);
            } else {
                buf.write_u2(*value as i16 as u16);
            }
        }
        Instruction::LoadConstant { op, index } => {
            let wide_entry = *op == Opcode::Ldc2W || pool.entry(index.index())?.width() == 2;
            if wide_entry {
                buf.write_u1(Opcode::Ldc2W as u8);
                buf.write_u2(index.index());
            } else if index.index() <= u8::MAX as u16 {
                buf.write_u1(Opcode::Ldc as u8);
                buf.write_u1(index.index() as u8);
            } else {
                buf.write_u1(Opcode::LdcW as u8);
                buf.write_u2(index.index());
            }
        }
        Instruction::Load { op, slot } => {
            let base = *op as u8;
            if !(0x15..=0x19).contains(&base) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a load opcode",
                    op.mnemonic()
                )));
            }
            emit_slot_form(buf, base, 0x1A + (base - 0x15) * 4, *slot);
        }
        Instruction::Store { op, slot } => {
            let base = *op as u8;
            if !(0x36..=0x3A).contains(&base) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a store opcode",
                    op.mnemonic()
                )));
            }
            emit_slot_form(buf, base, 0x3B + (base - 0x36) * 4, *slot);
        }
        Instruction::ArrayLoad(op) => {
            if !(0x2E..=0x35).contains(&(*op as u8)) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not an array load opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::ArrayStore(op) => {
            if !(0x4F..=0x56).contains(&(*op as u8)) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not an array store opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::Stack(op) => {
            if !(0x57..=0x5F).contains(&(*op as u8)) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a stack opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::Operator(op) => {
            let byte = *op as u8;
            if !((0x60..=0x83).contains(&byte)
                || (0x94..=0x98).contains(&byte)
                || *op == Opcode::ArrayLength)
            {
                return Err(Error::IllegalArgument(format!(
                    "{} is not an operator opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(byte);
        }
        Instruction::Convert(op) => {
            if !(0x85..=0x93).contains(&(*op as u8)) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a conversion opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::Increment { slot, delta } => {
            if *slot <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                buf.write_u1(Opcode::IInc as u8);
                buf.write_u1(*slot as u8);
                buf.write_u1(*delta as i8 as u8);
            } else {
                buf.write_u1(Opcode::Wide as u8);
                buf.write_u1(Opcode::IInc as u8);
                buf.write_u2(*slot);
                buf.write_u2(*delta as u16);
            }
        }
        Instruction::Branch { op, target } => {
            if !wide {
                let byte = if *op == Opcode::GotoW { Opcode::Goto as u8 } else { *op as u8 };
                buf.write_u1(byte);
                reserve_offset(buf, at, *target, false);
            } else if matches!(op, Opcode::Goto | Opcode::GotoW) {
                buf.write_u1(Opcode::GotoW as u8);
                reserve_offset(buf, at, *target, true);
            } else {
                let inverted = op.inverted_condition().ok_or_else(|| {
                    Error::IllegalArgument(format!(
                        "{} cannot be widened by inversion",
                        op.mnemonic()
                    ))
                })?;
                buf.write_u1(inverted as u8);
                buf.write_u2(8); // skip over the goto_w that follows
                buf.write_u1(Opcode::GotoW as u8);
                reserve_offset(buf, at + 3, *target, true);
            }
        }
        Instruction::Jsr { target, .. } => {
            if wide {
                buf.write_u1(Opcode::JsrW as u8);
                reserve_offset(buf, at, *target, true);
            } else {
                buf.write_u1(Opcode::Jsr as u8);
                reserve_offset(buf, at, *target, false);
            }
        }
        Instruction::Ret { slot } => {
            if *slot <= u8::MAX as u16 {
                buf.write_u1(Opcode::Ret as u8);
                buf.write_u1(*slot as u8);
            } else {
                buf.write_u1(Opcode::Wide as u8);
                buf.write_u1(Opcode::Ret as u8);
                buf.write_u2(*slot);
            }
        }
        Instruction::TableSwitch { low, high, default, targets } => {
            if *high < *low {
                return Err(Error::IllegalArgument(format!(
                    "tableswitch bounds {low}..{high} are inverted"
                )));
            }
            let expected = (*high as i64 - *low as i64 + 1) as usize;
            if targets.len() != expected {
                return Err(Error::IllegalArgument(format!(
                    "tableswitch needs {expected} targets, got {}",
                    targets.len()
                )));
            }
            buf.write_u1(Opcode::TableSwitch as u8);
            for _ in 0..(4 - (at + 1) % 4) % 4 {
                buf.write_u1(0);
            }
            buf.write_u4((label_bcis[default] as i64 - at as i64) as i32 as u32);
            buf.write_u4(*low as u32);
            buf.write_u4(*high as u32);
            for target in targets {
                buf.write_u4((label_bcis[target] as i64 - at as i64) as i32 as u32);
            }
        }
        Instruction::LookupSwitch { default, pairs } => {
            let mut sorted = pairs.clone();
            sorted.sort_by_key(|(key, _)| *key);
            if sorted.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(Error::IllegalArgument(
                    "lookupswitch has duplicate match keys".to_string(),
                ));
            }
            buf.write_u1(Opcode::LookupSwitch as u8);
            for _ in 0..(4 - (at + 1) % 4) % 4 {
                buf.write_u1(0);
            }
            buf.write_u4((label_bcis[default] as i64 - at as i64) as i32 as u32);
            buf.write_u4(sorted.len() as u32);
            for (key, target) in &sorted {
                buf.write_u4(*key as u32);
                buf.write_u4((label_bcis[target] as i64 - at as i64) as i32 as u32);
            }
        }
        Instruction::Return(op) => {
            if !(0xAC..=0xB1).contains(&(*op as u8)) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a return opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::Field { op, field } => {
            buf.write_u1(*op as u8);
            buf.write_u2(field.index());
        }
        Instruction::Invoke { op, method } => {
            buf.write_u1(*op as u8);
            buf.write_u2(method.index());
            if *op == Opcode::InvokeInterface {
                let (_, _, descriptor) = pool.member_ref(method.index())?;
                let descriptor = crate::descriptor::MethodDescriptor::parse(descriptor)?;
                buf.write_u1(1 + descriptor.parameter_slots() as u8);
                buf.write_u1(0);
            }
        }
        Instruction::InvokeDynamic { indy } => {
            buf.write_u1(Opcode::InvokeDynamic as u8);
            buf.write_u2(indy.index());
            buf.write_u2(0);
        }
        Instruction::NewObject { class } => {
            buf.write_u1(Opcode::New as u8);
            buf.write_u2(class.index());
        }
        Instruction::NewPrimitiveArray(array_type) => {
            buf.write_u1(Opcode::NewArray as u8);
            buf.write_u1(array_type.as_u8());
        }
        Instruction::NewReferenceArray { component } => {
            buf.write_u1(Opcode::ANewArray as u8);
            buf.write_u2(component.index());
        }
        Instruction::NewMultiArray { class, dimensions } => {
            buf.write_u1(Opcode::MultiANewArray as u8);
            buf.write_u2(class.index());
            buf.write_u1(*dimensions);
        }
        Instruction::Monitor(op) => {
            if !matches!(op, Opcode::MonitorEnter | Opcode::MonitorExit) {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a monitor opcode",
                    op.mnemonic()
                )));
            }
            buf.write_u1(*op as u8);
        }
        Instruction::Throw => buf.write_u1(Opcode::AThrow as u8),
        Instruction::TypeCheck { op, class } => {
            buf.write_u1(*op as u8);
            buf.write_u2(class.index());
        }
    }
    Ok(())
}

/// Loads and stores: `_n` form, one-byte slot, or `wide` with a two-byte
/// slot, shortest first.
fn emit_slot_form(buf: &mut ByteBuf, base: u8, n_form_base: u8, slot: u16) {
    if slot <= 3 {
        buf.write_u1(n_form_base + slot as u8);
    } else if slot <= u8::MAX as u16 {
        buf.write_u1(base);
        buf.write_u1(slot as u8);
    } else {
        buf.write_u1(Opcode::Wide as u8);
        buf.write_u1(base);
        buf.write_u2(slot);
    }
}

impl AssembledCode {
    /// Serialize the complete `Code` attribute (name, length, payload).
    pub fn encode(&self, pool: &mut PoolBuilder, buf: &mut ByteBuf) -> Result<()> {
        let name = pool.utf8("Code")?;
        buf.write_u2(name);
        let length_mark = buf.mark();
        buf.write_u4(0);
        let payload_start = buf.len();

        buf.write_u2(self.max_stack);
        buf.write_u2(self.max_locals);
        buf.write_u4(self.code.len() as u32);
        buf.write_bytes(&self.code);
        buf.write_u2(self.handlers.len() as u16);
        for handler in &self.handlers {
            buf.write_u2(handler.start_pc);
            buf.write_u2(handler.end_pc);
            buf.write_u2(handler.handler_pc);
            let catch_index = match &handler.catch_type {
                Some(name) => pool.class(name)?,
                None => 0,
            };
            buf.write_u2(catch_index);
        }

        let mut count: u16 = 0;
        count += u16::from(!self.line_numbers.is_empty());
        count += u16::from(!self.local_variables.is_empty());
        count += u16::from(!self.local_variable_types.is_empty());
        count += u16::from(self.stack_map_payload.is_some());
        count += self.raw_attributes.len() as u16;
        buf.write_u2(count);

        if !self.line_numbers.is_empty() {
            let name = pool.utf8("LineNumberTable")?;
            buf.write_u2(name);
            buf.write_u4(2 + 4 * self.line_numbers.len() as u32);
            buf.write_u2(self.line_numbers.len() as u16);
            for (start_pc, line) in &self.line_numbers {
                buf.write_u2(*start_pc);
                buf.write_u2(*line);
            }
        }
        for (table, name) in [
            (&self.local_variables, "LocalVariableTable"),
            (&self.local_variable_types, "LocalVariableTypeTable"),
        ] {
            if table.is_empty() {
                continue;
            }
            let name = pool.utf8(name)?;
            buf.write_u2(name);
            buf.write_u4(2 + 10 * table.len() as u32);
            buf.write_u2(table.len() as u16);
            for variable in table.iter() {
                buf.write_u2(variable.start_pc);
                buf.write_u2(variable.length);
                let name = pool.utf8(&variable.name)?;
                buf.write_u2(name);
                let type_string = pool.utf8(&variable.type_string)?;
                buf.write_u2(type_string);
                buf.write_u2(variable.slot);
            }
        }
        if let Some(payload) = &self.stack_map_payload {
            let name = pool.utf8("StackMapTable")?;
            buf.write_u2(name);
            buf.write_u4(payload.len() as u32);
            buf.write_bytes(payload);
        }
        for attribute in &self.raw_attributes {
            attribute.encode(pool, None, buf)?;
        }

        let length = (buf.len() - payload_start) as u32;
        buf.patch_u4(length_mark, length);
        Ok(())
    }
}
