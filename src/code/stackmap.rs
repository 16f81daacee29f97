//! StackMapTable generation: abstract interpretation over verification
//! types, one frame per jump target and exception handler.
//!
//! The generator runs over the *assembled* code array, after branch widening
//! and dead-code patching, so every offset it sees is final. Locals are
//! tracked slot-wise (a `Long` is followed by an explicit `Top` filler);
//! the operand stack is tracked value-wise with widths summed separately for
//! `max_stack`. Frames are emitted in the delta-encoded forms of
//! [JVMS §4.7.4][0].
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.4

use crate::bytes::{ByteBuf, ByteView};
use crate::code::instruction::{self, ArrayType, Instruction};
use crate::code::label::LabelContext;
use crate::code::opcode::Opcode;
use crate::code::MethodContext;
use crate::descriptor::{BaseType, FieldType, MethodDescriptor};
use crate::error::{Error, Result};
use crate::options::ClassHierarchyResolverFn;
use crate::pool::{PoolBuilder, PoolEntry, PoolRead};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// The verification type hierarchy of [JVMS §4.10.1.2][0].
///
/// `Object` carries a binary class name, or an array descriptor such as
/// `[I` / `[Ljava/lang/String;` for array classes.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.10.1.2
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Offset of the `new` instruction that produced the value.
    Uninitialized(u16),
    Object(String),
}

impl VerificationType {
    /// Slots the type occupies on the stack or in the locals.
    fn width(&self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            VerificationType::Null
                | VerificationType::UninitializedThis
                | VerificationType::Uninitialized(_)
                | VerificationType::Object(_)
        )
    }

    fn of_field_type(field_type: &FieldType) -> VerificationType {
        match field_type {
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(_) => VerificationType::Integer,
            FieldType::Object(name) => VerificationType::Object(name.clone()),
            array @ FieldType::Array(_) => VerificationType::Object(array.render()),
        }
    }

    fn of_descriptor(descriptor: &str) -> Result<VerificationType> {
        Ok(VerificationType::of_field_type(&FieldType::parse(descriptor)?))
    }

    fn encode(&self, pool: &mut PoolBuilder, buf: &mut ByteBuf) -> Result<()> {
        match self {
            VerificationType::Top => buf.write_u1(0),
            VerificationType::Integer => buf.write_u1(1),
            VerificationType::Float => buf.write_u1(2),
            VerificationType::Double => buf.write_u1(3),
            VerificationType::Long => buf.write_u1(4),
            VerificationType::Null => buf.write_u1(5),
            VerificationType::UninitializedThis => buf.write_u1(6),
            VerificationType::Object(name) => {
                buf.write_u1(7);
                let index = pool.class(name)?;
                buf.write_u2(index);
            }
            VerificationType::Uninitialized(offset) => {
                buf.write_u1(8);
                buf.write_u2(*offset);
            }
        }
        Ok(())
    }
}

/// An exception-table row with the catch type resolved to a name.
#[derive(Clone, Debug)]
pub struct HandlerInfo {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// `None` is the catch-all, verified as `java/lang/Throwable`.
    pub catch_type: Option<String>,
}

impl HandlerInfo {
    fn catch_verification_type(&self) -> VerificationType {
        VerificationType::Object(
            self.catch_type.clone().unwrap_or_else(|| "java/lang/Throwable".to_string()),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Frame {
    /// Slot-wise locals: wide types are followed by a `Top` filler.
    locals: Vec<VerificationType>,
    /// Value-wise operand stack.
    stack: Vec<VerificationType>,
}

impl Frame {
    fn stack_slots(&self) -> u16 {
        self.stack.iter().map(VerificationType::width).sum()
    }
}

/// Result of a generation run.
pub struct GeneratedFrames {
    pub max_stack: u16,
    pub max_locals: u16,
    /// The serialized StackMapTable payload (`number_of_entries` + frames),
    /// or `None` when no frame is needed.
    pub frames_payload: Option<Vec<u8>>,
}

/// Join two class names through the resolver, widening to
/// `java/lang/Object` when the hierarchy runs out.
fn common_super(a: &str, b: &str, resolver: &ClassHierarchyResolverFn) -> String {
    const OBJECT: &str = "java/lang/Object";
    if a == b {
        return a.to_string();
    }
    if a == OBJECT || b == OBJECT {
        return OBJECT.to_string();
    }
    // Arrays of the same dimension join component-wise; everything else
    // involving an array joins at Object
    if let (Some(ca), Some(cb)) = (a.strip_prefix('['), b.strip_prefix('[')) {
        let strip = |c: &str| -> Option<String> {
            c.strip_prefix('L').and_then(|c| c.strip_suffix(';')).map(str::to_string)
        };
        return match (strip(ca), strip(cb)) {
            (Some(oa), Some(ob)) => {
                format!("[L{};", common_super(&oa, &ob, resolver))
            }
            _ => OBJECT.to_string(),
        };
    }
    if a.starts_with('[') || b.starts_with('[') {
        return OBJECT.to_string();
    }
    // Interfaces join at Object (assignability to interfaces is checked at
    // run time, not by the verifier)
    let info = |name: &str| resolver(name);
    if info(a).is_some_and(|i| i.is_interface) || info(b).is_some_and(|i| i.is_interface) {
        return OBJECT.to_string();
    }
    let mut a_chain: BTreeSet<String> = BTreeSet::new();
    let mut walk = a.to_string();
    loop {
        a_chain.insert(walk.clone());
        match info(&walk).and_then(|i| i.super_class) {
            Some(super_class) => walk = super_class,
            None => break,
        }
    }
    let mut walk = b.to_string();
    loop {
        if a_chain.contains(&walk) {
            return walk;
        }
        match info(&walk).and_then(|i| i.super_class) {
            Some(super_class) => walk = super_class,
            None => return OBJECT.to_string(),
        }
    }
}

fn join(a: &VerificationType, b: &VerificationType, resolver: &ClassHierarchyResolverFn) -> VerificationType {
    use VerificationType::*;
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Null, other) | (other, Null) if other.is_reference() => other.clone(),
        (Object(a), Object(b)) => Object(common_super(a, b, resolver)),
        _ => Top,
    }
}

struct Generator<'a> {
    code: &'a [u8],
    handlers: &'a [HandlerInfo],
    pool: &'a mut PoolBuilder,
    ctx: &'a MethodContext,
    resolver: ClassHierarchyResolverFn,
    /// Frame-in per interesting bci.
    frames: BTreeMap<u32, Frame>,
    /// Bcis that must receive an emitted frame.
    required: BTreeSet<u32>,
    /// Class created by the `new` instruction at each bci.
    new_classes: BTreeMap<u16, String>,
    worklist: Vec<u32>,
    max_stack: u16,
    max_locals: u16,
    /// The implicit descriptor-derived frame the delta encoding starts
    /// from. Kept pristine: a back edge into bci 0 may widen the recorded
    /// frame there, but never the encoder's baseline.
    entry_units: Vec<VerificationType>,
}

/// Generate frames (and the maxes) for one assembled method body.
///
/// `dead_frame_bcis` are the labels inside patched dead ranges: each gets a
/// frame with no locals and `Throwable` on the stack, matching the
/// `nop* athrow` bytes the assembler put there.
pub fn generate(
    code: &[u8],
    handlers: &[HandlerInfo],
    pool: &mut PoolBuilder,
    ctx: &MethodContext,
    resolver: ClassHierarchyResolverFn,
    dead_frame_bcis: &[u32],
) -> Result<GeneratedFrames> {
    let initial = initial_frame(ctx)?;
    let mut generator = Generator {
        code,
        handlers,
        pool,
        ctx,
        resolver,
        frames: BTreeMap::new(),
        required: BTreeSet::new(),
        new_classes: BTreeMap::new(),
        worklist: vec![],
        max_stack: 0,
        max_locals: initial.locals.len() as u16,
        entry_units: Generator::compress(&initial.locals),
    };
    generator.run(initial, dead_frame_bcis)?;
    generator.emit()
}

fn initial_frame(ctx: &MethodContext) -> Result<Frame> {
    let mut locals = vec![];
    if !ctx.is_static {
        if ctx.is_constructor() && ctx.class_name != "java/lang/Object" {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(ctx.class_name.clone()));
        }
    }
    let descriptor = MethodDescriptor::parse(&ctx.descriptor)?;
    for parameter in &descriptor.parameters {
        let verification_type = VerificationType::of_field_type(parameter);
        let wide = verification_type.width() == 2;
        locals.push(verification_type);
        if wide {
            locals.push(VerificationType::Top);
        }
    }
    Ok(Frame { locals, stack: vec![] })
}

impl<'a> Generator<'a> {
    fn run(&mut self, initial: Frame, dead_frame_bcis: &[u32]) -> Result<()> {
        self.frames.insert(0, initial);
        self.worklist.push(0);
        for &bci in dead_frame_bcis {
            self.frames.insert(
                bci,
                Frame {
                    locals: vec![],
                    stack: vec![VerificationType::Object("java/lang/Throwable".to_string())],
                },
            );
            self.required.insert(bci);
            self.worklist.push(bci);
        }
        for handler in self.handlers {
            self.required.insert(handler.handler_pc as u32);
        }

        let code = self.code;
        while let Some(start) = self.worklist.pop() {
            let mut frame = self.frames[&start].clone();
            let mut bci = start;
            loop {
                let view = ByteView::new(code);
                let mut scratch = LabelContext::new();
                let (insn, size) =
                    instruction::decode(&view, bci as usize, self.pool.pool_id(), &mut scratch)?;
                self.flow_to_handlers(bci, &frame)?;
                let next = bci + size as u32;
                let continues = self.step(&mut frame, &insn, bci)?;
                self.max_stack = self.max_stack.max(frame.stack_slots());
                self.max_locals = self.max_locals.max(frame.locals.len() as u16);

                for target in insn.targets() {
                    let target_bci = scratch.bci(target)?;
                    self.required.insert(target_bci);
                    self.merge_into(target_bci, &frame)?;
                }

                if !continues || !insn.falls_through() {
                    break;
                }
                if next as usize >= self.code.len() {
                    return Err(Error::InvalidCode(format!(
                        "control flow runs off the end of the code array at bci {next}"
                    )));
                }
                // Falling into a join point: merge and let the worklist
                // pick it up
                if self.frames.contains_key(&next) || self.required.contains(&next) {
                    self.merge_into(next, &frame)?;
                    break;
                }
                bci = next;
            }
        }
        Ok(())
    }

    /// The frame on entry to an instruction inside a protected range flows
    /// into the handler with the pending exception as the only stack value.
    fn flow_to_handlers(&mut self, bci: u32, frame: &Frame) -> Result<()> {
        for handler in self.handlers.to_vec() {
            if (handler.start_pc as u32..handler.end_pc as u32).contains(&bci) {
                let handler_frame = Frame {
                    locals: frame.locals.clone(),
                    stack: vec![handler.catch_verification_type()],
                };
                self.max_stack = self.max_stack.max(1);
                self.merge_into(handler.handler_pc as u32, &handler_frame)?;
            }
        }
        Ok(())
    }

    fn merge_into(&mut self, bci: u32, incoming: &Frame) -> Result<()> {
        match self.frames.get(&bci) {
            None => {
                self.frames.insert(bci, incoming.clone());
                self.worklist.push(bci);
            }
            Some(existing) => {
                if existing.stack.len() != incoming.stack.len() {
                    return Err(Error::InvalidCode(format!(
                        "inconsistent operand stack depth at bci {bci} ({} vs {})",
                        existing.stack.len(),
                        incoming.stack.len()
                    )));
                }
                let mut merged = Frame {
                    locals: Vec::with_capacity(existing.locals.len().min(incoming.locals.len())),
                    stack: Vec::with_capacity(existing.stack.len()),
                };
                for (a, b) in existing.locals.iter().zip(incoming.locals.iter()) {
                    merged.locals.push(join(a, b, &self.resolver));
                }
                for (a, b) in existing.stack.iter().zip(incoming.stack.iter()) {
                    let joined = join(a, b, &self.resolver);
                    if joined == VerificationType::Top {
                        return Err(Error::InvalidCode(format!(
                            "inconsistent operand stack types at bci {bci}"
                        )));
                    }
                    merged.stack.push(joined);
                }
                // A slot that lost the second half of a wide pair decays to Top
                for i in 0..merged.locals.len() {
                    if merged.locals[i].width() == 2
                        && merged.locals.get(i + 1) != Some(&VerificationType::Top)
                    {
                        merged.locals[i] = VerificationType::Top;
                    }
                }
                if &merged != self.frames.get(&bci).expect("checked above") {
                    self.frames.insert(bci, merged);
                    self.worklist.push(bci);
                }
            }
        }
        Ok(())
    }

    fn pop(&self, frame: &mut Frame, bci: u32) -> Result<VerificationType> {
        frame.stack.pop().ok_or_else(|| {
            Error::InvalidCode(format!("operand stack underflow at bci {bci}"))
        })
    }

    /// Pop values totalling `slots` slots (for the category-2 stack ops).
    fn pop_slots(&self, frame: &mut Frame, slots: u16, bci: u32) -> Result<Vec<VerificationType>> {
        let mut popped = vec![];
        let mut remaining = slots as i32;
        while remaining > 0 {
            let value = self.pop(frame, bci)?;
            remaining -= value.width() as i32;
            popped.push(value);
        }
        if remaining != 0 {
            return Err(Error::InvalidCode(format!(
                "category-2 stack operation splits a wide value at bci {bci}"
            )));
        }
        popped.reverse();
        Ok(popped)
    }

    fn store_local(frame: &mut Frame, slot: u16, value: VerificationType) {
        let wide = value.width() == 2;
        let needed = slot as usize + if wide { 2 } else { 1 };
        if frame.locals.len() < needed {
            frame.locals.resize(needed, VerificationType::Top);
        }
        // Clobbering the second half of a wide pair kills the first half
        if slot > 0 && frame.locals[slot as usize - 1].width() == 2 {
            frame.locals[slot as usize - 1] = VerificationType::Top;
        }
        frame.locals[slot as usize] = value;
        if wide {
            frame.locals[slot as usize + 1] = VerificationType::Top;
        }
    }

    fn local(&self, frame: &Frame, slot: u16, bci: u32) -> Result<VerificationType> {
        frame.locals.get(slot as usize).cloned().ok_or_else(|| {
            Error::InvalidCode(format!("read of undefined local slot {slot} at bci {bci}"))
        })
    }

    /// Apply one instruction's type effect. Returns `false` when the walk
    /// ends here (return/throw/goto/switch).
    fn step(&mut self, frame: &mut Frame, insn: &Instruction, bci: u32) -> Result<bool> {
        use VerificationType::*;
        match insn {
            Instruction::Nop => {}
            Instruction::ConstantPush(op) => {
                let pushed = match op {
                    Opcode::AConstNull => Null,
                    Opcode::LConst0 | Opcode::LConst1 => Long,
                    Opcode::FConst0 | Opcode::FConst1 | Opcode::FConst2 => Float,
                    Opcode::DConst0 | Opcode::DConst1 => Double,
                    _ => Integer,
                };
                frame.stack.push(pushed);
            }
            Instruction::Push { .. } => frame.stack.push(Integer),
            Instruction::LoadConstant { index, .. } => {
                let pushed = match self.pool.entry(index.index())? {
                    PoolEntry::Integer(_) => Integer,
                    PoolEntry::Float(_) => Float,
                    PoolEntry::Long(_) => Long,
                    PoolEntry::Double(_) => Double,
                    PoolEntry::String { .. } => Object("java/lang/String".to_string()),
                    PoolEntry::Class { .. } => Object("java/lang/Class".to_string()),
                    PoolEntry::MethodHandle { .. } => {
                        Object("java/lang/invoke/MethodHandle".to_string())
                    }
                    PoolEntry::MethodType { .. } => {
                        Object("java/lang/invoke/MethodType".to_string())
                    }
                    PoolEntry::Dynamic { .. } => {
                        let (_, _, descriptor) = self.pool.dynamic_ref(index.index())?;
                        VerificationType::of_descriptor(descriptor)?
                    }
                    other => {
                        return Err(Error::IllegalArgument(format!(
                            "tag-{} entry is not loadable",
                            other.tag()
                        )))
                    }
                };
                frame.stack.push(pushed);
            }
            Instruction::Load { op, slot } => {
                let pushed = match op {
                    Opcode::ILoad => Integer,
                    Opcode::LLoad => Long,
                    Opcode::FLoad => Float,
                    Opcode::DLoad => Double,
                    Opcode::ALoad => self.local(frame, *slot, bci)?,
                    other => {
                        return Err(Error::IllegalArgument(format!(
                            "{} is not a load opcode",
                            other.mnemonic()
                        )))
                    }
                };
                frame.stack.push(pushed);
            }
            Instruction::Store { op, slot } => {
                let value = self.pop(frame, bci)?;
                let stored = match op {
                    Opcode::IStore => Integer,
                    Opcode::LStore => Long,
                    Opcode::FStore => Float,
                    Opcode::DStore => Double,
                    // astore accepts return addresses and uninitialized refs
                    Opcode::AStore => value.clone(),
                    other => {
                        return Err(Error::IllegalArgument(format!(
                            "{} is not a store opcode",
                            other.mnemonic()
                        )))
                    }
                };
                Self::store_local(frame, *slot, stored);
            }
            Instruction::ArrayLoad(op) => {
                let _index = self.pop(frame, bci)?;
                let array = self.pop(frame, bci)?;
                let pushed = match op {
                    Opcode::LALoad => Long,
                    Opcode::DALoad => Double,
                    Opcode::FALoad => Float,
                    Opcode::AALoad => match &array {
                        Object(name) if name.starts_with("[L") => {
                            Object(name[2..name.len() - 1].to_string())
                        }
                        Object(name) if name.starts_with("[[") => Object(name[1..].to_string()),
                        Null => Null,
                        _ => Object("java/lang/Object".to_string()),
                    },
                    _ => Integer,
                };
                frame.stack.push(pushed);
            }
            Instruction::ArrayStore(op) => {
                let value_slots = match op {
                    Opcode::LAStore | Opcode::DAStore => 2,
                    _ => 1,
                };
                self.pop_slots(frame, value_slots, bci)?;
                self.pop(frame, bci)?;
                self.pop(frame, bci)?;
            }
            Instruction::Stack(op) => self.stack_op(frame, *op, bci)?,
            Instruction::Operator(op) => {
                let (pops, pushed) = match op {
                    Opcode::IAdd | Opcode::ISub | Opcode::IMul | Opcode::IDiv | Opcode::IRem
                    | Opcode::IAnd | Opcode::IOr | Opcode::IXor | Opcode::IShl | Opcode::IShr
                    | Opcode::IUShr => (2, Integer),
                    Opcode::FAdd | Opcode::FSub | Opcode::FMul | Opcode::FDiv | Opcode::FRem => {
                        (2, Float)
                    }
                    Opcode::LAdd | Opcode::LSub | Opcode::LMul | Opcode::LDiv | Opcode::LRem
                    | Opcode::LAnd | Opcode::LOr | Opcode::LXor => (2, Long),
                    Opcode::DAdd | Opcode::DSub | Opcode::DMul | Opcode::DDiv | Opcode::DRem => {
                        (2, Double)
                    }
                    Opcode::LShl | Opcode::LShr | Opcode::LUShr => (2, Long),
                    Opcode::INeg => (1, Integer),
                    Opcode::LNeg => (1, Long),
                    Opcode::FNeg => (1, Float),
                    Opcode::DNeg => (1, Double),
                    Opcode::LCmp | Opcode::FCmpL | Opcode::FCmpG | Opcode::DCmpL
                    | Opcode::DCmpG => (2, Integer),
                    Opcode::ArrayLength => (1, Integer),
                    other => {
                        return Err(Error::IllegalArgument(format!(
                            "{} is not an operator opcode",
                            other.mnemonic()
                        )))
                    }
                };
                for _ in 0..pops {
                    self.pop(frame, bci)?;
                }
                frame.stack.push(pushed);
            }
            Instruction::Convert(op) => {
                self.pop(frame, bci)?;
                let pushed = match op {
                    Opcode::I2L | Opcode::F2L | Opcode::D2L => Long,
                    Opcode::I2F | Opcode::L2F | Opcode::D2F => Float,
                    Opcode::I2D | Opcode::L2D | Opcode::F2D => Double,
                    _ => Integer,
                };
                frame.stack.push(pushed);
            }
            Instruction::Increment { slot, .. } => {
                Self::store_local(frame, *slot, Integer);
            }
            Instruction::Branch { op, .. } => {
                match op {
                    Opcode::Goto | Opcode::GotoW => return Ok(false),
                    Opcode::IfICmpEq | Opcode::IfICmpNe | Opcode::IfICmpLt | Opcode::IfICmpGe
                    | Opcode::IfICmpGt | Opcode::IfICmpLe | Opcode::IfACmpEq
                    | Opcode::IfACmpNe => {
                        self.pop(frame, bci)?;
                        self.pop(frame, bci)?;
                    }
                    _ => {
                        self.pop(frame, bci)?;
                    }
                }
            }
            Instruction::TableSwitch { .. } | Instruction::LookupSwitch { .. } => {
                self.pop(frame, bci)?;
                return Ok(false);
            }
            Instruction::Return(_) | Instruction::Throw => return Ok(false),
            Instruction::Field { op, field } => {
                let (_, _, descriptor) = self.pool.member_ref(field.index())?;
                let field_type = VerificationType::of_descriptor(descriptor)?;
                match op {
                    Opcode::GetStatic => frame.stack.push(field_type),
                    Opcode::GetField => {
                        self.pop(frame, bci)?;
                        frame.stack.push(field_type);
                    }
                    Opcode::PutStatic => {
                        self.pop_slots(frame, field_type.width(), bci)?;
                    }
                    Opcode::PutField => {
                        self.pop_slots(frame, field_type.width(), bci)?;
                        self.pop(frame, bci)?;
                    }
                    other => {
                        return Err(Error::IllegalArgument(format!(
                            "{} is not a field opcode",
                            other.mnemonic()
                        )))
                    }
                }
            }
            Instruction::Invoke { op, method } => {
                let (_, name, descriptor) = self.pool.member_ref(method.index())?;
                let name = name.to_string();
                let descriptor = MethodDescriptor::parse(descriptor)?;
                for parameter in descriptor.parameters.iter().rev() {
                    self.pop_slots(frame, parameter.slot_width(), bci)?;
                }
                if *op != Opcode::InvokeStatic {
                    let receiver = self.pop(frame, bci)?;
                    if name == "<init>" {
                        self.initialize(frame, receiver, bci)?;
                    }
                }
                if let Some(return_type) = &descriptor.return_type {
                    frame.stack.push(VerificationType::of_field_type(return_type));
                }
            }
            Instruction::InvokeDynamic { indy } => {
                let (_, _, descriptor) = self.pool.dynamic_ref(indy.index())?;
                let descriptor = MethodDescriptor::parse(descriptor)?;
                for parameter in descriptor.parameters.iter().rev() {
                    self.pop_slots(frame, parameter.slot_width(), bci)?;
                }
                if let Some(return_type) = &descriptor.return_type {
                    frame.stack.push(VerificationType::of_field_type(return_type));
                }
            }
            Instruction::NewObject { class } => {
                let name = self.pool.class_name(class.index())?.to_string();
                self.new_classes.insert(bci as u16, name);
                frame.stack.push(Uninitialized(bci as u16));
            }
            Instruction::NewPrimitiveArray(array_type) => {
                self.pop(frame, bci)?;
                let descriptor = match array_type {
                    ArrayType::Boolean => "[Z",
                    ArrayType::Char => "[C",
                    ArrayType::Float => "[F",
                    ArrayType::Double => "[D",
                    ArrayType::Byte => "[B",
                    ArrayType::Short => "[S",
                    ArrayType::Int => "[I",
                    ArrayType::Long => "[J",
                };
                frame.stack.push(Object(descriptor.to_string()));
            }
            Instruction::NewReferenceArray { component } => {
                self.pop(frame, bci)?;
                let name = self.pool.class_name(component.index())?;
                let array = if name.starts_with('[') {
                    format!("[{name}")
                } else {
                    format!("[L{name};")
                };
                frame.stack.push(Object(array));
            }
            Instruction::NewMultiArray { class, dimensions } => {
                for _ in 0..*dimensions {
                    self.pop(frame, bci)?;
                }
                let name = self.pool.class_name(class.index())?.to_string();
                frame.stack.push(Object(name));
            }
            Instruction::Monitor(_) => {
                self.pop(frame, bci)?;
            }
            Instruction::TypeCheck { op, class } => {
                self.pop(frame, bci)?;
                match op {
                    Opcode::CheckCast => {
                        let name = self.pool.class_name(class.index())?.to_string();
                        frame.stack.push(Object(name));
                    }
                    Opcode::InstanceOf => frame.stack.push(Integer),
                    other => {
                        return Err(Error::IllegalArgument(format!(
                            "{} is not a type check opcode",
                            other.mnemonic()
                        )))
                    }
                }
            }
            Instruction::Jsr { .. } | Instruction::Ret { .. } => {
                return Err(Error::InvalidCode(
                    "jsr/ret cannot appear in code that needs stack map frames".to_string(),
                ))
            }
        }
        Ok(true)
    }

    /// `<init>` turns the receiver's uninitialized type into its real type
    /// everywhere it occurs.
    fn initialize(&self, frame: &mut Frame, receiver: VerificationType, bci: u32) -> Result<()> {
        let initialized = match &receiver {
            VerificationType::UninitializedThis => {
                VerificationType::Object(self.ctx.class_name.clone())
            }
            VerificationType::Uninitialized(offset) => {
                let class = self.new_classes.get(offset).ok_or_else(|| {
                    Error::InvalidCode(format!(
                        "<init> on an uninitialized value with no new at offset {offset}"
                    ))
                })?;
                VerificationType::Object(class.clone())
            }
            _ => {
                return Err(Error::InvalidCode(format!(
                    "<init> receiver at bci {bci} is not an uninitialized value"
                )))
            }
        };
        for slot in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
            if *slot == receiver {
                *slot = initialized.clone();
            }
        }
        Ok(())
    }

    fn stack_op(&mut self, frame: &mut Frame, op: Opcode, bci: u32) -> Result<()> {
        match op {
            Opcode::Pop => {
                self.pop(frame, bci)?;
            }
            Opcode::Pop2 => {
                self.pop_slots(frame, 2, bci)?;
            }
            Opcode::Dup => {
                let a = self.pop(frame, bci)?;
                frame.stack.push(a.clone());
                frame.stack.push(a);
            }
            Opcode::DupX1 => {
                let a = self.pop(frame, bci)?;
                let b = self.pop(frame, bci)?;
                frame.stack.push(a.clone());
                frame.stack.push(b);
                frame.stack.push(a);
            }
            Opcode::DupX2 => {
                let a = self.pop(frame, bci)?;
                let below = self.pop_slots(frame, 2, bci)?;
                frame.stack.push(a.clone());
                frame.stack.extend(below);
                frame.stack.push(a);
            }
            Opcode::Dup2 => {
                let group = self.pop_slots(frame, 2, bci)?;
                frame.stack.extend(group.iter().cloned());
                frame.stack.extend(group);
            }
            Opcode::Dup2X1 => {
                let group = self.pop_slots(frame, 2, bci)?;
                let below = self.pop(frame, bci)?;
                frame.stack.extend(group.iter().cloned());
                frame.stack.push(below);
                frame.stack.extend(group);
            }
            Opcode::Dup2X2 => {
                let group = self.pop_slots(frame, 2, bci)?;
                let below = self.pop_slots(frame, 2, bci)?;
                frame.stack.extend(group.iter().cloned());
                frame.stack.extend(below);
                frame.stack.extend(group);
            }
            Opcode::Swap => {
                let a = self.pop(frame, bci)?;
                let b = self.pop(frame, bci)?;
                frame.stack.push(a);
                frame.stack.push(b);
            }
            other => {
                return Err(Error::IllegalArgument(format!(
                    "{} is not a stack opcode",
                    other.mnemonic()
                )))
            }
        }
        Ok(())
    }

    /// Compress slot-wise locals to the verification-unit list the encoding
    /// uses (a wide type swallows its `Top` filler).
    fn compress(locals: &[VerificationType]) -> Vec<VerificationType> {
        let mut units = vec![];
        let mut i = 0;
        while i < locals.len() {
            let unit = locals[i].clone();
            i += unit.width() as usize;
            units.push(unit);
        }
        units
    }

    fn emit(mut self) -> Result<GeneratedFrames> {
        let mut previous_units = self.entry_units.clone();
        let mut previous_bci: i64 = -1;
        let mut buf = ByteBuf::new();
        let mut count: u16 = 0;

        let required: Vec<u32> = self.required.iter().copied().collect();
        for bci in required {
            let Some(frame) = self.frames.get(&bci).cloned() else {
                // A target that never became reachable (possible only when
                // dead code is kept); there is nothing sound to emit
                continue;
            };
            let units = Self::compress(&frame.locals);
            let offset_delta = (bci as i64 - previous_bci - 1) as u16;
            if frame.stack.is_empty() && units == previous_units {
                if offset_delta <= 63 {
                    buf.write_u1(offset_delta as u8);
                } else {
                    buf.write_u1(251);
                    buf.write_u2(offset_delta);
                }
            } else if frame.stack.len() == 1 && units == previous_units {
                if offset_delta <= 63 {
                    buf.write_u1(64 + offset_delta as u8);
                } else {
                    buf.write_u1(247);
                    buf.write_u2(offset_delta);
                }
                frame.stack[0].encode(self.pool, &mut buf)?;
            } else if frame.stack.is_empty()
                && units.len() < previous_units.len()
                && previous_units.len() - units.len() <= 3
                && previous_units[..units.len()] == units[..]
            {
                let chopped = (previous_units.len() - units.len()) as u8;
                buf.write_u1(251 - chopped);
                buf.write_u2(offset_delta);
            } else if frame.stack.is_empty()
                && units.len() > previous_units.len()
                && units.len() - previous_units.len() <= 3
                && units[..previous_units.len()] == previous_units[..]
            {
                let appended = units.len() - previous_units.len();
                buf.write_u1(251 + appended as u8);
                buf.write_u2(offset_delta);
                for unit in &units[previous_units.len()..] {
                    unit.encode(self.pool, &mut buf)?;
                }
            } else {
                buf.write_u1(255);
                buf.write_u2(offset_delta);
                buf.write_u2(units.len() as u16);
                for unit in &units {
                    unit.encode(self.pool, &mut buf)?;
                }
                buf.write_u2(frame.stack.len() as u16);
                for value in &frame.stack {
                    value.encode(self.pool, &mut buf)?;
                }
            }
            previous_units = units;
            previous_bci = bci as i64;
            count += 1;
        }

        let frames_payload = if count == 0 {
            None
        } else {
            let mut payload = ByteBuf::new();
            payload.write_u2(count);
            payload.write_bytes(buf.as_slice());
            Some(payload.into_vec())
        };
        Ok(GeneratedFrames {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            frames_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::default_resolver;
    use crate::pool::PoolBuilder;

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
    fn straight_line_code_needs_no_frames() {
        let mut pool = PoolBuilder::new();
        // iconst_1; ireturn
        let code = [0x04, 0xAC];
        let generated =
            generate(&code, &[], &mut pool, &ctx("()I", true), default_resolver(), &[]).unwrap();
        assert!(generated.frames_payload.is_none());
        assert_eq!(generated.max_stack, 1);
        assert_eq!(generated.max_locals, 0);
    }

    #[test]
    fn branch_merge_produces_integer_stack_frame() {
        let mut pool = PoolBuilder::new();
        // 0: iload_0; 1: ifeq -> 8; 4: iconst_1; 5: goto -> 9;
        // 8: iconst_0; 9: ireturn
        let code = [0x1A, 0x99, 0x00, 0x07, 0x04, 0xA7, 0x00, 0x04, 0x03, 0xAC];
        let generated =
            generate(&code, &[], &mut pool, &ctx("(I)I", true), default_resolver(), &[]).unwrap();
        let payload = generated.frames_payload.expect("frames required");
        // two frames: SAME at bci 8, SAME_LOCALS_1_STACK_ITEM(Integer) at 9
        assert_eq!(payload[0..2], [0, 2]);
        assert_eq!(payload[2], 8); // SAME, offset_delta 8
        assert_eq!(payload[3], 64); // SAME_LOCALS_1_STACK_ITEM, delta 0
        assert_eq!(payload[4], 1); // ITEM_Integer
        assert_eq!(generated.max_stack, 1);
        assert_eq!(generated.max_locals, 1);
    }

    #[test]
    fn handler_frame_has_the_catch_type_on_the_stack() {
        let mut pool = PoolBuilder::new();
        // 0: iconst_0; 1: pop; 2: return | 3: athrow  (handler over 0..2)
        let code = [0x03, 0x57, 0xB1, 0xBF];
        let handlers = [HandlerInfo {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 3,
            catch_type: None,
        }];
        let generated =
            generate(&code, &handlers, &mut pool, &ctx("()V", true), default_resolver(), &[])
                .unwrap();
        let payload = generated.frames_payload.expect("handler frame");
        assert_eq!(payload[0..2], [0, 1]);
        // SAME_LOCALS_1_STACK_ITEM at bci 3, stack [Throwable]
        assert_eq!(payload[2], 64 + 3);
        assert_eq!(payload[3], 7); // ITEM_Object
        let class_index = u16::from_be_bytes([payload[4], payload[5]]);
        assert_eq!(pool.class_name(class_index).unwrap(), "java/lang/Throwable");
    }

    #[test]
    fn constructor_tracks_uninitialized_this() {
        let mut pool = PoolBuilder::new();
        let init = pool.method_ref("java/lang/Object", "<init>", "()V").unwrap();
        // aload_0; invokespecial Object.<init>; return
        let mut code = vec![0x2A, 0xB7];
        code.extend_from_slice(&init.to_be_bytes());
        code.push(0xB1);
        let mut context = ctx("()V", false);
        context.method_name = "<init>".to_string();
        let generated =
            generate(&code, &[], &mut pool, &context, default_resolver(), &[]).unwrap();
        assert!(generated.frames_payload.is_none());
        assert_eq!(generated.max_stack, 1);
        assert_eq!(generated.max_locals, 1);
    }

    #[test]
    fn join_of_unrelated_classes_widens_to_object() {
        let resolver = default_resolver();
        assert_eq!(common_super("com/a/A", "com/b/B", &resolver), "java/lang/Object");
        assert_eq!(common_super("com/a/A", "com/a/A", &resolver), "com/a/A");
        assert_eq!(
            common_super("[Lcom/a/A;", "[Lcom/b/B;", &resolver),
            "[Ljava/lang/Object;"
        );
        assert_eq!(common_super("[I", "[J", &resolver), "java/lang/Object");
    }

    #[test]
    fn dead_frame_seed_emits_throwable_stack() {
        let mut pool = PoolBuilder::new();
        // return | nop; athrow   (dead range at 1..3 with a frame at 1)
        let code = [0xB1, 0x00, 0xBF];
        let generated =
            generate(&code, &[], &mut pool, &ctx("()V", true), default_resolver(), &[1]).unwrap();
        let payload = generated.frames_payload.expect("dead frame");
        assert_eq!(payload[0..2], [0, 1]);
        // locals are empty like the entry frame, so this is
        // SAME_LOCALS_1_STACK_ITEM with Throwable at offset 1
        assert_eq!(payload[2], 64 + 1);
        assert_eq!(payload[3], 7);
        let class_index = u16::from_be_bytes([payload[4], payload[5]]);
        assert_eq!(pool.class_name(class_index).unwrap(), "java/lang/Throwable");
    }
}
