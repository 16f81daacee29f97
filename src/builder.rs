//! Builders: the writing half of the element protocol.
//!
//! A [`ClassBuilder`] owns the output constant pool and is consumed exactly
//! once. Member builders borrow it; a [`CodeBuilder`] buffers code elements
//! (with its own label context) and hands them to the assembler when the
//! body is finished. Elements decoded from a model can be re-emitted into
//! any builder: pool references are re-homed through the pool's ownership
//! tags, and labels from the model's context are mapped to fresh local
//! labels on first sight.

use crate::access_flags::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use crate::attribute::Attribute;
use crate::bytes::ByteBuf;
use crate::code::assembler::{assemble, AssembledCode};
use crate::code::code_model::CodeModel;
use crate::code::instruction::Instruction;
use crate::code::label::{Label, LabelContext};
use crate::code::opcode::Opcode;
use crate::code::{CodeElement, MethodContext};
use crate::error::{Error, Result};
use crate::model::{ClassModel, FieldModel, MethodModel};
use crate::options::Options;
use crate::pool::{BoundPool, PoolBuilder, PoolRead};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Default version for freshly built classes (Java 8, the floor most tools
/// still target).
pub const DEFAULT_MAJOR_VERSION: u16 = 52;

/// One element of a class stream, mirroring the classfile sections.
pub enum ClassElement<'m> {
    Version { minor: u16, major: u16 },
    Flags(ClassAccessFlags),
    /// `None` only for `java/lang/Object` itself.
    Superclass(Option<String>),
    Interface(String),
    Field(&'m FieldModel),
    Method(&'m MethodModel),
    Attribute(Attribute),
}

pub(crate) struct BuiltField {
    pub flags: FieldAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<Attribute>,
}

pub(crate) struct BuiltMethod {
    pub flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<Attribute>,
    pub code: Option<AssembledCode>,
}

/// Push an attribute honoring the "does not permit multiple" rule: a later
/// singleton replaces an earlier one of the same name.
fn push_attribute(attributes: &mut Vec<Attribute>, attribute: Attribute) {
    if attribute.singleton() {
        attributes.retain(|existing| existing.name() != attribute.name());
    }
    attributes.push(attribute);
}

pub struct ClassBuilder {
    options: Options,
    pool: PoolBuilder,
    /// Pool of the model being transformed, for re-homing foreign indices.
    source: Option<Rc<BoundPool>>,
    minor: u16,
    major: u16,
    flags: ClassAccessFlags,
    this_class: String,
    super_class: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<BuiltField>,
    methods: Vec<BuiltMethod>,
    attributes: Vec<Attribute>,
}

impl ClassBuilder {
    pub(crate) fn new(
        options: Options,
        this_class: &str,
        pool: PoolBuilder,
        source: Option<Rc<BoundPool>>,
    ) -> ClassBuilder {
        ClassBuilder {
            options,
            pool,
            source,
            minor: 0,
            major: DEFAULT_MAJOR_VERSION,
            flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            this_class: this_class.to_string(),
            super_class: Some("java/lang/Object".to_string()),
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        }
    }

    pub fn set_version(&mut self, major: u16, minor: u16) {
        self.major = major;
        self.minor = minor;
    }

    pub fn set_flags(&mut self, flags: ClassAccessFlags) {
        self.flags = flags;
    }

    pub fn set_super_class(&mut self, super_class: Option<&str>) {
        self.super_class = super_class.map(str::to_string);
    }

    pub fn add_interface(&mut self, interface: &str) {
        self.interfaces.push(interface.to_string());
    }

    pub fn with_attribute(&mut self, attribute: Attribute) {
        push_attribute(&mut self.attributes, attribute);
    }

    /// The pool the class is being built against.
    pub fn constant_pool(&mut self) -> &mut PoolBuilder {
        &mut self.pool
    }

    pub fn with_field(
        &mut self,
        flags: FieldAccessFlags,
        name: &str,
        descriptor: &str,
        handler: impl FnOnce(&mut FieldBuilder) -> Result<()>,
    ) -> Result<()> {
        let mut builder = FieldBuilder {
            field: BuiltField {
                flags,
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                attributes: vec![],
            },
        };
        handler(&mut builder)?;
        self.fields.push(builder.field);
        Ok(())
    }

    pub fn with_method(
        &mut self,
        flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        handler: impl FnOnce(&mut MethodBuilder<'_>) -> Result<()>,
    ) -> Result<()> {
        let mut builder = MethodBuilder {
            flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            attributes: vec![],
            code: None,
            options: self.options.clone(),
            major: self.major,
            this_class: self.this_class.clone(),
            pool: &mut self.pool,
            source: self.source.clone(),
        };
        handler(&mut builder)?;
        let built = BuiltMethod {
            flags: builder.flags,
            name: builder.name,
            descriptor: builder.descriptor,
            attributes: builder.attributes,
            code: builder.code,
        };
        self.methods.push(built);
        Ok(())
    }

    /// Consume one class element; the default transform behavior is exactly
    /// one call to this per element.
    pub fn with(&mut self, element: &ClassElement<'_>) -> Result<()> {
        match element {
            ClassElement::Version { minor, major } => self.set_version(*major, *minor),
            ClassElement::Flags(flags) => self.set_flags(*flags),
            ClassElement::Superclass(super_class) => {
                self.super_class = super_class.clone();
            }
            ClassElement::Interface(interface) => self.interfaces.push(interface.clone()),
            ClassElement::Attribute(attribute) => self.with_attribute(attribute.clone()),
            ClassElement::Field(model) => self.add_field_from_model(model)?,
            ClassElement::Method(model) => self.add_method_from_model(model, None)?,
        }
        Ok(())
    }

    fn add_field_from_model(&mut self, model: &FieldModel) -> Result<()> {
        let mut attributes = vec![];
        for attribute in model.attributes()? {
            push_attribute(&mut attributes, attribute.clone());
        }
        self.fields.push(BuiltField {
            flags: model.flags(),
            name: model.name()?.to_string(),
            descriptor: model.descriptor()?.to_string(),
            attributes,
        });
        Ok(())
    }

    /// Re-emit a method from a model, optionally routing its code elements
    /// through a transform.
    pub(crate) fn add_method_from_model(
        &mut self,
        model: &MethodModel,
        mut code_transform: Option<&mut crate::transform::CodeTransformFn<'_>>,
    ) -> Result<()> {
        let flags = model.flags();
        let name = model.name()?.to_string();
        let descriptor = model.descriptor()?.to_string();
        self.with_method(flags, &name, &descriptor, |method| {
            for attribute in model.attributes()? {
                push_attribute(&mut method.attributes, attribute.clone());
            }
            if let Some(code) = model.code()? {
                match code_transform.as_deref_mut() {
                    None => method.with_code(|builder| {
                        for element in code.elements()? {
                            builder.with(element)?;
                        }
                        Ok(())
                    })?,
                    Some(transform) => method.transform_code(code, transform)?,
                }
            }
            Ok(())
        })
    }

    /// Serialize. The pool is written last into the header position, since
    /// encoding the body is what fills it.
    pub(crate) fn finish(mut self) -> Result<Vec<u8>> {
        let mut body = ByteBuf::new();
        let source = self.source.clone();
        let source_read = source.as_deref().map(|pool| pool as &dyn PoolRead);

        body.write_u2(self.flags.bits());
        let this_class = self.pool.class(&self.this_class)?;
        body.write_u2(this_class);
        let super_class = match &self.super_class {
            Some(name) => self.pool.class(name)?,
            None => {
                if self.this_class != "java/lang/Object" {
                    return Err(Error::IllegalArgument(
                        "only java/lang/Object may omit a superclass".to_string(),
                    ));
                }
                0
            }
        };
        body.write_u2(super_class);
        body.write_u2(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            let index = self.pool.class(interface)?;
            body.write_u2(index);
        }

        body.write_u2(self.fields.len() as u16);
        for field in &self.fields {
            let name = PoolBuilder::utf8(&mut self.pool, &field.name)?;
            let descriptor = PoolBuilder::utf8(&mut self.pool, &field.descriptor)?;
            body.write_u2(field.flags.bits());
            body.write_u2(name);
            body.write_u2(descriptor);
            body.write_u2(field.attributes.len() as u16);
            for attribute in &field.attributes {
                attribute.encode(&mut self.pool, source_read, &mut body)?;
            }
        }

        body.write_u2(self.methods.len() as u16);
        for method in &self.methods {
            let name = PoolBuilder::utf8(&mut self.pool, &method.name)?;
            let descriptor = PoolBuilder::utf8(&mut self.pool, &method.descriptor)?;
            body.write_u2(method.flags.bits());
            body.write_u2(name);
            body.write_u2(descriptor);
            let attribute_count = method.attributes.len() + usize::from(method.code.is_some());
            body.write_u2(attribute_count as u16);
            if let Some(code) = &method.code {
                code.encode(&mut self.pool, &mut body)?;
            }
            for attribute in &method.attributes {
                attribute.encode(&mut self.pool, source_read, &mut body)?;
            }
        }

        body.write_u2(self.attributes.len() as u16);
        for attribute in &self.attributes {
            attribute.encode(&mut self.pool, source_read, &mut body)?;
        }

        let mut out = ByteBuf::with_capacity(body.len() + 1024);
        out.write_u4(0xCAFE_BABE);
        out.write_u2(self.minor);
        out.write_u2(self.major);
        self.pool.encode(&mut out)?;
        out.write_bytes(body.as_slice());
        Ok(out.into_vec())
    }
}

pub struct FieldBuilder {
    field: BuiltField,
}

impl FieldBuilder {
    pub fn with_attribute(&mut self, attribute: Attribute) {
        push_attribute(&mut self.field.attributes, attribute);
    }
}

pub struct MethodBuilder<'a> {
    flags: MethodAccessFlags,
    name: String,
    descriptor: String,
    attributes: Vec<Attribute>,
    code: Option<AssembledCode>,
    options: Options,
    major: u16,
    this_class: String,
    pool: &'a mut PoolBuilder,
    source: Option<Rc<BoundPool>>,
}

impl<'a> MethodBuilder<'a> {
    pub fn with_attribute(&mut self, attribute: Attribute) {
        push_attribute(&mut self.attributes, attribute);
    }

    fn method_context(&self) -> MethodContext {
        MethodContext {
            class_name: self.this_class.clone(),
            method_name: self.name.clone(),
            descriptor: self.descriptor.clone(),
            is_static: self.flags.contains(MethodAccessFlags::STATIC),
            major_version: self.major,
        }
    }

    /// Build the method body. The handler emits elements into a buffered
    /// [`CodeBuilder`]; when it returns, the assembler runs.
    pub fn with_code(
        &mut self,
        handler: impl FnOnce(&mut CodeBuilder<'_>) -> Result<()>,
    ) -> Result<()> {
        let ctx = self.method_context();
        let mut builder = CodeBuilder {
            elements: vec![],
            labels: LabelContext::new(),
            foreign: FxHashMap::default(),
            pool: &mut *self.pool,
        };
        handler(&mut builder)?;
        let CodeBuilder { elements, mut labels, .. } = builder;
        let source_read = self.source.as_deref().map(|pool| pool as &dyn PoolRead);
        self.code = Some(assemble(
            &elements,
            &mut labels,
            self.pool,
            source_read,
            &self.options,
            &ctx,
        )?);
        Ok(())
    }

    /// Stage a model's code through a transform into this method.
    pub fn transform_code(
        &mut self,
        code: &CodeModel,
        transform: &mut crate::transform::CodeTransformFn<'_>,
    ) -> Result<()> {
        self.with_code(|builder| {
            for element in code.elements()? {
                transform(builder, element)?;
            }
            Ok(())
        })
    }
}

/// Buffered code builder: an element list plus a local label context.
///
/// Buffering is what lets a transform reference a label before the element
/// that binds it has been emitted; nothing is laid out until the whole body
/// is present.
pub struct CodeBuilder<'a> {
    elements: Vec<CodeElement>,
    labels: LabelContext,
    /// Foreign (model-context) label to local label.
    foreign: FxHashMap<Label, Label>,
    pool: &'a mut PoolBuilder,
}

impl<'a> CodeBuilder<'a> {
    /// A fresh unbound label in this builder's context.
    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    /// Bind `label` at the current position.
    pub fn bind(&mut self, label: Label) -> Result<()> {
        let element = CodeElement::Label(label);
        self.with(&element)
    }

    fn map_label(&mut self, label: Label) -> Label {
        if self.labels.owns(label) {
            return label;
        }
        if let Some(local) = self.foreign.get(&label) {
            return *local;
        }
        let local = self.labels.new_label();
        self.foreign.insert(label, local);
        local
    }

    fn map_instruction(&mut self, insn: &Instruction) -> Instruction {
        match insn {
            Instruction::Branch { op, target } => {
                Instruction::Branch { op: *op, target: self.map_label(*target) }
            }
            Instruction::Jsr { op, target } => {
                Instruction::Jsr { op: *op, target: self.map_label(*target) }
            }
            Instruction::TableSwitch { low, high, default, targets } => Instruction::TableSwitch {
                low: *low,
                high: *high,
                default: self.map_label(*default),
                targets: targets.iter().map(|t| self.map_label(*t)).collect(),
            },
            Instruction::LookupSwitch { default, pairs } => Instruction::LookupSwitch {
                default: self.map_label(*default),
                pairs: pairs.iter().map(|(k, t)| (*k, self.map_label(*t))).collect(),
            },
            other => other.clone(),
        }
    }

    /// Consume one element, re-homing foreign labels.
    pub fn with(&mut self, element: &CodeElement) -> Result<()> {
        let mapped = match element {
            CodeElement::Instruction(insn) => {
                CodeElement::Instruction(self.map_instruction(insn))
            }
            CodeElement::Label(label) => CodeElement::Label(self.map_label(*label)),
            CodeElement::ExceptionCatch { start, end, handler, catch_type } => {
                CodeElement::ExceptionCatch {
                    start: self.map_label(*start),
                    end: self.map_label(*end),
                    handler: self.map_label(*handler),
                    catch_type: catch_type.clone(),
                }
            }
            CodeElement::LocalVariable { start, end, name, descriptor, slot } => {
                CodeElement::LocalVariable {
                    start: self.map_label(*start),
                    end: self.map_label(*end),
                    name: name.clone(),
                    descriptor: descriptor.clone(),
                    slot: *slot,
                }
            }
            CodeElement::LocalVariableType { start, end, name, signature, slot } => {
                CodeElement::LocalVariableType {
                    start: self.map_label(*start),
                    end: self.map_label(*end),
                    name: name.clone(),
                    signature: signature.clone(),
                    slot: *slot,
                }
            }
            other => other.clone(),
        };
        self.elements.push(mapped);
        Ok(())
    }

    /// Run `f` with this builder while capturing everything it emits,
    /// without laying anything out. The captured elements share this
    /// builder's labels, so they can be replayed into it afterwards. This is
    /// what transform chaining is built on.
    pub(crate) fn stage(
        &mut self,
        f: impl FnOnce(&mut CodeBuilder<'_>) -> Result<()>,
    ) -> Result<Vec<CodeElement>> {
        let parked = std::mem::take(&mut self.elements);
        let result = f(self);
        let staged = std::mem::replace(&mut self.elements, parked);
        result?;
        Ok(staged)
    }

    // --- convenience emitters, thin wrappers over `with` ---------------

    pub fn instruction(&mut self, insn: Instruction) -> Result<()> {
        let element = CodeElement::Instruction(insn);
        self.with(&element)
    }

    /// Load an int constant using the shortest form.
    pub fn const_int(&mut self, value: i32) -> Result<()> {
        let insn = match value {
            -1 => Instruction::ConstantPush(Opcode::IConstM1),
            0 => Instruction::ConstantPush(Opcode::IConst0),
            1 => Instruction::ConstantPush(Opcode::IConst1),
            2 => Instruction::ConstantPush(Opcode::IConst2),
            3 => Instruction::ConstantPush(Opcode::IConst3),
            4 => Instruction::ConstantPush(Opcode::IConst4),
            5 => Instruction::ConstantPush(Opcode::IConst5),
            v if i8::try_from(v).is_ok() => Instruction::Push { op: Opcode::Bipush, value: v },
            v if i16::try_from(v).is_ok() => Instruction::Push { op: Opcode::Sipush, value: v },
            v => {
                let index = self.pool.integer(v)?;
                Instruction::LoadConstant { op: Opcode::Ldc, index: self.pool.index_of(index) }
            }
        };
        self.instruction(insn)
    }

    pub fn const_string(&mut self, value: &str) -> Result<()> {
        let index = self.pool.string(value)?;
        let index = self.pool.index_of(index);
        self.instruction(Instruction::LoadConstant { op: Opcode::Ldc, index })
    }

    pub fn const_long(&mut self, value: i64) -> Result<()> {
        let index = self.pool.long(value)?;
        let index = self.pool.index_of(index);
        self.instruction(Instruction::LoadConstant { op: Opcode::Ldc2W, index })
    }

    pub fn const_float(&mut self, value: f32) -> Result<()> {
        let index = self.pool.float(value)?;
        let index = self.pool.index_of(index);
        self.instruction(Instruction::LoadConstant { op: Opcode::Ldc, index })
    }

    pub fn const_double(&mut self, value: f64) -> Result<()> {
        let index = self.pool.double(value)?;
        let index = self.pool.index_of(index);
        self.instruction(Instruction::LoadConstant { op: Opcode::Ldc2W, index })
    }

    pub fn load(&mut self, op: Opcode, slot: u16) -> Result<()> {
        self.instruction(Instruction::Load { op, slot })
    }

    pub fn store(&mut self, op: Opcode, slot: u16) -> Result<()> {
        self.instruction(Instruction::Store { op, slot })
    }

    pub fn field_access(
        &mut self,
        op: Opcode,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<()> {
        let index = self.pool.field_ref(class, name, descriptor)?;
        let field = self.pool.index_of(index);
        self.instruction(Instruction::Field { op, field })
    }

    pub fn invoke(&mut self, op: Opcode, class: &str, name: &str, descriptor: &str) -> Result<()> {
        let index = if op == Opcode::InvokeInterface {
            self.pool.interface_method_ref(class, name, descriptor)?
        } else {
            self.pool.method_ref(class, name, descriptor)?
        };
        let method = self.pool.index_of(index);
        self.instruction(Instruction::Invoke { op, method })
    }

    pub fn new_object(&mut self, class: &str) -> Result<()> {
        let index = self.pool.class(class)?;
        let class = self.pool.index_of(index);
        self.instruction(Instruction::NewObject { class })
    }

    pub fn check_cast(&mut self, class: &str) -> Result<()> {
        let index = self.pool.class(class)?;
        let class = self.pool.index_of(index);
        self.instruction(Instruction::TypeCheck { op: Opcode::CheckCast, class })
    }

    pub fn branch(&mut self, op: Opcode, target: Label) -> Result<()> {
        self.instruction(Instruction::Branch { op, target })
    }

    pub fn goto(&mut self, target: Label) -> Result<()> {
        self.branch(Opcode::Goto, target)
    }

    pub fn return_(&mut self, op: Opcode) -> Result<()> {
        self.instruction(Instruction::Return(op))
    }

    pub fn throw(&mut self) -> Result<()> {
        self.instruction(Instruction::Throw)
    }

    pub fn nop(&mut self) -> Result<()> {
        self.instruction(Instruction::Nop)
    }

    pub fn line_number(&mut self, line: u16) -> Result<()> {
        let element = CodeElement::LineNumber { line };
        self.with(&element)
    }

    pub fn exception_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Result<()> {
        let element = CodeElement::ExceptionCatch {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_string),
        };
        self.with(&element)
    }

    /// The pool code is being assembled against, for interning operands by
    /// hand.
    pub fn constant_pool(&mut self) -> &mut PoolBuilder {
        self.pool
    }
}

/// Build a class from scratch against a given pool.
pub(crate) fn build_class(
    options: Options,
    this_class: &str,
    pool: PoolBuilder,
    source: Option<Rc<BoundPool>>,
    handler: impl FnOnce(&mut ClassBuilder) -> Result<()>,
) -> Result<Vec<u8>> {
    let mut builder = ClassBuilder::new(options, this_class, pool, source);
    handler(&mut builder)?;
    builder.finish()
}

/// Emit every element of `model` through `builder.with`, routing them
/// through `transform` when one is given.
pub(crate) fn replay_class(
    model: &ClassModel,
    builder: &mut ClassBuilder,
    mut transform: crate::transform::ClassTransformFn<'_>,
) -> Result<()> {
    let mut emit = |builder: &mut ClassBuilder, element: &ClassElement<'_>| -> Result<()> {
        transform(builder, element)
    };
    emit(
        builder,
        &ClassElement::Version { minor: model.minor_version(), major: model.major_version() },
    )?;
    emit(builder, &ClassElement::Flags(model.flags()))?;
    emit(builder, &ClassElement::Superclass(model.super_class()?.map(str::to_string)))?;
    for interface in model.interfaces()? {
        emit(builder, &ClassElement::Interface(interface.to_string()))?;
    }
    for field in model.fields() {
        emit(builder, &ClassElement::Field(field))?;
    }
    for method in model.methods() {
        emit(builder, &ClassElement::Method(method))?;
    }
    for attribute in model.attributes()? {
        emit(builder, &ClassElement::Attribute(attribute.clone()))?;
    }
    Ok(())
}
