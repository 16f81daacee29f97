//! Read, construct, and transform JVM class files.
//!
//! Three operations share one representation of instructions, attributes,
//! and constant-pool entries: **parse** wraps a byte buffer in a lazily
//! decoded [`ClassModel`]; **build** drives a [`ClassBuilder`] and
//! assembles bytes; **transform** replays a parsed model through a
//! user-supplied element consumer into a new class, sharing the constant
//! pool where possible.
//!
//! ### Simple example
//!
//! Consider the following Java class:
//!
//! ```java,ignore,no_run
//! public class Point {
//!     public final int x;
//!     public final int y;
//!
//!     public Point(int x, int y) {
//!         this.x = x;
//!         this.y = y;
//!     }
//! }
//! ```
//!
//! Generating an analogous class file:
//!
//! ```
//! use classfile::{Classfile, FieldAccessFlags, MethodAccessFlags, Opcode};
//!
//! # fn main() -> Result<(), classfile::Error> {
//! let classfile = Classfile::new();
//! let bytes = classfile.build("me/alec/Point", |class| {
//!     let field_flags = FieldAccessFlags::PUBLIC | FieldAccessFlags::FINAL;
//!     class.with_field(field_flags, "x", "I", |_| Ok(()))?;
//!     class.with_field(field_flags, "y", "I", |_| Ok(()))?;
//!     class.with_method(MethodAccessFlags::PUBLIC, "<init>", "(II)V", |method| {
//!         method.with_code(|code| {
//!             code.load(Opcode::ALoad, 0)?;
//!             code.invoke(Opcode::InvokeSpecial, "java/lang/Object", "<init>", "()V")?;
//!             code.load(Opcode::ALoad, 0)?;
//!             code.load(Opcode::ILoad, 1)?;
//!             code.field_access(Opcode::PutField, "me/alec/Point", "x", "I")?;
//!             code.load(Opcode::ALoad, 0)?;
//!             code.load(Opcode::ILoad, 2)?;
//!             code.field_access(Opcode::PutField, "me/alec/Point", "y", "I")?;
//!             code.return_(Opcode::Return)
//!         })
//!     })
//! })?;
//!
//! let model = classfile.parse(&bytes)?;
//! assert_eq!(model.this_class()?, "me/alec/Point");
//! assert_eq!(model.fields().len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! Rewriting a class is a matter of re-emitting its elements:
//!
//! ```
//! use classfile::{transform, Classfile};
//! # fn rewrite(bytes: &[u8]) -> Result<Vec<u8>, classfile::Error> {
//! let classfile = Classfile::new();
//! let model = classfile.parse(bytes)?;
//! classfile.transform(&model, transform::identity_class())
//! # }
//! ```

mod access_flags;
mod attribute;
mod builder;
mod bytes;
mod code;
mod descriptor;
mod error;
mod model;
mod mutf8;
mod options;
mod pool;
pub mod transform;

pub use access_flags::{
    ClassAccessFlags, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags,
};
pub use attribute::{
    Attribute, AttributeLocation, AttributeMapperFn, BootstrapMethod, ConstantValue,
    InnerClassInfo,
};
pub use builder::{ClassBuilder, ClassElement, CodeBuilder, FieldBuilder, MethodBuilder};
pub use bytes::{ByteBuf, ByteView, Mark};
pub use code::assembler::LocalVariableInfo;
pub use code::code_model::{CodeModel, ExceptionTableEntry};
pub use code::stackmap::VerificationType;
pub use code::{ArrayType, CodeElement, Instruction, Label, LabelContext, MethodContext, Opcode};
pub use descriptor::{BaseType, FieldType, MethodDescriptor};
pub use error::{Error, Result};
pub use model::{ClassModel, FieldModel, MethodModel};
pub use mutf8::{decode as decode_modified_utf8, encode as encode_modified_utf8};
pub use options::{
    ClassHierarchyInfo, ClassHierarchyResolverFn, DeadCodeOption, DeadLabelsOption,
    DebugElementsOption, LineNumbersOption, Options, PoolSharingOption, ShortJumpsOption,
    StackMapsOption, UnknownAttributesOption,
};
pub use pool::{BoundPool, HandleKind, PoolBuilder, PoolEntry, PoolIndex, PoolRead};
pub use transform::{ClassTransformFn, CodeTransformFn};

use options::PoolSharingOption as Sharing;

/// The entry point: an immutable bundle of processing options.
///
/// Cheap to clone; every `with_*` method returns a fresh value, so a
/// configured instance can be shared and reused across any number of
/// parse/build/transform calls.
#[derive(Clone, Default)]
pub struct Classfile {
    options: Options,
}

impl Classfile {
    /// Default options: stack maps when required, debug and line numbers
    /// passed through, unknown attributes retained, shared pools, short
    /// jumps fixed, dead code patched, dead labels fatal.
    pub fn new() -> Classfile {
        Classfile { options: Options::default() }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn with_stack_maps(mut self, value: StackMapsOption) -> Classfile {
        self.options.stack_maps = value;
        self
    }

    pub fn with_debug_elements(mut self, value: DebugElementsOption) -> Classfile {
        self.options.debug_elements = value;
        self
    }

    pub fn with_line_numbers(mut self, value: LineNumbersOption) -> Classfile {
        self.options.line_numbers = value;
        self
    }

    pub fn with_unknown_attributes(mut self, value: UnknownAttributesOption) -> Classfile {
        self.options.unknown_attributes = value;
        self
    }

    pub fn with_constant_pool_sharing(mut self, value: PoolSharingOption) -> Classfile {
        self.options.constant_pool_sharing = value;
        self
    }

    pub fn with_short_jumps(mut self, value: ShortJumpsOption) -> Classfile {
        self.options.short_jumps = value;
        self
    }

    pub fn with_dead_code(mut self, value: DeadCodeOption) -> Classfile {
        self.options.dead_code = value;
        self
    }

    pub fn with_dead_labels(mut self, value: DeadLabelsOption) -> Classfile {
        self.options.dead_labels = value;
        self
    }

    pub fn with_class_hierarchy_resolver(mut self, value: ClassHierarchyResolverFn) -> Classfile {
        self.options.class_hierarchy_resolver = value;
        self
    }

    pub fn with_attribute_mapper(mut self, value: AttributeMapperFn) -> Classfile {
        self.options.attribute_mapper = Some(value);
        self
    }

    /// Parse a classfile. Cheap: the buffer is copied and scanned for
    /// section boundaries; pool entries, attributes, and code decode on
    /// first access.
    pub fn parse(&self, bytes: &[u8]) -> Result<ClassModel> {
        ClassModel::parse(bytes.to_vec(), self.options.clone())
    }

    /// Build a class from scratch with a fresh constant pool.
    pub fn build(
        &self,
        this_class: &str,
        handler: impl FnOnce(&mut ClassBuilder) -> Result<()>,
    ) -> Result<Vec<u8>> {
        self.build_with_pool(this_class, PoolBuilder::new(), handler)
    }

    /// Build a class against a caller-provided pool (for example one
    /// mirrored from another class with [`PoolBuilder::from_pool`]).
    pub fn build_with_pool(
        &self,
        this_class: &str,
        pool: PoolBuilder,
        handler: impl FnOnce(&mut ClassBuilder) -> Result<()>,
    ) -> Result<Vec<u8>> {
        builder::build_class(self.options.clone(), this_class, pool, None, handler)
    }

    /// Re-emit `model` through `transform` and serialize the result.
    pub fn transform(
        &self,
        model: &ClassModel,
        transform: ClassTransformFn<'_>,
    ) -> Result<Vec<u8>> {
        let name = model.this_class()?.to_string();
        self.transform_renamed(model, &name, transform)
    }

    /// Like [`Classfile::transform`], with the output class renamed.
    pub fn transform_renamed(
        &self,
        model: &ClassModel,
        new_name: &str,
        transform: ClassTransformFn<'_>,
    ) -> Result<Vec<u8>> {
        let pool = match self.options.constant_pool_sharing {
            Sharing::Shared => PoolBuilder::from_pool(model.pool())?,
            Sharing::New => PoolBuilder::new(),
        };
        let mut class_builder = ClassBuilder::new(
            self.options.clone(),
            new_name,
            pool,
            Some(model.shared_pool()),
        );
        builder::replay_class(model, &mut class_builder, transform)?;
        class_builder.finish()
    }
}
