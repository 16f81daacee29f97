//! Processing options.
//!
//! An immutable record consumed by parse/build/transform; the facade's
//! `with_*` methods return a fresh value. Each option family is a small
//! closed enum, except for the two injected functions (class hierarchy
//! resolution and custom attribute mapping).

use crate::attribute::AttributeMapperFn;
use std::rc::Rc;

/// Whether to generate `StackMapTable` attributes when assembling code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StackMapsOption {
    /// Generate for class files of major version 50+.
    WhenRequired,
    /// Generate regardless of version.
    Generate,
    /// Never generate.
    Drop,
}

/// Whether `LocalVariableTable`/`LocalVariableTypeTable` pass through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DebugElementsOption {
    Pass,
    Drop,
}

/// Whether `LineNumberTable` entries pass through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineNumbersOption {
    Pass,
    Drop,
}

/// Disposition of attributes with unrecognized names.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnknownAttributesOption {
    /// Retain the raw bytes and re-emit them.
    Pass,
    Drop,
}

/// How `transform` seeds the output constant pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolSharingOption {
    /// Mirror the source pool so unchanged indices survive.
    Shared,
    /// Start empty and re-intern everything referenced.
    New,
}

/// What to do with a branch whose offset does not fit in 16 bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShortJumpsOption {
    /// Rewrite to the wide form (`goto_w`, or inverted condition plus
    /// `goto_w`).
    Fix,
    Fail,
}

/// What to do with unreachable instructions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeadCodeOption {
    /// Overwrite dead ranges with `nop ... athrow` and emit a Throwable
    /// frame at each dead label.
    Patch,
    Keep,
    Fail,
}

/// What to do with a label that is referenced but never bound.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeadLabelsOption {
    Fail,
    /// Drop the referencing element instead.
    Drop,
}

/// What the hierarchy resolver knows about one class.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassHierarchyInfo {
    /// `None` only for `java/lang/Object`.
    pub super_class: Option<String>,
    pub is_interface: bool,
}

/// Injected resolver: binary class name to hierarchy info, `None` when the
/// class is unknown (joins then fall back to `java/lang/Object`).
pub type ClassHierarchyResolverFn = Rc<dyn Fn(&str) -> Option<ClassHierarchyInfo>>;

#[derive(Clone)]
pub struct Options {
    pub stack_maps: StackMapsOption,
    pub debug_elements: DebugElementsOption,
    pub line_numbers: LineNumbersOption,
    pub unknown_attributes: UnknownAttributesOption,
    pub constant_pool_sharing: PoolSharingOption,
    pub short_jumps: ShortJumpsOption,
    pub dead_code: DeadCodeOption,
    pub dead_labels: DeadLabelsOption,
    pub class_hierarchy_resolver: ClassHierarchyResolverFn,
    pub attribute_mapper: Option<AttributeMapperFn>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_maps: StackMapsOption::WhenRequired,
            debug_elements: DebugElementsOption::Pass,
            line_numbers: LineNumbersOption::Pass,
            unknown_attributes: UnknownAttributesOption::Pass,
            constant_pool_sharing: PoolSharingOption::Shared,
            short_jumps: ShortJumpsOption::Fix,
            dead_code: DeadCodeOption::Patch,
            dead_labels: DeadLabelsOption::Fail,
            class_hierarchy_resolver: default_resolver(),
            attribute_mapper: None,
        }
    }
}

/// The built-in resolver knows only `java/lang/Object`; everything else is
/// unknown, which makes joins widen to Object.
pub fn default_resolver() -> ClassHierarchyResolverFn {
    Rc::new(|name: &str| {
        (name == "java/lang/Object")
            .then(|| ClassHierarchyInfo { super_class: None, is_interface: false })
    })
}
