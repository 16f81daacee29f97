//! Structural views over a parsed classfile buffer.
//!
//! Parsing walks the buffer once to find section boundaries (the pool entry
//! table and the field/method/attribute spans); everything behind those
//! boundaries — pool entries, attribute payloads, method code — decodes
//! lazily on first access and is memoized in single-assignment slots. The
//! buffer is shared (`Rc`) between the root model and its sub-models, so a
//! sub-model can outlive none of the data it points into.

use crate::access_flags::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use crate::attribute::{decode_attribute, Attribute, AttributeLocation, Decoded};
use crate::bytes::ByteView;
use crate::code::code_model::CodeModel;
use crate::error::{Error, Result};
use crate::options::{Options, UnknownAttributesOption};
use crate::pool::{BoundPool, PoolRead};
use std::cell::OnceCell;
use std::rc::Rc;

/// Classfile versions this crate understands (Java 1.0 through 22).
pub const MIN_MAJOR_VERSION: u16 = 45;
pub const MAX_MAJOR_VERSION: u16 = 66;

/// Major version from which `StackMapTable` attributes are required.
pub const STACK_MAPS_REQUIRED_MAJOR: u16 = 50;

/// Location and name of one not-yet-decoded `attribute_info`.
#[derive(Clone, Debug)]
pub(crate) struct AttrSpan {
    pub name_index: u16,
    /// Offset of the `info` payload within the buffer.
    pub start: usize,
    pub len: usize,
}

/// Scan an `attributes_count + attribute_info[]` region, returning the spans
/// and the offset just past it.
pub(crate) fn scan_attributes(view: &ByteView<'_>, at: usize) -> Result<(Vec<AttrSpan>, usize)> {
    let count = view.u2(at)? as usize;
    let mut spans = Vec::with_capacity(count);
    let mut at = at + 2;
    for _ in 0..count {
        let name_index = view.u2(at)?;
        let len = view.u4(at + 2)? as usize;
        let start = at + 6;
        view.read_bytes(start, len)?;
        spans.push(AttrSpan { name_index, start, len });
        at = start + len;
    }
    Ok((spans, at))
}

/// Decode a span list against the pool, applying the unknown-attribute
/// policy and the advisory location restriction.
pub(crate) fn decode_spans(
    data: &[u8],
    pool: &BoundPool,
    options: &Options,
    spans: &[AttrSpan],
    location: AttributeLocation,
) -> Result<Vec<Attribute>> {
    let mut attributes = Vec::with_capacity(spans.len());
    for span in spans {
        let name = pool.utf8(span.name_index)?;
        let bytes = &data[span.start..span.start + span.len];
        let pass_unknown = options.unknown_attributes == UnknownAttributesOption::Pass;
        match decode_attribute(
            name,
            bytes,
            pool,
            location,
            pass_unknown,
            options.attribute_mapper.as_ref(),
        )? {
            Decoded::Keep(attribute) => attributes.push(attribute),
            Decoded::Dropped => {}
        }
    }
    Ok(attributes)
}

pub struct FieldModel {
    data: Rc<[u8]>,
    pool: Rc<BoundPool>,
    options: Options,
    flags: FieldAccessFlags,
    name_index: u16,
    descriptor_index: u16,
    attr_spans: Vec<AttrSpan>,
    attributes: OnceCell<Vec<Attribute>>,
}

impl FieldModel {
    pub fn flags(&self) -> FieldAccessFlags {
        self.flags
    }

    pub fn name(&self) -> Result<&str> {
        self.pool.utf8(self.name_index)
    }

    pub fn descriptor(&self) -> Result<&str> {
        self.pool.utf8(self.descriptor_index)
    }

    pub fn attributes(&self) -> Result<&[Attribute]> {
        if self.attributes.get().is_none() {
            let decoded = decode_spans(
                &self.data,
                &self.pool,
                &self.options,
                &self.attr_spans,
                AttributeLocation::Field,
            )?;
            let _ = self.attributes.set(decoded);
        }
        Ok(self.attributes.get().expect("just initialized"))
    }
}

pub struct MethodModel {
    data: Rc<[u8]>,
    pool: Rc<BoundPool>,
    options: Options,
    flags: MethodAccessFlags,
    name_index: u16,
    descriptor_index: u16,
    attr_spans: Vec<AttrSpan>,
    attributes: OnceCell<Vec<Attribute>>,
    code: OnceCell<Option<CodeModel>>,
}

impl MethodModel {
    pub fn flags(&self) -> MethodAccessFlags {
        self.flags
    }

    pub fn name(&self) -> Result<&str> {
        self.pool.utf8(self.name_index)
    }

    pub fn descriptor(&self) -> Result<&str> {
        self.pool.utf8(self.descriptor_index)
    }

    /// Method attributes other than `Code`.
    pub fn attributes(&self) -> Result<&[Attribute]> {
        if self.attributes.get().is_none() {
            let spans: Vec<AttrSpan> = self
                .attr_spans
                .iter()
                .filter(|span| !self.span_is_code(span))
                .cloned()
                .collect();
            let decoded = decode_spans(
                &self.data,
                &self.pool,
                &self.options,
                &spans,
                AttributeLocation::Method,
            )?;
            let _ = self.attributes.set(decoded);
        }
        Ok(self.attributes.get().expect("just initialized"))
    }

    fn span_is_code(&self, span: &AttrSpan) -> bool {
        matches!(self.pool.utf8(span.name_index), Ok("Code"))
    }

    /// The method body, decoded on first request. `None` for abstract and
    /// native methods.
    pub fn code(&self) -> Result<Option<&CodeModel>> {
        if self.code.get().is_none() {
            let mut decoded = None;
            for span in &self.attr_spans {
                if self.pool.utf8(span.name_index)? == "Code" {
                    decoded = Some(CodeModel::decode(
                        self.data.clone(),
                        self.pool.clone(),
                        self.options.clone(),
                        span.start,
                        span.len,
                    )?);
                    break;
                }
            }
            let _ = self.code.set(decoded);
        }
        Ok(self.code.get().expect("just initialized").as_ref())
    }
}

/// A parsed class. Owns the buffer; every sub-model shares it.
pub struct ClassModel {
    data: Rc<[u8]>,
    options: Options,
    pool: Rc<BoundPool>,
    minor: u16,
    major: u16,
    flags: ClassAccessFlags,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldModel>,
    methods: Vec<MethodModel>,
    attr_spans: Vec<AttrSpan>,
    attributes: OnceCell<Vec<Attribute>>,
}

impl ClassModel {
    pub(crate) fn parse(bytes: Vec<u8>, options: Options) -> Result<ClassModel> {
        let data: Rc<[u8]> = Rc::from(bytes.into_boxed_slice());
        let view = ByteView::new(&data);
        if view.u4(0)? != 0xCAFE_BABE {
            return Err(Error::Malformed("bad magic".to_string()));
        }
        let minor = view.u2(4)?;
        let major = view.u2(6)?;
        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major) {
            return Err(Error::Malformed(format!(
                "unsupported classfile version {major}.{minor}"
            )));
        }
        let pool = Rc::new(BoundPool::scan(data.clone(), 10)?);
        let mut at = pool.end_offset();
        let flags = ClassAccessFlags::from_bits_retain(view.u2(at)?);
        let this_class = view.u2(at + 2)?;
        let super_class = view.u2(at + 4)?;
        let interface_count = view.u2(at + 6)? as usize;
        at += 8;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(view.u2(at)?);
            at += 2;
        }

        let field_count = view.u2(at)? as usize;
        at += 2;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let flags = FieldAccessFlags::from_bits_retain(view.u2(at)?);
            let name_index = view.u2(at + 2)?;
            let descriptor_index = view.u2(at + 4)?;
            let (attr_spans, next) = scan_attributes(&view, at + 6)?;
            at = next;
            fields.push(FieldModel {
                data: data.clone(),
                pool: pool.clone(),
                options: options.clone(),
                flags,
                name_index,
                descriptor_index,
                attr_spans,
                attributes: OnceCell::new(),
            });
        }

        let method_count = view.u2(at)? as usize;
        at += 2;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let flags = MethodAccessFlags::from_bits_retain(view.u2(at)?);
            let name_index = view.u2(at + 2)?;
            let descriptor_index = view.u2(at + 4)?;
            let (attr_spans, next) = scan_attributes(&view, at + 6)?;
            at = next;
            methods.push(MethodModel {
                data: data.clone(),
                pool: pool.clone(),
                options: options.clone(),
                flags,
                name_index,
                descriptor_index,
                attr_spans,
                attributes: OnceCell::new(),
                code: OnceCell::new(),
            });
        }

        let (attr_spans, end) = scan_attributes(&view, at)?;
        if end != data.len() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes after class attributes",
                data.len() - end
            )));
        }

        Ok(ClassModel {
            data,
            options,
            pool,
            minor,
            major,
            flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attr_spans,
            attributes: OnceCell::new(),
        })
    }

    pub fn minor_version(&self) -> u16 {
        self.minor
    }

    pub fn major_version(&self) -> u16 {
        self.major
    }

    pub fn flags(&self) -> ClassAccessFlags {
        self.flags
    }

    pub fn pool(&self) -> &BoundPool {
        &self.pool
    }

    pub(crate) fn shared_pool(&self) -> Rc<BoundPool> {
        self.pool.clone()
    }

    pub fn this_class(&self) -> Result<&str> {
        self.pool.class_name(self.this_class)
    }

    /// The superclass name; `None` only for `java/lang/Object`.
    pub fn super_class(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            if self.this_class()? != "java/lang/Object" {
                return Err(Error::Malformed(
                    "super_class of zero outside java/lang/Object".to_string(),
                ));
            }
            return Ok(None);
        }
        Ok(Some(self.pool.class_name(self.super_class)?))
    }

    pub fn interfaces(&self) -> Result<Vec<&str>> {
        self.interfaces.iter().map(|&index| self.pool.class_name(index)).collect()
    }

    pub fn fields(&self) -> &[FieldModel] {
        &self.fields
    }

    pub fn methods(&self) -> &[MethodModel] {
        &self.methods
    }

    pub fn attributes(&self) -> Result<&[Attribute]> {
        if self.attributes.get().is_none() {
            let decoded = decode_spans(
                &self.data,
                &self.pool,
                &self.options,
                &self.attr_spans,
                AttributeLocation::Class,
            )?;
            let _ = self.attributes.set(decoded);
        }
        Ok(self.attributes.get().expect("just initialized"))
    }

    /// Total length of the underlying classfile, a size hint for rebuilds.
    pub fn classfile_length(&self) -> usize {
        self.data.len()
    }
}
