//! Attributes outside the Code pipeline, and the name-driven registry that
//! decodes them.
//!
//! Payloads are symbolic (class names and strings, resolved against the
//! source pool at decode time) so an attribute value can be re-encoded
//! against any target pool. The two exceptions are `BootstrapMethods`, whose
//! arguments are arbitrary loadable constants and therefore stay as tagged
//! pool indices, and the `Raw`/`Unknown` forms, which round-trip their bytes
//! bit-exactly.
//!
//! `LineNumberTable`/`LocalVariableTable`/`LocalVariableTypeTable` and
//! `StackMapTable` never surface here: they are sub-attributes of Code and
//! are decoded into code elements (or regenerated) by the code pipeline.

use crate::access_flags::InnerClassAccessFlags;
use crate::bytes::{ByteBuf, ByteView};
use crate::error::{Error, Result};
use crate::pool::{PoolBuilder, PoolIndex, PoolRead};

/// Where an attribute was found, for the advisory location restriction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttributeLocation {
    Class,
    Field,
    Method,
}

/// A field's `ConstantValue` payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstantValue {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InnerClassInfo {
    pub inner: String,
    pub outer: Option<String>,
    pub inner_name: Option<String>,
    pub flags: InnerClassAccessFlags,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapMethod {
    /// A `MethodHandle` entry.
    pub method: PoolIndex,
    /// Loadable constants.
    pub arguments: Vec<PoolIndex>,
}

/// A decoded attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    ConstantValue(ConstantValue),
    /// Checked exceptions, as class names.
    Exceptions(Vec<String>),
    SourceFile(String),
    SourceDebugExtension(Vec<u8>),
    Signature(String),
    Synthetic,
    Deprecated,
    InnerClasses(Vec<InnerClassInfo>),
    EnclosingMethod { class: String, method: Option<(String, String)> },
    NestHost(String),
    NestMembers(Vec<String>),
    PermittedSubclasses(Vec<String>),
    BootstrapMethods(Vec<BootstrapMethod>),
    ModuleTarget(String),
    /// An attribute whose name the registry knows but whose interior it does
    /// not model (annotations, Record, Module, ...). Always retained.
    Raw { name: String, bytes: Vec<u8> },
    /// An attribute the registry has never heard of, retained or dropped per
    /// the `unknown_attributes` option.
    Unknown { name: String, bytes: Vec<u8> },
}

/// Names the registry recognizes but passes through as [`Attribute::Raw`].
const RAW_NAMES: &[&str] = &[
    "RuntimeVisibleAnnotations",
    "RuntimeInvisibleAnnotations",
    "RuntimeVisibleParameterAnnotations",
    "RuntimeInvisibleParameterAnnotations",
    "RuntimeVisibleTypeAnnotations",
    "RuntimeInvisibleTypeAnnotations",
    "AnnotationDefault",
    "MethodParameters",
    "Module",
    "ModulePackages",
    "ModuleMainClass",
    "ModuleHashes",
    "ModuleResolution",
    "Record",
];

impl Attribute {
    pub fn name(&self) -> &str {
        match self {
            Attribute::ConstantValue(_) => "ConstantValue",
            Attribute::Exceptions(_) => "Exceptions",
            Attribute::SourceFile(_) => "SourceFile",
            Attribute::SourceDebugExtension(_) => "SourceDebugExtension",
            Attribute::Signature(_) => "Signature",
            Attribute::Synthetic => "Synthetic",
            Attribute::Deprecated => "Deprecated",
            Attribute::InnerClasses(_) => "InnerClasses",
            Attribute::EnclosingMethod { .. } => "EnclosingMethod",
            Attribute::NestHost(_) => "NestHost",
            Attribute::NestMembers(_) => "NestMembers",
            Attribute::PermittedSubclasses(_) => "PermittedSubclasses",
            Attribute::BootstrapMethods(_) => "BootstrapMethods",
            Attribute::ModuleTarget(_) => "ModuleTarget",
            Attribute::Raw { name, .. } | Attribute::Unknown { name, .. } => name,
        }
    }

    /// Attributes the classfile permits at most once per location; during
    /// building, a later emission replaces an earlier one.
    pub fn singleton(&self) -> bool {
        matches!(
            self,
            Attribute::SourceFile(_)
                | Attribute::Signature(_)
                | Attribute::EnclosingMethod { .. }
                | Attribute::NestHost(_)
                | Attribute::ModuleTarget(_)
                | Attribute::ConstantValue(_)
        )
    }

    /// Locations where this attribute kind may appear.
    fn permitted_at(&self, location: AttributeLocation) -> bool {
        match self {
            Attribute::ConstantValue(_) => location == AttributeLocation::Field,
            Attribute::Exceptions(_) => location == AttributeLocation::Method,
            Attribute::SourceFile(_)
            | Attribute::SourceDebugExtension(_)
            | Attribute::InnerClasses(_)
            | Attribute::EnclosingMethod { .. }
            | Attribute::NestHost(_)
            | Attribute::NestMembers(_)
            | Attribute::PermittedSubclasses(_)
            | Attribute::BootstrapMethods(_)
            | Attribute::ModuleTarget(_) => location == AttributeLocation::Class,
            Attribute::Signature(_)
            | Attribute::Synthetic
            | Attribute::Deprecated
            | Attribute::Raw { .. }
            | Attribute::Unknown { .. } => true,
        }
    }

    /// Serialize as `attribute_info`: name index, length, payload. The
    /// length field is patched back once the payload size is known.
    pub fn encode(
        &self,
        pool: &mut PoolBuilder,
        source: Option<&dyn PoolRead>,
        buf: &mut ByteBuf,
    ) -> Result<()> {
        let name = pool.utf8(self.name())?;
        buf.write_u2(name);
        let length_mark = buf.mark();
        buf.write_u4(0);
        let payload_start = buf.len();
        match self {
            Attribute::ConstantValue(value) => {
                let index = match value {
                    ConstantValue::Integer(v) => pool.integer(*v)?,
                    ConstantValue::Float(v) => pool.float(*v)?,
                    ConstantValue::Long(v) => pool.long(*v)?,
                    ConstantValue::Double(v) => pool.double(*v)?,
                    ConstantValue::String(v) => pool.string(v)?,
                };
                buf.write_u2(index);
            }
            Attribute::Exceptions(classes) => {
                buf.write_u2(classes.len() as u16);
                for class in classes {
                    let index = pool.class(class)?;
                    buf.write_u2(index);
                }
            }
            Attribute::SourceFile(file) => {
                let index = pool.utf8(file)?;
                buf.write_u2(index);
            }
            Attribute::SourceDebugExtension(bytes) => buf.write_bytes(bytes),
            Attribute::Signature(signature) => {
                let index = pool.utf8(signature)?;
                buf.write_u2(index);
            }
            Attribute::Synthetic | Attribute::Deprecated => {}
            Attribute::InnerClasses(classes) => {
                buf.write_u2(classes.len() as u16);
                for info in classes {
                    let inner = pool.class(&info.inner)?;
                    buf.write_u2(inner);
                    let outer = match &info.outer {
                        Some(outer) => pool.class(outer)?,
                        None => 0,
                    };
                    buf.write_u2(outer);
                    let inner_name = match &info.inner_name {
                        Some(name) => pool.utf8(name)?,
                        None => 0,
                    };
                    buf.write_u2(inner_name);
                    buf.write_u2(info.flags.bits());
                }
            }
            Attribute::EnclosingMethod { class, method } => {
                let class = pool.class(class)?;
                buf.write_u2(class);
                let method = match method {
                    Some((name, descriptor)) => pool.name_and_type_of(name, descriptor)?,
                    None => 0,
                };
                buf.write_u2(method);
            }
            Attribute::NestHost(class) => {
                let index = pool.class(class)?;
                buf.write_u2(index);
            }
            Attribute::NestMembers(classes) | Attribute::PermittedSubclasses(classes) => {
                buf.write_u2(classes.len() as u16);
                for class in classes {
                    let index = pool.class(class)?;
                    buf.write_u2(index);
                }
            }
            Attribute::BootstrapMethods(methods) => {
                buf.write_u2(methods.len() as u16);
                for method in methods {
                    let handle = pool.translate(method.method, source)?;
                    buf.write_u2(handle);
                    buf.write_u2(method.arguments.len() as u16);
                    for argument in &method.arguments {
                        let index = pool.translate(*argument, source)?;
                        buf.write_u2(index);
                    }
                }
            }
            Attribute::ModuleTarget(platform) => {
                let index = pool.utf8(platform)?;
                buf.write_u2(index);
            }
            Attribute::Raw { bytes, .. } | Attribute::Unknown { bytes, .. } => {
                buf.write_bytes(bytes)
            }
        }
        let length = (buf.len() - payload_start) as u32;
        buf.patch_u4(length_mark, length);
        Ok(())
    }
}

/// How the registry disposed of one `attribute_info`.
pub enum Decoded {
    Keep(Attribute),
    /// Unknown name under `DROP_UNKNOWN_ATTRIBUTES`, or an attribute at a
    /// location that does not permit it.
    Dropped,
}

/// A user hook consulted before the built-in registry. Returning `Some`
/// claims the attribute.
pub type AttributeMapperFn = std::rc::Rc<dyn Fn(&str, &[u8]) -> Option<Attribute>>;

/// Decode one `attribute_info` payload. `bytes` covers exactly the payload
/// (the `info` array); `name` has already been resolved.
pub fn decode_attribute(
    name: &str,
    bytes: &[u8],
    pool: &dyn PoolRead,
    location: AttributeLocation,
    pass_unknown: bool,
    mapper: Option<&AttributeMapperFn>,
) -> Result<Decoded> {
    if let Some(mapper) = mapper {
        if let Some(attribute) = mapper(name, bytes) {
            return Ok(Decoded::Keep(attribute));
        }
    }
    let view = ByteView::new(bytes);
    let attribute = match name {
        "ConstantValue" => {
            let index = view.u2(0)?;
            let value = match pool.entry(index)? {
                crate::pool::PoolEntry::Integer(v) => ConstantValue::Integer(*v),
                crate::pool::PoolEntry::Float(v) => ConstantValue::Float(*v),
                crate::pool::PoolEntry::Long(v) => ConstantValue::Long(*v),
                crate::pool::PoolEntry::Double(v) => ConstantValue::Double(*v),
                crate::pool::PoolEntry::String { utf8 } => {
                    ConstantValue::String(pool.utf8(*utf8)?.to_string())
                }
                other => {
                    return Err(Error::ConstantPool(format!(
                        "ConstantValue references a tag-{} entry",
                        other.tag()
                    )))
                }
            };
            Attribute::ConstantValue(value)
        }
        "Exceptions" => {
            let count = view.u2(0)? as usize;
            let mut classes = Vec::with_capacity(count);
            for i in 0..count {
                classes.push(pool.class_name(view.u2(2 + 2 * i)?)?.to_string());
            }
            Attribute::Exceptions(classes)
        }
        "SourceFile" => Attribute::SourceFile(pool.utf8(view.u2(0)?)?.to_string()),
        "SourceDebugExtension" => Attribute::SourceDebugExtension(bytes.to_vec()),
        "Signature" => Attribute::Signature(pool.utf8(view.u2(0)?)?.to_string()),
        "Synthetic" => Attribute::Synthetic,
        "Deprecated" => Attribute::Deprecated,
        "InnerClasses" => {
            let count = view.u2(0)? as usize;
            let mut classes = Vec::with_capacity(count);
            for i in 0..count {
                let at = 2 + 8 * i;
                let outer = view.u2(at + 2)?;
                let inner_name = view.u2(at + 4)?;
                classes.push(InnerClassInfo {
                    inner: pool.class_name(view.u2(at)?)?.to_string(),
                    outer: if outer == 0 {
                        None
                    } else {
                        Some(pool.class_name(outer)?.to_string())
                    },
                    inner_name: if inner_name == 0 {
                        None
                    } else {
                        Some(pool.utf8(inner_name)?.to_string())
                    },
                    flags: InnerClassAccessFlags::from_bits_retain(view.u2(at + 6)?),
                });
            }
            Attribute::InnerClasses(classes)
        }
        "EnclosingMethod" => {
            let class = pool.class_name(view.u2(0)?)?.to_string();
            let method_index = view.u2(2)?;
            let method = if method_index == 0 {
                None
            } else {
                let (name, descriptor) = pool.name_and_type(method_index)?;
                Some((name.to_string(), descriptor.to_string()))
            };
            Attribute::EnclosingMethod { class, method }
        }
        "NestHost" => Attribute::NestHost(pool.class_name(view.u2(0)?)?.to_string()),
        "NestMembers" | "PermittedSubclasses" => {
            let count = view.u2(0)? as usize;
            let mut classes = Vec::with_capacity(count);
            for i in 0..count {
                classes.push(pool.class_name(view.u2(2 + 2 * i)?)?.to_string());
            }
            if name == "NestMembers" {
                Attribute::NestMembers(classes)
            } else {
                Attribute::PermittedSubclasses(classes)
            }
        }
        "BootstrapMethods" => {
            let count = view.u2(0)? as usize;
            let mut methods = Vec::with_capacity(count);
            let mut at = 2;
            for _ in 0..count {
                let method = pool.index_of(view.u2(at)?);
                let argument_count = view.u2(at + 2)? as usize;
                at += 4;
                let mut arguments = Vec::with_capacity(argument_count);
                for _ in 0..argument_count {
                    arguments.push(pool.index_of(view.u2(at)?));
                    at += 2;
                }
                methods.push(BootstrapMethod { method, arguments });
            }
            Attribute::BootstrapMethods(methods)
        }
        "ModuleTarget" => Attribute::ModuleTarget(pool.utf8(view.u2(0)?)?.to_string()),
        name if RAW_NAMES.contains(&name) => {
            Attribute::Raw { name: name.to_string(), bytes: bytes.to_vec() }
        }
        name => {
            if pass_unknown {
                Attribute::Unknown { name: name.to_string(), bytes: bytes.to_vec() }
            } else {
                return Ok(Decoded::Dropped);
            }
        }
    };
    if !attribute.permitted_at(location) {
        return Ok(Decoded::Dropped);
    }
    Ok(Decoded::Keep(attribute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolBuilder;

    fn encode_one(attribute: &Attribute, pool: &mut PoolBuilder) -> Vec<u8> {
        let mut buf = ByteBuf::new();
        attribute.encode(pool, None, &mut buf).unwrap();
        buf.into_vec()
    }

    #[test]
    fn source_file_round_trip() {
        let mut pool = PoolBuilder::new();
        let encoded = encode_one(&Attribute::SourceFile("Foo.java".to_string()), &mut pool);
        // name u2 + length u4 + utf8 index u2
        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded[2..6], &[0, 0, 0, 2]);
        let payload = &encoded[6..];
        let decoded = decode_attribute(
            "SourceFile",
            payload,
            &pool,
            AttributeLocation::Class,
            true,
            None,
        )
        .unwrap();
        let Decoded::Keep(attr) = decoded else { panic!("dropped") };
        assert_eq!(attr, Attribute::SourceFile("Foo.java".to_string()));
    }

    #[test]
    fn unknown_attribute_follows_the_option() {
        let pool = PoolBuilder::new();
        let kept = decode_attribute(
            "org.example.Custom",
            &[1, 2, 3],
            &pool,
            AttributeLocation::Class,
            true,
            None,
        )
        .unwrap();
        assert!(matches!(kept, Decoded::Keep(Attribute::Unknown { .. })));
        let dropped = decode_attribute(
            "org.example.Custom",
            &[1, 2, 3],
            &pool,
            AttributeLocation::Class,
            false,
            None,
        )
        .unwrap();
        assert!(matches!(dropped, Decoded::Dropped));
    }

    #[test]
    fn mapper_is_consulted_first() {
        let pool = PoolBuilder::new();
        let mapper: AttributeMapperFn = std::rc::Rc::new(|name, bytes| {
            (name == "SourceFile").then(|| Attribute::Raw {
                name: "SourceFile".to_string(),
                bytes: bytes.to_vec(),
            })
        });
        let decoded = decode_attribute(
            "SourceFile",
            &[0, 1],
            &pool,
            AttributeLocation::Class,
            true,
            Some(&mapper),
        )
        .unwrap();
        assert!(matches!(decoded, Decoded::Keep(Attribute::Raw { .. })));
    }

    #[test]
    fn misplaced_attribute_is_dropped() {
        let mut pool = PoolBuilder::new();
        let index = pool.integer(7).unwrap();
        let payload = index.to_be_bytes();
        // ConstantValue is a field attribute; at class level it is advisory-dropped
        let decoded = decode_attribute(
            "ConstantValue",
            &payload,
            &pool,
            AttributeLocation::Class,
            true,
            None,
        )
        .unwrap();
        assert!(matches!(decoded, Decoded::Dropped));
    }

    #[test]
    fn exceptions_round_trip() {
        let mut pool = PoolBuilder::new();
        let attribute = Attribute::Exceptions(vec![
            "java/io/IOException".to_string(),
            "java/lang/IllegalStateException".to_string(),
        ]);
        let encoded = encode_one(&attribute, &mut pool);
        let payload = &encoded[6..];
        let Decoded::Keep(decoded) = decode_attribute(
            "Exceptions",
            payload,
            &pool,
            AttributeLocation::Method,
            true,
            None,
        )
        .unwrap() else {
            panic!("dropped")
        };
        assert_eq!(decoded, attribute);
    }
}
