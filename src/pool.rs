//! The constant pool: typed entries, interning, and lazy binding.
//!
//! Pools come in two flavors sharing one entry representation:
//!
//!   * [`BoundPool`] is backed by the classfile bytes. Construction scans the
//!     entry table once to record each slot's tag and payload offset; the
//!     entries themselves decode lazily on first access and are memoized.
//!   * [`PoolBuilder`] is constructed in memory and interns: inserting an
//!     entry that is structurally equal to an existing one returns the
//!     existing index.
//!
//! Indices are 1-based. `Long` and `Double` entries occupy two slots; the
//! second slot is reserved and never resolvable.

use crate::bytes::{ByteBuf, ByteView, Serialize};
use crate::error::{Error, Result};
use crate::mutf8;
use byteorder::WriteBytesExt;
use elsa::FrozenMap;
use rustc_hash::FxHashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Constant pool entry tags, [JVMS Table 4.4-A][0].
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4
pub mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

/// Every pool instance gets a distinct id, stamped into the [`PoolIndex`]es
/// it hands out so a builder can tell its own indices from foreign ones.
fn fresh_pool_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A constant pool index tagged with the identity of its owning pool.
///
/// Instruction operands carry these. When an element decoded from one class
/// is re-emitted against a different pool, the owner tag is what tells the
/// builder to re-intern the entry rather than trust the raw index.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolIndex {
    pub(crate) owner: u32,
    pub(crate) index: u16,
}

impl PoolIndex {
    pub fn index(&self) -> u16 {
        self.index
    }
}

/// Kind of method handle, [JVMS §4.4.8][0].
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4.8
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub fn as_u8(self) -> u8 {
        match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        }
    }

    pub fn from_u8(kind: u8) -> Result<HandleKind> {
        Ok(match kind {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            other => {
                return Err(Error::Malformed(format!("invalid method handle kind {other}")))
            }
        })
    }
}

/// A decoded constant pool entry.
///
/// Child references are raw indices into the *same* pool; crossing pools goes
/// through [`PoolBuilder::intern_from`].
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    /// Raw string value. Despite the classfile tag name, the binary encoding
    /// is Modified UTF-8, not UTF-8 (see [`crate::mutf8`]).
    Utf8(String),
    Integer(i32),
    Float(f32),
    /// Occupies two pool slots.
    Long(i64),
    /// Occupies two pool slots.
    Double(f64),
    Class { name: u16 },
    String { utf8: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: HandleKind, member: u16 },
    MethodType { descriptor: u16 },
    /// `bootstrap_method` indexes the `BootstrapMethods` attribute, not the
    /// pool.
    Dynamic { bootstrap_method: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap_method: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
}

impl PoolEntry {
    pub fn tag(&self) -> u8 {
        match self {
            PoolEntry::Utf8(_) => tag::UTF8,
            PoolEntry::Integer(_) => tag::INTEGER,
            PoolEntry::Float(_) => tag::FLOAT,
            PoolEntry::Long(_) => tag::LONG,
            PoolEntry::Double(_) => tag::DOUBLE,
            PoolEntry::Class { .. } => tag::CLASS,
            PoolEntry::String { .. } => tag::STRING,
            PoolEntry::FieldRef { .. } => tag::FIELDREF,
            PoolEntry::MethodRef { .. } => tag::METHODREF,
            PoolEntry::InterfaceMethodRef { .. } => tag::INTERFACE_METHODREF,
            PoolEntry::NameAndType { .. } => tag::NAME_AND_TYPE,
            PoolEntry::MethodHandle { .. } => tag::METHOD_HANDLE,
            PoolEntry::MethodType { .. } => tag::METHOD_TYPE,
            PoolEntry::Dynamic { .. } => tag::DYNAMIC,
            PoolEntry::InvokeDynamic { .. } => tag::INVOKE_DYNAMIC,
            PoolEntry::Module { .. } => tag::MODULE,
            PoolEntry::Package { .. } => tag::PACKAGE,
        }
    }

    /// Number of pool slots the entry occupies.
    pub fn width(&self) -> u16 {
        match self {
            PoolEntry::Long(_) | PoolEntry::Double(_) => 2,
            _ => 1,
        }
    }

    /// Whether the entry is loadable by the `ldc` family.
    pub fn loadable(&self) -> bool {
        matches!(
            self,
            PoolEntry::Integer(_)
                | PoolEntry::Float(_)
                | PoolEntry::Long(_)
                | PoolEntry::Double(_)
                | PoolEntry::Class { .. }
                | PoolEntry::String { .. }
                | PoolEntry::MethodHandle { .. }
                | PoolEntry::MethodType { .. }
                | PoolEntry::Dynamic { .. }
        )
    }
}

impl Serialize for PoolEntry {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        self.tag().serialize(writer)?;
        match self {
            PoolEntry::Utf8(string) => {
                let bytes = mutf8::encode(string);
                (bytes.len() as u16).serialize(writer)?;
                writer.write_all(&bytes)?;
            }
            PoolEntry::Integer(v) => v.serialize(writer)?,
            PoolEntry::Float(v) => v.to_bits().serialize(writer)?,
            PoolEntry::Long(v) => writer.write_i64::<byteorder::BigEndian>(*v)?,
            PoolEntry::Double(v) => writer.write_f64::<byteorder::BigEndian>(*v)?,
            PoolEntry::Class { name }
            | PoolEntry::String { utf8: name }
            | PoolEntry::MethodType { descriptor: name }
            | PoolEntry::Module { name }
            | PoolEntry::Package { name } => name.serialize(writer)?,
            PoolEntry::FieldRef { class, name_and_type }
            | PoolEntry::MethodRef { class, name_and_type }
            | PoolEntry::InterfaceMethodRef { class, name_and_type } => {
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            PoolEntry::NameAndType { name, descriptor } => {
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            PoolEntry::MethodHandle { kind, member } => {
                kind.as_u8().serialize(writer)?;
                member.serialize(writer)?;
            }
            PoolEntry::Dynamic { bootstrap_method, name_and_type }
            | PoolEntry::InvokeDynamic { bootstrap_method, name_and_type } => {
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
        }
        Ok(())
    }
}

/// Read access shared by bound pools and builders.
pub trait PoolRead {
    /// The identity of this pool (see [`PoolIndex`]).
    fn pool_id(&self) -> u32;

    /// The `constant_pool_count` header value: one more than the number of
    /// slots.
    fn size(&self) -> u16;

    /// Resolve an index to its entry. Index 0, an out-of-range index, and
    /// the reserved slot after a `Long`/`Double` all report
    /// [`Error::ConstantPool`].
    fn entry(&self, index: u16) -> Result<&PoolEntry>;

    /// An index tagged with this pool's identity.
    fn index_of(&self, index: u16) -> PoolIndex {
        PoolIndex { owner: self.pool_id(), index }
    }

    fn utf8(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            PoolEntry::Utf8(s) => Ok(s),
            other => Err(wrong_kind("Utf8", index, other)),
        }
    }

    /// Resolve a `Class` entry to its binary name.
    fn class_name(&self, index: u16) -> Result<&str> {
        match self.entry(index)? {
            PoolEntry::Class { name } => self.utf8(*name),
            other => Err(wrong_kind("Class", index, other)),
        }
    }

    /// Resolve a `NameAndType` entry to `(name, descriptor)`.
    fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index)? {
            PoolEntry::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            other => Err(wrong_kind("NameAndType", index, other)),
        }
    }

    /// Resolve a `Fieldref`/`Methodref`/`InterfaceMethodref` entry to
    /// `(class name, member name, descriptor)`.
    fn member_ref(&self, index: u16) -> Result<(&str, &str, &str)> {
        match self.entry(index)? {
            PoolEntry::FieldRef { class, name_and_type }
            | PoolEntry::MethodRef { class, name_and_type }
            | PoolEntry::InterfaceMethodRef { class, name_and_type } => {
                let class_name = self.class_name(*class)?;
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok((class_name, name, descriptor))
            }
            other => Err(wrong_kind("member ref", index, other)),
        }
    }

    /// Resolve a `Dynamic`/`InvokeDynamic` entry to
    /// `(bootstrap index, name, descriptor)`.
    fn dynamic_ref(&self, index: u16) -> Result<(u16, &str, &str)> {
        match self.entry(index)? {
            PoolEntry::Dynamic { bootstrap_method, name_and_type }
            | PoolEntry::InvokeDynamic { bootstrap_method, name_and_type } => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok((*bootstrap_method, name, descriptor))
            }
            other => Err(wrong_kind("dynamic ref", index, other)),
        }
    }
}

fn wrong_kind(expected: &str, index: u16, got: &PoolEntry) -> Error {
    Error::ConstantPool(format!(
        "entry {index} is a tag-{} entry, expected {expected}",
        got.tag()
    ))
}

enum BoundSlot {
    Entry { tag: u8, offset: usize },
    /// Second slot of a `Long`/`Double`; valid but unusable.
    Reserved,
}

/// A pool backed by classfile bytes, decoding entries on demand.
pub struct BoundPool {
    data: Rc<[u8]>,
    id: u32,
    slots: Vec<BoundSlot>,
    decoded: FrozenMap<u16, Box<PoolEntry>>,
    /// Offset just past the last entry (where `access_flags` starts).
    end: usize,
}

impl BoundPool {
    /// Scan the pool's entry table starting at `offset` (normally 10, right
    /// after the header), recording tags and payload offsets.
    pub fn scan(data: Rc<[u8]>, offset: usize) -> Result<BoundPool> {
        let view = ByteView::new(&data);
        let count = view.u2(offset - 2)?;
        if count == 0 {
            return Err(Error::Malformed("constant_pool_count of zero".to_string()));
        }
        let mut slots = Vec::with_capacity(count as usize - 1);
        let mut at = offset;
        let mut index: u16 = 1;
        while index < count {
            let entry_tag = view.u1(at)?;
            slots.push(BoundSlot::Entry { tag: entry_tag, offset: at + 1 });
            let payload = match entry_tag {
                tag::UTF8 => 2 + view.u2(at + 1)? as usize,
                tag::INTEGER | tag::FLOAT => 4,
                tag::LONG | tag::DOUBLE => 8,
                tag::CLASS | tag::STRING | tag::METHOD_TYPE | tag::MODULE | tag::PACKAGE => 2,
                tag::FIELDREF
                | tag::METHODREF
                | tag::INTERFACE_METHODREF
                | tag::NAME_AND_TYPE
                | tag::DYNAMIC
                | tag::INVOKE_DYNAMIC => 4,
                tag::METHOD_HANDLE => 3,
                other => {
                    return Err(Error::Malformed(format!(
                        "unknown constant pool tag {other} at offset {at}"
                    )))
                }
            };
            at += 1 + payload;
            if at > data.len() {
                return Err(Error::truncated("constant pool entry", at));
            }
            if entry_tag == tag::LONG || entry_tag == tag::DOUBLE {
                slots.push(BoundSlot::Reserved);
                index += 2;
            } else {
                index += 1;
            }
        }
        if slots.len() != count as usize - 1 {
            // A Long/Double in the last slot pushed us past the declared count
            return Err(Error::Malformed(
                "constant pool entry count does not match declared size".to_string(),
            ));
        }
        Ok(BoundPool {
            data,
            id: fresh_pool_id(),
            slots,
            decoded: FrozenMap::new(),
            end: at,
        })
    }

    /// Offset of the first byte after the pool.
    pub fn end_offset(&self) -> usize {
        self.end
    }

    fn decode_slot(&self, index: u16, entry_tag: u8, offset: usize) -> Result<PoolEntry> {
        let view = ByteView::new(&self.data);
        Ok(match entry_tag {
            tag::UTF8 => {
                let len = view.u2(offset)? as usize;
                let bytes = view.read_bytes(offset + 2, len)?;
                PoolEntry::Utf8(mutf8::decode(bytes).map_err(|e| {
                    Error::Malformed(format!("Utf8 entry {index}: {e}"))
                })?)
            }
            tag::INTEGER => PoolEntry::Integer(view.s4(offset)?),
            tag::FLOAT => PoolEntry::Float(view.f4(offset)?),
            tag::LONG => PoolEntry::Long(view.s8(offset)?),
            tag::DOUBLE => PoolEntry::Double(view.f8(offset)?),
            tag::CLASS => PoolEntry::Class { name: view.u2(offset)? },
            tag::STRING => PoolEntry::String { utf8: view.u2(offset)? },
            tag::FIELDREF => PoolEntry::FieldRef {
                class: view.u2(offset)?,
                name_and_type: view.u2(offset + 2)?,
            },
            tag::METHODREF => PoolEntry::MethodRef {
                class: view.u2(offset)?,
                name_and_type: view.u2(offset + 2)?,
            },
            tag::INTERFACE_METHODREF => PoolEntry::InterfaceMethodRef {
                class: view.u2(offset)?,
                name_and_type: view.u2(offset + 2)?,
            },
            tag::NAME_AND_TYPE => PoolEntry::NameAndType {
                name: view.u2(offset)?,
                descriptor: view.u2(offset + 2)?,
            },
            tag::METHOD_HANDLE => PoolEntry::MethodHandle {
                kind: HandleKind::from_u8(view.u1(offset)?)?,
                member: view.u2(offset + 1)?,
            },
            tag::METHOD_TYPE => PoolEntry::MethodType { descriptor: view.u2(offset)? },
            tag::DYNAMIC => PoolEntry::Dynamic {
                bootstrap_method: view.u2(offset)?,
                name_and_type: view.u2(offset + 2)?,
            },
            tag::INVOKE_DYNAMIC => PoolEntry::InvokeDynamic {
                bootstrap_method: view.u2(offset)?,
                name_and_type: view.u2(offset + 2)?,
            },
            tag::MODULE => PoolEntry::Module { name: view.u2(offset)? },
            tag::PACKAGE => PoolEntry::Package { name: view.u2(offset)? },
            _ => unreachable!("tags validated during scan"),
        })
    }
}

impl PoolRead for BoundPool {
    fn pool_id(&self) -> u32 {
        self.id
    }

    fn size(&self) -> u16 {
        self.slots.len() as u16 + 1
    }

    fn entry(&self, index: u16) -> Result<&PoolEntry> {
        if index == 0 || index as usize > self.slots.len() {
            return Err(Error::ConstantPool(format!(
                "index {index} out of range 1..{}",
                self.size()
            )));
        }
        if let Some(entry) = self.decoded.get(&index) {
            return Ok(entry);
        }
        match self.slots[index as usize - 1] {
            BoundSlot::Reserved => Err(Error::ConstantPool(format!(
                "index {index} is the reserved slot after a Long/Double entry"
            ))),
            BoundSlot::Entry { tag: entry_tag, offset } => {
                let entry = self.decode_slot(index, entry_tag, offset)?;
                Ok(self.decoded.insert(index, Box::new(entry)))
            }
        }
    }
}

enum BuilderSlot {
    Entry(PoolEntry),
    Reserved,
}

/// An in-memory, interning constant pool under construction.
///
/// Interning tables are per kind, keyed by the already-interned child indices
/// plus any inline payload (floats and doubles key on their raw bits so that
/// NaN patterns intern like any other value).
pub struct PoolBuilder {
    id: u32,
    slots: Vec<BuilderSlot>,
    utf8s: FxHashMap<String, u16>,
    integers: FxHashMap<i32, u16>,
    floats: FxHashMap<[u8; 4], u16>,
    longs: FxHashMap<i64, u16>,
    doubles: FxHashMap<[u8; 8], u16>,
    classes: FxHashMap<u16, u16>,
    strings: FxHashMap<u16, u16>,
    name_and_types: FxHashMap<(u16, u16), u16>,
    field_refs: FxHashMap<(u16, u16), u16>,
    method_refs: FxHashMap<(u16, u16), u16>,
    interface_method_refs: FxHashMap<(u16, u16), u16>,
    method_handles: FxHashMap<(u8, u16), u16>,
    method_types: FxHashMap<u16, u16>,
    dynamics: FxHashMap<(u16, u16), u16>,
    invoke_dynamics: FxHashMap<(u16, u16), u16>,
    modules: FxHashMap<u16, u16>,
    packages: FxHashMap<u16, u16>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        PoolBuilder::new()
    }
}

impl PoolBuilder {
    pub fn new() -> PoolBuilder {
        PoolBuilder {
            id: fresh_pool_id(),
            slots: vec![],
            utf8s: FxHashMap::default(),
            integers: FxHashMap::default(),
            floats: FxHashMap::default(),
            longs: FxHashMap::default(),
            doubles: FxHashMap::default(),
            classes: FxHashMap::default(),
            strings: FxHashMap::default(),
            name_and_types: FxHashMap::default(),
            field_refs: FxHashMap::default(),
            method_refs: FxHashMap::default(),
            interface_method_refs: FxHashMap::default(),
            method_handles: FxHashMap::default(),
            method_types: FxHashMap::default(),
            dynamics: FxHashMap::default(),
            invoke_dynamics: FxHashMap::default(),
            modules: FxHashMap::default(),
            packages: FxHashMap::default(),
        }
    }

    /// Start a builder that mirrors an existing pool: every slot (duplicates
    /// included) is copied verbatim so the source's indices stay valid, and
    /// the interning tables record first occurrences so new insertions
    /// deduplicate.
    pub fn from_pool(source: &dyn PoolRead) -> Result<PoolBuilder> {
        let mut builder = PoolBuilder::new();
        let mut index: u16 = 1;
        while index < source.size() {
            let entry = source.entry(index)?.clone();
            let width = entry.width();
            builder.register_key(&entry, index);
            builder.slots.push(BuilderSlot::Entry(entry));
            if width == 2 {
                builder.slots.push(BuilderSlot::Reserved);
            }
            index += width;
        }
        Ok(builder)
    }

    fn push_entry(&mut self, entry: PoolEntry) -> Result<u16> {
        let index = self.slots.len() + 1;
        // constant_pool_count is a u16, so the last usable slot is 65534
        if index + entry.width() as usize > 65535 {
            return Err(Error::ConstantPool("pool full".to_string()));
        }
        let width = entry.width();
        self.slots.push(BuilderSlot::Entry(entry));
        if width == 2 {
            self.slots.push(BuilderSlot::Reserved);
        }
        Ok(index as u16)
    }

    /// Record `entry`'s structural key as mapping to `index`, keeping the
    /// first occurrence on duplicates.
    fn register_key(&mut self, entry: &PoolEntry, index: u16) {
        match entry {
            PoolEntry::Utf8(s) => {
                self.utf8s.entry(s.clone()).or_insert(index);
            }
            PoolEntry::Integer(v) => {
                self.integers.entry(*v).or_insert(index);
            }
            PoolEntry::Float(v) => {
                self.floats.entry(v.to_be_bytes()).or_insert(index);
            }
            PoolEntry::Long(v) => {
                self.longs.entry(*v).or_insert(index);
            }
            PoolEntry::Double(v) => {
                self.doubles.entry(v.to_be_bytes()).or_insert(index);
            }
            PoolEntry::Class { name } => {
                self.classes.entry(*name).or_insert(index);
            }
            PoolEntry::String { utf8 } => {
                self.strings.entry(*utf8).or_insert(index);
            }
            PoolEntry::FieldRef { class, name_and_type } => {
                self.field_refs.entry((*class, *name_and_type)).or_insert(index);
            }
            PoolEntry::MethodRef { class, name_and_type } => {
                self.method_refs.entry((*class, *name_and_type)).or_insert(index);
            }
            PoolEntry::InterfaceMethodRef { class, name_and_type } => {
                self.interface_method_refs.entry((*class, *name_and_type)).or_insert(index);
            }
            PoolEntry::NameAndType { name, descriptor } => {
                self.name_and_types.entry((*name, *descriptor)).or_insert(index);
            }
            PoolEntry::MethodHandle { kind, member } => {
                self.method_handles.entry((kind.as_u8(), *member)).or_insert(index);
            }
            PoolEntry::MethodType { descriptor } => {
                self.method_types.entry(*descriptor).or_insert(index);
            }
            PoolEntry::Dynamic { bootstrap_method, name_and_type } => {
                self.dynamics.entry((*bootstrap_method, *name_and_type)).or_insert(index);
            }
            PoolEntry::InvokeDynamic { bootstrap_method, name_and_type } => {
                self.invoke_dynamics.entry((*bootstrap_method, *name_and_type)).or_insert(index);
            }
            PoolEntry::Module { name } => {
                self.modules.entry(*name).or_insert(index);
            }
            PoolEntry::Package { name } => {
                self.packages.entry(*name).or_insert(index);
            }
        }
    }

    /// Insert-or-find: the structural key of `entry` (child indices must
    /// already belong to this pool) resolves to an existing index, or the
    /// entry is appended.
    pub fn index(&mut self, entry: PoolEntry) -> Result<u16> {
        let existing = match &entry {
            PoolEntry::Utf8(s) => self.utf8s.get(s.as_str()).copied(),
            PoolEntry::Integer(v) => self.integers.get(v).copied(),
            PoolEntry::Float(v) => self.floats.get(&v.to_be_bytes()).copied(),
            PoolEntry::Long(v) => self.longs.get(v).copied(),
            PoolEntry::Double(v) => self.doubles.get(&v.to_be_bytes()).copied(),
            PoolEntry::Class { name } => self.classes.get(name).copied(),
            PoolEntry::String { utf8 } => self.strings.get(utf8).copied(),
            PoolEntry::FieldRef { class, name_and_type } => {
                self.field_refs.get(&(*class, *name_and_type)).copied()
            }
            PoolEntry::MethodRef { class, name_and_type } => {
                self.method_refs.get(&(*class, *name_and_type)).copied()
            }
            PoolEntry::InterfaceMethodRef { class, name_and_type } => {
                self.interface_method_refs.get(&(*class, *name_and_type)).copied()
            }
            PoolEntry::NameAndType { name, descriptor } => {
                self.name_and_types.get(&(*name, *descriptor)).copied()
            }
            PoolEntry::MethodHandle { kind, member } => {
                self.method_handles.get(&(kind.as_u8(), *member)).copied()
            }
            PoolEntry::MethodType { descriptor } => self.method_types.get(descriptor).copied(),
            PoolEntry::Dynamic { bootstrap_method, name_and_type } => {
                self.dynamics.get(&(*bootstrap_method, *name_and_type)).copied()
            }
            PoolEntry::InvokeDynamic { bootstrap_method, name_and_type } => {
                self.invoke_dynamics.get(&(*bootstrap_method, *name_and_type)).copied()
            }
            PoolEntry::Module { name } => self.modules.get(name).copied(),
            PoolEntry::Package { name } => self.packages.get(name).copied(),
        };
        if let Some(index) = existing {
            return Ok(index);
        }
        let key = entry.clone();
        let index = self.push_entry(entry)?;
        self.register_key(&key, index);
        Ok(index)
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16> {
        if let Some(index) = self.utf8s.get(value) {
            return Ok(*index);
        }
        self.index(PoolEntry::Utf8(value.to_string()))
    }

    pub fn integer(&mut self, value: i32) -> Result<u16> {
        self.index(PoolEntry::Integer(value))
    }

    pub fn float(&mut self, value: f32) -> Result<u16> {
        self.index(PoolEntry::Float(value))
    }

    pub fn long(&mut self, value: i64) -> Result<u16> {
        self.index(PoolEntry::Long(value))
    }

    pub fn double(&mut self, value: f64) -> Result<u16> {
        self.index(PoolEntry::Double(value))
    }

    pub fn class(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.index(PoolEntry::Class { name })
    }

    pub fn string(&mut self, value: &str) -> Result<u16> {
        let utf8 = self.utf8(value)?;
        self.index(PoolEntry::String { utf8 })
    }

    pub fn name_and_type_of(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        self.index(PoolEntry::NameAndType { name, descriptor })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type_of(name, descriptor)?;
        self.index(PoolEntry::FieldRef { class, name_and_type })
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type_of(name, descriptor)?;
        self.index(PoolEntry::MethodRef { class, name_and_type })
    }

    pub fn interface_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class = self.class(class)?;
        let name_and_type = self.name_and_type_of(name, descriptor)?;
        self.index(PoolEntry::InterfaceMethodRef { class, name_and_type })
    }

    pub fn method_handle(&mut self, kind: HandleKind, member: u16) -> Result<u16> {
        self.index(PoolEntry::MethodHandle { kind, member })
    }

    pub fn method_type(&mut self, descriptor: &str) -> Result<u16> {
        let descriptor = self.utf8(descriptor)?;
        self.index(PoolEntry::MethodType { descriptor })
    }

    pub fn invoke_dynamic(
        &mut self,
        bootstrap_method: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let name_and_type = self.name_and_type_of(name, descriptor)?;
        self.index(PoolEntry::InvokeDynamic { bootstrap_method, name_and_type })
    }

    pub fn dynamic(&mut self, bootstrap_method: u16, name: &str, descriptor: &str) -> Result<u16> {
        let name_and_type = self.name_and_type_of(name, descriptor)?;
        self.index(PoolEntry::Dynamic { bootstrap_method, name_and_type })
    }

    pub fn module(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.index(PoolEntry::Module { name })
    }

    pub fn package(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.index(PoolEntry::Package { name })
    }

    /// Re-intern an entry that lives in another pool, recursively cloning its
    /// children. When `source` is this pool's mirror (same structural
    /// content), the result is the first structurally-equal index.
    pub fn intern_from(&mut self, source: &dyn PoolRead, index: u16) -> Result<u16> {
        let entry = source.entry(index)?.clone();
        match entry {
            PoolEntry::Utf8(s) => self.utf8(&s),
            PoolEntry::Integer(v) => self.integer(v),
            PoolEntry::Float(v) => self.float(v),
            PoolEntry::Long(v) => self.long(v),
            PoolEntry::Double(v) => self.double(v),
            PoolEntry::Class { name } => {
                let name = source.utf8(name)?.to_string();
                self.class(&name)
            }
            PoolEntry::String { utf8 } => {
                let value = source.utf8(utf8)?.to_string();
                self.string(&value)
            }
            PoolEntry::NameAndType { name, descriptor } => {
                let name = source.utf8(name)?.to_string();
                let descriptor = source.utf8(descriptor)?.to_string();
                self.name_and_type_of(&name, &descriptor)
            }
            PoolEntry::FieldRef { class, name_and_type } => {
                let class = self.intern_from(source, class)?;
                let name_and_type = self.intern_from(source, name_and_type)?;
                self.index(PoolEntry::FieldRef { class, name_and_type })
            }
            PoolEntry::MethodRef { class, name_and_type } => {
                let class = self.intern_from(source, class)?;
                let name_and_type = self.intern_from(source, name_and_type)?;
                self.index(PoolEntry::MethodRef { class, name_and_type })
            }
            PoolEntry::InterfaceMethodRef { class, name_and_type } => {
                let class = self.intern_from(source, class)?;
                let name_and_type = self.intern_from(source, name_and_type)?;
                self.index(PoolEntry::InterfaceMethodRef { class, name_and_type })
            }
            PoolEntry::MethodHandle { kind, member } => {
                let member = self.intern_from(source, member)?;
                self.method_handle(kind, member)
            }
            PoolEntry::MethodType { descriptor } => {
                let descriptor = source.utf8(descriptor)?.to_string();
                self.method_type(&descriptor)
            }
            PoolEntry::Dynamic { bootstrap_method, name_and_type } => {
                let name_and_type = self.intern_from(source, name_and_type)?;
                self.index(PoolEntry::Dynamic { bootstrap_method, name_and_type })
            }
            PoolEntry::InvokeDynamic { bootstrap_method, name_and_type } => {
                let name_and_type = self.intern_from(source, name_and_type)?;
                self.index(PoolEntry::InvokeDynamic { bootstrap_method, name_and_type })
            }
            PoolEntry::Module { name } => {
                let name = source.utf8(name)?.to_string();
                self.module(&name)
            }
            PoolEntry::Package { name } => {
                let name = source.utf8(name)?.to_string();
                self.package(&name)
            }
        }
    }

    /// Translate a pool index that may belong to a foreign pool. This is the
    /// single entry point the builders use when re-emitting decoded elements.
    pub fn translate(&mut self, index: PoolIndex, source: Option<&dyn PoolRead>) -> Result<u16> {
        if index.owner == self.id {
            return Ok(index.index);
        }
        match source {
            Some(source) if source.pool_id() == index.owner => {
                self.intern_from(source, index.index)
            }
            _ => Err(Error::IllegalArgument(format!(
                "pool index {} belongs to an unrelated pool",
                index.index
            ))),
        }
    }

    /// Serialize the pool, count field first.
    pub fn encode(&self, buf: &mut ByteBuf) -> Result<()> {
        buf.write_u2(self.slots.len() as u16 + 1);
        for slot in &self.slots {
            if let BuilderSlot::Entry(entry) = slot {
                entry.serialize(buf)?;
            }
        }
        Ok(())
    }
}

impl PoolRead for PoolBuilder {
    fn pool_id(&self) -> u32 {
        self.id
    }

    fn size(&self) -> u16 {
        self.slots.len() as u16 + 1
    }

    fn entry(&self, index: u16) -> Result<&PoolEntry> {
        if index == 0 || index as usize > self.slots.len() {
            return Err(Error::ConstantPool(format!(
                "index {index} out of range 1..{}",
                self.size()
            )));
        }
        match &self.slots[index as usize - 1] {
            BuilderSlot::Entry(entry) => Ok(entry),
            BuilderSlot::Reserved => Err(Error::ConstantPool(format!(
                "index {index} is the reserved slot after a Long/Double entry"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_existing_index() {
        let mut pool = PoolBuilder::new();
        let a = PoolBuilder::utf8(&mut pool, "Foo").unwrap();
        let b = PoolBuilder::utf8(&mut pool, "Foo").unwrap();
        assert_eq!(a, b);
        let c1 = pool.class("Foo").unwrap();
        let c2 = pool.class("Foo").unwrap();
        assert_eq!(c1, c2);
        assert_eq!(pool.size(), 3); // Utf8 + Class + header slot
    }

    #[test]
    fn long_occupies_two_slots() {
        let mut pool = PoolBuilder::new();
        let l = pool.long(42).unwrap();
        let next = PoolBuilder::utf8(&mut pool, "after").unwrap();
        assert_eq!(l, 1);
        assert_eq!(next, 3);
        assert!(matches!(pool.entry(2), Err(Error::ConstantPool(_))));
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn index_zero_and_out_of_range_fail() {
        let mut pool = PoolBuilder::new();
        PoolBuilder::utf8(&mut pool, "x").unwrap();
        assert!(matches!(pool.entry(0), Err(Error::ConstantPool(_))));
        assert!(matches!(pool.entry(2), Err(Error::ConstantPool(_))));
    }

    #[test]
    fn typed_accessor_rejects_wrong_kind() {
        let mut pool = PoolBuilder::new();
        let idx = PoolBuilder::utf8(&mut pool, "not a class").unwrap();
        assert!(matches!(pool.class_name(idx), Err(Error::ConstantPool(_))));
    }

    #[test]
    fn member_ref_resolves_through_children() {
        let mut pool = PoolBuilder::new();
        let idx = pool.method_ref("java/lang/Object", "<init>", "()V").unwrap();
        let (class, name, descriptor) = pool.member_ref(idx).unwrap();
        assert_eq!(class, "java/lang/Object");
        assert_eq!(name, "<init>");
        assert_eq!(descriptor, "()V");
    }

    #[test]
    fn bound_pool_scan_and_lazy_decode() {
        // Hand-rolled pool: count=4, Utf8 "Hi", Long 7 (takes slots 2-3)
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.push(tag::UTF8);
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(b"Hi");
        bytes.push(tag::LONG);
        bytes.extend_from_slice(&7u64.to_be_bytes());
        let pool = BoundPool::scan(Rc::from(bytes.into_boxed_slice()), 10).unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.utf8(1).unwrap(), "Hi");
        assert_eq!(pool.entry(2).unwrap(), &PoolEntry::Long(7));
        assert!(pool.entry(3).is_err());
        // Memoized access returns the same decoded entry
        assert_eq!(pool.utf8(1).unwrap(), "Hi");
    }

    #[test]
    fn from_pool_preserves_indices_and_dedupes_new_entries() {
        let mut source = PoolBuilder::new();
        let foo = PoolBuilder::utf8(&mut source, "Foo").unwrap();
        let class = source.class("Foo").unwrap();
        let mut mirror = PoolBuilder::from_pool(&source).unwrap();
        assert_eq!(PoolBuilder::utf8(&mut mirror, "Foo").unwrap(), foo);
        assert_eq!(mirror.class("Foo").unwrap(), class);
        assert_eq!(mirror.size(), source.size());
    }

    #[test]
    fn intern_from_clones_entry_graphs() {
        let mut source = PoolBuilder::new();
        let ref_idx = source.method_ref("A", "m", "()I").unwrap();
        let mut target = PoolBuilder::new();
        // Seed the target so indices diverge from the source
        PoolBuilder::utf8(&mut target, "unrelated").unwrap();
        let cloned = target.intern_from(&source, ref_idx).unwrap();
        let (class, name, descriptor) = target.member_ref(cloned).unwrap();
        assert_eq!((class, name, descriptor), ("A", "m", "()I"));
        // Interning again finds the same entry
        assert_eq!(target.intern_from(&source, ref_idx).unwrap(), cloned);
    }

    #[test]
    fn translate_checks_ownership() {
        let mut source = PoolBuilder::new();
        let idx = PoolBuilder::utf8(&mut source, "x").unwrap();
        let tagged = source.index_of(idx);
        let mut target = PoolBuilder::new();
        assert!(target.translate(tagged, None).is_err());
        let translated = target.translate(tagged, Some(&source)).unwrap();
        assert_eq!(PoolBuilder::utf8(&mut target, "x").unwrap(), translated);
        // An index the target itself issued passes through unchanged
        let own = target.index_of(translated);
        assert_eq!(target.translate(own, None).unwrap(), translated);
    }

    #[test]
    fn pool_overflow_reports() {
        let mut pool = PoolBuilder::new();
        for i in 0..65534u32 {
            if pool.integer(i as i32).is_err() {
                panic!("unexpected early overflow at {i}");
            }
        }
        assert!(matches!(PoolBuilder::utf8(&mut pool, "straw"), Err(Error::ConstantPool(_))));
    }

    #[test]
    fn encode_writes_count_then_entries() {
        let mut pool = PoolBuilder::new();
        PoolBuilder::utf8(&mut pool, "A").unwrap();
        let mut buf = ByteBuf::new();
        pool.encode(&mut buf).unwrap();
        assert_eq!(buf.into_vec(), vec![0, 2, 1, 0, 1, b'A']);
    }
}
