//! The contract between the engine and a document backend.
//!
//! An [`Archive`] turns the engine's normalized emit calls into a
//! structured document and answers the inverse read calls. Compound
//! openers take an inner action that runs with the archive positioned
//! inside the new node; the archive restores the previous position on
//! every exit path, including errors. [`Backend`] adds run lifecycle
//! and document extraction on top.

pub mod xml;

use crate::error::Result;
use crate::ty::Scalar;

/// A run-unique identifier naming a node in the document.
pub type Id = usize;

/// An inner action run with the archive positioned inside a compound
/// node.
pub type Inner<'a> = &'a mut dyn FnMut(&mut dyn Archive) -> Result<()>;

/// Provenance of an array's backing storage, captured when the array is
/// archived and consulted by the slice post-processing pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayRecord {
    /// Identity of the backing storage.
    pub address: usize,
    /// Start of the archived range within the storage, in elements.
    pub offset: usize,
    /// Length of the archived range, in elements.
    pub len: usize,
}

impl ArrayRecord {
    /// Whether `other` covers a range of the same storage that lies
    /// within this record's range.
    pub fn contains(&self, other: &ArrayRecord) -> bool {
        self.address == other.address
            && self.offset <= other.offset
            && other.offset + other.len <= self.offset + self.len
    }
}

/// A sub-range of a previously archived array, in elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice {
    /// Offset from the start of the parent array's range.
    pub offset: usize,
    /// Number of elements.
    pub len: usize,
}

/// Classification of a document node, as reported by [`Archive::peek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A primitive literal of the given scalar.
    Primitive(Scalar),
    /// A string node.
    String,
    /// An array node.
    Array,
    /// An associative array node.
    AssociativeArray,
    /// A record node.
    Struct,
    /// An object node.
    Object,
    /// A pointer node.
    Pointer,
    /// An enumeration node.
    Enum,
    /// An alias node.
    Typedef,
    /// A reference to an earlier node.
    Reference,
    /// A rewritten array sharing another array's storage.
    Slice,
    /// A null pointer or object.
    Null,
}

/// Header of an object node.
#[derive(Clone, Debug)]
pub struct ObjectHeader {
    /// The node id.
    pub id: Id,
    /// The concrete class name, for factory reconstruction.
    pub runtime_type: String,
    /// The declared type name.
    pub static_type: String,
}

/// Header of a record or alias node.
#[derive(Clone, Debug)]
pub struct StructHeader {
    /// The node id.
    pub id: Id,
    /// The type name.
    pub ty: String,
}

/// Header of an array node.
#[derive(Clone, Debug)]
pub struct ArrayHeader {
    /// The node id.
    pub id: Id,
    /// The element type name.
    pub elem: String,
    /// The element count.
    pub len: usize,
}

/// Header of an associative array node.
#[derive(Clone, Debug)]
pub struct MapHeader {
    /// The node id.
    pub id: Id,
    /// The key type name.
    pub key: String,
    /// The value type name.
    pub value: String,
    /// The entry count.
    pub len: usize,
}

/// A primitive node.
#[derive(Clone, Debug)]
pub struct PrimitiveNode {
    /// The node id.
    pub id: Id,
    /// The scalar type name.
    pub ty: String,
    /// The literal text.
    pub value: String,
}

/// A string node.
#[derive(Clone, Debug)]
pub struct StringNode {
    /// The node id.
    pub id: Id,
    /// The element type name.
    pub elem: String,
    /// The string content.
    pub value: String,
}

/// An enumeration node.
#[derive(Clone, Debug)]
pub struct EnumNode {
    /// The node id.
    pub id: Id,
    /// The enumeration type name.
    pub ty: String,
    /// The scalar name of the base value.
    pub base: String,
    /// The literal text of the base value.
    pub value: String,
}

/// A slice node produced by post-processing.
#[derive(Clone, Copy, Debug)]
pub struct SliceNode {
    /// The slice's own id (the id of the rewritten array).
    pub id: Id,
    /// The id of the array whose storage the slice shares.
    pub array: Id,
    /// Offset from the start of that array, in elements.
    pub offset: usize,
    /// Number of elements.
    pub len: usize,
}

/// The emit/read surface a backend exposes to the engine.
///
/// All operations are keyed: within one scope every archived node
/// carries a key unique to that scope, which makes reading independent
/// of field order.
pub trait Archive {
    /// Opens an object node and runs `inner` positioned inside it.
    fn archive_object(
        &mut self,
        runtime_ty: &str,
        static_ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens a record node and runs `inner` positioned inside it.
    fn archive_struct(
        &mut self,
        ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens an array node and runs `inner` positioned inside it.
    fn archive_array(
        &mut self,
        record: &ArrayRecord,
        elem_ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens an associative array node and runs `inner` positioned
    /// inside it.
    fn archive_associative_array(
        &mut self,
        key_ty: &str,
        value_ty: &str,
        len: usize,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens the key node of one map entry.
    fn archive_associative_array_key(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens the value node of one map entry.
    fn archive_associative_array_value(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens a pointer node; `inner` archives the pointee.
    fn archive_pointer(
        &mut self,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Opens a base-class node within the current object.
    fn archive_base(
        &mut self,
        ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Emits a string node.
    fn archive_string(
        &mut self,
        value: &str,
        elem_ty: &str,
        key: &str,
        id: Id,
    ) -> Result<()>;

    /// Emits a primitive node.
    fn archive_primitive(
        &mut self,
        ty: &str,
        value: &str,
        key: &str,
        id: Id,
    ) -> Result<()>;

    /// Emits an enumeration node.
    fn archive_enum(
        &mut self,
        ty: &str,
        base_ty: &str,
        value: &str,
        key: &str,
        id: Id,
    ) -> Result<()>;

    /// Opens an alias node; `inner` archives the wrapped value.
    fn archive_typedef(
        &mut self,
        ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Emits a reference to the node with id `target`.
    fn archive_reference(&mut self, key: &str, target: Id) -> Result<()>;

    /// Emits a null node of the given declared type.
    fn archive_null(&mut self, ty: &str, key: &str) -> Result<()>;

    /// Rewrites the array archived under `id` as a slice of the array
    /// archived under `array`.
    fn archive_slice(&mut self, slice: Slice, id: Id, array: Id)
        -> Result<()>;

    /// Rewrites the pointer archived under `pointer` as an edge to the
    /// value node archived under `target`.
    fn archive_pointer_target(
        &mut self,
        target: Id,
        target_key: &str,
        pointer: Id,
    ) -> Result<()>;

    /// Confirms that the array archived under `id` is standalone, after
    /// all arrays of the run are known.
    fn post_process_array(&mut self, id: Id) -> Result<()>;

    /// Confirms that the pointer archived under `id` keeps its inline
    /// pointee, after all values of the run are known.
    fn post_process_pointer(&mut self, id: Id) -> Result<()>;

    /// Classifies the node archived under `key` in the current scope,
    /// or `None` when the scope has no such node.
    fn peek(&mut self, key: &str) -> Result<Option<NodeKind>>;

    /// Reads an object node, running `inner` positioned inside it.
    fn unarchive_object(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &ObjectHeader) -> Result<()>,
    ) -> Result<()>;

    /// Reads a record node, running `inner` positioned inside it.
    fn unarchive_struct(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &StructHeader) -> Result<()>,
    ) -> Result<()>;

    /// Reads an array node, running `inner` positioned inside it.
    fn unarchive_array(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &ArrayHeader) -> Result<()>,
    ) -> Result<()>;

    /// Reads an associative array node, running `inner` positioned
    /// inside it.
    fn unarchive_associative_array(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &MapHeader) -> Result<()>,
    ) -> Result<()>;

    /// Reads the key node of one map entry.
    fn unarchive_associative_array_key(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Reads the value node of one map entry.
    fn unarchive_associative_array_value(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()>;

    /// Reads a pointer node, running `inner` positioned inside it.
    fn unarchive_pointer(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, Id) -> Result<()>,
    ) -> Result<()>;

    /// Reads the base-class node of the given type within the current
    /// object, running `inner` positioned inside it.
    fn unarchive_base(
        &mut self,
        ty: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, Id) -> Result<()>,
    ) -> Result<()>;

    /// Reads a string node.
    fn unarchive_string(&mut self, key: &str) -> Result<StringNode>;

    /// Reads a primitive node.
    fn unarchive_primitive(&mut self, key: &str) -> Result<PrimitiveNode>;

    /// Reads an enumeration node.
    fn unarchive_enum(&mut self, key: &str) -> Result<EnumNode>;

    /// Reads an alias node, running `inner` positioned inside it.
    fn unarchive_typedef(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &StructHeader) -> Result<()>,
    ) -> Result<()>;

    /// The id a reference node under `key` points to, or `None` when
    /// the scope has no reference under that key.
    fn unarchive_reference(&mut self, key: &str) -> Result<Option<Id>>;

    /// The slice node under `key`, or `None` when the scope has no
    /// slice under that key.
    fn unarchive_slice(&mut self, key: &str) -> Result<Option<SliceNode>>;

    /// The declared type of a null node under `key`, or `None` when the
    /// scope has no null under that key.
    fn unarchive_null(&mut self, key: &str) -> Result<Option<String>>;

    /// The keys of the current scope's nodes, in document order.
    fn scope_keys(&mut self) -> Result<Vec<String>>;
}

/// Run lifecycle and document extraction of a backend.
pub trait Backend: Archive {
    /// The opaque document type this backend produces and consumes.
    type Data;

    /// Starts a fresh document for a serialization run.
    fn begin_archiving(&mut self);

    /// Loads a document for a deserialization run.
    fn begin_unarchiving(&mut self, data: &Self::Data) -> Result<()>;

    /// The serialized document.
    fn untyped_data(&self) -> Result<Self::Data>;

    /// Discards all document state.
    fn reset(&mut self);
}
