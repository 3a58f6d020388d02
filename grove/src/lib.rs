//! # grove
//!
//! grove is an object-graph serialization engine. It converts an
//! in-memory value graph (primitives, records, arrays, maps,
//! polymorphic objects, pointers, including shared subgraphs and
//! cycles) into a self-describing tree document, and reconstructs an
//! equal graph from that document.
//!
//! ## Design
//!
//! The engine works on a runtime value model ([`Value`]) instead of
//! compile-time trait dispatch: every value classifies into one of nine
//! kinds and the engine branches on that tag. This is what lets a
//! single engine preserve *identity*: every reference-typed value is
//! archived exactly once and later occurrences become references to its
//! id, so aliasing, shared storage and cyclic structure survive a round
//! trip. Array views that share storage are detected after the main
//! pass and rewritten as slices; pointers into archived fields become
//! explicit pointer-to-value edges.
//!
//! The document format is pluggable: the engine talks to an
//! [`Archive`], and the reference backend is [`XmlArchive`], a textual
//! element/attribute tree.
//!
//! ```
//! use grove::{Serializer, Value};
//!
//! let mut serializer = Serializer::default();
//! let data = serializer.serialize(&Value::from(42i32)).unwrap();
//! assert!(data.contains("<int key=\"0\" id=\"0\">42</int>"));
//!
//! let out = serializer.deserialize(&data).unwrap();
//! assert!(grove::deep_eq(&out, &Value::from(42i32)));
//! ```
//!
//! ## Polymorphism and hooks
//!
//! Objects carry a runtime class name. Reconstruction (and archiving a
//! value through a wider declared type) needs a [`ClassInfo`]
//! registered with [`register_class`]; the descriptor also supplies the
//! declared field list, transient-field filter, lifecycle hooks and an
//! optional custom archiving capability. Per-instance custom hooks can
//! be registered on a [`Serializer`] keyed by runtime type name.
//!
//! One serializer instance is single-threaded and non-reentrant; the
//! only process-wide state is the class registry, which is read-mostly
//! after initialization and can be cleared for tests.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod archive;
pub mod de;
pub mod descriptor;
pub mod error;
pub mod ser;
mod serializer;
pub mod ty;
pub mod value;

#[doc(inline)]
pub use crate::{
    archive::{xml::XmlArchive, Archive, ArrayRecord, Backend, Id, Slice},
    de::DeserializeContext,
    descriptor::{
        register_class, reset_registered_classes, ClassInfo, ClassKind,
        FieldInfo,
    },
    error::{Error, ErrorCallback, ErrorKind, Result},
    ser::SerializeContext,
    serializer::{DeserializeHook, SerializeHook, Serializer},
    ty::{Kind, Scalar, Type},
    value::{
        deep_eq, slot, ArrayValue, Fields, MapValue, ObjectValue,
        PointerValue, Primitive, Slot, StructValue, Value,
    },
};
