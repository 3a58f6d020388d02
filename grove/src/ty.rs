//! Classification of declared types into serialization kinds.
//!
//! [`Type`] describes the declared type of a value position (a field, an
//! array element, a pointer target) and prints and parses the type names
//! that appear in documents. [`Kind`] is the nine-way classification the
//! engine dispatches on.

use core::fmt;

use crate::descriptor::{self, ClassKind};

/// Primitive scalar categories.
///
/// Wire names are the ones used by the reference tree-document format
/// (`bool`, `byte`, `ubyte`, `short`, `ushort`, `int`, `uint`, `long`,
/// `ulong`, `float`, `double`, `char`) so that documents round-trip
/// across implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    /// `bool`
    Bool,
    /// `byte`
    I8,
    /// `ubyte`
    U8,
    /// `short`
    I16,
    /// `ushort`
    U16,
    /// `int`
    I32,
    /// `uint`
    U32,
    /// `long`
    I64,
    /// `ulong`
    U64,
    /// `float`
    F32,
    /// `double`
    F64,
    /// `char`
    Char,
}

impl Scalar {
    /// The wire name of this scalar.
    pub fn name(self) -> &'static str {
        match self {
            Scalar::Bool => "bool",
            Scalar::I8 => "byte",
            Scalar::U8 => "ubyte",
            Scalar::I16 => "short",
            Scalar::U16 => "ushort",
            Scalar::I32 => "int",
            Scalar::U32 => "uint",
            Scalar::I64 => "long",
            Scalar::U64 => "ulong",
            Scalar::F32 => "float",
            Scalar::F64 => "double",
            Scalar::Char => "char",
        }
    }

    /// The scalar named by `name`, if any.
    pub fn from_name(name: &str) -> Option<Self> {
        let scalar = match name {
            "bool" => Scalar::Bool,
            "byte" => Scalar::I8,
            "ubyte" => Scalar::U8,
            "short" => Scalar::I16,
            "ushort" => Scalar::U16,
            "int" => Scalar::I32,
            "uint" => Scalar::U32,
            "long" => Scalar::I64,
            "ulong" => Scalar::U64,
            "float" => Scalar::F32,
            "double" => Scalar::F64,
            "char" => Scalar::Char,
            _ => return None,
        };
        Some(scalar)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The nine-way classification of a value position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Integers, floats, booleans and characters.
    Primitive,
    /// A character sequence with identity-sensitive storage.
    String,
    /// A homogeneous sequence with identity-sensitive storage.
    Array,
    /// A reference-typed key/value mapping.
    Mapping,
    /// A composite by-value aggregate with named fields.
    Record,
    /// A polymorphic reference-typed aggregate with a runtime class tag.
    Object,
    /// A reference to exactly one other value.
    Pointer,
    /// A tagged primitive with a named type.
    Enum,
    /// A named type structurally identical to its base.
    Alias,
}

/// A declared type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// A primitive scalar.
    Scalar(Scalar),
    /// A character string.
    Str,
    /// An array with the given element type.
    Array(Box<Type>),
    /// An associative array with the given key and value types.
    Map(Box<Type>, Box<Type>),
    /// A record type with the given name.
    Struct(String),
    /// A class type with the given name.
    Object(String),
    /// A pointer to a value of the given type.
    Pointer(Box<Type>),
    /// An enumeration with the given name.
    Enum(String),
    /// A named alias of another type.
    Alias(String),
}

impl Type {
    /// Classifies this type.
    pub fn kind(&self) -> Kind {
        match self {
            Type::Scalar(_) => Kind::Primitive,
            Type::Str => Kind::String,
            Type::Array(_) => Kind::Array,
            Type::Map(_, _) => Kind::Mapping,
            Type::Struct(_) => Kind::Record,
            Type::Object(_) => Kind::Object,
            Type::Pointer(_) => Kind::Pointer,
            Type::Enum(_) => Kind::Enum,
            Type::Alias(_) => Kind::Alias,
        }
    }

    /// Parses a type name as it appears in documents.
    ///
    /// Suffix syntax takes precedence: `T[]` is an array, `T*` a
    /// pointer, `V[K]` an associative array. Bare names resolve to the
    /// registered class kind, defaulting to a record when the name is
    /// unknown.
    pub fn parse(name: &str) -> Type {
        let name = name.trim();
        if let Some(elem) = name.strip_suffix("[]") {
            return Type::Array(Box::new(Type::parse(elem)));
        }
        if let Some(target) = name.strip_suffix('*') {
            return Type::Pointer(Box::new(Type::parse(target)));
        }
        if name.ends_with(']') {
            if let Some((value, key)) = split_map(name) {
                return Type::Map(
                    Box::new(Type::parse(key)),
                    Box::new(Type::parse(value)),
                );
            }
        }
        if name == "string" {
            return Type::Str;
        }
        if let Some(scalar) = Scalar::from_name(name) {
            return Type::Scalar(scalar);
        }
        match descriptor::registered_kind(name) {
            Some(ClassKind::Object) => Type::Object(name.to_string()),
            _ => Type::Struct(name.to_string()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(scalar) => f.write_str(scalar.name()),
            Type::Str => f.write_str("string"),
            Type::Array(elem) => write!(f, "{elem}[]"),
            Type::Map(key, value) => write!(f, "{value}[{key}]"),
            Type::Struct(name)
            | Type::Object(name)
            | Type::Enum(name)
            | Type::Alias(name) => f.write_str(name),
            Type::Pointer(target) => write!(f, "{target}*"),
        }
    }
}

/// Splits `value[key]` at the bracket pair that closes the name.
fn split_map(name: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (index, ch) in name.char_indices().rev() {
        match ch {
            ']' => depth += 1,
            '[' => {
                depth -= 1;
                if depth == 0 {
                    let value = &name[..index];
                    let key = &name[index + 1..name.len() - 1];
                    if value.is_empty() || key.is_empty() {
                        return None;
                    }
                    return Some((value, key));
                }
            }
            _ => {}
        }
    }
    None
}
