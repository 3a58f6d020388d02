//! Class descriptors and the process-wide type registry.
//!
//! A [`ClassInfo`] describes a record or object type: its fields in
//! declaration order, its base class, the field names excluded from
//! archiving, lifecycle hooks, and the optional custom archiving
//! capability. Descriptors registered with [`register_class`] drive
//! polymorphic reconstruction; [`reset_registered_classes`] clears the
//! registry for tests.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use crate::de::DeserializeContext;
use crate::error::Result;
use crate::ser::SerializeContext;
use crate::ty::{Scalar, Type};
use crate::value::{
    slot, AliasValue, ArrayValue, EnumValue, Fields, MapValue, ObjectValue,
    Primitive, Slot, StrValue, StructValue, Value,
};

/// Whether a class describes a record or an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    /// A by-value record.
    Record,
    /// A reference-typed object.
    Object,
}

/// A declared field of a record or object.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    /// The field name.
    pub name: String,
    /// The declared field type.
    pub ty: Type,
}

/// A lifecycle hook fired on the field set of a record or object.
pub type Lifecycle = fn(&Fields);

/// The serialize half of a type's custom archiving capability. Runs
/// with the archive positioned inside the opened node.
pub type SerializeWith = fn(&mut SerializeContext<'_>, &Value) -> Result<()>;

/// The deserialize half of a type's custom archiving capability. Runs
/// positioned inside the node and writes the result through the slot.
pub type DeserializeWith =
    fn(&mut DeserializeContext<'_>, &Slot) -> Result<()>;

/// Descriptor of a record or object type.
#[derive(Clone, Debug)]
pub struct ClassInfo {
    /// The fully-qualified type name.
    pub name: String,
    /// Record or object.
    pub kind: ClassKind,
    /// Declared fields, in declaration order.
    pub fields: Vec<FieldInfo>,
    /// The base class name, for objects below the hierarchy root.
    pub base: Option<String>,
    /// Field names excluded from archiving.
    pub transient: Vec<String>,
    /// Fired before the fields of a value are archived.
    pub on_serializing: Option<Lifecycle>,
    /// Fired after the fields of a value were archived.
    pub on_serialized: Option<Lifecycle>,
    /// Fired after instantiation, before fields are read back.
    pub on_deserializing: Option<Lifecycle>,
    /// Fired after the fields of a value were read back.
    pub on_deserialized: Option<Lifecycle>,
    /// Replaces the field walk when archiving values of this type.
    pub serialize_with: Option<SerializeWith>,
    /// Replaces the field walk when reconstructing values of this type.
    pub deserialize_with: Option<DeserializeWith>,
}

impl ClassInfo {
    fn new(name: impl Into<String>, kind: ClassKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            base: None,
            transient: Vec::new(),
            on_serializing: None,
            on_serialized: None,
            on_deserializing: None,
            on_deserialized: None,
            serialize_with: None,
            deserialize_with: None,
        }
    }

    /// Describes an object type.
    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Object)
    }

    /// Describes a record type.
    pub fn record(name: impl Into<String>) -> Self {
        Self::new(name, ClassKind::Record)
    }

    /// Appends a declared field, builder style.
    pub fn field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.push(FieldInfo {
            name: name.into(),
            ty,
        });
        self
    }

    /// Names the base class, builder style.
    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.base = Some(name.into());
        self
    }

    /// Excludes a field from archiving, builder style.
    pub fn transient(mut self, name: impl Into<String>) -> Self {
        self.transient.push(name.into());
        self
    }

    /// Installs the custom archiving capability, builder style.
    pub fn archive_with(
        mut self,
        serialize: SerializeWith,
        deserialize: DeserializeWith,
    ) -> Self {
        self.serialize_with = Some(serialize);
        self.deserialize_with = Some(deserialize);
        self
    }

    /// Installs lifecycle hooks, builder style. Pass `None` to leave a
    /// hook uninstalled.
    pub fn lifecycle(
        mut self,
        on_serializing: Option<Lifecycle>,
        on_serialized: Option<Lifecycle>,
        on_deserializing: Option<Lifecycle>,
        on_deserialized: Option<Lifecycle>,
    ) -> Self {
        self.on_serializing = on_serializing;
        self.on_serialized = on_serialized;
        self.on_deserializing = on_deserializing;
        self.on_deserialized = on_deserialized;
        self
    }

    /// Whether the named field is excluded from archiving.
    pub fn is_transient(&self, name: &str) -> bool {
        self.transient.iter().any(|transient| transient == name)
    }

    /// Fresh default-valued slots for this class's own declared fields.
    pub fn default_fields(&self) -> Fields {
        let mut fields = Fields::new();
        for field in &self.fields {
            fields.push_slot(
                field.name.clone(),
                slot(default_value(Some(&field.ty))),
            );
        }
        fields
    }

    /// The runtime factory: a fresh instance with default-valued
    /// fields, including every base class's fields.
    pub fn instantiate(&self) -> ObjectValue {
        let mut fields = self.default_fields();
        let mut seen = vec![self.name.clone()];
        let mut base = self.base.clone();
        while let Some(name) = base {
            if seen.contains(&name) {
                break;
            }
            seen.push(name.clone());
            let Some(info) = lookup_class(&name) else {
                break;
            };
            for field in &info.fields {
                if fields.get(&field.name).is_none() {
                    fields.push_slot(
                        field.name.clone(),
                        slot(default_value(Some(&field.ty))),
                    );
                }
            }
            base = info.base.clone();
        }
        ObjectValue::from_parts(self.name.clone(), fields)
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, ClassInfo>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Registers a class so values of its runtime type can be reconstructed
/// and polymorphic values can be archived. Re-registering a name
/// replaces the previous descriptor.
pub fn register_class(info: ClassInfo) {
    log::debug!("registering class `{}`", info.name);
    if let Ok(mut registry) = REGISTRY.write() {
        registry.insert(info.name.clone(), info);
    }
}

/// The registered descriptor of the named class.
pub fn lookup_class(name: &str) -> Option<ClassInfo> {
    REGISTRY.read().ok()?.get(name).cloned()
}

/// Clears every registration. Intended for tests.
pub fn reset_registered_classes() {
    if let Ok(mut registry) = REGISTRY.write() {
        registry.clear();
    }
}

/// The registered kind of the named class, if any.
pub(crate) fn registered_kind(name: &str) -> Option<ClassKind> {
    REGISTRY.read().ok()?.get(name).map(|info| info.kind)
}

/// The default value of a declared type: zero scalars, empty strings
/// and containers, null pointers and objects.
pub fn default_value(ty: Option<&Type>) -> Value {
    let Some(ty) = ty else {
        return Value::Null(None);
    };
    match ty {
        Type::Scalar(scalar) => Value::Primitive(Primitive::zero(*scalar)),
        Type::Str => Value::Str(StrValue::new("")),
        Type::Array(elem) => {
            Value::Array(ArrayValue::new((**elem).clone(), Vec::new()))
        }
        Type::Map(key, value) => {
            Value::Map(MapValue::new((**key).clone(), (**value).clone()))
        }
        Type::Pointer(_) | Type::Object(_) => Value::Null(Some(ty.clone())),
        Type::Struct(name) => {
            let fields = lookup_class(name)
                .map(|info| info.default_fields())
                .unwrap_or_default();
            Value::Struct(StructValue {
                name: name.clone(),
                fields,
            })
        }
        Type::Enum(name) => Value::Enum(EnumValue {
            name: name.clone(),
            value: Primitive::zero(Scalar::I32),
        }),
        Type::Alias(name) => Value::Alias(AliasValue {
            name: name.clone(),
            value: slot(Value::Null(None)),
        }),
    }
}

/// Serializes registry mutations in tests that register or reset
/// classes, since the registry is process-wide.
#[cfg(test)]
pub(crate) fn registry_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
