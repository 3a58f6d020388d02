//! The public serialization façade.
//!
//! A [`Serializer`] owns a backend and the per-run engine state. One
//! instance is single-threaded and non-reentrant: a run is either
//! serializing or deserializing, tables grow until [`reset`] or until
//! the run switches from serializing to deserializing, and every
//! failure is routed through the installed error callback.
//!
//! [`reset`]: Serializer::reset

use std::rc::Rc;

use hashbrown::HashMap;

use crate::archive::xml::XmlArchive;
use crate::archive::{Backend, Id};
use crate::de::{DeserializeContext, Pool};
use crate::error::{
    do_nothing_on_error, throw_on_error, Error, ErrorCallback, Result,
};
use crate::ser::{SerializeContext, Share};
use crate::value::{slot, Slot, Value};

/// A custom serializer, invoked positioned inside the opened node of
/// the value it is registered for.
pub type SerializeHook =
    Rc<dyn Fn(&mut SerializeContext<'_>, &Value) -> Result<()>>;

/// A custom deserializer, invoked positioned inside the node being
/// read; it writes the reconstructed value through the slot.
pub type DeserializeHook =
    Rc<dyn Fn(&mut DeserializeContext<'_>, &Slot) -> Result<()>>;

/// What the engine is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    Serializing,
    Deserializing,
}

/// Per-run engine state shared by both halves of the engine.
pub(crate) struct Context {
    pub(crate) state: State,
    id_counter: Id,
    key_counter: usize,
    pub(crate) share: Share,
    pub(crate) pool: Pool,
    pub(crate) serializers: HashMap<String, SerializeHook>,
    pub(crate) deserializers: HashMap<String, DeserializeHook>,
    pub(crate) error_callback: ErrorCallback,
    /// The classes whose fields are currently being walked, innermost
    /// last. Consulted by the nested base-class operations.
    pub(crate) class_stack: Vec<String>,
}

impl Context {
    fn new() -> Self {
        Self {
            state: State::Idle,
            id_counter: 0,
            key_counter: 0,
            share: Share::new(),
            pool: Pool::new(),
            serializers: HashMap::new(),
            deserializers: HashMap::new(),
            error_callback: throw_on_error(),
            class_stack: Vec::new(),
        }
    }

    /// Allocates the next run-unique id.
    pub(crate) fn next_id(&mut self) -> Id {
        let id = self.id_counter;
        self.id_counter += 1;
        id
    }

    /// Allocates the next synthetic key.
    pub(crate) fn next_key(&mut self) -> String {
        let key = self.key_counter;
        self.key_counter += 1;
        key.to_string()
    }

    /// Routes an error through the installed callback. `Err` means the
    /// callback chose to abort the run.
    pub(crate) fn report(&self, mut error: Error) -> Result<()> {
        error.reported = true;
        if (self.error_callback)(&error) {
            Err(error)
        } else {
            Ok(())
        }
    }

    pub(crate) fn reset_counters(&mut self) {
        self.id_counter = 0;
        self.key_counter = 0;
    }

    pub(crate) fn clear_tables(&mut self) {
        self.share.clear();
        self.pool.clear();
        self.class_stack.clear();
    }
}

/// The serialization engine.
///
/// `serialize` turns a value graph into the backend's document,
/// `deserialize` reconstructs an equal graph, with aliasing, cycles and
/// array slices preserved. Custom per-type hooks and the process-wide
/// class registry ([`register_class`]) extend both directions.
///
/// [`register_class`]: crate::descriptor::register_class
pub struct Serializer<A: Backend = XmlArchive> {
    archive: A,
    ctx: Context,
}

impl Default for Serializer<XmlArchive> {
    fn default() -> Self {
        Self::new(XmlArchive::new())
    }
}

impl<A: Backend> Serializer<A> {
    /// Creates an engine over the given backend.
    pub fn new(archive: A) -> Self {
        Self {
            archive,
            ctx: Context::new(),
        }
    }

    /// Archives a value under the next synthetic key and returns the
    /// document. Repeated calls within one run append further roots.
    pub fn serialize(&mut self, value: &Value) -> Result<A::Data> {
        self.begin_serialize()?;
        let key = self.ctx.next_key();
        self.serialize_root(value, &key)
    }

    /// Archives a value under the given key and returns the document.
    pub fn serialize_with_key(
        &mut self,
        value: &Value,
        key: &str,
    ) -> Result<A::Data> {
        self.begin_serialize()?;
        self.serialize_root(value, key)
    }

    /// Reconstructs the value archived under the next synthetic key.
    pub fn deserialize(&mut self, data: &A::Data) -> Result<Value> {
        self.begin_deserialize(data)?;
        let key = self.ctx.next_key();
        self.deserialize_root(&key)
    }

    /// Reconstructs the value archived under the given key.
    pub fn deserialize_with_key(
        &mut self,
        data: &A::Data,
        key: &str,
    ) -> Result<Value> {
        self.begin_deserialize(data)?;
        self.deserialize_root(key)
    }

    /// Registers a custom serializer for the given runtime type name.
    pub fn register_serializer(
        &mut self,
        ty: impl Into<String>,
        hook: SerializeHook,
    ) {
        self.ctx.serializers.insert(ty.into(), hook);
    }

    /// Registers a custom deserializer for the given runtime type name.
    pub fn register_deserializer(
        &mut self,
        ty: impl Into<String>,
        hook: DeserializeHook,
    ) {
        self.ctx.deserializers.insert(ty.into(), hook);
    }

    /// Clears all per-run tables and counters and resets the backend.
    /// Registered hooks and the error callback survive.
    pub fn reset(&mut self) {
        self.ctx.reset_counters();
        self.ctx.clear_tables();
        self.ctx.state = State::Idle;
        self.archive.reset();
    }

    /// The installed error callback.
    pub fn error_callback(&self) -> ErrorCallback {
        self.ctx.error_callback.clone()
    }

    /// Installs an error callback.
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.ctx.error_callback = callback;
    }

    /// Installs the callback that aborts the run on every error.
    pub fn set_throw_on_error_callback(&mut self) {
        self.ctx.error_callback = throw_on_error();
    }

    /// Installs the callback that swallows every error, letting
    /// operations continue with kind-specific defaults.
    pub fn set_do_nothing_on_error_callback(&mut self) {
        self.ctx.error_callback = do_nothing_on_error();
    }

    /// Whether a serialization run is in progress.
    pub fn is_serializing(&self) -> bool {
        self.ctx.state == State::Serializing
    }

    /// Whether a deserialization run is in progress.
    pub fn is_deserializing(&self) -> bool {
        self.ctx.state == State::Deserializing
    }

    fn begin_serialize(&mut self) -> Result<()> {
        match self.ctx.state {
            State::Serializing => return Ok(()),
            State::Deserializing => {
                self.ctx.report(Error::misuse(
                    "serialize called during a deserialization run",
                ))?;
                self.reset();
            }
            State::Idle => {}
        }
        log::trace!("starting a serialization run");
        self.archive.begin_archiving();
        self.ctx.state = State::Serializing;
        Ok(())
    }

    fn serialize_root(&mut self, value: &Value, key: &str) -> Result<A::Data> {
        {
            let mut context =
                SerializeContext::new(&mut self.archive, &mut self.ctx);
            context.put(value, None, key, None)?;
            context.post_process()?;
        }
        self.archive.untyped_data()
    }

    fn begin_deserialize(&mut self, data: &A::Data) -> Result<()> {
        if self.ctx.state == State::Serializing {
            // Mode switch: the counters restart and the tables clear,
            // the archive keeps working off the supplied data.
            self.ctx.reset_counters();
            self.ctx.clear_tables();
        }
        if self.ctx.state != State::Deserializing {
            log::trace!("starting a deserialization run");
        }
        self.ctx.state = State::Deserializing;
        match self.archive.begin_unarchiving(data) {
            Ok(()) => Ok(()),
            Err(error) if error.reported => Err(error),
            Err(error) => {
                self.ctx.report(error)?;
                self.archive.reset();
                Ok(())
            }
        }
    }

    fn deserialize_root(&mut self, key: &str) -> Result<Value> {
        let root = slot(Value::Null(None));
        {
            let mut context =
                DeserializeContext::new(&mut self.archive, &mut self.ctx);
            context.take_into(key, None, &root)?;
            context.post_process()?;
        }
        let value = root.borrow().clone();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::descriptor::{
        register_class, registry_lock, ClassInfo, DeserializeWith,
        SerializeWith,
    };
    use crate::error::ErrorKind;
    use crate::ty::{Scalar, Type};
    use crate::value::{
        deep_eq, ArrayValue, EnumValue, Fields, MapValue, ObjectValue,
        PointerValue, Primitive, StrValue, StructValue, Value,
    };

    fn round_trip(value: &Value) -> Value {
        let mut serializer = Serializer::default();
        let data = serializer.serialize(value).unwrap();
        serializer.deserialize(&data).unwrap()
    }

    #[test]
    fn archives_an_empty_object() {
        let mut serializer = Serializer::default();
        let data = serializer
            .serialize(&Value::Object(ObjectValue::new("A")))
            .unwrap();
        assert_eq!(
            data,
            "<archive version=\"1.0.0\" type=\"org.dsource.orange.xml\">\
             <data><object runtimeType=\"A\" type=\"A\" key=\"0\" \
             id=\"0\"/></data></archive>"
        );
    }

    #[test]
    fn archives_a_primitive() {
        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::from(42i32)).unwrap();
        assert!(data.contains("<int key=\"0\" id=\"0\">42</int>"));
    }

    #[test]
    fn archives_an_object_field() {
        let mut serializer = Serializer::default();
        let object = ObjectValue::new("B").field("value", 7i32);
        let data = serializer.serialize(&Value::Object(object)).unwrap();
        assert!(data.contains(
            "<object runtimeType=\"B\" type=\"B\" key=\"0\" id=\"0\">\
             <int key=\"value\" id=\"1\">7</int></object>"
        ));
    }

    #[test]
    fn shared_objects_collapse_into_references() {
        let shared = ObjectValue::new("Shared").field("n", 1i32);
        let record = StructValue::new("Holder")
            .field("first", Value::Object(shared.clone()))
            .field("second", Value::Object(shared));
        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Struct(record)).unwrap();
        assert_eq!(data.matches("<object").count(), 1);
        assert!(data.contains("<reference key=\"second\">1</reference>"));
    }

    #[test]
    fn cycles_emit_a_single_node() {
        let node = ObjectValue::new("cycle::Node");
        node.set("next", Value::Object(node.clone()));
        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Object(node)).unwrap();
        assert_eq!(data.matches("<object").count(), 1);
        assert!(data.contains("<reference key=\"next\">0</reference>"));
    }

    #[test]
    fn cycles_reconstruct_their_shape() {
        let _guard = registry_lock();
        register_class(
            ClassInfo::object("cycle::Ring")
                .field("next", Type::Object("cycle::Ring".into())),
        );
        let node = ObjectValue::new("cycle::Ring");
        node.set("next", Value::Object(node.clone()));

        let out = round_trip(&Value::Object(node));
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        let next = out.get("next").unwrap();
        let Value::Object(next) = next.borrow().clone() else {
            panic!("expected an object field");
        };
        assert!(out.ptr_eq(&next));
    }

    #[test]
    fn primitives_round_trip() {
        let values = [
            Value::from(true),
            Value::from(-8i8),
            Value::from(200u8),
            Value::from(-300i16),
            Value::from(60_000u16),
            Value::from(-70_000i32),
            Value::from(4_000_000_000u32),
            Value::from(i64::MIN),
            Value::from(u64::MAX),
            Value::from(1.25f32),
            Value::from(-2.5e300f64),
            Value::from('ß'),
            Value::from("hello world"),
            Value::from(""),
            Value::Null(None),
            Value::Enum(EnumValue {
                name: "Color".into(),
                value: Primitive::U8(2),
            }),
        ];
        for value in &values {
            assert!(deep_eq(&round_trip(value), value), "{value:?}");
        }
    }

    #[test]
    fn arrays_and_maps_round_trip() {
        let array = Value::array_of(
            Type::Scalar(Scalar::I32),
            vec![1i32.into(), 2i32.into(), 3i32.into()],
        );
        assert!(deep_eq(&round_trip(&array), &array));

        let map = MapValue::new(Type::Str, Type::Scalar(Scalar::I64));
        map.insert("one", 1i64);
        map.insert("two", 2i64);
        let map = Value::Map(map);
        assert!(deep_eq(&round_trip(&map), &map));

        let nested = Value::array_of(
            Type::Array(Box::new(Type::Str)),
            vec![
                Value::array_of(Type::Str, vec!["a".into()]),
                Value::array_of(Type::Str, vec!["b".into(), "c".into()]),
            ],
        );
        assert!(deep_eq(&round_trip(&nested), &nested));
    }

    #[test]
    fn aliases_round_trip() {
        let value = Value::Alias(crate::value::AliasValue {
            name: "Meters".into(),
            value: slot(Value::from(1.5f64)),
        });
        let out = round_trip(&value);
        assert!(deep_eq(&out, &value));
        assert!(matches!(out, Value::Alias(_)));
    }

    #[test]
    fn records_round_trip_without_a_descriptor() {
        let record = StructValue::new("anon::Point")
            .field("x", 3i32)
            .field("y", 4i32);
        let value = Value::Struct(record);
        let out = round_trip(&value);
        assert!(deep_eq(&out, &value));
    }

    #[test]
    fn shared_maps_keep_their_identity() {
        let map = MapValue::new(Type::Str, Type::Scalar(Scalar::I32));
        map.insert("k", 1i32);
        let record = StructValue::new("maps::Pair")
            .field("a", Value::Map(map.clone()))
            .field("b", Value::Map(map));
        let out = round_trip(&Value::Struct(record));
        let Value::Struct(out) = out else {
            panic!("expected a record");
        };
        let a = out.fields.get("a").unwrap();
        let b = out.fields.get("b").unwrap();
        let (Value::Map(a), Value::Map(b)) =
            (a.borrow().clone(), b.borrow().clone())
        else {
            panic!("expected maps");
        };
        assert!(Rc::ptr_eq(&a.storage, &b.storage));
    }

    #[test]
    fn slices_share_storage_after_reconstruction() {
        let whole = ArrayValue::new(
            Type::Scalar(Scalar::I32),
            vec![1i32.into(), 2i32.into(), 3i32.into()],
        );
        let part = whole.slice(1, 2).unwrap();
        let record = StructValue::new("slices::Holder")
            .field("whole", Value::Array(whole))
            .field("part", Value::Array(part));

        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Struct(record)).unwrap();
        assert!(data.contains("<slice"));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Struct(out) = out else {
            panic!("expected a record");
        };
        let whole = out.fields.get("whole").unwrap();
        let part = out.fields.get("part").unwrap();
        let (Value::Array(whole), Value::Array(part)) =
            (whole.borrow().clone(), part.borrow().clone())
        else {
            panic!("expected arrays");
        };
        assert!(Rc::ptr_eq(&whole.storage, &part.storage));
        assert_eq!((part.offset, part.len), (1, 2));
        assert!(deep_eq(
            &part.get(0).unwrap().borrow(),
            &Value::from(2i32)
        ));
    }

    #[test]
    fn slices_resolve_when_the_parent_comes_later() {
        let whole = ArrayValue::new(
            Type::Scalar(Scalar::U8),
            vec![9u8.into(), 8u8.into()],
        );
        let part = whole.slice(0, 1).unwrap();
        // The slice is walked before the array it aliases.
        let record = StructValue::new("slices::Reversed")
            .field("part", Value::Array(part))
            .field("whole", Value::Array(whole));
        let out = round_trip(&Value::Struct(record));
        let Value::Struct(out) = out else {
            panic!("expected a record");
        };
        let whole = out.fields.get("whole").unwrap();
        let part = out.fields.get("part").unwrap();
        let (Value::Array(whole), Value::Array(part)) =
            (whole.borrow().clone(), part.borrow().clone())
        else {
            panic!("expected arrays");
        };
        assert!(Rc::ptr_eq(&whole.storage, &part.storage));
    }

    #[test]
    fn shared_strings_keep_their_storage() {
        let text = StrValue::new("shared text");
        let record = StructValue::new("strings::Pair")
            .field("a", Value::Str(text.clone()))
            .field("b", Value::Str(text));
        let out = round_trip(&Value::Struct(record));
        let Value::Struct(out) = out else {
            panic!("expected a record");
        };
        let a = out.fields.get("a").unwrap();
        let b = out.fields.get("b").unwrap();
        let (Value::Str(a), Value::Str(b)) =
            (a.borrow().clone(), b.borrow().clone())
        else {
            panic!("expected strings");
        };
        assert_eq!(a.as_str(), "shared text");
        assert!(Rc::ptr_eq(&a.storage, &b.storage));
    }

    #[test]
    fn pointers_reattach_to_the_fields_they_target() {
        let x = slot(Value::from(5i32));
        let mut fields = Fields::new();
        // The pointer is walked before its pointee, exercising the
        // deserialize-side fixup pass.
        fields.push("p", Value::Pointer(PointerValue::new(x.clone())));
        fields.push_slot("x", x);
        let record = StructValue {
            name: "pointers::Holder".into(),
            fields,
        };

        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Struct(record)).unwrap();
        assert!(data.contains("<pointer key=\"p\" id=\"1\">"));
        assert!(data.contains("<reference key=\"0\">3</reference>"));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Struct(out) = out else {
            panic!("expected a record");
        };
        let pointer = out.fields.get("p").unwrap();
        let x = out.fields.get("x").unwrap();
        let Value::Pointer(pointer) = pointer.borrow().clone() else {
            panic!("expected a pointer");
        };
        assert!(Rc::ptr_eq(&pointer.target, &x));
        assert!(deep_eq(&pointer.target.borrow(), &Value::from(5i32)));
    }

    #[test]
    fn aliased_pointers_share_a_target() {
        let target = slot(Value::from(7i32));
        let record = StructValue::new("pointers::Pair")
            .field("a", Value::Pointer(PointerValue::new(target.clone())))
            .field("b", Value::Pointer(PointerValue::new(target)));
        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Struct(record)).unwrap();
        assert_eq!(data.matches("<pointer").count(), 1);

        let out = serializer.deserialize(&data).unwrap();
        let Value::Struct(out) = out else {
            panic!("expected a record");
        };
        let a = out.fields.get("a").unwrap();
        let b = out.fields.get("b").unwrap();
        let (Value::Pointer(a), Value::Pointer(b)) =
            (a.borrow().clone(), b.borrow().clone())
        else {
            panic!("expected pointers");
        };
        assert!(Rc::ptr_eq(&a.target, &b.target));
    }

    #[test]
    fn standalone_pointers_keep_their_inline_pointee() {
        let value = Value::Pointer(PointerValue::to(11i32));
        let out = round_trip(&value);
        assert!(deep_eq(&out, &value));
    }

    #[test]
    fn registered_classes_round_trip_with_bases() {
        let _guard = registry_lock();
        register_class(
            ClassInfo::object("zoo::Animal")
                .field("legs", Type::Scalar(Scalar::I32)),
        );
        register_class(
            ClassInfo::object("zoo::Dog")
                .field("name", Type::Str)
                .base("zoo::Animal"),
        );
        let dog = ObjectValue::new("zoo::Dog")
            .field("name", "Rex")
            .field("legs", 4i32);

        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Object(dog)).unwrap();
        assert!(data.contains("<base type=\"zoo::Animal\""));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        assert!(deep_eq(
            &out.get("name").unwrap().borrow(),
            &Value::from("Rex")
        ));
        assert!(deep_eq(
            &out.get("legs").unwrap().borrow(),
            &Value::from(4i32)
        ));
    }

    #[test]
    fn transient_fields_are_skipped() {
        let _guard = registry_lock();
        register_class(
            ClassInfo::object("secrets::Holder")
                .field("kept", Type::Scalar(Scalar::I32))
                .field("dropped", Type::Str)
                .transient("dropped"),
        );
        let holder = ObjectValue::new("secrets::Holder")
            .field("kept", 1i32)
            .field("dropped", "classified");

        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Object(holder)).unwrap();
        assert!(!data.contains("classified"));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        // The excluded field falls back to its declared default.
        assert!(deep_eq(
            &out.get("dropped").unwrap().borrow(),
            &Value::from("")
        ));
    }

    #[test]
    fn lifecycle_events_fire_around_both_directions() {
        fn stamp_before_write(fields: &Fields) {
            fields.set("count", 41i32);
        }
        fn stamp_after_read(fields: &Fields) {
            fields.set("restored", true);
        }
        let _guard = registry_lock();
        register_class(
            ClassInfo::object("life::Probe")
                .field("count", Type::Scalar(Scalar::I32))
                .field("restored", Type::Scalar(Scalar::Bool))
                .lifecycle(
                    Some(stamp_before_write),
                    None,
                    None,
                    Some(stamp_after_read),
                ),
        );
        let probe = ObjectValue::new("life::Probe")
            .field("count", 0i32)
            .field("restored", false);

        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Object(probe)).unwrap();
        assert!(data.contains(">41</int>"));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        assert!(deep_eq(
            &out.get("restored").unwrap().borrow(),
            &Value::from(true)
        ));
    }

    #[test]
    fn custom_hooks_replace_the_field_walk() {
        let mut serializer = Serializer::default();
        serializer.register_serializer(
            "hooks::Blob",
            Rc::new(|context: &mut SerializeContext<'_>, value: &Value| {
                let Value::Object(object) = value else {
                    return Ok(());
                };
                let secret = object.get("secret").unwrap();
                let doubled = match *secret.borrow() {
                    Value::Primitive(Primitive::I32(n)) => n * 2,
                    _ => 0,
                };
                context
                    .serialize_with_key(&Value::from(doubled), "masked")
            }),
        );
        serializer.register_deserializer(
            "hooks::Blob",
            Rc::new(|context: &mut DeserializeContext<'_>, out: &Slot| {
                let masked = context.deserialize_with_key("masked")?;
                let halved = match masked {
                    Value::Primitive(Primitive::I32(n)) => n / 2,
                    _ => 0,
                };
                let object = ObjectValue::new("hooks::Blob")
                    .field("secret", halved);
                *out.borrow_mut() = Value::Object(object);
                Ok(())
            }),
        );

        let blob = ObjectValue::new("hooks::Blob").field("secret", 21i32);
        let data = serializer.serialize(&Value::Object(blob)).unwrap();
        assert!(data.contains("<int key=\"masked\" id=\"1\">42</int>"));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        assert!(deep_eq(
            &out.get("secret").unwrap().borrow(),
            &Value::from(21i32)
        ));
    }

    #[test]
    fn archive_capability_can_walk_the_base_chain() {
        fn write(
            context: &mut SerializeContext<'_>,
            value: &Value,
        ) -> Result<()> {
            let Value::Object(object) = value else {
                return Ok(());
            };
            let x = object.get("x").unwrap();
            let x = x.borrow().clone();
            context.serialize_with_key(&x, "x")?;
            context.serialize_base(value)
        }
        fn read(
            context: &mut DeserializeContext<'_>,
            out: &Slot,
        ) -> Result<()> {
            let Value::Object(object) = out.borrow().clone() else {
                return Ok(());
            };
            context.deserialize_into("x", &object.ensure("x"))?;
            context.deserialize_base(&Value::Object(object))
        }
        let _guard = registry_lock();
        register_class(
            ClassInfo::object("cap::Root")
                .field("r", Type::Scalar(Scalar::I16)),
        );
        register_class(
            ClassInfo::object("cap::Special")
                .field("x", Type::Scalar(Scalar::I32))
                .base("cap::Root")
                .archive_with(
                    write as SerializeWith,
                    read as DeserializeWith,
                ),
        );
        let value = ObjectValue::new("cap::Special")
            .field("x", 10i32)
            .field("r", 3i16);

        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::Object(value)).unwrap();
        assert!(data.contains("<base type=\"cap::Root\""));

        let out = serializer.deserialize(&data).unwrap();
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        assert!(deep_eq(
            &out.get("x").unwrap().borrow(),
            &Value::from(10i32)
        ));
        assert!(deep_eq(
            &out.get("r").unwrap().borrow(),
            &Value::from(3i16)
        ));
    }

    #[test]
    fn polymorphic_values_require_a_registration() {
        let _guard = registry_lock();
        register_class(
            ClassInfo::record("poly::Holder")
                .field("b", Type::Object("poly::Base".into())),
        );
        let holder = StructValue::new("poly::Holder")
            .field("b", Value::Object(ObjectValue::new("poly::Derived")));

        let mut serializer = Serializer::default();
        let error = serializer
            .serialize(&Value::Struct(holder.clone()))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnregisteredType);

        // The do-nothing callback degrades to an empty node instead.
        let mut serializer = Serializer::default();
        serializer.set_do_nothing_on_error_callback();
        let data = serializer.serialize(&Value::Struct(holder)).unwrap();
        assert!(data.contains(
            "<object runtimeType=\"poly::Derived\" type=\"poly::Base\""
        ));
    }

    #[test]
    fn unregistered_runtime_types_fail_to_reconstruct() {
        let mut serializer = Serializer::default();
        let data = serializer
            .serialize(&Value::Object(
                ObjectValue::new("missing::Class").field("n", 1i32),
            ))
            .unwrap();

        let error = serializer.deserialize(&data).unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnregisteredType);

        let mut serializer = Serializer::default();
        serializer.set_do_nothing_on_error_callback();
        let out = serializer.deserialize(&data).unwrap();
        assert!(matches!(out, Value::Null(Some(Type::Object(_)))));
    }

    #[test]
    fn missing_fields_default_under_the_lenient_callback() {
        let _guard = registry_lock();
        register_class(
            ClassInfo::object("soft::Pair")
                .field("a", Type::Scalar(Scalar::I32))
                .field("b", Type::Scalar(Scalar::I32)),
        );
        let data = "<archive version=\"1.0.0\" \
                    type=\"org.dsource.orange.xml\"><data>\
                    <object runtimeType=\"soft::Pair\" type=\"soft::Pair\" \
                    key=\"0\" id=\"0\"><int key=\"a\" id=\"1\">5</int>\
                    </object></data></archive>"
            .to_string();

        let mut serializer = Serializer::default();
        assert_eq!(
            serializer.deserialize(&data).unwrap_err().kind,
            ErrorKind::MalformedArchive
        );

        let mut serializer = Serializer::default();
        serializer.set_do_nothing_on_error_callback();
        let out = serializer.deserialize(&data).unwrap();
        let Value::Object(out) = out else {
            panic!("expected an object");
        };
        assert!(deep_eq(
            &out.get("a").unwrap().borrow(),
            &Value::from(5i32)
        ));
        assert!(deep_eq(
            &out.get("b").unwrap().borrow(),
            &Value::from(0i32)
        ));
    }

    #[test]
    fn field_order_does_not_matter() {
        let _guard = registry_lock();
        register_class(
            ClassInfo::record("order::Pt")
                .field("x", Type::Scalar(Scalar::I32))
                .field("y", Type::Scalar(Scalar::I32)),
        );
        let point = StructValue::new("order::Pt")
            .field("x", 1i32)
            .field("y", 2i32);
        let mut serializer = Serializer::default();
        let straight = serializer.serialize(&Value::Struct(point)).unwrap();

        let shuffled = "<archive version=\"1.0.0\" \
                        type=\"org.dsource.orange.xml\"><data>\
                        <struct type=\"order::Pt\" key=\"0\" id=\"0\">\
                        <int key=\"y\" id=\"2\">2</int>\
                        <int key=\"x\" id=\"1\">1</int>\
                        </struct></data></archive>"
            .to_string();

        let mut first = Serializer::default();
        let mut second = Serializer::default();
        let a = first.deserialize(&straight).unwrap();
        let b = second.deserialize(&shuffled).unwrap();
        assert!(deep_eq(&a, &b));
    }

    #[test]
    fn reset_restarts_ids_and_keys() {
        let value = Value::Struct(
            StructValue::new("reset::Probe")
                .field("text", "abc")
                .field("n", 3i32),
        );
        let mut serializer = Serializer::default();
        let first = serializer.serialize(&value).unwrap();
        serializer.reset();
        let second = serializer.serialize(&value).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn a_run_switches_from_writing_to_reading() {
        let value = Value::from(13i32);
        let mut serializer = Serializer::default();
        let data = serializer.serialize(&value).unwrap();
        assert!(serializer.is_serializing());
        // No reset in between: the counters restart on the switch.
        let out = serializer.deserialize(&data).unwrap();
        assert!(serializer.is_deserializing());
        assert!(deep_eq(&out, &value));
    }

    #[test]
    fn serializing_during_a_read_run_is_misuse() {
        let mut serializer = Serializer::default();
        let data = serializer.serialize(&Value::from(1i32)).unwrap();
        serializer.deserialize(&data).unwrap();
        let error = serializer.serialize(&Value::from(2i32)).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ApiMisuse);
    }

    #[test]
    fn multiple_roots_share_one_document() {
        let mut serializer = Serializer::default();
        serializer.serialize(&Value::from(1i32)).unwrap();
        let data = serializer.serialize(&Value::from("two")).unwrap();

        let mut reader = Serializer::default();
        let first = reader.deserialize(&data).unwrap();
        let second = reader.deserialize(&data).unwrap();
        assert!(deep_eq(&first, &Value::from(1i32)));
        assert!(deep_eq(&second, &Value::from("two")));
    }

    #[test]
    fn identity_is_shared_across_roots_of_one_run() {
        let shared = ObjectValue::new("roots::Shared").field("n", 9i32);
        let mut serializer = Serializer::default();
        serializer
            .serialize(&Value::Object(shared.clone()))
            .unwrap();
        let data = serializer.serialize(&Value::Object(shared)).unwrap();
        assert_eq!(data.matches("<object").count(), 1);
        assert!(data.contains("<reference key=\"1\">0</reference>"));
    }

    #[test]
    fn opaque_values_need_a_registered_serializer() {
        let opaque = Value::Opaque(crate::value::OpaqueValue {
            name: "raw::Handle".into(),
            data: Rc::new(77i32),
        });
        let mut serializer = Serializer::default();
        let error = serializer.serialize(&opaque).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotSerializable);

        let mut serializer = Serializer::default();
        serializer.register_serializer(
            "raw::Handle",
            Rc::new(|context: &mut SerializeContext<'_>, value: &Value| {
                let Value::Opaque(opaque) = value else {
                    return Ok(());
                };
                let payload = opaque
                    .data
                    .downcast_ref::<i32>()
                    .copied()
                    .unwrap_or_default();
                context
                    .serialize_with_key(&Value::from(payload), "payload")
            }),
        );
        let data = serializer.serialize(&opaque).unwrap();
        assert!(data.contains("<int key=\"payload\" id=\"1\">77</int>"));
    }

    #[test]
    fn explicit_keys_name_the_root() {
        let mut serializer = Serializer::default();
        let data = serializer
            .serialize_with_key(&Value::from(4i32), "answer")
            .unwrap();
        assert!(data.contains("<int key=\"answer\" id=\"0\">4</int>"));

        let mut reader = Serializer::default();
        let out = reader.deserialize_with_key(&data, "answer").unwrap();
        assert!(deep_eq(&out, &Value::from(4i32)));
    }
}
