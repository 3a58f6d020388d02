//! The deserialize half of the engine.
//!
//! [`DeserializeContext`] reads nodes by key, reconstructs values into
//! caller-provided slots, pools identities in [`Pool`] so references
//! and slices re-attach to the values they named, and runs the fixup
//! pass for edges whose target appeared later in the stream. Custom
//! deserializer hooks receive the context to read nested values.

pub mod pooling;

pub use self::pooling::Pool;

use std::cell::RefCell;
use std::rc::Rc;

use crate::archive::{
    Archive, ArrayHeader, Id, MapHeader, NodeKind, ObjectHeader, SliceNode,
    StructHeader,
};
use crate::descriptor::{self, ClassInfo};
use crate::error::{Error, Result};
use crate::serializer::Context;
use crate::ty::{Scalar, Type};
use crate::value::{
    slot, AliasValue, ArrayValue, EnumValue, Fields, MapValue, ObjectValue,
    PointerValue, Primitive, Slot, StrValue, StructValue, Value,
};

/// The engine state handed to deserialization, including custom hooks.
///
/// A context only exists while a deserialization run is in progress, so
/// its nested operations never observe an idle engine.
pub struct DeserializeContext<'a> {
    pub(crate) archive: &'a mut dyn Archive,
    pub(crate) ctx: &'a mut Context,
}

impl<'a> DeserializeContext<'a> {
    pub(crate) fn new(
        archive: &'a mut dyn Archive,
        ctx: &'a mut Context,
    ) -> Self {
        Self { archive, ctx }
    }

    /// Reads the nested value under the next synthetic key.
    pub fn deserialize(&mut self) -> Result<Value> {
        let key = self.ctx.next_key();
        self.deserialize_with_key(&key)
    }

    /// Reads the nested value under the given key.
    ///
    /// The value lands in a fresh location; when an interior pointer
    /// should alias it, prefer [`deserialize_into`] with the location
    /// the value will live in.
    ///
    /// [`deserialize_into`]: Self::deserialize_into
    pub fn deserialize_with_key(&mut self, key: &str) -> Result<Value> {
        let out = slot(Value::Null(None));
        self.take_into(key, None, &out)?;
        let value = out.borrow().clone();
        Ok(value)
    }

    /// Reads the nested value under the given key into an existing
    /// location.
    pub fn deserialize_into(&mut self, key: &str, out: &Slot) -> Result<()> {
        self.take_into(key, None, out)
    }

    /// Reads the base-class portion of the object a custom hook is
    /// currently reconstructing. Does nothing at the root of the
    /// hierarchy.
    pub fn deserialize_base(&mut self, value: &Value) -> Result<()> {
        let object = match value {
            Value::Object(object) => object.clone(),
            _ => {
                return self.ctx.report(Error::misuse(
                    "deserialize_base expects an object",
                ));
            }
        };
        let Some(class) = self.ctx.class_stack.last().cloned() else {
            return self.ctx.report(Error::misuse(
                "deserialize_base called outside an object",
            ));
        };
        let Some(info) = descriptor::lookup_class(&class) else {
            return Ok(());
        };
        match info.base {
            Some(base) => self.take_base(&object, &base),
            None => Ok(()),
        }
    }

    /// Runs an archive read, reporting fresh failures through the error
    /// callback. `None` means the failure was swallowed.
    fn checked<T>(
        &mut self,
        run: impl FnOnce(&mut dyn Archive) -> Result<T>,
    ) -> Result<Option<T>> {
        let Self { archive, ctx } = self;
        match run(&mut **archive) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.reported => Err(error),
            Err(error) => ctx.report(error).map(|_| None),
        }
    }

    /// Reports a fresh failure and swallows or propagates it.
    fn absorb(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.reported => Err(error),
            Err(error) => self.ctx.report(error),
        }
    }

    /// Like [`absorb`](Self::absorb), additionally writing the declared
    /// type's default when the failure is swallowed.
    fn soften(
        &mut self,
        result: Result<()>,
        decl: Option<&Type>,
        out: &Slot,
    ) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.reported => Err(error),
            Err(error) => {
                self.ctx.report(error)?;
                *out.borrow_mut() = descriptor::default_value(decl);
                Ok(())
            }
        }
    }

    /// Reads the node under `key` in the current scope into `out`.
    pub(crate) fn take_into(
        &mut self,
        key: &str,
        decl: Option<&Type>,
        out: &Slot,
    ) -> Result<()> {
        let kind = match self.checked(|archive| archive.peek(key))? {
            Some(kind) => kind,
            None => None,
        };
        let Some(kind) = kind else {
            self.ctx.report(Error::malformed(format!(
                "no element for key `{key}`"
            )))?;
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        match kind {
            NodeKind::Primitive(_) => self.read_primitive(key, decl, out),
            NodeKind::String => self.read_string(key, decl, out),
            NodeKind::Enum => self.read_enum(key, decl, out),
            NodeKind::Null => self.read_null(key, out),
            NodeKind::Reference => self.read_reference(key, decl, out),
            NodeKind::Slice => self.read_slice(key, out),
            NodeKind::Array => {
                let target = out.clone();
                let result = {
                    let Self { archive, ctx } = self;
                    archive.unarchive_array(key, &mut |a, header| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .read_array(header, &target)
                    })
                };
                self.soften(result, decl, out)
            }
            NodeKind::AssociativeArray => {
                let target = out.clone();
                let result = {
                    let Self { archive, ctx } = self;
                    archive.unarchive_associative_array(
                        key,
                        &mut |a, header| {
                            DeserializeContext {
                                archive: a,
                                ctx: &mut **ctx,
                            }
                            .read_map(header, &target)
                        },
                    )
                };
                self.soften(result, decl, out)
            }
            NodeKind::Struct => {
                let target = out.clone();
                let result = {
                    let Self { archive, ctx } = self;
                    archive.unarchive_struct(key, &mut |a, header| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .read_struct(header, &target)
                    })
                };
                self.soften(result, decl, out)
            }
            NodeKind::Object => {
                let target = out.clone();
                let result = {
                    let Self { archive, ctx } = self;
                    archive.unarchive_object(key, &mut |a, header| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .read_object(header, &target)
                    })
                };
                self.soften(result, decl, out)
            }
            NodeKind::Pointer => {
                let target = out.clone();
                let result = {
                    let Self { archive, ctx } = self;
                    archive.unarchive_pointer(key, &mut |a, id| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .read_pointer(id, &target)
                    })
                };
                self.soften(result, decl, out)
            }
            NodeKind::Typedef => {
                let target = out.clone();
                let result = {
                    let Self { archive, ctx } = self;
                    archive.unarchive_typedef(key, &mut |a, header| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .read_typedef(header, &target)
                    })
                };
                self.soften(result, decl, out)
            }
        }
    }

    fn read_primitive(
        &mut self,
        key: &str,
        decl: Option<&Type>,
        out: &Slot,
    ) -> Result<()> {
        let Some(node) =
            self.checked(|archive| archive.unarchive_primitive(key))?
        else {
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        let parsed = Scalar::from_name(&node.ty)
            .and_then(|scalar| Primitive::parse(scalar, &node.value));
        let Some(primitive) = parsed else {
            self.ctx.report(Error::malformed(format!(
                "unparseable `{}` literal `{}`",
                node.ty, node.value
            )))?;
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        *out.borrow_mut() = Value::Primitive(primitive);
        self.ctx.pool.add_slot(node.id, out.clone());
        Ok(())
    }

    fn read_string(
        &mut self,
        key: &str,
        decl: Option<&Type>,
        out: &Slot,
    ) -> Result<()> {
        let Some(node) =
            self.checked(|archive| archive.unarchive_string(key))?
        else {
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        let value = Value::Str(StrValue::new(node.value));
        self.ctx.pool.add_array(node.id, value.clone());
        self.ctx.pool.add_slot(node.id, out.clone());
        *out.borrow_mut() = value;
        Ok(())
    }

    fn read_enum(
        &mut self,
        key: &str,
        decl: Option<&Type>,
        out: &Slot,
    ) -> Result<()> {
        let Some(node) = self.checked(|archive| archive.unarchive_enum(key))?
        else {
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        let parsed = Scalar::from_name(&node.base)
            .and_then(|scalar| Primitive::parse(scalar, &node.value));
        let Some(primitive) = parsed else {
            self.ctx.report(Error::malformed(format!(
                "unparseable `{}` base literal `{}`",
                node.base, node.value
            )))?;
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        *out.borrow_mut() = Value::Enum(EnumValue {
            name: node.ty,
            value: primitive,
        });
        self.ctx.pool.add_slot(node.id, out.clone());
        Ok(())
    }

    fn read_null(&mut self, key: &str, out: &Slot) -> Result<()> {
        let name = self
            .checked(|archive| archive.unarchive_null(key))?
            .flatten();
        let ty = match name.as_deref() {
            None | Some("") | Some("void") => None,
            Some(name) => Some(Type::parse(name)),
        };
        *out.borrow_mut() = Value::Null(ty);
        Ok(())
    }

    fn read_reference(
        &mut self,
        key: &str,
        decl: Option<&Type>,
        out: &Slot,
    ) -> Result<()> {
        let target = self
            .checked(|archive| archive.unarchive_reference(key))?
            .flatten();
        let Some(target) = target else {
            *out.borrow_mut() = descriptor::default_value(decl);
            return Ok(());
        };
        match self.ctx.pool.value(target) {
            Some(value) => {
                *out.borrow_mut() = value;
                Ok(())
            }
            None => {
                self.ctx.report(Error::malformed(format!(
                    "reference to unknown id {target}"
                )))?;
                *out.borrow_mut() = descriptor::default_value(decl);
                Ok(())
            }
        }
    }

    fn read_slice(&mut self, key: &str, out: &Slot) -> Result<()> {
        let node = self
            .checked(|archive| archive.unarchive_slice(key))?
            .flatten();
        let Some(node) = node else {
            *out.borrow_mut() = Value::Null(None);
            return Ok(());
        };
        if !self.apply_slice(&node, out)? {
            *out.borrow_mut() = Value::Null(None);
            self.ctx.pool.defer_slice(node, out.clone());
        }
        Ok(())
    }

    /// Attaches a slice to its parent array's storage. Returns `false`
    /// when the parent has not been reconstructed yet.
    fn apply_slice(&mut self, node: &SliceNode, out: &Slot) -> Result<bool> {
        let Some(parent) = self.ctx.pool.array(node.array) else {
            return Ok(false);
        };
        match parent {
            Value::Array(parent) => {
                if node.offset + node.len > parent.len {
                    self.ctx.report(Error::malformed(format!(
                        "slice {}..{} escapes array {} of length {}",
                        node.offset,
                        node.offset + node.len,
                        node.array,
                        parent.len
                    )))?;
                    *out.borrow_mut() = Value::Null(None);
                } else {
                    *out.borrow_mut() = Value::Array(ArrayValue {
                        storage: parent.storage.clone(),
                        offset: parent.offset + node.offset,
                        len: node.len,
                        elem: parent.elem.clone(),
                    });
                }
            }
            Value::Str(parent) => {
                *out.borrow_mut() = Value::Str(parent.clone());
            }
            _ => {
                self.ctx.report(Error::malformed(format!(
                    "slice parent {} is not an array",
                    node.array
                )))?;
                *out.borrow_mut() = Value::Null(None);
            }
        }
        let value = out.borrow().clone();
        self.ctx.pool.add_array(node.id, value);
        self.ctx.pool.add_slot(node.id, out.clone());
        Ok(true)
    }

    fn read_array(&mut self, header: &ArrayHeader, out: &Slot) -> Result<()> {
        let elem = Type::parse(&header.elem);
        let slots: Vec<Slot> =
            (0..header.len).map(|_| slot(Value::Null(None))).collect();
        let storage = Rc::new(RefCell::new(slots));
        let array = ArrayValue {
            storage: storage.clone(),
            offset: 0,
            len: header.len,
            elem: elem.clone(),
        };
        self.ctx.pool.add_slot(header.id, out.clone());
        self.ctx.pool.add_array(header.id, Value::Array(array.clone()));
        *out.borrow_mut() = Value::Array(array);
        for index in 0..header.len {
            let element = storage.borrow().get(index).cloned();
            let Some(element) = element else {
                continue;
            };
            self.take_into(&index.to_string(), Some(&elem), &element)?;
        }
        Ok(())
    }

    fn read_map(&mut self, header: &MapHeader, out: &Slot) -> Result<()> {
        let key_ty = Type::parse(&header.key);
        let value_ty = Type::parse(&header.value);
        let map = MapValue::new(key_ty.clone(), value_ty.clone());
        self.ctx.pool.add_slot(header.id, out.clone());
        self.ctx.pool.add_value(header.id, Value::Map(map.clone()));
        *out.borrow_mut() = Value::Map(map.clone());
        for index in 0..header.len {
            let entry_key = index.to_string();
            let key_slot = slot(Value::Null(None));
            let value_slot = slot(Value::Null(None));
            let result = {
                let Self { archive, ctx } = self;
                archive.unarchive_associative_array_key(
                    &entry_key,
                    &mut |a| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .take_into("0", Some(&key_ty), &key_slot)
                    },
                )
            };
            self.absorb(result)?;
            let result = {
                let Self { archive, ctx } = self;
                archive.unarchive_associative_array_value(
                    &entry_key,
                    &mut |a| {
                        DeserializeContext {
                            archive: a,
                            ctx: &mut **ctx,
                        }
                        .take_into("0", Some(&value_ty), &value_slot)
                    },
                )
            };
            self.absorb(result)?;
            map.storage.borrow_mut().push((key_slot, value_slot));
        }
        Ok(())
    }

    fn read_struct(
        &mut self,
        header: &StructHeader,
        out: &Slot,
    ) -> Result<()> {
        let name = header.ty.clone();
        if let Some(hook) = self.ctx.deserializers.get(&name).cloned() {
            self.ctx.class_stack.push(name);
            let result = hook(self, out);
            self.ctx.class_stack.pop();
            result?;
            self.ctx.pool.add_slot(header.id, out.clone());
            return Ok(());
        }
        match descriptor::lookup_class(&name) {
            Some(info) => {
                let record = StructValue {
                    name: name.clone(),
                    fields: info.default_fields(),
                };
                self.ctx.pool.add_slot(header.id, out.clone());
                *out.borrow_mut() = Value::Struct(record.clone());
                if let Some(fired) = info.on_deserializing {
                    fired(&record.fields);
                }
                self.ctx.class_stack.push(name);
                let result = match info.deserialize_with {
                    Some(custom) => custom(self, out),
                    None => self.read_record_fields(&record, &info),
                };
                self.ctx.class_stack.pop();
                result?;
                if let Some(fired) = info.on_deserialized {
                    fired(&record.fields);
                }
                Ok(())
            }
            None => {
                // No descriptor: reconstruct the fields the document
                // carries, in document order.
                let keys = self
                    .checked(|archive| archive.scope_keys())?
                    .unwrap_or_default();
                let mut fields = Fields::new();
                for key in keys {
                    let field = slot(Value::Null(None));
                    self.take_into(&key, None, &field)?;
                    fields.push_slot(key, field);
                }
                self.ctx.pool.add_slot(header.id, out.clone());
                *out.borrow_mut() =
                    Value::Struct(StructValue { name, fields });
                Ok(())
            }
        }
    }

    fn read_record_fields(
        &mut self,
        record: &StructValue,
        info: &ClassInfo,
    ) -> Result<()> {
        for declared in &info.fields {
            if info.is_transient(&declared.name) {
                continue;
            }
            let Some(slot) = record.fields.get(&declared.name) else {
                continue;
            };
            self.take_into(&declared.name, Some(&declared.ty), &slot)?;
        }
        Ok(())
    }

    fn read_object(
        &mut self,
        header: &ObjectHeader,
        out: &Slot,
    ) -> Result<()> {
        let runtime = header.runtime_type.clone();
        if let Some(hook) = self.ctx.deserializers.get(&runtime).cloned() {
            self.ctx.class_stack.push(runtime);
            let result = hook(self, out);
            self.ctx.class_stack.pop();
            result?;
            self.ctx.pool.add_slot(header.id, out.clone());
            let value = out.borrow().clone();
            self.ctx.pool.add_value(header.id, value);
            return Ok(());
        }
        let Some(info) = descriptor::lookup_class(&runtime) else {
            self.ctx.report(Error::unregistered(format!(
                "no registration for runtime type `{runtime}`"
            )))?;
            *out.borrow_mut() = Value::Null(Some(Type::Object(runtime)));
            return Ok(());
        };
        let object = info.instantiate();
        // Identity is pooled before the fields are read so that cyclic
        // references resolve to this very object.
        self.ctx
            .pool
            .add_value(header.id, Value::Object(object.clone()));
        self.ctx.pool.add_slot(header.id, out.clone());
        *out.borrow_mut() = Value::Object(object.clone());
        if let Some(fired) = info.on_deserializing {
            fired(&object.instance.borrow().fields);
        }
        self.ctx.class_stack.push(runtime);
        let result = match info.deserialize_with {
            Some(custom) => custom(self, out),
            None => self
                .read_fields(&object, &info)
                .and_then(|_| self.read_bases(&object, &info)),
        };
        self.ctx.class_stack.pop();
        result?;
        if let Some(fired) = info.on_deserialized {
            fired(&object.instance.borrow().fields);
        }
        Ok(())
    }

    fn read_fields(
        &mut self,
        object: &ObjectValue,
        info: &ClassInfo,
    ) -> Result<()> {
        for declared in &info.fields {
            if info.is_transient(&declared.name) {
                continue;
            }
            let slot = object.ensure(&declared.name);
            self.take_into(&declared.name, Some(&declared.ty), &slot)?;
        }
        Ok(())
    }

    fn read_bases(
        &mut self,
        object: &ObjectValue,
        info: &ClassInfo,
    ) -> Result<()> {
        match &info.base {
            Some(base) => self.take_base(object, base),
            None => Ok(()),
        }
    }

    fn take_base(&mut self, object: &ObjectValue, base: &str) -> Result<()> {
        let Some(info) = descriptor::lookup_class(base) else {
            return self.ctx.report(Error::unregistered(format!(
                "unregistered base class `{base}`"
            )));
        };
        self.ctx.class_stack.push(base.to_string());
        let result = {
            let Self { archive, ctx } = self;
            archive.unarchive_base(base, &mut |a, _id| {
                let mut sub = DeserializeContext {
                    archive: a,
                    ctx: &mut **ctx,
                };
                sub.read_fields(object, &info)?;
                sub.read_bases(object, &info)
            })
        };
        self.ctx.class_stack.pop();
        self.absorb(result)
    }

    fn read_pointer(&mut self, id: Id, out: &Slot) -> Result<()> {
        let inner = self.checked(|archive| archive.peek("0"))?.flatten();
        match inner {
            Some(NodeKind::Reference) => {
                let target = self
                    .checked(|archive| archive.unarchive_reference("0"))?
                    .flatten();
                let Some(target) = target else {
                    *out.borrow_mut() = Value::Null(None);
                    return Ok(());
                };
                match self.ctx.pool.slot(target) {
                    Some(pointee) => {
                        *out.borrow_mut() =
                            Value::Pointer(PointerValue::new(pointee));
                    }
                    None => {
                        // The pointee appears later in the stream; the
                        // fixup pass will rewrite this location.
                        *out.borrow_mut() = Value::Pointer(
                            PointerValue::to(Value::Null(None)),
                        );
                        self.ctx.pool.defer_pointer(target, out.clone());
                    }
                }
            }
            Some(_) => {
                let pointee = slot(Value::Null(None));
                self.take_into("0", None, &pointee)?;
                *out.borrow_mut() =
                    Value::Pointer(PointerValue::new(pointee));
            }
            None => {
                self.ctx.report(Error::malformed(format!(
                    "pointer {id} without pointee"
                )))?;
                *out.borrow_mut() = Value::Null(None);
                return Ok(());
            }
        }
        self.ctx.pool.add_slot(id, out.clone());
        let value = out.borrow().clone();
        self.ctx.pool.add_value(id, value);
        Ok(())
    }

    fn read_typedef(
        &mut self,
        header: &StructHeader,
        out: &Slot,
    ) -> Result<()> {
        let inner = slot(Value::Null(None));
        self.take_into("0", None, &inner)?;
        self.ctx.pool.add_slot(header.id, out.clone());
        *out.borrow_mut() = Value::Alias(AliasValue {
            name: header.ty.clone(),
            value: inner,
        });
        Ok(())
    }

    /// Resolves the pointers and slices whose targets appeared after
    /// them in the stream.
    pub(crate) fn post_process(&mut self) -> Result<()> {
        let pending = self.ctx.pool.take_pending_slices();
        for (node, out) in pending {
            if !self.apply_slice(&node, &out)? {
                self.ctx.report(Error::malformed(format!(
                    "slice references unknown array id {}",
                    node.array
                )))?;
            }
        }
        let pending = self.ctx.pool.take_pending_pointers();
        for (target, out) in pending {
            match self.ctx.pool.slot(target) {
                Some(pointee) => {
                    *out.borrow_mut() =
                        Value::Pointer(PointerValue::new(pointee));
                }
                None => {
                    self.ctx.report(Error::malformed(format!(
                        "pointer references unknown id {target}"
                    )))?;
                }
            }
        }
        Ok(())
    }
}
