//! The serialize half of the engine.
//!
//! [`SerializeContext`] drives the recursion over a value graph,
//! translating each value into archive emit calls, tracking identity in
//! [`Share`], and running the two post-processing passes that resolve
//! array slices and interior pointers. Custom serializer hooks receive
//! the context to archive nested values.

pub mod sharing;

pub use self::sharing::Share;

use std::rc::Rc;

use crate::archive::{Archive, ArrayRecord, Id};
use crate::descriptor::{self, ClassInfo};
use crate::error::{Error, Result};
use crate::serializer::Context;
use crate::ty::Type;
use crate::value::{
    AliasValue, ArrayValue, EnumValue, Fields, MapValue, ObjectValue,
    OpaqueValue, PointerValue, Slot, StrValue, StructValue, Value,
};

/// Which half of a map entry is being archived.
enum EntrySide {
    Key,
    Value,
}

/// The engine state handed to serialization, including custom hooks.
///
/// A context only exists while a serialization run is in progress, so
/// its nested operations never observe an idle engine.
pub struct SerializeContext<'a> {
    pub(crate) archive: &'a mut dyn Archive,
    pub(crate) ctx: &'a mut Context,
}

impl<'a> SerializeContext<'a> {
    pub(crate) fn new(
        archive: &'a mut dyn Archive,
        ctx: &'a mut Context,
    ) -> Self {
        Self { archive, ctx }
    }

    /// Archives a nested value under a synthetic key.
    pub fn serialize(&mut self, value: &Value) -> Result<()> {
        let key = self.ctx.next_key();
        self.put(value, None, &key, None).map(|_| ())
    }

    /// Archives a nested value under the given key.
    pub fn serialize_with_key(
        &mut self,
        value: &Value,
        key: &str,
    ) -> Result<()> {
        self.put(value, None, key, None).map(|_| ())
    }

    /// Archives the base-class portion of the record or object a custom
    /// hook is currently serializing. Does nothing at the root of the
    /// hierarchy.
    pub fn serialize_base(&mut self, value: &Value) -> Result<()> {
        let fields = match value {
            Value::Object(object) => object.instance.borrow().fields.clone(),
            Value::Struct(record) => record.fields.clone(),
            _ => {
                return self.ctx.report(Error::misuse(
                    "serialize_base expects a record or object",
                ));
            }
        };
        let Some(class) = self.ctx.class_stack.last().cloned() else {
            return self.ctx.report(Error::misuse(
                "serialize_base called outside a record or object",
            ));
        };
        let Some(info) = descriptor::lookup_class(&class) else {
            return Ok(());
        };
        let Some(base) = info.base else {
            return Ok(());
        };
        self.put_base(&fields, &base)
    }

    fn claim(&mut self, id: Option<Id>) -> Id {
        match id {
            Some(id) => id,
            None => self.ctx.next_id(),
        }
    }

    /// Archives one value under `key`. Returns the id of the emitted
    /// node, or `None` when the value collapsed into a reference or
    /// null node.
    pub(crate) fn put(
        &mut self,
        value: &Value,
        decl: Option<&Type>,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        log::trace!("archiving {:?} under key `{key}`", value.kind());
        match value {
            Value::Primitive(primitive) => {
                let id = self.claim(id);
                self.archive.archive_primitive(
                    primitive.scalar().name(),
                    &primitive.to_text(),
                    key,
                    id,
                )?;
                Ok(Some(id))
            }
            Value::Enum(value) => self.put_enum(value, key, id),
            Value::Str(value) => self.put_str(value, key, id),
            Value::Array(value) => self.put_array(value, key, id),
            Value::Map(value) => self.put_map(value, key, id),
            Value::Struct(record) => self.put_struct(value, record, key, id),
            Value::Object(object) => {
                self.put_object(value, object, decl, key, id)
            }
            Value::Pointer(pointer) => {
                self.put_pointer(pointer, decl, key, id)
            }
            Value::Alias(alias) => self.put_alias(alias, key, id),
            Value::Null(ty) => {
                let name = match ty {
                    Some(ty) => ty.to_string(),
                    None => "void".to_string(),
                };
                self.archive.archive_null(&name, key)?;
                Ok(None)
            }
            Value::Opaque(opaque) => self.put_opaque(value, opaque, key, id),
        }
    }

    fn put_enum(
        &mut self,
        value: &EnumValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let id = self.claim(id);
        self.archive.archive_enum(
            &value.name,
            value.value.scalar().name(),
            &value.value.to_text(),
            key,
            id,
        )?;
        Ok(Some(id))
    }

    fn put_str(
        &mut self,
        value: &StrValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let id = self.claim(id);
        self.ctx.share.add_array(
            id,
            ArrayRecord {
                address: value.address(),
                offset: 0,
                len: value.as_str().chars().count(),
            },
        );
        self.archive.archive_string(value.as_str(), "char", key, id)?;
        Ok(Some(id))
    }

    fn put_array(
        &mut self,
        array: &ArrayValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let id = self.claim(id);
        let record = ArrayRecord {
            address: array.address(),
            offset: array.offset,
            len: array.len,
        };
        self.ctx.share.add_array(id, record);
        let elem_name = array.elem.to_string();
        let Self { archive, ctx } = self;
        archive.archive_array(&record, &elem_name, key, id, &mut |a| {
            let mut sub = SerializeContext {
                archive: a,
                ctx: &mut **ctx,
            };
            for index in 0..array.len {
                let Some(element) = array.get(index) else {
                    continue;
                };
                let value = element.borrow();
                sub.put(
                    &value,
                    Some(&array.elem),
                    &index.to_string(),
                    None,
                )?;
            }
            Ok(())
        })?;
        Ok(Some(id))
    }

    fn put_map(
        &mut self,
        map: &MapValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let address = map.address();
        if let Some(prior) = self.ctx.share.reference(address) {
            self.archive.archive_reference(key, prior)?;
            return Ok(None);
        }
        let id = self.claim(id);
        self.ctx.share.add_reference(address, id);
        let len = map.len();
        let key_name = map.key_ty.to_string();
        let value_name = map.value_ty.to_string();
        let Self { archive, ctx } = self;
        archive.archive_associative_array(
            &key_name,
            &value_name,
            len,
            key,
            id,
            &mut |a| {
                let mut sub = SerializeContext {
                    archive: a,
                    ctx: &mut **ctx,
                };
                for index in 0..len {
                    let (entry_key, entry_value) = {
                        let entries = map.storage.borrow();
                        let Some((k, v)) = entries.get(index) else {
                            continue;
                        };
                        (k.clone(), v.clone())
                    };
                    let label = index.to_string();
                    sub.put_entry(
                        EntrySide::Key,
                        &label,
                        &entry_key,
                        &map.key_ty,
                    )?;
                    sub.put_entry(
                        EntrySide::Value,
                        &label,
                        &entry_value,
                        &map.value_ty,
                    )?;
                }
                Ok(())
            },
        )?;
        Ok(Some(id))
    }

    fn put_entry(
        &mut self,
        side: EntrySide,
        entry_key: &str,
        slot: &Slot,
        decl: &Type,
    ) -> Result<()> {
        let Self { archive, ctx } = self;
        let mut inner = |a: &mut dyn Archive| -> Result<()> {
            let mut sub = SerializeContext {
                archive: a,
                ctx: &mut **ctx,
            };
            let value = slot.borrow();
            sub.put(&value, Some(decl), "0", None).map(|_| ())
        };
        match side {
            EntrySide::Key => {
                archive.archive_associative_array_key(entry_key, &mut inner)
            }
            EntrySide::Value => {
                archive.archive_associative_array_value(entry_key, &mut inner)
            }
        }
    }

    fn put_struct(
        &mut self,
        value: &Value,
        record: &StructValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let id = self.claim(id);
        let info = descriptor::lookup_class(&record.name);
        let hook = self.ctx.serializers.get(&record.name).cloned();
        if let Some(fired) = info.as_ref().and_then(|i| i.on_serializing) {
            fired(&record.fields);
        }
        self.ctx.class_stack.push(record.name.clone());
        let result = {
            let Self { archive, ctx } = self;
            archive.archive_struct(&record.name, key, id, &mut |a| {
                let mut sub = SerializeContext {
                    archive: a,
                    ctx: &mut **ctx,
                };
                if let Some(hook) = &hook {
                    hook(&mut sub, value)
                } else if let Some(custom) =
                    info.as_ref().and_then(|i| i.serialize_with)
                {
                    custom(&mut sub, value)
                } else {
                    sub.put_fields(&record.fields, info.as_ref())
                }
            })
        };
        self.ctx.class_stack.pop();
        if result.is_ok() {
            if let Some(fired) = info.as_ref().and_then(|i| i.on_serialized)
            {
                fired(&record.fields);
            }
        }
        result.map(|_| Some(id))
    }

    fn put_object(
        &mut self,
        value: &Value,
        object: &ObjectValue,
        decl: Option<&Type>,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let address = object.address();
        if let Some(prior) = self.ctx.share.reference(address) {
            self.archive.archive_reference(key, prior)?;
            return Ok(None);
        }
        let runtime = object.class();
        let static_ty = match decl {
            Some(Type::Object(name)) => name.clone(),
            _ => runtime.clone(),
        };
        let info = descriptor::lookup_class(&runtime);
        let hook = self.ctx.serializers.get(&runtime).cloned();
        if hook.is_none() && info.is_none() && static_ty != runtime {
            // Polymorphic emission needs the concrete class registered.
            self.ctx.report(Error::unregistered(format!(
                "cannot archive `{runtime}` through `{static_ty}` without \
                 a registration"
            )))?;
            let id = self.claim(id);
            self.ctx.share.add_reference(address, id);
            self.archive.archive_object(
                &runtime,
                &static_ty,
                key,
                id,
                &mut |_| Ok(()),
            )?;
            return Ok(Some(id));
        }
        let id = self.claim(id);
        self.ctx.share.add_reference(address, id);
        if let Some(fired) = info.as_ref().and_then(|i| i.on_serializing) {
            fired(&object.instance.borrow().fields);
        }
        self.ctx.class_stack.push(runtime.clone());
        let result = {
            let Self { archive, ctx } = self;
            archive.archive_object(&runtime, &static_ty, key, id, &mut |a| {
                let mut sub = SerializeContext {
                    archive: a,
                    ctx: &mut **ctx,
                };
                if let Some(hook) = &hook {
                    hook(&mut sub, value)
                } else if let Some(custom) =
                    info.as_ref().and_then(|i| i.serialize_with)
                {
                    custom(&mut sub, value)
                } else {
                    let instance = object.instance.borrow();
                    sub.put_fields(&instance.fields, info.as_ref())?;
                    sub.put_bases(&instance.fields, info.as_ref())
                }
            })
        };
        self.ctx.class_stack.pop();
        if result.is_ok() {
            if let Some(fired) = info.as_ref().and_then(|i| i.on_serialized)
            {
                fired(&object.instance.borrow().fields);
            }
        }
        result.map(|_| Some(id))
    }

    /// Walks the fields of a record or object: declaration order when a
    /// descriptor is registered, value order otherwise.
    fn put_fields(
        &mut self,
        fields: &Fields,
        info: Option<&ClassInfo>,
    ) -> Result<()> {
        match info {
            Some(info) => {
                for declared in &info.fields {
                    if info.is_transient(&declared.name) {
                        continue;
                    }
                    let Some(slot) = fields.get(&declared.name) else {
                        continue;
                    };
                    self.put_field(
                        &slot,
                        Some(&declared.ty),
                        &declared.name,
                    )?;
                }
            }
            None => {
                for field in fields.iter() {
                    let slot = field.value.clone();
                    self.put_field(&slot, None, &field.name)?;
                }
            }
        }
        Ok(())
    }

    /// Archives one field under a pre-allocated id and records its slot
    /// so the pointer pass can link interior pointers to it.
    fn put_field(
        &mut self,
        slot: &Slot,
        decl: Option<&Type>,
        name: &str,
    ) -> Result<()> {
        let id = self.ctx.next_id();
        let value = slot.borrow();
        let emitted = self.put(&value, decl, name, Some(id))?;
        if let Some(emitted) = emitted {
            self.ctx
                .share
                .add_value(Rc::as_ptr(slot) as usize, emitted, name);
        }
        Ok(())
    }

    fn put_bases(
        &mut self,
        fields: &Fields,
        info: Option<&ClassInfo>,
    ) -> Result<()> {
        match info.and_then(|i| i.base.clone()) {
            Some(base) => self.put_base(fields, &base),
            None => Ok(()),
        }
    }

    /// Emits a base-class node and the base's view of `fields` inside
    /// it, recursing further up the hierarchy.
    fn put_base(&mut self, fields: &Fields, base: &str) -> Result<()> {
        let Some(info) = descriptor::lookup_class(base) else {
            return self.ctx.report(Error::unregistered(format!(
                "unregistered base class `{base}`"
            )));
        };
        let id = self.ctx.next_id();
        let key = self.ctx.next_key();
        self.ctx.class_stack.push(base.to_string());
        let result = {
            let Self { archive, ctx } = self;
            archive.archive_base(base, &key, id, &mut |a| {
                let mut sub = SerializeContext {
                    archive: a,
                    ctx: &mut **ctx,
                };
                sub.put_fields(fields, Some(&info))?;
                sub.put_bases(fields, Some(&info))
            })
        };
        self.ctx.class_stack.pop();
        result
    }

    fn put_pointer(
        &mut self,
        pointer: &PointerValue,
        decl: Option<&Type>,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let address = pointer.address();
        if let Some(prior) = self.ctx.share.reference(address) {
            self.archive.archive_reference(key, prior)?;
            return Ok(None);
        }
        let id = self.claim(id);
        self.ctx.share.add_reference(address, id);
        self.ctx.share.add_pointer(id, address);
        let pointee = match decl {
            Some(Type::Pointer(target)) => Some(target.as_ref()),
            _ => None,
        };
        let Self { archive, ctx } = self;
        archive.archive_pointer(key, id, &mut |a| {
            let mut sub = SerializeContext {
                archive: a,
                ctx: &mut **ctx,
            };
            let target = pointer.target.borrow();
            sub.put(&target, pointee, "0", None).map(|_| ())
        })?;
        Ok(Some(id))
    }

    fn put_alias(
        &mut self,
        alias: &AliasValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let id = self.claim(id);
        let Self { archive, ctx } = self;
        archive.archive_typedef(&alias.name, key, id, &mut |a| {
            let mut sub = SerializeContext {
                archive: a,
                ctx: &mut **ctx,
            };
            let value = alias.value.borrow();
            sub.put(&value, None, "0", None).map(|_| ())
        })?;
        Ok(Some(id))
    }

    fn put_opaque(
        &mut self,
        value: &Value,
        opaque: &OpaqueValue,
        key: &str,
        id: Option<Id>,
    ) -> Result<Option<Id>> {
        let Some(hook) = self.ctx.serializers.get(&opaque.name).cloned()
        else {
            self.ctx.report(Error::not_serializable(format!(
                "no serializer registered for opaque type `{}`",
                opaque.name
            )))?;
            self.archive.archive_null(&opaque.name, key)?;
            return Ok(None);
        };
        let id = self.claim(id);
        let Self { archive, ctx } = self;
        archive.archive_object(
            &opaque.name,
            &opaque.name,
            key,
            id,
            &mut |a| {
                let mut sub = SerializeContext {
                    archive: a,
                    ctx: &mut **ctx,
                };
                hook(&mut sub, value)
            },
        )?;
        Ok(Some(id))
    }

    /// Runs the slice and pointer passes over everything archived so
    /// far in this run.
    pub(crate) fn post_process(&mut self) -> Result<()> {
        let arrays = self.ctx.share.arrays().to_vec();
        for (id, record) in &arrays {
            match self.ctx.share.slice_owner(*id, record) {
                Some((owner, slice)) => {
                    self.archive.archive_slice(slice, *id, owner)?;
                }
                None => self.archive.post_process_array(*id)?,
            }
        }
        let pointers = self.ctx.share.pointers().to_vec();
        for (id, pointee) in &pointers {
            match self.ctx.share.value(*pointee) {
                Some((target, target_key)) => {
                    self.archive.archive_pointer_target(
                        target,
                        &target_key,
                        *id,
                    )?;
                }
                None => self.archive.post_process_pointer(*id)?,
            }
        }
        log::debug!(
            "post-processed {} arrays and {} pointers",
            arrays.len(),
            pointers.len()
        );
        Ok(())
    }
}
