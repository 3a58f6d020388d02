//! The reference tree-document backend.
//!
//! Documents are XML trees rooted at an `archive` element whose single
//! `data` child holds the archived nodes. The backend materializes the
//! whole tree in memory: emitting appends elements under a cursor,
//! reading walks the parsed tree, and the post-processing operations
//! rewrite previously emitted nodes in place. Rendering is compact;
//! pretty-printing is left to external tooling.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::archive::{
    Archive, ArrayHeader, ArrayRecord, Backend, EnumNode, Id, Inner,
    MapHeader, NodeKind, ObjectHeader, PrimitiveNode, Slice, SliceNode,
    StringNode, StructHeader,
};
use crate::error::{Error, Result};
use crate::ty::Scalar;

const FORMAT: &str = "org.dsource.orange.xml";
const VERSION: &str = "1.0.0";

/// One element of the document tree.
#[derive(Clone, Debug, Default, PartialEq)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.push((name.to_string(), value.into()));
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.as_str())
    }

    fn require_attr(&self, name: &str) -> Result<&str> {
        self.attr(name).ok_or_else(|| {
            Error::malformed(format!(
                "`{}` element without `{name}` attribute",
                self.name
            ))
        })
    }

    fn require_id(&self) -> Result<Id> {
        parse_usize(self.require_attr("id")?, "id")
    }
}

fn parse_usize(text: &str, what: &str) -> Result<usize> {
    text.parse().map_err(|_| {
        Error::malformed(format!("unparseable {what} `{text}`"))
    })
}

fn xml_error(error: impl core::fmt::Display) -> Error {
    Error::malformed(format!("invalid document: {error}"))
}

/// The tree-document archive backend.
#[derive(Clone, Debug)]
pub struct XmlArchive {
    doc: Element,
    path: Vec<usize>,
}

impl Default for XmlArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlArchive {
    /// Creates a backend holding an empty document.
    pub fn new() -> Self {
        Self {
            doc: Self::empty_doc(),
            path: Vec::new(),
        }
    }

    fn empty_doc() -> Element {
        let mut doc = Element::new("archive");
        doc.set_attr("version", VERSION);
        doc.set_attr("type", FORMAT);
        doc.children.push(Element::new("data"));
        doc
    }

    /// The element the cursor points at.
    fn current_mut(&mut self) -> &mut Element {
        if self.doc.children.is_empty() {
            self.doc.children.push(Element::new("data"));
        }
        let mut element = &mut self.doc.children[0];
        for &index in &self.path {
            element = &mut element.children[index];
        }
        element
    }

    fn append(&mut self, element: Element) {
        self.current_mut().children.push(element);
    }

    /// Appends `element`, runs `inner` positioned inside it, and
    /// restores the cursor on every exit path.
    fn open(&mut self, element: Element, inner: Inner<'_>) -> Result<()> {
        let index = {
            let current = self.current_mut();
            current.children.push(element);
            current.children.len() - 1
        };
        self.path.push(index);
        let result = inner(self);
        self.path.pop();
        result
    }

    /// Enters the child at `index`, runs `inner`, and restores the
    /// cursor on every exit path.
    fn enter<T>(
        &mut self,
        index: usize,
        inner: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.path.push(index);
        let result = inner(self);
        self.path.pop();
        result
    }

    /// Index of the child carrying `key`, restricted to the element
    /// names in `names` when non-empty. Two candidates under one key
    /// are a malformed document.
    fn find_child(
        &mut self,
        names: &[&str],
        key: &str,
    ) -> Result<Option<usize>> {
        let current = self.current_mut();
        let mut found = None;
        for (index, child) in current.children.iter().enumerate() {
            if !names.is_empty() && !names.contains(&child.name.as_str()) {
                continue;
            }
            if child.attr("key") != Some(key) {
                continue;
            }
            if found.is_some() {
                return Err(Error::malformed(format!(
                    "duplicate element for key `{key}`"
                )));
            }
            found = Some(index);
        }
        Ok(found)
    }

    fn require_child(&mut self, names: &[&str], key: &str) -> Result<usize> {
        let name = names.first().copied().unwrap_or("?");
        self.find_child(names, key)?.ok_or_else(|| {
            Error::malformed(format!(
                "no `{name}` element for key `{key}`"
            ))
        })
    }

    fn find_by_id<'el>(
        element: &'el mut Element,
        id: &str,
    ) -> Option<&'el mut Element> {
        if element.attr("id") == Some(id) {
            return Some(element);
        }
        for child in element.children.iter_mut() {
            if let Some(found) = Self::find_by_id(child, id) {
                return Some(found);
            }
        }
        None
    }

    fn node_mut(&mut self, id: Id) -> Result<&mut Element> {
        Self::find_by_id(&mut self.doc, &id.to_string()).ok_or_else(|| {
            Error::malformed(format!("no archived node with id {id}"))
        })
    }

    fn classify(name: &str) -> Result<NodeKind> {
        let kind = match name {
            "object" => NodeKind::Object,
            "struct" => NodeKind::Struct,
            "array" => NodeKind::Array,
            "associativeArray" => NodeKind::AssociativeArray,
            "string" => NodeKind::String,
            "pointer" => NodeKind::Pointer,
            "enum" => NodeKind::Enum,
            "typedef" => NodeKind::Typedef,
            "reference" => NodeKind::Reference,
            "slice" => NodeKind::Slice,
            "null" => NodeKind::Null,
            other => match Scalar::from_name(other) {
                Some(scalar) => NodeKind::Primitive(scalar),
                None => {
                    return Err(Error::malformed(format!(
                        "unknown element `{other}`"
                    )))
                }
            },
        };
        Ok(kind)
    }

    fn render(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        Self::write_element(&mut writer, &self.doc)?;
        String::from_utf8(writer.into_inner()).map_err(xml_error)
    }

    fn write_element(
        writer: &mut Writer<Vec<u8>>,
        element: &Element,
    ) -> Result<()> {
        let mut start = BytesStart::new(element.name.as_str());
        for (name, value) in &element.attributes {
            start.push_attribute((name.as_str(), value.as_str()));
        }
        if element.children.is_empty() && element.text.is_empty() {
            writer.write_event(Event::Empty(start)).map_err(xml_error)?;
            return Ok(());
        }
        writer.write_event(Event::Start(start)).map_err(xml_error)?;
        if !element.text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&element.text)))
                .map_err(xml_error)?;
        }
        for child in &element.children {
            Self::write_element(writer, child)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(element.name.as_str())))
            .map_err(xml_error)?;
        Ok(())
    }

    fn parse(text: &str) -> Result<Element> {
        let mut reader = Reader::from_str(text);
        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;
        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => {
                    stack.push(Self::element_from(&start)?);
                }
                Event::Empty(start) => {
                    let element = Self::element_from(&start)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        Error::malformed("unbalanced closing tag")
                    })?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_error)?;
                    if let Some(current) = stack.last_mut() {
                        // Insignificant whitespace from pretty-printed
                        // input; string content is never all-blank
                        // alongside child elements.
                        if text.trim().is_empty() && current.name != "string"
                        {
                            continue;
                        }
                        current.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    let text = core::str::from_utf8(&bytes)
                        .map_err(xml_error)?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(text);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        root.ok_or_else(|| Error::malformed("document has no root element"))
    }

    fn element_from(start: &BytesStart<'_>) -> Result<Element> {
        let name = core::str::from_utf8(start.name().as_ref())
            .map_err(xml_error)?
            .to_string();
        let mut element = Element::new(&name);
        for attribute in start.attributes() {
            let attribute = attribute.map_err(xml_error)?;
            let key = core::str::from_utf8(attribute.key.as_ref())
                .map_err(xml_error)?
                .to_string();
            let value = attribute.unescape_value().map_err(xml_error)?;
            element.attributes.push((key, value.into_owned()));
        }
        Ok(element)
    }

    fn attach(
        stack: &mut Vec<Element>,
        root: &mut Option<Element>,
        element: Element,
    ) -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => *root = Some(element),
            None => {
                return Err(Error::malformed(
                    "document has more than one root element",
                ))
            }
        }
        Ok(())
    }
}

impl Archive for XmlArchive {
    fn archive_object(
        &mut self,
        runtime_ty: &str,
        static_ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("object");
        element.set_attr("runtimeType", runtime_ty);
        element.set_attr("type", static_ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_struct(
        &mut self,
        ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("struct");
        element.set_attr("type", ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_array(
        &mut self,
        record: &ArrayRecord,
        elem_ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("array");
        element.set_attr("type", elem_ty);
        element.set_attr("length", record.len.to_string());
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_associative_array(
        &mut self,
        key_ty: &str,
        value_ty: &str,
        len: usize,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("associativeArray");
        element.set_attr("keyType", key_ty);
        element.set_attr("valueType", value_ty);
        element.set_attr("length", len.to_string());
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_associative_array_key(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("key");
        element.set_attr("key", entry_key);
        self.open(element, inner)
    }

    fn archive_associative_array_value(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("value");
        element.set_attr("key", entry_key);
        self.open(element, inner)
    }

    fn archive_pointer(
        &mut self,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("pointer");
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_base(
        &mut self,
        ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("base");
        element.set_attr("type", ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_string(
        &mut self,
        value: &str,
        elem_ty: &str,
        key: &str,
        id: Id,
    ) -> Result<()> {
        let mut element = Element::new("string");
        element.set_attr("type", elem_ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        element.text = value.to_string();
        self.append(element);
        Ok(())
    }

    fn archive_primitive(
        &mut self,
        ty: &str,
        value: &str,
        key: &str,
        id: Id,
    ) -> Result<()> {
        let mut element = Element::new(ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        element.text = value.to_string();
        self.append(element);
        Ok(())
    }

    fn archive_enum(
        &mut self,
        ty: &str,
        base_ty: &str,
        value: &str,
        key: &str,
        id: Id,
    ) -> Result<()> {
        let mut element = Element::new("enum");
        element.set_attr("type", ty);
        element.set_attr("baseType", base_ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        element.text = value.to_string();
        self.append(element);
        Ok(())
    }

    fn archive_typedef(
        &mut self,
        ty: &str,
        key: &str,
        id: Id,
        inner: Inner<'_>,
    ) -> Result<()> {
        let mut element = Element::new("typedef");
        element.set_attr("type", ty);
        element.set_attr("key", key);
        element.set_attr("id", id.to_string());
        self.open(element, inner)
    }

    fn archive_reference(&mut self, key: &str, target: Id) -> Result<()> {
        let mut element = Element::new("reference");
        element.set_attr("key", key);
        element.text = target.to_string();
        self.append(element);
        Ok(())
    }

    fn archive_null(&mut self, ty: &str, key: &str) -> Result<()> {
        let mut element = Element::new("null");
        element.set_attr("type", ty);
        element.set_attr("key", key);
        self.append(element);
        Ok(())
    }

    fn archive_slice(
        &mut self,
        slice: Slice,
        id: Id,
        array: Id,
    ) -> Result<()> {
        let node = self.node_mut(id)?;
        let key = node.attr("key").unwrap_or_default().to_string();
        node.name = "slice".to_string();
        node.attributes.clear();
        node.set_attr("key", key);
        node.set_attr("id", id.to_string());
        node.set_attr("offset", slice.offset.to_string());
        node.set_attr("length", slice.len.to_string());
        node.children.clear();
        node.text = array.to_string();
        Ok(())
    }

    fn archive_pointer_target(
        &mut self,
        target: Id,
        _target_key: &str,
        pointer: Id,
    ) -> Result<()> {
        let node = self.node_mut(pointer)?;
        if node.name != "pointer" {
            return Err(Error::malformed(format!(
                "node {pointer} is not a pointer"
            )));
        }
        node.children.clear();
        node.text.clear();
        let mut reference = Element::new("reference");
        reference.set_attr("key", "0");
        reference.text = target.to_string();
        node.children.push(reference);
        Ok(())
    }

    fn post_process_array(&mut self, _id: Id) -> Result<()> {
        // Standalone arrays were already emitted in full.
        Ok(())
    }

    fn post_process_pointer(&mut self, _id: Id) -> Result<()> {
        // Dangling pointers keep their inline pointee.
        Ok(())
    }

    fn peek(&mut self, key: &str) -> Result<Option<NodeKind>> {
        match self.find_child(&[], key)? {
            Some(index) => {
                let name = self.current_mut().children[index].name.clone();
                Self::classify(&name).map(Some)
            }
            None => Ok(None),
        }
    }

    fn unarchive_object(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &ObjectHeader) -> Result<()>,
    ) -> Result<()> {
        let index = self.require_child(&["object"], key)?;
        let header = {
            let element = &self.current_mut().children[index];
            ObjectHeader {
                id: element.require_id()?,
                runtime_type: element.require_attr("runtimeType")?.into(),
                static_type: element.attr("type").unwrap_or_default().into(),
            }
        };
        self.enter(index, |archive| inner(archive, &header))
    }

    fn unarchive_struct(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &StructHeader) -> Result<()>,
    ) -> Result<()> {
        let index = self.require_child(&["struct"], key)?;
        let header = {
            let element = &self.current_mut().children[index];
            StructHeader {
                id: element.require_id()?,
                ty: element.require_attr("type")?.into(),
            }
        };
        self.enter(index, |archive| inner(archive, &header))
    }

    fn unarchive_array(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &ArrayHeader) -> Result<()>,
    ) -> Result<()> {
        let index = self.require_child(&["array"], key)?;
        let header = {
            let element = &self.current_mut().children[index];
            ArrayHeader {
                id: element.require_id()?,
                elem: element.require_attr("type")?.into(),
                len: parse_usize(element.require_attr("length")?, "length")?,
            }
        };
        self.enter(index, |archive| inner(archive, &header))
    }

    fn unarchive_associative_array(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &MapHeader) -> Result<()>,
    ) -> Result<()> {
        let index = self.require_child(&["associativeArray"], key)?;
        let header = {
            let element = &self.current_mut().children[index];
            MapHeader {
                id: element.require_id()?,
                key: element.require_attr("keyType")?.into(),
                value: element.require_attr("valueType")?.into(),
                len: parse_usize(element.require_attr("length")?, "length")?,
            }
        };
        self.enter(index, |archive| inner(archive, &header))
    }

    fn unarchive_associative_array_key(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()> {
        let index = self.require_child(&["key"], entry_key)?;
        self.enter(index, |archive| inner(archive))
    }

    fn unarchive_associative_array_value(
        &mut self,
        entry_key: &str,
        inner: Inner<'_>,
    ) -> Result<()> {
        let index = self.require_child(&["value"], entry_key)?;
        self.enter(index, |archive| inner(archive))
    }

    fn unarchive_pointer(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, Id) -> Result<()>,
    ) -> Result<()> {
        let index = self.require_child(&["pointer"], key)?;
        let id = self.current_mut().children[index].require_id()?;
        self.enter(index, |archive| inner(archive, id))
    }

    fn unarchive_base(
        &mut self,
        ty: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, Id) -> Result<()>,
    ) -> Result<()> {
        let index = {
            let current = self.current_mut();
            let mut found = None;
            for (index, child) in current.children.iter().enumerate() {
                if child.name != "base" || child.attr("type") != Some(ty) {
                    continue;
                }
                if found.is_some() {
                    return Err(Error::malformed(format!(
                        "duplicate base element for type `{ty}`"
                    )));
                }
                found = Some(index);
            }
            found.ok_or_else(|| {
                Error::malformed(format!("no base element for type `{ty}`"))
            })?
        };
        let id = self.current_mut().children[index].require_id()?;
        self.enter(index, |archive| inner(archive, id))
    }

    fn unarchive_string(&mut self, key: &str) -> Result<StringNode> {
        let index = self.require_child(&["string"], key)?;
        let element = &self.current_mut().children[index];
        Ok(StringNode {
            id: element.require_id()?,
            elem: element.attr("type").unwrap_or("char").into(),
            value: element.text.clone(),
        })
    }

    fn unarchive_primitive(&mut self, key: &str) -> Result<PrimitiveNode> {
        let index = self.find_child(&[], key)?.ok_or_else(|| {
            Error::malformed(format!("no element for key `{key}`"))
        })?;
        let element = &self.current_mut().children[index];
        if Scalar::from_name(&element.name).is_none() {
            return Err(Error::malformed(format!(
                "`{}` is not a primitive element",
                element.name
            )));
        }
        Ok(PrimitiveNode {
            id: element.require_id()?,
            ty: element.name.clone(),
            value: element.text.clone(),
        })
    }

    fn unarchive_enum(&mut self, key: &str) -> Result<EnumNode> {
        let index = self.require_child(&["enum"], key)?;
        let element = &self.current_mut().children[index];
        Ok(EnumNode {
            id: element.require_id()?,
            ty: element.require_attr("type")?.into(),
            base: element.attr("baseType").unwrap_or("int").into(),
            value: element.text.clone(),
        })
    }

    fn unarchive_typedef(
        &mut self,
        key: &str,
        inner: &mut dyn FnMut(&mut dyn Archive, &StructHeader) -> Result<()>,
    ) -> Result<()> {
        let index = self.require_child(&["typedef"], key)?;
        let header = {
            let element = &self.current_mut().children[index];
            StructHeader {
                id: element.require_id()?,
                ty: element.require_attr("type")?.into(),
            }
        };
        self.enter(index, |archive| inner(archive, &header))
    }

    fn unarchive_reference(&mut self, key: &str) -> Result<Option<Id>> {
        match self.find_child(&["reference"], key)? {
            Some(index) => {
                let element = &self.current_mut().children[index];
                parse_usize(element.text.trim(), "reference target")
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    fn unarchive_slice(&mut self, key: &str) -> Result<Option<SliceNode>> {
        match self.find_child(&["slice"], key)? {
            Some(index) => {
                let element = &self.current_mut().children[index];
                Ok(Some(SliceNode {
                    id: element.require_id()?,
                    array: parse_usize(element.text.trim(), "slice target")?,
                    offset: parse_usize(
                        element.require_attr("offset")?,
                        "offset",
                    )?,
                    len: parse_usize(
                        element.require_attr("length")?,
                        "length",
                    )?,
                }))
            }
            None => Ok(None),
        }
    }

    fn unarchive_null(&mut self, key: &str) -> Result<Option<String>> {
        match self.find_child(&["null"], key)? {
            Some(index) => {
                let element = &self.current_mut().children[index];
                Ok(Some(element.attr("type").unwrap_or_default().into()))
            }
            None => Ok(None),
        }
    }

    fn scope_keys(&mut self) -> Result<Vec<String>> {
        Ok(self
            .current_mut()
            .children
            .iter()
            .filter_map(|child| child.attr("key"))
            .map(String::from)
            .collect())
    }
}

impl Backend for XmlArchive {
    type Data = String;

    fn begin_archiving(&mut self) {
        self.doc = Self::empty_doc();
        self.path.clear();
    }

    fn begin_unarchiving(&mut self, data: &String) -> Result<()> {
        let mut doc = Self::parse(data)?;
        if doc.name != "archive" {
            return Err(Error::malformed(format!(
                "expected `archive` root, found `{}`",
                doc.name
            )));
        }
        let data_index = doc
            .children
            .iter()
            .position(|child| child.name == "data")
            .ok_or_else(|| {
                Error::malformed("archive without a `data` element")
            })?;
        // The cursor implementation keeps `data` at child position zero.
        doc.children.swap(0, data_index);
        self.doc = doc;
        self.path.clear();
        Ok(())
    }

    fn untyped_data(&self) -> Result<String> {
        self.render()
    }

    fn reset(&mut self) {
        self.doc = Self::empty_doc();
        self.path.clear();
    }
}
