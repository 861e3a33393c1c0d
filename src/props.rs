// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::collections::BTreeMap;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use xmltree::{Element, EmitterConfig, Namespace, XMLNode};

use crate::acl::Privilege;

pub const DAV_NS: &str = "DAV:";
pub const DAV_PREFIX: &str = "D";

const NS_NO_PREFIX: &str = "";

pub const GETCONTENTLENGTH: &str = "getcontentlength";
pub const GETLASTMODIFIED: &str = "getlastmodified";
pub const OWNER: &str = "owner";
pub const GROUP: &str = "group";
pub const CURRENT_USER_PRIVILEGE_SET: &str = "current-user-privilege-set";
pub const DISPLAYNAME: &str = "displayname";
pub const RESOURCETYPE: &str = "resourcetype";
pub const ISCOLLECTION: &str = "iscollection";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyName {
    pub namespace: String,
    pub name: String,
}

impl PropertyName {
    pub fn new(namespace: &str, name: &str) -> Self {
        PropertyName {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// A name in the `DAV:` namespace.
    pub fn dav(name: &str) -> Self {
        PropertyName::new(DAV_NS, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    ResourceType { collection: bool },
    Privileges(Vec<Privilege>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavProperty {
    pub name: PropertyName,
    pub value: PropertyValue,
}

impl DavProperty {
    pub fn text<T: ToString>(name: &str, value: T) -> Self {
        DavProperty {
            name: PropertyName::dav(name),
            value: PropertyValue::Text(value.to_string()),
        }
    }

    /// The property as a self-contained XML element.
    pub fn to_element(&self) -> Element {
        let PropertyName { namespace, name } = &self.name;
        let mut elem = if namespace == DAV_NS {
            dav_element(name)
        } else {
            let mut elem = Element::new(name);
            elem.namespace = Some(namespace.clone());
            let mut ns = Namespace::empty();
            ns.put(NS_NO_PREFIX, namespace.as_str());
            ns.put(DAV_PREFIX, DAV_NS);
            elem.namespaces = Some(ns);
            elem
        };
        match &self.value {
            PropertyValue::Text(text) => elem.children.push(XMLNode::Text(text.clone())),
            PropertyValue::ResourceType { collection: true } => {
                elem.children.push(XMLNode::Element(dav_child("collection")))
            }
            PropertyValue::ResourceType { collection: false } => {}
            PropertyValue::Privileges(privileges) => {
                for p in privileges {
                    let mut privilege = dav_child("privilege");
                    privilege.children.push(XMLNode::Element(dav_child(p.name())));
                    elem.children.push(XMLNode::Element(privilege));
                }
            }
        }
        elem
    }

    /// Serializes the property as a self-contained XML fragment.
    pub fn to_xml(&self) -> Vec<u8> {
        write_xml(&self.to_element(), false)
    }
}

/// One entry of a property update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyChange {
    Set(DavProperty),
    Remove(PropertyName),
}

impl PropertyChange {
    pub fn name(&self) -> &PropertyName {
        match self {
            PropertyChange::Set(prop) => &prop.name,
            PropertyChange::Remove(name) => name,
        }
    }
}

/// Properties of one resource, populated at most once per resource.
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    initialized: bool,
    props: BTreeMap<PropertyName, DavProperty>,
}

impl PropertySet {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn add(&mut self, prop: DavProperty) {
        self.props.insert(prop.name.clone(), prop);
    }

    pub fn get(&self, name: &PropertyName) -> Option<&DavProperty> {
        self.props.get(name)
    }

    pub fn remove(&mut self, name: &PropertyName) -> Option<DavProperty> {
        self.props.remove(name)
    }

    pub fn names(&self) -> Vec<PropertyName> {
        self.props.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DavProperty> {
        self.props.values()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

/// Formats a timestamp as an RFC 1123 date in GMT, as `getlastmodified` requires.
pub fn http_date(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Root element in the `DAV:` namespace, declaring the `D` prefix.
pub fn dav_element(name: &str) -> Element {
    let mut elem = dav_child(name);
    let mut ns = Namespace::empty();
    ns.put(DAV_PREFIX, DAV_NS);
    elem.namespaces = Some(ns);
    elem
}

/// Element in the `DAV:` namespace relying on a declaration of an ancestor.
pub fn dav_child(name: &str) -> Element {
    let mut elem = Element::new(name);
    elem.prefix = Some(DAV_PREFIX.to_string());
    elem.namespace = Some(DAV_NS.to_string());
    elem
}

/// Writes `elem` without indentation, optionally after an XML declaration.
pub fn write_xml(elem: &Element, declaration: bool) -> Vec<u8> {
    let config = EmitterConfig::new()
        .perform_indent(false)
        .write_document_declaration(declaration);
    let mut buf = Vec::new();
    if let Err(e) = elem.write_with_config(&mut buf, config) {
        warn!("unable to serialize <{}>: {}", elem.name, e);
    }
    buf
}
