//! Validated names: object paths, interface, member, error and bus names.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::error::*;

const MAX_NAME_LENGTH: usize = 255;

/// A slash-delimited hierarchical name such as `/org/example/Echo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new<S: Into<String>>(path: S) -> Result<ObjectPath> {
        let path = path.into();
        if !is_valid_object_path(&path) {
            return Err(ErrorKind::InvalidName(path).into_error());
        }
        Ok(ObjectPath(path))
    }

    pub fn root() -> ObjectPath {
        ObjectPath("/".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if `self` equals `namespace` or lies below it.
    pub fn is_in_namespace(&self, namespace: &ObjectPath) -> bool {
        if namespace.0 == "/" || self.0 == namespace.0 {
            return true;
        }
        self.0
            .strip_prefix(namespace.0.as_str())
            .map_or(false, |rest| rest.starts_with('/'))
    }

    /// The direct child segment of `self` leading towards `descendant`, if
    /// `descendant` lies strictly below `self`.
    pub fn child_towards(&self, descendant: &ObjectPath) -> Option<String> {
        if descendant == self || !descendant.is_in_namespace(self) {
            return None;
        }
        let rest = if self.0 == "/" {
            &descendant.0[1..]
        } else {
            &descendant.0[self.0.len() + 1..]
        };
        rest.split('/').next().map(str::to_string)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::convert::TryFrom<String> for ObjectPath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        ObjectPath::new(s)
    }
}

impl std::convert::TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        ObjectPath::new(s)
    }
}

impl From<ObjectPath> for String {
    fn from(p: ObjectPath) -> Self {
        p.0
    }
}

impl PartialEq<str> for ObjectPath {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ObjectPath {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    match path.strip_prefix('/') {
        Some(rest) => rest.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }),
        None => false,
    }
}

fn is_element(element: &str, allow_leading_digit: bool, allow_dash: bool) -> bool {
    let mut bytes = element.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        Some(b) if allow_leading_digit && b.is_ascii_digit() => {}
        Some(b'-') if allow_dash => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || (allow_dash && b == b'-'))
}

fn is_dotted(name: &str, allow_leading_digit: bool, allow_dash: bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let mut count = 0;
    for element in name.split('.') {
        if !is_element(element, allow_leading_digit, allow_dash) {
            return false;
        }
        count += 1;
    }
    count >= 2
}

pub fn is_valid_interface_name(name: &str) -> bool {
    is_dotted(name, false, false)
}

pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

pub fn is_valid_member_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENGTH && is_element(name, false, false)
}

/// Unique (`:1.42`) or well-known (`org.example.Service`) bus name.
pub fn is_valid_bus_name(name: &str) -> bool {
    match name.strip_prefix(':') {
        Some(unique) => name.len() <= MAX_NAME_LENGTH && is_dotted(unique, true, true),
        None => is_dotted(name, false, true),
    }
}

pub(crate) fn check_interface(name: &str) -> Result<()> {
    if !is_valid_interface_name(name) {
        return Err(ErrorKind::InvalidName(name.to_string()).into_error());
    }
    Ok(())
}

pub(crate) fn check_member(name: &str) -> Result<()> {
    if !is_valid_member_name(name) {
        return Err(ErrorKind::InvalidName(name.to_string()).into_error());
    }
    Ok(())
}

pub(crate) fn check_error_name(name: &str) -> Result<()> {
    if !is_valid_error_name(name) {
        return Err(ErrorKind::InvalidName(name.to_string()).into_error());
    }
    Ok(())
}

pub(crate) fn check_bus_name(name: &str) -> Result<()> {
    if !is_valid_bus_name(name) {
        return Err(ErrorKind::InvalidName(name.to_string()).into_error());
    }
    Ok(())
}
