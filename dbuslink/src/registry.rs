//! The table of exported objects consulted for every inbound call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::*;
use crate::introspect::*;
use crate::names::ObjectPath;
use crate::object::{Interface, Method, Object};
use crate::worker::DeliveryPolicy;

#[derive(Debug, Default)]
struct ObjectEntry {
    policy: DeliveryPolicy,
    interfaces: BTreeMap<String, Interface>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    objects: BTreeMap<ObjectPath, ObjectEntry>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Add `object`'s interfaces at its path. Nothing changes when any of
    /// them is already registered there.
    pub fn register_object(&mut self, object: Object) -> Result<()> {
        let (path, policy, interfaces) = object.into_parts();
        if let Some(entry) = self.objects.get(&path) {
            if let Some(name) = interfaces.keys().find(|n| entry.interfaces.contains_key(*n)) {
                return Err(ErrorKind::DuplicateRegistration(format!(
                    "interface '{}' at '{}'",
                    name, path
                )).into_error());
            }
        }
        let entry = self.objects.entry(path).or_default();
        if let Some(policy) = policy {
            entry.policy = policy;
        }
        entry.interfaces.extend(interfaces);
        Ok(())
    }

    pub fn register_method(&mut self, path: &ObjectPath, interface: &str, method: Method) -> Result<()> {
        if let Some(existing) = self
            .objects
            .get(path)
            .and_then(|e| e.interfaces.get(interface))
        {
            if existing.has_member(method.name()) {
                return Err(ErrorKind::DuplicateRegistration(format!(
                    "method '{}' of '{}' at '{}'",
                    method.name(),
                    interface,
                    path
                )).into_error());
            }
        }
        let new_interface = Interface::new(interface)?;
        let entry = self.objects.entry(path.clone()).or_default();
        entry
            .interfaces
            .entry(interface.to_string())
            .or_insert(new_interface)
            .add_method(method)
    }

    pub fn unregister_object(&mut self, path: &ObjectPath) -> bool {
        self.objects.remove(path).is_some()
    }

    pub fn set_policy(&mut self, path: &ObjectPath, policy: DeliveryPolicy) -> Result<()> {
        match self.objects.get_mut(path) {
            Some(entry) => {
                entry.policy = policy;
                Ok(())
            }
            None => Err(ErrorKind::UnknownObject(format!(
                "No such object path '{}'",
                path
            )).into_error()),
        }
    }

    /// Resolve a call target. Without an interface every interface of the
    /// object is searched in name order.
    pub fn lookup(
        &self,
        path: &ObjectPath,
        interface: Option<&str>,
        member: &str,
    ) -> Result<(Arc<Method>, DeliveryPolicy)> {
        let entry = self.objects.get(path).ok_or_else(|| {
            ErrorKind::UnknownObject(format!(
                "No such object path '{}'",
                path
            )).into_error()
        })?;

        let method = match interface {
            Some(name) => {
                let iface = entry.interfaces.get(name).ok_or_else(|| {
                    ErrorKind::UnknownInterface(format!(
                        "No such interface '{}' at object path '{}'",
                        name, path
                    )).into_error()
                })?;
                iface.method(member)
            }
            None => entry.interfaces.values().find_map(|i| i.method(member)),
        };

        match method {
            Some(m) => Ok((m.clone(), entry.policy.clone())),
            None => Err(ErrorKind::UnknownMethod(format!(
                "No such method '{}' in interface '{}' at object path '{}'",
                member,
                interface.unwrap_or("*"),
                path
            )).into_error()),
        }
    }

    pub fn is_registered(&self, path: &ObjectPath) -> bool {
        self.objects.contains_key(path)
    }

    fn children(&self, path: &ObjectPath) -> Vec<String> {
        let set: BTreeSet<String> = self
            .objects
            .keys()
            .filter_map(|p| path.child_towards(p))
            .collect();
        set.into_iter().collect()
    }

    /// Describe `path`; `None` when nothing is exported at or below it.
    pub fn describe(&self, path: &ObjectPath) -> Option<ObjectDescription> {
        let children = self.children(path);
        let entry = self.objects.get(path);
        if entry.is_none() && children.is_empty() {
            return None;
        }
        let interfaces = entry
            .map(|e| {
                e.interfaces
                    .values()
                    .map(|i| InterfaceDescription {
                        name: i.name().to_string(),
                        methods: i
                            .methods()
                            .map(|m| MethodDescription {
                                name: m.name().to_string(),
                                input: m.input().to_string(),
                                output: m.output().to_string(),
                            })
                            .collect(),
                        signals: i
                            .signals()
                            .map(|(name, sig)| SignalDescription {
                                name: name.to_string(),
                                signature: sig.to_string(),
                            })
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(ObjectDescription {
            path: path.to_string(),
            interfaces,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ObjectPath {
        ObjectPath::new(p).unwrap()
    }

    fn echo_object(p: &str) -> Object {
        let iface = Interface::new("org.example.Echo")
            .unwrap()
            .with_method(Method::typed("Echo", |(s,): (String,)| Ok((s,))).unwrap())
            .unwrap()
            .with_signal("Echoed", "s")
            .unwrap();
        Object::new(p).unwrap().with_interface(iface).unwrap()
    }

    #[test]
    fn test_lookup_errors() {
        let mut r = Registry::new();
        r.register_object(echo_object("/org/example/Echo")).unwrap();

        let (m, _) = r
            .lookup(&path("/org/example/Echo"), Some("org.example.Echo"), "Echo")
            .unwrap();
        assert_eq!(m.input(), "s");
        assert!(r.lookup(&path("/org/example/Echo"), None, "Echo").is_ok());

        let e = r.lookup(&path("/nope"), None, "Echo").unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::UnknownObject(_)));
        let e = r
            .lookup(&path("/org/example/Echo"), Some("org.example.Other"), "Echo")
            .unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::UnknownInterface(_)));
        let e = r
            .lookup(&path("/org/example/Echo"), Some("org.example.Echo"), "Nope")
            .unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::UnknownMethod(_)));
    }

    #[test]
    fn test_duplicate_leaves_state_unchanged() {
        let mut r = Registry::new();
        r.register_object(echo_object("/a")).unwrap();
        let e = r.register_object(echo_object("/a")).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::DuplicateRegistration(_)));

        let e = r
            .register_method(
                &path("/a"),
                "org.example.Echo",
                Method::new("Echo", "", "", |_| Ok(())).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::DuplicateRegistration(_)));
        let (m, _) = r.lookup(&path("/a"), None, "Echo").unwrap();
        assert_eq!(m.input(), "s");

        r.register_method(
            &path("/a"),
            "org.example.Echo",
            Method::new("Other", "", "", |_| Ok(())).unwrap(),
        )
        .unwrap();
        assert!(r.lookup(&path("/a"), None, "Other").is_ok());
    }

    #[test]
    fn test_describe() {
        let mut r = Registry::new();
        r.register_object(echo_object("/org/example/Echo")).unwrap();
        r.register_object(echo_object("/org/example/Echo/sub")).unwrap();

        let d = r.describe(&path("/org")).unwrap();
        assert!(d.interfaces.is_empty());
        assert_eq!(d.children, vec!["example".to_string()]);

        let d = r.describe(&path("/org/example/Echo")).unwrap();
        assert_eq!(d.children, vec!["sub".to_string()]);
        let echo = d.interface("org.example.Echo").unwrap();
        assert_eq!(echo.methods[0].input, "s");
        assert_eq!(echo.signals[0].name, "Echoed");

        let json = d.to_json().unwrap();
        assert_eq!(ObjectDescription::from_json(&json).unwrap(), d);

        assert!(r.describe(&path("/elsewhere")).is_none());
        assert!(r.unregister_object(&path("/org/example/Echo")));
        assert!(!r.unregister_object(&path("/org/example/Echo")));
    }
}
