//! Machine readable description of exported objects.

use chainerror::*;
use serde_derive::{Deserialize, Serialize};

use crate::error::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescription {
    pub name: String,
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescription {
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    pub name: String,
    pub methods: Vec<MethodDescription>,
    pub signals: Vec<SignalDescription>,
}

/// An object path, the interfaces exported there and the names of the
/// child nodes below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescription {
    pub path: String,
    pub interfaces: Vec<InterfaceDescription>,
    pub children: Vec<String>,
}

impl ObjectDescription {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_context(|e| ErrorKind::InvalidData(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<ObjectDescription> {
        serde_json::from_str(json).map_context(|e| ErrorKind::InvalidData(e.to_string()))
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceDescription> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}
