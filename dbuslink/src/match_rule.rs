//! Match rules select the messages a subscription receives.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::*;
use crate::message::{Message, MessageType};
use crate::value::Value;

pub const MAX_MATCH_ARG: u8 = 63;

/// A set of criteria a message must satisfy, in the textual form
/// `type='signal',interface='org.example.Foo',arg0='x'`.
///
/// ```rust
/// use dbuslink::{MatchRule, MessageType};
///
/// let rule = MatchRule::new()
///     .message_type(MessageType::Signal)
///     .interface("org.example.Foo")
///     .member("Changed");
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',interface='org.example.Foo',member='Changed'"
/// );
/// assert_eq!(rule.to_string().parse::<MatchRule>().unwrap(), rule);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    args: BTreeMap<u8, String>,
}

impl MatchRule {
    /// A rule matching every message.
    pub fn new() -> MatchRule {
        MatchRule::default()
    }

    /// The rule for one signal, as a signal proxy subscribes it.
    pub fn for_signal(sender: Option<&str>, path: &str, interface: &str, member: &str) -> MatchRule {
        let mut rule = MatchRule::new()
            .message_type(MessageType::Signal)
            .path(path)
            .interface(interface)
            .member(member);
        rule.sender = sender.map(str::to_string);
        rule
    }

    pub fn message_type(mut self, t: MessageType) -> Self {
        self.message_type = Some(t);
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Replaces any `path_namespace`.
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.into());
        self.path_namespace = None;
        self
    }

    /// Replaces any `path`.
    pub fn path_namespace(mut self, namespace: &str) -> Self {
        self.path_namespace = Some(namespace.into());
        self.path = None;
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Require string argument `n` to equal `value`. `n` above
    /// [`MAX_MATCH_ARG`] is ignored.
    pub fn arg(mut self, n: u8, value: &str) -> Self {
        if n <= MAX_MATCH_ARG {
            self.args.insert(n, value.into());
        }
        self
    }

    pub fn get_message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    pub fn get_interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn get_member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn parse(rule: &str) -> Result<MatchRule> {
        let bad = |reason: String| {
            ErrorKind::InvalidData(format!("match rule '{}': {}", rule, reason)).into_error()
        };
        let mut result = MatchRule::new();
        let mut chars = rule.chars().peekable();

        loop {
            while chars.peek() == Some(&' ') {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '=' {
                    break;
                }
                key.push(c);
            }

            let mut value = String::new();
            let mut quoted = false;
            let mut closed = true;
            while let Some(c) = chars.next() {
                match c {
                    '\'' => {
                        quoted = !quoted;
                        closed = !quoted;
                    }
                    '\\' if !quoted && chars.peek() == Some(&'\'') => {
                        chars.next();
                        value.push('\'');
                    }
                    ',' if !quoted => break,
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(bad("unterminated quote".into()));
            }

            let key = key.trim();
            match key {
                "type" => {
                    result.message_type = Some(match value.as_str() {
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        "signal" => MessageType::Signal,
                        other => return Err(bad(format!("unknown type '{}'", other))),
                    })
                }
                "sender" => result.sender = Some(value),
                "interface" => result.interface = Some(value),
                "member" => result.member = Some(value),
                "path" => result.path = Some(value),
                "path_namespace" => result.path_namespace = Some(value),
                "destination" => result.destination = Some(value),
                k if k.starts_with("arg") => {
                    let n = k[3..]
                        .parse::<u8>()
                        .ok()
                        .filter(|n| *n <= MAX_MATCH_ARG)
                        .ok_or_else(|| bad(format!("unsupported key '{}'", k)))?;
                    result.args.insert(n, value);
                }
                k => return Err(bad(format!("unsupported key '{}'", k))),
            }
        }

        if result.path.is_some() && result.path_namespace.is_some() {
            return Err(bad("path and path_namespace are exclusive".into()));
        }
        Ok(result)
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(t) = self.message_type {
            if message.message_type() != t {
                return false;
            }
        }
        // A well-known sender name cannot be resolved to its owner here,
        // and peer-to-peer messages carry no sender at all.
        if let (Some(want), Some(got)) = (&self.sender, message.sender()) {
            if want.starts_with(':') && want != got {
                return false;
            }
        }
        if !field_matches(&self.interface, message.interface()) {
            return false;
        }
        if !field_matches(&self.member, message.member()) {
            return false;
        }
        if !field_matches(&self.destination, message.destination()) {
            return false;
        }
        let path = message.path().map(|p| p.as_str());
        if !field_matches(&self.path, path) {
            return false;
        }
        if let Some(ns) = &self.path_namespace {
            match path {
                Some(p) if in_namespace(p, ns) => {}
                _ => return false,
            }
        }
        if !self.args.is_empty() {
            let values = match message.body_values() {
                Ok(v) => v,
                Err(_) => return false,
            };
            for (n, want) in &self.args {
                match values.get(*n as usize) {
                    Some(Value::String(got)) if got == want => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

fn field_matches(want: &Option<String>, got: Option<&str>) -> bool {
    match want {
        None => true,
        Some(w) => got == Some(w.as_str()),
    }
}

fn in_namespace(path: &str, ns: &str) -> bool {
    ns == "/"
        || path == ns
        || (path.starts_with(ns) && path.as_bytes().get(ns.len()) == Some(&b'/'))
}

fn write_value(f: &mut fmt::Formatter<'_>, key: &str, value: &str) -> fmt::Result {
    write!(f, "{}='{}'", key, value.replace('\'', "'\\''"))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<(String, &str)> = Vec::new();
        if let Some(t) = self.message_type {
            parts.push(("type".into(), t.as_str()));
        }
        for (key, value) in [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
        ] {
            if let Some(v) = value {
                parts.push((key.into(), v.as_str()));
            }
        }
        for (n, v) in &self.args {
            parts.push((format!("arg{}", n), v.as_str()));
        }
        for (i, (key, value)) in parts.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write_value(f, key, value)?;
        }
        Ok(())
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MatchRule::parse(s)
    }
}
