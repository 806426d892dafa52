//! `org.freedesktop.DBus.Peer`, answered on every connection.

use std::fs;

use crate::error::*;
use crate::message::Message;

pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// 32 lowercase hex digits identifying this machine.
pub fn machine_id() -> Result<String> {
    for file in MACHINE_ID_FILES {
        if let Ok(content) = fs::read_to_string(file) {
            let id = content.trim();
            if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Ok(id.to_ascii_lowercase());
            }
        }
    }
    Err(ErrorKind::Failed("no machine id available".into()).into_error())
}

/// The reply to a Peer call; `None` if `call` is not one.
pub(crate) fn handle(call: &Message) -> Option<Result<Message>> {
    let member = call.member()?;
    match call.interface() {
        Some(PEER_INTERFACE) => {}
        None if member == "Ping" || member == "GetMachineId" => {}
        _ => return None,
    }
    if !call.signature().is_empty() {
        return Some(Message::error_reply(
            call,
            &ErrorKind::InvalidArgs(format!("{} takes no arguments", member)),
        ));
    }
    let reply = match member {
        "Ping" => Message::method_return(call).build(),
        "GetMachineId" => match machine_id() {
            Ok(id) => Message::method_return(call)
                .body(&(id,))
                .and_then(|b| b.build()),
            Err(e) => Message::error_reply(call, e.kind()),
        },
        other => Message::error_reply(
            call,
            &ErrorKind::UnknownMethod(format!(
                "No such method '{}' in interface '{}'",
                other, PEER_INTERFACE
            )),
        ),
    };
    Some(reply)
}
