//! Bus addresses: `transport:key=value,key=value`, several separated by `;`.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::str::FromStr;

use chainerror::*;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::error::*;
use crate::stream::Stream;

pub const SYSTEM_BUS_DEFAULT_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    Session,
    System,
    /// The bus that activated this process.
    Starter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    transport: String,
    params: BTreeMap<String, String>,
}

fn invalid(address: &str, reason: &str) -> Error {
    ErrorKind::InvalidAddress(format!("{}: {}", address, reason)).into_error()
}

fn unescape(address: &str, value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| invalid(address, "bad percent escape"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid(address, "value is not UTF-8"))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

impl BusAddress {
    pub fn parse(address: &str) -> Result<BusAddress> {
        let (transport, rest) = address
            .split_once(':')
            .ok_or_else(|| invalid(address, "missing ':'"))?;
        if transport.is_empty() {
            return Err(invalid(address, "empty transport"));
        }
        let mut params = BTreeMap::new();
        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(address, "parameter without '='"))?;
            if key.is_empty() {
                return Err(invalid(address, "empty parameter name"));
            }
            if params
                .insert(key.to_string(), unescape(address, value)?)
                .is_some()
            {
                return Err(invalid(address, "duplicate parameter"));
            }
        }
        Ok(BusAddress {
            transport: transport.to_string(),
            params,
        })
    }

    /// Parse a `;` separated list, in order of preference.
    pub fn parse_list(addresses: &str) -> Result<Vec<BusAddress>> {
        let list = addresses
            .split(';')
            .filter(|a| !a.is_empty())
            .map(BusAddress::parse)
            .collect::<Result<Vec<_>>>()?;
        if list.is_empty() {
            return Err(invalid(addresses, "no address"));
        }
        Ok(list)
    }

    /// Resolve the addresses of a well-known bus from the environment.
    pub fn for_bus(bus: BusType) -> Result<Vec<BusAddress>> {
        BusAddress::for_bus_with(bus, |name| env::var(name).ok())
    }

    pub(crate) fn for_bus_with<F>(bus: BusType, var: F) -> Result<Vec<BusAddress>>
    where
        F: Fn(&str) -> Option<String>,
    {
        match bus {
            BusType::Session => match var("DBUS_SESSION_BUS_ADDRESS") {
                Some(a) => BusAddress::parse_list(&a),
                None => match var("XDG_RUNTIME_DIR") {
                    Some(dir) => BusAddress::parse_list(&format!(
                        "unix:path={}",
                        escape(&format!("{}/bus", dir))
                    )),
                    None => Err(ErrorKind::InvalidAddress(
                        "no session bus address in the environment".into()
                    ).into_error()),
                },
            },
            BusType::System => BusAddress::parse_list(
                &var("DBUS_SYSTEM_BUS_ADDRESS")
                    .unwrap_or_else(|| SYSTEM_BUS_DEFAULT_ADDRESS.to_string()),
            ),
            BusType::Starter => match var("DBUS_STARTER_ADDRESS") {
                Some(a) => BusAddress::parse_list(&a),
                None => Err(ErrorKind::InvalidAddress(
                    "no starter bus address in the environment".into()
                ).into_error()),
            },
        }
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }

    /// Open an unauthenticated stream to this address.
    pub fn connect(&self) -> Result<Box<dyn Stream>> {
        debug!("connecting to {}", self);
        match self.transport.as_str() {
            #[cfg(unix)]
            "unix" => {
                if let Some(path) = self.get("path") {
                    let stream = UnixStream::connect(path).map_context(ErrorKind::from_io)?;
                    return Ok(Box::new(stream));
                }
                if let Some(name) = self.get("abstract") {
                    return connect_abstract(self, name);
                }
                Err(invalid(&self.to_string(), "unix address needs path or abstract"))
            }
            "tcp" => {
                let host = self.get("host").unwrap_or("localhost");
                let port = self
                    .get("port")
                    .ok_or_else(|| invalid(&self.to_string(), "tcp address needs a port"))?
                    .parse::<u16>()
                    .map_err(|_| invalid(&self.to_string(), "bad port"))?;
                let stream = TcpStream::connect((host, port)).map_context(ErrorKind::from_io)?;
                stream.set_nodelay(true).map_context(ErrorKind::from_io)?;
                Ok(Box::new(stream))
            }
            _ => Err(invalid(&self.to_string(), "unsupported transport")),
        }
    }

    /// Connect to the first address of `list` that accepts.
    pub fn connect_any(list: &[BusAddress]) -> Result<Box<dyn Stream>> {
        let mut last = None;
        for address in list {
            match address.connect() {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("{} failed: {}", address, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| ErrorKind::InvalidAddress("no address".into()).into_error()))
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(_address: &BusAddress, name: &str) -> Result<Box<dyn Stream>> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes()).map_context(ErrorKind::from_io)?;
    let stream = UnixStream::connect_addr(&addr).map_context(ErrorKind::from_io)?;
    Ok(Box::new(stream))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn connect_abstract(address: &BusAddress, _name: &str) -> Result<Box<dyn Stream>> {
    Err(invalid(
        &address.to_string(),
        "abstract sockets are not supported on this platform",
    ))
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        let mut first = true;
        for (k, v) in &self.params {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={}", k, escape(v))?;
        }
        Ok(())
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BusAddress::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let a = BusAddress::parse("unix:path=/tmp/dbus%2dtest,guid=0123abcd").unwrap();
        assert_eq!(a.transport(), "unix");
        assert_eq!(a.get("path"), Some("/tmp/dbus-test"));
        assert_eq!(a.guid(), Some("0123abcd"));
        assert_eq!(a.to_string(), "unix:guid=0123abcd,path=/tmp/dbus-test");

        assert!(BusAddress::parse("nocolon").is_err());
        assert!(BusAddress::parse("unix:path").is_err());
        assert!(BusAddress::parse("unix:path=%zz").is_err());
        assert!(BusAddress::parse("unix:path=a,path=b").is_err());
    }

    #[test]
    fn test_parse_list() {
        let list = BusAddress::parse_list("unix:abstract=/tmp/x;tcp:host=localhost,port=4000;").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].transport(), "tcp");
        assert_eq!(list[1].get("port"), Some("4000"));
        assert!(BusAddress::parse_list("").is_err());
    }

    #[test]
    fn test_for_bus() {
        let env = |name: &str| match name {
            "XDG_RUNTIME_DIR" => Some("/run/user/1000".to_string()),
            _ => None,
        };
        let session = BusAddress::for_bus_with(BusType::Session, env).unwrap();
        assert_eq!(session[0].get("path"), Some("/run/user/1000/bus"));

        let system = BusAddress::for_bus_with(BusType::System, env).unwrap();
        assert_eq!(system[0].to_string(), SYSTEM_BUS_DEFAULT_ADDRESS);

        let e = BusAddress::for_bus_with(BusType::Starter, env).unwrap_err();
        assert!(matches!(e.kind(), ErrorKind::InvalidAddress(_)));

        let env = |name: &str| match name {
            "DBUS_SESSION_BUS_ADDRESS" => Some("tcp:host=h,port=1".to_string()),
            _ => None,
        };
        let session = BusAddress::for_bus_with(BusType::Session, env).unwrap();
        assert_eq!(session[0].get("host"), Some("h"));
    }

    #[test]
    fn test_unsupported_transport() {
        let a = BusAddress::parse("launchd:env=X").unwrap();
        let e = a.connect().err().unwrap();
        assert!(matches!(e.kind(), ErrorKind::InvalidAddress(_)));
    }
}
