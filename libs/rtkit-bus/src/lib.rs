//! Remote-call bus contract.
//!
//! The router manager drives external daemons through a remote-call bus it
//! does not implement itself: every call has a target, an interface, a
//! method, typed argument atoms and typed return atoms. This crate defines
//! that contract — the atom model, the request/reply shapes, the closed
//! error taxonomy the manager's retry logic is written against, and the
//! signature database schema files are validated against.
//!
//! Transport implementations live elsewhere; the manager only depends on
//! the [`CallBus`] trait and on the error classification.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::{Ipv4Network, Ipv6Network};

pub mod sigdb;
pub mod testing;

pub use sigdb::SignatureDb;

/// Errors a bus call can produce.
///
/// This taxonomy is closed: callers match on it to decide between resending,
/// surfacing the error, and declaring the target dead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The target is not (yet) resolvable on the bus.
    #[error("resolve failed for target '{target}'")]
    ResolveFailed { target: String },
    /// No reply arrived within the transport's reply window.
    #[error("reply timed out for '{request}'")]
    ReplyTimedOut { request: String },
    /// The send failed in a way that may succeed on retry.
    #[error("transient send failure: {reason}")]
    SendFailedTransient { reason: String },
    /// The send failed permanently; the target is considered gone.
    #[error("send failed: {reason}")]
    SendFailed { reason: String },
    /// The target does not implement the requested method.
    #[error("no such method '{method}' on target '{target}'")]
    NoSuchMethod { target: String, method: String },
    /// The target rejected the argument atoms.
    #[error("bad arguments: {reason}")]
    BadArgs { reason: String },
    /// The target executed the method and reported failure.
    #[error("command failed: {reason}")]
    CommandFailed { reason: String },
    /// No bus is reachable at all.
    #[error("no bus available")]
    NoFinder,
    /// Transport-internal error.
    #[error("internal bus error: {reason}")]
    Internal { reason: String },
}

impl BusError {
    /// Transient errors are worth resending after a short delay.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::ResolveFailed { .. }
                | BusError::ReplyTimedOut { .. }
                | BusError::SendFailedTransient { .. }
        )
    }

    /// Fatal errors mean the target itself is beyond recovery.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::NoFinder | BusError::SendFailed { .. })
    }
}

/// The atom types a call can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AtomType {
    I32,
    U32,
    I64,
    U64,
    Bool,
    Text,
    Ipv4,
    Ipv4Net,
    Ipv6,
    Ipv6Net,
    Mac,
    Url,
    List,
    Binary,
}

impl AtomType {
    /// The wire keyword for this type, as written in call signatures.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            AtomType::I32 => "i32",
            AtomType::U32 => "u32",
            AtomType::I64 => "i64",
            AtomType::U64 => "u64",
            AtomType::Bool => "bool",
            AtomType::Text => "txt",
            AtomType::Ipv4 => "ipv4",
            AtomType::Ipv4Net => "ipv4net",
            AtomType::Ipv6 => "ipv6",
            AtomType::Ipv6Net => "ipv6net",
            AtomType::Mac => "mac",
            AtomType::Url => "url",
            AtomType::List => "list",
            AtomType::Binary => "binary",
        }
    }
}

impl FromStr for AtomType {
    type Err = RequestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i32" => Ok(AtomType::I32),
            "u32" => Ok(AtomType::U32),
            "i64" => Ok(AtomType::I64),
            "u64" => Ok(AtomType::U64),
            "bool" => Ok(AtomType::Bool),
            "txt" => Ok(AtomType::Text),
            "ipv4" => Ok(AtomType::Ipv4),
            "ipv4net" => Ok(AtomType::Ipv4Net),
            "ipv6" => Ok(AtomType::Ipv6),
            "ipv6net" => Ok(AtomType::Ipv6Net),
            "mac" => Ok(AtomType::Mac),
            "url" => Ok(AtomType::Url),
            "list" => Ok(AtomType::List),
            "binary" => Ok(AtomType::Binary),
            other => Err(RequestParseError::UnknownType {
                keyword: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for AtomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = RequestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(RequestParseError::BadValue {
                    value: s.to_owned(),
                    ty: AtomType::Mac,
                });
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| RequestParseError::BadValue {
                    value: s.to_owned(),
                    ty: AtomType::Mac,
                })?;
            count += 1;
        }
        if count != 6 {
            return Err(RequestParseError::BadValue {
                value: s.to_owned(),
                ty: AtomType::Mac,
            });
        }
        Ok(MacAddr(bytes))
    }
}

/// A typed atom value.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Bool(bool),
    Text(String),
    Ipv4(Ipv4Addr),
    Ipv4Net(Ipv4Network),
    Ipv6(Ipv6Addr),
    Ipv6Net(Ipv6Network),
    Mac(MacAddr),
    Url(String),
    List(Vec<AtomValue>),
    Binary(Vec<u8>),
}

impl AtomValue {
    /// Parses a text rendering of a value with the given type.
    ///
    /// # Errors
    /// Returns [`RequestParseError::BadValue`] when `text` is not a valid
    /// rendering of `ty`.
    pub fn parse(ty: AtomType, text: &str) -> Result<Self, RequestParseError> {
        let bad = || RequestParseError::BadValue {
            value: text.to_owned(),
            ty,
        };
        match ty {
            AtomType::I32 => text.parse().map(AtomValue::I32).map_err(|_| bad()),
            AtomType::U32 => text.parse().map(AtomValue::U32).map_err(|_| bad()),
            AtomType::I64 => text.parse().map(AtomValue::I64).map_err(|_| bad()),
            AtomType::U64 => text.parse().map(AtomValue::U64).map_err(|_| bad()),
            AtomType::Bool => match text {
                "true" => Ok(AtomValue::Bool(true)),
                "false" => Ok(AtomValue::Bool(false)),
                _ => Err(bad()),
            },
            AtomType::Text => Ok(AtomValue::Text(text.to_owned())),
            AtomType::Ipv4 => text.parse().map(AtomValue::Ipv4).map_err(|_| bad()),
            AtomType::Ipv4Net => text.parse().map(AtomValue::Ipv4Net).map_err(|_| bad()),
            AtomType::Ipv6 => text.parse().map(AtomValue::Ipv6).map_err(|_| bad()),
            AtomType::Ipv6Net => text.parse().map(AtomValue::Ipv6Net).map_err(|_| bad()),
            AtomType::Mac => text.parse().map(AtomValue::Mac).map_err(|_| bad()),
            AtomType::Url => Ok(AtomValue::Url(text.to_owned())),
            // Lists and binaries have no single-token text form; they only
            // appear in replies built programmatically.
            AtomType::List | AtomType::Binary => Err(bad()),
        }
    }

    /// The type of this value.
    #[must_use]
    pub fn atom_type(&self) -> AtomType {
        match self {
            AtomValue::I32(_) => AtomType::I32,
            AtomValue::U32(_) => AtomType::U32,
            AtomValue::I64(_) => AtomType::I64,
            AtomValue::U64(_) => AtomType::U64,
            AtomValue::Bool(_) => AtomType::Bool,
            AtomValue::Text(_) => AtomType::Text,
            AtomValue::Ipv4(_) => AtomType::Ipv4,
            AtomValue::Ipv4Net(_) => AtomType::Ipv4Net,
            AtomValue::Ipv6(_) => AtomType::Ipv6,
            AtomValue::Ipv6Net(_) => AtomType::Ipv6Net,
            AtomValue::Mac(_) => AtomType::Mac,
            AtomValue::Url(_) => AtomType::Url,
            AtomValue::List(_) => AtomType::List,
            AtomValue::Binary(_) => AtomType::Binary,
        }
    }
}

impl fmt::Display for AtomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomValue::I32(v) => write!(f, "{v}"),
            AtomValue::U32(v) => write!(f, "{v}"),
            AtomValue::I64(v) => write!(f, "{v}"),
            AtomValue::U64(v) => write!(f, "{v}"),
            AtomValue::Bool(v) => write!(f, "{v}"),
            AtomValue::Text(v) | AtomValue::Url(v) => f.write_str(v),
            AtomValue::Ipv4(v) => write!(f, "{v}"),
            AtomValue::Ipv4Net(v) => write!(f, "{v}"),
            AtomValue::Ipv6(v) => write!(f, "{v}"),
            AtomValue::Ipv6Net(v) => write!(f, "{v}"),
            AtomValue::Mac(v) => write!(f, "{v}"),
            AtomValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(","))
            }
            AtomValue::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A named, typed atom.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub name: String,
    pub value: AtomValue,
}

impl Atom {
    #[must_use]
    pub fn new(name: impl Into<String>, value: AtomValue) -> Self {
        Atom {
            name: name.into(),
            value,
        }
    }
}

/// Failure to parse a request, return spec or atom value.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestParseError {
    #[error("malformed request '{request}'")]
    Malformed { request: String },
    #[error("unknown atom type '{keyword}'")]
    UnknownType { keyword: String },
    #[error("'{value}' is not a valid {ty} value")]
    BadValue { value: String, ty: AtomType },
}

/// A fully-expanded call: all variables already substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub target: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<Atom>,
}

impl CallRequest {
    /// Parses `target/interface/method?name:type=value&…`.
    ///
    /// # Errors
    /// Returns [`RequestParseError`] on a malformed request, an unknown atom
    /// type keyword, or a value that does not parse as its declared type.
    pub fn parse(text: &str) -> Result<Self, RequestParseError> {
        let malformed = || RequestParseError::Malformed {
            request: text.to_owned(),
        };
        let (head, query) = match text.split_once('?') {
            Some((h, q)) => (h, Some(q)),
            None => (text, None),
        };
        let mut parts = head.splitn(3, '/');
        let target = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let interface = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let method = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

        let mut args = Vec::new();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            for pair in query.split('&') {
                let (decl, value) = pair.split_once('=').ok_or_else(malformed)?;
                let (name, ty) = decl.split_once(':').ok_or_else(malformed)?;
                if name.is_empty() {
                    return Err(malformed());
                }
                let ty: AtomType = ty.parse()?;
                args.push(Atom::new(name, AtomValue::parse(ty, value)?));
            }
        }
        Ok(CallRequest {
            target: target.to_owned(),
            interface: interface.to_owned(),
            method: method.to_owned(),
            args,
        })
    }

    /// The value-free signature of this request, e.g.
    /// `fea/ifmgr/set_mtu?ifname:txt&mtu:u32`.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut s = format!("{}/{}/{}", self.target, self.interface, self.method);
        for (i, atom) in self.args.iter().enumerate() {
            s.push(if i == 0 { '?' } else { '&' });
            s.push_str(&atom.name);
            s.push(':');
            s.push_str(atom.value.atom_type().keyword());
        }
        s
    }
}

impl fmt::Display for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.target, self.interface, self.method)?;
        for (i, atom) in self.args.iter().enumerate() {
            write!(
                f,
                "{}{}:{}={}",
                if i == 0 { '?' } else { '&' },
                atom.name,
                atom.value.atom_type().keyword(),
                atom.value
            )?;
        }
        Ok(())
    }
}

/// A reply: zero or more named atoms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallReply {
    pub atoms: Vec<Atom>,
}

impl CallReply {
    #[must_use]
    pub fn empty() -> Self {
        CallReply::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: AtomValue) -> Self {
        self.atoms.push(Atom::new(name, value));
        self
    }

    /// Looks up a reply atom by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AtomValue> {
        self.atoms.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    /// Looks up a `u32` atom by name.
    #[must_use]
    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.get(name) {
            Some(AtomValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a text atom by name.
    #[must_use]
    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(AtomValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// One expected reply atom: its name, its type, and optionally the
/// configuration variable it is written back into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnAtom {
    pub name: String,
    pub ty: AtomType,
    pub writeback: Option<String>,
}

/// The declared shape of a reply: `name:type[=$var]&…`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnSpec {
    pub atoms: Vec<ReturnAtom>,
}

impl ReturnSpec {
    /// Parses a return spec. The empty string yields an empty spec.
    ///
    /// # Errors
    /// Returns [`RequestParseError`] on malformed entries or unknown types.
    pub fn parse(text: &str) -> Result<Self, RequestParseError> {
        let mut atoms = Vec::new();
        for entry in text.split('&').filter(|e| !e.is_empty()) {
            let (decl, writeback) = match entry.split_once('=') {
                Some((d, v)) => {
                    let var = v.strip_prefix('$').ok_or_else(|| {
                        RequestParseError::Malformed {
                            request: entry.to_owned(),
                        }
                    })?;
                    (d, Some(var.to_owned()))
                }
                None => (entry, None),
            };
            let (name, ty) =
                decl.split_once(':')
                    .ok_or_else(|| RequestParseError::Malformed {
                        request: entry.to_owned(),
                    })?;
            atoms.push(ReturnAtom {
                name: name.to_owned(),
                ty: ty.parse()?,
                writeback,
            });
        }
        Ok(ReturnSpec { atoms })
    }

    /// Matches a reply against this spec and collects the writeback
    /// variables: `(variable name, rendered value)` pairs.
    ///
    /// # Errors
    /// Returns the name of the first declared atom missing from the reply.
    pub fn collect_writebacks(
        &self,
        reply: &CallReply,
    ) -> Result<BTreeMap<String, String>, String> {
        let mut out = BTreeMap::new();
        for expected in &self.atoms {
            let value = reply.get(&expected.name).ok_or_else(|| expected.name.clone())?;
            if let Some(var) = &expected.writeback {
                out.insert(var.clone(), value.to_string());
            }
        }
        Ok(out)
    }
}

impl fmt::Display for ReturnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{}:{}", atom.name, atom.ty.keyword())?;
            if let Some(var) = &atom.writeback {
                write!(f, "=${var}")?;
            }
        }
        Ok(())
    }
}

/// Resend policy for transient bus errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total send attempts, including the first.
    pub resend_limit: u32,
    /// Delay between attempts.
    pub resend_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            resend_limit: 10,
            resend_interval: Duration::from_millis(1000),
        }
    }
}

/// The transport seam: sends a request to a named target and delivers a
/// typed reply or a classified error.
#[async_trait]
pub trait CallBus: Send + Sync {
    async fn call(&self, request: &CallRequest) -> Result<CallReply, BusError>;
}

/// A bus with no transport behind it. Every call fails with
/// [`BusError::NoFinder`]; useful when the manager runs in verification-only
/// mode.
#[derive(Debug, Default)]
pub struct UnconnectedBus;

#[async_trait]
impl CallBus for UnconnectedBus {
    async fn call(&self, request: &CallRequest) -> Result<CallReply, BusError> {
        tracing::debug!(request = %request, "call on unconnected bus");
        Err(BusError::NoFinder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_with_args() {
        let req =
            CallRequest::parse("fea/ifmgr/set_mtu?ifname:txt=eth0&mtu:u32=1500").unwrap();
        assert_eq!(req.target, "fea");
        assert_eq!(req.interface, "ifmgr");
        assert_eq!(req.method, "set_mtu");
        assert_eq!(req.args.len(), 2);
        assert_eq!(req.args[0].value, AtomValue::Text("eth0".to_owned()));
        assert_eq!(req.args[1].value, AtomValue::U32(1500));
        assert_eq!(req.signature(), "fea/ifmgr/set_mtu?ifname:txt&mtu:u32");
    }

    #[test]
    fn parse_request_without_args() {
        let req = CallRequest::parse("finder/finder/ping").unwrap();
        assert!(req.args.is_empty());
        assert_eq!(req.to_string(), "finder/finder/ping");
    }

    #[test]
    fn parse_request_rejects_garbage() {
        assert!(CallRequest::parse("finder").is_err());
        assert!(CallRequest::parse("a/b/c?noequals:txt").is_err());
        assert!(CallRequest::parse("a/b/c?x:nosuchtype=1").is_err());
        assert!(CallRequest::parse("a/b/c?x:u32=notanumber").is_err());
    }

    #[test]
    fn typed_values_round_trip() {
        for (ty, text) in [
            (AtomType::Ipv4, "192.0.2.1"),
            (AtomType::Ipv4Net, "192.0.2.0/24"),
            (AtomType::Ipv6, "2001:db8::1"),
            (AtomType::Mac, "00:11:22:33:44:55"),
            (AtomType::Bool, "true"),
            (AtomType::I64, "-9000000000"),
        ] {
            let value = AtomValue::parse(ty, text).unwrap();
            assert_eq!(value.atom_type(), ty);
            assert_eq!(value.to_string(), text);
        }
    }

    #[test]
    fn return_spec_collects_writebacks() {
        let spec = ReturnSpec::parse("status:u32=$probe_status&reason:txt").unwrap();
        let reply = CallReply::empty()
            .with("status", AtomValue::U32(3))
            .with("reason", AtomValue::Text(String::new()));
        let vars = spec.collect_writebacks(&reply).unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["probe_status"], "3");
    }

    #[test]
    fn return_spec_reports_missing_atom() {
        let spec = ReturnSpec::parse("status:u32").unwrap();
        let reply = CallReply::empty();
        assert_eq!(spec.collect_writebacks(&reply).unwrap_err(), "status");
    }

    #[test]
    fn error_classification() {
        assert!(BusError::ReplyTimedOut {
            request: String::new()
        }
        .is_transient());
        assert!(BusError::NoFinder.is_fatal());
        let permanent = BusError::CommandFailed {
            reason: "nope".to_owned(),
        };
        assert!(!permanent.is_transient());
        assert!(!permanent.is_fatal());
    }
}
