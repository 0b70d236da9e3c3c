//! Typed values of schema leaves.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{Ipv4Network, Ipv6Network};
use rtkit_bus::MacAddr;

/// The type a schema node declares for its values.
///
/// `Void` is a container with no value of its own; `Choice` admits exactly
/// the values listed in the node's `%allow` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Void,
    Bool,
    I32,
    U32,
    I64,
    U64,
    Text,
    Ipv4,
    Ipv4Net,
    Ipv6,
    Ipv6Net,
    Mac,
    Url,
    Choice,
}

impl ValueType {
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::Bool => "bool",
            ValueType::I32 => "i32",
            ValueType::U32 => "u32",
            ValueType::I64 => "i64",
            ValueType::U64 => "u64",
            ValueType::Text => "txt",
            ValueType::Ipv4 => "ipv4",
            ValueType::Ipv4Net => "ipv4net",
            ValueType::Ipv6 => "ipv6",
            ValueType::Ipv6Net => "ipv6net",
            ValueType::Mac => "mac",
            ValueType::Url => "url",
            ValueType::Choice => "choice",
        }
    }

    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "void" => ValueType::Void,
            "bool" => ValueType::Bool,
            "i32" => ValueType::I32,
            "u32" => ValueType::U32,
            "i64" => ValueType::I64,
            "u64" => ValueType::U64,
            "txt" => ValueType::Text,
            "ipv4" => ValueType::Ipv4,
            "ipv4net" => ValueType::Ipv4Net,
            "ipv6" => ValueType::Ipv6,
            "ipv6net" => ValueType::Ipv6Net,
            "mac" => ValueType::Mac,
            "url" => ValueType::Url,
            "choice" => ValueType::Choice,
            _ => return None,
        })
    }

    /// Whether values of this type participate in `%allow-range` checks.
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueType::I32 | ValueType::U32 | ValueType::I64 | ValueType::U64
        )
    }

    /// Checks that `text` is a well-formed value of this type.
    ///
    /// # Errors
    /// Returns a human-readable reason when the value does not parse.
    pub fn check(self, text: &str) -> Result<(), String> {
        fn ck<T: FromStr>(text: &str, what: &str) -> Result<(), String> {
            text.parse::<T>()
                .map(|_| ())
                .map_err(|_| format!("'{text}' is not a valid {what}"))
        }
        match self {
            ValueType::Void => Err("container nodes carry no value".to_owned()),
            ValueType::Bool => match text {
                "true" | "false" => Ok(()),
                _ => Err(format!("'{text}' is not a valid bool")),
            },
            ValueType::I32 => ck::<i32>(text, "i32"),
            ValueType::U32 => ck::<u32>(text, "u32"),
            ValueType::I64 => ck::<i64>(text, "i64"),
            ValueType::U64 => ck::<u64>(text, "u64"),
            // Free-form; choice membership is enforced by the allow set.
            ValueType::Text | ValueType::Url | ValueType::Choice => Ok(()),
            ValueType::Ipv4 => ck::<Ipv4Addr>(text, "IPv4 address"),
            ValueType::Ipv4Net => ck::<Ipv4Network>(text, "IPv4 prefix"),
            ValueType::Ipv6 => ck::<Ipv6Addr>(text, "IPv6 address"),
            ValueType::Ipv6Net => ck::<Ipv6Network>(text, "IPv6 prefix"),
            ValueType::Mac => ck::<MacAddr>(text, "MAC address"),
        }
    }

    /// Parses an integer value for range checking.
    #[must_use]
    pub fn as_integer(self, text: &str) -> Option<i64> {
        if self.is_integer() {
            text.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_round_trip() {
        for ty in [
            ValueType::Void,
            ValueType::Bool,
            ValueType::I32,
            ValueType::U32,
            ValueType::I64,
            ValueType::U64,
            ValueType::Text,
            ValueType::Ipv4,
            ValueType::Ipv4Net,
            ValueType::Ipv6,
            ValueType::Ipv6Net,
            ValueType::Mac,
            ValueType::Url,
            ValueType::Choice,
        ] {
            assert_eq!(ValueType::from_keyword(ty.keyword()), Some(ty));
        }
        assert_eq!(ValueType::from_keyword("float"), None);
    }

    #[test]
    fn check_accepts_well_formed_values() {
        assert!(ValueType::U32.check("1500").is_ok());
        assert!(ValueType::Ipv4.check("192.0.2.1").is_ok());
        assert!(ValueType::Ipv6Net.check("2001:db8::/32").is_ok());
        assert!(ValueType::Mac.check("00:11:22:33:44:55").is_ok());
        assert!(ValueType::Bool.check("true").is_ok());
        assert!(ValueType::Text.check("anything at all").is_ok());
    }

    #[test]
    fn check_rejects_malformed_values() {
        assert!(ValueType::U32.check("-1").is_err());
        assert!(ValueType::Ipv4.check("192.0.2.299").is_err());
        assert!(ValueType::Bool.check("yes").is_err());
        assert!(ValueType::Void.check("x").is_err());
    }

    #[test]
    fn integer_extraction() {
        assert_eq!(ValueType::U32.as_integer("255"), Some(255));
        assert_eq!(ValueType::Text.as_integer("255"), None);
    }
}
