//! Signature database for remote calls.
//!
//! Schema files declare remote-call actions by template; at schema load time
//! every declared call is checked against the set of signatures the bus is
//! known to carry. The database is a flat text listing, one signature per
//! line, in the same value-free form [`CallRequest::signature`] produces:
//!
//! ```text
//! # interface manager
//! fea/ifmgr/set_mtu?ifname:txt&mtu:u32
//! fea/common/get_status -> status:u32&reason:txt
//! ```
//!
//! Anything after `->` documents return atoms and is not part of the match.

use std::collections::BTreeSet;
use std::path::Path;

use crate::CallRequest;

#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
    #[error("cannot read signature listing {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed signature '{text}'")]
    Malformed {
        path: String,
        line: u32,
        text: String,
    },
}

/// The set of call signatures known to exist on the bus.
#[derive(Debug, Clone, Default)]
pub struct SignatureDb {
    signatures: BTreeSet<String>,
    permissive: bool,
}

impl SignatureDb {
    /// A database that admits every signature. Used when no listing is
    /// available, e.g. in tests or on a development host.
    #[must_use]
    pub fn permissive() -> Self {
        SignatureDb {
            signatures: BTreeSet::new(),
            permissive: true,
        }
    }

    /// Loads every `*.sigs` file in `dir`.
    ///
    /// # Errors
    /// Returns [`SignatureError`] when the directory or a listing cannot be
    /// read, or a line is malformed.
    pub fn load_dir(dir: &Path) -> Result<Self, SignatureError> {
        let mut db = SignatureDb::default();
        let read_err = |source| SignatureError::Read {
            path: dir.display().to_string(),
            source,
        };
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(read_err)?
            .collect::<Result<_, _>>()
            .map_err(read_err)?;
        entries.sort_by_key(std::fs::DirEntry::file_name);
        for entry in entries {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "sigs") {
                let text = std::fs::read_to_string(&path).map_err(|source| {
                    SignatureError::Read {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                db.add_listing(&text, &path.display().to_string())?;
            }
        }
        Ok(db)
    }

    /// Adds the signatures from one listing.
    ///
    /// # Errors
    /// Returns [`SignatureError::Malformed`] for lines that are not
    /// signatures.
    pub fn add_listing(&mut self, text: &str, source_hint: &str) -> Result<(), SignatureError> {
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            // Return atoms after "->" describe the reply; the match key is
            // the request side only.
            let request_side = line.split("->").next().unwrap_or("").trim();
            if request_side.splitn(3, '/').count() != 3 {
                return Err(SignatureError::Malformed {
                    path: source_hint.to_owned(),
                    line: u32::try_from(idx + 1).unwrap_or(u32::MAX),
                    text: raw.to_owned(),
                });
            }
            self.signatures.insert(request_side.to_owned());
        }
        Ok(())
    }

    /// Whether a signature string is known.
    #[must_use]
    pub fn contains(&self, signature: &str) -> bool {
        self.permissive || self.signatures.contains(signature)
    }

    /// Whether a concrete request matches a known signature.
    #[must_use]
    pub fn admits(&self, request: &CallRequest) -> bool {
        self.contains(&request.signature())
    }

    /// Number of known signatures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
