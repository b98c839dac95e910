// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host and group identities.
//!
//! Every satellite carries two deterministic identifiers: one derived from
//! its canonical name (`<Type>.<Instance>`), one from the group name. Both
//! are the MD5 digest of the UTF-8 name laid into a 16-byte UUID, so any
//! process can compute the identifier of a peer it only knows by name.

use std::fmt;

use md5::{Digest, Md5};

use crate::error::SatelliteError;

/// 16-byte identifier derived from a name via MD5.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The all-zero identifier, used for initialisation only.
    pub const NIL: Uuid = Uuid([0u8; 16]);

    /// Derive the identifier for a UTF-8 name.
    pub fn from_name(name: &str) -> Uuid {
        let mut hasher = Md5::new();
        hasher.update(name.as_bytes());
        Uuid(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Uuid {
        Uuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Uuid {
    /// Hyphenated UUID form (8-4-4-4-12).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

/// Validated `<Type>.<Instance>` satellite name.
///
/// `Type` must start with a letter or underscore and continue with
/// alphanumerics/underscores; `Instance` is one or more word characters
/// (letters, digits, underscores).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CanonicalName {
    type_name: String,
    instance: String,
}

impl CanonicalName {
    pub fn new(type_name: &str, instance: &str) -> Result<CanonicalName, SatelliteError> {
        if !valid_type_name(type_name) {
            return Err(SatelliteError::InvalidName(format!(
                "type `{type_name}` must match [A-Za-z_][A-Za-z0-9_]*"
            )));
        }
        if !valid_instance_name(instance) {
            return Err(SatelliteError::InvalidName(format!(
                "instance `{instance}` must match \\w+"
            )));
        }
        Ok(CanonicalName {
            type_name: type_name.to_owned(),
            instance: instance.to_owned(),
        })
    }

    /// Parse a `<Type>.<Instance>` string.
    pub fn parse(canonical: &str) -> Result<CanonicalName, SatelliteError> {
        let (type_name, instance) = canonical.split_once('.').ok_or_else(|| {
            SatelliteError::InvalidName(format!("`{canonical}` is not of the form Type.Instance"))
        })?;
        CanonicalName::new(type_name, instance)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The identifier derived from the canonical name.
    pub fn uuid(&self) -> Uuid {
        Uuid::from_name(&self.to_string())
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.instance)
    }
}

impl fmt::Debug for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalName({})", self)
    }
}

fn valid_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_instance_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Validate a run identifier (`start` payload): word characters and dashes.
pub fn valid_run_identifier(run_id: &str) -> bool {
    !run_id.is_empty() && run_id.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}
