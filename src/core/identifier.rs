//! Fixed-size 16-byte identifier used as an opaque correlation id.
//!
//! Ordering is plain byte comparison; the text form is lowercase hex in the
//! `8-4-4-4-12` hyphenated layout.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Opaque 16-byte identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Identifier([u8; 16]);

impl Identifier {
    /// Length of the identifier on the wire
    pub const LEN: usize = 16;

    /// The all-zero identifier
    pub const NIL: Identifier = Identifier([0u8; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a random identifier
    pub fn new_random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl FromStr for Identifier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        // accept only the canonical hyphenated form
        if s.len() != 36 {
            return Err(ProtocolError::InvalidValue(format!(
                "identifier must be 36 characters, got {}",
                s.len()
            )));
        }
        Uuid::try_parse(s)
            .map(|uuid| Self(*uuid.as_bytes()))
            .map_err(|e| ProtocolError::InvalidValue(format!("invalid identifier '{s}': {e}")))
    }
}

impl From<[u8; 16]> for Identifier {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}
