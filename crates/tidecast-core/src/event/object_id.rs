//! The data store's canonical object identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Length of an object id in bytes.
pub const OBJECT_ID_LEN: usize = 12;

/// A 12-byte object identifier.
///
/// In JSON it uses the extended form `{"$oid": "<24 hex chars>"}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ExtendedOid", into = "ExtendedOid")]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Create an object id from raw bytes.
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of the id.
    pub fn bytes(&self) -> [u8; OBJECT_ID_LEN] {
        self.0
    }

    /// Lowercase hexadecimal text form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidObjectId(s.to_string()))?;
        let bytes: [u8; OBJECT_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidObjectId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtendedOid {
    #[serde(rename = "$oid")]
    oid: String,
}

impl TryFrom<ExtendedOid> for ObjectId {
    type Error = Error;

    fn try_from(value: ExtendedOid) -> Result<Self, Self::Error> {
        value.oid.parse()
    }
}

impl From<ObjectId> for ExtendedOid {
    fn from(id: ObjectId) -> Self {
        Self { oid: id.to_hex() }
    }
}
