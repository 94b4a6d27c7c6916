use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Escape byte used by [`encode_dataset_id`].
const ESCAPE: u8 = b'%';

/// Name under which a discoverer registers its datasets and its query queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DiscovererIdentity(String);

impl DiscovererIdentity {
    pub fn new(identity: impl Into<String>) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(ModelError::InvalidIdentity(
                "identity must not be empty".into(),
            ));
        }
        if let Some(bad) = identity
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(ModelError::InvalidIdentity(format!(
                "{identity:?} contains {bad:?}"
            )));
        }
        Ok(Self(identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace a local id under this identity.
    pub fn dataset_id(&self, local_id: &str) -> Result<DatasetId> {
        DatasetId::namespaced(self, local_id)
    }
}

impl fmt::Display for DiscovererIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DiscovererIdentity {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DiscovererIdentity> for String {
    fn from(value: DiscovererIdentity) -> Self {
        value.0
    }
}

/// Globally unique dataset id, `"<discoverer-identity>.<local-id>"`.
///
/// Both the identity and the local id may contain dots, so a full id cannot
/// be split back into its parts without knowing the identity; see
/// [`DatasetId::local_id_in`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn namespaced(
        identity: &DiscovererIdentity,
        local_id: &str,
    ) -> Result<Self> {
        if local_id.is_empty() {
            return Err(ModelError::InvalidDatasetId(
                "local id must not be empty".into(),
            ));
        }
        let mut full =
            String::with_capacity(identity.as_str().len() + 1 + local_id.len());
        full.push_str(identity.as_str());
        full.push('.');
        full.push_str(local_id);
        Ok(Self(full))
    }

    /// Namespace a freshly generated local id under `identity`.
    pub fn generate(identity: &DiscovererIdentity) -> Self {
        let local = Uuid::new_v4().simple().to_string();
        Self(format!("{}.{}", identity.as_str(), local))
    }

    /// Wrap an already namespaced id, e.g. one read off the bus.
    pub fn from_full(full: impl Into<String>) -> Result<Self> {
        let full = full.into();
        if full.is_empty() {
            return Err(ModelError::InvalidDatasetId(
                "dataset id must not be empty".into(),
            ));
        }
        Ok(Self(full))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The local part of this id if it belongs to `identity`.
    pub fn local_id_in(&self, identity: &DiscovererIdentity) -> Option<&str> {
        self.0
            .strip_prefix(identity.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|local| !local.is_empty())
    }

    pub fn encoded(&self) -> String {
        encode_dataset_id(&self.0)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DatasetId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_full(value)
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.0
    }
}

impl AsRef<str> for DatasetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_plain(byte: u8, position: usize) -> bool {
    match byte {
        b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' => true,
        // A leading dot would make hidden files or `..` path components.
        b'.' => position > 0,
        _ => false,
    }
}

/// Filesystem- and key-safe bijective encoding of an arbitrary id string.
///
/// Plain bytes are ASCII alphanumerics, `-` and any `.` that is not the first
/// byte; every other byte of the UTF-8 representation becomes `%XX` with
/// upper-case hex digits. The output never contains `_`, `/` or a leading
/// `.`, so `encoded + "_"` is an unambiguous key prefix for one id.
pub fn encode_dataset_id(id: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(id.len() + 8);
    for (position, byte) in id.bytes().enumerate() {
        if is_plain(byte, position) {
            out.push(byte as char);
        } else {
            out.push(ESCAPE as char);
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0f) as usize] as char);
        }
    }
    out
}

/// Inverse of [`encode_dataset_id`]. Rejects anything the encoder would not
/// have produced, so the mapping stays one-to-one.
pub fn decode_dataset_id(encoded: &str) -> Result<String> {
    fn hex_value(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if byte == ESCAPE {
            let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            ) else {
                return Err(ModelError::InvalidEncoding(format!(
                    "truncated escape at byte {i} in {encoded:?}"
                )));
            };
            let decoded = (hi << 4) | lo;
            if is_plain(decoded, out.len()) {
                return Err(ModelError::InvalidEncoding(format!(
                    "needless escape at byte {i} in {encoded:?}"
                )));
            }
            out.push(decoded);
            i += 3;
        } else if is_plain(byte, out.len()) {
            out.push(byte);
            i += 1;
        } else {
            return Err(ModelError::InvalidEncoding(format!(
                "unexpected byte {byte:#04x} at {i} in {encoded:?}"
            )));
        }
    }
    String::from_utf8(out).map_err(|err| {
        ModelError::InvalidEncoding(format!("not UTF-8 once decoded: {err}"))
    })
}
