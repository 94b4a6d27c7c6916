use datamart_model::DatasetId;
use sha2::{Digest, Sha256};

/// Longest encoded id used verbatim as a path component.
pub const MAX_PLAIN_NAME_LEN: usize = 112;

const HASHED_STEM_LEN: usize = 40;
const HASH_MARKER: char = '~';

/// On-disk name of a dataset, shared by permanent storage directories and
/// cache keys.
///
/// Ids whose encoding fits [`MAX_PLAIN_NAME_LEN`] keep it unchanged. Longer
/// ones become `<first 40 bytes of the encoding>~<sha256 of the full id>`,
/// which is shorter than the plain limit.
/// The encoding never emits `~` or `_`, so hashed names cannot collide with
/// plain ones and `name + "_"` stays a prefix owned by one dataset.
pub fn dataset_name(id: &DatasetId) -> String {
    let encoded = id.encoded();
    if encoded.len() <= MAX_PLAIN_NAME_LEN {
        return encoded;
    }
    // The encoding is ASCII, so any byte offset is a char boundary.
    let stem = encoded.get(..HASHED_STEM_LEN).unwrap_or(&encoded);
    let digest = Sha256::digest(id.as_str().as_bytes());
    format!("{stem}{HASH_MARKER}{}", hex::encode(digest))
}
