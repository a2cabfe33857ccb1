//! Cache key derivation
//!
//! Storage keys are computed from the request path alone: the MD5 digest of the
//! raw path-and-query bytes as 32 lowercase hex characters, optionally placed
//! under a folder prefix. Paths are not canonicalized, so two spellings of the
//! same logical request are distinct cache entries.

use md5::{Digest, Md5};

/// Length of a derived digest in hex characters
pub const DIGEST_HEX_LEN: usize = 32;

/// Digest a request path into its 32-character hex identity
pub fn derive_key(path: &str) -> String {
    let digest = Md5::digest(path.as_bytes());
    hex::encode(digest)
}

/// Full storage key for a request path under an optional folder prefix
///
/// Leading and trailing slashes on the folder are ignored, so `"thumbs"`,
/// `"/thumbs/"` and `"thumbs/"` all produce `thumbs/<digest>`.
pub fn object_key(folder: &str, path: &str) -> String {
    let digest = derive_key(path);
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        digest
    } else {
        format!("{}/{}", folder, digest)
    }
}
