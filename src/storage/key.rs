//! Deterministic object-key layout.
//!
//! Block objects live at `blocks/<hh>/<hh>/<uid-text>` where the two
//! `<hh>` components are the first four hex characters of the md5 of the
//! uid text. The hashed prefix spreads objects uniformly across directory
//! shards and S3 partitions regardless of uid distribution. Version
//! metadata documents use the same scheme under `versions/`.

use crate::error::{Result, VaultError};

pub const BLOCKS_PREFIX: &str = "blocks/";
pub const VERSIONS_PREFIX: &str = "versions/";

/// Suffix of the sidecar object carrying a data object's metadata.
pub const META_SUFFIX: &str = ".meta";

/// `prefix + md5(key)[0:2] + "/" + md5(key)[2:4] + "/" + key`
pub fn object_path(prefix: &str, key: &str) -> String {
    let digest = format!("{:x}", md5::compute(key.as_bytes()));
    format!("{}{}/{}/{}", prefix, &digest[0..2], &digest[2..4], key)
}

/// Invert [`object_path`], validating prefix and shard length.
pub fn key_from_path(prefix: &str, path: &str) -> Result<String> {
    let rest = path.strip_prefix(prefix).ok_or_else(|| {
        VaultError::Storage(format!(
            "Invalid key name {path}, it doesn't start with \"{prefix}\"."
        ))
    })?;
    // Two 2-character shards plus their separators.
    if rest.len() <= 6 {
        return Err(VaultError::Storage(format!(
            "Key {path} has an invalid length."
        )));
    }
    Ok(rest[6..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trips() {
        let key = "0000002a-00000000000004d2";
        let path = object_path(BLOCKS_PREFIX, key);
        assert!(path.starts_with(BLOCKS_PREFIX));
        assert_eq!(key_from_path(BLOCKS_PREFIX, &path).unwrap(), key);
    }

    #[test]
    fn sharding_is_stable() {
        // md5("abc") = 900150983cd24fb0...
        assert_eq!(object_path("blocks/", "abc"), "blocks/90/01/abc");
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let path = object_path(BLOCKS_PREFIX, "some-key");
        assert!(key_from_path(VERSIONS_PREFIX, &path).is_err());
    }
}
