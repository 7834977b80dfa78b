use crate::canonical::sha256_hex;

pub const PARTITION_TAG_PREFIX: &str = "pmos-";
pub const PARTITION_TAG_HASH_LEN: usize = 18;

/// The engine rejects tag names longer than this; the derived name is
/// 23 characters so it always fits.
pub const ENGINE_TAG_NAME_LIMIT: usize = 24;

/// Deterministic per-workspace partition tag name:
/// `"pmos-" + hex(sha256(workspace_id))[..18]`.
///
/// Truncating to 18 hex characters keeps the name under the engine's
/// 24-character tag limit. Collisions are treated as astronomically
/// unlikely and are an accepted risk: the scheme must not change
/// without a migration of every already-created tag.
pub fn partition_tag(workspace_id: &str) -> String {
    let digest = sha256_hex(workspace_id.as_bytes());
    format!("{}{}", PARTITION_TAG_PREFIX, &digest[..PARTITION_TAG_HASH_LEN])
}

/// Whether `name` has the shape of a partition tag. Used to keep
/// caller-supplied tag lists from smuggling in a foreign partition.
pub fn is_partition_tag(name: &str) -> bool {
    let Some(suffix) = name.strip_prefix(PARTITION_TAG_PREFIX) else {
        return false;
    };
    suffix.len() == PARTITION_TAG_HASH_LEN
        && suffix
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
