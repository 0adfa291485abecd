//! Cache key codec.
//!
//! The cache-item protocol forbids a fixed set of characters in keys and tags.
//! Application keys are mapped into the safe alphabet by replacing every
//! reserved character with [`PLACEHOLDER`]. The mapping is lossy: `"a:b"` and
//! `"a/b"` both encode to `"a.b"` and share a slot in the remote store.
//!
//! Tags are *not* encoded. A tag containing a reserved character is rejected
//! by [`validate_tag`], because silently merging two tag cohorts would make
//! invalidation delete more than the caller asked for.

use crate::error::{IdentifierKind, LarderResult, ValidationError};

/// Characters the cache-item protocol refuses in keys and tags.
pub const RESERVED_CHARACTERS: [char; 8] = ['{', '}', '(', ')', '/', '\\', '@', ':'];

/// Replacement for a reserved character.
pub const PLACEHOLDER: char = '.';

/// Check whether a character is in the reserved set.
pub fn is_reserved(c: char) -> bool {
    RESERVED_CHARACTERS.contains(&c)
}

/// Encode a raw application key for the backing protocol.
///
/// Pure and total. Apply it exactly once, at the boundary between the cache
/// store and the remote store.
pub fn encode_key(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_reserved(c) { PLACEHOLDER } else { c })
        .collect()
}

/// Validate an already-encoded key.
///
/// Remote stores call this on every key they receive. An encoded key can only
/// fail by being empty.
pub fn validate_key(key: &str) -> LarderResult<()> {
    validate_identifier(key, IdentifierKind::Key)
}

/// Validate a tag name.
pub fn validate_tag(tag: &str) -> LarderResult<()> {
    validate_identifier(tag, IdentifierKind::Tag)
}

fn validate_identifier(value: &str, kind: IdentifierKind) -> LarderResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Empty { kind }.into());
    }
    if let Some(character) = value.chars().find(|c| is_reserved(*c)) {
        return Err(ValidationError::ReservedCharacter {
            kind,
            value: value.to_string(),
            character,
        }
        .into());
    }
    Ok(())
}
