//! Stack signatures: cheap cache keys for analysed stacks.

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

const MULTIPLIER: u64 = 31;
/// Mixed in between names so `["ab", "c"]` and `["a", "bc"]` differ.
const SEPARATOR: u64 = 0x1f;

/// Rolling polynomial hash of a function-name sequence.
pub fn rolling_hash<'a>(names: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut hash: u64 = 0;
    for name in names {
        for byte in name.bytes() {
            hash = hash.wrapping_mul(MULTIPLIER).wrapping_add(u64::from(byte));
        }
        hash = hash.wrapping_mul(MULTIPLIER).wrapping_add(SEPARATOR);
    }
    hash
}

/// Summary of a stack used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackSignature {
    /// Rolling hash of the function names, innermost first.
    pub hash: u64,
    /// Frame count.
    pub depth: usize,
    /// Frames classified as host code.
    pub user_depth: usize,
    /// Innermost function.
    pub top: Option<String>,
    /// Outermost function.
    pub bottom: Option<String>,
}

impl StackSignature {
    /// Computes the signature of `frames`.
    pub fn of(frames: &[Frame]) -> Self {
        Self {
            hash: rolling_hash(frames.iter().map(|f| f.function.as_str())),
            depth: frames.len(),
            user_depth: frames.iter().filter(|f| f.is_user_code).count(),
            top: frames.first().map(|f| f.function.clone()),
            bottom: frames.last().map(|f| f.function.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_sensitive() {
        assert_ne!(rolling_hash(["a", "b"]), rolling_hash(["b", "a"]));
        assert_ne!(rolling_hash(["ab", "c"]), rolling_hash(["a", "bc"]));
        assert_eq!(rolling_hash(["a", "b"]), rolling_hash(["a", "b"]));
    }

    #[test]
    fn test_hash_wraps_without_panicking() {
        let long: Vec<String> = (0..10_000).map(|i| format!("fn_{i}")).collect();
        let _ = rolling_hash(long.iter().map(String::as_str));
    }

    #[test]
    fn test_signature_fields() {
        let frames = vec![Frame::named("inner"), Frame::named("outer")];
        let sig = StackSignature::of(&frames);
        assert_eq!(sig.depth, 2);
        assert_eq!(sig.top.as_deref(), Some("inner"));
        assert_eq!(sig.bottom.as_deref(), Some("outer"));
        assert_eq!(sig.user_depth, 0);
    }
}
