//! Content fingerprinting with blake3.
//!
//! Build tools occasionally report a module change hash that moved while
//! the emitted source did not. An independent fingerprint of the source
//! text is the tiebreaker for those false positives.

use std::fmt;

/// A 256-bit content fingerprint (blake3 output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create from raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fingerprint of one module's emitted source text.
    pub fn of(source: &str) -> Self {
        Self(*blake3::hash(source.as_bytes()).as_bytes())
    }

    /// Convert to hex string for serialization.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 16 hex chars for brevity
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_source_same_fingerprint() {
        assert_eq!(ContentHash::of("export default 1;"), ContentHash::of("export default 1;"));
    }

    #[test]
    fn test_changed_source_changes_fingerprint() {
        assert_ne!(ContentHash::of("export default 1;"), ContentHash::of("export default 2;"));
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = ContentHash::of("module body");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentHash::from_hex("not hex").is_none());
        assert!(ContentHash::from_hex("abcd").is_none());
    }

    #[test]
    fn test_display_shows_prefix() {
        let hash = ContentHash::new([0xab; 32]);
        assert_eq!(format!("{hash}"), "abababababababab");
    }
}
