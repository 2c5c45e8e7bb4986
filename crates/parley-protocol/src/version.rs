//! Protocol versioning.

/// Current protocol version, carried by the `init` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Check whether a client-announced version can be served.
///
/// There is a single protocol generation so far; anything else is
/// rejected during the handshake.
#[must_use]
pub fn is_supported(version: u8) -> bool {
    version == PROTOCOL_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_support() {
        assert!(is_supported(PROTOCOL_VERSION));
        assert!(!is_supported(0));
        assert!(!is_supported(2));
    }
}
