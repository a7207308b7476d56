//! Shared-secret handshake hashing.
//!
//! The login request carries `lowercase(hex(SHA-512(cleartext)))`; servers
//! compare case-insensitively against the hash of their configured secret.

use sha2::{Digest, Sha512};

/// Hash a cleartext password the way the wire expects it.
pub fn hash_password(cleartext: &str) -> String {
    hex::encode(Sha512::digest(cleartext.as_bytes()))
}

/// Check a presented (hashed) password against the configured cleartext.
pub fn verify_password(configured: &str, presented: &str) -> bool {
    hash_password(configured).eq_ignore_ascii_case(presented)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD_SHA512: &str = "b109f3bbbc244eb82441917ed06d618b9008dd09b3befd1b5e07394c706a8bb980b1d7785e5976ec049b46df5f1326af5a2ea6d103fd07c95385ffab0cacbc86";

    #[test]
    fn hashes_to_lowercase_hex_sha512() {
        assert_eq!(hash_password("password"), PASSWORD_SHA512);
    }

    #[test]
    fn comparison_is_case_insensitive() {
        assert!(verify_password("password", PASSWORD_SHA512));
        assert!(verify_password("password", &PASSWORD_SHA512.to_uppercase()));
        assert!(!verify_password("password", &hash_password("hunter2")));
    }
}
