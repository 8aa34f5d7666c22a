//! Memorable tunnel subdomains of the form `adjective-noun-hex8`.
//!
//! Validation is the anti-enumeration boundary: nothing outside this exact
//! shape is admitted into the registry or served by the gateway.

use n0_error::{Result, StdResultExt};
use rand::RngCore;
use rand::rngs::OsRng;

static ADJECTIVES: [&str; 32] = [
    "happy", "sunny", "swift", "calm", "bold", "bright", "cool", "warm",
    "quick", "clever", "brave", "gentle", "kind", "proud", "wise", "keen",
    "fresh", "crisp", "pure", "clear", "wild", "free", "silent", "quiet",
    "golden", "silver", "coral", "amber", "jade", "ruby", "pearl", "onyx",
];

static NOUNS: [&str; 32] = [
    "tiger", "eagle", "wolf", "bear", "hawk", "fox", "deer", "owl",
    "river", "mountain", "forest", "ocean", "meadow", "valley", "canyon", "island",
    "star", "moon", "cloud", "storm", "wind", "flame", "wave", "stone",
    "maple", "cedar", "pine", "oak", "willow", "birch", "aspen", "elm",
];

const HEX_SUFFIX_LEN: usize = 8;

/// Draws a random subdomain from a cryptographic source.
///
/// One byte each indexes the adjective and noun lists, four bytes become the
/// lower-hex suffix. Uniqueness against live tunnels is the registry's job.
pub fn generate() -> Result<String> {
    let mut buf = [0u8; 6];
    OsRng
        .try_fill_bytes(&mut buf)
        .std_context("failed to generate random bytes")?;

    let adjective = ADJECTIVES[buf[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[buf[1] as usize % NOUNS.len()];
    let suffix: String = buf[2..].iter().map(|b| format!("{b:02x}")).collect();

    Ok(format!("{adjective}-{noun}-{suffix}"))
}

/// Accepts only the exact minted shape: whitelisted adjective, whitelisted
/// noun, and exactly eight lowercase hex characters.
pub fn is_valid(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    let [adjective, noun, suffix] = parts.as_slice() else {
        return false;
    };
    ADJECTIVES.contains(adjective) && NOUNS.contains(noun) && is_lowercase_hex(suffix)
}

fn is_lowercase_hex(s: &str) -> bool {
    s.len() == HEX_SUFFIX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_subdomains_are_valid() {
        for _ in 0..100 {
            let sub = generate().unwrap();
            assert!(is_valid(&sub), "minted subdomain failed validation: {sub}");
        }
    }

    #[test]
    fn accepts_canonical_form() {
        assert!(is_valid("happy-tiger-abcdef01"));
        assert!(is_valid("onyx-elm-00000000"));
    }

    #[test]
    fn rejects_malformed_subdomains() {
        // wrong part count
        assert!(!is_valid("happy-tiger"));
        assert!(!is_valid("happy-tiger-abcdef01-80"));
        assert!(!is_valid(""));
        // words outside the whitelists
        assert!(!is_valid("evil-tiger-abcdef01"));
        assert!(!is_valid("happy-shark-abcdef01"));
        // bad hex suffix
        assert!(!is_valid("happy-tiger-abcdef0"));
        assert!(!is_valid("happy-tiger-abcdef012"));
        assert!(!is_valid("happy-tiger-ABCDEF01"));
        assert!(!is_valid("happy-tiger-abcdefgh"));
    }
}
