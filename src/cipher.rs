//! Authenticated symmetric encryption, modeled as an external collaborator,
//! plus the round-derived nonce format used for shuffle-stage opens.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::group::CryptoGroup;

/// Width of a shuffle-open nonce: 24 bytes, matching XChaCha20Poly1305.
pub const NONCE_LEN: usize = 24;

/// Seal/open over a fixed-size symmetric key and nonce.
pub trait AuthCipher: Send + Sync {
    fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8>;
    fn open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}

/// The reference `AuthCipher`, backed by XChaCha20Poly1305.
pub struct XChaChaCipher;

impl AuthCipher for XChaChaCipher {
    fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .expect("encryption over an in-memory buffer cannot fail")
    }

    fn open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| crate::error::Error::CryptoOpen(crate::config::ClientId(0)))
    }
}

/// Derives a fixed-width symmetric key from a key-shuffle output point: the
/// key-shuffle engine hands back marshalled group points, but the shuffle's
/// authenticated-decryption step needs a 32-byte key.
pub fn symmetric_key_from_point<G: CryptoGroup>(point: &G::Point) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(G::point_to_bytes(point));
    hasher.finalize().into()
}

/// Builds the 24-byte per-round nonce: the unsigned-varint encoding of
/// `round`, zero-padded to `NONCE_LEN`.
pub fn nonce_for_round(round: u64) -> [u8; NONCE_LEN] {
    let mut buf = [0u8; NONCE_LEN];
    let mut varint_buf = unsigned_varint::encode::u64_buffer();
    let encoded = unsigned_varint::encode::u64(round, &mut varint_buf);
    buf[..encoded.len()].copy_from_slice(encoded);
    buf
}

/// Onion-seals a request hash or upload block for an `N`-hop shuffle chain:
/// `per_hop_keys[i]` must be this client's own symmetric key for hop `i`
/// (`symmetric_key_from_point` over the per-server point the client chose
/// for server `i` in its [`crate::wire::UpKey`] submission), in hop order
/// `0..N-1`. The result is wrapped innermost-first so hop `0` peels the
/// outermost layer and hop `N-1` peels the last, landing on plaintext.
pub fn seal_onion(per_hop_keys: &[[u8; 32]], round: u64, plaintext: &[u8]) -> Vec<u8> {
    let nonce = nonce_for_round(round);
    let mut ciphertext = plaintext.to_vec();
    for key in per_hop_keys.iter().rev() {
        ciphertext = XChaChaCipher::seal(key, &nonce, &ciphertext);
    }
    ciphertext
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let nonce = nonce_for_round(42);
        let plaintext = b"a request hash or a block payload";

        let sealed = XChaChaCipher::seal(&key, &nonce, plaintext);
        let opened = XChaChaCipher::open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_fails_on_tampered_ciphertext() {
        let key = [1u8; 32];
        let nonce = nonce_for_round(0);
        let mut sealed = XChaChaCipher::seal(&key, &nonce, b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(XChaChaCipher::open(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn nonce_crosses_varint_length_boundary() {
        // 127 encodes in 1 byte, 128 requires 2: exercise both sides of the boundary.
        let n127 = nonce_for_round(127);
        let n128 = nonce_for_round(128);
        assert_eq!(n127[1], 0);
        assert_ne!(n128[1], 0);
    }

    #[test]
    fn nonce_deterministic_per_round() {
        assert_eq!(nonce_for_round(9), nonce_for_round(9));
        assert_ne!(nonce_for_round(9), nonce_for_round(10));
    }

    #[test]
    fn seal_onion_peels_one_layer_per_hop_in_order() {
        let keys = [[1u8; 32], [2u8; 32], [3u8; 32]];
        let plaintext = b"a round's request hash";
        let sealed = seal_onion(&keys, 9, plaintext);
        let nonce = nonce_for_round(9);

        let after_hop0 = XChaChaCipher::open(&keys[0], &nonce, &sealed).unwrap();
        assert_ne!(after_hop0, plaintext, "two more layers remain after hop 0");
        let after_hop1 = XChaChaCipher::open(&keys[1], &nonce, &after_hop0).unwrap();
        assert_ne!(after_hop1, plaintext, "one more layer remains after hop 1");
        let after_hop2 = XChaChaCipher::open(&keys[2], &nonce, &after_hop1).unwrap();
        assert_eq!(after_hop2, plaintext, "the last hop reveals the plaintext");
    }

    #[test]
    fn symmetric_key_derivation_is_deterministic_and_position_sensitive() {
        use crate::group::Secp256k1Group as S;
        use rand_core::SeedableRng;
        let a = S::mul_generator(&S::random_scalar(&mut rand_chacha::ChaCha20Rng::seed_from_u64(1)));
        let b = S::mul_generator(&S::random_scalar(&mut rand_chacha::ChaCha20Rng::seed_from_u64(2)));
        assert_eq!(
            symmetric_key_from_point::<S>(&a),
            symmetric_key_from_point::<S>(&a)
        );
        assert_ne!(
            symmetric_key_from_point::<S>(&a),
            symmetric_key_from_point::<S>(&b)
        );
    }
}
