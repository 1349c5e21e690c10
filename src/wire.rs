//! Wire records exchanged over the RPC surface.

use serde::{Deserialize, Serialize};

use crate::config::{ClientId, ServerId};
use crate::error::Error;
use crate::group::{Ciphertext, CryptoGroup};
use crate::shuffle_proof::ShuffleProof;

/// Encodes a wire record the way a concrete `PeerHandle` transport (gRPC,
/// QUIC, …) would before putting it on the connection.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| Error::Serialization(err.to_string()))
}

/// Decodes a wire record a transport read off the connection.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, Error> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|err| Error::Serialization(err.to_string()))
}

/// A client's onion-encrypted per-server key submission: one ElGamal
/// ciphertext per server, outermost-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct UpKey<G: CryptoGroup> {
    pub client: ClientId,
    pub c1s: Vec<G::Point>,
    pub c2s: Vec<G::Point>,
}

impl<G: CryptoGroup> UpKey<G> {
    pub fn len(&self) -> usize {
        self.c1s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c1s.is_empty()
    }

    pub fn ciphertext_at(&self, layer: usize) -> Ciphertext<G> {
        Ciphertext {
            c1: self.c1s[layer],
            c2: self.c2s[layer],
        }
    }
}

/// A layer of the key shuffle forwarded from server `from` to its successor.
/// `xss`/`yss` are the shuffled *and* partially-decrypted arrays used to
/// continue the protocol, one row per still-outstanding layer; `ybarss` is
/// the shuffled-but-not-yet-decrypted Y row, kept only so the receiver can
/// verify `proof` against the re-encryption step in isolation from `from`'s
/// own (unverifiable by construction) decryption share.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct InternalKey<G: CryptoGroup> {
    pub from: ServerId,
    pub xss: Vec<Vec<G::Point>>,
    pub yss: Vec<Vec<G::Point>>,
    pub ybarss: Vec<Vec<G::Point>>,
    pub proofs: Vec<ShuffleProof<G>>,
}

/// The pre-shuffle inputs `from` claims to have received, broadcast to
/// every other server so the next hop's receiver can verify `from`'s
/// shuffle proof independently of what `from` later forwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AuxKeyProof<G: CryptoGroup> {
    pub from: ServerId,
    pub xs: Vec<Vec<G::Point>>,
    pub ys: Vec<Vec<G::Point>>,
}

/// A shuffled request hash. `id` is populated only while in flight between
/// a client's submission and the gather stage; it is cleared before the
/// array is shuffled, so the shuffled order carries no client identity.
/// `hash` is onion-sealed by the client across every hop (see
/// [`crate::cipher::seal_onion`]) and shrinks by one authenticated layer
/// each time a hop's `shuffle_and_peel` opens it, landing on the plaintext
/// hash once the last hop has peeled it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub hash: Vec<u8>,
    pub round: u64,
    pub id: u32,
}

/// An uploaded block, same onion-sealed lifecycle as `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub payload: Vec<u8>,
    pub round: u64,
    pub id: u32,
}

/// A routing envelope for one server's masked-XOR PIR contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientBlock {
    pub client: ClientId,
    pub from: ServerId,
    pub round: u64,
    pub payload: Vec<u8>,
}

/// A client's registration record, propagated to every server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client: ClientId,
    pub home: ServerId,
}

/// A client's half of a mask/secret Diffie-Hellman key agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ClientDh<G: CryptoGroup> {
    pub client: ClientId,
    pub public: G::Point,
}

/// A client's download request for one round: which slot to retrieve,
/// expressed as a server-wide mask rather than a bare index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMask {
    pub client: ClientId,
    pub round: u64,
    pub mask: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrips_a_request() {
        let request = Request {
            hash: vec![1, 2, 3, 4],
            round: 7,
            id: 0,
        };
        let bytes = encode(&request).unwrap();
        let decoded: Request = decode(&bytes).unwrap();
        assert_eq!(decoded.hash, request.hash);
        assert_eq!(decoded.round, request.round);
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        let request = Request {
            hash: vec![1, 2, 3, 4],
            round: 7,
            id: 0,
        };
        let mut bytes = encode(&request).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(decode::<Request>(&bytes).is_err());
    }
}
