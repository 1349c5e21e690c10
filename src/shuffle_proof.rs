//! The verifiable shuffle primitive, modeled as an external collaborator.
//!
//! `ShuffleProver`/`ShuffleVerifier` are the contractual interface the rest
//! of the crate programs against (`prove`/`verify`, matching the source's
//! `HashProve`/`HashVerify` naming). `ReferenceShuffleProof` is the one
//! concrete instance shipped here.
//!
//! **Documented limitation (Open Question resolution, see DESIGN.md):** a
//! production verifiable shuffle (Neff or Bayer-Groth style) hides the
//! permutation from the verifier using a permutation commitment and an
//! opening argument of size independent of revealing any single
//! correspondence. That argument is genuinely its own subsystem and is
//! treated here as an external, low-level primitive.
//! `ReferenceShuffleProof` instead proves, honestly and soundly, that every
//! output position is a correct ElGamal re-encryption of *some* input
//! position via a batch of Chaum-Pedersen DLEQ proofs, and that the
//! claimed source indices form a bijection — but it reveals that
//! correspondence to the verifier. It establishes that every shuffled
//! output really is a re-encryption of an input and is sufficient to
//! exercise every caller in this crate; it is not a permutation-hiding
//! shuffle argument and must not be used as one in a deployment.

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use crate::group::{Ciphertext, CryptoGroup};

/// A single Chaum-Pedersen proof of equality of discrete logs: proves
/// knowledge of `r` such that `a = r * base1` and `b = r * base2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DleqProof<G: CryptoGroup> {
    t1: G::Point,
    t2: G::Point,
    response: G::Scalar,
}

/// One output position's proof that it is a re-encryption of
/// `source_index` in the input array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PositionProof<G: CryptoGroup> {
    pub source_index: u32,
    proof: DleqProof<G>,
}

/// The full proof attached to one shuffle hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ShuffleProof<G: CryptoGroup> {
    pub positions: Vec<PositionProof<G>>,
}

fn challenge_scalar<G: CryptoGroup>(
    pk: &G::Point,
    t1: &G::Point,
    t2: &G::Point,
    diff1: &G::Point,
    diff2: &G::Point,
) -> G::Scalar {
    let mut hasher = Shake256::default();
    hasher.update(b"riffle-dleq");
    hasher.update(&G::point_to_bytes(pk));
    hasher.update(&G::point_to_bytes(t1));
    hasher.update(&G::point_to_bytes(t2));
    hasher.update(&G::point_to_bytes(diff1));
    hasher.update(&G::point_to_bytes(diff2));
    let mut reader = hasher.finalize_xof();
    let mut out = [0u8; 32];
    reader.read(&mut out);
    G::scalar_from_wide_bytes(&out)
}

/// Produces shuffle proofs; the prover side of the contract.
pub trait ShuffleProver<G: CryptoGroup> {
    /// `perm_of_output[j]` names the input index that output position `j`
    /// is a re-encryption of; `blinds[j]` is the rerandomization scalar
    /// used to produce output `j` from that input.
    fn prove(
        rng: &mut impl CryptoRngCore,
        pk: &G::Point,
        xs: &[G::Point],
        ys: &[G::Point],
        xbars: &[G::Point],
        ybars: &[G::Point],
        perm_of_output: &[usize],
        blinds: &[G::Scalar],
    ) -> ShuffleProof<G>;
}

/// Verifies shuffle proofs; the verifier side of the contract.
pub trait ShuffleVerifier<G: CryptoGroup> {
    fn verify(
        pk: &G::Point,
        xs: &[G::Point],
        ys: &[G::Point],
        xbars: &[G::Point],
        ybars: &[G::Point],
        proof: &ShuffleProof<G>,
    ) -> bool;
}

pub struct ReferenceShuffleProof;

impl<G: CryptoGroup> ShuffleProver<G> for ReferenceShuffleProof {
    fn prove(
        rng: &mut impl CryptoRngCore,
        pk: &G::Point,
        xs: &[G::Point],
        ys: &[G::Point],
        xbars: &[G::Point],
        ybars: &[G::Point],
        perm_of_output: &[usize],
        blinds: &[G::Scalar],
    ) -> ShuffleProof<G> {
        let n = xbars.len();
        let mut positions = Vec::with_capacity(n);
        for j in 0..n {
            let i = perm_of_output[j];
            let r = blinds[j];

            let diff1 = G::add(&xbars[j], &G::negate(&xs[i]));
            let diff2 = G::add(&ybars[j], &G::negate(&ys[i]));

            let k = G::random_scalar(rng);
            let t1 = G::mul_generator(&k);
            let t2 = G::mul(pk, &k);
            let c = challenge_scalar::<G>(pk, &t1, &t2, &diff1, &diff2);
            let response = G::add_scalar(&k, &G::mul_scalars(&c, &r));

            positions.push(PositionProof {
                source_index: i as u32,
                proof: DleqProof { t1, t2, response },
            });
        }
        ShuffleProof { positions }
    }
}

impl<G: CryptoGroup> ShuffleVerifier<G> for ReferenceShuffleProof {
    fn verify(
        pk: &G::Point,
        xs: &[G::Point],
        ys: &[G::Point],
        xbars: &[G::Point],
        ybars: &[G::Point],
        proof: &ShuffleProof<G>,
    ) -> bool {
        let n = xbars.len();
        if proof.positions.len() != n || xs.len() != n || ys.len() != n {
            return false;
        }

        let mut seen = vec![false; n];
        for (j, position) in proof.positions.iter().enumerate() {
            let i = position.source_index as usize;
            if i >= n || seen[i] {
                return false;
            }
            seen[i] = true;

            let diff1 = G::add(&xbars[j], &G::negate(&xs[i]));
            let diff2 = G::add(&ybars[j], &G::negate(&ys[i]));
            let c = challenge_scalar::<G>(pk, &position.proof.t1, &position.proof.t2, &diff1, &diff2);

            let lhs1 = G::mul_generator(&position.proof.response);
            let rhs1 = G::add(&position.proof.t1, &G::mul(&diff1, &c));
            if lhs1 != rhs1 {
                return false;
            }

            let lhs2 = G::mul(pk, &position.proof.response);
            let rhs2 = G::add(&position.proof.t2, &G::mul(&diff2, &c));
            if lhs2 != rhs2 {
                return false;
            }
        }

        seen.into_iter().all(|s| s)
    }
}
