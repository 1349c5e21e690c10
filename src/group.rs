//! Group arithmetic and ElGamal, modeled as an external collaborator.
//!
//! Group arithmetic is treated as a low-level primitive supplied
//! externally. `CryptoGroup` is the contractual
//! interface the rest of the crate programs against; `Secp256k1Group` is
//! the one concrete instance shipped here, built directly on `k256`'s
//! projective point and scalar types.

use k256::elliptic_curve::group::GroupEncoding;
use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar as K256Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// A prime-order group with a distinguished generator, as needed by
/// ElGamal encryption and the verifiable shuffle.
pub trait CryptoGroup: Clone + Send + Sync + 'static {
    type Scalar: Copy + Clone + Send + Sync + Serialize + for<'de> Deserialize<'de>;
    type Point: Copy + Clone + PartialEq + Eq + Send + Sync + Serialize + for<'de> Deserialize<'de>;

    fn random_scalar(rng: &mut impl CryptoRngCore) -> Self::Scalar;
    fn generator() -> Self::Point;
    fn identity() -> Self::Point;
    fn mul_generator(s: &Self::Scalar) -> Self::Point;
    fn mul(p: &Self::Point, s: &Self::Scalar) -> Self::Point;
    fn add(a: &Self::Point, b: &Self::Point) -> Self::Point;
    fn negate(p: &Self::Point) -> Self::Point;
    fn add_scalar(a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar;
    fn mul_scalars(a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar;
    fn point_to_bytes(p: &Self::Point) -> Vec<u8>;
    fn point_from_bytes(bytes: &[u8]) -> Option<Self::Point>;
    /// Reduces a wide hash output into a scalar, used to derive
    /// Fiat-Shamir challenges.
    fn scalar_from_wide_bytes(bytes: &[u8; 32]) -> Self::Scalar;
}

/// One ElGamal ciphertext `(c1, c2) = (g^k, pk^k * m)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ciphertext<G: CryptoGroup> {
    pub c1: G::Point,
    pub c2: G::Point,
}

pub fn encrypt<G: CryptoGroup>(
    rng: &mut impl CryptoRngCore,
    pk: &G::Point,
    message: &G::Point,
) -> Ciphertext<G> {
    let k = G::random_scalar(rng);
    let c1 = G::mul_generator(&k);
    let shared = G::mul(pk, &k);
    let c2 = G::add(&shared, message);
    Ciphertext { c1, c2 }
}

/// Partially decrypts one layer under `sk`, i.e. subtracts `c1^sk` from `c2`.
pub fn partial_decrypt<G: CryptoGroup>(ct: &Ciphertext<G>, sk: &G::Scalar) -> G::Point {
    let shared = G::mul(&ct.c1, sk);
    G::add(&ct.c2, &G::negate(&shared))
}

/// Re-encrypts (rerandomizes) a ciphertext under `pk` with fresh randomness
/// `k`, without changing the encrypted message: used by the shuffle step to
/// rebind a ciphertext to a new position without an additional decryption.
pub fn reencrypt<G: CryptoGroup>(ct: &Ciphertext<G>, pk: &G::Point, k: &G::Scalar) -> Ciphertext<G> {
    Ciphertext {
        c1: G::add(&ct.c1, &G::mul_generator(k)),
        c2: G::add(&ct.c2, &G::mul(pk, k)),
    }
}

/// Sum of several public keys, used to derive the cumulative key a client
/// encrypts the outer onion layer under (`pk_i + pk_{i+1} + … + pk_{N-1}`).
pub fn sum_points<G: CryptoGroup>(points: impl IntoIterator<Item = G::Point>) -> G::Point {
    points
        .into_iter()
        .fold(G::identity(), |acc, p| G::add(&acc, &p))
}

/// The reference `CryptoGroup` instance, backed by secp256k1 via `k256`.
#[derive(Debug, Clone, Copy)]
pub struct Secp256k1Group;

impl CryptoGroup for Secp256k1Group {
    type Scalar = K256Scalar;
    type Point = PointBytes;

    fn random_scalar(rng: &mut impl CryptoRngCore) -> Self::Scalar {
        K256Scalar::random(rng)
    }

    fn generator() -> Self::Point {
        PointBytes(ProjectivePoint::GENERATOR)
    }

    fn identity() -> Self::Point {
        PointBytes(ProjectivePoint::IDENTITY)
    }

    fn mul_generator(s: &Self::Scalar) -> Self::Point {
        PointBytes(ProjectivePoint::GENERATOR * s)
    }

    fn mul(p: &Self::Point, s: &Self::Scalar) -> Self::Point {
        PointBytes(p.0 * s)
    }

    fn add(a: &Self::Point, b: &Self::Point) -> Self::Point {
        PointBytes(a.0 + b.0)
    }

    fn negate(p: &Self::Point) -> Self::Point {
        PointBytes(-p.0)
    }

    fn add_scalar(a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar {
        a + b
    }

    fn mul_scalars(a: &Self::Scalar, b: &Self::Scalar) -> Self::Scalar {
        a * b
    }

    fn point_to_bytes(p: &Self::Point) -> Vec<u8> {
        p.0.to_bytes().to_vec()
    }

    fn point_from_bytes(bytes: &[u8]) -> Option<Self::Point> {
        let repr = k256::EncodedPoint::from_bytes(bytes).ok()?;
        Option::from(ProjectivePoint::from_encoded_point(&repr)).map(PointBytes)
    }

    fn scalar_from_wide_bytes(bytes: &[u8; 32]) -> Self::Scalar {
        use k256::elliptic_curve::bigint::U256;
        use k256::elliptic_curve::ops::Reduce;
        K256Scalar::reduce(U256::from_be_slice(bytes))
    }
}

/// Wrapper giving `ProjectivePoint` the `Eq`/serde impls our wire format needs.
#[derive(Debug, Clone, Copy)]
pub struct PointBytes(pub ProjectivePoint);

impl PartialEq for PointBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes() == other.0.to_bytes()
    }
}
impl Eq for PointBytes {}

impl Serialize for PointBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes_slice(&self.0.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PointBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Secp256k1Group::point_from_bytes(&bytes)
            .ok_or_else(|| serde::de::Error::custom("invalid encoded point"))
    }
}

fn serde_bytes_slice<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bytes(bytes)
}
