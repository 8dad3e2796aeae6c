//! Hashing and the Pedersen amount commitment over secp256k1.
//!
//! A commitment is `C = blind*G + value*H` where `H` is the nothing-up-my-sleeve
//! generator lifted from the BIP341 NUMS x-coordinate. Commitments are encoded
//! as 33-byte compressed points and blinding factors as 32-byte big-endian
//! scalars.

use blake3::Hasher;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, WalletError};

pub const COMMITMENT_LEN: usize = 33;
pub const BLIND_LEN: usize = 32;

/// 33-byte compressed public key, used for anonymous output keys.
pub type CompressedPubKey = [u8; 33];

const NUMS_H_X: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

static GENERATOR_H: Lazy<ProjectivePoint> = Lazy::new(|| {
    let mut x = NUMS_H_X;
    loop {
        if let Some(point) = lift_x(&x) {
            return point;
        }
        x = blake3_hash(&x);
    }
});

fn lift_x(x: &[u8; 32]) -> Option<ProjectivePoint> {
    let mut encoded = [0u8; COMMITMENT_LEN];
    encoded[0] = 0x02;
    encoded[1..].copy_from_slice(x);
    let point = EncodedPoint::from_bytes(encoded).ok()?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&point)).map(ProjectivePoint::from)
}

/// Hashes arbitrary data with a domain-specific key for internal consistency.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *Hasher::new_derive_key("ctwallet-v1").update(data).finalize().as_bytes()
}

/// Secret scalar hiding a committed value.
///
/// Debug output is redacted so blinds never reach the logs.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct BlindingFactor([u8; BLIND_LEN]);

impl std::fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlindingFactor([REDACTED])")
    }
}

impl BlindingFactor {
    /// The blind of a plain (unblinded) amount.
    pub fn zero() -> Self {
        BlindingFactor([0u8; BLIND_LEN])
    }

    /// Accepts any canonical scalar, zero included.
    pub fn from_bytes(bytes: [u8; BLIND_LEN]) -> Result<Self> {
        scalar_from_bytes(&bytes)?;
        Ok(BlindingFactor(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; BLIND_LEN] = bytes.try_into().map_err(|_| {
            WalletError::Validation(format!("blinding factor must be {} bytes, got {}", BLIND_LEN, bytes.len()))
        })?;
        Self::from_bytes(arr)
    }

    /// Parses exactly 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }

    /// Cryptographically strong random, non-zero blind.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let mut bytes = [0u8; BLIND_LEN];
            rng.fill_bytes(&mut bytes);
            if let Ok(scalar) = scalar_from_bytes(&bytes) {
                if !bool::from(scalar.is_zero()) {
                    return BlindingFactor(bytes);
                }
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; BLIND_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub(crate) fn to_scalar(&self) -> Scalar {
        // Construction guarantees a canonical encoding.
        scalar_from_bytes(&self.0).unwrap_or(Scalar::ZERO)
    }

    pub(crate) fn from_scalar(scalar: &Scalar) -> Self {
        let mut bytes = [0u8; BLIND_LEN];
        bytes.copy_from_slice(&scalar.to_bytes());
        BlindingFactor(bytes)
    }
}

fn scalar_from_bytes(bytes: &[u8; BLIND_LEN]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or_else(|| WalletError::Validation("blinding factor is not a canonical scalar".into()))
}

/// 33-byte compressed Pedersen commitment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(#[serde(with = "BigArray")] pub [u8; COMMITMENT_LEN]);

impl std::fmt::Debug for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Commitment({})", hex::encode(self.0))
    }
}

impl Commitment {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; COMMITMENT_LEN] = bytes.try_into().map_err(|_| {
            WalletError::Validation(format!("commitment must be {} bytes, got {}", COMMITMENT_LEN, bytes.len()))
        })?;
        let commitment = Commitment(arr);
        commitment.to_point()?;
        Ok(commitment)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_slice(&hex::decode(s.trim())?)
    }

    pub fn as_bytes(&self) -> &[u8; COMMITMENT_LEN] {
        &self.0
    }

    pub(crate) fn to_point(&self) -> Result<ProjectivePoint> {
        let encoded = EncodedPoint::from_bytes(self.0)
            .map_err(|_| WalletError::Validation("commitment is not a valid point encoding".into()))?;
        Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .map(ProjectivePoint::from)
            .ok_or_else(|| WalletError::Validation("commitment is not on the curve".into()))
    }

    pub(crate) fn from_point(point: &ProjectivePoint) -> Result<Self> {
        let encoded = point.to_affine().to_encoded_point(true);
        let bytes = encoded.as_bytes();
        if bytes.len() != COMMITMENT_LEN {
            return Err(WalletError::CryptoInvariant("commitment is the point at infinity".into()));
        }
        let mut arr = [0u8; COMMITMENT_LEN];
        arr.copy_from_slice(bytes);
        Ok(Commitment(arr))
    }
}

pub(crate) fn value_point(value: u64) -> ProjectivePoint {
    *GENERATOR_H * Scalar::from(value)
}

fn commitment_point(blind: &BlindingFactor, value: u64) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * blind.to_scalar() + value_point(value)
}

/// Computes `blind*G + value*H`.
pub fn commit(blind: &BlindingFactor, value: u64) -> Result<Commitment> {
    Commitment::from_point(&commitment_point(blind, value))
}

/// Recomputes the commitment from (blind, value) and byte-compares.
pub fn verify_commitment(commitment: &Commitment, blind: &BlindingFactor, value: u64) -> bool {
    match commit(blind, value) {
        Ok(expected) => expected.0 == commitment.0,
        Err(_) => false,
    }
}

/// Homomorphic sum of a set of commitments.
pub fn add_commitments(commitments: &[Commitment]) -> Result<Commitment> {
    let mut acc = ProjectivePoint::IDENTITY;
    for c in commitments {
        acc += c.to_point()?;
    }
    Commitment::from_point(&acc)
}

/// Checks `sum(inputs) + plain_in*H == sum(outputs) + plain_out*H`.
///
/// Plain amounts (explicit inputs, explicit outputs, the fee) are folded in as
/// unblinded value points.
pub fn verify_commitment_sum(
    inputs: &[Commitment],
    plain_in: u64,
    outputs: &[Commitment],
    plain_out: u64,
) -> Result<bool> {
    let mut lhs = value_point(plain_in);
    for c in inputs {
        lhs += c.to_point()?;
    }
    let mut rhs = value_point(plain_out);
    for c in outputs {
        rhs += c.to_point()?;
    }
    Ok(lhs == rhs)
}
