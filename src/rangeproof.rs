use rand::Rng;
use rand::RngCore;

use crate::crypto::{verify_commitment, BlindingFactor, Commitment};
use crate::error::{Result, WalletError};

/// Proofs shorter than this are the compact (bulletproof) form.
///
/// Length is the only discriminator chain data carries, so rewinding must keep
/// branching on it.
pub const COMPACT_PROOF_MAX_LEN: usize = 1000;

const MIN_LEGACY_BITS: u32 = 32;
const MAX_LEGACY_BITS: u32 = 64;
const MAX_EXPONENT: i32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeProofParams {
    pub min_value: u64,
    pub ct_exponent: i32,
    /// `0` selects the compact form.
    pub ct_bits: u32,
}

impl Default for RangeProofParams {
    fn default() -> Self {
        RangeProofParams::compact()
    }
}

impl RangeProofParams {
    pub fn compact() -> Self {
        RangeProofParams { min_value: 0, ct_exponent: 0, ct_bits: 0 }
    }

    pub fn is_compact(&self) -> bool {
        self.ct_bits == 0
    }

    /// Largest value the proof can cover.
    pub fn max_provable(&self) -> u64 {
        if self.is_compact() {
            return u64::MAX;
        }
        let bits = self.ct_bits.min(MAX_LEGACY_BITS);
        let mantissa: u128 = if bits >= 64 { u64::MAX as u128 } else { (1u128 << bits) - 1 };
        let scale = 10u128.pow(self.ct_exponent.clamp(0, MAX_EXPONENT) as u32);
        let max = (self.min_value as u128).saturating_add(mantissa.saturating_mul(scale));
        max.min(u64::MAX as u128) as u64
    }

    pub fn check_value(&self, value: u64) -> Result<()> {
        if self.ct_bits > MAX_LEGACY_BITS {
            return Err(WalletError::RangeProof(format!("bit width {} exceeds 64", self.ct_bits)));
        }
        if !(0..=MAX_EXPONENT).contains(&self.ct_exponent) {
            return Err(WalletError::RangeProof(format!("exponent {} out of range", self.ct_exponent)));
        }
        if value < self.min_value {
            return Err(WalletError::RangeProof(format!(
                "value {} below proof minimum {}",
                value, self.min_value
            )));
        }
        if !self.is_compact() {
            let scale = 10u64.pow(self.ct_exponent as u32);
            if (value - self.min_value) % scale != 0 {
                return Err(WalletError::RangeProof(format!(
                    "value {} is not a multiple of 10^{}",
                    value, self.ct_exponent
                )));
            }
        }
        if value > self.max_provable() {
            return Err(WalletError::RangeProof(format!(
                "value {} exceeds the {}-bit proof range",
                value, self.ct_bits
            )));
        }
        Ok(())
    }
}

/// Picks legacy proof parameters for `value` when the caller gave none.
///
/// The exponent is drawn from the value's trailing decimal zeros so the
/// mantissa stays exact. The width covers the mantissa, rounded up to a
/// multiple of four.
pub fn select_range_proof_parameters<R: RngCore + ?Sized>(value: u64, rng: &mut R) -> RangeProofParams {
    if value == 0 {
        return RangeProofParams {
            min_value: 0,
            ct_exponent: rng.gen_range(0..5),
            ct_bits: MIN_LEGACY_BITS,
        };
    }
    let mut trailing = 0;
    let mut v = value;
    while v % 10 == 0 && trailing < MAX_EXPONENT {
        v /= 10;
        trailing += 1;
    }
    let exponent = rng.gen_range(0..=trailing.min(4));
    let mantissa = value / 10u64.pow(exponent as u32);
    let needed = 64 - mantissa.leading_zeros();
    let bits = ((needed + 3) / 4 * 4).clamp(MIN_LEGACY_BITS, MAX_LEGACY_BITS);
    RangeProofParams { min_value: 0, ct_exponent: exponent, ct_bits: bits }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofForm {
    Compact,
    Legacy,
}

impl ProofForm {
    pub fn detect(proof: &[u8]) -> Self {
        if proof.len() < COMPACT_PROOF_MAX_LEN {
            ProofForm::Compact
        } else {
            ProofForm::Legacy
        }
    }
}

/// What a rewind recovers from a proof built with a known nonce.
#[derive(Debug, Clone)]
pub struct RewoundProof {
    pub value: u64,
    pub blind: BlindingFactor,
    pub message: Vec<u8>,
}

/// External range-proof primitive.
///
/// Implementations generate and rewind proofs; this crate only decides which
/// form to use and checks the results against the commitment.
pub trait RangeProofScheme: Send + Sync {
    fn prove_compact(
        &self,
        commitment: &Commitment,
        value: u64,
        blind: &BlindingFactor,
        nonce: &[u8; 32],
        message: &[u8],
    ) -> Result<Vec<u8>>;

    fn prove_legacy(
        &self,
        commitment: &Commitment,
        value: u64,
        blind: &BlindingFactor,
        nonce: &[u8; 32],
        message: &[u8],
        params: &RangeProofParams,
    ) -> Result<Vec<u8>>;

    fn rewind_compact(&self, commitment: &Commitment, proof: &[u8], nonce: &[u8; 32]) -> Result<RewoundProof>;

    fn rewind_legacy(&self, commitment: &Commitment, proof: &[u8], nonce: &[u8; 32]) -> Result<RewoundProof>;
}

pub fn prove(
    scheme: &dyn RangeProofScheme,
    commitment: &Commitment,
    value: u64,
    blind: &BlindingFactor,
    nonce: &[u8; 32],
    message: &[u8],
    params: &RangeProofParams,
) -> Result<Vec<u8>> {
    params.check_value(value)?;
    let proof = if params.is_compact() {
        scheme.prove_compact(commitment, value, blind, nonce, message)?
    } else {
        scheme.prove_legacy(commitment, value, blind, nonce, message, params)?
    };
    let produced = ProofForm::detect(&proof);
    let wanted = if params.is_compact() { ProofForm::Compact } else { ProofForm::Legacy };
    if produced != wanted {
        return Err(WalletError::RangeProof(format!(
            "backend produced a {} byte proof, not readable as {:?}",
            proof.len(),
            wanted
        )));
    }
    Ok(proof)
}

/// Rewinds by proof length and checks the recovered pair reopens `commitment`.
pub fn rewind(
    scheme: &dyn RangeProofScheme,
    commitment: &Commitment,
    proof: &[u8],
    nonce: &[u8; 32],
) -> Result<RewoundProof> {
    let rewound = match ProofForm::detect(proof) {
        ProofForm::Compact => scheme.rewind_compact(commitment, proof, nonce)?,
        ProofForm::Legacy => scheme.rewind_legacy(commitment, proof, nonce)?,
    };
    if !verify_commitment(commitment, &rewound.blind, rewound.value) {
        return Err(WalletError::CommitmentMismatch("rewound range proof".into()));
    }
    Ok(rewound)
}
