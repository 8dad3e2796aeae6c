//! Blind-sum reconciliation.
//!
//! For the commitments of a transaction to balance, the input blinding
//! factors must sum to the output blinding factors modulo the curve order.
//! Given all but one of them, the missing one is solved by scalar subtraction.

use k256::Scalar;

use crate::crypto::BlindingFactor;
use crate::error::{Result, WalletError};

/// Which side owns the reserved last slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingSide {
    Input,
    Output,
}

fn sum(blinds: &[BlindingFactor]) -> Scalar {
    blinds.iter().fold(Scalar::ZERO, |acc, b| acc + b.to_scalar())
}

pub fn sum_blinds(blinds: &[BlindingFactor]) -> BlindingFactor {
    BlindingFactor::from_scalar(&sum(blinds))
}

/// Solves for the blind in the reserved last slot of the closing side.
///
/// The closing slice must include the reserved slot; its content is ignored.
pub fn compute_closing_blind(
    input_blinds: &[BlindingFactor],
    output_blinds: &[BlindingFactor],
    closing: ClosingSide,
) -> Result<BlindingFactor> {
    if input_blinds.is_empty() || output_blinds.is_empty() {
        return Err(WalletError::Validation(
            "closing blind needs at least one input and one output blind".into(),
        ));
    }
    let closing_scalar = match closing {
        ClosingSide::Output => {
            let fixed = &output_blinds[..output_blinds.len() - 1];
            sum(input_blinds) - sum(fixed)
        }
        ClosingSide::Input => {
            let fixed = &input_blinds[..input_blinds.len() - 1];
            sum(output_blinds) - sum(fixed)
        }
    };
    if bool::from(closing_scalar.is_zero()) {
        // A zero closing blind would publish the closing value in the clear.
        return Err(WalletError::CryptoInvariant("closing blind is zero".into()));
    }
    Ok(BlindingFactor::from_scalar(&closing_scalar))
}

pub fn blinds_balance(input_blinds: &[BlindingFactor], output_blinds: &[BlindingFactor]) -> bool {
    sum(input_blinds) == sum(output_blinds)
}

pub fn verify_blind_balance(input_blinds: &[BlindingFactor], output_blinds: &[BlindingFactor]) -> Result<()> {
    if blinds_balance(input_blinds, output_blinds) {
        Ok(())
    } else {
        Err(WalletError::BlindSumImbalance(format!(
            "{} input blinds do not sum to {} output blinds",
            input_blinds.len(),
            output_blinds.len()
        )))
    }
}
