//! Output construction.
//!
//! A `TempRecipient` moves through `Unconstructed -> Expanded -> Committed ->
//! Finalized`. Expansion resolves the destination into a script and one-time
//! keys, commitment computes the Pedersen commitment and range proof, and
//! finalization assigns the output index and produces the `TxOut`.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{commit, verify_commitment, BlindingFactor, Commitment, CompressedPubKey};
use crate::error::{Result, WalletError};
use crate::rangeproof::{self, RangeProofParams, RangeProofScheme};
use crate::records::{Amount, OutputRecord, OutputType, MAX_MONEY, OR_PLACEHOLDER_N, ORF_CHANGE};
use crate::transaction::TxOut;

pub const MAX_NARRATION_LEN: usize = 24;

/// Smallest amount an output may carry after fee subtraction.
pub const MIN_OUTPUT_VALUE: Amount = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    None,
    /// Raw script supplied by the caller.
    Script(Vec<u8>),
    KeyHash([u8; 20]),
    /// Encoded stealth address; one-time keys are derived per payment.
    Stealth(Vec<u8>),
    /// Encoded extended public key; a child key is derived per payment.
    ExtKey(Vec<u8>),
}

impl Destination {
    pub fn is_none(&self) -> bool {
        matches!(self, Destination::None)
    }
}

/// Secret ephemeral key produced while expanding a stealth destination.
#[derive(Clone)]
pub struct EphemeralKey(pub Zeroizing<[u8; 32]>);

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EphemeralKey([REDACTED])")
    }
}

/// What the address layer returns for one destination.
#[derive(Debug, Clone)]
pub struct ExpandedDestination {
    pub script: Vec<u8>,
    pub pk_to: Option<CompressedPubKey>,
    pub ephemeral: Option<EphemeralKey>,
    /// Rewind nonce shared with the recipient.
    pub nonce: [u8; 32],
    pub data: Vec<u8>,
    /// Derivation path, first byte tags the address origin.
    pub path: Vec<u8>,
}

/// Address codecs and key derivation live outside the wallet core.
pub trait DestinationResolver: Send + Sync {
    fn expand(
        &self,
        output_type: OutputType,
        destination: &Destination,
        cold_staking: Option<&Destination>,
    ) -> Result<ExpandedDestination>;

    /// A fresh internal destination for change of the given kind.
    fn change_destination(&self, output_type: OutputType) -> Result<Destination>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    Unconstructed,
    Expanded,
    Committed,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct TempRecipient {
    pub output_type: OutputType,
    /// Value committed to; below `amount_selected` once a fee is subtracted.
    pub amount: Amount,
    pub amount_selected: Amount,
    pub subtract_fee: bool,
    pub exempt_fee_sub: bool,
    pub address: Destination,
    pub address_cold_staking: Option<Destination>,
    pub script_set: bool,
    pub script: Vec<u8>,
    pub data: Vec<u8>,
    pub blind: Option<BlindingFactor>,
    pub blind_explicit: bool,
    pub range_proof: Vec<u8>,
    pub commitment: Option<Commitment>,
    pub nonce: [u8; 32],
    pub nonce_set: bool,
    pub range_proof_params: Option<RangeProofParams>,
    pub ephemeral: Option<EphemeralKey>,
    pub pk_to: Option<CompressedPubKey>,
    pub n: Option<u16>,
    pub narration: String,
    pub is_change: bool,
    pub path: Vec<u8>,
    pub state: RecipientState,
}

impl TempRecipient {
    pub fn new(output_type: OutputType, amount: Amount, address: Destination) -> Self {
        TempRecipient {
            output_type,
            amount,
            amount_selected: amount,
            subtract_fee: false,
            exempt_fee_sub: false,
            address,
            address_cold_staking: None,
            script_set: false,
            script: Vec::new(),
            data: Vec::new(),
            blind: None,
            blind_explicit: false,
            range_proof: Vec::new(),
            commitment: None,
            nonce: [0u8; 32],
            nonce_set: false,
            range_proof_params: None,
            ephemeral: None,
            pk_to: None,
            n: None,
            narration: String::new(),
            is_change: false,
            path: Vec::new(),
            state: RecipientState::Unconstructed,
        }
    }

    pub fn change(output_type: OutputType, amount: Amount, address: Destination) -> Self {
        let mut r = TempRecipient::new(output_type, amount, address);
        r.is_change = true;
        r
    }

    pub fn set_amount(&mut self, value: Amount) {
        self.amount = value;
        self.amount_selected = value;
    }

    pub fn is_shielded(&self) -> bool {
        self.output_type != OutputType::Standard
    }

    pub fn set_script(&mut self, script: Vec<u8>) {
        self.script = script;
        self.script_set = true;
    }

    fn min_value(&self) -> Amount {
        let proof_min = self
            .range_proof_params
            .map(|p| p.min_value.min(i64::MAX as u64) as Amount)
            .unwrap_or(0);
        proof_min.max(MIN_OUTPUT_VALUE)
    }

    /// Builds the `OutputRecord` kept in the ledger for this output.
    pub fn to_output_record(&self, flags: u8) -> Result<OutputRecord> {
        let n = self
            .n
            .ok_or_else(|| WalletError::Validation("recipient has no output index yet".into()))?;
        let mut record = OutputRecord::new(self.output_type, n, self.amount).with_flags(flags);
        if self.is_change {
            record.flags |= ORF_CHANGE;
        }
        record.script = self.script.clone();
        record.narration = self.narration.clone();
        record.path = self.path.clone();
        Ok(record)
    }
}

/// Validates a send request and turns it into a `TempRecipient`.
///
/// An explicit blind is only accepted for shielded outputs and must be exactly
/// 32 bytes of hex.
pub fn add_output(
    output_type: OutputType,
    address: Destination,
    amount: Amount,
    subtract_fee: bool,
    narration: &str,
    blind_hex: Option<&str>,
) -> Result<TempRecipient> {
    if amount <= 0 || amount > MAX_MONEY {
        return Err(WalletError::Validation(format!("invalid amount {}", amount)));
    }
    if address.is_none() {
        return Err(WalletError::Validation("missing destination".into()));
    }
    if narration.len() > MAX_NARRATION_LEN {
        return Err(WalletError::Validation(format!(
            "narration is {} bytes, limit is {}",
            narration.len(),
            MAX_NARRATION_LEN
        )));
    }
    let mut r = TempRecipient::new(output_type, amount, address);
    r.subtract_fee = subtract_fee;
    r.narration = narration.to_string();
    if let Some(hex) = blind_hex {
        if output_type == OutputType::Standard {
            return Err(WalletError::Validation("blinding factor given for a plain output".into()));
        }
        r.blind = Some(BlindingFactor::from_hex(hex)?);
        r.blind_explicit = true;
    }
    Ok(r)
}

/// Spreads `fee` over the recipients flagged to pay it.
///
/// The split is computed from `amount_selected`, so applying the same fee
/// twice gives the same amounts. The first paying recipient also carries the
/// remainder. A recipient whose share would push it below its minimum value is
/// marked exempt and the fee is split again over the others. A zero fee
/// leaves every amount untouched.
pub fn apply_fee_subtraction(recipients: &mut [TempRecipient], fee: Amount) -> Result<()> {
    if fee < 0 {
        return Err(WalletError::Validation(format!("negative fee {}", fee)));
    }
    if fee == 0 || !recipients.iter().any(|r| r.subtract_fee) {
        return Ok(());
    }
    loop {
        let payers: Vec<usize> = recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| r.subtract_fee && !r.exempt_fee_sub)
            .map(|(i, _)| i)
            .collect();
        if payers.is_empty() {
            return Err(WalletError::Validation(format!(
                "fee {} cannot be subtracted: every recipient would fall below its minimum value",
                fee
            )));
        }
        let count = payers.len() as Amount;
        let share = fee / count;
        let remainder = fee % count;

        let mut exempted = false;
        for (k, &i) in payers.iter().enumerate() {
            let cut = if k == 0 { share + remainder } else { share };
            if recipients[i].amount_selected - cut < recipients[i].min_value() {
                recipients[i].exempt_fee_sub = true;
                exempted = true;
            }
        }
        if exempted {
            continue;
        }
        for r in recipients.iter_mut() {
            if r.subtract_fee && r.exempt_fee_sub {
                r.amount = r.amount_selected;
            }
        }
        for (k, &i) in payers.iter().enumerate() {
            let cut = if k == 0 { share + remainder } else { share };
            recipients[i].amount = recipients[i].amount_selected - cut;
        }
        return Ok(());
    }
}

/// Gives every shielded output without an explicit blind a random one, except
/// the last, which is reserved for the closing blind. Returns its position.
pub fn assign_blinds<R: RngCore + ?Sized>(recipients: &mut [TempRecipient], rng: &mut R) -> Option<usize> {
    let closing = recipients
        .iter()
        .rposition(|r| r.is_shielded() && !r.blind_explicit);
    for (i, r) in recipients.iter_mut().enumerate() {
        if !r.is_shielded() || r.blind_explicit {
            continue;
        }
        r.blind = if Some(i) == closing { None } else { Some(BlindingFactor::random(rng)) };
    }
    closing
}

/// Resolves the destination into a script and, for shielded outputs, the
/// one-time keys and rewind nonce.
pub fn expand(recipient: &mut TempRecipient, resolver: &dyn DestinationResolver) -> Result<()> {
    if recipient.state != RecipientState::Unconstructed {
        return Err(WalletError::Validation(format!(
            "recipient already past expansion ({:?})",
            recipient.state
        )));
    }
    if !(recipient.script_set && recipient.output_type == OutputType::Standard) {
        let expanded = resolver.expand(
            recipient.output_type,
            &recipient.address,
            recipient.address_cold_staking.as_ref(),
        )?;
        if !recipient.script_set {
            recipient.script = expanded.script;
        }
        if !recipient.nonce_set {
            recipient.nonce = expanded.nonce;
            recipient.data = expanded.data;
        }
        recipient.pk_to = expanded.pk_to;
        recipient.ephemeral = expanded.ephemeral;
        recipient.path = expanded.path;
    }
    if recipient.output_type == OutputType::Anon && recipient.pk_to.is_none() {
        return Err(WalletError::Validation("anonymous output needs a destination public key".into()));
    }
    recipient.state = RecipientState::Expanded;
    Ok(())
}

/// Computes the commitment and range proof.
///
/// A commitment the caller supplied is checked against (amount, blind) and
/// rejected with `CommitmentMismatch` if it does not reopen.
pub fn commit_recipient(
    recipient: &mut TempRecipient,
    scheme: &dyn RangeProofScheme,
    position: usize,
) -> Result<()> {
    if recipient.state != RecipientState::Expanded {
        return Err(WalletError::Validation(format!(
            "recipient {} must be expanded before commitment, is {:?}",
            position, recipient.state
        )));
    }
    if !recipient.is_shielded() {
        recipient.state = RecipientState::Committed;
        return Ok(());
    }
    if recipient.amount < 0 {
        return Err(WalletError::Validation(format!("output {} has a negative amount", position)));
    }
    let value = recipient.amount as u64;
    let params = recipient.range_proof_params.unwrap_or_default();
    params.check_value(value)?;
    let blind = recipient
        .blind
        .as_ref()
        .ok_or_else(|| WalletError::CryptoInvariant(format!("output {} has no blinding factor", position)))?;

    let commitment = match recipient.commitment {
        Some(supplied) => {
            if !verify_commitment(&supplied, blind, value) {
                return Err(WalletError::CommitmentMismatch(format!("output {}", position)));
            }
            supplied
        }
        None => commit(blind, value)?,
    };
    recipient.range_proof = rangeproof::prove(
        scheme,
        &commitment,
        value,
        blind,
        &recipient.nonce,
        recipient.narration.as_bytes(),
        &params,
    )?;
    recipient.commitment = Some(commitment);
    recipient.state = RecipientState::Committed;
    Ok(())
}

/// Assigns output indices in order and produces the transaction outputs.
pub fn finalize(recipients: &mut [TempRecipient]) -> Result<Vec<TxOut>> {
    if recipients.len() >= OR_PLACEHOLDER_N as usize {
        return Err(WalletError::Validation(format!("too many outputs: {}", recipients.len())));
    }
    let mut outputs = Vec::with_capacity(recipients.len());
    for (i, r) in recipients.iter_mut().enumerate() {
        if r.state != RecipientState::Committed {
            return Err(WalletError::Validation(format!("output {} is not committed ({:?})", i, r.state)));
        }
        let out = match r.output_type {
            OutputType::Standard => TxOut::Plain { value: r.amount, script: r.script.clone() },
            OutputType::Blind => TxOut::Blinded {
                commitment: committed(r, i)?,
                script: r.script.clone(),
                data: r.data.clone(),
                range_proof: r.range_proof.clone(),
            },
            OutputType::Anon => TxOut::Anonymous {
                pubkey: r
                    .pk_to
                    .ok_or_else(|| WalletError::Validation(format!("output {} has no public key", i)))?,
                commitment: committed(r, i)?,
                data: r.data.clone(),
                range_proof: r.range_proof.clone(),
            },
        };
        r.n = Some(i as u16);
        r.state = RecipientState::Finalized;
        outputs.push(out);
    }
    Ok(outputs)
}

fn committed(r: &TempRecipient, i: usize) -> Result<Commitment> {
    r.commitment
        .ok_or_else(|| WalletError::CryptoInvariant(format!("output {} has no commitment", i)))
}
