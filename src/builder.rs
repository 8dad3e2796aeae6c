//! End-to-end construction of a transaction from recipients and coin control.
//!
//! The flow is: estimate the fee from a size model and select inputs until the
//! fee is stable, add change, subtract the fee, expand destinations, assign
//! blinds, solve the closing blind, commit and prove every shielded output,
//! self-check the commitment sum, then build rings for anonymous inputs.
//! Signing is left to the caller.

use rand::{CryptoRng, Rng, RngCore};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::blind::{compute_closing_blind, verify_blind_balance, ClosingSide};
use crate::chain::ChainView;
use crate::coin_control::CoinControl;
use crate::config::{Frozen, WalletSettings};
use crate::crypto::{verify_commitment, verify_commitment_sum, BlindingFactor, Commitment};
use crate::error::{Result, WalletError};
use crate::rangeproof::{select_range_proof_parameters, RangeProofScheme};
use crate::recipient::{
    apply_fee_subtraction, assign_blinds, commit_recipient, expand, finalize, DestinationResolver, RecipientState,
    TempRecipient,
};
use crate::records::{Amount, OutputType, StoredTransaction, TransactionRecord, Txid, ORF_FROM, ORF_OWNED};
use crate::selection::{pick_hiding_outputs, select_inputs, RingMatrix, SelectedCoin, Selection};
use crate::transaction::{RingInputs, Transaction, TxIn, TxOut};
use crate::wallet::{Wallet, WalletHandle};

pub const TX_VERSION: u8 = 2;
const MAX_FEE_ITERATIONS: usize = 16;

// Size model, in bytes.
const BASE_SIZE: usize = 12;
const PLAIN_INPUT_SIZE: usize = 148;
const BLIND_INPUT_SIZE: usize = 148 + 33;
const PLAIN_OUTPUT_SIZE: usize = 34;
const BLIND_OUTPUT_SIZE: usize = 1 + 33 + 25 + 34;
const ANON_OUTPUT_SIZE: usize = 1 + 33 + 33 + 34;
const COMPACT_PROOF_SIZE: usize = 740;
const LEGACY_PROOF_SIZE: usize = 2_900;
const RING_MEMBER_SIZE: usize = 3;
const KEY_IMAGE_SIZE: usize = 33;
const MLSAG_ELEMENT_SIZE: usize = 32;

/// A built, unsigned transaction together with what the ledger keeps for it.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub txid: Txid,
    pub tx: Transaction,
    pub record: TransactionRecord,
    pub stored: StoredTransaction,
    pub recipients: Vec<TempRecipient>,
    pub fee: Amount,
    pub change_position: Option<usize>,
    pub rings: Vec<RingMatrix>,
    pub inputs: Vec<SelectedCoin>,
}

#[derive(Clone)]
pub struct TransactionBuilder {
    chain: Arc<dyn ChainView>,
    resolver: Arc<dyn DestinationResolver>,
    proofs: Arc<dyn RangeProofScheme>,
    settings: WalletSettings,
    frozen: Frozen,
    ring_size: usize,
}

impl TransactionBuilder {
    pub fn new(
        chain: Arc<dyn ChainView>,
        resolver: Arc<dyn DestinationResolver>,
        proofs: Arc<dyn RangeProofScheme>,
        settings: WalletSettings,
        frozen: Frozen,
    ) -> Self {
        let ring_size = settings.default_ring_size;
        TransactionBuilder { chain, resolver, proofs, settings, frozen, ring_size }
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn chain(&self) -> &dyn ChainView {
        self.chain.as_ref()
    }

    fn estimate_size(&self, input_type: OutputType, inputs: usize, recipients: &[TempRecipient], extra: &[OutputType]) -> usize {
        let proof = if self.settings.legacy_range_proofs { LEGACY_PROOF_SIZE } else { COMPACT_PROOF_SIZE };
        let output_size = |t: OutputType| match t {
            OutputType::Standard => PLAIN_OUTPUT_SIZE,
            OutputType::Blind => BLIND_OUTPUT_SIZE + proof,
            OutputType::Anon => ANON_OUTPUT_SIZE + proof,
        };
        let mut size = BASE_SIZE;
        size += recipients.iter().map(|r| output_size(r.output_type) + r.data.len()).sum::<usize>();
        size += extra.iter().map(|t| output_size(*t)).sum::<usize>();
        size += match input_type {
            OutputType::Standard => inputs * PLAIN_INPUT_SIZE,
            OutputType::Blind => inputs * BLIND_INPUT_SIZE,
            OutputType::Anon => {
                let per_sig = self.settings.inputs_per_sig.max(1);
                let rings = (inputs + per_sig - 1) / per_sig;
                inputs * (self.ring_size * RING_MEMBER_SIZE + KEY_IMAGE_SIZE)
                    + rings * (self.ring_size * (per_sig + 1) + 1) * MLSAG_ELEMENT_SIZE
            }
        };
        size
    }

    fn fee_for(size: usize, rate: Amount) -> Amount {
        let size = size as Amount;
        (size * rate + 999) / 1000
    }

    /// Locks the wallet and builds. The lock is held for the whole build.
    pub fn build_locked(
        &self,
        wallet: &WalletHandle,
        recipients: Vec<TempRecipient>,
        coin_control: &CoinControl,
    ) -> Result<BuiltTransaction> {
        let guard = wallet
            .lock()
            .map_err(|_| WalletError::Persistence("wallet mutex poisoned".into()))?;
        self.create_transaction(&guard, recipients, coin_control, &mut rand::rngs::OsRng)
    }

    pub fn create_transaction<R: RngCore + CryptoRng + ?Sized>(
        &self,
        wallet: &Wallet,
        mut recipients: Vec<TempRecipient>,
        coin_control: &CoinControl,
        rng: &mut R,
    ) -> Result<BuiltTransaction> {
        if recipients.is_empty() {
            return Err(WalletError::Validation("no recipients".into()));
        }
        if let Some(r) = recipients.iter().find(|r| r.state != RecipientState::Unconstructed) {
            return Err(WalletError::Validation(format!("recipient in state {:?} cannot be reused", r.state)));
        }
        if recipients.iter().any(|r| r.is_change) {
            return Err(WalletError::Validation("change outputs are added by the builder".into()));
        }
        coin_control.validate()?;
        let input_type = coin_control.coin_type;
        let chain = self.chain.as_ref();
        let fee_rate = coin_control.fee_rate.unwrap_or(self.settings.fallback_fee_rate);
        let subtract = recipients.iter().any(|r| r.subtract_fee);
        let total_out: Amount = recipients.iter().map(|r| r.amount_selected).sum();
        let change_type = coin_control.change_type.unwrap_or(input_type);
        let filler_type = change_type.max(OutputType::Blind);

        let mut fee: Amount = coin_control.extra_fee;
        let mut attempt = 0;
        let (selection, change) = loop {
            attempt += 1;
            let target = if subtract { total_out } else { total_out + fee };
            let selection = select_inputs(
                wallet,
                chain,
                &self.settings,
                &self.frozen,
                input_type,
                target,
                coin_control,
                rng,
            )?;
            let change = selection.total - target;
            let mut extra = Vec::new();
            if change > 0 && coin_control.add_change_output {
                extra.push(change_type);
            }
            if needs_filler(input_type, &recipients, &extra) {
                extra.push(filler_type);
            }
            let size = self.estimate_size(input_type, selection.coins.len(), &recipients, &extra);
            let needed = Self::fee_for(size, fee_rate) + coin_control.extra_fee;
            debug!(attempt, size, fee, needed, "fee estimate");
            if needed <= fee {
                break (selection, change);
            }
            if attempt >= MAX_FEE_ITERATIONS {
                return Err(WalletError::Validation("fee estimate did not converge".into()));
            }
            fee = needed;
        };

        if subtract {
            apply_fee_subtraction(&mut recipients, fee)?;
        }

        let mut change_position = None;
        if change > 0 {
            if coin_control.add_change_output {
                let dest = match &coin_control.change_destination {
                    Some(d) => d.clone(),
                    None => self.resolver.change_destination(change_type)?,
                };
                let pos = rng.gen_range(0..=recipients.len());
                recipients.insert(pos, TempRecipient::change(change_type, change, dest));
                change_position = Some(pos);
            } else {
                fee += change;
            }
        }

        if needs_filler(input_type, &recipients, &[]) {
            // Zero-value output to ourselves that takes the closing blind.
            let dest = self.resolver.change_destination(filler_type)?;
            let pos = rng.gen_range(0..=recipients.len());
            recipients.insert(pos, TempRecipient::new(filler_type, 0, dest));
            if let Some(c) = change_position.as_mut() {
                if pos <= *c {
                    *c += 1;
                }
            }
        }

        for r in recipients.iter_mut() {
            expand(r, self.resolver.as_ref())?;
            if r.is_shielded() && r.range_proof_params.is_none() && self.settings.legacy_range_proofs {
                r.range_proof_params = Some(select_range_proof_parameters(r.amount.max(0) as u64, rng));
            }
        }

        let closing = assign_blinds(&mut recipients, rng);
        self.reconcile_blinds(&selection, &mut recipients, closing)?;

        for (i, r) in recipients.iter_mut().enumerate() {
            commit_recipient(r, self.proofs.as_ref(), i)?;
        }
        let outputs = finalize(&mut recipients)?;
        self.check_balance(&selection, &outputs, fee)?;

        let (inputs, rings) = self.build_inputs(input_type, &selection.coins, coin_control, rng)?;
        let tx = Transaction { version: TX_VERSION, lock_time: 0, fee, inputs, outputs };
        let txid = tx.txid();

        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        let mut record = TransactionRecord::new(now);
        record.fee = fee;
        record.set_input_type(input_type);
        record.inputs = selection.coins.iter().map(|c| c.outpoint).collect();
        let mut stored = StoredTransaction::new(tx.clone());
        for r in &recipients {
            let flags = if r.is_change { ORF_OWNED | ORF_FROM } else { ORF_FROM };
            record.insert_output(r.to_output_record(flags)?, false)?;
            if let (true, Some(n), Some(blind)) = (r.is_shielded(), r.n, r.blind.as_ref()) {
                stored.insert_blind(n as u32, blind.clone());
            }
        }

        info!(
            wallet = wallet.name(),
            txid = %hex::encode(txid),
            inputs = selection.coins.len(),
            outputs = recipients.len(),
            fee,
            "transaction built"
        );
        Ok(BuiltTransaction {
            txid,
            tx,
            record,
            stored,
            recipients,
            fee,
            change_position,
            rings,
            inputs: selection.coins,
        })
    }

    fn reconcile_blinds(&self, selection: &Selection, recipients: &mut [TempRecipient], closing: Option<usize>) -> Result<()> {
        let input_blinds: Vec<BlindingFactor> = selection.coins.iter().map(|c| c.blind.clone()).collect();
        let fixed: Vec<BlindingFactor> = recipients
            .iter()
            .enumerate()
            .filter(|(i, r)| r.is_shielded() && Some(*i) != closing)
            .filter_map(|(_, r)| r.blind.clone())
            .collect();
        match closing {
            Some(idx) => {
                let mut output_blinds = fixed;
                output_blinds.push(BlindingFactor::zero());
                let blind = compute_closing_blind(&input_blinds, &output_blinds, ClosingSide::Output)?;
                recipients[idx].blind = Some(blind);
                Ok(())
            }
            None => {
                let any_shielded = !fixed.is_empty() || input_blinds.iter().any(|b| !b.is_zero());
                if any_shielded {
                    verify_blind_balance(&input_blinds, &fixed)?;
                }
                Ok(())
            }
        }
    }

    /// Recomputes every commitment and checks inputs and outputs balance
    /// before anything can be broadcast.
    fn check_balance(&self, selection: &Selection, outputs: &[TxOut], fee: Amount) -> Result<()> {
        let mut in_commitments: Vec<Commitment> = Vec::new();
        let mut plain_in: Amount = 0;
        for coin in &selection.coins {
            match coin.output_type {
                OutputType::Standard => plain_in += coin.value,
                OutputType::Blind | OutputType::Anon => {
                    let commitment = coin.commitment.ok_or_else(|| {
                        WalletError::CryptoInvariant(format!("input {} has no commitment", coin.outpoint))
                    })?;
                    if !verify_commitment(&commitment, &coin.blind, coin.value as u64) {
                        return Err(WalletError::CommitmentMismatch(format!("input {}", coin.outpoint)));
                    }
                    in_commitments.push(commitment);
                }
            }
        }
        let mut out_commitments: Vec<Commitment> = Vec::new();
        let mut plain_out: Amount = fee;
        for out in outputs {
            match out {
                TxOut::Plain { value, .. } => plain_out += value,
                TxOut::Blinded { commitment, .. } | TxOut::Anonymous { commitment, .. } => {
                    out_commitments.push(*commitment)
                }
            }
        }
        if !verify_commitment_sum(&in_commitments, plain_in as u64, &out_commitments, plain_out as u64)? {
            warn!(fee, "commitment sum check failed");
            return Err(WalletError::BlindSumImbalance(
                "input commitments do not equal output commitments plus fee".into(),
            ));
        }
        Ok(())
    }

    fn build_inputs<R: RngCore + ?Sized>(
        &self,
        input_type: OutputType,
        coins: &[SelectedCoin],
        coin_control: &CoinControl,
        rng: &mut R,
    ) -> Result<(Vec<TxIn>, Vec<RingMatrix>)> {
        match input_type {
            OutputType::Standard | OutputType::Blind => Ok((
                coins.iter().map(|c| TxIn::Standard { prevout: c.outpoint }).collect(),
                Vec::new(),
            )),
            OutputType::Anon => {
                let mut inputs = Vec::new();
                let mut rings = Vec::new();
                let mut mixins_used = 0usize;
                let mode = match coin_control.mixin_selection_mode {
                    Some(mode) => mode,
                    None => self.settings.mixin_mode()?,
                };
                for chunk in coins.chunks(self.settings.inputs_per_sig.max(1)) {
                    let reals = chunk
                        .iter()
                        .map(|c| {
                            c.anon_index.ok_or_else(|| {
                                WalletError::NotFound(format!("chain index of anonymous input {}", c.outpoint))
                            })
                        })
                        .collect::<Result<Vec<i64>>>()?;
                    let use_mixins = coin_control.use_mixins.get(mixins_used..).unwrap_or(&[]);
                    let ring = pick_hiding_outputs(
                        self.chain.as_ref(),
                        &self.settings,
                        &reals,
                        self.ring_size,
                        mode,
                        use_mixins,
                        rng,
                    )?;
                    mixins_used += reals.len() * (self.ring_size - 1);
                    inputs.push(TxIn::Anon(RingInputs {
                        ring_size: ring.ring_size,
                        inputs_per_sig: reals.len(),
                        rows: ring.rows.clone(),
                        // filled by the signer where the wallet has not recorded one
                        key_images: chunk.iter().map(|c| c.key_image.clone().unwrap_or_default()).collect(),
                    }));
                    rings.push(ring);
                }
                Ok((inputs, rings))
            }
        }
    }
}

/// True when the transaction needs an extra zero-value shielded output to
/// carry the closing blind: plain inputs funding exactly one shielded output
/// (its blind would be zero), or shielded inputs with no output left open.
fn needs_filler(input_type: OutputType, recipients: &[TempRecipient], extra: &[OutputType]) -> bool {
    let extra_shielded = extra.iter().filter(|t| **t != OutputType::Standard).count();
    let open = recipients.iter().filter(|r| r.is_shielded() && !r.blind_explicit).count() + extra_shielded;
    if input_type == OutputType::Standard {
        let explicit = recipients.iter().any(|r| r.is_shielded() && r.blind_explicit);
        !explicit && open == 1
    } else {
        open == 0
    }
}

/// Runs a blocking build on a worker thread and gives up waiting after
/// `deadline`. A build that is still running is not interrupted; its result
/// is dropped so it can never reach broadcast.
pub async fn build_with_deadline<F, T>(job: F, deadline: Duration) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(job);
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(WalletError::CryptoInvariant(format!("build worker failed: {}", join_error))),
        Err(_) => {
            warn!(?deadline, "transaction build exceeded its deadline");
            Err(WalletError::Timeout(deadline))
        }
    }
}
