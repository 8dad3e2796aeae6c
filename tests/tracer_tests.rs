// Frozen output provenance tracing and frozen output listing.

mod common;

use common::*;
use ctwallet::chain::MemoryChain;
use ctwallet::crypto::{blake3_hash, commit, BlindingFactor};
use ctwallet::error::WalletError;
use ctwallet::metrics;
use ctwallet::records::{
    Amount, OutputRecord, OutputType, StoredTransaction, TransactionRecord, Txid, COIN, ORF_OWNED, UNKNOWN_VALUE,
};
use ctwallet::tracer::{list_frozen_outputs, trace_frozen_outputs, TraceWarningKind};
use ctwallet::transaction::{OutPoint, Transaction, TxIn, TxOut};
use ctwallet::wallet::Wallet;

/// Records a transaction with a single blinded output spending `inputs`.
fn add_blinded(
    wallet: &mut Wallet,
    inputs: Vec<OutPoint>,
    input_type: OutputType,
    value: Amount,
    fee: Amount,
    tag: u32,
) -> Txid {
    let blind = BlindingFactor::random(&mut rand::thread_rng());
    let commitment = commit(&blind, value as u64).unwrap();
    let tx = Transaction {
        version: 2,
        lock_time: tag,
        fee,
        inputs: inputs.iter().map(|op| TxIn::Standard { prevout: *op }).collect(),
        outputs: vec![TxOut::Blinded { commitment, script: p2pkh(&[0x33; 20]), data: Vec::new(), range_proof: Vec::new() }],
    };
    let txid = tx.txid();
    let mut stored = StoredTransaction::new(tx);
    stored.insert_blind(0, blind);

    let mut record = TransactionRecord::new(1_700_000_000);
    record.inputs = inputs;
    record.fee = fee;
    record.set_input_type(input_type);
    record
        .insert_output(OutputRecord::new(OutputType::Blind, 0, value).with_flags(ORF_OWNED), false)
        .unwrap();
    wallet.add_to_record(txid, record, Some(stored)).unwrap();
    txid
}

fn external(seed: &str) -> OutPoint {
    OutPoint::new(blake3_hash(seed.as_bytes()), 0)
}

#[tokio::test]
async fn test_trace_reaches_plain_origin() {
    println!("🧪 Testing trace back to plain inputs...");

    let chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("tracer", &chain);
    let origin = external("plain-origin");
    let p = add_blinded(&mut wallet, vec![origin], OutputType::Standard, 5 * COIN, 0, 9_001);
    let t = add_blinded(&mut wallet, vec![OutPoint::new(p, 0)], OutputType::Blind, 4 * COIN, COIN, 9_002);
    let handles = vec![wallet.into_handle()];

    let before = metrics::TRACED_TRANSACTIONS.get();
    let report = trace_frozen_outputs(&handles, &chain, &[OutPoint::new(t, 0)]).unwrap();

    assert_eq!(report.nodes.len(), 2);
    assert!(report.nodes.contains_key(&t) && report.nodes.contains_key(&p));
    assert_eq!(report.plain_origins, vec![origin]);
    assert_eq!(report.total_traced_value, 4 * COIN);
    assert_eq!(report.plain_value, 5 * COIN);
    assert_eq!(report.unexplained_value, 0);
    assert!(report.warnings.is_empty(), "unexpected warnings: {:?}", report.warnings);

    let p_node = &report.nodes[&p];
    assert_eq!(p_node.input_type, OutputType::Standard);
    assert!(p_node.outputs[0].blind_known);
    assert_eq!(p_node.outputs[0].spent_by, Some(t));
    assert!(metrics::TRACED_TRANSACTIONS.get() >= before + 2);

    println!("✅ Trace stops at plain-funded transactions");
}

#[tokio::test]
async fn test_trace_missing_parent_is_unexplained() {
    println!("🧪 Testing trace with a missing parent...");

    let chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("orphaned", &chain);
    let missing = external("never-seen");
    let t = add_blinded(&mut wallet, vec![missing], OutputType::Blind, 3 * COIN, 0, 9_010);
    let handles = vec![wallet.into_handle()];

    let report = trace_frozen_outputs(&handles, &chain, &[OutPoint::new(t, 0)]).unwrap();

    assert_eq!(report.nodes.len(), 2);
    assert!(!report.nodes[&missing.txid].found);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == TraceWarningKind::MissingRecord && w.txid == missing.txid));
    assert_eq!(report.unexplained_value, 3 * COIN);

    println!("✅ Missing parents are reported and the walk continues");
}

#[tokio::test]
async fn test_trace_cycle_terminates() {
    println!("🧪 Testing trace over records that spend each other...");

    let chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("cyclic", &chain);
    let a: Txid = [0xaa; 32];
    let b: Txid = [0xbb; 32];
    for (txid, spends) in [(a, b), (b, a)] {
        let mut record = TransactionRecord::new(1_700_000_000);
        record.inputs = vec![OutPoint::new(spends, 0)];
        record.set_input_type(OutputType::Blind);
        record
            .insert_output(OutputRecord::new(OutputType::Blind, 0, COIN).with_flags(ORF_OWNED), false)
            .unwrap();
        wallet.add_to_record(txid, record, None).unwrap();
    }
    let handles = vec![wallet.into_handle()];

    let report = trace_frozen_outputs(&handles, &chain, &[OutPoint::new(a, 0)]).unwrap();

    assert_eq!(report.nodes.len(), 2);
    assert!(report.plain_origins.is_empty());
    assert_eq!(report.unexplained_value, COIN);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == TraceWarningKind::MissingStoredTransaction));

    println!("✅ Each transaction is expanded once");
}

#[tokio::test]
async fn test_trace_across_wallets() {
    println!("🧪 Testing trace across several wallets...");

    let chain = MemoryChain::new(100);
    let (_s1, mut first) = memory_wallet("first", &chain);
    let (_s2, mut second) = memory_wallet("second", &chain);
    let origin = external("shared-origin");
    let p = add_blinded(&mut first, vec![origin], OutputType::Standard, 2 * COIN, 0, 9_020);
    let t = add_blinded(&mut second, vec![OutPoint::new(p, 0)], OutputType::Blind, 2 * COIN, 0, 9_021);
    let handles = vec![first.into_handle(), second.into_handle()];

    let report = trace_frozen_outputs(&handles, &chain, &[OutPoint::new(t, 0)]).unwrap();

    assert_eq!(report.nodes[&p].wallets, vec!["first".to_string()]);
    assert_eq!(report.nodes[&t].wallets, vec!["second".to_string()]);
    assert_eq!(report.plain_origins, vec![origin]);
    assert_eq!(report.unexplained_value, 0);

    println!("✅ Records from every wallet join the trace");
}

#[tokio::test]
async fn test_trace_refuses_locked_wallet() {
    println!("🧪 Testing trace with a locked wallet...");

    let chain = MemoryChain::new(100);
    let (_s1, open) = memory_wallet("open", &chain);
    let (_s2, mut locked) = memory_wallet("vault", &chain);
    locked.lock();
    let handles = vec![open.into_handle(), locked.into_handle()];

    let err = trace_frozen_outputs(&handles, &chain, &[external("any")]).unwrap_err();
    assert!(matches!(err, WalletError::WalletLocked(ref name) if name == "vault"));

    println!("✅ Locked wallets stop the trace before any work");
}

#[tokio::test]
async fn test_list_frozen_outputs() {
    println!("🧪 Testing frozen output listing...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("frozen", &chain);
    let small = fund_blind(&mut wallet, &mut chain, 3 * COIN, Some(50));
    let large = fund_blind(&mut wallet, &mut chain, 20 * COIN, Some(51));
    let anon = fund_anon(&mut wallet, &mut chain, COIN, Some(52));
    let thawed = fund_blind(&mut wallet, &mut chain, 7 * COIN, Some(53));

    chain.frozen_blind_txs.insert(small.outpoint.txid);
    chain.frozen_blind_txs.insert(large.outpoint.txid);
    chain.whitelisted_blind.insert(large.outpoint);
    let anon_index = anon.anon_index.unwrap();
    chain.frozen_anon.insert(anon_index);
    chain.blacklisted_anon.insert(anon_index);

    let handles = vec![wallet.into_handle()];
    let listed = list_frozen_outputs(&handles, &chain, 5 * COIN).unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.iter().all(|f| f.outpoint != thawed.outpoint));

    let find = |op: &OutPoint| listed.iter().find(|f| f.outpoint == *op).unwrap();
    assert!(find(&small.outpoint).spendable, "under the taint limit");
    let big = find(&large.outpoint);
    assert!(big.whitelisted && big.spendable, "whitelisted regardless of value");
    let a = find(&anon.outpoint);
    assert_eq!(a.anon_index, Some(anon_index));
    assert!(a.blacklisted && !a.spendable);

    let strict = list_frozen_outputs(&handles, &chain, COIN).unwrap();
    let small_strict = strict.iter().find(|f| f.outpoint == small.outpoint).unwrap();
    assert!(!small_strict.spendable, "over the taint limit");
    assert_eq!(small_strict.wallet, "frozen");

    println!("✅ Frozen outputs carry their spendability");
}

#[tokio::test]
async fn test_frozen_outputs_in_one_transaction_split_on_threshold() {
    println!("🧪 Testing two frozen outputs of one transaction...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("split", &chain);

    let values = [COIN, 10 * COIN];
    let blinds: Vec<BlindingFactor> = values.iter().map(|_| BlindingFactor::random(&mut rand::thread_rng())).collect();
    let outputs = values
        .iter()
        .zip(&blinds)
        .map(|(v, b)| TxOut::Blinded {
            commitment: commit(b, *v as u64).unwrap(),
            script: p2pkh(&[0x44; 20]),
            data: Vec::new(),
            range_proof: Vec::new(),
        })
        .collect();
    let tx = Transaction {
        version: 2,
        lock_time: 9_030,
        fee: 0,
        inputs: vec![TxIn::Standard { prevout: external("split-origin") }],
        outputs,
    };
    let txid = tx.txid();
    let mut stored = StoredTransaction::new(tx);
    let mut record = TransactionRecord::new(1_700_000_000);
    for (n, (v, b)) in values.iter().zip(blinds).enumerate() {
        stored.insert_blind(n as u32, b);
        record
            .insert_output(OutputRecord::new(OutputType::Blind, n as u16, *v).with_flags(ORF_OWNED), false)
            .unwrap();
    }
    let hash = block_hash(60);
    chain.add_block(hash, 60);
    record.set_merkle_branch(hash, 0, 60, 1_700_000_060);
    wallet.add_to_record(txid, record, Some(stored)).unwrap();
    chain.frozen_blind_txs.insert(txid);

    let handles = vec![wallet.into_handle()];
    let listed = list_frozen_outputs(&handles, &chain, 5 * COIN).unwrap();
    assert_eq!(listed.len(), 2);
    let low = listed.iter().find(|f| f.outpoint == OutPoint::new(txid, 0)).unwrap();
    let high = listed.iter().find(|f| f.outpoint == OutPoint::new(txid, 1)).unwrap();
    assert!(low.spendable);
    assert!(!high.spendable && !high.whitelisted);

    println!("✅ Only the low-value output is spendable");
}

#[tokio::test]
async fn test_plain_change_does_not_explain_frozen_value() {
    println!("🧪 Testing plain change next to a shielded deposit...");

    let chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("inflated", &chain);

    let blind = BlindingFactor::random(&mut rand::thread_rng());
    let tx = Transaction {
        version: 2,
        lock_time: 9_040,
        fee: 0,
        inputs: vec![TxIn::Standard { prevout: external("rich-origin") }],
        outputs: vec![
            TxOut::Blinded {
                commitment: commit(&blind, (10 * COIN) as u64).unwrap(),
                script: p2pkh(&[0x55; 20]),
                data: Vec::new(),
                range_proof: Vec::new(),
            },
            TxOut::Plain { value: 1_000 * COIN, script: p2pkh(&[0x56; 20]) },
        ],
    };
    let funding = tx.txid();
    let mut stored = StoredTransaction::new(tx);
    stored.insert_blind(0, blind);
    let mut record = TransactionRecord::new(1_700_000_000);
    record.inputs = vec![external("rich-origin")];
    record.set_input_type(OutputType::Standard);
    record
        .insert_output(OutputRecord::new(OutputType::Blind, 0, 10 * COIN).with_flags(ORF_OWNED), false)
        .unwrap();
    record
        .insert_output(OutputRecord::new(OutputType::Standard, 1, 1_000 * COIN).with_flags(ORF_OWNED), false)
        .unwrap();
    wallet.add_to_record(funding, record, Some(stored)).unwrap();

    let t = add_blinded(&mut wallet, vec![OutPoint::new(funding, 0)], OutputType::Blind, 500 * COIN, 0, 9_041);
    let handles = vec![wallet.into_handle()];

    let report = trace_frozen_outputs(&handles, &chain, &[OutPoint::new(t, 0)]).unwrap();
    assert_eq!(report.total_traced_value, 500 * COIN);
    assert_eq!(report.plain_value, 10 * COIN, "only the shielded output entered the graph");
    assert_eq!(report.unexplained_value, 490 * COIN);

    println!("✅ Inflated frozen value stays unexplained");
}

#[tokio::test]
async fn test_trace_reads_anon_spends_from_key_images() {
    println!("🧪 Testing anonymous spend state from key images...");

    let mut chain = MemoryChain::new(100);
    fill_anon_set(&mut chain, 10);
    let (_store, mut wallet) = memory_wallet("ring-spends", &chain);
    let known = fund_anon(&mut wallet, &mut chain, 2 * COIN, Some(70));
    let unknown = fund_anon(&mut wallet, &mut chain, COIN, Some(71));

    let key_image = vec![0x6b; 33];
    let spender: Txid = [0xf1; 32];
    wallet.set_key_image(&known.outpoint, key_image.clone()).unwrap();
    chain.key_images.insert(key_image, spender);
    let handles = vec![wallet.into_handle()];

    let report = trace_frozen_outputs(&handles, &chain, &[known.outpoint, unknown.outpoint]).unwrap();

    let out = &report.nodes[&known.outpoint.txid].outputs[0];
    assert_eq!(out.anon_index, known.anon_index);
    assert!(out.spent);
    assert_eq!(out.spent_by, Some(spender));
    assert!(!report
        .warnings
        .iter()
        .any(|w| w.kind == TraceWarningKind::MissingKeyImage && w.txid == known.outpoint.txid));

    let out = &report.nodes[&unknown.outpoint.txid].outputs[0];
    assert!(!out.spent && out.spent_by.is_none());
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == TraceWarningKind::MissingKeyImage && w.txid == unknown.outpoint.txid && w.n == Some(0)));

    println!("✅ Key images resolve spends outside the wallets");
}

#[tokio::test]
async fn test_list_frozen_skips_anon_spent_on_chain() {
    println!("🧪 Testing frozen anonymous outputs already spent on chain...");

    let mut chain = MemoryChain::new(100);
    fill_anon_set(&mut chain, 10);
    let (_store, mut wallet) = memory_wallet("frozen-rings", &chain);
    let spent = fund_anon(&mut wallet, &mut chain, COIN, Some(72));
    let held = fund_anon(&mut wallet, &mut chain, COIN, Some(73));
    for f in [&spent, &held] {
        chain.frozen_anon.insert(f.anon_index.unwrap());
    }
    wallet.set_key_image(&spent.outpoint, vec![0x7c; 33]).unwrap();
    chain.key_images.insert(vec![0x7c; 33], [0xf2; 32]);
    let handles = vec![wallet.into_handle()];

    let listed = list_frozen_outputs(&handles, &chain, 5 * COIN).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].outpoint, held.outpoint);
    assert!(listed[0].spendable);

    println!("✅ Spent anonymous outputs drop out of the listing");
}

#[tokio::test]
async fn test_frozen_output_with_unknown_value_is_not_spendable() {
    println!("🧪 Testing a frozen output whose value was never recovered...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("opaque", &chain);

    let blind = BlindingFactor::random(&mut rand::thread_rng());
    let tx = Transaction {
        version: 2,
        lock_time: 9_050,
        fee: 0,
        inputs: vec![TxIn::Standard { prevout: external("opaque-origin") }],
        outputs: vec![TxOut::Blinded {
            commitment: commit(&blind, 0).unwrap(),
            script: p2pkh(&[0x57; 20]),
            data: Vec::new(),
            range_proof: Vec::new(),
        }],
    };
    let txid = tx.txid();
    let mut record = TransactionRecord::new(1_700_000_000);
    record
        .insert_output(OutputRecord::new(OutputType::Blind, 0, UNKNOWN_VALUE).with_flags(ORF_OWNED), false)
        .unwrap();
    wallet.add_to_record(txid, record, Some(StoredTransaction::new(tx))).unwrap();
    chain.frozen_blind_txs.insert(txid);
    let handles = vec![wallet.into_handle()];

    let listed = list_frozen_outputs(&handles, &chain, 5 * COIN).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].value, UNKNOWN_VALUE);
    assert!(!listed[0].spendable, "an unknown value is never under the limit");

    println!("✅ Unknown values are reported as not spendable");
}
