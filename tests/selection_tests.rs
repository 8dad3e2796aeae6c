// Coin selection and ring decoy selection tests.

mod common;

use common::*;
use ctwallet::chain::MemoryChain;
use ctwallet::coin_control::{CoinControl, InputData, MixinSelectionMode};
use ctwallet::config::{Frozen, WalletSettings};
use ctwallet::crypto::{commit, BlindingFactor};
use ctwallet::error::WalletError;
use ctwallet::records::{OutputType, COIN, ORF_FROM, ORF_LOCKED};
use ctwallet::selection::{available_coins, pick_hiding_outputs, select_inputs, RingMatrix, Selection};
use ctwallet::transaction::OutPoint;
use ctwallet::wallet::Wallet;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;

fn select(
    wallet: &Wallet,
    chain: &MemoryChain,
    frozen: &Frozen,
    output_type: OutputType,
    target: i64,
    cc: &CoinControl,
) -> ctwallet::error::Result<Selection> {
    let mut rng = StdRng::seed_from_u64(99);
    select_inputs(wallet, chain, &settings(), frozen, output_type, target, cc, &mut rng)
}

fn outpoints(sel: &Selection) -> HashSet<OutPoint> {
    sel.coins.iter().map(|c| c.outpoint).collect()
}

#[tokio::test]
async fn test_depth_window_is_inclusive() {
    println!("🧪 Testing depth filter...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("depth-select", &chain);
    let confirmed = fund_blind(&mut wallet, &mut chain, COIN, Some(90));
    let own_change = fund_shielded(&mut wallet, &mut chain, OutputType::Blind, COIN, None, ORF_FROM);

    let mut cc = CoinControl::new(OutputType::Blind);
    cc.min_depth = 0;
    cc.max_depth = 0;
    let sel = select(&wallet, &chain, &frozen(), OutputType::Blind, 1, &cc).unwrap();
    assert_eq!(outpoints(&sel), HashSet::from([own_change.outpoint]), "depth 0..=0 picks only unconfirmed");

    cc.min_depth = 11;
    cc.max_depth = 11;
    let sel = select(&wallet, &chain, &frozen(), OutputType::Blind, 1, &cc).unwrap();
    assert_eq!(outpoints(&sel), HashSet::from([confirmed.outpoint]), "depth bounds are inclusive");

    cc.min_depth = 12;
    cc.max_depth = 20;
    let err = select(&wallet, &chain, &frozen(), OutputType::Blind, 1, &cc).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { available: 0, .. }));

    // Unconfirmed deposits from others are unsafe unless asked for.
    let foreign = fund_blind(&mut wallet, &mut chain, COIN, None);
    let cc = CoinControl::new(OutputType::Blind);
    let listed: HashSet<OutPoint> = available_coins(&wallet, &chain, &settings(), &frozen(), OutputType::Blind, &cc)
        .into_iter()
        .map(|c| c.outpoint)
        .collect();
    assert!(!listed.contains(&foreign.outpoint));
    let mut cc = CoinControl::new(OutputType::Blind);
    cc.include_unsafe_inputs = true;
    let listed: HashSet<OutPoint> = available_coins(&wallet, &chain, &settings(), &frozen(), OutputType::Blind, &cc)
        .into_iter()
        .map(|c| c.outpoint)
        .collect();
    assert!(listed.contains(&foreign.outpoint));

    println!("✅ Depth filter is inclusive");
}

#[tokio::test]
async fn test_insufficient_funds_reports_totals() {
    println!("🧪 Testing insufficient funds...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("poor", &chain);
    fund_blind(&mut wallet, &mut chain, COIN, Some(50));
    fund_blind(&mut wallet, &mut chain, COIN, Some(51));
    let failures_before = ctwallet::metrics::SELECTION_FAILURES.get();

    let cc = CoinControl::new(OutputType::Blind);
    let err = select(&wallet, &chain, &frozen(), OutputType::Blind, 5 * COIN, &cc).unwrap_err();
    match err {
        WalletError::InsufficientFunds { requested, available } => {
            assert_eq!(requested, 5 * COIN);
            assert_eq!(available, 2 * COIN);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err_is_funding(&select(&wallet, &chain, &frozen(), OutputType::Blind, 3 * COIN, &cc)));
    assert!(ctwallet::metrics::SELECTION_FAILURES.get() > failures_before);

    println!("✅ Shortfall reported with totals");
}

fn err_is_funding(r: &ctwallet::error::Result<Selection>) -> bool {
    matches!(r, Err(e) if e.is_retryable())
}

#[tokio::test]
async fn test_largest_first_and_preselection() {
    println!("🧪 Testing selection order...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("order", &chain);
    let one = fund_blind(&mut wallet, &mut chain, COIN, Some(60));
    let five = fund_blind(&mut wallet, &mut chain, 5 * COIN, Some(61));
    let two = fund_blind(&mut wallet, &mut chain, 2 * COIN, Some(62));

    let cc = CoinControl::new(OutputType::Blind);
    let sel = select(&wallet, &chain, &frozen(), OutputType::Blind, 4 * COIN, &cc).unwrap();
    assert_eq!(outpoints(&sel), HashSet::from([five.outpoint]));
    assert_eq!(sel.total, 5 * COIN);
    let coin = &sel.coins[0];
    assert!(ctwallet::crypto::verify_commitment(&coin.commitment.unwrap(), &coin.blind, coin.value as u64));

    let mut cc = CoinControl::new(OutputType::Blind);
    cc.select(one.outpoint);
    let sel = select(&wallet, &chain, &frozen(), OutputType::Blind, 2 * COIN, &cc).unwrap();
    assert_eq!(sel.coins[0].outpoint, one.outpoint, "preselected inputs come first");
    assert!(sel.total >= 2 * COIN);

    cc.allow_other_inputs = false;
    cc.select(two.outpoint);
    let sel = select(&wallet, &chain, &frozen(), OutputType::Blind, 2 * COIN, &cc).unwrap();
    assert_eq!(outpoints(&sel), HashSet::from([one.outpoint, two.outpoint]));
    let err = select(&wallet, &chain, &frozen(), OutputType::Blind, 4 * COIN, &cc).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }), "only selected inputs allowed");

    println!("✅ Selection order respected");
}

#[tokio::test]
async fn test_locked_coins_and_locked_outputs() {
    println!("🧪 Testing locked coins...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("locked", &chain);
    let deposit = fund_blind(&mut wallet, &mut chain, COIN, Some(80));
    wallet.lock_coin(deposit.outpoint).unwrap();

    let mut cc = CoinControl::new(OutputType::Blind);
    let err = select(&wallet, &chain, &frozen(), OutputType::Blind, COIN / 2, &cc).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }), "locked coin is not spendable");
    cc.allow_locked = true;
    assert!(select(&wallet, &chain, &frozen(), OutputType::Blind, COIN / 2, &cc).is_ok());

    // An output that needs the wallet unlocked.
    let (_store, mut wallet) = memory_wallet("needs-unlock", &chain);
    let guarded = fund_shielded(&mut wallet, &mut chain, OutputType::Blind, COIN, Some(81), ORF_LOCKED);
    wallet.lock();
    let cc = CoinControl::new(OutputType::Blind);
    let err = select(&wallet, &chain, &frozen(), OutputType::Blind, COIN / 2, &cc).unwrap_err();
    assert!(matches!(err, WalletError::LockedOutputRequiresUnlock(op) if op == guarded.outpoint));
    wallet.unlock();
    assert!(select(&wallet, &chain, &frozen(), OutputType::Blind, COIN / 2, &cc).is_ok());

    println!("✅ Locks respected");
}

#[tokio::test]
async fn test_frozen_blinded_outputs() {
    println!("🧪 Testing frozen blinded outputs...");

    let mut chain = MemoryChain::new(100);
    let (_store, mut wallet) = memory_wallet("frozen", &chain);
    let deposit = fund_blind(&mut wallet, &mut chain, 3 * COIN, Some(70));
    chain.frozen_blind_txs.insert(deposit.outpoint.txid);

    let mut cc = CoinControl::new(OutputType::Blind);
    assert!(select(&wallet, &chain, &frozen(), OutputType::Blind, COIN, &cc).is_err(), "frozen excluded by default");

    cc.spend_frozen_blinded = true;
    assert!(select(&wallet, &chain, &frozen(), OutputType::Blind, COIN, &cc).is_err(), "tainted needs its own flag");

    cc.include_tainted_frozen = true;
    let under = Frozen { max_tainted_value_out: 5 * COIN };
    assert!(select(&wallet, &chain, &under, OutputType::Blind, COIN, &cc).is_ok(), "below threshold is spendable");
    let over = Frozen { max_tainted_value_out: 2 * COIN };
    assert!(select(&wallet, &chain, &over, OutputType::Blind, COIN, &cc).is_err(), "above threshold is not");

    chain.whitelisted_blind.insert(deposit.outpoint);
    cc.include_tainted_frozen = false;
    assert!(select(&wallet, &chain, &over, OutputType::Blind, COIN, &cc).is_ok(), "whitelist overrides the threshold");

    println!("✅ Frozen policy enforced");
}

#[tokio::test]
async fn test_anon_selection_skips_blacklisted() {
    println!("🧪 Testing anonymous output eligibility...");

    let mut chain = MemoryChain::new(100);
    fill_anon_set(&mut chain, 10);
    let (_store, mut wallet) = memory_wallet("anon", &chain);
    let good = fund_anon(&mut wallet, &mut chain, COIN, Some(60));
    let bad = fund_anon(&mut wallet, &mut chain, COIN, Some(61));
    chain.blacklisted_anon.insert(bad.anon_index.unwrap());

    let cc = CoinControl::new(OutputType::Anon);
    let sel = select(&wallet, &chain, &frozen(), OutputType::Anon, COIN / 2, &cc).unwrap();
    assert_eq!(outpoints(&sel), HashSet::from([good.outpoint]));
    assert_eq!(sel.coins[0].anon_index, good.anon_index);
    let err = select(&wallet, &chain, &frozen(), OutputType::Anon, 2 * COIN, &cc).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { available, .. } if available == COIN));

    println!("✅ Blacklisted anonymous outputs are never selected");
}

#[tokio::test]
async fn test_external_input_data() {
    println!("🧪 Testing caller-supplied input data...");

    let chain = MemoryChain::new(10);
    let (_store, wallet) = memory_wallet("external", &chain);
    let mut rng = StdRng::seed_from_u64(1);
    let blind = BlindingFactor::random(&mut rng);
    let outpoint = OutPoint::new([0xee; 32], 3);

    let mut cc = CoinControl::new(OutputType::Blind);
    cc.set_input_data(outpoint, InputData::shielded(OutputType::Blind, 4 * COIN, blind.clone(), commit(&blind, (4 * COIN) as u64).unwrap()));
    let sel = select(&wallet, &chain, &frozen(), OutputType::Blind, COIN, &cc).unwrap();
    assert_eq!(sel.coins.len(), 1);
    assert!(sel.coins[0].external);
    assert_eq!(sel.total, 4 * COIN);

    let mut cc = CoinControl::new(OutputType::Blind);
    cc.set_input_data(outpoint, InputData::shielded(OutputType::Blind, 4 * COIN, blind.clone(), commit(&blind, 1).unwrap()));
    let err = select(&wallet, &chain, &frozen(), OutputType::Blind, COIN, &cc).unwrap_err();
    assert!(matches!(err, WalletError::CommitmentMismatch(_)));

    println!("✅ External inputs verified before use");
}

fn window_settings() -> WalletSettings {
    WalletSettings { rct_recent_window: 100, rct_nearby_window: 50, ..settings() }
}

fn check_ring(ring: &RingMatrix, reals: &[i64], chain: &MemoryChain, lo: i64, hi: i64) {
    assert_eq!(ring.rows.len(), reals.len());
    for (row, real) in ring.rows.iter().zip(reals) {
        assert_eq!(row.len(), ring.ring_size);
        assert_eq!(row[ring.secret_column], *real, "real index sits in the secret column");
    }
    for r in 0..ring.rows.len() {
        let decoys: Vec<i64> = ring.decoys(r).collect();
        let distinct: HashSet<i64> = decoys.iter().copied().collect();
        assert_eq!(distinct.len(), decoys.len(), "decoys distinct within a row");
        for d in decoys {
            assert!(!reals.contains(&d), "decoy {} equals a real index", d);
            assert!(!chain.blacklisted_anon.contains(&d), "decoy {} is blacklisted", d);
            assert!((lo..=hi).contains(&d), "decoy {} outside {}..={}", d, lo, hi);
        }
    }
}

#[tokio::test]
async fn test_mixin_modes() {
    println!("🧪 Testing mixin selection modes...");

    let mut chain = MemoryChain::new(100);
    fill_anon_set(&mut chain, 1_000);
    for i in (3..=1_000).step_by(7) {
        chain.blacklisted_anon.insert(i);
    }
    let s = window_settings();
    let mut rng = StdRng::seed_from_u64(42);

    let reals = [950, 960];
    let ring = pick_hiding_outputs(&chain, &s, &reals, 5, MixinSelectionMode::Recent, &[], &mut rng).unwrap();
    check_ring(&ring, &reals, &chain, 901, 1_000);

    let reals = [500];
    let ring = pick_hiding_outputs(&chain, &s, &reals, 7, MixinSelectionMode::Nearby, &[], &mut rng).unwrap();
    check_ring(&ring, &reals, &chain, 450, 550);

    let reals = [20, 700, 999];
    let ring = pick_hiding_outputs(&chain, &s, &reals, 11, MixinSelectionMode::FullRange, &[], &mut rng).unwrap();
    check_ring(&ring, &reals, &chain, 1, 1_000);

    let reals = [5];
    let ring = pick_hiding_outputs(&chain, &s, &reals, 5, MixinSelectionMode::Debug, &[11, 20, 30, 40], &mut rng).unwrap();
    assert_eq!(ring.decoys(0).collect::<Vec<_>>(), vec![11, 20, 30, 40], "debug mode uses the given mixins");

    let bad = pick_hiding_outputs(&chain, &s, &reals, 5, MixinSelectionMode::Debug, &[11, 20, 24, 40], &mut rng);
    assert!(matches!(bad, Err(WalletError::Validation(_))), "blacklisted debug mixin rejected");
    let short = pick_hiding_outputs(&chain, &s, &reals, 5, MixinSelectionMode::Debug, &[11, 20], &mut rng);
    assert!(matches!(short, Err(WalletError::InsufficientMixins { .. })));

    println!("✅ Every mode yields valid rings");
}

#[tokio::test]
async fn test_large_pool_is_sampled() {
    println!("🧪 Testing decoy sampling on a large index space...");

    let mut chain = MemoryChain::new(100);
    chain.anon_count = 500_000;
    chain.blacklisted_anon.extend(1..=1_000);
    let mut rng = StdRng::seed_from_u64(4);
    let reals = [250_000];
    let ring =
        pick_hiding_outputs(&chain, &settings(), &reals, 16, MixinSelectionMode::FullRange, &[], &mut rng).unwrap();
    check_ring(&ring, &reals, &chain, 1, 500_000);

    println!("✅ Sampling path produces valid rings");
}

#[tokio::test]
async fn test_ring_errors() {
    println!("🧪 Testing ring construction errors...");

    let mut chain = MemoryChain::new(100);
    fill_anon_set(&mut chain, 3);
    let mut rng = StdRng::seed_from_u64(2);
    let shortages_before = ctwallet::metrics::MIXIN_SHORTAGES.get();

    let err = pick_hiding_outputs(&chain, &settings(), &[2], 5, MixinSelectionMode::Recent, &[], &mut rng).unwrap_err();
    assert!(matches!(err, WalletError::InsufficientMixins { needed: 4, available: 2 }));
    assert!(ctwallet::metrics::MIXIN_SHORTAGES.get() > shortages_before);

    let err = pick_hiding_outputs(&chain, &settings(), &[2], 2, MixinSelectionMode::Recent, &[], &mut rng).unwrap_err();
    assert!(matches!(err, WalletError::Validation(_)), "ring size below the minimum");

    let err = pick_hiding_outputs(&chain, &settings(), &[9], 3, MixinSelectionMode::FullRange, &[], &mut rng).unwrap_err();
    assert!(matches!(err, WalletError::Validation(_)), "real index outside the chain");

    let too_many = WalletSettings { max_anon_inputs: 1, ..settings() };
    let err = pick_hiding_outputs(&chain, &too_many, &[1, 2], 3, MixinSelectionMode::FullRange, &[], &mut rng).unwrap_err();
    assert!(matches!(err, WalletError::Validation(_)));

    println!("✅ Ring errors reported");
}

#[tokio::test]
async fn test_anon_outputs_spent_on_chain_are_skipped() {
    println!("🧪 Testing anonymous outputs whose key image is on chain...");

    let mut chain = MemoryChain::new(100);
    fill_anon_set(&mut chain, 20);
    let (_store, mut wallet) = memory_wallet("key-images", &chain);
    let spent = fund_anon(&mut wallet, &mut chain, 2 * COIN, Some(60));
    let fresh = fund_anon(&mut wallet, &mut chain, 3 * COIN, Some(61));
    let blind = fund_blind(&mut wallet, &mut chain, COIN, Some(62));

    let key_image = vec![0x4b; 33];
    wallet.set_key_image(&spent.outpoint, key_image.clone()).unwrap();
    wallet.set_key_image(&fresh.outpoint, vec![0x4c; 33]).unwrap();
    chain.key_images.insert(key_image, [0xee; 32]);

    let cc = CoinControl::new(OutputType::Anon);
    let listed: HashSet<OutPoint> = available_coins(&wallet, &chain, &settings(), &frozen(), OutputType::Anon, &cc)
        .into_iter()
        .map(|c| c.outpoint)
        .collect();
    assert_eq!(listed, HashSet::from([fresh.outpoint]));

    let sel = select(&wallet, &chain, &frozen(), OutputType::Anon, COIN, &cc).unwrap();
    assert_eq!(sel.coins.len(), 1);
    assert_eq!(sel.coins[0].key_image.as_deref(), Some(&[0x4c; 33][..]));

    let err = wallet.set_key_image(&blind.outpoint, vec![0x01; 33]).unwrap_err();
    assert!(matches!(err, WalletError::Validation(_)), "blinded outputs have no key image: {:?}", err);
    let err = wallet.set_key_image(&fresh.outpoint, Vec::new()).unwrap_err();
    assert!(matches!(err, WalletError::Validation(_)));

    println!("✅ Outputs already spent on chain are never offered");
}
