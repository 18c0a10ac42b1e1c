use crate::{
    bitcoind::{
        interface::BitcoinD,
        sync::{setup_watchonly_wallet, SyncWatch},
        BitcoindError, ChainClient, TxStatus,
    },
    registry::{RegistryError, VaultEvent, VaultRegistry, VaultSnapshot, VaultStatus},
    revocation::{GuardError, RevocationGuard},
    transactions::TransactionKind,
};

use revault_tx::bitcoin::{util::bip32::ChildNumber, Address, Amount, Script, Txid};

use std::{
    collections::HashMap,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

// How many chain events we may apply to a single vault in a poll
const MAX_EVENTS_PER_POLL: usize = 8;

// The confirmation height of the first transaction of this kind that is confirmed, along with
// its txid.
fn confirmed(
    snapshot: &VaultSnapshot,
    statuses: &HashMap<Txid, TxStatus>,
    kind: TransactionKind,
) -> Option<(Txid, u32)> {
    snapshot
        .tracked_txids(kind)
        .into_iter()
        .find_map(|txid| match statuses.get(&txid) {
            Some(TxStatus::Confirmed { height }) => Some((txid, *height)),
            _ => None,
        })
}

/// The next thing that happened on chain to this vault, if any.
fn next_event(
    snapshot: &VaultSnapshot,
    statuses: &HashMap<Txid, TxStatus>,
    tip_height: u32,
    min_conf: u32,
    csv: u32,
) -> Option<VaultEvent> {
    let depth = |txid: &Txid| {
        statuses
            .get(txid)
            .map(|s| s.depth(tip_height))
            .unwrap_or(0)
    };
    let confirmed_event = |kind| {
        confirmed(snapshot, statuses, kind)
            .map(|(txid, height)| VaultEvent::Confirmed { kind, txid, height })
    };
    let deposit_txid = snapshot.deposit_outpoint.txid;

    match snapshot.status {
        VaultStatus::Funding => match statuses.get(&deposit_txid) {
            Some(TxStatus::Confirmed { height }) if depth(&deposit_txid) >= min_conf => {
                Some(VaultEvent::DepositConfirmed { height: *height })
            }
            _ => None,
        },
        VaultStatus::Funded | VaultStatus::Securing | VaultStatus::Secured => {
            // We never record the Unvault of a vault that isn't secured. Whether it got
            // revoked since then is all we look for.
            let revoked = if snapshot.status == VaultStatus::Secured {
                None
            } else {
                confirmed_event(TransactionKind::Cancel)
                    .or_else(|| confirmed_event(TransactionKind::UnvaultEmergency))
            };
            revoked
                .or_else(|| confirmed_event(TransactionKind::Unvault))
                .or_else(|| confirmed_event(TransactionKind::Emergency))
                .or_else(|| {
                    if depth(&deposit_txid) < min_conf {
                        Some(VaultEvent::DepositUnconfirmed)
                    } else {
                        None
                    }
                })
        }
        VaultStatus::Unvaulting | VaultStatus::Unvaulted => {
            let unvault_height = match confirmed(snapshot, statuses, TransactionKind::Unvault) {
                Some((_, height)) => height,
                None => return Some(VaultEvent::Unconfirmed(TransactionKind::Unvault)),
            };

            confirmed_event(TransactionKind::Cancel)
                .or_else(|| confirmed_event(TransactionKind::UnvaultEmergency))
                .or_else(|| {
                    if snapshot.status == VaultStatus::Unvaulted {
                        confirmed_event(TransactionKind::Spend)
                    } else if tip_height + 1 >= unvault_height + csv {
                        Some(VaultEvent::Matured)
                    } else {
                        None
                    }
                })
        }
        VaultStatus::Canceling | VaultStatus::Spending | VaultStatus::EmergencyVaulting => {
            let kind = snapshot.final_kind?;
            let txid = snapshot.final_txid?;
            match depth(&txid) {
                0 => Some(VaultEvent::Unconfirmed(kind)),
                d if d >= min_conf => Some(VaultEvent::Buried(kind)),
                _ => None,
            }
        }
        VaultStatus::Spent | VaultStatus::Canceled | VaultStatus::EmergencyVaulted => None,
    }
}

// Get the status of all the transactions we track for this vault. Must not be called with any
// lock held.
fn tx_statuses(
    chain: &dyn ChainClient,
    snapshot: &VaultSnapshot,
) -> Result<HashMap<Txid, TxStatus>, BitcoindError> {
    let kinds = [
        TransactionKind::Unvault,
        TransactionKind::Cancel,
        TransactionKind::Emergency,
        TransactionKind::UnvaultEmergency,
        TransactionKind::Spend,
    ];
    let mut statuses = HashMap::new();

    let deposit_txid = snapshot.deposit_outpoint.txid;
    statuses.insert(deposit_txid, chain.tx_status(&deposit_txid)?);
    for kind in kinds.iter() {
        for txid in snapshot.tracked_txids(*kind) {
            if !statuses.contains_key(&txid) {
                statuses.insert(txid, chain.tx_status(&txid)?);
            }
        }
    }

    Ok(statuses)
}

// Apply what happened on chain to this vault, as far as we can get.
fn update_vault(
    registry: &VaultRegistry,
    guard: &RevocationGuard,
    mut snapshot: VaultSnapshot,
    statuses: &HashMap<Txid, TxStatus>,
    tip_height: u32,
) -> Result<(), GuardError> {
    let custodyd = registry.custodyd();
    let outpoint = snapshot.deposit_outpoint;

    for _ in 0..MAX_EVENTS_PER_POLL {
        let event = match next_event(
            &snapshot,
            statuses,
            tip_height,
            custodyd.min_conf,
            custodyd.factory.unvault_csv(),
        ) {
            Some(event) => event,
            None => break,
        };

        if let VaultEvent::Confirmed {
            kind: TransactionKind::Unvault,
            height,
            ..
        } = event
        {
            if snapshot.status != VaultStatus::Secured {
                return Err(guard.on_unsecured_unvault(&snapshot, height));
            }
        }

        let status = match registry.record_chain_event(&outpoint, event.clone()) {
            Ok(status) => status,
            // It was updated under our feet, we'll try again at the next poll
            Err(RegistryError::Transition(e)) => {
                log::warn!("Vault '{}': {}", outpoint, e);
                break;
            }
            Err(e) => return Err(e.into()),
        };

        match event {
            VaultEvent::Confirmed {
                kind: TransactionKind::Unvault,
                height,
                ..
            } => {
                let snapshot = registry.snapshot(&outpoint)?;
                guard.on_unvault_confirmed(&snapshot, height)?;
            }
            VaultEvent::Unconfirmed(TransactionKind::Unvault) => {
                guard.on_unvault_unconfirmed(&outpoint)
            }
            _ => {}
        }

        if status.is_terminal() {
            break;
        }
        snapshot = registry.snapshot(&outpoint)?;
    }

    Ok(())
}

/// Make sure the chain client watches all the addresses we may receive coins on, up to the gap
/// limit after the last used derivation index.
fn import_addresses(
    registry: &VaultRegistry,
    chain: &dyn ChainClient,
    imported_up_to: &mut u32,
) -> Result<(), GuardError> {
    let custodyd = registry.custodyd();
    let end = u32::from(registry.next_index()) + custodyd.gap_limit();
    if *imported_up_to >= end {
        return Ok(());
    }

    let mut addresses: Vec<Address> = Vec::with_capacity(2 * (end - *imported_up_to) as usize);
    for index in *imported_up_to..end {
        let index = ChildNumber::from(index);
        addresses.push(
            custodyd
                .factory
                .deposit_address(index)
                .map_err(RegistryError::from)?,
        );
        addresses.push(
            custodyd
                .factory
                .unvault_address(index)
                .map_err(RegistryError::from)?,
        );
    }
    log::debug!(
        "Importing deposit and Unvault addresses from index {} to {}",
        imported_up_to,
        end
    );
    chain.import_addresses(&addresses)?;
    *imported_up_to = end;

    Ok(())
}

/// Create a vault for any new coin paying to one of our deposit addresses.
fn discover_deposits(registry: &VaultRegistry, chain: &dyn ChainClient) -> Result<(), GuardError> {
    let custodyd = registry.custodyd();
    let end = u32::from(registry.next_index()) + custodyd.gap_limit();
    let deposit_scripts = (0..end)
        .map(|index| {
            let index = ChildNumber::from(index);
            custodyd
                .factory
                .deposit_address(index)
                .map(|addr| (addr.script_pubkey(), index))
        })
        .collect::<Result<HashMap<Script, ChildNumber>, _>>()
        .map_err(RegistryError::from)?;

    for utxo in chain.deposits()? {
        let index = match deposit_scripts.get(&utxo.txo.script_pubkey) {
            Some(index) => *index,
            None => continue,
        };

        match registry.create_vault(utxo.outpoint, Amount::from_sat(utxo.txo.value), index) {
            Ok(Some(_)) => log::info!(
                "Got a new deposit at '{}' ({} confirmations)",
                utxo.outpoint,
                utxo.confirmations
            ),
            Ok(None) => {}
            Err(RegistryError::Construction(e)) => {
                log::error!(
                    "Cannot create a vault for deposit '{}': '{}'",
                    utxo.outpoint,
                    e
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Poll the chain once: discover new deposits, update the vaults with what happened on chain
/// and drive the Cancel races.
pub fn poll_once(
    registry: &VaultRegistry,
    guard: &RevocationGuard,
    chain: &dyn ChainClient,
    imported_up_to: &mut u32,
) -> Result<(), GuardError> {
    let tip = chain.tip()?;
    if registry.tip().map(|t| t.hash) != Some(tip.hash) {
        log::debug!("New tip: {:?}", tip);
    }
    registry.set_tip(tip);

    import_addresses(registry, chain, imported_up_to)?;
    discover_deposits(registry, chain)?;

    // Gather the events first, then apply them.
    let mut updates = vec![];
    for snapshot in registry.snapshots() {
        let statuses = tx_statuses(chain, &snapshot)?;
        updates.push((snapshot, statuses));
    }
    let mut fatal = None;
    for (snapshot, statuses) in updates {
        let outpoint = snapshot.deposit_outpoint;
        if let Err(e) = update_vault(registry, guard, snapshot, &statuses, tip.height) {
            if e.is_fatal() {
                fatal.get_or_insert(e);
            } else {
                log::error!("Error updating vault '{}': '{}'", outpoint, e);
            }
        }
    }

    // The Cancel races of the other vaults go on regardless
    let ticked = guard.tick(chain, tip.height);
    match fatal {
        Some(e) => Err(e),
        None => ticked,
    }
}

// Check bitcoind's sync progress, and set up our watchonly wallet once it's done. The progress
// is only published as complete once the wallet is ready.
fn check_sync(
    registry: &VaultRegistry,
    bitcoind: &BitcoinD,
    watch: &mut SyncWatch,
    sync_progress: &RwLock<f64>,
    now: Instant,
) -> Result<(), BitcoindError> {
    let custodyd = registry.custodyd();
    let info = bitcoind.synchronization_info()?;
    let progress = watch.record(&info, custodyd.bitcoind_config.network, now);

    if progress >= 1.0 {
        setup_watchonly_wallet(custodyd, registry.wallet_id(), bitcoind)?;
        log::info!("bitcoind is synced");
    } else {
        log::info!("bitcoind sync progress: {:.3}%", progress * 100.0);
    }
    *sync_progress.write().unwrap() = progress;

    Ok(())
}

pub fn poller_main(
    registry: Arc<VaultRegistry>,
    guard: Arc<RevocationGuard>,
    bitcoind: Arc<BitcoinD>,
    sync_progress: Arc<RwLock<f64>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_poll = None;
    let mut sync_watch = SyncWatch::default();
    let mut imported_up_to = 0;
    let poll_interval = registry.custodyd().bitcoind_config.poll_interval_secs;

    // Polling bitcoind is inherently racy: the tip may change between two calls. Instead of
    // handling it everywhere, we propagate the errors and retry at the next poll.
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();

        if *sync_progress.read().unwrap() < 1.0 {
            if !sync_watch.due(now) {
                thread::sleep(Duration::from_millis(500));
            } else if let Err(e) =
                check_sync(&registry, &bitcoind, &mut sync_watch, &sync_progress, now)
            {
                log::error!("Error checking bitcoind sync: '{}'", e);
                sync_watch.postpone(now);
            }
            continue;
        }

        if let Some(last_poll) = last_poll {
            if now.duration_since(last_poll) < poll_interval {
                thread::sleep(Duration::from_millis(500));
                continue;
            }
        }
        last_poll = Some(now);

        if let Err(e) = poll_once(&registry, &guard, bitcoind.as_ref(), &mut imported_up_to) {
            if e.is_fatal() {
                log::error!("FATAL: {}. Stopping.", e);
                process::exit(1);
            }
            log::error!("Error while polling bitcoind: '{}'", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{
        dummy_custodyd, dummy_registry, sign_vault, test_datadir, MockChainClient, TestKeys,
    };

    use revault_tx::bitcoin::{OutPoint, TxOut};

    use std::{fs, path::PathBuf, str::FromStr};

    struct Setup {
        keys: TestKeys,
        registry: Arc<VaultRegistry>,
        guard: RevocationGuard,
        chain: MockChainClient,
        imported_up_to: u32,
        datadir: PathBuf,
    }

    impl Setup {
        fn new(tip: u32) -> Setup {
            let datadir = test_datadir();
            let keys = TestKeys::new(4, 2, 4);
            let registry = dummy_registry(dummy_custodyd(&keys, 18, datadir.clone()));
            let guard = RevocationGuard::new(registry.clone());

            Setup {
                keys,
                registry,
                guard,
                chain: MockChainClient::new(tip),
                imported_up_to: 0,
                datadir,
            }
        }

        fn poll(&mut self) -> Result<(), GuardError> {
            poll_once(
                &self.registry,
                &self.guard,
                &self.chain,
                &mut self.imported_up_to,
            )
        }

        fn deposit(&self, n: u8, index: u32, confirmations: i32) -> OutPoint {
            let outpoint = OutPoint::from_str(&format!("{}:0", format!("{:02x}", n).repeat(32)))
                .unwrap();
            let address = self
                .registry
                .custodyd()
                .factory
                .deposit_address(ChildNumber::from(index))
                .unwrap();
            self.chain.add_deposit(
                outpoint,
                TxOut {
                    value: 100_000_000,
                    script_pubkey: address.script_pubkey(),
                },
                confirmations,
            );
            outpoint
        }

        // Load everything again from the database, as after a restart
        fn restart(&mut self) {
            let custodyd = self.registry.custodyd().clone();
            self.registry = Arc::new(VaultRegistry::load(custodyd).unwrap());
            self.guard = RevocationGuard::new(self.registry.clone());
            self.imported_up_to = 0;
        }

        fn status(&self, outpoint: &OutPoint) -> VaultStatus {
            self.registry.snapshot(outpoint).unwrap().status
        }

        fn txid(&self, outpoint: &OutPoint, kind: TransactionKind) -> Txid {
            self.registry.snapshot(outpoint).unwrap().txids[&kind]
        }
    }

    impl Drop for Setup {
        fn drop(&mut self) {
            fs::remove_dir_all(&self.datadir).unwrap_or_else(|_| ());
        }
    }

    #[test]
    fn deposits_discovery() {
        let mut setup = Setup::new(200);

        setup.poll().unwrap();
        // Deposit and Unvault addresses up to the gap limit
        assert_eq!(setup.chain.imported().len(), 40);
        assert_eq!(setup.registry.vault_count(), 0);

        // An unconfirmed deposit at the third index, and a coin that isn't ours
        let outpoint = setup.deposit(1, 2, 0);
        setup.chain.add_deposit(
            OutPoint::from_str(&format!("{}:1", "ab".repeat(32))).unwrap(),
            TxOut {
                value: 100_000_000,
                script_pubkey: Script::new(),
            },
            3,
        );
        setup.poll().unwrap();
        assert_eq!(setup.registry.vault_count(), 1);
        assert_eq!(setup.status(&outpoint), VaultStatus::Funding);
        assert_eq!(setup.registry.next_index(), ChildNumber::from(3));
        // The gap limit moved along
        setup.poll().unwrap();
        assert_eq!(setup.chain.imported().len(), 46);

        // Confirmed, but not deep enough
        setup.chain.confirm(outpoint.txid, 200);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Funding);

        setup.chain.set_tip(205);
        setup.poll().unwrap();
        let snapshot = setup.registry.snapshot(&outpoint).unwrap();
        assert_eq!(snapshot.status, VaultStatus::Funded);
        assert_eq!(snapshot.blockheight, 200);

        // Reorged deeper than our confirmation requirement
        setup.chain.drop_tx(&outpoint.txid);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Funding);
        assert_eq!(setup.registry.vault_count(), 1);
    }

    #[test]
    fn unauthorized_unvault_is_canceled() {
        let mut setup = Setup::new(200);
        let outpoint = setup.deposit(1, 0, 6);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Funded);

        sign_vault(
            &setup.keys,
            &setup.registry,
            &outpoint,
            ChildNumber::from(0),
            &TransactionKind::REVOCATIONS,
        );
        assert_eq!(setup.status(&outpoint), VaultStatus::Secured);

        // Someone broadcast the Unvault, it confirms at H = 201
        let unvault_txid = setup.txid(&outpoint, TransactionKind::Unvault);
        let cancel_txid = setup.txid(&outpoint, TransactionKind::Cancel);
        setup.chain.set_tip(201);
        setup.chain.confirm(unvault_txid, 201);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Unvaulting);
        // We answered right away with the Cancel
        let broadcasted = setup.chain.broadcasted();
        assert_eq!(broadcasted.len(), 1);
        assert_eq!(broadcasted[0].txid(), cancel_txid);

        // It confirms before H + CSV
        setup.chain.set_tip(203);
        setup.chain.confirm(cancel_txid, 202);
        setup.poll().unwrap();
        let snapshot = setup.registry.snapshot(&outpoint).unwrap();
        assert_eq!(snapshot.status, VaultStatus::Canceling);
        assert_eq!(snapshot.final_txid, Some(cancel_txid));

        // Buried, the vault is done
        setup.chain.set_tip(207);
        setup.poll().unwrap();
        assert!(matches!(
            setup.registry.snapshot(&outpoint),
            Err(RegistryError::UnknownVault(_))
        ));
        assert_eq!(setup.chain.broadcasted().len(), 1);
    }

    #[test]
    fn unvault_without_revocations_is_fatal() {
        let mut setup = Setup::new(200);
        let outpoint = setup.deposit(1, 0, 6);
        setup.poll().unwrap();

        setup
            .chain
            .confirm(setup.txid(&outpoint, TransactionKind::Unvault), 200);
        let err = setup.poll().unwrap_err();
        assert!(matches!(err, GuardError::SafetyViolation(o) if o == outpoint));
        assert!(err.is_fatal());
        assert!(setup.chain.broadcasted().is_empty());
        assert_eq!(setup.status(&outpoint), VaultStatus::Funded);

        // We can start again, and it is reported again as long as it is there
        setup.restart();
        assert_eq!(setup.status(&outpoint), VaultStatus::Funded);
        assert!(matches!(
            setup.poll(),
            Err(GuardError::SafetyViolation(o)) if o == outpoint
        ));

        // Until the other participants cancel it
        let cancel_txid = setup.txid(&outpoint, TransactionKind::Cancel);
        setup.chain.set_tip(202);
        setup.chain.confirm(cancel_txid, 201);
        setup.poll().unwrap();
        let snapshot = setup.registry.snapshot(&outpoint).unwrap();
        assert_eq!(snapshot.status, VaultStatus::Canceling);
        assert_eq!(snapshot.final_txid, Some(cancel_txid));
        assert!(setup.chain.broadcasted().is_empty());
    }

    #[test]
    fn violation_does_not_stop_other_races() {
        let mut setup = Setup::new(200);
        let unsecured = setup.deposit(1, 0, 6);
        let secured = setup.deposit(2, 1, 6);
        setup.poll().unwrap();
        sign_vault(
            &setup.keys,
            &setup.registry,
            &secured,
            ChildNumber::from(1),
            &TransactionKind::REVOCATIONS,
        );

        // Both get unvaulted in the same block
        setup
            .chain
            .confirm(setup.txid(&unsecured, TransactionKind::Unvault), 200);
        setup
            .chain
            .confirm(setup.txid(&secured, TransactionKind::Unvault), 200);
        assert!(matches!(
            setup.poll(),
            Err(GuardError::SafetyViolation(o)) if o == unsecured
        ));

        // The secured one is still canceled
        assert_eq!(setup.status(&secured), VaultStatus::Unvaulting);
        let broadcasted = setup.chain.broadcasted();
        assert_eq!(broadcasted.len(), 1);
        assert_eq!(
            broadcasted[0].txid(),
            setup.txid(&secured, TransactionKind::Cancel)
        );
    }

    #[test]
    fn authorized_unvault_matures_and_reorgs() {
        let mut setup = Setup::new(200);
        let outpoint = setup.deposit(1, 0, 6);
        setup.poll().unwrap();
        sign_vault(
            &setup.keys,
            &setup.registry,
            &outpoint,
            ChildNumber::from(0),
            &[
                TransactionKind::Cancel,
                TransactionKind::Emergency,
                TransactionKind::UnvaultEmergency,
                TransactionKind::Unvault,
            ],
        );
        setup.registry.mark_replicated(&outpoint).unwrap();
        setup.guard.authorize_unvault(&outpoint).unwrap();

        let unvault_txid = setup.txid(&outpoint, TransactionKind::Unvault);
        setup.chain.confirm(unvault_txid, 200);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Unvaulting);
        assert!(setup.chain.broadcasted().is_empty());

        // The Spend can be mined in the next block
        setup.chain.set_tip(216);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Unvaulting);
        setup.chain.set_tip(217);
        setup.poll().unwrap();
        assert_eq!(setup.status(&outpoint), VaultStatus::Unvaulted);
        assert!(setup.chain.broadcasted().is_empty());

        // The Unvault is reorged out
        setup.chain.drop_tx(&unvault_txid);
        setup.poll().unwrap();
        let snapshot = setup.registry.snapshot(&outpoint).unwrap();
        assert_eq!(snapshot.status, VaultStatus::Secured);
        assert_eq!(snapshot.unvault_height, None);
    }

    #[test]
    fn unreachable_chain_is_not_fatal() {
        let mut setup = Setup::new(200);
        let outpoint = setup.deposit(1, 0, 6);
        setup.poll().unwrap();

        setup.chain.set_unreachable(true);
        let err = setup.poll().unwrap_err();
        assert!(matches!(err, GuardError::Chain(_)));
        assert!(!err.is_fatal());
        assert_eq!(setup.status(&outpoint), VaultStatus::Funded);

        setup.chain.set_unreachable(false);
        setup.poll().unwrap();
    }
}
