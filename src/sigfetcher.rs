///! Background thread that will poll the coordinator for signatures
use crate::{
    communication::{CommunicationError, CoordinatorClient, SigTarget, WatchtowerClient},
    registry::{PendingCollection, RegistryError, VaultRegistry},
    threadmessages::SigFetcherMessageOut,
};

use std::{
    sync::{mpsc, Arc},
    thread, time,
};

#[derive(Debug)]
pub enum SignatureFetcherError {
    Registry(RegistryError),
    Communication(CommunicationError),
    ChannelDisconnected,
}

impl std::fmt::Display for SignatureFetcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Registry(ref e) => write!(f, "Registry error in sig fetcher thread: '{}'", e),
            Self::Communication(ref e) => {
                write!(f, "Communication error in sig fetcher thread: '{}'", e)
            }
            Self::ChannelDisconnected => {
                write!(f, "Channel disconnected error in sig fetcher thread")
            }
        }
    }
}

impl std::error::Error for SignatureFetcherError {}

impl From<RegistryError> for SignatureFetcherError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<CommunicationError> for SignatureFetcherError {
    fn from(e: CommunicationError) -> Self {
        Self::Communication(e)
    }
}

// Fetch the signatures the coordinator has for this transaction and record the new ones. If
// the coordinator misses some of our own signatures, send them.
fn sync_sigs(
    registry: &VaultRegistry,
    coordinator: &dyn CoordinatorClient,
    pending: &PendingCollection,
) -> Result<(), SignatureFetcherError> {
    let target = SigTarget {
        deposit_outpoint: pending.deposit_outpoint,
        kind: pending.kind,
        txid: pending.txid,
    };
    let signatures = coordinator.fetch(&target)?;

    for (signer, sig) in signatures.iter() {
        if pending.signatures.get(signer) == Some(sig) {
            continue;
        }

        log::debug!(
            "Adding {} signature for pubkey '{}' for vault '{}'",
            pending.kind,
            signer,
            pending.deposit_outpoint
        );
        match registry.record_signature(&pending.deposit_outpoint, pending.kind, *signer, *sig) {
            Ok(_) => {}
            // The coordinator is untrusted, it may send garbage. It was logged already.
            Err(RegistryError::Signature(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let our_keys = registry.custodyd().our_keys_at(pending.derivation_index);
    for key in our_keys {
        if signatures.contains_key(&key) {
            continue;
        }
        if let Some(our_sig) = pending.signatures.get(&key) {
            log::info!(
                "Coordinator didn't have our signature for {} transaction '{}', sending",
                pending.kind,
                pending.txid
            );
            coordinator.publish(&target, key, our_sig)?;
        }
    }

    Ok(())
}

/// Poll the coordinator for the signatures of all the transactions we are still collecting.
pub fn fetch_all_signatures(
    registry: &VaultRegistry,
    coordinator: &dyn CoordinatorClient,
) -> Result<(), SignatureFetcherError> {
    for pending in registry.pending_collections() {
        log::debug!(
            "Syncing {} signatures for {}",
            pending.kind,
            pending.deposit_outpoint
        );
        match sync_sigs(registry, coordinator, &pending) {
            Ok(()) => {}
            // The vault may have been archived in the meantime
            Err(SignatureFetcherError::Registry(RegistryError::UnknownVault(_))) => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Send the revocation signatures of the newly secured vaults to our watchtowers.
pub fn replicate_revocations(registry: &VaultRegistry, watchtowers: &dyn WatchtowerClient) {
    for sigs in registry.unreplicated_vaults() {
        log::debug!(
            "Sharing revocation signatures with watchtowers for vault at '{}'",
            sigs.deposit_outpoint
        );
        if let Err(e) = watchtowers.replicate(&sigs) {
            log::warn!(
                "Error sharing revocation signatures of vault '{}' with watchtowers: '{}'",
                sigs.deposit_outpoint,
                e
            );
            continue;
        }
        if let Err(e) = registry.mark_replicated(&sigs.deposit_outpoint) {
            log::error!(
                "Error marking vault '{}' as replicated: '{}'",
                sigs.deposit_outpoint,
                e
            );
        }
    }
}

// Poll the Coordinator for signatures indefinitely.
pub fn signature_fetcher_loop(
    rx: mpsc::Receiver<SigFetcherMessageOut>,
    registry: Arc<VaultRegistry>,
    coordinator: Arc<dyn CoordinatorClient>,
    watchtowers: Arc<dyn WatchtowerClient>,
) -> Result<(), SignatureFetcherError> {
    let poll_interval = registry.custodyd().coordinator_poll_interval;
    let mut last_poll: Option<time::Instant> = None;

    log::info!("Signature fetcher thread started.");

    loop {
        // Process any message from master first
        match rx.try_recv() {
            Ok(SigFetcherMessageOut::Shutdown) => {
                log::info!("Signature fetcher thread received shutdown. Exiting.");
                return Ok(());
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => {
                return Err(SignatureFetcherError::ChannelDisconnected);
            }
        }

        // If enough time has elapsed, poll the sigs
        if last_poll.map(|l| l.elapsed() >= poll_interval).unwrap_or(true) {
            log::debug!("Starting to poll for new signatures.");
            let before_polling = time::Instant::now();

            fetch_all_signatures(&registry, coordinator.as_ref()).unwrap_or_else(|e| {
                log::warn!("Error while fetching signatures: '{}'", e);
            });
            replicate_revocations(&registry, watchtowers.as_ref());

            let now = time::Instant::now();
            last_poll = Some(now);
            log::debug!(
                "Polling signatures took {} seconds.",
                now.duration_since(before_polling).as_secs()
            );
        }

        // Avoid clogging the CPU by sleeping for a while
        thread::sleep(time::Duration::from_millis(500));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::VaultEvent,
        transactions::TransactionKind,
        utils::test_utils::{
            dummy_custodyd, dummy_outpoint, dummy_registry, test_datadir, MockCoordinator,
            MockWatchtowers, TestKeys,
        },
    };

    use revault_tx::bitcoin::{secp256k1, util::bip32::ChildNumber, Amount, OutPoint};

    use std::{fs, path::PathBuf};

    struct Setup {
        keys: TestKeys,
        registry: Arc<VaultRegistry>,
        outpoint: OutPoint,
        datadir: PathBuf,
    }

    impl Drop for Setup {
        fn drop(&mut self) {
            fs::remove_dir_all(&self.datadir).unwrap_or_else(|_| ());
        }
    }

    fn setup() -> Setup {
        let datadir = test_datadir();
        let keys = TestKeys::new(4, 2, 4);
        let registry = dummy_registry(dummy_custodyd(&keys, 18, datadir.clone()));
        let outpoint = dummy_outpoint(7);
        registry
            .create_vault(outpoint, Amount::from_sat(100_000_000), ChildNumber::from(0))
            .unwrap()
            .unwrap();
        registry
            .record_chain_event(&outpoint, VaultEvent::DepositConfirmed { height: 100 })
            .unwrap();

        Setup {
            keys,
            registry,
            outpoint,
            datadir,
        }
    }

    // The other stakeholders' signatures of this kind, as the coordinator would relay them.
    fn relay_others(setup: &Setup, coordinator: &MockCoordinator, kind: TransactionKind) {
        let secp = secp256k1::Secp256k1::new();
        let template = setup.registry.template(&setup.outpoint, kind).unwrap();
        for i in 1..4 {
            let (pk, sig) =
                setup
                    .keys
                    .sign_stakeholder(&secp, i, ChildNumber::from(0), &template);
            coordinator.inject(template.txid(), pk, sig);
        }
    }

    fn sign_ours(setup: &Setup, kind: TransactionKind) {
        let secp = secp256k1::Secp256k1::new();
        let template = setup.registry.template(&setup.outpoint, kind).unwrap();
        let (pk, sig) = setup
            .keys
            .sign_stakeholder(&secp, 0, ChildNumber::from(0), &template);
        setup
            .registry
            .record_signature(&setup.outpoint, kind, pk, sig)
            .unwrap();
    }

    #[test]
    fn fetching_and_sharing_signatures() {
        let setup = setup();
        let coordinator = MockCoordinator::default();
        let watchtowers = MockWatchtowers::default();

        for kind in TransactionKind::REVOCATIONS.iter() {
            sign_ours(&setup, *kind);
            relay_others(&setup, &coordinator, *kind);
        }
        fetch_all_signatures(&setup.registry, &coordinator).unwrap();

        let snapshot = setup.registry.snapshot(&setup.outpoint).unwrap();
        assert!(snapshot.revocations_finalized());
        // We sent our signatures along
        let secp = secp256k1::Secp256k1::new();
        let our_key = setup.keys.sign_stakeholder(
            &secp,
            0,
            ChildNumber::from(0),
            &setup
                .registry
                .template(&setup.outpoint, TransactionKind::Cancel)
                .unwrap(),
        );
        let stored = coordinator.stored(&snapshot.txids[&TransactionKind::Cancel]);
        assert_eq!(stored.len(), 4);
        assert!(stored.contains_key(&our_key.0));

        // Then to the watchtowers, only once
        replicate_revocations(&setup.registry, &watchtowers);
        replicate_revocations(&setup.registry, &watchtowers);
        let replicated = watchtowers.replicated();
        assert_eq!(replicated.len(), 1);
        assert_eq!(replicated[0].deposit_outpoint, setup.outpoint);
        assert_eq!(replicated[0].cancel.len(), 4);
        assert!(setup.registry.snapshot(&setup.outpoint).unwrap().replicated);
    }

    #[test]
    fn lying_coordinator() {
        let setup = setup();
        let coordinator = MockCoordinator::default();
        let secp = secp256k1::Secp256k1::new();
        let kind = TransactionKind::Cancel;
        let template = setup.registry.template(&setup.outpoint, kind).unwrap();

        relay_others(&setup, &coordinator, kind);
        // The coordinator replaces the signature of the second stakeholder with the one of
        // the first.
        let (first_key, first_sig) =
            setup
                .keys
                .sign_stakeholder(&secp, 0, ChildNumber::from(0), &template);
        let (second_key, _) =
            setup
                .keys
                .sign_stakeholder(&secp, 1, ChildNumber::from(0), &template);
        coordinator.inject(template.txid(), second_key, first_sig);

        fetch_all_signatures(&setup.registry, &coordinator).unwrap();
        let presigned = setup.registry.presigned(&setup.outpoint).unwrap();
        let cancel = presigned.iter().find(|p| p.kind == kind).unwrap();
        assert_eq!(cancel.signers.len(), 2);
        assert!(!cancel.signers.contains(&second_key));
        assert!(!cancel.signers.contains(&first_key));
        assert!(cancel.transaction.is_none());
    }

    #[test]
    fn unreachable_coordinator_and_nacking_watchtowers() {
        let setup = setup();
        let coordinator = MockCoordinator::default();
        let watchtowers = MockWatchtowers::default();

        coordinator.set_unreachable(true);
        assert!(matches!(
            fetch_all_signatures(&setup.registry, &coordinator),
            Err(SignatureFetcherError::Communication(
                CommunicationError::Unreachable(_)
            ))
        ));

        coordinator.set_unreachable(false);
        for kind in TransactionKind::REVOCATIONS.iter() {
            sign_ours(&setup, *kind);
            relay_others(&setup, &coordinator, *kind);
        }
        fetch_all_signatures(&setup.registry, &coordinator).unwrap();

        watchtowers.set_nack(true);
        replicate_revocations(&setup.registry, &watchtowers);
        assert!(!setup.registry.snapshot(&setup.outpoint).unwrap().replicated);

        watchtowers.set_nack(false);
        replicate_revocations(&setup.registry, &watchtowers);
        assert!(setup.registry.snapshot(&setup.outpoint).unwrap().replicated);
    }
}
