//! The commands a caller can issue to a running daemon. Every request goes through the registry
//! and the revocation guard, transactions are handed to the bitcoind thread.

use crate::{
    bitcoind::BitcoindError,
    communication::{
        coordinator_status, watchtowers_status, CoordinatorClient, ServerStatus, SigTarget,
    },
    quorum::CollectionState,
    registry::{RegistryError, VaultRegistry, VaultStatus},
    revocation::{GuardError, RevocationGuard},
    threadmessages::{BitcoindSender, BitcoindThread, SigFetcherSender},
    transactions::TransactionKind,
    VERSION,
};

use revault_tx::bitcoin::{
    consensus::encode, secp256k1, util::bip32::ChildNumber, Address, Amount, Network, OutPoint,
    SigHash, Transaction, TxOut, Txid,
};

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Serialize, Serializer};

/// An error raised when calling a command
#[derive(Debug)]
pub enum ControlError {
    UnknownVault(OutPoint),
    InvalidStatus(VaultStatus, OutPoint),
    /// The submitted signatures don't contain one of ours
    MissingOurSignature(TransactionKind),
    StakeholderOnly,
    ManagerOnly,
    Registry(RegistryError),
    Guard(GuardError),
    Bitcoind(BitcoindError),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownVault(op) => write!(f, "No vault at '{}'", op),
            Self::InvalidStatus(status, op) => write!(
                f,
                "Invalid vault status '{}' for deposit outpoint '{}'",
                status, op
            ),
            Self::MissingOurSignature(kind) => {
                write!(f, "None of our signatures for the {} transaction", kind)
            }
            Self::StakeholderOnly => write!(f, "This is a stakeholder command"),
            Self::ManagerOnly => write!(f, "This is a manager command"),
            Self::Registry(e) => write!(f, "{}", e),
            Self::Guard(e) => write!(f, "{}", e),
            Self::Bitcoind(e) => write!(f, "Bitcoind error: '{}'", e),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<RegistryError> for ControlError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownVault(op) => Self::UnknownVault(op),
            RegistryError::WrongStatus(op, status) => Self::InvalidStatus(status, op),
            e => Self::Registry(e),
        }
    }
}

impl From<GuardError> for ControlError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::Registry(e) => e.into(),
            e => Self::Guard(e),
        }
    }
}

impl From<BitcoindError> for ControlError {
    fn from(e: BitcoindError) -> Self {
        Self::Bitcoind(e)
    }
}

fn ser_to_string<T: fmt::Display, S: Serializer>(field: T, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&field.to_string())
}

fn ser_amount<S: Serializer>(amount: &Amount, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(amount.as_sat())
}

#[allow(clippy::ptr_arg)]
fn ser_keys<S: Serializer>(keys: &Vec<secp256k1::PublicKey>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(keys.iter().map(|k| k.to_string()))
}

fn serialize_option_tx_hex<S>(tx: &Option<Transaction>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if let Some(ref tx) = tx {
        s.serialize_str(&encode::serialize_hex(tx))
    } else {
        s.serialize_none()
    }
}

/// Information about the current state of the daemon
#[derive(Debug, Clone, Serialize)]
pub struct GetInfoResult {
    pub version: String,
    pub network: Network,
    pub blockheight: u32,
    pub sync: f64,
    pub vaults: usize,
    pub coordinator: ServerStatus,
    pub watchtowers: Vec<ServerStatus>,
}

/// Information about a vault.
#[derive(Debug, Clone, Serialize)]
pub struct ListVaultsEntry {
    #[serde(serialize_with = "ser_amount")]
    pub amount: Amount,
    pub blockheight: u32,
    #[serde(serialize_with = "ser_to_string")]
    pub status: VaultStatus,
    pub txid: Txid,
    pub vout: u32,
    #[serde(serialize_with = "ser_to_string")]
    pub derivation_index: ChildNumber,
    pub address: Address,
    pub unvault_height: Option<u32>,
    pub moved_at: Option<u32>,
    pub replicated: bool,
}

/// A presigned transaction of a vault, what an external signer needs to sign it.
#[derive(Debug, Clone, Serialize)]
pub struct ListPresignedEntry {
    #[serde(serialize_with = "ser_to_string")]
    pub kind: TransactionKind,
    pub txid: Txid,
    /// The digest to sign
    #[serde(serialize_with = "ser_to_string")]
    pub digest: SigHash,
    #[serde(serialize_with = "ser_keys")]
    pub signers: Vec<secp256k1::PublicKey>,
    #[serde(serialize_with = "ser_to_string")]
    pub state: CollectionState,
    #[serde(rename = "hex", serialize_with = "serialize_option_tx_hex")]
    pub transaction: Option<Transaction>,
}

#[derive(Clone)]
pub struct DaemonControl {
    registry: Arc<VaultRegistry>,
    guard: Arc<RevocationGuard>,
    coordinator: Arc<dyn CoordinatorClient>,
    bitcoind_conn: BitcoindSender,
    sigfetcher_conn: SigFetcherSender,
}

impl DaemonControl {
    pub fn new(
        registry: Arc<VaultRegistry>,
        guard: Arc<RevocationGuard>,
        coordinator: Arc<dyn CoordinatorClient>,
        bitcoind_conn: BitcoindSender,
        sigfetcher_conn: SigFetcherSender,
    ) -> Self {
        Self {
            registry,
            guard,
            coordinator,
            bitcoind_conn,
            sigfetcher_conn,
        }
    }

    /// Send a shutdown message to the threads
    pub fn shutdown(&self) {
        self.bitcoind_conn.shutdown();
        self.sigfetcher_conn.shutdown();
    }

    /// Get information about the current state of the daemon
    pub fn get_info(&self) -> GetInfoResult {
        let custodyd = self.registry.custodyd();

        GetInfoResult {
            version: VERSION.to_string(),
            network: custodyd.network(),
            // 0 until the poller first talked to bitcoind
            blockheight: self.registry.tip().map(|t| t.height).unwrap_or(0),
            sync: self.bitcoind_conn.sync_progress(),
            vaults: self.registry.vault_count(),
            coordinator: coordinator_status(custodyd),
            watchtowers: watchtowers_status(custodyd),
        }
    }

    /// List the active vaults, optionally filtered by status and/or deposit outpoints.
    pub fn list_vaults(
        &self,
        statuses: Option<&[VaultStatus]>,
        deposit_outpoints: Option<&[OutPoint]>,
    ) -> Result<Vec<ListVaultsEntry>, ControlError> {
        let factory = &self.registry.custodyd().factory;
        let mut vaults = self
            .registry
            .snapshots()
            .into_iter()
            .filter(|s| statuses.map(|st| st.contains(&s.status)).unwrap_or(true))
            .filter(|s| {
                deposit_outpoints
                    .map(|ops| ops.contains(&s.deposit_outpoint))
                    .unwrap_or(true)
            })
            .map(|s| {
                Ok(ListVaultsEntry {
                    amount: s.amount,
                    blockheight: s.blockheight,
                    status: s.status,
                    txid: s.deposit_outpoint.txid,
                    vout: s.deposit_outpoint.vout,
                    derivation_index: s.derivation_index,
                    address: factory
                        .deposit_address(s.derivation_index)
                        .map_err(RegistryError::from)?,
                    unvault_height: s.unvault_height,
                    moved_at: s.moved_at,
                    replicated: s.replicated,
                })
            })
            .collect::<Result<Vec<_>, ControlError>>()?;
        vaults.sort_unstable_by_key(|v| (v.blockheight, v.txid, v.vout));

        Ok(vaults)
    }

    /// Get the deposit address at the lowest still unused derivation index
    pub fn deposit_address(&self) -> Result<Address, ControlError> {
        Ok(self.registry.deposit_address()?)
    }

    /// The presigned transactions of this vault, and who signed them already.
    pub fn presigned_transactions(
        &self,
        deposit_outpoint: &OutPoint,
    ) -> Result<Vec<ListPresignedEntry>, ControlError> {
        Ok(self
            .registry
            .presigned(deposit_outpoint)?
            .into_iter()
            .map(|view| ListPresignedEntry {
                kind: view.kind,
                txid: view.txid,
                digest: view.digest,
                signers: view.signers,
                state: view.state,
                transaction: view.transaction,
            })
            .collect())
    }

    /// Give the signatures of a presigned transaction. Ours must be part of them. They are all
    /// checked before being recorded, then shared with the other participants through the
    /// coordinator.
    ///
    /// ## Errors
    /// - If the outpoint doesn't refer to a known vault
    /// - If one of the signatures is invalid, none of them is recorded
    /// - If none of the signatures is ours
    pub fn submit_signatures(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
        signatures: &BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
    ) -> Result<(), ControlError> {
        let custodyd = self.registry.custodyd();
        let snapshot = self.registry.snapshot(deposit_outpoint)?;
        let template = self.registry.template(deposit_outpoint, kind)?;

        let our_keys = custodyd.our_keys_at(snapshot.derivation_index);
        if !signatures.keys().any(|k| our_keys.contains(k)) {
            return Err(ControlError::MissingOurSignature(kind));
        }
        // All or nothing: they are only shared once they are all recorded
        self.registry
            .record_signatures(deposit_outpoint, kind, signatures)?;

        let target = SigTarget {
            deposit_outpoint: *deposit_outpoint,
            kind,
            txid: template.txid(),
        };
        for (signer, sig) in signatures.iter() {
            // The signature fetcher shares it later if the coordinator is down
            if let Err(e) = self.coordinator.publish(&target, *signer, sig) {
                log::warn!(
                    "Could not share signature for {} of vault '{}': {}",
                    kind,
                    deposit_outpoint,
                    e
                );
            }
        }

        Ok(())
    }

    /// Broadcast the Unvault transaction of a vault, once its revocation transactions are
    /// finalized and replicated.
    pub fn broadcast_unvault(&self, deposit_outpoint: &OutPoint) -> Result<(), ControlError> {
        let unvault_tx = self.guard.authorize_unvault(deposit_outpoint)?;
        log::debug!(
            "Broadcasting Unvault transaction with id '{}'",
            unvault_tx.txid()
        );
        self.bitcoind_conn.broadcast(vec![unvault_tx])?;

        Ok(())
    }

    /// Create the Spend transaction of a vault, paying to these destinations. Its signatures
    /// are then collected like any presigned transaction.
    pub fn spend_template(
        &self,
        deposit_outpoint: &OutPoint,
        destinations: Vec<TxOut>,
    ) -> Result<ListPresignedEntry, ControlError> {
        if !self.registry.custodyd().is_manager() {
            return Err(ControlError::ManagerOnly);
        }

        let template = self.registry.set_spend(deposit_outpoint, destinations)?;
        Ok(ListPresignedEntry {
            kind: TransactionKind::Spend,
            txid: template.txid(),
            digest: template.digest,
            signers: vec![],
            state: CollectionState::NotStarted,
            transaction: None,
        })
    }

    /// Broadcast the finalized Spend transaction of a vault whose Unvault matured.
    pub fn broadcast_spend(&self, deposit_outpoint: &OutPoint) -> Result<(), ControlError> {
        if !self.registry.custodyd().is_manager() {
            return Err(ControlError::ManagerOnly);
        }

        let snapshot = self.registry.snapshot(deposit_outpoint)?;
        if snapshot.status != VaultStatus::Unvaulted {
            return Err(ControlError::InvalidStatus(
                snapshot.status,
                *deposit_outpoint,
            ));
        }
        let spend_tx = self
            .registry
            .finalized_transaction(deposit_outpoint, TransactionKind::Spend)?;
        log::debug!(
            "Broadcasting Spend transaction with id '{}'",
            spend_tx.txid()
        );
        self.bitcoind_conn.broadcast(vec![spend_tx])?;

        Ok(())
    }

    /// Cancel the Unvault of this vault. The Cancel is broadcast, and fee-bumped as needed, by
    /// the bitcoind thread.
    pub fn revault(&self, deposit_outpoint: &OutPoint) -> Result<(), ControlError> {
        Ok(self.guard.revault(deposit_outpoint)?)
    }

    /// Broadcast the Emergency transaction of all the vaults not unvaulted yet, and the
    /// UnvaultEmergency of the others. Returns the number of transactions broadcast.
    pub fn emergency(&self) -> Result<usize, ControlError> {
        if !self.registry.custodyd().is_stakeholder() {
            return Err(ControlError::StakeholderOnly);
        }

        let mut txs = vec![];
        for snapshot in self.registry.snapshots() {
            let kind = match snapshot.status {
                VaultStatus::Funded | VaultStatus::Securing | VaultStatus::Secured => {
                    TransactionKind::Emergency
                }
                VaultStatus::Unvaulting | VaultStatus::Unvaulted => {
                    TransactionKind::UnvaultEmergency
                }
                _ => continue,
            };
            match self
                .registry
                .finalized_transaction(&snapshot.deposit_outpoint, kind)
            {
                Ok(tx) => txs.push(tx),
                Err(RegistryError::NotFinalized(..)) => log::warn!(
                    "No finalized {} transaction for vault '{}'",
                    kind,
                    snapshot.deposit_outpoint
                ),
                Err(e) => return Err(e.into()),
            }
        }

        let n_txs = txs.len();
        log::info!("Broadcasting {} emergency transaction(s)", n_txs);
        self.bitcoind_conn.broadcast(txs)?;

        Ok(n_txs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ManagerConfig,
        custodyd::CustodyD,
        registry::VaultEvent,
        signatures::SignatureError,
        utils::test_utils::{
            dummy_config, dummy_control, dummy_custodyd, dummy_outpoint, dummy_registry,
            sign_vault, test_datadir, MockChainClient, MockCoordinator, TestKeys,
        },
    };

    use revault_tx::bitcoin::util::bip32::ChildNumber;

    use std::{fs, path::PathBuf};

    struct Setup {
        keys: TestKeys,
        registry: Arc<VaultRegistry>,
        control: DaemonControl,
        chain: MockChainClient,
        coordinator: MockCoordinator,
        outpoint: OutPoint,
        datadir: PathBuf,
    }

    impl Drop for Setup {
        fn drop(&mut self) {
            self.control.shutdown();
            fs::remove_dir_all(&self.datadir).unwrap_or_default();
        }
    }

    fn setup_with(keys: TestKeys, custodyd: CustodyD, datadir: PathBuf) -> Setup {
        let registry = dummy_registry(custodyd);
        let guard = Arc::new(RevocationGuard::new(registry.clone()));
        let chain = MockChainClient::new(100);
        let coordinator = MockCoordinator::default();
        let control = dummy_control(
            registry.clone(),
            guard,
            chain.clone(),
            coordinator.clone(),
        );

        let outpoint = dummy_outpoint(1);
        registry
            .create_vault(outpoint, Amount::from_sat(100_000_000), ChildNumber::from(0))
            .unwrap()
            .unwrap();
        registry
            .record_chain_event(&outpoint, VaultEvent::DepositConfirmed { height: 95 })
            .unwrap();

        Setup {
            keys,
            registry,
            control,
            chain,
            coordinator,
            outpoint,
            datadir,
        }
    }

    fn setup() -> Setup {
        let datadir = test_datadir();
        let keys = TestKeys::new(3, 2, 3);
        let custodyd = dummy_custodyd(&keys, 18, datadir.clone());
        setup_with(keys, custodyd, datadir)
    }

    // We are the first manager instead of the first stakeholder
    fn manager_setup() -> Setup {
        let datadir = test_datadir();
        let keys = TestKeys::new(3, 2, 3);
        let mut config = dummy_config(&keys, 18, datadir.clone());
        config.emergency_address = config
            .stakeholder_config
            .take()
            .map(|stk| stk.emergency_address);
        config.manager_config = Some(ManagerConfig {
            xpub: keys.managers_xpubs()[0],
            cosigners: vec![],
        });
        let custodyd = CustodyD::from_config(config).unwrap();
        setup_with(keys, custodyd, datadir)
    }

    fn stakeholder_sigs(
        setup: &Setup,
        kind: TransactionKind,
        signers: &[usize],
    ) -> BTreeMap<secp256k1::PublicKey, secp256k1::Signature> {
        let secp = secp256k1::Secp256k1::new();
        let template = setup.registry.template(&setup.outpoint, kind).unwrap();
        signers
            .iter()
            .map(|i| {
                setup
                    .keys
                    .sign_stakeholder(&secp, *i, ChildNumber::from(0), &template)
            })
            .collect()
    }

    fn confirm(setup: &Setup, kind: TransactionKind, height: u32) {
        let txid = setup.registry.template(&setup.outpoint, kind).unwrap().txid();
        setup
            .registry
            .record_chain_event(
                &setup.outpoint,
                VaultEvent::Confirmed { kind, txid, height },
            )
            .unwrap();
    }

    #[test]
    fn listing_and_deposit_address() {
        let setup = setup();
        let factory = &setup.registry.custodyd().factory;

        assert_eq!(
            setup.control.deposit_address().unwrap(),
            factory.deposit_address(setup.registry.next_index()).unwrap()
        );

        let vaults = setup.control.list_vaults(None, None).unwrap();
        assert_eq!(vaults.len(), 1);
        assert_eq!(vaults[0].status, VaultStatus::Funded);
        assert_eq!(vaults[0].txid, setup.outpoint.txid);
        assert_eq!(vaults[0].blockheight, 95);
        assert_eq!(
            vaults[0].address,
            factory.deposit_address(ChildNumber::from(0)).unwrap()
        );
        assert!(setup
            .control
            .list_vaults(Some(&[VaultStatus::Secured]), None)
            .unwrap()
            .is_empty());
        assert!(setup
            .control
            .list_vaults(None, Some(&[dummy_outpoint(2)]))
            .unwrap()
            .is_empty());

        let presigned = setup.control.presigned_transactions(&setup.outpoint).unwrap();
        assert_eq!(presigned.len(), 4);
        assert!(presigned.iter().all(|p| p.signers.is_empty()
            && p.state == CollectionState::NotStarted
            && p.transaction.is_none()));
        assert!(matches!(
            setup.control.presigned_transactions(&dummy_outpoint(2)),
            Err(ControlError::UnknownVault(_))
        ));

        let info = setup.control.get_info();
        assert_eq!(info.vaults, 1);
        assert_eq!(info.network, Network::Bitcoin);
        assert!(!info.coordinator.reachable);
    }

    #[test]
    fn signatures_submission() {
        let setup = setup();

        // Not ours
        let sigs = stakeholder_sigs(&setup, TransactionKind::Cancel, &[1, 2]);
        assert!(matches!(
            setup
                .control
                .submit_signatures(&setup.outpoint, TransactionKind::Cancel, &sigs),
            Err(ControlError::MissingOurSignature(TransactionKind::Cancel))
        ));

        // One of them is over the wrong transaction, nothing gets recorded
        let mut sigs = stakeholder_sigs(&setup, TransactionKind::Cancel, &[0]);
        sigs.extend(stakeholder_sigs(&setup, TransactionKind::Emergency, &[1]));
        assert!(setup
            .control
            .submit_signatures(&setup.outpoint, TransactionKind::Cancel, &sigs)
            .is_err());
        let snapshot = setup.registry.snapshot(&setup.outpoint).unwrap();
        assert_eq!(snapshot.status, VaultStatus::Funded);

        // Managers don't sign revocation transactions. The valid stakeholders' signatures of
        // the same batch are neither recorded nor shared.
        let secp = secp256k1::Secp256k1::new();
        let cancel = setup
            .registry
            .template(&setup.outpoint, TransactionKind::Cancel)
            .unwrap();
        let mut sigs = stakeholder_sigs(&setup, TransactionKind::Cancel, &[0, 1]);
        let (man_key, man_sig) = setup
            .keys
            .sign_manager(&secp, 0, ChildNumber::from(0), &cancel);
        sigs.insert(man_key, man_sig);
        assert!(matches!(
            setup
                .control
                .submit_signatures(&setup.outpoint, TransactionKind::Cancel, &sigs),
            Err(ControlError::Registry(RegistryError::Signature(
                SignatureError::RoleMismatch { .. }
            )))
        ));
        let presigned = setup.registry.presigned(&setup.outpoint).unwrap();
        let cancel_view = presigned
            .iter()
            .find(|p| p.kind == TransactionKind::Cancel)
            .unwrap();
        assert!(cancel_view.signers.is_empty());
        assert!(setup.coordinator.stored(&cancel.txid()).is_empty());
        assert_eq!(
            setup.registry.snapshot(&setup.outpoint).unwrap().status,
            VaultStatus::Funded
        );

        // Valid, recorded and shared
        let sigs = stakeholder_sigs(&setup, TransactionKind::Cancel, &[0, 1]);
        setup
            .control
            .submit_signatures(&setup.outpoint, TransactionKind::Cancel, &sigs)
            .unwrap();
        assert_eq!(setup.coordinator.stored(&cancel.txid()), sigs);
        let snapshot = setup.registry.snapshot(&setup.outpoint).unwrap();
        assert_eq!(snapshot.status, VaultStatus::Securing);

        // The coordinator being down doesn't prevent recording them
        setup.coordinator.set_unreachable(true);
        let sigs = stakeholder_sigs(&setup, TransactionKind::Cancel, &[0, 2]);
        setup
            .control
            .submit_signatures(&setup.outpoint, TransactionKind::Cancel, &sigs)
            .unwrap();
        assert!(setup
            .registry
            .snapshot(&setup.outpoint)
            .unwrap()
            .is_finalized(TransactionKind::Cancel));
    }

    #[test]
    fn unvault_broadcast() {
        let setup = setup();

        // Not secured
        assert!(matches!(
            setup.control.broadcast_unvault(&setup.outpoint),
            Err(ControlError::Guard(GuardError::SafetyViolation(_)))
        ));
        assert!(setup.chain.broadcasted().is_empty());

        sign_vault(
            &setup.keys,
            &setup.registry,
            &setup.outpoint,
            ChildNumber::from(0),
            &[
                TransactionKind::Cancel,
                TransactionKind::Emergency,
                TransactionKind::UnvaultEmergency,
                TransactionKind::Unvault,
            ],
        );
        assert!(matches!(
            setup.control.broadcast_unvault(&setup.outpoint),
            Err(ControlError::Guard(GuardError::NotReplicated(_)))
        ));

        setup.registry.mark_replicated(&setup.outpoint).unwrap();
        setup.control.broadcast_unvault(&setup.outpoint).unwrap();
        let broadcasted = setup.chain.broadcasted();
        assert_eq!(broadcasted.len(), 1);
        assert_eq!(
            broadcasted[0].txid(),
            setup
                .registry
                .template(&setup.outpoint, TransactionKind::Unvault)
                .unwrap()
                .txid()
        );
        assert!(
            setup
                .registry
                .snapshot(&setup.outpoint)
                .unwrap()
                .unvault_authorized
        );

        // A broadcast failure is reported
        setup.chain.set_reject_broadcast(true);
        assert!(matches!(
            setup.control.broadcast_unvault(&setup.outpoint),
            Err(ControlError::Bitcoind(_))
        ));
    }

    #[test]
    fn revault_and_emergency() {
        let setup = setup();
        sign_vault(
            &setup.keys,
            &setup.registry,
            &setup.outpoint,
            ChildNumber::from(0),
            &[
                TransactionKind::Cancel,
                TransactionKind::Emergency,
                TransactionKind::UnvaultEmergency,
                TransactionKind::Unvault,
            ],
        );

        // Nothing to cancel yet
        assert!(matches!(
            setup.control.revault(&setup.outpoint),
            Err(ControlError::InvalidStatus(VaultStatus::Secured, _))
        ));
        assert!(matches!(
            setup.control.revault(&dummy_outpoint(2)),
            Err(ControlError::UnknownVault(_))
        ));

        // Before the Unvault, the Emergency spends the deposit
        assert_eq!(setup.control.emergency().unwrap(), 1);
        let emer_txid = setup
            .registry
            .template(&setup.outpoint, TransactionKind::Emergency)
            .unwrap()
            .txid();
        assert_eq!(setup.chain.broadcasted()[0].txid(), emer_txid);

        // After, the UnvaultEmergency spends the Unvault output
        confirm(&setup, TransactionKind::Unvault, 101);
        setup.control.revault(&setup.outpoint).unwrap();
        assert_eq!(setup.control.emergency().unwrap(), 1);
        let unemer_txid = setup
            .registry
            .template(&setup.outpoint, TransactionKind::UnvaultEmergency)
            .unwrap()
            .txid();
        assert_eq!(setup.chain.broadcasted()[1].txid(), unemer_txid);
    }

    #[test]
    fn spend_lifecycle() {
        let setup = manager_setup();
        let secp = secp256k1::Secp256k1::new();
        let destinations = vec![TxOut {
            value: 90_000_000,
            script_pubkey: setup
                .registry
                .custodyd()
                .factory
                .emergency_address()
                .script_pubkey(),
        }];

        // We are not a stakeholder anymore
        assert!(matches!(
            setup.control.emergency(),
            Err(ControlError::StakeholderOnly)
        ));

        // Not possible before the vault is secured
        assert!(matches!(
            setup
                .control
                .spend_template(&setup.outpoint, destinations.clone()),
            Err(ControlError::InvalidStatus(VaultStatus::Funded, _))
        ));

        sign_vault(
            &setup.keys,
            &setup.registry,
            &setup.outpoint,
            ChildNumber::from(0),
            &[
                TransactionKind::Cancel,
                TransactionKind::Emergency,
                TransactionKind::UnvaultEmergency,
                TransactionKind::Unvault,
            ],
        );
        let spend = setup
            .control
            .spend_template(&setup.outpoint, destinations)
            .unwrap();
        let template = setup
            .registry
            .template(&setup.outpoint, TransactionKind::Spend)
            .unwrap();
        assert_eq!(spend.txid, template.txid());
        assert_eq!(spend.digest, template.digest);

        // Managers and cosigners sign it
        for i in 0..setup.keys.managers.len() {
            let (pk, sig) = setup
                .keys
                .sign_manager(&secp, i, ChildNumber::from(0), &template);
            setup
                .registry
                .record_signature(&setup.outpoint, TransactionKind::Spend, pk, sig)
                .unwrap();
        }
        for i in 0..2 {
            let (pk, sig) = setup.keys.sign_cosigner(&secp, i, &template);
            setup
                .registry
                .record_signature(&setup.outpoint, TransactionKind::Spend, pk, sig)
                .unwrap();
        }

        // Only once the Unvault matured
        confirm(&setup, TransactionKind::Unvault, 101);
        assert!(matches!(
            setup.control.broadcast_spend(&setup.outpoint),
            Err(ControlError::InvalidStatus(VaultStatus::Unvaulting, _))
        ));
        setup
            .registry
            .record_chain_event(&setup.outpoint, VaultEvent::Matured)
            .unwrap();
        setup.control.broadcast_spend(&setup.outpoint).unwrap();
        assert_eq!(setup.chain.broadcasted()[0].txid(), template.txid());
    }
}
