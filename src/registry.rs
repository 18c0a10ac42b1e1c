//! The vaults we know about, and the only place their status is ever changed.
//!
//! Each vault lives behind its own lock: a signature being accepted and a chain event being
//! applied to the same vault are serialized, while different vaults are independent. The map
//! lock is only ever held to look a vault up or to insert and remove one.

use crate::{
    communication::RevocationSigs,
    config::ConfigError,
    custodyd::{BlockchainTip, CustodyD},
    database::{
        actions::{
            db_archive_vault, db_insert_broadcast, db_insert_vault, db_mark_replicated,
            db_mark_unvault_authorized, db_set_spend, db_store_signatures, db_update_deposit_index, db_update_vault, DbVaultState, NewDbVault,
        },
        interface::{
            db_broadcasts, db_presigned, db_signatures, db_vault_by_deposit, db_vaults, db_wallet,
        },
        schema::DbVault,
        DatabaseError,
    },
    participants::VaultKeys,
    quorum::{Admission, CollectionState, QuorumCollector},
    signatures::SignatureError,
    transactions::{
        spend_destinations, ConstructionError, PresignedTemplate, TransactionFactory,
        TransactionKind, VaultTemplates,
    },
};

use revault_tx::bitcoin::{
    secp256k1, util::bip32::ChildNumber, Address, Amount, OutPoint, SigHash, Transaction, TxOut,
    Txid,
};

use std::{
    collections::{BTreeMap, HashMap},
    convert::TryFrom,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, RwLock},
};

/// The status of a vault, depends both on the block chain and the set of presigned
/// transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VaultStatus {
    /// The deposit transaction has less than `min_conf` confirmations
    Funding = 0,
    /// The deposit transaction is confirmed, no revocation signature yet
    Funded = 1,
    /// We are collecting the revocation transactions' signatures
    Securing = 2,
    /// The Cancel, Emergency and UnvaultEmergency transactions are finalized
    Secured = 3,
    /// The Unvault transaction is confirmed, its CSV did not mature yet
    Unvaulting = 4,
    /// The Unvault output can be spent by the managers
    Unvaulted = 5,
    Spending = 6,
    Spent = 7,
    Canceling = 8,
    Canceled = 9,
    /// Either the Emergency or the UnvaultEmergency transaction is confirmed
    EmergencyVaulting = 10,
    EmergencyVaulted = 11,
}

impl VaultStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Spent | Self::Canceled | Self::EmergencyVaulted
        )
    }
}

impl TryFrom<u32> for VaultStatus {
    type Error = ();

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(Self::Funding),
            1 => Ok(Self::Funded),
            2 => Ok(Self::Securing),
            3 => Ok(Self::Secured),
            4 => Ok(Self::Unvaulting),
            5 => Ok(Self::Unvaulted),
            6 => Ok(Self::Spending),
            7 => Ok(Self::Spent),
            8 => Ok(Self::Canceling),
            9 => Ok(Self::Canceled),
            10 => Ok(Self::EmergencyVaulting),
            11 => Ok(Self::EmergencyVaulted),
            _ => Err(()),
        }
    }
}

impl FromStr for VaultStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "funding" => Ok(Self::Funding),
            "funded" => Ok(Self::Funded),
            "securing" => Ok(Self::Securing),
            "secured" => Ok(Self::Secured),
            "unvaulting" => Ok(Self::Unvaulting),
            "unvaulted" => Ok(Self::Unvaulted),
            "spending" => Ok(Self::Spending),
            "spent" => Ok(Self::Spent),
            "canceling" => Ok(Self::Canceling),
            "canceled" => Ok(Self::Canceled),
            "emergencyvaulting" => Ok(Self::EmergencyVaulting),
            "emergencyvaulted" => Ok(Self::EmergencyVaulted),
            _ => Err(()),
        }
    }
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::Funding => "funding",
                Self::Funded => "funded",
                Self::Securing => "securing",
                Self::Secured => "secured",
                Self::Unvaulting => "unvaulting",
                Self::Unvaulted => "unvaulted",
                Self::Spending => "spending",
                Self::Spent => "spent",
                Self::Canceling => "canceling",
                Self::Canceled => "canceled",
                Self::EmergencyVaulting => "emergencyvaulting",
                Self::EmergencyVaulted => "emergencyvaulted",
            }
        )
    }
}

/// Something that happened to a vault, either on chain or to its presigned transactions.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultEvent {
    /// The deposit reached `min_conf` confirmations
    DepositConfirmed { height: u32 },
    /// The deposit went back under `min_conf` confirmations
    DepositUnconfirmed,
    /// We accepted the first signature of a revocation transaction
    CollectionStarted,
    /// The three revocation transactions are finalized
    RevocationsFinalized,
    Confirmed {
        kind: TransactionKind,
        txid: Txid,
        height: u32,
    },
    /// The Unvault CSV expired
    Matured,
    /// A transaction we saw confirmed was reorged out
    Unconfirmed(TransactionKind),
    /// A transaction reached `min_conf` confirmations
    Buried(TransactionKind),
}

impl fmt::Display for VaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DepositConfirmed { height } => write!(f, "deposit confirmed at {}", height),
            Self::DepositUnconfirmed => write!(f, "deposit unconfirmed"),
            Self::CollectionStarted => write!(f, "revocation signatures collection started"),
            Self::RevocationsFinalized => write!(f, "revocation transactions finalized"),
            Self::Confirmed { kind, txid, height } => {
                write!(f, "{} transaction '{}' confirmed at {}", kind, txid, height)
            }
            Self::Matured => write!(f, "Unvault CSV matured"),
            Self::Unconfirmed(kind) => write!(f, "{} transaction unconfirmed", kind),
            Self::Buried(kind) => write!(f, "{} transaction buried", kind),
        }
    }
}

/// Where the collection of the revocation transactions' signatures is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationProgress {
    NotStarted,
    Collecting,
    Finalized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidTransitionError {
    pub from: VaultStatus,
    pub event: VaultEvent,
}

impl fmt::Display for InvalidTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid transition from '{}' on '{}'",
            self.from, self.event
        )
    }
}

impl std::error::Error for InvalidTransitionError {}

// Where a vault goes back to when the transaction spending its deposit gets unconfirmed.
fn before_unvault(progress: RevocationProgress) -> VaultStatus {
    match progress {
        RevocationProgress::NotStarted => VaultStatus::Funded,
        RevocationProgress::Collecting => VaultStatus::Securing,
        RevocationProgress::Finalized => VaultStatus::Secured,
    }
}

/// The vault state machine. Pure: any other transition than these is an error.
pub fn transition(
    status: VaultStatus,
    event: &VaultEvent,
    progress: RevocationProgress,
) -> Result<VaultStatus, InvalidTransitionError> {
    use TransactionKind as Kind;
    use VaultStatus::*;

    let next = match (status, event) {
        (Funding, VaultEvent::DepositConfirmed { .. }) => Some(Funded),
        (Funded | Securing | Secured, VaultEvent::DepositUnconfirmed) => Some(Funding),

        (Funded, VaultEvent::CollectionStarted) => Some(Securing),
        (Securing, VaultEvent::RevocationsFinalized) => Some(Secured),

        (Secured, VaultEvent::Confirmed {
            kind: Kind::Unvault,
            ..
        }) => Some(Unvaulting),
        (Funded | Securing | Secured, VaultEvent::Confirmed {
            kind: Kind::Emergency,
            ..
        }) => Some(EmergencyVaulting),
        // The Unvault of a vault that isn't secured is never recorded, but other participants
        // may still revoke it.
        (Funded | Securing, VaultEvent::Confirmed { kind, .. }) => match kind {
            Kind::Cancel => Some(Canceling),
            Kind::UnvaultEmergency => Some(EmergencyVaulting),
            _ => None,
        },
        (Unvaulting, VaultEvent::Matured) => Some(Unvaulted),
        (Unvaulting | Unvaulted, VaultEvent::Confirmed { kind, .. }) => match kind {
            Kind::Cancel => Some(Canceling),
            Kind::UnvaultEmergency => Some(EmergencyVaulting),
            Kind::Spend if status == Unvaulted => Some(Spending),
            _ => None,
        },

        (Canceling, VaultEvent::Buried(Kind::Cancel)) => Some(Canceled),
        (Spending, VaultEvent::Buried(Kind::Spend)) => Some(Spent),
        (EmergencyVaulting, VaultEvent::Buried(Kind::Emergency | Kind::UnvaultEmergency)) => {
            Some(EmergencyVaulted)
        }

        (Unvaulting | Unvaulted, VaultEvent::Unconfirmed(Kind::Unvault)) => {
            Some(before_unvault(progress))
        }
        (Canceling, VaultEvent::Unconfirmed(Kind::Cancel))
        | (EmergencyVaulting, VaultEvent::Unconfirmed(Kind::UnvaultEmergency)) => {
            match progress {
                RevocationProgress::Finalized => Some(Unvaulting),
                _ => Some(before_unvault(progress)),
            }
        }
        (EmergencyVaulting, VaultEvent::Unconfirmed(Kind::Emergency)) => {
            Some(before_unvault(progress))
        }
        (Spending, VaultEvent::Unconfirmed(Kind::Spend)) => Some(Unvaulted),

        _ => None,
    };

    next.ok_or_else(|| InvalidTransitionError {
        from: status,
        event: event.clone(),
    })
}

#[derive(Debug)]
pub enum RegistryError {
    UnknownVault(OutPoint),
    Transition(InvalidTransitionError),
    Signature(SignatureError),
    Construction(ConstructionError),
    Database(DatabaseError),
    Config(ConfigError),
    /// This transaction does not have all its signatures yet
    NotFinalized(OutPoint, TransactionKind),
    /// We derived another transaction than the one we stored
    DigestMismatch(OutPoint, TransactionKind),
    /// The vault is not in a status allowing this operation
    WrongStatus(OutPoint, VaultStatus),
    /// No Spend transaction was set for this vault
    NoSpend(OutPoint),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVault(outpoint) => write!(f, "No vault at '{}'", outpoint),
            Self::Transition(e) => write!(f, "{}", e),
            Self::Signature(e) => write!(f, "{}", e),
            Self::Construction(e) => write!(f, "{}", e),
            Self::Database(e) => write!(f, "{}", e),
            Self::Config(e) => write!(f, "{}", e),
            Self::NotFinalized(outpoint, kind) => write!(
                f,
                "{} transaction of vault '{}' is not finalized",
                kind, outpoint
            ),
            Self::DigestMismatch(outpoint, kind) => write!(
                f,
                "{} transaction of vault '{}' does not match the one in database",
                kind, outpoint
            ),
            Self::WrongStatus(outpoint, status) => {
                write!(f, "Vault '{}' is '{}'", outpoint, status)
            }
            Self::NoSpend(outpoint) => write!(f, "No Spend transaction for vault '{}'", outpoint),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<InvalidTransitionError> for RegistryError {
    fn from(e: InvalidTransitionError) -> Self {
        Self::Transition(e)
    }
}

impl From<SignatureError> for RegistryError {
    fn from(e: SignatureError) -> Self {
        Self::Signature(e)
    }
}

impl From<ConstructionError> for RegistryError {
    fn from(e: ConstructionError) -> Self {
        Self::Construction(e)
    }
}

impl From<DatabaseError> for RegistryError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

impl From<ConfigError> for RegistryError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// A vault, its presigned transactions and the signatures we gathered for them.
#[derive(Debug)]
struct Vault {
    id: u32,
    deposit_outpoint: OutPoint,
    amount: Amount,
    derivation_index: ChildNumber,
    status: VaultStatus,
    blockheight: u32,
    unvault_height: Option<u32>,
    moved_at: Option<u32>,
    final_txid: Option<Txid>,
    final_kind: Option<TransactionKind>,
    replicated: bool,
    unvault_authorized: bool,
    keys: VaultKeys,
    templates: VaultTemplates,
    spend: Option<PresignedTemplate>,
    collectors: BTreeMap<TransactionKind, QuorumCollector>,
    /// The revocation transactions we broadcast ourselves
    broadcasts: Vec<(TransactionKind, Txid)>,
}

impl Vault {
    fn template(&self, kind: TransactionKind) -> Option<&PresignedTemplate> {
        match kind {
            TransactionKind::Spend => self.spend.as_ref(),
            _ => self.templates.get(kind),
        }
    }

    fn is_finalized(&self, kind: TransactionKind) -> bool {
        self.collectors
            .get(&kind)
            .map(|c| c.is_finalized())
            .unwrap_or(false)
    }

    fn revocation_progress(&self) -> RevocationProgress {
        let revocations: Vec<&QuorumCollector> = TransactionKind::REVOCATIONS
            .iter()
            .filter_map(|kind| self.collectors.get(kind))
            .collect();
        if revocations.iter().all(|c| c.is_finalized()) {
            RevocationProgress::Finalized
        } else if revocations.iter().any(|c| !c.signatures().is_empty()) {
            RevocationProgress::Collecting
        } else {
            RevocationProgress::NotStarted
        }
    }

    fn db_state(&self) -> DbVaultState {
        DbVaultState {
            status: self.status,
            blockheight: self.blockheight,
            unvault_height: self.unvault_height,
            moved_at: self.moved_at,
            final_txid: self.final_txid.as_ref(),
            final_kind: self.final_kind,
        }
    }

    fn snapshot(&self) -> VaultSnapshot {
        let mut txids: BTreeMap<TransactionKind, Txid> = self
            .templates
            .iter()
            .map(|t| (t.kind, t.txid()))
            .collect();
        if let Some(ref spend) = self.spend {
            txids.insert(TransactionKind::Spend, spend.txid());
        }

        VaultSnapshot {
            deposit_outpoint: self.deposit_outpoint,
            amount: self.amount,
            derivation_index: self.derivation_index,
            status: self.status,
            blockheight: self.blockheight,
            unvault_height: self.unvault_height,
            moved_at: self.moved_at,
            final_txid: self.final_txid,
            final_kind: self.final_kind,
            replicated: self.replicated,
            unvault_authorized: self.unvault_authorized,
            txids,
            broadcasts: self.broadcasts.clone(),
            collection: self
                .collectors
                .iter()
                .map(|(kind, c)| (*kind, c.state()))
                .collect(),
        }
    }
}

/// A copy of a vault's state at some point.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultSnapshot {
    pub deposit_outpoint: OutPoint,
    pub amount: Amount,
    pub derivation_index: ChildNumber,
    pub status: VaultStatus,
    /// The deposit confirmation height, 0 if unconfirmed
    pub blockheight: u32,
    pub unvault_height: Option<u32>,
    pub moved_at: Option<u32>,
    pub final_txid: Option<Txid>,
    pub final_kind: Option<TransactionKind>,
    pub replicated: bool,
    pub unvault_authorized: bool,
    pub txids: BTreeMap<TransactionKind, Txid>,
    pub broadcasts: Vec<(TransactionKind, Txid)>,
    pub collection: BTreeMap<TransactionKind, CollectionState>,
}

impl VaultSnapshot {
    pub fn is_finalized(&self, kind: TransactionKind) -> bool {
        self.collection.get(&kind) == Some(&CollectionState::Finalized)
    }

    pub fn revocations_finalized(&self) -> bool {
        TransactionKind::REVOCATIONS
            .iter()
            .all(|kind| self.is_finalized(*kind))
    }

    /// All the transactions of this kind we may see on chain: the presigned one and the ones
    /// we fee-bumped.
    pub fn tracked_txids(&self, kind: TransactionKind) -> Vec<Txid> {
        self.txids
            .get(&kind)
            .into_iter()
            .copied()
            .chain(
                self.broadcasts
                    .iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, txid)| *txid),
            )
            .collect()
    }
}

/// A presigned transaction, as exposed to the signers.
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedView {
    pub kind: TransactionKind,
    pub txid: Txid,
    pub digest: SigHash,
    pub signers: Vec<secp256k1::PublicKey>,
    pub state: CollectionState,
    /// The fully signed transaction, if finalized
    pub transaction: Option<Transaction>,
}

/// A transaction whose signatures we are still collecting.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCollection {
    pub deposit_outpoint: OutPoint,
    pub derivation_index: ChildNumber,
    pub kind: TransactionKind,
    pub txid: Txid,
    pub signatures: BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
}

fn new_collectors(
    factory: &TransactionFactory,
    keys: &VaultKeys,
    templates: &VaultTemplates,
) -> BTreeMap<TransactionKind, QuorumCollector> {
    templates
        .iter()
        .map(|template| {
            (
                template.kind,
                QuorumCollector::new(
                    template.kind,
                    template.message(),
                    keys.clone(),
                    factory.participants(),
                ),
            )
        })
        .collect()
}

pub struct VaultRegistry {
    custodyd: Arc<CustodyD>,
    wallet_id: u32,
    vaults: RwLock<HashMap<OutPoint, Arc<Mutex<Vault>>>>,
    next_index: Mutex<ChildNumber>,
    tip: RwLock<Option<BlockchainTip>>,
}

impl VaultRegistry {
    /// Load the registry from the database. The transactions of every vault are derived again
    /// and checked against the ones we stored, and the stored signatures are validated again.
    pub fn load(custodyd: Arc<CustodyD>) -> Result<VaultRegistry, RegistryError> {
        let db_path = custodyd.db_file();
        let wallet = db_wallet(&db_path)?;
        custodyd.check_fingerprint(&wallet.fingerprint)?;

        let mut vaults = HashMap::new();
        for db_vault in db_vaults(&db_path)? {
            let vault = Self::restore_vault(&custodyd, db_vault)?;
            vaults.insert(vault.deposit_outpoint, Arc::new(Mutex::new(vault)));
        }
        log::info!(
            "Loaded {} vault(s), next derivation index is '{}'",
            vaults.len(),
            wallet.deposit_derivation_index
        );

        Ok(VaultRegistry {
            custodyd,
            wallet_id: wallet.id,
            vaults: RwLock::new(vaults),
            next_index: Mutex::new(wallet.deposit_derivation_index),
            tip: RwLock::new(None),
        })
    }

    fn restore_vault(custodyd: &CustodyD, db_vault: DbVault) -> Result<Vault, RegistryError> {
        let db_path = custodyd.db_file();
        let factory = &custodyd.factory;
        let outpoint = db_vault.deposit_outpoint;
        let index = db_vault.derivation_index;

        let keys = factory.vault_keys(index)?;
        let templates = factory.vault_templates(outpoint, db_vault.amount, index)?;
        let mut collectors = new_collectors(factory, &keys, &templates);

        let mut spend = None;
        for stored in db_presigned(&db_path, db_vault.id)? {
            let derived = match stored.kind {
                TransactionKind::Spend => {
                    let tx = stored
                        .raw_tx
                        .ok_or(RegistryError::DigestMismatch(outpoint, stored.kind))?;
                    let template = factory.spend_template(
                        &templates.unvault,
                        index,
                        spend_destinations(&tx),
                    )?;
                    collectors.insert(
                        TransactionKind::Spend,
                        QuorumCollector::new(
                            TransactionKind::Spend,
                            template.message(),
                            keys.clone(),
                            factory.participants(),
                        ),
                    );
                    spend.get_or_insert(template).clone()
                }
                kind => templates
                    .get(kind)
                    .cloned()
                    .ok_or(RegistryError::DigestMismatch(outpoint, kind))?,
            };
            if derived.digest != stored.digest || derived.txid() != stored.txid {
                return Err(RegistryError::DigestMismatch(outpoint, stored.kind));
            }
        }

        for sig in db_signatures(&db_path, db_vault.id)? {
            let collector = match collectors.get_mut(&sig.kind) {
                Some(c) => c,
                None => continue,
            };
            if let Err(e) = collector.add_signature(&custodyd.secp_ctx, sig.pubkey, sig.signature)
            {
                log::error!(
                    "Stored signature for vault '{}' does not validate: {}",
                    outpoint,
                    e
                );
            }
        }

        let broadcasts = db_broadcasts(&db_path, db_vault.id)?
            .into_iter()
            .map(|b| (b.kind, b.txid))
            .collect();

        Ok(Vault {
            id: db_vault.id,
            deposit_outpoint: outpoint,
            amount: db_vault.amount,
            derivation_index: index,
            status: db_vault.status,
            blockheight: db_vault.blockheight,
            unvault_height: db_vault.unvault_height,
            moved_at: db_vault.moved_at,
            final_txid: db_vault.final_txid,
            final_kind: db_vault.final_kind,
            replicated: db_vault.replicated,
            unvault_authorized: db_vault.unvault_authorized,
            keys,
            templates,
            spend,
            collectors,
            broadcasts,
        })
    }

    pub fn custodyd(&self) -> &Arc<CustodyD> {
        &self.custodyd
    }

    pub fn wallet_id(&self) -> u32 {
        self.wallet_id
    }

    pub fn tip(&self) -> Option<BlockchainTip> {
        *self.tip.read().unwrap()
    }

    pub fn set_tip(&self, tip: BlockchainTip) {
        *self.tip.write().unwrap() = Some(tip);
    }

    /// The first derivation index no vault uses
    pub fn next_index(&self) -> ChildNumber {
        *self.next_index.lock().unwrap()
    }

    pub fn deposit_address(&self) -> Result<Address, RegistryError> {
        Ok(self.custodyd.factory.deposit_address(self.next_index())?)
    }

    pub fn vault_count(&self) -> usize {
        self.vaults.read().unwrap().len()
    }

    fn vault(&self, outpoint: &OutPoint) -> Result<Arc<Mutex<Vault>>, RegistryError> {
        self.vaults
            .read()
            .unwrap()
            .get(outpoint)
            .cloned()
            .ok_or(RegistryError::UnknownVault(*outpoint))
    }

    fn all_vaults(&self) -> Vec<Arc<Mutex<Vault>>> {
        self.vaults.read().unwrap().values().cloned().collect()
    }

    fn advance_index(&self, used: ChildNumber) -> Result<(), RegistryError> {
        let mut next_index = self.next_index.lock().unwrap();
        let used: u32 = used.into();
        if used >= u32::from(*next_index) {
            let next = ChildNumber::from(used + 1);
            db_update_deposit_index(&self.custodyd.db_file(), next)?;
            *next_index = next;
        }
        Ok(())
    }

    /// Create a vault for a deposit we just saw. Returns None if we already know about it.
    pub fn create_vault(
        &self,
        deposit_outpoint: OutPoint,
        amount: Amount,
        derivation_index: ChildNumber,
    ) -> Result<Option<VaultSnapshot>, RegistryError> {
        if self.vaults.read().unwrap().contains_key(&deposit_outpoint) {
            return Ok(None);
        }
        let db_path = self.custodyd.db_file();
        if db_vault_by_deposit(&db_path, &deposit_outpoint)?.is_some() {
            return Ok(None);
        }

        let factory = &self.custodyd.factory;
        let keys = factory.vault_keys(derivation_index)?;
        let templates = factory.vault_templates(deposit_outpoint, amount, derivation_index)?;
        let collectors = new_collectors(factory, &keys, &templates);

        let id = db_insert_vault(
            &db_path,
            &NewDbVault {
                wallet_id: self.wallet_id,
                status: VaultStatus::Funding,
                blockheight: 0,
                deposit_outpoint: &deposit_outpoint,
                amount,
                derivation_index,
                presigned: templates
                    .iter()
                    .map(|t| (t.kind, t.txid(), t.digest))
                    .collect(),
            },
        )?;
        self.advance_index(derivation_index)?;

        let vault = Vault {
            id,
            deposit_outpoint,
            amount,
            derivation_index,
            status: VaultStatus::Funding,
            blockheight: 0,
            unvault_height: None,
            moved_at: None,
            final_txid: None,
            final_kind: None,
            replicated: false,
            unvault_authorized: false,
            keys,
            templates,
            spend: None,
            collectors,
            broadcasts: vec![],
        };
        let snapshot = vault.snapshot();
        self.vaults
            .write()
            .unwrap()
            .insert(deposit_outpoint, Arc::new(Mutex::new(vault)));
        log::info!(
            "New vault at '{}' for {} (derivation index '{}')",
            deposit_outpoint,
            amount,
            derivation_index
        );

        Ok(Some(snapshot))
    }

    // Apply an event to a locked vault, and persist the result.
    fn apply(&self, vault: &mut Vault, event: &VaultEvent) -> Result<VaultStatus, RegistryError> {
        let next = transition(vault.status, event, vault.revocation_progress()).map_err(|e| {
            log::debug!("Vault '{}': {}", vault.deposit_outpoint, e);
            e
        })?;
        let previous = (
            vault.status,
            vault.blockheight,
            vault.unvault_height,
            vault.moved_at,
            vault.final_txid,
            vault.final_kind,
        );

        match *event {
            VaultEvent::DepositConfirmed { height } => vault.blockheight = height,
            VaultEvent::DepositUnconfirmed => {
                log::info!(
                    "Deposit of vault '{}' went back under {} confirmations",
                    vault.deposit_outpoint,
                    self.custodyd.min_conf
                );
                vault.blockheight = 0;
            }
            VaultEvent::Confirmed {
                kind: TransactionKind::Unvault,
                height,
                ..
            } => vault.unvault_height = Some(height),
            VaultEvent::Confirmed { kind, txid, height } => {
                vault.moved_at = Some(height);
                vault.final_txid = Some(txid);
                vault.final_kind = Some(kind);
            }
            VaultEvent::Unconfirmed(kind) => {
                log::info!(
                    "{} transaction of vault '{}' was reorged out, going back to '{}'",
                    kind,
                    vault.deposit_outpoint,
                    next
                );
                if kind == TransactionKind::Unvault {
                    vault.unvault_height = None;
                } else {
                    vault.moved_at = None;
                    vault.final_txid = None;
                    vault.final_kind = None;
                }
            }
            VaultEvent::CollectionStarted
            | VaultEvent::RevocationsFinalized
            | VaultEvent::Matured
            | VaultEvent::Buried(_) => {}
        }

        log::debug!(
            "Vault '{}': '{}' -> '{}' ({})",
            vault.deposit_outpoint,
            vault.status,
            next,
            event
        );
        vault.status = next;
        let stored = db_update_vault(&self.custodyd.db_file(), vault.id, &vault.db_state());
        if let Err(e) = stored {
            // Memory must never be ahead of the database
            let (status, blockheight, unvault_height, moved_at, final_txid, final_kind) = previous;
            vault.status = status;
            vault.blockheight = blockheight;
            vault.unvault_height = unvault_height;
            vault.moved_at = moved_at;
            vault.final_txid = final_txid;
            vault.final_kind = final_kind;
            return Err(e.into());
        }

        Ok(next)
    }

    // The status changes that follow from the collection state, if any.
    fn catch_up_collection(&self, vault: &mut Vault) -> Result<(), RegistryError> {
        let progress = vault.revocation_progress();
        if vault.status == VaultStatus::Funded && progress != RevocationProgress::NotStarted {
            self.apply(vault, &VaultEvent::CollectionStarted)?;
        }
        if vault.status == VaultStatus::Securing && progress == RevocationProgress::Finalized {
            self.apply(vault, &VaultEvent::RevocationsFinalized)?;
            log::info!("Vault '{}' is now secured", vault.deposit_outpoint);
        }
        Ok(())
    }

    /// Add a signature to a presigned transaction of a vault. It is validated against the
    /// transaction digest and the signer role, and never counted if invalid.
    pub fn record_signature(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
        signer: secp256k1::PublicKey,
        signature: secp256k1::Signature,
    ) -> Result<Admission, RegistryError> {
        let mut signatures = BTreeMap::new();
        signatures.insert(signer, signature);
        let admissions = self.record_signatures(deposit_outpoint, kind, &signatures)?;
        Ok(admissions.into_iter().next().unwrap_or(Admission::Unchanged))
    }

    /// Add a set of signatures to a presigned transaction of a vault. Either they are all
    /// valid for the digest and the roles of their signers and they are all recorded, or
    /// none of them is. They only count once stored in database.
    pub fn record_signatures(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
        signatures: &BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
    ) -> Result<Vec<Admission>, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let mut vault = vault.lock().unwrap();
        let secp = &self.custodyd.secp_ctx;

        let mut collector = vault
            .collectors
            .get(&kind)
            .cloned()
            .ok_or(RegistryError::NoSpend(*deposit_outpoint))?;
        for (signer, signature) in signatures.iter() {
            collector.check(secp, signer, signature).map_err(|e| {
                log::warn!("Vault '{}': rejected signature: {}", deposit_outpoint, e);
                e
            })?;
        }

        let was_finalized = collector.is_finalized();
        let mut admissions = Vec::with_capacity(signatures.len());
        let mut new_sigs = Vec::with_capacity(signatures.len());
        for (signer, signature) in signatures.iter() {
            let admission = collector.add_signature(secp, *signer, *signature)?;
            if admission != Admission::Unchanged {
                new_sigs.push((*signer, *signature));
            }
            admissions.push(admission);
        }
        let finalized = !was_finalized && collector.is_finalized();

        if !new_sigs.is_empty() || finalized {
            db_store_signatures(
                &self.custodyd.db_file(),
                vault.id,
                kind,
                &new_sigs,
                finalized,
            )?;
        }
        vault.collectors.insert(kind, collector);
        if finalized {
            log::info!(
                "{} transaction of vault '{}' is finalized",
                kind,
                deposit_outpoint
            );
        }
        if kind.is_revocation() {
            self.catch_up_collection(&mut vault)?;
        }

        Ok(admissions)
    }

    /// A transaction of this vault got all its signatures. Applies the status change this
    /// implies, if any.
    pub fn record_transaction_finalized(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
    ) -> Result<VaultStatus, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let mut vault = vault.lock().unwrap();

        if !vault.is_finalized(kind) {
            return Err(RegistryError::NotFinalized(*deposit_outpoint, kind));
        }
        if kind.is_revocation() {
            self.catch_up_collection(&mut vault)?;
        }

        Ok(vault.status)
    }

    /// Apply something that happened on chain to this vault. Vaults reaching a terminal status
    /// are archived.
    pub fn record_chain_event(
        &self,
        deposit_outpoint: &OutPoint,
        event: VaultEvent,
    ) -> Result<VaultStatus, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;

        let status = {
            let mut vault = vault.lock().unwrap();
            let status = self.apply(&mut vault, &event).map_err(|e| {
                log::warn!("Vault '{}': {}", deposit_outpoint, e);
                e
            })?;

            // Signatures may have been gathered before the deposit was deep enough
            if let VaultEvent::DepositConfirmed { .. } = event {
                self.catch_up_collection(&mut vault)?;
            }
            if status.is_terminal() {
                db_archive_vault(&self.custodyd.db_file(), vault.id)?;
            }

            vault.status
        };

        if status.is_terminal() {
            self.vaults.write().unwrap().remove(deposit_outpoint);
            log::info!("Vault '{}' is '{}', archived", deposit_outpoint, status);
        }

        Ok(status)
    }

    pub fn snapshot(&self, deposit_outpoint: &OutPoint) -> Result<VaultSnapshot, RegistryError> {
        Ok(self.vault(deposit_outpoint)?.lock().unwrap().snapshot())
    }

    /// A snapshot of every active vault
    pub fn snapshots(&self) -> Vec<VaultSnapshot> {
        self.all_vaults()
            .into_iter()
            .map(|vault| vault.lock().unwrap().snapshot())
            .collect()
    }

    pub fn template(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
    ) -> Result<PresignedTemplate, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let vault = vault.lock().unwrap();
        vault
            .template(kind)
            .cloned()
            .ok_or(RegistryError::NoSpend(*deposit_outpoint))
    }

    fn finalize_locked(&self, vault: &Vault, kind: TransactionKind) -> Result<Transaction, RegistryError> {
        let outpoint = vault.deposit_outpoint;
        let (template, collector) = match (vault.template(kind), vault.collectors.get(&kind)) {
            (Some(t), Some(c)) if c.is_finalized() => (t, c),
            (None, _) => return Err(RegistryError::NoSpend(outpoint)),
            _ => return Err(RegistryError::NotFinalized(outpoint, kind)),
        };

        Ok(template.finalize(
            &self.custodyd.secp_ctx,
            &vault.keys,
            collector.signatures(),
        )?)
    }

    /// The fully signed transaction of this kind, if finalized.
    pub fn finalized_transaction(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
    ) -> Result<Transaction, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let vault = vault.lock().unwrap();
        self.finalize_locked(&vault, kind)
    }

    /// The presigned transactions of a vault, along with who signed them.
    pub fn presigned(&self, deposit_outpoint: &OutPoint) -> Result<Vec<PresignedView>, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let vault = vault.lock().unwrap();

        Ok(vault
            .collectors
            .iter()
            .filter_map(|(kind, collector)| {
                let template = vault.template(*kind)?;
                Some(PresignedView {
                    kind: *kind,
                    txid: template.txid(),
                    digest: template.digest,
                    signers: collector.signatures().keys().copied().collect(),
                    state: collector.state(),
                    transaction: self.finalize_locked(&vault, *kind).ok(),
                })
            })
            .collect())
    }

    /// Set the Spend transaction of a vault, paying to these destinations. Any previous Spend
    /// and its signatures are dropped.
    pub fn set_spend(
        &self,
        deposit_outpoint: &OutPoint,
        destinations: Vec<TxOut>,
    ) -> Result<PresignedTemplate, RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let mut vault = vault.lock().unwrap();

        match vault.status {
            VaultStatus::Secured | VaultStatus::Unvaulting | VaultStatus::Unvaulted => {}
            status => return Err(RegistryError::WrongStatus(*deposit_outpoint, status)),
        }

        let factory = &self.custodyd.factory;
        let template =
            factory.spend_template(&vault.templates.unvault, vault.derivation_index, destinations)?;
        db_set_spend(
            &self.custodyd.db_file(),
            vault.id,
            &template.digest,
            template.tx(),
        )?;

        let collector = QuorumCollector::new(
            TransactionKind::Spend,
            template.message(),
            vault.keys.clone(),
            factory.participants(),
        );
        vault.collectors.insert(TransactionKind::Spend, collector);
        vault.spend = Some(template.clone());
        log::info!(
            "New Spend transaction '{}' for vault '{}'",
            template.txid(),
            deposit_outpoint
        );

        Ok(template)
    }

    /// Remember we broadcast the Unvault of this vault ourselves.
    pub fn authorize_unvault(&self, deposit_outpoint: &OutPoint) -> Result<(), RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let mut vault = vault.lock().unwrap();
        if !vault.unvault_authorized {
            db_mark_unvault_authorized(&self.custodyd.db_file(), vault.id)?;
            vault.unvault_authorized = true;
        }
        Ok(())
    }

    pub fn mark_replicated(&self, deposit_outpoint: &OutPoint) -> Result<(), RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let mut vault = vault.lock().unwrap();
        if !vault.replicated {
            db_mark_replicated(&self.custodyd.db_file(), vault.id)?;
            vault.replicated = true;
        }
        Ok(())
    }

    pub fn record_broadcast(
        &self,
        deposit_outpoint: &OutPoint,
        kind: TransactionKind,
        feerate: u64,
        height: u32,
        tx: &Transaction,
    ) -> Result<(), RegistryError> {
        let vault = self.vault(deposit_outpoint)?;
        let mut vault = vault.lock().unwrap();
        let txid = tx.txid();
        if vault.broadcasts.contains(&(kind, txid)) || vault.template(kind).map(|t| t.txid()) == Some(txid) {
            return Ok(());
        }
        db_insert_broadcast(&self.custodyd.db_file(), vault.id, kind, feerate, height, tx)?;
        vault.broadcasts.push((kind, txid));
        Ok(())
    }

    /// The transactions whose signatures we are still looking for.
    pub fn pending_collections(&self) -> Vec<PendingCollection> {
        let mut pending = vec![];

        for vault in self.all_vaults() {
            let vault = vault.lock().unwrap();
            let collecting_spend = matches!(
                vault.status,
                VaultStatus::Secured | VaultStatus::Unvaulting | VaultStatus::Unvaulted
            );
            let collecting_presigned = matches!(
                vault.status,
                VaultStatus::Funding
                    | VaultStatus::Funded
                    | VaultStatus::Securing
                    | VaultStatus::Secured
            );

            for (kind, collector) in vault.collectors.iter() {
                let wanted = match kind {
                    TransactionKind::Spend => collecting_spend,
                    _ => collecting_presigned,
                };
                if !wanted || collector.is_finalized() {
                    continue;
                }
                if let Some(template) = vault.template(*kind) {
                    pending.push(PendingCollection {
                        deposit_outpoint: vault.deposit_outpoint,
                        derivation_index: vault.derivation_index,
                        kind: *kind,
                        txid: template.txid(),
                        signatures: collector.signatures().clone(),
                    });
                }
            }
        }

        pending
    }

    /// The revocation signatures of the vaults that are secured but whose watchtowers don't
    /// know about yet.
    pub fn unreplicated_vaults(&self) -> Vec<RevocationSigs> {
        self.all_vaults()
            .into_iter()
            .filter_map(|vault| {
                let vault = vault.lock().unwrap();
                let relevant = matches!(
                    vault.status,
                    VaultStatus::Secured | VaultStatus::Unvaulting | VaultStatus::Unvaulted
                );
                if vault.replicated
                    || !relevant
                    || vault.revocation_progress() != RevocationProgress::Finalized
                {
                    return None;
                }

                let sigs_of = |kind: TransactionKind| {
                    vault
                        .collectors
                        .get(&kind)
                        .map(|c| c.signatures().clone())
                        .unwrap_or_default()
                };
                Some(RevocationSigs {
                    deposit_outpoint: vault.deposit_outpoint,
                    derivation_index: vault.derivation_index,
                    cancel: sigs_of(TransactionKind::Cancel),
                    emergency: sigs_of(TransactionKind::Emergency),
                    unvault_emergency: sigs_of(TransactionKind::UnvaultEmergency),
                })
            })
            .collect()
    }
}
