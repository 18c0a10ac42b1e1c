//! Deterministic derivation of the presigned transactions of a vault.
//!
//! Every participant builds the exact same transactions out of the shared public
//! configuration, as signatures are only ever exchanged over the digests.

pub mod descriptors;

use crate::participants::{ParticipantTable, VaultKeys};
use descriptors::VaultDescriptors;

use revault_tx::{
    bitcoin::{
        blockdata::transaction::{OutPoint, SigHashType, Transaction, TxOut},
        secp256k1,
        util::{
            bip143::SigHashCache,
            bip32::{self, ChildNumber},
            psbt::PartiallySignedTransaction as Psbt,
        },
        Address, Amount, Network, PublicKey, SigHash, Txid,
    },
    error::{ScriptCreationError, TransactionCreationError},
    miniscript::{self, DescriptorTrait},
    scripts::EmergencyAddress,
    transactions::{transaction_chain, RevaultTransaction, SpendTransaction},
    txins::UnvaultTxIn,
    txouts::{SpendTxOut, UnvaultTxOut},
};

use std::{collections::BTreeMap, convert::TryFrom, fmt, str::FromStr};

pub use revault_tx::txins::RBF_SEQUENCE;

/// Feerate of the presigned Cancel transaction, in sat/WU (20sat/vb)
pub const CANCEL_FEERATE: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionKind {
    Unvault,
    Cancel,
    Emergency,
    UnvaultEmergency,
    Spend,
}

impl TransactionKind {
    /// The transactions that must be finalized before an Unvault may be broadcast
    pub const REVOCATIONS: [TransactionKind; 3] = [
        TransactionKind::Cancel,
        TransactionKind::Emergency,
        TransactionKind::UnvaultEmergency,
    ];

    pub fn is_revocation(&self) -> bool {
        Self::REVOCATIONS.contains(self)
    }

    /// Revocation transactions' signatures commit to a single input, so anyone can add
    /// fee-bumping inputs.
    pub fn sighash_type(&self) -> SigHashType {
        if self.is_revocation() {
            SigHashType::AllPlusAnyoneCanPay
        } else {
            SigHashType::All
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::Unvault => "unvault",
                Self::Cancel => "cancel",
                Self::Emergency => "emergency",
                Self::UnvaultEmergency => "unvault_emergency",
                Self::Spend => "spend",
            }
        )
    }
}

impl FromStr for TransactionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unvault" => Ok(Self::Unvault),
            "cancel" => Ok(Self::Cancel),
            "emergency" => Ok(Self::Emergency),
            "unvault_emergency" => Ok(Self::UnvaultEmergency),
            "spend" => Ok(Self::Spend),
            _ => Err(()),
        }
    }
}

impl TryFrom<u32> for TransactionKind {
    type Error = ();

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(Self::Unvault),
            1 => Ok(Self::Cancel),
            2 => Ok(Self::Emergency),
            3 => Ok(Self::UnvaultEmergency),
            4 => Ok(Self::Spend),
            _ => Err(()),
        }
    }
}

impl From<TransactionKind> for u32 {
    fn from(kind: TransactionKind) -> u32 {
        match kind {
            TransactionKind::Unvault => 0,
            TransactionKind::Cancel => 1,
            TransactionKind::Emergency => 2,
            TransactionKind::UnvaultEmergency => 3,
            TransactionKind::Spend => 4,
        }
    }
}

#[derive(Debug)]
pub enum ConstructionError {
    /// Deriving the participants' keys failed
    Derivation(bip32::Error),
    /// The participants' keys and the timelock don't make valid descriptors
    Descriptors(ScriptCreationError),
    Timelock(u32),
    EmergencyAddress(String),
    /// The presigned transactions could not be created, eg the deposit is too small
    Chain(revault_tx::Error),
    Spend(TransactionCreationError),
    Destinations(String),
    MissingSignature(TransactionKind, secp256k1::PublicKey),
    Psbt(TransactionKind, String),
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Derivation(e) => write!(f, "Deriving keys: '{}'", e),
            Self::Descriptors(e) => write!(f, "Compiling the descriptors: '{}'", e),
            Self::Timelock(csv) => write!(f, "Invalid relative timelock '{}'", csv),
            Self::EmergencyAddress(e) => write!(f, "Invalid Emergency address: {}", e),
            Self::Chain(e) => write!(f, "Creating the presigned transactions: '{}'", e),
            Self::Spend(e) => write!(f, "Creating the Spend transaction: '{}'", e),
            Self::Destinations(e) => write!(f, "Invalid Spend destinations: {}", e),
            Self::MissingSignature(kind, key) => {
                write!(f, "Missing signature by '{}' for {} transaction", key, kind)
            }
            Self::Psbt(kind, e) => write!(f, "Invalid {} transaction PSBT: {}", kind, e),
        }
    }
}

impl std::error::Error for ConstructionError {}

impl From<bip32::Error> for ConstructionError {
    fn from(e: bip32::Error) -> Self {
        Self::Derivation(e)
    }
}

impl From<ScriptCreationError> for ConstructionError {
    fn from(e: ScriptCreationError) -> Self {
        Self::Descriptors(e)
    }
}

impl From<revault_tx::Error> for ConstructionError {
    fn from(e: revault_tx::Error) -> Self {
        Self::Chain(e)
    }
}

/// An unsigned transaction of the chain, along with what we need to sign it.
#[derive(Debug, Clone, PartialEq)]
pub struct PresignedTemplate {
    pub kind: TransactionKind,
    psbt: Psbt,
    /// Value of the spent output
    pub prevout_value: Amount,
    /// Signature hash of the only input. Computed once at creation.
    pub digest: SigHash,
}

impl PresignedTemplate {
    fn new<T: RevaultTransaction>(
        kind: TransactionKind,
        tx: T,
    ) -> Result<PresignedTemplate, ConstructionError> {
        let psbt = tx.into_psbt();
        let (prevout_value, digest) = {
            let psbtin = psbt.inputs.first();
            let prevout = psbtin.and_then(|i| i.witness_utxo.as_ref());
            let script = psbtin.and_then(|i| i.witness_script.as_ref());
            match (prevout, script) {
                (Some(prevout), Some(script)) => (
                    prevout.value,
                    SigHashCache::new(&psbt.global.unsigned_tx).signature_hash(
                        0,
                        script,
                        prevout.value,
                        kind.sighash_type(),
                    ),
                ),
                _ => {
                    return Err(ConstructionError::Psbt(
                        kind,
                        "no previous output to sign for".to_string(),
                    ))
                }
            }
        };

        Ok(PresignedTemplate {
            kind,
            psbt,
            prevout_value: Amount::from_sat(prevout_value),
            digest,
        })
    }

    /// The unsigned transaction
    pub fn tx(&self) -> &Transaction {
        &self.psbt.global.unsigned_tx
    }

    pub fn txid(&self) -> Txid {
        self.tx().txid()
    }

    /// The digest, as signed by the participants
    pub fn message(&self) -> secp256k1::Message {
        secp256k1::Message::from_slice(&self.digest[..]).expect("A sighash is 32 bytes")
    }

    pub fn fee(&self) -> u64 {
        let out_value: u64 = self.tx().output.iter().map(|o| o.value).sum();
        self.prevout_value.as_sat().saturating_sub(out_value)
    }

    /// Get the fully signed transaction out of a set of signatures. The signatures are
    /// checked against the digest by the finalizer.
    pub fn finalize<C: secp256k1::Verification>(
        &self,
        secp: &secp256k1::Secp256k1<C>,
        keys: &VaultKeys,
        sigs: &BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
    ) -> Result<Transaction, ConstructionError> {
        // The managers' approvals of the Unvault aren't part of its witness, the Spend goes
        // through the timelocked branch.
        let signers: Vec<&secp256k1::PublicKey> = match self.kind {
            TransactionKind::Spend => keys.managers.iter().chain(keys.cosigners.iter()).collect(),
            _ => keys.stakeholders.iter().collect(),
        };
        if let Some(missing) = signers.iter().find(|k| !sigs.contains_key(k)) {
            return Err(ConstructionError::MissingSignature(self.kind, **missing));
        }

        let mut psbt = self.psbt.clone();
        let sighash_type = self.kind.sighash_type();
        let psbtin = psbt
            .inputs
            .get_mut(0)
            .ok_or_else(|| ConstructionError::Psbt(self.kind, "no input".to_string()))?;
        psbtin.sighash_type = Some(sighash_type);
        for key in signers {
            if let Some(sig) = sigs.get(key) {
                let mut raw = sig.serialize_der().to_vec();
                raw.push(sighash_type.as_u32() as u8);
                psbtin.partial_sigs.insert(
                    PublicKey {
                        compressed: true,
                        key: *key,
                    },
                    raw,
                );
            }
        }

        miniscript::psbt::finalize(&mut psbt, secp)
            .map_err(|e| ConstructionError::Psbt(self.kind, e.to_string()))?;
        Ok(psbt.extract_tx())
    }
}

/// The presigned transactions of a vault, known as soon as the deposit is.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultTemplates {
    pub unvault: PresignedTemplate,
    pub cancel: PresignedTemplate,
    pub emergency: PresignedTemplate,
    pub unvault_emergency: PresignedTemplate,
}

impl VaultTemplates {
    pub fn get(&self, kind: TransactionKind) -> Option<&PresignedTemplate> {
        match kind {
            TransactionKind::Unvault => Some(&self.unvault),
            TransactionKind::Cancel => Some(&self.cancel),
            TransactionKind::Emergency => Some(&self.emergency),
            TransactionKind::UnvaultEmergency => Some(&self.unvault_emergency),
            TransactionKind::Spend => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PresignedTemplate> {
        vec![
            &self.unvault,
            &self.cancel,
            &self.emergency,
            &self.unvault_emergency,
        ]
        .into_iter()
    }

    /// The Unvault output is always the first one, the second one is its CPFP output.
    pub fn unvault_outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.unvault.txid(),
            vout: 0,
        }
    }

    pub fn unvault_value(&self) -> Amount {
        // The Cancel spends the Unvault output
        self.cancel.prevout_value
    }
}

/// The destinations of a Spend transaction. Its first output is the CPFP one.
pub fn spend_destinations(spend_tx: &Transaction) -> Vec<TxOut> {
    spend_tx.output.iter().skip(1).cloned().collect()
}

/// The only thing that derives the transactions of a vault.
#[derive(Debug, Clone)]
pub struct TransactionFactory {
    participants: ParticipantTable,
    descriptors: VaultDescriptors,
    emergency_address: EmergencyAddress,
    network: Network,
    secp: secp256k1::Secp256k1<secp256k1::VerifyOnly>,
}

impl TransactionFactory {
    pub fn new(
        participants: ParticipantTable,
        emergency_address: Address,
        unvault_csv: u32,
        network: Network,
    ) -> Result<TransactionFactory, ConstructionError> {
        if unvault_csv == 0 || unvault_csv > 0xFFFF {
            return Err(ConstructionError::Timelock(unvault_csv));
        }
        let display_addr = emergency_address.to_string();
        let emergency_address = EmergencyAddress::from(emergency_address).map_err(|_| {
            ConstructionError::EmergencyAddress(format!("'{}' is not P2WSH", display_addr))
        })?;
        let descriptors = VaultDescriptors::new(&participants, unvault_csv)?;

        Ok(TransactionFactory {
            participants,
            descriptors,
            emergency_address,
            network,
            secp: secp256k1::Secp256k1::verification_only(),
        })
    }

    pub fn participants(&self) -> &ParticipantTable {
        &self.participants
    }

    pub fn descriptors(&self) -> &VaultDescriptors {
        &self.descriptors
    }

    pub fn unvault_csv(&self) -> u32 {
        self.descriptors.unvault.csv_value()
    }

    pub fn emergency_address(&self) -> &Address {
        self.emergency_address.address()
    }

    pub fn vault_keys(&self, index: ChildNumber) -> Result<VaultKeys, ConstructionError> {
        Ok(self.participants.keys_at(&self.secp, index)?)
    }

    pub fn deposit_address(&self, index: ChildNumber) -> Result<Address, ConstructionError> {
        let der_deposit = self.descriptors.deposit.derive(index, &self.secp);
        Ok(Address::p2wsh(
            &der_deposit.inner().explicit_script(),
            self.network,
        ))
    }

    pub fn unvault_address(&self, index: ChildNumber) -> Result<Address, ConstructionError> {
        let der_unvault = self.descriptors.unvault.derive(index, &self.secp);
        Ok(Address::p2wsh(
            &der_unvault.inner().explicit_script(),
            self.network,
        ))
    }

    /// Derive the Unvault, Cancel, Emergency and UnvaultEmergency transactions of the vault
    /// created by this deposit. Either all of them or none.
    pub fn vault_templates(
        &self,
        deposit_outpoint: OutPoint,
        amount: Amount,
        index: ChildNumber,
    ) -> Result<VaultTemplates, ConstructionError> {
        let (unvault, cancel_batch, emergency, unvault_emergency) = transaction_chain(
            deposit_outpoint,
            amount,
            &self.descriptors.deposit,
            &self.descriptors.unvault,
            &self.descriptors.cpfp,
            index,
            self.emergency_address.clone(),
            &self.secp,
        )?;

        Ok(VaultTemplates {
            unvault: PresignedTemplate::new(TransactionKind::Unvault, unvault)?,
            // Only the lowest feerate Cancel is presigned, we bump it ourselves
            cancel: PresignedTemplate::new(TransactionKind::Cancel, cancel_batch.into_feerate_20())?,
            emergency: PresignedTemplate::new(TransactionKind::Emergency, emergency)?,
            unvault_emergency: PresignedTemplate::new(
                TransactionKind::UnvaultEmergency,
                unvault_emergency,
            )?,
        })
    }

    /// Derive the Spend transaction of these destinations, spending this vault's Unvault
    /// output. A CPFP output is prepended, whatever is left is the fee.
    pub fn spend_template(
        &self,
        unvault: &PresignedTemplate,
        index: ChildNumber,
        destinations: Vec<TxOut>,
    ) -> Result<PresignedTemplate, ConstructionError> {
        if destinations.is_empty() {
            return Err(ConstructionError::Destinations(
                "A Spend must have at least one output".to_string(),
            ));
        }
        let unvault_txo = unvault.tx().output.first().ok_or_else(|| {
            ConstructionError::Psbt(TransactionKind::Unvault, "no output".to_string())
        })?;

        let der_unvault = self.descriptors.unvault.derive(index, &self.secp);
        let der_cpfp = self.descriptors.cpfp.derive(index, &self.secp);
        let unvault_txin = UnvaultTxIn::new(
            OutPoint {
                txid: unvault.txid(),
                vout: 0,
            },
            UnvaultTxOut::new(Amount::from_sat(unvault_txo.value), &der_unvault),
            self.unvault_csv(),
        );
        let spend = SpendTransaction::new(
            vec![unvault_txin],
            destinations.into_iter().map(SpendTxOut::new).collect(),
            None,
            &der_cpfp,
            0,
            true,
        )
        .map_err(ConstructionError::Spend)?;

        // The CPFP output isn't accounted for in the fees
        let out_value: u64 = spend.tx().output.iter().map(|o| o.value).sum();
        if out_value > unvault_txo.value {
            return Err(ConstructionError::Spend(
                TransactionCreationError::NegativeFees,
            ));
        }

        PresignedTemplate::new(TransactionKind::Spend, spend)
    }
}
