//! Accumulation of the signatures of one presigned transaction until its quorum is met.

use crate::{
    participants::{quorum_roles, ParticipantTable, Role, VaultKeys},
    signatures::{validate, SignatureError},
    transactions::TransactionKind,
};

use revault_tx::bitcoin::secp256k1;

use std::{collections::BTreeMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    NotStarted,
    CollectingSignatures,
    ThresholdReached,
    Finalized,
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::CollectingSignatures => write!(f, "collecting"),
            Self::ThresholdReached => write!(f, "threshold_reached"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

/// What happened to a valid signature we were given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// From a signer we had no signature from yet
    New,
    /// Replaced the previous signature of this signer
    Replaced,
    /// We already had this exact signature, or the transaction was already finalized
    Unchanged,
}

/// The signatures collected for one kind of presigned transaction of one vault.
#[derive(Debug, Clone)]
pub struct QuorumCollector {
    kind: TransactionKind,
    digest: secp256k1::Message,
    keys: VaultKeys,
    /// How many signatures of each role we need
    required: Vec<(Role, usize)>,
    signatures: BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
    state: CollectionState,
}

impl QuorumCollector {
    pub fn new(
        kind: TransactionKind,
        digest: secp256k1::Message,
        keys: VaultKeys,
        participants: &ParticipantTable,
    ) -> QuorumCollector {
        let required = quorum_roles(kind)
            .iter()
            .map(|role| (*role, participants.count(*role)))
            .collect();

        QuorumCollector {
            kind,
            digest,
            keys,
            required,
            signatures: BTreeMap::new(),
            state: CollectionState::NotStarted,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn is_finalized(&self) -> bool {
        self.state == CollectionState::Finalized
    }

    pub fn digest(&self) -> &secp256k1::Message {
        &self.digest
    }

    pub fn signatures(&self) -> &BTreeMap<secp256k1::PublicKey, secp256k1::Signature> {
        &self.signatures
    }

    fn count(&self, role: Role) -> usize {
        self.signatures
            .keys()
            .filter(|k| self.keys.role_of(k) == Some(role))
            .count()
    }

    fn threshold_met(&self) -> bool {
        self.required
            .iter()
            .all(|(role, required)| self.count(*role) >= *required)
    }

    /// The keys whose signature we still need, in role then key order. When only a subset
    /// of a role must sign, all its signers are missing until the subset is reached.
    pub fn missing_signers(&self) -> Vec<secp256k1::PublicKey> {
        if self.is_finalized() {
            return vec![];
        }

        self.required
            .iter()
            .filter(|(role, required)| self.count(*role) < *required)
            .flat_map(|(role, _)| self.keys.keys_of(*role).iter())
            .filter(|k| !self.signatures.contains_key(k))
            .copied()
            .collect()
    }

    /// Whether this signature would be accepted: the signer must be one of the roles that sign
    /// this kind of transaction, and the signature must be valid for its digest.
    pub fn check<C: secp256k1::Verification>(
        &self,
        secp: &secp256k1::Secp256k1<C>,
        signer: &secp256k1::PublicKey,
        signature: &secp256k1::Signature,
    ) -> Result<(), SignatureError> {
        let role = self.keys.role_of(signer);
        if !role.map(|r| r.may_sign(self.kind)).unwrap_or(false) {
            return Err(SignatureError::RoleMismatch {
                signer: *signer,
                kind: self.kind,
                role,
            });
        }

        if !validate(secp, &self.digest, signer, signature) {
            return Err(SignatureError::Invalid {
                signer: *signer,
                kind: self.kind,
            });
        }

        Ok(())
    }

    /// Try to add a signature to this transaction. A valid signature replaces any previous one
    /// from the same signer, and is ignored once the transaction is finalized.
    pub fn add_signature<C: secp256k1::Verification>(
        &mut self,
        secp: &secp256k1::Secp256k1<C>,
        signer: secp256k1::PublicKey,
        signature: secp256k1::Signature,
    ) -> Result<Admission, SignatureError> {
        self.check(secp, &signer, &signature)?;

        if self.is_finalized() {
            return Ok(Admission::Unchanged);
        }

        let admission = match self.signatures.insert(signer, signature) {
            None => Admission::New,
            Some(previous) if previous == signature => Admission::Unchanged,
            Some(_) => Admission::Replaced,
        };
        self.state = CollectionState::CollectingSignatures;

        if self.threshold_met() {
            self.state = CollectionState::ThresholdReached;
            self.finalize(secp);
        }

        Ok(admission)
    }

    // Check the whole set once more before declaring it final. Any signature that does not
    // verify anymore is dropped and we keep collecting.
    fn finalize<C: secp256k1::Verification>(&mut self, secp: &secp256k1::Secp256k1<C>) {
        let digest = self.digest;
        let before = self.signatures.len();
        self.signatures
            .retain(|key, sig| validate(secp, &digest, key, sig));

        if self.signatures.len() != before {
            log::error!(
                "Dropped {} signature(s) for {} transaction that did not validate anymore",
                before - self.signatures.len(),
                self.kind
            );
            self.state = CollectionState::CollectingSignatures;
            return;
        }

        self.state = CollectionState::Finalized;
    }
}
