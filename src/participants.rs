//! The fixed set of participants and the quorum each kind of presigned transaction needs.
//!
//! Participants are never referenced by vaults directly: a vault only knows the public keys
//! derived at its index, and we look the role up by key in the table.

use crate::{config::Config, transactions::TransactionKind};

use revault_net::noise::PublicKey as NoisePubkey;
use revault_tx::bitcoin::{
    secp256k1,
    util::bip32::{self, ChildNumber, ExtendedPubKey},
    PublicKey as BitcoinPubKey,
};

use std::{fmt, net::SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Stakeholder,
    Manager,
    Cosigner,
    Watchtower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stakeholder => write!(f, "stakeholder"),
            Self::Manager => write!(f, "manager"),
            Self::Cosigner => write!(f, "cosigner"),
            Self::Watchtower => write!(f, "watchtower"),
        }
    }
}

// Every participant of these roles must sign. The Spend goes through the managers' branch of
// the Unvault output, the cosigners' keys are one per stakeholder.
const REVOCATION_QUORUM: &[Role] = &[Role::Stakeholder];
const UNVAULT_QUORUM: &[Role] = &[Role::Stakeholder, Role::Manager];
const SPEND_QUORUM: &[Role] = &[Role::Manager, Role::Cosigner];

/// The roles whose signatures a transaction kind requires.
pub fn quorum_roles(kind: TransactionKind) -> &'static [Role] {
    match kind {
        TransactionKind::Cancel
        | TransactionKind::Emergency
        | TransactionKind::UnvaultEmergency => REVOCATION_QUORUM,
        TransactionKind::Unvault => UNVAULT_QUORUM,
        TransactionKind::Spend => SPEND_QUORUM,
    }
}

impl Role {
    /// Whether a signature from this role may count toward this kind's quorum
    pub fn may_sign(&self, kind: TransactionKind) -> bool {
        quorum_roles(kind).contains(self)
    }
}

/// A participant, as set in the configuration.
#[derive(Debug, Clone)]
pub enum ParticipantKey {
    Extended(ExtendedPubKey),
    Static(BitcoinPubKey),
    /// Watchtowers only have a communication key
    None,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub role: Role,
    pub key: ParticipantKey,
    pub host: Option<SocketAddr>,
    pub noise_key: Option<NoisePubkey>,
}

/// The public keys of all participants at a given derivation index, each role's keys sorted
/// by their compressed serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultKeys {
    pub stakeholders: Vec<secp256k1::PublicKey>,
    pub managers: Vec<secp256k1::PublicKey>,
    pub cosigners: Vec<secp256k1::PublicKey>,
}

impl VaultKeys {
    /// Which role does this key have for this vault?
    pub fn role_of(&self, key: &secp256k1::PublicKey) -> Option<Role> {
        if self.stakeholders.contains(key) {
            Some(Role::Stakeholder)
        } else if self.managers.contains(key) {
            Some(Role::Manager)
        } else if self.cosigners.contains(key) {
            Some(Role::Cosigner)
        } else {
            None
        }
    }

    pub fn keys_of(&self, role: Role) -> &[secp256k1::PublicKey] {
        match role {
            Role::Stakeholder => &self.stakeholders,
            Role::Manager => &self.managers,
            Role::Cosigner => &self.cosigners,
            Role::Watchtower => &[],
        }
    }
}

pub fn sort_keys(keys: &mut Vec<secp256k1::PublicKey>) {
    keys.sort_by_key(|k| k.serialize());
}

/// The participants table, built once from the configuration.
#[derive(Debug, Clone)]
pub struct ParticipantTable {
    participants: Vec<Participant>,
}

impl ParticipantTable {
    pub fn from_config(config: &Config) -> ParticipantTable {
        let mut participants = Vec::with_capacity(
            config.stakeholders_xpubs.len()
                + config.managers_xpubs.len()
                + config.cosigners_keys.len(),
        );

        participants.extend(config.stakeholders_xpubs.iter().map(|xpub| Participant {
            role: Role::Stakeholder,
            key: ParticipantKey::Extended(*xpub),
            host: None,
            noise_key: None,
        }));
        participants.extend(config.managers_xpubs.iter().map(|xpub| Participant {
            role: Role::Manager,
            key: ParticipantKey::Extended(*xpub),
            host: None,
            noise_key: None,
        }));

        // We only know the servers of the cosigners we talk to, ie if we are a manager.
        let cosig_servers = config
            .manager_config
            .as_ref()
            .map(|man| man.cosigners.as_slice())
            .unwrap_or(&[]);
        participants.extend(
            config
                .cosigners_keys
                .iter()
                .enumerate()
                .map(|(i, key)| Participant {
                    role: Role::Cosigner,
                    key: ParticipantKey::Static(*key),
                    host: cosig_servers.get(i).map(|c| c.host),
                    noise_key: cosig_servers.get(i).map(|c| c.noise_key),
                }),
        );

        if let Some(ref stk_config) = config.stakeholder_config {
            participants.extend(stk_config.watchtowers.iter().map(|wt| Participant {
                role: Role::Watchtower,
                key: ParticipantKey::None,
                host: Some(wt.host),
                noise_key: Some(wt.noise_key),
            }));
        }

        ParticipantTable { participants }
    }

    pub fn participants(&self, role: Role) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(move |p| p.role == role)
    }

    pub fn count(&self, role: Role) -> usize {
        self.participants(role).count()
    }

    /// The watchtowers' (host, Noise key)
    pub fn watchtowers(&self) -> Vec<(SocketAddr, NoisePubkey)> {
        self.participants(Role::Watchtower)
            .filter_map(|p| Some((p.host?, p.noise_key?)))
            .collect()
    }

    /// Derive the keys of every participant at this (unhardened) index.
    pub fn keys_at<C: secp256k1::Verification>(
        &self,
        secp: &secp256k1::Secp256k1<C>,
        index: ChildNumber,
    ) -> Result<VaultKeys, bip32::Error> {
        let mut keys = VaultKeys {
            stakeholders: Vec::with_capacity(self.count(Role::Stakeholder)),
            managers: Vec::with_capacity(self.count(Role::Manager)),
            cosigners: Vec::with_capacity(self.count(Role::Cosigner)),
        };

        for participant in self.participants.iter() {
            let pubkey = match participant.key {
                ParticipantKey::Extended(ref xpub) => xpub.ckd_pub(secp, index)?.public_key.key,
                ParticipantKey::Static(ref key) => key.key,
                ParticipantKey::None => continue,
            };
            match participant.role {
                Role::Stakeholder => keys.stakeholders.push(pubkey),
                Role::Manager => keys.managers.push(pubkey),
                Role::Cosigner => keys.cosigners.push(pubkey),
                Role::Watchtower => {}
            }
        }

        sort_keys(&mut keys.stakeholders);
        sort_keys(&mut keys.managers);
        sort_keys(&mut keys.cosigners);

        Ok(keys)
    }
}
