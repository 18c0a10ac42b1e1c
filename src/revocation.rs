//! The revocation guard.
//!
//! It gates our own Unvault broadcasts behind the revocation transactions being finalized and
//! replicated, and races any unvault we did not authorize with the vault's Cancel transaction,
//! bumping its fees until it confirms or until it is too late.

use crate::{
    bitcoind::{BitcoindError, ChainClient},
    registry::{RegistryError, VaultRegistry, VaultSnapshot, VaultStatus},
    transactions::{TransactionKind, CANCEL_FEERATE},
};

use revault_tx::bitcoin::{OutPoint, Transaction};

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

#[derive(Debug)]
pub enum GuardError {
    /// An Unvault was (or was about to be) broadcast while the revocation transactions aren't
    /// all finalized.
    SafetyViolation(OutPoint),
    /// The Unvault timelock matured (or is about to) and our Cancel didn't confirm.
    MarginExhausted(OutPoint),
    /// The revocation signatures of this vault are not replicated to all our watchtowers yet
    NotReplicated(OutPoint),
    Registry(RegistryError),
    Chain(BitcoindError),
}

impl GuardError {
    /// Whether we must stop operating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GuardError::SafetyViolation(_) | GuardError::MarginExhausted(_)
        )
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SafetyViolation(outpoint) => write!(
                f,
                "SAFETY VIOLATION: Unvault of vault '{}' without finalized revocation transactions",
                outpoint
            ),
            Self::MarginExhausted(outpoint) => write!(
                f,
                "Cancel of vault '{}' could not be confirmed before the Unvault timelock \
                 expiration. Funds are no longer protected by the Cancel.",
                outpoint
            ),
            Self::NotReplicated(outpoint) => write!(
                f,
                "Revocation signatures of vault '{}' are not replicated to all the watchtowers",
                outpoint
            ),
            Self::Registry(e) => write!(f, "{}", e),
            Self::Chain(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GuardError {}

impl From<RegistryError> for GuardError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<BitcoindError> for GuardError {
    fn from(e: BitcoindError) -> Self {
        Self::Chain(e)
    }
}

/// A Cancel transaction we sent to the network
#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    /// The feerate we bumped to in sat/vbyte, None for the presigned transaction
    feerate: Option<u64>,
    height: u32,
    accepted: bool,
}

#[derive(Debug, Clone)]
struct CancelRace {
    unvault_height: u32,
    /// Whether we broadcast the Cancel. Unvaults we authorized are only canceled on demand.
    armed: bool,
    /// Whether the Cancel must be confirmed before the timelock expires. Unset for the races
    /// started by hand after the expiration.
    bounded: bool,
    last_attempt: Option<Attempt>,
}

pub struct RevocationGuard {
    registry: Arc<VaultRegistry>,
    races: Mutex<HashMap<OutPoint, CancelRace>>,
}

impl RevocationGuard {
    pub fn new(registry: Arc<VaultRegistry>) -> RevocationGuard {
        RevocationGuard {
            registry,
            races: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<VaultRegistry> {
        &self.registry
    }

    /// Gate to our own Unvault broadcast. On success the Unvault is registered as authorized
    /// and the fully signed transaction is returned.
    pub fn authorize_unvault(&self, deposit_outpoint: &OutPoint) -> Result<Transaction, GuardError> {
        let snapshot = self.registry.snapshot(deposit_outpoint)?;

        if !snapshot.revocations_finalized() {
            let e = GuardError::SafetyViolation(*deposit_outpoint);
            log::error!("Refusing to broadcast the Unvault: {}", e);
            return Err(e);
        }
        if snapshot.status != VaultStatus::Secured {
            return Err(RegistryError::WrongStatus(*deposit_outpoint, snapshot.status).into());
        }
        let custodyd = self.registry.custodyd();
        if !snapshot.replicated && !custodyd.watchtowers.is_empty() {
            return Err(GuardError::NotReplicated(*deposit_outpoint));
        }

        let unvault_tx = self
            .registry
            .finalized_transaction(deposit_outpoint, TransactionKind::Unvault)?;
        self.registry.authorize_unvault(deposit_outpoint)?;
        log::info!("Unvault of vault '{}' authorized", deposit_outpoint);

        Ok(unvault_tx)
    }

    /// An Unvault got confirmed at this height. Starts the Cancel race unless we authorized it.
    pub fn on_unvault_confirmed(
        &self,
        snapshot: &VaultSnapshot,
        unvault_height: u32,
    ) -> Result<(), GuardError> {
        let outpoint = snapshot.deposit_outpoint;
        if !snapshot.is_finalized(TransactionKind::Cancel) {
            let e = GuardError::SafetyViolation(outpoint);
            log::error!("{}", e);
            return Err(e);
        }

        let armed = !snapshot.unvault_authorized;
        if armed {
            log::warn!(
                "Unauthorized Unvault of vault '{}' confirmed at height {}. Canceling it.",
                outpoint,
                unvault_height
            );
        } else {
            log::info!(
                "Unvault of vault '{}' confirmed at height {}",
                outpoint,
                unvault_height
            );
        }
        self.races.lock().unwrap().insert(
            outpoint,
            CancelRace {
                unvault_height,
                armed,
                bounded: true,
                last_attempt: None,
            },
        );

        Ok(())
    }

    /// An Unvault confirmed for a vault whose revocation transactions are not all finalized.
    /// The vault keeps its status, the violation is reported at every poll while it lasts.
    pub fn on_unsecured_unvault(&self, snapshot: &VaultSnapshot, unvault_height: u32) -> GuardError {
        let e = GuardError::SafetyViolation(snapshot.deposit_outpoint);
        log::error!(
            "{}. Unvault confirmed at height {} while the vault is '{}'.",
            e,
            unvault_height,
            snapshot.status
        );
        e
    }

    /// The Unvault of this vault got reorged out. There is nothing to cancel anymore.
    pub fn on_unvault_unconfirmed(&self, deposit_outpoint: &OutPoint) {
        if self.races.lock().unwrap().remove(deposit_outpoint).is_some() {
            log::info!(
                "Unvault of vault '{}' unconfirmed, stopping the Cancel race",
                deposit_outpoint
            );
        }
    }

    /// Cancel the Unvault of this vault, whether we authorized it or not.
    pub fn revault(&self, deposit_outpoint: &OutPoint) -> Result<(), GuardError> {
        let snapshot = self.registry.snapshot(deposit_outpoint)?;
        let unvault_height = match (snapshot.status, snapshot.unvault_height) {
            (VaultStatus::Unvaulting | VaultStatus::Unvaulted, Some(height)) => height,
            (status, _) => {
                return Err(RegistryError::WrongStatus(*deposit_outpoint, status).into());
            }
        };
        if !snapshot.is_finalized(TransactionKind::Cancel) {
            return Err(
                RegistryError::NotFinalized(*deposit_outpoint, TransactionKind::Cancel).into(),
            );
        }

        let bounded = snapshot.status == VaultStatus::Unvaulting;
        let mut races = self.races.lock().unwrap();
        let race = races.entry(*deposit_outpoint).or_insert(CancelRace {
            unvault_height,
            armed: false,
            bounded,
            last_attempt: None,
        });
        race.armed = true;
        race.bounded = bounded;
        log::info!("Revaulting vault '{}'", deposit_outpoint);

        Ok(())
    }

    /// Whether a Cancel race is being run for this vault
    pub fn is_racing(&self, deposit_outpoint: &OutPoint) -> bool {
        self.races
            .lock()
            .unwrap()
            .get(deposit_outpoint)
            .map(|race| race.armed)
            .unwrap_or(false)
    }

    // Pick up the unvaulted vaults we don't know about, for instance after a restart.
    fn sync_races(&self) -> Result<(), GuardError> {
        let snapshots = self.registry.snapshots();
        let mut races = self.races.lock().unwrap();

        races.retain(|outpoint, _| {
            snapshots.iter().any(|s| {
                &s.deposit_outpoint == outpoint
                    && matches!(s.status, VaultStatus::Unvaulting | VaultStatus::Unvaulted)
            })
        });

        let mut violation = None;
        for snapshot in snapshots.iter() {
            if let (VaultStatus::Unvaulting, Some(height)) =
                (snapshot.status, snapshot.unvault_height)
            {
                if !snapshot.is_finalized(TransactionKind::Cancel) {
                    let e = GuardError::SafetyViolation(snapshot.deposit_outpoint);
                    log::error!("{}", e);
                    violation.get_or_insert(e);
                    continue;
                }
                races.entry(snapshot.deposit_outpoint).or_insert(CancelRace {
                    unvault_height: height,
                    armed: !snapshot.unvault_authorized,
                    bounded: true,
                    last_attempt: None,
                });
            }
        }

        match violation {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // The feerate of the next attempt, None to broadcast the presigned Cancel.
    fn next_feerate(&self, race: &CancelRace, tip_height: u32, deadline: u32) -> Option<u64> {
        let config = &self.registry.custodyd().revocation_config;

        let last = match race.last_attempt {
            None => return None,
            Some(ref last) => last,
        };
        if race.bounded && tip_height >= deadline {
            return Some(config.max_feerate);
        }

        // The presigned Cancel feerate is in sat/WU, we bump in sat/vb
        let prev_feerate = last.feerate.unwrap_or(CANCEL_FEERATE * 4);
        Some(std::cmp::min(
            config.max_feerate,
            std::cmp::max(config.initial_feerate, prev_feerate * 2),
        ))
    }

    /// Drive the Cancel races at this tip: broadcast the Cancel transactions, bump the stuck
    /// ones. Every race is driven even if some of them are lost, the first fatal error is then
    /// returned.
    pub fn tick(&self, chain: &dyn ChainClient, tip_height: u32) -> Result<(), GuardError> {
        let mut first_error = self.sync_races().err();

        let races: Vec<(OutPoint, CancelRace)> = self
            .races
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, race)| race.armed)
            .map(|(outpoint, race)| (*outpoint, race.clone()))
            .collect();

        for (outpoint, race) in races {
            if let Err(e) = self.drive_race(chain, &outpoint, &race, tip_height) {
                log::error!("Error driving the Cancel race of vault '{}': '{}'", outpoint, e);
                // Fatal errors take precedence over transient ones
                match first_error {
                    Some(ref prev) if prev.is_fatal() || !e.is_fatal() => {}
                    _ => first_error = Some(e),
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn drive_race(
        &self,
        chain: &dyn ChainClient,
        outpoint: &OutPoint,
        race: &CancelRace,
        tip_height: u32,
    ) -> Result<(), GuardError> {
        let custodyd = self.registry.custodyd();
        let config = &custodyd.revocation_config;
        let maturity = race.unvault_height + custodyd.factory.unvault_csv();
        let deadline = maturity.saturating_sub(custodyd.cancel_margin);

        // The Unvault output can be spent in the next block
        if race.bounded && tip_height + 1 >= maturity {
            return Err(GuardError::MarginExhausted(*outpoint));
        }

        if let Some(ref last) = race.last_attempt {
            let stuck = tip_height >= last.height + config.bump_after_blocks;
            let max_reached = last.feerate == Some(config.max_feerate);
            if last.accepted && (!stuck || max_reached) {
                return Ok(());
            }
        }
        if race.bounded && tip_height >= deadline {
            log::error!(
                "Cancel of vault '{}' still unconfirmed at height {}, {} blocks before the \
                 Unvault timelock expiration. Bumping to the maximum feerate.",
                outpoint,
                tip_height,
                maturity - tip_height
            );
        }

        let feerate = self.next_feerate(race, tip_height, deadline);
        let attempt = self.attempt_cancel(chain, outpoint, feerate, tip_height)?;
        if let Some(r) = self.races.lock().unwrap().get_mut(outpoint) {
            r.last_attempt = Some(attempt);
        }

        Ok(())
    }

    fn attempt_cancel(
        &self,
        chain: &dyn ChainClient,
        outpoint: &OutPoint,
        feerate: Option<u64>,
        tip_height: u32,
    ) -> Result<Attempt, GuardError> {
        let presigned = self
            .registry
            .finalized_transaction(outpoint, TransactionKind::Cancel)?;
        let tx = match feerate {
            None => presigned,
            Some(feerate) => {
                let template = self.registry.template(outpoint, TransactionKind::Cancel)?;
                match chain.bump_revocation(&presigned, template.prevout_value, feerate) {
                    Ok(tx) => tx,
                    Err(e) => {
                        log::error!(
                            "Could not bump Cancel of vault '{}' to {}sat/vb: '{}'",
                            outpoint,
                            feerate,
                            e
                        );
                        return Ok(Attempt {
                            feerate: Some(feerate),
                            height: tip_height,
                            accepted: false,
                        });
                    }
                }
            }
        };

        let txid = tx.txid();
        let accepted = match chain.broadcast(&tx) {
            Ok(()) => {
                log::info!(
                    "Broadcast Cancel '{}' of vault '{}' ({})",
                    txid,
                    outpoint,
                    feerate
                        .map(|f| format!("bumped to {}sat/vb", f))
                        .unwrap_or_else(|| "presigned".to_string())
                );
                true
            }
            Err(e) => {
                log::warn!(
                    "Broadcast of Cancel '{}' of vault '{}' failed: '{}'",
                    txid,
                    outpoint,
                    e
                );
                false
            }
        };
        // Track it even if rejected, it may have made it to the network anyways
        if let Some(feerate) = feerate {
            self.registry.record_broadcast(
                outpoint,
                TransactionKind::Cancel,
                feerate,
                tip_height,
                &tx,
            )?;
        }

        Ok(Attempt {
            feerate,
            height: tip_height,
            accepted,
        })
    }
}
