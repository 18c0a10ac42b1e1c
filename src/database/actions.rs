use crate::{
    custodyd::CustodyD,
    database::{
        interface::*,
        schema::{DbWallet, SCHEMA},
        DatabaseError, DB_VERSION,
    },
    registry::VaultStatus,
    transactions::TransactionKind,
};

use revault_tx::bitcoin::{
    consensus::encode, secp256k1, util::bip32::ChildNumber, Amount, OutPoint, SigHash,
    Transaction, Txid,
};

use std::{
    convert::TryInto,
    fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::params;

// Sqlite supports up to i64, thus rusqlite prevents us from inserting u64's.
// We use this to panic rather than inserting a truncated integer into the database (as we'd have
// done by using `n as u32`).
fn timestamp_to_u32(n: u64) -> u32 {
    n.try_into()
        .expect("Is this the year 2106 yet? Misconfigured system clock.")
}

// For some reasons rust-bitcoin store amounts as u64 instead of i64 (as does bitcoind), but SQLite
// does only support integers up to i64.
fn amount_to_i64(amount: &Amount) -> i64 {
    if amount.as_sat() > i64::MAX as u64 {
        log::error!("Invalid amount, larger than i64::MAX : {:?}", amount);
        std::process::exit(1);
    }
    amount.as_sat() as i64
}

// Create the db file with RW permissions only for the user
fn create_db_file(db_path: &Path) -> Result<(), std::io::Error> {
    let mut options = fs::OpenOptions::new();
    let options = options.read(true).write(true).create_new(true);

    #[cfg(unix)]
    return {
        use std::os::unix::fs::OpenOptionsExt;

        options.mode(0o600).open(db_path)?;
        Ok(())
    };

    #[cfg(not(unix))]
    return {
        options.open(db_path)?;
        Ok(())
    };
}

// No database yet ? In a single tx, create a new one from the schema and populate with the
// immutable part of our configuration.
fn create_db(custodyd: &CustodyD) -> Result<(), DatabaseError> {
    let db_path = custodyd.db_file();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| timestamp_to_u32(dur.as_secs()))
        .map_err(|e| DatabaseError(format!("Computing time since epoch: {}", e)))?;
    let fingerprint = custodyd.fingerprint();

    // Rusqlite could create it for us, but we want custom permissions
    create_db_file(&db_path).map_err(|e| DatabaseError(format!("Creating db file: {}", e)))?;

    db_exec(&db_path, |tx| {
        tx.execute_batch(SCHEMA)
            .map_err(|e| DatabaseError(format!("Creating database: {}", e)))?;
        tx.execute(
            "INSERT INTO version (version) VALUES (?1)",
            params![DB_VERSION],
        )
        .map_err(|e| DatabaseError(format!("Inserting version: {}", e)))?;
        tx.execute(
            "INSERT INTO wallets (timestamp, fingerprint, deposit_derivation_index) \
             VALUES (?1, ?2, ?3)",
            params![timestamp, fingerprint, 0u32],
        )
        .map_err(|e| DatabaseError(format!("Inserting wallet: {}", e)))?;

        Ok(())
    })
}

// Called on startup to check database integrity. The configuration fingerprint is checked by
// the registry, as it is a configuration error and not a database one.
fn check_db(custodyd: &CustodyD) -> Result<(), DatabaseError> {
    let db_path = custodyd.db_file();

    // Be strict with the version until we need migrations.
    let version = db_version(&db_path)?;
    if version != DB_VERSION {
        return Err(DatabaseError(format!(
            "Unexpected database version: got '{}', expected '{}'",
            version, DB_VERSION
        )));
    }

    Ok(())
}

/// This integrity checks the database, creating it first if it doesn't exist, and returns the
/// wallet.
pub fn setup_db(custodyd: &CustodyD) -> Result<DbWallet, DatabaseError> {
    let db_path = custodyd.db_file();
    if !db_path.exists() {
        log::info!("No database at {:?}, creating a new one.", db_path);
        create_db(custodyd)?;
    }

    check_db(custodyd)?;
    db_wallet(&db_path)
}

/// Advance the next unused derivation index. It never goes backward.
pub fn db_update_deposit_index(
    db_path: &Path,
    next_index: ChildNumber,
) -> Result<(), DatabaseError> {
    let next_index: u32 = next_index.into();
    db_exec(db_path, |tx| {
        tx.execute(
            "UPDATE wallets SET deposit_derivation_index = (?1) \
             WHERE deposit_derivation_index < (?1)",
            params![next_index],
        )
        .map_err(|e| DatabaseError(format!("Updating derivation index: {}", e)))?;
        Ok(())
    })
}

/// A vault to insert, along with the identifiers of its presigned transactions.
#[derive(Debug)]
pub struct NewDbVault<'a> {
    pub wallet_id: u32,
    pub status: VaultStatus,
    pub blockheight: u32,
    pub deposit_outpoint: &'a OutPoint,
    pub amount: Amount,
    pub derivation_index: ChildNumber,
    pub presigned: Vec<(TransactionKind, Txid, SigHash)>,
}

/// Insert a new vault and its presigned transactions, returning its id.
pub fn db_insert_vault(db_path: &Path, vault: &NewDbVault) -> Result<u32, DatabaseError> {
    let mut vault_id = 0;

    db_exec(db_path, |tx| {
        let derivation_index: u32 = vault.derivation_index.into();
        tx.execute(
            "INSERT INTO vaults (wallet_id, status, blockheight, deposit_txid, deposit_vout, \
             amount, derivation_index, replicated, unvault_authorized, archived) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, 0)",
            params![
                vault.wallet_id,
                vault.status as u32,
                vault.blockheight,
                encode::serialize(&vault.deposit_outpoint.txid),
                vault.deposit_outpoint.vout,
                amount_to_i64(&vault.amount),
                derivation_index,
            ],
        )
        .map_err(|e| DatabaseError(format!("Inserting vault: {}", e)))?;
        vault_id = tx.last_insert_rowid() as u32;

        for (kind, txid, digest) in vault.presigned.iter() {
            tx.execute(
                "INSERT INTO presigned_transactions (vault_id, kind, txid, digest, raw_tx, \
                 finalized) VALUES (?1, ?2, ?3, ?4, NULL, 0)",
                params![
                    vault_id,
                    u32::from(*kind),
                    encode::serialize(txid),
                    digest[..].to_vec(),
                ],
            )
            .map_err(|e| DatabaseError(format!("Inserting presigned transaction: {}", e)))?;
        }

        Ok(())
    })?;

    Ok(vault_id)
}

/// The part of a vault that changes along its lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbVaultState<'a> {
    pub status: VaultStatus,
    pub blockheight: u32,
    pub unvault_height: Option<u32>,
    pub moved_at: Option<u32>,
    pub final_txid: Option<&'a Txid>,
    pub final_kind: Option<TransactionKind>,
}

pub fn db_update_vault(
    db_path: &Path,
    vault_id: u32,
    state: &DbVaultState,
) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "UPDATE vaults SET status = (?1), blockheight = (?2), unvault_height = (?3), \
             moved_at = (?4), final_txid = (?5), final_kind = (?6) WHERE id = (?7)",
            params![
                state.status as u32,
                state.blockheight,
                state.unvault_height,
                state.moved_at,
                state.final_txid.map(encode::serialize),
                state.final_kind.map(u32::from),
                vault_id,
            ],
        )
        .map_err(|e| DatabaseError(format!("Updating vault: {}", e)))?;
        Ok(())
    })
}

/// Store a signature, replacing a previous one by the same signer for the same transaction.
/// Store new signatures of a presigned transaction, and mark it as finalized if they complete
/// it. A newer signature by the same signer replaces the previous one.
pub fn db_store_signatures(
    db_path: &Path,
    vault_id: u32,
    kind: TransactionKind,
    signatures: &[(secp256k1::PublicKey, secp256k1::Signature)],
    finalized: bool,
) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        for (pubkey, signature) in signatures {
            tx.execute(
                "INSERT INTO signatures (vault_id, kind, pubkey, signature) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (vault_id, kind, pubkey) DO UPDATE SET signature = excluded.signature",
                params![
                    vault_id,
                    u32::from(kind),
                    pubkey.serialize().to_vec(),
                    signature.serialize_der().to_vec(),
                ],
            )
            .map_err(|e| DatabaseError(format!("Storing signature: {}", e)))?;
        }
        if finalized {
            tx.execute(
                "UPDATE presigned_transactions SET finalized = 1 \
                 WHERE vault_id = (?1) AND kind = (?2)",
                params![vault_id, u32::from(kind)],
            )
            .map_err(|e| DatabaseError(format!("Marking transaction as finalized: {}", e)))?;
        }
        Ok(())
    })
}

/// Set the Spend transaction of a vault. Any signature for a previous Spend is dropped.
pub fn db_set_spend(
    db_path: &Path,
    vault_id: u32,
    digest: &SigHash,
    spend_tx: &Transaction,
) -> Result<(), DatabaseError> {
    let spend = u32::from(TransactionKind::Spend);

    db_exec(db_path, |tx| {
        tx.execute(
            "DELETE FROM signatures WHERE vault_id = (?1) AND kind = (?2)",
            params![vault_id, spend],
        )?;
        tx.execute(
            "DELETE FROM presigned_transactions WHERE vault_id = (?1) AND kind = (?2)",
            params![vault_id, spend],
        )?;
        tx.execute(
            "INSERT INTO presigned_transactions (vault_id, kind, txid, digest, raw_tx, \
             finalized) VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                vault_id,
                spend,
                encode::serialize(&spend_tx.txid()),
                digest[..].to_vec(),
                encode::serialize(spend_tx),
            ],
        )
        .map_err(|e| DatabaseError(format!("Inserting Spend transaction: {}", e)))?;
        Ok(())
    })
}

fn db_set_flag(db_path: &Path, vault_id: u32, column: &str) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            &format!("UPDATE vaults SET {} = 1 WHERE id = (?1)", column),
            params![vault_id],
        )
        .map_err(|e| DatabaseError(format!("Setting '{}' on vault: {}", column, e)))?;
        Ok(())
    })
}

/// All watchtowers acked the revocation signatures of this vault
pub fn db_mark_replicated(db_path: &Path, vault_id: u32) -> Result<(), DatabaseError> {
    db_set_flag(db_path, vault_id, "replicated")
}

/// We are about to broadcast the Unvault of this vault ourselves
pub fn db_mark_unvault_authorized(db_path: &Path, vault_id: u32) -> Result<(), DatabaseError> {
    db_set_flag(db_path, vault_id, "unvault_authorized")
}

pub fn db_archive_vault(db_path: &Path, vault_id: u32) -> Result<(), DatabaseError> {
    db_set_flag(db_path, vault_id, "archived")
}

/// Record a broadcast revocation transaction, to keep track of the fee-bumped ones.
pub fn db_insert_broadcast(
    db_path: &Path,
    vault_id: u32,
    kind: TransactionKind,
    feerate: u64,
    height: u32,
    broadcast_tx: &Transaction,
) -> Result<(), DatabaseError> {
    db_exec(db_path, |tx| {
        tx.execute(
            "INSERT INTO broadcasts (vault_id, kind, txid, feerate, height, tx) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                vault_id,
                u32::from(kind),
                encode::serialize(&broadcast_tx.txid()),
                feerate as i64,
                height,
                encode::serialize(broadcast_tx),
            ],
        )
        .map_err(|e| DatabaseError(format!("Inserting broadcast: {}", e)))?;
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::test_utils::{dummy_custodyd, dummy_outpoint, test_datadir, TestKeys};

    use revault_tx::bitcoin::{hashes::Hash, SigHash, TxOut};

    use std::fs;

    #[test]
    fn test_db_creation() {
        let datadir = test_datadir();
        let keys = TestKeys::new(4, 2, 0);
        let custodyd = dummy_custodyd(&keys, 18, datadir.clone());
        let db_path = custodyd.db_file();

        create_db(&custodyd).unwrap();
        // There must be a wallet entry now, and there is only one so its id must be 1.
        let wallet = db_wallet(&db_path).unwrap();
        assert_eq!(wallet.id, 1);
        assert_eq!(wallet.fingerprint, custodyd.fingerprint());
        assert_eq!(wallet.deposit_derivation_index, ChildNumber::from(0));

        // We can't create it twice
        create_db(&custodyd).unwrap_err();
        // The version is right
        check_db(&custodyd).unwrap();
        // But it would not open a database created by a future version
        db_exec(&db_path, |tx| {
            tx.execute("UPDATE version SET version = (?1)", params![DB_VERSION + 1])
                .unwrap();
            Ok(())
        })
        .unwrap();
        check_db(&custodyd).unwrap_err();

        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }

    #[test]
    fn test_db_deposit_index() {
        let datadir = test_datadir();
        let keys = TestKeys::new(2, 1, 0);
        let custodyd = dummy_custodyd(&keys, 18, datadir.clone());
        let db_path = custodyd.db_file();
        setup_db(&custodyd).unwrap();

        db_update_deposit_index(&db_path, ChildNumber::from(5)).unwrap();
        assert_eq!(
            db_wallet(&db_path).unwrap().deposit_derivation_index,
            ChildNumber::from(5)
        );
        // Monotonic
        db_update_deposit_index(&db_path, ChildNumber::from(3)).unwrap();
        assert_eq!(
            db_wallet(&db_path).unwrap().deposit_derivation_index,
            ChildNumber::from(5)
        );

        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }

    #[test]
    fn test_db_vault_lifecycle() {
        let datadir = test_datadir();
        let keys = TestKeys::new(2, 1, 0);
        let custodyd = dummy_custodyd(&keys, 18, datadir.clone());
        let db_path = custodyd.db_file();
        let wallet = setup_db(&custodyd).unwrap();

        let outpoint = dummy_outpoint(1);
        let cancel_txid = dummy_outpoint(2).txid;
        let digest = SigHash::hash(&[1, 2, 3]);
        let vault_id = db_insert_vault(
            &db_path,
            &NewDbVault {
                wallet_id: wallet.id,
                status: VaultStatus::Funding,
                blockheight: 0,
                deposit_outpoint: &outpoint,
                amount: Amount::from_sat(100_000_000),
                derivation_index: ChildNumber::from(3),
                presigned: vec![(TransactionKind::Cancel, cancel_txid, digest)],
            },
        )
        .unwrap();

        let vault = db_vault_by_deposit(&db_path, &outpoint).unwrap().unwrap();
        assert_eq!(vault.id, vault_id);
        assert_eq!(vault.status, VaultStatus::Funding);
        assert_eq!(vault.amount, Amount::from_sat(100_000_000));
        assert_eq!(vault.derivation_index, ChildNumber::from(3));
        assert!(!vault.replicated && !vault.unvault_authorized && !vault.archived);
        assert!(db_vault_by_deposit(&db_path, &dummy_outpoint(9))
            .unwrap()
            .is_none());

        let presigned = db_presigned(&db_path, vault_id).unwrap();
        assert_eq!(presigned.len(), 1);
        assert_eq!(presigned[0].txid, cancel_txid);
        assert_eq!(presigned[0].digest, digest);
        assert!(!presigned[0].finalized);
        db_store_signatures(&db_path, vault_id, TransactionKind::Cancel, &[], true).unwrap();
        assert!(db_presigned(&db_path, vault_id).unwrap()[0].finalized);

        db_update_vault(
            &db_path,
            vault_id,
            &DbVaultState {
                status: VaultStatus::Canceling,
                blockheight: 100,
                unvault_height: Some(110),
                moved_at: Some(112),
                final_txid: Some(&cancel_txid),
                final_kind: Some(TransactionKind::Cancel),
            },
        )
        .unwrap();
        db_mark_replicated(&db_path, vault_id).unwrap();
        let vault = db_vaults(&db_path).unwrap().pop().unwrap();
        assert_eq!(vault.status, VaultStatus::Canceling);
        assert_eq!(vault.unvault_height, Some(110));
        assert_eq!(vault.final_txid, Some(cancel_txid));
        assert_eq!(vault.final_kind, Some(TransactionKind::Cancel));
        assert!(vault.replicated);

        // Archived vaults are not part of the active set anymore
        db_archive_vault(&db_path, vault_id).unwrap();
        assert!(db_vaults(&db_path).unwrap().is_empty());
        assert!(
            db_vault_by_deposit(&db_path, &outpoint)
                .unwrap()
                .unwrap()
                .archived
        );

        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }

    #[test]
    fn test_db_signatures_and_spend() {
        let datadir = test_datadir();
        let keys = TestKeys::new(2, 1, 0);
        let custodyd = dummy_custodyd(&keys, 18, datadir.clone());
        let db_path = custodyd.db_file();
        let wallet = setup_db(&custodyd).unwrap();
        let secp = secp256k1::Secp256k1::new();

        let outpoint = dummy_outpoint(1);
        let vault_id = db_insert_vault(
            &db_path,
            &NewDbVault {
                wallet_id: wallet.id,
                status: VaultStatus::Unvaulted,
                blockheight: 10,
                deposit_outpoint: &outpoint,
                amount: Amount::from_sat(100_000),
                derivation_index: ChildNumber::from(0),
                presigned: vec![],
            },
        )
        .unwrap();

        let sk = secp256k1::SecretKey::from_slice(&[7; 32]).unwrap();
        let pubkey = secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let first = secp.sign(&secp256k1::Message::from_slice(&[1; 32]).unwrap(), &sk);
        let second = secp.sign(&secp256k1::Message::from_slice(&[2; 32]).unwrap(), &sk);

        // A newer signature by the same signer replaces the previous one
        let store = |kind, sig| {
            db_store_signatures(&db_path, vault_id, kind, &[(pubkey, sig)], false).unwrap()
        };
        store(TransactionKind::Spend, first);
        store(TransactionKind::Spend, second);
        store(TransactionKind::Cancel, first);
        let sigs = db_signatures(&db_path, vault_id).unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].kind, TransactionKind::Cancel);
        assert_eq!(sigs[1].kind, TransactionKind::Spend);
        assert_eq!(sigs[1].signature, second);

        // Setting a new Spend drops the signatures of the previous one
        let spend_tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![],
            output: vec![TxOut {
                value: 50_000,
                script_pubkey: Default::default(),
            }],
        };
        let digest = SigHash::hash(&[4, 5, 6]);
        db_set_spend(&db_path, vault_id, &digest, &spend_tx).unwrap();
        let sigs = db_signatures(&db_path, vault_id).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].kind, TransactionKind::Cancel);
        let presigned = db_presigned(&db_path, vault_id).unwrap();
        assert_eq!(presigned.len(), 1);
        assert_eq!(presigned[0].raw_tx.as_ref(), Some(&spend_tx));
        assert_eq!(presigned[0].txid, spend_tx.txid());

        db_insert_broadcast(&db_path, vault_id, TransactionKind::Cancel, 88, 120, &spend_tx)
            .unwrap();
        let broadcasts = db_broadcasts(&db_path, vault_id).unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].feerate, 88);
        assert_eq!(broadcasts[0].txid, spend_tx.txid());

        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }
}
