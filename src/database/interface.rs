use crate::{
    database::{
        schema::{DbBroadcast, DbPresigned, DbSignature, DbVault, DbWallet},
        DatabaseError,
    },
    registry::VaultStatus,
    transactions::TransactionKind,
};

use revault_tx::bitcoin::{
    consensus::encode, hashes::Hash, secp256k1, util::bip32::ChildNumber, Amount, OutPoint,
    SigHash, Transaction, Txid,
};

use std::{
    boxed::Box,
    convert::{TryFrom, TryInto},
    path::Path,
    time::Duration,
};

use rusqlite::{
    params, types::FromSqlError, Connection, Params, Row, Transaction as DbTransaction,
    TransactionBehavior,
};

// As the bundled sqlite is compiled with SQLITE_THREADSAFE, quoting sqlite.org:
// > Multi-thread. In this mode, SQLite can be safely used by multiple threads provided that
// > no single database connection is used simultaneously in two or more threads.
// Therefore the below routines create a new connection and can be used from any thread.
// Concurrent writers wait on each other thanks to 'unlock_notify'.

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

fn sql_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    FromSqlError::Other(Box::new(e)).into()
}

/// Perform a set of modifications to the database inside a single transaction
pub fn db_exec<F>(path: &Path, modifications: F) -> Result<(), DatabaseError>
where
    F: FnOnce(&DbTransaction) -> Result<(), DatabaseError>,
{
    let mut conn = Connection::open(path)
        .map_err(|e| DatabaseError(format!("Opening database: {}", e)))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| DatabaseError(format!("Creating transaction: {}", e)))?;

    modifications(&tx)?;
    tx.commit()
        .map_err(|e| DatabaseError(format!("Comitting transaction: {}", e)))?;

    Ok(())
}

// Internal helper for queries boilerplate
fn db_query<P, F, T>(path: &Path, stmt_str: &str, params: P, f: F) -> Result<Vec<T>, DatabaseError>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let conn = Connection::open(path)
        .map_err(|e| DatabaseError(format!("Opening database for query: {}", e)))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let mut stmt = conn
        .prepare(stmt_str)
        .map_err(|e| DatabaseError(format!("Preparing query: '{}'", e)))?;
    let rows = stmt
        .query_map(params, f)
        .map_err(|e| DatabaseError(format!("Mapping query: '{}'", e)))?
        .collect::<rusqlite::Result<Vec<T>>>()
        .map_err(|e| DatabaseError(format!("Executing query: '{}'", e)));

    rows
}

/// Get the database version
pub fn db_version(db_path: &Path) -> Result<u32, DatabaseError> {
    let mut rows = db_query(db_path, "SELECT version FROM version", [], |row| {
        row.get::<_, u32>(0)
    })?;

    rows.pop()
        .ok_or_else(|| DatabaseError("No row in version table?".to_string()))
}

/// Get the database wallet. We only support single wallet, so this always return the first row.
pub fn db_wallet(db_path: &Path) -> Result<DbWallet, DatabaseError> {
    let mut rows = db_query(
        db_path,
        "SELECT id, timestamp, fingerprint, deposit_derivation_index FROM wallets",
        [],
        |row| {
            Ok(DbWallet {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                fingerprint: row.get(2)?,
                deposit_derivation_index: ChildNumber::from(row.get::<_, u32>(3)?),
            })
        },
    )?;

    rows.pop()
        .ok_or_else(|| DatabaseError("No row in wallet table?".to_string()))
}

fn txid_from_row(row: &Row<'_>, index: usize) -> rusqlite::Result<Txid> {
    encode::deserialize(&row.get::<_, Vec<u8>>(index)?).map_err(sql_error)
}

fn kind_from_row(row: &Row<'_>, index: usize) -> rusqlite::Result<TransactionKind> {
    let raw: u32 = row.get(index)?;
    TransactionKind::try_from(raw).map_err(|_| {
        sql_error(DatabaseError(format!(
            "Unknown transaction kind '{}' in database",
            raw
        )))
    })
}

fn tx_from_blob(blob: &[u8]) -> rusqlite::Result<Transaction> {
    encode::deserialize(blob).map_err(sql_error)
}

const VAULT_COLUMNS: &str = "id, wallet_id, status, blockheight, deposit_txid, deposit_vout, \
                             amount, derivation_index, unvault_height, moved_at, final_txid, \
                             final_kind, replicated, unvault_authorized, archived";

impl TryFrom<&Row<'_>> for DbVault {
    type Error = rusqlite::Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let raw_status: u32 = row.get(2)?;
        let status = VaultStatus::try_from(raw_status).map_err(|_| {
            sql_error(DatabaseError(format!(
                "Unknown vault status '{}' in database",
                raw_status
            )))
        })?;
        let deposit_outpoint = OutPoint {
            txid: txid_from_row(row, 4)?,
            vout: row.get(5)?,
        };
        let amount: i64 = row.get(6)?;
        let final_txid = row
            .get::<_, Option<Vec<u8>>>(10)?
            .map(|blob| encode::deserialize(&blob).map_err(sql_error))
            .transpose()?;
        let final_kind = match row.get::<_, Option<u32>>(11)? {
            Some(_) => Some(kind_from_row(row, 11)?),
            None => None,
        };

        Ok(DbVault {
            id: row.get(0)?,
            wallet_id: row.get(1)?,
            status,
            blockheight: row.get(3)?,
            deposit_outpoint,
            amount: Amount::from_sat(amount.try_into().map_err(sql_error)?),
            derivation_index: ChildNumber::from(row.get::<_, u32>(7)?),
            unvault_height: row.get(8)?,
            moved_at: row.get(9)?,
            final_txid,
            final_kind,
            replicated: row.get(12)?,
            unvault_authorized: row.get(13)?,
            archived: row.get(14)?,
        })
    }
}

/// Get all the vaults that were not archived yet
pub fn db_vaults(db_path: &Path) -> Result<Vec<DbVault>, DatabaseError> {
    db_query(
        db_path,
        &format!(
            "SELECT {} FROM vaults WHERE archived = 0 ORDER BY id",
            VAULT_COLUMNS
        ),
        [],
        |row| row.try_into(),
    )
}

/// Get a vault, archived or not, by its deposit outpoint
pub fn db_vault_by_deposit(
    db_path: &Path,
    deposit: &OutPoint,
) -> Result<Option<DbVault>, DatabaseError> {
    db_query(
        db_path,
        &format!(
            "SELECT {} FROM vaults WHERE deposit_txid = (?1) AND deposit_vout = (?2)",
            VAULT_COLUMNS
        ),
        params![encode::serialize(&deposit.txid), deposit.vout],
        |row| row.try_into(),
    )
    .map(|mut rows| rows.pop())
}

/// The presigned transactions of a vault we stored
pub fn db_presigned(db_path: &Path, vault_id: u32) -> Result<Vec<DbPresigned>, DatabaseError> {
    db_query(
        db_path,
        "SELECT vault_id, kind, txid, digest, raw_tx, finalized FROM presigned_transactions \
         WHERE vault_id = (?1) ORDER BY kind",
        params![vault_id],
        |row| {
            let digest: Vec<u8> = row.get(3)?;
            let raw_tx = row
                .get::<_, Option<Vec<u8>>>(4)?
                .map(|blob| tx_from_blob(&blob))
                .transpose()?;

            Ok(DbPresigned {
                vault_id: row.get(0)?,
                kind: kind_from_row(row, 1)?,
                txid: txid_from_row(row, 2)?,
                digest: SigHash::from_slice(&digest).map_err(sql_error)?,
                raw_tx,
                finalized: row.get(5)?,
            })
        },
    )
}

/// The signatures we accepted for this vault's transactions
pub fn db_signatures(db_path: &Path, vault_id: u32) -> Result<Vec<DbSignature>, DatabaseError> {
    db_query(
        db_path,
        "SELECT vault_id, kind, pubkey, signature FROM signatures WHERE vault_id = (?1) \
         ORDER BY kind, id",
        params![vault_id],
        |row| {
            let pubkey: Vec<u8> = row.get(2)?;
            let signature: Vec<u8> = row.get(3)?;

            Ok(DbSignature {
                vault_id: row.get(0)?,
                kind: kind_from_row(row, 1)?,
                pubkey: secp256k1::PublicKey::from_slice(&pubkey).map_err(sql_error)?,
                signature: secp256k1::Signature::from_der(&signature).map_err(sql_error)?,
            })
        },
    )
}

/// The revocation transactions we broadcast for this vault, oldest first
pub fn db_broadcasts(db_path: &Path, vault_id: u32) -> Result<Vec<DbBroadcast>, DatabaseError> {
    db_query(
        db_path,
        "SELECT vault_id, kind, txid, feerate, height, tx FROM broadcasts WHERE vault_id = (?1) \
         ORDER BY id",
        params![vault_id],
        |row| {
            let feerate: i64 = row.get(3)?;
            let tx: Vec<u8> = row.get(5)?;

            Ok(DbBroadcast {
                vault_id: row.get(0)?,
                kind: kind_from_row(row, 1)?,
                txid: txid_from_row(row, 2)?,
                feerate: feerate.try_into().map_err(sql_error)?,
                height: row.get(4)?,
                tx: tx_from_blob(&tx)?,
            })
        },
    )
}
