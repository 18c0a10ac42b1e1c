use crate::{registry::VaultStatus, transactions::TransactionKind};

use revault_tx::bitcoin::{
    secp256k1, util::bip32::ChildNumber, Amount, OutPoint, SigHash, Transaction, Txid,
};

pub const SCHEMA: &str = "\
CREATE TABLE version (
    version INTEGER NOT NULL
);

/* The fingerprint is the immutable part of the configuration, as it was at creation. */
CREATE TABLE wallets (
    id INTEGER PRIMARY KEY NOT NULL,
    timestamp INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    deposit_derivation_index INTEGER NOT NULL
);

/* The status is the integer representation of a VaultStatus. The blockheight is the
 * deposit's confirmation height, 0 while Funding. unvault_height and moved_at are the heights
 * at which the Unvault and the transaction spending the vault for good confirmed.
 */
CREATE TABLE vaults (
    id INTEGER PRIMARY KEY NOT NULL,
    wallet_id INTEGER NOT NULL,
    status INTEGER NOT NULL,
    blockheight INTEGER NOT NULL,
    deposit_txid BLOB NOT NULL,
    deposit_vout INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    derivation_index INTEGER NOT NULL,
    unvault_height INTEGER,
    moved_at INTEGER,
    final_txid BLOB,
    final_kind INTEGER,
    replicated BOOLEAN NOT NULL CHECK (replicated IN (0,1)),
    unvault_authorized BOOLEAN NOT NULL CHECK (unvault_authorized IN (0,1)),
    archived BOOLEAN NOT NULL CHECK (archived IN (0,1)),
    UNIQUE(deposit_txid, deposit_vout),
    FOREIGN KEY (wallet_id) REFERENCES wallets (id)
        ON UPDATE RESTRICT
        ON DELETE RESTRICT
);

/* The kind is the integer representation of a TransactionKind. Only the Spend is stored in
 * full, the other ones are derived again at startup and checked against their digest.
 */
CREATE TABLE presigned_transactions (
    id INTEGER PRIMARY KEY NOT NULL,
    vault_id INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    txid BLOB NOT NULL,
    digest BLOB NOT NULL,
    raw_tx BLOB,
    finalized BOOLEAN NOT NULL CHECK (finalized IN (0,1)),
    UNIQUE(vault_id, kind),
    FOREIGN KEY (vault_id) REFERENCES vaults (id)
        ON UPDATE RESTRICT
        ON DELETE RESTRICT
);

CREATE TABLE signatures (
    id INTEGER PRIMARY KEY NOT NULL,
    vault_id INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    pubkey BLOB NOT NULL,
    signature BLOB NOT NULL,
    UNIQUE(vault_id, kind, pubkey),
    FOREIGN KEY (vault_id) REFERENCES vaults (id)
        ON UPDATE RESTRICT
        ON DELETE RESTRICT
);

/* The revocation transactions we broadcast, fee-bumped or not. */
CREATE TABLE broadcasts (
    id INTEGER PRIMARY KEY NOT NULL,
    vault_id INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    txid BLOB NOT NULL,
    feerate INTEGER NOT NULL,
    height INTEGER NOT NULL,
    tx BLOB NOT NULL,
    FOREIGN KEY (vault_id) REFERENCES vaults (id)
        ON UPDATE RESTRICT
        ON DELETE RESTRICT
);

CREATE INDEX vault_status ON vaults (status);
CREATE INDEX vault_archived ON vaults (archived);
CREATE INDEX presigned_vault ON presigned_transactions (vault_id);
CREATE INDEX signatures_vault ON signatures (vault_id, kind);
CREATE INDEX broadcasts_vault ON broadcasts (vault_id);
";

/// A row in the "wallets" table
#[derive(Clone, Debug)]
pub struct DbWallet {
    pub id: u32,
    pub timestamp: u32,
    pub fingerprint: String,
    pub deposit_derivation_index: ChildNumber,
}

/// A row of the "vaults" table
#[derive(Debug, Clone, PartialEq)]
pub struct DbVault {
    pub id: u32,
    pub wallet_id: u32,
    pub status: VaultStatus,
    pub blockheight: u32,
    pub deposit_outpoint: OutPoint,
    pub amount: Amount,
    pub derivation_index: ChildNumber,
    pub unvault_height: Option<u32>,
    pub moved_at: Option<u32>,
    pub final_txid: Option<Txid>,
    pub final_kind: Option<TransactionKind>,
    pub replicated: bool,
    pub unvault_authorized: bool,
    pub archived: bool,
}

/// A row of the "presigned_transactions" table
#[derive(Debug, Clone, PartialEq)]
pub struct DbPresigned {
    pub vault_id: u32,
    pub kind: TransactionKind,
    pub txid: Txid,
    pub digest: SigHash,
    /// Only set for the Spend, which can't be derived again
    pub raw_tx: Option<Transaction>,
    pub finalized: bool,
}

/// A row of the "signatures" table
#[derive(Debug, Clone, PartialEq)]
pub struct DbSignature {
    pub vault_id: u32,
    pub kind: TransactionKind,
    pub pubkey: secp256k1::PublicKey,
    pub signature: secp256k1::Signature,
}

/// A row of the "broadcasts" table
#[derive(Debug, Clone, PartialEq)]
pub struct DbBroadcast {
    pub vault_id: u32,
    pub kind: TransactionKind,
    pub txid: Txid,
    /// In sat/vbyte
    pub feerate: u64,
    pub height: u32,
    pub tx: Transaction,
}
