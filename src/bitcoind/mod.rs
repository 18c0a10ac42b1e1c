pub mod interface;
pub mod poller;
mod sync;

use crate::{
    config::BitcoindConfig,
    custodyd::{BlockchainTip, CustodyD},
    database::DatabaseError,
    registry::VaultRegistry,
    revocation::RevocationGuard,
    threadmessages::BitcoindMessageOut,
};
use interface::{BitcoinD, ListUnspentEntry};
use poller::poller_main;
use revault_tx::bitcoin::{Address, Amount, Network, Transaction, Txid};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc, RwLock,
    },
    thread,
    time::Duration,
};

use jsonrpc::{
    error::{Error, RpcError},
    simple_http,
};

/// An error happened in the bitcoind-manager thread
#[derive(Debug)]
pub enum BitcoindError {
    /// It can be related to us..
    Custom(String),
    /// Or directly to bitcoind's RPC server
    Server(Error),
}

impl BitcoindError {
    /// Is bitcoind just starting ?
    pub fn is_warming_up(&self) -> bool {
        match self {
            // https://github.com/bitcoin/bitcoin/blob/dca80ffb45fcc8e6eedb6dc481d500dedab4248b/src/rpc/protocol.h#L49
            BitcoindError::Server(Error::Rpc(RpcError { code, .. })) => *code == -28,
            _ => false,
        }
    }
}

impl std::fmt::Display for BitcoindError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BitcoindError::Custom(ref s) => write!(f, "Bitcoind manager error: {}", s),
            BitcoindError::Server(ref e) => write!(f, "Bitcoind server error: {}", e),
        }
    }
}

impl std::error::Error for BitcoindError {}

impl From<DatabaseError> for BitcoindError {
    fn from(e: DatabaseError) -> Self {
        Self::Custom(format!("Database error in bitcoind thread: {}", e))
    }
}

impl From<simple_http::Error> for BitcoindError {
    fn from(e: simple_http::Error) -> Self {
        Self::Server(Error::Transport(Box::new(e)))
    }
}

/// What the chain knows about a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Unknown,
    Mempool,
    Confirmed { height: u32 },
}

impl TxStatus {
    /// Number of confirmations at this tip
    pub fn depth(&self, tip_height: u32) -> u32 {
        match self {
            TxStatus::Confirmed { height } if *height <= tip_height => tip_height - height + 1,
            _ => 0,
        }
    }
}

/// What we need from a Bitcoin node. All the calls may block on network I/O.
pub trait ChainClient: Send + Sync {
    fn tip(&self) -> Result<BlockchainTip, BitcoindError>;

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, BitcoindError>;

    /// The coins paying to the addresses we imported, confirmed or not
    fn deposits(&self) -> Result<Vec<ListUnspentEntry>, BitcoindError>;

    fn import_addresses(&self, addresses: &[Address]) -> Result<(), BitcoindError>;

    fn broadcast(&self, tx: &Transaction) -> Result<(), BitcoindError>;

    /// Get a copy of this ANYONECANPAY-signed revocation transaction paying at least `feerate`
    /// sat/vb, by adding an input from our fee wallet.
    fn bump_revocation(
        &self,
        tx: &Transaction,
        prevout_value: Amount,
        feerate: u64,
    ) -> Result<Transaction, BitcoindError>;
}

fn check_bitcoind_network(
    bitcoind: &BitcoinD,
    config_network: &Network,
) -> Result<(), BitcoindError> {
    let chaininfo = bitcoind.getblockchaininfo()?;
    let chain = chaininfo
        .get("chain")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            BitcoindError::Custom("No valid 'chain' in getblockchaininfo response?".to_owned())
        })?;
    let bip70_net = match config_network {
        Network::Bitcoin => "main",
        Network::Testnet => "test",
        Network::Regtest => "regtest",
        Network::Signet => "signet",
    };

    if !bip70_net.eq(chain) {
        return Err(BitcoindError::Custom(format!(
            "Wrong network, bitcoind is on '{}' but our config says '{}' ({})",
            chain, bip70_net, config_network
        )));
    }

    Ok(())
}

/// Some sanity checks to be done at startup to make sure our bitcoind isn't going to fail under
/// our feet for a legitimate reason.
fn bitcoind_sanity_checks(
    bitcoind: &BitcoinD,
    bitcoind_config: &BitcoindConfig,
) -> Result<(), BitcoindError> {
    check_bitcoind_network(bitcoind, &bitcoind_config.network)
}

/// Connects to and sanity checks bitcoind.
pub fn start_bitcoind(custodyd: &CustodyD, wallet_id: u32) -> Result<BitcoinD, BitcoindError> {
    let bitcoind = BitcoinD::new(
        &custodyd.bitcoind_config,
        custodyd.watchonly_wallet_file(wallet_id),
    )
    .map_err(|e| BitcoindError::Custom(format!("Could not connect to bitcoind: {}", e)))?
    .with_retry_limit(3);

    while let Err(e) = bitcoind_sanity_checks(&bitcoind, &custodyd.bitcoind_config) {
        if e.is_warming_up() {
            log::info!("Bitcoind is warming up. Waiting for it to be back up.");
            thread::sleep(Duration::from_secs(3))
        } else {
            return Err(e);
        }
    }

    Ok(bitcoind)
}

/// The bitcoind event loop.
/// Listens for bitcoind requests from the main thread and polls bitcoind every
/// `poll_interval_secs` in a separate thread, updating the vaults accordingly.
pub fn bitcoind_main_loop(
    rx: Receiver<BitcoindMessageOut>,
    registry: Arc<VaultRegistry>,
    guard: Arc<RevocationGuard>,
    bitcoind: Arc<BitcoinD>,
) -> Result<(), BitcoindError> {
    // Only ever set to 1.0 by the poller once bitcoind is synced and our wallet loaded
    let sync_progress = Arc::new(RwLock::new(0.0f64));
    let shutdown = Arc::new(AtomicBool::new(false));

    let poller_thread = thread::Builder::new()
        .name("poller".to_string())
        .spawn({
            let (bitcoind, sync_progress, shutdown) =
                (bitcoind.clone(), sync_progress.clone(), shutdown.clone());
            move || poller_main(registry, guard, bitcoind, sync_progress, shutdown)
        })
        .map_err(|e| BitcoindError::Custom(format!("Spawning the poller thread: {}", e)))?;

    for msg in rx {
        match msg {
            BitcoindMessageOut::Shutdown => {
                log::info!("Stopping the chain watcher");
                shutdown.store(true, Ordering::Relaxed);
                return poller_thread.join().map_err(|_| {
                    BitcoindError::Custom("The poller thread panicked".to_string())
                });
            }
            BitcoindMessageOut::SyncProgress(resp_tx) => {
                resp_tx.send(*sync_progress.read().unwrap()).map_err(|e| {
                    BitcoindError::Custom(format!(
                        "Sending synchronization progress to main thread: {}",
                        e
                    ))
                })?;
            }
            BitcoindMessageOut::BroadcastTransactions(txs, resp_tx) => {
                log::trace!("Received 'broadcastransactions' from main thread");
                resp_tx
                    .send(bitcoind.broadcast_transactions(&txs))
                    .map_err(|e| {
                        BitcoindError::Custom(format!(
                            "Sending transactions broadcast result to main thread: {}",
                            e
                        ))
                    })?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_status_depth() {
        assert_eq!(TxStatus::Unknown.depth(100), 0);
        assert_eq!(TxStatus::Mempool.depth(100), 0);
        assert_eq!(TxStatus::Confirmed { height: 100 }.depth(100), 1);
        assert_eq!(TxStatus::Confirmed { height: 95 }.depth(100), 6);
        // Our view of the tip is behind the one the tx status was computed against
        assert_eq!(TxStatus::Confirmed { height: 101 }.depth(100), 0);
    }

    #[test]
    fn warming_up_detection() {
        let warming_up = BitcoindError::Server(Error::Rpc(RpcError {
            code: -28,
            message: "Loading block index...".to_string(),
            data: None,
        }));
        assert!(warming_up.is_warming_up());

        let other = BitcoindError::Server(Error::Rpc(RpcError {
            code: -5,
            message: "No such mempool or blockchain transaction".to_string(),
            data: None,
        }));
        assert!(!other.is_warming_up());
        assert!(!BitcoindError::Custom("-28".to_string()).is_warming_up());
    }
}
