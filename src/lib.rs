pub use revault_net;
pub use revault_tx;

mod bitcoind;
mod communication;
pub mod config;
pub mod control;
mod custodyd;
mod database;
mod participants;
mod quorum;
pub mod registry;
mod revocation;
mod sigfetcher;
mod signatures;
mod threadmessages;
pub mod transactions;
mod utils;

pub const VERSION: &str = "0.1.0";

pub use crate::custodyd::{CustodyD, NoiseKeyError};
use crate::{
    bitcoind::{bitcoind_main_loop, start_bitcoind, BitcoindError},
    communication::{NoiseCoordinator, NoiseWatchtowers},
    control::DaemonControl,
    database::{actions::setup_db, DatabaseError},
    registry::{RegistryError, VaultRegistry},
    revocation::RevocationGuard,
    sigfetcher::signature_fetcher_loop,
    threadmessages::{BitcoindSender, SigFetcherSender},
};
use revault_tx::bitcoin::hashes::hex::ToHex;

use std::{
    error, fmt, io, panic, process,
    sync::{mpsc, Arc},
    thread,
};

use daemonize_simple::Daemonize;

// Any panic, in any thread, is fatal to the daemon. Log it along with the thread it happened
// in, then stop the whole process.
fn exit_on_panic() {
    panic::set_hook(Box::new(|panic_info| {
        let thread = thread::current();
        log::error!(
            "Thread '{}' {}\n{:?}",
            thread.name().unwrap_or("<unnamed>"),
            panic_info,
            backtrace::Backtrace::new()
        );
        process::exit(1);
    }));
}

#[derive(Debug)]
pub enum StartupError {
    Db(DatabaseError),
    Registry(RegistryError),
    Bitcoind(BitcoindError),
    Daemonize(String),
    Thread(io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Db(e) => write!(f, "Database error when starting custodyd: '{}'", e),
            Self::Registry(e) => write!(f, "Error loading the vaults: '{}'", e),
            Self::Bitcoind(e) => write!(f, "Bitcoind error when starting custodyd: '{}'", e),
            Self::Daemonize(e) => write!(f, "Error daemonizing: '{}'", e),
            Self::Thread(e) => write!(f, "Error spawning a thread: '{}'", e),
        }
    }
}

impl error::Error for StartupError {}

impl From<BitcoindError> for StartupError {
    fn from(e: BitcoindError) -> Self {
        Self::Bitcoind(e)
    }
}

impl From<DatabaseError> for StartupError {
    fn from(e: DatabaseError) -> Self {
        Self::Db(e)
    }
}

impl From<RegistryError> for StartupError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

// The process is forked: no database connection may be open at this point.
fn daemonize(custodyd: &CustodyD) -> Result<(), StartupError> {
    let log_file = custodyd.log_file();
    Daemonize {
        pid_file: Some(custodyd.pid_file()),
        stdout_file: Some(log_file.clone()),
        stderr_file: Some(log_file),
        chdir: Some(custodyd.data_dir.clone()),
        append: true,
        ..Daemonize::default()
    }
    .doit()
    .map_err(|e| StartupError::Daemonize(e.to_string()))
}

// Spawn a named worker thread. An error returned by the worker stops the daemon.
fn spawn_worker<E, F>(name: &str, worker: F) -> Result<thread::JoinHandle<()>, StartupError>
where
    E: fmt::Display,
    F: FnOnce() -> Result<(), E> + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(e) = worker() {
                log::error!("The {} thread stopped: '{}'", thread_name, e);
                process::exit(1);
            }
        })
        .map_err(StartupError::Thread)
}

/// A running custody daemon.
pub struct DaemonHandle {
    pub control: DaemonControl,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DaemonHandle {
    /// Load the vaults, connect to bitcoind and start the daemon threads: the chain watcher
    /// (which also runs the Cancel races) and the signature fetcher. Commands are handled in
    /// the caller's thread through `control`.
    ///
    /// **Note**: this sets a panic hook that stops the process, a downstream application must
    /// not overwrite it.
    pub fn start(custodyd: CustodyD) -> Result<Self, StartupError> {
        exit_on_panic();

        log::info!(
            "Using Noise static public key: '{}'",
            custodyd.noise_pubkey().0.to_hex()
        );
        log::debug!(
            "Coordinator static public key: '{}'",
            custodyd.coordinator_noisekey.0.to_hex()
        );

        setup_db(&custodyd)?;
        let custodyd = Arc::new(custodyd);
        let registry = Arc::new(VaultRegistry::load(custodyd.clone())?);
        let guard = Arc::new(RevocationGuard::new(registry.clone()));
        log::info!("Loaded {} vault(s)", registry.snapshots().len());

        let bitcoind = Arc::new(start_bitcoind(&custodyd, registry.wallet_id())?);
        if custodyd.daemon {
            log::info!("Daemonizing");
            daemonize(&custodyd)?;
        }

        let (bitcoind_tx, bitcoind_rx) = mpsc::channel();
        let (sigfetcher_tx, sigfetcher_rx) = mpsc::channel();
        let coordinator = Arc::new(NoiseCoordinator::from_custodyd(&custodyd));
        let watchtowers = Arc::new(NoiseWatchtowers::from_custodyd(&custodyd));

        let workers = vec![
            spawn_worker("bitcoind", {
                let (registry, guard) = (registry.clone(), guard.clone());
                move || bitcoind_main_loop(bitcoind_rx, registry, guard, bitcoind)
            })?,
            spawn_worker("sigfetcher", {
                let (registry, coordinator) = (registry.clone(), coordinator.clone());
                move || signature_fetcher_loop(sigfetcher_rx, registry, coordinator, watchtowers)
            })?,
        ];

        log::info!("custodyd started on network {}", custodyd.network());
        let bitcoind: BitcoindSender = bitcoind_tx.into();
        let sigfetcher: SigFetcherSender = sigfetcher_tx.into();
        Ok(Self {
            control: DaemonControl::new(registry, guard, coordinator, bitcoind, sigfetcher),
            workers,
        })
    }

    /// Block until the daemon threads exit.
    pub fn wait(self) {
        for worker in self.workers {
            let name = worker.thread().name().unwrap_or("<unnamed>").to_string();
            if worker.join().is_err() {
                log::error!("The {} thread panicked", name);
            }
        }
    }

    /// Stop the daemon threads, and wait for them to exit.
    pub fn shutdown(self) {
        self.control.shutdown();
        self.wait();
    }
}
