use crate::bitcoind::BitcoindError;
use revault_tx::bitcoin::Transaction as BitcoinTransaction;

use std::sync::mpsc::{sync_channel, Sender, SyncSender};

/// Outgoing to the bitcoind poller thread
#[derive(Debug)]
pub enum BitcoindMessageOut {
    Shutdown,
    SyncProgress(SyncSender<f64>),
    BroadcastTransactions(
        Vec<BitcoinTransaction>,
        SyncSender<Result<(), BitcoindError>>,
    ),
}

/// Outgoing to the signature fetcher thread
#[derive(Debug)]
pub enum SigFetcherMessageOut {
    Shutdown,
}

/// Interface to communicate with bitcoind client thread.
pub trait BitcoindThread {
    fn broadcast(&self, transactions: Vec<BitcoinTransaction>) -> Result<(), BitcoindError>;
    fn shutdown(&self);
    fn sync_progress(&self) -> f64;
}

/// Interface to the bitcoind thread using synchronous MPSCs
#[derive(Clone)]
pub struct BitcoindSender(Sender<BitcoindMessageOut>);

impl BitcoindThread for BitcoindSender {
    fn broadcast(&self, transactions: Vec<BitcoinTransaction>) -> Result<(), BitcoindError> {
        let (bitrep_tx, bitrep_rx) = sync_channel(0);

        if !transactions.is_empty() {
            // Sent one by one, the first failure aborts the remaining ones.
            self.0
                .send(BitcoindMessageOut::BroadcastTransactions(
                    transactions,
                    bitrep_tx,
                ))
                .expect("Sending to bitcoind thread");
            bitrep_rx.recv().expect("Receiving from bitcoind thread")?;
        }

        Ok(())
    }

    fn shutdown(&self) {
        self.0
            .send(BitcoindMessageOut::Shutdown)
            .expect("Sending to bitcoind thread")
    }

    fn sync_progress(&self) -> f64 {
        let (bitrep_tx, bitrep_rx) = sync_channel(0);
        self.0
            .send(BitcoindMessageOut::SyncProgress(bitrep_tx))
            .expect("Sending to bitcoind thread");

        bitrep_rx
            .recv()
            .expect("Receiving from bitcoind thread")
    }
}

impl From<Sender<BitcoindMessageOut>> for BitcoindSender {
    fn from(s: Sender<BitcoindMessageOut>) -> Self {
        BitcoindSender(s)
    }
}

/// Interface to the signature fetcher thread
#[derive(Clone)]
pub struct SigFetcherSender(Sender<SigFetcherMessageOut>);

impl SigFetcherSender {
    pub fn shutdown(&self) {
        self.0
            .send(SigFetcherMessageOut::Shutdown)
            .expect("Sending to sigfetcher thread")
    }
}

impl From<Sender<SigFetcherMessageOut>> for SigFetcherSender {
    fn from(s: Sender<SigFetcherMessageOut>) -> Self {
        SigFetcherSender(s)
    }
}
