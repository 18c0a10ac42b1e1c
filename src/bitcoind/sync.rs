//! Waiting for bitcoind to be synced, and setting up our watchonly wallet once it is.

use crate::{
    bitcoind::{
        interface::{BitcoinD, SyncInfo},
        BitcoindError,
    },
    custodyd::CustodyD,
    database::interface::db_wallet,
};

use revault_tx::bitcoin::Network;

use std::{
    path::PathBuf,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

// Bounds of the delay between two sync checks
const MIN_CHECK_DELAY: Duration = Duration::from_secs(5);
const MAX_CHECK_DELAY: Duration = Duration::from_secs(10 * 60);
// How long to let bitcoind gather headers before looking at its progress again
const HEADERS_DELAY: Duration = Duration::from_secs(5 * 60);
const HEADERS_DELAY_REGTEST: Duration = Duration::from_secs(3);
// A wallet created within this many seconds of the database has nothing to rescan
const FRESH_WALLET_SECS: u64 = 30;

/// The sync progress we report, out of bitcoind's `verificationprogress`. The latter is an
/// estimate that never quite reaches 1, so anything within 10^-5 of it is done.
pub fn reported_progress(verification_progress: f64) -> f64 {
    const STEPS: f64 = 100_000.0;
    let steps = (verification_progress * STEPS).round();

    if steps >= STEPS - 1.0 {
        1.0
    } else {
        steps / STEPS
    }
}

/// Decides when to ask bitcoind about its sync again, so as not to harass it with
/// `getblockchaininfo` while it connects blocks.
#[derive(Debug, Default)]
pub struct SyncWatch {
    next_check: Option<Instant>,
    ibd_logged: bool,
}

impl SyncWatch {
    pub fn due(&self, now: Instant) -> bool {
        self.next_check.map(|next| now >= next).unwrap_or(true)
    }

    /// Don't check again before the minimum delay, eg after bitcoind failed to answer.
    pub fn postpone(&mut self, now: Instant) {
        self.next_check = Some(now + MIN_CHECK_DELAY);
    }

    /// Get the progress out of bitcoind's chain info, and schedule the next check.
    pub fn record(&mut self, info: &SyncInfo, network: Network, now: Instant) -> f64 {
        let delay = self.delay(info, network);
        self.next_check = Some(now + delay);
        log::debug!(
            "bitcoind at block {}/{}, checking back in {:?}",
            info.blocks,
            info.headers,
            delay
        );

        reported_progress(info.progress)
    }

    fn delay(&mut self, info: &SyncInfo, network: Network) -> Duration {
        if info.ibd && !self.ibd_logged {
            log::info!("bitcoind is performing its initial block download, this may take a while");
            self.ibd_logged = true;
        }

        // Until it got the headers, bitcoind does not know how far the tip is
        if info.ibd && info.progress < 0.01 {
            log::info!("Waiting for bitcoind to gather enough headers");
            return if network == Network::Regtest {
                HEADERS_DELAY_REGTEST
            } else {
                HEADERS_DELAY
            };
        }

        // Connecting 40 blocks takes more than a second, on any machine
        let left = info.headers.saturating_sub(info.blocks);
        Duration::from_secs(left / 40).clamp(MIN_CHECK_DELAY, MAX_CHECK_DELAY)
    }
}

/// Make sure our watchonly wallet exists and is loaded on bitcoind, once.
pub fn setup_watchonly_wallet(
    custodyd: &CustodyD,
    wallet_id: u32,
    bitcoind: &BitcoinD,
) -> Result<(), BitcoindError> {
    let wallet_path = custodyd.watchonly_wallet_file(wallet_id);
    let loaded = bitcoind
        .listwallets()?
        .into_iter()
        .filter(|path| path == &wallet_path)
        .count();

    if PathBuf::from(&wallet_path).exists() {
        return match loaded {
            0 => {
                log::info!("Loading watchonly wallet '{}'", wallet_path);
                bitcoind.loadwallet_startup(wallet_path)
            }
            1 => Ok(()),
            n => Err(BitcoindError::Custom(format!(
                "Watchonly wallet '{}' is loaded {} times on bitcoind",
                wallet_path, n
            ))),
        };
    }

    // It was deleted under bitcoind's feet
    for _ in 0..loaded {
        log::warn!(
            "Watchonly wallet '{}' is loaded but missing on disk, unloading it",
            wallet_path
        );
        bitcoind.unloadwallet(wallet_path.clone())?;
    }

    log::info!("Creating watchonly wallet '{}'", wallet_path);
    bitcoind.createwallet_startup(wallet_path)?;

    // Deposits may have been made before the wallet existed
    let db_wallet = db_wallet(&custodyd.db_file())?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BitcoindError::Custom(format!("Computing time since epoch: {}", e)))?
        .as_secs();
    if now.saturating_sub(db_wallet.timestamp as u64) >= FRESH_WALLET_SECS {
        bitcoind.set_rescan_from(db_wallet.timestamp);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(headers: u64, blocks: u64, ibd: bool, progress: f64) -> SyncInfo {
        SyncInfo {
            headers,
            blocks,
            ibd,
            progress,
        }
    }

    #[test]
    fn progress_reporting() {
        assert_eq!(reported_progress(0.0), 0.0);
        assert_eq!(reported_progress(0.5), 0.5);
        assert_eq!(reported_progress(0.99998), 0.99998);
        assert_eq!(reported_progress(0.999995), 1.0);
        assert_eq!(reported_progress(1.0), 1.0);
    }

    #[test]
    fn sync_check_schedule() {
        let now = Instant::now();
        let mut watch = SyncWatch::default();
        assert!(watch.due(now));

        // Gathering headers
        let progress = watch.record(&info(1_000, 10, true, 0.001), Network::Bitcoin, now);
        assert_eq!(progress, 0.001);
        assert!(!watch.due(now + Duration::from_secs(60)));
        assert!(watch.due(now + HEADERS_DELAY));
        watch.record(&info(1_000, 10, true, 0.001), Network::Regtest, now);
        assert!(watch.due(now + HEADERS_DELAY_REGTEST));

        // The delay depends on the number of blocks left to connect
        watch.record(&info(100_000, 96_000, true, 0.8), Network::Bitcoin, now);
        assert!(!watch.due(now + Duration::from_secs(99)));
        assert!(watch.due(now + Duration::from_secs(100)));
        watch.record(&info(700_000, 10_000, true, 0.3), Network::Bitcoin, now);
        assert!(watch.due(now + MAX_CHECK_DELAY));
        let progress = watch.record(&info(700_000, 700_000, false, 1.0), Network::Bitcoin, now);
        assert_eq!(progress, 1.0);
        assert!(!watch.due(now));
        assert!(watch.due(now + MIN_CHECK_DELAY));

        watch.postpone(now);
        assert!(!watch.due(now + Duration::from_secs(1)));
        assert!(watch.due(now + MIN_CHECK_DELAY));
    }
}
