use crate::{
    config::{config_folder_path, BitcoindConfig, Config, ConfigError, RevocationConfig},
    participants::{ParticipantKey, ParticipantTable, Role},
    transactions::TransactionFactory,
};

use std::{
    fmt, fs,
    io::{self, Read, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use revault_net::{
    noise::{PublicKey as NoisePubkey, SecretKey as NoisePrivKey},
    sodiumoxide,
};
use revault_tx::bitcoin::{
    secp256k1,
    util::bip32::{ChildNumber, ExtendedPubKey},
    BlockHash, Network,
};

#[derive(Debug, PartialEq, Copy, Clone)]
pub struct BlockchainTip {
    pub height: u32,
    pub hash: BlockHash,
}

#[derive(Debug)]
pub enum NoiseKeyError {
    LibsodiumInit,
    ReadingKey(io::Error),
    WritingKey(io::Error),
}

impl fmt::Display for NoiseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LibsodiumInit => write!(f, "Initializing libsodium"),
            Self::ReadingKey(e) => write!(f, "Reading Noise key: {}", e),
            Self::WritingKey(e) => write!(f, "Writing Noise key: {}", e),
        }
    }
}

impl std::error::Error for NoiseKeyError {}

// The communication keys are (for now) hot, so we just create it ourselves on first run.
fn read_or_create_noise_key(secret_file: &Path) -> Result<NoisePrivKey, NoiseKeyError> {
    let mut noise_secret = NoisePrivKey([0; 32]);

    if !secret_file.exists() {
        log::info!(
            "No Noise private key at '{:?}', generating a new one",
            secret_file
        );

        sodiumoxide::init().map_err(|_| NoiseKeyError::LibsodiumInit)?;
        noise_secret
            .0
            .copy_from_slice(&sodiumoxide::randombytes::randombytes(32));

        // We create it in read-only but open it in write only.
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o400);
        }

        let mut fd = options
            .open(secret_file)
            .map_err(NoiseKeyError::WritingKey)?;
        fd.write_all(&noise_secret.0)
            .map_err(NoiseKeyError::WritingKey)?;
    } else {
        let mut noise_secret_fd = fs::File::open(secret_file).map_err(NoiseKeyError::ReadingKey)?;
        noise_secret_fd
            .read_exact(&mut noise_secret.0)
            .map_err(NoiseKeyError::ReadingKey)?;
    }

    assert!(noise_secret.0 != [0; 32]);
    Ok(noise_secret)
}

fn create_datadir(datadir_path: &Path) -> Result<(), io::Error> {
    #[cfg(unix)]
    return {
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700).recursive(true).create(datadir_path)
    };

    #[cfg(not(unix))]
    return fs::create_dir_all(datadir_path);
}

/// Our global state. Built once at startup out of the configuration and never mutated, every
/// thread gets a reference to it.
pub struct CustodyD {
    // Bitcoind stuff
    /// Everything we need to know to talk to bitcoind
    pub bitcoind_config: BitcoindConfig,
    /// After how many blocks a transaction is buried
    pub min_conf: u32,

    // Transactions stuff
    /// Derives the transactions of all vaults, out of the participants' keys
    pub factory: TransactionFactory,
    /// Who am i, and where am i in all this mess ?
    pub our_stk_xpub: Option<ExtendedPubKey>,
    pub our_man_xpub: Option<ExtendedPubKey>,
    pub secp_ctx: secp256k1::Secp256k1<secp256k1::VerifyOnly>,

    // Revocation stuff
    pub revocation_config: RevocationConfig,
    /// How many blocks before the Unvault CSV matures we want our Cancel confirmed
    pub cancel_margin: u32,

    // Network stuff
    /// The static private key we use to establish connections to servers.
    pub noise_secret: NoisePrivKey,
    pub coordinator_host: SocketAddr,
    pub coordinator_noisekey: NoisePubkey,
    pub coordinator_poll_interval: Duration,
    pub watchtowers: Vec<(SocketAddr, NoisePubkey)>,

    // Misc stuff
    /// We store all our data in one place, that's here.
    pub data_dir: PathBuf,
    /// Should we run as a daemon? (Default: yes)
    pub daemon: bool,
}

impl CustodyD {
    /// Creates our global state by consuming the static configuration
    pub fn from_config(config: Config) -> Result<CustodyD, Box<dyn std::error::Error>> {
        let emergency_address = config
            .emergency_address()
            .cloned()
            .ok_or_else(|| ConfigError::Unexpected("No Emergency address".to_string()))?;
        let participants = ParticipantTable::from_config(&config);
        let watchtowers = participants.watchtowers();
        let factory = TransactionFactory::new(
            participants,
            emergency_address,
            config.unvault_csv,
            config.bitcoind_config.network,
        )?;
        let cancel_margin = config
            .revocation_config
            .cancel_margin(config.bitcoind_config.poll_interval_secs);

        let mut data_dir = match config.data_dir {
            Some(data_dir) => data_dir,
            None => config_folder_path().ok_or(ConfigError::DatadirNotFound)?,
        };
        data_dir.push(config.bitcoind_config.network.to_string());
        if !data_dir.as_path().exists() {
            if let Err(e) = create_datadir(&data_dir) {
                return Err(Box::from(ConfigError::Unexpected(format!(
                    "Could not create data dir '{:?}': {}.",
                    data_dir, e
                ))));
            }
        }
        data_dir = fs::canonicalize(data_dir)?;

        let mut noise_secret_file = data_dir.clone();
        noise_secret_file.push("noise_secret");
        let noise_secret = read_or_create_noise_key(&noise_secret_file)?;

        let daemon = !matches!(config.daemon, Some(false));

        Ok(CustodyD {
            our_stk_xpub: config.stakeholder_config.as_ref().map(|stk| stk.xpub),
            our_man_xpub: config.manager_config.as_ref().map(|man| man.xpub),
            secp_ctx: secp256k1::Secp256k1::verification_only(),
            factory,
            revocation_config: config.revocation_config,
            cancel_margin,
            noise_secret,
            coordinator_host: config.coordinator_host,
            coordinator_noisekey: config.coordinator_noise_key,
            coordinator_poll_interval: config.coordinator_poll_seconds,
            watchtowers,
            min_conf: config.min_conf,
            bitcoind_config: config.bitcoind_config,
            data_dir,
            daemon,
        })
    }

    fn file_from_datadir(&self, file_name: &str) -> PathBuf {
        let data_dir_str = self
            .data_dir
            .to_str()
            .expect("Impossible: the datadir path is valid unicode");

        [data_dir_str, file_name].iter().collect()
    }

    pub fn log_file(&self) -> PathBuf {
        self.file_from_datadir("log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file_from_datadir("custodyd.pid")
    }

    pub fn db_file(&self) -> PathBuf {
        self.file_from_datadir("custodyd.sqlite3")
    }

    pub fn watchonly_wallet_name(&self, wallet_id: u32) -> String {
        format!("custodyd-watchonly-wallet-{}", wallet_id)
    }

    pub fn watchonly_wallet_file(&self, wallet_id: u32) -> String {
        self.file_from_datadir(&self.watchonly_wallet_name(wallet_id))
            .to_str()
            .expect("Valid utf-8")
            .to_string()
    }

    pub fn noise_pubkey(&self) -> NoisePubkey {
        self.noise_secret.public_key()
    }

    pub fn network(&self) -> Network {
        self.bitcoind_config.network
    }

    /// How many unused deposit addresses we watch past the next unused one
    pub fn gap_limit(&self) -> u32 {
        20
    }

    pub fn is_stakeholder(&self) -> bool {
        self.our_stk_xpub.is_some()
    }

    pub fn is_manager(&self) -> bool {
        self.our_man_xpub.is_some()
    }

    /// Our own public keys for the vault at this index, stakeholder one first.
    pub fn our_keys_at(&self, index: ChildNumber) -> Vec<secp256k1::PublicKey> {
        self.our_stk_xpub
            .iter()
            .chain(self.our_man_xpub.iter())
            .filter_map(|xpub| xpub.ckd_pub(&self.secp_ctx, index).ok())
            .map(|xpub| xpub.public_key.key)
            .collect()
    }

    /// The part of the configuration that must never change once the data directory exists.
    pub fn fingerprint(&self) -> String {
        let participants = self.factory.participants();
        let keys_of = |role: Role| -> String {
            participants
                .participants(role)
                .filter_map(|p| match p.key {
                    ParticipantKey::Extended(ref xpub) => Some(xpub.to_string()),
                    ParticipantKey::Static(ref key) => Some(key.to_string()),
                    ParticipantKey::None => None,
                })
                .collect::<Vec<String>>()
                .join(",")
        };

        [
            format!("network={}", self.network()),
            format!("stakeholders={}", keys_of(Role::Stakeholder)),
            format!("managers={}", keys_of(Role::Manager)),
            format!("cosigners={}", keys_of(Role::Cosigner)),
            format!("unvault_descriptor={}", self.factory.descriptors().unvault),
            format!("unvault_csv={}", self.factory.unvault_csv()),
            format!("emergency_address={}", self.factory.emergency_address()),
        ]
        .join("\n")
    }

    /// Check our configuration against the one the data directory was created with.
    pub fn check_fingerprint(&self, stored: &str) -> Result<(), ConfigError> {
        let current = self.fingerprint();
        if current == stored {
            return Ok(());
        }

        let changed: Vec<&str> = current
            .lines()
            .zip(stored.lines())
            .filter(|(cur, old)| cur != old)
            .filter_map(|(cur, _)| cur.split('=').next())
            .collect();
        Err(ConfigError::ImmutableMismatch(format!(
            "'{}' changed",
            changed.join("', '")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConfigError,
        utils::test_utils::{dummy_config, test_datadir, TestKeys},
    };

    use std::fs;

    #[test]
    fn test_from_config() {
        let datadir = test_datadir();
        let keys = TestKeys::new(4, 2, 0);

        let custodyd = CustodyD::from_config(dummy_config(&keys, 18, datadir.clone())).unwrap();
        assert!(custodyd.data_dir.ends_with("bitcoin"));
        assert!(custodyd.is_stakeholder() && !custodyd.is_manager());
        assert!(!custodyd.daemon);
        assert_eq!(custodyd.watchtowers.len(), 1);
        // 30s poll and 60s of propagation fit in a block, plus 6 blocks of confirmation
        assert_eq!(custodyd.cancel_margin, 7);
        assert_eq!(custodyd.our_keys_at(ChildNumber::from(0)).len(), 1);

        // The Noise key is created once, then read
        let noise_key = custodyd.noise_pubkey();
        let custodyd = CustodyD::from_config(dummy_config(&keys, 18, datadir.clone())).unwrap();
        assert_eq!(custodyd.noise_pubkey(), noise_key);

        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }

    #[test]
    fn fingerprint_catches_immutable_changes() {
        let datadir = test_datadir();
        let keys = TestKeys::new(4, 2, 0);
        let custodyd = CustodyD::from_config(dummy_config(&keys, 18, datadir.clone())).unwrap();
        let stored = custodyd.fingerprint();
        custodyd.check_fingerprint(&stored).unwrap();

        // Another CSV
        let other = CustodyD::from_config(dummy_config(&keys, 19, datadir.clone())).unwrap();
        assert_eq!(
            other.check_fingerprint(&stored),
            Err(ConfigError::ImmutableMismatch("'unvault_csv' changed".to_string()))
        );

        // Reordered stakeholders
        let mut config = dummy_config(&keys, 18, datadir.clone());
        config.stakeholders_xpubs.reverse();
        let other = CustodyD::from_config(config).unwrap();
        assert_eq!(
            other.check_fingerprint(&stored),
            Err(ConfigError::ImmutableMismatch(
                "'stakeholders' changed".to_string()
            ))
        );

        // Another participant
        let other_keys = TestKeys::new(5, 2, 0);
        let other =
            CustodyD::from_config(dummy_config(&other_keys, 18, datadir.clone())).unwrap();
        assert!(other.check_fingerprint(&stored).is_err());

        fs::remove_dir_all(&datadir).unwrap_or_else(|_| ());
    }
}
