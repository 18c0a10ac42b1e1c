use std::{
    collections::HashSet, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration, vec::Vec,
};

use revault_net::noise::PublicKey as NoisePubkey;
use revault_tx::bitcoin::{
    hashes::hex::FromHex, util::bip32::ExtendedPubKey, Address, Network,
    PublicKey as BitcoinPubKey,
};

use serde::{de, Deserialize, Deserializer};

/// The largest CSV we accept. BIP68 block-based relative locktimes are encoded on 16 bits.
pub const MAX_UNVAULT_CSV: u32 = 0xFFFF;

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string).map_err(|e| de::Error::custom(format!("Error parsing '{}': '{}'", string, e)))
}

fn deserialize_opt_fromstr<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Option::<String>::deserialize(deserializer)?
        .map(|string| {
            T::from_str(&string)
                .map_err(|e| de::Error::custom(format!("Error parsing '{}': '{}'", string, e)))
        })
        .transpose()
}

fn deserialize_vec_fromstr<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Vec::<String>::deserialize(deserializer)?
        .into_iter()
        .map(|string| {
            T::from_str(&string)
                .map_err(|e| de::Error::custom(format!("Error parsing '{}': '{}'", string, e)))
        })
        .collect()
}

fn deserialize_noisepubkey<'de, D>(deserializer: D) -> Result<NoisePubkey, D::Error>
where
    D: Deserializer<'de>,
{
    let data = String::deserialize(deserializer)?;
    FromHex::from_hex(&data)
        .map_err(de::Error::custom)
        .map(NoisePubkey)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn deserialize_loglevel<'de, D>(deserializer: D) -> Result<log::LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level_str = String::deserialize(deserializer)?;
    log::LevelFilter::from_str(&level_str).map_err(de::Error::custom)
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_sig_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_minconf() -> u32 {
    6
}

/// Everything we need to know for talking to bitcoind serenely
#[derive(Debug, Clone, Deserialize)]
pub struct BitcoindConfig {
    /// The network we are operating on, one of "bitcoin", "testnet", "regtest", "signet"
    #[serde(deserialize_with = "deserialize_fromstr")]
    pub network: Network,
    /// Path to bitcoind's cookie file, to authenticate the RPC connection
    pub cookie_path: PathBuf,
    /// The IP:port bitcoind's RPC is listening on
    pub addr: SocketAddr,
    /// The poll interval for bitcoind
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_poll_interval"
    )]
    pub poll_interval_secs: Duration,
    /// A bitcoind wallet holding coins we can attach to revocation transactions to bump
    /// their feerate.
    pub fee_wallet: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchtowerConfig {
    pub host: SocketAddr,
    #[serde(deserialize_with = "deserialize_noisepubkey")]
    pub noise_key: NoisePubkey,
}

/// If we are a stakeholder, we need to connect to our watchtower(s)
#[derive(Debug, Clone, Deserialize)]
pub struct StakeholderConfig {
    #[serde(deserialize_with = "deserialize_fromstr")]
    pub xpub: ExtendedPubKey,
    pub watchtowers: Vec<WatchtowerConfig>,
    #[serde(deserialize_with = "deserialize_fromstr")]
    pub emergency_address: Address,
}

// Same fields as the WatchtowerConfig struct for now, but leave them separate.
#[derive(Debug, Clone, Deserialize)]
pub struct CosignerConfig {
    pub host: SocketAddr,
    #[serde(deserialize_with = "deserialize_noisepubkey")]
    pub noise_key: NoisePubkey,
}

/// If we are a manager, we need to connect to cosigning servers
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(deserialize_with = "deserialize_fromstr")]
    pub xpub: ExtendedPubKey,
    #[serde(default)]
    pub cosigners: Vec<CosignerConfig>,
}

/// Tuning of the Cancel broadcast race.
///
/// The cancel margin is the number of blocks before the Unvault CSV expires by which we want
/// our Cancel transaction to be confirmed. Unless overriden, it accounts for one poll
/// interval of detection delay, the propagation delay and the expected confirmation latency.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    pub confirmation_latency_blocks: u32,
    pub propagation_delay_secs: u64,
    pub block_interval_secs: u64,
    pub cancel_margin_blocks: Option<u32>,
    /// Feerate of the first fee-bumping attempt, in sat/vbyte
    pub initial_feerate: u64,
    /// We never bump above this feerate, in sat/vbyte
    pub max_feerate: u64,
    /// After how many blocks without confirmation do we bump again
    pub bump_after_blocks: u32,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        RevocationConfig {
            confirmation_latency_blocks: 6,
            propagation_delay_secs: 60,
            block_interval_secs: 600,
            cancel_margin_blocks: None,
            initial_feerate: 20,
            max_feerate: 1_000,
            bump_after_blocks: 1,
        }
    }
}

impl RevocationConfig {
    /// The number of blocks before the CSV maturity we must have our Cancel confirmed by.
    pub fn cancel_margin(&self, poll_interval: Duration) -> u32 {
        if let Some(margin) = self.cancel_margin_blocks {
            return margin;
        }

        let block_interval = std::cmp::max(self.block_interval_secs, 1);
        let detection_secs = poll_interval.as_secs() + self.propagation_delay_secs;
        let detection_blocks = (detection_secs + block_interval - 1) / block_interval;

        detection_blocks as u32 + self.confirmation_latency_blocks
    }
}

/// Static informations we require to operate
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Everything we need to know to talk to bitcoind
    pub bitcoind_config: BitcoindConfig,
    /// The stakeholders' master extended public keys, in the order agreed upon at setup
    #[serde(deserialize_with = "deserialize_vec_fromstr")]
    pub stakeholders_xpubs: Vec<ExtendedPubKey>,
    /// The managers' master extended public keys
    #[serde(deserialize_with = "deserialize_vec_fromstr")]
    pub managers_xpubs: Vec<ExtendedPubKey>,
    /// The cosigning servers' static public keys
    #[serde(deserialize_with = "deserialize_vec_fromstr", default)]
    pub cosigners_keys: Vec<BitcoinPubKey>,
    /// The Unvault output scripts relative timelock, in blocks
    pub unvault_csv: u32,
    /// The Emergency address, for deployments without a stakeholder section
    #[serde(deserialize_with = "deserialize_opt_fromstr", default)]
    pub emergency_address: Option<Address>,
    /// Some() if we are a stakeholder
    pub stakeholder_config: Option<StakeholderConfig>,
    /// Some() if we are a manager
    pub manager_config: Option<ManagerConfig>,
    #[serde(default)]
    pub revocation_config: RevocationConfig,
    /// The host of the sync server
    pub coordinator_host: SocketAddr,
    /// The Noise static public key of the sync server
    #[serde(deserialize_with = "deserialize_noisepubkey")]
    pub coordinator_noise_key: NoisePubkey,
    /// The poll intervals for signature fetching (default: 1min)
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_sig_poll_interval"
    )]
    pub coordinator_poll_seconds: Duration,
    /// An optional custom data directory
    pub data_dir: Option<PathBuf>,
    /// Whether to daemonize the process
    pub daemon: Option<bool>,
    /// What messages to log
    #[serde(
        deserialize_with = "deserialize_loglevel",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// After how many blocks should we consider a transaction as confirmed?
    #[serde(default = "default_minconf")]
    pub min_conf: u32,
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
    /// The key material or the CSV changed since the data directory was created
    ImmutableMismatch(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Self::DatadirNotFound => write!(f, "Could not locate the configuration directory."),
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
            Self::ImmutableMismatch(e) => write!(
                f,
                "Configuration changed after first run, refusing to start: {}",
                e
            ),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to the custodyd configuration folder.
///
/// It's a "Custodyd/" directory in the XDG standard configuration directory for
/// all OSes but Linux-based ones, for which it's `~/.custodyd/`.
/// There is only one config file at `custodyd.toml`, which specifies the network.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".custodyd");

        #[cfg(not(target_os = "linux"))]
        path.push("Custodyd");

        return Some(path);
    }

    None
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("custodyd.toml");
        path
    })
}

// Extended keys for the test networks all share the testnet version bytes.
fn xpub_network_matches(xpub: &ExtendedPubKey, network: Network) -> bool {
    match network {
        Network::Bitcoin => xpub.network == Network::Bitcoin,
        _ => xpub.network == Network::Testnet,
    }
}

// Signet addresses have testnet type
fn address_network_matches(address: &Address, network: Network) -> bool {
    address.network == network
        || (network == Network::Signet && address.network == Network::Testnet)
        || (network == Network::Regtest && address.network == Network::Testnet)
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    ///
    /// We require all settings to be set in the configuration file, and only in the configuration
    /// file. We don't allow to set them via the command line or environment variables to avoid a
    /// futile duplication.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file =
            custom_path.unwrap_or(config_file_path().ok_or(ConfigError::DatadirNotFound)?);

        let config = toml::from_slice::<Config>(&std::fs::read(&config_file)?)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;
        config.check()?;

        Ok(config)
    }

    /// The Emergency address, wherever it was specified.
    pub fn emergency_address(&self) -> Option<&Address> {
        self.stakeholder_config
            .as_ref()
            .map(|stk| &stk.emergency_address)
            .or_else(|| self.emergency_address.as_ref())
    }

    /// Sanity check the configuration. Any error here is fatal.
    pub fn check(&self) -> Result<(), ConfigError> {
        let network = self.bitcoind_config.network;

        if self.stakeholders_xpubs.len() < 2 {
            return Err(ConfigError::Unexpected(
                "We need at least two stakeholders".to_string(),
            ));
        }
        if self.managers_xpubs.is_empty() {
            return Err(ConfigError::Unexpected(
                "We need at least one manager".to_string(),
            ));
        }
        if self.stakeholder_config.is_none() && self.manager_config.is_none() {
            return Err(ConfigError::Unexpected(
                r#"At least one of "stakeholder_config" or "manager_config" must be set"#
                    .to_string(),
            ));
        }

        for xpub in self
            .stakeholders_xpubs
            .iter()
            .chain(self.managers_xpubs.iter())
        {
            if !xpub_network_matches(xpub, network) {
                return Err(ConfigError::Unexpected(format!(
                    "Our bitcoin network is {} but one xpub has network {}",
                    network, xpub.network
                )));
            }
        }

        // The participants table is keyed by public key, a key may only appear once.
        let mut seen_xpubs = HashSet::with_capacity(self.stakeholders_xpubs.len());
        for xpub in self
            .stakeholders_xpubs
            .iter()
            .chain(self.managers_xpubs.iter())
        {
            if !seen_xpubs.insert(xpub.to_string()) {
                return Err(ConfigError::Unexpected(format!(
                    "Duplicated xpub in participants: {}",
                    xpub
                )));
            }
        }
        let mut seen_keys = HashSet::with_capacity(self.cosigners_keys.len());
        for key in self.cosigners_keys.iter() {
            if !key.compressed {
                return Err(ConfigError::Unexpected(format!(
                    "Cosigner key '{}' is not compressed",
                    key
                )));
            }
            if !seen_keys.insert(key.to_string()) {
                return Err(ConfigError::Unexpected(format!(
                    "Duplicated cosigner key: {}",
                    key
                )));
            }
        }

        // Each stakeholder runs a cosigning server, or none does
        if !self.cosigners_keys.is_empty()
            && self.cosigners_keys.len() != self.stakeholders_xpubs.len()
        {
            return Err(ConfigError::Unexpected(format!(
                "'{}' cosigners for '{}' stakeholders",
                self.cosigners_keys.len(),
                self.stakeholders_xpubs.len()
            )));
        }

        if self.unvault_csv == 0 || self.unvault_csv > MAX_UNVAULT_CSV {
            return Err(ConfigError::Unexpected(format!(
                "Unvault CSV '{}' is out of range (1..={})",
                self.unvault_csv, MAX_UNVAULT_CSV
            )));
        }

        let margin = self
            .revocation_config
            .cancel_margin(self.bitcoind_config.poll_interval_secs);
        if margin >= self.unvault_csv {
            return Err(ConfigError::Unexpected(format!(
                "Cancel margin of '{}' blocks leaves no time to react with a CSV of '{}'",
                margin, self.unvault_csv
            )));
        }
        if self.revocation_config.initial_feerate == 0
            || self.revocation_config.initial_feerate > self.revocation_config.max_feerate
        {
            return Err(ConfigError::Unexpected(format!(
                "Invalid revocation feerates: initial '{}', max '{}'",
                self.revocation_config.initial_feerate, self.revocation_config.max_feerate
            )));
        }

        if let (Some(stk_config), Some(emer_addr)) =
            (&self.stakeholder_config, &self.emergency_address)
        {
            if &stk_config.emergency_address != emer_addr {
                return Err(ConfigError::Unexpected(
                    "Two different Emergency addresses are configured".to_string(),
                ));
            }
        }
        let emer_addr = self.emergency_address().ok_or_else(|| {
            ConfigError::Unexpected("No Emergency address configured".to_string())
        })?;
        if !address_network_matches(emer_addr, network) {
            return Err(ConfigError::Unexpected(format!(
                r#"Our "emergency_address" is for '{}' but bitcoind is on '{}'"#,
                emer_addr.network, network
            )));
        }
        if !emer_addr.script_pubkey().is_v0_p2wsh() {
            return Err(ConfigError::Unexpected(format!(
                "The Emergency address '{}' must be a P2WSH address",
                emer_addr
            )));
        }

        if let Some(ref stk_config) = self.stakeholder_config {
            if !self.stakeholders_xpubs.contains(&stk_config.xpub) {
                return Err(ConfigError::Unexpected(format!(
                    r#"Our "stakeholder_config" xpub is not part of the given stakeholders' xpubs: {}"#,
                    stk_config.xpub
                )));
            }
        }

        if let Some(ref man_config) = self.manager_config {
            if !self.managers_xpubs.contains(&man_config.xpub) {
                return Err(ConfigError::Unexpected(format!(
                    r#"Our "manager_config" xpub is not part of the given managers' xpubs: {}"#,
                    man_config.xpub
                )));
            }
        }

        Ok(())
    }
}
