use crate::{
    bitcoind::{BitcoindError, ChainClient, TxStatus},
    config::BitcoindConfig,
    custodyd::BlockchainTip,
    transactions::RBF_SEQUENCE,
};
use revault_tx::bitcoin::{
    consensus::encode, hashes::hex::FromHex, Address, Amount, BlockHash, OutPoint, Script,
    Transaction, TxIn, TxOut, Txid,
};

use std::{convert::TryFrom, fs, str::FromStr, sync::Mutex, time::Duration};

use jsonrpc::{
    arg,
    client::Client,
    error::RpcError,
    simple_http::{Error as HttpError, SimpleHttpTransport},
};

use serde_json::Value as Json;

// If bitcoind takes more than 3 minutes to answer one of our queries, fail.
const RPC_SOCKET_TIMEOUT: u64 = 180;

// The weight of the P2WPKH input of the fee wallet we add to a revocation transaction
const FEE_INPUT_WEIGHT: usize = 272;

pub struct BitcoinD {
    node_client: Client,
    watchonly_client: Client,
    /// The wallet we take coins from to bump the revocation transactions, if any
    fee_client: Option<Client>,

    /// How many times the client will try again to send a request to bitcoind upon failure
    retries: usize,
    /// Set when the watchonly wallet was just created: the next import rescans from there.
    rescan_from: Mutex<Option<u32>>,
}

macro_rules! params {
    ($($param:expr),* $(,)?) => {
        [
            $(
                arg($param),
            )*
        ]
    };
}

fn http_client(url: &str, cookie: String) -> Result<Client, BitcoindError> {
    Ok(Client::with_transport(
        SimpleHttpTransport::builder()
            .url(url)
            .map_err(BitcoindError::from)?
            .timeout(Duration::from_secs(RPC_SOCKET_TIMEOUT))
            .cookie_auth(cookie)
            .build(),
    ))
}

impl BitcoinD {
    pub fn new(
        config: &BitcoindConfig,
        watchonly_wallet_path: String,
    ) -> Result<BitcoinD, BitcoindError> {
        let cookie_string = fs::read_to_string(&config.cookie_path)
            .map_err(|e| BitcoindError::Custom(format!("Reading cookie file: {}", e)))?;

        let node_client = http_client(&config.addr.to_string(), cookie_string.clone())?;
        let watchonly_url = format!("http://{}/wallet/{}", config.addr, watchonly_wallet_path);
        let watchonly_client = http_client(&watchonly_url, cookie_string.clone())?;
        let fee_client = config
            .fee_wallet
            .as_ref()
            .map(|name| {
                let fee_url = format!("http://{}/wallet/{}", config.addr, name);
                http_client(&fee_url, cookie_string.clone())
            })
            .transpose()?;

        Ok(BitcoinD {
            node_client,
            watchonly_client,
            fee_client,
            retries: 0,
            rescan_from: Mutex::new(None),
        })
    }

    /// Set the retry limit (number of times we'll retry a request to bitcoind upon specific failures).
    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retries = retry_limit;
        self
    }

    /// Make the next import rescan the chain from this timestamp.
    pub fn set_rescan_from(&self, timestamp: u32) {
        *self.rescan_from.lock().unwrap() = Some(timestamp);
    }

    /// Wrapper to retry a request sent to bitcoind upon IO failure
    /// according to the configured number of retries.
    fn retry<T, R: Fn() -> Result<T, BitcoindError>>(
        &self,
        request: R,
    ) -> Result<T, BitcoindError> {
        let mut error: Option<BitcoindError> = None;
        for i in 0..self.retries + 1 {
            match request() {
                Ok(res) => return Ok(res),
                Err(e) => {
                    if e.is_warming_up() {
                        error = Some(e)
                    } else if let BitcoindError::Server(jsonrpc::Error::Transport(ref err)) = e {
                        match err.downcast_ref::<HttpError>() {
                            Some(HttpError::Timeout)
                            | Some(HttpError::SocketError(_))
                            | Some(HttpError::HttpErrorCode(503)) => {
                                std::thread::sleep(Duration::from_secs(1));
                                log::debug!("Retrying RPC request to bitcoind: attempt #{}", i);
                                error = Some(e);
                            }
                            _ => return Err(e),
                        }
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(BitcoindError::Custom(format!(
            "Retry limit reached: {:?}",
            error
        )))
    }

    fn make_request(
        &self,
        client: &Client,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<Json, BitcoindError> {
        self.retry(|| {
            let req = client.build_request(method, params);
            log::trace!("Sending to bitcoind: {:#?}", req);
            match client.send_request(req) {
                Ok(resp) => {
                    let res = resp.result().map_err(BitcoindError::Server)?;
                    log::trace!("Got from bitcoind: {:#?}", res);

                    Ok(res)
                }
                Err(e) => Err(BitcoindError::Server(e)),
            }
        })
    }

    fn make_node_request(
        &self,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<Json, BitcoindError> {
        self.make_request(&self.node_client, method, params)
    }

    fn make_watchonly_request(
        &self,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<Json, BitcoindError> {
        self.make_request(&self.watchonly_client, method, params)
    }

    pub fn getblockchaininfo(&self) -> Result<Json, BitcoindError> {
        self.make_node_request("getblockchaininfo", &[])
    }

    pub fn getblockhash(&self, height: u32) -> Result<BlockHash, BitcoindError> {
        self.make_node_request("getblockhash", &params!(height))?
            .as_str()
            .and_then(|hash| BlockHash::from_str(hash).ok())
            .ok_or_else(|| malformed("getblockhash", "result"))
    }

    pub fn get_tip(&self) -> Result<BlockchainTip, BitcoindError> {
        let height = self
            .make_node_request("getblockcount", &[])?
            .as_u64()
            .ok_or_else(|| malformed("getblockcount", "result"))? as u32;
        let hash = self.getblockhash(height)?;

        Ok(BlockchainTip { height, hash })
    }

    pub fn synchronization_info(&self) -> Result<SyncInfo, BitcoindError> {
        let chaininfo = self.make_node_request("getblockchaininfo", &[])?;
        SyncInfo::try_from(&chaininfo)
    }

    pub fn createwallet_startup(&self, wallet_path: String) -> Result<(), BitcoindError> {
        let res = self.make_node_request(
            "createwallet",
            &params!(
                Json::String(wallet_path),
                Json::Bool(true),             // watchonly
                Json::Bool(true),             // blank
                Json::String("".to_string()), // passphrase,
                Json::Bool(false),            // avoid_reuse
                Json::Bool(true),             // descriptors
                Json::Bool(true),             // load_on_startup
            ),
        )?;

        wallet_opened(&res, "createwallet")
    }

    pub fn listwallets(&self) -> Result<Vec<String>, BitcoindError> {
        self.make_node_request("listwallets", &[])?
            .as_array()
            .ok_or_else(|| malformed("listwallets", "result"))?
            .iter()
            .map(|path| {
                path.as_str()
                    .map(|p| p.to_string())
                    .ok_or_else(|| malformed("listwallets", "wallet"))
            })
            .collect()
    }

    pub fn loadwallet_startup(&self, wallet_path: String) -> Result<(), BitcoindError> {
        let res = self.make_node_request(
            "loadwallet",
            &params!(
                Json::String(wallet_path),
                Json::Bool(true), // load_on_startup
            ),
        )?;

        wallet_opened(&res, "loadwallet")
    }

    pub fn unloadwallet(&self, wallet_path: String) -> Result<(), BitcoindError> {
        let res = self.make_node_request("unloadwallet", &params!(Json::String(wallet_path),))?;

        let warning: &str = field(&res, "warning", "unloadwallet", Json::as_str)?;
        if !warning.is_empty() {
            Err(BitcoindError::Custom(warning.to_string()))
        } else {
            Ok(())
        }
    }

    /// Get the `addr()` descriptor for this address, with its checksum.
    pub fn addr_descriptor(&self, address: &str) -> Result<String, BitcoindError> {
        let desc_wo_checksum = format!("addr({})", address);

        Ok(self
            .make_node_request(
                "getdescriptorinfo",
                &params!(Json::String(desc_wo_checksum)),
            )?
            .get("descriptor")
            .ok_or_else(|| {
                BitcoindError::Custom("No 'descriptor' in 'getdescriptorinfo'".to_string())
            })?
            .as_str()
            .ok_or_else(|| {
                BitcoindError::Custom(
                    "'descriptor' in 'getdescriptorinfo' isn't a string anymore".to_string(),
                )
            })?
            .to_string())
    }

    fn import_descriptors(
        &self,
        client: &Client,
        descriptors: Vec<String>,
        timestamp: Option<u32>,
    ) -> Result<(), BitcoindError> {
        if timestamp.is_some() {
            log::debug!("Not a fresh wallet, rescan *may* take some time.");
        }

        let all_descriptors: Vec<Json> = descriptors
            .into_iter()
            .map(|desc| {
                let mut desc_map = serde_json::Map::with_capacity(2);
                desc_map.insert("desc".to_string(), Json::String(desc));
                // We set to "now" the timestamp for fresh addresses, as otherwise bitcoind
                // will rescan the last few blocks for each of them.
                desc_map.insert(
                    "timestamp".to_string(),
                    timestamp
                        .map(serde_json::Number::from)
                        .map(Json::Number)
                        .unwrap_or_else(|| Json::String("now".to_string())),
                );

                Json::Object(desc_map)
            })
            .collect();

        let res = self.make_request(
            client,
            "importdescriptors",
            &params!(Json::Array(all_descriptors)),
        )?;
        let all_succeeded = res
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .all(|res| res.get("success") == Some(&Json::Bool(true)))
            })
            .unwrap_or(false);
        if all_succeeded {
            return Ok(());
        }

        Err(BitcoindError::Custom(format!(
            "Error returned from 'importdescriptor': {:?}",
            res
        )))
    }

    fn list_unspent(
        &self,
        client: &Client,
        min_amount: Option<u64>,
    ) -> Result<Vec<ListUnspentEntry>, BitcoindError> {
        let res = if let Some(min_amount) = min_amount {
            self.make_request(
                client,
                "listunspent",
                &params!(
                    Json::Number(0.into()),       // minconf
                    Json::Number(9999999.into()), // maxconf (default)
                    Json::Array(vec![]),          // addresses (default)
                    Json::Bool(true),             // include_unsafe (default)
                    serde_json::json!({
                        "minimumAmount": Amount::from_sat(min_amount).as_btc(),
                    }), // query_options
                ),
            )?
        } else {
            self.make_request(
                client,
                "listunspent",
                &params!(
                    Json::Number(0.into()), // minconf
                ),
            )?
        };

        res.as_array()
            .ok_or_else(|| malformed("listunspent", "result"))?
            .iter()
            .map(ListUnspentEntry::try_from)
            .collect()
    }

    pub fn is_in_mempool(&self, txid: &Txid) -> Result<bool, BitcoindError> {
        match self.make_node_request("getmempoolentry", &params!(Json::String(txid.to_string()))) {
            Ok(_) => Ok(true),
            Err(BitcoindError::Server(jsonrpc::Error::Rpc(RpcError { code: -5, .. }))) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcast a transaction with 'sendrawtransaction', discarding the returned txid
    pub fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), BitcoindError> {
        let tx_hex = encode::serialize_hex(tx);
        log::debug!("Broadcasting '{}'", tx_hex);
        self.make_node_request("sendrawtransaction", &params!(Json::String(tx_hex)))
            .map(|_| ())
    }

    pub fn broadcast_transactions(&self, txs: &[Transaction]) -> Result<(), BitcoindError> {
        txs.iter().try_for_each(|tx| self.broadcast_transaction(tx))
    }
}

impl ChainClient for BitcoinD {
    fn tip(&self) -> Result<BlockchainTip, BitcoindError> {
        self.get_tip()
    }

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, BitcoindError> {
        match self
            .make_watchonly_request("gettransaction", &params!(Json::String(txid.to_string())))
        {
            Ok(res) => {
                if let Some(height) = res.get("blockheight").and_then(|h| h.as_u64()) {
                    return Ok(TxStatus::Confirmed {
                        height: height as u32,
                    });
                }
            }
            // Not a wallet transaction
            Err(BitcoindError::Server(jsonrpc::Error::Rpc(RpcError { code: -5, .. }))) => {}
            Err(e) => return Err(e),
        }

        if self.is_in_mempool(txid)? {
            Ok(TxStatus::Mempool)
        } else {
            Ok(TxStatus::Unknown)
        }
    }

    fn deposits(&self) -> Result<Vec<ListUnspentEntry>, BitcoindError> {
        self.list_unspent(&self.watchonly_client, None)
    }

    fn import_addresses(&self, addresses: &[Address]) -> Result<(), BitcoindError> {
        if addresses.is_empty() {
            return Ok(());
        }

        // Bitcoind does not support our Miniscript descriptors, so we import the derived
        // addresses one by one and handle the derivation index mess ourselves.
        let descriptors = addresses
            .iter()
            .map(|addr| self.addr_descriptor(&addr.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        log::trace!("Importing descriptors '{:?}'", &descriptors);

        let mut rescan_from = self.rescan_from.lock().unwrap();
        self.import_descriptors(&self.watchonly_client, descriptors, *rescan_from)?;
        *rescan_from = None;

        Ok(())
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), BitcoindError> {
        self.broadcast_transaction(tx)
    }

    /// Attach a coin of the fee wallet to this revocation transaction to get it to `feerate`.
    /// The revocation transactions are signed with ANYONECANPAY: we can add an input but no
    /// change output, so the whole coin goes to fees.
    fn bump_revocation(
        &self,
        tx: &Transaction,
        prevout_value: Amount,
        feerate: u64,
    ) -> Result<Transaction, BitcoindError> {
        let fee_client = self
            .fee_client
            .as_ref()
            .ok_or_else(|| BitcoindError::Custom("No fee wallet configured".to_string()))?;

        let out_value: u64 = tx.output.iter().map(|o| o.value).sum();
        let current_fee = prevout_value.as_sat().saturating_sub(out_value);
        let vbytes = (tx.get_weight() + FEE_INPUT_WEIGHT + 3) / 4;
        let needed = (feerate * vbytes as u64).saturating_sub(current_fee);

        let coin = self
            .list_unspent(fee_client, Some(needed))?
            .into_iter()
            .filter(|utxo| utxo.confirmations > 0 && utxo.txo.value >= needed)
            .min_by_key(|utxo| utxo.txo.value)
            .ok_or_else(|| {
                BitcoindError::Custom(format!(
                    "No confirmed coin of at least {} sats in the fee wallet",
                    needed
                ))
            })?;
        log::debug!(
            "Bumping '{}' to {}sat/vb with fee wallet coin '{}'",
            tx.txid(),
            feerate,
            coin.outpoint
        );

        let mut bumped = tx.clone();
        bumped.input.push(TxIn {
            previous_output: coin.outpoint,
            script_sig: Script::new(),
            sequence: RBF_SEQUENCE,
            witness: vec![],
        });
        let res = self.make_request(
            fee_client,
            "signrawtransactionwithwallet",
            &params!(Json::String(encode::serialize_hex(&bumped))),
        )?;
        let method = "signrawtransactionwithwallet";
        let signed: Transaction = field(&res, "hex", method, Json::as_str)
            .and_then(|hex| Vec::<u8>::from_hex(hex).map_err(|_| malformed(method, "hex")))
            .and_then(|bytes| encode::deserialize(&bytes).map_err(|_| malformed(method, "hex")))?;

        // The presigned input can't be signed by the wallet, only check ours was
        match signed.input.last() {
            Some(input) if !input.witness.is_empty() => Ok(signed),
            _ => Err(BitcoindError::Custom(
                "The fee wallet could not sign its input".to_string(),
            )),
        }
    }
}

pub struct SyncInfo {
    pub headers: u64,
    pub blocks: u64,
    pub ibd: bool,
    pub progress: f64,
}

impl TryFrom<&Json> for SyncInfo {
    type Error = BitcoindError;

    fn try_from(chaininfo: &Json) -> Result<Self, Self::Error> {
        let method = "getblockchaininfo";
        Ok(SyncInfo {
            headers: field(chaininfo, "headers", method, Json::as_u64)?,
            blocks: field(chaininfo, "blocks", method, Json::as_u64)?,
            ibd: field(chaininfo, "initialblockdownload", method, Json::as_bool)?,
            progress: field(chaininfo, "verificationprogress", method, Json::as_f64)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListUnspentEntry {
    pub outpoint: OutPoint,
    pub txo: TxOut,
    pub confirmations: i32,
}

impl TryFrom<&Json> for ListUnspentEntry {
    type Error = BitcoindError;

    fn try_from(utxo: &Json) -> Result<Self, Self::Error> {
        let method = "listunspent";
        let txid = field(utxo, "txid", method, Json::as_str)
            .and_then(|s| Txid::from_str(s).map_err(|_| malformed(method, "txid")))?;
        let vout = field(utxo, "vout", method, Json::as_u64)?;
        let script_pubkey = field(utxo, "scriptPubKey", method, Json::as_str)
            .and_then(|s| Script::from_str(s).map_err(|_| malformed(method, "scriptPubKey")))?;
        let value = field(utxo, "amount", method, Json::as_f64)
            .and_then(|a| Amount::from_btc(a).map_err(|_| malformed(method, "amount")))?
            .as_sat();
        let confirmations = field(utxo, "confirmations", method, Json::as_i64)?;

        Ok(ListUnspentEntry {
            outpoint: OutPoint {
                txid,
                vout: vout as u32,
            },
            txo: TxOut {
                value,
                script_pubkey,
            },
            confirmations: confirmations as i32,
        })
    }
}

fn malformed(method: &str, name: &str) -> BitcoindError {
    BitcoindError::Custom(format!("Missing or invalid '{}' in '{}' result", name, method))
}

// Get a value out of an RPC result, or error if bitcoind did not give it to us
fn field<'a, T>(
    json: &'a Json,
    name: &str,
    method: &str,
    get: impl FnOnce(&'a Json) -> Option<T>,
) -> Result<T, BitcoindError> {
    json.get(name)
        .and_then(get)
        .ok_or_else(|| malformed(method, name))
}

// Both 'createwallet' and 'loadwallet' give back the name of the wallet once it's loaded.
fn wallet_opened(res: &Json, method: &str) -> Result<(), BitcoindError> {
    if res.get("name").is_some() {
        return Ok(());
    }

    Err(BitcoindError::Custom(format!(
        "'{}' failed: {}",
        method,
        res.get("warning")
            .and_then(Json::as_str)
            .unwrap_or("no warning given")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listunspent_entry_parsing() {
        let json = serde_json::json!({
            "txid": "fcb6ab963b654c773de786f4ac92c132b3d2e816ccea37af9592aa0b4aaec04b",
            "vout": 1,
            "address": "bc1qwqdg6squsna38e46795at95yu9atm8azzmyvckulcc7kytlcckxswvvzej",
            "scriptPubKey": "0020701a8d401c84fb13e6baf169d59684e17abd9fa216c8cc5b9fc63d622ff8c58d",
            "amount": 1.5,
            "confirmations": 3,
            "spendable": false,
            "solvable": false,
            "safe": true
        });
        let entry = ListUnspentEntry::try_from(&json).unwrap();

        assert_eq!(
            entry.outpoint,
            OutPoint::from_str(
                "fcb6ab963b654c773de786f4ac92c132b3d2e816ccea37af9592aa0b4aaec04b:1"
            )
            .unwrap()
        );
        assert_eq!(entry.txo.value, 150_000_000);
        assert_eq!(
            Address::from_script(&entry.txo.script_pubkey, revault_tx::bitcoin::Network::Bitcoin)
                .unwrap()
                .to_string(),
            "bc1qwqdg6squsna38e46795at95yu9atm8azzmyvckulcc7kytlcckxswvvzej"
        );
        assert_eq!(entry.confirmations, 3);

        // A bitcoind answering garbage is an error, not a crash
        let mut invalid = json.clone();
        invalid["amount"] = serde_json::json!("1.5");
        assert!(ListUnspentEntry::try_from(&invalid).is_err());
        let mut invalid = json;
        invalid["txid"] = serde_json::json!("fcb6ab96");
        assert!(ListUnspentEntry::try_from(&invalid).is_err());
    }

    #[test]
    fn sync_info_parsing() {
        let json = serde_json::json!({
            "chain": "main",
            "blocks": 700_000,
            "headers": 700_010,
            "verificationprogress": 0.9999,
            "initialblockdownload": false
        });
        let info = SyncInfo::try_from(&json).unwrap();
        assert_eq!((info.headers, info.blocks), (700_010, 700_000));
        assert!(!info.ibd);
        assert_eq!(info.progress, 0.9999);

        let err = SyncInfo::try_from(&serde_json::json!({ "blocks": 1 })).unwrap_err();
        assert!(err.to_string().contains("headers"));
    }
}
