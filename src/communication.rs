use crate::{custodyd::CustodyD, transactions::TransactionKind, utils::with_backoff};

use revault_net::{
    message::{
        coordinator::{self, GetSigs, Sigs},
        watchtower,
    },
    noise::{PublicKey as NoisePubkey, SecretKey as NoisePrivKey},
    transport::KKTransport,
};
use revault_tx::bitcoin::{secp256k1, util::bip32::ChildNumber, OutPoint, Txid};

use std::{collections::BTreeMap, fmt, net::SocketAddr, time::Duration};

use serde::Serialize;

// A request is attempted this many times before the server is deemed unreachable
const REQUEST_ATTEMPTS: usize = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// An error that occured when talking to a server
#[derive(Debug)]
pub enum CommunicationError {
    /// An error internal to revault_net, generally a transport error
    Net(revault_net::Error),
    /// We could not get a response after retrying
    Unreachable(String),
    /// The watchtower refused to store the revocation signatures for this vault
    WatchtowerNack(OutPoint),
    /// The Coordinator told us they could not store our signature
    SignatureStorage(Txid),
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Net(e) => write!(f, "Network error: '{}'", e),
            Self::Unreachable(e) => write!(f, "Unreachable {}", e),
            Self::WatchtowerNack(op) => write!(
                f,
                "Watchtower refused to store the revocation signatures for vault '{}'",
                op
            ),
            Self::SignatureStorage(txid) => write!(
                f,
                "Coordinator error: it failed to store the signature for '{}'",
                txid
            ),
        }
    }
}

impl std::error::Error for CommunicationError {}

impl From<revault_net::Error> for CommunicationError {
    fn from(e: revault_net::Error) -> Self {
        Self::Net(e)
    }
}

/// The transaction a signature is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigTarget {
    pub deposit_outpoint: OutPoint,
    pub kind: TransactionKind,
    pub txid: Txid,
}

/// The server relaying the signatures between the participants. It is not trusted: whatever
/// it returns is validated before being used.
pub trait CoordinatorClient: Send + Sync {
    fn publish(
        &self,
        target: &SigTarget,
        signer: secp256k1::PublicKey,
        signature: &secp256k1::Signature,
    ) -> Result<(), CommunicationError>;

    fn fetch(
        &self,
        target: &SigTarget,
    ) -> Result<BTreeMap<secp256k1::PublicKey, secp256k1::Signature>, CommunicationError>;
}

/// The signatures of the three revocation transactions of a vault.
#[derive(Debug, Clone, PartialEq)]
pub struct RevocationSigs {
    pub deposit_outpoint: OutPoint,
    pub derivation_index: ChildNumber,
    pub cancel: BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
    pub emergency: BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
    pub unvault_emergency: BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
}

/// Our watchtowers, which must know about the revocation transactions of a vault before we
/// let it be unvaulted.
pub trait WatchtowerClient: Send + Sync {
    fn replicate(&self, sigs: &RevocationSigs) -> Result<(), CommunicationError>;
}

// Send a `sig` message to the coordinator for all the sigs of this mapping.
//
// `sigs` MUST contain valid signatures
pub fn send_coord_sig_msg(
    transport: &mut KKTransport,
    id: Txid,
    sigs: &BTreeMap<secp256k1::PublicKey, secp256k1::Signature>,
) -> Result<bool, revault_net::Error> {
    for (pubkey, signature) in sigs {
        let sig_msg = coordinator::Sig {
            pubkey: *pubkey,
            signature: *signature,
            txid: id,
        };
        log::debug!("Sending sig '{:?}' to coordinator", sig_msg);
        let sig_result: coordinator::SigResult = transport.send_req(&sig_msg.into())?;
        log::debug!("Got from coordinator: '{:?}'", sig_result);
        if !sig_result.ack {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Get the signatures for this presigned transaction from the Coordinator.
pub fn get_presigs(
    transport: &mut KKTransport,
    txid: Txid,
) -> Result<BTreeMap<secp256k1::PublicKey, secp256k1::Signature>, revault_net::Error> {
    let getsigs_msg = GetSigs { txid };

    log::debug!("Sending to coordinator: '{:?}'", getsigs_msg);
    let resp: Sigs = transport.send_req(&getsigs_msg.into())?;
    log::debug!("Got sigs {:?} from coordinator.", resp);

    Ok(resp.signatures)
}

// Send a `sigs` message to a watchtower, returns whether it acked.
fn send_wt_sigs_msg(
    transport: &mut KKTransport,
    sigs: &RevocationSigs,
) -> Result<bool, revault_net::Error> {
    let sig_msg = watchtower::Sigs {
        signatures: watchtower::Signatures {
            emergency: sigs.emergency.clone(),
            cancel: sigs.cancel.clone(),
            unvault_emergency: sigs.unvault_emergency.clone(),
        },
        deposit_outpoint: sigs.deposit_outpoint,
        derivation_index: sigs.derivation_index,
    };

    log::debug!("Sending signatures to watchtower: '{:?}'", sig_msg);
    let sig_result: watchtower::SigsResult = transport.send_req(&sig_msg.into())?;
    log::debug!(
        "Got response to signatures for '{}' from watchtower: '{:?}'",
        sigs.deposit_outpoint,
        sig_result
    );

    Ok(sig_result.ack)
}

/// The coordinator, reached over a Noise KK channel.
pub struct NoiseCoordinator {
    host: SocketAddr,
    noise_secret: NoisePrivKey,
    noise_key: NoisePubkey,
}

impl NoiseCoordinator {
    pub fn new(host: SocketAddr, noise_secret: NoisePrivKey, noise_key: NoisePubkey) -> Self {
        NoiseCoordinator {
            host,
            noise_secret,
            noise_key,
        }
    }

    pub fn from_custodyd(custodyd: &CustodyD) -> Self {
        Self::new(
            custodyd.coordinator_host,
            custodyd.noise_secret.clone(),
            custodyd.coordinator_noisekey,
        )
    }

    // A new connection per request, retried with backoff.
    fn request<T, F>(&self, what: &str, mut f: F) -> Result<T, CommunicationError>
    where
        F: FnMut(&mut KKTransport) -> Result<T, revault_net::Error>,
    {
        with_backoff(what, REQUEST_ATTEMPTS, BACKOFF_BASE, || {
            let mut transport =
                KKTransport::connect(self.host, &self.noise_secret, &self.noise_key)?;
            f(&mut transport)
        })
        .map_err(|e| {
            CommunicationError::Unreachable(format!("coordinator at '{}': {}", self.host, e))
        })
    }
}

impl CoordinatorClient for NoiseCoordinator {
    fn publish(
        &self,
        target: &SigTarget,
        signer: secp256k1::PublicKey,
        signature: &secp256k1::Signature,
    ) -> Result<(), CommunicationError> {
        let mut sigs = BTreeMap::new();
        sigs.insert(signer, *signature);

        let acked = self.request("Sending signature to coordinator", |transport| {
            send_coord_sig_msg(transport, target.txid, &sigs)
        })?;
        if !acked {
            return Err(CommunicationError::SignatureStorage(target.txid));
        }

        Ok(())
    }

    fn fetch(
        &self,
        target: &SigTarget,
    ) -> Result<BTreeMap<secp256k1::PublicKey, secp256k1::Signature>, CommunicationError> {
        self.request("Fetching signatures from coordinator", |transport| {
            get_presigs(transport, target.txid)
        })
    }
}

/// Our watchtowers, reached over Noise KK channels.
pub struct NoiseWatchtowers {
    watchtowers: Vec<(SocketAddr, NoisePubkey)>,
    noise_secret: NoisePrivKey,
}

impl NoiseWatchtowers {
    pub fn new(watchtowers: Vec<(SocketAddr, NoisePubkey)>, noise_secret: NoisePrivKey) -> Self {
        NoiseWatchtowers {
            watchtowers,
            noise_secret,
        }
    }

    pub fn from_custodyd(custodyd: &CustodyD) -> Self {
        Self::new(custodyd.watchtowers.clone(), custodyd.noise_secret.clone())
    }
}

impl WatchtowerClient for NoiseWatchtowers {
    /// Share the revocation signatures with all our watchtowers. Only succeeds if all of them
    /// acked.
    fn replicate(&self, sigs: &RevocationSigs) -> Result<(), CommunicationError> {
        for (wt_host, wt_noisekey) in self.watchtowers.iter() {
            let acked = with_backoff(
                "Sending signatures to watchtower",
                REQUEST_ATTEMPTS,
                BACKOFF_BASE,
                || {
                    let mut transport =
                        KKTransport::connect(*wt_host, &self.noise_secret, wt_noisekey)?;
                    send_wt_sigs_msg(&mut transport, sigs)
                },
            )
            .map_err(|e| {
                CommunicationError::Unreachable(format!("watchtower at '{}': {}", wt_host, e))
            })?;

            if !acked {
                return Err(CommunicationError::WatchtowerNack(sigs.deposit_outpoint));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub host: String,
    pub reachable: bool,
}

/// Make a dummy connection to the coordinator to check whether it's up
pub fn coordinator_status(custodyd: &CustodyD) -> ServerStatus {
    let reachable = KKTransport::connect(
        custodyd.coordinator_host,
        &custodyd.noise_secret,
        &custodyd.coordinator_noisekey,
    )
    .is_ok();

    ServerStatus {
        host: custodyd.coordinator_host.to_string(),
        reachable,
    }
}

/// Make a dummy connection to the watchtowers to check whether they're up
pub fn watchtowers_status(custodyd: &CustodyD) -> Vec<ServerStatus> {
    custodyd
        .watchtowers
        .iter()
        .map(|(host, key)| ServerStatus {
            host: host.to_string(),
            reachable: KKTransport::connect(*host, &custodyd.noise_secret, key).is_ok(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use revault_net::{
        message, sodiumoxide::crypto::box_::curve25519xsalsa20poly1305::gen_keypair,
        transport::KKTransport,
    };
    use revault_tx::bitcoin::{hashes::hex::FromHex, secp256k1};

    use std::{net::TcpListener, str::FromStr, thread};

    fn dummy_sig() -> (secp256k1::PublicKey, secp256k1::Signature) {
        let ctx = secp256k1::Secp256k1::new();
        let secret_key = secp256k1::SecretKey::from_slice(&[1; 32]).unwrap();
        let signature = secp256k1::Signature::from_str("304402201a3109a4a6445c1e56416bc39520aada5c8ad089e69ee4f1a40a0901de1a435302204b281ba97da2ab2e40eb65943ae414cc4307406c5eb177b1c646606839a2e99d").unwrap();
        (
            secp256k1::PublicKey::from_secret_key(&ctx, &secret_key),
            signature,
        )
    }

    fn dummy_target() -> SigTarget {
        let txid =
            Txid::from_hex("fcb6ab963b654c773de786f4ac92c132b3d2e816ccea37af9592aa0b4aaec04b")
                .unwrap();
        SigTarget {
            deposit_outpoint: OutPoint { txid, vout: 0 },
            kind: TransactionKind::Cancel,
            txid,
        }
    }

    #[test]
    fn publish_signature() {
        let target = dummy_target();
        let (pubkey, signature) = dummy_sig();

        let ((client_pubkey, client_privkey), (server_pubkey, server_privkey)) =
            (gen_keypair(), gen_keypair());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // client thread
        let cli_thread = thread::spawn(move || {
            let coordinator = NoiseCoordinator::new(addr, client_privkey, server_pubkey);
            coordinator.publish(&target, pubkey, &signature).unwrap();
        });

        let mut server_transport =
            KKTransport::accept(&listener, &server_privkey, &[client_pubkey])
                .expect("Server channel binding and accepting");
        server_transport
            .read_req(|params| {
                assert_eq!(
                    &params,
                    &message::RequestParams::CoordSig(coordinator::Sig {
                        pubkey,
                        signature,
                        id: target.txid
                    }),
                );
                Some(message::ResponseResult::Sig(
                    message::coordinator::SigResult { ack: true },
                ))
            })
            .unwrap();
        cli_thread.join().unwrap();
    }

    // This time the coordinator won't ack our signature :(
    #[test]
    fn publish_signature_not_acked() {
        let target = dummy_target();
        let (pubkey, signature) = dummy_sig();

        let ((client_pubkey, client_privkey), (server_pubkey, server_privkey)) =
            (gen_keypair(), gen_keypair());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let cli_thread = thread::spawn(move || {
            let coordinator = NoiseCoordinator::new(addr, client_privkey, server_pubkey);
            match coordinator.publish(&target, pubkey, &signature) {
                Err(CommunicationError::SignatureStorage(txid)) => assert_eq!(txid, target.txid),
                res => panic!("Unexpected result: {:?}", res),
            }
        });

        let mut server_transport =
            KKTransport::accept(&listener, &server_privkey, &[client_pubkey])
                .expect("Server channel binding and accepting");
        server_transport
            .read_req(|_| {
                Some(message::ResponseResult::Sig(
                    message::coordinator::SigResult { ack: false },
                ))
            })
            .unwrap();
        cli_thread.join().unwrap();
    }

    #[test]
    fn fetch_signatures() {
        let target = dummy_target();
        let (pubkey, signature) = dummy_sig();
        let mut sigs = BTreeMap::new();
        sigs.insert(pubkey, signature);
        let other_sigs = sigs.clone();

        let ((client_pubkey, client_privkey), (server_pubkey, server_privkey)) =
            (gen_keypair(), gen_keypair());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let cli_thread = thread::spawn(move || {
            let coordinator = NoiseCoordinator::new(addr, client_privkey, server_pubkey);
            assert_eq!(coordinator.fetch(&target).unwrap(), sigs);
        });

        let mut server_transport =
            KKTransport::accept(&listener, &server_privkey, &[client_pubkey])
                .expect("Server channel binding and accepting");
        server_transport
            .read_req(|params| {
                assert_eq!(
                    &params,
                    &message::RequestParams::GetSigs(GetSigs { id: target.txid })
                );
                Some(message::ResponseResult::Sigs(message::coordinator::Sigs {
                    signatures: other_sigs,
                }))
            })
            .unwrap();
        cli_thread.join().unwrap();
    }

    #[test]
    fn unreachable_coordinator() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let ((_, client_privkey), (server_pubkey, _)) = (gen_keypair(), gen_keypair());

        let coordinator = NoiseCoordinator::new(addr, client_privkey, server_pubkey);
        assert!(matches!(
            coordinator.fetch(&dummy_target()),
            Err(CommunicationError::Unreachable(_))
        ));
    }
}
