use crate::{participants::Role, transactions::TransactionKind};

use revault_tx::bitcoin::{secp256k1, SigHashType};

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SignatureError {
    /// The signature does not verify against the transaction digest
    Invalid {
        signer: secp256k1::PublicKey,
        kind: TransactionKind,
    },
    /// The signer is not part of the roles this transaction requires signatures from
    RoleMismatch {
        signer: secp256k1::PublicKey,
        kind: TransactionKind,
        role: Option<Role>,
    },
    /// Could not parse the signature
    Malformed(String),
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Invalid { signer, kind } => write!(
                f,
                "Invalid signature by '{}' for {} transaction",
                signer, kind
            ),
            Self::RoleMismatch { signer, kind, role } => match role {
                Some(role) => write!(
                    f,
                    "'{}' is a {}, which may not sign the {} transaction",
                    signer, role, kind
                ),
                None => write!(
                    f,
                    "'{}' is not a participant and may not sign the {} transaction",
                    signer, kind
                ),
            },
            Self::Malformed(e) => write!(f, "Malformed signature: {}", e),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Check a signature against a transaction digest and the claimed signer's key.
pub fn validate<C: secp256k1::Verification>(
    secp: &secp256k1::Secp256k1<C>,
    digest: &secp256k1::Message,
    pubkey: &secp256k1::PublicKey,
    signature: &secp256k1::Signature,
) -> bool {
    secp.verify(digest, signature, pubkey).is_ok()
}

/// Parse a DER-encoded signature, optionally followed by its sighash type byte which must then
/// be the one this kind of transaction is signed with.
pub fn parse_signature(
    kind: TransactionKind,
    raw: &[u8],
) -> Result<secp256k1::Signature, SignatureError> {
    if let Ok(sig) = secp256k1::Signature::from_der(raw) {
        return Ok(sig);
    }

    let (sighash_byte, der) = raw
        .split_last()
        .ok_or_else(|| SignatureError::Malformed("empty signature".to_string()))?;
    let sighash_type = SigHashType::from_u32_consensus(*sighash_byte as u32);
    if sighash_type != kind.sighash_type() {
        return Err(SignatureError::Malformed(format!(
            "unexpected sighash type '{:?}' for {} transaction",
            sighash_type, kind
        )));
    }

    secp256k1::Signature::from_der(der).map_err(|e| SignatureError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use revault_tx::bitcoin::secp256k1;

    #[test]
    fn validation() {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[3; 32]).unwrap();
        let pk = secp256k1::PublicKey::from_secret_key(&secp, &sk);
        let other_pk = secp256k1::PublicKey::from_secret_key(
            &secp,
            &secp256k1::SecretKey::from_slice(&[4; 32]).unwrap(),
        );
        let digest = secp256k1::Message::from_slice(&[12; 32]).unwrap();
        let other_digest = secp256k1::Message::from_slice(&[13; 32]).unwrap();
        let sig = secp.sign(&digest, &sk);

        assert!(validate(&secp, &digest, &pk, &sig));
        assert!(!validate(&secp, &other_digest, &pk, &sig));
        assert!(!validate(&secp, &digest, &other_pk, &sig));

        // A verification-only context is enough
        let vsecp = secp256k1::Secp256k1::verification_only();
        assert!(validate(&vsecp, &digest, &pk, &sig));
    }

    #[test]
    fn signature_parsing() {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[3; 32]).unwrap();
        let digest = secp256k1::Message::from_slice(&[12; 32]).unwrap();
        let sig = secp.sign(&digest, &sk);

        let der = sig.serialize_der().to_vec();
        assert_eq!(parse_signature(TransactionKind::Cancel, &der), Ok(sig));

        let mut with_acp = der.clone();
        with_acp.push(0x81);
        assert_eq!(parse_signature(TransactionKind::Cancel, &with_acp), Ok(sig));
        assert!(matches!(
            parse_signature(TransactionKind::Unvault, &with_acp),
            Err(SignatureError::Malformed(_))
        ));

        let mut with_all = der;
        with_all.push(0x01);
        assert_eq!(parse_signature(TransactionKind::Spend, &with_all), Ok(sig));

        assert!(parse_signature(TransactionKind::Spend, &[]).is_err());
        assert!(parse_signature(TransactionKind::Spend, &[0x30, 0x01, 0x01]).is_err());
    }
}
