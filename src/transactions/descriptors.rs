//! The Miniscript descriptors of the vaults' outputs, compiled once out of the participants'
//! keys.

use crate::participants::{ParticipantKey, ParticipantTable, Role};

use revault_tx::{
    bitcoin::util::bip32::DerivationPath,
    error::ScriptCreationError,
    miniscript::descriptor::{DescriptorPublicKey, DescriptorSinglePub, DescriptorXKey, Wildcard},
    scripts::{CpfpDescriptor, DepositDescriptor, UnvaultDescriptor},
};

/// The deposit, Unvault and CPFP descriptors of a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultDescriptors {
    pub deposit: DepositDescriptor,
    pub unvault: UnvaultDescriptor,
    pub cpfp: CpfpDescriptor,
}

// The extended keys are derived at the vault index, the cosigners' keys are static.
fn descriptor_key(key: &ParticipantKey) -> Option<DescriptorPublicKey> {
    match key {
        ParticipantKey::Extended(xpub) => Some(DescriptorPublicKey::XPub(DescriptorXKey {
            origin: None,
            xkey: *xpub,
            derivation_path: DerivationPath::from(vec![]),
            wildcard: Wildcard::Unhardened,
        })),
        ParticipantKey::Static(key) => Some(DescriptorPublicKey::SinglePub(DescriptorSinglePub {
            origin: None,
            key: *key,
        })),
        ParticipantKey::None => None,
    }
}

// The compiled Scripts follow the order of the keys. Sort them by their encoding so that the
// order of the configuration does not matter.
fn sorted_keys(participants: &ParticipantTable, role: Role) -> Vec<DescriptorPublicKey> {
    let mut keys: Vec<DescriptorPublicKey> = participants
        .participants(role)
        .filter_map(|p| descriptor_key(&p.key))
        .collect();
    keys.sort_by_key(|k| k.to_string());
    keys
}

impl VaultDescriptors {
    /// Compile the descriptors. The Unvault may be spent by all the managers (along with all
    /// the cosigners, if any) after `csv` blocks.
    pub fn new(
        participants: &ParticipantTable,
        csv: u32,
    ) -> Result<VaultDescriptors, ScriptCreationError> {
        let stakeholders = sorted_keys(participants, Role::Stakeholder);
        let managers = sorted_keys(participants, Role::Manager);
        let cosigners = sorted_keys(participants, Role::Cosigner);
        let managers_threshold = managers.len();

        Ok(VaultDescriptors {
            deposit: DepositDescriptor::new(stakeholders.clone())?,
            unvault: UnvaultDescriptor::new(
                stakeholders,
                managers.clone(),
                managers_threshold,
                cosigners,
                csv,
            )?,
            cpfp: CpfpDescriptor::new(managers)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{dummy_config, test_datadir, TestKeys};

    use revault_tx::bitcoin::{secp256k1, util::bip32::ChildNumber};

    fn descriptors(keys: &TestKeys, csv: u32) -> Result<VaultDescriptors, ScriptCreationError> {
        let config = dummy_config(keys, csv, test_datadir());
        VaultDescriptors::new(&ParticipantTable::from_config(&config), csv)
    }

    #[test]
    fn descriptors_out_of_the_participants() {
        let secp = secp256k1::Secp256k1::verification_only();
        let keys = TestKeys::new(3, 2, 3);
        let descs = descriptors(&keys, 42).unwrap();

        assert_eq!(descs.unvault.csv_value(), 42);
        // 3 stakeholders, 2 managers and 3 cosigners
        assert_eq!(descs.deposit.xpubs().len(), 3);
        assert_eq!(descs.unvault.xpubs().len(), 8);
        assert_eq!(descs.cpfp.xpubs().len(), 2);

        // Derived at the vault index, just like the participants' keys
        let index = ChildNumber::from(7);
        let config = dummy_config(&keys, 42, test_datadir());
        let vault_keys = ParticipantTable::from_config(&config)
            .keys_at(&secp, index)
            .unwrap();
        let mut derived: Vec<secp256k1::PublicKey> = descs
            .deposit
            .derive(index, &secp)
            .keys()
            .into_iter()
            .map(|k| k.key.key)
            .collect();
        derived.sort_by_key(|k| k.serialize());
        assert_eq!(derived, vault_keys.stakeholders);

        // Without cosigners
        let descs = descriptors(&TestKeys::new(3, 2, 0), 42).unwrap();
        assert_eq!(descs.unvault.xpubs().len(), 5);
    }

    #[test]
    fn keys_order_does_not_matter() {
        let keys = TestKeys::new(4, 2, 4);
        let mut config = dummy_config(&keys, 18, test_datadir());
        let descs = VaultDescriptors::new(&ParticipantTable::from_config(&config), 18).unwrap();

        config.stakeholders_xpubs.reverse();
        config.managers_xpubs.swap(0, 1);
        config.cosigners_keys.reverse();
        let other = VaultDescriptors::new(&ParticipantTable::from_config(&config), 18).unwrap();
        assert_eq!(descs, other);
        assert_eq!(descs.unvault.to_string(), other.unvault.to_string());
    }

    #[test]
    fn invalid_deployments() {
        // A single stakeholder, no managers, or cosigners that aren't one per stakeholder
        for (n_stk, n_man, n_cosig) in [(1, 2, 0), (3, 0, 0), (3, 2, 2), (3, 2, 4)].iter() {
            assert_eq!(
                descriptors(&TestKeys::new(*n_stk, *n_man, *n_cosig), 18).unwrap_err(),
                ScriptCreationError::BadParameters,
                "{} stakeholders, {} managers, {} cosigners",
                n_stk,
                n_man,
                n_cosig
            );
        }

        // The timelock must be a number of blocks
        assert_eq!(
            descriptors(&TestKeys::new(2, 1, 0), 1 << 22).unwrap_err(),
            ScriptCreationError::BadParameters
        );
    }
}
