use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, PublicKey};
use std::str::FromStr;

use crate::error::PaymentError;

/// Deterministic address derivation from an account-level extended public key.
///
/// Pure and I/O-free: the same (key, index) pair always yields the same
/// address, so candidates can be derived speculatively before anything is
/// persisted.
#[derive(Clone, Debug)]
pub struct AddressDeriver {
    network: Network,
}

impl AddressDeriver {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    /// Derive the P2WPKH address at the external chain position `0/index`
    pub fn derive(
        &self,
        master_public_key: &str,
        index: u32,
    ) -> Result<Address, PaymentError> {
        let xpub = Xpub::from_str(master_public_key.trim())
            .map_err(|e| PaymentError::InvalidKey(e.to_string()))?;
        let secp = Secp256k1::new();

        let external_chain = ChildNumber::from_normal_idx(0)
            .map_err(|e| PaymentError::InvalidKey(e.to_string()))?;
        let child_number = ChildNumber::from_normal_idx(index)
            .map_err(|e| PaymentError::InvalidKey(e.to_string()))?;

        let derived_key = xpub
            .derive_pub(&secp, &[external_chain, child_number])
            .map_err(|e| PaymentError::InvalidKey(e.to_string()))?;

        let pubkey = PublicKey::new(derived_key.public_key);
        let compressed = CompressedPublicKey::try_from(pubkey)
            .map_err(|e| PaymentError::InvalidKey(e.to_string()))?;

        Ok(Address::p2wpkh(&compressed, self.network))
    }
}
