//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! The initiator combines its identity key and a fresh ephemeral key with the
//! responder's published identity, signed prekey and (optionally) one-time
//! prekey. The responder repeats the same four agreements from the other
//! side once the first prekey message arrives. Both end up with the same
//! root key, which seeds the Double Ratchet.

use crate::crypto::{kdf, Bundle, BundlePreKey, KeyPair, CONSUMED_PREKEY_ID};
use crate::session::PreKeyHeader;
use crate::utils::Result;
use log::debug;
use rand_core::{CryptoRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keys agreed by an X3DH handshake
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Agreement {
    /// Initial root key of the ratchet
    pub root_key: [u8; 32],
    /// Handshake chain key; not used by the ratchet
    pub chain_key: [u8; 32],
}

impl fmt::Debug for Agreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Agreement([REDACTED])")
    }
}

/// X3DH key agreement initiator
pub struct X3DHInitiator<'a> {
    /// Initiator's identity key pair
    identity: &'a KeyPair,
    /// Initiator's ephemeral key pair
    ephemeral: KeyPair,
}

impl<'a> X3DHInitiator<'a> {
    /// Create a new X3DH initiator with a fresh ephemeral key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails
    pub fn new<R: RngCore + CryptoRng>(identity: &'a KeyPair, rng: &mut R) -> Result<Self> {
        Ok(Self {
            identity,
            ephemeral: KeyPair::generate(rng)?,
        })
    }

    /// Perform the key agreement against a peer bundle
    ///
    /// # Arguments
    ///
    /// * `bundle` - The responder's prekey bundle
    /// * `one_time_prekey` - The one-time prekey to attach, if any
    ///
    /// # Returns
    ///
    /// The header the responder needs and the agreed keys
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::BadSignature` for a forged bundle or a protocol
    /// violation for a non-contributory key
    pub fn initiate(
        &self,
        bundle: &Bundle,
        one_time_prekey: Option<BundlePreKey>,
    ) -> Result<(PreKeyHeader, Agreement)> {
        bundle.verify()?;
        self.agree(bundle, one_time_prekey)
    }

    /// [`X3DHInitiator::initiate`] for a bundle the caller already verified
    pub(crate) fn agree(
        &self,
        bundle: &Bundle,
        one_time_prekey: Option<BundlePreKey>,
    ) -> Result<(PreKeyHeader, Agreement)> {
        // DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B), DH3 = DH(EK_A, SPK_B)
        let mut dh_outputs = vec![
            self.identity.diffie_hellman(&bundle.signed_prekey)?,
            self.ephemeral.diffie_hellman(&bundle.identity_key)?,
            self.ephemeral.diffie_hellman(&bundle.signed_prekey)?,
        ];

        // DH4 = DH(EK_A, OPK_B)
        if let Some(prekey) = &one_time_prekey {
            dh_outputs.push(self.ephemeral.diffie_hellman(&prekey.key)?);
        }

        let agreement = derive(dh_outputs)?;
        let header = PreKeyHeader {
            identity_key: *self.identity.public(),
            base_key: *self.ephemeral.public(),
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: one_time_prekey.map_or(CONSUMED_PREKEY_ID, |p| p.id),
        };

        debug!(
            "X3DH initiated against signed prekey {} with one-time prekey {}",
            header.signed_prekey_id, header.one_time_prekey_id
        );
        Ok((header, agreement))
    }
}

/// X3DH key agreement responder
pub struct X3DHRecipient<'a> {
    /// Responder's identity key pair
    identity: &'a KeyPair,
    /// Key pair of the signed prekey named in the header
    signed_prekey: &'a KeyPair,
    /// Key pair of the one-time prekey named in the header, if any
    one_time_prekey: Option<&'a KeyPair>,
}

impl<'a> X3DHRecipient<'a> {
    /// Create a new X3DH responder
    pub fn new(
        identity: &'a KeyPair,
        signed_prekey: &'a KeyPair,
        one_time_prekey: Option<&'a KeyPair>,
    ) -> Self {
        Self {
            identity,
            signed_prekey,
            one_time_prekey,
        }
    }

    /// Derive the agreed keys from an initiator's prekey header
    ///
    /// # Errors
    ///
    /// Returns a protocol violation for a non-contributory key
    pub fn receive(&self, header: &PreKeyHeader) -> Result<Agreement> {
        // DH1 = DH(SPK_B, IK_A), DH2 = DH(IK_B, EK_A), DH3 = DH(SPK_B, EK_A)
        let mut dh_outputs = vec![
            self.signed_prekey.diffie_hellman(&header.identity_key)?,
            self.identity.diffie_hellman(&header.base_key)?,
            self.signed_prekey.diffie_hellman(&header.base_key)?,
        ];

        // DH4 = DH(OPK_B, EK_A)
        if let Some(prekey) = self.one_time_prekey {
            dh_outputs.push(prekey.diffie_hellman(&header.base_key)?);
        }

        derive(dh_outputs)
    }
}

fn derive(mut dh_outputs: Vec<[u8; 32]>) -> Result<Agreement> {
    let result = kdf::derive_x3dh(&dh_outputs);
    dh_outputs.zeroize();
    let (root_key, chain_key) = result?;
    Ok(Agreement {
        root_key,
        chain_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Store;
    use crate::utils::StoreConfig;
    use rand::rngs::OsRng;

    fn store() -> Store {
        Store::setup(&StoreConfig { prekey_count: 3 }).unwrap()
    }

    fn respond(store: &Store, header: &PreKeyHeader) -> Agreement {
        let signed = store.signed_prekey(header.signed_prekey_id).unwrap();
        let one_time = store.prekey(header.one_time_prekey_id).map(|p| &p.keypair);
        X3DHRecipient::new(store.identity(), &signed.keypair, one_time)
            .receive(header)
            .unwrap()
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice = store();
        let bob = store();
        let bundle = alice.bundle();
        let prekey = bundle.one_time_prekeys[1];

        let initiator = X3DHInitiator::new(bob.identity(), &mut OsRng).unwrap();
        let (header, bob_agreement) = initiator.initiate(&bundle, Some(prekey)).unwrap();

        assert_eq!(header.one_time_prekey_id, prekey.id);
        assert_eq!(&header.identity_key, bob.identity_key());

        let alice_agreement = respond(&alice, &header);
        assert_eq!(alice_agreement, bob_agreement);
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let alice = store();
        let bob = store();

        let initiator = X3DHInitiator::new(bob.identity(), &mut OsRng).unwrap();
        let (header, bob_agreement) = initiator.initiate(&alice.bundle(), None).unwrap();

        assert_eq!(header.one_time_prekey_id, CONSUMED_PREKEY_ID);
        assert_eq!(respond(&alice, &header), bob_agreement);
    }

    #[test]
    fn test_x3dh_prekey_mismatch_diverges() {
        let alice = store();
        let bob = store();
        let bundle = alice.bundle();

        let initiator = X3DHInitiator::new(bob.identity(), &mut OsRng).unwrap();
        let (mut header, bob_agreement) = initiator
            .initiate(&bundle, Some(bundle.one_time_prekeys[0]))
            .unwrap();
        header.one_time_prekey_id = bundle.one_time_prekeys[2].id;

        assert_ne!(respond(&alice, &header), bob_agreement);
    }

    #[test]
    fn test_x3dh_invalid_bundle() {
        let alice = store();
        let bob = store();
        let mallory = store();

        let mut bundle = alice.bundle();
        bundle.signed_prekey_signature = mallory.bundle().signed_prekey_signature;

        let initiator = X3DHInitiator::new(bob.identity(), &mut OsRng).unwrap();
        let err = initiator.initiate(&bundle, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadSignature);
    }
}
