//! Abstraction layer around the [`rsa`] crate. [`PrivateKey`] creates RSA
//! keys, signs certificates with them and converts them from and to PEM.
//!
//! Keys are exported as PKCS#8. Imports accept PKCS#8 as well as the older
//! PKCS#1 (`BEGIN RSA PRIVATE KEY`) encoding. Passphrase protected keys use
//! PBES2 (PBKDF2-SHA256 with AES-256-CBC).
//!
//! It should be noted, that the [`rsa`] crate is currently vulnerable to the
//! Marvin attack. See:
//!
//! - <https://people.redhat.com/~hkario/marvin/>
//! - <https://rustsec.org/advisories/RUSTSEC-2023-0071.html>
use std::fmt::Debug;

use pkcs8::{
    EncryptedPrivateKeyInfo, PrivateKeyInfo,
    der::pem::PemLabel,
    pkcs5::pbes2,
};
use rand_core::OsRng;
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs1v15,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    traits::PublicKeyParts,
};
use sha2::Sha256;
use signature::Keypair;
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use x509_cert::{der::Decode, spki::SubjectPublicKeyInfoOwned};
use zeroize::Zeroizing;

use crate::PEM_LINE_ENDING;

/// The RSA modulus size used when no explicit size is requested.
pub const DEFAULT_KEY_BITS: usize = 2048;

const PBKDF2_ROUNDS: u32 = 100_000;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create RSA key with {bits} bits"))]
    CreateKey { source: rsa::Error, bits: usize },

    #[snafu(display("failed to deserialize private key from PEM, neither PKCS#8 nor PKCS#1"))]
    DeserializePrivateKey { source: rsa::pkcs1::Error },

    #[snafu(display("failed to decrypt private key, wrong passphrase or malformed PEM"))]
    DecryptPrivateKey { source: rsa::pkcs8::Error },

    #[snafu(display("failed to serialize private key as PKCS#8"))]
    SerializePrivateKey { source: rsa::pkcs8::Error },

    #[snafu(display("failed to decode private key info"))]
    DecodePrivateKeyInfo { source: pkcs8::Error },

    #[snafu(display("failed to encrypt private key"))]
    EncryptPrivateKey { source: pkcs8::Error },

    #[snafu(display("failed to prepare private key encryption parameters"))]
    EncryptionParameters { source: pkcs8::Error },

    #[snafu(display("failed to encode encrypted private key as PEM"))]
    EncodeEncryptedPem { source: pkcs8::der::Error },

    #[snafu(display("failed to serialize public key"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode subject public key info"))]
    DecodeSpki { source: x509_cert::der::Error },
}

/// An RSA private key together with the PKCS#1 v1.5 / SHA-256 signing key
/// derived from it.
pub struct PrivateKey {
    private_key: RsaPrivateKey,
    signing_key: pkcs1v15::SigningKey<Sha256>,
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}

impl From<RsaPrivateKey> for PrivateKey {
    fn from(private_key: RsaPrivateKey) -> Self {
        let signing_key = pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());
        Self {
            private_key,
            signing_key,
        }
    }
}

impl PrivateKey {
    /// Generates a new RSA key with the default random-number generator
    /// [`OsRng`].
    ///
    /// It should be noted that the generation of the key takes longer for
    /// larger key sizes. The generation of an RSA key with a key size of
    /// `4096` can take up to multiple seconds.
    #[instrument(name = "create_rsa_private_key")]
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits).context(CreateKeySnafu { bits })?;
        Ok(Self::from(private_key))
    }

    /// Reads an unencrypted private key from PEM. PKCS#8 is tried first,
    /// then PKCS#1.
    #[instrument(name = "read_rsa_private_key_pem", skip_all)]
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private_key = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(private_key) => private_key,
            Err(_) => RsaPrivateKey::from_pkcs1_pem(pem).context(DeserializePrivateKeySnafu)?,
        };

        Ok(Self::from(private_key))
    }

    /// Reads a passphrase protected PKCS#8 private key from PEM.
    #[instrument(name = "read_encrypted_rsa_private_key_pem", skip_all)]
    pub fn from_encrypted_pem(pem: &str, passphrase: &[u8]) -> Result<Self> {
        let private_key =
            RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase).context(DecryptPrivateKeySnafu)?;
        Ok(Self::from(private_key))
    }

    /// Exports the key as unencrypted PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        self.private_key
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(SerializePrivateKeySnafu)
    }

    /// Exports the key as passphrase protected PKCS#8 PEM.
    #[instrument(name = "encrypt_rsa_private_key", skip_all)]
    pub fn to_encrypted_pem(&self, passphrase: &[u8]) -> Result<Zeroizing<String>> {
        let document = self
            .private_key
            .to_pkcs8_der()
            .context(SerializePrivateKeySnafu)?;
        let info =
            PrivateKeyInfo::try_from(document.as_bytes()).context(DecodePrivateKeyInfoSnafu)?;

        let salt = rand::random::<[u8; 16]>();
        let iv = rand::random::<[u8; 16]>();
        // pkcs5 errors only implement std::error::Error through pkcs8
        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ROUNDS, &salt, &iv)
            .map_err(pkcs8::Error::from)
            .context(EncryptionParametersSnafu)?;

        info.encrypt_with_params(params, passphrase)
            .context(EncryptPrivateKeySnafu)?
            .to_pem(EncryptedPrivateKeyInfo::PEM_LABEL, PEM_LINE_ENDING)
            .context(EncodeEncryptedPemSnafu)
    }

    /// Returns the signing key used to sign certificates, requests and
    /// revocation lists.
    pub fn signing_key(&self) -> &pkcs1v15::SigningKey<Sha256> {
        &self.signing_key
    }

    /// Returns the verifying (public) half of the key.
    pub fn verifying_key(&self) -> pkcs1v15::VerifyingKey<Sha256> {
        self.signing_key.verifying_key()
    }

    /// Returns the public key as subject public key info, as embedded into
    /// certificates and requests.
    pub fn subject_public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned> {
        let document = self
            .verifying_key()
            .to_public_key_der()
            .context(SerializePublicKeySnafu)?;

        SubjectPublicKeyInfoOwned::from_der(document.as_bytes()).context(DecodeSpkiSnafu)
    }

    /// The RSA modulus size in bits.
    pub fn bits(&self) -> usize {
        self.private_key.size() * 8
    }
}

/// Two keys are equal if their private halves are equal.
impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.private_key == other.private_key
    }
}
