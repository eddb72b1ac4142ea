//! Typed access to the artifacts stored in a [`Depot`], converting between
//! the PKI types and the PEM bytes the storage backends hold.
use std::fmt;

use certdepot_pki::{
    CertReq, Certificate, CertificateExt, CertificateList, CertificateRequestExt, PrivateKey,
    RevocationListPem, certificate, keys, request,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use zeroize::Zeroizing;

use crate::{Depot, ErrorKind, Storage, Tag, storage};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to access the depot"))]
    Storage { source: storage::Error },

    #[snafu(display("failed to encode {tag} as PEM"))]
    EncodeCertificate {
        source: certificate::Error,
        tag: Tag,
    },

    #[snafu(display("failed to decode {tag}"))]
    DecodeCertificate {
        source: certificate::Error,
        tag: Tag,
    },

    #[snafu(display("failed to encode {tag} as PEM"))]
    EncodeRequest { source: request::Error, tag: Tag },

    #[snafu(display("failed to decode {tag}"))]
    DecodeRequest { source: request::Error, tag: Tag },

    #[snafu(display("failed to encode {tag} as PEM"))]
    EncodePrivateKey { source: keys::Error, tag: Tag },

    #[snafu(display("failed to decode {tag}"))]
    DecodePrivateKey { source: keys::Error, tag: Tag },

    #[snafu(display("{tag} is not PEM text"))]
    PrivateKeyNotText {
        source: std::string::FromUtf8Error,
        tag: Tag,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage { source } => source.kind(),
            Self::DecodeCertificate { .. }
            | Self::DecodeRequest { .. }
            | Self::DecodePrivateKey { .. }
            | Self::PrivateKeyNotText { .. } => ErrorKind::InvalidArgument,
            Self::EncodeCertificate { .. }
            | Self::EncodeRequest { .. }
            | Self::EncodePrivateKey { .. } => ErrorKind::BackendFailure,
        }
    }
}

/// A passphrase protecting a private key. It is wiped from memory on drop
/// and never shows up in debug output.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl From<String> for Passphrase {
    fn from(passphrase: String) -> Self {
        Self::new(passphrase)
    }
}

impl From<Passphrase> for String {
    fn from(passphrase: Passphrase) -> Self {
        passphrase.0.as_str().to_owned()
    }
}

/// How a private key is protected at rest. Plaintext and encrypted storage
/// are mutually exclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum KeyEncryption {
    #[default]
    None,

    /// Encrypted PKCS#8, keyed by the passphrase.
    Passphrase(Passphrase),
}

impl KeyEncryption {
    /// An absent or empty passphrase selects plaintext storage.
    pub fn from_passphrase(passphrase: Option<&Passphrase>) -> Self {
        match passphrase {
            Some(passphrase) if !passphrase.is_empty() => Self::Passphrase(passphrase.clone()),
            _ => Self::None,
        }
    }

    pub fn encode(&self, key: &PrivateKey) -> keys::Result<Zeroizing<String>> {
        match self {
            Self::None => key.to_pem(),
            Self::Passphrase(passphrase) => key.to_encrypted_pem(passphrase.as_bytes()),
        }
    }

    pub fn decode(&self, pem: &str) -> keys::Result<PrivateKey> {
        match self {
            Self::None => PrivateKey::from_pem(pem),
            Self::Passphrase(passphrase) => PrivateKey::from_encrypted_pem(pem, passphrase.as_bytes()),
        }
    }
}

impl Depot {
    pub fn put_certificate(&self, name: &str, certificate: &Certificate) -> Result<()> {
        let tag = Tag::certificate(name);
        let pem = certificate
            .to_pem_string()
            .context(EncodeCertificateSnafu { tag: tag.clone() })?;
        self.put(&tag, pem.as_bytes()).context(StorageSnafu)
    }

    pub fn get_certificate(&self, name: &str) -> Result<Certificate> {
        let tag = Tag::certificate(name);
        let pem = self.get(&tag).context(StorageSnafu)?;
        Certificate::from_pem_bytes(&pem).context(DecodeCertificateSnafu { tag })
    }

    pub fn put_certificate_request(&self, name: &str, request: &CertReq) -> Result<()> {
        let tag = Tag::certificate_request(name);
        let pem = request
            .to_pem_string()
            .context(EncodeRequestSnafu { tag: tag.clone() })?;
        self.put(&tag, pem.as_bytes()).context(StorageSnafu)
    }

    pub fn get_certificate_request(&self, name: &str) -> Result<CertReq> {
        let tag = Tag::certificate_request(name);
        let pem = self.get(&tag).context(StorageSnafu)?;
        CertReq::from_pem_bytes(&pem).context(DecodeRequestSnafu { tag })
    }

    pub fn put_revocation_list(&self, name: &str, list: &CertificateList) -> Result<()> {
        let tag = Tag::revocation_list(name);
        let pem = list
            .to_pem_string()
            .context(EncodeCertificateSnafu { tag: tag.clone() })?;
        self.put(&tag, pem.as_bytes()).context(StorageSnafu)
    }

    pub fn get_revocation_list(&self, name: &str) -> Result<CertificateList> {
        let tag = Tag::revocation_list(name);
        let pem = self.get(&tag).context(StorageSnafu)?;
        CertificateList::from_pem_bytes(&pem).context(DecodeCertificateSnafu { tag })
    }

    /// Stores `key` as plaintext or encrypted PKCS#8, depending on
    /// `encryption`.
    #[instrument(skip(self, key, encryption))]
    pub fn put_private_key(
        &self,
        name: &str,
        key: &PrivateKey,
        encryption: &KeyEncryption,
    ) -> Result<()> {
        let tag = Tag::private_key(name);
        let pem = encryption
            .encode(key)
            .context(EncodePrivateKeySnafu { tag: tag.clone() })?;
        self.put(&tag, pem.as_bytes()).context(StorageSnafu)
    }

    #[instrument(skip(self, encryption))]
    pub fn get_private_key(&self, name: &str, encryption: &KeyEncryption) -> Result<PrivateKey> {
        let tag = Tag::private_key(name);
        let pem = self.get(&tag).context(StorageSnafu)?;
        let pem = Zeroizing::new(
            String::from_utf8(pem).context(PrivateKeyNotTextSnafu { tag: tag.clone() })?,
        );
        encryption
            .decode(&pem)
            .context(DecodePrivateKeySnafu { tag })
    }
}
