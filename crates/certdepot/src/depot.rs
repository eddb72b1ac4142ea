//! The backend agnostic façade over a [`Storage`] backend.
use std::{sync::Arc, time::SystemTime};

use certdepot_pki::{Certificate, CertificateExt, certificate};
use certdepot_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    CertificateOptions, Credentials, ErrorKind, ExpirationManager, Storage, Tag, credentials,
    options, storage,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no default CA is configured for the depot"))]
    MissingCa,

    #[snafu(display("failed to remove the existing {tag}"))]
    RemoveExisting { source: storage::Error, tag: Tag },

    #[snafu(display("failed to save the {tag}"))]
    SaveArtifact { source: storage::Error, tag: Tag },

    #[snafu(display("failed to read the saved certificate of {name:?}"))]
    ReadSavedCertificate {
        source: certificate::Error,
        name: String,
    },

    #[snafu(display("failed to record the TTL of {name:?}"))]
    RecordTtl {
        source: storage::Error,
        name: String,
    },

    #[snafu(display("failed to find the {tag}"))]
    FindArtifact { source: storage::Error, tag: Tag },

    #[snafu(display("failed to generate a certificate for {name:?}"))]
    Generate {
        source: options::Error,
        name: String,
    },

    #[snafu(display("failed to assemble the credentials of {name:?}"))]
    AssembleCredentials {
        source: credentials::Error,
        name: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCa => ErrorKind::InvalidArgument,
            Self::RemoveExisting { source, .. }
            | Self::SaveArtifact { source, .. }
            | Self::RecordTtl { source, .. }
            | Self::FindArtifact { source, .. } => source.kind(),
            Self::ReadSavedCertificate { .. } => ErrorKind::InvalidArgument,
            Self::Generate { source, .. } => source.kind(),
            Self::AssembleCredentials { source, .. } => source.kind(),
        }
    }
}

/// Settings of the façade itself, used by [`Depot::find`] and
/// [`Depot::generate`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DepotOptions {
    /// Name of the CA which signs generated certificates and is bundled into
    /// found credentials.
    pub ca: Option<String>,

    /// Validity of generated certificates.
    pub default_expiration: Duration,
}

impl Default for DepotOptions {
    fn default() -> Self {
        Self {
            ca: None,
            default_expiration: Duration::from_days_unchecked(365),
        }
    }
}

/// The lifecycle state of a named entity, derived from the artifacts stored
/// for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CertificateState {
    /// Neither a certificate nor a certificate signing request exist.
    Unissued,

    /// A certificate signing request exists, but no certificate.
    Requested,

    Signed,
}

/// Wraps a storage backend and adds the operations on whole credential
/// bundles.
///
/// Backends which track TTLs are wired with [`Depot::with_expiration`], which
/// makes [`Depot::expiration`] return the capability. Every operation which
/// issues a certificate records its TTL through it.
#[derive(Clone, Debug)]
pub struct Depot {
    storage: Arc<dyn Storage>,
    expiration: Option<Arc<dyn ExpirationManager>>,
    options: DepotOptions,
}

impl Depot {
    /// Wraps a backend without TTL tracking.
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self {
            storage: Arc::new(storage),
            expiration: None,
            options: DepotOptions::default(),
        }
    }

    /// Wraps a backend which tracks TTLs.
    pub fn with_expiration(backend: impl ExpirationManager + 'static) -> Self {
        let backend = Arc::new(backend);
        Self {
            storage: backend.clone(),
            expiration: Some(backend),
            options: DepotOptions::default(),
        }
    }

    pub fn with_options(self, options: DepotOptions) -> Self {
        Self { options, ..self }
    }

    pub fn options(&self) -> &DepotOptions {
        &self.options
    }

    /// The TTL capability of the wrapped backend, if it has one.
    pub fn expiration(&self) -> Option<&dyn ExpirationManager> {
        self.expiration.as_deref()
    }

    /// Records `expiration` as the TTL of `name`, if the backend tracks TTLs.
    pub(crate) fn record_ttl(&self, name: &str, expiration: SystemTime) -> storage::Result<()> {
        match self.expiration() {
            Some(manager) => manager.put_ttl(name, expiration),
            None => Ok(()),
        }
    }

    pub fn certificate_state(&self, name: &str) -> CertificateState {
        if self.check(&Tag::certificate(name)) {
            CertificateState::Signed
        } else if self.check(&Tag::certificate_request(name)) {
            CertificateState::Requested
        } else {
            CertificateState::Unissued
        }
    }

    /// Stores `credentials` under `name`, replacing any certificate signing
    /// request, private key and certificate stored for it before.
    ///
    /// The key is written before the certificate, so readers never observe a
    /// certificate without its key.
    #[instrument(skip(self, credentials))]
    pub fn save(&self, name: &str, credentials: &Credentials) -> Result<()> {
        for tag in [
            Tag::certificate_request(name),
            Tag::private_key(name),
            Tag::certificate(name),
        ] {
            match self.delete(&tag) {
                Err(error) if error.kind() != ErrorKind::NotFound => {
                    return Err(error).context(RemoveExistingSnafu { tag });
                }
                _ => {}
            }
        }

        for (tag, data) in [
            (Tag::private_key(name), credentials.key()),
            (Tag::certificate(name), credentials.cert()),
        ] {
            self.put(&tag, data)
                .with_context(|_| SaveArtifactSnafu { tag: tag.clone() })?;
        }

        if let Some(manager) = self.expiration() {
            let certificate = Certificate::from_pem_bytes(credentials.cert())
                .context(ReadSavedCertificateSnafu { name })?;
            manager
                .put_ttl(name, certificate.not_after())
                .context(RecordTtlSnafu { name })?;
        }

        debug!("saved credentials");
        Ok(())
    }

    /// Assembles the credentials of `name` from its certificate and key and
    /// the certificate of the configured CA.
    #[instrument(skip(self))]
    pub fn find(&self, name: &str) -> Result<Credentials> {
        let ca = self.options.ca.as_deref().context(MissingCaSnafu)?;

        let [ca_cert, cert, key] = [
            Tag::certificate(ca),
            Tag::certificate(name),
            Tag::private_key(name),
        ]
        .map(|tag| {
            self.get(&tag)
                .with_context(|_| FindArtifactSnafu { tag: tag.clone() })
        });

        Credentials::new(name, ca_cert?, cert?, key?).context(AssembleCredentialsSnafu { name })
    }

    /// Issues fresh credentials for `name`, signed by the configured CA. The
    /// key and certificate signing request only exist in memory, nothing is
    /// written to the depot.
    #[instrument(skip(self))]
    pub fn generate(&self, name: &str) -> Result<Credentials> {
        let ca = self.options.ca.as_deref().context(MissingCaSnafu)?;

        let options = CertificateOptions {
            common_name: name.to_owned(),
            host: name.to_owned(),
            ca: ca.to_owned(),
            expires: self.options.default_expiration,
            ..Default::default()
        };
        let (ca_cert, cert, key) = options
            .issue_in_memory(self)
            .context(GenerateSnafu { name })?;

        Credentials::new(name, ca_cert, cert, key).context(AssembleCredentialsSnafu { name })
    }
}

impl Storage for Depot {
    fn put(&self, tag: &Tag, data: &[u8]) -> storage::Result<()> {
        self.storage.put(tag, data)
    }

    fn get(&self, tag: &Tag) -> storage::Result<Vec<u8>> {
        self.storage.get(tag)
    }

    fn check(&self, tag: &Tag) -> bool {
        self.storage.check(tag)
    }

    fn delete(&self, tag: &Tag) -> storage::Result<()> {
        self.storage.delete(tag)
    }
}
