//! The storage contract every backend implements, and the backends shipped
//! with this crate.
//!
//! | backend                 | `put` on occupied tag | `delete` of absent tag | TTL tracking |
//! |-------------------------|-----------------------|------------------------|--------------|
//! | [`FileStorage`]         | `AlreadyExists`       | `NotFound`             | no           |
//! | [`DocumentStorage`]     | overwrites            | succeeds               | yes          |
//! | [`RelationalStorage`]   | `AlreadyExists`       | `NotFound`             | yes          |
use std::{
    fmt::Debug,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use certdepot_pki::{Certificate, CertificateExt, certificate};
use snafu::{ResultExt, Snafu};

use crate::{ArtifactKind, ErrorKind, Tag};

#[cfg(feature = "document")]
mod document;
mod file;
#[cfg(feature = "relational")]
mod relational;


#[cfg(feature = "document")]
pub use document::DocumentStorage;
pub use file::FileStorage;
#[cfg(feature = "relational")]
pub use relational::RelationalStorage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("refusing to store empty data as {tag}"))]
    EmptyData { tag: Tag },

    #[snafu(display("{tag} is not valid UTF-8 and cannot be stored as text"))]
    NotText { tag: Tag },

    #[snafu(display("{tag} already exists"))]
    AlreadyExists { tag: Tag },

    #[snafu(display("{tag} does not exist"))]
    NotFound { tag: Tag },

    #[snafu(display("{tag} has expired"))]
    Expired { tag: Tag },

    #[snafu(display("no record exists for {name:?}"))]
    NoRecord { name: String },

    #[snafu(display("no TTL is set for {name:?}"))]
    NoTtl { name: String },

    #[snafu(display("failed to read the certificate bounding the TTL of {name:?}"))]
    ReadCertificate {
        source: certificate::Error,
        name: String,
    },

    #[snafu(display(
        "TTL {expiration:?} of {name:?} lies outside the certificate validity \
        [{not_before:?}, {not_after:?}]"
    ))]
    TtlOutOfBounds {
        name: String,
        expiration: SystemTime,
        not_before: SystemTime,
        not_after: SystemTime,
    },

    #[snafu(display("failed to access {}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[cfg(feature = "document")]
    #[snafu(display("document database operation failed"))]
    Database {
        #[snafu(source(from(redb::Error, Box::new)))]
        source: Box<redb::Error>,
    },

    #[cfg(feature = "document")]
    #[snafu(display("failed to (de)serialize document {id:?}"))]
    Document {
        source: serde_json::Error,
        id: String,
    },

    #[cfg(feature = "relational")]
    #[snafu(display("SQL statement failed"))]
    Sqlite { source: rusqlite::Error },

    #[snafu(display("{table:?} is not a valid table name"))]
    InvalidTableName { table: String },

    #[snafu(display("storage lock is poisoned"))]
    LockPoisoned,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyData { .. }
            | Self::NotText { .. }
            | Self::TtlOutOfBounds { .. }
            | Self::InvalidTableName { .. } => ErrorKind::InvalidArgument,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } | Self::NoRecord { .. } | Self::NoTtl { .. } => {
                ErrorKind::NotFound
            }
            Self::Expired { .. } => ErrorKind::Expired,
            Self::ReadCertificate { .. } | Self::Io { .. } | Self::LockPoisoned => {
                ErrorKind::BackendFailure
            }
            #[cfg(feature = "document")]
            Self::Database { .. } | Self::Document { .. } => ErrorKind::BackendFailure,
            #[cfg(feature = "relational")]
            Self::Sqlite { .. } => ErrorKind::BackendFailure,
        }
    }
}

/// The byte oriented contract every backend implements. All operations are
/// keyed by a [`Tag`] and address only the single artifact it names.
pub trait Storage: Debug + Send + Sync {
    /// Stores `data` at `tag`. Empty data is rejected.
    fn put(&self, tag: &Tag, data: &[u8]) -> Result<()>;

    /// Returns the data stored at `tag`. Absent and empty artifacts are both
    /// reported as [`Error::NotFound`].
    fn get(&self, tag: &Tag) -> Result<Vec<u8>>;

    /// Whether an artifact is stored at `tag`. Lookup failures are logged and
    /// reported as absence.
    fn check(&self, tag: &Tag) -> bool;

    /// Removes the artifact stored at `tag`, leaving other artifacts of the
    /// same entity untouched.
    fn delete(&self, tag: &Tag) -> Result<()>;
}

/// Optional capability of record based backends: a TTL per entity, bounded
/// by the validity of the entity's certificate.
pub trait ExpirationManager: Storage {
    /// Sets the TTL of `name`. Fails if there is no record for `name`, or if
    /// `expiration` lies outside `[NotBefore, NotAfter]` of its certificate.
    fn put_ttl(&self, name: &str, expiration: SystemTime) -> Result<()>;

    fn get_ttl(&self, name: &str) -> Result<SystemTime>;

    /// Returns every record whose TTL is set and not after `cutoff`, in
    /// backend order.
    fn find_expires_before(&self, cutoff: SystemTime) -> Result<Vec<EntityRecord>>;

    /// Removes every record [`ExpirationManager::find_expires_before`] would
    /// return, all artifacts included.
    fn delete_expires_before(&self, cutoff: SystemTime) -> Result<()>;
}

/// All artifacts stored for one entity, as held by record based backends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: String,
    pub cert: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub cert_req: Option<Vec<u8>>,
    pub cert_revoc_list: Option<Vec<u8>>,
    pub ttl: Option<SystemTime>,
}

impl EntityRecord {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&[u8]> {
        match kind {
            ArtifactKind::Certificate => self.cert.as_deref(),
            ArtifactKind::PrivateKey => self.private_key.as_deref(),
            ArtifactKind::CertificateRequest => self.cert_req.as_deref(),
            ArtifactKind::RevocationList => self.cert_revoc_list.as_deref(),
        }
    }
}

/// The TTL a certificate `put` stamps onto its record. Data which does not
/// parse as a certificate leaves the TTL untouched.
pub(crate) fn certificate_ttl(data: &[u8]) -> Option<SystemTime> {
    Certificate::from_pem_bytes(data)
        .ok()
        .map(|certificate| certificate.not_after())
}

pub(crate) fn ensure_ttl_within_certificate(
    name: &str,
    certificate: &[u8],
    expiration: SystemTime,
) -> Result<()> {
    let certificate =
        Certificate::from_pem_bytes(certificate).context(ReadCertificateSnafu { name })?;
    let (not_before, not_after) = (certificate.not_before(), certificate.not_after());

    snafu::ensure!(
        not_before <= expiration && expiration <= not_after,
        TtlOutOfBoundsSnafu {
            name,
            expiration,
            not_before,
            not_after,
        }
    );
    Ok(())
}

/// Whether a record with `ttl` expired more than `expire_after` ago.
pub(crate) fn is_expired(ttl: Option<SystemTime>, expire_after: std::time::Duration) -> bool {
    ttl.and_then(|ttl| SystemTime::now().duration_since(ttl).ok())
        .is_some_and(|elapsed| elapsed > expire_after)
}

pub(crate) fn to_unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_millis()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_millis()).map_or(i64::MIN, |millis| -millis),
    }
}

pub(crate) fn from_unix_millis(millis: i64) -> SystemTime {
    let offset = std::time::Duration::from_millis(millis.unsigned_abs());
    if millis >= 0 {
        UNIX_EPOCH + offset
    } else {
        UNIX_EPOCH - offset
    }
}
