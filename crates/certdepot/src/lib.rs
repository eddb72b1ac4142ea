//! A certificate depot stores PKI artifacts (certificates, private keys,
//! certificate signing requests and revocation lists) in interchangeable
//! storage backends, and drives their lifecycle: creating a CA, requesting
//! and signing certificates, renewing certificates which are about to expire
//! and sweeping records whose TTL has passed.
//!
//! Artifacts are addressed by a [`Tag`], which pairs an entity name with an
//! [`ArtifactKind`]. Backends implement the four operation [`Storage`]
//! contract, and may additionally implement [`ExpirationManager`] to track a
//! TTL per entity. The [`Depot`] façade wraps a backend and is the entry point
//! for [`CertificateOptions`] and [`bootstrap`].
//!
//! ```no_run
//! use certdepot::{CertificateOptions, Depot, storage::FileStorage};
//!
//! let depot = Depot::new(FileStorage::new("/var/lib/certdepot").unwrap());
//! let ca = CertificateOptions {
//!     common_name: "root".to_owned(),
//!     ..Default::default()
//! };
//! ca.init(&depot).unwrap();
//! ```
//!
//! ## Feature Flags
//!
//! - `document`: enables [`storage::DocumentStorage`], an embedded document
//!   store on top of `redb`.
//! - `relational`: enables [`storage::RelationalStorage`], on top of SQLite.
//!
//! Both are enabled by default.

pub mod artifacts;
pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod depot;
pub mod options;
pub mod storage;
pub mod tag;

pub use artifacts::{KeyEncryption, Passphrase};
pub use bootstrap::{BootstrapConfig, bootstrap};
pub use config::{DepotConfig, StorageConfig};
pub use credentials::Credentials;
pub use depot::{CertificateState, Depot, DepotOptions};
pub use options::{CertificateOptions, delete_on_expiration, validity_bounds};
pub use storage::{EntityRecord, ExpirationManager, Storage};
pub use tag::{ArtifactKind, Tag};

/// Classification of every error this crate returns, independent of the
/// operation which failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    /// A required field is missing, or a name, IP, URI or payload is malformed.
    InvalidArgument,

    /// The artifact (or entity) to create already exists.
    AlreadyExists,

    /// The artifact (or entity) to read, sign with or delete does not exist.
    NotFound,

    /// The certificate named as issuer is not a CA.
    NotAuthorizedToSign,

    /// The artifact exists, but its record expired.
    Expired,

    /// The storage medium or the PKI primitives failed.
    BackendFailure,
}
