//! Serializable configuration selecting and opening a storage backend.
use std::path::PathBuf;

use certdepot_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{info, instrument};

use crate::{Depot, DepotOptions, ErrorKind, storage};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to open the {backend} storage backend"))]
    OpenStorage {
        source: storage::Error,
        backend: &'static str,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OpenStorage { source, .. } => source.kind(),
        }
    }
}

#[cfg(any(feature = "document", feature = "relational"))]
const fn default_expire_after() -> Duration {
    Duration::from_days_unchecked(30)
}

#[cfg(feature = "document")]
fn default_collection() -> String {
    "certs".to_owned()
}

#[cfg(feature = "relational")]
fn default_table() -> String {
    "certdepot".to_owned()
}

/// Selects the storage backend of a depot.
///
/// ```yaml
/// type: relational
/// path: /var/lib/certdepot/depot.sqlite
/// expire_after: 7d
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// One file per artifact below `path`.
    File { path: PathBuf },

    /// One JSON document per entity in the `collection` table of the
    /// database file at `path`.
    #[cfg(feature = "document")]
    Document {
        path: PathBuf,

        #[serde(default = "default_collection")]
        collection: String,

        /// How long after their TTL certificates and revocation lists can
        /// still be read.
        #[serde(default = "default_expire_after")]
        expire_after: Duration,
    },

    /// One row per entity in `table` of the SQLite database at `path`, or of
    /// an in-memory database if `path` is absent.
    #[cfg(feature = "relational")]
    Relational {
        #[serde(default)]
        path: Option<PathBuf>,

        #[serde(default = "default_table")]
        table: String,

        /// How long after their TTL certificates and revocation lists can
        /// still be read.
        #[serde(default = "default_expire_after")]
        expire_after: Duration,
    },
}

impl StorageConfig {
    /// Opens the backend. Backends tracking TTLs are wired with their
    /// expiration capability.
    #[instrument(skip(self))]
    pub fn open(&self) -> Result<Depot> {
        let depot = match self {
            Self::File { path } => Depot::new(
                storage::FileStorage::new(path).context(OpenStorageSnafu { backend: "file" })?,
            ),

            #[cfg(feature = "document")]
            Self::Document {
                path,
                collection,
                expire_after,
            } => Depot::with_expiration(
                storage::DocumentStorage::new(path, collection.as_str(), **expire_after)
                    .context(OpenStorageSnafu {
                        backend: "document",
                    })?,
            ),

            #[cfg(feature = "relational")]
            Self::Relational {
                path,
                table,
                expire_after,
            } => Depot::with_expiration(
                storage::RelationalStorage::new(path.as_deref(), table.as_str(), **expire_after)
                    .context(OpenStorageSnafu {
                        backend: "relational",
                    })?,
            ),
        };

        info!(storage = ?self, "opened depot");
        Ok(depot)
    }
}

/// A storage backend together with the options of the depot façade.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DepotConfig {
    pub storage: StorageConfig,

    #[serde(default)]
    pub options: DepotOptions,
}

impl DepotConfig {
    pub fn open(&self) -> Result<Depot> {
        Ok(self.storage.open()?.with_options(self.options.clone()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{Storage, Tag};

    #[rstest]
    #[case::file(
        "type: file\npath: /var/lib/certdepot",
        StorageConfig::File { path: "/var/lib/certdepot".into() },
    )]
    #[case::document_defaults(
        "type: document\npath: depot.redb",
        StorageConfig::Document {
            path: "depot.redb".into(),
            collection: "certs".to_owned(),
            expire_after: Duration::from_days_unchecked(30),
        },
    )]
    #[case::relational_in_memory(
        "type: relational\nexpire_after: 12h\ntable: certs",
        StorageConfig::Relational {
            path: None,
            table: "certs".to_owned(),
            expire_after: Duration::from_hours_unchecked(12),
        },
    )]
    fn deserialize_storage(#[case] input: &str, #[case] expected: StorageConfig) {
        let config: StorageConfig = serde_yaml::from_str(input).unwrap();
        assert_eq!(config, expected);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(serde_yaml::from_str::<StorageConfig>("type: mongodb\nuri: localhost").is_err());
    }

    #[rstest]
    #[case::file("file", false)]
    #[case::document("document", true)]
    #[case::relational("relational", true)]
    fn open_wires_expiration(#[case] backend: &str, #[case] expiring: bool) {
        let dir = tempfile::tempdir().unwrap();
        let storage = match backend {
            "file" => StorageConfig::File {
                path: dir.path().join("depot"),
            },
            "document" => StorageConfig::Document {
                path: dir.path().join("depot.redb"),
                collection: default_collection(),
                expire_after: default_expire_after(),
            },
            _ => StorageConfig::Relational {
                path: Some(dir.path().join("depot.sqlite")),
                table: default_table(),
                expire_after: default_expire_after(),
            },
        };

        let depot = DepotConfig {
            storage,
            options: DepotOptions {
                ca: Some("root".to_owned()),
                ..Default::default()
            },
        }
        .open()
        .unwrap();

        assert_eq!(depot.expiration().is_some(), expiring);
        assert_eq!(depot.options().ca.as_deref(), Some("root"));

        depot.put(&Tag::certificate_request("svc"), b"request").unwrap();
        assert_eq!(
            depot.get(&Tag::certificate_request("svc")).unwrap(),
            b"request"
        );
    }

    #[test]
    fn invalid_table_name() {
        let error = StorageConfig::Relational {
            path: None,
            table: "certs; --".to_owned(),
            expire_after: default_expire_after(),
        }
        .open()
        .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    }
}
