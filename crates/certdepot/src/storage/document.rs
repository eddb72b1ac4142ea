use std::{fmt, path::Path, time::SystemTime};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument, warn};

use super::{
    DatabaseSnafu, DocumentSnafu, EmptyDataSnafu, EntityRecord, ExpirationManager,
    ExpiredSnafu, IoSnafu, NoRecordSnafu, NoTtlSnafu, NotFoundSnafu, NotTextSnafu, Result,
    Storage, certificate_ttl, ensure_ttl_within_certificate, from_unix_millis, is_expired,
    to_unix_millis,
};
use crate::{ArtifactKind, Tag};

/// One document per entity, holding every artifact as PEM text next to the
/// entity's TTL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cert_req: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cert_revoc_list: Option<String>,

    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<i64>,
}

impl Document {
    fn field(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Certificate => self.cert.as_deref(),
            ArtifactKind::PrivateKey => self.private_key.as_deref(),
            ArtifactKind::CertificateRequest => self.cert_req.as_deref(),
            ArtifactKind::RevocationList => self.cert_revoc_list.as_deref(),
        }
        .filter(|value| !value.is_empty())
    }

    fn field_mut(&mut self, kind: ArtifactKind) -> &mut Option<String> {
        match kind {
            ArtifactKind::Certificate => &mut self.cert,
            ArtifactKind::PrivateKey => &mut self.private_key,
            ArtifactKind::CertificateRequest => &mut self.cert_req,
            ArtifactKind::RevocationList => &mut self.cert_revoc_list,
        }
    }

    fn ttl(&self) -> Option<SystemTime> {
        self.ttl.map(from_unix_millis)
    }

    fn into_record(self, id: String) -> EntityRecord {
        EntityRecord {
            id,
            cert: self.cert.map(String::into_bytes),
            private_key: self.private_key.map(String::into_bytes),
            cert_req: self.cert_req.map(String::into_bytes),
            cert_revoc_list: self.cert_revoc_list.map(String::into_bytes),
            ttl: self.ttl.map(from_unix_millis),
        }
    }
}

trait DatabaseResultExt<T> {
    fn database(self) -> Result<T>;
}

impl<T, E: Into<redb::Error>> DatabaseResultExt<T> for std::result::Result<T, E> {
    fn database(self) -> Result<T> {
        self.map_err(Into::<redb::Error>::into).context(DatabaseSnafu)
    }
}

/// An embedded document store on top of [`redb`]. Every entity is one JSON
/// document within the table `collection`.
///
/// `put` overwrites existing artifacts and `delete` of an absent artifact
/// succeeds. Reads of certificates and revocation lists fail with `Expired`
/// once the entity's TTL lies more than `expire_after` in the past.
pub struct DocumentStorage {
    db: Database,
    collection: String,
    expire_after: std::time::Duration,
}

impl fmt::Debug for DocumentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStorage")
            .field("collection", &self.collection)
            .field("expire_after", &self.expire_after)
            .finish_non_exhaustive()
    }
}

impl DocumentStorage {
    /// Creates or opens the database file at `path`, creating `collection`
    /// if it does not exist yet.
    pub fn new(
        path: impl AsRef<Path>,
        collection: impl Into<String>,
        expire_after: std::time::Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }

        let storage = Self {
            db: Database::create(path).database()?,
            collection: collection.into(),
            expire_after,
        };

        let txn = storage.db.begin_write().database()?;
        txn.open_table(storage.table()).database()?;
        txn.commit().database()?;

        Ok(storage)
    }

    fn table(&self) -> TableDefinition<'_, &'static str, &'static str> {
        TableDefinition::new(&self.collection)
    }

    fn load(&self, id: &str) -> Result<Option<Document>> {
        let txn = self.db.begin_read().database()?;
        let table = txn.open_table(self.table()).database()?;
        let Some(raw) = table.get(id).database()? else {
            return Ok(None);
        };

        serde_json::from_str(raw.value())
            .map(Some)
            .context(DocumentSnafu { id })
    }

    /// Read-modify-write of the document `id` within one write transaction.
    /// The closure receives `None` for absent documents, and the document is
    /// removed if the closure leaves `None` behind.
    fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Option<Document>) -> Result<T>,
    ) -> Result<T> {
        let txn = self.db.begin_write().database()?;
        let output = {
            let mut table = txn.open_table(self.table()).database()?;
            let existing = table
                .get(id)
                .database()?
                .map(|raw| raw.value().to_owned());

            let mut document = existing
                .as_deref()
                .map(serde_json::from_str::<Document>)
                .transpose()
                .context(DocumentSnafu { id })?;

            let output = f(&mut document)?;

            match document {
                Some(document) => {
                    let raw = serde_json::to_string(&document).context(DocumentSnafu { id })?;
                    table.insert(id, raw.as_str()).database()?;
                }
                None if existing.is_some() => {
                    table.remove(id).database()?;
                }
                None => {}
            }
            output
        };
        txn.commit().database()?;

        Ok(output)
    }

    fn documents(&self) -> Result<Vec<(String, Document)>> {
        let txn = self.db.begin_read().database()?;
        let table = txn.open_table(self.table()).database()?;

        let mut documents = Vec::new();
        for entry in table.iter().database()? {
            let (id, raw) = entry.database()?;
            let id = id.value().to_owned();
            let document = serde_json::from_str(raw.value()).context(DocumentSnafu { id: &id })?;
            documents.push((id, document));
        }
        Ok(documents)
    }
}

impl Storage for DocumentStorage {
    #[instrument(skip(self, data), fields(%tag))]
    fn put(&self, tag: &Tag, data: &[u8]) -> Result<()> {
        ensure!(!data.is_empty(), EmptyDataSnafu { tag: tag.clone() });
        let text = std::str::from_utf8(data)
            .ok()
            .context(NotTextSnafu { tag: tag.clone() })?;

        let id = tag.entity_id();
        let created = self.update(&id, |document| {
            let created = document.is_none();
            let document = document.get_or_insert_with(Document::default);
            *document.field_mut(tag.kind()) = Some(text.to_owned());

            if tag.kind() == ArtifactKind::Certificate {
                if let Some(ttl) = certificate_ttl(data) {
                    document.ttl = Some(to_unix_millis(ttl));
                }
            }
            Ok(created)
        })?;

        debug!(
            backend = "document",
            document.id = id,
            document.field = tag.kind().field(),
            document.created = created,
            "stored artifact"
        );
        Ok(())
    }

    fn get(&self, tag: &Tag) -> Result<Vec<u8>> {
        let document = self
            .load(&tag.entity_id())?
            .context(NotFoundSnafu { tag: tag.clone() })?;
        let value = document
            .field(tag.kind())
            .context(NotFoundSnafu { tag: tag.clone() })?;

        ensure!(
            !(tag.kind().expires() && is_expired(document.ttl(), self.expire_after)),
            ExpiredSnafu { tag: tag.clone() }
        );
        Ok(value.as_bytes().to_vec())
    }

    fn check(&self, tag: &Tag) -> bool {
        match self.load(&tag.entity_id()) {
            Ok(document) => document.is_some_and(|document| document.field(tag.kind()).is_some()),
            Err(error) => {
                warn!(backend = "document", %tag, %error, "failed to check for artifact");
                false
            }
        }
    }

    #[instrument(skip(self), fields(%tag))]
    fn delete(&self, tag: &Tag) -> Result<()> {
        let id = tag.entity_id();
        self.update(&id, |document| {
            if let Some(document) = document {
                document.field_mut(tag.kind()).take();
            }
            Ok(())
        })?;

        debug!(
            backend = "document",
            document.id = id,
            document.field = tag.kind().field(),
            "unset artifact"
        );
        Ok(())
    }
}

impl ExpirationManager for DocumentStorage {
    #[instrument(skip(self))]
    fn put_ttl(&self, name: &str, expiration: SystemTime) -> Result<()> {
        let tag = Tag::certificate(name);
        self.update(&tag.entity_id(), |document| {
            let document = document.as_mut().context(NoRecordSnafu { name })?;
            let certificate = document
                .field(ArtifactKind::Certificate)
                .context(NotFoundSnafu { tag: tag.clone() })?;
            ensure_ttl_within_certificate(name, certificate.as_bytes(), expiration)?;

            document.ttl = Some(to_unix_millis(expiration));
            Ok(())
        })
    }

    fn get_ttl(&self, name: &str) -> Result<SystemTime> {
        let id = Tag::certificate(name).entity_id();
        self.load(&id)?
            .context(NoRecordSnafu { name })?
            .ttl()
            .context(NoTtlSnafu { name })
    }

    fn find_expires_before(&self, cutoff: SystemTime) -> Result<Vec<EntityRecord>> {
        Ok(self
            .documents()?
            .into_iter()
            .filter(|(_, document)| document.ttl().is_some_and(|ttl| ttl <= cutoff))
            .map(|(id, document)| document.into_record(id))
            .collect())
    }

    #[instrument(skip(self))]
    fn delete_expires_before(&self, cutoff: SystemTime) -> Result<()> {
        let expired = self.find_expires_before(cutoff)?;

        let txn = self.db.begin_write().database()?;
        {
            let mut table = txn.open_table(self.table()).database()?;
            for record in &expired {
                table.remove(record.id.as_str()).database()?;
            }
        }
        txn.commit().database()?;

        debug!(
            backend = "document",
            removed = expired.len(),
            "deleted expired documents"
        );
        Ok(())
    }
}
