use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use rusqlite::{Connection, OptionalExtension, params};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument, warn};

use super::{
    AlreadyExistsSnafu, EmptyDataSnafu, EntityRecord, ExpirationManager, ExpiredSnafu,
    InvalidTableNameSnafu, LockPoisonedSnafu, NoRecordSnafu, NoTtlSnafu, NotFoundSnafu, Result,
    SqliteSnafu, Storage, certificate_ttl, ensure_ttl_within_certificate, from_unix_millis,
    is_expired, to_unix_millis,
};
use crate::{ArtifactKind, Tag};

/// A relational backend on top of SQLite. Every entity is one row, with one
/// nullable column per artifact kind and an integer TTL column holding
/// milliseconds since the Unix epoch.
///
/// Unlike [`super::DocumentStorage`], `put` never overwrites an artifact and
/// `delete` of an absent artifact fails with `NotFound`.
#[derive(Debug)]
pub struct RelationalStorage {
    conn: Mutex<Connection>,
    table: String,
    expire_after: std::time::Duration,
}

impl RelationalStorage {
    /// Opens the database at `path`, or a private in-memory database if no
    /// path is given, and creates `table` if it does not exist yet.
    pub fn new(
        path: Option<&Path>,
        table: impl Into<String>,
        expire_after: std::time::Duration,
    ) -> Result<Self> {
        let table = table.into();
        ensure!(is_valid_table_name(&table), InvalidTableNameSnafu { table });

        let conn = match path {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .context(SqliteSnafu)?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY NOT NULL,
                cert BLOB,
                private_key BLOB,
                cert_req BLOB,
                cert_revoc_list BLOB,
                ttl INTEGER
            );
            CREATE INDEX IF NOT EXISTS {table}_ttl ON {table} (ttl);"
        ))
        .context(SqliteSnafu)?;

        Ok(Self {
            conn: Mutex::new(conn),
            table,
            expire_after,
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().ok().context(LockPoisonedSnafu)
    }

    /// The artifact column and the TTL of the row `id`, `None` if there is no
    /// such row.
    fn select(
        &self,
        id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<(Option<Vec<u8>>, Option<i64>)>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {column}, ttl FROM {table} WHERE id = ?1",
                column = kind.field(),
                table = self.table
            ),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context(SqliteSnafu)
    }
}

fn is_valid_table_name(table: &str) -> bool {
    let mut chars = table.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Storage for RelationalStorage {
    #[instrument(skip(self, data), fields(%tag))]
    fn put(&self, tag: &Tag, data: &[u8]) -> Result<()> {
        ensure!(!data.is_empty(), EmptyDataSnafu { tag: tag.clone() });

        let id = tag.entity_id();
        let column = tag.kind().field();
        let table = &self.table;

        let mut conn = self.connection()?;
        let tx = conn.transaction().context(SqliteSnafu)?;

        let changed = tx
            .execute(
                &format!(
                    "INSERT INTO {table} (id, {column}) VALUES (?1, ?2)
                    ON CONFLICT (id) DO UPDATE SET {column} = excluded.{column}
                    WHERE {table}.{column} IS NULL"
                ),
                params![id, data],
            )
            .context(SqliteSnafu)?;
        ensure!(changed > 0, AlreadyExistsSnafu { tag: tag.clone() });

        if tag.kind() == ArtifactKind::Certificate {
            if let Some(ttl) = certificate_ttl(data) {
                tx.execute(
                    &format!("UPDATE {table} SET ttl = ?2 WHERE id = ?1"),
                    params![id, to_unix_millis(ttl)],
                )
                .context(SqliteSnafu)?;
            }
        }
        tx.commit().context(SqliteSnafu)?;

        debug!(backend = "relational", row.id = id, row.column = column, "stored artifact");
        Ok(())
    }

    fn get(&self, tag: &Tag) -> Result<Vec<u8>> {
        let (data, ttl) = self
            .select(&tag.entity_id(), tag.kind())?
            .context(NotFoundSnafu { tag: tag.clone() })?;
        let data = data
            .filter(|data| !data.is_empty())
            .context(NotFoundSnafu { tag: tag.clone() })?;

        ensure!(
            !(tag.kind().expires() && is_expired(ttl.map(from_unix_millis), self.expire_after)),
            ExpiredSnafu { tag: tag.clone() }
        );
        Ok(data)
    }

    fn check(&self, tag: &Tag) -> bool {
        match self.select(&tag.entity_id(), tag.kind()) {
            Ok(row) => row.is_some_and(|(data, _)| data.is_some_and(|data| !data.is_empty())),
            Err(error) => {
                warn!(backend = "relational", %tag, %error, "failed to check for artifact");
                false
            }
        }
    }

    #[instrument(skip(self), fields(%tag))]
    fn delete(&self, tag: &Tag) -> Result<()> {
        let id = tag.entity_id();
        let column = tag.kind().field();

        let changed = self
            .connection()?
            .execute(
                &format!(
                    "UPDATE {table} SET {column} = NULL WHERE id = ?1 AND {column} IS NOT NULL",
                    table = self.table
                ),
                params![id],
            )
            .context(SqliteSnafu)?;
        ensure!(changed > 0, NotFoundSnafu { tag: tag.clone() });

        debug!(backend = "relational", row.id = id, row.column = column, "cleared artifact");
        Ok(())
    }
}

impl ExpirationManager for RelationalStorage {
    #[instrument(skip(self))]
    fn put_ttl(&self, name: &str, expiration: SystemTime) -> Result<()> {
        let tag = Tag::certificate(name);
        let id = tag.entity_id();

        let (certificate, _) = self
            .select(&id, ArtifactKind::Certificate)?
            .context(NoRecordSnafu { name })?;
        let certificate = certificate.context(NotFoundSnafu { tag })?;
        ensure_ttl_within_certificate(name, &certificate, expiration)?;

        self.connection()?
            .execute(
                &format!("UPDATE {table} SET ttl = ?2 WHERE id = ?1", table = self.table),
                params![id, to_unix_millis(expiration)],
            )
            .context(SqliteSnafu)?;
        Ok(())
    }

    fn get_ttl(&self, name: &str) -> Result<SystemTime> {
        let (_, ttl) = self
            .select(&Tag::certificate(name).entity_id(), ArtifactKind::Certificate)?
            .context(NoRecordSnafu { name })?;
        ttl.map(from_unix_millis).context(NoTtlSnafu { name })
    }

    fn find_expires_before(&self, cutoff: SystemTime) -> Result<Vec<EntityRecord>> {
        let conn = self.connection()?;
        let mut statement = conn
            .prepare(&format!(
                "SELECT id, cert, private_key, cert_req, cert_revoc_list, ttl FROM {table}
                WHERE ttl IS NOT NULL AND ttl <= ?1 ORDER BY id",
                table = self.table
            ))
            .context(SqliteSnafu)?;

        let rows = statement
            .query_map(params![to_unix_millis(cutoff)], |row| {
                Ok(EntityRecord {
                    id: row.get(0)?,
                    cert: row.get(1)?,
                    private_key: row.get(2)?,
                    cert_req: row.get(3)?,
                    cert_revoc_list: row.get(4)?,
                    ttl: row.get::<_, Option<i64>>(5)?.map(from_unix_millis),
                })
            })
            .context(SqliteSnafu)?;

        rows.collect::<Result<_, _>>().context(SqliteSnafu)
    }

    #[instrument(skip(self))]
    fn delete_expires_before(&self, cutoff: SystemTime) -> Result<()> {
        let removed = self
            .connection()?
            .execute(
                &format!(
                    "DELETE FROM {table} WHERE ttl IS NOT NULL AND ttl <= ?1",
                    table = self.table
                ),
                params![to_unix_millis(cutoff)],
            )
            .context(SqliteSnafu)?;

        debug!(backend = "relational", removed, "deleted expired rows");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("certdepot", true)]
    #[case("_certs_2", true)]
    #[case("2certs", false)]
    #[case("certs; DROP TABLE x", false)]
    #[case("", false)]
    fn table_names(#[case] table: &str, #[case] valid: bool) {
        assert_eq!(is_valid_table_name(table), valid);
        assert_eq!(
            RelationalStorage::new(None, table, std::time::Duration::ZERO).is_ok(),
            valid
        );
    }

    #[test]
    fn rows_persist_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.sqlite");
        let tag = Tag::certificate_request("svc");

        RelationalStorage::new(Some(&path), "certs", std::time::Duration::ZERO)
            .unwrap()
            .put(&tag, b"request")
            .unwrap();

        let reopened =
            RelationalStorage::new(Some(&path), "certs", std::time::Duration::ZERO).unwrap();
        assert_eq!(reopened.get(&tag).unwrap(), b"request");
    }
}
