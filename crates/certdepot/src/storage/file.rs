use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind as IoErrorKind, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::{debug, instrument, warn};

use super::{
    AlreadyExistsSnafu, EmptyDataSnafu, IoSnafu, NotFoundSnafu, Result, Storage,
};
use crate::{ArtifactKind, Tag};

/// Stores every artifact as its own file `<entity>.<crt|key|csr|crl>` below
/// a root directory. Files are created read-only and are never overwritten.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens (and creates, if necessary) the depot directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).context(IoSnafu { path: &root })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, tag: &Tag) -> PathBuf {
        self.root
            .join(format!("{}.{}", tag.entity_id(), tag.kind().extension()))
    }
}

impl Storage for FileStorage {
    #[instrument(skip(self, data), fields(%tag))]
    fn put(&self, tag: &Tag, data: &[u8]) -> Result<()> {
        ensure!(!data.is_empty(), EmptyDataSnafu { tag: tag.clone() });

        let path = self.path(tag);
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            // Keys are readable by the owner and group only
            let mode = match tag.kind() {
                ArtifactKind::PrivateKey => 0o440,
                _ => 0o444,
            };
            options.mode(mode);
        }

        let mut file = match options.open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                return AlreadyExistsSnafu { tag: tag.clone() }.fail();
            }
            Err(err) => return Err(err).context(IoSnafu { path }),
        };
        file.write_all(data).context(IoSnafu { path: &path })?;

        debug!(backend = "file", path = %path.display(), "stored artifact");
        Ok(())
    }

    fn get(&self, tag: &Tag) -> Result<Vec<u8>> {
        let path = self.path(tag);
        match fs::read(&path) {
            Ok(data) if data.is_empty() => NotFoundSnafu { tag: tag.clone() }.fail(),
            Ok(data) => Ok(data),
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                NotFoundSnafu { tag: tag.clone() }.fail()
            }
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }

    fn check(&self, tag: &Tag) -> bool {
        let path = self.path(tag);
        match fs::metadata(&path) {
            Ok(metadata) => metadata.is_file(),
            Err(err) if err.kind() == IoErrorKind::NotFound => false,
            Err(err) => {
                warn!(backend = "file", path = %path.display(), error = %err, "failed to check for artifact");
                false
            }
        }
    }

    #[instrument(skip(self), fields(%tag))]
    fn delete(&self, tag: &Tag) -> Result<()> {
        let path = self.path(tag);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(backend = "file", path = %path.display(), "deleted artifact");
                Ok(())
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                NotFoundSnafu { tag: tag.clone() }.fail()
            }
            Err(err) => Err(err).context(IoSnafu { path }),
        }
    }
}
