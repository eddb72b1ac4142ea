use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::ErrorKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("credentials for {server_name:?} lack the {part}"))]
    MissingPart {
        server_name: String,
        part: &'static str,
    },

    #[snafu(display("failed to write {}", path.display()))]
    Write {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingPart { .. } => ErrorKind::InvalidArgument,
            Self::Write { .. } => ErrorKind::BackendFailure,
        }
    }
}

/// Everything a service needs to present its identity: its certificate and
/// key, together with the certificate of the CA which signed it. All parts
/// are PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    server_name: String,
    ca_cert: Vec<u8>,
    cert: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_name", &self.server_name)
            .field("ca_cert", &String::from_utf8_lossy(&self.ca_cert))
            .field("cert", &String::from_utf8_lossy(&self.cert))
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(
        server_name: impl Into<String>,
        ca_cert: Vec<u8>,
        cert: Vec<u8>,
        key: Vec<u8>,
    ) -> Result<Self> {
        let server_name = server_name.into();
        for (part, data) in [
            ("CA certificate", &ca_cert),
            ("certificate", &cert),
            ("private key", &key),
        ] {
            ensure!(
                !data.is_empty(),
                MissingPartSnafu {
                    server_name: &server_name,
                    part
                }
            );
        }

        Ok(Self {
            server_name,
            ca_cert,
            cert,
            key: Zeroizing::new(key),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn ca_cert(&self) -> &[u8] {
        &self.ca_cert
    }

    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Writes `ca.crt`, `<server_name>.crt` and `<server_name>.key` into
    /// `dir`, replacing existing files. The key is only readable by its
    /// owner.
    #[instrument(skip(self, dir), fields(server_name = %self.server_name))]
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).context(WriteSnafu { path: dir })?;

        write_file(&dir.join("ca.crt"), &self.ca_cert, 0o644)?;
        write_file(&dir.join(format!("{}.crt", self.server_name)), &self.cert, 0o644)?;
        write_file(&dir.join(format!("{}.key", self.server_name)), &self.key, 0o600)?;

        debug!(dir = %dir.display(), "wrote credentials");
        Ok(())
    }
}

fn write_file(
    path: &Path,
    data: &[u8],
    #[cfg_attr(not(unix), allow(unused_variables))] mode: u32,
) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    options
        .open(path)
        .and_then(|mut file| file.write_all(data))
        .context(WriteSnafu { path })
}
