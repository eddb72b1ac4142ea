//! Command line front end of a certificate depot.
//!
//! Every command reads a YAML configuration file naming the storage backend,
//! and optionally how to bootstrap the depot and which certificates to keep
//! renewed:
//!
//! ```yaml
//! depot:
//!   storage:
//!     type: relational
//!     path: /var/lib/certdepot/depot.sqlite
//!   options:
//!     ca: root
//! bootstrap:
//!   ca_name: root
//!   service_name: depot
//!   ca_opts: { cn: root, expires: 3650d }
//!   service_opts: { cn: depot, ca: root, dns: [depot.local] }
//! certificates:
//!   - { cn: api, ca: root, dns: [api.local], expires: 90d }
//! ```
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use certdepot::{
    BootstrapConfig, CertificateOptions, CertificateState, Credentials, Depot, DepotConfig,
    bootstrap, config, credentials, depot, options, storage,
};
use certdepot_shared::time::Duration;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{info, instrument};

mod logging;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitLogging { source: logging::Error },

    #[snafu(display("failed to read configuration file {}", path.display()))]
    ReadConfig {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse configuration file {}", path.display()))]
    ParseConfig {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to open the depot"))]
    OpenDepot { source: config::Error },

    #[snafu(display("the configuration file has no bootstrap section"))]
    MissingBootstrapConfig,

    #[snafu(display("failed to bootstrap the depot"))]
    Bootstrap { source: bootstrap::Error },

    #[snafu(display("failed to find credentials for {name:?}"))]
    Find { source: depot::Error, name: String },

    #[snafu(display("failed to generate credentials for {name:?}"))]
    Generate { source: depot::Error, name: String },

    #[snafu(display("failed to save credentials for {name:?}"))]
    Save { source: depot::Error, name: String },

    #[snafu(display("failed to write credentials"))]
    WriteCredentials { source: credentials::Error },

    #[snafu(display("failed to renew the certificate of {name:?}"))]
    Renew {
        source: options::Error,
        name: String,
    },

    #[snafu(display("failed to read the validity of {name:?}"))]
    ReadValidity {
        source: options::Error,
        name: String,
    },

    #[snafu(display("the configured storage backend does not track TTLs"))]
    NoExpiration,

    #[snafu(display("failed to sweep expired records"))]
    Sweep { source: storage::Error },
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// The YAML configuration file.
    #[arg(short, long, env = "CERTDEPOT_CONFIG", default_value = "certdepot.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates the CA and the service certificate of the depot, importing
    /// the CA if configured. Safe to run repeatedly.
    Bootstrap,

    /// Prints or writes the stored credentials of a service.
    Find {
        name: String,

        /// Writes `ca.crt`, `<name>.crt` and `<name>.key` into this directory
        /// instead of printing the certificate.
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Issues credentials for a service, signed by the configured CA.
    Generate {
        name: String,

        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Stores the credentials in the depot, replacing existing ones.
        #[arg(long)]
        save: bool,
    },

    /// Creates or replaces configured certificates which are missing or
    /// expire within the given window.
    Renew {
        /// Only renews the certificate with this name.
        name: Option<String>,

        #[arg(long, default_value = "30d")]
        within: Duration,
    },

    /// Shows whether a certificate was requested or signed, and when it
    /// expires.
    Status { name: String },

    /// Removes every record whose TTL passes within the given window.
    Sweep {
        #[arg(long, default_value = "0s")]
        within: Duration,

        /// Only lists the records which would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    depot: DepotConfig,

    #[serde(default)]
    bootstrap: Option<BootstrapConfig>,

    #[serde(default)]
    certificates: Vec<CertificateOptions>,
}

impl ConfigFile {
    fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        serde_yaml::from_str(&contents).context(ParseConfigSnafu { path })
    }
}

#[snafu::report]
fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let _logging_guard = logging::LoggingSettings::from_env()
        .init()
        .context(InitLoggingSnafu)?;

    let config = ConfigFile::load(&cli.config)?;
    let depot = config.depot.open().context(OpenDepotSnafu)?;

    run(&depot, &config, cli.command)
}

fn run(depot: &Depot, config: &ConfigFile, command: Command) -> Result<(), Error> {
    match command {
        Command::Bootstrap => {
            let bootstrap_config = config
                .bootstrap
                .as_ref()
                .context(MissingBootstrapConfigSnafu)?;
            bootstrap(depot, bootstrap_config).context(BootstrapSnafu)
        }
        Command::Find { name, out_dir } => {
            let credentials = depot.find(&name).context(FindSnafu { name })?;
            emit(&credentials, out_dir.as_deref())
        }
        Command::Generate {
            name,
            out_dir,
            save,
        } => {
            let credentials = depot.generate(&name).context(GenerateSnafu { name: &name })?;
            if save {
                depot.save(&name, &credentials).context(SaveSnafu { name })?;
            }
            emit(&credentials, out_dir.as_deref())
        }
        Command::Renew { name, within } => {
            renew(depot, &config.certificates, name.as_deref(), within)
        }
        Command::Status { name } => status(depot, &name),
        Command::Sweep { within, dry_run } => sweep(depot, within, dry_run),
    }
}

fn emit(credentials: &Credentials, out_dir: Option<&Path>) -> Result<(), Error> {
    match out_dir {
        Some(dir) => credentials.write_to_dir(dir).context(WriteCredentialsSnafu),
        None => {
            print!("{}", String::from_utf8_lossy(credentials.cert()));
            Ok(())
        }
    }
}

#[instrument(skip(depot, certificates))]
fn renew(
    depot: &Depot,
    certificates: &[CertificateOptions],
    only: Option<&str>,
    within: Duration,
) -> Result<(), Error> {
    for options in certificates {
        let name = options.request_name().unwrap_or_default().to_owned();
        if only.is_some_and(|only| only != name) {
            continue;
        }

        let renewed = options
            .create_certificate_on_expiration(depot, within)
            .context(RenewSnafu { name: &name })?;
        info!(%name, renewed, "checked certificate");
    }
    Ok(())
}

fn status(depot: &Depot, name: &str) -> Result<(), Error> {
    let state = depot.certificate_state(name);
    println!("{name}: {state}");

    if state == CertificateState::Signed {
        let (_, not_after) =
            certdepot::validity_bounds(depot, name).context(ReadValiditySnafu { name })?;
        match not_after.duration_since(SystemTime::now()) {
            Ok(remaining) => println!("expires in {}", Duration::from_secs(remaining.as_secs())),
            Err(_) => println!("expired"),
        }
    }
    Ok(())
}

#[instrument(skip(depot))]
fn sweep(depot: &Depot, within: Duration, dry_run: bool) -> Result<(), Error> {
    let expiration = depot.expiration().context(NoExpirationSnafu)?;
    let cutoff = SystemTime::now() + within;

    let expired = expiration.find_expires_before(cutoff).context(SweepSnafu)?;
    for record in &expired {
        println!("{}", record.id);
    }

    if !dry_run {
        expiration.delete_expires_before(cutoff).context(SweepSnafu)?;
        info!(removed = expired.len(), "swept expired records");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use certdepot::{Storage, StorageConfig, Tag};
    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    const CONFIG: &str = "
depot:
  storage:
    type: relational
  options:
    ca: root
bootstrap:
  ca_name: root
  service_name: depot
  ca_opts: { cn: root, key_bits: 1024 }
  service_opts: { cn: depot, ca: root, key_bits: 1024 }
certificates:
  - { cn: api, ca: root, key_bits: 1024, expires: 1h }
";

    fn setup() -> (Depot, ConfigFile) {
        let config: ConfigFile = serde_yaml::from_str(CONFIG).unwrap();
        let depot = config.depot.open().unwrap();
        run(&depot, &config, Command::Bootstrap).unwrap();
        (depot, config)
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["certdepot", "sweep"], "0s")]
    #[case(&["certdepot", "sweep", "--within", "1d12h"], "1d12h")]
    fn parse_sweep_window(#[case] args: &[&str], #[case] expected: &str) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Command::Sweep { within, dry_run: false } if within.to_string() == expected
        ));
    }

    #[test]
    fn config_file_sections() {
        let config: ConfigFile = serde_yaml::from_str(CONFIG).unwrap();
        assert!(matches!(
            config.depot.storage,
            StorageConfig::Relational { path: None, .. }
        ));
        assert_eq!(config.bootstrap.unwrap().ca_name, "root");
        assert_eq!(config.certificates.len(), 1);
    }

    #[test]
    fn generate_save_and_find() {
        let (depot, config) = setup();
        let dir = tempfile::tempdir().unwrap();

        run(&depot, &config, Command::Generate {
            name: "worker".to_owned(),
            out_dir: None,
            save: true,
        })
        .unwrap();
        run(&depot, &config, Command::Find {
            name: "worker".to_owned(),
            out_dir: Some(dir.path().to_owned()),
        })
        .unwrap();

        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("worker.key").exists());
    }

    #[test]
    fn renew_creates_missing_certificates() {
        let (depot, config) = setup();

        run(&depot, &config, Command::Renew {
            name: None,
            within: Duration::from_days_unchecked(1),
        })
        .unwrap();
        assert_eq!(depot.certificate_state("api"), CertificateState::Signed);
    }

    #[test]
    fn sweep_removes_records_expiring_within_window() {
        let (depot, config) = setup();
        run(&depot, &config, Command::Renew {
            name: Some("api".to_owned()),
            within: Duration::from_days_unchecked(1),
        })
        .unwrap();

        run(&depot, &config, Command::Sweep {
            within: Duration::from_hours_unchecked(2),
            dry_run: true,
        })
        .unwrap();
        assert!(depot.check(&Tag::certificate("api")));

        run(&depot, &config, Command::Sweep {
            within: Duration::from_hours_unchecked(2),
            dry_run: false,
        })
        .unwrap();
        assert!(!depot.check(&Tag::certificate("api")));
        assert!(depot.check(&Tag::certificate("depot")));
    }

    #[test]
    fn sweep_requires_ttl_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigFile {
            depot: DepotConfig {
                storage: StorageConfig::File {
                    path: dir.path().to_owned(),
                },
                options: Default::default(),
            },
            bootstrap: None,
            certificates: Vec::new(),
        };
        let depot = config.depot.open().unwrap();

        let error = run(&depot, &config, Command::Sweep {
            within: Duration::from_secs(0),
            dry_run: false,
        })
        .unwrap_err();
        assert!(matches!(error, Error::NoExpiration));
    }
}
