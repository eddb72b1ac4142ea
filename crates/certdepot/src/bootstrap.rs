//! Establishes a CA and a service certificate in a depot.
//!
//! Bootstrapping is idempotent: it only creates what is missing, so it can
//! run on every start of a service and resumes where a failed run stopped.
use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument};

use crate::{CertificateOptions, Depot, ErrorKind, Storage, Tag, options, storage};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid bootstrap configuration: {}", problems.join("; ")))]
    InvalidConfig { problems: Vec<String> },

    #[snafu(display("failed to import the {tag}"))]
    Import { source: storage::Error, tag: Tag },

    #[snafu(display("no options to create the CA {ca_name:?} with"))]
    MissingCaOptions { ca_name: String },

    #[snafu(display("no options to create the service certificate {service_name:?} with"))]
    MissingServiceOptions { service_name: String },

    #[snafu(display("failed to create the CA {ca_name:?}"))]
    CreateCa {
        source: options::Error,
        ca_name: String,
    },

    #[snafu(display("failed to request the service certificate {service_name:?}"))]
    RequestService {
        source: options::Error,
        service_name: String,
    },

    #[snafu(display("failed to sign the service certificate {service_name:?}"))]
    SignService {
        source: options::Error,
        service_name: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. }
            | Self::MissingCaOptions { .. }
            | Self::MissingServiceOptions { .. } => ErrorKind::InvalidArgument,
            Self::Import { source, .. } => source.kind(),
            Self::CreateCa { source, .. }
            | Self::RequestService { source, .. }
            | Self::SignService { source, .. } => source.kind(),
        }
    }
}

/// What a depot must contain after bootstrapping: a CA named `ca_name` and
/// a certificate for `service_name` signed by it.
///
/// The CA is either imported from `ca_cert` and `ca_key`, or created from
/// `ca_opts`. The service certificate is created from `service_opts`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// PEM encoded CA certificate to import.
    pub ca_cert: String,

    /// PEM encoded private key of the imported CA certificate.
    pub ca_key: String,

    pub ca_name: String,
    pub service_name: String,
    pub ca_opts: Option<CertificateOptions>,
    pub service_opts: Option<CertificateOptions>,
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("ca_cert", &self.ca_cert)
            .field("ca_name", &self.ca_name)
            .field("service_name", &self.service_name)
            .field("ca_opts", &self.ca_opts)
            .field("service_opts", &self.service_opts)
            .finish_non_exhaustive()
    }
}

impl BootstrapConfig {
    /// Reports every violated constraint at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.ca_name.is_empty() {
            problems.push("ca_name is required".to_owned());
        }
        if self.service_name.is_empty() {
            problems.push("service_name is required".to_owned());
        }
        if !self.ca_name.is_empty() && self.ca_name == self.service_name {
            problems.push(format!(
                "ca_name and service_name must differ, both are {:?}",
                self.ca_name
            ));
        }
        if self.ca_cert.is_empty() != self.ca_key.is_empty() {
            problems.push("ca_cert and ca_key must be given together".to_owned());
        }
        if let Some(ca_opts) = &self.ca_opts {
            if ca_opts.common_name != self.ca_name {
                problems.push(format!(
                    "ca_opts.cn {:?} must match ca_name {:?}",
                    ca_opts.common_name, self.ca_name
                ));
            }
        }
        if let Some(service_opts) = &self.service_opts {
            if service_opts.common_name != self.service_name {
                problems.push(format!(
                    "service_opts.cn {:?} must match service_name {:?}",
                    service_opts.common_name, self.service_name
                ));
            }
            if service_opts.ca != self.ca_name {
                problems.push(format!(
                    "service_opts.ca {:?} must match ca_name {:?}",
                    service_opts.ca, self.ca_name
                ));
            }
        }

        ensure!(problems.is_empty(), InvalidConfigSnafu { problems });
        Ok(())
    }
}

/// Ensures `depot` contains a certificate and key for both the CA and the
/// service named in `config`.
///
/// 1. An operator supplied CA is imported, unless the depot already holds
///    identical material. Different material replaces what is stored.
/// 2. Without a CA certificate, the CA is created and the service
///    certificate is issued right after.
/// 3. With a CA certificate but no service certificate, the service
///    certificate is issued.
///
/// Failures name the step which failed. Nothing is rolled back, running
/// again resumes after the last completed step.
#[instrument(skip_all, fields(ca_name = %config.ca_name, service_name = %config.service_name))]
pub fn bootstrap(depot: &Depot, config: &BootstrapConfig) -> Result<()> {
    config.validate()?;

    if !config.ca_cert.is_empty() {
        import(depot, &Tag::certificate(&config.ca_name), &config.ca_cert)?;
        import(depot, &Tag::private_key(&config.ca_name), &config.ca_key)?;
    }

    if !depot.check(&Tag::certificate(&config.ca_name)) {
        let ca_opts = config.ca_opts.as_ref().context(MissingCaOptionsSnafu {
            ca_name: &config.ca_name,
        })?;
        ca_opts.init(depot).context(CreateCaSnafu {
            ca_name: &config.ca_name,
        })?;
        info!("created CA");

        issue_service_certificate(depot, config)
    } else if !depot.check(&Tag::certificate(&config.service_name)) {
        issue_service_certificate(depot, config)
    } else {
        debug!("CA and service certificate exist, nothing to do");
        Ok(())
    }
}

/// Writes operator supplied material to `tag`, unless it is stored already.
fn import(depot: &Depot, tag: &Tag, data: &str) -> Result<()> {
    if depot.check(tag) {
        // Stored material which can no longer be read, e.g. an expired CA,
        // is replaced like any other
        match depot.get(tag) {
            Ok(stored) if stored == data.as_bytes() => {
                debug!(%tag, "skipping import of identical material");
                return Ok(());
            }
            Ok(_) => {}
            Err(error) => debug!(%tag, %error, "stored material is unreadable"),
        }

        match depot.delete(tag) {
            Err(error) if error.kind() != ErrorKind::NotFound => {
                return Err(error).context(ImportSnafu { tag: tag.clone() });
            }
            _ => {}
        }
        info!(%tag, "replacing stored material with different imported material");
    }

    depot
        .put(tag, data.as_bytes())
        .with_context(|_| ImportSnafu { tag: tag.clone() })?;
    info!(%tag, "imported material");
    Ok(())
}

fn issue_service_certificate(depot: &Depot, config: &BootstrapConfig) -> Result<()> {
    let service_name = &config.service_name;
    let service_opts = config
        .service_opts
        .as_ref()
        .context(MissingServiceOptionsSnafu { service_name })?;

    // A request left behind by an earlier, failed run is signed as is
    let requested = depot.check(&Tag::certificate_request(service_name))
        && depot.check(&Tag::private_key(service_name));
    if requested {
        debug!("service certificate signing request exists");
    } else {
        service_opts
            .cert_request(depot)
            .context(RequestServiceSnafu { service_name })?;
    }

    let signing = CertificateOptions {
        host: service_name.clone(),
        ..service_opts.clone()
    };
    signing
        .sign(depot)
        .context(SignServiceSnafu { service_name })?;

    info!("issued service certificate");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use certdepot_pki::CertificateExt;
    use certdepot_shared::time::Duration;
    use rstest::rstest;

    use super::*;
    use crate::{
        ArtifactKind,
        storage::{DocumentStorage, FileStorage, RelationalStorage},
    };

    fn open_depot(backend: &str, dir: &Path) -> Depot {
        open_depot_expiring_after(backend, dir, std::time::Duration::from_secs(60))
    }

    fn open_depot_expiring_after(
        backend: &str,
        dir: &Path,
        expire_after: std::time::Duration,
    ) -> Depot {
        match backend {
            "file" => Depot::new(FileStorage::new(dir).unwrap()),
            "document" => Depot::with_expiration(
                DocumentStorage::new(dir.join("depot.redb"), "certs", expire_after).unwrap(),
            ),
            _ => Depot::with_expiration(RelationalStorage::new(None, "certs", expire_after).unwrap()),
        }
    }

    fn config() -> BootstrapConfig {
        let options = |common_name: &str, ca: &str| CertificateOptions {
            common_name: common_name.to_owned(),
            host: common_name.to_owned(),
            ca: ca.to_owned(),
            key_bits: 1024,
            expires: Duration::from_hours_unchecked(1),
            ..Default::default()
        };

        BootstrapConfig {
            ca_name: "root".to_owned(),
            service_name: "svc".to_owned(),
            ca_opts: Some(options("root", "")),
            service_opts: Some(options("svc", "root")),
            ..Default::default()
        }
    }

    fn snapshot(depot: &Depot, names: &[&str]) -> Vec<Option<Vec<u8>>> {
        names
            .iter()
            .flat_map(|name| {
                [
                    ArtifactKind::Certificate,
                    ArtifactKind::PrivateKey,
                    ArtifactKind::CertificateRequest,
                    ArtifactKind::RevocationList,
                ]
                .map(|kind| depot.get(&Tag::new(*name, kind)).ok())
            })
            .collect()
    }

    #[rstest]
    fn bootstrap_empty_depot(#[values("file", "document", "relational")] backend: &str) {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot(backend, dir.path());

        bootstrap(&depot, &config()).unwrap();

        assert!(depot.check(&Tag::certificate("root")));
        assert!(depot.check(&Tag::certificate("svc")));
        let svc = depot.get_certificate("svc").unwrap();
        assert_eq!(svc.issuer_common_name().as_deref(), Some("root"));
    }

    #[rstest]
    fn bootstrap_is_idempotent(#[values("file", "document", "relational")] backend: &str) {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot(backend, dir.path());

        bootstrap(&depot, &config()).unwrap();
        let before = snapshot(&depot, &["root", "svc"]);

        bootstrap(&depot, &config()).unwrap();
        assert_eq!(snapshot(&depot, &["root", "svc"]), before);
    }

    #[test]
    fn bootstrap_issues_missing_service_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot("file", dir.path());
        config().ca_opts.unwrap().init(&depot).unwrap();
        let ca = depot.get(&Tag::certificate("root")).unwrap();

        // The CA exists, so its options are not needed
        let config = BootstrapConfig {
            ca_opts: None,
            ..config()
        };
        bootstrap(&depot, &config).unwrap();

        assert_eq!(depot.get(&Tag::certificate("root")).unwrap(), ca);
        assert!(depot.check(&Tag::certificate("svc")));
    }

    #[test]
    fn bootstrap_resumes_after_failed_signing() {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot("file", dir.path());
        config().ca_opts.unwrap().init(&depot).unwrap();
        config().service_opts.unwrap().cert_request(&depot).unwrap();

        bootstrap(&depot, &config()).unwrap();
        assert!(depot.check(&Tag::certificate("svc")));
    }

    #[test]
    fn bootstrap_imports_ca() {
        let dir = tempfile::tempdir().unwrap();
        let source = open_depot("file", &dir.path().join("source"));
        config().ca_opts.unwrap().init(&source).unwrap();
        let ca_cert = String::from_utf8(source.get(&Tag::certificate("root")).unwrap()).unwrap();
        let ca_key = String::from_utf8(source.get(&Tag::private_key("root")).unwrap()).unwrap();

        let depot = open_depot("relational", dir.path());
        let config = BootstrapConfig {
            ca_cert: ca_cert.clone(),
            ca_key,
            ca_opts: None,
            ..config()
        };
        bootstrap(&depot, &config).unwrap();
        assert_eq!(depot.get(&Tag::certificate("root")).unwrap(), ca_cert.as_bytes());
        assert!(depot.check(&Tag::certificate("svc")));

        // Importing identical material again is a no-op
        let before = snapshot(&depot, &["root", "svc"]);
        bootstrap(&depot, &config).unwrap();
        assert_eq!(snapshot(&depot, &["root", "svc"]), before);
    }

    #[rstest]
    fn bootstrap_replaces_different_imported_ca(
        #[values("file", "document", "relational")] backend: &str,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot(backend, dir.path());
        bootstrap(&depot, &config()).unwrap();

        let other = open_depot("file", &dir.path().join("other"));
        config().ca_opts.unwrap().init(&other).unwrap();
        let ca_cert = other.get(&Tag::certificate("root")).unwrap();
        let ca_key = other.get(&Tag::private_key("root")).unwrap();

        bootstrap(
            &depot,
            &BootstrapConfig {
                ca_cert: String::from_utf8(ca_cert.clone()).unwrap(),
                ca_key: String::from_utf8(ca_key.clone()).unwrap(),
                ..config()
            },
        )
        .unwrap();

        assert_eq!(depot.get(&Tag::certificate("root")).unwrap(), ca_cert);
        assert_eq!(depot.get(&Tag::private_key("root")).unwrap(), ca_key);
    }

    #[rstest]
    fn bootstrap_replaces_expired_ca(#[values("document", "relational")] backend: &str) {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot_expiring_after(backend, dir.path(), std::time::Duration::ZERO);
        bootstrap(&depot, &config()).unwrap();

        let (not_before, _) = crate::validity_bounds(&depot, "root").unwrap();
        depot
            .expiration()
            .unwrap()
            .put_ttl("root", not_before)
            .unwrap();
        assert_eq!(
            depot.get(&Tag::certificate("root")).unwrap_err().kind(),
            ErrorKind::Expired
        );

        let other = open_depot("file", &dir.path().join("other"));
        config().ca_opts.unwrap().init(&other).unwrap();
        let ca_cert = other.get(&Tag::certificate("root")).unwrap();
        let ca_key = other.get(&Tag::private_key("root")).unwrap();

        bootstrap(
            &depot,
            &BootstrapConfig {
                ca_cert: String::from_utf8(ca_cert.clone()).unwrap(),
                ca_key: String::from_utf8(ca_key.clone()).unwrap(),
                ..config()
            },
        )
        .unwrap();

        assert_eq!(depot.get(&Tag::certificate("root")).unwrap(), ca_cert);
        assert_eq!(depot.get(&Tag::private_key("root")).unwrap(), ca_key);
    }

    #[test]
    fn missing_ca_options() {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot("file", dir.path());

        let error = bootstrap(
            &depot,
            &BootstrapConfig {
                ca_opts: None,
                ..config()
            },
        )
        .unwrap_err();
        assert!(matches!(error, Error::MissingCaOptions { .. }));
        assert!(!depot.check(&Tag::certificate("root")));
    }

    #[test]
    fn missing_service_options_leaves_the_ca() {
        let dir = tempfile::tempdir().unwrap();
        let depot = open_depot("file", dir.path());

        let error = bootstrap(
            &depot,
            &BootstrapConfig {
                service_opts: None,
                ..config()
            },
        )
        .unwrap_err();
        assert!(matches!(error, Error::MissingServiceOptions { .. }));
        assert!(depot.check(&Tag::certificate("root")));

        bootstrap(&depot, &config()).unwrap();
        assert!(depot.check(&Tag::certificate("svc")));
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut config = config();
        config.service_name = String::new();
        config.ca_key = "a key without certificate".to_owned();
        if let Some(ca_opts) = config.ca_opts.as_mut() {
            ca_opts.common_name = "other".to_owned();
        }
        if let Some(service_opts) = config.service_opts.as_mut() {
            service_opts.ca = "other".to_owned();
        }

        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { problems }) if problems.len() == 5
        ));
    }

    #[test]
    fn validation_rejects_shared_names() {
        let config = BootstrapConfig {
            service_name: "root".to_owned(),
            service_opts: None,
            ..config()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn ca_key_is_not_debug_printed() {
        let config = BootstrapConfig {
            ca_key: "secret key material".to_owned(),
            ..config()
        };
        assert!(!format!("{config:?}").contains("secret key material"));
    }

    #[test]
    fn deserialize() {
        let config: BootstrapConfig = serde_yaml::from_str(
            "
            ca_name: root
            service_name: svc
            ca_opts:
              cn: root
              expires: 3650d
            service_opts:
              cn: svc
              ca: root
              dns: [svc.example.com]
            ",
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.ca_opts.unwrap().common_name, "root");
        assert_eq!(config.service_opts.unwrap().domains, ["svc.example.com"]);
    }
}
