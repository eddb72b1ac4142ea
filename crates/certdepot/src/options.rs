//! The certificate lifecycle: `Unissued` → `Requested` → `Signed`.
//!
//! A [`CertificateOptions`] record describes one certificate, and each
//! lifecycle operation consumes it against a [`Depot`]:
//!
//! - [`CertificateOptions::init`] creates a self-signed CA.
//! - [`CertificateOptions::cert_request`] creates a key and a certificate
//!   signing request.
//! - [`CertificateOptions::sign`] turns a stored request into a certificate,
//!   signed by a stored CA.
//!
//! There are no backward transitions. Renewal deletes the expiring artifacts
//! ([`delete_on_expiration`]) and starts over.
use std::{
    net::{AddrParseError, IpAddr},
    path::PathBuf,
    time::SystemTime,
};

use certdepot_pki::{
    CertReq, Certificate, CertificateExt, PrivateKey, Subject, SubjectAltNames, ca, certificate,
    create_certificate_authority, create_certificate_host, create_certificate_revocation_list,
    create_certificate_signing_request, create_intermediate_certificate_authority,
    keys::{self, DEFAULT_KEY_BITS},
    request, sign,
};
use certdepot_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    Depot, ErrorKind, Storage, Tag,
    artifacts::{self, KeyEncryption, Passphrase},
    storage,
    tag::{normalize_name, sanitize_name},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("a common name is required"))]
    MissingCommonName,

    #[snafu(display("either a common name or a domain is required"))]
    MissingName,

    #[snafu(display("a host to sign the certificate for is required"))]
    MissingHost,

    #[snafu(display("the name of the signing CA is required"))]
    MissingCa,

    #[snafu(display("{ip:?} is not a valid IP address"))]
    InvalidIpAddress { source: AddrParseError, ip: String },

    #[snafu(display("{uri:?} is not a valid URI"))]
    InvalidUri { source: url::ParseError, uri: String },

    #[snafu(display("{tag} already exists"))]
    ArtifactExists { tag: Tag },

    #[snafu(display("{ca:?} is not a CA and may not sign certificates"))]
    NotAuthorizedToSign { ca: String },

    #[snafu(display("failed to read the basic constraints of {ca:?}"))]
    ReadCaConstraints {
        source: certificate::Error,
        ca: String,
    },

    #[snafu(display("failed to read private key file {}", path.display()))]
    ReadKeyFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse private key file {}", path.display()))]
    ParseKeyFile { source: keys::Error, path: PathBuf },

    #[snafu(display("failed to generate private key"))]
    GenerateKey { source: keys::Error },

    #[snafu(display("failed to create certificate authority"))]
    CreateCertificateAuthority { source: ca::Error },

    #[snafu(display("failed to create certificate revocation list"))]
    CreateRevocationList { source: ca::Error },

    #[snafu(display("failed to create certificate signing request"))]
    CreateRequest { source: request::Error },

    #[snafu(display("failed to sign certificate"))]
    SignRequest { source: sign::Error },

    #[snafu(display("failed to load the {tag}"))]
    LoadCaCertificate { source: storage::Error, tag: Tag },

    #[snafu(display("failed to encode the issued certificate as PEM"))]
    EncodeCertificate { source: certificate::Error },

    #[snafu(display("failed to encode the issued private key as PEM"))]
    EncodePrivateKey { source: keys::Error },

    #[snafu(display("failed to load an artifact from the depot"))]
    Load { source: artifacts::Error },

    #[snafu(display("failed to save an artifact to the depot"))]
    Save { source: artifacts::Error },

    #[snafu(display("failed to delete the {tag}"))]
    Delete { source: storage::Error, tag: Tag },

    #[snafu(display("failed to record the TTL of {name:?}"))]
    RecordTtl {
        source: storage::Error,
        name: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCommonName
            | Self::MissingName
            | Self::MissingHost
            | Self::MissingCa
            | Self::InvalidIpAddress { .. }
            | Self::InvalidUri { .. }
            | Self::ReadKeyFile { .. }
            | Self::ParseKeyFile { .. } => ErrorKind::InvalidArgument,
            Self::ArtifactExists { .. } => ErrorKind::AlreadyExists,
            Self::NotAuthorizedToSign { .. } => ErrorKind::NotAuthorizedToSign,
            Self::SignRequest { source } if source.is_invalid_request() => {
                ErrorKind::InvalidArgument
            }
            Self::ReadCaConstraints { .. }
            | Self::GenerateKey { .. }
            | Self::CreateCertificateAuthority { .. }
            | Self::CreateRevocationList { .. }
            | Self::CreateRequest { .. }
            | Self::SignRequest { .. }
            | Self::EncodeCertificate { .. }
            | Self::EncodePrivateKey { .. } => ErrorKind::BackendFailure,
            Self::Load { source } | Self::Save { source } => source.kind(),
            Self::LoadCaCertificate { source, .. }
            | Self::Delete { source, .. }
            | Self::RecordTtl { source, .. } => source.kind(),
        }
    }
}

/// Describes one certificate, and how to create, request or sign it.
///
/// Which fields are used depends on the lifecycle operation. The subject
/// fields and `key`/`key_bits`/`passphrase` apply to [`Self::init`] and
/// [`Self::cert_request`], while `host`, `ca`, `ca_passphrase` and
/// `intermediate` only apply to [`Self::sign`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CertificateOptions {
    #[serde(rename = "cn")]
    pub common_name: String,

    #[serde(rename = "o")]
    pub organization: String,

    #[serde(rename = "ou")]
    pub organizational_unit: String,

    #[serde(rename = "c")]
    pub country: String,

    #[serde(rename = "l")]
    pub locality: String,

    #[serde(rename = "st")]
    pub province: String,

    /// IP addresses added as subject alternative names.
    #[serde(rename = "ip")]
    pub ip_addresses: Vec<String>,

    /// DNS names added as subject alternative names. The first one names the
    /// request if there is no common name.
    #[serde(rename = "dns")]
    pub domains: Vec<String>,

    /// URIs added as subject alternative names.
    #[serde(rename = "uri")]
    pub uris: Vec<String>,

    /// Path to an existing PKCS#8 or PKCS#1 PEM key. A new key with
    /// `key_bits` bits is generated if absent.
    pub key: Option<PathBuf>,

    pub key_bits: usize,

    /// Encrypts the stored private key.
    pub passphrase: Option<Passphrase>,

    /// Validity of the certificate, starting now.
    pub expires: Duration,

    /// Name of the request to sign, and of the resulting certificate.
    pub host: String,

    /// Name of the signing CA.
    pub ca: String,

    /// Decrypts the private key of the signing CA.
    pub ca_passphrase: Option<Passphrase>,

    /// Signs an intermediate CA instead of a leaf certificate.
    pub intermediate: bool,
}

impl Default for CertificateOptions {
    fn default() -> Self {
        Self {
            common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            country: String::new(),
            locality: String::new(),
            province: String::new(),
            ip_addresses: Vec::new(),
            domains: Vec::new(),
            uris: Vec::new(),
            key: None,
            key_bits: DEFAULT_KEY_BITS,
            passphrase: None,
            expires: Duration::from_days_unchecked(365),
            host: String::new(),
            ca: String::new(),
            ca_passphrase: None,
            intermediate: false,
        }
    }
}

impl CertificateOptions {
    /// Creates a self-signed CA named after the common name, storing its
    /// certificate, its key and an empty revocation list.
    #[instrument(skip(self, depot), fields(common_name = %self.common_name))]
    pub fn init(&self, depot: &Depot) -> Result<()> {
        ensure!(!self.common_name.is_empty(), MissingCommonNameSnafu);

        let name = normalize_name(&self.common_name);
        ensure_absent(depot, [Tag::certificate(&name), Tag::private_key(&name)])?;

        let key = self.load_or_generate_key()?;
        let ca = create_certificate_authority(&key, &self.subject(&self.common_name), self.expires)
            .context(CreateCertificateAuthoritySnafu)?;
        let crl = create_certificate_revocation_list(&key, &ca, self.expires)
            .context(CreateRevocationListSnafu)?;

        depot.put_certificate(&name, &ca).context(SaveSnafu)?;
        depot
            .put_private_key(&name, &key, &self.key_encryption())
            .context(SaveSnafu)?;
        depot.put_revocation_list(&name, &crl).context(SaveSnafu)?;
        depot
            .record_ttl(&name, ca.not_after())
            .context(RecordTtlSnafu { name: &name })?;

        info!(ca.name = name, "created certificate authority");
        Ok(())
    }

    /// Creates a key and a certificate signing request, stored under the
    /// sanitized [request name](Self::request_name).
    #[instrument(skip(self, depot), fields(common_name = %self.common_name))]
    pub fn cert_request(&self, depot: &Depot) -> Result<()> {
        let (common_name, alt_names) = self.validated_request()?;

        let name = sanitize_name(common_name);
        ensure_absent(
            depot,
            [Tag::certificate_request(&name), Tag::private_key(&name)],
        )?;

        let (key, request) = self.build_request(common_name, &alt_names)?;
        depot
            .put_certificate_request(&name, &request)
            .context(SaveSnafu)?;
        depot
            .put_private_key(&name, &key, &self.key_encryption())
            .context(SaveSnafu)?;

        info!(request.name = name, "created certificate signing request");
        Ok(())
    }

    /// Signs the certificate signing request stored for `host` with the key
    /// of the CA `ca`, and stores the certificate under `host`.
    ///
    /// The CA's basic constraints must mark it as a CA. Neither their
    /// criticality nor the path length are checked.
    #[instrument(skip(self, depot), fields(host = %self.host, ca = %self.ca))]
    pub fn sign(&self, depot: &Depot) -> Result<()> {
        ensure!(!self.host.is_empty(), MissingHostSnafu);
        ensure!(!self.ca.is_empty(), MissingCaSnafu);

        let host = normalize_name(&self.host);
        ensure_absent(depot, [Tag::certificate(&host)])?;

        let request = depot.get_certificate_request(&host).context(LoadSnafu)?;
        let certificate = self.sign_in_memory(depot, &request)?;

        depot
            .put_certificate(&host, &certificate)
            .context(SaveSnafu)?;
        depot
            .record_ttl(&host, certificate.not_after())
            .context(RecordTtlSnafu { name: &host })?;

        info!(
            certificate.name = host,
            certificate.intermediate = self.intermediate,
            "signed certificate"
        );
        Ok(())
    }

    /// [`Self::cert_request`] followed by [`Self::sign`]. Without a `host`,
    /// the request is signed under its request name.
    pub fn create_certificate(&self, depot: &Depot) -> Result<()> {
        self.cert_request(depot)?;
        self.with_default_host()?.sign(depot)
    }

    /// Creates the certificate if there is none yet, or replaces it if it
    /// expires within `after`. Returns whether a certificate was created.
    ///
    /// Renewal assumes a leaf certificate, CAs are not rotated this way.
    #[instrument(skip(self, depot), fields(common_name = %self.common_name))]
    pub fn create_certificate_on_expiration(&self, depot: &Depot, after: Duration) -> Result<bool> {
        let name = self.request_name()?;

        if depot.check(&Tag::certificate(name)) && !delete_on_expiration(depot, name, after)? {
            debug!("certificate is not about to expire");
            return Ok(false);
        }

        self.create_certificate(depot)?;
        Ok(true)
    }

    /// The common name, or the first domain if there is no common name.
    pub fn request_name(&self) -> Result<&str> {
        if self.common_name.is_empty() {
            self.domains
                .first()
                .map(String::as_str)
                .filter(|domain| !domain.is_empty())
                .context(MissingNameSnafu)
        } else {
            Ok(&self.common_name)
        }
    }

    /// Creates a key and signs a fresh request for it, without storing either.
    /// Returns the PEM encoded CA certificate, certificate and key.
    pub(crate) fn issue_in_memory(&self, depot: &Depot) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let (common_name, alt_names) = self.validated_request()?;
        let (key, request) = self.build_request(common_name, &alt_names)?;
        let certificate = self.sign_in_memory(depot, &request)?;

        let ca_tag = Tag::certificate(normalize_name(&self.ca));
        let ca_cert = depot
            .get(&ca_tag)
            .context(LoadCaCertificateSnafu { tag: ca_tag })?;
        let cert = certificate
            .to_pem_string()
            .context(EncodeCertificateSnafu)?;
        let key = KeyEncryption::None
            .encode(&key)
            .context(EncodePrivateKeySnafu)?;

        Ok((ca_cert, cert.into_bytes(), key.as_bytes().to_vec()))
    }

    fn sign_in_memory(&self, depot: &Depot, request: &CertReq) -> Result<Certificate> {
        ensure!(!self.ca.is_empty(), MissingCaSnafu);

        let ca_name = normalize_name(&self.ca);
        let ca_cert = depot.get_certificate(&ca_name).context(LoadSnafu)?;
        let is_ca = ca_cert
            .is_ca()
            .context(ReadCaConstraintsSnafu { ca: &ca_name })?;
        ensure!(is_ca, NotAuthorizedToSignSnafu { ca: &ca_name });

        let ca_key = depot
            .get_private_key(
                &ca_name,
                &KeyEncryption::from_passphrase(self.ca_passphrase.as_ref()),
            )
            .context(LoadSnafu)?;

        if self.intermediate {
            create_intermediate_certificate_authority(&ca_cert, &ca_key, request, self.expires)
        } else {
            create_certificate_host(&ca_cert, &ca_key, request, self.expires)
        }
        .context(SignRequestSnafu)
    }

    fn validated_request(&self) -> Result<(&str, SubjectAltNames)> {
        let common_name = self.request_name()?;

        let ips = self
            .ip_addresses
            .iter()
            .map(|ip| ip.parse::<IpAddr>().context(InvalidIpAddressSnafu { ip }))
            .collect::<Result<_>>()?;
        let uris = self
            .uris
            .iter()
            .map(|uri| Url::parse(uri).context(InvalidUriSnafu { uri }))
            .collect::<Result<_>>()?;

        Ok((
            common_name,
            SubjectAltNames {
                ips,
                dns: self.domains.clone(),
                uris,
            },
        ))
    }

    fn build_request(
        &self,
        common_name: &str,
        alt_names: &SubjectAltNames,
    ) -> Result<(PrivateKey, CertReq)> {
        let key = self.load_or_generate_key()?;
        let request =
            create_certificate_signing_request(&key, &self.subject(common_name), alt_names)
                .context(CreateRequestSnafu)?;
        Ok((key, request))
    }

    fn subject(&self, common_name: &str) -> Subject {
        Subject {
            common_name: common_name.to_owned(),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
            country: self.country.clone(),
            province: self.province.clone(),
            locality: self.locality.clone(),
        }
    }

    fn key_encryption(&self) -> KeyEncryption {
        KeyEncryption::from_passphrase(self.passphrase.as_ref())
    }

    fn load_or_generate_key(&self) -> Result<PrivateKey> {
        match &self.key {
            Some(path) => {
                let pem = std::fs::read_to_string(path).context(ReadKeyFileSnafu { path })?;
                PrivateKey::from_pem(&pem).context(ParseKeyFileSnafu { path })
            }
            None => PrivateKey::generate(self.key_bits).context(GenerateKeySnafu),
        }
    }

    fn with_default_host(&self) -> Result<Self> {
        let host = if self.host.is_empty() {
            self.request_name()?.to_owned()
        } else {
            self.host.clone()
        };
        Ok(Self {
            host,
            ..self.clone()
        })
    }
}

fn ensure_absent<const N: usize>(depot: &Depot, tags: [Tag; N]) -> Result<()> {
    for tag in tags {
        ensure!(!depot.check(&tag), ArtifactExistsSnafu { tag });
    }
    Ok(())
}

/// Deletes the certificate of `name` and its key if it expires within
/// `after`, along with its certificate signing request unless it is a CA.
/// Returns whether anything was deleted.
///
/// Certificates the backend already reports as expired are deleted as well.
#[instrument(skip(depot))]
pub fn delete_on_expiration(depot: &Depot, name: &str, after: Duration) -> Result<bool> {
    if !depot.check(&Tag::certificate(name)) {
        return Ok(false);
    }

    let is_ca = match depot.get_certificate(name) {
        Ok(certificate) => {
            if certificate.not_after() >= SystemTime::now() + after {
                return Ok(false);
            }
            certificate
                .is_ca()
                .context(ReadCaConstraintsSnafu { ca: name })?
        }
        Err(error) if error.kind() == ErrorKind::Expired => false,
        Err(error) => return Err(error).context(LoadSnafu),
    };

    let certificate = Tag::certificate(name);
    depot
        .delete(&certificate)
        .context(DeleteSnafu { tag: certificate })?;

    let mut remaining = vec![Tag::private_key(name)];
    if !is_ca {
        remaining.push(Tag::certificate_request(name));
    }
    for tag in remaining {
        match depot.delete(&tag) {
            Err(error) if error.kind() != ErrorKind::NotFound => {
                return Err(error).context(DeleteSnafu { tag });
            }
            _ => {}
        }
    }

    info!(is_ca, "deleted expiring certificate");
    Ok(true)
}

/// The `(NotBefore, NotAfter)` validity window of the certificate of `name`.
pub fn validity_bounds(depot: &Depot, name: &str) -> Result<(SystemTime, SystemTime)> {
    let certificate = depot.get_certificate(name).context(LoadSnafu)?;
    Ok((certificate.not_before(), certificate.not_after()))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use certdepot_pki::CertificateRequestExt;
    use rstest::rstest;

    use super::*;
    use crate::{
        CertificateState,
        storage::{FileStorage, RelationalStorage},
    };

    const TOLERANCE: std::time::Duration = std::time::Duration::from_secs(5);

    fn file_depot(dir: &Path) -> Depot {
        Depot::new(FileStorage::new(dir).unwrap())
    }

    fn options(common_name: &str) -> CertificateOptions {
        CertificateOptions {
            common_name: common_name.to_owned(),
            key_bits: 1024,
            expires: Duration::from_hours_unchecked(1),
            ..Default::default()
        }
    }

    fn signing(host: &str, ca: &str) -> CertificateOptions {
        CertificateOptions {
            host: host.to_owned(),
            ca: ca.to_owned(),
            ..options("")
        }
    }

    #[test]
    fn init_creates_self_signed_ca() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        options("root").init(&depot).unwrap();

        let ca = depot.get_certificate("root").unwrap();
        let now = SystemTime::now();
        assert!(ca.is_ca().unwrap());
        assert_eq!(ca.subject_common_name().as_deref(), Some("root"));
        assert_eq!(ca.issuer_common_name().as_deref(), Some("root"));
        assert!(ca.not_before() <= now && now < ca.not_after());
        assert!(ca.not_after() - *Duration::from_hours_unchecked(1) <= now);
        assert!(now - TOLERANCE <= ca.not_after() - *Duration::from_hours_unchecked(1));

        assert!(depot.check(&Tag::revocation_list("root")));
        depot.get_revocation_list("root").unwrap();
        depot.get_private_key("root", &KeyEncryption::None).unwrap();
    }

    #[test]
    fn init_twice_fails_and_keeps_the_ca() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        options("root").init(&depot).unwrap();
        let first = depot.get(&Tag::certificate("root")).unwrap();

        let error = options("root").init(&depot).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyExists);
        assert_eq!(depot.get(&Tag::certificate("root")).unwrap(), first);
    }

    #[test]
    fn init_normalizes_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        options("my root").init(&depot).unwrap();
        let ca = depot.get_certificate("my_root").unwrap();
        assert_eq!(ca.subject_common_name().as_deref(), Some("my root"));
    }

    #[test]
    fn init_requires_common_name() {
        let dir = tempfile::tempdir().unwrap();
        let error = options("").init(&file_depot(dir.path())).unwrap_err();
        assert!(matches!(error, Error::MissingCommonName));
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn init_with_encrypted_key_and_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(&dir.path().join("depot"));

        let key = PrivateKey::generate(1024).unwrap();
        let key_file = dir.path().join("root.pem");
        std::fs::write(&key_file, key.to_pem().unwrap().as_bytes()).unwrap();

        let passphrase = Passphrase::new("hunter2");
        CertificateOptions {
            key: Some(key_file),
            passphrase: Some(passphrase.clone()),
            ..options("root")
        }
        .init(&depot)
        .unwrap();

        let stored = depot
            .get_private_key("root", &KeyEncryption::Passphrase(passphrase))
            .unwrap();
        assert_eq!(stored, key);
        assert!(depot.get_private_key("root", &KeyEncryption::None).is_err());
    }

    #[test]
    fn init_records_ttl() {
        let depot =
            Depot::with_expiration(RelationalStorage::new(None, "certs", TOLERANCE).unwrap());
        options("root").init(&depot).unwrap();

        let (_, not_after) = validity_bounds(&depot, "root").unwrap();
        assert_eq!(depot.expiration().unwrap().get_ttl("root").unwrap(), not_after);
    }

    #[rstest]
    #[case("svc", &[], "svc")]
    #[case("", &["svc.example.com", "svc"], "svc.example.com")]
    #[case("svc host/1", &[], "svc_host_1")]
    fn cert_request_names(
        #[case] common_name: &str,
        #[case] domains: &[&str],
        #[case] stored_as: &str,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        CertificateOptions {
            domains: domains.iter().map(ToString::to_string).collect(),
            ..options(common_name)
        }
        .cert_request(&depot)
        .unwrap();

        assert_eq!(depot.certificate_state(stored_as), CertificateState::Requested);
        assert!(depot.check(&Tag::private_key(stored_as)));
    }

    #[rstest]
    #[case(options(""), ErrorKind::InvalidArgument)]
    #[case(CertificateOptions { ip_addresses: vec!["300.1.2.3".to_owned()], ..options("svc") }, ErrorKind::InvalidArgument)]
    #[case(CertificateOptions { uris: vec!["not a uri".to_owned()], ..options("svc") }, ErrorKind::InvalidArgument)]
    fn cert_request_rejects_invalid_options(
        #[case] invalid: CertificateOptions,
        #[case] expected: ErrorKind,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        assert_eq!(invalid.cert_request(&depot).unwrap_err().kind(), expected);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn cert_request_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        options("svc").cert_request(&depot).unwrap();
        let request = depot.get(&Tag::certificate_request("svc")).unwrap();

        let error = options("svc").cert_request(&depot).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::AlreadyExists);
        assert_eq!(depot.get(&Tag::certificate_request("svc")).unwrap(), request);
    }

    #[test]
    fn sign_copies_alt_names() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();

        CertificateOptions {
            ip_addresses: vec!["127.0.0.1".to_owned()],
            domains: vec!["svc.example.com".to_owned()],
            uris: vec!["spiffe://example.com/svc".to_owned()],
            ..options("svc")
        }
        .cert_request(&depot)
        .unwrap();
        signing("svc", "root").sign(&depot).unwrap();

        let certificate = depot.get_certificate("svc").unwrap();
        assert!(!certificate.is_ca().unwrap());
        assert_eq!(certificate.issuer_common_name().as_deref(), Some("root"));

        let alt_names = certificate.subject_alt_names().unwrap();
        assert_eq!(alt_names.ips, ["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(alt_names.dns, ["svc.example.com"]);
        assert_eq!(alt_names.uris[0].as_str(), "spiffe://example.com/svc");
        assert_eq!(depot.certificate_state("svc"), CertificateState::Signed);
    }

    #[rstest]
    #[case(signing("", "root"))]
    #[case(signing("svc", ""))]
    fn sign_requires_host_and_ca(#[case] incomplete: CertificateOptions) {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            incomplete.sign(&file_depot(dir.path())).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn sign_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();
        options("svc").cert_request(&depot).unwrap();

        signing("svc", "root").sign(&depot).unwrap();
        let error = signing("svc", "root").sign(&depot).unwrap_err();
        assert!(matches!(error, Error::ArtifactExists { .. }));
    }

    #[test]
    fn sign_without_request() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();

        let error = signing("svc", "root").sign(&depot).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn only_cas_may_sign() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();
        CertificateOptions {
            ca: "root".to_owned(),
            ..options("leaf")
        }
        .create_certificate(&depot)
        .unwrap();
        options("svc").cert_request(&depot).unwrap();

        let error = signing("svc", "leaf").sign(&depot).unwrap_err();
        assert!(matches!(&error, Error::NotAuthorizedToSign { ca } if ca == "leaf"));
        assert_eq!(error.kind(), ErrorKind::NotAuthorizedToSign);

        signing("svc", "root").sign(&depot).unwrap();
    }

    #[test]
    fn intermediate_ca_signs_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();

        options("intermediate").cert_request(&depot).unwrap();
        CertificateOptions {
            intermediate: true,
            ..signing("intermediate", "root")
        }
        .sign(&depot)
        .unwrap();
        assert!(depot.get_certificate("intermediate").unwrap().is_ca().unwrap());

        options("svc").cert_request(&depot).unwrap();
        signing("svc", "intermediate").sign(&depot).unwrap();
        assert_eq!(
            depot
                .get_certificate("svc")
                .unwrap()
                .issuer_common_name()
                .as_deref(),
            Some("intermediate")
        );
    }

    #[test]
    fn sign_with_encrypted_ca_key() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        let passphrase = Passphrase::new("hunter2");
        CertificateOptions {
            passphrase: Some(passphrase.clone()),
            ..options("root")
        }
        .init(&depot)
        .unwrap();
        options("svc").cert_request(&depot).unwrap();

        let error = signing("svc", "root").sign(&depot).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);

        CertificateOptions {
            ca_passphrase: Some(passphrase),
            ..signing("svc", "root")
        }
        .sign(&depot)
        .unwrap();
    }

    #[test]
    fn tampered_request_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();
        options("svc").cert_request(&depot).unwrap();

        // Swap the requested subject, invalidating the request's signature
        let mut request = depot.get_certificate_request("svc").unwrap();
        request.info.subject = Subject::with_common_name("mallory").to_name().unwrap();
        depot.delete(&Tag::certificate_request("svc")).unwrap();
        depot
            .put(
                &Tag::certificate_request("svc"),
                request.to_pem_string().unwrap().as_bytes(),
            )
            .unwrap();

        let error = signing("svc", "root").sign(&depot).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
        assert!(!depot.check(&Tag::certificate("svc")));
    }

    #[test]
    fn delete_on_expiration_respects_window() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        CertificateOptions {
            expires: Duration::from_hours_unchecked(4),
            ..options("root")
        }
        .init(&depot)
        .unwrap();

        // Expires in 1h
        CertificateOptions {
            ca: "root".to_owned(),
            ..options("svc")
        }
        .create_certificate(&depot)
        .unwrap();
        // Expires in 3h
        CertificateOptions {
            ca: "root".to_owned(),
            expires: Duration::from_hours_unchecked(3),
            ..options("db")
        }
        .create_certificate(&depot)
        .unwrap();

        let within = Duration::from_hours_unchecked(2);
        assert!(delete_on_expiration(&depot, "svc", within).unwrap());
        assert_eq!(depot.certificate_state("svc"), CertificateState::Unissued);
        assert!(!depot.check(&Tag::private_key("svc")));

        assert!(!delete_on_expiration(&depot, "db", within).unwrap());
        assert!(depot.check(&Tag::certificate("db")));

        // Nothing to delete
        assert!(!delete_on_expiration(&depot, "svc", within).unwrap());
    }

    #[test]
    fn delete_on_expiration_keeps_nothing_of_a_ca_but_its_crl() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        options("root").init(&depot).unwrap();

        assert!(delete_on_expiration(&depot, "root", Duration::from_hours_unchecked(2)).unwrap());
        assert!(!depot.check(&Tag::certificate("root")));
        assert!(!depot.check(&Tag::private_key("root")));
        assert!(depot.check(&Tag::revocation_list("root")));
    }

    #[test]
    fn create_certificate_on_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());
        CertificateOptions {
            expires: Duration::from_hours_unchecked(4),
            ..options("root")
        }
        .init(&depot)
        .unwrap();

        let svc = CertificateOptions {
            ca: "root".to_owned(),
            ..options("svc")
        };
        let within = Duration::from_hours_unchecked(2);

        // No certificate yet
        assert!(svc.create_certificate_on_expiration(&depot, within).unwrap());
        let first = depot.get(&Tag::certificate("svc")).unwrap();

        // Expires within the window, so it is replaced
        assert!(svc.create_certificate_on_expiration(&depot, within).unwrap());
        let second = depot.get(&Tag::certificate("svc")).unwrap();
        assert_ne!(first, second);

        // Outside of the window
        let short = Duration::from_minutes_unchecked(30);
        assert!(!svc.create_certificate_on_expiration(&depot, short).unwrap());
        assert_eq!(depot.get(&Tag::certificate("svc")).unwrap(), second);
    }

    #[test]
    fn deserialize_short_keys() {
        let options: CertificateOptions = serde_yaml::from_str(
            "
            cn: svc
            o: Depot Inc.
            dns: [svc.example.com]
            ip: [10.0.0.1]
            expires: 30d
            host: svc
            ca: root
            intermediate: true
            ",
        )
        .unwrap();

        assert_eq!(options.common_name, "svc");
        assert_eq!(options.organization, "Depot Inc.");
        assert_eq!(options.domains, ["svc.example.com"]);
        assert_eq!(options.ip_addresses, ["10.0.0.1"]);
        assert_eq!(options.expires, Duration::from_days_unchecked(30));
        assert_eq!(options.key_bits, DEFAULT_KEY_BITS);
        assert!(options.intermediate);
    }

    #[test]
    fn csr_subject_uses_request_name() {
        let dir = tempfile::tempdir().unwrap();
        let depot = file_depot(dir.path());

        CertificateOptions {
            domains: vec!["svc.example.com".to_owned()],
            organization: "Depot Inc.".to_owned(),
            ..options("")
        }
        .cert_request(&depot)
        .unwrap();

        let request = depot.get_certificate_request("svc.example.com").unwrap();
        assert_eq!(
            request.subject_common_name().as_deref(),
            Some("svc.example.com")
        );
    }
}
