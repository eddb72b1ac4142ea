//! Issues certificates from certificate signing requests.
use certdepot_shared::time::Duration;
use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use rsa::pkcs1v15;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument, warn};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    ext::pkix::ExtendedKeyUsage,
    request::CertReq,
    serial_number::SerialNumber,
    time::Validity,
};

use crate::{certificate::CertificateExt, keys::PrivateKey, request, request::CertificateRequestExt};

/// Defines all error variants which can occur when signing a certificate
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to verify the certificate signing request"))]
    VerifyRequest { source: request::Error },

    #[snafu(display("failed to read requested subject alternative names"))]
    ReadSubjectAltNames { source: request::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },
}

impl Error {
    /// Whether the error was caused by the request rather than the signer.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::VerifyRequest { .. } | Self::ReadSubjectAltNames { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Signs `csr` with the CA key, producing a leaf certificate valid from now
/// for `validity`.
///
/// The leaf certificate can be used for WWW client and server
/// authentication, because it includes [`ID_KP_CLIENT_AUTH`] and
/// [`ID_KP_SERVER_AUTH`] in the extended key usage extension. Subject
/// alternative names requested in the CSR are copied into the certificate.
#[instrument(name = "create_certificate_host", skip_all)]
pub fn create_certificate_host(
    ca_cert: &Certificate,
    ca_key: &PrivateKey,
    csr: &CertReq,
    validity: Duration,
) -> Result<Certificate> {
    let profile = Profile::Leaf {
        issuer: ca_cert.tbs_certificate.subject.clone(),
        enable_key_agreement: false,
        enable_key_encipherment: true,
    };

    sign_request(ca_cert, ca_key, csr, validity, profile)
}

/// Signs `csr` with the CA key, producing an intermediate CA certificate which
/// may sign leaf certificates but no further CAs.
#[instrument(name = "create_intermediate_certificate_authority", skip_all)]
pub fn create_intermediate_certificate_authority(
    ca_cert: &Certificate,
    ca_key: &PrivateKey,
    csr: &CertReq,
    validity: Duration,
) -> Result<Certificate> {
    let profile = Profile::SubCA {
        issuer: ca_cert.tbs_certificate.subject.clone(),
        path_len_constraint: Some(0),
    };

    sign_request(ca_cert, ca_key, csr, validity, profile)
}

fn sign_request(
    ca_cert: &Certificate,
    ca_key: &PrivateKey,
    csr: &CertReq,
    validity: Duration,
    profile: Profile,
) -> Result<Certificate> {
    csr.verify_signature().context(VerifyRequestSnafu)?;

    let validity = Validity::from_now(*validity).context(ParseValiditySnafu)?;
    let is_leaf = matches!(profile, Profile::Leaf { .. });
    let subject = csr.info.subject.clone();

    // By choosing a random serial number we can make the reasonable assumption that we generate
    // a unique serial for each certificate.
    let serial_number = SerialNumber::from(rand::random::<u64>());

    let cert_not_after = validity.not_after.to_system_time();
    if cert_not_after > ca_cert.not_after() {
        warn!(
            certificate.subject = %subject,
            certificate.not_after = %validity.not_after,
            ca.not_after = %ca_cert.tbs_certificate.validity.not_after,
            "the signed certificate outlives its CA"
        );
    }

    let alt_names = csr
        .subject_alt_names()
        .context(ReadSubjectAltNamesSnafu)?;

    debug!(
        certificate.subject = %subject,
        certificate.not_after = %validity.not_after,
        certificate.not_before = %validity.not_before,
        certificate.serial = %serial_number,
        certificate.intermediate = !is_leaf,
        certificate.signed_by.issuer = %ca_cert.tbs_certificate.subject,
        "signing certificate signing request"
    );
    let mut builder = CertificateBuilder::new(
        profile,
        serial_number,
        validity,
        subject,
        csr.info.public_key.clone(),
        ca_key.signing_key(),
    )
    .context(CreateCertificateBuilderSnafu)?;

    if is_leaf {
        builder
            .add_extension(&ExtendedKeyUsage(vec![
                ID_KP_CLIENT_AUTH,
                ID_KP_SERVER_AUTH,
            ]))
            .context(AddCertificateExtensionSnafu)?;
    }

    if let Some(alt_names) = alt_names {
        builder
            .add_extension(&alt_names)
            .context(AddCertificateExtensionSnafu)?;
    }

    builder
        .build::<pkcs1v15::Signature>()
        .context(BuildCertificateSnafu)
}
