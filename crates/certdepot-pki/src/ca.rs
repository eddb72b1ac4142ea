//! Contains functions to create self-signed certificate authorities (CAs) and
//! the (empty) certificate revocation lists they publish.
use certdepot_shared::time::Duration;
use rsa::pkcs1v15;
use signature::{SignatureEncoding, Signer};
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    Certificate, Version,
    builder::{Builder, CertificateBuilder, Profile},
    crl::{CertificateList, TbsCertList},
    der::{Encode, asn1::BitString, referenced::OwnedToRef},
    ext::pkix::AuthorityKeyIdentifier,
    serial_number::SerialNumber,
    spki::DynSignatureAlgorithmIdentifier,
    time::Validity,
};

use crate::{keys, keys::PrivateKey, subject, subject::Subject};

/// Defines all error variants which can occur when creating a CA or its CRL.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse validity"))]
    ParseValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to build subject"))]
    BuildSubject { source: subject::Error },

    #[snafu(display("failed to retrieve subject public key info"))]
    RetrieveSpki { source: keys::Error },

    #[snafu(display("failed to parse AuthorityKeyIdentifier"))]
    ParseAuthorityKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: x509_cert::builder::Error },

    #[snafu(display("failed to determine signature algorithm"))]
    SignatureAlgorithm { source: x509_cert::spki::Error },

    #[snafu(display("failed to encode revocation list for signing"))]
    EncodeRevocationList { source: x509_cert::der::Error },

    #[snafu(display("failed to sign revocation list"))]
    SignRevocationList { source: signature::Error },

    #[snafu(display("failed to encode revocation list signature"))]
    EncodeSignature { source: x509_cert::der::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates a self-signed CA certificate for `subject`, valid from now for
/// `validity`, signed by (and binding) `key`.
///
/// The root profile adds these extensions:
///
/// - BasicConstraints marked as critical and CA = true
/// - SubjectKeyIdentifier with the 160-bit SHA-1 hash of the subject
///   public key.
/// - KeyUsage with KeyCertSign and CRLSign bits set.
///
/// The AuthorityKeyIdentifier is added manually, using the same 160-bit
/// SHA-1 hash of the public key (RFC 5280, section 4.2.1.2).
#[instrument(
    name = "create_certificate_authority",
    skip(key),
    fields(subject = %subject.to_rfc4514()),
)]
pub fn create_certificate_authority(
    key: &PrivateKey,
    subject: &Subject,
    validity: Duration,
) -> Result<Certificate> {
    let validity = Validity::from_now(*validity).context(ParseValiditySnafu)?;
    let subject = subject.to_name().context(BuildSubjectSnafu)?;

    // By choosing a random serial number we can make the reasonable assumption that we generate
    // a unique serial for each CA.
    let serial_number = SerialNumber::from(rand::random::<u64>());
    let spki = key.subject_public_key_info().context(RetrieveSpkiSnafu)?;
    let aki = AuthorityKeyIdentifier::try_from(spki.owned_to_ref())
        .context(ParseAuthorityKeyIdentifierSnafu)?;

    debug!(
        ca.subject = %subject,
        ca.not_after = %validity.not_after,
        ca.not_before = %validity.not_before,
        ca.serial = %serial_number,
        ca.public_key.size = key.bits(),
        "creating certificate authority"
    );
    let mut builder = CertificateBuilder::new(
        Profile::Root,
        serial_number,
        validity,
        subject,
        spki,
        key.signing_key(),
    )
    .context(CreateCertificateBuilderSnafu)?;

    builder
        .add_extension(&aki)
        .context(AddCertificateExtensionSnafu)?;

    builder
        .build::<pkcs1v15::Signature>()
        .context(BuildCertificateSnafu)
}

/// Creates an empty CRL issued by `ca_cert`, whose next update is due after
/// `validity`.
#[instrument(name = "create_certificate_revocation_list", skip_all)]
pub fn create_certificate_revocation_list(
    key: &PrivateKey,
    ca_cert: &Certificate,
    validity: Duration,
) -> Result<CertificateList> {
    let window = Validity::from_now(*validity).context(ParseValiditySnafu)?;
    let signature_algorithm = key
        .signing_key()
        .signature_algorithm_identifier()
        .context(SignatureAlgorithmSnafu)?;

    let tbs_cert_list = TbsCertList {
        version: Version::V2,
        signature: signature_algorithm.clone(),
        issuer: ca_cert.tbs_certificate.subject.clone(),
        this_update: window.not_before,
        next_update: Some(window.not_after),
        revoked_certificates: None,
        crl_extensions: None,
    };

    let tbs_der = tbs_cert_list
        .to_der()
        .context(EncodeRevocationListSnafu)?;
    let signature: pkcs1v15::Signature = key
        .signing_key()
        .try_sign(&tbs_der)
        .context(SignRevocationListSnafu)?;
    let signature =
        BitString::from_bytes(&signature.to_vec()).context(EncodeSignatureSnafu)?;

    debug!(
        crl.issuer = %tbs_cert_list.issuer,
        crl.next_update = %window.not_after,
        "created empty certificate revocation list"
    );
    Ok(CertificateList {
        tbs_cert_list,
        signature_algorithm,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use signature::Verifier;

    use super::*;
    use crate::{CertificateExt, RevocationListPem};

    #[test]
    fn self_signed_ca() {
        let key = PrivateKey::generate(1024).unwrap();
        let ca = create_certificate_authority(
            &key,
            &Subject::with_common_name("root"),
            Duration::from_days_unchecked(13),
        )
        .expect("failed to build CA");

        let tbs = &ca.tbs_certificate;
        assert_eq!(tbs.subject, "CN=root".parse().unwrap());
        assert_eq!(tbs.issuer, tbs.subject);
        assert!(ca.is_ca().unwrap());
        assert_eq!(
            ca.not_after().duration_since(ca.not_before()).unwrap(),
            *Duration::from_days_unchecked(13)
        );

        let signature =
            pkcs1v15::Signature::try_from(ca.signature.raw_bytes()).expect("signature");
        key.verifying_key()
            .verify(&tbs.to_der().unwrap(), &signature)
            .expect("CA must be self-signed");
    }

    #[test]
    fn empty_crl() {
        let key = PrivateKey::generate(1024).unwrap();
        let ca = create_certificate_authority(
            &key,
            &Subject::with_common_name("root"),
            Duration::from_hours_unchecked(1),
        )
        .unwrap();

        let crl = create_certificate_revocation_list(&key, &ca, Duration::from_hours_unchecked(1))
            .unwrap();
        assert_eq!(crl.tbs_cert_list.issuer, ca.tbs_certificate.subject);
        assert!(crl.tbs_cert_list.revoked_certificates.is_none());

        let pem = crl.to_pem_string().unwrap();
        assert!(pem.starts_with("-----BEGIN X509 CRL-----"));
        assert_eq!(CertificateList::from_pem_bytes(pem.as_bytes()).unwrap(), crl);
    }
}
