//! Certificate signing requests (CSRs, PKCS#10).
use const_oid::db::{rfc5280::ID_CE_SUBJECT_ALT_NAME, rfc5912::ID_EXTENSION_REQ};
use rsa::{RsaPublicKey, pkcs1v15};
use sha2::Sha256;
use signature::Verifier;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, RequestBuilder},
    der::{Decode, DecodePem, Encode, EncodePem, referenced::OwnedToRef},
    ext::pkix::SubjectAltName,
    request::{CertReq, ExtensionReq},
};

use crate::{
    PEM_LINE_ENDING, certificate::common_name, keys::PrivateKey, subject,
    subject::{Subject, SubjectAltNames},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build subject"))]
    BuildSubject { source: subject::Error },

    #[snafu(display("failed to build subject alternative names"))]
    BuildSubjectAltNames { source: subject::Error },

    #[snafu(display("failed to create request builder"))]
    CreateRequestBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add request extension"))]
    AddRequestExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to build certificate signing request"))]
    BuildRequest { source: x509_cert::builder::Error },

    #[snafu(display("failed to decode certificate signing request from PEM"))]
    DecodeRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to encode certificate signing request as PEM"))]
    EncodeRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to decode requested extensions"))]
    DecodeExtensions { source: x509_cert::der::Error },

    #[snafu(display("requested public key is not an RSA key"))]
    UnsupportedPublicKey { source: x509_cert::spki::Error },

    #[snafu(display("certificate signing request signature is malformed"))]
    MalformedSignature { source: signature::Error },

    #[snafu(display("certificate signing request signature does not match its public key"))]
    InvalidSignature { source: signature::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates a CSR for `subject` bound to `key`. The SAN extension is only
/// requested when `alt_names` is non-empty.
#[instrument(
    name = "create_certificate_signing_request",
    skip(key),
    fields(subject = %subject.to_rfc4514()),
)]
pub fn create_certificate_signing_request(
    key: &PrivateKey,
    subject: &Subject,
    alt_names: &SubjectAltNames,
) -> Result<CertReq> {
    let name = subject.to_name().context(BuildSubjectSnafu)?;

    debug!(
        request.subject = %name,
        request.san.dns_names = ?alt_names.dns,
        request.san.ip_addresses = ?alt_names.ips,
        request.san.uris = ?alt_names.uris,
        request.public_key.size = key.bits(),
        "creating certificate signing request"
    );
    let mut builder =
        RequestBuilder::new(name, key.signing_key()).context(CreateRequestBuilderSnafu)?;

    if !alt_names.is_empty() {
        let extension = alt_names
            .to_extension()
            .context(BuildSubjectAltNamesSnafu)?;
        builder
            .add_extension(&extension)
            .context(AddRequestExtensionSnafu)?;
    }

    builder
        .build::<pkcs1v15::Signature>()
        .context(BuildRequestSnafu)
}

/// Convenience accessors on [`CertReq`].
pub trait CertificateRequestExt: Sized {
    fn from_pem_bytes(pem: &[u8]) -> Result<Self>;

    fn to_pem_string(&self) -> Result<String>;

    fn subject_common_name(&self) -> Option<String>;

    /// The subject alternative names carried in the extension request
    /// attribute.
    fn subject_alt_names(&self) -> Result<Option<SubjectAltName>>;

    /// Checks that the request is signed by the key it requests a
    /// certificate for.
    fn verify_signature(&self) -> Result<()>;
}

impl CertificateRequestExt for CertReq {
    fn from_pem_bytes(pem: &[u8]) -> Result<Self> {
        Self::from_pem(pem).context(DecodeRequestSnafu)
    }

    fn to_pem_string(&self) -> Result<String> {
        self.to_pem(PEM_LINE_ENDING).context(EncodeRequestSnafu)
    }

    fn subject_common_name(&self) -> Option<String> {
        common_name(&self.info.subject)
    }

    fn subject_alt_names(&self) -> Result<Option<SubjectAltName>> {
        for attribute in self.info.attributes.iter() {
            if attribute.oid != ID_EXTENSION_REQ {
                continue;
            }

            for value in attribute.values.iter() {
                let requested: ExtensionReq = value.decode_as().context(DecodeExtensionsSnafu)?;
                if let Some(extension) = requested
                    .0
                    .iter()
                    .find(|extension| extension.extn_id == ID_CE_SUBJECT_ALT_NAME)
                {
                    let san = SubjectAltName::from_der(extension.extn_value.as_bytes())
                        .context(DecodeExtensionsSnafu)?;
                    return Ok(Some(san));
                }
            }
        }

        Ok(None)
    }

    fn verify_signature(&self) -> Result<()> {
        let public_key = RsaPublicKey::try_from(self.info.public_key.owned_to_ref())
            .context(UnsupportedPublicKeySnafu)?;
        let verifying_key = pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

        let message = self.info.to_der().context(EncodeRequestSnafu)?;
        let signature = pkcs1v15::Signature::try_from(self.signature.raw_bytes())
            .context(MalformedSignatureSnafu)?;

        verifying_key
            .verify(&message, &signature)
            .context(InvalidSignatureSnafu)
    }
}
