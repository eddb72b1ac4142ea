//! PEM conversion and field extraction for certificates and revocation lists.
use std::time::SystemTime;

use const_oid::db::{
    rfc4519::CN,
    rfc5280::{ID_CE_BASIC_CONSTRAINTS, ID_CE_SUBJECT_ALT_NAME},
};
use snafu::{ResultExt, Snafu};
use x509_cert::{
    Certificate,
    crl::CertificateList,
    der::{
        Decode, DecodePem, Encode, EncodePem,
        asn1::{Ia5StringRef, PrintableStringRef, Utf8StringRef},
        pem,
    },
    ext::pkix::{BasicConstraints, SubjectAltName},
    name::Name,
};

use crate::{PEM_LINE_ENDING, subject::SubjectAltNames};

const CRL_PEM_LABEL: &str = "X509 CRL";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode certificate from PEM"))]
    DecodeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to encode certificate as PEM"))]
    EncodeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to decode {extension} extension"))]
    DecodeExtension {
        source: x509_cert::der::Error,
        extension: &'static str,
    },

    #[snafu(display("failed to encode revocation list as DER"))]
    EncodeRevocationList { source: x509_cert::der::Error },

    #[snafu(display("failed to convert revocation list between DER and PEM"))]
    RevocationListPem { source: x509_cert::der::Error },

    #[snafu(display("expected a PEM block labeled {CRL_PEM_LABEL:?}, found {label:?}"))]
    UnexpectedPemLabel { label: String },

    #[snafu(display("failed to decode revocation list from DER"))]
    DecodeRevocationList { source: x509_cert::der::Error },
}

/// Convenience accessors on [`Certificate`].
pub trait CertificateExt: Sized {
    fn from_pem_bytes(pem: &[u8]) -> Result<Self>;

    fn to_pem_string(&self) -> Result<String>;

    fn not_before(&self) -> SystemTime;

    fn not_after(&self) -> SystemTime;

    /// Whether the basic constraints extension marks the certificate as a
    /// CA. Neither criticality nor the path length are inspected.
    fn is_ca(&self) -> Result<bool>;

    /// The first common name of the subject, if any.
    fn subject_common_name(&self) -> Option<String>;

    /// The first common name of the issuer, if any.
    fn issuer_common_name(&self) -> Option<String>;

    fn subject_alt_names(&self) -> Result<SubjectAltNames>;
}

impl CertificateExt for Certificate {
    fn from_pem_bytes(pem: &[u8]) -> Result<Self> {
        Self::from_pem(pem).context(DecodeCertificateSnafu)
    }

    fn to_pem_string(&self) -> Result<String> {
        self.to_pem(PEM_LINE_ENDING)
            .context(EncodeCertificateSnafu)
    }

    fn not_before(&self) -> SystemTime {
        self.tbs_certificate.validity.not_before.to_system_time()
    }

    fn not_after(&self) -> SystemTime {
        self.tbs_certificate.validity.not_after.to_system_time()
    }

    fn is_ca(&self) -> Result<bool> {
        let Some(extension) = self
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .find(|extension| extension.extn_id == ID_CE_BASIC_CONSTRAINTS)
        else {
            return Ok(false);
        };

        let constraints = BasicConstraints::from_der(extension.extn_value.as_bytes()).context(
            DecodeExtensionSnafu {
                extension: "BasicConstraints",
            },
        )?;
        Ok(constraints.ca)
    }

    fn subject_common_name(&self) -> Option<String> {
        common_name(&self.tbs_certificate.subject)
    }

    fn issuer_common_name(&self) -> Option<String> {
        common_name(&self.tbs_certificate.issuer)
    }

    fn subject_alt_names(&self) -> Result<SubjectAltNames> {
        let Some(extension) = self
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .find(|extension| extension.extn_id == ID_CE_SUBJECT_ALT_NAME)
        else {
            return Ok(SubjectAltNames::default());
        };

        let san = SubjectAltName::from_der(extension.extn_value.as_bytes()).context(
            DecodeExtensionSnafu {
                extension: "SubjectAltName",
            },
        )?;
        Ok(SubjectAltNames::from_extension(&san))
    }
}

/// Returns the first common name attribute of `name`, decoded from any of
/// the string types commonly used for it.
pub fn common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(|atv| atv.oid == CN)
        .find_map(|atv| {
            Utf8StringRef::try_from(&atv.value)
                .map(|s| s.as_str().to_owned())
                .or_else(|_| PrintableStringRef::try_from(&atv.value).map(|s| s.as_str().to_owned()))
                .or_else(|_| Ia5StringRef::try_from(&atv.value).map(|s| s.as_str().to_owned()))
                .ok()
        })
}

/// PEM conversion for [`CertificateList`], which has no PEM label of its own.
pub trait RevocationListPem: Sized {
    fn from_pem_bytes(pem: &[u8]) -> Result<Self>;

    fn to_pem_string(&self) -> Result<String>;
}

impl RevocationListPem for CertificateList {
    fn from_pem_bytes(pem: &[u8]) -> Result<Self> {
        let (label, der) = pem::decode_vec(pem)
            .map_err(x509_cert::der::Error::from)
            .context(RevocationListPemSnafu)?;
        snafu::ensure!(label == CRL_PEM_LABEL, UnexpectedPemLabelSnafu { label });

        Self::from_der(&der).context(DecodeRevocationListSnafu)
    }

    fn to_pem_string(&self) -> Result<String> {
        let der = self.to_der().context(EncodeRevocationListSnafu)?;
        pem::encode_string(CRL_PEM_LABEL, PEM_LINE_ENDING, &der)
            .map_err(x509_cert::der::Error::from)
            .context(RevocationListPemSnafu)
    }
}
