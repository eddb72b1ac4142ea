//! This crate provides the X.509 primitives a certificate depot is built on.
//! It can create RSA keys, self-signed certificate authorities (CAs),
//! certificate signing requests (CSRs), certificates signed from a CSR (both
//! leaf and intermediate CA certificates) and empty certificate revocation
//! lists (CRLs). Every artifact can be exported to and imported from PEM.
//!
//! All certificates are signed with RSA PKCS#1 v1.5 and SHA-256.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://datatracker.ietf.org/doc/html/rfc2986>
//! - <https://datatracker.ietf.org/doc/html/rfc4514>
use x509_cert::der::pem::LineEnding;

pub mod ca;
pub mod certificate;
pub mod keys;
pub mod request;
pub mod sign;
pub mod subject;

pub use ca::{create_certificate_authority, create_certificate_revocation_list};
pub use certificate::{CertificateExt, RevocationListPem};
pub use keys::PrivateKey;
pub use request::{CertificateRequestExt, create_certificate_signing_request};
pub use sign::{create_certificate_host, create_intermediate_certificate_authority};
pub use subject::{Subject, SubjectAltNames};
pub use x509_cert::{Certificate, crl::CertificateList, request::CertReq};

/// The line ending used for every PEM document produced by this crate.
pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;
