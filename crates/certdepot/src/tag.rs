//! Addressing of stored artifacts.
use std::fmt::Display;

/// The kinds of artifacts a depot stores per entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ArtifactKind {
    #[strum(serialize = "certificate")]
    Certificate,

    #[strum(serialize = "private key")]
    PrivateKey,

    #[strum(serialize = "certificate signing request")]
    CertificateRequest,

    #[strum(serialize = "certificate revocation list")]
    RevocationList,
}

impl ArtifactKind {
    /// The file extension used by file based backends.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Certificate => "crt",
            Self::PrivateKey => "key",
            Self::CertificateRequest => "csr",
            Self::RevocationList => "crl",
        }
    }

    /// The field (or column) name used by record based backends.
    pub const fn field(self) -> &'static str {
        match self {
            Self::Certificate => "cert",
            Self::PrivateKey => "private_key",
            Self::CertificateRequest => "cert_req",
            Self::RevocationList => "cert_revoc_list",
        }
    }

    /// Whether reads of this kind honor the record's TTL.
    pub const fn expires(self) -> bool {
        matches!(self, Self::Certificate | Self::RevocationList)
    }
}

/// Identifies at most one stored artifact: the artifact of `kind` belonging
/// to the entity `name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    name: String,
    kind: ArtifactKind,
}

impl Tag {
    pub fn new(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn certificate(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactKind::Certificate)
    }

    pub fn private_key(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactKind::PrivateKey)
    }

    pub fn certificate_request(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactKind::CertificateRequest)
    }

    pub fn revocation_list(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactKind::RevocationList)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// The identifier backends store the entity under.
    pub fn entity_id(&self) -> String {
        sanitize_name(&self.name)
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {:?}", self.kind, self.name)
    }
}

/// Replaces every character outside of `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Replaces spaces with `_`.
pub fn normalize_name(name: &str) -> String {
    name.replace(' ', "_")
}
