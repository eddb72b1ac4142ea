//! Subject distinguished names and subject alternative names.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use snafu::{ResultExt, Snafu};
use url::Url;
use x509_cert::{
    der::asn1::Ia5String,
    ext::pkix::{SubjectAltName, name::GeneralName},
    name::Name,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse {subject:?} as subject"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to encode subject alternative name {value:?} as IA5 string"))]
    EncodeSubjectAltName {
        source: x509_cert::der::Error,
        value: String,
    },
}

/// The distinguished name fields a certificate or request is issued for.
/// Empty fields are left out of the resulting [`Name`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub province: String,
    pub locality: String,
}

impl Subject {
    pub fn with_common_name(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    /// Renders the subject as an RFC 4514 string, most specific attribute
    /// first.
    pub fn to_rfc4514(&self) -> String {
        [
            ("CN", &self.common_name),
            ("OU", &self.organizational_unit),
            ("O", &self.organization),
            ("L", &self.locality),
            ("ST", &self.province),
            ("C", &self.country),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(attribute, value)| format!("{attribute}={}", escape(value)))
        .collect::<Vec<_>>()
        .join(",")
    }

    pub fn to_name(&self) -> Result<Name> {
        let subject = self.to_rfc4514();
        if subject.is_empty() {
            return Ok(Name::default());
        }

        subject.parse().context(ParseSubjectSnafu { subject })
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0 && (c == '#' || c == ' ');
        if leading || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Subject alternative names, as requested in a CSR and carried over into
/// the signed certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectAltNames {
    pub ips: Vec<IpAddr>,
    pub dns: Vec<String>,
    pub uris: Vec<Url>,
}

impl SubjectAltNames {
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.dns.is_empty() && self.uris.is_empty()
    }

    pub fn to_extension(&self) -> Result<SubjectAltName> {
        let dns = self.dns.iter().map(|name| {
            Ia5String::new(name)
                .map(GeneralName::DnsName)
                .context(EncodeSubjectAltNameSnafu { value: name })
        });
        let uris = self.uris.iter().map(|uri| {
            Ia5String::new(uri.as_str())
                .map(GeneralName::UniformResourceIdentifier)
                .context(EncodeSubjectAltNameSnafu {
                    value: uri.as_str(),
                })
        });
        let ips = self.ips.iter().copied().map(GeneralName::from).map(Ok);

        Ok(SubjectAltName(dns.chain(ips).chain(uris).collect::<Result<_>>()?))
    }

    /// Collects the IP, DNS and URI entries of a SAN extension. Other name
    /// forms and malformed entries are skipped.
    pub fn from_extension(extension: &SubjectAltName) -> Self {
        let mut names = Self::default();
        for name in &extension.0 {
            match name {
                GeneralName::DnsName(dns) => names.dns.push(dns.as_str().to_owned()),
                GeneralName::UniformResourceIdentifier(uri) => {
                    if let Ok(uri) = Url::parse(uri.as_str()) {
                        names.uris.push(uri);
                    }
                }
                GeneralName::IpAddress(ip) => {
                    if let Some(ip) = bytes_to_ip_addr(ip.as_bytes()) {
                        names.ips.push(ip);
                    }
                }
                _ => {}
            }
        }
        names
    }
}

fn bytes_to_ip_addr(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
}
