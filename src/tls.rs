//! Local certificate authority for the TLS-MITM path.
//!
//! A [`DevCa`] is generated once, persisted under the CA directory, and
//! signs a leaf certificate per hostname on demand. Trusting the CA
//! certificate (`ca.crt`) in the OS/browser store makes every
//! `https://<name>/` terminate cleanly inside the proxy.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::{
    self, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};

/// Root CA validity (10 years).
const CA_VALIDITY_DAYS: i64 = 3650;
/// Leaf certificate validity (1 year).
const LEAF_VALIDITY_DAYS: i64 = 365;

const CA_COMMON_NAME: &str = "localhome Development CA";
const CA_ORGANIZATION: &str = "localhome";
const CA_CERT_FILENAME: &str = "ca.crt";
const CA_KEY_FILENAME: &str = "ca.key";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to generate keypair: {0}")]
    Keypair(String),
    #[error("failed to generate certificate: {0}")]
    Certificate(String),
    #[error("failed to parse certificate or key: {0}")]
    Parse(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tls configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// A leaf certificate and its private key, ready for rustls.
pub struct IssuedCert {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

/// Issues per-hostname leaf certificates.
///
/// The MITM path is available exactly when an issuer is configured.
pub trait CertIssuer: Send + Sync {
    fn issue(&self, hostname: &str) -> Result<IssuedCert, TlsError>;
}

/// A locally generated development CA.
#[derive(Clone)]
pub struct DevCa {
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl DevCa {
    /// Generates a fresh CA in memory.
    pub fn generate() -> Result<Self, TlsError> {
        let params = Self::ca_params();
        let key_pair = KeyPair::generate().map_err(|e| TlsError::Keypair(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::Certificate(e.to_string()))?;
        Ok(Self {
            ca_cert_pem: cert.pem(),
            ca_key_pem: key_pair.serialize_pem(),
        })
    }

    /// Loads the CA from `dir`, generating and persisting one on first use.
    ///
    /// The key file is written with mode 0600.
    pub fn load_or_generate(dir: &Path) -> Result<Self, TlsError> {
        let cert_path = dir.join(CA_CERT_FILENAME);
        let key_path = dir.join(CA_KEY_FILENAME);
        if cert_path.exists() && key_path.exists() {
            let ca_cert_pem = fs::read_to_string(&cert_path).map_err(|source| TlsError::Read {
                path: cert_path,
                source,
            })?;
            let ca_key_pem = fs::read_to_string(&key_path).map_err(|source| TlsError::Read {
                path: key_path,
                source,
            })?;
            return Ok(Self {
                ca_cert_pem,
                ca_key_pem,
            });
        }

        let ca = Self::generate()?;
        fs::create_dir_all(dir).map_err(|source| TlsError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
        fs::write(&cert_path, &ca.ca_cert_pem).map_err(|source| TlsError::Write {
            path: cert_path,
            source,
        })?;
        fs::write(&key_path, &ca.ca_key_pem).map_err(|source| TlsError::Write {
            path: key_path.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600)).map_err(
                |source| TlsError::Write {
                    path: key_path,
                    source,
                },
            )?;
        }
        Ok(ca)
    }

    /// The CA certificate in PEM form, for installing into trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        params
    }
}

impl CertIssuer for DevCa {
    fn issue(&self, hostname: &str) -> Result<IssuedCert, TlsError> {
        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| TlsError::Parse(format!("CA private key: {e}")))?;
        let issuer = Issuer::new(Self::ca_params(), ca_key);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Cover both spellings a client may put in SNI.
        let mut sans = Vec::new();
        for name in [hostname.to_string(), format!("{hostname}.localhost")] {
            let dns = name
                .as_str()
                .try_into()
                .map_err(|e| TlsError::Parse(format!("invalid DNS name {name:?}: {e:?}")))?;
            sans.push(SanType::DnsName(dns));
        }
        params.subject_alt_names = sans;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate().map_err(|e| TlsError::Keypair(e.to_string()))?;
        let leaf = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| TlsError::Certificate(e.to_string()))?;

        Ok(IssuedCert {
            cert: leaf.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        })
    }
}

/// Builds the rustls server config for one virtual server.
///
/// ALPN is pinned to `http/1.1`; the listener never negotiates HTTP/2.
pub fn server_config(issued: IssuedCert) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![issued.cert], issued.key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
