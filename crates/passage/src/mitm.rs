//! Certificate authority for MITM interception.
//!
//! Leaf certificates are minted on demand for intercepted hosts, signed by
//! the configured CA and cached by SNI hostname. The inner TLS server only
//! ever advertises `http/1.1`.

use std::net::IpAddr;
use std::sync::Arc;

use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;

use crate::error::{Error, Result};

/// Leaf not-before backdating to absorb clock skew.
const NOT_BEFORE_OFFSET: Duration = Duration::seconds(60);
/// Cached leaves per CA.
const CACHE_CAPACITY: u64 = 1024;

/// MITM configuration: the CA key pair plus minting parameters.
#[derive(Debug, Clone)]
pub struct MitmConfig {
  /// CA certificate, PEM.
  pub ca_cert_pem: String,
  /// CA private key, PEM.
  pub ca_key_pem: String,
  /// Organization written into minted leaves.
  pub organization: String,
  /// Leaf validity window.
  pub validity: std::time::Duration,
}

struct CachedLeaf {
  chain: Vec<CertificateDer<'static>>,
  key_der: Vec<u8>,
}

impl CachedLeaf {
  fn key(&self) -> PrivateKeyDer<'static> {
    PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
  }
}

/// A CA that signs per-host leaf certificates for interception.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  organization: String,
  validity: Duration,
  cache: Cache<String, Arc<CachedLeaf>>,
}

impl CertificateAuthority {
  /// Load a provisioned CA key pair.
  pub fn from_pem(config: &MitmConfig) -> Result<Self> {
    let key_pair = KeyPair::from_pem(&config.ca_key_pem)
      .map_err(|e| Error::config(format!("failed to parse CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&config.ca_cert_pem, key_pair)
      .map_err(|e| Error::config(format!("failed to load CA certificate: {e}")))?;

    let ca_cert_der = rustls_pemfile::certs(&mut config.ca_cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::config("no certificate found in CA PEM"))?
      .map_err(|e| Error::config(format!("failed to parse CA PEM: {e}")))?;

    Ok(Self::assemble(
      issuer,
      ca_cert_der,
      config.ca_cert_pem.clone(),
      &config.organization,
      config.validity,
    ))
  }

  /// Generate a fresh self-signed CA. Used for tests and for setups that
  /// provision the CA out of band from the PEM accessors.
  pub fn self_signed(organization: &str, validity: std::time::Duration) -> Result<Self> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{organization} CA"));
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::internal(format!("failed to generate CA key pair: {e}")))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::internal(format!("failed to self-sign CA: {e}")))?;

    let ca_cert_pem = cert.pem();
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, key_pair)
      .map_err(|e| Error::internal(format!("failed to build issuer: {e}")))?;

    Ok(Self::assemble(issuer, ca_cert_der, ca_cert_pem, organization, validity))
  }

  fn assemble(
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    organization: &str,
    validity: std::time::Duration,
  ) -> Self {
    CertificateAuthority {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      organization: organization.to_owned(),
      validity: Duration::try_from(validity).unwrap_or(Duration::days(1)),
      cache: Cache::new(CACHE_CAPACITY),
    }
  }

  /// The CA certificate in PEM form, for client trust stores.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// The CA certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  fn mint_leaf(&self, host: &str) -> Result<CachedLeaf> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, self.organization.as_str());
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::mitm_handshake(format!("invalid hostname {host:?}"))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_OFFSET;
    params.not_after = now + self.validity;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::mitm_handshake(format!("failed to generate leaf key: {e}")))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::mitm_handshake(format!("failed to sign leaf: {e}")))?;

    Ok(CachedLeaf {
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key_der: key_pair.serialize_der(),
    })
  }

  async fn leaf_for_host(&self, host: &str) -> Result<Arc<CachedLeaf>> {
    if let Some(cached) = self.cache.get(host).await {
      return Ok(cached);
    }
    let leaf = Arc::new(self.mint_leaf(host)?);
    self.cache.insert(host.to_owned(), leaf.clone()).await;
    Ok(leaf)
  }

  /// Leaf certificate chain and key for a host, minted or cache-hit.
  pub async fn server_cert(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let leaf = self.leaf_for_host(host).await?;
    Ok((leaf.chain.clone(), leaf.key()))
  }

  /// TLS server configuration for intercepting a host. ALPN is pinned to
  /// `http/1.1`; HTTP/2 inside the intercept is out of scope.
  pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let (chain, key) = self.server_cert(host).await?;
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::mitm_handshake(format!("failed to build TLS config: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
  }
}

impl std::fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("organization", &self.organization)
      .field("validity", &self.validity)
      .finish()
  }
}
