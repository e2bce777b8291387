//! Certificate Authority for TLS interception.
//!
//! Loads or generates the root CA and issues per-host leaf certificates
//! signed by it. The root lives in a single file holding the certificate PEM
//! followed by the private key PEM; it is loaded unchanged when present and
//! generated exactly once otherwise.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub use crate::error::CaError;

/// Default CA file name.
pub const CA_FILENAME: &str = "CA.crt";

/// Default common name for a generated root.
pub const DEFAULT_CA_NAME: &str = "Interpose Root CA";

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Root validity when generated.
const ROOT_VALIDITY_DAYS: i64 = 3 * 365;

/// Leaf validity when issued.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Number of leaf certificates kept before the least recently used is evicted.
pub const DEFAULT_LEAF_CACHE_CAPACITY: usize = 1000;

/// A leaf certificate issued for one hostname.
#[derive(Debug)]
pub struct LeafCertificate {
    hostname: String,
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl LeafCertificate {
    /// Hostname the certificate was issued for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The leaf followed by the root that signed it.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The leaf certificate alone.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Private key matching the leaf certificate.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

type LeafSlot = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Hostname to leaf slot, bounded with least-recently-used eviction.
struct LeafCache {
    slots: HashMap<String, LeafSlot>,
    lru: VecDeque<String>,
    capacity: usize,
}

impl LeafCache {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            lru: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot for `hostname`, creating it if absent.
    fn slot(&mut self, hostname: &str) -> LeafSlot {
        if let Some(slot) = self.slots.get(hostname) {
            let slot = slot.clone();
            self.touch(hostname);
            return slot;
        }

        while self.slots.len() >= self.capacity {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            self.slots.remove(&oldest);
            tracing::trace!("Evicted leaf certificate for {}", oldest);
        }

        let slot = LeafSlot::default();
        self.slots.insert(hostname.to_string(), slot.clone());
        self.lru.push_back(hostname.to_string());
        slot
    }

    /// Drops `hostname` if it still maps to `slot` and nothing was issued into it.
    fn discard_empty(&mut self, hostname: &str, slot: &LeafSlot) {
        let stale = self
            .slots
            .get(hostname)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.get().is_none());
        if stale {
            self.slots.remove(hostname);
            self.lru.retain(|h| h != hostname);
        }
    }

    fn touch(&mut self, hostname: &str) {
        if let Some(pos) = self.lru.iter().position(|h| h == hostname) {
            if let Some(h) = self.lru.remove(pos) {
                self.lru.push_back(h);
            }
        }
    }
}

/// Root signing material plus the per-host leaf cache.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    leaves: Mutex<LeafCache>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_leaves", &self.leaves.lock().len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Loads the root from `path`, or generates one and persists it there.
    pub fn load_or_create(path: impl AsRef<Path>, common_name: &str) -> Result<Self, CaError> {
        let path = path.as_ref();
        if path.exists() {
            let ca = Self::load(path)?;
            tracing::info!("Loaded CA certificate from {:?}", path);
            return Ok(ca);
        }

        let ca = Self::generate(common_name)?;
        ca.persist(path)?;
        tracing::info!("Generated new CA certificate at {:?}", path);
        Ok(ca)
    }

    /// Generates a fresh self-signed root.
    pub fn generate(common_name: &str) -> Result<Self, CaError> {
        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaError::Generation(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, ROOT_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        let cert_der = cert.der().clone();
        let issuer = Issuer::new(params, key_pair);

        Ok(Self::from_parts(issuer, cert_pem, key_pem, cert_der))
    }

    /// Loads a root previously written by [`CertificateAuthority::persist`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CaError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_pem(&contents)
    }

    /// Parses a root from PEM text holding a certificate and a private key.
    pub fn from_pem(contents: &str) -> Result<Self, CaError> {
        let blocks = pem::parse_many(contents).map_err(|e| CaError::Parse(e.to_string()))?;

        let cert_block = blocks
            .iter()
            .find(|b| b.tag() == CERTIFICATE_TAG)
            .ok_or_else(|| CaError::Parse("no CERTIFICATE block".into()))?;
        let key_block = blocks
            .iter()
            .find(|b| b.tag() == PRIVATE_KEY_TAG)
            .ok_or_else(|| CaError::Parse("no PRIVATE KEY block".into()))?;

        let key_pem = pem::encode(key_block);
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;

        let cert_der = CertificateDer::from(cert_block.contents().to_vec());
        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self::from_parts(
            issuer,
            pem::encode(cert_block),
            key_pem,
            cert_der,
        ))
    }

    fn from_parts(
        issuer: Issuer<'static, KeyPair>,
        cert_pem: String,
        key_pem: String,
        cert_der: CertificateDer<'static>,
    ) -> Self {
        Self {
            issuer,
            cert_pem,
            key_pem,
            cert_der,
            leaves: Mutex::new(LeafCache::new(DEFAULT_LEAF_CACHE_CAPACITY)),
        }
    }

    /// Bounds the leaf cache to `capacity` hostnames (at least one).
    pub fn with_leaf_cache_capacity(self, capacity: usize) -> Self {
        *self.leaves.lock() = LeafCache::new(capacity);
        self
    }

    /// Number of hostnames currently holding a cached leaf slot.
    pub fn cached_leaves(&self) -> usize {
        self.leaves.lock().len()
    }

    /// Writes the root certificate and key to `path`.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), CaError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut contents = String::with_capacity(self.cert_pem.len() + self.key_pem.len() + 1);
        contents.push_str(&self.cert_pem);
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&self.key_pem);

        fs::write(path, contents).map_err(|e| CaError::Write(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| CaError::Write(e.to_string()))?;
        }

        Ok(())
    }

    /// Root certificate in DER form.
    pub fn root_certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Root certificate in PEM form, for installing into client trust stores.
    pub fn root_certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the leaf for `hostname`, issuing it on first use.
    ///
    /// Concurrent callers for the same hostname wait on a single issuance and
    /// receive the same certificate. Signing blocks, so async callers should
    /// run this off the runtime's worker threads.
    pub fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        let slot = self.leaves.lock().slot(&hostname);

        let issued = slot
            .get_or_try_init(|| {
                tracing::debug!("Issuing leaf certificate for {}", hostname);
                self.sign_leaf(&hostname).map(Arc::new)
            })
            .cloned();

        if issued.is_err() {
            self.leaves.lock().discard_empty(&hostname, &slot);
        }
        issued
    }

    fn sign_leaf(&self, hostname: &str) -> Result<LeafCertificate, CaError> {
        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            chain: vec![cert.der().clone(), self.cert_der.clone()],
            key_der: key_pair.serialize_der(),
        })
    }
}

/// Returns the default CA path inside the platform data directory.
pub fn default_ca_path() -> PathBuf {
    directories::ProjectDirs::from("", "interpose", "Interpose")
        .map(|dirs| dirs.data_dir().join(CA_FILENAME))
        .unwrap_or_else(|| PathBuf::from(CA_FILENAME))
}

/// Sets a validity window starting yesterday, absorbing client clock skew.
fn set_validity(params: &mut CertificateParams, days: i64) {
    let today = Utc::now().date_naive();
    let start = today - Duration::days(1);
    let end = today + Duration::days(days);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}
