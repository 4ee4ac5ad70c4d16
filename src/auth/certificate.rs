//! Client certificate loading and inspection
//!
//! Certificates come from PKCS#12 containers, PEM files (certificate plus an
//! optional unencrypted key), bare DER files, or the platform certificate
//! store. Whatever the container, the thumbprint is the uppercase hex SHA-1
//! of the leaf certificate's DER encoding.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretSlice};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::parse_der;
use x509_parser::parse_x509_certificate;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::X509Name;

use super::store::{CertificateStore, platform_store};
use crate::error::CertificateError;

const RSA_ENCRYPTION_OID: &str = "1.2.840.113549.1.1.1";
const THUMBPRINT_HEX_LEN: usize = 40;

/// Container formats the manager understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Pkcs12,
    Pem,
    Der,
}

impl ContainerFormat {
    /// Guess the container from a file extension. `None` means "try everything".
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pfx" | "p12" => Some(ContainerFormat::Pkcs12),
            "pem" | "crt" | "cer" => Some(ContainerFormat::Pem),
            "der" => Some(ContainerFormat::Der),
            _ => None,
        }
    }
}

/// Subject or issuer fields of interest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistinguishedName {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub country: Option<String>,
}

impl DistinguishedName {
    fn from_x509(name: &X509Name<'_>) -> Self {
        Self {
            common_name: name
                .iter_common_name()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .map(String::from),
            organization: name
                .iter_organization()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .map(String::from),
            country: name
                .iter_country()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .map(String::from),
        }
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            self.common_name.as_ref().map(|v| format!("CN={}", v)),
            self.organization.as_ref().map(|v| format!("O={}", v)),
            self.country.as_ref().map(|v| format!("C={}", v)),
        ]
        .into_iter()
        .flatten()
        .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Certificate facts without any key material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateMetadata {
    pub thumbprint: String,
    pub subject: DistinguishedName,
    pub issuer: DistinguishedName,
    pub serial_number: String,
    pub not_valid_before: DateTime<Utc>,
    pub not_valid_after: DateTime<Utc>,
    pub is_valid: bool,
    /// Negative once the certificate has expired.
    pub expires_in_days: i64,
}

/// A parsed client certificate, with its private key when the container
/// carried one. The key is held as PKCS#1 DER and is never written out.
pub struct CertificateBundle {
    pub thumbprint: String,
    pub subject: DistinguishedName,
    pub issuer: DistinguishedName,
    pub serial_number: String,
    pub not_valid_before: DateTime<Utc>,
    pub not_valid_after: DateTime<Utc>,
    certificate_der: Vec<u8>,
    chain_len: usize,
    private_key: Option<SecretSlice<u8>>,
}

impl CertificateBundle {
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.certificate_der.clone()))
    }

    /// Number of certificates in the container, leaf included.
    pub fn chain_len(&self) -> usize {
        self.chain_len
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// PKCS#1 DER private key, for signing client assertions.
    pub(crate) fn private_key(&self) -> Option<&SecretSlice<u8>> {
        self.private_key.as_ref()
    }

    /// `x5t` JWT header value: base64url of the raw SHA-1 digest.
    pub fn x5t(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha1::digest(&self.certificate_der))
    }

    /// Lower bound inclusive, upper bound exclusive.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_valid_before <= now && now < self.not_valid_after
    }

    pub fn expires_in_days_at(&self, now: DateTime<Utc>) -> i64 {
        (self.not_valid_after - now).num_days()
    }

    /// Fails with `Expired` at or after `not_valid_after`.
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<(), CertificateError> {
        if now >= self.not_valid_after {
            return Err(CertificateError::Expired(self.not_valid_after));
        }
        if now < self.not_valid_before {
            return Err(CertificateError::Malformed(format!(
                "certificate is not valid before {}",
                self.not_valid_before.format("%Y-%m-%d %H:%M:%S UTC")
            )));
        }
        Ok(())
    }

    pub fn metadata_at(&self, now: DateTime<Utc>) -> CertificateMetadata {
        CertificateMetadata {
            thumbprint: self.thumbprint.clone(),
            subject: self.subject.clone(),
            issuer: self.issuer.clone(),
            serial_number: self.serial_number.clone(),
            not_valid_before: self.not_valid_before,
            not_valid_after: self.not_valid_after,
            is_valid: self.is_valid_at(now),
            expires_in_days: self.expires_in_days_at(now),
        }
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("thumbprint", &self.thumbprint)
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial_number", &self.serial_number)
            .field("not_valid_before", &self.not_valid_before)
            .field("not_valid_after", &self.not_valid_after)
            .field("chain_len", &self.chain_len)
            .field("private_key", &self.private_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Strip separators, uppercase, and require exactly 40 hex digits.
pub fn normalize_thumbprint(input: &str) -> Result<String, CertificateError> {
    let normalized: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>()
        .to_ascii_uppercase();

    if normalized.len() != THUMBPRINT_HEX_LEN || !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CertificateError::Malformed(format!(
            "thumbprint must be {} hexadecimal characters",
            THUMBPRINT_HEX_LEN
        )));
    }

    Ok(normalized)
}

/// Uppercase hex SHA-1 of a DER certificate.
pub fn thumbprint_of(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Loads certificates from files, buffers, or the platform store.
#[derive(Clone)]
pub struct CertificateManager {
    store: Arc<dyn CertificateStore>,
}

impl Default for CertificateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateManager {
    /// Manager backed by the store for the running platform.
    pub fn new() -> Self {
        Self {
            store: platform_store(),
        }
    }

    pub fn with_store(store: Arc<dyn CertificateStore>) -> Self {
        Self { store }
    }

    pub async fn load_from_file(
        &self,
        path: impl AsRef<Path>,
        password: Option<&str>,
    ) -> Result<CertificateBundle, CertificateError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| read_error(path, e))?;

        let format = ContainerFormat::from_path(path);
        debug!("Loading certificate from {} (format hint: {:?})", path.display(), format);

        let bundle = parse_container(&data, password, format)?;
        info!("Loaded certificate {} from {}", bundle.thumbprint, path.display());
        Ok(bundle)
    }

    /// Same parsing as [`load_from_file`](Self::load_from_file), with no
    /// extension to go on.
    pub fn load_from_bytes(
        &self,
        data: &[u8],
        password: Option<&str>,
    ) -> Result<CertificateBundle, CertificateError> {
        parse_container(data, password, None)
    }

    pub async fn load_from_store(&self, thumbprint: &str) -> Result<CertificateBundle, CertificateError> {
        let thumbprint = normalize_thumbprint(thumbprint)?;
        debug!("Looking up certificate {} in the {} store", thumbprint, self.store.name());

        let bundle = self.store.find(&thumbprint).await?;
        if bundle.thumbprint != thumbprint {
            warn!(
                "Certificate store returned {} when asked for {}",
                bundle.thumbprint, thumbprint
            );
            return Err(CertificateError::NotFound(thumbprint));
        }
        Ok(bundle)
    }

    pub async fn validate(
        &self,
        path: impl AsRef<Path>,
        password: Option<&str>,
    ) -> Result<bool, CertificateError> {
        self.validate_at(path, password, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        path: impl AsRef<Path>,
        password: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CertificateError> {
        let bundle = self.load_from_file(path, password).await?;
        Ok(bundle.is_valid_at(now))
    }

    pub async fn get_info(
        &self,
        path: impl AsRef<Path>,
        password: Option<&str>,
    ) -> Result<CertificateMetadata, CertificateError> {
        self.get_info_at(path, password, Utc::now()).await
    }

    pub async fn get_info_at(
        &self,
        path: impl AsRef<Path>,
        password: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CertificateMetadata, CertificateError> {
        let bundle = self.load_from_file(path, password).await?;
        Ok(bundle.metadata_at(now))
    }
}

/// Thumbprint of the leaf certificate in a container file. Parses the
/// whole container, so a wrong password or a broken file is an error.
pub fn file_thumbprint(path: &Path, password: Option<&str>) -> Result<String, CertificateError> {
    let data = std::fs::read(path).map_err(|e| read_error(path, e))?;
    Ok(parse_container(&data, password, ContainerFormat::from_path(path))?.thumbprint)
}

fn read_error(path: &Path, error: io::Error) -> CertificateError {
    if error.kind() == io::ErrorKind::NotFound {
        CertificateError::NotFound(path.display().to_string())
    } else {
        CertificateError::Malformed(format!("cannot read {}: {}", path.display(), error))
    }
}

fn parse_container(
    data: &[u8],
    password: Option<&str>,
    format: Option<ContainerFormat>,
) -> Result<CertificateBundle, CertificateError> {
    match format {
        Some(ContainerFormat::Pkcs12) => parse_pkcs12(data, password),
        Some(ContainerFormat::Pem) | Some(ContainerFormat::Der) => parse_pem_or_der(data),
        None => match parse_pkcs12(data, password) {
            Ok(bundle) => Ok(bundle),
            Err(CertificateError::InvalidPassword) => Err(CertificateError::InvalidPassword),
            Err(e) => {
                debug!("Not a PKCS#12 container ({}), trying PEM", e);
                parse_pem_or_der(data)
            }
        },
    }
}

pub(crate) fn parse_pkcs12(
    data: &[u8],
    password: Option<&str>,
) -> Result<CertificateBundle, CertificateError> {
    use p12_keystore::error::Error as P12Error;
    use p12_keystore::{KeyStore, KeyStoreEntry};

    let keystore = KeyStore::from_pkcs12(data, password.unwrap_or("")).map_err(|e| match e {
        P12Error::MacError(_) | P12Error::UnpadError => CertificateError::InvalidPassword,
        other => CertificateError::Malformed(format!("unreadable PKCS#12 container: {}", other)),
    })?;

    if let Some((alias, chain)) = keystore.private_key_chain() {
        debug!("Using key entry '{}' from PKCS#12 container", alias);
        let certificates: Vec<Vec<u8>> = chain.chain().iter().map(|c| c.as_der().to_vec()).collect();
        let key = pkcs8_to_pkcs1(chain.key())?;
        return assemble(certificates, Some(key));
    }

    let certificates: Vec<Vec<u8>> = keystore
        .entries()
        .filter_map(|(_, entry)| match entry {
            KeyStoreEntry::Certificate(cert) => Some(cert.as_der().to_vec()),
            KeyStoreEntry::PrivateKeyChain(_) => None,
        })
        .collect();
    assemble(certificates, None)
}

fn parse_pem_or_der(data: &[u8]) -> Result<CertificateBundle, CertificateError> {
    let blocks = pem::parse_many(data).unwrap_or_default();

    if blocks.is_empty() {
        // A lone DER certificate starts with a SEQUENCE tag.
        if data.first() == Some(&0x30) {
            return assemble(vec![data.to_vec()], None);
        }
        return Err(CertificateError::Malformed(
            "no certificate found in PEM or DER data".into(),
        ));
    }

    let mut certificates = Vec::new();
    let mut key = None;

    for block in blocks {
        match block.tag() {
            "CERTIFICATE" => certificates.push(block.into_contents()),
            "PRIVATE KEY" => key = Some(pkcs8_to_pkcs1(block.contents())?),
            "RSA PRIVATE KEY" => key = Some(block.into_contents()),
            "ENCRYPTED PRIVATE KEY" => {
                return Err(CertificateError::Malformed(
                    "encrypted PEM private keys are not supported, use a PKCS#12 file instead".into(),
                ));
            }
            other => debug!("Ignoring PEM block '{}'", other),
        }
    }

    assemble(certificates, key)
}

fn assemble(
    certificates: Vec<Vec<u8>>,
    key: Option<Vec<u8>>,
) -> Result<CertificateBundle, CertificateError> {
    let leaf_der = certificates
        .first()
        .ok_or_else(|| CertificateError::Malformed("container holds no certificate".into()))?;

    let (_, leaf) = parse_x509_certificate(leaf_der)
        .map_err(|e| CertificateError::Malformed(format!("invalid X.509 certificate: {}", e)))?;

    check_chain(&leaf, &certificates[1..])?;
    if let Some(key) = &key {
        check_key_matches(&leaf, key)?;
    }

    let validity = leaf.validity();
    let not_valid_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| CertificateError::Malformed("notBefore out of range".into()))?;
    let not_valid_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| CertificateError::Malformed("notAfter out of range".into()))?;

    let serial = leaf.raw_serial();
    let significant = serial.iter().position(|b| *b != 0).unwrap_or(serial.len().saturating_sub(1));

    Ok(CertificateBundle {
        thumbprint: thumbprint_of(leaf_der),
        subject: DistinguishedName::from_x509(leaf.subject()),
        issuer: DistinguishedName::from_x509(leaf.issuer()),
        serial_number: hex::encode_upper(&serial[significant..]),
        not_valid_before,
        not_valid_after,
        certificate_der: leaf_der.clone(),
        chain_len: certificates.len(),
        private_key: key.map(SecretSlice::from),
    })
}

/// The leaf must be self-issued or issued by another certificate in the
/// same container.
fn check_chain(leaf: &X509Certificate<'_>, rest: &[Vec<u8>]) -> Result<(), CertificateError> {
    if rest.is_empty() || leaf.issuer().as_raw() == leaf.subject().as_raw() {
        return Ok(());
    }

    let mut linked = false;
    for der in rest {
        let (_, cert) = parse_x509_certificate(der).map_err(|e| {
            CertificateError::ChainInvalid(format!("unreadable chain certificate: {}", e))
        })?;
        if cert.subject().as_raw() == leaf.issuer().as_raw() {
            linked = true;
        }
    }

    if linked {
        Ok(())
    } else {
        Err(CertificateError::ChainInvalid(format!(
            "no certificate in the container issued '{}'",
            leaf.issuer()
        )))
    }
}

fn check_key_matches(leaf: &X509Certificate<'_>, pkcs1: &[u8]) -> Result<(), CertificateError> {
    let modulus = rsa_private_modulus(pkcs1)?;
    match leaf.public_key().parsed() {
        Ok(PublicKey::RSA(public)) => {
            if trim_leading_zeros(public.modulus) == trim_leading_zeros(modulus) {
                Ok(())
            } else {
                Err(CertificateError::Malformed(
                    "private key does not belong to the certificate".into(),
                ))
            }
        }
        Ok(_) => Err(CertificateError::Malformed(
            "only RSA certificates can be used for client assertions".into(),
        )),
        Err(e) => Err(CertificateError::Malformed(format!("unreadable public key: {}", e))),
    }
}

fn malformed_key() -> CertificateError {
    CertificateError::Malformed("unreadable private key".into())
}

/// Unwrap the RSAPrivateKey from a PKCS#8 PrivateKeyInfo.
fn pkcs8_to_pkcs1(pkcs8: &[u8]) -> Result<Vec<u8>, CertificateError> {
    let (_, info) = parse_der(pkcs8).map_err(|_| malformed_key())?;
    let fields = info.as_sequence().map_err(|_| malformed_key())?;

    let algorithm = fields
        .get(1)
        .and_then(|alg| alg.as_sequence().ok())
        .and_then(|alg| alg.first())
        .and_then(|oid| oid.as_oid().ok())
        .map(|oid| oid.to_id_string())
        .ok_or_else(malformed_key)?;

    if algorithm != RSA_ENCRYPTION_OID {
        return Err(CertificateError::Malformed(format!(
            "unsupported private key algorithm {}, only RSA keys are supported",
            algorithm
        )));
    }

    fields
        .get(2)
        .and_then(|key| key.as_slice().ok())
        .map(|key| key.to_vec())
        .ok_or_else(malformed_key)
}

fn rsa_private_modulus(pkcs1: &[u8]) -> Result<&[u8], CertificateError> {
    let (_, key) = parse_der(pkcs1).map_err(|_| malformed_key())?;
    let fields = key.as_sequence().map_err(|_| malformed_key())?;
    fields
        .get(1)
        .and_then(|modulus| modulus.as_slice().ok())
        .ok_or_else(malformed_key)
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Signing key for RS256 client assertions.
pub(crate) fn signing_key(
    bundle: &CertificateBundle,
) -> Result<jsonwebtoken::EncodingKey, CertificateError> {
    let key = bundle.private_key().ok_or_else(|| {
        CertificateError::Malformed("certificate has no private key to sign with".into())
    })?;
    Ok(jsonwebtoken::EncodingKey::from_rsa_der(key.expose_secret()))
}
