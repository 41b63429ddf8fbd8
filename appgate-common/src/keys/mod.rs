//! Polymorphic private keys.
//!
//! A [`PrivateKey`] is either held in memory (software) or resident on a PIV
//! smart card (hardware). Both variants expose a public key, a [`Signer`],
//! PEM encoding, and pairing with an X.509 certificate into a TLS keypair;
//! hardware keys additionally expose an attestation statement.
//!
//! PEM parsing goes through a process-wide registry keyed by the PEM type
//! label so additional key kinds can be registered at init.

pub mod piv;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use p256::ecdsa::signature::Signer as _;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// PEM type label for PKCS#8 keys.
pub const PEM_TYPE_PKCS8: &str = "PRIVATE KEY";
/// PEM type label for SEC1 EC keys.
pub const PEM_TYPE_EC: &str = "EC PRIVATE KEY";
/// PEM type label for legacy PKCS#1 RSA keys.
pub const PEM_TYPE_RSA: &str = "RSA PRIVATE KEY";
/// PEM type label for hardware-resident PIV keys.
pub const PEM_TYPE_PIV: &str = "PIV YUBIKEY PRIVATE KEY";

/// A public key counterpart of a [`PrivateKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum PublicKey {
    /// ECDSA P-256 public key.
    P256(p256::ecdsa::VerifyingKey),
    /// Ed25519 public key.
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PublicKey {
    /// SubjectPublicKeyInfo DER encoding.
    pub fn to_spki_der(&self) -> Result<Vec<u8>> {
        match self {
            PublicKey::P256(vk) => {
                use p256::pkcs8::EncodePublicKey;
                Ok(vk
                    .to_public_key_der()
                    .map_err(|e| Error::bad_parameter(format!("encoding public key: {e}")))?
                    .as_bytes()
                    .to_vec())
            }
            PublicKey::Ed25519(vk) => {
                use ed25519_dalek::pkcs8::EncodePublicKey;
                Ok(vk
                    .to_public_key_der()
                    .map_err(|e| Error::bad_parameter(format!("encoding public key: {e}")))?
                    .as_bytes()
                    .to_vec())
            }
        }
    }

    /// SubjectPublicKeyInfo PEM encoding.
    pub fn to_spki_pem(&self) -> Result<String> {
        match self {
            PublicKey::P256(vk) => {
                use p256::pkcs8::EncodePublicKey;
                vk.to_public_key_pem(Default::default())
                    .map_err(|e| Error::bad_parameter(format!("encoding public key: {e}")))
            }
            PublicKey::Ed25519(vk) => {
                use ed25519_dalek::pkcs8::EncodePublicKey;
                vk.to_public_key_pem(Default::default())
                    .map_err(|e| Error::bad_parameter(format!("encoding public key: {e}")))
            }
        }
    }

    /// Verify a raw signature (`r || s` for P-256) over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            PublicKey::P256(vk) => {
                use p256::ecdsa::signature::Verifier;
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|e| Error::bad_parameter(format!("malformed signature: {e}")))?;
                vk.verify(message, &sig)
                    .map_err(|_| Error::access_denied("signature verification failed"))
            }
            PublicKey::Ed25519(vk) => {
                use ed25519_dalek::Verifier;
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|e| Error::bad_parameter(format!("malformed signature: {e}")))?;
                vk.verify(message, &sig)
                    .map_err(|_| Error::access_denied("signature verification failed"))
            }
        }
    }
}

/// Something that can produce raw signatures.
///
/// Raw means `r || s` for P-256 and the usual 64 bytes for Ed25519; callers
/// needing ASN.1 DER (TLS) convert at the boundary.
pub trait Signer: Send + Sync {
    /// The public counterpart of the signing key.
    fn public_key(&self) -> PublicKey;

    /// Sign `message`, hashing as required by the algorithm.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

enum KeyInner {
    SoftwareP256(p256::ecdsa::SigningKey),
    SoftwareEd25519(ed25519_dalek::SigningKey),
    Hardware(piv::HardwareKey),
}

/// A private key, software- or hardware-resident.
pub struct PrivateKey {
    inner: KeyInner,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            KeyInner::SoftwareP256(_) => write!(f, "PrivateKey(p256)"),
            KeyInner::SoftwareEd25519(_) => write!(f, "PrivateKey(ed25519)"),
            KeyInner::Hardware(hw) => write!(
                f,
                "PrivateKey(piv serial={} slot={})",
                hw.serial_number(),
                hw.slot()
            ),
        }
    }
}

impl PrivateKey {
    /// Generate a fresh in-memory ECDSA P-256 key.
    pub fn generate_p256() -> Self {
        Self {
            inner: KeyInner::SoftwareP256(p256::ecdsa::SigningKey::random(
                &mut rand_core::OsRng,
            )),
        }
    }

    /// Generate a fresh in-memory Ed25519 key.
    pub fn generate_ed25519() -> Self {
        Self {
            inner: KeyInner::SoftwareEd25519(ed25519_dalek::SigningKey::generate(
                &mut rand_core::OsRng,
            )),
        }
    }

    /// Wrap an existing P-256 signing key.
    pub fn from_p256(key: p256::ecdsa::SigningKey) -> Self {
        Self {
            inner: KeyInner::SoftwareP256(key),
        }
    }

    /// Wrap an existing Ed25519 signing key.
    pub fn from_ed25519(key: ed25519_dalek::SigningKey) -> Self {
        Self {
            inner: KeyInner::SoftwareEd25519(key),
        }
    }

    pub(crate) fn from_hardware(key: piv::HardwareKey) -> Self {
        Self {
            inner: KeyInner::Hardware(key),
        }
    }

    /// The public counterpart.
    pub fn public_key(&self) -> PublicKey {
        match &self.inner {
            KeyInner::SoftwareP256(k) => PublicKey::P256(k.verifying_key().to_owned()),
            KeyInner::SoftwareEd25519(k) => PublicKey::Ed25519(k.verifying_key()),
            KeyInner::Hardware(hw) => hw.public_key(),
        }
    }

    /// True when the key material never leaves a smart card.
    pub fn is_hardware(&self) -> bool {
        matches!(self.inner, KeyInner::Hardware(_))
    }

    /// The hardware attestation statement, if this is a hardware key.
    pub fn attestation(&self) -> Option<&piv::AttestationStatement> {
        match &self.inner {
            KeyInner::Hardware(hw) => Some(hw.attestation()),
            _ => None,
        }
    }

    /// Borrow this key as a [`Signer`].
    pub fn signer(&self) -> &dyn Signer {
        self
    }

    /// The PKCS#8 PEM of a software key; hardware keys have no extractable
    /// material.
    pub fn pkcs8_pem(&self) -> Result<String> {
        match &self.inner {
            KeyInner::SoftwareP256(k) => {
                use p256::pkcs8::EncodePrivateKey;
                Ok(k.to_pkcs8_pem(Default::default())
                    .map_err(|e| Error::bad_parameter(format!("encoding private key: {e}")))?
                    .to_string())
            }
            KeyInner::SoftwareEd25519(k) => {
                use ed25519_dalek::pkcs8::EncodePrivateKey;
                Ok(k.to_pkcs8_pem(Default::default())
                    .map_err(|e| Error::bad_parameter(format!("encoding private key: {e}")))?
                    .to_string())
            }
            KeyInner::Hardware(_) => Err(Error::bad_parameter(
                "hardware keys have no extractable private material",
            )),
        }
    }

    /// The canonical PEM encoding: PKCS#8 for software keys, the PIV
    /// reference form for hardware keys.
    pub fn to_pem(&self) -> Result<String> {
        match &self.inner {
            KeyInner::SoftwareP256(_) | KeyInner::SoftwareEd25519(_) => self.pkcs8_pem(),
            KeyInner::Hardware(hw) => {
                let payload = serde_json::to_vec(&PivKeyRef {
                    serial_number: hw.serial_number(),
                    slot_key: hw.slot().key(),
                })
                .expect("PivKeyRef::serialize");
                Ok(pem::encode(&pem::Pem::new(PEM_TYPE_PIV, payload)))
            }
        }
    }

    /// Pair this key with a PEM certificate chain into a TLS keypair.
    pub fn tls_certificate(&self, cert_pem: &str) -> Result<TlsKeyPair> {
        let mut chain = Vec::new();
        for block in pem::parse_many(cert_pem)
            .map_err(|e| Error::bad_parameter(format!("malformed certificate PEM: {e}")))?
        {
            if block.tag() != "CERTIFICATE" {
                return Err(Error::bad_parameter(format!(
                    "expected CERTIFICATE PEM, found {:?}",
                    block.tag()
                )));
            }
            chain.push(CertificateDer::from(block.contents().to_vec()));
        }
        if chain.is_empty() {
            return Err(Error::bad_parameter("certificate PEM contains no certificates"));
        }
        // The leaf must be signed over this key.
        Ok(TlsKeyPair {
            certificate_chain: chain,
            signer: Arc::new(OwnedSigner {
                public: self.public_key(),
                key: match &self.inner {
                    KeyInner::SoftwareP256(k) => OwnedKey::P256(k.clone()),
                    KeyInner::SoftwareEd25519(k) => OwnedKey::Ed25519(k.clone()),
                    KeyInner::Hardware(hw) => OwnedKey::Hardware(hw.clone()),
                },
            }),
        })
    }
}

impl Signer for PrivateKey {
    fn public_key(&self) -> PublicKey {
        PrivateKey::public_key(self)
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.inner {
            KeyInner::SoftwareP256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(message);
                Ok(sig.to_bytes().to_vec())
            }
            KeyInner::SoftwareEd25519(k) => {
                use ed25519_dalek::Signer as _;
                Ok(k.sign(message).to_bytes().to_vec())
            }
            KeyInner::Hardware(hw) => hw.sign(message),
        }
    }
}

enum OwnedKey {
    P256(p256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
    Hardware(piv::HardwareKey),
}

struct OwnedSigner {
    public: PublicKey,
    key: OwnedKey,
}

impl Signer for OwnedSigner {
    fn public_key(&self) -> PublicKey {
        self.public.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            OwnedKey::P256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(message);
                Ok(sig.to_bytes().to_vec())
            }
            OwnedKey::Ed25519(k) => {
                use ed25519_dalek::Signer as _;
                Ok(k.sign(message).to_bytes().to_vec())
            }
            OwnedKey::Hardware(hw) => hw.sign(message),
        }
    }
}

/// A certificate chain paired with the key that matches its leaf.
pub struct TlsKeyPair {
    /// DER certificate chain, leaf first.
    pub certificate_chain: Vec<CertificateDer<'static>>,
    signer: Arc<dyn Signer>,
}

impl TlsKeyPair {
    /// Build the rustls representation of this keypair.
    ///
    /// Works for hardware keys too: signing routes through the generic
    /// [`Signer`] and is converted to the DER form TLS expects.
    pub fn certified_key(&self) -> Result<rustls::sign::CertifiedKey> {
        let signing_key = Arc::new(RustlsSigningKey {
            signer: self.signer.clone(),
        });
        Ok(rustls::sign::CertifiedKey::new(
            self.certificate_chain.clone(),
            signing_key,
        ))
    }
}

impl fmt::Debug for TlsKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlsKeyPair({} certs)", self.certificate_chain.len())
    }
}

#[derive(Clone)]
struct RustlsSigningKey {
    signer: Arc<dyn Signer>,
}

impl fmt::Debug for RustlsSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RustlsSigningKey")
    }
}

impl rustls::sign::SigningKey for RustlsSigningKey {
    fn choose_scheme(
        &self,
        offered: &[rustls::SignatureScheme],
    ) -> Option<Box<dyn rustls::sign::Signer>> {
        let scheme = match self.signer.public_key() {
            PublicKey::P256(_) => rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            PublicKey::Ed25519(_) => rustls::SignatureScheme::ED25519,
        };
        if offered.contains(&scheme) {
            Some(Box::new(RustlsSigner {
                signer: self.signer.clone(),
                scheme,
            }))
        } else {
            None
        }
    }

    fn algorithm(&self) -> rustls::SignatureAlgorithm {
        match self.signer.public_key() {
            PublicKey::P256(_) => rustls::SignatureAlgorithm::ECDSA,
            PublicKey::Ed25519(_) => rustls::SignatureAlgorithm::ED25519,
        }
    }
}

struct RustlsSigner {
    signer: Arc<dyn Signer>,
    scheme: rustls::SignatureScheme,
}

impl fmt::Debug for RustlsSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RustlsSigner({:?})", self.scheme)
    }
}

impl rustls::sign::Signer for RustlsSigner {
    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, rustls::Error> {
        let raw = self
            .signer
            .sign(message)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        match self.signer.public_key() {
            PublicKey::P256(_) => {
                // TLS carries ECDSA signatures in ASN.1 DER.
                let sig = p256::ecdsa::Signature::from_slice(&raw)
                    .map_err(|e| rustls::Error::General(e.to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            PublicKey::Ed25519(_) => Ok(raw),
        }
    }

    fn scheme(&self) -> rustls::SignatureScheme {
        self.scheme
    }
}

/// The JSON payload of a `PIV YUBIKEY PRIVATE KEY` PEM block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivKeyRef {
    /// Card serial number.
    pub serial_number: u32,
    /// PIV slot the key lives in.
    pub slot_key: u32,
}

// === PEM parser registry ===

type ParseFn = fn(&[u8]) -> Result<PrivateKey>;

fn registry() -> &'static Mutex<HashMap<String, ParseFn>> {
    static REGISTRY: OnceCell<Mutex<HashMap<String, ParseFn>>> = OnceCell::new();
    REGISTRY.get_or_init(|| {
        let mut parsers: HashMap<String, ParseFn> = HashMap::new();
        parsers.insert(PEM_TYPE_PKCS8.to_string(), parse_pkcs8);
        parsers.insert(PEM_TYPE_EC.to_string(), parse_sec1);
        parsers.insert(PEM_TYPE_RSA.to_string(), parse_rsa);
        parsers.insert(PEM_TYPE_PIV.to_string(), parse_piv);
        Mutex::new(parsers)
    })
}

/// Register (or replace) the parser for a PEM type. Intended for init-time
/// extension.
pub fn register_parser(pem_type: &str, parser: ParseFn) {
    registry()
        .lock()
        .expect("key parser registry poisoned")
        .insert(pem_type.to_string(), parser);
}

/// Parse a private key from its PEM encoding, dispatching on the PEM type.
pub fn parse_private_key(pem_str: &str) -> Result<PrivateKey> {
    let block = pem::parse(pem_str)
        .map_err(|e| Error::bad_parameter(format!("malformed private key PEM: {e}")))?;
    let parser = {
        let parsers = registry().lock().expect("key parser registry poisoned");
        parsers.get(block.tag()).copied()
    };
    match parser {
        Some(parse) => parse(block.contents()),
        None => Err(Error::bad_parameter(format!(
            "unsupported private key PEM type {:?}",
            block.tag()
        ))),
    }
}

fn parse_pkcs8(der: &[u8]) -> Result<PrivateKey> {
    {
        use p256::pkcs8::DecodePrivateKey;
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::from_p256(key));
        }
    }
    {
        use ed25519_dalek::pkcs8::DecodePrivateKey;
        if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::from_ed25519(key));
        }
    }
    Err(Error::bad_parameter(
        "PKCS#8 key is neither ECDSA P-256 nor Ed25519",
    ))
}

fn parse_sec1(der: &[u8]) -> Result<PrivateKey> {
    let secret = p256::SecretKey::from_sec1_der(der)
        .map_err(|e| Error::bad_parameter(format!("malformed SEC1 key: {e}")))?;
    Ok(PrivateKey::from_p256(p256::ecdsa::SigningKey::from(secret)))
}

fn parse_rsa(_der: &[u8]) -> Result<PrivateKey> {
    // The platform only issues EC keys. The legacy type is still recognized
    // so callers get a precise error instead of "unsupported PEM".
    Err(Error::not_implemented(
        "legacy RSA private keys are not supported, re-issue an ECDSA key",
    ))
}

fn parse_piv(payload: &[u8]) -> Result<PrivateKey> {
    let key_ref: PivKeyRef = serde_json::from_slice(payload)
        .map_err(|e| Error::bad_parameter(format!("malformed PIV key reference: {e}")))?;
    piv::connect_key(key_ref.serial_number, piv::SlotId::new(key_ref.slot_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkcs8_round_trip_p256() {
        let key = PrivateKey::generate_p256();
        let pem = key.to_pem().unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        let parsed = parse_private_key(&pem).unwrap();
        assert_eq!(parsed.public_key(), key.public_key());
    }

    #[test]
    fn pkcs8_round_trip_ed25519() {
        let key = PrivateKey::generate_ed25519();
        let parsed = parse_private_key(&key.to_pem().unwrap()).unwrap();
        assert_eq!(parsed.public_key(), key.public_key());
    }

    #[test]
    fn sign_verify_round_trip() {
        for key in [PrivateKey::generate_p256(), PrivateKey::generate_ed25519()] {
            let sig = key.signer().sign(b"hello").unwrap();
            key.public_key().verify(b"hello", &sig).unwrap();
            assert!(key.public_key().verify(b"tampered", &sig).is_err());
        }
    }

    #[test]
    fn rsa_pem_is_recognized_but_unsupported() {
        let pem = pem::encode(&pem::Pem::new(PEM_TYPE_RSA, vec![0u8; 16]));
        let err = parse_private_key(&pem).unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn unknown_pem_type_is_bad_parameter() {
        let pem = pem::encode(&pem::Pem::new("GARBAGE KEY", vec![0u8; 16]));
        assert!(parse_private_key(&pem).unwrap_err().is_bad_parameter());
    }

    #[test]
    fn registry_is_extendable() {
        fn parse_custom(_: &[u8]) -> Result<PrivateKey> {
            Ok(PrivateKey::generate_p256())
        }
        register_parser("CUSTOM TEST KEY", parse_custom);
        let pem = pem::encode(&pem::Pem::new("CUSTOM TEST KEY", vec![1u8, 2, 3]));
        assert!(parse_private_key(&pem).is_ok());
    }

    #[test]
    fn tls_pairing_requires_certificates() {
        let key = PrivateKey::generate_p256();
        assert!(key.tls_certificate("not a pem").is_err());
    }
}
