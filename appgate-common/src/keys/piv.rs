//! PIV smart-card resident keys.
//!
//! Card I/O is abstracted behind [`PivCard`]/[`CardReader`] so tests (and
//! builds without a smart-card stack) can swap the manager's backend. The
//! process-wide manager keeps one handle per card serial and serializes
//! operations per card: PIV allows a single outstanding request.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::keys::{PrivateKey, PublicKey};

/// Subject organization stamped into slot marker certificates; slots whose
/// certificate carries a different organization are treated as foreign.
pub const KEY_ORGANIZATION: &str = "teleport";

/// PIV authentication slot, used for keys that never require touch.
pub const SLOT_AUTHENTICATION: u32 = 0x9a;
/// PIV signature slot, used for keys that require (cached) touch.
pub const SLOT_SIGNATURE: u32 = 0x9c;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const CONNECT_RETRY_BUDGET: Duration = Duration::from_millis(100);

/// A PIV key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(u32);

impl SlotId {
    /// Validate and wrap a raw slot key.
    pub fn new(key: u32) -> Result<Self> {
        match key {
            0x9a | 0x9c | 0x9d | 0x9e => Ok(Self(key)),
            other => Err(Error::bad_parameter(format!(
                "invalid PIV slot {other:#04x}"
            ))),
        }
    }

    /// The raw slot key.
    pub fn key(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// When the card requires a physical touch to sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchPolicy {
    /// Signing never requires touch.
    Never,
    /// Signing requires touch, cached for a short window.
    Cached,
}

/// Proof that a key is resident on a specific card slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationStatement {
    /// Card serial number.
    pub serial_number: u32,
    /// Slot the key lives in.
    pub slot: SlotId,
    /// SubjectPublicKeyInfo DER of the attested key.
    pub public_key_der: Vec<u8>,
    /// Touch policy the key was generated with.
    pub touch_policy: TouchPolicy,
}

/// One open PIV card connection.
pub trait PivCard: Send {
    /// The card serial number.
    fn serial_number(&self) -> u32;

    /// Generate an ECDSA P-256 key in `slot`, replacing any previous key.
    fn generate_key(&mut self, slot: SlotId, touch: TouchPolicy)
        -> Result<p256::ecdsa::VerifyingKey>;

    /// The DER certificate stored in `slot`, if any.
    fn read_certificate(&mut self, slot: SlotId) -> Result<Option<Vec<u8>>>;

    /// Store a DER certificate in `slot`.
    fn store_certificate(&mut self, slot: SlotId, der: Vec<u8>) -> Result<()>;

    /// Produce an attestation statement for the key in `slot`.
    fn attest(&mut self, slot: SlotId) -> Result<AttestationStatement>;

    /// Sign `message` with the key in `slot`; returns raw `r || s`.
    fn sign(&mut self, slot: SlotId, message: &[u8]) -> Result<Vec<u8>>;
}

/// Opens card connections.
///
/// A transient "card in use" failure is reported as
/// [`Error::ConnectionProblem`] and retried by the manager.
pub trait CardReader: Send + Sync {
    /// Connect to the card with the given serial, or any card when `None`.
    fn connect(&self, serial: Option<u32>) -> Result<Box<dyn PivCard>>;
}

type SharedCard = Arc<Mutex<Box<dyn PivCard>>>;

/// The process-wide PIV manager.
pub struct PivManager {
    reader: Box<dyn CardReader>,
    cards: Mutex<HashMap<u32, SharedCard>>,
    // One get-or-generate at a time; slot reads and writes must not
    // interleave across callers.
    generate_mu: Mutex<()>,
}

impl PivManager {
    /// Build a manager over a card reader.
    pub fn new(reader: Box<dyn CardReader>) -> Arc<Self> {
        Arc::new(Self {
            reader,
            cards: Mutex::new(HashMap::new()),
            generate_mu: Mutex::new(()),
        })
    }

    fn open(&self, serial: Option<u32>) -> Result<SharedCard> {
        if let Some(serial) = serial {
            if let Some(card) = self.cards.lock().unwrap().get(&serial) {
                return Ok(card.clone());
            }
        }
        let deadline = Instant::now() + CONNECT_RETRY_BUDGET;
        let card = loop {
            match self.reader.connect(serial) {
                Ok(card) => break card,
                Err(err) if err.is_connection_problem() && Instant::now() < deadline => {
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        };
        let serial = card.serial_number();
        let card: SharedCard = Arc::new(Mutex::new(card));
        self.cards.lock().unwrap().insert(serial, card.clone());
        Ok(card)
    }

    /// Return the key in the policy-selected slot, generating it if the slot
    /// is empty or holds a foreign key.
    pub fn get_or_generate(self: &Arc<Self>, touch_required: bool) -> Result<PrivateKey> {
        let (slot, touch) = if touch_required {
            (SlotId(SLOT_SIGNATURE), TouchPolicy::Cached)
        } else {
            (SlotId(SLOT_AUTHENTICATION), TouchPolicy::Never)
        };
        let _guard = self.generate_mu.lock().unwrap();

        let card = self.open(None)?;
        let serial = card.lock().unwrap().serial_number();

        let existing = card.lock().unwrap().read_certificate(slot)?;
        if let Some(cert_der) = existing {
            if let Ok(attestation) = self.validate_slot_certificate(&card, slot, &cert_der) {
                return HardwareKey::new(self.clone(), serial, slot, attestation)
                    .map(PrivateKey::from_hardware);
            }
            // Foreign or stale certificate: the slot is regenerated below.
        }

        {
            let mut card = card.lock().unwrap();
            card.generate_key(slot, touch)?;
        }
        let attestation = card.lock().unwrap().attest(slot)?;
        let marker = marker_certificate(card.clone(), slot, &attestation)?;
        card.lock().unwrap().store_certificate(slot, marker)?;

        HardwareKey::new(self.clone(), serial, slot, attestation).map(PrivateKey::from_hardware)
    }

    /// Bind to an existing key on a known card, e.g. when parsing a PIV PEM.
    pub fn connect_key(self: &Arc<Self>, serial: u32, slot: SlotId) -> Result<PrivateKey> {
        let card = self.open(Some(serial))?;
        let attestation = card.lock().unwrap().attest(slot)?;
        HardwareKey::new(self.clone(), serial, slot, attestation).map(PrivateKey::from_hardware)
    }

    fn validate_slot_certificate(
        &self,
        card: &SharedCard,
        slot: SlotId,
        cert_der: &[u8],
    ) -> Result<AttestationStatement> {
        let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
            .map_err(|e| Error::bad_parameter(format!("malformed slot certificate: {e}")))?;
        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap_or_default();
        if organization != KEY_ORGANIZATION {
            return Err(Error::bad_parameter(format!(
                "slot {slot} certificate belongs to {organization:?}"
            )));
        }
        let attestation = card.lock().unwrap().attest(slot)?;
        if cert.public_key().raw != attestation.public_key_der.as_slice() {
            return Err(Error::bad_parameter(format!(
                "slot {slot} certificate does not match the attested key"
            )));
        }
        Ok(attestation)
    }

    fn sign(&self, serial: u32, slot: SlotId, message: &[u8]) -> Result<Vec<u8>> {
        let card = self.open(Some(serial))?;
        let mut card = card.lock().unwrap();
        card.sign(slot, message)
    }
}

/// A handle to a card-resident key.
#[derive(Clone)]
pub struct HardwareKey {
    manager: Arc<PivManager>,
    serial_number: u32,
    slot: SlotId,
    public: p256::ecdsa::VerifyingKey,
    attestation: AttestationStatement,
}

impl HardwareKey {
    fn new(
        manager: Arc<PivManager>,
        serial_number: u32,
        slot: SlotId,
        attestation: AttestationStatement,
    ) -> Result<Self> {
        let public = p256::ecdsa::VerifyingKey::from_public_key_der(&attestation.public_key_der)
            .map_err(|e| Error::bad_parameter(format!("malformed attested key: {e}")))?;
        Ok(Self {
            manager,
            serial_number,
            slot,
            public,
            attestation,
        })
    }

    /// The card serial number.
    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    /// The slot the key lives in.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The attestation statement produced at binding time.
    pub fn attestation(&self) -> &AttestationStatement {
        &self.attestation
    }

    pub(crate) fn public_key(&self) -> PublicKey {
        PublicKey::P256(self.public.to_owned())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.manager.sign(self.serial_number, self.slot, message)
    }
}

struct CardSlotKey {
    card: SharedCard,
    slot: SlotId,
    public_point: Vec<u8>,
}

impl rcgen::RemoteKeyPair for CardSlotKey {
    fn public_key(&self) -> &[u8] {
        &self.public_point
    }

    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        let raw = self
            .card
            .lock()
            .unwrap()
            .sign(self.slot, msg)
            .map_err(|_| rcgen::Error::RemoteKeyError)?;
        let sig = p256::ecdsa::Signature::from_slice(&raw)
            .map_err(|_| rcgen::Error::RemoteKeyError)?;
        Ok(sig.to_der().as_bytes().to_vec())
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

/// Build the self-signed certificate marking a slot as ours. The serial is
/// random 128-bit, the subject carries the owning organization and the agent
/// version.
fn marker_certificate(
    card: SharedCard,
    slot: SlotId,
    attestation: &AttestationStatement,
) -> Result<Vec<u8>> {
    let verifying = p256::ecdsa::VerifyingKey::from_public_key_der(&attestation.public_key_der)
        .map_err(|e| Error::bad_parameter(format!("malformed attested key: {e}")))?;
    let public_point = verifying.to_encoded_point(false).as_bytes().to_vec();

    let remote = CardSlotKey {
        card,
        slot,
        public_point,
    };
    let key_pair = rcgen::KeyPair::from_remote(Box::new(remote))
        .map_err(|e| Error::Internal(anyhow::anyhow!("binding remote key: {e}")))?;

    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, KEY_ORGANIZATION);
    params.distinguished_name.push(
        rcgen::DnType::OrganizationalUnitName,
        env!("CARGO_PKG_VERSION"),
    );
    let serial: [u8; 16] = rand::random();
    params.serial_number = Some(rcgen::SerialNumber::from(serial.to_vec()));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Internal(anyhow::anyhow!("building marker certificate: {e}")))?;
    Ok(cert.der().to_vec())
}

// === Process-wide manager ===

fn manager_cell() -> &'static Mutex<Option<Arc<PivManager>>> {
    static MANAGER: OnceCell<Mutex<Option<Arc<PivManager>>>> = OnceCell::new();
    MANAGER.get_or_init(|| Mutex::new(None))
}

/// Install the process-wide manager; replaces any previous one. Tests use
/// this to install a stub reader.
pub fn init_manager(reader: Box<dyn CardReader>) {
    *manager_cell().lock().unwrap() = Some(PivManager::new(reader));
}

/// Drop the process-wide manager and its card handles.
pub fn close_manager() {
    *manager_cell().lock().unwrap() = None;
}

/// The process-wide manager.
pub fn manager() -> Result<Arc<PivManager>> {
    manager_cell()
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| Error::not_implemented("no PIV card reader installed"))
}

/// Bind to an existing key through the process-wide manager.
pub fn connect_key(serial: u32, slot: SlotId) -> Result<PrivateKey> {
    manager()?.connect_key(serial, slot)
}
