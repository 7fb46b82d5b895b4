//! Identity & Trust Store (§4.A).
//!
//! Provides a stable `(localDeviceInfo, localCert, localPrivateKey)` triple
//! and persists the set of trusted peers. Many readers, rare writers
//! (pair/unpair); writes are atomic via write-to-temp-then-rename, per the
//! shared-resource policy in §5 and the teacher's own config persistence
//! discipline (`GUI/src/runtime/config.rs::load_from_dir`, which always
//! writes a complete file rather than patching one in place).

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::packet::{DeviceInfo, DeviceType};

use super::cert::{self, LocalCertificate};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityRecord {
    device_id: String,
    display_name: String,
    cert_pem: String,
    key_pem: String,
}

/// A peer we've paired with: its certificate is pinned byte-exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    pub display_name: String,
    pub device_type: DeviceType,
    #[serde(with = "der_as_base64")]
    pub peer_cert_der: Vec<u8>,
    #[serde(default)]
    pub plugin_enabled: HashMap<String, bool>,
}

mod der_as_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(der: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(der).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

pub struct IdentityStore {
    data_dir: PathBuf,
    record: IdentityRecord,
    cert: LocalCertificate,
    trust: RwLock<HashMap<String, TrustedPeer>>,
}

impl IdentityStore {
    /// Load the identity + trust table from `data_dir`, generating a new
    /// identity on first run (§4.A `init()`). Fails with
    /// [`CoreError::FatalInit`] if the directory is unwritable or key
    /// generation fails.
    pub fn init(data_dir: &Path, display_name: &str) -> CoreResult<Self> {
        fs::create_dir_all(data_dir)
            .map_err(|e| CoreError::FatalInit(format!("cannot create data dir: {e}")))?;

        let identity_path = data_dir.join("identity.json");
        let record = if identity_path.exists() {
            let content = fs::read_to_string(&identity_path)
                .map_err(|e| CoreError::FatalInit(format!("cannot read identity: {e}")))?;
            serde_json::from_str(&content)
                .map_err(|e| CoreError::FatalInit(format!("cannot parse identity: {e}")))?
        } else {
            let device_id = Uuid::new_v4().simple().to_string();
            let local_cert = cert::generate_self_signed(&device_id)?;
            let record = IdentityRecord {
                device_id,
                display_name: display_name.to_string(),
                cert_pem: local_cert.cert_pem,
                key_pem: local_cert.key_pem,
            };
            write_atomic(&identity_path, &record)?;
            record
        };

        let cert_der = pem_to_der(&record.cert_pem)
            .map_err(|e| CoreError::FatalInit(format!("stored cert is not valid PEM: {e}")))?;
        let local_cert = LocalCertificate {
            cert_pem: record.cert_pem.clone(),
            key_pem: record.key_pem.clone(),
            cert_der,
        };

        let trust_path = data_dir.join("trust.json");
        let trust: HashMap<String, TrustedPeer> = if trust_path.exists() {
            let content = fs::read_to_string(&trust_path)
                .map_err(|e| CoreError::FatalInit(format!("cannot read trust store: {e}")))?;
            serde_json::from_str(&content)
                .map_err(|e| CoreError::FatalInit(format!("cannot parse trust store: {e}")))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            record,
            cert: local_cert,
            trust: RwLock::new(trust),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.record.device_id
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.cert.key_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert.cert_der
    }

    /// §4.A `getLocalInfo()` — DeviceInfo computed from the persisted id
    /// plus host-supplied name/type and the union of currently-declared
    /// plugin capabilities.
    pub fn local_info(
        &self,
        device_type: DeviceType,
        protocol_version: u32,
        incoming_capabilities: BTreeSet<String>,
        outgoing_capabilities: BTreeSet<String>,
        tcp_port: u16,
    ) -> DeviceInfo {
        DeviceInfo {
            id: self.record.device_id.clone(),
            name: self.record.display_name.clone(),
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        }
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.trust.read().contains_key(device_id)
    }

    pub fn trusted_cert_der(&self, device_id: &str) -> Option<Vec<u8>> {
        self.trust.read().get(device_id).map(|p| p.peer_cert_der.clone())
    }

    /// §4.A `trust()` — atomically persists the mapping. Fails if the
    /// device is already trusted to a *different* certificate.
    pub fn trust(
        &self,
        device_id: &str,
        display_name: &str,
        device_type: DeviceType,
        peer_cert_der: Vec<u8>,
    ) -> CoreResult<()> {
        {
            let trust = self.trust.read();
            if let Some(existing) = trust.get(device_id) {
                if existing.peer_cert_der != peer_cert_der {
                    return Err(CoreError::TrustCollision {
                        device_id: device_id.to_string(),
                    });
                }
                // Re-trusting with the same cert is a no-op (idempotence law, §8).
                return Ok(());
            }
        }
        {
            let mut trust = self.trust.write();
            trust.insert(
                device_id.to_string(),
                TrustedPeer {
                    display_name: display_name.to_string(),
                    device_type,
                    peer_cert_der,
                    plugin_enabled: HashMap::new(),
                },
            );
        }
        self.persist_trust()
    }

    /// §4.A `untrust()` — removes the mapping and any per-device
    /// preferences.
    pub fn untrust(&self, device_id: &str) -> CoreResult<()> {
        self.trust.write().remove(device_id);
        self.persist_trust()
    }

    /// §4.A `verifyPeer()`. Succeeds iff the handshake cert's CN equals the
    /// announced device id, and either the device is not yet trusted
    /// (provisional acceptance for the unpaired handshake) or the DER bytes
    /// match the pinned certificate exactly.
    pub fn verify_peer(&self, handshake_cert_der: &[u8], announced_device_id: &str) -> CoreResult<()> {
        let cn = cert::common_name_from_der(handshake_cert_der)?;
        if cn != announced_device_id {
            return Err(CoreError::IdentityMismatch {
                cn,
                announced: announced_device_id.to_string(),
            });
        }

        match self.trusted_cert_der(announced_device_id) {
            None => Ok(()),
            Some(pinned) if pinned == handshake_cert_der => Ok(()),
            Some(_) => Err(CoreError::CertificatePinViolation {
                device_id: announced_device_id.to_string(),
            }),
        }
    }

    pub fn trusted_peer(&self, device_id: &str) -> Option<TrustedPeer> {
        self.trust.read().get(device_id).cloned()
    }

    pub fn set_plugin_enabled(&self, device_id: &str, plugin: &str, enabled: bool) -> CoreResult<()> {
        {
            let mut trust = self.trust.write();
            let Some(peer) = trust.get_mut(device_id) else {
                return Err(CoreError::UnknownDevice(device_id.to_string()));
            };
            peer.plugin_enabled.insert(plugin.to_string(), enabled);
        }
        self.persist_trust()
    }

    fn persist_trust(&self) -> CoreResult<()> {
        let trust_path = self.data_dir.join("trust.json");
        let snapshot = self.trust.read().clone();
        write_atomic(&trust_path, &snapshot)
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::FatalInit(format!("cannot serialize: {e}")))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .map_err(|e| CoreError::FatalInit(format!("cannot write {:?}: {e}", tmp_path)))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| CoreError::FatalInit(format!("cannot rename into {:?}: {e}", path)))
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>, String> {
    let body: String = pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    base64::engine::general_purpose::STANDARD
        .decode(&body)
        .map_err(|e| e.to_string())
}
