//! Trust store: per-core trust records and session keys
//!
//! Trust is established on first contact (TOFU) and enforced strictly
//! afterwards: a core presenting a different fingerprint is refused.
//! Session keys are epoch-versioned. After a rotation the previous epoch's
//! key still decrypts for a grace window so that messages sealed before the
//! rotation committed are not lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tether_core::{
    CoreId, Fingerprint, Nonce, SecurityError, SessionPolicy, TetherError, TetherResult,
    TrustConfig,
};

use crate::{CryptoProvider, Key, NonceHistory};

/// Symmetric key for one trust epoch with a specific core
#[derive(Clone, Debug)]
pub struct SessionKey {
    key: Key,
    epoch: u32,
    created_at: Instant,
    uses: u64,
    policy: SessionPolicy,
}

impl SessionKey {
    pub fn new(key: Key, epoch: u32, policy: SessionPolicy) -> Self {
        SessionKey {
            key,
            epoch,
            created_at: Instant::now(),
            uses: 0,
            policy,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn uses(&self) -> u64 {
        self.uses
    }

    /// Expired by age or by use count
    pub fn is_expired(&self, now: Instant) -> bool {
        let too_old = self
            .policy
            .max_age
            .is_some_and(|max| now.saturating_duration_since(self.created_at) >= max);
        let used_up = self.policy.max_uses.is_some_and(|max| self.uses >= max);
        too_old || used_up
    }
}

#[derive(Clone, Debug)]
struct RetiredKey {
    key: SessionKey,
    retired_at: Instant,
}

/// Trust established with one core
#[derive(Clone, Debug)]
pub struct TrustRecord {
    core: CoreId,
    fingerprint: Fingerprint,
    current: SessionKey,
    previous: Option<RetiredKey>,
}

impl TrustRecord {
    fn new(core: CoreId, fingerprint: Fingerprint, key: SessionKey) -> Self {
        TrustRecord {
            core,
            fingerprint,
            current: key,
            previous: None,
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.current
    }

    /// Retire the current key and install a new one
    fn install(&mut self, key: SessionKey) {
        let retired = std::mem::replace(&mut self.current, key);
        if retired.epoch != self.current.epoch {
            self.previous = Some(RetiredKey {
                key: retired,
                retired_at: Instant::now(),
            });
        }
    }

    fn key_for_epoch(&self, epoch: u32, grace: Duration, now: Instant) -> Option<&Key> {
        if epoch == self.current.epoch {
            return Some(&self.current.key);
        }
        self.previous
            .as_ref()
            .filter(|p| p.key.epoch == epoch && now.saturating_duration_since(p.retired_at) < grace)
            .map(|p| &p.key.key)
    }
}

#[derive(Debug)]
struct TrustEntry {
    record: Option<TrustRecord>,
    nonces: NonceHistory,
}

/// Per-core trust records, one entry per core
///
/// Entries are locked individually; operations on different cores never
/// contend beyond the brief map lookup.
#[derive(Debug)]
pub struct TrustStore {
    entries: RwLock<HashMap<CoreId, Arc<Mutex<TrustEntry>>>>,
    config: TrustConfig,
}

impl TrustStore {
    pub fn new(config: TrustConfig) -> Self {
        TrustStore {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn session_policy(&self) -> SessionPolicy {
        self.config.session
    }

    fn entry(&self, core: CoreId) -> Arc<Mutex<TrustEntry>> {
        if let Some(entry) = self.entries.read().get(&core) {
            return Arc::clone(entry);
        }
        let capacity = self.config.nonce_capacity;
        Arc::clone(self.entries.write().entry(core).or_insert_with(|| {
            Arc::new(Mutex::new(TrustEntry {
                record: None,
                nonces: NonceHistory::new(capacity),
            }))
        }))
    }

    fn existing(&self, core: CoreId) -> Option<Arc<Mutex<TrustEntry>>> {
        self.entries.read().get(&core).cloned()
    }

    /// True iff a non-expired trust record exists
    pub fn is_trusted(&self, core: CoreId) -> bool {
        self.existing(core).is_some_and(|entry| {
            entry
                .lock()
                .record
                .as_ref()
                .is_some_and(|r| !r.current.is_expired(Instant::now()))
        })
    }

    /// Fingerprint recorded at first contact
    pub fn fingerprint(&self, core: CoreId) -> Option<Fingerprint> {
        self.existing(core)
            .and_then(|entry| entry.lock().record.as_ref().map(|r| r.fingerprint))
    }

    /// Current session epoch
    pub fn epoch(&self, core: CoreId) -> Option<u32> {
        self.existing(core)
            .and_then(|entry| entry.lock().record.as_ref().map(|r| r.current.epoch))
    }

    /// Copy of the trust record, for inspection
    pub fn record(&self, core: CoreId) -> Option<TrustRecord> {
        self.existing(core).and_then(|entry| entry.lock().record.clone())
    }

    /// Refuse a fingerprint that differs from the one recorded for this core
    pub fn check_fingerprint(&self, core: CoreId, presented: Fingerprint) -> TetherResult<()> {
        match self.fingerprint(core) {
            Some(expected) if expected != presented => {
                warn!(core = %core, %expected, %presented, "fingerprint mismatch");
                Err(TetherError::Security {
                    core: Some(core),
                    kind: SecurityError::TrustConflict {
                        expected,
                        presented,
                    },
                })
            }
            _ => Ok(()),
        }
    }

    /// Trust-on-first-contact acceptance
    ///
    /// Without a prior record the core is accepted unconditionally. With a
    /// prior record the fingerprint must match; the session is then
    /// re-established under the new key.
    pub fn record_first_contact(
        &self,
        core: CoreId,
        fingerprint: Fingerprint,
        key: SessionKey,
    ) -> TetherResult<()> {
        let entry = self.entry(core);
        let mut entry = entry.lock();

        match entry.record.as_mut() {
            None => {
                info!(core = %core, %fingerprint, epoch = key.epoch, "trust established on first contact");
                entry.record = Some(TrustRecord::new(core, fingerprint, key));
                Ok(())
            }
            Some(record) if record.fingerprint == fingerprint => {
                info!(core = %core, epoch = key.epoch, "session re-established");
                record.install(key);
                Ok(())
            }
            Some(record) => {
                warn!(core = %core, expected = %record.fingerprint, presented = %fingerprint, "refusing identity swap");
                Err(TetherError::Security {
                    core: Some(core),
                    kind: SecurityError::TrustConflict {
                        expected: record.fingerprint,
                        presented: fingerprint,
                    },
                })
            }
        }
    }

    /// Replace the session key, keeping the fingerprint
    pub fn rotate_session_key(&self, core: CoreId, key: SessionKey) -> TetherResult<()> {
        let entry = self.existing(core).ok_or(TetherError::UnknownCore(core))?;
        let mut entry = entry.lock();
        let record = entry.record.as_mut().ok_or(TetherError::UnknownCore(core))?;

        debug!(core = %core, from = record.current.epoch, to = key.epoch, "session key rotated");
        record.install(key);
        Ok(())
    }

    /// Record a nonce; false signals a replay
    pub fn consume_nonce(&self, core: CoreId, nonce: Nonce) -> bool {
        let fresh = self.entry(core).lock().nonces.consume(nonce);
        if !fresh {
            warn!(core = %core, ?nonce, "replayed nonce rejected");
        }
        fresh
    }

    /// Like `consume_nonce`, as an error
    pub fn require_fresh_nonce(&self, core: CoreId, nonce: Nonce) -> TetherResult<()> {
        if self.consume_nonce(core, nonce) {
            Ok(())
        } else {
            Err(TetherError::Security {
                core: Some(core),
                kind: SecurityError::Replay,
            })
        }
    }

    /// Current key without counting a use
    pub fn current_key(&self, core: CoreId) -> TetherResult<(u32, Key)> {
        let entry = self.existing(core).ok_or(TetherError::UnknownCore(core))?;
        let entry = entry.lock();
        let record = entry.record.as_ref().ok_or(TetherError::UnknownCore(core))?;
        Ok((record.current.epoch, record.current.key.clone()))
    }

    /// Encrypt under the active epoch, counting one use of the key
    ///
    /// `aad` receives the epoch so headers can bind it.
    pub fn seal<F>(&self, core: CoreId, plaintext: &[u8], aad: F) -> TetherResult<(u32, Vec<u8>)>
    where
        F: FnOnce(u32) -> Vec<u8>,
    {
        let (epoch, key) = {
            let entry = self.existing(core).ok_or(TetherError::UnknownCore(core))?;
            let mut entry = entry.lock();
            let record = entry.record.as_mut().ok_or(TetherError::UnknownCore(core))?;
            if record.current.is_expired(Instant::now()) {
                return Err(TetherError::handshake(core, "session key expired"));
            }
            record.current.uses += 1;
            (record.current.epoch, record.current.key.clone())
        };

        let ciphertext = CryptoProvider::encrypt_with_aad(plaintext, &aad(epoch), &key)?;
        Ok((epoch, ciphertext))
    }

    /// Encrypt a reply under the epoch the peer used, while that key is accepted
    ///
    /// Falls back to the active epoch once the peer's epoch is retired. Keeps
    /// replies readable by a peer that has not committed a rotation yet.
    pub fn seal_for_epoch<F>(
        &self,
        core: CoreId,
        epoch: u32,
        plaintext: &[u8],
        aad: F,
    ) -> TetherResult<(u32, Vec<u8>)>
    where
        F: FnOnce(u32) -> Vec<u8>,
    {
        let previous = {
            let entry = self.existing(core).ok_or(TetherError::UnknownCore(core))?;
            let entry = entry.lock();
            let record = entry.record.as_ref().ok_or(TetherError::UnknownCore(core))?;
            if epoch == record.current.epoch {
                None
            } else {
                record
                    .key_for_epoch(epoch, self.config.rotation_grace, Instant::now())
                    .cloned()
            }
        };

        match previous {
            Some(key) => {
                let ciphertext = CryptoProvider::encrypt_with_aad(plaintext, &aad(epoch), &key)?;
                Ok((epoch, ciphertext))
            }
            None => self.seal(core, plaintext, aad),
        }
    }

    /// Decrypt under the given epoch: current, or previous within the grace window
    pub fn open(&self, core: CoreId, epoch: u32, aad: &[u8], ciphertext: &[u8]) -> TetherResult<Vec<u8>> {
        let key = {
            let entry = self.existing(core).ok_or(TetherError::Security {
                core: Some(core),
                kind: SecurityError::Decryption,
            })?;
            let entry = entry.lock();
            entry
                .record
                .as_ref()
                .and_then(|r| r.key_for_epoch(epoch, self.config.rotation_grace, Instant::now()))
                .cloned()
        };

        let Some(key) = key else {
            debug!(core = %core, epoch, "no key for epoch");
            return Err(TetherError::Security {
                core: Some(core),
                kind: SecurityError::Decryption,
            });
        };

        CryptoProvider::decrypt_with_aad(ciphertext, aad, &key).map_err(|e| e.with_core(core))
    }

    /// Drop all trust for one core
    pub fn forget(&self, core: CoreId) {
        if self.entries.write().remove(&core).is_some() {
            info!(core = %core, "trust record deleted");
        }
    }

    /// Drop all trust
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new(TrustConfig::default())
    }
}
