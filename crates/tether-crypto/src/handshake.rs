//! Pairwise handshake and key rotation
//!
//! ```text
//! Initiator                               Responder
//!   Idle ── Hello ─────────────────────────▶ Idle
//!   HelloSent ◀──────────────── HelloAck ── HelloReceived
//!   KeyExchanged ── KeyExchange ───────────▶
//!   Trusted ◀────────────── KeyExchangeAck ── Trusted
//! ```
//!
//! Hello and HelloAck carry the sender's public key, fingerprint and a
//! signature over the transcript. KeyExchange carries the session key
//! (wrapped per the bootstrap policy); the ack proves the responder holds it.
//! Any failed check moves the attempt to `Failed`; a retry always starts a
//! new `Handshake`.
//!
//! The state machine performs no I/O. Callers move messages.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tether_core::{BootstrapPolicy, CoreId, Fingerprint, Nonce, TetherError, TetherResult};
use tether_wire::{HandshakeKind, HandshakeMessage};

use crate::{
    unwrap_session_key, wrap_session_key, CryptoProvider, Identity, Key, PublicIdentity,
    SessionKey, TrustStore,
};

/// Handshake progress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    HelloSent,
    HelloReceived,
    KeyExchanged,
    Trusted,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Side of the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// One handshake attempt with one peer
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    identity: Arc<Identity>,
    peer: CoreId,
    bootstrap: BootstrapPolicy,
    /// Our Hello/HelloAck nonce
    local_nonce: Option<Nonce>,
    /// Peer's Hello/HelloAck nonce
    peer_nonce: Option<Nonce>,
    peer_fingerprint: Option<Fingerprint>,
    /// Nonce of the KeyExchange, confirmed by the ack
    exchange_nonce: Option<Nonce>,
    /// Session key awaiting confirmation (initiator)
    pending: Option<SessionKey>,
}

impl Handshake {
    pub fn initiator(identity: Arc<Identity>, peer: CoreId, bootstrap: BootstrapPolicy) -> Self {
        Self::new(Role::Initiator, identity, peer, bootstrap)
    }

    pub fn responder(identity: Arc<Identity>, peer: CoreId, bootstrap: BootstrapPolicy) -> Self {
        Self::new(Role::Responder, identity, peer, bootstrap)
    }

    fn new(role: Role, identity: Arc<Identity>, peer: CoreId, bootstrap: BootstrapPolicy) -> Self {
        Handshake {
            role,
            state: HandshakeState::Idle,
            identity,
            peer,
            bootstrap,
            local_nonce: None,
            peer_nonce: None,
            peer_fingerprint: None,
            exchange_nonce: None,
            pending: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> CoreId {
        self.peer
    }

    pub fn is_trusted(&self) -> bool {
        self.state == HandshakeState::Trusted
    }

    /// Fingerprint the peer presented
    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_fingerprint
    }

    /// Initiator: `Idle → HelloSent`
    pub fn start(&mut self) -> TetherResult<HandshakeMessage> {
        self.step(|hs| {
            hs.expect(Role::Initiator, HandshakeState::Idle)?;

            let nonce = CryptoProvider::generate_nonce()?;
            let hello = hs.signed(
                HandshakeMessage::new(HandshakeKind::Hello, hs.identity.core_id(), nonce),
                None,
            );

            hs.local_nonce = Some(nonce);
            hs.state = HandshakeState::HelloSent;
            debug!(peer = %hs.peer, "hello sent");
            Ok(hello)
        })
    }

    /// Responder: `Idle → HelloReceived`, answers with HelloAck
    pub fn on_hello(
        &mut self,
        hello: &HandshakeMessage,
        trust: &TrustStore,
    ) -> TetherResult<HandshakeMessage> {
        self.step(|hs| {
            hs.expect(Role::Responder, HandshakeState::Idle)?;
            hs.check_sender(hello, HandshakeKind::Hello)?;

            let fingerprint = hs.verify_identity(hello, None)?;
            trust.require_fresh_nonce(hs.peer, hello.nonce)?;
            trust.check_fingerprint(hs.peer, fingerprint)?;

            let nonce = CryptoProvider::generate_nonce()?;
            let ack = hs.signed(
                HandshakeMessage::new(HandshakeKind::HelloAck, hs.identity.core_id(), nonce),
                Some(&hello.nonce),
            );

            hs.peer_nonce = Some(hello.nonce);
            hs.peer_fingerprint = Some(fingerprint);
            hs.local_nonce = Some(nonce);
            hs.state = HandshakeState::HelloReceived;
            debug!(peer = %hs.peer, %fingerprint, "hello received");
            Ok(ack)
        })
    }

    /// Initiator: `HelloSent → HelloReceived → KeyExchanged`, sends the session key
    pub fn on_hello_ack(
        &mut self,
        ack: &HandshakeMessage,
        trust: &TrustStore,
    ) -> TetherResult<HandshakeMessage> {
        self.step(|hs| {
            hs.expect(Role::Initiator, HandshakeState::HelloSent)?;
            hs.check_sender(ack, HandshakeKind::HelloAck)?;

            let local_nonce = hs.local_nonce.ok_or_else(|| hs.error("missing local nonce"))?;
            let fingerprint = hs.verify_identity(ack, Some(&local_nonce))?;
            trust.require_fresh_nonce(hs.peer, ack.nonce)?;
            trust.check_fingerprint(hs.peer, fingerprint)?;

            hs.peer_nonce = Some(ack.nonce);
            hs.peer_fingerprint = Some(fingerprint);
            hs.state = HandshakeState::HelloReceived;

            let epoch = trust.epoch(hs.peer).map_or(0, |e| e.wrapping_add(1));
            let key = CryptoProvider::generate_key()?;
            let wrapped = wrap_session_key(&hs.bootstrap, hs.peer, &local_nonce, &ack.nonce, &key)?;

            let nonce = CryptoProvider::generate_nonce()?;
            let exchange =
                HandshakeMessage::new(HandshakeKind::KeyExchange, hs.identity.core_id(), nonce)
                    .with_session_key(epoch, wrapped);

            hs.exchange_nonce = Some(nonce);
            hs.pending = Some(SessionKey::new(key, epoch, trust.session_policy()));
            hs.state = HandshakeState::KeyExchanged;
            debug!(peer = %hs.peer, epoch, "session key sent");
            Ok(exchange)
        })
    }

    /// Responder: `HelloReceived → KeyExchanged → Trusted`, commits the key
    pub fn on_key_exchange(
        &mut self,
        exchange: &HandshakeMessage,
        trust: &TrustStore,
    ) -> TetherResult<HandshakeMessage> {
        self.step(|hs| {
            hs.expect(Role::Responder, HandshakeState::HelloReceived)?;
            hs.check_sender(exchange, HandshakeKind::KeyExchange)?;

            let (epoch, wrapped) = match (exchange.epoch, &exchange.encrypted_session_key) {
                (Some(epoch), Some(wrapped)) => (epoch, wrapped),
                _ => return Err(hs.error("key exchange without session key")),
            };
            trust.require_fresh_nonce(hs.peer, exchange.nonce)?;

            let initiator_nonce = hs.peer_nonce.ok_or_else(|| hs.error("missing peer nonce"))?;
            let responder_nonce = hs.local_nonce.ok_or_else(|| hs.error("missing local nonce"))?;
            let key = unwrap_session_key(
                &hs.bootstrap,
                hs.peer,
                &initiator_nonce,
                &responder_nonce,
                wrapped,
            )?;
            hs.state = HandshakeState::KeyExchanged;

            let fingerprint = hs
                .peer_fingerprint
                .ok_or_else(|| hs.error("missing peer fingerprint"))?;
            let proof = key_confirmation(&key, &exchange.nonce, epoch)?;
            trust.record_first_contact(
                hs.peer,
                fingerprint,
                SessionKey::new(key, epoch, trust.session_policy()),
            )?;

            let nonce = CryptoProvider::generate_nonce()?;
            let ack = HandshakeMessage::new(HandshakeKind::KeyExchangeAck, hs.identity.core_id(), nonce)
                .with_proof(epoch, proof);

            hs.state = HandshakeState::Trusted;
            info!(peer = %hs.peer, epoch, "handshake complete (responder)");
            Ok(ack)
        })
    }

    /// Initiator: `KeyExchanged → Trusted` once the peer proves it holds the key
    pub fn on_key_exchange_ack(
        &mut self,
        ack: &HandshakeMessage,
        trust: &TrustStore,
    ) -> TetherResult<()> {
        self.step(|hs| {
            hs.expect(Role::Initiator, HandshakeState::KeyExchanged)?;
            hs.check_sender(ack, HandshakeKind::KeyExchangeAck)?;
            trust.require_fresh_nonce(hs.peer, ack.nonce)?;

            let pending = hs.pending.take().ok_or_else(|| hs.error("no pending key"))?;
            let exchange_nonce = hs
                .exchange_nonce
                .ok_or_else(|| hs.error("missing exchange nonce"))?;
            let confirmed = ack.epoch == Some(pending.epoch())
                && ack.proof.as_deref().is_some_and(|proof| {
                    verify_key_confirmation(pending.key(), &exchange_nonce, pending.epoch(), proof)
                });
            if !confirmed {
                return Err(hs.error("peer did not confirm the session key"));
            }

            let fingerprint = hs
                .peer_fingerprint
                .ok_or_else(|| hs.error("missing peer fingerprint"))?;
            let epoch = pending.epoch();
            trust.record_first_contact(hs.peer, fingerprint, pending)?;

            hs.state = HandshakeState::Trusted;
            info!(peer = %hs.peer, epoch, "handshake complete (initiator)");
            Ok(())
        })
    }

    /// Run one transition; any error fails the attempt
    fn step<T>(&mut self, f: impl FnOnce(&mut Self) -> TetherResult<T>) -> TetherResult<T> {
        if self.state == HandshakeState::Failed {
            return Err(self.error("attempt already failed, start a new handshake"));
        }
        let result = f(self).map_err(|e| e.with_core(self.peer));
        if let Err(e) = &result {
            warn!(peer = %self.peer, role = ?self.role, error = %e, "handshake failed");
            self.state = HandshakeState::Failed;
            self.pending = None;
        }
        result
    }

    fn expect(&self, role: Role, state: HandshakeState) -> TetherResult<()> {
        if self.role != role || self.state != state {
            return Err(self.error(format!(
                "unexpected message for {:?} in state {}",
                self.role, self.state
            )));
        }
        Ok(())
    }

    fn check_sender(&self, msg: &HandshakeMessage, kind: HandshakeKind) -> TetherResult<()> {
        if msg.kind != kind {
            return Err(self.error(format!("expected {:?}, got {:?}", kind, msg.kind)));
        }
        if msg.core_id != self.peer {
            return Err(self.error(format!("message from {} during handshake with {}", msg.core_id, self.peer)));
        }
        Ok(())
    }

    /// Check the presented key matches the fingerprint and signed the transcript
    fn verify_identity(&self, msg: &HandshakeMessage, peer_nonce: Option<&Nonce>) -> TetherResult<Fingerprint> {
        let (Some(fingerprint), Some(public_key), Some(signature)) =
            (msg.fingerprint, msg.public_key.as_deref(), msg.signature.as_deref())
        else {
            return Err(self.error("identity missing from hello"));
        };

        let public = PublicIdentity::from_slice(public_key)
            .ok_or_else(|| self.error("malformed public key"))?;
        if public.fingerprint() != fingerprint {
            return Err(self.error("fingerprint does not match public key"));
        }
        if !public.verify(&msg.transcript(peer_nonce), signature) {
            return Err(self.error("bad hello signature"));
        }
        Ok(fingerprint)
    }

    fn signed(&self, msg: HandshakeMessage, peer_nonce: Option<&Nonce>) -> HandshakeMessage {
        let msg = msg.with_identity(self.identity.fingerprint(), self.identity.verifying_key_bytes());
        let signature = self.identity.sign(&msg.transcript(peer_nonce));
        msg.with_signature(signature)
    }

    fn error(&self, reason: impl Into<String>) -> TetherError {
        TetherError::handshake(self.peer, reason)
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Pure read: is there usable trust with this core
pub fn verify_trust(trust: &TrustStore, core: CoreId) -> bool {
    trust.is_trusted(core)
}

fn confirmation_aad(epoch: u32) -> Vec<u8> {
    let mut aad = b"tether-kc".to_vec();
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad
}

/// Proof of possession of a new session key
pub fn key_confirmation(key: &Key, nonce: &Nonce, epoch: u32) -> TetherResult<Vec<u8>> {
    CryptoProvider::encrypt_with_aad(nonce.as_bytes(), &confirmation_aad(epoch), key)
}

pub fn verify_key_confirmation(key: &Key, nonce: &Nonce, epoch: u32, proof: &[u8]) -> bool {
    CryptoProvider::decrypt_with_aad(proof, &confirmation_aad(epoch), key)
        .is_ok_and(|plain| plain == nonce.as_bytes())
}

fn rotation_aad(sender: CoreId, epoch: u32, nonce: &Nonce) -> Vec<u8> {
    let mut aad = b"tether-rekey".to_vec();
    aad.extend_from_slice(&sender.to_bytes());
    aad.extend_from_slice(&epoch.to_be_bytes());
    aad.extend_from_slice(nonce.as_bytes());
    aad
}

/// Rotation started locally, committed only once the peer confirms
#[derive(Debug)]
pub struct PendingRotation {
    peer: CoreId,
    key: SessionKey,
    nonce: Nonce,
}

impl PendingRotation {
    pub fn peer(&self) -> CoreId {
        self.peer
    }

    pub fn epoch(&self) -> u32 {
        self.key.epoch()
    }
}

/// Generate a new session key and wrap it under the current one
pub fn begin_rotation(
    trust: &TrustStore,
    local: CoreId,
    peer: CoreId,
) -> TetherResult<(HandshakeMessage, PendingRotation)> {
    let (current_epoch, current_key) = trust.current_key(peer)?;
    let epoch = current_epoch.wrapping_add(1);
    let key = CryptoProvider::generate_key()?;
    let nonce = CryptoProvider::generate_nonce()?;

    let wrapped = CryptoProvider::encrypt_with_aad(
        key.as_bytes(),
        &rotation_aad(local, epoch, &nonce),
        &current_key,
    )?;
    let msg = HandshakeMessage::new(HandshakeKind::KeyExchange, local, nonce).with_session_key(epoch, wrapped);

    debug!(peer = %peer, from = current_epoch, to = epoch, "key rotation offered");
    Ok((
        msg,
        PendingRotation {
            peer,
            key: SessionKey::new(key, epoch, trust.session_policy()),
            nonce,
        },
    ))
}

/// Peer side: unwrap the new key with the current one and commit it
///
/// The previous key keeps decrypting for the grace window.
pub fn accept_rotation(
    trust: &TrustStore,
    local: CoreId,
    msg: &HandshakeMessage,
) -> TetherResult<HandshakeMessage> {
    let peer = msg.core_id;
    let (Some(epoch), Some(wrapped)) = (msg.epoch, msg.encrypted_session_key.as_deref()) else {
        return Err(TetherError::handshake(peer, "rotation without session key"));
    };
    if msg.kind != HandshakeKind::KeyExchange {
        return Err(TetherError::handshake(peer, "rotation must be a key exchange"));
    }

    let (current_epoch, current_key) = trust.current_key(peer)?;
    if epoch <= current_epoch {
        return Err(TetherError::handshake(
            peer,
            format!("stale rotation to epoch {} (current {})", epoch, current_epoch),
        ));
    }

    let bytes = CryptoProvider::decrypt_with_aad(wrapped, &rotation_aad(peer, epoch, &msg.nonce), &current_key)
        .map_err(|e| e.with_core(peer))?;
    trust.require_fresh_nonce(peer, msg.nonce)?;
    let key = Key::from_slice(&bytes)
        .ok_or_else(|| TetherError::handshake(peer, "rotated key has wrong size"))?;

    let proof = key_confirmation(&key, &msg.nonce, epoch)?;
    trust.rotate_session_key(peer, SessionKey::new(key, epoch, trust.session_policy()))?;

    info!(peer = %peer, epoch, "key rotation accepted");
    let nonce = CryptoProvider::generate_nonce()?;
    Ok(HandshakeMessage::new(HandshakeKind::KeyExchangeAck, local, nonce).with_proof(epoch, proof))
}

/// Commit a rotation after the peer confirmed the new key
pub fn complete_rotation(
    trust: &TrustStore,
    pending: PendingRotation,
    ack: &HandshakeMessage,
) -> TetherResult<()> {
    let peer = pending.peer;
    if ack.kind != HandshakeKind::KeyExchangeAck || ack.core_id != peer {
        return Err(TetherError::handshake(peer, "unexpected rotation acknowledgement"));
    }

    let confirmed = ack.epoch == Some(pending.epoch())
        && ack.proof.as_deref().is_some_and(|proof| {
            verify_key_confirmation(pending.key.key(), &pending.nonce, pending.epoch(), proof)
        });
    if !confirmed {
        warn!(peer = %peer, epoch = pending.epoch(), "rotation not confirmed, keeping current key");
        return Err(TetherError::handshake(peer, "peer did not confirm the rotated key"));
    }
    trust.require_fresh_nonce(peer, ack.nonce)?;

    let epoch = pending.epoch();
    trust.rotate_session_key(peer, pending.key)?;
    info!(peer = %peer, epoch, "key rotation committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::{SecurityError, TrustConfig};

    struct Side {
        identity: Arc<Identity>,
        trust: TrustStore,
    }

    fn side(core: u32) -> Side {
        Side {
            identity: Arc::new(Identity::generate(CoreId::new(core))),
            trust: TrustStore::default(),
        }
    }

    /// Run a full handshake between main (0) and a helper
    fn run(main: &Side, helper: &Side, policy: (BootstrapPolicy, BootstrapPolicy)) -> TetherResult<()> {
        let helper_id = helper.identity.core_id();
        let mut init = Handshake::initiator(main.identity.clone(), helper_id, policy.0);
        let mut resp = Handshake::responder(helper.identity.clone(), CoreId::MAIN, policy.1);

        let hello = init.start()?;
        let ack = resp.on_hello(&hello, &helper.trust)?;
        let exchange = init.on_hello_ack(&ack, &main.trust)?;
        let confirm = resp.on_key_exchange(&exchange, &helper.trust)?;
        init.on_key_exchange_ack(&confirm, &main.trust)?;

        assert!(init.is_trusted());
        assert!(resp.is_trusted());
        Ok(())
    }

    fn shared_key_works(main: &Side, helper: &Side) {
        let helper_id = helper.identity.core_id();
        let (epoch, ct) = main.trust.seal(helper_id, b"ping", |_| Vec::new()).unwrap();
        let pt = helper.trust.open(CoreId::MAIN, epoch, &[], &ct).unwrap();
        assert_eq!(pt, b"ping");
    }

    #[test]
    fn test_full_handshake_cleartext() {
        let main = side(0);
        let helper = side(1);

        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();

        assert!(verify_trust(&main.trust, CoreId::new(1)));
        assert!(verify_trust(&helper.trust, CoreId::MAIN));
        assert_eq!(main.trust.fingerprint(CoreId::new(1)), Some(helper.identity.fingerprint()));
        assert_eq!(helper.trust.fingerprint(CoreId::MAIN), Some(main.identity.fingerprint()));
        shared_key_works(&main, &helper);
    }

    #[test]
    fn test_full_handshake_with_secret() {
        let main = side(0);
        let helper = side(1);
        let psk = BootstrapPolicy::PreSharedSecret([9; 32]);

        run(&main, &helper, (psk.clone(), psk)).unwrap();
        shared_key_works(&main, &helper);
    }

    #[test]
    fn test_secret_mismatch_fails() {
        let main = side(0);
        let helper = side(1);

        let result = run(
            &main,
            &helper,
            (BootstrapPolicy::PreSharedSecret([1; 32]), BootstrapPolicy::PreSharedSecret([2; 32])),
        );
        assert!(result.is_err());
        assert!(!main.trust.is_trusted(CoreId::new(1)));
        assert!(!helper.trust.is_trusted(CoreId::MAIN));
    }

    #[test]
    fn test_identity_swap_fails_on_initiator() {
        let main = side(0);
        let helper = side(1);
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();

        // A different process answers as core 1
        let impostor = side(1);
        let mut init = Handshake::initiator(main.identity.clone(), CoreId::new(1), BootstrapPolicy::Cleartext);
        let mut resp = Handshake::responder(impostor.identity.clone(), CoreId::MAIN, BootstrapPolicy::Cleartext);

        let hello = init.start().unwrap();
        let ack = resp.on_hello(&hello, &impostor.trust).unwrap();
        let err = init.on_hello_ack(&ack, &main.trust).unwrap_err();

        assert!(matches!(err.security_kind(), Some(SecurityError::TrustConflict { .. })));
        assert_eq!(init.state(), HandshakeState::Failed);
        // Original trust intact
        assert_eq!(main.trust.fingerprint(CoreId::new(1)), Some(helper.identity.fingerprint()));
    }

    #[test]
    fn test_identity_swap_fails_on_responder() {
        let main = side(0);
        let helper = side(1);
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();

        let impostor = side(0);
        let mut init = Handshake::initiator(impostor.identity.clone(), CoreId::new(1), BootstrapPolicy::Cleartext);
        let mut resp = Handshake::responder(helper.identity.clone(), CoreId::MAIN, BootstrapPolicy::Cleartext);

        let hello = init.start().unwrap();
        let err = resp.on_hello(&hello, &helper.trust).unwrap_err();
        assert!(matches!(err.security_kind(), Some(SecurityError::TrustConflict { .. })));
        assert_eq!(resp.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_replayed_hello_rejected() {
        let main = side(0);
        let helper = side(1);

        let mut init = Handshake::initiator(main.identity.clone(), CoreId::new(1), BootstrapPolicy::Cleartext);
        let hello = init.start().unwrap();

        let mut first = Handshake::responder(helper.identity.clone(), CoreId::MAIN, BootstrapPolicy::Cleartext);
        first.on_hello(&hello, &helper.trust).unwrap();

        let mut second = Handshake::responder(helper.identity.clone(), CoreId::MAIN, BootstrapPolicy::Cleartext);
        let err = second.on_hello(&hello, &helper.trust).unwrap_err();
        assert_eq!(err.security_kind(), Some(&SecurityError::Replay));
    }

    #[test]
    fn test_tampered_hello_rejected() {
        let main = side(0);
        let helper = side(1);

        let mut init = Handshake::initiator(main.identity.clone(), CoreId::new(1), BootstrapPolicy::Cleartext);
        let mut hello = init.start().unwrap();
        hello.fingerprint = Some(Fingerprint::from_bytes([0; 32]));

        let mut resp = Handshake::responder(helper.identity.clone(), CoreId::MAIN, BootstrapPolicy::Cleartext);
        assert!(matches!(
            resp.on_hello(&hello, &helper.trust),
            Err(TetherError::Handshake { .. })
        ));
    }

    #[test]
    fn test_failed_attempt_does_not_resume() {
        let main = side(0);
        let mut init = Handshake::initiator(main.identity.clone(), CoreId::new(1), BootstrapPolicy::Cleartext);
        init.start().unwrap();

        // Out-of-order message fails the attempt
        let bogus = HandshakeMessage::new(HandshakeKind::KeyExchangeAck, CoreId::new(1), CryptoProvider::generate_nonce().unwrap());
        assert!(init.on_key_exchange_ack(&bogus, &main.trust).is_err());
        assert_eq!(init.state(), HandshakeState::Failed);
        assert!(init.start().is_err());

        // A fresh attempt starts clean
        let mut retry = Handshake::initiator(main.identity.clone(), CoreId::new(1), BootstrapPolicy::Cleartext);
        assert!(retry.start().is_ok());
        assert_eq!(retry.state(), HandshakeState::HelloSent);
    }

    #[test]
    fn test_rehandshake_bumps_epoch() {
        let main = side(0);
        let helper = side(1);
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();

        assert_eq!(main.trust.epoch(CoreId::new(1)), Some(1));
        assert_eq!(helper.trust.epoch(CoreId::MAIN), Some(1));
        shared_key_works(&main, &helper);
    }

    #[test]
    fn test_key_rotation() {
        let main = Side {
            identity: Arc::new(Identity::generate(CoreId::MAIN)),
            trust: TrustStore::new(TrustConfig {
                rotation_grace: Duration::from_millis(50),
                ..TrustConfig::default()
            }),
        };
        let helper = Side {
            identity: Arc::new(Identity::generate(CoreId::new(1))),
            trust: TrustStore::new(TrustConfig {
                rotation_grace: Duration::from_millis(50),
                ..TrustConfig::default()
            }),
        };
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();
        let core = CoreId::new(1);

        // Sealed before the rotation
        let (old_epoch, old_ct) = main.trust.seal(core, b"before", |_| Vec::new()).unwrap();

        let (offer, pending) = begin_rotation(&main.trust, CoreId::MAIN, core).unwrap();
        // Not committed locally until acknowledged
        assert_eq!(main.trust.epoch(core), Some(0));

        let ack = accept_rotation(&helper.trust, core, &offer).unwrap();
        assert_eq!(helper.trust.epoch(CoreId::MAIN), Some(1));

        complete_rotation(&main.trust, pending, &ack).unwrap();
        assert_eq!(main.trust.epoch(core), Some(1));

        // New key works
        shared_key_works(&main, &helper);
        // Old key still accepted within the grace window
        assert_eq!(helper.trust.open(CoreId::MAIN, old_epoch, &[], &old_ct).unwrap(), b"before");

        // And refused after it
        std::thread::sleep(Duration::from_millis(80));
        let err = helper.trust.open(CoreId::MAIN, old_epoch, &[], &old_ct).unwrap_err();
        assert_eq!(err.security_kind(), Some(&SecurityError::Decryption));
    }

    #[test]
    fn test_unconfirmed_rotation_not_committed() {
        let main = side(0);
        let helper = side(1);
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();
        let core = CoreId::new(1);

        let (_offer, pending) = begin_rotation(&main.trust, CoreId::MAIN, core).unwrap();
        let forged = HandshakeMessage::new(HandshakeKind::KeyExchangeAck, core, CryptoProvider::generate_nonce().unwrap())
            .with_proof(1, vec![0; 64]);

        assert!(complete_rotation(&main.trust, pending, &forged).is_err());
        assert_eq!(main.trust.epoch(core), Some(0));
    }

    #[test]
    fn test_forged_rotation_does_not_burn_nonce() {
        let main = side(0);
        let helper = side(1);
        run(&main, &helper, (BootstrapPolicy::Cleartext, BootstrapPolicy::Cleartext)).unwrap();
        let core = CoreId::new(1);

        let (offer, pending) = begin_rotation(&main.trust, CoreId::MAIN, core).unwrap();
        let mut forged = offer.clone();
        if let Some(wrapped) = forged.encrypted_session_key.as_mut() {
            wrapped[0] ^= 0xFF;
        }
        assert!(accept_rotation(&helper.trust, core, &forged).is_err());

        let ack = accept_rotation(&helper.trust, core, &offer).unwrap();
        complete_rotation(&main.trust, pending, &ack).unwrap();
        shared_key_works(&main, &helper);
    }

    #[test]
    fn test_rotation_requires_trust() {
        let main = side(0);
        assert!(matches!(
            begin_rotation(&main.trust, CoreId::MAIN, CoreId::new(4)),
            Err(TetherError::UnknownCore(_))
        ));
    }
}
