//! Helper-side request handling
//!
//! A `Worker` is the responder end of every handshake, accepts key
//! rotations, and executes incoming requests against its operation table.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tether_core::{BootstrapPolicy, CoreId, Fingerprint, RequestId, TetherResult, TrustConfig};
use tether_crypto::{accept_rotation, CryptoProvider, Handshake, HandshakeState, Identity, TrustStore};
use tether_transport::FrameHandler;
use tether_wire::{
    Direction, Envelope, HandshakeKind, HandshakeMessage, Packet, RejectKind, Rejection,
    RequestBody, ResponseBody,
};

use crate::OperationTable;

/// Helper core runtime
pub struct Worker {
    identity: Arc<Identity>,
    bootstrap: BootstrapPolicy,
    trust: TrustStore,
    operations: OperationTable,
    /// Responder handshake awaiting its key exchange
    pending: Mutex<Option<Handshake>>,
}

impl Worker {
    pub fn new(core_id: CoreId, bootstrap: BootstrapPolicy, operations: OperationTable) -> Self {
        Self::with_trust_config(core_id, bootstrap, operations, TrustConfig::default())
    }

    pub fn with_trust_config(
        core_id: CoreId,
        bootstrap: BootstrapPolicy,
        operations: OperationTable,
        trust: TrustConfig,
    ) -> Self {
        let identity = Arc::new(Identity::generate(core_id));
        info!(core = %core_id, fingerprint = %identity.fingerprint(), "worker identity generated");
        Worker {
            identity,
            bootstrap,
            trust: TrustStore::new(trust),
            operations,
            pending: Mutex::new(None),
        }
    }

    pub fn core_id(&self) -> CoreId {
        self.identity.core_id()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// Process one packet, producing the reply if any
    pub async fn handle_packet(&self, packet: Packet) -> Option<Packet> {
        match packet {
            Packet::Handshake(msg) => Some(self.on_handshake(msg)),
            Packet::Request(envelope) => Some(self.handle_incoming_request(envelope).await),
            Packet::Ping { probe_id } => Some(Packet::Pong { probe_id }),
            other => {
                warn!(core = %self.core_id(), packet = other.name(), "unexpected packet ignored");
                None
            }
        }
    }

    fn on_handshake(&self, msg: HandshakeMessage) -> Packet {
        let peer = msg.core_id;
        let result = match msg.kind {
            HandshakeKind::Hello => self.on_hello(&msg),
            HandshakeKind::KeyExchange => self.on_key_exchange(&msg),
            kind => {
                warn!(core = %self.core_id(), peer = %peer, ?kind, "initiator message sent to responder");
                return self.reject(None, RejectKind::Handshake, format!("unexpected {:?}", kind));
            }
        };

        match result {
            Ok(reply) => Packet::Handshake(reply),
            Err(e) => self.reject(None, RejectKind::Handshake, e.to_string()),
        }
    }

    fn on_hello(&self, hello: &HandshakeMessage) -> TetherResult<HandshakeMessage> {
        // A new Hello always starts a fresh attempt
        let mut handshake = Handshake::responder(
            Arc::clone(&self.identity),
            hello.core_id,
            self.bootstrap.clone(),
        );
        let ack = handshake.on_hello(hello, &self.trust)?;
        *self.pending.lock() = Some(handshake);
        Ok(ack)
    }

    fn on_key_exchange(&self, exchange: &HandshakeMessage) -> TetherResult<HandshakeMessage> {
        let pending = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(hs)
                    if hs.peer() == exchange.core_id
                        && hs.state() == HandshakeState::HelloReceived =>
                {
                    pending.take()
                }
                _ => None,
            }
        };

        match pending {
            Some(mut handshake) => handshake.on_key_exchange(exchange, &self.trust),
            // Key exchange outside a handshake is a rotation under the current key
            None => accept_rotation(&self.trust, self.core_id(), exchange),
        }
    }

    /// Decrypt, execute and answer one request
    pub async fn handle_incoming_request(&self, envelope: Envelope) -> Packet {
        let sender = envelope.core_id;
        let request = envelope.request_id;

        let plaintext = match self.trust.open(
            sender,
            envelope.epoch,
            &envelope.header_aad(Direction::Request),
            &envelope.ciphertext,
        ) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(core = %self.core_id(), request = %request, error = %e, "request rejected");
                return self.reject(Some(request), RejectKind::Decryption, e.to_string());
            }
        };

        // Only authenticated envelopes may claim a nonce
        if !self.trust.consume_nonce(sender, envelope.nonce) {
            return self.reject(Some(request), RejectKind::Replay, "nonce already used");
        }

        let body = match RequestBody::from_bytes(&plaintext) {
            Ok(body) => body,
            Err(e) => return self.reject(Some(request), RejectKind::Malformed, e.to_string()),
        };

        debug!(core = %self.core_id(), request = %request, operation = %body.operation, "executing");
        let result = self.operations.invoke(&body.operation, body.payload).await;
        if let Err(message) = &result {
            debug!(core = %self.core_id(), request = %request, %message, "operation failed");
        }

        match self.seal_response(sender, request, envelope.epoch, ResponseBody::from(result)) {
            Ok(envelope) => Packet::Response(envelope),
            Err(e) => {
                warn!(core = %self.core_id(), request = %request, error = %e, "cannot seal response");
                self.reject(Some(request), RejectKind::Decryption, e.to_string())
            }
        }
    }

    fn seal_response(
        &self,
        peer: CoreId,
        request: RequestId,
        epoch: u32,
        body: ResponseBody,
    ) -> TetherResult<Envelope> {
        let me = self.core_id();
        let nonce = CryptoProvider::generate_nonce()?;
        let (epoch, ciphertext) = self.trust.seal_for_epoch(peer, epoch, &body.to_bytes()?, |epoch| {
            Envelope::aad(Direction::Response, me, request, epoch, &nonce)
        })?;

        Ok(Envelope {
            core_id: me,
            request_id: request,
            epoch,
            nonce,
            ciphertext,
        })
    }

    fn reject(&self, request: Option<RequestId>, kind: RejectKind, reason: impl Into<String>) -> Packet {
        Packet::Reject(Rejection {
            core_id: self.core_id(),
            request_id: request,
            kind,
            reason: reason.into(),
        })
    }
}

#[async_trait]
impl FrameHandler for Worker {
    async fn handle_frame(&self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let reply = match Packet::from_bytes(&frame) {
            Ok(packet) => self.handle_packet(packet).await?,
            Err(e) => {
                warn!(core = %self.core_id(), error = %e, "undecodable frame");
                self.reject(None, RejectKind::Malformed, e.to_string())
            }
        };

        match reply.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(core = %self.core_id(), error = %e, "cannot encode reply");
                None
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("core", &self.core_id())
            .field("fingerprint", &self.fingerprint())
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_crypto::{begin_rotation, complete_rotation};

    struct Main {
        identity: Arc<Identity>,
        trust: TrustStore,
    }

    impl Main {
        fn new() -> Self {
            Main {
                identity: Arc::new(Identity::generate(CoreId::MAIN)),
                trust: TrustStore::default(),
            }
        }

        async fn handshake(&self, worker: &Worker) -> TetherResult<()> {
            let core = worker.core_id();
            let mut hs = Handshake::initiator(self.identity.clone(), core, BootstrapPolicy::Cleartext);
            let ack = expect_handshake(worker.handle_packet(Packet::Handshake(hs.start()?)).await);
            let exchange = hs.on_hello_ack(&ack, &self.trust)?;
            let confirm = expect_handshake(worker.handle_packet(Packet::Handshake(exchange)).await);
            hs.on_key_exchange_ack(&confirm, &self.trust)
        }

        fn request(&self, core: CoreId, id: u64, operation: &str, payload: &[u8]) -> Envelope {
            let body = RequestBody {
                operation: operation.into(),
                payload: payload.to_vec(),
            }
            .to_bytes()
            .unwrap();
            let request = RequestId::new(id);
            let nonce = CryptoProvider::generate_nonce().unwrap();
            let (epoch, ciphertext) = self
                .trust
                .seal(core, &body, |epoch| {
                    Envelope::aad(Direction::Request, CoreId::MAIN, request, epoch, &nonce)
                })
                .unwrap();
            Envelope {
                core_id: CoreId::MAIN,
                request_id: request,
                epoch,
                nonce,
                ciphertext,
            }
        }

        fn open(&self, envelope: &Envelope) -> ResponseBody {
            let plaintext = self
                .trust
                .open(
                    envelope.core_id,
                    envelope.epoch,
                    &envelope.header_aad(Direction::Response),
                    &envelope.ciphertext,
                )
                .unwrap();
            ResponseBody::from_bytes(&plaintext).unwrap()
        }
    }

    fn expect_handshake(packet: Option<Packet>) -> HandshakeMessage {
        match packet {
            Some(Packet::Handshake(msg)) => msg,
            other => panic!("expected handshake reply, got {:?}", other),
        }
    }

    fn worker() -> Worker {
        Worker::new(CoreId::new(1), BootstrapPolicy::Cleartext, OperationTable::builtin())
    }

    #[tokio::test]
    async fn test_request_after_handshake() {
        let main = Main::new();
        let worker = worker();
        main.handshake(&worker).await.unwrap();

        let envelope = main.request(worker.core_id(), 1, "echo", b"payload");
        let reply = worker.handle_packet(Packet::Request(envelope)).await;
        let Some(Packet::Response(response)) = reply else {
            panic!("expected response, got {:?}", reply);
        };

        assert_eq!(response.request_id, RequestId::new(1));
        assert_eq!(main.open(&response).into_result(), Ok(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn test_operation_error_is_a_response() {
        let main = Main::new();
        let worker = worker();
        main.handshake(&worker).await.unwrap();

        let envelope = main.request(worker.core_id(), 2, "no-such-op", b"");
        let Some(Packet::Response(response)) = worker.handle_packet(Packet::Request(envelope)).await else {
            panic!("expected response");
        };
        assert!(main.open(&response).into_result().is_err());
    }

    #[tokio::test]
    async fn test_replayed_request_rejected() {
        let main = Main::new();
        let worker = worker();
        main.handshake(&worker).await.unwrap();

        let envelope = main.request(worker.core_id(), 3, "echo", b"once");
        assert!(matches!(
            worker.handle_packet(Packet::Request(envelope.clone())).await,
            Some(Packet::Response(_))
        ));
        match worker.handle_packet(Packet::Request(envelope)).await {
            Some(Packet::Reject(rejection)) => {
                assert_eq!(rejection.kind, RejectKind::Replay);
                assert_eq!(rejection.request_id, Some(RequestId::new(3)));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forged_request_does_not_burn_nonce() {
        let main = Main::new();
        let worker = worker();
        main.handshake(&worker).await.unwrap();

        let genuine = main.request(worker.core_id(), 5, "echo", b"genuine");
        let mut forged = genuine.clone();
        forged.ciphertext[0] ^= 0xFF;

        match worker.handle_packet(Packet::Request(forged)).await {
            Some(Packet::Reject(rejection)) => assert_eq!(rejection.kind, RejectKind::Decryption),
            other => panic!("expected rejection, got {:?}", other),
        }

        let reply = worker.handle_packet(Packet::Request(genuine)).await;
        let Some(Packet::Response(response)) = reply else {
            panic!("expected response, got {:?}", reply);
        };
        assert_eq!(main.open(&response).into_result(), Ok(b"genuine".to_vec()));
    }

    #[tokio::test]
    async fn test_request_without_trust_rejected() {
        let main = Main::new();
        let worker = worker();
        main.trust
            .record_first_contact(
                worker.core_id(),
                worker.fingerprint(),
                tether_crypto::SessionKey::new(CryptoProvider::generate_key().unwrap(), 0, Default::default()),
            )
            .unwrap();

        let envelope = main.request(worker.core_id(), 4, "echo", b"x");
        match worker.handle_packet(Packet::Request(envelope)).await {
            Some(Packet::Reject(rejection)) => assert_eq!(rejection.kind, RejectKind::Decryption),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_swap_refused_by_worker() {
        let main = Main::new();
        let worker = worker();
        main.handshake(&worker).await.unwrap();

        let impostor = Main::new();
        let mut hs = Handshake::initiator(impostor.identity.clone(), worker.core_id(), BootstrapPolicy::Cleartext);
        let reply = worker.handle_packet(Packet::Handshake(hs.start().unwrap())).await;
        match reply {
            Some(Packet::Reject(rejection)) => {
                assert_eq!(rejection.kind, RejectKind::Handshake);
                assert!(rejection.reason.contains("trust conflict"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(worker.trust().fingerprint(CoreId::MAIN), Some(main.identity.fingerprint()));
    }

    #[tokio::test]
    async fn test_rotation_through_worker() {
        let main = Main::new();
        let worker = worker();
        main.handshake(&worker).await.unwrap();
        let core = worker.core_id();

        let (offer, pending) = begin_rotation(&main.trust, CoreId::MAIN, core).unwrap();
        let ack = expect_handshake(worker.handle_packet(Packet::Handshake(offer)).await);
        complete_rotation(&main.trust, pending, &ack).unwrap();

        assert_eq!(main.trust.epoch(core), Some(1));
        assert_eq!(worker.trust().epoch(CoreId::MAIN), Some(1));

        let envelope = main.request(core, 5, "echo", b"rotated");
        let Some(Packet::Response(response)) = worker.handle_packet(Packet::Request(envelope)).await else {
            panic!("expected response");
        };
        assert_eq!(response.epoch, 1);
        assert_eq!(main.open(&response).into_result(), Ok(b"rotated".to_vec()));
    }

    #[tokio::test]
    async fn test_frame_level_handling() {
        let worker = worker();

        let pong = worker
            .handle_frame(Packet::Ping { probe_id: 9 }.to_bytes().unwrap())
            .await
            .unwrap();
        assert_eq!(Packet::from_bytes(&pong).unwrap(), Packet::Pong { probe_id: 9 });

        let garbage = worker.handle_frame(b"{".to_vec()).await.unwrap();
        assert!(matches!(
            Packet::from_bytes(&garbage).unwrap(),
            Packet::Reject(Rejection { kind: RejectKind::Malformed, request_id: None, .. })
        ));
    }
}
