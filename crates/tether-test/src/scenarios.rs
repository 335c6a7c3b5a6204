//! End-to-end scenarios
//!
//! Each test drives a full main core against real workers, either in
//! process through [`Cluster`] or over HTTP.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use tether_core::{
    BootstrapPolicy, CoreId, CoreStatus, ImplementationType, RequestId, RequestStatus,
    RuntimeConfig, SecurityError, SessionPolicy, TetherError, TrustConfig,
};
use tether_crypto::{CryptoProvider, TrustStore};
use tether_runtime::{OperationTable, Runtime, Target, Worker};
use tether_transport::{FrameHandler, HttpServer, HttpTransport};
use tether_wire::{Direction, Envelope, Packet, RejectKind, RequestBody, ResponseBody};

use crate::{ChaosConfig, Cluster, ClusterConfig};

const CORE_1: CoreId = CoreId::new(1);
const CORE_2: CoreId = CoreId::new(2);

/// Request frame sealed by the main core's trust store, bypassing the dispatcher
fn sealed_request(trust: &TrustStore, core: CoreId, id: u64, payload: &[u8]) -> Vec<u8> {
    let body = RequestBody {
        operation: "echo".into(),
        payload: payload.to_vec(),
    }
    .to_bytes()
    .unwrap();
    let request = RequestId::new(id);
    let nonce = CryptoProvider::generate_nonce().unwrap();
    let (epoch, ciphertext) = trust
        .seal(core, &body, |epoch| {
            Envelope::aad(Direction::Request, CoreId::MAIN, request, epoch, &nonce)
        })
        .unwrap();
    Packet::Request(Envelope {
        core_id: CoreId::MAIN,
        request_id: request,
        epoch,
        nonce,
        ciphertext,
    })
    .to_bytes()
    .unwrap()
}

fn open_reply(trust: &TrustStore, frame: &[u8]) -> ResponseBody {
    let Packet::Response(envelope) = Packet::from_bytes(frame).unwrap() else {
        panic!("expected a response frame");
    };
    let plaintext = trust
        .open(
            envelope.core_id,
            envelope.epoch,
            &envelope.header_aad(Direction::Response),
            &envelope.ciphertext,
        )
        .unwrap();
    ResponseBody::from_bytes(&plaintext).unwrap()
}

fn reject_kind(frame: &[u8]) -> RejectKind {
    match Packet::from_bytes(frame).unwrap() {
        Packet::Reject(rejection) => rejection.kind,
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_round_trip_on_every_core() {
    let cluster = Cluster::start(ClusterConfig::with_cores(3)).await.unwrap();
    let runtime = cluster.runtime();

    for core in cluster.core_ids() {
        let response = runtime
            .call(Target::Core(core), "sha256", b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(response.core, core);
        assert_eq!(
            hex::encode(response.result.unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    let failed = runtime
        .call(Target::Auto, "fail", b"bad input".to_vec())
        .await
        .unwrap();
    assert_eq!(failed.result, Err("bad input".to_string()));
    assert_eq!(
        runtime.dispatcher().request_status(failed.request_id).ok(),
        Some(RequestStatus::Failed)
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_spread_and_release_load() {
    let cluster = Cluster::start(ClusterConfig::with_cores(2)).await.unwrap();
    let dispatcher = Arc::clone(cluster.runtime().dispatcher());

    let mut calls = JoinSet::new();
    for i in 0..24u32 {
        let dispatcher = Arc::clone(&dispatcher);
        calls.spawn(async move {
            let payload = if i % 2 == 0 { b"20".to_vec() } else { b"5".to_vec() };
            dispatcher
                .call(Target::Auto, "sleep", payload, Duration::from_secs(2))
                .await
        });
    }

    let mut cores = Vec::new();
    while let Some(joined) = calls.join_next().await {
        let response = joined.unwrap().unwrap();
        assert!(response.result.is_ok());
        cores.push(response.core);
    }
    assert!(cores.contains(&CORE_1));
    assert!(cores.contains(&CORE_2));

    for state in cluster.runtime().cores() {
        assert_eq!(state.load, 0, "{} still holds load", state.id());
        assert_eq!(state.status, CoreStatus::Trusted);
    }
    assert_eq!(dispatcher.in_flight(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_least_loaded_tie_goes_to_lowest_core() {
    let cluster = Cluster::start(ClusterConfig::with_cores(3)).await.unwrap();
    let registry = cluster.runtime().registry();

    // Loads [3, 1, 1]
    for _ in 0..3 {
        registry.increment_load(CORE_1).unwrap();
    }
    registry.increment_load(CORE_2).unwrap();
    registry.increment_load(CoreId::new(3)).unwrap();

    assert_eq!(registry.least_loaded_core(|_| true).unwrap(), CORE_2);
    let response = cluster
        .runtime()
        .call(Target::Auto, "echo", b"x".to_vec())
        .await
        .unwrap();
    assert_eq!(response.core, CORE_2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_timeout_releases_load() {
    let cluster = Cluster::start(ClusterConfig::with_cores(1)).await.unwrap();
    let runtime = cluster.runtime();

    let request = runtime
        .send(Target::Core(CORE_1), "sleep", b"300".to_vec())
        .await
        .unwrap();
    assert_eq!(runtime.registry().load(CORE_1).unwrap(), 1);

    let err = runtime
        .receive(request, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Timeout { core, .. } if core == CORE_1));
    assert_eq!(runtime.registry().load(CORE_1).unwrap(), 0);
    assert_eq!(
        runtime.dispatcher().request_status(request).ok(),
        Some(RequestStatus::TimedOut)
    );

    // The late response is dropped without touching the load again
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(runtime.registry().load(CORE_1).unwrap(), 0);
    assert_eq!(runtime.registry().status(CORE_1).unwrap(), CoreStatus::Trusted);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replayed_request_is_rejected() {
    let config = ClusterConfig {
        chaos: Some(ChaosConfig::calm()),
        ..ClusterConfig::with_cores(1)
    };
    let cluster = Cluster::start(config).await.unwrap();
    cluster
        .runtime()
        .call(Target::Core(CORE_1), "echo", b"once".to_vec())
        .await
        .unwrap();

    let chaos = cluster.chaos().unwrap();
    let captured = chaos
        .sent_to(CORE_1)
        .into_iter()
        .rev()
        .find(|frame| matches!(Packet::from_bytes(frame), Ok(Packet::Request(_))))
        .unwrap();

    let reply = cluster.worker(CORE_1).handle_frame(captured).await.unwrap();
    assert_eq!(reject_kind(&reply), RejectKind::Replay);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_tampered_request_fails_decryption() {
    let cluster = Cluster::start(ClusterConfig::with_cores(1)).await.unwrap();
    let trust = cluster.runtime().trust();

    let frame = sealed_request(trust, CORE_1, 900, b"payload");
    let Packet::Request(mut envelope) = Packet::from_bytes(&frame).unwrap() else {
        unreachable!();
    };
    envelope.ciphertext[0] ^= 0x01;
    let tampered = Packet::Request(envelope).to_bytes().unwrap();

    let reply = cluster.worker(CORE_1).handle_frame(tampered).await.unwrap();
    assert_eq!(reject_kind(&reply), RejectKind::Decryption);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restarted_helper_needs_trust_reset() {
    let cluster = Cluster::start(ClusterConfig::with_cores(1)).await.unwrap();
    let runtime = cluster.runtime();
    let dispatcher = runtime.dispatcher();
    let recorded = runtime.trust().fingerprint(CORE_1).unwrap();

    let restarted = cluster.restart_worker(CORE_1);

    // The new helper cannot read traffic under the old session
    let err = runtime
        .call(Target::Core(CORE_1), "echo", b"x".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.security_kind(), Some(&SecurityError::Decryption));

    // Nor can it take over the recorded identity
    let err = dispatcher.establish_trust(CORE_1).await.unwrap_err();
    match err.security_kind() {
        Some(SecurityError::TrustConflict { expected, presented }) => {
            assert_eq!(*expected, recorded);
            assert_eq!(*presented, restarted.fingerprint());
        }
        other => panic!("expected a trust conflict, got {:?}", other),
    }
    assert_eq!(runtime.trust().fingerprint(CORE_1), Some(recorded));

    // Explicit reset accepts the new identity on next contact
    dispatcher.forget_trust(CORE_1).unwrap();
    assert_eq!(runtime.registry().status(CORE_1).unwrap(), CoreStatus::Initialized);
    let response = runtime
        .call(Target::Core(CORE_1), "echo", b"again".to_vec())
        .await
        .unwrap();
    assert_eq!(response.result, Ok(b"again".to_vec()));
    assert_eq!(runtime.trust().fingerprint(CORE_1), Some(restarted.fingerprint()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rotation_honours_grace_window() {
    let config = ClusterConfig {
        trust: TrustConfig {
            rotation_grace: Duration::from_millis(150),
            ..TrustConfig::default()
        },
        ..ClusterConfig::with_cores(1)
    };
    let cluster = Cluster::start(config).await.unwrap();
    let runtime = cluster.runtime();
    let trust = runtime.trust();
    let worker = cluster.worker(CORE_1);

    let before = trust.epoch(CORE_1).unwrap();
    let in_grace = sealed_request(trust, CORE_1, 901, b"old key");
    let too_late = sealed_request(trust, CORE_1, 902, b"old key");

    let epoch = runtime.dispatcher().rotate_keys(CORE_1).await.unwrap();
    assert!(epoch > before);
    assert_eq!(trust.epoch(CORE_1), Some(epoch));
    assert_eq!(worker.trust().epoch(CoreId::MAIN), Some(epoch));

    // Sealed under the old epoch, delivered within the grace window
    let reply = worker.handle_frame(in_grace).await.unwrap();
    assert_eq!(open_reply(trust, &reply).into_result(), Ok(b"old key".to_vec()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let reply = worker.handle_frame(too_late).await.unwrap();
    assert_eq!(reject_kind(&reply), RejectKind::Decryption);

    // Traffic under the new epoch is unaffected
    let response = runtime
        .call(Target::Core(CORE_1), "echo", b"new key".to_vec())
        .await
        .unwrap();
    assert_eq!(response.result, Ok(b"new key".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_core_is_skipped_until_it_recovers() {
    let cluster = Cluster::start(ClusterConfig::with_cores(2)).await.unwrap();
    let runtime = cluster.runtime();
    cluster.set_alive(CORE_1, false);

    for round in 1..=3 {
        let reports = cluster.probe().await;
        let report = reports.iter().find(|r| r.core == CORE_1).unwrap();
        assert!(!report.alive);
        let expected = if round < 3 {
            CoreStatus::Trusted
        } else {
            CoreStatus::Unresponsive
        };
        assert_eq!(report.status, expected, "after probe {}", round);
    }

    let response = runtime.call(Target::Auto, "echo", b"x".to_vec()).await.unwrap();
    assert_eq!(response.core, CORE_2);
    let err = runtime
        .send(Target::Core(CORE_1), "echo", b"x".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::HelperCrash { core } if core == CORE_1));

    // One good probe restores eligibility
    cluster.set_alive(CORE_1, true);
    let reports = cluster.probe().await;
    assert!(reports.iter().all(|r| r.alive && r.status == CoreStatus::Trusted));
    let response = runtime.call(Target::Auto, "echo", b"x".to_vec()).await.unwrap();
    assert_eq!(response.core, CORE_1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_overloaded_core_is_skipped() {
    let mut config = ClusterConfig::with_cores(2);
    config.health.overload_ceiling = 2;
    let cluster = Cluster::start(config).await.unwrap();
    let runtime = cluster.runtime();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(
            runtime
                .send(Target::Core(CORE_1), "sleep", b"200".to_vec())
                .await
                .unwrap(),
        );
    }
    let reports = cluster.probe().await;
    assert_eq!(reports[0].status, CoreStatus::Overloaded);
    assert_eq!(reports[1].status, CoreStatus::Trusted);

    let response = runtime.call(Target::Auto, "echo", b"x".to_vec()).await.unwrap();
    assert_eq!(response.core, CORE_2);

    // In-flight work on the overloaded core still completes
    for request in held {
        let response = runtime.receive(request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.core, CORE_1);
    }
    let reports = cluster.probe().await;
    assert_eq!(reports[0].status, CoreStatus::Trusted);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lossy_transport_recovers_through_retries() {
    let mut config = ClusterConfig::with_cores(2);
    config.chaos = Some(ChaosConfig::lossy(0.3));
    config.dispatch.max_retries = 8;
    let cluster = Cluster::start(config).await.unwrap();
    let runtime = cluster.runtime();

    for i in 0..30u32 {
        let payload = i.to_be_bytes().to_vec();
        let response = runtime
            .call(Target::Auto, "echo", payload.clone())
            .await
            .unwrap();
        assert_eq!(response.result, Ok(payload));
    }

    let stats = cluster.chaos().unwrap().stats();
    assert!(stats.failed > 0);
    assert!(stats.delivered >= 30);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_secret_must_match() {
    let shared = BootstrapPolicy::PreSharedSecret([7u8; 32]);

    let config = ClusterConfig {
        bootstrap: shared.clone(),
        ..ClusterConfig::with_cores(2)
    };
    let cluster = Cluster::new(config).unwrap();
    assert_eq!(cluster.runtime().start().await.unwrap(), 2);
    cluster.shutdown().await;

    let config = ClusterConfig {
        bootstrap: shared,
        worker_bootstrap: Some(BootstrapPolicy::PreSharedSecret([8u8; 32])),
        ..ClusterConfig::with_cores(2)
    };
    let cluster = Cluster::new(config).unwrap();
    let runtime = cluster.runtime();
    assert_eq!(runtime.start().await.unwrap(), 0);
    for state in runtime.cores() {
        assert_eq!(state.status, CoreStatus::Initialized);
    }
    // Auto still tries to win a core back, and the handshake still fails
    let err = runtime.call(Target::Auto, "echo", vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        TetherError::Handshake { .. } | TetherError::Security { .. }
    ));
    assert_eq!(runtime.registry().status(CORE_1).unwrap(), CoreStatus::Initialized);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_expired_sessions_restored_by_health_check() {
    let config = ClusterConfig {
        trust: TrustConfig {
            session: SessionPolicy {
                max_age: Some(Duration::from_millis(200)),
                max_uses: None,
            },
            ..TrustConfig::default()
        },
        ..ClusterConfig::with_cores(2)
    };
    let cluster = Cluster::start(config).await.unwrap();
    let runtime = cluster.runtime();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!runtime.dispatcher().verify_trust(CORE_1));
    assert!(!runtime.dispatcher().verify_trust(CORE_2));

    let reports = cluster.probe().await;
    assert!(reports.iter().all(|r| r.alive && r.status == CoreStatus::Trusted));
    assert_eq!(runtime.trust().epoch(CORE_1), Some(1));
    assert_eq!(cluster.worker(CORE_1).trust().epoch(CoreId::MAIN), Some(1));

    let response = runtime.call(Target::Auto, "echo", b"x".to_vec()).await.unwrap();
    assert_eq!(response.core, CORE_1);
    assert_eq!(response.result, Ok(b"x".to_vec()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_auto_recovers_when_no_core_is_trusted() {
    let cluster = Cluster::new(ClusterConfig::with_cores(2)).unwrap();
    let runtime = cluster.runtime();

    // Every startup handshake fails
    cluster.set_alive(CORE_1, false);
    cluster.set_alive(CORE_2, false);
    assert_eq!(runtime.start().await.unwrap(), 0);
    assert!(runtime
        .cores()
        .iter()
        .all(|state| state.status == CoreStatus::Initialized));

    cluster.set_alive(CORE_1, true);
    cluster.set_alive(CORE_2, true);
    let response = runtime.call(Target::Auto, "echo", b"back".to_vec()).await.unwrap();
    assert_eq!(response.core, CORE_1);
    assert_eq!(response.result, Ok(b"back".to_vec()));
    assert_eq!(runtime.registry().status(CORE_1).unwrap(), CoreStatus::Trusted);
    assert_eq!(runtime.registry().status(CORE_2).unwrap(), CoreStatus::Initialized);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_runtime_over_http() {
    let poll = Duration::from_millis(100);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let worker = Arc::new(Worker::new(
        CORE_1,
        BootstrapPolicy::Cleartext,
        OperationTable::builtin(),
    ));
    let server = HttpServer::new(worker as Arc<dyn FrameHandler>).poll_timeout(poll);
    tokio::spawn(server.serve(listener));

    let mut config = RuntimeConfig::new(ImplementationType::Httpd);
    config.number_of_cores = 1;
    config.host = "127.0.0.1".into();
    config.port = port;
    let transport = HttpTransport::new(&config.cores()).unwrap().with_poll_timeout(poll);
    let runtime = Runtime::with_transport(config, Arc::new(transport)).unwrap();

    assert_eq!(runtime.start().await.unwrap(), 1);
    let response = runtime
        .call(Target::Auto, "echo", b"over http".to_vec())
        .await
        .unwrap();
    assert_eq!(response.core, CORE_1);
    assert_eq!(response.result, Ok(b"over http".to_vec()));

    runtime.shutdown().await;
    assert!(runtime.cores().iter().all(|s| s.status == CoreStatus::Closed));
}
