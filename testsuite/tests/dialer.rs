//! Exercises the real Dialer against a real (self-signed) TLS loopback controller — the one
//! piece of the engine that can't be driven through fakes alone, since it does real TCP
//! connect + TLS handshake + WebSocket upgrade.

use jimm_gateway::dialer::{DialOptions, Dialer};
use jimm_gateway::services::{AddressScope, CandidateAddress};

#[tokio::test]
async fn dials_single_candidate_successfully() {
    let identity = testsuite::self_signed_identity();
    let record = testsuite::spawn_fake_controller(&identity, vec![testsuite::respond_with(serde_json::json!({}))]).await;

    let socket = Dialer::dial(&record, &DialOptions::default()).await;
    assert!(socket.is_ok(), "expected a successful dial, got {:?}", socket.err());
}

#[tokio::test]
async fn races_past_a_dead_candidate() {
    let identity = testsuite::self_signed_identity();
    let mut record = testsuite::spawn_fake_controller(&identity, vec![testsuite::respond_with(serde_json::json!({}))]).await;

    // Nothing is listening on this port; the race should still succeed via the live candidate.
    record.addresses.push(CandidateAddress {
        host_port: "127.0.0.1:1".to_owned(),
        scope: AddressScope::parse("cloud-local"),
    });

    let socket = Dialer::dial(&record, &DialOptions::default()).await;
    assert!(socket.is_ok(), "expected the race to ignore the dead candidate, got {:?}", socket.err());
}

#[tokio::test]
async fn fails_when_no_dialable_addresses() {
    let record = jimm_gateway::services::ControllerRecord {
        ca_certificate: String::new(),
        tls_hostname: "controller.example".to_owned(),
        public_address: None,
        addresses: vec![CandidateAddress {
            host_port: "10.0.0.1:17070".to_owned(),
            scope: AddressScope::parse("machine-local"),
        }],
    };

    let result = Dialer::dial(&record, &DialOptions::default()).await;
    assert!(result.is_err());
}
