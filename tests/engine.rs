//! End-to-end tests through the string/JSON control surface.

use meshvpn::events::{Event, EventCallback};
use meshvpn::transport::PeerState;
use meshvpn::{generate_public_key, generate_secret_key, MeshVpn, NodeEngine, ResultCode};
use std::sync::{Arc, Mutex};

struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventCallback for Recorder {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn surface_with_recorder() -> (MeshVpn, Arc<Recorder>) {
    let recorder = Recorder::new();
    let engine = NodeEngine::builder()
        .observer(recorder.clone())
        .build()
        .expect("engine should build");
    (MeshVpn::from_engine(engine), recorder)
}

fn surface() -> MeshVpn {
    MeshVpn::new().expect("engine should build")
}

fn peer_key() -> String {
    generate_public_key(&generate_secret_key()).unwrap()
}

fn one_peer_config(key: &str) -> String {
    format!(
        r#"{{"peers": [{{"public_key": "{}", "alias": "peer", "endpoint": "192.0.2.44:51820", "allowed_ips": ["10.64.0.7/32"]}}]}}"#,
        key
    )
}

#[test]
fn full_lifecycle_scenario() {
    let vpn = surface();

    assert_eq!(vpn.start(&generate_secret_key(), ""), ResultCode::Ok);
    assert_ne!(vpn.get_adapter_luid(), 0);

    let peer = peer_key();
    assert_eq!(vpn.set_meshnet(&one_peer_config(&peer)), ResultCode::Ok);

    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    let peers = status["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["public_key"], peer);
    let state = peers[0]["state"].as_str().unwrap();
    assert!(state == "connecting" || state == "connected");

    assert_eq!(vpn.stop(), ResultCode::Ok);
    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    assert_eq!(status["state"], "stopped");
    assert!(status.get("adapter").is_none());
    assert!(status["peers"].as_array().unwrap().is_empty());
    assert!(status.get("exit_node").is_none());
    assert_eq!(vpn.get_adapter_luid(), 0);
}

#[test]
fn double_start_and_benign_stop() {
    let vpn = surface();
    assert_eq!(vpn.stop(), ResultCode::Ok);

    let key = generate_secret_key();
    assert_eq!(vpn.start(&key, ""), ResultCode::Ok);
    assert_eq!(vpn.start(&key, ""), ResultCode::AlreadyStarted);
    assert_eq!(vpn.stop(), ResultCode::Ok);
    assert_eq!(vpn.stop(), ResultCode::Ok);
    // Stopped -> Started is a valid transition
    assert_eq!(vpn.start(&key, ""), ResultCode::Ok);
}

#[test]
fn config_swap_never_shows_both_memberships() {
    let (vpn, recorder) = surface_with_recorder();
    vpn.start(&generate_secret_key(), "");

    let (a, b) = (peer_key(), peer_key());
    assert_eq!(vpn.set_meshnet(&one_peer_config(&a)), ResultCode::Ok);
    assert_eq!(vpn.set_meshnet(&one_peer_config(&b)), ResultCode::Ok);

    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    let peers = status["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["public_key"], b);

    // Force delivery of everything published so far
    vpn.stop();
    let events = recorder.snapshot();
    let a_gone = events
        .iter()
        .position(|e| matches!(e, Event::Peer { public_key, state } if public_key.to_base64() == a && *state == PeerState::Disconnected))
        .expect("a should disconnect");
    let b_seen = events
        .iter()
        .position(|e| matches!(e, Event::Peer { public_key, state } if public_key.to_base64() == b && *state == PeerState::Connecting))
        .expect("b should connect");
    assert!(a_gone < b_seen);
}

#[test]
fn removing_all_peers_yields_empty_status() {
    let vpn = surface();
    vpn.start(&generate_secret_key(), "");

    assert_eq!(vpn.set_meshnet(&one_peer_config(&peer_key())), ResultCode::Ok);
    assert_eq!(vpn.set_meshnet(r#"{"peers": []}"#), ResultCode::Ok);

    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    assert!(status["peers"].as_array().unwrap().is_empty());
}

#[test]
fn duplicate_peer_keys_leave_config_untouched() {
    let vpn = surface();
    vpn.start(&generate_secret_key(), "");

    let good = peer_key();
    assert_eq!(vpn.set_meshnet(&one_peer_config(&good)), ResultCode::Ok);

    let dup = peer_key();
    let bad = format!(
        r#"{{"peers": [{{"public_key": "{0}"}}, {{"public_key": "{0}"}}]}}"#,
        dup
    );
    assert_eq!(vpn.set_meshnet(&bad), ResultCode::BadConfig);

    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    let peers = status["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["public_key"], good);
}

#[test]
fn exit_node_replacement_keeps_exactly_one() {
    let (vpn, recorder) = surface_with_recorder();
    vpn.start(&generate_secret_key(), "");

    let (a, b) = (peer_key(), peer_key());
    assert_eq!(vpn.connect_to_exit_node(&a, "203.0.113.9:51820", ""), ResultCode::Ok);
    assert_eq!(vpn.connect_to_exit_node(&b, "", ""), ResultCode::Ok);

    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    assert_eq!(status["exit_node"]["public_key"], b);

    vpn.stop();
    let events = recorder.snapshot();
    let a_gone = events
        .iter()
        .position(|e| matches!(e, Event::ExitNode { public_key, state } if public_key.to_base64() == a && *state == PeerState::Disconnected))
        .expect("a should disconnect");
    let b_seen = events
        .iter()
        .position(|e| matches!(e, Event::ExitNode { public_key, state } if public_key.to_base64() == b && *state == PeerState::Connecting))
        .expect("b should connect");
    assert!(a_gone < b_seen);
}

#[test]
fn stale_exit_node_disconnect_is_reported() {
    let vpn = surface();
    vpn.start(&generate_secret_key(), "");

    let active = peer_key();
    vpn.connect_to_exit_node(&active, "", "");
    assert_eq!(
        vpn.disconnect_from_exit_node(&peer_key()),
        ResultCode::Error
    );
    assert!(!vpn.get_last_error().is_empty());

    // The active node survived the stale request
    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    assert_eq!(status["exit_node"]["public_key"], active);

    assert_eq!(vpn.disconnect_from_exit_nodes(), ResultCode::Ok);
    assert_eq!(vpn.disconnect_from_exit_nodes(), ResultCode::Ok);
}

#[test]
fn exit_cycle_through_meshnet_peer_keeps_its_session() {
    let vpn = surface();
    vpn.start(&generate_secret_key(), "");

    let shared = peer_key();
    assert_eq!(vpn.set_meshnet(&one_peer_config(&shared)), ResultCode::Ok);
    assert_eq!(vpn.connect_to_exit_node(&shared, "", ""), ResultCode::Ok);
    assert_eq!(vpn.disconnect_from_exit_nodes(), ResultCode::Ok);

    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    assert!(status.get("exit_node").is_none());
    let peers = status["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["public_key"], shared);
    // A live session still backs the peer after the exit-node cycle
    assert!(peers[0]["last_handshake_ms"].is_u64());
    assert_ne!(peers[0]["state"], "disconnected");
}

#[test]
fn key_rotation_never_exposes_half_rotated_identity() {
    let vpn = Arc::new(surface());
    vpn.start(&generate_secret_key(), "");

    let writer = {
        let vpn = vpn.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                let key = generate_secret_key();
                // Contention with the reader may yield LOCK_ERROR; that is
                // the documented retryable outcome, not a failure
                let code = vpn.set_private_key(&key);
                assert!(code == ResultCode::Ok || code == ResultCode::LockError);
            }
        })
    };

    for _ in 0..200 {
        let secret = vpn.get_private_key();
        if secret.is_empty() {
            continue;
        }
        let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
        if status == serde_json::json!({}) {
            continue;
        }
        if let (Ok(derived), Some(reported)) = (
            generate_public_key(&secret),
            status["public_key"].as_str(),
        ) {
            // A snapshot may be older than the secret we just read, but each
            // snapshot's own key pair must be internally consistent; re-read
            // to tolerate a rotation between the two calls
            if derived != reported && vpn.get_private_key() == secret {
                panic!("status shows {} for secret deriving {}", reported, derived);
            }
        }
    }

    writer.join().unwrap();
}

#[test]
fn network_change_requires_started_engine() {
    let vpn = surface();
    assert_eq!(vpn.notify_network_change("eth0 up"), ResultCode::Error);

    vpn.start(&generate_secret_key(), "");
    assert_eq!(vpn.notify_network_change("eth0 up"), ResultCode::Ok);
}

#[test]
fn start_with_tun_descriptor() {
    let vpn = surface();
    assert_eq!(
        vpn.start_with_tun(&generate_secret_key(), "", 9),
        ResultCode::Ok
    );
    assert_ne!(vpn.get_adapter_luid(), 0);
    assert_eq!(vpn.stop(), ResultCode::Ok);
}

#[test]
fn named_start_reports_adapter_name() {
    let vpn = surface();
    assert_eq!(
        vpn.start_named(&generate_secret_key(), "boringtun", "mesh-test1"),
        ResultCode::Ok
    );
    let status: serde_json::Value = serde_json::from_str(&vpn.get_status_map()).unwrap();
    assert_eq!(status["adapter"]["name"], "mesh-test1");
    assert_eq!(status["adapter"]["kind"], "boringtun");
}
