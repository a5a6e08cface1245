//! Scenarios running a fleet of server replicas end to end.

use std::{sync::Arc, time::Duration};

use crate::{
    cipher::names,
    cluster::{control, ClusterState, MembershipManager, SCHEDULER},
    comm::MessageHandler,
    round::{
        kernels::{
            messages::{
                encode_request,
                ClientKeysList,
                ExchangeKeysRequest,
                GetKeysRequest,
                Response,
                ResponseCode,
            },
            EXCHANGE_KEYS,
            GET_KEYS,
            RECONSTRUCT_SECRETS,
        },
        RoundPhase,
    },
    server::ServerNode,
    settings::{CipherSettings, ClusterSettings, StoreSettings},
    tests::utils::{enable_logging, round_settings, ServerFleet},
};

fn exchange_keys(fl_id: &str, iteration: u64) -> Vec<u8> {
    encode_request(&ExchangeKeysRequest {
        fl_id: fl_id.to_string(),
        iteration,
        keys: vec![
            format!("{}-c", fl_id).into_bytes(),
            format!("{}-s", fl_id).into_bytes(),
        ],
    })
    .unwrap()
    .to_vec()
}

fn get_keys(fl_id: &str, iteration: u64) -> Vec<u8> {
    encode_request(&GetKeysRequest {
        fl_id: fl_id.to_string(),
        iteration,
    })
    .unwrap()
    .to_vec()
}

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_key_exchange_across_replicas() {
    enable_logging();
    let fleet = ServerFleet::new(&["s0", "s1", "s2"], vec![round_settings(EXCHANGE_KEYS, 2)]);
    let node = fleet.node("s0");

    for client in &["A", "B"] {
        let response = node
            .dispatch(EXCHANGE_KEYS, &exchange_keys(client, 0))
            .await
            .unwrap();
        assert!(response.valid);
    }
    let round = node.round(EXCHANGE_KEYS).unwrap();
    assert_eq!(round.phase().await, RoundPhase::ThresholdReached);
    assert_eq!(node.iteration().current(), 1);

    // the keys are visible from any replica, whichever owns them
    let keys = fleet
        .node("s2")
        .cipher()
        .client_keys(names::CLIENTS_KEYS)
        .await
        .unwrap();
    assert_eq!(keys.keys().collect::<Vec<_>>(), vec!["A", "B"]);
    assert_eq!(keys["A"].public_key_1, b"A-c".to_vec());
    assert_eq!(keys["B"].public_key_2, b"B-s".to_vec());

    // a late client is turned away until the next iteration
    let response = node
        .dispatch(EXCHANGE_KEYS, &exchange_keys("C", 1))
        .await
        .unwrap();
    assert!(!response.valid);
    let response = Response::<()>::decode(&response.response).unwrap();
    assert_eq!(response.code, ResponseCode::OutOfTime);
}

#[tokio::test]
async fn test_keys_survive_until_the_pass_ends() {
    enable_logging();
    let fleet = ServerFleet::new(
        &["s0", "s1", "s2"],
        vec![round_settings(EXCHANGE_KEYS, 2), round_settings(GET_KEYS, 2)],
    );
    let drivers = fleet.spawn_iteration_drivers();
    let fleet = &fleet;

    for client in &["A", "B"] {
        assert!(fleet
            .node("s0")
            .dispatch(EXCHANGE_KEYS, &exchange_keys(client, 0))
            .await
            .unwrap()
            .valid);
    }
    assert!(
        eventually(move || async move {
            for node in fleet.nodes() {
                let round = node.round(EXCHANGE_KEYS).unwrap();
                if node.iteration().current() != 1 || round.phase().await != RoundPhase::Idle {
                    return false;
                }
            }
            true
        })
        .await
    );

    // the drivers moved on to the next round without dropping the exchanged keys
    let node = fleet.node("s1");
    let response = node.dispatch(GET_KEYS, &get_keys("A", 1)).await.unwrap();
    assert!(response.valid);
    let response = Response::<ClientKeysList>::decode(&response.response).unwrap();
    assert_eq!(response.code, ResponseCode::Succeed);
    assert_eq!(
        response.body.unwrap().keys().collect::<Vec<_>>(),
        vec!["A", "B"]
    );
    assert!(node.dispatch(GET_KEYS, &get_keys("B", 1)).await.unwrap().valid);
    assert_eq!(node.iteration().current(), 2);

    // getKeys is the last round, so the pass is over and the protocol state cleared
    assert!(
        eventually(move || async move {
            for node in fleet.nodes() {
                let cipher = node.cipher();
                let keys = cipher.client_keys(names::CLIENTS_KEYS).await.unwrap();
                let roster = cipher
                    .client_roster(names::EXCHANGE_KEYS_CLIENT_LIST)
                    .await
                    .unwrap();
                if !keys.is_empty() || !roster.is_empty() {
                    return false;
                }
            }
            true
        })
        .await
    );
    for driver in drivers {
        driver.abort();
    }
}

#[tokio::test]
async fn test_round_times_out() {
    enable_logging();
    tokio::time::pause();
    let mut settings = round_settings(EXCHANGE_KEYS, 5);
    settings.time_window = 100;
    let fleet = ServerFleet::new(&["s0", "s1", "s2"], vec![settings]);
    let node = fleet.node("s1");
    let mut listener = node.iteration().listener();

    for client in &["A", "B"] {
        assert!(node
            .dispatch(EXCHANGE_KEYS, &exchange_keys(client, 0))
            .await
            .unwrap()
            .valid);
    }
    let round = node.round(EXCHANGE_KEYS).unwrap();
    assert_eq!(round.phase().await, RoundPhase::Counting);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(round.phase().await, RoundPhase::TimedOut);
    assert_eq!(node.iteration().current(), 1);
    let event = listener.next_event().await.unwrap();
    assert!(!event.valid);
    assert_eq!(event.round, EXCHANGE_KEYS);

    node.reset_rounds().await;
    assert_eq!(round.phase().await, RoundPhase::Idle);
    assert_eq!(round.count().await, 0);
}

#[tokio::test]
async fn test_scale_out_with_safe_mode() {
    enable_logging();
    let mut reconstruct = round_settings(RECONSTRUCT_SECRETS, 0);
    reconstruct.server_num_as_threshold = true;
    let rounds = vec![round_settings(EXCHANGE_KEYS, 2), reconstruct];
    let store = StoreSettings::default();
    let cipher = CipherSettings::default();
    let fleet = ServerFleet::with_settings(&["s0", "s1"], &rounds, store, cipher);

    let manager = MembershipManager::new(
        ClusterSettings {
            worker_num: 0,
            server_num: 2,
            ..ClusterSettings::default()
        },
        Arc::new(fleet.network.communicator(SCHEDULER)),
    );
    let scheduler: Arc<dyn MessageHandler> = manager.clone();
    fleet.network.join(SCHEDULER, scheduler);
    for (rank, node) in fleet.nodes().enumerate() {
        assert_eq!(node.register().await.unwrap(), rank as u32);
    }
    for node in fleet.nodes() {
        node.heartbeat().await.unwrap();
    }
    assert_eq!(manager.state(), ClusterState::Ready);

    control::serve(
        &manager,
        control::SCALE_OUT,
        br#"{"worker_num": 0, "server_num": 1}"#,
    )
    .await
    .unwrap();
    // the replicas in place acknowledged on their own, the new one is still missing
    assert_eq!(manager.state(), ClusterState::ScaleOut);
    for node in fleet.nodes() {
        assert!(node.safe_mode().is_enabled());
        let response = node
            .dispatch(EXCHANGE_KEYS, &exchange_keys("A", 0))
            .await
            .unwrap();
        assert!(!response.valid);
    }

    let servers: Vec<_> = vec!["s0".to_string(), "s1".to_string(), "s2".to_string()];
    let joining = ServerNode::new(
        Arc::new(fleet.network.communicator("s2")),
        &servers,
        store,
        cipher,
        &rounds,
    )
    .unwrap();
    let handler: Arc<dyn MessageHandler> = joining.clone();
    fleet.network.join("s2", handler);
    assert_eq!(joining.register().await.unwrap(), 2);
    assert_eq!(manager.state(), ClusterState::Ready);
    assert_eq!(joining.heartbeat().await.unwrap(), ClusterState::Ready);

    for node in fleet.nodes().chain(std::iter::once(&joining)) {
        assert!(!node.safe_mode().is_enabled());
        assert_eq!(node.round(RECONSTRUCT_SECRETS).unwrap().threshold().await, 3);
        assert_eq!(
            node.store().owner_of(names::CLIENTS_KEYS),
            joining.store().owner_of(names::CLIENTS_KEYS)
        );
    }

    // the grown cluster serves requests again, with the keys owned wherever the new ring says
    for client in &["A", "B"] {
        assert!(fleet
            .node("s0")
            .dispatch(EXCHANGE_KEYS, &exchange_keys(client, 0))
            .await
            .unwrap()
            .valid);
    }
    let keys = joining
        .cipher()
        .client_keys(names::CLIENTS_KEYS)
        .await
        .unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(fleet.node("s0").iteration().current(), 1);
}
