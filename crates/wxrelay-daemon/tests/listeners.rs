//! Listener lifecycle tests: discovery, timeout, revival, recovery and the
//! cap, driven against a mock WeChat daemon.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wxrelay_client::{InstanceConfig, InstanceRegistry, PollFlags};
use wxrelay_common::ListenerStatus;
use wxrelay_daemon::health::{ErrorRing, FatalSignal, PipelineCounters};
use wxrelay_daemon::ingress::MessageIngress;
use wxrelay_daemon::listener::{ListenerManager, ListenerSettings};
use wxrelay_store::Store;

const TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn manager(server_uri: &str, store: Store, max_listeners: u32) -> ListenerManager {
    let registry = Arc::new(InstanceRegistry::new(vec![InstanceConfig {
        instance_id: "A".to_string(),
        name: String::new(),
        base_url: server_uri.to_string(),
        api_key: SecretString::from("k"),
        enabled: true,
        timeout_seconds: 5,
    }]));
    let counters = Arc::new(PipelineCounters::new());
    let ingress = Arc::new(MessageIngress::new(store.clone(), counters));
    ListenerManager::new(
        store,
        registry,
        ingress,
        ListenerSettings {
            poll_interval: Duration::from_secs(1),
            timeout: TIMEOUT,
            max_listeners,
            poll_flags: PollFlags::default(),
        },
        Arc::new(ErrorRing::new()),
        Arc::new(FatalSignal::new()),
    )
}

async fn mount_ok(server: &MockServer, http_method: &str, route: &str) {
    Mock::given(method(http_method))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn timed_out_listener_is_inactivated_then_revived_by_new_traffic() {
    let server = MockServer::start().await;
    mount_ok(&server, "POST", "/api/message/listen/add").await;
    Mock::given(method("POST"))
        .and(path("/api/message/listen/remove"))
        .and(body_partial_json(json!({"who": "alice"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/wechat/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "data": {"online": true}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/system/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/message/get-next-new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": {"messages": {"alice": [{
                "id": "m-new", "mtype": 1, "type": "friend",
                "sender": "alice", "content": "back again"
            }]}}
        })))
        .mount(&server)
        .await;

    let store = Store::open_in_memory().unwrap();
    let manager = manager(&server.uri(), store.clone(), 30);

    let t0 = 1_700_000_000;
    assert!(manager.ensure_listener("A", "alice", false, t0).await.unwrap());

    // Push the listener past the idle window and run housekeeping.
    let now = t0 + TIMEOUT.as_secs() as i64 + 60;
    manager.housekeeping(now).await;

    let listener = store
        .get_listener("A".to_string(), "alice".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listener.status, ListenerStatus::Inactive);

    // A new unread message from the same chat revives the listener.
    manager.poll_main_windows(now + 5).await;
    let listener = store
        .get_listener("A".to_string(), "alice".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listener.status, ListenerStatus::Active);
    assert!(!listener.manual_added);

    // The revived chat's message went through ingress.
    let message = store
        .get_message("A".to_string(), "m-new".to_string())
        .await
        .unwrap();
    assert!(message.is_some());
}

#[tokio::test]
async fn manual_listeners_survive_the_idle_window() {
    let server = MockServer::start().await;
    mount_ok(&server, "POST", "/api/message/listen/add").await;
    Mock::given(method("POST"))
        .and(path("/api/message/listen/remove"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/wechat/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "data": {"online": true}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/system/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
        .mount(&server)
        .await;

    let store = Store::open_in_memory().unwrap();
    let manager = manager(&server.uri(), store.clone(), 30);

    let t0 = 1_700_000_000;
    manager.ensure_listener("A", "ops group", true, t0).await.unwrap();
    manager.housekeeping(t0 + TIMEOUT.as_secs() as i64 + 3600).await;

    let listener = store
        .get_listener("A".to_string(), "ops group".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listener.status, ListenerStatus::Active);
}

#[tokio::test]
async fn auto_adds_stop_at_the_cap_but_manual_adds_do_not() {
    let server = MockServer::start().await;
    mount_ok(&server, "POST", "/api/message/listen/add").await;

    let store = Store::open_in_memory().unwrap();
    let manager = manager(&server.uri(), store.clone(), 2);

    let t0 = 1_700_000_000;
    assert!(manager.ensure_listener("A", "chat-1", false, t0).await.unwrap());
    assert!(manager.ensure_listener("A", "chat-2", false, t0).await.unwrap());
    // Cap reached: the third auto-add is refused.
    assert!(!manager.ensure_listener("A", "chat-3", false, t0).await.unwrap());
    // An operator add is forced through regardless.
    assert!(manager.ensure_listener("A", "ops group", true, t0).await.unwrap());

    let active = store
        .list_listeners(Some("A".to_string()), Some(ListenerStatus::Active))
        .await
        .unwrap();
    assert_eq!(active.len(), 3);
}

#[tokio::test]
async fn lost_remote_subscription_is_rearmed_when_instance_recovers() {
    let server = MockServer::start().await;
    // First add succeeds, then the listener poll finds the subscription
    // gone, then housekeeping re-arms it.
    Mock::given(method("POST"))
        .and(path("/api/message/listen/add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/message/listen/get"))
        .respond_with(ResponseTemplate::new(404).set_body_string("listener not found"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/wechat/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0, "data": {"online": true}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/system/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
        .mount(&server)
        .await;

    let store = Store::open_in_memory().unwrap();
    let manager = manager(&server.uri(), store.clone(), 30);

    let t0 = 1_700_000_000;
    manager.ensure_listener("A", "alice", false, t0).await.unwrap();

    // The poll discovers the remote lost the subscription.
    manager.poll_listeners(t0 + 1).await;
    // Housekeeping sees the instance healthy and re-arms it (second add).
    manager.housekeeping(t0 + 2).await;

    let listener = store
        .get_listener("A".to_string(), "alice".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listener.status, ListenerStatus::Active);
}
