/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use notification_dispatch::{
    bus::memory::InMemoryBus,
    common::{
        types::{MobileToken, NotificationContent, UserIdentity, WebPushKeys, WebSubscription},
        utils::decode_base64_flexible,
    },
    dispatch::{
        mobile::{MessagingClient, MessagingError, MobileDispatcher, SendResponse},
        web::{VapidConfig, WebDispatcher, WebPushTransport},
    },
    pipeline::{processor::Processor, runtime::Pipeline},
    registry::{memory::MemoryRegistry, TokenRegistry},
};
use web_push::{WebPushError, WebPushMessage};

const TEST_P256DH: &str =
    "BCRweRf_U5iQM4pKNucGRzM6OuLp8Hisa8yX0N2ePIf1oxKitvFT6qvuGgYoTxlMatMDaytXbZR3rVClc2w_p6U";
const TEST_AUTH: &str = "AAAAAAAAAAAAAAAAAAAAAA";
const TEST_VAPID_PRIVATE: &str = "9pKJeIXAyyCj5M0QagsVvDYHlPF-cymJCbB5iHPsdEE";

fn test_vapid() -> VapidConfig {
    VapidConfig {
        public_key: TEST_P256DH.to_string(),
        private_key: TEST_VAPID_PRIVATE.to_string(),
        subscriber_email: "mailto:ops@example.com".to_string(),
    }
}

fn test_subscription(endpoint: &str) -> WebSubscription {
    WebSubscription {
        endpoint: endpoint.to_string(),
        keys: WebPushKeys {
            p256dh: decode_base64_flexible(TEST_P256DH).expect("fixture p256dh"),
            auth: decode_base64_flexible(TEST_AUTH).expect("fixture auth"),
        },
    }
}

/// Mobile client that fails its first `fail_times` calls with a transport
/// error and succeeds afterwards.
struct CountingClient {
    calls: Mutex<Vec<Vec<MobileToken>>>,
    fail_times: AtomicUsize,
}

impl CountingClient {
    fn new(fail_times: usize) -> Self {
        CountingClient {
            calls: Mutex::new(Vec::new()),
            fail_times: AtomicUsize::new(fail_times),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }

    fn last_tokens(&self) -> Vec<MobileToken> {
        self.calls
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessagingClient for CountingClient {
    async fn send_each(
        &self,
        tokens: &[MobileToken],
        _content: &NotificationContent,
        _data: &BTreeMap<String, String>,
    ) -> Result<Vec<SendResponse>, MessagingError> {
        self.calls.lock().expect("lock").push(tokens.to_vec());
        let remaining = self.fail_times.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::Relaxed);
            return Err(MessagingError::Transport("network down".to_string()));
        }
        Ok(tokens
            .iter()
            .map(|token| SendResponse {
                token: token.clone(),
                result: Ok("msg-id".to_string()),
            })
            .collect())
    }
}

struct ScriptedWebTransport {
    outcomes: Mutex<Vec<Result<(), WebPushError>>>,
}

impl ScriptedWebTransport {
    fn new(outcomes: Vec<Result<(), WebPushError>>) -> Self {
        ScriptedWebTransport {
            outcomes: Mutex::new(outcomes),
        }
    }
}

#[async_trait]
impl WebPushTransport for ScriptedWebTransport {
    async fn send(&self, _message: WebPushMessage) -> Result<(), WebPushError> {
        let mut outcomes = self.outcomes.lock().expect("lock");
        if outcomes.is_empty() {
            return Ok(());
        }
        outcomes.remove(0)
    }
}

struct Harness {
    bus: InMemoryBus,
    pipeline: Pipeline,
    registry: Arc<MemoryRegistry>,
    mobile_client: Arc<CountingClient>,
}

fn harness(
    fail_times: usize,
    web_outcomes: Vec<Result<(), WebPushError>>,
    max_delivery_attempts: u32,
) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let mobile_client = Arc::new(CountingClient::new(fail_times));
    let processor = Arc::new(Processor::new(
        registry.clone(),
        Arc::new(MobileDispatcher::new(mobile_client.clone())),
        Arc::new(WebDispatcher::new(
            Arc::new(ScriptedWebTransport::new(web_outcomes)),
            test_vapid(),
        )),
    ));
    let bus = InMemoryBus::new(max_delivery_attempts, Duration::from_millis(10));
    let pipeline = Pipeline::new(2, Arc::new(bus.clone()), processor);
    Harness {
        bus,
        pipeline,
        registry,
        mobile_client,
    }
}

fn user() -> UserIdentity {
    "urn:x:user:A".parse().expect("valid urn")
}

fn command() -> Vec<u8> {
    br#"{"recipient":"urn:x:user:A","content":{"title":"hi"},"data":{}}"#.to_vec()
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn register_then_dispatch_mobile() {
    let harness = harness(0, vec![], 5);
    harness
        .registry
        .register_mobile(&user(), MobileToken("tok-1".to_string()))
        .await
        .expect("register");

    harness.pipeline.start().await;
    harness.bus.publish(command());

    let client = harness.mobile_client.clone();
    eventually("mobile dispatch", || client.call_count() == 1).await;
    assert_eq!(client.last_tokens(), vec![MobileToken("tok-1".to_string())]);

    // Acked: no redelivery, no dead letter, no registry mutation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.call_count(), 1);
    assert!(harness.bus.dead_letters().await.is_empty());
    let resolved = harness.registry.fetch(&user()).await.expect("fetch");
    assert_eq!(resolved.mobile_tokens.len(), 1);

    harness.pipeline.stop(Duration::from_secs(1)).await.expect("stop");
}

#[tokio::test]
async fn web_endpoint_gone_is_self_healed() {
    let harness = harness(0, vec![Err(WebPushError::EndpointNotValid)], 5);
    harness
        .registry
        .register_web(&user(), test_subscription("https://push.example/abc"))
        .await
        .expect("register");

    harness.pipeline.start().await;
    harness.bus.publish(command());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let resolved = harness.registry.fetch(&user()).await.expect("fetch");
        if resolved.web_subscriptions.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the endpoint to be pruned"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The 410 is terminal for the endpoint but the command still acks.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.bus.dead_letters().await.is_empty());

    harness.pipeline.stop(Duration::from_secs(1)).await.expect("stop");
}

#[tokio::test]
async fn poison_pill_is_dead_lettered_without_dispatch() {
    let harness = harness(0, vec![], 5);
    harness.pipeline.start().await;

    let poison = br#"{"this is not valid json"#.to_vec();
    harness.bus.publish(poison.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if harness.bus.dead_letters().await.len() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the dead letter"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(harness.bus.dead_letters().await, vec![poison]);
    assert_eq!(harness.mobile_client.call_count(), 0);

    harness.pipeline.stop(Duration::from_secs(1)).await.expect("stop");
}

#[tokio::test]
async fn transient_dispatcher_failure_is_redelivered_until_ack() {
    let harness = harness(1, vec![], 5);
    harness
        .registry
        .register_mobile(&user(), MobileToken("tok-1".to_string()))
        .await
        .expect("register");

    harness.pipeline.start().await;
    harness.bus.publish(command());

    let client = harness.mobile_client.clone();
    eventually("second dispatch attempt", || client.call_count() == 2).await;
    assert_eq!(client.last_tokens(), vec![MobileToken("tok-1".to_string())]);

    // Second attempt succeeded: the command is done.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(client.call_count(), 2);
    assert!(harness.bus.dead_letters().await.is_empty());

    harness.pipeline.stop(Duration::from_secs(1)).await.expect("stop");
}
