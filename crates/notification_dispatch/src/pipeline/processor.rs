/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    dispatch::{mobile::MobileDispatcher, web::WebDispatcher},
    pipeline::transformer::decode_command,
    registry::TokenRegistry,
    tools::{
        error::AppError,
        prometheus::{DROPPED_COMMANDS, PRUNED_ENDPOINTS},
    },
};

/// The per-message handler: decode, resolve the recipient, fan out to both
/// channels, prune endpoints the providers declared dead, and report the
/// outcome the runtime turns into an ack or nack.
pub struct Processor {
    registry: Arc<dyn TokenRegistry>,
    mobile: Arc<MobileDispatcher>,
    web: Arc<WebDispatcher>,
}

impl Processor {
    pub fn new(
        registry: Arc<dyn TokenRegistry>,
        mobile: Arc<MobileDispatcher>,
        web: Arc<WebDispatcher>,
    ) -> Self {
        Processor {
            registry,
            mobile,
            web,
        }
    }

    pub async fn handle(&self, payload: &[u8]) -> Result<(), AppError> {
        let command = decode_command(payload)?;
        let recipient = &command.recipient;

        let resolved = self
            .registry
            .fetch(recipient)
            .await
            .map_err(AppError::from)?;

        if resolved.is_empty() {
            info!("No devices registered for {recipient}, dropping notification");
            DROPPED_COMMANDS.inc();
            return Ok(());
        }

        // Both channels are always attempted; the first retryable error wins
        // after the other channel has had its chance.
        let mut first_retry: Option<AppError> = None;

        if !resolved.mobile_tokens.is_empty() {
            let outcome = self
                .mobile
                .dispatch(&resolved.mobile_tokens, &command.content, &command.data)
                .await;
            info!(
                "Mobile dispatch for {recipient} ({} tokens) : {}",
                resolved.mobile_tokens.len(),
                outcome.receipt
            );

            for token in outcome.invalid_tokens {
                match self.registry.unregister_mobile(recipient, &token).await {
                    Ok(()) => {
                        PRUNED_ENDPOINTS.with_label_values(&["mobile"]).inc();
                    }
                    Err(err) => {
                        warn!("Failed to prune dead mobile token for {recipient} : {err}")
                    }
                }
            }

            if let Some(err) = outcome.retry {
                first_retry.get_or_insert(err.into());
            }
        }

        if !resolved.web_subscriptions.is_empty() {
            match self
                .web
                .dispatch(&resolved.web_subscriptions, &command.content, &command.data)
                .await
            {
                Ok(outcome) => {
                    info!(
                        "Web dispatch for {recipient} ({} subscriptions) : {}",
                        resolved.web_subscriptions.len(),
                        outcome.receipt
                    );

                    for subscription in outcome.invalid_subscriptions {
                        match self
                            .registry
                            .unregister_web(recipient, &subscription.endpoint)
                            .await
                        {
                            Ok(()) => {
                                PRUNED_ENDPOINTS.with_label_values(&["web"]).inc();
                            }
                            Err(err) => warn!(
                                "Failed to prune dead web endpoint {} for {recipient} : {err}",
                                subscription.endpoint
                            ),
                        }
                    }
                }
                Err(err) => {
                    error!("Web dispatch failed for {recipient} : {err}");
                    first_retry.get_or_insert(err.into());
                }
            }
        }

        match first_retry {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use web_push::WebPushError;

    use super::*;
    use crate::common::types::{
        MobileToken, NotificationContent, ResolvedRecipient, UserIdentity, WebSubscription,
    };
    use crate::dispatch::mobile::{
        MessagingClient, MessagingError, SendError, SendErrorKind, SendResponse,
    };
    use crate::dispatch::web::tests::{test_subscription, test_vapid, ScriptedTransport};
    use crate::registry::memory::MemoryRegistry;
    use crate::registry::{RegistryError, RegistryResult};

    struct RecordingClient {
        calls: Mutex<Vec<Vec<MobileToken>>>,
        fail_first: AtomicBool,
    }

    impl RecordingClient {
        fn new() -> Self {
            RecordingClient {
                calls: Mutex::new(Vec::new()),
                fail_first: AtomicBool::new(false),
            }
        }

        fn failing_once() -> Self {
            let client = Self::new();
            client.fail_first.store(true, Ordering::Relaxed);
            client
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl MessagingClient for RecordingClient {
        async fn send_each(
            &self,
            tokens: &[MobileToken],
            _content: &NotificationContent,
            _data: &BTreeMap<String, String>,
        ) -> Result<Vec<SendResponse>, MessagingError> {
            self.calls.lock().expect("lock").push(tokens.to_vec());
            if self.fail_first.swap(false, Ordering::Relaxed) {
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

    struct FailingRegistry;

    #[async_trait]
    impl crate::registry::TokenRegistry for FailingRegistry {
        async fn register_mobile(
            &self,
            _user: &UserIdentity,
            _token: MobileToken,
        ) -> RegistryResult<()> {
            unreachable!("not used")
        }
        async fn register_web(
            &self,
            _user: &UserIdentity,
            _subscription: WebSubscription,
        ) -> RegistryResult<()> {
            unreachable!("not used")
        }
        async fn unregister_mobile(
            &self,
            _user: &UserIdentity,
            _token: &MobileToken,
        ) -> RegistryResult<()> {
            Ok(())
        }
        async fn unregister_web(
            &self,
            _user: &UserIdentity,
            _endpoint: &str,
        ) -> RegistryResult<()> {
            Ok(())
        }
        async fn fetch(&self, _user: &UserIdentity) -> RegistryResult<ResolvedRecipient> {
            Err(RegistryError::Storage("enumeration failed".to_string()))
        }
    }

    fn user() -> UserIdentity {
        "urn:x:user:A".parse().expect("valid urn")
    }

    fn processor_with(
        registry: Arc<dyn TokenRegistry>,
        client: Arc<RecordingClient>,
        transport: Arc<ScriptedTransport>,
    ) -> Processor {
        Processor::new(
            registry,
            Arc::new(MobileDispatcher::new(client)),
            Arc::new(WebDispatcher::new(transport, test_vapid())),
        )
    }

    fn command_bytes() -> Vec<u8> {
        br#"{"recipient":"urn:x:user:A","content":{"title":"hi"},"data":{}}"#.to_vec()
    }

    #[tokio::test]
    async fn dispatches_registered_mobile_tokens() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register_mobile(&user(), MobileToken("tok-1".to_string()))
            .await
            .expect("register");

        let client = Arc::new(RecordingClient::new());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let processor = processor_with(registry, client.clone(), transport);

        processor.handle(&command_bytes()).await.expect("handle");

        let calls = client.calls.lock().expect("lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![MobileToken("tok-1".to_string())]);
    }

    #[tokio::test]
    async fn drops_silently_when_no_devices_registered() {
        let registry = Arc::new(MemoryRegistry::new());
        let client = Arc::new(RecordingClient::new());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let processor = processor_with(registry, client.clone(), transport.clone());

        processor.handle(&command_bytes()).await.expect("handle");
        assert_eq!(client.call_count(), 0);
        assert!(transport.endpoints.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn registry_fetch_failure_is_retryable() {
        let client = Arc::new(RecordingClient::new());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let processor = processor_with(Arc::new(FailingRegistry), client.clone(), transport);

        let err = processor.handle(&command_bytes()).await.expect_err("fetch fails");
        assert!(matches!(err, AppError::StorageFailure(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn decode_failure_never_touches_the_registry() {
        let client = Arc::new(RecordingClient::new());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let processor = processor_with(Arc::new(FailingRegistry), client.clone(), transport);

        let err = processor
            .handle(br#"{"this is not valid json"#)
            .await
            .expect_err("decode fails");
        assert!(matches!(err, AppError::MalformedCommand(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn gone_web_endpoint_is_pruned_exactly_once() {
        let registry = Arc::new(MemoryRegistry::new());
        let gone = test_subscription("https://push.example/abc");
        registry
            .register_web(&user(), gone.clone())
            .await
            .expect("register");

        let client = Arc::new(RecordingClient::new());
        let transport = Arc::new(ScriptedTransport::new(vec![Err(
            WebPushError::EndpointNotValid,
        )]));
        let processor = processor_with(registry.clone(), client, transport);

        processor.handle(&command_bytes()).await.expect("handle");

        let resolved = registry.fetch(&user()).await.expect("fetch");
        assert!(resolved.web_subscriptions.is_empty());
    }

    #[tokio::test]
    async fn transient_mobile_failure_propagates_for_redelivery() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register_mobile(&user(), MobileToken("tok-1".to_string()))
            .await
            .expect("register");

        let client = Arc::new(RecordingClient::failing_once());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let processor = processor_with(registry, client.clone(), transport);

        let err = processor.handle(&command_bytes()).await.expect_err("first call fails");
        assert!(matches!(err, AppError::DispatchRetry(_)));

        processor
            .handle(&command_bytes())
            .await
            .expect("second call succeeds");
        assert_eq!(client.call_count(), 2);
    }
}
