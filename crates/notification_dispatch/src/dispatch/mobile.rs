/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    common::types::{MobileToken, NotificationContent},
    tools::prometheus::DISPATCH_DURATION,
};

use super::DispatchError;

/// Per-token failure classes, mirroring the mobile provider's error
/// vocabulary. `Unregistered`, `InvalidToken` and `SenderMismatch` mean the
/// token is dead and must be pruned; everything else is worth a retry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendErrorKind {
    Unregistered,
    InvalidToken,
    SenderMismatch,
    QuotaExceeded,
    Unavailable,
    Internal,
    Unknown,
}

impl SendErrorKind {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SendErrorKind::Unregistered | SendErrorKind::InvalidToken | SendErrorKind::SenderMismatch
        )
    }
}

#[derive(Debug, Clone)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub detail: String,
}

/// Outcome of one token within a batch send.
#[derive(Debug, Clone)]
pub struct SendResponse {
    pub token: MobileToken,
    pub result: Result<String, SendError>,
}

/// Whole-batch failures from the messaging client.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// The subset of the mobile provider's API the dispatcher needs. The
/// concrete implementation lives in `fcm.rs`; tests substitute their own.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_each(
        &self,
        tokens: &[MobileToken],
        content: &NotificationContent,
        data: &BTreeMap<String, String>,
    ) -> Result<Vec<SendResponse>, MessagingError>;
}

#[derive(Debug)]
pub struct MobileDispatchOutcome {
    pub receipt: String,
    pub invalid_tokens: Vec<MobileToken>,
    /// Set when at least one token is eligible for retry; the pipeline
    /// turns it into a negative acknowledgement.
    pub retry: Option<DispatchError>,
}

pub struct MobileDispatcher {
    client: Arc<dyn MessagingClient>,
}

impl MobileDispatcher {
    pub fn new(client: Arc<dyn MessagingClient>) -> Self {
        MobileDispatcher { client }
    }

    pub async fn dispatch(
        &self,
        tokens: &[MobileToken],
        content: &NotificationContent,
        data: &BTreeMap<String, String>,
    ) -> MobileDispatchOutcome {
        if tokens.is_empty() {
            return MobileDispatchOutcome {
                receipt: "skipped: no tokens".to_string(),
                invalid_tokens: Vec::new(),
                retry: None,
            };
        }

        let start_time = Instant::now();
        let responses = self.client.send_each(tokens, content, data).await;
        DISPATCH_DURATION
            .with_label_values(&["mobile"])
            .observe(start_time.elapsed().as_secs_f64());

        let responses = match responses {
            Ok(responses) => responses,
            Err(MessagingError::Transport(detail)) => {
                error!("Mobile provider transport failed : {detail}");
                return MobileDispatchOutcome {
                    receipt: "transport failed".to_string(),
                    invalid_tokens: Vec::new(),
                    retry: Some(DispatchError::Transport(detail)),
                };
            }
            Err(MessagingError::InvalidArgument(detail)) => {
                // The provider rejected the batch itself. Nothing in the
                // command can succeed on retry, so this is swallowed.
                warn!("Mobile provider rejected batch as invalid : {detail}");
                return MobileDispatchOutcome {
                    receipt: "rejected: invalid argument".to_string(),
                    invalid_tokens: Vec::new(),
                    retry: None,
                };
            }
        };

        let mut invalid_tokens = Vec::new();
        let mut success_count = 0usize;
        let mut transient_count = 0usize;

        for response in responses {
            match response.result {
                Ok(_) => success_count += 1,
                Err(send_error) if send_error.kind.is_fatal() => {
                    invalid_tokens.push(response.token);
                }
                Err(send_error) => {
                    warn!(
                        "Transient mobile delivery failure ({:?}) : {}",
                        send_error.kind, send_error.detail
                    );
                    transient_count += 1;
                }
            }
        }

        let receipt = format!(
            "success:{} invalid:{} total_fail:{}",
            success_count,
            invalid_tokens.len(),
            invalid_tokens.len() + transient_count
        );

        let retry = (transient_count > 0).then(|| {
            DispatchError::Transient(format!("{transient_count} tokens saw transient failures"))
        });

        MobileDispatchOutcome {
            receipt,
            invalid_tokens,
            retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<Vec<SendResponse>, MessagingError>>>,
        calls: Mutex<Vec<Vec<MobileToken>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Vec<SendResponse>, MessagingError>>) -> Self {
            ScriptedClient {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessagingClient for ScriptedClient {
        async fn send_each(
            &self,
            tokens: &[MobileToken],
            _content: &NotificationContent,
            _data: &BTreeMap<String, String>,
        ) -> Result<Vec<SendResponse>, MessagingError> {
            self.calls.lock().expect("lock").push(tokens.to_vec());
            self.responses.lock().expect("lock").remove(0)
        }
    }

    fn ok(token: &str) -> SendResponse {
        SendResponse {
            token: MobileToken(token.to_string()),
            result: Ok(format!("projects/p/messages/{token}")),
        }
    }

    fn failed(token: &str, kind: SendErrorKind) -> SendResponse {
        SendResponse {
            token: MobileToken(token.to_string()),
            result: Err(SendError {
                kind,
                detail: "scripted".to_string(),
            }),
        }
    }

    fn content() -> NotificationContent {
        NotificationContent {
            title: "hi".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let dispatcher = MobileDispatcher::new(client.clone());

        let outcome = dispatcher.dispatch(&[], &content(), &BTreeMap::new()).await;
        assert_eq!(outcome.receipt, "skipped: no tokens");
        assert!(outcome.invalid_tokens.is_empty());
        assert!(outcome.retry.is_none());
        assert!(client.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn all_success_yields_clean_outcome() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![ok("t1"), ok("t2")])]));
        let dispatcher = MobileDispatcher::new(client);

        let tokens = vec![MobileToken("t1".into()), MobileToken("t2".into())];
        let outcome = dispatcher
            .dispatch(&tokens, &content(), &BTreeMap::new())
            .await;
        assert_eq!(outcome.receipt, "success:2 invalid:0 total_fail:0");
        assert!(outcome.invalid_tokens.is_empty());
        assert!(outcome.retry.is_none());
    }

    #[tokio::test]
    async fn fatal_failures_collect_invalid_tokens_without_error() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![
            ok("t1"),
            failed("t2", SendErrorKind::Unregistered),
            failed("t3", SendErrorKind::InvalidToken),
        ])]));
        let dispatcher = MobileDispatcher::new(client);

        let tokens = vec![
            MobileToken("t1".into()),
            MobileToken("t2".into()),
            MobileToken("t3".into()),
        ];
        let outcome = dispatcher
            .dispatch(&tokens, &content(), &BTreeMap::new())
            .await;
        assert_eq!(
            outcome.invalid_tokens,
            vec![MobileToken("t2".into()), MobileToken("t3".into())]
        );
        assert!(outcome.retry.is_none());
    }

    #[tokio::test]
    async fn transient_failure_requests_a_retry() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(vec![
            ok("t1"),
            failed("t2", SendErrorKind::Unavailable),
        ])]));
        let dispatcher = MobileDispatcher::new(client);

        let tokens = vec![MobileToken("t1".into()), MobileToken("t2".into())];
        let outcome = dispatcher
            .dispatch(&tokens, &content(), &BTreeMap::new())
            .await;
        assert!(matches!(outcome.retry, Some(DispatchError::Transient(_))));
        assert!(outcome.invalid_tokens.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_requests_a_retry() {
        let client = Arc::new(ScriptedClient::new(vec![Err(MessagingError::Transport(
            "network down".to_string(),
        ))]));
        let dispatcher = MobileDispatcher::new(client);

        let tokens = vec![MobileToken("t1".into())];
        let outcome = dispatcher
            .dispatch(&tokens, &content(), &BTreeMap::new())
            .await;
        assert!(matches!(outcome.retry, Some(DispatchError::Transport(_))));
    }

    #[tokio::test]
    async fn batch_invalid_argument_is_swallowed() {
        let client = Arc::new(ScriptedClient::new(vec![Err(
            MessagingError::InvalidArgument("bad payload".to_string()),
        )]));
        let dispatcher = MobileDispatcher::new(client);

        let tokens = vec![MobileToken("t1".into())];
        let outcome = dispatcher
            .dispatch(&tokens, &content(), &BTreeMap::new())
            .await;
        assert!(outcome.retry.is_none());
        assert!(outcome.invalid_tokens.is_empty());
        assert_eq!(outcome.receipt, "rejected: invalid argument");
    }
}
