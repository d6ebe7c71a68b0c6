//! SQS cloud-queue transport adapter
//!
//! Accepts either a direct `https://` queue URL or the `sqs://` lookup
//! form (`sqs://lookup?queue-name=myqueue`), resolves the queue URL if
//! needed, and long-polls for messages. Deleting a message is the ack;
//! resetting its visibility timeout to zero is the reject, which makes
//! the broker redeliver immediately.
//!
//! SQS has no broker-side prefetch, so the outstanding-delivery limit
//! is enforced client-side with a semaphore: a delivery permit is taken
//! when a message is handed to a worker and returned on settlement.

use crate::config::ConsumerConfig;
use crate::input::transport::{DeliveryHandle, RawMessage, Subscription, Transport};
use crate::input::InputTarget;
use async_trait::async_trait;
use aws_sdk_sqs::error::SdkError;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use erl_common::{LoaderError, Result, TransportError};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

/// Hard SQS ceiling on messages per receive call
const MAX_RECEIVE_BATCH: usize = 10;

/// Long-polling wait per receive call, in seconds
const RECEIVE_WAIT_SECS: i32 = 20;

/// Query parameter naming the queue in the `sqs://` lookup form
const QUEUE_NAME_PARAM: &str = "queue-name";

/// Query parameter carrying a full queue URL in the `sqs://` lookup form
const QUEUE_URL_PARAM: &str = "queue-url";

/// Map an AWS SDK failure onto the reconnectable/fatal taxonomy.
///
/// Failures to reach the service are retried with backoff; service
/// refusals (missing queue, access denied) abort the session.
fn classify<E, R>(err: &SdkError<E, R>) -> TransportError
where
    E: std::fmt::Debug,
    R: std::fmt::Debug,
{
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            TransportError::Reconnectable(format!("{err:?}"))
        },
        _ => TransportError::Fatal(format!("{err:?}")),
    }
}

#[derive(Debug)]
pub struct SqsTransport {
    target: InputTarget,
}

impl SqsTransport {
    pub fn new(target: InputTarget) -> Self {
        Self { target }
    }

    /// Resolve the queue URL from the input target: a direct https URL
    /// is used verbatim, the sqs:// lookup form goes through
    /// GetQueueUrl or the queue-url parameter.
    async fn resolve_queue_url(&self, client: &Client) -> Result<String> {
        if self.target.scheme == "https" {
            return Ok(self.target.connection_string().to_string());
        }

        if let Some(url) = self.target.query_first(QUEUE_URL_PARAM) {
            return Ok(url.to_string());
        }

        let queue_name = self.target.query_first(QUEUE_NAME_PARAM).ok_or_else(|| {
            LoaderError::config(format!(
                "the sqs input URL needs a '{QUEUE_NAME_PARAM}' or '{QUEUE_URL_PARAM}' query parameter"
            ))
        })?;

        let resolved = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| LoaderError::from(classify(&e)))?;

        resolved.queue_url().map(str::to_string).ok_or_else(|| {
            TransportError::Fatal(format!("queue '{queue_name}' has no resolvable URL")).into()
        })
    }
}

#[async_trait]
impl Transport for SqsTransport {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn open(&self, config: &ConsumerConfig) -> Result<Box<dyn Subscription>> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&aws_config);
        let queue_url = self.resolve_queue_url(&client).await?;

        info!(
            queue_url = %queue_url,
            prefetch = config.prefetch_count,
            visibility_timeout_secs = config.visibility_timeout_secs,
            "sqs subscription open"
        );

        Ok(Box::new(SqsSubscription {
            client,
            queue_url,
            visibility_timeout_secs: config.visibility_timeout_secs,
            permits: Arc::new(Semaphore::new(config.prefetch_count as usize)),
            buffer: Mutex::new(VecDeque::new()),
        }))
    }
}

pub struct SqsSubscription {
    client: Client,
    queue_url: String,
    visibility_timeout_secs: i32,
    permits: Arc<Semaphore>,
    buffer: Mutex<VecDeque<RawMessage>>,
}

#[async_trait]
impl Subscription for SqsSubscription {
    async fn next(&self) -> Result<Option<RawMessage>> {
        // one permit per dispatched, unsettled delivery
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Fatal("subscription closed".to_string()))?;
        permit.forget();

        loop {
            if let Some(message) = self.buffer.lock().await.pop_front() {
                return Ok(Some(message));
            }

            let batch = (self.permits.available_permits() + 1).min(MAX_RECEIVE_BATCH);
            let response = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(batch as i32)
                .wait_time_seconds(RECEIVE_WAIT_SECS)
                .visibility_timeout(self.visibility_timeout_secs)
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .send()
                .await
                .map_err(|e| LoaderError::from(classify(&e)))?;

            let messages = response.messages.unwrap_or_default();
            if messages.is_empty() {
                // long poll expired with nothing to do; poll again
                continue;
            }
            debug!(count = messages.len(), "sqs receive batch");

            let mut buffer = self.buffer.lock().await;
            for message in messages {
                let Some(receipt) = message.receipt_handle else {
                    continue;
                };
                let message_id = message.message_id.unwrap_or_else(|| receipt.clone());
                let delivery_count = message
                    .attributes
                    .as_ref()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);
                buffer.push_back(RawMessage {
                    body: message.body.unwrap_or_default().into_bytes(),
                    handle: DeliveryHandle::SqsReceipt(receipt),
                    message_id,
                    delivery_count,
                });
            }
        }
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<()> {
        let DeliveryHandle::SqsReceipt(receipt) = handle else {
            return Err(TransportError::Fatal(
                "delivery handle does not belong to the sqs subscription".to_string(),
            )
            .into());
        };
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&receipt)
            .send()
            .await
            .map_err(|e| LoaderError::from(classify(&e)))?;
        self.permits.add_permits(1);
        Ok(())
    }

    async fn reject(&self, handle: DeliveryHandle) -> Result<()> {
        let DeliveryHandle::SqsReceipt(receipt) = handle else {
            return Err(TransportError::Fatal(
                "delivery handle does not belong to the sqs subscription".to_string(),
            )
            .into());
        };
        // visibility zero returns the message to the queue immediately
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&receipt)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| LoaderError::from(classify(&e)))?;
        self.permits.add_permits(1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.permits.close();
        Ok(())
    }
}
