//! Bounded-concurrency managed consumer
//!
//! Drives a fixed-size pool of workers over one shared delivery stream.
//! Every delivery is settled exactly once: valid records are forwarded
//! to the engine and acknowledged, invalid records are acknowledged and
//! dropped (malformed input is terminal, not transient), and engine
//! failures follow the configured [`EngineErrorPolicy`].
//!
//! A reconnectable transport failure tears the session down and reopens
//! it with exponential backoff; a fatal one aborts the run. On
//! cancellation, workers finish the delivery in hand before returning.

use crate::config::{ConsumerConfig, EngineErrorPolicy};
use crate::engine::EngineGateway;
use crate::input::transport::{RawMessage, Subscription, Transport};
use erl_common::{validate, LoaderError, Result, ValidationResult};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between periodic health statistics reports
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// First reconnect backoff; doubles per attempt up to [`MAX_BACKOFF`]
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Consecutive failed reopen attempts tolerated before giving up
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Counters shared by the workers and the stats ticker.
///
/// Purely observational; nothing reads these for control flow.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub invalid: AtomicU64,
    pub engine_failures: AtomicU64,
    pub requeued: AtomicU64,
    pub active_workers: AtomicUsize,
}

impl ConsumerStats {
    fn report(&self, started: Instant) {
        let (resident_mem_bytes, virtual_mem_bytes) = process_memory();
        info!(
            uptime_secs = started.elapsed().as_secs(),
            active_workers = self.active_workers.load(Ordering::Relaxed),
            resident_mem_bytes,
            virtual_mem_bytes,
            received = self.received.load(Ordering::Relaxed),
            processed = self.processed.load(Ordering::Relaxed),
            invalid = self.invalid.load(Ordering::Relaxed),
            engine_failures = self.engine_failures.load(Ordering::Relaxed),
            requeued = self.requeued.load(Ordering::Relaxed),
            "consumer statistics"
        );
    }
}

/// Resident and virtual memory of this process, in bytes. Zeroes when
/// the platform exposes neither.
fn process_memory() -> (u64, u64) {
    memory_stats::memory_stats()
        .map(|m| (m.physical_mem as u64, m.virtual_mem as u64))
        .unwrap_or((0, 0))
}

/// Consume from the transport until cancellation, orderly end of input,
/// or a fatal error.
///
/// Reconnectable transport failures reopen the session with exponential
/// backoff; the backoff resets after each successful open.
pub async fn run(
    token: CancellationToken,
    transport: Box<dyn Transport>,
    config: &ConsumerConfig,
    gateway: Arc<dyn EngineGateway>,
) -> Result<()> {
    let stats = Arc::new(ConsumerStats::default());
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts: u32 = 0;

    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        match transport.open(config).await {
            Ok(subscription) => {
                attempts = 0;
                backoff = INITIAL_BACKOFF;
                let subscription: Arc<dyn Subscription> = Arc::from(subscription);
                let outcome = run_session(
                    token.clone(),
                    Arc::clone(&subscription),
                    config,
                    Arc::clone(&gateway),
                    Arc::clone(&stats),
                    started,
                )
                .await;

                if let Err(e) = subscription.close().await {
                    debug!(error = %e, "error closing subscription");
                }

                match outcome {
                    Ok(()) => {
                        stats.report(started);
                        return Ok(());
                    },
                    Err(LoaderError::Transport(t)) if t.is_reconnectable() => {
                        warn!(error = %t, "consumption session lost, reconnecting");
                    },
                    Err(e) => return Err(e),
                }
            },
            Err(LoaderError::Transport(t)) if t.is_reconnectable() => {
                warn!(error = %t, "transport open failed, retrying");
            },
            Err(e) => return Err(e),
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(erl_common::TransportError::Fatal(format!(
                "giving up after {MAX_RECONNECT_ATTEMPTS} consecutive reconnect attempts"
            ))
            .into());
        }

        info!(attempt = attempts, backoff_secs = backoff.as_secs(), "reconnect backoff");
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {},
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One consumption session over one open subscription.
async fn run_session(
    token: CancellationToken,
    subscription: Arc<dyn Subscription>,
    config: &ConsumerConfig,
    gateway: Arc<dyn EngineGateway>,
    stats: Arc<ConsumerStats>,
    started: Instant,
) -> Result<()> {
    let session = token.child_token();
    let mut workers = JoinSet::new();

    for worker_id in 0..config.worker_count.max(1) {
        workers.spawn(worker_loop(
            worker_id,
            session.clone(),
            Arc::clone(&subscription),
            config.clone(),
            Arc::clone(&gateway),
            Arc::clone(&stats),
        ));
    }

    let ticker = tokio::spawn(stats_loop(session.clone(), Arc::clone(&stats), started));

    let mut outcome = Ok(());
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
                // one worker hitting a transport error ends the session;
                // the rest drain their in-flight delivery and stop
                session.cancel();
            },
            Err(join_error) => {
                if outcome.is_ok() {
                    outcome = Err(erl_common::TransportError::Fatal(format!(
                        "worker panicked: {join_error}"
                    ))
                    .into());
                }
                session.cancel();
            },
        }
    }

    session.cancel();
    ticker.abort();
    outcome
}

/// One worker: receive, validate, forward, settle, repeat.
async fn worker_loop(
    worker_id: usize,
    session: CancellationToken,
    subscription: Arc<dyn Subscription>,
    config: ConsumerConfig,
    gateway: Arc<dyn EngineGateway>,
    stats: Arc<ConsumerStats>,
) -> Result<()> {
    stats.active_workers.fetch_add(1, Ordering::Relaxed);
    debug!(worker_id, "worker started");

    let result = async {
        loop {
            let message = tokio::select! {
                _ = session.cancelled() => return Ok(()),
                next = subscription.next() => next?,
            };
            let Some(message) = message else {
                debug!(worker_id, "input exhausted");
                return Ok(());
            };

            stats.received.fetch_add(1, Ordering::Relaxed);
            process_delivery(message, &*subscription, &config, &*gateway, &stats).await?;
        }
    }
    .await;

    stats.active_workers.fetch_sub(1, Ordering::Relaxed);
    debug!(worker_id, "worker stopped");
    result
}

/// Settle exactly one delivery.
///
/// Every path issues exactly one ack or reject; only transport failures
/// propagate, everything else is a per-message condition handled here.
async fn process_delivery(
    message: RawMessage,
    subscription: &dyn Subscription,
    config: &ConsumerConfig,
    gateway: &dyn EngineGateway,
    stats: &ConsumerStats,
) -> Result<()> {
    let RawMessage {
        body,
        handle,
        message_id,
        delivery_count,
    } = message;

    let record = match validate(&body) {
        ValidationResult::Valid(record) => record,
        ValidationResult::Invalid(reason) => {
            stats.invalid.fetch_add(1, Ordering::Relaxed);
            // terminal condition: consume and drop, never redeliver
            warn!(message_id = %message_id, reason = %reason, "discarding invalid record");
            return subscription.ack(handle).await;
        },
    };

    match gateway
        .add_record(
            &record.data_source,
            &record.record_id,
            &record.raw,
            &config.load_id,
            config.with_info,
        )
        .await
    {
        Ok(info) => {
            stats.processed.fetch_add(1, Ordering::Relaxed);
            if let Some(info) = info {
                debug!(
                    message_id = %message_id,
                    data_source = %record.data_source,
                    record_id = %record.record_id,
                    info = %info,
                    "record loaded with info"
                );
            }
            subscription.ack(handle).await
        },
        Err(e) => {
            stats.engine_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                message_id = %message_id,
                data_source = %record.data_source,
                record_id = %record.record_id,
                delivery_count,
                error = %e,
                "engine add_record failed"
            );
            match config.on_engine_error {
                EngineErrorPolicy::Ack => subscription.ack(handle).await,
                EngineErrorPolicy::Requeue if delivery_count < config.max_delivery_attempts => {
                    stats.requeued.fetch_add(1, Ordering::Relaxed);
                    subscription.reject(handle).await
                },
                EngineErrorPolicy::Requeue => {
                    warn!(
                        message_id = %message_id,
                        delivery_count,
                        "delivery-attempt ceiling reached, dropping message"
                    );
                    subscription.ack(handle).await
                },
            }
        },
    }
}

/// Periodic health report, once per [`STATS_INTERVAL`].
async fn stats_loop(session: CancellationToken, stats: Arc<ConsumerStats>, started: Instant) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = interval.tick() => stats.report(started),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_memory_reported() {
        let (resident, _virtual) = process_memory();
        assert!(resident > 0, "a running process has a resident set");
    }
}
