//! Queue worker: one task at a time, idempotent, rate-limited, observed.
//!
//! Per delivery, in order: persona rate check (defer on exceed), idempotency
//! claim (skip duplicates), live-write gates, then the timed opaque body.
//! Failures are redelivered with exponential backoff plus jitter, bounded by
//! [`MAX_RETRIES`]; the rate-limit deferral does not consume an attempt.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use crate::obs;

use super::broker::{Broker, Delivery};
use super::kv::{self, KvStore};
use super::router;
use super::task::{ExecMode, StepTask};

/// Broker-level redeliveries after the first failed attempt.
pub const MAX_RETRIES: u32 = 3;

/// First-retry backoff; doubles per attempt before jitter.
pub const RETRY_BACKOFF_BASE_SECS: u64 = 2;

/// Countdown for a rate-limited deferral.
pub const RATE_LIMIT_RETRY_SECS: u64 = 5;

/// Hard ceiling on one body execution.
pub const TASK_TIME_LIMIT: Duration = Duration::from_secs(60 * 10);

/// Past this, the worker logs that the body is running long.
pub const TASK_SOFT_TIME_LIMIT: Duration = Duration::from_secs(60 * 8);

const RESERVE_TIMEOUT_SECS: u64 = 5;

/// Write gates for live tasks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PermissionDenied {
    #[error("writes blocked: set ALLOW_WRITES=1 to perform live changes")]
    WritesBlocked,

    #[error("live destructive op not allowed without allow_destructive=true")]
    DestructiveBlocked,
}

/// The opaque step body. The worker only observes timing and the
/// success/failure of the returned result.
#[async_trait]
pub trait StepBody: Send + Sync {
    async fn execute(&self, task: &StepTask) -> Result<()>;
}

/// Load-generation body: sleeps 100–800 ms, reports synthetic token usage,
/// and fails a small fraction of the time — enough to exercise retries, the
/// latency histogram, and the token counters.
pub struct SimulatedBody {
    pub failure_rate: f64,
}

impl Default for SimulatedBody {
    fn default() -> Self {
        Self { failure_rate: 0.03 }
    }
}

#[async_trait]
impl StepBody for SimulatedBody {
    async fn execute(&self, task: &StepTask) -> Result<()> {
        let delay_ms: u64 = rand::thread_rng().gen_range(100..=800);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let prompt_tokens: u64 = rand::thread_rng().gen_range(200..=1500);
        let completion_tokens: u64 = rand::thread_rng().gen_range(50..=800);
        obs::add_tokens("in", &task.model, &task.persona, prompt_tokens);
        obs::add_tokens("out", &task.model, &task.persona, completion_tokens);

        let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
        if roll < self.failure_rate {
            anyhow::bail!("simulated_step_error");
        }
        Ok(())
    }
}

pub struct Worker {
    broker: Broker,
    kv: KvStore,
    queue: String,
    body: Arc<dyn StepBody>,
}

impl Worker {
    pub fn new(broker: Broker, kv: KvStore, queue: String, body: Arc<dyn StepBody>) -> Self {
        Self {
            broker,
            kv,
            queue,
            body,
        }
    }

    /// Main loop. Never returns under normal operation; broker errors are
    /// logged and retried after a short pause.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(queue = %self.queue, "worker started");
        loop {
            if let Err(e) = self.broker.promote_due(&self.queue).await {
                tracing::error!(error = %e, "failed to promote delayed tasks");
            }
            if let Err(e) = self.broker.reclaim_expired(&self.queue).await {
                tracing::error!(error = %e, "failed to reclaim expired tasks");
            }

            match self.broker.reserve(&self.queue, RESERVE_TIMEOUT_SECS).await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(delivery).await {
                        tracing::error!(error = %e, "task processing failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "broker receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<()> {
        let task = &delivery.task;

        // 1. Per-persona rate limit, checked before any claim so a deferred
        //    task has not consumed its idempotency slot.
        let (limit, window) = router::rate_limit(&task.persona);
        let rate_key = kv::rate_key(&task.persona, unix_now(), window);
        let count = self.kv.incr_window(&rate_key, window).await?;
        if count > limit {
            tracing::warn!(
                persona = %task.persona,
                count,
                limit,
                "persona rate limit exceeded, deferring"
            );
            obs::step_retry(&task.flow_id, &task.step_id, &task.persona);
            self.broker
                .enqueue_delayed(task, RATE_LIMIT_RETRY_SECS)
                .await?;
            self.broker.ack(&delivery).await?;
            return Ok(());
        }

        // 2. Idempotency claim: at most one body execution per operation.
        let idem_key = kv::idempotency_key(&task.flow_id, &task.task_id, &task.step_id, &task.payload);
        if !self.kv.claim(&idem_key).await? {
            tracing::info!(
                task = %task.task_id,
                step = %task.step_id,
                "duplicate step, ignoring"
            );
            self.broker.ack(&delivery).await?;
            return Ok(());
        }

        // 3. Live-write gates. Denied tasks are acknowledged without running.
        if let Err(denied) = write_gate(task) {
            tracing::error!(
                task = %task.task_id,
                step = %task.step_id,
                error = %denied,
                "permission denied, task dropped"
            );
            self.kv.mark_done(&idem_key).await?;
            self.broker.ack(&delivery).await?;
            return Ok(());
        }

        // 4. Execute the opaque body inside the metric scope.
        obs::flow_start(
            &task.flow_id,
            &task.persona,
            task.exec_mode.as_str(),
            &task.branch,
        );
        let started = Instant::now();
        let outcome = {
            let _timer = obs::step_timer(
                &task.flow_id,
                &task.step_id,
                &task.persona,
                &task.model,
                task.exec_mode.as_str(),
            );
            tokio::time::timeout(TASK_TIME_LIMIT, self.body.execute(task)).await
        };
        if started.elapsed() > TASK_SOFT_TIME_LIMIT {
            tracing::warn!(
                task = %task.task_id,
                elapsed_secs = started.elapsed().as_secs(),
                "task exceeded soft time limit"
            );
        }

        match outcome {
            Ok(Ok(())) => {
                obs::flow_end(
                    &task.flow_id,
                    &task.persona,
                    task.exec_mode.as_str(),
                    &task.branch,
                    true,
                    "ok",
                );
                self.kv.mark_done(&idem_key).await?;
                self.broker.ack(&delivery).await?;
                tracing::info!(
                    task = %task.task_id,
                    step = %task.step_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "✓ step done"
                );
            }
            Ok(Err(e)) => {
                self.handle_failure(&delivery, &idem_key, &format!("{e:#}"), "StepFailure")
                    .await?;
            }
            Err(_) => {
                self.handle_failure(
                    &delivery,
                    &idem_key,
                    "task time limit exceeded",
                    "StepTimeout",
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        idem_key: &str,
        error: &str,
        reason: &str,
    ) -> Result<()> {
        let task = &delivery.task;
        obs::step_retry(&task.flow_id, &task.step_id, &task.persona);
        obs::flow_end(
            &task.flow_id,
            &task.persona,
            task.exec_mode.as_str(),
            &task.branch,
            false,
            reason,
        );

        if task.attempt < MAX_RETRIES {
            let delay = backoff_with_jitter(task.attempt);
            tracing::warn!(
                task = %task.task_id,
                step = %task.step_id,
                attempt = task.attempt + 1,
                max_retries = MAX_RETRIES,
                delay_secs = delay,
                error,
                "step failed, scheduling retry"
            );
            let mut retry = task.clone();
            retry.attempt += 1;
            // Release the claim so the redelivery can take it again.
            self.kv.release(idem_key).await?;
            self.broker.enqueue_delayed(&retry, delay).await?;
        } else {
            tracing::error!(
                task = %task.task_id,
                step = %task.step_id,
                attempts = task.attempt + 1,
                error,
                "✗ step failed permanently"
            );
            self.kv.mark_done(idem_key).await?;
        }

        self.broker.ack(delivery).await?;
        Ok(())
    }
}

/// Live tasks require `ALLOW_WRITES=1`, and destructive live tasks must opt
/// in explicitly. Dry-run tasks always pass.
pub fn write_gate(task: &StepTask) -> Result<(), PermissionDenied> {
    if task.exec_mode != ExecMode::Live {
        return Ok(());
    }
    if std::env::var("ALLOW_WRITES").as_deref() != Ok("1") {
        return Err(PermissionDenied::WritesBlocked);
    }
    if !task.allow_destructive {
        return Err(PermissionDenied::DestructiveBlocked);
    }
    Ok(())
}

/// Exponential backoff with full jitter: uniform over `[0, base * 2^attempt]`.
pub fn backoff_with_jitter(attempt: u32) -> u64 {
    let ceiling = RETRY_BACKOFF_BASE_SECS.saturating_mul(1 << attempt.min(6));
    rand::thread_rng().gen_range(0..=ceiling)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
