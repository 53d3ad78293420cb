//! Reliable queue over the shared Redis instance.
//!
//! Delivery protocol:
//! - `enqueue` pushes the serialized task onto the persona's queue list.
//! - `reserve` atomically moves one task into the queue's processing list
//!   (`BLMOVE`) and records a claim timestamp. The task stays there until
//!   `ack` removes it — ack-late semantics.
//! - `reclaim_expired` re-enqueues processing entries whose claim is older
//!   than the visibility timeout, which is how work survives a lost worker.
//! - `enqueue_delayed` parks a task in a per-queue sorted set scored by its
//!   ready time; `promote_due` moves due tasks back onto the queue.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::router;
use super::task::StepTask;

/// How long a reserved task may stay unacknowledged before it is handed to
/// another worker.
pub const VISIBILITY_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
}

/// One reserved task. Holds the raw payload so `ack` can remove exactly the
/// entry that was moved into the processing list.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: StepTask,
    pub raw: String,
    pub queue: String,
}

impl Broker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("failed to create broker client for {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to broker")?;
        Ok(Self { conn })
    }

    /// Route by persona and push. FIFO within a queue, modulo retries.
    pub async fn enqueue(&self, task: &StepTask) -> Result<String> {
        let queue = router::queue_for(&task.persona);
        let raw = serde_json::to_string(task).context("failed to serialize task")?;
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .lpush(queue, &raw)
            .await
            .with_context(|| format!("failed to enqueue on {queue}"))?;
        Ok(queue.to_string())
    }

    /// Park a task until `now + delay_secs`, then `promote_due` delivers it.
    pub async fn enqueue_delayed(&self, task: &StepTask, delay_secs: u64) -> Result<()> {
        let queue = router::queue_for(&task.persona);
        let raw = serde_json::to_string(task).context("failed to serialize task")?;
        let ready_at = (unix_now() + delay_secs) as f64;
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .zadd(delayed_key(queue), &raw, ready_at)
            .await
            .with_context(|| format!("failed to delay-enqueue on {queue}"))?;
        Ok(())
    }

    /// Move tasks whose ready time has passed onto the live queue. Returns
    /// how many were promoted.
    pub async fn promote_due(&self, queue: &str) -> Result<usize> {
        let key = delayed_key(queue);
        let now = unix_now() as f64;
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(&key, 0f64, now)
            .await
            .context("failed to read delayed tasks")?;

        let mut promoted = 0;
        for raw in due {
            // ZREM is the claim: only one promoter wins a given entry.
            let removed: u64 = conn.zrem(&key, &raw).await?;
            if removed > 0 {
                let _: u64 = conn.lpush(queue, &raw).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Blocking reserve of one task (prefetch=1). Returns `None` on timeout.
    pub async fn reserve(&self, queue: &str, timeout_secs: u64) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("blocking receive on {queue} failed"))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let _: bool = conn.hset(claims_key(queue), &raw, unix_now()).await?;

        match serde_json::from_str::<StepTask>(&raw) {
            Ok(task) => Ok(Some(Delivery {
                task,
                raw,
                queue: queue.to_string(),
            })),
            Err(e) => {
                // Poison message: drop it rather than redeliver forever.
                tracing::warn!(queue, error = %e, "discarding undecodable task");
                self.ack_raw(queue, &raw).await?;
                Ok(None)
            }
        }
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ack_raw(&delivery.queue, &delivery.raw).await
    }

    async fn ack_raw(&self, queue: &str, raw: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.lrem(processing_key(queue), 1, raw).await?;
        let _: u64 = conn.hdel(claims_key(queue), raw).await?;
        Ok(())
    }

    /// Re-enqueue processing entries whose claim exceeded the visibility
    /// timeout (worker lost or wedged). Returns how many were reclaimed.
    pub async fn reclaim_expired(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let claims: HashMap<String, u64> = conn
            .hgetall(claims_key(queue))
            .await
            .context("failed to read claims")?;
        let cutoff = unix_now().saturating_sub(VISIBILITY_TIMEOUT_SECS);

        let mut reclaimed = 0;
        for (raw, claimed_at) in claims {
            if claimed_at >= cutoff {
                continue;
            }
            let removed: u64 = conn.lrem(processing_key(queue), 1, &raw).await?;
            if removed > 0 {
                let _: u64 = conn.lpush(queue, &raw).await?;
                reclaimed += 1;
                tracing::warn!(queue, "reclaimed task past visibility timeout");
            }
            let _: u64 = conn.hdel(claims_key(queue), &raw).await?;
        }
        Ok(reclaimed)
    }
}

fn processing_key(queue: &str) -> String {
    format!("arx:proc:{queue}")
}

fn delayed_key(queue: &str) -> String {
    format!("arx:delayed:{queue}")
}

fn claims_key(queue: &str) -> String {
    format!("arx:claims:{queue}")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces_are_disjoint() {
        let queue = "q.coder";
        let keys = [
            queue.to_string(),
            processing_key(queue),
            delayed_key(queue),
            claims_key(queue),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_unix_now_is_sane() {
        // Past 2020, not in the far future.
        let now = unix_now();
        assert!(now > 1_577_836_800);
    }
}
