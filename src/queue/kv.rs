//! Idempotency locks and fixed-window rate counters over the shared KV
//! store.
//!
//! One logical operation is identified by `(flow, task, step, payload)`; its
//! key holds `running` while a worker owns it and `done` once finished, with
//! a 24 h TTL. All writes are single atomic commands (`SET NX`, `INCR`,
//! `EXPIRE`), so concurrent workers cannot both claim the same operation.

use anyhow::{Context, Result};
use blake2::digest::consts::{U12, U16};
use blake2::{Blake2b, Digest};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

pub const IDEMPOTENCY_TTL_SECS: u64 = 60 * 60 * 24;

/// The canonical payload is truncated to this many characters before
/// hashing.
const PAYLOAD_HASH_MAX_CHARS: usize = 4096;

#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("failed to create KV client for {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to KV store")?;
        Ok(Self { conn })
    }

    /// `SET NX EX` claim. Returns false when another worker already holds
    /// (or finished) this operation within the TTL.
    pub async fn claim(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("running")
            .arg("NX")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context("idempotency claim failed")?;
        Ok(reply.is_some())
    }

    /// Overwrite the claim with `done`, refreshing the TTL for visibility.
    pub async fn mark_done(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg("done")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SECS)
            .query_async(&mut conn)
            .await
            .context("idempotency completion failed")?;
        Ok(())
    }

    /// Release a claim so a scheduled redelivery can re-claim it.
    pub async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(key).await.context("idempotency release failed")?;
        Ok(())
    }

    /// Fixed-window counter: `INCR`, with `EXPIRE` set on the first hit of
    /// the window.
    pub async fn incr_window(&self, key: &str, window_secs: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await.context("rate counter failed")?;
        if count == 1 {
            let _: bool = conn
                .expire(key, window_secs as i64)
                .await
                .context("rate counter expiry failed")?;
        }
        Ok(count)
    }
}

/// `arx:idemp:<blake2b-12 of flow:task:step:payload_hash>`.
pub fn idempotency_key(
    flow_id: &str,
    task_id: &str,
    step_id: &str,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let base = format!(
        "{flow_id}:{task_id}:{step_id}:{}",
        payload_hash(payload)
    );
    format!("arx:idemp:{}", blake2b_hex_12(base.as_bytes()))
}

/// blake2b-16 over the canonical (sorted-key) JSON of the payload.
pub fn payload_hash(payload: &serde_json::Map<String, serde_json::Value>) -> String {
    let canonical = canonical_json(&serde_json::Value::Object(payload.clone()));
    let truncated: String = canonical.chars().take(PAYLOAD_HASH_MAX_CHARS).collect();
    blake2b_hex_16(truncated.as_bytes())
}

/// `arx:rl:<persona>:<window index>` for the fixed window containing `now`.
pub fn rate_key(persona: &str, now_secs: u64, window_secs: u64) -> String {
    format!("arx:rl:{persona}:{}", now_secs / window_secs.max(1))
}

/// JSON with recursively sorted object keys, so hashing is independent of
/// insertion order.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn blake2b_hex_12(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U12>::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

fn blake2b_hex_16(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U16>::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_idempotency_key_shape() {
        let key = idempotency_key("flow_demo", "T-0001", "step_001", &payload(&[]));
        assert!(key.starts_with("arx:idemp:"));
        // 12-byte digest, hex-encoded.
        assert_eq!(key.len(), "arx:idemp:".len() + 24);
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let p = payload(&[("i", serde_json::json!(1))]);
        let a = idempotency_key("f", "t", "s", &p);
        let b = idempotency_key("f", "t", "s", &p);
        assert_eq!(a, b);
    }

    #[test]
    fn test_idempotency_key_differs_per_operation() {
        let p = payload(&[("i", serde_json::json!(1))]);
        let base = idempotency_key("f", "t", "s", &p);
        assert_ne!(base, idempotency_key("f2", "t", "s", &p));
        assert_ne!(base, idempotency_key("f", "t2", "s", &p));
        assert_ne!(base, idempotency_key("f", "t", "s2", &p));
        assert_ne!(
            base,
            idempotency_key("f", "t", "s", &payload(&[("i", serde_json::json!(2))]))
        );
    }

    #[test]
    fn test_payload_hash_independent_of_insertion_order() {
        let mut a = serde_json::Map::new();
        a.insert("a".to_string(), serde_json::json!(1));
        a.insert("b".to_string(), serde_json::json!({"y": 2, "x": 1}));

        let mut b = serde_json::Map::new();
        b.insert("b".to_string(), serde_json::json!({"x": 1, "y": 2}));
        b.insert("a".to_string(), serde_json::json!(1));

        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn test_payload_hash_length() {
        // 16-byte digest, hex-encoded.
        assert_eq!(payload_hash(&payload(&[])).len(), 32);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": {"d": 2, "c": [1, {"f": 1, "e": 0}]}, "a": 1});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":1,"b":{"c":[1,{"e":0,"f":1}],"d":2}}"#
        );
    }

    #[test]
    fn test_rate_key_windows() {
        assert_eq!(rate_key("CODER_AI", 120, 60), "arx:rl:CODER_AI:2");
        assert_eq!(rate_key("CODER_AI", 179, 60), "arx:rl:CODER_AI:2");
        assert_eq!(rate_key("CODER_AI", 180, 60), "arx:rl:CODER_AI:3");
    }
}
