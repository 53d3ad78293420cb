//! Environment-driven configuration.
//!
//! The broker and KV store share one Redis instance by default. Host
//! resolution is best effort: CI runners always get localhost, and an
//! unresolvable `AR_REDIS_HOST` (the compose-network default `redis`) falls
//! back to localhost.

use std::net::ToSocketAddrs;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    pub kv_url: String,
    pub metrics_port: u16,
    pub metrics_addr: String,
    pub worker_queue: String,
    pub worker_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let host = default_redis_host();
        let port = std::env::var("AR_REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        let default_url = format!("redis://{host}:{port}/0");

        Self {
            broker_url: std::env::var("AR_BROKER_URL").unwrap_or_else(|_| default_url.clone()),
            kv_url: std::env::var("REDIS_URL").unwrap_or(default_url),
            metrics_port: std::env::var("AR_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9108),
            metrics_addr: std::env::var("AR_METRICS_ADDR")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            worker_queue: std::env::var("ARX_WORKER_QUEUE")
                .unwrap_or_else(|_| crate::queue::router::DEFAULT_QUEUE.to_string()),
            worker_concurrency: std::env::var("ARX_WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
        }
    }
}

pub fn flow_engine_enabled() -> bool {
    std::env::var("AR_ENABLE_FLOW_ENGINE").as_deref() == Ok("1")
}

fn default_redis_host() -> String {
    // CI runners talk to a service container on localhost.
    if std::env::var("CI").as_deref() == Ok("true")
        || std::env::var("GITHUB_ACTIONS").as_deref() == Ok("true")
    {
        return "127.0.0.1".to_string();
    }

    let host = std::env::var("AR_REDIS_HOST").unwrap_or_else(|_| "redis".to_string());
    if (host.as_str(), 6379u16).to_socket_addrs().is_ok() {
        host
    } else {
        "127.0.0.1".to_string()
    }
}
