//! Scrape-based metrics assertion, used as a CI gate.
//!
//! Requires `flow_started_total >= 1` and `flow_success_total >= 1`, then
//! checks that every persona's p95 step latency stays under the threshold.
//! p95 is read from the cumulative histogram buckets: the smallest `le`
//! whose cumulative count covers 95% of observations.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone)]
pub struct AssertOptions {
    pub url: String,
    pub p95_ms: f64,
}

impl Default for AssertOptions {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9108/metrics".to_string(),
            p95_ms: 1200.0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct HistogramSeries {
    /// `(le, cumulative_count)` pairs, unsorted as scraped.
    pub buckets: Vec<(f64, f64)>,
    pub total: f64,
}

pub async fn run(opts: &AssertOptions) -> Result<()> {
    let text = scrape(&opts.url).await?;

    let started = counter_sum(&text, "flow_started_total");
    let success = counter_sum(&text, "flow_success_total");
    if started < 1.0 || success < 1.0 {
        bail!("counters too low: started={started}, success={success}");
    }

    let histograms = parse_histogram(&text, "step_latency_ms", "persona");
    let mut violations = Vec::new();
    for (persona, series) in &histograms {
        let Some(p95) = p95_from_buckets(series) else {
            continue;
        };
        if p95 > opts.p95_ms {
            violations.push((persona.clone(), p95, series.total));
        }
    }

    if !violations.is_empty() {
        for (persona, p95, n) in &violations {
            println!("✗ p95 too high: persona={persona} p95={p95}ms n={}", *n as u64);
        }
        bail!("{} persona(s) above the p95 threshold", violations.len());
    }

    println!(
        "✓ metrics ok: started={} success={} (p95 <= {} ms)",
        started as u64, success as u64, opts.p95_ms
    );
    Ok(())
}

async fn scrape(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .context("failed to build HTTP client")?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to scrape {url}"))?;
    Ok(response.text().await?)
}

/// Sum the values of every sample of a counter family. Lines look like
/// `name{labels} value` or `name value`.
pub fn counter_sum(text: &str, name: &str) -> f64 {
    text.lines()
        .filter_map(|line| {
            let rest = line.strip_prefix(name)?;
            if !(rest.starts_with('{') || rest.starts_with(' ')) {
                return None;
            }
            line.rsplit(' ').next()?.parse::<f64>().ok()
        })
        .sum()
}

/// Collect per-`label_key` cumulative buckets and totals of a histogram.
pub fn parse_histogram(text: &str, name: &str, label_key: &str) -> HashMap<String, HistogramSeries> {
    let bucket_prefix = format!("{name}_bucket");
    let count_prefix = format!("{name}_count");
    let mut series: HashMap<String, HistogramSeries> = HashMap::new();

    for line in text.lines() {
        if line.starts_with(&bucket_prefix) {
            let Some((labels, value)) = split_sample(line) else {
                continue;
            };
            let (Some(le), Some(key)) = (label_value(labels, "le"), label_value(labels, label_key))
            else {
                continue;
            };
            let Ok(le) = le.parse::<f64>() else { continue };
            series
                .entry(key.to_string())
                .or_default()
                .buckets
                .push((le, value));
        } else if line.starts_with(&count_prefix) {
            let Some((labels, value)) = split_sample(line) else {
                continue;
            };
            let Some(key) = label_value(labels, label_key) else {
                continue;
            };
            series.entry(key.to_string()).or_default().total += value;
        }
    }

    series
}

/// Smallest `le` whose cumulative count reaches 95% of the total.
pub fn p95_from_buckets(series: &HistogramSeries) -> Option<f64> {
    if series.total == 0.0 {
        return None;
    }
    let target = 0.95 * series.total;
    let mut buckets = series.buckets.clone();
    buckets.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    buckets
        .iter()
        .find(|(_, cumulative)| *cumulative >= target)
        .map(|(le, _)| *le)
}

/// Split `name{labels} value` into the label body and the parsed value.
fn split_sample(line: &str) -> Option<(&str, f64)> {
    let (_, rest) = line.split_once('{')?;
    let (labels, tail) = rest.split_once('}')?;
    let value = tail.trim().parse::<f64>().ok()?;
    Some((labels, value))
}

/// Extract `key="value"` from a label body.
fn label_value<'a>(labels: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("{key}=\"");
    let start = labels.find(&marker)? + marker.len();
    let end = labels[start..].find('"')? + start;
    Some(&labels[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# HELP flow_started_total Flows started
# TYPE flow_started_total counter
flow_started_total{flow_id="flow_demo",persona="CODER_AI",exec_mode="dry_run",branch="feature/x"} 30
flow_started_total{flow_id="flow_demo",persona="AUDITOR_AI",exec_mode="dry_run",branch="feature/x"} 10
flow_success_total{flow_id="flow_demo",persona="CODER_AI",exec_mode="dry_run",branch="feature/x"} 29
step_latency_ms_bucket{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run",le="50"} 0
step_latency_ms_bucket{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run",le="100"} 2
step_latency_ms_bucket{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run",le="200"} 10
step_latency_ms_bucket{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run",le="400"} 20
step_latency_ms_bucket{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run",le="800"} 29
step_latency_ms_bucket{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run",le="+Inf"} 30
step_latency_ms_count{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run"} 30
step_latency_ms_sum{flow_id="flow_demo",step_id="s1",persona="CODER_AI",model="local-13b",exec_mode="dry_run"} 9000
"#;

    #[test]
    fn test_counter_sum() {
        assert!((counter_sum(SAMPLE, "flow_started_total") - 40.0).abs() < f64::EPSILON);
        assert!((counter_sum(SAMPLE, "flow_success_total") - 29.0).abs() < f64::EPSILON);
        assert_eq!(counter_sum(SAMPLE, "flow_fail_total"), 0.0);
    }

    #[test]
    fn test_counter_sum_skips_derived_names() {
        // `step_latency_ms_bucket` must not count toward `step_latency_ms`.
        assert_eq!(counter_sum(SAMPLE, "step_latency_ms"), 0.0);
    }

    #[test]
    fn test_parse_histogram() {
        let series = parse_histogram(SAMPLE, "step_latency_ms", "persona");
        assert_eq!(series.len(), 1);
        let coder = &series["CODER_AI"];
        assert_eq!(coder.total, 30.0);
        assert_eq!(coder.buckets.len(), 6);
        assert!(coder.buckets.iter().any(|(le, _)| le.is_infinite()));
    }

    #[test]
    fn test_p95_from_buckets() {
        let series = parse_histogram(SAMPLE, "step_latency_ms", "persona");
        // target = 28.5; le=800 is the first bucket with cumulative >= 28.5.
        assert_eq!(p95_from_buckets(&series["CODER_AI"]), Some(800.0));
    }

    #[test]
    fn test_p95_empty_series() {
        assert_eq!(p95_from_buckets(&HistogramSeries::default()), None);
    }

    #[test]
    fn test_p95_everything_in_last_bucket() {
        let series = HistogramSeries {
            buckets: vec![(50.0, 0.0), (f64::INFINITY, 10.0)],
            total: 10.0,
        };
        assert_eq!(p95_from_buckets(&series), Some(f64::INFINITY));
    }

    #[test]
    fn test_label_value() {
        assert_eq!(
            label_value(r#"persona="CODER_AI",le="50""#, "persona"),
            Some("CODER_AI")
        );
        assert_eq!(label_value(r#"persona="CODER_AI""#, "model"), None);
    }
}
