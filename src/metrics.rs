//! Prometheus Exposition
//!
//! Renders a [`UsageStats`] tree in the Prometheus text format. Every node
//! of the tree becomes one label set (`backend`, `kind`), so wrappers and
//! the stores they wrap are reported separately.

use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::backend::UsageStats;
use crate::error::Result;

const NAMESPACE: &str = "ddc";
const LABELS: &[&str] = &["backend", "kind"];

struct Collectors {
    get_hits: IntCounterVec,
    get_misses: IntCounterVec,
    get_bytes: IntCounterVec,
    put_stored: IntCounterVec,
    put_skipped: IntCounterVec,
    put_bytes: IntCounterVec,
    removes: IntCounterVec,
    corruptions: IntCounterVec,
    hit_ratio: GaugeVec,
    read_latency: GaugeVec,
    write_latency: GaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), LABELS)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), LABELS)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Collectors {
    fn register(registry: &Registry) -> Result<Self> {
        Ok(Self {
            get_hits: counter(registry, "get_hits_total", "Lookups answered")?,
            get_misses: counter(registry, "get_misses_total", "Lookups missed")?,
            get_bytes: counter(registry, "get_bytes_total", "Bytes returned by lookups")?,
            put_stored: counter(registry, "put_stored_total", "Writes stored")?,
            put_skipped: counter(registry, "put_skipped_total", "Writes skipped or failed")?,
            put_bytes: counter(registry, "put_bytes_total", "Bytes stored")?,
            removes: counter(registry, "removes_total", "Removals")?,
            corruptions: counter(registry, "corruptions_total", "Corrupt entries detected")?,
            hit_ratio: gauge(registry, "hit_ratio", "Lookup hit ratio")?,
            read_latency: gauge(registry, "read_latency_seconds", "Average lookup latency")?,
            write_latency: gauge(registry, "write_latency_seconds", "Average write latency")?,
        })
    }

    fn observe(&self, node: &UsageStats) {
        let kind = node.kind.name();
        let labels = [node.name.as_str(), kind];
        let stats = &node.stats;
        self.get_hits.with_label_values(&labels).inc_by(stats.get_hits);
        self.get_misses.with_label_values(&labels).inc_by(stats.get_misses);
        self.get_bytes.with_label_values(&labels).inc_by(stats.get_bytes);
        self.put_stored.with_label_values(&labels).inc_by(stats.put_stored);
        self.put_skipped.with_label_values(&labels).inc_by(stats.put_skipped);
        self.put_bytes.with_label_values(&labels).inc_by(stats.put_bytes);
        self.removes.with_label_values(&labels).inc_by(stats.removes);
        self.corruptions.with_label_values(&labels).inc_by(stats.corruptions);
        self.hit_ratio.with_label_values(&labels).set(stats.hit_ratio);
        self.read_latency
            .with_label_values(&labels)
            .set(stats.read_latency_us as f64 / 1e6);
        self.write_latency
            .with_label_values(&labels)
            .set(stats.write_latency_us as f64 / 1e6);

        for child in &node.children {
            self.observe(child);
        }
    }
}

/// Encode `stats` and every node below it
pub fn encode_prometheus(stats: &UsageStats) -> Result<String> {
    let registry = Registry::new();
    let collectors = Collectors::register(&registry)?;
    collectors.observe(stats);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| crate::error::Error::Internal(format!("metrics output is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, SpeedClass, StatsSnapshot};

    #[test]
    fn test_encode_tree() {
        let leaf = UsageStats::leaf(
            "Local",
            BackendKind::FileSystem,
            SpeedClass::Fast,
            StatsSnapshot {
                get_hits: 3,
                get_misses: 1,
                hit_ratio: 0.75,
                ..Default::default()
            },
        );
        let root = UsageStats::leaf(
            "Root",
            BackendKind::Hierarchical,
            SpeedClass::Fast,
            StatsSnapshot::default(),
        )
        .with_children(vec![leaf]);

        let text = encode_prometheus(&root).unwrap();
        assert!(text.contains("ddc_get_hits_total{backend=\"Local\",kind=\"filesystem\"} 3"));
        assert!(text.contains("ddc_hit_ratio{backend=\"Local\",kind=\"filesystem\"} 0.75"));
        assert!(text.contains("backend=\"Root\""));
    }
}
