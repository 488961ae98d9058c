//! Metric export at the end of a run.

use std::io::Write;
use wlam_metrics::MetricsSnapshot;

/// Write the snapshot as pretty JSON followed by a newline.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

fn prom_name(name: &str) -> String {
    name.replace('.', "_")
}

/// Turn a series key `name|a=1,b=2` into `name{a="1",b="2"}`.
fn prom_series(series_key: &str) -> String {
    match series_key.split_once('|') {
        None => prom_name(series_key),
        Some((name, labels)) => {
            let labels: Vec<String> = labels
                .split(',')
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
                .collect();
            format!("{}{{{}}}", prom_name(name), labels.join(","))
        }
    }
}

/// Write the snapshot in Prometheus text exposition format.
///
/// Counters are written per labelled series, gauges and histograms per node.
/// Histograms become summaries with 0.5, 0.9 and 0.99 quantiles.
pub fn export_prometheus<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    for name in snapshot.counters.keys() {
        writeln!(writer, "# TYPE {} counter", prom_name(name))?;
        let prefix = format!("{}|", name);
        for (series, value) in &snapshot.series {
            if series == name || series.starts_with(&prefix) {
                writeln!(writer, "{} {}", prom_series(series), value)?;
            }
        }
    }

    for (name, value) in &snapshot.gauges {
        let prom = prom_name(name);
        writeln!(writer, "# TYPE {} gauge", prom)?;
        let mut per_node = false;
        for (node, metrics) in &snapshot.nodes {
            if let Some(v) = metrics.gauges.get(name) {
                writeln!(writer, "{}{{node=\"{}\"}} {}", prom, node, v)?;
                per_node = true;
            }
        }
        if !per_node {
            writeln!(writer, "{} {}", prom, value)?;
        }
    }

    for (name, summary) in &snapshot.histograms {
        let prom = prom_name(name);
        writeln!(writer, "# TYPE {} summary", prom)?;
        for (q, v) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
            writeln!(writer, "{}{{quantile=\"{}\"}} {}", prom, q, v)?;
        }
        writeln!(writer, "{}_sum {}", prom, summary.sum)?;
        writeln!(writer, "{}_count {}", prom, summary.count)?;
        for (node, metrics) in &snapshot.nodes {
            if let Some(s) = metrics.histograms.get(name) {
                writeln!(writer, "{}_sum{{node=\"{}\"}} {}", prom, node, s.sum)?;
                writeln!(writer, "{}_count{{node=\"{}\"}} {}", prom, node, s.count)?;
            }
        }
    }

    Ok(())
}
