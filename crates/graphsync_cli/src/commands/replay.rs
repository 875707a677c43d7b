//! Replay command implementation.
//!
//! A trace is a JSON-lines file of [`Message`]s as the client would receive
//! them. A blank line closes a batch: everything released by ingress since
//! the previous blank line is merged as one version.

use graphsync_engine::{
    DeltaMerger, GraphSnapshot, Ingested, IngressConfig, MergeConfig, MessageIngress,
    StatsAggregator, SyncStats,
};
use graphsync_protocol::{DeltaOp, Frame, Message, ProtocolError, ResyncRequest};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// Errors reading a trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The file could not be read.
    #[error("cannot read trace: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a valid message.
    #[error("line {line}: {source}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A message could not be framed.
    #[error("line {line}: {source}")]
    Encode {
        /// 1-based line number.
        line: usize,
        /// Underlying codec error.
        source: ProtocolError,
    },
}

/// Parses a trace into batches of messages with their line numbers.
pub fn parse_trace(text: &str) -> Result<Vec<Vec<(usize, Message)>>, TraceError> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
            }
            continue;
        }
        let message = serde_json::from_str(line).map_err(|source| TraceError::Parse {
            line: line_no,
            source,
        })?;
        current.push((line_no, message));
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

/// Outcome of a replay.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Frames fed to ingress.
    pub frames: usize,
    /// Batches in the trace.
    pub batches: usize,
    /// Final snapshot version.
    pub version: u64,
    /// Nodes in the final replica.
    pub node_count: usize,
    /// Links in the final replica.
    pub link_count: usize,
    /// Resync requests the client would have sent.
    pub resync_requests: Vec<ResyncRequest>,
    /// Heartbeats seen.
    pub heartbeats: usize,
    /// Diagnostics counters.
    pub stats: SyncStats,
    /// The final replica, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSnapshot>,
}

/// Feeds `batches` through a fresh ingress and merger.
pub fn replay(
    batches: &[Vec<(usize, Message)>],
    compress: bool,
) -> Result<(ReplayReport, Arc<GraphSnapshot>), TraceError> {
    let stats = Arc::new(StatsAggregator::new());
    let mut ingress = MessageIngress::new(IngressConfig::default(), Arc::clone(&stats));
    let mut merger = DeltaMerger::new(MergeConfig::default(), Arc::clone(&stats));

    let mut frames = 0;
    let mut heartbeats = 0;
    let mut resync_requests = Vec::new();

    for batch in batches {
        let mut ready: Vec<DeltaOp> = Vec::new();
        for (line, message) in batch {
            let bytes = Frame::from_message(message, compress)
                .and_then(|frame| frame.to_bytes())
                .map_err(|source| TraceError::Encode {
                    line: *line,
                    source,
                })?;
            frames += 1;

            match ingress.ingest(&bytes, Instant::now()) {
                Ingested::Ops(ops) => ready.extend(ops),
                Ingested::Snapshot { snapshot, then } => {
                    merger.apply_batch(&ready);
                    ready.clear();
                    merger.replace_snapshot(&snapshot, &[]);
                    ready.extend(then);
                }
                Ingested::Resync(request) => {
                    debug!(line, connection = %request.connection_id, "resync requested");
                    resync_requests.push(request);
                }
                Ingested::Ping(_) | Ingested::Pong(_) => heartbeats += 1,
                Ingested::Duplicate | Ingested::Buffered => {}
                Ingested::Dropped(err) => debug!(line, error = %err, "frame dropped"),
            }
        }
        merger.apply_batch(&ready);
    }

    let snapshot = merger.snapshot();
    info!(
        frames,
        batches = batches.len(),
        version = snapshot.version(),
        "trace replayed"
    );
    let report = ReplayReport {
        frames,
        batches: batches.len(),
        version: snapshot.version(),
        node_count: snapshot.node_count(),
        link_count: snapshot.link_count(),
        resync_requests,
        heartbeats,
        stats: stats.snapshot(),
        graph: None,
    };
    Ok((report, snapshot))
}

/// Runs the replay command.
pub fn run(
    path: &Path,
    compress: bool,
    show_graph: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path).map_err(TraceError::from)?;
    let batches = parse_trace(&text)?;
    let (mut report, snapshot) = replay(&batches, compress)?;
    if show_graph {
        report.graph = Some((*snapshot).clone());
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => print_text_output(&report, &snapshot, show_graph),
    }

    Ok(())
}

fn print_text_output(report: &ReplayReport, snapshot: &GraphSnapshot, show_graph: bool) {
    println!("Replay Summary");
    println!("==============");
    println!("Frames:             {}", report.frames);
    println!("Batches:            {}", report.batches);
    println!("Version:            {}", report.version);
    println!("Nodes:              {}", report.node_count);
    println!("Links:              {}", report.link_count);
    println!("Heartbeats:         {}", report.heartbeats);
    println!();
    println!("Duplicates:         {}", report.stats.duplicates_detected);
    println!("Conflicts resolved: {}", report.stats.conflicts_resolved);
    println!("Frames dropped:     {}", report.stats.frames_dropped);
    println!("Ops applied:        {}", report.stats.ops_applied);
    println!("Ops skipped:        {}", report.stats.ops_skipped);
    if report.stats.compression_ratio < 1.0 {
        println!("Compression ratio:  {:.2}", report.stats.compression_ratio);
    }

    if !report.resync_requests.is_empty() {
        println!();
        println!("Resync requests:");
        for request in &report.resync_requests {
            println!(
                "  connection {} after sequence {}",
                request.connection_id, request.last_delivered
            );
        }
    }

    if show_graph {
        println!();
        println!("Nodes:");
        for node in snapshot.nodes() {
            println!("  {} {:?}", node.id, node.attributes);
        }
        println!("Links:");
        for link in snapshot.links() {
            println!(
                "  {} {} -> {} {:?}",
                link.id, link.source, link.target, link.attributes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TRACE: &str = r#"{"type":"delta","connection_id":1,"sequence":1,"timestamp":10,"body":{"op":"add_node","id":"n1","attributes":{"label":"one"}}}
{"type":"delta","connection_id":1,"sequence":2,"timestamp":11,"body":{"op":"add_node","id":"n2"}}
{"type":"delta","connection_id":1,"sequence":2,"timestamp":11,"body":{"op":"add_node","id":"n2"}}

{"type":"ping","connection_id":1,"nonce":7,"sent_at":12}
{"type":"delta","connection_id":1,"sequence":3,"timestamp":13,"body":{"op":"add_link","id":"l1","source":"n1","target":"n2"}}
"#;

    #[test]
    fn blank_lines_split_batches() {
        let batches = parse_trace(TRACE).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1][0].0, 5);
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = parse_trace("\n{\"type\":\"nope\"}\n").unwrap_err();
        assert!(matches!(err, TraceError::Parse { line: 2, .. }));
    }

    #[test]
    fn replay_merges_each_batch_once() {
        let batches = parse_trace(TRACE).unwrap();
        for compress in [false, true] {
            let (report, snapshot) = replay(&batches, compress).unwrap();
            assert_eq!(report.frames, 5);
            assert_eq!(report.version, 2);
            assert_eq!(report.node_count, 2);
            assert_eq!(report.link_count, 1);
            assert_eq!(report.heartbeats, 1);
            assert_eq!(report.stats.duplicates_detected, 1);
            assert!(snapshot.link("l1").is_some());
        }
    }

    #[test]
    fn run_reads_trace_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TRACE.as_bytes()).unwrap();

        run(file.path(), false, true, "json").unwrap();
        run(file.path(), true, true, "text").unwrap();
    }
}
