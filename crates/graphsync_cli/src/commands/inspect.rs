//! Inspect command implementation.

use graphsync_protocol::{Frame, FrameKind, Message};
use serde::Serialize;
use std::path::Path;

/// A decoded frame.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Frame kind.
    pub kind: FrameKind,
    /// Connection id from the envelope.
    pub connection_id: u32,
    /// Envelope sequence.
    pub sequence: u64,
    /// Envelope timestamp.
    pub timestamp: u64,
    /// Whether the payload was compressed.
    pub compressed: bool,
    /// Payload size on the wire.
    pub payload_size: usize,
    /// Payload size after decompression.
    pub raw_size: usize,
    /// The decoded message.
    pub message: Message,
}

/// Decodes frame bytes.
pub fn decode(bytes: &[u8]) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let frame = Frame::from_bytes(bytes)?;
    let (message, raw_size) = frame.open()?;
    Ok(InspectResult {
        kind: frame.kind,
        connection_id: frame.connection_id.as_u32(),
        sequence: frame.sequence,
        timestamp: frame.timestamp,
        compressed: frame.compressed,
        payload_size: frame.payload.len(),
        raw_size,
        message,
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    let result = decode(&bytes)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Frame: {}", path.display());
            println!("  Kind:        {}", result.kind);
            println!("  Connection:  {}", result.connection_id);
            println!("  Sequence:    {}", result.sequence);
            println!("  Timestamp:   {}", result.timestamp);
            println!(
                "  Payload:     {} bytes ({} raw{})",
                result.payload_size,
                result.raw_size,
                if result.compressed { ", lz4" } else { "" }
            );
            println!("  Message:");
            println!("{}", serde_json::to_string_pretty(&result.message)?);
        }
    }

    Ok(())
}
