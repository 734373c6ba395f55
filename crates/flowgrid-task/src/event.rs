//! Channel events and their wire codec.
//!
//! Events share data channels with records. Ordinary task events are JSON
//! documents; the modification marker has its own binary framing and the
//! codec routes it by tag before generic dispatch is attempted.
//!
//! # Framing
//!
//! ```text
//! generic:  [0x01] [JSON TaskEvent ...]
//! marker:   [0x4d] [modification id: u64 BE] [timestamp: u64 BE]
//!                  [target count: u32 BE] [attempt id: u64 BE] * count
//! ```
//!
//! The generic path rejects markers in both directions.

use flow_core::{ExecutionAttemptId, ModificationId};
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};
use crate::marker::ModificationMarker;

/// Tag of a JSON-encoded task event.
const GENERIC_TAG: u8 = 0x01;

/// Tag of a modification marker frame.
const MARKER_TAG: u8 = 0x4d;

/// Marker header: tag + modification id + timestamp + target count.
const MARKER_HEADER_SIZE: usize = 1 + 8 + 8 + 4;

/// Event type name a marker would carry on the generic path.
const MARKER_TYPE_NAME: &str = "modification_marker";

/// Events that travel through the generic (JSON) path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The producer will send nothing more on this channel.
    EndOfPartition,
    EndOfSuperstep,
    CancelCheckpointMarker { checkpoint_id: u64 },
}

/// Every event a channel can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Task(TaskEvent),
    Modification(ModificationMarker),
}

impl From<TaskEvent> for ChannelEvent {
    fn from(e: TaskEvent) -> Self {
        ChannelEvent::Task(e)
    }
}

impl From<ModificationMarker> for ChannelEvent {
    fn from(m: ModificationMarker) -> Self {
        ChannelEvent::Modification(m)
    }
}

// ── Codec ───────────────────────────────────────────────────────────

/// Serialize an event, routing markers to their dedicated framing.
pub fn encode(event: &ChannelEvent) -> TaskResult<Vec<u8>> {
    match event {
        ChannelEvent::Modification(marker) => Ok(encode_marker(marker)),
        ChannelEvent::Task(_) => encode_generic(event),
    }
}

/// Deserialize an event. The tag is inspected before generic dispatch.
pub fn decode(bytes: &[u8]) -> TaskResult<ChannelEvent> {
    match bytes.first() {
        Some(&MARKER_TAG) => decode_marker(bytes).map(ChannelEvent::Modification),
        Some(&GENERIC_TAG) => decode_generic(bytes),
        Some(&other) => Err(TaskError::UnknownTag(other)),
        None => Err(TaskError::Truncated {
            needed: 1,
            available: 0,
        }),
    }
}

pub fn encode_generic(event: &ChannelEvent) -> TaskResult<Vec<u8>> {
    let ChannelEvent::Task(task_event) = event else {
        return Err(TaskError::MarkerOnGenericPath);
    };
    let mut out = vec![GENERIC_TAG];
    serde_json::to_writer(&mut out, task_event)?;
    Ok(out)
}

pub fn decode_generic(bytes: &[u8]) -> TaskResult<ChannelEvent> {
    match bytes.first() {
        Some(&GENERIC_TAG) => {}
        Some(&MARKER_TAG) => return Err(TaskError::MarkerOnGenericPath),
        Some(&other) => return Err(TaskError::UnknownTag(other)),
        None => {
            return Err(TaskError::Truncated {
                needed: 1,
                available: 0,
            });
        }
    }
    let value: serde_json::Value = serde_json::from_slice(&bytes[1..])?;
    if value.get("type").and_then(serde_json::Value::as_str) == Some(MARKER_TYPE_NAME) {
        return Err(TaskError::MarkerOnGenericPath);
    }
    Ok(ChannelEvent::Task(serde_json::from_value(value)?))
}

pub fn encode_marker(marker: &ModificationMarker) -> Vec<u8> {
    let targets = marker.targets();
    let mut out = Vec::with_capacity(MARKER_HEADER_SIZE + 8 * targets.len());
    out.push(MARKER_TAG);
    out.extend_from_slice(&marker.modification_id().as_raw().to_be_bytes());
    out.extend_from_slice(&marker.timestamp().to_be_bytes());
    out.extend_from_slice(&(targets.len() as u32).to_be_bytes());
    for attempt in targets {
        out.extend_from_slice(&attempt.as_raw().to_be_bytes());
    }
    out
}

pub fn decode_marker(bytes: &[u8]) -> TaskResult<ModificationMarker> {
    if bytes.len() < MARKER_HEADER_SIZE {
        return Err(TaskError::Truncated {
            needed: MARKER_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    if bytes[0] != MARKER_TAG {
        return Err(TaskError::UnknownTag(bytes[0]));
    }
    let modification_id = ModificationId::from_raw(read_u64(&bytes[1..9]));
    let timestamp = read_u64(&bytes[9..17]);
    let count = u32::from_be_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]) as usize;

    let needed = MARKER_HEADER_SIZE + 8 * count;
    if bytes.len() < needed {
        return Err(TaskError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    let targets = bytes[MARKER_HEADER_SIZE..needed]
        .chunks_exact(8)
        .map(|chunk| ExecutionAttemptId::from_raw(read_u64(chunk)));
    Ok(ModificationMarker::new(modification_id, timestamp, targets))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
