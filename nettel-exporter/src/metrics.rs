//! The set of ntopng counters republished by the exporter.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors extracting a counter value from an interface data payload.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Field {pointer} not present in payload")]
    Missing { pointer: String },
    #[error("Field {pointer} is not a non-negative number: {value}")]
    NotACounter { pointer: String, value: Value },
}

/// A counter tracked per ntopng interface.
///
/// Each variant maps to one field of `rsp.zmqRecvStats` in the interface data
/// response and to one exposed counter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedMetric {
    ZmqMsgRcvd,
    DroppedFlows,
    ZmqMsgDrops,
    ZmqAvgMsgFlows,
}

impl TrackedMetric {
    /// All tracked metrics, in poll order.
    pub const ALL: [TrackedMetric; 4] = [
        TrackedMetric::ZmqMsgRcvd,
        TrackedMetric::DroppedFlows,
        TrackedMetric::ZmqMsgDrops,
        TrackedMetric::ZmqAvgMsgFlows,
    ];

    /// Field name under `rsp.zmqRecvStats`.
    pub fn key(&self) -> &'static str {
        match self {
            TrackedMetric::ZmqMsgRcvd => "zmq_msg_rcvd",
            TrackedMetric::DroppedFlows => "dropped_flows",
            TrackedMetric::ZmqMsgDrops => "zmq_msg_drops",
            TrackedMetric::ZmqAvgMsgFlows => "zmq_avg_msg_flows",
        }
    }

    /// JSON pointer of the field in the interface data response.
    pub fn json_pointer(&self) -> String {
        format!("/rsp/zmqRecvStats/{}", self.key())
    }

    /// Exposed series name, before the prefix and the `_total` suffix.
    pub fn series_name(&self) -> &'static str {
        match self {
            TrackedMetric::ZmqMsgRcvd => "zmq_rcvd_messages",
            TrackedMetric::DroppedFlows => "flow_drops",
            TrackedMetric::ZmqMsgDrops => "zmq_msg_drops",
            TrackedMetric::ZmqAvgMsgFlows => "zmq_avg_msg_perflows",
        }
    }

    /// HELP text for the exposed series.
    pub fn help(&self) -> &'static str {
        match self {
            TrackedMetric::ZmqMsgRcvd => "Count of ZMQ messages received by ntopng",
            TrackedMetric::DroppedFlows => "Count of flow records dropped by ntopng",
            TrackedMetric::ZmqMsgDrops => "Count of ZMQ messages dropped by ntopng",
            TrackedMetric::ZmqAvgMsgFlows => "Accumulated average of ZMQ messages per flow",
        }
    }
}

impl fmt::Display for TrackedMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Extract the absolute counter value for `metric` from an interface data body.
///
/// Fractional values are truncated. Negative, missing or non-numeric fields
/// are errors so that a malformed payload never looks like a counter reset.
pub fn extract_counter(body: &str, metric: TrackedMetric) -> Result<u64, ExtractError> {
    let payload: Value = serde_json::from_str(body)?;
    let pointer = metric.json_pointer();

    let value = payload
        .pointer(&pointer)
        .ok_or_else(|| ExtractError::Missing {
            pointer: pointer.clone(),
        })?;

    if let Some(n) = value.as_u64() {
        return Ok(n);
    }

    match value.as_f64() {
        Some(f) if f >= 0.0 && f.is_finite() => Ok(f.trunc() as u64),
        _ => Err(ExtractError::NotACounter {
            pointer,
            value: value.clone(),
        }),
    }
}
