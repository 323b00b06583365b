//! TinyG2 Response Parser
//!
//! Decodes the line-framed JSON the device emits: command receipts with
//! their footer, asynchronous status reports, queue reports, and the
//! identification replies from the init script.

use serde_json::Value;

/// Fields of a status report (`sr`), all optional because the device
/// only sends what changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusFields {
    /// Machine state code (`stat`)
    pub stat: Option<u8>,
    /// Line number being executed
    pub line: Option<u32>,
    /// X work position
    pub posx: Option<f64>,
    /// Y work position
    pub posy: Option<f64>,
    /// Z work position
    pub posz: Option<f64>,
    /// Current velocity
    pub vel: Option<f64>,
    /// Current feed rate
    pub feed: Option<f64>,
}

impl StatusFields {
    /// Extract the known fields from an `sr` object
    pub fn from_value(sr: &Value) -> Self {
        Self {
            stat: sr.get("stat").and_then(Value::as_u64).map(|v| v as u8),
            line: sr.get("line").and_then(Value::as_u64).map(|v| v as u32),
            posx: sr.get("posx").and_then(Value::as_f64),
            posy: sr.get("posy").and_then(Value::as_f64),
            posz: sr.get("posz").and_then(Value::as_f64),
            vel: sr.get("vel").and_then(Value::as_f64),
            feed: sr.get("feed").and_then(Value::as_f64),
        }
    }
}

/// TinyG2 response types
#[derive(Debug, Clone, PartialEq)]
pub enum TinyG2Response {
    /// Command receipt: `{"r":{...},"f":[rev,status,...]}`
    Receipt {
        /// Line number the receipt acknowledges, when present
        line: Option<u32>,
        /// Footer status code; non-zero is an error
        status: u8,
        /// The receipt body
        body: Value,
    },
    /// Asynchronous status report: `{"sr":{...}}`
    StatusReport(StatusFields),
    /// Queue report: `{"qr":n,"qi":n,"qo":n}`
    QueueReport {
        /// Available planner slots
        qr: u32,
        /// Blocks added since the last report
        qi: u32,
        /// Blocks removed since the last report
        qo: u32,
    },
    /// Firmware build reply
    FirmwareBuild {
        /// Build identifier
        version: String,
    },
    /// Hardware platform reply
    HardwarePlatform {
        /// Platform identifier
        platform: String,
    },
    /// Non-JSON output (startup text and anything unrecognized)
    Message,
}

/// TinyG2 response parser
#[derive(Debug, Default)]
pub struct TinyG2ResponseParser;

impl TinyG2ResponseParser {
    /// Create a new parser
    pub fn new() -> Self {
        Self
    }

    /// Parse one device line
    pub fn parse(&self, line: &str) -> Option<TinyG2Response> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
            return Some(TinyG2Response::Message);
        };
        let Some(object) = json.as_object() else {
            return Some(TinyG2Response::Message);
        };

        if let Some(r) = object.get("r") {
            let status = object
                .get("f")
                .and_then(Value::as_array)
                .and_then(|f| f.get(1))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u8;
            let line = r.get("n").and_then(Value::as_u64).map(|n| n as u32);
            return Some(TinyG2Response::Receipt {
                line,
                status,
                body: r.clone(),
            });
        }

        if let Some(sr) = object.get("sr") {
            return Some(TinyG2Response::StatusReport(StatusFields::from_value(sr)));
        }

        if let Some(qr) = object.get("qr").and_then(Value::as_u64) {
            return Some(TinyG2Response::QueueReport {
                qr: qr as u32,
                qi: object.get("qi").and_then(Value::as_u64).unwrap_or(0) as u32,
                qo: object.get("qo").and_then(Value::as_u64).unwrap_or(0) as u32,
            });
        }

        if let Some(fb) = object.get("fb") {
            return Some(TinyG2Response::FirmwareBuild {
                version: fb.to_string(),
            });
        }

        if let Some(hp) = object.get("hp") {
            return Some(TinyG2Response::HardwarePlatform {
                platform: hp.to_string(),
            });
        }

        Some(TinyG2Response::Message)
    }
}
