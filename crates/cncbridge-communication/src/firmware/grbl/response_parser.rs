//! GRBL Response Parser
//!
//! Parses GRBL protocol responses including status reports, error and
//! alarm messages, parser-state reports, settings, and the startup
//! banners that identify the firmware. Smoothieware output is close
//! enough to GRBL's that the same parser covers both; its `version`
//! reply is the one Smoothie-specific shape.

use super::error_decoder;
use cncbridge_core::{MachinePosition, PlannerBuffer};

/// GRBL response types
#[derive(Debug, Clone, PartialEq)]
pub enum GrblResponse {
    /// OK acknowledgment
    Ok,
    /// Error response; the message is decoded for numeric codes
    Error {
        /// Numeric code for `error:<n>` replies
        code: Option<u8>,
        /// Human-readable message
        message: String,
    },
    /// Alarm condition
    Alarm {
        /// Numeric code for `ALARM:<n>` replies
        code: Option<u8>,
        /// Human-readable message
        message: String,
    },
    /// Status report (`<...>`)
    Status(StatusReport),
    /// Modal parser state (`[GC:...]`)
    ParserState {
        /// The modal state string
        modal: String,
    },
    /// Work coordinate / probe parameters (`[G54:...]`, `[PRB:...]`, ...)
    Parameters,
    /// Other bracketed feedback (`[MSG:...]`, build info, help)
    Feedback,
    /// Setting response (`$n=value`)
    Setting {
        /// Setting number
        number: u16,
        /// Setting value as string
        value: String,
    },
    /// GRBL startup banner (`Grbl 1.1f ['$' for help]`)
    Startup {
        /// The full banner
        version: String,
    },
    /// Smoothieware version reply (fingerprint for the `version` probe)
    SmoothieVersion,
    /// Anything unrecognized, forwarded for diagnostics
    Message,
}

/// GRBL status report decoded from a `<...>` line
///
/// Handles both the legacy (0.9, comma-separated) and the 1.1
/// (pipe-separated) report formats.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusReport {
    /// Machine state (`Idle`, `Run`, `Hold`, ...)
    pub state: String,
    /// Machine position
    pub machine_pos: Option<MachinePosition>,
    /// Work position
    pub work_pos: Option<MachinePosition>,
    /// Work coordinate offset
    pub work_coord_offset: Option<MachinePosition>,
    /// Feed rate
    pub feed_rate: Option<f64>,
    /// Spindle speed
    pub spindle_speed: Option<f64>,
    /// Buffer occupancy (`Bf:plan,rx`)
    pub buffer: Option<PlannerBuffer>,
}

/// GRBL response parser
#[derive(Debug, Default)]
pub struct GrblResponseParser;

impl GrblResponseParser {
    /// Create a new GRBL response parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a GRBL response line
    pub fn parse(&self, line: &str) -> Option<GrblResponse> {
        let line = line.trim();

        if line.is_empty() {
            return None;
        }

        if line == "ok" {
            return Some(GrblResponse::Ok);
        }

        if let Some(rest) = line.strip_prefix("error:") {
            return Some(match rest.trim().parse::<u8>() {
                Ok(code) => GrblResponse::Error {
                    code: Some(code),
                    message: error_decoder::decode_error(code),
                },
                // Smoothieware reports errors as text
                Err(_) => GrblResponse::Error {
                    code: None,
                    message: rest.trim().to_string(),
                },
            });
        }

        if let Some(rest) = line.strip_prefix("ALARM:") {
            return Some(match rest.trim().parse::<u8>() {
                Ok(code) => GrblResponse::Alarm {
                    code: Some(code),
                    message: error_decoder::decode_alarm(code),
                },
                Err(_) => GrblResponse::Alarm {
                    code: None,
                    message: rest.trim().to_string(),
                },
            });
        }

        if line.starts_with('<') && line.ends_with('>') {
            return Some(GrblResponse::Status(
                self.parse_status_report(&line[1..line.len() - 1]),
            ));
        }

        if let Some(inner) = line.strip_prefix("[GC:").and_then(|s| s.strip_suffix(']')) {
            return Some(GrblResponse::ParserState {
                modal: inner.to_string(),
            });
        }

        if line.starts_with('[') && line.ends_with(']') {
            let inner = &line[1..line.len() - 1];
            const PARAMETER_PREFIXES: [&str; 10] = [
                "G54:", "G55:", "G56:", "G57:", "G58:", "G59:", "G28:", "G30:", "G92:", "TLO:",
            ];
            if PARAMETER_PREFIXES.iter().any(|p| inner.starts_with(p)) || inner.starts_with("PRB:")
            {
                return Some(GrblResponse::Parameters);
            }
            return Some(GrblResponse::Feedback);
        }

        if line.starts_with("Grbl ") {
            return Some(GrblResponse::Startup {
                version: line.to_string(),
            });
        }

        if line.contains("Smoothie") || line.starts_with("Build version:") {
            return Some(GrblResponse::SmoothieVersion);
        }

        if line.starts_with('$') && line.contains('=') {
            if let Some(setting) = self.parse_setting(line) {
                return Some(setting);
            }
        }

        Some(GrblResponse::Message)
    }

    /// Parse the body of a status report
    fn parse_status_report(&self, body: &str) -> StatusReport {
        if body.contains('|') {
            self.parse_status_v11(body)
        } else {
            self.parse_status_legacy(body)
        }
    }

    /// GRBL 1.1 format: `Idle|MPos:0.000,0.000,0.000|FS:0,0`
    fn parse_status_v11(&self, body: &str) -> StatusReport {
        let mut parts = body.split('|');
        let mut report = StatusReport {
            state: parts.next().unwrap_or("").trim().to_string(),
            ..Default::default()
        };

        for part in parts {
            let part = part.trim();
            if let Some(pos) = part.strip_prefix("MPos:") {
                report.machine_pos = parse_position(pos);
            } else if let Some(pos) = part.strip_prefix("WPos:") {
                report.work_pos = parse_position(pos);
            } else if let Some(pos) = part.strip_prefix("WCO:") {
                report.work_coord_offset = parse_position(pos);
            } else if let Some(buf) = part.strip_prefix("Bf:") {
                report.buffer = parse_buffer(buf);
            } else if let Some(fs) = part.strip_prefix("FS:") {
                let mut values = fs.split(',');
                report.feed_rate = values.next().and_then(|v| v.trim().parse().ok());
                report.spindle_speed = values.next().and_then(|v| v.trim().parse().ok());
            } else if let Some(f) = part.strip_prefix("F:") {
                report.feed_rate = f.trim().parse().ok();
            }
        }

        report
    }

    /// GRBL 0.9 format: `Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000`
    fn parse_status_legacy(&self, body: &str) -> StatusReport {
        let tokens: Vec<&str> = body.split(',').collect();
        let mut report = StatusReport {
            state: tokens.first().unwrap_or(&"").trim().to_string(),
            ..Default::default()
        };

        let mut i = 1;
        while i < tokens.len() {
            let token = tokens[i].trim();
            if let Some(x) = token.strip_prefix("MPos:") {
                report.machine_pos = parse_triplet(x, tokens.get(i + 1), tokens.get(i + 2));
                i += 3;
            } else if let Some(x) = token.strip_prefix("WPos:") {
                report.work_pos = parse_triplet(x, tokens.get(i + 1), tokens.get(i + 2));
                i += 3;
            } else {
                i += 1;
            }
        }

        report
    }

    /// Parse a setting response (`$n=value`)
    fn parse_setting(&self, line: &str) -> Option<GrblResponse> {
        let (number, value) = line[1..].split_once('=')?;
        let number = number.trim().parse::<u16>().ok()?;
        Some(GrblResponse::Setting {
            number,
            value: value.trim().to_string(),
        })
    }
}

/// Parse `x,y,z` into a position
fn parse_position(s: &str) -> Option<MachinePosition> {
    let coords: Vec<f64> = s
        .split(',')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect();
    if coords.len() < 3 {
        return None;
    }
    Some(MachinePosition::new(coords[0], coords[1], coords[2]))
}

/// Parse three consecutive legacy-format tokens into a position
fn parse_triplet(x: &str, y: Option<&&str>, z: Option<&&str>) -> Option<MachinePosition> {
    Some(MachinePosition::new(
        x.trim().parse().ok()?,
        y?.trim().parse().ok()?,
        z?.trim().parse().ok()?,
    ))
}

/// Parse `plan,rx` buffer occupancy
fn parse_buffer(s: &str) -> Option<PlannerBuffer> {
    let (plan, rx) = s.split_once(',')?;
    Some(PlannerBuffer {
        plan: plan.trim().parse().ok()?,
        rx: rx.trim().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> GrblResponse {
        GrblResponseParser::new().parse(line).unwrap()
    }

    #[test]
    fn test_parse_ok() {
        assert_eq!(parse("ok"), GrblResponse::Ok);
        assert_eq!(parse("  ok  "), GrblResponse::Ok);
    }

    #[test]
    fn test_parse_numeric_error() {
        match parse("error:20") {
            GrblResponse::Error { code, message } => {
                assert_eq!(code, Some(20));
                assert!(message.contains("Unsupported or invalid g-code"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_text_error() {
        match parse("error:Alarm lock") {
            GrblResponse::Error { code, message } => {
                assert_eq!(code, None);
                assert_eq!(message, "Alarm lock");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_alarm() {
        match parse("ALARM:1") {
            GrblResponse::Alarm { code, message } => {
                assert_eq!(code, Some(1));
                assert!(message.contains("Hard limit"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_v11() {
        match parse("<Idle|MPos:1.000,2.000,3.000|FS:500,8000|Bf:15,128>") {
            GrblResponse::Status(report) => {
                assert_eq!(report.state, "Idle");
                assert_eq!(report.machine_pos, Some(MachinePosition::new(1.0, 2.0, 3.0)));
                assert_eq!(report.feed_rate, Some(500.0));
                assert_eq!(report.spindle_speed, Some(8000.0));
                assert_eq!(report.buffer, Some(PlannerBuffer { plan: 15, rx: 128 }));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_legacy() {
        match parse("<Run,MPos:1.000,2.000,3.000,WPos:4.000,5.000,6.000>") {
            GrblResponse::Status(report) => {
                assert_eq!(report.state, "Run");
                assert_eq!(report.machine_pos, Some(MachinePosition::new(1.0, 2.0, 3.0)));
                assert_eq!(report.work_pos, Some(MachinePosition::new(4.0, 5.0, 6.0)));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_parser_state() {
        match parse("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]") {
            GrblResponse::ParserState { modal } => {
                assert!(modal.starts_with("G0 G54"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_parameters_and_feedback() {
        assert_eq!(parse("[G54:0.000,0.000,0.000]"), GrblResponse::Parameters);
        assert_eq!(parse("[PRB:0.000,0.000,0.000:0]"), GrblResponse::Parameters);
        assert_eq!(parse("[MSG:Caution: Unlocked]"), GrblResponse::Feedback);
        assert_eq!(parse("['$H'|'$X' to unlock]"), GrblResponse::Feedback);
    }

    #[test]
    fn test_parse_startup_and_version() {
        match parse("Grbl 1.1f ['$' for help]") {
            GrblResponse::Startup { version } => assert!(version.starts_with("Grbl 1.1f")),
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(
            parse("Build version: edge-94de12c, Build date: ..."),
            GrblResponse::SmoothieVersion
        );
    }

    #[test]
    fn test_parse_setting() {
        assert_eq!(
            parse("$110=5000.000"),
            GrblResponse::Setting {
                number: 110,
                value: "5000.000".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_falls_through_to_message() {
        assert_eq!(parse("something else"), GrblResponse::Message);
    }
}
