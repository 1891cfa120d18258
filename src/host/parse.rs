//! Parsing of `trace_pipe` text lines.
//!
//! A line looks like
//!
//! ```text
//!           <idle>-0     [002] d..2.  4567.123456: cpu_idle: state=1 cpu_id=2
//! ```
//!
//! Only the three power events are decoded; every other event yields
//! `Ok(None)`. The bracketed column is the core that wrote the line; the GPU
//! event, which has no core field of its own, is attributed to it.

use thiserror::Error;

use crate::power::event::{PowerEvent, ProbeKind};

/// Errors that can occur while parsing a trace line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("cpu {cpu} lost {count} events")]
    LostEvents { cpu: u32, count: u64 },

    #[error("malformed trace line: {reason}")]
    Malformed { reason: &'static str },

    #[error("{event}: missing field {field}")]
    MissingField {
        event: ProbeKind,
        field: &'static str,
    },

    #[error("{event}: invalid value {value:?} for field {field}")]
    InvalidField {
        event: ProbeKind,
        field: &'static str,
        value: String,
    },
}

/// Parse one `trace_pipe` line.
pub fn parse_line(line: &str) -> Result<Option<PowerEvent>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix("CPU:") {
        return Err(parse_lost_events(rest));
    }

    // The task name may contain spaces and brackets, so anchor on the
    // last "[NNN]" before the timestamp.
    let (cpu, rest) = split_cpu(line)?;

    let mut fields = rest.split_whitespace();
    let mut seen_timestamp = false;
    let mut event_name = None;

    for token in fields.by_ref() {
        let Some(head) = token.strip_suffix(':') else {
            continue;
        };
        if !seen_timestamp {
            parse_timestamp(head).ok_or(ParseError::Malformed {
                reason: "bad timestamp",
            })?;
            seen_timestamp = true;
        } else {
            event_name = Some(head);
            break;
        }
    }

    if !seen_timestamp {
        return Err(ParseError::Malformed {
            reason: "missing timestamp",
        });
    }
    let event_name = event_name.ok_or(ParseError::Malformed {
        reason: "missing event name",
    })?;

    let Some(kind) = ProbeKind::from_name(event_name) else {
        return Ok(None);
    };

    let args = fields;
    let event = match kind {
        ProbeKind::CpuFrequency => PowerEvent::CpuFrequency {
            frequency: field(kind, args.clone(), "state")?,
            cpu: field(kind, args, "cpu_id")?,
        },
        ProbeKind::GpuFrequency => PowerEvent::GpuFrequency {
            frequency: field(kind, args, "state")?,
            cpu,
        },
        ProbeKind::CpuIdle => PowerEvent::CpuIdle {
            state: field(kind, args.clone(), "state")?,
            cpu: field(kind, args, "cpu_id")?,
        },
    };

    Ok(Some(event))
}

fn split_cpu(line: &str) -> Result<(u32, &str), ParseError> {
    let mut search = line;
    while let Some(open) = search.find('[') {
        let after = &search[open + 1..];
        if let Some(close) = after.find(']') {
            let inner = &after[..close];
            if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
                let cpu = inner.parse::<u32>().map_err(|_| ParseError::Malformed {
                    reason: "bad cpu number",
                })?;
                return Ok((cpu, &after[close + 1..]));
            }
        }
        search = after;
    }

    Err(ParseError::Malformed {
        reason: "missing cpu field",
    })
}

/// Parse `SECS.FRACTION` into nanoseconds.
fn parse_timestamp(text: &str) -> Option<u64> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    let secs = secs.parse::<u64>().ok()?;

    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut nanos = 0u64;
    for i in 0..9 {
        let digit = frac.as_bytes().get(i).map_or(0, |b| u64::from(b - b'0'));
        nanos = nanos * 10 + digit;
    }

    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}

/// `CPU:N [LOST K EVENTS]`
fn parse_lost_events(rest: &str) -> ParseError {
    let mut parts = rest.split_whitespace();
    let cpu = parts.next().and_then(|v| v.parse::<u32>().ok());
    let lost = parts.next() == Some("[LOST");
    let count = parts.next().and_then(|v| v.parse::<u64>().ok());

    match (cpu, lost, count) {
        (Some(cpu), true, Some(count)) => ParseError::LostEvents { cpu, count },
        _ => ParseError::Malformed {
            reason: "bad lost events marker",
        },
    }
}

fn field<'a>(
    event: ProbeKind,
    mut args: impl Iterator<Item = &'a str>,
    name: &'static str,
) -> Result<u32, ParseError> {
    let raw = args
        .find_map(|arg| {
            let (key, value) = arg.split_once('=')?;
            (key == name).then_some(value)
        })
        .ok_or(ParseError::MissingField { event, field: name })?;

    raw.parse::<u32>().map_err(|_| ParseError::InvalidField {
        event,
        field: name,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::event::IDLE_EXIT;

    #[test]
    fn test_parse_cpu_idle() {
        let line = "          <idle>-0     [002] d..2.  4567.123456: cpu_idle: state=1 cpu_id=2";
        let parsed = parse_line(line).expect("parse ok").expect("power event");

        assert_eq!(parsed, PowerEvent::CpuIdle { state: 1, cpu: 2 });
    }

    #[test]
    fn test_parse_idle_exit() {
        let line = "<idle>-0 [000] d..1. 10.5: cpu_idle: state=4294967295 cpu_id=0";
        let parsed = parse_line(line).expect("parse ok").expect("power event");
        assert_eq!(
            parsed,
            PowerEvent::CpuIdle {
                state: IDLE_EXIT,
                cpu: 0
            }
        );
    }

    #[test]
    fn test_parse_cpu_frequency_on_other_core() {
        let line = "     kworker/0:1-123   [000] .....   88.000001: cpu_frequency: state=1800000 cpu_id=3";
        let parsed = parse_line(line).expect("parse ok").expect("power event");

        // cpu_id names the target core, not the one that wrote the line.
        assert_eq!(
            parsed,
            PowerEvent::CpuFrequency {
                frequency: 1_800_000,
                cpu: 3
            }
        );
    }

    #[test]
    fn test_parse_gpu_frequency_takes_writing_core() {
        let line = "mali-worker-77 [001] .... 1.000000: gpu_frequency: state=600000";
        let parsed = parse_line(line).expect("parse ok").expect("power event");
        assert_eq!(
            parsed,
            PowerEvent::GpuFrequency {
                frequency: 600_000,
                cpu: 1
            }
        );

        let line = "kworker/3:1-99 [003] .... 10.0: gpu_frequency: state=300000 gpu_id=0";
        let parsed = parse_line(line).expect("parse ok").expect("power event");
        assert_eq!(
            parsed,
            PowerEvent::GpuFrequency {
                frequency: 300_000,
                cpu: 3
            }
        );
    }

    #[test]
    fn test_task_name_with_brackets_and_no_flags() {
        let line = "weird [x] task-9 [001] 3.25: gpu_frequency: state=2";
        let parsed = parse_line(line).expect("parse ok").expect("power event");
        assert_eq!(
            parsed,
            PowerEvent::GpuFrequency {
                frequency: 2,
                cpu: 1
            }
        );
    }

    #[test]
    fn test_other_events_ignored() {
        let line = "bash-42 [003] d..3. 5.0: sched_switch: prev_comm=bash prev_pid=42";
        assert_eq!(parse_line(line), Ok(None));
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn test_lost_events() {
        assert_eq!(
            parse_line("CPU:3 [LOST 17 EVENTS]"),
            Err(ParseError::LostEvents { cpu: 3, count: 17 })
        );
        assert!(matches!(
            parse_line("CPU:x [LOST"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let missing = "a-1 [000] .... 1.0: cpu_frequency: state=100";
        assert_eq!(
            parse_line(missing),
            Err(ParseError::MissingField {
                event: ProbeKind::CpuFrequency,
                field: "cpu_id"
            })
        );

        let invalid = "a-1 [000] .... 1.0: cpu_idle: state=-1 cpu_id=0";
        assert_eq!(
            parse_line(invalid),
            Err(ParseError::InvalidField {
                event: ProbeKind::CpuIdle,
                field: "state",
                value: "-1".to_string()
            })
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_line("no cpu here 1.0: cpu_idle: state=1 cpu_id=0"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            parse_line("a-1 [000] ....  abc: cpu_idle: state=1 cpu_id=0"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            parse_line("a-1 [000] .... 1.5:"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("0.000001"), Some(1_000));
        assert_eq!(parse_timestamp("12"), Some(12_000_000_000));
        assert_eq!(parse_timestamp("1.123456789"), Some(1_123_456_789));
        assert_eq!(parse_timestamp("1.1234567891"), None);
        assert_eq!(parse_timestamp("1.x"), None);
    }
}
