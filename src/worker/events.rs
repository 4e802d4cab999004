//! Typed events translated from the automation tool's line output.
//!
//! The tool prints human-oriented text. [`EventParser`] maps it into
//! [`ExecutionEvent`] once, at the adapter boundary, so the ingestion
//! pipeline and the controller only ever match on the enum.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PLAY_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PLAY \[(?P<name>.*)\]\s*\**\s*$").expect("valid regex"));
static RECAP_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PLAY RECAP\s*\**\s*$").expect("valid regex"));
static TASK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:TASK|RUNNING HANDLER) \[(?P<name>.*)\]\s*\**\s*$").expect("valid regex")
});
static HOST_RESULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<outcome>ok|changed|failed|fatal): \[(?P<host>[^\]]+)\](?P<rest>.*)$")
        .expect("valid regex")
});
static RECAP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<host>\S+)\s*:\s*ok=(?P<ok>\d+)\s+changed=(?P<changed>\d+)\s+unreachable=(?P<unreachable>\d+)\s+failed=(?P<failed>\d+)(?:\s+skipped=(?P<skipped>\d+))?(?:\s+rescued=(?P<rescued>\d+))?(?:\s+ignored=(?P<ignored>\d+))?",
    )
    .expect("valid regex")
});
static TOOL_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ERROR!\s*(?P<message>.*)$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOutcome {
    Ok,
    Changed,
    Unreachable,
    Failed,
}

impl std::fmt::Display for HostOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostOutcome::Ok => write!(f, "ok"),
            HostOutcome::Changed => write!(f, "changed"),
            HostOutcome::Unreachable => write!(f, "unreachable"),
            HostOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Per-host totals from the final recap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub host: String,
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
    pub skipped: u32,
    pub rescued: u32,
    pub ignored: u32,
}

impl std::fmt::Display for HostStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} : ok={} changed={} unreachable={} failed={} skipped={} rescued={} ignored={}",
            self.host,
            self.ok,
            self.changed,
            self.unreachable,
            self.failed,
            self.skipped,
            self.rescued,
            self.ignored
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    PlayStart {
        name: String,
    },
    TaskStart {
        name: String,
    },
    HostResult {
        host: String,
        outcome: HostOutcome,
        detail: Option<String>,
    },
    Recap {
        hosts: Vec<HostStats>,
    },
    /// Run-level failure reported by the tool or synthesized by the adapter.
    Fatal {
        host: Option<String>,
        message: String,
    },
    /// Any other line of tool output (warnings, skipped hosts, stderr).
    Output {
        line: String,
    },
}

impl ExecutionEvent {
    pub fn fatal(message: impl Into<String>) -> Self {
        ExecutionEvent::Fatal {
            host: None,
            message: message.into(),
        }
    }

    /// Failed plus unreachable hosts, for a recap.
    pub fn recap_failures(hosts: &[HostStats]) -> (u32, u32) {
        hosts
            .iter()
            .fold((0, 0), |(f, u), h| (f + h.failed, u + h.unreachable))
    }
}

impl std::fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionEvent::PlayStart { name } => write!(f, "PLAY [{}]", name),
            ExecutionEvent::TaskStart { name } => write!(f, "TASK [{}]", name),
            ExecutionEvent::HostResult {
                host,
                outcome,
                detail,
            } => match detail {
                Some(detail) => write!(f, "{}: [{}] {}", outcome, host, detail),
                None => write!(f, "{}: [{}]", outcome, host),
            },
            ExecutionEvent::Recap { hosts } => {
                write!(f, "PLAY RECAP")?;
                for (i, stats) in hosts.iter().enumerate() {
                    let sep = if i == 0 { " " } else { "; " };
                    write!(f, "{}{}", sep, stats)?;
                }
                Ok(())
            }
            ExecutionEvent::Fatal {
                host: Some(host),
                message,
            } => write!(f, "fatal: [{}]: {}", host, message),
            ExecutionEvent::Fatal {
                host: None,
                message,
            } => write!(f, "FATAL: {}", message),
            ExecutionEvent::Output { line } => write!(f, "{}", line),
        }
    }
}

/// Incremental parser for the tool's default stdout format.
///
/// Recap lines are buffered and emitted as a single [`ExecutionEvent::Recap`]
/// when the recap block ends or on [`EventParser::finish`].
#[derive(Debug, Default)]
pub struct EventParser {
    in_recap: bool,
    recap: Vec<HostStats>,
    saw_recap: bool,
    saw_fatal: bool,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, raw: &str) -> Vec<ExecutionEvent> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let mut events = Vec::new();

        if self.in_recap {
            if let Some(stats) = parse_recap_line(line) {
                self.recap.push(stats);
                return events;
            }
            if line.trim().is_empty() {
                return events;
            }
            events.extend(self.flush_recap());
        }

        if line.trim().is_empty() {
            return events;
        }
        if let Some(event) = self.parse_line(line) {
            events.push(event);
        }
        events
    }

    /// Flush anything still buffered at end of output.
    pub fn finish(&mut self) -> Option<ExecutionEvent> {
        self.flush_recap()
    }

    pub fn saw_recap(&self) -> bool {
        self.saw_recap
    }

    pub fn saw_fatal(&self) -> bool {
        self.saw_fatal
    }

    fn flush_recap(&mut self) -> Option<ExecutionEvent> {
        if !self.in_recap {
            return None;
        }
        self.in_recap = false;
        self.saw_recap = true;
        Some(ExecutionEvent::Recap {
            hosts: std::mem::take(&mut self.recap),
        })
    }

    fn parse_line(&mut self, line: &str) -> Option<ExecutionEvent> {
        if RECAP_HEADER.is_match(line) {
            self.in_recap = true;
            return None;
        }
        if let Some(caps) = PLAY_HEADER.captures(line) {
            return Some(ExecutionEvent::PlayStart {
                name: caps["name"].to_string(),
            });
        }
        if let Some(caps) = TASK_HEADER.captures(line) {
            return Some(ExecutionEvent::TaskStart {
                name: caps["name"].to_string(),
            });
        }
        if let Some(caps) = HOST_RESULT.captures(line) {
            let rest = caps["rest"].trim();
            let outcome = match &caps["outcome"] {
                "ok" => HostOutcome::Ok,
                "changed" => HostOutcome::Changed,
                _ if rest.starts_with(": UNREACHABLE!") => HostOutcome::Unreachable,
                _ => HostOutcome::Failed,
            };
            let detail = rest.trim_start_matches(':').trim();
            return Some(ExecutionEvent::HostResult {
                host: caps["host"].to_string(),
                outcome,
                detail: (!detail.is_empty()).then(|| detail.to_string()),
            });
        }
        if let Some(caps) = TOOL_ERROR.captures(line) {
            self.saw_fatal = true;
            return Some(ExecutionEvent::fatal(caps["message"].trim()));
        }
        Some(ExecutionEvent::Output {
            line: line.to_string(),
        })
    }
}

fn parse_recap_line(line: &str) -> Option<HostStats> {
    let caps = RECAP_LINE.captures(line.trim())?;
    let num = |name: &str| {
        caps.name(name)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    Some(HostStats {
        host: caps["host"].to_string(),
        ok: num("ok"),
        changed: num("changed"),
        unreachable: num("unreachable"),
        failed: num("failed"),
        skipped: num("skipped"),
        rescued: num("rescued"),
        ignored: num("ignored"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(output: &str) -> Vec<ExecutionEvent> {
        let mut parser = EventParser::new();
        let mut events: Vec<ExecutionEvent> = output.lines().flat_map(|l| parser.feed(l)).collect();
        events.extend(parser.finish());
        events
    }

    #[test]
    fn parses_a_successful_run() {
        let output = "\
PLAY [Configure web servers] ***************************************************

TASK [Gathering Facts] *********************************************************
ok: [web1]

TASK [Install nginx] ***********************************************************
changed: [web1]

PLAY RECAP *********************************************************************
web1                       : ok=2    changed=1    unreachable=0    failed=0    skipped=0    rescued=0    ignored=0
";
        let events = parse_all(output);
        assert_eq!(events.len(), 6);
        assert_eq!(
            events[0],
            ExecutionEvent::PlayStart {
                name: "Configure web servers".into()
            }
        );
        assert_eq!(
            events[4],
            ExecutionEvent::HostResult {
                host: "web1".into(),
                outcome: HostOutcome::Changed,
                detail: None
            }
        );
        match &events[5] {
            ExecutionEvent::Recap { hosts } => {
                assert_eq!(hosts.len(), 1);
                assert_eq!(hosts[0].ok, 2);
                assert_eq!(hosts[0].changed, 1);
                assert_eq!(ExecutionEvent::recap_failures(hosts), (0, 0));
            }
            other => panic!("expected recap, got {:?}", other),
        }
    }

    #[test]
    fn classifies_failed_and_unreachable_hosts() {
        let events = parse_all(
            "fatal: [web1]: FAILED! => {\"msg\": \"boom\"}\n\
             fatal: [db1]: UNREACHABLE! => {\"msg\": \"ssh timeout\"}\n\
             failed: [web1] (item=nginx) => {\"rc\": 1}",
        );
        let outcomes: Vec<HostOutcome> = events
            .iter()
            .map(|e| match e {
                ExecutionEvent::HostResult { outcome, .. } => *outcome,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![
                HostOutcome::Failed,
                HostOutcome::Unreachable,
                HostOutcome::Failed
            ]
        );
    }

    #[test]
    fn tool_errors_become_fatal_events() {
        let mut parser = EventParser::new();
        let events = parser.feed("ERROR! the playbook: missing.yml could not be found");
        assert_eq!(
            events,
            vec![ExecutionEvent::fatal(
                "the playbook: missing.yml could not be found"
            )]
        );
        assert!(parser.saw_fatal());
        assert!(!parser.saw_recap());
    }

    #[test]
    fn recap_block_ends_on_unrelated_line() {
        let mut parser = EventParser::new();
        assert!(parser.feed("PLAY RECAP ****").is_empty());
        assert!(parser
            .feed("a : ok=1 changed=0 unreachable=0 failed=1")
            .is_empty());
        let events = parser.feed("[WARNING]: something odd");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ExecutionEvent::Recap { hosts } if hosts[0].failed == 1));
        assert!(matches!(&events[1], ExecutionEvent::Output { .. }));
        assert!(parser.finish().is_none());
        assert!(parser.saw_recap());
    }

    #[test]
    fn other_lines_are_passed_through() {
        let events = parse_all("skipping: [web1]\n...ignoring");
        assert_eq!(
            events,
            vec![
                ExecutionEvent::Output {
                    line: "skipping: [web1]".into()
                },
                ExecutionEvent::Output {
                    line: "...ignoring".into()
                },
            ]
        );
    }

    #[test]
    fn display_renders_log_lines() {
        let fatal = ExecutionEvent::Fatal {
            host: Some("web1".into()),
            message: "connection refused".into(),
        };
        assert_eq!(fatal.to_string(), "fatal: [web1]: connection refused");
        assert_eq!(
            ExecutionEvent::fatal("timed out").to_string(),
            "FATAL: timed out"
        );
    }
}
