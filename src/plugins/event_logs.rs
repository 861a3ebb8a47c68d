//! Reader for Windows event logs (EVTX).
//!
//! Descriptions are built as `provider:event_id [tag] [sid] (args...)`,
//! where tags come from the embedded eventmap file and the event id keeps
//! only its low 16 bits (the status code, without facility and severity).

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use evtx::EvtxParser;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::runtime::{ArtifactReader, Event, PluginContext};

const EVENT_MAP: &str = include_str!("data/EventLogsToTimeline-eventmap.txt");

pub struct EventLogsToTimeline {
    event_tags: HashMap<String, HashMap<u32, String>>,
}

impl EventLogsToTimeline {
    pub fn new() -> Self {
        Self {
            event_tags: parse_event_tags(EVENT_MAP),
        }
    }

    fn build_description(
        &self,
        provider: &str,
        event_id: u32,
        user_id: &str,
        args: &[String],
    ) -> String {
        let mut description = format!("{provider}:{event_id}");
        if let Some(tag) = self
            .event_tags
            .get(provider)
            .and_then(|per_id| per_id.get(&event_id))
        {
            description.push(' ');
            description.push_str(tag);
        }
        description.push(' ');
        description.push_str(user_id);
        if !args.is_empty() {
            description.push_str(&format!(" ({})", args.join(" ")));
        }
        description
    }
}

impl ArtifactReader for EventLogsToTimeline {
    fn parse_artifact(&mut self, ctx: &mut PluginContext<'_>, artifact: &Path) -> Result<()> {
        let source = ctx.original_path(artifact);
        let mut parser = match EvtxParser::from_path(artifact) {
            Ok(parser) => parser,
            Err(e) => {
                error!(
                    "Error while opening the event log file {}: {}",
                    artifact.display(),
                    e
                );
                return Ok(());
            }
        };

        for record in parser.records_json_value() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    debug!(
                        "Error while parsing an event record in {}: {}",
                        artifact.display(),
                        e
                    );
                    continue;
                }
            };

            let Some(system) = record.data.pointer("/Event/System") else {
                continue;
            };
            let Some(event_id) = extract_event_id(system) else {
                continue;
            };
            let provider = system
                .pointer("/Provider/#attributes/Name")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            let user_id = system
                .pointer("/Security/#attributes/UserID")
                .and_then(Value::as_str)
                .unwrap_or("");
            let args = extract_args(record.data.pointer("/Event/EventData/Data"));

            let description = self.build_description(provider, event_id, user_id, &args);
            ctx.add_event(Event {
                timestamp: Some(record.timestamp),
                source: source.clone(),
                description,
                ..Default::default()
            })?;
        }
        Ok(())
    }
}

/// EventID is either a bare number or an object carrying `#text` next to
/// qualifier attributes. Only the low 16 bits are the status code.
fn extract_event_id(system: &Value) -> Option<u32> {
    let raw = match system.get("EventID") {
        Some(Value::Number(n)) => n.as_u64()?,
        Some(Value::Object(_)) => system.pointer("/EventID/#text")?.as_u64()?,
        Some(Value::String(s)) => s.parse().ok()?,
        _ => return None,
    };
    Some((raw & 0xFFFF) as u32)
}

/// Flatten EventData values into printable strings, newline-sanitized.
fn extract_args(data: Option<&Value>) -> Vec<String> {
    let mut args = Vec::new();
    match data {
        Some(Value::Array(items)) => {
            for item in items {
                args.push(render_arg(item));
            }
        }
        Some(value) => args.push(render_arg(value)),
        None => {}
    }
    args
}

fn render_arg(value: &Value) -> String {
    let rendered = match value {
        Value::Object(_) => value
            .pointer("/#text")
            .map(render_arg)
            .unwrap_or_default(),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    rendered
        .replace("\r\n", "\\r\\n")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn parse_event_tags(content: &str) -> HashMap<String, HashMap<u32, String>> {
    let mut tags: HashMap<String, HashMap<u32, String>> = HashMap::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((event, tag)) = line.split_once(':') else {
            warn!("Wrong format for a line in the event map: \"{line}\"");
            continue;
        };
        let Some((provider, event_id)) = event.split_once('/') else {
            warn!("Wrong format for a line in the event map: \"{line}\"");
            continue;
        };
        let Ok(event_id) = event_id.parse::<u32>() else {
            warn!("Wrong format for a line in the event map: \"{line}\"");
            continue;
        };
        tags.entry(provider.to_string())
            .or_default()
            .insert(event_id, tag.to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event_tags() {
        let tags = parse_event_tags(
            "# comment\n\
             Microsoft-Windows-Security-Auditing/4624:An account was successfully logged on\n\
             broken line without slash\n\
             Service Control Manager/7045:A service was installed in the system\n",
        );
        assert_eq!(
            tags["Microsoft-Windows-Security-Auditing"][&4624],
            "An account was successfully logged on"
        );
        assert_eq!(
            tags["Service Control Manager"][&7045],
            "A service was installed in the system"
        );
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn test_build_description_with_tag_and_args() {
        let reader = EventLogsToTimeline::new();
        let description = reader.build_description(
            "Microsoft-Windows-Security-Auditing",
            4624,
            "S-1-5-18",
            &["alice".to_string(), "WORKSTATION".to_string()],
        );
        assert_eq!(
            description,
            "Microsoft-Windows-Security-Auditing:4624 An account was successfully logged on \
             S-1-5-18 (alice WORKSTATION)"
        );
    }

    #[test]
    fn test_build_description_without_tag() {
        let reader = EventLogsToTimeline::new();
        let description = reader.build_description("CustomProvider", 1, "", &[]);
        assert_eq!(description, "CustomProvider:1 ");
    }

    #[test]
    fn test_extract_event_id_masks_high_bits() {
        let system = json!({"EventID": 0x8000_1102u64});
        assert_eq!(extract_event_id(&system), Some(0x1102));

        let system = json!({"EventID": {"#attributes": {"Qualifiers": 16384}, "#text": 4624}});
        assert_eq!(extract_event_id(&system), Some(4624));

        let system = json!({"NoEventID": 1});
        assert_eq!(extract_event_id(&system), None);
    }

    #[test]
    fn test_extract_args_sanitizes_newlines() {
        let data = json!([
        {"#attributes": {"Name": "TargetUserName"}, "#text": "alice"},
        "multi\r\nline",
        42,
        null
        ]);
        let args = extract_args(Some(&data));
        assert_eq!(
            args,
            vec![
                "alice".to_string(),
                "multi\\r\\nline".to_string(),
                "42".to_string(),
                String::new()
            ]
        );
    }
}
