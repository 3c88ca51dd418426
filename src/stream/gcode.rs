//! In-band commands carried by `notify_gcode_response`
//!
//! Macros on the printer talk to the agent by echoing lines such as
//! `tgnotify Nozzle changed` or `timelapse photo` to the console.

use serde_json::Value;
use std::path::PathBuf;
use tracing::warn;

use crate::notify::FileKind;
use crate::timelapse::TimelapseTrigger;

#[derive(Debug, Clone, PartialEq)]
pub enum GcodeCommand {
    Notify(String),
    NotifyPhoto(String),
    Alarm(String),
    AlarmPhoto(String),
    StatusLine(String),
    /// Whole console line, parsed by the timelapse coordinator
    TimelapseParams(String),
    /// Whole console line, parsed by the notifier
    NotifyParams(String),
    Keyboard { title: String, rows: Vec<Vec<String>> },
    SendFiles { kind: FileKind, paths: Vec<PathBuf>, message: String },
    Timelapse(TimelapseTrigger),
}

const TEXT_COMMANDS: &[(&str, fn(String) -> GcodeCommand)] = &[
    ("tgnotify ", GcodeCommand::Notify),
    ("tgnotify_photo ", GcodeCommand::NotifyPhoto),
    ("tgalarm ", GcodeCommand::Alarm),
    ("tgalarm_photo ", GcodeCommand::AlarmPhoto),
    ("tgnotify_status ", GcodeCommand::StatusLine),
];

const FILE_COMMANDS: &[(&str, FileKind)] = &[
    ("tg_send_image", FileKind::Image),
    ("tg_send_video", FileKind::Video),
    ("tg_send_document", FileKind::Document),
];

/// Decode a gcode response.
///
/// Timelapse triggers may appear on any line and must match it exactly;
/// every other command is recognised by the prefix of the first line.
/// Malformed commands are logged and dropped.
pub fn parse_response(lines: &[Value]) -> Vec<GcodeCommand> {
    let lines: Vec<&str> = lines.iter().filter_map(Value::as_str).collect();
    let mut commands: Vec<GcodeCommand> = lines
        .iter()
        .filter_map(|line| TimelapseTrigger::parse(line))
        .map(GcodeCommand::Timelapse)
        .collect();

    let Some(first) = lines.first() else {
        return commands;
    };

    if let Some(command) = parse_first_line(first) {
        commands.push(command);
    }
    commands
}

fn parse_first_line(line: &str) -> Option<GcodeCommand> {
    for (prefix, build) in TEXT_COMMANDS {
        if let Some(text) = line.strip_prefix(prefix) {
            return Some(build(text.to_string()));
        }
    }

    if line.starts_with("set_timelapse_params ") {
        return Some(GcodeCommand::TimelapseParams(line.to_string()));
    }
    if line.starts_with("set_notify_params ") {
        return Some(GcodeCommand::NotifyParams(line.to_string()));
    }
    if let Some(args) = line.strip_prefix("tgcustom_keyboard ") {
        return match parse_keyboard(args) {
            Some((title, rows)) => Some(GcodeCommand::Keyboard { title, rows }),
            None => {
                warn!("Malformed tgcustom_keyboard: {}", line);
                None
            }
        };
    }

    for (prefix, kind) in FILE_COMMANDS {
        if let Some(args) = line.strip_prefix(prefix) {
            let paths = parse_paths(args);
            if paths.is_empty() {
                warn!("{} without a path: {}", prefix, line);
                return None;
            }
            return Some(GcodeCommand::SendFiles {
                kind: *kind,
                paths,
                message: quoted_arg(args, "message").unwrap_or_default().to_string(),
            });
        }
    }
    None
}

/// Value of `key="..."` within `args`
fn quoted_arg<'a>(args: &'a str, key: &str) -> Option<&'a str> {
    let start = args.find(&format!("{}=\"", key))? + key.len() + 2;
    let len = args[start..].find('"')?;
    Some(&args[start..start + len])
}

/// Bracketed JSON-ish list following `key=`, single quotes allowed
fn bracketed_arg(args: &str, key: &str) -> Option<Value> {
    let start = args.find(&format!("{}=[", key))? + key.len() + 1;
    let mut depth = 0usize;
    for (offset, c) in args[start..].char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let raw = &args[start..=start + offset];
                    return serde_json::from_str(&raw.replace('\'', "\"")).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_keyboard(args: &str) -> Option<(String, Vec<Vec<String>>)> {
    let title = quoted_arg(args, "title").unwrap_or_default().to_string();
    let rows: Vec<Vec<String>> = serde_json::from_value(bracketed_arg(args, "keyboard")?).ok()?;
    if rows.is_empty() || rows.iter().any(Vec::is_empty) {
        return None;
    }
    Some((title, rows))
}

fn parse_paths(args: &str) -> Vec<PathBuf> {
    if let Some(list) = bracketed_arg(args, "path") {
        return serde_json::from_value::<Vec<String>>(list)
            .unwrap_or_default()
            .into_iter()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .collect();
    }
    quoted_arg(args, "path")
        .filter(|path| !path.is_empty())
        .map(|path| vec![PathBuf::from(path)])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(lines: &[&str]) -> Vec<GcodeCommand> {
        let values: Vec<Value> = lines.iter().map(|line| json!(line)).collect();
        parse_response(&values)
    }

    #[test]
    fn test_text_commands_by_prefix() {
        assert_eq!(
            parse(&["tgnotify Filament runout"]),
            vec![GcodeCommand::Notify("Filament runout".to_string())]
        );
        assert_eq!(
            parse(&["tgnotify_photo look"]),
            vec![GcodeCommand::NotifyPhoto("look".to_string())]
        );
        assert_eq!(
            parse(&["tgalarm_photo fire"]),
            vec![GcodeCommand::AlarmPhoto("fire".to_string())]
        );
        assert_eq!(
            parse(&["tgnotify_status Layer 3"]),
            vec![GcodeCommand::StatusLine("Layer 3".to_string())]
        );
        assert!(parse(&["// tgnotify not at start"]).is_empty());
        assert!(parse(&[]).is_empty());
    }

    #[test]
    fn test_params_keep_whole_line() {
        assert_eq!(
            parse(&["set_notify_params percent=10"]),
            vec![GcodeCommand::NotifyParams("set_notify_params percent=10".to_string())]
        );
    }

    #[test]
    fn test_timelapse_triggers_match_whole_lines() {
        assert_eq!(
            parse(&["ok", "timelapse photo_and_gcode"]),
            vec![GcodeCommand::Timelapse(TimelapseTrigger::PhotoAndGcode)]
        );
        assert!(parse(&["echo timelapse photo"]).is_empty());
    }

    #[test]
    fn test_keyboard() {
        let commands = parse(&[
            r#"tgcustom_keyboard title="Heat up" keyboard=[['PREHEAT_PLA', 'PREHEAT_PETG'], ['COOLDOWN']]"#,
        ]);
        assert_eq!(
            commands,
            vec![GcodeCommand::Keyboard {
                title: "Heat up".to_string(),
                rows: vec![
                    vec!["PREHEAT_PLA".to_string(), "PREHEAT_PETG".to_string()],
                    vec!["COOLDOWN".to_string()],
                ],
            }]
        );
        assert!(parse(&[r#"tgcustom_keyboard title="x" keyboard=[[]"#]).is_empty());
    }

    #[test]
    fn test_send_files() {
        let commands = parse(&[
            r#"tg_send_image path=['/tmp/a.png', '/tmp/b.png'] message="Bed mesh""#,
        ]);
        assert_eq!(
            commands,
            vec![GcodeCommand::SendFiles {
                kind: FileKind::Image,
                paths: vec![PathBuf::from("/tmp/a.png"), PathBuf::from("/tmp/b.png")],
                message: "Bed mesh".to_string(),
            }]
        );

        let commands = parse(&[r#"tg_send_document path="/tmp/klippy.log""#]);
        assert_eq!(
            commands,
            vec![GcodeCommand::SendFiles {
                kind: FileKind::Document,
                paths: vec![PathBuf::from("/tmp/klippy.log")],
                message: String::new(),
            }]
        );
        assert!(parse(&["tg_send_video"]).is_empty());
    }
}
