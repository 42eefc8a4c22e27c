use std::time::Duration;

use snafu::{ensure, OptionExt, Snafu};

pub const ACTION_ENABLED: &str = "enabled";
pub const ACTION_CADENCE_HOURS: &str = "cadence_hours";
pub const ACTION_TEMPLATE: &str = "template";
pub const ACTION_PRINT_NOW: &str = "print_now";
pub const ACTION_POLL_NOW: &str = "poll_now";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetEnabled(bool),
    SetCadence(Duration),
    SetTemplate(String),
    PrintNow,
    PollNow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub printer_id: String,
    pub command: Command,
}

/// Parses `<root>/<printer_id>/set/<action>` and its payload.
pub fn parse_command(root: &str, topic: &str, payload: &[u8]) -> Result<InboundCommand, CommandError> {
    let rest = topic
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .context(UnknownTopicSnafu { topic })?;
    let mut parts = rest.split('/');
    let (Some(printer_id), Some("set"), Some(action), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        return UnknownTopicSnafu { topic }.fail();
    };
    ensure!(!printer_id.is_empty(), UnknownTopicSnafu { topic });

    let text = String::from_utf8_lossy(payload).trim().to_owned();
    let invalid = || InvalidPayloadSnafu { action, payload: text.clone() };

    let command = match action {
        ACTION_ENABLED => match text.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "enable" | "enabled" => Command::SetEnabled(true),
            "off" | "false" | "0" | "disable" | "disabled" => Command::SetEnabled(false),
            _ => return invalid().fail(),
        },
        ACTION_CADENCE_HOURS => {
            let hours: f64 = text.parse().ok().context(invalid())?;
            ensure!(hours.is_finite() && hours > 0.0, invalid());
            Command::SetCadence(Duration::from_secs((hours.round().max(1.0) as u64).saturating_mul(3600)))
        },
        ACTION_TEMPLATE => {
            ensure!(!text.is_empty(), invalid());
            Command::SetTemplate(text.to_ascii_lowercase())
        },
        ACTION_PRINT_NOW => Command::PrintNow,
        ACTION_POLL_NOW => Command::PollNow,
        _ => return UnknownActionSnafu { action }.fail(),
    };

    Ok(InboundCommand { printer_id: printer_id.to_owned(), command })
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum CommandError {
    #[snafu(display("Topic '{topic}' is not a command topic"))]
    UnknownTopic { topic: String },

    #[snafu(display("Unknown command '{action}'"))]
    UnknownAction { action: String },

    #[snafu(display("Invalid payload '{payload}' for '{action}'"))]
    InvalidPayload { action: String, payload: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "printer_keepalive";

    #[test]
    fn parses_switch_payloads() {
        let on = parse_command(ROOT, "printer_keepalive/office/set/enabled", b"ON").unwrap();
        assert_eq!(on, InboundCommand { printer_id: "office".to_owned(), command: Command::SetEnabled(true) });

        let off = parse_command(ROOT, "printer_keepalive/office/set/enabled", b" false\n").unwrap();
        assert_eq!(off.command, Command::SetEnabled(false));
    }

    #[test]
    fn parses_cadence_hours() {
        let command = parse_command(ROOT, "printer_keepalive/lab/set/cadence_hours", b"72.0").unwrap();
        assert_eq!(command.command, Command::SetCadence(Duration::from_secs(72 * 3600)));

        assert!(matches!(parse_command(ROOT, "printer_keepalive/lab/set/cadence_hours", b"-3"), Err(CommandError::InvalidPayload { .. })));
        assert!(matches!(parse_command(ROOT, "printer_keepalive/lab/set/cadence_hours", b"soon"), Err(CommandError::InvalidPayload { .. })));
    }

    #[test]
    fn buttons_ignore_payload() {
        assert_eq!(parse_command(ROOT, "printer_keepalive/lab/set/print_now", b"PRESS").unwrap().command, Command::PrintNow);
        assert_eq!(parse_command(ROOT, "printer_keepalive/lab/set/poll_now", b"").unwrap().command, Command::PollNow);
    }

    #[test]
    fn rejects_foreign_topics() {
        assert!(matches!(parse_command(ROOT, "other/office/set/enabled", b"ON"), Err(CommandError::UnknownTopic { .. })));
        assert!(matches!(parse_command(ROOT, "printer_keepalive/office/state", b"{}"), Err(CommandError::UnknownTopic { .. })));
        assert!(matches!(parse_command(ROOT, "printer_keepalive/office/set/explode", b"1"), Err(CommandError::UnknownAction { .. })));
    }
}
