use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Commands an observer can send over its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    UpdateSources,
    /// Stage a full system upgrade
    Prepare,
    /// Stage only the portal's own package closure
    PrepareWebPortal,
    /// Run the staged upgrade
    Start,
    Size,
    LegacyUpdaterBackend,
    DefaultUpdaterBackend,
    State,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::UpdateSources => "update_sources",
            Command::Prepare => "prepare",
            Command::PrepareWebPortal => "prepare_web_portal",
            Command::Start => "start",
            Command::Size => "size",
            Command::LegacyUpdaterBackend => "legacy-updater-backend",
            Command::DefaultUpdaterBackend => "default-updater-backend",
            Command::State => "state",
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "update_sources" => Ok(Command::UpdateSources),
            "prepare" => Ok(Command::Prepare),
            "prepare_web_portal" => Ok(Command::PrepareWebPortal),
            "start" => Ok(Command::Start),
            "size" => Ok(Command::Size),
            "legacy-updater-backend" => Ok(Command::LegacyUpdaterBackend),
            "default-updater-backend" => Ok(Command::DefaultUpdaterBackend),
            "state" => Ok(Command::State),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound envelope `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    UpdateSources,
    OsPrepareUpgrade,
    OsUpgrade,
    Size,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Start,
    Status,
    Finish,
    Error,
}

/// A normalized progress report: one per native callback invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: Status,
    pub percent: f64,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(status: Status, percent: f64, message: impl Into<String>) -> Self {
        Self {
            status,
            percent: clamp_percent(percent),
            message: message.into(),
        }
    }
}

/// Sizes reported by the most recent staging run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSize {
    pub download_size: u64,
    /// Negative when the upgrade frees disk space
    pub required_space: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizePayload {
    pub size: UpgradeSize,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub busy: bool,
    pub clients: usize,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Size(SizePayload),
    State(StatePayload),
    Progress(ProgressEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Payload,
}

impl Envelope {
    pub fn progress(kind: MessageType, event: ProgressEvent) -> Self {
        Self {
            kind,
            payload: Payload::Progress(event),
        }
    }

    pub fn size(size: UpgradeSize) -> Self {
        Self {
            kind: MessageType::Size,
            payload: Payload::Size(SizePayload {
                size,
                status: Status::Status,
            }),
        }
    }

    pub fn state(busy: bool, clients: usize) -> Self {
        Self {
            kind: MessageType::State,
            payload: Payload::State(StatePayload {
                busy,
                clients,
                status: Status::Status,
            }),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The progress event carried by this envelope, if any
    pub fn progress_event(&self) -> Option<&ProgressEvent> {
        match &self.payload {
            Payload::Progress(event) => Some(event),
            _ => None,
        }
    }
}

fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case("update_sources", Command::UpdateSources)]
    #[case("prepare", Command::Prepare)]
    #[case("prepare_web_portal", Command::PrepareWebPortal)]
    #[case("start", Command::Start)]
    #[case("size", Command::Size)]
    #[case("legacy-updater-backend", Command::LegacyUpdaterBackend)]
    #[case("default-updater-backend", Command::DefaultUpdaterBackend)]
    #[case("state\n", Command::State)]
    fn parses_known_commands(#[case] text: &str, #[case] expected: Command) {
        assert_eq!(text.parse::<Command>().unwrap(), expected);
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert_matches!(
            "reboot".parse::<Command>(),
            Err(ProtocolError::UnknownCommand(cmd)) if cmd == "reboot"
        );
    }

    #[test]
    fn progress_envelope_shape() {
        let envelope = Envelope::progress(
            MessageType::OsUpgrade,
            ProgressEvent::new(Status::Status, 42.5, "Unpacking"),
        );
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "OS_UPGRADE");
        assert_eq!(json["payload"]["status"], "STATUS");
        assert_eq!(json["payload"]["percent"], 42.5);
        assert_eq!(json["payload"]["message"], "Unpacking");
    }

    #[test]
    fn size_envelope_uses_camel_case_fields() {
        let envelope = Envelope::size(UpgradeSize {
            download_size: 2_155_000_000,
            required_space: 99_300_000,
        });
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "SIZE");
        assert_eq!(json["payload"]["size"]["downloadSize"], 2_155_000_000u64);
        assert_eq!(json["payload"]["size"]["requiredSpace"], 99_300_000);
    }

    #[test]
    fn state_envelope_decodes_back_to_state_payload() {
        let json = Envelope::state(true, 2).to_json().unwrap();
        let decoded = Envelope::from_json(&json).unwrap();

        assert_matches!(
            decoded.payload,
            Payload::State(StatePayload { busy: true, clients: 2, .. })
        );
    }

    #[rstest]
    #[case(-5.0, 0.0)]
    #[case(150.0, 100.0)]
    #[case(f64::NAN, 0.0)]
    #[case(33.3, 33.3)]
    fn progress_percent_is_clamped(#[case] raw: f64, #[case] expected: f64) {
        assert_eq!(ProgressEvent::new(Status::Status, raw, "").percent, expected);
    }
}
