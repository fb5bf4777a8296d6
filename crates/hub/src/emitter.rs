//! Outbound tank commands.
//!
//! A command is its literal name as the message body on the command topic.
//! Publishing is fire-and-forget: no retry, no acknowledgement wait, and never
//! retained, so a reconnecting tank controller is not handed a stale command
//! it already executed.

use std::fmt;
use std::str::FromStr;

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    PumpOn,
    PumpOff,
    FeederOn,
    FeederOff,
    FeedAuto,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::PumpOn,
        Command::PumpOff,
        Command::FeederOn,
        Command::FeederOff,
        Command::FeedAuto,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PumpOn => "PUMP_ON",
            Self::PumpOff => "PUMP_OFF",
            Self::FeederOn => "FEEDER_ON",
            Self::FeederOff => "FEEDER_OFF",
            Self::FeedAuto => "FEED_AUTO",
        }
    }

    /// Commands an operator may send by hand. `FEED_AUTO` belongs to the
    /// scheduler.
    pub fn is_manual(self) -> bool {
        !matches!(self, Self::FeedAuto)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command '{0}'")]
pub struct UnknownCommand(String);

impl FromStr for Command {
    type Err = UnknownCommand;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("failed to publish {command}")]
    Publish {
        command: Command,
        #[source]
        source: rumqttc::ClientError,
    },
}

/// Anything that can deliver a command to the tank.
pub trait CommandSink {
    /// Must not block: the scheduler calls this from its tick.
    fn send(&self, command: Command) -> Result<(), EmitError>;
}

/// Publishes commands through the shared MQTT client.
#[derive(Clone)]
pub struct MqttEmitter {
    client: AsyncClient,
    topic: String,
}

impl MqttEmitter {
    pub fn new(client: AsyncClient, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }
}

impl CommandSink for MqttEmitter {
    fn send(&self, command: Command) -> Result<(), EmitError> {
        self.client
            .try_publish(
                self.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                command.as_str().as_bytes().to_vec(),
            )
            .map_err(|source| EmitError::Publish { command, source })?;
        info!(%command, topic = %self.topic, "command published");
        Ok(())
    }
}


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Client whose event loop is never polled; publishes queue up in the
    /// request channel until it is full.
    fn test_mqtt(cap: usize) -> (AsyncClient, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-emitter", "127.0.0.1", 1883);
        AsyncClient::new(opts, cap)
    }

    // -- wire names ---------------------------------------------------------

    #[test]
    fn wire_names() {
        let names: Vec<_> = Command::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(
            names,
            ["PUMP_ON", "PUMP_OFF", "FEEDER_ON", "FEEDER_OFF", "FEED_AUTO"]
        );
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("pump_on".parse::<Command>(), Ok(Command::PumpOn));
        assert_eq!(" Feeder_Off\n".parse::<Command>(), Ok(Command::FeederOff));
    }

    #[test]
    fn parse_unknown() {
        assert!("TOGGLE".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_value(Command::FeedAuto).unwrap(),
            serde_json::json!("FEED_AUTO")
        );
    }

    #[test]
    fn feed_auto_is_not_manual() {
        assert!(!Command::FeedAuto.is_manual());
        assert!(Command::PumpOn.is_manual());
        assert!(Command::FeederOff.is_manual());
    }

    // -- MqttEmitter --------------------------------------------------------

    #[test]
    fn emitter_publishes_without_a_running_loop() {
        let (client, _el) = test_mqtt(10);
        let emitter = MqttEmitter::new(client, "tank/command");
        emitter.send(Command::FeedAuto).unwrap();
        emitter.send(Command::PumpOff).unwrap();
    }

    #[test]
    fn emitter_reports_full_queue_instead_of_blocking() {
        let (client, _el) = test_mqtt(1);
        let emitter = MqttEmitter::new(client, "tank/command");
        emitter.send(Command::PumpOn).unwrap();

        let err = emitter.send(Command::PumpOff).unwrap_err();
        assert!(matches!(
            err,
            EmitError::Publish {
                command: Command::PumpOff,
                ..
            }
        ));
    }
}
