use std::str::FromStr;
use structopt::StructOpt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown log format `{0}`, expected one of: text, compact, json")]
pub struct UnknownLogFormat(String);

/// Layout of the emitted log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(UnknownLogFormat(s.to_owned())),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(about = "Relays queue messages into a partitioned log")]
pub struct MainOptions {
    /// Log filter in the env-logger syntax, e.g. `info` or `modules=debug,warn`
    #[structopt(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log: String,

    /// Format of the log output [text, compact, json]
    #[structopt(long, env, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Pulls messages from the queue into the log and serves the control surface
    Relay(modules::relay::Options),
    /// Aggregates statistics over the relayed messages
    Analytics(modules::analytics::Options),
    /// Raises alerts for relayed messages as they arrive
    Realtime(modules::realtime::Options),
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn parse_log_formats() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn select_subcommand() {
        let options = MainOptions::from_iter_safe(&[
            "queue-relay",
            "--log-format",
            "compact",
            "analytics",
            "--log-backend",
            "memory",
        ])
        .unwrap();

        assert_eq!(options.log_format, LogFormat::Compact);
        assert!(matches!(options.command, Command::Analytics(_)));
    }
}
