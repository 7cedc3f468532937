use anyhow::Result;
use harness::ModuleRunner;
use modules::analytics::Analytics;
use modules::realtime::Realtime;
use modules::relay::Relay;
use options::{Command, LogFormat};
use structopt::StructOpt;
use tracing::info;

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let (command, runner) = init()?;

    match command {
        Command::Relay(options) => runner.run(Relay::new(options)).await,
        Command::Analytics(options) => runner.run(Analytics::new(options)).await,
        Command::Realtime(options) => runner.run(Realtime::new(options)).await,
    };

    Ok(())
}

fn init() -> Result<(Command, ModuleRunner)> {
    let options = options::MainOptions::from_args();

    let formatter = tracing_subscriber::fmt().with_env_filter(options.log);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("Queue relay {}", env!("CARGO_PKG_VERSION"));

    Ok((options.command, ModuleRunner::default()))
}
