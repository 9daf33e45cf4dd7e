use clap::Parser;
use color_eyre::Result;
use jerome_gateway::{
    cli,
    config::Config,
    controller::ControllerHandle,
    encoder::PollerHandle,
    logging,
};
use tracing::{debug, info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(Level::INFO, None).await;

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)
    } else {
        debug!("Default config");
        Config::default()
    };

    if let Err(e) = config.validate() {
        return Err(color_eyre::eyre::eyre!("{e}"));
    }

    let controller = ControllerHandle::new(config.clone());

    for config_mode in &config.line_modes {
        controller.set_line_mode(config_mode.line, config_mode.mode)?;
    }

    let mut connection_events = controller.subscribe_connection();
    tokio::spawn(async move {
        while let Ok(connected) = connection_events.recv().await {
            info!(connected, "Device");
        }
    });

    let mut line_events = controller.subscribe_lines();
    tokio::spawn(async move {
        while let Ok(event) = line_events.recv().await {
            debug!(line = event.line, state = event.state, "Line");
        }
    });

    let _poller = config.polling.clone().map(|polling| {
        let poller = PollerHandle::new(&controller, polling);

        let mut readings = poller.subscribe_readings();
        tokio::spawn(async move {
            while let Ok(reading) = readings.recv().await {
                info!(channel = reading.channel, value = reading.value, "Encoder");
            }
        });

        poller
    });

    #[cfg(unix)]
    {
        let mut hangup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting")
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    logging::shutdown();

    Ok(())
}
