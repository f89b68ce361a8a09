use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use vantage::{
    api::NominatimGeocoder,
    app::App,
    config::{Config, ProviderKind},
    events::{Command, Event, EventHandler},
    logging,
    models::{AuthorizationState, Coordinate, Position, Viewport},
    platform::{simulated::SimulatedPlatform, ip::IpApiHardware, ConfiguredAuthorization},
    subsystem::LocationSubsystem,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Instrumentation and safety
    let _log_guard = logging::initialize_logging("logs");
    color_eyre::install()?;

    let config = Config::load();
    let subsystem = build_subsystem(&config)?;

    let mut events = EventHandler::new(1_000);
    events.attach(&subsystem);
    let mut app = App::new(config.geocode.placeholder.clone(), subsystem.fallback());

    println!("vantage: finding your location (type 'help' for commands)");
    let status = subsystem.start().await;
    info!("Started with authorization {:?}", status);

    // Main loop
    while !app.should_quit {
        let Some(event) = events.next().await else {
            break;
        };
        if let Some(command) = app.handle_event(event) {
            dispatch(&subsystem, &config, command, &events.tx);
        }
        for line in app.take_output() {
            println!("{}", line);
        }
    }

    subsystem.shutdown();
    Ok(())
}

fn build_subsystem(config: &Config) -> Result<Arc<LocationSubsystem>> {
    let geocoder = Arc::new(NominatimGeocoder::new(
        config.geocode.endpoint.clone(),
        Duration::from_secs(config.geocode.request_timeout_seconds),
    )?);

    let subsystem = match config.location.provider {
        ProviderKind::IpApi => LocationSubsystem::new(
            Arc::new(ConfiguredAuthorization::new(config.permission.granted)),
            Arc::new(IpApiHardware::new(
                "",
                Duration::from_secs(config.location.ip_poll_interval_seconds),
            )),
            geocoder,
            config,
        ),
        ProviderKind::Simulated => {
            let platform = SimulatedPlatform::new(AuthorizationState::Undetermined);
            let answer = if config.permission.granted {
                AuthorizationState::AuthorizedWhileInUse
            } else {
                AuthorizationState::Denied
            };
            platform.answer_prompt_with(Some(answer), Duration::from_millis(500));
            spawn_walk(platform.clone(), config.location.default_coordinate());
            LocationSubsystem::new(
                Arc::new(platform.clone()),
                Arc::new(platform),
                geocoder,
                config,
            )
        }
    };
    Ok(subsystem)
}

/// Walks north from `start`, one reading every 3s, ~22m per step.
fn spawn_walk(platform: SimulatedPlatform, start: Coordinate) {
    tokio::spawn(async move {
        let mut step = 0u32;
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        loop {
            ticker.tick().await;
            let position = Position::new(
                start.latitude + f64::from(step) * 0.0002,
                start.longitude,
                Utc::now(),
                15.0,
            );
            platform.reply_to_requests(Duration::from_millis(800), position);
            if platform.emit(position) {
                debug!("Simulated walk step {}", step);
            }
            step += 1;
        }
    });
}

fn dispatch(
    subsystem: &Arc<LocationSubsystem>,
    config: &Config,
    command: Command,
    tx: &mpsc::UnboundedSender<Event>,
) {
    match command {
        Command::Select { coordinate, name } => {
            subsystem.select_destination(coordinate, name);
        }
        Command::Clear => {
            if subsystem.clear_destination().is_none() {
                let _ = tx.send(Event::Notice("no destination selected".into()));
            }
        }
        Command::Pan { coordinate } => {
            let span = subsystem.camera_state().viewport.span_deg;
            subsystem.manual_gesture(Viewport::new(coordinate, span));
        }
        Command::Query => {
            let params = subsystem.query_params();
            let line = if params.is_empty() {
                "query: (no location)".to_string()
            } else {
                let pairs: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("query: ?{}", pairs.join("&"))
            };
            let _ = tx.send(Event::Notice(line));
        }
        Command::Locate | Command::Refresh | Command::Recenter | Command::Foreground => {
            let subsystem = Arc::clone(subsystem);
            let tx = tx.clone();
            let timeout_ms = config.acquisition.default_timeout_ms;
            tokio::spawn(async move {
                let (label, outcome) = match command {
                    Command::Refresh => ("refresh", subsystem.force_refresh().await),
                    Command::Recenter => ("recenter", subsystem.recenter().await),
                    Command::Foreground => ("foreground", subsystem.on_foreground().await),
                    _ => ("locate", subsystem.get_current_position(timeout_ms).await),
                };
                let _ = tx.send(Event::Acquired { label, outcome });
            });
        }
        Command::Status | Command::Help | Command::Quit => {}
    }
}
