//! Event types and the event loop driver for the demo binary.
//!
//! This module defines the [`Event`] enum (typed commands, ticks, and
//! everything the location subsystem publishes) and the [`EventHandler`],
//! which multiplexes stdin commands, periodic ticks and subsystem channels
//! into one stream. The main loop in `main.rs` receives events via
//! [`EventHandler::next`]; background work posts results via
//! [`EventHandler::tx`].

use crate::acquisition::AcquisitionOutcome;
use crate::camera::CameraState;
use crate::models::{AuthorizationState, Coordinate, GeocodeResult, Position};
use crate::subsystem::{LoadState, LocationSubsystem};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;

/// Something the user typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Locate,
    Refresh,
    Recenter,
    Select { coordinate: Coordinate, name: String },
    Clear,
    Pan { coordinate: Coordinate },
    Foreground,
    Query,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let coordinate = |words: &mut std::str::SplitWhitespace<'_>| -> Result<Coordinate, String> {
            let lat = words
                .next()
                .and_then(|w| w.parse::<f64>().ok())
                .ok_or_else(|| format!("{verb}: expected <lat> <lon>"))?;
            let lon = words
                .next()
                .and_then(|w| w.parse::<f64>().ok())
                .ok_or_else(|| format!("{verb}: expected <lat> <lon>"))?;
            Ok(Coordinate::new(lat, lon))
        };

        match verb.to_lowercase().as_str() {
            "locate" | "l" => Ok(Command::Locate),
            "refresh" | "r" => Ok(Command::Refresh),
            "recenter" | "c" => Ok(Command::Recenter),
            "select" | "s" => {
                let coordinate = coordinate(&mut words)?;
                let name = words.collect::<Vec<_>>().join(" ");
                let name = if name.is_empty() { "Destination".to_string() } else { name };
                Ok(Command::Select { coordinate, name })
            }
            "clear" => Ok(Command::Clear),
            "pan" | "p" => Ok(Command::Pan {
                coordinate: coordinate(&mut words)?,
            }),
            "foreground" | "fg" => Ok(Command::Foreground),
            "query" => Ok(Command::Query),
            "status" => Ok(Command::Status),
            "help" | "h" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{other}' (try 'help')")),
        }
    }
}

/// Events processed by the application event loop.
pub enum Event {
    /// Periodic tick.
    Tick,
    /// A parsed line from stdin.
    Command(Command),
    /// A line from stdin that didn't parse.
    InputError(String),
    /// Free-form line for the user.
    Notice(String),
    /// Accepted reading from the position source.
    Position(Position),
    Authorization(AuthorizationState),
    /// Newest non-stale geocode.
    Address(GeocodeResult),
    Camera(CameraState),
    Load(LoadState),
    /// Result of a user-triggered acquisition.
    Acquired {
        label: &'static str,
        outcome: AcquisitionOutcome,
    },
}

/// Multiplexes stdin, ticks and subsystem channels into a single event stream.
///
/// The sender ([`tx`](EventHandler::tx)) can be cloned and handed to other
/// tasks, while the receiver is consumed by [`next`](EventHandler::next).
pub struct EventHandler {
    /// Sender for posting events (e.g. acquisition results).
    pub tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
    /// Creates the handler and spawns the stdin reader and the ticker.
    ///
    /// End of input on stdin is treated as [`Command::Quit`].
    pub fn new(tick_rate_ms: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let input_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let event = match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match line.parse::<Command>() {
                        Ok(command) => Event::Command(command),
                        Err(e) => Event::InputError(e),
                    },
                    Ok(None) | Err(_) => {
                        let _ = input_tx.send(Event::Command(Command::Quit));
                        break;
                    }
                };
                if input_tx.send(event).is_err() {
                    break;
                }
            }
        });

        let tick_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(tick_rate_ms));
            loop {
                ticker.tick().await;
                if tick_tx.send(Event::Tick).is_err() {
                    break;
                }
            }
        });

        Self { tx, rx }
    }

    /// Forwards everything the subsystem publishes into this event stream.
    pub fn attach(&self, subsystem: &Arc<LocationSubsystem>) {
        let tx = self.tx.clone();
        let positions = subsystem.observe_position();
        tokio::spawn(async move {
            tokio::pin!(positions);
            while let Some(position) = positions.next().await {
                if tx.send(Event::Position(position)).is_err() {
                    break;
                }
            }
        });

        let tx = self.tx.clone();
        let mut authorization = subsystem.observe_authorization();
        tokio::spawn(async move {
            while let Some(state) = authorization.next().await {
                if tx.send(Event::Authorization(state)).is_err() {
                    break;
                }
            }
        });

        forward(self.tx.clone(), subsystem.subscribe_camera(), |c| Some(Event::Camera(c)));
        forward(self.tx.clone(), subsystem.subscribe_load(), |l| Some(Event::Load(l)));
        forward(self.tx.clone(), subsystem.subscribe_address(), |a| {
            a.filter(|r| !r.is_stale).map(Event::Address)
        });
    }

    /// Receives the next event. `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

fn forward<T, F>(tx: mpsc::UnboundedSender<Event>, mut rx: watch::Receiver<T>, to_event: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Option<Event> + Send + 'static,
{
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let value = rx.borrow_and_update().clone();
            if let Some(event) = to_event(value) {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_with_multi_word_name() {
        let command: Command = "select 40.7295 -73.9965 Washington Square Park".parse().unwrap();
        assert_eq!(
            command,
            Command::Select {
                coordinate: Coordinate::new(40.7295, -73.9965),
                name: "Washington Square Park".into(),
            }
        );
    }

    #[test]
    fn select_without_name_gets_a_default() {
        let command: Command = "s 40.7 -73.9".parse().unwrap();
        assert!(matches!(command, Command::Select { name, .. } if name == "Destination"));
    }

    #[test]
    fn shorthand_and_case_are_accepted() {
        assert_eq!("Q".parse::<Command>().unwrap(), Command::Quit);
        assert_eq!("fg".parse::<Command>().unwrap(), Command::Foreground);
        assert_eq!("recenter".parse::<Command>().unwrap(), Command::Recenter);
    }

    #[test]
    fn bad_input_is_reported() {
        assert!("pan 40.7".parse::<Command>().is_err());
        assert!("teleport".parse::<Command>().unwrap_err().contains("unknown command"));
        assert!("".parse::<Command>().is_err());
    }
}
