use crate::acquisition::AcquisitionOutcome;
use crate::camera::CameraState;
use crate::events::{Command, Event};
use crate::models::{AuthorizationState, CameraTarget, Coordinate, Position};
use crate::subsystem::LoadState;
use std::time::Instant;

pub const HELP: &str = "\
commands:
  locate                      get the current position (10s timeout)
  refresh                     drop the cache and re-acquire
  recenter                    follow the user again
  select <lat> <lon> [name]   show a destination
  clear                       dismiss the destination
  pan <lat> <lon>             move the map by hand
  foreground                  simulate returning to the app
  query                       recommendation query parameters
  status                      print the current state
  quit";

/// What the demo shows. Fed by [`Event`]s; commands that need the location
/// subsystem are handed back to the caller.
pub struct App {
    pub authorization: AuthorizationState,
    pub position: Option<Position>,
    pub address: String,
    pub camera: Option<CameraState>,
    pub load: LoadState,
    pub tick_count: usize,
    pub should_quit: bool,

    pub last_update: Option<Instant>,
    fallback: Coordinate,
    placeholder: String,
    output: Vec<String>,
}

impl App {
    pub fn new(placeholder: impl Into<String>, fallback: Coordinate) -> Self {
        let placeholder = placeholder.into();
        Self {
            authorization: AuthorizationState::Undetermined,
            position: None,
            address: placeholder.clone(),
            camera: None,
            load: LoadState::Loading,
            tick_count: 0,
            should_quit: false,
            last_update: None,
            fallback,
            placeholder,
            output: Vec::new(),
        }
    }

    pub fn on_tick(&mut self) {
        self.tick_count += 1;
    }

    /// Applies one event. Returns the command if the subsystem has to act on it.
    pub fn handle_event(&mut self, event: Event) -> Option<Command> {
        match event {
            Event::Tick => self.on_tick(),
            Event::Command(command) => return self.handle_command(command),
            Event::InputError(e) => self.say(e),
            Event::Notice(line) => self.say(line),
            Event::Position(position) => {
                self.position = Some(position);
                self.last_update = Some(Instant::now());
                self.say(format!(
                    "position {:.5}, {:.5} (±{:.0}m)",
                    position.latitude, position.longitude, position.horizontal_accuracy
                ));
            }
            Event::Authorization(state) => {
                if state != self.authorization {
                    self.authorization = state;
                    self.say(format!("authorization: {:?}", state));
                }
            }
            Event::Address(result) => {
                let address = result.address.unwrap_or_else(|| self.placeholder.clone());
                if address != self.address {
                    self.say(format!("address: {}", address));
                    self.address = address;
                }
            }
            Event::Camera(state) => {
                let moved = self
                    .camera
                    .as_ref()
                    .map(|c| c.viewport != state.viewport || c.target != state.target)
                    .unwrap_or(true);
                if moved {
                    self.say(format!("camera: {}", describe_camera(&state)));
                }
                self.camera = Some(state);
            }
            Event::Load(load) => {
                self.load = load;
                match load {
                    LoadState::Ready => self.say("location ready"),
                    LoadState::Fallback => self.say(format!(
                        "no location, showing {:.5}, {:.5}",
                        self.fallback.latitude, self.fallback.longitude
                    )),
                    LoadState::Loading => {}
                }
            }
            Event::Acquired { label, outcome } => {
                let line = match &outcome {
                    AcquisitionOutcome::Resolved(p) => {
                        format!("{}: {:.5}, {:.5}", label, p.latitude, p.longitude)
                    }
                    AcquisitionOutcome::TimedOut => format!(
                        "{}: timed out, using {:.5}, {:.5}",
                        label, self.fallback.latitude, self.fallback.longitude
                    ),
                    AcquisitionOutcome::Superseded => format!("{}: superseded", label),
                    AcquisitionOutcome::Failed(e) => format!("{}: {}", label, e),
                };
                self.say(line);
            }
        }
        None
    }

    fn handle_command(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::Quit => {
                self.should_quit = true;
                None
            }
            Command::Help => {
                self.say(HELP);
                None
            }
            Command::Status => {
                let line = self.status_line();
                self.say(line);
                None
            }
            other => Some(other),
        }
    }

    fn say(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    /// Lines produced since the last call.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub fn status_line(&self) -> String {
        let position = match self.position {
            Some(p) => format!("{:.5}, {:.5}", p.latitude, p.longitude),
            None => "none".to_string(),
        };
        let camera = self
            .camera
            .as_ref()
            .map(describe_camera)
            .unwrap_or_else(|| "n/a".to_string());
        let age = self
            .last_update
            .map(|t| format!("{}s ago", t.elapsed().as_secs()))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "[{:?}] {:?} | position: {} ({}) | {} | camera: {}",
            self.load, self.authorization, position, age, self.address, camera
        )
    }
}

fn describe_camera(state: &CameraState) -> String {
    let center = state.viewport.center;
    let mode = match &state.target {
        CameraTarget::FollowingUser => "following".to_string(),
        CameraTarget::ManualOverride => "manual".to_string(),
        CameraTarget::ShowingDestination { name, .. } => format!("destination {}", name),
    };
    format!("{} @ {:.5}, {:.5}", mode, center.latitude, center.longitude)
}
