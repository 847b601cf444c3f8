//! Line-oriented console for driving a dispenser session by hand

use crate::domain::{ConnectionState, DispenserCommand};
use crate::infrastructure::bluetooth::DispenserService;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// How long `quit` waits for the link to reach a terminal state
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const HELP: &str = "\
Commands:
  connect [MAC]   open a session (defaults to the last used address)
  disconnect      close the session
  hot | cold | ambient
                  start dispensing
  release         stop dispensing
  status          show link state and active command
  quit            release, disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect(Option<String>),
    Disconnect,
    Press(DispenserCommand),
    Release,
    Status,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("'{0}' takes no arguments")]
    UnexpectedArgument(String),
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        let argument = words.next().map(str::to_string);
        if words.next().is_some() {
            return Err(ConsoleError::UnexpectedArgument(verb));
        }

        let command = match verb.as_str() {
            "connect" => return Ok(Self::Connect(argument)),
            "disconnect" => Self::Disconnect,
            "release" | "r" | "stop" => Self::Release,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => match DispenserCommand::from_str(other) {
                Ok(command) if !command.is_safe() => Self::Press(command),
                _ => return Err(ConsoleError::Unknown(verb)),
            },
        };
        match argument {
            Some(_) => Err(ConsoleError::UnexpectedArgument(verb)),
            None => Ok(command),
        }
    }
}

pub struct Console {
    service: DispenserService,
    default_address: Option<String>,
    heartbeat_interval: Duration,
}

impl Console {
    pub fn new(
        service: DispenserService,
        default_address: Option<String>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            service,
            default_address,
            heartbeat_interval,
        }
    }

    /// Read commands from `input` until `quit` or end of input, then close
    /// the session and stop the service.
    pub async fn run<R>(mut self, input: R) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut states = self.service.subscribe();
        println!("{}", HELP);

        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.report(state);
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("Console input closed");
                        break;
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.parse::<ConsoleCommand>() {
                        Ok(ConsoleCommand::Quit) => break,
                        Ok(command) => self.execute(command),
                        Err(e) => println!("{}", e),
                    }
                }
            }
        }

        self.close().await;
        self.service.shutdown().await;
        Ok(())
    }

    fn execute(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Connect(address) => {
                let Some(address) = address.or_else(|| self.default_address.clone()) else {
                    println!("No address given and none remembered; use 'connect AA:BB:CC:DD:EE:FF'");
                    return;
                };
                self.default_address = Some(address.clone());
                self.service.connect(&address);
            }
            ConsoleCommand::Disconnect => self.service.disconnect(),
            ConsoleCommand::Press(command) => {
                if self.service.state() != ConnectionState::Connected {
                    println!("Not connected; {} will be sent once the link is up", command);
                }
                self.service.press(command);
            }
            ConsoleCommand::Release => self.service.release(),
            ConsoleCommand::Status => {
                println!(
                    "state: {}, active: {}",
                    self.service.state(),
                    self.service.active_command()
                );
                if let Some(error) = self.service.last_error() {
                    println!("last error: {}", error);
                }
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
    }

    fn report(&self, state: ConnectionState) {
        match (state, self.service.last_error()) {
            (ConnectionState::Error, Some(error)) => println!("[{}] {}", state, error),
            _ => println!("[{}]", state),
        }
    }

    /// Release first so the dispenser sees the safe command, then close
    async fn close(&self) {
        if !self.service.is_safe() {
            self.service.release();
            if self.service.state() == ConnectionState::Connected {
                // One full heartbeat cycle carries the release
                tokio::time::sleep(self.heartbeat_interval * 2).await;
            }
        }

        if self.service.state().has_session() {
            self.service.disconnect();
            let closed = self.service.wait_for(|state| !state.has_session());
            if tokio::time::timeout(CLOSE_TIMEOUT, closed).await.is_err() {
                warn!("Link did not close within {:?}", CLOSE_TIMEOUT);
            }
        }
    }
}
