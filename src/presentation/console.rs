//! Console front end
//!
//! Reads one command per line from stdin, forwards it to the session as a
//! [`UserCommand`] and prints the [`AppEvent`] feed as it arrives.

use crate::domain::advertising::{AdvertiseConfig, AdvertiseMode, TxPowerLevel};
use crate::domain::models::{
    AdvertiseFailureCode, AdvertisingState, AppEvent, ConnectionState, MessageSeverity, PeerId,
    SessionInput, SignalCode, UserCommand,
};
use crate::infrastructure::bluetooth::simulated::{SimulatedCentral, SimulatorHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

const HELP: &str = "\
Commands:
  start [low_power|balanced|low_latency] [low|medium|high] [timeout_ms]
  stop                   stop advertising
  closed | open | reset  send a door signal
  read                   log the current characteristic value
  inspect                log characteristic properties and value
  clear                  clear the session log
  log                    print the retained session log
  perms                  request Bluetooth permissions
  status                 show connection and advertising state
  sim connect|disconnect <peer>
  sim read <peer>
  sim write <peer> <text>
  sim fail <code>        reject the pending advertisement (1-5)
  sim central <peer>     attach a companion central
  sim state              show what the simulated radio holds
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum SimAction {
    Connect(PeerId),
    Disconnect(PeerId),
    Read(PeerId),
    Write(PeerId, Vec<u8>),
    FailAdvertise(AdvertiseFailureCode),
    AttachCentral(PeerId),
    State,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Session(UserCommand),
    Sim(SimAction),
    Status,
    Help,
    Quit,
    Empty,
}

fn parse_mode(word: &str) -> Option<AdvertiseMode> {
    match word {
        "low_power" => Some(AdvertiseMode::LowPower),
        "balanced" => Some(AdvertiseMode::Balanced),
        "low_latency" => Some(AdvertiseMode::LowLatency),
        _ => None,
    }
}

fn parse_power(word: &str) -> Option<TxPowerLevel> {
    match word {
        "low" => Some(TxPowerLevel::Low),
        "medium" => Some(TxPowerLevel::Medium),
        "high" => Some(TxPowerLevel::High),
        _ => None,
    }
}

fn parse_start(args: &[&str], defaults: &AdvertiseConfig) -> Result<AdvertiseConfig, String> {
    let mut config = *defaults;
    for arg in args {
        if let Some(mode) = parse_mode(arg) {
            config.mode = mode;
        } else if let Some(power) = parse_power(arg) {
            config.tx_power = power;
        } else if let Ok(timeout_ms) = arg.parse::<u64>() {
            config.timeout_ms = timeout_ms;
        } else {
            return Err(format!("unknown start option '{}'", arg));
        }
    }
    Ok(config)
}

fn parse_sim(args: &[&str]) -> Result<SimAction, String> {
    let peer = |i: usize| {
        args.get(i)
            .map(|p| PeerId::new(*p))
            .ok_or_else(|| "missing peer".to_string())
    };
    match args.first().copied() {
        Some("connect") => Ok(SimAction::Connect(peer(1)?)),
        Some("disconnect") => Ok(SimAction::Disconnect(peer(1)?)),
        Some("read") => Ok(SimAction::Read(peer(1)?)),
        Some("write") => {
            let peer = peer(1)?;
            let text = args.get(2..).unwrap_or_default().join(" ");
            Ok(SimAction::Write(peer, text.into_bytes()))
        }
        Some("fail") => args
            .get(1)
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| SimAction::FailAdvertise(AdvertiseFailureCode::from_code(code)))
            .ok_or_else(|| "sim fail needs a numeric code".to_string()),
        Some("central") => Ok(SimAction::AttachCentral(peer(1)?)),
        Some("state") => Ok(SimAction::State),
        Some(other) => Err(format!("unknown sim action '{}'", other)),
        None => Err("sim needs an action".to_string()),
    }
}

pub fn parse_line(line: &str, defaults: &AdvertiseConfig) -> Result<ConsoleCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, args)) = words.split_first() else {
        return Ok(ConsoleCommand::Empty);
    };

    let command = match head.to_lowercase().as_str() {
        "start" => UserCommand::StartAdvertising(parse_start(args, defaults)?),
        "stop" => UserCommand::StopAdvertising,
        "closed" | "close" | "1" => UserCommand::Dispatch(SignalCode::Closed),
        "open" | "2" => UserCommand::Dispatch(SignalCode::Open),
        "reset" | "3" => UserCommand::Dispatch(SignalCode::Reset),
        "read" => UserCommand::ReadCurrentValue,
        "inspect" => UserCommand::InspectCharacteristic,
        "clear" => UserCommand::ClearLog,
        "log" => UserCommand::ShowLog,
        "perms" | "permissions" => UserCommand::RequestPermissions,
        "sim" => return parse_sim(args).map(ConsoleCommand::Sim),
        "status" => return Ok(ConsoleCommand::Status),
        "help" | "?" => return Ok(ConsoleCommand::Help),
        "quit" | "exit" => return Ok(ConsoleCommand::Quit),
        other => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(ConsoleCommand::Session(command))
}

/// Text shown for a feed event; `None` for events with nothing to print
pub fn render_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::ConnectionStatus(state) => Some(format!("== {}", state)),
        AppEvent::AdvertisingStatus(state) => Some(format!("== Advertising: {}", state)),
        AppEvent::LogMessage(entry) => match entry.severity {
            MessageSeverity::Debug => None,
            MessageSeverity::Warning => Some(format!("{} (warning)", entry)),
            MessageSeverity::Error => Some(format!("{} (error)", entry)),
            MessageSeverity::Info | MessageSeverity::Success => Some(entry.to_string()),
        },
        AppEvent::LogCleared => Some("-- log cleared --".to_string()),
        AppEvent::LogSnapshot {
            text,
            entries,
            dropped,
        } => Some(format!(
            "-- {} entries ({} dropped) --\n{}",
            entries, dropped, text
        )),
        AppEvent::Characteristic(snapshot) => Some(format!(
            "   {} properties {} permissions {:#04x} value {}",
            snapshot.uuid,
            snapshot.properties,
            snapshot.permissions.bits(),
            snapshot.value
        )),
    }
}

fn describe_simulator(sim: &SimulatorHandle) -> String {
    let service = sim
        .registered()
        .map(|d| d.service_id().to_string())
        .unwrap_or_else(|| "none".to_string());
    let mut text = format!(
        "   service {} advertising {} (starts {}, stops {})\n   value {:?}, notifications {}",
        service,
        sim.is_advertising(),
        sim.advertise_requests().len(),
        sim.stop_count(),
        String::from_utf8_lossy(&sim.value()),
        sim.notifications().len(),
    );
    if let Some(central) = sim.central() {
        let (out1, out0) = central.outputs();
        text.push_str(&format!(
            "\n   central {} out1={} out0={} seq={} received {}",
            central.address(),
            u8::from(out1),
            u8::from(out0),
            u8::from(central.sequence()),
            central.received().len()
        ));
    }
    text
}

#[derive(Debug, Default)]
struct StatusView {
    connection: ConnectionState,
    advertising: AdvertisingState,
}

impl StatusView {
    fn apply(&mut self, event: &AppEvent) {
        match event {
            AppEvent::ConnectionStatus(state) => self.connection = state.clone(),
            AppEvent::AdvertisingStatus(state) => self.advertising = *state,
            _ => {}
        }
    }
}

pub struct Console {
    inputs: mpsc::UnboundedSender<SessionInput>,
    advertise: AdvertiseConfig,
    simulator: Option<SimulatorHandle>,
    status: StatusView,
}

impl Console {
    pub fn new(
        inputs: mpsc::UnboundedSender<SessionInput>,
        advertise: AdvertiseConfig,
        simulator: Option<SimulatorHandle>,
    ) -> Self {
        Self {
            inputs,
            advertise,
            simulator,
            status: StatusView::default(),
        }
    }

    /// Runs until `quit`, end of input, or the session going away
    pub async fn run(mut self, mut feed: mpsc::UnboundedReceiver<AppEvent>) -> anyhow::Result<()> {
        println!("{}", HELP);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                event = feed.recv() => {
                    let Some(event) = event else { break };
                    self.status.apply(&event);
                    if let Some(text) = render_event(&event) {
                        println!("{}", text);
                    }
                }
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        self.send(UserCommand::Shutdown);
                        break;
                    };
                    if !self.handle_line(&line) {
                        break;
                    }
                }
            }
        }

        // Print what the session logged while shutting down
        while let Some(event) = feed.recv().await {
            if let Some(text) = render_event(&event) {
                println!("{}", text);
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> bool {
        match parse_line(line, &self.advertise) {
            Ok(ConsoleCommand::Session(command)) => return self.send(command),
            Ok(ConsoleCommand::Sim(action)) => self.simulate(action),
            Ok(ConsoleCommand::Status) => {
                println!("{} / Advertising: {}", self.status.connection, self.status.advertising)
            }
            Ok(ConsoleCommand::Help) => println!("{}", HELP),
            Ok(ConsoleCommand::Quit) => {
                self.send(UserCommand::Shutdown);
                return false;
            }
            Ok(ConsoleCommand::Empty) => {}
            Err(e) => println!("{}", e),
        }
        true
    }

    fn send(&self, command: UserCommand) -> bool {
        debug!("Console -> {:?}", command);
        self.inputs.send(SessionInput::Command(command)).is_ok()
    }

    fn simulate(&self, action: SimAction) {
        let Some(sim) = &self.simulator else {
            println!("sim commands need the simulated backend");
            return;
        };
        match action {
            SimAction::Connect(peer) => sim.connect(peer),
            SimAction::Disconnect(peer) => sim.disconnect(peer),
            SimAction::Read(peer) => {
                let value = sim.read(peer);
                println!("   read -> {:?}", String::from_utf8_lossy(&value));
            }
            SimAction::Write(peer, value) => {
                if !sim.write(peer, value) {
                    println!("   write rejected");
                }
            }
            SimAction::FailAdvertise(code) => sim.fail_advertise(code),
            SimAction::AttachCentral(peer) => sim.attach_central(SimulatedCentral::new(peer)),
            SimAction::State => println!("{}", describe_simulator(sim)),
        }
    }
}
