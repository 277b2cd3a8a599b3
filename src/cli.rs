//! Interactive console
//!
//! Reads commands on its own thread and hands them to the control context.
//! Rendering helpers for status and port listings live here too.

use anyhow::Result;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::debug;

use crate::input::InputInfo;
use crate::observer::ConnectionState;
use crate::supervisor::{Command, StatusReport};
use crate::usb::DeviceSummary;

const PROMPT: &str = "sc-d70> ";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Inputs,
    Help,
    Quit,
    Bridge(Command),
}

pub const HELP: &str = "\
Commands:
  status        show connection state and counters
  inputs        list MIDI inputs
  select <id>   use the given MIDI input and reconnect
  reconnect     restart the device session
  start         connect and start forwarding
  stop          stop forwarding and release the device
  help          show this help
  quit          exit";

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_lowercase().as_str() {
        "status" | "s" => ConsoleCommand::Status,
        "inputs" | "list" | "ls" => ConsoleCommand::Inputs,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        "start" => ConsoleCommand::Bridge(Command::Start),
        "stop" => ConsoleCommand::Bridge(Command::Stop),
        "reconnect" | "r" => ConsoleCommand::Bridge(Command::Reconnect),
        "select" => {
            // Port ids may contain spaces on some backends
            let id = words.collect::<Vec<_>>().join(" ");
            if id.is_empty() {
                return Err("usage: select <id>".to_string());
            }
            ConsoleCommand::Bridge(Command::SelectInput(id))
        },
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };
    Ok(Some(command))
}

/// Run the console on a dedicated thread until quit, EOF or Ctrl+C
pub fn spawn_console(tx: mpsc::UnboundedSender<ConsoleCommand>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            if let Err(e) = run_console(&tx) {
                eprintln!("Console error: {:#}", e);
            }
            let _ = tx.send(ConsoleCommand::Quit);
        })
}

fn run_console(tx: &mpsc::UnboundedSender<ConsoleCommand>) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    loop {
        match rl.readline(PROMPT) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match parse_command(&line) {
                    Ok(Some(ConsoleCommand::Help)) => println!("{}", HELP),
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if tx.send(command).is_err() {
                            debug!("Control context gone, closing console");
                            break;
                        }
                    },
                    Ok(None) => {},
                    Err(msg) => println!("{}", msg.yellow()),
                }
            },
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn colored_state(state: ConnectionState) -> ColoredString {
    let label = state.to_string();
    match state {
        ConnectionState::Running => label.green().bold(),
        ConnectionState::Error => label.red().bold(),
        ConnectionState::Disconnected => label.dimmed(),
        _ => label.yellow(),
    }
}

pub fn print_status(report: &StatusReport) {
    if report.detail.is_empty() {
        println!("State: {}", colored_state(report.state));
    } else {
        println!("State: {} ({})", colored_state(report.state), report.detail);
    }
    if let Some(input) = &report.input {
        println!("Input: {} {}", input.name.cyan(), format!("[{}]", input.id).dimmed());
    }
    if let Some(stats) = &report.stats {
        println!(
            "Forwarded: {}  Filtered: {}  Batches: {}  Write failures: {}",
            stats.forwarded.to_string().green(),
            stats.filtered,
            stats.batches,
            if stats.write_failures > 0 {
                stats.write_failures.to_string().red()
            } else {
                stats.write_failures.to_string().normal()
            }
        );
    }
    if report.retry_attempt > 0 {
        println!("Reconnect attempts: {}", report.retry_attempt);
    }
}

pub fn print_inputs(inputs: &[InputInfo], selected: Option<&str>) {
    println!("\n{}", "MIDI Inputs:".bold());
    if inputs.is_empty() {
        println!("  {}", "(none)".dimmed());
        return;
    }
    for info in inputs {
        let marker = if Some(info.id.as_str()) == selected {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!("{} {} {}", marker, info.name.cyan(), format!("[{}]", info.id).dimmed());
    }
}

pub fn print_devices(devices: &[DeviceSummary], vendor_id: u16, product_id: u16) {
    println!("\n{}", "USB Devices:".bold());
    if devices.is_empty() {
        println!("  {}", "(none)".dimmed());
        return;
    }
    for device in devices {
        let line = format!(
            "  Bus {:03} Device {:03}: {:04x}:{:04x}",
            device.bus, device.address, device.vendor_id, device.product_id
        );
        if device.vendor_id == vendor_id && device.product_id == product_id {
            println!("{} {}", line.green().bold(), "<- SC-D70".green());
        } else {
            println!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("status"), Ok(Some(ConsoleCommand::Status)));
        assert_eq!(parse_command("  INPUTS "), Ok(Some(ConsoleCommand::Inputs)));
        assert_eq!(
            parse_command("reconnect"),
            Ok(Some(ConsoleCommand::Bridge(Command::Reconnect)))
        );
        assert_eq!(parse_command("quit"), Ok(Some(ConsoleCommand::Quit)));
        assert_eq!(parse_command(""), Ok(None));
    }

    #[test]
    fn test_parse_select_keeps_spaces() {
        assert_eq!(
            parse_command("select 24:0 USB Keyboard"),
            Ok(Some(ConsoleCommand::Bridge(Command::SelectInput(
                "24:0 USB Keyboard".to_string()
            ))))
        );
        assert!(parse_command("select").is_err());
    }

    #[test]
    fn test_parse_unknown() {
        let err = parse_command("bogus").unwrap_err();
        assert!(err.contains("bogus"));
    }
}
