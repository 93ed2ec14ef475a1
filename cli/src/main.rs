//! Interactive client for a multistream device
//!
//! Opens a session on one unit and runs a menu loop over stdin: write, read,
//! switch priority, set the blocking timeout, enable or disable the unit,
//! print the unit counters.
//!
//! Usage: `multistream-cli [UNIT]`. If `MULTISTREAM_CONFIG` names a JSON file
//! it is used as the device config. `RUST_LOG` controls logging.

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use multistream::{Command, Config, Device, Priority, Session};
use tracing::{debug, info, warn};

/// Largest single read or write offered by the menu
const MAX_TRANSFER: usize = 4096;

const MENU: &[&str] = &[
    "|1 |  Write to the unit",
    "|2 |  Read from the unit",
    "|3 |  Switch to the high priority flow",
    "|4 |  Switch to the low priority flow",
    "|5 |  Make operations blocking",
    "|6 |  Make operations non-blocking",
    "|7 |  Enable the unit",
    "|8 |  Disable the unit",
    "|9 |  Show unit counters",
    "|0 |  Exit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Write,
    Read,
    Control(Command),
    AskTimeout,
    Stats,
    Exit,
}

fn parse_choice(line: &str) -> Option<Choice> {
    let choice = match line.trim() {
        "1" => Choice::Write,
        "2" => Choice::Read,
        "3" => Choice::Control(Command::SetPriority(Priority::High)),
        "4" => Choice::Control(Command::SetPriority(Priority::Low)),
        "5" => Choice::AskTimeout,
        "6" => Choice::Control(Command::SetBlockingTimeout(0)),
        "7" => Choice::Control(Command::SetUnitEnabled(true)),
        "8" => Choice::Control(Command::SetUnitEnabled(false)),
        "9" => Choice::Stats,
        "0" | "q" | "quit" | "exit" => Choice::Exit,
        _ => return None,
    };
    Some(choice)
}

fn load_config() -> Result<Config, Box<dyn Error>> {
    match std::env::var_os("MULTISTREAM_CONFIG") {
        Some(path) => {
            debug!(path = ?path, "loading config");
            let file = std::fs::File::open(&path)?;
            Ok(Config::from_json_reader(io::BufReader::new(file))?)
        }
        None => Ok(Config::default()),
    }
}

struct Prompt<R> {
    input: R,
    line: String,
}

impl<R: BufRead> Prompt<R> {
    /// Print `question` and return the next input line, or `None` at EOF
    fn ask(&mut self, question: &str) -> io::Result<Option<&str>> {
        print!("{question}");
        io::stdout().flush()?;
        self.line.clear();
        if self.input.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        Ok(Some(self.line.trim_end_matches(&['\r', '\n'][..])))
    }
}

fn run_menu(session: &Session, input: impl BufRead) -> io::Result<()> {
    let mut prompt = Prompt {
        input,
        line: String::new(),
    };

    loop {
        println!();
        for item in MENU {
            println!("{item}");
        }
        let Some(line) = prompt.ask("> ")? else {
            return Ok(());
        };
        let Some(choice) = parse_choice(line) else {
            println!("Unknown choice: {line}");
            continue;
        };

        match choice {
            Choice::Exit => return Ok(()),
            Choice::Write => {
                let Some(text) = prompt.ask("Data to write (max 4096 bytes): ")? else {
                    return Ok(());
                };
                let bytes = &text.as_bytes()[..text.len().min(MAX_TRANSFER)];
                match session.write(bytes) {
                    Ok(n) => println!("Wrote {n} bytes"),
                    Err(e) => println!("Write failed: {e}"),
                }
            }
            Choice::Read => {
                let Some(text) = prompt.ask("Bytes to read (max 4096): ")? else {
                    return Ok(());
                };
                let Ok(len) = text.trim().parse::<usize>() else {
                    println!("Not a length: {text}");
                    continue;
                };
                match session.read(len.min(MAX_TRANSFER)) {
                    Ok(data) if data.is_empty() => println!("No data"),
                    Ok(data) => println!(
                        "Read {} bytes: {}",
                        data.len(),
                        String::from_utf8_lossy(&data)
                    ),
                    Err(e) => println!("Read failed: {e}"),
                }
            }
            Choice::AskTimeout => {
                let Some(text) = prompt.ask("Timeout in ticks (1 tick = 10 ms by default): ")?
                else {
                    return Ok(());
                };
                match text.trim().parse::<u64>() {
                    Ok(ticks) if ticks > 0 => apply(session, Command::SetBlockingTimeout(ticks)),
                    _ => println!("The timeout must be a positive integer"),
                }
            }
            Choice::Control(command) => apply(session, command),
            Choice::Stats => {
                let stats = session.unit().stats();
                println!("unit {} enabled: {}", session.unit().id(), stats.enabled);
                for priority in Priority::ALL {
                    let flow = stats.flow(priority);
                    println!(
                        "  {priority:>4}: buffered {} free {} waiting {} chunks {} pending {}",
                        flow.buffered_bytes,
                        flow.free_bytes,
                        flow.waiting,
                        flow.chunks,
                        flow.deferred_pending
                    );
                }
                println!("  session: {:?}", session.attrs());
            }
        }
    }
}

fn apply(session: &Session, command: Command) {
    match session.control(command) {
        Ok(()) => println!("Done: {command:?}"),
        Err(e) => {
            warn!(error = %e, ?command, "control command failed");
            println!("Command failed: {e}");
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let unit = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<usize>()?,
        None => 0,
    };

    let device = Arc::new(Device::new(load_config()?)?);
    info!(units = device.len(), "device ready");

    let session = device.open(unit)?;
    println!("Session {} opened on unit {unit}", session.id());

    run_menu(&session, io::stdin().lock())?;

    session.close();
    device.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice(" 1\n"), Some(Choice::Write));
        assert_eq!(
            parse_choice("4"),
            Some(Choice::Control(Command::SetPriority(Priority::Low)))
        );
        assert_eq!(parse_choice("q"), Some(Choice::Exit));
        assert_eq!(parse_choice("12"), None);
    }

    #[test]
    fn test_scripted_session() {
        let device = Arc::new(
            Device::new(Config {
                units: 1,
                ..Config::default()
            })
            .unwrap(),
        );
        let session = device.open(0).unwrap();

        let script = "1\nhello\n8\n7\n2\n3\n9\n0\n";
        run_menu(&session, script.as_bytes()).unwrap();

        assert!(session.unit().is_enabled());
        assert_eq!(session.unit().stats().high.buffered_bytes, 2);
    }
}
