use clap::{App, Arg, SubCommand};
use colored::*;
use impish_net::ground::console;
use impish_net::ground::{Commander, ReassembleError, ReplyReassembler};
use impish_net::packets::{Command, CommandKind, ShellCommand};
use impish_net::ports::NetworkConfig;
use std::net::SocketAddr;
use std::time::Duration;

const ACK_WAIT: Duration = Duration::from_secs(5);

/// How long to wait for the first reply fragment to come back down the
/// telemetry path before giving up on a display.
const REPLY_WAIT: Duration = Duration::from_secs(10);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("commander")
        .version("0.1.0")
        .about("Send commands to the IMPISH payload and display the acknowledgement and reply")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON network config (defaults to the loopback test topology)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("dest")
                .short("d")
                .long("dest")
                .value_name("ADDR")
                .help("Command ingress address (overrides the config)")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("shell")
                .about("Run a shell command on the flight computer and show its output")
                .arg(
                    Arg::with_name("command")
                        .help("Command line to run (255 bytes max, UTF-8)")
                        .required(true)
                        .multiple(true),
                ),
        )
        .subcommand(SubCommand::with_name("ping").about("Check the command path end to end"))
        .get_matches();

    let config = NetworkConfig::load_or_default(matches.value_of("config"))?;
    let dest: SocketAddr = match matches.value_of("dest") {
        Some(addr) => addr.parse()?,
        None => config.command_ingress,
    };

    let command = match matches.subcommand() {
        ("shell", Some(shell_matches)) => {
            let words: Vec<&str> = shell_matches
                .values_of("command")
                .map(|values| values.collect())
                .unwrap_or_default();
            let text = words.join(" ");
            if let Err(reason) = console::check_command_length(&text) {
                eprintln!("{}", reason.as_str().red());
                std::process::exit(1);
            }
            Command::Shell(ShellCommand::new(&text)?)
        }
        ("ping", _) => Command::Ping,
        _ => {
            eprintln!("{}", "no subcommand given; try `commander ping`".yellow());
            std::process::exit(2);
        }
    };

    // Bind the reply endpoint before sending so no fragment is lost; the
    // ground sorter copies shell replies here.
    let reassembler = match command.kind() {
        CommandKind::Shell => Some(
            ReplyReassembler::bind(config.commander_reply)?
                .with_session_timeout(Duration::from_millis(config.session_timeout_ms))
                .with_first_fragment_timeout(Some(REPLY_WAIT)),
        ),
        _ => None,
    };

    let mut commander = Commander::bind(config.commander)?;
    commander.set_ack_timeout(Some(ACK_WAIT))?;

    let seq = commander.send(&command, dest)?;
    println!("sent {:?} as sequence number {}", command.kind(), seq);

    let ack = commander.recv_ack()?;
    let (ok, line) = console::describe_ack_result(&ack);
    if ok {
        println!("{}", line.as_str().green());
    } else {
        println!("{}", line.as_str().red());
    }

    // The reply comes down the telemetry path even when the ack reported
    // a failure, so display whatever arrives either way.
    if let Some(mut reassembler) = reassembler {
        match reassembler.collect_session() {
            Ok(reply) => println!("{}", console::format_reply(&reply)),
            Err(ReassembleError::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                eprintln!(
                    "{}",
                    "no reply telemetry arrived (is the ground stack running?)".yellow()
                );
            }
            Err(e) => eprintln!("{}", format!("reply not reconstructed: {e}").as_str().red()),
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
