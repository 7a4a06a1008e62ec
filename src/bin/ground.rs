use clap::{App, Arg};
use colored::*;
use impish_net::ground::console::{self, AckRing};
use impish_net::ground::{PacketDiscriminator, ReplyReassembler, TelemetrySorter};
use impish_net::packets::TelemetryKind;
use impish_net::ports::NetworkConfig;
use std::net::UdpSocket;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("ground")
        .version("0.1.0")
        .about("IMPISH ground-side network stack: packet fan-out and reply reconstruction")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON network config (defaults to the loopback test topology)")
                .takes_value(true),
        )
        .get_matches();

    let config = NetworkConfig::load_or_default(matches.value_of("config"))?;
    info!(?config, "ground stack starting");

    // Stage one: relay stream split into ack and telemetry legs.
    let ingress = UdpSocket::bind(config.ground_ingress)?;
    let mut discriminator = PacketDiscriminator::new(
        ingress,
        config.discriminator_resend,
        vec![config.telemetry_sorter, config.telemetry_dump],
        vec![config.ack_display, config.ack_dump],
    )?;

    // Stage two: telemetry leg sorted by record type. Shell replies fan
    // out to our own display pump and to the commander's reply endpoint,
    // which only receives anything while a commander is running.
    let mut sorter = TelemetrySorter::bind(config.telemetry_sorter, config.telemetry_dump)?;
    sorter.forward(TelemetryKind::ShellReply, config.command_telemetry);
    sorter.forward(TelemetryKind::ShellReply, config.commander_reply);

    // Operator feeds.
    let ack_socket = UdpSocket::bind(config.ack_display)?;
    let ring = Arc::new(Mutex::new(AckRing::new()));
    let _ack_pump = console::spawn_ack_pump(ack_socket, Arc::clone(&ring));

    let reassembler = ReplyReassembler::bind(config.command_telemetry)?
        .with_session_timeout(Duration::from_millis(config.session_timeout_ms));
    let (reply_tx, reply_rx) = mpsc::channel();
    let _reply_pump = console::spawn_reply_pump(reassembler, reply_tx);

    tokio::task::spawn_blocking(move || discriminator.run());
    tokio::task::spawn_blocking(move || sorter.run());
    tokio::task::spawn_blocking(move || {
        for reply in reply_rx {
            println!("{}", "=== shell reply ===".bold());
            println!("{}", console::format_reply(&reply));
        }
    });

    info!("ground stack running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("ground stack stopping");
    Ok(())
}
