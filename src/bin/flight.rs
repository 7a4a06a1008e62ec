use clap::{App, Arg};
use impish_net::executor::ShellExecutor;
use impish_net::packets::{Ack, CommandKind, Health, TelemetryKind};
use impish_net::ports::NetworkConfig;
use impish_net::router::{CommandRouter, ShellHandler};
use impish_net::telemeter::Telemeter;
use std::net::UdpSocket;
use std::time::{Duration, Instant};
use tracing::{error, info};

const HEALTH_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("flight")
        .version("0.1.0")
        .about("IMPISH payload-side network stack: command router, telemeter, shell executor")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON network config (defaults to the loopback test topology)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("reply-to-relay")
                .long("reply-to-relay")
                .help("Send every ack to the gondola relay instead of the command's source"),
        )
        .get_matches();

    let config = NetworkConfig::load_or_default(matches.value_of("config"))?;
    info!(?config, "flight stack starting");

    // Command path
    let mut router = CommandRouter::bind(config.command_ingress)?;
    if matches.is_present("reply-to-relay") {
        router.set_reply_to(Some(config.grips_addr));
    }
    let shell = ShellHandler::new(
        config.shell_fragments,
        config.executor,
        config.telemeter_ingress,
    )?
    .with_timeout(Duration::from_millis(config.handler_timeout_ms));
    let fragment_port = shell.local_addr()?.port();
    let mut shell = shell;
    router.register(CommandKind::Shell, move |record| shell.handle(record));
    router.register(CommandKind::Ping, |_record| Ok(Ack::new()));

    // Telemetry path
    let mut telemeter = Telemeter::bind(config.telemeter_ingress, config.grips_addr)?;
    telemeter.map_port(fragment_port, TelemetryKind::ShellReply);
    telemeter.map_port(config.monitor.port(), TelemetryKind::Health);

    let mut executor = ShellExecutor::bind(config.executor)?;

    let monitor = UdpSocket::bind(config.monitor)?;
    let telemeter_ingress = config.telemeter_ingress;

    tokio::task::spawn_blocking(move || router.run());
    tokio::task::spawn_blocking(move || telemeter.run());
    tokio::task::spawn_blocking(move || executor.run());
    tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        loop {
            let health = sample_health(start);
            if let Err(e) = monitor.send_to(&health.encode(), telemeter_ingress) {
                error!(error = %e, "housekeeping send failed");
            }
            std::thread::sleep(HEALTH_PERIOD);
        }
    });

    info!("flight stack running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("flight stack stopping");
    Ok(())
}

/// Best-effort housekeeping snapshot; fields we cannot sample stay zero.
fn sample_health(start: Instant) -> Health {
    let mut health = Health {
        uptime_s: start.elapsed().as_secs() as u32,
        ..Health::default()
    };

    if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
        if let Some(load) = loadavg.split_whitespace().next() {
            if let Ok(load) = load.parse::<f64>() {
                health.cpu_pct = (load * 100.0).min(255.0) as u8;
            }
        }
    }
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let field = |name: &str| {
            meminfo
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kib| kib.parse::<u64>().ok())
        };
        if let (Some(total), Some(available)) = (field("MemTotal:"), field("MemAvailable:")) {
            health.free_mem_kib = available.min(u64::from(u32::MAX)) as u32;
            if total > 0 {
                health.mem_pct = ((total - available) * 100 / total) as u8;
            }
        }
    }
    health
}
