//! LanMsg — Main Entry Point
//!
//! Bootstrap order: logger → config → driver → service, then the
//! 60 Hz cooperative loop:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ stdin thread ──▶ command channel ──▶                     │
//! │                                      main loop           │
//! │   per frame:  drain commands                             │
//! │               service.tick(driver, sink, now)            │
//! │               sleep to the next tick                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The stdin thread is the only helper thread and touches nothing
//! but its channel; all messenger state stays on the main loop.

#![deny(unused_must_use)]

use std::sync::mpsc;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use lanmsg::adapters::clock::HostClock;
use lanmsg::adapters::console::ConsoleSink;
use lanmsg::adapters::logger;
use lanmsg::adapters::std_net::StdNetDriver;
use lanmsg::app::commands::AppCommand;
use lanmsg::app::ports::TickClock;
use lanmsg::app::service::MessengerService;
use lanmsg::config::SystemConfig;
use lanmsg::net::driver::parse_ipv4;

fn main() -> Result<()> {
    // ── 1. Config ─────────────────────────────────────────────
    let config = load_config()?;

    // ── 2. Logging ────────────────────────────────────────────
    logger::init(&config).context("logger init")?;
    info!(target: "sys", "lanmsg v{} starting", env!("CARGO_PKG_VERSION"));

    // ── 3. Driver + service ───────────────────────────────────
    let mut driver = StdNetDriver::new();
    let mut service =
        MessengerService::init(&mut driver, &config).context("messenger init")?;

    let clock = HostClock::new();
    let mut sink = ConsoleSink;
    service.start(&mut sink);
    print_help();

    // ── 4. Command pump (stdin helper thread) ─────────────────
    let commands = spawn_stdin_pump().context("stdin pump")?;

    // ── 5. Main loop ──────────────────────────────────────────
    loop {
        let now = clock.now_ticks();

        while let Ok(line) = commands.try_recv() {
            match parse_command(&line) {
                Some(AppCommand::SetDebugLogging(on)) => logger::set_debug_echo(on),
                Some(cmd) => {
                    service.handle_command(cmd, &mut driver, &mut sink, now, || {
                        clock.sleep_one_tick();
                    });
                }
                None => {
                    if line.trim() == "/peers" {
                        print_peers(&service);
                    } else if !line.trim().is_empty() {
                        print_help();
                    }
                }
            }
        }

        if service.is_shut_down() {
            break;
        }

        service.tick(&mut driver, &mut sink, now);
        clock.sleep_one_tick();
    }

    log::logger().flush();
    Ok(())
}

// ── Bootstrap pieces ──────────────────────────────────────────

fn load_config() -> Result<SystemConfig> {
    let mut args = std::env::args().skip(1);
    let mut config = match args.next() {
        Some(flag) if flag == "--config" => {
            let path = args.next().context("--config needs a path")?;
            SystemConfig::load_json(&path)
                .map_err(|e| anyhow::anyhow!("config {path}: {e}"))?
        }
        Some(other) => bail!("unknown argument {other:?} (usage: lanmsg [--config file.json])"),
        None => SystemConfig::default(),
    };

    // A username from the environment beats the baked-in default,
    // but never an explicit config value.
    if config.username == SystemConfig::default().username {
        if let Ok(user) = std::env::var("USER") {
            if !user.is_empty() && !user.contains('|') && user.len() <= 32 {
                config.username = user;
            }
        }
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config: {e}"))?;
    Ok(config)
}

fn spawn_stdin_pump() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) => break, // EOF: run headless until killed
                    Ok(_) => {
                        if tx.send(line.trim_end().to_string()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "sys", "stdin read failed: {e}");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

// ── CLI surface ───────────────────────────────────────────────

fn parse_command(line: &str) -> Option<AppCommand> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("/send ") {
        let (ip_str, content) = rest.split_once(' ')?;
        let peer_ip = parse_ipv4(ip_str)?;
        return Some(AppCommand::SendText {
            peer_ip,
            content: content.to_string(),
        });
    }
    if let Some(content) = line.strip_prefix("/all ") {
        return Some(AppCommand::Broadcast {
            content: content.to_string(),
        });
    }
    match line {
        "/test" => Some(AppCommand::RunSelfTest),
        "/debug on" => Some(AppCommand::SetDebugLogging(true)),
        "/debug off" => Some(AppCommand::SetDebugLogging(false)),
        "/quit" => Some(AppCommand::Quit),
        _ => None,
    }
}

fn print_peers(service: &MessengerService) {
    let peers = service.peers();
    println!("{} peer(s) active:", peers.active_count());
    for peer in peers.iter_active() {
        println!("  {} at {}", peer.username, peer.ip);
    }
}

fn print_help() {
    println!("commands:");
    println!("  /peers               list active peers");
    println!("  /send <ip> <text>    message one peer");
    println!("  /all <text>          message every active peer");
    println!("  /test                run the send-path self-test");
    println!("  /debug on|off        echo debug logging to console");
    println!("  /quit                announce departure and exit");
}

// ── Tests ────────────────────────────────────────────────────
