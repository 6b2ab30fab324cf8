//! ramcd - bit-perfect CD-to-RAM player
//!
//! Line-oriented command frontend over the playback controller.

use clap::Parser;
use ramcd::config::Config;
use ramcd::controller::Controller;
use ramcd::events::{EventKind, PlayerEvent};
use ramcd::source::CdDrive;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ramcd - bit-perfect CD audio player
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file path
    #[arg(short, long, value_name = "FILE", default_value = "config/settings.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Verify bit-perfect configuration and exit
    #[arg(long)]
    verify: bool,

    /// Check system dependencies and exit
    #[arg(long)]
    check: bool,
}

fn init_logging(args: &Args, config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = if args.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("ramcd={}", level).into());

    if let Some(path) = &config.log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        None
    }
}

fn binary_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn check_dependencies(config: &Config) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !binary_available(&config.cdparanoia_path) {
        errors.push(format!(
            "{} not found. install: sudo apt-get install cdparanoia",
            config.cdparanoia_path
        ));
    }
    if !binary_available("mpv") {
        warnings.push("mpv not found; streaming mode (load 0) unavailable".to_string());
    }
    if !config.ram_path.exists() {
        warnings.push(format!(
            "ram path {} does not exist yet",
            config.ram_path.display()
        ));
    }
    match ramcd::audio::CpalSink::list_devices() {
        Ok(devices) if devices.is_empty() => {
            errors.push("no audio output devices found".to_string())
        }
        Ok(_) => {}
        Err(e) => warnings.push(format!("could not enumerate audio devices: {}", e)),
    }

    (errors, warnings)
}

fn print_help() {
    println!("commands:");
    println!("  scan            quick TOC read");
    println!("  load [N]        load disc (0=stream, 1=standard, 2=precise, 3=rescue)");
    println!("  play pause stop transport controls");
    println!("  next prev       track navigation");
    println!("  goto N          jump to track N");
    println!("  seek S          seek to S seconds in the current track");
    println!("  repeat          cycle repeat off/track/all");
    println!("  shuffle         toggle shuffle");
    println!("  tracks          list tracks");
    println!("  verify          verify bit-perfect configuration");
    println!("  eject           stop and eject");
    println!("  help            this text");
    println!("  quit            exit");
}

fn print_tracks(controller: &Controller) {
    let Some(disc) = controller.disc() else {
        println!("no disc scanned");
        return;
    };
    for track in &disc.tracks {
        let seconds = track.duration_seconds() as u64;
        match &track.title {
            Some(title) => println!(
                "  {:02}  {:02}:{:02}  {}",
                track.number,
                seconds / 60,
                seconds % 60,
                title
            ),
            None => println!("  {:02}  {:02}:{:02}", track.number, seconds / 60, seconds % 60),
        }
    }
    println!(
        "  {} tracks, {:.0}s total",
        disc.track_count(),
        disc.total_duration_seconds()
    );
}

fn print_verify(controller: &Controller) {
    for (check, ok) in controller.verify_bit_perfect() {
        let symbol = if ok { "ok" } else { "--" };
        println!("  [{}] {}", symbol, check);
    }
}

fn attach_printers(controller: &Controller) {
    controller.subscribe(EventKind::TrackChanged, |event| {
        if let PlayerEvent::TrackChanged { number, total } = event {
            println!("track {}/{}", number, total);
        }
    });
    controller.subscribe(EventKind::CdLoaded, |event| {
        if let PlayerEvent::CdLoaded { track_count } = event {
            println!("disc loaded: {} tracks", track_count);
        }
    });
    controller.subscribe(EventKind::StatusChanged, |event| {
        if let PlayerEvent::StatusChanged { reason } = event {
            println!("status: {}", reason);
        }
    });
    controller.subscribe(EventKind::LoadingProgress, |event| {
        if let PlayerEvent::LoadingProgress { current, total, stage } = event {
            if *total > 0 {
                println!("{}: {}/{}", stage, current, total);
            } else {
                println!("{}...", stage);
            }
        }
    });
}

fn repl(controller: &Controller) {
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else { continue };
        let argument = words.next();

        match command {
            "scan" => match controller.scan() {
                Ok(disc) => println!("found {} tracks", disc.track_count()),
                Err(e) => println!("scan failed: {}", e),
            },
            "load" => {
                let level = match argument.map(str::parse::<u8>) {
                    Some(Ok(level)) => Some(level),
                    Some(Err(_)) => {
                        println!("usage: load [0-3]");
                        continue;
                    }
                    None => None,
                };
                if let Err(e) = controller.load(level) {
                    println!("load failed: {}", e);
                }
            }
            "play" => controller.play(),
            "pause" => controller.pause(),
            "stop" => controller.stop(),
            "next" => controller.next(),
            "prev" => controller.prev(),
            "goto" => match argument.map(str::parse::<usize>) {
                Some(Ok(number)) => controller.goto(number),
                _ => println!("usage: goto N"),
            },
            "seek" => match argument.map(str::parse::<f64>) {
                Some(Ok(seconds)) => controller.seek(seconds),
                _ => println!("usage: seek S"),
            },
            "repeat" => println!("repeat: {}", controller.repeat()),
            "shuffle" => match controller.shuffle() {
                Some(on) => println!("shuffle: {}", if on { "on" } else { "off" }),
                None => println!("no disc loaded"),
            },
            "tracks" => print_tracks(controller),
            "verify" => print_verify(controller),
            "eject" => controller.eject(),
            "help" => print_help(),
            "quit" => break,
            other => println!("unknown command '{}' (try 'help')", other),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let _log_guard = init_logging(&args, &config);
    info!("ramcd starting");

    let (errors, warnings) = check_dependencies(&config);

    if args.check {
        println!("dependency check");
        for error in &errors {
            println!("  error: {}", error);
        }
        for warning in &warnings {
            println!("  warning: {}", warning);
        }
        if errors.is_empty() && warnings.is_empty() {
            println!("  all dependencies ok");
        }
        std::process::exit(if errors.is_empty() { 0 } else { 1 });
    }

    if !errors.is_empty() {
        for error in &errors {
            eprintln!("error: {}", error);
        }
        anyhow::bail!("missing dependencies");
    }
    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }

    let source = Arc::new(CdDrive::new(&config));
    let controller = Controller::with_default_sink(config, source);

    if args.verify {
        println!("bit perfect verification");
        print_verify(&controller);
        controller.cleanup();
        return Ok(());
    }

    attach_printers(&controller);
    println!("ramcd ready (try 'help')");
    repl(&controller);

    controller.cleanup();
    info!("ramcd exiting");
    Ok(())
}
