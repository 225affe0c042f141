use std::{error::Error, path::PathBuf, process::ExitCode, sync::Arc};

use adbridge::{
    AdbDevice, AdbServer,
    adb::{
        device::{InstallOptions, LogcatOptions, ScreenshotOptions, TransferOptions},
        watcher::WatcherState,
    },
    logging::setup_logging,
    models::{LogPriority, Settings, TransferProgress},
    session::Session,
    settings::{default_settings_path, load_settings},
    storage::JsonDeviceStore,
    utils::display_size,
};
use anyhow::{Context, Result};
use futures::StreamExt;
use mimalloc::MiMalloc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const USAGE: &str = "\
usage: adbridge [--settings <file>] [--store <file>] <command>

commands:
  devices                              list attached devices
  watch                                follow device state changes
  info <serial>                        show device details as JSON
  shell <serial> <command...>          run a command and stream its output
  logcat <serial> [--tag T] [--pid N] [--priority V|D|I|W|E|F] [--clear]
  push <serial> <local> <remote>       upload a file
  pull <serial> <remote> <local>       download a file
  install <serial> <apk>               install a package
  screenshot <serial> <out.png>        save a screenshot
  kill-server                          stop the bridge server

<serial> may be `any` for the first online device.";

#[derive(Debug)]
enum Command {
    Devices,
    Watch,
    Info { serial: String },
    Shell { serial: String, command: Vec<String> },
    Logcat { serial: String, options: LogcatOptions },
    Push { serial: String, local: PathBuf, remote: String },
    Pull { serial: String, remote: String, local: PathBuf },
    Install { serial: String, apk: PathBuf },
    Screenshot { serial: String, out: PathBuf },
    KillServer,
}

#[derive(Debug)]
struct Args {
    settings_path: Option<PathBuf>,
    store_path: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut settings_path = None;
    let mut store_path = None;
    let mut positional = Vec::new();

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" if positional.is_empty() => {
                let value = it.next().ok_or_else(|| "--settings requires a value".to_string())?;
                settings_path = Some(PathBuf::from(value));
            }
            "--store" if positional.is_empty() => {
                let value = it.next().ok_or_else(|| "--store requires a value".to_string())?;
                store_path = Some(PathBuf::from(value));
            }
            "-h" | "--help" if positional.is_empty() => return Err(String::new()),
            _ => positional.push(arg),
        }
    }

    let mut rest = positional.into_iter();
    let name = rest.next().ok_or_else(|| "missing command".to_string())?;
    let command = match name.as_str() {
        "devices" => Command::Devices,
        "watch" => Command::Watch,
        "kill-server" => Command::KillServer,
        "info" => Command::Info { serial: take(&mut rest, &name, "serial")? },
        "shell" => {
            let serial = take(&mut rest, &name, "serial")?;
            let command: Vec<String> = rest.collect();
            if command.is_empty() {
                return Err("shell: missing <command>".to_string());
            }
            Command::Shell { serial, command }
        }
        "logcat" => {
            let serial = take(&mut rest, &name, "serial")?;
            Command::Logcat { serial, options: parse_logcat_options(rest)? }
        }
        "push" => {
            let serial = take(&mut rest, &name, "serial")?;
            let local = PathBuf::from(take(&mut rest, &name, "local")?);
            Command::Push { serial, local, remote: take(&mut rest, &name, "remote")? }
        }
        "pull" => {
            let serial = take(&mut rest, &name, "serial")?;
            let remote = take(&mut rest, &name, "remote")?;
            Command::Pull { serial, remote, local: PathBuf::from(take(&mut rest, &name, "local")?) }
        }
        "install" => {
            let serial = take(&mut rest, &name, "serial")?;
            Command::Install { serial, apk: PathBuf::from(take(&mut rest, &name, "apk")?) }
        }
        "screenshot" => {
            let serial = take(&mut rest, &name, "serial")?;
            Command::Screenshot { serial, out: PathBuf::from(take(&mut rest, &name, "out.png")?) }
        }
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Args { settings_path, store_path, command })
}

fn take(
    rest: &mut impl Iterator<Item = String>,
    command: &str,
    what: &str,
) -> Result<String, String> {
    rest.next().ok_or_else(|| format!("{command}: missing <{what}>"))
}

fn parse_logcat_options(args: impl IntoIterator<Item = String>) -> Result<LogcatOptions, String> {
    let mut options = LogcatOptions::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--tag" => options.tag = Some(it.next().ok_or("--tag requires a value")?),
            "--pid" => {
                let value = it.next().ok_or("--pid requires a value")?;
                options.pid = Some(value.parse().map_err(|_| format!("invalid pid '{value}'"))?);
            }
            "--priority" => {
                let value = it.next().ok_or("--priority requires a value")?;
                let mut letters = value.chars();
                options.priority = match (letters.next(), letters.next()) {
                    (Some(letter), None) => LogPriority::from_letter(letter.to_ascii_uppercase()),
                    _ => None,
                }
                .ok_or_else(|| format!("invalid priority '{value}'"))?;
            }
            "--clear" => options.clear = true,
            other => return Err(format!("logcat: unexpected argument '{other}'")),
        }
    }
    Ok(options)
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adbridge")
        .join("devices.json")
}

/// Prints a single updating progress line on stderr.
fn progress_printer(label: String) -> TransferOptions {
    TransferOptions::default().on_progress(move |p: TransferProgress| match p.fraction() {
        Some(fraction) => eprint!(
            "\r{label}: {} / {} ({:.0}%)",
            display_size(p.bytes_transferred),
            display_size(p.total_bytes),
            fraction * 100.0
        ),
        None => eprint!("\r{label}: {}", display_size(p.bytes_transferred)),
    })
}

async fn open_device(server: &AdbServer, serial: &str) -> Result<AdbDevice> {
    server.ensure_running().await?;
    let device = if serial == "any" {
        server.get_any_online_device().await?
    } else {
        server.get_device(serial).await?
    };
    Ok(device)
}

async fn run(args: Args, settings: Settings, cancel: CancellationToken) -> Result<()> {
    let server = AdbServer::new(&settings);
    match args.command {
        Command::Devices => {
            server.ensure_running().await?;
            println!("List of devices attached");
            for device in server.list_devices().await? {
                println!("{:<24} {:<13} {}", device.serial, device.state, device.model);
            }
        }
        Command::Watch => {
            let store = JsonDeviceStore::open(&args.store_path.unwrap_or_else(default_store_path))
                .await
                .context("Failed to open device store")?;
            let mut session = Session::open(&settings, Arc::new(store)).await?;
            let mut updates = session.registry().subscribe();
            let mut states = session.watcher_states();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(device) => println!(
                            "{:<24} {:<13} {}",
                            device.serial(),
                            device.state,
                            device.model
                        ),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed device updates"),
                        Err(RecvError::Closed) => break,
                    },
                    state = states.next() => {
                        if matches!(state, None | Some(WatcherState::Stopped)) {
                            info!("Device watcher stopped");
                            break;
                        }
                    }
                }
            }
            session.close().await;
        }
        Command::Info { serial } => {
            let device = open_device(&server, &serial).await?;
            println!("{}", serde_json::to_string_pretty(device.info())?);
        }
        Command::Shell { serial, command } => {
            let device = open_device(&server, &serial).await?;
            let mut stream = device.open_stream(&command.join(" ")).await?;
            let mut stdout = tokio::io::stdout();
            let copied = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                copied = tokio::io::copy(&mut stream, &mut stdout) => Some(copied),
            };
            stream.close();
            if let Some(copied) = copied {
                copied.context("Failed to stream shell output")?;
            }
        }
        Command::Logcat { serial, options } => {
            let device = open_device(&server, &serial).await?;
            let mut records = device.logcat(&options, cancel.clone()).await?;
            while let Some(record) = records.next().await {
                println!("{record}");
            }
        }
        Command::Push { serial, local, remote } => {
            let device = open_device(&server, &serial).await?;
            let options = progress_printer(format!("push {}", local.display()));
            device.upload_file(&cancel, &local, &remote, options).await?;
            eprintln!();
        }
        Command::Pull { serial, remote, local } => {
            let device = open_device(&server, &serial).await?;
            let options = progress_printer(format!("pull {remote}"));
            let size = device.download_file(&cancel, &remote, &local, options).await?;
            eprintln!();
            info!(size = %display_size(size), local = %local.display(), "Pulled file");
        }
        Command::Install { serial, apk } => {
            let device = open_device(&server, &serial).await?;
            let options = InstallOptions {
                transfer: progress_printer(format!("stage {}", apk.display())),
                ..Default::default()
            };
            let output = device.install_apk(&cancel, &apk, options).await;
            eprintln!();
            println!("{}", output?);
        }
        Command::Screenshot { serial, out } => {
            let device = open_device(&server, &serial).await?;
            let shot = device.screenshot(ScreenshotOptions::default()).await?;
            fs_err::tokio::write(&out, shot.as_bytes()).await?;
            let size = display_size(shot.as_bytes().len() as u64);
            info!(path = %out.display(), %size, "Saved screenshot");
        }
        Command::KillServer => server.stop().await,
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("error: {message}\n");
            }
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    let settings = match args.settings_path.clone().or_else(default_settings_path) {
        Some(path) => match load_settings(&path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("error: {e:#}");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    let _guard = match setup_logging(&settings) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: failed to set up logging: {e:#}");
            None
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    match run(args, settings, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = e.as_ref() as &dyn Error, "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
