mod cli;

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam::channel::RecvTimeoutError;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::{cursor, queue, terminal};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing_subscriber::EnvFilter;

use smfplay::backend::{self, BackendKind};
use smfplay::{
    EngineCommand, EngineHandle, EngineUpdate, LoadOptions, LoadProgress, PlayerConfig,
    PlayerState, Timeline, load_file, spawn_engine,
};

use cli::{Cli, Commands, PlayArgs};

const STATUS_INTERVAL: Duration = Duration::from_millis(100);
const SPEED_STEP: f64 = 1.25;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("smfplay=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Play(args) => play(args),
        Commands::Info {
            file,
            threshold,
            tracks,
        } => info(&file, threshold, tracks),
        Commands::Devices { backend } => {
            devices(&backend.into_kind(None));
            Ok(())
        }
    }
}

fn info(path: &Path, threshold: u8, tracks: Option<usize>) -> Result<()> {
    let options = LoadOptions {
        velocity_threshold: threshold,
        track_limit: tracks.unwrap_or(usize::MAX),
    };
    let timeline = load_file(path, &options, &LoadProgress::default())
        .with_context(|| format!("load {}", path.display()))?;
    print_summary(path, &timeline);
    Ok(())
}

fn devices(kind: &BackendKind) {
    let devices = backend::create(kind).enumerate_devices();
    if devices.is_empty() {
        println!("no devices found");
    }
    for device in devices {
        println!("{:>3}: {}", device.index, device.name);
    }
}

fn print_summary(path: &Path, timeline: &Timeline) {
    let header = &timeline.header;
    println!("{}", path.display());
    println!("  format       {}", header.format);
    println!("  ppq          {}", header.ppq);
    println!(
        "  tracks       {} declared, {} indexed, {} decoded",
        header.declared_tracks, timeline.tracks_indexed, timeline.tracks_decoded
    );
    println!("  events       {}", timeline.events.len());
    println!(
        "  notes        {} of {} loaded",
        timeline.notes_loaded, timeline.notes_total
    );
    println!("  tempo events {}", timeline.tempo.len());
    println!(
        "  initial bpm  {:.2}",
        smfplay::events::micros_to_bpm(timeline.tempo.micros_per_quarter_at(0))
    );
    println!("  max tick     {}", timeline.max_tick);
    println!("  duration     {:.2}s", timeline.duration_seconds());
}

fn print_load_progress(out: &mut impl Write, progress: &LoadProgress) -> Result<()> {
    let tracks = progress.tracks();
    if tracks.is_empty() {
        return Ok(());
    }
    let done = tracks.iter().filter(|t| t.is_finished()).count();
    let fraction = tracks.iter().map(|t| t.fraction()).sum::<f64>() / tracks.len() as f64;
    clear_line(out)?;
    write!(
        out,
        "loading {done}/{} tracks {:>3.0}%  {} notes",
        tracks.len(),
        fraction * 100.0,
        progress.notes_loaded()
    )?;
    out.flush()?;
    Ok(())
}

fn clear_line(out: &mut impl Write) -> Result<()> {
    queue!(
        out,
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    Ok(())
}

fn player_config(args: &PlayArgs) -> Result<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PlayerConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.velocity_threshold = threshold;
    }
    if let Some(tracks) = args.tracks {
        config.track_limit = tracks;
    }
    if let Some(speed) = args.speed {
        config.speed = speed;
    }
    if let Some(lag) = args.lag {
        config.lag_policy = lag.into();
    }
    if let Some(backend) = args.backend {
        config.backend = backend.into_kind(args.port.clone());
    } else if let (Some(port), BackendKind::Midi { .. }) = (&args.port, &config.backend) {
        config.backend = BackendKind::Midi {
            port: Some(port.clone()),
        };
    }
    Ok(config.normalized())
}

fn play(args: PlayArgs) -> Result<()> {
    let config = player_config(&args)?;
    let mut speed = config.speed;
    let handle = spawn_engine(config).context("start engine")?;

    handle
        .command_tx
        .send(EngineCommand::Load(args.file.clone()))?;
    let mut stderr = io::stderr();
    loop {
        match handle.update_rx.recv_timeout(STATUS_INTERVAL) {
            Ok(EngineUpdate::Loaded { path, timeline }) => {
                clear_line(&mut stderr)?;
                print_summary(&path, &timeline);
                break;
            }
            Ok(EngineUpdate::Error { message }) => {
                clear_line(&mut stderr)?;
                bail!("{message}");
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => print_load_progress(&mut stderr, &handle.progress)?,
            Err(RecvTimeoutError::Disconnected) => bail!("engine stopped while loading"),
        }
    }

    let _watcher = if args.watch {
        Some(watch(&handle, &args.file)?)
    } else {
        None
    };

    handle.command_tx.send(EngineCommand::Play)?;
    println!("space: pause/resume  +/-: speed  q: quit");

    terminal::enable_raw_mode()?;
    let result = interact(&handle, &mut speed, args.watch);
    terminal::disable_raw_mode()?;
    println!();

    // Wait for the stop to be drained so all-notes-off reaches the device.
    if handle.telemetry.state() != PlayerState::Idle
        && handle.command_tx.send(EngineCommand::Stop).is_ok()
    {
        while let Ok(update) = handle.update_rx.recv_timeout(Duration::from_secs(1)) {
            if matches!(update, EngineUpdate::PlaybackState { state: PlayerState::Idle }) {
                break;
            }
        }
    }
    result
}

fn watch(handle: &EngineHandle, path: &Path) -> Result<RecommendedWatcher> {
    let command_tx = handle.command_tx.clone();
    let reload_path = path.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) if event.kind.is_modify() => {
                tracing::info!(path = %reload_path.display(), "file changed, reloading");
                let _ = command_tx.send(EngineCommand::Load(reload_path.clone()));
                let _ = command_tx.send(EngineCommand::Play);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "watch error"),
        },
        Config::default(),
    )
    .context("create file watcher")?;
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", path.display()))?;
    Ok(watcher)
}

fn interact(handle: &EngineHandle, speed: &mut f64, watching: bool) -> Result<()> {
    let mut stdout = io::stdout();
    loop {
        if event::poll(STATUS_INTERVAL)?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char(' ') => {
                    let command = match handle.telemetry.state() {
                        PlayerState::Paused => EngineCommand::Resume,
                        _ => EngineCommand::Pause,
                    };
                    handle.command_tx.send(command)?;
                }
                KeyCode::Char('+') | KeyCode::Char('=') => {
                    *speed *= SPEED_STEP;
                    handle.command_tx.send(EngineCommand::SetSpeed(*speed))?;
                }
                KeyCode::Char('-') => {
                    *speed /= SPEED_STEP;
                    handle.command_tx.send(EngineCommand::SetSpeed(*speed))?;
                }
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(()),
                _ => {}
            }
        }

        for update in handle.update_rx.try_iter() {
            match update {
                EngineUpdate::Finished { outcome } if !watching => {
                    tracing::debug!(?outcome, "playback over");
                    return Ok(());
                }
                EngineUpdate::Error { message } => {
                    queue!(stdout, cursor::MoveToColumn(0))?;
                    write!(stdout, "error: {message}\r\n")?;
                }
                _ => {}
            }
        }

        let status = handle.telemetry.snapshot();
        clear_line(&mut stdout)?;
        write!(
            stdout,
            "{:?}  tick {:>8.0}/{}  {:>6.1} bpm  x{:.2}  sent {}  dropped {}",
            status.state,
            status.current_tick,
            status.max_tick,
            status.bpm,
            speed,
            status.dispatched,
            status.dropped
        )?;
        stdout.flush()?;
    }
}
