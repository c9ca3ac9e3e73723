use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwapOption;
use crossbeam::channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::backend::{self, Backend, BackendKind};
use crate::config::PlayerConfig;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::smf::{LoadProgress, Timeline, load_file};
use crate::telemetry::{PlayerState, Telemetry};
use crate::timing::{PlaybackControls, PlaybackOutcome, Scheduler};

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Load(PathBuf),
    Unload,
    Play,
    Pause,
    Resume,
    Stop,
    SetSpeed(f64),
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    Loaded {
        path: PathBuf,
        timeline: Arc<Timeline>,
    },
    Unloaded,
    PlaybackState {
        state: PlayerState,
    },
    Finished {
        outcome: PlaybackOutcome,
    },
    Error {
        message: String,
    },
}

/// Builds the backend for each new dispatch session.
pub type BackendFactory = Arc<dyn Fn(&BackendKind) -> Box<dyn Backend> + Send + Sync>;

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    pub telemetry: Arc<Telemetry>,
    pub progress: Arc<LoadProgress>,
    timeline: Arc<ArcSwapOption<Timeline>>,
}

impl EngineHandle {
    /// The timeline currently loaded, if any.
    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.timeline.load_full()
    }
}

pub fn spawn_engine(config: PlayerConfig) -> io::Result<EngineHandle> {
    spawn_engine_with(config, Arc::new(backend::create))
}

/// Starts the engine thread. It runs until every command sender is dropped.
pub fn spawn_engine_with(
    config: PlayerConfig,
    factory: BackendFactory,
) -> io::Result<EngineHandle> {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();
    let (done_tx, done_rx) = crossbeam::channel::unbounded();

    let telemetry = Telemetry::new();
    let progress = LoadProgress::new();
    let timeline = Arc::new(ArcSwapOption::empty());

    let config = config.normalized();
    let engine = Engine {
        speed: config.speed,
        config,
        factory,
        telemetry: telemetry.clone(),
        progress: progress.clone(),
        timeline: timeline.clone(),
        dispatcher: None,
        playback: None,
        generation: 0,
        update_tx,
        done_tx,
    };

    thread::Builder::new()
        .name("smfplay-engine".into())
        .spawn(move || engine.run(command_rx, done_rx))?;

    Ok(EngineHandle {
        command_tx,
        update_rx,
        telemetry,
        progress,
        timeline,
    })
}

struct Playback {
    generation: u64,
    controls: Arc<PlaybackControls>,
    handle: JoinHandle<PlaybackOutcome>,
}

struct Engine {
    config: PlayerConfig,
    factory: BackendFactory,
    telemetry: Arc<Telemetry>,
    progress: Arc<LoadProgress>,
    timeline: Arc<ArcSwapOption<Timeline>>,
    dispatcher: Option<Dispatcher>,
    playback: Option<Playback>,
    generation: u64,
    speed: f64,
    update_tx: Sender<EngineUpdate>,
    done_tx: Sender<(u64, PlaybackOutcome)>,
}

impl Engine {
    fn run(
        mut self,
        command_rx: Receiver<EngineCommand>,
        done_rx: Receiver<(u64, PlaybackOutcome)>,
    ) {
        info!(backend = ?self.config.backend, "engine started");
        loop {
            crossbeam::select! {
                recv(command_rx) -> command => match command {
                    Ok(command) => self.handle(command),
                    Err(_) => break,
                },
                recv(done_rx) -> done => {
                    if let Ok((generation, outcome)) = done {
                        self.on_done(generation, outcome);
                    }
                }
            }
        }
        self.stop();
        info!("engine stopped");
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Load(path) => {
                if let Err(e) = self.load(&path) {
                    self.report(e);
                }
            }
            EngineCommand::Unload => {
                self.stop();
                self.timeline.store(None);
                self.send(EngineUpdate::Unloaded);
            }
            EngineCommand::Play => {
                if let Err(e) = self.play() {
                    self.report(e);
                }
            }
            EngineCommand::Pause => {
                if let Some(playback) = &self.playback {
                    playback.controls.pause();
                    self.send_state(PlayerState::Paused);
                }
            }
            EngineCommand::Resume => self.resume(),
            EngineCommand::Stop => self.stop(),
            EngineCommand::SetSpeed(speed) => {
                if !speed.is_finite() || speed <= 0.0 {
                    warn!(speed, "ignoring invalid speed");
                    return;
                }
                self.speed = speed;
                if let Some(playback) = &self.playback {
                    playback.controls.set_speed(speed);
                }
            }
        }
    }

    fn load(&mut self, path: &Path) -> Result<(), EngineError> {
        self.stop();
        self.telemetry.set_state(PlayerState::Loading);
        self.send_state(PlayerState::Loading);

        let result = load_file(path, &self.config.load_options(), &self.progress);
        self.telemetry.set_state(PlayerState::Idle);
        self.send_state(PlayerState::Idle);

        let timeline = Arc::new(result?);
        self.timeline.store(Some(timeline.clone()));
        self.send(EngineUpdate::Loaded {
            path: path.to_path_buf(),
            timeline,
        });
        Ok(())
    }

    fn play(&mut self) -> Result<(), EngineError> {
        if self.playback.is_some() {
            self.resume();
            return Ok(());
        }
        let timeline = self.timeline.load_full().ok_or(EngineError::NoTimeline)?;

        let dispatcher = self
            .dispatcher
            .get_or_insert_with(|| Dispatcher::new(self.config.dispatch_config()));
        let backend = (self.factory)(&self.config.backend);
        let producer = dispatcher.init(backend, self.telemetry.ring.clone())?;

        let controls = PlaybackControls::new(self.speed);
        let mut scheduler_config = self.config.scheduler_config();
        scheduler_config.speed = self.speed;
        let scheduler = Scheduler::new(
            timeline,
            producer,
            controls.clone(),
            self.telemetry.clone(),
            scheduler_config,
        );

        self.generation += 1;
        let generation = self.generation;
        let done_tx = self.done_tx.clone();
        let handle = scheduler
            .spawn(move |outcome| {
                let _ = done_tx.send((generation, outcome));
            })
            .map_err(EngineError::Spawn);
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.close_dispatcher();
                return Err(e);
            }
        };

        self.playback = Some(Playback {
            generation,
            controls,
            handle,
        });
        self.send_state(PlayerState::Playing);
        Ok(())
    }

    fn resume(&mut self) {
        if let Some(playback) = &self.playback {
            playback.controls.resume();
            self.send_state(PlayerState::Playing);
        }
    }

    /// Cancels playback and waits for the scheduler, whose all-notes-off
    /// burst is then drained to the backend before the session closes.
    fn stop(&mut self) {
        let Some(playback) = self.playback.take() else {
            return;
        };
        playback.controls.cancel();
        let outcome = self.join(playback);
        self.close_dispatcher();
        self.send(EngineUpdate::Finished { outcome });
        self.send_state(PlayerState::Idle);
    }

    fn on_done(&mut self, generation: u64, outcome: PlaybackOutcome) {
        let current = self.playback.as_ref().map(|p| p.generation);
        if current != Some(generation) {
            return;
        }
        if let Some(playback) = self.playback.take() {
            self.join(playback);
        }
        self.close_dispatcher();
        self.send(EngineUpdate::Finished { outcome });
        self.send_state(PlayerState::Idle);
    }

    fn join(&self, playback: Playback) -> PlaybackOutcome {
        match playback.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("scheduler thread panicked");
                self.telemetry.set_state(PlayerState::Idle);
                PlaybackOutcome::Cancelled
            }
        }
    }

    fn close_dispatcher(&mut self) {
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.close();
        }
    }

    fn report(&self, e: EngineError) {
        warn!(error = %e, "engine command failed");
        self.send(EngineUpdate::Error {
            message: e.to_string(),
        });
    }

    fn send_state(&self, state: PlayerState) {
        self.send(EngineUpdate::PlaybackState { state });
    }

    fn send(&self, update: EngineUpdate) {
        let _ = self.update_tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use crate::events;
    use crate::testutil::{RecordingBackend, four_note_file};

    fn engine(backend: &RecordingBackend) -> EngineHandle {
        let backend = backend.clone();
        let config = PlayerConfig {
            backend: BackendKind::Null,
            ..PlayerConfig::default()
        };
        spawn_engine_with(
            config,
            Arc::new(move |_kind: &BackendKind| Box::new(backend.clone()) as Box<dyn Backend>),
        )
        .unwrap()
    }

    fn temp_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("smfplay-{}-{name}.mid", std::process::id()));
        fs::write(&path, four_note_file()).unwrap();
        path
    }

    fn wait_for(
        handle: &EngineHandle,
        mut wanted: impl FnMut(&EngineUpdate) -> bool,
    ) -> EngineUpdate {
        loop {
            let update = handle
                .update_rx
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            if wanted(&update) {
                return update;
            }
        }
    }

    #[test]
    fn loads_and_plays_to_the_end() {
        let backend = RecordingBackend::default();
        let handle = engine(&backend);
        let path = temp_file("finish");

        handle.command_tx.send(EngineCommand::Load(path.clone())).unwrap();
        let loaded = wait_for(&handle, |u| matches!(u, EngineUpdate::Loaded { .. }));
        if let EngineUpdate::Loaded { timeline, .. } = loaded {
            assert_eq!(timeline.events.len(), 8);
        }
        assert_eq!(handle.timeline().unwrap().max_tick, 1440);

        handle.command_tx.send(EngineCommand::SetSpeed(8.0)).unwrap();
        handle.command_tx.send(EngineCommand::Play).unwrap();
        let finished = wait_for(&handle, |u| matches!(u, EngineUpdate::Finished { .. }));
        let _ = fs::remove_file(&path);

        assert!(matches!(
            finished,
            EngineUpdate::Finished {
                outcome: PlaybackOutcome::Finished
            }
        ));
        assert_eq!(backend.messages().len(), 8);
        assert!(*backend.shut_down.lock());
        assert_eq!(handle.telemetry.dispatched(), 8);
    }

    #[test]
    fn stop_silences_every_channel() {
        let backend = RecordingBackend::default();
        let handle = engine(&backend);
        let path = temp_file("stop");

        handle.command_tx.send(EngineCommand::Load(path.clone())).unwrap();
        wait_for(&handle, |u| matches!(u, EngineUpdate::Loaded { .. }));
        handle.command_tx.send(EngineCommand::Play).unwrap();
        wait_for(&handle, |u| {
            matches!(u, EngineUpdate::PlaybackState { state: PlayerState::Playing })
        });
        handle.command_tx.send(EngineCommand::Stop).unwrap();
        let finished = wait_for(&handle, |u| matches!(u, EngineUpdate::Finished { .. }));
        let _ = fs::remove_file(&path);

        assert!(matches!(
            finished,
            EngineUpdate::Finished {
                outcome: PlaybackOutcome::Cancelled
            }
        ));
        let sent = backend.messages();
        let silence: Vec<u32> = events::all_notes_off().collect();
        assert!(sent.len() >= silence.len());
        assert_eq!(sent[sent.len() - silence.len()..], silence[..]);
    }

    #[test]
    fn play_without_timeline_is_an_error() {
        let handle = engine(&RecordingBackend::default());
        handle.command_tx.send(EngineCommand::Play).unwrap();
        let update = wait_for(&handle, |u| matches!(u, EngineUpdate::Error { .. }));
        if let EngineUpdate::Error { message } = update {
            assert_eq!(message, EngineError::NoTimeline.to_string());
        }
    }

    #[test]
    fn failed_load_keeps_previous_timeline() {
        let handle = engine(&RecordingBackend::default());
        let path = temp_file("keep");
        handle.command_tx.send(EngineCommand::Load(path.clone())).unwrap();
        wait_for(&handle, |u| matches!(u, EngineUpdate::Loaded { .. }));
        let _ = fs::remove_file(&path);

        handle
            .command_tx
            .send(EngineCommand::Load(path.with_extension("missing")))
            .unwrap();
        wait_for(&handle, |u| matches!(u, EngineUpdate::Error { .. }));
        assert!(handle.timeline().is_some());

        handle.command_tx.send(EngineCommand::Unload).unwrap();
        wait_for(&handle, |u| matches!(u, EngineUpdate::Unloaded));
        assert!(handle.timeline().is_none());
    }

    #[test]
    fn unavailable_backend_is_reported() {
        let backend = RecordingBackend {
            fail_init: true,
            ..RecordingBackend::default()
        };
        let handle = engine(&backend);
        let path = temp_file("fail");
        handle.command_tx.send(EngineCommand::Load(path.clone())).unwrap();
        wait_for(&handle, |u| matches!(u, EngineUpdate::Loaded { .. }));
        let _ = fs::remove_file(&path);

        handle.command_tx.send(EngineCommand::Play).unwrap();
        let update = wait_for(&handle, |u| matches!(u, EngineUpdate::Error { .. }));
        assert!(matches!(update, EngineUpdate::Error { message } if message.contains("unavailable")));
    }
}
