//! Command-line definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use smfplay::BackendKind;
use smfplay::timing::LagPolicy;

#[derive(Parser)]
#[command(name = "smfplay", version)]
#[command(about = "Load and play Standard MIDI Files in real time")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Play a MIDI file through an output backend
    Play(PlayArgs),

    /// Load a MIDI file and print a summary
    Info {
        file: PathBuf,

        /// Drop note-ons below this velocity
        #[arg(long, short = 't', default_value_t = 0)]
        threshold: u8,

        /// Decode at most this many tracks
        #[arg(long)]
        tracks: Option<usize>,
    },

    /// List the devices a backend can open
    Devices {
        #[arg(long, value_enum, default_value_t = BackendArg::Midi)]
        backend: BackendArg,
    },
}

#[derive(Args)]
pub struct PlayArgs {
    pub file: PathBuf,

    /// RON player config; command-line flags override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Drop note-ons below this velocity
    #[arg(long, short = 't')]
    pub threshold: Option<u8>,

    #[arg(long)]
    pub tracks: Option<usize>,

    #[arg(long, short)]
    pub speed: Option<f64>,

    #[arg(long, value_enum)]
    pub lag: Option<LagArg>,

    #[arg(long, short, value_enum)]
    pub backend: Option<BackendArg>,

    /// MIDI output port, by index or name fragment
    #[arg(long, short)]
    pub port: Option<String>,

    /// Reload and restart when the file changes on disk
    #[arg(long, short)]
    pub watch: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LagArg {
    Throttle,
    Skip,
}

impl From<LagArg> for LagPolicy {
    fn from(arg: LagArg) -> Self {
        match arg {
            LagArg::Throttle => LagPolicy::Throttle,
            LagArg::Skip => LagPolicy::Skip,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Midi,
    Synth,
    Null,
}

impl BackendArg {
    pub fn into_kind(self, port: Option<String>) -> BackendKind {
        match self {
            BackendArg::Midi => BackendKind::Midi { port },
            BackendArg::Synth => BackendKind::Synth,
            BackendArg::Null => BackendKind::Null,
        }
    }
}
