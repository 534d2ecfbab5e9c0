//! `chorus`: persona reservation and streaming speech from the command line.
//!
//! Every invocation is one session (derived from the terminal environment).
//! Persona commands work on the shared registry under `persona.state_dir`;
//! `say` synthesizes through the configured backend and plays or writes the
//! result before exiting.

mod config;

use chorus_persona::{session_from_env, FileRegistryStore, PersonaRegistry, StoreError};
use chorus_types::{AudioFormat, PersonaId, PersonaProfile};
use chorus_voice::{
    AudioSink, HttpSynthesisBackend, MemorySink, SayOptions, SpeechService, SplitMode, SynthesisBackend,
    VoiceError, VoiceRequest, VoiceResolver,
};
use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Persona-aware streaming text-to-speech.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: $CHORUS_CONFIG_PATH, then chorus.toml).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Speak text, from the argument or stdin
    Say(SayArgs),

    /// Reserve a persona for this session, or a random free one
    Assign {
        persona: Option<String>,
    },

    /// Release this session's persona
    Release,

    /// Show this session's persona
    Status,

    /// List personas and who holds them
    List,

    /// Refresh this session's lease
    Renew,

    /// Drop every reservation of every session
    ClearAll,

    /// List the backend's speakers and styles
    Voices,
}

#[derive(Args, Debug)]
struct SayArgs {
    /// Text to speak; read from stdin when omitted
    text: Option<String>,

    /// Persona to speak with instead of the session's
    #[arg(short, long)]
    voice: Option<String>,

    /// Speaking style of the persona
    #[arg(short, long)]
    style: Option<String>,

    /// Speaking rate in words per minute
    #[arg(short, long, conflicts_with = "factor")]
    rate: Option<u32>,

    /// Relative speed (1.0 is normal)
    #[arg(long)]
    factor: Option<f64>,

    /// Chunking: none, small, medium, large, punctuation
    #[arg(long)]
    split: Option<SplitMode>,

    /// Write a WAV file instead of playing
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error("failed to read stdin: {0}")]
    Stdin(#[from] std::io::Error),

    #[error("this build has no audio device support; use --output")]
    NoDevice,
}

fn resolve_config_path(flag: Option<&str>) -> (String, &'static str) {
    if let Some(path) = flag.filter(|value| !value.trim().is_empty()) {
        return (path.to_string(), "cli-arg");
    }

    if let Ok(path) = std::env::var("CHORUS_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("chorus.toml".to_string(), "default")
}

fn init_tracing(config: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output.
    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, config_source) = resolve_config_path(cli.config.as_deref());

    let config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chorus: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.logging);
    tracing::debug!(source = config_source, path = %config_path, "resolved configuration path");

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("chorus: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Personas from the config, or from the backend's speaker list.
async fn load_catalog(config: &Config, backend: &dyn SynthesisBackend) -> Result<Vec<PersonaProfile>, CliError> {
    if !config.persona.catalog.is_empty() {
        return Ok(config.persona.catalog.clone());
    }
    let speakers = backend.speakers().await?;
    Ok(speakers.into_iter().map(PersonaProfile::from).collect())
}

fn open_sink(command: &Command, format: AudioFormat) -> Result<Arc<dyn AudioSink>, CliError> {
    let plays = matches!(command, Command::Say(args) if args.output.is_none());
    if !plays {
        return Ok(Arc::new(MemorySink::new(format)));
    }
    #[cfg(feature = "device")]
    {
        Ok(Arc::new(chorus_voice::CpalSink::open(format)?))
    }
    #[cfg(not(feature = "device"))]
    {
        Err(CliError::NoDevice)
    }
}

async fn run(command: Command, config: Config) -> Result<(), CliError> {
    let backend = Arc::new(HttpSynthesisBackend::new(config.voice.synthesis.clone())?);
    let needs_catalog = matches!(command, Command::Say(_) | Command::Assign { .. } | Command::List);
    let catalog = if needs_catalog {
        load_catalog(&config, backend.as_ref()).await?
    } else {
        config.persona.catalog.clone()
    };

    let store = FileRegistryStore::open(&config.persona.state_dir)?;
    let registry = PersonaRegistry::new(Arc::new(store), catalog)
        .with_lease_timeout(config.persona.lease_timeout());
    let session = session_from_env();
    tracing::debug!(session = %session, state_dir = %config.persona.state_dir.display(), "session");

    let resolver = VoiceResolver::new(registry, session)
        .with_fallback(config.persona.default_persona.clone(), config.persona.allow_fallback);
    let format = AudioFormat {
        sample_rate: config.voice.synthesis.sample_rate,
        channels: 1,
    };
    let sink = open_sink(&command, format)?;
    let service = SpeechService::new(&config.voice, resolver, backend, sink)?;

    match command {
        Command::Say(args) => say(&service, args).await,
        Command::Assign { persona } => {
            let reservation = service.assign(persona.map(PersonaId::new)).await?;
            if let Some(previous) = &reservation.released {
                println!("released {previous}");
            }
            if reservation.already_held {
                println!("already holding {}", reservation.lease.persona_id);
            } else {
                println!("assigned {}", reservation.lease.persona_id);
            }
            Ok(())
        }
        Command::Release => {
            let persona = service.release().await?;
            println!("released {persona}");
            Ok(())
        }
        Command::Status => {
            match service.status().await? {
                Some(lease) => println!(
                    "{} (session {}, since {})",
                    lease.persona_id,
                    lease.session,
                    lease.reserved_at.to_rfc3339()
                ),
                None => println!("no persona assigned to session {}", service.session()),
            }
            Ok(())
        }
        Command::List => {
            let availability = service.availability().await?;
            for profile in service.catalog() {
                match availability.busy.get(&profile.id) {
                    Some(holder) if holder == service.session() => println!("{}\tyours", profile.id),
                    Some(holder) => println!("{}\tbusy ({holder})", profile.id),
                    None => println!("{}\tavailable", profile.id),
                }
            }
            Ok(())
        }
        Command::Renew => {
            let lease = service.renew().await?;
            println!("renewed {}", lease.persona_id);
            Ok(())
        }
        Command::ClearAll => {
            service.clear_all().await?;
            println!("cleared all reservations");
            Ok(())
        }
        Command::Voices => {
            for speaker in service.voices().await? {
                let styles: Vec<String> = speaker
                    .styles
                    .iter()
                    .map(|s| format!("{}={}", s.style_name, s.style_id))
                    .collect();
                println!("{}\t{}\t{}", speaker.speaker_name, speaker.speaker_uuid, styles.join(","));
            }
            Ok(())
        }
    }
}

async fn say(service: &SpeechService, args: SayArgs) -> Result<(), CliError> {
    let text = match args.text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let options = SayOptions {
        voice: VoiceRequest {
            persona: args.voice.map(PersonaId::new),
            style: args.style,
            rate: args.rate,
            factor: args.factor,
        },
        split_mode: args.split,
        output: args.output.clone(),
    };

    let task = service.say_and_wait(&text, &options).await?;
    tracing::debug!(task_id = %task, "utterance finished");
    if let Some(path) = args.output {
        println!("{}", path.display());
    }
    Ok(())
}
