//! Console front end: wires devices and remote clients together and runs the
//! single task that owns the application state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::audio::capture::CpalMicrophone;
use crate::audio::output::CpalOutput;
use crate::audio::playback::spawn_playback;
use crate::cli::Args;
use crate::commands::{self, live, Command};
use crate::engine::gemini::GeminiClient;
use crate::engine::gemini_live::GeminiLiveConnector;
use crate::lesson::{load_curriculum, LessonProgress};
use crate::persistence;
use crate::session::SessionController;
use crate::state::{AppState, Settings};

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(unit) = args.unit {
        settings.lesson.unit = unit;
    }
    if let Some(mode) = args.mode {
        settings.lesson.mode = mode;
    }
}

pub async fn run(args: Args) -> Result<()> {
    tracing::info!("Starting Classroom Tutor v{}", env!("CARGO_PKG_VERSION"));

    let api_key = args
        .resolve_api_key()
        .context("No API key found. Set GEMINI_API_KEY or pass --api-key.")?;

    let settings_path = if args.no_save {
        None
    } else {
        persistence::settings_path()
    };
    let mut settings = settings_path
        .as_deref()
        .map(persistence::load_settings)
        .unwrap_or_default();
    apply_overrides(&mut settings, &args);

    let curriculum = load_curriculum().context("Built-in curriculum is malformed")?;
    if curriculum.unit(settings.lesson.unit).is_none() {
        tracing::warn!("Unit {} does not exist; using unit 1", settings.lesson.unit);
        settings.lesson.unit = 1;
    }

    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let output = CpalOutput::open(finished_tx).context("Failed to open the audio output device")?;
    let (playback, playback_task) = spawn_playback(output, finished_rx);

    let client = Arc::new(GeminiClient::new(
        api_key.clone(),
        settings.gemini.speech_model.clone(),
    ));
    let connector = Arc::new(GeminiLiveConnector::new(api_key));
    let (session, mut session_events) =
        SessionController::new(connector, CpalMicrophone::new(), playback.clone());
    let (events_tx, mut app_events) = mpsc::unbounded_channel();

    let mut state = AppState {
        settings,
        settings_path,
        curriculum,
        progress: LessonProgress::default(),
        content: None,
        is_generating: false,
        is_audio_playing: false,
        step_ticket: 0,
        speech_ticket: 0,
        generator: client.clone(),
        synthesizer: client,
        playback,
        session,
        events_tx,
        save_speech_to: args.save_speech.clone(),
    };

    println!("👩‍🏫 Primary 1 English, Term 1");
    println!("{}", commands::settings::list_units(&state));
    println!("{}", commands::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                match commands::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => match commands::dispatch(&mut state, command).await {
                        Ok(message) => println!("{}", message),
                        Err(e) => println!("⚠️  {}", e),
                    },
                    Err(e) => println!("⚠️  {}", e),
                }
            }
            Some(event) = app_events.recv() => {
                if let Some(message) = commands::on_app_event(&mut state, event) {
                    println!("{}", message);
                }
            }
            Some(event) = session_events.recv() => {
                if let Some(message) = live::on_session_event(&mut state, event) {
                    println!("{}", message);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down");
    state.session.stop();
    state.playback.stop_all();
    drop(state);
    if tokio::time::timeout(Duration::from_secs(2), playback_task).await.is_err() {
        tracing::warn!("Playback did not stop in time");
    }
    println!("Goodbye! 👋");
    Ok(())
}
