//! Console commands. Each `do_*` handler validates the current state, applies
//! the change and returns the text to show; background completions come back
//! through the `on_*` handlers.

pub mod lesson;
pub mod live;
pub mod settings;

use anyhow::Result;

use crate::audio::capture::Microphone;
use crate::engine::LiveConnector;
use crate::lesson::TeachingMode;
use crate::state::{AppEvent, AppState};

pub const HELP: &str = "Commands:
  start         start the lesson for the selected unit
  next          go to the next step
  say           hear the current step again
  talk          start or stop talking to the teacher
  mode <m>      arabic | english
  unit <n>      choose a unit (1-6)
  units         list the units
  status        show what is happening
  back          leave the lesson
  quit          exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Next,
    Say,
    Talk,
    Mode(TeachingMode),
    Unit(u32),
    Units,
    Status,
    Back,
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();

    let command = match (verb.to_ascii_lowercase().as_str(), arg) {
        ("start", _) => Command::Start,
        ("next", _) | ("n", _) => Command::Next,
        ("say", _) | ("repeat", _) => Command::Say,
        ("talk", _) | ("mic", _) => Command::Talk,
        ("mode", Some(mode)) => Command::Mode(mode.parse()?),
        ("mode", None) => anyhow::bail!("Usage: mode <arabic|english>"),
        ("unit", Some(n)) => Command::Unit(
            n.parse()
                .map_err(|_| anyhow::anyhow!("Unit must be a number, got '{}'", n))?,
        ),
        ("unit", None) => anyhow::bail!("Usage: unit <number>"),
        ("units", _) => Command::Units,
        ("status", _) => Command::Status,
        ("back", _) => Command::Back,
        ("help", _) | ("?", _) => Command::Help,
        ("quit", _) | ("exit", _) | ("q", _) => Command::Quit,
        (other, _) => anyhow::bail!("Unknown command '{}'. Type 'help' for a list.", other),
    };
    Ok(Some(command))
}

/// Run one command. `Quit` is handled by the caller.
pub async fn dispatch<C, M>(state: &mut AppState<C, M>, command: Command) -> Result<String>
where
    C: LiveConnector,
    M: Microphone,
{
    match command {
        Command::Start => lesson::do_start_lesson(state),
        Command::Next => lesson::do_next_step(state),
        Command::Say => lesson::do_say(state),
        Command::Talk => live::do_toggle_talk(state),
        Command::Mode(mode) => settings::do_set_mode(state, mode),
        Command::Unit(unit) => settings::do_set_unit(state, unit),
        Command::Units => Ok(settings::list_units(state)),
        Command::Status => Ok(settings::describe_status(state).await),
        Command::Back => Ok(lesson::do_back(state)),
        Command::Help | Command::Quit => Ok(HELP.to_string()),
    }
}

pub fn on_app_event<C, M>(state: &mut AppState<C, M>, event: AppEvent) -> Option<String>
where
    C: LiveConnector,
    M: Microphone,
{
    match event {
        AppEvent::StepGenerated { ticket, step, text } => {
            lesson::on_step_generated(state, ticket, step, text)
        }
        AppEvent::SpeechReady { ticket, result } => lesson::on_speech_ready(state, ticket, result),
        AppEvent::SpeechFinished { ticket } => {
            lesson::on_speech_finished(state, ticket);
            None
        }
    }
}
