use anyhow::Result;

use crate::audio::capture::Microphone;
use crate::engine::{LiveConfig, LiveConnector};
use crate::lesson::system_instruction;
use crate::session::{SessionEvent, SessionState, SessionUpdate};
use crate::state::AppState;

const MIC_HELP: &str = "Please allow microphone access to talk to the teacher! 🎙️";

fn live_config<C: LiveConnector, M: Microphone>(state: &AppState<C, M>) -> Result<LiveConfig> {
    let unit = state
        .current_unit()
        .ok_or_else(|| anyhow::anyhow!("Unit {} is not in the curriculum", state.settings.lesson.unit))?;
    Ok(LiveConfig {
        model: state.settings.gemini.live_model.clone(),
        voice: state.settings.gemini.voice.clone(),
        system_instruction: system_instruction(unit, state.settings.lesson.mode),
    })
}

/// Start or stop the live conversation with the teacher
pub fn do_toggle_talk<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>) -> Result<String> {
    let starting = !state.session.state().is_live();
    if starting {
        if !state.progress.in_lesson() {
            anyhow::bail!("Start a lesson before talking to the teacher");
        }
        if state.is_generating {
            anyhow::bail!("Cannot talk yet: the teacher is still preparing this step");
        }
    }

    let config = live_config(state)?;
    if starting {
        // Pending or playing one-shot speech must not resume under the live stream.
        state.speech_ticket += 1;
        state.is_audio_playing = false;
    }

    match state.session.toggle(config) {
        Ok(SessionState::Idle) => Ok("🎙️ Microphone off.".to_string()),
        Ok(_) => Ok("🎙️ Connecting to the teacher...".to_string()),
        Err(e) => {
            tracing::error!("Failed to start mic: {:#}", e);
            anyhow::bail!("{} ({})", MIC_HELP, e)
        }
    }
}

pub fn on_session_event<C: LiveConnector, M: Microphone>(
    state: &mut AppState<C, M>,
    event: SessionEvent,
) -> Option<String> {
    match state.session.handle_event(event)? {
        SessionUpdate::Active => Some(format!("🎙️ {}", state.settings.lesson.mode.listening_prompt())),
        SessionUpdate::Ended { error: Some(e) } => Some(format!("Live session ended: {}", e)),
        SessionUpdate::Ended { error: None } => Some("🎙️ The teacher hung up.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::commands::lesson::{do_next_step, do_say, do_start_lesson};
    use crate::commands::testing::harness;
    use crate::engine::LiveEvent;
    use crate::lesson::TeachingMode;
    use crate::state::AppStatus;

    #[tokio::test]
    async fn talk_is_refused_outside_a_lesson_or_while_generating() {
        let mut h = harness();
        assert!(do_toggle_talk(&mut h.state).is_err());

        do_start_lesson(&mut h.state).unwrap();
        assert!(do_toggle_talk(&mut h.state).is_err());
        assert_eq!(h.mic.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn talk_opens_session_and_blocks_other_commands() {
        let mut h = harness();
        h.state.settings.lesson.mode = TeachingMode::English;
        do_start_lesson(&mut h.state).unwrap();
        h.settle().await;

        do_toggle_talk(&mut h.state).unwrap();
        assert_eq!(h.state.status(), AppStatus::Listening);
        assert!(!h.state.is_audio_playing);
        assert!(do_next_step(&mut h.state).is_err());
        assert!(do_say(&mut h.state).is_err());

        let connected = h.session_events.recv().await.unwrap();
        assert_eq!(on_session_event(&mut h.state, connected), None);
        let remote = h.connector.take_remote();
        remote.events.send(LiveEvent::SetupComplete).unwrap();
        let opened = h.session_events.recv().await.unwrap();
        assert_eq!(
            on_session_event(&mut h.state, opened).as_deref(),
            Some("🎙️ I am listening! Go ahead!")
        );

        // Speech synthesized before the session opened is never played.
        h.settle().await;
        let snapshot = h.state.playback.snapshot().await.unwrap();
        assert_eq!(snapshot.active_sources, 0);
        assert_eq!(snapshot.stream_generation, Some(1));

        do_toggle_talk(&mut h.state).unwrap();
        assert_eq!(h.state.status(), AppStatus::Idle);
        assert_eq!(h.mic.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn microphone_failure_is_reported() {
        let mut h = harness();
        do_start_lesson(&mut h.state).unwrap();
        h.settle().await;

        let mut state = h.state;
        // Swap in a microphone that refuses to open.
        let failing = crate::session::tests::FakeMicrophone {
            fail: true,
            ..Default::default()
        };
        let (session, _events) = crate::session::SessionController::new(
            std::sync::Arc::clone(&h.connector),
            failing,
            state.playback.clone(),
        );
        state.session = session;

        let err = do_toggle_talk(&mut state).unwrap_err();
        assert!(err.to_string().starts_with("Please allow microphone access"));
        assert_eq!(state.status(), AppStatus::Idle);
    }

    #[tokio::test]
    async fn back_closes_the_live_session() {
        let mut h = harness();
        do_start_lesson(&mut h.state).unwrap();
        h.settle().await;
        do_toggle_talk(&mut h.state).unwrap();

        crate::commands::lesson::do_back(&mut h.state);
        assert_eq!(h.state.session.state(), SessionState::Idle);
        assert!(!h.state.progress.in_lesson());
    }
}
