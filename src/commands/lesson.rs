use std::sync::Arc;

use anyhow::Result;

use crate::audio::capture::Microphone;
use crate::audio::processing::{decode_pcm16, save_wav};
use crate::audio::{AudioChunk, PLAYBACK_SAMPLE_RATE};
use crate::engine::LiveConnector;
use crate::lesson::{generate_step, speech_prompt, strip_emoji, vocabulary_cards, LessonStep, StepAdvance};
use crate::state::{AppEvent, AppState};

/// Start the selected unit from the first step
pub fn do_start_lesson<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>) -> Result<String> {
    if state.progress.in_lesson() {
        anyhow::bail!("Already in a lesson. Type 'back' to choose another unit.");
    }
    let unit = state
        .current_unit()
        .ok_or_else(|| anyhow::anyhow!("Unit {} is not in the curriculum", state.settings.lesson.unit))?;
    let header = format!("Unit {}: {}", unit.id, unit.title);

    let step = state.progress.start();
    begin_step(state, step)?;
    Ok(format!("{}\n[{}/7] {} ...", header, step.index() + 1, step))
}

pub fn do_next_step<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>) -> Result<String> {
    if !state.progress.in_lesson() {
        anyhow::bail!("No lesson running. Type 'start' first.");
    }
    if state.is_generating {
        anyhow::bail!("Cannot go on: the teacher is still preparing this step");
    }
    if state.is_mic_active() {
        anyhow::bail!("Cannot go on while talking to the teacher. Type 'talk' to stop.");
    }

    match state.progress.next_step() {
        StepAdvance::Next(step) => {
            begin_step(state, step)?;
            Ok(format!("[{}/7] {} ...", step.index() + 1, step))
        }
        StepAdvance::Finished => {
            silence(state);
            state.content = None;
            Ok("Unit finished! Well done! 🌟 Choose a unit and type 'start'.".to_string())
        }
    }
}

/// Replay the current step through speech synthesis
pub fn do_say<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>) -> Result<String> {
    if state.is_audio_playing {
        anyhow::bail!("The teacher is already speaking");
    }
    if state.is_generating {
        anyhow::bail!("The teacher is still preparing this step");
    }
    if state.is_mic_active() {
        anyhow::bail!("Cannot replay while talking to the teacher");
    }
    let Some(content) = state.content.clone() else {
        anyhow::bail!("Nothing to say yet");
    };

    request_speech(state, &content);
    Ok("🔊 Listen...".to_string())
}

/// Leave the lesson: closes any live session and silences all audio.
pub fn do_back<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>) -> String {
    state.session.stop();
    silence(state);
    state.step_ticket += 1;
    state.is_generating = false;
    state.content = None;
    state.progress.leave();
    tracing::info!("Left the lesson");
    "Back to unit selection.".to_string()
}

fn begin_step<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>, step: LessonStep) -> Result<()> {
    let unit = state
        .current_unit()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Unit {} is not in the curriculum", state.settings.lesson.unit))?;

    state.step_ticket += 1;
    state.is_generating = true;
    state.content = None;

    let ticket = state.step_ticket;
    let generator = Arc::clone(&state.generator);
    let model = state.settings.gemini.text_model.clone();
    let mode = state.settings.lesson.mode;
    let events_tx = state.events_tx.clone();

    tracing::info!("Generating step '{}' of unit {}", step, unit.id);
    tokio::spawn(async move {
        let text = generate_step(generator.as_ref(), &model, &unit, mode, step).await;
        let _ = events_tx.send(AppEvent::StepGenerated { ticket, step, text });
    });
    Ok(())
}

pub fn on_step_generated<C: LiveConnector, M: Microphone>(
    state: &mut AppState<C, M>,
    ticket: u64,
    step: LessonStep,
    text: String,
) -> Option<String> {
    if ticket != state.step_ticket {
        tracing::debug!("Discarding stale text for step '{}'", step);
        return None;
    }
    state.is_generating = false;
    state.content = Some(text.clone());
    if state.is_mic_active() {
        return Some(format!("👩‍🏫 {}\n{}", step, text));
    }
    request_speech(state, &text);

    let mut shown = format!("👩‍🏫 {}\n{}", step, text);
    if step == LessonStep::Vocabulary {
        if let Some(unit) = state.current_unit() {
            shown.push_str("\n\n");
            shown.push_str(&vocabulary_cards(unit));
        }
    }
    Some(shown)
}

/// Stop one-shot speech and forget anything still being synthesized.
fn silence<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>) {
    state.speech_ticket += 1;
    state.is_audio_playing = false;
    state.playback.stop_all();
}

fn request_speech<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>, text: &str) {
    state.speech_ticket += 1;
    state.is_audio_playing = true;

    let ticket = state.speech_ticket;
    let synthesizer = Arc::clone(&state.synthesizer);
    let voice = state.settings.gemini.voice.clone();
    let prompt = speech_prompt(&strip_emoji(text));
    let events_tx = state.events_tx.clone();

    tokio::spawn(async move {
        let result = match synthesizer.synthesize(&prompt, &voice).await {
            Ok(Some(payload)) => decode_pcm16(&payload.data, PLAYBACK_SAMPLE_RATE, 1)
                .map(Some)
                .map_err(anyhow::Error::from),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        let _ = events_tx.send(AppEvent::SpeechReady { ticket, result });
    });
}

pub fn on_speech_ready<C: LiveConnector, M: Microphone>(
    state: &mut AppState<C, M>,
    ticket: u64,
    result: Result<Option<AudioChunk>>,
) -> Option<String> {
    if ticket != state.speech_ticket || state.is_mic_active() {
        tracing::debug!("Discarding stale speech");
        return None;
    }

    let chunk = match result {
        Ok(Some(chunk)) => chunk,
        Ok(None) => {
            tracing::warn!("Speech response carried no audio");
            state.is_audio_playing = false;
            return None;
        }
        Err(e) => {
            tracing::error!("TTS error: {:#}", e);
            state.is_audio_playing = false;
            return None;
        }
    };

    if let Some(path) = &state.save_speech_to {
        if let Err(e) = save_wav(path, &chunk) {
            tracing::warn!("Could not save speech: {:#}", e);
        }
    }

    let done = state.playback.play_one_shot(chunk);
    let events_tx = state.events_tx.clone();
    tokio::spawn(async move {
        // Resolves on natural end and on stop alike.
        let _ = done.await;
        let _ = events_tx.send(AppEvent::SpeechFinished { ticket });
    });
    None
}

pub fn on_speech_finished<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>, ticket: u64) {
    if ticket == state.speech_ticket {
        state.is_audio_playing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::harness;
    use crate::lesson::TeachingMode;
    use crate::state::AppStatus;

    #[tokio::test]
    async fn start_generates_first_step_then_speaks_it() {
        let mut h = harness();
        h.state.settings.lesson.mode = TeachingMode::English;

        let shown = do_start_lesson(&mut h.state).unwrap();
        assert!(shown.starts_with("Unit 1: Welcome to My School"));
        assert_eq!(h.state.status(), AppStatus::Generating);

        let shown = h.settle().await.unwrap();
        assert!(shown.contains("Let's do the \"Warm Up\" part of Unit 1."));
        assert!(!h.state.is_generating);
        assert!(h.state.is_audio_playing);

        // Speech arrives and is handed to the playback actor.
        assert_eq!(h.settle().await, None);
        let snapshot = h.state.playback.snapshot().await.unwrap();
        assert_eq!(snapshot.active_sources, 1);
        assert_eq!(snapshot.next_start_time, 0.0);

        let spoken = h.synthesizer.texts.lock().unwrap()[0].clone();
        assert!(spoken.starts_with("You are a friendly Grade 1 teacher. Say this clearly and kindly: "));
        assert!(!spoken.contains('🌟'));
    }

    #[tokio::test]
    async fn next_is_refused_while_generating() {
        let mut h = harness();
        do_start_lesson(&mut h.state).unwrap();
        assert!(do_next_step(&mut h.state).is_err());

        h.settle().await;
        let shown = do_next_step(&mut h.state).unwrap();
        assert!(shown.contains("Vocabulary"));
    }

    #[tokio::test]
    async fn last_step_finishes_the_unit() {
        let mut h = harness();
        do_start_lesson(&mut h.state).unwrap();
        for _ in 0..6 {
            h.state.is_generating = false;
            do_next_step(&mut h.state).unwrap();
        }
        h.state.is_generating = false;
        let shown = do_next_step(&mut h.state).unwrap();
        assert!(shown.starts_with("Unit finished!"));
        assert!(!h.state.progress.in_lesson());
        assert!(h.state.content.is_none());
    }

    #[tokio::test]
    async fn vocabulary_step_shows_word_cards() {
        let mut h = harness();
        do_start_lesson(&mut h.state).unwrap();
        let warm_up = h.settle().await.unwrap();
        assert!(!warm_up.contains("👋 Hello!"));

        do_next_step(&mut h.state).unwrap();
        let shown = loop {
            if let Some(shown) = h.settle().await {
                if shown.starts_with("👩‍🏫 Vocabulary") {
                    break shown;
                }
            }
        };
        assert!(shown.contains("👋 Hello!    ✏️ Goodbye!"));
        assert!(shown.contains("🎒 bag"));
        assert!(!shown.contains("📖 book"));
    }

    #[tokio::test]
    async fn superseded_step_text_is_discarded() {
        let mut h = harness();
        do_start_lesson(&mut h.state).unwrap();
        do_back(&mut h.state);

        assert_eq!(h.settle().await, None);
        assert!(h.state.content.is_none());
        assert!(!h.state.is_generating);
    }

    #[tokio::test]
    async fn say_requires_content_and_silence() {
        let mut h = harness();
        assert!(do_say(&mut h.state).is_err());

        h.state.content = Some("Hello!".into());
        h.state.is_audio_playing = true;
        assert!(do_say(&mut h.state).is_err());

        h.state.is_audio_playing = false;
        do_say(&mut h.state).unwrap();
        assert!(h.state.is_audio_playing);
    }

    #[tokio::test]
    async fn speech_finish_clears_playing_flag() {
        let mut h = harness();
        h.state.content = Some("Hello!".into());
        do_say(&mut h.state).unwrap();
        h.settle().await;

        // Stopping playback resolves the one-shot as well.
        h.state.playback.stop_all();
        assert_eq!(h.settle().await, None);
        assert!(!h.state.is_audio_playing);
    }

    #[tokio::test]
    async fn stale_speech_is_not_played() {
        let mut h = harness();
        h.state.content = Some("Hello!".into());
        do_say(&mut h.state).unwrap();
        do_back(&mut h.state);

        h.settle().await;
        let snapshot = h.state.playback.snapshot().await.unwrap();
        assert_eq!(snapshot.active_sources, 0);
    }
}
