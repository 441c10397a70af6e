use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::capture::Microphone;
use crate::audio::playback::PlaybackHandle;
use crate::audio::AudioChunk;
use crate::engine::{LiveConnector, SpeechSynthesizer, TextGenerator};
use crate::lesson::{Curriculum, LessonProgress, LessonStep, TeachingMode, Unit};
use crate::session::SessionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Idle,
    Generating,
    Speaking,
    Listening,
}

/// Completions of background work, applied on the console task.
pub enum AppEvent {
    StepGenerated {
        ticket: u64,
        step: LessonStep,
        text: String,
    },
    SpeechReady {
        ticket: u64,
        result: anyhow::Result<Option<AudioChunk>>,
    },
    SpeechFinished {
        ticket: u64,
    },
}

pub struct AppState<C: LiveConnector, M: Microphone> {
    pub settings: Settings,
    pub settings_path: Option<PathBuf>,
    pub curriculum: Curriculum,
    pub progress: LessonProgress,
    pub content: Option<String>,
    pub is_generating: bool,
    pub is_audio_playing: bool,
    /// Bumped whenever an in-flight step generation must be ignored.
    pub step_ticket: u64,
    /// Bumped whenever in-flight or playing speech must be ignored.
    pub speech_ticket: u64,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub playback: PlaybackHandle,
    pub session: SessionController<C, M>,
    pub events_tx: mpsc::UnboundedSender<AppEvent>,
    pub save_speech_to: Option<PathBuf>,
}

impl<C: LiveConnector, M: Microphone> AppState<C, M> {
    pub fn status(&self) -> AppStatus {
        if self.session.state().is_live() {
            AppStatus::Listening
        } else if self.is_generating {
            AppStatus::Generating
        } else if self.is_audio_playing {
            AppStatus::Speaking
        } else {
            AppStatus::Idle
        }
    }

    pub fn is_mic_active(&self) -> bool {
        self.session.state().is_live()
    }

    pub fn current_unit(&self) -> Option<&Unit> {
        self.curriculum.unit(self.settings.lesson.unit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gemini: GeminiSettings,
    #[serde(default)]
    pub lesson: LessonSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiSettings {
    pub text_model: String,
    pub speech_model: String,
    pub live_model: String,
    pub voice: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            text_model: "gemini-3-flash-preview".to_string(),
            speech_model: "gemini-2.5-flash-preview-tts".to_string(),
            live_model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Kore".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonSettings {
    #[serde(default)]
    pub mode: TeachingMode,
    pub unit: u32,
}

impl Default for LessonSettings {
    fn default() -> Self {
        Self {
            mode: TeachingMode::Arabic,
            unit: 1,
        }
    }
}
