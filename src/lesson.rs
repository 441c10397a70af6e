//! Curriculum data, lesson steps and prompt building for the remote teacher.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::engine::{TextGenerator, TextRequest};

pub const EMPTY_REPLY: &str = "Try again! 🐝";
pub const SPEECH_PROMPT_PREFIX: &str = "You are a friendly Grade 1 teacher. Say this clearly and kindly: ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonicsEntry {
    pub letter: String,
    pub words: Vec<String>,
}

/// One unit of the term plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: u32,
    pub title: String,
    pub vocabulary: Vec<String>,
    pub phonics: Vec<PhonicsEntry>,
    pub language_in_use: String,
    pub life_skills: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Curriculum {
    pub units: Vec<Unit>,
}

impl Curriculum {
    pub fn unit(&self, id: u32) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }
}

/// Load the built-in Grade 1 term-1 curriculum
pub fn load_curriculum() -> Result<Curriculum> {
    let curriculum_json = include_str!("../resources/curriculum.json");
    let curriculum: Curriculum = serde_json::from_str(curriculum_json)?;
    Ok(curriculum)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonStep {
    WarmUp,
    Vocabulary,
    Pronunciation,
    Phonics,
    SongChant,
    Activity,
    Revision,
}

impl LessonStep {
    pub const ALL: [LessonStep; 7] = [
        LessonStep::WarmUp,
        LessonStep::Vocabulary,
        LessonStep::Pronunciation,
        LessonStep::Phonics,
        LessonStep::SongChant,
        LessonStep::Activity,
        LessonStep::Revision,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LessonStep::WarmUp => "Warm Up",
            LessonStep::Vocabulary => "Vocabulary",
            LessonStep::Pronunciation => "Pronunciation",
            LessonStep::Phonics => "Phonics",
            LessonStep::SongChant => "Song/Chant",
            LessonStep::Activity => "Activity",
            LessonStep::Revision => "Revision",
        }
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

impl fmt::Display for LessonStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeachingMode {
    #[default]
    Arabic,
    English,
}

impl TeachingMode {
    pub fn error_reply(self) -> &'static str {
        match self {
            TeachingMode::Arabic => "أوه لا! حاول مرة تانية يا بطل! 🐝",
            TeachingMode::English => "Oops! Let's try again! 🐝",
        }
    }

    pub fn listening_prompt(self) -> &'static str {
        match self {
            TeachingMode::Arabic => "أنا أسمعك يا شاطر.. اتفضل قول!",
            TeachingMode::English => "I am listening! Go ahead!",
        }
    }

    fn rules(self) -> &'static str {
        match self {
            TeachingMode::Arabic => {
                "LANGUAGE MODE: ARABIC/BILINGUAL.
- You are a kind Egyptian teacher named \"Miss [choose name]\".
- Speak in warm, encouraging Egyptian Arabic (عامية مصرية).
- Use Arabic to explain English words.
- Translate every English instruction to Arabic.
- Praise the child in Arabic: \"شاطر جداً\"، \"ممتاز يا بطل\"، \"برافو عليكي\".
- NEVER speak English only. ALWAYS provide Arabic support."
            }
            TeachingMode::English => {
                "LANGUAGE MODE: ENGLISH ONLY IMMERSION.
- You are a native English teacher who does NOT speak Arabic.
- Talk only in simple, clear, slow English.
- Use simple words and sounds.
- NEVER USE ARABIC WORDS OR CHARACTERS in this mode.
- If the child doesn't understand, repeat slowly or use emojis to explain.
- Praise the child in English: \"Very good!\", \"Amazing job!\", \"You are a star!\"."
            }
        }
    }
}

impl fmt::Display for TeachingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeachingMode::Arabic => f.write_str("arabic"),
            TeachingMode::English => f.write_str("english"),
        }
    }
}

impl FromStr for TeachingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arabic" | "ar" | "bilingual" => Ok(TeachingMode::Arabic),
            "english" | "en" => Ok(TeachingMode::English),
            other => anyhow::bail!("Unknown teaching mode: {}", other),
        }
    }
}

/// Teacher persona for a unit and mode, shared by step generation and live sessions.
pub fn system_instruction(unit: &Unit, mode: TeachingMode) -> String {
    let phonics = unit
        .phonics
        .iter()
        .map(|p| format!("Letter {}: {}", p.letter, p.words.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");

    format!(
        "You are a Smart Virtual Teacher for Grade 1 children in Egypt.
Curriculum: Connect 1 (Ministry of Education, Term 1).
Current Unit: \"{}\".
Vocabulary: {}.
Phonics: {}.
Language Goal: {}.
Target Age: 6-7 years old.
Strictly follow the Ministry of Education Grade 1 curriculum.
{}
Use lots of emojis like 🍎, 🌟, 🎒, 👏. Keep sentences very short.",
        unit.title,
        unit.vocabulary.join(", "),
        phonics,
        unit.language_in_use,
        mode.rules(),
    )
}

pub fn step_request(model: &str, unit: &Unit, mode: TeachingMode, step: LessonStep) -> TextRequest {
    TextRequest {
        model: model.to_string(),
        system_instruction: format!(
            "{}\nCurrent focus: {}. Follow the language rules strictly.",
            system_instruction(unit, mode),
            step
        ),
        prompt: format!("Let's do the \"{}\" part of Unit {}.", step, unit.id),
        temperature: 0.7,
    }
}

/// Generate the text for one step. Never fails: errors become the
/// mode-specific apology and an empty reply becomes [`EMPTY_REPLY`].
pub async fn generate_step<G>(
    generator: &G,
    model: &str,
    unit: &Unit,
    mode: TeachingMode,
    step: LessonStep,
) -> String
where
    G: TextGenerator + ?Sized,
{
    match generator.generate_text(step_request(model, unit, mode, step)).await {
        Ok(text) if text.trim().is_empty() => EMPTY_REPLY.to_string(),
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Step generation failed: {:#}", e);
            mode.error_reply().to_string()
        }
    }
}

fn is_pictograph(c: char) -> bool {
    matches!(
        c as u32,
        0xE000..=0xF8FF
            | 0x1F300..=0x1F5FF
            | 0x1F600..=0x1F64F
            | 0x1F680..=0x1F6FF
            | 0x1F900..=0x1FAFF
            | 0x2600..=0x27BF
            | 0xFE0F
            | 0x200D
    )
}

/// Remove emoji before speech synthesis; letters in any script are kept.
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_pictograph(*c)).collect()
}

pub fn speech_prompt(text: &str) -> String {
    format!("{}{}", SPEECH_PROMPT_PREFIX, text)
}

/// Words shown as picture cards on the vocabulary step.
const VOCABULARY_CARDS: usize = 8;

fn card_picture(word: &str) -> &'static str {
    let word = word.to_lowercase();
    [("hello", "👋"), ("bag", "🎒"), ("book", "📖"), ("flower", "🌸"), ("sun", "☀️")]
        .iter()
        .find(|(key, _)| word.contains(key))
        .map(|(_, picture)| *picture)
        .unwrap_or("✏️")
}

/// Picture cards for the first vocabulary words of a unit, two per line.
pub fn vocabulary_cards(unit: &Unit) -> String {
    unit.vocabulary
        .iter()
        .take(VOCABULARY_CARDS)
        .map(|word| format!("{} {}", card_picture(word), word))
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|pair| format!("  {}", pair.join("    ")))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAdvance {
    Next(LessonStep),
    Finished,
}

/// Position within the current unit's lesson.
#[derive(Debug, Clone, Default)]
pub struct LessonProgress {
    step: usize,
    in_lesson: bool,
}

impl LessonProgress {
    pub fn start(&mut self) -> LessonStep {
        self.step = 0;
        self.in_lesson = true;
        LessonStep::ALL[0]
    }

    pub fn current(&self) -> Option<LessonStep> {
        self.in_lesson.then(|| LessonStep::ALL[self.step])
    }

    pub fn in_lesson(&self) -> bool {
        self.in_lesson
    }

    /// Advance one step. After the last step the lesson ends and the
    /// position returns to the first step.
    pub fn next_step(&mut self) -> StepAdvance {
        if self.in_lesson && self.step + 1 < LessonStep::ALL.len() {
            self.step += 1;
            StepAdvance::Next(LessonStep::ALL[self.step])
        } else {
            self.leave();
            StepAdvance::Finished
        }
    }

    pub fn leave(&mut self) {
        self.step = 0;
        self.in_lesson = false;
    }
}
