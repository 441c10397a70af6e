use anyhow::Result;

use crate::audio::capture::Microphone;
use crate::engine::LiveConnector;
use crate::lesson::TeachingMode;
use crate::persistence;
use crate::state::AppState;

fn persist<C: LiveConnector, M: Microphone>(state: &AppState<C, M>) {
    let Some(path) = &state.settings_path else {
        return;
    };
    if let Err(e) = persistence::save_settings(path, &state.settings) {
        tracing::error!("Failed to save settings: {:#}", e);
    }
}

pub fn do_set_mode<C: LiveConnector, M: Microphone>(
    state: &mut AppState<C, M>,
    mode: TeachingMode,
) -> Result<String> {
    if state.progress.in_lesson() {
        anyhow::bail!("Cannot change mode during a lesson. Type 'back' first.");
    }
    state.settings.lesson.mode = mode;
    persist(state);
    tracing::info!("Teaching mode set to {}", mode);
    Ok(match mode {
        TeachingMode::Arabic => "Mode: Arabic support 🇪🇬".to_string(),
        TeachingMode::English => "Mode: English only 🇬🇧".to_string(),
    })
}

pub fn do_set_unit<C: LiveConnector, M: Microphone>(state: &mut AppState<C, M>, unit: u32) -> Result<String> {
    if state.progress.in_lesson() {
        anyhow::bail!("Cannot change unit during a lesson. Type 'back' first.");
    }
    let title = state
        .curriculum
        .unit(unit)
        .map(|u| u.title.clone())
        .ok_or_else(|| anyhow::anyhow!("There is no unit {}. Type 'units' to see them.", unit))?;

    state.settings.lesson.unit = unit;
    persist(state);
    Ok(format!("Unit {}: {}", unit, title))
}

pub fn list_units<C: LiveConnector, M: Microphone>(state: &AppState<C, M>) -> String {
    state
        .curriculum
        .units
        .iter()
        .map(|u| {
            let marker = if u.id == state.settings.lesson.unit { "*" } else { " " };
            let letters = u
                .phonics
                .iter()
                .map(|p| p.letter.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            format!("{} {}. {} ({})", marker, u.id, u.title, letters)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn describe_status<C: LiveConnector, M: Microphone>(state: &AppState<C, M>) -> String {
    let mut lines = vec![
        format!("Status: {:?}", state.status()),
        format!(
            "Unit {} | mode {} | step {}",
            state.settings.lesson.unit,
            state.settings.lesson.mode,
            state
                .progress
                .current()
                .map(|s| s.name())
                .unwrap_or("not started")
        ),
        format!("Live session: {:?}", state.session.state()),
    ];
    if state.session.microphone().is_open() {
        lines.push(format!(
            "Mic level: {:.3}",
            state.session.microphone().current_level()
        ));
    }
    if let Some(snapshot) = state.playback.snapshot().await {
        lines.push(format!(
            "Playback: {} source(s), clock {:.2}s, next start {:.2}s",
            snapshot.active_sources, snapshot.device_time, snapshot.next_start_time
        ));
    }
    lines.join("\n")
}
