//! `BargeInController`: decides whether an in-flight ASR event should
//! interrupt an active assistant turn.
//!
//! A small holdoff window after the most recent submitted playback frame,
//! active only when the AEC cannot cancel the assistant's own voice out of
//! the microphone feed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::audio::aec::AecMode;
use crate::config::BargeInConfig;
use crate::pipeline::messages::{Transcript, TurnState};

pub struct BargeInController {
    config: BargeInConfig,
    aec_mode: AecMode,
    last_submit_time: Mutex<Option<Instant>>,
}

impl BargeInController {
    pub fn new(config: BargeInConfig, aec_mode: AecMode) -> Self {
        Self {
            config,
            aec_mode,
            last_submit_time: Mutex::new(None),
        }
    }

    /// Record that the playback stage just handed a frame to the device.
    /// Used to suppress the assistant's own echo triggering a false
    /// barge-in when AEC runs in software mode.
    pub fn note_playback_submitted(&self, at: Instant) {
        *self.last_submit_time.lock().expect("barge-in state poisoned") = Some(at);
    }

    /// Whether `transcript`, observed while the turn is in `state`, should
    /// cancel the active turn.
    pub fn should_trigger(&self, state: TurnState, transcript: &Transcript, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        if !matches!(
            state,
            TurnState::Generating | TurnState::Speaking | TurnState::Draining
        ) {
            return false;
        }

        let trimmed_len = transcript.text.trim().chars().count();
        if trimmed_len < self.config.barge_in_min_chars && !transcript.is_final {
            return false;
        }

        if self.aec_mode == AecMode::Software {
            let last_submit = *self.last_submit_time.lock().expect("barge-in state poisoned");
            if let Some(last_submit) = last_submit {
                let grace = Duration::from_millis(self.config.barge_in_grace_ms as u64);
                if now.saturating_duration_since(last_submit) < grace {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(text: &str, is_final: bool) -> Transcript {
        Transcript {
            text: text.to_owned(),
            is_final,
            server_sequence: 0,
            start_time: Instant::now(),
            end_time: Instant::now(),
        }
    }

    #[test]
    fn ignores_events_while_idle() {
        let c = BargeInController::new(BargeInConfig::default(), AecMode::Aggregate);
        assert!(!c.should_trigger(TurnState::Listening, &transcript("hello", false), Instant::now()));
    }

    #[test]
    fn triggers_on_sufficiently_long_partial_during_speaking() {
        let c = BargeInController::new(BargeInConfig::default(), AecMode::Aggregate);
        assert!(c.should_trigger(TurnState::Speaking, &transcript("stop", false), Instant::now()));
    }

    #[test]
    fn short_partial_below_min_chars_does_not_trigger() {
        let mut cfg = BargeInConfig::default();
        cfg.barge_in_min_chars = 10;
        let c = BargeInController::new(cfg, AecMode::Aggregate);
        assert!(!c.should_trigger(TurnState::Speaking, &transcript("hm", false), Instant::now()));
    }

    #[test]
    fn final_transcript_triggers_even_if_short() {
        let mut cfg = BargeInConfig::default();
        cfg.barge_in_min_chars = 10;
        let c = BargeInController::new(cfg, AecMode::Aggregate);
        assert!(c.should_trigger(TurnState::Speaking, &transcript("no", true), Instant::now()));
    }

    #[test]
    fn software_aec_suppresses_events_within_grace_period() {
        let c = BargeInController::new(BargeInConfig::default(), AecMode::Software);
        let now = Instant::now();
        c.note_playback_submitted(now);
        assert!(!c.should_trigger(TurnState::Speaking, &transcript("stop", false), now));
    }

    #[test]
    fn software_aec_allows_events_after_grace_period() {
        let mut cfg = BargeInConfig::default();
        cfg.barge_in_grace_ms = 50;
        let c = BargeInController::new(cfg, AecMode::Software);
        let t0 = Instant::now();
        c.note_playback_submitted(t0);
        let later = t0 + Duration::from_millis(100);
        assert!(c.should_trigger(TurnState::Speaking, &transcript("stop", false), later));
    }

    #[test]
    fn disabled_controller_never_triggers() {
        let mut cfg = BargeInConfig::default();
        cfg.enabled = false;
        let c = BargeInController::new(cfg, AecMode::Aggregate);
        assert!(!c.should_trigger(TurnState::Speaking, &transcript("stop", true), Instant::now()));
    }
}
