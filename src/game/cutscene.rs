//! Result Presentation
//!
//! When a match finishes the controller hands the result to a
//! [`ResultPresenter`] and waits for it to complete before tearing the
//! session down. [`ScriptedCutscene`] is a timed sequence of phases that
//! emits effect cues for whatever renders them.

use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use crate::replication::player::PlayerSlot;
use super::machine::MatchResultView;

/// Plays the end-of-match presentation.
#[async_trait]
pub trait ResultPresenter: Send {
    /// Present the result; resolve when done.
    async fn present(&mut self, result: &MatchResultView);
}

/// Cutscene phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutscenePhase {
    /// Freeze the last frame.
    Freeze,
    /// Camera on the winner.
    FocusWinner,
    /// Final score on screen.
    ScoreReveal,
    /// Fade out.
    Outro,
}

/// Something for the renderer to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectCue {
    /// Blow up a tank.
    Explosion {
        /// Tank to blow up.
        slot: PlayerSlot,
    },
    /// Celebrate a tank.
    Fireworks {
        /// Tank to celebrate.
        slot: PlayerSlot,
    },
    /// Show a banner.
    Banner {
        /// Banner text.
        text: String,
    },
}

/// Cutscene progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutsceneEvent {
    /// A phase began.
    PhaseStarted(CutscenePhase),
    /// An effect should play.
    Effect(EffectCue),
    /// The cutscene completed.
    Finished,
}

/// Timed sequence of phases.
pub struct ScriptedCutscene {
    steps: Vec<(CutscenePhase, Duration)>,
    event_tx: broadcast::Sender<CutsceneEvent>,
}

impl Default for ScriptedCutscene {
    fn default() -> Self {
        Self::new(vec![
            (CutscenePhase::Freeze, Duration::from_millis(500)),
            (CutscenePhase::FocusWinner, Duration::from_millis(2500)),
            (CutscenePhase::ScoreReveal, Duration::from_millis(2500)),
            (CutscenePhase::Outro, Duration::from_millis(1000)),
        ])
    }
}

impl ScriptedCutscene {
    /// Custom sequence.
    pub fn new(steps: Vec<(CutscenePhase, Duration)>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self { steps, event_tx }
    }

    /// Same phases with no waiting.
    pub fn instant() -> Self {
        let mut cutscene = Self::default();
        for step in &mut cutscene.steps {
            step.1 = Duration::ZERO;
        }
        cutscene
    }

    /// Total running time.
    pub fn duration(&self) -> Duration {
        self.steps.iter().map(|(_, d)| *d).sum()
    }

    /// Subscribe to cutscene progress.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CutsceneEvent> {
        self.event_tx.subscribe()
    }

    fn cues(phase: CutscenePhase, result: &MatchResultView) -> Vec<EffectCue> {
        match (phase, result.winner) {
            (CutscenePhase::FocusWinner, Some(winner)) => vec![
                EffectCue::Explosion { slot: winner.opponent() },
                EffectCue::Fireworks { slot: winner },
            ],
            (CutscenePhase::FocusWinner, None) => vec![
                EffectCue::Explosion { slot: PlayerSlot::Player1 },
                EffectCue::Explosion { slot: PlayerSlot::Player2 },
            ],
            (CutscenePhase::ScoreReveal, Some(slot)) => {
                let winner = result.entry(slot);
                let loser = result.entry(slot.opponent());
                vec![EffectCue::Banner {
                    text: format!("{} wins {} - {} against {}", winner.name, winner.score, loser.score, loser.name),
                }]
            }
            (CutscenePhase::ScoreReveal, None) => vec![EffectCue::Banner {
                text: format!(
                    "Draw {} - {} between {} and {}",
                    result.player1.score, result.player2.score, result.player1.name, result.player2.name
                ),
            }],
            (CutscenePhase::Freeze | CutscenePhase::Outro, _) => Vec::new(),
        }
    }

    fn emit(&self, event: CutsceneEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl ResultPresenter for ScriptedCutscene {
    async fn present(&mut self, result: &MatchResultView) {
        let outcome = if result.is_draw() {
            "draw"
        } else if result.local_won() {
            "victory"
        } else {
            "defeat"
        };
        info!("Presenting result: {} - {} ({})", result.player1.score, result.player2.score, outcome);
        for (phase, hold) in self.steps.clone() {
            self.emit(CutsceneEvent::PhaseStarted(phase));
            for cue in Self::cues(phase, result) {
                self.emit(CutsceneEvent::Effect(cue));
            }
            if !hold.is_zero() {
                tokio::time::sleep(hold).await;
            }
        }
        self.emit(CutsceneEvent::Finished);
    }
}
