//! Session lifecycle service: create conversations and request their analysis.

#[cfg(feature = "http")]
pub mod http;

use crate::error::Result;
use crate::session::{Mood, SessionId};
use serde::{Deserialize, Serialize};

/// Highest score per dimension.
pub const MAX_DIMENSION_SCORE: f64 = 5.0;

/// Per-dimension scores, each 1-5.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scores {
    pub professionalism: f64,
    pub communication: f64,
    pub problem_resolution: f64,
    pub empathy: f64,
    pub efficiency: f64,
}

impl Scores {
    pub fn dimensions(&self) -> [(&'static str, f64); 5] {
        [
            ("Professionalism", self.professionalism),
            ("Communication", self.communication),
            ("Problem resolution", self.problem_resolution),
            ("Empathy", self.empathy),
            ("Efficiency", self.efficiency),
        ]
    }

    pub fn sum(&self) -> f64 {
        self.dimensions().iter().map(|(_, v)| v).sum()
    }
}

fn default_feedback() -> String {
    "No feedback available".to_string()
}

/// Scored evaluation of a finished conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub total_score: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default = "default_feedback")]
    pub overall_feedback: String,
}

impl Default for AnalysisReport {
    fn default() -> Self {
        Self {
            scores: Scores::default(),
            total_score: 0.0,
            strengths: Vec::new(),
            improvements: Vec::new(),
            overall_feedback: default_feedback(),
        }
    }
}

impl AnalysisReport {
    /// Plain-text rendering for the console.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Total score: {:.1} / {:.0}",
            self.total_score,
            MAX_DIMENSION_SCORE * 5.0
        )];
        for (name, score) in self.scores.dimensions() {
            lines.push(format!(
                "  {:<20} {:.1} / {:.0}",
                name, score, MAX_DIMENSION_SCORE
            ));
        }
        if !self.strengths.is_empty() {
            lines.push("Strengths:".to_string());
            lines.extend(self.strengths.iter().map(|s| format!("  + {}", s)));
        }
        if !self.improvements.is_empty() {
            lines.push("Improvements:".to_string());
            lines.extend(self.improvements.iter().map(|s| format!("  - {}", s)));
        }
        lines.push(format!("Feedback: {}", self.overall_feedback));
        lines.join("\n")
    }
}

/// Remote service that owns conversation identity and scoring.
#[async_trait::async_trait]
pub trait SessionService: Send + Sync {
    /// Open a new conversation with the engine playing `mood`.
    async fn create(&self, mood: Mood) -> Result<SessionId>;

    /// Score a conversation. Allowed after it has ended.
    async fn analyze(&self, id: &SessionId) -> Result<AnalysisReport>;
}
