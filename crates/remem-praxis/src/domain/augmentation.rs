//! THINK-phase augmentation
//!
//! Renders retrieved experiences into a bounded context block for the
//! executing agent.

use remem_common::{ExperienceId, VisibilityScope};
use serde::{Deserialize, Serialize};

use super::retrieval::{RankedResult, ScoredExperience};

/// An experience formatted for augmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentedExperience {
    /// 1 = most relevant
    pub rank: usize,
    pub id: ExperienceId,
    pub scope: VisibilityScope,
    pub score: f32,
    pub task: String,
    pub strategy: String,
    pub output: String,
    pub fitness: f32,
    pub usage_count: u64,
    pub exact_match: bool,
}

impl AugmentedExperience {
    fn from_scored(rank: usize, scored: &ScoredExperience) -> Self {
        let e = &scored.experience;
        Self {
            rank,
            id: e.id,
            scope: scored.scope,
            score: scored.score,
            task: e.input_task.text.clone(),
            strategy: e.strategy.clone(),
            output: e.output.clone(),
            fitness: e.fitness_score,
            usage_count: e.usage_count,
            exact_match: scored.exact_match,
        }
    }

    fn render(&self) -> String {
        let origin = match self.scope {
            VisibilityScope::AgentLocal => "own",
            VisibilityScope::TierShared => "tier",
            VisibilityScope::Collective => "collective",
        };
        let mut out = format!(
            "{}. [{}{}] fitness {:.2}, used {}x\n   Task: {}\n   Strategy: {}\n   Output: {}\n",
            self.rank,
            origin,
            if self.exact_match { ", same task" } else { "" },
            self.fitness,
            self.usage_count,
            self.task,
            self.strategy,
            self.output,
        );
        out.push('\n');
        out
    }
}

/// Context block handed to the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    pub entries: Vec<AugmentedExperience>,
    /// Rendered block; empty when nothing was retrieved
    pub text: String,
}

const HEADER: &str = "## Prior Experience\n\n";

impl Augmentation {
    /// Build from ranked results, keeping ranking order and stopping at
    /// either bound. The first entry is truncated rather than dropped.
    pub fn from_ranked(ranked: &RankedResult, max_entries: usize, max_chars: usize) -> Self {
        let mut entries = Vec::new();
        let mut text = String::new();

        for scored in ranked.iter().take(max_entries) {
            let entry = AugmentedExperience::from_scored(entries.len() + 1, scored);
            let rendered = entry.render();
            let header = if text.is_empty() { HEADER } else { "" };
            let needed = header.chars().count() + rendered.chars().count();
            let used = text.chars().count();

            if used + needed > max_chars {
                if entries.is_empty() {
                    text.push_str(header);
                    text.push_str(&rendered);
                    truncate_chars(&mut text, max_chars);
                    if !text.is_empty() {
                        entries.push(entry);
                    }
                }
                break;
            }

            text.push_str(header);
            text.push_str(&rendered);
            entries.push(entry);
        }

        Self {
            text: text.trim_end().to_string(),
            entries,
        }
    }

    /// Experiences actually shown to the agent
    pub fn consulted(&self) -> Vec<ExperienceId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Truncate to at most `max` characters without splitting a code point
fn truncate_chars(text: &mut String, max: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
}
