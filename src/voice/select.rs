//! Voice resolution policy.
//!
//! A pure function from (catalog, preference, session lock) to a voice, so the
//! heuristics can be tested without any speech engine.

use crate::voice::catalog::{Gender, Quality, Voice};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which voice the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum VoicePreference {
    /// Pick one at random and keep it for the whole session.
    #[default]
    Random,
    /// Best voice of this gender, ranked by quality tier.
    Gender(Gender),
    /// Exact voice name.
    Named(String),
}

impl fmt::Display for VoicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoicePreference::Random => f.write_str("random"),
            VoicePreference::Gender(g) => write!(f, "{}", g),
            VoicePreference::Named(name) => f.write_str(name),
        }
    }
}

impl FromStr for VoicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => Err("voice preference must not be empty".to_string()),
            "random" => Ok(VoicePreference::Random),
            "male" => Ok(VoicePreference::Gender(Gender::Male)),
            "female" => Ok(VoicePreference::Gender(Gender::Female)),
            _ => Ok(VoicePreference::Named(trimmed.to_string())),
        }
    }
}

impl From<VoicePreference> for String {
    fn from(pref: VoicePreference) -> Self {
        pref.to_string()
    }
}

impl TryFrom<String> for VoicePreference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Inputs to one voice resolution.
#[derive(Debug, Clone, Copy)]
pub struct VoiceRequest<'a> {
    pub preference: &'a VoicePreference,
    pub quality: Quality,
    /// Recognition locale; only voices of the same language are candidates.
    pub locale: &'a str,
    /// Voice pinned for the current session, if any.
    pub locked: Option<&'a Voice>,
    /// Names that already failed in the current synthesis chain.
    pub excluded: &'a [String],
}

/// How a voice was arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceSource {
    /// Reused the session lock.
    Locked,
    /// Freshly drawn at random. The caller must lock it.
    Random,
    Gender,
    Named,
    /// First same-language voice.
    Fallback,
    /// No usable voice; let the engine use its default.
    EngineDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChoice {
    pub voice: Option<Voice>,
    pub source: ChoiceSource,
}

impl VoiceChoice {
    fn new(voice: Voice, source: ChoiceSource) -> Self {
        Self {
            voice: Some(voice),
            source,
        }
    }

    /// True when the chosen voice should become the session lock.
    pub fn should_lock(&self) -> bool {
        self.source == ChoiceSource::Random
    }
}

/// Resolve the voice for one utterance.
pub fn select_voice<R: Rng + ?Sized>(
    catalog: &[Voice],
    request: &VoiceRequest<'_>,
    rng: &mut R,
) -> VoiceChoice {
    let same_language: Vec<&Voice> = catalog.iter().filter(|v| v.speaks(request.locale)).collect();
    let not_excluded = |v: &&Voice| !request.excluded.iter().any(|name| *name == v.name);

    let preferred = match request.preference {
        VoicePreference::Random => {
            if let Some(locked) = request.locked {
                return VoiceChoice::new(locked.clone(), ChoiceSource::Locked);
            }
            let fresh: Vec<&Voice> = same_language.iter().copied().filter(not_excluded).collect();
            let pool = if fresh.is_empty() { &same_language } else { &fresh };
            pool.choose(rng)
                .map(|v| VoiceChoice::new((*v).clone(), ChoiceSource::Random))
        }
        VoicePreference::Gender(gender) => {
            let of_gender: Vec<&Voice> = same_language
                .iter()
                .copied()
                .filter(|v| v.gender() == *gender)
                .collect();
            let fresh: Vec<&Voice> = of_gender.iter().copied().filter(not_excluded).collect();
            let pool = if fresh.is_empty() { &of_gender } else { &fresh };
            best_by_quality(pool, request.quality)
                .map(|v| VoiceChoice::new(v.clone(), ChoiceSource::Gender))
        }
        VoicePreference::Named(name) => catalog
            .iter()
            .find(|v| v.name == *name)
            .map(|v| VoiceChoice::new(v.clone(), ChoiceSource::Named)),
    };

    if let Some(choice) = preferred {
        return choice;
    }

    same_language
        .iter()
        .copied()
        .find(not_excluded)
        .or_else(|| same_language.first().copied())
        .map(|v| VoiceChoice::new(v.clone(), ChoiceSource::Fallback))
        .unwrap_or(VoiceChoice {
            voice: None,
            source: ChoiceSource::EngineDefault,
        })
}

/// First voice matching the highest tier that matches anything; any voice otherwise.
fn best_by_quality<'a>(candidates: &[&'a Voice], quality: Quality) -> Option<&'a Voice> {
    quality
        .tiers()
        .iter()
        .find_map(|tier| candidates.iter().find(|v| tier.is_match(&v.name)).copied())
        .or_else(|| candidates.first().copied())
}
