//! Voice catalog entries and name-based heuristics.
//!
//! Speech engines rarely expose gender or quality metadata, so both are
//! inferred from the free-text voice name.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// One synthesizer voice as advertised by the speech engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    /// Descriptive name, e.g. "Microsoft Zira - English (United States)".
    pub name: String,
    /// BCP 47 language tag, e.g. "en-US".
    pub lang: String,
}

impl Voice {
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: lang.into(),
        }
    }

    pub fn gender(&self) -> Gender {
        infer_gender(&self.name)
    }

    pub fn is_natural(&self) -> bool {
        is_natural(&self.name)
    }

    /// True when the voice speaks the language of `locale` ("en-GB" matches "en-US").
    pub fn speaks(&self, locale: &str) -> bool {
        primary_language(&self.lang) == primary_language(locale)
    }
}

/// Language subtag of a locale, lowercased: "en-US" -> "en".
pub fn primary_language(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => f.write_str("male"),
            Gender::Female => f.write_str("female"),
        }
    }
}

/// Quality class used to rank candidate voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Premium,
    Enhanced,
    Standard,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Premium => "premium",
            Quality::Enhanced => "enhanced",
            Quality::Standard => "standard",
        }
    }

    /// Name patterns in priority order. An implicit final tier accepts any voice.
    pub fn tiers(&self) -> &'static [Regex] {
        match self {
            Quality::Premium => PREMIUM_TIERS.as_slice(),
            Quality::Enhanced => ENHANCED_TIERS.as_slice(),
            Quality::Standard => STANDARD_TIERS.as_slice(),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "premium" => Ok(Quality::Premium),
            "enhanced" => Ok(Quality::Enhanced),
            "standard" => Ok(Quality::Standard),
            other => Err(format!(
                "unknown voice quality '{}' (expected premium, enhanced or standard)",
                other
            )),
        }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
}

static MALE_PATTERN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&["male|david|mark|james|george|ryan|christopher|andrew|brian|daniel"])
});

static FEMALE_PATTERN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&["female|zira|susan|catherine|mary|helen|linda|samantha|karen|sarah|emma"])
});

static NATURAL_PATTERN: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&["neural|natural|premium|enhanced"]));

static PREMIUM_TIERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        "neural|natural|premium|enhanced|wavenet",
        "compact|quality|novelty|improved",
    ])
});

static ENHANCED_TIERS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&["enhanced|improved|hd|quality", "online|network|cloud"]));

static STANDARD_TIERS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&["standard|default|basic"]));

fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|re| re.is_match(name))
}

/// Infer gender from a voice name.
///
/// The female keywords are checked first because "female" contains "male".
/// Names matching neither default to female.
pub fn infer_gender(name: &str) -> Gender {
    if matches_any(&FEMALE_PATTERN, name) {
        Gender::Female
    } else if matches_any(&MALE_PATTERN, name) {
        Gender::Male
    } else {
        Gender::Female
    }
}

/// True for voices whose name advertises neural or otherwise high-quality synthesis.
pub fn is_natural(name: &str) -> bool {
    matches_any(&NATURAL_PATTERN, name)
}

/// Built-in catalog used by the console speaker.
pub fn builtin_voices() -> Vec<Voice> {
    [
        ("Microsoft Aria Online (Natural) - English (United States)", "en-US"),
        ("Microsoft Andrew Online (Natural) - English (United States)", "en-US"),
        ("Microsoft Zira - English (United States)", "en-US"),
        ("Microsoft David - English (United States)", "en-US"),
        ("Google UK English Female", "en-GB"),
        ("Google UK English Male", "en-GB"),
        ("Samantha (Enhanced)", "en-US"),
        ("Daniel", "en-GB"),
        ("Karen", "en-AU"),
        ("Google Deutsch", "de-DE"),
        ("Amelie", "fr-CA"),
    ]
    .into_iter()
    .map(|(name, lang)| Voice::new(name, lang))
    .collect()
}
