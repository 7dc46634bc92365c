//! Voice catalog heuristics and the voice resolution policy.

pub mod catalog;
pub mod select;

pub use catalog::{Gender, Quality, Voice, builtin_voices, infer_gender, is_natural};
pub use select::{ChoiceSource, VoiceChoice, VoicePreference, VoiceRequest, select_voice};
