//! Speech engine ports and the console drivers.

pub mod console;
pub mod input;
pub mod output;

pub use console::{ConsoleSpeaker, ScriptedInput};
pub use input::{RecognitionFailure, SpeechInput, SpeechInputEvent};
pub use output::{
    SpeechOutput, SpeechOutputEvent, SynthesisFailure, UtteranceId, UtteranceRequest,
};
