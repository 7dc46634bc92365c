//! Console composition root: console drivers, WebSocket channel and HTTP
//! session service wired to one controller.

use crate::channel::ws::WsChannel;
use crate::cli::ChatArgs;
use crate::config::Config;
use crate::controller::{
    self, ControllerHandle, ControllerSettings, ControllerUpdate, NoticeLevel, Ports, Snapshot,
    event_channel,
};
use crate::engine::http::HttpSessionService;
use crate::error::{CoraError, Result};
use crate::session::{Message, Mood, Role, Scenario};
use crate::speech::{ConsoleSpeaker, ScriptedInput};
use crate::voice::catalog::{Gender, Quality, Voice, builtin_voices};
use crate::voice::select::{VoicePreference, VoiceRequest, select_voice};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;

const HELP: &str = "\
Type a message and press Enter to send it. Commands:
  /say <phrase>       speak a phrase (heard only while listening)
  /fail <code>        simulate a recognition error (e.g. no-speech, network)
  /voice on|off       toggle voice mode
  /mute on|off        stop or resume speaking Cora's replies
  /pause  /resume     pause or resume the conversation
  /scenario <kind>    product, complaint, return or technical
  /new [mood]         start a fresh conversation
  /end                end the conversation
  /analyze            score the conversation
  /status             show the current state
  /quit               leave";

/// One line typed at the chat prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Text(String),
    Say(String),
    Fail(String),
    Voice(bool),
    Mute(bool),
    Pause,
    Resume,
    Scenario(Scenario),
    New(Option<Mood>),
    End,
    Analyze,
    Status,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_console_line(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ConsoleCommand::Text(line.to_string());
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name.to_ascii_lowercase().as_str(), arg) {
        ("say", "") => ConsoleCommand::Invalid("usage: /say <phrase>".to_string()),
        ("say", phrase) => ConsoleCommand::Say(phrase.to_string()),
        ("fail", "") => ConsoleCommand::Invalid("usage: /fail <code>".to_string()),
        ("fail", code) => ConsoleCommand::Fail(code.to_string()),
        ("voice", arg) | ("mute", arg) => match on_off(arg) {
            Some(on) if name.eq_ignore_ascii_case("voice") => ConsoleCommand::Voice(on),
            Some(on) => ConsoleCommand::Mute(on),
            None => ConsoleCommand::Invalid(format!("usage: /{} on|off", name)),
        },
        ("pause", _) => ConsoleCommand::Pause,
        ("resume", _) => ConsoleCommand::Resume,
        ("scenario", kind) => match kind.parse() {
            Ok(scenario) => ConsoleCommand::Scenario(scenario),
            Err(e) => ConsoleCommand::Invalid(e),
        },
        ("new", "") => ConsoleCommand::New(None),
        ("new", mood) => match mood.parse() {
            Ok(mood) => ConsoleCommand::New(Some(mood)),
            Err(e) => ConsoleCommand::Invalid(e),
        },
        ("end", _) => ConsoleCommand::End,
        ("analyze", _) => ConsoleCommand::Analyze,
        ("status", _) => ConsoleCommand::Status,
        ("help", _) | ("?", _) => ConsoleCommand::Help,
        ("quit", _) | ("exit", _) => ConsoleCommand::Quit,
        (other, _) => ConsoleCommand::Invalid(format!("unknown command '/{}' (try /help)", other)),
    }
}

fn on_off(arg: &str) -> Option<bool> {
    match arg.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Text for one controller update, or `None` for updates the console hides.
pub fn render_update(update: &ControllerUpdate) -> Option<String> {
    match update {
        ControllerUpdate::MessageAppended(message) => Some(render_message(message)),
        ControllerUpdate::ModeChanged { to, .. } => {
            Some(format!("  ({})", to.description()).dimmed().to_string())
        }
        ControllerUpdate::Notice { level, message } => Some(match level {
            NoticeLevel::Info => message.cyan().to_string(),
            NoticeLevel::Warning => format!("warning: {}", message).yellow().to_string(),
            NoticeLevel::Error => format!("error: {}", message).red().to_string(),
        }),
        ControllerUpdate::Connection(state) => {
            Some(format!("  (channel {})", state).dimmed().to_string())
        }
        ControllerUpdate::SessionStarted { id, mood } => Some(
            format!("Session {} started, Cora is {}", id.short(), mood)
                .green()
                .to_string(),
        ),
        ControllerUpdate::SessionEnded { .. } => None,
    }
}

fn render_message(message: &Message) -> String {
    let time = message.timestamp.format("%H:%M:%S");
    match message.role {
        Role::User => format!("{} {} {}", time.dimmed(), "You:".bold(), message.content),
        Role::Agent => format!(
            "{} {} {}",
            time.dimmed(),
            "Cora:".magenta().bold(),
            message.content
        ),
        Role::System => format!("{} {}", time.dimmed(), message.content.dimmed()),
    }
}

pub fn render_status(snapshot: &Snapshot) -> String {
    let session = snapshot
        .session_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".to_string());
    let state = match (snapshot.active, snapshot.paused) {
        (true, true) => "paused",
        (true, false) => "active",
        (false, _) => "ended",
    };
    let lines = [
        format!("  {}      {} ({})", "Session:".dimmed(), session, state),
        format!("  {}         {}", "Mood:".dimmed(), snapshot.mood),
        format!(
            "  {}   {} (voice {}, auto-speak {})",
            "Voice mode:".dimmed(),
            snapshot.mode,
            if snapshot.voice_enabled { "on" } else { "off" },
            if snapshot.auto_speak { "on" } else { "off" }
        ),
        format!(
            "  {}  {}",
            "Voice lock:".dimmed(),
            snapshot
                .voice_lock
                .as_ref()
                .map(|v| v.name.as_str())
                .unwrap_or("none")
        ),
        format!("  {}      {}", "Channel:".dimmed(), snapshot.connection),
        format!("  {}    {}", "Exchanges:".dimmed(), snapshot.exchange_count()),
    ];
    lines.join("\n")
}

/// Run the interactive chat until `/quit` or end of input.
pub async fn run_chat(config: Config, args: ChatArgs) -> Result<()> {
    config.validate()?;
    let mut settings = ControllerSettings::from_config(&config);
    if args.mute {
        settings.machine.auto_speak = false;
    }

    let (sink, inbox) = event_channel();
    let speaker =
        Arc::new(ConsoleSpeaker::new(sink.clone()).with_broken_voices(args.broken_voices.clone()));
    let input = Arc::new(ScriptedInput::new(sink.clone(), config.voice.locale.clone()));
    let channel = Arc::new(WsChannel::open(&config.engine.channel_url, sink.clone()));
    let sessions = Arc::new(HttpSessionService::new(
        &config.engine.base_url,
        config.engine.request_timeout(),
    )?);
    let ports = Ports {
        input: input.clone(),
        output: speaker,
        channel,
        sessions,
    };
    let (handle, task) = controller::spawn(settings, ports, sink, inbox);
    let renderer = tokio::spawn(render_updates(handle.subscribe()));

    let mood = args.mood.unwrap_or(config.conversation.mood);
    handle.start_new(mood).await?;
    if args.voice {
        handle.set_voice(true).await?;
    }
    if let Some(scenario) = args.scenario {
        handle.load_scenario(scenario).await?;
    }
    eprintln!("{}", HELP.dimmed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_console_command(&handle, &input, parse_console_line(&line)).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(CoraError::ControllerClosed) => break,
            Err(e) => eprintln!("{}", format!("error: {}", e).red()),
        }
    }

    handle.shutdown();
    if let Err(e) = task.await {
        warn!(error = %e, "controller task failed");
    }
    renderer.abort();
    Ok(())
}

async fn render_updates(mut updates: broadcast::Receiver<ControllerUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => {
                if let Some(line) = render_update(&update) {
                    println!("{}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "console fell behind controller updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// `Ok(false)` means leave the chat.
async fn run_console_command(
    handle: &ControllerHandle,
    input: &ScriptedInput,
    command: ConsoleCommand,
) -> Result<bool> {
    match command {
        ConsoleCommand::Empty => {}
        ConsoleCommand::Text(text) => {
            if !handle.send_text(text).await? {
                eprintln!("{}", "No open conversation; use /new or /resume.".yellow());
            }
        }
        ConsoleCommand::Say(phrase) => {
            if !input.hear(&phrase) {
                eprintln!("{}", "(the microphone is off; nothing was heard)".dimmed());
            }
        }
        ConsoleCommand::Fail(code) => input.fail(&code),
        ConsoleCommand::Voice(on) => {
            if !handle.set_voice(on).await? {
                eprintln!("{}", "Voice mode unchanged.".yellow());
            }
        }
        ConsoleCommand::Mute(muted) => handle.set_auto_speak(!muted)?,
        ConsoleCommand::Pause => handle.pause().await?,
        ConsoleCommand::Resume => handle.resume().await?,
        ConsoleCommand::Scenario(scenario) => {
            if !handle.load_scenario(scenario).await? {
                eprintln!("{}", "No open conversation for a scenario.".yellow());
            }
        }
        ConsoleCommand::New(mood) => {
            let mood = match mood {
                Some(mood) => mood,
                None => handle.snapshot().await?.mood,
            };
            handle.start_new(mood).await?;
        }
        ConsoleCommand::End => {
            if !handle.end().await? {
                eprintln!("{}", "No active conversation.".yellow());
            }
        }
        ConsoleCommand::Analyze => {
            eprintln!("{}", "Analyzing conversation...".dimmed());
            let report = handle.analyze().await?;
            println!("{}", report.summary());
        }
        ConsoleCommand::Status => println!("{}", render_status(&handle.snapshot().await?)),
        ConsoleCommand::Help => eprintln!("{}", HELP),
        ConsoleCommand::Quit => return Ok(false),
        ConsoleCommand::Invalid(message) => eprintln!("{}", message.yellow()),
    }
    Ok(true)
}

/// Print the catalog for `locale` and what each preference would resolve to.
pub fn list_voices(locale: &str, gender: Option<Gender>, quality: Quality) {
    let catalog = builtin_voices();
    let shown: Vec<&Voice> = catalog
        .iter()
        .filter(|v| v.speaks(locale))
        .filter(|v| gender.is_none_or(|g| v.gender() == g))
        .collect();

    println!("Voices for {} ({} of {}):", locale, shown.len(), catalog.len());
    for voice in shown {
        let natural = if voice.is_natural() {
            "natural".green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<40} {} {:<7} {}",
            voice.name,
            format!("{:<6}", voice.lang).dimmed(),
            voice.gender().to_string(),
            natural
        );
    }

    println!("\nWith quality '{}':", quality);
    let mut rng = rand::thread_rng();
    for preference in [
        VoicePreference::Gender(Gender::Female),
        VoicePreference::Gender(Gender::Male),
        VoicePreference::Random,
    ] {
        let request = VoiceRequest {
            preference: &preference,
            quality,
            locale,
            locked: None,
            excluded: &[],
        };
        let choice = select_voice(&catalog, &request, &mut rng);
        let picked = choice
            .voice
            .map(|v| v.name)
            .unwrap_or_else(|| "engine default".to_string());
        let note = if preference == VoicePreference::Random {
            " (example; locked per session)"
        } else {
            ""
        };
        println!(
            "  {:<8} -> {}{}",
            preference.to_string(),
            picked.bold(),
            note.dimmed()
        );
    }
}
