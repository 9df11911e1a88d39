use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::ApiKey;
use crate::display::{DisplayEvent, DisplaySink};
use crate::error::DivinationError;
use crate::interpreter::{fallback_text, InterpretRequest, Interpreter};
use crate::reading::{Method, Reading, ReadingGenerator};
use crate::relay::{RelayOutcome, StreamingRelay};
use crate::transcript::{EntryKind, Role, Transcript, TranscriptEntry};

pub const MISSING_KEY_WARNING: &str = "⚠️ API密钥未设置或使用默认密钥，无法调用AI模型进行深度解读。请在侧边栏输入您的ModelScope API密钥以启用AI功能。";

/// One interactive conversation. Created by the caller, passed into every
/// turn, dropped when the conversation ends.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    transcript: Transcript,
    api_key_override: Option<String>,
    method: Method,
}

/// How a completed turn ended. Every variant means exactly one user entry
/// and one assistant entry were appended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Interpreted(TranscriptEntry),
    /// No credential, nothing was sent.
    MissingCredential(TranscriptEntry),
    /// The provider call failed before streaming began.
    Fallback(TranscriptEntry),
    /// The stream broke off; partial text was discarded.
    StreamFailed(TranscriptEntry),
}

impl TurnOutcome {
    pub fn entry(&self) -> &TranscriptEntry {
        match self {
            TurnOutcome::Interpreted(entry)
            | TurnOutcome::MissingCredential(entry)
            | TurnOutcome::Fallback(entry)
            | TurnOutcome::StreamFailed(entry) => entry,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            transcript: Transcript::new(),
            api_key_override: None,
            method: Method::PlumBlossom,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Replace the environment credential for this session only. A blank
    /// value removes the override.
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.api_key_override = if key.trim().is_empty() { None } else { Some(key) };
    }

    pub fn api_key(&self) -> Option<ApiKey> {
        ApiKey::resolve(self.api_key_override.as_deref())
    }

    pub fn clear(&mut self) {
        info!(session = %self.id, entries = self.transcript.len(), "Clearing transcript");
        self.transcript.clear();
    }

    fn commit<D: DisplaySink + ?Sized>(
        &mut self,
        kind: EntryKind,
        content: String,
        display: &mut D,
    ) -> TranscriptEntry {
        let entry = self
            .transcript
            .append(TranscriptEntry::new(Role::Assistant, kind, content))
            .clone();
        display.show(DisplayEvent::Committed {
            entry: entry.clone(),
        });
        entry
    }
}

/// Run one full turn: reading, provider call, relay, commit.
///
/// An unsupported method is rejected before anything is appended. Every
/// other path appends one user entry and then exactly one assistant entry.
#[instrument(skip_all, fields(session = %session.id(), method = method_name))]
pub async fn run_turn<G, D>(
    session: &mut Session,
    method_name: &str,
    question: &str,
    generator: &mut G,
    interpreter: &dyn Interpreter,
    display: &mut D,
) -> Result<TurnOutcome, DivinationError>
where
    G: ReadingGenerator + ?Sized,
    D: DisplaySink + ?Sized,
{
    let reading = generator.generate_named(method_name)?;
    let method = reading.method();
    session.set_method(method);

    let user_entry = session
        .transcript
        .append(TranscriptEntry::user(question))
        .clone();
    display.show(DisplayEvent::Committed { entry: user_entry });

    show_reading(&reading, display);

    let Some(key) = session.api_key() else {
        warn!("No API key configured, skipping interpretation");
        let entry = session.commit(EntryKind::Warning, MISSING_KEY_WARNING.to_string(), display);
        return Ok(TurnOutcome::MissingCredential(entry));
    };

    let request = InterpretRequest::new(question, reading);
    let fragments = match interpreter.stream(&key, &request).await {
        Ok(fragments) => fragments,
        Err(e) => {
            warn!(error = %e, "Interpretation provider unavailable, committing fallback");
            let entry = session.commit(EntryKind::Fallback, fallback_text(&request.reading), display);
            return Ok(TurnOutcome::Fallback(entry));
        }
    };

    let outcome = StreamingRelay::new()
        .run(fragments, display, &mut session.transcript)
        .await;

    Ok(match outcome {
        RelayOutcome::Committed(entry) => TurnOutcome::Interpreted(entry),
        RelayOutcome::Failed { entry, .. } => TurnOutcome::StreamFailed(entry),
    })
}

fn show_reading<D: DisplaySink + ?Sized>(reading: &Reading, display: &mut D) {
    display.show(DisplayEvent::Reading {
        method: reading.method(),
        reading: reading.clone(),
        text: reading.summary(),
    });
}
