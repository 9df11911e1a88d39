//! Bridges a fragment stream to the display and the transcript.
//!
//! The relay owns the only writer to the accumulation buffer. Every fragment
//! is appended in arrival order and the whole buffer is republished, so a
//! viewer that misses an update loses nothing. When the stream ends the
//! buffer becomes exactly one assistant entry; if the stream fails instead,
//! the buffer is thrown away and a distinct error entry is committed.

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::display::{DisplayEvent, DisplaySink};
use crate::error::InterpretError;
use crate::fragments::FragmentStream;
use crate::transcript::{EntryKind, Role, Transcript, TranscriptEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Streaming,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Committed(TranscriptEntry),
    /// `discarded` is the partial text that never reached the transcript.
    Failed {
        error: InterpretError,
        entry: TranscriptEntry,
        discarded: String,
    },
}

impl RelayOutcome {
    pub fn entry(&self) -> &TranscriptEntry {
        match self {
            RelayOutcome::Committed(entry) => entry,
            RelayOutcome::Failed { entry, .. } => entry,
        }
    }
}

pub fn failure_message(error: &InterpretError) -> String {
    format!("❌ AI解读失败：{}", error)
}

#[derive(Debug)]
pub struct StreamingRelay {
    acc: String,
    state: RelayState,
    fragments: usize,
}

impl Default for StreamingRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingRelay {
    pub fn new() -> Self {
        Self {
            acc: String::new(),
            state: RelayState::Idle,
            fragments: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn accumulated(&self) -> &str {
        &self.acc
    }

    /// Apply one fragment and republish the buffer.
    pub fn push<D: DisplaySink + ?Sized>(&mut self, fragment: &str, display: &mut D) {
        debug_assert!(matches!(self.state, RelayState::Idle | RelayState::Streaming));
        self.state = RelayState::Streaming;
        self.acc.push_str(fragment);
        self.fragments += 1;
        display.show(DisplayEvent::Progress {
            accumulated: self.acc.clone(),
        });
    }

    /// Drain `fragments` to the end, then commit exactly one assistant entry.
    ///
    /// The stream is closed on every exit path.
    pub async fn run<D: DisplaySink + ?Sized>(
        mut self,
        mut fragments: FragmentStream,
        display: &mut D,
        transcript: &mut Transcript,
    ) -> RelayOutcome {
        self.state = RelayState::Streaming;

        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => self.push(&fragment, display),
                Err(error) => {
                    fragments.close();
                    return self.fail(error, display, transcript);
                }
            }
        }
        fragments.close();
        self.commit(display, transcript)
    }

    fn commit<D: DisplaySink + ?Sized>(
        mut self,
        display: &mut D,
        transcript: &mut Transcript,
    ) -> RelayOutcome {
        self.state = RelayState::Committed;
        info!(
            fragments = self.fragments,
            chars = self.acc.chars().count(),
            "Interpretation committed"
        );
        let entry = transcript
            .append(TranscriptEntry::assistant(std::mem::take(&mut self.acc)))
            .clone();
        display.show(DisplayEvent::Committed {
            entry: entry.clone(),
        });
        RelayOutcome::Committed(entry)
    }

    fn fail<D: DisplaySink + ?Sized>(
        mut self,
        error: InterpretError,
        display: &mut D,
        transcript: &mut Transcript,
    ) -> RelayOutcome {
        self.state = RelayState::Failed;
        warn!(error = %error, fragments = self.fragments, "Interpretation stream failed, discarding partial text");
        let discarded = std::mem::take(&mut self.acc);
        debug!(chars = discarded.chars().count(), "Discarded partial interpretation");
        let entry = transcript
            .append(TranscriptEntry::new(
                Role::Assistant,
                EntryKind::Error,
                failure_message(&error),
            ))
            .clone();
        display.show(DisplayEvent::Committed {
            entry: entry.clone(),
        });
        RelayOutcome::Failed {
            error,
            entry,
            discarded,
        }
    }
}
