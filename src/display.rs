//! Events sent to whatever is showing the conversation.

use std::io::Write;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::reading::{Method, Reading};
use crate::transcript::{EntryKind, Role, TranscriptEntry};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    /// A reading was drawn for the current turn.
    Reading {
        method: Method,
        reading: Reading,
        text: String,
    },
    /// The full text accumulated so far. Re-sending the same value is harmless.
    Progress { accumulated: String },
    /// An entry became part of the transcript.
    Committed { entry: TranscriptEntry },
    Cleared,
    /// The session's API key override was saved (`configured`) or removed.
    KeyUpdated { configured: bool },
    Transcript { entries: Vec<TranscriptEntry> },
    /// A request was refused before the turn started.
    Rejected { message: String },
}

pub const KEY_SAVED: &str = "API密钥已更新";
pub const KEY_MISSING: &str = "⚠️ 请输入有效的API密钥";

pub trait DisplaySink {
    fn show(&mut self, event: DisplayEvent);
}

/// Discards everything.
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn show(&mut self, _event: DisplayEvent) {}
}

/// Records events in order.
impl DisplaySink for Vec<DisplayEvent> {
    fn show(&mut self, event: DisplayEvent) {
        self.push(event);
    }
}

/// Forwards to a connection task. A closed receiver means the viewer left;
/// the turn still completes.
impl DisplaySink for mpsc::UnboundedSender<DisplayEvent> {
    fn show(&mut self, event: DisplayEvent) {
        if self.send(event).is_err() {
            debug!("Display receiver dropped, event discarded");
        }
    }
}

/// Writes to a terminal, printing only the new suffix of each progress update.
pub struct TerminalDisplay<W: Write> {
    out: W,
    printed: usize,
}

impl<W: Write> TerminalDisplay<W> {
    pub fn new(out: W) -> Self {
        Self { out, printed: 0 }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> DisplaySink for TerminalDisplay<W> {
    fn show(&mut self, event: DisplayEvent) {
        // Write failures are ignored.
        let _ = match event {
            DisplayEvent::Reading { text, .. } => {
                self.printed = 0;
                writeln!(self.out, "{}\n", text)
            }
            DisplayEvent::Progress { accumulated } => {
                let delta = accumulated.get(self.printed..).unwrap_or("");
                self.printed = accumulated.len();
                write!(self.out, "{}", delta)
            }
            // The user typed it; no need to echo.
            DisplayEvent::Committed { entry } if entry.role == Role::User => Ok(()),
            DisplayEvent::Committed { entry } => {
                let streamed = std::mem::take(&mut self.printed) > 0;
                match (streamed, entry.kind) {
                    (true, EntryKind::Message) => writeln!(self.out),
                    (true, _) => writeln!(self.out, "\n{}", entry.content),
                    (false, _) => writeln!(self.out, "{}", entry.content),
                }
            }
            DisplayEvent::Cleared => writeln!(self.out, "(对话历史已清除)"),
            DisplayEvent::KeyUpdated { configured: true } => writeln!(self.out, "{}", KEY_SAVED),
            DisplayEvent::KeyUpdated { configured: false } => writeln!(self.out, "{}", KEY_MISSING),
            DisplayEvent::Transcript { entries } => entries.iter().try_for_each(|entry| {
                writeln!(self.out, "{} {:?}: {}", entry.timestamp, entry.role, entry.content)
            }),
            DisplayEvent::Rejected { message } => writeln!(self.out, "{}", message),
        };
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_prints_only_new_suffix() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show(DisplayEvent::Progress {
            accumulated: "卦象".to_string(),
        });
        display.show(DisplayEvent::Progress {
            accumulated: "卦象解读：".to_string(),
        });
        display.show(DisplayEvent::Progress {
            accumulated: "卦象解读：".to_string(),
        });
        display.show(DisplayEvent::Committed {
            entry: TranscriptEntry::assistant("卦象解读："),
        });
        let out = String::from_utf8(display.into_inner()).unwrap();
        assert_eq!(out, "卦象解读：\n");
    }

    #[test]
    fn test_terminal_prints_unstreamed_commit() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show(DisplayEvent::Committed {
            entry: TranscriptEntry::new(Role::Assistant, EntryKind::Warning, "⚠️ no key"),
        });
        let out = String::from_utf8(display.into_inner()).unwrap();
        assert_eq!(out, "⚠️ no key\n");
    }

    #[test]
    fn test_terminal_prints_error_after_partial_text() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show(DisplayEvent::Progress {
            accumulated: "卦".to_string(),
        });
        display.show(DisplayEvent::Committed {
            entry: TranscriptEntry::new(Role::Assistant, EntryKind::Error, "❌ failed"),
        });
        let out = String::from_utf8(display.into_inner()).unwrap();
        assert_eq!(out, "卦\n❌ failed\n");
    }

    #[test]
    fn test_terminal_reports_key_updates() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show(DisplayEvent::KeyUpdated { configured: true });
        display.show(DisplayEvent::KeyUpdated { configured: false });
        let out = String::from_utf8(display.into_inner()).unwrap();
        assert_eq!(out, "API密钥已更新\n⚠️ 请输入有效的API密钥\n");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DisplayEvent::Progress {
            accumulated: "大吉".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["accumulated"], "大吉");
    }

    #[tokio::test]
    async fn test_channel_sink_survives_closed_receiver() {
        let (mut tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.show(DisplayEvent::Cleared);
    }
}
