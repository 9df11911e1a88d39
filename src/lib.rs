pub mod chat;
pub mod config;
pub mod constants;
pub mod display;
pub mod error;
pub mod fragments;
pub mod interpreter;
pub mod openai;
pub mod reading;
pub mod relay;
pub mod session;
pub mod transcript;
pub mod web_server;

pub use config::{ApiKey, InterpreterConfig};
pub use error::{DivinationError, InterpretError};
pub use reading::{Method, Reading, ReadingGenerator};
pub use session::{run_turn, Session, TurnOutcome};
pub use transcript::{EntryKind, Role, Transcript, TranscriptEntry};
