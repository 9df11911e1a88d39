// Interactive terminal chat. Each line is a question for the current method;
// lines starting with '/' are commands.

use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::display::{DisplayEvent, DisplaySink, TerminalDisplay};
use crate::interpreter::Interpreter;
use crate::reading::{Method, ReadingGenerator};
use crate::session::{run_turn, Session};

const HELP: &str = "命令：/method <名称>  /methods  /key <API密钥>  /clear  /history  /quit";

#[derive(Debug, PartialEq, Eq)]
enum ChatCommand<'a> {
    Ask(&'a str),
    Method(&'a str),
    Methods,
    Key(&'a str),
    Clear,
    History,
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_line(line: &str) -> Option<ChatCommand<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(ChatCommand::Ask(line));
    };
    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let arg = arg.trim();
    Some(match name {
        "method" => ChatCommand::Method(arg),
        "methods" => ChatCommand::Methods,
        "key" => ChatCommand::Key(arg),
        "clear" => ChatCommand::Clear,
        "history" => ChatCommand::History,
        "help" => ChatCommand::Help,
        "quit" | "exit" => ChatCommand::Quit,
        other => ChatCommand::Unknown(other),
    })
}

/// Run a chat session until `/quit` or end of input.
pub async fn run_chat<R, W, G>(
    input: R,
    out: W,
    session: &mut Session,
    generator: &mut G,
    interpreter: &dyn Interpreter,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
    G: ReadingGenerator + ?Sized,
{
    info!(session = %session.id(), "Starting chat session");
    let mut display = TerminalDisplay::new(out);
    writeln!(display.writer(), "🔮 智能占卜师 ({})  {}", session.method(), HELP)?;
    if session.api_key().is_none() {
        warn!("No API key configured for chat session");
    }

    let mut lines = input.lines();
    loop {
        write!(display.writer(), "[{}] > ", session.method())?;
        display.writer().flush()?;

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            writeln!(display.writer())?;
            break;
        };

        match parse_line(&line) {
            None => continue,
            Some(ChatCommand::Quit) => break,
            Some(ChatCommand::Ask(question)) => {
                let method = session.method().name();
                if let Err(e) = run_turn(session, method, question, generator, interpreter, &mut display).await {
                    display.show(DisplayEvent::Rejected {
                        message: e.to_string(),
                    });
                }
            }
            Some(ChatCommand::Method(name)) => match name.parse::<Method>() {
                Ok(method) => {
                    session.set_method(method);
                    writeln!(display.writer(), "{}：{}", method, method.description())?;
                }
                Err(e) => display.show(DisplayEvent::Rejected {
                    message: e.to_string(),
                }),
            },
            Some(ChatCommand::Methods) => {
                for method in Method::ALL {
                    writeln!(
                        display.writer(),
                        "{} ({}) - {}",
                        method,
                        method.slug(),
                        method.description()
                    )?;
                }
            }
            Some(ChatCommand::Key(key)) => {
                session.set_api_key(key);
                display.show(DisplayEvent::KeyUpdated {
                    configured: session.api_key().is_some(),
                });
            }
            Some(ChatCommand::Clear) => {
                session.clear();
                display.show(DisplayEvent::Cleared);
            }
            Some(ChatCommand::History) => display.show(DisplayEvent::Transcript {
                entries: session.transcript().all().to_vec(),
            }),
            Some(ChatCommand::Help) => writeln!(display.writer(), "{}", HELP)?,
            Some(ChatCommand::Unknown(name)) => writeln!(display.writer(), "未知命令 /{}。{}", name, HELP)?,
        }
    }

    info!(session = %session.id(), entries = session.transcript().len(), "Chat session finished");
    Ok(())
}
