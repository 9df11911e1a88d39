use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::{error, info};

use divina::config::{ApiKey, InterpreterConfig};
use divina::constants;
use divina::interpreter::{interpret_or_fallback, stream_or_fallback, InterpretRequest, INTERPRETATION_HEADER};
use divina::openai::ModelScopeClient;
use divina::reading::{Method, RandomReadings, ReadingGenerator};
use divina::session::{Session, MISSING_KEY_WARNING};
use divina::{chat, web_server};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// OpenAI-compatible base URL of the interpretation provider.
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Model identifier sent with every request.
    #[arg(long, global = true)]
    model: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the divination web server.
    Serve {
        #[arg(long, env = "DIVINA_PORT", default_value_t = constants::DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
    },
    /// Chat with the diviner in the terminal.
    Chat {
        #[arg(long, default_value = "梅花易数", help = "Divination method to start with.")]
        method: Method,
        #[arg(long, help = "API key overriding MODELSCOPE_API_KEY.")]
        api_key: Option<String>,
    },
    /// Draw one reading and print its interpretation.
    Read {
        #[arg(long, help = "Divination method (Chinese name or slug).")]
        method: Method,
        #[arg(long, help = "The question to ask.")]
        question: String,
        #[arg(long, help = "Wait for the complete answer instead of streaming.")]
        no_stream: bool,
        #[arg(long, help = "API key overriding MODELSCOPE_API_KEY.")]
        api_key: Option<String>,
    },
    /// List the supported divination methods.
    Methods,
}

fn interpreter_config(cli: &Cli) -> InterpreterConfig {
    let mut config = InterpreterConfig::from_env();
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url.as_str());
    }
    if let Some(model) = &cli.model {
        config = config.with_model(model.as_str());
    }
    config
}

async fn read_once(
    client: &ModelScopeClient,
    method: Method,
    question: String,
    no_stream: bool,
    api_key: Option<String>,
) -> Result<()> {
    let reading = RandomReadings::from_os_rng().generate(method);
    let mut stdout = std::io::stdout();

    let Some(key) = ApiKey::resolve(api_key.as_deref()) else {
        writeln!(stdout, "{}\n\n{}", reading, MISSING_KEY_WARNING)?;
        return Ok(());
    };

    let request = InterpretRequest::new(question, reading);
    if no_stream {
        let text = interpret_or_fallback(client, &key, &request).await;
        writeln!(stdout, "{}\n\n{}{}", request.reading, INTERPRETATION_HEADER, text)?;
        return Ok(());
    }

    // Errors arrive as notice fragments, so every item is Ok.
    let mut fragments = stream_or_fallback(client, &key, &request).await;
    while let Some(Ok(text)) = fragments.next().await {
        write!(stdout, "{}", text)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for MODELSCOPE_API_KEY and friends)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g., RUST_LOG=info,divina=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!("Divina starting with command: {:?}", cli.command);

    let config = interpreter_config(&cli);
    let model = config.model.clone();
    let client = ModelScopeClient::new(config).context("Failed to initialize interpretation client")?;

    match cli.command {
        Commands::Serve { port } => {
            info!("Starting web server on port {}...", port);
            let interpreter = Arc::new(client);

            let mut web_server_handle = tokio::spawn(async move {
                if let Err(e) = web_server::start_web_server(port, interpreter, model).await {
                    error!("Web server failed: {:?}", e);
                }
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, initiating shutdown...");
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(_) => info!("Web server task completed unexpectedly."),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            if !web_server_handle.is_finished() {
                info!("Aborting web server task...");
                web_server_handle.abort();
            }
            info!("Shutdown complete.");
        }
        Commands::Chat { method, api_key } => {
            let mut session = Session::new();
            session.set_method(method);
            if let Some(key) = api_key {
                session.set_api_key(key);
            }
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            chat::run_chat(
                stdin,
                std::io::stdout(),
                &mut session,
                &mut RandomReadings::from_os_rng(),
                &client,
            )
            .await
            .context("Chat session failed")?;
        }
        Commands::Read {
            method,
            question,
            no_stream,
            api_key,
        } => {
            read_once(&client, method, question, no_stream, api_key).await?;
        }
        Commands::Methods => {
            for method in Method::ALL {
                println!("{}\t{}\t{}", method, method.slug(), method.description());
            }
        }
    }

    Ok(())
}
