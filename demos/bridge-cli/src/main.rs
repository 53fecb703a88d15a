//! Dispatch one task over the bridge and follow it to the end.
//!
//! ```text
//! bridge-cli VIDEO_GENERATION -p prompt="a cat on a skateboard" -p steps=40
//! bridge-cli AMAZON_POLLUTION -p username=alice -p password=... --require username --require password
//! ```
//!
//! Log lines go to stdout/stderr as they arrive, OTP prompts are answered on
//! stdin, and Ctrl-C cancels the run.

use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use futures::StreamExt;
use serde_json::Value;
use task_bridge_core::{
    BridgeConfig, BridgeError, LogStream, RunStatus, RunUpdate, TaskRequest,
    config::validate_endpoint,
};
use task_bridge_session::{SessionController, TaskRunner, storage::JsonFileHistory};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bridge-cli", about = "Dispatch a task over the realtime task bridge")]
struct Cli {
    /// Task kind, e.g. VIDEO_GENERATION
    task: String,

    /// Task parameter as key=value (value parsed as JSON when possible)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Parameter that must be present and non-empty
    #[arg(long = "require")]
    required: Vec<String>,

    /// Bridge endpoint (ws:// or wss://)
    #[arg(long, env = "TASK_BRIDGE_URL")]
    url: Option<String>,

    /// Connection timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Bearer token attached to the job
    #[arg(long, env = "TASK_BRIDGE_TOKEN")]
    token: Option<String>,

    /// History file (defaults to the platform data dir)
    #[arg(long)]
    history: Option<PathBuf>,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = BridgeConfig::from_env()?;
    if let Some(url) = cli.url {
        config.endpoint_url = validate_endpoint(url)?;
    }
    if let Some(secs) = cli.timeout {
        config.connect_timeout = Duration::from_secs(secs.max(1));
    }
    let token = cli.token.or_else(|| config.token.clone());

    let history_path = cli
        .history
        .or_else(JsonFileHistory::default_path)
        .context("no platform data directory; pass --history")?;
    tracing::info!("Recording history to {}", history_path.display());

    let controller = SessionController::websocket(config);
    let runner = TaskRunner::with_history(controller, Arc::new(JsonFileHistory::new(history_path)));

    let mut request = TaskRequest::new(cli.task).require(cli.required);
    for (key, value) in cli.params {
        request = request.param(key, value);
    }
    if let Some(token) = token {
        request = request.with_token(token);
    }

    let mut updates = runner.feed().until_finished();
    let run_id = tokio::select! {
        dispatched = runner.dispatch(request) => dispatched.context("dispatch failed")?,
        _ = tokio::signal::ctrl_c() => {
            runner.cancel();
            bail!("cancelled before the task was dispatched");
        }
    };
    tracing::info!("Run {run_id} dispatched");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(RunUpdate::Log(line)) => match line.stream {
                    LogStream::Stdout => println!("{}", line.line),
                    LogStream::Stderr => eprintln!("{}", line.line),
                },
                Some(RunUpdate::Status { status }) => tracing::debug!("Run status: {status:?}"),
                Some(RunUpdate::OtpRequired { prompt }) => {
                    answer_otp(&runner, &prompt, &mut stdin).await?;
                }
                Some(RunUpdate::Finished { .. }) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling...");
                runner.cancel();
            }
        }
    }

    let run = runner.wait_finished().await;
    match (run.status, run.result_url()) {
        (RunStatus::Succeeded, Some(url)) => {
            println!("{url}");
            Ok(())
        }
        _ => {
            let reason = run
                .failure
                .map_or_else(|| "unknown".to_string(), |f| f.to_string());
            bail!("run failed: {reason}")
        }
    }
}

/// Read passcodes from stdin until one is accepted.
///
/// EOF or Ctrl-C cancels the run. Returns early if the run ends meanwhile.
async fn answer_otp(
    runner: &TaskRunner,
    prompt: &str,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<()> {
    loop {
        eprint!("{prompt}: ");
        std::io::stderr().flush()?;

        let interrupt = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let line = tokio::select! {
            line = next_line_or(stdin, interrupt) => line?,
            _ = runner.wait_finished() => return Ok(()),
        };
        let Some(code) = line else {
            eprintln!("Cancelling...");
            runner.cancel();
            return Ok(());
        };
        match runner.submit_otp(&code) {
            Ok(()) => return Ok(()),
            Err(BridgeError::Validation(e)) => eprintln!("{e}"),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Next line, or `None` on EOF or once `interrupt` fires.
async fn next_line_or<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = ()>,
) -> std::io::Result<Option<String>> {
    tokio::select! {
        line = lines.next_line() => line,
        () = interrupt => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_interrupt_ends_pending_read() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        let line = next_line_or(&mut lines, std::future::ready(())).await.unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn test_line_read_without_interrupt() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"424242\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = next_line_or(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(line.as_deref(), Some("424242"));
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("steps=40").unwrap(),
            ("steps".to_string(), Value::from(40))
        );
        assert_eq!(
            parse_param("prompt=a cat").unwrap(),
            ("prompt".to_string(), Value::from("a cat"))
        );
        assert_eq!(
            parse_param("keywords=[\"desk\"]").unwrap().1,
            serde_json::json!(["desk"])
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }
}
