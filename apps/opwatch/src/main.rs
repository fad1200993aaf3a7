use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{EventStreamListener, Method, OperationClient, OperationRequest, StreamEvent};
use event_queue::{EventQueue, OperationOutcome};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "opwatch",
    version,
    about = "Track asynchronous operations of a container/VM management API"
)]
struct Args {
    #[arg(long, default_value = "opwatch.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    project: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log every operation event until interrupted.
    Watch {
        #[arg(long)]
        all_projects: bool,
    },
    /// Submit a mutating request and wait for its operation to finish.
    Run {
        #[arg(long, default_value = "POST")]
        method: String,
        #[arg(long)]
        path: String,
        /// JSON request body.
        #[arg(long)]
        body: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config)?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(project) = args.project {
        settings.project = Some(project);
    }
    if let Command::Watch { all_projects: true } = args.command {
        settings.all_projects = true;
    }

    let queue = EventQueue::new(settings.queue_settings());
    let sweeper = queue.spawn_expiry_sweeper(settings.sweep_interval());
    let listener = EventStreamListener::new(
        &settings.server_url,
        queue.clone(),
        settings.listener_settings(),
    )
    .context("failed to configure event stream")?;
    let events = listener.subscribe();
    let stream_task = listener.spawn();

    let result = match args.command {
        Command::Watch { .. } => watch(events).await,
        Command::Run { method, path, body } => {
            match build_request(&method, &path, body.as_deref(), settings.project.as_deref()) {
                Ok(request) => {
                    let client = OperationClient::new(settings.server_url.clone(), queue);
                    run(&client, events, &request).await
                }
                Err(err) => Err(err),
            }
        }
    };

    stream_task.abort();
    sweeper.abort();
    result
}

fn build_request(
    method: &str,
    path: &str,
    body: Option<&str>,
    project: Option<&str>,
) -> Result<OperationRequest> {
    let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method '{method}'"))?;
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let mut request = OperationRequest::new(method, path);
    if let Some(body) = body {
        let body: serde_json::Value =
            serde_json::from_str(body).context("request body must be valid JSON")?;
        request = request.body(body);
    }
    if let Some(project) = project {
        request = request.project(project);
    }
    Ok(request)
}

async fn watch(mut events: broadcast::Receiver<StreamEvent>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted; stopping");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(StreamEvent::Operation(event)) => {
                    let metadata = &event.metadata;
                    info!(
                        operation_id = %metadata.id,
                        status = ?metadata.status,
                        description = %metadata.description,
                        project = event.project.as_deref().unwrap_or("default"),
                        err = %metadata.err,
                        "operation event"
                    );
                }
                Ok(StreamEvent::Connected) => info!("watching operation events"),
                Ok(StreamEvent::Disconnected { reason }) => warn!(%reason, "event stream lost"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "fell behind the event stream"),
                Err(RecvError::Closed) => bail!("event stream listener stopped"),
            }
        }
    }
}

async fn wait_until_connected(events: &mut broadcast::Receiver<StreamEvent>) -> Result<()> {
    tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(StreamEvent::Connected) => return Ok(()),
                Ok(StreamEvent::Disconnected { reason }) => {
                    warn!(%reason, "event stream not available yet; retrying");
                }
                Ok(StreamEvent::Operation(_)) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("event stream listener stopped"),
            }
        }
    })
    .await
    .context("timed out connecting to the event stream")?
}

async fn run(
    client: &OperationClient,
    mut events: broadcast::Receiver<StreamEvent>,
    request: &OperationRequest,
) -> Result<()> {
    // Subscribe before submitting so the completion cannot be missed.
    wait_until_connected(&mut events).await?;

    let outcome = client
        .submit_and_wait(request)
        .await
        .with_context(|| format!("{} {} failed", request.method, request.path))?;

    match outcome {
        OperationOutcome::Success => {
            println!("{} {}: operation succeeded", request.method, request.path);
            Ok(())
        }
        OperationOutcome::Failure(message) => {
            bail!("{} {}: operation failed: {message}", request.method, request.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_normalizes_method_and_path() {
        let request = build_request(
            "post",
            "1.0/instances/c1/state",
            Some(r#"{"action":"restart","force":true}"#),
            Some("dev"),
        )
        .expect("request");

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "/1.0/instances/c1/state");
        assert_eq!(
            request.query,
            vec![("project".to_string(), "dev".to_string())]
        );
        assert_eq!(
            request.body,
            Some(serde_json::json!({ "action": "restart", "force": true }))
        );
    }

    #[test]
    fn build_request_rejects_invalid_json_body() {
        let err = build_request("PUT", "/1.0/profiles/default", Some("{oops"), None)
            .expect_err("invalid body");
        assert!(
            err.to_string().contains("valid JSON"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn parses_run_subcommand() {
        let args = Args::try_parse_from([
            "opwatch",
            "--server-url",
            "http://10.0.0.5:8443",
            "run",
            "--method",
            "DELETE",
            "--path",
            "/1.0/images/abc",
        ])
        .expect("args");

        assert_eq!(args.server_url.as_deref(), Some("http://10.0.0.5:8443"));
        match args.command {
            Command::Run { method, path, body } => {
                assert_eq!(method, "DELETE");
                assert_eq!(path, "/1.0/images/abc");
                assert!(body.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
