//! fc-client - command-line front end for the futurecommander engine.
//!
//! ```text
//! fc-client [--socket|--process] <Header> [key=value ...]
//! fc-client [--socket|--process] watch [path]
//! ```
//!
//! The first form sends one request and prints the response. `watch` opens
//! `path` (default `.`) to bring the engine up, then prints every pushed
//! message until Ctrl-C.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use futurecommander_client::config::ClientConfig;
use futurecommander_client::ipc::{Discard, RpcClient, TransportKind};
use futurecommander_client::models::{Inbound, Request, KIND_COLLECTION};

const USAGE: &str = "usage: fc-client [--socket|--process] <Header> [key=value ...]\n       fc-client [--socket|--process] watch [path]";

enum Invocation {
    Send(Request),
    Watch(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "futurecommander_client=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let mut config = ClientConfig::from_env().context("Failed to load client configuration")?;
    let invocation = parse_args(std::env::args().skip(1), &mut config)?;

    tracing::debug!("Using {} transport", config.transport);

    match invocation {
        Invocation::Send(request) => send_once(&config, request).await,
        Invocation::Watch(path) => watch(&config, path).await,
    }
}

fn parse_args(args: impl Iterator<Item = String>, config: &mut ClientConfig) -> Result<Invocation> {
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--socket" => config.transport = TransportKind::Socket,
            "--process" => config.transport = TransportKind::Process,
            "-h" | "--help" => bail!("{}", USAGE),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let Some(header) = positional.next() else {
        bail!("{}", USAGE);
    };

    if header == "watch" {
        let path = positional.next().unwrap_or_else(|| ".".to_string());
        return Ok(Invocation::Watch(path));
    }

    let mut request = Request::new(header);
    for param in positional {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("Expected key=value, got {:?}", param))?;
        request = request.with_param(key, parse_value(value));
    }
    Ok(Invocation::Send(request))
}

fn parse_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

async fn send_once(config: &ClientConfig, request: Request) -> Result<()> {
    let client = RpcClient::from_config(config, Discard);
    let result = client.send(request).await;
    client.shutdown().await;

    let response = result?;
    if response.kind.as_deref() == Some(KIND_COLLECTION) {
        for entry in response.entries()? {
            let marker = if entry.is_dir { "/" } else { "" };
            println!("{}{}", entry.name, marker);
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Ok(())
}

async fn watch(config: &ClientConfig, path: String) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let client = RpcClient::from_config(config, events_tx);

    client
        .list_directory(&path)
        .await
        .with_context(|| format!("Failed to open {}", path))?;
    eprintln!("Watching engine messages, Ctrl-C to stop");

    loop {
        tokio::select! {
            message = events_rx.recv() => match message {
                Some(message) => print_inbound(&message)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

fn print_inbound(message: &Inbound) -> Result<()> {
    let body = match message {
        Inbound::Response(response) => serde_json::to_string(response)?,
        Inbound::Event(event) => serde_json::to_string(event)?,
    };
    println!("{} {}", message.header(), body);
    Ok(())
}
