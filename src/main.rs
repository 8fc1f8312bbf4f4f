use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use readaloud_engine::speech::config::default_config_path;
use readaloud_engine::{
    load_config, CpalOutput, DelegatedHost, HostRequest, HostSpeechEvent, SpeechEngine, SpeechEvent,
};
use tracing_subscriber::EnvFilter;

/// Usage: `readaloud <text-file> [start-word] [--config <path>]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("readaloud_engine=info,readaloud=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let mut text_path = None;
    let mut start_word = 0usize;
    let mut config_path = default_config_path();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = PathBuf::from(args.next().context("--config needs a path")?);
            }
            other if text_path.is_none() => text_path = Some(PathBuf::from(other)),
            other => {
                start_word = other
                    .parse()
                    .with_context(|| format!("invalid start word: {}", other))?;
            }
        }
    }
    let Some(text_path) = text_path else {
        bail!("usage: readaloud <text-file> [start-word] [--config <path>]");
    };

    let text = std::fs::read_to_string(&text_path)
        .with_context(|| format!("failed to read {}", text_path.display()))?;
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    if words.is_empty() {
        bail!("{} contains no words", text_path.display());
    }

    let config = load_config(&config_path);
    let (host, mut host_requests) = DelegatedHost::new();
    // A terminal has no platform speech to delegate to.
    tokio::spawn(async move {
        while let Some(request) = host_requests.recv().await {
            if let HostRequest::Speak { events, .. } = request {
                let _ = events.send(HostSpeechEvent::Error(
                    "no host speech available in the terminal; configure a cloud or local_server provider".into(),
                ));
            }
        }
    });

    let (engine, mut events) = SpeechEngine::new(config, Arc::new(CpalOutput::new()), Arc::new(host))?;
    tracing::info!(
        words = words.len(),
        provider = %engine.active_provider(),
        available = engine.is_provider_available().await,
        "reading {}",
        text_path.display()
    );

    engine.speak(words.clone(), start_word);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.stop();
                println!();
                break;
            }
            event = events.recv() => match event {
                Some(SpeechEvent::WordBoundary { index }) => {
                    if let Some(word) = words.get(index) {
                        println!("[{:>5}] {}", index, word);
                    }
                }
                Some(SpeechEvent::Ended) => break,
                Some(SpeechEvent::Halted { reason }) => bail!("speech halted: {:?}", reason),
                None => break,
            }
        }
    }
    Ok(())
}
