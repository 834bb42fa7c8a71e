//! `turngate run`: submit one turn to an in-process engine, stream the
//! reply to stdout and exit.

use std::io::Write;
use std::sync::Arc;

use futures_util::StreamExt;
use tg_domain::config::Config;

use crate::bootstrap;
use crate::runtime::{EventType, StreamFrame, SubmitRequest};

pub async fn run(
    config: Arc<Config>,
    message: String,
    session: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let state = bootstrap::build_app_state(config).await?;
    let engine = state.engine.clone();

    let outcome = stream_turn(&state, SubmitRequest::new(session, message), json_output).await;

    // Drains the persistence stage so the turn lands in the transcript.
    engine.shutdown().await;

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Returns `Ok(false)` when the turn ended with an error frame.
async fn stream_turn(
    state: &crate::state::AppState,
    req: SubmitRequest,
    json_output: bool,
) -> anyhow::Result<bool> {
    let receipt = state.engine.submit(req).await?;
    tracing::debug!(
        session_id = %receipt.session_id,
        request_id = %receipt.request_id,
        "turn accepted"
    );

    let mut frames = state
        .engine
        .stream(&receipt.session_id, &receipt.request_id)?;
    let mut collected: Vec<StreamFrame> = Vec::new();
    let mut ok = true;

    while let Some(frame) = frames.next().await {
        if frame.event_type == EventType::Error {
            ok = false;
        }
        if json_output {
            collected.push(frame);
            continue;
        }
        match frame.event_type {
            EventType::Token => {
                print!("{}", frame.content);
                std::io::stdout().flush().ok();
            }
            EventType::Done => println!(),
            EventType::Error => {
                eprintln!(
                    "error: {}",
                    frame.error_message.as_deref().unwrap_or("Request failed")
                );
            }
            EventType::Start | EventType::References => {}
        }
    }

    if json_output {
        let json = serde_json::to_string_pretty(&collected)
            .map_err(|e| anyhow::anyhow!("serializing frames: {e}"))?;
        println!("{json}");
    } else {
        eprintln!("\x1b[2msession {}\x1b[0m", receipt.session_id);
    }

    Ok(ok)
}
