//! Server-Sent Events stream and file tailer over the engine's event log.

use std::convert::Infallible;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use engine::io::events::{Event, read_event_log};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// SSE endpoint handler: replays the durable log, then streams newly
/// appended events as the file watcher picks them up.
pub async fn events_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.event_tx.subscribe();
    let backlog = read_event_log(&state.events_path()).unwrap_or_default();

    let stream = async_stream::stream! {
        for event in backlog {
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(SseEvent::default().event("engine_event").data(json));
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(SseEvent::default().event("engine_event").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let tx_clone = tx.clone();
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx_clone.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    let events_path = state.events_path();
    if let Some(parent) = events_path.parent() {
        std::fs::create_dir_all(parent).ok();
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
        info!(path = %events_path.display(), "watching event log");
    }

    let mut offset = std::fs::metadata(&events_path).map(|m| m.len()).unwrap_or(0);

    while let Some(event) = rx.recv().await {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        if !event.paths.iter().any(|p| p == &events_path) {
            continue;
        }
        offset = broadcast_new_lines(&state, &events_path, offset);
    }

    Ok(())
}

/// Read and broadcast every complete line appended to `path` since
/// `offset`, returning the new offset. Restarts from the top if the file
/// shrank (rotated out from under us).
fn broadcast_new_lines(state: &AppState, path: &std::path::Path, offset: u64) -> u64 {
    let Ok(mut file) = std::fs::File::open(path) else {
        return offset;
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(offset);
    let start = if len < offset { 0 } else { offset };
    if file.seek(SeekFrom::Start(start)).is_err() {
        return offset;
    }

    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                debug!(?event, "broadcasting engine event");
                let _ = state.event_tx.send(event);
            }
            Err(e) => warn!(err = %e, "failed to parse event log line"),
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn broadcast_new_lines_reads_only_the_appended_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let state = AppState::new(temp.path().to_path_buf());
        let mut rx = state.event_tx.subscribe();

        std::fs::write(&path, "{\"type\":\"planning\",\"timestamp_millis\":1}\n").expect("seed");
        let offset = broadcast_new_lines(&state, &path, 0);
        assert!(rx.try_recv().is_ok());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).expect("open for append");
        writeln!(file, "{{\"type\":\"planning\",\"timestamp_millis\":2}}").expect("append");

        broadcast_new_lines(&state, &path, offset);
        let second = rx.try_recv().expect("second event");
        assert_eq!(second.timestamp_millis, 2);
    }
}
