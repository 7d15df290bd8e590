// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `moor top`: live dashboard over a state-stream.
//!
//! Connects to a local or remote daemon's `/v1/state-stream` WebSocket and
//! renders one row per workload, redrawn on every frame.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use clap::Args;
use crossterm::event::{Event as InputEvent, EventStream, KeyCode, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use moor_core::Snapshot;
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Row, Table};
use ratatui::DefaultTerminal;
use tokio_tungstenite::tungstenite::Message;

use crate::exit_error::ExitError;

#[derive(Args)]
pub struct TopArgs {
    /// state-stream endpoint to watch
    #[arg(
        long,
        value_name = "WS-URL",
        default_value = "ws://127.0.0.1:4765/v1/state-stream"
    )]
    pub connect: String,
}

pub async fn run(args: TopArgs) -> Result<(), ExitError> {
    let (socket, _) = tokio_tungstenite::connect_async(args.connect.as_str())
        .await
        .map_err(|e| ExitError::new(1, format!("can't connect to {}: {}", args.connect, e)))?;

    let mut terminal = ratatui::init();
    let result = event_loop(&mut terminal, &args.connect, socket).await;
    ratatui::restore();
    result
}

async fn event_loop(
    terminal: &mut DefaultTerminal,
    connect: &str,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<(), ExitError> {
    let (_, mut frames) = socket.split();
    let mut input = EventStream::new();
    let mut workloads: BTreeMap<String, Snapshot> = BTreeMap::new();

    draw(terminal, connect, &workloads)?;
    loop {
        tokio::select! {
            message = frames.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) =
                        serde_json::from_str::<HashMap<String, Snapshot>>(text.as_str())
                    {
                        workloads = frame.into_iter().collect();
                        draw(terminal, connect, &workloads)?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ExitError::new(1, format!("stream error: {}", e))),
            },
            event = input.next() => match event {
                Some(Ok(InputEvent::Key(key)))
                    if key.kind == KeyEventKind::Press && is_quit_key(key.code, key.modifiers) =>
                {
                    return Ok(());
                }
                Some(Ok(InputEvent::Resize(..))) => draw(terminal, connect, &workloads)?,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return Ok(()),
            },
        }
    }
}

fn is_quit_key(code: KeyCode, modifiers: KeyModifiers) -> bool {
    matches!(code, KeyCode::Char('q') | KeyCode::Esc)
        || (code == KeyCode::Char('c') && modifiers.contains(KeyModifiers::CONTROL))
}

fn draw(
    terminal: &mut DefaultTerminal,
    connect: &str,
    workloads: &BTreeMap<String, Snapshot>,
) -> Result<(), ExitError> {
    let rows: Vec<Row> = workloads
        .iter()
        .map(|(name, snapshot)| {
            Row::new(vec![
                Cell::from(name.as_str()),
                Cell::from(snapshot.state_name()).style(state_style(snapshot)),
                Cell::from(image_of(snapshot)),
                Cell::from(age_of(snapshot)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Min(16),
            Constraint::Length(14),
            Constraint::Min(24),
            Constraint::Length(10),
        ],
    )
    .header(
        Row::new(vec!["NAME", "STATE", "IMAGE", "UP"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" moor top | {} (q to quit) ", connect)),
    );

    terminal
        .draw(|frame| frame.render_widget(table, frame.area()))
        .map_err(|e| ExitError::new(1, format!("draw failed: {}", e)))?;
    Ok(())
}

fn state_style(snapshot: &Snapshot) -> Style {
    match snapshot {
        Snapshot::Stable { .. } => Style::default().fg(Color::Green),
        Snapshot::Wait { .. } | Snapshot::WaitNext { .. } | Snapshot::BothStarted { .. } => {
            Style::default().fg(Color::Yellow)
        }
        Snapshot::TryAgain { .. } | Snapshot::TryAgainNext { .. } => {
            Style::default().fg(Color::Red)
        }
        Snapshot::Init | Snapshot::Stopped => Style::default().add_modifier(Modifier::DIM),
    }
}

fn image_of(snapshot: &Snapshot) -> String {
    match snapshot {
        Snapshot::Wait { container } | Snapshot::Stable { container } => container.image.clone(),
        Snapshot::WaitNext { current, next } => format!("{} → {}", current.image, next.image),
        Snapshot::BothStarted { prev, next } => format!("{} → {}", prev.image, next.image),
        Snapshot::TryAgainNext { current, spec } => format!("{} → {}", current.image, spec.image),
        Snapshot::TryAgain { spec } => spec.image.clone(),
        Snapshot::Init | Snapshot::Stopped => "-".to_string(),
    }
}

fn age_of(snapshot: &Snapshot) -> String {
    let started = match snapshot {
        Snapshot::Wait { container } | Snapshot::Stable { container } => container.started_at,
        Snapshot::WaitNext { current, .. } | Snapshot::TryAgainNext { current, .. } => {
            current.started_at
        }
        Snapshot::BothStarted { prev, .. } => prev.started_at,
        Snapshot::Init | Snapshot::TryAgain { .. } | Snapshot::Stopped => return "-".to_string(),
    };
    humanize(started, Utc::now())
}

fn humanize(started: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - started).num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn humanizes_ages() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(humanize(start, start + chrono::Duration::seconds(5)), "5s");
        assert_eq!(humanize(start, start + chrono::Duration::seconds(300)), "5m");
        assert_eq!(humanize(start, start + chrono::Duration::hours(7)), "7h");
        assert_eq!(humanize(start, start + chrono::Duration::days(3)), "3d");
        // A clock skewed backwards never reports a negative age.
        assert_eq!(humanize(start, start - chrono::Duration::seconds(30)), "0s");
    }
}
