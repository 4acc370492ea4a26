//! Line-oriented control from standard input
//!
//! `start`/`hold` holds the button, `stop`/`release` lets it go. Handy on a
//! bench without the physical switch wired up.

use super::{ControlEvent, ControlSource};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

pub struct StdinControl<R = BufReader<Stdin>> {
    lines: Lines<R>,
}

impl StdinControl {
    pub fn new() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }
}

impl Default for StdinControl {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AsyncBufRead + Unpin> StdinControl<R> {
    pub fn from_reader(reader: R) -> Self {
        Self { lines: reader.lines() }
    }
}

fn parse_command(line: &str) -> Option<ControlEvent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" | "hold" => Some(ControlEvent::Held),
        "stop" | "release" => Some(ControlEvent::Released),
        _ => None,
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ControlSource for StdinControl<R> {
    async fn next_event(&mut self) -> Option<ControlEvent> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(event) => return Some(event),
                    None if line.trim().is_empty() => {}
                    None => tracing::warn!("Unknown command {:?} (expected start or stop)", line.trim()),
                },
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!("Failed to read control input: {}", e);
                    return None;
                }
            }
        }
    }
}
