//! Inbound adapters.
//!
//! The node never parses a transport format inside the pipeline.  An
//! [`ObservationSource`] turns whatever the outside world speaks into a
//! stream of typed [`Observation`]s; the service consumes that stream in
//! arrival order.
//!
//! - [`ObservationSource`] – the trait every inbound adapter implements.
//! - [`JsonLinesSource`] – newline-delimited JSON from a file, stdin or any
//!   async reader.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use gsm_types::{GsmError, Observation};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, warn};

/// Every inbound adapter implements this trait.
///
/// `observation_stream` yields observations in arrival order and ends when
/// the upstream is exhausted.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    async fn observation_stream(&self) -> BoxStream<'static, Observation>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Reads one JSON-encoded [`Observation`] per line.
///
/// Blank lines are skipped; malformed lines are logged and skipped so one
/// corrupt record cannot stall the map.  The stream can be taken once.
pub struct JsonLinesSource {
    reader: Mutex<Option<BoxedReader>>,
    path: Option<PathBuf>,
}

impl JsonLinesSource {
    /// Read from an already-open async reader.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            path: None,
        }
    }

    /// Read from a file, opened when the stream is first requested.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            reader: Mutex::new(None),
            path: Some(path.into()),
        }
    }

    /// Read from the process's standard input.
    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    async fn take_reader(&self) -> Option<BoxedReader> {
        let taken = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if taken.is_some() {
            return taken;
        }
        let path = self.path.as_ref()?;
        match tokio::fs::File::open(path).await {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot open observation file");
                None
            }
        }
    }
}

#[async_trait]
impl ObservationSource for JsonLinesSource {
    async fn observation_stream(&self) -> BoxStream<'static, Observation> {
        let Some(reader) = self.take_reader().await else {
            return stream::empty().boxed();
        };
        let lines = BufReader::new(reader).lines();
        stream::unfold(lines, |mut lines| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match parse_observation(&line) {
                        Ok(obs) => return Some((obs, lines)),
                        Err(e) => warn!(error = %e, "skipping malformed observation"),
                    },
                    Ok(None) => return None,
                    Err(e) => {
                        error!(error = %e, "observation stream read error");
                        return None;
                    }
                }
            }
        })
        .boxed()
    }
}

/// Parse one JSON line into an [`Observation`].
pub fn parse_observation(line: &str) -> Result<Observation, GsmError> {
    serde_json::from_str(line).map_err(|e| GsmError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEGMENTS: &str = r#"{"kind":"segments","pose":{"translation":{"x":0,"y":0,"z":0}},"segments":[]}"#;
    const FEATURES: &str = r#"{"kind":"features","pose":{"translation":{"x":0,"y":0,"z":0}},"features":[]}"#;

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_observation("{not json"),
            Err(GsmError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn stream_yields_observations_in_order_and_skips_bad_lines() {
        let input = format!("{SEGMENTS}\n\n{{broken\n{FEATURES}\n");
        let source = JsonLinesSource::from_reader(std::io::Cursor::new(input.into_bytes()));

        let observations: Vec<Observation> = source.observation_stream().await.collect().await;

        assert_eq!(observations.len(), 2);
        assert!(matches!(observations[0], Observation::Segments(_)));
        assert!(matches!(observations[1], Observation::Features(_)));
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let source = JsonLinesSource::from_reader(std::io::Cursor::new(
            format!("{SEGMENTS}\n").into_bytes(),
        ));
        assert_eq!(source.observation_stream().await.count().await, 1);
        assert_eq!(source.observation_stream().await.count().await, 0);
    }

    #[tokio::test]
    async fn file_source_reads_lines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("obs.jsonl");
        std::fs::write(&path, format!("{SEGMENTS}\n{SEGMENTS}\n"))?;

        let source = JsonLinesSource::from_path(&path);
        assert_eq!(source.observation_stream().await.count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_yields_empty_stream() {
        let source = JsonLinesSource::from_path("/definitely/not/here.jsonl");
        assert_eq!(source.observation_stream().await.count().await, 0);
    }
}
