//! JSONL backend
//!
//! Writes one JSON object per line, each line a single request. Useful for
//! local runs and for shipping series through another pipeline.

use std::{
    fmt,
    io::Write,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::Serialize;

use super::{Backend, Error};
use crate::series::{CreateTimeSeriesRequest, TimeSeries};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Line<'a> {
    name: &'a str,
    time_series: &'a [TimeSeries],
}

/// JSONL backend writing to `W`
pub struct Jsonl<W: Write> {
    writer: Mutex<W>,
}

impl<W: Write> Jsonl<W> {
    /// Create a new instance of `Jsonl`
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the backend, returning the writer.
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_request(&self, request: &CreateTimeSeriesRequest) -> Result<(), Error> {
        let payload = serde_json::to_string(&Line {
            name: &request.name,
            time_series: &request.time_series,
        })?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(payload.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write> fmt::Debug for Jsonl<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jsonl").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W> Backend for Jsonl<W>
where
    W: Write + Send,
{
    async fn submit(&self, request: &CreateTimeSeriesRequest) -> Result<(), Error> {
        self.write_request(request)
    }
}
