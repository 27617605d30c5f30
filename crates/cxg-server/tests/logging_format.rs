// SPDX-License-Identifier: Apache-2.0

mod support;

use std::io;
use std::sync::{Arc, Mutex};

use support::*;
use tempfile::tempdir;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedBuffer {
    type Writer = BufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BufferWriter(Arc::clone(&self.0))
    }
}

impl io::Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock poisoned"))?;
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn log_lines(sink: &SharedBuffer) -> Vec<serde_json::Value> {
    let bytes = sink.0.lock().expect("lock output").clone();
    String::from_utf8(bytes)
        .expect("utf8 log output")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("json log line"))
        .collect()
}

#[tokio::test]
async fn request_completion_is_logged_as_json_with_the_request_id() {
    let sink = SharedBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(sink.clone())
        .json()
        .with_max_level(Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempdir().expect("tempdir");
    let (addr, _) = start(fixture_config(dir.path())).await;
    let (status, _, _) = get(
        addr,
        "/d/pbmc.cxg/api/v0.3/schema",
        &[("x-request-id", "req-logging-1")],
    )
    .await;
    assert_eq!(status, 200);

    let lines = log_lines(&sink);
    let done = lines
        .iter()
        .find(|l| l["fields"]["message"] == "request complete")
        .expect("request complete event");
    assert_eq!(done["level"], "INFO");
    let fields = &done["fields"];
    assert_eq!(
        fields.get("request_id").and_then(|v| v.as_str()),
        Some("req-logging-1")
    );
    assert_eq!(fields.get("status").and_then(|v| v.as_u64()), Some(200));
    assert_eq!(done["span"]["route"], "/d/pbmc.cxg/api/v0.3/schema");

    assert!(
        lines
            .iter()
            .any(|l| l["fields"]["message"] == "cache miss" || l["fields"]["message"] == "cache load"),
        "cache events are logged"
    );
}
