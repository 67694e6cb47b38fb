//! 🚰 Document Stream: one forward-only pass over a very large JSON document.
//!
//! COLD OPEN. EXT. PAYER CDN, 2:14 AM
//!
//! The file is 38 GB gzipped. It has two arrays that matter (`in_network` and
//! `provider_references`) and a dozen fields that don't. It will be read exactly once.
//! There is no seeking. There is no second chance. There is only the stream. 🦆
//!
//! 🧠 Knowledge graph:
//! - A blocking thread owns the reader (file, in-process gzip, or a subprocess's stdout)
//!   and drives a `serde_json` visitor over the root object.
//! - Each array element is captured as `Box<RawValue>` (no tree built) and pushed through
//!   a bounded `async_channel` with `send_blocking`. Backpressure is the channel capacity.
//! - When the channel drains, `next()` awaits the thread's verdict: clean EOF,
//!   `TransportFailure` (subprocess exited non-zero), or `MalformedDocument`.
//!   Already-buffered records are always handed out before any of that surfaces.
//! - Closing or dropping the stream closes the channel. The thread notices on its next
//!   send, kills the subprocess, and reaps it. No zombies. Not even on Halloween.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::value::RawValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::MrfxError;

/// 🔧 `[input]`
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub file_name: PathBuf,
    #[serde(default)]
    pub decompression: Decompression,
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_read_buffer_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_channel_capacity() -> usize {
    256
}

fn default_pigz_threads() -> usize {
    4
}

/// 🫁 How the bytes get unsquished.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub enum Decompression {
    /// Gzip in-process when the file name ends with `.gz`, plain otherwise.
    #[default]
    Auto,
    /// In-process `MultiGzDecoder`. Handles concatenated members too.
    Gzip,
    /// `pigz -p {threads} -dc <file>`. Parallel-ish decompression for the impatient.
    Pigz {
        #[serde(default = "default_pigz_threads")]
        threads: usize,
    },
    /// Any program that prints the JSON on stdout. The file path is appended as last arg.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Already plain JSON.
    Plain,
}

/// 📦 One top-level array element, still raw.
pub enum DocumentEvent {
    /// An element of `in_network`.
    Record(Box<RawValue>),
    /// An element of `provider_references`.
    Reference(Box<RawValue>),
}

impl fmt::Debug for DocumentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentEvent::Record(raw) => write!(f, "Record({} bytes)", raw.get().len()),
            DocumentEvent::Reference(raw) => write!(f, "Reference({} bytes)", raw.get().len()),
        }
    }
}

/// 🚰 The pull side. See the module docs for the lifecycle.
#[derive(Debug)]
pub struct DocumentStream {
    events: Receiver<DocumentEvent>,
    worker: Option<JoinHandle<Result<()>>>,
    source: String,
}

impl DocumentStream {
    /// 🚀 Open the configured input and start parsing on a blocking thread.
    ///
    /// Spawning the decompressor happens here, so a missing `pigz` fails before a single
    /// record is read.
    pub fn open(config: &InputConfig) -> Result<Self> {
        let path = config.file_name.as_path();
        let capacity = config.read_buffer_bytes.max(4096);
        let source = path.display().to_string();

        let decompression = match &config.decompression {
            Decompression::Auto if is_gzip_name(path) => Decompression::Gzip,
            Decompression::Auto => Decompression::Plain,
            other => other.clone(),
        };
        info!(input = %source, ?decompression, "🚰 opening input document");

        let (reader, child, program): (Box<dyn Read + Send>, Option<Child>, String) =
            match decompression {
                Decompression::Plain | Decompression::Auto => {
                    let file = open_file(path)?;
                    (boxed(BufReader::with_capacity(capacity, file)), None, "file".into())
                }
                Decompression::Gzip => {
                    let file = open_file(path)?;
                    let decoder = MultiGzDecoder::new(BufReader::new(file));
                    (boxed(BufReader::with_capacity(capacity, decoder)), None, "gzip".into())
                }
                Decompression::Pigz { threads } => {
                    let args = vec!["-p".to_string(), threads.max(1).to_string(), "-dc".to_string()];
                    let (stdout, child) = spawn_transport("pigz", &args, path)?;
                    (boxed(BufReader::with_capacity(capacity, stdout)), Some(child), "pigz".into())
                }
                Decompression::Command { program, args } => {
                    let (stdout, child) = spawn_transport(&program, &args, path)?;
                    (boxed(BufReader::with_capacity(capacity, stdout)), Some(child), program)
                }
            };

        Ok(Self::spawn(reader, child, program, source, config.channel_capacity))
    }

    /// 🧪 Stream from any reader. No subprocess, same parser, same channel.
    #[cfg(test)]
    pub(crate) fn from_reader(reader: impl Read + Send + 'static, channel_capacity: usize) -> Self {
        Self::spawn(
            Box::new(reader),
            None,
            "reader".to_string(),
            "reader".to_string(),
            channel_capacity,
        )
    }

    fn spawn(
        reader: Box<dyn Read + Send>,
        child: Option<Child>,
        program: String,
        source: String,
        channel_capacity: usize,
    ) -> Self {
        let (sender, events) = async_channel::bounded(channel_capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || {
            let outcome = parse_document(reader, &sender);
            let cancelled = sender.is_closed();
            drop(sender);
            settle_transport(child, program, outcome, cancelled)
        });
        Self {
            events,
            worker: Some(worker),
            source,
        }
    }

    /// 📦 Next event in document order, `Ok(None)` at a clean end.
    pub async fn next(&mut self) -> Result<Option<DocumentEvent>> {
        match self.events.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(_) => {
                self.settle().await?;
                Ok(None)
            }
        }
    }

    /// 🗑️ Stop reading. Kills the subprocess if it is still going. Idempotent in spirit.
    pub async fn close(mut self) -> Result<()> {
        self.events.close();
        self.settle().await
    }

    async fn settle(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker.await.context(format!(
                "💀 The parse thread for '{}' panicked. It saw something in that JSON it could not unsee.",
                self.source
            ))?,
            None => Ok(()),
        }
    }
}

fn boxed(reader: impl Read + Send + 'static) -> Box<dyn Read + Send> {
    Box::new(reader)
}

fn is_gzip_name(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn open_file(path: &Path) -> Result<File> {
    File::open(path).context(format!(
        "💀 The input '{}' could not be opened. We stared at the path. The path stared back.",
        path.display()
    ))
}

fn spawn_transport(
    program: &str,
    args: &[String],
    path: &Path,
) -> Result<(std::process::ChildStdout, Child)> {
    let mut child = Command::new(program)
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            MrfxError::Config(format!(
                "could not start decompression transport '{program}': {e}"
            ))
        })?;
    let stdout = child
        .stdout
        .take()
        .context(format!("💀 '{program}' started without a stdout. Rude."))?;
    debug!(program, pid = child.id(), "🧵 transport subprocess started");
    Ok((stdout, child))
}

/// ⚖️ The verdict, delivered after the channel is closed.
///
/// A non-zero exit outranks a parse error: a truncated stream from a dying
/// decompressor looks malformed, but the transport is the real culprit.
fn settle_transport(
    child: Option<Child>,
    program: String,
    outcome: Result<(), serde_json::Error>,
    cancelled: bool,
) -> Result<()> {
    if let Some(mut child) = child {
        if cancelled {
            let _ = child.kill();
        }
        let status = child
            .wait()
            .context(format!("💀 could not reap transport '{program}'"))?;
        if cancelled {
            debug!(program, "🛑 transport stopped early on request");
            return Ok(());
        }
        if !status.success() {
            warn!(program, status = ?status.code(), "💀 transport exited abnormally");
            return Err(MrfxError::TransportFailure {
                program,
                status: status.code(),
            }
            .into());
        }
    }
    if cancelled {
        return Ok(());
    }
    outcome.map_err(|e| MrfxError::MalformedDocument(e.to_string()).into())
}

const CONSUMER_GONE: &str = "document consumer hung up";

fn parse_document(reader: Box<dyn Read + Send>, sender: &Sender<DocumentEvent>) -> Result<(), serde_json::Error> {
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    RootSeed { sender }.deserialize(&mut deserializer)?;
    deserializer.end()
}

struct RootSeed<'a> {
    sender: &'a Sender<DocumentEvent>,
}

impl<'de> DeserializeSeed<'de> for RootSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for RootSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object at the document root")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "in_network" => map.next_value_seed(ArraySeed {
                    sender: self.sender,
                    wrap: DocumentEvent::Record,
                })?,
                "provider_references" => map.next_value_seed(ArraySeed {
                    sender: self.sender,
                    wrap: DocumentEvent::Reference,
                })?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

struct ArraySeed<'a> {
    sender: &'a Sender<DocumentEvent>,
    wrap: fn(Box<RawValue>) -> DocumentEvent,
}

impl<'de> DeserializeSeed<'de> for ArraySeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ArraySeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of objects (or null)")
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(raw) = seq.next_element::<Box<RawValue>>()? {
            self.sender
                .send_blocking((self.wrap)(raw))
                .map_err(|_| de::Error::custom(CONSUMER_GONE))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "reporting_entity_name": "Acme Health",
        "provider_references": [{"provider_group_id": 1, "location": "http://x/1"}],
        "in_network": [{"billing_code": "100"}, {"billing_code": "200"}],
        "version": "1.0.0"
    }"#;

    async fn drain(mut stream: DocumentStream) -> (Vec<String>, Result<()>) {
        let mut seen = Vec::new();
        loop {
            match stream.next().await {
                Ok(Some(DocumentEvent::Record(raw))) => seen.push(format!("R:{}", raw.get())),
                Ok(Some(DocumentEvent::Reference(raw))) => seen.push(format!("P:{}", raw.get())),
                Ok(None) => return (seen, Ok(())),
                Err(e) => return (seen, Err(e)),
            }
        }
    }

    #[tokio::test]
    async fn the_one_where_both_arrays_arrive_in_document_order() {
        let (seen, outcome) = drain(DocumentStream::from_reader(DOC.as_bytes(), 1)).await;
        outcome.expect("💀 a well-formed document should end cleanly");
        assert_eq!(
            seen,
            vec![
                r#"P:{"provider_group_id": 1, "location": "http://x/1"}"#,
                r#"R:{"billing_code": "100"}"#,
                r#"R:{"billing_code": "200"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn the_one_where_broken_json_still_hands_over_what_came_before() {
        let broken = r#"{"in_network": [{"billing_code": "100"}, {"billing_code": "#;
        let (seen, outcome) = drain(DocumentStream::from_reader(broken.as_bytes(), 4)).await;
        assert_eq!(seen, vec![r#"R:{"billing_code": "100"}"#]);
        let err = outcome.expect_err("💀 truncated JSON must not end cleanly");
        assert!(matches!(
            err.downcast_ref::<MrfxError>(),
            Some(MrfxError::MalformedDocument(_))
        ));
    }

    #[tokio::test]
    async fn the_one_where_auto_spots_the_gzip_by_its_name() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = dir.path().join("in_network.json.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            File::create(&path).expect("💀 create gz"),
            flate2::Compression::fast(),
        );
        encoder.write_all(DOC.as_bytes()).expect("💀 write gz");
        encoder.finish().expect("💀 finish gz");

        let stream = DocumentStream::open(&InputConfig {
            file_name: path,
            decompression: Decompression::Auto,
            read_buffer_bytes: 4096,
            channel_capacity: 2,
        })
        .expect("💀 gz input should open");
        let (seen, outcome) = drain(stream).await;
        outcome.expect("💀 gz document should end cleanly");
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn the_one_where_a_missing_input_fails_before_anything_starts() {
        let err = DocumentStream::open(&InputConfig {
            file_name: PathBuf::from("/definitely/not/here.json"),
            decompression: Decompression::Plain,
            read_buffer_bytes: 4096,
            channel_capacity: 2,
        })
        .expect_err("💀 a ghost file should not open");
        assert!(err.to_string().contains("could not be opened"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn the_one_where_the_transport_dies_after_its_last_words() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = dir.path().join("doc.json");
        std::fs::write(&path, DOC).expect("💀 write doc");

        // -- 🧪 `sh -c script path`: the path lands in $0. cat it, then exit badly.
        let stream = DocumentStream::open(&InputConfig {
            file_name: path,
            decompression: Decompression::Command {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), r#"cat "$0"; exit 3"#.to_string()],
            },
            read_buffer_bytes: 4096,
            channel_capacity: 8,
        })
        .expect("💀 sh should spawn");
        let (seen, outcome) = drain(stream).await;
        assert_eq!(seen.len(), 3, "every buffered event comes out before the failure");
        let err = outcome.expect_err("💀 exit 3 is not a success");
        match err.downcast_ref::<MrfxError>() {
            Some(MrfxError::TransportFailure { program, status }) => {
                assert_eq!(program, "sh");
                assert_eq!(*status, Some(3));
            }
            other => panic!("💀 expected a transport failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn the_one_where_we_leave_early_and_nobody_complains() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = dir.path().join("doc.json");
        let many: Vec<String> = (0..10_000)
            .map(|i| format!(r#"{{"billing_code": "{i}"}}"#))
            .collect();
        std::fs::write(&path, format!(r#"{{"in_network": [{}]}}"#, many.join(",")))
            .expect("💀 write doc");

        let mut stream = DocumentStream::open(&InputConfig {
            file_name: path,
            decompression: Decompression::Command {
                program: "cat".to_string(),
                args: vec![],
            },
            read_buffer_bytes: 4096,
            channel_capacity: 1,
        })
        .expect("💀 cat should spawn");
        let first = stream.next().await.expect("💀 first event");
        assert!(matches!(first, Some(DocumentEvent::Record(_))));
        stream
            .close()
            .await
            .expect("💀 closing early is a request, not a failure");
    }
}
