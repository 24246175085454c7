//! Line input: a rotation-surviving file follower and a plain stream reader.
//!
//! [`Tailer`] follows a regular file the way `tail -F` does. When the file
//! shrinks below the read position, or the path starts pointing at a
//! different file, the path is reopened and read from its beginning.
//! Lines written to the old file after it was last polled and before the
//! reopen may be lost. After a plain read error the same file is resumed
//! at the last consumed offset.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeekExt, BufReader, SeekFrom};
use tracing::{debug, info, warn};

/// How often a file at end-of-file is polled for growth or rotation.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How the input is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Start at the current end of the file and follow it
    Tail,
    /// Read existing content first, then follow
    FromStart,
    /// Read existing content and stop at end-of-file
    OneShot,
}

impl FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "tail" => Ok(ReadMode::Tail),
            "from-start" => Ok(ReadMode::FromStart),
            "one-shot" => Ok(ReadMode::OneShot),
            other => Err(format!(
                "'{}' is not a read mode (expected tail, from-start or one-shot)",
                other
            )),
        }
    }
}

impl std::fmt::Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadMode::Tail => write!(f, "tail"),
            ReadMode::FromStart => write!(f, "from-start"),
            ReadMode::OneShot => write!(f, "one-shot"),
        }
    }
}

/// Device and inode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some(FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<FileId> {
    None
}

/// Follows a regular file across truncation and rotation.
pub struct Tailer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    identity: Option<FileId>,
    /// Bytes consumed from the current file
    position: u64,
    /// Bytes of a line whose newline has not been written yet
    pending: Vec<u8>,
    follow: bool,
    poll_interval: Duration,
}

impl Tailer {
    /// Open `path` for reading according to `mode`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or, in `tail` mode, seeked.
    pub async fn open(path: impl AsRef<Path>, mode: ReadMode) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).await?;
        let identity = file_id(&file.metadata().await?);

        let position = match mode {
            ReadMode::Tail => file.seek(SeekFrom::End(0)).await?,
            ReadMode::FromStart | ReadMode::OneShot => 0,
        };

        info!(path = %path.display(), mode = %mode, offset = position, "Opened input file");

        Ok(Self {
            path,
            reader: Some(BufReader::new(file)),
            identity,
            position,
            pending: Vec::new(),
            follow: mode != ReadMode::OneShot,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the end-of-file poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Wait for the next complete line.
    ///
    /// Returns `None` only in one-shot mode, once the file is exhausted.
    /// Read and reopen failures are logged and retried; they never end a
    /// following tailer.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                self.reopen().await;
                if self.reader.is_none() {
                    tokio::time::sleep(self.poll_interval).await;
                }
                continue;
            };

            let buffered = self.pending.len();
            let read = match reader.read_until(b'\n', &mut self.pending).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, path = %self.path.display(), "Read failed, reopening");
                    // bytes of the failed read are not counted in `position`
                    self.pending.truncate(buffered);
                    self.reader = None;
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };
            self.position += read as u64;

            if self.pending.ends_with(b"\n") {
                return Some(take_line(&mut self.pending));
            }

            if read > 0 {
                // partial line at end-of-file, the next read reports EOF
                continue;
            }

            if !self.follow {
                return if self.pending.is_empty() {
                    None
                } else {
                    Some(take_line(&mut self.pending))
                };
            }

            if self.rotated().await {
                self.restart();
                self.reopen().await;
                continue;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Whether the path was truncated or now names another file.
    async fn rotated(&self) -> bool {
        let meta = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) => {
                // moved away and not recreated yet, keep draining the old file
                debug!(error = %e, path = %self.path.display(), "Input file unavailable");
                return false;
            }
        };

        if meta.len() < self.position {
            info!(
                path = %self.path.display(),
                previous_offset = self.position,
                current_size = meta.len(),
                "File truncated, reopening from start"
            );
            return true;
        }

        let current = file_id(&meta);
        if current.is_some() && current != self.identity {
            info!(path = %self.path.display(), "File rotated, reopening from start");
            return true;
        }

        false
    }

    /// Forget the current file; the next open starts at offset 0.
    fn restart(&mut self) {
        self.reader = None;
        self.identity = None;
        self.position = 0;
        self.pending.clear();
    }

    /// Open the path again. The same file, still at least `position` bytes
    /// long, is resumed where reading stopped; anything else is read from
    /// its beginning.
    async fn reopen(&mut self) {
        self.reader = None;
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => {
                debug!(error = %e, path = %self.path.display(), "Reopen failed, will retry");
                return;
            }
        };

        let (identity, len) = match file.metadata().await {
            Ok(meta) => (file_id(&meta), meta.len()),
            Err(_) => (None, 0),
        };

        let same_file = identity.is_some() && identity == self.identity;
        if same_file && len >= self.position && self.position > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(self.position)).await {
                debug!(error = %e, path = %self.path.display(), "Seek failed, will retry");
                return;
            }
            debug!(path = %self.path.display(), offset = self.position, "Resumed input file");
        } else {
            self.position = 0;
            self.pending.clear();
        }

        self.identity = identity;
        self.reader = Some(BufReader::new(file));
    }
}

/// Reads lines from a non-seekable source (stdin, a pipe) until it closes.
pub struct StreamReader {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    pending: Vec<u8>,
}

impl StreamReader {
    pub fn new(inner: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// The next line, or `None` once the stream is closed.
    pub async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.pending).await {
            Ok(_) if !self.pending.is_empty() => Some(take_line(&mut self.pending)),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Input stream read failed");
                None
            }
        }
    }
}

/// The configured input: a followed file or a stream.
pub enum LineInput {
    File(Tailer),
    Stream(StreamReader),
}

impl LineInput {
    /// Open the configured input. `-` is standard input; any path that is
    /// not a regular file (a FIFO, a character device) is read as a stream
    /// regardless of the requested mode.
    pub async fn open(input: &str, mode: ReadMode, mode_explicit: bool) -> io::Result<Self> {
        if input == "-" {
            warn_stream_mode(mode_explicit);
            return Ok(LineInput::Stream(StreamReader::new(Box::new(tokio::io::stdin()))));
        }

        let (meta, mode) = wait_for_input(input, mode, DEFAULT_POLL_INTERVAL).await?;
        if !meta.is_file() {
            warn_stream_mode(mode_explicit);
            let file = File::open(input).await?;
            return Ok(LineInput::Stream(StreamReader::new(Box::new(file))));
        }

        Ok(LineInput::File(Tailer::open(input, mode).await?))
    }

    pub async fn next_line(&mut self) -> Option<String> {
        match self {
            LineInput::File(tailer) => tailer.next_line().await,
            LineInput::Stream(stream) => stream.next_line().await,
        }
    }
}

/// Stat the input, polling until it appears when the mode follows the file.
///
/// A file that shows up only after waiting is read from its start, since
/// everything in it was written after startup.
async fn wait_for_input(
    input: &str,
    mode: ReadMode,
    poll_interval: Duration,
) -> io::Result<(std::fs::Metadata, ReadMode)> {
    let mut waited = false;
    loop {
        match fs::metadata(input).await {
            Ok(meta) => {
                let mode = if waited { ReadMode::FromStart } else { mode };
                return Ok((meta, mode));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && mode != ReadMode::OneShot => {
                if !waited {
                    warn!(path = %input, "Input file does not exist yet, waiting for it");
                    waited = true;
                }
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn warn_stream_mode(mode_explicit: bool) {
    if mode_explicit {
        warn!("Read mode is ignored when reading from a stream");
    }
}

/// Drain `buf` into a string without its line terminator, replacing invalid UTF-8.
fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
