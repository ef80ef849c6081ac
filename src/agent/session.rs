use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// Line terminator sent after every command.
pub const ENTER: &str = "\n";

const MARKER_PREFIX: &str = "__pca_done_";

/// A live shell the workflow drives. Output is read incrementally: each read
/// returns only what was produced since the previous one.
#[async_trait]
pub trait TerminalSession: Send {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, command: &str, terminator: &str) -> Result<()>;

    async fn read_incremental_output(&mut self) -> Result<String>;
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// A persistent local shell process. State such as the working directory and
/// exported variables carries over between commands.
pub struct ShellSession {
    shell: String,
    running: Option<Running>,
    /// Raw bytes; decoded only once a read completes so multi-byte
    /// characters split across pipe reads survive.
    buffer: Vec<u8>,
    pending_marker: Option<String>,
}

impl ShellSession {
    pub fn new(shell: impl Into<String>) -> Self {
        ShellSession {
            shell: shell.into(),
            running: None,
            buffer: Vec::new(),
            pending_marker: None,
        }
    }

    fn running(&mut self) -> Result<&mut Running> {
        self.running
            .as_mut()
            .ok_or_else(|| anyhow!("shell session is not started"))
    }
}

impl Default for ShellSession {
    fn default() -> Self {
        ShellSession::new("bash")
    }
}

fn forward<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn decode(bytes: &[u8]) -> String {
    strip_markers(&String::from_utf8_lossy(bytes))
}

fn strip_markers(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with(MARKER_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl TerminalSession for ShellSession {
    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start shell: {}", self.shell))?;

        let mut stdin = child.stdin.take().context("shell stdin is unavailable")?;
        let stdout = child.stdout.take().context("shell stdout is unavailable")?;
        let stderr = child.stderr.take().context("shell stderr is unavailable")?;

        // Interleave stderr with stdout so output stays ordered against the marker.
        stdin
            .write_all(b"exec 2>&1\n")
            .await
            .context("failed to configure shell")?;

        let (tx, rx) = mpsc::unbounded_channel();
        forward(stdout, tx.clone());
        forward(stderr, tx);

        tracing::debug!(shell = %self.shell, pid = ?child.id(), "shell session started");
        self.running = Some(Running {
            child,
            stdin,
            output: rx,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut running) = self.running.take() {
            let _ = running.stdin.shutdown().await;
            running
                .child
                .kill()
                .await
                .context("failed to stop shell session")?;
        }
        self.pending_marker = None;
        self.buffer.clear();
        Ok(())
    }

    async fn send(&mut self, command: &str, terminator: &str) -> Result<()> {
        let marker = format!("{}{}", MARKER_PREFIX, uuid::Uuid::new_v4().simple());
        let payload = format!("{}{}echo {}{}", command, terminator, marker, ENTER);

        let running = self.running()?;
        running
            .stdin
            .write_all(payload.as_bytes())
            .await
            .context("failed to write to shell")?;
        running.stdin.flush().await.context("failed to flush shell input")?;

        self.pending_marker = Some(marker);
        Ok(())
    }

    async fn read_incremental_output(&mut self) -> Result<String> {
        let Some(marker) = self.pending_marker.clone() else {
            // Nothing outstanding: hand back whatever has already arrived.
            let running = self.running()?;
            let mut arrived = Vec::new();
            while let Ok(chunk) = running.output.try_recv() {
                arrived.extend_from_slice(&chunk);
            }
            self.buffer.extend_from_slice(&arrived);
            return Ok(decode(&std::mem::take(&mut self.buffer)));
        };

        loop {
            if let Some(pos) = find_bytes(&self.buffer, marker.as_bytes()) {
                let mut rest = self.buffer.split_off(pos + marker.len());
                if rest.first() == Some(&b'\n') {
                    rest.remove(0);
                }
                let mut produced = std::mem::replace(&mut self.buffer, rest);
                produced.truncate(pos);
                self.pending_marker = None;
                return Ok(decode(&produced));
            }

            let next = self.running()?.output.recv().await;
            match next {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    self.pending_marker = None;
                    return Err(anyhow!(
                        "shell exited before the command finished; partial output: {}",
                        decode(&std::mem::take(&mut self.buffer))
                    ));
                }
            }
        }
    }
}
