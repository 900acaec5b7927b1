use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, timeout_at};
use tollgate_protocol::KernelResult;
use tracing::debug;

/// How long input typed after an abandoned question is treated as its answer.
const STALE_INPUT_GRACE: Duration = Duration::from_millis(50);

struct ConsoleIo {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Bytes of a line whose read was interrupted.
    partial: Vec<u8>,
    /// A prompt was dropped before its answer arrived.
    abandoned: bool,
}

/// Holds the console for one read. A question dropped before its answer is
/// read is marked abandoned, so a late answer is not taken as new input.
struct PromptGuard<'a> {
    io: MutexGuard<'a, ConsoleIo>,
    question: bool,
    answered: bool,
}

impl Deref for PromptGuard<'_> {
    type Target = ConsoleIo;

    fn deref(&self) -> &ConsoleIo {
        &self.io
    }
}

impl DerefMut for PromptGuard<'_> {
    fn deref_mut(&mut self) -> &mut ConsoleIo {
        &mut self.io
    }
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        if self.question && !self.answered {
            self.io.abandoned = true;
        }
    }
}

/// Interactive surface shared by the chat loop and the terminal escalation
/// handler. A prompt holds the console until its answer is read, so two
/// concurrent escalations never interleave.
///
/// Reads are cancel-safe. When a question is given up (an escalation timing
/// out), lines typed in answer to it are discarded before the next read.
#[derive(Clone)]
pub struct Console {
    io: Arc<Mutex<ConsoleIo>>,
}

impl Console {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            io: Arc::new(Mutex::new(ConsoleIo {
                reader: Box::new(BufReader::new(reader)),
                writer: Box::new(writer),
                partial: Vec::new(),
                abandoned: false,
            })),
        }
    }

    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    async fn lock(&self, question: bool) -> PromptGuard<'_> {
        PromptGuard {
            io: self.io.lock().await,
            question,
            answered: false,
        }
    }

    /// Next line without its terminator, or `None` at end of input.
    pub async fn read_line(&self) -> KernelResult<Option<String>> {
        let mut io = self.lock(false).await;
        Self::discard_stale(&mut io).await;
        let line = Self::next_line(&mut io).await;
        io.answered = true;
        line
    }

    pub async fn write(&self, text: &str) -> KernelResult<()> {
        let mut io = self.io.lock().await;
        io.writer.write_all(text.as_bytes()).await?;
        io.writer.flush().await?;
        Ok(())
    }

    pub async fn prompt(&self, text: &str) -> KernelResult<Option<String>> {
        self.prompt_with(text, false).await
    }

    /// Like [`Console::prompt`], for a question whose answer is only wanted
    /// while the caller waits for it.
    pub async fn ask(&self, question: &str) -> KernelResult<Option<String>> {
        self.prompt_with(question, true).await
    }

    async fn prompt_with(&self, text: &str, question: bool) -> KernelResult<Option<String>> {
        let mut io = self.lock(question).await;
        Self::discard_stale(&mut io).await;
        io.writer.write_all(text.as_bytes()).await?;
        io.writer.flush().await?;
        let line = Self::next_line(&mut io).await;
        io.answered = true;
        line
    }

    /// After an abandoned question, drop the lines typed shortly after it.
    async fn discard_stale(io: &mut ConsoleIo) {
        if !std::mem::take(&mut io.abandoned) {
            return;
        }
        let deadline = Instant::now() + STALE_INPUT_GRACE;
        loop {
            let ConsoleIo {
                reader, partial, ..
            } = &mut *io;
            match timeout_at(deadline, reader.read_until(b'\n', partial)).await {
                Ok(Ok(read)) if read > 0 && partial.ends_with(b"\n") => {
                    let line = String::from_utf8_lossy(partial);
                    debug!(line = %line.trim_end(), "discarding late answer to an abandoned question");
                    partial.clear();
                }
                _ => return,
            }
        }
    }

    async fn next_line(io: &mut ConsoleIo) -> KernelResult<Option<String>> {
        let ConsoleIo {
            reader, partial, ..
        } = &mut *io;
        let read = reader.read_until(b'\n', partial).await?;
        if read == 0 && partial.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(partial)
            .trim_end_matches(['\r', '\n'])
            .to_owned();
        partial.clear();
        Ok(Some(line))
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}
