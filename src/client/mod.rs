//! Client library: one-shot RPCs against the master plus the interactive
//! attachment loop the CLI drives.
//!
//! Every verb opens its own TCP connection. Timeouts are opt-in and default
//! to unbounded: a client watching a week-long training run must never be
//! the thing that kills it.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::ClientTimeouts;
use crate::error::{MgpuError, Result};
use crate::job::{JobSpec, JobStatus, NodePin};
use crate::protocol::{self, JobView, Message, NodeView, StreamKind};

#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    timeouts: ClientTimeouts,
}

#[derive(Debug)]
pub enum AttachEvent {
    Chunk(StreamKind, Vec<u8>),
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// An open output stream for one job.
pub struct Attachment {
    pub job_id: String,
    reader: BufReader<OwnedReadHalf>,
    /// Held so the master sees EOF only when the attachment is dropped.
    _writer: OwnedWriteHalf,
    timeouts: ClientTimeouts,
    session_deadline: Option<tokio::time::Instant>,
    consecutive_timeouts: u32,
    line: String,
}

impl Client {
    pub fn new(addr: impl Into<String>, timeouts: ClientTimeouts) -> Self {
        Self {
            addr: addr.into(),
            timeouts,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let dial = TcpStream::connect(&self.addr);
        let stream = match self.timeouts.connect {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| MgpuError::Timeout(format!("connecting to {}", self.addr)))?,
            None => dial.await,
        }?;
        Ok(stream)
    }

    async fn request(&self, msg: &Message) -> Result<Message> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        protocol::write_message(&mut write_half, msg).await?;
        match protocol::read_message(&mut reader).await? {
            Some(Message::Error { code, reason }) => Err(MgpuError::Remote { code, reason }),
            Some(reply) => Ok(reply),
            None => Err(MgpuError::ConnectionClosed),
        }
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<String> {
        match self.request(&Message::Submit { spec }).await? {
            Message::Ack {
                job_id: Some(id), ..
            } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Submit an interactive job; the submitting connection becomes the
    /// attachment.
    pub async fn submit_interactive(&self, spec: JobSpec) -> Result<Attachment> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        protocol::write_message(&mut write_half, &Message::Submit { spec }).await?;
        let job_id = match protocol::read_message(&mut reader).await? {
            Some(Message::Ack {
                job_id: Some(id), ..
            }) => id,
            Some(Message::Error { code, reason }) => {
                return Err(MgpuError::Remote { code, reason })
            }
            other => return Err(unexpected_opt(other)),
        };
        Ok(self.attachment(job_id, reader, write_half))
    }

    pub async fn attach(&self, job_id: &str) -> Result<Attachment> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        protocol::write_message(
            &mut write_half,
            &Message::Attach {
                job_id: job_id.to_string(),
            },
        )
        .await?;
        match protocol::read_message(&mut reader).await? {
            Some(Message::Ack { .. }) => {}
            Some(Message::Error { code, reason }) => {
                return Err(MgpuError::Remote { code, reason })
            }
            other => return Err(unexpected_opt(other)),
        }
        Ok(self.attachment(job_id.to_string(), reader, write_half))
    }

    pub async fn queue(&self) -> Result<(Vec<JobView>, Vec<NodeView>)> {
        match self.request(&Message::Queue).await? {
            Message::Snapshot { jobs, nodes } => Ok((jobs, nodes)),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the status the job had before the cancel took effect.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        match self
            .request(&Message::Cancel {
                job_id: job_id.to_string(),
            })
            .await?
        {
            Message::Ack {
                prior_status: Some(prior),
                ..
            } => Ok(prior),
            other => Err(unexpected(other)),
        }
    }

    fn attachment(
        &self,
        job_id: String,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Attachment {
        Attachment {
            job_id,
            reader,
            _writer: writer,
            timeouts: self.timeouts,
            session_deadline: self
                .timeouts
                .session
                .map(|d| tokio::time::Instant::now() + d),
            consecutive_timeouts: 0,
            line: String::new(),
        }
    }
}

impl Attachment {
    /// Next chunk or the exit record, honoring the configured timeouts.
    pub async fn next_event(&mut self) -> Result<AttachEvent> {
        loop {
            match self.read_frame().await? {
                Some(Message::Out { stream, data, .. }) => {
                    return Ok(AttachEvent::Chunk(stream, protocol::decode_chunk(&data)?));
                }
                Some(Message::Exit { code, signal, .. }) => {
                    return Ok(AttachEvent::Exited { code, signal });
                }
                Some(Message::Error { code, reason }) => {
                    return Err(MgpuError::Remote { code, reason });
                }
                Some(other) => {
                    tracing::debug!(message = ?other, "ignoring message on attachment");
                }
                None => return Err(MgpuError::ConnectionClosed),
            }
        }
    }

    /// Read one line, surviving per-read timeouts: a timed-out read keeps
    /// whatever partial line arrived and resumes on the next attempt.
    async fn read_frame(&mut self) -> Result<Option<Message>> {
        loop {
            let per_read = self
                .timeouts
                .read
                .map(|d| tokio::time::Instant::now() + d);
            let deadline = match (per_read, self.session_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let read = self.reader.read_line(&mut self.line);
            let n = match deadline {
                None => read.await?,
                Some(at) => match tokio::time::timeout_at(at, read).await {
                    Ok(done) => done?,
                    Err(_) => {
                        if self.session_deadline.map_or(false, |s| s <= at) {
                            return Err(MgpuError::Timeout("session timeout".to_string()));
                        }
                        self.consecutive_timeouts += 1;
                        if let Some(max) = self.timeouts.max_consecutive_timeouts {
                            if self.consecutive_timeouts >= max {
                                return Err(MgpuError::Timeout(format!(
                                    "{} consecutive read timeouts",
                                    self.consecutive_timeouts
                                )));
                            }
                        }
                        continue;
                    }
                },
            };
            self.consecutive_timeouts = 0;

            if n == 0 {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Err(MgpuError::ConnectionClosed);
            }
            if self.line.ends_with('\n') {
                let msg = serde_json::from_str(self.line.trim_end())
                    .map_err(|e| MgpuError::Protocol(format!("malformed message: {e}")))?;
                self.line.clear();
                return Ok(Some(msg));
            }
        }
    }
}

/// Drive an interactive attachment: copy chunks to the terminal, forward
/// SIGINT as a cancel on a fresh connection, and keep draining until the
/// exit record. Returns the code the CLI should exit with.
pub async fn run_interactive(client: &Client, mut attachment: Attachment) -> Result<i32> {
    let job_id = attachment.job_id.clone();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            event = attachment.next_event() => {
                match event? {
                    AttachEvent::Chunk(StreamKind::Stdout, data) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    AttachEvent::Chunk(StreamKind::Stderr, data) => {
                        stderr.write_all(&data).await?;
                        stderr.flush().await?;
                    }
                    AttachEvent::Exited { code, signal } => {
                        return Ok(exit_code(code, signal));
                    }
                }
            }
            _ = sigint.recv(), if !cancel_sent => {
                cancel_sent = true;
                eprintln!("interrupt: cancelling job {job_id}, draining output");
                let client = client.clone();
                let job = job_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.cancel(&job).await {
                        tracing::warn!(job_id = %job, error = %e, "cancel after interrupt failed");
                    }
                });
            }
        }
    }
}

/// Exit-code propagation: the job's code, or 128+signal on a signaled exit.
pub fn exit_code(code: Option<i32>, signal: Option<i32>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

/// Parse the `--node-gpu-ids` syntax: `n1:0,1;n2:2`.
pub fn parse_pins(value: &str) -> Result<Vec<NodePin>> {
    let mut pins = Vec::new();
    for part in value.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (node, gpus) = part
            .split_once(':')
            .ok_or_else(|| MgpuError::InvalidSpec(format!("bad pin, expected node:ids: {part}")))?;
        let node = node.trim();
        if node.is_empty() {
            return Err(MgpuError::InvalidSpec(format!("bad pin, empty node: {part}")));
        }
        let gpu_ids = gpus
            .split(',')
            .map(|g| {
                g.trim()
                    .parse::<u32>()
                    .map_err(|_| MgpuError::InvalidSpec(format!("bad GPU id in pin: {part}")))
            })
            .collect::<Result<Vec<u32>>>()?;
        if gpu_ids.is_empty() {
            return Err(MgpuError::InvalidSpec(format!("pin names no GPUs: {part}")));
        }
        pins.push(NodePin {
            node_id: node.to_string(),
            gpu_ids,
        });
    }
    if pins.is_empty() {
        return Err(MgpuError::InvalidSpec("empty pin list".to_string()));
    }
    Ok(pins)
}

fn unexpected(msg: Message) -> MgpuError {
    MgpuError::Protocol(format!("unexpected reply: {msg:?}"))
}

fn unexpected_opt(msg: Option<Message>) -> MgpuError {
    match msg {
        Some(msg) => unexpected(msg),
        None => MgpuError::ConnectionClosed,
    }
}
