use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{Command, Reply};
use super::{
    AdminCommand, FetchBatch, FetchRequest, LiveFeeds, Mode, StoreConnection, StoreDialer,
    StoreError,
};

/// Dials [`TcpStoreConnection`]s to a fixed address
#[derive(Debug, Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
}

impl TcpDialer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl StoreDialer for TcpDialer {
    async fn dial(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let connection = TcpStoreConnection::connect(&self.host, self.port).await?;
        Ok(Box::new(connection))
    }
}

/// Background task pumping a live query into its feeds
struct LiveReader {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A store connection over one TCP stream
pub struct TcpStoreConnection {
    addr: String,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    mode: Option<Mode>,
    live: Option<LiveReader>,
}

impl TcpStoreConnection {
    /// Dial the store
    pub async fn connect(host: &str, port: u16) -> Result<Self, StoreError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| StoreError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        debug!(addr = %addr, "Connected to entry store");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            reader: Some(BufReader::new(reader)),
            writer: Some(writer),
            mode: None,
            live: None,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn require_mode(&self, mode: Mode) -> Result<(), StoreError> {
        if self.live.is_some() {
            return Err(StoreError::State("live query attached".to_string()));
        }
        match self.mode {
            Some(current) if current == mode => Ok(()),
            Some(current) => Err(StoreError::State(format!(
                "connection is in {current} mode, {mode} required"
            ))),
            None => Err(StoreError::State(format!("{mode} mode not negotiated"))),
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), StoreError> {
        let writer = self.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.write_all(line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send(&mut self, command: &Command) -> Result<(), StoreError> {
        let line = command.encode()?;
        self.write_line(&line).await
    }

    async fn read_reply(&mut self) -> Result<Reply, StoreError> {
        let reader = self.reader.as_mut().ok_or(StoreError::Closed)?;
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Err(StoreError::Closed);
            }
            if !line.trim_ascii().is_empty() {
                return Reply::parse(&line);
            }
        }
    }

    async fn expect_ok(&mut self, command: &Command) -> Result<Result<(), String>, StoreError> {
        self.send(command).await?;
        match self.read_reply().await? {
            Reply::Ok => Ok(Ok(())),
            Reply::Err(message) => Ok(Err(message)),
            other => Err(StoreError::Protocol(format!("expected ok/err, got {other:?}"))),
        }
    }

    async fn read_batch(&mut self) -> Result<FetchBatch, StoreError> {
        let first_meta = match self.read_reply().await? {
            Reply::Meta(meta) => meta,
            Reply::Err(message) => return Err(StoreError::Fetch(message)),
            other => {
                return Err(StoreError::Protocol(format!(
                    "fetch must start with meta, got {other:?}"
                )));
            }
        };

        let mut batch = FetchBatch {
            entries: Vec::new(),
            last_meta: first_meta.clone(),
            first_meta,
        };

        loop {
            match self.read_reply().await? {
                Reply::Data(raw) => batch.entries.push(raw),
                Reply::Meta(meta) => batch.last_meta = meta,
                Reply::End => return Ok(batch),
                Reply::Err(message) => return Err(StoreError::Fetch(message)),
                Reply::Ok => {
                    return Err(StoreError::Protocol("unexpected ok inside fetch".to_string()));
                }
            }
        }
    }

    /// Drop both halves so a desynchronized link can never be reused
    fn poison(&mut self) {
        self.reader = None;
        self.writer = None;
    }
}

/// Push one payload into a feed, giving up on stop. Returns `false` when the
/// reader should exit.
async fn forward(
    slot: &mut Option<mpsc::Sender<Bytes>>,
    payload: Bytes,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    let Some(sender) = slot.as_ref() else {
        return true;
    };
    let delivered = tokio::select! {
        biased;
        _ = stop.changed() => return false,
        sent = sender.send(payload) => sent.is_ok(),
    };
    if !delivered {
        *slot = None;
    }
    true
}

async fn pump_live(
    addr: String,
    mut reader: BufReader<OwnedReadHalf>,
    feeds: LiveFeeds,
    mut stop: watch::Receiver<bool>,
) {
    let mut data = Some(feeds.data);
    let mut meta = Some(feeds.meta);
    let mut line = Vec::new();

    loop {
        if data.is_none() && meta.is_none() {
            debug!(addr = %addr, "Both live feeds dropped, stopping reader");
            break;
        }

        line.clear();
        let read = tokio::select! {
            biased;
            _ = stop.changed() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => {
                debug!(addr = %addr, "Store closed live query");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(addr = %addr, error = %e, "Live query read failed");
                break;
            }
        }

        if line.trim_ascii().is_empty() {
            continue;
        }

        let keep_going = match Reply::parse(&line) {
            Ok(Reply::Data(raw)) => forward(&mut data, raw, &mut stop).await,
            Ok(Reply::Meta(raw)) => forward(&mut meta, raw, &mut stop).await,
            Ok(Reply::Err(message)) => {
                warn!(addr = %addr, error = %message, "Store reported live query error");
                false
            }
            Ok(Reply::Ok) | Ok(Reply::End) => true,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Skipping malformed live reply");
                true
            }
        };

        if !keep_going {
            break;
        }
    }
}

#[async_trait]
impl StoreConnection for TcpStoreConnection {
    async fn set_mode(&mut self, mode: Mode) -> Result<(), StoreError> {
        if self.live.is_some() {
            return Err(StoreError::State("live query attached".to_string()));
        }
        match self.expect_ok(&Command::Mode { mode }).await? {
            Ok(()) => {
                self.mode = Some(mode);
                Ok(())
            }
            Err(reason) => Err(StoreError::Mode { mode, reason }),
        }
    }

    async fn insert(&mut self, raw: &[u8]) -> Result<(), StoreError> {
        self.require_mode(Mode::Insert)?;
        let mut line = Vec::with_capacity(raw.len() + 1);
        line.extend_from_slice(raw);
        line.push(b'\n');
        self.write_line(&line).await
    }

    async fn validate(&mut self, query: &str) -> Result<(), StoreError> {
        self.require_mode(Mode::Query)?;
        let command = Command::Validate {
            query: query.to_string(),
        };
        self.expect_ok(&command)
            .await?
            .map_err(StoreError::Validation)
    }

    async fn fetch(
        &mut self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchBatch, StoreError> {
        self.require_mode(Mode::Query)?;
        self.send(&Command::fetch(request)).await?;

        match tokio::time::timeout(timeout, self.read_batch()).await {
            Ok(Ok(batch)) => Ok(batch),
            Ok(Err(e)) => {
                if !matches!(e, StoreError::Fetch(_)) {
                    self.poison();
                }
                Err(e)
            }
            Err(_) => {
                // the rest of the batch would land in the next reply
                self.poison();
                Err(StoreError::Timeout(timeout))
            }
        }
    }

    async fn live_query(
        &mut self,
        cursor: &str,
        query: &str,
        feeds: LiveFeeds,
    ) -> Result<(), StoreError> {
        self.require_mode(Mode::Query)?;
        let command = Command::Query {
            left_off: cursor.to_string(),
            query: query.to_string(),
        };
        self.expect_ok(&command).await?.map_err(StoreError::Query)?;

        let reader = self.reader.take().ok_or(StoreError::Closed)?;
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(pump_live(self.addr.clone(), reader, feeds, stop_rx));
        self.live = Some(LiveReader { stop, handle });

        debug!(addr = %self.addr, cursor = %cursor, "Live query attached");
        Ok(())
    }

    async fn single(&mut self, id: &str, query: &str) -> Result<Bytes, StoreError> {
        self.require_mode(Mode::Query)?;
        self.send(&Command::Single {
            id: id.to_string(),
            query: query.to_string(),
        })
        .await?;

        match self.read_reply().await? {
            Reply::Data(raw) => Ok(raw),
            Reply::Err(message) => Err(StoreError::Rejected(message)),
            other => Err(StoreError::Protocol(format!("expected data/err, got {other:?}"))),
        }
    }

    async fn admin(&mut self, command: AdminCommand) -> Result<(), StoreError> {
        self.require_mode(Mode::Query)?;
        self.expect_ok(&Command::from(command))
            .await?
            .map_err(StoreError::Rejected)
    }

    async fn close(&mut self) {
        if let Some(live) = self.live.take() {
            let _ = live.stop.send(true);
            if let Err(e) = live.handle.await {
                warn!(addr = %self.addr, error = %e, "Live reader ended abnormally");
            }
        }

        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            debug!(addr = %self.addr, "Store connection closed");
        }
        self.reader = None;
        self.mode = None;
    }
}

impl Drop for TcpStoreConnection {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.handle.abort();
        }
    }
}
