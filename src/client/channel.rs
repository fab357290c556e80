use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::error::{code, Error, Result};
use crate::proto::{
    Frame, FrameReader, FrameWriter, Message, RequestCode, WireReader,
};

/// The correlated half of a reply: status code plus whatever payload
/// follows it, which the caller decodes per call.
#[derive(Debug)]
pub struct Reply {
    pub status: u32,
    pub body: Vec<u8>,
}

impl Reply {
    /// Maps a non-zero status onto the error taxonomy.
    pub fn ok(self) -> Result<Vec<u8>> {
        if self.status == code::OK {
            Ok(self.body)
        } else {
            Err(Error::from_wire_code(self.status))
        }
    }
}

/// Traffic the channel cannot correlate to a pending call: standing
/// subscription deliveries and connection lifecycle changes.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A message for a standing subscription, tagged with the
    /// subscription id chosen at subscribe time.
    Delivery { sub_id: u64, msg: Message },
    /// The peer told us to go away (shutdownClients reached us).
    ShutdownNotice,
    /// The read loop ended: socket error or peer close.
    Dead,
}

/// One bidirectional, length-prefixed connection plus the correlation
/// table mapping locally generated ids to pending calls.
///
/// All outbound frames funnel through a single write mutex; the protocol
/// has no multiplexing, so interleaved partial writes would corrupt
/// framing. A dedicated read-loop task wakes pending callers when their
/// correlating reply arrives and broadcast-wakes everything with
/// `ConnectionLost` when the socket dies.
pub struct Channel {
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    corr: AtomicU64,
    alive: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Splits the stream, spawns the read loop, and returns the channel
    /// together with the receiver for uncorrelated events.
    pub fn open(
        stream: TcpStream,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            writer: Mutex::new(FrameWriter::new(write_half)),
            pending: Mutex::new(HashMap::new()),
            corr: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            reader_task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::read_loop(
            channel.clone(),
            FrameReader::new(read_half),
            event_tx,
        ));
        // not contended at this point, the read loop never takes it
        *channel.reader_task.try_lock().unwrap() = Some(task);
        (channel, event_rx)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Allocates a fresh correlation id.
    pub fn next_corr(&self) -> u64 {
        self.corr.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a frame without expecting any reply.
    pub async fn notify(&self, code: RequestCode, body: Vec<u8>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ConnectionLost);
        }
        self.writer.lock().await.write(&Frame::new(code, body)).await
    }

    /// Registers a pending call under `corr`, sends the frame, and waits
    /// for the correlating reply. On timeout the entry is unregistered
    /// locally and `Timeout` is returned; sending any "forget this id"
    /// message to the peer is the caller's business.
    pub async fn call(
        &self,
        code: RequestCode,
        corr: u64,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Reply> {
        if !self.is_alive() {
            return Err(Error::ConnectionLost);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(corr, tx);

        if let Err(e) =
            self.writer.lock().await.write(&Frame::new(code, body)).await
        {
            self.pending.lock().await.remove(&corr);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // sender dropped: read loop died and drained the table
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&corr);
                Err(Error::Timeout)
            }
        }
    }

    /// Tears the channel down: aborts the read loop and wakes every
    /// pending caller with `ConnectionLost`.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        Self::drain_pending(&self.pending).await;
    }

    /// Dropping the senders is what wakes the callers: `call` maps a
    /// closed oneshot onto `ConnectionLost`.
    async fn drain_pending(
        pending: &Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    ) {
        pending.lock().await.clear();
    }

    async fn read_loop(
        channel: Arc<Channel>,
        mut reader: FrameReader<OwnedReadHalf>,
        event_tx: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        loop {
            let frame = match reader.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    if channel.alive.swap(false, Ordering::AcqRel) {
                        debug!("read loop ended: {e}");
                        Self::drain_pending(&channel.pending).await;
                        let _ = event_tx.send(ChannelEvent::Dead);
                    }
                    return;
                }
            };
            match frame.code {
                RequestCode::Reply | RequestCode::GetResponse => {
                    let mut r = frame.reader();
                    let parsed = (|| -> Result<(u64, u32, Vec<u8>)> {
                        let corr = r.u64()?;
                        let status = r.u32()?;
                        Ok((corr, status, r.remaining().to_vec()))
                    })();
                    let (corr, status, body) = match parsed {
                        Ok(x) => x,
                        Err(e) => {
                            warn!("malformed reply frame: {e}");
                            continue;
                        }
                    };
                    if let Some(tx) =
                        channel.pending.lock().await.remove(&corr)
                    {
                        let _ = tx.send(Reply { status, body });
                    } else {
                        // late reply for a call that already timed out
                        trace!("dropping reply for unknown id {corr}");
                    }
                }
                RequestCode::MessageDelivery => {
                    let mut r = frame.reader();
                    let parsed = (|| -> Result<(u64, Message)> {
                        let sub_id = r.u64()?;
                        Ok((sub_id, Message::decode(&mut r)?))
                    })();
                    match parsed {
                        Ok((sub_id, msg)) => {
                            let _ = event_tx
                                .send(ChannelEvent::Delivery { sub_id, msg });
                        }
                        Err(e) => warn!("malformed delivery frame: {e}"),
                    }
                }
                RequestCode::ShutdownNotice => {
                    let _ = event_tx.send(ChannelEvent::ShutdownNotice);
                }
                other => {
                    warn!("unexpected inbound frame {other:?}, ignoring");
                }
            }
        }
    }
}
