/// Plain TCP transport for talking to a broker's STOMP port
use std::io;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use stompkit_client::{Channel, EventSink};
use tokio::{
    net::TcpStream,
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::{
    bytes::Bytes,
    codec::{BytesCodec, FramedRead, FramedWrite},
};

// Close code reported when the broker hangs up
const GOING_AWAY: u16 = 1001;

#[derive(Debug)]
enum Outbound {
    Data(Bytes),
    Close(u16),
}

#[derive(Debug)]
pub(crate) struct TcpChannel {
    addr: String,
    outbound: Mutex<Option<UnboundedSender<Outbound>>>,
}

impl TcpChannel {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            outbound: Mutex::new(None),
        }
    }
}

impl Channel for TcpChannel {
    fn connect(&self, events: EventSink) -> io::Result<()> {
        let mut outbound = self.outbound.lock();
        if outbound.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "channel is already connected",
            ));
        }
        let runtime = Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run(self.addr.clone(), rx, events));
        *outbound = Some(tx);
        Ok(())
    }

    fn send(&self, bytes: Bytes) -> io::Result<()> {
        match &*self.outbound.lock() {
            Some(tx) => tx
                .send(Outbound::Data(bytes))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel is not connected",
            )),
        }
    }

    fn disconnect(&self, code: u16) {
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Outbound::Close(code));
        }
    }
}

async fn run(addr: String, mut outbound: UnboundedReceiver<Outbound>, events: EventSink) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            events.on_error(format!("connecting to {addr}: {e}")).await;
            return;
        }
    };
    if events.is_closed() {
        tracing::debug!(%addr, "session gone before the connection was established");
        return;
    }
    tracing::info!(%addr, "tcp connection established");

    let (rx, tx) = stream.into_split();
    let mut reader = FramedRead::new(rx, BytesCodec::new());
    let mut writer = FramedWrite::new(tx, BytesCodec::new());
    events.on_connected().await;

    loop {
        tokio::select! {
            maybe_bytes = reader.next() => match maybe_bytes {
                Some(Ok(bytes)) => events.on_data(bytes.freeze()).await,
                Some(Err(e)) => {
                    events.on_error(e).await;
                    break;
                }
                None => {
                    events.on_disconnected("connection closed by broker", GOING_AWAY).await;
                    break;
                }
            },

            // Queued writes are flushed in order, so a Close always
            // follows the last frame the session sent
            maybe_out = outbound.recv() => match maybe_out {
                Some(Outbound::Data(bytes)) => {
                    if let Err(e) = writer.send(bytes).await {
                        events.on_error(e).await;
                        break;
                    }
                }
                Some(Outbound::Close(code)) => {
                    if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
                        tracing::debug!(error = %e, "error closing tcp stream");
                    }
                    events.on_disconnected("closed by client", code).await;
                    break;
                }
                None => break,
            },
        }
    }
    tracing::debug!(%addr, "tcp connection finished");
}
