//! Reducer Rendezvous
//!
//! Inbound reducer connections park themselves on a bounded offer queue;
//! the controller drains it when a job needs aggregation. Each connection
//! is driven by a small session state machine:
//!
//! ```text
//! HELLO_IN -> AWAIT_ASSIGN -> AWAIT_START_ACK -> AWAIT_DONE -> AWAIT_FINAL_ACK
//! ```
//!
//! Cross-task signalling uses two capacity-1 channels per session: `recv`
//! carries `bool` outcomes from the session to the controller, `send`
//! carries [`ReducerCommand`]s the other way. Protocol violations publish
//! `false` where the state machine requires it and close the connection.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use quarry_protocol::wire::{self, LENGTH_PREFIX_SIZE};
use quarry_protocol::{ReducerDone, ReducerHello, SearchConfig};

use crate::metrics::METRICS;

/// Controller-to-session commands.
#[derive(Debug, Clone)]
pub enum ReducerCommand {
    /// Start aggregating for this (enriched) search config.
    Assign(SearchConfig),
    /// Every task result has been delivered; tell the reducer to finish.
    Finish,
    /// The job was cancelled or failed; drop the session.
    Abort,
}

/// A connected reducer waiting for work. The offering connection stays
/// alive, holding the other ends of both channels, until its session
/// terminates.
pub struct ReducerOffer {
    pub host: String,
    pub port: u16,
    pub recv: mpsc::Receiver<bool>,
    pub send: mpsc::Sender<ReducerCommand>,
}

/// Accept loop. Every connection gets its own session task; sessions
/// block in their HELLO phase once the offer queue is full, which is the
/// backpressure bound on parked reducers.
pub async fn serve(listener: TcpListener, offers: mpsc::Sender<ReducerOffer>) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("Reducer listener failed to accept")?;
        debug!("Reducer connection from {peer}");
        tokio::spawn(handle_connection(stream, offers.clone()));
    }
}

async fn handle_connection(stream: TcpStream, offers: mpsc::Sender<ReducerOffer>) {
    if let Err(e) = run_session(stream, offers).await {
        debug!("Reducer session closed: {e:#}");
    }
}

async fn run_session(mut stream: TcpStream, offers: mpsc::Sender<ReducerOffer>) -> Result<()> {
    // HELLO_IN: where does this reducer listen for worker results?
    let hello: ReducerHello = wire::decode_payload(&read_frame(&mut stream).await?)?;

    let (recv_tx, recv_rx) = mpsc::channel::<bool>(1);
    let (send_tx, mut send_rx) = mpsc::channel::<ReducerCommand>(1);
    offers
        .send(ReducerOffer {
            host: hello.host,
            port: hello.port,
            recv: recv_rx,
            send: send_tx,
        })
        .await
        .map_err(|_| anyhow!("rendezvous queue closed"))?;

    let mut ack = [0u8; 1];

    // AWAIT_ASSIGN: race the assignment against the connection. Any byte
    // (or EOF) before an assignment means the reducer is gone.
    let config = tokio::select! {
        command = send_rx.recv() => match command {
            Some(ReducerCommand::Assign(config)) => config,
            _ => {
                let _ = recv_tx.send(false).await;
                return Ok(());
            }
        },
        _ = stream.read(&mut ack) => {
            let _ = recv_tx.send(false).await;
            return Ok(());
        }
    };
    stream
        .write_all(&wire::frame_payload(&config.to_msgpack()?)?)
        .await?;
    stream.flush().await?;

    // AWAIT_START_ACK: one byte accepts, EOF declines.
    let n = stream.read(&mut ack).await?;
    if n == 0 {
        let _ = recv_tx.send(false).await;
        return Ok(());
    }
    let _ = recv_tx.send(true).await;
    METRICS.inc_reducers_assigned();

    // AWAIT_DONE: wait for the controller's verdict. Read-side activity
    // before then is a protocol error.
    tokio::select! {
        command = send_rx.recv() => match command {
            Some(ReducerCommand::Finish) => {}
            _ => return Ok(()),
        },
        _ = stream.read(&mut ack) => {
            let _ = recv_tx.send(false).await;
            return Ok(());
        }
    }
    stream
        .write_all(&wire::encode_frame(&ReducerDone { done: true })?)
        .await?;
    stream.flush().await?;

    // AWAIT_FINAL_ACK: one byte confirms the aggregation landed.
    let n = stream.read(&mut ack).await?;
    let _ = recv_tx.send(n != 0).await;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut prefix).await?;
    let len = wire::read_frame_len(&prefix)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}
