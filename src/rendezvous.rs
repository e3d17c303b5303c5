//! Zero-capacity handoff between a section's producer and its dispatch worker.
//!
//! `tokio::sync::mpsc` needs a capacity of at least one, so each value travels
//! with an acknowledgement that the receiver fires when it takes the value.
//! [`Handoff::send`] only returns once that happens, which keeps at most one
//! payload in flight per job.

use tokio::sync::{mpsc, oneshot};

/// The receiving side went away before taking the value.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed;

pub struct Handoff<T> {
    tx: mpsc::Sender<(T, oneshot::Sender<()>)>,
}

pub struct Intake<T> {
    rx: mpsc::Receiver<(T, oneshot::Sender<()>)>,
}

pub fn rendezvous<T>() -> (Handoff<T>, Intake<T>) {
    let (tx, rx) = mpsc::channel(1);
    (Handoff { tx }, Intake { rx })
}

impl<T> Handoff<T> {
    /// Waits until the receiver has taken `value`.
    pub async fn send(&self, value: T) -> Result<(), Closed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send((value, ack_tx)).await.map_err(|_| Closed)?;
        // The ack is dropped unsent if the intake is dropped with the value still queued
        ack_rx.await.map_err(|_| Closed)
    }
}

impl<T> Intake<T> {
    /// Takes the next value, releasing the blocked sender. `None` once the
    /// sender is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        let (value, ack) = self.rx.recv().await?;
        let _ = ack.send(());
        Some(value)
    }
}
