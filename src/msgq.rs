//! The bounded SPSC message queue between the control thread and a device's
//! IO thread.
//!
//! Every cross-thread field update travels through one of these. `send` is a
//! cooperative rendezvous: the control thread parks until the IO thread has
//! processed the message and acknowledged it. `post` is fire-and-forget.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::{Error, Result};

const QUEUE_DEPTH: usize = 128;

/// The sending (control-thread) half of a device message queue.
pub struct AsyncMsgQ<M> {
    tx: Sender<Envelope<M>>,
    waker: Option<Arc<mio::Waker>>,
}

/// The receiving (IO-thread) half of a device message queue.
pub struct MsgReceiver<M> {
    rx: Receiver<Envelope<M>>,
}

/// A queued message plus its pending acknowledgement.
pub struct Envelope<M> {
    /// The message itself.
    pub msg: M,
    ack: Option<Sender<Result<()>>>,
}

impl<M> Envelope<M> {
    /// Acknowledges a blocking `send`, unparking the control thread.
    ///
    /// Dropping an envelope without acknowledging it fails the sender with
    /// `NotImplemented`, which the caller treats as a bug in the implementor.
    pub fn ack(mut self, result: Result<()>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(result);
        }
    }

    /// Splits the envelope into the message and its acknowledgement token,
    /// for handlers that consume the message by value.
    pub fn into_parts(self) -> (M, Option<AckToken>) {
        (self.msg, self.ack.map(|tx| AckToken { tx }))
    }
}

/// The acknowledgement half of a split [`Envelope`].
pub struct AckToken {
    tx: Sender<Result<()>>,
}

impl AckToken {
    /// Acknowledges the blocking `send` this token came from.
    pub fn ack(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}

/// Creates a connected queue pair.
pub fn async_msgq<M>(waker: Option<Arc<mio::Waker>>) -> (AsyncMsgQ<M>, MsgReceiver<M>) {
    let (tx, rx) = bounded(QUEUE_DEPTH);
    (AsyncMsgQ { tx, waker }, MsgReceiver { rx })
}

impl<M> AsyncMsgQ<M> {
    /// Enqueues `msg` and blocks until the IO thread acknowledges it.
    pub fn send(&self, msg: M) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.enqueue(Envelope {
            msg,
            ack: Some(ack_tx),
        })?;

        match ack_rx.recv() {
            Ok(result) => result,
            // The envelope was dropped without an ack.
            Err(_) => Err(Error::NotImplemented),
        }
    }

    /// Enqueues `msg` without waiting for it to be processed.
    pub fn post(&self, msg: M) -> Result<()> {
        self.enqueue(Envelope { msg, ack: None })
    }

    fn enqueue(&self, env: Envelope<M>) -> Result<()> {
        let env = match self.tx.try_send(env) {
            Ok(()) => {
                self.wake();
                return Ok(());
            }
            Err(TrySendError::Full(env)) => env,
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::BadState("IO thread is gone".into()))
            }
        };

        // Queue full; the IO thread drains it each iteration, so a blocking
        // send makes progress as long as that thread is alive.
        self.wake();
        self.tx
            .send(env)
            .map_err(|_| Error::BadState("IO thread is gone".into()))?;
        self.wake();
        Ok(())
    }

    fn wake(&self) {
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }
}

impl<M> MsgReceiver<M> {
    /// Dequeues the next message, if any. Messages come out in FIFO order.
    pub fn try_recv(&self) -> Option<Envelope<M>> {
        self.rx.try_recv().ok()
    }

    /// Blocks for the next message. Only used by IO threads with no poll fd.
    pub fn recv(&self) -> Option<Envelope<M>> {
        self.rx.recv().ok()
    }
}

impl<M> std::fmt::Debug for AsyncMsgQ<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AsyncMsgQ(depth={})", self.tx.len())
    }
}

impl<M> std::fmt::Debug for MsgReceiver<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MsgReceiver(depth={})", self.rx.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_blocks_for_ack() {
        let (q, rx) = async_msgq::<u32>(None);

        let io = thread::spawn(move || {
            let env = rx.recv().unwrap();
            assert_eq!(env.msg, 7);
            env.ack(Ok(()));

            // A dropped envelope fails its sender.
            let env = rx.recv().unwrap();
            assert_eq!(env.msg, 8);
            drop(env);
        });

        assert!(q.send(7).is_ok());
        assert!(matches!(q.send(8), Err(Error::NotImplemented)));
        io.join().unwrap();
    }

    #[test]
    fn post_is_fifo_with_send() {
        let (q, rx) = async_msgq::<u32>(None);
        q.post(1).unwrap();
        q.post(2).unwrap();

        let io = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let env = rx.recv().unwrap();
                seen.push(env.msg);
                env.ack(Ok(()));
            }
            seen
        });

        q.send(3).unwrap();
        assert_eq!(io.join().unwrap(), vec![1, 2, 3]);
    }
}
