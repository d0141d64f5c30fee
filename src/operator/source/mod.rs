//! Source operators.
//!
//! A source owns a background worker that pushes values into the head of the
//! chain through an [`Emitter`]. `start` spawns the worker, `stop` requests a
//! cooperative shutdown and joins it. Emission order is source-defined.

use std::fmt::Display;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data};
use crate::timer::Shutdown;

/// Cloneable handle pushing values synchronously into a chain head.
pub struct Emitter<T> {
    chain: Arc<Mutex<BoxedOperator<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
        }
    }
}

impl<T: Data> Emitter<T> {
    pub(crate) fn new(chain: Arc<Mutex<BoxedOperator<T>>>) -> Self {
        Self { chain }
    }

    pub fn emit(&self, item: T) -> Result<(), StreamError> {
        self.chain.lock().process(item)
    }
}

/// The contract every source operator implements.
pub trait SourceOperator<T: Data>: Send + Display {
    /// Begin emission on a background worker owned by the source.
    fn start(&mut self, emitter: Emitter<T>) -> Result<(), StreamError>;

    /// Request shutdown and wait for the worker.
    fn stop(&mut self) -> Result<(), StreamError>;
}

pub(crate) struct SourceWorker {
    shutdown: Shutdown,
    handle: Option<JoinHandle<()>>,
}

impl SourceWorker {
    pub(crate) fn spawn(
        name: &str,
        body: impl FnOnce(Shutdown) + Send + 'static,
    ) -> Result<Self, StreamError> {
        let shutdown = Shutdown::new();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(format!("source-{name}"))
            .spawn(move || body(thread_shutdown))
            .map_err(|e| StreamError::illegal(format!("failed to spawn source worker: {e}")))?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("source worker panicked");
            }
        }
    }
}

/// Emits the items of an iterator, then idles until stopped.
pub struct IteratorSource<T, I>
where
    I: Iterator<Item = T> + Send + 'static,
{
    iter: Option<I>,
    worker: Option<SourceWorker>,
}

impl<T: Data, I: Iterator<Item = T> + Send + 'static> IteratorSource<T, I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter: Some(iter),
            worker: None,
        }
    }
}

impl<T, I: Iterator<Item = T> + Send + 'static> Display for IteratorSource<T, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IteratorSource<{}>", std::any::type_name::<T>())
    }
}

impl<T: Data, I: Iterator<Item = T> + Send + 'static> SourceOperator<T> for IteratorSource<T, I> {
    fn start(&mut self, emitter: Emitter<T>) -> Result<(), StreamError> {
        let iter = self
            .iter
            .take()
            .ok_or_else(|| StreamError::illegal("source already started"))?;
        self.worker = Some(SourceWorker::spawn("iterator", move |shutdown| {
            for item in iter {
                if shutdown.is_triggered() {
                    break;
                }
                if let Err(e) = emitter.emit(item) {
                    log::error!("iterator source: downstream failed: {e}");
                    break;
                }
            }
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        Ok(())
    }
}

/// Emits whatever arrives on a channel until the sending side disconnects.
pub struct ChannelSource<T> {
    rx: Option<flume::Receiver<T>>,
    worker: Option<SourceWorker>,
}

impl<T: Data> ChannelSource<T> {
    /// Create the source together with the sending half of its channel.
    pub fn new() -> (flume::Sender<T>, Self) {
        let (tx, rx) = flume::unbounded();
        (
            tx,
            Self {
                rx: Some(rx),
                worker: None,
            },
        )
    }

    pub fn from_receiver(rx: flume::Receiver<T>) -> Self {
        Self {
            rx: Some(rx),
            worker: None,
        }
    }
}

impl<T> Display for ChannelSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelSource<{}>", std::any::type_name::<T>())
    }
}

impl<T: Data> SourceOperator<T> for ChannelSource<T> {
    fn start(&mut self, emitter: Emitter<T>) -> Result<(), StreamError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| StreamError::illegal("source already started"))?;
        self.worker = Some(SourceWorker::spawn("channel", move |shutdown| loop {
            if shutdown.is_triggered() {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(item) => {
                    if let Err(e) = emitter.emit(item) {
                        log::error!("channel source: downstream failed: {e}");
                        break;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        Ok(())
    }
}
