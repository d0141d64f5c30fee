//! The generic capture engine behind every CDC source.
//!
//! Lifecycle on `start`: configure the server artefacts when asked (a
//! duplicate-creation answer is swallowed), run the initial load when it has
//! never completed, seed the position checkpoint at the server tip so only
//! future changes are captured, then hand the feed to a background worker.
//!
//! The worker polls the feed, suppresses adjacent duplicates by payload
//! hash, and advances the position checkpoint only after the batch has been
//! emitted. Malformed events are logged and skipped without touching the
//! hash checkpoint; their position still advances so they are not retried
//! forever. Any failure backs off exponentially up to the configured cap.

use std::fmt::Display;

use std::time::Duration;

use crate::cdc::{record_hash, CdcRecord, CdcSettings, Checkpoints};
use crate::error::{CdcError, SerializationError, StreamError};
use crate::operator::source::{Emitter, SourceOperator, SourceWorker};
use crate::store::SharedStore;
use crate::timer::Shutdown;

/// One change pulled from a feed, with the position it advances to.
pub struct ChangeEvent {
    /// Encoded position (LSN hex, text LSN, resume-token JSON); `None` when
    /// the backend did not attach one to this event.
    pub position: Option<String>,
    /// The decoded record, or the per-event parse failure.
    pub record: Result<CdcRecord, SerializationError>,
}

/// Backend contract of a CDC source.
pub trait ChangeFeed: Send + 'static {
    /// Stable `<schema>.<table>` / `<db>.<collection>` checkpoint scope.
    fn scope(&self) -> String;

    /// Idempotently create the server-side capture artefacts. Answering
    /// [`CdcError::AlreadyConfigured`] is fine; the engine swallows it.
    fn configure_server(&mut self) -> Result<(), CdcError> {
        Ok(())
    }

    /// Full scan for the initial load, emitting row by row.
    fn initial_scan(
        &mut self,
        sink: &mut dyn FnMut(CdcRecord) -> Result<(), CdcError>,
    ) -> Result<(), CdcError>;

    /// The current server tip, used to seed the position checkpoint.
    fn current_position(&mut self) -> Result<Option<String>, CdcError>;

    /// All changes after `since`, in server order.
    fn fetch_changes(&mut self, since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError>;
}

/// Source operator wrapping a [`ChangeFeed`].
pub struct CdcSource<F: ChangeFeed> {
    settings: CdcSettings,
    feed: Option<F>,
    checkpoint_store: SharedStore<String, String>,
    worker: Option<SourceWorker>,
}

impl<F: ChangeFeed> CdcSource<F> {
    pub fn new(
        settings: CdcSettings,
        feed: F,
        checkpoint_store: SharedStore<String, String>,
    ) -> Self {
        Self {
            settings,
            feed: Some(feed),
            checkpoint_store,
            worker: None,
        }
    }
}

impl<F: ChangeFeed> Display for CdcSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CdcSource<{}>", self.settings.source_id)
    }
}

impl<F: ChangeFeed> SourceOperator<CdcRecord> for CdcSource<F> {
    fn start(&mut self, emitter: Emitter<CdcRecord>) -> Result<(), StreamError> {
        let mut feed = self
            .feed
            .take()
            .ok_or_else(|| StreamError::illegal("source already started"))?;
        let checkpoints = Checkpoints::new(
            self.checkpoint_store.clone(),
            &self.settings.source_id,
            &feed.scope(),
        );

        if self.settings.configure_on_server {
            match feed.configure_server() {
                Ok(()) => {}
                Err(CdcError::AlreadyConfigured) => {
                    tracing::debug!(
                        "cdc source {}: server-side capture already configured",
                        self.settings.source_id
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.settings.do_initial_load && !checkpoints.initial_load_done()? {
            tracing::info!("cdc source {}: running initial load", self.settings.source_id);
            let mut emitted = 0usize;
            feed.initial_scan(&mut |record| {
                emitter
                    .emit(record)
                    .map_err(|e| CdcError::Transient(format!("initial load emit failed: {e}")))?;
                emitted += 1;
                Ok(())
            })
            .map_err(StreamError::from)?;
            checkpoints.set_initial_load_done()?;
            tracing::info!(
                "cdc source {}: initial load emitted {emitted} rows",
                self.settings.source_id
            );
        }

        if checkpoints.position()?.is_none() {
            if let Some(tip) = feed.current_position().map_err(StreamError::from)? {
                checkpoints.set_position(&tip)?;
            }
        }

        let settings = self.settings.clone();
        self.worker = Some(SourceWorker::spawn(
            &format!("cdc-{}", settings.source_id),
            move |shutdown| capture_loop(feed, checkpoints, emitter, settings, shutdown),
        )?);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        Ok(())
    }
}

fn capture_loop<F: ChangeFeed>(
    mut feed: F,
    checkpoints: Checkpoints,
    emitter: Emitter<CdcRecord>,
    settings: CdcSettings,
    shutdown: Shutdown,
) {
    let mut backoff = Duration::from_secs(1);
    while !shutdown.is_triggered() {
        match capture_cycle(&mut feed, &checkpoints, &emitter, &shutdown) {
            Ok(_) => {
                backoff = Duration::from_secs(1);
                if shutdown.sleep(settings.poll_interval) {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "cdc source {}: capture cycle failed, backing off {:?}: {e}",
                    settings.source_id,
                    backoff
                );
                if shutdown.sleep(backoff) {
                    break;
                }
                backoff = (backoff * 2).min(settings.max_backoff);
            }
        }
    }
    tracing::debug!("cdc source {} stopped", settings.source_id);
}

fn capture_cycle<F: ChangeFeed>(
    feed: &mut F,
    checkpoints: &Checkpoints,
    emitter: &Emitter<CdcRecord>,
    shutdown: &Shutdown,
) -> Result<usize, CdcError> {
    let position = checkpoints.position()?;
    let batch = feed.fetch_changes(position.as_deref())?;
    let total = batch.len();
    let mut last = checkpoints.last_hash()?;
    let mut max_position: Option<String> = None;

    for event in batch {
        if shutdown.is_triggered() {
            break;
        }
        let ChangeEvent { position, record } = event;
        if let Some(position) = position {
            max_position = Some(position);
        }
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                // skipped for good: the position advances, the hash does not
                tracing::warn!("cdc: skipping malformed change event: {e}");
                continue;
            }
        };
        let hash = record_hash(&record.data);
        if last.as_deref() == Some(hash.as_str()) {
            tracing::debug!("cdc: suppressed adjacent duplicate change");
            continue;
        }
        emitter
            .emit(record)
            .map_err(|e| CdcError::Transient(format!("downstream failed: {e}")))?;
        checkpoints.set_last_hash(&hash)?;
        last = Some(hash);
    }

    if let Some(position) = max_position {
        checkpoints.set_position(&position)?;
    }
    Ok(total)
}
