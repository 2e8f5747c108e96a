mod error;
pub mod intervals;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use queries::project_appointment;
pub use store::{AvailabilityStore, DayGuards, IdClaim, SharedAppointment, SharedDay};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockReadGuard};

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes from this batch
    // don't leak into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The booking engine: in-memory versioned records, made durable through the
/// WAL writer task.
pub struct Engine {
    store: AvailabilityStore,
    wal_tx: mpsc::Sender<WalCommand>,
    lock_timeout: Duration,
    /// Shared by every mutation from before it takes a record lock until its
    /// in-memory apply; taken exclusively by compaction.
    commit_gate: RwLock<()>,
    /// Serializes person directory writes so id and email checks are atomic
    /// with the insert.
    directory_lock: Mutex<()>,
}

/// Replay one event into the store. Called only while the engine is being
/// built, so every record lock is uncontended.
fn apply_event(store: &AvailabilityStore, event: &Event) -> io::Result<()> {
    match event {
        Event::PersonRegistered { id, email } => {
            store.insert_person(Person { id: *id, email: email.clone() });
        }
        Event::PersonRemoved { id } => {
            store.remove_person(id);
        }
        Event::AvailabilitySet { days } => replay_days(store, days)?,
        Event::AvailabilityCleared { id } => {
            if let Some(day) = store.get_day(id) {
                day.try_write().map_err(replay_contended)?.withdraw();
            }
        }
        Event::AppointmentBooked { appointment, days } => {
            store.insert_appointment(appointment.clone());
            replay_days(store, days)?;
        }
        Event::AppointmentCancelled { id, days } => {
            if let Some(apt) = store.get_appointment(id) {
                apt.try_write().map_err(replay_contended)?.status = AppointmentStatus::Cancelled;
            }
            replay_days(store, days)?;
        }
        Event::AppointmentRescheduled { appointment, days } => {
            match store.get_appointment(&appointment.id) {
                Some(apt) => *apt.try_write().map_err(replay_contended)? = appointment.clone(),
                None => store.insert_appointment(appointment.clone()),
            }
            replay_days(store, days)?;
        }
    }
    Ok(())
}

fn replay_days(store: &AvailabilityStore, days: &[DaySnapshot]) -> io::Result<()> {
    for snap in days {
        let day = store.day_or_vacant(snap.id);
        day.try_write().map_err(replay_contended)?.store(snap.slots.clone());
    }
    Ok(())
}

fn replay_contended(_: tokio::sync::TryLockError) -> io::Error {
    io::Error::other("record locked during WAL replay")
}

impl Engine {
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = AvailabilityStore::new();
        for event in &events {
            apply_event(&store, event)?;
        }
        tracing::info!(
            "replayed {} WAL events from {} ({} people)",
            events.len(),
            wal_path.display(),
            store.person_count()
        );

        Ok(Self {
            store,
            wal_tx,
            lock_timeout,
            commit_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Enter the commit gate. Must be called before any record lock is taken.
    async fn enter_commit(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        tokio::time::timeout(self.lock_timeout, self.commit_gate.read())
            .await
            .map_err(|_| EngineError::Timeout("commit gate"))
    }
}
