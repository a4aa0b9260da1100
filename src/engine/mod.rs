mod availability;
mod calendar;
mod directory;
mod error;
mod mutations;
mod payout;
mod queries;
#[cfg(test)]
mod tests;

pub use calendar::{Calendar, Overbooked};
pub use directory::Directory;
pub use error::EngineError;
pub use payout::{charity_cut, split_payout};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::error;
use ulid::{Generator, Ulid};

use crate::collaborators::Collaborators;
use crate::config::ProtocolConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Everything the engine knows about one space: the record itself, its
/// calendar, and the stays booked on it.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub space: Space,
    pub calendar: Calendar,
    pub stays: HashMap<Ulid, Stay>,
    /// Stay ids in booking order.
    pub order: Vec<Ulid>,
}

impl SpaceState {
    pub fn new(space: Space) -> Self {
        Self {
            space,
            calendar: Calendar::new(),
            stays: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Stays in booking order.
    pub fn stays_in_order(&self) -> impl Iterator<Item = &Stay> {
        self.order.iter().filter_map(|id| self.stays.get(id))
    }

    /// Booked or checked-in stays block deletion; finished ones do not.
    pub fn has_pending_stays(&self) -> bool {
        self.stays
            .values()
            .any(|s| matches!(s.status, StayStatus::Booked | StayStatus::CheckedIn))
    }
}

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction or stats see the file.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes from this batch
    // never ride along with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

/// Lock order: `directory` first, then any space lock. Every space lock is
/// taken while holding the directory lock, so a directory writer never waits
/// on a space.
pub struct Engine {
    pub(super) directory: RwLock<Directory>,
    pub(super) spaces: DashMap<Ulid, SharedSpaceState>,
    /// Reverse lookup: stay id → space id.
    pub(super) stay_to_space: DashMap<Ulid, Ulid>,
    /// Guest → stay ids in booking order.
    pub(super) guest_stays: DashMap<Account, Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) config: ProtocolConfig,
    pub(super) collaborators: Collaborators,
    ids: Mutex<Generator>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: ProtocolConfig,
        collaborators: Collaborators,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            directory: RwLock::new(Directory::default()),
            spaces: DashMap::new(),
            stay_to_space: DashMap::new(),
            guest_stays: DashMap::new(),
            wal_tx,
            notify,
            config,
            collaborators,
            ids: Mutex::new(Generator::new()),
        };

        // Replay never calls collaborators: tokens were minted and payouts
        // settled when the events were first committed. We are the sole owner
        // of every lock here, so try_write always succeeds; never block, this
        // may run inside the runtime (lazy tenant creation).
        {
            let mut dir = engine
                .directory
                .try_write()
                .map_err(|_| io::Error::other("replay: directory lock contended"))?;
            for event in &events {
                if let Err(e) = engine.apply(&mut dir, event) {
                    error!(subject = %event.subject(), "replay: event does not apply: {e}");
                }
            }
            engine.restore_insertion_order(&mut dir)?;
        }

        Ok(engine)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Today's day index on the engine's clock.
    pub fn today(&self) -> Day {
        self.config.today(self.collaborators.clock.now())
    }

    /// Ids are monotonic, so sorting by id recovers creation order.
    pub(super) fn next_id(&self) -> Result<Ulid, EngineError> {
        let mut ids = self
            .ids
            .lock()
            .map_err(|_| EngineError::Internal("id generator poisoned".into()))?;
        ids.generate()
            .map_err(|e| EngineError::Internal(format!("id generator: {e}")))
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub fn get_space_state(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn get_space_for_stay(&self, stay_id: &Ulid) -> Option<Ulid> {
        self.stay_to_space.get(stay_id).map(|e| *e.value())
    }

    /// Lookup stay → space, acquire the space's write lock.
    pub(super) async fn resolve_stay_write(
        &self,
        stay_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpaceState>, EngineError> {
        let space_id = self
            .get_space_for_stay(stay_id)
            .ok_or(EngineError::StayNotFound(*stay_id))?;
        let ss = self
            .get_space_state(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        Ok(ss.write_owned().await)
    }

    /// WAL-append + apply + notify for an event scoped to one space.
    pub(super) async fn persist(&self, ss: &mut SpaceState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let applied = self.apply_to_space(ss, event);
        debug_assert!(applied.is_ok(), "validated event failed to apply: {applied:?}");
        if let Err(e) = applied {
            error!(subject = %event.subject(), "committed event failed to apply: {e}");
            return Err(e);
        }
        self.notify.send(event.channel(), event);
        Ok(())
    }

    /// WAL-append + apply + notify for a directory event. Caller holds the
    /// directory write lock.
    pub(super) async fn persist_directory(&self, dir: &mut Directory, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let applied = self.apply(dir, event);
        debug_assert!(applied.is_ok(), "validated event failed to apply: {applied:?}");
        if let Err(e) = applied {
            error!(subject = %event.subject(), "committed event failed to apply: {e}");
            return Err(e);
        }
        self.notify.send(event.channel(), event);
        Ok(())
    }

    /// Apply any event. Caller holds the directory write lock, so no space
    /// lock can be held elsewhere.
    fn apply(&self, dir: &mut Directory, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::FacilityCreated { .. } | Event::FacilityUpdated { .. } => {
                dir.apply(event);
                Ok(())
            }
            Event::FacilityDeleted { id } => {
                dir.apply(event);
                for space_id in dir.space_ids(id) {
                    let ss = self
                        .get_space_state(space_id)
                        .ok_or(EngineError::SpaceNotFound(*space_id))?;
                    let mut guard = ss.try_write().map_err(|_| lock_held(*space_id))?;
                    guard.space.existence = Existence::Deleted;
                }
                Ok(())
            }
            Event::SpaceAdded {
                id,
                facility_id,
                capacity,
                price_per_night,
                active,
                data_uri,
            } => {
                let space = Space {
                    id: *id,
                    facility_id: *facility_id,
                    capacity: *capacity,
                    price_per_night: *price_per_night,
                    active: *active,
                    existence: Existence::Exists,
                    data_uri: data_uri.clone(),
                };
                self.spaces.insert(*id, Arc::new(RwLock::new(SpaceState::new(space))));
                dir.apply(event);
                Ok(())
            }
            other => {
                let space_id = event_space_id(other).ok_or(EngineError::Internal(
                    "event has no space".into(),
                ))?;
                let ss = self
                    .get_space_state(&space_id)
                    .ok_or(EngineError::SpaceNotFound(space_id))?;
                let mut guard = ss.try_write().map_err(|_| lock_held(space_id))?;
                self.apply_to_space(&mut guard, other)
            }
        }
    }

    /// Apply a space or stay event directly to a SpaceState (caller holds the
    /// lock). Every fallible step runs before anything is written.
    fn apply_to_space(&self, ss: &mut SpaceState, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::SpaceUpdated {
                capacity,
                price_per_night,
                active,
                data_uri,
                ..
            } => {
                ss.space.capacity = *capacity;
                ss.space.price_per_night = *price_per_night;
                ss.space.active = *active;
                ss.space.data_uri = data_uri.clone();
            }
            Event::SpaceDeleted { .. } => {
                ss.space.existence = Existence::Deleted;
            }
            Event::StayBooked {
                id,
                space_id,
                guest,
                range,
                units,
                amount_paid,
                price_per_night,
                token_id,
                data_uri,
            } => {
                availability::reserve(ss, *range, *units)?;
                ss.stays.insert(
                    *id,
                    Stay {
                        id: *id,
                        space_id: *space_id,
                        guest: guest.clone(),
                        range: *range,
                        units: *units,
                        amount_paid: *amount_paid,
                        escrow: *amount_paid,
                        price_per_night: *price_per_night,
                        status: StayStatus::Booked,
                        token_id: *token_id,
                        data_uri: data_uri.clone(),
                    },
                );
                ss.order.push(*id);
                self.stay_to_space.insert(*id, *space_id);
                self.guest_stays.entry(guest.clone()).or_default().push(*id);
            }
            Event::StayModified {
                id,
                range,
                units,
                amount_paid,
                escrow,
                price_per_night,
                ..
            } => {
                let (old_range, old_units) = {
                    let stay = ss.stays.get(id).ok_or(EngineError::StayNotFound(*id))?;
                    (stay.range, stay.units)
                };
                availability::reschedule(ss, (old_range, old_units), (*range, *units))?;
                let stay = ss.stays.get_mut(id).ok_or(EngineError::StayNotFound(*id))?;
                stay.range = *range;
                stay.units = *units;
                stay.amount_paid = *amount_paid;
                stay.escrow = *escrow;
                stay.price_per_night = *price_per_night;
            }
            Event::StayCancelled { id, payout, .. }
            | Event::StayCheckedIn { id, payout, .. }
            | Event::StayCheckedOut { id, payout, .. } => {
                let (range, units, escrow) = {
                    let stay = ss.stays.get(id).ok_or(EngineError::StayNotFound(*id))?;
                    (stay.range, stay.units, stay.escrow)
                };
                let remaining = escrow.checked_sub(payout.total()).ok_or_else(|| {
                    EngineError::Internal(format!("stay {id} pays out more than it holds in escrow"))
                })?;
                if matches!(event, Event::StayCancelled { .. }) {
                    availability::release(ss, range, units)?;
                }
                let stay = ss.stays.get_mut(id).ok_or(EngineError::StayNotFound(*id))?;
                stay.escrow = remaining;
                if let Some(status) = event.stay_status() {
                    stay.status = status;
                }
            }
            Event::FacilityCreated { .. }
            | Event::FacilityUpdated { .. }
            | Event::FacilityDeleted { .. }
            | Event::SpaceAdded { .. } => {
                return Err(EngineError::Internal("directory event applied to a space".into()));
            }
        }
        Ok(())
    }

    /// Compacted WALs are written facility by facility, so lists rebuilt from
    /// them are re-sorted by id.
    fn restore_insertion_order(&self, dir: &mut Directory) -> io::Result<()> {
        dir.restore_order();
        for mut entry in self.guest_stays.iter_mut() {
            entry.value_mut().sort();
        }
        for entry in self.spaces.iter() {
            let mut guard = entry
                .value()
                .try_write()
                .map_err(|_| io::Error::other("replay: space lock contended"))?;
            guard.order.sort();
        }
        Ok(())
    }
}

fn lock_held(space_id: Ulid) -> EngineError {
    EngineError::Internal(format!("space {space_id} locked during a directory write"))
}

/// The space a non-directory event belongs to.
fn event_space_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SpaceUpdated { id, .. } | Event::SpaceDeleted { id, .. } => Some(*id),
        Event::StayBooked { space_id, .. }
        | Event::StayModified { space_id, .. }
        | Event::StayCancelled { space_id, .. }
        | Event::StayCheckedIn { space_id, .. }
        | Event::StayCheckedOut { space_id, .. } => Some(*space_id),
        Event::FacilityCreated { .. }
        | Event::FacilityUpdated { .. }
        | Event::FacilityDeleted { .. }
        | Event::SpaceAdded { .. } => None,
    }
}
