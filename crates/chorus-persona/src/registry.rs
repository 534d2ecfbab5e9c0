//! Persona reservation over a shared [`RegistryStore`].
//!
//! The registry table (key [`REGISTRY_KEY`]) maps every currently held
//! persona to its holding session. Each session additionally keeps its own
//! lease record under `leases/<session>`. A persona appears in the table only
//! while it is held, and a session holds at most one persona: reserving a new
//! one silently hands the previous one back.
//!
//! All mutations are read-modify-write cycles retried on revision conflicts,
//! so two sessions racing for the same persona cannot both win.
//!
//! Entries whose `last_renewed_at` is older than the lease timeout are
//! treated as free and reclaimed by the next reservation from another
//! session. There is no background sweep.

use crate::error::{PersonaError, StoreError};
use crate::store::RegistryStore;
use chorus_types::{PersonaId, PersonaProfile, SessionId};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Store key of the shared registry table.
pub const REGISTRY_KEY: &str = "registry";

/// Default lease lifetime without renewal.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Read-modify-write attempts before reporting contention.
const MAX_CAS_ATTEMPTS: usize = 32;

/// One held persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub holding_session: SessionId,
    pub reserved_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

/// The shared table of held personas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTable {
    #[serde(default)]
    pub personas: BTreeMap<PersonaId, RegistryEntry>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A session's record of the persona it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLease {
    pub persona_id: PersonaId,
    pub session: SessionId,
    pub reserved_at: DateTime<Utc>,
}

/// Result of a successful reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub lease: SessionLease,
    /// Persona this session held before and has now handed back.
    pub released: Option<PersonaId>,
    /// `true` when the session already held the requested persona.
    pub already_held: bool,
}

/// Snapshot of availability across the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: Vec<PersonaId>,
    pub busy: BTreeMap<PersonaId, SessionId>,
}

fn lease_key(session: &SessionId) -> String {
    format!("leases/{session}")
}

/// Handle on the persona table. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    store: Arc<dyn RegistryStore>,
    catalog: Arc<Vec<PersonaProfile>>,
    lease_timeout: Duration,
}

impl PersonaRegistry {
    /// Creates a registry over `store` offering the personas in `catalog`.
    pub fn new(store: Arc<dyn RegistryStore>, catalog: Vec<PersonaProfile>) -> Self {
        Self {
            store,
            catalog: Arc::new(catalog),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    /// Overrides the lease timeout.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &[PersonaProfile] {
        &self.catalog
    }

    /// Looks up a persona in the catalog.
    pub fn profile(&self, id: &PersonaId) -> Result<&PersonaProfile, PersonaError> {
        self.catalog
            .iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| PersonaError::PersonaNotFound(id.to_string()))
    }

    fn is_expired(&self, entry: &RegistryEntry, now: DateTime<Utc>) -> bool {
        (now - entry.last_renewed_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.lease_timeout)
    }

    /// The entry for `persona` if it is held by `session` and not expired.
    fn held_by<'t>(
        &self,
        table: &'t mut RegistryTable,
        persona: &PersonaId,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Option<&'t mut RegistryEntry> {
        let expired = table.personas.get(persona).map(|e| self.is_expired(e, now));
        match table.personas.get_mut(persona) {
            Some(entry) if &entry.holding_session == session && expired == Some(false) => Some(entry),
            _ => None,
        }
    }

    fn load_table(&self) -> Result<(RegistryTable, Option<u64>), StoreError> {
        match self.store.get(REGISTRY_KEY)? {
            Some(v) => Ok((serde_json::from_value(v.data)?, Some(v.revision))),
            None => Ok((RegistryTable::default(), None)),
        }
    }

    fn load_lease(&self, session: &SessionId) -> Result<Option<SessionLease>, StoreError> {
        match self.store.get(&lease_key(session))? {
            Some(v) => Ok(Some(serde_json::from_value(v.data)?)),
            None => Ok(None),
        }
    }

    /// Applies `f` to the table and writes it back, retrying on conflicts.
    ///
    /// `f` returns its result and whether the table was modified; unmodified
    /// tables are not written.
    fn update_table<T>(
        &self,
        mut f: impl FnMut(&mut RegistryTable, DateTime<Utc>) -> Result<(T, bool), PersonaError>,
    ) -> Result<T, PersonaError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (mut table, revision) = self.load_table()?;
            let now = Utc::now();
            let (out, dirty) = f(&mut table, now)?;
            if !dirty {
                return Ok(out);
            }
            table.updated_at = Some(now);
            let data = serde_json::to_value(&table).map_err(StoreError::from)?;
            match self.store.compare_and_swap(REGISTRY_KEY, revision, data) {
                Ok(_) => return Ok(out),
                Err(StoreError::RevisionMismatch { .. }) => {
                    tracing::debug!(attempt, "registry changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Contention {
            key: REGISTRY_KEY.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    fn write_lease(&self, lease: &SessionLease) -> Result<(), PersonaError> {
        let key = lease_key(&lease.session);
        let data = serde_json::to_value(lease).map_err(StoreError::from)?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let revision = self.store.get(&key)?.map(|v| v.revision);
            match self.store.compare_and_swap(&key, revision, data.clone()) {
                Ok(_) => return Ok(()),
                Err(StoreError::RevisionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Contention {
            key,
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Reserves `persona` for `session`.
    ///
    /// Reserving a persona the session already holds is a no-op that returns
    /// the existing lease. Any other persona held by the session is released
    /// in the same write.
    ///
    /// # Errors
    ///
    /// - `PersonaNotFound` if the persona is not in the catalog.
    /// - `ReservationConflict` if another live session holds it.
    pub fn reserve(&self, persona: &PersonaId, session: &SessionId) -> Result<Reservation, PersonaError> {
        self.profile(persona)?;
        let prior_lease = self.load_lease(session)?;

        let (reservation, reclaimed_from) = self.update_table(|table, now| {
            if let Some(entry) = self.held_by(table, persona, session, now) {
                let lease = SessionLease {
                    persona_id: persona.clone(),
                    session: session.clone(),
                    reserved_at: entry.reserved_at,
                };
                let reservation = Reservation {
                    lease,
                    released: None,
                    already_held: true,
                };
                return Ok(((reservation, None), false));
            }

            let mut reclaimed_from = None;
            if let Some(entry) = table.personas.get(persona) {
                if !self.is_expired(entry, now) {
                    return Err(PersonaError::ReservationConflict {
                        persona: persona.clone(),
                        holder: entry.holding_session.clone(),
                    });
                }
                reclaimed_from = Some(entry.holding_session.clone());
            }

            let released = table
                .personas
                .iter()
                .find(|(id, e)| &e.holding_session == session && *id != persona)
                .map(|(id, _)| id.clone());
            table
                .personas
                .retain(|id, e| &e.holding_session != session || id == persona);

            table.personas.insert(
                persona.clone(),
                RegistryEntry {
                    holding_session: session.clone(),
                    reserved_at: now,
                    last_renewed_at: now,
                },
            );
            let reservation = Reservation {
                lease: SessionLease {
                    persona_id: persona.clone(),
                    session: session.clone(),
                    reserved_at: now,
                },
                released,
                already_held: false,
            };
            Ok(((reservation, reclaimed_from), true))
        })?;

        if prior_lease.as_ref() != Some(&reservation.lease) {
            self.write_lease(&reservation.lease)?;
        }

        if let Some(previous) = &reclaimed_from {
            tracing::warn!(persona = %persona, previous = %previous, session = %session, "reclaimed expired persona lease");
        }
        if reservation.already_held {
            tracing::debug!(persona = %persona, session = %session, "persona already held by session");
        } else {
            tracing::info!(persona = %persona, session = %session, released = ?reservation.released, "persona reserved");
        }
        Ok(reservation)
    }

    /// Reserves a persona chosen uniformly at random from those available.
    ///
    /// A session that already holds a persona keeps it.
    ///
    /// # Errors
    ///
    /// Returns `NoneAvailable` when every persona is held, even after
    /// retrying candidates lost to concurrent reservations.
    pub fn reserve_random(&self, session: &SessionId) -> Result<Reservation, PersonaError> {
        if let Some(lease) = self.status(session)? {
            return self.reserve(&lease.persona_id, session);
        }
        let mut candidates = self.list_available()?;
        candidates.shuffle(&mut rand::thread_rng());
        for candidate in candidates {
            match self.reserve(&candidate, session) {
                Err(PersonaError::ReservationConflict { .. }) => continue,
                other => return other,
            }
        }
        Err(PersonaError::NoneAvailable)
    }

    /// Releases whatever persona `session` holds and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `NotHeld` if the session has no lease, or if its persona was
    /// reclaimed or cleared in the meantime (the stale lease record is
    /// removed).
    pub fn release(&self, session: &SessionId) -> Result<PersonaId, PersonaError> {
        let Some(lease) = self.load_lease(session)? else {
            return Err(PersonaError::NotHeld(session.clone()));
        };

        let removed = self.update_table(|table, _| {
            let mine = table
                .personas
                .get(&lease.persona_id)
                .is_some_and(|e| &e.holding_session == session);
            if mine {
                table.personas.remove(&lease.persona_id);
            }
            Ok((mine, mine))
        })?;
        self.store.delete(&lease_key(session))?;

        if !removed {
            tracing::debug!(session = %session, persona = %lease.persona_id, "dropped stale lease");
            return Err(PersonaError::NotHeld(session.clone()));
        }
        tracing::info!(session = %session, persona = %lease.persona_id, "persona released");
        Ok(lease.persona_id)
    }

    /// Extends the lease held by `session`.
    ///
    /// # Errors
    ///
    /// Returns `NotHeld` if the session holds nothing or lost its persona.
    pub fn renew(&self, session: &SessionId) -> Result<SessionLease, PersonaError> {
        let Some(lease) = self.load_lease(session)? else {
            return Err(PersonaError::NotHeld(session.clone()));
        };

        let renewed = self.update_table(|table, now| {
            match self.held_by(table, &lease.persona_id, session, now) {
                Some(entry) => {
                    entry.last_renewed_at = now;
                    Ok((true, true))
                }
                None => Ok((false, false)),
            }
        })?;

        if !renewed {
            self.store.delete(&lease_key(session))?;
            return Err(PersonaError::NotHeld(session.clone()));
        }
        tracing::debug!(session = %session, persona = %lease.persona_id, "lease renewed");
        Ok(lease)
    }

    /// Returns the lease `session` currently holds, if it is still live.
    pub fn status(&self, session: &SessionId) -> Result<Option<SessionLease>, PersonaError> {
        let Some(lease) = self.load_lease(session)? else {
            return Ok(None);
        };
        let (mut table, _) = self.load_table()?;
        let live = self
            .held_by(&mut table, &lease.persona_id, session, Utc::now())
            .is_some();
        Ok(live.then_some(lease))
    }

    /// Catalog personas not held by any live session, in catalog order.
    pub fn list_available(&self) -> Result<Vec<PersonaId>, PersonaError> {
        Ok(self.availability()?.available)
    }

    /// Personas currently held by live sessions.
    pub fn list_held(&self) -> Result<BTreeMap<PersonaId, RegistryEntry>, PersonaError> {
        let (table, _) = self.load_table()?;
        let now = Utc::now();
        Ok(table
            .personas
            .into_iter()
            .filter(|(_, e)| !self.is_expired(e, now))
            .collect())
    }

    /// Available and busy personas in one read.
    pub fn availability(&self) -> Result<Availability, PersonaError> {
        let held = self.list_held()?;
        let available = self
            .catalog
            .iter()
            .filter(|p| !held.contains_key(&p.id))
            .map(|p| p.id.clone())
            .collect();
        let busy = held
            .into_iter()
            .map(|(id, e)| (id, e.holding_session))
            .collect();
        Ok(Availability { available, busy })
    }

    /// Drops every reservation.
    ///
    /// Lease records of other sessions are left in place; they no longer
    /// match the table and are treated as stale.
    pub fn clear_all(&self) -> Result<(), PersonaError> {
        self.store.delete(REGISTRY_KEY)?;
        tracing::info!("persona registry cleared");
        Ok(())
    }
}
