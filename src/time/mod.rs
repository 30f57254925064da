//! Frozen time for tests
//!
//! [`TimeFreezer`] pins a host-side clock to a fixed instant and installs a
//! statement hook on one connection that rewrites `NOW()`, `CURRENT_DATE` and
//! the other time-producing SQL expressions into literals read from that same
//! clock. Test code asks [`TimeFreezer::now`] for the time; the database sees
//! the same instant.
//!
//! ```ignore
//! let _frozen = db.time().freeze("2017-01-01T00:00:00Z", FreezeOptions::default())?;
//! // every query on db's connection now sees 2017-01-01 00:00:00 UTC
//! ```
//!
//! The guard unfreezes on drop, on every exit path. Call
//! [`FreezeGuard::persist`] to keep time frozen until an explicit
//! [`TimeFreezer::unfreeze`].

pub mod rewrite;

use crate::connection::{HookId, HookRegistry, StatementHook, TestConnection};
use crate::error::{HarnessError, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

pub use rewrite::rewrite_time_functions;

/// Anything that names a point in time to freeze at
pub trait IntoFrozenInstant {
    fn into_instant(self) -> Result<DateTime<Utc>>;
}

impl<Tz: TimeZone> IntoFrozenInstant for DateTime<Tz> {
    fn into_instant(self) -> Result<DateTime<Utc>> {
        Ok(self.with_timezone(&Utc))
    }
}

/// Naive values are taken as UTC, not local time
impl IntoFrozenInstant for NaiveDateTime {
    fn into_instant(self) -> Result<DateTime<Utc>> {
        Ok(self.and_utc())
    }
}

impl IntoFrozenInstant for NaiveDate {
    fn into_instant(self) -> Result<DateTime<Utc>> {
        Ok(self.and_time(NaiveTime::MIN).and_utc())
    }
}

impl IntoFrozenInstant for &str {
    fn into_instant(self) -> Result<DateTime<Utc>> {
        parse_instant(self)
    }
}

impl IntoFrozenInstant for String {
    fn into_instant(self) -> Result<DateTime<Utc>> {
        parse_instant(&self)
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][±zz[:zz]]`, or a bare `YYYY-MM-DD`
fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f %#z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.into_instant();
    }

    Err(HarnessError::InvalidInstant(raw.to_string()))
}

/// Knobs for a freeze
#[derive(Debug, Clone, Copy)]
pub struct FreezeOptions {
    /// Let the clock run forward in real time from the frozen instant
    pub tick: bool,
    /// Advance the clock by this much every time it is read
    pub auto_tick: Option<Duration>,
    /// Session offset used to render `LOCALTIME` and `LOCALTIMESTAMP`
    pub local_offset: FixedOffset,
}

impl Default for FreezeOptions {
    fn default() -> Self {
        Self {
            tick: false,
            auto_tick: None,
            local_offset: Utc.fix(),
        }
    }
}

#[derive(Debug)]
struct ClockState {
    frozen_at: DateTime<Utc>,
    anchored: Instant,
    tick: bool,
    auto_tick: Option<Duration>,
}

/// The frozen host-side clock. Clones share state.
#[derive(Debug, Clone)]
pub struct FrozenClock {
    state: Arc<Mutex<ClockState>>,
}

impl FrozenClock {
    fn new(frozen_at: DateTime<Utc>, options: &FreezeOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                frozen_at,
                anchored: Instant::now(),
                tick: options.tick,
                auto_tick: options.auto_tick,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current frozen time
    pub fn now(&self) -> DateTime<Utc> {
        let mut state = self.lock();

        let mut now = state.frozen_at;
        if state.tick {
            now += Duration::from_std(state.anchored.elapsed()).unwrap_or_else(|_| Duration::zero());
        }
        if let Some(step) = state.auto_tick {
            state.frozen_at += step;
        }
        now
    }

    /// Move the clock forward (or back, with a negative delta)
    pub fn tick(&self, delta: Duration) {
        self.lock().frozen_at += delta;
    }

    /// Jump to a new instant
    pub fn move_to<W: IntoFrozenInstant>(&self, when: W) -> Result<()> {
        let instant = when.into_instant()?;
        let mut state = self.lock();
        state.frozen_at = instant;
        state.anchored = Instant::now();
        Ok(())
    }
}

/// Statement hook that reads the clock every time a statement goes out
struct FrozenTimeHook {
    clock: FrozenClock,
    local_offset: FixedOffset,
}

impl StatementHook for FrozenTimeHook {
    fn before_execute(&self, sql: &str) -> Option<String> {
        match rewrite_time_functions(sql, self.clock.now(), self.local_offset) {
            std::borrow::Cow::Owned(rewritten) => Some(rewritten),
            std::borrow::Cow::Borrowed(_) => None,
        }
    }
}

#[derive(Debug)]
struct ActiveFreeze {
    hook_id: HookId,
    clock: FrozenClock,
    generation: u64,
}

#[derive(Debug, Default)]
struct FreezeState {
    active: Option<ActiveFreeze>,
    generation: u64,
}

/// Freezes time on one connection
#[derive(Debug, Clone)]
pub struct TimeFreezer {
    hooks: HookRegistry,
    state: Arc<Mutex<FreezeState>>,
}

impl TimeFreezer {
    pub fn new(hooks: HookRegistry) -> Self {
        Self {
            hooks,
            state: Arc::new(Mutex::new(FreezeState::default())),
        }
    }

    pub fn for_connection(conn: &TestConnection) -> Self {
        Self::new(conn.hooks().clone())
    }

    fn lock(&self) -> MutexGuard<'_, FreezeState> {
        lock_state(&self.state)
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().active.is_some()
    }

    /// The active frozen clock, if any
    pub fn clock(&self) -> Option<FrozenClock> {
        self.lock().active.as_ref().map(|a| a.clock.clone())
    }

    /// Host-side current time: the frozen instant while frozen, the real clock otherwise
    pub fn now(&self) -> DateTime<Utc> {
        match self.clock() {
            Some(clock) => clock.now(),
            None => Utc::now(),
        }
    }

    /// Freeze time at `when`. A freeze already in place is lifted first, so
    /// at most one hook is ever installed.
    pub fn freeze<W: IntoFrozenInstant>(&self, when: W, options: FreezeOptions) -> Result<FreezeGuard> {
        let instant = when.into_instant()?;
        Ok(self.freeze_at(instant, options))
    }

    /// Freeze at the current real time
    pub fn freeze_now(&self, options: FreezeOptions) -> FreezeGuard {
        self.freeze_at(Utc::now(), options)
    }

    fn freeze_at(&self, instant: DateTime<Utc>, options: FreezeOptions) -> FreezeGuard {
        let mut state = self.lock();
        release(&mut state, &self.hooks, None);

        let clock = FrozenClock::new(instant, &options);
        let hook_id = self.hooks.listen(Arc::new(FrozenTimeHook {
            clock: clock.clone(),
            local_offset: options.local_offset,
        }));

        state.generation += 1;
        let generation = state.generation;
        state.active = Some(ActiveFreeze {
            hook_id,
            clock: clock.clone(),
            generation,
        });

        info!(%instant, "Time frozen");

        FreezeGuard {
            state: Arc::clone(&self.state),
            hooks: self.hooks.clone(),
            clock,
            generation,
            armed: true,
        }
    }

    /// Stop freezing time. Does nothing when time isn't frozen.
    pub fn unfreeze(&self) {
        let mut state = self.lock();
        release(&mut state, &self.hooks, None);
    }
}

fn lock_state(state: &Mutex<FreezeState>) -> MutexGuard<'_, FreezeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove the active freeze; with `only` set, only if it is that generation
fn release(state: &mut FreezeState, hooks: &HookRegistry, only: Option<u64>) {
    let matches = match (&state.active, only) {
        (Some(active), Some(generation)) => active.generation == generation,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if !matches {
        return;
    }
    if let Some(active) = state.active.take() {
        hooks.remove(active.hook_id);
        debug!(generation = active.generation, "Time unfrozen");
    }
}

/// Keeps time frozen while alive
#[must_use = "time unfreezes as soon as the guard is dropped; call persist() to keep it frozen"]
#[derive(Debug)]
pub struct FreezeGuard {
    state: Arc<Mutex<FreezeState>>,
    hooks: HookRegistry,
    clock: FrozenClock,
    generation: u64,
    armed: bool,
}

impl FreezeGuard {
    /// The clock this freeze controls; use it to tick or move time
    pub fn clock(&self) -> &FrozenClock {
        &self.clock
    }

    /// Keep time frozen after the guard goes away
    pub fn persist(mut self) {
        self.armed = false;
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if self.armed {
            // A later freeze superseded this one; leave it alone
            let mut state = lock_state(&self.state);
            release(&mut state, &self.hooks, Some(self.generation));
        }
    }
}
