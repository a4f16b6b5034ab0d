//! Timer primitives for plugin scripts.
//!
//! One-shot and repeating timers that call back into the plugin's own Lua
//! state. Callbacks run on the plugin's worker thread between jobs: the
//! worker waits for its next job no longer than the earliest deadline
//! ([`TimerEntries::next_deadline`]) and then calls [`poll_timers`].
//!
//! # Usage in Lua
//!
//! ```lua
//! -- fires once after 1.5 seconds
//! local id = timer.after(1.5, function() log.info("once") end)
//!
//! -- fires every minute until cancelled
//! local tick = timer.every(60, function() server:say("#ops", "tick") end)
//! timer.cancel(tick)
//!
//! -- cancel everything this plugin started
//! timer.clear()
//! ```
//!
//! All durations are in seconds. A repeating interval must be positive.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mlua::prelude::*;

/// A single timer.
struct TimerEntry {
    /// Lua registry key for the callback function.
    callback_key: LuaRegistryKey,
    /// When the timer fires next.
    fire_at: Instant,
    /// Interval of a repeating timer.
    repeat_interval: Option<Duration>,
    cancelled: bool,
}

/// Timers of one plugin.
#[derive(Default)]
pub struct TimerEntries {
    entries: Vec<(u64, TimerEntry)>,
    next_id: u64,
}

impl std::fmt::Debug for TimerEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntries")
            .field("active_count", &self.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl TimerEntries {
    /// Number of active (not cancelled) timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(_, e)| !e.cancelled).count()
    }

    /// Whether no timer is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline among active timers.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.cancelled)
            .map(|(_, e)| e.fire_at)
            .min()
    }

    fn add(&mut self, callback_key: LuaRegistryKey, delay: Duration, repeat: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((
            id,
            TimerEntry {
                callback_key,
                fire_at: Instant::now() + delay,
                repeat_interval: repeat.then_some(delay),
                cancelled: false,
            },
        ));
        id
    }
}

/// Shared handle to a plugin's timers.
pub type TimerRegistry = Arc<Mutex<TimerEntries>>;

/// Create an empty registry.
#[must_use]
pub fn new_timer_registry() -> TimerRegistry {
    Arc::new(Mutex::new(TimerEntries::default()))
}

fn delay_from(function: &str, seconds: f64) -> LuaResult<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| LuaError::external(format!("{function}: invalid delay {seconds}: {e}")))
}

/// Register the global `timer` table.
///
/// - `timer.after(seconds, callback)` -> id (one-shot)
/// - `timer.every(seconds, callback)` -> id (repeating)
/// - `timer.cancel(id)` -> boolean
/// - `timer.clear()`
pub fn register(lua: &Lua, registry: TimerRegistry) -> Result<()> {
    let timer_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create timer table: {e}"))?;

    let reg = Arc::clone(&registry);
    let after_fn = lua
        .create_function(move |lua, (seconds, callback): (f64, LuaFunction)| {
            let delay = delay_from("timer.after", seconds)?;
            let callback_key = lua.create_registry_value(callback)?;
            let mut entries = reg.lock().expect("TimerEntries mutex poisoned");
            Ok(entries.add(callback_key, delay, false))
        })
        .map_err(|e| anyhow!("Failed to create timer.after function: {e}"))?;
    timer_table
        .set("after", after_fn)
        .map_err(|e| anyhow!("Failed to set timer.after: {e}"))?;

    let reg = Arc::clone(&registry);
    let every_fn = lua
        .create_function(move |lua, (seconds, callback): (f64, LuaFunction)| {
            let interval = delay_from("timer.every", seconds)?;
            if interval.is_zero() {
                return Err(LuaError::external("timer.every: interval must be positive"));
            }
            let callback_key = lua.create_registry_value(callback)?;
            let mut entries = reg.lock().expect("TimerEntries mutex poisoned");
            Ok(entries.add(callback_key, interval, true))
        })
        .map_err(|e| anyhow!("Failed to create timer.every function: {e}"))?;
    timer_table
        .set("every", every_fn)
        .map_err(|e| anyhow!("Failed to set timer.every: {e}"))?;

    let reg = Arc::clone(&registry);
    let cancel_fn = lua
        .create_function(move |_, timer_id: u64| {
            let mut entries = reg.lock().expect("TimerEntries mutex poisoned");
            for (id, entry) in &mut entries.entries {
                if *id == timer_id && !entry.cancelled {
                    entry.cancelled = true;
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .map_err(|e| anyhow!("Failed to create timer.cancel function: {e}"))?;
    timer_table
        .set("cancel", cancel_fn)
        .map_err(|e| anyhow!("Failed to set timer.cancel: {e}"))?;

    let reg = registry;
    let clear_fn = lua
        .create_function(move |_, ()| {
            let mut entries = reg.lock().expect("TimerEntries mutex poisoned");
            for (_, entry) in &mut entries.entries {
                entry.cancelled = true;
            }
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create timer.clear function: {e}"))?;
    timer_table
        .set("clear", clear_fn)
        .map_err(|e| anyhow!("Failed to set timer.clear: {e}"))?;

    lua.globals()
        .set("timer", timer_table)
        .map_err(|e| anyhow!("Failed to register timer table globally: {e}"))?;
    Ok(())
}

/// Fire every timer whose deadline has passed and drop finished ones.
///
/// Callbacks are collected under the lock and called after it is
/// released, so they may start or cancel timers themselves. Returns the
/// number of callbacks fired.
pub fn poll_timers(lua: &Lua, registry: &TimerRegistry) -> usize {
    let now = Instant::now();

    let fired: Vec<LuaFunction> = {
        let mut entries = registry.lock().expect("TimerEntries mutex poisoned");
        let mut fired = Vec::new();

        for (_, entry) in &mut entries.entries {
            if entry.cancelled || now < entry.fire_at {
                continue;
            }
            match lua.registry_value::<LuaFunction>(&entry.callback_key) {
                Ok(callback) => fired.push(callback),
                Err(e) => log::warn!("Timer callback lost: {e}"),
            }
            match entry.repeat_interval {
                Some(interval) => entry.fire_at = now + interval,
                None => entry.cancelled = true,
            }
        }

        remove_cancelled(lua, &mut entries);
        fired
    };

    for callback in &fired {
        if let Err(e) = callback.call::<()>(()) {
            log::warn!("Timer callback failed: {e}");
        }
    }
    fired.len()
}

/// Cancel and release every timer. Used when the plugin closes.
pub fn clear(lua: &Lua, registry: &TimerRegistry) {
    let mut entries = registry.lock().expect("TimerEntries mutex poisoned");
    for (_, entry) in &mut entries.entries {
        entry.cancelled = true;
    }
    remove_cancelled(lua, &mut entries);
}

fn remove_cancelled(lua: &Lua, entries: &mut TimerEntries) {
    let (active, done): (Vec<_>, Vec<_>) = std::mem::take(&mut entries.entries)
        .into_iter()
        .partition(|(_, e)| !e.cancelled);
    entries.entries = active;
    for (_, entry) in done {
        if let Err(e) = lua.remove_registry_value(entry.callback_key) {
            log::debug!("Failed to release timer callback: {e}");
        }
    }
}
