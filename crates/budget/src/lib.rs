//! Shared memory accounting for cache-like components.
//!
//! A [`MemoryBudget`] tracks how many bytes each named component (the page
//! cache, the query cache, ...) currently holds, against a single global
//! limit. Components can account coarsely with [`track`]/[`release`] or per
//! item with [`track_with_priority`]/[`release_item`]; item tracking feeds
//! the eviction ordering that [`get_eviction_candidates`] hands back to the
//! owning component.
//!
//! Crossing the pressure threshold fires every registered [`on_pressure`]
//! callback exactly once; the latch re-arms when usage falls back below the
//! threshold.
//!
//! [`track`]: MemoryBudget::track
//! [`release`]: MemoryBudget::release
//! [`track_with_priority`]: MemoryBudget::track_with_priority
//! [`release_item`]: MemoryBudget::release_item
//! [`get_eviction_candidates`]: MemoryBudget::get_eviction_candidates
//! [`on_pressure`]: MemoryBudget::on_pressure

#[cfg(test)]
mod tests;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use common::BudgetOptions;
use hashbrown::HashMap;

/// Eviction priority of a tracked item. Lower sorts first when picking
/// eviction candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Cold,
    Warm,
    Hot,
}

/// Access counts at which an item is promoted one level.
const WARM_AFTER_ACCESSES: u32 = 3;
const HOT_AFTER_ACCESSES: u32 = 10;

type PressureCallback = dyn Fn(u64, u64) + Send + Sync;

#[derive(Debug)]
struct Item {
    size: u64,
    priority: Priority,
    access_count: u32,
    last_access: Instant,
}

#[derive(Default)]
struct Component {
    total: u64,
    items: HashMap<u64, Item>,
}

struct BudgetInner {
    limit: u64,
    pressure_threshold: f64,
    total: u64,
    components: HashMap<String, Component>,
    callbacks: Vec<Arc<PressureCallback>>,
    /// Set while usage sits at or above the threshold; cleared when it
    /// falls back below, re-arming the callbacks.
    pressure_latched: bool,
}

impl BudgetInner {
    fn component_mut(&mut self, name: &str) -> &mut Component {
        self.components.entry_ref(name).or_default()
    }

    fn threshold_bytes(&self) -> u64 {
        (self.limit as f64 * self.pressure_threshold) as u64
    }

    /// Called after usage grew. Returns the callbacks to fire (outside the
    /// lock) on a rising threshold transition.
    fn check_pressure(&mut self) -> Option<(Vec<Arc<PressureCallback>>, u64, u64)> {
        if self.total >= self.threshold_bytes() && !self.pressure_latched {
            self.pressure_latched = true;
            log::debug!(
                "memory budget under pressure: {} of {} bytes",
                self.total,
                self.limit
            );
            return Some((self.callbacks.clone(), self.total, self.limit));
        }
        None
    }

    /// Called after usage shrank; re-arms the pressure latch.
    fn check_relief(&mut self) {
        if self.total < self.threshold_bytes() {
            self.pressure_latched = false;
        }
    }
}

/// Process-wide byte accounting shared by named components.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<RwLock<BudgetInner>>,
}

impl MemoryBudget {
    pub fn new(opts: BudgetOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BudgetInner {
                limit: opts.limit,
                pressure_threshold: opts.pressure_threshold.clamp(0.0, 1.0),
                total: 0,
                components: HashMap::new(),
                callbacks: Vec::new(),
                pressure_latched: false,
            })),
        }
    }

    pub fn set_limit(&self, bytes: u64) {
        self.inner.write().unwrap().limit = bytes;
    }

    pub fn set_pressure_threshold(&self, fraction: f64) {
        self.inner.write().unwrap().pressure_threshold = fraction.clamp(0.0, 1.0);
    }

    pub fn register_component(&self, name: &str) {
        self.inner.write().unwrap().component_mut(name);
    }

    /// Registers a callback invoked with `(current_usage, limit)` on every
    /// rising transition across the pressure threshold. The callback runs
    /// after the budget's lock has been released, so it may call back into
    /// the budget.
    pub fn on_pressure<F>(&self, callback: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.inner.write().unwrap().callbacks.push(Arc::new(callback));
    }

    /// Coarse accounting: `component` now holds `bytes` more.
    pub fn track(&self, component: &str, bytes: u64) {
        let fired = {
            let mut inner = self.inner.write().unwrap();
            inner.component_mut(component).total += bytes;
            inner.total += bytes;
            inner.check_pressure()
        };
        fire(fired);
    }

    /// Coarse accounting: `component` gave `bytes` back.
    pub fn release(&self, component: &str, bytes: u64) {
        let mut inner = self.inner.write().unwrap();
        let comp = inner.component_mut(component);
        comp.total = comp.total.saturating_sub(bytes);
        inner.total = inner.total.saturating_sub(bytes);
        inner.check_relief();
    }

    /// Item-granular accounting; the item participates in eviction
    /// ordering. Re-tracking an existing key replaces its size.
    pub fn track_with_priority(&self, component: &str, key: u64, bytes: u64, priority: Priority) {
        let fired = {
            let mut inner = self.inner.write().unwrap();
            let comp = inner.component_mut(component);
            let old = comp.items.insert(
                key,
                Item {
                    size: bytes,
                    priority,
                    access_count: 0,
                    last_access: Instant::now(),
                },
            );
            let old_size = old.map_or(0, |i| i.size);
            comp.total = comp.total.saturating_sub(old_size) + bytes;
            inner.total = inner.total.saturating_sub(old_size) + bytes;
            if bytes >= old_size {
                inner.check_pressure()
            } else {
                inner.check_relief();
                None
            }
        };
        fire(fired);
    }

    /// Drops a tracked item and its bytes. Unknown keys are a no-op.
    pub fn release_item(&self, component: &str, key: u64) {
        let mut inner = self.inner.write().unwrap();
        let comp = inner.component_mut(component);
        if let Some(item) = comp.items.remove(&key) {
            comp.total = comp.total.saturating_sub(item.size);
            inner.total = inner.total.saturating_sub(item.size);
            inner.check_relief();
        }
    }

    /// Notes an access to `key`, promoting it Cold -> Warm after 3 accesses
    /// and Warm -> Hot after 10. Promotion is monotone; this never demotes.
    pub fn record_access(&self, component: &str, key: u64) {
        let mut inner = self.inner.write().unwrap();
        let comp = inner.component_mut(component);
        if let Some(item) = comp.items.get_mut(&key) {
            item.access_count += 1;
            item.last_access = Instant::now();
            if item.access_count >= HOT_AFTER_ACCESSES && item.priority == Priority::Warm {
                item.priority = Priority::Hot;
            } else if item.access_count >= WARM_AFTER_ACCESSES && item.priority == Priority::Cold {
                item.priority = Priority::Warm;
            }
        }
    }

    /// Demotes every item of `component` idle for longer than `max_age` by
    /// one level, flooring at Cold.
    pub fn decay_priorities(&self, component: &str, max_age: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let comp = inner.component_mut(component);
        for item in comp.items.values_mut() {
            if now.duration_since(item.last_access) > max_age {
                item.priority = match item.priority {
                    Priority::Hot => Priority::Warm,
                    Priority::Warm | Priority::Cold => Priority::Cold,
                };
            }
        }
    }

    /// Returns item keys ordered coldest-and-stalest first, cut off once
    /// their cumulative size reaches `bytes_needed` (all items if the
    /// component cannot cover the request).
    pub fn get_eviction_candidates(&self, component: &str, bytes_needed: u64) -> Vec<u64> {
        let inner = self.inner.read().unwrap();
        let Some(comp) = inner.components.get(component) else {
            return Vec::new();
        };

        let mut items: Vec<_> = comp
            .items
            .iter()
            .map(|(key, item)| (*key, item.priority, item.last_access, item.size))
            .collect();
        items.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        let mut candidates = Vec::new();
        let mut covered = 0u64;
        for (key, _, _, size) in items {
            if covered >= bytes_needed {
                break;
            }
            candidates.push(key);
            covered += size;
        }
        candidates
    }

    pub fn is_under_pressure(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.total >= inner.threshold_bytes()
    }

    pub fn is_exceeded(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.total > inner.limit
    }

    pub fn total_usage(&self) -> u64 {
        self.inner.read().unwrap().total
    }

    pub fn component_usage(&self, component: &str) -> u64 {
        self.inner
            .read()
            .unwrap()
            .components
            .get(component)
            .map_or(0, |c| c.total)
    }

    pub fn limit(&self) -> u64 {
        self.inner.read().unwrap().limit
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(BudgetOptions::default())
    }
}

fn fire(fired: Option<(Vec<Arc<PressureCallback>>, u64, u64)>) {
    if let Some((callbacks, usage, limit)) = fired {
        for cb in callbacks {
            cb(usage, limit);
        }
    }
}
