//! Cooperative scheduler.
//!
//! Devices advance by a cycle budget derived from wall-clock nanoseconds and
//! their own clock frequency; timers fire at slice boundaries, strictly
//! after every device in that slice has run.

use std::collections::BTreeSet;

pub const NS_PER_SEC: u64 = 1_000_000_000;

pub type DeviceHandle = usize;
pub type TimerHandle = u64;

/// A schedulable peripheral or CPU. `execute` must advance by *at most*
/// `cycles` guest cycles and return the number actually run (a device may
/// stall and run fewer).
pub trait Device {
    fn clock_hz(&self) -> u64;
    fn execute(&mut self, cycles: u32) -> u32;
}

struct DeviceSlot {
    device: Box<dyn Device>,
    /// Wall-clock time this device has been advanced to, in nanoseconds
    /// since the scheduler's base time.
    current_time: u64,
}

/// One entry of the time-ordered timer set. Ordered by `expire`, tie-broken
/// by `handle` so two timers due at the same instant still form a strict
/// order (a requirement of `BTreeSet`).
#[derive(Clone)]
struct TimerEntry {
    expire: u64,
    handle: TimerHandle,
    period: u64,
    periodic: bool,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expire == other.expire && self.handle == other.handle
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.expire, self.handle).cmp(&(other.expire, other.handle))
    }
}

pub type TimerCallback = Box<dyn FnMut()>;

struct TimerSlot {
    callback: TimerCallback,
}

/// Orders devices and timers by a shared monotonic nanosecond time base and
/// drives per-device `execute(cycles)` calls by wall-clock slices. Single-threaded and cooperative: devices and timers must not call
/// [`Scheduler::tick`] reentrantly.
pub struct Scheduler {
    devices: Vec<DeviceSlot>,
    timers: BTreeSet<TimerEntry>,
    callbacks: std::collections::HashMap<TimerHandle, TimerSlot>,
    next_timer_handle: TimerHandle,
    base_time: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { devices: Vec::new(), timers: BTreeSet::new(), callbacks: std::collections::HashMap::new(), next_timer_handle: 0, base_time: 0 }
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) -> DeviceHandle {
        self.devices.push(DeviceSlot { device, current_time: self.base_time });
        self.devices.len() - 1
    }

    pub fn device_mut(&mut self, handle: DeviceHandle) -> &mut dyn Device {
        self.devices[handle].device.as_mut()
    }

    /// Schedules `callback` to run every `period_ns` nanoseconds, first
    /// firing at `base_time + period_ns`.
    pub fn add_timer(&mut self, period_ns: u64, callback: TimerCallback) -> TimerHandle {
        let handle = self.next_timer_handle;
        self.next_timer_handle += 1;
        self.callbacks.insert(handle, TimerSlot { callback });
        self.timers.insert(TimerEntry { expire: self.base_time + period_ns, handle, period: period_ns, periodic: true });
        handle
    }

    /// Like [`Self::add_timer`] but fires exactly once.
    pub fn add_oneshot_timer(&mut self, delay_ns: u64, callback: TimerCallback) -> TimerHandle {
        let handle = self.next_timer_handle;
        self.next_timer_handle += 1;
        self.callbacks.insert(handle, TimerSlot { callback });
        self.timers.insert(TimerEntry { expire: self.base_time + delay_ns, handle, period: 0, periodic: false });
        handle
    }

    /// Removes `handle` from the set and frees it immediately.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.timers.retain(|t| t.handle != handle);
        self.callbacks.remove(&handle);
    }

    pub fn base_time(&self) -> u64 {
        self.base_time
    }

    /// Advances the base time by `delta` nanoseconds in slices, each
    /// running until the next event: either `base_time + delta` or the
    /// earliest pending timer, whichever comes first.
    pub fn tick(&mut self, delta: u64) {
        let final_time = self.base_time + delta;
        while self.base_time < final_time {
            let mut target_time = final_time;
            if let Some(next_timer) = self.timers.iter().next() {
                if next_timer.expire < target_time {
                    target_time = next_timer.expire;
                }
            }

            for slot in &mut self.devices {
                let slice = target_time.saturating_sub(slot.current_time);
                let cycles_to_run = ((slice as u128 * slot.device.clock_hz() as u128) / NS_PER_SEC as u128) as u32;
                let ran = slot.device.execute(cycles_to_run);
                slot.current_time += ((ran as u64) * NS_PER_SEC) / slot.device.clock_hz().max(1);
            }

            self.base_time = target_time;

            loop {
                let Some(entry) = self.timers.iter().next().cloned() else { break };
                if entry.expire > self.base_time {
                    break;
                }
                self.timers.remove(&entry);
                if let Some(slot) = self.callbacks.get_mut(&entry.handle) {
                    (slot.callback)();
                }
                if entry.periodic {
                    self.timers.insert(TimerEntry { expire: entry.expire + entry.period, ..entry });
                } else {
                    self.callbacks.remove(&entry.handle);
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ClockDevice {
        hz: u64,
        ran_total: Rc<RefCell<u64>>,
    }

    impl Device for ClockDevice {
        fn clock_hz(&self) -> u64 {
            self.hz
        }
        fn execute(&mut self, cycles: u32) -> u32 {
            *self.ran_total.borrow_mut() += cycles as u64;
            cycles
        }
    }

    #[test]
    fn scheduler_fairness() {
        let mut sched = Scheduler::new();
        let ran_a = Rc::new(RefCell::new(0));
        let ran_b = Rc::new(RefCell::new(0));
        sched.add_device(Box::new(ClockDevice { hz: 200_000_000, ran_total: ran_a.clone() }));
        sched.add_device(Box::new(ClockDevice { hz: 25_000_000, ran_total: ran_b.clone() }));

        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        sched.add_oneshot_timer(500_000, Box::new(move || *fired2.borrow_mut() = true));

        sched.tick(1_000_000);

        assert_eq!(*ran_a.borrow(), 200_000);
        assert_eq!(*ran_b.borrow(), 25_000);
        assert!(*fired.borrow());
    }

    #[test]
    fn cancel_timer_does_not_fire() {
        let mut sched = Scheduler::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let handle = sched.add_oneshot_timer(500_000, Box::new(move || *fired2.borrow_mut() = true));
        sched.cancel_timer(handle);
        sched.tick(1_000_000);
        assert!(!*fired.borrow());
    }

    #[test]
    fn periodic_timer_refires() {
        let mut sched = Scheduler::new();
        let count = Rc::new(RefCell::new(0u32));
        let count2 = count.clone();
        sched.add_timer(100_000, Box::new(move || *count2.borrow_mut() += 1));
        sched.tick(1_000_000);
        assert_eq!(*count.borrow(), 10);
    }
}
