//! Hierarchical timing wheel.
//!
//! Four levels of 255 slots at 10 ms precision, keyed by absolute
//! milliseconds. Buckets are append-only: a scheduled timer cannot be
//! withdrawn, consumers drop unwanted expirations on arrival. One wheel
//! exists per worker and is driven solely from the main tick loop.

/// Slots per level.
const WHEEL_SIZE: u64 = 255;
/// Tick precision in milliseconds.
const PRECISION_MS: i64 = 10;
const LEVELS: usize = 4;

struct Wheel<T> {
    slots: Vec<Vec<(u32, T)>>,
    head: usize,
}

impl<T> Wheel<T> {
    fn new() -> Self {
        Self {
            slots: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
            head: 0,
        }
    }

    fn take_front(&mut self) -> Vec<(u32, T)> {
        std::mem::take(&mut self.slots[self.head])
    }

    fn pop_front(&mut self) {
        self.head = (self.head + 1) % WHEEL_SIZE as usize;
    }

    /// True when the head has wrapped back to the first slot, i.e. this
    /// level just completed a full rotation.
    fn round(&self) -> bool {
        self.head == 0
    }
}

/// A timer context is stored together with the slot indices it was assigned
/// at every level, packed one byte per level: `[slot0][slot1][slot2][slot3]`.
/// Cascading a bucket from level n+1 re-files each entry at byte n.
pub struct TimingWheel<T> {
    wheels: Vec<Wheel<T>>,
    tick_debt: i64,
    prev: Option<i64>,
    len: usize,
}

impl<T> Default for TimingWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimingWheel<T> {
    pub fn new() -> Self {
        Self {
            wheels: (0..LEVELS).map(|_| Wheel::new()).collect(),
            tick_debt: 0,
            prev: None,
            len: 0,
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedules `ctx` to fire at absolute time `expire_at` (ms). Expirations
    /// in the past or below one tick are clamped to the next tick.
    pub fn add(&mut self, expire_at: i64, ctx: T) {
        let now = self.prev.unwrap_or(expire_at);
        let mut slot_count = ((expire_at - now + PRECISION_MS - 1) / PRECISION_MS).max(1) as u64;
        let mut slots: u32 = 0;
        for level in 0..LEVELS {
            slot_count += self.wheels[level].head as u64;
            let slot = ((slot_count - 1) % WHEEL_SIZE) as usize;
            slot_count -= slot as u64;
            slots |= (slot as u32) << (level * 8);
            if slot_count < WHEEL_SIZE || level == LEVELS - 1 {
                self.wheels[level].slots[slot].push((slots, ctx));
                self.len += 1;
                return;
            }
            slot_count /= WHEEL_SIZE;
        }
    }

    /// Advances the wheel to `now`, invoking `fire` for every expired
    /// context. Runs one tick per elapsed 10 ms since the previous call.
    pub fn update<F: FnMut(T)>(&mut self, now: i64, mut fire: F) {
        let prev = *self.prev.get_or_insert(now);
        self.tick_debt += now - prev;
        self.prev = Some(now);

        while self.tick_debt >= PRECISION_MS {
            self.tick_debt -= PRECISION_MS;

            let expired = self.wheels[0].take_front();
            self.wheels[0].pop_front();
            for (_, ctx) in expired {
                self.len -= 1;
                fire(ctx);
            }

            for level in 0..LEVELS - 1 {
                if !self.wheels[level].round() {
                    break;
                }
                let bucket = self.wheels[level + 1].take_front();
                for (slots, ctx) in bucket {
                    let slot = ((slots >> (level * 8)) & 0xFF) as usize;
                    self.wheels[level].slots[slot].push((slots, ctx));
                }
                self.wheels[level + 1].pop_front();
            }
        }
    }
}
