use crate::error::StatError;

/// Upper bound on slots (8 MiB of counts). Finer windows should raise the precision instead.
pub const MAX_SLOTS: usize = 1 << 20;

/// Fixed-capacity ring of per-interval counts with a movable write cursor.
/// The slot under the cursor is the "current" interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBuffer {
    data: Vec<u64>,
    cursor: usize,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Result<Self, StatError> {
        check_capacity(cap)?;
        Ok(Self { data: vec![0; cap], cursor: 0 })
    }

    /// Rebuild a buffer from persisted slots. The cursor must index one of them.
    pub fn from_parts(data: Vec<u64>, cursor: usize) -> Result<Self, StatError> {
        check_capacity(data.len())?;
        if cursor >= data.len() {
            return Err(StatError::InvalidConfig(format!(
                "cursor {} out of range for capacity {}", cursor, data.len()
            )));
        }
        Ok(Self { data, cursor })
    }

    pub fn capacity(&self) -> usize { self.data.len() }
    pub fn cursor(&self) -> usize { self.cursor }

    /// Any raw index is accepted; negative ones wrap from the end.
    #[allow(dead_code)]
    pub fn get(&self, i: i64) -> u64 {
        self.data[self.wrap(i)]
    }

    #[allow(dead_code)]
    pub fn set(&mut self, i: i64, val: u64) {
        let idx = self.wrap(i);
        self.data[idx] = val;
    }

    pub fn current(&self) -> u64 { self.data[self.cursor] }

    pub fn current_mut(&mut self) -> &mut u64 { &mut self.data[self.cursor] }

    /// Move the cursor one slot forward, wrapping. Returns the new cursor.
    pub fn advance(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.data.len();
        self.cursor
    }

    /// Slots in storage order (index 0 first).
    pub fn slots(&self) -> &[u64] { &self.data }

    /// Slots oldest first, ending with the current slot.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = u64> + '_ {
        let cap = self.data.len();
        (1..=cap).map(move |off| self.data[(self.cursor + off) % cap])
    }

    pub fn sum(&self) -> u64 {
        self.data.iter().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0);
        self.cursor = 0;
    }

    fn wrap(&self, i: i64) -> usize {
        i.rem_euclid(self.data.len() as i64) as usize
    }
}

pub fn check_capacity(cap: usize) -> Result<(), StatError> {
    if cap == 0 {
        return Err(StatError::InvalidConfig("ring buffer capacity must be at least 1".into()));
    }
    if cap > MAX_SLOTS {
        return Err(StatError::InvalidConfig(format!(
            "ring buffer capacity {} exceeds the limit of {} slots", cap, MAX_SLOTS
        )));
    }
    Ok(())
}
