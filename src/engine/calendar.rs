use std::collections::BTreeMap;

use crate::model::{Day, DayRange};

/// Sparse per-day booked-unit counts for one space.
///
/// Days with no entry have nothing booked; entries that fall back to zero are
/// pruned, so storage grows with booked days only, never with the horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calendar {
    booked: BTreeMap<Day, u32>,
}

/// A rejected adjustment: the first day whose count would leave `[0, capacity]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overbooked {
    pub day: Day,
    /// The count the day would have ended up with.
    pub booked: i64,
}

impl Overbooked {
    pub fn is_underflow(&self) -> bool {
        self.booked < 0
    }
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn booked_on(&self, day: Day) -> u32 {
        self.booked.get(&day).copied().unwrap_or(0)
    }

    /// Remaining capacity for each day of `range`, in day order.
    /// Walks only the entries inside the range.
    pub fn remaining(&self, capacity: u32, range: DayRange) -> Vec<u32> {
        let mut out = Vec::with_capacity(range.days as usize);
        let mut entries = self.booked.range(range.start..range.end()).peekable();
        for day in range.iter() {
            let booked = match entries.peek() {
                Some((d, b)) if **d == day => {
                    let b = **b;
                    entries.next();
                    b
                }
                _ => 0,
            };
            out.push(capacity.saturating_sub(booked));
        }
        out
    }

    /// Add `delta` units to every day of `range`. All-or-nothing.
    pub fn adjust(&mut self, capacity: u32, range: DayRange, delta: i64) -> Result<(), Overbooked> {
        self.apply(capacity, &[(range, delta)])
    }

    /// Dry run of [`Calendar::apply`]: fails exactly when `apply` would.
    pub fn check(&self, capacity: u32, changes: &[(DayRange, i64)]) -> Result<(), Overbooked> {
        self.plan(capacity, changes).map(|_| ())
    }

    /// Apply several range deltas as one unit. Deltas are summed per day before
    /// any day is checked, so releasing one range and reserving an overlapping
    /// one is judged on the net effect. Nothing is written unless every touched
    /// day stays within `[0, capacity]`.
    pub fn apply(&mut self, capacity: u32, changes: &[(DayRange, i64)]) -> Result<(), Overbooked> {
        for (day, booked) in self.plan(capacity, changes)? {
            if booked == 0 {
                self.booked.remove(&day);
            } else {
                self.booked.insert(day, booked);
            }
        }
        Ok(())
    }

    fn plan(&self, capacity: u32, changes: &[(DayRange, i64)]) -> Result<Vec<(Day, u32)>, Overbooked> {
        let mut net: BTreeMap<Day, i64> = BTreeMap::new();
        for (range, delta) in changes {
            if *delta == 0 {
                continue;
            }
            for day in range.iter() {
                *net.entry(day).or_default() += delta;
            }
        }

        let mut next = Vec::with_capacity(net.len());
        for (day, delta) in net {
            if delta == 0 {
                continue;
            }
            let booked = i64::from(self.booked_on(day)) + delta;
            if booked < 0 || booked > i64::from(capacity) {
                return Err(Overbooked { day, booked });
            }
            next.push((day, booked as u32));
        }
        Ok(next)
    }

    /// Busiest day and its count, if anything is booked.
    pub fn peak(&self) -> Option<(Day, u32)> {
        self.booked
            .iter()
            .max_by_key(|(day, booked)| (**booked, std::cmp::Reverse(**day)))
            .map(|(day, booked)| (*day, *booked))
    }

    /// Number of days with a non-zero count.
    pub fn len(&self) -> usize {
        self.booked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.booked.is_empty()
    }
}
