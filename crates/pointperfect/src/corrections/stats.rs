//! Fix quality statistics.

/// GGA fix quality names, indexed by quality indicator.
pub const QUALITIES: [&str; 9] = [
    "NOFIX", "GNSS", "DGNSS", "PPS", "FIXED", "FLOAT", "DR", "MAN", "SIM",
];

/// Running per-quality epoch counts, reported every `interval` epochs.
#[derive(Debug, Clone)]
pub struct FixStats {
    epochs: [u64; QUALITIES.len()],
    total: u64,
    interval: u64,
}

impl FixStats {
    pub fn new(interval: u32) -> Self {
        Self {
            epochs: [0; QUALITIES.len()],
            total: 0,
            interval: u64::from(interval.max(1)),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Count one epoch. Returns the summary line when a report is due.
    ///
    /// Qualities outside the known range are not counted.
    pub fn record(&mut self, quality: u8) -> Option<String> {
        let slot = self.epochs.get_mut(usize::from(quality))?;
        *slot += 1;
        self.total += 1;

        if self.total % self.interval == 0 {
            Some(self.summary())
        } else {
            None
        }
    }

    /// Percentages of every quality seen so far, e.g. `FIXED: 75.0%, FLOAT: 25.0%`.
    pub fn summary(&self) -> String {
        if self.total == 0 {
            return String::new();
        }
        QUALITIES
            .iter()
            .zip(self.epochs.iter())
            .filter(|&(_, &count)| count > 0)
            .map(|(name, &count)| {
                format!("{}: {:.1}%", name, count as f64 / self.total as f64 * 100.0)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
