//! Rate-limited event reporting policy.
//!
//! Drop and overwrite events arrive in bursts; logging each one would flood
//! the log exactly when the system is least able to afford it. The policy
//! is to log the start of a streak, suppress repeats and log a summary when
//! the streak ends. It is kept free of I/O here so it can be tested
//! directly; the caller maps [`ReportAction`]s onto its logger.

/// What the caller should log for the event just recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReportAction {
    /// First event of a new streak: log it.
    StreakStarted,
    /// Event inside an ongoing streak: stay quiet.
    Suppressed,
    /// A streak of `n` events just ended: log the tally.
    StreakEnded { dropped: u64 },
    /// Normal delivery outside any streak.
    Quiet,
}

/// Tracks consecutive loss events for one channel or board.
#[derive(Clone, Debug, Default)]
pub struct StreakReporter {
    streak: u64,
    total: u64,
    streaks: u64,
}

impl StreakReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one loss event.
    pub fn record_loss(&mut self) -> ReportAction {
        self.streak += 1;
        self.total += 1;
        if self.streak == 1 {
            self.streaks += 1;
            ReportAction::StreakStarted
        } else {
            ReportAction::Suppressed
        }
    }

    /// Record a successful delivery, closing any open streak.
    pub fn record_delivery(&mut self) -> ReportAction {
        if self.streak > 0 {
            let dropped = self.streak;
            self.streak = 0;
            ReportAction::StreakEnded { dropped }
        } else {
            ReportAction::Quiet
        }
    }

    /// Total loss events recorded over the run.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of distinct streaks seen.
    pub fn streaks(&self) -> u64 {
        self.streaks
    }

    /// Length of the currently open streak, 0 if none.
    pub fn open_streak(&self) -> u64 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_loss_logs_then_suppresses() {
        let mut r = StreakReporter::new();
        assert_eq!(r.record_loss(), ReportAction::StreakStarted);
        assert_eq!(r.record_loss(), ReportAction::Suppressed);
        assert_eq!(r.record_loss(), ReportAction::Suppressed);
        assert_eq!(r.total(), 3);
    }

    #[test]
    fn delivery_closes_streak_with_tally() {
        let mut r = StreakReporter::new();
        assert_eq!(r.record_delivery(), ReportAction::Quiet);
        r.record_loss();
        r.record_loss();
        assert_eq!(r.record_delivery(), ReportAction::StreakEnded { dropped: 2 });
        assert_eq!(r.record_delivery(), ReportAction::Quiet);
        assert_eq!(r.open_streak(), 0);
    }

    #[test]
    fn streaks_are_counted_separately() {
        let mut r = StreakReporter::new();
        r.record_loss();
        r.record_delivery();
        r.record_loss();
        r.record_loss();
        r.record_delivery();
        assert_eq!(r.streaks(), 2);
        assert_eq!(r.total(), 3);
    }
}
