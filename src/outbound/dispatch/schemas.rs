use time::OffsetDateTime;

/// What happened to one task popped from a dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledged by the merchant, or resolved upstream.
    Delivered,

    /// Failed transiently and went back on its queue.
    Rescheduled {
        retry_count: u32,
        next_attempt_at: Option<OffsetDateTime>,
    },

    /// Parked on the dead-letter list.
    DeadLettered { retry_count: u32, reason: String },

    /// Not yet due, or queued behind such a task; pushed back untouched.
    Deferred,

    /// Lost because the store refused to take it back.
    Dropped { reason: String },
}

/// Per-batch tally of dispositions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub dropped: usize,
}

impl BatchReport {
    pub fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Delivered => self.delivered += 1,
            Disposition::Rescheduled { .. } => self.rescheduled += 1,
            Disposition::DeadLettered { .. } => self.dead_lettered += 1,
            Disposition::Deferred => self.deferred += 1,
            Disposition::Dropped { .. } => self.dropped += 1,
        }
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.delivered += other.delivered;
        self.rescheduled += other.rescheduled;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.dropped += other.dropped;
    }

    /// Tasks that were actually worked on. Deferred tasks do not count.
    pub fn attempted(&self) -> usize {
        self.delivered + self.rescheduled + self.dead_lettered + self.dropped
    }
}
