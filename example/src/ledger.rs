//! The cold path: cheap per-request bookkeeping.

pub struct Ledger {
    entries: Vec<(u64, u64)>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            entries: Vec::new(),
        }
    }

    /// Keep a bounded sample of recent results.
    pub fn record(&mut self, request: u64, digest: u64) {
        if digest % 64 == 0 {
            self.entries.push((request, digest));
            if self.entries.len() > 10_000 {
                self.entries.drain(..5_000);
            }
        }
    }

    pub fn entries(&self) -> usize {
        self.entries.len()
    }
}
