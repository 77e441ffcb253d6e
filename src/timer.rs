//! Wall-clock accounting for the run's stages

use std::time::Instant;

/// Records named cuts; each stage's duration is the distance to the
/// previous cut
pub struct Timer {
    cuts: Vec<(String, Instant)>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            cuts: vec![(String::new(), Instant::now())],
        }
    }

    pub fn cut(&mut self, name: &str) {
        self.cuts.push((name.to_string(), Instant::now()));
    }

    /// Per-stage rows plus a TOTAL row, formatted for the run summary
    pub fn summary(&self) -> Vec<String> {
        let mut rows = Vec::new();
        for pair in self.cuts.windows(2) {
            let elapsed = pair[1].1.duration_since(pair[0].1);
            rows.push(format!("{}: {:.3}s", pair[1].0, elapsed.as_secs_f64()));
        }
        if let (Some(first), Some(last)) = (self.cuts.first(), self.cuts.last()) {
            let total = last.1.duration_since(first.1);
            rows.push(format!("TOTAL: {:.3}s", total.as_secs_f64()));
        }
        rows
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
