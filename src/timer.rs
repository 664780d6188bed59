use std::time::Instant;

/// Wall-clock timing for a whole pass or run, reported on stderr when the
/// `profiling` feature is enabled and silent otherwise.
pub struct PassTimer {
    #[allow(dead_code)]
    label: String,
    #[allow(dead_code)]
    start: Instant,
}

impl PassTimer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        if cfg!(feature = "profiling") {
            let elapsed = self.start.elapsed();
            eprintln!("  [timer] {}: {:.3}s", self.label, elapsed.as_secs_f64());
        }
    }
}
