//! Per-request timing marks.

use std::fmt::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Accumulates named checkpoints for one request.
///
/// Clones share the same marks, so the trace survives the environment being
/// moved down the chain.
#[derive(Debug, Clone)]
pub struct Trace {
    start: Instant,
    marks: Arc<Mutex<Vec<(String, Duration)>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            marks: Arc::default(),
        }
    }

    /// Records `name` at the time elapsed since the request started.
    pub fn mark(&self, name: impl Into<String>) {
        let at = self.start.elapsed();
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), at));
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn marks(&self) -> Vec<(String, Duration)> {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `name: 1.25ms, other: 3.00ms`
    pub fn render(&self) -> String {
        let marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for (i, (name, at)) in marks.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{name}: {:.2}ms", at.as_secs_f64() * 1000.0);
        }
        out
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn marks_are_shared_between_clones() {
        let trace = Trace::new();
        let copy = trace.clone();
        tokio::time::advance(Duration::from_millis(2)).await;
        copy.mark("auth");
        tokio::time::advance(Duration::from_millis(3)).await;
        trace.mark("db");

        let marks = trace.marks();
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0], ("auth".to_owned(), Duration::from_millis(2)));
        assert_eq!(trace.render(), "auth: 2.00ms, db: 5.00ms");
    }
}
