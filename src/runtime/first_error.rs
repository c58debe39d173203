//! First-error latch shared by the workers of one connector invocation.

use parking_lot::Mutex;

/// Retains the first error observed by any of a set of concurrent workers.
/// Later observations are dropped, so the caller sees the earliest meaningful
/// failure rather than whichever worker happened to finish last.
#[derive(Debug, Default)]
pub struct FirstError {
    slot: Mutex<Option<anyhow::Error>>,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `err` if the slot is still empty.
    pub fn observe(&self, err: anyhow::Error) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Latch the error of `result`, if any.
    pub fn observe_result<T>(&self, result: anyhow::Result<T>) {
        if let Err(err) = result {
            self.observe(err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Remove and return the latched error. Called once all workers finished.
    pub fn take(&self) -> Option<anyhow::Error> {
        self.slot.lock().take()
    }

    /// Consume the latch into a `Result`, with `Ok(())` when nothing latched.
    pub fn into_result(self) -> anyhow::Result<()> {
        match self.slot.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_observation_wins() {
        let latch = FirstError::new();
        latch.observe(anyhow::anyhow!("one"));
        latch.observe(anyhow::anyhow!("two"));
        assert_eq!(latch.take().unwrap().to_string(), "one");
        assert!(latch.take().is_none());
    }

    #[test]
    fn ok_results_do_not_latch() {
        let latch = FirstError::new();
        latch.observe_result(Ok(()));
        assert!(!latch.is_set());
        latch.observe_result::<()>(Err(anyhow::anyhow!("boom")));
        assert!(latch.is_set());
    }

    #[test]
    fn concurrent_writers_latch_exactly_one() {
        let latch = Arc::new(FirstError::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let latch = Arc::clone(&latch);
                std::thread::spawn(move || latch.observe(anyhow::anyhow!("worker-{i}")))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let got = latch.take().unwrap().to_string();
        assert!(got.starts_with("worker-"), "unexpected value: {got}");
    }
}
