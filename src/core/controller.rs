use crate::cell::{CellState, MemoryWrite, StepModes};
use crate::error::{Error, Result};
use crate::store::EpisodicStore;

/// Drives the epoch/trial schedule of store flushes and per-step modes.
///
/// The controller never owns the store; it is handed the store at the two
/// points where the schedule mutates it (epoch start and trial end).
#[derive(Debug, Clone)]
pub struct EpisodeController {
    hidden_dim: usize,
    initial_state: f32,
    retrieval_enabled: bool,
    epochs_started: u64,
}

/// Per-trial schedule: the reset state and which step writes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialPlan {
    pub initial: CellState,
    trial_length: usize,
    write_step: Option<usize>,
    retrieve: bool,
}

impl TrialPlan {
    pub fn modes_at(&self, t: usize) -> StepModes {
        StepModes {
            encode: self.write_step == Some(t),
            retrieve: self.retrieve,
        }
    }

    pub fn trial_length(&self) -> usize {
        self.trial_length
    }

    pub fn write_step(&self) -> Option<usize> {
        self.write_step
    }
}

impl EpisodeController {
    pub fn new(hidden_dim: usize, initial_state: f32) -> Self {
        Self {
            hidden_dim,
            initial_state,
            retrieval_enabled: true,
            epochs_started: 0,
        }
    }

    /// Flush the store and turn retrieval back on.
    pub fn begin_epoch(&mut self, store: &mut EpisodicStore) {
        store.reset();
        self.retrieval_enabled = true;
        self.epochs_started += 1;
    }

    /// Override the epoch's retrieval mode (e.g. for a no-memory control run).
    pub fn set_retrieval(&mut self, enabled: bool) {
        self.retrieval_enabled = enabled;
    }

    pub fn retrieval_enabled(&self) -> bool {
        self.retrieval_enabled
    }

    pub fn epochs_started(&self) -> u64 {
        self.epochs_started
    }

    /// Plan one trial. `write_step` is usually `Some(trial_length - 1)`;
    /// `None` means nothing is memorized.
    pub fn begin_trial(&self, trial_length: usize, write_step: Option<usize>) -> Result<TrialPlan> {
        if trial_length == 0 {
            return Err(Error::EmptyTrial);
        }
        if let Some(step) = write_step {
            if step >= trial_length {
                return Err(Error::WriteStep {
                    step,
                    len: trial_length,
                });
            }
        }
        Ok(TrialPlan {
            initial: CellState::filled(self.hidden_dim, self.initial_state),
            trial_length,
            write_step,
            retrieve: self.retrieval_enabled,
        })
    }

    /// Apply the trial's staged write once the trial is over, so it is only
    /// visible to later trials. Returns whether anything was stored.
    pub fn commit(&self, store: &mut EpisodicStore, write: Option<MemoryWrite>) -> Result<bool> {
        match write {
            Some(MemoryWrite { key, value }) => {
                store.insert(key, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Similarity, Weighting};

    fn store() -> EpisodicStore {
        EpisodicStore::new(4, 2, 3, Similarity::Cosine, Weighting::default()).unwrap()
    }

    #[test]
    fn begin_epoch_flushes_and_enables_retrieval() {
        let mut s = store();
        s.insert(vec![1.0, 0.0], vec![1.0, 2.0, 3.0]).unwrap();
        let mut ctl = EpisodeController::new(3, 0.0);
        ctl.set_retrieval(false);

        ctl.begin_epoch(&mut s);
        assert!(s.is_empty());
        assert!(ctl.retrieval_enabled());
        assert_eq!(ctl.epochs_started(), 1);
    }

    #[test]
    fn only_the_write_step_encodes() {
        let ctl = EpisodeController::new(3, 0.25);
        let plan = ctl.begin_trial(5, Some(4)).unwrap();
        assert_eq!(plan.initial, CellState::filled(3, 0.25));
        for t in 0..5 {
            let m = plan.modes_at(t);
            assert_eq!(m.encode, t == 4);
            assert!(m.retrieve);
        }

        let silent = ctl.begin_trial(5, None).unwrap();
        assert!((0..5).all(|t| !silent.modes_at(t).encode));
    }

    #[test]
    fn retrieval_override_reaches_every_step() {
        let mut ctl = EpisodeController::new(2, 0.0);
        ctl.set_retrieval(false);
        let plan = ctl.begin_trial(3, Some(2)).unwrap();
        assert!((0..3).all(|t| !plan.modes_at(t).retrieve));
    }

    #[test]
    fn rejects_write_outside_trial() {
        let ctl = EpisodeController::new(2, 0.0);
        assert_eq!(
            ctl.begin_trial(3, Some(3)),
            Err(Error::WriteStep { step: 3, len: 3 })
        );
        assert_eq!(ctl.begin_trial(0, None), Err(Error::EmptyTrial));
    }

    #[test]
    fn commit_inserts_staged_write() {
        let mut s = store();
        let ctl = EpisodeController::new(3, 0.0);
        assert!(!ctl.commit(&mut s, None).unwrap());
        let staged = MemoryWrite {
            key: vec![0.0, 1.0],
            value: vec![1.0, 1.0, 1.0],
        };
        assert!(ctl.commit(&mut s, Some(staged)).unwrap());
        assert_eq!(s.len(), 1);
    }
}
