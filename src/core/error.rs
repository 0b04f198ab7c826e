use thiserror::Error;

/// Errors surfaced by the agent, its store and the trainer.
///
/// None of these are retried internally: every operation is deterministic
/// given the parameters, so the caller decides what to do.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Rejected at construction time.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("{what} has dimension {got}, expected {expected}")]
    Dimension {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("write step {step} is outside a trial of {len} steps")]
    WriteStep { step: usize, len: usize },

    #[error("trial has no steps")]
    EmptyTrial,

    /// Loss went NaN/Inf; the optimizer step and staged write were skipped.
    #[error("non-finite loss {loss} at trial {trial}")]
    NonFinite { trial: usize, loss: f32 },
}

pub type Result<T> = core::result::Result<T, Error>;

/// Shorthand used by every dimension check in the crate.
pub(crate) fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::Dimension {
            what,
            expected,
            got,
        })
    }
}
