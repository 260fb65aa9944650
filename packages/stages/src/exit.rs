//! Map worker outcomes to process exit status.
//!
//! ```text
//! 0  success
//! 1  stage failure (finalize, I/O, anything unclassified)
//! 2  configuration error
//! 3  connection error
//! 4  protocol error (regression, partition conflict/missing, corrupt state)
//! ```

use std::process::ExitCode;

use pipeline::{ErrorClass, PipelineError};
use tracing::{error, info};

/// Class of the first [`PipelineError`] in the error chain.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::class)
        .unwrap_or(ErrorClass::Stage)
}

/// Log the outcome and turn it into an exit code.
pub fn report(stage: &str, result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => {
            info!(stage, "exiting cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let class = classify(&e);
            error!(stage, class = %class, error = %format_args!("{e:#}"), "exiting");
            eprintln!("{stage}: {class}: {e:#}");
            ExitCode::from(class.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use pipeline::{ChannelError, WorkState};

    #[test]
    fn test_classify_through_context() {
        let err = Err::<(), _>(PipelineError::Regression {
            date: "2024-01-01".parse().unwrap(),
            current: WorkState::BatchesReady,
            requested: WorkState::Init,
        })
        .context("advancing state")
        .unwrap_err();

        assert_eq!(classify(&err), ErrorClass::Protocol);
    }

    #[test]
    fn test_classify_connection() {
        let err: anyhow::Error = PipelineError::Connection {
            attempts: 5,
            source: ChannelError::Connection("refused".into()),
        }
        .into();
        assert_eq!(classify(&err).exit_code(), 3);
    }

    #[test]
    fn test_unclassified_errors_are_stage_failures() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(classify(&err), ErrorClass::Stage);
    }
}
