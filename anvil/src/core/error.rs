use thiserror::Error;

/// The terminal failure marker.
///
/// Diagnostics are issued once, at the deepest frame that knows the
/// context; after that only this marker propagates. The driver converts
/// it to a non-zero exit without printing anything further.
#[derive(Debug, Error)]
#[error("failed")]
pub struct Failed;

/// True if the error has already been reported to the shell.
pub fn reported(e: &anyhow::Error) -> bool {
    e.is::<Failed>()
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no rule to {action}")]
    NoRule { action: String },

    #[error("multiple rules matching {action}: `{rule1}` and `{rule2}`")]
    AmbiguousMatch {
        action: String,
        rule1: String,
        rule2: String,
    },

    #[error("variable `{name}` type conflict: declared `{existing}`, requested `{requested}`")]
    TypeConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("bootstrapped src_root `{bootstrapped}` does not match {what} `{other}`")]
    SrcRootMismatch {
        bootstrapped: String,
        what: &'static str,
        other: String,
    },

    #[error("out of project target `{target}`")]
    OutOfProject { target: String },

    #[error("different meta-operation implementations in a meta-operation batch")]
    MetaOpMismatch,

    #[error("different operation implementations in an operation batch")]
    OpMismatch,

    #[error("invalid path `{path}`")]
    InvalidPath { path: String },

    #[error("process `{program}` exited with {status}")]
    ProcessError { program: String, status: String },
}
