//! `TXT` lookups used to observe challenge record propagation.
//!
//! Two interchangeable strategies implement [`TxtResolver`]:
//!
//! - [`HickoryResolver`] queries nameservers directly through a resolver library;
//! - [`DigResolver`] runs the `dig` command line tool.
//!
//! Neither caches. Every failure is reported as a [`TxtLookupError`] and the caller decides how to
//! treat it (the propagation loop treats all of them as "not visible yet").

use async_trait::async_trait;

mod dig;
mod hickory;

pub use self::{dig::DigResolver, hickory::HickoryResolver};

/// Failure to look up `TXT` records.
#[derive(Debug, thiserror::Error)]
pub enum TxtLookupError {
    /// The resolver reported an error (including NXDOMAIN and empty answers).
    #[error("TXT lookup for '{host}' failed: {message}")]
    Resolve { host: String, message: String },

    /// The lookup tool could not be run.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The lookup tool ran but reported failure.
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Resolves the `TXT` records published at a host name.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Returns one entry per `TXT` record, with the record's character-strings concatenated.
    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, TxtLookupError>;
}
