//! The point where a run waits for the operator to publish the challenge record.

use async_trait::async_trait;
use eyre::WrapErr as _;
use tokio::io::{self, AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

use crate::request::ExpectedDnsRecord;

/// Blocks the run until the expected record has been published.
///
/// There is no timeout; the orchestrator races this against cancellation. Returning an error means
/// confirmation can never arrive (e.g. input was closed) and ends the run.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn confirm_published(&self, record: &ExpectedDnsRecord) -> eyre::Result<()>;
}

/// Prints the record and waits for Enter on stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

impl ConsolePrompt {
    fn instructions(record: &ExpectedDnsRecord) -> String {
        format!(
            "Add the following DNS record to your DNS provider:\n\
             Host: {}\n\
             Type: {}\n\
             Value: {}\n\
             Press Enter to continue after updating the DNS record...",
            record.host(),
            record.record_type(),
            record.value(),
        )
    }
}

#[async_trait]
impl Checkpoint for ConsolePrompt {
    async fn confirm_published(&self, record: &ExpectedDnsRecord) -> eyre::Result<()> {
        let mut stdout = io::stdout();
        stdout
            .write_all(Self::instructions(record).as_bytes())
            .await?;
        stdout.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(io::stdin())
            .read_line(&mut line)
            .await
            .wrap_err("reading operator confirmation")?;

        if read == 0 {
            eyre::bail!("stdin closed before the DNS record was confirmed");
        }

        Ok(())
    }
}

/// Logs the record and continues immediately.
///
/// For runs where something other than a human publishes the record before the run starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

#[async_trait]
impl Checkpoint for Unattended {
    async fn confirm_published(&self, record: &ExpectedDnsRecord) -> eyre::Result<()> {
        log::info!("expecting DNS record {record}, not waiting for confirmation");
        Ok(())
    }
}
