//! `sandcastle redact`: Scrub secrets from stdin.

use sandcastle_security::redact_secrets;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::CmdResult;

pub async fn run() -> CmdResult {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(redact_secrets(&input).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
