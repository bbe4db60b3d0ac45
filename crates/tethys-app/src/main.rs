#![forbid(unsafe_code)]
#![deny(unused_must_use, clippy::all, clippy::pedantic, clippy::nursery)]

//! Binary entrypoint that wires the Tethys services together and runs the
//! session engine until interrupted.

use tethys_app::{AppResult, run_app};

/// Bootstraps the session engine and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
