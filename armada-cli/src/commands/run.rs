//! The `run` command: start a node in the foreground.

use crate::error::CliError;
use crate::runner::CliRunner;
use std::path::PathBuf;

pub async fn execute(dir: PathBuf, name: String) -> Result<(), CliError> {
    let runner = CliRunner::new(dir, name, true)?;

    println!("Armada node v{}", armada::VERSION);
    println!("State directory: {}", runner.state_dir().display());
    println!("Press Ctrl+C to stop");
    println!();

    let node = runner.start_node().await?;
    node.run_until_signal().await;
    Ok(())
}
