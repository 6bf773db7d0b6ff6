use clap::Parser;
use kvudd::cli::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI arguments
    let cmd = Command::parse();

    // Execute command
    kvudd::cli::execute_command(cmd).await?;

    Ok(())
}
