use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::process::Command;
use trek_core::nbd::constants::NBD_DEFAULT_PORT;
use trek_core::protocol::constants::SECTOR_SIZE;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Serve a zero-filled scratch image over NBD, no hardware needed
    Serve {
        /// Image path, created if missing
        #[arg(long, default_value = "target/scratch.img")]
        image: PathBuf,
        /// Image size in MiB
        #[arg(long, default_value_t = 32)]
        size_mb: u64,
        #[arg(long, default_value_t = NBD_DEFAULT_PORT)]
        port: u16,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Serve {
            image,
            size_mb,
            port,
        } => {
            if !image.exists() {
                let len = size_mb * 1024 * 1024;
                anyhow::ensure!(
                    len % SECTOR_SIZE as u64 == 0,
                    "image size must be a multiple of {} bytes",
                    SECTOR_SIZE
                );
                if let Some(parent) = image.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                File::create(image)?.set_len(len)?;
                println!("Created {} ({} MiB)", image.display(), size_mb);
            }
            println!("Serving {} on port {}...", image.display(), port);
            let image = image.to_string_lossy();
            let port = port.to_string();
            cargo(
                &[
                    "run", "-p", "trek-nbd", "--", "--file", &image, "--port", &port,
                ],
                "Serve",
            )?;
        }
    }

    Ok(())
}
