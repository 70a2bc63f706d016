use clap::Parser;
use posture_monitor_lib::{run, LaunchArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(LaunchArgs::parse()).await
}
