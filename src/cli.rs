use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devwatch")]
#[command(about = "Local development orchestrator - run, watch and restart backend services")]
pub struct Cli {
    /// Backend directory containing the services
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Services to run (defaults to every discovered service)
    pub services: Vec<String>,

    /// List discovered services and exit
    #[arg(long)]
    pub list: bool,
}
