use clap::Parser;
use jobq_cli::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    jobq_observability::init(cli.log_format);

    let mut stdout = std::io::stdout();
    if let Err(e) = jobq_cli::run(cli, &mut stdout).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
