use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = manifest::cli::Cli::parse();

    if let Err(e) = manifest::cli::run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
