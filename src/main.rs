use clap::Parser;
use oasfuzz::cli::{self, Cli, CliError, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Fuzz(args) => cli::handle_fuzz(args).await.map(|_| ()),
        Command::Routes { spec, exclude } => cli::handle_routes(&spec, exclude.as_deref()),
        Command::Version => {
            cli::handle_version();
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(CliError::Usage(e)) => e.exit(),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
