use clap::Parser;

use taskmill_worker::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    taskmill_observability::init(cli.log_format);

    let mut stdout = std::io::stdout();
    taskmill_worker::execute(cli, &mut stdout).await
}
