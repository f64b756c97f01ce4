use clap::Parser;
use codetap::{cli, config, logging, orchestrator};

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    // Config subcommands print and exit before any wrapping starts
    if cli::handle_config_command(&args) {
        return;
    }

    let mut config = config::Config::load();
    args.apply_to(&mut config);

    // Test mode logs to stderr; wrapped runs log to a file so the
    // passthrough streams stay clean
    let guard = logging::init(&config, config.mode() != config::Mode::Test);
    tracing::info!(version = config::VERSION, mode = ?config.mode(), "codetap starting");

    let orchestrator = orchestrator::Orchestrator::new(config);
    let code = orchestrator.run(args.forwarded.clone()).await;

    // Flush buffered log lines before the hard exit
    drop(guard);
    std::process::exit(code);
}
