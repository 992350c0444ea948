// src/main.rs

use std::process::ExitCode;

use jobmon::{cli, config, logging, run};

#[tokio::main]
async fn main() -> ExitCode {
    match run_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("jobmon error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run_main() -> anyhow::Result<ExitCode> {
    let args = cli::parse();
    let cfg = config::load_or_default(&args.config)?;
    logging::init_logging(args.log_level, &cfg.log)?;
    Ok(run(args, cfg).await?)
}
