// One-shot batch entrypoint for external schedulers: generates and emails today's feed for every user.

use smalltalk_server::config::AppConfig;
use smalltalk_server::startup::{build_daily_task, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match AppConfig::from_env() { Ok(c) => c, Err(e) => { eprintln!("Configuration error: {}", e); std::process::exit(1);} };
    init_tracing(cfg.log_json);

    let task = build_daily_task(&cfg).await?;
    let report = task.run().await?;
    if report.failed > 0 {
        tracing::warn!(failed = report.failed, "some users were skipped");
    }
    Ok(())
}
