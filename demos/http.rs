use std::time::Duration;

use reqwest::Client;
use stampede::{
    JsonReporter, Reporter, RequestOptions, Run, RunConfig, Scenario, ScenarioResult, Stage,
    StdoutReporter, VuContext,
};
use tracing_subscriber::EnvFilter;

/// One iteration: ask the proxy for the `up` series, check it answered, wait a second.
async fn query(ctx: VuContext, client: Client, base_url: String) -> ScenarioResult {
    let res = ctx
        .http(&client)
        .get(
            format!("{base_url}/api/v1/query"),
            RequestOptions::default()
                .query("query", "up")
                .timeout(Duration::from_secs(10)),
        )
        .await?;
    ctx.check("status is 200", res.status == 200);
    ctx.sleep(Duration::from_secs(1));
    Ok(())
}

#[tokio::main]
async fn main() -> stampede::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:9090".into());
    // NEVER instantiate heavy things like clients inside the action
    // unless you want to kill performance
    let client = Client::new();

    let config = RunConfig::new(vec![
        // ramp up from 0 to 10 VUs over 30 seconds
        Stage::new(Duration::from_secs(30), 10),
        // hold
        Stage::new(Duration::from_secs(60), 10),
        // and back down
        Stage::new(Duration::from_secs(15), 0),
    ])
    .with_threshold("http_req_duration", "p(95)<500")
    .with_threshold("checks", "rate>0.99");

    let scenario = Scenario::builder()
        .name("prometheus query")
        .action(move |ctx: VuContext| query(ctx, client.clone(), base_url.clone()))
        .build();

    let run = Run::new(config, scenario);
    let verdict = run
        .execute_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::warn!("Ctrl-C received, stopping"),
                // no signal handler, let the schedule run out
                Err(_) => std::future::pending().await,
            }
        })
        .await?;

    StdoutReporter.report(&verdict).await?;
    if let Ok(path) = std::env::var("VERDICT_JSON") {
        JsonReporter::to_file(path).report(&verdict).await?;
    }
    std::process::exit(verdict.exit_code());
}
