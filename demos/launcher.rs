use launchq::prelude::*;
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> LaunchResult<()> {
    let config = LaunchConfig::development();
    launchq::logging::init(&config.logging);

    let runtime = LaunchRuntime::new(config)?;
    runtime.start().await?;

    let scheduler = runtime
        .create_scheduler(
            "plugins",
            Some(SchedulerConfig::default().with_mode(ExecutionMode::Mixed)),
        )
        .await?;

    for (name, priority) in [("clipboard", 9), ("calculator", 5), ("weather", 1)] {
        let task = Task::from_fn(|ctx| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ctx.payload)
        })
        .with_type("plugin.load")
        .with_priority(priority)
        .with_payload(json!({ "plugin": name }));
        scheduler.schedule(task).await?;
    }

    let flaky = Task::from_fn(|_| async { Err(LaunchError::failure("ECONNRESET while fetching index")) })
        .with_id("plugin-index")
        .with_max_retries(2);
    scheduler.schedule(flaky).await?;

    println!("🚀 Launcher running! Press Ctrl+C to stop...");
    runtime.wait_for_shutdown().await?;

    println!("🚀 Launcher stopped");
    Ok(())
}
