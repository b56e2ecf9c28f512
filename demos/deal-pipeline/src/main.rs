//! Deal pipeline example binary
//!
//! Runs a few deals through the pipeline on the file backend, including one
//! that stalls on a market outage and is recovered by the operator.
//!
//! Usage: `deal-pipeline [STATE_DIR]`

use deal_pipeline::{Deal, DealEvent, DealPlanner, SimulatedMarket, Stage};
use evtsm_fs::FileBackend;
use evtsm_runtime::{EngineConfig, EngineGroup, EngineStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Group = EngineGroup<FileBackend<Deal>, DealPlanner<SimulatedMarket>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deal_pipeline=info,evtsm_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    let prometheus = evtsm_runtime::metrics::install()?;

    let root = std::env::args()
        .nth(1)
        .map_or_else(|| std::env::temp_dir().join("deal-pipeline"), Into::into);
    println!("=== Deal Pipeline: state in {} ===\n", root.display());

    let market = Arc::new(SimulatedMarket::new(1 << 20));
    let group: Group = EngineGroup::new(
        FileBackend::open(&root).await?,
        DealPlanner::new(Arc::clone(&market)),
        EngineConfig::default().with_stop_timeout(Duration::from_secs(5)),
    );

    // Deals left over from a previous run are resumed on demand.
    for (key, deal) in group.list().await? {
        println!("Found {key} from a previous run in stage {:?}", deal.stage);
        if !deal.stage.is_final() {
            group.send(&key, DealEvent::Close).await?;
        }
    }

    let run = run_id();
    let happy = format!("deal-{run}-a");
    let oversized = format!("deal-{run}-b");
    let flaky = format!("deal-{run}-c");

    println!("\n>>> {happy}: proposal within limits");
    group.begin(&happy, Deal::default()).await?;
    group.send(&happy, propose("acme", 4096)).await?;
    wait_for_stage(&group, &happy, |s| *s == Stage::Active).await?;
    println!("{happy} is {:?}", group.get(&happy).await?.stage);

    println!("\n>>> {oversized}: proposal over the size limit");
    let engine = group.begin(&oversized, Deal::default()).await?;
    group.send(&oversized, propose("globex", 1 << 30)).await?;
    engine.closed().await;
    println!("{oversized} is {:?}", group.get(&oversized).await?.stage);

    println!("\n>>> {flaky}: market outage during publication");
    market.set_outage(true);
    let engine = group.begin(&flaky, Deal::default()).await?;
    group.send(&flaky, propose("initech", 2048)).await?;
    while engine.status() != EngineStatus::Stalled {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let report = group.health().await;
    println!("Health while stalled: {report}");

    market.set_outage(false);
    group.force_unlock(&flaky).await?;
    group.send(&flaky, DealEvent::Retry).await?;
    wait_for_stage(&group, &flaky, |s| *s == Stage::Active).await?;
    let deal = group.get(&flaky).await?;
    println!(
        "{flaky} is {:?} after {} publish attempts",
        deal.stage, deal.publish_attempts
    );

    println!("\n>>> Expiring {happy}");
    group.send(&happy, DealEvent::Expire).await?;
    wait_for_stage(&group, &happy, Stage::is_final).await?;

    println!("\nRunning engines: {:?}", group.running().await);
    group.shutdown().await?;

    println!("\nEngine counters:");
    prometheus
        .render()
        .lines()
        .filter(|line| line.starts_with("engine_") && line.contains("_total"))
        .for_each(|line| println!("  {line}"));
    println!("\n=== Pipeline Demonstration Complete ===");
    Ok(())
}

fn propose(client: &str, size: u64) -> DealEvent {
    DealEvent::Propose {
        client: client.to_string(),
        size,
    }
}

/// Distinguishes deals from separate runs sharing a state directory.
fn run_id() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

async fn wait_for_stage(
    group: &Group,
    key: &str,
    reached: impl Fn(&Stage) -> bool,
) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if reached(&group.get(key).await?.stage) {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("{key} did not reach the expected stage"))?
}
