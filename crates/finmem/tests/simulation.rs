//! End-to-end simulation runs with deterministic services.

use std::sync::Arc;

use finmem::agents::test_support::CitingGenerator;
use finmem::agents::HashingEmbedder;
use finmem::memory::SqliteCheckpointStore;
use finmem::models::{FinmemConfig, MarketObservation, Tier, TradeAction};
use finmem::simulation::{read_observations, Simulation};
use finmem::{build_cycle_with, build_engine};

const DATA: &str = include_str!("../../../demos/observations.jsonl");

fn observations() -> Vec<MarketObservation> {
    read_observations(DATA.as_bytes()).unwrap()
}

fn simulation(config: &FinmemConfig, run_id: &str) -> Simulation {
    let cycle = build_cycle_with(
        config,
        Arc::new(CitingGenerator::new(TradeAction::Buy, "Trend and news support buying")),
        Arc::new(HashingEmbedder::new(config.embedding.dimensions)),
    )
    .unwrap();
    Simulation::new(&config.simulation, run_id, cycle, build_engine(config).unwrap())
}

#[tokio::test]
async fn full_run_reports_every_day_and_symbol() {
    let config = FinmemConfig::default();
    let mut sim = simulation(&config, "full");
    let summary = sim.run(observations()).await.unwrap();

    assert_eq!(summary.days.len(), 4);
    assert!(!summary.cancelled);
    assert_eq!(summary.resumed_from, None);
    for day in &summary.days {
        assert_eq!(day.reports.len(), 2);
    }

    // Both symbols fell every day, so always buying loses money.
    for symbol in ["AAPL", "MSFT"] {
        let tally = &summary.symbols[symbol];
        assert_eq!(tally.decisions, 4);
        assert_eq!(tally.buys, 4);
        assert_eq!(tally.failed, 0);
        assert!(tally.strategy.cumulative_return < 0.0);
        assert_eq!(tally.strategy, tally.buy_and_hold);
    }

    let engine = sim.engine();
    assert_eq!(engine.last_swept_day(), Some(3));
    assert!(engine
        .symbol("MSFT")
        .unwrap()
        .tier(Tier::Long)
        .records()
        .any(|r| r.text.contains("10-K")));
    assert!(engine.symbol("AAPL").unwrap().total_len() > 0);
}

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let config = FinmemConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("checkpoints.db");
    let db = db.to_str().unwrap();

    let first_two_days: Vec<MarketObservation> = observations()
        .into_iter()
        .filter(|o| o.date.to_string().as_str() <= "2024-01-03")
        .collect();
    let mut first = simulation(&config, "resume").with_checkpoints(SqliteCheckpointStore::open(db).unwrap());
    let partial = first.run(first_two_days).await.unwrap();
    assert_eq!(partial.days.len(), 2);
    drop(first);

    let mut second = simulation(&config, "resume").with_checkpoints(SqliteCheckpointStore::open(db).unwrap());
    assert_eq!(second.resume().unwrap(), Some(1));
    let resumed = second.run(observations()).await.unwrap();
    assert_eq!(resumed.resumed_from, Some(1));
    let days: Vec<u32> = resumed.days.iter().map(|d| d.day).collect();
    assert_eq!(days, vec![2, 3]);

    let mut uninterrupted = simulation(&config, "straight");
    uninterrupted.run(observations()).await.unwrap();
    assert_eq!(
        second.engine().snapshot().unwrap(),
        uninterrupted.engine().snapshot().unwrap()
    );

    let store = SqliteCheckpointStore::open(db).unwrap();
    assert_eq!(store.count("resume").unwrap(), 4);
}

#[tokio::test]
async fn resume_without_checkpoint_starts_fresh() {
    let config = FinmemConfig::default();
    let mut sim = simulation(&config, "fresh").with_checkpoints(SqliteCheckpointStore::open_in_memory().unwrap());
    assert_eq!(sim.resume().unwrap(), None);
    let summary = sim.run(observations()).await.unwrap();
    assert_eq!(summary.days.len(), 4);
}

#[tokio::test]
async fn resume_requires_a_store() {
    let config = FinmemConfig::default();
    let mut sim = simulation(&config, "nostore");
    assert!(sim.resume().is_err());
}

#[tokio::test]
async fn cancellation_stops_between_days() {
    let config = FinmemConfig::default();
    let mut sim = simulation(&config, "cancel");
    sim.cancel_token().cancel();
    let summary = sim.run(observations()).await.unwrap();
    assert!(summary.cancelled);
    assert!(summary.days.is_empty());
    assert_eq!(sim.engine().last_swept_day(), None);
}

#[tokio::test]
async fn symbol_filter_limits_the_run() {
    let mut config = FinmemConfig::default();
    config.simulation.symbols = vec!["MSFT".to_string()];
    let mut sim = simulation(&config, "filtered");
    let summary = sim.run(observations()).await.unwrap();
    assert_eq!(summary.symbols.len(), 1);
    assert!(summary.symbols.contains_key("MSFT"));
    assert!(sim.engine().symbol("AAPL").is_none());
}
