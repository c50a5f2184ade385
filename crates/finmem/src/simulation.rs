use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;

use chrono::NaiveDate;
use finmem_agents::{DayOutcome, DecisionCycle};
use finmem_memory::{MemoryEngine, SqliteCheckpointStore};
use finmem_models::{
    Day, DayInput, MarketObservation, Momentum, RunMode, SimulationConfig, TradeAction,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SimulationError;

/// All observations sharing one date, ordered by symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingDay {
    pub date: NaiveDate,
    pub observations: Vec<MarketObservation>,
}

/// Read one JSON-encoded `MarketObservation` per line. Blank lines are
/// skipped.
pub fn read_observations<R: BufRead>(reader: R) -> Result<Vec<MarketObservation>, SimulationError> {
    let mut observations = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let observation = serde_json::from_str(&line)
            .map_err(|source| SimulationError::Observation {
                line: idx + 1,
                source,
            })?;
        observations.push(observation);
    }
    Ok(observations)
}

pub fn load_observations(path: impl AsRef<Path>) -> Result<Vec<MarketObservation>, SimulationError> {
    let file = File::open(path.as_ref())?;
    read_observations(BufReader::new(file))
}

/// Group observations into trading days in date order. When `symbols` is
/// non-empty, other symbols are dropped. Dates left with no observations are
/// not trading days.
pub fn group_into_days(
    observations: Vec<MarketObservation>,
    symbols: &[String],
) -> Result<Vec<TradingDay>, SimulationError> {
    let mut by_date: BTreeMap<NaiveDate, BTreeMap<String, MarketObservation>> = BTreeMap::new();
    for observation in observations {
        if !symbols.is_empty() && !symbols.contains(&observation.symbol) {
            continue;
        }
        let day = by_date.entry(observation.date).or_default();
        if day.contains_key(&observation.symbol) {
            return Err(SimulationError::Data(format!(
                "duplicate observation for {} on {}",
                observation.symbol, observation.date
            )));
        }
        day.insert(observation.symbol.clone(), observation);
    }

    Ok(by_date
        .into_iter()
        .map(|(date, observations)| TradingDay {
            date,
            observations: observations.into_values().collect(),
        })
        .collect())
}

fn simple_return(from: Decimal, to: Decimal) -> Option<f64> {
    if from.is_zero() {
        return None;
    }
    ((to - from) / from).to_f64()
}

/// Turn trading days into per-day cycle inputs.
///
/// Momentum sums up to `window` of the symbol's most recent day-over-day
/// returns, ending today; it is `None` until the symbol has a previous close
/// or when `window` is zero. The realised return runs from today's close to
/// the symbol's next observed close.
pub fn build_inputs(days: &[TradingDay], window: usize) -> Result<Vec<Vec<DayInput>>, SimulationError> {
    let mut series: HashMap<&str, Vec<(usize, &MarketObservation)>> = HashMap::new();
    for (day_idx, day) in days.iter().enumerate() {
        for observation in &day.observations {
            series
                .entry(observation.symbol.as_str())
                .or_default()
                .push((day_idx, observation));
        }
    }

    let mut inputs: Vec<Vec<DayInput>> = vec![Vec::new(); days.len()];
    for points in series.values() {
        let returns: Vec<Option<f64>> = points
            .windows(2)
            .map(|pair| simple_return(pair[0].1.price, pair[1].1.price))
            .collect();

        for (pos, (day_idx, observation)) in points.iter().enumerate() {
            let available = pos.min(window);
            let momentum = (available > 0)
                .then(|| {
                    returns[pos - available..pos]
                        .iter()
                        .copied()
                        .sum::<Option<f64>>()
                        .map(|cumulative_return| Momentum {
                            window: available,
                            cumulative_return,
                        })
                })
                .flatten();
            let day = Day::try_from(*day_idx)
                .map_err(|_| SimulationError::Data(format!("too many trading days: {day_idx}")))?;

            inputs[*day_idx].push(DayInput {
                day,
                observation: (*observation).clone(),
                momentum,
                future_return: returns.get(pos).copied().flatten(),
            });
        }
    }

    for day in &mut inputs {
        day.sort_by(|a, b| a.observation.symbol.cmp(&b.observation.symbol));
    }
    Ok(inputs)
}

/// Trading days per year, used to annualise volatility and the Sharpe ratio.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Statistics over a series of daily log returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReturnMetrics {
    /// Sum of the daily log returns.
    pub cumulative_return: f64,
    /// Mean over standard deviation, annualised. Zero for a flat series.
    pub sharpe_ratio: f64,
    /// Largest fall of the compounded equity curve from a running peak, as a
    /// fraction of that peak.
    pub max_drawdown: f64,
    /// Annualised population standard deviation of the daily log returns.
    pub volatility: f64,
}

impl ReturnMetrics {
    pub fn from_log_returns(returns: &[f64]) -> Self {
        if returns.is_empty() {
            return Self::default();
        }
        let n = returns.len() as f64;
        let cumulative_return: f64 = returns.iter().sum();
        let mean = cumulative_return / n;
        let std_dev = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();
        let annualise = TRADING_DAYS_PER_YEAR.sqrt();
        let sharpe_ratio = if std_dev > f64::EPSILON {
            mean / std_dev * annualise
        } else {
            0.0
        };

        // Equity and peak are tracked in log space, starting from 1.0.
        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for r in returns {
            equity += r;
            peak = peak.max(equity);
            max_drawdown = max_drawdown.max(1.0 - (equity - peak).exp());
        }

        Self {
            cumulative_return,
            sharpe_ratio,
            max_drawdown,
            volatility: std_dev * annualise,
        }
    }
}

/// Per-symbol tally of a run.
///
/// Each day with a known next close contributes the reward
/// `direction * ln(next / close)`, where buy, hold and sell have directions
/// 1, 0 and -1. `buy_and_hold` scores the same days with direction 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SymbolSummary {
    pub decisions: usize,
    pub buys: usize,
    pub sells: usize,
    pub holds: usize,
    pub failed: usize,
    pub strategy: ReturnMetrics,
    pub buy_and_hold: ReturnMetrics,
    #[serde(skip)]
    rewards: Vec<f64>,
    #[serde(skip)]
    market: Vec<f64>,
}

impl SymbolSummary {
    fn record_return(&mut self, action: TradeAction, realised: f64) {
        let market = realised.ln_1p();
        self.rewards.push(f64::from(action.direction()) * market);
        self.market.push(market);
        self.strategy = ReturnMetrics::from_log_returns(&self.rewards);
        self.buy_and_hold = ReturnMetrics::from_log_returns(&self.market);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    /// Last day restored from a checkpoint before this run started.
    pub resumed_from: Option<Day>,
    pub cancelled: bool,
    pub days: Vec<DayOutcome>,
    pub symbols: BTreeMap<String, SymbolSummary>,
}

impl RunSummary {
    fn new(run_id: &str, mode: RunMode, resumed_from: Option<Day>) -> Self {
        Self {
            run_id: run_id.to_string(),
            mode,
            resumed_from,
            cancelled: false,
            days: Vec::new(),
            symbols: BTreeMap::new(),
        }
    }

    fn record(&mut self, outcome: DayOutcome) {
        for report in &outcome.reports {
            let entry = self.symbols.entry(report.symbol.clone()).or_default();
            entry.decisions += 1;
            if report.decision.is_failed() {
                entry.failed += 1;
            }
            match report.decision.action {
                TradeAction::Buy => entry.buys += 1,
                TradeAction::Sell => entry.sells += 1,
                TradeAction::Hold => entry.holds += 1,
            }
            if let Some(ret) = report.realised_return {
                entry.record_return(report.decision.action, ret);
            }
        }
        self.days.push(outcome);
    }
}

/// Replays market history through the decision cycle, one trading day at a
/// time, checkpointing the memory engine after every sweep.
pub struct Simulation {
    run_id: String,
    mode: RunMode,
    window: usize,
    symbols: Vec<String>,
    cycle: DecisionCycle,
    engine: MemoryEngine,
    checkpoints: Option<SqliteCheckpointStore>,
    resumed_from: Option<Day>,
    cancel: CancellationToken,
}

impl Simulation {
    pub fn new(
        config: &SimulationConfig,
        run_id: impl Into<String>,
        cycle: DecisionCycle,
        engine: MemoryEngine,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            mode: config.mode,
            window: config.momentum_window_size,
            symbols: config.symbols.clone(),
            cycle,
            engine,
            checkpoints: None,
            resumed_from: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_checkpoints(mut self, store: SqliteCheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Returns a CancellationToken that stops the run between days.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn engine(&self) -> &MemoryEngine {
        &self.engine
    }

    /// Restore the engine from this run's latest checkpoint, if any. Days up
    /// to and including the restored day are skipped by [`Simulation::run`].
    pub fn resume(&mut self) -> Result<Option<Day>, SimulationError> {
        let Some(store) = &self.checkpoints else {
            return Err(SimulationError::Data(
                "resume requested without a checkpoint store".to_string(),
            ));
        };
        let Some((day, blob)) = store.latest(&self.run_id)? else {
            info!(run_id = %self.run_id, "No checkpoint found, starting fresh");
            return Ok(None);
        };
        self.engine.restore(&blob)?;
        self.resumed_from = Some(day);
        info!(run_id = %self.run_id, day, "Resumed from checkpoint");
        Ok(Some(day))
    }

    /// Run every remaining trading day in `observations`.
    pub async fn run(
        &mut self,
        observations: Vec<MarketObservation>,
    ) -> Result<RunSummary, SimulationError> {
        let start = Instant::now();
        let days = group_into_days(observations, &self.symbols)?;
        let inputs = build_inputs(&days, self.window)?;
        let already_swept = self.engine.last_swept_day();
        let mut summary = RunSummary::new(&self.run_id, self.mode, self.resumed_from);

        info!(
            run_id = %self.run_id,
            mode = ?self.mode,
            trading_days = days.len(),
            "Simulation starting"
        );

        for (day_inputs, trading_day) in inputs.into_iter().zip(&days) {
            let Some(day) = day_inputs.first().map(|input| input.day) else {
                continue;
            };
            if already_swept.is_some_and(|last| day <= last) {
                debug!(day, "Already swept, skipping");
                continue;
            }
            if self.cancel.is_cancelled() {
                info!(day, "Simulation cancelled");
                summary.cancelled = true;
                break;
            }

            debug!(day, date = %trading_day.date, symbols = day_inputs.len(), "Running day");
            let outcome = self.cycle.run_day(&mut self.engine, day, day_inputs).await?;
            if let Some(store) = &self.checkpoints {
                store.save(&self.run_id, day, &self.engine.snapshot()?)?;
            }
            summary.record(outcome);
        }

        info!(
            run_id = %self.run_id,
            days_run = summary.days.len(),
            cancelled = summary.cancelled,
            elapsed_ms = start.elapsed().as_millis(),
            "Simulation finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finmem_memory::SweepReport;
    use finmem_models::{DayReport, Decision, DecisionStatus, ReflectionOutcome};
    use rust_decimal_macros::dec;

    fn obs(date: &str, symbol: &str, price: Decimal) -> MarketObservation {
        MarketObservation {
            date: date.parse().unwrap(),
            symbol: symbol.to_string(),
            price,
            news: vec![],
            quarterly_filing: None,
            annual_filing: None,
        }
    }

    #[test]
    fn reads_json_lines() {
        let data = concat!(
            r#"{"date": "2024-01-02", "symbol": "AAPL", "price": "185.64", "news": ["Services record"]}"#,
            "\n\n",
            r#"{"date": "2024-01-03", "symbol": "AAPL", "price": "184.25"}"#,
            "\n",
        );
        let observations = read_observations(data.as_bytes()).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].news, vec!["Services record"]);
        assert!(observations[1].news.is_empty());
    }

    #[test]
    fn bad_line_reports_line_number() {
        let data = "{\"date\": \"2024-01-02\", \"symbol\": \"AAPL\", \"price\": \"1\"}\nnot json\n";
        let err = read_observations(data.as_bytes()).unwrap_err();
        assert!(matches!(err, SimulationError::Observation { line: 2, .. }));
    }

    #[test]
    fn groups_by_date_and_filters_symbols() {
        let days = group_into_days(
            vec![
                obs("2024-01-03", "MSFT", dec!(370.60)),
                obs("2024-01-02", "MSFT", dec!(370.87)),
                obs("2024-01-02", "AAPL", dec!(185.64)),
                obs("2024-01-04", "TSLA", dec!(237.93)),
            ],
            &["AAPL".to_string(), "MSFT".to_string()],
        )
        .unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].observations[0].symbol, "AAPL");
        assert_eq!(days[0].observations[1].symbol, "MSFT");
    }

    #[test]
    fn duplicate_observation_is_rejected() {
        let err = group_into_days(
            vec![
                obs("2024-01-02", "AAPL", dec!(185.64)),
                obs("2024-01-02", "AAPL", dec!(185.00)),
            ],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, SimulationError::Data(_)));
    }

    #[test]
    fn momentum_and_future_returns() {
        let days = group_into_days(
            vec![
                obs("2024-01-02", "AAPL", dec!(100)),
                obs("2024-01-03", "AAPL", dec!(110)),
                obs("2024-01-04", "AAPL", dec!(99)),
                obs("2024-01-05", "AAPL", dec!(99)),
            ],
            &[],
        )
        .unwrap();
        let inputs = build_inputs(&days, 2).unwrap();

        assert_eq!(inputs[0][0].momentum, None);
        assert!((inputs[0][0].future_return.unwrap() - 0.10).abs() < 1e-12);

        let day1 = inputs[1][0].momentum.unwrap();
        assert_eq!(day1.window, 1);
        assert!((day1.cumulative_return - 0.10).abs() < 1e-12);

        let day2 = inputs[2][0].momentum.unwrap();
        assert_eq!(day2.window, 2);
        assert!((day2.cumulative_return - 0.0).abs() < 1e-12);

        let day3 = inputs[3][0].momentum.unwrap();
        assert_eq!(day3.window, 2);
        assert!((day3.cumulative_return + 0.10).abs() < 1e-12);
        assert_eq!(inputs[3][0].future_return, None);
        assert_eq!(inputs[3][0].day, 3);
    }

    #[test]
    fn sparse_symbol_uses_its_own_next_close() {
        let days = group_into_days(
            vec![
                obs("2024-01-02", "AAPL", dec!(100)),
                obs("2024-01-02", "MSFT", dec!(200)),
                obs("2024-01-03", "MSFT", dec!(210)),
                obs("2024-01-04", "AAPL", dec!(105)),
            ],
            &[],
        )
        .unwrap();
        let inputs = build_inputs(&days, 3).unwrap();
        assert_eq!(inputs[1].len(), 1);
        assert!((inputs[0][0].future_return.unwrap() - 0.05).abs() < 1e-12);
        assert_eq!(inputs[2][0].day, 2);
    }

    #[test]
    fn zero_window_disables_momentum() {
        let days = group_into_days(
            vec![
                obs("2024-01-02", "AAPL", dec!(100)),
                obs("2024-01-03", "AAPL", dec!(101)),
            ],
            &[],
        )
        .unwrap();
        let inputs = build_inputs(&days, 0).unwrap();
        assert_eq!(inputs[1][0].momentum, None);
    }

    #[test]
    fn return_metrics_from_hand_computed_series() {
        let metrics = ReturnMetrics::from_log_returns(&[0.02, -0.01, 0.02, -0.01]);
        // Mean 0.005 and population deviation 0.015.
        assert!((metrics.cumulative_return - 0.02).abs() < 1e-12);
        assert!((metrics.volatility - 0.015 * 252f64.sqrt()).abs() < 1e-12);
        assert!((metrics.sharpe_ratio - 252f64.sqrt() / 3.0).abs() < 1e-9);
        // Equity peaks at e^0.03 and falls back to e^0.02.
        assert!((metrics.max_drawdown - (1.0 - (-0.01f64).exp())).abs() < 1e-12);

        let flat = ReturnMetrics::from_log_returns(&[0.0, 0.0]);
        assert_eq!(flat, ReturnMetrics::default());
        assert_eq!(ReturnMetrics::from_log_returns(&[]), ReturnMetrics::default());
    }

    #[test]
    fn summary_scores_actions_against_buy_and_hold() {
        // Closes 100 -> 110 -> 99 -> 99, traded buy, sell, hold.
        let steps = [(TradeAction::Buy, 0.10), (TradeAction::Sell, -0.10), (TradeAction::Hold, 0.0)];
        let mut summary = RunSummary::new("metrics", RunMode::Test, None);
        for (day, (action, realised)) in steps.into_iter().enumerate() {
            let day = day as Day;
            let mut decision = Decision::failed("AAPL", day, "placeholder");
            decision.action = action;
            decision.status = DecisionStatus::Validated;
            summary.record(DayOutcome {
                day,
                reports: vec![DayReport {
                    symbol: "AAPL".to_string(),
                    day,
                    date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                    decision,
                    cited_memory_ids: BTreeMap::new(),
                    memories_added: 0,
                    reflection: ReflectionOutcome::NotScheduled,
                    realised_return: Some(realised),
                }],
                sweep: SweepReport::default(),
            });
        }

        let tally = &summary.symbols["AAPL"];
        assert_eq!((tally.buys, tally.sells, tally.holds), (1, 1, 1));
        // ln(1.1) - ln(0.9) for the strategy, ln(1.1 * 0.9) for the baseline.
        let expected = 1.1f64.ln() - 0.9f64.ln();
        assert!((tally.strategy.cumulative_return - expected).abs() < 1e-12);
        assert_eq!(tally.strategy.max_drawdown, 0.0);
        assert!((tally.buy_and_hold.cumulative_return - 0.99f64.ln()).abs() < 1e-12);
        // Baseline peaks at 110 and bottoms at 99.
        assert!((tally.buy_and_hold.max_drawdown - 0.1).abs() < 1e-12);
        assert!(tally.strategy.sharpe_ratio > tally.buy_and_hold.sharpe_ratio);
    }
}
