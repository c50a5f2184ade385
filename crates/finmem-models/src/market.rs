use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::memory::Day;

/// One symbol's raw market record for a single trading day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketObservation {
    pub date: NaiveDate,
    pub symbol: String,
    /// Closing price for the day.
    pub price: Decimal,
    #[serde(default)]
    pub news: Vec<String>,
    /// Quarterly report text, stored in the mid tier.
    #[serde(default)]
    pub quarterly_filing: Option<String>,
    /// Annual report text, stored in the long tier.
    #[serde(default)]
    pub annual_filing: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MomentumDirection {
    Positive,
    Negative,
    Flat,
}

/// Cumulative return over the trailing momentum window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Momentum {
    /// Number of day-over-day returns that were summed.
    pub window: usize,
    pub cumulative_return: f64,
}

impl Momentum {
    pub fn direction(&self) -> MomentumDirection {
        if self.cumulative_return > 0.0 {
            MomentumDirection::Positive
        } else if self.cumulative_return < 0.0 {
            MomentumDirection::Negative
        } else {
            MomentumDirection::Flat
        }
    }
}

/// Everything the decision cycle is given for one symbol on one day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayInput {
    pub day: Day,
    pub observation: MarketObservation,
    pub momentum: Option<Momentum>,
    /// Realised return from today's close to the next close. Only known when
    /// replaying history, and only shown to the agent in warmup mode.
    pub future_return: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn observation_from_minimal_json() {
        let json = r#"{"date": "2024-01-02", "symbol": "TSLA", "price": "248.42"}"#;
        let obs: MarketObservation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.symbol, "TSLA");
        assert_eq!(obs.price, dec!(248.42));
        assert!(obs.news.is_empty());
        assert!(obs.annual_filing.is_none());
    }

    #[test]
    fn momentum_direction() {
        let up = Momentum { window: 3, cumulative_return: 0.02 };
        let down = Momentum { window: 3, cumulative_return: -0.01 };
        let flat = Momentum { window: 3, cumulative_return: 0.0 };
        assert_eq!(up.direction(), MomentumDirection::Positive);
        assert_eq!(down.direction(), MomentumDirection::Negative);
        assert_eq!(flat.direction(), MomentumDirection::Flat);
    }
}
