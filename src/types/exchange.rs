use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchanges with a market-data client implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bybit,
    Binance,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Bybit, Exchange::Binance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Bybit => "bybit",
            Exchange::Binance => "binance",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Exchange::Bybit => "https://api.bybit.com",
            Exchange::Binance => "https://api.binance.com",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bybit" => Ok(Exchange::Bybit),
            "binance" => Ok(Exchange::Binance),
            other => Err(format!("unsupported exchange: {}", other)),
        }
    }
}
