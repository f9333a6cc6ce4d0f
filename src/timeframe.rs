// =============================================================================
// Timeframe resolver — label <-> duration <-> Bybit interval code
// =============================================================================

use std::str::FromStr;

use crate::error::FetchError;

/// Candle bucket duration. Variants are declared in ascending duration order
/// so that `Ord` sorts timeframes from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
}

impl Timeframe {
    /// Every recognised timeframe, ascending.
    pub const ALL: &'static [Timeframe] = &[
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H12,
        Self::D1,
        Self::W1,
    ];

    /// Bucket duration in seconds.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M3 => 180,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H2 => 7_200,
            Self::H4 => 14_400,
            Self::H6 => 21_600,
            Self::H12 => 43_200,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
        }
    }

    /// Bucket duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.duration_secs() * 1_000
    }

    /// The interval code the Bybit v5 kline endpoint expects: minutes as a
    /// bare number, "D" and "W" for daily and weekly.
    pub fn bybit_interval(&self) -> &'static str {
        match self {
            Self::M1 => "1",
            Self::M3 => "3",
            Self::M5 => "5",
            Self::M15 => "15",
            Self::M30 => "30",
            Self::H1 => "60",
            Self::H2 => "120",
            Self::H4 => "240",
            Self::H6 => "360",
            Self::H12 => "720",
            Self::D1 => "D",
            Self::W1 => "W",
        }
    }

    /// The human-facing label, e.g. "15m" or "1d".
    pub fn label(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }
}

impl FromStr for Timeframe {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "2h" => Ok(Self::H2),
            "4h" => Ok(Self::H4),
            "6h" => Ok(Self::H6),
            "12h" => Ok(Self::H12),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            other => Err(FetchError::UnknownTimeframe(other.to_string())),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
