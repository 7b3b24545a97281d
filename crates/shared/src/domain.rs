use serde::{Deserialize, Serialize};

/// Capacity of the reference deployment.
pub const DEFAULT_MAX_CAPACITY: u64 = 250;

/// Largest amount a single increment or decrement may carry.
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// Amount applied when a mutation request omits one.
pub const DEFAULT_AMOUNT: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn past_tense(self) -> &'static str {
        match self {
            Direction::Increase => "Increased",
            Direction::Decrease => "Decreased",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityClassification {
    Normal,
    Warning,
    Critical,
}

impl CapacityClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            CapacityClassification::Normal => "normal",
            CapacityClassification::Warning => "warning",
            CapacityClassification::Critical => "critical",
        }
    }
}

impl std::fmt::Display for CapacityClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed display threshold the count is measured against. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    max: u64,
}

impl Capacity {
    /// A zero capacity is raised to 1 so the ratio stays defined.
    pub fn new(max: u64) -> Self {
        Self { max: max.max(1) }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// `normal` below 50 %, `warning` below 80 %, `critical` from 80 % up.
    ///
    /// Compared in integer space so the boundaries are exact.
    pub fn classify(&self, count: u64) -> CapacityClassification {
        let scaled = u128::from(count) * 10;
        let max = u128::from(self.max);
        if scaled < max * 5 {
            CapacityClassification::Normal
        } else if scaled < max * 8 {
            CapacityClassification::Warning
        } else {
            CapacityClassification::Critical
        }
    }

    /// Filled fraction of the meter, clamped to `1.0` since the store has no ceiling.
    pub fn meter_fraction(&self, count: u64) -> f64 {
        (count as f64 / self.max as f64).min(1.0)
    }

    pub fn meter_percent(&self, count: u64) -> u8 {
        (self.meter_fraction(count) * 100.0).round() as u8
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}
