use std::fmt;
use std::str::FromStr;

use chrono::{Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnit {
    Days,
    Weeks,
    Months,
}

impl WindowUnit {
    pub fn suffix(self) -> char {
        match self {
            Self::Days => 'd',
            Self::Weeks => 'w',
            Self::Months => 'm',
        }
    }
}

/// A relative window such as `7d`, `2w` or `3m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub amount: u64,
    pub unit: WindowUnit,
}

impl TimeWindow {
    /// First day of the window counted back from `today`.
    pub fn start_from(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self.unit {
            WindowUnit::Days => today.checked_sub_days(Days::new(self.amount)),
            WindowUnit::Weeks => self
                .amount
                .checked_mul(7)
                .and_then(|days| today.checked_sub_days(Days::new(days))),
            // chrono clamps to the last valid day of the target month
            WindowUnit::Months => u32::try_from(self.amount)
                .ok()
                .and_then(|months| today.checked_sub_months(Months::new(months))),
        }
    }
}

impl FromStr for TimeWindow {
    type Err = AnalysisError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = || AnalysisError::InvalidWindowFormat(expression.to_owned());

        let unit = match expression.as_bytes().last() {
            Some(b'd') => WindowUnit::Days,
            Some(b'w') => WindowUnit::Weeks,
            Some(b'm') => WindowUnit::Months,
            _ => return Err(invalid()),
        };

        let digits = &expression[..expression.len() - 1];
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount = digits.parse::<u64>().map_err(|_| invalid())?;

        Ok(Self { amount, unit })
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

/// Resolves a window expression against today's UTC date.
pub fn resolve_window(expression: &str) -> Result<NaiveDate, AnalysisError> {
    resolve_window_from(expression, Utc::now().date_naive())
}

pub fn resolve_window_from(expression: &str, today: NaiveDate) -> Result<NaiveDate, AnalysisError> {
    let window = expression.parse::<TimeWindow>()?;
    window
        .start_from(today)
        .ok_or_else(|| AnalysisError::InvalidWindowFormat(expression.to_owned()))
}
