//! Comparison operators used by scaling policy thresholds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InvalidOperator;

/// A mathematical comparison operator for comparing floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// The `>` operator.
    GreaterThan,
    /// The `<` operator.
    LessThan,
    /// The `>=` operator.
    GreaterThanEqual,
    /// The `<=` operator.
    LessThanEqual,
    /// The `==` operator.
    Equal,
    /// The `!=` operator.
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluates the expression `lhs (op) rhs` with IEEE-754 semantics.
    #[must_use]
    pub fn evaluate(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::GreaterThan => lhs > rhs,
            Self::LessThan => lhs < rhs,
            Self::GreaterThanEqual => lhs >= rhs,
            Self::LessThanEqual => lhs <= rhs,
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterThanEqual => ">=",
            Self::LessThanEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        };
        write!(f, "{symbol}")
    }
}

impl FromStr for ComparisonOperator {
    type Err = InvalidOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(Self::GreaterThan),
            "<" => Ok(Self::LessThan),
            ">=" => Ok(Self::GreaterThanEqual),
            "<=" => Ok(Self::LessThanEqual),
            "==" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            other => Err(InvalidOperator {
                symbol: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_symbols() {
        let cases = [
            (">", ComparisonOperator::GreaterThan),
            ("<", ComparisonOperator::LessThan),
            (">=", ComparisonOperator::GreaterThanEqual),
            ("<=", ComparisonOperator::LessThanEqual),
            ("==", ComparisonOperator::Equal),
            ("!=", ComparisonOperator::NotEqual),
        ];
        for (symbol, expected) in cases {
            let op: ComparisonOperator = symbol.parse().expect("parse");
            assert_eq!(op, expected);
            assert_eq!(op.to_string(), symbol);
        }
    }

    #[test]
    fn parse_unknown_symbol_fails() {
        let err = "=>".parse::<ComparisonOperator>().unwrap_err();
        assert_eq!(err.symbol, "=>");

        assert!("".parse::<ComparisonOperator>().is_err());
        assert!("gt".parse::<ComparisonOperator>().is_err());
    }

    #[test]
    fn evaluate_orderings() {
        assert!(ComparisonOperator::GreaterThan.evaluate(2.0, 1.0));
        assert!(!ComparisonOperator::GreaterThan.evaluate(1.0, 1.0));
        assert!(ComparisonOperator::LessThan.evaluate(1.0, 2.0));
        assert!(ComparisonOperator::GreaterThanEqual.evaluate(1.0, 1.0));
        assert!(ComparisonOperator::LessThanEqual.evaluate(1.0, 1.0));
        assert!(ComparisonOperator::Equal.evaluate(1.5, 1.5));
        assert!(ComparisonOperator::NotEqual.evaluate(1.5, 1.25));
    }

    #[test]
    fn evaluate_ieee754_nan() {
        let nan = f64::NAN;
        assert!(!ComparisonOperator::Equal.evaluate(nan, nan));
        assert!(ComparisonOperator::NotEqual.evaluate(nan, nan));
        assert!(!ComparisonOperator::GreaterThanEqual.evaluate(nan, 0.0));
    }
}
