use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// condition 节点的比较运算符
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "eq", alias = "==")]
    Equals,
    #[serde(alias = "ne", alias = "!=")]
    NotEquals,
    #[serde(alias = "gt", alias = ">")]
    GreaterThan,
    #[serde(alias = "gte", alias = ">=")]
    GreaterThanOrEqual,
    #[serde(alias = "lt", alias = "<")]
    LessThan,
    #[serde(alias = "lte", alias = "<=")]
    LessThanOrEqual,
    Contains,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::GreaterThanOrEqual => "greater_than_or_equal",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::LessThanOrEqual => "less_than_or_equal",
            ConditionOperator::Contains => "contains",
            ConditionOperator::IsEmpty => "is_empty",
            ConditionOperator::IsNotEmpty => "is_not_empty",
        }
    }

    /// 计算 `left <op> right`
    ///
    /// 缺失的变量由调用方传入空字符串；两侧都能解析为数字时按数值比较，
    /// 否则按字符串字典序比较
    pub fn evaluate(&self, left: &str, right: &str) -> bool {
        match self {
            ConditionOperator::Equals => compare(left, right) == Ordering::Equal,
            ConditionOperator::NotEquals => compare(left, right) != Ordering::Equal,
            ConditionOperator::GreaterThan => compare(left, right) == Ordering::Greater,
            ConditionOperator::GreaterThanOrEqual => compare(left, right) != Ordering::Less,
            ConditionOperator::LessThan => compare(left, right) == Ordering::Less,
            ConditionOperator::LessThanOrEqual => compare(left, right) != Ordering::Greater,
            ConditionOperator::Contains => left.contains(right),
            ConditionOperator::IsEmpty => left.trim().is_empty(),
            ConditionOperator::IsNotEmpty => !left.trim().is_empty(),
        }
    }
}

/// 尝试把字符串解析为数字
pub fn parse_number(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn compare(left: &str, right: &str) -> Ordering {
    match (parse_number(left), parse_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison_when_both_numbers() {
        assert!(ConditionOperator::GreaterThan.evaluate("150", "100"));
        assert!(!ConditionOperator::GreaterThan.evaluate("50", "100"));
        // 字典序下 "9" > "10"，数值比较下不成立
        assert!(!ConditionOperator::GreaterThan.evaluate("9", "10"));
        assert!(ConditionOperator::Equals.evaluate("1.0", "1"));
    }

    #[test]
    fn test_lexical_comparison_otherwise() {
        assert!(ConditionOperator::GreaterThan.evaluate("b", "a"));
        assert!(ConditionOperator::LessThan.evaluate("9", "abc"));
        assert!(ConditionOperator::Equals.evaluate("vip", "vip"));
        assert!(ConditionOperator::NotEquals.evaluate("vip", "VIP"));
    }

    #[test]
    fn test_missing_variable_is_empty() {
        assert!(ConditionOperator::IsEmpty.evaluate("", ""));
        assert!(!ConditionOperator::IsNotEmpty.evaluate("  ", ""));
        assert!(!ConditionOperator::GreaterThan.evaluate("", "100"));
        assert!(ConditionOperator::Contains.evaluate("hello world", "world"));
    }

    #[test]
    fn test_complementary_operators_never_agree() {
        use ConditionOperator::*;
        let pairs = [
            (Equals, NotEquals),
            (GreaterThan, LessThanOrEqual),
            (LessThan, GreaterThanOrEqual),
            (IsEmpty, IsNotEmpty),
        ];
        let values = ["", " ", "0", "0.0", "50", "100", "abc", "ABC", "NaN", "-3.5"];
        for (op, complement) in pairs {
            for left in values {
                for right in values {
                    assert_ne!(
                        op.evaluate(left, right),
                        complement.evaluate(left, right),
                        "{} / {} on ({left:?}, {right:?})",
                        op.as_str(),
                        complement.as_str()
                    );
                }
            }
        }
        // 三分法：大于、等于、小于恰好成立一个
        for left in values {
            for right in values {
                let holds = [Equals, GreaterThan, LessThan]
                    .iter()
                    .filter(|op| op.evaluate(left, right))
                    .count();
                assert_eq!(holds, 1, "({left:?}, {right:?})");
            }
        }
        assert!(LessThanOrEqual.evaluate("-3.5", "0"));
    }

    #[test]
    fn test_operator_aliases() {
        let op: ConditionOperator = serde_json::from_str("\">\"").unwrap();
        assert_eq!(op, ConditionOperator::GreaterThan);
        let op: ConditionOperator = serde_json::from_str("\"not_equals\"").unwrap();
        assert_eq!(op, ConditionOperator::NotEquals);
    }
}
