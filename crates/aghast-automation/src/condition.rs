//! Condition operators and reply comparison

use aghast_core::Primitive;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Comparison operator of a rule condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
        }
    }

    /// Whether this operator only tests equality
    pub fn is_equality(self) -> bool {
        matches!(self, Operator::Eq | Operator::Ne)
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Ne => ordering != Ordering::Equal,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Ge => ordering != Ordering::Less,
        }
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Le),
            ">=" => Ok(Operator::Ge),
            other => Err(format!("unknown operator '{}'", other)),
        }
    }
}

impl TryFrom<String> for Operator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compare a query reply against the expected value
///
/// The reply's type decides the comparison. Booleans support only `=` and
/// `!=`; numbers compare as `f64`, accepting numeric text on either side;
/// text compares lexically. Anything else is a mismatch: it is logged and the
/// condition does not hold.
pub fn compare(reply: &Primitive, operator: Operator, expected: &Primitive) -> bool {
    let ordering = match (reply, expected) {
        (Primitive::Bool(actual), Primitive::Bool(wanted)) => {
            if !operator.is_equality() {
                warn!(operator = %operator, "Boolean replies only support = and !=");
                return false;
            }
            actual.cmp(wanted)
        }
        (Primitive::Number(_) | Primitive::Text(_), Primitive::Number(_))
        | (Primitive::Number(_), Primitive::Text(_)) => {
            match (numeric(reply), numeric(expected)) {
                (Some(actual), Some(wanted)) => match actual.partial_cmp(&wanted) {
                    Some(ordering) => ordering,
                    None => {
                        warn!(reply = %reply, expected = %expected, "Numeric comparison with NaN");
                        return false;
                    }
                },
                _ => return mismatch(reply, expected),
            }
        }
        (Primitive::Text(actual), Primitive::Text(wanted)) => actual.as_str().cmp(wanted.as_str()),
        _ => return mismatch(reply, expected),
    };
    operator.holds(ordering)
}

fn numeric(value: &Primitive) -> Option<f64> {
    match value {
        Primitive::Number(n) => Some(*n),
        Primitive::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn mismatch(reply: &Primitive, expected: &Primitive) -> bool {
    warn!(
        reply = %reply,
        reply_type = reply.kind(),
        expected_type = expected.kind(),
        "Condition reply has unexpected type"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_parse() {
        assert_eq!("=".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!(" >= ".parse::<Operator>().unwrap(), Operator::Ge);
        assert!("~".parse::<Operator>().is_err());
        assert_eq!(Operator::Ne.to_string(), "!=");
    }

    #[test]
    fn test_numeric_equality() {
        let expected = Primitive::Number(72.0);
        assert!(compare(&Primitive::Number(72.0), Operator::Eq, &expected));
        assert!(!compare(&Primitive::Number(71.9), Operator::Eq, &expected));
        assert!(compare(&Primitive::Number(71.9), Operator::Lt, &expected));
        assert!(compare(&Primitive::Number(72.0), Operator::Le, &expected));
        assert!(!compare(&Primitive::Number(72.0), Operator::Gt, &expected));
    }

    #[test]
    fn test_numeric_text() {
        assert!(compare(
            &Primitive::Text("72.0".into()),
            Operator::Eq,
            &Primitive::Number(72.0)
        ));
        assert!(compare(
            &Primitive::Number(20.0),
            Operator::Gt,
            &Primitive::Text("19.5".into())
        ));
        assert!(!compare(
            &Primitive::Text("warm".into()),
            Operator::Gt,
            &Primitive::Number(1.0)
        ));
    }

    #[test]
    fn test_boolean() {
        let on = Primitive::Bool(true);
        assert!(compare(&on, Operator::Eq, &Primitive::Bool(true)));
        assert!(compare(&on, Operator::Ne, &Primitive::Bool(false)));
        assert!(!compare(&on, Operator::Gt, &Primitive::Bool(false)));
        assert!(!compare(&on, Operator::Eq, &Primitive::Number(1.0)));
    }

    #[test]
    fn test_text_is_lexical() {
        let reply = Primitive::Text("10".into());
        let expected = Primitive::Text("9".into());
        // Both sides text: lexical, so "10" < "9"
        assert!(compare(&reply, Operator::Lt, &expected));
        assert!(compare(
            &Primitive::Text("heat".into()),
            Operator::Eq,
            &Primitive::Text("heat".into())
        ));
    }

    #[test]
    fn test_null_reply() {
        assert!(!compare(&Primitive::Null, Operator::Eq, &Primitive::Null));
    }
}
