//! Predicate expression trees for conditional instructions
//!
//! A small boolean expression language over substituted strings: equality,
//! substring containment, variable-unset checks, and not/and/or combinators.
//! Expressions are pure; evaluation order of and/or operands is left before
//! right and cannot affect the result.

use serde_json::Value;

use super::session::Variables;
use super::subst::substitute_text;

/// A predicate tree evaluated against the current variable store.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Substituted operands are equal.
    Equals {
        /// Left operand template.
        left: String,
        /// Right operand template.
        right: String,
    },
    /// Substituted operands differ.
    NotEquals {
        /// Left operand template.
        left: String,
        /// Right operand template.
        right: String,
    },
    /// The substituted left operand contains the substituted right operand.
    Contains {
        /// Haystack template.
        left: String,
        /// Needle template.
        right: String,
    },
    /// The substituted left operand does not contain the right operand.
    NotContains {
        /// Haystack template.
        left: String,
        /// Needle template.
        right: String,
    },
    /// The named variable holds no meaningful value.
    NotSet {
        /// Placeholder key to probe.
        name: String,
    },
    /// Logical negation.
    Not(Box<Predicate>),
    /// Logical conjunction, left evaluated before right.
    And(Box<Predicate>, Box<Predicate>),
    /// Logical disjunction, left evaluated before right.
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Decode a predicate from its JSON shape
    /// `{operation, left, right?}`. Returns a human-readable detail string
    /// on failure; callers wrap it with block/index context.
    pub fn from_value(raw: &Value) -> Result<Self, String> {
        let operation = raw
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("predicate needs an 'operation': {raw}"))?;

        let string_operand = |key: &str| -> Result<String, String> {
            raw.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("'{operation}' needs a string '{key}'"))
        };
        let nested_operand = |key: &str| -> Result<Box<Predicate>, String> {
            raw.get(key)
                .ok_or_else(|| format!("'{operation}' needs a nested '{key}'"))
                .and_then(Predicate::from_value)
                .map(Box::new)
        };

        match operation {
            "equals" => Ok(Predicate::Equals {
                left: string_operand("left")?,
                right: string_operand("right")?,
            }),
            "not_equals" => Ok(Predicate::NotEquals {
                left: string_operand("left")?,
                right: string_operand("right")?,
            }),
            "contains" => Ok(Predicate::Contains {
                left: string_operand("left")?,
                right: string_operand("right")?,
            }),
            "not_contains" => Ok(Predicate::NotContains {
                left: string_operand("left")?,
                right: string_operand("right")?,
            }),
            "not_set" => Ok(Predicate::NotSet {
                name: string_operand("left")?,
            }),
            "not" => Ok(Predicate::Not(nested_operand("left")?)),
            "and" => Ok(Predicate::And(
                nested_operand("left")?,
                nested_operand("right")?,
            )),
            "or" => Ok(Predicate::Or(
                nested_operand("left")?,
                nested_operand("right")?,
            )),
            other => Err(format!("unknown predicate operation '{other}'")),
        }
    }

    /// Evaluate the predicate against the variable store.
    pub fn evaluate(&self, vars: &Variables) -> bool {
        match self {
            Predicate::Equals { left, right } => {
                substitute_text(left, vars) == substitute_text(right, vars)
            }
            Predicate::NotEquals { left, right } => {
                substitute_text(left, vars) != substitute_text(right, vars)
            }
            Predicate::Contains { left, right } => {
                substitute_text(left, vars).contains(&substitute_text(right, vars))
            }
            Predicate::NotContains { left, right } => {
                !substitute_text(left, vars).contains(&substitute_text(right, vars))
            }
            Predicate::NotSet { name } => !vars.is_set(name),
            Predicate::Not(inner) => !inner.evaluate(vars),
            Predicate::And(left, right) => left.evaluate(vars) && right.evaluate(vars),
            Predicate::Or(left, right) => left.evaluate(vars) || right.evaluate(vars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        let mut vars = Variables::new();
        vars.assign("${name}", json!("Alice"));
        vars.assign("${greeting}", json!("Hello Alice"));
        vars
    }

    fn parse(raw: Value) -> Predicate {
        Predicate::from_value(&raw).unwrap()
    }

    #[test]
    fn equals_compares_substituted_operands() {
        let predicate = parse(json!({
            "operation": "equals", "left": "${name}", "right": "Alice"
        }));
        assert!(predicate.evaluate(&vars()));
    }

    #[test]
    fn and_of_equals_and_not_equals() {
        let predicate = parse(json!({
            "operation": "and",
            "left": {"operation": "equals", "left": "a", "right": "a"},
            "right": {"operation": "not_equals", "left": "b", "right": "c"}
        }));
        assert!(predicate.evaluate(&Variables::new()));
    }

    #[test]
    fn contains_uses_substituted_haystack() {
        let predicate = parse(json!({
            "operation": "contains", "left": "${greeting}", "right": "${name}"
        }));
        assert!(predicate.evaluate(&vars()));

        let predicate = parse(json!({
            "operation": "not_contains", "left": "${greeting}", "right": "Bob"
        }));
        assert!(predicate.evaluate(&vars()));
    }

    #[test]
    fn double_negated_not_set_tracks_assignment() {
        let predicate = parse(json!({
            "operation": "not",
            "left": {"operation": "not_set", "left": "${undefined_var}"}
        }));
        let mut vars = Variables::new();
        assert!(!predicate.evaluate(&vars));

        vars.assign("${undefined_var}", json!("present"));
        assert!(predicate.evaluate(&vars));
    }

    #[test]
    fn or_is_true_when_either_side_holds() {
        let predicate = parse(json!({
            "operation": "or",
            "left": {"operation": "equals", "left": "x", "right": "y"},
            "right": {"operation": "not_set", "left": "${missing}"}
        }));
        assert!(predicate.evaluate(&Variables::new()));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(Predicate::from_value(&json!({"operation": "xor"})).is_err());
        assert!(Predicate::from_value(&json!({"left": "a"})).is_err());
    }
}
