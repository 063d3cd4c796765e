//! Per-table pull rules: a closed set of tagged variants describing how a
//! remote table is filtered for one user. The edge compiles these into SQL
//! predicates; extending the set means adding a variant and its
//! predicate-builder there.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompoundOp {
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PullRule {
    /// `column = userId`
    EqUserId { column: String },
    /// `column IS NULL OR column = userId`
    OrNullEqUserId { column: String },
    /// `column IN (collections[name])`; an empty set skips the table.
    InCollection { column: String, collection: String },
    /// `column IS NULL`
    PublicOnly { column: String },
    /// `column = userId OR other_column = true`
    OrEqUserIdOrTrue { column: String, other_column: String },
    Compound { rules: Vec<PullRule>, op: CompoundOp },
    /// Delegate to an authoritative stored procedure. Pagination and the
    /// time cutoff travel as parameters.
    Rpc { function: String, params: Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_round_trip_through_config_json() {
        let rule = PullRule::Compound {
            op: CompoundOp::Or,
            rules: vec![
                PullRule::EqUserId {
                    column: "user_ref".to_string(),
                },
                PullRule::PublicOnly {
                    column: "owner_ref".to_string(),
                },
            ],
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "compound");
        assert_eq!(json["rules"][0]["kind"], "eqUserId");
        let back: PullRule = serde_json::from_value(json).unwrap();
        match back {
            PullRule::Compound { rules, op } => {
                assert_eq!(op, CompoundOp::Or);
                assert_eq!(rules.len(), 2);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
