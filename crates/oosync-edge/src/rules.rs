//! Pull-rule compilation: the closed rule set from the core crate becomes
//! parameterized SQL predicates. A rule that resolves to an empty id set
//! skips its table for this user; `rpc` rules delegate the whole scan to a
//! stored procedure and are handled by the pull module.

use std::collections::HashMap;

use tracing::warn;

use crate::pg::PgValue;
use oosync_core::{CompoundOp, PullRule};

/// A compiled WHERE fragment with its parameters. Placeholder numbering
/// starts at the caller-provided index so fragments compose with the rest
/// of the statement.
#[derive(Debug)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<PgValue>,
}

/// Result of compiling a table's pull rule.
#[derive(Debug)]
pub enum Compiled {
    Predicate(Predicate),
    /// The table yields no rows for this user.
    Skip,
    /// Delegate to a stored procedure.
    Rpc {
        function: String,
        params: serde_json::Value,
    },
}

/// Compile a rule. `next_param` is advanced past every placeholder the
/// predicate consumed.
pub fn compile(
    rule: &PullRule,
    user_id: &str,
    collections: &HashMap<String, Vec<String>>,
    next_param: &mut usize,
) -> Compiled {
    match rule {
        PullRule::EqUserId { column } => {
            let n = bump(next_param);
            Compiled::Predicate(Predicate {
                sql: format!("{column} = ${n}"),
                params: vec![PgValue::Text(user_id.to_string())],
            })
        }
        PullRule::OrNullEqUserId { column } => {
            let n = bump(next_param);
            Compiled::Predicate(Predicate {
                sql: format!("({column} IS NULL OR {column} = ${n})"),
                params: vec![PgValue::Text(user_id.to_string())],
            })
        }
        PullRule::InCollection { column, collection } => {
            let ids = collections.get(collection).cloned().unwrap_or_default();
            if ids.is_empty() {
                return Compiled::Skip;
            }
            let n = bump(next_param);
            Compiled::Predicate(Predicate {
                sql: format!("{column} = ANY(${n})"),
                params: vec![PgValue::TextArray(ids)],
            })
        }
        PullRule::PublicOnly { column } => Compiled::Predicate(Predicate {
            sql: format!("{column} IS NULL"),
            params: Vec::new(),
        }),
        PullRule::OrEqUserIdOrTrue {
            column,
            other_column,
        } => {
            let n = bump(next_param);
            Compiled::Predicate(Predicate {
                sql: format!("({column} = ${n} OR {other_column} = TRUE)"),
                params: vec![PgValue::Text(user_id.to_string())],
            })
        }
        PullRule::Compound { rules, op } => compile_compound(rules, *op, user_id, collections, next_param),
        PullRule::Rpc { function, params } => Compiled::Rpc {
            function: function.clone(),
            params: params.clone(),
        },
    }
}

/// Fallback for tables without a configured rule: filter on the
/// conventional owner column.
pub fn heuristic(user_id: &str, next_param: &mut usize) -> Predicate {
    let n = bump(next_param);
    Predicate {
        sql: format!("user_id = ${n}"),
        params: vec![PgValue::Text(user_id.to_string())],
    }
}

fn compile_compound(
    rules: &[PullRule],
    op: CompoundOp,
    user_id: &str,
    collections: &HashMap<String, Vec<String>>,
    next_param: &mut usize,
) -> Compiled {
    let mut fragments = Vec::new();
    let mut params = Vec::new();
    for rule in rules {
        match compile(rule, user_id, collections, next_param) {
            Compiled::Predicate(p) => {
                fragments.push(p.sql);
                params.extend(p.params);
            }
            Compiled::Skip => match op {
                // An empty AND leg empties the whole conjunction.
                CompoundOp::And => return Compiled::Skip,
                // An empty OR leg just drops out.
                CompoundOp::Or => {}
            },
            Compiled::Rpc { function, .. } => {
                warn!(function = %function, "rpc rules cannot nest inside compound; ignoring leg");
            }
        }
    }
    if fragments.is_empty() {
        return Compiled::Skip;
    }
    let joiner = match op {
        CompoundOp::And => " AND ",
        CompoundOp::Or => " OR ",
    };
    Compiled::Predicate(Predicate {
        sql: format!("({})", fragments.join(joiner)),
        params,
    })
}

fn bump(next_param: &mut usize) -> usize {
    let n = *next_param;
    *next_param += 1;
    n
}

// ============================================================================
// Tests
// ============================================================================
