//! Democracy derives
//!
//! `democracy.votes(referendumId, accountIds)` yields the list of votes cast
//! by the given accounts; `democracy.tally` reduces the same inputs to
//! `[ayes, nays]`. Both read `democracy.voteOf(referendumId, accountId)` once
//! per account, so the two derives share their input streams.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::metadata::{MethodRegistry, QueryKey};
use crate::value::Value;

use super::catalog::DeriveDef;

pub const SECTION: &str = "democracy";

/// High bit of an encoded vote marks an aye
const AYE_FLAG: u128 = 0x80;

fn vote_inputs(registry: &MethodRegistry, args: &[Value]) -> Result<Vec<QueryKey>> {
    let (referendum, accounts) = match args {
        [referendum] => (referendum, &[][..]),
        [referendum, Value::List(accounts)] => (referendum, accounts.as_slice()),
        _ => {
            return Err(Error::ArgumentMismatch {
                query: "democracy.votes".into(),
                reason: "expected (referendumId, [accountId])".into(),
            })
        }
    };

    accounts
        .iter()
        .map(|account| {
            registry.build_query_key(
                SECTION,
                "voteOf",
                vec![referendum.clone(), account.clone()],
            )
        })
        .collect()
}

/// Whether an encoded vote is an aye
pub fn is_aye(vote: &Value) -> bool {
    vote.as_uint().map(|v| v & AYE_FLAG != 0).unwrap_or(false)
}

fn tally_votes(votes: &[Value]) -> Value {
    let ayes = votes.iter().filter(|vote| is_aye(vote)).count();
    let nays = votes.len() - ayes;
    Value::List(vec![Value::Uint(ayes as u128), Value::Uint(nays as u128)])
}

/// Votes of a set of accounts on one referendum
pub fn votes() -> DeriveDef {
    DeriveDef::new(
        SECTION,
        "votes",
        Arc::new(|votes: &[Value]| Value::List(votes.to_vec())),
        Arc::new(vote_inputs),
    )
}

/// Aye/nay counts of a set of accounts on one referendum
pub fn tally() -> DeriveDef {
    DeriveDef::new(SECTION, "tally", Arc::new(tally_votes), Arc::new(vote_inputs))
}

/// Every derive in this section
pub fn all() -> Vec<DeriveDef> {
    vec![votes(), tally()]
}
