//! The reuse state machine.
//!
//! [`decide`] looks at the current fingerprints, the caller's wishes, the
//! driver's capabilities and the candidate database's reuse record, and
//! answers whether the database can be reused as it is. The rules are
//! evaluated in a fixed order; the first that applies wins.

use std::fmt;

use super::BuildError;
use crate::db::Capabilities;
use crate::reuse::ReuseRecord;

/// Inputs of one decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub database: &'a str,
    pub project_name: &'a str,
    pub build_checksum: &'a str,
    pub scenario_checksum: &'a str,
    pub want_transactions: bool,
    pub want_journal: bool,
    pub force_rebuild: bool,
    pub is_browser_test: bool,
    pub capabilities: Capabilities,
}

impl DecisionInputs<'_> {
    /// Transaction reuse is possible for this run. Browser tests run the
    /// application in another process, outside the wrapping transaction.
    #[must_use]
    pub fn transaction_reusable(&self) -> bool {
        self.want_transactions
            && self.capabilities.reuse
            && self.capabilities.transactions
            && !self.is_browser_test
    }

    /// Journal reuse is possible for this run.
    #[must_use]
    pub fn journal_reusable(&self) -> bool {
        self.want_journal && self.capabilities.reuse && self.capabilities.journaling
    }
}

/// Why a fresh build is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    Forced,
    NoRecord,
    IncompatibleVersion,
    StaleChecksums,
    NotReusable,
    /// The previous run committed its transaction or left the journal
    /// unreversed.
    Dirty,
}

impl fmt::Display for FreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Forced => "rebuild forced",
            Self::NoRecord => "no reuse record",
            Self::IncompatibleVersion => "reuse record from an incompatible version",
            Self::StaleChecksums => "sources or scenario changed",
            Self::NotReusable => "not reusable with the current settings",
            Self::Dirty => "left dirty by a previous run",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    FreshBuild(FreshReason),
    ReuseTransaction,
    ReuseJournal,
}

impl Decision {
    #[must_use]
    pub fn is_reuse(self) -> bool {
        !matches!(self, Self::FreshBuild(_))
    }
}

/// Evaluate the reuse rules for one candidate database.
///
/// A record owned by another project is a hard error.
pub fn decide(
    inputs: &DecisionInputs<'_>,
    record: Option<&ReuseRecord>,
) -> Result<Decision, BuildError> {
    if inputs.force_rebuild {
        return Ok(Decision::FreshBuild(FreshReason::Forced));
    }
    let Some(record) = record else {
        return Ok(Decision::FreshBuild(FreshReason::NoRecord));
    };
    if !record.project_name.is_empty() && record.project_name != inputs.project_name {
        return Err(BuildError::OwnershipConflict {
            database: inputs.database.to_string(),
            owner: record.project_name.clone(),
            project: inputs.project_name.to_string(),
        });
    }
    if !record.is_compatible() {
        return Ok(Decision::FreshBuild(FreshReason::IncompatibleVersion));
    }
    if record.build_checksum != inputs.build_checksum
        || record.scenario_checksum != inputs.scenario_checksum
    {
        return Ok(Decision::FreshBuild(FreshReason::StaleChecksums));
    }

    let via_transaction = inputs.transaction_reusable() && record.transaction_reusable;
    let via_journal = inputs.journal_reusable() && record.journal_reusable;
    if !via_transaction && !via_journal {
        return Ok(Decision::FreshBuild(FreshReason::NotReusable));
    }

    if record.is_dirty() {
        log::warn!(
            "Database {} was left dirty by a previous run (inside_transaction={}, journal_dirty={}); rebuilding",
            inputs.database,
            record.inside_transaction,
            record.journal_dirty
        );
        return Ok(Decision::FreshBuild(FreshReason::Dirty));
    }

    Ok(if via_transaction {
        Decision::ReuseTransaction
    } else {
        Decision::ReuseJournal
    })
}
