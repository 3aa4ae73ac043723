//! Mutation bookkeeping
//!
//! A mutation gets a version from the table's block number sequence. Every
//! part whose data version is below it must be rewritten; the mutation is done
//! once no such part remains.

use crate::sql::MutationCommand;

/// State of one mutation of a table
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEntry {
    pub version: u64,
    pub command: MutationCommand,
    /// Live parts still below `version`
    pub parts_to_do: usize,
    pub is_done: bool,
    pub latest_failed_part: Option<String>,
    pub latest_fail_reason: Option<String>,
    pub fail_count: u32,
}

impl MutationEntry {
    pub fn new(version: u64, command: MutationCommand) -> Self {
        Self {
            version,
            command,
            parts_to_do: 0,
            is_done: false,
            latest_failed_part: None,
            latest_fail_reason: None,
            fail_count: 0,
        }
    }

    /// Whether a part at `data_version` still needs this mutation
    pub fn applies_to(&self, data_version: u64) -> bool {
        data_version < self.version
    }

    pub fn record_failure(&mut self, part: &str, reason: &str) {
        self.fail_count += 1;
        self.latest_failed_part = Some(part.to_string());
        self.latest_fail_reason = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Expr, Literal};

    #[test]
    fn test_applies_to_older_parts_only() {
        let entry = MutationEntry::new(
            2,
            MutationCommand::Delete {
                filter: Expr::Literal(Literal::Integer(1)),
            },
        );
        assert!(entry.applies_to(1));
        assert!(!entry.applies_to(2));
        assert!(!entry.applies_to(3));
    }

    #[test]
    fn test_record_failure() {
        let mut entry = MutationEntry::new(
            5,
            MutationCommand::Delete {
                filter: Expr::Literal(Literal::Integer(0)),
            },
        );
        entry.record_failure("all_1_1_0", "division by zero");
        entry.record_failure("all_1_1_0", "division by zero");
        assert_eq!(entry.fail_count, 2);
        assert_eq!(entry.latest_failed_part.as_deref(), Some("all_1_1_0"));
        assert!(!entry.is_done);
    }
}
