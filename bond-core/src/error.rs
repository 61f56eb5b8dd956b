//! Errors reported by bond operations.

use crate::settings::{BondMode, SettingsError};

/// Bond operation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BondError {
    #[error("No such slave: {0}")]
    SlaveNotFound(String),

    #[error("Slave {0} is disabled")]
    SlaveDisabled(String),

    #[error("Bond {bond} is not balancing traffic (mode {mode})")]
    NotBalanced { bond: String, mode: BondMode },

    #[error("Invalid hash bucket: {0}")]
    InvalidBucket(usize),

    #[error("No such bond: {0}")]
    BondNotFound(String),

    #[error("Duplicate bond: {0}")]
    DuplicateBond(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_error_converts() {
        let e: BondError = SettingsError::UnknownMode("rr".to_string()).into();
        assert!(matches!(e, BondError::Settings(SettingsError::UnknownMode(_))));
        assert!(e.to_string().contains("rr"));
    }

    #[test]
    fn test_not_balanced_message() {
        let e = BondError::NotBalanced {
            bond: "bond0".to_string(),
            mode: BondMode::ActiveBackup,
        };
        assert_eq!(
            e.to_string(),
            "Bond bond0 is not balancing traffic (mode active-backup)"
        );
    }
}
