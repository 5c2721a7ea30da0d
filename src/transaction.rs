//! Wrapping-transaction reuse.
//!
//! The guard opens one transaction around a test and rolls it back
//! afterwards. `inside_transaction` in the reuse record is written as 0
//! (committed) before `BEGIN` and as 1 inside the transaction. A real
//! rollback discards the 1; reading 1 after the rollback means something
//! committed the transaction, and the database can no longer be trusted.

use crate::db::{Driver, DriverError};
use crate::reuse::{RecordError, ReuseRecord};

#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    #[error("the {0} driver cannot wrap tests in a transaction")]
    Unsupported(crate::db::DriverKind),

    /// `rollback` or `was_committed` before `start`.
    #[error("no wrapping transaction has been started")]
    NotStarted,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// One wrapping transaction on a driver's current database.
pub struct TransactionGuard<'d> {
    driver: &'d dyn Driver,
    active: bool,
    rolled_back: bool,
}

impl<'d> TransactionGuard<'d> {
    pub fn new(driver: &'d dyn Driver) -> Result<Self, TransactionError> {
        if !driver.capabilities().transactions {
            return Err(TransactionError::Unsupported(driver.kind()));
        }
        Ok(Self {
            driver,
            active: false,
            rolled_back: false,
        })
    }

    /// A guard for a transaction an earlier guard started on the same
    /// connection.
    pub fn attach(driver: &'d dyn Driver) -> Result<Self, TransactionError> {
        let mut guard = Self::new(driver)?;
        guard.active = true;
        Ok(guard)
    }

    /// Write the committed marker, begin the transaction, then flag the
    /// record as being inside it.
    pub fn start(&mut self) -> Result<(), TransactionError> {
        let database = self.driver.selected_database()?;
        let conn = self.driver.connection()?;
        ReuseRecord::set_inside_transaction(conn, false)?;
        self.driver.begin_transaction()?;
        ReuseRecord::set_inside_transaction(conn, true)?;
        self.active = true;
        self.rolled_back = false;
        log::debug!("Wrapping transaction started on {database}");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), TransactionError> {
        if !self.active {
            return Err(TransactionError::NotStarted);
        }
        self.driver.rollback_transaction()?;
        self.active = false;
        self.rolled_back = true;
        log::debug!("Wrapping transaction rolled back");
        Ok(())
    }

    /// Whether the flag written inside the transaction survived the
    /// rollback.
    pub fn was_committed(&self) -> Result<bool, TransactionError> {
        if !self.rolled_back {
            return Err(TransactionError::NotStarted);
        }
        let committed = ReuseRecord::read_inside_transaction(self.driver.connection()?)?;
        if committed {
            log::warn!(
                "The wrapping transaction on {:?} was committed instead of rolled back; \
                 the database will be rebuilt on next use",
                self.driver.current_database()
            );
        }
        Ok(committed)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }
}
