//! Contracts for the external migration and seed runners.
//!
//! The engine only decides *when* these run; what they do is up to the
//! caller. Both traits are implemented for closures.

use std::path::Path;

use crate::db::Driver;

/// Failure reported by a runner.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Applies schema migrations to the driver's current database.
pub trait MigrationRunner {
    /// `path` is the configured migrations directory.
    fn run(&mut self, driver: &mut dyn Driver, path: &Path) -> Result<(), StepError>;
}

impl<F> MigrationRunner for F
where
    F: FnMut(&mut dyn Driver, &Path) -> Result<(), StepError>,
{
    fn run(&mut self, driver: &mut dyn Driver, path: &Path) -> Result<(), StepError> {
        self(driver, path)
    }
}

/// Runs named seeders against the driver's current database.
pub trait SeedRunner {
    /// Run `seeders` in the given order.
    fn run(&mut self, driver: &mut dyn Driver, seeders: &[String]) -> Result<(), StepError>;
}

impl<F> SeedRunner for F
where
    F: FnMut(&mut dyn Driver, &[String]) -> Result<(), StepError>,
{
    fn run(&mut self, driver: &mut dyn Driver, seeders: &[String]) -> Result<(), StepError> {
        self(driver, seeders)
    }
}
