//! Migration plan repository trait.

use orchestrion_types::error::RepositoryError;
use orchestrion_types::migration::ProcessMigrationPlan;
use uuid::Uuid;

pub trait MigrationPlanRepository: Send + Sync {
    fn save_plan(
        &self,
        plan: &ProcessMigrationPlan,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_plan(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessMigrationPlan>, RepositoryError>> + Send;

    /// Newest first, optionally restricted to one definition key.
    fn list_plans(
        &self,
        definition_key: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessMigrationPlan>, RepositoryError>> + Send;
}
