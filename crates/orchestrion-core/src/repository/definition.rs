//! Definition repository trait.

use orchestrion_types::definition::ProcessDefinition;
use orchestrion_types::error::RepositoryError;
use uuid::Uuid;

/// Storage for deployed, immutable process definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// Insert a definition. Fails with `Conflict` when `(key, version)` or
    /// the id is already taken; definitions are never overwritten.
    fn save_definition(
        &self,
        definition: &ProcessDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    fn find_definition(
        &self,
        key: &str,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// Highest deployed version of `key`.
    fn latest_definition(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<ProcessDefinition>, RepositoryError>> + Send;

    /// Every version of every key, ordered by key then version.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ProcessDefinition>, RepositoryError>> + Send;
}
