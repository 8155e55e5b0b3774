//! Append-only history store trait.

use orchestrion_types::error::RepositoryError;
use orchestrion_types::history::HistoryRecord;
use uuid::Uuid;

pub trait HistoryRepository: Send + Sync {
    /// Append a record. Returns `false`, writing nothing, when the process
    /// is already archived.
    fn archive(
        &self,
        record: &HistoryRecord,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_history(
        &self,
        process_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<HistoryRecord>, RepositoryError>> + Send;

    /// Most recently archived first.
    fn list_history(
        &self,
        limit: u32,
        offset: u32,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryRecord>, RepositoryError>> + Send;

    fn count_history(&self) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
