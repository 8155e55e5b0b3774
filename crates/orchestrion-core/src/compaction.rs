//! History compaction.
//!
//! Terminal processes older than the retention window are copied, together
//! with their executions and jobs, into the append-only history store and
//! then removed from the active store. Each process is archived before it
//! is deleted, so a run that dies halfway leaves both stores consistent and
//! the next run picks up where it stopped. Finished jobs that belong to no
//! process are deleted outright once past the same retention window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use orchestrion_types::compaction::{CompactionCommand, CompactionReport};
use orchestrion_types::config::CompactionSettings;
use orchestrion_types::event::EngineEvent;
use orchestrion_types::history::HistoryRecord;
use orchestrion_types::job::job_types;
use orchestrion_types::process::Process;
use orchestrion_types::variables::{self, Variables};
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::EventBus;
use crate::job::{JobContext, JobHandler};
use crate::repository::{EngineStore, JobQuery};

/// Store lease serializing compaction across engine nodes.
pub const COMPACTION_LEASE: &str = "compaction";

pub struct CompactionJob<S: EngineStore> {
    store: Arc<S>,
    events: EventBus,
    settings: CompactionSettings,
    node_id: String,
}

impl<S: EngineStore> CompactionJob<S> {
    pub fn new(store: Arc<S>, events: EventBus, settings: CompactionSettings, node_id: impl Into<String>) -> Self {
        Self {
            store,
            events,
            settings,
            node_id: node_id.into(),
        }
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    pub fn input(command: &CompactionCommand) -> Variables {
        variables::from_value(json!({ "trigger": command.trigger }))
    }

    /// Run one compaction pass.
    ///
    /// Returns an empty report without touching anything when another node
    /// holds the compaction lease.
    pub async fn run(&self, command: &CompactionCommand) -> Result<CompactionReport, EngineError> {
        let started_at = Utc::now();
        let mut report = CompactionReport {
            trigger: command.trigger.clone(),
            started_at: Some(started_at),
            ..Default::default()
        };

        let lease_until = started_at + chrono::Duration::seconds(self.settings.lease_secs as i64);
        if !self
            .store
            .try_acquire_lease(COMPACTION_LEASE, &self.node_id, lease_until, started_at)
            .await?
        {
            tracing::info!(trigger = %command.trigger, "compaction lease held by another node, skipping");
            report.finished_at = Some(Utc::now());
            return Ok(report);
        }

        let outcome = self.sweep(started_at, &mut report).await;
        if let Err(e) = self.store.release_lease(COMPACTION_LEASE, &self.node_id).await {
            tracing::warn!(error = %e, "failed to release compaction lease");
        }
        outcome?;

        report.finished_at = Some(Utc::now());
        tracing::info!(
            trigger = %report.trigger,
            pages = report.pages,
            archived = report.archived,
            already_archived = report.already_archived,
            deleted_activities = report.deleted_activities,
            deleted_jobs = report.deleted_jobs,
            purged_jobs = report.purged_jobs,
            "compaction finished"
        );
        self.events.publish(EngineEvent::CompactionFinished {
            trigger: report.trigger.clone(),
            archived: report.archived,
            already_archived: report.already_archived,
        });
        Ok(report)
    }

    async fn sweep(&self, now: DateTime<Utc>, report: &mut CompactionReport) -> Result<(), EngineError> {
        let cutoff = now - chrono::Duration::seconds(self.settings.retention_secs as i64);
        let page_size = self.settings.page_size.max(1);
        let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;

        loop {
            let page = self.store.find_compactable(cutoff, cursor, page_size).await?;
            if page.is_empty() {
                break;
            }
            report.pages += 1;
            let full = page.len() as u32 >= page_size;
            cursor = page.last().map(|p| (p.created_at, p.id));

            for process in page {
                self.compact_one(process, report).await?;
            }
            if !full {
                break;
            }
        }

        loop {
            let purged = self.store.delete_finished_jobs(cutoff, page_size).await?;
            report.purged_jobs += purged;
            if purged < u64::from(page_size) {
                return Ok(());
            }
        }
    }

    /// Copy, then delete.
    async fn compact_one(&self, process: Process, report: &mut CompactionReport) -> Result<(), EngineError> {
        let process_id = process.id;
        let activities = self.store.list_activities(&process_id).await?;
        let jobs = self
            .store
            .list_jobs(&JobQuery {
                process_id: Some(process_id),
                ..Default::default()
            })
            .await?;
        let record = HistoryRecord {
            process,
            activities,
            jobs,
            archived_at: Utc::now(),
        };

        if self.store.archive(&record).await? {
            report.archived += 1;
        } else {
            tracing::debug!(%process_id, "process already archived");
            report.already_archived += 1;
        }

        let deleted = self.store.delete_process(&process_id).await?;
        report.deleted_activities += deleted.activities;
        report.deleted_jobs += deleted.jobs;
        Ok(())
    }
}

impl<S: EngineStore> JobHandler for CompactionJob<S> {
    fn job_type(&self) -> &str {
        job_types::COMPACTION
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, anyhow::Result<Variables>> {
        Box::pin(async move {
            let trigger = ctx
                .job
                .input
                .get("trigger")
                .and_then(|v| v.as_str())
                .unwrap_or("manual")
                .to_string();
            let report = CompactionJob::run(self, &CompactionCommand { trigger }).await?;
            Ok(variables::from_value(serde_json::to_value(&report)?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{HistoryRepository, JobRepository, LeaseRepository, MemoryStore, RuntimeRepository};
    use orchestrion_types::job::{Job, JobState};
    use crate::runtime::ProcessEngine;
    use orchestrion_types::command::{DefinitionRef, StartProcessCommand};
    use orchestrion_types::config::EngineSettings;
    use orchestrion_types::definition::{ActivityDefinition, ActivityKind, ProcessDefinition, SequenceFlow};

    fn wait_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: Uuid::now_v7(),
            key: "parcel".to_string(),
            version: 0,
            name: None,
            activities: vec![
                ActivityDefinition::new("start", ActivityKind::StartEvent),
                ActivityDefinition::new("wait", ActivityKind::ReceiveTask {
                    message: "picked-up".to_string(),
                }),
                ActivityDefinition::new("end", ActivityKind::EndEvent),
            ],
            flows: vec![
                SequenceFlow::new("f1", "start", "wait"),
                SequenceFlow::new("f2", "wait", "end"),
            ],
            variables: Variables::new(),
            deployed_at: Utc::now(),
        }
    }

    /// Three completed and two running processes.
    async fn seeded() -> (Arc<MemoryStore>, Arc<ProcessEngine<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ProcessEngine::new(
            Arc::clone(&store),
            EventBus::default(),
            EngineSettings::default(),
        ));
        engine.deploy(wait_definition()).await.unwrap();
        for i in 0..5 {
            let process = engine
                .start(StartProcessCommand {
                    definition: DefinitionRef::latest("parcel"),
                    variables: Variables::new(),
                    business_key: Some(format!("parcel-{i}")),
                })
                .await
                .unwrap();
            if i < 3 {
                engine
                    .correlate_message(process.id, "picked-up", Variables::new())
                    .await
                    .unwrap();
            }
        }
        (store, engine)
    }

    fn job(store: &Arc<MemoryStore>, page_size: u32) -> CompactionJob<MemoryStore> {
        let settings = CompactionSettings {
            page_size,
            ..Default::default()
        };
        CompactionJob::new(Arc::clone(store), EventBus::default(), settings, "node-a")
    }

    #[tokio::test]
    async fn archives_only_terminal_processes() {
        let (store, _engine) = seeded().await;
        let report = job(&store, 100).run(&CompactionCommand::manual()).await.unwrap();

        assert_eq!(report.archived, 3);
        assert_eq!(report.already_archived, 0);
        assert_eq!(report.trigger, "manual");
        assert_eq!(store.count_history().await.unwrap(), 3);
        let remaining = store.list_processes(&Default::default()).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| !p.is_terminal()));
    }

    #[tokio::test]
    async fn second_run_changes_nothing() {
        let (store, _engine) = seeded().await;
        let compaction = job(&store, 100);
        compaction.run(&CompactionCommand::manual()).await.unwrap();
        let first = store.list_history(10, 0).await.unwrap();

        let report = compaction.run(&CompactionCommand::cron()).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(store.list_history(10, 0).await.unwrap(), first);
        assert_eq!(store.list_processes(&Default::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pages_through_small_batches() {
        let (store, _engine) = seeded().await;
        let report = job(&store, 2).run(&CompactionCommand::manual()).await.unwrap();
        assert_eq!(report.archived, 3);
        assert_eq!(report.pages, 2);
    }

    #[tokio::test]
    async fn archived_record_survives_a_crash_before_delete() {
        let (store, _engine) = seeded().await;
        let done = store
            .find_compactable(Utc::now(), None, 1)
            .await
            .unwrap()
            .remove(0);
        // Simulate a run that archived but never deleted.
        store
            .archive(&HistoryRecord {
                activities: store.list_activities(&done.id).await.unwrap(),
                process: done.clone(),
                jobs: Vec::new(),
                archived_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = job(&store, 100).run(&CompactionCommand::manual()).await.unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(report.already_archived, 1);
        assert_eq!(store.count_history().await.unwrap(), 3);
        assert!(store.get_process(&done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purges_finished_jobs_of_no_process() {
        let (store, engine) = seeded().await;
        let long_ago = Utc::now() - chrono::Duration::days(30);
        let mut old = Job::new(job_types::COMPACTION, Variables::new(), 1, None, long_ago, long_ago);
        store.insert_job(&old).await.unwrap();
        old.revision = 1;
        old.transition(JobState::Running, long_ago).unwrap();
        old.transition(JobState::Completed, long_ago).unwrap();
        store.update_job(&old).await.unwrap();

        let pending = Job::new(job_types::COMPACTION, Variables::new(), 1, None, long_ago, long_ago);
        store.insert_job(&pending).await.unwrap();
        let running = engine
            .start(StartProcessCommand {
                definition: DefinitionRef::latest("parcel"),
                variables: Variables::new(),
                business_key: None,
            })
            .await
            .unwrap();

        let report = job(&store, 100).run(&CompactionCommand::manual()).await.unwrap();
        assert_eq!(report.purged_jobs, 1);
        assert!(store.get_job(&old.id).await.unwrap().is_none());
        assert!(store.get_job(&pending.id).await.unwrap().is_some());
        assert!(store.get_process(&running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn held_lease_skips_the_run() {
        let (store, _engine) = seeded().await;
        let now = Utc::now();
        store
            .try_acquire_lease(COMPACTION_LEASE, "node-b", now + chrono::Duration::minutes(5), now)
            .await
            .unwrap();

        let report = job(&store, 100).run(&CompactionCommand::cron()).await.unwrap();
        assert_eq!(report.pages, 0);
        assert_eq!(store.count_history().await.unwrap(), 0);
    }
}
