//! Moving running processes between definition versions.
//!
//! A plan maps activity ids of a source version onto a target version.
//! Applying it rewrites one process at a time inside that process's own
//! transition: either every open execution is remapped and the process is
//! re-pinned, or nothing about the process changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use orchestrion_types::command::{ApplyMigrationCommand, GenerateMigrationPlanCommand, PlanMigrationCommand};
use orchestrion_types::definition::{ActivityDefinition, ProcessDefinition};
use orchestrion_types::job::job_types;
use orchestrion_types::migration::{
    ActivityMigrationInstruction, MigrationOutcome, ProcessMigrationPlan, ProcessMigrationResult,
};
use orchestrion_types::variables::{self, Variables};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::job::{JobContext, JobHandler};
use crate::repository::{EngineStore, ProcessQuery};
use crate::runtime::ProcessEngine;
use crate::runtime::transition::Transition;

/// Processes loaded per page when a plan targets a whole version.
const PAGE_SIZE: u32 = 100;

pub struct MigrationEngine<S: EngineStore> {
    engine: Arc<ProcessEngine<S>>,
}

impl<S: EngineStore> MigrationEngine<S> {
    pub fn new(engine: Arc<ProcessEngine<S>>) -> Self {
        Self { engine }
    }

    /// Validate and store an explicit plan. It stays inert until applied.
    pub async fn plan(&self, command: PlanMigrationCommand) -> Result<ProcessMigrationPlan, EngineError> {
        let (from, to) = self
            .versions(&command.definition_key, command.from_version, command.to_version)
            .await?;
        for instruction in &command.instructions {
            let source = from.activity(&instruction.from_activity_id).ok_or_else(|| {
                EngineError::Definition(format!(
                    "activity '{}' does not exist in {}",
                    instruction.from_activity_id,
                    from.label()
                ))
            })?;
            let target = to.activity(&instruction.to_activity_id).ok_or_else(|| {
                EngineError::Definition(format!(
                    "activity '{}' does not exist in {}",
                    instruction.to_activity_id,
                    to.label()
                ))
            })?;
            if source.activity_type() != target.activity_type() {
                return Err(EngineError::Definition(format!(
                    "cannot map {} '{}' onto {} '{}'",
                    source.activity_type(),
                    source.id,
                    target.activity_type(),
                    target.id
                )));
            }
        }
        self.store_plan(&from, &to, command.instructions).await
    }

    /// Propose a plan: identity mappings for activities present in both
    /// versions with the same type.
    pub async fn generate(&self, command: GenerateMigrationPlanCommand) -> Result<ProcessMigrationPlan, EngineError> {
        let (from, to) = self
            .versions(&command.definition_key, command.from_version, command.to_version)
            .await?;
        let instructions = from
            .activities
            .iter()
            .filter(|a| {
                to.activity(&a.id)
                    .is_some_and(|t| t.activity_type() == a.activity_type())
            })
            .map(|a| ActivityMigrationInstruction::new(a.id.clone(), a.id.clone()))
            .collect();
        self.store_plan(&from, &to, instructions).await
    }

    /// Apply a stored plan. With no process ids, every process pinned to the
    /// source version is targeted. One process failing never affects the
    /// others.
    pub async fn apply(&self, command: ApplyMigrationCommand) -> Result<Vec<ProcessMigrationResult>, EngineError> {
        let plan = self
            .engine
            .store()
            .get_plan(&command.plan_id)
            .await?
            .ok_or_else(|| EngineError::not_found("migration plan", command.plan_id))?;
        let (from, to) = self
            .versions(&plan.definition_key, plan.from_version, plan.to_version)
            .await?;

        let targets = if command.process_ids.is_empty() {
            self.pinned_to(&from).await?
        } else {
            command.process_ids
        };

        let mut results = Vec::with_capacity(targets.len());
        for process_id in targets {
            let outcome = match self.apply_one(process_id, &plan, &from, &to).await {
                Ok(outcome) => outcome,
                Err(e) => MigrationOutcome::Failed { reason: e.to_string() },
            };
            match &outcome {
                MigrationOutcome::Migrated { remapped } => {
                    tracing::info!(%process_id, from = %from.label(), to = %to.label(), remapped, "process migrated");
                }
                MigrationOutcome::Skipped { reason } => {
                    tracing::debug!(%process_id, %reason, "process migration skipped");
                }
                MigrationOutcome::Failed { reason } => {
                    tracing::warn!(%process_id, %reason, "process migration failed");
                }
            }
            results.push(ProcessMigrationResult { process_id, outcome });
        }
        Ok(results)
    }

    async fn apply_one(
        &self,
        process_id: Uuid,
        plan: &ProcessMigrationPlan,
        from: &ProcessDefinition,
        to: &ProcessDefinition,
    ) -> Result<MigrationOutcome, EngineError> {
        let applied = self
            .engine
            .transact(process_id, |t| Ok(migrate_snapshot(t, plan, from, to)))
            .await?;
        Ok(applied.value)
    }

    async fn versions(
        &self,
        key: &str,
        from_version: u32,
        to_version: u32,
    ) -> Result<(Arc<ProcessDefinition>, Arc<ProcessDefinition>), EngineError> {
        Ok((self.version(key, from_version).await?, self.version(key, to_version).await?))
    }

    async fn version(&self, key: &str, version: u32) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.engine
            .store()
            .find_definition(key, version)
            .await?
            .map(Arc::new)
            .ok_or_else(|| EngineError::Definition(format!("definition {key}:{version} does not exist")))
    }

    async fn store_plan(
        &self,
        from: &ProcessDefinition,
        to: &ProcessDefinition,
        instructions: Vec<ActivityMigrationInstruction>,
    ) -> Result<ProcessMigrationPlan, EngineError> {
        let plan = ProcessMigrationPlan {
            id: Uuid::now_v7(),
            definition_key: from.key.clone(),
            from_version: from.version,
            to_version: to.version,
            instructions,
            created_at: Utc::now(),
        };
        self.engine.store().save_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, from = %from.label(), to = %to.label(), instructions = plan.instructions.len(), "migration plan stored");
        Ok(plan)
    }

    async fn pinned_to(&self, from: &ProcessDefinition) -> Result<Vec<Uuid>, EngineError> {
        let mut ids = Vec::new();
        let mut offset = 0;
        loop {
            let query = ProcessQuery {
                definition_id: Some(from.id),
                limit: Some(PAGE_SIZE),
                offset,
                ..Default::default()
            };
            let page = self.engine.store().list_processes(&query).await?;
            let len = page.len() as u32;
            ids.extend(page.into_iter().filter(|p| !p.is_terminal()).map(|p| p.id));
            if len < PAGE_SIZE {
                return Ok(ids);
            }
            offset += len;
        }
    }
}

/// Decide and, when every open execution maps, perform the migration of
/// one process snapshot.
fn migrate_snapshot(
    t: &mut Transition<'_>,
    plan: &ProcessMigrationPlan,
    from: &ProcessDefinition,
    to: &ProcessDefinition,
) -> MigrationOutcome {
    let process = t.process();
    if process.definition_id != from.id {
        return MigrationOutcome::Skipped {
            reason: format!("pinned to {}:{}", process.definition_key, process.definition_version),
        };
    }
    if process.is_terminal() {
        return MigrationOutcome::Skipped {
            reason: format!("process is {}", process.state),
        };
    }

    let mut mapping = HashMap::new();
    for exec in t.executions().filter(|e| e.is_open()) {
        let target_id = plan
            .target_for(&exec.definition_id)
            .or_else(|| to.activity(&exec.definition_id).map(|a| a.id.as_str()));
        let Some(target_id) = target_id else {
            return MigrationOutcome::Failed {
                reason: format!("no mapping for open activity '{}'", exec.definition_id),
            };
        };
        let (Some(source), Some(target)) = (from.activity(&exec.definition_id), to.activity(target_id)) else {
            return MigrationOutcome::Failed {
                reason: format!("'{}' → '{target_id}' names an unknown activity", exec.definition_id),
            };
        };
        if let Err(reason) = compatible(source, target, exec.loop_index.is_some() || exec.loop_state.is_some()) {
            return MigrationOutcome::Failed { reason };
        }
        mapping.insert(exec.id, target_id.to_string());
    }

    let remapped = mapping.len();
    t.migrate(to, &mapping);
    MigrationOutcome::Migrated { remapped }
}

fn compatible(source: &ActivityDefinition, target: &ActivityDefinition, in_loop: bool) -> Result<(), String> {
    if source.activity_type() != target.activity_type() {
        return Err(format!(
            "'{}' is a {} but '{}' is a {}",
            source.id,
            source.activity_type(),
            target.id,
            target.activity_type()
        ));
    }
    if in_loop && target.multi_instance.is_none() {
        return Err(format!("'{}' is not multi-instance", target.id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// process-migration job
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MigrationJobInput {
    plan_id: Uuid,
}

/// Applies a plan to every process of its source version.
pub struct MigrationJobHandler<S: EngineStore> {
    migrations: Arc<MigrationEngine<S>>,
}

impl<S: EngineStore> MigrationJobHandler<S> {
    pub fn new(migrations: Arc<MigrationEngine<S>>) -> Self {
        Self { migrations }
    }

    pub fn input(plan_id: Uuid) -> Variables {
        variables::from_value(json!({ "plan_id": plan_id }))
    }
}

impl<S: EngineStore> JobHandler for MigrationJobHandler<S> {
    fn job_type(&self) -> &str {
        job_types::PROCESS_MIGRATION
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, anyhow::Result<Variables>> {
        Box::pin(async move {
            let input: MigrationJobInput = serde_json::from_value(serde_json::Value::Object(ctx.job.input))?;
            let results = self
                .migrations
                .apply(ApplyMigrationCommand {
                    plan_id: input.plan_id,
                    process_ids: Vec::new(),
                })
                .await?;
            let count = |f: fn(&MigrationOutcome) -> bool| results.iter().filter(|r| f(&r.outcome)).count();
            Ok(variables::from_value(json!({
                "migrated": count(|o| matches!(o, MigrationOutcome::Migrated { .. })),
                "skipped": count(|o| matches!(o, MigrationOutcome::Skipped { .. })),
                "failed": count(|o| matches!(o, MigrationOutcome::Failed { .. })),
            })))
        })
    }
}
