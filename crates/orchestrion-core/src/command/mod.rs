//! Administrative commands and their answers.

pub mod bus;

pub use bus::{Command, CommandBus, CommandHandler};

use orchestrion_types::command::{
    ApplyMigrationCommand, CancelProcessCommand, DeployDefinitionCommand,
    GenerateMigrationPlanCommand, PlanMigrationCommand, RecoverProcessCommand, RunJobCommand,
    ScheduleMigrationCommand, SetVariablesCommand, StartProcessCommand, SuspendDefinitionCommand,
    SuspendProcessCommand, TerminateProcessCommand,
};
use orchestrion_types::compaction::{CompactionCommand, CompactionReport};
use orchestrion_types::definition::ProcessDefinition;
use orchestrion_types::job::Job;
use orchestrion_types::migration::{ProcessMigrationPlan, ProcessMigrationResult};
use orchestrion_types::process::Process;

macro_rules! command_output {
    ($($command:ty => $output:ty),* $(,)?) => {
        $(impl Command for $command {
            type Output = $output;
        })*
    };
}

command_output! {
    DeployDefinitionCommand => ProcessDefinition,
    StartProcessCommand => Process,
    CancelProcessCommand => Process,
    TerminateProcessCommand => Process,
    RecoverProcessCommand => Process,
    SuspendProcessCommand => Process,
    SuspendDefinitionCommand => Vec<Process>,
    SetVariablesCommand => Process,
    RunJobCommand => Job,
    CompactionCommand => CompactionReport,
    PlanMigrationCommand => ProcessMigrationPlan,
    GenerateMigrationPlanCommand => ProcessMigrationPlan,
    ApplyMigrationCommand => Vec<ProcessMigrationResult>,
    ScheduleMigrationCommand => Job,
}
