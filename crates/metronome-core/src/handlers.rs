//! REPEAT and DESIST command handlers.
//!
//! Handlers only buffer effects in the caller's transaction; the processor
//! decides whether to commit. Outcomes are explicit values so the processor
//! can tell a command that will never succeed from a store hiccup.

use tracing::debug;

use crate::command::{Action, CommandRecord};
use crate::error::{MetronomeError, Result};
use crate::model::{AssocType, ObjectId, ObjectKind, TASK_ROOT};
use crate::store::Transaction;
use crate::task::TaskDefinition;

#[derive(Debug)]
pub enum HandlerOutcome {
    Applied,
    /// The command is structurally invalid and will fail on every retry.
    ValidationFailed(String),
    /// The store refused an operation; a retry may succeed.
    StoreError(MetronomeError),
}

impl HandlerOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl From<MetronomeError> for HandlerOutcome {
    fn from(e: MetronomeError) -> Self {
        match e {
            MetronomeError::Validation(reason) => Self::ValidationFailed(reason),
            other => Self::StoreError(other),
        }
    }
}

/// Apply one command inside `tx`.
pub async fn execute(tx: &mut dyn Transaction, command: &CommandRecord) -> HandlerOutcome {
    let result = match Action::from_code(command.action) {
        Some(Action::Repeat) => repeat(tx, command).await,
        Some(Action::Desist) => desist(tx, command).await,
        None => Err(MetronomeError::Validation(format!(
            "unknown command action {}",
            command.action
        ))),
    };
    match result {
        Ok(()) => HandlerOutcome::Applied,
        Err(e) => e.into(),
    }
}

/// `[owner, channel, payload1, payload2, interval_ticks]` → new scheduled task.
async fn repeat(tx: &mut dyn Transaction, command: &CommandRecord) -> Result<()> {
    let [owner, channel, payload1, payload2, interval_ticks] = command.params;
    if interval_ticks == 0 {
        return Err(MetronomeError::Validation(
            "repeat requires interval_ticks > 0".into(),
        ));
    }

    let task = TaskDefinition {
        owner,
        channel,
        payload1,
        payload2,
        interval_ticks,
    };
    let task_id = tx.insert_object(ObjectKind::Task, task.encode()).await?;
    tx.create_assoc(TASK_ROOT, task_id, AssocType::ScheduledTask)
        .await?;
    debug!(task_id, owner, channel, interval_ticks, "task scheduled");
    Ok(())
}

/// `[task_id, ..]` → delete the task; its association goes with it.
async fn desist(tx: &mut dyn Transaction, command: &CommandRecord) -> Result<()> {
    let task_id = command.params[0];
    // Zero is the task root and doubles as "field not set".
    if task_id == TASK_ROOT {
        return Err(MetronomeError::Validation(
            "desist requires a task_id".into(),
        ));
    }
    if !tx
        .delete_object(ObjectKind::Task, &ObjectId::Seq(task_id))
        .await?
    {
        return Err(MetronomeError::Validation(format!(
            "task {task_id} does not exist"
        )));
    }
    debug!(task_id, "task removed");
    Ok(())
}
