//! Durable queue of writes made while offline.
//!
//! A task is first tried immediately. If that fails for a reason that may
//! clear up, the task is persisted and replayed after the next reconnect.
//! Replay is at-least-once: a task whose response was lost is sent again.

use crate::client::ChatClient;
use crate::error::{ClientError, EngineError, EngineResult, ErrorPolicy};
use chatsync_protocol::{Cid, Draft, Message, PendingTask, Reaction, TaskPayload};
use chatsync_storage::{Batch, StorageDriver, WriteOp};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Canonical entity returned by a successfully executed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// A message was sent or deleted.
    Message(Message),
    /// A reaction was sent or deleted.
    Reaction {
        /// Message carrying the refreshed reaction counts.
        message: Message,
        /// The reaction.
        reaction: Reaction,
    },
    /// A draft was created.
    Draft(Draft),
    /// A draft was deleted.
    DraftDeleted,
}

/// Summary of one replay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Tasks that succeeded and were removed.
    pub executed: usize,
    /// Tasks rejected for good and removed.
    pub discarded: usize,
    /// Tasks left for the next cycle.
    pub retained: usize,
}

/// Queue of pending mutations.
pub struct PendingMutationQueue<S, C> {
    storage: Arc<S>,
    client: Arc<C>,
    policy: ErrorPolicy,
}

impl<S: StorageDriver, C: ChatClient> PendingMutationQueue<S, C> {
    /// Creates a queue.
    pub fn new(storage: Arc<S>, client: Arc<C>, policy: ErrorPolicy) -> Self {
        Self {
            storage,
            client,
            policy,
        }
    }

    /// Persists a task and returns it with its storage id.
    pub async fn enqueue(&self, mut task: PendingTask) -> EngineResult<PendingTask> {
        let id = self.storage.add_pending_task(&task).await?;
        task.id = Some(id);
        debug!(task_id = id, kind = %task.kind(), message_id = %task.message_id, "task queued");
        Ok(task)
    }

    /// Removes a task.
    pub async fn dequeue(&self, id: i64) -> EngineResult<()> {
        self.storage.delete_pending_task(id).await?;
        debug!(task_id = id, "task removed");
        Ok(())
    }

    /// Returns every queued task in creation order. The queue is left as is.
    pub async fn drain_all(&self) -> EngineResult<Vec<PendingTask>> {
        Ok(self.storage.get_pending_tasks().await?)
    }

    /// Executes a task now, queueing it if the failure may clear up.
    ///
    /// The error is returned to the caller whether or not the task was queued.
    pub async fn queue_task(&self, task: PendingTask) -> EngineResult<TaskOutcome> {
        let result = if self.client.is_connection_healthy() {
            self.execute(&task).await
        } else {
            Err(ClientError::ConnectionLost("connection is not healthy".into()).into())
        };

        let err = match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        if self.policy.classify_engine(&err).is_permanent() {
            warn!(kind = %task.kind(), message_id = %task.message_id, error = %err, "task rejected; not queueing");
        } else if let Err(queue_err) = self.enqueue(task.clone()).await {
            warn!(kind = %task.kind(), message_id = %task.message_id, error = %queue_err, "failed to queue task");
        }
        Err(err)
    }

    /// Replays every queued task, oldest first, one at a time.
    ///
    /// Tasks that succeed or are rejected for good are removed; the rest stay.
    /// A stored task of an unknown kind fails the whole cycle.
    pub async fn execute_all(&self) -> EngineResult<ReplayReport> {
        let tasks = self.storage.get_pending_tasks().await?;
        let mut report = ReplayReport::default();

        for task in tasks {
            let Some(id) = task.id else {
                continue;
            };
            match self.execute(&task).await {
                Ok(_) => {
                    self.dequeue(id).await?;
                    report.executed += 1;
                }
                Err(err) if self.policy.classify_engine(&err).is_permanent() => {
                    warn!(task_id = id, kind = %task.kind(), error = %err, "dropping rejected task");
                    self.dequeue(id).await?;
                    report.discarded += 1;
                }
                Err(err) => {
                    debug!(task_id = id, kind = %task.kind(), error = %err, "task kept for retry");
                    report.retained += 1;
                }
            }
        }

        if report != ReplayReport::default() {
            info!(
                executed = report.executed,
                discarded = report.discarded,
                retained = report.retained,
                "replayed pending tasks"
            );
        }
        Ok(report)
    }

    /// Runs the RPC for a task and persists what the server returned.
    async fn execute(&self, task: &PendingTask) -> EngineResult<TaskOutcome> {
        match &task.payload {
            TaskPayload::DeleteMessage { hard } => {
                let response = self.client.delete_message(&task.message_id, *hard).await?;
                let op = if *hard {
                    WriteOp::DeleteMessage {
                        id: task.message_id.clone(),
                    }
                } else {
                    WriteOp::UpdateMessage {
                        message: response.message.clone(),
                    }
                };
                self.persist(None, Batch::from(op)).await?;
                Ok(TaskOutcome::Message(response.message))
            }
            TaskPayload::SendMessage { message } => {
                let cid = required_cid(task)?;
                let response = self.client.send_message(cid, message).await?;
                let mut stored = response.message.clone();
                stored.cid.get_or_insert_with(|| cid.clone());
                let batch = Batch::from(WriteOp::UpsertMessages {
                    messages: vec![stored],
                });
                self.persist(Some(cid), batch).await?;
                Ok(TaskOutcome::Message(response.message))
            }
            TaskPayload::SendReaction {
                reaction,
                enforce_unique,
            } => {
                let cid = required_cid(task)?;
                let response = self
                    .client
                    .send_reaction(cid, &task.message_id, reaction, *enforce_unique)
                    .await?;
                let batch = Batch::from(WriteOp::InsertReaction {
                    reaction: response.reaction.clone(),
                    message: Some(response.message.clone()),
                });
                self.persist(Some(cid), batch).await?;
                Ok(TaskOutcome::Reaction {
                    message: response.message,
                    reaction: response.reaction,
                })
            }
            TaskPayload::DeleteReaction {
                reaction_type,
                user_id,
            } => {
                let cid = required_cid(task)?;
                let response = self
                    .client
                    .delete_reaction(cid, &task.message_id, reaction_type, user_id.as_deref())
                    .await?;
                let batch = Batch::from(WriteOp::DeleteReaction {
                    reaction: response.reaction.clone(),
                    message: Some(response.message.clone()),
                });
                self.persist(Some(cid), batch).await?;
                Ok(TaskOutcome::Reaction {
                    message: response.message,
                    reaction: response.reaction,
                })
            }
            TaskPayload::CreateDraft { draft } => {
                let cid = required_cid(task)?;
                let response = self.client.create_draft(cid, draft).await?;
                let batch = Batch::from(WriteOp::UpsertDraft {
                    draft: response.draft.clone(),
                });
                self.persist(Some(cid), batch).await?;
                Ok(TaskOutcome::Draft(response.draft))
            }
            TaskPayload::DeleteDraft { parent_id } => {
                let cid = required_cid(task)?;
                self.client.delete_draft(cid, parent_id.as_deref()).await?;
                let batch = Batch::from(WriteOp::DeleteDraft {
                    cid: cid.clone(),
                    parent_id: parent_id.clone(),
                });
                self.persist(None, batch).await?;
                Ok(TaskOutcome::DraftDeleted)
            }
        }
    }

    /// Writes a task's result. Channel-scoped writes are skipped when the
    /// channel is not mirrored locally.
    async fn persist(&self, cid: Option<&Cid>, batch: Batch) -> EngineResult<()> {
        if let Some(cid) = cid {
            if !self.storage.channel_exists(cid).await? {
                debug!(%cid, "channel not mirrored; not persisting task result");
                return Ok(());
            }
        }
        self.storage.execute_batch(&batch).await?;
        Ok(())
    }
}

fn required_cid(task: &PendingTask) -> EngineResult<&Cid> {
    task.cid.as_ref().ok_or_else(|| EngineError::InvalidTask {
        kind: task.kind(),
        reason: "missing channel".into(),
    })
}
