//! Online schema migrations.
//!
//! Each registered model carries a schema version. When a store opens with a
//! version above the one on disk, the model's migration handler runs before
//! writes to that model are accepted again. Migrations execute dependency
//! order first, one model at a time, under a per-model lease so concurrent
//! nodes do not double-run them.
//!
//! Store open blocks on the plan for a bounded inline budget; past it the
//! plan keeps running in the background and callers can poll or await status.
//! A handler reports one of three outcomes per attempt: success, retry after
//! a delay, or fatal. Retries count against a budget; exhausting it, or a
//! fatal outcome, parks the migration in the canceled state with the error
//! recorded, and writes to the model stay rejected.

mod lease;
mod plan;

use crate::config::{BackoffConfig, MigrationConfig};
use crate::error::{Error, Result};
use crate::schema::{ModelId, ModelSchema};
use crate::substrate::{ReadOps, Substrate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Where a model's migration currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// No migration pending or running; writes flow.
    Idle,
    Running,
    Paused,
    /// Terminal failure or explicit cancel; writes stay rejected.
    Canceled,
}

/// Result of one handler attempt.
#[derive(Debug, Clone)]
pub enum MigrationOutcome {
    Success,
    /// Try again after the given delay. Counts against the attempt budget.
    Retry { after: Duration },
    /// Unrecoverable; parks the migration as canceled.
    Fatal(String),
}

/// Everything a handler gets to work with.
pub struct MigrationContext {
    pub model: ModelId,
    pub from_version: u32,
    pub to_version: u32,
    pub substrate: Arc<Substrate>,
}

/// User-supplied migration logic for one model.
pub trait MigrationHandler: Send + Sync {
    /// Transform the model's data from `from_version` to `to_version`.
    /// Must be idempotent: a crashed run may be re-executed from the start.
    fn migrate(&self, ctx: &MigrationContext) -> MigrationOutcome;

    /// Post-migration check, run once after a successful `migrate`.
    fn verify(&self, _ctx: &MigrationContext) -> MigrationOutcome {
        MigrationOutcome::Success
    }
}

/// Snapshot of one model's migration.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub model: ModelId,
    pub state: MigrationState,
    pub from_version: u32,
    pub to_version: u32,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

struct Job {
    status: watch::Receiver<MigrationStatus>,
    control: watch::Sender<Control>,
}

/// Runs and tracks the migration plan for one store.
pub(crate) struct MigrationEngine {
    substrate: Arc<Substrate>,
    migration: MigrationConfig,
    backoff: BackoffConfig,
    jobs: Mutex<HashMap<ModelId, Job>>,
}

fn version_key(model: &ModelId) -> Vec<u8> {
    format!("schema_version:{model}").into_bytes()
}

/// The schema version currently recorded for `model`, if any.
pub(crate) fn stored_version(substrate: &Substrate, model: &ModelId) -> Result<Option<u32>> {
    match substrate.get(substrate.meta(), &version_key(model))? {
        Some(raw) => {
            let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
                Error::Decode(format!("schema version for '{model}' has {} bytes", raw.len()))
            })?;
            Ok(Some(u32::from_be_bytes(bytes)))
        }
        None => Ok(None),
    }
}

fn write_version(substrate: &Substrate, model: &ModelId, version: u32) -> Result<()> {
    substrate.transact(|txn| {
        txn.set(
            substrate.meta(),
            version_key(model),
            version.to_be_bytes().to_vec(),
        );
        Ok(())
    })
}

impl MigrationEngine {
    pub(crate) fn new(
        substrate: Arc<Substrate>,
        migration: MigrationConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            substrate,
            migration,
            backoff,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Plan and start migrations for the registered schemas.
    ///
    /// Fresh models get their version recorded without a handler run. A
    /// model whose stored version is above the registered one is a
    /// configuration error. The returned receiver resolves with the plan's
    /// overall result; the caller decides how long to block on it.
    pub(crate) fn start(
        &self,
        schemas: &[ModelSchema],
        handlers: &HashMap<ModelId, Arc<dyn MigrationHandler>>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let order = plan::order(schemas)?;
        let by_id: HashMap<&ModelId, &ModelSchema> =
            schemas.iter().map(|schema| (&schema.id, schema)).collect();

        struct Pending {
            ctx: MigrationContext,
            handler: Arc<dyn MigrationHandler>,
            status: watch::Sender<MigrationStatus>,
            control: watch::Receiver<Control>,
        }
        let mut pending = Vec::new();

        for model in &order {
            let schema = by_id[model];
            let stored = stored_version(&self.substrate, model)?;

            let (from, needs_run) = match stored {
                None => {
                    write_version(&self.substrate, model, schema.version)?;
                    (schema.version, false)
                }
                Some(stored) if stored == schema.version => (stored, false),
                Some(stored) if stored > schema.version => {
                    return Err(Error::Config(format!(
                        "model '{model}': stored schema version {stored} is newer than \
                         registered version {}",
                        schema.version
                    )));
                }
                Some(stored) => (stored, true),
            };

            let state = if needs_run {
                MigrationState::Running
            } else {
                MigrationState::Idle
            };
            let (status_tx, status_rx) = watch::channel(MigrationStatus {
                model: model.clone(),
                state,
                from_version: from,
                to_version: schema.version,
                attempts: 0,
                last_error: None,
            });
            let (control_tx, control_rx) = watch::channel(Control::Run);
            self.jobs.lock().insert(
                model.clone(),
                Job {
                    status: status_rx,
                    control: control_tx,
                },
            );

            if needs_run {
                let handler = handlers.get(model).cloned().ok_or_else(|| {
                    Error::Config(format!(
                        "model '{model}': schema version changed from {from} to {} but no \
                         migration handler is registered",
                        schema.version
                    ))
                })?;
                pending.push(Pending {
                    ctx: MigrationContext {
                        model: model.clone(),
                        from_version: from,
                        to_version: schema.version,
                        substrate: self.substrate.clone(),
                    },
                    handler,
                    status: status_tx,
                    control: control_rx,
                });
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let substrate = self.substrate.clone();
        let migration = self.migration;
        let backoff = self.backoff;
        tokio::spawn(async move {
            let mut result = Ok(());
            for mut job in pending {
                if result.is_ok() {
                    result = run_model(
                        &substrate,
                        &migration,
                        &backoff,
                        &job.ctx,
                        job.handler.as_ref(),
                        &job.status,
                        &mut job.control,
                    )
                    .await;
                } else {
                    // A failed dependency leaves dependents parked.
                    job.status.send_modify(|status| {
                        status.state = MigrationState::Canceled;
                        status.last_error =
                            Some("skipped: an earlier migration in the plan failed".into());
                    });
                }
            }
            let _ = done_tx.send(result);
        });
        Ok(done_rx)
    }

    pub(crate) fn status(&self, model: &ModelId) -> Option<MigrationStatus> {
        self.jobs
            .lock()
            .get(model)
            .map(|job| job.status.borrow().clone())
    }

    pub(crate) fn pause(&self, model: &ModelId) -> Result<()> {
        self.signal(model, Control::Pause)
    }

    pub(crate) fn resume(&self, model: &ModelId) -> Result<()> {
        self.signal(model, Control::Run)
    }

    pub(crate) fn cancel(&self, model: &ModelId) -> Result<()> {
        self.signal(model, Control::Cancel)
    }

    fn signal(&self, model: &ModelId, control: Control) -> Result<()> {
        let jobs = self.jobs.lock();
        let job = jobs.get(model).ok_or(Error::NotFound)?;
        let _ = job.control.send(control);
        Ok(())
    }

    /// Wait until the model's migration reaches a terminal state.
    pub(crate) async fn await_terminal(&self, model: &ModelId) -> Result<MigrationStatus> {
        let mut status = {
            let jobs = self.jobs.lock();
            jobs.get(model).ok_or(Error::NotFound)?.status.clone()
        };
        let terminal = status
            .wait_for(|s| {
                matches!(s.state, MigrationState::Idle | MigrationState::Canceled)
            })
            .await
            .map_err(|_| Error::Migration {
                model: model.clone(),
                reason: "migration task ended without reporting a terminal state".into(),
            })?;
        Ok(terminal.clone())
    }
}

async fn run_model(
    substrate: &Arc<Substrate>,
    migration: &MigrationConfig,
    backoff: &BackoffConfig,
    ctx: &MigrationContext,
    handler: &dyn MigrationHandler,
    status: &watch::Sender<MigrationStatus>,
    control: &mut watch::Receiver<Control>,
) -> Result<()> {
    let token = lease::acquire(
        substrate,
        &ctx.model,
        migration.lease_ttl,
        backoff,
        migration.lease_max_attempts,
    )
    .await;
    let token = match token {
        Ok(token) => token,
        Err(error) => return park(substrate, ctx, status, None, error),
    };

    let mut attempts: u32 = 0;
    loop {
        // Pause and cancel are honored between attempts.
        if wait_for_run(control, status).await == Control::Cancel {
            let error = Error::Migration {
                model: ctx.model.clone(),
                reason: "migration canceled".into(),
            };
            return park(substrate, ctx, status, Some(token), error);
        }
        if let Err(error) = lease::renew(substrate, &ctx.model, token, migration.lease_ttl) {
            return park(substrate, ctx, status, None, error);
        }

        attempts += 1;
        status.send_modify(|s| {
            s.state = MigrationState::Running;
            s.attempts = attempts;
        });
        tracing::info!(
            model = %ctx.model,
            from = ctx.from_version,
            to = ctx.to_version,
            attempts,
            "running migration"
        );

        let outcome = match handler.migrate(ctx) {
            MigrationOutcome::Success => handler.verify(ctx),
            other => other,
        };
        match outcome {
            MigrationOutcome::Success => {
                if let Err(error) = write_version(substrate, &ctx.model, ctx.to_version) {
                    return park(substrate, ctx, status, Some(token), error);
                }
                let _ = lease::release(substrate, &ctx.model, token);
                status.send_modify(|s| {
                    s.state = MigrationState::Idle;
                    s.last_error = None;
                });
                tracing::info!(model = %ctx.model, to = ctx.to_version, "migration complete");
                return Ok(());
            }
            MigrationOutcome::Retry { after } => {
                if attempts >= migration.max_attempts {
                    let error = Error::Migration {
                        model: ctx.model.clone(),
                        reason: format!("retry budget exhausted after {attempts} attempts"),
                    };
                    return park(substrate, ctx, status, Some(token), error);
                }
                tracing::warn!(model = %ctx.model, attempts, ?after, "migration retrying");
                tokio::time::sleep(after).await;
            }
            MigrationOutcome::Fatal(reason) => {
                let error = Error::Migration {
                    model: ctx.model.clone(),
                    reason,
                };
                return park(substrate, ctx, status, Some(token), error);
            }
        }
    }
}

async fn wait_for_run(
    control: &mut watch::Receiver<Control>,
    status: &watch::Sender<MigrationStatus>,
) -> Control {
    loop {
        // Copy the value out so the watch borrow ends before any await.
        let current = *control.borrow_and_update();
        match current {
            Control::Run => return Control::Run,
            Control::Cancel => return Control::Cancel,
            Control::Pause => {
                status.send_modify(|s| s.state = MigrationState::Paused);
                tracing::info!("migration paused");
                // Sender dropping means the engine is gone; stop.
                if control.changed().await.is_err() {
                    return Control::Cancel;
                }
            }
        }
    }
}

/// Park a failed or canceled migration and surface the error.
fn park(
    substrate: &Substrate,
    ctx: &MigrationContext,
    status: &watch::Sender<MigrationStatus>,
    token: Option<uuid::Uuid>,
    error: Error,
) -> Result<()> {
    status.send_modify(|s| {
        s.state = MigrationState::Canceled;
        s.last_error = Some(error.to_string());
    });
    tracing::error!(model = %ctx.model, %error, "migration parked");
    if let Some(token) = token {
        let _ = lease::release(substrate, &ctx.model, token);
    }
    Err(error)
}
