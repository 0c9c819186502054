//! Engine entry point.
//!
//! A driver (watch loop, queue worker, test) calls [`Engine::reconcile`]
//! with an owner key. Each call is one level-triggered pass: read the
//! owner, converge at most one child, publish conditions, return.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use kube::Client;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::conditions::{
    aggregate_ready, blocking, new_condition, set_condition,
};
use crate::config::EngineConfig;
use crate::controller::{
    ConvergeContext, PassResult, controlplane, dataplane, gateway,
    release_children,
};
use crate::crd::{ControlPlane, DataPlane, ExtensionRef, Gateway};
use crate::ensure::EnsureResult;
use crate::error::ConvergeError;
use crate::owner::{Owner, OwnerKey, OwnerObject};
use crate::reduce::{PreDeleteHook, ReleaseFinalizer};
use crate::registry::TypeRegistry;
use crate::status::write_status;
use crate::store::{KubeStore, ObjectStore};

/// What a pass did, for the driver to decide when to come back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The owner no longer exists.
    OwnerGone,
    /// The owner is being deleted; held children were let go.
    Released { children: usize },
    /// One child changed and the pass stopped.
    Mutated {
        kind: String,
        role: &'static str,
        result: EnsureResult,
    },
    /// Nothing left to change.
    Converged { ready: bool, status_written: bool },
    /// The owner cannot converge until its spec (or the CA) changes.
    Blocked { reason: String, message: String },
}

#[derive(Clone)]
pub struct Engine {
    ctx: Arc<ConvergeContext>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<TypeRegistry>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(ConvergeContext {
                store,
                registry,
                cfg,
                hook: Arc::new(ReleaseFinalizer),
            }),
        }
    }

    /// Replace the pre-delete hook run before every child delete.
    pub fn with_hook(self, hook: Arc<dyn PreDeleteHook>) -> Self {
        let mut ctx = (*self.ctx).clone();
        ctx.hook = hook;
        Self { ctx: Arc::new(ctx) }
    }

    pub fn for_cluster(client: Client, cfg: EngineConfig) -> Self {
        Self::new(
            Arc::new(KubeStore::new(client)),
            Arc::new(TypeRegistry::builtin()),
            cfg,
        )
    }

    /// Cluster engine configured from the environment.
    pub async fn from_env() -> anyhow::Result<Self> {
        let cfg = EngineConfig::from_env()?;
        let client = Client::try_default().await?;
        info!(profile = %cfg.profile, "convergence engine ready");
        Ok(Self::for_cluster(client, cfg))
    }

    pub fn context(&self) -> &ConvergeContext {
        &self.ctx
    }

    /// Run one pass for `key`, bounded by the configured pass timeout and
    /// by `cancel`. Permanent failures are published on the owner and
    /// come back as [`ReconcileOutcome::Blocked`]; everything else that
    /// fails is returned for the driver to retry.
    #[instrument(skip(self, cancel), fields(owner = %key))]
    pub async fn reconcile(
        &self,
        key: &OwnerKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ConvergeError> {
        let deadline = self.ctx.cfg.pass_timeout();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConvergeError::Cancelled),
            res = tokio::time::timeout(deadline, self.pass(key)) => {
                res.unwrap_or(Err(ConvergeError::DeadlineExceeded(deadline)))
            }
        };
        match &outcome {
            Ok(o) => info!(outcome = ?o, "pass finished"),
            Err(e) => warn!(error = %e, tier = ?e.tier(), "pass failed"),
        }
        outcome
    }

    /// Reconcile a batch of owners, each key once, at most `concurrency`
    /// at a time.
    pub async fn reconcile_many(
        &self,
        keys: impl IntoIterator<Item = OwnerKey>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<(OwnerKey, Result<ReconcileOutcome, ConvergeError>)> {
        let keys: BTreeSet<OwnerKey> = keys.into_iter().collect();
        stream::iter(keys)
            .map(|key| async move {
                let res = self.reconcile(&key, cancel).await;
                (key, res)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    async fn pass(
        &self,
        key: &OwnerKey,
    ) -> Result<ReconcileOutcome, ConvergeError> {
        let ctx = self.ctx.as_ref();
        let ty = ctx.registry.lookup(key.kind.as_str())?;
        let Some(obj) = ctx
            .store
            .get(&ty.resource, Some(&key.namespace), &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::OwnerGone);
        };
        let observed = match Owner::from_dynamic(key.kind, obj) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "owner object unreadable");
                return Ok(ReconcileOutcome::Blocked {
                    reason: e.reason().to_string(),
                    message: e.to_string(),
                });
            }
        };
        let identity = observed.identity()?;
        if observed.is_deleting() {
            let children = release_children(ctx, &identity).await?;
            return Ok(ReconcileOutcome::Released { children });
        }

        let extensions: Vec<String> =
            observed.extensions().iter().map(ExtensionRef::key).collect();
        debug!(
            generation = identity.generation,
            ?extensions,
            "converging owner"
        );

        let mut updated = observed.clone();
        let result = match &mut updated {
            Owner::DataPlane(DataPlane { spec, status, .. }) => {
                let status = status.get_or_insert_with(Default::default);
                dataplane::converge(ctx, &identity, spec, status).await
            }
            Owner::ControlPlane(ControlPlane { spec, status, .. }) => {
                let status = status.get_or_insert_with(Default::default);
                controlplane::converge(ctx, &identity, spec, status).await
            }
            Owner::Gateway(Gateway { spec, status, .. }) => {
                let status = status.get_or_insert_with(Default::default);
                gateway::converge(ctx, &identity, spec, status).await
            }
        };

        let generation = identity.generation;
        let ready_type = key.kind.ready_condition();
        let pass = match result {
            Ok(pass) => pass,
            Err(e) if e.is_permanent() => {
                warn!(error = %e, "owner blocked");
                let mut blocked = observed.clone();
                set_condition(
                    blocked.conditions_mut(),
                    new_condition(
                        ready_type,
                        false,
                        e.reason(),
                        &e.to_string(),
                        generation,
                    ),
                );
                blocked.set_observed_generation(generation);
                write_status(ctx, &observed, &blocked).await?;
                return Ok(ReconcileOutcome::Blocked {
                    reason: e.reason().to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let ready = aggregate_ready(updated.conditions(), generation);
        let (reason, message) = if ready {
            ("Converged", String::new())
        } else {
            let waiting = blocking(updated.conditions(), generation);
            match &pass {
                // Steps without a condition of their own.
                PassResult::Mutated { kind, role, result }
                    if waiting.is_empty() =>
                {
                    ("Progressing", format!("{kind} {role} {}", result.as_str()))
                }
                PassResult::Mutated { .. } => {
                    ("Progressing", format!("waiting on {}", waiting.join(", ")))
                }
                PassResult::Converged => {
                    ("NotReady", format!("waiting on {}", waiting.join(", ")))
                }
            }
        };
        set_condition(
            updated.conditions_mut(),
            new_condition(ready_type, ready, reason, &message, generation),
        );
        updated.set_observed_generation(generation);
        let status_written = write_status(ctx, &observed, &updated).await?;

        Ok(match pass {
            PassResult::Mutated { kind, role, result } => {
                ReconcileOutcome::Mutated { kind, role, result }
            }
            PassResult::Converged => ReconcileOutcome::Converged {
                ready,
                status_written,
            },
        })
    }
}

/// When a kube-runtime driver should revisit the owner after `outcome`.
pub fn requeue_action(outcome: &ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::OwnerGone
        | ReconcileOutcome::Released { .. }
        | ReconcileOutcome::Blocked { .. } => Action::await_change(),
        ReconcileOutcome::Mutated { .. } => {
            Action::requeue(Duration::from_secs(1))
        }
        ReconcileOutcome::Converged { ready: false, .. } => {
            Action::requeue(Duration::from_secs(15))
        }
        ReconcileOutcome::Converged { ready: true, .. } => {
            Action::requeue(Duration::from_secs(300))
        }
    }
}

/// Backoff after a failed pass.
pub fn error_action(err: &ConvergeError) -> Action {
    match err {
        ConvergeError::Conflict { .. } => {
            Action::requeue(Duration::from_millis(500))
        }
        e if e.is_permanent() => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}
