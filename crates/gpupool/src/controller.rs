//! Controller wiring: watches feeding the work queue, worker tasks
//! draining it, and the startup sequence.
//!
//! Watches map cluster events to pool keys. The pool name uniqueness
//! invariant (enforced by pool admission) is what lets a bare pool name on
//! a device annotation or validator pod label resolve to one pool.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use tracing::{debug, error, info, warn};

use crate::api::{
    ClusterGPUPool, GPUDevice, GPUPool, ModuleConfig, ASSIGNMENT_ANNOTATION,
    CLUSTER_ASSIGNMENT_ANNOTATION, POOL_NAME_LABEL, POOL_SCOPE_LABEL, VALIDATOR_APP,
    VALIDATOR_POOL_LABEL,
};
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::config::Config;
use crate::moduleconfig::SettingsStore;
use crate::pool::{PoolKey, PoolScope};
use crate::queue::{work_queue, QueueReceiver, WorkQueue};
use crate::reconcile::Reconciler;

/// Hard ceiling on the initial listing of pools.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Runs the controller until the process stops. The webhook server runs
/// separately; both share the settings store.
pub async fn start(client: Client, settings: SettingsStore, config: &Config) -> anyhow::Result<()> {
    let (queue, receiver) = work_queue();

    info!("listing pools for the initial sync");
    tokio::time::timeout(CACHE_SYNC_TIMEOUT, enqueue_all_pools(&client, &queue))
        .await
        .map_err(|_| anyhow::anyhow!("initial pool sync did not finish within 10 minutes"))??;

    tokio::spawn(watch_cluster_pools(client.clone(), queue.clone()));
    tokio::spawn(watch_namespaced_pools(client.clone(), queue.clone()));
    tokio::spawn(watch_devices(client.clone(), queue.clone()));
    tokio::spawn(watch_validator_pods(client.clone(), queue.clone()));
    tokio::spawn(watch_workload_pods(client.clone(), queue.clone()));
    tokio::spawn(watch_module_config(
        client.clone(),
        settings.clone(),
        queue.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(client, settings));
    let workers = config.workers.max(1);
    info!(workers, "starting reconcile workers");
    let mut tasks = Vec::with_capacity(workers);
    for id in 0..workers {
        tasks.push(tokio::spawn(worker(
            id,
            Arc::clone(&reconciler),
            receiver.clone(),
            queue.clone(),
        )));
    }
    futures::future::try_join_all(tasks).await?;
    Ok(())
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    receiver: QueueReceiver,
    queue: WorkQueue,
) {
    let mut backoff = ExponentialBackoffStrategy::default();
    while let Some(key) = receiver.next().await {
        debug!(worker = id, pool = %key, "reconciling");
        let result = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
        queue.finish(&key);
        match result {
            Ok(Ok(outcome)) => {
                backoff.reset();
                if let Some(after) = outcome.requeue_after {
                    queue.enqueue_after(key, after);
                } else if outcome.requeue {
                    queue.enqueue(key);
                }
            }
            Ok(Err(e)) => {
                let delay = backoff.next_duration();
                error!(worker = id, pool = %key, error = %e, ?delay, "reconcile failed");
                queue.enqueue_after(key, delay);
            }
            Err(_panic) => {
                let delay = backoff.next_duration();
                error!(worker = id, pool = %key, ?delay, "reconcile panicked, recovering");
                queue.enqueue_after(key, delay);
            }
        }
    }
}

async fn enqueue_all_pools(client: &Client, queue: &WorkQueue) -> anyhow::Result<()> {
    let cluster_pools: Api<ClusterGPUPool> = Api::all(client.clone());
    for pool in cluster_pools.list(&ListParams::default()).await?.items {
        queue.enqueue(PoolKey::cluster(&pool.name()));
    }
    let pools: Api<GPUPool> = Api::all(client.clone());
    for pool in pools.list(&ListParams::default()).await?.items {
        let namespace = pool.namespace().unwrap_or_else(|| "default".to_string());
        queue.enqueue(PoolKey::namespaced(&namespace, &pool.name()));
    }
    Ok(())
}

/// Looks a bare pool name up as a namespaced pool. Names are unique, so
/// one hit is all there can be.
async fn resolve_namespaced(client: &Client, name: &str) -> Option<PoolKey> {
    let api: Api<GPUPool> = Api::all(client.clone());
    let params = ListParams::default().fields(&format!("metadata.name={}", name));
    match api.list(&params).await {
        Ok(list) => list.items.first().map(|pool| {
            let namespace = pool.namespace().unwrap_or_else(|| "default".to_string());
            PoolKey::namespaced(&namespace, name)
        }),
        Err(e) => {
            warn!(pool = name, error = %e, "cannot resolve namespaced pool, skipping enqueue");
            None
        }
    }
}

async fn watch_cluster_pools(client: Client, queue: WorkQueue) {
    let api: Api<ClusterGPUPool> = Api::all(client);
    let mut stream = watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(pool)) | Ok(Event::Deleted(pool)) => {
                queue.enqueue(PoolKey::cluster(&pool.name()));
            }
            Ok(Event::Restarted(pools)) => {
                for pool in pools {
                    queue.enqueue(PoolKey::cluster(&pool.name()));
                }
            }
            Err(e) => warn!(error = %e, "cluster pool watch error"),
        }
    }
}

async fn watch_namespaced_pools(client: Client, queue: WorkQueue) {
    let api: Api<GPUPool> = Api::all(client);
    let mut stream = watcher(api, ListParams::default()).boxed();
    let enqueue = |pool: GPUPool| {
        let namespace = pool.namespace().unwrap_or_else(|| "default".to_string());
        queue.enqueue(PoolKey::namespaced(&namespace, &pool.name()));
    };
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(pool)) | Ok(Event::Deleted(pool)) => enqueue(pool),
            Ok(Event::Restarted(pools)) => pools.into_iter().for_each(&enqueue),
            Err(e) => warn!(error = %e, "pool watch error"),
        }
    }
}

/// Pools a device event concerns: its assignment annotations (either
/// scope) and its reflected poolRef. A poolRef without a namespace may be
/// a cluster pool or a legacy namespaced ref, so both readings enqueue.
async fn device_keys(client: &Client, device: &GPUDevice) -> Vec<PoolKey> {
    let mut keys = Vec::new();
    if let Some(name) = device.assignment(CLUSTER_ASSIGNMENT_ANNOTATION) {
        keys.push(PoolKey::cluster(name));
    }
    if let Some(name) = device.assignment(ASSIGNMENT_ANNOTATION) {
        if let Some(key) = resolve_namespaced(client, name).await {
            keys.push(key);
        }
    }
    if let Some(pool_ref) = device.status.as_ref().and_then(|s| s.pool_ref.as_ref()) {
        match pool_ref.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => {
                keys.push(PoolKey::namespaced(namespace, &pool_ref.name));
            }
            _ => {
                keys.push(PoolKey::cluster(&pool_ref.name));
                if let Some(key) = resolve_namespaced(client, &pool_ref.name).await {
                    keys.push(key);
                }
            }
        }
    }
    keys.dedup();
    keys
}

async fn watch_devices(client: Client, queue: WorkQueue) {
    let api: Api<GPUDevice> = Api::all(client.clone());
    let mut stream = watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        let devices = match event {
            Ok(Event::Applied(device)) | Ok(Event::Deleted(device)) => vec![device],
            Ok(Event::Restarted(devices)) => devices,
            Err(e) => {
                warn!(error = %e, "device watch error");
                continue;
            }
        };
        for device in devices {
            for key in device_keys(&client, &device).await {
                queue.enqueue(key);
            }
        }
    }
}

async fn watch_validator_pods(client: Client, queue: WorkQueue) {
    let api: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().labels(&format!("app={}", VALIDATOR_APP));
    let mut stream = watcher(api, params).boxed();
    while let Some(event) = stream.next().await {
        let pods = match event {
            Ok(Event::Applied(pod)) | Ok(Event::Deleted(pod)) => vec![pod],
            Ok(Event::Restarted(pods)) => pods,
            Err(e) => {
                warn!(error = %e, "validator pod watch error");
                continue;
            }
        };
        for pod in pods {
            let name = match pod.labels().get(VALIDATOR_POOL_LABEL) {
                Some(name) => name.clone(),
                None => continue,
            };
            queue.enqueue(PoolKey::cluster(&name));
            if let Some(key) = resolve_namespaced(&client, &name).await {
                queue.enqueue(key);
            }
        }
    }
}

/// Workload pods carry the labels the defaulter stamped; the scope label
/// makes the key unambiguous.
async fn watch_workload_pods(client: Client, queue: WorkQueue) {
    let api: Api<Pod> = Api::all(client);
    let params = ListParams::default().labels(POOL_NAME_LABEL);
    let mut stream = watcher(api, params).boxed();
    while let Some(event) = stream.next().await {
        let pods = match event {
            Ok(Event::Applied(pod)) | Ok(Event::Deleted(pod)) => vec![pod],
            Ok(Event::Restarted(pods)) => pods,
            Err(e) => {
                warn!(error = %e, "workload pod watch error");
                continue;
            }
        };
        for pod in pods {
            let name = match pod.labels().get(POOL_NAME_LABEL) {
                Some(name) => name.clone(),
                None => continue,
            };
            let scope = pod
                .labels()
                .get(POOL_SCOPE_LABEL)
                .and_then(|s| s.parse::<PoolScope>().ok())
                .unwrap_or(PoolScope::Cluster);
            let key = match scope {
                PoolScope::Cluster => PoolKey::cluster(&name),
                PoolScope::Namespaced => {
                    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
                    PoolKey::namespaced(&namespace, &name)
                }
            };
            queue.enqueue(key);
        }
    }
}

async fn watch_module_config(client: Client, settings: SettingsStore, queue: WorkQueue) {
    let api: Api<ModuleConfig> = Api::all(client.clone());
    let mut stream = watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        let changed = match event {
            Ok(Event::Applied(config)) => settings.observe(&config),
            Ok(Event::Deleted(config)) => settings.observe_deleted(&config),
            Ok(Event::Restarted(configs)) => configs
                .iter()
                .map(|config| settings.observe(config))
                .fold(false, |acc, changed| acc || changed),
            Err(e) => {
                warn!(error = %e, "module config watch error");
                false
            }
        };
        if changed {
            info!("module settings changed, re-enqueueing every pool");
            if let Err(e) = enqueue_all_pools(&client, &queue).await {
                warn!(error = %e, "cannot re-enqueue pools after settings change");
            }
        }
    }
}
