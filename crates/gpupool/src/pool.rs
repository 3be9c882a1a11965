//! Scope polymorphism over the two pool kinds.
//!
//! Everything scope-dependent — resource prefix, assignment annotation,
//! node label/taint key, poolRef matching, ownership eligibility — derives
//! from the [`PoolScope`] tag so the rest of the crate never branches on
//! the concrete CRD type.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::error::ErrorResponse;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::api::{
    ClusterGPUPool, GPUPool, GPUPoolSpec, GPUPoolStatus, PoolRef, CLUSTER_GROUP, GROUP, VERSION,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolScope {
    Cluster,
    Namespaced,
}

impl PoolScope {
    /// Prefix of the exposed extended resource and of every node label and
    /// taint this pool places.
    pub fn prefix(&self) -> &'static str {
        match self {
            PoolScope::Cluster => CLUSTER_GROUP,
            PoolScope::Namespaced => GROUP,
        }
    }

    pub fn assignment_annotation(&self) -> &'static str {
        match self {
            PoolScope::Cluster => crate::api::CLUSTER_ASSIGNMENT_ANNOTATION,
            PoolScope::Namespaced => crate::api::ASSIGNMENT_ANNOTATION,
        }
    }

    /// Value of the `pool-scope` label the pod defaulter stamps.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolScope::Cluster => "cluster",
            PoolScope::Namespaced => "namespaced",
        }
    }
}

impl std::str::FromStr for PoolScope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "cluster" => Ok(PoolScope::Cluster),
            "namespaced" => Ok(PoolScope::Namespaced),
            _ => Err(()),
        }
    }
}

/// Parses an extended resource name into its pool reference. The cluster
/// prefix is checked first; both prefixes require an exact match up to the
/// slash.
pub fn parse_resource_name(name: &str) -> Option<(PoolScope, &str)> {
    if let Some(pool) = name.strip_prefix(&format!("{}/", CLUSTER_GROUP)) {
        return (!pool.is_empty()).then(|| (PoolScope::Cluster, pool));
    }
    if let Some(pool) = name.strip_prefix(&format!("{}/", GROUP)) {
        return (!pool.is_empty()).then(|| (PoolScope::Namespaced, pool));
    }
    None
}

/// Work-queue identity of a pool. Cluster pools carry no namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scope: PoolScope,
    pub namespace: Option<String>,
    pub name: String,
}

impl PoolKey {
    pub fn cluster(name: &str) -> Self {
        PoolKey {
            scope: PoolScope::Cluster,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        PoolKey {
            scope: PoolScope::Namespaced,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Node label (and taint) key `<prefix>/<pool>`.
    pub fn node_label_key(&self) -> String {
        format!("{}/{}", self.scope.prefix(), self.name)
    }

    /// Extended resource name the pool exposes. Same string as the node
    /// label key; the device plugin config keeps them aligned.
    pub fn resource_name(&self) -> String {
        self.node_label_key()
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "cluster:{}", self.name),
        }
    }
}

/// A pool of either scope, with uniform accessors, so the handlers never
/// branch on the concrete kind.
#[derive(Clone, Debug)]
pub enum PoolObject {
    Cluster(ClusterGPUPool),
    Namespaced(GPUPool),
}

impl PoolObject {
    pub fn scope(&self) -> PoolScope {
        match self {
            PoolObject::Cluster(_) => PoolScope::Cluster,
            PoolObject::Namespaced(_) => PoolScope::Namespaced,
        }
    }

    pub fn name(&self) -> String {
        match self {
            PoolObject::Cluster(p) => p.name(),
            PoolObject::Namespaced(p) => p.name(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            PoolObject::Cluster(_) => None,
            PoolObject::Namespaced(p) => p.namespace(),
        }
    }

    pub fn key(&self) -> PoolKey {
        PoolKey {
            scope: self.scope(),
            namespace: self.namespace(),
            name: self.name(),
        }
    }

    pub fn spec(&self) -> &GPUPoolSpec {
        match self {
            PoolObject::Cluster(p) => &p.spec.pool,
            PoolObject::Namespaced(p) => &p.spec,
        }
    }

    pub fn status(&self) -> Option<&GPUPoolStatus> {
        match self {
            PoolObject::Cluster(p) => p.status.as_ref(),
            PoolObject::Namespaced(p) => p.status.as_ref(),
        }
    }

    pub fn status_mut(&mut self) -> &mut GPUPoolStatus {
        match self {
            PoolObject::Cluster(p) => p.status.get_or_insert_with(Default::default),
            PoolObject::Namespaced(p) => p.status.get_or_insert_with(Default::default),
        }
    }

    pub fn uid(&self) -> Option<String> {
        match self {
            PoolObject::Cluster(p) => p.metadata.uid.clone(),
            PoolObject::Namespaced(p) => p.metadata.uid.clone(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            PoolObject::Cluster(_) => "ClusterGPUPool",
            PoolObject::Namespaced(_) => "GPUPool",
        }
    }

    /// Whether a device's `status.poolRef` points at this pool. Cluster
    /// pools only accept refs without a namespace; namespaced pools also
    /// accept the legacy empty-namespace form.
    pub fn matches_pool_ref(&self, pool_ref: &PoolRef) -> bool {
        if pool_ref.name != self.name() {
            return false;
        }
        let ref_ns = pool_ref.namespace.as_deref().unwrap_or("");
        match self {
            PoolObject::Cluster(_) => ref_ns.is_empty(),
            PoolObject::Namespaced(p) => {
                ref_ns.is_empty() || Some(ref_ns.to_string()) == p.namespace()
            }
        }
    }

    /// The poolRef to stamp on devices assigned to this pool.
    pub fn pool_ref(&self) -> PoolRef {
        PoolRef {
            name: self.name(),
            namespace: self.namespace(),
        }
    }

    /// Pools own rendered objects only when the namespaces line up: a
    /// namespaced pool owns objects in its own namespace, a cluster pool
    /// owns cluster-scoped objects. Everything else is garbage-collected
    /// explicitly by the renderer.
    pub fn owns_in_namespace(&self, target_namespace: &str) -> bool {
        match self {
            PoolObject::Cluster(_) => false,
            PoolObject::Namespaced(p) => p.namespace().as_deref() == Some(target_namespace),
        }
    }

    pub fn controller_owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid()?;
        Some(OwnerReference {
            api_version: format!("{}/{}", GROUP, VERSION),
            kind: self.kind_str().to_string(),
            name: self.name(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Fetches the pool behind a key. `Ok(None)` when it is gone — the
    /// reconcile then ends quietly.
    pub async fn get(client: &Client, key: &PoolKey) -> kube::Result<Option<PoolObject>> {
        let result = match key.scope {
            PoolScope::Cluster => {
                let api: Api<ClusterGPUPool> = Api::all(client.clone());
                api.get(&key.name).await.map(PoolObject::Cluster)
            }
            PoolScope::Namespaced => {
                let ns = key.namespace.as_deref().unwrap_or("default");
                let api: Api<GPUPool> = Api::namespaced(client.clone(), ns);
                api.get(&key.name).await.map(PoolObject::Namespaced)
            }
        };
        match result {
            Ok(pool) => Ok(Some(pool)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes the in-memory status back with a single merge patch. NotFound
    /// is swallowed; the pool may have been deleted mid-chain.
    pub async fn patch_status(&self, client: &Client) -> kube::Result<()> {
        let status = match self.status() {
            Some(status) => status,
            None => return Ok(()),
        };
        let patch = serde_json::json!({ "status": status });
        let result = match self {
            PoolObject::Cluster(p) => {
                let api: Api<ClusterGPUPool> = Api::all(client.clone());
                api.patch_status(&p.name(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
            PoolObject::Namespaced(p) => {
                let ns = p.namespace().unwrap_or_else(|| "default".to_string());
                let api: Api<GPUPool> = Api::namespaced(client.clone(), &ns);
                api.patch_status(&p.name(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::GPUPoolSpec;

    #[test]
    fn resource_name_parsing_prefers_cluster_prefix() {
        assert_eq!(
            parse_resource_name("cluster.gpu.deckhouse.io/shared"),
            Some((PoolScope::Cluster, "shared"))
        );
        assert_eq!(
            parse_resource_name("gpu.deckhouse.io/team-a"),
            Some((PoolScope::Namespaced, "team-a"))
        );
        assert_eq!(parse_resource_name("gpu.deckhouse.io/"), None);
        assert_eq!(parse_resource_name("nvidia.com/gpu"), None);
    }

    #[test]
    fn pool_ref_matching_per_scope() {
        let cluster = PoolObject::Cluster(ClusterGPUPool::new(
            "shared",
            crate::api::ClusterGPUPoolSpec {
                pool: GPUPoolSpec::default(),
            },
        ));
        let mut namespaced = GPUPool::new("team-a", GPUPoolSpec::default());
        namespaced.metadata.namespace = Some("ml".to_string());
        let namespaced = PoolObject::Namespaced(namespaced);

        let bare = |name: &str| PoolRef {
            name: name.to_string(),
            namespace: None,
        };
        assert!(cluster.matches_pool_ref(&bare("shared")));
        assert!(!cluster.matches_pool_ref(&PoolRef {
            name: "shared".into(),
            namespace: Some("ml".into()),
        }));
        // Legacy refs without a namespace still match a namespaced pool.
        assert!(namespaced.matches_pool_ref(&bare("team-a")));
        assert!(namespaced.matches_pool_ref(&PoolRef {
            name: "team-a".into(),
            namespace: Some("ml".into()),
        }));
        assert!(!namespaced.matches_pool_ref(&PoolRef {
            name: "team-a".into(),
            namespace: Some("other".into()),
        }));
    }

    #[test]
    fn node_label_key_uses_scope_prefix() {
        assert_eq!(
            PoolKey::cluster("shared").node_label_key(),
            "cluster.gpu.deckhouse.io/shared"
        );
        assert_eq!(
            PoolKey::namespaced("ml", "team-a").resource_name(),
            "gpu.deckhouse.io/team-a"
        );
    }
}
