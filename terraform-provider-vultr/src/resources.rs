//! Provider Resources
//!
//! Defines the resources that can be managed through the provider.

use crate::cancel::CancelToken;
use crate::client::{
    ClientError, Cluster, ClusterReq, ClusterReqUpdate, NodePool, NodePoolReq, NodePoolReqUpdate,
    VultrClient,
};
use crate::poller::{converge, Observation, PollSpec};
use crate::schema::{
    AttributeType, Diagnostic, NestedBlock, ResourceSchema, SchemaAttribute, SchemaBlock,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Result type for resource operations
pub type ResourceResult<T> = Result<T, Vec<Diagnostic>>;

/// A failed apply, with any state that must still be recorded
///
/// Set `partial_state` once the remote object exists, so the host keeps
/// tracking it even though the operation failed.
#[derive(Debug, Clone, Default)]
pub struct ApplyFailure {
    pub partial_state: Option<ResourceState>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyFailure {
    pub fn with_partial_state(state: ResourceState, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            partial_state: Some(state),
            diagnostics,
        }
    }
}

impl From<Vec<Diagnostic>> for ApplyFailure {
    fn from(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            partial_state: None,
            diagnostics,
        }
    }
}

/// Resource state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub values: HashMap<String, Value>,
}

impl ResourceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON object, `None` for anything else
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|obj| Self {
            values: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn require_id(&self) -> ResourceResult<String> {
        self.get_string("id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| vec![Diagnostic::error("Resource ID is required")])
    }
}

/// Readiness polling knobs for newly created clusters
#[derive(Debug, Clone)]
pub struct WaitSettings {
    /// Delay before the first status check
    pub delay: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
    /// Consecutive "not found" reads tolerated after creation
    pub not_found_checks: u32,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60 * 60),
            not_found_checks: 60,
        }
    }
}

/// Everything a resource operation needs from the configured provider
#[derive(Debug, Clone)]
pub struct ResourceContext {
    pub client: VultrClient,
    pub cancel: CancelToken,
    pub wait: WaitSettings,
}

/// Resource trait
#[async_trait]
pub trait Resource: Send + Sync {
    /// Resource type name
    fn type_name(&self) -> &str;

    /// Get the schema for this resource
    fn schema(&self) -> ResourceSchema;

    /// Create a new resource
    async fn create(
        &self,
        ctx: &ResourceContext,
        planned: &ResourceState,
    ) -> Result<ResourceState, ApplyFailure>;

    /// Read an existing resource; an empty state means it no longer exists
    async fn read(
        &self,
        ctx: &ResourceContext,
        current: &ResourceState,
    ) -> ResourceResult<ResourceState>;

    /// Update an existing resource
    async fn update(
        &self,
        ctx: &ResourceContext,
        current: &ResourceState,
        planned: &ResourceState,
    ) -> ResourceResult<ResourceState>;

    /// Delete a resource
    async fn delete(&self, ctx: &ResourceContext, current: &ResourceState) -> ResourceResult<()>;

    /// Plan changes
    fn plan_change(
        &self,
        current: Option<&ResourceState>,
        proposed: &ResourceState,
    ) -> ResourceResult<ResourceState> {
        let _ = current;
        Ok(proposed.clone())
    }

    /// Attributes whose planned change forces replacement
    fn requires_replace(&self, prior: &ResourceState, proposed: &ResourceState) -> Vec<String> {
        self.schema()
            .block
            .force_new_attributes()
            .into_iter()
            .filter(|name| prior.get(name) != proposed.get(name))
            .map(String::from)
            .collect()
    }
}

// ============================================================================
// Kubernetes Cluster Resource
// ============================================================================

/// Tag marking the node pool managed through the `node_pools` block
pub const DEFAULT_NODE_POOL_TAG: &str = "tf-vke-default";

const STATUS_ACTIVE: &str = "active";
const STATUS_PENDING: &str = "pending";

pub struct KubernetesResource;

impl KubernetesResource {
    pub fn new() -> Self {
        Self
    }

    fn node_pool_schema() -> SchemaBlock {
        let node = HashMap::from([
            ("id".to_string(), AttributeType::String),
            ("label".to_string(), AttributeType::String),
            ("status".to_string(), AttributeType::String),
            ("date_created".to_string(), AttributeType::String),
        ]);

        SchemaBlock::new()
            .with_attribute(
                "node_quantity",
                SchemaAttribute::number()
                    .with_description("Number of nodes in the pool")
                    .required(),
            )
            .with_attribute(
                "plan",
                SchemaAttribute::string()
                    .with_description("Plan ID used for every node (e.g., vc2-1c-2gb)")
                    .required(),
            )
            .with_attribute(
                "label",
                SchemaAttribute::string()
                    .with_description("Node pool label")
                    .required(),
            )
            .with_attribute(
                "auto_scaler",
                SchemaAttribute::bool()
                    .with_description("Enable the cluster autoscaler for this pool")
                    .optional()
                    .with_default(json!(false)),
            )
            .with_attribute("min_nodes", SchemaAttribute::number().optional())
            .with_attribute("max_nodes", SchemaAttribute::number().optional())
            .with_attribute("id", SchemaAttribute::string().computed())
            .with_attribute("date_created", SchemaAttribute::string().computed())
            .with_attribute("date_updated", SchemaAttribute::string().computed())
            .with_attribute("status", SchemaAttribute::string().computed())
            .with_attribute("tag", SchemaAttribute::string().computed())
            .with_attribute(
                "nodes",
                SchemaAttribute::list(AttributeType::Object(node)).computed(),
            )
    }

    fn ready_spec(wait: &WaitSettings) -> ResourceResult<PollSpec> {
        PollSpec::builder(STATUS_ACTIVE)
            .transient([STATUS_PENDING])
            .poll_interval(wait.delay)
            .min_interval(wait.min_interval)
            .max_interval(wait.max_interval)
            .timeout(wait.timeout)
            .not_found_retry_budget(wait.not_found_checks)
            .build()
            .map_err(|e| vec![Diagnostic::error(&format!("Invalid wait settings: {}", e))])
    }

    /// Block until the cluster reports `active`
    async fn wait_until_active(&self, ctx: &ResourceContext, id: &str) -> ResourceResult<Cluster> {
        info!("Waiting for kubernetes cluster ({}) to have status of {}", id, STATUS_ACTIVE);

        let spec = Self::ready_spec(&ctx.wait)?;
        let client = &ctx.client;

        converge(&ctx.cancel, &spec, || async move {
            let cluster = client.get_cluster(id).await?;
            info!("The kubernetes cluster status is {}", cluster.status);
            Ok::<_, ClientError>(Observation::new(cluster.status.clone(), cluster))
        })
        .await
        .map(|observation| observation.payload)
        .map_err(|e| {
            vec![Diagnostic::error(&format!(
                "Error while waiting for kubernetes cluster {} to be completed: {}",
                id, e
            ))]
        })
    }
}

impl Default for KubernetesResource {
    fn default() -> Self {
        Self::new()
    }
}

/// First element of a list-valued attribute, if any
fn first_block<'a>(state: &'a ResourceState, key: &str) -> Option<&'a Value> {
    state
        .get(key)
        .and_then(|v| v.as_array())
        .and_then(|items| items.first())
        .filter(|item| item.is_object())
}

fn block_u32(block: &Value, key: &str) -> Option<u32> {
    block
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|n| u32::try_from(n).ok())
}

fn block_str<'a>(block: &'a Value, key: &str) -> Option<&'a str> {
    block.get(key).and_then(|v| v.as_str())
}

/// Build a create request for the managed node pool
pub fn node_pool_request(block: &Value) -> ResourceResult<NodePoolReq> {
    let mut missing = Vec::new();
    let node_quantity = block_u32(block, "node_quantity");
    let plan = block_str(block, "plan");
    let label = block_str(block, "label");

    if node_quantity.is_none() {
        missing.push("node_quantity");
    }
    if plan.is_none() {
        missing.push("plan");
    }
    if label.is_none() {
        missing.push("label");
    }
    if !missing.is_empty() {
        return Err(missing
            .into_iter()
            .map(|field| Diagnostic::error(&format!("node_pools.{} is required", field)))
            .collect());
    }

    let auto_scaler = block.get("auto_scaler").and_then(|v| v.as_bool());
    Ok(NodePoolReq {
        node_quantity: node_quantity.unwrap_or_default(),
        label: label.unwrap_or_default().to_string(),
        plan: plan.unwrap_or_default().to_string(),
        tag: Some(DEFAULT_NODE_POOL_TAG.to_string()),
        auto_scaler,
        min_nodes: block_u32(block, "min_nodes"),
        max_nodes: block_u32(block, "max_nodes"),
    })
}

/// Build an update request; label, plan and tag are left untouched
pub fn node_pool_update(block: &Value) -> NodePoolReqUpdate {
    NodePoolReqUpdate {
        node_quantity: block_u32(block, "node_quantity"),
        auto_scaler: block.get("auto_scaler").and_then(|v| v.as_bool()),
        min_nodes: block_u32(block, "min_nodes"),
        max_nodes: block_u32(block, "max_nodes"),
    }
}

/// Whether the user-settable parts of two node pool blocks differ
fn node_pool_changed(old: &Value, new: &Value) -> bool {
    ["node_quantity", "auto_scaler", "min_nodes", "max_nodes"]
        .iter()
        .any(|key| old.get(key) != new.get(key))
}

pub fn flatten_node_pool(pool: &NodePool) -> Value {
    let nodes: Vec<Value> = pool
        .nodes
        .iter()
        .map(|node| {
            json!({
                "id": node.id,
                "status": node.status,
                "date_created": node.date_created,
                "label": node.label,
            })
        })
        .collect();

    json!([{
        "label": pool.label,
        "plan": pool.plan,
        "node_quantity": pool.node_quantity,
        "id": pool.id,
        "date_created": pool.date_created,
        "date_updated": pool.date_updated,
        "status": pool.status,
        "tag": pool.tag,
        "nodes": nodes,
        "auto_scaler": pool.auto_scaler,
        "min_nodes": pool.min_nodes,
        "max_nodes": pool.max_nodes,
    }])
}

/// Map a cluster and its kubeconfig onto resource state
pub fn cluster_state(cluster: &Cluster, kube_config: &str) -> ResourceState {
    let mut state = ResourceState::new();
    state.set("id", json!(cluster.id));
    state.set("label", json!(cluster.label));
    state.set("region", json!(cluster.region));
    state.set("version", json!(cluster.version));
    state.set("date_created", json!(cluster.date_created));
    state.set("cluster_subnet", json!(cluster.cluster_subnet));
    state.set("service_subnet", json!(cluster.service_subnet));
    state.set("ip", json!(cluster.ip));
    state.set("endpoint", json!(cluster.endpoint));
    state.set("status", json!(cluster.status));
    state.set("kube_config", json!(kube_config));

    let managed = cluster
        .node_pools
        .iter()
        .find(|pool| pool.tag == DEFAULT_NODE_POOL_TAG);
    state.set(
        "node_pools",
        managed.map(flatten_node_pool).unwrap_or_else(|| json!([])),
    );

    state
}

#[async_trait]
impl Resource for KubernetesResource {
    fn type_name(&self) -> &str {
        "vultr_kubernetes"
    }

    fn schema(&self) -> ResourceSchema {
        let block = SchemaBlock::new()
            .with_attribute(
                "label",
                SchemaAttribute::string()
                    .with_description("Cluster label")
                    .required(),
            )
            .with_attribute(
                "region",
                SchemaAttribute::string()
                    .with_description("Region ID where the cluster is deployed")
                    .required()
                    .force_new(),
            )
            .with_attribute(
                "version",
                SchemaAttribute::string()
                    .with_description("Kubernetes version (e.g., v1.28.2+1)")
                    .required()
                    .force_new(),
            )
            .with_attribute("id", SchemaAttribute::string().computed())
            .with_attribute("date_created", SchemaAttribute::string().computed())
            .with_attribute("cluster_subnet", SchemaAttribute::string().computed())
            .with_attribute("service_subnet", SchemaAttribute::string().computed())
            .with_attribute("ip", SchemaAttribute::string().computed())
            .with_attribute("endpoint", SchemaAttribute::string().computed())
            .with_attribute("status", SchemaAttribute::string().computed())
            .with_attribute(
                "kube_config",
                SchemaAttribute::string()
                    .with_description("Base64 encoded KubeConfig")
                    .computed()
                    .sensitive(),
            )
            .with_block(
                "node_pools",
                NestedBlock::list(Self::node_pool_schema()).with_max_items(1),
            )
            .with_description("Manages a Vultr Kubernetes Engine cluster");

        ResourceSchema::new(1, block)
    }

    async fn create(
        &self,
        ctx: &ResourceContext,
        planned: &ResourceState,
    ) -> Result<ResourceState, ApplyFailure> {
        let node_pools = match first_block(planned, "node_pools") {
            Some(block) => vec![node_pool_request(block)?],
            None => Vec::new(),
        };

        let request = ClusterReq {
            label: planned.get_string("label").unwrap_or_default(),
            region: planned.get_string("region").unwrap_or_default(),
            version: planned.get_string("version").unwrap_or_default(),
            node_pools,
        };

        let cluster = ctx.client.create_cluster(&request).await.map_err(|e| {
            vec![Diagnostic::error(&format!(
                "Error creating kubernetes cluster: {}",
                e
            ))]
        })?;
        info!("Created kubernetes cluster {}", cluster.id);

        // From here on the cluster exists, so failures still report its ID
        let mut current = ResourceState::new();
        current.set("id", json!(cluster.id));

        let read = match self.wait_until_active(ctx, &cluster.id).await {
            Ok(_) => self.read(ctx, &current).await,
            Err(diagnostics) => Err(diagnostics),
        };
        match read {
            Ok(state) if state.is_empty() => Err(ApplyFailure::from(vec![Diagnostic::error(
                &format!("Kubernetes cluster {} disappeared after creation", cluster.id),
            )])),
            Ok(state) => Ok(state),
            Err(diagnostics) => {
                warn!("Kubernetes cluster {} created but not ready", cluster.id);
                Err(ApplyFailure::with_partial_state(current, diagnostics))
            }
        }
    }

    async fn read(
        &self,
        ctx: &ResourceContext,
        current: &ResourceState,
    ) -> ResourceResult<ResourceState> {
        let id = current.require_id()?;

        let cluster = match ctx.client.get_cluster(&id).await {
            Ok(cluster) => cluster,
            Err(ClientError::Unauthorized(message)) => {
                return Err(vec![Diagnostic::error(&format!(
                    "API authorization error: {}",
                    message
                ))]);
            }
            Err(ClientError::NotFound(_)) => {
                warn!("Kubernetes cluster ({}) not found", id);
                return Ok(ResourceState::new());
            }
            Err(e) => {
                return Err(vec![Diagnostic::error(&format!(
                    "Error getting cluster ({}): {}",
                    id, e
                ))]);
            }
        };

        let config = ctx.client.get_kube_config(&id).await.map_err(|e| {
            vec![Diagnostic::error(&format!("Could not get kubeconfig: {}", e))]
        })?;

        Ok(cluster_state(&cluster, &config.kube_config))
    }

    async fn update(
        &self,
        ctx: &ResourceContext,
        current: &ResourceState,
        planned: &ResourceState,
    ) -> ResourceResult<ResourceState> {
        let id = current.require_id()?;

        let new_label = planned.get_string("label");
        if new_label.is_some() && new_label != current.get_string("label") {
            let request = ClusterReqUpdate {
                label: new_label.unwrap_or_default(),
            };
            ctx.client.update_cluster(&id, &request).await.map_err(|e| {
                vec![Diagnostic::error(&format!(
                    "Error updating VKE cluster ({}): {}",
                    id, e
                ))]
            })?;
        }

        match (
            first_block(current, "node_pools"),
            first_block(planned, "node_pools"),
        ) {
            (Some(old), Some(new)) if node_pool_changed(old, new) => {
                let pool_id = block_str(old, "id")
                    .or_else(|| block_str(new, "id"))
                    .unwrap_or_default();
                if pool_id.is_empty() {
                    return Err(vec![Diagnostic::error(
                        "Cannot update node pool without a known node pool ID",
                    )]);
                }
                ctx.client
                    .update_node_pool(&id, pool_id, &node_pool_update(new))
                    .await
                    .map_err(|e| {
                        vec![Diagnostic::error(&format!(
                            "Error updating VKE node pool {}: {}",
                            id, e
                        ))]
                    })?;
            }
            (Some(old), None) => {
                let Some(pool_id) = block_str(old, "id").filter(|pool_id| !pool_id.is_empty())
                else {
                    return Err(vec![Diagnostic::error(
                        "Cannot remove node pool without a known node pool ID",
                    )]);
                };
                match ctx.client.delete_node_pool(&id, pool_id).await {
                    Ok(()) | Err(ClientError::NotFound(_)) => {}
                    Err(e) => {
                        return Err(vec![Diagnostic::error(&format!(
                            "Error deleting VKE node pool {}: {}",
                            id, e
                        ))]);
                    }
                }
            }
            (None, Some(new)) => {
                let request = node_pool_request(new)?;
                ctx.client
                    .create_node_pool(&id, &request)
                    .await
                    .map_err(|e| {
                        vec![Diagnostic::error(&format!(
                            "Error creating VKE node pool {}: {}",
                            id, e
                        ))]
                    })?;
            }
            _ => {}
        }

        let state = self.read(ctx, current).await?;
        if state.is_empty() {
            return Err(vec![Diagnostic::error(&format!(
                "Kubernetes cluster {} disappeared during update",
                id
            ))]);
        }
        Ok(state)
    }

    async fn delete(&self, ctx: &ResourceContext, current: &ResourceState) -> ResourceResult<()> {
        let id = current.require_id()?;
        info!("Delete VKE: {}", id);

        match ctx.client.delete_cluster(&id).await {
            Ok(()) => Ok(()),
            Err(ClientError::NotFound(_)) => Ok(()), // Already deleted
            Err(e) => Err(vec![Diagnostic::error(&format!(
                "Error deleting VKE {}: {}",
                id, e
            ))]),
        }
    }
}

/// Get all available resources
pub fn get_all_resources() -> Vec<Box<dyn Resource>> {
    vec![Box::new(KubernetesResource::new())]
}
