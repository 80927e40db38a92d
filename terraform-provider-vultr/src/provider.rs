//! Provider Implementation
//!
//! Implements the JSON-RPC plugin protocol for the Vultr provider.

use crate::cancel::CancellationSource;
use crate::client::{VultrClient, DEFAULT_ENDPOINT};
use crate::resources::{
    get_all_resources, ApplyFailure, Resource, ResourceContext, ResourceState, WaitSettings,
};
use crate::schema::{
    Diagnostic, ProviderSchema, RpcRequest, RpcResponse, SchemaAttribute, SchemaBlock,
    INTERNAL_ERROR, METHOD_NOT_FOUND, PARSE_ERROR,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::{mpsc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

pub const API_KEY_ENV: &str = "VULTR_API_KEY";
pub const ENDPOINT_ENV: &str = "VULTR_ENDPOINT";

/// Provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub create_timeout_minutes: Option<u64>,
}

/// Configuration after environment fallbacks and defaults
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub api_key: String,
    pub endpoint: String,
    pub create_timeout: Duration,
}

impl ProviderConfig {
    /// Fill unset fields from `env` and defaults
    pub fn resolve<F>(&self, env: F) -> Result<ResolvedConfig, Diagnostic>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = self
            .api_key
            .clone()
            .or_else(|| env(API_KEY_ENV))
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                Diagnostic::error("api_key is required")
                    .with_detail(&format!("Set api_key in the provider block or {}", API_KEY_ENV))
            })?;

        let endpoint = self
            .endpoint
            .clone()
            .or_else(|| env(ENDPOINT_ENV))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let create_timeout = match self.create_timeout_minutes {
            Some(0) => return Err(Diagnostic::error("create_timeout_minutes must be positive")),
            Some(minutes) => minutes
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    Diagnostic::error("create_timeout_minutes is too large")
                        .with_detail(&format!("Got {} minutes", minutes))
                })?,
            None => WaitSettings::default().timeout,
        };

        Ok(ResolvedConfig {
            api_key,
            endpoint,
            create_timeout,
        })
    }
}

/// Vultr Provider
pub struct VultrProvider {
    context: RwLock<Option<ResourceContext>>,
    resources: HashMap<String, Box<dyn Resource>>,
    cancellation: CancellationSource,
    runtime: Runtime,
}

impl VultrProvider {
    /// Create a new provider
    pub fn new() -> std::io::Result<Self> {
        let resources: HashMap<String, Box<dyn Resource>> = get_all_resources()
            .into_iter()
            .map(|r| (r.type_name().to_string(), r))
            .collect();

        Ok(Self {
            context: RwLock::new(None),
            resources,
            cancellation: CancellationSource::new(),
            runtime: Runtime::new()?,
        })
    }

    /// Cancel in-flight operations on SIGINT/SIGTERM
    pub fn listen_for_signals(&self) {
        let cancellation = self.cancellation.clone();
        self.runtime
            .spawn(async move { cancellation.cancel_on_signal().await });
    }

    /// Get provider schema
    fn get_schema(&self) -> ProviderSchema {
        let provider_block = SchemaBlock::new()
            .with_attribute(
                "api_key",
                SchemaAttribute::string()
                    .with_description("Vultr API key (falls back to VULTR_API_KEY)")
                    .optional()
                    .sensitive(),
            )
            .with_attribute(
                "endpoint",
                SchemaAttribute::string()
                    .with_description("Vultr API endpoint (falls back to VULTR_ENDPOINT)")
                    .optional()
                    .with_default(json!(DEFAULT_ENDPOINT)),
            )
            .with_attribute(
                "create_timeout_minutes",
                SchemaAttribute::number()
                    .with_description("How long to wait for a new cluster to become active")
                    .optional()
                    .with_default(json!(60)),
            )
            .with_description("Vultr cloud provider");

        self.resources
            .iter()
            .fold(ProviderSchema::new(provider_block), |schema, (name, resource)| {
                schema.with_resource(name, resource.schema())
            })
    }

    /// Configure the provider
    fn configure(&self, config: ProviderConfig) -> Vec<Diagnostic> {
        let resolved = match config.resolve(|key| std::env::var(key).ok()) {
            Ok(resolved) => resolved,
            Err(diag) => return vec![diag],
        };

        let client = match VultrClient::new(&resolved.endpoint, &resolved.api_key) {
            Ok(client) => client,
            Err(e) => return vec![Diagnostic::error(&format!("Failed to create client: {}", e))],
        };

        let wait = WaitSettings {
            timeout: resolved.create_timeout,
            ..WaitSettings::default()
        };

        info!("Provider configured for {}", resolved.endpoint);
        *self.context.write().unwrap_or_else(|e| e.into_inner()) = Some(ResourceContext {
            client,
            cancel: self.cancellation.token(),
            wait,
        });

        Vec::new()
    }

    /// Get the configured resource context
    fn get_context(&self) -> Result<ResourceContext, Diagnostic> {
        self.context
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Diagnostic::error("Provider not configured"))
    }

    /// Look up the resource named by `params.type_name`
    fn get_resource(&self, params: &Value) -> Result<&dyn Resource, Diagnostic> {
        let type_name = params
            .get("type_name")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        self.resources
            .get(type_name)
            .map(|r| r.as_ref())
            .ok_or_else(|| Diagnostic::error(&format!("Unknown resource type: {}", type_name)))
    }

    /// Answer requests read line by line from `input` until it closes
    ///
    /// Requests run one at a time on a worker thread. `StopProvider` is
    /// answered by the reader as soon as it arrives, so it reaches a wait that
    /// is still running. Responses may come back out of order; callers match
    /// them by id.
    pub fn serve<R, W>(&self, input: R, output: W) -> io::Result<()>
    where
        R: BufRead,
        W: Write + Send,
    {
        let output = Mutex::new(output);
        let output = &output;

        thread::scope(|scope| {
            let (requests, pending) = mpsc::channel::<String>();

            let worker = scope.spawn(move || -> io::Result<()> {
                for request in pending {
                    write_line(output, &self.handle_request(&request))?;
                }
                Ok(())
            });

            let read = self.dispatch_lines(input, output, &requests);
            drop(requests);

            let worker = worker
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("request worker panicked")));
            read.and(worker)
        })
    }

    /// Read requests, answering `StopProvider` inline and queueing the rest
    fn dispatch_lines<R, W>(
        &self,
        input: R,
        output: &Mutex<W>,
        requests: &mpsc::Sender<String>,
    ) -> io::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if is_stop_request(&line) {
                write_line(output, &self.handle_request(&line))?;
            } else if requests.send(line).is_err() {
                // Worker gone; its error surfaces on join
                break;
            }
        }
        Ok(())
    }

    /// Handle an RPC request
    pub fn handle_request(&self, input: &str) -> String {
        let request: RpcRequest = match serde_json::from_str(input) {
            Ok(r) => r,
            Err(e) => {
                return serde_json::to_string(&RpcResponse::error(
                    0,
                    PARSE_ERROR,
                    &format!("Parse error: {}", e),
                ))
                .unwrap_or_default();
            }
        };

        debug!("Handling {}", request.method);
        let response = match request.method.as_str() {
            "GetProviderSchema" => self.handle_get_schema(request.id),
            "ConfigureProvider" => self.handle_configure(request.id, &request.params),
            "ValidateResourceConfig" => self.handle_validate_resource(request.id, &request.params),
            "PlanResourceChange" => self.handle_plan_resource(request.id, &request.params),
            "ApplyResourceChange" => self.handle_apply_resource(request.id, &request.params),
            "ReadResource" => self.handle_read_resource(request.id, &request.params),
            "ImportResourceState" => self.handle_import_resource(request.id, &request.params),
            "StopProvider" => {
                warn!("Stop requested, cancelling in-flight operations");
                self.cancellation.cancel();
                RpcResponse::success(request.id, json!({}))
            }
            _ => RpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                &format!("Method not found: {}", request.method),
            ),
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            serde_json::to_string(&RpcResponse::error(
                request.id,
                INTERNAL_ERROR,
                &format!("Serialization error: {}", e),
            ))
            .unwrap_or_default()
        })
    }

    /// Handle GetProviderSchema
    fn handle_get_schema(&self, id: i64) -> RpcResponse {
        match serde_json::to_value(self.get_schema()) {
            Ok(schema) => RpcResponse::success(id, schema),
            Err(e) => RpcResponse::error(id, INTERNAL_ERROR, &e.to_string()),
        }
    }

    /// Handle ConfigureProvider
    fn handle_configure(&self, id: i64, params: &Value) -> RpcResponse {
        let config: ProviderConfig = match params.get("config") {
            Some(c) if !c.is_null() => match serde_json::from_value(c.clone()) {
                Ok(config) => config,
                Err(e) => {
                    return RpcResponse::diagnostics(
                        id,
                        vec![Diagnostic::error(&format!("Invalid provider config: {}", e))],
                    );
                }
            },
            _ => ProviderConfig::default(),
        };

        RpcResponse::diagnostics(id, self.configure(config))
    }

    /// Handle ValidateResourceConfig
    fn handle_validate_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let config = params
            .get("config")
            .and_then(ResourceState::from_value)
            .unwrap_or_default();

        // Required attributes must be present; unknown values are left to apply time
        let schema = resource.schema();
        let mut diagnostics: Vec<Diagnostic> = schema
            .block
            .attributes
            .iter()
            .filter(|(name, attr)| attr.required && config.get(name).is_none())
            .map(|(name, _)| Diagnostic::error(&format!("Missing required attribute: {}", name)))
            .collect();
        diagnostics.sort_by(|a, b| a.summary.cmp(&b.summary));

        RpcResponse::diagnostics(id, diagnostics)
    }

    /// Handle PlanResourceChange
    fn handle_plan_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let proposed_state = params
            .get("proposed_new_state")
            .and_then(ResourceState::from_value)
            .unwrap_or_default();

        let prior_state = params.get("prior_state").and_then(ResourceState::from_value);

        let requires_replace = prior_state
            .as_ref()
            .map(|prior| resource.requires_replace(prior, &proposed_state))
            .unwrap_or_default();

        match resource.plan_change(prior_state.as_ref(), &proposed_state) {
            Ok(planned) => RpcResponse::success(
                id,
                json!({
                    "planned_state": planned.values,
                    "requires_replace": requires_replace,
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, diagnostics),
        }
    }

    /// Handle ApplyResourceChange
    fn handle_apply_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let ctx = match self.get_context() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let planned_state = params.get("planned_state").and_then(ResourceState::from_value);
        let prior_state = params.get("prior_state").and_then(ResourceState::from_value);

        let result: Result<Option<ResourceState>, ApplyFailure> = self.runtime.block_on(async {
            match (prior_state, planned_state) {
                (Some(prior), None) => resource
                    .delete(&ctx, &prior)
                    .await
                    .map(|_| None)
                    .map_err(ApplyFailure::from),
                (None, None) => Ok(None),
                (None, Some(planned)) => resource.create(&ctx, &planned).await.map(Some),
                (Some(prior), Some(planned)) => resource
                    .update(&ctx, &prior, &planned)
                    .await
                    .map(Some)
                    .map_err(ApplyFailure::from),
            }
        });

        match result {
            Ok(new_state) => RpcResponse::success(
                id,
                json!({
                    "new_state": new_state.map(|s| s.values),
                    "diagnostics": []
                }),
            ),
            // The object exists even though the apply failed, so hand its state back
            Err(ApplyFailure {
                partial_state: Some(partial),
                diagnostics,
            }) => RpcResponse::success(
                id,
                json!({
                    "new_state": partial.values,
                    "diagnostics": diagnostics
                }),
            ),
            Err(failure) => RpcResponse::diagnostics(id, failure.diagnostics),
        }
    }

    /// Handle ReadResource
    fn handle_read_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let ctx = match self.get_context() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let current_state = params
            .get("current_state")
            .and_then(ResourceState::from_value)
            .unwrap_or_default();

        let result = self
            .runtime
            .block_on(async { resource.read(&ctx, &current_state).await });

        match result {
            // An empty state tells the host the resource no longer exists
            Ok(state) if state.is_empty() => RpcResponse::success(
                id,
                json!({
                    "new_state": null,
                    "diagnostics": []
                }),
            ),
            Ok(state) => RpcResponse::success(
                id,
                json!({
                    "new_state": state.values,
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, diagnostics),
        }
    }

    /// Handle ImportResourceState
    fn handle_import_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let ctx = match self.get_context() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, vec![diag]),
        };

        let resource_id = params.get("id").and_then(|v| v.as_str()).unwrap_or("");

        let mut import_state = ResourceState::new();
        import_state.set("id", json!(resource_id));

        let result = self
            .runtime
            .block_on(async { resource.read(&ctx, &import_state).await });

        match result {
            Ok(state) if state.is_empty() => RpcResponse::diagnostics(
                id,
                vec![Diagnostic::error(&format!("Resource {} not found", resource_id))],
            ),
            Ok(state) => RpcResponse::success(
                id,
                json!({
                    "imported_resources": [{
                        "type_name": resource.type_name(),
                        "state": state.values
                    }],
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, diagnostics),
        }
    }
}

fn is_stop_request(line: &str) -> bool {
    serde_json::from_str::<RpcRequest>(line)
        .map(|request| request.method == "StopProvider")
        .unwrap_or(false)
}

fn write_line<W: Write>(output: &Mutex<W>, response: &str) -> io::Result<()> {
    let mut output = output.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(output, "{}", response)?;
    output.flush()
}
