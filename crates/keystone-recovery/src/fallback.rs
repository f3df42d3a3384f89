use crate::dependency::DependencyRegistry;
use keystone_core::{Annotated, KeystoneError, KeystoneResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

/// One rung of a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackStage {
    /// A registered dependency, called through its breaker and timeout.
    Provider { dependency: String },
    /// The last successful provider answer for the same request.
    Cache,
    /// A fixed value.
    Default { value: Value },
    /// An explicit degraded response; never fails.
    DegradedResponse { reason: String },
}

/// primary → secondary → cache → default → explicit degraded response.
///
/// The first stage that answers wins. Anything other than the first provider
/// comes back flagged as degraded.
pub struct FallbackChain {
    stages: Vec<FallbackStage>,
    cache: Mutex<HashMap<String, Value>>,
}

impl FallbackChain {
    pub fn new(stages: Vec<FallbackStage>) -> Self {
        Self {
            stages,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Standard chain shape over the given providers.
    pub fn standard(providers: &[&str], default: Option<Value>, reason: impl Into<String>) -> Self {
        let mut stages: Vec<FallbackStage> = providers
            .iter()
            .map(|p| FallbackStage::Provider {
                dependency: (*p).to_string(),
            })
            .collect();
        stages.push(FallbackStage::Cache);
        if let Some(value) = default {
            stages.push(FallbackStage::Default { value });
        }
        stages.push(FallbackStage::DegradedResponse {
            reason: reason.into(),
        });
        Self::new(stages)
    }

    pub fn stages(&self) -> &[FallbackStage] {
        &self.stages
    }

    pub async fn execute(
        &self,
        registry: &DependencyRegistry,
        request: &Value,
    ) -> KeystoneResult<Annotated<Value>> {
        let key = cache_key(request);
        let mut first_provider = true;
        let mut last_err: Option<KeystoneError> = None;

        for stage in &self.stages {
            match stage {
                FallbackStage::Provider { dependency } => {
                    let primary = first_provider;
                    first_provider = false;
                    match registry.probe(dependency, request).await {
                        Ok(answer) => {
                            self.cache.lock().insert(key.clone(), answer.value.clone());
                            if primary || answer.is_degraded() {
                                return Ok(answer);
                            }
                            info!(dependency = %dependency, "Served by fallback provider");
                            return Ok(Annotated::degraded(
                                answer.value,
                                format!("served by fallback provider '{dependency}'"),
                            ));
                        }
                        Err(e) => {
                            debug!(dependency = %dependency, error = %e, "Fallback stage failed");
                            last_err = Some(e);
                        }
                    }
                }
                FallbackStage::Cache => {
                    if let Some(value) = self.cache.lock().get(&key).cloned() {
                        info!("Served from cache");
                        return Ok(Annotated::degraded(value, "served from cache"));
                    }
                }
                FallbackStage::Default { value } => {
                    return Ok(Annotated::degraded(value.clone(), "default value"));
                }
                FallbackStage::DegradedResponse { reason } => {
                    return Ok(Annotated::degraded(
                        json!({ "degraded": true, "reason": reason }),
                        reason.clone(),
                    ));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| KeystoneError::Degraded("fallback chain exhausted".into())))
    }
}

fn cache_key(request: &Value) -> String {
    hex::encode(Sha256::digest(request.to_string().as_bytes()))
}
