//! # Autoflow Engine
//!
//! Runs approved execution plans against registered providers: resolves step
//! parameters from the trigger input and earlier step outputs, fetches the
//! plan owner's credentials, invokes providers with timeouts and bounded
//! retries, and records one log row per attempt.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use autoflow_engine::{
//!     CredentialVault, EngineSettings, ExecutionEngine, LogicProvider, MemoryCredentialRepository, MemoryRecorder,
//!     ProviderRegistry,
//! };
//! use autoflow_types::{ExecutionPlan, ExecutionStatus, RunSource};
//! use autoflow_util::SecretCipher;
//! use serde_json::json;
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! registry.register("logic", Arc::new(LogicProvider));
//! let cipher = SecretCipher::from_base64(&SecretCipher::generate_key())?;
//! let credentials = Arc::new(CredentialVault::new(MemoryCredentialRepository::new(), cipher));
//! let engine = ExecutionEngine::new(registry, credentials, Arc::new(MemoryRecorder::new()), EngineSettings::default());
//!
//! let plan: ExecutionPlan = serde_json::from_value(json!({
//!     "id": "greet",
//!     "user_id": "u1",
//!     "status": "approved",
//!     "steps": [
//!         {"order": 1, "provider": "logic", "action": "echo", "params": {"value": {"name": "${trigger.name}"}}},
//!         {"order": 2, "provider": "logic", "action": "template", "params": {"template": "Hello ${steps.1.output.name}"}}
//!     ]
//! }))?;
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let execution = runtime.block_on(engine.run(&plan, json!({"name": "Ada"}), RunSource::Manual))?;
//! assert_eq!(execution.status, ExecutionStatus::Success);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`credentials`**: Encrypted per-user credential store
//! - **`provider`**: Provider handler trait, registry and built-in providers
//! - **`templates`** / **`resolve`**: Reference parsing and parameter resolution
//! - **`condition`**: Boolean expressions for condition steps
//! - **`executor`**: The execution engine itself
//! - **`recorder`**: Execution and log persistence
//! - **`monitor`**: Live run events
//! - **`plans`**: Plan lookup and plan file loading

pub mod condition;
pub mod credentials;
pub mod executor;
pub mod monitor;
pub mod plans;
pub mod provider;
pub mod recorder;
pub mod resolve;
pub mod templates;

pub use credentials::{
    CredentialError, CredentialRepository, CredentialStore, CredentialVault, Credentials, FileCredentialRepository,
    MemoryCredentialRepository,
};
pub use executor::{EngineError, EngineSettings, ExecutionEngine, RetryPolicy, RunHandle, StepError, StepErrorClass};
pub use monitor::{RunEvent, RunMonitor};
pub use plans::{MemoryPlanRepository, PlanRepository, load_plan_directory, load_plan_file};
pub use provider::{
    HttpProvider, LogicProvider, ProviderHandler, ProviderNotFound, ProviderRegistry, WebhookProvider, register_builtin_providers,
};
pub use recorder::{ExecutionRecorder, JsonlRecorder, MemoryRecorder, RecorderError};
pub use resolve::{ResolutionError, RunContext, resolve_params, resolve_value};
