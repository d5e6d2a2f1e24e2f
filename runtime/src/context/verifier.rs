//! Parameter and connectivity verification.
//!
//! Verification never fails with an error: it returns a
//! [`VerificationResult`] listing every problem found, each attributed to the
//! parameter keys involved, so tooling can report them all at once.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// What to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// Check parameter presence and values only.
    Parameters,
    /// Try to reach the remote system.
    Connectivity,
}

/// Overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// No problems found.
    Ok,
    /// At least one problem found.
    Error,
    /// The scope is not supported.
    Unsupported,
}

/// Kind of problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A required parameter is absent.
    MissingParameter,
    /// A parameter is not declared.
    UnknownParameter,
    /// A parameter value is not allowed.
    IllegalParameterValue,
    /// The connectivity check failed.
    Exception,
}

/// One problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationError {
    /// Kind of problem.
    pub code: ErrorCode,
    /// Human readable description.
    pub description: String,
    /// Parameters involved.
    pub parameter_keys: BTreeSet<String>,
}

/// Outcome of a verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// The verified scope.
    pub scope: Scope,
    /// Overall status.
    pub status: Status,
    /// Problems found, in parameter declaration order.
    pub errors: Vec<VerificationError>,
}

/// A declared parameter.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    name: String,
    required: bool,
    allowed: Option<Vec<String>>,
}

impl ParameterSpec {
    /// An optional parameter accepting any value.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            allowed: None,
        }
    }

    /// A required parameter accepting any value.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            required: true,
            ..Self::optional(name)
        }
    }

    /// Restrict the value to `allowed`, compared case-insensitively.
    #[must_use]
    pub fn one_of<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(allowed.into_iter().map(Into::into).collect());
        self
    }
}

type ConnectivityCheck = Arc<dyn Fn(&BTreeMap<String, Value>) -> Result<(), String> + Send + Sync>;

/// Verifies parameter maps against declared parameters.
///
/// # Example
///
/// ```
/// use conduit_runtime::context::verifier::{ErrorCode, ParameterSpec, ParameterVerifier, Scope, Status};
/// use serde_json::json;
/// use std::collections::BTreeMap;
///
/// let verifier = ParameterVerifier::new("rest")
///     .parameter(ParameterSpec::required("host"))
///     .parameter(ParameterSpec::required("method").one_of(["get", "post"]));
///
/// let params = BTreeMap::from([("host".to_string(), json!("http://localhost:8080"))]);
/// let result = verifier.verify(Scope::Parameters, &params);
///
/// assert_eq!(result.status, Status::Error);
/// assert_eq!(result.errors[0].code, ErrorCode::MissingParameter);
/// assert!(result.errors[0].parameter_keys.contains("method"));
/// ```
#[derive(Clone)]
pub struct ParameterVerifier {
    component: String,
    parameters: Vec<ParameterSpec>,
    connectivity: Option<ConnectivityCheck>,
}

impl ParameterVerifier {
    /// A verifier for `component` with no declared parameters.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            parameters: Vec::new(),
            connectivity: None,
        }
    }

    /// Declare a parameter.
    #[must_use]
    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Enable the connectivity scope.
    #[must_use]
    pub fn with_connectivity_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.connectivity = Some(Arc::new(check));
        self
    }

    /// Verify `params` in `scope`.
    #[must_use]
    pub fn verify(&self, scope: Scope, params: &BTreeMap<String, Value>) -> VerificationResult {
        let errors = match scope {
            Scope::Parameters => self.verify_parameters(params),
            Scope::Connectivity => {
                let Some(check) = &self.connectivity else {
                    return VerificationResult {
                        scope,
                        status: Status::Unsupported,
                        errors: Vec::new(),
                    };
                };
                let mut errors = self.verify_parameters(params);
                if errors.is_empty() {
                    if let Err(description) = check(params) {
                        errors.push(VerificationError {
                            code: ErrorCode::Exception,
                            description,
                            parameter_keys: BTreeSet::new(),
                        });
                    }
                }
                errors
            },
        };

        let status = if errors.is_empty() { Status::Ok } else { Status::Error };
        tracing::debug!(component = %self.component, ?scope, ?status, errors = errors.len(), "Verified parameters");
        VerificationResult { scope, status, errors }
    }

    fn verify_parameters(&self, params: &BTreeMap<String, Value>) -> Vec<VerificationError> {
        let mut errors = Vec::new();

        for spec in &self.parameters {
            match params.get(&spec.name) {
                None | Some(Value::Null) if spec.required => errors.push(VerificationError {
                    code: ErrorCode::MissingParameter,
                    description: format!("{} should be set", spec.name),
                    parameter_keys: BTreeSet::from([spec.name.clone()]),
                }),
                Some(value) => {
                    if let Some(allowed) = &spec.allowed {
                        let text = value_text(value);
                        if !allowed.iter().any(|candidate| candidate.eq_ignore_ascii_case(&text)) {
                            errors.push(VerificationError {
                                code: ErrorCode::IllegalParameterValue,
                                description: format!("{} has wrong value ({text}), allowed: {}", spec.name, allowed.join(", ")),
                                parameter_keys: BTreeSet::from([spec.name.clone()]),
                            });
                        }
                    }
                },
                None => {},
            }
        }

        for key in params.keys() {
            if !self.parameters.iter().any(|spec| &spec.name == key) {
                errors.push(VerificationError {
                    code: ErrorCode::UnknownParameter,
                    description: format!("Unknown option {key}"),
                    parameter_keys: BTreeSet::from([key.clone()]),
                });
            }
        }

        errors
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl fmt::Debug for ParameterVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterVerifier")
            .field("component", &self.component)
            .field("parameters", &self.parameters)
            .field("connectivity", &self.connectivity.is_some())
            .finish()
    }
}
