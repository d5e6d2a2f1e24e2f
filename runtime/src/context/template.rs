use crate::context::RouteDefinition;
use conduit_core::ConfigError;
use conduit_core::environment::PropertyResolver;
use std::collections::HashMap;

/// A declared template parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParameter {
    name: String,
    required: bool,
    default_value: Option<String>,
}

impl TemplateParameter {
    /// The parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the parameter must be supplied.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    /// Value used when the parameter is not supplied.
    #[must_use]
    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }
}

/// A parameterised route.
///
/// Parameters are referenced as `{{name}}` anywhere placeholders are allowed
/// in the route. A parameter is mandatory unless it is declared optional or
/// has a default.
///
/// # Example
///
/// ```
/// use conduit_runtime::context::{RouteDefinition, RouteTemplate};
///
/// let template = RouteTemplate::new("myTemplate", RouteDefinition::new("direct:{{foo}}").to("mock:{{bar}}"))
///     .parameter("foo")
///     .parameter("bar");
///
/// let names: Vec<_> = template.parameters().iter().map(|p| p.name()).collect();
/// assert_eq!(names, vec!["foo", "bar"]);
/// ```
#[derive(Clone)]
pub struct RouteTemplate {
    id: String,
    parameters: Vec<TemplateParameter>,
    route: RouteDefinition,
}

impl RouteTemplate {
    /// Create template `id` over `route`.
    #[must_use]
    pub fn new(id: impl Into<String>, route: RouteDefinition) -> Self {
        Self {
            id: id.into(),
            parameters: Vec::new(),
            route,
        }
    }

    /// Declare a mandatory parameter.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(TemplateParameter {
            name: name.into(),
            required: true,
            default_value: None,
        });
        self
    }

    /// Declare an optional parameter.
    #[must_use]
    pub fn optional_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(TemplateParameter {
            name: name.into(),
            required: false,
            default_value: None,
        });
        self
    }

    /// Declare a parameter with a default value.
    #[must_use]
    pub fn parameter_with_default(mut self, name: impl Into<String>, default_value: impl Into<String>) -> Self {
        self.parameters.push(TemplateParameter {
            name: name.into(),
            required: false,
            default_value: Some(default_value.into()),
        });
        self
    }

    /// Template id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared parameters, in declaration order.
    #[must_use]
    pub fn parameters(&self) -> &[TemplateParameter] {
        &self.parameters
    }

    /// The route definition instances start from.
    #[must_use]
    pub const fn route(&self) -> &RouteDefinition {
        &self.route
    }

    /// Check `supplied` and merge in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTemplateParameters`] naming every
    /// missing mandatory parameter, comma separated, in declaration order.
    pub fn bind(&self, supplied: &HashMap<String, String>) -> Result<HashMap<String, String>, ConfigError> {
        let missing: Vec<&str> = self
            .parameters
            .iter()
            .filter(|parameter| {
                parameter.required && parameter.default_value.is_none() && !supplied.contains_key(&parameter.name)
            })
            .map(|parameter| parameter.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingTemplateParameters {
                template: self.id.clone(),
                parameters: missing.join(","),
            });
        }

        let mut bound = supplied.clone();
        for parameter in &self.parameters {
            if let Some(default_value) = &parameter.default_value {
                bound
                    .entry(parameter.name.clone())
                    .or_insert_with(|| default_value.clone());
            }
        }
        Ok(bound)
    }
}

/// Resolves template parameters first, then the context properties.
pub(crate) struct TemplateProperties<'a> {
    pub(crate) parameters: HashMap<String, String>,
    pub(crate) fallback: &'a dyn PropertyResolver,
}

impl PropertyResolver for TemplateProperties<'_> {
    fn property(&self, key: &str) -> Option<String> {
        self.parameters
            .get(key)
            .cloned()
            .or_else(|| self.fallback.property(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::environment::MapPropertyResolver;

    fn template() -> RouteTemplate {
        RouteTemplate::new("myTemplate", RouteDefinition::new("direct:{{foo}}").to("mock:{{bar}}"))
            .parameter("foo")
            .parameter("bar")
    }

    #[test]
    fn test_missing_parameters_listed_in_order() {
        let error = template().bind(&HashMap::new()).unwrap_err();

        assert_eq!(
            error.to_string(),
            "Route template myTemplate the following mandatory parameters must be provided: foo,bar"
        );
    }

    #[test]
    fn test_defaults_fill_unsupplied_parameters() {
        let template = template().parameter_with_default("level", "INFO").optional_parameter("extra");
        let supplied = HashMap::from([("foo".to_string(), "one".to_string()), ("bar".to_string(), "cheese".to_string())]);

        let bound = template.bind(&supplied).unwrap();

        assert_eq!(bound.get("level").map(String::as_str), Some("INFO"));
        assert!(!bound.contains_key("extra"));
    }

    #[test]
    fn test_parameters_shadow_context_properties() {
        let context = MapPropertyResolver::new().with("foo", "context").with("greeting", "hi");
        let properties = TemplateProperties {
            parameters: HashMap::from([("foo".to_string(), "template".to_string())]),
            fallback: &context,
        };

        assert_eq!(properties.resolve("{{foo}}-{{greeting}}").unwrap(), "template-hi");
    }
}
