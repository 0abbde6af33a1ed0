//! Late-bound expression resolution over spec templates.
//!
//! Spec fields may contain `{{ ... }}` expressions referencing the proxy
//! under construction, the spec itself, the authenticated user, and the
//! proxy's runtime values. Resolution is two-phase because the proxy's
//! final runtime values depend on the resolved spec while the spec's
//! expressions reference the proxy: phase one runs against pre-resolution
//! values, phase two against values computed from phase-one results.

use minijinja::{Environment, Value, context};

use super::access::AuthContext;
use super::errors::ProxyError;
use super::proxy::Proxy;
use super::spec::ProxySpec;

/// A snapshot of the expression context, built once per resolution phase.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    value: Value,
}

impl ResolutionContext {
    /// Build the context from the proxy under construction, the spec, and
    /// the authenticated user.
    #[must_use]
    pub fn build(proxy: &Proxy, spec: &ProxySpec, auth: Option<&AuthContext>) -> Self {
        let runtime_values: std::collections::BTreeMap<&str, String> = proxy
            .runtime_values
            .values()
            .map(|v| (v.key_id.as_str(), v.value_as_string()))
            .collect();

        let value = context! {
            proxy => Value::from_serialize(proxy),
            spec => Value::from_serialize(spec),
            user => Value::from_serialize(&auth),
            runtime_values => Value::from_serialize(&runtime_values),
        };
        Self { value }
    }
}

/// Renders spec templates against a [`ResolutionContext`].
#[derive(Debug)]
pub struct SpecResolver {
    env: Environment<'static>,
}

impl SpecResolver {
    /// Create a resolver with default template syntax
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Unknown context keys render as errors, not silent empty strings
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render a single template string.
    ///
    /// Plain strings without template markers pass through untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SpecResolutionFailed`] when rendering fails.
    pub fn resolve_str(
        &self,
        spec_id: &str,
        template: &str,
        ctx: &ResolutionContext,
    ) -> Result<String, ProxyError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_owned());
        }

        self.env
            .render_str(template, &ctx.value)
            .map_err(|e| ProxyError::SpecResolutionFailed {
                spec_id: spec_id.to_owned(),
                reason: e.to_string(),
            })
    }
}

impl Default for SpecResolver {
    fn default() -> Self {
        Self::new()
    }
}
