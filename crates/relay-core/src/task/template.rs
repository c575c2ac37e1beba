//! `<%= ... %>` templates used by HTTP and email tasks.
//!
//! Two tag forms are supported: `<%= Label.field %>` reads prior task
//! output, `<%= Secret: name %>` reads a named secret owned by the
//! rendering task.

use crate::application::context::RequestContext;
use crate::domain::definition::TaskId;
use crate::domain::instance::Instance;
use crate::CoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<%=\s*(.*?)\s*%>").expect("valid tag pattern"));

const SECRET_PREFIX: &str = "Secret:";

/// Text form of a value as it appears in rendered output
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a template against the instance state and the owner's secrets
pub async fn render(
    template: &str,
    owner: &TaskId,
    instance: &Instance,
    ctx: &RequestContext,
) -> Result<String, CoreError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in TAG.captures_iter(template) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let expr = expr.as_str();
        if let Some(name) = expr.strip_prefix(SECRET_PREFIX) {
            let name = name.trim();
            let secret = ctx
                .services
                .secrets
                .get_value(&owner.0, name)
                .await?
                .ok_or_else(|| {
                    CoreError::ConfigurationError(format!(
                        "Secret '{}' is not defined for task {}",
                        name, owner
                    ))
                })?;
            out.push_str(&secret);
        } else {
            let value = ctx.references.resolve(instance, expr).ok_or_else(|| {
                CoreError::TemplateError(format!("Unresolved reference '{}'", expr))
            })?;
            out.push_str(&display_value(&value));
        }
    }

    out.push_str(&template[last..]);
    Ok(out)
}
