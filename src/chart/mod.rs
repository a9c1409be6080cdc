//! Manifest rendering and dynamic application.
//!
//! The renderer treats the template bundle as an opaque function from a
//! value tree to a list of cluster objects: merge values (per-call override
//! over operator base values over bundle defaults), render every template,
//! parse the multi-document output into dynamic objects, and create, update,
//! or delete them through the cluster's dynamic API. Kinds are resolved
//! through a cached discovery snapshot that is refreshed at most once per
//! failed lookup.

mod bundle;

pub use bundle::{ChartBundle, ChartTemplate};

use handlebars::Handlebars;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, Discovery};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Renderer errors.
#[derive(Debug, Error)]
pub enum ChartError {
    #[error("read template bundle: {0}")]
    Io(#[from] std::io::Error),

    #[error("template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    #[error("render template {name}: {source}")]
    Render {
        name: String,
        #[source]
        source: handlebars::RenderError,
    },

    #[error("decode manifest {name}: {message}")]
    Decode { name: String, message: String },

    #[error("fetch chart {reference}: {message}")]
    Fetch { reference: String, message: String },

    #[error("chart layer digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Kind still unknown after one discovery refresh.
    #[error("no API resource for {0}")]
    UnknownKind(String),

    #[error("cluster error: {0}")]
    Kube(#[from] kube::Error),
}

/// Renders the template bundle and applies the result to the cluster.
pub struct Renderer {
    registry: Handlebars<'static>,
    bundle: ChartBundle,
    base_values: serde_json::Value,
    namespace: String,
    client: Client,
    discovery: Mutex<Discovery>,
}

impl Renderer {
    /// Loads the bundle and the operator values file, and takes an initial
    /// discovery snapshot. Called once at startup; failures here are fatal.
    pub async fn new(
        client: Client,
        chart_path: &str,
        values_file: &str,
        namespace: &str,
    ) -> Result<Self, ChartError> {
        let bundle = ChartBundle::load(chart_path).await?;

        let values_path = std::path::Path::new(values_file);
        let base_values = if !values_file.is_empty() && values_path.is_file() {
            bundle::read_values_file(values_path)?
        } else {
            serde_json::json!({})
        };

        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        for template in &bundle.templates {
            registry
                .register_template_string(&template.name, &template.source)
                .map_err(|e| ChartError::Template {
                    name: template.name.clone(),
                    source: Box::new(e),
                })?;
        }

        let discovery = Discovery::new(client.clone()).run().await?;

        Ok(Self {
            registry,
            bundle,
            base_values,
            namespace: namespace.to_string(),
            client,
            discovery: Mutex::new(discovery),
        })
    }

    /// Renders the bundle with overrides and upserts every object, in render
    /// order. The first failing object aborts the rest of the call.
    pub async fn apply(
        &self,
        release_name: &str,
        overrides: &serde_json::Value,
    ) -> Result<(), ChartError> {
        let objects = self.render_objects(release_name, overrides)?;
        for object in objects {
            self.apply_object(object).await?;
        }
        Ok(())
    }

    /// Renders the bundle and deletes every object in reverse render order.
    /// Objects already gone count as deleted.
    pub async fn delete(
        &self,
        release_name: &str,
        overrides: &serde_json::Value,
    ) -> Result<(), ChartError> {
        let objects = self.render_objects(release_name, overrides)?;
        for object in objects.into_iter().rev() {
            self.delete_object(object).await?;
        }
        Ok(())
    }

    fn render_objects(
        &self,
        release_name: &str,
        overrides: &serde_json::Value,
    ) -> Result<Vec<DynamicObject>, ChartError> {
        let values = merge_values(&self.bundle.defaults, &self.base_values, overrides);
        let context = serde_json::json!({
            "release": { "name": release_name, "namespace": self.namespace },
            "values": values,
        });

        let mut objects = Vec::new();
        for template in &self.bundle.templates {
            let rendered =
                self.registry
                    .render(&template.name, &context)
                    .map_err(|e| ChartError::Render {
                        name: template.name.clone(),
                        source: e,
                    })?;
            parse_manifest_documents(&template.name, &rendered, &mut objects)?;
        }
        Ok(objects)
    }

    async fn apply_object(&self, mut object: DynamicObject) -> Result<(), ChartError> {
        let (resource, capabilities) = self.resolve(&object).await?;
        let name = object_name(&object)?;
        let api = self.object_api(&resource, &capabilities, &mut object);

        match api.get(&name).await {
            Ok(existing) => {
                object.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &object).await?;
                debug!(object = %name, kind = %resource.kind, "Updated object");
            }
            Err(err) if crate::state::is_not_found(&err) => {
                api.create(&PostParams::default(), &object).await?;
                debug!(object = %name, kind = %resource.kind, "Created object");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn delete_object(&self, mut object: DynamicObject) -> Result<(), ChartError> {
        let (resource, capabilities) = self.resolve(&object).await?;
        let name = object_name(&object)?;
        let api = self.object_api(&resource, &capabilities, &mut object);

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(object = %name, kind = %resource.kind, "Deleted object");
                Ok(())
            }
            Err(err) if crate::state::is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Resolves an object's kind against the discovery snapshot, refreshing
    /// the snapshot once on a miss. The snapshot can lag a freshly installed
    /// resource; a second miss is a real error.
    async fn resolve(
        &self,
        object: &DynamicObject,
    ) -> Result<(ApiResource, ApiCapabilities), ChartError> {
        let types = object
            .types
            .clone()
            .ok_or_else(|| ChartError::UnknownKind("object without apiVersion/kind".to_string()))?;
        let gvk = GroupVersionKind::try_from(&types)
            .map_err(|e| ChartError::UnknownKind(e.to_string()))?;

        {
            let discovery = self.discovery.lock().await;
            if let Some(found) = discovery.resolve_gvk(&gvk) {
                return Ok(found);
            }
        }

        let refreshed = Discovery::new(self.client.clone()).run().await?;
        let mut discovery = self.discovery.lock().await;
        *discovery = refreshed;
        discovery.resolve_gvk(&gvk).ok_or_else(|| {
            ChartError::UnknownKind(format!("{}/{} {}", gvk.group, gvk.version, gvk.kind))
        })
    }

    /// Builds an Api for the object, stamping the controller namespace onto
    /// namespaced objects that do not carry one.
    fn object_api(
        &self,
        resource: &ApiResource,
        capabilities: &ApiCapabilities,
        object: &mut DynamicObject,
    ) -> Api<DynamicObject> {
        if matches!(capabilities.scope, Scope::Namespaced) {
            let namespace = match &object.metadata.namespace {
                Some(namespace) => namespace.clone(),
                None => {
                    object.metadata.namespace = Some(self.namespace.clone());
                    self.namespace.clone()
                }
            };
            Api::namespaced_with(self.client.clone(), &namespace, resource)
        } else {
            Api::all_with(self.client.clone(), resource)
        }
    }
}

fn object_name(object: &DynamicObject) -> Result<String, ChartError> {
    object.metadata.name.clone().ok_or_else(|| ChartError::Decode {
        name: object
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default(),
        message: "rendered object has no metadata.name".to_string(),
    })
}

/// Parses one rendered template into dynamic objects: splits multi-document
/// streams, drops empty and kindless fragments, and flattens `List` wrappers.
fn parse_manifest_documents(
    name: &str,
    rendered: &str,
    out: &mut Vec<DynamicObject>,
) -> Result<(), ChartError> {
    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| ChartError::Decode {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(&value).map_err(|e| ChartError::Decode {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        push_object(name, json, out)?;
    }
    Ok(())
}

fn push_object(
    name: &str,
    json: serde_json::Value,
    out: &mut Vec<DynamicObject>,
) -> Result<(), ChartError> {
    let Some(map) = json.as_object() else {
        return Ok(());
    };
    if map.is_empty() {
        return Ok(());
    }
    let kind = map.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    if kind.is_empty() {
        return Ok(());
    }
    if kind == "List" {
        if let Some(items) = map.get("items").and_then(|i| i.as_array()) {
            for item in items {
                push_object(name, item.clone(), out)?;
            }
        }
        return Ok(());
    }

    let object: DynamicObject = serde_json::from_value(json).map_err(|e| ChartError::Decode {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    out.push(object);
    Ok(())
}

/// Merges value trees map-wise and recursively. Precedence, highest first:
/// per-call override, operator base values, bundle defaults.
pub fn merge_values(
    defaults: &serde_json::Value,
    base: &serde_json::Value,
    overrides: &serde_json::Value,
) -> serde_json::Value {
    let mut merged = defaults.clone();
    overlay(&mut merged, base);
    overlay(&mut merged, overrides);
    merged
}

fn overlay(target: &mut serde_json::Value, layer: &serde_json::Value) {
    match (target, layer) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match target_map.get_mut(key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, layer) => {
            if !layer.is_null() {
                *target = layer.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_values_precedence() {
        let defaults = json!({"a": 1, "nested": {"x": "chart", "y": "chart"}, "keep": true});
        let base = json!({"nested": {"x": "base"}, "b": 2});
        let overrides = json!({"nested": {"y": "override"}, "a": 9});

        let merged = merge_values(&defaults, &base, &overrides);
        assert_eq!(merged["a"], 9);
        assert_eq!(merged["b"], 2);
        assert_eq!(merged["keep"], true);
        assert_eq!(merged["nested"]["x"], "base");
        assert_eq!(merged["nested"]["y"], "override");
    }

    #[test]
    fn test_merge_values_replaces_non_map_values_wholesale() {
        let defaults = json!({"ports": [1, 2, 3], "service": {"enabled": true}});
        let overrides = json!({"ports": [9], "service": "disabled"});
        let merged = merge_values(&defaults, &json!({}), &overrides);
        assert_eq!(merged["ports"], json!([9]));
        assert_eq!(merged["service"], "disabled");
    }

    #[test]
    fn test_parse_manifest_documents_splits_and_filters() {
        let rendered = r#"
apiVersion: v1
kind: Service
metadata:
  name: udl-42-r7
---
# a comment-only fragment
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: udl-42-r7
"#;
        let mut objects = Vec::new();
        parse_manifest_documents("all.yaml", rendered, &mut objects).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "Service");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Deployment");
    }

    #[test]
    fn test_parse_manifest_documents_flattens_lists() {
        let rendered = r#"
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: one
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: two
"#;
        let mut objects = Vec::new();
        parse_manifest_documents("list.yaml", rendered, &mut objects).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("one"));
        assert_eq!(objects[1].metadata.name.as_deref(), Some("two"));
    }

    #[test]
    fn test_parse_manifest_documents_skips_kindless_fragments() {
        let mut objects = Vec::new();
        parse_manifest_documents("odd.yaml", "metadata:\n  name: nameless\n", &mut objects)
            .unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn test_render_pipeline_from_template_to_object() {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(
                "service.yaml",
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: {{release.name}}\nspec:\n  type: {{values.service.type}}\n",
            )
            .unwrap();

        let context = json!({
            "release": {"name": "udl-42-r7", "namespace": "udl"},
            "values": {"service": {"type": "NodePort"}},
        });
        let rendered = registry.render("service.yaml", &context).unwrap();

        let mut objects = Vec::new();
        parse_manifest_documents("service.yaml", &rendered, &mut objects).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("udl-42-r7"));
        assert_eq!(objects[0].data["spec"]["type"], "NodePort");
    }
}
