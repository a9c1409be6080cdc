//! Template-bundle loading.
//!
//! A bundle is a directory with an optional `values.yaml` (defaults) and a
//! `templates/` tree of manifest templates. Bundles are loaded either from a
//! local path or from a content-addressed registry via an `oci://` reference,
//! in which case the archive layer is fetched, digest-checked, and unpacked
//! into a temporary directory before loading.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::ChartError;

/// One template file, addressed by its bundle-relative name.
#[derive(Debug, Clone)]
pub struct ChartTemplate {
    pub name: String,
    pub source: String,
}

/// An in-memory template bundle.
#[derive(Debug, Clone)]
pub struct ChartBundle {
    /// Bundle-default values, lowest merge precedence.
    pub defaults: serde_json::Value,

    /// Templates in lexicographic name order; this is the render order.
    pub templates: Vec<ChartTemplate>,
}

#[derive(Debug, Deserialize)]
struct OciManifest {
    #[serde(default)]
    layers: Vec<OciLayer>,
}

#[derive(Debug, Deserialize)]
struct OciLayer {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    digest: String,
}

impl ChartBundle {
    /// Loads a bundle from a local path or an `oci://` reference.
    pub async fn load(path: &str) -> Result<Self, ChartError> {
        match path.strip_prefix("oci://") {
            Some(reference) => Self::load_from_oci(reference).await,
            None => Self::load_from_dir(Path::new(path)),
        }
    }

    /// Loads a bundle from an unpacked directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ChartError> {
        let values_path = dir.join("values.yaml");
        let defaults = if values_path.is_file() {
            read_values_file(&values_path)?
        } else {
            serde_json::json!({})
        };

        let templates_dir = dir.join("templates");
        if !templates_dir.is_dir() {
            return Err(ChartError::Decode {
                name: dir.display().to_string(),
                message: "bundle has no templates directory".to_string(),
            });
        }

        let mut templates = Vec::new();
        collect_templates(&templates_dir, "", &mut templates)?;
        templates.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self { defaults, templates })
    }

    async fn load_from_oci(reference: &str) -> Result<Self, ChartError> {
        let (host, repo, tag) = parse_oci_reference(reference)?;
        let fetch_err = |message: String| ChartError::Fetch {
            reference: reference.to_string(),
            message,
        };

        let client = reqwest::Client::new();

        let response = client
            .get(format!("https://{host}/v2/{repo}/manifests/{tag}"))
            .header(
                reqwest::header::ACCEPT,
                "application/vnd.oci.image.manifest.v1+json, \
                 application/vnd.docker.distribution.manifest.v2+json",
            )
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!(
                "manifest request failed with status {}",
                response.status()
            )));
        }
        let manifest: OciManifest = response.json().await.map_err(|e| fetch_err(e.to_string()))?;

        let layer = manifest
            .layers
            .iter()
            .find(|layer| layer.media_type.contains("tar"))
            .ok_or_else(|| fetch_err("manifest contains no archive layer".to_string()))?;

        let response = client
            .get(format!("https://{host}/v2/{repo}/blobs/{}", layer.digest))
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!(
                "blob request failed with status {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;

        verify_digest(&layer.digest, &bytes)?;

        let unpack_dir = tempfile::tempdir()?;
        tar::Archive::new(GzDecoder::new(bytes.as_ref())).unpack(unpack_dir.path())?;

        Self::load_from_dir(&bundle_root(unpack_dir.path()))
    }
}

/// Reads a YAML values file into a JSON value tree.
pub(crate) fn read_values_file(path: &Path) -> Result<serde_json::Value, ChartError> {
    let raw = std::fs::read_to_string(path)?;
    yaml_str_to_json(&raw, &path.display().to_string())
}

fn yaml_str_to_json(raw: &str, name: &str) -> Result<serde_json::Value, ChartError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    let value: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| ChartError::Decode {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    serde_json::to_value(&value).map_err(|e| ChartError::Decode {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn collect_templates(
    dir: &Path,
    prefix: &str,
    out: &mut Vec<ChartTemplate>,
) -> Result<(), ChartError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let name = if prefix.is_empty() {
            file_name.clone()
        } else {
            format!("{prefix}/{file_name}")
        };

        if path.is_dir() {
            collect_templates(&path, &name, out)?;
            continue;
        }
        // NOTES.txt is operator guidance, underscore files are partials;
        // neither renders to a cluster object.
        if file_name == "NOTES.txt" || file_name.starts_with('_') {
            continue;
        }
        out.push(ChartTemplate {
            name,
            source: std::fs::read_to_string(&path)?,
        });
    }
    Ok(())
}

/// Splits `host/repo[:tag]` out of an `oci://` reference body.
fn parse_oci_reference(reference: &str) -> Result<(String, String, String), ChartError> {
    let (host, rest) = reference.split_once('/').ok_or_else(|| ChartError::Fetch {
        reference: reference.to_string(),
        message: "expected host/repository form".to_string(),
    })?;
    if host.is_empty() || rest.is_empty() {
        return Err(ChartError::Fetch {
            reference: reference.to_string(),
            message: "expected host/repository form".to_string(),
        });
    }

    // A colon after the last slash is a tag separator; anywhere else it
    // belongs to the host (port).
    let (repo, tag) = match rest.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() => {
            (repo.to_string(), tag.to_string())
        }
        _ => (rest.to_string(), "latest".to_string()),
    };

    Ok((host.to_string(), repo, tag))
}

fn verify_digest(expected: &str, bytes: &[u8]) -> Result<(), ChartError> {
    let expected_hex = expected.strip_prefix("sha256:").unwrap_or(expected);
    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual != expected_hex {
        return Err(ChartError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Helm-style archives nest the bundle one directory deep; descend when the
/// unpack root itself is not a bundle.
fn bundle_root(dir: &Path) -> PathBuf {
    if dir.join("templates").is_dir() {
        return dir.to_path_buf();
    }
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join("templates").is_dir() {
                return path;
            }
        }
    }
    dir.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path) {
        std::fs::create_dir_all(dir.join("templates")).unwrap();
        std::fs::write(dir.join("values.yaml"), "app:\n  name: placeholder\n").unwrap();
        std::fs::write(
            dir.join("templates/deployment.yaml"),
            "kind: Deployment\nmetadata:\n  name: {{release.name}}\n",
        )
        .unwrap();
        std::fs::write(dir.join("templates/service.yaml"), "kind: Service\n").unwrap();
        std::fs::write(dir.join("templates/NOTES.txt"), "enjoy\n").unwrap();
        std::fs::write(dir.join("templates/_helpers.tpl"), "{{!-- partials --}}\n").unwrap();
    }

    #[test]
    fn test_load_from_dir_orders_and_filters_templates() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path());

        let bundle = ChartBundle::load_from_dir(dir.path()).unwrap();
        let names: Vec<_> = bundle.templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["deployment.yaml", "service.yaml"]);
        assert_eq!(bundle.defaults["app"]["name"], "placeholder");
    }

    #[test]
    fn test_load_from_dir_without_templates_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("values.yaml"), "a: 1\n").unwrap();
        assert!(ChartBundle::load_from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_load_from_dir_without_values_uses_empty_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates/cm.yaml"), "kind: ConfigMap\n").unwrap();
        let bundle = ChartBundle::load_from_dir(dir.path()).unwrap();
        assert_eq!(bundle.defaults, serde_json::json!({}));
    }

    #[test]
    fn test_parse_oci_reference() {
        let (host, repo, tag) = parse_oci_reference("ghcr.io/udl-tf/charts/tf2chart:1.2.3").unwrap();
        assert_eq!(host, "ghcr.io");
        assert_eq!(repo, "udl-tf/charts/tf2chart");
        assert_eq!(tag, "1.2.3");

        let (host, repo, tag) = parse_oci_reference("ghcr.io/udl-tf/charts/tf2chart").unwrap();
        assert_eq!(host, "ghcr.io");
        assert_eq!(repo, "udl-tf/charts/tf2chart");
        assert_eq!(tag, "latest");

        assert!(parse_oci_reference("no-slash").is_err());
    }

    #[test]
    fn test_verify_digest() {
        let digest = format!("sha256:{:x}", Sha256::digest(b"payload"));
        assert!(verify_digest(&digest, b"payload").is_ok());
        assert!(matches!(
            verify_digest(&digest, b"tampered"),
            Err(ChartError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_bundle_root_descends_one_level() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("tf2chart");
        write_bundle(&nested);
        assert_eq!(bundle_root(dir.path()), nested);
    }
}
