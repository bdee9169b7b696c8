//! Build specification for runtimes that need a custom container image
//!
//! A runtime that declares plugins gets its image built by the operator: the
//! plugin list is rendered into a Containerfile, hashed into a build
//! revision, and rebuilt only when the revision changes (or a rebuild is
//! forced via annotation).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::hash::content_hash;
use crate::Error;

/// Directory inside the built image where plugins are unpacked
pub const PLUGIN_DIR: &str = "/opt/drift/plugins";

/// Build specification: base image, plugin list, and output target
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Base image the plugins are layered onto
    pub base_image: String,

    /// Plugins to bake into the image
    pub plugins: Vec<Plugin>,

    /// Where the built image is pushed or tagged
    pub output: BuildOutput,
}

/// One plugin: a named set of artifacts unpacked into the plugin directory
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    /// Plugin name, unique within the build and used as its directory name
    pub name: String,

    /// Artifacts to download into the plugin directory
    pub artifacts: Vec<Artifact>,
}

/// A single downloadable artifact
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Artifact {
    /// Direct URL download
    #[serde(rename_all = "camelCase")]
    Url {
        /// Artifact URL
        url: String,
        /// Optional SHA-512 checksum, verified after download
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha512sum: Option<String>,
    },
    /// Maven coordinates, resolved against a repository
    #[serde(rename_all = "camelCase")]
    Maven {
        /// Repository base URL; Maven Central when unset
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository: Option<String>,
        /// Group id
        group: String,
        /// Artifact id
        artifact: String,
        /// Version
        version: String,
    },
}

/// Output target for the built image
///
/// A closed set: either push directly to a registry (optionally with a push
/// credential secret) or tag into the platform's internal registry.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BuildOutput {
    /// Push the image straight to an external registry
    #[serde(rename_all = "camelCase")]
    DirectPush {
        /// Target image reference (registry/repository:tag)
        image: String,
        /// Name of a docker-config secret used for the push
        #[serde(default, skip_serializing_if = "Option::is_none")]
        push_secret: Option<String>,
    },
    /// Tag the image into the platform's internal registry
    #[serde(rename_all = "camelCase")]
    RegistryTag {
        /// Target tag reference
        image: String,
    },
}

impl BuildOutput {
    /// The declared target image reference
    pub fn image(&self) -> &str {
        match self {
            Self::DirectPush { image, .. } => image,
            Self::RegistryTag { image } => image,
        }
    }

    /// Push credential secret, when one is declared
    pub fn push_secret(&self) -> Option<&str> {
        match self {
            Self::DirectPush { push_secret, .. } => push_secret.as_deref(),
            Self::RegistryTag { .. } => None,
        }
    }
}

impl BuildSpec {
    /// Validate the build specification
    ///
    /// Runs before any infrastructure mutation: every plugin must have a
    /// unique name and at least one artifact.
    pub fn validate(&self) -> Result<(), Error> {
        if self.base_image.is_empty() {
            return Err(Error::validation("build baseImage cannot be empty"));
        }
        if self.plugins.is_empty() {
            return Err(Error::validation(
                "build must declare at least one plugin",
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err(Error::validation("plugin name cannot be empty"));
            }
            if !plugin
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(Error::validation(format!(
                    "plugin name '{}' contains invalid characters",
                    plugin.name
                )));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(Error::validation(format!(
                    "plugin name '{}' is declared more than once",
                    plugin.name
                )));
            }
            if plugin.artifacts.is_empty() {
                return Err(Error::validation(format!(
                    "plugin '{}' must declare at least one artifact",
                    plugin.name
                )));
            }
            for artifact in &plugin.artifacts {
                artifact.validate(&plugin.name)?;
            }
        }

        if self.output.image().is_empty() {
            return Err(Error::validation("build output image cannot be empty"));
        }

        Ok(())
    }

    /// Render the full Containerfile for this build
    ///
    /// The output is deterministic for a given spec: the build revision is a
    /// hash of exactly this text, so formatting changes here invalidate every
    /// recorded revision and force a fleet-wide rebuild.
    pub fn render_containerfile(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("FROM {}\n\nUSER root:root\n", self.base_image));

        for plugin in &self.plugins {
            let dir = format!("{}/{}", PLUGIN_DIR, plugin.name);
            out.push_str(&format!("\n##########\n# Plugin: {}\n##########\n", plugin.name));
            for artifact in &plugin.artifacts {
                out.push_str(&artifact.render(&dir));
            }
        }

        out.push_str("\nUSER 1001\n");
        out
    }

    /// Compute the build revision: a stable content hash of the rendered
    /// Containerfile, truncated to a compact annotation-friendly digest
    pub fn revision(&self) -> String {
        content_hash(&self.render_containerfile())
    }
}

impl Artifact {
    fn validate(&self, plugin: &str) -> Result<(), Error> {
        match self {
            Self::Url { url, .. } => {
                if url.is_empty() {
                    return Err(Error::validation(format!(
                        "plugin '{}' has a url artifact with an empty url",
                        plugin
                    )));
                }
            }
            Self::Maven {
                group,
                artifact,
                version,
                ..
            } => {
                if group.is_empty() || artifact.is_empty() || version.is_empty() {
                    return Err(Error::validation(format!(
                        "plugin '{}' has a maven artifact with empty coordinates",
                        plugin
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render the download instructions for this artifact into `dir`
    fn render(&self, dir: &str) -> String {
        match self {
            Self::Url { url, sha512sum } => {
                let file = url.rsplit('/').next().unwrap_or("artifact");
                let path = format!("{}/{}", dir, file);
                let mut s = format!(
                    "RUN 'mkdir' '-p' '{dir}' \\\n      && 'curl' '-f' '-L' '--output' '{path}' '{url}'\n"
                );
                if let Some(sum) = sha512sum {
                    s.push_str(&format!(
                        "RUN echo '{sum} {path}' | sha512sum --check \\\n      || ('rm' '-f' '{path}' && exit 1)\n"
                    ));
                }
                s
            }
            Self::Maven {
                repository,
                group,
                artifact,
                version,
            } => {
                let repo = repository
                    .as_deref()
                    .unwrap_or("https://repo1.maven.org/maven2")
                    .trim_end_matches('/');
                let url = format!(
                    "{repo}/{}/{artifact}/{version}/{artifact}-{version}.jar",
                    group.replace('.', "/")
                );
                let path = format!("{}/{artifact}-{version}.jar", dir);
                format!(
                    "RUN 'mkdir' '-p' '{dir}' \\\n      && 'curl' '-f' '-L' '--output' '{path}' '{url}'\n"
                )
            }
        }
    }
}
