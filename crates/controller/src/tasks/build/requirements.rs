//! Requirements-file discovery and build recipe rendering
//!
//! The controller never reads the repository itself; it renders the ordered
//! candidate list into the build recipe and the build backend resolves it at
//! build time. The chain is deterministic for a given spec and notebook path.

use crate::crds::BuildConfigSpec;
use crate::tasks::types::{Error, Result};
use handlebars::Handlebars;
use serde_json::json;

/// Dockerfile rendered for the s2i backend. The embedded shell fragment walks
/// the candidate list and installs the first requirements file it finds; with
/// `prefer_dockerfile` a repository Dockerfile short-circuits the chain.
const DOCKERFILE_TEMPLATE: &str = r#"FROM {{base_image}}

USER root
WORKDIR /workspace
COPY . /workspace

RUN set -e; \
    {{#if prefer_dockerfile}}if [ -f Dockerfile ]; then \
        echo "requirements: repository Dockerfile present, keeping it"; \
        exit 0; \
    fi; \
    {{/if}}found=""; \
    for candidate in {{#each candidates}}"{{this}}" {{/each}}; do \
        if [ -f "$candidate" ]; then \
            echo "requirements: using $candidate"; \
            found="$candidate"; \
            break; \
        fi; \
    done; \
    if [ -n "$found" ]; then \
        pip install --no-cache-dir -r "$found"; \
    else \
        echo "requirements: no requirements file found, using base image packages"; \
    fi

USER 1001
ENV NOTEBOOK_PATH={{notebook_path}}
"#;

/// Shell step used by the pipeline backend's recipe-generation task.
const RESOLVE_SCRIPT_TEMPLATE: &str = r#"#!/bin/sh
set -e
cd "$(workspaces.source.path)"
found=""
for candidate in {{#each candidates}}"{{this}}" {{/each}}; do
    if [ -f "$candidate" ]; then
        echo "requirements: using $candidate"
        found="$candidate"
        break
    fi
done
{{#if prefer_dockerfile}}
if [ -f Dockerfile ]; then
    echo "requirements: repository Dockerfile present, keeping it"
    exit 0
fi
{{/if}}
cat > Dockerfile <<EOF
FROM {{base_image}}
USER root
WORKDIR /workspace
COPY . /workspace
EOF
if [ -n "$found" ]; then
    echo "RUN pip install --no-cache-dir -r $found" >> Dockerfile
else
    echo "requirements: no requirements file found, using base image packages"
fi
echo "USER 1001" >> Dockerfile
"#;

/// Resolve the ordered requirements candidate chain for a notebook path.
///
/// Order: explicit path, declared custom sources, notebook directory, notebook
/// tier directory, repository root. Duplicates collapse to their first
/// occurrence so repository-root notebooks do not probe the same path thrice.
#[must_use]
pub fn candidate_paths(notebook_path: &str, build: &BuildConfigSpec) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();

    if let Some(explicit) = build
        .requirements_file
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        chain.push(explicit.trim().to_string());
    }

    for source in &build.requirements_sources {
        let trimmed = source.trim();
        if !trimmed.is_empty() {
            chain.push(trimmed.to_string());
        }
    }

    if build.auto_generate_requirements {
        let mut dir = notebook_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        loop {
            if dir.is_empty() {
                chain.push("requirements.txt".to_string());
                break;
            }
            chain.push(format!("{dir}/requirements.txt"));
            dir = dir.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        }
    }

    let mut seen = std::collections::HashSet::new();
    chain.retain(|p| seen.insert(p.clone()));
    chain
}

/// Render the inline Dockerfile recipe for the s2i backend.
pub fn render_dockerfile(
    base_image: &str,
    notebook_path: &str,
    candidates: &[String],
    prefer_dockerfile: bool,
) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars
        .register_template_string("dockerfile", DOCKERFILE_TEMPLATE)
        .map_err(|e| Error::BuildError(format!("failed to register Dockerfile template: {e}")))?;

    handlebars
        .render(
            "dockerfile",
            &json!({
                "base_image": base_image,
                "notebook_path": notebook_path,
                "candidates": candidates,
                "prefer_dockerfile": prefer_dockerfile,
            }),
        )
        .map_err(|e| Error::BuildError(format!("failed to render Dockerfile recipe: {e}")))
}

/// Render the requirements-resolution step for the pipeline backend.
pub fn render_resolve_script(
    base_image: &str,
    candidates: &[String],
    prefer_dockerfile: bool,
) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars
        .register_template_string("resolve", RESOLVE_SCRIPT_TEMPLATE)
        .map_err(|e| Error::BuildError(format!("failed to register resolve template: {e}")))?;

    handlebars
        .render(
            "resolve",
            &json!({
                "base_image": base_image,
                "candidates": candidates,
                "prefer_dockerfile": prefer_dockerfile,
            }),
        )
        .map_err(|e| Error::BuildError(format!("failed to render resolve script: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_spec() -> BuildConfigSpec {
        BuildConfigSpec {
            enabled: true,
            auto_generate_requirements: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_chain_for_tiered_notebook() {
        let chain = candidate_paths("notebooks/tier2-data/01-pandas.ipynb", &build_spec());
        assert_eq!(
            chain,
            vec![
                "notebooks/tier2-data/requirements.txt",
                "notebooks/requirements.txt",
                "requirements.txt",
            ]
        );
    }

    #[test]
    fn test_explicit_path_wins() {
        let mut spec = build_spec();
        spec.requirements_file = Some("deps/pinned.txt".to_string());
        let chain = candidate_paths("notebooks/tier2-data/01-pandas.ipynb", &spec);
        assert_eq!(chain[0], "deps/pinned.txt");
        assert_eq!(chain[1], "notebooks/tier2-data/requirements.txt");
    }

    #[test]
    fn test_custom_sources_precede_auto_detection() {
        let mut spec = build_spec();
        spec.requirements_sources =
            vec!["shared/requirements.txt".to_string(), "extra.txt".to_string()];
        let chain = candidate_paths("notebooks/demo.ipynb", &spec);
        assert_eq!(
            chain,
            vec![
                "shared/requirements.txt",
                "extra.txt",
                "notebooks/requirements.txt",
                "requirements.txt",
            ]
        );
    }

    #[test]
    fn test_root_notebook_probes_root_once() {
        let chain = candidate_paths("hello.ipynb", &build_spec());
        assert_eq!(chain, vec!["requirements.txt"]);
    }

    #[test]
    fn test_auto_detection_can_be_disabled() {
        let mut spec = build_spec();
        spec.auto_generate_requirements = false;
        spec.requirements_file = Some("deps/pinned.txt".to_string());
        let chain = candidate_paths("notebooks/demo.ipynb", &spec);
        assert_eq!(chain, vec!["deps/pinned.txt"]);
    }

    #[test]
    fn test_chain_is_deterministic() {
        let a = candidate_paths("notebooks/tier1/hello.ipynb", &build_spec());
        let b = candidate_paths("notebooks/tier1/hello.ipynb", &build_spec());
        assert_eq!(a, b);
    }

    #[test]
    fn test_dockerfile_carries_chain_in_order() {
        let chain = candidate_paths("notebooks/tier2-data/01-pandas.ipynb", &build_spec());
        let dockerfile = render_dockerfile(
            "quay.io/jupyter/minimal-notebook:latest",
            "notebooks/tier2-data/01-pandas.ipynb",
            &chain,
            false,
        )
        .expect("dockerfile renders");

        assert!(dockerfile.starts_with("FROM quay.io/jupyter/minimal-notebook:latest"));
        let first = dockerfile
            .find("notebooks/tier2-data/requirements.txt")
            .expect("notebook dir candidate present");
        let last = dockerfile
            .find("\"requirements.txt\"")
            .expect("root candidate present");
        assert!(first < last, "candidates must render in chain order");
        assert!(dockerfile.contains("pip install --no-cache-dir"));
    }

    #[test]
    fn test_dockerfile_honors_prefer_dockerfile() {
        let chain = candidate_paths("notebooks/demo.ipynb", &build_spec());
        let dockerfile =
            render_dockerfile("base:latest", "notebooks/demo.ipynb", &chain, true)
                .expect("dockerfile renders");
        assert!(dockerfile.contains("repository Dockerfile present"));

        let dockerfile =
            render_dockerfile("base:latest", "notebooks/demo.ipynb", &chain, false)
                .expect("dockerfile renders");
        assert!(!dockerfile.contains("repository Dockerfile present"));
    }

    #[test]
    fn test_resolve_script_honors_prefer_dockerfile() {
        let chain = candidate_paths("notebooks/demo.ipynb", &build_spec());
        let script = render_resolve_script("base:latest", &chain, true).expect("script renders");
        assert!(script.contains("repository Dockerfile present"));

        let script = render_resolve_script("base:latest", &chain, false).expect("script renders");
        assert!(!script.contains("repository Dockerfile present"));
    }
}
