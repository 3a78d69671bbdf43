//! Execution manifest rendering.
//!
//! Workflow and build models are expanded into Tekton `PipelineRun` and
//! `TaskRun` manifests through Handlebars templates. Rendered output is parsed
//! back before it is returned, so a manifest that is not valid YAML never leaves
//! this module.

use std::collections::BTreeMap;

use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::crd::ResourceKind;
use crate::error::{Error, Result};

pub mod catalog;

pub use catalog::{BuildTemplate, SYSTEM_TEMPLATES};

const PIPELINE_RUN_TEMPLATE: &str = include_str!("../../templates/pipeline-run.yaml.hbs");
const TASK_RUN_TEMPLATE: &str = include_str!("../../templates/task-run.yaml.hbs");

const DEFAULT_JOB_IMAGE: &str = "alpine:latest";
const DEFAULT_WORKSPACE_SIZE: &str = "1Gi";
const DEFAULT_REGISTRY_SECRET: &str = "docker-registry-credentials";

/// Deterministic `PipelineRun` name for a workflow run.
#[must_use]
pub fn pipeline_run_name(workflow_id: &str, run_number: u32) -> String {
    format!("wf-{workflow_id}-run-{run_number}")
}

/// Deterministic `TaskRun` name for a build run.
#[must_use]
pub fn task_run_name(build_config_id: &str, run_number: u32) -> String {
    format!("build-{build_config_id}-run-{run_number}")
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowModel {
    pub workflow_id: String,
    pub workflow_name: String,
    pub run_id: String,
    pub run_number: u32,
    pub project_id: String,
    pub namespace: String,
    pub stages: Vec<StageModel>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct StageModel {
    pub id: String,
    pub name: String,
    /// build, test, deploy or custom
    pub stage_type: String,
    /// Runs alongside the preceding stage instead of after it.
    pub parallel: bool,
    pub jobs: Vec<JobModel>,
}

#[derive(Debug, Clone, Default)]
pub struct JobModel {
    pub id: String,
    pub name: String,
    /// build, test, deploy, custom or approval
    pub job_type: String,
    /// Optional `image` and `script` overrides.
    pub config: Map<String, Value>,
    /// Zero means no step timeout.
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BuildModel {
    pub build_config_id: String,
    pub run_id: String,
    pub run_number: u32,
    pub project_id: String,
    pub service_name: String,
    pub namespace: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub build_image: String,
    pub build_script: String,
    pub dockerfile_path: String,
    pub docker_context: String,
    pub image_repo: String,
    pub image_tag: String,
    pub build_env: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub cache_enabled: bool,
}

/// A manifest ready for submission.
#[derive(Debug, Clone)]
pub struct RenderedManifest {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub yaml: String,
    pub document: Value,
}

#[derive(Serialize)]
struct StageContext {
    name: String,
    run_after: Vec<String>,
    jobs: Vec<JobContext>,
}

#[derive(Serialize)]
struct JobContext {
    name: String,
    image: String,
    script: String,
    timeout: String,
}

/// Renders execution manifests from platform models.
pub struct TemplateRenderer {
    registry: Handlebars<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        handlebars_helper!(json: |value: Value| {
            serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
        });
        registry.register_helper("json", Box::new(json));

        registry
            .register_template_string("pipeline_run", PIPELINE_RUN_TEMPLATE)
            .map_err(|e| Error::Render(format!("Failed to register pipeline run template: {e}")))?;
        registry
            .register_template_string("task_run", TASK_RUN_TEMPLATE)
            .map_err(|e| Error::Render(format!("Failed to register task run template: {e}")))?;

        Ok(Self { registry })
    }

    /// Render a workflow run into a `PipelineRun`.
    pub fn render_pipeline_run(&self, model: &WorkflowModel) -> Result<RenderedManifest> {
        require("workflow id", &model.workflow_id)?;
        require("namespace", &model.namespace)?;
        if model.stages.is_empty() {
            return Err(Error::Render(format!(
                "workflow {} has no stages",
                model.workflow_id
            )));
        }

        let stages = chain_stages(&model.stages)?;
        let params: Vec<Value> = model
            .params
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let name = pipeline_run_name(&model.workflow_id, model.run_number);
        let context = json!({
            "name": name,
            "namespace": model.namespace,
            "workflow_id": model.workflow_id,
            "run_id": model.run_id,
            "project_id": model.project_id,
            "stages": stages,
            "params": params,
            "workspace_size": DEFAULT_WORKSPACE_SIZE,
        });

        self.render(
            "pipeline_run",
            &context,
            ResourceKind::PipelineRun,
            name,
            &model.namespace,
        )
    }

    /// Render a build run into a `TaskRun`.
    pub fn render_task_run(&self, model: &BuildModel) -> Result<RenderedManifest> {
        require("build config id", &model.build_config_id)?;
        require("namespace", &model.namespace)?;
        require("repository url", &model.repo_url)?;
        require("branch", &model.branch)?;
        require("image repository", &model.image_repo)?;
        require("image tag", &model.image_tag)?;

        let mut env: BTreeMap<&str, &str> = model
            .variables
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        env.extend(model.build_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let env: Vec<Value> = env
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let build_script = if model.build_script.trim().is_empty() {
            "echo \"no build script configured\"".to_string()
        } else {
            model.build_script.clone()
        };
        let build_image = if model.build_image.is_empty() {
            DEFAULT_JOB_IMAGE.to_string()
        } else {
            model.build_image.clone()
        };

        let name = task_run_name(&model.build_config_id, model.run_number);
        let context = json!({
            "name": name,
            "namespace": model.namespace,
            "build_config_id": model.build_config_id,
            "run_id": model.run_id,
            "project_id": model.project_id,
            "service_name": model.service_name,
            "build_image": build_image,
            "build_script": build_script,
            "env": env,
            "dockerfile_arg": format!("--dockerfile={}", model.dockerfile_path),
            "context_arg": format!("--context=/workspace/source/{}", model.docker_context),
            "cache_enabled": model.cache_enabled,
            "repo_url": model.repo_url,
            "branch": model.branch,
            "commit_sha": model.commit_sha,
            "image_repo": model.image_repo,
            "image_tag": model.image_tag,
            "registry_secret": DEFAULT_REGISTRY_SECRET,
        });

        self.render(
            "task_run",
            &context,
            ResourceKind::TaskRun,
            name,
            &model.namespace,
        )
    }

    fn render(
        &self,
        template: &str,
        context: &Value,
        kind: ResourceKind,
        name: String,
        namespace: &str,
    ) -> Result<RenderedManifest> {
        let yaml = self
            .registry
            .render(template, context)
            .map_err(|e| Error::Render(format!("Failed to render {kind} {name}: {e}")))?;

        let document: Value = serde_yaml::from_str(&yaml)
            .map_err(|e| Error::Render(format!("Rendered {kind} {name} is not valid YAML: {e}")))?;

        debug!(kind = %kind, name = %name, "Rendered execution manifest");

        Ok(RenderedManifest {
            kind,
            name,
            namespace: namespace.to_string(),
            yaml,
            document,
        })
    }
}

/// Compute `runAfter` for each stage.
///
/// Sequential stages depend on every stage of the preceding group. A stage
/// marked parallel joins the preceding group and shares its dependencies.
fn chain_stages(stages: &[StageModel]) -> Result<Vec<StageContext>> {
    let mut seen = std::collections::HashSet::new();
    let mut group: Vec<String> = Vec::new();
    let mut group_deps: Vec<String> = Vec::new();
    let mut out = Vec::with_capacity(stages.len());

    for stage in stages {
        if !is_dns_label(&stage.name) {
            return Err(Error::Render(format!(
                "stage name {:?} is not a valid task name",
                stage.name
            )));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(Error::Render(format!("duplicate stage name {}", stage.name)));
        }
        if stage.jobs.is_empty() {
            return Err(Error::Render(format!("stage {} has no jobs", stage.name)));
        }

        let run_after = if stage.parallel && !group.is_empty() {
            group.push(stage.name.clone());
            group_deps.clone()
        } else {
            let deps = std::mem::replace(&mut group, vec![stage.name.clone()]);
            group_deps.clone_from(&deps);
            deps
        };

        let jobs = stage
            .jobs
            .iter()
            .map(job_context)
            .collect::<Result<Vec<_>>>()?;

        out.push(StageContext {
            name: stage.name.clone(),
            run_after,
            jobs,
        });
    }

    Ok(out)
}

fn job_context(job: &JobModel) -> Result<JobContext> {
    if !is_dns_label(&job.name) {
        return Err(Error::Render(format!(
            "job name {:?} is not a valid step name",
            job.name
        )));
    }
    let config_str = |key: &str| {
        job.config
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Ok(JobContext {
        name: job.name.clone(),
        image: config_str("image").unwrap_or_else(|| DEFAULT_JOB_IMAGE.to_string()),
        script: config_str("script").unwrap_or_else(|| {
            format!(
                "echo \"Executing job {} (type={})\"",
                job.name, job.job_type
            )
        }),
        timeout: if job.timeout_secs > 0 {
            format!("{}s", job.timeout_secs)
        } else {
            String::new()
        },
    })
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Render(format!("missing {field}")));
    }
    Ok(())
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 chars.
fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> JobModel {
        JobModel {
            name: name.to_string(),
            job_type: "custom".to_string(),
            ..JobModel::default()
        }
    }

    fn stage(name: &str, parallel: bool, jobs: &[&str]) -> StageModel {
        StageModel {
            name: name.to_string(),
            parallel,
            jobs: jobs.iter().map(|j| job(j)).collect(),
            ..StageModel::default()
        }
    }

    fn workflow(stages: Vec<StageModel>) -> WorkflowModel {
        WorkflowModel {
            workflow_id: "42".to_string(),
            workflow_name: "release".to_string(),
            run_id: "run-abc".to_string(),
            run_number: 7,
            project_id: "proj-1".to_string(),
            namespace: "zcicd-builds".to_string(),
            stages,
            params: BTreeMap::new(),
        }
    }

    fn tasks(manifest: &RenderedManifest) -> Vec<Value> {
        manifest.document["spec"]["pipelineSpec"]["tasks"]
            .as_array()
            .cloned()
            .unwrap()
    }

    fn run_after(task: &Value) -> Vec<String> {
        task.get("runAfter")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .map(|d| d.as_str().unwrap().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn sequential_stages_chain_on_predecessor() {
        let renderer = TemplateRenderer::new().unwrap();
        let model = workflow(vec![
            stage("build", false, &["compile", "unit-test"]),
            stage("test", false, &["integration"]),
            stage("deploy", false, &["rollout"]),
        ]);
        let manifest = renderer.render_pipeline_run(&model).unwrap();

        assert_eq!(manifest.name, "wf-42-run-7");
        assert_eq!(manifest.kind, ResourceKind::PipelineRun);
        assert_eq!(manifest.document["metadata"]["name"], "wf-42-run-7");
        assert_eq!(
            manifest.document["metadata"]["labels"]["zcicd.io/workflow-id"],
            "42"
        );

        let tasks = tasks(&manifest);
        assert_eq!(tasks.len(), 3);
        assert!(run_after(&tasks[0]).is_empty());
        assert_eq!(run_after(&tasks[1]), vec!["build"]);
        assert_eq!(run_after(&tasks[2]), vec!["test"]);

        let steps = tasks[0]["taskSpec"]["steps"].as_array().unwrap();
        let names: Vec<_> = steps.iter().map(|s| s["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["compile", "unit-test"]);
        assert_eq!(steps[0]["image"], "alpine:latest");
    }

    #[test]
    fn parallel_stage_shares_predecessor_dependencies() {
        let renderer = TemplateRenderer::new().unwrap();
        let model = workflow(vec![
            stage("build", false, &["compile"]),
            stage("lint", false, &["clippy"]),
            stage("scan", true, &["trivy"]),
            stage("deploy", false, &["rollout"]),
        ]);
        let tasks = tasks(&renderer.render_pipeline_run(&model).unwrap());

        assert_eq!(run_after(&tasks[1]), vec!["build"]);
        assert_eq!(run_after(&tasks[2]), vec!["build"]);
        assert_eq!(run_after(&tasks[3]), vec!["lint", "scan"]);
    }

    #[test]
    fn leading_parallel_stage_has_no_dependencies() {
        let renderer = TemplateRenderer::new().unwrap();
        let model = workflow(vec![
            stage("a", true, &["one"]),
            stage("b", true, &["two"]),
        ]);
        let tasks = tasks(&renderer.render_pipeline_run(&model).unwrap());
        assert!(run_after(&tasks[0]).is_empty());
        assert!(run_after(&tasks[1]).is_empty());
    }

    #[test]
    fn job_config_timeout_and_params_are_rendered() {
        let renderer = TemplateRenderer::new().unwrap();
        let mut build = stage("build", false, &["compile"]);
        build.jobs[0].timeout_secs = 600;
        build.jobs[0].config.insert("image".into(), json!("rust:1.80"));
        build.jobs[0]
            .config
            .insert("script".into(), json!("cargo build --release\necho \"done\""));
        let mut model = workflow(vec![build]);
        model.params.insert("env".into(), "staging".into());

        let manifest = renderer.render_pipeline_run(&model).unwrap();
        let step = &tasks(&manifest)[0]["taskSpec"]["steps"][0];
        assert_eq!(step["image"], "rust:1.80");
        assert_eq!(step["timeout"], "600s");
        assert_eq!(step["script"], "cargo build --release\necho \"done\"");

        let params = &manifest.document["spec"]["pipelineSpec"]["params"];
        assert_eq!(params[0]["name"], "env");
        assert_eq!(params[0]["default"], "staging");

        let ws = &manifest.document["spec"]["workspaces"][0];
        assert_eq!(ws["name"], "shared-workspace");
    }

    #[test]
    fn numeric_looking_names_stay_strings() {
        let renderer = TemplateRenderer::new().unwrap();
        let mut model = workflow(vec![
            stage("1234", false, &["10"]),
            stage("5678", false, &["0x1f"]),
        ]);
        model.namespace = "2024".to_string();
        let manifest = renderer.render_pipeline_run(&model).unwrap();

        assert_eq!(manifest.document["metadata"]["namespace"], "2024");
        let tasks = tasks(&manifest);
        assert_eq!(tasks[0]["name"], "1234");
        assert_eq!(tasks[0]["taskSpec"]["steps"][0]["name"], "10");
        assert_eq!(run_after(&tasks[1]), vec!["1234"]);
        assert_eq!(tasks[1]["taskSpec"]["steps"][0]["name"], "0x1f");

        let mut build = build_model();
        build.namespace = "0777".to_string();
        let manifest = renderer.render_task_run(&build).unwrap();
        assert_eq!(manifest.document["metadata"]["namespace"], "0777");
    }

    #[test]
    fn invalid_input_fails_without_output() {
        let renderer = TemplateRenderer::new().unwrap();
        assert!(matches!(
            renderer.render_pipeline_run(&workflow(vec![])),
            Err(Error::Render(_))
        ));
        assert!(matches!(
            renderer.render_pipeline_run(&workflow(vec![stage("Build Stage", false, &["x"])])),
            Err(Error::Render(_))
        ));
        assert!(matches!(
            renderer.render_pipeline_run(&workflow(vec![
                stage("build", false, &["x"]),
                stage("build", false, &["y"]),
            ])),
            Err(Error::Render(_))
        ));
        assert!(matches!(
            renderer.render_pipeline_run(&workflow(vec![stage("build", false, &[])])),
            Err(Error::Render(_))
        ));
    }

    fn build_model() -> BuildModel {
        BuildModel {
            build_config_id: "cfg9".to_string(),
            run_id: "run-1".to_string(),
            run_number: 3,
            project_id: "proj-1".to_string(),
            service_name: "api".to_string(),
            namespace: "zcicd-builds".to_string(),
            repo_url: "https://git.example.com/org/api.git".to_string(),
            branch: "main".to_string(),
            commit_sha: "abcdef1234567890".to_string(),
            build_script: "go build ./...".to_string(),
            dockerfile_path: "Dockerfile".to_string(),
            docker_context: ".".to_string(),
            image_repo: "registry.example.com/org/api".to_string(),
            image_tag: "main-abcdef12".to_string(),
            ..BuildModel::default()
        }
    }

    #[test]
    fn task_run_carries_build_parameters() {
        let renderer = TemplateRenderer::new().unwrap();
        let mut model = build_model();
        model.cache_enabled = true;
        model.build_env.insert("GOFLAGS".into(), "-mod=vendor".into());

        let manifest = renderer.render_task_run(&model).unwrap();
        assert_eq!(manifest.name, "build-cfg9-run-3");
        assert_eq!(manifest.kind, ResourceKind::TaskRun);

        let doc = &manifest.document;
        assert_eq!(doc["metadata"]["labels"]["zcicd.io/service-name"], "api");

        let steps = doc["spec"]["taskSpec"]["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1]["script"], "go build ./...");
        assert_eq!(steps[1]["env"][0]["name"], "GOFLAGS");
        let args: Vec<_> = steps[2]["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a.as_str().unwrap())
            .collect();
        assert!(args.contains(&"--dockerfile=Dockerfile"));
        assert!(args.contains(&"--context=/workspace/source/."));
        assert!(args.contains(&"--cache=true"));

        let params = doc["spec"]["params"].as_array().unwrap();
        let tag = params.iter().find(|p| p["name"] == "image_tag").unwrap();
        assert_eq!(tag["value"], "main-abcdef12");
        assert_eq!(
            doc["spec"]["workspaces"][1]["secret"]["secretName"],
            "docker-registry-credentials"
        );
    }

    #[test]
    fn cache_flag_is_omitted_when_disabled() {
        let renderer = TemplateRenderer::new().unwrap();
        let manifest = renderer.render_task_run(&build_model()).unwrap();
        assert!(!manifest.yaml.contains("--cache=true"));
    }

    #[test]
    fn task_run_requires_repository() {
        let renderer = TemplateRenderer::new().unwrap();
        let mut model = build_model();
        model.repo_url.clear();
        assert!(matches!(
            renderer.render_task_run(&model),
            Err(Error::Render(_))
        ));
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(pipeline_run_name("abc", 12), "wf-abc-run-12");
        assert_eq!(task_run_name("abc", 1), "build-abc-run-1");
    }
}
