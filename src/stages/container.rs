use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use tracing::{info, warn};

use super::{ensure_consumed, take_bool, take_string, take_string_list, take_string_map};
use crate::image::{ImageDefinition, validate_image, write_dockerfile};
use crate::pipeline::{BuildState, FailurePolicy, PipelineContext, Stage, StageParameters};
use crate::runner::CommandSpec;

/// Builds the image once and tags it with the build number plus every extra
/// tag (`latest` by default), so all tags point at the same build.
pub struct ImageBuildStage {
    repository: String,
    tag: Option<String>,
    extra_tags: Vec<String>,
    context: String,
    dockerfile: Option<String>,
    definition: Option<String>,
    build_args: Vec<(String, String)>,
    command: Option<String>,
}

impl ImageBuildStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let repository = take_string(&mut params, "repository")
            .ok_or_else(|| anyhow!("image_build stage requires 'repository' parameter"))?;
        if repository.trim().is_empty() || repository.contains(char::is_whitespace) {
            bail!("image_build repository '{repository}' is not a valid image name");
        }
        let stage = Self {
            repository,
            tag: take_string(&mut params, "tag"),
            extra_tags: take_string_list(&mut params, "extra_tags")?
                .unwrap_or_else(|| vec!["latest".to_string()]),
            context: take_string(&mut params, "context").unwrap_or_else(|| ".".to_string()),
            dockerfile: take_string(&mut params, "dockerfile"),
            definition: take_string(&mut params, "definition"),
            build_args: take_string_map(&mut params, "build_args")?,
            command: take_string(&mut params, "command"),
        };
        ensure_consumed("image_build", &params)?;
        Ok(stage)
    }

    /// Tags for this run, build-numbered tag first.
    pub fn tags(&self, build_number: &str) -> Vec<String> {
        let primary = self.tag.clone().unwrap_or_else(|| build_number.to_string());
        let mut tags = vec![format!("{}:{}", self.repository, primary)];
        for extra in &self.extra_tags {
            let tag = format!("{}:{}", self.repository, extra);
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }

    fn render_definition(&self, ctx: &PipelineContext) -> Result<Option<PathBuf>> {
        let Some(definition_path) = &self.definition else {
            return Ok(None);
        };
        let definition = ImageDefinition::load(&ctx.resolve_path(definition_path))?;
        let report = validate_image(&definition);
        for warning in &report.warnings {
            warn!(definition = definition_path.as_str(), "{warning}");
        }
        if !report.is_ok() {
            bail!(
                "Image definition '{}' is invalid: {}",
                definition_path,
                report.errors.join("; ")
            );
        }

        let target = ctx.resolve_path(
            self.dockerfile
                .clone()
                .unwrap_or_else(|| format!("{}/Dockerfile", self.context)),
        );
        if ctx.dry_run {
            info!(dockerfile = %target.display(), "Dry run: Dockerfile not written");
        } else {
            write_dockerfile(&definition, &target)?;
            info!(dockerfile = %target.display(), "Dockerfile rendered");
        }
        Ok(Some(target))
    }
}

impl Stage for ImageBuildStage {
    fn name(&self) -> &'static str {
        "image_build"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        let tags = self.tags(&ctx.build_number);

        let command = match &self.command {
            Some(line) => CommandSpec::shell(line),
            None => {
                let rendered = self.render_definition(ctx)?;
                let mut command = CommandSpec::new("docker").arg("build");
                let dockerfile = rendered
                    .map(|path| path.to_string_lossy().to_string())
                    .or_else(|| self.dockerfile.clone());
                if let Some(dockerfile) = dockerfile {
                    command = command.args(["-f".to_string(), dockerfile]);
                }
                for tag in &tags {
                    command = command.args(["-t", tag.as_str()]);
                }
                for (key, value) in &self.build_args {
                    command = command.args(["--build-arg".to_string(), format!("{key}={value}")]);
                }
                command.arg(self.context.as_str())
            }
        };

        ctx.run_checked(command)?;
        info!(tags = %tags.join(", "), "Image built");
        state.record("image.repository", self.repository.as_str());
        state.record("image.tags", tags.clone());
        state.image_tags = tags;
        Ok(())
    }
}

/// Logs in, pushes every tag produced by `image_build`, and logs out again
/// even when a push fails.
pub struct RegistryPushStage {
    server: String,
    username_env: String,
    password_env: String,
    logout: bool,
    command: Option<String>,
}

impl RegistryPushStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let server = take_string(&mut params, "server")
            .ok_or_else(|| anyhow!("registry_push stage requires 'server' parameter"))?;
        let stage = Self {
            server,
            username_env: take_string(&mut params, "username_env")
                .unwrap_or_else(|| "REGISTRY_USERNAME".to_string()),
            password_env: take_string(&mut params, "password_env")
                .unwrap_or_else(|| "REGISTRY_PASSWORD".to_string()),
            logout: take_bool(&mut params, "logout")?.unwrap_or(true),
            command: take_string(&mut params, "command"),
        };
        ensure_consumed("registry_push", &params)?;
        Ok(stage)
    }

    fn credential(&self, ctx: &PipelineContext, name: &str) -> Result<String> {
        match ctx.var(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ if ctx.dry_run => {
                warn!(variable = name, "Dry run: registry credential not set");
                Ok(String::new())
            }
            _ => bail!("Registry credential variable '{name}' is not set"),
        }
    }
}

impl Stage for RegistryPushStage {
    fn name(&self) -> &'static str {
        "registry_push"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        if state.image_tags.is_empty() {
            bail!("registry_push requires an image built earlier in the run");
        }
        if let Some(line) = &self.command {
            ctx.run_checked(CommandSpec::shell(line))?;
            state.record("registry.pushed", state.image_tags.clone());
            return Ok(());
        }
        let username = self.credential(ctx, &self.username_env)?;
        let password = self.credential(ctx, &self.password_env)?;

        ctx.run_checked(
            CommandSpec::new("docker")
                .args(["login", self.server.as_str(), "-u", username.as_str()])
                .arg("--password-stdin")
                .stdin(password),
        )?;

        let mut pushed = Vec::new();
        let mut push_error = None;
        for tag in &state.image_tags {
            match ctx.run_checked(CommandSpec::new("docker").args(["push", tag.as_str()])) {
                Ok(_) => pushed.push(tag.clone()),
                Err(err) => {
                    push_error = Some(err);
                    break;
                }
            }
        }

        if self.logout
            && let Err(err) =
                ctx.run_checked(CommandSpec::new("docker").args(["logout", self.server.as_str()]))
        {
            warn!(error = %format!("{err:#}"), "Registry logout failed");
        }

        state.record("registry.pushed", pushed);
        match push_error {
            Some(err) => Err(err),
            None => {
                info!(server = self.server.as_str(), "Image pushed");
                Ok(())
            }
        }
    }
}

/// Rolls the pushed image out to a cluster deployment.
pub struct DeployStage {
    deployment: String,
    container: String,
    namespace: Option<String>,
    kubeconfig_env: String,
    wait: bool,
    command: Option<String>,
}

impl DeployStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_string(&mut params, "command");
        let deployment = take_string(&mut params, "deployment");
        let container = take_string(&mut params, "container");
        let (deployment, container) = match (deployment, container, &command) {
            (Some(d), Some(c), _) => (d, c),
            (d, c, Some(_)) => (d.unwrap_or_default(), c.unwrap_or_default()),
            _ => bail!("deploy stage requires 'deployment' and 'container' parameters"),
        };
        let stage = Self {
            deployment,
            container,
            namespace: take_string(&mut params, "namespace"),
            kubeconfig_env: take_string(&mut params, "kubeconfig_env")
                .unwrap_or_else(|| "KUBECONFIG".to_string()),
            wait: take_bool(&mut params, "wait")?.unwrap_or(true),
            command,
        };
        ensure_consumed("deploy", &params)?;
        Ok(stage)
    }

    fn kubectl(&self, ctx: &PipelineContext) -> CommandSpec {
        let mut command = CommandSpec::new("kubectl");
        if let Some(kubeconfig) = ctx.var(&self.kubeconfig_env) {
            command = command.args(["--kubeconfig".to_string(), kubeconfig]);
        }
        if let Some(namespace) = &self.namespace {
            command = command.args(["--namespace", namespace.as_str()]);
        }
        command
    }
}

impl Stage for DeployStage {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Blocking
    }

    fn run(&self, state: &mut BuildState, ctx: &PipelineContext) -> Result<()> {
        if let Some(line) = &self.command {
            ctx.run_checked(CommandSpec::shell(line))?;
            return Ok(());
        }

        let image = state
            .image_tags
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("deploy requires an image built earlier in the run"))?;
        let target = format!("deployment/{}", self.deployment);

        ctx.run_checked(self.kubectl(ctx).args([
            "set".to_string(),
            "image".to_string(),
            target.clone(),
            format!("{}={}", self.container, image),
        ]))?;
        if self.wait {
            ctx.run_checked(self.kubectl(ctx).args(["rollout", "status", target.as_str()]))?;
        }
        state.record("deploy.image", image);
        Ok(())
    }
}
