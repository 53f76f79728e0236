//! Image-pull failure signatures from task stop reasons and log excerpts,
//! plus a registry check of the images involved.
//!
//! Images come from the failed pulls and from the newest revision of each
//! task-definition family conventionally named after the app (`web`,
//! `web-task`, `web-service`, `web-container`, `task-web`, `service-web`).
//! Images in the account's own registry are checked for repository and tag;
//! images hosted elsewhere are reported as unverifiable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use async_trait::async_trait;
use cluster_probe::{LogQuery, TaskDefinition, TaskRecord, TaskStatusFilter};
use regex::Regex;
use tracing::debug;

use super::{FetchContext, FetchOutcome, Fetcher};
use crate::domain::{Evidence, EvidenceSource, FetchError, Finding, PullSignature, Severity};

const SOURCE: EvidenceSource = EvidenceSource::ImagePull;

/// Terms used to pull registry errors out of log groups.
const LOG_PATTERN: &str = "CannotPullContainerError ImagePull manifest registry";

#[derive(Debug, Clone, Copy, Default)]
pub struct ImagePullFetcher;

struct SignatureRule {
    signature: PullSignature,
    regex: Regex,
}

/// Signature rules, checked in order.
fn rules() -> &'static [SignatureRule] {
    static RULES: OnceLock<Vec<SignatureRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                PullSignature::AuthenticationFailure,
                r"(?i)(pull access denied|unauthorized|authorization failed|no basic auth credentials|access ?denied|\b401\b|\b403\b|denied:)",
            ),
            (
                PullSignature::RepositoryNotFound,
                r"(?i)(repository\s+\S*\s*(does not exist|not found)|repositorynotfound|name unknown)",
            ),
            (
                PullSignature::ManifestNotFound,
                r"(?i)(manifest\s+(for\s+\S+\s+)?(unknown|not found)|not found: manifest|failed to resolve ref)",
            ),
            (
                PullSignature::RegistryUnreachable,
                r"(?i)(i/o timeout|dial tcp|no such host|context deadline exceeded|connection refused|network is unreachable|awaiting headers)",
            ),
        ]
        .into_iter()
        .filter_map(|(signature, pattern)| {
            Regex::new(pattern)
                .ok()
                .map(|regex| SignatureRule { signature, regex })
        })
        .collect()
    })
}

fn pull_context() -> Option<&'static Regex> {
    static PULL: OnceLock<Option<Regex>> = OnceLock::new();
    PULL.get_or_init(|| {
        Regex::new(
            r"(?i)(cannotpullcontainer|imagepull|pull access denied|(failed to |pulling |pull )image|manifest\s+(for\s+\S+\s+)?(unknown|not found)|not found: manifest|failed to resolve ref)",
        )
        .ok()
    })
    .as_ref()
}

/// Whether text describes a failed image pull. A bare mention of a
/// "manifest" (an application file, say) is not enough.
pub fn is_pull_failure(text: &str) -> bool {
    pull_context().is_some_and(|re| re.is_match(text))
}

/// An image reference split into registry host, repository and tag (or
/// digest). Unqualified names live on Docker Hub; a missing tag is `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Option<Self> {
        let image = image.trim();
        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest),
            None => {
                let last_segment = image.rfind('/').map_or(0, |i| i + 1);
                match image[last_segment..].rfind(':') {
                    Some(colon) => {
                        let at = last_segment + colon;
                        (&image[..at], &image[at + 1..])
                    }
                    None => (image, "latest"),
                }
            }
        };
        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host, rest)
            }
            _ => ("docker.io", name),
        };
        if repository.is_empty() || reference.is_empty() {
            return None;
        }
        Some(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    /// Hosted in the account's own registry, so it can be looked up.
    pub fn is_private_registry(&self) -> bool {
        self.registry.contains(".ecr.") && self.registry.ends_with("amazonaws.com")
    }
}

/// Family names a task definition for `name` conventionally carries.
fn family_variants(name: &str) -> Vec<String> {
    vec![
        name.to_string(),
        format!("{name}-task"),
        format!("{name}-service"),
        format!("{name}-container"),
        format!("task-{name}"),
        format!("service-{name}"),
    ]
}

/// `family` of an ARN or `family:revision` string.
fn family_of(arn: &str) -> &str {
    let tail = arn.rsplit('/').next().unwrap_or(arn);
    tail.rsplit_once(':').map_or(tail, |(family, _)| family)
}

/// Classify pull-failure text into the signature taxonomy.
pub fn classify_pull_failure(text: &str) -> PullSignature {
    rules()
        .iter()
        .find(|rule| rule.regex.is_match(text))
        .map(|rule| rule.signature)
        .unwrap_or(PullSignature::Unclassified)
}

/// Stop reasons of a task and its containers that describe a pull failure.
fn pull_texts(task: &TaskRecord) -> Vec<(Option<&str>, &str)> {
    let mut texts = Vec::new();
    if let Some(reason) = task.stopped_reason.as_deref().filter(|r| is_pull_failure(r)) {
        texts.push((None, reason));
    }
    for c in &task.containers {
        if let Some(reason) = c.reason.as_deref().filter(|r| is_pull_failure(r)) {
            texts.push((Some(c.name.as_str()), reason));
        }
    }
    texts
}

type DefinitionCache = HashMap<String, Option<TaskDefinition>>;

impl ImagePullFetcher {
    /// Describe a task definition once per run.
    async fn definition<'c>(
        &self,
        ctx: &FetchContext,
        arn: &str,
        cache: &'c mut DefinitionCache,
        out: &mut FetchOutcome,
    ) -> Option<&'c TaskDefinition> {
        if !cache.contains_key(arn) {
            let api = &ctx.collaborators.cluster;
            let definition = match ctx
                .controls
                .call("ecs:DescribeTaskDefinition", || api.describe_task_definition(arn))
                .await
            {
                Ok(def) => Some(def),
                Err(FetchError::NotFound { .. }) => None,
                Err(err) => {
                    out.absorb(SOURCE, err);
                    None
                }
            };
            cache.insert(arn.to_string(), definition);
        }
        cache.get(arn)?.as_ref()
    }

    /// Image of the named container (or the first essential one) in a task definition.
    async fn image_from_definition(
        &self,
        ctx: &FetchContext,
        arn: &str,
        container: Option<&str>,
        cache: &mut DefinitionCache,
        out: &mut FetchOutcome,
    ) -> Option<String> {
        let def = self.definition(ctx, arn, cache, out).await?;
        container
            .and_then(|name| def.container(name))
            .or_else(|| def.containers.iter().find(|c| c.essential))
            .map(|c| c.image.clone())
    }

    /// Newest revision of each conventionally named family, keyed by family.
    async fn related_definitions(
        &self,
        ctx: &FetchContext,
        name: &str,
        out: &mut FetchOutcome,
    ) -> BTreeMap<String, String> {
        let variants = family_variants(name);
        let api = &ctx.collaborators.cluster;
        let mut newest = BTreeMap::new();
        // `name` covers the `name-*` variants.
        for prefix in [name.to_string(), format!("task-{name}"), format!("service-{name}")] {
            let mut arns = ctx
                .controls
                .collect_pages("ecs:ListTaskDefinitions", |token| {
                    api.list_task_definitions(&prefix, token)
                })
                .await;
            if !matches!(arns.error, Some(FetchError::NotFound { .. })) {
                out.absorb_collected(SOURCE, "ecs:ListTaskDefinitions", &mut arns);
            }
            for arn in arns.items {
                let family = family_of(&arn).to_string();
                if variants.contains(&family) {
                    newest.entry(family).or_insert(arn);
                }
            }
        }
        newest
    }

    /// Look `image` up in the registry: missing repository, missing tag, or
    /// not checkable because it is hosted elsewhere.
    async fn check_registry(&self, ctx: &FetchContext, image: &str, out: &mut FetchOutcome) {
        let Some(parsed) = ImageRef::parse(image) else {
            debug!(image = %image, "unparseable image reference");
            return;
        };
        if !parsed.is_private_registry() {
            out.push(
                Evidence::new(
                    SOURCE,
                    Severity::Info,
                    Finding::ExternalImage {
                        image: image.to_string(),
                        registry: parsed.registry.clone(),
                    },
                    format!(
                        "image {image} is hosted on {}; its existence cannot be verified",
                        parsed.registry
                    ),
                )
                .with_raw("repository", parsed.repository.clone()),
            );
            return;
        }

        let registry = &ctx.collaborators.registry;
        match ctx
            .controls
            .call("ecr:DescribeRepositories", || {
                registry.describe_repository(&parsed.repository)
            })
            .await
        {
            Ok(_) => {}
            Err(FetchError::NotFound { .. }) => {
                out.push(Evidence::new(
                    SOURCE,
                    Severity::Error,
                    Finding::RepositoryMissing {
                        image: image.to_string(),
                        repository: parsed.repository.clone(),
                    },
                    format!(
                        "repository {} referenced by {image} does not exist",
                        parsed.repository
                    ),
                ));
                return;
            }
            Err(err) => {
                out.absorb(SOURCE, err);
                return;
            }
        }

        match ctx
            .controls
            .call("ecr:DescribeImages", || {
                registry.describe_image(&parsed.repository, &parsed.reference)
            })
            .await
        {
            Ok(found) => debug!(image = %image, digest = ?found.digest, "image present"),
            Err(FetchError::NotFound { .. }) => out.push(Evidence::new(
                SOURCE,
                Severity::Error,
                Finding::ImageMissing {
                    image: image.to_string(),
                    repository: parsed.repository.clone(),
                    reference: parsed.reference.clone(),
                },
                format!(
                    "image {} not found in repository {}",
                    parsed.reference, parsed.repository
                ),
            )),
            Err(err) => out.absorb(SOURCE, err),
        }
    }

    async fn scan_logs(&self, ctx: &FetchContext, out: &mut FetchOutcome) {
        let prefix = ctx
            .param("log_group_prefix")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.target.log_group_prefix());
        let api = &ctx.collaborators.logs;

        let mut groups = ctx
            .controls
            .collect_pages("logs:DescribeLogGroups", |token| {
                api.describe_log_groups(&prefix, token)
            })
            .await;
        // A missing log group says nothing about image pulls.
        if !matches!(groups.error, Some(FetchError::NotFound { .. })) {
            out.absorb_collected(SOURCE, "logs:DescribeLogGroups", &mut groups);
        }

        for group in &groups.items {
            let query = LogQuery {
                group: group.clone(),
                start: ctx.window.start(),
                end: ctx.window.end(),
                pattern: Some(LOG_PATTERN.to_string()),
                stream_contains: None,
            };
            let mut events = ctx
                .controls
                .collect_pages("logs:FilterLogEvents", |token| {
                    api.filter_log_events(&query, token)
                })
                .await;
            out.absorb_collected(SOURCE, "logs:FilterLogEvents", &mut events);

            for event in events.items.iter().filter(|e| is_pull_failure(&e.message)) {
                let signature = classify_pull_failure(&event.message);
                out.push(
                    Evidence::new(
                        SOURCE,
                        Severity::Error,
                        Finding::ImagePullFailure {
                            task_id: event.stream.clone(),
                            signature,
                            image: None,
                        },
                        format!(
                            "{} in log {group}: {}",
                            signature.as_str(),
                            event.message.trim_end()
                        ),
                    )
                    .with_timestamp(event.timestamp),
                );
            }
        }
    }
}

#[async_trait]
impl Fetcher for ImagePullFetcher {
    fn source(&self) -> EvidenceSource {
        SOURCE
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError> {
        let mut out = ctx.outcome();
        let cluster = ctx.target.cluster.as_str();
        let service = ctx.target.service.as_deref();
        let api = &ctx.collaborators.cluster;

        let mut stopped = ctx
            .controls
            .collect_pages("ecs:ListTasks", |token| {
                api.list_tasks(cluster, service, TaskStatusFilter::Stopped, token)
            })
            .await;
        out.absorb_collected(SOURCE, "ecs:ListTasks", &mut stopped);

        let mut definitions = DefinitionCache::new();
        let mut images = BTreeSet::new();
        for task in stopped
            .items
            .iter()
            .filter(|t| ctx.stopped_in_window(t))
        {
            for (container, text) in pull_texts(task) {
                let signature = classify_pull_failure(text);
                let mut image = container
                    .and_then(|name| task.containers.iter().find(|c| c.name == name))
                    .and_then(|c| c.image.clone());
                if image.is_none() {
                    image = self
                        .image_from_definition(
                            ctx,
                            &task.task_definition_arn,
                            container,
                            &mut definitions,
                            &mut out,
                        )
                        .await;
                }

                images.extend(image.clone());
                let subject = image.as_deref().unwrap_or("unknown image");
                out.push(
                    Evidence::new(
                        SOURCE,
                        Severity::Error,
                        Finding::ImagePullFailure {
                            task_id: task.task_id().to_string(),
                            signature,
                            image: image.clone(),
                        },
                        format!(
                            "task {} could not pull {subject} ({}): {text}",
                            task.task_id(),
                            signature.as_str()
                        ),
                    )
                    .with_optional_timestamp(task.stopped_at)
                    .with_raw("container", container.map(str::to_string))
                    .with_raw("task_definition", task.task_definition_arn.clone()),
                );
            }
        }

        let app = ctx.target.app_name.as_deref().or(ctx.target.service.as_deref());
        if let Some(name) = app {
            let related = self.related_definitions(ctx, name, &mut out).await;
            for arn in related.values() {
                if let Some(def) = self.definition(ctx, arn, &mut definitions, &mut out).await {
                    images.extend(def.containers.iter().map(|c| c.image.clone()));
                }
            }
        }
        for image in &images {
            self.check_registry(ctx, image, &mut out).await;
        }

        self.scan_logs(ctx, &mut out).await;
        debug!(
            findings = out.evidence.len(),
            images = images.len(),
            "image pull scan complete"
        );
        Ok(out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_signature() {
        let text = "CannotPullContainerError: Error response from daemon: pull access denied for 123.dkr.ecr.us-east-1.amazonaws.com/web, repository does not exist or may require 'docker login': denied: User is not authorized";
        assert!(is_pull_failure(text));
        assert_eq!(
            classify_pull_failure(text),
            PullSignature::AuthenticationFailure
        );
        assert_eq!(
            classify_pull_failure("ImagePull: no basic auth credentials"),
            PullSignature::AuthenticationFailure
        );
    }

    #[test]
    fn test_repository_and_manifest_signatures() {
        assert_eq!(
            classify_pull_failure(
                "CannotPullContainerError: repository web-app not found: name unknown"
            ),
            PullSignature::RepositoryNotFound
        );
        assert_eq!(
            classify_pull_failure(
                "CannotPullContainerError: failed to resolve ref docker.io/library/web:v9: not found"
            ),
            PullSignature::ManifestNotFound
        );
        assert_eq!(
            classify_pull_failure("manifest for web:v9 not found"),
            PullSignature::ManifestNotFound
        );
    }

    #[test]
    fn test_network_signature() {
        assert_eq!(
            classify_pull_failure(
                "CannotPullContainerError: dial tcp 52.1.2.3:443: i/o timeout"
            ),
            PullSignature::RegistryUnreachable
        );
    }

    #[test]
    fn test_unclassified_and_unrelated() {
        assert_eq!(
            classify_pull_failure("CannotPullContainerError: something odd"),
            PullSignature::Unclassified
        );
        assert!(!is_pull_failure("Essential container in task exited"));
    }

    #[test]
    fn test_manifest_mention_alone_is_not_a_pull_failure() {
        assert!(!is_pull_failure("loaded manifest.json with 12 routes"));
        assert!(!is_pull_failure("registry of plugins initialised"));
        assert!(is_pull_failure("manifest for web:v9 not found"));
        assert!(is_pull_failure("Failed to pull image \"web:v9\": rpc error"));
        assert!(is_pull_failure("Back-off pulling image web:v9"));
    }

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(rules().len(), 4);
        assert!(pull_context().is_some());
    }

    #[test]
    fn test_image_ref_parsing() {
        let ecr = ImageRef::parse("123.dkr.ecr.us-east-1.amazonaws.com/team/web:7").unwrap();
        assert_eq!(ecr.registry, "123.dkr.ecr.us-east-1.amazonaws.com");
        assert_eq!(ecr.repository, "team/web");
        assert_eq!(ecr.reference, "7");
        assert!(ecr.is_private_registry());

        let hub = ImageRef::parse("nginx").unwrap();
        assert_eq!(
            (hub.registry.as_str(), hub.repository.as_str(), hub.reference.as_str()),
            ("docker.io", "nginx", "latest")
        );
        assert!(!hub.is_private_registry());

        let local = ImageRef::parse("localhost:5000/web").unwrap();
        assert_eq!(local.registry, "localhost:5000");
        assert_eq!(local.reference, "latest");

        let pinned = ImageRef::parse("ghcr.io/acme/web@sha256:ab12").unwrap();
        assert_eq!(pinned.repository, "acme/web");
        assert_eq!(pinned.reference, "sha256:ab12");

        assert!(ImageRef::parse("web:").is_none());
    }

    #[test]
    fn test_family_names() {
        assert_eq!(family_of("arn:aws:ecs:r:1:task-definition/web-task:12"), "web-task");
        assert_eq!(family_of("web:7"), "web");
        assert!(family_variants("web").contains(&"service-web".to_string()));
    }
}
