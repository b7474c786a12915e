//! Deployment audit events
//!
//! One [`AuditEvent`] is published when a rollout is applied (`initialized`)
//! and one when the monitor sees it finish (`complete`). Transport is behind
//! [`AuditPublisher`]; the operator logs events as structured JSON, embedders
//! can consume them from a channel instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_common::crd::RolloutStatus;
use keel_common::{
    COMMIT_REF_ANNOTATION, DEPLOYER_EMAIL_ANNOTATION, DEPLOYER_IDENT_ANNOTATION,
    DEPLOYER_NAME_ANNOTATION, SOURCE_SYSTEM, TEAM_LABEL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::rollout::Rollout;

// =============================================================================
// Image references
// =============================================================================

/// Registry prefix for single-segment image names pinned by digest
pub const DEFAULT_REGISTRY_PREFIX: &str = "docker.io/library/";

/// Tag assumed when an image names none
pub const DEFAULT_TAG: &str = "latest";

/// An image string that cannot be parsed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageParseError {
    /// Empty string
    #[error("image reference is empty")]
    Empty,
    /// Contains whitespace
    #[error("image reference {0:?} contains whitespace")]
    Whitespace(String),
    /// Nothing before the tag or digest
    #[error("image reference {0:?} has no name")]
    EmptyName(String),
    /// Trailing `:` with no tag
    #[error("image reference {0:?} has an empty tag")]
    EmptyTag(String),
    /// Trailing `@` with no digest
    #[error("image reference {0:?} has an empty digest")]
    EmptyDigest(String),
}

/// Tag or digest part of an image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageReference {
    /// Mutable tag, e.g. `v1`
    Tag(String),
    /// Content digest, e.g. `sha256:abc`
    Digest(String),
}

/// A parsed container image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    /// Repository, including registry host when given
    pub name: String,
    /// Tag or digest
    pub reference: ImageReference,
}

impl ImageRef {
    /// Parse `name[:tag]` or `name@digest`
    ///
    /// ```
    /// use keel_engine::audit::{ImageRef, ImageReference};
    ///
    /// let image = ImageRef::parse("localhost:5000/app").unwrap();
    /// assert_eq!(image.name, "localhost:5000/app");
    /// assert_eq!(image.reference, ImageReference::Tag("latest".to_string()));
    /// ```
    pub fn parse(image: &str) -> Result<Self, ImageParseError> {
        if image.is_empty() {
            return Err(ImageParseError::Empty);
        }
        if image.chars().any(char::is_whitespace) {
            return Err(ImageParseError::Whitespace(image.to_string()));
        }

        if let Some((name, digest)) = image.rsplit_once('@') {
            if name.is_empty() {
                return Err(ImageParseError::EmptyName(image.to_string()));
            }
            if digest.is_empty() {
                return Err(ImageParseError::EmptyDigest(image.to_string()));
            }
            let name = if name.contains('/') {
                name.to_string()
            } else {
                format!("{}{}", DEFAULT_REGISTRY_PREFIX, name)
            };
            return Ok(Self {
                name,
                reference: ImageReference::Digest(digest.to_string()),
            });
        }

        // A ':' before the last '/' belongs to a registry port
        let last_segment = image.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match image[last_segment..].rfind(':') {
            Some(i) => {
                let split = last_segment + i;
                (&image[..split], &image[split + 1..])
            }
            None => (image, DEFAULT_TAG),
        };
        if name.is_empty() || name.ends_with('/') {
            return Err(ImageParseError::EmptyName(image.to_string()));
        }
        if tag.is_empty() {
            return Err(ImageParseError::EmptyTag(image.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            reference: ImageReference::Tag(tag.to_string()),
        })
    }

    /// The tag or digest
    pub fn version(&self) -> &str {
        match &self.reference {
            ImageReference::Tag(tag) => tag,
            ImageReference::Digest(digest) => digest,
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reference {
            ImageReference::Tag(tag) => write!(f, "{}:{}", self.name, tag),
            ImageReference::Digest(digest) => write!(f, "{}@{}", self.name, digest),
        }
    }
}

/// Image as published on the audit bus: a name plus exactly one of tag or digest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerImage {
    /// Repository, including registry host when given
    pub name: String,
    /// Tag, absent for digest-pinned images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Digest, absent for tagged images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl From<&ImageRef> for ContainerImage {
    fn from(image: &ImageRef) -> Self {
        let (tag, digest) = match &image.reference {
            ImageReference::Tag(tag) => (Some(tag.clone()), None),
            ImageReference::Digest(digest) => (None, Some(digest.clone())),
        };
        Self {
            name: image.name.clone(),
            tag,
            digest,
        }
    }
}

impl std::fmt::Display for ContainerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => write!(f, "{}@{}", self.name, digest),
            (Some(tag), None) => write!(f, "{}:{}", self.name, tag),
            (None, None) => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Audit event
// =============================================================================

/// Deployment environment derived from the cluster name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Cluster name starts with `prod`
    Production,
    /// Everything else
    Development,
}

impl Environment {
    /// Classify a cluster
    pub fn for_cluster(cluster_name: &str) -> Self {
        if cluster_name.starts_with("prod") {
            Self::Production
        } else {
            Self::Development
        }
    }
}

/// Platform the deployment ran on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Always `kubernetes`
    #[serde(rename = "type")]
    pub type_: String,
    /// Always `keel`
    pub variant: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            type_: "kubernetes".to_string(),
            variant: SOURCE_SYSTEM.to_string(),
        }
    }
}

/// Who triggered the deployment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployer {
    /// Identity (e.g. username)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ident: Option<String>,
    /// Email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Deployment record sent to the audit bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Correlation id of the rollout
    pub correlation_id: String,
    /// Platform description
    pub platform: Platform,
    /// Always `keel`
    pub source_system: String,
    /// Who deployed, when annotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployer: Option<Deployer>,
    /// Owning team (label, else namespace)
    pub team: String,
    /// `initialized` or `complete`
    pub rollout_status: RolloutStatus,
    /// Production or development
    pub environment: Environment,
    /// Source namespace
    pub namespace: String,
    /// Cluster name
    pub cluster: String,
    /// Source name
    pub application_name: String,
    /// Image tag or digest
    pub version: String,
    /// Main container image
    pub image: ContainerImage,
    /// When the event was built
    pub timestamp: DateTime<Utc>,
    /// Commit the image was built from, when annotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_reference: Option<String>,
}

impl AuditEvent {
    /// Build the event for a rollout
    pub fn for_rollout(rollout: &Rollout, status: RolloutStatus, timestamp: DateTime<Utc>) -> Self {
        let source = &rollout.source;
        let annotation = |key: &str| source.annotation(key).map(str::to_string);

        let deployer = Deployer {
            ident: annotation(DEPLOYER_IDENT_ANNOTATION),
            email: annotation(DEPLOYER_EMAIL_ANNOTATION),
            name: annotation(DEPLOYER_NAME_ANNOTATION),
        };
        let deployer = (deployer != Deployer::default()).then_some(deployer);

        let team = source
            .labels()
            .remove(TEAM_LABEL)
            .unwrap_or_else(|| rollout.key.namespace.clone());

        Self {
            correlation_id: rollout.correlation_id.clone(),
            platform: Platform::default(),
            source_system: SOURCE_SYSTEM.to_string(),
            deployer,
            team,
            rollout_status: status,
            environment: Environment::for_cluster(&rollout.options.cluster_name),
            namespace: rollout.key.namespace.clone(),
            cluster: rollout.options.cluster_name.clone(),
            application_name: rollout.key.name.clone(),
            version: rollout.image.version().to_string(),
            image: ContainerImage::from(&rollout.image),
            timestamp,
            commit_reference: annotation(COMMIT_REF_ANNOTATION),
        }
    }
}

// =============================================================================
// Publishers
// =============================================================================

/// Failure to hand an event to the audit bus
#[derive(Debug, Error)]
pub enum AuditError {
    /// The transport rejected or dropped the event
    #[error("audit publish failed: {0}")]
    Publish(String),
}

/// Transport for audit events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditPublisher: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes each event as one JSON log line on the `keel::audit` target
pub struct LogAuditPublisher;

#[async_trait]
impl AuditPublisher for LogAuditPublisher {
    async fn publish(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let payload =
            serde_json::to_string(event).map_err(|e| AuditError::Publish(e.to_string()))?;
        info!(
            target: "keel::audit",
            correlation_id = %event.correlation_id,
            rollout_status = %event.rollout_status,
            event = %payload,
            "deployment audit event"
        );
        Ok(())
    }
}

/// Sends events to an in-process consumer
pub struct ChannelAuditPublisher {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditPublisher {
    /// Create a publisher and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AuditPublisher for ChannelAuditPublisher {
    async fn publish(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| AuditError::Publish("audit channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_rollout;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn tag(name: &str, tag: &str) -> ImageRef {
        ImageRef {
            name: name.to_string(),
            reference: ImageReference::Tag(tag.to_string()),
        }
    }

    #[test]
    fn parses_tagged_images() {
        assert_eq!(ImageRef::parse("repo/app:v1").unwrap(), tag("repo/app", "v1"));
        assert_eq!(ImageRef::parse("nginx").unwrap(), tag("nginx", "latest"));
        assert_eq!(
            ImageRef::parse("registry.io:5000/team/app:1.2").unwrap(),
            tag("registry.io:5000/team/app", "1.2")
        );
    }

    #[test]
    fn digest_images_get_default_registry_for_single_segment_names() {
        let image = ImageRef::parse("nginx@sha256:abc").unwrap();
        assert_eq!(image.name, "docker.io/library/nginx");
        assert_eq!(image.version(), "sha256:abc");
        assert_eq!(image.to_string(), "docker.io/library/nginx@sha256:abc");

        let image = ImageRef::parse("gcr.io/team/app@sha256:def").unwrap();
        assert_eq!(image.name, "gcr.io/team/app");
    }

    #[test]
    fn rejects_malformed_images() {
        assert_eq!(ImageRef::parse(""), Err(ImageParseError::Empty));
        assert!(matches!(
            ImageRef::parse("repo/app :v1"),
            Err(ImageParseError::Whitespace(_))
        ));
        assert!(matches!(
            ImageRef::parse("repo/app:"),
            Err(ImageParseError::EmptyTag(_))
        ));
        assert!(matches!(
            ImageRef::parse("repo/app@"),
            Err(ImageParseError::EmptyDigest(_))
        ));
        assert!(matches!(
            ImageRef::parse("@sha256:abc"),
            Err(ImageParseError::EmptyName(_))
        ));
        assert!(matches!(
            ImageRef::parse(":v1"),
            Err(ImageParseError::EmptyName(_))
        ));
    }

    #[test]
    fn environment_follows_cluster_prefix() {
        assert_eq!(Environment::for_cluster("prod-eu-1"), Environment::Production);
        assert_eq!(Environment::for_cluster("staging"), Environment::Development);
        assert_eq!(Environment::for_cluster("preprod"), Environment::Development);
    }

    /// Story: the audit record describes who deployed what, where
    #[test]
    fn story_event_built_from_rollout() {
        let mut rollout = sample_rollout("app-a", "team-a", "repo/app:v1");
        rollout.options.cluster_name = "prod-us".to_string();
        rollout.source.meta_mut().annotations = Some(BTreeMap::from([
            (DEPLOYER_EMAIL_ANNOTATION.to_string(), "dev@example.com".to_string()),
            (COMMIT_REF_ANNOTATION.to_string(), "abc123".to_string()),
        ]));
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        let event = AuditEvent::for_rollout(&rollout, RolloutStatus::Complete, at);

        assert_eq!(event.correlation_id, rollout.correlation_id);
        assert_eq!(event.team, "team-a");
        assert_eq!(event.environment, Environment::Production);
        assert_eq!(event.version, "v1");
        assert_eq!(event.image.to_string(), "repo/app:v1");
        assert_eq!(event.commit_reference.as_deref(), Some("abc123"));
        let deployer = event.deployer.clone().unwrap();
        assert_eq!(deployer.email.as_deref(), Some("dev@example.com"));
        assert_eq!(deployer.ident, None);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["platform"]["type"], "kubernetes");
        assert_eq!(json["platform"]["variant"], "keel");
        assert_eq!(json["sourceSystem"], "keel");
        assert_eq!(json["rolloutStatus"], "complete");
        assert_eq!(json["applicationName"], "app-a");
        assert_eq!(
            json["image"],
            serde_json::json!({"name": "repo/app", "tag": "v1"})
        );
    }

    #[test]
    fn digest_pinned_image_publishes_digest_without_tag() {
        let rollout = sample_rollout("app-a", "team-a", "nginx@sha256:abc");

        let event = AuditEvent::for_rollout(&rollout, RolloutStatus::Initialized, Utc::now());

        assert_eq!(event.version, "sha256:abc");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json["image"],
            serde_json::json!({"name": "docker.io/library/nginx", "digest": "sha256:abc"})
        );
        assert_eq!(event.image.to_string(), "docker.io/library/nginx@sha256:abc");
    }

    #[test]
    fn team_label_overrides_namespace() {
        let mut rollout = sample_rollout("app-a", "team-a", "repo/app:v1");
        rollout.source.meta_mut().labels =
            Some(BTreeMap::from([(TEAM_LABEL.to_string(), "payments".to_string())]));

        let event = AuditEvent::for_rollout(&rollout, RolloutStatus::Initialized, Utc::now());

        assert_eq!(event.team, "payments");
        assert!(event.deployer.is_none());
    }

    #[tokio::test]
    async fn channel_publisher_delivers_events() {
        let (publisher, mut rx) = ChannelAuditPublisher::new(4);
        let rollout = sample_rollout("app-a", "team-a", "repo/app:v1");
        let event = AuditEvent::for_rollout(&rollout, RolloutStatus::Complete, Utc::now());

        publisher.publish(&event).await.unwrap();
        assert_eq!(rx.recv().await, Some(event.clone()));

        drop(rx);
        assert!(publisher.publish(&event).await.is_err());
    }

    #[tokio::test]
    async fn log_publisher_accepts_events() {
        let rollout = sample_rollout("app-a", "team-a", "repo/app:v1");
        let event = AuditEvent::for_rollout(&rollout, RolloutStatus::Initialized, Utc::now());
        assert!(LogAuditPublisher.publish(&event).await.is_ok());
    }
}
