//! Watched certificates and secrets
//!
//! Secrets and ConfigMaps referenced from the FlowCollector are resolved to a
//! digest of the referenced keys. Digests land in pod template annotations,
//! so rotating a certificate rolls the pods. References living in another
//! namespace are copied next to the workload that mounts them.

use crate::comparators::ChangeReport;
use crate::crd::{CertificateReference, ClientTls, FileReference, MountableType, SaslConfig};
use crate::error::{OperatorError, Result};
use crate::store::{ObjectKey, ObjectKind, ObjectStore};
use kube::api::DynamicObject;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Annotation marking an object copied from another namespace
pub const COPIED_FROM_ANNOTATION: &str = "flows.netobserv.io/copied-from";

const WATCHED_ANNOTATION_PREFIX: &str = "flows.netobserv.io/watched-";

/// Pod annotation holding the digest of a watched object
pub fn annotation(key: &str) -> String {
    format!("{}{}", WATCHED_ANNOTATION_PREFIX, key)
}

/// A Secret or ConfigMap and the keys that matter in it
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchedRef {
    kind: MountableType,
    name: String,
    namespace: String,
    keys: Vec<String>,
}

impl WatchedRef {
    fn from_cert(cert: &CertificateReference) -> Self {
        let keys = [&cert.cert_file, &cert.cert_key]
            .into_iter()
            .filter(|k| !k.is_empty())
            .cloned()
            .collect();
        Self {
            kind: cert.ref_type,
            name: cert.name.clone(),
            namespace: cert.namespace.clone(),
            keys,
        }
    }

    fn from_file(file: &FileReference) -> Self {
        Self {
            kind: file.ref_type,
            name: file.name.clone(),
            namespace: file.namespace.clone(),
            keys: vec![file.file.clone()],
        }
    }
}

fn object_kind(kind: MountableType) -> ObjectKind {
    match kind {
        MountableType::Secret => ObjectKind::Secret,
        MountableType::ConfigMap => ObjectKind::ConfigMap,
    }
}

fn watch_key(kind: MountableType, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind.kind(), namespace, name)
}

/// Digest of the selected keys of a Secret or ConfigMap
fn object_digest(obj: &DynamicObject, keys: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    for key in keys {
        let value = obj.data["data"].get(key).unwrap_or(&Value::Null);
        hasher.update(serde_json::to_vec(value)?);
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolves watched references and keeps track of the active ones
#[derive(Debug, Default)]
pub struct Watcher {
    watched: RwLock<HashMap<String, bool>>,
    default_namespace: RwLock<String>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a reconcile pass: every watch becomes inactive until resolved
    /// again, and those left unresolved by the previous pass are dropped
    pub fn reset(&self, default_namespace: &str) {
        *self.default_namespace.write() = default_namespace.to_string();
        let mut watched = self.watched.write();
        watched.retain(|_, active| *active);
        for active in watched.values_mut() {
            *active = false;
        }
    }

    /// Whether a change of this object should trigger a reconcile
    pub fn is_watched(&self, kind: MountableType, namespace: &str, name: &str) -> bool {
        self.watched
            .read()
            .get(&watch_key(kind, namespace, name))
            .copied()
            .unwrap_or(false)
    }

    /// Digests of the CA and user certificates of a client TLS config
    pub async fn process_mtls_certs(
        &self,
        store: &dyn ObjectStore,
        tls: &ClientTls,
        target_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<(Option<String>, Option<String>)> {
        let ca = self
            .process_ca_cert(store, tls, target_namespace, cancel)
            .await?;
        let user = if tls.enable && !tls.user_cert.name.is_empty() {
            Some(
                self.resolve(store, WatchedRef::from_cert(&tls.user_cert), target_namespace, cancel)
                    .await?,
            )
        } else {
            None
        };
        Ok((ca, user))
    }

    pub async fn process_ca_cert(
        &self,
        store: &dyn ObjectStore,
        tls: &ClientTls,
        target_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if !tls.enable || tls.ca_cert.name.is_empty() {
            return Ok(None);
        }
        let digest = self
            .resolve(store, WatchedRef::from_cert(&tls.ca_cert), target_namespace, cancel)
            .await?;
        Ok(Some(digest))
    }

    pub async fn process_cert_ref(
        &self,
        store: &dyn ObjectStore,
        cert: &CertificateReference,
        target_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.resolve(store, WatchedRef::from_cert(cert), target_namespace, cancel)
            .await
    }

    /// Digests of the client id and client secret files
    pub async fn process_sasl(
        &self,
        store: &dyn ObjectStore,
        sasl: &SaslConfig,
        target_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, String)> {
        let id = self
            .resolve(
                store,
                WatchedRef::from_file(&sasl.client_id_reference),
                target_namespace,
                cancel,
            )
            .await?;
        let secret = self
            .resolve(
                store,
                WatchedRef::from_file(&sasl.client_secret_reference),
                target_namespace,
                cancel,
            )
            .await?;
        Ok((id, secret))
    }

    async fn resolve(
        &self,
        store: &dyn ObjectStore,
        mut reference: WatchedRef,
        target_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if reference.namespace.is_empty() {
            reference.namespace = self.default_namespace.read().clone();
        }
        let kind = object_kind(reference.kind);
        let source_key = ObjectKey::new(kind, &reference.namespace, &reference.name);
        let source = store.get(&source_key, cancel).await?.ok_or_else(|| {
            OperatorError::NotFound {
                kind: kind.to_string(),
                name: reference.name.clone(),
                namespace: reference.namespace.clone(),
            }
        })?;
        self.watched.write().insert(
            watch_key(reference.kind, &reference.namespace, &reference.name),
            true,
        );
        let digest = object_digest(&source, &reference.keys)?;

        if reference.namespace != target_namespace {
            self.copy_to(store, &reference, &source, &digest, target_namespace, cancel)
                .await?;
        }
        Ok(digest)
    }

    async fn copy_to(
        &self,
        store: &dyn ObjectStore,
        reference: &WatchedRef,
        source: &DynamicObject,
        digest: &str,
        target_namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut report = ChangeReport::new(format!(
            "Watcher for {} {}",
            reference.kind.kind(),
            reference.name
        ));
        let target_key = ObjectKey::new(object_kind(reference.kind), target_namespace, &reference.name);
        match store.get(&target_key, cancel).await? {
            None => {
                info!(object = %target_key, "Copying watched object");
                let mut copy = source.clone();
                copy.metadata = Default::default();
                copy.metadata.name = Some(reference.name.clone());
                copy.metadata.namespace = Some(target_namespace.to_string());
                copy.metadata.annotations = Some(BTreeMap::from([(
                    COPIED_FROM_ANNOTATION.to_string(),
                    format!("{}/{}", reference.namespace, reference.name),
                )]));
                store.create(&copy, cancel).await?;
            }
            Some(mut target) => {
                let target_digest = object_digest(&target, &reference.keys)?;
                if report.check("Digest changed", target_digest != digest) {
                    info!(object = %target_key, "Updating copy of watched object");
                    target.data["data"] = source.data["data"].clone();
                    store.update(&target, cancel).await?;
                }
            }
        }
        report.log();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryStore, WriteOp};
    use crate::store::to_dynamic;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn create_test_secret(ns: &str, name: &str, cert: &str) -> DynamicObject {
        to_dynamic(&Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("tls.crt".to_string(), ByteString(cert.as_bytes().to_vec())),
                ("tls.key".to_string(), ByteString(b"key".to_vec())),
            ])),
            ..Default::default()
        })
        .unwrap()
    }

    fn create_test_cert(ns: &str, name: &str) -> CertificateReference {
        CertificateReference {
            ref_type: MountableType::Secret,
            name: name.to_string(),
            namespace: ns.to_string(),
            cert_file: "tls.crt".to_string(),
            cert_key: "tls.key".to_string(),
        }
    }

    #[tokio::test]
    async fn test_digest_follows_content() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let watcher = Watcher::new();
        watcher.reset("netobserv");
        store.insert(create_test_secret("netobserv", "kafka-user", "v1"));

        let cert = create_test_cert("", "kafka-user");
        let first = watcher
            .process_cert_ref(&store, &cert, "netobserv", &cancel)
            .await
            .unwrap();
        let again = watcher
            .process_cert_ref(&store, &cert, "netobserv", &cancel)
            .await
            .unwrap();
        assert_eq!(first, again);
        assert!(store.writes().is_empty());

        store.insert(create_test_secret("netobserv", "kafka-user", "v2"));
        let rotated = watcher
            .process_cert_ref(&store, &cert, "netobserv", &cancel)
            .await
            .unwrap();
        assert_ne!(first, rotated);
        assert!(watcher.is_watched(MountableType::Secret, "netobserv", "kafka-user"));
    }

    #[tokio::test]
    async fn test_unused_references_are_forgotten() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let watcher = Watcher::new();
        store.insert(create_test_secret("netobserv", "old-cert", "v1"));
        store.insert(create_test_secret("netobserv", "new-cert", "v1"));

        watcher.reset("netobserv");
        watcher
            .process_cert_ref(&store, &create_test_cert("", "old-cert"), "netobserv", &cancel)
            .await
            .unwrap();

        // The next pass uses another certificate
        watcher.reset("netobserv");
        watcher
            .process_cert_ref(&store, &create_test_cert("", "new-cert"), "netobserv", &cancel)
            .await
            .unwrap();
        assert!(!watcher.is_watched(MountableType::Secret, "netobserv", "old-cert"));
        assert!(watcher.is_watched(MountableType::Secret, "netobserv", "new-cert"));

        watcher.reset("netobserv");
        assert_eq!(watcher.watched.read().len(), 1);
        watcher.reset("netobserv");
        assert!(watcher.watched.read().is_empty());
    }

    #[tokio::test]
    async fn test_copy_to_target_namespace() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let watcher = Watcher::new();
        watcher.reset("netobserv");
        store.insert(create_test_secret("kafka", "kafka-ca", "v1"));
        let cert = create_test_cert("kafka", "kafka-ca");

        watcher
            .process_cert_ref(&store, &cert, "netobserv", &cancel)
            .await
            .unwrap();
        let target = ObjectKey::new(ObjectKind::Secret, "netobserv", "kafka-ca");
        let copy = store.object(&target).unwrap();
        assert_eq!(
            copy.metadata.annotations.unwrap()[COPIED_FROM_ANNOTATION],
            "kafka/kafka-ca"
        );

        // Unchanged source: no write
        store.clear_writes();
        watcher
            .process_cert_ref(&store, &cert, "netobserv", &cancel)
            .await
            .unwrap();
        assert!(store.writes().is_empty());

        store.insert(create_test_secret("kafka", "kafka-ca", "v2"));
        watcher
            .process_cert_ref(&store, &cert, "netobserv", &cancel)
            .await
            .unwrap();
        assert_eq!(store.writes(), vec![(WriteOp::Update, target)]);
    }

    #[tokio::test]
    async fn test_reset_deactivates_watches() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let watcher = Watcher::new();
        watcher.reset("netobserv");
        store.insert(
            to_dynamic(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some("loki-ca".to_string()),
                    namespace: Some("netobserv".to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([("ca.crt".to_string(), "pem".to_string())])),
                ..Default::default()
            })
            .unwrap(),
        );
        let tls = ClientTls {
            enable: true,
            insecure_skip_verify: false,
            ca_cert: CertificateReference {
                ref_type: MountableType::ConfigMap,
                name: "loki-ca".to_string(),
                namespace: String::new(),
                cert_file: "ca.crt".to_string(),
                cert_key: String::new(),
            },
            user_cert: CertificateReference::default(),
        };
        let (ca, user) = watcher
            .process_mtls_certs(&store, &tls, "netobserv", &cancel)
            .await
            .unwrap();
        assert!(ca.is_some());
        assert!(user.is_none());
        assert!(watcher.is_watched(MountableType::ConfigMap, "netobserv", "loki-ca"));

        watcher.reset("netobserv");
        assert!(!watcher.is_watched(MountableType::ConfigMap, "netobserv", "loki-ca"));
    }

    #[tokio::test]
    async fn test_missing_reference_is_an_error() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let watcher = Watcher::new();
        watcher.reset("netobserv");
        let err = watcher
            .process_cert_ref(&store, &create_test_cert("", "nope"), "netobserv", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_annotation() {
        assert_eq!(annotation("kafka-ca"), "flows.netobserv.io/watched-kafka-ca");
    }
}
