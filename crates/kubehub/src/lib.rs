//! Cairn kubehub: the narrow resource-store surface the workflows need.
//!
//! Only three kinds are touched: opaque key-value Secrets and ConfigMaps, and
//! RoleBinding subject lists. `KubeStore` talks to the cluster through kube-rs;
//! `MemoryStore` keeps everything in process for tests and dry runs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cairn_core::{Error, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use metrics::counter;
use tracing::debug;

pub use k8s_openapi::api::rbac::v1::Subject;

/// Key-value payload of a Secret or ConfigMap.
pub type Data = BTreeMap<String, Vec<u8>>;
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    ConfigMap,
    Secret,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::ConfigMap => "configmap",
            DataKind::Secret => "secret",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a payload from string pairs.
pub fn data_from<K, V, I>(pairs: I) -> Data
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<[u8]>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.as_ref().to_vec())).collect()
}

/// Render a payload as strings (lossy for non UTF-8 values).
pub fn data_to_strings(data: &Data) -> BTreeMap<String, String> {
    data.iter().map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned())).collect()
}

/// Namespaced get/create/patch over Secrets, ConfigMaps and RoleBinding subjects.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, kind: DataKind, namespace: &str, name: &str) -> Result<Option<Data>>;

    /// Fails with `Error::AlreadyExists` when the object is present.
    async fn create_labeled(&self, kind: DataKind, namespace: &str, name: &str, data: &Data, labels: &Labels) -> Result<()>;

    async fn create(&self, kind: DataKind, namespace: &str, name: &str, data: &Data) -> Result<()> {
        self.create_labeled(kind, namespace, name, data, &Labels::new()).await
    }

    /// Merge `data` keys into an existing object; other keys are kept.
    async fn patch(&self, kind: DataKind, namespace: &str, name: &str, data: &Data) -> Result<()>;

    /// Subjects of an existing RoleBinding; `Error::NotFound` when absent.
    async fn role_binding_subjects(&self, namespace: &str, name: &str) -> Result<Vec<Subject>>;

    /// Replace the subject list of an existing RoleBinding.
    async fn patch_role_binding_subjects(&self, namespace: &str, name: &str, subjects: &[Subject]) -> Result<()>;
}

// ----------------- kube-rs implementation -----------------

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the in-cluster or kubeconfig defaults.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| Error::store(format!("kube client: {}", e)))?;
        Ok(Self { client })
    }

    fn map_err(e: kube::Error, kind: &'static str, namespace: &str, name: &str) -> Error {
        let target = format!("{}/{}", namespace, name);
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, target),
            kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists(format!("{} {}", kind, target)),
            other => {
                counter!("store_errors_total", 1u64);
                Error::store(format!("{} {}: {}", kind, target, other))
            }
        }
    }

    fn meta(namespace: &str, name: &str, labels: &Labels) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: if labels.is_empty() { None } else { Some(labels.clone()) },
            ..Default::default()
        }
    }
}

fn config_map_strings(data: &Data) -> Result<BTreeMap<String, String>> {
    data.iter()
        .map(|(k, v)| {
            String::from_utf8(v.clone())
                .map(|s| (k.clone(), s))
                .map_err(|_| Error::invalid_params(format!("config map value for {} is not UTF-8", k)))
        })
        .collect()
}

fn secret_bytes(data: &Data) -> BTreeMap<String, ByteString> {
    data.iter().map(|(k, v)| (k.clone(), ByteString(v.clone()))).collect()
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, kind: DataKind, namespace: &str, name: &str) -> Result<Option<Data>> {
        debug!(%kind, ns = %namespace, name = %name, "store get");
        match kind {
            DataKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let cm = api.get_opt(name).await.map_err(|e| Self::map_err(e, kind.as_str(), namespace, name))?;
                Ok(cm.map(|cm| cm.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.into_bytes())).collect()))
            }
            DataKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let s = api.get_opt(name).await.map_err(|e| Self::map_err(e, kind.as_str(), namespace, name))?;
                Ok(s.map(|s| s.data.unwrap_or_default().into_iter().map(|(k, v)| (k, v.0)).collect()))
            }
        }
    }

    async fn create_labeled(&self, kind: DataKind, namespace: &str, name: &str, data: &Data, labels: &Labels) -> Result<()> {
        debug!(%kind, ns = %namespace, name = %name, keys = data.len(), "store create");
        let pp = PostParams::default();
        match kind {
            DataKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let cm = ConfigMap { metadata: Self::meta(namespace, name, labels), data: Some(config_map_strings(data)?), ..Default::default() };
                api.create(&pp, &cm).await.map_err(|e| Self::map_err(e, kind.as_str(), namespace, name))?;
            }
            DataKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let s = Secret { metadata: Self::meta(namespace, name, labels), data: Some(secret_bytes(data)), ..Default::default() };
                api.create(&pp, &s).await.map_err(|e| Self::map_err(e, kind.as_str(), namespace, name))?;
            }
        }
        Ok(())
    }

    async fn patch(&self, kind: DataKind, namespace: &str, name: &str, data: &Data) -> Result<()> {
        debug!(%kind, ns = %namespace, name = %name, keys = data.len(), "store patch");
        let pp = PatchParams::default();
        match kind {
            DataKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let payload = serde_json::json!({ "data": config_map_strings(data)? });
                api.patch(name, &pp, &Patch::Merge(&payload)).await.map_err(|e| Self::map_err(e, kind.as_str(), namespace, name))?;
            }
            DataKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let payload = serde_json::json!({ "data": secret_bytes(data) });
                api.patch(name, &pp, &Patch::Merge(&payload)).await.map_err(|e| Self::map_err(e, kind.as_str(), namespace, name))?;
            }
        }
        Ok(())
    }

    async fn role_binding_subjects(&self, namespace: &str, name: &str) -> Result<Vec<Subject>> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let rb = api.get(name).await.map_err(|e| Self::map_err(e, "rolebinding", namespace, name))?;
        Ok(rb.subjects.unwrap_or_default())
    }

    async fn patch_role_binding_subjects(&self, namespace: &str, name: &str, subjects: &[Subject]) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        // Merge patch replaces lists wholesale, so the caller sends the full set.
        let payload = serde_json::json!({ "subjects": subjects });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .map_err(|e| Self::map_err(e, "rolebinding", namespace, name))?;
        Ok(())
    }
}

// ----------------- In-memory implementation -----------------

type ObjectKey = (DataKind, String, String);

#[derive(Default)]
struct MemoryInner {
    objects: BTreeMap<ObjectKey, (Data, Labels)>,
    role_bindings: BTreeMap<(String, String), Vec<Subject>>,
    creates: usize,
    patches: usize,
}

/// Process-local store with the same not-found / already-exists behavior as the cluster.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object directly, replacing any previous content.
    pub fn insert(&self, kind: DataKind, namespace: &str, name: &str, data: Data) {
        self.lock().objects.insert((kind, namespace.to_string(), name.to_string()), (data, Labels::new()));
    }

    pub fn insert_role_binding(&self, namespace: &str, name: &str, subjects: Vec<Subject>) {
        self.lock().role_bindings.insert((namespace.to_string(), name.to_string()), subjects);
    }

    pub fn labels(&self, kind: DataKind, namespace: &str, name: &str) -> Option<Labels> {
        self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).map(|(_, l)| l.clone())
    }

    /// Number of successful create and patch calls, for idempotency assertions.
    pub fn write_counts(&self) -> (usize, usize) {
        let g = self.lock();
        (g.creates, g.patches)
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, kind: DataKind, namespace: &str, name: &str) -> Result<Option<Data>> {
        Ok(self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).map(|(d, _)| d.clone()))
    }

    async fn create_labeled(&self, kind: DataKind, namespace: &str, name: &str, data: &Data, labels: &Labels) -> Result<()> {
        if kind == DataKind::ConfigMap {
            config_map_strings(data)?;
        }
        let mut g = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        if g.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("{} {}/{}", kind, namespace, name)));
        }
        g.objects.insert(key, (data.clone(), labels.clone()));
        g.creates += 1;
        Ok(())
    }

    async fn patch(&self, kind: DataKind, namespace: &str, name: &str, data: &Data) -> Result<()> {
        if kind == DataKind::ConfigMap {
            config_map_strings(data)?;
        }
        let mut g = self.lock();
        let (existing, _) = g
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found(kind.as_str(), format!("{}/{}", namespace, name)))?;
        existing.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        g.patches += 1;
        Ok(())
    }

    async fn role_binding_subjects(&self, namespace: &str, name: &str) -> Result<Vec<Subject>> {
        self.lock()
            .role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("rolebinding", format!("{}/{}", namespace, name)))
    }

    async fn patch_role_binding_subjects(&self, namespace: &str, name: &str, subjects: &[Subject]) -> Result<()> {
        let mut g = self.lock();
        let slot = g
            .role_bindings
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::not_found("rolebinding", format!("{}/{}", namespace, name)))?;
        *slot = subjects.to_vec();
        g.patches += 1;
        Ok(())
    }
}

pub mod testing {
    //! One-shot fault injection over `MemoryStore`, keyed by object name.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    pub struct FaultyStore {
        inner: Arc<MemoryStore>,
        stale_gets: Mutex<HashSet<String>>,
        failing_creates: Mutex<HashMap<String, Error>>,
    }

    impl FaultyStore {
        pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
            Arc::new(Self { inner, stale_gets: Mutex::new(HashSet::new()), failing_creates: Mutex::new(HashMap::new()) })
        }

        pub fn inner(&self) -> &MemoryStore {
            &self.inner
        }

        /// The next `get` of `name` reports it absent even if it exists.
        pub fn stale_get(&self, name: &str) {
            self.stale_gets.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string());
        }

        /// The next `create` of `name` fails with `err` and writes nothing.
        pub fn fail_create(&self, name: &str, err: Error) {
            self.failing_creates.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string(), err);
        }
    }

    #[async_trait::async_trait]
    impl ResourceStore for FaultyStore {
        async fn get(&self, kind: DataKind, namespace: &str, name: &str) -> Result<Option<Data>> {
            if self.stale_gets.lock().unwrap_or_else(PoisonError::into_inner).remove(name) {
                return Ok(None);
            }
            self.inner.get(kind, namespace, name).await
        }

        async fn create_labeled(&self, kind: DataKind, namespace: &str, name: &str, data: &Data, labels: &Labels) -> Result<()> {
            let injected = self.failing_creates.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
            match injected {
                Some(err) => Err(err),
                None => self.inner.create_labeled(kind, namespace, name, data, labels).await,
            }
        }

        async fn patch(&self, kind: DataKind, namespace: &str, name: &str, data: &Data) -> Result<()> {
            self.inner.patch(kind, namespace, name, data).await
        }

        async fn role_binding_subjects(&self, namespace: &str, name: &str) -> Result<Vec<Subject>> {
            self.inner.role_binding_subjects(namespace, name).await
        }

        async fn patch_role_binding_subjects(&self, namespace: &str, name: &str, subjects: &[Subject]) -> Result<()> {
            self.inner.patch_role_binding_subjects(namespace, name, subjects).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_create_then_conflict() {
        let s = MemoryStore::new();
        let d = data_from([("k", "v")]);
        s.create(DataKind::Secret, "ns", "x", &d).await.unwrap();
        let err = s.create(DataKind::Secret, "ns", "x", &d).await.unwrap_err();
        assert!(err.is_already_exists(), "err={}", err);
        // Kinds and namespaces are separate keyspaces.
        s.create(DataKind::ConfigMap, "ns", "x", &d).await.unwrap();
        s.create(DataKind::Secret, "other", "x", &d).await.unwrap();
        assert_eq!(s.write_counts(), (3, 0));
    }

    #[tokio::test]
    async fn memory_store_patch_merges_keys() {
        let s = MemoryStore::new();
        s.insert(DataKind::ConfigMap, "ns", "cm", data_from([("a", "0"), ("b", "keep")]));
        s.patch(DataKind::ConfigMap, "ns", "cm", &data_from([("a", "1"), ("c", "new")])).await.unwrap();
        let got = data_to_strings(&s.get(DataKind::ConfigMap, "ns", "cm").await.unwrap().unwrap());
        assert_eq!(got.get("a").map(String::as_str), Some("1"));
        assert_eq!(got.get("b").map(String::as_str), Some("keep"));
        assert_eq!(got.get("c").map(String::as_str), Some("new"));
    }

    #[tokio::test]
    async fn memory_store_patch_missing_is_not_found() {
        let s = MemoryStore::new();
        let err = s.patch(DataKind::Secret, "ns", "nope", &Data::new()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(s.get(DataKind::Secret, "ns", "nope").await.unwrap().is_none());
        assert!(s.role_binding_subjects("ns", "rb").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn config_maps_reject_binary_values() {
        let s = MemoryStore::new();
        let mut d = Data::new();
        d.insert("bin".into(), vec![0xff, 0xfe]);
        let err = s.create(DataKind::ConfigMap, "ns", "cm", &d).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        s.create(DataKind::Secret, "ns", "s", &d).await.unwrap();
    }

    #[tokio::test]
    async fn labels_are_recorded_on_create() {
        let s = MemoryStore::new();
        let mut labels = Labels::new();
        labels.insert("app.kubernetes.io/part-of".into(), "argocd".into());
        s.create_labeled(DataKind::Secret, "ns", "oidc-client", &Data::new(), &labels).await.unwrap();
        assert_eq!(s.labels(DataKind::Secret, "ns", "oidc-client"), Some(labels));
    }
}
