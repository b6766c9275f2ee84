//! Destination object store: the generic surface the engine uses to
//! manage namespaces, import resources, and observed data volumes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use kube_core::ErrorResponse;
use thiserror::Error;

use crate::vmimport_types::{DataVolume, VirtualMachineImport};

#[derive(Debug, Error)]
#[error("api request failed: {0}")]
pub struct StoreError(#[from] pub kube::Error);

#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Idempotent create of the destination namespace.
    async fn ensure_namespace(&self, name: &str) -> Result<(), StoreError>;

    async fn get_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineImport>, StoreError>;

    async fn create_import(&self, import: &VirtualMachineImport) -> Result<(), StoreError>;

    async fn update_import(&self, import: &VirtualMachineImport) -> Result<(), StoreError>;

    /// Idempotent removal; an absent resource is not an error.
    async fn delete_import(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list_imports(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualMachineImport>, StoreError>;

    async fn data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, StoreError>;
}

/// Kubernetes-backed store.
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    fn imports(&self, namespace: &str) -> Api<VirtualMachineImport> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ImportStore for KubeStore {
    async fn ensure_namespace(&self, name: &str) -> Result<(), StoreError> {
        let api = Api::<corev1::Namespace>::all(self.client.clone());
        let namespace = corev1::Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), ..ObjectMeta::default() },
            ..corev1::Namespace::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Err(kube::Error::Api(ErrorResponse { ref reason, .. })) if reason == "AlreadyExists" => {
                Ok(())
            }
            Err(e) => Err(StoreError(e)),
            Ok(_) => Ok(()),
        }
    }

    async fn get_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineImport>, StoreError> {
        Ok(self.imports(namespace).get_opt(name).await?)
    }

    async fn create_import(&self, import: &VirtualMachineImport) -> Result<(), StoreError> {
        let namespace = import.metadata.namespace.as_deref().unwrap_or_default();
        match self.imports(namespace).create(&PostParams::default(), import).await {
            Err(kube::Error::Api(ErrorResponse { ref reason, .. })) if reason == "AlreadyExists" => {
                Ok(())
            }
            Err(e) => Err(StoreError(e)),
            Ok(_) => Ok(()),
        }
    }

    async fn update_import(&self, import: &VirtualMachineImport) -> Result<(), StoreError> {
        let namespace = import.metadata.namespace.as_deref().unwrap_or_default();
        let name = import.metadata.name.as_deref().unwrap_or_default();
        self.imports(namespace)
            .replace(name, &PostParams::default(), import)
            .await?;
        Ok(())
    }

    async fn delete_import(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.imports(namespace).delete(name, &DeleteParams::default()).await {
            Err(kube::Error::Api(ErrorResponse { ref reason, .. })) if reason == "NotFound" => {
                Ok(())
            }
            Err(e) => Err(StoreError(e)),
            Ok(_) => Ok(()),
        }
    }

    async fn list_imports(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VirtualMachineImport>, StoreError> {
        let params = ListParams::default().labels(selector);
        Ok(self.imports(namespace).list(&params).await?.items)
    }

    async fn data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, StoreError> {
        let api = Api::<DataVolume>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    /// In-memory store for tests, with write counters so idempotence
    /// can be asserted.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        namespaces: BTreeSet<String>,
        namespace_creates: usize,
        imports: BTreeMap<(String, String), VirtualMachineImport>,
        data_volumes: BTreeMap<(String, String), DataVolume>,
        creates: usize,
        updates: usize,
        deletes: usize,
    }

    impl MemoryStore {
        pub fn counts(&self) -> (usize, usize, usize) {
            let state = self.state.lock().unwrap();
            (state.creates, state.updates, state.deletes)
        }

        pub fn namespace_creates(&self) -> usize {
            self.state.lock().unwrap().namespace_creates
        }

        pub fn import(&self, namespace: &str, name: &str) -> Option<VirtualMachineImport> {
            self.state
                .lock()
                .unwrap()
                .imports
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Mutate an import in place, as the import operator would.
        pub fn update_import_status<F>(&self, namespace: &str, name: &str, mutate: F)
        where
            F: FnOnce(&mut VirtualMachineImport),
        {
            let mut state = self.state.lock().unwrap();
            if let Some(import) = state.imports.get_mut(&(namespace.to_string(), name.to_string())) {
                mutate(import);
            }
        }

        pub fn put_data_volume(&self, namespace: &str, dv: DataVolume) {
            let name = dv.metadata.name.clone().unwrap_or_default();
            self.state
                .lock()
                .unwrap()
                .data_volumes
                .insert((namespace.to_string(), name), dv);
        }

        pub fn update_data_volume<F>(&self, namespace: &str, name: &str, mutate: F)
        where
            F: FnOnce(&mut DataVolume),
        {
            let mut state = self.state.lock().unwrap();
            if let Some(dv) = state
                .data_volumes
                .get_mut(&(namespace.to_string(), name.to_string()))
            {
                mutate(dv);
            }
        }
    }

    #[async_trait]
    impl ImportStore for MemoryStore {
        async fn ensure_namespace(&self, name: &str) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            if state.namespaces.insert(name.to_string()) {
                state.namespace_creates += 1;
            }
            Ok(())
        }

        async fn get_import(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<VirtualMachineImport>, StoreError> {
            Ok(self.import(namespace, name))
        }

        async fn create_import(&self, import: &VirtualMachineImport) -> Result<(), StoreError> {
            let namespace = import.metadata.namespace.clone().unwrap_or_default();
            let name = import.metadata.name.clone().unwrap_or_default();
            let mut state = self.state.lock().unwrap();
            state.imports.entry((namespace, name)).or_insert_with(|| import.clone());
            state.creates += 1;
            Ok(())
        }

        async fn update_import(&self, import: &VirtualMachineImport) -> Result<(), StoreError> {
            let namespace = import.metadata.namespace.clone().unwrap_or_default();
            let name = import.metadata.name.clone().unwrap_or_default();
            let mut state = self.state.lock().unwrap();
            state.imports.insert((namespace, name), import.clone());
            state.updates += 1;
            Ok(())
        }

        async fn delete_import(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            if state
                .imports
                .remove(&(namespace.to_string(), name.to_string()))
                .is_some()
            {
                state.deletes += 1;
            }
            Ok(())
        }

        async fn list_imports(
            &self,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<VirtualMachineImport>, StoreError> {
            let wanted: Vec<(&str, &str)> = selector
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .collect();
            let state = self.state.lock().unwrap();
            Ok(state
                .imports
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, import)| import)
                .filter(|import| {
                    let labels = import.metadata.labels.clone().unwrap_or_default();
                    wanted
                        .iter()
                        .all(|(k, v)| labels.get(*k).map(|l| l == v).unwrap_or(false))
                })
                .cloned()
                .collect())
        }

        async fn data_volume(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<DataVolume>, StoreError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .data_volumes
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }
}
