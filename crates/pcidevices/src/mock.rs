//! In-memory adapters for the store, command and plugin seams.
//!
//! Used by the unit tests of the reconcilers. Dependent crates get it with
//! the `testing` feature.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use kube::Resource;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::deviceplugin::registry::Registrar;
use crate::error::DeviceError;
use crate::error::DeviceResult;
use crate::infrastructure::executor::CommandExecutor;
use crate::infrastructure::executor::CommandOutput;
use crate::infrastructure::store::Enqueue;
use crate::infrastructure::store::RecordStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parses a `k=v,k2=v2` selector. Empty means everything.
fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Record store over a map, with the same spec/status split as the API
/// server: `update` keeps the stored status, `update_status` keeps the
/// stored spec and metadata.
pub struct MemoryStore<K> {
    records: Mutex<BTreeMap<String, K>>,
    writes: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record without counting it as a write.
    pub fn insert(&self, obj: K) {
        lock(&self.records).insert(obj.name_any(), obj);
    }

    pub fn snapshot(&self, name: &str) -> Option<K> {
        lock(&self.records).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.records).keys().cloned().collect()
    }

    /// `create`, `update`, `update_status` and `delete` calls in order, as
    /// `<verb> <name>`.
    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }

    /// Names removed by `delete`, once per record actually removed.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    fn record_write(&self, verb: &str, name: &str) {
        lock(&self.writes).push(format!("{verb} {name}"));
    }

    /// Copies the `status` field of `from` onto `onto`.
    fn merge_status(onto: &K, from: &K) -> DeviceResult<K> {
        let mut value = serde_json::to_value(onto)
            .change_context_lazy(|| DeviceError::store("serialize record"))?;
        let status = serde_json::to_value(from)
            .change_context_lazy(|| DeviceError::store("serialize record"))?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.insert("status".to_string(), status);
        }
        serde_json::from_value(value).change_context_lazy(|| DeviceError::store("deserialize record"))
    }
}

#[async_trait]
impl<K> RecordStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> DeviceResult<Option<K>> {
        Ok(self.snapshot(name))
    }

    async fn list(&self, label_selector: &str) -> DeviceResult<Vec<K>> {
        let terms = parse_selector(label_selector);
        Ok(lock(&self.records)
            .values()
            .filter(|obj| {
                let labels = obj.labels();
                terms.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> DeviceResult<K> {
        let name = obj.name_any();
        let mut records = lock(&self.records);
        if records.contains_key(&name) {
            return Err(Report::new(DeviceError::store(format!("{name} already exists"))));
        }
        records.insert(name.clone(), obj.clone());
        drop(records);
        self.record_write("create", &name);
        Ok(obj.clone())
    }

    async fn update(&self, obj: &K) -> DeviceResult<K> {
        let name = obj.name_any();
        let mut records = lock(&self.records);
        let Some(stored) = records.get(&name) else {
            return Err(Report::new(DeviceError::not_found(name)));
        };
        let updated = Self::merge_status(obj, stored)?;
        records.insert(name.clone(), updated.clone());
        drop(records);
        self.record_write("update", &name);
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> DeviceResult<K> {
        let name = obj.name_any();
        let mut records = lock(&self.records);
        let Some(stored) = records.get(&name) else {
            return Err(Report::new(DeviceError::not_found(name)));
        };
        let updated = Self::merge_status(stored, obj)?;
        records.insert(name.clone(), updated.clone());
        drop(records);
        self.record_write("update_status", &name);
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> DeviceResult<()> {
        if lock(&self.records).remove(name).is_some() {
            self.record_write("delete", name);
            lock(&self.deleted).push(name.to_string());
        }
        Ok(())
    }
}

/// Scripted command executor. Each command line answers with its queued
/// outputs in order, repeating the last one; unscripted commands succeed
/// with empty output.
#[derive(Default)]
pub struct FakeExecutor {
    scripts: Mutex<BTreeMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `output` for the command line `program arg...`.
    pub fn respond(&self, command_line: &str, output: CommandOutput) -> &Self {
        lock(&self.scripts)
            .entry(command_line.to_string())
            .or_default()
            .push_back(output);
        self
    }

    /// Every executed command line, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(needle))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> DeviceResult<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.calls).push(line.clone());

        let mut scripts = lock(&self.scripts);
        let output = match scripts.get_mut(&line) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(output.unwrap_or_else(|| CommandOutput::ok("")))
    }
}

/// Registrar that remembers which units are served under which resource.
pub struct RecordingRegistrar<U> {
    units: Mutex<BTreeMap<(String, String), U>>,
    events: Mutex<Vec<String>>,
}

impl<U> Default for RecordingRegistrar<U> {
    fn default() -> Self {
        Self {
            units: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<U: Clone> RecordingRegistrar<U> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&self, resource_name: &str, id: &str) -> Option<U> {
        lock(&self.units)
            .get(&(resource_name.to_string(), id.to_string()))
            .cloned()
    }

    pub fn ids(&self, resource_name: &str) -> Vec<String> {
        lock(&self.units)
            .keys()
            .filter(|(resource, _)| resource == resource_name)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// `add <resource> <id>` and `remove <resource> <id>` in call order.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl<U: Clone + Send + Sync + 'static> Registrar<U> for RecordingRegistrar<U> {
    async fn add_device(&self, resource_name: &str, id: &str, unit: U) -> DeviceResult<()> {
        lock(&self.units).insert((resource_name.to_string(), id.to_string()), unit);
        lock(&self.events).push(format!("add {resource_name} {id}"));
        Ok(())
    }

    async fn remove_device(&self, resource_name: &str, id: &str) -> DeviceResult<()> {
        lock(&self.units).remove(&(resource_name.to_string(), id.to_string()));
        lock(&self.events).push(format!("remove {resource_name} {id}"));
        Ok(())
    }
}

/// Collects requeued record names.
#[derive(Default)]
pub struct RecordingEnqueue {
    names: Mutex<Vec<String>>,
}

impl RecordingEnqueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.names).clone()
    }
}

impl Enqueue for RecordingEnqueue {
    fn enqueue(&self, name: &str) {
        lock(&self.names).push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use api_types::PCIDevice;
    use api_types::PciDeviceStatus;
    use kube::api::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn device(name: &str, node: &str) -> PCIDevice {
        PCIDevice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some([("nodename".to_string(), node.to_string())].into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(PciDeviceStatus {
                address: "0000:04:00.0".to_string(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn update_keeps_status_and_selector_filters() {
        let store = MemoryStore::new();
        store.insert(device("a", "node1"));
        store.insert(device("b", "node2"));

        let mut changed = device("a", "node1");
        changed.status = None;
        store.update(&changed).await.expect("update");
        assert_eq!(
            store
                .snapshot("a")
                .and_then(|d| d.status)
                .map(|s| s.address),
            Some("0000:04:00.0".to_string())
        );

        let listed = store.list("nodename=node2").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(store.list("").await.expect("list all").len(), 2);

        store.delete("b").await.expect("delete");
        store.delete("b").await.expect("delete again");
        assert_eq!(store.deleted(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn fake_executor_replays_script() {
        let exec = FakeExecutor::new();
        exec.respond("nvidia-smi -L", CommandOutput::ok("first"))
            .respond("nvidia-smi -L", CommandOutput::ok("second"));
        let args = vec!["-L".to_string()];
        let first = exec.execute("nvidia-smi", &args).await.expect("run");
        let second = exec.execute("nvidia-smi", &args).await.expect("run");
        let third = exec.execute("nvidia-smi", &args).await.expect("run");
        assert_eq!(first.stdout_str(), "first");
        assert_eq!(second.stdout_str(), "second");
        assert_eq!(third.stdout_str(), "second");
        assert_eq!(exec.calls().len(), 3);
    }
}
