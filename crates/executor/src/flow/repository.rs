//! Revisioned in-memory flow registry.
//!
//! Every stored flow keeps all of its revisions so a restart can target an
//! older or newer definition than the one the execution started with.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::engine::execution::{flow_key, Execution};
use crate::error::{AppError, AppResult};
use crate::flow::parser::{parse_flow, validate_flow};
use crate::flow::types::Flow;

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> AppError {
    AppError::Internal("flow registry lock poisoned".to_string())
}

#[derive(Debug, Default)]
pub struct FlowRepository {
    flows: RwLock<HashMap<String, BTreeMap<i32, Arc<Flow>>>>,
}

impl FlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a flow. An unchanged definition returns the latest revision,
    /// a changed one becomes `latest + 1`.
    pub fn create_or_update(&self, mut flow: Flow) -> AppResult<Arc<Flow>> {
        validate_flow(&flow)?;

        let mut flows = self.flows.write().map_err(poison_err)?;
        let revisions = flows.entry(flow.key()).or_default();

        if let Some((&latest, current)) = revisions.iter().next_back() {
            if current.same_definition(&flow) {
                return Ok(current.clone());
            }
            flow.revision = latest + 1;
        } else {
            flow.revision = 1;
        }

        let flow = Arc::new(flow);
        revisions.insert(flow.revision, flow.clone());

        tracing::info!(
            namespace = %flow.namespace,
            flow_id = %flow.id,
            revision = flow.revision,
            "Flow stored"
        );

        Ok(flow)
    }

    /// Parse and store a YAML definition.
    pub fn create_from_yaml(&self, yaml: &str) -> AppResult<Arc<Flow>> {
        self.create_or_update(parse_flow(yaml)?)
    }

    /// Find a flow revision; `None` means the latest one.
    pub fn find(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
        revision: Option<i32>,
    ) -> AppResult<Arc<Flow>> {
        let flows = self.flows.read().map_err(poison_err)?;
        let revisions = flows
            .get(&flow_key(tenant_id, namespace, flow_id))
            .ok_or_else(|| AppError::NotFound(format!("Flow '{}.{}'", namespace, flow_id)))?;

        let found = match revision {
            Some(revision) => revisions.get(&revision),
            None => revisions.values().next_back(),
        };

        found.cloned().ok_or_else(|| {
            AppError::NotFound(format!(
                "Flow '{}.{}' revision {}",
                namespace,
                flow_id,
                revision.map(|r| r.to_string()).unwrap_or_else(|| "latest".into())
            ))
        })
    }

    /// The revision an execution runs with.
    pub fn find_for_execution(&self, execution: &Execution) -> AppResult<Arc<Flow>> {
        self.find(
            execution.tenant_id.as_deref(),
            &execution.namespace,
            &execution.flow_id,
            Some(execution.flow_revision),
        )
    }

    /// Latest revision of every flow.
    pub fn find_all(&self) -> AppResult<Vec<Arc<Flow>>> {
        let flows = self.flows.read().map_err(poison_err)?;
        let mut latest: Vec<Arc<Flow>> = flows
            .values()
            .filter_map(|revisions| revisions.values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| (&a.namespace, &a.id).cmp(&(&b.namespace, &b.id)));
        Ok(latest)
    }

    /// Load every `*.yml` / `*.yaml` file of a directory.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> AppResult<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            AppError::Config(format!("Cannot read flows dir {}: {}", dir.display(), e))
        })?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry
                .map_err(|e| AppError::Config(e.to_string()))?
                .path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            );
            if !is_yaml {
                continue;
            }

            let content = std::fs::read_to_string(&path)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
            self.create_from_yaml(&content).map_err(|e| {
                AppError::Parse(format!("{}: {}", path.display(), e))
            })?;
            loaded += 1;
        }

        tracing::info!(dir = %dir.display(), count = loaded, "Flows loaded");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = r#"
id: hello
namespace: ns
tasks:
  - id: a
    type: task
"#;

    const FLOW_V2: &str = r#"
id: hello
namespace: ns
tasks:
  - id: a
    type: task
  - id: b
    type: task
"#;

    #[test]
    fn test_revisions() {
        let repo = FlowRepository::new();
        let v1 = repo.create_from_yaml(FLOW).unwrap();
        assert_eq!(v1.revision, 1);

        let same = repo.create_from_yaml(FLOW).unwrap();
        assert_eq!(same.revision, 1);

        let v2 = repo.create_from_yaml(FLOW_V2).unwrap();
        assert_eq!(v2.revision, 2);

        assert_eq!(repo.find(None, "ns", "hello", None).unwrap().revision, 2);
        assert_eq!(
            repo.find(None, "ns", "hello", Some(1))
                .unwrap()
                .all_task_ids()
                .len(),
            1
        );
        assert!(matches!(
            repo.find(None, "ns", "hello", Some(9)),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(repo.find_all().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_flow() {
        let repo = FlowRepository::new();
        assert!(matches!(
            repo.find(None, "ns", "nope", None),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("flowrun-flows-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hello.yml"), FLOW).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let repo = FlowRepository::new();
        assert_eq!(repo.load_dir(&dir).unwrap(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
