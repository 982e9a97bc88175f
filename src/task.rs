use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Reference to a pipeline registered with a [`crate::CrawlBuilder`].
///
/// Handles can only be obtained by registering a pipeline, so a task can
/// never be routed to a pipeline that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    index: usize,
    name: Arc<str>,
}

impl PipelineHandle {
    pub(crate) fn new(index: usize, name: &str) -> Self {
        Self {
            index,
            name: Arc::from(name),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Caller-supplied key/value fields carried by a task, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A task that has not been scheduled yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    url: String,
    context: Context,
}

impl TaskSpec {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            context: Context::default(),
        }
    }

    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.context.0.insert(key.into(), value.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Immutable unit of crawl work routed to exactly one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    seq: u64,
    pipeline: PipelineHandle,
    url: String,
    context: Context,
}

impl Task {
    pub(crate) fn new(seq: u64, pipeline: PipelineHandle, spec: TaskSpec) -> Self {
        Self {
            seq,
            pipeline,
            url: spec.url,
            context: spec.context,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}] {}", self.pipeline, self.seq, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_fields_are_typed_and_ordered() {
        let spec = TaskSpec::new("https://tf2maps.net/downloads/?page=1")
            .with("page", 1)
            .with("map_id", "koth_harvest.123");

        assert_eq!(spec.context().get_u64("page"), Some(1));
        assert_eq!(spec.context().get_str("map_id"), Some("koth_harvest.123"));
        assert_eq!(spec.context().get_str("page"), None);
        let keys: Vec<&String> = spec.context().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["map_id", "page"]);
    }

    #[test]
    fn task_keeps_spec_values() {
        let handle = PipelineHandle::new(0, "links");
        let task = Task::new(7, handle.clone(), TaskSpec::new("u").with("page", 3));

        assert_eq!(task.seq(), 7);
        assert_eq!(task.pipeline(), &handle);
        assert_eq!(task.url(), "u");
        assert_eq!(task.context().get_u64("page"), Some(3));
        assert_eq!(task.to_string(), "[links#7] u");
    }
}
