//! Task runs, attempts and the task-run tree.
//!
//! An execution stores its task runs as a flat list in dispatch order, each
//! child pointing to its parent by id. [`TaskRunTree`] is a borrowed arena
//! over that list: relations are resolved through index maps, never through
//! embedded references.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::{State, StateType};

/// One try of a task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub state: State,

    /// Pointer to the logs of this attempt in external storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_ref: Option<String>,
}

impl TaskRunAttempt {
    /// A new attempt whose history goes `CREATED -> state`.
    pub fn new(state: StateType) -> Self {
        Self {
            state: State::new().with_state(state),
            logs_ref: None,
        }
    }

    pub fn with_state(&self, state: StateType) -> Self {
        Self {
            state: self.state.with_state(state),
            logs_ref: self.logs_ref.clone(),
        }
    }
}

/// Runtime record of one task, or one loop iteration of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,

    pub task_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<String>,

    /// Iteration value path, outermost loop first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<String>,

    pub state: State,

    #[serde(default)]
    pub attempts: Vec<TaskRunAttempt>,

    #[serde(default)]
    pub outputs: Map<String, Value>,
}

impl TaskRun {
    pub fn new(task_id: &str, parent_task_run_id: Option<&str>, value: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            parent_task_run_id: parent_task_run_id.map(str::to_string),
            value,
            state: State::new(),
            attempts: Vec::new(),
            outputs: Map::new(),
        }
    }

    pub fn with_state(&self, state: StateType) -> Self {
        let mut task_run = self.clone();
        task_run.state = self.state.with_state(state);
        task_run
    }

    pub fn current(&self) -> StateType {
        self.state.current
    }

    pub fn last_attempt(&self) -> Option<&TaskRunAttempt> {
        self.attempts.last()
    }

    /// Index of the attempt a dispatch would run: the last attempt while it
    /// is still open, otherwise a new one.
    pub fn open_attempt_index(&self) -> usize {
        match self.attempts.last() {
            Some(attempt) if !attempt.state.is_terminal() => self.attempts.len() - 1,
            _ => self.attempts.len(),
        }
    }

    /// Move the open attempt to `state`, opening one if needed.
    pub fn with_open_attempt(&self, state: StateType) -> Self {
        let mut task_run = self.clone();
        match task_run.attempts.last_mut() {
            Some(attempt) if !attempt.state.is_terminal() => {
                *attempt = attempt.with_state(state);
            }
            _ => task_run.attempts.push(TaskRunAttempt::new(state)),
        }
        task_run
    }

    /// End the last attempt in `state`; an attempt is created if none exists.
    pub fn with_last_attempt_state(&self, state: StateType) -> Self {
        let mut task_run = self.clone();
        match task_run.attempts.last_mut() {
            Some(attempt) => *attempt = attempt.with_state(state),
            None => task_run.attempts.push(TaskRunAttempt::new(state)),
        }
        task_run
    }

    /// Append a fresh attempt in `state`.
    pub fn with_new_attempt(&self, state: StateType) -> Self {
        let mut task_run = self.clone();
        task_run.attempts.push(TaskRunAttempt::new(state));
        task_run
    }

    /// Kill the run, closing its attempt if one is still open.
    pub fn killed(&self) -> Self {
        let task_run = match self.attempts.last() {
            Some(attempt) if !attempt.state.is_terminal() => {
                self.with_last_attempt_state(StateType::Killed)
            }
            _ => self.clone(),
        };
        task_run.with_state(StateType::Killed)
    }

    /// Same tree position: task, parent run and iteration value.
    pub fn is_at(&self, task_id: &str, parent_task_run_id: Option<&str>, value: &[String]) -> bool {
        self.task_id == task_id
            && self.parent_task_run_id.as_deref() == parent_task_run_id
            && self.value == value
    }
}

/// Arena view of a task-run list.
#[derive(Debug)]
pub struct TaskRunTree<'a> {
    runs: &'a [TaskRun],
    index: HashMap<&'a str, usize>,
    children: HashMap<&'a str, Vec<usize>>,
    roots: Vec<usize>,
}

impl<'a> TaskRunTree<'a> {
    pub fn new(runs: &'a [TaskRun]) -> Self {
        let mut index = HashMap::with_capacity(runs.len());
        let mut children: HashMap<&'a str, Vec<usize>> = HashMap::new();
        let mut roots = Vec::new();

        for (position, run) in runs.iter().enumerate() {
            index.insert(run.id.as_str(), position);
            match run.parent_task_run_id.as_deref() {
                Some(parent) => children.entry(parent).or_default().push(position),
                None => roots.push(position),
            }
        }

        Self {
            runs,
            index,
            children,
            roots,
        }
    }

    pub fn get(&self, id: &str) -> Option<&'a TaskRun> {
        self.index.get(id).map(|&i| &self.runs[i])
    }

    /// Position in dispatch order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn parent(&self, id: &str) -> Option<&'a TaskRun> {
        self.get(id)
            .and_then(|run| run.parent_task_run_id.as_deref())
            .and_then(|parent| self.get(parent))
    }

    pub fn roots(&self) -> Vec<&'a TaskRun> {
        self.roots.iter().map(|&i| &self.runs[i]).collect()
    }

    /// Direct children, in dispatch order.
    pub fn children(&self, id: &str) -> Vec<&'a TaskRun> {
        self.children
            .get(id)
            .map(|positions| positions.iter().map(|&i| &self.runs[i]).collect())
            .unwrap_or_default()
    }

    /// Ancestor chain, root first. Bounded by the list length so a corrupt
    /// parent cycle cannot loop forever.
    pub fn ancestors(&self, id: &str) -> Vec<&'a TaskRun> {
        let mut chain = Vec::new();
        let mut cursor = self.parent(id);
        while let Some(run) = cursor {
            if chain.len() >= self.runs.len() {
                break;
            }
            chain.push(run);
            cursor = self.parent(&run.id);
        }
        chain.reverse();
        chain
    }

    pub fn ancestor_ids(&self, id: &str) -> HashSet<&'a str> {
        self.ancestors(id).into_iter().map(|r| r.id.as_str()).collect()
    }

    /// Every descendant id, at any depth.
    pub fn descendant_ids(&self, id: &str) -> HashSet<&'a str> {
        let mut found = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for child in self.children(current) {
                if found.insert(child.id.as_str()) {
                    queue.push_back(child.id.as_str());
                }
            }
        }
        found
    }

    pub fn is_descendant(&self, candidate: &str, of: &str) -> bool {
        self.ancestors(candidate).iter().any(|run| run.id == of)
    }

    pub fn find_at(
        &self,
        task_id: &str,
        parent_task_run_id: Option<&str>,
        value: &[String],
    ) -> Option<&'a TaskRun> {
        let candidates: Vec<&'a TaskRun> = match parent_task_run_id {
            Some(parent) => self.children(parent),
            None => self.roots(),
        };
        candidates
            .into_iter()
            .find(|run| run.is_at(task_id, parent_task_run_id, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, task_id: &str, parent: Option<&str>) -> TaskRun {
        let mut run = TaskRun::new(task_id, parent, Vec::new());
        run.id = id.to_string();
        run
    }

    fn sample() -> Vec<TaskRun> {
        vec![
            run("a", "first", None),
            run("b", "seq", None),
            run("c", "inner-1", Some("b")),
            run("d", "inner-2", Some("b")),
            run("e", "deep", Some("d")),
            run("f", "last", None),
        ]
    }

    #[test]
    fn test_tree_relations() {
        let runs = sample();
        let tree = TaskRunTree::new(&runs);

        assert_eq!(tree.roots().len(), 3);
        assert_eq!(
            tree.children("b").iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );
        assert_eq!(
            tree.ancestors("e").iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "d"]
        );
        assert_eq!(tree.descendant_ids("b"), HashSet::from(["c", "d", "e"]));
        assert!(tree.is_descendant("e", "b"));
        assert!(!tree.is_descendant("f", "b"));
        assert_eq!(tree.position("f"), Some(5));
    }

    #[test]
    fn test_find_at_position() {
        let mut runs = sample();
        runs[2].value = vec!["x".to_string()];
        let tree = TaskRunTree::new(&runs);

        assert_eq!(
            tree.find_at("inner-1", Some("b"), &["x".to_string()]).map(|r| r.id.as_str()),
            Some("c")
        );
        assert!(tree.find_at("inner-1", Some("b"), &[]).is_none());
        assert_eq!(tree.find_at("last", None, &[]).map(|r| r.id.as_str()), Some("f"));
    }

    #[test]
    fn test_parent_cycle_terminates() {
        let runs = vec![run("a", "x", Some("b")), run("b", "y", Some("a"))];
        let tree = TaskRunTree::new(&runs);
        assert!(tree.ancestors("a").len() <= 2);
    }

    #[test]
    fn test_attempt_bookkeeping() {
        let run = TaskRun::new("t", None, Vec::new());
        assert_eq!(run.open_attempt_index(), 0);

        let running = run.with_open_attempt(StateType::Running);
        assert_eq!(running.attempts.len(), 1);
        assert_eq!(running.open_attempt_index(), 0);

        let retried = running.with_last_attempt_state(StateType::Retried);
        assert_eq!(retried.open_attempt_index(), 1);

        let second = retried.with_open_attempt(StateType::Running);
        assert_eq!(second.attempts.len(), 2);
        assert_eq!(second.attempts[0].state.current, StateType::Retried);
        assert_eq!(second.attempts[1].state.current, StateType::Running);
    }

    #[test]
    fn test_killed_closes_open_attempt() {
        let run = TaskRun::new("t", None, Vec::new())
            .with_open_attempt(StateType::Running)
            .with_state(StateType::Running);
        let killed = run.killed();
        assert_eq!(killed.current(), StateType::Killed);
        assert_eq!(killed.attempts[0].state.current, StateType::Killed);

        let done = TaskRun::new("t", None, Vec::new())
            .with_open_attempt(StateType::Success)
            .killed();
        assert_eq!(done.attempts[0].state.current, StateType::Success);
    }
}
