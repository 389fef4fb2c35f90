//! Dependency-graph evaluation.
//!
//! A message's subtasks form a named dependency map: each [`TaskSpec`] says
//! which topic to invoke, with which base arguments, after which other
//! tasks, and how upstream results fold into its argument list. The
//! evaluator validates the map, computes a topological order, and runs one
//! [`rendezvous`] per task in that order, threading results downstream.
//!
//! Evaluation within one map is sequential: a dependency's result gates its
//! dependents' dispatch. Tie-breaks between independent tasks follow the
//! map's declaration order, so a given input always evaluates the same way.
//!
//! ```rust,ignore
//! let mut tasks = TaskMap::new();
//! tasks.insert("one".into(), TaskSpec::new("add", vec![json!(1), json!(2)]));
//! tasks.insert(
//!     "two".into(),
//!     TaskSpec::new("sub", vec![json!(2)])
//!         .after(["one"])
//!         .combining("prepend"),
//! );
//!
//! let results = evaluate(&tasks, broker, &registry, &props, timeout).await?;
//! let total = &results["two"].result;
//! ```

use std::time::Duration;

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::broker::{Broker, BrokerProps};
use crate::combine::CombinatorRegistry;
use crate::rendezvous::{rendezvous, RendezvousError};

/// One subtask in a dependency map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Broker topic to invoke.
    pub topic: String,

    /// Base argument list.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Tasks that must complete first; their results are folded into `args`
    /// in this order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,

    /// Registered combinator folding each dependency result into `args`.
    /// Unset means `append`.
    #[serde(
        rename = "arg-in-fn",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub arg_in: Option<String>,
}

impl TaskSpec {
    /// A subtask with no dependencies.
    pub fn new(topic: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            topic: topic.into(),
            args,
            deps: Vec::new(),
            arg_in: None,
        }
    }

    /// Add dependencies, in fold order.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Select a registered combinator by name.
    pub fn combining(mut self, name: impl Into<String>) -> Self {
        self.arg_in = Some(name.into());
        self
    }
}

/// A dependency map: task name to spec, in declaration order.
pub type TaskMap = IndexMap<String, TaskSpec>;

/// A task with its subtask's decoded reply attached.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    /// The spec the task was declared with.
    pub spec: TaskSpec,

    /// Decoded reply from the subtask's response topic.
    pub result: Value,
}

/// Evaluation output: same keys as the input map, each carrying a result.
pub type ResultMap = IndexMap<String, CompletedTask>;

/// Errors from dependency-map validation and evaluation.
#[derive(Debug, Error)]
pub enum DagError {
    /// The dependency graph contains a cycle.
    #[error("cyclic dependencies involving task '{0}'")]
    Cycle(String),

    /// A task references a dependency that is not in the map.
    #[error("task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency { task: String, dep: String },

    /// A task names a combinator that is not registered.
    #[error("task '{task}' names unknown combinator '{combinator}'")]
    UnknownCombinator { task: String, combinator: String },

    /// A subtask's rendezvous failed; the whole evaluation aborts.
    #[error("subtask '{task}' failed: {source}")]
    Subtask {
        task: String,
        #[source]
        source: RendezvousError,
    },
}

/// Validate a dependency map and compute its execution order.
///
/// Checks that every referenced dependency exists, that no task depends on
/// itself, and that the induced graph is acyclic. The returned order is a
/// topological sort; independent tasks keep their declaration order, so the
/// result is deterministic for a given map.
pub fn execution_order(tasks: &TaskMap) -> Result<Vec<String>, DagError> {
    for (name, spec) in tasks {
        for dep in &spec.deps {
            if dep == name {
                return Err(DagError::Cycle(name.clone()));
            }
            if !tasks.contains_key(dep) {
                return Err(DagError::UnknownDependency {
                    task: name.clone(),
                    dep: dep.clone(),
                });
            }
        }
    }

    // Edge direction: dep -> dependent, so the sort yields deps first.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in tasks.keys() {
        graph.add_node(name.as_str());
    }
    for (name, spec) in tasks {
        for dep in &spec.deps {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(String::from).collect()),
        Err(cycle) => Err(DagError::Cycle(cycle.node_id().to_string())),
    }
}

/// Evaluate a dependency map.
///
/// Validation (references, cycles, combinator names) completes before any
/// broker traffic; an invalid map produces no requests and no topics. Each
/// task's upstream results are folded into its arguments with its combinator
/// in declared `deps` order, then the task runs as one rendezvous. The first
/// failing subtask aborts the evaluation; completed subtasks are not
/// compensated.
pub async fn evaluate(
    tasks: &TaskMap,
    broker: &dyn Broker,
    registry: &CombinatorRegistry,
    reply_props: &BrokerProps,
    timeout: Duration,
) -> Result<ResultMap, DagError> {
    if tasks.is_empty() {
        return Ok(ResultMap::new());
    }

    let order = execution_order(tasks)?;

    for (name, spec) in tasks {
        if let Some(combinator) = &spec.arg_in {
            if registry.get(combinator).is_none() {
                return Err(DagError::UnknownCombinator {
                    task: name.clone(),
                    combinator: combinator.clone(),
                });
            }
        }
    }

    debug!(tasks = tasks.len(), order = ?order, "evaluating dependency map");

    let mut results = ResultMap::with_capacity(tasks.len());
    for name in order {
        let spec = match tasks.get(&name) {
            Some(spec) => spec,
            None => {
                return Err(DagError::UnknownDependency {
                    task: name.clone(),
                    dep: name,
                })
            }
        };

        let combinator = match &spec.arg_in {
            Some(chosen) => match registry.get(chosen) {
                Some(c) => c,
                None => {
                    return Err(DagError::UnknownCombinator {
                        task: name,
                        combinator: chosen.clone(),
                    })
                }
            },
            None => registry.default_combinator(),
        };

        let mut args = spec.args.clone();
        for dep in &spec.deps {
            match results.get(dep) {
                Some(done) => args = combinator.apply(args, &done.result),
                None => {
                    return Err(DagError::UnknownDependency {
                        task: name,
                        dep: dep.clone(),
                    })
                }
            }
        }

        let result = rendezvous(broker, &spec.topic, args, reply_props, timeout)
            .await
            .map_err(|source| DagError::Subtask {
                task: name.clone(),
                source,
            })?;

        debug!(task = %name, subtask = %spec.topic, "subtask completed");
        results.insert(
            name,
            CompletedTask {
                spec: spec.clone(),
                result,
            },
        );
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageStream;
    use crate::memory::MemoryBroker;
    use crate::payload::{self, Request};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Serves every request arriving on `topic` by applying `f` to its args.
    fn serve(
        broker: Arc<MemoryBroker>,
        topic: &str,
        f: impl Fn(Vec<Value>) -> Value + Send + 'static,
    ) {
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut stream = broker
                .subscribe(&BrokerProps::new(), &topic)
                .await
                .unwrap();
            while let Some(Ok(record)) = stream.next().await {
                let request = Request::from_bytes(&record.payload).unwrap();
                let reply = payload::encode(&f(request.data)).unwrap();
                broker
                    .produce(&request.response_topic, None, &reply)
                    .await
                    .unwrap();
            }
        });
    }

    fn sum(args: Vec<Value>) -> Value {
        json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
    }

    #[tokio::test]
    async fn empty_map_touches_nothing() {
        let broker = MemoryBroker::new();
        let results = evaluate(
            &TaskMap::new(),
            &broker,
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            TIMEOUT,
        )
        .await
        .unwrap();

        assert!(results.is_empty());
        assert_eq!(broker.produce_count(), 0);
        assert_eq!(broker.create_count(), 0);
    }

    #[tokio::test]
    async fn task_without_deps_keeps_its_args() {
        let broker = Arc::new(MemoryBroker::new());
        serve(broker.clone(), "echo", |args| json!(args));

        let mut tasks = TaskMap::new();
        tasks.insert(
            "a".to_string(),
            TaskSpec::new("echo", vec![json!(1), json!(2), json!(3)]),
        );

        let results = evaluate(
            &tasks,
            broker.as_ref(),
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            TIMEOUT,
        )
        .await
        .unwrap();

        assert_eq!(results["a"].result, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn chain_with_prepend_combinator() {
        let broker = Arc::new(MemoryBroker::new());
        serve(broker.clone(), "add", sum);
        serve(broker.clone(), "sub", |args| {
            json!(args[0].as_i64().unwrap() - args[1].as_i64().unwrap())
        });

        let mut tasks = TaskMap::new();
        tasks.insert(
            "one".to_string(),
            TaskSpec::new("add", vec![json!(1), json!(2), json!(3)]),
        );
        tasks.insert(
            "two".to_string(),
            TaskSpec::new("sub", vec![json!(2)])
                .after(["one"])
                .combining("prepend"),
        );

        let results = evaluate(
            &tasks,
            broker.as_ref(),
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            TIMEOUT,
        )
        .await
        .unwrap();

        assert_eq!(results["one"].result, json!(6));
        // "sub" received [6, 2]: the upstream result prepended to its args.
        assert_eq!(results["two"].result, json!(4));
    }

    #[tokio::test]
    async fn multi_dep_folds_in_declared_order() {
        let broker = Arc::new(MemoryBroker::new());
        serve(broker.clone(), "a", |_| json!("ra"));
        serve(broker.clone(), "b", |_| json!("rb"));
        serve(broker.clone(), "join", |args| json!(args));

        let mut tasks = TaskMap::new();
        tasks.insert("a".to_string(), TaskSpec::new("a", vec![]));
        tasks.insert("b".to_string(), TaskSpec::new("b", vec![]));
        tasks.insert(
            "c".to_string(),
            TaskSpec::new("join", vec![json!("base")]).after(["b", "a"]),
        );

        let results = evaluate(
            &tasks,
            broker.as_ref(),
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            TIMEOUT,
        )
        .await
        .unwrap();

        // Fold order follows the declared deps list, not completion order.
        assert_eq!(results["c"].result, json!(["base", "rb", "ra"]));
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_any_traffic() {
        let broker = MemoryBroker::new();

        let mut tasks = TaskMap::new();
        tasks.insert("a".to_string(), TaskSpec::new("x", vec![]).after(["b"]));
        tasks.insert("b".to_string(), TaskSpec::new("y", vec![]).after(["a"]));

        let err = evaluate(
            &tasks,
            &broker,
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            TIMEOUT,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DagError::Cycle(_)));
        assert_eq!(broker.produce_count(), 0);
        assert_eq!(broker.create_count(), 0);
        assert!(broker.topic_names().is_empty());
    }

    #[tokio::test]
    async fn self_dependency_is_a_cycle() {
        let mut tasks = TaskMap::new();
        tasks.insert("a".to_string(), TaskSpec::new("x", vec![]).after(["a"]));

        assert!(matches!(
            execution_order(&tasks),
            Err(DagError::Cycle(name)) if name == "a"
        ));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let mut tasks = TaskMap::new();
        tasks.insert(
            "a".to_string(),
            TaskSpec::new("x", vec![]).after(["ghost"]),
        );

        assert!(matches!(
            execution_order(&tasks),
            Err(DagError::UnknownDependency { dep, .. }) if dep == "ghost"
        ));
    }

    #[tokio::test]
    async fn unknown_combinator_is_rejected_before_any_traffic() {
        let broker = MemoryBroker::new();

        let mut tasks = TaskMap::new();
        tasks.insert(
            "a".to_string(),
            TaskSpec::new("x", vec![]).combining("zip"),
        );

        let err = evaluate(
            &tasks,
            &broker,
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            TIMEOUT,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DagError::UnknownCombinator { combinator, .. } if combinator == "zip"));
        assert_eq!(broker.produce_count(), 0);
    }

    #[tokio::test]
    async fn failing_subtask_aborts_evaluation() {
        let broker = Arc::new(MemoryBroker::new());
        serve(broker.clone(), "add", sum);
        // No responder for "silent".

        let mut tasks = TaskMap::new();
        tasks.insert("one".to_string(), TaskSpec::new("add", vec![json!(1)]));
        tasks.insert(
            "two".to_string(),
            TaskSpec::new("silent", vec![]).after(["one"]),
        );

        let err = evaluate(
            &tasks,
            broker.as_ref(),
            &CombinatorRegistry::new(),
            &BrokerProps::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            DagError::Subtask { ref task, source: RendezvousError::Timeout(_) } if task == "two"
        ));
        // The completed subtask's request went out; no rollback happens.
        assert_eq!(broker.log_len("add"), 1);
    }

    /// Random acyclic maps: each task may only depend on earlier tasks.
    fn arb_task_map() -> impl Strategy<Value = TaskMap> {
        prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..12)
            .prop_map(|nodes| {
                let mut tasks = TaskMap::new();
                for (i, picks) in nodes.iter().enumerate() {
                    let mut deps: Vec<String> = picks
                        .iter()
                        .filter(|_| i > 0)
                        .map(|pick| format!("t{}", pick.index(i)))
                        .collect();
                    deps.sort();
                    deps.dedup();
                    tasks.insert(
                        format!("t{i}"),
                        TaskSpec::new("svc", vec![]).after(deps),
                    );
                }
                tasks
            })
    }

    proptest! {
        #[test]
        fn order_visits_each_task_once_after_its_deps(tasks in arb_task_map()) {
            let order = execution_order(&tasks).unwrap();

            prop_assert_eq!(order.len(), tasks.len());

            let mut seen = std::collections::HashSet::new();
            for name in &order {
                for dep in &tasks[name.as_str()].deps {
                    prop_assert!(seen.contains(dep.as_str()));
                }
                prop_assert!(seen.insert(name.as_str()));
            }
        }

        #[test]
        fn order_is_deterministic(tasks in arb_task_map()) {
            prop_assert_eq!(execution_order(&tasks).unwrap(), execution_order(&tasks).unwrap());
        }
    }
}
