//! The graph executor.
//!
//! Owns the dependency graph and per-node state; spawned tasks report back
//! over a completion channel. Concurrency is bounded by a semaphore whose
//! permits are acquired inside the job tasks, so a full pool never stalls
//! completion handling.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::job::{Event, EventSink, ExecError, Job, ShouldRun};

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Jobs that finished by running.
    pub built: usize,
    /// Jobs that finished from cache.
    pub cached: usize,
    /// Jobs that did not finish, with their errors.
    pub errored: Vec<(String, ExecError)>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.errored.is_empty()
    }
}

enum Completion {
    Finished { node: NodeIndex, cached: bool },
    Errored { node: NodeIndex, error: ExecError },
}

struct Node {
    job: Arc<dyn Job>,
    /// Error captured while resolving dependencies, surfaced at dequeue.
    dep_error: Option<ExecError>,
}

/// Bounded-parallelism scheduler over a job DAG.
pub struct Executor {
    parallelism: usize,
}

impl Executor {
    pub fn new(parallelism: usize) -> Self {
        Executor {
            parallelism: parallelism.max(1),
        }
    }

    /// Run `targets` (and everything they depend on) from `jobs`.
    ///
    /// Startup failures (unknown target, dependency cycle) return `Err`.
    /// Individual job failures are recorded in the summary and poison
    /// their dependents; the run itself keeps going.
    pub async fn run(
        &self,
        jobs: Vec<Arc<dyn Job>>,
        targets: &[String],
        cancel: CancellationToken,
        events: Arc<dyn EventSink>,
    ) -> Result<RunSummary, ExecError> {
        // Build the graph. Edges point dependent -> dependency.
        let mut graph: DiGraph<Node, ()> = DiGraph::new();
        let mut by_name: HashMap<String, NodeIndex> = HashMap::new();

        for job in jobs {
            let name = job.name();
            let node = graph.add_node(Node {
                job,
                dep_error: None,
            });
            by_name.insert(name, node);
        }

        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for node in indices {
            let deps = graph[node].job.dependencies();
            match deps {
                Ok(deps) => {
                    for dep in deps {
                        match by_name.get(&dep) {
                            Some(&dep_node) => {
                                graph.add_edge(node, dep_node, ());
                            }
                            None => {
                                graph[node].dep_error = Some(ExecError::UnknownJob(dep));
                                break;
                            }
                        }
                    }
                }
                Err(message) => {
                    graph[node].dep_error = Some(ExecError::Failed(message));
                }
            }
        }

        // Resolve the reachable set.
        let mut reachable: HashSet<NodeIndex> = HashSet::new();
        let mut stack = Vec::new();
        for target in targets {
            let &node = by_name
                .get(target)
                .ok_or_else(|| ExecError::UnknownJob(target.clone()))?;
            stack.push(node);
        }
        while let Some(node) = stack.pop() {
            if !reachable.insert(node) {
                continue;
            }
            for dep in graph.neighbors_directed(node, Direction::Outgoing) {
                stack.push(dep);
            }
        }

        // Reject cycles up front.
        let order = topo_order(&graph, &reachable)
            .map_err(|node| ExecError::Cycle(graph[node].job.name()))?;

        // Everything reachable is queued before anything starts,
        // dependencies first.
        for &node in &order {
            events.event(&Event::Queued {
                job: graph[node].job.name(),
            });
        }

        let mut remaining_deps: HashMap<NodeIndex, usize> = HashMap::new();
        let mut ready: VecDeque<NodeIndex> = VecDeque::new();
        for &node in &order {
            let count = graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|d| reachable.contains(d))
                .count();
            remaining_deps.insert(node, count);
            if count == 0 {
                ready.push_back(node);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();

        let mut summary = RunSummary::default();
        let mut done: HashSet<NodeIndex> = HashSet::new();
        let mut running: usize = 0;
        let mut cancelled = false;

        loop {
            while let Some(node) = ready.pop_front() {
                if done.contains(&node) {
                    continue;
                }
                if cancelled {
                    self.fail_node(&graph, node, ExecError::Cancelled, &events, &mut summary);
                    done.insert(node);
                    continue;
                }
                if let Some(error) = graph[node].dep_error.clone() {
                    // captured at graph build time, surfaced at dequeue
                    self.fail_node(&graph, node, error, &events, &mut summary);
                    done.insert(node);
                    self.poison_dependents(
                        &graph,
                        node,
                        &reachable,
                        &mut done,
                        &events,
                        &mut summary,
                    );
                    continue;
                }

                running += 1;
                self.spawn_job(node, &graph, &semaphore, &tx, &cancel, &events);
            }

            if done.len() == reachable.len() {
                break;
            }
            if running == 0 && ready.is_empty() {
                // Nothing running and nothing ready: the rest were poisoned.
                break;
            }

            let completion = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    // Jobs never dequeued fail as cancelled.
                    let pending: Vec<NodeIndex> = order
                        .iter()
                        .copied()
                        .filter(|n| !done.contains(n) && remaining_deps[n] > 0)
                        .collect();
                    for node in pending {
                        self.fail_node(&graph, node, ExecError::Cancelled, &events, &mut summary);
                        done.insert(node);
                    }
                    continue;
                }
                completion = rx.recv() => completion,
            };

            let Some(completion) = completion else {
                break;
            };
            running -= 1;

            match completion {
                Completion::Finished { node, cached } => {
                    done.insert(node);
                    if cached {
                        summary.cached += 1;
                    } else {
                        summary.built += 1;
                    }
                    events.event(&Event::Finished {
                        job: graph[node].job.name(),
                        cached,
                    });

                    for dependent in graph.neighbors_directed(node, Direction::Incoming) {
                        if !reachable.contains(&dependent) {
                            continue;
                        }
                        let count = remaining_deps.get_mut(&dependent).expect("tracked node");
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
                Completion::Errored { node, error } => {
                    warn!(job = %graph[node].job.name(), %error, "job errored");
                    self.fail_node(&graph, node, error, &events, &mut summary);
                    done.insert(node);
                    self.poison_dependents(
                        &graph,
                        node,
                        &reachable,
                        &mut done,
                        &events,
                        &mut summary,
                    );
                }
            }
        }

        Ok(summary)
    }

    fn spawn_job(
        &self,
        node: NodeIndex,
        graph: &DiGraph<Node, ()>,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::UnboundedSender<Completion>,
        cancel: &CancellationToken,
        events: &Arc<dyn EventSink>,
    ) {
        let job = graph[node].job.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        let events = events.clone();

        tokio::spawn(async move {
            // Permit acquisition inside the task: the pool bounds hashing
            // and building alike without blocking the executor loop.
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let completion = run_one(job, cancel, &events).await;
            let completion = match completion {
                Ok(cached) => Completion::Finished { node, cached },
                Err(error) => Completion::Errored { node, error },
            };
            let _ = tx.send(completion);
            drop(permit);
        });
    }

    fn fail_node(
        &self,
        graph: &DiGraph<Node, ()>,
        node: NodeIndex,
        error: ExecError,
        events: &Arc<dyn EventSink>,
        summary: &mut RunSummary,
    ) {
        let name = graph[node].job.name();
        events.event(&Event::Errored {
            job: name.clone(),
            error: error.clone(),
        });
        summary.errored.push((name, error));
    }

    /// Transitively fail everything that depends on `failed`.
    fn poison_dependents(
        &self,
        graph: &DiGraph<Node, ()>,
        failed: NodeIndex,
        reachable: &HashSet<NodeIndex>,
        done: &mut HashSet<NodeIndex>,
        events: &Arc<dyn EventSink>,
        summary: &mut RunSummary,
    ) {
        let failed_name = graph[failed].job.name();
        let mut stack = vec![failed];
        while let Some(node) = stack.pop() {
            for dependent in graph.neighbors_directed(node, Direction::Incoming) {
                if !reachable.contains(&dependent) || done.contains(&dependent) {
                    continue;
                }
                done.insert(dependent);
                debug!(
                    job = %graph[dependent].job.name(),
                    dep = %failed_name,
                    "poisoned by failed dependency"
                );
                self.fail_node(
                    graph,
                    dependent,
                    ExecError::DependencyFailed {
                        dep: graph[node].job.name(),
                    },
                    events,
                    summary,
                );
                stack.push(dependent);
            }
        }
    }
}

/// Run one job through its cache gate.
async fn run_one(
    job: Arc<dyn Job>,
    cancel: CancellationToken,
    events: &Arc<dyn EventSink>,
) -> Result<bool, ExecError> {
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    match job.should_run().await {
        Ok(ShouldRun::SkipCached) => {
            debug!(job = %job.name(), "cached, skipping");
            return Ok(true);
        }
        Ok(ShouldRun::FailCached(message)) => {
            return Err(ExecError::CachedFailure(message));
        }
        Ok(ShouldRun::Run) => {}
        Err(e) => return Err(ExecError::Failed(format!("{e:#}"))),
    }

    events.event(&Event::Started { job: job.name() });

    tokio::select! {
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
        result = job.run(cancel.clone()) => match result {
            Ok(()) => Ok(false),
            Err(e) => Err(ExecError::Failed(format!("{e:#}"))),
        },
    }
}

/// Topological order of the reachable subgraph, dependencies first.
/// Returns a node on a cycle as the error.
fn topo_order(
    graph: &DiGraph<Node, ()>,
    reachable: &HashSet<NodeIndex>,
) -> Result<Vec<NodeIndex>, NodeIndex> {
    let mut order = Vec::with_capacity(reachable.len());
    let mut state: HashMap<NodeIndex, u8> = HashMap::new(); // 1 = visiting, 2 = done

    // Deterministic iteration: node insertion order.
    let mut roots: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| reachable.contains(n))
        .collect();
    roots.sort();

    for root in roots {
        if state.get(&root) == Some(&2) {
            continue;
        }
        let mut stack = vec![(root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                state.insert(node, 2);
                order.push(node);
                continue;
            }
            match state.get(&node) {
                Some(1) => return Err(node),
                Some(2) => continue,
                _ => {}
            }
            state.insert(node, 1);
            stack.push((node, true));
            let mut deps: Vec<NodeIndex> = graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|d| reachable.contains(d))
                .collect();
            deps.sort();
            for dep in deps {
                if state.get(&dep) == Some(&1) {
                    return Err(dep);
                }
                if state.get(&dep) != Some(&2) {
                    stack.push((dep, false));
                }
            }
        }
    }

    Ok(order)
}
