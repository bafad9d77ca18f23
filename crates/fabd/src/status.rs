//! Run status tracking for the HTTP surface.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

use fab_graph::{Event, EventSink};
use fab_store::BuildInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Waiting,
    Queued,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildStatus {
    pub name: String,
    pub state: BuildState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<BuildInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The status of every job in the current run, served as JSON.
#[derive(Default)]
pub struct StatusBoard {
    builds: RwLock<BTreeMap<String, BuildStatus>>,
}

impl StatusBoard {
    /// Register the job list. The synthetic `all` job is not shown.
    pub fn set_jobs(&self, names: impl IntoIterator<Item = String>) {
        let mut builds = self.builds.write().unwrap();
        builds.clear();
        for name in names {
            if name == "all" {
                continue;
            }
            builds.insert(
                name.clone(),
                BuildStatus {
                    name,
                    state: BuildState::Waiting,
                    info: None,
                    error: None,
                },
            );
        }
    }

    /// Attach the computed build identity to a job.
    pub fn record_info(&self, job: &str, info: &BuildInfo) {
        let mut builds = self.builds.write().unwrap();
        if let Some(status) = builds.get_mut(job) {
            status.info = Some(info.clone());
        }
    }

    fn set_state(&self, job: &str, state: BuildState, error: Option<String>) {
        let mut builds = self.builds.write().unwrap();
        if let Some(status) = builds.get_mut(job) {
            status.state = state;
            status.error = error;
        }
    }

    pub fn snapshot(&self) -> Vec<BuildStatus> {
        self.builds.read().unwrap().values().cloned().collect()
    }
}

impl EventSink for StatusBoard {
    fn event(&self, event: &Event) {
        match event {
            Event::Queued { job } => self.set_state(job, BuildState::Queued, None),
            Event::Started { job } => self.set_state(job, BuildState::Running, None),
            Event::Finished { job, .. } => self.set_state(job, BuildState::Finished, None),
            Event::Errored { job, error } => {
                self.set_state(job, BuildState::Failed, Some(error.to_string()))
            }
        }
    }
}
