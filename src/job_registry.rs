use crate::job_handler::JobHandler;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How a single run of a registered job failed.
pub(crate) enum JobRunError {
    /// The stored payload did not deserialize into the registered type.
    ///
    /// This is an executor-level fault (a code/schema bug), not a payload
    /// failure, and is routed to the unhandled-error hook instead of the job.
    Deserialize(serde_json::Error),
    /// The handler itself returned an error; recorded on the execution.
    Payload(anyhow::Error),
}

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, Result<(), JobRunError>> + Send + Sync>;

/// Maps job type names to type-erased run functions.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    /// Register `J`, keyed by its `JOB_NAME`.
    pub(crate) fn register<J: JobHandler<Context = Context>>(&mut self) {
        let run = Arc::new(|context: Context, data: Value| {
            async move {
                let job: J = serde_json::from_value(data).map_err(JobRunError::Deserialize)?;
                job.run(context).await.map_err(JobRunError::Payload)
            }
            .boxed()
        });
        self.entries.insert(J::JOB_NAME.to_string(), run);
    }

    /// Look up the run function for a job type.
    pub(crate) fn get(&self, job_type: &str) -> Option<&RunTaskFn<Context>> {
        self.entries.get(job_type)
    }

    /// The registered job type names.
    pub(crate) fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
