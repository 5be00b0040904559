//! In-process worker pool (spec section 4.8).
//!
//! Grounded on `examples/original_source/src/job_manager.{h,cpp}`: a mutex-
//! guarded map of job records plus one thread (here, one tokio task) per
//! running job, a per-job atomic cancellation flag, and a bounded
//! `max_jobs` admission check done before spawning. `Stop` there joins every
//! thread; here it awaits every `JoinHandle`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tm_types::state_machine::{self, IllegalTransition, JobState};
use tm_types::{ErrorCode, HasErrorCode};

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("{max_jobs} concurrent jobs already running")]
    ResourceExhausted { max_jobs: usize },
    #[error("job {job_id} not found")]
    NotFound { job_id: Uuid },
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

impl HasErrorCode for JobsError {
    fn error_code(&self) -> ErrorCode {
        match self {
            JobsError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            JobsError::NotFound { .. } => ErrorCode::NotFound,
            JobsError::IllegalTransition(_) => ErrorCode::IllegalTransition,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub request_id: Option<String>,
    pub status: JobState,
    pub error: Option<String>,
}

struct JobRecord {
    info: JobInfo,
    cancel_flag: Arc<AtomicBool>,
}

struct State {
    jobs: HashMap<Uuid, JobRecord>,
    handles: HashMap<Uuid, JoinHandle<()>>,
    current_jobs: usize,
    stopping: bool,
}

/// Bounded in-process worker pool. `work` closures receive their own
/// cancellation flag and are expected to poll it between iterations of any
/// long-running loop (spec: "Suspension points inside work functions").
pub struct JobManager {
    max_jobs: usize,
    state: Mutex<State>,
}

impl JobManager {
    pub fn new(max_jobs: usize) -> Arc<Self> {
        Arc::new(Self {
            max_jobs,
            state: Mutex::new(State {
                jobs: HashMap::new(),
                handles: HashMap::new(),
                current_jobs: 0,
                stopping: false,
            }),
        })
    }

    /// Registers `job_id` as RUNNING and spawns `work` on a tokio task.
    /// Fails with [`JobsError::ResourceExhausted`] if `max_jobs` running
    /// jobs are already in flight.
    pub fn start_job<F, Fut>(
        self: &Arc<Self>,
        job_id: Uuid,
        request_id: Option<String>,
        work: F,
    ) -> Result<(), JobsError>
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().expect("job manager mutex poisoned");
            if state.stopping {
                return Err(JobsError::ResourceExhausted { max_jobs: self.max_jobs });
            }
            if state.current_jobs >= self.max_jobs {
                return Err(JobsError::ResourceExhausted { max_jobs: self.max_jobs });
            }
            state.current_jobs += 1;
            state.jobs.insert(
                job_id,
                JobRecord {
                    info: JobInfo { job_id, request_id, status: JobState::Running, error: None },
                    cancel_flag: Arc::clone(&cancel_flag),
                },
            );
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = work(Arc::clone(&cancel_flag)).await;
            let final_state = match outcome {
                Ok(()) if cancel_flag.load(Ordering::SeqCst) => JobState::Cancelled,
                Ok(()) => JobState::Completed,
                Err(ref msg) => {
                    tracing::error!(job_id = %job_id, error = %msg, "job failed");
                    JobState::Failed
                }
            };
            let mut state = this.state.lock().expect("job manager mutex poisoned");
            if let Some(record) = state.jobs.get_mut(&job_id) {
                if record.info.status.can_transition_to(final_state) {
                    record.info.status = final_state;
                }
                if let Err(msg) = outcome {
                    record.info.error = Some(msg);
                }
            }
            state.current_jobs = state.current_jobs.saturating_sub(1);
        });

        self.state.lock().expect("job manager mutex poisoned").handles.insert(job_id, handle);
        Ok(())
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobState, JobsError> {
        self.state
            .lock()
            .expect("job manager mutex poisoned")
            .jobs
            .get(&job_id)
            .map(|r| r.info.status)
            .ok_or(JobsError::NotFound { job_id })
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.state.lock().expect("job manager mutex poisoned").jobs.values().map(|r| r.info.clone()).collect()
    }

    /// Sets the job's cancellation flag. The job itself transitions to
    /// CANCELLED only once its work function observes the flag and returns
    /// (cancellation is cooperative, never preemptive).
    pub fn cancel(&self, job_id: Uuid) -> Result<(), JobsError> {
        let state = self.state.lock().expect("job manager mutex poisoned");
        let record = state.jobs.get(&job_id).ok_or(JobsError::NotFound { job_id })?;
        record.cancel_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Signals every in-flight job to cancel and blocks until all worker
    /// tasks finish.
    pub async fn stop(&self) {
        let handles = {
            let mut state = self.state.lock().expect("job manager mutex poisoned");
            state.stopping = true;
            for record in state.jobs.values() {
                record.cancel_flag.store(true, Ordering::SeqCst);
            }
            state.handles.drain().map(|(_, h)| h).collect::<Vec<_>>()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Verifies a proposed transition against the shared job state machine
/// before a caller applies it to a persisted row, matching spec 4.7's "all
/// job-owning components route writes through this machine".
pub fn checked_transition(current: JobState, next: JobState) -> Result<JobState, JobsError> {
    state_machine::transition(current, next).map_err(JobsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn rejects_start_beyond_max_jobs() {
        let manager = JobManager::new(1);
        manager
            .start_job(Uuid::new_v4(), None, |_cancel| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .unwrap();
        let err = manager
            .start_job(Uuid::new_v4(), None, |_cancel| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, JobsError::ResourceExhausted { max_jobs: 1 }));
    }

    #[tokio::test]
    async fn completed_job_transitions_to_completed() {
        let manager = JobManager::new(4);
        let job_id = Uuid::new_v4();
        manager.start_job(job_id, None, |_cancel| async { Ok(()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.status(job_id).unwrap(), JobState::Completed);
    }

    #[tokio::test]
    async fn failed_work_transitions_to_failed_with_message() {
        let manager = JobManager::new(4);
        let job_id = Uuid::new_v4();
        manager.start_job(job_id, None, |_cancel| async { Err("boom".to_string()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let jobs = manager.list();
        let job = jobs.iter().find(|j| j.job_id == job_id).unwrap();
        assert_eq!(job.status, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancel_flag_is_observed_cooperatively() {
        let manager = JobManager::new(4);
        let job_id = Uuid::new_v4();
        manager
            .start_job(job_id, None, |cancel| async move {
                for _ in 0..50 {
                    if cancel.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            })
            .unwrap();
        manager.cancel(job_id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.status(job_id).unwrap(), JobState::Cancelled);
    }

    #[tokio::test]
    async fn stop_waits_for_all_workers_to_finish() {
        let manager = JobManager::new(4);
        manager
            .start_job(Uuid::new_v4(), None, |cancel| async move {
                while !cancel.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            })
            .unwrap();
        manager.stop().await;
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.list()[0].status, JobState::Cancelled);
    }
}
