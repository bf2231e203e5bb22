use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::Acl;
use crate::error::StudyError;
use crate::paths::PathResolver;
use crate::storage::{FileManager, MountedVolume};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum WorkerOperation {
    CreateFolder {
        paths: Vec<String>,
        acl: Acl,
        exist_ok: bool,
    },
    DeleteFolder {
        path: String,
    },
    FolderExists {
        path: String,
    },
    GetPermission {
        path: String,
    },
    UpdatePermission {
        path: String,
        acl: Acl,
    },
    IsFile {
        path: String,
    },
    IsFolder {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub correlation_id: Uuid,
    #[serde(flatten)]
    pub operation: WorkerOperation,
}

impl WorkerRequest {
    pub fn new(operation: WorkerOperation) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            operation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryResult {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub octal_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EntryResult {
    fn done(status: bool) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    fn answer(value: bool) -> Self {
        Self {
            status: true,
            value: Some(value),
            ..Self::default()
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub correlation_id: Uuid,
    pub entries: BTreeMap<String, EntryResult>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.entries.values().all(|entry| entry.status)
    }

    fn single(&self) -> Option<&EntryResult> {
        self.entries.values().next()
    }
}

/// Transport between the caller and the cluster worker.
pub trait WorkerChannel: Send + Sync {
    fn post(&self, request: WorkerRequest) -> Result<(), StudyError>;
    fn receive(&self, correlation_id: Uuid, timeout: Duration) -> Result<TaskResult, StudyError>;
}

/// Worker-side executor over the cluster view of a storage root.
pub struct WorkerService {
    volume: MountedVolume,
}

impl WorkerService {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            volume: MountedVolume::new(root),
        }
    }

    pub fn handle(&self, request: WorkerRequest) -> TaskResult {
        TaskResult {
            correlation_id: request.correlation_id,
            entries: self.execute(&request.operation),
        }
    }

    pub fn execute(&self, operation: &WorkerOperation) -> BTreeMap<String, EntryResult> {
        let mut entries = BTreeMap::new();
        match operation {
            WorkerOperation::CreateFolder {
                paths,
                acl,
                exist_ok,
            } => {
                for path in paths {
                    let entry = outcome(self.volume.create_folder(&[path.as_str()], *acl, *exist_ok));
                    entries.insert(path.clone(), entry);
                }
            }
            WorkerOperation::DeleteFolder { path } => {
                entries.insert(path.clone(), outcome(self.volume.delete_folder(path)));
            }
            WorkerOperation::UpdatePermission { path, acl } => {
                let entry = outcome(self.volume.update_folder_permission(path, *acl));
                entries.insert(path.clone(), entry);
            }
            WorkerOperation::FolderExists { path } | WorkerOperation::IsFolder { path } => {
                entries.insert(path.clone(), answer(self.volume.is_folder(path)));
            }
            WorkerOperation::IsFile { path } => {
                entries.insert(path.clone(), answer(self.volume.is_file(path)));
            }
            WorkerOperation::GetPermission { path } => {
                let entry = match self.volume.resolver().absolute(path) {
                    Ok(absolute) => match MountedVolume::mode_at(&absolute) {
                        Some(mode) => EntryResult {
                            status: true,
                            octal_value: Some(format!("{:o}", mode & 0o7777)),
                            ..EntryResult::default()
                        },
                        None => EntryResult::failed(format!("{absolute} does not exist")),
                    },
                    Err(err) => EntryResult::failed(err.to_string()),
                };
                entries.insert(path.clone(), entry);
            }
        }
        entries
    }
}

fn outcome(result: Result<bool, StudyError>) -> EntryResult {
    match result {
        Ok(status) => EntryResult::done(status),
        Err(err) => EntryResult::failed(err.to_string()),
    }
}

fn answer(result: Result<bool, StudyError>) -> EntryResult {
    match result {
        Ok(value) => EntryResult::answer(value),
        Err(err) => EntryResult::failed(err.to_string()),
    }
}

/// In-process worker: one background thread draining a request queue.
pub struct ThreadWorker {
    requests: Mutex<Sender<WorkerRequest>>,
    results: Mutex<Receiver<TaskResult>>,
    parked: Mutex<HashMap<Uuid, TaskResult>>,
}

impl ThreadWorker {
    pub fn spawn(service: WorkerService) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>();
        let (result_tx, result_rx) = mpsc::channel();
        thread::spawn(move || {
            for request in request_rx {
                debug!(id = %request.correlation_id, "worker task received");
                if result_tx.send(service.handle(request)).is_err() {
                    break;
                }
            }
        });
        Self {
            requests: Mutex::new(request_tx),
            results: Mutex::new(result_rx),
            parked: Mutex::new(HashMap::new()),
        }
    }
}

impl WorkerChannel for ThreadWorker {
    fn post(&self, request: WorkerRequest) -> Result<(), StudyError> {
        let sender = self
            .requests
            .lock()
            .map_err(|_| StudyError::Worker("request queue poisoned".to_string()))?;
        sender
            .send(request)
            .map_err(|_| StudyError::Worker("worker thread is gone".to_string()))
    }

    fn receive(&self, correlation_id: Uuid, timeout: Duration) -> Result<TaskResult, StudyError> {
        let deadline = Instant::now() + timeout;
        let results = self
            .results
            .lock()
            .map_err(|_| StudyError::Worker("result queue poisoned".to_string()))?;
        loop {
            {
                let mut parked = self
                    .parked
                    .lock()
                    .map_err(|_| StudyError::Worker("result cache poisoned".to_string()))?;
                if let Some(result) = parked.remove(&correlation_id) {
                    return Ok(result);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match results.recv_timeout(remaining) {
                Ok(result) if result.correlation_id == correlation_id => return Ok(result),
                Ok(other) => {
                    if let Ok(mut parked) = self.parked.lock() {
                        parked.insert(other.correlation_id, other);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(StudyError::WorkerTimeout(timeout.as_secs()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StudyError::Worker("worker thread is gone".to_string()));
                }
            }
        }
    }
}

/// File manager whose every call is a task executed by the cluster worker.
pub struct RemoteFileManager {
    resolver: PathResolver,
    channel: Box<dyn WorkerChannel>,
    timeout: Duration,
}

impl RemoteFileManager {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        channel: Box<dyn WorkerChannel>,
        task_get_timeout_in_seconds: u64,
    ) -> Self {
        Self {
            resolver: PathResolver::new(root),
            channel,
            timeout: Duration::from_secs(task_get_timeout_in_seconds),
        }
    }

    fn call(&self, operation: WorkerOperation) -> Option<TaskResult> {
        let request = WorkerRequest::new(operation);
        let correlation_id = request.correlation_id;
        let outcome = self
            .channel
            .post(request)
            .and_then(|()| self.channel.receive(correlation_id, self.timeout));
        match outcome {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(id = %correlation_id, error = %err, "remote worker call failed");
                None
            }
        }
    }

    fn validated(&self, path: &str) -> Result<String, StudyError> {
        Ok(self.resolver.absolute(path)?.into_string())
    }

    fn status_of(&self, operation: WorkerOperation) -> bool {
        self.call(operation)
            .map(|result| result.succeeded())
            .unwrap_or(false)
    }

    fn value_of(&self, operation: WorkerOperation) -> bool {
        self.call(operation)
            .filter(TaskResult::succeeded)
            .and_then(|result| result.single().and_then(|entry| entry.value))
            .unwrap_or(false)
    }
}

impl FileManager for RemoteFileManager {
    fn create_folder(
        &self,
        paths: &[&str],
        acl: Acl,
        exist_ok: bool,
    ) -> Result<bool, StudyError> {
        let paths = paths
            .iter()
            .map(|path| self.validated(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.status_of(WorkerOperation::CreateFolder {
            paths,
            acl,
            exist_ok,
        }))
    }

    fn delete_folder(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.validated(path)?;
        Ok(self.status_of(WorkerOperation::DeleteFolder { path }))
    }

    fn does_folder_exist(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.validated(path)?;
        Ok(self.value_of(WorkerOperation::FolderExists { path }))
    }

    fn get_folder_permission(&self, path: &str) -> Result<Acl, StudyError> {
        let path = self.validated(path)?;
        let acl = self
            .call(WorkerOperation::GetPermission { path })
            .filter(TaskResult::succeeded)
            .and_then(|result| result.single().and_then(|entry| entry.octal_value.clone()))
            .and_then(|octal| u32::from_str_radix(&octal, 8).ok())
            .map(Acl::from_mode)
            .unwrap_or(Acl::Unknown);
        Ok(acl)
    }

    fn update_folder_permission(&self, path: &str, acl: Acl) -> Result<bool, StudyError> {
        let path = self.validated(path)?;
        Ok(self.status_of(WorkerOperation::UpdatePermission { path, acl }))
    }

    fn is_file(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.validated(path)?;
        Ok(self.value_of(WorkerOperation::IsFile { path }))
    }

    fn is_folder(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.validated(path)?;
        Ok(self.value_of(WorkerOperation::IsFolder { path }))
    }

    fn get_uri(&self, path: &str) -> Result<String, StudyError> {
        let path = self.validated(path)?;
        Ok(format!("remote://{path}"))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    struct SilentChannel;

    impl WorkerChannel for SilentChannel {
        fn post(&self, _request: WorkerRequest) -> Result<(), StudyError> {
            Ok(())
        }

        fn receive(&self, _id: Uuid, timeout: Duration) -> Result<TaskResult, StudyError> {
            Err(StudyError::WorkerTimeout(timeout.as_secs()))
        }
    }

    fn cluster_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn task_result_success_requires_every_entry() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), EntryResult::done(true));
        entries.insert("b".to_string(), EntryResult::failed("denied"));
        let result = TaskResult {
            correlation_id: Uuid::new_v4(),
            entries,
        };
        assert!(!result.succeeded());
    }

    #[test]
    fn request_document_shape() {
        let request = WorkerRequest::new(WorkerOperation::DeleteFolder {
            path: "/x".to_string(),
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["operation"], "delete_folder");
        assert_eq!(json["path"], "/x");
        assert!(json["correlation_id"].is_string());
    }

    #[test]
    fn thread_worker_round_trip() {
        let (_temp, root) = cluster_root();
        let worker = ThreadWorker::spawn(WorkerService::new(root.clone()));
        let manager = RemoteFileManager::new(root.clone(), Box::new(worker), 5);
        assert!(manager
            .create_folder(&["mtbls1-abc", "mtbls1-abc/RAW_FILES"], Acl::AuthorizedRead, true)
            .unwrap());
        assert!(manager.does_folder_exist("mtbls1-abc").unwrap());
        assert!(!manager.is_file("mtbls1-abc").unwrap());
        assert_eq!(
            manager.get_folder_permission("mtbls1-abc").unwrap(),
            Acl::AuthorizedRead
        );
        assert!(manager
            .update_folder_permission("mtbls1-abc", Acl::AuthorizedReadWrite)
            .unwrap());
        assert_eq!(
            manager.get_folder_permission("mtbls1-abc").unwrap(),
            Acl::AuthorizedReadWrite
        );
        assert!(manager.delete_folder("mtbls1-abc").unwrap());
        assert!(!manager.does_folder_exist("mtbls1-abc").unwrap());
    }

    #[test]
    fn timeout_reads_as_false_and_traversal_propagates() {
        let manager = RemoteFileManager::new("/cluster", Box::new(SilentChannel), 0);
        assert!(!manager.does_folder_exist("x").unwrap());
        assert_eq!(manager.get_folder_permission("x").unwrap(), Acl::Unknown);
        assert_matches!(
            manager.delete_folder("a/../../etc"),
            Err(StudyError::NotAllowedFile(_))
        );
    }
}
