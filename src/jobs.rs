use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::JobSettings;
use crate::fs_util;

pub const JOB_PRESENT_MARKER: &str = "JOBID";
pub const JOB_ABSENT_MARKER: &str = "is not found in queue";
pub const JOB_SUBMITTED_MARKER: &str = "is submitted to queue";

/// Wall-time cap of every submitted job, in minutes.
pub const MAX_WALL_TIME_MINUTES: u32 = 1440;

#[derive(Debug, Clone, Default)]
pub struct JobSubmission {
    pub email: Option<String>,
    pub account: Option<String>,
    pub queue: Option<String>,
    pub command: String,
    pub params: String,
    pub identifier: String,
    pub task_name: String,
    pub log: bool,
    pub log_path: Option<Utf8PathBuf>,
    pub error_log_path: Option<Utf8PathBuf>,
}

impl JobSubmission {
    pub fn job_name(&self) -> String {
        format!("{}_{}", self.identifier, self.task_name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitOutcome {
    pub ok: bool,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    pub log_file_path: Option<Utf8PathBuf>,
    pub job_id: Option<String>,
}

pub trait JobGateway: Send + Sync {
    fn submit_job(&self, submission: &JobSubmission) -> SubmitOutcome;
    fn list_jobs(&self, queue: Option<&str>, job_name: Option<&str>) -> CommandOutcome;
    fn kill_job(&self, queue: Option<&str>, job_id: &str) -> CommandOutcome;

    /// Polls the queue until `job_name` leaves it; false when the budget runs out.
    fn wait_until_finished(&self, queue: Option<&str>, job_name: &str, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            let listing = self.list_jobs(queue, Some(job_name));
            if listing.ok && listing.stderr.contains(JOB_ABSENT_MARKER) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_secs(1).min(budget));
        }
    }
}

/// Job id from a `Job <123> is submitted to queue <short>.` acknowledgement.
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let re = Regex::new(&format!(r"Job <(\d+)> {JOB_SUBMITTED_MARKER}")).ok()?;
    re.captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str().to_string())
}

/// Job id from the second line of a `bjobs` listing.
pub fn parse_listed_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

pub fn default_log_path(
    location: &Utf8Path,
    identifier: &str,
    task_name: &str,
    now: DateTime<Local>,
) -> Utf8PathBuf {
    location.join(format!(
        "{identifier}_{task_name}_{}.log",
        fs_util::timestamp(now)
    ))
}

/// LSF scheduler reached through one ssh invocation per call.
#[derive(Debug, Clone)]
pub struct LsfGateway {
    settings: JobSettings,
}

impl LsfGateway {
    pub fn new(settings: JobSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    fn queue<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue
            .filter(|queue| !queue.trim().is_empty())
            .unwrap_or(self.settings.default_queue.as_str())
    }

    /// `user@host` for the queue; the datamover queue runs on its own host.
    pub fn destination(&self, queue: &str) -> String {
        let (host, user) = if queue == self.settings.datamover_queue_name {
            (&self.settings.datamover_host, &self.settings.datamover_user)
        } else {
            (&self.settings.ssh_host, &self.settings.ssh_user)
        };
        match user {
            Some(user) => format!("{user}@{host}"),
            None => host.clone(),
        }
    }

    pub fn build_submit_command(
        &self,
        submission: &JobSubmission,
        now: DateTime<Local>,
    ) -> (String, Option<Utf8PathBuf>) {
        let queue = self.queue(submission.queue.as_deref());
        let mut parts = vec![
            "bsub".to_string(),
            "-q".to_string(),
            queue.to_string(),
            "-W".to_string(),
            MAX_WALL_TIME_MINUTES.to_string(),
            "-J".to_string(),
            submission.job_name(),
        ];
        let email = submission
            .email
            .as_ref()
            .or(self.settings.user_email.as_ref());
        if let Some(email) = email {
            parts.extend(["-u".to_string(), email.clone()]);
        }
        let account = submission
            .account
            .as_ref()
            .or(self.settings.account.as_ref());
        if let Some(account) = account {
            parts.extend(["-P".to_string(), account.clone()]);
        }
        let log_path = match (&submission.log_path, submission.log) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(default_log_path(
                &self.settings.job_track_log_location,
                &submission.identifier,
                &submission.task_name,
                now,
            )),
            (None, false) => None,
        };
        if let Some(path) = &log_path {
            parts.extend(["-o".to_string(), path.to_string()]);
        }
        if let Some(path) = &submission.error_log_path {
            parts.extend(["-e".to_string(), path.to_string()]);
        }
        parts.push(submission.command.clone());
        if !submission.params.trim().is_empty() {
            parts.push(submission.params.clone());
        }
        (parts.join(" "), log_path)
    }

    pub fn build_list_command(&self, queue: Option<&str>, job_name: Option<&str>) -> String {
        let mut command = format!("bjobs -q {}", self.queue(queue));
        if let Some(name) = job_name {
            command.push_str(&format!(" -J {name}"));
        }
        command
    }

    pub fn build_kill_command(&self, queue: Option<&str>, job_id: &str) -> String {
        format!("bkill -q {} {job_id}", self.queue(queue))
    }

    fn run_remote(&self, queue: &str, remote_command: &str) -> Result<CommandOutcome, String> {
        let mut words = self.settings.ssh_command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| "jobs.ssh_command is empty".to_string())?;
        let mut cmd = Command::new(program);
        cmd.args(words)
            .arg(self.destination(queue))
            .arg(remote_command);
        debug!(command = remote_command, "running scheduler command");
        let output = cmd.output().map_err(|err| err.to_string())?;
        Ok(CommandOutcome {
            ok: output.status.success(),
            message: String::new(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl JobGateway for LsfGateway {
    fn submit_job(&self, submission: &JobSubmission) -> SubmitOutcome {
        let queue = self.queue(submission.queue.as_deref()).to_string();
        let (command, log_file_path) = self.build_submit_command(submission, Local::now());
        match self.run_remote(&queue, &command) {
            Ok(outcome) if outcome.ok => {
                let job_id = parse_job_id(&outcome.stdout);
                info!(
                    job = %submission.job_name(),
                    queue = %queue,
                    job_id = job_id.as_deref().unwrap_or("?"),
                    "job submitted"
                );
                SubmitOutcome {
                    ok: true,
                    message: format!("{} submitted to {queue}", submission.job_name()),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    log_file_path,
                    job_id,
                }
            }
            Ok(outcome) => {
                warn!(job = %submission.job_name(), stderr = %outcome.stderr.trim(), "job submission failed");
                SubmitOutcome {
                    ok: false,
                    message: failure_message(&outcome.stderr, &command),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    log_file_path,
                    job_id: None,
                }
            }
            Err(message) => {
                warn!(job = %submission.job_name(), error = %message, "job submission failed");
                SubmitOutcome {
                    ok: false,
                    message,
                    log_file_path,
                    ..SubmitOutcome::default()
                }
            }
        }
    }

    fn list_jobs(&self, queue: Option<&str>, job_name: Option<&str>) -> CommandOutcome {
        let queue = self.queue(queue).to_string();
        let command = self.build_list_command(Some(&queue), job_name);
        match self.run_remote(&queue, &command) {
            Ok(mut outcome) => {
                // bjobs exits non-zero when nothing matches; that is still an answer.
                outcome.ok = outcome.ok || outcome.stderr.contains(JOB_ABSENT_MARKER);
                if !outcome.ok {
                    outcome.message = failure_message(&outcome.stderr, &command);
                }
                outcome
            }
            Err(message) => CommandOutcome {
                ok: false,
                message,
                ..CommandOutcome::default()
            },
        }
    }

    fn kill_job(&self, queue: Option<&str>, job_id: &str) -> CommandOutcome {
        let queue = self.queue(queue).to_string();
        let command = self.build_kill_command(Some(&queue), job_id);
        match self.run_remote(&queue, &command) {
            Ok(mut outcome) => {
                outcome.message = if outcome.ok {
                    format!("kill requested for job {job_id}")
                } else {
                    failure_message(&outcome.stderr, &command)
                };
                outcome
            }
            Err(message) => CommandOutcome {
                ok: false,
                message,
                ..CommandOutcome::default()
            },
        }
    }
}

fn failure_message(stderr: &str, command: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("command failed: {command}")
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn gateway() -> LsfGateway {
        LsfGateway::new(JobSettings {
            ssh_user: Some("curator".to_string()),
            ssh_host: "hpc-login".to_string(),
            datamover_user: Some("mover".to_string()),
            datamover_host: "hpc-dm".to_string(),
            ..JobSettings::default()
        })
    }

    #[test]
    fn submit_command_carries_job_name_and_logs() {
        let gateway = gateway();
        let submission = JobSubmission {
            command: "rsync".to_string(),
            params: "-auv /a/. /b/".to_string(),
            identifier: "MTBLS1".to_string(),
            task_name: "rsync:from:rw_storage_metadata:to:private_ftp_metadata".to_string(),
            log_path: Some(Utf8PathBuf::from("/logs/t.stdout")),
            error_log_path: Some(Utf8PathBuf::from("/logs/t.stderr")),
            ..JobSubmission::default()
        };
        let now = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let (command, log) = gateway.build_submit_command(&submission, now);
        assert_eq!(
            command,
            "bsub -q short -W 1440 -J MTBLS1_rsync:from:rw_storage_metadata:to:private_ftp_metadata \
             -o /logs/t.stdout -e /logs/t.stderr rsync -auv /a/. /b/"
        );
        assert_eq!(log, Some(Utf8PathBuf::from("/logs/t.stdout")));
    }

    #[test]
    fn default_log_path_uses_track_location() {
        let gateway = gateway();
        let submission = JobSubmission {
            command: "echo".to_string(),
            identifier: "MTBLS2".to_string(),
            task_name: "ping".to_string(),
            log: true,
            ..JobSubmission::default()
        };
        let now = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let (_, log) = gateway.build_submit_command(&submission, now);
        assert_eq!(
            log,
            Some(Utf8PathBuf::from(
                "/tmp/sfm-job-logs/MTBLS2_ping_2024-03-05_07-08-09.log"
            ))
        );
    }

    #[test]
    fn datamover_queue_switches_destination() {
        let gateway = gateway();
        assert_eq!(gateway.destination("short"), "curator@hpc-login");
        assert_eq!(gateway.destination("datamover"), "mover@hpc-dm");
        assert_eq!(
            gateway.build_list_command(None, Some("MTBLS1_x")),
            "bjobs -q short -J MTBLS1_x"
        );
    }

    #[test]
    fn parse_acknowledgement_and_listing() {
        assert_eq!(
            parse_job_id("Job <4711> is submitted to queue <short>.\n").as_deref(),
            Some("4711")
        );
        assert_eq!(parse_job_id("nothing"), None);
        let listing = "JOBID   USER    STAT  QUEUE\n4711    curator RUN   short\n";
        assert_eq!(parse_listed_job_id(listing).as_deref(), Some("4711"));
    }
}
