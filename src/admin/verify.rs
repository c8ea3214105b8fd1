use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Critical issue indicating corruption or broken references.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Counts collected while verifying.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Tasks in the recovered table.
    pub tasks: usize,
    /// Tasks held by the primary file before WAL replay.
    pub primary_tasks: usize,
    /// Live WAL segments.
    pub wal_segments: usize,
}

/// Complete report of a verification run.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Whether verification passed without finding any issues.
    pub success: bool,
    /// Issues found, capped at a fixed number with a trailing note.
    pub findings: Vec<VerifyFinding>,
    /// Sizes of the structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the store kept in `dir`.
///
/// Checks the primary file checksums, every live WAL segment, index consistency,
/// parent links, dangling dependencies and dependency cycles.
///
/// # Errors
///
/// Returns an error if the store cannot be opened. Damage found after a successful
/// open is reported through findings.
pub fn verify(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<VerifyReport> {
    let store = open_store(dir.as_ref(), opts)?;
    let checked = store.verify();
    store.close()?;

    let mut findings = Vec::new();
    for issue in &checked.issues {
        push_error(&mut findings, issue.clone());
    }
    let success = checked.is_ok();
    if checked.issues.len() > MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity: VerifySeverity::Info,
            message: format!("{} more issues not shown", checked.issues.len() - MAX_FINDINGS),
        });
    }
    Ok(VerifyReport {
        success,
        findings,
        counts: VerifyCounts {
            tasks: checked.tasks_checked,
            primary_tasks: checked.primary_tasks,
            wal_segments: checked.wal_segments,
        },
    })
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: String) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding {
            severity: VerifySeverity::Error,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminError;
    use crate::model::NewTask;

    #[test]
    fn missing_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify(dir.path(), &AdminOpenOptions::default()).unwrap_err();
        assert!(matches!(err, AdminError::MissingStore { .. }));
        assert!(err.store_kind().is_none());
    }

    #[test]
    fn file_in_place_of_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let err = verify(&file, &AdminOpenOptions::default()).unwrap_err();
        assert!(matches!(err, AdminError::NotADirectory { .. }));
    }

    #[test]
    fn healthy_store_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let opts = AdminOpenOptions {
            create_if_missing: true,
            ..AdminOpenOptions::default()
        };
        {
            let store = open_store(dir.path(), &opts).unwrap();
            store.create_task(NewTask::new("proj")).unwrap();
            store
                .create_task(NewTask::new("proj/a").parent("proj").depends_on("proj"))
                .unwrap();
        }
        let report = verify(dir.path(), &AdminOpenOptions::default()).unwrap();
        assert!(report.success, "{:?}", report.findings);
        assert_eq!(report.counts.tasks, 2);
    }
}
