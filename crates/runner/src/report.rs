//! Per-test outcomes and their aggregation per suite.

use std::fmt;

/// How one test ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed { message: String },
    Skipped { reason: String },
}

impl TestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TestOutcome::Failed { .. })
    }
}

/// Outcome of a single test, labelled with its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub description: String,
    pub outcome: TestOutcome,
}

/// Aggregated outcomes of every test in one suite.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub description: String,
    pub tests: Vec<TestReport>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SuiteReport {
    pub fn new(description: impl Into<String>) -> Self {
        SuiteReport {
            description: description.into(),
            ..SuiteReport::default()
        }
    }

    pub fn push(&mut self, report: TestReport) {
        match report.outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed { .. } => self.failed += 1,
            TestOutcome::Skipped { .. } => self.skipped += 1,
        }
        self.tests.push(report);
    }

    pub fn total(&self) -> usize {
        self.tests.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {}/{} passed ({} failed, {} skipped)",
            self.description,
            self.passed,
            self.total(),
            self.failed,
            self.skipped
        )?;
        for t in &self.tests {
            if let TestOutcome::Failed { message } = &t.outcome {
                writeln!(f, "  FAIL [{}]: {}", t.description, message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_only_failures() {
        let mut report = SuiteReport::new("crud");
        report.push(TestReport {
            description: "insert".to_string(),
            outcome: TestOutcome::Passed,
        });
        report.push(TestReport {
            description: "update".to_string(),
            outcome: TestOutcome::Failed {
                message: "expected error, got success".to_string(),
            },
        });
        report.push(TestReport {
            description: "delete".to_string(),
            outcome: TestOutcome::Skipped {
                reason: "sharded only".to_string(),
            },
        });

        assert!(!report.is_success());
        assert_eq!(
            report.to_string(),
            "crud: 1/3 passed (1 failed, 1 skipped)\n  FAIL [update]: expected error, got success\n"
        );
    }
}
