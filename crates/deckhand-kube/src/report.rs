//! Post-execution report of a deploy plan

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plan::{OperationId, Plan, PlanNode};

/// One operation in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub id: OperationId,
    /// Human-readable description naming the resource
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PlanNode> for ReportEntry {
    fn from(node: &PlanNode) -> Self {
        Self {
            id: node.id(),
            description: node.operation.describe(),
            error: node.error.clone(),
        }
    }
}

/// Completed, canceled and failed operations that touched resources
///
/// Stage markers and release bookkeeping are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub completed: Vec<ReportEntry>,
    pub canceled: Vec<ReportEntry>,
    pub failed: Vec<ReportEntry>,
}

impl ExecutionReport {
    pub fn from_plan(plan: &Plan) -> Self {
        let entries = |nodes: Vec<&PlanNode>| nodes.into_iter().map(ReportEntry::from).collect();
        Self {
            completed: entries(plan.worthy_completed()),
            canceled: entries(plan.worthy_canceled()),
            failed: entries(plan.worthy_failed()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.canceled.is_empty()
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Operation, OperationStatus, ResourceOp};
    use crate::resource::ResourceSpec;

    fn apply(name: &str) -> Operation {
        let yaml = format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n", name);
        Operation::ApplyResource(ResourceOp {
            resource: ResourceSpec::from_yaml(&yaml).unwrap(),
            fallback_namespace: "prod".to_string(),
            recreate_on_immutable: false,
        })
    }

    #[test]
    fn test_report_from_executed_plan() {
        let mut plan = Plan::new();
        let ok = plan.add_operation(apply("ok")).unwrap();
        let bad = plan.add_operation(apply("bad")).unwrap();
        let skipped = plan.add_operation(apply("skipped")).unwrap();

        plan.set_status(&ok, OperationStatus::Running).unwrap();
        plan.set_status(&ok, OperationStatus::Completed).unwrap();
        plan.set_status(&bad, OperationStatus::Running).unwrap();
        plan.set_failed(&bad, "boom".to_string()).unwrap();
        plan.set_status(&skipped, OperationStatus::Canceled).unwrap();

        let report = ExecutionReport::from_plan(&plan);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.failed[0].error.as_deref(), Some("boom"));
        assert_eq!(report.canceled[0].description, "apply ConfigMap/skipped");
        assert!(!report.is_success());

        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["completed"][0]["id"], "apply/:v1:ConfigMap::ok");
        assert!(value["completed"][0].get("error").is_none());
    }

    #[test]
    fn test_empty_plan_report_is_success() {
        let report = ExecutionReport::from_plan(&Plan::new());
        assert!(report.is_success());
        assert_eq!(
            report.to_json().unwrap(),
            "{\n  \"completed\": [],\n  \"canceled\": [],\n  \"failed\": []\n}"
        );
    }
}
