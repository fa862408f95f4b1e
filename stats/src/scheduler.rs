use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    pub num_single_issue: u64,
    pub num_dual_issue: u64,
    /// No valid instruction in any instruction buffer (idle or control hazard).
    pub issue_raw_hazard_stall: u64,
    /// A valid instruction failed the scoreboard check.
    pub issue_control_hazard_stall: u64,
    /// A ready instruction could not be placed (pipeline stalled).
    pub issue_pipeline_stall: u64,
}

impl std::ops::AddAssign for Scheduler {
    fn add_assign(&mut self, other: Self) {
        self.num_single_issue += other.num_single_issue;
        self.num_dual_issue += other.num_dual_issue;
        self.issue_raw_hazard_stall += other.issue_raw_hazard_stall;
        self.issue_control_hazard_stall += other.issue_control_hazard_stall;
        self.issue_pipeline_stall += other.issue_pipeline_stall;
    }
}
