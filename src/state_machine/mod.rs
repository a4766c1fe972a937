mod batch;
mod issue;
mod job;
mod results;
mod work_unit_state;

pub use batch::{BatchState, PatientBatch};
pub use issue::{Issue, Severity};
pub use job::{Job, JobParameters, JobPriority, JobStatus};
pub use results::{BatchResult, BatchSelection, CoreInfo, CoreResult};
pub use work_unit_state::{WorkUnitState, WorkUnitStatus};
