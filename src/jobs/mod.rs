pub mod image;
pub mod job;
pub mod manager;
pub mod process;
pub mod state;
pub mod status;

pub use job::Job;
pub use manager::JobManager;
pub use process::{ProcessExit, ProcessHandle};
pub use state::{JobState, ProcessState};
pub use status::{JobStatus, ProcessStatus, StatusTable};
