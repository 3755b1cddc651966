pub mod batch;
pub mod decoder;
pub mod flow;
pub mod sink;
pub mod stats;
pub mod supervisor;

pub use batch::{AddOutcome, Batch, BatchAccumulator, BatchLimits};
pub use decoder::{decode, DecodeError, Record};
pub use flow::{Admission, Credit, FlowController};
pub use sink::{FlushReport, FlushState, RowOutcome, SinkError, SinkSettings, SinkWriter};
pub use stats::{PipelineStats, StatsSnapshot};
pub use supervisor::{PipelineSummary, Supervisor, SupervisorError};
