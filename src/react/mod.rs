//! 认知层：Planner、编排主循环与前端事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::ReactEvent;
pub use loop_::{Checkpoint, FinalResponse, ReactSession, Termination, DEFAULT_MAX_STEPS};
pub use planner::Planner;
