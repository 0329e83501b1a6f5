#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod execution;
mod freshness;
mod frozen;
mod graph;
mod node;
mod pool;
mod remover;
mod scheduler;
mod target;
mod task;
#[cfg(test)]
mod testing;

pub use crate::error::{
    FrozenError, GraphError, InvalidTokenError, OutputError, RunError, RunFault, TargetError,
    ThawError,
};
pub use crate::execution::{
    CompletionCallback, Execution, ExecutionState, NodeState, NodeStatus,
};
pub use crate::freshness::{Analysis, OutputStamp, analyze};
pub use crate::frozen::FrozenExecution;
pub use crate::graph::Graph;
pub use crate::node::{Blueprint, Node, NodeHandle, NodeKind};
pub use crate::pool::PoolScheduler;
pub use crate::remover::{OutputRemover, RemovalFilter, RemovalReason};
pub use crate::scheduler::{TaskFailure, TaskScheduler, TaskToken};
pub use crate::target::Target;
pub use crate::task::{Output, PathOutput, Task};
