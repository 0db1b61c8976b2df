//! Collaborator traits a listener session is written against

mod outlet;
mod process;

pub use outlet::{Outlet, Receipt, ReceiptState};
pub use process::{CommandSpec, OutputSink, ProcessHandle, ProcessOutput, ProcessSpawner};
