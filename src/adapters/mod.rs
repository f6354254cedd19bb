pub mod process;

pub use process::{HttpProbe, ProcessRuntime, TcpProbe};
